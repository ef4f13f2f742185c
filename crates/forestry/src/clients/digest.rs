//! 🔐 HTTP Digest authentication (RFC 2617, MD5 or MD5-sess, `qop=auth`).
//!
//! The server hands us a challenge on the first 401. We keep it, count nonces
//! upward, and sign every later request with it until the server says the nonce
//! went stale, at which point we take the new challenge and carry on.
//! Challenges asking for any other algorithm are not usable and get ignored.
//!
//! MD5 in this decade. The RFC made us do it. The duck does not approve. 🦆

use md5::{Digest, Md5};
use rand::Rng;

/// 📜 A parsed `WWW-Authenticate: Digest ...` challenge plus our nonce counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DigestChallenge {
    realm: String,
    nonce: String,
    opaque: Option<String>,
    qop: Option<String>,
    algorithm: Option<String>,
    nonce_count: u32,
}

impl DigestChallenge {
    /// 🔍 Parse a challenge header. Returns `None` for anything that is not a usable Digest challenge,
    /// including one that wants an algorithm other than MD5 or MD5-sess.
    pub(crate) fn parse(header: &str) -> Option<Self> {
        let (scheme, rest) = header.trim().split_once(char::is_whitespace)?;
        if !scheme.eq_ignore_ascii_case("digest") {
            return None;
        }

        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut qop = None;
        let mut algorithm = None;
        for (key, value) in split_params(rest) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "opaque" => opaque = Some(value),
                "qop" => qop = Some(value),
                "algorithm" => algorithm = Some(value),
                _ => {}
            }
        }

        // 🧪 we only speak qop=auth. auth-int would mean hashing bodies, and bodies are big.
        let qop = qop.and_then(|offered| {
            offered
                .split(',')
                .map(str::trim)
                .find(|q| q.eq_ignore_ascii_case("auth"))
                .map(str::to_string)
        });

        if let Some(algorithm) = &algorithm {
            if !algorithm.eq_ignore_ascii_case("md5") && !algorithm.eq_ignore_ascii_case("md5-sess") {
                return None;
            }
        }

        Some(Self {
            realm: realm?,
            nonce: nonce?,
            opaque,
            qop,
            algorithm,
            nonce_count: 0,
        })
    }

    /// 🔁 MD5-sess folds the nonce and cnonce into HA1.
    fn is_session(&self) -> bool {
        self.algorithm
            .as_deref()
            .is_some_and(|a| a.eq_ignore_ascii_case("md5-sess"))
    }

    /// ✍️ The `Authorization` header value for one request, with a fresh cnonce.
    pub(crate) fn authorize(&mut self, method: &str, uri: &str, username: &str, password: &str) -> String {
        let cnonce = format!("{:016x}", rand::rng().random::<u64>());
        self.authorize_with_cnonce(method, uri, username, password, &cnonce)
    }

    pub(crate) fn authorize_with_cnonce(
        &mut self,
        method: &str,
        uri: &str,
        username: &str,
        password: &str,
        cnonce: &str,
    ) -> String {
        self.nonce_count = self.nonce_count.wrapping_add(1);
        let nc = format!("{:08x}", self.nonce_count);

        let mut ha1 = md5_hex(&format!("{username}:{}:{password}", self.realm));
        if self.is_session() {
            ha1 = md5_hex(&format!("{ha1}:{}:{cnonce}", self.nonce));
        }
        let ha2 = md5_hex(&format!("{method}:{uri}"));
        let response = match &self.qop {
            Some(qop) => md5_hex(&format!("{ha1}:{}:{nc}:{cnonce}:{qop}:{ha2}", self.nonce)),
            None => md5_hex(&format!("{ha1}:{}:{ha2}", self.nonce)),
        };

        let mut header = format!(
            "Digest username=\"{username}\", realm=\"{}\", nonce=\"{}\", uri=\"{uri}\", response=\"{response}\"",
            self.realm, self.nonce
        );
        if let Some(qop) = &self.qop {
            header.push_str(&format!(", qop={qop}, nc={nc}, cnonce=\"{cnonce}\""));
        }
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(", opaque=\"{opaque}\""));
        }
        if let Some(algorithm) = &self.algorithm {
            header.push_str(&format!(", algorithm={algorithm}"));
        }
        header
    }
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", Md5::digest(input.as_bytes()))
}

/// ✂️ Split `k=v, k="v, with comma"` pairs, honoring quotes.
fn split_params(input: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in input.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            ',' if !quoted => {
                pairs.extend(split_pair(&current));
                current.clear();
            }
            _ => current.push(c),
        }
    }
    pairs.extend(split_pair(&current));
    pairs
}

fn split_pair(raw: &str) -> Option<(String, String)> {
    let (key, value) = raw.trim().split_once('=')?;
    Some((
        key.trim().to_string(),
        value.trim().trim_matches('"').to_string(),
    ))
}
