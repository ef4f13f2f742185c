//! 📡 Clients: one [`HostClient`] per server host.
//!
//! A `HostClient` is a `reqwest::Client` glued to one host's base URL, plus the
//! credentials and digest state for that host. Connection pooling is reqwest's
//! job. Auth is ours. The topology builds one of these per host and shares them
//! by `Arc` with every worker pinned to that host.
//!
//! 🦆 The duck asked why not one client for everything. The duck has never
//! tried to keep a digest nonce count in sync across five hosts.

mod digest;

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

pub(crate) use digest::DigestChallenge;

/// 🔐 How we prove who we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    /// 🚪 No credentials at all.
    None,
    /// 🔒 `Authorization: Basic`, on every request.
    Basic,
    /// 🔐 RFC 2617 digest, challenge learned from the first 401.
    #[default]
    Digest,
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_rest_base_path() -> String {
    "/LATEST".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    300
}

/// 🔌 Everything needed to talk to one host. Also the `[connection]` config table.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub auth: AuthKind,
    /// 🗄️ Target database. `None` means the app server's default database.
    #[serde(default)]
    pub database: Option<String>,
    /// 🛣️ Prefix of every REST path. Data-service endpoints live outside it.
    #[serde(default = "default_rest_base_path")]
    pub rest_base_path: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

// 🙈 hand-rolled so the password never lands in a log line
impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("scheme", &self.scheme)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("auth", &self.auth)
            .field("database", &self.database)
            .field("rest_base_path", &self.rest_base_path)
            .finish()
    }
}

impl Connection {
    /// 🏗️ A connection with no credentials and all the defaults.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            scheme: default_scheme(),
            username: String::new(),
            password: String::new(),
            auth: AuthKind::None,
            database: None,
            rest_base_path: default_rest_base_path(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        auth: AuthKind,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self.auth = auth;
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    pub fn with_rest_base_path(mut self, path: impl Into<String>) -> Self {
        self.rest_base_path = path.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// 🔁 Same credentials, different host. How the topology fans out.
    pub fn for_host(&self, host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..self.clone()
        }
    }
}

/// 📡 An HTTP client bound to one host.
pub struct HostClient {
    pub(crate) connection: Connection,
    pub(crate) base_url: Url,
    pub(crate) http: reqwest::Client,
    pub(crate) digest: Mutex<Option<DigestChallenge>>,
}

impl std::fmt::Debug for HostClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostClient")
            .field("base_url", &self.base_url.as_str())
            .field("connection", &self.connection)
            .finish()
    }
}

impl HostClient {
    /// 🚀 Build a client for the connection's host.
    ///
    /// Timeouts come from the connection (10s to connect, 300s per request by default).
    /// Bulk writes are meaty and we are not monsters.
    pub fn new(connection: Connection) -> Result<Self> {
        if connection.host.trim().is_empty() {
            return Err(Error::Configuration(
                "a connection needs a host. 'somewhere' is not a hostname.".into(),
            ));
        }
        let base_url = Url::parse(&format!(
            "{}://{}:{}",
            connection.scheme, connection.host, connection.port
        ))
        .map_err(|e| {
            Error::Configuration(format!(
                "could not make a URL out of {}://{}:{}: {e}",
                connection.scheme, connection.host, connection.port
            ))
        })?;

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(connection.connect_timeout_secs))
            .timeout(Duration::from_secs(connection.request_timeout_secs))
            // 🧾 a 303 from /transactions carries the id in Location, following it loses the id
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|source| Error::Transport {
                url: base_url.to_string(),
                source,
            })?;

        debug!("📡 client ready for {}", base_url);
        Ok(Self {
            connection,
            base_url,
            http,
            digest: Mutex::new(None),
        })
    }

    /// 🔁 A sibling client for another host, same credentials and settings.
    pub fn for_host(&self, host: &str) -> Result<Self> {
        Self::new(self.connection.for_host(host))
    }

    pub fn host(&self) -> &str {
        &self.connection.host
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn database(&self) -> Option<&str> {
        self.connection.database.as_deref()
    }

    /// 🛣️ `scheme://host:port`, no path.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// ✍️ Digest header for this request, if we already hold a challenge.
    pub(crate) fn digest_authorization(&self, method: &str, uri: &str) -> Option<String> {
        let mut guard = self.digest.lock().unwrap_or_else(PoisonError::into_inner);
        guard.as_mut().map(|challenge| {
            challenge.authorize(
                method,
                uri,
                &self.connection.username,
                &self.connection.password,
            )
        })
    }

    /// 📜 Remember a fresh challenge. Returns false when the header was not a usable challenge.
    pub(crate) fn learn_challenge(&self, header: &str) -> bool {
        match DigestChallenge::parse(header) {
            Some(challenge) => {
                *self.digest.lock().unwrap_or_else(PoisonError::into_inner) = Some(challenge);
                true
            }
            None => false,
        }
    }
}
