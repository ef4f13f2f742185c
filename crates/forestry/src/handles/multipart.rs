//! ✂️ Multipart: composing and slicing `multipart/*` bodies.
//!
//! Write sets go out as `multipart/mixed`, data-service calls go out as
//! `multipart/form-data`, and most interesting responses come back as
//! `multipart/mixed`. Same framing every time: `--boundary CRLF`, headers,
//! blank line, content, `CRLF --boundary`, and a final `--boundary--`.
//!
//! Parsing slices the incoming [`Bytes`], so parts are zero-copy views of the body.
//! memchr's `memmem` does the boundary hunting. It is very fast at finding
//! dashes. It does not know what dashes are. Neither do I, really.

use bytes::{BufMut, Bytes, BytesMut};
use memchr::memmem;
use rand::Rng;

use crate::error::{Error, Result};

const CRLF: &[u8] = b"\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";

/// 🧩 One part of a multipart body: its headers and its content.
#[derive(Debug, Clone, PartialEq)]
pub struct Part {
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Part {
    /// 🔍 Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// 🏷️ The `name="..."` parameter of Content-Disposition, for form-data parts.
    pub fn disposition_name(&self) -> Option<&str> {
        self.header("content-disposition")
            .and_then(|d| disposition_param(d, "name"))
    }

    /// 🏷️ The `filename="..."` parameter of Content-Disposition.
    pub fn filename(&self) -> Option<&str> {
        self.header("content-disposition")
            .and_then(|d| disposition_param(d, "filename"))
    }
}

// Content-Disposition is not a media type, so `mime` cannot help here.
fn disposition_param<'a>(disposition: &'a str, param: &str) -> Option<&'a str> {
    disposition.split(';').skip(1).find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case(param)
            .then(|| value.trim().trim_matches('"'))
    })
}

/// 🏗️ Accumulates parts into one multipart body.
#[derive(Debug)]
pub struct MultipartBuilder {
    boundary: String,
    body: BytesMut,
    parts: usize,
}

impl Default for MultipartBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartBuilder {
    /// 🎲 A builder with a fresh random boundary.
    pub fn new() -> Self {
        let mut rng = rand::rng();
        let boundary = format!("forestry-{:016x}{:016x}", rng.random::<u64>(), rng.random::<u64>());
        Self::with_boundary(boundary)
    }

    /// 📐 A builder with a caller-chosen boundary. Handy for deterministic output.
    pub fn with_boundary(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
            body: BytesMut::new(),
            parts: 0,
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// ➕ Append one part with the given headers and content.
    pub fn part(&mut self, headers: &[(&str, &str)], content: &[u8]) -> &mut Self {
        self.body.reserve(self.boundary.len() + content.len() + 64);
        self.body.put_slice(b"--");
        self.body.put_slice(self.boundary.as_bytes());
        self.body.put_slice(CRLF);
        for (name, value) in headers {
            self.body.put_slice(name.as_bytes());
            self.body.put_slice(b": ");
            self.body.put_slice(value.as_bytes());
            self.body.put_slice(CRLF);
        }
        self.body.put_slice(CRLF);
        self.body.put_slice(content);
        self.body.put_slice(CRLF);
        self.parts += 1;
        self
    }

    /// 📝 A `multipart/form-data` field with an empty filename, the shape data-service endpoints want.
    pub fn form_field(&mut self, name: &str, content_type: &str, content: &[u8]) -> &mut Self {
        let disposition = format!("form-data; name=\"{name}\"; filename=\"\"");
        self.part(
            &[
                ("Content-Disposition", disposition.as_str()),
                ("Content-Type", content_type),
            ],
            content,
        )
    }

    pub fn len(&self) -> usize {
        self.parts
    }

    pub fn is_empty(&self) -> bool {
        self.parts == 0
    }

    /// 🏷️ The Content-Type header value for this body, e.g. `multipart/mixed; boundary=...`.
    pub fn content_type(&self, subtype: &str) -> String {
        format!("multipart/{subtype}; boundary={}", self.boundary)
    }

    /// 🏁 Close the body with the final delimiter.
    pub fn finish(mut self) -> Bytes {
        self.body.put_slice(b"--");
        self.body.put_slice(self.boundary.as_bytes());
        self.body.put_slice(b"--");
        self.body.put_slice(CRLF);
        self.body.freeze()
    }
}

/// 🔍 Pull `boundary=` out of a multipart Content-Type value. Quoted boundaries come back unquoted.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    let parsed = content_type.trim().parse::<mime::Mime>().ok()?;
    parsed
        .get_param(mime::BOUNDARY)
        .map(|boundary| boundary.as_str().to_string())
}

/// 👃 Guess the boundary from the first delimiter line when no header says it.
fn sniff_boundary(body: &[u8]) -> Option<String> {
    let start = memmem::find(body, b"--")?;
    let rest = &body[start + 2..];
    let end = memmem::find(rest, CRLF).unwrap_or(rest.len());
    let candidate = std::str::from_utf8(&rest[..end]).ok()?.trim_end();
    (!candidate.is_empty()).then(|| candidate.to_string())
}

/// ✂️ Split a multipart body into its parts.
///
/// With `boundary` as `None` the boundary is sniffed from the first delimiter line.
/// An empty body yields no parts. A preamble before the first delimiter and an
/// epilogue after the last one are ignored.
pub fn parse(body: &Bytes, boundary: Option<&str>) -> Result<Vec<Part>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let boundary = match boundary {
        Some(b) => b.to_string(),
        None => sniff_boundary(body)
            .ok_or_else(|| Error::decode("multipart", "no boundary delimiter found"))?,
    };

    let delimiter = format!("--{boundary}");
    let next_delimiter = format!("\r\n--{boundary}");
    let first = memmem::find(body, delimiter.as_bytes())
        .ok_or_else(|| Error::decode("multipart", format!("boundary '{boundary}' never appears")))?;
    let finder = memmem::Finder::new(next_delimiter.as_bytes());

    let mut parts = Vec::new();
    let mut cursor = first + delimiter.len();
    loop {
        // 🏁 "--" right after the delimiter closes the body
        if body[cursor..].starts_with(b"--") {
            return Ok(parts);
        }
        // skip transport padding up to the end of the delimiter line
        let line_end = memmem::find(&body[cursor..], CRLF)
            .ok_or_else(|| Error::decode("multipart", "delimiter line never ends"))?;
        let part_start = cursor + line_end + CRLF.len();

        let (headers, content_start) = if body[part_start..].starts_with(CRLF) {
            (Vec::new(), part_start + CRLF.len())
        } else {
            let header_len = memmem::find(&body[part_start..], HEADER_END)
                .ok_or_else(|| Error::decode("multipart", "part headers never end"))?;
            let raw = std::str::from_utf8(&body[part_start..part_start + header_len])
                .map_err(|e| Error::decode("multipart", e))?;
            (parse_headers(raw), part_start + header_len + HEADER_END.len())
        };

        let content_len = finder
            .find(&body[content_start..])
            .ok_or_else(|| Error::decode("multipart", "part has no closing delimiter"))?;
        parts.push(Part {
            headers,
            body: body.slice(content_start..content_start + content_len),
        });
        cursor = content_start + content_len + next_delimiter.len();
    }
}

fn parse_headers(raw: &str) -> Vec<(String, String)> {
    raw.split("\r\n")
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_two_parts_walk_out_of_a_body() {
        let body = Bytes::from_static(
            b"--abc\r\nContent-Type: application/json\r\n\r\n{\"a\":1}\r\n--abc\r\nContent-Type: text/plain\r\n\r\nhello\r\n--abc--\r\n",
        );
        let parts = parse(&body, Some("abc")).expect("💀 a perfectly nice body failed to parse");

        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].body, Bytes::from_static(b"{\"a\":1}"));
        assert_eq!(parts[0].header("content-type"), Some("application/json"));
        assert_eq!(parts[1].body, Bytes::from_static(b"hello"));
    }

    #[test]
    fn the_one_where_the_boundary_is_sniffed_and_the_preamble_ignored() {
        let body = Bytes::from_static(
            b"this is a preamble nobody reads\r\n--xyz\r\n\r\nno headers here\r\n--xyz--\r\nepilogue",
        );
        let parts = parse(&body, None).expect("💀 the sniffer lost the scent");
        assert_eq!(parts.len(), 1);
        assert!(parts[0].headers.is_empty());
        assert_eq!(parts[0].body, Bytes::from_static(b"no headers here"));
    }

    #[test]
    fn the_one_where_the_builder_output_parses_back_with_its_dispositions() {
        let mut builder = MultipartBuilder::new();
        builder
            .form_field("endpointState", "application/json", br#"{"next":5}"#)
            .form_field("input", "text/plain", b"line one\r\nline two");
        let content_type = builder.content_type("form-data");
        let body = builder.finish();

        let boundary = boundary_from_content_type(&content_type)
            .expect("💀 we wrote the boundary ourselves and still lost it");
        let parts = parse(&body, Some(&boundary)).expect("💀 our own output betrayed us");

        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].disposition_name(), Some("endpointState"));
        assert_eq!(parts[0].filename(), Some(""));
        assert_eq!(parts[1].body, Bytes::from_static(b"line one\r\nline two"));
    }

    #[test]
    fn the_one_where_a_quoted_boundary_loses_its_quotes() {
        assert_eq!(
            boundary_from_content_type("multipart/mixed; boundary=\"q-b\"; charset=utf-8"),
            Some("q-b".to_string())
        );
        assert_eq!(boundary_from_content_type("application/json"), None);
    }

    #[test]
    fn the_one_where_a_semicolon_hides_inside_the_quoted_boundary() {
        let boundary = boundary_from_content_type("multipart/mixed; boundary=\"a;b=c\"")
            .expect("💀 the quoted boundary got cut at the semicolon");
        assert_eq!(boundary, "a;b=c");

        // 🔠 mime lowercases the media type but leaves the boundary alone
        assert_eq!(
            boundary_from_content_type("Multipart/Mixed; BOUNDARY=MiXeD").as_deref(),
            Some("MiXeD")
        );

        let mut builder = MultipartBuilder::with_boundary("a;b=c");
        builder.part(&[("Content-Type", "text/plain")], b"still one part");
        let parts = parse(&builder.finish(), Some(&boundary)).expect("💀 quoted boundary did not split");
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].body, Bytes::from_static(b"still one part"));
    }

    #[test]
    fn the_one_where_an_empty_body_has_no_parts_and_a_truncated_one_errors() {
        assert!(parse(&Bytes::new(), None).expect("💀 empty is fine").is_empty());

        let truncated = Bytes::from_static(b"--abc\r\nContent-Type: text/plain\r\n\r\nhalf a th");
        assert!(matches!(
            parse(&truncated, Some("abc")),
            Err(Error::Deserialization { .. })
        ));
    }
}
