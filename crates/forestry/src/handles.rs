//! 🎁 Handles: typed wrappers around request and response bodies.
//!
//! A [`Handle`] is "some bytes, and an opinion about what they mean". Raw bytes,
//! a URI list, the parts of a multipart message, parsed JSON, a flat map, plain
//! text. The *kind* of handle decides how an incoming body is decoded, and how
//! an outgoing one is serialized.
//!
//! A [`ResponseHandle`] is a handle that has been handed an HTTP response. It
//! remembers the status and the snapshot timestamp header, then decodes the body
//! into its kind. Kind never changes after construction. Identity crises are
//! for people, not enums.

pub mod multipart;

use std::collections::BTreeMap;

use bytes::Bytes;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::trace;

use crate::common::Format;
use crate::error::{Error, Result};
use crate::transport::RestResponse;

/// 📐 Fixed boundary used when a multipart handle has to serialize itself.
const CANONICAL_BOUNDARY: &str = "forestry-handle-boundary";

/// 🎁 A body plus the shape we expect it to have.
#[derive(Debug, Clone, PartialEq)]
pub enum Handle {
    /// 🧱 Untouched bytes, labelled with a format.
    Raw { format: Format, bytes: Bytes },
    /// 📜 A CRLF-separated URI list, blank lines dropped.
    UriList(Vec<String>),
    /// ✂️ The parts of a multipart message, bodies only.
    Multipart(Vec<Bytes>),
    /// 🦆 Parsed JSON.
    Json(serde_json::Value),
    /// 🗺️ A JSON object flattened to string values.
    Map(BTreeMap<String, String>),
    /// 📝 UTF-8 text.
    Text(String),
}

impl Handle {
    pub fn raw(format: Format, bytes: impl Into<Bytes>) -> Self {
        Self::Raw {
            format,
            bytes: bytes.into(),
        }
    }

    pub fn uri_list() -> Self {
        Self::UriList(Vec::new())
    }

    pub fn multipart() -> Self {
        Self::Multipart(Vec::new())
    }

    pub fn json() -> Self {
        Self::Json(serde_json::Value::Null)
    }

    pub fn map() -> Self {
        Self::Map(BTreeMap::new())
    }

    pub fn text() -> Self {
        Self::Text(String::new())
    }

    /// 🦆 A JSON handle from anything serde can serialize.
    pub fn from_serializable<T: serde::Serialize>(value: &T) -> Result<Self> {
        serde_json::to_value(value)
            .map(Self::Json)
            .map_err(|e| Error::decode("json", e))
    }

    /// 🏷️ The format this handle reads and writes.
    pub fn format(&self) -> Format {
        match self {
            Self::Raw { format, .. } => *format,
            Self::UriList(_) => Format::UriList,
            Self::Multipart(_) => Format::Multipart,
            Self::Json(_) | Self::Map(_) => Format::Json,
            Self::Text(_) => Format::Text,
        }
    }

    /// 🏷️ Full Content-Type for this handle as a request body.
    pub fn content_type(&self) -> String {
        match self {
            Self::Multipart(_) => format!("multipart/mixed; boundary={CANONICAL_BOUNDARY}"),
            other => other.format().mime_type().to_string(),
        }
    }

    /// 🔄 Replace this handle's payload with `body`, decoded according to its kind.
    ///
    /// `content_type` is only consulted by multipart handles, for the boundary. Without
    /// it the boundary is sniffed from the body.
    pub fn deserialize(&mut self, body: Bytes, content_type: Option<&str>) -> Result<()> {
        match self {
            Self::Raw { bytes, .. } => *bytes = body,
            Self::UriList(uris) => *uris = parse_uri_list(&body)?,
            Self::Multipart(parts) => {
                let boundary = content_type.and_then(multipart::boundary_from_content_type);
                *parts = multipart::parse(&body, boundary.as_deref())?
                    .into_iter()
                    .map(|part| part.body)
                    .collect();
            }
            Self::Json(value) => {
                *value = if body.is_empty() {
                    serde_json::Value::Null
                } else {
                    serde_json::from_slice(&body).map_err(|e| Error::decode("json", e))?
                };
            }
            Self::Map(map) => *map = parse_flat_map(&body)?,
            Self::Text(text) => {
                *text = String::from_utf8(body.to_vec()).map_err(|e| Error::decode("text", e))?;
            }
        }
        Ok(())
    }

    /// 📦 The canonical wire form of this handle.
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(match self {
            Self::Raw { bytes, .. } => bytes.clone(),
            Self::UriList(uris) => Bytes::from(uris.join("\r\n")),
            Self::Multipart(parts) => {
                let mut builder = multipart::MultipartBuilder::with_boundary(CANONICAL_BOUNDARY);
                for part in parts {
                    builder.part(&[], part);
                }
                builder.finish()
            }
            Self::Json(value) => serde_json::to_vec(value)
                .map(Bytes::from)
                .map_err(|e| Error::decode("json", e))?,
            Self::Map(map) => serde_json::to_vec(map)
                .map(Bytes::from)
                .map_err(|e| Error::decode("json", e))?,
            Self::Text(text) => Bytes::from(text.clone()),
        })
    }

    /// 📝 The canonical string form. Binary content is rendered lossily.
    pub fn serialized(&self) -> Result<String> {
        match self {
            Self::Text(text) => Ok(text.clone()),
            other => Ok(String::from_utf8_lossy(&other.to_bytes()?).into_owned()),
        }
    }

    /// 🧬 Decode this handle's JSON (or raw JSON bytes) into a caller type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        match self {
            Self::Json(value) => {
                serde_json::from_value(value.clone()).map_err(|e| Error::decode("json", e))
            }
            Self::Raw { bytes, .. } => {
                serde_json::from_slice(bytes).map_err(|e| Error::decode("json", e))
            }
            Self::Map(map) => {
                let value = serde_json::to_value(map).map_err(|e| Error::decode("json", e))?;
                serde_json::from_value(value).map_err(|e| Error::decode("json", e))
            }
            Self::Text(text) => serde_json::from_str(text).map_err(|e| Error::decode("json", e)),
            other => Err(Error::decode(
                "json",
                format!("a {} handle has no JSON to decode", other.format()),
            )),
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Raw { bytes, .. } => Some(bytes),
            _ => None,
        }
    }

    pub fn as_uris(&self) -> Option<&[String]> {
        match self {
            Self::UriList(uris) => Some(uris),
            _ => None,
        }
    }

    pub fn as_parts(&self) -> Option<&[Bytes]> {
        match self {
            Self::Multipart(parts) => Some(parts),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// 📜 CRLF-separated URIs, blank lines dropped. A bare LF also ends a line.
pub fn parse_uri_list(body: &[u8]) -> Result<Vec<String>> {
    let mut uris = Vec::new();
    let mut start = 0;
    for end in memchr::memchr_iter(b'\n', body).chain(std::iter::once(body.len())) {
        let line = &body[start..end];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if !line.is_empty() {
            let uri = std::str::from_utf8(line).map_err(|e| Error::decode("uri-list", e))?;
            uris.push(uri.to_string());
        }
        start = end + 1;
    }
    Ok(uris)
}

fn parse_flat_map(body: &[u8]) -> Result<BTreeMap<String, String>> {
    if body.is_empty() {
        return Ok(BTreeMap::new());
    }
    let object: serde_json::Map<String, serde_json::Value> =
        serde_json::from_slice(body).map_err(|e| Error::decode("json", e))?;
    Ok(object
        .into_iter()
        .map(|(k, v)| match v {
            serde_json::Value::String(s) => (k, s),
            other => (k, other.to_string()),
        })
        .collect())
}

/// 📬 A handle that has received an HTTP response.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseHandle {
    handle: Handle,
    status: Option<StatusCode>,
    timestamp: Option<String>,
}

impl ResponseHandle {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            status: None,
            timestamp: None,
        }
    }

    /// 📥 Take the response: remember status and timestamp, then decode the body.
    pub fn accept_response(&mut self, response: RestResponse) -> Result<()> {
        trace!(
            "📥 handle accepting {} bytes from {} ({})",
            response.body.len(),
            response.url,
            response.status
        );
        self.status = Some(response.status);
        self.timestamp = response.timestamp;
        self.handle
            .deserialize(response.body, response.content_type.as_deref())
    }

    /// 🎁 Build and fill a response handle in one go.
    pub(crate) fn from_response(handle: Handle, response: RestResponse) -> Result<Self> {
        let mut this = Self::new(handle);
        this.accept_response(response)?;
        Ok(this)
    }

    pub fn get(&self) -> &Handle {
        &self.handle
    }

    pub fn into_handle(self) -> Handle {
        self.handle
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// 📸 The `ML-Effective-Timestamp` the server reported, if it reported one.
    pub fn timestamp(&self) -> Option<&str> {
        self.timestamp.as_deref()
    }

    pub fn format(&self) -> Format {
        self.handle.format()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_a_uri_list_sheds_its_blank_lines() {
        let uris = parse_uri_list(b"/a.json\r\n/b.json\r\n\r\n/c.json\r\n")
            .expect("💀 three URIs should not be this hard");
        assert_eq!(uris, vec!["/a.json", "/b.json", "/c.json"]);

        assert!(parse_uri_list(b"").expect("💀 empty is empty").is_empty());
        assert!(parse_uri_list(b"\r\n\r\n").expect("💀 blank is empty").is_empty());
    }

    #[test]
    fn the_one_where_a_multipart_handle_keeps_only_the_bodies() {
        let mut handle = Handle::multipart();
        handle
            .deserialize(
                Bytes::from_static(
                    b"--abc\r\nContent-Type: application/json\r\n\r\n{\"a\":1}\r\n--abc\r\nContent-Type: text/plain\r\n\r\nhello\r\n--abc--\r\n",
                ),
                Some("multipart/mixed; boundary=abc"),
            )
            .expect("💀 the multipart handle choked");

        assert_eq!(
            handle.as_parts(),
            Some(&[Bytes::from_static(b"{\"a\":1}"), Bytes::from_static(b"hello")][..])
        );
        assert_eq!(handle.format(), Format::Multipart);
    }

    #[test]
    fn the_one_where_a_map_stringifies_whatever_it_finds() {
        let mut handle = Handle::map();
        handle
            .deserialize(Bytes::from_static(br#"{"name":"oak","rings":42}"#), None)
            .expect("💀 the map got lost");
        let map = handle.as_map().expect("💀 kind changed behind our back");
        assert_eq!(map["name"], "oak");
        assert_eq!(map["rings"], "42");
    }

    #[test]
    fn the_one_where_bad_json_is_a_deserialization_error() {
        let mut handle = Handle::json();
        let err = handle
            .deserialize(Bytes::from_static(b"{not json"), None)
            .expect_err("💀 garbage was accepted as JSON");
        assert!(matches!(err, Error::Deserialization { format: "json", .. }));
    }

    #[test]
    fn the_one_where_json_decodes_into_a_caller_type() {
        #[derive(serde::Deserialize)]
        struct Tree {
            species: String,
        }
        let handle = Handle::raw(Format::Json, Bytes::from_static(br#"{"species":"birch"}"#));
        let tree: Tree = handle.decode().expect("💀 the birch did not decode");
        assert_eq!(tree.species, "birch");
        assert!(Handle::uri_list().decode::<Tree>().is_err());
    }

    #[test]
    fn the_one_where_serialized_forms_are_canonical() {
        let uris = Handle::UriList(vec!["/a".into(), "/b".into()]);
        assert_eq!(uris.serialized().expect("💀 uri list"), "/a\r\n/b");

        let parts = Handle::Multipart(vec![Bytes::from_static(b"one")]);
        let serialized = parts.serialized().expect("💀 multipart");
        assert!(serialized.starts_with("--forestry-handle-boundary\r\n"));
        assert!(serialized.ends_with("--forestry-handle-boundary--\r\n"));
    }
}
