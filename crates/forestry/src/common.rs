//! 📦 Common data structures: the things that ride inside batches.
//!
//! 🎬 COLD OPEN. INT. FOREST. NIGHT.
//!
//! A thousand documents stand at the edge of the tree line. Each one knows its
//! URI. Some know their collections. A few have permissions, which is more than
//! most of us can say about our production credentials. None of them know which
//! host they are about to be shipped to. That is the batcher's problem now.
//!
//! This module holds the payload model every other module trades in:
//! [`Format`], [`DocumentDescriptor`], [`Metadata`], [`Transform`] and
//! [`Transaction`]. 🦆

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// 🏷️ The content formats the server and the handles understand.
///
/// The first four are document formats. The last two only ever describe
/// response bodies (a CRLF URI list and a multipart message).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Xml,
    #[default]
    Json,
    Text,
    Binary,
    UriList,
    Multipart,
}

impl Format {
    /// 📡 The MIME type the server expects for this format.
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Xml => "application/xml",
            Self::Json => "application/json",
            Self::Text => "text/plain",
            Self::Binary => "application/octet-stream",
            Self::UriList => "text/uri-list",
            Self::Multipart => "multipart/mixed",
        }
    }

    /// 🔤 Short lowercase name, used in error messages and logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::Xml => "xml",
            Self::Json => "json",
            Self::Text => "text",
            Self::Binary => "binary",
            Self::UriList => "uri-list",
            Self::Multipart => "multipart",
        }
    }

    /// ✅ Whether a document stored in the database can have this format.
    pub fn is_document_format(self) -> bool {
        matches!(self, Self::Xml | Self::Json | Self::Text | Self::Binary)
    }

    /// 🔍 Best-effort guess from a Content-Type header. Parameters are ignored,
    /// and anything `mime` refuses to parse is treated as binary.
    pub fn from_content_type(content_type: &str) -> Self {
        let Ok(parsed) = content_type.trim().parse::<mime::Mime>() else {
            return Self::Binary;
        };
        match (parsed.type_().as_str(), parsed.subtype().as_str()) {
            ("application", "json") => Self::Json,
            ("text", "uri-list") => Self::UriList,
            ("text", "plain") => Self::Text,
            ("application" | "text", "xml") => Self::Xml,
            ("multipart", _) => Self::Multipart,
            _ => match parsed.suffix().map(|suffix| suffix.as_str()) {
                Some("json") => Self::Json,
                Some("xml") => Self::Xml,
                _ => Self::Binary,
            },
        }
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// 🔐 What a role may do with a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    Read,
    Update,
    Insert,
    Execute,
    NodeUpdate,
}

/// 🔐 One role and the capabilities it gets. Serialized the way the REST API spells it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    #[serde(rename = "role-name")]
    pub role_name: String,
    pub capabilities: BTreeSet<Capability>,
}

/// 🗂️ Document metadata: collections, permissions, properties, metadata values and quality.
///
/// Every field is optional on the wire. An all-default `Metadata` serializes to `{}`,
/// which the server reads as "nothing to say", which is also my stance on most meetings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub collections: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<Permission>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata_values: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<i32>,
}

impl Metadata {
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collections.insert(collection.into());
        self
    }

    pub fn with_permission(
        mut self,
        role_name: impl Into<String>,
        capabilities: impl IntoIterator<Item = Capability>,
    ) -> Self {
        self.permissions.push(Permission {
            role_name: role_name.into(),
            capabilities: capabilities.into_iter().collect(),
        });
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn with_metadata_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata_values.insert(key.into(), value.into());
        self
    }

    pub fn with_quality(mut self, quality: i32) -> Self {
        self.quality = Some(quality);
        self
    }

    /// 🫥 True when serializing would say nothing at all.
    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
            && self.permissions.is_empty()
            && self.properties.is_empty()
            && self.metadata_values.is_empty()
            && self.quality.is_none()
    }

    /// 📦 The JSON body of a metadata part.
    pub(crate) fn to_json_bytes(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| Error::decode("json", e))
    }
}

/// 📄 A document waiting to be written: where it goes, what it is, and what it carries.
///
/// The content is a [`Bytes`], so cloning a descriptor (or a whole batch of them for a
/// listener) never copies the payload. Cheap clones. Expensive documents. Balance.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentDescriptor {
    uri: String,
    format: Format,
    content: Bytes,
    metadata: Option<Metadata>,
}

impl DocumentDescriptor {
    /// 🏗️ A new descriptor. The URI must be non-empty and the format a document format.
    pub fn new(uri: impl Into<String>, format: Format, content: impl Into<Bytes>) -> Result<Self> {
        let uri = uri.into();
        if uri.is_empty() {
            return Err(Error::Configuration(
                "a document needs a URI. Even anonymous documents have a return address.".into(),
            ));
        }
        if !format.is_document_format() {
            return Err(Error::Configuration(format!(
                "'{format}' describes a response body, not a document. Use xml, json, text or binary."
            )));
        }
        Ok(Self {
            uri,
            format,
            content: content.into(),
            metadata: None,
        })
    }

    /// 🦆 Shorthand for a JSON document.
    pub fn json(uri: impl Into<String>, content: impl Into<Bytes>) -> Result<Self> {
        Self::new(uri, Format::Json, content)
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }
}

/// 🔄 A named server-side transform plus its parameters.
///
/// On the wire it becomes `transform=<name>` and one `trans:<key>=<value>` per parameter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transform {
    pub name: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl Transform {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// 📡 The query pairs this transform contributes to a request.
    pub(crate) fn query_pairs(&self) -> Vec<(String, String)> {
        std::iter::once(("transform".to_string(), self.name.clone()))
            .chain(
                self.params
                    .iter()
                    .map(|(k, v)| (format!("trans:{k}"), v.clone())),
            )
            .collect()
    }
}

/// 🧾 A server-side multi-statement transaction, identified by the id the server handed out.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Transaction {
    id: String,
    name: Option<String>,
}

impl Transaction {
    /// 🪪 Wrap an id obtained elsewhere (another process, a previous run, a sticky note).
    pub fn from_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }

    pub(crate) fn named(id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}
