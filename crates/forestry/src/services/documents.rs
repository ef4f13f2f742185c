//! 📝 `POST /documents` as a multipart write set.
//!
//! One request carries a whole batch. The body is `multipart/mixed`:
//!
//! 1. optionally a default-metadata part (`inline; category=metadata`) that applies
//!    to every document after it,
//! 2. per document, an optional metadata part scoped to its URI, then the content
//!    part (`attachment; filename="<uri>"`).
//!
//! The server writes it all or none of it. We report whichever it was.

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::clients::HostClient;
use crate::common::{DocumentDescriptor, Format, Metadata, Transaction, Transform};
use crate::error::Result;
use crate::handles::multipart::MultipartBuilder;
use crate::handles::{Handle, ResponseHandle};
use crate::transport::RestRequest;

/// 🧾 Everything about a write set except the documents themselves.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub default_metadata: Option<Metadata>,
    pub transform: Option<Transform>,
    pub transaction: Option<Transaction>,
}

/// ✂️ The multipart body for a write set, plus its Content-Type.
pub fn write_set_body(
    documents: &[DocumentDescriptor],
    default_metadata: Option<&Metadata>,
) -> Result<(String, bytes::Bytes)> {
    let mut builder = MultipartBuilder::new();
    let json = Format::Json.mime_type();

    if let Some(metadata) = default_metadata.filter(|m| !m.is_empty()) {
        builder.part(
            &[
                ("Content-Type", json),
                ("Content-Disposition", "inline; category=metadata"),
            ],
            &metadata.to_json_bytes()?,
        );
    }

    for doc in documents {
        if let Some(metadata) = doc.metadata() {
            let disposition = format!("inline; category=metadata; filename=\"{}\"", doc.uri());
            builder.part(
                &[("Content-Type", json), ("Content-Disposition", disposition.as_str())],
                &metadata.to_json_bytes()?,
            );
        }
        let disposition = format!("attachment; filename=\"{}\"", doc.uri());
        builder.part(
            &[
                ("Content-Type", doc.format().mime_type()),
                ("Content-Disposition", disposition.as_str()),
            ],
            doc.content(),
        );
    }

    let content_type = builder.content_type("mixed");
    Ok((content_type, builder.finish()))
}

/// 🚀 Write a batch of documents in one request.
pub async fn write_set(
    client: &HostClient,
    documents: &[DocumentDescriptor],
    options: &WriteOptions,
    cancel: Option<&CancellationToken>,
) -> Result<ResponseHandle> {
    let (content_type, body) = write_set_body(documents, options.default_metadata.as_ref())?;

    let mut request = RestRequest::post("/documents")
        .accept(Format::Json)
        .body(content_type, body);
    if let Some(transform) = &options.transform {
        request = request.params(transform.query_pairs());
    }
    if let Some(txn) = &options.transaction {
        request = request.param("txid", txn.id());
    }

    debug!(
        "📝 writing {} document(s) to {}",
        documents.len(),
        client.host()
    );
    let response = client.execute(request, cancel).await?;
    ResponseHandle::from_response(Handle::raw(Format::Json, bytes::Bytes::new()), response)
}
