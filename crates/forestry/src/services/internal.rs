//! 🔧 `/internal/*` endpoints: forest discovery and per-forest URI paging.

use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::clients::HostClient;
use crate::common::{Format, Transaction};
use crate::error::Result;
use crate::handles::{Handle, ResponseHandle};
use crate::topology::ForestInfo;
use crate::transport::RestRequest;

/// 🌲 `GET /internal/forestinfo`: the database's forests.
pub async fn forest_info(
    client: &HostClient,
    cancel: Option<&CancellationToken>,
) -> Result<Vec<ForestInfo>> {
    let response = client
        .execute(
            RestRequest::get("/internal/forestinfo").accept(Format::Json),
            cancel,
        )
        .await?;
    ResponseHandle::from_response(Handle::json(), response)?
        .get()
        .decode()
}

/// 📜 One page request against one forest.
#[derive(Debug, Clone)]
pub struct UrisRequest<'a> {
    pub query: &'a Handle,
    pub forest_name: &'a str,
    /// 🔢 1-based start index. Only sent when non-zero.
    pub start: u64,
    /// ⏭️ Resume after this URI. Empty on the first page.
    pub after: &'a str,
    pub page_length: u16,
    pub transaction: Option<&'a Transaction>,
    /// 📸 Point-in-time to read at. `None` means "now, and tell me when now was".
    pub timestamp: Option<&'a str>,
}

/// 📃 What a page returned: the URIs and the server's snapshot timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct UrisPage {
    pub uris: Vec<String>,
    pub timestamp: Option<String>,
}

/// 📜 `POST /internal/uris`: one page of matching URIs in one forest.
pub async fn uris_in_forest(
    client: &HostClient,
    request: UrisRequest<'_>,
    cancel: Option<&CancellationToken>,
) -> Result<UrisPage> {
    let mut rest = RestRequest::post("/internal/uris")
        .accept(Format::UriList)
        .param("forest-name", request.forest_name)
        .param("pageLength", request.page_length.to_string());
    if !request.after.is_empty() {
        rest = rest.param("after", request.after);
    }
    if request.start != 0 {
        rest = rest.param("start", request.start.to_string());
    }
    if let Some(txn) = request.transaction {
        rest = rest.param("txid", txn.id());
    }
    if let Some(ts) = request.timestamp {
        rest = rest.param("timestamp", ts);
    }
    let rest = rest.body(request.query.content_type(), request.query.to_bytes()?);

    let response = client.execute(rest, cancel).await?;
    let handle = ResponseHandle::from_response(Handle::uri_list(), response)?;
    let timestamp = handle.timestamp().map(str::to_string);
    let uris = match handle.into_handle() {
        Handle::UriList(uris) => uris,
        _ => Vec::new(),
    };
    trace!(
        "📜 forest '{}' after '{}' gave {} uri(s)",
        request.forest_name,
        request.after,
        uris.len()
    );
    Ok(UrisPage { uris, timestamp })
}
