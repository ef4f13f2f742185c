//! 🧪 Data-service endpoints: server-side modules called over `multipart/form-data`.
//!
//! The endpoint path is resolved against the server root, not the REST base path.
//! The request carries up to three kinds of fields: `endpointState`, `workUnit`,
//! and any number of `input` parts. The response is `multipart/mixed`, one part
//! per value the endpoint returned. An empty response means "nothing to say".

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::clients::HostClient;
use crate::common::Format;
use crate::error::Result;
use crate::handles::multipart::{self, MultipartBuilder};
use crate::handles::Handle;
use crate::transport::{RestRequest, RestResponse};

/// 📝 The fields of one data-service call.
#[derive(Debug, Clone, Default)]
pub struct EndpointCall<'a> {
    pub endpoint_state: Option<&'a Bytes>,
    pub work_unit: Option<&'a Bytes>,
    pub inputs: &'a [Handle],
    /// 🏷️ Extra named text fields, for plain calls with parameters.
    pub params: &'a [(String, String)],
}

/// ✂️ The form body for a call, plus its Content-Type.
pub fn endpoint_call_body(call: &EndpointCall<'_>) -> Result<(String, Bytes)> {
    let mut builder = MultipartBuilder::new();
    let json = Format::Json.mime_type();
    if let Some(state) = call.endpoint_state {
        builder.form_field("endpointState", json, state);
    }
    if let Some(work_unit) = call.work_unit {
        builder.form_field("workUnit", json, work_unit);
    }
    for input in call.inputs {
        builder.form_field("input", &input.content_type(), &input.to_bytes()?);
    }
    for (name, value) in call.params {
        builder.form_field(name, Format::Text.mime_type(), value.as_bytes());
    }
    let content_type = builder.content_type("form-data");
    Ok((content_type, builder.finish()))
}

/// 🚀 Call an endpoint and return the bodies of its response parts, in order.
pub async fn invoke(
    client: &HostClient,
    endpoint: &str,
    call: &EndpointCall<'_>,
    cancel: Option<&CancellationToken>,
) -> Result<Vec<Bytes>> {
    let (content_type, body) = endpoint_call_body(call)?;
    let request = RestRequest::post(endpoint)
        .outside_rest_base()
        .without_database()
        .accept(Format::Multipart)
        .body(content_type, body);
    let response = client.execute(request, cancel).await?;
    trace!(
        "🧪 {} answered {} with {} byte(s)",
        endpoint,
        response.status,
        response.body.len()
    );
    response_parts(response)
}

/// ✂️ A multipart response becomes its parts, a single body becomes one part, nothing becomes nothing.
fn response_parts(response: RestResponse) -> Result<Vec<Bytes>> {
    if response.body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    match response.content_type.as_deref() {
        Some(ct) if Format::from_content_type(ct) == Format::Multipart => {
            let boundary = multipart::boundary_from_content_type(ct);
            Ok(multipart::parse(&response.body, boundary.as_deref())?
                .into_iter()
                .map(|part| part.body)
                .collect())
        }
        _ => Ok(vec![response.body]),
    }
}
