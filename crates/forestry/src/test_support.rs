//! 🧪 Shared fixtures for the wiremock-backed tests. Stunt doubles for a cluster.

use std::sync::Arc;

use bytes::Bytes;
use wiremock::{MockServer, Request, ResponseTemplate};

use crate::clients::{Connection, HostClient};
use crate::common::DocumentDescriptor;
use crate::handles::multipart::{self, MultipartBuilder, Part};
use crate::topology::{ForestInfo, Topology};

const TEST_BOUNDARY: &str = "test-boundary";

/// 🍞 Log to the test writer, filtered by `RUST_LOG`. Safe to call from every test.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// 📡 A client pointed at the mock server, no auth, database "Documents".
pub(crate) fn mock_client(server: &MockServer) -> Arc<HostClient> {
    let address = server.address();
    Arc::new(
        HostClient::new(
            Connection::new(address.ip().to_string(), address.port()).with_database("Documents"),
        )
        .expect("💀 the mock server's address did not make a client"),
    )
}

/// 🌳 A forest named `name` living on `host`.
pub(crate) fn forest(name: &str, host: &str) -> ForestInfo {
    ForestInfo {
        id: format!("{name}-id"),
        name: name.to_string(),
        updates_allowed: true,
        database: "Documents".to_string(),
        host: host.to_string(),
        ..ForestInfo::default()
    }
}

/// 🗺️ A topology whose forests all live on the mock server's host.
pub(crate) fn local_topology(server: &MockServer, forest_names: &[&str]) -> Arc<Topology> {
    let client = mock_client(server);
    let host = client.host().to_string();
    let forests = forest_names.iter().map(|name| forest(name, &host)).collect();
    Arc::new(Topology::from_forests(client, forests).expect("💀 the test topology fell over"))
}

/// 📄 A tiny JSON document.
pub(crate) fn json_doc(uri: &str) -> DocumentDescriptor {
    DocumentDescriptor::json(uri, format!(r#"{{"uri":"{uri}"}}"#))
        .expect("💀 a test document refused to exist")
}

/// ✂️ A 200 response whose body is a multipart/mixed message with the given parts.
pub(crate) fn multipart_response<S: AsRef<str>>(parts: &[S]) -> ResponseTemplate {
    let mut builder = MultipartBuilder::with_boundary(TEST_BOUNDARY);
    for part in parts {
        builder.part(&[("Content-Type", "text/plain")], part.as_ref().as_bytes());
    }
    let content_type = builder.content_type("mixed");
    ResponseTemplate::new(200).set_body_raw(builder.finish().to_vec(), &content_type)
}

/// ✂️ The multipart parts of a recorded request body.
pub(crate) fn request_parts(request: &Request) -> Vec<Part> {
    let boundary = request
        .headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .and_then(multipart::boundary_from_content_type);
    multipart::parse(&Bytes::from(request.body.clone()), boundary.as_deref())
        .expect("💀 a recorded request body was not multipart")
}

/// 🔍 A query parameter of a recorded request.
pub(crate) fn query_value(request: &Request, key: &str) -> Option<String> {
    request
        .url
        .query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}
