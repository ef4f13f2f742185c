//! 🧪 Data services: call server-side endpoints once, or in bulk until they run dry.

mod bulk;

use std::sync::Arc;

use bytes::Bytes;

pub use bulk::{BulkDataService, BulkJob, BulkSummary, DataServicesConfig};

use crate::clients::HostClient;
use crate::error::{Error, Result};
use crate::services::data_services::{self, EndpointCall};
use crate::topology::Topology;

/// 🧪 Entry point for data-service calls.
#[derive(Debug, Clone)]
pub struct DataServices {
    topology: Arc<Topology>,
}

impl DataServices {
    /// 🔭 Discover the forest map through `client`.
    pub async fn new(client: Arc<HostClient>) -> Result<Self> {
        Ok(Self::from_topology(Arc::new(Topology::discover(client).await?)))
    }

    pub fn from_topology(topology: Arc<Topology>) -> Self {
        Self { topology }
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// 🔁 A bulk runner for `endpoint`, e.g. `/ext/reprocess.sjs`.
    pub fn bulk_data_service(&self, endpoint: impl Into<String>) -> BulkDataService {
        BulkDataService::new(Arc::clone(&self.topology), endpoint)
    }

    /// 📞 One call to `endpoint` on the primary host with named text params.
    /// Returns the response parts in order. An empty answer is an empty vector.
    pub async fn call(&self, endpoint: &str, params: &[(String, String)]) -> Result<Vec<Bytes>> {
        if !endpoint.starts_with('/') {
            return Err(Error::Configuration(format!(
                "data-service endpoint {endpoint:?} must be a path starting with '/'"
            )));
        }
        let call = EndpointCall {
            params,
            ..EndpointCall::default()
        };
        data_services::invoke(self.topology.primary(), endpoint, &call, None).await
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer};

    use super::*;
    use crate::test_support::{local_topology, multipart_response, request_parts};

    #[tokio::test]
    async fn the_one_where_a_single_call_sends_its_params_as_form_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ext/hello.sjs"))
            .respond_with(multipart_response(&["hi", "there"]))
            .expect(1)
            .mount(&server)
            .await;

        let services = DataServices::from_topology(local_topology(&server, &["f1"]));
        let parts = services
            .call("/ext/hello.sjs", &[("greeting".to_string(), "howdy".to_string())])
            .await
            .expect("💀 the call went unanswered");
        assert_eq!(parts, vec![Bytes::from_static(b"hi"), Bytes::from_static(b"there")]);

        let requests = server.received_requests().await.expect("💀 recording is off");
        let sent = request_parts(&requests[0]);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].disposition_name(), Some("greeting"));
        assert_eq!(&sent[0].body[..], b"howdy");
    }

    #[tokio::test]
    async fn the_one_where_a_relative_endpoint_is_refused() {
        let server = MockServer::start().await;
        let services = DataServices::from_topology(local_topology(&server, &["f1"]));
        let refused = services.call("ext/hello.sjs", &[]).await;
        assert!(matches!(refused, Err(Error::Configuration(_))));
    }
}
