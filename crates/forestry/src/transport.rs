//! 🚚 Transport: one REST request in, one REST response (or one error) out.
//!
//! Every call the data-movement core makes funnels through [`HostClient::execute`]:
//! build the URL under the REST base path, attach auth, send, learn a digest
//! challenge on the first 401 and retry once, then turn anything that is not
//! 2xx or 3xx into [`Error::Server`] with the body attached.
//!
//! Every request also races a [`CancellationToken`] when one is given. The
//! token wins ties. A cancelled job does not wait for a 300 second timeout to
//! find out it was cancelled.

use bytes::Bytes;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, WWW_AUTHENTICATE};
use reqwest::{Method, StatusCode, Url};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::clients::{AuthKind, HostClient};
use crate::common::Format;
use crate::error::{Error, Result};

/// 📸 Header carrying the server's snapshot timestamp.
pub const EFFECTIVE_TIMESTAMP_HEADER: &str = "ml-effective-timestamp";

/// 📦 A request body and its Content-Type.
#[derive(Debug, Clone, PartialEq)]
pub struct RestBody {
    pub content_type: String,
    pub bytes: Bytes,
}

/// ✉️ One REST call, described but not yet sent. Cheap to clone, so it can be retried.
#[derive(Debug, Clone)]
pub struct RestRequest {
    method: Method,
    path: String,
    under_rest_base: bool,
    with_database: bool,
    params: Vec<(String, String)>,
    body: Option<RestBody>,
    accept: Option<String>,
}

impl RestRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            under_rest_base: true,
            with_database: true,
            params: Vec::new(),
            body: None,
            accept: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn params(mut self, pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        self.params.extend(pairs);
        self
    }

    pub fn body(mut self, content_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        self.body = Some(RestBody {
            content_type: content_type.into(),
            bytes: bytes.into(),
        });
        self
    }

    pub fn accept(mut self, format: Format) -> Self {
        self.accept = Some(format.mime_type().to_string());
        self
    }

    /// 🛣️ Resolve the path against the server root instead of the REST base path.
    pub fn outside_rest_base(mut self) -> Self {
        self.under_rest_base = false;
        self
    }

    /// 🗄️ Do not add the connection's `database` parameter.
    pub fn without_database(mut self) -> Self {
        self.with_database = false;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }
}

/// 📬 What came back from a successful call, fully buffered.
#[derive(Debug, Clone)]
pub struct RestResponse {
    pub status: StatusCode,
    pub url: String,
    pub content_type: Option<String>,
    /// 📸 `ML-Effective-Timestamp`, when the server sent one.
    pub timestamp: Option<String>,
    pub location: Option<String>,
    pub body: Bytes,
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// 🔐 The request-target a digest signature covers: path plus query.
fn digest_uri(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_string(),
    }
}

impl HostClient {
    /// 🚀 Send a request and buffer the response.
    ///
    /// With a token, cancellation aborts the in-flight call and yields [`Error::Cancelled`].
    pub async fn execute(
        &self,
        request: RestRequest,
        cancel: Option<&CancellationToken>,
    ) -> Result<RestResponse> {
        match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Err(Error::Cancelled),
                outcome = self.execute_with_auth(&request) => outcome,
            },
            None => self.execute_with_auth(&request).await,
        }
    }

    /// 🛣️ The full URL a request will hit.
    pub(crate) fn url_for(&self, request: &RestRequest) -> Url {
        let mut path = String::new();
        if request.under_rest_base {
            path.push_str(self.connection.rest_base_path.trim_end_matches('/'));
        }
        if !request.path.starts_with('/') {
            path.push('/');
        }
        path.push_str(&request.path);

        let mut url = self.base_url.clone();
        url.set_path(&path);

        let database = request
            .with_database
            .then_some(self.connection.database.as_deref())
            .flatten();
        if database.is_some() || !request.params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            if let Some(db) = database {
                pairs.append_pair("database", db);
            }
            for (key, value) in &request.params {
                pairs.append_pair(key, value);
            }
        }
        url
    }

    async fn execute_with_auth(&self, request: &RestRequest) -> Result<RestResponse> {
        let url = self.url_for(request);
        let response = self.send_once(request, &url).await?;

        // 🔐 first contact with a digest server: learn the challenge, sign, retry exactly once
        if response.status() == StatusCode::UNAUTHORIZED && self.connection.auth == AuthKind::Digest {
            let learned = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|challenge| self.learn_challenge(challenge));
            if learned {
                debug!("🔐 digest challenge learned from {}, retrying signed", url);
                let retried = self.send_once(request, &url).await?;
                return into_rest_response(retried, &url).await;
            }
        }
        into_rest_response(response, &url).await
    }

    async fn send_once(&self, request: &RestRequest, url: &Url) -> Result<reqwest::Response> {
        trace!("📡 {} {}", request.method, url);
        let mut builder = self.http.request(request.method.clone(), url.clone());
        if let Some(accept) = &request.accept {
            builder = builder.header(ACCEPT, accept.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder
                .header(CONTENT_TYPE, body.content_type.as_str())
                .body(body.bytes.clone());
        }
        match self.connection.auth {
            AuthKind::None => {}
            AuthKind::Basic => {
                builder = builder.basic_auth(
                    &self.connection.username,
                    Some(&self.connection.password),
                );
            }
            AuthKind::Digest => {
                if let Some(header) =
                    self.digest_authorization(request.method.as_str(), &digest_uri(url))
                {
                    builder = builder.header(AUTHORIZATION, header);
                }
            }
        }
        builder.send().await.map_err(|source| Error::Transport {
            url: url.to_string(),
            source,
        })
    }
}

async fn into_rest_response(response: reqwest::Response, url: &Url) -> Result<RestResponse> {
    let status = response.status();
    let headers = response.headers();
    let content_type = header_str(headers, CONTENT_TYPE.as_str());
    let timestamp = header_str(headers, EFFECTIVE_TIMESTAMP_HEADER);
    let location = header_str(headers, "location");
    let body = response.bytes().await.map_err(|source| Error::Transport {
        url: url.to_string(),
        source,
    })?;

    // redirects are never followed, so a 3xx is an answer in its own right
    if !(status.is_success() || status.is_redirection()) {
        return Err(Error::Server {
            status,
            url: url.to_string(),
            body: String::from_utf8_lossy(&body).into_owned(),
        });
    }

    Ok(RestResponse {
        status,
        url: url.to_string(),
        content_type,
        timestamp,
        location,
        body,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use wiremock::matchers::{header, header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::clients::Connection;

    fn client_for(server: &MockServer, auth: AuthKind) -> HostClient {
        let address = server.address();
        HostClient::new(
            Connection::new(address.ip().to_string(), address.port())
                .with_credentials("admin", "admin", auth)
                .with_database("Documents"),
        )
        .expect("💀 the mock server's address did not make a client")
    }

    #[tokio::test]
    async fn the_one_where_basic_auth_and_the_database_ride_along() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/LATEST/internal/forestinfo"))
            .and(query_param("database", "Documents"))
            .and(header("authorization", "Basic YWRtaW46YWRtaW4="))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ML-Effective-Timestamp", "16990001")
                    .set_body_string("[]"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let response = client_for(&server, AuthKind::Basic)
            .execute(RestRequest::get("/internal/forestinfo"), None)
            .await
            .expect("💀 the happy path was not happy");

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.timestamp.as_deref(), Some("16990001"));
        assert_eq!(response.body, Bytes::from_static(b"[]"));
    }

    #[tokio::test]
    async fn the_one_where_a_500_becomes_a_server_error_with_the_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("XDMP-OOPS"))
            .mount(&server)
            .await;

        let err = client_for(&server, AuthKind::None)
            .execute(RestRequest::post("/documents"), None)
            .await
            .expect_err("💀 a 500 was treated as a success. Optimism is not a strategy.");

        match err {
            Error::Server { status, body, .. } => {
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(body, "XDMP-OOPS");
            }
            other => panic!("💀 expected a server error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn the_one_where_digest_learns_the_challenge_and_retries_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .with_priority(1)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).insert_header(
                "WWW-Authenticate",
                r#"Digest realm="public", qop="auth", nonce="abc123", opaque="xyz""#,
            ))
            .with_priority(2)
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, AuthKind::Digest);
        client
            .execute(RestRequest::get("/internal/forestinfo"), None)
            .await
            .expect("💀 the digest dance tripped on the first step");
        // 🔁 second call is signed straight away, no second 401
        client
            .execute(RestRequest::get("/internal/forestinfo"), None)
            .await
            .expect("💀 the digest dance forgot its moves");
    }

    #[tokio::test]
    async fn the_one_where_the_token_cuts_a_slow_server_short() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
            .mount(&server)
            .await;

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let err = client_for(&server, AuthKind::None)
            .execute(RestRequest::get("/slow"), Some(&token))
            .await
            .expect_err("💀 cancellation was ignored. The server is still talking.");
        assert!(err.is_cancelled());
    }

    #[test]
    fn the_one_where_paths_live_outside_the_rest_base_when_asked() {
        let client = HostClient::new(Connection::new("alpha", 8000).with_database("Documents"))
            .expect("💀 alpha");
        let rest = client.url_for(&RestRequest::get("/documents").param("txid", "7"));
        assert_eq!(
            rest.as_str(),
            "http://alpha:8000/LATEST/documents?database=Documents&txid=7"
        );

        let root = client.url_for(
            &RestRequest::post("/ext/process.mjs")
                .outside_rest_base()
                .without_database(),
        );
        assert_eq!(root.as_str(), "http://alpha:8000/ext/process.mjs");
    }
}
