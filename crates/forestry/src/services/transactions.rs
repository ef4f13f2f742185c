//! 🧾 `/transactions`: begin, commit, rollback.
//!
//! A transaction lives on the server. We only ever hold its id, which comes
//! back in the `Location` header of the begin call as `.../transactions/<id>`.

use tracing::info;

use crate::clients::HostClient;
use crate::common::Transaction;
use crate::error::{Error, Result};
use crate::transport::RestRequest;

/// 🚀 Open a transaction. `time_limit_secs` of `None` leaves the server default.
pub async fn begin(
    client: &HostClient,
    name: Option<&str>,
    time_limit_secs: Option<u64>,
) -> Result<Transaction> {
    let mut request = RestRequest::post("/transactions");
    if let Some(name) = name {
        request = request.param("name", name);
    }
    if let Some(limit) = time_limit_secs {
        request = request.param("timeLimit", limit.to_string());
    }
    let response = client.execute(request, None).await?;
    let location = response.location.ok_or_else(|| {
        Error::decode(
            "transaction",
            "the server opened a transaction but did not say where it put it (no Location header)",
        )
    })?;
    let id = location
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Error::decode("transaction", format!("no id in Location '{location}'")))?;

    info!("🧾 transaction {} opened on {}", id, client.host());
    Ok(Transaction::named(id, name.map(str::to_string)))
}

/// ✅ Make it permanent.
pub async fn commit(client: &HostClient, transaction: &Transaction) -> Result<()> {
    finish(client, transaction, "commit").await
}

/// ↩️ Pretend it never happened.
pub async fn rollback(client: &HostClient, transaction: &Transaction) -> Result<()> {
    finish(client, transaction, "rollback").await
}

async fn finish(client: &HostClient, transaction: &Transaction, result: &str) -> Result<()> {
    client
        .execute(
            RestRequest::post(format!("/transactions/{}", transaction.id())).param("result", result),
            None,
        )
        .await?;
    info!("🧾 transaction {} finished with {}", transaction.id(), result);
    Ok(())
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::test_support::mock_client;

    #[tokio::test]
    async fn the_one_where_a_transaction_is_born_and_committed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/LATEST/transactions"))
            .and(query_param("name", "nightly"))
            .respond_with(
                ResponseTemplate::new(303)
                    .insert_header("Location", "/LATEST/transactions/8675309"),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/LATEST/transactions/8675309"))
            .and(query_param("result", "commit"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = mock_client(&server);
        let txn = begin(&client, Some("nightly"), Some(60))
            .await
            .expect("💀 the transaction was stillborn");
        assert_eq!(txn.id(), "8675309");
        assert_eq!(txn.name(), Some("nightly"));

        commit(&client, &txn).await.expect("💀 commitment issues");
    }

    #[tokio::test]
    async fn the_one_where_rollback_failure_surfaces_as_a_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/LATEST/transactions/42"))
            .and(query_param("result", "rollback"))
            .respond_with(ResponseTemplate::new(400).set_body_string("XDMP-NOTXN"))
            .mount(&server)
            .await;

        let err = rollback(&mock_client(&server), &Transaction::from_id("42"))
            .await
            .expect_err("💀 rolling back nothing should not succeed");
        assert_eq!(err.status(), Some(reqwest::StatusCode::BAD_REQUEST));
    }
}
