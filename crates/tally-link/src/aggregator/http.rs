//! HTTP transport for the aggregation API.
//!
//! JSON-over-POST client in the aggregator's style: client credentials ride
//! in every request body, failures come back as `{ "error_type", "error_code",
//! "error_message" }` and are classified for the retry policy here. Raw
//! response bodies are logged, never returned to callers.

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use url::Url;

use super::types::{AccountSummary, ExchangeResponse, LinkTokenResponse, TransactionsPage};
use super::{AggregatorClient, AggregatorError, FailureKind};

/// Connection settings for the hosted aggregation API.
#[derive(Debug, Clone)]
pub struct HttpAggregatorConfig {
    /// Environment base URL, e.g. `https://sandbox.aggregator.example.com`.
    pub base_url: Url,
    pub client_id: String,
    pub secret: String,
    /// Transport-level timeout; the request queue applies its own per-caller
    /// timeout on top of this.
    pub http_timeout: std::time::Duration,
}

/// reqwest-backed [`AggregatorClient`].
pub struct HttpAggregatorClient {
    config: HttpAggregatorConfig,
    http_client: Client,
}

/// Error envelope the aggregator returns on failures.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

impl HttpAggregatorClient {
    pub fn new(config: HttpAggregatorConfig) -> Result<Self, AggregatorError> {
        let http_client = Client::builder()
            .user_agent("Tally/1.0")
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| AggregatorError::fatal(format!("failed to build http client: {e}")))?;

        Ok(Self {
            config,
            http_client,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, AggregatorError> {
        self.config
            .base_url
            .join(path)
            .map_err(|e| AggregatorError::fatal(format!("invalid endpoint {path}: {e}")))
    }

    /// POST a JSON body (client credentials injected) and decode the reply.
    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        mut body: serde_json::Value,
    ) -> Result<T, AggregatorError> {
        body["client_id"] = serde_json::Value::String(self.config.client_id.clone());
        body["secret"] = serde_json::Value::String(self.config.secret.clone());

        let url = self.endpoint(path)?;
        let response = self
            .http_client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                // Transport failures (DNS, connect, client timeout) are fatal:
                // upstream never said the data was staging, and the queue's
                // per-caller timeout already bounds the wait.
                if e.is_timeout() {
                    AggregatorError::fatal(format!("{path} transport timeout: {e}"))
                } else {
                    AggregatorError::fatal(format!("{path} request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            tracing::warn!("aggregator {path} failed: {status} - {text}");
            return Err(classify_failure(status, &text, path));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| AggregatorError::fatal(format!("{path} returned malformed body: {e}")))
    }
}

/// Map an HTTP failure onto the retry taxonomy.
fn classify_failure(status: StatusCode, body: &str, path: &str) -> AggregatorError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or(ErrorBody {
        error_type: None,
        error_code: None,
        error_message: None,
    });

    let code = parsed.error_code.clone();
    let message = parsed
        .error_message
        .unwrap_or_else(|| format!("{path} failed with status {status}"));

    let kind = if status == StatusCode::TOO_MANY_REQUESTS
        || parsed.error_type.as_deref() == Some("RATE_LIMIT_EXCEEDED")
    {
        FailureKind::RateLimited
    } else if code.as_deref() == Some("PRODUCT_NOT_READY") {
        FailureKind::NotReady
    } else {
        FailureKind::Fatal
    };

    AggregatorError {
        kind,
        code,
        message,
    }
}

#[async_trait::async_trait]
impl AggregatorClient for HttpAggregatorClient {
    async fn create_link_token(&self, user_id: &str) -> Result<LinkTokenResponse, AggregatorError> {
        let body = serde_json::json!({
            "user": { "client_user_id": user_id },
            "client_name": "Tally",
            "products": ["transactions"],
            "country_codes": ["US"],
            "language": "en",
        });
        let response: LinkTokenResponse = self.post("/link/token/create", body).await?;
        tracing::info!("minted link token");
        Ok(response)
    }

    async fn exchange_public_token(
        &self,
        public_token: &str,
    ) -> Result<ExchangeResponse, AggregatorError> {
        let body = serde_json::json!({ "public_token": public_token });
        let response: ExchangeResponse = self.post("/item/public_token/exchange", body).await?;
        tracing::info!(item_id = %response.item_id, "exchanged public token");
        Ok(response)
    }

    async fn get_accounts(
        &self,
        credential: &str,
    ) -> Result<Vec<AccountSummary>, AggregatorError> {
        #[derive(Deserialize)]
        struct AccountsResponse {
            accounts: Vec<AccountSummary>,
        }

        let body = serde_json::json!({ "access_token": credential });
        let response: AccountsResponse = self.post("/accounts/balance/get", body).await?;
        Ok(response.accounts)
    }

    async fn sync_transactions(
        &self,
        credential: &str,
        cursor: Option<&str>,
    ) -> Result<TransactionsPage, AggregatorError> {
        let mut body = serde_json::json!({ "access_token": credential });
        if let Some(cursor) = cursor {
            body["cursor"] = serde_json::Value::String(cursor.to_string());
        }
        self.post("/transactions/sync", body).await
    }

    async fn remove_item(&self, credential: &str) -> Result<(), AggregatorError> {
        #[derive(Deserialize)]
        struct RemoveResponse {
            #[serde(default)]
            #[allow(dead_code)]
            request_id: Option<String>,
        }

        let body = serde_json::json!({ "access_token": credential });
        let _: RemoveResponse = self.post("/item/remove", body).await?;
        tracing::info!("removed item upstream");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_429_classifies_as_rate_limited() {
        let err = classify_failure(StatusCode::TOO_MANY_REQUESTS, "", "/accounts/balance/get");
        assert_eq!(err.kind, FailureKind::RateLimited);
    }

    #[test]
    fn rate_limit_error_type_classifies_without_429() {
        let body = r#"{"error_type":"RATE_LIMIT_EXCEEDED","error_code":"TRANSACTIONS_LIMIT","error_message":"rate limit exceeded"}"#;
        let err = classify_failure(StatusCode::BAD_REQUEST, body, "/transactions/sync");
        assert_eq!(err.kind, FailureKind::RateLimited);
        assert_eq!(err.code.as_deref(), Some("TRANSACTIONS_LIMIT"));
    }

    #[test]
    fn product_not_ready_classifies_as_not_ready() {
        let body = r#"{"error_type":"ITEM_ERROR","error_code":"PRODUCT_NOT_READY","error_message":"the requested product is not yet ready"}"#;
        let err = classify_failure(StatusCode::BAD_REQUEST, body, "/transactions/sync");
        assert_eq!(err.kind, FailureKind::NotReady);
    }

    #[test]
    fn unknown_failures_are_fatal_with_status_message() {
        let err = classify_failure(StatusCode::UNAUTHORIZED, "not json", "/item/remove");
        assert_eq!(err.kind, FailureKind::Fatal);
        assert!(err.message.contains("401"));
    }

    #[tokio::test]
    async fn transport_failures_classify_as_fatal() {
        // Port 9 (discard) is closed on any sane host; the connect fails
        // without touching the network.
        let client = HttpAggregatorClient::new(HttpAggregatorConfig {
            base_url: Url::parse("http://127.0.0.1:9").unwrap(),
            client_id: "client".to_string(),
            secret: "secret".to_string(),
            http_timeout: std::time::Duration::from_millis(250),
        })
        .unwrap();

        let err = client.get_accounts("credential").await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Fatal);
    }
}
