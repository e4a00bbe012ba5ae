//! Safaricom Daraja gateway implementation.
//!
//! This module integrates with the Daraja STK push API for payment
//! initiation and status queries, including OAuth token caching and the
//! per-call password derivation the API requires.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::domain::{
    AppError, ConfigError, MpesaGateway, ProviderError, StkPushAck, StkPushRequest,
    StkQueryOutcome,
};

/// Default Daraja API base URL (Safaricom sandbox)
pub const SANDBOX_BASE_URL: &str = "https://sandbox.safaricom.co.ke";

/// Default per-request HTTP timeout in seconds
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

const OAUTH_PATH: &str = "/oauth/v1/generate?grant_type=client_credentials";
const STK_PUSH_PATH: &str = "/mpesa/stkpush/v1/processrequest";
const STK_QUERY_PATH: &str = "/mpesa/stkpushquery/v1/query";

/// Daraja transaction type for customer-initiated paybill payments
const TRANSACTION_TYPE: &str = "CustomerPayBillOnline";

/// Daraja error code meaning the push is still open on the provider side
const STILL_PROCESSING_CODE: &str = "500.001.1001";

/// Timestamp layout Daraja expects in the password derivation
const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Fallback token lifetime when the OAuth response carries none we can parse
const DEFAULT_TOKEN_TTL_SECS: i64 = 3599;

/// Refresh tokens this many seconds before their stated expiry
const TOKEN_EXPIRY_SLACK_SECS: i64 = 60;

/// Connection settings for the Daraja API
#[derive(Debug, Clone)]
pub struct MpesaConfig {
    /// API origin, e.g. `https://sandbox.safaricom.co.ke`
    pub base_url: String,
    /// OAuth consumer key. `None` switches the gateway to mock mode.
    pub consumer_key: Option<String>,
    /// OAuth consumer secret. `None` switches the gateway to mock mode.
    pub consumer_secret: Option<SecretString>,
    /// Business shortcode, used as both `BusinessShortCode` and `PartyB`
    pub shortcode: String,
    /// Lipa na M-Pesa online passkey for password derivation
    pub passkey: SecretString,
    /// Public URL Daraja delivers callbacks to
    pub callback_url: String,
    /// Per-request HTTP timeout
    pub request_timeout: std::time::Duration,
}

impl Default for MpesaConfig {
    fn default() -> Self {
        Self {
            base_url: SANDBOX_BASE_URL.to_string(),
            consumer_key: None,
            consumer_secret: None,
            shortcode: "174379".to_string(),
            passkey: SecretString::from(""),
            callback_url: "http://localhost:3000/payments/callback".to_string(),
            request_timeout: std::time::Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }
}

/// Cached OAuth token with its refresh deadline
#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

/// Daraja OAuth response. `expires_in` arrives as a string.
#[derive(Debug, Deserialize)]
struct OAuthResponse {
    access_token: String,
    #[serde(default)]
    expires_in: String,
}

/// Synchronous acceptance body for an STK push
#[derive(Debug, Deserialize)]
struct StkPushResponse {
    #[serde(rename = "MerchantRequestID")]
    merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: String,
    #[serde(rename = "ResponseCode")]
    response_code: String,
    #[serde(rename = "ResponseDescription", default)]
    response_description: String,
    #[serde(rename = "CustomerMessage", default)]
    customer_message: String,
}

/// Daraja error envelope returned on non-2xx responses
#[derive(Debug, Deserialize)]
struct DarajaErrorBody {
    #[serde(rename = "requestId", default)]
    request_id: String,
    #[serde(rename = "errorCode", default)]
    error_code: String,
    #[serde(rename = "errorMessage", default)]
    error_message: String,
}

/// Status query response body
#[derive(Debug, Deserialize)]
struct StkQueryResponse {
    #[serde(rename = "ResultCode")]
    result_code: serde_json::Value,
    #[serde(rename = "ResultDesc", default)]
    result_desc: String,
}

/// Gateway that drives STK pushes through the Daraja API
pub struct DarajaGateway {
    http_client: Client,
    config: MpesaConfig,
    token: RwLock<Option<CachedToken>>,
}

impl DarajaGateway {
    /// Create a new Daraja gateway.
    ///
    /// Without a consumer key/secret pair the gateway runs in mock mode:
    /// pushes are acknowledged locally with fabricated checkout references
    /// and status queries never answer, so payments resolve through
    /// callbacks (see the `simulate_callback` binary) or the timeout path.
    pub fn new(config: MpesaConfig) -> Self {
        let http_client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            http_client,
            config,
            token: RwLock::new(None),
        }
    }

    /// Check if running in mock mode (no consumer credentials configured)
    pub fn is_mock_mode(&self) -> bool {
        self.config.consumer_key.is_none() || self.config.consumer_secret.is_none()
    }

    fn credentials(&self) -> Result<(&str, &SecretString), AppError> {
        match (&self.config.consumer_key, &self.config.consumer_secret) {
            (Some(key), Some(secret)) => Ok((key.as_str(), secret)),
            _ => Err(AppError::Config(ConfigError::MissingVar(
                "MPESA_CONSUMER_KEY / MPESA_CONSUMER_SECRET".to_string(),
            ))),
        }
    }

    /// Password and timestamp pair for a push or query call. Regenerated on
    /// every call; Daraja rejects stale timestamps.
    fn push_credentials(&self) -> (String, String) {
        let timestamp = Utc::now().format(TIMESTAMP_FORMAT).to_string();
        let password = derive_password(
            &self.config.shortcode,
            self.config.passkey.expose_secret(),
            &timestamp,
        );
        (password, timestamp)
    }

    /// Callback URL for a push, carrying the invoice reference as a query
    /// parameter so it round-trips through the provider.
    fn callback_url_for(&self, invoice_ref: Option<&str>) -> Result<String, AppError> {
        match invoice_ref {
            None => Ok(self.config.callback_url.clone()),
            Some(invoice) => {
                let mut url = Url::parse(&self.config.callback_url).map_err(|e| {
                    AppError::Config(ConfigError::InvalidVar {
                        var: "MPESA_CALLBACK_URL".to_string(),
                        message: e.to_string(),
                    })
                })?;
                url.query_pairs_mut().append_pair("invoiceRef", invoice);
                Ok(url.to_string())
            }
        }
    }

    /// Fabricate a locally-unique push acknowledgment for mock mode
    fn mock_push_ack(&self) -> StkPushAck {
        let nonce = Uuid::new_v4().simple().to_string();
        StkPushAck {
            checkout_ref: format!("ws_CO_MOCK_{}", &nonce[..16]),
            merchant_ref: format!("mock-{}", &nonce[16..24]),
            customer_message: "Success. Request accepted for processing".to_string(),
        }
    }

    /// Return the cached access token, fetching a fresh one when absent or
    /// within the expiry slack.
    async fn access_token(&self) -> Result<String, AppError> {
        {
            let cached = self.token.read().await;
            if let Some(token) = cached.as_ref() {
                if token.expires_at > Utc::now() {
                    return Ok(token.access_token.clone());
                }
            }
        }
        self.refresh_access_token().await
    }

    async fn refresh_access_token(&self) -> Result<String, AppError> {
        let (consumer_key, consumer_secret) = self.credentials()?;
        let url = format!("{}{}", self.config.base_url, OAUTH_PATH);

        debug!(url = %url, "Fetching Daraja access token");

        let response = self
            .http_client
            .get(&url)
            .basic_auth(consumer_key, Some(consumer_secret.expose_secret()))
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "Daraja OAuth request failed");
                AppError::Provider(ProviderError::Unreachable(e.to_string()))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Daraja rejected the OAuth request");
            return Err(AppError::Provider(ProviderError::Credential(format!(
                "HTTP {status}: {body}"
            ))));
        }

        let body: OAuthResponse = response.json().await.map_err(|e| {
            error!(error = %e, "Failed to parse Daraja OAuth response");
            AppError::Provider(ProviderError::UnexpectedResponse(e.to_string()))
        })?;

        let ttl = body
            .expires_in
            .parse::<i64>()
            .unwrap_or(DEFAULT_TOKEN_TTL_SECS);
        let expires_at = Utc::now() + chrono::Duration::seconds((ttl - TOKEN_EXPIRY_SLACK_SECS).max(0));

        let mut cached = self.token.write().await;
        *cached = Some(CachedToken {
            access_token: body.access_token.clone(),
            expires_at,
        });

        debug!(ttl_secs = ttl, "Daraja access token refreshed");
        Ok(body.access_token)
    }

    async fn invalidate_token(&self) {
        let mut cached = self.token.write().await;
        *cached = None;
    }

    /// POST a payload with bearer auth, refreshing the token once if the
    /// provider rejects it. A cached token can outlive its server-side
    /// validity.
    async fn post_authorized(
        &self,
        path: &str,
        payload: &serde_json::Value,
    ) -> Result<reqwest::Response, AppError> {
        let url = format!("{}{}", self.config.base_url, path);
        let token = self.access_token().await?;

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&token)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, url = %url, "Daraja request failed");
                AppError::Provider(ProviderError::Unreachable(e.to_string()))
            })?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        debug!(url = %url, "Access token rejected, refreshing once");
        self.invalidate_token().await;
        let token = self.access_token().await?;

        self.http_client
            .post(&url)
            .bearer_auth(&token)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, url = %url, "Daraja request failed after token refresh");
                AppError::Provider(ProviderError::Unreachable(e.to_string()))
            })
    }

    /// Classify a non-2xx Daraja response into a provider error
    async fn error_from_response(&self, response: reqwest::Response) -> AppError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let parsed: Option<DarajaErrorBody> = serde_json::from_str(&body).ok();

        let (code, message) = match parsed {
            Some(e) => {
                let msg = if e.error_message.is_empty() {
                    format!("HTTP {status}")
                } else {
                    e.error_message
                };
                debug!(request_id = %e.request_id, code = %e.error_code, "Daraja error envelope");
                (e.error_code, msg)
            }
            None => {
                let msg = if body.is_empty() {
                    format!("HTTP {status}")
                } else {
                    body
                };
                (String::new(), msg)
            }
        };

        // "Still processing" arrives as an HTTP error, so it must be picked
        // out before the status-class split.
        if code == STILL_PROCESSING_CODE {
            return AppError::Provider(ProviderError::NoAnswer(message));
        }

        error!(status = %status, code = %code, message = %message, "Daraja returned an error response");
        if status.is_server_error() {
            AppError::Provider(ProviderError::Unreachable(format!("HTTP {status}: {message}")))
        } else {
            AppError::Provider(ProviderError::Rejected(message))
        }
    }
}

#[async_trait]
impl MpesaGateway for DarajaGateway {
    #[instrument(skip(self, request), fields(phone = %request.phone, amount = request.amount))]
    async fn initiate_push(&self, request: &StkPushRequest) -> Result<StkPushAck, AppError> {
        if self.is_mock_mode() {
            warn!("Running in mock gateway mode - no M-Pesa credentials configured");
            return Ok(self.mock_push_ack());
        }

        let callback_url = self.callback_url_for(request.invoice_ref.as_deref())?;
        let (password, timestamp) = self.push_credentials();
        let payload = json!({
            "BusinessShortCode": self.config.shortcode,
            "Password": password,
            "Timestamp": timestamp,
            "TransactionType": TRANSACTION_TYPE,
            "Amount": request.amount,
            "PartyA": request.phone,
            "PartyB": self.config.shortcode,
            "PhoneNumber": request.phone,
            "CallBackURL": callback_url,
            "AccountReference": request.account_reference,
            "TransactionDesc": request.description,
        });

        let response = self.post_authorized(STK_PUSH_PATH, &payload).await?;
        if !response.status().is_success() {
            return Err(self.error_from_response(response).await);
        }

        let body: StkPushResponse = response.json().await.map_err(|e| {
            error!(error = %e, "Failed to parse STK push response");
            AppError::Provider(ProviderError::UnexpectedResponse(e.to_string()))
        })?;

        if body.response_code != "0" {
            warn!(
                code = %body.response_code,
                description = %body.response_description,
                "Provider refused the STK push"
            );
            return Err(AppError::Provider(ProviderError::Rejected(
                body.response_description,
            )));
        }

        debug!(
            checkout_ref = %body.checkout_request_id,
            merchant_ref = %body.merchant_request_id,
            "STK push accepted by provider"
        );

        Ok(StkPushAck {
            checkout_ref: body.checkout_request_id,
            merchant_ref: body.merchant_request_id,
            customer_message: body.customer_message,
        })
    }

    #[instrument(skip(self))]
    async fn query_status(&self, checkout_ref: &str) -> Result<StkQueryOutcome, AppError> {
        if self.is_mock_mode() {
            return Err(AppError::Provider(ProviderError::NoAnswer(
                "Mock gateway never answers status queries".to_string(),
            )));
        }

        let (password, timestamp) = self.push_credentials();
        let payload = json!({
            "BusinessShortCode": self.config.shortcode,
            "Password": password,
            "Timestamp": timestamp,
            "CheckoutRequestID": checkout_ref,
        });

        let response = self.post_authorized(STK_QUERY_PATH, &payload).await?;
        if !response.status().is_success() {
            return Err(self.error_from_response(response).await);
        }

        let body: StkQueryResponse = response.json().await.map_err(|e| {
            error!(error = %e, "Failed to parse STK query response");
            AppError::Provider(ProviderError::UnexpectedResponse(e.to_string()))
        })?;

        let outcome = parse_query_outcome(body)?;
        debug!(
            result_code = outcome.result_code,
            result_desc = %outcome.result_desc,
            "Status query answered"
        );
        Ok(outcome)
    }

    async fn health_check(&self) -> Result<(), AppError> {
        if self.is_mock_mode() {
            return Ok(());
        }
        self.access_token().await.map(|_| ())
    }
}

/// Daraja password: base64 of shortcode, passkey and timestamp concatenated
fn derive_password(shortcode: &str, passkey: &str, timestamp: &str) -> String {
    BASE64.encode(format!("{shortcode}{passkey}{timestamp}"))
}

/// Normalize the query response into a definitive outcome.
///
/// The query API reports `ResultCode` as a string, unlike the integer the
/// callback carries. Both shapes are tolerated.
fn parse_query_outcome(response: StkQueryResponse) -> Result<StkQueryOutcome, AppError> {
    let result_code = match &response.result_code {
        serde_json::Value::String(s) => s.trim().parse::<i32>().ok(),
        serde_json::Value::Number(n) => n.as_i64().and_then(|v| i32::try_from(v).ok()),
        _ => None,
    }
    .ok_or_else(|| {
        AppError::Provider(ProviderError::UnexpectedResponse(format!(
            "Unparseable ResultCode: {}",
            response.result_code
        )))
    })?;

    Ok(StkQueryOutcome {
        result_code,
        result_desc: response.result_desc,
    })
}
