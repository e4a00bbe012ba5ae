//! HTTP request handlers with OpenAPI documentation.

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{FromRequestParts, Path, Query, State},
    http::{StatusCode, request::Parts},
    response::IntoResponse,
};
use tracing::{error, warn};
use utoipa::OpenApi;

use crate::app::AppState;
use crate::domain::{
    AppError, CallbackAck, DatabaseError, ErrorDetail, ErrorResponse, HealthResponse,
    HealthStatus, InitiatePaymentRequest, InitiatePaymentResponse, PaginatedResponse,
    PaginationParams, PaymentStatusResponse, PaymentSummary, ProviderError, RateLimitResponse,
    StkCallbackEnvelope,
};

/// Header carrying the authenticated payer identity, injected by the edge
/// proxy after authentication.
pub const PAYER_ID_HEADER: &str = "x-payer-id";

/// OpenAPI documentation structure
#[derive(OpenApi)]
#[openapi(
    info(
        title = "M-Pesa Payment Orchestrator API",
        version = "0.1.0",
        description = "API for initiating M-Pesa STK push payments and reconciling their asynchronous outcomes",
        contact(
            name = "API Support",
            email = "support@example.com"
        ),
        license(
            name = "MIT"
        )
    ),
    paths(
        initiate_payment_handler,
        payment_status_handler,
        mpesa_callback_handler,
        retry_payment_handler,
        list_payments_handler,
        health_check_handler,
        liveness_handler,
        readiness_handler,
    ),
    components(
        schemas(
            InitiatePaymentRequest,
            InitiatePaymentResponse,
            PaymentStatusResponse,
            PaymentSummary,
            crate::domain::PaymentState,
            CallbackAck,
            StkCallbackEnvelope,
            crate::domain::types::StkCallbackBody,
            crate::domain::StkCallback,
            crate::domain::types::CallbackMetadata,
            crate::domain::types::MetadataItem,
            PaginationParams,
            PaginatedResponse<PaymentSummary>,
            HealthResponse,
            HealthStatus,
            ErrorResponse,
            ErrorDetail,
            RateLimitResponse,
        )
    ),
    tags(
        (name = "payments", description = "Payment initiation and reconciliation endpoints"),
        (name = "health", description = "Health check endpoints")
    )
)]
pub struct ApiDoc;

/// Payer identity extracted from the `X-Payer-Id` header
pub struct AuthenticatedPayer(pub String);

impl<S> FromRequestParts<S> for AuthenticatedPayer
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let payer = parts
            .headers
            .get(PAYER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| AppError::Unauthenticated("Missing X-Payer-Id header".to_string()))?;

        Ok(Self(payer.to_string()))
    }
}

/// Initiate an STK push payment
///
/// Validates the request, pushes the payment prompt to the payer's handset
/// and records a `pending` ledger entry.
///
/// **Response indicates the push was sent, not that the payment completed.**
/// Poll `GET /payments/{checkout_ref}/status` to track the outcome:
/// - `pending` → prompt open on the handset
/// - `succeeded` / `failed` / `cancelled` → provider answered
/// - `expired` → no answer within the payment window
#[utoipa::path(
    post,
    path = "/payments/initiate",
    tag = "payments",
    request_body = InitiatePaymentRequest,
    params(
        ("X-Payer-Id" = String, Header, description = "Authenticated payer identifier")
    ),
    responses(
        (status = 201, description = "Push sent, payment pending", body = InitiatePaymentResponse),
        (status = 400, description = "Validation error - invalid phone, amount or invoice reference", body = ErrorResponse),
        (status = 401, description = "Missing payer identity", body = ErrorResponse),
        (status = 422, description = "Provider rejected the push", body = ErrorResponse),
        (status = 429, description = "Rate limit exceeded", body = RateLimitResponse),
        (status = 502, description = "Provider unreachable", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn initiate_payment_handler(
    State(state): State<Arc<AppState>>,
    payer: AuthenticatedPayer,
    Json(payload): Json<InitiatePaymentRequest>,
) -> Result<(StatusCode, Json<InitiatePaymentResponse>), AppError> {
    let record = state.service.initiate_payment(&payer.0, &payload).await?;
    Ok((
        StatusCode::CREATED,
        Json(InitiatePaymentResponse::from_record(&record)),
    ))
}

/// Poll a payment's current state
///
/// Terminal states are returned as-is. A pending payment past its deadline
/// is expired on the spot; otherwise the provider is queried for a
/// definitive answer. An unreachable provider leaves the payment `pending`
/// rather than failing the poll.
#[utoipa::path(
    get,
    path = "/payments/{checkout_ref}/status",
    tag = "payments",
    params(
        ("checkout_ref" = String, Path, description = "Provider checkout reference returned at initiation")
    ),
    responses(
        (status = 200, description = "Current payment state", body = PaymentStatusResponse),
        (status = 404, description = "Unknown checkout reference", body = ErrorResponse),
        (status = 429, description = "Rate limit exceeded", body = RateLimitResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn payment_status_handler(
    State(state): State<Arc<AppState>>,
    Path(checkout_ref): Path<String>,
) -> Result<Json<PaymentStatusResponse>, AppError> {
    let record = state.service.check_status(&checkout_ref).await?;
    Ok(Json(PaymentStatusResponse::from_record(&record)))
}

/// Daraja payment callback
///
/// Receives the asynchronous STK outcome from the provider. The response is
/// always the standard acknowledgment, even for malformed payloads, unknown
/// checkout references or internal failures: anything else makes the
/// provider re-deliver the callback.
#[utoipa::path(
    post,
    path = "/payments/callback",
    tag = "payments",
    request_body = StkCallbackEnvelope,
    responses(
        (status = 200, description = "Callback acknowledged", body = CallbackAck)
    )
)]
pub async fn mpesa_callback_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Json<CallbackAck> {
    let envelope: StkCallbackEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "Discarding malformed provider callback");
            return Json(CallbackAck::accepted());
        }
    };

    if let Err(e) = state
        .service
        .handle_callback(&envelope.body.stk_callback)
        .await
    {
        error!(error = ?e, "Callback processing failed, acknowledging anyway");
    }

    Json(CallbackAck::accepted())
}

/// Retry a terminally unsuccessful payment
///
/// Issues a fresh push for a payment that failed, was cancelled or expired.
/// The new payment gets its own ledger entry linked to the original via
/// `retryOf`; the original record never changes.
#[utoipa::path(
    post,
    path = "/payments/{payment_id}/retry",
    tag = "payments",
    params(
        ("payment_id" = String, Path, description = "Ledger identifier of the payment to retry"),
        ("X-Payer-Id" = String, Header, description = "Authenticated payer identifier")
    ),
    responses(
        (status = 201, description = "Retry push sent, new payment pending", body = InitiatePaymentResponse),
        (status = 401, description = "Missing payer identity", body = ErrorResponse),
        (status = 403, description = "Payment belongs to another payer", body = ErrorResponse),
        (status = 404, description = "Unknown payment", body = ErrorResponse),
        (status = 409, description = "Payment is not in a retryable state", body = ErrorResponse),
        (status = 429, description = "Rate limit exceeded", body = RateLimitResponse),
        (status = 502, description = "Provider unreachable", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn retry_payment_handler(
    State(state): State<Arc<AppState>>,
    payer: AuthenticatedPayer,
    Path(payment_id): Path<String>,
) -> Result<(StatusCode, Json<InitiatePaymentResponse>), AppError> {
    let record = state.service.retry_payment(&payer.0, &payment_id).await?;
    Ok((
        StatusCode::CREATED,
        Json(InitiatePaymentResponse::from_record(&record)),
    ))
}

/// List the caller's payments with pagination
#[utoipa::path(
    get,
    path = "/payments",
    tag = "payments",
    params(
        ("X-Payer-Id" = String, Header, description = "Authenticated payer identifier"),
        ("limit" = Option<i64>, Query, description = "Maximum number of payments to return (1-100, default: 20)"),
        ("cursor" = Option<String>, Query, description = "Cursor for pagination (payment ID to start after)")
    ),
    responses(
        (status = 200, description = "Page of the caller's payments, newest first", body = PaginatedResponse<PaymentSummary>),
        (status = 400, description = "Invalid pagination parameters", body = ErrorResponse),
        (status = 401, description = "Missing payer identity", body = ErrorResponse),
        (status = 429, description = "Rate limit exceeded", body = RateLimitResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn list_payments_handler(
    State(state): State<Arc<AppState>>,
    payer: AuthenticatedPayer,
    Query(params): Query<PaginationParams>,
) -> Result<Json<PaginatedResponse<PaymentSummary>>, AppError> {
    // Validate limit
    let limit = params.limit.clamp(1, 100);
    let page = state
        .service
        .list_payments(&payer.0, limit, params.cursor.as_deref())
        .await?;

    let items = page.items.iter().map(PaymentSummary::from_record).collect();
    Ok(Json(PaginatedResponse::new(
        items,
        page.next_cursor,
        page.has_more,
    )))
}

/// Detailed health check
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Health status", body = HealthResponse)
    )
)]
pub async fn health_check_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let health = state.service.health_check().await;
    Json(health)
}

/// Kubernetes liveness probe
#[utoipa::path(
    get,
    path = "/health/live",
    tag = "health",
    responses(
        (status = 200, description = "Application is alive")
    )
)]
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Kubernetes readiness probe
#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "health",
    responses(
        (status = 200, description = "Application is ready to serve traffic"),
        (status = 503, description = "Application is not ready")
    )
)]
pub async fn readiness_handler(State(state): State<Arc<AppState>>) -> StatusCode {
    let health = state.service.health_check().await;
    match health.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, error_type, message) = match &self {
            AppError::Validation(_) => (
                StatusCode::BAD_REQUEST,
                "validation_error",
                self.to_string(),
            ),
            AppError::Database(db_err) => match db_err {
                DatabaseError::Connection(_) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "database_error",
                    self.to_string(),
                ),
                _ => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "database_error",
                    self.to_string(),
                ),
            },
            AppError::Provider(provider_err) => match provider_err {
                ProviderError::Unreachable(_) => (
                    StatusCode::BAD_GATEWAY,
                    "provider_unreachable",
                    self.to_string(),
                ),
                ProviderError::Rejected(_) => (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "provider_rejected",
                    self.to_string(),
                ),
                ProviderError::NoAnswer(_) => (
                    StatusCode::GATEWAY_TIMEOUT,
                    "provider_no_answer",
                    self.to_string(),
                ),
                ProviderError::Credential(_) => (
                    StatusCode::BAD_GATEWAY,
                    "provider_credential_error",
                    self.to_string(),
                ),
                ProviderError::UnexpectedResponse(_) => (
                    StatusCode::BAD_GATEWAY,
                    "provider_error",
                    self.to_string(),
                ),
            },
            AppError::Config(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "configuration_error",
                self.to_string(),
            ),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found", self.to_string()),
            AppError::Unauthenticated(_) => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                self.to_string(),
            ),
            AppError::NotAuthorized(_) => (
                StatusCode::FORBIDDEN,
                "authorization_error",
                self.to_string(),
            ),
            AppError::NotRetryable(_) => {
                (StatusCode::CONFLICT, "not_retryable", self.to_string())
            }
            AppError::RateLimited(_) => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                self.to_string(),
            ),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                self.to_string(),
            ),
        };

        if status.is_server_error() {
            error!(error_type = %error_type, message = %message, "Server error");
        }

        let body = Json(ErrorResponse {
            error: ErrorDetail {
                r#type: error_type.to_string(),
                message,
            },
        });

        (status, body).into_response()
    }
}
