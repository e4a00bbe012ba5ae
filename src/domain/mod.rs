//! Domain layer containing core business types, traits, and error definitions.

pub mod error;
pub mod traits;
pub mod types;

pub use error::{AppError, ConfigError, DatabaseError, ProviderError, ValidationError};
pub use traits::{InvoiceClient, MpesaGateway, NotificationSender, PaymentStore};
pub use types::{
    CallbackAck, ErrorDetail, ErrorResponse, HealthResponse, HealthStatus, InitiatePaymentRequest,
    InitiatePaymentResponse, InvoiceSettlement, NoticeKind, PaginatedResponse, PaginationParams,
    PaymentOutcome, PaymentRequest, PaymentState, PaymentStatusResponse, PaymentSummary,
    RateLimitResponse, StkCallback, StkCallbackEnvelope, StkPushAck, StkPushRequest,
    StkQueryOutcome,
};
