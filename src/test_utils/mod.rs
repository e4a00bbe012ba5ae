//! Shared test utilities and mock implementations.

pub mod mocks;

pub use mocks::{
    MockConfig, MockInvoiceClient, MockMpesaGateway, MockNotificationSender, MockPaymentStore,
    MockQueryBehavior, RecordedNotice,
};
