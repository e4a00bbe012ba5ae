//! Infrastructure layer implementations.

pub mod database;
pub mod invoicing;
pub mod mpesa;
pub mod notify;

pub use database::{PostgresClient, PostgresConfig};
pub use invoicing::PgInvoiceClient;
pub use mpesa::{DarajaGateway, MpesaConfig};
pub use notify::PgNotificationSender;
