//! M-Pesa gateway implementations.

pub mod client;

pub use client::{DarajaGateway, MpesaConfig, DEFAULT_REQUEST_TIMEOUT_SECS, SANDBOX_BASE_URL};
