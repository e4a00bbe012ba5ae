//! M-Pesa payment orchestrator.
//!
//! Accepts payment requests over HTTP, pushes them to the M-Pesa STK
//! (SIM Toolkit) API, and reconciles the asynchronous outcome through
//! provider callbacks, status polling and a local timeout watcher. The
//! ledger enforces that every payment is finalized exactly once no
//! matter how many reconciliation paths race for it.

pub mod api;
pub mod app;
pub mod domain;
pub mod infra;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
