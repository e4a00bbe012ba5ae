//! Application layer containing orchestration logic and shared state.

pub mod service;
pub mod settlement;
pub mod state;
pub mod watcher;

pub use service::{PaymentService, DEFAULT_PAYMENT_WINDOW_SECS};
pub use settlement::SettlementNotifier;
pub use state::AppState;
pub use watcher::{
    ExpiryJob, ExpiryScheduler, SweeperConfig, spawn_expiry_watcher, spawn_sweeper,
};
