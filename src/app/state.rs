//! Application state management.

use chrono::Duration;
use std::sync::Arc;

use crate::domain::{InvoiceClient, MpesaGateway, NotificationSender, PaymentStore};

use super::service::{PaymentService, DEFAULT_PAYMENT_WINDOW_SECS};
use super::watcher::ExpiryScheduler;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<PaymentService>,
    pub store: Arc<dyn PaymentStore>,
    pub gateway: Arc<dyn MpesaGateway>,
    pub invoices: Arc<dyn InvoiceClient>,
    pub notifications: Arc<dyn NotificationSender>,
    scheduler: ExpiryScheduler,
    payment_window: Duration,
}

impl AppState {
    /// Create application state with no watcher attached; overdue payments
    /// are resolved by the sweeper alone. The default for tests.
    #[must_use]
    pub fn new(
        store: Arc<dyn PaymentStore>,
        gateway: Arc<dyn MpesaGateway>,
        invoices: Arc<dyn InvoiceClient>,
        notifications: Arc<dyn NotificationSender>,
    ) -> Self {
        Self::with_scheduler(
            store,
            gateway,
            invoices,
            notifications,
            ExpiryScheduler::detached(),
        )
    }

    /// Create application state wired to an expiry watcher's scheduler
    #[must_use]
    pub fn with_scheduler(
        store: Arc<dyn PaymentStore>,
        gateway: Arc<dyn MpesaGateway>,
        invoices: Arc<dyn InvoiceClient>,
        notifications: Arc<dyn NotificationSender>,
        scheduler: ExpiryScheduler,
    ) -> Self {
        let payment_window = Duration::seconds(DEFAULT_PAYMENT_WINDOW_SECS);
        let service = Arc::new(
            PaymentService::new(
                Arc::clone(&store),
                Arc::clone(&gateway),
                Arc::clone(&invoices),
                Arc::clone(&notifications),
                scheduler.clone(),
            )
            .with_payment_window(payment_window),
        );
        Self {
            service,
            store,
            gateway,
            invoices,
            notifications,
            scheduler,
            payment_window,
        }
    }

    /// Change the payment window (builder pattern)
    /// This rebuilds the service with the new window
    #[must_use]
    pub fn with_payment_window(mut self, window: Duration) -> Self {
        self.payment_window = window;
        self.rebuild_service();
        self
    }

    fn rebuild_service(&mut self) {
        self.service = Arc::new(
            PaymentService::new(
                Arc::clone(&self.store),
                Arc::clone(&self.gateway),
                Arc::clone(&self.invoices),
                Arc::clone(&self.notifications),
                self.scheduler.clone(),
            )
            .with_payment_window(self.payment_window),
        );
    }
}
