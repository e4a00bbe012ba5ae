//! Settlement side effects for finalized payments.

use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::domain::{
    InvoiceClient, InvoiceSettlement, NoticeKind, NotificationSender, PaymentRequest, PaymentState,
};

/// Applies the one-shot side effects of a finalized payment: invoice
/// settlement and user notifications.
///
/// Callers invoke [`SettlementNotifier::settle`] only after winning the
/// ledger's conditional finalization; this type does not re-check state.
/// Collaborator failures are logged and absorbed rather than propagated: the
/// record is already terminal, blind retries would threaten exactly-once, and
/// both collaborators are idempotent so a manual re-run is safe.
pub struct SettlementNotifier {
    invoices: Arc<dyn InvoiceClient>,
    notifications: Arc<dyn NotificationSender>,
}

impl SettlementNotifier {
    #[must_use]
    pub fn new(
        invoices: Arc<dyn InvoiceClient>,
        notifications: Arc<dyn NotificationSender>,
    ) -> Self {
        Self {
            invoices,
            notifications,
        }
    }

    /// Settle a just-finalized payment: invoice first (success only), then the
    /// payer's outcome notice, then the invoice owner's notice.
    #[instrument(skip(self, payment), fields(id = %payment.id, state = %payment.state))]
    pub async fn settle(&self, payment: &PaymentRequest) {
        let invoice_outcome = match (payment.state, payment.invoice_ref.as_deref()) {
            (PaymentState::Succeeded, Some(invoice_ref)) => {
                self.settle_invoice(invoice_ref, payment).await
            }
            _ => None,
        };

        if let Some(kind) = NoticeKind::for_outcome(payment.state) {
            self.send(&payment.payer_id, payment, kind, &payer_notice_body(payment))
                .await;
        }

        if let Some(settlement) = invoice_outcome {
            // Skip the owner notice when the invoice was already paid; a
            // duplicate here would mean a second payment settled the same
            // invoice, which the warning above already surfaced.
            if settlement.newly_paid {
                let invoice_ref = payment.invoice_ref.as_deref().unwrap_or_default();
                let body = format!(
                    "Invoice {} settled by a payment of KES {}",
                    invoice_ref, payment.amount
                );
                self.send(&settlement.owner_id, payment, NoticeKind::InvoicePaid, &body)
                    .await;
            }
        }
    }

    async fn settle_invoice(
        &self,
        invoice_ref: &str,
        payment: &PaymentRequest,
    ) -> Option<InvoiceSettlement> {
        match self
            .invoices
            .mark_paid(invoice_ref, &payment.id, payment.amount)
            .await
        {
            Ok(settlement) => {
                if settlement.newly_paid {
                    info!(invoice = %invoice_ref, "Invoice marked paid");
                } else {
                    warn!(invoice = %invoice_ref, "Invoice was already paid, settlement is a no-op");
                }
                Some(settlement)
            }
            Err(e) => {
                error!(invoice = %invoice_ref, error = ?e, "Failed to settle invoice");
                None
            }
        }
    }

    async fn send(&self, recipient: &str, payment: &PaymentRequest, kind: NoticeKind, body: &str) {
        if let Err(e) = self
            .notifications
            .notify(recipient, &payment.id, kind, body)
            .await
        {
            error!(
                recipient = %recipient,
                kind = %kind.as_str(),
                error = ?e,
                "Failed to send notification"
            );
        }
    }
}

fn payer_notice_body(payment: &PaymentRequest) -> String {
    match payment.state {
        PaymentState::Succeeded => format!(
            "Payment of KES {} succeeded (receipt {})",
            payment.amount,
            payment.receipt_ref.as_deref().unwrap_or("unavailable")
        ),
        PaymentState::Failed => format!(
            "Payment of KES {} failed: {}",
            payment.amount,
            payment
                .result_detail
                .as_deref()
                .unwrap_or("the provider reported a failure")
        ),
        PaymentState::Cancelled => {
            format!("Payment of KES {} was cancelled on the handset", payment.amount)
        }
        PaymentState::Expired => format!(
            "Payment of KES {} expired without confirmation",
            payment.amount
        ),
        // Unreachable: callers gate on NoticeKind::for_outcome.
        PaymentState::Pending => String::new(),
    }
}
