//! Service-level tests for the finalization protocol: every path out of
//! `pending` funnels through one conditional write, and settlement runs
//! exactly once no matter how many finalizers race.

use std::sync::Arc;

use chrono::{Duration, Utc};

use mpesa_payment_orchestrator::app::{
    AppState, ExpiryScheduler, SettlementNotifier, SweeperConfig, spawn_expiry_watcher,
    spawn_sweeper,
};
use mpesa_payment_orchestrator::domain::types::{CallbackMetadata, MetadataItem};
use mpesa_payment_orchestrator::domain::{
    AppError, InitiatePaymentRequest, NoticeKind, PaymentRequest, PaymentState, PaymentStore,
    StkCallback, StkPushAck, StkQueryOutcome,
};
use mpesa_payment_orchestrator::test_utils::{
    MockInvoiceClient, MockMpesaGateway, MockNotificationSender, MockPaymentStore,
    MockQueryBehavior,
};

struct TestContext {
    state: Arc<AppState>,
    store: Arc<MockPaymentStore>,
    gateway: Arc<MockMpesaGateway>,
    invoices: Arc<MockInvoiceClient>,
    notifications: Arc<MockNotificationSender>,
}

impl TestContext {
    fn new() -> Self {
        Self::with_payment_window(Duration::seconds(120))
    }

    fn with_payment_window(window: Duration) -> Self {
        let store = Arc::new(MockPaymentStore::new());
        let gateway = Arc::new(MockMpesaGateway::new());
        let invoices = Arc::new(MockInvoiceClient::new());
        let notifications = Arc::new(MockNotificationSender::new());
        let state = Arc::new(
            AppState::new(
                Arc::clone(&store) as _,
                Arc::clone(&gateway) as _,
                Arc::clone(&invoices) as _,
                Arc::clone(&notifications) as _,
            )
            .with_payment_window(window),
        );
        Self {
            state,
            store,
            gateway,
            invoices,
            notifications,
        }
    }

    async fn initiate(
        &self,
        payer_id: &str,
        amount: i64,
        invoice_ref: Option<&str>,
    ) -> PaymentRequest {
        let payload = InitiatePaymentRequest::new(
            "0712345678".to_string(),
            amount,
            invoice_ref.map(str::to_string),
        );
        self.state
            .service
            .initiate_payment(payer_id, &payload)
            .await
            .unwrap()
    }
}

fn success_callback(checkout_ref: &str, amount: i64, receipt: &str) -> StkCallback {
    StkCallback {
        merchant_request_id: "29115-34620561-1".to_string(),
        checkout_request_id: checkout_ref.to_string(),
        result_code: 0,
        result_desc: "The service request is processed successfully.".to_string(),
        callback_metadata: Some(CallbackMetadata {
            item: vec![
                MetadataItem {
                    name: "Amount".to_string(),
                    value: Some(serde_json::json!(amount)),
                },
                MetadataItem {
                    name: "MpesaReceiptNumber".to_string(),
                    value: Some(serde_json::json!(receipt)),
                },
                MetadataItem {
                    name: "TransactionDate".to_string(),
                    value: Some(serde_json::json!(20240822143022_i64)),
                },
                MetadataItem {
                    name: "PhoneNumber".to_string(),
                    value: Some(serde_json::json!(254712345678_i64)),
                },
            ],
        }),
    }
}

fn failure_callback(checkout_ref: &str, result_code: i32, result_desc: &str) -> StkCallback {
    StkCallback {
        merchant_request_id: "29115-34620561-1".to_string(),
        checkout_request_id: checkout_ref.to_string(),
        result_code,
        result_desc: result_desc.to_string(),
        callback_metadata: None,
    }
}

fn finalized_record(
    state: PaymentState,
    invoice_ref: Option<&str>,
    receipt: Option<&str>,
) -> PaymentRequest {
    let mut record = PaymentRequest::pending(
        "payer-1".to_string(),
        "254712345678".to_string(),
        250,
        invoice_ref.map(str::to_string),
        StkPushAck {
            checkout_ref: "ws_CO_SETTLE_1".to_string(),
            merchant_ref: "29115-34620561-1".to_string(),
            customer_message: "Success. Request accepted for processing".to_string(),
        },
        Duration::seconds(120),
    );
    record.state = state;
    record.receipt_ref = receipt.map(str::to_string);
    record.finalized_at = Some(Utc::now());
    record
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callbacks_settle_exactly_once() {
    let ctx = TestContext::new();
    ctx.invoices.seed_invoice("INV-42", "owner-9", 500);

    let created = ctx.initiate("payer-1", 500, Some("INV-42")).await;
    let callback = success_callback(&created.provider_checkout_ref, 500, "NLJ7RT61SV");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let service = Arc::clone(&ctx.state.service);
        let callback = callback.clone();
        handles.push(tokio::spawn(
            async move { service.handle_callback(&callback).await },
        ));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let record = ctx.store.get_payment(&created.id).await.unwrap().unwrap();
    assert_eq!(record.state, PaymentState::Succeeded);
    assert_eq!(record.receipt_ref.as_deref(), Some("NLJ7RT61SV"));
    assert!(record.finalized_at.is_some());

    // Exactly one settlement despite eight racing finalizers
    assert_eq!(ctx.invoices.mark_paid_calls().len(), 1);
    assert!(ctx.invoices.is_paid("INV-42"));
    assert_eq!(
        ctx.notifications.count_for_kind(NoticeKind::PaymentSucceeded),
        1
    );
    assert_eq!(ctx.notifications.count_for_kind(NoticeKind::InvoicePaid), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_callback_races_expiry_single_winner() {
    let ctx = TestContext::new();
    ctx.invoices.seed_invoice("INV-7", "owner-1", 500);

    let created = ctx.initiate("payer-1", 500, Some("INV-7")).await;
    let callback = success_callback(&created.provider_checkout_ref, 500, "NLJ7RT61SV");

    let service_a = Arc::clone(&ctx.state.service);
    let service_b = Arc::clone(&ctx.state.service);
    let payment_id = created.id.clone();

    let callback_task = tokio::spawn(async move { service_a.handle_callback(&callback).await });
    let expiry_task = tokio::spawn(async move { service_b.resolve_expiry(&payment_id).await });

    callback_task.await.unwrap().unwrap();
    expiry_task.await.unwrap().unwrap();

    let record = ctx.store.get_payment(&created.id).await.unwrap().unwrap();
    assert!(matches!(
        record.state,
        PaymentState::Succeeded | PaymentState::Expired
    ));

    // Whichever finalizer won, the loser produced no second settlement
    let succeeded = ctx.notifications.count_for_kind(NoticeKind::PaymentSucceeded);
    let expired = ctx.notifications.count_for_kind(NoticeKind::PaymentExpired);
    assert_eq!(succeeded + expired, 1);
    assert_eq!(
        ctx.invoices.is_paid("INV-7"),
        record.state == PaymentState::Succeeded
    );
}

#[tokio::test]
async fn test_callback_after_finalization_is_ignored() {
    let ctx = TestContext::new();
    let created = ctx.initiate("payer-1", 500, None).await;

    let first = success_callback(&created.provider_checkout_ref, 500, "NLJ7RT61SV");
    ctx.state.service.handle_callback(&first).await.unwrap();

    // A contradictory late delivery must not rewrite the terminal record
    let late = failure_callback(&created.provider_checkout_ref, 1032, "Request cancelled by user");
    ctx.state.service.handle_callback(&late).await.unwrap();

    let record = ctx.store.get_payment(&created.id).await.unwrap().unwrap();
    assert_eq!(record.state, PaymentState::Succeeded);
    assert_eq!(record.receipt_ref.as_deref(), Some("NLJ7RT61SV"));
    assert_eq!(
        ctx.notifications.count_for_kind(NoticeKind::PaymentSucceeded),
        1
    );
    assert_eq!(
        ctx.notifications.count_for_kind(NoticeKind::PaymentCancelled),
        0
    );
}

#[tokio::test]
async fn test_receipt_dropped_on_failure_outcome() {
    let ctx = TestContext::new();
    let created = ctx.initiate("payer-1", 500, None).await;

    // A failure delivery carrying stray metadata must not persist a receipt
    let mut callback = success_callback(&created.provider_checkout_ref, 500, "NLJ7RT61SV");
    callback.result_code = 1;
    callback.result_desc = "The balance is insufficient for the transaction".to_string();
    ctx.state.service.handle_callback(&callback).await.unwrap();

    let record = ctx.store.get_payment(&created.id).await.unwrap().unwrap();
    assert_eq!(record.state, PaymentState::Failed);
    assert!(record.receipt_ref.is_none());
    assert_eq!(record.result_code, Some(1));
}

#[tokio::test]
async fn test_success_phrase_overrides_nonzero_code() {
    let ctx = TestContext::new();
    let created = ctx.initiate("payer-1", 500, None).await;

    let callback = failure_callback(
        &created.provider_checkout_ref,
        8006,
        "The service request is processed successfully.",
    );
    ctx.state.service.handle_callback(&callback).await.unwrap();

    let record = ctx.store.get_payment(&created.id).await.unwrap().unwrap();
    assert_eq!(record.state, PaymentState::Succeeded);
    assert_eq!(record.result_code, Some(8006));
}

#[tokio::test]
async fn test_amount_mismatch_still_finalizes() {
    let ctx = TestContext::new();
    let created = ctx.initiate("payer-1", 500, None).await;

    // Confirmed amount differs from the request; logged, not rejected
    let callback = success_callback(&created.provider_checkout_ref, 400, "NLJ7RT61SV");
    ctx.state.service.handle_callback(&callback).await.unwrap();

    let record = ctx.store.get_payment(&created.id).await.unwrap().unwrap();
    assert_eq!(record.state, PaymentState::Succeeded);
}

#[tokio::test]
async fn test_unknown_checkout_ref_is_ignored() {
    let ctx = TestContext::new();
    let created = ctx.initiate("payer-1", 500, None).await;

    let callback = success_callback("ws_CO_UNKNOWN", 500, "NLJ7RT61SV");
    ctx.state.service.handle_callback(&callback).await.unwrap();

    let record = ctx.store.get_payment(&created.id).await.unwrap().unwrap();
    assert_eq!(record.state, PaymentState::Pending);
    assert!(ctx.notifications.sent_notices().is_empty());
}

#[tokio::test]
async fn test_watcher_expires_unanswered_payment() {
    let store = Arc::new(MockPaymentStore::new());
    let gateway = Arc::new(MockMpesaGateway::new());
    let invoices = Arc::new(MockInvoiceClient::new());
    let notifications = Arc::new(MockNotificationSender::new());

    let (scheduler, jobs) = ExpiryScheduler::new();
    let state = Arc::new(
        AppState::with_scheduler(
            Arc::clone(&store) as _,
            Arc::clone(&gateway) as _,
            Arc::clone(&invoices) as _,
            Arc::clone(&notifications) as _,
            scheduler,
        )
        .with_payment_window(Duration::milliseconds(50)),
    );

    let (_handle, shutdown) = spawn_expiry_watcher(Arc::clone(&state.service), jobs);

    let payload = InitiatePaymentRequest::new("0712345678".to_string(), 500, None);
    let created = state
        .service
        .initiate_payment("payer-1", &payload)
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(400)).await;

    let record = store.get_payment(&created.id).await.unwrap().unwrap();
    assert_eq!(record.state, PaymentState::Expired);
    assert!(record.finalized_at.is_some());
    assert_eq!(notifications.count_for_kind(NoticeKind::PaymentExpired), 1);

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn test_watcher_leaves_answered_payment_alone() {
    let store = Arc::new(MockPaymentStore::new());
    let gateway = Arc::new(MockMpesaGateway::new());
    let invoices = Arc::new(MockInvoiceClient::new());
    let notifications = Arc::new(MockNotificationSender::new());

    let (scheduler, jobs) = ExpiryScheduler::new();
    let state = Arc::new(
        AppState::with_scheduler(
            Arc::clone(&store) as _,
            Arc::clone(&gateway) as _,
            Arc::clone(&invoices) as _,
            Arc::clone(&notifications) as _,
            scheduler,
        )
        .with_payment_window(Duration::milliseconds(150)),
    );

    let (_handle, shutdown) = spawn_expiry_watcher(Arc::clone(&state.service), jobs);

    let payload = InitiatePaymentRequest::new("0712345678".to_string(), 500, None);
    let created = state
        .service
        .initiate_payment("payer-1", &payload)
        .await
        .unwrap();

    // Answer before the deadline, then let the watcher task fire into a
    // record that is already terminal
    let callback = success_callback(&created.provider_checkout_ref, 500, "NLJ7RT61SV");
    state.service.handle_callback(&callback).await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    let record = store.get_payment(&created.id).await.unwrap().unwrap();
    assert_eq!(record.state, PaymentState::Succeeded);
    assert_eq!(notifications.count_for_kind(NoticeKind::PaymentSucceeded), 1);
    assert_eq!(notifications.count_for_kind(NoticeKind::PaymentExpired), 0);

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn test_sweep_expired_resolves_overdue_batch() {
    let ctx = TestContext::with_payment_window(Duration::milliseconds(1));

    for _ in 0..3 {
        ctx.initiate("payer-1", 100, None).await;
    }
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let resolved = ctx.state.service.sweep_expired(10).await.unwrap();
    assert_eq!(resolved, 3);

    for record in ctx.store.get_all_records() {
        assert_eq!(record.state, PaymentState::Expired);
    }
    assert_eq!(ctx.notifications.count_for_kind(NoticeKind::PaymentExpired), 3);

    // A second sweep finds nothing left to resolve
    let resolved = ctx.state.service.sweep_expired(10).await.unwrap();
    assert_eq!(resolved, 0);
}

#[tokio::test]
async fn test_sweeper_task_recovers_overdue_payment() {
    let ctx = TestContext::with_payment_window(Duration::milliseconds(1));

    // The scheduler is detached, so only the sweeper can resolve this record
    let created = ctx.initiate("payer-1", 500, None).await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let config = SweeperConfig {
        interval_secs: 1,
        batch_size: 10,
        enabled: true,
    };
    let (_handle, shutdown) = spawn_sweeper(config, Arc::clone(&ctx.state.service));

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    let record = ctx.store.get_payment(&created.id).await.unwrap().unwrap();
    assert_eq!(record.state, PaymentState::Expired);

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn test_settlement_idempotent_on_rerun() {
    let invoices = Arc::new(MockInvoiceClient::new());
    invoices.seed_invoice("INV-7", "owner-1", 250);
    let notifications = Arc::new(MockNotificationSender::new());
    let notifier = SettlementNotifier::new(
        Arc::clone(&invoices) as _,
        Arc::clone(&notifications) as _,
    );

    let record = finalized_record(PaymentState::Succeeded, Some("INV-7"), Some("QWE123"));
    notifier.settle(&record).await;
    notifier.settle(&record).await;

    // Both collaborators absorb the duplicate: the invoice flips once and
    // neither recipient hears about this payment twice
    assert!(invoices.is_paid("INV-7"));
    assert_eq!(invoices.mark_paid_calls().len(), 2);
    assert_eq!(notifications.count_for_kind(NoticeKind::PaymentSucceeded), 1);
    assert_eq!(notifications.count_for_kind(NoticeKind::InvoicePaid), 1);
}

#[tokio::test]
async fn test_settlement_skips_invoice_for_failed_payment() {
    let invoices = Arc::new(MockInvoiceClient::new());
    invoices.seed_invoice("INV-7", "owner-1", 250);
    let notifications = Arc::new(MockNotificationSender::new());
    let notifier = SettlementNotifier::new(
        Arc::clone(&invoices) as _,
        Arc::clone(&notifications) as _,
    );

    let mut record = finalized_record(PaymentState::Failed, Some("INV-7"), None);
    record.result_detail = Some("The balance is insufficient for the transaction".to_string());
    notifier.settle(&record).await;

    assert!(!invoices.is_paid("INV-7"));
    assert!(invoices.mark_paid_calls().is_empty());
    assert_eq!(notifications.count_for_kind(NoticeKind::PaymentFailed), 1);
    assert_eq!(notifications.count_for_kind(NoticeKind::InvoicePaid), 0);
}

#[tokio::test]
async fn test_already_paid_invoice_settles_without_owner_notice() {
    let invoices = Arc::new(MockInvoiceClient::new());
    invoices.seed_invoice("INV-7", "owner-1", 250);
    let notifications = Arc::new(MockNotificationSender::new());

    // Another payment settled the invoice first
    use mpesa_payment_orchestrator::domain::InvoiceClient;
    invoices.mark_paid("INV-7", "other-payment", 250).await.unwrap();

    let notifier = SettlementNotifier::new(
        Arc::clone(&invoices) as _,
        Arc::clone(&notifications) as _,
    );
    let record = finalized_record(PaymentState::Succeeded, Some("INV-7"), Some("QWE123"));
    notifier.settle(&record).await;

    // The payer still hears about their successful payment, but the owner
    // gets no second invoice-paid notice
    assert_eq!(notifications.count_for_kind(NoticeKind::PaymentSucceeded), 1);
    assert_eq!(notifications.count_for_kind(NoticeKind::InvoicePaid), 0);
}

#[tokio::test]
async fn test_retry_creates_linked_record() {
    let ctx = TestContext::new();
    let created = ctx.initiate("payer-1", 500, Some("INV-42")).await;

    let callback = failure_callback(
        &created.provider_checkout_ref,
        1,
        "The balance is insufficient for the transaction",
    );
    ctx.state.service.handle_callback(&callback).await.unwrap();

    let replacement = ctx
        .state
        .service
        .retry_payment("payer-1", &created.id)
        .await
        .unwrap();

    assert_ne!(replacement.id, created.id);
    assert_eq!(replacement.state, PaymentState::Pending);
    assert_eq!(replacement.retry_of.as_deref(), Some(created.id.as_str()));
    assert_eq!(replacement.phone, created.phone);
    assert_eq!(replacement.amount, created.amount);
    assert_eq!(replacement.invoice_ref, created.invoice_ref);

    // The original terminal record is untouched
    let original = ctx.store.get_payment(&created.id).await.unwrap().unwrap();
    assert_eq!(original.state, PaymentState::Failed);
    assert!(original.retry_of.is_none());
}

#[tokio::test]
async fn test_retry_of_pending_payment_rejected() {
    let ctx = TestContext::new();
    let created = ctx.initiate("payer-1", 500, None).await;

    let err = ctx
        .state
        .service
        .retry_payment("payer-1", &created.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotRetryable(_)));
}

#[tokio::test]
async fn test_retry_of_succeeded_payment_rejected() {
    let ctx = TestContext::new();
    let created = ctx.initiate("payer-1", 500, None).await;

    let callback = success_callback(&created.provider_checkout_ref, 500, "NLJ7RT61SV");
    ctx.state.service.handle_callback(&callback).await.unwrap();

    let err = ctx
        .state
        .service
        .retry_payment("payer-1", &created.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotRetryable(_)));
}

#[tokio::test]
async fn test_retry_by_different_payer_rejected() {
    let ctx = TestContext::new();
    let created = ctx.initiate("payer-1", 500, None).await;

    let callback = failure_callback(&created.provider_checkout_ref, 1032, "Request cancelled by user");
    ctx.state.service.handle_callback(&callback).await.unwrap();

    let err = ctx
        .state
        .service
        .retry_payment("payer-2", &created.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotAuthorized(_)));
}

#[tokio::test]
async fn test_push_normalizes_msisdn_and_applies_window() {
    let ctx = TestContext::new();
    let created = ctx.initiate("payer-1", 500, None).await;

    let pushes = ctx.gateway.pushed_requests();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].phone, "254712345678");
    assert_eq!(pushes[0].amount, 500);
    // Without an invoice the payer identity is the account reference
    assert_eq!(pushes[0].account_reference, "payer-1");

    let window = created.expires_at - created.created_at;
    assert_eq!(window.num_seconds(), 120);
}

#[tokio::test]
async fn test_push_uses_invoice_as_account_reference() {
    let ctx = TestContext::new();
    ctx.initiate("payer-1", 500, Some("INV-2024-0042")).await;

    let pushes = ctx.gateway.pushed_requests();
    assert_eq!(pushes[0].account_reference, "INV-2024-0042");
    assert_eq!(pushes[0].invoice_ref.as_deref(), Some("INV-2024-0042"));
}

#[tokio::test]
async fn test_status_poll_expires_overdue_record_without_provider_query() {
    let ctx = TestContext::with_payment_window(Duration::milliseconds(1));
    let created = ctx.initiate("payer-1", 500, None).await;

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let record = ctx
        .state
        .service
        .check_status(&created.provider_checkout_ref)
        .await
        .unwrap();
    assert_eq!(record.state, PaymentState::Expired);
    assert!(record.result_code.is_none());

    // The deadline had passed, so no provider round-trip was made
    assert!(ctx.gateway.queried_refs().is_empty());
    assert_eq!(ctx.notifications.count_for_kind(NoticeKind::PaymentExpired), 1);
}

#[tokio::test]
async fn test_status_poll_absorbs_unreachable_provider() {
    let ctx = TestContext::new();
    let created = ctx.initiate("payer-1", 500, None).await;

    ctx.gateway
        .set_query_behavior(MockQueryBehavior::Unreachable("connection reset".to_string()));

    let record = ctx
        .state
        .service
        .check_status(&created.provider_checkout_ref)
        .await
        .unwrap();

    // Provider trouble is not a payment outcome
    assert_eq!(record.state, PaymentState::Pending);
    assert_eq!(ctx.gateway.queried_refs().len(), 1);
    assert!(ctx.notifications.sent_notices().is_empty());
}

#[tokio::test]
async fn test_status_poll_finalizes_on_definitive_answer() {
    let ctx = TestContext::new();
    let created = ctx.initiate("payer-1", 500, None).await;

    ctx.gateway
        .set_query_behavior(MockQueryBehavior::Answer(StkQueryOutcome {
            result_code: 1032,
            result_desc: "Request cancelled by user".to_string(),
        }));

    let record = ctx
        .state
        .service
        .check_status(&created.provider_checkout_ref)
        .await
        .unwrap();

    assert_eq!(record.state, PaymentState::Cancelled);
    assert!(record.receipt_ref.is_none());
    assert_eq!(
        ctx.notifications.count_for_kind(NoticeKind::PaymentCancelled),
        1
    );
}

#[tokio::test]
async fn test_invoice_settled_end_to_end() {
    let ctx = TestContext::new();
    ctx.invoices.seed_invoice("INV-2024-0042", "owner-1", 500);

    let created = ctx.initiate("payer-1", 500, Some("INV-2024-0042")).await;
    let callback = success_callback(&created.provider_checkout_ref, 500, "QWE123");
    ctx.state.service.handle_callback(&callback).await.unwrap();

    assert!(ctx.invoices.is_paid("INV-2024-0042"));

    let notices = ctx.notifications.sent_notices();
    let payer_notice = notices
        .iter()
        .find(|n| n.kind == NoticeKind::PaymentSucceeded)
        .unwrap();
    assert_eq!(payer_notice.recipient_id, "payer-1");
    assert!(payer_notice.body.contains("QWE123"));

    let owner_notice = notices
        .iter()
        .find(|n| n.kind == NoticeKind::InvoicePaid)
        .unwrap();
    assert_eq!(owner_notice.recipient_id, "owner-1");
    assert!(owner_notice.body.contains("INV-2024-0042"));
}
