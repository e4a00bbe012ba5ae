//! HTTP-based integration tests for the Daraja gateway.
//!
//! Uses `wiremock` to mock the Safaricom API for testing the OAuth token
//! lifecycle, STK push acceptance and refusal, and status query outcomes.

use secrecy::SecretString;
use serde_json::json;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{basic_auth, bearer_token, body_partial_json, method, path, query_param},
};

use mpesa_payment_orchestrator::domain::{
    AppError, MpesaGateway, ProviderError, StkPushRequest,
};
use mpesa_payment_orchestrator::infra::{DarajaGateway, MpesaConfig};

fn gateway_for(mock_server: &MockServer) -> DarajaGateway {
    DarajaGateway::new(MpesaConfig {
        base_url: mock_server.uri(),
        consumer_key: Some("test_consumer_key".to_string()),
        consumer_secret: Some(SecretString::from("test_consumer_secret")),
        shortcode: "174379".to_string(),
        passkey: SecretString::from("test_passkey"),
        callback_url: "https://pay.example.com/payments/callback".to_string(),
        request_timeout: std::time::Duration::from_secs(5),
    })
}

fn push_request(invoice_ref: Option<&str>) -> StkPushRequest {
    StkPushRequest {
        phone: "254712345678".to_string(),
        amount: 500,
        account_reference: invoice_ref.unwrap_or("payer-1").to_string(),
        description: "Payment".to_string(),
        invoice_ref: invoice_ref.map(str::to_string),
    }
}

/// Mount the OAuth endpoint, asserting it is hit exactly `expect` times
async fn mount_oauth(mock_server: &MockServer, token: &str, expect: u64) {
    Mock::given(method("GET"))
        .and(path("/oauth/v1/generate"))
        .and(query_param("grant_type", "client_credentials"))
        .and(basic_auth("test_consumer_key", "test_consumer_secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": token,
            // Daraja reports the lifetime as a string
            "expires_in": "3599"
        })))
        .expect(expect)
        .mount(mock_server)
        .await;
}

fn push_accepted_body() -> serde_json::Value {
    json!({
        "MerchantRequestID": "29115-34620561-1",
        "CheckoutRequestID": "ws_CO_191220191020363925",
        "ResponseCode": "0",
        "ResponseDescription": "Success. Request accepted for processing",
        "CustomerMessage": "Success. Request accepted for processing"
    })
}

// ============================================================================
// STK PUSH TESTS
// ============================================================================

mod push_tests {
    use super::*;

    #[tokio::test]
    async fn test_push_success_with_oauth_handshake() {
        let mock_server = MockServer::start().await;
        mount_oauth(&mock_server, "token-1", 1).await;

        Mock::given(method("POST"))
            .and(path("/mpesa/stkpush/v1/processrequest"))
            .and(bearer_token("token-1"))
            .and(body_partial_json(json!({
                "BusinessShortCode": "174379",
                "TransactionType": "CustomerPayBillOnline",
                "PhoneNumber": "254712345678",
                "PartyB": "174379",
                "Amount": 500
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(push_accepted_body()))
            .expect(1)
            .mount(&mock_server)
            .await;

        let gateway = gateway_for(&mock_server);
        let ack = gateway.initiate_push(&push_request(None)).await.unwrap();

        assert_eq!(ack.checkout_ref, "ws_CO_191220191020363925");
        assert_eq!(ack.merchant_ref, "29115-34620561-1");
        assert_eq!(ack.customer_message, "Success. Request accepted for processing");
    }

    #[tokio::test]
    async fn test_token_cached_across_pushes() {
        let mock_server = MockServer::start().await;
        // Two pushes, one token fetch
        mount_oauth(&mock_server, "token-1", 1).await;

        Mock::given(method("POST"))
            .and(path("/mpesa/stkpush/v1/processrequest"))
            .and(bearer_token("token-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(push_accepted_body()))
            .expect(2)
            .mount(&mock_server)
            .await;

        let gateway = gateway_for(&mock_server);
        gateway.initiate_push(&push_request(None)).await.unwrap();
        gateway.initiate_push(&push_request(None)).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_token_refreshed_and_retried() {
        let mock_server = MockServer::start().await;
        // Initial fetch plus the refresh after the 401
        mount_oauth(&mock_server, "token-1", 2).await;

        // First delivery attempt bounces off an expired server-side session
        Mock::given(method("POST"))
            .and(path("/mpesa/stkpush/v1/processrequest"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "requestId": "16813-15-1",
                "errorCode": "404.001.04",
                "errorMessage": "Invalid Access Token"
            })))
            .up_to_n_times(1)
            .expect(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .and(path("/mpesa/stkpush/v1/processrequest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(push_accepted_body()))
            .expect(1)
            .mount(&mock_server)
            .await;

        let gateway = gateway_for(&mock_server);
        let ack = gateway.initiate_push(&push_request(None)).await.unwrap();
        assert_eq!(ack.checkout_ref, "ws_CO_191220191020363925");
    }

    #[tokio::test]
    async fn test_push_refused_synchronously() {
        let mock_server = MockServer::start().await;
        mount_oauth(&mock_server, "token-1", 1).await;

        Mock::given(method("POST"))
            .and(path("/mpesa/stkpush/v1/processrequest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": "ws_CO_191220191020363925",
                "ResponseCode": "1",
                "ResponseDescription": "The balance is insufficient for the transaction",
                "CustomerMessage": ""
            })))
            .mount(&mock_server)
            .await;

        let gateway = gateway_for(&mock_server);
        let err = gateway.initiate_push(&push_request(None)).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Provider(ProviderError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_push_error_envelope_maps_to_rejected() {
        let mock_server = MockServer::start().await;
        mount_oauth(&mock_server, "token-1", 1).await;

        Mock::given(method("POST"))
            .and(path("/mpesa/stkpush/v1/processrequest"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "requestId": "16813-15-1",
                "errorCode": "400.002.02",
                "errorMessage": "Bad Request - Invalid PhoneNumber"
            })))
            .mount(&mock_server)
            .await;

        let gateway = gateway_for(&mock_server);
        let err = gateway.initiate_push(&push_request(None)).await.unwrap_err();
        match err {
            AppError::Provider(ProviderError::Rejected(message)) => {
                assert!(message.contains("Invalid PhoneNumber"));
            }
            other => panic!("Expected Rejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_push_server_error_maps_to_unreachable() {
        let mock_server = MockServer::start().await;
        mount_oauth(&mock_server, "token-1", 1).await;

        Mock::given(method("POST"))
            .and(path("/mpesa/stkpush/v1/processrequest"))
            .respond_with(ResponseTemplate::new(503).set_body_string("Service Unavailable"))
            .mount(&mock_server)
            .await;

        let gateway = gateway_for(&mock_server);
        let err = gateway.initiate_push(&push_request(None)).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Provider(ProviderError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_push_payload_carries_invoice_ref_and_password() {
        let mock_server = MockServer::start().await;
        mount_oauth(&mock_server, "token-1", 1).await;

        Mock::given(method("POST"))
            .and(path("/mpesa/stkpush/v1/processrequest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(push_accepted_body()))
            .mount(&mock_server)
            .await;

        let gateway = gateway_for(&mock_server);
        gateway
            .initiate_push(&push_request(Some("INV-9")))
            .await
            .unwrap();

        let requests = mock_server.received_requests().await.unwrap();
        let push = requests
            .iter()
            .find(|r| r.url.path() == "/mpesa/stkpush/v1/processrequest")
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&push.body).unwrap();

        // The invoice reference rides the callback URL back to us
        assert!(
            body["CallBackURL"]
                .as_str()
                .unwrap()
                .ends_with("?invoiceRef=INV-9")
        );
        assert_eq!(body["AccountReference"], "INV-9");

        // Password is regenerated per call from the compact timestamp
        assert!(!body["Password"].as_str().unwrap().is_empty());
        let timestamp = body["Timestamp"].as_str().unwrap();
        assert_eq!(timestamp.len(), 14);
        assert!(timestamp.chars().all(|c| c.is_ascii_digit()));
    }
}

// ============================================================================
// OAUTH TESTS
// ============================================================================

mod oauth_tests {
    use super::*;

    #[tokio::test]
    async fn test_oauth_rejection_maps_to_credential_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/oauth/v1/generate"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "requestId": "16813-15-1",
                "errorCode": "999991",
                "errorMessage": "Invalid client id passed"
            })))
            .mount(&mock_server)
            .await;

        let gateway = gateway_for(&mock_server);
        let err = gateway.initiate_push(&push_request(None)).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Provider(ProviderError::Credential(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_maps_to_unreachable() {
        let gateway = DarajaGateway::new(MpesaConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            consumer_key: Some("test_consumer_key".to_string()),
            consumer_secret: Some(SecretString::from("test_consumer_secret")),
            request_timeout: std::time::Duration::from_secs(1),
            ..MpesaConfig::default()
        });

        let err = gateway.initiate_push(&push_request(None)).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Provider(ProviderError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_health_check_fetches_token() {
        let mock_server = MockServer::start().await;
        mount_oauth(&mock_server, "token-1", 1).await;

        let gateway = gateway_for(&mock_server);
        gateway.health_check().await.unwrap();
    }
}

// ============================================================================
// STATUS QUERY TESTS
// ============================================================================

mod query_tests {
    use super::*;

    #[tokio::test]
    async fn test_query_definitive_answer_with_string_result_code() {
        let mock_server = MockServer::start().await;
        mount_oauth(&mock_server, "token-1", 1).await;

        // The query API reports ResultCode as a string, unlike the callback
        Mock::given(method("POST"))
            .and(path("/mpesa/stkpushquery/v1/query"))
            .and(body_partial_json(json!({
                "BusinessShortCode": "174379",
                "CheckoutRequestID": "ws_CO_191220191020363925"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ResponseCode": "0",
                "ResponseDescription": "The service request has been accepted successsfully",
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": "ws_CO_191220191020363925",
                "ResultCode": "1032",
                "ResultDesc": "Request cancelled by user"
            })))
            .mount(&mock_server)
            .await;

        let gateway = gateway_for(&mock_server);
        let outcome = gateway
            .query_status("ws_CO_191220191020363925")
            .await
            .unwrap();
        assert_eq!(outcome.result_code, 1032);
        assert_eq!(outcome.result_desc, "Request cancelled by user");
    }

    #[tokio::test]
    async fn test_query_numeric_result_code_tolerated() {
        let mock_server = MockServer::start().await;
        mount_oauth(&mock_server, "token-1", 1).await;

        Mock::given(method("POST"))
            .and(path("/mpesa/stkpushquery/v1/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ResponseCode": "0",
                "ResponseDescription": "The service request has been accepted successsfully",
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": "ws_CO_191220191020363925",
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully."
            })))
            .mount(&mock_server)
            .await;

        let gateway = gateway_for(&mock_server);
        let outcome = gateway
            .query_status("ws_CO_191220191020363925")
            .await
            .unwrap();
        assert_eq!(outcome.result_code, 0);
    }

    #[tokio::test]
    async fn test_query_still_processing_maps_to_no_answer() {
        let mock_server = MockServer::start().await;
        mount_oauth(&mock_server, "token-1", 1).await;

        // "Still processing" ships under HTTP 500 and must not be mistaken
        // for an outage
        Mock::given(method("POST"))
            .and(path("/mpesa/stkpushquery/v1/query"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "requestId": "16813-15-1",
                "errorCode": "500.001.1001",
                "errorMessage": "The transaction is being processed"
            })))
            .mount(&mock_server)
            .await;

        let gateway = gateway_for(&mock_server);
        let err = gateway
            .query_status("ws_CO_191220191020363925")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Provider(ProviderError::NoAnswer(_))
        ));
    }

    #[tokio::test]
    async fn test_query_server_error_maps_to_unreachable() {
        let mock_server = MockServer::start().await;
        mount_oauth(&mock_server, "token-1", 1).await;

        Mock::given(method("POST"))
            .and(path("/mpesa/stkpushquery/v1/query"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "requestId": "16813-15-1",
                "errorCode": "500.003.02",
                "errorMessage": "Error occurred: Quota violation"
            })))
            .mount(&mock_server)
            .await;

        let gateway = gateway_for(&mock_server);
        let err = gateway
            .query_status("ws_CO_191220191020363925")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Provider(ProviderError::Unreachable(_))
        ));
    }
}
