use chrono::Utc;
use mpesa_payment_orchestrator::domain::types::{
    CallbackMetadata, MPESA_RESULT_INSUFFICIENT_FUNDS, MPESA_RESULT_SUCCESS,
    MPESA_RESULT_USER_CANCELLED, MetadataItem, StkCallback, StkCallbackBody, StkCallbackEnvelope,
};
use uuid::Uuid;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let is_cancel = args.iter().any(|arg| arg == "--cancel");
    let is_insufficient = args.iter().any(|arg| arg == "--insufficient");

    // 1. Pick the checkout ref the callback settles (first positional arg,
    //    or a recognisable placeholder)
    let checkout_ref = args
        .iter()
        .skip(1)
        .find(|arg| !arg.starts_with("--"))
        .cloned()
        .unwrap_or_else(|| "ws_CO_191220191020363925".to_string());

    let merchant_ref = format!("29115-34620561-{}", &Uuid::new_v4().simple().to_string()[..4]);

    // 2. Build the scenario
    let (result_code, result_desc) = if is_cancel {
        (
            MPESA_RESULT_USER_CANCELLED,
            "Request cancelled by user".to_string(),
        )
    } else if is_insufficient {
        (
            MPESA_RESULT_INSUFFICIENT_FUNDS,
            "The balance is insufficient for the transaction".to_string(),
        )
    } else {
        (
            MPESA_RESULT_SUCCESS,
            "The service request is processed successfully.".to_string(),
        )
    };

    // Success deliveries carry the settlement metadata; failures carry none
    let callback_metadata = if result_code == MPESA_RESULT_SUCCESS {
        let receipt = format!(
            "N{}",
            Uuid::new_v4().simple().to_string()[..9].to_uppercase()
        );
        let transaction_date: i64 = Utc::now()
            .format("%Y%m%d%H%M%S")
            .to_string()
            .parse()
            .unwrap();
        Some(CallbackMetadata {
            item: vec![
                MetadataItem {
                    name: "Amount".to_string(),
                    value: Some(serde_json::json!(500)),
                },
                MetadataItem {
                    name: "MpesaReceiptNumber".to_string(),
                    value: Some(serde_json::json!(receipt)),
                },
                MetadataItem {
                    name: "TransactionDate".to_string(),
                    value: Some(serde_json::json!(transaction_date)),
                },
                MetadataItem {
                    name: "PhoneNumber".to_string(),
                    value: Some(serde_json::json!(254712345678_i64)),
                },
            ],
        })
    } else {
        None
    };

    // 3. Assemble the envelope exactly as Daraja delivers it
    let envelope = StkCallbackEnvelope {
        body: StkCallbackBody {
            stk_callback: StkCallback {
                merchant_request_id: merchant_ref,
                checkout_request_id: checkout_ref.clone(),
                result_code,
                result_desc,
                callback_metadata,
            },
        },
    };

    println!(" Simulated Daraja callback:");
    println!(" Checkout ref: {}", checkout_ref);
    println!(" Result code:  {}", result_code);
    println!("\n--------------------------------------------------\n");

    // 4. Generate the curl command
    let json_body = serde_json::to_string_pretty(&envelope).unwrap();

    let curl_cmd = format!(
        "curl -X POST 'http://localhost:3000/payments/callback' \\\n  -H 'Content-Type: application/json' \\\n  -d '{}'",
        json_body
    );

    println!("Generated curl command:\n");
    println!("{}", curl_cmd);
}
