use crate::payments::error::ProviderResult;
use crate::payments::rc::Outcome;
use crate::payments::types::{
    ParsedCallback, PriceListItem, ProviderRequest, ProviderResponse, StatusQuery,
    TransactionType, WebhookVerificationResult,
};
use async_trait::async_trait;

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn topup(&self, request: &ProviderRequest) -> ProviderResult<ProviderResponse>;

    async fn inquiry(&self, request: &ProviderRequest) -> ProviderResult<ProviderResponse>;

    async fn payment(&self, request: &ProviderRequest) -> ProviderResult<ProviderResponse>;

    /// Idempotent: reports the current state for `query.ref_id`, never creates work.
    async fn check_status(&self, query: &StatusQuery) -> ProviderResult<ProviderResponse>;

    async fn price_list(&self, category: &str) -> ProviderResult<Vec<PriceListItem>>;

    /// Provider code as stored in the catalog (`providers.code`).
    fn code(&self) -> &str;

    /// Live health flag; `false` takes the provider out of routing.
    fn is_healthy(&self) -> bool;

    fn classify(&self, rc: &str) -> Outcome;

    fn verify_callback(&self, payload: &[u8], signature: Option<&str>)
        -> WebhookVerificationResult;

    fn parse_callback(&self, payload: &[u8]) -> ProviderResult<ParsedCallback>;

    /// Header carrying the callback signature, if the provider signs callbacks.
    fn callback_signature_header(&self) -> Option<&'static str> {
        None
    }
}

/// Dispatch a routed request to the operation matching its transaction type.
pub async fn invoke(
    adapter: &dyn ProviderAdapter,
    transaction_type: TransactionType,
    request: &ProviderRequest,
) -> ProviderResult<ProviderResponse> {
    match transaction_type {
        TransactionType::Prepaid => adapter.topup(request).await,
        TransactionType::Inquiry => adapter.inquiry(request).await,
        TransactionType::Payment => adapter.payment(request).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::rc::digiflazz_table;
    use std::sync::Mutex;

    struct RecordingAdapter {
        calls: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl ProviderAdapter for RecordingAdapter {
        async fn topup(&self, request: &ProviderRequest) -> ProviderResult<ProviderResponse> {
            self.calls.lock().unwrap().push("topup");
            Ok(ProviderResponse {
                ref_id: request.ref_id.clone(),
                rc: "00".to_string(),
                ..Default::default()
            })
        }

        async fn inquiry(&self, request: &ProviderRequest) -> ProviderResult<ProviderResponse> {
            self.calls.lock().unwrap().push("inquiry");
            Ok(ProviderResponse {
                ref_id: request.ref_id.clone(),
                rc: "00".to_string(),
                ..Default::default()
            })
        }

        async fn payment(&self, request: &ProviderRequest) -> ProviderResult<ProviderResponse> {
            self.calls.lock().unwrap().push("payment");
            Ok(ProviderResponse {
                ref_id: request.ref_id.clone(),
                rc: "03".to_string(),
                ..Default::default()
            })
        }

        async fn check_status(&self, query: &StatusQuery) -> ProviderResult<ProviderResponse> {
            Ok(ProviderResponse {
                ref_id: query.ref_id.clone(),
                rc: "00".to_string(),
                ..Default::default()
            })
        }

        async fn price_list(&self, _category: &str) -> ProviderResult<Vec<PriceListItem>> {
            Ok(Vec::new())
        }

        fn code(&self) -> &str {
            "recording"
        }

        fn is_healthy(&self) -> bool {
            true
        }

        fn classify(&self, rc: &str) -> Outcome {
            digiflazz_table().classify(rc)
        }

        fn verify_callback(
            &self,
            _payload: &[u8],
            _signature: Option<&str>,
        ) -> WebhookVerificationResult {
            WebhookVerificationResult {
                valid: true,
                reason: None,
            }
        }

        fn parse_callback(&self, _payload: &[u8]) -> ProviderResult<ParsedCallback> {
            Ok(ParsedCallback {
                ref_id: "TRX-1".to_string(),
                rc: Some("00".to_string()),
                status: None,
                message: None,
                serial_number: None,
                price: None,
            })
        }
    }

    fn request() -> ProviderRequest {
        ProviderRequest {
            sku_code: "xld10".to_string(),
            customer_no: "087800001234".to_string(),
            ref_id: "TRX-20260101-000001".to_string(),
            sandbox: true,
        }
    }

    #[tokio::test]
    async fn invoke_routes_by_transaction_type() {
        let adapter = RecordingAdapter {
            calls: Mutex::new(Vec::new()),
        };

        invoke(&adapter, TransactionType::Prepaid, &request())
            .await
            .unwrap();
        invoke(&adapter, TransactionType::Inquiry, &request())
            .await
            .unwrap();
        let paid = invoke(&adapter, TransactionType::Payment, &request())
            .await
            .unwrap();

        assert_eq!(
            *adapter.calls.lock().unwrap(),
            vec!["topup", "inquiry", "payment"]
        );
        assert_eq!(adapter.classify(&paid.rc), Outcome::Pending);
        assert_eq!(paid.ref_id, "TRX-20260101-000001");
    }
}
