//! Type-safe cache key builders

use std::fmt;

pub const VERSION: &str = "v1";

pub mod inquiry {
    use super::*;

    pub const NAMESPACE: &str = "inquiry";

    /// Inquiry looked up by its own `INQ-...` transaction id.
    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub struct TransactionKey {
        pub transaction_id: String,
    }

    impl TransactionKey {
        pub fn new(transaction_id: impl Into<String>) -> Self {
            Self {
                transaction_id: transaction_id.into(),
            }
        }
    }

    impl fmt::Display for TransactionKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}:{}:trx:{}", VERSION, NAMESPACE, self.transaction_id)
        }
    }

    /// Inquiry looked up by what the client sends again on payment.
    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub struct CompositeKey {
        pub client_id: i64,
        pub customer_no: String,
        pub product_code: String,
        pub reference_id: String,
    }

    impl CompositeKey {
        pub fn new(
            client_id: i64,
            customer_no: impl Into<String>,
            product_code: impl Into<String>,
            reference_id: impl Into<String>,
        ) -> Self {
            Self {
                client_id,
                customer_no: customer_no.into(),
                product_code: product_code.into(),
                reference_id: reference_id.into(),
            }
        }
    }

    impl fmt::Display for CompositeKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{}:{}:ref:{}:{}:{}:{}",
                VERSION,
                NAMESPACE,
                self.client_id,
                self.customer_no,
                self.product_code,
                self.reference_id
            )
        }
    }
}
