use crate::database::repository::{DbResult, TransactionStore};
use crate::payments::types::TransactionType;
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdPrefixes {
    pub prepaid: String,
    pub inquiry: String,
    pub payment: String,
}

impl Default for IdPrefixes {
    fn default() -> Self {
        Self {
            prepaid: "TRX".to_string(),
            inquiry: "INQ".to_string(),
            payment: "PAY".to_string(),
        }
    }
}

impl IdPrefixes {
    pub fn for_type(&self, transaction_type: TransactionType) -> &str {
        match transaction_type {
            TransactionType::Prepaid => &self.prepaid,
            TransactionType::Inquiry => &self.inquiry,
            TransactionType::Payment => &self.payment,
        }
    }
}

/// `PFX-YYYYMMDD-NNNNNN`
pub fn format_transaction_id(prefix: &str, date: NaiveDate, sequence: i64) -> String {
    format!("{}-{}-{:06}", prefix, date.format("%Y%m%d"), sequence)
}

/// Public transaction ids with a sequence that restarts every business day.
pub struct TransactionIdGenerator {
    store: Arc<dyn TransactionStore>,
    prefixes: IdPrefixes,
    offset: FixedOffset,
}

impl TransactionIdGenerator {
    pub fn new(store: Arc<dyn TransactionStore>, prefixes: IdPrefixes, offset: FixedOffset) -> Self {
        Self {
            store,
            prefixes,
            offset,
        }
    }

    pub async fn next(
        &self,
        transaction_type: TransactionType,
        now: DateTime<Utc>,
    ) -> DbResult<String> {
        let prefix = self.prefixes.for_type(transaction_type);
        let date = now.with_timezone(&self.offset).date_naive();
        let sequence = self.store.next_daily_sequence(prefix, date).await?;
        Ok(format_transaction_id(prefix, date, sequence))
    }
}
