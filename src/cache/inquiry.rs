use super::error::{CacheError, CacheResult};
use super::keys::inquiry::{CompositeKey, TransactionKey};
use async_trait::async_trait;
use chrono::{DateTime, Days, FixedOffset, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// A bill inquiry waiting for its payment. Never written to the database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedInquiry {
    pub transaction_id: String,
    pub client_id: i64,
    pub reference_id: String,
    pub customer_no: String,
    pub customer_name: Option<String>,
    pub product_id: i64,
    pub product_code: String,
    pub provider_id: Option<i64>,
    pub provider_code: String,
    pub provider_sku_code: String,
    pub sku_id: Option<i64>,
    /// Token the upstream saw on inquiry; the payment reuses it.
    pub provider_ref_id: String,
    pub amount: i64,
    pub admin: i64,
    pub buy_price: i64,
    pub sell_price: i64,
    pub is_sandbox: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CachedInquiry {
    pub fn composite_key(&self) -> CompositeKey {
        CompositeKey::new(
            self.client_id,
            self.customer_no.clone(),
            self.product_code.clone(),
            self.reference_id.clone(),
        )
    }

    pub fn transaction_key(&self) -> TransactionKey {
        TransactionKey::new(self.transaction_id.clone())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Midnight at the end of the business day containing `now`.
pub fn end_of_business_day(now: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
    let local_date = now.with_timezone(&offset).date_naive();
    let next_day = local_date
        .checked_add_days(Days::new(1))
        .unwrap_or(local_date);
    let local_midnight = next_day.and_time(NaiveTime::MIN);
    let shifted = local_midnight - chrono::Duration::seconds(offset.local_minus_utc() as i64);
    DateTime::from_naive_utc_and_offset(shifted, Utc)
}

#[async_trait]
pub trait InquiryCache: Send + Sync {
    async fn set(&self, inquiry: &CachedInquiry) -> CacheResult<()>;

    async fn get_by_transaction_id(&self, transaction_id: &str)
        -> CacheResult<Option<CachedInquiry>>;

    async fn get_by_composite(&self, key: &CompositeKey) -> CacheResult<Option<CachedInquiry>>;

    /// Removes both keys. Deleting an absent inquiry is not an error.
    async fn delete(&self, inquiry: &CachedInquiry) -> CacheResult<()>;
}

fn ttl_secs(inquiry: &CachedInquiry, now: DateTime<Utc>) -> CacheResult<u64> {
    let secs = (inquiry.expires_at - now).num_seconds();
    if secs <= 0 {
        return Err(CacheError::TtlError(format!(
            "inquiry {} already expired at {}",
            inquiry.transaction_id, inquiry.expires_at
        )));
    }
    Ok(secs as u64)
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Default)]
struct Entries {
    by_transaction: HashMap<String, CachedInquiry>,
    by_composite: HashMap<String, String>,
}

/// Entries are kept past `expires_at` until deleted; callers check
/// `CachedInquiry::is_expired` themselves.
#[derive(Default)]
pub struct MemoryInquiryCache {
    entries: Mutex<Entries>,
}

impl MemoryInquiryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.by_transaction.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Moves an entry's expiry, including into the past.
    pub async fn set_expires_at(&self, transaction_id: &str, at: DateTime<Utc>) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.by_transaction.get_mut(transaction_id) {
            Some(inquiry) => {
                inquiry.expires_at = at;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl InquiryCache for MemoryInquiryCache {
    async fn set(&self, inquiry: &CachedInquiry) -> CacheResult<()> {
        ttl_secs(inquiry, Utc::now())?;
        let mut entries = self.entries.lock().await;
        entries.by_composite.insert(
            inquiry.composite_key().to_string(),
            inquiry.transaction_id.clone(),
        );
        entries
            .by_transaction
            .insert(inquiry.transaction_id.clone(), inquiry.clone());
        Ok(())
    }

    async fn get_by_transaction_id(
        &self,
        transaction_id: &str,
    ) -> CacheResult<Option<CachedInquiry>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .by_transaction
            .get(transaction_id)
            .cloned())
    }

    async fn get_by_composite(&self, key: &CompositeKey) -> CacheResult<Option<CachedInquiry>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .by_composite
            .get(&key.to_string())
            .and_then(|id| entries.by_transaction.get(id))
            .cloned())
    }

    async fn delete(&self, inquiry: &CachedInquiry) -> CacheResult<()> {
        let mut entries = self.entries.lock().await;
        entries.by_transaction.remove(&inquiry.transaction_id);
        entries
            .by_composite
            .remove(&inquiry.composite_key().to_string());
        Ok(())
    }
}

// ============================================================================
// Redis
// ============================================================================

#[cfg(feature = "cache")]
pub use self::redis_cache::RedisInquiryCache;

#[cfg(feature = "cache")]
mod redis_cache {
    use super::*;
    use crate::cache::RedisPool;
    use redis::AsyncCommands;
    use tracing::debug;

    /// Stores the full JSON under both keys with the same TTL, so either
    /// lookup needs a single GET.
    pub struct RedisInquiryCache {
        pool: RedisPool,
    }

    impl RedisInquiryCache {
        pub fn new(pool: RedisPool) -> Self {
            Self { pool }
        }

        async fn get_json(&self, key: String) -> CacheResult<Option<CachedInquiry>> {
            let mut conn = self.pool.get().await?;
            let raw: Option<String> = conn.get(&key).await?;
            match raw {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        }
    }

    #[async_trait]
    impl InquiryCache for RedisInquiryCache {
        async fn set(&self, inquiry: &CachedInquiry) -> CacheResult<()> {
            let ttl = ttl_secs(inquiry, Utc::now())?;
            let json = serde_json::to_string(inquiry)?;
            let mut conn = self.pool.get().await?;
            let _: () = redis::pipe()
                .atomic()
                .set_ex(inquiry.transaction_key().to_string(), &json, ttl)
                .ignore()
                .set_ex(inquiry.composite_key().to_string(), &json, ttl)
                .ignore()
                .query_async(&mut *conn)
                .await?;
            debug!(inquiry_id = %inquiry.transaction_id, ttl_secs = ttl, "inquiry cached");
            Ok(())
        }

        async fn get_by_transaction_id(
            &self,
            transaction_id: &str,
        ) -> CacheResult<Option<CachedInquiry>> {
            self.get_json(TransactionKey::new(transaction_id).to_string())
                .await
        }

        async fn get_by_composite(
            &self,
            key: &CompositeKey,
        ) -> CacheResult<Option<CachedInquiry>> {
            self.get_json(key.to_string()).await
        }

        async fn delete(&self, inquiry: &CachedInquiry) -> CacheResult<()> {
            let mut conn = self.pool.get().await?;
            let _: () = conn
                .del(vec![
                    inquiry.transaction_key().to_string(),
                    inquiry.composite_key().to_string(),
                ])
                .await?;
            Ok(())
        }
    }
}
