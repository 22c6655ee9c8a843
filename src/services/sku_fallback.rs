//! Legacy single-provider routing: one upstream, a main SKU and up to two
//! backups for the same product, tried strictly by priority.

use crate::database::models::Sku;
use crate::database::repository::{CatalogStore, DbResult};
use chrono::{DateTime, FixedOffset, NaiveTime, Utc};
use std::sync::Arc;

/// `true` while `now` falls inside the SKU's cut-off window, i.e. the SKU is
/// unavailable. The window is start-inclusive and end-exclusive; `start > end`
/// wraps past midnight and `00:00-00:00` means no cut-off at all.
pub fn is_within_cutoff(start: NaiveTime, end: NaiveTime, now: NaiveTime) -> bool {
    if start == end {
        return false;
    }
    if start < end {
        now >= start && now < end
    } else {
        now >= start || now < end
    }
}

pub fn is_available(sku: &Sku, now: NaiveTime) -> bool {
    sku.is_active
        && (sku.unlimited_stock || sku.stock > 0)
        && !is_within_cutoff(sku.cut_off_start, sku.cut_off_end, now)
}

/// Filters and orders by priority (1 = main first).
pub fn available_skus(mut skus: Vec<Sku>, now: NaiveTime) -> Vec<Sku> {
    skus.retain(|sku| is_available(sku, now));
    skus.sort_by_key(|sku| (sku.priority, sku.id));
    skus
}

pub struct SkuFallback {
    catalog: Arc<dyn CatalogStore>,
    offset: FixedOffset,
}

impl SkuFallback {
    pub fn new(catalog: Arc<dyn CatalogStore>, offset: FixedOffset) -> Self {
        Self { catalog, offset }
    }

    /// Cut-off windows are expressed in business-local time.
    pub async fn get_available_skus(
        &self,
        product_id: i64,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<Sku>> {
        let local = now.with_timezone(&self.offset).time();
        let skus = self.catalog.skus(product_id).await?;
        Ok(available_skus(skus, local))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::MemoryStore;
    use chrono::TimeZone;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn sku(priority: i32, start: NaiveTime, end: NaiveTime) -> Sku {
        Sku {
            id: 0,
            product_id: 1,
            digi_sku_code: format!("xl10-{}", priority),
            priority,
            price: 10_500,
            cut_off_start: start,
            cut_off_end: end,
            is_active: true,
            stock: 0,
            unlimited_stock: true,
        }
    }

    #[test]
    fn zero_window_is_always_available() {
        for hour in 0..24 {
            assert!(!is_within_cutoff(t(0, 0), t(0, 0), t(hour, 30)));
        }
    }

    #[test]
    fn plain_window_is_start_inclusive_end_exclusive() {
        assert!(!is_within_cutoff(t(1, 0), t(3, 0), t(0, 59)));
        assert!(is_within_cutoff(t(1, 0), t(3, 0), t(1, 0)));
        assert!(is_within_cutoff(t(1, 0), t(3, 0), t(2, 59)));
        assert!(!is_within_cutoff(t(1, 0), t(3, 0), t(3, 0)));
    }

    #[test]
    fn wrapping_window_crosses_midnight() {
        assert!(is_within_cutoff(t(22, 0), t(6, 0), t(23, 30)));
        assert!(is_within_cutoff(t(22, 0), t(6, 0), t(0, 0)));
        assert!(is_within_cutoff(t(22, 0), t(6, 0), t(5, 59)));
        assert!(!is_within_cutoff(t(22, 0), t(6, 0), t(6, 0)));
        assert!(!is_within_cutoff(t(22, 0), t(6, 0), t(12, 0)));
    }

    #[test]
    fn unavailable_skus_are_dropped_and_rest_sorted_by_priority() {
        let mut out_of_stock = sku(2, t(0, 0), t(0, 0));
        out_of_stock.unlimited_stock = false;
        let mut inactive = sku(1, t(0, 0), t(0, 0));
        inactive.is_active = false;

        let skus = vec![
            sku(3, t(0, 0), t(0, 0)),
            out_of_stock,
            inactive,
            sku(1, t(23, 0), t(1, 0)),
        ];
        let at_noon = available_skus(skus.clone(), t(12, 0));
        assert_eq!(
            at_noon.iter().map(|s| s.priority).collect::<Vec<_>>(),
            vec![1, 3]
        );

        let at_midnight = available_skus(skus, t(0, 10));
        assert_eq!(
            at_midnight.iter().map(|s| s.priority).collect::<Vec<_>>(),
            vec![3]
        );
    }

    #[tokio::test]
    async fn cutoff_uses_business_local_time() {
        let store = Arc::new(MemoryStore::new());
        store.add_sku(sku(1, t(23, 0), t(1, 0))).await;
        let fallback = SkuFallback::new(store, FixedOffset::east_opt(7 * 3600).unwrap());

        // 16:30 UTC is 23:30 at UTC+7, inside the window.
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 16, 30, 0).unwrap();
        assert!(fallback.get_available_skus(1, now).await.unwrap().is_empty());

        let later = Utc.with_ymd_and_hms(2026, 3, 1, 18, 30, 0).unwrap();
        assert_eq!(fallback.get_available_skus(1, later).await.unwrap().len(), 1);
    }
}
