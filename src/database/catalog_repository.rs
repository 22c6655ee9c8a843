use crate::database::error::DatabaseError;
use crate::database::models::{Client, Product, ProviderSku, Sku};
use crate::database::repository::{CatalogStore, DbResult};
use async_trait::async_trait;
use sqlx::PgPool;

/// Read-only view over the product catalog tables.
pub struct CatalogRepository {
    pool: PgPool,
}

impl CatalogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ProductRow {
    id: i64,
    code: String,
    name: String,
    category: String,
    is_postpaid: bool,
    sell_price: i64,
    admin_fee: i64,
    is_active: bool,
}

impl From<ProductRow> for Product {
    fn from(row: ProductRow) -> Self {
        Self {
            id: row.id,
            code: row.code,
            name: row.name,
            category: row.category,
            is_postpaid: row.is_postpaid,
            sell_price: row.sell_price,
            admin_fee: row.admin_fee,
            is_active: row.is_active,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ProviderSkuRow {
    id: i64,
    provider_id: i64,
    provider_code: String,
    product_id: i64,
    sku_code: String,
    price: i64,
    admin: i64,
    commission: i64,
    is_backup: bool,
    priority: i32,
    is_active: bool,
}

#[derive(sqlx::FromRow)]
struct SkuRow {
    id: i64,
    product_id: i64,
    digi_sku_code: String,
    priority: i32,
    price: i64,
    cut_off_start: chrono::NaiveTime,
    cut_off_end: chrono::NaiveTime,
    is_active: bool,
    stock: i64,
    unlimited_stock: bool,
}

#[derive(sqlx::FromRow)]
struct ClientRow {
    id: i64,
    code: String,
    name: String,
    callback_url: Option<String>,
    callback_secret: String,
    is_active: bool,
}

const PRODUCT_COLUMNS: &str =
    "id, code, name, category, is_postpaid, sell_price, admin_fee, is_active";

#[async_trait]
impl CatalogStore for CatalogRepository {
    async fn find_product(&self, id: i64) -> DbResult<Option<Product>> {
        let sql = format!("SELECT {} FROM products WHERE id = $1", PRODUCT_COLUMNS);
        Ok(sqlx::query_as::<_, ProductRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(Product::from))
    }

    async fn find_product_by_code(&self, code: &str) -> DbResult<Option<Product>> {
        let sql = format!("SELECT {} FROM products WHERE code = $1", PRODUCT_COLUMNS);
        Ok(sqlx::query_as::<_, ProductRow>(&sql)
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(Product::from))
    }

    async fn provider_skus(&self, product_id: i64) -> DbResult<Vec<ProviderSku>> {
        let rows = sqlx::query_as::<_, ProviderSkuRow>(
            "SELECT ps.id, ps.provider_id, p.code AS provider_code, ps.product_id, ps.sku_code,
                    ps.price, ps.admin, ps.commission, ps.is_backup, p.priority,
                    (ps.is_active AND p.is_active) AS is_active
             FROM provider_skus ps
             JOIN providers p ON p.id = ps.provider_id
             WHERE ps.product_id = $1 AND ps.is_active AND p.is_active",
        )
        .bind(product_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(rows
            .into_iter()
            .map(|row| ProviderSku {
                id: row.id,
                provider_id: row.provider_id,
                provider_code: row.provider_code,
                product_id: row.product_id,
                sku_code: row.sku_code,
                price: row.price,
                admin: row.admin,
                commission: row.commission,
                is_backup: row.is_backup,
                priority: row.priority,
                is_active: row.is_active,
            })
            .collect())
    }

    async fn skus(&self, product_id: i64) -> DbResult<Vec<Sku>> {
        let rows = sqlx::query_as::<_, SkuRow>(
            "SELECT id, product_id, digi_sku_code, priority, price, cut_off_start, cut_off_end,
                    is_active, stock, unlimited_stock
             FROM skus WHERE product_id = $1",
        )
        .bind(product_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(rows
            .into_iter()
            .map(|row| Sku {
                id: row.id,
                product_id: row.product_id,
                digi_sku_code: row.digi_sku_code,
                priority: row.priority,
                price: row.price,
                cut_off_start: row.cut_off_start,
                cut_off_end: row.cut_off_end,
                is_active: row.is_active,
                stock: row.stock,
                unlimited_stock: row.unlimited_stock,
            })
            .collect())
    }

    async fn find_client(&self, id: i64) -> DbResult<Option<Client>> {
        let row = sqlx::query_as::<_, ClientRow>(
            "SELECT id, code, name, callback_url, callback_secret, is_active
             FROM clients WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(row.map(|row| Client {
            id: row.id,
            code: row.code,
            name: row.name,
            callback_url: row.callback_url,
            callback_secret: row.callback_secret,
            is_active: row.is_active,
        }))
    }
}
