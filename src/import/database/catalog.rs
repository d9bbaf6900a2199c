use async_trait::async_trait;
use rocket_db_pools::sqlx::{self, PgPool};
use uuid::Uuid;

use crate::import::error::StoreError;
use crate::import::store::CatalogStore;
use crate::models::{Category, NewProduct, NewProductImage, Product, ProductImage};

const PRODUCT_COLUMNS: &str =
    "id, category_id, name, slug, price_cents, description, external_id, available, created_at";

fn is_slug_conflict(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.constraint() == Some("products_slug_key")
    )
}

#[derive(Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_product(
        &self,
        product: &NewProduct,
        slug: &str,
    ) -> Result<Option<Product>, sqlx::Error> {
        let sql = format!(
            r#"INSERT INTO products (category_id, name, slug, price_cents, description, external_id)
               VALUES ($1, $2, $3, $4, $5, $6)
               ON CONFLICT (external_id) DO NOTHING
               RETURNING {PRODUCT_COLUMNS}"#
        );
        sqlx::query_as::<_, Product>(&sql)
            .bind(product.category_id)
            .bind(&product.name)
            .bind(slug)
            .bind(product.price_cents)
            .bind(&product.description)
            .bind(&product.external_id)
            .fetch_optional(&self.pool)
            .await
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn get_or_create_category(&self, name: &str) -> Result<Category, StoreError> {
        let category = sqlx::query_as::<_, Category>(
            r#"INSERT INTO categories (name)
               VALUES ($1)
               ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
               RETURNING id, name, created_at"#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        Ok(category)
    }

    async fn find_category(&self, id: i32) -> Result<Option<Category>, StoreError> {
        let category = sqlx::query_as::<_, Category>(
            "SELECT id, name, created_at FROM categories WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(category)
    }

    async fn list_categories(&self) -> Result<Vec<Category>, StoreError> {
        let categories = sqlx::query_as::<_, Category>(
            "SELECT id, name, created_at FROM categories ORDER BY name ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(categories)
    }

    async fn product_exists(&self, external_id: &str) -> Result<bool, StoreError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM products WHERE external_id = $1)")
                .bind(external_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(exists)
    }

    async fn create_product(&self, product: &NewProduct) -> Result<Option<Product>, StoreError> {
        match self.insert_product(product, &product.slug).await {
            Err(err) if is_slug_conflict(&err) => {
                // Distinct names can share a slug.
                let suffix = Uuid::new_v4().simple().to_string();
                let slug = format!("{}-{}", product.slug, &suffix[..8]);
                log::debug!("slug '{}' taken, retrying as '{}'", product.slug, slug);
                Ok(self.insert_product(product, &slug).await?)
            }
            other => Ok(other?),
        }
    }

    async fn add_image(&self, image: &NewProductImage) -> Result<ProductImage, StoreError> {
        let stored = sqlx::query_as::<_, ProductImage>(
            r#"INSERT INTO product_images (product_id, position, is_primary, file_name, source_url, content)
               VALUES ($1, $2, $3, $4, $5, $6)
               RETURNING id, product_id, position, is_primary, file_name, source_url, created_at"#,
        )
        .bind(image.product_id)
        .bind(image.position)
        .bind(image.is_primary)
        .bind(&image.file_name)
        .bind(&image.source_url)
        .bind(&image.content)
        .fetch_one(&self.pool)
        .await?;

        Ok(stored)
    }
}
