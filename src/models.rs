use chrono::{DateTime, Utc};
use rocket_db_pools::sqlx::FromRow;
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ===== Catalog Models =====

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow, JsonSchema)]
pub struct Category {
    pub id: i32,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Product {
    pub id: i32,
    pub category_id: i32,
    pub name: String,
    pub slug: String,
    pub price_cents: i64,
    pub description: String,
    pub external_id: String,
    pub available: bool,
    pub created_at: DateTime<Utc>,
}

/// Stored attachment metadata; the binary content is written but not read back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ProductImage {
    pub id: i32,
    pub product_id: i32,
    pub position: i32,
    pub is_primary: bool,
    pub file_name: String,
    pub source_url: String,
    pub created_at: DateTime<Utc>,
}

// ===== Insert Payloads =====

#[derive(Debug, Clone, PartialEq)]
pub struct NewProduct {
    pub category_id: i32,
    pub name: String,
    pub slug: String,
    pub price_cents: i64,
    pub description: String,
    pub external_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewProductImage {
    pub product_id: i32,
    /// Index of the reference in the row's attachment list.
    pub position: i32,
    pub is_primary: bool,
    pub file_name: String,
    pub source_url: String,
    pub content: Vec<u8>,
}
