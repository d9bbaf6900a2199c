use std::sync::Arc;

use rocket::serde::json::Json;
use rocket::{State, get};
use rocket_okapi::openapi;

use crate::error::ApiError;
use crate::import::RunController;
use crate::models::Category;

/// Categories available as the fallback for rows without a category label.
#[openapi(tag = "Categories")]
#[get("/categories")]
pub async fn list_categories(
    controller: &State<Arc<RunController>>,
) -> Result<Json<Vec<Category>>, ApiError> {
    Ok(Json(controller.categories().await?))
}
