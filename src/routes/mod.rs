//! HTTP route handlers grouped by resource domain.
//!
//! Each submodule exposes typed Rocket handlers annotated with `#[openapi]`
//! so `rocket_okapi` can derive an OpenAPI document automatically.

pub mod categories;
pub mod health;
pub mod imports;

use rocket::Request;
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome};
use rocket_okapi::request::OpenApiFromRequest;

use crate::error::ApiError;
use crate::import::ActorId;

/// Header carrying the identity of whoever drives an import.
pub const ACTOR_HEADER: &str = "X-Import-Actor";

/// Request guard resolving the acting actor from [`ACTOR_HEADER`].
#[derive(Debug, OpenApiFromRequest)]
pub struct Actor(pub ActorId);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for Actor {
    type Error = ApiError;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        match request.headers().get_one(ACTOR_HEADER).map(str::trim) {
            Some(value) if !value.is_empty() => Outcome::Success(Actor(ActorId::new(value))),
            _ => Outcome::Error((
                Status::BadRequest,
                ApiError::BadRequest(format!("missing {} header", ACTOR_HEADER)),
            )),
        }
    }
}
