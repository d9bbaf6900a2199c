use rocket::http::Status;
use rocket::response::{self, Responder};
use rocket::{Request, Response};
use rocket_okapi::r#gen::OpenApiGenerator;
use rocket_okapi::okapi::openapi3::Responses;
use rocket_okapi::okapi::schemars::JsonSchema;
use rocket_okapi::response::OpenApiResponderInner;
use rocket_okapi::util::add_schema_response;
use serde::Serialize;
use std::io::Cursor;

use crate::import::{ImportError, StoreError};

#[derive(Debug)]
pub enum ApiError {
    DatabaseError(String),
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    InternalError(String),
}

#[derive(Serialize, JsonSchema)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, _: &'r Request<'_>) -> response::Result<'static> {
        let (status, error_type, message) = match self {
            ApiError::DatabaseError(msg) => {
                log::error!("database error: {}", msg);
                (Status::InternalServerError, "DatabaseError", msg)
            }
            ApiError::NotFound(msg) => {
                log::debug!("not found: {}", msg);
                (Status::NotFound, "NotFound", msg)
            }
            ApiError::BadRequest(msg) => {
                log::debug!("bad request: {}", msg);
                (Status::BadRequest, "BadRequest", msg)
            }
            ApiError::Conflict(msg) => {
                log::debug!("conflict: {}", msg);
                (Status::Conflict, "Conflict", msg)
            }
            ApiError::InternalError(msg) => {
                log::error!("internal error: {}", msg);
                (Status::InternalServerError, "InternalError", msg)
            }
        };

        let error_response = ErrorResponse {
            error: error_type.to_string(),
            message,
        };

        let json = serde_json::to_string(&error_response).unwrap_or_else(|_| {
            r#"{"error":"SerializationError","message":"Failed to serialize error"}"#.to_string()
        });

        Response::build()
            .status(status)
            .header(rocket::http::ContentType::JSON)
            .sized_body(json.len(), Cursor::new(json))
            .ok()
    }
}

impl OpenApiResponderInner for ApiError {
    fn responses(generator: &mut OpenApiGenerator) -> rocket_okapi::Result<Responses> {
        let schema = generator.json_schema::<ErrorResponse>();
        let mut responses = Responses::default();
        for status in [400, 404, 409, 500] {
            add_schema_response(&mut responses, status, "application/json", schema.clone())?;
        }
        Ok(responses)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Database(e) => ApiError::DatabaseError(e.to_string()),
            StoreError::Payload(e) => ApiError::BadRequest(e.to_string()),
        }
    }
}

impl From<ImportError> for ApiError {
    fn from(err: ImportError) -> Self {
        match err {
            ImportError::Store(e) => e.into(),
            ImportError::InvalidMapping(_) | ImportError::InvalidStartRow(_) => {
                ApiError::BadRequest(err.to_string())
            }
            ImportError::RequiresRestart(_) => ApiError::Conflict(err.to_string()),
        }
    }
}
