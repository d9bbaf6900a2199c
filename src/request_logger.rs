use rocket::fairing::{Fairing, Info, Kind};
use rocket::{Data, Request, Response};
use std::time::Instant;

use crate::routes::ACTOR_HEADER;

/// Fairing to log one line per HTTP request with timing and the acting actor
pub struct RequestLogger;

#[rocket::async_trait]
impl Fairing for RequestLogger {
    fn info(&self) -> Info {
        Info {
            name: "Request Logger",
            kind: Kind::Request | Kind::Response,
        }
    }

    async fn on_request(&self, request: &mut Request<'_>, _: &mut Data<'_>) {
        request.local_cache(Instant::now);
    }

    async fn on_response<'r>(&self, request: &'r Request<'_>, response: &mut Response<'r>) {
        let duration = request.local_cache(Instant::now).elapsed();

        match request.headers().get_one(ACTOR_HEADER) {
            Some(actor) => log::info!(
                "{} {} [{}] -> {} ({:.2}ms)",
                request.method(),
                request.uri(),
                actor,
                response.status().code,
                duration.as_secs_f64() * 1000.0
            ),
            None => log::info!(
                "{} {} -> {} ({:.2}ms)",
                request.method(),
                request.uri(),
                response.status().code,
                duration.as_secs_f64() * 1000.0
            ),
        }
    }
}
