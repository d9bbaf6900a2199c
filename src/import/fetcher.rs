//! Attachment fetching for a freshly created product.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, REFERER};
use reqwest::redirect::Policy;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::import::config::FetchConfig;
use crate::import::error::{FetchError, StoreError};
use crate::import::governor::RateLimitGovernor;
use crate::import::run::ImportRun;
use crate::import::store::{AttachmentSource, FetchedAttachment, ImportServices};
use crate::models::{NewProductImage, Product};

const TOO_MANY_REQUESTS: u16 = 429;
const OK: u16 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Every reference was attempted; `accepted` of them were stored.
    Completed { accepted: usize },
    /// The origin throttled us. The run is paused until `wait_until`.
    Throttled { wait_until: DateTime<Utc> },
    /// A restart or stop replaced the run while fetching.
    Superseded,
}

pub struct AttachmentFetcher {
    services: ImportServices,
    governor: RateLimitGovernor,
    origin: Regex,
}

impl AttachmentFetcher {
    pub fn new(
        services: ImportServices,
        governor: RateLimitGovernor,
        origin_pattern: &str,
    ) -> Result<Self, FetchError> {
        Ok(Self {
            services,
            governor,
            origin: Regex::new(origin_pattern)?,
        })
    }

    fn accepts(&self, response: &FetchedAttachment) -> bool {
        response.status == OK && self.origin.is_match(&response.final_url)
    }

    /// Sleep on the clock unless `cancel` fires first. Returns `false` when
    /// the pause was cut short.
    async fn pause(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = self.services.clock.sleep(duration) => true,
            _ = cancel.cancelled() => false,
        }
    }

    /// Fetch `refs` in order and attach accepted content to `product`. The
    /// first accepted attachment becomes the primary image.
    ///
    /// Checkpoint writes made here (throttle, burst pause) go through `run`, so
    /// the caller must keep using the same value afterwards. Cancelling
    /// `cancel` ends any pause in progress with [`FetchOutcome::Superseded`].
    pub async fn fetch_all(
        &self,
        refs: &[&str],
        product: &Product,
        run: &mut ImportRun,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, StoreError> {
        let checkpoints = &self.services.checkpoints;
        let clock = &self.services.clock;
        let mut accepted = 0usize;

        for (idx, url) in refs.iter().enumerate() {
            let response = match self.services.source.fetch(url).await {
                Ok(response) => {
                    log::info!(
                        "download attachment: {} -> {}, status={}",
                        url,
                        response.final_url,
                        response.status
                    );
                    Some(response)
                }
                Err(err) => {
                    log::error!("error downloading attachment {}: {}", url, err);
                    None
                }
            };

            if response.as_ref().map(|r| r.status) == Some(TOO_MANY_REQUESTS) {
                let wait_until = self.governor.on_throttled(run, clock.now());
                log::warn!(
                    "paused import for actor {} at product {} due to 429 for {}",
                    run.actor_id,
                    product.external_id,
                    url
                );
                if !checkpoints.save(run).await? {
                    return Ok(FetchOutcome::Superseded);
                }
                return Ok(FetchOutcome::Throttled { wait_until });
            }

            match response.filter(|r| self.accepts(r)) {
                Some(response) => {
                    let image = NewProductImage {
                        product_id: product.id,
                        position: idx as i32,
                        is_primary: accepted == 0,
                        file_name: format!("{}-{}.jpg", product.slug, idx),
                        source_url: url.to_string(),
                        content: response.body,
                    };
                    self.services.catalog.add_image(&image).await?;
                    log::info!(
                        "saved {} image {} for {}",
                        if image.is_primary { "main" } else { "gallery" },
                        image.file_name,
                        product.name
                    );
                    accepted += 1;
                }
                None => log::warn!("failed to get attachment content for {}", url),
            }

            if let Some(pause) = self.governor.record_attempt(run, clock.now()) {
                if !checkpoints.save(run).await? {
                    return Ok(FetchOutcome::Superseded);
                }
                if !self.pause(pause, cancel).await {
                    log::info!("actor {}: burst pause cancelled", run.actor_id);
                    return Ok(FetchOutcome::Superseded);
                }
                self.governor.end_burst(run);
                if !checkpoints.save(run).await? {
                    return Ok(FetchOutcome::Superseded);
                }
            }

            let delay = self.governor.steady_delay(run, &mut rand::thread_rng());
            log::debug!("delay between requests: {:.2} sec", delay.as_secs_f64());
            if !self.pause(delay, cancel).await {
                return Ok(FetchOutcome::Superseded);
            }
        }

        Ok(FetchOutcome::Completed { accepted })
    }
}

/// [`AttachmentSource`] over HTTP. Redirects are followed so acceptance can be
/// judged on the final URL.
#[derive(Clone)]
pub struct HttpAttachmentSource {
    http: reqwest::Client,
}

impl HttpAttachmentSource {
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("image/avif,image/webp,image/*,*/*;q=0.8"),
        );
        if let Some(referer) = &config.referer {
            match HeaderValue::from_str(referer) {
                Ok(value) => {
                    headers.insert(REFERER, value);
                }
                Err(_) => log::warn!("ignoring invalid referer header value '{}'", referer),
            }
        }

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .redirect(Policy::limited(config.max_redirects))
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()?;

        Ok(Self { http })
    }
}

#[async_trait]
impl AttachmentSource for HttpAttachmentSource {
    async fn fetch(&self, url: &str) -> Result<FetchedAttachment, FetchError> {
        let response = self.http.get(url).send().await?;
        let status = response.status();
        let final_url = response.url().to_string();

        let body = if status.is_success() {
            response.bytes().await?.to_vec()
        } else {
            Vec::new()
        };

        Ok(FetchedAttachment {
            status: status.as_u16(),
            final_url,
            body,
        })
    }
}
