//! Row importer: walks data rows from a start index, materializes products and
//! hands their attachment references to the fetcher, checkpointing after each
//! completed row.

use crate::import::error::{FetchError, ImportError, StoreError};
use crate::import::fetcher::{AttachmentFetcher, FetchOutcome};
use crate::import::governor::{Admission, RateLimitGovernor};
use crate::import::row::{
    ColumnMapping, MappingError, parse_price_cents, product_slug, split_attachment_refs,
};
use crate::import::run::{ActorId, ImportRun, RunOutcome, RunResult, RunStatus};
use crate::import::store::ImportServices;
use crate::models::NewProduct;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Tally {
    imported: usize,
    skipped_duplicates: usize,
}

impl Tally {
    fn finish(
        &self,
        run: &ImportRun,
        status: RunOutcome,
        wait_until: Option<chrono::DateTime<chrono::Utc>>,
    ) -> RunResult {
        RunResult {
            imported: self.imported,
            skipped_duplicates: self.skipped_duplicates,
            last_success_row: run.last_success_row,
            status,
            wait_until,
        }
    }
}

pub struct RowImporter {
    services: ImportServices,
    governor: RateLimitGovernor,
    fetcher: AttachmentFetcher,
}

impl RowImporter {
    pub fn new(
        services: ImportServices,
        governor: RateLimitGovernor,
        origin_pattern: &str,
    ) -> Result<Self, FetchError> {
        let fetcher = AttachmentFetcher::new(services.clone(), governor.clone(), origin_pattern)?;
        Ok(Self {
            services,
            governor,
            fetcher,
        })
    }

    pub fn governor(&self) -> &RateLimitGovernor {
        &self.governor
    }

    /// A restart or stop since `run` was loaded makes it stale.
    async fn still_current(&self, run: &ImportRun) -> Result<bool, StoreError> {
        let current = self.services.checkpoints.find(&run.actor_id).await?;
        Ok(current.is_some_and(|current| {
            current.generation == run.generation && current.status != RunStatus::Stopped
        }))
    }

    /// Import `rows[start_row..]`. `rows[0]` is the header; `start_row` is a
    /// 1-based data row index.
    pub async fn run(
        &self,
        rows: &[Vec<String>],
        mapping: &ColumnMapping,
        fallback_category: Option<i32>,
        actor: &ActorId,
        start_row: i32,
    ) -> Result<RunResult, ImportError> {
        self.run_cancellable(
            rows,
            mapping,
            fallback_category,
            actor,
            start_row,
            &CancellationToken::new(),
        )
        .await
    }

    /// Like [`RowImporter::run`], but pauses end early once `cancel` fires.
    pub async fn run_cancellable(
        &self,
        rows: &[Vec<String>],
        mapping: &ColumnMapping,
        fallback_category: Option<i32>,
        actor: &ActorId,
        start_row: i32,
        cancel: &CancellationToken,
    ) -> Result<RunResult, ImportError> {
        if start_row < 1 {
            return Err(ImportError::InvalidStartRow(start_row));
        }
        let (header, data) = rows.split_first().ok_or(MappingError::NoHeader)?;
        let columns = mapping.resolve(header)?;

        let checkpoints = &self.services.checkpoints;
        let catalog = &self.services.catalog;
        let clock = &self.services.clock;
        let mut tally = Tally::default();

        let mut run = checkpoints
            .get_or_create(actor, self.governor.default_pause_minutes())
            .await?;
        if run.total_rows == 0 {
            run.total_rows = i32::try_from(data.len()).unwrap_or(i32::MAX);
        }

        log::info!(
            "actor {}: import from row {} of {} (generation {})",
            actor,
            start_row,
            run.total_rows,
            run.generation
        );

        if let Admission::Wait { until } = self.governor.admit(&mut run, clock.now()) {
            log::info!("actor {}: still paused until {}", actor, until);
            if !checkpoints.save(&run).await? {
                return Ok(tally.finish(&run, RunOutcome::Stopped, None));
            }
            return Ok(tally.finish(&run, RunOutcome::Waiting, Some(until)));
        }
        if !checkpoints.save(&run).await? {
            return Ok(tally.finish(&run, RunOutcome::Stopped, None));
        }

        let fallback = match fallback_category {
            Some(id) => {
                let category = catalog.find_category(id).await?;
                if category.is_none() {
                    log::warn!("fallback category {} does not exist", id);
                }
                category
            }
            None => None,
        };

        for (idx, row) in rows.iter().enumerate().skip(start_row as usize) {
            let row_index = i32::try_from(idx).unwrap_or(i32::MAX);

            if !self.still_current(&run).await? {
                log::info!("actor {}: run superseded before row {}", actor, row_index);
                return Ok(tally.finish(&run, RunOutcome::Stopped, None));
            }

            let fields = columns.project(row);
            let category = match fields.category_label {
                Some(label) => Some(catalog.get_or_create_category(label).await?),
                None => fallback.clone(),
            };

            let (Some(name), Some(external_id), Some(category)) =
                (fields.name, fields.external_id, category)
            else {
                log::warn!(
                    "skip row {}: name={:?}, external_id={:?}, category_label={:?}",
                    row_index,
                    fields.name,
                    fields.external_id,
                    fields.category_label
                );
                continue;
            };

            if catalog.product_exists(external_id).await? {
                log::info!("skip duplicate external_id={}", external_id);
                tally.skipped_duplicates += 1;
                continue;
            }

            let new_product = NewProduct {
                category_id: category.id,
                name: name.to_string(),
                slug: product_slug(name, external_id),
                price_cents: parse_price_cents(fields.price),
                description: fields.description.unwrap_or_default().to_string(),
                external_id: external_id.to_string(),
            };
            let Some(product) = catalog.create_product(&new_product).await? else {
                log::info!("skip duplicate external_id={} (concurrent insert)", external_id);
                tally.skipped_duplicates += 1;
                continue;
            };

            if let Some(raw) = fields.attachment_refs {
                let refs = split_attachment_refs(raw);
                log::debug!("attachment refs for {}: {:?}", product.name, refs);

                let outcome = self
                    .fetcher
                    .fetch_all(&refs, &product, &mut run, cancel)
                    .await?;
                match outcome {
                    FetchOutcome::Completed { accepted } => {
                        log::debug!("{} of {} attachments stored", accepted, refs.len());
                    }
                    FetchOutcome::Throttled { wait_until } => {
                        return Ok(tally.finish(&run, RunOutcome::Paused, Some(wait_until)));
                    }
                    FetchOutcome::Superseded => {
                        return Ok(tally.finish(&run, RunOutcome::Stopped, None));
                    }
                }
            }

            run.last_success_row = run.last_success_row.max(row_index);
            run.status = RunStatus::Running;
            tally.imported += 1;
            if !checkpoints.save(&run).await? {
                return Ok(tally.finish(&run, RunOutcome::Stopped, None));
            }
            log::info!(
                "imported product {} (external_id={})",
                product.name,
                product.external_id
            );
        }

        run.status = RunStatus::Completed;
        run.pause_until = None;
        if !checkpoints.save(&run).await? {
            return Ok(tally.finish(&run, RunOutcome::Stopped, None));
        }

        log::info!(
            "actor {}: import finished, {} imported, {} duplicates",
            actor,
            tally.imported,
            tally.skipped_duplicates
        );
        Ok(tally.finish(&run, RunOutcome::Completed, None))
    }
}
