//! Rate-limit governor: turns fetch outcomes into pause decisions.
//!
//! The governor owns no state of its own. Every decision is written onto the
//! [`ImportRun`] it is handed, so escalation survives restarts of the process
//! through the checkpoint store.
//!
//! Three mechanisms cooperate:
//!
//! - **Throttle escalation**: a 429 from the origin pauses the run and grows
//!   both `pause_minutes` and `extra_delay_minutes` by a fixed increment.
//!   Escalation is cumulative and uncapped until the run is restarted.
//! - **Burst pause**: every `burst_every` fetch attempts the run waits for
//!   the current base `pause_minutes`, throttled or not.
//! - **Steady delay**: between fetches, a uniform jitter from the base window
//!   plus the accrued extra delay.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

use crate::import::config::GovernorConfig;
use crate::import::run::{ImportRun, RunStatus};

/// Whether a re-entered run may process rows now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Proceed,
    Wait { until: DateTime<Utc> },
}

#[derive(Debug, Clone)]
pub struct RateLimitGovernor {
    config: GovernorConfig,
}

fn minutes(value: i32) -> chrono::Duration {
    chrono::Duration::minutes(i64::from(value.max(0)))
}

fn minutes_std(value: i32) -> Duration {
    Duration::from_secs(u64::from(value.max(0).unsigned_abs()) * 60)
}

impl RateLimitGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Base pause for fresh and restarted runs.
    pub fn default_pause_minutes(&self) -> i32 {
        self.config.pause_minutes
    }

    /// Gate a run on re-entry. A pause still in effect turns the run `waiting`;
    /// otherwise it becomes `running` and the pause is cleared.
    pub fn admit(&self, run: &mut ImportRun, now: DateTime<Utc>) -> Admission {
        if run.status.is_pausing() {
            if let Some(until) = run.pause_until.filter(|until| now < *until) {
                run.status = RunStatus::Waiting;
                return Admission::Wait { until };
            }
        }

        run.status = RunStatus::Running;
        run.pause_until = None;
        Admission::Proceed
    }

    /// Escalate after a throttling response and return when the run may resume.
    pub fn on_throttled(&self, run: &mut ImportRun, now: DateTime<Utc>) -> DateTime<Utc> {
        let step = self.config.throttle_increment_minutes;
        run.pause_minutes = run.pause_minutes.saturating_add(step);
        run.extra_delay_minutes = run.extra_delay_minutes.saturating_add(step);
        run.status = RunStatus::Paused;

        let until = now + minutes(run.pause_minutes);
        run.pause_until = Some(until);

        log::warn!(
            "actor {}: throttled, pausing {} min (extra delay now {} min)",
            run.actor_id,
            run.pause_minutes,
            run.extra_delay_minutes
        );
        until
    }

    /// Count one fetch attempt, whatever its outcome, in `images_downloaded`.
    /// Returns the pause to take when the attempt lands on a burst boundary;
    /// the run is then marked `waiting`.
    pub fn record_attempt(&self, run: &mut ImportRun, now: DateTime<Utc>) -> Option<Duration> {
        run.images_downloaded = run.images_downloaded.saturating_add(1);

        let every = self.config.burst_every.max(1);
        if run.images_downloaded % every != 0 {
            return None;
        }

        run.status = RunStatus::Waiting;
        run.pause_until = Some(now + minutes(run.pause_minutes));

        log::info!(
            "actor {}: pause {} min after {} fetch attempts",
            run.actor_id,
            run.pause_minutes,
            run.images_downloaded
        );
        Some(minutes_std(run.pause_minutes))
    }

    /// Leave a burst pause.
    pub fn end_burst(&self, run: &mut ImportRun) {
        run.status = RunStatus::Running;
        run.pause_until = None;
    }

    /// Jittered delay to insert between two fetch attempts.
    pub fn steady_delay<R: Rng + ?Sized>(&self, run: &ImportRun, rng: &mut R) -> Duration {
        let low = self.config.delay_min.as_secs_f64();
        let high = self.config.delay_max.as_secs_f64();
        let base = if high > low {
            rng.gen_range(low..=high)
        } else {
            low
        };

        Duration::from_secs_f64(base) + minutes_std(run.extra_delay_minutes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::run::ActorId;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn governor() -> RateLimitGovernor {
        RateLimitGovernor::new(GovernorConfig {
            pause_minutes: 5,
            throttle_increment_minutes: 3,
            burst_every: 10,
            delay_min: Duration::from_secs(3),
            delay_max: Duration::from_secs(7),
        })
    }

    fn run(now: DateTime<Utc>) -> ImportRun {
        let mut run = ImportRun::new(ActorId::new("ops"), 5, now);
        run.status = RunStatus::Running;
        run
    }

    #[test]
    fn throttle_escalates_cumulatively() {
        let gov = governor();
        let now = Utc::now();
        let mut run = run(now);

        let first = gov.on_throttled(&mut run, now);
        assert_eq!(run.status, RunStatus::Paused);
        assert_eq!((run.pause_minutes, run.extra_delay_minutes), (8, 3));
        assert_eq!(first, now + chrono::Duration::minutes(8));

        gov.on_throttled(&mut run, now);
        assert_eq!((run.pause_minutes, run.extra_delay_minutes), (11, 6));
    }

    #[test]
    fn burst_pause_lands_on_every_tenth_attempt() {
        let gov = governor();
        let now = Utc::now();
        let mut run = run(now);

        let pauses: Vec<i32> = (0..25)
            .filter_map(|_| {
                let pause = gov.record_attempt(&mut run, now);
                if pause.is_some() {
                    assert_eq!(run.status, RunStatus::Waiting);
                    gov.end_burst(&mut run);
                }
                pause.map(|_| run.images_downloaded)
            })
            .collect();

        assert_eq!(pauses, vec![10, 20]);
        assert_eq!(run.images_downloaded, 25);
    }

    #[test]
    fn burst_pause_uses_base_not_escalated_minutes() {
        let gov = governor();
        let now = Utc::now();
        let mut run = run(now);
        run.images_downloaded = 9;

        let pause = gov.record_attempt(&mut run, now);
        assert_eq!(pause, Some(Duration::from_secs(5 * 60)));
        assert_eq!(run.pause_minutes, 5);
        assert_eq!(run.extra_delay_minutes, 0);
    }

    #[test]
    fn admission_waits_until_pause_elapses() {
        let gov = governor();
        let now = Utc::now();
        let mut run = run(now);
        let until = gov.on_throttled(&mut run, now);

        assert_eq!(gov.admit(&mut run, now), Admission::Wait { until });
        assert_eq!(run.status, RunStatus::Waiting);

        assert_eq!(gov.admit(&mut run, until), Admission::Proceed);
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.pause_until, None);
        // Admission never relaxes escalation.
        assert_eq!(run.pause_minutes, 8);
    }

    #[test]
    fn steady_delay_stays_in_window_plus_extra() {
        let gov = governor();
        let mut rng = StdRng::seed_from_u64(17);
        let mut run = run(Utc::now());

        for _ in 0..200 {
            let delay = gov.steady_delay(&run, &mut rng);
            assert!(delay >= Duration::from_secs(3) && delay <= Duration::from_secs(7));
        }

        run.extra_delay_minutes = 3;
        let delay = gov.steady_delay(&run, &mut rng);
        assert!(delay >= Duration::from_secs(183) && delay <= Duration::from_secs(187));
    }
}
