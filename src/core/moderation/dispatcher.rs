// Background moderation queue.
//
// Callers submit a listing id and move on; a single worker drains the queue
// and runs moderation jobs with bounded concurrency. Runs for the same
// listing never overlap: a submission that arrives while a run is in flight
// is folded into one follow-up run. Failed writes are retried with backoff
// and every job ends up counted in the summary returned on shutdown.

use super::moderation_models::{ModerationDecision, ModerationOutcome};
use super::moderation_service::{ModerationError, Moderator};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

#[derive(Debug, Error, PartialEq)]
pub enum DispatchError {
    #[error("Moderation dispatcher is shut down")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Maximum number of listings moderated at the same time.
    pub max_concurrent_jobs: usize,
    /// Total attempts for the final write, including the first.
    pub persist_attempts: u32,
    /// Wait before the first write retry; doubles afterwards.
    pub persist_backoff: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            persist_attempts: 3,
            persist_backoff: Duration::from_secs(1),
        }
    }
}

/// Counts of finished jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub decided: u64,
    pub skipped: u64,
    pub failed: u64,
}

#[derive(Default)]
struct DispatchStats {
    decided: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

impl DispatchStats {
    fn snapshot(&self) -> DispatchSummary {
        DispatchSummary {
            decided: self.decided.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

pub struct ModerationDispatcher {
    sender: mpsc::UnboundedSender<i64>,
    worker: JoinHandle<()>,
    stats: Arc<DispatchStats>,
}

impl ModerationDispatcher {
    /// Start the worker task. Must be called inside a tokio runtime.
    pub fn spawn<M: Moderator>(moderator: Arc<M>, settings: DispatchSettings) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let stats = Arc::new(DispatchStats::default());
        let worker = tokio::spawn(run_worker(
            moderator,
            settings,
            receiver,
            Arc::clone(&stats),
        ));

        Self {
            sender,
            worker,
            stats,
        }
    }

    /// Queue a listing for moderation. Returns immediately.
    pub fn submit(&self, listing_id: i64) -> Result<(), DispatchError> {
        self.sender
            .send(listing_id)
            .map_err(|_| DispatchError::Closed)?;
        tracing::debug!(listing_id, "Listing queued for moderation");
        Ok(())
    }

    /// Stop accepting work, wait for every queued and running job, and
    /// return the final counts.
    pub async fn shutdown(self) -> DispatchSummary {
        drop(self.sender);
        if let Err(e) = self.worker.await {
            tracing::error!(error = %e, "Moderation worker panicked");
        }
        self.stats.snapshot()
    }
}

async fn run_worker<M: Moderator>(
    moderator: Arc<M>,
    settings: DispatchSettings,
    mut receiver: mpsc::UnboundedReceiver<i64>,
    stats: Arc<DispatchStats>,
) {
    let permits = Arc::new(Semaphore::new(settings.max_concurrent_jobs.max(1)));
    // listing id -> "another run was requested while this one was in flight"
    let in_flight: Arc<DashMap<i64, bool>> = Arc::new(DashMap::new());
    let mut jobs = JoinSet::new();

    while let Some(listing_id) = receiver.recv().await {
        // Reap finished jobs so the set doesn't grow with the queue
        while let Some(result) = jobs.try_join_next() {
            if let Err(e) = result {
                tracing::error!(error = %e, "Moderation job panicked");
            }
        }

        match in_flight.entry(listing_id) {
            Entry::Occupied(mut entry) => {
                tracing::debug!(listing_id, "Run already in flight, coalescing");
                *entry.get_mut() = true;
                continue;
            }
            Entry::Vacant(entry) => {
                entry.insert(false);
            }
        }

        let permit = match Arc::clone(&permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let moderator = Arc::clone(&moderator);
        let settings = settings.clone();
        let in_flight = Arc::clone(&in_flight);
        let stats = Arc::clone(&stats);

        jobs.spawn(async move {
            let mut guard = InFlightGuard {
                in_flight,
                stats,
                listing_id,
                armed: true,
            };
            loop {
                run_job(moderator.as_ref(), listing_id, &settings, &guard.stats).await;

                // Done unless someone asked for another run meanwhile
                if guard
                    .in_flight
                    .remove_if(&listing_id, |_, rerun| !*rerun)
                    .is_some()
                {
                    guard.armed = false;
                    break;
                }
                if let Some(mut rerun) = guard.in_flight.get_mut(&listing_id) {
                    *rerun = false;
                }
            }
            drop(permit);
        });
    }

    while let Some(result) = jobs.join_next().await {
        if let Err(e) = result {
            tracing::error!(error = %e, "Moderation job panicked");
        }
    }
    tracing::debug!("Moderation worker stopped");
}

/// Releases a listing's in-flight slot if its job unwinds before finishing,
/// so later submissions for that listing are not coalesced into a dead run.
struct InFlightGuard {
    in_flight: Arc<DashMap<i64, bool>>,
    stats: Arc<DispatchStats>,
    listing_id: i64,
    armed: bool,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.armed {
            self.in_flight.remove(&self.listing_id);
            self.stats.failed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

async fn run_job<M: Moderator + ?Sized>(
    moderator: &M,
    listing_id: i64,
    settings: &DispatchSettings,
    stats: &DispatchStats,
) {
    let result = match moderator.moderate(listing_id).await {
        Err(ModerationError::Persistence { decision, message, .. }) => {
            tracing::warn!(listing_id, error = %message, "Moderation write failed, retrying");
            retry_persist(moderator, listing_id, decision, settings).await
        }
        other => other,
    };

    match result {
        Ok(ModerationOutcome::Decided(decision)) => {
            stats.decided.fetch_add(1, Ordering::SeqCst);
            tracing::info!(listing_id, status = %decision.status, "Listing moderated");
        }
        Ok(ModerationOutcome::Skipped) => {
            stats.skipped.fetch_add(1, Ordering::SeqCst);
        }
        Err(e) => {
            stats.failed.fetch_add(1, Ordering::SeqCst);
            tracing::error!(
                listing_id,
                error = %e,
                "Moderation failed, listing left unchanged"
            );
        }
    }
}

async fn retry_persist<M: Moderator + ?Sized>(
    moderator: &M,
    listing_id: i64,
    decision: ModerationDecision,
    settings: &DispatchSettings,
) -> Result<ModerationOutcome, ModerationError> {
    let mut backoff = settings.persist_backoff;
    let mut attempts_left = settings.persist_attempts.saturating_sub(1);

    loop {
        if attempts_left == 0 {
            return Err(ModerationError::Persistence {
                listing_id,
                decision,
                message: format!(
                    "gave up after {} attempts",
                    settings.persist_attempts.max(1)
                ),
            });
        }
        tokio::time::sleep(backoff).await;
        attempts_left -= 1;

        match moderator.persist_decision(listing_id, &decision).await {
            Ok(outcome) => return Ok(outcome),
            Err(e) => {
                tracing::warn!(listing_id, error = %e, attempts_left, "Moderation write retry failed");
                backoff = backoff.saturating_mul(2);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::moderation::fallback_heuristic::tests::sample_listing;
    use crate::core::moderation::image_classifier::tests::ScriptedImageProvider;
    use crate::core::moderation::moderation_service::tests::{
        test_config, MockListingRepository,
    };
    use crate::core::moderation::text_classifier::tests::ScriptedTextProvider;
    use crate::core::moderation::{Listing, ListingStatus, ModerationService};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    fn fast_settings() -> DispatchSettings {
        DispatchSettings {
            max_concurrent_jobs: 4,
            persist_attempts: 3,
            persist_backoff: Duration::from_millis(1),
        }
    }

    /// Moderator that records overlapping runs per listing.
    struct CountingModerator {
        runs: DashMap<i64, u32>,
        active: DashMap<i64, u32>,
        overlaps: AtomicU32,
        delay: Duration,
    }

    impl CountingModerator {
        fn new(delay: Duration) -> Self {
            Self {
                runs: DashMap::new(),
                active: DashMap::new(),
                overlaps: AtomicU32::new(0),
                delay,
            }
        }
    }

    #[async_trait]
    impl Moderator for CountingModerator {
        async fn moderate(&self, listing_id: i64) -> Result<ModerationOutcome, ModerationError> {
            {
                let mut active = self.active.entry(listing_id).or_insert(0);
                *active += 1;
                if *active > 1 {
                    self.overlaps.fetch_add(1, Ordering::SeqCst);
                }
            }
            tokio::time::sleep(self.delay).await;
            *self.runs.entry(listing_id).or_insert(0) += 1;
            *self.active.entry(listing_id).or_insert(1) -= 1;

            Ok(ModerationOutcome::Decided(ModerationDecision {
                status: ListingStatus::Approved,
                reason: None,
            }))
        }

        async fn persist_decision(
            &self,
            _listing_id: i64,
            decision: &ModerationDecision,
        ) -> Result<ModerationOutcome, ModerationError> {
            Ok(ModerationOutcome::Decided(decision.clone()))
        }
    }

    fn approving_service(
        repository: MockListingRepository,
    ) -> Arc<ModerationService<MockListingRepository, ScriptedTextProvider, ScriptedImageProvider>>
    {
        Arc::new(ModerationService::new(
            repository,
            ScriptedTextProvider::new(vec![Ok(r#"{"action": "approve"}"#); 8]),
            ScriptedImageProvider::new(),
            test_config(),
        ))
    }

    #[tokio::test]
    async fn test_submitted_listings_are_moderated() {
        let repository = MockListingRepository::new()
            .with_listing(sample_listing())
            .with_listing(Listing {
                id: 2,
                ..sample_listing()
            });
        let service = approving_service(repository);
        let dispatcher = ModerationDispatcher::spawn(Arc::clone(&service), fast_settings());

        dispatcher.submit(1).unwrap();
        dispatcher.submit(2).unwrap();
        dispatcher.submit(99).unwrap();
        let summary = dispatcher.shutdown().await;

        assert_eq!(
            summary,
            DispatchSummary {
                decided: 2,
                skipped: 1,
                failed: 0
            }
        );
        assert_eq!(service.repository().get(1).status, ListingStatus::Approved);
        assert_eq!(service.repository().get(2).status, ListingStatus::Approved);
    }

    #[tokio::test]
    async fn test_failed_write_is_retried() {
        let repository = MockListingRepository::new()
            .with_listing(sample_listing())
            .fail_next_writes(2);
        let service = approving_service(repository);
        let dispatcher = ModerationDispatcher::spawn(Arc::clone(&service), fast_settings());

        dispatcher.submit(1).unwrap();
        let summary = dispatcher.shutdown().await;

        assert_eq!(summary.decided, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(service.repository().get(1).status, ListingStatus::Approved);
    }

    #[tokio::test]
    async fn test_write_retries_exhausted_counts_failure() {
        let repository = MockListingRepository::new()
            .with_listing(sample_listing())
            .fail_next_writes(10);
        let service = approving_service(repository);
        let dispatcher = ModerationDispatcher::spawn(Arc::clone(&service), fast_settings());

        dispatcher.submit(1).unwrap();
        let summary = dispatcher.shutdown().await;

        assert_eq!(summary.failed, 1);
        assert_eq!(service.repository().get(1).status, ListingStatus::Pending);
        // First write plus two retries
        assert_eq!(
            service.repository().failing_writes.load(Ordering::SeqCst),
            7
        );
    }

    /// Panics on the first run of every listing, approves afterwards.
    struct PanicOnceModerator {
        runs: DashMap<i64, u32>,
    }

    #[async_trait]
    impl Moderator for PanicOnceModerator {
        async fn moderate(&self, listing_id: i64) -> Result<ModerationOutcome, ModerationError> {
            let run = {
                let mut runs = self.runs.entry(listing_id).or_insert(0);
                *runs += 1;
                *runs
            };
            if run == 1 {
                panic!("classifier blew up");
            }
            Ok(ModerationOutcome::Decided(ModerationDecision {
                status: ListingStatus::Approved,
                reason: None,
            }))
        }

        async fn persist_decision(
            &self,
            _listing_id: i64,
            decision: &ModerationDecision,
        ) -> Result<ModerationOutcome, ModerationError> {
            Ok(ModerationOutcome::Decided(decision.clone()))
        }
    }

    #[tokio::test]
    async fn test_panicked_job_releases_listing() {
        let moderator = Arc::new(PanicOnceModerator {
            runs: DashMap::new(),
        });
        let dispatcher = ModerationDispatcher::spawn(Arc::clone(&moderator), fast_settings());

        dispatcher.submit(7).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        dispatcher.submit(7).unwrap();
        let summary = dispatcher.shutdown().await;

        assert_eq!(*moderator.runs.get(&7).unwrap(), 2);
        assert_eq!(
            summary,
            DispatchSummary {
                decided: 1,
                skipped: 0,
                failed: 1
            }
        );
    }

    #[tokio::test]
    async fn test_same_listing_runs_never_overlap() {
        let moderator = Arc::new(CountingModerator::new(Duration::from_millis(30)));
        let dispatcher = ModerationDispatcher::spawn(Arc::clone(&moderator), fast_settings());

        for _ in 0..5 {
            dispatcher.submit(7).unwrap();
        }
        dispatcher.submit(8).unwrap();
        let summary = dispatcher.shutdown().await;

        assert_eq!(moderator.overlaps.load(Ordering::SeqCst), 0);
        // One run plus one coalesced follow-up
        assert_eq!(*moderator.runs.get(&7).unwrap(), 2);
        assert_eq!(*moderator.runs.get(&8).unwrap(), 1);
        assert_eq!(summary.decided, 3);
    }
}
