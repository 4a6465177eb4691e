// Listing moderation service - the orchestrator of one moderation run.
//
// A run:
// - loads the listing snapshot
// - classifies text and images concurrently
// - fuses both verdicts
// - writes status, moderated_at and reason back in one update
//
// NO database or HTTP code here - storage and classifiers come in through traits.

use super::call_policy::CallPolicy;
use super::fusion_policy::fuse;
use super::image_classifier::{ImageModerationClassifier, ImageSafetyProvider};
use super::moderation_models::{
    Listing, ListingStatus, ModerationConfig, ModerationDecision, ModerationOutcome,
};
use super::text_classifier::{TextClassificationProvider, TextModerationClassifier};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum ModerationError {
    #[error("Storage error: {0}")]
    StorageError(String),

    /// The decision was computed but could not be written.
    #[error("Failed to persist moderation result for listing {listing_id}: {message}")]
    Persistence {
        listing_id: i64,
        decision: ModerationDecision,
        message: String,
    },
}

// ============================================================================
// STORAGE TRAIT (PORT)
// ============================================================================

#[async_trait]
pub trait ListingRepository: Send + Sync {
    /// Load a listing with its images and address, or `None` if it is gone.
    async fn get_listing_with_images_and_address(
        &self,
        listing_id: i64,
    ) -> Result<Option<Listing>, ModerationError>;

    /// Write the moderation result in a single update.
    ///
    /// Returns `false` when no listing with that id exists.
    async fn update_moderation_result(
        &self,
        listing_id: i64,
        status: ListingStatus,
        moderated_at: DateTime<Utc>,
        reason: Option<String>,
    ) -> Result<bool, ModerationError>;

    /// Ids of PENDING listings that have never been moderated, oldest first.
    async fn list_unmoderated_ids(&self, limit: u32) -> Result<Vec<i64>, ModerationError>;
}

// ============================================================================
// MODERATOR TRAIT
// ============================================================================

/// What the background dispatcher needs from a moderation service.
#[async_trait]
pub trait Moderator: Send + Sync + 'static {
    async fn moderate(&self, listing_id: i64) -> Result<ModerationOutcome, ModerationError>;

    /// Retry only the final write of an already computed decision.
    async fn persist_decision(
        &self,
        listing_id: i64,
        decision: &ModerationDecision,
    ) -> Result<ModerationOutcome, ModerationError>;
}

// ============================================================================
// CORE SERVICE
// ============================================================================

pub struct ModerationService<R, T, I>
where
    R: ListingRepository,
    T: TextClassificationProvider,
    I: ImageSafetyProvider,
{
    repository: R,
    text: TextModerationClassifier<T>,
    images: ImageModerationClassifier<I>,
    config: ModerationConfig,
}

impl<R, T, I> ModerationService<R, T, I>
where
    R: ListingRepository,
    T: TextClassificationProvider,
    I: ImageSafetyProvider,
{
    pub fn new(repository: R, text_provider: T, image_provider: I, config: ModerationConfig) -> Self {
        let policy = CallPolicy::from_config(&config);
        Self {
            repository,
            text: TextModerationClassifier::new(text_provider, policy.clone()),
            images: ImageModerationClassifier::new(image_provider, policy),
            config,
        }
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    /// Run moderation for one listing.
    ///
    /// Classifier failures never surface here; they turn into verdicts. Only
    /// the storage read and the final write can fail.
    pub async fn moderate(&self, listing_id: i64) -> Result<ModerationOutcome, ModerationError> {
        let Some(listing) = self
            .repository
            .get_listing_with_images_and_address(listing_id)
            .await?
        else {
            tracing::info!(listing_id, "Listing not found, skipping moderation");
            return Ok(ModerationOutcome::Skipped);
        };

        // Both branches always resolve; wait for both before deciding.
        let (text_verdict, image_aggregate) = tokio::join!(
            self.text.classify_text(&listing),
            self.images
                .classify_images(&listing.images, self.config.image_confidence_threshold),
        );

        let decision = fuse(&text_verdict, &image_aggregate);

        tracing::info!(
            listing_id,
            text_action = %text_verdict.action,
            text_source = %text_verdict.source,
            images = image_aggregate.details.len(),
            images_flagged = image_aggregate.flagged_count(),
            images_degraded = image_aggregate.degraded_count(),
            status = %decision.status,
            reason = decision.reason.as_deref().unwrap_or(""),
            "Moderation decision"
        );

        self.persist_decision(listing_id, &decision).await
    }

    /// Write a decision with `moderated_at = now`.
    pub async fn persist_decision(
        &self,
        listing_id: i64,
        decision: &ModerationDecision,
    ) -> Result<ModerationOutcome, ModerationError> {
        let written = self
            .repository
            .update_moderation_result(
                listing_id,
                decision.status,
                Utc::now(),
                decision.reason.clone(),
            )
            .await
            .map_err(|e| ModerationError::Persistence {
                listing_id,
                decision: decision.clone(),
                message: e.to_string(),
            })?;

        if written {
            Ok(ModerationOutcome::Decided(decision.clone()))
        } else {
            tracing::warn!(listing_id, "Listing disappeared before the result was written");
            Ok(ModerationOutcome::Skipped)
        }
    }
}

#[async_trait]
impl<R, T, I> Moderator for ModerationService<R, T, I>
where
    R: ListingRepository + 'static,
    T: TextClassificationProvider + 'static,
    I: ImageSafetyProvider + 'static,
{
    async fn moderate(&self, listing_id: i64) -> Result<ModerationOutcome, ModerationError> {
        ModerationService::moderate(self, listing_id).await
    }

    async fn persist_decision(
        &self,
        listing_id: i64,
        decision: &ModerationDecision,
    ) -> Result<ModerationOutcome, ModerationError> {
        ModerationService::persist_decision(self, listing_id, decision).await
    }
}

// ============================================================================
// TESTS
// ============================================================================
