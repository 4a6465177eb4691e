// Moderation domain models - data structures for the listing moderation pipeline.
//
// These are pure domain types with no database or HTTP dependencies.
// The infra layer converts rows and API payloads into these.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Maximum number of words kept in a moderation reason.
pub const MAX_REASON_WORDS: usize = 20;

/// Reason stored when an image is flagged and the text classifier gave none.
pub const IMAGE_REJECTION_REASON: &str = "Image moderation failed";

// ============================================================================
// LISTING SNAPSHOT
// ============================================================================

/// Publication status of a listing.
///
/// Every listing starts as `Pending`. Only `Approved` listings are visible
/// to the public query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ListingStatus {
    Pending,
    Approved,
    Rejected,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::Pending => "PENDING",
            ListingStatus::Approved => "APPROVED",
            ListingStatus::Rejected => "REJECTED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(ListingStatus::Pending),
            "APPROVED" => Some(ListingStatus::Approved),
            "REJECTED" => Some(ListingStatus::Rejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A photo attached to a listing. The URL points into object storage.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingImage {
    pub id: i64,
    pub url: String,
}

/// Read-only snapshot of a listing as loaded for one moderation run.
#[derive(Debug, Clone, PartialEq)]
pub struct Listing {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub rent: f64,
    pub room_type: String,
    pub slots_available: u32,
    pub contact: String,
    pub facebook_profile: Option<String>,
    pub formatted_address: Option<String>,
    pub images: Vec<ListingImage>,
    pub status: ListingStatus,
    pub moderated_at: Option<DateTime<Utc>>,
    pub moderation_reason: Option<String>,
}

// ============================================================================
// VERDICTS
// ============================================================================

/// What the text classifier wants done with a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextAction {
    Approve,
    ManualReview,
    Reject,
}

impl std::fmt::Display for TextAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TextAction::Approve => write!(f, "approve"),
            TextAction::ManualReview => write!(f, "manual_review"),
            TextAction::Reject => write!(f, "reject"),
        }
    }
}

/// Which classifier produced a text verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictSource {
    /// The external text-classification service.
    Classifier,
    /// The local rule-based heuristic.
    Fallback,
}

impl std::fmt::Display for VerdictSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerdictSource::Classifier => write!(f, "classifier"),
            VerdictSource::Fallback => write!(f, "fallback"),
        }
    }
}

/// Judgment on a listing's text.
#[derive(Debug, Clone, PartialEq)]
pub struct TextVerdict {
    pub action: TextAction,
    /// Present only when `action` is not `Approve`.
    pub reason: Option<String>,
    pub source: VerdictSource,
}

impl TextVerdict {
    /// Build a verdict, normalizing the reason.
    ///
    /// Approvals never carry a reason; other reasons are trimmed, clipped to
    /// [`MAX_REASON_WORDS`] words and dropped when empty.
    pub fn new(action: TextAction, reason: Option<String>, source: VerdictSource) -> Self {
        let reason = match action {
            TextAction::Approve => None,
            _ => reason.and_then(|r| clip_reason(&r)),
        };
        Self {
            action,
            reason,
            source,
        }
    }

    pub fn approve(source: VerdictSource) -> Self {
        Self::new(TextAction::Approve, None, source)
    }
}

fn clip_reason(reason: &str) -> Option<String> {
    let words: Vec<&str> = reason.split_whitespace().take(MAX_REASON_WORDS).collect();
    if words.is_empty() {
        None
    } else {
        Some(words.join(" "))
    }
}

/// A label returned by the image content-safety service.
#[derive(Debug, Clone, PartialEq)]
pub struct ModerationLabel {
    pub name: String,
    pub confidence: f32,
    pub parent_name: Option<String>,
}

/// Judgment on a single image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageVerdict {
    pub image_url: String,
    pub storage_key: Option<String>,
    pub is_inappropriate: bool,
    /// Informational only; the decision uses `is_inappropriate`.
    pub labels: Vec<ModerationLabel>,
    /// Set when the call failed and the image was degraded to "not flagged".
    pub error: Option<String>,
}

impl ImageVerdict {
    pub fn degraded(image_url: &str, storage_key: Option<String>, error: String) -> Self {
        Self {
            image_url: image_url.to_string(),
            storage_key,
            is_inappropriate: false,
            labels: Vec::new(),
            error: Some(error),
        }
    }
}

/// Combined result over every image of a listing.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ImageAggregate {
    pub has_inappropriate: bool,
    pub details: Vec<ImageVerdict>,
}

impl ImageAggregate {
    pub fn from_verdicts(details: Vec<ImageVerdict>) -> Self {
        Self {
            has_inappropriate: details.iter().any(|v| v.is_inappropriate),
            details,
        }
    }

    pub fn flagged_count(&self) -> usize {
        self.details.iter().filter(|v| v.is_inappropriate).count()
    }

    pub fn degraded_count(&self) -> usize {
        self.details.iter().filter(|v| v.error.is_some()).count()
    }
}

// ============================================================================
// DECISIONS
// ============================================================================

/// Final status and reason written back to the listing.
#[derive(Debug, Clone, PartialEq)]
pub struct ModerationDecision {
    pub status: ListingStatus,
    pub reason: Option<String>,
}

/// Result of one moderation run.
#[derive(Debug, Clone, PartialEq)]
pub enum ModerationOutcome {
    /// A decision was computed and written.
    Decided(ModerationDecision),
    /// The listing was missing, nothing was written.
    Skipped,
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Tuning knobs for a moderation run.
#[derive(Debug, Clone)]
pub struct ModerationConfig {
    /// Minimum label confidence (percent) for an image to count as flagged.
    pub image_confidence_threshold: f32,
    /// Upper bound for a single external call attempt.
    pub call_timeout: Duration,
    /// Total attempts per external call, including the first.
    pub max_attempts: u32,
    /// Backoff before the first retry; doubles on each further retry.
    pub initial_backoff: Duration,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            image_confidence_threshold: 50.0,
            call_timeout: Duration::from_secs(20),
            max_attempts: 2,
            initial_backoff: Duration::from_millis(500),
        }
    }
}
