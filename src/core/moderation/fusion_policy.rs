// Verdict fusion - combines the text verdict and the image aggregate into the
// status written back to the listing.
//
// Precedence, first match wins:
// 1. any flagged image        -> REJECTED
// 2. text says reject         -> REJECTED
// 3. text says approve        -> APPROVED
// 4. text says manual_review  -> PENDING

use super::moderation_models::{
    ImageAggregate, ListingStatus, ModerationDecision, TextAction, TextVerdict,
    IMAGE_REJECTION_REASON,
};

pub fn fuse(text: &TextVerdict, images: &ImageAggregate) -> ModerationDecision {
    if images.has_inappropriate {
        return ModerationDecision {
            status: ListingStatus::Rejected,
            reason: Some(
                text.reason
                    .clone()
                    .unwrap_or_else(|| IMAGE_REJECTION_REASON.to_string()),
            ),
        };
    }

    match text.action {
        TextAction::Reject => ModerationDecision {
            status: ListingStatus::Rejected,
            reason: text.reason.clone(),
        },
        TextAction::Approve => ModerationDecision {
            status: ListingStatus::Approved,
            reason: None,
        },
        TextAction::ManualReview => ModerationDecision {
            status: ListingStatus::Pending,
            reason: text.reason.clone(),
        },
    }
}
