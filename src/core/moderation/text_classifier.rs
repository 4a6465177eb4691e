// Text moderation - asks an external language classifier for a verdict on the
// listing text, falling back to the local heuristic whenever the answer is
// missing, late, or malformed.

use super::call_policy::CallPolicy;
use super::fallback_heuristic::classify_text_locally;
use super::moderation_models::{Listing, TextAction, TextVerdict, VerdictSource};
use async_trait::async_trait;
use serde::Deserialize;
use std::error::Error;

// ============================================================================
// PROVIDER TRAIT (PORT)
// ============================================================================

#[async_trait]
pub trait TextClassificationProvider: Send + Sync {
    /// Sends one prompt to the classification service and returns its raw
    /// text answer.
    async fn classify(&self, prompt: &str) -> Result<String, Box<dyn Error + Send + Sync>>;
}

// ============================================================================
// PROMPT
// ============================================================================

const POLICY_PREAMBLE: &str = r#"You are a content moderator for a student rental listing board.
Decide whether the listing below may be published.

Answer with a single JSON object and nothing else:
{"action": "approve" | "manual_review" | "reject", "reason": "<at most 20 words, omit when approving>"}

Policy:
- approve: the listing is clearly legitimate and compliant.
- manual_review: something is ambiguous or suspicious but not clearly a violation,
  for example an unusually low price for the room type or an unclear payment process.
- reject: a clear violation, for example demanding payment before viewing,
  scams, hateful, discriminatory or sexually explicit content.

Examples:
Listing: "Private room, 5000/month, viewing any weekday, pay on move-in."
Answer: {"action": "approve"}
Listing: "Bedspace 600/month, message me privately for the payment process."
Answer: {"action": "manual_review", "reason": "Price far below market and payment process is unclear"}
Listing: "Slots filling fast! Pay before viewing to guarantee your slot, no refunds."
Answer: {"action": "reject", "reason": "Demands non-refundable payment before viewing"}"#;

/// Build the classification prompt for a listing.
pub fn build_prompt(listing: &Listing) -> String {
    format!(
        "{preamble}\n\nListing to review:\n\
         Title: {title}\n\
         Description: {description}\n\
         Address: {address}\n\
         Contact: {contact}\n\
         Facebook profile: {facebook}\n\
         Monthly rent: {rent}\n\
         Room type: {room_type}\n\
         Slots available: {slots}\n\n\
         Answer:",
        preamble = POLICY_PREAMBLE,
        title = listing.title,
        description = listing.description,
        address = listing.formatted_address.as_deref().unwrap_or("(not provided)"),
        contact = listing.contact,
        facebook = listing.facebook_profile.as_deref().unwrap_or("(not provided)"),
        rent = listing.rent,
        room_type = listing.room_type,
        slots = listing.slots_available,
    )
}

// ============================================================================
// RESPONSE DECODING
// ============================================================================

/// Wire shape of the classifier's answer. `action` must be one of the three
/// known values or decoding fails.
#[derive(Debug, Deserialize)]
struct RawTextVerdict {
    action: TextAction,
    #[serde(default)]
    reason: Option<String>,
}

/// Remove a surrounding markdown code fence (with optional language tag).
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric());
    let rest = rest.trim_end();
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Decode a raw classifier answer into a verdict.
pub fn parse_verdict(raw: &str) -> Result<TextVerdict, serde_json::Error> {
    let decoded: RawTextVerdict = serde_json::from_str(strip_code_fences(raw))?;
    Ok(TextVerdict::new(
        decoded.action,
        decoded.reason,
        VerdictSource::Classifier,
    ))
}

// ============================================================================
// CLASSIFIER
// ============================================================================

pub struct TextModerationClassifier<P: TextClassificationProvider> {
    provider: P,
    policy: CallPolicy,
}

impl<P: TextClassificationProvider> TextModerationClassifier<P> {
    pub fn new(provider: P, policy: CallPolicy) -> Self {
        Self { provider, policy }
    }

    /// Classify the listing text. Never fails: every error path ends in the
    /// local heuristic.
    pub async fn classify_text(&self, listing: &Listing) -> TextVerdict {
        let prompt = build_prompt(listing);
        let provider = &self.provider;
        let prompt = prompt.as_str();

        let raw = match self
            .policy
            .run("text_classification", move || provider.classify(prompt))
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(
                    listing_id = listing.id,
                    error = %e,
                    "Text classifier unavailable, using fallback heuristic"
                );
                return classify_text_locally(listing);
            }
        };

        if raw.trim().is_empty() {
            tracing::warn!(
                listing_id = listing.id,
                "Text classifier returned an empty answer, using fallback heuristic"
            );
            return classify_text_locally(listing);
        }

        match parse_verdict(&raw) {
            Ok(verdict) => {
                tracing::debug!(
                    listing_id = listing.id,
                    action = %verdict.action,
                    "Text classifier verdict"
                );
                verdict
            }
            Err(e) => {
                tracing::warn!(
                    listing_id = listing.id,
                    error = %e,
                    "Could not decode text classifier answer, using fallback heuristic"
                );
                classify_text_locally(listing)
            }
        }
    }
}
