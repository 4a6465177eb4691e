// Local rule-based text classifier.
//
// Used whenever the external text classifier is unreachable, slow, or returns
// something we can't decode. It is synchronous and has no dependencies so a
// moderation run can always produce a verdict.

use super::moderation_models::{Listing, TextAction, TextVerdict, VerdictSource};

/// Phrases that demand money before the renter has seen the unit.
const PAY_BEFORE_VIEWING: &[&str] = &[
    "pay before viewing",
    "payment before viewing",
    "pay before visit",
    "pay first before viewing",
    "deposit before viewing",
    "send payment before viewing",
    "pay to reserve before viewing",
];

const NO_REFUND: &[&str] = &["no refund", "non-refundable", "nonrefundable"];

/// Terms that are never acceptable in a rental listing. Matched as whole
/// words so house rules like "no drugs" or names that merely contain a term
/// do not trip them.
const BANNED_TERMS: &[&str] = &[
    "escort service",
    "sexual service",
    "sexual services",
    "adult service",
    "adult services",
    "nude",
    "nudes",
    "drugs for sale",
    "no blacks",
    "no muslims",
    "no gays",
    "whites only",
];

/// Ambiguous payment or contact patterns worth a human look.
const SUSPICIOUS_PHRASES: &[&str] = &[
    "guaranteed slot",
    "reservation fee",
    "processing fee",
    "western union",
    "wire transfer",
    "gift card",
    "crypto",
    "bitcoin",
    "telegram only",
    "whatsapp only",
    "message me privately for payment",
];

const MIN_DESCRIPTION_CHARS: usize = 20;

/// Lowest believable monthly rent for a room type.
fn rent_floor(room_type: &str) -> f64 {
    let room_type = room_type.trim().to_lowercase();
    if room_type.contains("bedspace")
        || room_type.contains("bed space")
        || room_type.contains("shared")
        || room_type.contains("dorm")
    {
        1000.0
    } else if room_type.contains("studio")
        || room_type.contains("entire")
        || room_type.contains("whole")
        || room_type.contains("apartment")
    {
        3500.0
    } else if room_type.contains("private") || room_type.contains("solo") {
        2500.0
    } else {
        1500.0
    }
}

fn find_any<'a>(haystack: &str, needles: &[&'a str]) -> Option<&'a str> {
    needles.iter().copied().find(|needle| haystack.contains(needle))
}

fn contains_word(haystack: &str, needle: &str) -> bool {
    haystack.match_indices(needle).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + needle.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

fn find_any_word<'a>(haystack: &str, needles: &[&'a str]) -> Option<&'a str> {
    needles
        .iter()
        .copied()
        .find(|needle| contains_word(haystack, needle))
}

/// Classify a listing using only local rules. Never fails.
pub fn classify_text_locally(listing: &Listing) -> TextVerdict {
    let text = format!(
        "{} {} {} {}",
        listing.title,
        listing.description,
        listing.contact,
        listing.facebook_profile.as_deref().unwrap_or_default()
    )
    .to_lowercase();

    // Clear violations first
    if find_any(&text, PAY_BEFORE_VIEWING).is_some() {
        return reject("Demands payment before the unit can be viewed");
    }
    if find_any(&text, NO_REFUND).is_some() {
        return reject("States payments are non-refundable, a common rental scam pattern");
    }
    // Contact handles and profile URLs are left out of the banned-term scan
    let body = format!("{} {}", listing.title, listing.description).to_lowercase();
    if let Some(term) = find_any_word(&body, BANNED_TERMS) {
        return reject(&format!("Contains prohibited content: \"{}\"", term));
    }

    // Ambiguous signals
    if !listing.rent.is_finite() || listing.rent <= 0.0 {
        return review("Rent is missing or not a positive amount");
    }
    let floor = rent_floor(&listing.room_type);
    if listing.rent < floor {
        return review(&format!(
            "Rent {} is unusually low for a {} listing",
            listing.rent, listing.room_type
        ));
    }
    if let Some(phrase) = find_any(&text, SUSPICIOUS_PHRASES) {
        return review(&format!("Unclear payment or contact process: \"{}\"", phrase));
    }
    if listing.contact.trim().is_empty()
        && listing
            .facebook_profile
            .as_deref()
            .map_or(true, |p| p.trim().is_empty())
    {
        return review("No way to contact the landlord was provided");
    }
    if listing.description.trim().chars().count() < MIN_DESCRIPTION_CHARS {
        return review("Description is too short to assess");
    }

    TextVerdict::approve(VerdictSource::Fallback)
}

fn reject(reason: &str) -> TextVerdict {
    TextVerdict::new(
        TextAction::Reject,
        Some(reason.to_string()),
        VerdictSource::Fallback,
    )
}

fn review(reason: &str) -> TextVerdict {
    TextVerdict::new(
        TextAction::ManualReview,
        Some(reason.to_string()),
        VerdictSource::Fallback,
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::moderation::ListingStatus;

    /// A listing that every rule should approve.
    pub(crate) fn sample_listing() -> Listing {
        Listing {
            id: 1,
            title: "Bright private room near campus".to_string(),
            description: "Furnished room with wifi, shared kitchen, water included. Viewing any day."
                .to_string(),
            rent: 5000.0,
            room_type: "Private room".to_string(),
            slots_available: 1,
            contact: "0917 555 0101".to_string(),
            facebook_profile: Some("https://facebook.com/landlord".to_string()),
            formatted_address: Some("12 Katipunan Ave, Quezon City".to_string()),
            images: Vec::new(),
            status: ListingStatus::Pending,
            moderated_at: None,
            moderation_reason: None,
        }
    }

    #[test]
    fn test_normal_listing_approved() {
        let verdict = classify_text_locally(&sample_listing());
        assert_eq!(verdict.action, TextAction::Approve);
        assert_eq!(verdict.reason, None);
        assert_eq!(verdict.source, VerdictSource::Fallback);
    }

    #[test]
    fn test_pay_before_viewing_rejected() {
        let listing = Listing {
            rent: 1500.0,
            description: "pay before viewing, guaranteed slot, no refunds".to_string(),
            ..sample_listing()
        };
        let verdict = classify_text_locally(&listing);
        assert_eq!(verdict.action, TextAction::Reject);
        assert!(verdict.reason.is_some());
    }

    #[test]
    fn test_no_refund_rejected() {
        let listing = Listing {
            description: "Reserve now. Deposit is NON-REFUNDABLE once sent.".to_string(),
            ..sample_listing()
        };
        assert_eq!(classify_text_locally(&listing).action, TextAction::Reject);
    }

    #[test]
    fn test_banned_term_rejected() {
        let listing = Listing {
            title: "Room for rent, whites only".to_string(),
            ..sample_listing()
        };
        assert_eq!(classify_text_locally(&listing).action, TextAction::Reject);
    }

    #[test]
    fn test_house_rules_are_not_banned_terms() {
        let listing = Listing {
            room_type: "Dorm".to_string(),
            description: "Quiet dorm. House rules: no smoking, no drugs, no pets.".to_string(),
            facebook_profile: Some("https://facebook.com/nudelman".to_string()),
            ..sample_listing()
        };
        assert_eq!(classify_text_locally(&listing).action, TextAction::Approve);
    }

    #[test]
    fn test_banned_term_needs_whole_word() {
        assert!(contains_word("room with nudes posted", "nudes"));
        assert!(contains_word("nude.", "nude"));
        assert!(!contains_word("ask for nudelman", "nude"));
        assert!(!contains_word("denude", "nude"));
    }

    #[test]
    fn test_bedroom_is_not_a_bedspace() {
        for room_type in ["2-bedroom apartment", "Private bedroom"] {
            let listing = Listing {
                rent: 1200.0,
                room_type: room_type.to_string(),
                ..sample_listing()
            };
            assert_eq!(
                classify_text_locally(&listing).action,
                TextAction::ManualReview,
                "{}",
                room_type
            );
        }
    }

    #[test]
    fn test_short_description_needs_review() {
        let listing = Listing {
            description: "Room for rent.".to_string(),
            ..sample_listing()
        };
        let verdict = classify_text_locally(&listing);
        assert_eq!(verdict.action, TextAction::ManualReview);
        assert!(verdict.reason.unwrap().contains("too short"));
    }

    #[test]
    fn test_low_rent_needs_review() {
        let listing = Listing {
            rent: 800.0,
            ..sample_listing()
        };
        let verdict = classify_text_locally(&listing);
        assert_eq!(verdict.action, TextAction::ManualReview);
        assert!(verdict.reason.unwrap().contains("unusually low"));
    }

    #[test]
    fn test_bedspace_floor_is_lower() {
        let listing = Listing {
            rent: 1200.0,
            room_type: "Bedspace".to_string(),
            ..sample_listing()
        };
        assert_eq!(classify_text_locally(&listing).action, TextAction::Approve);
    }

    #[test]
    fn test_zero_rent_needs_review() {
        let listing = Listing {
            rent: 0.0,
            ..sample_listing()
        };
        assert_eq!(
            classify_text_locally(&listing).action,
            TextAction::ManualReview
        );
    }

    #[test]
    fn test_suspicious_payment_needs_review() {
        let listing = Listing {
            description: "Nice room. Pay the reservation fee through western union.".to_string(),
            ..sample_listing()
        };
        assert_eq!(
            classify_text_locally(&listing).action,
            TextAction::ManualReview
        );
    }

    #[test]
    fn test_missing_contact_needs_review() {
        let listing = Listing {
            contact: "  ".to_string(),
            facebook_profile: None,
            ..sample_listing()
        };
        assert_eq!(
            classify_text_locally(&listing).action,
            TextAction::ManualReview
        );
    }

    #[test]
    fn test_deterministic() {
        let listing = Listing {
            rent: 900.0,
            ..sample_listing()
        };
        assert_eq!(
            classify_text_locally(&listing),
            classify_text_locally(&listing)
        );
    }
}
