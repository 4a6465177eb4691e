// Image moderation - one content-safety call per listing photo, all in flight
// at once. A failed call only degrades its own image.

use super::call_policy::CallPolicy;
use super::moderation_models::{ImageAggregate, ImageVerdict, ListingImage, ModerationLabel};
use async_trait::async_trait;
use futures::future::join_all;
use std::error::Error;

#[async_trait]
pub trait ImageSafetyProvider: Send + Sync {
    /// Returns the moderation labels detected for the object at `storage_key`
    /// with at least `min_confidence` percent confidence.
    async fn detect_labels(
        &self,
        storage_key: &str,
        min_confidence: f32,
    ) -> Result<Vec<ModerationLabel>, Box<dyn Error + Send + Sync>>;
}

/// Derive the object-storage key from a stored image URL.
///
/// `https://bucket.s3.region.amazonaws.com/listings/7/a.jpg?v=2` becomes
/// `listings/7/a.jpg`. A value without a scheme is taken to be a key already.
pub fn storage_key_from_url(url: &str) -> Option<String> {
    let url = url.trim();
    let path = match url.split_once("://") {
        Some((_, rest)) => rest.split_once('/').map(|(_, path)| path).unwrap_or(""),
        None => url,
    };
    let path = path.split(&['?', '#'][..]).next().unwrap_or("");
    let key = path.trim_start_matches('/');
    if key.is_empty() {
        None
    } else {
        Some(key.to_string())
    }
}

pub struct ImageModerationClassifier<P: ImageSafetyProvider> {
    provider: P,
    policy: CallPolicy,
}

impl<P: ImageSafetyProvider> ImageModerationClassifier<P> {
    pub fn new(provider: P, policy: CallPolicy) -> Self {
        Self { provider, policy }
    }

    /// Classify every image concurrently and aggregate. Never fails.
    pub async fn classify_images(&self, images: &[ListingImage], threshold: f32) -> ImageAggregate {
        let futures = images
            .iter()
            .map(|image| self.classify_image(image, threshold));
        let verdicts = join_all(futures).await;
        ImageAggregate::from_verdicts(verdicts)
    }

    async fn classify_image(&self, image: &ListingImage, threshold: f32) -> ImageVerdict {
        let Some(key) = storage_key_from_url(&image.url) else {
            tracing::warn!(
                image_id = image.id,
                url = %image.url,
                "Could not derive storage key, treating image as not flagged"
            );
            return ImageVerdict::degraded(&image.url, None, "invalid image url".to_string());
        };

        let provider = &self.provider;
        let key_ref = key.as_str();
        let result = self
            .policy
            .run("image_moderation", move || {
                provider.detect_labels(key_ref, threshold)
            })
            .await;

        match result {
            Ok(labels) => {
                let is_inappropriate = labels.iter().any(|l| l.confidence >= threshold);
                if is_inappropriate {
                    tracing::info!(
                        image_id = image.id,
                        storage_key = %key,
                        labels = ?labels.iter().map(|l| l.name.as_str()).collect::<Vec<_>>(),
                        "Image flagged as inappropriate"
                    );
                }
                ImageVerdict {
                    image_url: image.url.clone(),
                    storage_key: Some(key),
                    is_inappropriate,
                    labels,
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!(
                    image_id = image.id,
                    storage_key = %key,
                    error = %e,
                    "Image moderation call failed, treating image as not flagged"
                );
                ImageVerdict::degraded(&image.url, Some(key), e.to_string())
            }
        }
    }
}
