// HTTP client for the image content-safety service.
//
// Request:  POST {base_url}/moderation/labels
//           {"bucket": "...", "key": "...", "minConfidence": 50.0}
// Response: {"labels": [{"name": "...", "confidence": 97.1, "parentName": "..."}]}

use crate::core::moderation::{ImageSafetyProvider, ModerationLabel};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::time::Duration;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LabelRequest<'a> {
    bucket: &'a str,
    key: &'a str,
    min_confidence: f32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LabelResponse {
    #[serde(default)]
    labels: Vec<ApiLabel>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiLabel {
    name: String,
    confidence: f32,
    #[serde(default)]
    parent_name: Option<String>,
}

impl From<ApiLabel> for ModerationLabel {
    fn from(label: ApiLabel) -> Self {
        ModerationLabel {
            name: label.name,
            confidence: label.confidence,
            // The service sends "" for top-level labels
            parent_name: label.parent_name.filter(|p| !p.is_empty()),
        }
    }
}

pub struct ImageSafetyClient {
    client: Client,
    base_url: String,
    bucket: String,
}

impl ImageSafetyClient {
    pub fn new(
        base_url: String,
        bucket: String,
        api_key: Option<String>,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert("Accept", HeaderValue::from_static("application/json"));
        if let Some(key) = api_key {
            headers.insert(
                "Authorization",
                HeaderValue::from_str(&format!("Bearer {}", key))?,
            );
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            bucket,
        })
    }
}

#[async_trait]
impl ImageSafetyProvider for ImageSafetyClient {
    async fn detect_labels(
        &self,
        storage_key: &str,
        min_confidence: f32,
    ) -> Result<Vec<ModerationLabel>, Box<dyn Error + Send + Sync>> {
        let url = format!("{}/moderation/labels", self.base_url);
        let request = LabelRequest {
            bucket: &self.bucket,
            key: storage_key,
            min_confidence,
        };

        let response = self.client.post(&url).json(&request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await?;
            return Err(format!("Image safety API error: {} - {}", status, text).into());
        }

        let body: LabelResponse = response.json().await?;
        Ok(body.labels.into_iter().map(ModerationLabel::from).collect())
    }
}
