// Core moderation module - decides whether a rental listing may be published.

pub mod call_policy;
pub mod dispatcher;
pub mod fallback_heuristic;
pub mod fusion_policy;
pub mod image_classifier;
pub mod moderation_models;
pub mod moderation_service;
pub mod text_classifier;

pub use dispatcher::{DispatchSettings, ModerationDispatcher};
pub use image_classifier::ImageSafetyProvider;
pub use moderation_models::*;
pub use moderation_service::*;
pub use text_classifier::TextClassificationProvider;
