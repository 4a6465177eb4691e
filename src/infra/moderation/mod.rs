// Storage and content-safety implementations for listing moderation.

pub mod image_safety_client;
pub mod sqlite_listing_store;

pub use image_safety_client::ImageSafetyClient;
pub use sqlite_listing_store::{NewListing, SqliteListingStore};
