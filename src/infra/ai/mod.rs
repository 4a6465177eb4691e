pub mod openrouter_client;

pub use openrouter_client::{OpenRouterClient, OpenRouterConfig};
