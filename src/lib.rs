pub mod background;
pub mod classifier;
pub mod config;
pub mod feeds;
pub mod fetcher;
pub mod librarian;
pub mod library;
pub mod loader;
pub mod ontology;
pub mod openai_provider;
pub mod processors;
pub mod provider;
pub mod proxies;
pub mod resources;
pub mod rotator;
pub mod types;
pub mod user_settings;
pub mod worker;

pub use types::{Error, Result};
