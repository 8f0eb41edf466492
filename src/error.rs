//! Error types for the crawl engine

use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, SpiderError>;

/// Error type for engine operations
#[derive(Debug, Error)]
pub enum SpiderError {
    /// Invalid configuration, detected before a crawl starts
    #[error("Configuration error: {0}")]
    Config(String),

    /// A component was used outside of its contract
    #[error("Usage error: {0}")]
    Usage(String),

    /// The request targets a downloader that needs a redial pattern
    #[error("Request {uri}, {hash} uses downloader {downloader} but has no PPPoE pattern")]
    MissingPattern {
        uri: String,
        hash: String,
        downloader: String,
    },

    /// A request hash is already tracked as in flight
    #[error("Request {uri}, {hash} is already in flight")]
    InFlightCollision { uri: String, hash: String },

    /// Message bus failure
    #[error("Message bus error: {0}")]
    Bus(String),

    /// Redis failure
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// URL parse error
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
}
