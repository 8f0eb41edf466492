//! Downloader boundary: turns a request into a response, never an error

pub mod fake;
pub mod http;

use async_trait::async_trait;

use crate::crawler::{Request, Response};

pub use self::fake::FakeDownloader;
pub use self::http::HttpClientDownloader;

/// Well-known downloader names
pub mod names {
    pub const HTTP_CLIENT: &str = "http_client";
    pub const PPPOE_HTTP_CLIENT: &str = "pppoe_http_client";
    pub const FAKE: &str = "fake";

    /// Downloaders that redial on a pattern match need the pattern on every request
    pub fn requires_pattern(name: &str) -> bool {
        name.to_lowercase().contains("pppoe")
    }
}

/// Fetches requests. Transport failures come back as responses with a
/// synthetic status code.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Downloader type, also the dispatch topic key
    fn name(&self) -> &str;

    async fn download(&self, request: &Request) -> Response;
}
