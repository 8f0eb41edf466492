use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{names, Downloader};
use crate::crawler::{Request, Response};

/// Serves canned pages without touching the network
pub struct FakeDownloader {
    pages: HashMap<String, (u16, String)>,
    default_body: String,
    downloads: AtomicUsize,
}

impl Default for FakeDownloader {
    fn default() -> Self {
        Self {
            pages: HashMap::new(),
            default_body: "<html></html>".to_string(),
            downloads: AtomicUsize::new(0),
        }
    }
}

impl FakeDownloader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `body` with status 200 for `url`
    pub fn with_page(self, url: &str, body: &str) -> Self {
        self.with_status(url, 200, body)
    }

    pub fn with_status(mut self, url: &str, status_code: u16, body: &str) -> Self {
        self.pages.insert(url.to_string(), (status_code, body.to_string()));
        self
    }

    /// Number of downloads served so far
    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Downloader for FakeDownloader {
    fn name(&self) -> &str {
        names::FAKE
    }

    async fn download(&self, request: &Request) -> Response {
        self.downloads.fetch_add(1, Ordering::SeqCst);

        let (status_code, body) = self
            .pages
            .get(request.url.as_str())
            .map(|(status, body)| (*status, body.as_str()))
            .unwrap_or((200, self.default_body.as_str()));

        let mut response = Response::new(request.hash(), status_code)
            .with_header("content-type", "text/html; charset=utf-8")
            .with_content(body.as_bytes().to_vec());
        response.target_url = Some(request.url.to_string());
        response
    }
}
