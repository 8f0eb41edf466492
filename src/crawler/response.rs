use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Synthetic status codes for transport failures
pub mod status {
    /// Connection error or no response at all
    pub const NO_RESPONSE: u16 = 0;

    /// The request did not complete within its timeout
    pub const CONNECTION_TIMED_OUT: u16 = 4;

    /// The redirect chain exceeded its limit
    pub const TOO_MANY_REDIRECTS: u16 = 5;
}

/// Transport failure reported by a downloader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailure {
    NoResponse,
    TimedOut,
    TooManyRedirects,
}

impl TransportFailure {
    pub fn status_code(self) -> u16 {
        match self {
            TransportFailure::NoResponse => status::NO_RESPONSE,
            TransportFailure::TimedOut => status::CONNECTION_TIMED_OUT,
            TransportFailure::TooManyRedirects => status::TOO_MANY_REDIRECTS,
        }
    }
}

/// One hop of a redirect chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectResponse {
    pub request_uri: String,
    pub target_uri: String,
    pub status_code: u16,
    pub time_to_headers_ms: u64,
    pub order: u32,
}

/// Result of downloading a request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Hash of the request this response answers
    pub request_hash: String,

    /// Agent that produced this response
    pub agent: String,

    pub status_code: u16,
    pub reason_phrase: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub content: Vec<u8>,

    /// Final URL after redirects
    pub target_url: Option<String>,

    pub redirects: Vec<RedirectResponse>,

    /// Total download time in milliseconds
    pub elapsed_ms: u64,

    pub time_to_headers_ms: u64,
}

impl Response {
    pub fn new(request_hash: &str, status_code: u16) -> Self {
        Self {
            request_hash: request_hash.to_string(),
            agent: String::new(),
            status_code,
            reason_phrase: None,
            headers: BTreeMap::new(),
            content: Vec::new(),
            target_url: None,
            redirects: Vec::new(),
            elapsed_ms: 0,
            time_to_headers_ms: 0,
        }
    }

    /// Build a failure-shaped response for a transport error
    pub fn failed(request_hash: &str, failure: TransportFailure, reason: impl Into<String>) -> Self {
        let mut response = Self::new(request_hash, failure.status_code());
        response.reason_phrase = Some(reason.into());
        response
    }

    pub fn with_content(mut self, content: impl Into<Vec<u8>>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..=299).contains(&self.status_code)
    }

    /// Body as text, replacing invalid UTF-8 sequences
    pub fn read_as_string(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }

    /// Media type from the content-type header, lowercased and without parameters
    pub fn content_type(&self) -> Option<String> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .and_then(|(_, value)| value.split(';').next())
            .map(|media| media.trim().to_lowercase())
    }
}
