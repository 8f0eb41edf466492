use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Result;

/// Minimum per-request timeout in milliseconds
pub const MIN_TIMEOUT_MS: u64 = 2000;

/// Default per-request timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// How a request that already went through an agent is routed again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPolicy {
    /// Return to the agent that owns the chain (session affinity)
    #[default]
    Chained,

    /// Any agent of the downloader type
    Random,
}

/// Request body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContent {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl RequestContent {
    pub fn text(content_type: &str, body: &str) -> Self {
        Self {
            content_type: content_type.to_string(),
            bytes: body.as_bytes().to_vec(),
        }
    }
}

/// A fetch request travelling between the spider, the scheduler and the agents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Fingerprint, computed by the request hasher
    hash: String,

    /// Crawl that owns this request
    owner: String,

    /// Agent that served this request last
    pub agent: Option<String>,

    /// Downloader type used to fetch this request
    pub downloader: Option<String>,

    /// Hop count from the seed
    depth: u32,

    /// Number of times this request has been retried
    requested_times: u32,

    /// Dispatch time (ms since epoch)
    timestamp: i64,

    pub method: String,
    pub url: Url,
    pub headers: BTreeMap<String, String>,

    /// Timeout in milliseconds
    timeout: u64,

    pub content: Option<RequestContent>,
    pub policy: RequestPolicy,

    /// Redial detection pattern for PPPoE downloaders
    pub pppoe_pattern: Option<String>,

    pub properties: BTreeMap<String, String>,
}

impl Request {
    /// Create a GET request for an absolute URL
    pub fn new(url: &str) -> Result<Self> {
        Ok(Self::from_url(Url::parse(url)?))
    }

    pub fn from_url(url: Url) -> Self {
        Self {
            hash: String::new(),
            owner: String::new(),
            agent: None,
            downloader: None,
            depth: 0,
            requested_times: 0,
            timestamp: Utc::now().timestamp_millis(),
            method: "GET".to_string(),
            url,
            headers: BTreeMap::new(),
            timeout: DEFAULT_TIMEOUT_MS,
            content: None,
            policy: RequestPolicy::default(),
            pppoe_pattern: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_method(mut self, method: &str) -> Self {
        self.method = method.to_uppercase();
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    /// Set the timeout; values below the floor are raised to it
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.set_timeout(timeout_ms);
        self
    }

    pub fn with_downloader(mut self, downloader: &str) -> Self {
        self.downloader = Some(downloader.to_string());
        self
    }

    pub fn with_policy(mut self, policy: RequestPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_content(mut self, content: RequestContent) -> Self {
        self.content = Some(content);
        self
    }

    pub fn with_pppoe_pattern(mut self, pattern: &str) -> Self {
        self.pppoe_pattern = Some(pattern.to_string());
        self
    }

    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn requested_times(&self) -> u32 {
        self.requested_times
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn timeout(&self) -> u64 {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout_ms: u64) {
        self.timeout = timeout_ms.max(MIN_TIMEOUT_MS);
    }

    pub(crate) fn set_hash(&mut self, hash: String) {
        self.hash = hash;
    }

    pub(crate) fn set_owner(&mut self, owner: &str) {
        self.owner = owner.to_string();
    }

    pub(crate) fn stamp_dispatch_time(&mut self) {
        self.timestamp = Utc::now().timestamp_millis();
    }

    /// Count one more attempt; the next hash computation yields a new fingerprint
    pub(crate) fn increase_requested_times(&mut self) {
        self.requested_times += 1;
    }

    /// Derive a follow-link request one hop deeper than this one
    pub fn follow(&self, url: Url) -> Request {
        let mut request = self.clone();
        request.url = url;
        request.depth = self.depth + 1;
        request.requested_times = 0;
        request.hash = String::new();
        request.timestamp = Utc::now().timestamp_millis();
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_follow_request() {
        let mut seed = Request::new("http://example.test/").unwrap();
        seed.set_owner("crawl");
        seed.set_hash("abc".to_string());
        seed.increase_requested_times();

        let follow = seed.follow(Url::parse("http://example.test/next").unwrap());

        assert_eq!(follow.depth(), 1);
        assert_eq!(follow.requested_times(), 0);
        assert_eq!(follow.hash(), "");
        assert_eq!(follow.owner(), "crawl");
        assert_eq!(follow.url.as_str(), "http://example.test/next");
    }

    #[test]
    fn test_timeout_floor() {
        let request = Request::new("http://example.test/").unwrap().with_timeout(500);
        assert_eq!(request.timeout(), MIN_TIMEOUT_MS);

        let request = Request::new("http://example.test/").unwrap().with_timeout(5000);
        assert_eq!(request.timeout(), 5000);
    }

    #[test]
    fn test_method_normalized() {
        let request = Request::new("http://example.test/").unwrap().with_method("post");
        assert_eq!(request.method, "POST");
    }
}
