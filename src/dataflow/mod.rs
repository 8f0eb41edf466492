//! Response processing pipeline

pub mod parser;
pub mod selectable;
pub mod storage;

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use crate::crawler::{Request, Response, SpiderOptions};
use crate::error::Result;

pub use self::parser::{DataParser, FollowRequestSelector};
pub use self::selectable::Selectable;
pub use self::storage::{create_storage, ConsoleStorage, JsonFileStorage};

/// What the crawl does after a stage ran
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowOutcome {
    /// Hand the context to the next stage
    Continue,

    /// Stop the whole crawl gracefully
    Exit(String),
}

/// One stage of the response pipeline.
///
/// Stages run in registration order against a shared context. Returning an
/// error marks the request failed and retries it.
#[async_trait]
pub trait DataFlow: Send + Sync {
    fn name(&self) -> &str;

    /// Called once before the crawl dispatches anything
    async fn initialize(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn handle(&self, context: &mut DataFlowContext) -> anyhow::Result<FlowOutcome>;

    /// Parser stages decide which requests are worth downloading
    fn is_parser(&self) -> bool {
        false
    }

    fn is_valid_request(&self, _request: &Request) -> bool {
        true
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Value stored in a [`Properties`] bag
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Text(String),
    Number(f64),
    Bool(bool),
    Json(Value),
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Text(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Text(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Number(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Number(value as f64)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<Value> for PropertyValue {
    fn from(value: Value) -> Self {
        PropertyValue::Json(value)
    }
}

/// Typed key/value bag stages use to talk to each other
#[derive(Debug, Clone, Default)]
pub struct Properties {
    values: BTreeMap<String, PropertyValue>,
}

impl Properties {
    pub fn insert(&mut self, key: &str, value: impl Into<PropertyValue>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.values.get(key)
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        match self.values.get(key) {
            Some(PropertyValue::Text(text)) => Some(text),
            _ => None,
        }
    }

    pub fn number(&self, key: &str) -> Option<f64> {
        match self.values.get(key) {
            Some(PropertyValue::Number(number)) => Some(*number),
            _ => None,
        }
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        match self.values.get(key) {
            Some(PropertyValue::Bool(flag)) => Some(*flag),
            _ => None,
        }
    }

    pub fn json(&self, key: &str) -> Option<&Value> {
        match self.values.get(key) {
            Some(PropertyValue::Json(json)) => Some(json),
            _ => None,
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<PropertyValue> {
        self.values.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }
}

/// State shared by the stages handling one response
pub struct DataFlowContext {
    pub request: Request,
    pub response: Response,
    pub options: Arc<SpiderOptions>,
    pub properties: Properties,
    follow_requests: Vec<Request>,
    data: BTreeMap<String, Vec<Value>>,
    selectable: OnceLock<Selectable>,
}

impl DataFlowContext {
    pub fn new(request: Request, response: Response, options: Arc<SpiderOptions>) -> Self {
        Self {
            request,
            response,
            options,
            properties: Properties::default(),
            follow_requests: Vec::new(),
            data: BTreeMap::new(),
            selectable: OnceLock::new(),
        }
    }

    /// Response body view, built on first use
    pub fn selectable(&self) -> &Selectable {
        self.selectable
            .get_or_init(|| Selectable::from_response(&self.request.url, &self.response))
    }

    /// A request one hop deeper than the current one, for an absolute or relative URL
    pub fn create_new_request(&self, url: &str) -> Result<Request> {
        let url = self.request.url.join(url)?;
        Ok(self.follow_request(url))
    }

    pub(crate) fn follow_request(&self, url: Url) -> Request {
        let mut request = self.request.follow(url);
        if !self.response.agent.is_empty() {
            request.agent = Some(self.response.agent.clone());
        }
        request
    }

    pub fn add_follow_request(&mut self, request: Request) {
        self.follow_requests.push(request);
    }

    pub fn add_follow_requests(&mut self, requests: impl IntoIterator<Item = Request>) {
        self.follow_requests.extend(requests);
    }

    pub fn follow_requests(&self) -> &[Request] {
        &self.follow_requests
    }

    pub fn take_follow_requests(&mut self) -> Vec<Request> {
        std::mem::take(&mut self.follow_requests)
    }

    /// Append an extracted record under `name`
    pub fn add_data(&mut self, name: &str, record: Value) {
        self.data.entry(name.to_string()).or_default().push(record);
    }

    pub fn data(&self, name: &str) -> &[Value] {
        self.data.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn all_data(&self) -> &BTreeMap<String, Vec<Value>> {
        &self.data
    }

    pub fn has_data(&self) -> bool {
        self.data.values().any(|records| !records.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> DataFlowContext {
        let mut request = Request::new("http://example.test/dir/").unwrap();
        request.set_owner("crawl");
        let mut response = Response::new("h", 200);
        response.agent = "agent-1".to_string();
        DataFlowContext::new(request, response, Arc::new(SpiderOptions::default()))
    }

    #[test]
    fn test_properties_typed_access() {
        let mut properties = Properties::default();
        properties.insert("title", "home");
        properties.insert("price", 9.5);
        properties.insert("sold", false);
        properties.insert("raw", json!({"a": 1}));

        assert_eq!(properties.text("title"), Some("home"));
        assert_eq!(properties.number("price"), Some(9.5));
        assert_eq!(properties.bool("sold"), Some(false));
        assert_eq!(properties.json("raw"), Some(&json!({"a": 1})));

        // wrong type reads as absent
        assert_eq!(properties.number("title"), None);
        assert!(properties.remove("title").is_some());
        assert!(!properties.contains("title"));
    }

    #[test]
    fn test_create_new_request() {
        let context = context();
        let request = context.create_new_request("next?page=2").unwrap();

        assert_eq!(request.url.as_str(), "http://example.test/dir/next?page=2");
        assert_eq!(request.depth(), 1);
        assert_eq!(request.owner(), "crawl");
        assert_eq!(request.agent.as_deref(), Some("agent-1"));
    }

    #[test]
    fn test_data_records() {
        let mut context = context();
        assert!(!context.has_data());
        context.add_data("item", json!({"id": 1}));
        context.add_data("item", json!({"id": 2}));

        assert_eq!(context.data("item").len(), 2);
        assert!(context.data("other").is_empty());
        assert!(context.has_data());
    }
}
