use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use super::selectable::parse_selector;
use super::{DataFlow, DataFlowContext, FlowOutcome};
use crate::crawler::Request;
use crate::error::{Result, SpiderError};

/// User parse callback, runs before follow-links are extracted
pub type ParseFn = Arc<dyn Fn(&mut DataFlowContext) -> anyhow::Result<()> + Send + Sync>;

/// Claims requests for a parser
pub type RequestPredicate = Arc<dyn Fn(&Request) -> bool + Send + Sync>;

/// Follow-links to extract: a CSS selector and optional URL filters
#[derive(Debug, Clone)]
pub struct FollowRequestSelector {
    pub css: String,
    pub patterns: Vec<String>,
}

impl FollowRequestSelector {
    pub fn new(css: &str) -> Self {
        Self {
            css: css.to_string(),
            patterns: Vec::new(),
        }
    }

    /// Keep only links matching one of the patterns
    pub fn with_pattern(mut self, pattern: &str) -> Self {
        self.patterns.push(pattern.to_string());
        self
    }
}

struct CompiledFollow {
    css: String,
    patterns: Vec<Regex>,
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern)
                .map_err(|e| SpiderError::Config(format!("invalid pattern '{}': {}", pattern, e)))
        })
        .collect()
}

/// Parser stage: claims requests, runs a parse callback and extracts follow-links
pub struct DataParser {
    name: String,
    required_patterns: Vec<String>,
    required_predicates: Vec<RequestPredicate>,
    follow_selectors: Vec<FollowRequestSelector>,
    parse: Option<ParseFn>,
    validators: Vec<Regex>,
    follows: Vec<CompiledFollow>,
}

impl DataParser {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            required_patterns: Vec::new(),
            required_predicates: Vec::new(),
            follow_selectors: Vec::new(),
            parse: None,
            validators: Vec::new(),
            follows: Vec::new(),
        }
    }

    /// Only handle requests whose URL matches `pattern`
    pub fn add_required_validator(mut self, pattern: &str) -> Self {
        self.required_patterns.push(pattern.to_string());
        self
    }

    pub fn add_required_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Request) -> bool + Send + Sync + 'static,
    {
        self.required_predicates.push(Arc::new(predicate));
        self
    }

    pub fn add_follow_request_selector(mut self, selector: FollowRequestSelector) -> Self {
        self.follow_selectors.push(selector);
        self
    }

    pub fn with_parse<F>(mut self, parse: F) -> Self
    where
        F: Fn(&mut DataFlowContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.parse = Some(Arc::new(parse));
        self
    }

    fn extract_follow_requests(&self, context: &DataFlowContext) -> Result<Vec<Request>> {
        let selectable = context.selectable();
        let request_host = context.request.url.host_str().map(str::to_string);
        let mut requests = Vec::new();

        for follow in &self.follows {
            for url in selectable.links(&follow.css)? {
                if !follow.patterns.is_empty() && !follow.patterns.iter().any(|p| p.is_match(url.as_str())) {
                    continue;
                }
                if context.options.remove_outbound_links && url.host_str().map(str::to_string) != request_host {
                    continue;
                }

                let request = context.follow_request(url);
                if !self.is_valid_request(&request) {
                    continue;
                }
                requests.push(request);
            }
        }

        Ok(requests)
    }
}

#[async_trait]
impl DataFlow for DataParser {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&mut self) -> anyhow::Result<()> {
        self.validators = compile(&self.required_patterns)?;
        self.follows = self
            .follow_selectors
            .iter()
            .map(|selector| {
                parse_selector(&selector.css)?;
                Ok(CompiledFollow {
                    css: selector.css.clone(),
                    patterns: compile(&selector.patterns)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    async fn handle(&self, context: &mut DataFlowContext) -> anyhow::Result<FlowOutcome> {
        if !self.is_valid_request(&context.request) {
            debug!("{} skips {}", self.name, context.request.url);
            return Ok(FlowOutcome::Continue);
        }

        if let Some(parse) = &self.parse {
            parse(context)?;
        }

        if !self.follows.is_empty() {
            let requests = self.extract_follow_requests(context)?;
            debug!("{} found {} follow requests on {}", self.name, requests.len(), context.request.url);
            context.add_follow_requests(requests);
        }

        Ok(FlowOutcome::Continue)
    }

    fn is_parser(&self) -> bool {
        true
    }

    fn is_valid_request(&self, request: &Request) -> bool {
        if self.validators.is_empty() && self.required_predicates.is_empty() {
            return true;
        }

        self.validators.iter().any(|pattern| pattern.is_match(request.url.as_str()))
            || self.required_predicates.iter().any(|predicate| predicate(request))
    }
}
