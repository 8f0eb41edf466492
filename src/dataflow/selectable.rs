use scraper::{Html, Selector};
use serde_json::Value;
use url::Url;

use crate::crawler::Response;
use crate::error::{Result, SpiderError};

/// Parse a CSS selector, reporting bad syntax as a configuration error
pub fn parse_selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| SpiderError::Config(format!("invalid selector '{}': {:?}", css, e)))
}

/// Queryable view of a response body
#[derive(Debug, Clone)]
pub enum Selectable {
    Html { base: Url, body: String },
    Json(Value),
    Text(String),
}

impl Selectable {
    /// Build from a response; `request_url` is the base when the response
    /// does not say where it ended up
    pub fn from_response(request_url: &Url, response: &Response) -> Self {
        let base = response
            .target_url
            .as_deref()
            .and_then(|target| Url::parse(target).ok())
            .unwrap_or_else(|| request_url.clone());
        let body = response.read_as_string();

        match response.content_type().as_deref() {
            Some(media) if media.contains("json") => match serde_json::from_str(&body) {
                Ok(json) => Selectable::Json(json),
                Err(_) => Selectable::Text(body),
            },
            Some(media) if media.contains("html") || media.contains("xml") => Selectable::Html { base, body },
            Some(_) => Selectable::Text(body),
            None if body.trim_start().starts_with('<') => Selectable::Html { base, body },
            None => Selectable::Text(body),
        }
    }

    /// Absolute http(s) links found under `css`, without fragments.
    /// Non-HTML bodies have no links.
    pub fn links(&self, css: &str) -> Result<Vec<Url>> {
        let Selectable::Html { base, body } = self else {
            return Ok(Vec::new());
        };

        let selector = parse_selector(css)?;
        let document = Html::parse_document(body);

        let links = document
            .select(&selector)
            .filter_map(|element| {
                element
                    .value()
                    .attr("href")
                    .or_else(|| element.value().attr("src"))
            })
            .filter_map(|href| base.join(href.trim()).ok())
            .filter(|url| matches!(url.scheme(), "http" | "https"))
            .map(|mut url| {
                url.set_fragment(None);
                url
            })
            .collect();

        Ok(links)
    }

    /// Text content of every element under `css`
    pub fn select_text(&self, css: &str) -> Result<Vec<String>> {
        let Selectable::Html { body, .. } = self else {
            return Ok(Vec::new());
        };

        let selector = parse_selector(css)?;
        let document = Html::parse_document(body);

        Ok(document
            .select(&selector)
            .map(|element| element.text().collect::<String>().trim().to_string())
            .collect())
    }

    /// Value at a JSON pointer such as `/items/0/name`
    pub fn json_pointer(&self, pointer: &str) -> Option<&Value> {
        match self {
            Selectable::Json(json) => json.pointer(pointer),
            _ => None,
        }
    }

    pub fn text(&self) -> String {
        match self {
            Selectable::Html { body, .. } => body.clone(),
            Selectable::Json(json) => json.to_string(),
            Selectable::Text(text) => text.clone(),
        }
    }
}
