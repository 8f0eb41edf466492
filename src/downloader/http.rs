use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::{Client, Method, StatusCode};
use tracing::debug;
use url::Url;

use super::{names, Downloader};
use crate::crawler::response::{RedirectResponse, TransportFailure};
use crate::crawler::{Request, Response};
use crate::error::{Result, SpiderError};

/// Maximum redirect hops followed before giving up
pub const MAX_REDIRECTS: usize = 10;

/// Plain HTTP downloader.
///
/// Redirects are followed by hand so every hop is recorded on the response.
pub struct HttpClientDownloader {
    client: Client,
    name: String,
}

impl HttpClientDownloader {
    pub fn new(user_agent: Option<&str>) -> Result<Self> {
        let mut builder = Client::builder()
            .cookie_store(true)
            .connect_timeout(Duration::from_secs(10))
            .redirect(reqwest::redirect::Policy::none());

        if let Some(user_agent) = user_agent {
            builder = builder.user_agent(user_agent);
        }

        let client = builder
            .build()
            .map_err(|e| SpiderError::Config(format!("failed to build http client: {}", e)))?;

        Ok(Self {
            client,
            name: names::HTTP_CLIENT.to_string(),
        })
    }

    /// Register under another downloader name, e.g. a PPPoE line
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    fn failure(request: &Request, error: &reqwest::Error, started: Instant, redirects: Vec<RedirectResponse>) -> Response {
        let failure = if error.is_timeout() {
            TransportFailure::TimedOut
        } else if error.is_redirect() {
            TransportFailure::TooManyRedirects
        } else {
            TransportFailure::NoResponse
        };

        debug!("Download of {} failed: {}", request.url, error);
        let mut response = Response::failed(request.hash(), failure, error.to_string());
        response.redirects = redirects;
        response.elapsed_ms = started.elapsed().as_millis() as u64;
        response
    }
}

#[async_trait]
impl Downloader for HttpClientDownloader {
    fn name(&self) -> &str {
        &self.name
    }

    async fn download(&self, request: &Request) -> Response {
        let started = Instant::now();
        let timeout = Duration::from_millis(request.timeout());

        let mut url: Url = request.url.clone();
        let mut method = Method::from_bytes(request.method.as_bytes()).unwrap_or(Method::GET);
        let mut content = request.content.clone();
        let mut redirects: Vec<RedirectResponse> = Vec::new();

        loop {
            let mut builder = self.client.request(method.clone(), url.clone()).timeout(timeout);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(content) = &content {
                builder = builder
                    .header(CONTENT_TYPE, content.content_type.as_str())
                    .body(content.bytes.clone());
            }

            let hop_started = Instant::now();
            let response = match builder.send().await {
                Ok(response) => response,
                Err(e) => return Self::failure(request, &e, started, redirects),
            };
            let time_to_headers_ms = hop_started.elapsed().as_millis() as u64;
            let status = response.status();

            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|location| url.join(location).ok());

            if let (true, Some(target)) = (status.is_redirection(), location) {
                if redirects.len() >= MAX_REDIRECTS {
                    let mut failed = Response::failed(
                        request.hash(),
                        TransportFailure::TooManyRedirects,
                        format!("more than {} redirects", MAX_REDIRECTS),
                    );
                    failed.redirects = redirects;
                    failed.elapsed_ms = started.elapsed().as_millis() as u64;
                    return failed;
                }

                redirects.push(RedirectResponse {
                    request_uri: url.to_string(),
                    target_uri: target.to_string(),
                    status_code: status.as_u16(),
                    time_to_headers_ms,
                    order: redirects.len() as u32,
                });

                // 303, and 301/302 after a POST, continue as a bodiless GET
                if status == StatusCode::SEE_OTHER
                    || (method == Method::POST
                        && (status == StatusCode::MOVED_PERMANENTLY || status == StatusCode::FOUND))
                {
                    method = Method::GET;
                    content = None;
                }
                url = target;
                continue;
            }

            let headers: BTreeMap<String, String> = response
                .headers()
                .iter()
                .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.to_string(), v.to_string())))
                .collect();

            let body = match response.bytes().await {
                Ok(body) => body.to_vec(),
                Err(e) => return Self::failure(request, &e, started, redirects),
            };

            return Response {
                request_hash: request.hash().to_string(),
                agent: String::new(),
                status_code: status.as_u16(),
                reason_phrase: status.canonical_reason().map(str::to_string),
                headers,
                content: body,
                target_url: Some(url.to_string()),
                redirects,
                elapsed_ms: started.elapsed().as_millis() as u64,
                time_to_headers_ms,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::response::status;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_download_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string("<html>hello</html>"),
            )
            .mount(&server)
            .await;

        let downloader = HttpClientDownloader::new(Some("spider-test")).unwrap();
        let request = Request::new(&format!("{}/page", server.uri())).unwrap();
        let response = downloader.download(&request).await;

        assert!(response.is_success());
        assert_eq!(response.read_as_string(), "<html>hello</html>");
        assert_eq!(response.content_type().as_deref(), Some("text/html"));
        assert!(response.redirects.is_empty());
    }

    #[tokio::test]
    async fn test_redirect_chain_recorded() {
        let server = MockServer::start().await;
        Mock::given(path("/old"))
            .respond_with(ResponseTemplate::new(301).insert_header("location", "/new"))
            .mount(&server)
            .await;
        Mock::given(path("/new"))
            .respond_with(ResponseTemplate::new(200).set_body_string("moved"))
            .mount(&server)
            .await;

        let downloader = HttpClientDownloader::new(None).unwrap();
        let request = Request::new(&format!("{}/old", server.uri())).unwrap();
        let response = downloader.download(&request).await;

        assert!(response.is_success());
        assert_eq!(response.redirects.len(), 1);
        assert_eq!(response.redirects[0].status_code, 301);
        assert!(response.redirects[0].target_uri.ends_with("/new"));
        assert!(response.target_url.unwrap().ends_with("/new"));
    }

    #[tokio::test]
    async fn test_redirect_loop() {
        let server = MockServer::start().await;
        Mock::given(path("/loop"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/loop"))
            .mount(&server)
            .await;

        let downloader = HttpClientDownloader::new(None).unwrap();
        let request = Request::new(&format!("{}/loop", server.uri())).unwrap();
        let response = downloader.download(&request).await;

        assert_eq!(response.status_code, status::TOO_MANY_REDIRECTS);
        assert_eq!(response.redirects.len(), MAX_REDIRECTS);
    }

    #[tokio::test]
    async fn test_timeout() {
        let server = MockServer::start().await;
        Mock::given(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(4)))
            .mount(&server)
            .await;

        let downloader = HttpClientDownloader::new(None).unwrap();
        let request = Request::new(&format!("{}/slow", server.uri()))
            .unwrap()
            .with_timeout(2000);
        let response = downloader.download(&request).await;

        assert_eq!(response.status_code, status::CONNECTION_TIMED_OUT);
        assert!(!response.is_success());
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let downloader = HttpClientDownloader::new(None).unwrap();
        let request = Request::new("http://127.0.0.1:9/").unwrap();
        let response = downloader.download(&request).await;
        assert_eq!(response.status_code, status::NO_RESPONSE);
    }
}
