//! External sources of seed requests

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::crawler::Request;
use crate::error::Result;

/// Yields requests to admit after the crawl's own seeds
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RequestSupplier: Send + Sync {
    async fn get_all(&self, cancel: CancellationToken) -> Result<Vec<Request>>;
}

/// Supplier over a fixed list of URLs
#[derive(Debug, Clone, Default)]
pub struct ListSupplier {
    urls: Vec<String>,
}

impl ListSupplier {
    pub fn new<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            urls: urls.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl RequestSupplier for ListSupplier {
    async fn get_all(&self, cancel: CancellationToken) -> Result<Vec<Request>> {
        let mut requests = Vec::with_capacity(self.urls.len());
        for url in &self.urls {
            if cancel.is_cancelled() {
                break;
            }
            requests.push(Request::new(url)?);
        }
        Ok(requests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_supplier() {
        let supplier = ListSupplier::new(["http://example.test/a", "http://example.test/b"]);
        let requests = supplier.get_all(CancellationToken::new()).await.unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].url.as_str(), "http://example.test/b");
    }

    #[test]
    fn test_list_supplier_rejects_bad_url() {
        let supplier = ListSupplier::new(["not a url"]);
        assert!(tokio_test::block_on(supplier.get_all(CancellationToken::new())).is_err());
    }

    #[tokio::test]
    async fn test_mock_supplier() {
        let mut supplier = MockRequestSupplier::new();
        supplier
            .expect_get_all()
            .times(1)
            .returning(|_| Ok(vec![Request::new("http://example.test/").unwrap()]));

        let requests = supplier.get_all(CancellationToken::new()).await.unwrap();
        assert_eq!(requests.len(), 1);
    }
}
