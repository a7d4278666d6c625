//! Network collaborator used by the crawl and scoring stages.

use crate::html::HtmlError;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;

const USER_AGENT: &str = "facecrawl/0.1 (+https://github.com/facecrawl/facecrawl)";
const MAX_REDIRECTS: usize = 5;

/// Failure to retrieve or read a page or image.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The request failed, timed out, or the body could not be read.
    #[error("http error for {url}: {source}")]
    Transport {
        /// Requested URL.
        url: String,
        /// Underlying client error.
        source: reqwest::Error,
    },
    /// The server answered with a non-2xx status.
    #[error("{url} returned status {status}")]
    Status {
        /// Requested URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },
    /// The page markup could not be parsed.
    #[error("failed to parse {url}: {source}")]
    Html {
        /// Page URL.
        url: String,
        /// Parser failure.
        source: HtmlError,
    },
    /// The final response URL was not a valid base for link resolution.
    #[error("invalid page url {url}: {source}")]
    Url {
        /// Offending URL.
        url: String,
        /// Parser failure.
        source: url::ParseError,
    },
    /// No resource exists for the URL (used by in-memory fetchers).
    #[error("no resource at {0}")]
    NotFound(String),
}

impl FetchError {
    fn transport(url: &str, source: reqwest::Error) -> Self {
        Self::Transport {
            url: url.to_string(),
            source,
        }
    }
}

/// A fetched page, successful or not.
#[derive(Debug, Clone)]
pub struct PageResponse {
    /// Final URL after redirects.
    pub url: String,
    /// HTTP status code.
    pub status: u16,
    /// `Content-Type` header, when present.
    pub content_type: Option<String>,
    /// Raw response body.
    pub body: Bytes,
}

impl PageResponse {
    /// True for any 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// True unless the server declared a non-HTML content type.
    pub fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|value| value.to_ascii_lowercase().contains("html"))
            .unwrap_or(true)
    }
}

/// Retrieves pages and image bytes.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetches a page; non-2xx statuses are returned, not raised.
    async fn get_page(&self, url: &str) -> Result<PageResponse, FetchError>;

    /// Fetches raw image bytes; non-2xx statuses are errors.
    async fn get_image_bytes(&self, url: &str) -> Result<Bytes, FetchError>;
}

/// [`Fetcher`] backed by `reqwest` with separate page and image timeouts.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    page_timeout: Duration,
    image_timeout: Duration,
}

impl HttpFetcher {
    /// Builds a client with the crawler's user agent and redirect policy.
    pub fn new(page_timeout: Duration, image_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()?;
        Ok(Self {
            client,
            page_timeout,
            image_timeout,
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn get_page(&self, url: &str) -> Result<PageResponse, FetchError> {
        let response = self
            .client
            .get(url)
            .timeout(self.page_timeout)
            .send()
            .await
            .map_err(|err| FetchError::transport(url, err))?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|err| FetchError::transport(url, err))?;

        Ok(PageResponse {
            url: final_url,
            status,
            content_type,
            body,
        })
    }

    async fn get_image_bytes(&self, url: &str) -> Result<Bytes, FetchError> {
        let response = self
            .client
            .get(url)
            .timeout(self.image_timeout)
            .send()
            .await
            .map_err(|err| FetchError::transport(url, err))?;

        if !response.status().is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        response
            .bytes()
            .await
            .map_err(|err| FetchError::transport(url, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(status: u16, content_type: Option<&str>) -> PageResponse {
        PageResponse {
            url: "https://example.com/".into(),
            status,
            content_type: content_type.map(str::to_string),
            body: Bytes::new(),
        }
    }

    #[test]
    fn success_covers_2xx_only() {
        assert!(page(200, None).is_success());
        assert!(page(204, None).is_success());
        assert!(!page(301, None).is_success());
        assert!(!page(404, None).is_success());
        assert!(!page(503, None).is_success());
    }

    #[test]
    fn missing_content_type_counts_as_html() {
        assert!(page(200, None).is_html());
        assert!(page(200, Some("text/html; charset=utf-8")).is_html());
        assert!(page(200, Some("application/xhtml+xml")).is_html());
        assert!(!page(200, Some("application/pdf")).is_html());
        assert!(!page(200, Some("image/png")).is_html());
    }
}
