//!
//! # 远程资源模块
//! Probe and ranged fetch of the remote resource behind one trait,
//! so the pipeline can run against HTTP or an in-memory fixture
//!

use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, StreamExt};
use headers::HeaderMapExt;
use reqwest::{Client, Request, StatusCode};
use url::Url;

use crate::download::chunk_range::ChunkRange;
use crate::download::error::TransferError;
use crate::download::util::{accepts_ranges, clone_request, content_length, content_type};

pub type ByteStream = BoxStream<'static, Result<Bytes, TransferError>>;

/// What the probe learned about the resource
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteMetadata {
    pub content_length: Option<u64>,
    pub accepts_ranges: bool,
    pub content_type: Option<String>,
}

/// Part of the resource a fetch asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSpan {
    Whole,
    From(u64),
    Range(ChunkRange),
}

pub trait RemoteSource: Send + Sync + 'static {
    fn probe<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<RemoteMetadata, TransferError>>;

    fn fetch<'a>(&'a self, url: &'a Url, span: FetchSpan) -> BoxFuture<'a, Result<ByteStream, TransferError>>;
}

pub struct HttpSource {
    // Client 内部拥有一个连接池且默认拥有一个 Arc 包裹，所以应尽量使用 clone 复用
    client: Client,
    user_agent: String,
}

impl HttpSource {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, TransferError> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            user_agent: user_agent.to_string(),
        })
    }

    fn create_http_request(&self, method: reqwest::Method, url: &Url) -> Request {
        let mut request = Request::new(method, url.clone());
        let header_map = request.headers_mut();

        if let Ok(agent) = headers::HeaderValue::from_str(&self.user_agent) {
            header_map.insert(reqwest::header::USER_AGENT, agent);
        }
        header_map.insert(reqwest::header::ACCEPT, headers::HeaderValue::from_static("*/*"));
        header_map.typed_insert(headers::Connection::keep_alive());

        request
    }

    async fn head(&self, url: &Url) -> Result<RemoteMetadata, TransferError> {
        let request = self.create_http_request(reqwest::Method::HEAD, url);
        let response = self.client.execute(clone_request(&request)).await?;

        if !response.status().is_success() {
            return Err(TransferError::Network(format!(
                "Probe failed: HTTP {} for {}",
                response.status(),
                url
            )));
        }

        let headers = response.headers();
        Ok(RemoteMetadata {
            content_length: content_length(headers),
            accepts_ranges: accepts_ranges(headers),
            content_type: content_type(headers),
        })
    }

    async fn get(&self, url: &Url, span: FetchSpan) -> Result<ByteStream, TransferError> {
        let mut request = self.create_http_request(reqwest::Method::GET, url);
        let range = match span {
            FetchSpan::Whole => None,
            FetchSpan::From(offset) => headers::Range::bytes(offset..).ok(),
            FetchSpan::Range(range) => range.to_range_header(),
        };
        let partial = range.is_some();
        if let Some(range) = range {
            request.headers_mut().typed_insert(range);
        }

        let response = self.client.execute(request).await?;
        let status = response.status();
        // a 200 to a ranged request means the server ignored the range
        let accepted = if partial {
            status == StatusCode::PARTIAL_CONTENT
        } else {
            status.is_success()
        };
        if !accepted {
            return Err(TransferError::Network(format!("Download failed: HTTP {} for {}", status, url)));
        }

        Ok(response
            .bytes_stream()
            .map(|item| item.map_err(TransferError::HttpRequestFailed))
            .boxed())
    }
}

impl RemoteSource for HttpSource {
    fn probe<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<RemoteMetadata, TransferError>> {
        self.head(url).boxed()
    }

    fn fetch<'a>(
        &'a self,
        url: &'a Url,
        span: FetchSpan,
    ) -> BoxFuture<'a, Result<ByteStream, TransferError>> {
        self.get(url, span).boxed()
    }
}
