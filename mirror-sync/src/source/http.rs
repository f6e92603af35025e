//! HTTP remote source.
//!
//! The endpoint exposes two routes:
//! - `GET {base}/list?path=/dir/` returns a JSON array of [`RemoteChild`]
//! - `GET {base}/files/dir/name` returns the raw file body, optionally
//!   `zstd` content-encoded

use async_compression::tokio::bufread::ZstdDecoder;
use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::CONTENT_ENCODING;
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use tokio_util::io::{ReaderStream, StreamReader};

use super::{ByteStream, RemoteChild, RemoteSource};
use crate::utils::errors::SourceError;

pub struct HttpSource {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpSource {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, token)
    }

    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        token: Option<String>,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            base_url,
            token,
        }
    }

    /// `{base}/{segments...}`, each segment percent-encoded.
    fn endpoint<'a>(
        &self,
        segments: impl IntoIterator<Item = &'a str>,
    ) -> Result<Url, SourceError> {
        let invalid = |reason: String| SourceError::InvalidUrl {
            url: self.base_url.clone(),
            reason,
        };
        let mut url = Url::parse(&self.base_url).map_err(|e| invalid(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| invalid("cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn get(&self, url: Url) -> RequestBuilder {
        let request = self.client.get(url);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

fn check_status(resp: Response, path: &str) -> Result<Response, SourceError> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else if status == StatusCode::NOT_FOUND {
        Err(SourceError::NotFound(path.to_string()))
    } else {
        Err(SourceError::Status {
            status: status.as_u16(),
            path: path.to_string(),
        })
    }
}

#[async_trait]
impl RemoteSource for HttpSource {
    async fn list(&self, path: &str) -> Result<Vec<RemoteChild>, SourceError> {
        let url = self.endpoint(["list"])?;
        let resp = self.get(url).query(&[("path", path)]).send().await?;
        let children = check_status(resp, path)?.json::<Vec<RemoteChild>>().await?;
        Ok(children)
    }

    async fn download(&self, path: &str) -> Result<ByteStream, SourceError> {
        let segments = path.trim_start_matches('/').split('/');
        let url = self.endpoint(std::iter::once("files").chain(segments))?;
        let resp = check_status(self.get(url).send().await?, path)?;

        let zstd = resp
            .headers()
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("zstd"));

        let body = resp.bytes_stream().map_err(std::io::Error::other);
        if zstd {
            let decoder = ZstdDecoder::new(StreamReader::new(body));
            Ok(ReaderStream::new(decoder).boxed())
        } else {
            Ok(body.boxed())
        }
    }
}
