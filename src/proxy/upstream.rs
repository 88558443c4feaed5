use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use futures_util::stream::{self, BoxStream, StreamExt};

enum UpstreamBody {
    Live(reqwest::Response),
    Buffered(Bytes),
}

/// A genuine upstream reply: either still attached to the connection, or
/// already read into memory (429s must be read to classify them).
pub struct UpstreamResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: UpstreamBody,
}

impl From<reqwest::Response> for UpstreamResponse {
    fn from(resp: reqwest::Response) -> Self {
        Self {
            status: resp.status(),
            headers: resp.headers().clone(),
            body: UpstreamBody::Live(resp),
        }
    }
}

impl UpstreamResponse {
    #[cfg(test)]
    pub fn buffered(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: UpstreamBody::Buffered(body.into()),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn content_type(&self) -> &str {
        self.headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    pub fn is_event_stream(&self) -> bool {
        let ct = self.content_type().to_ascii_lowercase();
        ct.contains("text/event-stream") || ct.contains("stream")
    }

    /// Already-read body, if this response was buffered.
    pub fn buffered_body(&self) -> Option<&Bytes> {
        match &self.body {
            UpstreamBody::Buffered(b) => Some(b),
            UpstreamBody::Live(_) => None,
        }
    }

    /// Read the remaining body into memory, keeping status and headers.
    pub async fn into_buffered(self) -> Result<Self, reqwest::Error> {
        let Self {
            status,
            headers,
            body,
        } = self;
        let body = match body {
            UpstreamBody::Buffered(b) => b,
            UpstreamBody::Live(resp) => resp.bytes().await?,
        };
        Ok(Self {
            status,
            headers,
            body: UpstreamBody::Buffered(body),
        })
    }

    pub async fn bytes(self) -> Result<Bytes, reqwest::Error> {
        match self.body {
            UpstreamBody::Buffered(b) => Ok(b),
            UpstreamBody::Live(resp) => resp.bytes().await,
        }
    }

    pub fn into_parts(
        self,
    ) -> (
        StatusCode,
        HeaderMap,
        BoxStream<'static, Result<Bytes, reqwest::Error>>,
    ) {
        let body = match self.body {
            UpstreamBody::Live(resp) => resp.bytes_stream().boxed(),
            UpstreamBody::Buffered(b) => stream::once(async move { Ok(b) }).boxed(),
        };
        (self.status, self.headers, body)
    }
}
