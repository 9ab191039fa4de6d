//! Client for the local media relay.
//!
//! The relay exposes a small HTTP surface:
//! - `GET  /status`                  reachability probe
//! - `POST /sources/{id}/start`      returns `{available, negotiationUrl?, protocol?}`
//! - `POST /sources/{id}/stop`       best-effort teardown
//! - `POST <negotiationUrl>`         WHEP offer exchange (`application/sdp`)

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{PreviewError, Result};

/// How a source is negotiated
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationProtocol {
    /// Request/response offer exchange over HTTP
    Whep,
    /// Persistent message-based exchange over a WebSocket
    Ws,
}

/// Relay answer to a start-source request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceInfo {
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negotiation_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<NegotiationProtocol>,
}

impl SourceInfo {
    pub fn unavailable() -> Self {
        Self {
            available: false,
            negotiation_url: None,
            protocol: None,
        }
    }

    pub fn whep(url: &str) -> Self {
        Self {
            available: true,
            negotiation_url: Some(url.to_string()),
            protocol: Some(NegotiationProtocol::Whep),
        }
    }

    pub fn ws(url: &str) -> Self {
        Self {
            available: true,
            negotiation_url: Some(url.to_string()),
            protocol: Some(NegotiationProtocol::Ws),
        }
    }

    /// The advertised protocol, or one inferred from the URL scheme.
    pub fn protocol(&self) -> NegotiationProtocol {
        if let Some(protocol) = self.protocol {
            return protocol;
        }
        match self.negotiation_url.as_deref() {
            Some(url) if url.starts_with("ws://") || url.starts_with("wss://") => NegotiationProtocol::Ws,
            _ => NegotiationProtocol::Whep,
        }
    }
}

/// Relay operations consumed by the preview core
#[async_trait]
pub trait RelayApi: Send + Sync {
    /// Lightweight reachability probe.
    async fn status(&self) -> Result<()>;

    /// Ask the relay to produce a source. Negotiation URLs come back absolute.
    async fn start_source(&self, source_id: &str) -> Result<SourceInfo>;

    /// POST a local offer, returning the relay's answer SDP.
    async fn post_offer(&self, negotiation_url: &str, offer_sdp: &str) -> Result<String>;

    /// Idempotent, best-effort teardown.
    async fn stop_source(&self, source_id: &str) -> Result<()>;
}

type HttpsClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// [`RelayApi`] over HTTP(S)
pub struct HttpRelay {
    base: Url,
    client: HttpsClient,
    timeout: Duration,
}

impl HttpRelay {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| PreviewError::Config(format!("Invalid relay URL '{}': {}", base_url, e)))?;

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();

        let client: HttpsClient = Client::builder(TokioExecutor::new()).build(https);

        Ok(Self {
            base,
            client,
            timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Build `{base}/{segments...}`, percent-encoding each segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| PreviewError::Config(format!("Relay URL '{}' cannot be a base", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Resolve a possibly relative negotiation URL against the relay base.
    fn resolve(&self, url: &str) -> Result<String> {
        self.base
            .join(url)
            .map(|u| u.to_string())
            .map_err(|e| PreviewError::Protocol(format!("Invalid negotiation URL '{}': {}", url, e)))
    }

    async fn send(
        &self,
        request: Request<Full<Bytes>>,
        on_error: fn(String) -> PreviewError,
    ) -> Result<(StatusCode, String)> {
        let what = format!("{} {}", request.method(), request.uri());

        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| PreviewError::Timeout(format!("{} after {:?}", what, self.timeout)))?
            .map_err(|e| on_error(format!("{} failed: {}", what, e)))?;

        let status = response.status();
        let body_bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| on_error(format!("Failed to read response body: {}", e)))?
            .to_bytes();

        Ok((status, String::from_utf8_lossy(&body_bytes).to_string()))
    }

    fn request(method: Method, url: &str, content_type: Option<&str>, body: Bytes) -> Result<Request<Full<Bytes>>> {
        let mut builder = Request::builder().method(method).uri(url);
        if let Some(content_type) = content_type {
            builder = builder.header("Content-Type", content_type);
        }
        builder
            .body(Full::new(body))
            .map_err(|e| PreviewError::Config(format!("Failed to build request: {}", e)))
    }
}

#[async_trait]
impl RelayApi for HttpRelay {
    async fn status(&self) -> Result<()> {
        let url = self.endpoint(&["status"])?;
        let request = Self::request(Method::GET, url.as_str(), None, Bytes::new())?;
        let (status, _) = self.send(request, PreviewError::Unavailable).await?;

        if !status.is_success() {
            return Err(PreviewError::Unavailable(format!("Relay status returned {}", status)));
        }
        Ok(())
    }

    async fn start_source(&self, source_id: &str) -> Result<SourceInfo> {
        let url = self.endpoint(&["sources", source_id, "start"])?;
        let request = Self::request(Method::POST, url.as_str(), None, Bytes::new())?;
        let (status, body) = self.send(request, PreviewError::Unavailable).await?;

        if status == StatusCode::NOT_FOUND {
            return Ok(SourceInfo::unavailable());
        }
        if !status.is_success() {
            return Err(PreviewError::Protocol(format!("Start source returned {}: {}", status, body)));
        }

        let mut info: SourceInfo = serde_json::from_str(&body)
            .map_err(|e| PreviewError::Protocol(format!("Malformed start-source response: {}", e)))?;

        if let Some(negotiation_url) = info.negotiation_url.take() {
            info.negotiation_url = Some(self.resolve(&negotiation_url)?);
        }
        Ok(info)
    }

    async fn post_offer(&self, negotiation_url: &str, offer_sdp: &str) -> Result<String> {
        let request = Self::request(
            Method::POST,
            negotiation_url,
            Some("application/sdp"),
            Bytes::from(offer_sdp.to_string()),
        )?;
        let (status, body) = self.send(request, PreviewError::Signaling).await?;

        if status != StatusCode::OK && status != StatusCode::CREATED {
            return Err(PreviewError::Protocol(format!("WHEP server returned {}: {}", status, body)));
        }
        if body.trim().is_empty() {
            return Err(PreviewError::Protocol("WHEP server returned an empty answer".into()));
        }
        Ok(body)
    }

    async fn stop_source(&self, source_id: &str) -> Result<()> {
        let url = self.endpoint(&["sources", source_id, "stop"])?;
        let request = Self::request(Method::POST, url.as_str(), None, Bytes::new())?;
        let (status, body) = self.send(request, PreviewError::Unavailable).await?;

        if !status.is_success() && status != StatusCode::NOT_FOUND {
            return Err(PreviewError::Protocol(format!("Stop source returned {}: {}", status, body)));
        }
        Ok(())
    }
}
