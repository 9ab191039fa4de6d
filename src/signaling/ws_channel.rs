//! Persistent message channel for message-based negotiation.
//!
//! Messages are JSON objects discriminated by `type`. They are decoded once,
//! at the channel boundary, into [`SignalMessage`]; the negotiator only ever
//! sees the enum.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{PreviewError, Result};
use crate::peer::IceCandidateInfo;

/// Signaling message types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalMessage {
    /// Capability request, sent by us when the channel opens
    #[serde(rename = "webrtc")]
    Request,
    #[serde(rename = "webrtc/offer")]
    Offer {
        #[serde(alias = "value")]
        sdp: String,
    },
    #[serde(rename = "webrtc/answer")]
    Answer {
        #[serde(alias = "value")]
        sdp: String,
    },
    #[serde(rename = "webrtc/candidate")]
    Candidate {
        #[serde(alias = "value")]
        candidate: String,
        #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
        #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
        sdp_mline_index: Option<u16>,
    },
    /// Relay-side failure report
    #[serde(rename = "error")]
    Error {
        #[serde(default, alias = "value")]
        error: String,
    },
}

impl SignalMessage {
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| PreviewError::Protocol(format!("Malformed signaling message: {}", e)))
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| PreviewError::Signaling(format!("Failed to encode signaling message: {}", e)))
    }

    pub fn candidate(info: IceCandidateInfo) -> Self {
        SignalMessage::Candidate {
            candidate: info.candidate,
            sdp_mid: info.sdp_mid,
            sdp_mline_index: info.sdp_mline_index,
        }
    }
}

/// Our end of an open signaling channel.
///
/// Dropping it closes the channel.
pub struct SignalLink {
    outgoing: mpsc::UnboundedSender<SignalMessage>,
    pub incoming: mpsc::UnboundedReceiver<Result<SignalMessage>>,
}

impl std::fmt::Debug for SignalLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalLink")
            .field("closed", &self.outgoing.is_closed())
            .finish()
    }
}

/// The relay-facing end of a [`SignalLink`], pumped by a connector.
pub struct SignalPeer {
    pub from_local: mpsc::UnboundedReceiver<SignalMessage>,
    pub to_local: mpsc::UnboundedSender<Result<SignalMessage>>,
}

impl SignalLink {
    pub fn channel() -> (SignalLink, SignalPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            SignalLink {
                outgoing: out_tx,
                incoming: in_rx,
            },
            SignalPeer {
                from_local: out_rx,
                to_local: in_tx,
            },
        )
    }

    pub fn send(&self, message: SignalMessage) -> Result<()> {
        self.outgoing
            .send(message)
            .map_err(|_| PreviewError::Signaling("Signaling channel closed".into()))
    }
}

/// Opens signaling channels
#[async_trait]
pub trait SignalConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<SignalLink>;
}

/// [`SignalConnector`] over WebSocket
#[derive(Default)]
pub struct WsConnector;

#[async_trait]
impl SignalConnector for WsConnector {
    async fn connect(&self, url: &str) -> Result<SignalLink> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| PreviewError::Signaling(format!("Failed to connect to signaling server: {}", e)))?;

        log::debug!("Connected to signaling server: {}", url);

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (link, peer) = SignalLink::channel();
        let SignalPeer {
            mut from_local,
            to_local,
        } = peer;

        // Writer: local messages -> WebSocket, close frame once the link is dropped
        tokio::spawn(async move {
            while let Some(message) = from_local.recv().await {
                let json = match message.encode() {
                    Ok(json) => json,
                    Err(e) => {
                        log::warn!("{}", e);
                        continue;
                    }
                };
                if ws_sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.send(Message::Close(None)).await;
        });

        // Reader: WebSocket -> decoded messages, until either side goes away
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = to_local.closed() => break,
                    next = ws_receiver.next() => {
                        let forwarded = match next {
                            Some(Ok(Message::Text(text))) => to_local.send(SignalMessage::decode(&text)),
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => Ok(()),
                            Some(Err(e)) => {
                                let _ = to_local.send(Err(PreviewError::Signaling(format!("WebSocket error: {}", e))));
                                break;
                            }
                        };
                        if forwarded.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serializes_to_bare_type() {
        let json = SignalMessage::Request.encode().unwrap();
        assert_eq!(json, r#"{"type":"webrtc"}"#);
    }

    #[test]
    fn test_answer_serialize() {
        let answer = SignalMessage::Answer { sdp: "v=0\r\n".to_string() };
        let json = answer.encode().unwrap();
        assert!(json.contains("\"type\":\"webrtc/answer\""));
        assert!(json.contains("\"sdp\":\"v=0\\r\\n\""));
    }

    #[test]
    fn test_candidate_deserialize() {
        let json = r#"{"type":"webrtc/candidate","candidate":"candidate:1 1 UDP 2130706431 127.0.0.1 8555 typ host","sdpMid":"0","sdpMLineIndex":0}"#;
        match SignalMessage::decode(json).unwrap() {
            SignalMessage::Candidate { candidate, sdp_mid, sdp_mline_index } => {
                assert!(candidate.starts_with("candidate:"));
                assert_eq!(sdp_mid.as_deref(), Some("0"));
                assert_eq!(sdp_mline_index, Some(0));
            }
            other => panic!("Expected candidate, got {:?}", other),
        }
    }

    #[test]
    fn test_offer_accepts_value_field() {
        let msg = SignalMessage::decode(r#"{"type":"webrtc/offer","value":"v=0"}"#).unwrap();
        assert_eq!(msg, SignalMessage::Offer { sdp: "v=0".into() });
    }

    #[test]
    fn test_unknown_type_is_protocol_error() {
        let err = SignalMessage::decode(r#"{"type":"mse"}"#).unwrap_err();
        assert!(matches!(err, PreviewError::Protocol(_)));
        assert!(SignalMessage::decode("not json").is_err());
    }

    #[tokio::test]
    async fn test_link_closed_when_peer_dropped() {
        let (mut link, peer) = SignalLink::channel();
        drop(peer);
        assert!(link.send(SignalMessage::Request).is_err());
        assert!(link.incoming.recv().await.is_none());
        assert_eq!(format!("{:?}", link), "SignalLink { closed: true }");
    }
}
