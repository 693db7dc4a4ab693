// Common test utilities for gateway integration tests.
// The centerpiece is a scripted in-memory relay implementing the session's
// transport seam, so delivery behavior can be exercised without a network.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

use async_trait::async_trait;
use log::LevelFilter;
use tokio::sync::mpsc;
use xmpp_parsers::Element;

use pushgate::ccs::{CcsTransport, TransportChannels, TransportEvent};
use pushgate::config::{GatewayConfig, CCS_PREPROD_PORT};
use pushgate::error::ConnectionError;
use pushgate::models::{EventKind, Notification, Recipient};

static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .init();
    });
}

/// Gateway config tuned for fast tests.
pub fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::new(
        "relay.test.local",
        CCS_PREPROD_PORT,
        "424242",
        "test-api-key",
    );
    config.max_retries = 3;
    config.base_backoff_ms = 20;
    config.ack_timeout_ms = 1_000;
    config.max_pending = 64;
    config
}

pub fn test_recipient(token: &str) -> Recipient {
    Recipient::new(token, Some("Marketplace/2.0 iOS/16.4"), "Test User")
}

pub fn android_recipient(token: &str) -> Recipient {
    Recipient::new(token, Some("Dalvik/2.1.0 (Linux; Android 13)"), "Droid User")
}

pub fn test_notification() -> Notification {
    Notification::new(
        EventKind::OfferAccepted,
        "Offer accepted",
        "Your offer was accepted",
    )
    .with_data("offer_id", "off-1")
}

/// How the scripted relay answers outbound frames.
#[derive(Clone)]
pub enum RelayScript {
    /// Acknowledge every send.
    AckAll,
    /// Nack every send with the given error code.
    NackAll { code: &'static str },
    /// Nack the first send, acknowledge everything after it.
    NackFirstThenAck { code: &'static str },
    /// Drop the first connection when a frame arrives; later connections
    /// acknowledge normally.
    CloseOnFirstFrame,
    /// Accept sends but never answer.
    Silent,
    /// Drop the first connection on its first frame and refuse every
    /// reconnect, keeping the gateway in its backoff window.
    RefuseReconnect,
    /// Reject the handshake outright.
    AuthFail,
    /// Acknowledge the first send, then ask the gateway to drain the
    /// connection; the replacement connection acknowledges normally.
    DrainAfterFirstAck,
}

/// Shared observation point for assertions: every payload the relay saw,
/// plus connection counters.
#[derive(Default)]
pub struct RelayState {
    frames: Mutex<Vec<serde_json::Value>>,
    connects: AtomicUsize,
    nacked: AtomicBool,
}

impl RelayState {
    pub fn frames_seen(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn frame(&self, index: usize) -> serde_json::Value {
        self.frames.lock().unwrap()[index].clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

/// Scripted transport standing in for the relay endpoint.
pub struct FakeRelay {
    script: RelayScript,
    state: Arc<RelayState>,
}

impl FakeRelay {
    pub fn new(script: RelayScript) -> (Self, Arc<RelayState>) {
        let state = Arc::new(RelayState::default());
        (
            FakeRelay {
                script,
                state: state.clone(),
            },
            state,
        )
    }
}

#[async_trait]
impl CcsTransport for FakeRelay {
    async fn connect(
        &mut self,
        _config: &GatewayConfig,
    ) -> Result<TransportChannels, ConnectionError> {
        let conn = self.state.connects.fetch_add(1, Ordering::SeqCst);
        match self.script {
            RelayScript::AuthFail => return Err(ConnectionError::AuthenticationFailed),
            RelayScript::RefuseReconnect if conn >= 1 => {
                return Err(ConnectionError::Io("connection refused".to_string()));
            }
            _ => {}
        }

        let (frames_tx, mut frames_rx) = mpsc::channel::<Element>(64);
        let (events_tx, events_rx) = mpsc::channel(64);
        let script = self.script.clone();
        let state = self.state.clone();

        tokio::spawn(async move {
            if events_tx.send(TransportEvent::Online).await.is_err() {
                return;
            }

            while let Some(frame) = frames_rx.recv().await {
                let payload = match gcm_payload(&frame) {
                    Some(payload) => payload,
                    None => continue,
                };
                if payload.get("message_type").is_some() {
                    // Client-side ack of an upstream message, not a send
                    continue;
                }
                state.frames.lock().unwrap().push(payload.clone());
                let message_id = payload["message_id"].as_str().unwrap_or("").to_string();

                match &script {
                    RelayScript::AckAll => {
                        let _ = events_tx
                            .send(TransportEvent::Stanza(ack_stanza(&message_id)))
                            .await;
                    }
                    RelayScript::NackAll { code } => {
                        let _ = events_tx
                            .send(TransportEvent::Stanza(nack_stanza(&message_id, code)))
                            .await;
                    }
                    RelayScript::NackFirstThenAck { code } => {
                        if state.nacked.swap(true, Ordering::SeqCst) {
                            let _ = events_tx
                                .send(TransportEvent::Stanza(ack_stanza(&message_id)))
                                .await;
                        } else {
                            let _ = events_tx
                                .send(TransportEvent::Stanza(nack_stanza(&message_id, code)))
                                .await;
                        }
                    }
                    RelayScript::CloseOnFirstFrame => {
                        if conn == 0 {
                            let _ = events_tx
                                .send(TransportEvent::Closed(ConnectionError::Io(
                                    "connection reset by relay".to_string(),
                                )))
                                .await;
                            return;
                        }
                        let _ = events_tx
                            .send(TransportEvent::Stanza(ack_stanza(&message_id)))
                            .await;
                    }
                    RelayScript::Silent => {}
                    RelayScript::RefuseReconnect => {
                        let _ = events_tx
                            .send(TransportEvent::Closed(ConnectionError::Io(
                                "connection reset by relay".to_string(),
                            )))
                            .await;
                        return;
                    }
                    RelayScript::AuthFail => unreachable!(),
                    RelayScript::DrainAfterFirstAck => {
                        let _ = events_tx
                            .send(TransportEvent::Stanza(ack_stanza(&message_id)))
                            .await;
                        if conn == 0 {
                            let _ = events_tx
                                .send(TransportEvent::Stanza(draining_stanza()))
                                .await;
                        }
                    }
                }
            }
        });

        Ok(TransportChannels {
            frames_out: frames_tx,
            events_in: events_rx,
        })
    }
}

/// Extract the JSON body from a relay frame.
pub fn gcm_payload(frame: &Element) -> Option<serde_json::Value> {
    let gcm = frame.get_child("gcm", "google:mobile:data")?;
    serde_json::from_str(&gcm.text()).ok()
}

pub fn relay_stanza(body: serde_json::Value) -> Element {
    Element::builder("message", "jabber:client")
        .append(
            Element::builder("gcm", "google:mobile:data")
                .append(body.to_string())
                .build(),
        )
        .build()
}

pub fn ack_stanza(message_id: &str) -> Element {
    relay_stanza(serde_json::json!({
        "message_type": "ack",
        "message_id": message_id,
        "from": "device",
    }))
}

pub fn nack_stanza(message_id: &str, code: &str) -> Element {
    relay_stanza(serde_json::json!({
        "message_type": "nack",
        "message_id": message_id,
        "error": code,
        "error_description": "relay rejected the message",
    }))
}

pub fn draining_stanza() -> Element {
    relay_stanza(serde_json::json!({
        "message_type": "control",
        "control_type": "CONNECTION_DRAINING",
    }))
}
