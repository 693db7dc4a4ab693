// Connection session for the Cloud Connection Server relay.
// This module owns the single authenticated streaming connection: it keeps
// the session state machine, demultiplexes inbound frames into ack/nack/
// control events for the delivery manager, and carries outbound sends.

use log::{debug, info, warn};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use xmpp_parsers::Element;

use crate::config::GatewayConfig;
use crate::error::ConnectionError;

pub mod connection;
pub mod transport;

pub use transport::{CcsTransport, TransportChannels, TransportEvent, XmppTransport};

// Relay namespaces
pub mod custom_ns {
    pub const GCM: &str = "google:mobile:data";
}

const NS_JABBER_CLIENT: &str = "jabber:client";

/// Lifecycle of the relay connection. Exactly one session is alive at a
/// time; the delivery manager is the only component that drives these
/// transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticated,
    Active,
    /// Relay asked us to shed the connection; no new sends are accepted.
    Draining,
}

/// What the relay told us about outbound traffic, correlated by message id.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Ack {
        message_id: String,
    },
    Nack {
        message_id: String,
        reason: NackReason,
    },
    /// Relay is shedding this connection; reconnect gracefully.
    Draining,
    /// The transport is gone; in-flight sends are in an unknown state.
    Closed {
        reason: String,
    },
}

/// Relay nack codes. The split between permanent and transient drives the
/// retry policy: a permanently-invalid token is surfaced, everything else
/// is retried under the bounded policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackReason {
    BadRegistration,
    DeviceUnregistered,
    InvalidJson,
    BadAck,
    ServiceUnavailable,
    InternalServerError,
    DeviceMessageRateExceeded,
    TopicsMessageRateExceeded,
    ConnectionDraining,
    Other(String),
}

impl NackReason {
    pub fn from_code(code: &str) -> Self {
        match code {
            "BAD_REGISTRATION" => NackReason::BadRegistration,
            "DEVICE_UNREGISTERED" => NackReason::DeviceUnregistered,
            "INVALID_JSON" => NackReason::InvalidJson,
            "BAD_ACK" => NackReason::BadAck,
            "SERVICE_UNAVAILABLE" => NackReason::ServiceUnavailable,
            "INTERNAL_SERVER_ERROR" => NackReason::InternalServerError,
            "DEVICE_MESSAGE_RATE_EXCEEDED" => NackReason::DeviceMessageRateExceeded,
            "TOPICS_MESSAGE_RATE_EXCEEDED" => NackReason::TopicsMessageRateExceeded,
            "CONNECTION_DRAINING" => NackReason::ConnectionDraining,
            other => NackReason::Other(other.to_string()),
        }
    }

    pub fn as_code(&self) -> &str {
        match self {
            NackReason::BadRegistration => "BAD_REGISTRATION",
            NackReason::DeviceUnregistered => "DEVICE_UNREGISTERED",
            NackReason::InvalidJson => "INVALID_JSON",
            NackReason::BadAck => "BAD_ACK",
            NackReason::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            NackReason::InternalServerError => "INTERNAL_SERVER_ERROR",
            NackReason::DeviceMessageRateExceeded => "DEVICE_MESSAGE_RATE_EXCEEDED",
            NackReason::TopicsMessageRateExceeded => "TOPICS_MESSAGE_RATE_EXCEEDED",
            NackReason::ConnectionDraining => "CONNECTION_DRAINING",
            NackReason::Other(code) => code,
        }
    }

    /// True when the recipient's registration can never be delivered to
    /// again. Unknown codes count as transient so a new relay code can
    /// never permanently drop a recipient.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            NackReason::BadRegistration | NackReason::DeviceUnregistered | NackReason::InvalidJson
        )
    }
}

// JSON body carried inside the <gcm> element of an inbound frame.
#[derive(Debug, Deserialize)]
struct InboundFrame {
    message_type: Option<String>,
    message_id: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
    control_type: Option<String>,
    from: Option<String>,
}

/// One authenticated streaming connection to the relay.
///
/// Owned and driven by the delivery manager; the inbound read loop runs as
/// its own task and publishes `SessionEvent`s, so correlation with pending
/// sends happens out-of-band rather than on the send path.
pub struct CcsSession {
    config: GatewayConfig,
    transport: Box<dyn CcsTransport>,
    frames_out: Option<mpsc::Sender<Element>>,
    state_tx: Arc<watch::Sender<SessionState>>,
    event_tx: mpsc::Sender<SessionEvent>,
    reader: Option<JoinHandle<()>>,
}

impl CcsSession {
    pub fn new(
        config: GatewayConfig,
        transport: Box<dyn CcsTransport>,
    ) -> (
        Self,
        mpsc::Receiver<SessionEvent>,
        watch::Receiver<SessionState>,
    ) {
        let (event_tx, event_rx) = mpsc::channel(100);
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);

        (
            CcsSession {
                config,
                transport,
                frames_out: None,
                state_tx: Arc::new(state_tx),
                event_tx,
                reader: None,
            },
            event_rx,
            state_rx,
        )
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Submit one encoded frame. Only legal while the session is active;
    /// a draining session refuses new sends so the manager queues them for
    /// the replacement connection.
    pub async fn send(&self, frame: Element) -> Result<(), ConnectionError> {
        match self.state() {
            SessionState::Active => {}
            SessionState::Draining => return Err(ConnectionError::Draining),
            _ => return Err(ConnectionError::NotConnected),
        }

        let frames_out = match &self.frames_out {
            Some(tx) => tx.clone(),
            None => return Err(ConnectionError::NotConnected),
        };

        frames_out
            .send(frame)
            .await
            .map_err(|_| ConnectionError::NotConnected)
    }
}

// Inbound read loop: demultiplexes relay frames into session events until
// the transport reports the connection gone.
async fn read_loop(
    mut events_in: mpsc::Receiver<TransportEvent>,
    frames_out: mpsc::Sender<Element>,
    event_tx: mpsc::Sender<SessionEvent>,
    state_tx: Arc<watch::Sender<SessionState>>,
) {
    while let Some(event) = events_in.recv().await {
        match event {
            TransportEvent::Online => {
                debug!("Transport reported online mid-session");
            }
            TransportEvent::Stanza(stanza) => {
                handle_stanza(&stanza, &frames_out, &event_tx, &state_tx).await;
            }
            TransportEvent::Closed(error) => {
                state_tx.send_replace(SessionState::Disconnected);
                let _ = event_tx
                    .send(SessionEvent::Closed {
                        reason: error.to_string(),
                    })
                    .await;
                return;
            }
        }
    }

    // Transport task went away without reporting a close
    state_tx.send_replace(SessionState::Disconnected);
    let _ = event_tx
        .send(SessionEvent::Closed {
            reason: "relay stream ended unexpectedly".to_string(),
        })
        .await;
}

async fn handle_stanza(
    stanza: &Element,
    frames_out: &mpsc::Sender<Element>,
    event_tx: &mpsc::Sender<SessionEvent>,
    state_tx: &Arc<watch::Sender<SessionState>>,
) {
    if stanza.name() != "message" {
        // iq/presence traffic is handled by the transport layer
        return;
    }

    let frame = match parse_frame(stanza) {
        Some(frame) => frame,
        None => return,
    };

    match frame.message_type.as_deref() {
        Some("ack") => {
            if let Some(message_id) = frame.message_id {
                debug!("Relay acked message {}", message_id);
                let _ = event_tx.send(SessionEvent::Ack { message_id }).await;
            }
        }
        Some("nack") => {
            if let Some(message_id) = frame.message_id {
                let reason = NackReason::from_code(frame.error.as_deref().unwrap_or(""));
                warn!(
                    "Relay nacked message {}: {} ({})",
                    message_id,
                    reason.as_code(),
                    frame.error_description.as_deref().unwrap_or("no detail")
                );
                let _ = event_tx
                    .send(SessionEvent::Nack { message_id, reason })
                    .await;
            }
        }
        Some("control") => {
            if frame.control_type.as_deref() == Some("CONNECTION_DRAINING") {
                info!("Relay signalled connection draining");
                state_tx.send_replace(SessionState::Draining);
                let _ = event_tx.send(SessionEvent::Draining).await;
            } else {
                debug!(
                    "Ignoring control frame: {:?}",
                    frame.control_type.as_deref()
                );
            }
        }
        Some(other) => {
            debug!("Ignoring relay frame of type {}", other);
        }
        None => {
            // Device-originated upstream message; the protocol requires an
            // ack or the relay will redeliver. Routing the payload is the
            // backend's job, not the gateway's.
            if let (Some(from), Some(message_id)) = (frame.from, frame.message_id) {
                debug!("Acking upstream message {} from device", message_id);
                let _ = frames_out.send(upstream_ack_frame(&from, &message_id)).await;
            }
        }
    }
}

fn parse_frame(stanza: &Element) -> Option<InboundFrame> {
    let gcm = stanza.get_child("gcm", custom_ns::GCM)?;
    match serde_json::from_str(&gcm.text()) {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!("Discarding unparseable relay frame: {}", e);
            None
        }
    }
}

// Client-side ack for a device-originated message.
fn upstream_ack_frame(to: &str, message_id: &str) -> Element {
    let payload = serde_json::json!({
        "to": to,
        "message_id": message_id,
        "message_type": "ack",
    });

    Element::builder("message", NS_JABBER_CLIENT)
        .append(
            Element::builder("gcm", custom_ns::GCM)
                .append(payload.to_string())
                .build(),
        )
        .build()
}
