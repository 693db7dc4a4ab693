// Domain data model for the delivery gateway.
// These types cross the boundary between the marketplace services and the
// gateway; everything here is plain data with no connection state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A device the gateway can deliver to.
///
/// The registration token is issued by the mobile push SDK and is the only
/// field required for delivery. The user agent decides payload shaping and
/// the display name is carried for diagnostics only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub registration_token: String,
    pub user_agent: Option<String>,
    pub display_name: String,
}

impl Recipient {
    pub fn new(registration_token: &str, user_agent: Option<&str>, display_name: &str) -> Self {
        Recipient {
            registration_token: registration_token.to_string(),
            user_agent: user_agent.map(|s| s.to_string()),
            display_name: display_name.to_string(),
        }
    }

    /// Resolve the platform hint into a payload shape, once per recipient.
    pub fn delivery_shape(&self) -> DeliveryShape {
        DeliveryShape::for_agent(self.user_agent.as_deref())
    }
}

/// How the payload is shaped on the wire.
///
/// Android clients run application code on receipt, so they get the full
/// payload as an opaque data message. Everything else gets a display
/// notification the OS renders without the app running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryShape {
    /// System-rendered `title`/`body` notification.
    Notification,
    /// Opaque data message, rendered by the receiving app.
    Data,
}

impl DeliveryShape {
    pub fn for_agent(agent: Option<&str>) -> Self {
        match agent {
            Some(agent) if agent.to_lowercase().contains("android") => DeliveryShape::Data,
            _ => DeliveryShape::Notification,
        }
    }
}

/// The fixed set of marketplace events the gateway delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    RequestCreated,
    OfferClosed,
    OfferAccepted,
    ResponseUpdated,
    ExchangeConfirmed,
    TransactionCancelled,
    PaymentConfirmed,
}

impl EventKind {
    /// Stable wire name used as the message category on the relay envelope.
    pub fn wire_name(&self) -> &'static str {
        match self {
            EventKind::RequestCreated => "request_created",
            EventKind::OfferClosed => "offer_closed",
            EventKind::OfferAccepted => "offer_accepted",
            EventKind::ResponseUpdated => "response_updated",
            EventKind::ExchangeConfirmed => "exchange_confirmed",
            EventKind::TransactionCancelled => "transaction_cancelled",
            EventKind::PaymentConfirmed => "payment_confirmed",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// One outbound notification, created by a domain collaborator per business
/// event and consumed exactly once by the delivery manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub kind: EventKind,
    pub title: String,
    pub body: String,
    /// Optional structured fields, e.g. the entity id the event refers to.
    pub data: HashMap<String, String>,
}

impl Notification {
    pub fn new(kind: EventKind, title: &str, body: &str) -> Self {
        Notification {
            kind,
            title: title.to_string(),
            body: body.to_string(),
            data: HashMap::new(),
        }
    }

    pub fn with_data(mut self, key: &str, value: &str) -> Self {
        self.data.insert(key.to_string(), value.to_string());
        self
    }
}

/// Delivery state of one pending send.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum SendState {
    Queued = 0,       // Recorded, not yet on the wire
    Sent = 1,         // Submitted to the relay, awaiting ack/nack
    Acknowledged = 2, // Relay confirmed delivery to the device queue
    Failed = 3,       // Nacked, timed out, or lost with the connection
}

/// Correlation record for one outbound send, keyed by message id in the
/// manager's pending table. Destroyed on a terminal state or on expiry.
#[derive(Debug, Clone)]
pub struct PendingSend {
    pub message_id: String,
    pub registration_token: String,
    pub recipient_name: String,
    pub kind: EventKind,
    pub attempt: u32,
    pub queued_at: u64,
    pub state: SendState,
}

impl PendingSend {
    pub fn new(message_id: &str, recipient: &Recipient, kind: EventKind, attempt: u32) -> Self {
        PendingSend {
            message_id: message_id.to_string(),
            registration_token: recipient.registration_token.clone(),
            recipient_name: recipient.display_name.clone(),
            kind,
            attempt,
            queued_at: chrono::Utc::now().timestamp_millis() as u64,
            state: SendState::Queued,
        }
    }
}

/// Structured outcome record emitted on the observability channel. The
/// gateway does not own logging policy; the embedding backend decides what
/// to do with these.
#[derive(Debug, Clone)]
pub enum DeliveryEvent {
    Delivered {
        message_id: String,
        recipient: String,
        kind: EventKind,
    },
    Failed {
        message_id: Option<String>,
        recipient: String,
        kind: EventKind,
        error: String,
    },
}
