// Wire-level encoding of one outbound notification.
// Builds the CCS downstream stanza: a <message> carrying a <gcm> child with
// the JSON envelope the relay routes on. Pure function of its inputs.

use std::collections::HashMap;

use serde::Serialize;
use xmpp_parsers::Element;

use crate::ccs::custom_ns;
use crate::error::DeliveryError;
use crate::models::{DeliveryShape, Notification, Recipient};

/// Downstream JSON envelope, shaped per the relay protocol. The `to` and
/// `message_id` fields are required for routing and ack correlation.
#[derive(Serialize)]
struct DownstreamEnvelope<'a> {
    to: &'a str,
    message_id: &'a str,
    category: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    notification: Option<NotificationBlock<'a>>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    data: HashMap<&'a str, &'a str>,
}

#[derive(Serialize)]
struct NotificationBlock<'a> {
    title: &'a str,
    body: &'a str,
}

/// Encode one notification for one recipient into a relay stanza.
///
/// Non-Android recipients get a display notification: top-level
/// `title`/`body` the client OS renders directly. Android recipients get a
/// data message: the full payload rides opaquely in `data` and the app
/// renders it. Fails before any network interaction if the registration
/// token is empty.
pub fn encode(
    recipient: &Recipient,
    message_id: &str,
    notification: &Notification,
) -> Result<Element, DeliveryError> {
    if recipient.registration_token.trim().is_empty() {
        return Err(DeliveryError::invalid_recipient(
            "registration token is empty",
        ));
    }

    let mut data: HashMap<&str, &str> = HashMap::new();
    for (key, value) in &notification.data {
        data.insert(key.as_str(), value.as_str());
    }

    let shaped_notification = match recipient.delivery_shape() {
        DeliveryShape::Notification => Some(NotificationBlock {
            title: &notification.title,
            body: &notification.body,
        }),
        DeliveryShape::Data => {
            data.insert("title", &notification.title);
            data.insert("body", &notification.body);
            None
        }
    };

    let envelope = DownstreamEnvelope {
        to: &recipient.registration_token,
        message_id,
        category: notification.kind.wire_name(),
        notification: shaped_notification,
        data,
    };

    let payload = serde_json::to_string(&envelope)
        .map_err(|e| DeliveryError::transient(&format!("failed to encode envelope: {}", e)))?;

    Ok(Element::builder("message", "jabber:client")
        .attr("id", message_id)
        .append(
            Element::builder("gcm", custom_ns::GCM)
                .append(payload)
                .build(),
        )
        .build())
}
