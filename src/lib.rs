// Push-notification delivery gateway for the marketplace backend.
// Domain services hand a recipient and a notification to the delivery
// manager; everything between that call and the relay's acknowledgment
// lives in this crate.

pub mod ccs;
pub mod codec;
pub mod config;
pub mod error;
pub mod manager;
pub mod models;
pub mod msgid;
pub mod utils;

// Re-export the call surface for convenience
pub use config::GatewayConfig;
pub use error::DeliveryError;
pub use manager::DeliveryManager;
pub use models::{DeliveryEvent, DeliveryShape, EventKind, Notification, Recipient};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PendingSend, SendState};

    #[test]
    fn test_delivery_shape_resolution() {
        // Android agents get data messages, everything else a notification
        let android = Recipient::new("tok-1", Some("Dalvik/2.1.0 (Linux; Android 13)"), "Ana");
        assert_eq!(android.delivery_shape(), DeliveryShape::Data);

        let ios = Recipient::new("tok-2", Some("Marketplace/2.0 iOS/16.4"), "Ben");
        assert_eq!(ios.delivery_shape(), DeliveryShape::Notification);

        let unknown = Recipient::new("tok-3", None, "Cleo");
        assert_eq!(unknown.delivery_shape(), DeliveryShape::Notification);

        let garbage = Recipient::new("tok-4", Some("curl/8.0"), "Dan");
        assert_eq!(garbage.delivery_shape(), DeliveryShape::Notification);
    }

    #[test]
    fn test_event_kind_wire_names_are_stable() {
        assert_eq!(EventKind::RequestCreated.wire_name(), "request_created");
        assert_eq!(EventKind::OfferClosed.wire_name(), "offer_closed");
        assert_eq!(EventKind::OfferAccepted.wire_name(), "offer_accepted");
        assert_eq!(EventKind::ResponseUpdated.wire_name(), "response_updated");
        assert_eq!(EventKind::ExchangeConfirmed.wire_name(), "exchange_confirmed");
        assert_eq!(
            EventKind::TransactionCancelled.wire_name(),
            "transaction_cancelled"
        );
        assert_eq!(EventKind::PaymentConfirmed.wire_name(), "payment_confirmed");
    }

    #[test]
    fn test_notification_construction() {
        let notification = Notification::new(
            EventKind::OfferAccepted,
            "Offer accepted",
            "Your offer on 'city bike' was accepted",
        )
        .with_data("request_id", "req-811")
        .with_data("offer_id", "off-23");

        assert_eq!(notification.kind, EventKind::OfferAccepted);
        assert_eq!(notification.title, "Offer accepted");
        assert_eq!(notification.data.get("request_id").unwrap(), "req-811");
        assert_eq!(notification.data.len(), 2);
    }

    #[test]
    fn test_pending_send_starts_queued() {
        let recipient = Recipient::new("tok-9", None, "Eve");
        let pending = PendingSend::new("m-1", &recipient, EventKind::PaymentConfirmed, 1);

        assert_eq!(pending.state, SendState::Queued);
        assert_eq!(pending.message_id, "m-1");
        assert_eq!(pending.registration_token, "tok-9");
        assert_eq!(pending.attempt, 1);
        assert!(pending.queued_at > 0);
    }
}
