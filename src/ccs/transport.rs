// Transport layer for the relay session.
// The session owns exactly one transport for its lifetime; the real
// implementation dials the relay's XMPP endpoint with tokio-xmpp and pumps
// the client from a single task, so no other component can write to it.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::debug;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_xmpp::{
    AsyncClient as XmppAsyncClient, AsyncConfig, AsyncServerConfig, BareJid,
    Event as XmppEvent,
};
use xmpp_parsers::Element;

use crate::config::GatewayConfig;
use crate::error::ConnectionError;

/// Domain the relay expects in the authentication JID. The TCP endpoint
/// itself comes from the configured host and port.
const CCS_JID_DOMAIN: &str = "gcm.googleapis.com";

/// Raw happenings on the wire, before the session interprets them.
#[derive(Debug)]
pub enum TransportEvent {
    /// Secure stream established and credentials accepted.
    Online,
    Stanza(Element),
    /// The connection is gone; no further events will arrive.
    Closed(ConnectionError),
}

/// Handles returned by a successful dial: one sender for outbound frames,
/// one receiver for everything the relay sends back.
pub struct TransportChannels {
    pub frames_out: mpsc::Sender<Element>,
    pub events_in: mpsc::Receiver<TransportEvent>,
}

/// Seam between the session and the network. Tests supply a scripted
/// implementation; production uses `XmppTransport`.
#[async_trait]
pub trait CcsTransport: Send + Sync {
    /// Dial the relay once. Each call produces a fresh connection; the
    /// previous one, if any, is abandoned by dropping its channels.
    async fn connect(
        &mut self,
        config: &GatewayConfig,
    ) -> Result<TransportChannels, ConnectionError>;
}

/// Production transport: a tokio-xmpp client against the CCS endpoint,
/// authenticating with the sender id as JID node and the API key as
/// password.
pub struct XmppTransport;

impl XmppTransport {
    pub fn new() -> Self {
        XmppTransport
    }
}

impl Default for XmppTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CcsTransport for XmppTransport {
    async fn connect(
        &mut self,
        config: &GatewayConfig,
    ) -> Result<TransportChannels, ConnectionError> {
        let jid = BareJid::from_str(&format!("{}@{}", config.sender_id, CCS_JID_DOMAIN))
            .map_err(|e| ConnectionError::InvalidConfig(format!("invalid sender id: {}", e)))?;

        let client = XmppAsyncClient::new_with_config(AsyncConfig {
            jid: jid.into(),
            password: config.api_key(),
            server: AsyncServerConfig::Manual {
                host: config.host.clone(),
                port: config.port,
            },
        });

        let (frames_tx, frames_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::channel(64);
        tokio::spawn(pump(client, frames_rx, events_tx));

        Ok(TransportChannels {
            frames_out: frames_tx,
            events_in: events_rx,
        })
    }
}

// Single owner of the XMPP client: forwards queued outbound frames, then
// polls the inbound stream with a short window so neither side starves.
async fn pump(
    mut client: XmppAsyncClient,
    mut frames_rx: mpsc::Receiver<Element>,
    events_tx: mpsc::Sender<TransportEvent>,
) {
    loop {
        loop {
            match frames_rx.try_recv() {
                Ok(frame) => {
                    if let Err(e) = client.send_stanza(frame).await {
                        let _ = events_tx
                            .send(TransportEvent::Closed(ConnectionError::Io(e.to_string())))
                            .await;
                        return;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    debug!("Session dropped the outbound channel, closing transport");
                    let _ = client.close().await;
                    return;
                }
            }
        }

        match tokio::time::timeout(Duration::from_millis(100), client.next()).await {
            Ok(Some(XmppEvent::Online { .. })) => {
                if events_tx.send(TransportEvent::Online).await.is_err() {
                    return;
                }
            }
            Ok(Some(XmppEvent::Stanza(stanza))) => {
                if events_tx.send(TransportEvent::Stanza(stanza)).await.is_err() {
                    return;
                }
            }
            Ok(Some(XmppEvent::Disconnected(e))) => {
                let _ = events_tx
                    .send(TransportEvent::Closed(classify_disconnect(e)))
                    .await;
                return;
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                let _ = events_tx
                    .send(TransportEvent::Closed(ConnectionError::StreamEnded))
                    .await;
                return;
            }
            Err(_) => {
                // No inbound traffic in this window; check outbound again
            }
        }
    }
}

fn classify_disconnect(error: tokio_xmpp::Error) -> ConnectionError {
    match error {
        tokio_xmpp::Error::Auth(_) => ConnectionError::AuthenticationFailed,
        tokio_xmpp::Error::Io(io_err) => ConnectionError::Io(io_err.to_string()),
        tokio_xmpp::Error::Tls(err) => ConnectionError::Tls(err.to_string()),
        other => ConnectionError::Io(format!("{:?}", other)),
    }
}
