// Session lifecycle: connect, handshake wait, shutdown.
// One call to connect() is one connection attempt; backoff between
// attempts belongs to the delivery manager, which owns reconnection.

use log::{error, info};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::ccs::{read_loop, CcsSession, SessionState, TransportEvent};
use crate::error::ConnectionError;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

impl CcsSession {
    /// Establish and authenticate one connection to the relay.
    ///
    /// On success the session is `Active` and the inbound read loop is
    /// running. Authentication failure is fatal for this attempt and is
    /// surfaced to the caller rather than retried here.
    pub async fn connect(&mut self) -> Result<(), ConnectionError> {
        match self.state() {
            SessionState::Connecting | SessionState::Authenticated | SessionState::Active => {
                return Ok(());
            }
            SessionState::Disconnected | SessionState::Draining => {}
        }

        info!(
            "Connecting to relay {}:{} as sender {}",
            self.config.host, self.config.port, self.config.sender_id
        );

        self.abort_reader();
        self.state_tx.send_replace(SessionState::Connecting);

        let mut channels = match self.transport.connect(&self.config).await {
            Ok(channels) => channels,
            Err(e) => {
                error!("Relay connection failed: {}", e);
                self.state_tx.send_replace(SessionState::Disconnected);
                return Err(e);
            }
        };

        if let Err(e) = wait_for_handshake(&mut channels.events_in, HANDSHAKE_TIMEOUT).await {
            match &e {
                ConnectionError::AuthenticationFailed => {
                    error!("Relay rejected credentials for sender {}", self.config.sender_id);
                }
                other => error!("Relay handshake failed: {}", other),
            }
            self.state_tx.send_replace(SessionState::Disconnected);
            return Err(e);
        }

        self.state_tx.send_replace(SessionState::Authenticated);
        self.frames_out = Some(channels.frames_out.clone());
        self.state_tx.send_replace(SessionState::Active);
        self.reader = Some(tokio::spawn(read_loop(
            channels.events_in,
            channels.frames_out,
            self.event_tx.clone(),
            self.state_tx.clone(),
        )));

        info!("Relay session active");
        Ok(())
    }

    /// Owner-requested, non-retriable shutdown. The session stays
    /// `Disconnected` until the next explicit connect.
    pub async fn shutdown(&mut self) {
        info!("Shutting down relay session");
        self.frames_out = None;
        self.abort_reader();
        self.state_tx.send_replace(SessionState::Disconnected);
    }

    pub(crate) fn abort_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

// Drive the inbound channel until the relay reports the stream online.
// Stream-setup stanzas before that point belong to the transport and are
// skipped here.
async fn wait_for_handshake(
    events_in: &mut mpsc::Receiver<TransportEvent>,
    timeout: Duration,
) -> Result<(), ConnectionError> {
    let wait = async {
        loop {
            match events_in.recv().await {
                Some(TransportEvent::Online) => return Ok(()),
                Some(TransportEvent::Stanza(_)) => continue,
                Some(TransportEvent::Closed(e)) => return Err(e),
                None => return Err(ConnectionError::StreamEnded),
            }
        }
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok(result) => result,
        Err(_) => Err(ConnectionError::HandshakeTimeout),
    }
}
