// Delivery manager: the public face of the gateway.
// Domain services call notify(); everything else here is bookkeeping to
// make that call honest: the pending-send table, the inbound-event
// dispatcher, reconnection with backoff, and the expiry sweeper.

use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex as TokioMutex};

use crate::ccs::{CcsSession, CcsTransport, NackReason, SessionEvent, SessionState, XmppTransport};
use crate::codec;
use crate::config::GatewayConfig;
use crate::error::DeliveryError;
use crate::models::{DeliveryEvent, EventKind, Notification, PendingSend, Recipient, SendState};
use crate::msgid::MessageIdGenerator;

// Reconnect delays grow exponentially from the configured base up to this
// ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Outcome of one send attempt, resolved by the event dispatcher.
#[derive(Debug)]
enum SendOutcome {
    Ack,
    Nack(NackReason),
    ConnectionLost,
}

// Pending-table entry: the correlation record plus the slot that wakes the
// waiting notify() call.
struct TrackedSend {
    record: PendingSend,
    result_tx: oneshot::Sender<SendOutcome>,
}

struct ManagerInner {
    config: GatewayConfig,
    ids: MessageIdGenerator,
    session: TokioMutex<CcsSession>,
    pending: TokioMutex<HashMap<String, TrackedSend>>,
    state_rx: watch::Receiver<SessionState>,
    events_tx: mpsc::Sender<DeliveryEvent>,
    queued_waiters: AtomicUsize,
    reconnecting: AtomicBool,
    shutting_down: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

// Decrements the queued-waiter count even when the waiting future is
// cancelled mid-await.
struct WaiterSlot(Arc<ManagerInner>);

impl Drop for WaiterSlot {
    fn drop(&mut self) {
        self.0.queued_waiters.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Push-notification delivery manager.
///
/// Owns the one live relay session and the pending-send table. Cheap to
/// clone; all clones share the same session and bookkeeping.
#[derive(Clone)]
pub struct DeliveryManager {
    inner: Arc<ManagerInner>,
}

impl DeliveryManager {
    /// Connect to the relay over the production XMPP transport.
    pub async fn connect(
        config: GatewayConfig,
    ) -> Result<(DeliveryManager, mpsc::Receiver<DeliveryEvent>)> {
        Self::start(config, Box::new(XmppTransport::new())).await
    }

    /// Start the gateway over an explicit transport. The initial
    /// connection is attempted eagerly so misconfiguration surfaces here
    /// instead of on the first notify().
    pub async fn start(
        config: GatewayConfig,
        transport: Box<dyn CcsTransport>,
    ) -> Result<(DeliveryManager, mpsc::Receiver<DeliveryEvent>)> {
        config
            .validate()
            .map_err(|e| anyhow!("invalid gateway configuration: {}", e))?;

        let (mut session, event_rx, state_rx) = CcsSession::new(config.clone(), transport);
        session
            .connect()
            .await
            .map_err(|e| anyhow!("initial relay connection failed: {}", e))?;

        let (events_tx, events_out) = mpsc::channel(100);
        let (shutdown_tx, _) = watch::channel(false);

        let inner = Arc::new(ManagerInner {
            config,
            ids: MessageIdGenerator::new(),
            session: TokioMutex::new(session),
            pending: TokioMutex::new(HashMap::new()),
            state_rx,
            events_tx,
            queued_waiters: AtomicUsize::new(0),
            reconnecting: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            shutdown_tx,
        });

        tokio::spawn(dispatch_events(inner.clone(), event_rx));
        tokio::spawn(sweep_expired(inner.clone()));

        Ok((DeliveryManager { inner }, events_out))
    }

    /// Deliver one notification to one recipient.
    ///
    /// Suspends the caller until the relay acknowledges, the recipient is
    /// found undeliverable, or the retry policy is exhausted. Dropping the
    /// returned future cancels the send on a best-effort basis: the
    /// pending entry is reaped, but the relay may already have delivered.
    pub async fn notify(
        &self,
        recipient: &Recipient,
        notification: &Notification,
    ) -> Result<(), DeliveryError> {
        let inner = &self.inner;

        if recipient.registration_token.trim().is_empty() {
            let err = DeliveryError::invalid_recipient("registration token is empty");
            warn!(
                "Refusing {} for {}: no registration token",
                notification.kind, recipient.display_name
            );
            self.emit_failure(None, recipient, notification.kind, &err);
            return Err(err);
        }

        let max_attempts = inner.config.max_retries + 1;
        let mut nack_retried = false;
        let mut attempt: u32 = 0;

        loop {
            if inner.shutting_down.load(Ordering::SeqCst) {
                let err = DeliveryError::ServiceUnavailable { queued: 0 };
                self.emit_failure(None, recipient, notification.kind, &err);
                return Err(err);
            }
            attempt += 1;

            match self.wait_until_active().await {
                Ok(true) => {}
                Ok(false) => {
                    // The wait window itself was the backoff
                    if attempt >= max_attempts {
                        let err = DeliveryError::Timeout { attempts: attempt };
                        self.emit_failure(None, recipient, notification.kind, &err);
                        return Err(err);
                    }
                    continue;
                }
                Err(err) => {
                    self.emit_failure(None, recipient, notification.kind, &err);
                    return Err(err);
                }
            }

            let message_id = inner.ids.next();
            let frame = match codec::encode(recipient, &message_id, notification) {
                Ok(frame) => frame,
                Err(err) => {
                    self.emit_failure(Some(&message_id), recipient, notification.kind, &err);
                    return Err(err);
                }
            };

            let (result_tx, result_rx) = oneshot::channel();
            {
                let mut pending = inner.pending.lock().await;
                if pending.len() >= inner.config.max_pending {
                    let err = DeliveryError::ServiceUnavailable {
                        queued: pending.len(),
                    };
                    self.emit_failure(None, recipient, notification.kind, &err);
                    return Err(err);
                }
                pending.insert(
                    message_id.clone(),
                    TrackedSend {
                        record: PendingSend::new(&message_id, recipient, notification.kind, attempt),
                        result_tx,
                    },
                );
            }
            debug!(
                "Queued {} for {} as message {} (attempt {}/{})",
                notification.kind, recipient.display_name, message_id, attempt, max_attempts
            );

            let submit = {
                let session = inner.session.lock().await;
                session.send(frame).await
            };
            if let Err(e) = submit {
                inner.pending.lock().await.remove(&message_id);
                debug!("Submit failed for message {}: {}", message_id, e);
                if attempt >= max_attempts {
                    let err = DeliveryError::Timeout { attempts: attempt };
                    self.emit_failure(Some(&message_id), recipient, notification.kind, &err);
                    return Err(err);
                }
                tokio::time::sleep(backoff_with_jitter(&inner.config, attempt - 1)).await;
                continue;
            }
            self.mark_sent(&message_id).await;

            let wait = Duration::from_millis(inner.config.ack_timeout_ms);
            match tokio::time::timeout(wait, result_rx).await {
                Ok(Ok(SendOutcome::Ack)) => {
                    debug!("Relay acknowledged message {}", message_id);
                    self.emit_delivered(&message_id, recipient, notification.kind);
                    return Ok(());
                }
                Ok(Ok(SendOutcome::Nack(reason))) if reason.is_permanent() => {
                    let err = DeliveryError::invalid_recipient(&format!(
                        "relay rejected registration token: {}",
                        reason.as_code()
                    ));
                    self.emit_failure(Some(&message_id), recipient, notification.kind, &err);
                    return Err(err);
                }
                Ok(Ok(SendOutcome::Nack(reason))) => {
                    if nack_retried {
                        let err = DeliveryError::transient(&format!(
                            "relay nack: {}",
                            reason.as_code()
                        ));
                        self.emit_failure(Some(&message_id), recipient, notification.kind, &err);
                        return Err(err);
                    }
                    nack_retried = true;
                    info!(
                        "Transient nack ({}) for message {}, retrying once",
                        reason.as_code(),
                        message_id
                    );
                    tokio::time::sleep(backoff_with_jitter(&inner.config, 0)).await;
                    continue;
                }
                Ok(Ok(SendOutcome::ConnectionLost)) | Ok(Err(_)) => {
                    if attempt >= max_attempts {
                        let err = DeliveryError::Timeout { attempts: attempt };
                        self.emit_failure(Some(&message_id), recipient, notification.kind, &err);
                        return Err(err);
                    }
                    info!(
                        "Connection lost with message {} unacknowledged, will retry",
                        message_id
                    );
                    tokio::time::sleep(backoff_with_jitter(&inner.config, attempt - 1)).await;
                    continue;
                }
                Err(_) => {
                    inner.pending.lock().await.remove(&message_id);
                    if attempt >= max_attempts {
                        let err = DeliveryError::Timeout { attempts: attempt };
                        self.emit_failure(Some(&message_id), recipient, notification.kind, &err);
                        return Err(err);
                    }
                    info!("No ack for message {} within window, retrying", message_id);
                    tokio::time::sleep(backoff_with_jitter(&inner.config, attempt - 1)).await;
                    continue;
                }
            }
        }
    }

    /// Number of sends awaiting an outcome from the relay.
    pub async fn pending_count(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    pub fn session_state(&self) -> SessionState {
        *self.inner.state_rx.borrow()
    }

    /// Stop the gateway permanently. In-flight sends are failed; callers
    /// waiting in notify() observe an error.
    pub async fn shutdown(&self) {
        info!("Shutting down delivery gateway");
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let _ = self.inner.shutdown_tx.send(true);
        {
            let mut session = self.inner.session.lock().await;
            session.shutdown().await;
        }
        fail_in_flight(&self.inner, "gateway shutdown").await;
    }

    // Wait for the session to become active, queueing behind a reconnect
    // if one is in progress. Ok(false) means the window elapsed without a
    // live session; the caller accounts it as a failed attempt.
    async fn wait_until_active(&self) -> Result<bool, DeliveryError> {
        let inner = &self.inner;
        let mut state_rx = inner.state_rx.clone();

        if *state_rx.borrow() == SessionState::Active {
            return Ok(true);
        }

        let queued = inner.queued_waiters.load(Ordering::SeqCst) + inner.pending.lock().await.len();
        if queued >= inner.config.max_pending {
            debug!("Pending queue full ({} entries), failing fast", queued);
            return Err(DeliveryError::ServiceUnavailable { queued });
        }

        inner.queued_waiters.fetch_add(1, Ordering::SeqCst);
        let _slot = WaiterSlot(inner.clone());

        let wait = Duration::from_millis(inner.config.ack_timeout_ms);
        let result = match tokio::time::timeout(wait, state_rx.wait_for(|s| *s == SessionState::Active)).await {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(_)) => Ok(false),
            Err(_) => Ok(false),
        };
        result
    }

    async fn mark_sent(&self, message_id: &str) {
        let mut pending = self.inner.pending.lock().await;
        // The entry is gone already if the relay answered before we got here
        if let Some(entry) = pending.get_mut(message_id) {
            entry.record.state = SendState::Sent;
        }
    }

    fn emit_delivered(&self, message_id: &str, recipient: &Recipient, kind: EventKind) {
        let event = DeliveryEvent::Delivered {
            message_id: message_id.to_string(),
            recipient: recipient.display_name.clone(),
            kind,
        };
        if self.inner.events_tx.try_send(event).is_err() {
            debug!("Observability channel unavailable, dropping delivery event");
        }
    }

    fn emit_failure(
        &self,
        message_id: Option<&str>,
        recipient: &Recipient,
        kind: EventKind,
        error: &DeliveryError,
    ) {
        let event = DeliveryEvent::Failed {
            message_id: message_id.map(|s| s.to_string()),
            recipient: recipient.display_name.clone(),
            kind,
            error: error.to_string(),
        };
        if self.inner.events_tx.try_send(event).is_err() {
            debug!("Observability channel unavailable, dropping failure event");
        }
    }
}

// Sole consumer of session events. Correlation is a table lookup; callers
// are woken through their oneshot slots, never called into directly.
async fn dispatch_events(inner: Arc<ManagerInner>, mut event_rx: mpsc::Receiver<SessionEvent>) {
    let mut shutdown_rx = inner.shutdown_tx.subscribe();
    loop {
        let event = tokio::select! {
            event = event_rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = shutdown_rx.wait_for(|stop| *stop) => break,
        };

        match event {
            SessionEvent::Ack { message_id } => {
                resolve_pending(&inner, &message_id, SendOutcome::Ack).await;
            }
            SessionEvent::Nack { message_id, reason } => {
                resolve_pending(&inner, &message_id, SendOutcome::Nack(reason)).await;
            }
            SessionEvent::Draining => {
                info!("Relay draining connection, scheduling graceful reconnect");
                spawn_reconnect(inner.clone(), true);
            }
            SessionEvent::Closed { reason } => {
                warn!("Relay connection lost: {}", reason);
                fail_in_flight(&inner, &reason).await;
                if !inner.shutting_down.load(Ordering::SeqCst) {
                    spawn_reconnect(inner.clone(), false);
                }
            }
        }
    }
    debug!("Delivery event dispatcher stopped");
}

async fn resolve_pending(inner: &Arc<ManagerInner>, message_id: &str, outcome: SendOutcome) {
    let entry = {
        let mut pending = inner.pending.lock().await;
        pending.remove(message_id)
    };

    match entry {
        Some(mut entry) => {
            entry.record.state = match outcome {
                SendOutcome::Ack => SendState::Acknowledged,
                _ => SendState::Failed,
            };
            if entry.result_tx.send(outcome).is_err() {
                debug!("Caller for message {} is gone, dropping outcome", message_id);
            }
        }
        None => {
            debug!("Outcome for unknown message id {}", message_id);
        }
    }
}

// Fail every in-flight send so the waiting notify() calls can retry
// against the replacement connection.
async fn fail_in_flight(inner: &Arc<ManagerInner>, reason: &str) {
    let drained: Vec<TrackedSend> = {
        let mut pending = inner.pending.lock().await;
        pending.drain().map(|(_, entry)| entry).collect()
    };

    if drained.is_empty() {
        return;
    }
    warn!("Failing {} in-flight sends: {}", drained.len(), reason);
    for mut entry in drained {
        entry.record.state = SendState::Failed;
        let _ = entry.result_tx.send(SendOutcome::ConnectionLost);
    }
}

// One reconnect task at a time. Graceful reconnects give already-submitted
// sends a window to collect their acks before the old connection closes.
fn spawn_reconnect(inner: Arc<ManagerInner>, graceful: bool) {
    if inner.reconnecting.swap(true, Ordering::SeqCst) {
        return;
    }

    tokio::spawn(async move {
        if graceful {
            let grace = Duration::from_millis(inner.config.ack_timeout_ms);
            let deadline = tokio::time::Instant::now() + grace;
            while tokio::time::Instant::now() < deadline {
                if inner.pending.lock().await.is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }

        {
            let mut session = inner.session.lock().await;
            session.shutdown().await;
        }
        fail_in_flight(&inner, "connection superseded").await;

        let mut attempt: u32 = 0;
        loop {
            if inner.shutting_down.load(Ordering::SeqCst) {
                break;
            }

            let result = {
                let mut session = inner.session.lock().await;
                session.connect().await
            };
            match result {
                Ok(()) => {
                    info!("Reconnected to relay");
                    break;
                }
                Err(crate::error::ConnectionError::AuthenticationFailed) => {
                    error!("Relay rejected credentials during reconnect, giving up");
                    break;
                }
                Err(e) => {
                    warn!("Reconnect attempt {} failed: {}", attempt + 1, e);
                }
            }

            let delay = backoff_with_jitter(&inner.config, attempt);
            debug!("Retrying relay connection in {:?}", delay);
            tokio::time::sleep(delay).await;
            attempt = attempt.saturating_add(1);
        }

        inner.reconnecting.store(false, Ordering::SeqCst);
    });
}

// Periodically reap entries whose caller went away (cancelled notify) or
// that outlived the ack window twice over.
async fn sweep_expired(inner: Arc<ManagerInner>) {
    let interval = Duration::from_millis((inner.config.ack_timeout_ms / 2).max(50));
    let mut shutdown_rx = inner.shutdown_tx.subscribe();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown_rx.wait_for(|stop| *stop) => break,
        }

        let now = chrono::Utc::now().timestamp_millis() as u64;
        let expiry = inner.config.ack_timeout_ms.saturating_mul(2);
        let mut pending = inner.pending.lock().await;
        let before = pending.len();
        pending.retain(|message_id, entry| {
            if entry.result_tx.is_closed() {
                debug!("Reaping cancelled send {}", message_id);
                return false;
            }
            if now.saturating_sub(entry.record.queued_at) > expiry {
                warn!(
                    "Reaping expired send {} ({})",
                    message_id, entry.record.kind
                );
                return false;
            }
            true
        });
        let removed = before - pending.len();
        if removed > 0 {
            debug!("Expiry sweep removed {} entries", removed);
        }
    }
    debug!("Expiry sweeper stopped");
}

fn backoff_with_jitter(config: &GatewayConfig, attempt: u32) -> Duration {
    let base = config.base_backoff_ms.max(1);
    let backoff = base.saturating_mul(2u64.saturating_pow(attempt.min(16)));
    let jitter = rand::random::<u64>() % base;
    Duration::from_millis(backoff.saturating_add(jitter)).min(MAX_BACKOFF)
}
