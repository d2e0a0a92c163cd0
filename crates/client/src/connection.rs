//! Connection manager
//!
//! Owns one logical transport connection per session. Each connection runs
//! in its own driver task which:
//! - opens the transport and sends the `connect` handshake,
//! - waits (bounded) for the far end's `ack` before reporting `open`,
//! - forwards inbound envelopes as typed [`ConnectionEvent`]s,
//! - reconnects with exponential backoff on abnormal close, and
//! - gives up in the terminal `failed` state after the attempt budget.
//!
//! Lifecycle events are advisory; nothing downstream depends on them for
//! correctness.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_retry::strategy::ExponentialBackoff;
use uuid::Uuid;

use relaydesk_shared::{Channel, Envelope, Handshake, ParticipantId, Role};

use crate::error::ClientError;
use crate::transport::{Transport, TransportLink};

/// Default number of open attempts before a connection is marked failed
pub const DEFAULT_MAX_ATTEMPTS: usize = 5;

/// Default delay before the first retry
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default ceiling for a single backoff delay
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Default window for the far end to acknowledge a handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Open attempts per connect/reconnect cycle
    pub max_attempts: usize,
    /// First retry delay; doubles on every further attempt
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub handshake_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl ConnectionConfig {
    /// Delays between attempts: base, 2*base, 4*base, ... capped at `max_delay`
    pub fn backoff(&self) -> impl Iterator<Item = Duration> {
        // ExponentialBackoff yields current * factor and then multiplies
        // current by the base, so base 2 with factor base/2 gives base, 2x, 4x.
        let factor = (self.base_delay.as_millis() as u64 / 2).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.max_delay)
    }
}

/// Socket state as seen by the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    /// Attempt budget exhausted; needs an explicit reconnect
    Failed,
    Closed,
}

impl SocketState {
    /// No further transition happens without caller action
    pub fn is_settled(&self) -> bool {
        matches!(self, SocketState::Open | SocketState::Failed | SocketState::Closed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Connecting,
    Open { session_id: Uuid },
    Reconnecting { attempt: usize, delay: Duration },
    Failed { attempts: usize },
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Lifecycle(LifecycleEvent),
    /// Message, typing or ticket envelope pushed by the far end
    Envelope(Envelope),
    /// `error` envelope from the far end; non-fatal
    Notice(String),
}

#[derive(Debug)]
enum Command {
    Send(Envelope),
    Reconnect,
    Close,
}

/// Builds connections over a shared transport
#[derive(Clone)]
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, config: ConnectionConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Start a connection for `(subject, role, channel)`.
    ///
    /// Returns immediately; the handle becomes usable once the far end has
    /// acknowledged the handshake (see [`ConnectionHandle::settled`]).
    pub fn connect(
        &self,
        subject_id: ParticipantId,
        role: Role,
        channel: Channel,
    ) -> (ConnectionHandle, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SocketState::Idle);

        let driver = Driver {
            transport: Arc::clone(&self.transport),
            config: self.config.clone(),
            subject_id,
            role,
            channel,
            state: state_tx,
            events: event_tx,
            commands: command_rx,
        };
        let task = tokio::spawn(driver.run());

        tracing::info!(
            subject_id = %subject_id,
            role = %role,
            channel = %channel,
            "Connection starting"
        );

        (
            ConnectionHandle {
                commands: command_tx,
                state: state_rx,
                channel,
                task,
            },
            event_rx,
        )
    }
}

/// Caller-side handle to one connection
#[derive(Debug)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SocketState>,
    channel: Channel,
    task: JoinHandle<()>,
}

impl ConnectionHandle {
    pub fn state(&self) -> SocketState {
        *self.state.borrow()
    }

    /// Channel announced on every handshake of this connection
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Fire-and-forget send; fails fast unless the connection is open
    pub fn send(&self, envelope: Envelope) -> Result<(), ClientError> {
        let state = self.state();
        if state != SocketState::Open {
            return Err(ClientError::NotConnected(state));
        }
        self.commands
            .send(Command::Send(envelope))
            .map_err(|_| ClientError::Closed)
    }

    /// Restart the attempt budget after the connection reached `failed`
    pub fn reconnect(&self) -> Result<(), ClientError> {
        self.commands
            .send(Command::Reconnect)
            .map_err(|_| ClientError::Closed)
    }

    /// Wait until the connection is open, failed or closed
    pub async fn settled(&self) -> SocketState {
        self.wait_for(|s| s.is_settled()).await
    }

    /// Wait until the state satisfies `f`
    pub async fn wait_for(&self, f: impl Fn(SocketState) -> bool) -> SocketState {
        let mut state = self.state.clone();
        let settled = match state.wait_for(|s| f(*s)).await {
            Ok(s) => *s,
            Err(_) => SocketState::Closed,
        };
        settled
    }

    /// Close the connection and wait for the driver to stop
    pub async fn close(self) {
        let _ = self.commands.send(Command::Close);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Connection driver ended abnormally");
        }
    }
}

enum Established {
    Open(TransportLink),
    Exhausted(usize),
    Closed,
}

enum PumpExit {
    Dropped,
    Closed,
}

struct Driver {
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    subject_id: ParticipantId,
    role: Role,
    channel: Channel,
    state: watch::Sender<SocketState>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl Driver {
    async fn run(mut self) {
        let mut after_drop = false;

        loop {
            let link = match self.establish(after_drop).await {
                Established::Open(link) => link,
                Established::Closed => return self.finish(),
                Established::Exhausted(attempts) => {
                    self.set_state(SocketState::Failed);
                    self.emit(ConnectionEvent::Lifecycle(LifecycleEvent::Failed { attempts }));
                    tracing::error!(
                        subject_id = %self.subject_id,
                        attempts = attempts,
                        "Connection failed - giving up until reconnect is requested"
                    );
                    if self.wait_for_reconnect().await {
                        after_drop = false;
                        continue;
                    }
                    return self.finish();
                }
            };

            match self.pump(link).await {
                PumpExit::Closed => return self.finish(),
                PumpExit::Dropped => {
                    tracing::warn!(
                        subject_id = %self.subject_id,
                        "Transport dropped - reconnecting"
                    );
                    after_drop = true;
                }
            }
        }
    }

    /// Run one attempt budget. After a drop even the first attempt waits.
    async fn establish(&mut self, after_drop: bool) -> Established {
        let mut delays = self.config.backoff();

        for attempt in 1..=self.config.max_attempts {
            if attempt > 1 || after_drop {
                let delay = delays.next().unwrap_or(self.config.max_delay);
                self.set_state(SocketState::Reconnecting);
                self.emit(ConnectionEvent::Lifecycle(LifecycleEvent::Reconnecting {
                    attempt,
                    delay,
                }));
                if !self.backoff(delay).await {
                    return Established::Closed;
                }
            } else {
                self.set_state(SocketState::Connecting);
                self.emit(ConnectionEvent::Lifecycle(LifecycleEvent::Connecting));
            }

            match self.open_once().await {
                Ok((link, session_id)) => {
                    self.set_state(SocketState::Open);
                    self.emit(ConnectionEvent::Lifecycle(LifecycleEvent::Open { session_id }));
                    tracing::info!(
                        subject_id = %self.subject_id,
                        session_id = %session_id,
                        attempt = attempt,
                        "Connection open"
                    );
                    return Established::Open(link);
                }
                Err(e) => {
                    tracing::warn!(
                        subject_id = %self.subject_id,
                        attempt = attempt,
                        max_attempts = self.config.max_attempts,
                        error = %e,
                        "Connection attempt failed"
                    );
                    if !e.is_transient() {
                        return Established::Exhausted(attempt);
                    }
                }
            }
        }

        Established::Exhausted(self.config.max_attempts)
    }

    /// Sleep out a backoff delay. Returns false if the caller closed meanwhile.
    async fn backoff(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Send(envelope)) => self.drop_send(&envelope),
                    Some(Command::Reconnect) => {}
                    Some(Command::Close) | None => return false,
                },
            }
        }
    }

    async fn open_once(&self) -> Result<(TransportLink, Uuid), ClientError> {
        let mut link = self.transport.open().await?;

        let handshake = Handshake {
            subject_id: self.subject_id,
            role: self.role,
            channel: self.channel,
        };
        link.send_envelope(&Envelope::Connect(handshake)).await?;

        let timeout = self.config.handshake_timeout;
        let session_id = tokio::time::timeout(timeout, wait_for_ack(&mut link))
            .await
            .map_err(|_| ClientError::HandshakeTimeout(timeout))??;

        Ok((link, session_id))
    }

    async fn pump(&mut self, mut link: TransportLink) -> PumpExit {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Send(envelope)) => {
                        if let Err(e) = link.send_envelope(&envelope).await {
                            tracing::warn!(
                                kind = envelope.kind(),
                                error = %e,
                                "Send failed - transport dropped"
                            );
                            return PumpExit::Dropped;
                        }
                    }
                    Some(Command::Reconnect) => {} // Already open
                    Some(Command::Close) | None => return PumpExit::Closed,
                },
                frame = link.inbound.recv() => match frame {
                    Some(text) => self.dispatch(&text),
                    None => return PumpExit::Dropped,
                },
            }
        }
    }

    fn dispatch(&self, text: &str) {
        match Envelope::from_json(text) {
            Ok(Envelope::Error { message }) => {
                tracing::warn!(message = %message, "Far end reported an error");
                self.emit(ConnectionEvent::Notice(message));
            }
            Ok(Envelope::Ack { .. }) | Ok(Envelope::Connect(_)) => {
                tracing::debug!("Ignoring handshake frame on open connection");
            }
            Ok(envelope) => self.emit(ConnectionEvent::Envelope(envelope)),
            Err(e) => {
                tracing::warn!(error = %e, "Discarding malformed envelope");
            }
        }
    }

    /// Park in `failed` until the caller asks for a reconnect (true) or closes (false)
    async fn wait_for_reconnect(&mut self) -> bool {
        while let Some(cmd) = self.commands.recv().await {
            match cmd {
                Command::Reconnect => {
                    tracing::info!(subject_id = %self.subject_id, "Reconnect requested");
                    return true;
                }
                Command::Send(envelope) => self.drop_send(&envelope),
                Command::Close => return false,
            }
        }
        false
    }

    fn drop_send(&self, envelope: &Envelope) {
        tracing::debug!(
            kind = envelope.kind(),
            state = ?*self.state.borrow(),
            "Dropping send while disconnected"
        );
    }

    fn finish(&self) {
        self.set_state(SocketState::Closed);
        self.emit(ConnectionEvent::Lifecycle(LifecycleEvent::Closed));
        tracing::info!(subject_id = %self.subject_id, "Connection closed");
    }

    fn set_state(&self, state: SocketState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: ConnectionEvent) {
        // Receiver gone means nobody is listening for advisories
        let _ = self.events.send(event);
    }
}

async fn wait_for_ack(link: &mut TransportLink) -> Result<Uuid, ClientError> {
    while let Some(text) = link.inbound.recv().await {
        match Envelope::from_json(&text) {
            Ok(Envelope::Ack { session_id }) => return Ok(session_id),
            Ok(Envelope::Error { message }) => return Err(ClientError::HandshakeRejected(message)),
            Ok(other) => {
                tracing::debug!(kind = other.kind(), "Frame before handshake ack ignored");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Discarding malformed envelope during handshake");
            }
        }
    }
    Err(ClientError::TransportClosed)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Transport whose every open fails
    struct RefusingTransport {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Transport for RefusingTransport {
        async fn open(&self) -> Result<TransportLink, ClientError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(ClientError::Transport("connection refused".to_string()))
        }
    }

    async fn accept_handshake(far: &mut TransportLink) -> Handshake {
        let text = far.inbound.recv().await.unwrap();
        let handshake = match Envelope::from_json(&text).unwrap() {
            Envelope::Connect(hs) => hs,
            other => panic!("Expected connect, got {:?}", other),
        };
        far.send_envelope(&Envelope::Ack {
            session_id: Uuid::new_v4(),
        })
        .await
        .unwrap();
        handshake
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_backoff_doubles_from_one_second() {
        let delays: Vec<_> = ConnectionConfig::default().backoff().take(6).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16),
                Duration::from_secs(30),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_cap_reaches_failed() {
        let transport = Arc::new(RefusingTransport {
            attempts: AtomicUsize::new(0),
        });
        let manager = ConnectionManager::new(transport.clone(), ConnectionConfig::default());
        let (handle, mut events) = manager.connect(ParticipantId::new(), Role::User, Channel::Assistant);

        assert_eq!(handle.settled().await, SocketState::Failed);
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 5);

        // No further automatic attempts
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 5);

        let events = drain(&mut events);
        assert_eq!(events[0], ConnectionEvent::Lifecycle(LifecycleEvent::Connecting));
        let delays: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ConnectionEvent::Lifecycle(LifecycleEvent::Reconnecting { delay, .. }) => Some(*delay),
                _ => None,
            })
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
            ]
        );
        assert_eq!(
            events.last(),
            Some(&ConnectionEvent::Lifecycle(LifecycleEvent::Failed { attempts: 5 }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_reconnect_restarts_budget() {
        let transport = Arc::new(RefusingTransport {
            attempts: AtomicUsize::new(0),
        });
        let manager = ConnectionManager::new(transport.clone(), ConnectionConfig::default());
        let (handle, _events) = manager.connect(ParticipantId::new(), Role::User, Channel::Assistant);
        assert_eq!(handle.settled().await, SocketState::Failed);

        handle.reconnect().unwrap();
        handle.wait_for(|s| s != SocketState::Failed).await;
        assert_eq!(handle.settled().await, SocketState::Failed);
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_must_be_acknowledged() {
        let (transport, mut accepted) = ChannelTransport::new();
        let config = ConnectionConfig {
            max_attempts: 2,
            ..ConnectionConfig::default()
        };
        let manager = ConnectionManager::new(Arc::new(transport), config);
        let (handle, _events) = manager.connect(ParticipantId::new(), Role::User, Channel::Operator);

        // Far end reads the handshake but never acks
        let mut silent = Vec::new();
        for _ in 0..2 {
            let mut far = accepted.recv().await.unwrap();
            far.inbound.recv().await.unwrap();
            silent.push(far);
        }

        assert_eq!(handle.settled().await, SocketState::Failed);
        assert!(matches!(
            handle.send(Envelope::error("x")),
            Err(ClientError::NotConnected(SocketState::Failed))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_repeats_handshake() {
        let (transport, mut accepted) = ChannelTransport::new();
        let manager = ConnectionManager::new(Arc::new(transport), ConnectionConfig::default());
        let subject = ParticipantId::new();
        let (handle, mut events) = manager.connect(subject, Role::User, Channel::Assistant);

        let mut far = accepted.recv().await.unwrap();
        let first = accept_handshake(&mut far).await;
        assert_eq!(first.channel, Channel::Assistant);
        assert_eq!(handle.settled().await, SocketState::Open);

        drop(far); // abnormal close

        let mut far = accepted.recv().await.unwrap();
        let second = accept_handshake(&mut far).await;
        assert_eq!(second.channel, Channel::Assistant);
        assert_eq!(handle.channel(), Channel::Assistant);
        assert_eq!(second.subject_id, subject);

        assert_eq!(handle.settled().await, SocketState::Open);
        let events = drain(&mut events);
        assert!(events.contains(&ConnectionEvent::Lifecycle(LifecycleEvent::Reconnecting {
            attempt: 1,
            delay: Duration::from_secs(1),
        })));
    }

    #[tokio::test]
    async fn test_inbound_envelopes_and_notices_are_forwarded() {
        let (transport, mut accepted) = ChannelTransport::new();
        let manager = ConnectionManager::new(Arc::new(transport), ConnectionConfig::default());
        let subject = ParticipantId::new();
        let (handle, mut events) = manager.connect(subject, Role::User, Channel::Operator);

        let mut far = accepted.recv().await.unwrap();
        accept_handshake(&mut far).await;
        assert_eq!(handle.settled().await, SocketState::Open);

        far.outbound.send("{garbage".to_string()).await.unwrap();
        far.send_envelope(&Envelope::error("slow down")).await.unwrap();
        let typing = Envelope::Typing(relaydesk_shared::TypingSignal {
            conversation_id: relaydesk_shared::ConversationId::for_subject(subject, Channel::Operator),
            sender_id: ParticipantId::new(),
        });
        far.send_envelope(&typing).await.unwrap();

        let mut forwarded = Vec::new();
        while forwarded.len() < 2 {
            match events.recv().await.unwrap() {
                ConnectionEvent::Lifecycle(_) => {}
                other => forwarded.push(other),
            }
        }
        assert_eq!(forwarded[0], ConnectionEvent::Notice("slow down".to_string()));
        assert_eq!(forwarded[1], ConnectionEvent::Envelope(typing));
        // Malformed frame did not tear the connection down
        assert_eq!(handle.state(), SocketState::Open);

        handle.send(Envelope::error("outbound")).unwrap();
        let sent = far.inbound.recv().await.unwrap();
        assert!(sent.contains("outbound"));

        handle.close().await;
        assert!(far.inbound.recv().await.is_none());
    }
}
