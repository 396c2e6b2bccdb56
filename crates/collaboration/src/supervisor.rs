/// Client-side connection supervision
/// Detects transport loss, reconnects with bounded exponential backoff and
/// resumes the held session
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::{
    ClientMessage, CollaborationError, ParticipantInfo, ReconnectPolicy, Result, ServerMessage,
    SessionId, Timer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting { attempt: u32 },
    /// Retries exhausted; only a manual `connect` leaves this state
    Failed,
    /// Left cleanly
    Closed,
}

/// Bidirectional message pipe to the server
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, message: &ClientMessage) -> Result<()>;

    /// Next message, `None` once the channel is closed
    async fn recv(&mut self) -> Option<Result<ServerMessage>>;

    async fn close(&mut self) -> Result<()>;
}

/// Opens transports
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>>;
}

/// Published to every subscriber, in order per subscriber
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    StateChanged(ConnectionState),
    Reconnecting { attempt: u32, delay: Duration },
    Message(ServerMessage),
    /// Terminal; the caller must reconnect manually
    ConnectionFailed { attempts: u32 },
}

/// Cancels pending reconnection from outside the supervisor
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    cancel: Arc<watch::Sender<bool>>,
}

impl SupervisorHandle {
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }
}

const DEFAULT_RESUME_CAPACITY: usize = 1024;

pub struct ConnectionSupervisor {
    connector: Arc<dyn Connector>,
    timer: Arc<dyn Timer>,
    policy: ReconnectPolicy,
    state: ConnectionState,
    transport: Option<Box<dyn Transport>>,
    session: Option<(SessionId, ParticipantInfo)>,
    /// Reliable messages sent while the link was down, flushed after resume
    resume: VecDeque<ClientMessage>,
    resume_capacity: usize,
    subscribers: Vec<mpsc::UnboundedSender<SupervisorEvent>>,
    cancel: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
}

impl ConnectionSupervisor {
    pub fn new(
        connector: Arc<dyn Connector>,
        timer: Arc<dyn Timer>,
        policy: ReconnectPolicy,
    ) -> Self {
        let (cancel, cancel_rx) = watch::channel(false);
        Self {
            connector,
            timer,
            policy,
            state: ConnectionState::Disconnected,
            transport: None,
            session: None,
            resume: VecDeque::new(),
            resume_capacity: DEFAULT_RESUME_CAPACITY,
            subscribers: Vec::new(),
            cancel: Arc::new(cancel),
            cancel_rx,
        }
    }

    pub fn with_resume_capacity(mut self, capacity: usize) -> Self {
        self.resume_capacity = capacity;
        self
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            cancel: self.cancel.clone(),
        }
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SupervisorEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session.as_ref().map(|(id, _)| *id)
    }

    pub fn pending(&self) -> usize {
        self.resume.len()
    }

    fn publish(&mut self, event: SupervisorEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "connection state");
            self.state = state;
            self.publish(SupervisorEvent::StateChanged(state));
        }
    }

    /// Open the transport
    pub async fn connect(&mut self) -> Result<()> {
        let _ = self.cancel.send(false);
        self.set_state(ConnectionState::Connecting);
        match self.connector.connect().await {
            Ok(transport) => {
                self.transport = Some(transport);
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Join a session and hold it for resumption
    pub async fn join(
        &mut self,
        session_id: SessionId,
        participant: ParticipantInfo,
    ) -> Result<()> {
        self.session = Some((session_id, participant.clone()));
        self.send(ClientMessage::JoinSession {
            session_id,
            participant,
        })
        .await
    }

    /// Send, buffering reliable messages while reconnecting
    pub async fn send(&mut self, message: ClientMessage) -> Result<()> {
        match self.state {
            ConnectionState::Connected => {}
            ConnectionState::Failed => {
                return Err(CollaborationError::ConnectionFailed {
                    attempts: self.policy.max_attempts,
                })
            }
            ConnectionState::Closed => {
                return Err(CollaborationError::ConnectionLost("connection closed".into()))
            }
            _ if self.session.is_some() => return self.buffer(message),
            _ => return Err(CollaborationError::ConnectionLost("not connected".into())),
        }

        let Some(transport) = self.transport.as_mut() else {
            return Err(CollaborationError::ConnectionLost("no transport".into()));
        };
        match transport.send(&message).await {
            Ok(()) => Ok(()),
            Err(e) if self.session.is_some() => {
                warn!(error = %e, "send failed, reconnecting");
                self.buffer(message)?;
                self.on_lost().await
            }
            Err(e) => {
                self.transport = None;
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    fn buffer(&mut self, message: ClientMessage) -> Result<()> {
        if message.is_presence() {
            return Ok(());
        }
        if self.resume.len() >= self.resume_capacity {
            return Err(CollaborationError::ConnectionLost(
                "resume queue full".into(),
            ));
        }
        self.resume.push_back(message);
        Ok(())
    }

    /// Next server message; reconnects transparently while a session is held
    pub async fn recv(&mut self) -> Result<ServerMessage> {
        loop {
            let Some(transport) = self.transport.as_mut() else {
                return Err(match self.state {
                    ConnectionState::Failed => CollaborationError::ConnectionFailed {
                        attempts: self.policy.max_attempts,
                    },
                    _ => CollaborationError::ConnectionLost("not connected".into()),
                });
            };
            match transport.recv().await {
                Some(Ok(message)) => {
                    self.publish(SupervisorEvent::Message(message.clone()));
                    return Ok(message);
                }
                Some(Err(e)) if !e.is_transient() => return Err(e),
                Some(Err(e)) => warn!(error = %e, "transport error"),
                None => debug!("transport closed by peer"),
            }

            if self.session.is_none() {
                self.transport = None;
                self.set_state(ConnectionState::Disconnected);
                return Err(CollaborationError::ConnectionLost("closed by peer".into()));
            }
            self.on_lost().await?;
        }
    }

    async fn on_lost(&mut self) -> Result<()> {
        self.transport = None;
        self.set_state(ConnectionState::Disconnected);
        self.reconnect().await
    }

    /// Retry with `base * 2^attempt` delays until connected, failed or cancelled
    pub async fn reconnect(&mut self) -> Result<()> {
        let timer = self.timer.clone();
        for attempt in 0..self.policy.max_attempts {
            if *self.cancel_rx.borrow() {
                return self.cancelled();
            }
            let delay = self.policy.delay(attempt);
            self.set_state(ConnectionState::Reconnecting { attempt });
            self.publish(SupervisorEvent::Reconnecting { attempt, delay });
            info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");

            let cancelled = tokio::select! {
                _ = timer.sleep(delay) => false,
                _ = wait_cancelled(&mut self.cancel_rx) => true,
            };
            if cancelled {
                return self.cancelled();
            }

            match self.connector.connect().await {
                Ok(transport) => {
                    self.transport = Some(transport);
                    match self.resume_session().await {
                        Ok(()) => {
                            self.set_state(ConnectionState::Connected);
                            return Ok(());
                        }
                        Err(e) => {
                            warn!(attempt, error = %e, "resume failed");
                            self.transport = None;
                        }
                    }
                }
                Err(e) => warn!(attempt, error = %e, "reconnect attempt failed"),
            }
        }

        let attempts = self.policy.max_attempts;
        self.set_state(ConnectionState::Failed);
        self.publish(SupervisorEvent::ConnectionFailed { attempts });
        Err(CollaborationError::ConnectionFailed { attempts })
    }

    /// Replay the join, then everything queued while down, in order
    async fn resume_session(&mut self) -> Result<()> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(CollaborationError::ConnectionLost("no transport".into()));
        };
        if let Some((session_id, participant)) = &self.session {
            transport
                .send(&ClientMessage::JoinSession {
                    session_id: *session_id,
                    participant: participant.clone(),
                })
                .await?;
        }
        while let Some(message) = self.resume.front() {
            transport.send(message).await?;
            self.resume.pop_front();
        }
        Ok(())
    }

    fn cancelled(&mut self) -> Result<()> {
        self.transport = None;
        self.session = None;
        self.resume.clear();
        self.set_state(ConnectionState::Closed);
        Err(CollaborationError::ConnectionLost("reconnection cancelled".into()))
    }

    /// Leave the held session and close; cancels any pending retry
    pub async fn leave(&mut self) -> Result<()> {
        let _ = self.cancel.send(true);
        if let Some(mut transport) = self.transport.take() {
            if self.session.is_some() {
                if let Err(e) = transport.send(&ClientMessage::LeaveSession).await {
                    debug!(error = %e, "leave not delivered");
                }
            }
            if let Err(e) = transport.close().await {
                debug!(error = %e, "close failed");
            }
        }
        self.session = None;
        self.resume.clear();
        self.set_state(ConnectionState::Closed);
        Ok(())
    }
}

async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

impl std::fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("state", &self.state)
            .field("session", &self.session())
            .field("pending", &self.resume.len())
            .finish_non_exhaustive()
    }
}
