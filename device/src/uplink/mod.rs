//! Connection, retry and store-and-forward for telemetry.
//!
//! The manager owns the single `ConnectionState` and the outbound FIFO. Every
//! state change goes through [`Inner::transition`], which also drives the link
//! indicator. A background session task per `initialize()` runs the connect
//! loop and then watches transport status events.

pub mod mqtt;
pub mod transport;

use std::{collections::VecDeque, sync::Arc, time::Duration};

use tokio::{
    sync::{broadcast::error::RecvError, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use thermolink_common::{ConnectionState, SendOutcome, TelemetryMessage, UplinkConfig};

use crate::hardware::OutputPin;
use transport::{within, CommandHandler, LinkEvent, Transport};

/// Delay before retrying after connect attempt `attempt` (1-based) failed.
pub fn backoff_delay(config: &UplinkConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let seconds = config
        .backoff_base_seconds
        .saturating_mul(1_u64 << exponent)
        .min(config.backoff_cap_seconds);
    Duration::from_secs(seconds)
}

struct UplinkState {
    connection: ConnectionState,
    queue: VecDeque<TelemetryMessage>,
    indicator: Box<dyn OutputPin>,
    /// Bumped by every `initialize()`/`shutdown()`; stale sessions compare
    /// against it and stop.
    generation: u64,
}

struct Inner {
    transport: Arc<dyn Transport>,
    config: UplinkConfig,
    operation_deadline: Duration,
    state: Mutex<UplinkState>,
    /// Serializes every transport send so ordering holds across the direct
    /// path and the drain.
    send_lock: Mutex<()>,
    session: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct UplinkManager {
    inner: Arc<Inner>,
}

impl UplinkManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: UplinkConfig,
        operation_deadline: Duration,
        indicator: Box<dyn OutputPin>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                operation_deadline,
                state: Mutex::new(UplinkState {
                    connection: ConnectionState::Disconnected,
                    queue: VecDeque::new(),
                    indicator,
                    generation: 0,
                }),
                send_lock: Mutex::new(()),
                session: Mutex::new(None),
            }),
        }
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.state.lock().await.connection
    }

    pub async fn queued(&self) -> usize {
        self.inner.state.lock().await.queue.len()
    }

    /// Puts messages persisted by a previous run ahead of anything queued since.
    pub async fn restore(&self, messages: Vec<TelemetryMessage>) {
        if messages.is_empty() {
            return;
        }
        let mut state = self.inner.state.lock().await;
        for message in messages.into_iter().rev() {
            state.queue.push_front(message);
        }
        while state.queue.len() > self.inner.config.max_queued_messages {
            state.queue.pop_front();
        }
        info!(queued = state.queue.len(), "restored undelivered telemetry");
    }

    /// Starts a session. Only valid from `Disconnected` or `Disabled`; returns
    /// false otherwise.
    pub async fn initialize(&self, handler: Arc<dyn CommandHandler>) -> bool {
        let generation = {
            let mut state = self.inner.state.lock().await;
            if state.connection.is_active() {
                debug!(state = %state.connection, "initialize ignored");
                return false;
            }
            state.generation = state.generation.wrapping_add(1);
            Inner::transition(&mut state, ConnectionState::Connecting);
            state.generation
        };

        self.inner.transport.set_command_handler(handler);

        let task = tokio::spawn(Inner::run_session(self.inner.clone(), generation));
        if let Some(previous) = self.inner.session.lock().await.replace(task) {
            previous.abort();
        }
        true
    }

    /// Sends now when connected with an empty backlog, otherwise queues. Never
    /// fails: on error or deadline expiry the message stays queued.
    pub async fn send_telemetry(&self, message: TelemetryMessage, deadline: Duration) -> SendOutcome {
        {
            let mut state = self.inner.state.lock().await;
            if state.connection != ConnectionState::Connected {
                self.inner.enqueue(&mut state, message);
                return SendOutcome::Queued;
            }
        }

        let pending = message.clone();
        match tokio::time::timeout(deadline, self.inner.send_in_order(message)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(deadline_secs = deadline.as_secs(), "telemetry send cancelled at deadline");
                let mut state = self.inner.state.lock().await;
                if !state.queue.contains(&pending) {
                    self.inner.enqueue(&mut state, pending);
                }
                SendOutcome::Cancelled
            }
        }
    }

    /// Stops the session, gives the backlog one last chance within `deadline`
    /// and hands back whatever is still undelivered.
    pub async fn shutdown(&self, deadline: Duration) -> Vec<TelemetryMessage> {
        if self.state().await == ConnectionState::Connected {
            let drained = tokio::time::timeout(deadline, async {
                let _send = self.inner.send_lock.lock().await;
                self.inner.drain_locked().await
            })
            .await;
            if drained.is_err() {
                warn!("final drain cut short at deadline");
            }
        }

        {
            let mut state = self.inner.state.lock().await;
            state.generation = state.generation.wrapping_add(1);
        }
        if let Some(task) = self.inner.session.lock().await.take() {
            task.abort();
        }

        if let Err(err) = within(deadline, self.inner.transport.disconnect()).await {
            warn!("transport disconnect failed: {err}");
        }

        let mut state = self.inner.state.lock().await;
        Inner::transition(&mut state, ConnectionState::Disconnected);
        Vec::from(std::mem::take(&mut state.queue))
    }
}

impl Inner {
    fn transition(state: &mut UplinkState, to: ConnectionState) {
        let from = state.connection;
        if from == to {
            return;
        }
        state.connection = to;

        let indicator_on = to == ConnectionState::Connected;
        if let Err(err) = state.indicator.set(indicator_on) {
            warn!("link indicator write failed: {err}");
        }

        match to {
            ConnectionState::Disabled => error!(%from, %to, "uplink disabled until re-initialized"),
            _ => info!(%from, %to, queued = state.queue.len(), "uplink state changed"),
        }
    }

    /// Applies `to` only if the session that asked is still the current one.
    async fn transition_for(&self, generation: u64, to: ConnectionState) -> bool {
        let mut state = self.state.lock().await;
        if state.generation != generation {
            return false;
        }
        Self::transition(&mut state, to);
        true
    }

    fn enqueue(&self, state: &mut UplinkState, message: TelemetryMessage) {
        if state.queue.len() >= self.config.max_queued_messages {
            state.queue.pop_front();
            warn!(
                cap = self.config.max_queued_messages,
                "outbound queue full, dropped oldest message"
            );
        }
        state.queue.push_back(message);
        debug!(queued = state.queue.len(), "telemetry queued");
    }

    async fn send_in_order(&self, message: TelemetryMessage) -> SendOutcome {
        let _send = self.send_lock.lock().await;

        // A backlog goes first; the new message joins its tail.
        let behind_backlog = {
            let mut state = self.state.lock().await;
            if state.connection != ConnectionState::Connected {
                self.enqueue(&mut state, message);
                return SendOutcome::Queued;
            }
            let backlog = !state.queue.is_empty();
            if backlog {
                self.enqueue(&mut state, message.clone());
            }
            backlog
        };

        if behind_backlog {
            self.drain_locked().await;
            return if self.state.lock().await.queue.contains(&message) {
                SendOutcome::Queued
            } else {
                SendOutcome::Sent
            };
        }

        match self.transport.send(&message).await {
            Ok(()) => SendOutcome::Sent,
            Err(err) => {
                warn!("telemetry send failed, queued: {err}");
                let mut state = self.state.lock().await;
                self.enqueue(&mut state, message);
                SendOutcome::Queued
            }
        }
    }

    /// Sends queued messages front to back, stopping at the first failure so
    /// nothing is skipped. Caller holds `send_lock`.
    async fn drain_locked(&self) -> usize {
        let mut sent = 0;
        loop {
            let next = {
                let state = self.state.lock().await;
                if state.connection != ConnectionState::Connected {
                    break;
                }
                state.queue.front().cloned()
            };
            let Some(message) = next else {
                break;
            };

            match within(self.operation_deadline, self.transport.send(&message)).await {
                Ok(()) => {
                    let mut state = self.state.lock().await;
                    if state.queue.front() == Some(&message) {
                        state.queue.pop_front();
                    }
                    sent += 1;
                }
                Err(err) => {
                    warn!(sent, "drain aborted: {err}");
                    break;
                }
            }
        }

        if sent > 0 {
            let remaining = self.state.lock().await.queue.len();
            info!(sent, remaining, "drained queued telemetry");
        }
        sent
    }

    async fn run_session(inner: Arc<Inner>, generation: u64) {
        loop {
            let Some(mut status) = inner.connect_with_backoff(generation).await else {
                return;
            };

            {
                let _send = inner.send_lock.lock().await;
                inner.drain_locked().await;
            }

            let next = loop {
                match status.recv().await {
                    Ok(LinkEvent::Connected) => debug!("transport reports connected"),
                    Ok(LinkEvent::Lost { fatal: true, reason }) => {
                        error!("uplink rejected: {reason}");
                        break ConnectionState::Disabled;
                    }
                    Ok(LinkEvent::Lost { fatal: false, reason }) => {
                        warn!("uplink lost: {reason}");
                        break ConnectionState::Retrying;
                    }
                    Ok(LinkEvent::Closed) | Err(RecvError::Closed) => {
                        break ConnectionState::Disconnected;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "missed transport status events");
                    }
                }
            };

            if !inner.transition_for(generation, next).await || next != ConnectionState::Retrying {
                return;
            }
        }
    }

    /// Connect attempts with exponential backoff. Returns the status receiver
    /// subscribed before the successful attempt, or `None` once the session is
    /// over (fatal rejection, attempts exhausted, superseded).
    async fn connect_with_backoff(
        &self,
        generation: u64,
    ) -> Option<tokio::sync::broadcast::Receiver<LinkEvent>> {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            let status = self.transport.subscribe_status();

            let failure = match within(self.operation_deadline, self.transport.connect()).await {
                Ok(()) => {
                    return self
                        .transition_for(generation, ConnectionState::Connected)
                        .await
                        .then_some(status);
                }
                Err(err) if err.is_fatal() => {
                    error!(attempt, "connect rejected: {err}");
                    self.transition_for(generation, ConnectionState::Disabled).await;
                    return None;
                }
                Err(err) => err,
            };

            if let Some(max) = self.config.max_connect_attempts {
                if attempt >= max {
                    warn!(attempt, "connect attempts exhausted: {failure}");
                    self.transition_for(generation, ConnectionState::Disconnected).await;
                    return None;
                }
            }

            let delay = backoff_delay(&self.config, attempt);
            warn!(attempt, retry_in_secs = delay.as_secs(), "connect failed: {failure}");
            tokio::time::sleep(delay).await;

            if self.state.lock().await.generation != generation {
                return None;
            }
        }
    }
}
