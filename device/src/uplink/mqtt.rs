use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex, MutexGuard, PoisonError, RwLock,
    },
    time::Duration,
};

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming, MqttOptions,
    Outgoing, QoS,
};
use tokio::sync::{broadcast, broadcast::error::RecvError, oneshot, Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use thermolink_common::{
    commands::{STATUS_BAD_REQUEST, STATUS_UNAVAILABLE},
    method_response_topic, parse_method_topic, telemetry_topic, CommandReply, ConnectionConfig,
    TelemetryMessage, TOPIC_METHODS_FILTER,
};

use super::transport::{CommandHandler, LinkEvent, Transport, TransportError};

const MAX_METHOD_PAYLOAD_BYTES: usize = 64 * 1024;
const REQUEST_CHANNEL_CAPACITY: usize = 64;

type AckSender = oneshot::Sender<Result<(), TransportError>>;

/// Matches QoS 1 publishes to their PUBACK. The client only reports the packet
/// id once the request leaves the event loop, so senders wait in FIFO order
/// until their id is known.
#[derive(Default)]
struct AckTracker {
    awaiting_id: VecDeque<AckSender>,
    in_flight: HashMap<u16, AckSender>,
}

impl AckTracker {
    fn register(&mut self, sender: AckSender) {
        self.awaiting_id.push_back(sender);
    }

    fn assign(&mut self, pkid: u16) {
        while let Some(sender) = self.awaiting_id.pop_front() {
            // Receivers dropped by a deadline no longer care.
            if !sender.is_closed() {
                self.in_flight.insert(pkid, sender);
                return;
            }
        }
    }

    fn acknowledge(&mut self, pkid: u16) {
        if let Some(sender) = self.in_flight.remove(&pkid) {
            let _ = sender.send(Ok(()));
        }
    }

    fn fail_all(&mut self, reason: &str) {
        let pending = self
            .awaiting_id
            .drain(..)
            .chain(self.in_flight.drain().map(|(_, sender)| sender));
        for sender in pending {
            let _ = sender.send(Err(TransportError::Transient(reason.to_string())));
        }
    }
}

/// State shared between the transport handle and its poll task.
#[derive(Clone)]
struct Link {
    client: AsyncClient,
    status: broadcast::Sender<LinkEvent>,
    handler: Arc<RwLock<Option<Arc<dyn CommandHandler>>>>,
    acks: Arc<StdMutex<AckTracker>>,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
}

impl Link {
    fn acks(&self) -> MutexGuard<'_, AckTracker> {
        self.acks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handler(&self) -> Option<Arc<dyn CommandHandler>> {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn dispatch_method(&self, topic: &str, payload: Vec<u8>) {
        let Some(request) = parse_method_topic(topic) else {
            debug!("ignoring publish on {topic}");
            return;
        };

        let handler = self.handler();
        let client = self.client.clone();
        tokio::spawn(async move {
            let reply = if payload.len() > MAX_METHOD_PAYLOAD_BYTES {
                warn!(
                    "rejecting oversized payload for {} ({} bytes)",
                    request.name,
                    payload.len()
                );
                CommandReply::error(STATUS_BAD_REQUEST, "payload too large")
            } else {
                match handler {
                    Some(handler) => handler.handle(&request.name, &payload).await,
                    None => CommandReply::error(STATUS_UNAVAILABLE, "device is not ready"),
                }
            };

            let body = match serde_json::to_vec(&reply.payload) {
                Ok(body) => body,
                Err(err) => {
                    warn!("method reply serialization failed: {err}");
                    return;
                }
            };
            let topic = method_response_topic(reply.status, &request.request_id);
            if let Err(err) = client.publish(topic, QoS::AtMostOnce, false, body).await {
                warn!("method reply publish failed: {err}");
            }
        });
    }
}

pub struct MqttTransport {
    link: Link,
    eventloop: Arc<Mutex<EventLoop>>,
    telemetry_topic: String,
}

impl MqttTransport {
    pub fn new(connection: &ConnectionConfig, test_device: bool) -> Self {
        let mut options = MqttOptions::new(
            connection.device_id.clone(),
            connection.host.clone(),
            connection.port,
        );
        options.set_keep_alive(Duration::from_secs(connection.keep_alive_seconds));
        options.set_clean_session(true);
        if !connection.username.is_empty() {
            options.set_credentials(connection.username.clone(), connection.secret.clone());
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let (status, _) = broadcast::channel(32);

        Self {
            link: Link {
                client,
                status,
                handler: Arc::new(RwLock::new(None)),
                acks: Arc::new(StdMutex::new(AckTracker::default())),
                connected: Arc::new(AtomicBool::new(false)),
                closing: Arc::new(AtomicBool::new(false)),
            },
            eventloop: Arc::new(Mutex::new(eventloop)),
            telemetry_topic: telemetry_topic(&connection.device_id, test_device),
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut status = self.link.status.subscribe();

        match self.eventloop.clone().try_lock_owned() {
            Ok(eventloop) => {
                self.link.closing.store(false, Ordering::Relaxed);
                tokio::spawn(poll_loop(eventloop, self.link.clone()));
            }
            // A poll task from an earlier attempt is still running.
            Err(_) if self.link.connected.load(Ordering::Relaxed) => return Ok(()),
            Err(_) => {}
        }

        loop {
            match status.recv().await {
                Ok(LinkEvent::Connected) => return Ok(()),
                Ok(LinkEvent::Lost { fatal: true, reason }) => return Err(TransportError::Fatal(reason)),
                Ok(LinkEvent::Lost { reason, .. }) => return Err(TransportError::Transient(reason)),
                Ok(LinkEvent::Closed) | Err(RecvError::Closed) => {
                    return Err(TransportError::Transient("closed while connecting".into()))
                }
                Err(RecvError::Lagged(_)) => {}
            }
        }
    }

    async fn send(&self, message: &TelemetryMessage) -> Result<(), TransportError> {
        let body = serde_json::to_vec(message)
            .map_err(|err| TransportError::Transient(format!("serialization failed: {err}")))?;

        let (sender, receiver) = oneshot::channel();
        self.link.acks().register(sender);
        self.link
            .client
            .publish(self.telemetry_topic.clone(), QoS::AtLeastOnce, false, body)
            .await
            .map_err(|err| TransportError::Transient(err.to_string()))?;

        receiver.await.map_err(|_| {
            TransportError::Transient("link dropped before acknowledgement".into())
        })?
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.link.closing.store(true, Ordering::Relaxed);
        if self.eventloop.try_lock().is_ok() {
            // No poll task, nothing to tear down.
            return Ok(());
        }
        self.link
            .client
            .disconnect()
            .await
            .map_err(|err| TransportError::Transient(err.to_string()))
    }

    fn set_command_handler(&self, handler: Arc<dyn CommandHandler>) {
        *self
            .link
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    fn subscribe_status(&self) -> broadcast::Receiver<LinkEvent> {
        self.link.status.subscribe()
    }
}

/// Drives the client until the connection drops, then releases the event
/// loop so the next `connect()` can resume it.
async fn poll_loop(mut eventloop: OwnedMutexGuard<EventLoop>, link: Link) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    continue;
                }
                if let Err(err) = link.client.try_subscribe(TOPIC_METHODS_FILTER, QoS::AtMostOnce) {
                    warn!("method subscription failed: {err}");
                }
                link.connected.store(true, Ordering::Relaxed);
                info!("mqtt connected");
                let _ = link.status.send(LinkEvent::Connected);
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                link.dispatch_method(&publish.topic, publish.payload.to_vec());
            }
            Ok(Event::Incoming(Incoming::PubAck(ack))) => link.acks().acknowledge(ack.pkid),
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) if pkid != 0 => link.acks().assign(pkid),
            Ok(Event::Outgoing(Outgoing::Disconnect)) if link.closing.load(Ordering::Relaxed) => {
                link.connected.store(false, Ordering::Relaxed);
                link.acks().fail_all("disconnected");
                info!("mqtt disconnected");
                let _ = link.status.send(LinkEvent::Closed);
                return;
            }
            Ok(_) => {}
            Err(err) => {
                link.connected.store(false, Ordering::Relaxed);
                let reason = err.to_string();
                link.acks().fail_all(&reason);

                let event = if link.closing.load(Ordering::Relaxed) {
                    LinkEvent::Closed
                } else if is_fatal(&err) {
                    error!("mqtt connection refused: {reason}");
                    LinkEvent::Lost {
                        fatal: true,
                        reason,
                    }
                } else {
                    warn!("mqtt poll error: {reason}");
                    LinkEvent::Lost {
                        fatal: false,
                        reason,
                    }
                };
                let _ = link.status.send(event);
                return;
            }
        }
    }
}

/// Credential and authorization refusals need an operator; everything else
/// is worth retrying.
fn is_fatal(err: &ConnectionError) -> bool {
    matches!(
        err,
        ConnectionError::ConnectionRefused(
            ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized
        )
    )
}
