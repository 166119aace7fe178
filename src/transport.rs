//! UDP broadcast discovery transport.
//!
//! Fallback for hosts without a zeroconf stack. Every datagram is the magic
//! `ZTLK` followed by a JSON [`TransportMessage`]. Announcements are repeated
//! on an interval so that listeners keep refreshing the peer's `last_seen`.

use std::collections::{BTreeMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::presence::{DiscoveryEvent, DiscoveryTransport, ServiceRecord};
use crate::server::bind_broadcast_socket;

pub const DISCOVERY_MAGIC: &[u8; 4] = b"ZTLK";
pub const MAX_DATAGRAM_SIZE: usize = 1400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Query,
    Announce,
    Withdraw,
}

/// One discovery datagram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportMessage {
    /// Id of the sending transport, used to drop our own broadcasts.
    pub sender: String,
    pub kind: MessageKind,
    pub service_type: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default = "unspecified_address")]
    pub address: Ipv4Addr,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

fn unspecified_address() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

impl TransportMessage {
    pub fn query(sender: &str, service_type: &str) -> Self {
        Self {
            sender: sender.to_string(),
            kind: MessageKind::Query,
            service_type: service_type.to_string(),
            service_name: String::new(),
            address: Ipv4Addr::UNSPECIFIED,
            port: 0,
            properties: BTreeMap::new(),
        }
    }

    pub fn announce(sender: &str, record: &ServiceRecord) -> Self {
        Self {
            sender: sender.to_string(),
            kind: MessageKind::Announce,
            service_type: record.service_type.clone(),
            service_name: record.service_name.clone(),
            address: record.address,
            port: record.port,
            properties: record.properties.clone(),
        }
    }

    pub fn withdraw(sender: &str, service_type: &str, service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            kind: MessageKind::Withdraw,
            ..Self::query(sender, service_type)
        }
    }

    pub fn into_record(self) -> ServiceRecord {
        ServiceRecord {
            service_type: self.service_type,
            service_name: self.service_name,
            address: self.address,
            port: self.port,
            properties: self.properties,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let mut bytes = Vec::with_capacity(DISCOVERY_MAGIC.len() + json.len());
        bytes.extend_from_slice(DISCOVERY_MAGIC);
        bytes.extend(json);
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let json = bytes
            .strip_prefix(DISCOVERY_MAGIC.as_slice())
            .ok_or_else(|| Error::InvalidPacket("Missing discovery magic".to_string()))?;
        Ok(serde_json::from_slice(json)?)
    }
}

#[derive(Default)]
struct TransportState {
    announcement: Option<ServiceRecord>,
    browse: Option<(String, mpsc::Sender<DiscoveryEvent>)>,
    /// Service names already reported as `Added`.
    known: HashSet<String>,
}

struct Endpoint {
    sender_id: String,
    socket: UdpSocket,
    broadcast_target: SocketAddr,
    state: Mutex<TransportState>,
}

impl Endpoint {
    async fn send(&self, message: &TransportMessage, target: SocketAddr) -> Result<()> {
        let bytes = message.to_bytes()?;
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(Error::Transport(format!(
                "Discovery datagram of {} bytes exceeds {}",
                bytes.len(),
                MAX_DATAGRAM_SIZE
            )));
        }

        let sent = self
            .socket
            .send_to(&bytes, target)
            .await
            .map_err(|error| Error::Transport(format!("Failed to send to {}: {}", target, error)))?;
        trace!("Sent {:?} datagram ({} bytes) to {}", message.kind, sent, target);
        Ok(())
    }

    async fn broadcast(&self, message: &TransportMessage) -> Result<()> {
        self.send(message, self.broadcast_target).await
    }

    async fn handle_datagram(&self, bytes: &[u8], source: SocketAddr) {
        let message = match TransportMessage::from_bytes(bytes) {
            Ok(message) => message,
            Err(error) => {
                debug!("Dropping discovery datagram from {} ({} bytes): {}", source, bytes.len(), error);
                return;
            }
        };

        if message.sender == self.sender_id {
            trace!("Ignoring own discovery datagram");
            return;
        }

        match message.kind {
            MessageKind::Query => self.answer_query(&message, source).await,
            MessageKind::Announce | MessageKind::Withdraw => self.deliver(message).await,
        }
    }

    async fn answer_query(&self, query: &TransportMessage, source: SocketAddr) {
        let reply = {
            let state = self.state.lock().await;
            match &state.announcement {
                Some(record) if record.service_type == query.service_type => {
                    TransportMessage::announce(&self.sender_id, record)
                }
                _ => return,
            }
        };

        debug!("Answering discovery query from {} with {}", source, reply.service_name);
        if let Err(error) = self.send(&reply, source).await {
            warn!("Failed to answer discovery query: {}", error);
        }
    }

    async fn deliver(&self, message: TransportMessage) {
        let (sink, event) = {
            let mut state = self.state.lock().await;
            let Some((service_type, sink)) = &state.browse else {
                return;
            };
            if *service_type != message.service_type {
                return;
            }
            let sink = sink.clone();

            let event = match message.kind {
                MessageKind::Announce => {
                    if state.known.insert(message.service_name.clone()) {
                        DiscoveryEvent::Added(message.into_record())
                    } else {
                        DiscoveryEvent::Updated(message.into_record())
                    }
                }
                _ => {
                    if !state.known.remove(&message.service_name) {
                        return;
                    }
                    DiscoveryEvent::Removed {
                        service_type: message.service_type,
                        service_name: message.service_name,
                    }
                }
            };
            (sink, event)
        };

        if sink.send(event).await.is_err() {
            debug!("Discovery event receiver dropped");
        }
    }
}

/// [`DiscoveryTransport`] over UDP broadcast.
pub struct UdpBroadcastTransport {
    endpoint: Arc<Endpoint>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpBroadcastTransport {
    /// Binds `0.0.0.0:<port>` with broadcast and reuse-address set.
    pub async fn bind(config: TransportConfig) -> Result<Self> {
        let socket = bind_broadcast_socket(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port))?;
        let target = SocketAddr::V4(SocketAddrV4::new(config.broadcast_address, config.port));
        info!("Discovery transport on port {}, broadcasting to {}", config.port, target);
        Ok(Self::with_socket(socket, target, config.announce_interval()))
    }

    /// Runs the transport on an already bound socket.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_socket(socket: UdpSocket, broadcast_target: SocketAddr, announce_interval: Duration) -> Self {
        let endpoint = Arc::new(Endpoint {
            sender_id: Uuid::new_v4().to_string(),
            socket,
            broadcast_target,
            state: Mutex::new(TransportState::default()),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);

        let receiver = tokio::spawn(receive_loop(Arc::clone(&endpoint), shutdown_rx.clone()));
        let announcer = tokio::spawn(announce_loop(Arc::clone(&endpoint), announce_interval, shutdown_rx));

        Self {
            endpoint,
            shutdown,
            tasks: Mutex::new(vec![receiver, announcer]),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.socket.local_addr()?)
    }
}

async fn receive_loop(endpoint: Arc<Endpoint>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            result = endpoint.socket.recv_from(&mut buf) => match result {
                Ok((len, source)) => endpoint.handle_datagram(&buf[..len], source).await,
                Err(error) => error!("Error receiving discovery datagram: {}", error),
            },
        }
    }
    debug!("Discovery listener shutting down");
}

async fn announce_loop(endpoint: Arc<Endpoint>, period: Duration, mut shutdown_rx: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = interval.tick() => {
                let message = endpoint
                    .state
                    .lock()
                    .await
                    .announcement
                    .as_ref()
                    .map(|record| TransportMessage::announce(&endpoint.sender_id, record));

                if let Some(message) = message
                    && let Err(error) = endpoint.broadcast(&message).await
                {
                    warn!("Failed to re-announce: {}", error);
                }
            }
        }
    }
    debug!("Discovery announcer shutting down");
}

#[async_trait]
impl DiscoveryTransport for UdpBroadcastTransport {
    async fn announce(&self, record: &ServiceRecord) -> Result<()> {
        self.endpoint.state.lock().await.announcement = Some(record.clone());
        self.endpoint
            .broadcast(&TransportMessage::announce(&self.endpoint.sender_id, record))
            .await
    }

    async fn unannounce(&self, service_name: &str) -> Result<()> {
        let withdrawn = {
            let mut state = self.endpoint.state.lock().await;
            match &state.announcement {
                Some(record) if record.service_name == service_name => state.announcement.take(),
                _ => None,
            }
        };

        match withdrawn {
            Some(record) => {
                self.endpoint
                    .broadcast(&TransportMessage::withdraw(
                        &self.endpoint.sender_id,
                        &record.service_type,
                        &record.service_name,
                    ))
                    .await
            }
            None => Ok(()),
        }
    }

    async fn browse(&self, service_type: &str, events: mpsc::Sender<DiscoveryEvent>) -> Result<()> {
        {
            let mut state = self.endpoint.state.lock().await;
            state.browse = Some((service_type.to_string(), events));
            state.known.clear();
        }
        self.endpoint
            .broadcast(&TransportMessage::query(&self.endpoint.sender_id, service_type))
            .await
    }

    async fn close(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(error) = task.await {
                warn!("Discovery task failed: {}", error);
            }
        }

        let mut state = self.endpoint.state.lock().await;
        state.announcement = None;
        state.browse = None;
        state.known.clear();
        info!("Discovery transport closed");
        Ok(())
    }
}
