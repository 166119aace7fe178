use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{DhcpServerConfig, Ipv4Network};
use crate::error::{Error, Result};
use crate::lease::{Lease, LeaseTable};
use crate::options::MessageType;
use crate::packet::{
    MacAddress, decode_client_mac, decode_hostname, decode_message_type, decode_requested_address,
    decode_server_identifier, encode_response, validate_request,
};

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;
const RECV_BUFFER_SIZE: usize = 1500;

/// Upper bound on packets being handled at once.
///
/// When every permit is taken the receive loop stops reading and the kernel
/// socket buffer absorbs or drops the excess.
const MAX_IN_FLIGHT_PACKETS: usize = 64;

/// Creates a non-blocking UDP socket with SO_REUSEADDR and SO_BROADCAST set.
pub fn bind_broadcast_socket(bind_addr: SocketAddrV4) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

    socket
        .set_reuse_address(true)
        .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

    socket
        .set_broadcast(true)
        .map_err(|error| Error::Socket(format!("Failed to set SO_BROADCAST: {}", error)))?;

    socket
        .set_nonblocking(true)
        .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

    socket
        .bind(&bind_addr.into())
        .map_err(|error| Error::Socket(format!("Failed to bind to {}: {}", bind_addr, error)))?;

    let std_socket: std::net::UdpSocket = socket.into();
    let tokio_socket = UdpSocket::from_std(std_socket)
        .map_err(|error| Error::Socket(format!("Failed to convert to tokio socket: {}", error)))?;

    Ok(tokio_socket)
}

/// Produces the socket the DHCP engine listens on.
///
/// Called from within the Tokio runtime when the engine starts.
pub trait SocketFactory: Send + Sync {
    fn create(&self) -> Result<UdpSocket>;
}

/// Binds a broadcast-capable socket, by default on `0.0.0.0:67`.
#[derive(Debug, Clone)]
pub struct BroadcastSocketFactory {
    bind_addr: SocketAddrV4,
}

impl BroadcastSocketFactory {
    pub fn new(bind_addr: SocketAddrV4) -> Self {
        Self { bind_addr }
    }
}

impl Default for BroadcastSocketFactory {
    fn default() -> Self {
        Self::new(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DHCP_SERVER_PORT))
    }
}

impl SocketFactory for BroadcastSocketFactory {
    fn create(&self) -> Result<UdpSocket> {
        bind_broadcast_socket(self.bind_addr)
    }
}

struct RunningEngine {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// DHCP server answering DISCOVER, REQUEST and RELEASE.
///
/// ```no_run
/// use ztalk_net::{DhcpEngine, DhcpServerConfig};
///
/// # async fn example() -> ztalk_net::Result<()> {
/// let mut engine = DhcpEngine::new(DhcpServerConfig::default())?;
/// engine.configure("10.0.0.0/24".parse()?, None, None, None)?;
/// engine.start().await?;
/// // ...
/// engine.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct DhcpEngine {
    config: Arc<DhcpServerConfig>,
    leases: Arc<LeaseTable>,
    socket_factory: Arc<dyn SocketFactory>,
    reply_target: SocketAddr,
    running: Mutex<Option<RunningEngine>>,
}

impl DhcpEngine {
    pub fn new(config: DhcpServerConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let leases = Arc::new(LeaseTable::new(Arc::clone(&config)));

        Ok(Self {
            config,
            leases,
            socket_factory: Arc::new(BroadcastSocketFactory::default()),
            reply_target: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT)),
            running: Mutex::new(None),
        })
    }

    pub fn with_socket_factory(mut self, factory: impl SocketFactory + 'static) -> Self {
        self.socket_factory = Arc::new(factory);
        self
    }

    /// Sends replies to `target` instead of `255.255.255.255:68`.
    pub fn with_reply_target(mut self, target: SocketAddr) -> Self {
        self.reply_target = target;
        self
    }

    /// Replaces the served network. Existing leases are dropped.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfig`] if the server address is outside `network`
    ///   or the network leaves no pool; nothing is changed
    /// - [`Error::AlreadyRunning`] while the engine is started
    pub fn configure(
        &mut self,
        network: Ipv4Network,
        server_ip: Option<Ipv4Addr>,
        dns_servers: Option<Vec<Ipv4Addr>>,
        domain_name: Option<String>,
    ) -> Result<()> {
        if self.running.get_mut().is_some() {
            return Err(Error::AlreadyRunning("DHCP engine"));
        }

        let config = DhcpServerConfig {
            lease_duration_seconds: self.config.lease_duration_seconds,
            pool_offset: self.config.pool_offset,
            ..DhcpServerConfig::for_network(network, server_ip, dns_servers, domain_name)?
        };
        config.validate()?;

        let config = Arc::new(config);
        self.leases = Arc::new(LeaseTable::new(Arc::clone(&config)));
        self.config = config;
        Ok(())
    }

    pub fn config(&self) -> &DhcpServerConfig {
        &self.config
    }

    /// Binds the socket and spawns the receive loop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Socket`] if the socket cannot be created or bound,
    /// and [`Error::AlreadyRunning`] if the engine is already started.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(Error::AlreadyRunning("DHCP engine"));
        }

        let socket = Arc::new(self.socket_factory.create()?);
        let local_addr = socket.local_addr()?;

        info!("DHCP server listening on {}", local_addr);
        info!(
            "Serving {} from {}: pool {} - {} ({} addresses)",
            self.config.network,
            self.config.server_ip,
            self.config.pool_start(),
            self.config.pool_end(),
            self.config.pool_size()
        );

        let handler = Arc::new(PacketHandler {
            config: Arc::clone(&self.config),
            leases: Arc::clone(&self.leases),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(receive_loop(
            socket,
            handler,
            self.reply_target,
            shutdown_rx,
        ));

        *running = Some(RunningEngine {
            shutdown,
            task,
            local_addr,
        });

        Ok(())
    }

    /// Stops reading, waits for in-flight packets and closes the socket.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        let _ = running.shutdown.send(true);
        if let Err(error) = running.task.await {
            error!("DHCP receive loop failed: {}", error);
        }
        info!("DHCP server stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Address of the bound socket while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|running| running.local_addr)
    }

    /// Snapshot of active leases. Expired leases are swept first.
    pub async fn get_leases(&self) -> HashMap<MacAddress, Lease> {
        self.leases.leases().await
    }

    pub async fn free_address_count(&self) -> usize {
        self.leases.free_address_count().await
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    handler: Arc<PacketHandler>,
    reply_target: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    let permits = Arc::new(Semaphore::new(MAX_IN_FLIGHT_PACKETS));
    let mut buffer = [0u8; RECV_BUFFER_SIZE];

    loop {
        let permit = tokio::select! {
            _ = shutdown.changed() => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let received = tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buffer) => received,
        };

        match received {
            Ok((size, source)) => {
                let data = buffer[..size].to_vec();
                let handler = Arc::clone(&handler);
                let socket = Arc::clone(&socket);

                tokio::spawn(async move {
                    if let Some(reply) = handler.handle_packet(&data, source).await
                        && let Err(error) = socket.send_to(&reply, reply_target).await
                    {
                        warn!("Failed to send reply to {}: {}", reply_target, error);
                    }
                    drop(permit);
                });
            }
            Err(error) => {
                error!("Error receiving packet: {}", error);
            }
        }
    }

    if permits
        .acquire_many(MAX_IN_FLIGHT_PACKETS as u32)
        .await
        .is_err()
    {
        warn!("Could not wait for in-flight DHCP packets");
    }
    debug!("DHCP receive loop exited");
}

/// Per-packet state machine. Holds no state of its own beyond the lease table.
struct PacketHandler {
    config: Arc<DhcpServerConfig>,
    leases: Arc<LeaseTable>,
}

impl PacketHandler {
    /// Returns the encoded reply, if the packet calls for one.
    async fn handle_packet(&self, data: &[u8], source: SocketAddr) -> Option<Vec<u8>> {
        if let Err(error) = validate_request(data) {
            debug!("Dropping packet from {}: {}", source, error);
            return None;
        }

        let mac = decode_client_mac(data)?;

        let Some(raw_type) = decode_message_type(data) else {
            debug!("Dropping packet from {} ({}): no message type", mac, source);
            return None;
        };

        let message_type = match MessageType::try_from(raw_type) {
            Ok(message_type) => message_type,
            Err(value) => {
                debug!("Dropping unknown message type {} from {}", value, mac);
                return None;
            }
        };

        debug!("{} from {} ({})", message_type, mac, source);

        match message_type {
            MessageType::Discover => self.handle_discover(data, mac).await,
            MessageType::Request => self.handle_request(data, mac).await,
            MessageType::Release => {
                self.handle_release(mac).await;
                None
            }
            other => {
                debug!("Ignoring {} message from {}", other, mac);
                None
            }
        }
    }

    async fn handle_discover(&self, data: &[u8], mac: MacAddress) -> Option<Vec<u8>> {
        let preferred = decode_requested_address(data);

        match self.leases.allocate(mac, preferred).await {
            Ok(offered_ip) => {
                info!("OFFER {} to {}", offered_ip, mac);
                Some(encode_response(
                    data,
                    MessageType::Offer,
                    Some(offered_ip),
                    &self.config,
                ))
            }
            Err(Error::NoAddressAvailable) => {
                warn!("Pool exhausted, cannot offer IP to {}", mac);
                None
            }
            Err(error) => {
                warn!("Cannot offer IP to {}: {}", mac, error);
                None
            }
        }
    }

    async fn handle_request(&self, data: &[u8], mac: MacAddress) -> Option<Vec<u8>> {
        if let Some(server_id) = decode_server_identifier(data)
            && server_id != self.config.server_ip
        {
            debug!("REQUEST from {} is for different server {}", mac, server_id);
            return None;
        }

        let Some(requested_ip) = decode_requested_address(data) else {
            return Some(self.nak(data, mac, "no requested address"));
        };

        if !self.config.network.is_host_address(requested_ip) {
            return Some(self.nak(data, mac, &format!("{} is not in the served network", requested_ip)));
        }

        if self.leases.is_reserved_by_other(mac, requested_ip).await {
            return Some(self.nak(data, mac, &format!("{} is leased to another client", requested_ip)));
        }

        let hostname = decode_hostname(data);
        match self.leases.confirm(mac, requested_ip, hostname).await {
            Ok(lease) => {
                info!(
                    "ACK {} to {} (lease: {} seconds)",
                    requested_ip,
                    mac,
                    lease.remaining_seconds()
                );
                Some(encode_response(
                    data,
                    MessageType::Ack,
                    Some(requested_ip),
                    &self.config,
                ))
            }
            Err(error @ (Error::AddressInUse(_) | Error::AddressOutOfRange(_))) => {
                Some(self.nak(data, mac, &error.to_string()))
            }
            Err(error) => {
                warn!("Cannot lease {} to {}: {}", requested_ip, mac, error);
                None
            }
        }
    }

    async fn handle_release(&self, mac: MacAddress) {
        match self.leases.release(mac).await {
            Some(lease) => info!("RELEASE {} from {}", lease.ip_address, mac),
            None => debug!("RELEASE from {} without a lease", mac),
        }
    }

    fn nak(&self, data: &[u8], mac: MacAddress, reason: &str) -> Vec<u8> {
        warn!("NAK to {}: {}", mac, reason);
        encode_response(data, MessageType::Nak, None, &self.config)
    }
}
