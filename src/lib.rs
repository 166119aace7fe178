//! # ztalk-net
//!
//! Network bootstrap and peer presence for ZTalk nodes on a shared LAN.
//!
//! ## Features
//!
//! - Minimal DHCP server (RFC 2131/2132): DISCOVER, OFFER, REQUEST, ACK, NAK, RELEASE
//! - Lease table with pending offers, renewal and lazy expiry
//! - Peer registry with Added/Updated/Removed/TimedOut events
//! - Presence announcer over a pluggable discovery transport
//! - UDP broadcast fallback transport
//! - Async/await with Tokio
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use ztalk_net::{
//!     Config, DhcpEngine, PresenceAnnouncer, StaticInterfaceProvider, UdpBroadcastTransport,
//! };
//!
//! #[tokio::main]
//! async fn main() -> ztalk_net::Result<()> {
//!     let config = Config::load_or_create("ztalk-net.json")?;
//!
//!     let engine = DhcpEngine::new(config.dhcp.clone())?;
//!     engine.start().await?;
//!
//!     let transport = Arc::new(UdpBroadcastTransport::bind(config.transport.clone()).await?);
//!     let interfaces = Arc::new(StaticInterfaceProvider::new(vec![config.dhcp.server_ip]));
//!     let presence = PresenceAnnouncer::new(config.presence.clone(), transport, interfaces);
//!     presence.start().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     presence.stop().await;
//!     engine.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`Config`] - JSON configuration for every component
//! - [`DhcpEngine`] - DHCP server listening on UDP port 67
//! - [`LeaseTable`] - Address pool, leases and pending offers
//! - [`packet`] - DHCP wire decoding and [`PacketWriter`]-based encoding
//! - [`PeerRegistry`] - Known peers and their liveness
//! - [`PresenceAnnouncer`] - Announces this node and feeds the registry
//! - [`UdpBroadcastTransport`] - Broadcast [`DiscoveryTransport`]

pub mod config;
pub mod error;
pub mod lease;
pub mod options;
pub mod packet;
pub mod peer;
pub mod presence;
pub mod server;
pub mod transport;

pub use config::{Config, DhcpServerConfig, Ipv4Network, PresenceConfig, TransportConfig};
pub use error::{Error, Result};
pub use lease::{Lease, LeaseTable};
pub use options::{DhcpOption, MessageType};
pub use packet::{MacAddress, PacketWriter};
pub use peer::{Peer, PeerEvent, PeerRegistry};
pub use presence::{
    DiscoveryEvent, DiscoveryTransport, ListenerId, NetworkInterfaceProvider, PeerListener,
    PresenceAnnouncer, ServiceRecord, StaticInterfaceProvider,
};
pub use server::{BroadcastSocketFactory, DhcpEngine, SocketFactory};
pub use transport::UdpBroadcastTransport;
