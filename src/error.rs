//! Error types for the DHCP server and the presence engine.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants.

use std::net::Ipv4Addr;

/// Errors that can occur while leasing addresses or tracking peers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config file or discovery datagrams).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed DHCP packet received.
    ///
    /// Packets that are too short, lack the magic cookie or carry no usable
    /// message type. These never leave the packet handler.
    #[error("Invalid DHCP packet: {0}")]
    InvalidPacket(String),

    /// Every address in the pool is leased (or is the server address).
    #[error("No available IP addresses in pool")]
    NoAddressAvailable,

    /// The address is bound by an active lease of a different client.
    #[error("Address {0} is leased to another client")]
    AddressInUse(Ipv4Addr),

    /// The address is not a usable host address of the configured network.
    #[error("Address {0} is outside the configured network")]
    AddressOutOfRange(Ipv4Addr),

    /// Invalid server configuration.
    ///
    /// Returned by `configure` and [`Config::validate`](crate::Config::validate),
    /// e.g. when the server address lies outside the network.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Socket creation or configuration error.
    ///
    /// Typically occurs when binding to port 67 without administrator privileges
    /// or when the port is already taken.
    #[error("Socket error: {0}")]
    Socket(String),

    /// The discovery transport failed to announce, browse or close.
    #[error("Discovery transport error: {0}")]
    Transport(String),

    /// `start` was called on a component that is already running.
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    /// `start` was called after `stop` released the component's resources.
    #[error("{0} was stopped and cannot be restarted")]
    Stopped(&'static str),
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
