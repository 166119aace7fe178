use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::options::MAX_ADDRESSES_PER_OPTION;

/// An IPv4 network in CIDR notation, e.g. `10.0.0.0/24`.
///
/// Host bits must be zero: `10.0.0.5/24` is rejected rather than silently
/// truncated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Network {
    base: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Network {
    pub fn new(base: Ipv4Addr, prefix_len: u8) -> Result<Self> {
        if prefix_len > 32 {
            return Err(Error::InvalidConfig(format!(
                "prefix length {} exceeds 32",
                prefix_len
            )));
        }

        let mask = Self::mask_for(prefix_len);
        if u32::from(base) & !mask != 0 {
            return Err(Error::InvalidConfig(format!(
                "{}/{} has host bits set",
                base, prefix_len
            )));
        }

        Ok(Self { base, prefix_len })
    }

    fn mask_for(prefix_len: u8) -> u32 {
        u32::MAX.checked_shl(32 - prefix_len as u32).unwrap_or(0)
    }

    pub fn network_address(&self) -> Ipv4Addr {
        self.base
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(Self::mask_for(self.prefix_len))
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.base) | !Self::mask_for(self.prefix_len))
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = Self::mask_for(self.prefix_len);
        u32::from(ip) & mask == u32::from(self.base)
    }

    /// True for addresses inside the network that are neither the network
    /// address nor the broadcast address.
    pub fn is_host_address(&self, ip: Ipv4Addr) -> bool {
        self.contains(ip) && ip != self.base && ip != self.broadcast()
    }
}

impl fmt::Display for Ipv4Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.prefix_len)
    }
}

impl FromStr for Ipv4Network {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        let (address, prefix) = match value.split_once('/') {
            Some((address, prefix)) => (address, prefix),
            None => (value, "32"),
        };

        let base = address
            .trim()
            .parse::<Ipv4Addr>()
            .map_err(|error| Error::InvalidConfig(format!("invalid network {}: {}", value, error)))?;
        let prefix_len = prefix
            .trim()
            .parse::<u8>()
            .map_err(|error| Error::InvalidConfig(format!("invalid prefix in {}: {}", value, error)))?;

        Self::new(base, prefix_len)
    }
}

impl TryFrom<String> for Ipv4Network {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Ipv4Network> for String {
    fn from(network: Ipv4Network) -> Self {
        network.to_string()
    }
}

/// DHCP server settings: which network is handed out and what clients are told.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhcpServerConfig {
    pub network: Ipv4Network,
    pub server_ip: Ipv4Addr,
    /// Default gateway handed to clients. `None` means the server itself.
    pub router: Option<Ipv4Addr>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub domain_name: Option<String>,
    pub lease_duration_seconds: u32,
    /// Number of low host addresses kept out of the pool for static assignment.
    pub pool_offset: u32,
}

impl Default for DhcpServerConfig {
    fn default() -> Self {
        let network = Ipv4Network {
            base: Ipv4Addr::new(192, 168, 100, 0),
            prefix_len: 24,
        };
        Self {
            network,
            server_ip: Ipv4Addr::new(192, 168, 100, 1),
            router: None,
            dns_servers: vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)],
            domain_name: Some("ztalk.local".to_string()),
            lease_duration_seconds: 86400,
            pool_offset: 10,
        }
    }
}

impl DhcpServerConfig {
    /// Builds a validated configuration for `network`.
    ///
    /// The server address defaults to the first host of the network. DNS
    /// servers and domain keep their defaults unless given.
    pub fn for_network(
        network: Ipv4Network,
        server_ip: Option<Ipv4Addr>,
        dns_servers: Option<Vec<Ipv4Addr>>,
        domain_name: Option<String>,
    ) -> Result<Self> {
        let defaults = Self::default();
        let server_ip = server_ip
            .unwrap_or_else(|| Ipv4Addr::from(u32::from(network.network_address()).wrapping_add(1)));

        let config = Self {
            network,
            server_ip,
            router: None,
            dns_servers: dns_servers.unwrap_or(defaults.dns_servers),
            domain_name: domain_name.or(defaults.domain_name),
            ..defaults
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.network.is_host_address(self.server_ip) {
            return Err(Error::InvalidConfig(format!(
                "server_ip {} is not in network {}",
                self.server_ip, self.network
            )));
        }

        if let Some(router) = self.router
            && !self.network.contains(router)
        {
            return Err(Error::InvalidConfig(format!(
                "router {} is not in network {}",
                router, self.network
            )));
        }

        if self.lease_duration_seconds == 0 {
            return Err(Error::InvalidConfig(
                "lease_duration_seconds must be greater than 0".to_string(),
            ));
        }

        if self.pool_start() > self.pool_end() {
            return Err(Error::InvalidConfig(format!(
                "network {} leaves no pool after skipping {} addresses",
                self.network, self.pool_offset
            )));
        }

        if self.dns_servers.len() > MAX_ADDRESSES_PER_OPTION {
            return Err(Error::InvalidConfig(format!(
                "at most {} dns_servers fit in option 6, got {}",
                MAX_ADDRESSES_PER_OPTION,
                self.dns_servers.len()
            )));
        }

        if let Some(ref domain) = self.domain_name
            && (!domain.is_ascii() || domain.len() > 255)
        {
            return Err(Error::InvalidConfig(
                "domain_name must be ASCII and at most 255 bytes".to_string(),
            ));
        }

        Ok(())
    }

    pub fn subnet_mask(&self) -> Ipv4Addr {
        self.network.netmask()
    }

    pub fn router_address(&self) -> Ipv4Addr {
        self.router.unwrap_or(self.server_ip)
    }

    pub fn pool_start(&self) -> Ipv4Addr {
        let base = u64::from(u32::from(self.network.network_address()));
        let start = base + u64::from(self.pool_offset) + 1;
        Ipv4Addr::from(start.min(u64::from(u32::MAX)) as u32)
    }

    pub fn pool_end(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network.broadcast()).saturating_sub(1))
    }

    pub fn ip_in_pool(&self, ip: Ipv4Addr) -> bool {
        ip >= self.pool_start() && ip <= self.pool_end()
    }

    pub fn pool_size(&self) -> u32 {
        (u32::from(self.pool_end()) + 1).saturating_sub(u32::from(self.pool_start()))
    }
}

/// How this node presents itself and how long peers may stay silent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    pub display_name: String,
    /// Port our chat service listens on, advertised to peers.
    pub port: u16,
    pub service_type: String,
    /// Fixed address to announce; `None` lets the interface provider decide.
    pub address: Option<Ipv4Addr>,
    pub sweep_interval_millis: u64,
    pub peer_timeout_millis: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            display_name: default_display_name(),
            port: 8989,
            service_type: "_ztalk._tcp.local.".to_string(),
            address: None,
            sweep_interval_millis: 30_000,
            peer_timeout_millis: 90_000,
        }
    }
}

impl PresenceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.display_name.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "display_name must not be empty".to_string(),
            ));
        }

        if self.sweep_interval_millis == 0 || self.peer_timeout_millis == 0 {
            return Err(Error::InvalidConfig(
                "sweep_interval_millis and peer_timeout_millis must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_millis)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_millis)
    }
}

fn default_display_name() -> String {
    ["HOSTNAME", "COMPUTERNAME", "USER"]
        .iter()
        .find_map(|key| std::env::var(key).ok().filter(|value| !value.is_empty()))
        .unwrap_or_else(|| "ztalk".to_string())
}

/// Settings of the UDP broadcast discovery transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub port: u16,
    pub broadcast_address: Ipv4Addr,
    pub announce_interval_millis: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: 18989,
            broadcast_address: Ipv4Addr::BROADCAST,
            announce_interval_millis: 10_000,
        }
    }
}

impl TransportConfig {
    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_millis.max(1))
    }
}

/// Everything the `ztalk-net` binary reads from its JSON config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Serving DHCP needs port 67, so it is opt-in.
    #[serde(default)]
    pub enable_dhcp: bool,
    #[serde(default)]
    pub dhcp: DhcpServerConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

impl Config {
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.dhcp.validate()?;
        self.presence.validate()
    }
}
