//! DHCP lease management.
//!
//! This module implements the server side of address allocation:
//!
//! - IP allocation from the dynamic pool, lowest free address first
//! - Pending offer tracking between DISCOVER and REQUEST
//! - Lease creation, renewal and release
//! - Lazy expiry of stale leases
//!
//! Leases live in memory only and are lost on restart.
//!
//! # Thread Safety
//!
//! [`LeaseTable`] keeps all of its state behind one [`tokio::sync::Mutex`].
//! Every public operation holds the lock for its whole duration, so two
//! concurrent DISCOVERs for the same MAC are answered with the same address.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;

use crate::config::DhcpServerConfig;
use crate::error::{Error, Result};
use crate::packet::MacAddress;

/// How long a pending offer holds an IP (60 seconds).
///
/// After DISCOVER the address is kept for the client until its REQUEST
/// arrives. If no REQUEST arrives, the IP returns to the pool.
const OFFER_TIMEOUT_SECONDS: u64 = 60;

/// A committed binding between a hardware address and an IPv4 address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub hardware_address: MacAddress,

    pub ip_address: Ipv4Addr,

    /// Client-provided hostname (Option 12).
    pub hostname: Option<String>,

    /// When this lease expires (UTC).
    pub expires_at: DateTime<Utc>,

    /// When the binding to this address was first created (UTC).
    pub created_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(
        hardware_address: MacAddress,
        ip_address: Ipv4Addr,
        hostname: Option<String>,
        duration_seconds: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            hardware_address,
            ip_address,
            hostname,
            expires_at: now + TimeDelta::seconds(duration_seconds as i64),
            created_at: now,
        }
    }

    /// Returns true if the lease has expired.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// Returns seconds remaining until expiration, or 0 if expired.
    pub fn remaining_seconds(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }
}

/// Addresses that must not be handed to a new client.
///
/// The server address is always reserved; every other member is an address
/// bound by an active lease.
#[derive(Debug, Clone)]
pub struct ReservedAddressSet {
    server_address: Ipv4Addr,
    leased: HashSet<Ipv4Addr>,
}

impl ReservedAddressSet {
    pub fn new(server_address: Ipv4Addr) -> Self {
        Self {
            server_address,
            leased: HashSet::new(),
        }
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        address == self.server_address || self.leased.contains(&address)
    }

    fn reserve(&mut self, address: Ipv4Addr) {
        if address != self.server_address {
            self.leased.insert(address);
        }
    }

    fn free(&mut self, address: Ipv4Addr) {
        self.leased.remove(&address);
    }

    /// Number of reserved addresses, server address included.
    pub fn len(&self) -> usize {
        self.leased.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// An address offered in reply to DISCOVER, not yet confirmed.
#[derive(Debug, Clone)]
struct PendingOffer {
    ip: Ipv4Addr,
    expires_at: Instant,
}

#[derive(Debug)]
struct TableState {
    leases: HashMap<MacAddress, Lease>,
    /// Reverse lookup: IP address → owning MAC.
    ip_to_mac: HashMap<Ipv4Addr, MacAddress>,
    reserved: ReservedAddressSet,
    pending_offers: HashMap<MacAddress, PendingOffer>,
    /// IPs currently held by pending offers, for quick lookup.
    pending_ips: HashMap<Ipv4Addr, MacAddress>,
}

impl TableState {
    fn sweep_expired(&mut self, now: DateTime<Utc>) -> Vec<Lease> {
        let expired: Vec<MacAddress> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.is_expired_at(now))
            .map(|(mac, _)| *mac)
            .collect();

        expired
            .into_iter()
            .filter_map(|mac| self.remove_lease(mac))
            .collect()
    }

    fn remove_lease(&mut self, mac: MacAddress) -> Option<Lease> {
        let lease = self.leases.remove(&mac)?;
        self.ip_to_mac.remove(&lease.ip_address);
        self.reserved.free(lease.ip_address);
        Some(lease)
    }

    fn cleanup_pending_offers(&mut self) {
        let now = Instant::now();
        let pending_ips = &mut self.pending_ips;
        self.pending_offers.retain(|_, offer| {
            let live = offer.expires_at > now;
            if !live {
                pending_ips.remove(&offer.ip);
            }
            live
        });
    }

    /// Holds `ip` for `mac`, taking it over from any other MAC's offer.
    fn hold_offer(&mut self, mac: MacAddress, ip: Ipv4Addr) {
        self.drop_offer(mac);
        if let Some(holder) = self.pending_ips.get(&ip).copied() {
            self.drop_offer(holder);
        }
        self.pending_offers.insert(
            mac,
            PendingOffer {
                ip,
                expires_at: Instant::now() + Duration::from_secs(OFFER_TIMEOUT_SECONDS),
            },
        );
        self.pending_ips.insert(ip, mac);
    }

    fn drop_offer(&mut self, mac: MacAddress) {
        if let Some(offer) = self.pending_offers.remove(&mac) {
            self.pending_ips.remove(&offer.ip);
        }
    }

    fn held_for_other(&self, mac: MacAddress, ip: Ipv4Addr) -> bool {
        self.pending_ips.get(&ip).is_some_and(|holder| *holder != mac)
    }

    fn leased_to_other(&self, mac: MacAddress, ip: Ipv4Addr) -> bool {
        self.ip_to_mac.get(&ip).is_some_and(|owner| *owner != mac)
    }
}

/// MAC-keyed lease table with its reserved address set.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use ztalk_net::{DhcpServerConfig, LeaseTable, MacAddress};
///
/// # async fn example() -> ztalk_net::Result<()> {
/// let table = LeaseTable::new(Arc::new(DhcpServerConfig::default()));
///
/// let mac = MacAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
/// let ip = table.allocate(mac, None).await?;
/// let lease = table.confirm(mac, ip, None).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct LeaseTable {
    state: Mutex<TableState>,
    config: Arc<DhcpServerConfig>,
}

impl LeaseTable {
    pub fn new(config: Arc<DhcpServerConfig>) -> Self {
        let state = TableState {
            leases: HashMap::new(),
            ip_to_mac: HashMap::new(),
            reserved: ReservedAddressSet::new(config.server_ip),
            pending_offers: HashMap::new(),
            pending_ips: HashMap::new(),
        };

        Self {
            state: Mutex::new(state),
            config,
        }
    }

    pub fn config(&self) -> &DhcpServerConfig {
        &self.config
    }

    /// Picks an address for `mac` (DISCOVER handling).
    ///
    /// # Allocation Priority
    ///
    /// 1. Existing non-expired lease for this MAC
    /// 2. Live pending offer for this MAC
    /// 3. `preferred`, if it is in the pool and free
    /// 4. Lowest pool address that is neither reserved nor offered to another MAC
    /// 5. Lowest unreserved pool address; its offer moves to `mac`
    ///
    /// The returned IP is held as a pending offer for 60 seconds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoAddressAvailable`] if every pool address is reserved.
    pub async fn allocate(&self, mac: MacAddress, preferred: Option<Ipv4Addr>) -> Result<Ipv4Addr> {
        let mut state = self.state.lock().await;

        state.sweep_expired(Utc::now());
        state.cleanup_pending_offers();

        if let Some(lease) = state.leases.get(&mac) {
            let ip = lease.ip_address;
            state.hold_offer(mac, ip);
            return Ok(ip);
        }

        if let Some(offer) = state.pending_offers.get(&mac) {
            return Ok(offer.ip);
        }

        if let Some(ip) = preferred
            && self.config.ip_in_pool(ip)
            && !state.reserved.contains(ip)
            && !state.held_for_other(mac, ip)
        {
            state.hold_offer(mac, ip);
            return Ok(ip);
        }

        let start = u32::from(self.config.pool_start());
        let end = u32::from(self.config.pool_end());
        let free = (start..=end)
            .map(Ipv4Addr::from)
            .find(|ip| !state.reserved.contains(*ip) && !state.held_for_other(mac, *ip))
            .or_else(|| {
                (start..=end)
                    .map(Ipv4Addr::from)
                    .find(|ip| !state.reserved.contains(*ip))
            });

        match free {
            Some(ip) => {
                state.hold_offer(mac, ip);
                Ok(ip)
            }
            None => Err(Error::NoAddressAvailable),
        }
    }

    /// Commits or renews the lease of `mac` on `address` (REQUEST handling).
    ///
    /// The lease expires `lease_duration_seconds` from now. Renewing the same
    /// address keeps `created_at`; moving to a new address frees the old one.
    ///
    /// # Errors
    ///
    /// - [`Error::AddressOutOfRange`] if the address is not a usable host
    ///   address of the configured network
    /// - [`Error::AddressInUse`] if the address is the server's own or is
    ///   leased to another MAC
    pub async fn confirm(
        &self,
        mac: MacAddress,
        address: Ipv4Addr,
        hostname: Option<String>,
    ) -> Result<Lease> {
        if !self.config.network.is_host_address(address) {
            return Err(Error::AddressOutOfRange(address));
        }

        let mut state = self.state.lock().await;
        state.sweep_expired(Utc::now());

        if address == self.config.server_ip || state.leased_to_other(mac, address) {
            return Err(Error::AddressInUse(address));
        }

        let previous = state.remove_lease(mac);
        let mut lease = Lease::new(mac, address, hostname, self.config.lease_duration_seconds);
        if let Some(previous) = previous
            && previous.ip_address == address
        {
            lease.created_at = previous.created_at;
            if lease.hostname.is_none() {
                lease.hostname = previous.hostname;
            }
        }

        state.drop_offer(mac);
        if let Some(holder) = state.pending_ips.get(&address).copied() {
            state.drop_offer(holder);
        }

        state.reserved.reserve(address);
        state.ip_to_mac.insert(address, mac);
        state.leases.insert(mac, lease.clone());

        Ok(lease)
    }

    /// Removes the lease of `mac` and frees its address.
    pub async fn release(&self, mac: MacAddress) -> Option<Lease> {
        let mut state = self.state.lock().await;
        state.drop_offer(mac);
        state.remove_lease(mac)
    }

    /// Removes and returns every lease whose expiry has passed.
    pub async fn sweep_expired(&self) -> Vec<Lease> {
        let mut state = self.state.lock().await;
        state.sweep_expired(Utc::now())
    }

    /// True if `address` is the server's own or bound to a MAC other than `mac`.
    ///
    /// Pending offers do not count: they steer allocation but never refuse a
    /// REQUEST.
    pub async fn is_reserved_by_other(&self, mac: MacAddress, address: Ipv4Addr) -> bool {
        let mut state = self.state.lock().await;
        state.sweep_expired(Utc::now());
        address == self.config.server_ip || state.leased_to_other(mac, address)
    }

    pub async fn get(&self, mac: MacAddress) -> Option<Lease> {
        let mut state = self.state.lock().await;
        state.sweep_expired(Utc::now());
        state.leases.get(&mac).cloned()
    }

    /// Snapshot of all active leases, keyed by MAC.
    pub async fn leases(&self) -> HashMap<MacAddress, Lease> {
        let mut state = self.state.lock().await;
        state.sweep_expired(Utc::now());
        state.leases.clone()
    }

    /// Pool addresses that are not reserved. Pending offers count as free.
    pub async fn free_address_count(&self) -> usize {
        let mut state = self.state.lock().await;
        state.sweep_expired(Utc::now());
        let leased_in_pool = state
            .leases
            .values()
            .filter(|lease| self.config.ip_in_pool(lease.ip_address))
            .count();
        let server_in_pool = usize::from(self.config.ip_in_pool(self.config.server_ip));
        (self.config.pool_size() as usize).saturating_sub(leased_in_pool + server_in_pool)
    }

    #[cfg(test)]
    async fn backdate(&self, mac: MacAddress, by: TimeDelta) {
        let mut state = self.state.lock().await;
        if let Some(lease) = state.leases.get_mut(&mac) {
            lease.expires_at -= by;
        }
    }
}
