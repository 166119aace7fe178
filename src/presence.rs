//! Presence: announcing this node and tracking the peers it hears.
//!
//! [`PresenceAnnouncer`] sits between three collaborators:
//!
//! - a [`NetworkInterfaceProvider`] that knows our IPv4 addresses,
//! - a [`DiscoveryTransport`] (mDNS, or the UDP broadcast fallback in
//!   [`crate::transport`]) that carries announcements,
//! - the [`PeerRegistry`], fed from the transport's discovery events.
//!
//! Peer events fan out to registered [`PeerListener`]s and to a broadcast
//! channel obtained from [`PresenceAnnouncer::subscribe`].

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::config::PresenceConfig;
use crate::error::{Error, Result};
use crate::peer::{Peer, PeerEvent, PeerRegistry};

const DISCOVERY_CHANNEL_CAPACITY: usize = 64;
const PEER_EVENT_CHANNEL_CAPACITY: usize = 128;

/// Source of this host's IPv4 addresses.
///
/// `subscribe` hands out a watch channel of the current address list; every
/// change to the list is an interface change.
pub trait NetworkInterfaceProvider: Send + Sync {
    fn primary_address(&self) -> Option<Ipv4Addr>;
    fn subscribe(&self) -> watch::Receiver<Vec<Ipv4Addr>>;
}

/// Address list supplied by the caller instead of read from the OS.
#[derive(Debug)]
pub struct StaticInterfaceProvider {
    addresses: watch::Sender<Vec<Ipv4Addr>>,
}

impl StaticInterfaceProvider {
    pub fn new(addresses: Vec<Ipv4Addr>) -> Self {
        let (addresses, _) = watch::channel(addresses);
        Self { addresses }
    }

    /// Replaces the address list and notifies subscribers.
    pub fn set_addresses(&self, addresses: Vec<Ipv4Addr>) {
        self.addresses.send_replace(addresses);
    }
}

impl NetworkInterfaceProvider for StaticInterfaceProvider {
    /// First non-loopback address, else the first address.
    fn primary_address(&self) -> Option<Ipv4Addr> {
        let addresses = self.addresses.borrow();
        addresses
            .iter()
            .find(|address| !address.is_loopback())
            .or_else(|| addresses.first())
            .copied()
    }

    fn subscribe(&self) -> watch::Receiver<Vec<Ipv4Addr>> {
        self.addresses.subscribe()
    }
}

/// A service instance as carried by a discovery transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub service_type: String,
    /// Full instance name, e.g. `alice._ztalk._tcp.local.`.
    pub service_name: String,
    pub address: Ipv4Addr,
    pub port: u16,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl ServiceRecord {
    /// The instance part of the service name (`alice` in `alice._ztalk._tcp.local.`).
    pub fn instance_label(&self) -> &str {
        instance_label(&self.service_name, &self.service_type)
    }
}

fn instance_label<'a>(service_name: &'a str, service_type: &str) -> &'a str {
    service_name
        .strip_suffix(service_type)
        .map(|label| label.trim_end_matches('.'))
        .filter(|label| !label.is_empty())
        .unwrap_or_else(|| service_name.split('.').next().unwrap_or(service_name))
}

/// What a transport reports while browsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Added(ServiceRecord),
    Updated(ServiceRecord),
    Removed {
        service_type: String,
        service_name: String,
    },
}

/// Announces our service and reports services of other nodes.
#[async_trait]
pub trait DiscoveryTransport: Send + Sync {
    /// Publishes `record`, replacing any earlier record with the same name.
    async fn announce(&self, record: &ServiceRecord) -> Result<()>;

    /// Withdraws the record published under `service_name`.
    async fn unannounce(&self, service_name: &str) -> Result<()>;

    /// Starts delivering events for `service_type` into `events`.
    async fn browse(&self, service_type: &str, events: mpsc::Sender<DiscoveryEvent>) -> Result<()>;

    /// Stops browsing and announcing and releases the transport's resources.
    async fn close(&self) -> Result<()>;
}

/// Receives every [`PeerEvent`] of a [`PresenceAnnouncer`].
pub trait PeerListener: Send + Sync {
    fn on_peer_event(&self, event: &PeerEvent);
}

impl<F> PeerListener for F
where
    F: Fn(&PeerEvent) + Send + Sync,
{
    fn on_peer_event(&self, event: &PeerEvent) {
        self(event)
    }
}

/// Handle returned by [`PresenceAnnouncer::add_peer_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug)]
struct AnnounceState {
    display_name: String,
    current: Option<ServiceRecord>,
}

struct Shared {
    instance_id: String,
    config: PresenceConfig,
    transport: Arc<dyn DiscoveryTransport>,
    interfaces: Arc<dyn NetworkInterfaceProvider>,
    registry: Mutex<PeerRegistry>,
    /// Service name → peer id, captured when the service was discovered.
    service_ids: Mutex<HashMap<String, String>>,
    announcement: Mutex<AnnounceState>,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn PeerListener>)>>,
    events: broadcast::Sender<PeerEvent>,
}

impl Shared {
    fn build_record(&self, display_name: &str, address: Ipv4Addr) -> ServiceRecord {
        let properties = BTreeMap::from([
            ("id".to_string(), self.instance_id.clone()),
            ("username".to_string(), display_name.to_string()),
            ("version".to_string(), env!("CARGO_PKG_VERSION").to_string()),
            ("platform".to_string(), std::env::consts::OS.to_string()),
        ]);

        ServiceRecord {
            service_type: self.config.service_type.clone(),
            service_name: format!("{}.{}", display_name, self.config.service_type),
            address,
            port: self.config.port,
            properties,
        }
    }

    /// Withdraws the current announcement, then announces on `address` if given.
    async fn reannounce(&self, address: Option<Ipv4Addr>) {
        let mut state = self.announcement.lock().await;

        if let Some(previous) = state.current.take()
            && let Err(error) = self.transport.unannounce(&previous.service_name).await
        {
            warn!("Failed to withdraw {}: {}", previous.service_name, error);
        }

        let Some(address) = address else {
            info!("No network address, presence not announced");
            return;
        };

        let record = self.build_record(&state.display_name, address);
        match self.transport.announce(&record).await {
            Ok(()) => {
                info!(
                    "Announced {} at {}:{}",
                    record.service_name, record.address, record.port
                );
                state.current = Some(record);
            }
            Err(error) => warn!("Failed to announce {}: {}", record.service_name, error),
        }
    }

    async fn withdraw(&self) {
        let mut state = self.announcement.lock().await;
        if let Some(previous) = state.current.take()
            && let Err(error) = self.transport.unannounce(&previous.service_name).await
        {
            warn!("Failed to withdraw {}: {}", previous.service_name, error);
        }
    }

    async fn on_address_change(&self, addresses: &[Ipv4Addr]) {
        debug!("Network addresses changed: {:?}", addresses);

        let primary = self
            .interfaces
            .primary_address()
            .filter(|primary| addresses.contains(primary))
            .or_else(|| addresses.first().copied());

        self.reannounce(primary).await;
    }

    async fn on_discovery_event(&self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Added(record) | DiscoveryEvent::Updated(record) => {
                self.on_service_seen(record).await
            }
            DiscoveryEvent::Removed { service_name, .. } => self.on_service_removed(&service_name).await,
        }
    }

    async fn on_service_seen(&self, record: ServiceRecord) {
        let label = record.instance_label().to_string();
        let peer_id = record
            .properties
            .get("id")
            .filter(|id| !id.is_empty())
            .cloned()
            .unwrap_or_else(|| label.clone());

        if peer_id == self.instance_id {
            trace!("Ignoring our own announcement {}", record.service_name);
            return;
        }

        let display_name = record
            .properties
            .get("username")
            .filter(|name| !name.is_empty())
            .cloned()
            .unwrap_or(label);

        self.service_ids
            .lock()
            .await
            .insert(record.service_name.clone(), peer_id.clone());

        let mut registry = self.registry.lock().await;
        let event = registry.observe(
            &peer_id,
            &display_name,
            record.address,
            record.port,
            record.properties,
        );
        self.notify(event).await;
    }

    async fn on_service_removed(&self, service_name: &str) {
        let Some(peer_id) = self.service_ids.lock().await.remove(service_name) else {
            debug!("Removal of unknown service {}", service_name);
            return;
        };

        let mut registry = self.registry.lock().await;
        if let Some(event) = registry.mark_removed(&peer_id) {
            self.notify(event).await;
        }
    }

    async fn sweep(&self) {
        let mut registry = self.registry.lock().await;
        for event in registry.sweep_timeouts(self.config.peer_timeout()) {
            self.notify(event).await;
        }
    }

    /// Callers hold the registry lock so events leave in registry order.
    async fn notify(&self, event: PeerEvent) {
        info!("{}", event);

        for (id, listener) in self.listeners.read().await.iter() {
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| listener.on_peer_event(&event)));
            if delivered.is_err() {
                error!("Peer listener {:?} panicked on {}", id, event);
            }
        }

        let _ = self.events.send(event);
    }
}

struct RunningPresence {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

enum Lifecycle {
    Idle,
    Running(RunningPresence),
    /// The transport has been closed.
    Stopped,
}

/// Announces this node and keeps the peer registry current.
///
/// ```no_run
/// use std::sync::Arc;
/// use ztalk_net::{
///     PresenceAnnouncer, PresenceConfig, StaticInterfaceProvider, TransportConfig,
///     UdpBroadcastTransport,
/// };
///
/// # async fn example() -> ztalk_net::Result<()> {
/// let transport = Arc::new(UdpBroadcastTransport::bind(TransportConfig::default()).await?);
/// let interfaces = Arc::new(StaticInterfaceProvider::new(vec!["10.0.0.20".parse().unwrap()]));
/// let presence = PresenceAnnouncer::new(PresenceConfig::default(), transport, interfaces);
///
/// presence
///     .add_peer_listener(Arc::new(|event: &ztalk_net::PeerEvent| println!("{}", event)))
///     .await;
/// presence.start().await?;
/// # Ok(())
/// # }
/// ```
pub struct PresenceAnnouncer {
    shared: Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
    next_listener_id: AtomicU64,
}

impl PresenceAnnouncer {
    pub fn new(
        config: PresenceConfig,
        transport: Arc<dyn DiscoveryTransport>,
        interfaces: Arc<dyn NetworkInterfaceProvider>,
    ) -> Self {
        Self::with_instance_id(Uuid::new_v4().to_string(), config, transport, interfaces)
    }

    /// Like [`new`](Self::new) with a caller-chosen instance id.
    pub fn with_instance_id(
        instance_id: String,
        config: PresenceConfig,
        transport: Arc<dyn DiscoveryTransport>,
        interfaces: Arc<dyn NetworkInterfaceProvider>,
    ) -> Self {
        let (events, _) = broadcast::channel(PEER_EVENT_CHANNEL_CAPACITY);
        let announcement = AnnounceState {
            display_name: config.display_name.clone(),
            current: None,
        };

        Self {
            shared: Arc::new(Shared {
                instance_id,
                config,
                transport,
                interfaces,
                registry: Mutex::new(PeerRegistry::new()),
                service_ids: Mutex::new(HashMap::new()),
                announcement: Mutex::new(announcement),
                listeners: RwLock::new(Vec::new()),
                events,
            }),
            lifecycle: Mutex::new(Lifecycle::Idle),
            next_listener_id: AtomicU64::new(0),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.shared.instance_id
    }

    /// Announces on the primary address, starts browsing and spawns the
    /// discovery pump, the timeout sweep and the address watcher.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRunning`] if already started and
    /// [`Error::Stopped`] after [`stop`](Self::stop), which closes the
    /// transport. Transport failures are logged, not returned.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Idle => {}
            Lifecycle::Running(_) => return Err(Error::AlreadyRunning("presence announcer")),
            Lifecycle::Stopped => return Err(Error::Stopped("presence announcer")),
        }

        let shared = &self.shared;
        info!(
            "Starting presence for {} ({})",
            shared.announcement.lock().await.display_name,
            shared.instance_id
        );

        // Subscribe before announcing so no change slips between the two.
        let mut addresses = shared.interfaces.subscribe();
        shared.reannounce(shared.interfaces.primary_address()).await;

        let (discovery_tx, mut discovery_rx) = mpsc::channel(DISCOVERY_CHANNEL_CAPACITY);
        if let Err(error) = shared
            .transport
            .browse(&shared.config.service_type, discovery_tx)
            .await
        {
            warn!("Failed to browse {}: {}", shared.config.service_type, error);
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(3);

        let pump_shared = Arc::clone(shared);
        let mut pump_shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump_shutdown.changed() => break,
                    event = discovery_rx.recv() => match event {
                        Some(event) => pump_shared.on_discovery_event(event).await,
                        None => break,
                    },
                }
            }
            debug!("Discovery pump stopped");
        }));

        let sweep_shared = Arc::clone(shared);
        let mut sweep_shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let period = sweep_shared.config.sweep_interval();
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = sweep_shutdown.changed() => break,
                    _ = interval.tick() => sweep_shared.sweep().await,
                }
            }
            debug!("Peer sweep stopped");
        }));

        let watch_shared = Arc::clone(shared);
        let mut watch_shutdown = shutdown_rx;
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = watch_shutdown.changed() => break,
                    changed = addresses.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let current = addresses.borrow_and_update().clone();
                        watch_shared.on_address_change(&current).await;
                    }
                }
            }
            debug!("Address watcher stopped");
        }));

        *lifecycle = Lifecycle::Running(RunningPresence { shutdown, tasks });
        Ok(())
    }

    /// Stops the background tasks, withdraws our announcement and closes the transport.
    pub async fn stop(&self) {
        let running = {
            let mut lifecycle = self.lifecycle.lock().await;
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running(running) => running,
                other => {
                    *lifecycle = other;
                    return;
                }
            }
        };

        let _ = running.shutdown.send(true);
        for task in running.tasks {
            if let Err(error) = task.await {
                warn!("Presence task failed: {}", error);
            }
        }

        self.shared.withdraw().await;
        if let Err(error) = self.shared.transport.close().await {
            warn!("Failed to close discovery transport: {}", error);
        }
        info!("Presence stopped");
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock().await, Lifecycle::Running(_))
    }

    /// Cancels the current announcement and re-announces on the new primary
    /// address. An empty list only withdraws.
    pub async fn on_address_change(&self, addresses: &[Ipv4Addr]) {
        self.shared.on_address_change(addresses).await;
    }

    /// Feeds one transport event into the registry.
    pub async fn on_discovery_event(&self, event: DiscoveryEvent) {
        self.shared.on_discovery_event(event).await;
    }

    /// Changes the announced display name, re-announcing if we are announced.
    pub async fn update_display_name(&self, display_name: &str) {
        let address = {
            let mut state = self.shared.announcement.lock().await;
            state.display_name = display_name.to_string();
            state.current.as_ref().map(|record| record.address)
        };

        if address.is_some() {
            self.shared.reannounce(address).await;
        }
    }

    pub async fn display_name(&self) -> String {
        self.shared.announcement.lock().await.display_name.clone()
    }

    /// The record currently published, if any.
    pub async fn current_announcement(&self) -> Option<ServiceRecord> {
        self.shared.announcement.lock().await.current.clone()
    }

    pub async fn add_peer_listener(&self, listener: Arc<dyn PeerListener>) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.shared.listeners.write().await.push((id, listener));
        id
    }

    pub async fn remove_peer_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.shared.listeners.write().await;
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// A receiver of every peer event from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.shared.events.subscribe()
    }

    pub async fn get_active_peers(&self) -> Vec<Peer> {
        self.shared.registry.lock().await.list_active()
    }

    pub async fn get_all_peers(&self) -> Vec<Peer> {
        self.shared.registry.lock().await.list_all()
    }

    pub async fn get_peer(&self, peer_id: &str) -> Option<Peer> {
        self.shared.registry.lock().await.get(peer_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Announce(ServiceRecord),
        Unannounce(String),
        Browse(String),
        Close,
    }

    #[derive(Default)]
    struct MockTransport {
        calls: StdMutex<Vec<Call>>,
        sink: StdMutex<Option<mpsc::Sender<DiscoveryEvent>>>,
    }

    impl MockTransport {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn announced(&self) -> Vec<ServiceRecord> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    Call::Announce(record) => Some(record),
                    _ => None,
                })
                .collect()
        }

        async fn emit(&self, event: DiscoveryEvent) {
            let sink = self.sink.lock().unwrap().clone().unwrap();
            sink.send(event).await.unwrap();
        }
    }

    #[async_trait]
    impl DiscoveryTransport for MockTransport {
        async fn announce(&self, record: &ServiceRecord) -> Result<()> {
            self.calls.lock().unwrap().push(Call::Announce(record.clone()));
            Ok(())
        }

        async fn unannounce(&self, service_name: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Unannounce(service_name.to_string()));
            Ok(())
        }

        async fn browse(&self, service_type: &str, events: mpsc::Sender<DiscoveryEvent>) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Browse(service_type.to_string()));
            *self.sink.lock().unwrap() = Some(events);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.calls.lock().unwrap().push(Call::Close);
            Ok(())
        }
    }

    const SERVICE_TYPE: &str = "_ztalk._tcp.local.";
    const OUR_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 20);

    fn test_config() -> PresenceConfig {
        PresenceConfig {
            display_name: "me".to_string(),
            port: 8989,
            service_type: SERVICE_TYPE.to_string(),
            address: None,
            sweep_interval_millis: 30_000,
            peer_timeout_millis: 90_000,
        }
    }

    fn setup(
        config: PresenceConfig,
        addresses: Vec<Ipv4Addr>,
    ) -> (PresenceAnnouncer, Arc<MockTransport>, Arc<StaticInterfaceProvider>) {
        let transport = Arc::new(MockTransport::default());
        let interfaces = Arc::new(StaticInterfaceProvider::new(addresses));
        let announcer = PresenceAnnouncer::with_instance_id(
            "self-id".to_string(),
            config,
            Arc::clone(&transport) as Arc<dyn DiscoveryTransport>,
            Arc::clone(&interfaces) as Arc<dyn NetworkInterfaceProvider>,
        );
        (announcer, transport, interfaces)
    }

    fn record(name: &str, id: Option<&str>, username: Option<&str>) -> ServiceRecord {
        let mut properties = BTreeMap::new();
        if let Some(id) = id {
            properties.insert("id".to_string(), id.to_string());
        }
        if let Some(username) = username {
            properties.insert("username".to_string(), username.to_string());
        }
        ServiceRecord {
            service_type: SERVICE_TYPE.to_string(),
            service_name: format!("{}.{}", name, SERVICE_TYPE),
            address: Ipv4Addr::new(10, 0, 0, 42),
            port: 8989,
            properties,
        }
    }

    fn removed(name: &str) -> DiscoveryEvent {
        DiscoveryEvent::Removed {
            service_type: SERVICE_TYPE.to_string(),
            service_name: format!("{}.{}", name, SERVICE_TYPE),
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[test]
    fn test_static_provider_prefers_non_loopback() {
        let provider = StaticInterfaceProvider::new(vec![Ipv4Addr::LOCALHOST, OUR_ADDR]);
        assert_eq!(provider.primary_address(), Some(OUR_ADDR));

        provider.set_addresses(vec![Ipv4Addr::LOCALHOST]);
        assert_eq!(provider.primary_address(), Some(Ipv4Addr::LOCALHOST));

        provider.set_addresses(vec![]);
        assert_eq!(provider.primary_address(), None);
    }

    #[test]
    fn test_instance_label() {
        assert_eq!(record("alice", None, None).instance_label(), "alice");
        assert_eq!(instance_label("bob.other._tcp.local.", SERVICE_TYPE), "bob");
    }

    #[tokio::test]
    async fn test_start_announces_and_browses() {
        let (announcer, transport, _) = setup(test_config(), vec![OUR_ADDR]);
        announcer.start().await.unwrap();

        let announced = transport.announced();
        assert_eq!(announced.len(), 1);
        let ours = &announced[0];
        assert_eq!(ours.service_name, format!("me.{}", SERVICE_TYPE));
        assert_eq!(ours.address, OUR_ADDR);
        assert_eq!(ours.port, 8989);
        assert_eq!(ours.properties["id"], "self-id");
        assert_eq!(ours.properties["username"], "me");
        assert_eq!(ours.properties["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(ours.properties["platform"], std::env::consts::OS);
        assert!(transport.calls().contains(&Call::Browse(SERVICE_TYPE.to_string())));

        assert!(matches!(announcer.start().await, Err(Error::AlreadyRunning(_))));
        announcer.stop().await;
    }

    #[tokio::test]
    async fn test_start_without_address_waits_for_change() {
        let (announcer, transport, interfaces) = setup(test_config(), vec![]);
        announcer.start().await.unwrap();
        assert!(transport.announced().is_empty());

        interfaces.set_addresses(vec![OUR_ADDR]);
        wait_until(|| !transport.announced().is_empty()).await;
        assert_eq!(transport.announced()[0].address, OUR_ADDR);

        announcer.stop().await;
    }

    #[tokio::test]
    async fn test_address_change_reannounces() {
        let (announcer, transport, _) = setup(test_config(), vec![OUR_ADDR]);
        announcer.start().await.unwrap();

        let new_addr = Ipv4Addr::new(192, 168, 7, 3);
        announcer.on_address_change(&[new_addr]).await;

        let calls = transport.calls();
        let tail = &calls[calls.len() - 2..];
        assert_eq!(tail[0], Call::Unannounce(format!("me.{}", SERVICE_TYPE)));
        assert!(matches!(&tail[1], Call::Announce(record) if record.address == new_addr));
        assert_eq!(announcer.current_announcement().await.unwrap().address, new_addr);

        announcer.on_address_change(&[]).await;
        assert!(announcer.current_announcement().await.is_none());
        assert_eq!(transport.announced().len(), 2);

        announcer.stop().await;
    }

    #[tokio::test]
    async fn test_interface_watcher_follows_provider() {
        let (announcer, transport, interfaces) = setup(test_config(), vec![OUR_ADDR]);
        announcer.start().await.unwrap();

        let new_addr = Ipv4Addr::new(10, 0, 0, 99);
        interfaces.set_addresses(vec![new_addr]);
        wait_until(|| {
            transport
                .announced()
                .last()
                .is_some_and(|record| record.address == new_addr)
        })
        .await;

        announcer.stop().await;
    }

    #[tokio::test]
    async fn test_discovery_events_drive_peer_lifecycle() {
        let (announcer, _, _) = setup(test_config(), vec![OUR_ADDR]);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        announcer
            .add_peer_listener(Arc::new(move |event: &PeerEvent| {
                sink.lock().unwrap().push(event.kind());
            }))
            .await;

        let alice = record("alice", Some("peer-1"), Some("Alice"));
        announcer.on_discovery_event(DiscoveryEvent::Added(alice.clone())).await;
        announcer.on_discovery_event(DiscoveryEvent::Updated(alice)).await;

        let peer = announcer.get_peer("peer-1").await.unwrap();
        assert_eq!(peer.display_name, "Alice");
        assert_eq!(peer.ip_address, Ipv4Addr::new(10, 0, 0, 42));
        assert!(peer.active);

        announcer.on_discovery_event(removed("alice")).await;
        assert!(announcer.get_active_peers().await.is_empty());
        assert_eq!(announcer.get_all_peers().await.len(), 1);

        assert_eq!(*seen.lock().unwrap(), vec!["added", "updated", "removed"]);
    }

    #[tokio::test]
    async fn test_own_announcement_is_filtered() {
        let (announcer, _, _) = setup(test_config(), vec![OUR_ADDR]);
        let ours = record("me", Some("self-id"), Some("me"));

        announcer.on_discovery_event(DiscoveryEvent::Added(ours)).await;
        assert!(announcer.get_all_peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_removal_matches_service_name_exactly() {
        let (announcer, _, _) = setup(test_config(), vec![OUR_ADDR]);
        announcer
            .on_discovery_event(DiscoveryEvent::Added(record("bob", Some("id-bob"), Some("bob"))))
            .await;
        announcer
            .on_discovery_event(DiscoveryEvent::Added(record("bobby", Some("id-bobby"), Some("bobby"))))
            .await;

        announcer.on_discovery_event(removed("bob")).await;

        let active: Vec<String> = announcer
            .get_active_peers()
            .await
            .into_iter()
            .map(|peer| peer.peer_id)
            .collect();
        assert_eq!(active, vec!["id-bobby".to_string()]);

        announcer.on_discovery_event(removed("nobody")).await;
        assert_eq!(announcer.get_active_peers().await.len(), 1);
    }

    #[tokio::test]
    async fn test_peer_id_falls_back_to_instance_label() {
        let (announcer, _, _) = setup(test_config(), vec![OUR_ADDR]);
        announcer
            .on_discovery_event(DiscoveryEvent::Added(record("carol", None, None)))
            .await;

        let peer = announcer.get_peer("carol").await.unwrap();
        assert_eq!(peer.display_name, "carol");
    }

    #[tokio::test]
    async fn test_browse_events_reach_registry() {
        let (announcer, transport, _) = setup(test_config(), vec![OUR_ADDR]);
        let mut events = announcer.subscribe();
        announcer.start().await.unwrap();

        transport
            .emit(DiscoveryEvent::Added(record("dave", Some("peer-d"), None)))
            .await;

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, PeerEvent::Added(ref peer) if peer.peer_id == "peer-d"));

        announcer.stop().await;
    }

    #[tokio::test]
    async fn test_sweep_times_out_silent_peers() {
        let config = PresenceConfig {
            sweep_interval_millis: 20,
            peer_timeout_millis: 50,
            ..test_config()
        };
        let (announcer, _, _) = setup(config, vec![OUR_ADDR]);
        let mut events = announcer.subscribe();
        announcer.start().await.unwrap();

        announcer
            .on_discovery_event(DiscoveryEvent::Added(record("erin", Some("peer-42"), None)))
            .await;
        assert!(matches!(events.recv().await.unwrap(), PeerEvent::Added(_)));

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, PeerEvent::TimedOut(ref peer) if peer.peer_id == "peer-42"));
        assert!(announcer.get_active_peers().await.is_empty());
        assert_eq!(announcer.get_all_peers().await.len(), 1);

        announcer.stop().await;
    }

    #[tokio::test]
    async fn test_update_display_name_reannounces() {
        let (announcer, transport, _) = setup(test_config(), vec![OUR_ADDR]);
        announcer.start().await.unwrap();

        announcer.update_display_name("renamed").await;

        let announced = transport.announced();
        let latest = announced.last().unwrap();
        assert_eq!(latest.service_name, format!("renamed.{}", SERVICE_TYPE));
        assert_eq!(latest.properties["username"], "renamed");
        assert!(transport
            .calls()
            .contains(&Call::Unannounce(format!("me.{}", SERVICE_TYPE))));
        assert_eq!(announcer.display_name().await, "renamed");

        announcer.stop().await;
    }

    #[tokio::test]
    async fn test_stop_withdraws_and_closes() {
        let (announcer, transport, _) = setup(test_config(), vec![OUR_ADDR]);
        announcer.start().await.unwrap();
        announcer.stop().await;

        let calls = transport.calls();
        let tail = &calls[calls.len() - 2..];
        assert_eq!(tail[0], Call::Unannounce(format!("me.{}", SERVICE_TYPE)));
        assert_eq!(tail[1], Call::Close);
        assert!(!announcer.is_running().await);
        assert!(announcer.current_announcement().await.is_none());
    }

    #[tokio::test]
    async fn test_restart_after_stop_refused() {
        let (announcer, transport, _) = setup(test_config(), vec![OUR_ADDR]);
        announcer.start().await.unwrap();
        announcer.stop().await;

        assert!(matches!(announcer.start().await, Err(Error::Stopped(_))));
        assert_eq!(transport.calls().last(), Some(&Call::Close));
        assert!(!announcer.is_running().await);
    }

    #[tokio::test]
    async fn test_stop_before_start_allows_start() {
        let (announcer, _, _) = setup(test_config(), vec![OUR_ADDR]);
        announcer.stop().await;
        announcer.start().await.unwrap();
        assert!(announcer.is_running().await);
        announcer.stop().await;
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_stop_sweep() {
        let config = PresenceConfig {
            sweep_interval_millis: 20,
            peer_timeout_millis: 50,
            ..test_config()
        };
        let (announcer, _, _) = setup(config, vec![OUR_ADDR]);
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        announcer
            .add_peer_listener(Arc::new(move |event: &PeerEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
                if matches!(event, PeerEvent::TimedOut(_)) {
                    panic!("listener failure");
                }
            }))
            .await;
        let mut events = announcer.subscribe();
        announcer.start().await.unwrap();

        for peer in ["peer-a", "peer-b"] {
            announcer
                .on_discovery_event(DiscoveryEvent::Added(record(peer, Some(peer), None)))
                .await;
            loop {
                let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                    .await
                    .unwrap()
                    .unwrap();
                if matches!(event, PeerEvent::TimedOut(ref timed_out) if timed_out.peer_id == peer) {
                    break;
                }
            }
        }

        assert!(announcer.get_active_peers().await.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        announcer.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_events_follow_registry_order() {
        let config = PresenceConfig {
            sweep_interval_millis: 1,
            peer_timeout_millis: 0,
            ..test_config()
        };
        let (announcer, _, _) = setup(config, vec![OUR_ADDR]);
        let mut events = announcer.subscribe();
        announcer.start().await.unwrap();

        for _ in 0..40 {
            announcer
                .on_discovery_event(DiscoveryEvent::Updated(record("gina", Some("g"), None)))
                .await;
            tokio::time::sleep(Duration::from_micros(500)).await;
        }
        announcer.stop().await;

        let mut last = None;
        while let Ok(event) = events.try_recv() {
            last = Some(event);
        }
        let peer = announcer.get_peer("g").await.unwrap();
        match last.unwrap() {
            PeerEvent::TimedOut(_) => assert!(!peer.active),
            _ => assert!(peer.active),
        }
    }

    #[tokio::test]
    async fn test_remove_peer_listener() {
        let (announcer, _, _) = setup(test_config(), vec![OUR_ADDR]);
        let count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&count);
        let id = announcer
            .add_peer_listener(Arc::new(move |_: &PeerEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .await;

        announcer
            .on_discovery_event(DiscoveryEvent::Added(record("frank", Some("f"), None)))
            .await;
        assert!(announcer.remove_peer_listener(id).await);
        assert!(!announcer.remove_peer_listener(id).await);
        announcer
            .on_discovery_event(DiscoveryEvent::Updated(record("frank", Some("f"), None)))
            .await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
