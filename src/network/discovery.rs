use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::Mutex;
use ring::digest::{digest, SHA256};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DiscoveryConfig;
use crate::{CastDevice, CasterError, Result};

pub const CAST_SERVICE_TYPE: &str = "_googlecast._tcp.local.";

/// Model name announced by speaker groups.
const GROUP_MODEL_NAME: &str = "Google Cast Group";
/// Capability bit for multizone groups in the `ca` TXT record.
const CAPABILITY_MULTIZONE_GROUP: u32 = 0x20;

/// A change seen on the network.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    Appeared { fullname: String, device: CastDevice },
    Left { fullname: String },
}

/// Device map plus everyone listening for snapshots of it.
#[derive(Default)]
struct RegistryShared {
    devices: DashMap<Uuid, CastDevice>,
    fullnames: DashMap<String, Uuid>,
    subscribers: Mutex<Vec<UnboundedSender<Vec<CastDevice>>>>,
}

impl RegistryShared {
    /// Applies one event and publishes a snapshot if anything visible changed.
    fn apply(&self, event: DiscoveryEvent) -> bool {
        let changed = match event {
            DiscoveryEvent::Appeared { fullname, mut device } => {
                self.fullnames.insert(fullname, device.id);
                match self.devices.get_mut(&device.id) {
                    Some(mut existing) if existing.same_announcement(&device) => {
                        existing.last_seen = Utc::now();
                        false
                    }
                    Some(mut existing) => {
                        info!("Updated cast device: {} ({}:{})", device.name, device.address, device.port);
                        device.discovered_at = existing.discovered_at;
                        *existing = device;
                        true
                    }
                    None => {
                        info!("Discovered cast device: {} ({}:{})", device.name, device.address, device.port);
                        self.devices.insert(device.id, device);
                        true
                    }
                }
            }
            DiscoveryEvent::Left { fullname } => match self.fullnames.remove(&fullname) {
                Some((_, id)) => match self.devices.remove(&id) {
                    Some((_, device)) => {
                        info!("Cast device left: {}", device.name);
                        true
                    }
                    None => false,
                },
                None => false,
            },
        };

        if changed {
            self.publish();
        }
        changed
    }

    fn snapshot(&self) -> Vec<CastDevice> {
        let mut devices: Vec<CastDevice> = self.devices.iter().map(|e| e.value().clone()).collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        devices
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        self.subscribers.lock().retain(|tx| tx.send(snapshot.clone()).is_ok());
    }

    /// New subscribers always get the current list first, even when empty.
    fn subscribe(&self) -> UnboundedReceiver<Vec<CastDevice>> {
        let (tx, rx) = unbounded_channel();
        let _ = tx.send(self.snapshot());
        self.subscribers.lock().push(tx);
        rx
    }

    fn clear(&self) {
        self.devices.clear();
        self.fullnames.clear();
        self.subscribers.lock().clear();
    }
}

/// Keeps the set of cast receivers announced over mDNS.
///
/// Every change that a user could notice produces a full snapshot on each
/// receiver handed out by [`discover`](Self::discover).
pub struct CastDeviceRegistry {
    shared: Arc<RegistryShared>,
    mdns: Option<ServiceDaemon>,
    tasks: Vec<JoinHandle<()>>,
    grace_period: Duration,
}

impl CastDeviceRegistry {
    pub fn new(config: &DiscoveryConfig) -> Self {
        Self {
            shared: Arc::new(RegistryShared::default()),
            mdns: None,
            tasks: Vec::new(),
            grace_period: config.grace_period(),
        }
    }

    /// Starts browsing and returns a stream of device-list snapshots.
    ///
    /// While discovery already runs this only adds a subscriber, primed with
    /// the current list.
    pub fn discover(&mut self) -> Result<UnboundedReceiver<Vec<CastDevice>>> {
        if self.is_running() {
            debug!("Discovery already running, adding subscriber");
            return Ok(self.shared.subscribe());
        }

        for handle in self.tasks.drain(..) {
            handle.abort();
        }

        let mdns = ServiceDaemon::new()
            .map_err(|e| CasterError::Network(format!("Failed to create mDNS daemon: {}", e)))?;
        let receiver = mdns
            .browse(CAST_SERVICE_TYPE)
            .map_err(|e| CasterError::Network(format!("Failed to browse {}: {}", CAST_SERVICE_TYPE, e)))?;

        let updates = self.shared.subscribe();

        info!("Browsing for {} devices", CAST_SERVICE_TYPE);
        let shared = Arc::clone(&self.shared);
        self.tasks.push(tokio::spawn(async move {
            Self::handle_mdns_events(receiver, shared).await;
        }));

        self.tasks.push(Self::spawn_grace_check(Arc::clone(&self.shared), self.grace_period));

        self.mdns = Some(mdns);
        Ok(updates)
    }

    fn spawn_grace_check(shared: Arc<RegistryShared>, grace: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(message) = empty_after_grace(&shared, grace) {
                warn!("{}", message);
            }
        })
    }

    async fn handle_mdns_events(receiver: mdns_sd::Receiver<ServiceEvent>, shared: Arc<RegistryShared>) {
        while let Ok(event) = receiver.recv_async().await {
            match event {
                ServiceEvent::ServiceResolved(info) => match device_from_service(&info) {
                    Some(device) => {
                        shared.apply(DiscoveryEvent::Appeared {
                            fullname: info.get_fullname().to_string(),
                            device,
                        });
                    }
                    None => warn!("No usable address for {}", info.get_fullname()),
                },
                ServiceEvent::ServiceRemoved(_, fullname) => {
                    shared.apply(DiscoveryEvent::Left { fullname });
                }
                ServiceEvent::SearchStarted(service) => debug!("mDNS search started for {}", service),
                _ => {}
            }
        }
        debug!("mDNS event channel closed");
    }

    /// Stops browsing and forgets every device so a later `discover` starts clean.
    pub fn stop_discovery(&mut self) -> Result<()> {
        for handle in self.tasks.drain(..) {
            handle.abort();
        }

        let result = match self.mdns.take() {
            Some(mdns) => {
                let _ = mdns.stop_browse(CAST_SERVICE_TYPE);
                mdns.shutdown()
                    .map(|_| ())
                    .map_err(|e| CasterError::Network(format!("Failed to shutdown mDNS: {}", e)))
            }
            None => Ok(()),
        };

        self.shared.clear();
        info!("Device discovery stopped");
        result
    }

    pub fn is_running(&self) -> bool {
        self.mdns.is_some()
    }

    pub fn devices(&self) -> Vec<CastDevice> {
        self.shared.snapshot()
    }

    pub fn device(&self, id: &Uuid) -> Option<CastDevice> {
        self.shared.devices.get(id).map(|entry| entry.value().clone())
    }

    /// Case-insensitive match on the friendly name, or an exact UUID.
    pub fn find_by_name(&self, name: &str) -> Option<CastDevice> {
        if let Ok(id) = Uuid::parse_str(name) {
            if let Some(device) = self.device(&id) {
                return Some(device);
            }
        }
        self.shared
            .snapshot()
            .into_iter()
            .find(|d| d.name.eq_ignore_ascii_case(name))
    }
}

impl Default for CastDeviceRegistry {
    fn default() -> Self {
        Self::new(&DiscoveryConfig::default())
    }
}

impl Drop for CastDeviceRegistry {
    fn drop(&mut self) {
        for handle in self.tasks.drain(..) {
            handle.abort();
        }
        if let Some(mdns) = self.mdns.take() {
            let _ = mdns.shutdown();
        }
    }
}

fn device_from_service(info: &ServiceInfo) -> Option<CastDevice> {
    let addresses = info.get_addresses();
    let address = addresses
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addresses.iter().next())
        .copied()?;

    let txt: HashMap<String, String> = info
        .get_properties()
        .iter()
        .map(|p| (p.key().to_string(), p.val_str().to_string()))
        .collect();

    Some(device_from_txt(info.get_fullname(), address, info.get_port(), &txt))
}

/// Builds a device from its TXT record.
///
/// `id` is the receiver UUID, `fn` the friendly name, `md` the model and `rs`
/// the running app. Receivers without a parseable id get one derived from the
/// service name so repeated announcements still land on the same entry.
pub fn device_from_txt(fullname: &str, address: IpAddr, port: u16, txt: &HashMap<String, String>) -> CastDevice {
    let id = txt
        .get("id")
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .unwrap_or_else(|| id_from_fullname(fullname));

    let name = txt
        .get("fn")
        .filter(|s| !s.is_empty())
        .cloned()
        .unwrap_or_else(|| instance_name(fullname));

    let mut device = CastDevice::new(id, name, address, port);
    device.model_name = txt.get("md").cloned().unwrap_or_default();
    device.app_id = txt.get("rs").filter(|s| !s.is_empty()).cloned();

    let capabilities = txt.get("ca").and_then(|c| c.parse::<u32>().ok()).unwrap_or(0);
    device.is_group = device.model_name == GROUP_MODEL_NAME || capabilities & CAPABILITY_MULTIZONE_GROUP != 0;
    device
}

fn instance_name(fullname: &str) -> String {
    fullname
        .strip_suffix(CAST_SERVICE_TYPE)
        .unwrap_or(fullname)
        .trim_end_matches('.')
        .to_string()
}

/// Troubleshooting hint for when the grace period passes with nothing found.
fn empty_after_grace(shared: &RegistryShared, grace: Duration) -> Option<String> {
    if !shared.devices.is_empty() {
        return None;
    }
    Some(format!(
        "No cast devices found after {}s. Check that the device is powered on, \
         on the same network, and that mDNS (5353/udp) is not blocked by a firewall.",
        grace.as_secs()
    ))
}

fn id_from_fullname(fullname: &str) -> Uuid {
    let hash = digest(&SHA256, fullname.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash.as_ref()[..16]);
    Uuid::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn txt(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn living_room() -> (String, CastDevice) {
        let fullname = "Chromecast-abc._googlecast._tcp.local.".to_string();
        let device = device_from_txt(
            &fullname,
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
            8009,
            &txt(&[
                ("id", "4a3f8b2c9d1e4f5a8b7c6d5e4f3a2b1c"),
                ("fn", "Living Room TV"),
                ("md", "Chromecast"),
                ("ca", "4101"),
            ]),
        );
        (fullname, device)
    }

    #[test]
    fn test_txt_parsing() {
        let (_, device) = living_room();
        assert_eq!(device.id, Uuid::parse_str("4a3f8b2c-9d1e-4f5a-8b7c-6d5e4f3a2b1c").unwrap());
        assert_eq!(device.name, "Living Room TV");
        assert_eq!(device.model_name, "Chromecast");
        assert_eq!(device.port, 8009);
        assert!(!device.is_group);
        assert_eq!(device.app_id, None);
    }

    #[test]
    fn test_group_heuristic() {
        let addr = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let by_model = device_from_txt("g._googlecast._tcp.local.", addr, 32187, &txt(&[("md", "Google Cast Group")]));
        assert!(by_model.is_group);

        let by_capability = device_from_txt("g2._googlecast._tcp.local.", addr, 8009, &txt(&[("ca", "2084")]));
        assert!(by_capability.is_group);
    }

    #[test]
    fn test_missing_id_is_stable_per_service_name() {
        let addr = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let a = device_from_txt("Kitchen._googlecast._tcp.local.", addr, 8009, &HashMap::new());
        let b = device_from_txt("Kitchen._googlecast._tcp.local.", addr, 8009, &HashMap::new());
        assert_eq!(a.id, b.id);
        assert_eq!(a.name, "Kitchen");
    }

    #[test]
    fn test_repeated_announcements_publish_once() {
        let shared = RegistryShared::default();
        let mut rx = shared.subscribe();
        assert!(rx.try_recv().unwrap().is_empty());
        let (fullname, device) = living_room();

        assert!(shared.apply(DiscoveryEvent::Appeared { fullname: fullname.clone(), device: device.clone() }));
        assert!(!shared.apply(DiscoveryEvent::Appeared { fullname: fullname.clone(), device: device.clone() }));
        assert!(!shared.apply(DiscoveryEvent::Appeared { fullname: fullname.clone(), device: device.clone() }));

        assert_eq!(rx.try_recv().unwrap().len(), 1);
        assert!(rx.try_recv().is_err());
        assert_eq!(shared.devices.len(), 1);
    }

    #[test]
    fn test_visible_change_publishes_and_keeps_discovered_at() {
        let shared = RegistryShared::default();
        let (fullname, device) = living_room();
        shared.apply(DiscoveryEvent::Appeared { fullname: fullname.clone(), device: device.clone() });
        let first_seen = shared.devices.get(&device.id).unwrap().discovered_at;

        let mut rx = shared.subscribe();
        rx.try_recv().unwrap();

        let mut renamed = device.clone();
        renamed.name = "Bedroom TV".into();
        renamed.discovered_at = Utc::now() + chrono::Duration::seconds(30);
        assert!(shared.apply(DiscoveryEvent::Appeared { fullname, device: renamed }));

        let snapshot = rx.try_recv().unwrap();
        assert_eq!(snapshot[0].name, "Bedroom TV");
        assert_eq!(snapshot[0].discovered_at, first_seen);
    }

    #[test]
    fn test_removal_publishes() {
        let shared = RegistryShared::default();
        let (fullname, device) = living_room();
        shared.apply(DiscoveryEvent::Appeared { fullname: fullname.clone(), device });

        let mut rx = shared.subscribe();
        assert_eq!(rx.try_recv().unwrap().len(), 1);

        assert!(shared.apply(DiscoveryEvent::Left { fullname: fullname.clone() }));
        assert!(rx.try_recv().unwrap().is_empty());
        assert!(!shared.apply(DiscoveryEvent::Left { fullname }));
    }

    #[test]
    fn test_closed_subscribers_are_dropped() {
        let shared = RegistryShared::default();
        let rx = shared.subscribe();
        drop(rx);
        let (fullname, device) = living_room();
        shared.apply(DiscoveryEvent::Appeared { fullname, device });
        assert!(shared.subscribers.lock().is_empty());
    }

    #[test]
    fn test_lookup_by_name_or_id() {
        let registry = CastDeviceRegistry::default();
        let (fullname, device) = living_room();
        registry.shared.apply(DiscoveryEvent::Appeared { fullname, device: device.clone() });

        assert_eq!(registry.find_by_name("living room tv").map(|d| d.id), Some(device.id));
        assert_eq!(registry.find_by_name(&device.id.to_string()).map(|d| d.id), Some(device.id));
        assert!(registry.find_by_name("Garage").is_none());
        assert!(!registry.is_running());
    }

    #[test]
    fn test_empty_registry_still_primes_subscriber() {
        let shared = RegistryShared::default();
        let mut rx = shared.subscribe();
        assert_eq!(rx.try_recv().unwrap(), Vec::<CastDevice>::new());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_grace_hint_only_when_nothing_found() {
        let shared = RegistryShared::default();
        let hint = empty_after_grace(&shared, Duration::from_secs(3)).unwrap();
        assert!(hint.starts_with("No cast devices found after 3s"));
        assert!(hint.contains("5353/udp"));

        let (fullname, device) = living_room();
        shared.apply(DiscoveryEvent::Appeared { fullname, device });
        assert!(empty_after_grace(&shared, Duration::from_secs(3)).is_none());
    }

    #[tokio::test]
    async fn test_grace_check_finishes_after_period() {
        let shared = Arc::new(RegistryShared::default());
        let handle = CastDeviceRegistry::spawn_grace_check(shared, Duration::from_millis(10));
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
