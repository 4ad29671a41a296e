//! Local network discovery over mDNS, plus statically configured peers.
//!
//! Found peers are handed to the substrate as `Discovered` events. Peers we
//! are not connected to are re-announced on every interval tick; the
//! orchestrator decides whether that leads to a dial.

use crate::substrate::WsSubstrate;
use local_ip_address::local_ip;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use presence_core::{PeerAddress, PeerIdentity, Substrate};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("mDNS error: {0}")]
    Mdns(#[from] mdns_sd::Error),
    #[error("Could not determine local IP: {0}")]
    LocalIp(#[from] local_ip_address::Error),
}

/// mDNS service type for a discovery tag, e.g. `_whoosh-local._tcp.local.`
pub fn service_type(tag: &str) -> String {
    format!("_{}._tcp.local.", tag)
}

/// Our mDNS registration and browser.
pub struct LanDiscovery {
    daemon: ServiceDaemon,
    service_type: String,
    /// Full name of our registered service
    registered: Option<String>,
}

impl LanDiscovery {
    pub fn new(tag: &str) -> Result<Self, DiscoveryError> {
        Ok(Self {
            daemon: ServiceDaemon::new()?,
            service_type: service_type(tag),
            registered: None,
        })
    }

    /// Advertise ourselves, replacing any earlier registration.
    pub fn register(
        &mut self,
        id: &PeerIdentity,
        label: &str,
        url: Option<&str>,
        port: u16,
    ) -> Result<(), DiscoveryError> {
        if let Some(fullname) = self.registered.take() {
            info!("Unregistering old service: {}", fullname);
            let _ = self.daemon.unregister(&fullname);
        }

        let ip = local_ip()?;
        let host = format!("{}.local.", id);
        let properties = [
            ("id", id.as_str()),
            ("h", label),
            ("addr", url.unwrap_or_default()),
        ];

        let info = ServiceInfo::new(
            &self.service_type,
            id.as_str(),
            &host,
            &ip.to_string(),
            port,
            &properties[..],
        )?;
        let fullname = info.get_fullname().to_string();

        self.daemon.register(info)?;
        info!("Registered service {} on {}:{}", fullname, ip, port);
        self.registered = Some(fullname);
        Ok(())
    }

    pub fn browse(&self) -> Result<mdns_sd::Receiver<ServiceEvent>, DiscoveryError> {
        Ok(self.daemon.browse(&self.service_type)?)
    }
}

impl Drop for LanDiscovery {
    fn drop(&mut self) {
        if let Some(fullname) = self.registered.take() {
            info!("Unregistering service: {}", fullname);
            match self.daemon.unregister(&fullname) {
                // Let the goodbye packet go out before the daemon thread exits
                Ok(status) => {
                    let _ = status.recv_timeout(Duration::from_millis(300));
                }
                Err(e) => error!("Failed to unregister service: {}", e),
            }
        }
    }
}

/// Dialable URL for a resolved service.
///
/// Prefers the advertised `addr` property, then the first IPv4 address.
fn resolved_url(addr: Option<&str>, ips: &[IpAddr], port: u16) -> Option<String> {
    if let Some(addr) = addr.filter(|a| !a.is_empty()) {
        return Some(addr.to_string());
    }
    let ip = ips
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| ips.first())?;
    Some(format!("ws://{}", SocketAddr::new(*ip, port)))
}

/// Feed discovered peers to the substrate until the task is cancelled.
pub async fn run_discovery(
    substrate: WsSubstrate,
    receiver: Option<mdns_sd::Receiver<ServiceEvent>>,
    static_peers: Vec<PeerAddress>,
    interval: Duration,
) {
    let local_id = substrate.local_identity();
    let mut found: HashSet<PeerIdentity> = HashSet::new();

    for addr in static_peers {
        info!("Static peer {}", addr);
        substrate.remember_address(addr.peer.clone(), addr.url);
        found.insert(addr.peer);
    }

    let mut browsing = receiver.is_some();
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            event = next_event(receiver.as_ref().filter(|_| browsing)) => match event {
                Some(ServiceEvent::ServiceResolved(info)) => {
                    let Some(id) = info
                        .get_property_val_str("id")
                        .and_then(|id| id.parse::<PeerIdentity>().ok())
                    else {
                        debug!("Ignoring service without a valid id on {}", info.get_hostname());
                        continue;
                    };
                    if id == local_id {
                        continue;
                    }

                    let ips: Vec<IpAddr> = info
                        .get_addresses()
                        .iter()
                        .filter_map(|ip| ip.to_string().parse().ok())
                        .collect();
                    let Some(url) =
                        resolved_url(info.get_property_val_str("addr"), &ips, info.get_port())
                    else {
                        debug!("Resolved {} without a usable address", id);
                        continue;
                    };

                    info!(
                        "Discovered {} ({}) at {}",
                        id,
                        info.get_property_val_str("h").unwrap_or("unknown"),
                        url
                    );
                    substrate.remember_address(id.clone(), url);
                    found.insert(id.clone());
                    if !substrate.is_connected(&id).await {
                        substrate.announce_discovered(id).await;
                    }
                }
                Some(ServiceEvent::ServiceRemoved(_ty, fullname)) => {
                    let id = fullname
                        .split('.')
                        .next()
                        .and_then(|id| id.parse::<PeerIdentity>().ok());
                    if let Some(id) = id {
                        debug!("Service for {} removed", id);
                        found.remove(&id);
                    }
                }
                Some(_) => {}
                None => {
                    warn!("mDNS browse channel closed");
                    browsing = false;
                }
            },
            _ = ticker.tick() => {
                for peer in &found {
                    if !substrate.is_connected(peer).await {
                        substrate.announce_discovered(peer.clone()).await;
                    }
                }
            }
        }
    }
}

async fn next_event(receiver: Option<&mdns_sd::Receiver<ServiceEvent>>) -> Option<ServiceEvent> {
    match receiver {
        Some(receiver) => receiver.recv_async().await.ok(),
        None => std::future::pending().await,
    }
}
