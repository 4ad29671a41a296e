//! Backend mode: accept connections and answer greetings.
//!
//! The backend never initiates handshakes or dials anyone; it only keeps
//! track of who is connected and replies on inbound protocol streams.

use presence_core::protocol::handshake;
use presence_core::{PeerIdentity, SubstrateEvent};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Answer inbound handshakes until the event channel closes.
pub async fn serve(
    mut events: mpsc::Receiver<SubstrateEvent>,
    label: String,
    protocol: String,
    wait: Duration,
) {
    let mut peers: HashMap<PeerIdentity, String> = HashMap::new();
    let mut responders = JoinSet::new();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    info!("Substrate event channel closed, backend stopping");
                    break;
                };
                match event {
                    SubstrateEvent::Connected(peer) => debug!("Peer connected: {}", peer),
                    SubstrateEvent::Identified { peer, label, .. } => {
                        info!("Peer identified: {} ({})", peer, label);
                        peers.insert(peer, label);
                    }
                    SubstrateEvent::Disconnected(peer) => {
                        info!("Peer disconnected: {}", peer);
                        peers.remove(&peer);
                    }
                    SubstrateEvent::Discovered(peer) => debug!("Ignoring discovered peer {}", peer),
                    SubstrateEvent::InboundStream { peer, protocol: stream_protocol, stream } => {
                        if stream_protocol != protocol {
                            debug!("Ignoring inbound {} stream from {}", stream_protocol, peer);
                            continue;
                        }
                        let label = label.clone();
                        responders.spawn(async move {
                            match handshake::respond(stream, &label, wait).await {
                                Ok(Some(remote)) => info!("Answered greeting from {} ({})", peer, remote),
                                Ok(None) => info!("Answered {} without a greeting", peer),
                                Err(e) => warn!("Handshake with {} failed: {}", peer, e),
                            }
                        });
                        debug!("{} peers connected", peers.len());
                    }
                }
            }
            Some(_) = responders.join_next(), if !responders.is_empty() => {}
        }
    }

    responders.shutdown().await;
}
