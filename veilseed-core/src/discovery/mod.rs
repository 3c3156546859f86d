/*
  DiscoveryCommunity - the peer feed

  Fills the overlay peer table. Every walk interval the community sends an introduction request
  to each bootstrap address and to a few known peers. The receiver records the requester and
  answers with its own key, its capabilities and a random sample of the peers it knows (peer
  exchange). The requester records the responder and every exchanged peer it did not know yet.

  Wire (after the overlay prefix byte), bincode:
    IntroductionRequest  { public_key, capabilities }
    IntroductionResponse { public_key, capabilities, peers: [ { public_key, addr, capabilities } ] }

  Bootstrap entries are resolved once at start. An entry that does not resolve fails the start.
*/

use bincode::Options;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::components::LaunchError;
use crate::config::DiscoveryConfig;
use crate::metrics;
use crate::notifier::{payload, Notifier, Topic};
use crate::overlay::{short_id, Capabilities, Inbound, Overlay, PeerKey, DISCOVERY_PREFIX};

/// Known peers contacted per walk, in addition to bootstrap addresses
const WALK_FANOUT: usize = 3;

const MAX_MESSAGE_SIZE: u64 = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub public_key: PeerKey,
    pub addr: SocketAddr,
    pub capabilities: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryMessage {
    IntroductionRequest {
        public_key: PeerKey,
        capabilities: u8,
    },
    IntroductionResponse {
        public_key: PeerKey,
        capabilities: u8,
        peers: Vec<PeerRecord>,
    },
}

impl DiscoveryMessage {
    fn codec() -> impl Options {
        bincode::DefaultOptions::new().with_limit(MAX_MESSAGE_SIZE)
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        Self::codec().serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        Self::codec().deserialize(bytes)
    }
}

/// Resolve `host:port` bootstrap entries
pub async fn resolve_bootstrap(entries: &[String]) -> Result<Vec<SocketAddr>, LaunchError> {
    let mut resolved = Vec::with_capacity(entries.len());

    for entry in entries {
        let addr = tokio::net::lookup_host(entry.as_str())
            .await
            .map_err(|e| LaunchError::Start {
                component: DiscoveryCommunity::NAME,
                reason: format!("bootstrap {}: {}", entry, e),
            })?
            .next()
            .ok_or_else(|| LaunchError::Start {
                component: DiscoveryCommunity::NAME,
                reason: format!("bootstrap {} resolved to no address", entry),
            })?;
        resolved.push(addr);
    }

    Ok(resolved)
}

pub struct DiscoveryCommunity {
    overlay: Arc<Overlay>,
    notifier: Notifier,
    config: DiscoveryConfig,
    bootstrap: Vec<String>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryCommunity {
    pub const NAME: &'static str = "discovery";

    pub fn new(
        overlay: Arc<Overlay>,
        notifier: Notifier,
        config: DiscoveryConfig,
        bootstrap: Vec<String>,
    ) -> Self {
        Self {
            overlay,
            notifier,
            config,
            bootstrap,
            task: Mutex::new(None),
        }
    }

    pub async fn start(&self) -> Result<(), LaunchError> {
        let bootstrap = resolve_bootstrap(&self.bootstrap).await?;
        let inbound = self.overlay.register_handler(DISCOVERY_PREFIX)?;

        let walker = Walker {
            overlay: self.overlay.clone(),
            notifier: self.notifier.clone(),
            config: self.config.clone(),
            bootstrap,
        };
        let handle = tokio::spawn(walker.run(inbound));

        if let Some(previous) = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(handle)
        {
            previous.abort();
        }

        info!(bootstrap = self.bootstrap.len(), "Discovery community started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), LaunchError> {
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
        self.overlay.unregister_handler(DISCOVERY_PREFIX);

        info!("Discovery community stopped");
        Ok(())
    }
}

struct Walker {
    overlay: Arc<Overlay>,
    notifier: Notifier,
    config: DiscoveryConfig,
    bootstrap: Vec<SocketAddr>,
}

impl Walker {
    async fn run(self, mut inbound: mpsc::Receiver<Inbound>) {
        let mut interval = tokio::time::interval(self.config.walk_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = inbound.recv() => {
                    let Some((from, bytes)) = message else {
                        break;
                    };
                    self.handle(from, &bytes).await;
                }
                _ = interval.tick() => self.walk().await,
            }
        }

        debug!("Discovery walker ended");
    }

    fn own_key(&self) -> PeerKey {
        self.overlay.public_key()
    }

    async fn walk(&self) {
        if !self.overlay.is_running() {
            return;
        }

        let request = DiscoveryMessage::IntroductionRequest {
            public_key: self.own_key(),
            capabilities: self.overlay.capabilities().bits(),
        };
        let bytes = match request.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to encode introduction request");
                return;
            }
        };

        let mut targets = self.bootstrap.clone();
        targets.extend(
            self.overlay
                .peers()
                .sample(WALK_FANOUT, None)
                .into_iter()
                .map(|p| p.addr),
        );
        targets.sort();
        targets.dedup();

        for addr in targets {
            if let Err(e) = self.overlay.send(DISCOVERY_PREFIX, addr, &bytes).await {
                debug!(%addr, error = %e, "Introduction request failed");
            }
        }
    }

    async fn handle(&self, from: SocketAddr, bytes: &[u8]) {
        let message = match DiscoveryMessage::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                trace!(%from, error = %e, "Malformed discovery message");
                return;
            }
        };

        match message {
            DiscoveryMessage::IntroductionRequest {
                public_key,
                capabilities,
            } => {
                if public_key == self.own_key() {
                    return;
                }
                self.learn(public_key, from, Capabilities::from_bits(capabilities), true);

                let peers = self
                    .overlay
                    .peers()
                    .sample(self.config.peer_exchange_size, Some(&public_key))
                    .into_iter()
                    .map(|p| PeerRecord {
                        public_key: p.public_key,
                        addr: p.addr,
                        capabilities: p.capabilities.bits(),
                    })
                    .collect();

                let response = DiscoveryMessage::IntroductionResponse {
                    public_key: self.own_key(),
                    capabilities: self.overlay.capabilities().bits(),
                    peers,
                };
                match response.encode() {
                    Ok(bytes) => {
                        if let Err(e) = self.overlay.send(DISCOVERY_PREFIX, from, &bytes).await {
                            debug!(%from, error = %e, "Introduction response failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to encode introduction response"),
                }
            }
            DiscoveryMessage::IntroductionResponse {
                public_key,
                capabilities,
                peers,
            } => {
                if public_key == self.own_key() {
                    return;
                }
                self.learn(public_key, from, Capabilities::from_bits(capabilities), true);

                for record in peers {
                    if record.public_key == self.own_key() {
                        continue;
                    }
                    self.learn(
                        record.public_key,
                        record.addr,
                        Capabilities::from_bits(record.capabilities),
                        false,
                    );
                }
            }
        }
    }

    /// Record a peer. Second-hand records never overwrite a known peer.
    fn learn(&self, key: PeerKey, addr: SocketAddr, capabilities: Capabilities, first_hand: bool) {
        let table = self.overlay.peers();
        if !first_hand && table.get(&key).is_some() {
            return;
        }

        if table.upsert(key, addr, capabilities) {
            debug!(peer = %short_id(&key), %addr, %capabilities, "Discovered peer");
            metrics::record_gauge(metrics::names::PEERS_KNOWN, table.len() as f64);
            self.notifier.notify(
                Topic::PeerDiscovered,
                payload([
                    ("peer", json!(short_id(&key))),
                    ("address", json!(addr.to_string())),
                    ("capabilities", json!(capabilities.bits())),
                ]),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::MemoryNetwork;
    use crate::overlay::Identity;
    use std::time::Duration;

    fn node(net: &MemoryNetwork) -> Arc<Overlay> {
        Arc::new(Overlay::new(
            net.endpoint(),
            Identity::generate(),
            Capabilities::RELAY,
            32,
        ))
    }

    fn fast_config() -> DiscoveryConfig {
        DiscoveryConfig {
            walk_interval: Duration::from_millis(20),
            ..DiscoveryConfig::default()
        }
    }

    #[test]
    fn test_message_decode_rejects_garbage() {
        assert!(DiscoveryMessage::decode(&[0xff, 0xff, 0xff]).is_err());

        let message = DiscoveryMessage::IntroductionRequest {
            public_key: [9; 32],
            capabilities: Capabilities::RELAY.bits(),
        };
        let bytes = message.encode().unwrap();
        assert_eq!(DiscoveryMessage::decode(&bytes).unwrap(), message);
    }

    #[tokio::test]
    async fn test_unresolvable_bootstrap_fails_start() {
        let net = MemoryNetwork::new();
        let community = DiscoveryCommunity::new(
            node(&net),
            Notifier::new(),
            fast_config(),
            vec!["not a host".to_string()],
        );

        assert!(matches!(
            community.start().await,
            Err(LaunchError::Start { component: "discovery", .. })
        ));
    }

    #[tokio::test]
    async fn test_walk_exchanges_peers() {
        let net = MemoryNetwork::new();
        let hub = node(&net);
        let a = node(&net);
        let b = node(&net);

        let hub_addr = hub.start().await.unwrap();
        a.start().await.unwrap();
        b.start().await.unwrap();

        let notifier = Notifier::new();
        let discovered = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = discovered.clone();
        notifier.subscribe(Topic::PeerDiscovered, move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        });

        let hub_community = DiscoveryCommunity::new(hub.clone(), Notifier::new(), fast_config(), vec![]);
        let a_community = DiscoveryCommunity::new(
            a.clone(),
            notifier.clone(),
            fast_config(),
            vec![hub_addr.to_string()],
        );
        let b_community = DiscoveryCommunity::new(
            b.clone(),
            Notifier::new(),
            fast_config(),
            vec![hub_addr.to_string()],
        );
        hub_community.start().await.unwrap();
        a_community.start().await.unwrap();
        b_community.start().await.unwrap();

        let b_key = b.public_key();
        tokio::time::timeout(Duration::from_secs(3), async {
            while a.peers().get(&b_key).is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(a.peers().get(&hub.public_key()).is_some());
        assert!(discovered.load(std::sync::atomic::Ordering::SeqCst) >= 2);

        a_community.stop().await.unwrap();
        b_community.stop().await.unwrap();
        hub_community.stop().await.unwrap();
    }
}
