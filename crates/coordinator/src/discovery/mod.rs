//! UDP discovery responder.
//!
//! Lets stations find the coordinator without static configuration:
//! - every `{"type":"discovery"}` probe gets an immediate unicast reply
//! - a `server_broadcast` announcement goes out on start and then on a fixed
//!   interval to the universal, subnet and well-known broadcast addresses
//!
//! Discovery is best-effort. Malformed datagrams and failed sends are logged
//! and otherwise ignored; only the absence of a private address is fatal.

pub mod network;

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use protocol::discovery::{
    DiscoveryMessage, DiscoveryProbe, ServerAnnouncement, API_PORT, DEFAULT_SERVER_NAME,
    DISCOVERY_PORT, MAX_DATAGRAM_SIZE,
};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;

pub use network::{
    broadcast_address, detect_network, select_network, InterfaceAddr, InterfaceSource,
    NetworkClass, NetworkInfo, StaticInterfaces, SystemInterfaces, FALLBACK_BROADCASTS,
};

/// Errors that can occur when starting discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// No non-loopback interface has a private IPv4 address.
    #[error("No valid private network IP address found")]
    NoPrivateAddress,

    /// Interface enumeration failed.
    #[error("Failed to enumerate network interfaces: {0}")]
    Interfaces(#[source] io::Error),

    /// The discovery socket could not be bound.
    #[error("Failed to bind discovery socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Other socket error.
    #[error("Discovery socket error: {0}")]
    Io(#[from] io::Error),

    /// `start` was called twice.
    #[error("Discovery responder is already running")]
    AlreadyRunning,
}

/// Settings for the discovery responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryOptions {
    /// Address the UDP socket binds to.
    pub bind_address: IpAddr,
    /// UDP port to listen and broadcast on. `0` picks an ephemeral port.
    pub udp_port: u16,
    /// Realtime/API port advertised to stations.
    pub api_port: u16,
    /// Advertised server name.
    pub server_name: String,
    /// Period between unsolicited announcements.
    pub broadcast_interval: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            udp_port: DISCOVERY_PORT,
            api_port: API_PORT,
            server_name: DEFAULT_SERVER_NAME.to_string(),
            broadcast_interval: Duration::from_secs(30),
        }
    }
}

/// Shortest period between announcements.
pub const MIN_BROADCAST_INTERVAL: Duration = Duration::from_secs(1);

struct Running {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
    network: Arc<Mutex<NetworkInfo>>,
    broadcasts: Arc<AtomicU64>,
}

/// Answers discovery probes and announces the server periodically.
pub struct DiscoveryResponder {
    options: DiscoveryOptions,
    interfaces: Arc<dyn InterfaceSource>,
    clock: Arc<dyn Clock>,
    running: Mutex<Option<Running>>,
}

impl DiscoveryResponder {
    pub fn new(
        options: DiscoveryOptions,
        interfaces: Arc<dyn InterfaceSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            options,
            interfaces,
            clock,
            running: Mutex::new(None),
        }
    }

    /// Detect the local network, bind the socket and spawn the responder task.
    ///
    /// Returns the bound socket address. Fails with
    /// [`DiscoveryError::NoPrivateAddress`] when no private IPv4 address exists.
    /// The task stops when `parent` is cancelled or [`stop`](Self::stop) is called.
    pub async fn start(&self, parent: &CancellationToken) -> Result<SocketAddr, DiscoveryError> {
        if self.is_running() {
            return Err(DiscoveryError::AlreadyRunning);
        }

        let network = detect_network(self.interfaces.as_ref())?;
        let bind_addr = SocketAddr::new(self.options.bind_address, self.options.udp_port);
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|source| DiscoveryError::Bind {
                addr: bind_addr,
                source,
            })?;
        socket.set_broadcast(true)?;
        let local_addr = socket.local_addr()?;

        info!(
            ip = %network.ip,
            broadcast = %network.broadcast,
            class = ?network.class,
            addr = %local_addr,
            "Discovery responder listening"
        );

        let shutdown = parent.child_token();
        let network = Arc::new(Mutex::new(network));
        let broadcasts = Arc::new(AtomicU64::new(0));
        let worker = ResponderLoop {
            socket,
            udp_port: local_addr.port(),
            api_port: self.options.api_port,
            server_name: self.options.server_name.clone(),
            interfaces: Arc::clone(&self.interfaces),
            clock: Arc::clone(&self.clock),
            network: Arc::clone(&network),
            broadcasts: Arc::clone(&broadcasts),
        };
        let task = tokio::spawn(worker.run(self.options.broadcast_interval, shutdown.clone()));

        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() {
            shutdown.cancel();
            return Err(DiscoveryError::AlreadyRunning);
        }
        *running = Some(Running {
            shutdown,
            task,
            local_addr,
            network,
            broadcasts,
        });
        Ok(local_addr)
    }

    /// Stop the responder and wait for its task to finish.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(running) = running {
            running.shutdown.cancel();
            if let Err(e) = running.task.await {
                warn!(error = %e, "Discovery task ended abnormally");
            }
            info!("Discovery responder stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|r| r.is_some())
            .unwrap_or(false)
    }

    /// Bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .ok()
            .and_then(|r| r.as_ref().map(|r| r.local_addr))
    }

    /// Network currently advertised, refreshed on every broadcast.
    pub fn network(&self) -> Option<NetworkInfo> {
        self.running
            .lock()
            .ok()
            .and_then(|r| r.as_ref().map(|r| current(&r.network)))
    }

    /// Broadcast rounds completed since start.
    pub fn broadcast_count(&self) -> u64 {
        self.running
            .lock()
            .ok()
            .and_then(|r| r.as_ref().map(|r| r.broadcasts.load(Ordering::Relaxed)))
            .unwrap_or(0)
    }
}

fn current(network: &Mutex<NetworkInfo>) -> NetworkInfo {
    *network.lock().unwrap_or_else(|e| e.into_inner())
}

struct ResponderLoop {
    socket: UdpSocket,
    udp_port: u16,
    api_port: u16,
    server_name: String,
    interfaces: Arc<dyn InterfaceSource>,
    clock: Arc<dyn Clock>,
    network: Arc<Mutex<NetworkInfo>>,
    broadcasts: Arc<AtomicU64>,
}

impl ResponderLoop {
    async fn run(self, period: Duration, shutdown: CancellationToken) {
        // The first tick fires immediately.
        let mut ticker = tokio::time::interval(period.max(MIN_BROADCAST_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.broadcast().await,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => self.handle_datagram(&buf[..len], peer).await,
                    Err(e) => debug!(error = %e, "Discovery receive failed"),
                },
            }
        }
    }

    fn announcement(&self) -> ServerAnnouncement {
        ServerAnnouncement::new(
            self.server_name.clone(),
            current(&self.network).ip,
            self.api_port,
            self.udp_port,
        )
    }

    async fn handle_datagram(&self, bytes: &[u8], peer: SocketAddr) {
        let probe = match DiscoveryProbe::decode(bytes) {
            Ok(probe) => probe,
            Err(e) => {
                debug!(peer = %peer, error = %e, "Dropping malformed discovery datagram");
                return;
            }
        };
        if !probe.wants_reply() {
            return;
        }

        let reply = DiscoveryMessage::reply(self.clock.now_millis(), self.announcement());
        match reply.encode() {
            Ok(payload) => match self.socket.send_to(&payload, peer).await {
                Ok(_) => debug!(peer = %peer, "Sent discovery reply"),
                Err(e) => warn!(peer = %peer, error = %e, "Failed to send discovery reply"),
            },
            Err(e) => warn!(error = %e, "Failed to encode discovery reply"),
        }
    }

    /// Re-detect the network and list this round's destinations.
    ///
    /// When detection fails the last known network keeps being advertised
    /// and its subnet broadcast is tried after the fallback list.
    fn broadcast_targets(&self) -> Vec<Ipv4Addr> {
        match detect_network(self.interfaces.as_ref()) {
            Ok(network) => {
                *self.network.lock().unwrap_or_else(|e| e.into_inner()) = network;
                network.broadcast_targets()
            }
            Err(e) => {
                debug!(error = %e, "Using fallback broadcast addresses");
                let mut targets = FALLBACK_BROADCASTS.to_vec();
                let last_known = current(&self.network).broadcast;
                if !targets.contains(&last_known) {
                    targets.push(last_known);
                }
                targets
            }
        }
    }

    fn broadcast_payload(&self) -> protocol::Result<Vec<u8>> {
        DiscoveryMessage::broadcast(self.clock.now_millis(), self.announcement()).encode()
    }

    async fn broadcast(&self) {
        let targets = self.broadcast_targets();
        let payload = match self.broadcast_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode server broadcast");
                return;
            }
        };

        let mut sent = 0usize;
        for target in &targets {
            let addr = SocketAddr::new(IpAddr::V4(*target), self.udp_port);
            match self.socket.send_to(&payload, addr).await {
                Ok(_) => sent += 1,
                Err(e) => debug!(target = %addr, error = %e, "Broadcast send failed"),
            }
        }
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        debug!(sent, targets = targets.len(), "Server broadcast");
    }
}
