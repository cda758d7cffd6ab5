//! Server orchestrator.
//!
//! Wires the store, reset engine, realtime hub, print broker, event router,
//! WebSocket server and discovery responder together and owns their lifecycle.
//!
//! Startup order:
//! 1. daily reset check (a failure is logged, startup continues)
//! 2. realtime endpoint (HTTP API and WebSocket) bound and hub attached to it
//! 3. discovery responder started (fatal when no private address exists)
//! 4. print-job expiry sweep and periodic reset check spawned

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::events;
use serde_json::json;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::AppState;
use crate::broker::PrintJobBroker;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::discovery::{DiscoveryOptions, DiscoveryResponder, InterfaceSource, SystemInterfaces};
use crate::hub::{RealtimeHub, TransportBinding};
use crate::identity::{DeviceIdentityProvider, StationIdentity};
use crate::reset::{DailyResetEngine, ResetOutcome};
use crate::router::EventRouter;
use crate::socket::RealtimeServer;
use crate::store::{Store, StoreOptions};

/// State of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Not running.
    Stopped,
    /// Bringing components up.
    Starting,
    /// Serving stations.
    Running,
    /// Tearing components down.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// State transition.
    StateChanged(OrchestratorState),
    /// The scheduled check cleared the queue for a new day.
    ResetPerformed { date: String, tickets_reset: i64 },
    /// Print requests dropped by the expiry sweep.
    JobsExpired { request_ids: Vec<String> },
    /// A background task hit an error.
    Error { message: String },
}

/// Period of a background ticker. `tokio::time::interval` panics on zero,
/// so unvalidated configs get one second instead.
fn tick_period(secs: u64) -> Duration {
    Duration::from_secs(secs.max(1))
}

/// Owns every coordinator component and their background tasks.
pub struct ServerOrchestrator {
    config: Config,
    identity: StationIdentity,
    state: Arc<RwLock<OrchestratorState>>,
    store: Arc<Store>,
    reset: Arc<DailyResetEngine>,
    hub: Arc<RealtimeHub>,
    broker: Arc<PrintJobBroker>,
    router: Arc<EventRouter>,
    clock: Arc<dyn Clock>,
    interfaces: Arc<dyn InterfaceSource>,
    discovery: Option<DiscoveryResponder>,
    shutdown_token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl ServerOrchestrator {
    /// Create an orchestrator using the system clock and network interfaces.
    pub fn new(config: Config) -> Result<Self> {
        let identity = StationIdentity::load_or_generate(&config.device_id_path())?;
        Self::with_parts(
            config,
            Arc::new(SystemClock),
            identity,
            Arc::new(SystemInterfaces),
        )
    }

    /// Create an orchestrator with an explicit clock, identity and interface source.
    pub fn with_parts(
        config: Config,
        clock: Arc<dyn Clock>,
        identity: StationIdentity,
        interfaces: Arc<dyn InterfaceSource>,
    ) -> Result<Self> {
        let database_path = config.database_path();
        let store = Arc::new(
            Store::open(
                &database_path,
                StoreOptions {
                    read_connections: config.database.read_connections,
                    busy_timeout: Duration::from_millis(config.database.busy_timeout_ms),
                },
                Arc::clone(&clock),
            )
            .with_context(|| format!("Failed to open database: {}", database_path.display()))?,
        );

        let reset = Arc::new(
            DailyResetEngine::new(Arc::clone(&store), Arc::clone(&clock), config.reset.timezone)
                .with_history_limit(config.reset.history_limit),
        );
        let hub = Arc::new(RealtimeHub::with_station_buffer(
            Arc::clone(&clock),
            config.print.station_buffer,
        ));
        let broker = Arc::new(PrintJobBroker::with_ttl(
            Arc::clone(&hub),
            Arc::clone(&clock),
            Duration::from_secs(config.print.job_ttl_secs),
        ));
        let router = Arc::new(EventRouter::new(
            Arc::clone(&store),
            Arc::clone(&reset),
            Arc::clone(&hub),
            Arc::clone(&broker),
        ));
        let (event_tx, _) = broadcast::channel(256);

        info!(device_id = %identity.device_id(), "Coordinator orchestrator created");

        Ok(Self {
            config,
            identity,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            store,
            reset,
            hub,
            broker,
            router,
            clock,
            interfaces,
            discovery: None,
            shutdown_token: CancellationToken::new(),
            tasks: Vec::new(),
            local_addr: None,
            event_tx,
        })
    }

    /// Get the current orchestrator state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Subscribe to orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    pub fn device_id(&self) -> &str {
        self.identity.device_id()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn reset_engine(&self) -> &Arc<DailyResetEngine> {
        &self.reset
    }

    pub fn hub(&self) -> &Arc<RealtimeHub> {
        &self.hub
    }

    pub fn broker(&self) -> &Arc<PrintJobBroker> {
        &self.broker
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    /// Address of the realtime endpoint while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Address of the discovery socket while running.
    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        self.discovery.as_ref().and_then(|d| d.local_addr())
    }

    /// Get the shutdown token of the current run.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Start every component and background task.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting coordinator orchestrator");
        self.shutdown_token = CancellationToken::new();

        if let Err(e) = self.start_components().await {
            error!("Failed to start coordinator: {:#}", e);
            self.teardown().await;
            *self.state.write().await = OrchestratorState::Stopped;
            self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));
            return Err(e);
        }

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!("Coordinator orchestrator started successfully");
        Ok(())
    }

    async fn start_components(&mut self) -> Result<()> {
        if let Some(ResetOutcome::Performed {
            date,
            tickets_reset,
        }) = self.reset.run_startup_check()
        {
            self.emit_event(OrchestratorEvent::ResetPerformed {
                date,
                tickets_reset,
            });
        }

        let bind_addr = SocketAddr::new(self.config.network.bind_address, self.config.network.api_port);
        let server = RealtimeServer::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind realtime endpoint on {}", bind_addr))?;
        let local_addr = server.local_addr();
        self.hub.initialize(TransportBinding::websocket(local_addr));
        self.local_addr = Some(local_addr);

        let state = AppState {
            store: Arc::clone(&self.store),
            reset: Arc::clone(&self.reset),
            hub: Arc::clone(&self.hub),
            broker: Arc::clone(&self.broker),
            router: Arc::clone(&self.router),
            clock: Arc::clone(&self.clock),
            server_name: self.config.server.server_name.clone(),
            started_at: self.clock.now(),
            shutdown: self.shutdown_token.clone(),
        };
        let token = self.shutdown_token.clone();
        self.tasks.push(tokio::spawn(async move {
            server.serve(state, token).await;
        }));

        if self.config.discovery.enabled {
            // Advertise the port actually bound, which differs from the
            // configured one when that is 0.
            let discovery = DiscoveryResponder::new(
                DiscoveryOptions {
                    bind_address: self.config.network.bind_address,
                    udp_port: self.config.discovery.udp_port,
                    api_port: local_addr.port(),
                    server_name: self.config.server.server_name.clone(),
                    broadcast_interval: tick_period(self.config.discovery.broadcast_interval_secs),
                },
                Arc::clone(&self.interfaces),
                Arc::clone(&self.clock),
            );
            let started = discovery.start(&self.shutdown_token).await;
            self.discovery = Some(discovery);
            let addr = started.context("Failed to start discovery responder")?;
            info!(addr = %addr, "Discovery responder started");
        } else {
            info!("Discovery disabled by configuration");
        }

        self.tasks.push(self.spawn_expiry_sweep());
        self.tasks.push(self.spawn_reset_check());
        Ok(())
    }

    fn spawn_expiry_sweep(&self) -> JoinHandle<()> {
        let broker = Arc::clone(&self.broker);
        let token = self.shutdown_token.clone();
        let event_tx = self.event_tx.clone();
        let period = tick_period(self.config.print.sweep_interval_secs);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Expiry sweep received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let request_ids = broker.sweep_expired();
                        if !request_ids.is_empty() {
                            let _ = event_tx.send(OrchestratorEvent::JobsExpired { request_ids });
                        }
                    }
                }
            }
        })
    }

    fn spawn_reset_check(&self) -> JoinHandle<()> {
        let reset = Arc::clone(&self.reset);
        let hub = Arc::clone(&self.hub);
        let token = self.shutdown_token.clone();
        let event_tx = self.event_tx.clone();
        let period = tick_period(self.config.reset.check_interval_secs);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Reset check received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => match reset.perform_if_needed() {
                        Ok(ResetOutcome::Performed { date, tickets_reset }) => {
                            hub.emit_to_all(
                                events::RESET_COMPLETED,
                                json!({
                                    "date": date,
                                    "ticketsCleared": tickets_reset,
                                    "manual": false,
                                }),
                            );
                            let _ = event_tx.send(OrchestratorEvent::ResetPerformed {
                                date,
                                tickets_reset,
                            });
                        }
                        Ok(ResetOutcome::AlreadyDone { .. }) => {}
                        Err(e) => {
                            warn!("Scheduled reset check failed: {}", e);
                            let _ = event_tx.send(OrchestratorEvent::Error {
                                message: e.to_string(),
                            });
                        }
                    },
                }
            }
        })
    }

    /// Stop every component and wait for background tasks to finish.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            match *state {
                OrchestratorState::Stopped => return Ok(()),
                OrchestratorState::ShuttingDown => {
                    anyhow::bail!("Orchestrator is already shutting down");
                }
                _ => {}
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping coordinator orchestrator");
        self.teardown().await;

        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Coordinator orchestrator stopped");
        Ok(())
    }

    async fn teardown(&mut self) {
        self.shutdown_token.cancel();
        if let Some(discovery) = self.discovery.take() {
            discovery.stop().await;
        }

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!("Background task panicked: {}", e);
                }
            }
        }

        let dropped = self.hub.shutdown();
        if dropped > 0 {
            info!(connections = dropped, "Closed station connections");
        }
        self.local_addr = None;
    }

    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::discovery::StaticInterfaces;
    use chrono::TimeZone;
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::TempDir;

    fn create_test_config(temp_dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.server.data_dir = temp_dir.path().to_path_buf();
        config.network.bind_address = IpAddr::V4(Ipv4Addr::LOCALHOST);
        config.network.api_port = 0;
        config.discovery.udp_port = 0;
        config
    }

    fn create_test_orchestrator(config: Config) -> ServerOrchestrator {
        let clock = Arc::new(ManualClock::new(
            chrono::Utc
                .with_ymd_and_hms(2026, 10, 18, 8, 0, 0)
                .single()
                .unwrap(),
        ));
        ServerOrchestrator::with_parts(
            config,
            clock,
            StationIdentity::new("coordinator-test"),
            Arc::new(StaticInterfaces::single(Ipv4Addr::new(192, 168, 1, 50), 24)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_orchestrator_creation() {
        let temp_dir = TempDir::new().unwrap();
        let orchestrator = create_test_orchestrator(create_test_config(&temp_dir));

        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert_eq!(orchestrator.device_id(), "coordinator-test");
        assert!(orchestrator.local_addr().is_none());
        assert!(temp_dir.path().join("queue.db").exists());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = create_test_orchestrator(create_test_config(&temp_dir));

        orchestrator.start().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Running);
        assert!(orchestrator.local_addr().is_some());
        assert!(orchestrator.discovery_addr().is_some());
        assert!(orchestrator.hub().is_initialized());

        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert!(orchestrator.local_addr().is_none());
        assert!(orchestrator.discovery_addr().is_none());
        assert!(!orchestrator.hub().is_initialized());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = create_test_orchestrator(create_test_config(&temp_dir));

        orchestrator.start().await.unwrap();
        let err = orchestrator.start().await.unwrap_err();
        assert!(err.to_string().contains("already running"));

        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = create_test_orchestrator(create_test_config(&temp_dir));
        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
    }

    #[tokio::test]
    async fn test_restart() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = create_test_orchestrator(create_test_config(&temp_dir));

        orchestrator.start().await.unwrap();
        orchestrator.stop().await.unwrap();
        orchestrator.start().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Running);
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_startup_runs_daily_reset() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = create_test_orchestrator(create_test_config(&temp_dir));
        let mut events = orchestrator.subscribe();

        orchestrator.start().await.unwrap();

        let record = orchestrator.store().last_reset().unwrap().unwrap();
        assert_eq!(record.last_reset_date, "2026-10-18");

        let mut saw_reset = false;
        while let Ok(event) = events.try_recv() {
            if let OrchestratorEvent::ResetPerformed { date, .. } = event {
                assert_eq!(date, "2026-10-18");
                saw_reset = true;
            }
        }
        assert!(saw_reset);

        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_event_subscription() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = create_test_orchestrator(create_test_config(&temp_dir));
        let mut events = orchestrator.subscribe();

        orchestrator.start().await.unwrap();
        orchestrator.stop().await.unwrap();

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let OrchestratorEvent::StateChanged(state) = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                OrchestratorState::Starting,
                OrchestratorState::Running,
                OrchestratorState::ShuttingDown,
                OrchestratorState::Stopped,
            ]
        );
    }

    #[tokio::test]
    async fn test_start_fails_without_private_address() {
        let temp_dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let mut orchestrator = ServerOrchestrator::with_parts(
            create_test_config(&temp_dir),
            clock,
            StationIdentity::new("coordinator-test"),
            Arc::new(StaticInterfaces::new(Vec::new())),
        )
        .unwrap();

        assert!(orchestrator.start().await.is_err());
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert!(!orchestrator.hub().is_initialized());
    }

    #[tokio::test]
    async fn test_discovery_disabled() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(&temp_dir);
        config.discovery.enabled = false;
        let mut orchestrator = create_test_orchestrator(config);

        orchestrator.start().await.unwrap();
        assert!(orchestrator.discovery_addr().is_none());
        assert!(orchestrator.local_addr().is_some());
        orchestrator.stop().await.unwrap();
    }

    #[test]
    fn test_tick_period_never_zero() {
        assert_eq!(tick_period(0), Duration::from_secs(1));
        assert_eq!(tick_period(45), Duration::from_secs(45));
    }

    #[tokio::test]
    async fn test_zero_intervals_do_not_panic() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(&temp_dir);
        config.discovery.broadcast_interval_secs = 0;
        config.print.sweep_interval_secs = 0;
        config.reset.check_interval_secs = 0;
        let mut orchestrator = create_test_orchestrator(config);

        orchestrator.start().await.unwrap();
        // Let every background ticker run past its first tick.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(orchestrator.state().await, OrchestratorState::Running);
        // A panicking ticker would have finished its task.
        assert!(orchestrator.tasks.iter().all(|task| !task.is_finished()));

        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
    }
}
