//! # Queue Coordinator Library
//!
//! Coordination server for multi-kiosk queue deployments. Ticket kiosks,
//! call windows and display screens on a LAN find the coordinator, share a
//! realtime event bus through it and route print jobs to whichever station
//! has a printer attached.
//!
//! ## Overview
//!
//! - **Discovery**: UDP probe replies and periodic presence broadcasts
//! - **Realtime Hub**: connection registry with rooms and stamped events
//! - **Print Broker**: pending remote print requests with expiry
//! - **Daily Reset**: clears the ticket queue once per calendar day
//! - **Store**: SQLite persistence for services, windows, tickets and resets
//! - **HTTP API**: health, services, tickets and reset routes on the realtime port
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Server Orchestrator                        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐  │
//! │  │  Discovery   │  │  WebSocket   │  │   Print Job Broker   │  │
//! │  │  Responder   │  │   Server     │  │                      │  │
//! │  └──────────────┘  └──────┬───────┘  └──────────────────────┘  │
//! │                           │                                      │
//! │  ┌────────────────────────▼───────────────────────────────────┐ │
//! │  │          Event Router  ──►  Realtime Hub                   │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! │                                                                  │
//! │  ┌───────────────────┐  ┌───────────────────────────────────┐  │
//! │  │ Daily Reset Engine│  │        SQLite Store               │  │
//! │  └───────────────────┘  └───────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use coordinator::{Config, ServerOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = ServerOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     // Stations can now discover and connect.
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`clock`]: Wall-clock abstraction
//! - [`discovery`]: UDP discovery responder
//! - [`hub`]: Realtime hub
//! - [`broker`]: Remote print job broker
//! - [`reset`]: Daily reset engine
//! - [`store`]: SQLite persistence
//! - [`router`]: Station event routing
//! - [`api`]: HTTP API
//! - [`socket`]: WebSocket transport
//! - [`orchestrator`]: Component lifecycle

pub mod api;
pub mod broker;
pub mod clock;
pub mod config;
pub mod discovery;
pub mod hub;
pub mod identity;
pub mod orchestrator;
pub mod reset;
pub mod router;
pub mod socket;
pub mod store;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;

pub use clock::{Clock, DateZone, ManualClock, SystemClock};

pub use discovery::{
    DiscoveryError, DiscoveryOptions, DiscoveryResponder, InterfaceSource, NetworkInfo,
    StaticInterfaces, SystemInterfaces,
};

pub use hub::{
    stamp_payload, ConnectionStats, HubError, RealtimeHub, StationHandle, TransportBinding,
};

pub use broker::{BrokerError, PrintJobBroker, PrintStatistics};

pub use reset::{DailyResetEngine, ManualResetReport, ResetError, ResetOutcome, ResetStatus};

pub use store::{
    DailyResetRecord, PrintStatus, Service, Store, StoreError, StoreOptions, StoreStats, Ticket,
    TicketStatus, Window,
};

pub use identity::{DeviceIdentityProvider, StationIdentity};

pub use router::{EventRouter, RouterError, RouterResult};

pub use api::AppState;

pub use socket::RealtimeServer;

pub use orchestrator::{OrchestratorEvent, OrchestratorState, ServerOrchestrator};
