//! UDP discovery datagrams.
//!
//! Stations broadcast a small JSON probe (`{"type":"discovery"}`) on the
//! discovery port. The coordinator answers each probe with a unicast reply and
//! also announces itself periodically with a `server_broadcast`. Both carry the
//! same [`ServerAnnouncement`] block.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Default UDP port for discovery traffic.
pub const DISCOVERY_PORT: u16 = 4000;

/// Default port of the coordinator's API / realtime endpoint.
pub const API_PORT: u16 = 3001;

/// Version string advertised in announcements.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Human-readable server description advertised in announcements.
pub const DEFAULT_SERVER_NAME: &str = "Queue Coordinator Server";

/// Largest datagram a responder will try to decode.
pub const MAX_DATAGRAM_SIZE: usize = 8192;

/// The `type` tag of a discovery datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryKind {
    /// A probe from a station, or the coordinator's reply to one.
    Discovery,
    /// A periodic unsolicited announcement from the coordinator.
    ServerBroadcast,
}

impl DiscoveryKind {
    /// Wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryKind::Discovery => "discovery",
            DiscoveryKind::ServerBroadcast => "server_broadcast",
        }
    }
}

/// An inbound datagram, decoded just far enough to know whether to reply.
///
/// Stations attach arbitrary client info to their probes, so everything
/// except `type` is optional and unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DiscoveryProbe {
    /// The raw `type` tag.
    #[serde(rename = "type")]
    pub kind: String,
    /// Sender's timestamp in milliseconds, if provided.
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl DiscoveryProbe {
    /// Decode a probe from raw datagram bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(ProtocolError::DatagramTooLarge {
                size: bytes.len(),
                max: MAX_DATAGRAM_SIZE,
            });
        }
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Whether this probe asks for a discovery reply.
    pub fn wants_reply(&self) -> bool {
        self.kind == DiscoveryKind::Discovery.as_str()
    }
}

/// A full discovery message as sent by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryMessage {
    /// Message kind.
    #[serde(rename = "type")]
    pub kind: DiscoveryKind,
    /// Milliseconds since the Unix epoch at send time.
    pub timestamp: i64,
    /// Server description.
    pub data: ServerAnnouncement,
}

impl DiscoveryMessage {
    /// Build a reply to a station's probe.
    pub fn reply(timestamp: i64, data: ServerAnnouncement) -> Self {
        Self {
            kind: DiscoveryKind::Discovery,
            timestamp,
            data,
        }
    }

    /// Build a periodic announcement.
    pub fn broadcast(timestamp: i64, data: ServerAnnouncement) -> Self {
        Self {
            kind: DiscoveryKind::ServerBroadcast,
            timestamp,
            data,
        }
    }

    /// Serialize to datagram bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Decode a coordinator message (used by stations and tests).
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// The `data` block of a discovery reply or broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAnnouncement {
    /// Descriptive server name.
    #[serde(rename = "serverInfo")]
    pub server_info: String,
    /// Advertised protocol version.
    pub version: String,
    /// Where the server can be reached.
    pub server: ServerDescriptor,
}

impl ServerAnnouncement {
    /// Announcement for a server reachable at `ip`.
    pub fn new(server_name: impl Into<String>, ip: Ipv4Addr, port: u16, udp_port: u16) -> Self {
        Self {
            server_info: server_name.into(),
            version: PROTOCOL_VERSION.to_string(),
            server: ServerDescriptor::new(ip, port, udp_port),
        }
    }
}

/// Address block of a [`ServerAnnouncement`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDescriptor {
    /// Server IPv4 address as dotted quad.
    pub ip: String,
    /// API / realtime port.
    pub port: u16,
    /// Discovery port.
    pub udp_port: u16,
    /// Base URL of the HTTP API.
    pub api_url: String,
    /// URL of the realtime endpoint.
    pub socket_url: String,
    /// Well-known API endpoints.
    pub endpoints: Endpoints,
}

impl ServerDescriptor {
    /// Describe a server at `ip:port`.
    pub fn new(ip: Ipv4Addr, port: u16, udp_port: u16) -> Self {
        let base = format!("http://{}:{}", ip, port);
        Self {
            ip: ip.to_string(),
            port,
            udp_port,
            api_url: base.clone(),
            socket_url: base.clone(),
            endpoints: Endpoints::for_base(&base),
        }
    }
}

/// Absolute URLs of the API endpoints stations use after discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    pub api: String,
    pub health: String,
    pub services: String,
    pub tickets: String,
}

impl Endpoints {
    fn for_base(base: &str) -> Self {
        Self {
            api: format!("{}/api", base),
            health: format!("{}/health", base),
            services: format!("{}/api/services", base),
            tickets: format!("{}/api/tickets", base),
        }
    }
}
