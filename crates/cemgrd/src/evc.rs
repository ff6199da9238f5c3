//! Ethernet virtual connections: the customer-visible service object.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use ce_common::{CeError, CeResult};
use serde::{Deserialize, Serialize};

use crate::connection::{ConnectionState, ConnectionType};
use crate::ni::Uni;

/// Default end-to-end latency constraint.
pub const DEFAULT_MAX_LATENCY: Duration = Duration::from_millis(50);

/// Default UNI count limit for multipoint services.
pub const DEFAULT_MAX_NUM_UNI: usize = 1000;

/// A customer service request and its installed state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evc {
    /// Derived identifier (`E[V]P-<type>-<shortId>`); empty until
    /// validation assigns it.
    pub id: String,
    /// Identifier supplied by configuration, if any.
    pub cfg_id: Option<String>,
    /// Connectivity shape.
    pub evc_type: ConnectionType,
    /// Aggregate lifecycle state.
    pub state: ConnectionState,
    /// End-to-end latency constraint.
    pub max_latency: Duration,
    /// Compact numeric identifier used in the derived id.
    pub short_id: Option<u16>,
    /// True when every UNI is CE-VLAN tagged (EVP services); false when
    /// every UNI is untagged (EP services).
    pub is_virtual: bool,
    /// Maximum number of UNIs the service may span.
    pub max_num_uni: usize,
    /// The service endpoints.
    pub unis: Vec<Uni>,
    /// Ids of the forwarding constructs realizing this service.
    pub fc_ids: BTreeSet<String>,
}

impl Evc {
    /// Creates a service request. Fails if fewer than two UNIs are given.
    pub fn new(
        cfg_id: Option<String>,
        evc_type: ConnectionType,
        unis: Vec<Uni>,
        max_latency: Option<Duration>,
    ) -> CeResult<Self> {
        if unis.len() < 2 {
            return Err(CeError::validation(format!(
                "EVC requires at least 2 UNIs, got {}",
                unis.len()
            )));
        }
        let max_num_uni = match evc_type {
            ConnectionType::PointToPoint => 2,
            _ => DEFAULT_MAX_NUM_UNI,
        };
        Ok(Self {
            id: String::new(),
            cfg_id,
            evc_type,
            state: ConnectionState::Inactive,
            max_latency: max_latency.unwrap_or(DEFAULT_MAX_LATENCY),
            short_id: None,
            is_virtual: false,
            max_num_uni,
            unis,
            fc_ids: BTreeSet::new(),
        })
    }

    /// Derives the canonical id from type, tagging and short id.
    pub fn derive_id(evc_type: ConnectionType, is_virtual: bool, short_id: u16) -> String {
        let prefix = if is_virtual { "EVP" } else { "EP" };
        let kind = match evc_type {
            ConnectionType::PointToPoint => "Line",
            ConnectionType::Multipoint => "LAN",
            ConnectionType::RootMultipoint => "Tree",
        };
        format!("{prefix}-{kind}-{short_id}")
    }
}

impl fmt::Display for Evc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EVC:{} type={} state={} unis={}",
            self.id,
            self.evc_type,
            self.state,
            self.unis.len()
        )
    }
}
