//! Forwarding constructs: the per-segment unit of installation.
//!
//! An EVC is decomposed into forwarding constructs, each spanning the
//! LTPs of one packet-switched segment. A construct owns a network-wide
//! S-VLAN and is shared (by reference count) among all EVCs that traverse
//! its segment.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use ce_common::{CeError, CeResult};

use crate::connection::{ConnectionState, ConnectionType};
use crate::evc::DEFAULT_MAX_LATENCY;
use crate::ltp::Ltp;
use crate::optical::TransportConnectivity;
use crate::types::VlanId;

/// A forwarding construct.
#[derive(Debug)]
pub struct Fc {
    /// Derived identifier (`FC-<vlanId>`); empty until a VLAN is
    /// assigned.
    pub id: String,
    /// Identifier supplied by configuration, if any.
    pub cfg_id: Option<String>,
    /// Connectivity shape among the LTPs.
    pub fc_type: ConnectionType,
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Latency constraint inherited from the owning EVC.
    pub max_latency: Duration,
    /// The segment endpoints.
    pub ltps: Vec<Ltp>,
    /// Network-wide S-VLAN tag assigned at installation.
    pub vlan_id: Option<VlanId>,
    /// Whether forward and reverse paths must traverse the same links.
    pub congruent_paths: bool,
    /// State of any underlying transport circuits.
    pub transport: TransportConnectivity,
    refs: AtomicU32,
}

impl Fc {
    /// Creates a forwarding construct. Fails if fewer than two LTPs are
    /// given.
    pub fn new(
        cfg_id: Option<String>,
        fc_type: ConnectionType,
        ltps: Vec<Ltp>,
        max_latency: Option<Duration>,
    ) -> CeResult<Self> {
        if ltps.len() < 2 {
            return Err(CeError::validation(format!(
                "FC requires at least 2 LTPs, got {}",
                ltps.len()
            )));
        }
        Ok(Self {
            id: String::new(),
            cfg_id,
            fc_type,
            state: ConnectionState::Inactive,
            max_latency: max_latency.unwrap_or(DEFAULT_MAX_LATENCY),
            ltps,
            vlan_id: None,
            congruent_paths: true,
            transport: TransportConnectivity::default(),
            refs: AtomicU32::new(0),
        })
    }

    /// Derives the canonical id from the assigned VLAN.
    pub fn derive_id(vlan: VlanId) -> String {
        format!("FC-{vlan}")
    }

    /// Assigns the VLAN and the derived id.
    pub fn assign_vlan(&mut self, vlan: VlanId) {
        self.vlan_id = Some(vlan);
        self.id = Self::derive_id(vlan);
    }

    /// Number of EVCs currently referencing this construct.
    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::SeqCst)
    }

    /// Records another referencing EVC.
    pub fn increment_refs(&self) -> u32 {
        self.refs.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Drops a referencing EVC. Saturates at zero.
    pub fn decrement_refs(&self) -> u32 {
        let mut current = self.refs.load(Ordering::SeqCst);
        loop {
            if current == 0 {
                return 0;
            }
            match self.refs.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return current - 1,
                Err(observed) => current = observed,
            }
        }
    }

    /// LTPs wrapping customer interfaces.
    pub fn uni_ltps(&self) -> impl Iterator<Item = &Ltp> {
        self.ltps.iter().filter(|l| l.is_uni())
    }
}

// Clones carry the count observed at clone time; the registry's entry
// stays the authoritative counter.
impl Clone for Fc {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            cfg_id: self.cfg_id.clone(),
            fc_type: self.fc_type,
            state: self.state,
            max_latency: self.max_latency,
            ltps: self.ltps.clone(),
            vlan_id: self.vlan_id,
            congruent_paths: self.congruent_paths,
            transport: self.transport.clone(),
            refs: AtomicU32::new(self.ref_count()),
        }
    }
}

impl fmt::Display for Fc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FC:{} type={} state={} ltps={} refs={}",
            self.id,
            self.fc_type,
            self.state,
            self.ltps.len(),
            self.ref_count()
        )
    }
}
