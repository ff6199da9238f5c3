//! Per-device packet forwarding drivers.
//!
//! The planner programs each packet switch through `PacketNodeDriver`:
//! one forwarding call per ingress interface of a construct, plus
//! bandwidth-profile lifecycle calls per customer interface.
//! `RecordingPacketNode` captures the calls for inspection in tests.

use std::collections::BTreeSet;
use std::sync::Mutex;

use async_trait::async_trait;
use ce_common::CeResult;
use tracing::info;

use crate::fc::Fc;
use crate::ni::{NetworkInterface, Uni};
use crate::types::BandwidthProfile;

/// Forwarding and metering operations on a single packet switch.
#[async_trait]
pub trait PacketNodeDriver: Send + Sync {
    /// Programs forwarding for one ingress interface of a construct
    /// towards the given egress set.
    async fn set_node_forwarding(
        &self,
        fc: &Fc,
        ingress: &NetworkInterface,
        egress: &BTreeSet<NetworkInterface>,
    ) -> CeResult<()>;

    /// Creates the meter backing a bandwidth profile on a customer
    /// interface.
    async fn create_bandwidth_profile(&self, uni: &Uni, bwp: &BandwidthProfile) -> CeResult<()>;

    /// Binds a previously created meter to the installed flows.
    async fn apply_bandwidth_profile(&self, uni: &Uni, bwp: &BandwidthProfile) -> CeResult<()>;

    /// Removes a meter and its bindings.
    async fn remove_bandwidth_profile(&self, uni: &Uni, bwp: &BandwidthProfile) -> CeResult<()>;

    /// Removes all forwarding state installed for a construct.
    async fn remove_all_forwarding(&self, fc: &Fc) -> CeResult<()>;
}

/// Driver that only logs the operations it would perform.
#[derive(Debug, Default)]
pub struct LoggingPacketNode;

#[async_trait]
impl PacketNodeDriver for LoggingPacketNode {
    async fn set_node_forwarding(
        &self,
        fc: &Fc,
        ingress: &NetworkInterface,
        egress: &BTreeSet<NetworkInterface>,
    ) -> CeResult<()> {
        info!(fc = %fc.id, %ingress, egress = egress.len(), "set forwarding");
        Ok(())
    }

    async fn create_bandwidth_profile(&self, uni: &Uni, bwp: &BandwidthProfile) -> CeResult<()> {
        info!(uni = %uni.id(), bwp = %bwp.id, cir = %bwp.cir, "create bandwidth profile");
        Ok(())
    }

    async fn apply_bandwidth_profile(&self, uni: &Uni, bwp: &BandwidthProfile) -> CeResult<()> {
        info!(uni = %uni.id(), bwp = %bwp.id, "apply bandwidth profile");
        Ok(())
    }

    async fn remove_bandwidth_profile(&self, uni: &Uni, bwp: &BandwidthProfile) -> CeResult<()> {
        info!(uni = %uni.id(), bwp = %bwp.id, "remove bandwidth profile");
        Ok(())
    }

    async fn remove_all_forwarding(&self, fc: &Fc) -> CeResult<()> {
        info!(fc = %fc.id, "remove all forwarding");
        Ok(())
    }
}

/// One captured driver invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardingEvent {
    /// `set_node_forwarding(fc, ingress, egress)`.
    SetForwarding {
        /// Construct id.
        fc_id: String,
        /// Ingress interface id.
        ingress: String,
        /// Egress interface ids, sorted.
        egress: Vec<String>,
    },
    /// `create_bandwidth_profile(uni, bwp)`.
    CreateBwp {
        /// UNI id.
        uni: String,
        /// Profile id.
        bwp: String,
    },
    /// `apply_bandwidth_profile(uni, bwp)`.
    ApplyBwp {
        /// UNI id.
        uni: String,
        /// Profile id.
        bwp: String,
    },
    /// `remove_bandwidth_profile(uni, bwp)`.
    RemoveBwp {
        /// UNI id.
        uni: String,
        /// Profile id.
        bwp: String,
    },
    /// `remove_all_forwarding(fc)`.
    RemoveForwarding {
        /// Construct id.
        fc_id: String,
    },
}

/// Driver that records every invocation; used by tests to assert on the
/// exact forwarding programmed for a service.
#[derive(Debug, Default)]
pub struct RecordingPacketNode {
    events: Mutex<Vec<ForwardingEvent>>,
}

impl RecordingPacketNode {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of the captured events.
    pub fn events(&self) -> Vec<ForwardingEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Clears captured events.
    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn record(&self, event: ForwardingEvent) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }
}

#[async_trait]
impl PacketNodeDriver for RecordingPacketNode {
    async fn set_node_forwarding(
        &self,
        fc: &Fc,
        ingress: &NetworkInterface,
        egress: &BTreeSet<NetworkInterface>,
    ) -> CeResult<()> {
        self.record(ForwardingEvent::SetForwarding {
            fc_id: fc.id.clone(),
            ingress: ingress.id(),
            egress: egress.iter().map(|ni| ni.id()).collect(),
        });
        Ok(())
    }

    async fn create_bandwidth_profile(&self, uni: &Uni, bwp: &BandwidthProfile) -> CeResult<()> {
        self.record(ForwardingEvent::CreateBwp {
            uni: uni.id(),
            bwp: bwp.id.clone(),
        });
        Ok(())
    }

    async fn apply_bandwidth_profile(&self, uni: &Uni, bwp: &BandwidthProfile) -> CeResult<()> {
        self.record(ForwardingEvent::ApplyBwp {
            uni: uni.id(),
            bwp: bwp.id.clone(),
        });
        Ok(())
    }

    async fn remove_bandwidth_profile(&self, uni: &Uni, bwp: &BandwidthProfile) -> CeResult<()> {
        self.record(ForwardingEvent::RemoveBwp {
            uni: uni.id(),
            bwp: bwp.id.clone(),
        });
        Ok(())
    }

    async fn remove_all_forwarding(&self, fc: &Fc) -> CeResult<()> {
        self.record(ForwardingEvent::RemoveForwarding {
            fc_id: fc.id.clone(),
        });
        Ok(())
    }
}
