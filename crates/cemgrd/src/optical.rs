//! Transport-layer circuit control.
//!
//! Segments that cross non-packet devices (e.g. optical transport) need a
//! circuit established before packet forwarding can work. The planner
//! talks to the transport layer through `TransportController` and bounds
//! every call with a timeout, so a wedged controller degrades a service
//! to partial instead of hanging installation.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use ce_common::{CeError, CeResult};
use serde::{Deserialize, Serialize};

use crate::connection::ConnectionState;
use crate::types::{Bandwidth, ConnectPoint, VlanId};

/// Default bound on a single transport-layer call.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Identifier of an established transport circuit.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransportId(pub String);

/// Transport circuits backing a forwarding construct.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConnectivity {
    /// Circuits established for this construct.
    pub circuits: BTreeSet<TransportId>,
    /// Aggregate circuit status, maintained by the planner.
    pub state: ConnectionState,
}

impl TransportConnectivity {
    /// True if any circuit is established.
    pub fn is_installed(&self) -> bool {
        !self.circuits.is_empty()
    }
}

/// Control interface towards the transport layer.
#[async_trait]
pub trait TransportController: Send + Sync {
    /// Establishes a circuit between two connect points for the given
    /// S-VLAN and committed bandwidth. Returns the circuit id.
    async fn setup_connectivity(
        &self,
        ingress: &ConnectPoint,
        egress: &ConnectPoint,
        vlan: VlanId,
        bandwidth: Bandwidth,
    ) -> CeResult<TransportId>;

    /// Tears down a previously established circuit.
    async fn remove_connectivity(&self, id: &TransportId) -> CeResult<()>;
}

/// Transport controller for all-packet networks: no circuits to set up.
#[derive(Debug, Default)]
pub struct NullTransport;

#[async_trait]
impl TransportController for NullTransport {
    async fn setup_connectivity(
        &self,
        ingress: &ConnectPoint,
        egress: &ConnectPoint,
        _vlan: VlanId,
        _bandwidth: Bandwidth,
    ) -> CeResult<TransportId> {
        Err(CeError::transport(format!(
            "no transport controller available for {ingress} -> {egress}"
        )))
    }

    async fn remove_connectivity(&self, _id: &TransportId) -> CeResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeviceId, PortId};

    #[test]
    fn test_connectivity_installed() {
        let mut tc = TransportConnectivity::default();
        assert!(!tc.is_installed());
        assert_eq!(tc.state, ConnectionState::Inactive);
        tc.circuits.insert(TransportId("oc-1".into()));
        assert!(tc.is_installed());
    }

    #[test]
    fn test_null_transport_rejects_setup() {
        let cp = ConnectPoint::new(DeviceId::new("roadm1"), PortId::new("1"));
        let result = tokio_test::block_on(NullTransport.setup_connectivity(
            &cp,
            &cp,
            VlanId::new(100).unwrap(),
            Bandwidth::mbps(10),
        ));
        assert!(matches!(result, Err(CeError::Transport { .. })));
    }
}
