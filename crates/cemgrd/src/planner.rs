//! Connectivity planning and installation for forwarding constructs.
//!
//! For every endpoint pair of a construct the planner resolves a path,
//! derives the per-device ingress/egress adjacency (synthesizing generic
//! interfaces at interior hops) and programs one forwarding entry per
//! ingress interface. Reverse connectivity either mirrors the forward
//! path (congruent) or is planned independently. Constructs that cross
//! the transport layer first get a circuit, bounded by a timeout so a
//! wedged controller degrades the construct instead of blocking it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ce_common::CeResult;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionState, ConnectionType};
use crate::fc::Fc;
use crate::ltp::Ltp;
use crate::ni::{NetworkInterface, NiRole};
use crate::node::PacketNodeDriver;
use crate::optical::{TransportController, TransportId, DEFAULT_CONNECT_TIMEOUT};
use crate::topology::{Link, SpanningTreeWeigher, TopologyProvider};
use crate::types::Bandwidth;

type Adjacency = BTreeMap<NetworkInterface, BTreeSet<NetworkInterface>>;

/// Plans and installs data-plane connectivity for forwarding constructs.
pub struct Provisioner {
    topo: Arc<dyn TopologyProvider>,
    node: Arc<dyn PacketNodeDriver>,
    transport: Arc<dyn TransportController>,
    connect_timeout: Duration,
    pkt_optical: AtomicBool,
}

impl Provisioner {
    /// Creates a provisioner over the given topology and drivers.
    pub fn new(
        topo: Arc<dyn TopologyProvider>,
        node: Arc<dyn PacketNodeDriver>,
        transport: Arc<dyn TransportController>,
    ) -> Self {
        Self {
            topo,
            node,
            transport,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            pkt_optical: AtomicBool::new(false),
        }
    }

    /// Overrides the transport call timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Enables or disables packet-optical provisioning.
    pub fn set_pkt_optical(&self, enabled: bool) {
        self.pkt_optical.store(enabled, Ordering::SeqCst);
    }

    /// True when packet-optical provisioning is enabled.
    pub fn pkt_optical(&self) -> bool {
        self.pkt_optical.load(Ordering::SeqCst)
    }

    /// Plans paths for every endpoint pair of the construct and installs
    /// forwarding. Updates the construct state: `Active` when every pair
    /// connected, `Partial` when at least one did, `Inactive` otherwise.
    /// The LTP set is narrowed to the endpoints that were connected.
    pub async fn setup_connectivity(&self, fc: &mut Fc) -> CeResult<()> {
        let mut adjacency = Adjacency::new();
        let mut circuits = BTreeSet::new();
        let mut used: BTreeSet<String> = BTreeSet::new();
        let mut connected = 0usize;
        let mut attempted = 0usize;

        let ltps = fc.ltps.clone();
        for (i, l1) in ltps.iter().enumerate() {
            for l2 in ltps.iter().skip(i + 1) {
                if l1.ni.role() == Some(NiRole::Leaf) && l2.ni.role() == Some(NiRole::Leaf) {
                    continue;
                }
                attempted += 1;
                if self.connect_pair(fc, l1, l2, &mut adjacency, &mut circuits).await {
                    connected += 1;
                    used.insert(l1.id());
                    used.insert(l2.id());
                }
            }
        }
        fc.transport.circuits.extend(circuits);
        fc.transport.state = if fc.transport.is_installed() {
            ConnectionState::Active
        } else {
            ConnectionState::Inactive
        };

        for (ingress, egress) in &adjacency {
            let device = &ingress.cp().device;
            let is_switch = self.topo.device(device).is_some_and(|d| d.is_switch);
            if !is_switch {
                continue;
            }
            if let Err(err) = self.node.set_node_forwarding(fc, ingress, egress).await {
                warn!(fc = %fc.id, %ingress, %err, "forwarding installation failed");
                connected = connected.saturating_sub(1);
            }
        }

        fc.state = if connected == 0 {
            ConnectionState::Inactive
        } else if connected < attempted {
            ConnectionState::Partial
        } else {
            ConnectionState::Active
        };
        if fc.state != ConnectionState::Inactive {
            fc.ltps.retain(|l| used.contains(&l.id()));
        }
        info!(fc = %fc.id, state = %fc.state, pairs = connected, "connectivity planned");
        Ok(())
    }

    /// Connects one endpoint pair in both directions. Returns true when
    /// the pair is fully connected.
    async fn connect_pair(
        &self,
        fc: &Fc,
        l1: &Ltp,
        l2: &Ltp,
        adjacency: &mut Adjacency,
        circuits: &mut BTreeSet<TransportId>,
    ) -> bool {
        if l1.cp().device == l2.cp().device {
            add_entry(adjacency, l1.ni.clone(), l2.ni.clone());
            add_entry(adjacency, l2.ni.clone(), l1.ni.clone());
            return true;
        }

        let Some(forward) = self.plan_path(fc, &l1.cp().device, &l2.cp().device) else {
            warn!(fc = %fc.id, src = %l1.id(), dst = %l2.id(), "no feasible path");
            return false;
        };

        // The circuit is recorded only once the pair fully connects;
        // an unconnected pair must not leave a live circuit behind.
        let mut pair_circuit = None;
        if self.pkt_optical() && self.crosses_transport(&forward) {
            match self.setup_circuit(fc, l1, l2).await {
                Some(id) => pair_circuit = Some(id),
                None => return false,
            }
        }

        let links = with_edges(l1, l2, forward);
        add_path_entries(adjacency, &l1.ni, &l2.ni, &links);

        if fc.congruent_paths {
            let reversed: Vec<Link> = links.iter().rev().map(Link::reversed).collect();
            add_path_entries(adjacency, &l2.ni, &l1.ni, &reversed);
            circuits.extend(pair_circuit);
            return true;
        }
        match self.plan_path(fc, &l2.cp().device, &l1.cp().device) {
            Some(back) => {
                let links = with_edges(l2, l1, back);
                add_path_entries(adjacency, &l2.ni, &l1.ni, &links);
                circuits.extend(pair_circuit);
                true
            }
            None => {
                warn!(fc = %fc.id, src = %l2.id(), dst = %l1.id(), "no feasible reverse path");
                if let Some(id) = pair_circuit {
                    self.remove_circuit(fc, &id).await;
                }
                false
            }
        }
    }

    fn plan_path(
        &self,
        fc: &Fc,
        src: &crate::types::DeviceId,
        dst: &crate::types::DeviceId,
    ) -> Option<Vec<Link>> {
        if fc.fc_type == ConnectionType::PointToPoint {
            self.topo.shortest_path(src, dst)
        } else {
            let weigher = SpanningTreeWeigher::new(self.topo.as_ref());
            self.topo.weighted_path(src, dst, &weigher)
        }
    }

    fn crosses_transport(&self, path: &[Link]) -> bool {
        path.iter().any(|link| {
            self.topo
                .device(&link.dst.device)
                .is_some_and(|d| !d.is_switch)
        })
    }

    /// Establishes a transport circuit for the pair, bounded by the
    /// configured timeout. The circuit reserves the customer-side CIR,
    /// or zero when neither side is a customer endpoint.
    async fn setup_circuit(&self, fc: &Fc, l1: &Ltp, l2: &Ltp) -> Option<TransportId> {
        let Some(vlan) = fc.vlan_id else {
            warn!(fc = %fc.id, "no VLAN assigned; transport circuit skipped");
            return None;
        };
        let bandwidth = [l1, l2]
            .iter()
            .filter_map(|l| l.uni())
            .filter_map(|u| u.service_bwp())
            .map(|bwp| bwp.cir)
            .next()
            .unwrap_or(Bandwidth::ZERO);
        let call = self
            .transport
            .setup_connectivity(l1.cp(), l2.cp(), vlan, bandwidth);
        match tokio::time::timeout(self.connect_timeout, call).await {
            Ok(Ok(id)) => {
                debug!(fc = %fc.id, circuit = %id.0, "transport circuit established");
                Some(id)
            }
            Ok(Err(err)) => {
                warn!(fc = %fc.id, %err, "transport circuit failed");
                None
            }
            Err(_) => {
                warn!(
                    fc = %fc.id,
                    timeout = ?self.connect_timeout,
                    "transport circuit timed out"
                );
                None
            }
        }
    }

    /// Tears down a single transport circuit, bounded by the configured
    /// timeout.
    async fn remove_circuit(&self, fc: &Fc, circuit: &TransportId) {
        let call = self.transport.remove_connectivity(circuit);
        match tokio::time::timeout(self.connect_timeout, call).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(fc = %fc.id, circuit = %circuit.0, %err, "circuit removal failed"),
            Err(_) => warn!(fc = %fc.id, circuit = %circuit.0, "circuit removal timed out"),
        }
    }

    /// Removes all installed connectivity of a construct: per-device
    /// forwarding and any transport circuits.
    pub async fn remove_connectivity(&self, fc: &mut Fc) -> CeResult<()> {
        if let Err(err) = self.node.remove_all_forwarding(fc).await {
            warn!(fc = %fc.id, %err, "forwarding removal failed");
        }
        let circuits = std::mem::take(&mut fc.transport.circuits);
        for circuit in circuits {
            self.remove_circuit(fc, &circuit).await;
        }
        fc.transport.state = ConnectionState::Inactive;
        fc.state = ConnectionState::Inactive;
        Ok(())
    }
}

fn add_entry(adjacency: &mut Adjacency, ingress: NetworkInterface, egress: NetworkInterface) {
    adjacency.entry(ingress).or_default().insert(egress);
}

/// Brackets an infrastructure path with the degenerate edge links of the
/// two endpoints.
fn with_edges(src: &Ltp, dst: &Ltp, path: Vec<Link>) -> Vec<Link> {
    let mut links = Vec::with_capacity(path.len() + 2);
    links.push(Link::edge(src.cp().clone()));
    links.extend(path);
    links.push(Link::edge(dst.cp().clone()));
    links
}

/// Adds the per-device forwarding entries of a directed path.
///
/// `links` starts and ends with edge links. Interior hops forward
/// through synthetic generic interfaces at the link endpoints.
fn add_path_entries(
    adjacency: &mut Adjacency,
    src: &NetworkInterface,
    dst: &NetworkInterface,
    links: &[Link],
) {
    let n = links.len();
    if n == 2 {
        add_entry(adjacency, src.clone(), dst.clone());
        return;
    }
    add_entry(
        adjacency,
        src.clone(),
        NetworkInterface::Generic(links[1].src.clone()),
    );
    for i in 1..n - 2 {
        add_entry(
            adjacency,
            NetworkInterface::Generic(links[i].dst.clone()),
            NetworkInterface::Generic(links[i + 1].src.clone()),
        );
    }
    add_entry(
        adjacency,
        NetworkInterface::Generic(links[n - 2].dst.clone()),
        dst.clone(),
    );
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::ni::Uni;
    use crate::node::{ForwardingEvent, RecordingPacketNode};
    use crate::optical::{NullTransport, TransportId};
    use crate::topology::StaticTopology;
    use crate::types::{Bandwidth, ConnectPoint, DeviceId, PortId, VlanId};
    use async_trait::async_trait;

    fn cp(dev: &str, port: &str) -> ConnectPoint {
        ConnectPoint::new(DeviceId::new(dev), PortId::new(port))
    }

    fn uni_ltp(dev: &str, port: &str, role: NiRole) -> Ltp {
        Ltp::new(
            NetworkInterface::Uni(Uni::new(
                cp(dev, port),
                Some(role),
                None,
                Bandwidth::mbps(1000),
            )),
            None,
        )
    }

    /// d1 - d2 - d3 line of switches.
    fn line() -> Arc<StaticTopology> {
        let mut topo = StaticTopology::new();
        for dev in ["d1", "d2", "d3"] {
            topo.add_switch(dev);
        }
        topo.add_link(("d1", "3"), ("d2", "2"));
        topo.add_link(("d2", "3"), ("d3", "2"));
        Arc::new(topo)
    }

    fn p2p_fc(ltps: Vec<Ltp>) -> Fc {
        let mut fc = Fc::new(None, ConnectionType::PointToPoint, ltps, None).unwrap();
        fc.assign_vlan(VlanId::new(100).unwrap());
        fc
    }

    fn provisioner(topo: Arc<StaticTopology>, node: Arc<RecordingPacketNode>) -> Provisioner {
        Provisioner::new(topo, node, Arc::new(NullTransport))
    }

    #[tokio::test]
    async fn test_same_device_pair_two_entries() {
        let topo = line();
        let node = Arc::new(RecordingPacketNode::new());
        let prov = provisioner(topo, node.clone());
        let mut fc = p2p_fc(vec![
            uni_ltp("d1", "1", NiRole::Root),
            uni_ltp("d1", "2", NiRole::Root),
        ]);
        prov.setup_connectivity(&mut fc).await.unwrap();
        assert_eq!(fc.state, ConnectionState::Active);
        let events = node.events();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            ForwardingEvent::SetForwarding {
                fc_id: "FC-100".into(),
                ingress: "d1/1".into(),
                egress: vec!["d1/2".into()],
            }
        );
    }

    #[tokio::test]
    async fn test_congruent_path_mirrors_interior_hops() {
        let topo = line();
        let node = Arc::new(RecordingPacketNode::new());
        let prov = provisioner(topo, node.clone());
        let mut fc = p2p_fc(vec![
            uni_ltp("d1", "1", NiRole::Root),
            uni_ltp("d3", "1", NiRole::Root),
        ]);
        prov.setup_connectivity(&mut fc).await.unwrap();
        assert_eq!(fc.state, ConnectionState::Active);

        // Three devices, one ingress each per direction.
        let events = node.events();
        assert_eq!(events.len(), 6);
        let has = |ingress: &str, egress: &str| {
            events.iter().any(|e| {
                matches!(e, ForwardingEvent::SetForwarding { ingress: i, egress: eg, .. }
                    if i == ingress && eg == &vec![egress.to_string()])
            })
        };
        // Forward: d1/1 -> d1/3, d2/2 -> d2/3, d3/2 -> d3/1.
        assert!(has("d1/1", "d1/3"));
        assert!(has("d2/2", "d2/3"));
        assert!(has("d3/2", "d3/1"));
        // Reverse mirrors the same links.
        assert!(has("d3/1", "d3/2"));
        assert!(has("d2/3", "d2/2"));
        assert!(has("d1/3", "d1/1"));
    }

    #[tokio::test]
    async fn test_disconnected_pair_goes_partial() {
        let mut topo = StaticTopology::new();
        topo.add_switch("d1").add_switch("d2").add_switch("d9");
        topo.add_link(("d1", "3"), ("d2", "2"));
        let topo = Arc::new(topo);
        let node = Arc::new(RecordingPacketNode::new());
        let prov = provisioner(topo, node);
        let mut fc = Fc::new(
            None,
            ConnectionType::Multipoint,
            vec![
                uni_ltp("d1", "1", NiRole::Root),
                uni_ltp("d2", "1", NiRole::Root),
                uni_ltp("d9", "1", NiRole::Root),
            ],
            None,
        )
        .unwrap();
        fc.assign_vlan(VlanId::new(5).unwrap());
        prov.setup_connectivity(&mut fc).await.unwrap();
        assert_eq!(fc.state, ConnectionState::Partial);
        // The unreachable endpoint is dropped from the construct.
        assert_eq!(fc.ltps.len(), 2);
        assert!(fc.ltps.iter().all(|l| l.cp().device != DeviceId::new("d9")));
    }

    #[tokio::test]
    async fn test_all_pairs_unreachable_is_inactive() {
        let mut topo = StaticTopology::new();
        topo.add_switch("d1").add_switch("d9");
        let topo = Arc::new(topo);
        let node = Arc::new(RecordingPacketNode::new());
        let prov = provisioner(topo, node);
        let mut fc = p2p_fc(vec![
            uni_ltp("d1", "1", NiRole::Root),
            uni_ltp("d9", "1", NiRole::Root),
        ]);
        prov.setup_connectivity(&mut fc).await.unwrap();
        assert_eq!(fc.state, ConnectionState::Inactive);
        // LTP set is preserved for diagnosis.
        assert_eq!(fc.ltps.len(), 2);
    }

    /// Transport controller that never completes.
    struct StuckTransport;

    #[async_trait]
    impl TransportController for StuckTransport {
        async fn setup_connectivity(
            &self,
            _ingress: &ConnectPoint,
            _egress: &ConnectPoint,
            _vlan: VlanId,
            _bandwidth: Bandwidth,
        ) -> ce_common::CeResult<TransportId> {
            std::future::pending().await
        }

        async fn remove_connectivity(&self, _id: &TransportId) -> ce_common::CeResult<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_transport_times_out() {
        let mut topo = StaticTopology::new();
        topo.add_switch("d1");
        topo.add_device("roadm1", false);
        topo.add_switch("d3");
        topo.add_link(("d1", "3"), ("roadm1", "1"));
        topo.add_link(("roadm1", "2"), ("d3", "2"));
        let topo = Arc::new(topo);
        let node = Arc::new(RecordingPacketNode::new());
        let prov = Provisioner::new(topo, node, Arc::new(StuckTransport))
            .with_connect_timeout(Duration::from_millis(100));
        prov.set_pkt_optical(true);
        let mut fc = p2p_fc(vec![
            uni_ltp("d1", "1", NiRole::Root),
            uni_ltp("d3", "1", NiRole::Root),
        ]);
        prov.setup_connectivity(&mut fc).await.unwrap();
        assert_eq!(fc.state, ConnectionState::Inactive);
    }

    #[tokio::test]
    async fn test_remove_connectivity_clears_state() {
        let topo = line();
        let node = Arc::new(RecordingPacketNode::new());
        let prov = provisioner(topo, node.clone());
        let mut fc = p2p_fc(vec![
            uni_ltp("d1", "1", NiRole::Root),
            uni_ltp("d1", "2", NiRole::Root),
        ]);
        prov.setup_connectivity(&mut fc).await.unwrap();
        fc.transport.circuits.insert(TransportId("oc-1".into()));
        prov.remove_connectivity(&mut fc).await.unwrap();
        assert_eq!(fc.state, ConnectionState::Inactive);
        assert_eq!(fc.transport.state, ConnectionState::Inactive);
        assert!(fc.transport.circuits.is_empty());
        assert!(node
            .events()
            .contains(&ForwardingEvent::RemoveForwarding { fc_id: "FC-100".into() }));
    }

    #[tokio::test]
    async fn test_independent_reverse_path() {
        let topo = line();
        let node = Arc::new(RecordingPacketNode::new());
        let prov = provisioner(topo, node.clone());
        let mut fc = p2p_fc(vec![
            uni_ltp("d1", "1", NiRole::Root),
            uni_ltp("d3", "1", NiRole::Root),
        ]);
        fc.congruent_paths = false;
        prov.setup_connectivity(&mut fc).await.unwrap();
        assert_eq!(fc.state, ConnectionState::Active);
        // Both directions installed even when planned separately.
        assert_eq!(node.events().len(), 6);
    }
}
