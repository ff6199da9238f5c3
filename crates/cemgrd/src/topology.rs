//! Topology view: devices, ports, links, paths.
//!
//! The manager and planner only see the network through `TopologyProvider`,
//! so tests drive them with a `StaticTopology` built in memory. Link
//! weighers follow the convention that a negative weight marks a link as
//! unusable for the path being computed.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;

use crate::types::{Bandwidth, ConnectPoint, DeviceId, PortId};

/// A network element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Device identifier.
    pub id: DeviceId,
    /// True for packet switches; non-switch devices (e.g. optical gear)
    /// cannot host UNIs and receive no forwarding rules.
    pub is_switch: bool,
}

/// A port on a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Port {
    /// The device/port pair.
    pub cp: ConnectPoint,
    /// Port line rate; used as the capacity of interfaces created on it.
    pub speed: Bandwidth,
    /// Administratively and operationally up.
    pub enabled: bool,
    /// Logical ports (LAGs, internal ports) cannot host interfaces.
    pub is_logical: bool,
}

/// A unidirectional link between two connect points.
///
/// Edge links (the virtual hop between a host-facing port and its device)
/// are degenerate: both endpoints are the same connect point.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Link {
    /// Link source.
    pub src: ConnectPoint,
    /// Link destination.
    pub dst: ConnectPoint,
}

impl Link {
    /// Creates an infrastructure link.
    pub fn new(src: ConnectPoint, dst: ConnectPoint) -> Self {
        Self { src, dst }
    }

    /// Creates the degenerate edge link for a service port.
    pub fn edge(cp: ConnectPoint) -> Self {
        Self {
            src: cp.clone(),
            dst: cp,
        }
    }

    /// True if this is a degenerate edge link.
    pub fn is_edge(&self) -> bool {
        self.src == self.dst
    }

    /// Returns the reversed link.
    pub fn reversed(&self) -> Self {
        Self {
            src: self.dst.clone(),
            dst: self.src.clone(),
        }
    }
}

/// An ordered list of links from a source device to a destination device.
pub type Path = Vec<Link>;

/// Assigns a traversal cost to links during path computation.
///
/// A negative weight marks the link as unusable for this computation.
pub trait LinkWeigher: Send + Sync {
    /// Returns the cost of traversing `link`.
    fn weight(&self, link: &Link) -> f64;
}

/// Read-only view of the network used by service decomposition.
pub trait TopologyProvider: Send + Sync {
    /// Returns the device with the given id.
    fn device(&self, id: &DeviceId) -> Option<Device>;

    /// Returns all devices, ordered by id.
    fn devices(&self) -> Vec<Device>;

    /// Returns the port at the given connect point.
    fn port(&self, cp: &ConnectPoint) -> Option<Port>;

    /// Returns all ports of a device, ordered by port id.
    fn device_ports(&self, id: &DeviceId) -> Vec<Port>;

    /// Returns infrastructure links whose source is the given connect point.
    fn egress_links(&self, cp: &ConnectPoint) -> Vec<Link>;

    /// Returns infrastructure links whose destination is the given connect
    /// point.
    fn ingress_links(&self, cp: &ConnectPoint) -> Vec<Link>;

    /// Returns a shortest path (by hop count) between two devices, if any.
    fn shortest_path(&self, src: &DeviceId, dst: &DeviceId) -> Option<Path>;

    /// Returns a least-cost path between two devices under `weigher`,
    /// skipping links the weigher marks unusable.
    fn weighted_path(&self, src: &DeviceId, dst: &DeviceId, weigher: &dyn LinkWeigher)
        -> Option<Path>;

    /// True if the link belongs to the broadcast tree of the topology.
    /// Multipoint services are constrained to such links so frames cannot
    /// loop.
    fn is_broadcast_point(&self, link: &Link) -> bool;
}

/// Weigher that confines multipoint paths to the topology broadcast tree.
///
/// Links outside the tree get a negative weight and are never traversed,
/// so every multipoint service shares the same loop-free link set.
pub struct SpanningTreeWeigher<'a> {
    topo: &'a dyn TopologyProvider,
}

impl<'a> SpanningTreeWeigher<'a> {
    /// Creates a weigher over the given topology.
    pub fn new(topo: &'a dyn TopologyProvider) -> Self {
        Self { topo }
    }
}

impl LinkWeigher for SpanningTreeWeigher<'_> {
    fn weight(&self, link: &Link) -> f64 {
        if link.is_edge() || self.topo.is_broadcast_point(link) {
            1.0
        } else {
            -1.0
        }
    }
}

/// In-memory topology with BFS path computation.
///
/// The broadcast tree is a BFS spanning tree rooted at the smallest device
/// id, recomputed lazily whenever the link set changes.
pub struct StaticTopology {
    devices: BTreeMap<DeviceId, Device>,
    ports: BTreeMap<ConnectPoint, Port>,
    links: BTreeSet<Link>,
    broadcast: Mutex<Option<BTreeSet<Link>>>,
}

impl Default for StaticTopology {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticTopology {
    /// Creates an empty topology.
    pub fn new() -> Self {
        Self {
            devices: BTreeMap::new(),
            ports: BTreeMap::new(),
            links: BTreeSet::new(),
            broadcast: Mutex::new(None),
        }
    }

    /// Adds a packet switch.
    pub fn add_switch(&mut self, id: &str) -> &mut Self {
        self.add_device(id, true)
    }

    /// Adds a device.
    pub fn add_device(&mut self, id: &str, is_switch: bool) -> &mut Self {
        let id = DeviceId::new(id);
        self.devices.insert(id.clone(), Device { id, is_switch });
        self
    }

    /// Adds an enabled physical port with the given speed.
    pub fn add_port(&mut self, device: &str, port: &str, speed: Bandwidth) -> &mut Self {
        let cp = ConnectPoint::new(DeviceId::new(device), PortId::new(port));
        self.ports.insert(
            cp.clone(),
            Port {
                cp,
                speed,
                enabled: true,
                is_logical: false,
            },
        );
        self
    }

    /// Adds a port with full control over its attributes.
    pub fn add_port_full(&mut self, port: Port) -> &mut Self {
        self.ports.insert(port.cp.clone(), port);
        self
    }

    /// Adds a bidirectional infrastructure link between two connect points.
    pub fn add_link(&mut self, a: (&str, &str), b: (&str, &str)) -> &mut Self {
        let src = ConnectPoint::new(DeviceId::new(a.0), PortId::new(a.1));
        let dst = ConnectPoint::new(DeviceId::new(b.0), PortId::new(b.1));
        self.links.insert(Link::new(src.clone(), dst.clone()));
        self.links.insert(Link::new(dst, src));
        *self.broadcast.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self
    }

    fn neighbors(&self, dev: &DeviceId) -> Vec<&Link> {
        self.links
            .iter()
            .filter(|l| &l.src.device == dev)
            .collect()
    }

    /// BFS over devices; `usable` filters candidate links.
    fn bfs_path(&self, src: &DeviceId, dst: &DeviceId, usable: impl Fn(&Link) -> bool)
        -> Option<Path> {
        if src == dst {
            return Some(Vec::new());
        }
        let mut prev: HashMap<DeviceId, Link> = HashMap::new();
        let mut queue = VecDeque::from([src.clone()]);
        while let Some(dev) = queue.pop_front() {
            for link in self.neighbors(&dev) {
                if !usable(link) || prev.contains_key(&link.dst.device) || &link.dst.device == src {
                    continue;
                }
                prev.insert(link.dst.device.clone(), (*link).clone());
                if &link.dst.device == dst {
                    let mut path = Vec::new();
                    let mut cur = dst.clone();
                    while &cur != src {
                        let hop = prev.remove(&cur)?;
                        cur = hop.src.device.clone();
                        path.push(hop);
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(link.dst.device.clone());
            }
        }
        None
    }

    fn broadcast_tree(&self) -> BTreeSet<Link> {
        let mut guard = self.broadcast.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tree) = guard.as_ref() {
            return tree.clone();
        }
        let mut tree = BTreeSet::new();
        if let Some(root) = self.devices.keys().next() {
            let mut visited = BTreeSet::from([root.clone()]);
            let mut queue = VecDeque::from([root.clone()]);
            while let Some(dev) = queue.pop_front() {
                for link in self.neighbors(&dev) {
                    if visited.insert(link.dst.device.clone()) {
                        tree.insert((*link).clone());
                        tree.insert(link.reversed());
                        queue.push_back(link.dst.device.clone());
                    }
                }
            }
        }
        *guard = Some(tree.clone());
        tree
    }
}

impl TopologyProvider for StaticTopology {
    fn device(&self, id: &DeviceId) -> Option<Device> {
        self.devices.get(id).cloned()
    }

    fn devices(&self) -> Vec<Device> {
        self.devices.values().cloned().collect()
    }

    fn port(&self, cp: &ConnectPoint) -> Option<Port> {
        self.ports.get(cp).cloned()
    }

    fn device_ports(&self, id: &DeviceId) -> Vec<Port> {
        self.ports
            .values()
            .filter(|p| &p.cp.device == id)
            .cloned()
            .collect()
    }

    fn egress_links(&self, cp: &ConnectPoint) -> Vec<Link> {
        self.links.iter().filter(|l| &l.src == cp).cloned().collect()
    }

    fn ingress_links(&self, cp: &ConnectPoint) -> Vec<Link> {
        self.links.iter().filter(|l| &l.dst == cp).cloned().collect()
    }

    fn shortest_path(&self, src: &DeviceId, dst: &DeviceId) -> Option<Path> {
        self.bfs_path(src, dst, |_| true)
    }

    fn weighted_path(
        &self,
        src: &DeviceId,
        dst: &DeviceId,
        weigher: &dyn LinkWeigher,
    ) -> Option<Path> {
        self.bfs_path(src, dst, |link| weigher.weight(link) >= 0.0)
    }

    fn is_broadcast_point(&self, link: &Link) -> bool {
        self.broadcast_tree().contains(link)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn cp(dev: &str, port: &str) -> ConnectPoint {
        ConnectPoint::new(DeviceId::new(dev), PortId::new(port))
    }

    /// d1 -- d2 -- d3, plus a shortcut d1 -- d3 closing a loop.
    fn ring() -> StaticTopology {
        let mut topo = StaticTopology::new();
        topo.add_switch("d1").add_switch("d2").add_switch("d3");
        topo.add_link(("d1", "2"), ("d2", "1"));
        topo.add_link(("d2", "2"), ("d3", "1"));
        topo.add_link(("d1", "3"), ("d3", "2"));
        topo
    }

    #[test]
    fn test_shortest_path_prefers_direct_link() {
        let topo = ring();
        let path = topo
            .shortest_path(&DeviceId::new("d1"), &DeviceId::new("d3"))
            .unwrap();
        assert_eq!(path, vec![Link::new(cp("d1", "3"), cp("d3", "2"))]);
    }

    #[test]
    fn test_shortest_path_same_device_is_empty() {
        let topo = ring();
        let path = topo
            .shortest_path(&DeviceId::new("d1"), &DeviceId::new("d1"))
            .unwrap();
        assert!(path.is_empty());
    }

    #[test]
    fn test_no_path_between_disconnected_devices() {
        let mut topo = StaticTopology::new();
        topo.add_switch("d1").add_switch("d9");
        assert!(topo
            .shortest_path(&DeviceId::new("d1"), &DeviceId::new("d9"))
            .is_none());
    }

    #[test]
    fn test_spanning_tree_excludes_loop_link() {
        let topo = ring();
        // BFS from d1 reaches d2 and d3 directly, so the d2--d3 link
        // closes the loop and stays out of the tree.
        assert!(topo.is_broadcast_point(&Link::new(cp("d1", "2"), cp("d2", "1"))));
        assert!(topo.is_broadcast_point(&Link::new(cp("d1", "3"), cp("d3", "2"))));
        assert!(!topo.is_broadcast_point(&Link::new(cp("d2", "2"), cp("d3", "1"))));

        let weigher = SpanningTreeWeigher::new(&topo);
        assert_eq!(weigher.weight(&Link::new(cp("d2", "2"), cp("d3", "1"))), -1.0);
        assert_eq!(weigher.weight(&Link::edge(cp("d2", "7"))), 1.0);

        // Weighted d2 -> d3 must detour through d1.
        let path = topo
            .weighted_path(&DeviceId::new("d2"), &DeviceId::new("d3"), &weigher)
            .unwrap();
        assert_eq!(path.len(), 2);
        assert_eq!(path[0].src.device, DeviceId::new("d2"));
        assert_eq!(path[1].dst.device, DeviceId::new("d3"));
    }

    #[test]
    fn test_edge_link_is_degenerate() {
        let edge = Link::edge(cp("d1", "1"));
        assert!(edge.is_edge());
        assert_eq!(edge.reversed(), edge);
    }
}
