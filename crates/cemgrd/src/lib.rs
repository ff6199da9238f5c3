//! cemgrd - Carrier Ethernet service manager daemon
//!
//! Decomposes MEF-style service requests (EVCs) into per-segment
//! forwarding constructs, admits them against interface bandwidth and
//! tag budgets, and installs connectivity through pluggable node and
//! transport drivers.

mod allocator;
mod config;
mod connection;
mod evc;
mod fc;
mod fragmenter;
mod ltp;
mod manager;
mod ni;
mod node;
mod optical;
mod planner;
mod registry;
mod topology;
mod types;
mod validator;

pub use allocator::IdAllocator;
pub use config::{load_port_vlans, parse_port_vlans, PortVlanConfig};
pub use connection::{ConnectionState, ConnectionType};
pub use evc::{Evc, DEFAULT_MAX_LATENCY, DEFAULT_MAX_NUM_UNI};
pub use fc::Fc;
pub use fragmenter::{fragment_evc, single_fc};
pub use ltp::{Ltp, LtpRole};
pub use manager::CeManager;
pub use ni::{Enni, Inni, NetworkInterface, NiKind, NiRole, Uni};
pub use node::{ForwardingEvent, LoggingPacketNode, PacketNodeDriver, RecordingPacketNode};
pub use optical::{
    NullTransport, TransportConnectivity, TransportController, TransportId,
    DEFAULT_CONNECT_TIMEOUT,
};
pub use planner::Provisioner;
pub use registry::CeRegistry;
pub use topology::{
    Device, Link, LinkWeigher, Path, Port, SpanningTreeWeigher, StaticTopology, TopologyProvider,
};
pub use types::{
    Bandwidth, BandwidthProfile, BwpType, ConnectPoint, DeviceId, PortId, VlanId,
};
