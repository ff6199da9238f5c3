//! Link termination points.
//!
//! An LTP wraps a network interface and records how the port terminates
//! links: towards a customer (UNI), inside the provider network (INNI) or
//! towards a peer operator (ENNI). Forwarding constructs carry LTPs; the
//! global registry stores their service-independent form.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ni::{Enni, Inni, NetworkInterface, NiRole, Uni};
use crate::types::ConnectPoint;

/// Position of an LTP within a forwarding construct or the global
/// topology.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum LtpRole {
    /// Customer-facing root endpoint.
    Root,
    /// Customer-facing leaf endpoint.
    Leaf,
    /// INNI hub side.
    Hub,
    /// INNI spoke side.
    Spoke,
    /// ENNI trunk.
    Trunk,
    /// Interior hop with no customer or trunk semantics.
    Transit,
}

impl LtpRole {
    /// Maps a network-interface role to the equivalent LTP role.
    pub fn from_ni_role(role: NiRole) -> Self {
        match role {
            NiRole::Root => LtpRole::Root,
            NiRole::Leaf => LtpRole::Leaf,
            NiRole::Hub => LtpRole::Hub,
            NiRole::Spoke => LtpRole::Spoke,
            NiRole::Trunk => LtpRole::Trunk,
        }
    }
}

/// A link termination point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ltp {
    /// Identifier from configuration, when it differs from the canonical
    /// id.
    pub cfg_id: Option<String>,
    /// Position within the owning construct; `None` for global LTPs.
    pub role: Option<LtpRole>,
    /// The terminated interface.
    pub ni: NetworkInterface,
}

impl Ltp {
    /// Creates an LTP over an interface.
    pub fn new(ni: NetworkInterface, role: Option<LtpRole>) -> Self {
        Self {
            cfg_id: None,
            role,
            ni,
        }
    }

    /// Creates a service-scoped transit LTP at an interior connect point,
    /// typed like the matching global LTP when one exists.
    pub fn transit(cp: ConnectPoint, global: Option<&Ltp>, role: Option<LtpRole>) -> Self {
        let ni = match global.map(|l| &l.ni) {
            Some(NetworkInterface::Inni(inni)) => NetworkInterface::Inni(inni.clone()),
            Some(NetworkInterface::Enni(enni)) => NetworkInterface::Enni(enni.clone()),
            _ => NetworkInterface::Generic(cp),
        };
        Self {
            cfg_id: None,
            role,
            ni,
        }
    }

    /// Canonical identifier (`<deviceId>/<port>`).
    pub fn id(&self) -> String {
        self.ni.id()
    }

    /// Returns the attachment point.
    pub fn cp(&self) -> &ConnectPoint {
        self.ni.cp()
    }

    /// True if this LTP terminates a customer interface.
    pub fn is_uni(&self) -> bool {
        matches!(self.ni, NetworkInterface::Uni(_))
    }

    /// Returns the wrapped UNI, if this is a customer LTP.
    pub fn uni(&self) -> Option<&Uni> {
        match &self.ni {
            NetworkInterface::Uni(u) => Some(u),
            _ => None,
        }
    }

    /// Returns the wrapped ENNI, if any.
    pub fn enni(&self) -> Option<&Enni> {
        match &self.ni {
            NetworkInterface::Enni(e) => Some(e),
            _ => None,
        }
    }

    /// Returns the wrapped INNI, if any.
    pub fn inni(&self) -> Option<&Inni> {
        match &self.ni {
            NetworkInterface::Inni(i) => Some(i),
            _ => None,
        }
    }

    /// Returns the service-independent form stored in the global
    /// registry: no role, no per-service tags or profiles.
    pub fn to_global(&self) -> Ltp {
        let ni = match &self.ni {
            NetworkInterface::Uni(u) => {
                let mut u = u.clone();
                u.role = None;
                u.ce_vlan = None;
                u.ce_vlans.clear();
                u.used_capacity = crate::types::Bandwidth::ZERO;
                u.bwps.clear();
                NetworkInterface::Uni(u)
            }
            NetworkInterface::Inni(i) => {
                let mut i = i.clone();
                i.role = None;
                i.s_vlan = None;
                i.used_capacity = crate::types::Bandwidth::ZERO;
                NetworkInterface::Inni(i)
            }
            NetworkInterface::Enni(e) => {
                let mut e = e.clone();
                e.role = None;
                e.s_vlan = None;
                e.used_capacity = crate::types::Bandwidth::ZERO;
                NetworkInterface::Enni(e)
            }
            NetworkInterface::Generic(cp) => NetworkInterface::Generic(cp.clone()),
        };
        Ltp {
            cfg_id: self.cfg_id.clone(),
            role: None,
            ni,
        }
    }
}

impl fmt::Display for Ltp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.role {
            Some(role) => write!(f, "LTP:{}({:?})", self.id(), role),
            None => write!(f, "LTP:{}", self.id()),
        }
    }
}

// LTP identity follows interface identity.
impl PartialEq for Ltp {
    fn eq(&self, other: &Self) -> bool {
        self.ni == other.ni
    }
}

impl Eq for Ltp {}

impl std::hash::Hash for Ltp {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ni.hash(state);
    }
}
