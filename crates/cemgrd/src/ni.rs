//! Network interfaces: UNI, INNI, ENNI and the synthetic generic
//! interface used at interior forwarding hops.
//!
//! Interface identity is the connect point; two interfaces at the same
//! device/port are the same interface regardless of variant. Ordering is
//! by variant rank then connect point so interface sets iterate
//! deterministically.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};

use ce_common::{CeError, CeResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{Bandwidth, BandwidthProfile, BwpType, ConnectPoint, VlanId};

/// Role of an interface within a service or in the global topology.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum NiRole {
    /// Root of a rooted-multipoint service (UNI).
    Root,
    /// Leaf of a rooted-multipoint service (UNI).
    Leaf,
    /// Hub side of an INNI pair.
    Hub,
    /// Spoke side of an INNI pair.
    Spoke,
    /// ENNI trunk.
    Trunk,
}

/// Interface kind, used as a validated hint when deriving interfaces
/// from topology attachment points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NiKind {
    /// Customer attachment point.
    Uni,
    /// Intra-provider trunk endpoint.
    Inni,
    /// Inter-operator trunk endpoint.
    Enni,
}

/// A user-network interface: customer attachment point with CE-VLANs and
/// bandwidth profiles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Uni {
    /// Attachment point.
    pub cp: ConnectPoint,
    /// Identifier from configuration, when it differs from `cp.id()`.
    pub cfg_id: Option<String>,
    /// Service role; `None` for global (service-independent) UNIs.
    pub role: Option<NiRole>,
    /// CE-VLAN the service matches at this UNI; `None` for untagged.
    pub ce_vlan: Option<VlanId>,
    /// CE-VLANs committed by installed services; populated only on the
    /// global (service-independent) UNI.
    pub ce_vlans: BTreeSet<VlanId>,
    /// Port capacity.
    pub capacity: Bandwidth,
    /// Capacity committed to installed services, always `<= capacity`.
    pub used_capacity: Bandwidth,
    /// Bandwidth profiles keyed by type then profile id. A service-level
    /// UNI carries at most one profile per type; the global UNI
    /// accumulates one per service.
    pub bwps: BTreeMap<BwpType, BTreeMap<String, BandwidthProfile>>,
}

impl Uni {
    /// Creates a service-level UNI.
    pub fn new(
        cp: ConnectPoint,
        role: Option<NiRole>,
        ce_vlan: Option<VlanId>,
        capacity: Bandwidth,
    ) -> Self {
        Self {
            cp,
            cfg_id: None,
            role,
            ce_vlan,
            ce_vlans: BTreeSet::new(),
            capacity,
            used_capacity: Bandwidth::ZERO,
            bwps: BTreeMap::new(),
        }
    }

    /// Canonical identifier (`<deviceId>/<port>`).
    pub fn id(&self) -> String {
        self.cp.id()
    }

    /// True if this UNI matches untagged customer traffic.
    pub fn is_untagged(&self) -> bool {
        self.ce_vlan.is_none()
    }

    /// Adds a bandwidth profile without capacity checks.
    pub fn add_bwp(&mut self, bwp: BandwidthProfile) {
        self.bwps
            .entry(bwp.bwp_type)
            .or_default()
            .insert(bwp.id.clone(), bwp);
    }

    /// Returns the single profile of a service-level UNI, if any.
    pub fn service_bwp(&self) -> Option<&BandwidthProfile> {
        self.bwps.values().flat_map(|m| m.values()).next()
    }

    /// Returns what blocks admitting service UNI `other` here, if
    /// anything does. `None` means admissible.
    fn admission_conflict(&self, other: &Uni) -> Option<String> {
        if let Some(tag) = other.ce_vlan {
            if self.ce_vlans.contains(&tag) {
                return Some(format!(
                    "CE-VLAN {tag} is already in use on UNI {}",
                    self.id()
                ));
            }
        }
        let Some(bwp) = other.service_bwp() else {
            return None;
        };
        let has_any = self.bwps.values().any(|m| !m.is_empty());
        if bwp.bwp_type == BwpType::Interface && has_any {
            return Some(format!(
                "interface-wide profile {} conflicts with profiles on UNI {}",
                bwp.id,
                self.id()
            ));
        }
        if self
            .bwps
            .iter()
            .any(|(ty, m)| *ty != bwp.bwp_type && !m.is_empty())
        {
            return Some(format!(
                "profile {} ({:?}) does not match the profile type on UNI {}",
                bwp.id,
                bwp.bwp_type,
                self.id()
            ));
        }
        if self
            .bwps
            .get(&bwp.bwp_type)
            .is_some_and(|m| m.contains_key(&bwp.id))
        {
            return Some(format!(
                "profile {} already exists on UNI {}",
                bwp.id,
                self.id()
            ));
        }
        if self.used_capacity.as_bps().saturating_add(bwp.cir.as_bps()) > self.capacity.as_bps() {
            return Some(format!(
                "insufficient capacity on UNI {}: {} committed of {}, requested {}",
                self.id(),
                self.used_capacity,
                self.capacity,
                bwp.cir
            ));
        }
        None
    }

    /// Checks whether service UNI `other` could be admitted here, without
    /// mutating anything: its CE-VLAN must be unused, its profile must
    /// match the type already present (an interface-wide profile is
    /// exclusive with everything else), and enough capacity headroom must
    /// remain for its committed rate.
    pub fn can_admit(&self, other: &Uni) -> bool {
        self.admission_conflict(other).is_none()
    }

    /// Admits service UNI `other` into this global UNI, recording its
    /// CE-VLAN and committing its committed rate.
    ///
    /// Admission is all-or-nothing: a used CE-VLAN, a profile conflict or
    /// missing capacity headroom rejects the endpoint. Only the excess
    /// rate is clamped, to the headroom left after the committed rate.
    pub fn add_service_bwps(&mut self, other: &Uni) -> CeResult<()> {
        if let Some(conflict) = self.admission_conflict(other) {
            return Err(CeError::validation(conflict));
        }
        if let Some(tag) = other.ce_vlan {
            self.ce_vlans.insert(tag);
        }
        let Some(bwp) = other.service_bwp() else {
            return Ok(());
        };
        let mut bwp = bwp.clone();
        let headroom = self.capacity.sub_clamped(bwp.cir);
        if bwp.eir > headroom {
            warn!(
                uni = %self.id(),
                bwp = %bwp.id,
                eir = %bwp.eir,
                headroom = %headroom,
                "excess rate exceeds port capacity; clamped"
            );
            bwp.eir = headroom;
        }
        let slot = self.bwps.entry(bwp.bwp_type).or_default();
        slot.insert(bwp.id.clone(), bwp.clone());
        let before = self.used_capacity;
        self.used_capacity = self.used_capacity.add_clamped(bwp.cir, self.capacity);
        debug!(
            uni = %self.id(),
            bwp = %bwp.id,
            used = %self.used_capacity,
            "committed bandwidth ({before} before)"
        );
        Ok(())
    }

    /// Releases the commitments of service UNI `other` from this global
    /// UNI: its CE-VLAN and the committed capacity.
    pub fn remove_service_bwps(&mut self, other: &Uni) {
        if let Some(tag) = other.ce_vlan {
            self.ce_vlans.remove(&tag);
        }
        let Some(bwp) = other.service_bwp() else {
            return;
        };
        let removed = self
            .bwps
            .get_mut(&bwp.bwp_type)
            .and_then(|m| m.remove(&bwp.id));
        if let Some(stored) = removed {
            self.used_capacity = self.used_capacity.sub_clamped(stored.cir);
        }
    }
}

/// An internal network-to-network interface: one side of an intra-provider
/// trunk link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inni {
    /// Attachment point.
    pub cp: ConnectPoint,
    /// Identifier from configuration.
    pub cfg_id: Option<String>,
    /// Hub or spoke side; `None` for global interfaces.
    pub role: Option<NiRole>,
    /// S-TAG carried on the trunk for a given service.
    pub s_vlan: Option<VlanId>,
    /// Port capacity.
    pub capacity: Bandwidth,
    /// Capacity committed to installed services.
    pub used_capacity: Bandwidth,
}

impl Inni {
    /// Creates an INNI.
    pub fn new(
        cp: ConnectPoint,
        role: Option<NiRole>,
        s_vlan: Option<VlanId>,
        capacity: Bandwidth,
    ) -> Self {
        Self {
            cp,
            cfg_id: None,
            role,
            s_vlan,
            capacity,
            used_capacity: Bandwidth::ZERO,
        }
    }

    /// Canonical identifier.
    pub fn id(&self) -> String {
        self.cp.id()
    }
}

/// An external network-to-network interface towards a peer operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enni {
    /// Attachment point.
    pub cp: ConnectPoint,
    /// Identifier from configuration.
    pub cfg_id: Option<String>,
    /// Trunk role; `None` for global interfaces.
    pub role: Option<NiRole>,
    /// S-TAG exchanged with the peer operator.
    pub s_vlan: Option<VlanId>,
    /// Port capacity.
    pub capacity: Bandwidth,
    /// Capacity committed to installed services.
    pub used_capacity: Bandwidth,
}

impl Enni {
    /// Creates an ENNI.
    pub fn new(
        cp: ConnectPoint,
        role: Option<NiRole>,
        s_vlan: Option<VlanId>,
        capacity: Bandwidth,
    ) -> Self {
        Self {
            cp,
            cfg_id: None,
            role,
            s_vlan,
            capacity,
            used_capacity: Bandwidth::ZERO,
        }
    }

    /// Canonical identifier.
    pub fn id(&self) -> String {
        self.cp.id()
    }
}

/// A network interface participating in a forwarding construct.
///
/// `Generic` interfaces are synthesized by the planner at interior hops
/// of a path; they carry no tag or bandwidth state of their own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NetworkInterface {
    /// Customer attachment point.
    Uni(Uni),
    /// Intra-provider trunk endpoint.
    Inni(Inni),
    /// Inter-operator trunk endpoint.
    Enni(Enni),
    /// Interior transit hop.
    Generic(ConnectPoint),
}

impl NetworkInterface {
    /// Returns the attachment point.
    pub fn cp(&self) -> &ConnectPoint {
        match self {
            NetworkInterface::Uni(u) => &u.cp,
            NetworkInterface::Inni(i) => &i.cp,
            NetworkInterface::Enni(e) => &e.cp,
            NetworkInterface::Generic(cp) => cp,
        }
    }

    /// Canonical identifier (`<deviceId>/<port>`).
    pub fn id(&self) -> String {
        self.cp().id()
    }

    /// Returns the service role, if any.
    pub fn role(&self) -> Option<NiRole> {
        match self {
            NetworkInterface::Uni(u) => u.role,
            NetworkInterface::Inni(i) => i.role,
            NetworkInterface::Enni(e) => e.role,
            NetworkInterface::Generic(_) => None,
        }
    }

    /// Returns the S-TAG for trunk interfaces.
    pub fn s_vlan(&self) -> Option<VlanId> {
        match self {
            NetworkInterface::Inni(i) => i.s_vlan,
            NetworkInterface::Enni(e) => e.s_vlan,
            _ => None,
        }
    }

    fn variant_rank(&self) -> u8 {
        match self {
            NetworkInterface::Uni(_) => 0,
            NetworkInterface::Inni(_) => 1,
            NetworkInterface::Enni(_) => 2,
            NetworkInterface::Generic(_) => 3,
        }
    }
}

impl fmt::Display for NetworkInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            NetworkInterface::Uni(_) => "UNI",
            NetworkInterface::Inni(_) => "INNI",
            NetworkInterface::Enni(_) => "ENNI",
            NetworkInterface::Generic(_) => "NI",
        };
        write!(f, "{}:{}", kind, self.cp())
    }
}

// Identity is (variant, connect point); per-service state does not
// distinguish interfaces.
impl PartialEq for NetworkInterface {
    fn eq(&self, other: &Self) -> bool {
        self.variant_rank() == other.variant_rank() && self.cp() == other.cp()
    }
}

impl Eq for NetworkInterface {}

impl Hash for NetworkInterface {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.variant_rank().hash(state);
        self.cp().hash(state);
    }
}

impl Ord for NetworkInterface {
    fn cmp(&self, other: &Self) -> Ordering {
        self.variant_rank()
            .cmp(&other.variant_rank())
            .then_with(|| self.cp().cmp(other.cp()))
    }
}

impl PartialOrd for NetworkInterface {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
