//! Global interface registry.
//!
//! Service-independent UNIs and LTPs live here, reference-counted by the
//! services that use them. Removal of a referenced interface is refused,
//! and removed ids are remembered so topology rescans do not resurrect
//! interfaces an operator deleted on purpose.
//!
//! INNIs come in pairs: registering an LTP whose port carries an
//! infrastructure link also registers the LTP at the far end of that
//! link, and removal removes both.

use std::sync::Arc;

use ce_common::{CeError, CeResult, RefMap, RefMapError};
use dashmap::DashSet;
use tracing::{debug, warn};

use crate::ltp::Ltp;
use crate::ni::Uni;
use crate::topology::TopologyProvider;

/// The global, reference-counted UNI and LTP store.
pub struct CeRegistry {
    topo: Arc<dyn TopologyProvider>,
    ltps: RefMap<Ltp>,
    unis: RefMap<Uni>,
    removed_ltps: DashSet<String>,
    removed_unis: DashSet<String>,
}

impl CeRegistry {
    /// Creates an empty registry over the given topology.
    pub fn new(topo: Arc<dyn TopologyProvider>) -> Self {
        Self {
            topo,
            ltps: RefMap::new(),
            unis: RefMap::new(),
            removed_ltps: DashSet::new(),
            removed_unis: DashSet::new(),
        }
    }

    /// Returns the LTP at the far end of the infrastructure link leaving
    /// `ltp`'s port, when this is a trunk port.
    fn pair_ltp(&self, ltp: &Ltp) -> Option<Ltp> {
        if ltp.inni().is_none() {
            return None;
        }
        let link = self.topo.egress_links(ltp.cp()).into_iter().next()?;
        let mut pair = ltp.to_global();
        match &mut pair.ni {
            crate::ni::NetworkInterface::Inni(inni) => inni.cp = link.dst.clone(),
            _ => return None,
        }
        Some(pair)
    }

    /// Registers a global LTP (and, for INNIs, its link-pair LTP).
    ///
    /// Fails if either id already exists. UNI-backed LTPs also register
    /// the wrapped UNI.
    pub fn add_ltp(&self, ltp: Ltp) -> CeResult<()> {
        let ltp = ltp.to_global();
        let id = ltp.id();
        let pair = self.pair_ltp(&ltp);
        if self.ltps.contains(&id) {
            return Err(CeError::validation(format!("LTP {id} already exists")));
        }
        if let Some(pair) = &pair {
            if self.ltps.contains(&pair.id()) {
                return Err(CeError::validation(format!(
                    "pair LTP {} of {id} already exists",
                    pair.id()
                )));
            }
        }
        if let Some(uni) = ltp.uni() {
            self.add_uni(uni.clone())?;
        }
        self.removed_ltps.remove(&id);
        self.ltps.insert(id.clone(), ltp);
        if let Some(pair) = pair {
            let pair_id = pair.id();
            self.removed_ltps.remove(&pair_id);
            self.ltps.insert(pair_id.clone(), pair);
            debug!(ltp = %id, pair = %pair_id, "registered INNI pair");
        } else {
            debug!(ltp = %id, "registered LTP");
        }
        Ok(())
    }

    /// Registers a global UNI.
    pub fn add_uni(&self, uni: Uni) -> CeResult<()> {
        let id = uni.id();
        let mut global = uni;
        global.role = None;
        global.ce_vlan = None;
        global.ce_vlans.clear();
        if !self.unis.insert(id.clone(), global) {
            return Err(CeError::validation(format!("UNI {id} already exists")));
        }
        self.removed_unis.remove(&id);
        debug!(uni = %id, "registered UNI");
        Ok(())
    }

    /// Removes a global LTP (and its INNI pair). Refuses while referenced.
    pub fn remove_ltp(&self, id: &str) -> CeResult<Ltp> {
        let pair_id = self
            .ltps
            .get_cloned(id)
            .and_then(|ltp| self.pair_ltp(&ltp))
            .map(|p| p.id());
        let removed = self.ltps.try_remove(id).map_err(|e| match e {
            RefMapError::KeyNotFound => CeError::not_found("LTP", id),
            RefMapError::StillReferenced(refs) => CeError::in_use("LTP", id, refs),
            RefMapError::RefCountUnderflow => CeError::validation("LTP refcount underflow"),
        })?;
        self.removed_ltps.insert(id.to_string());
        if removed.is_uni() {
            if let Err(err) = self.remove_uni(id) {
                warn!(ltp = %id, %err, "backing UNI not removed");
            }
        }
        if let Some(pair_id) = pair_id {
            match self.ltps.try_remove(&pair_id) {
                Ok(_) => {
                    self.removed_ltps.insert(pair_id);
                }
                Err(err) => warn!(ltp = %id, pair = %pair_id, %err, "pair LTP not removed"),
            }
        }
        Ok(removed)
    }

    /// Removes a global UNI. Refuses while referenced.
    pub fn remove_uni(&self, id: &str) -> CeResult<Uni> {
        let removed = self.unis.try_remove(id).map_err(|e| match e {
            RefMapError::KeyNotFound => CeError::not_found("UNI", id),
            RefMapError::StillReferenced(refs) => CeError::in_use("UNI", id, refs),
            RefMapError::RefCountUnderflow => CeError::validation("UNI refcount underflow"),
        })?;
        self.removed_unis.insert(id.to_string());
        Ok(removed)
    }

    /// True if the LTP id was explicitly removed by an operator.
    pub fn is_removed_ltp(&self, id: &str) -> bool {
        self.removed_ltps.contains(id)
    }

    /// True if the UNI id was explicitly removed by an operator.
    pub fn is_removed_uni(&self, id: &str) -> bool {
        self.removed_unis.contains(id)
    }

    /// True if a global LTP with this id exists.
    pub fn contains_ltp(&self, id: &str) -> bool {
        self.ltps.contains(id)
    }

    /// True if a global UNI with this id exists.
    pub fn contains_uni(&self, id: &str) -> bool {
        self.unis.contains(id)
    }

    /// Snapshot of the global LTP with this id.
    pub fn ltp(&self, id: &str) -> Option<Ltp> {
        self.ltps.get_cloned(id)
    }

    /// Snapshot of the global UNI with this id.
    pub fn uni(&self, id: &str) -> Option<Uni> {
        self.unis.get_cloned(id)
    }

    /// Snapshots of all global LTPs, ordered by id.
    pub fn ltps(&self) -> Vec<Ltp> {
        self.ltps.values()
    }

    /// Snapshots of all global UNIs, ordered by id.
    pub fn unis(&self) -> Vec<Uni> {
        self.unis.values()
    }

    /// Reference count of a global LTP.
    pub fn ltp_ref_count(&self, id: &str) -> Option<u32> {
        self.ltps.ref_count(id)
    }

    /// Reference count of a global UNI.
    pub fn uni_ref_count(&self, id: &str) -> Option<u32> {
        self.unis.ref_count(id)
    }

    /// Checks whether a service UNI is compatible with the matching
    /// global UNI, without committing anything.
    pub fn validate_uni(&self, service_uni: &Uni) -> bool {
        self.unis
            .with_value(&service_uni.id(), |global| global.can_admit(service_uni))
            .unwrap_or(false)
    }

    /// Admits a service UNI into the matching global UNI, committing its
    /// CE-VLAN and capacity.
    pub fn commit_uni(&self, service_uni: &Uni) -> CeResult<()> {
        let id = service_uni.id();
        self.unis
            .with_value_mut(&id, |global| global.add_service_bwps(service_uni))
            .ok_or_else(|| CeError::not_found("UNI", id))?
    }

    /// Releases a service UNI's commitments from the matching global
    /// UNI.
    pub fn release_uni(&self, service_uni: &Uni) {
        let found = self.unis.with_value_mut(&service_uni.id(), |global| {
            global.remove_service_bwps(service_uni)
        });
        if found.is_none() {
            warn!(uni = %service_uni.id(), "release on unknown UNI");
        }
    }

    /// Marks a global LTP as used by one more service. The backing UNI,
    /// when present, is counted too.
    pub fn acquire_ltp(&self, id: &str) -> CeResult<()> {
        let is_uni = self
            .ltps
            .with_value(id, |l| l.is_uni())
            .ok_or_else(|| CeError::not_found("LTP", id))?;
        self.ltps
            .increment_ref(id)
            .map_err(|_| CeError::not_found("LTP", id))?;
        if is_uni {
            self.unis
                .increment_ref(id)
                .map_err(|_| CeError::not_found("UNI", id))?;
        }
        Ok(())
    }

    /// Releases one service's use of a global LTP.
    pub fn release_ltp(&self, id: &str) {
        let is_uni = self.ltps.with_value(id, |l| l.is_uni()).unwrap_or(false);
        if let Err(err) = self.ltps.decrement_ref(id) {
            warn!(ltp = %id, %err, "LTP refcount release failed");
        }
        if is_uni {
            if let Err(err) = self.unis.decrement_ref(id) {
                warn!(uni = %id, %err, "UNI refcount release failed");
            }
        }
    }

    /// Merges the LTPs of an installed construct into the registry,
    /// registering any interior LTPs seen for the first time.
    pub fn merge_fc_ltps(&self, ltps: &[Ltp]) -> CeResult<()> {
        for ltp in ltps {
            let id = ltp.id();
            if !self.ltps.contains(&id) {
                self.add_ltp(ltp.clone())?;
            }
            self.acquire_ltp(&id)?;
        }
        Ok(())
    }

    /// Reverses `merge_fc_ltps` for a construct being removed.
    pub fn unmerge_fc_ltps(&self, ltps: &[Ltp]) {
        for ltp in ltps {
            self.release_ltp(&ltp.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::ni::{Inni, NetworkInterface};
    use crate::topology::StaticTopology;
    use crate::types::{Bandwidth, BandwidthProfile, ConnectPoint, DeviceId, PortId, VlanId};

    fn cp(dev: &str, port: &str) -> ConnectPoint {
        ConnectPoint::new(DeviceId::new(dev), PortId::new(port))
    }

    fn registry() -> CeRegistry {
        let mut topo = StaticTopology::new();
        topo.add_switch("d1").add_switch("d2");
        topo.add_port("d1", "1", Bandwidth::mbps(1000));
        topo.add_port("d1", "2", Bandwidth::mbps(10_000));
        topo.add_port("d2", "1", Bandwidth::mbps(10_000));
        topo.add_link(("d1", "2"), ("d2", "1"));
        CeRegistry::new(Arc::new(topo))
    }

    fn uni_ltp(dev: &str, port: &str) -> Ltp {
        Ltp::new(
            NetworkInterface::Uni(Uni::new(cp(dev, port), None, None, Bandwidth::mbps(1000))),
            None,
        )
    }

    fn inni_ltp(dev: &str, port: &str) -> Ltp {
        Ltp::new(
            NetworkInterface::Inni(Inni::new(cp(dev, port), None, None, Bandwidth::mbps(10_000))),
            None,
        )
    }

    #[test]
    fn test_uni_ltp_registers_backing_uni() {
        let reg = registry();
        reg.add_ltp(uni_ltp("d1", "1")).unwrap();
        assert!(reg.contains_ltp("d1/1"));
        assert!(reg.contains_uni("d1/1"));
        assert!(reg.add_ltp(uni_ltp("d1", "1")).is_err());
    }

    #[test]
    fn test_inni_registers_link_pair() {
        let reg = registry();
        reg.add_ltp(inni_ltp("d1", "2")).unwrap();
        assert!(reg.contains_ltp("d1/2"));
        assert!(reg.contains_ltp("d2/1"));

        reg.remove_ltp("d1/2").unwrap();
        assert!(!reg.contains_ltp("d1/2"));
        assert!(!reg.contains_ltp("d2/1"));
        assert!(reg.is_removed_ltp("d2/1"));
    }

    #[test]
    fn test_referenced_ltp_not_removable() {
        let reg = registry();
        reg.add_ltp(uni_ltp("d1", "1")).unwrap();
        reg.acquire_ltp("d1/1").unwrap();
        assert_eq!(reg.ltp_ref_count("d1/1"), Some(1));
        assert_eq!(reg.uni_ref_count("d1/1"), Some(1));
        assert!(matches!(
            reg.remove_ltp("d1/1"),
            Err(CeError::ResourceInUse { .. })
        ));
        reg.release_ltp("d1/1");
        reg.remove_ltp("d1/1").unwrap();
        assert!(reg.is_removed_ltp("d1/1"));
        assert!(reg.is_removed_uni("d1/1"));
    }

    #[test]
    fn test_commit_uni_tracks_capacity() {
        let reg = registry();
        reg.add_ltp(uni_ltp("d1", "1")).unwrap();
        let mut svc = Uni::new(cp("d1", "1"), None, None, Bandwidth::mbps(1000));
        svc.add_bwp(BandwidthProfile::evc(
            "EP-Line-1",
            Bandwidth::mbps(400),
            Bandwidth::ZERO,
            0,
            0,
        ));
        reg.commit_uni(&svc).unwrap();
        assert_eq!(reg.uni("d1/1").unwrap().used_capacity, Bandwidth::mbps(400));
        // Same service profile twice is rejected.
        assert!(reg.commit_uni(&svc).is_err());
        reg.release_uni(&svc);
        assert_eq!(reg.uni("d1/1").unwrap().used_capacity, Bandwidth::ZERO);
    }

    #[test]
    fn test_validate_uni_is_pure() {
        let reg = registry();
        reg.add_ltp(uni_ltp("d1", "1")).unwrap();
        let mut svc = Uni::new(cp("d1", "1"), None, None, Bandwidth::mbps(1000));
        svc.add_bwp(BandwidthProfile::evc(
            "EP-Line-1",
            Bandwidth::mbps(100),
            Bandwidth::ZERO,
            0,
            0,
        ));
        assert!(reg.validate_uni(&svc));
        assert_eq!(reg.uni("d1/1").unwrap().used_capacity, Bandwidth::ZERO);
        reg.commit_uni(&svc).unwrap();
        // Duplicate profile id is no longer admissible.
        assert!(!reg.validate_uni(&svc));
        // Unknown UNIs never validate.
        let other = Uni::new(cp("d9", "1"), None, None, Bandwidth::mbps(1000));
        assert!(!reg.validate_uni(&other));
    }

    #[test]
    fn test_duplicate_ce_vlan_not_admissible() {
        let reg = registry();
        reg.add_ltp(uni_ltp("d1", "1")).unwrap();
        let first = Uni::new(cp("d1", "1"), None, VlanId::new(100), Bandwidth::mbps(1000));
        reg.commit_uni(&first).unwrap();

        // A second service with the same customer tag on the same port.
        let second = Uni::new(cp("d1", "1"), None, VlanId::new(100), Bandwidth::mbps(1000));
        assert!(!reg.validate_uni(&second));
        assert!(reg.commit_uni(&second).is_err());

        let other_tag = Uni::new(cp("d1", "1"), None, VlanId::new(200), Bandwidth::mbps(1000));
        assert!(reg.validate_uni(&other_tag));

        reg.release_uni(&first);
        assert!(reg.validate_uni(&second));
    }

    #[test]
    fn test_overcommitted_uni_not_admissible() {
        let reg = registry();
        reg.add_ltp(uni_ltp("d1", "1")).unwrap();
        let mut first = Uni::new(cp("d1", "1"), None, None, Bandwidth::mbps(1000));
        first.add_bwp(BandwidthProfile::evc(
            "EP-Line-1",
            Bandwidth::mbps(900),
            Bandwidth::ZERO,
            0,
            0,
        ));
        reg.commit_uni(&first).unwrap();

        // A second commitment past the port capacity is refused, not
        // clamped.
        let mut second = Uni::new(cp("d1", "1"), None, None, Bandwidth::mbps(1000));
        second.add_bwp(BandwidthProfile::evc(
            "EP-Line-2",
            Bandwidth::mbps(900),
            Bandwidth::ZERO,
            0,
            0,
        ));
        assert!(!reg.validate_uni(&second));
        assert!(reg.commit_uni(&second).is_err());
        assert_eq!(reg.uni("d1/1").unwrap().used_capacity, Bandwidth::mbps(900));
    }

    #[test]
    fn test_merge_unmerge_fc_ltps() {
        let reg = registry();
        let ltps = vec![uni_ltp("d1", "1"), inni_ltp("d1", "2")];
        reg.merge_fc_ltps(&ltps).unwrap();
        assert_eq!(reg.ltp_ref_count("d1/1"), Some(1));
        assert_eq!(reg.ltp_ref_count("d1/2"), Some(1));
        // Pair LTP is registered but unreferenced.
        assert_eq!(reg.ltp_ref_count("d2/1"), Some(0));
        reg.unmerge_fc_ltps(&ltps);
        assert_eq!(reg.ltp_ref_count("d1/1"), Some(0));
    }
}
