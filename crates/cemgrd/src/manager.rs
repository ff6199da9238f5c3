//! Service orchestration: the public install/remove surface.
//!
//! `CeManager` ties the pieces together: it derives global interfaces
//! from the topology, validates and decomposes service requests,
//! allocates tags, drives the provisioner and keeps the registry's
//! reference counts consistent. Every failure path releases exactly
//! what it committed, so a rejected request leaves no residue.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use ce_common::{CeError, CeResult};
use dashmap::DashMap;
use itertools::Itertools;
use tracing::{debug, info, warn};

use crate::allocator::IdAllocator;
use crate::connection::ConnectionState;
use crate::evc::Evc;
use crate::fc::Fc;
use crate::fragmenter::{fragment_evc, single_fc};
use crate::ltp::Ltp;
use crate::ni::{NetworkInterface, NiKind, Uni};
use crate::node::PacketNodeDriver;
use crate::optical::TransportController;
use crate::planner::Provisioner;
use crate::registry::CeRegistry;
use crate::topology::TopologyProvider;
use crate::types::{ConnectPoint, VlanId};
use crate::validator::{validate_evc, validate_fc};

/// The carrier-ethernet service manager.
pub struct CeManager {
    topo: Arc<dyn TopologyProvider>,
    node: Arc<dyn PacketNodeDriver>,
    provisioner: Provisioner,
    registry: CeRegistry,
    evcs: DashMap<String, Evc>,
    fcs: DashMap<String, Fc>,
    vlan_ids: Mutex<IdAllocator>,
    short_ids: Mutex<IdAllocator>,
    port_vlans: DashMap<ConnectPoint, VlanId>,
    fragmentation: AtomicBool,
    prev_fragmentation: AtomicBool,
}

impl CeManager {
    /// Creates a manager over the given topology and drivers.
    pub fn new(
        topo: Arc<dyn TopologyProvider>,
        node: Arc<dyn PacketNodeDriver>,
        transport: Arc<dyn TransportController>,
    ) -> Self {
        Self {
            provisioner: Provisioner::new(topo.clone(), node.clone(), transport),
            registry: CeRegistry::new(topo.clone()),
            topo,
            node,
            evcs: DashMap::new(),
            fcs: DashMap::new(),
            vlan_ids: Mutex::new(IdAllocator::vlan()),
            short_ids: Mutex::new(IdAllocator::evc_short_id()),
            port_vlans: DashMap::new(),
            fragmentation: AtomicBool::new(false),
            prev_fragmentation: AtomicBool::new(false),
        }
    }

    /// The underlying provisioner, for transport tuning.
    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    /// The global interface registry.
    pub fn registry(&self) -> &CeRegistry {
        &self.registry
    }

    // ---- global interface management -------------------------------------

    /// Builds a global UNI for a connect point, checking that the device
    /// is a packet switch and the port can host services.
    pub fn generate_uni(&self, cp: &ConnectPoint) -> CeResult<Uni> {
        let port = self.eligible_port(cp)?;
        Ok(Uni::new(cp.clone(), None, None, port.speed))
    }

    /// Builds a global LTP for a connect point. Ports with
    /// infrastructure links become INNIs, link-free ports become UNIs.
    pub fn generate_ltp(&self, cp: &ConnectPoint) -> CeResult<Ltp> {
        let linked = !self.topo.egress_links(cp).is_empty()
            || !self.topo.ingress_links(cp).is_empty();
        self.generate_ltp_typed(cp, if linked { NiKind::Inni } else { NiKind::Uni })
    }

    /// Builds a global LTP of the requested kind, validating the hint
    /// against the port's links rather than trusting it: UNIs need a
    /// link-free port, trunk interfaces a linked one.
    pub fn generate_ltp_typed(&self, cp: &ConnectPoint, kind: NiKind) -> CeResult<Ltp> {
        let port = self.eligible_port(cp)?;
        let linked = !self.topo.egress_links(cp).is_empty()
            || !self.topo.ingress_links(cp).is_empty();
        let ni = match kind {
            NiKind::Uni if linked => {
                return Err(CeError::validation(format!(
                    "port {cp} carries infrastructure links; cannot host a UNI"
                )))
            }
            NiKind::Uni => NetworkInterface::Uni(Uni::new(cp.clone(), None, None, port.speed)),
            NiKind::Inni | NiKind::Enni if !linked => {
                return Err(CeError::validation(format!(
                    "port {cp} has no infrastructure links; cannot host a trunk interface"
                )))
            }
            NiKind::Inni => {
                NetworkInterface::Inni(crate::ni::Inni::new(cp.clone(), None, None, port.speed))
            }
            NiKind::Enni => {
                NetworkInterface::Enni(crate::ni::Enni::new(cp.clone(), None, None, port.speed))
            }
        };
        Ok(Ltp::new(ni, None))
    }

    fn eligible_port(&self, cp: &ConnectPoint) -> CeResult<crate::topology::Port> {
        let device = self
            .topo
            .device(&cp.device)
            .ok_or_else(|| CeError::not_found("device", cp.device.to_string()))?;
        if !device.is_switch {
            return Err(CeError::validation(format!(
                "device {} is not a packet switch",
                cp.device
            )));
        }
        let port = self
            .topo
            .port(cp)
            .ok_or_else(|| CeError::not_found("port", cp.id()))?;
        if !port.enabled {
            return Err(CeError::validation(format!("port {cp} is disabled")));
        }
        if port.is_logical {
            return Err(CeError::validation(format!("port {cp} is logical")));
        }
        Ok(port)
    }

    /// Derives the potential UNIs from the current topology.
    ///
    /// `exclude_added` drops UNIs already registered; unless
    /// `include_removed` is set, UNIs an operator removed stay hidden.
    pub fn unis_from_topology(&self, exclude_added: bool, include_removed: bool) -> Vec<Uni> {
        self.ltps_from_topology(exclude_added, include_removed)
            .into_iter()
            .filter_map(|ltp| ltp.uni().cloned())
            .collect()
    }

    /// Derives the potential LTPs from the current topology, with the
    /// same filters as `unis_from_topology`.
    pub fn ltps_from_topology(&self, exclude_added: bool, include_removed: bool) -> Vec<Ltp> {
        let mut out = Vec::new();
        for device in self.topo.devices() {
            if !device.is_switch {
                continue;
            }
            for port in self.topo.device_ports(&device.id) {
                let Ok(ltp) = self.generate_ltp(&port.cp) else {
                    continue;
                };
                let id = ltp.id();
                if exclude_added && self.registry.contains_ltp(&id) {
                    continue;
                }
                if !include_removed && self.registry.is_removed_ltp(&id) {
                    continue;
                }
                out.push(ltp);
            }
        }
        out
    }

    /// Registers every LTP the topology offers that is not already known
    /// and was not explicitly removed.
    pub fn populate_from_topology(&self) -> CeResult<usize> {
        let mut added = 0;
        for ltp in self.ltps_from_topology(true, false) {
            // An INNI registration also registers its link pair, which
            // may appear later in this same scan.
            if self.registry.contains_ltp(&ltp.id()) {
                continue;
            }
            self.registry.add_ltp(ltp)?;
            added += 1;
        }
        info!(added, "registered interfaces from topology");
        Ok(added)
    }

    /// Registers a global LTP.
    pub fn add_global_ltp(&self, ltp: Ltp) -> CeResult<()> {
        self.registry.add_ltp(ltp)
    }

    /// Removes a global LTP. Refused while any service references it.
    pub fn remove_global_ltp(&self, id: &str) -> CeResult<Ltp> {
        self.registry.remove_ltp(id)
    }

    /// Registers a global UNI.
    pub fn add_global_uni(&self, uni: Uni) -> CeResult<()> {
        self.registry.add_uni(uni)
    }

    /// Removes a global UNI. Refused while any service references it.
    pub fn remove_global_uni(&self, id: &str) -> CeResult<Uni> {
        self.registry.remove_uni(id)
    }

    // ---- EVC lifecycle ---------------------------------------------------

    /// Installs a service, or reinstalls it when one with the same
    /// configured id already exists. Returns the installed service.
    pub async fn install_evc(&self, mut request: Evc) -> CeResult<Evc> {
        if let Some(existing) = self.find_existing_evc(&request) {
            debug!(evc = %existing, "reinstalling existing service");
            let previous = self.remove_evc(&existing).await?;
            if request.short_id.is_none() {
                request.short_id = previous.short_id;
            }
        }

        {
            // The live set is snapshotted under the allocator lock, and
            // an allocated short id stays reserved until the service
            // reaches the map, so concurrent installs cannot collide.
            let mut short_ids = self.short_ids.lock().unwrap_or_else(|e| e.into_inner());
            let live_short_ids: BTreeSet<u16> = self
                .evcs
                .iter()
                .filter_map(|e| e.value().short_id)
                .collect();
            if let Err(err) =
                validate_evc(&mut request, &self.registry, &mut short_ids, &live_short_ids)
            {
                if let Some(short_id) = request.short_id {
                    short_ids.release(short_id);
                }
                return Err(err);
            }
        }

        match self.install_validated_evc(&mut request).await {
            Ok(()) => {
                info!(evc = %request.id, state = %request.state, "service installed");
                self.evcs.insert(request.id.clone(), request.clone());
                if let Some(short_id) = request.short_id {
                    self.short_ids
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .commit(short_id);
                }
                Ok(request)
            }
            Err(err) => {
                for uni in &request.unis {
                    self.registry.release_uni(uni);
                }
                if let Some(short_id) = request.short_id {
                    self.short_ids
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .release(short_id);
                }
                Err(err)
            }
        }
    }

    async fn install_validated_evc(&self, evc: &mut Evc) -> CeResult<()> {
        let fragments = if self.fragmentation.load(Ordering::SeqCst) {
            fragment_evc(evc, self.topo.as_ref(), &self.registry)?
        } else {
            vec![single_fc(evc)?]
        };

        let mut installed: Vec<String> = Vec::new();
        let mut reused: Vec<String> = Vec::new();
        let mut result = Ok(());
        for fragment in fragments {
            if let Some(existing) = self.find_fc_by_ltps(&fragment.ltps) {
                self.fcs
                    .get(&existing)
                    .map(|fc| fc.increment_refs())
                    .ok_or_else(|| CeError::not_found("FC", existing.clone()))?;
                reused.push(existing);
                continue;
            }
            match self.install_fc_core(fragment, None).await {
                Ok(fc) => {
                    self.fcs
                        .get(&fc.id)
                        .map(|f| f.increment_refs())
                        .ok_or_else(|| CeError::not_found("FC", fc.id.clone()))?;
                    installed.push(fc.id);
                }
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }

        if result.is_ok() {
            let states: Vec<ConnectionState> = installed
                .iter()
                .chain(reused.iter())
                .filter_map(|id| self.fcs.get(id).map(|fc| fc.state))
                .collect();
            let any_inactive = states.iter().any(|s| *s == ConnectionState::Inactive);
            if states.is_empty() || any_inactive {
                result = Err(CeError::transport(
                    "service could not be connected on every segment",
                ));
            } else {
                evc.state = ConnectionState::aggregate(states);
            }
        }

        if let Err(err) = result {
            for id in &installed {
                if let Some(fc) = self.fcs.get(id) {
                    fc.decrement_refs();
                }
                if let Err(remove_err) = self.remove_fc_core(id, false).await {
                    warn!(fc = %id, %remove_err, "rollback removal failed");
                }
            }
            for id in &reused {
                if let Some(fc) = self.fcs.get(id) {
                    fc.decrement_refs();
                }
            }
            return Err(err);
        }

        evc.fc_ids = installed.iter().chain(reused.iter()).cloned().collect();
        self.pair_trunk_tags(&evc.fc_ids);
        self.narrow_evc_unis(evc);
        Ok(())
    }

    /// Removes a service, its exclusive constructs and its committed
    /// bandwidth. Returns the removed service.
    pub async fn remove_evc(&self, id: &str) -> CeResult<Evc> {
        let (_, evc) = self
            .evcs
            .remove(id)
            .ok_or_else(|| CeError::not_found("EVC", id))?;
        for fc_id in &evc.fc_ids {
            let remaining = self
                .fcs
                .get(fc_id)
                .map(|fc| fc.decrement_refs())
                .unwrap_or(0);
            if remaining == 0 {
                if let Err(err) = self.remove_fc_core(fc_id, false).await {
                    warn!(fc = %fc_id, %err, "construct removal failed");
                }
            }
        }
        for uni in &evc.unis {
            self.registry.release_uni(uni);
        }
        if let Some(short_id) = evc.short_id {
            self.short_ids
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .release(short_id);
        }
        info!(evc = %evc.id, "service removed");
        Ok(evc)
    }

    /// Snapshot of an installed service.
    pub fn evc(&self, id: &str) -> Option<Evc> {
        self.evcs.get(id).map(|e| e.value().clone())
    }

    /// Snapshots of all installed services, ordered by id.
    pub fn evcs(&self) -> Vec<Evc> {
        self.evcs
            .iter()
            .map(|e| e.value().clone())
            .sorted_by(|a, b| a.id.cmp(&b.id))
            .collect()
    }

    // ---- FC lifecycle ----------------------------------------------------

    /// Installs a standalone forwarding construct. Reinstalling an
    /// existing construct keeps its VLAN.
    pub async fn install_fc(&self, mut request: Fc) -> CeResult<Fc> {
        let preset = match self.find_existing_fc(&request) {
            Some(existing) => {
                debug!(fc = %existing, "reinstalling existing construct");
                let previous = self.remove_fc(&existing).await?;
                previous.vlan_id
            }
            None => request.vlan_id,
        };
        validate_fc(&mut request, &self.registry)?;
        let unis: Vec<Uni> = request.uni_ltps().filter_map(|l| l.uni()).cloned().collect();
        match self.install_fc_core(request, preset).await {
            Ok(fc) => Ok(fc),
            Err(err) => {
                for uni in &unis {
                    self.registry.release_uni(uni);
                }
                Err(err)
            }
        }
    }

    /// Removes a standalone forwarding construct and releases its
    /// bandwidth. Refused while a service still references it.
    pub async fn remove_fc(&self, id: &str) -> CeResult<Fc> {
        let refs = self
            .fcs
            .get(id)
            .map(|fc| fc.ref_count())
            .ok_or_else(|| CeError::not_found("FC", id))?;
        if refs > 0 {
            return Err(CeError::in_use("FC", id, refs));
        }
        self.remove_fc_core(id, true).await
    }

    /// Snapshot of an installed construct.
    pub fn fc(&self, id: &str) -> Option<Fc> {
        self.fcs.get(id).map(|fc| fc.value().clone())
    }

    /// Snapshots of all installed constructs, ordered by id.
    pub fn fcs(&self) -> Vec<Fc> {
        self.fcs
            .iter()
            .map(|fc| fc.value().clone())
            .sorted_by(|a, b| a.id.cmp(&b.id))
            .collect()
    }

    /// Assigns a VLAN, creates bandwidth meters, plans connectivity and
    /// registers the construct. Fails (and undoes its own work) when no
    /// endpoint pair could be connected.
    async fn install_fc_core(&self, mut fc: Fc, preset: Option<VlanId>) -> CeResult<Fc> {
        let vlan = match preset.or_else(|| self.cfg_vlan(&fc)) {
            Some(vlan) => {
                if self.vlan_in_use(vlan) {
                    warn!(%vlan, "pinned VLAN is already carried by another construct");
                }
                vlan
            }
            None => {
                // The live set is snapshotted under the allocator lock,
                // and an allocated tag stays reserved until the
                // construct reaches the map, so concurrent installs
                // cannot pick the same tag.
                let mut vlans = self.vlan_ids.lock().unwrap_or_else(|e| e.into_inner());
                let in_use: BTreeSet<u16> = self
                    .fcs
                    .iter()
                    .filter_map(|f| f.value().vlan_id.map(|v| v.value()))
                    .collect();
                let raw = vlans
                    .allocate(&in_use)
                    .ok_or(CeError::exhausted("VLAN id"))?;
                VlanId::new(raw).ok_or(CeError::exhausted("VLAN id"))?
            }
        };
        fc.assign_vlan(vlan);

        match self.activate_fc(fc).await {
            Ok(fc) => {
                self.vlan_ids
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .commit(vlan.value());
                Ok(fc)
            }
            Err(err) => {
                self.release_vlan(vlan);
                Err(err)
            }
        }
    }

    /// Meters, connectivity and registration for a construct whose VLAN
    /// is already assigned.
    async fn activate_fc(&self, mut fc: Fc) -> CeResult<Fc> {
        let unis: Vec<Uni> = fc.uni_ltps().filter_map(|l| l.uni()).cloned().collect();
        let mut created = Vec::new();
        for uni in &unis {
            if let Some(bwp) = uni.service_bwp() {
                self.node.create_bandwidth_profile(uni, bwp).await?;
                created.push((uni.clone(), bwp.clone()));
            }
        }

        self.provisioner.setup_connectivity(&mut fc).await?;
        if fc.state == ConnectionState::Inactive {
            // Partially programmed forwarding and any transport circuits
            // must come out before the construct is dropped.
            if let Err(err) = self.provisioner.remove_connectivity(&mut fc).await {
                warn!(fc = %fc.id, %err, "cleanup after failed install failed");
            }
            for (uni, bwp) in &created {
                if let Err(err) = self.node.remove_bandwidth_profile(uni, bwp).await {
                    warn!(uni = %uni.id(), bwp = %bwp.id, %err, "meter removal failed");
                }
            }
            return Err(CeError::transport(format!(
                "no connectivity established for {}",
                fc.id
            )));
        }
        for (uni, bwp) in &created {
            self.node.apply_bandwidth_profile(uni, bwp).await?;
        }
        self.registry.merge_fc_ltps(&fc.ltps)?;
        info!(fc = %fc.id, state = %fc.state, ltps = fc.ltps.len(), "construct installed");
        self.fcs.insert(fc.id.clone(), fc.clone());
        Ok(fc)
    }

    /// Tears down a construct: forwarding, circuits, meters, registry
    /// references and, when `release_unis` is set, the bandwidth its
    /// customer endpoints committed.
    async fn remove_fc_core(&self, id: &str, release_unis: bool) -> CeResult<Fc> {
        let (_, mut fc) = self
            .fcs
            .remove(id)
            .ok_or_else(|| CeError::not_found("FC", id))?;
        self.provisioner.remove_connectivity(&mut fc).await?;
        for uni in fc.uni_ltps().filter_map(|l| l.uni()) {
            if let Some(bwp) = uni.service_bwp() {
                if let Err(err) = self.node.remove_bandwidth_profile(uni, bwp).await {
                    warn!(uni = %uni.id(), bwp = %bwp.id, %err, "meter removal failed");
                }
            }
            if release_unis {
                self.registry.release_uni(uni);
            }
        }
        self.registry.unmerge_fc_ltps(&fc.ltps);
        if let Some(vlan) = fc.vlan_id {
            self.release_vlan(vlan);
        }
        info!(fc = %fc.id, "construct removed");
        Ok(fc)
    }

    // ---- VLAN handling ---------------------------------------------------

    /// Pins the S-TAG a port must carry.
    pub fn assign_port_vlan(&self, cp: ConnectPoint, vlan: VlanId) {
        if self.vlan_in_use(vlan) {
            warn!(%cp, %vlan, "pinned VLAN is already carried by an installed construct");
        }
        self.port_vlans.insert(cp, vlan);
    }

    /// Removes a port's pinned S-TAG.
    pub fn remove_port_vlan(&self, cp: &ConnectPoint) -> Option<VlanId> {
        self.port_vlans.remove(cp).map(|(_, v)| v)
    }

    /// Loads port VLAN pinnings, replacing previous entries for the same
    /// ports.
    pub fn load_port_vlans(&self, entries: BTreeMap<ConnectPoint, VlanId>) {
        for (cp, vlan) in entries {
            self.assign_port_vlan(cp, vlan);
        }
    }

    /// Returns the pinned VLAN for a construct: the single tag pinned on
    /// its ports, or nothing when ports disagree.
    fn cfg_vlan(&self, fc: &Fc) -> Option<VlanId> {
        let pinned: BTreeSet<VlanId> = fc
            .ltps
            .iter()
            .filter_map(|ltp| self.port_vlans.get(ltp.cp()).map(|v| *v))
            .collect();
        match pinned.len() {
            0 => None,
            1 => pinned.into_iter().next(),
            _ => {
                warn!(
                    fc = %fc.cfg_id.as_deref().unwrap_or("?"),
                    tags = ?pinned,
                    "conflicting pinned VLANs; falling back to allocation"
                );
                None
            }
        }
    }

    fn vlan_in_use(&self, vlan: VlanId) -> bool {
        self.fcs.iter().any(|fc| fc.value().vlan_id == Some(vlan))
    }

    fn release_vlan(&self, vlan: VlanId) {
        self.vlan_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .release(vlan.value());
    }

    /// Aligns trunk S-TAGs across segment boundaries: each trunk
    /// endpoint adopts the VLAN of the construct at the far end of its
    /// link.
    fn pair_trunk_tags(&self, fc_ids: &BTreeSet<String>) {
        let mut assignments: Vec<(String, String, VlanId)> = Vec::new();
        for id in fc_ids {
            let Some(fc) = self.fcs.get(id) else { continue };
            for ltp in &fc.ltps {
                if ltp.inni().is_none() && ltp.enni().is_none() {
                    continue;
                }
                let Some(link) = self.topo.egress_links(ltp.cp()).into_iter().next() else {
                    continue;
                };
                let pair_id = link.dst.id();
                let neighbor_vlan = fc_ids
                    .iter()
                    .filter(|other| *other != id)
                    .filter_map(|other| self.fcs.get(other))
                    .find(|other| other.ltps.iter().any(|l| l.id() == pair_id))
                    .and_then(|other| other.vlan_id);
                if let Some(vlan) = neighbor_vlan {
                    assignments.push((id.clone(), ltp.id(), vlan));
                }
            }
        }
        for (fc_id, ltp_id, vlan) in assignments {
            if let Some(mut fc) = self.fcs.get_mut(&fc_id) {
                for ltp in &mut fc.ltps {
                    if ltp.id() == ltp_id {
                        match &mut ltp.ni {
                            NetworkInterface::Inni(inni) => inni.s_vlan = Some(vlan),
                            NetworkInterface::Enni(enni) => enni.s_vlan = Some(vlan),
                            _ => {}
                        }
                    }
                }
            }
        }
    }

    // ---- toggles ---------------------------------------------------------

    /// Enables or disables service decomposition into per-segment
    /// constructs. Returns the previous setting.
    pub fn set_evc_fragmentation(&self, enabled: bool) -> bool {
        let prev = self.fragmentation.swap(enabled, Ordering::SeqCst);
        self.prev_fragmentation.store(prev, Ordering::SeqCst);
        prev
    }

    /// Restores the fragmentation setting prior to the last change.
    pub fn reset_evc_fragmentation(&self) -> bool {
        let prev = self.prev_fragmentation.load(Ordering::SeqCst);
        self.fragmentation.store(prev, Ordering::SeqCst);
        prev
    }

    /// True when service decomposition is enabled.
    pub fn evc_fragmentation(&self) -> bool {
        self.fragmentation.load(Ordering::SeqCst)
    }

    // ---- helpers ---------------------------------------------------------

    fn find_existing_evc(&self, request: &Evc) -> Option<String> {
        if !request.id.is_empty() && self.evcs.contains_key(&request.id) {
            return Some(request.id.clone());
        }
        let cfg = request.cfg_id.as_deref()?;
        self.evcs
            .iter()
            .find(|e| e.value().cfg_id.as_deref() == Some(cfg))
            .map(|e| e.key().clone())
    }

    fn find_existing_fc(&self, request: &Fc) -> Option<String> {
        if !request.id.is_empty() && self.fcs.contains_key(&request.id) {
            return Some(request.id.clone());
        }
        let cfg = request.cfg_id.as_deref()?;
        self.fcs
            .iter()
            .find(|fc| fc.value().cfg_id.as_deref() == Some(cfg))
            .map(|fc| fc.key().clone())
    }

    fn find_fc_by_ltps(&self, ltps: &[Ltp]) -> Option<String> {
        let ids: BTreeSet<String> = ltps.iter().map(|l| l.id()).collect();
        self.fcs
            .iter()
            .find(|fc| {
                let theirs: BTreeSet<String> =
                    fc.value().ltps.iter().map(|l| l.id()).collect();
                theirs == ids
            })
            .map(|fc| fc.key().clone())
    }

    /// Narrows the service endpoints to the UNIs its constructs actually
    /// connected, releasing the bandwidth of the ones left out.
    fn narrow_evc_unis(&self, evc: &mut Evc) {
        let connected: BTreeSet<String> = evc
            .fc_ids
            .iter()
            .filter_map(|id| self.fcs.get(id))
            .flat_map(|fc| fc.uni_ltps().map(|l| l.id()).collect::<Vec<_>>())
            .collect();
        for uni in evc.unis.iter().filter(|u| !connected.contains(&u.id())) {
            warn!(evc = %evc.id, uni = %uni.id(), "endpoint not connected; released");
            self.registry.release_uni(uni);
        }
        evc.unis.retain(|uni| connected.contains(&uni.id()));
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::connection::ConnectionType;
    use crate::ni::NiRole;
    use crate::node::RecordingPacketNode;
    use crate::optical::NullTransport;
    use crate::topology::StaticTopology;
    use crate::types::{Bandwidth, BandwidthProfile, DeviceId, PortId};

    fn cp(dev: &str, port: &str) -> ConnectPoint {
        ConnectPoint::new(DeviceId::new(dev), PortId::new(port))
    }

    /// Two switches joined by one link; UNI port "1" on each.
    fn manager() -> (CeManager, Arc<RecordingPacketNode>) {
        let mut topo = StaticTopology::new();
        for dev in ["d1", "d2"] {
            topo.add_switch(dev);
            topo.add_port(dev, "1", Bandwidth::mbps(1000));
            topo.add_port(dev, "2", Bandwidth::mbps(10_000));
        }
        topo.add_link(("d1", "2"), ("d2", "2"));
        let node = Arc::new(RecordingPacketNode::new());
        let mgr = CeManager::new(Arc::new(topo), node.clone(), Arc::new(NullTransport));
        mgr.populate_from_topology().unwrap();
        (mgr, node)
    }

    fn uni(mgr: &CeManager, dev: &str) -> Uni {
        let mut uni = mgr.generate_uni(&cp(dev, "1")).unwrap();
        uni.role = Some(NiRole::Root);
        uni
    }

    fn p2p_request(mgr: &CeManager) -> Evc {
        Evc::new(
            Some("cust-1".into()),
            ConnectionType::PointToPoint,
            vec![uni(mgr, "d1"), uni(mgr, "d2")],
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_topology_derivation() {
        let (mgr, _) = manager();
        // Linked ports became INNIs, link-free ports UNIs.
        assert!(mgr.registry().ltp("d1/1").unwrap().is_uni());
        assert!(mgr.registry().ltp("d1/2").unwrap().inni().is_some());
        assert!(mgr.registry().contains_uni("d1/1"));
        // Everything is registered, so another scan yields nothing new.
        assert!(mgr.ltps_from_topology(true, false).is_empty());
        assert_eq!(mgr.unis_from_topology(false, false).len(), 2);
    }

    #[test]
    fn test_ltp_type_hint_is_validated() {
        let (mgr, _) = manager();
        // A linked port cannot host a UNI, a link-free port no trunk.
        assert!(mgr.generate_ltp_typed(&cp("d1", "2"), NiKind::Uni).is_err());
        assert!(mgr.generate_ltp_typed(&cp("d1", "1"), NiKind::Inni).is_err());
        let enni = mgr.generate_ltp_typed(&cp("d1", "2"), NiKind::Enni).unwrap();
        assert!(enni.enni().is_some());
    }

    #[test]
    fn test_removed_ltp_stays_hidden() {
        let (mgr, _) = manager();
        mgr.remove_global_ltp("d1/1").unwrap();
        assert!(mgr
            .ltps_from_topology(true, false)
            .iter()
            .all(|l| l.id() != "d1/1"));
        assert!(mgr
            .ltps_from_topology(true, true)
            .iter()
            .any(|l| l.id() == "d1/1"));
    }

    #[tokio::test]
    async fn test_p2p_install_end_to_end() {
        let (mgr, _) = manager();
        let installed = mgr.install_evc(p2p_request(&mgr)).await.unwrap();
        assert_eq!(installed.id, "EP-Line-1");
        assert_eq!(installed.state, ConnectionState::Active);
        // Default mode: one construct spanning both endpoints.
        assert_eq!(installed.fc_ids.len(), 1);
        let fcs = mgr.fcs();
        assert_eq!(fcs.len(), 1);
        assert_eq!(fcs[0].id, "FC-1");
        assert_eq!(fcs[0].state, ConnectionState::Active);
        assert_eq!(fcs[0].ref_count(), 1);
        assert_eq!(fcs[0].ltps.len(), 2);
        assert!(fcs[0].ltps.iter().all(|l| l.is_uni()));
        // UNI-backed endpoints are referenced in the registry.
        assert_eq!(mgr.registry().ltp_ref_count("d1/1"), Some(1));
        assert_eq!(mgr.registry().uni_ref_count("d1/1"), Some(1));
        assert_eq!(mgr.registry().ltp_ref_count("d2/1"), Some(1));
        // Trunk ports are traversed but not endpoints here.
        assert_eq!(mgr.registry().ltp_ref_count("d1/2"), Some(0));
    }

    #[tokio::test]
    async fn test_remove_evc_restores_registry() {
        let (mgr, _) = manager();
        let installed = mgr.install_evc(p2p_request(&mgr)).await.unwrap();
        mgr.remove_evc(&installed.id).await.unwrap();
        assert!(mgr.evcs().is_empty());
        assert!(mgr.fcs().is_empty());
        assert_eq!(mgr.registry().ltp_ref_count("d1/1"), Some(0));
        assert_eq!(mgr.registry().uni_ref_count("d1/1"), Some(0));
        // The short id is free again.
        let reinstalled = mgr.install_evc(p2p_request(&mgr)).await.unwrap();
        assert_eq!(reinstalled.id, "EP-Line-1");
    }

    #[tokio::test]
    async fn test_reinstall_keeps_short_id() {
        let (mgr, _) = manager();
        let first = mgr.install_evc(p2p_request(&mgr)).await.unwrap();
        let second = mgr.install_evc(p2p_request(&mgr)).await.unwrap();
        assert_eq!(first.short_id, second.short_id);
        assert_eq!(mgr.evcs().len(), 1);
    }

    #[tokio::test]
    async fn test_referenced_interfaces_not_removable() {
        let (mgr, _) = manager();
        mgr.install_evc(p2p_request(&mgr)).await.unwrap();
        assert!(matches!(
            mgr.remove_global_ltp("d1/1"),
            Err(CeError::ResourceInUse { .. })
        ));
        assert!(matches!(
            mgr.remove_global_uni("d1/1"),
            Err(CeError::ResourceInUse { .. })
        ));
    }

    #[tokio::test]
    async fn test_fc_in_use_not_removable() {
        let (mgr, _) = manager();
        let installed = mgr.install_evc(p2p_request(&mgr)).await.unwrap();
        let fc_id = installed.fc_ids.iter().next().unwrap().clone();
        assert!(matches!(
            mgr.remove_fc(&fc_id).await,
            Err(CeError::ResourceInUse { .. })
        ));
    }

    #[tokio::test]
    async fn test_bandwidth_profiles_drive_node_calls() {
        use crate::node::ForwardingEvent;
        let (mgr, node) = manager();
        let mut request = p2p_request(&mgr);
        request.unis[0].add_bwp(BandwidthProfile::evc(
            "gold",
            Bandwidth::mbps(200),
            Bandwidth::ZERO,
            0,
            0,
        ));
        mgr.install_evc(request).await.unwrap();
        let events = node.events();
        assert!(events.contains(&ForwardingEvent::CreateBwp {
            uni: "d1/1".into(),
            bwp: "EP-Line-1".into(),
        }));
        assert!(events.contains(&ForwardingEvent::ApplyBwp {
            uni: "d1/1".into(),
            bwp: "EP-Line-1".into(),
        }));
        assert_eq!(
            mgr.registry().uni("d1/1").unwrap().used_capacity,
            Bandwidth::mbps(200)
        );
    }

    #[tokio::test]
    async fn test_trunk_tags_paired_across_segments() {
        let (mgr, _) = manager();
        mgr.set_evc_fragmentation(true);
        mgr.install_evc(p2p_request(&mgr)).await.unwrap();
        let fcs = mgr.fcs();
        let trunk_tag = |fc: &Fc| {
            fc.ltps
                .iter()
                .find_map(|l| l.inni().and_then(|i| i.s_vlan))
        };
        // Each segment's trunk port carries the neighbor construct's tag.
        assert_eq!(trunk_tag(&fcs[0]), fcs[1].vlan_id);
        assert_eq!(trunk_tag(&fcs[1]), fcs[0].vlan_id);
    }

    #[tokio::test]
    async fn test_fragmentation_splits_per_segment() {
        let (mgr, _) = manager();
        assert!(!mgr.set_evc_fragmentation(true));
        let installed = mgr.install_evc(p2p_request(&mgr)).await.unwrap();
        // One construct per device segment, sharing the trunk link.
        assert_eq!(installed.fc_ids.len(), 2);
        for fc in mgr.fcs() {
            assert_eq!(fc.state, ConnectionState::Active);
            assert_eq!(fc.uni_ltps().count(), 1);
        }
        assert_eq!(mgr.registry().ltp_ref_count("d1/2"), Some(1));
        // Reset restores the previous (disabled) mode.
        assert!(!mgr.reset_evc_fragmentation());
        assert!(!mgr.evc_fragmentation());
    }

    #[tokio::test]
    async fn test_pinned_vlan_overrides_allocation() {
        let (mgr, _) = manager();
        mgr.assign_port_vlan(cp("d1", "1"), VlanId::new(500).unwrap());
        let installed = mgr.install_evc(p2p_request(&mgr)).await.unwrap();
        let fc = mgr.fc(installed.fc_ids.iter().next().unwrap()).unwrap();
        assert_eq!(fc.vlan_id, VlanId::new(500));
        assert_eq!(fc.id, "FC-500");
    }

    #[tokio::test]
    async fn test_standalone_fc_lifecycle() {
        let (mgr, _) = manager();
        let ltps = vec![
            mgr.generate_ltp(&cp("d1", "1")).unwrap(),
            mgr.generate_ltp(&cp("d1", "2")).unwrap(),
        ];
        let request = Fc::new(
            Some("fc-cust".into()),
            ConnectionType::PointToPoint,
            ltps,
            None,
        )
        .unwrap();
        let installed = mgr.install_fc(request).await.unwrap();
        assert_eq!(installed.state, ConnectionState::Active);
        assert_eq!(installed.id, "FC-1");

        // Reinstall keeps the VLAN.
        let ltps = vec![
            mgr.generate_ltp(&cp("d1", "1")).unwrap(),
            mgr.generate_ltp(&cp("d1", "2")).unwrap(),
        ];
        let again = Fc::new(
            Some("fc-cust".into()),
            ConnectionType::PointToPoint,
            ltps,
            None,
        )
        .unwrap();
        let reinstalled = mgr.install_fc(again).await.unwrap();
        assert_eq!(reinstalled.vlan_id, installed.vlan_id);

        mgr.remove_fc("FC-1").await.unwrap();
        assert!(mgr.fcs().is_empty());
        assert_eq!(mgr.registry().ltp_ref_count("d1/1"), Some(0));
    }

    #[tokio::test]
    async fn test_unreachable_service_rolls_back() {
        let mut topo = StaticTopology::new();
        for dev in ["d1", "d9"] {
            topo.add_switch(dev);
            topo.add_port(dev, "1", Bandwidth::mbps(1000));
        }
        let node = Arc::new(RecordingPacketNode::new());
        let mgr = CeManager::new(Arc::new(topo), node, Arc::new(NullTransport));
        mgr.populate_from_topology().unwrap();
        let request = Evc::new(
            None,
            ConnectionType::PointToPoint,
            vec![uni(&mgr, "d1"), uni(&mgr, "d9")],
            None,
        )
        .unwrap();
        assert!(mgr.install_evc(request).await.is_err());
        assert!(mgr.evcs().is_empty());
        assert!(mgr.fcs().is_empty());
        assert_eq!(mgr.registry().ltp_ref_count("d1/1"), Some(0));
    }

    /// Driver whose forwarding programming always fails.
    struct RefusingNode;

    #[async_trait::async_trait]
    impl PacketNodeDriver for RefusingNode {
        async fn set_node_forwarding(
            &self,
            _fc: &Fc,
            _ingress: &NetworkInterface,
            _egress: &BTreeSet<NetworkInterface>,
        ) -> CeResult<()> {
            Err(CeError::transport("switch unreachable"))
        }

        async fn create_bandwidth_profile(
            &self,
            _uni: &Uni,
            _bwp: &crate::types::BandwidthProfile,
        ) -> CeResult<()> {
            Ok(())
        }

        async fn apply_bandwidth_profile(
            &self,
            _uni: &Uni,
            _bwp: &crate::types::BandwidthProfile,
        ) -> CeResult<()> {
            Ok(())
        }

        async fn remove_bandwidth_profile(
            &self,
            _uni: &Uni,
            _bwp: &crate::types::BandwidthProfile,
        ) -> CeResult<()> {
            Ok(())
        }

        async fn remove_all_forwarding(&self, _fc: &Fc) -> CeResult<()> {
            Ok(())
        }
    }

    /// Transport controller that hands out one circuit and records the
    /// removals it is asked for.
    #[derive(Default)]
    struct CircuitTransport {
        removed: Mutex<Vec<crate::optical::TransportId>>,
    }

    #[async_trait::async_trait]
    impl TransportController for CircuitTransport {
        async fn setup_connectivity(
            &self,
            _ingress: &ConnectPoint,
            _egress: &ConnectPoint,
            _vlan: VlanId,
            _bandwidth: crate::types::Bandwidth,
        ) -> CeResult<crate::optical::TransportId> {
            Ok(crate::optical::TransportId("oc-1".into()))
        }

        async fn remove_connectivity(&self, id: &crate::optical::TransportId) -> CeResult<()> {
            self.removed
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(id.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_install_tears_down_circuits() {
        let mut topo = StaticTopology::new();
        topo.add_switch("d1");
        topo.add_device("roadm1", false);
        topo.add_switch("d3");
        for dev in ["d1", "d3"] {
            topo.add_port(dev, "1", Bandwidth::mbps(1000));
        }
        topo.add_port("d1", "3", Bandwidth::mbps(10_000));
        topo.add_port("d3", "2", Bandwidth::mbps(10_000));
        topo.add_link(("d1", "3"), ("roadm1", "1"));
        topo.add_link(("roadm1", "2"), ("d3", "2"));
        let transport = Arc::new(CircuitTransport::default());
        let mgr = CeManager::new(Arc::new(topo), Arc::new(RefusingNode), transport.clone());
        mgr.populate_from_topology().unwrap();
        mgr.provisioner().set_pkt_optical(true);

        let request = Evc::new(
            None,
            ConnectionType::PointToPoint,
            vec![uni(&mgr, "d1"), uni(&mgr, "d3")],
            None,
        )
        .unwrap();
        assert!(mgr.install_evc(request).await.is_err());
        assert!(mgr.fcs().is_empty());
        // The circuit established before forwarding failed is torn down
        // with the rolled-back construct.
        let removed = transport.removed.lock().unwrap().clone();
        assert_eq!(removed, vec![crate::optical::TransportId("oc-1".into())]);
    }
}
