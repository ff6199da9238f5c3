//! Service decomposition into per-segment forwarding constructs.
//!
//! Every admissible UNI pair of a service is resolved to a path, the
//! path is cut at device boundaries, and the resulting LTP pairs are
//! grouped into connected sets. Each set becomes one forwarding
//! construct, so a service crossing N packet devices yields one
//! construct per device segment while co-located endpoints share a
//! construct.

use std::collections::HashMap;

use ce_common::{CeError, CeResult};
use tracing::warn;

use crate::connection::ConnectionType;
use crate::evc::Evc;
use crate::fc::Fc;
use crate::ltp::{Ltp, LtpRole};
use crate::ni::{NetworkInterface, NiRole, Uni};
use crate::registry::CeRegistry;
use crate::topology::{Link, SpanningTreeWeigher, TopologyProvider};

/// Groups LTPs into connected sets as endpoint pairs are added.
///
/// Pairs whose endpoints already belong to two different sets are not
/// merged; the constraint is reported and the first set wins. Paths are
/// expected to visit a device through a single ingress/egress pair, so
/// a merge request indicates inconsistent path computation.
#[derive(Default)]
struct LtpPartition {
    sets: Vec<Vec<Ltp>>,
    index: HashMap<String, usize>,
}

impl LtpPartition {
    fn add_pair(&mut self, a: Ltp, b: Ltp) {
        let ia = self.index.get(&a.id()).copied();
        let ib = self.index.get(&b.id()).copied();
        match (ia, ib) {
            (Some(x), Some(y)) => {
                if x != y {
                    warn!(
                        a = %a.id(),
                        b = %b.id(),
                        "LTP pair spans two segments; not merged"
                    );
                }
            }
            (Some(x), None) => {
                self.index.insert(b.id(), x);
                self.sets[x].push(b);
            }
            (None, Some(y)) => {
                self.index.insert(a.id(), y);
                self.sets[y].push(a);
            }
            (None, None) => {
                let idx = self.sets.len();
                self.index.insert(a.id(), idx);
                self.index.insert(b.id(), idx);
                self.sets.push(vec![a, b]);
            }
        }
    }

    fn into_sets(self) -> Vec<Vec<Ltp>> {
        self.sets
    }
}

fn uni_ltp(uni: &Uni) -> Ltp {
    let role = uni.role.map(LtpRole::from_ni_role);
    Ltp::new(NetworkInterface::Uni(uni.clone()), role)
}

/// Builds a single construct spanning all service endpoints directly.
/// Used when fragmentation is disabled.
pub fn single_fc(evc: &Evc) -> CeResult<Fc> {
    let ltps: Vec<Ltp> = evc.unis.iter().map(uni_ltp).collect();
    let mut fc = Fc::new(None, evc.evc_type, ltps, Some(evc.max_latency))?;
    fc.state = evc.state;
    Ok(fc)
}

/// Decomposes a validated service into forwarding constructs.
///
/// Fails when any endpoint pair has no feasible path or when an
/// interior hop has no registered LTP.
pub fn fragment_evc(
    evc: &Evc,
    topo: &dyn TopologyProvider,
    registry: &CeRegistry,
) -> CeResult<Vec<Fc>> {
    let mut partition = LtpPartition::default();
    let multipoint = evc.evc_type != ConnectionType::PointToPoint;

    for (i, u1) in evc.unis.iter().enumerate() {
        for u2 in evc.unis.iter().skip(i + 1) {
            // Leaves only need connectivity towards roots.
            if u1.role == Some(NiRole::Leaf) && u2.role == Some(NiRole::Leaf) {
                continue;
            }
            add_pair_segments(&mut partition, u1, u2, multipoint, topo, registry)?;
        }
    }

    let mut fcs = Vec::new();
    for ltps in partition.into_sets() {
        let has_leaf = ltps.iter().any(|l| l.role == Some(LtpRole::Leaf));
        let fc_type = if has_leaf {
            ConnectionType::RootMultipoint
        } else if ltps.len() == 2 {
            ConnectionType::PointToPoint
        } else {
            ConnectionType::Multipoint
        };
        fcs.push(Fc::new(None, fc_type, ltps, Some(evc.max_latency))?);
    }
    Ok(fcs)
}

/// Cuts the path between two endpoints at device boundaries and feeds
/// the per-device LTP pairs into the partition.
fn add_pair_segments(
    partition: &mut LtpPartition,
    u1: &Uni,
    u2: &Uni,
    multipoint: bool,
    topo: &dyn TopologyProvider,
    registry: &CeRegistry,
) -> CeResult<()> {
    let ltp1 = uni_ltp(u1);
    let ltp2 = uni_ltp(u2);
    if ltp1.id() == ltp2.id() {
        return Ok(());
    }
    if u1.cp.device == u2.cp.device {
        partition.add_pair(ltp1, ltp2);
        return Ok(());
    }

    let path = if multipoint {
        let weigher = SpanningTreeWeigher::new(topo);
        topo.weighted_path(&u1.cp.device, &u2.cp.device, &weigher)
    } else {
        topo.shortest_path(&u1.cp.device, &u2.cp.device)
    }
    .ok_or_else(|| CeError::no_path(u1.id(), u2.id()))?;

    let mut links = Vec::with_capacity(path.len() + 2);
    links.push(Link::edge(u1.cp.clone()));
    links.extend(path);
    links.push(Link::edge(u2.cp.clone()));

    let role1 = u1.role.map(LtpRole::from_ni_role);
    let role2 = u2.role.map(LtpRole::from_ni_role);
    let transit = |cp: &crate::types::ConnectPoint, role: Option<LtpRole>| -> CeResult<Ltp> {
        let global = registry
            .ltp(&cp.id())
            .ok_or_else(|| CeError::not_found("LTP", cp.id()))?;
        Ok(Ltp::transit(cp.clone(), Some(&global), role))
    };

    // links[1..=n-2] are the infrastructure hops; each boundary yields
    // the egress LTP of one device and the ingress LTP of the next.
    let n = links.len();
    let mut ingress = ltp1;
    for link in &links[1..n - 1] {
        let egress = transit(&link.src, role2)?;
        partition.add_pair(ingress, egress);
        ingress = transit(&link.dst, role1)?;
    }
    partition.add_pair(ingress, ltp2);
    Ok(())
}
