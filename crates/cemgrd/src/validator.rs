//! Admission control for service requests.
//!
//! Validation runs before any data-plane work: it normalizes roles,
//! decides tagged/untagged service flavor, assigns the short id and
//! derived id, and commits per-UNI bandwidth against the global
//! registry. Everything committed here is rolled back if a later step
//! rejects the request, so a failed validation leaves no trace.

use std::collections::BTreeSet;

use ce_common::{CeError, CeResult};
use tracing::{debug, warn};

use crate::allocator::IdAllocator;
use crate::connection::ConnectionType;
use crate::evc::Evc;
use crate::fc::Fc;
use crate::ni::NiRole;
use crate::registry::CeRegistry;
use crate::types::BwpType;

/// Decides whether a service is tagged (EVP) or untagged (EP).
///
/// Mixing tagged and untagged UNIs in one service is rejected.
fn virtual_flavor(tagged: usize, untagged: usize) -> CeResult<bool> {
    match (tagged, untagged) {
        (_, 0) => Ok(true),
        (0, _) => Ok(false),
        _ => Err(CeError::validation(
            "cannot mix CE-VLAN tagged and untagged endpoints in one service",
        )),
    }
}

/// Validates a service request and assigns its identity.
///
/// On success the EVC has a short id, derived id, normalized UNI roles
/// and its bandwidth committed in the registry. UNIs whose bandwidth
/// cannot be admitted are dropped when they are leaves; a rejected root
/// (or any endpoint of a point-to-point service) aborts the whole
/// request and releases everything committed so far.
pub fn validate_evc(
    evc: &mut Evc,
    registry: &CeRegistry,
    short_ids: &mut IdAllocator,
    live_short_ids: &BTreeSet<u16>,
) -> CeResult<()> {
    if evc.unis.len() > evc.max_num_uni {
        return Err(CeError::validation(format!(
            "{} UNIs exceed the limit of {} for {}",
            evc.unis.len(),
            evc.max_num_uni,
            evc.evc_type
        )));
    }
    if evc.evc_type == ConnectionType::PointToPoint && evc.unis.len() != 2 {
        return Err(CeError::validation(format!(
            "point-to-point service requires exactly 2 UNIs, got {}",
            evc.unis.len()
        )));
    }

    let tagged = evc.unis.iter().filter(|u| !u.is_untagged()).count();
    let untagged = evc.unis.len() - tagged;
    evc.is_virtual = virtual_flavor(tagged, untagged)?;

    normalize_roles(evc)?;

    for uni in &evc.unis {
        if !registry.contains_uni(&uni.id()) {
            return Err(CeError::not_found("UNI", uni.id()));
        }
    }

    let short_id = match evc.short_id {
        Some(id) if !live_short_ids.contains(&id) => id,
        Some(id) => {
            return Err(CeError::validation(format!(
                "EVC short id {id} is already in use"
            )))
        }
        None => short_ids
            .allocate(live_short_ids)
            .ok_or(CeError::exhausted("EVC short id"))?,
    };
    evc.short_id = Some(short_id);
    evc.id = Evc::derive_id(evc.evc_type, evc.is_virtual, short_id);

    // Rekey per-service profiles to the final id, then admit bandwidth.
    for uni in &mut evc.unis {
        if let Some(profiles) = uni.bwps.get_mut(&BwpType::Evc) {
            let rekeyed: Vec<_> = profiles
                .values()
                .cloned()
                .map(|mut bwp| {
                    bwp.cfg_id = Some(bwp.id.clone());
                    bwp.id = evc.id.clone();
                    bwp
                })
                .collect();
            profiles.clear();
            for bwp in rekeyed {
                profiles.insert(bwp.id.clone(), bwp);
            }
        }
    }

    let mut committed: Vec<usize> = Vec::new();
    let mut dropped: Vec<usize> = Vec::new();
    for (idx, uni) in evc.unis.iter().enumerate() {
        match registry.commit_uni(uni) {
            Ok(()) => committed.push(idx),
            Err(err) => {
                let abort = match evc.evc_type {
                    ConnectionType::PointToPoint => true,
                    ConnectionType::RootMultipoint => uni.role == Some(NiRole::Root),
                    ConnectionType::Multipoint => false,
                };
                if abort {
                    for &i in &committed {
                        registry.release_uni(&evc.unis[i]);
                    }
                    return Err(err);
                }
                warn!(evc = %evc.id, uni = %uni.id(), %err, "dropping endpoint");
                dropped.push(idx);
            }
        }
    }
    for &idx in dropped.iter().rev() {
        evc.unis.remove(idx);
    }
    if evc.unis.len() < 2 {
        for uni in &evc.unis {
            registry.release_uni(uni);
        }
        return Err(CeError::validation(
            "fewer than 2 admissible UNIs remain after bandwidth validation",
        ));
    }

    debug!(evc = %evc.id, unis = evc.unis.len(), virt = evc.is_virtual, "validated");
    Ok(())
}

/// Normalizes UNI roles for the service type.
///
/// Rooted-multipoint services need exactly one root; when none is
/// marked, the first UNI takes the role. Other service types clear
/// roles.
fn normalize_roles(evc: &mut Evc) -> CeResult<()> {
    match evc.evc_type {
        ConnectionType::RootMultipoint => {
            let roots = evc
                .unis
                .iter()
                .filter(|u| u.role == Some(NiRole::Root))
                .count();
            if roots > 1 {
                return Err(CeError::validation(format!(
                    "rooted-multipoint service allows at most one root, got {roots}"
                )));
            }
            for (idx, uni) in evc.unis.iter_mut().enumerate() {
                if uni.role != Some(NiRole::Root) {
                    uni.role = Some(NiRole::Leaf);
                }
                if roots == 0 && idx == 0 {
                    uni.role = Some(NiRole::Root);
                }
            }
        }
        _ => {
            for uni in &mut evc.unis {
                uni.role = Some(NiRole::Root);
            }
        }
    }
    Ok(())
}

/// Validates a standalone forwarding construct and admits the bandwidth
/// of its customer endpoints.
///
/// Unlike service validation there is no drop semantics: any rejected
/// endpoint aborts the construct and releases prior commitments.
pub fn validate_fc(fc: &mut Fc, registry: &CeRegistry) -> CeResult<()> {
    if fc.fc_type == ConnectionType::PointToPoint && fc.ltps.len() != 2 {
        return Err(CeError::validation(format!(
            "point-to-point construct requires exactly 2 LTPs, got {}",
            fc.ltps.len()
        )));
    }

    let unis: Vec<_> = fc.uni_ltps().filter_map(|l| l.uni()).cloned().collect();
    let tagged = unis.iter().filter(|u| !u.is_untagged()).count();
    virtual_flavor(tagged, unis.len() - tagged)?;

    let mut committed = Vec::new();
    for uni in &unis {
        match registry.commit_uni(uni) {
            Ok(()) => committed.push(uni),
            Err(err) => {
                for done in committed {
                    registry.release_uni(done);
                }
                return Err(err);
            }
        }
    }
    Ok(())
}
