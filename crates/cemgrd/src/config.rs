//! Operator configuration surface.
//!
//! Port-level VLAN pinning: an operator may fix the S-TAG a port must
//! carry, and constructs touching that port then use the pinned tag
//! instead of an allocated one. The config is a JSON object keyed by
//! connect point.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use ce_common::{CeError, CeResult};
use serde::{Deserialize, Serialize};

use crate::types::{ConnectPoint, VlanId};

/// Per-port VLAN pinning entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortVlanConfig {
    /// The S-TAG this port must carry.
    #[serde(rename = "s-tag")]
    pub s_tag: VlanId,
}

/// Loads port VLAN pinnings from a JSON file of the form
/// `{"<deviceId>/<port>": {"s-tag": 100}, ...}`.
pub fn load_port_vlans(path: &Path) -> CeResult<BTreeMap<ConnectPoint, VlanId>> {
    let raw = std::fs::read_to_string(path)?;
    parse_port_vlans(&raw)
}

/// Parses port VLAN pinnings from a JSON string.
pub fn parse_port_vlans(raw: &str) -> CeResult<BTreeMap<ConnectPoint, VlanId>> {
    let entries: BTreeMap<String, PortVlanConfig> = serde_json::from_str(raw)?;
    let mut out = BTreeMap::new();
    for (key, cfg) in entries {
        let cp = ConnectPoint::from_str(&key)?;
        if VlanId::new(cfg.s_tag.value()).is_none() {
            return Err(CeError::invalid_config(
                key,
                format!("s-tag {} out of range", cfg.s_tag),
            ));
        }
        out.insert(cp, cfg.s_tag);
    }
    Ok(out)
}
