//! Core value types: VLAN tags, bandwidth, attachment points, bandwidth profiles.

use std::fmt;
use std::str::FromStr;

use ce_common::CeError;
use serde::{Deserialize, Serialize};

/// A VLAN tag (valid service tags are 1..=4094).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct VlanId(u16);

impl VlanId {
    /// Lowest usable VLAN tag.
    pub const MIN: u16 = 1;
    /// Highest usable VLAN tag (4095 is reserved).
    pub const MAX: u16 = 4094;

    /// Creates a `VlanId`, rejecting values outside 1..=4094.
    pub fn new(value: u16) -> Option<Self> {
        (Self::MIN..=Self::MAX).contains(&value).then_some(Self(value))
    }

    /// Returns the raw tag value.
    pub fn value(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for VlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A bandwidth value, stored in bits per second.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct Bandwidth(u64);

impl Bandwidth {
    /// Zero bandwidth.
    pub const ZERO: Bandwidth = Bandwidth(0);

    /// Creates a bandwidth from bits per second.
    pub fn bps(bps: u64) -> Self {
        Self(bps)
    }

    /// Creates a bandwidth from megabits per second.
    pub fn mbps(mbps: u64) -> Self {
        Self(mbps * 1_000_000)
    }

    /// Returns the value in bits per second.
    pub fn as_bps(&self) -> u64 {
        self.0
    }

    /// Adds `other`, clamping the result to `cap`.
    pub fn add_clamped(&self, other: Bandwidth, cap: Bandwidth) -> Bandwidth {
        Bandwidth(self.0.saturating_add(other.0).min(cap.0))
    }

    /// Subtracts `other`, clamping the result at zero.
    pub fn sub_clamped(&self, other: Bandwidth) -> Bandwidth {
        Bandwidth(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bps", self.0)
    }
}

/// A network device identifier (e.g. `of:0000000000000001`).
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Creates a device id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A port identifier within a device.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PortId(String);

impl PortId {
    /// Creates a port id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A device/port attachment point. Its canonical string form
/// `<deviceId>/<port>` doubles as the identity of the UNIs and LTPs
/// bound to it.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ConnectPoint {
    /// The device hosting the port.
    pub device: DeviceId,
    /// The port on the device.
    pub port: PortId,
}

impl ConnectPoint {
    /// Creates a connect point.
    pub fn new(device: DeviceId, port: PortId) -> Self {
        Self { device, port }
    }

    /// Returns the canonical `<deviceId>/<port>` identifier.
    pub fn id(&self) -> String {
        format!("{}/{}", self.device, self.port)
    }
}

impl fmt::Display for ConnectPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.port)
    }
}

impl FromStr for ConnectPoint {
    type Err = CeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once('/') {
            Some((device, port)) if !device.is_empty() && !port.is_empty() => Ok(Self {
                device: DeviceId::new(device),
                port: PortId::new(port),
            }),
            _ => Err(CeError::invalid_config(
                s,
                "expected <deviceId>/<port>".to_string(),
            )),
        }
    }
}

/// Bandwidth profile granularity.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub enum BwpType {
    /// Per-interface profile; exclusive with all other profiles on the UNI.
    Interface,
    /// Per-EVC profile; renamed to the owning EVC/FC id during validation.
    Evc,
    /// Per-class-of-service profile.
    Cos,
}

impl BwpType {
    /// All profile types, in precedence order.
    pub const ALL: [BwpType; 3] = [BwpType::Interface, BwpType::Evc, BwpType::Cos];
}

/// A MEF bandwidth profile: committed/excess information rates and burst sizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthProfile {
    /// Profile identifier (EVC-type profiles are rekeyed to the service id).
    pub id: String,
    /// Original identifier from configuration, if different.
    pub cfg_id: Option<String>,
    /// Profile granularity.
    pub bwp_type: BwpType,
    /// Committed information rate.
    pub cir: Bandwidth,
    /// Excess information rate.
    pub eir: Bandwidth,
    /// Committed burst size in bytes.
    pub cbs: u64,
    /// Excess burst size in bytes.
    pub ebs: u64,
}

impl BandwidthProfile {
    /// Creates an EVC-scoped profile with the given rates and burst sizes.
    pub fn evc(id: impl Into<String>, cir: Bandwidth, eir: Bandwidth, cbs: u64, ebs: u64) -> Self {
        Self {
            id: id.into(),
            cfg_id: None,
            bwp_type: BwpType::Evc,
            cir,
            eir,
            cbs,
            ebs,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_vlan_id_range() {
        assert!(VlanId::new(0).is_none());
        assert!(VlanId::new(4095).is_none());
        assert_eq!(VlanId::new(100).unwrap().value(), 100);
        assert_eq!(VlanId::new(1).unwrap().to_string(), "1");
    }

    #[test]
    fn test_bandwidth_clamped_arithmetic() {
        let cap = Bandwidth::mbps(100);
        let used = Bandwidth::mbps(90);
        assert_eq!(used.add_clamped(Bandwidth::mbps(20), cap), cap);
        assert_eq!(
            Bandwidth::mbps(10).sub_clamped(Bandwidth::mbps(20)),
            Bandwidth::ZERO
        );
    }

    #[test]
    fn test_connect_point_id_round_trip() {
        let cp = ConnectPoint::new(DeviceId::new("of:0001"), PortId::new("3"));
        assert_eq!(cp.id(), "of:0001/3");
        let parsed: ConnectPoint = "of:0001/3".parse().unwrap();
        assert_eq!(parsed, cp);
        assert!("no-port".parse::<ConnectPoint>().is_err());
    }
}
