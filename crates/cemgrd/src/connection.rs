//! Service connectivity classification and lifecycle state.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Connectivity shape of a service or forwarding construct.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ConnectionType {
    /// Exactly two endpoints.
    PointToPoint,
    /// Any-to-any among all endpoints.
    Multipoint,
    /// Roots reach everyone; leaves reach only roots.
    RootMultipoint,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionType::PointToPoint => "Point_To_Point",
            ConnectionType::Multipoint => "Multipoint_To_Multipoint",
            ConnectionType::RootMultipoint => "Root_Multipoint",
        };
        f.write_str(s)
    }
}

/// Lifecycle state of a service or forwarding construct.
///
/// States aggregate upward: an EVC is `Active` only when every one of its
/// forwarding constructs is, `Partial` when at least one is active, and
/// `Inactive` otherwise.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ConnectionState {
    /// Not installed in the data plane.
    #[default]
    Inactive,
    /// Some but not all required connectivity is installed.
    Partial,
    /// All required connectivity is installed.
    Active,
}

impl ConnectionState {
    /// Folds the states of constituent parts into an aggregate state.
    pub fn aggregate<I: IntoIterator<Item = ConnectionState>>(parts: I) -> ConnectionState {
        let mut any_active = false;
        let mut all_active = true;
        let mut seen = false;
        for state in parts {
            seen = true;
            match state {
                ConnectionState::Active => any_active = true,
                ConnectionState::Partial => {
                    any_active = true;
                    all_active = false;
                }
                ConnectionState::Inactive => all_active = false,
            }
        }
        match (seen, any_active, all_active) {
            (false, ..) | (_, false, _) => ConnectionState::Inactive,
            (_, true, true) => ConnectionState::Active,
            (_, true, false) => ConnectionState::Partial,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Inactive => "INACTIVE",
            ConnectionState::Partial => "PARTIAL",
            ConnectionState::Active => "ACTIVE",
        };
        f.write_str(s)
    }
}
