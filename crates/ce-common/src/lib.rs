//! Common infrastructure shared by the carrier-ethernet crates.
//!
//! Provides the error taxonomy used across the workspace and the
//! reference-counted concurrent resource map backing the global
//! UNI/LTP registry.

mod error;
mod refmap;

pub use error::{CeError, CeResult};
pub use refmap::{RefMap, RefMapError};
