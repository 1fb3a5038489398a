#![forbid(unsafe_code)]
//! SimFS public API facade.
//!
//! Re-exports the facade from `simfs-core` together with the maintenance
//! surfaces (compaction, crash simulation, recovery) through one crate that
//! downstream consumers (CLI, harness) depend on.

pub use simfs_core::*;
pub use simfs_error::{Result, SimfsError};

pub use simfs_defrag as defrag;
pub use simfs_repair as repair;
pub use simfs_types as types;
