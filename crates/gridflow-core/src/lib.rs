//! # gridflow-core: Network Modeling Core
//!
//! Provides the flat per-unit network snapshot and topological utilities
//! shared by the power-flow algorithm crates.
//!
//! ## Design Philosophy
//!
//! The snapshot is a **flattened numerical representation**: bus arrays and
//! branch arrays with positional indices, the form the solvers consume
//! directly. Importers for external formats live outside this workspace and
//! construct [`Network`] values; the core performs no file I/O.
//!
//! - Type-safe element references with newtype indices ([`BusIdx`],
//!   [`BranchIdx`])
//! - Branch control declared as tagged enums ([`TapModuleControl`],
//!   [`TapPhaseControl`]) with capability queries, never sentinel values
//! - Island detection over the active-branch connectivity graph
//!
//! ## Modules
//!
//! - [`model`] - Bus/Branch/Network snapshot types
//! - [`islands`] - Connected-component decomposition with index remaps
//! - [`error`] - Unified error type for API boundaries

pub mod error;
pub mod islands;
pub mod model;

pub use error::{GridError, GridResult};
pub use islands::{find_islands, Island};
pub use model::{
    Branch, BranchIdx, Bus, BusIdx, BusType, Network, TapModuleControl, TapPhaseControl,
};
