//! # gridflow-algo: AC Power-Flow Solvers
//!
//! Numerical machinery for steady-state AC power flow on
//! [`gridflow_core::Network`] snapshots, including the generalized
//! formulation where transformer taps, phase shifts, and converter shunt
//! susceptances are solved as unknowns alongside bus voltages.
//!
//! ## Solvers
//!
//! The [`PowerFlowSolver`] driver dispatches to the iterative cores in
//! [`solver`]:
//!
//! | Method | Description |
//! |--------|-------------|
//! | [`SolverMethod::NewtonRaphson`] | Full-step Newton-Raphson |
//! | [`SolverMethod::NewtonRaphsonLineSearch`] | Newton with backtracking |
//! | [`SolverMethod::Iwamoto`] | Newton with optimal acceleration factor |
//! | [`SolverMethod::LevenbergMarquardt`] | Damped least-squares fallback |
//!
//! ## Pipeline
//!
//! - **[`admittance`]**: sparse admittance matrices with incremental
//!   tap/susceptance updates
//! - **[`control`]**: square-system layout of unknowns and residuals
//! - **[`jacobian`]**: sparse Jacobian assembly and residual evaluation
//! - **[`qlimits`]**: generator reactive-limit enforcement
//! - **[`solver`]**: per-island iterative cores
//! - **[`power_flow`]**: validation, island splitting, retry chains, and
//!   result merging
//!
//! ## Example
//!
//! ```no_run
//! use gridflow_algo::{PowerFlowSolver, SolverMethod};
//! # let network = gridflow_core::Network::new();
//!
//! let results = PowerFlowSolver::new()
//!     .with_tolerance(1e-10)
//!     .with_methods(vec![SolverMethod::NewtonRaphson, SolverMethod::Iwamoto])
//!     .solve(&network)
//!     .unwrap();
//! assert!(results.converged);
//! ```

pub mod admittance;
pub mod control;
pub mod jacobian;
pub mod power_flow;
pub mod qlimits;
pub mod solver;

pub use admittance::{Admittance, AdmittanceError, DEFAULT_IMPEDANCE_EPS};
pub use control::{ControlIndices, ResolveError, Residual, Unknown};
pub use jacobian::{
    compute_branch_flows, compute_residuals, compute_scalc, norm_inf, BranchFlows,
    JacobianStrategy,
};
pub use power_flow::{ConvergenceRecord, PowerFlowResults, PowerFlowSolver};
pub use qlimits::{enforce_q_limits, QControlMode};
pub use solver::{solve_island, NumericSolution, SolveError, SolveOptions, SolverMethod};
