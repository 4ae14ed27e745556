//! Power-flow driver: island orchestration and result merging.
//!
//! [`PowerFlowSolver`] is the configuration surface. It validates the
//! snapshot, splits it into islands, solves each island independently
//! (optionally on rayon workers), and scatters the per-island solutions back
//! through the stored remaps. A structural failure in one island never
//! aborts its siblings; it is surfaced in the merged record.
//!
//! Multiple solver methods can be configured as an ordered retry chain: the
//! next method is attempted whenever the previous one fails to converge, and
//! every attempt lands in the convergence report.

use anyhow::{Context, Result};
use gridflow_core::{find_islands, BusType, Network, TapModuleControl, TapPhaseControl};
use serde::{Deserialize, Serialize};
use web_time::Instant;

use crate::admittance::{Admittance, DEFAULT_IMPEDANCE_EPS};
use crate::jacobian::compute_branch_flows;
use crate::qlimits::QControlMode;
use crate::solver::{solve_island, NumericSolution, SolveOptions, SolverMethod};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// One solver attempt on one island.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergenceRecord {
    pub island: usize,
    pub method: String,
    pub converged: bool,
    pub norm_f: f64,
    pub iterations: usize,
    pub elapsed: f64,
    /// Structural diagnostic when the attempt aborted.
    pub error: Option<String>,
}

/// Merged full-network solution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerFlowResults {
    /// Per-bus voltage magnitude (p.u.) and angle (rad).
    pub vm: Vec<f64>,
    pub va: Vec<f64>,
    /// Calculated complex bus injections, split.
    pub p_calc: Vec<f64>,
    pub q_calc: Vec<f64>,
    /// Final bus classification (reflects reactive-limit switches).
    pub bus_types: Vec<BusType>,
    /// Converged controllable-branch state.
    pub tap_module: Vec<f64>,
    pub tap_angle: Vec<f64>,
    pub beq: Vec<f64>,
    /// Per-branch from/to power flows, split.
    pub pf: Vec<f64>,
    pub qf: Vec<f64>,
    pub pt: Vec<f64>,
    pub qt: Vec<f64>,
    /// Per-branch from/to current magnitudes (p.u.).
    pub if_mag: Vec<f64>,
    pub it_mag: Vec<f64>,
    /// Per-branch series + shunt losses, split.
    pub p_loss: Vec<f64>,
    pub q_loss: Vec<f64>,
    pub island_count: usize,
    pub converged: bool,
    /// Worst final residual norm across islands.
    pub norm_f: f64,
    /// Largest iteration count across islands.
    pub iterations: usize,
    pub elapsed: f64,
    /// Every attempt, in island then retry order.
    pub report: Vec<ConvergenceRecord>,
}

/// Builder-style power-flow configuration.
///
/// ```no_run
/// use gridflow_algo::power_flow::PowerFlowSolver;
/// use gridflow_algo::solver::SolverMethod;
/// # let network = gridflow_core::Network::new();
///
/// let results = PowerFlowSolver::new()
///     .with_tolerance(1e-10)
///     .with_methods(vec![
///         SolverMethod::NewtonRaphson,
///         SolverMethod::LevenbergMarquardt,
///     ])
///     .solve(&network)
///     .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct PowerFlowSolver {
    tolerance: f64,
    max_iterations: usize,
    methods: Vec<SolverMethod>,
    control_q: QControlMode,
    distributed_slack: bool,
    tap_controls: bool,
    trust_radius: f64,
    acceleration: f64,
    verbose: bool,
}

impl Default for PowerFlowSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl PowerFlowSolver {
    pub fn new() -> Self {
        Self {
            tolerance: 1e-8,
            max_iterations: 20,
            methods: vec![SolverMethod::NewtonRaphson],
            control_q: QControlMode::NoControl,
            distributed_slack: false,
            tap_controls: true,
            trust_radius: 1.0,
            acceleration: 0.25,
            verbose: false,
        }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Ordered retry chain; the first converging method wins.
    pub fn with_methods(mut self, methods: Vec<SolverMethod>) -> Self {
        self.methods = methods;
        self
    }

    pub fn with_q_control(mut self, mode: QControlMode) -> Self {
        self.control_q = mode;
        self
    }

    /// Cancel the net island imbalance across generating buses before the
    /// solve, proportionally to dispatch.
    pub fn with_distributed_slack(mut self, enabled: bool) -> Self {
        self.distributed_slack = enabled;
        self
    }

    /// When disabled, every branch control is pinned to its current tap
    /// state and the solve runs as a classic voltage-only problem.
    pub fn with_tap_controls(mut self, enabled: bool) -> Self {
        self.tap_controls = enabled;
        self
    }

    pub fn with_trust_radius(mut self, trust_radius: f64) -> Self {
        self.trust_radius = trust_radius;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    fn options(&self) -> SolveOptions {
        SolveOptions {
            tolerance: self.tolerance,
            max_iterations: self.max_iterations,
            trust_radius: self.trust_radius,
            acceleration: self.acceleration,
            control_q: self.control_q,
            verbose: self.verbose,
        }
    }

    /// Run the configured power flow over the whole snapshot.
    pub fn solve(&self, net: &Network) -> Result<PowerFlowResults> {
        let start = Instant::now();
        net.validate().context("network rejected before solve")?;

        let islands = find_islands(net);
        let opts = self.options();

        let solve_one = |(island_id, island): (usize, &gridflow_core::Island)| {
            let mut sub = island.extract(net);
            if !self.tap_controls {
                for br in &mut sub.branches {
                    br.module_control = TapModuleControl::Fixed;
                    br.phase_control = TapPhaseControl::Fixed;
                }
            }
            if self.distributed_slack {
                distribute_slack(&mut sub, self.verbose);
            }
            self.solve_sub_network(&sub, island_id, &opts)
        };

        #[cfg(feature = "parallel")]
        let outcomes: Vec<IslandOutcome> = islands
            .iter()
            .enumerate()
            .collect::<Vec<_>>()
            .into_par_iter()
            .map(solve_one)
            .collect();
        #[cfg(not(feature = "parallel"))]
        let outcomes: Vec<IslandOutcome> = islands.iter().enumerate().map(solve_one).collect();

        Ok(merge_results(net, &islands, outcomes, start))
    }

    /// Retry chain over one locally-indexed sub-network.
    fn solve_sub_network(
        &self,
        sub: &Network,
        island_id: usize,
        opts: &SolveOptions,
    ) -> IslandOutcome {
        let mut records = Vec::new();
        let mut best: Option<NumericSolution> = None;

        for &method in &self.methods {
            match solve_island(sub, method, opts) {
                Ok(sol) => {
                    records.push(ConvergenceRecord {
                        island: island_id,
                        method: method.to_string(),
                        converged: sol.converged,
                        norm_f: sol.norm_f,
                        iterations: sol.iterations,
                        elapsed: sol.elapsed,
                        error: None,
                    });
                    let done = sol.converged;
                    // Keep the best attempt even when nothing converges.
                    let better = best
                        .as_ref()
                        .map(|b| sol.norm_f < b.norm_f)
                        .unwrap_or(true);
                    if better {
                        best = Some(sol);
                    }
                    if done {
                        break;
                    }
                    eprintln!(
                        "  Island {island_id}: {method} did not converge, trying next method"
                    );
                }
                Err(err) => {
                    eprintln!("  Island {island_id}: {method} aborted: {err}");
                    records.push(ConvergenceRecord {
                        island: island_id,
                        method: method.to_string(),
                        converged: false,
                        norm_f: f64::INFINITY,
                        iterations: 0,
                        elapsed: 0.0,
                        error: Some(err.to_string()),
                    });
                }
            }
        }

        let flows = best.as_ref().and_then(|sol| {
            // Recompose the admittance set at the converged taps for the
            // flow post-processing.
            let mut solved = sub.clone();
            for (k, br) in solved.branches.iter_mut().enumerate() {
                br.tap_module = sol.tap_module[k];
                br.tap_angle = sol.tap_angle[k];
                br.beq = sol.beq[k];
            }
            let adm = Admittance::build(&solved, DEFAULT_IMPEDANCE_EPS).ok()?;
            Some(compute_branch_flows(&solved, &adm, &sol.v))
        });

        IslandOutcome {
            sol: best,
            flows,
            records,
        }
    }
}

struct IslandOutcome {
    sol: Option<NumericSolution>,
    flows: Option<crate::jacobian::BranchFlows>,
    records: Vec<ConvergenceRecord>,
}

/// Pre-solve distributed slack: cancel the island's net active-power
/// imbalance proportionally across generating buses.
fn distribute_slack(sub: &mut Network, verbose: bool) {
    let imbalance: f64 = sub.buses.iter().map(|b| b.p_set).sum();
    let generation: f64 = sub.buses.iter().map(|b| b.p_set.max(0.0)).sum();
    if generation <= 0.0 || imbalance == 0.0 {
        return;
    }
    if verbose {
        eprintln!("  Distributing {imbalance:.4} p.u. slack across generators");
    }
    for bus in &mut sub.buses {
        if bus.p_set > 0.0 {
            bus.p_set -= imbalance * (bus.p_set / generation);
        }
    }
}

fn merge_results(
    net: &Network,
    islands: &[gridflow_core::Island],
    outcomes: Vec<IslandOutcome>,
    start: Instant,
) -> PowerFlowResults {
    let n_bus = net.n_bus();
    let n_branch = net.n_branch();

    let mut vm = vec![1.0; n_bus];
    let mut va = vec![0.0; n_bus];
    let mut p_calc = vec![0.0; n_bus];
    let mut q_calc = vec![0.0; n_bus];
    let mut bus_types: Vec<BusType> = net.buses.iter().map(|b| b.bus_type).collect();
    let mut tap_module: Vec<f64> = net.branches.iter().map(|b| b.tap_module).collect();
    let mut tap_angle: Vec<f64> = net.branches.iter().map(|b| b.tap_angle).collect();
    let mut beq: Vec<f64> = net.branches.iter().map(|b| b.beq).collect();
    let mut pf = vec![0.0; n_branch];
    let mut qf = vec![0.0; n_branch];
    let mut pt = vec![0.0; n_branch];
    let mut qt = vec![0.0; n_branch];
    let mut if_mag = vec![0.0; n_branch];
    let mut it_mag = vec![0.0; n_branch];
    let mut p_loss = vec![0.0; n_branch];
    let mut q_loss = vec![0.0; n_branch];

    let mut converged = true;
    let mut norm_f: f64 = 0.0;
    let mut iterations = 0;
    let mut report = Vec::new();

    for (island, outcome) in islands.iter().zip(outcomes.into_iter()) {
        report.extend(outcome.records);
        let Some(sol) = outcome.sol else {
            converged = false;
            norm_f = f64::INFINITY;
            continue;
        };
        converged &= sol.converged;
        norm_f = norm_f.max(sol.norm_f);
        iterations = iterations.max(sol.iterations);

        for (local, &global) in island.bus_global.iter().enumerate() {
            vm[global] = sol.v[local].norm();
            va[global] = sol.v[local].arg();
            p_calc[global] = sol.scalc[local].re;
            q_calc[global] = sol.scalc[local].im;
            bus_types[global] = sol.bus_types[local];
        }
        for (local, &global) in island.branch_global.iter().enumerate() {
            tap_module[global] = sol.tap_module[local];
            tap_angle[global] = sol.tap_angle[local];
            beq[global] = sol.beq[local];
            if let Some(flows) = &outcome.flows {
                pf[global] = flows.sf[local].re;
                qf[global] = flows.sf[local].im;
                pt[global] = flows.st[local].re;
                qt[global] = flows.st[local].im;
                if_mag[global] = flows.if_[local].norm();
                it_mag[global] = flows.it[local].norm();
                let loss = flows.sf[local] + flows.st[local];
                p_loss[global] = loss.re;
                q_loss[global] = loss.im;
            }
        }
    }

    PowerFlowResults {
        vm,
        va,
        p_calc,
        q_calc,
        bus_types,
        tap_module,
        tap_angle,
        beq,
        pf,
        qf,
        pt,
        qt,
        if_mag,
        it_mag,
        p_loss,
        q_loss,
        island_count: islands.len(),
        converged,
        norm_f,
        iterations,
        elapsed: start.elapsed().as_secs_f64(),
        report,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridflow_core::{Branch, Bus, BusIdx};

    fn two_bus() -> Network {
        let mut net = Network::new();
        let b1 = net.add_bus(Bus::new("slack", BusType::Slack));
        let b2 = net.add_bus(Bus::new("load", BusType::Pq).with_injection(-0.5, -0.2));
        net.add_branch(Branch::new("line", b1, b2, 0.01, 0.05));
        net
    }

    /// Two electrically identical 2-bus systems in one snapshot.
    fn doubled() -> Network {
        let mut net = two_bus();
        let b3 = net.add_bus(Bus::new("slack2", BusType::Slack));
        let b4 = net.add_bus(Bus::new("load2", BusType::Pq).with_injection(-0.5, -0.2));
        net.add_branch(Branch::new("line2", b3, b4, 0.01, 0.05));
        net
    }

    #[test]
    fn test_solve_two_bus() {
        let net = two_bus();
        let res = PowerFlowSolver::new().solve(&net).unwrap();
        assert!(res.converged);
        assert_eq!(res.island_count, 1);
        assert!(res.vm[1] > 0.9 && res.vm[1] < 1.0);
        assert_eq!(res.report.len(), 1);
        assert_eq!(res.report[0].method, "NR");
    }

    #[test]
    fn test_island_isolation_matches_separate_solves() {
        let joint = PowerFlowSolver::new().solve(&doubled()).unwrap();
        let single = PowerFlowSolver::new().solve(&two_bus()).unwrap();
        assert_eq!(joint.island_count, 2);
        assert!(joint.converged);
        for (j, s) in [(1usize, 1usize), (3, 1)] {
            assert!(
                (joint.vm[j] - single.vm[s]).abs() < 1e-12,
                "bus {j} diverges from isolated solve"
            );
            assert!((joint.va[j] - single.va[s]).abs() < 1e-12);
        }
    }

    #[test]
    fn test_failed_island_does_not_abort_siblings() {
        let mut net = doubled();
        // Remove the second island's slack: structural failure there only.
        net.buses[2].bus_type = BusType::Pq;
        let res = PowerFlowSolver::new().solve(&net).unwrap();
        assert!(!res.converged);
        // First island still solved.
        assert!(res.vm[1] > 0.9 && res.vm[1] < 1.0);
        let failed: Vec<_> = res.report.iter().filter(|r| r.error.is_some()).collect();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].error.as_ref().unwrap().contains("slack"));
    }

    #[test]
    fn test_retry_chain_records_every_attempt() {
        let net = two_bus();
        // Starve the first method of iterations so the chain advances.
        let res = PowerFlowSolver::new()
            .with_max_iterations(1)
            .with_methods(vec![
                SolverMethod::LevenbergMarquardt,
                SolverMethod::NewtonRaphson,
            ])
            .solve(&net)
            .unwrap();
        assert_eq!(res.report.len(), 2);
        assert_eq!(res.report[0].method, "LM");
        assert_eq!(res.report[1].method, "NR");
    }

    #[test]
    fn test_branch_flow_balance() {
        let net = two_bus();
        let res = PowerFlowSolver::new().solve(&net).unwrap();
        // Losses equal the sum of both side flows and are non-negative for
        // a resistive line.
        assert!((res.p_loss[0] - (res.pf[0] + res.pt[0])).abs() < 1e-12);
        assert!(res.p_loss[0] > 0.0);
        // To-side active flow feeds the load.
        assert!((res.pt[0] - (-0.5)).abs() < 1e-6);
    }

    #[test]
    fn test_empty_network_rejected() {
        let net = Network::new();
        assert!(PowerFlowSolver::new().solve(&net).is_err());
    }

    #[test]
    fn test_deactivated_branch_kept_at_zero_flow() {
        let mut net = two_bus();
        net.add_branch(
            Branch::new("open", BusIdx::new(0), BusIdx::new(1), 0.02, 0.1).deactivated(),
        );
        let res = PowerFlowSolver::new().solve(&net).unwrap();
        assert!(res.converged);
        assert_eq!(res.pf[1], 0.0);
        assert_eq!(res.qf[1], 0.0);
    }

    #[test]
    fn test_distributed_slack_reduces_slack_pickup() {
        let mut net = Network::new();
        let b1 = net.add_bus(Bus::new("slack", BusType::Slack));
        let b2 = net.add_bus(
            Bus::new("gen", BusType::Pv)
                .with_injection(0.3, 0.0)
                .with_vm_set(1.0),
        );
        let b3 = net.add_bus(Bus::new("load", BusType::Pq).with_injection(-0.8, -0.3));
        net.add_branch(Branch::new("l12", b1, b2, 0.01, 0.05));
        net.add_branch(Branch::new("l23", b2, b3, 0.01, 0.05));

        let plain = PowerFlowSolver::new().solve(&net).unwrap();
        let dist = PowerFlowSolver::new()
            .with_distributed_slack(true)
            .solve(&net)
            .unwrap();
        assert!(dist.converged);
        // The rebalanced dispatch leaves less for the slack bus to pick up.
        assert!(dist.p_calc[0].abs() < plain.p_calc[0].abs());
    }

    #[test]
    fn test_tap_controls_disabled_pins_tap() {
        let mut net = Network::new();
        let b1 = net.add_bus(Bus::new("slack", BusType::Slack));
        let b2 = net.add_bus(Bus::new("reg", BusType::Pq).with_injection(-0.3, -0.1));
        net.add_branch(
            Branch::new("t12", b1, b2, 0.005, 0.05)
                .with_module_control(TapModuleControl::Vm),
        );
        net.branches[0].vt_set = 1.0;

        let regulated = PowerFlowSolver::new().solve(&net).unwrap();
        let pinned = PowerFlowSolver::new()
            .with_tap_controls(false)
            .solve(&net)
            .unwrap();
        assert!(regulated.converged && pinned.converged);
        // Regulated: setpoint held by moving the tap off nominal.
        assert!((regulated.vm[1] - 1.0).abs() < 1e-8);
        assert!((regulated.tap_module[0] - 1.0).abs() > 1e-6);
        // Pinned: tap stays at nominal and the bus sags like a plain load.
        assert_eq!(pinned.tap_module[0], 1.0);
        assert!((pinned.vm[1] - 1.0).abs() > 1e-4);
    }

    #[test]
    fn test_results_serializable() {
        let net = two_bus();
        let res = PowerFlowSolver::new().solve(&net).unwrap();
        let json = serde_json::to_string(&res).unwrap();
        assert!(json.contains("\"converged\":true"));
    }
}
