//! Newton-type iteration engines for one island.
//!
//! The state machine is Init -> Iterate -> {Converged | Diverged | MaxIter}.
//! Every iterate step evaluates the residual, assembles the Jacobian, solves
//! the linear system through faer's partial-pivot LU, and applies the update
//! scaled by the variant's step-size strategy:
//!
//! - [`SolverMethod::NewtonRaphson`] takes the full step.
//! - [`SolverMethod::NewtonRaphsonLineSearch`] backtracks while the residual
//!   norm worsens, up to a retry cap; exhaustion reports non-convergence.
//! - [`SolverMethod::Iwamoto`] scales by the real root of the optimal-
//!   multiplier cubic, falling back to 1.0 on a degenerate increment.
//! - [`SolverMethod::LevenbergMarquardt`] solves damped normal equations
//!   with a trust-region accept/reject on lambda.
//!
//! Non-convergence is data, not an error: only structural failures (no
//! slack, singular matrix, dimension mismatch) abort an island's solve.

use gridflow_core::{BusType, Network};
use hashbrown::HashMap;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use sprs::CsMat;
use thiserror::Error;
use web_time::Instant;

use faer::prelude::SpSolver;
use faer::{FaerMat, Mat};

use crate::admittance::{Admittance, AdmittanceError, DEFAULT_IMPEDANCE_EPS};
use crate::control::{ControlIndices, ResolveError, Unknown};
use crate::jacobian::{assemble, compute_residuals, compute_scalc, norm_inf};
use crate::qlimits::{enforce_q_limits, QControlMode};

/// Taps driven below this are clamped (and the clamp logged).
const TAP_MODULE_FLOOR: f64 = 1e-6;

/// Solver variant for one island attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolverMethod {
    NewtonRaphson,
    NewtonRaphsonLineSearch,
    Iwamoto,
    LevenbergMarquardt,
}

impl std::fmt::Display for SolverMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SolverMethod::NewtonRaphson => "NR",
            SolverMethod::NewtonRaphsonLineSearch => "NR-LS",
            SolverMethod::Iwamoto => "Iwamoto",
            SolverMethod::LevenbergMarquardt => "LM",
        };
        write!(f, "{name}")
    }
}

/// Numeric knobs shared by every variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolveOptions {
    pub tolerance: f64,
    pub max_iterations: usize,
    /// Initial step scale for the line-search variant.
    pub trust_radius: f64,
    /// Backtracking shrink factor.
    pub acceleration: f64,
    pub control_q: QControlMode,
    pub verbose: bool,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            tolerance: 1e-8,
            max_iterations: 20,
            trust_radius: 1.0,
            acceleration: 0.25,
            control_q: QControlMode::NoControl,
            verbose: false,
        }
    }
}

/// Structural failures that abort one island's solve. Numeric
/// non-convergence is never one of these.
#[derive(Debug, Error)]
pub enum SolveError {
    #[error("No slack bus in a non-trivial island ({n_bus} buses)")]
    NoSlack { n_bus: usize },

    #[error("Singular Jacobian matrix (faer solver)")]
    SingularJacobian,

    #[error("Jacobian dimension {got} does not match {expected} unknowns")]
    DimensionMismatch { expected: usize, got: usize },

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Admittance(#[from] AdmittanceError),
}

/// Uniform outcome record for one island attempt. Degenerate cases (no
/// unknowns) come back converged with zero iterations rather than as a
/// sentinel value.
#[derive(Debug, Clone)]
pub struct NumericSolution {
    pub v: Vec<Complex64>,
    pub scalc: Vec<Complex64>,
    pub bus_types: Vec<BusType>,
    pub tap_module: Vec<f64>,
    pub tap_angle: Vec<f64>,
    pub beq: Vec<f64>,
    pub converged: bool,
    pub norm_f: f64,
    pub iterations: usize,
    pub elapsed: f64,
}

/// Mutable per-iteration state: voltage, the admittance set with its
/// embedded taps, the specification vector, and the current classification.
#[derive(Clone)]
struct IterState {
    v: Vec<Complex64>,
    adm: Admittance,
    sbus: Vec<Complex64>,
    bus_types: Vec<BusType>,
    idx: ControlIndices,
}

impl IterState {
    fn residual(&self, net: &Network) -> Vec<f64> {
        compute_residuals(net, &self.adm, &self.idx, &self.v, &self.sbus)
    }

    fn jacobian(&self, net: &Network) -> Result<CsMat<f64>, SolveError> {
        let jac = assemble(net, &self.adm, &self.idx, &self.v);
        if jac.rows() != self.idx.len() || jac.cols() != self.idx.len() {
            return Err(SolveError::DimensionMismatch {
                expected: self.idx.len(),
                got: jac.rows(),
            });
        }
        Ok(jac)
    }

    /// New state with the scaled update applied. Voltage entries move in
    /// polar form; tap and Beq unknowns go through the incremental matrix
    /// update so the primitives stay consistent.
    fn stepped(&self, dx: &[f64], mu: f64) -> Result<IterState, SolveError> {
        let mut next = self.clone();
        let mut tap_new: HashMap<usize, (f64, f64)> = HashMap::new();
        let mut beq_new: Vec<(usize, f64)> = Vec::new();

        for (col, u) in self.idx.unknowns.iter().enumerate() {
            let step = mu * dx[col];
            match *u {
                Unknown::Va(i) => {
                    let (m, a) = (next.v[i].norm(), next.v[i].arg());
                    next.v[i] = Complex64::from_polar(m, a + step);
                }
                Unknown::Vm(i) => {
                    let (m, a) = (next.v[i].norm(), next.v[i].arg());
                    next.v[i] = Complex64::from_polar(m + step, a);
                }
                Unknown::TapModule(k) => {
                    let entry = tap_new
                        .entry(k)
                        .or_insert((self.adm.tap_module(k), self.adm.tap_angle(k)));
                    let m = entry.0 + step;
                    if m < TAP_MODULE_FLOOR {
                        eprintln!("  Branch {}: tap module step clamped at {:.1e}", k, TAP_MODULE_FLOOR);
                    }
                    entry.0 = m.max(TAP_MODULE_FLOOR);
                }
                Unknown::TapAngle(k) => {
                    let entry = tap_new
                        .entry(k)
                        .or_insert((self.adm.tap_module(k), self.adm.tap_angle(k)));
                    entry.1 += step;
                }
                Unknown::Beq(k) => beq_new.push((k, self.adm.beq(k) + step)),
            }
        }

        let tap_changes: Vec<(usize, f64, f64)> =
            tap_new.into_iter().map(|(k, (m, t))| (k, m, t)).collect();
        next.adm.update_taps(&tap_changes)?;
        next.adm.update_beq(&beq_new)?;
        Ok(next)
    }
}

/// Flat start: fixed-Vm buses at their setpoint, the rest at 1.0 p.u.
fn initial_voltage(net: &Network, bus_types: &[BusType]) -> Vec<Complex64> {
    net.buses
        .iter()
        .zip(bus_types.iter())
        .map(|(bus, &t)| match t {
            BusType::Slack | BusType::Pv | BusType::Pqv => Complex64::new(bus.vm_set, 0.0),
            _ => Complex64::new(1.0, 0.0),
        })
        .collect()
}

fn specified_injections(net: &Network) -> Vec<Complex64> {
    net.buses
        .iter()
        .map(|b| Complex64::new(b.p_set, b.q_set))
        .collect()
}

/// Dense LU solve of the sparse system, with the NaN check that turns a
/// numerically singular factorization into a structural error.
fn solve_linear_system_faer(jac: &CsMat<f64>, b: &[f64]) -> Result<Vec<f64>, SolveError> {
    let n = b.len();
    if n == 0 {
        return Ok(vec![]);
    }

    let mut mat = Mat::zeros(n, n);
    for (&val, (i, j)) in jac.iter() {
        mat.write(i, j, val);
    }
    let mut rhs = Mat::zeros(n, 1);
    for (i, &bi) in b.iter().enumerate() {
        rhs.write(i, 0, bi);
    }

    let lu = mat.partial_piv_lu();
    let solution = lu.solve(&rhs);
    let x: Vec<f64> = (0..n).map(|i| solution.read(i, 0)).collect();

    if x.iter().any(|&v| !v.is_finite()) {
        return Err(SolveError::SingularJacobian);
    }
    Ok(x)
}

/// Coarse gate for reactive-limit checks, looser than full convergence.
fn q_limit_threshold(tolerance: f64) -> f64 {
    (tolerance.sqrt() * 100.0).min(0.01)
}

/// Solve one island with the requested variant.
pub fn solve_island(
    net: &Network,
    method: SolverMethod,
    opts: &SolveOptions,
) -> Result<NumericSolution, SolveError> {
    let start = Instant::now();
    let bus_types: Vec<BusType> = net.buses.iter().map(|b| b.bus_type).collect();
    let sbus = specified_injections(net);

    // Slack-free islands: trivially converged when dead, unsolvable
    // otherwise.
    if !bus_types.contains(&BusType::Slack) {
        let net_power: f64 = sbus.iter().map(|s| s.norm()).sum();
        if net_power <= opts.tolerance {
            let v = initial_voltage(net, &bus_types);
            return Ok(finish(net, None, v, bus_types, true, 0.0, 0, start));
        }
        return Err(SolveError::NoSlack { n_bus: net.n_bus() });
    }

    let mut adm = Admittance::build(net, DEFAULT_IMPEDANCE_EPS)?;
    adm.build_update_maps(net);
    let idx = ControlIndices::resolve(net, &bus_types)?;
    let mut v = initial_voltage(net, &bus_types);
    // Remotely-held magnitudes have no unknown of their own; they are fixed
    // at the controlling branch's setpoint from the start.
    for (&k, &i) in idx.k_m_vm.iter().zip(idx.i_m_vm.iter()) {
        v[i] = Complex64::from_polar(net.branches[k].vt_set, v[i].arg());
    }
    for (&k, &i) in idx.k_beq_vf.iter().zip(idx.i_beq_vf.iter()) {
        v[i] = Complex64::from_polar(net.branches[k].vf_set, v[i].arg());
    }

    let state = IterState {
        v,
        adm,
        sbus,
        bus_types,
        idx,
    };

    if state.idx.is_empty() {
        let IterState {
            v, adm, bus_types, ..
        } = state;
        return Ok(finish(net, Some(&adm), v, bus_types, true, 0.0, 0, start));
    }

    match method {
        SolverMethod::NewtonRaphson => newton_raphson(net, opts, state, false, start),
        SolverMethod::NewtonRaphsonLineSearch => newton_raphson(net, opts, state, true, start),
        SolverMethod::Iwamoto => iwamoto(net, opts, state, start),
        SolverMethod::LevenbergMarquardt => levenberg_marquardt(net, opts, state, start),
    }
}

#[allow(clippy::too_many_arguments)]
fn finish(
    net: &Network,
    adm: Option<&Admittance>,
    v: Vec<Complex64>,
    bus_types: Vec<BusType>,
    converged: bool,
    norm_f: f64,
    iterations: usize,
    start: Instant,
) -> NumericSolution {
    let n_branch = net.n_branch();
    let (scalc, tap_module, tap_angle, beq) = match adm {
        Some(adm) => (
            compute_scalc(adm, &v),
            (0..n_branch).map(|k| adm.tap_module(k)).collect(),
            (0..n_branch).map(|k| adm.tap_angle(k)).collect(),
            (0..n_branch).map(|k| adm.beq(k)).collect(),
        ),
        None => (
            vec![Complex64::ZERO; net.n_bus()],
            net.branches.iter().map(|b| b.tap_module).collect(),
            net.branches.iter().map(|b| b.tap_angle).collect(),
            net.branches.iter().map(|b| b.beq).collect(),
        ),
    };
    NumericSolution {
        v,
        scalc,
        bus_types,
        tap_module,
        tap_angle,
        beq,
        converged,
        norm_f,
        iterations,
        elapsed: start.elapsed().as_secs_f64(),
    }
}

/// Reactive-limit re-entry: when the norm is inside the coarse gate and a
/// voltage-holding bus violates its band, reclassify, re-resolve the index
/// sets, and recompute the residual. Returns the refreshed residual if
/// anything changed.
fn q_limit_pass(
    net: &Network,
    opts: &SolveOptions,
    state: &mut IterState,
    norm: f64,
) -> Result<Option<Vec<f64>>, SolveError> {
    if opts.control_q != QControlMode::Direct
        || norm >= q_limit_threshold(opts.tolerance)
        || !state.bus_types.iter().any(|t| t.holds_voltage())
    {
        return Ok(None);
    }
    let scalc = compute_scalc(&state.adm, &state.v);
    let changes = enforce_q_limits(net, &scalc, &mut state.bus_types, &mut state.sbus);
    if changes == 0 {
        return Ok(None);
    }
    if opts.verbose {
        eprintln!("  Q-limit pass reclassified {changes} buses, re-resolving indices");
    }
    state.idx = ControlIndices::resolve(net, &state.bus_types)?;
    Ok(Some(state.residual(net)))
}

fn newton_raphson(
    net: &Network,
    opts: &SolveOptions,
    mut state: IterState,
    line_search: bool,
    start: Instant,
) -> Result<NumericSolution, SolveError> {
    let mut f = state.residual(net);
    let mut norm = norm_inf(&f);
    let mut iterations = 0;
    let mut converged = norm < opts.tolerance;

    while !converged && iterations < opts.max_iterations {
        let jac = state.jacobian(net)?;
        let rhs: Vec<f64> = f.iter().map(|x| -x).collect();
        let dx = solve_linear_system_faer(&jac, &rhs)?;

        let mut mu = if line_search { opts.trust_radius } else { 1.0 };
        let mut trial = state.stepped(&dx, mu)?;
        let mut f_new = trial.residual(net);
        let mut norm_new = norm_inf(&f_new);

        if line_search {
            let mut l_iter = 0;
            while norm_new > norm && l_iter < 10 && mu > 0.01 {
                mu *= opts.acceleration;
                trial = state.stepped(&dx, mu)?;
                f_new = trial.residual(net);
                norm_new = norm_inf(&f_new);
                l_iter += 1;
            }
            if norm_new > norm {
                // Even the smallest tried step made things worse.
                if opts.verbose {
                    eprintln!("  Backtracking exhausted at iteration {iterations}, reporting non-convergence");
                }
                iterations += 1;
                break;
            }
        }

        state = trial;
        f = f_new;
        norm = norm_new;
        iterations += 1;

        if let Some(f2) = q_limit_pass(net, opts, &mut state, norm)? {
            f = f2;
            norm = norm_inf(&f);
        }
        converged = norm < opts.tolerance;
        if opts.verbose {
            eprintln!("  iter {iterations}: norm_f = {norm:.3e}");
        }
    }

    let IterState {
        v, adm, bus_types, ..
    } = state;
    Ok(finish(net, Some(&adm), v, bus_types, converged, norm, iterations, start))
}

/// Real root of the optimal-multiplier cubic g3·x³+g2·x²+g1·x+g0, searched
/// by scalar Newton from 1.0.
fn cubic_real_root(g0: f64, g1: f64, g2: f64, g3: f64) -> Option<f64> {
    let g = |x: f64| g0 + g1 * x + g2 * x * x + g3 * x * x * x;
    let dg = |x: f64| g1 + 2.0 * g2 * x + 3.0 * g3 * x * x;
    let mut x = 1.0_f64;
    for _ in 0..30 {
        let d = dg(x);
        if d.abs() < 1e-30 {
            return None;
        }
        let x_next = x - g(x) / d;
        if !x_next.is_finite() {
            return None;
        }
        if (x_next - x).abs() < 1e-12 {
            return Some(x_next);
        }
        x = x_next;
    }
    Some(x)
}

fn iwamoto(
    net: &Network,
    opts: &SolveOptions,
    mut state: IterState,
    start: Instant,
) -> Result<NumericSolution, SolveError> {
    let mut f = state.residual(net);
    let mut norm = norm_inf(&f);
    let mut iterations = 0;
    let mut converged = norm < opts.tolerance;

    while !converged && iterations < opts.max_iterations {
        let jac = state.jacobian(net)?;
        let rhs: Vec<f64> = f.iter().map(|x| -x).collect();
        let dx = solve_linear_system_faer(&jac, &rhs)?;

        // Complex voltage increment written as dVm·e^{j·dVa}: zero wherever
        // the bus has no magnitude unknown, which is exactly the degenerate
        // case the 1.0 fallback covers.
        let n = net.n_bus();
        let mut dvm = vec![0.0; n];
        let mut dva = vec![0.0; n];
        for (col, u) in state.idx.unknowns.iter().enumerate() {
            match *u {
                Unknown::Va(i) => dva[i] = dx[col],
                Unknown::Vm(i) => dvm[i] = dx[col],
                _ => {}
            }
        }
        let dv: Vec<Complex64> = dvm
            .iter()
            .zip(dva.iter())
            .map(|(&m, &a)| Complex64::from_polar(m, a))
            .collect();

        let mu = if dv.iter().any(|d| d.norm() == 0.0) {
            1.0
        } else {
            optimal_multiplier(net, &state, &f, &jac, &dx, &dv)
        };

        state = state.stepped(&dx, mu)?;
        f = state.residual(net);
        norm = norm_inf(&f);
        iterations += 1;

        if let Some(f2) = q_limit_pass(net, opts, &mut state, norm)? {
            f = f2;
            norm = norm_inf(&f);
        }
        converged = norm < opts.tolerance;
        if opts.verbose {
            eprintln!("  iter {iterations}: mu = {mu:.4}, norm_f = {norm:.3e}");
        }
    }

    let IterState {
        v, adm, bus_types, ..
    } = state;
    Ok(finish(net, Some(&adm), v, bus_types, converged, norm, iterations, start))
}

/// Iwamoto acceleration parameter from the second-order residual expansion
/// F(x + mu·dx) ≈ a + mu·b + mu²·c with c taken from the Jacobian evaluated
/// at the voltage increment.
fn optimal_multiplier(
    net: &Network,
    state: &IterState,
    f: &[f64],
    jac: &CsMat<f64>,
    dx: &[f64],
    dv: &[Complex64],
) -> f64 {
    let jac2 = assemble(net, &state.adm, &state.idx, dv);
    let b = sparse_matvec(jac, dx);
    let j2dx = sparse_matvec(&jac2, dx);
    let c: Vec<f64> = dx.iter().zip(j2dx.iter()).map(|(x, y)| 0.5 * x * y).collect();

    let dot = |x: &[f64], y: &[f64]| x.iter().zip(y.iter()).map(|(a, b)| a * b).sum::<f64>();
    let g0 = dot(f, &b);
    let g1 = dot(&b, &b) + 2.0 * dot(f, &c);
    let g2 = 3.0 * dot(&b, &c);
    let g3 = 2.0 * dot(&c, &c);

    match cubic_real_root(g0, g1, g2, g3) {
        Some(mu) if mu.is_finite() && mu > 0.0 && mu <= 1.5 => mu,
        _ => 1.0,
    }
}

fn sparse_matvec(mat: &CsMat<f64>, x: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; mat.rows()];
    for (&val, (i, j)) in mat.iter() {
        out[i] += val * x[j];
    }
    out
}

fn levenberg_marquardt(
    net: &Network,
    opts: &SolveOptions,
    mut state: IterState,
    start: Instant,
) -> Result<NumericSolution, SolveError> {
    let mut f = state.residual(net);
    let mut norm = norm_inf(&f);
    let mut cost = 0.5 * f.iter().map(|x| x * x).sum::<f64>();
    let mut lambda = 0.0;
    let mut nu = 2.0;
    let mut first = true;
    let mut iterations = 0;
    let mut converged = norm < opts.tolerance;

    while !converged && iterations < opts.max_iterations {
        // A reactive-limit switch re-resolves the indices mid-solve, so the
        // system dimension is re-read every iteration.
        let dim = state.idx.len();
        let jac = state.jacobian(net)?;

        // Normal equations H^T·H and H^T·dz accumulated from the sparse
        // rows; dz is the negated residual.
        let mut h2 = vec![vec![0.0; dim]; dim];
        let mut rhs = vec![0.0; dim];
        let indptr = jac.indptr();
        for row in 0..dim {
            let s = indptr.index(row);
            let e = indptr.index(row + 1);
            let cols = &jac.indices()[s..e];
            let vals = &jac.data()[s..e];
            for (&ci, &vi) in cols.iter().zip(vals.iter()) {
                rhs[ci] += vi * (-f[row]);
                for (&cj, &vj) in cols.iter().zip(vals.iter()) {
                    h2[ci][cj] += vi * vj;
                }
            }
        }

        if first {
            let max_diag = (0..dim).fold(0.0_f64, |acc, i| acc.max(h2[i][i]));
            lambda = 1e-3 * max_diag;
            first = false;
        }

        let mut a = Mat::zeros(dim, dim);
        for (i, row) in h2.iter().enumerate() {
            for (j, &val) in row.iter().enumerate() {
                a.write(i, j, val);
            }
            a.write(i, i, h2[i][i] + lambda);
        }
        let mut b = Mat::zeros(dim, 1);
        for (i, &r) in rhs.iter().enumerate() {
            b.write(i, 0, r);
        }
        let sol = a.partial_piv_lu().solve(&b);
        let dx: Vec<f64> = (0..dim).map(|i| sol.read(i, 0)).collect();
        if dx.iter().any(|x| !x.is_finite()) {
            return Err(SolveError::SingularJacobian);
        }

        let trial = state.stepped(&dx, 1.0)?;
        let f_new = trial.residual(net);
        let cost_new = 0.5 * f_new.iter().map(|x| x * x).sum::<f64>();

        // Gain ratio: actual cost reduction over the reduction the damped
        // model predicted.
        let predicted: f64 = dx
            .iter()
            .zip(rhs.iter())
            .map(|(d, r)| 0.5 * d * (lambda * d + r))
            .sum();
        let rho = if predicted.abs() > 0.0 {
            (cost - cost_new) / predicted
        } else {
            -1.0
        };

        if rho > 0.0 {
            state = trial;
            f = f_new;
            cost = cost_new;
            norm = norm_inf(&f);
            lambda *= (1.0_f64 / 3.0).max(1.0 - (2.0 * rho - 1.0).powi(3));
            nu = 2.0;
        } else {
            lambda *= nu;
            nu *= 2.0;
        }
        iterations += 1;

        if rho > 0.0 {
            if let Some(f2) = q_limit_pass(net, opts, &mut state, norm)? {
                f = f2;
                norm = norm_inf(&f);
                cost = 0.5 * f.iter().map(|x| x * x).sum::<f64>();
            }
        }
        converged = norm < opts.tolerance;
        if opts.verbose {
            eprintln!(
                "  iter {iterations}: lambda = {lambda:.3e}, rho = {rho:.3}, norm_f = {norm:.3e}"
            );
        }
    }

    let IterState {
        v, adm, bus_types, ..
    } = state;
    Ok(finish(net, Some(&adm), v, bus_types, converged, norm, iterations, start))
}
