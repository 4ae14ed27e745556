//! Sparse Jacobian assembly for the Newton solvers.
//!
//! All partial derivatives are analytically closed forms evaluated on the
//! non-zero structure of the admittance matrices; nothing here builds a
//! dense n x n intermediate. Two assembly strategies exist:
//!
//! - **Reduced**: the classic 2x2 block form over angle/magnitude unknowns,
//!   used whenever no branch declares a control.
//! - **Generalized**: the full layout with tap-module, tap-angle, and
//!   converter-susceptance columns and branch-flow residual rows.
//!
//! The complex bus-power derivatives follow the standard sparse form
//! ```text
//! dS/dVa = j·diag(V)·conj(diag(Ibus) - Ybus·diag(V))
//! dS/dVm = diag(V)·conj(Ybus·diag(Vnorm)) + conj(diag(Ibus))·diag(Vnorm)
//! ```
//! expanded entry-wise over Ybus's CSR structure. Control derivatives use
//! the ratio identities of the stored primitives (e.g. ∂yft/∂τ = j·yft),
//! which stay exact across incremental tap updates.

use gridflow_core::{Network, TapPhaseControl};
use num_complex::Complex64;
use sprs::{CsMat, TriMat};

use crate::admittance::{mat_vec, Admittance};
use crate::control::{ControlIndices, Residual};

/// Entries smaller than this are dropped from the assembled Jacobian.
const JACOBIAN_DROP_TOL: f64 = 1e-14;

/// Which block structure the assembler produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JacobianStrategy {
    /// Angle/magnitude-only unknowns.
    Reduced,
    /// Tap-module, tap-angle, and Beq columns included.
    Generalized,
}

impl JacobianStrategy {
    /// Pick the cheapest strategy that covers the declared controls.
    pub fn for_indices(idx: &ControlIndices) -> Self {
        if idx.has_branch_controls() {
            JacobianStrategy::Generalized
        } else {
            JacobianStrategy::Reduced
        }
    }
}

/// Complex bus-power derivative matrices, same sparsity as Ybus.
pub struct BusDerivatives {
    pub ds_dva: CsMat<Complex64>,
    pub ds_dvm: CsMat<Complex64>,
}

/// Per-branch from/to complex power flows at a voltage state.
pub struct BranchFlows {
    pub sf: Vec<Complex64>,
    pub st: Vec<Complex64>,
    pub if_: Vec<Complex64>,
    pub it: Vec<Complex64>,
}

/// Calculated complex bus injections S = V ∘ conj(Ybus·V).
pub fn compute_scalc(adm: &Admittance, v: &[Complex64]) -> Vec<Complex64> {
    let ibus = mat_vec(&adm.ybus, v);
    v.iter()
        .zip(ibus.iter())
        .map(|(&vi, &ii)| vi * ii.conj())
        .collect()
}

/// From/to branch flows from the stored primitives.
pub fn compute_branch_flows(net: &Network, adm: &Admittance, v: &[Complex64]) -> BranchFlows {
    let n = net.n_branch();
    let mut sf = vec![Complex64::ZERO; n];
    let mut st = vec![Complex64::ZERO; n];
    let mut if_ = vec![Complex64::ZERO; n];
    let mut it = vec![Complex64::ZERO; n];
    for (k, br) in net.branches.iter().enumerate() {
        if !br.active {
            continue;
        }
        let vf = v[br.from.value()];
        let vt = v[br.to.value()];
        if_[k] = adm.yff[k] * vf + adm.yft[k] * vt;
        it[k] = adm.ytf[k] * vf + adm.ytt[k] * vt;
        sf[k] = vf * if_[k].conj();
        st[k] = vt * it[k].conj();
    }
    BranchFlows { sf, st, if_, it }
}

/// Residual vector ordered exactly as `idx.residuals`.
///
/// Bus rows are Scalc - Sbus (specified injection); branch rows are the
/// declared flow-control residuals. The droop row follows
/// `Pf - Pf_set - kdp·(Vm_f - Vf_set)`.
pub fn compute_residuals(
    net: &Network,
    adm: &Admittance,
    idx: &ControlIndices,
    v: &[Complex64],
    sbus: &[Complex64],
) -> Vec<f64> {
    let scalc = compute_scalc(adm, v);
    let flows = compute_branch_flows(net, adm, v);

    let mut f = Vec::with_capacity(idx.len());
    for r in &idx.residuals {
        let value = match *r {
            Residual::P(i) => (scalc[i] - sbus[i]).re,
            Residual::Q(i) => (scalc[i] - sbus[i]).im,
            Residual::Qf(k) => {
                let br = &net.branches[k];
                // Zero-Beq converters block reactive flow entirely.
                let target = if idx.k_beq_z.contains(&k) { 0.0 } else { br.qf_set };
                flows.sf[k].im - target
            }
            Residual::Qt(k) => flows.st[k].im - net.branches[k].qt_set,
            Residual::Pf(k) => flows.sf[k].re - net.branches[k].pf_set,
            Residual::Pt(k) => flows.st[k].re - net.branches[k].pt_set,
            Residual::Pdp(k) => {
                let br = &net.branches[k];
                let vm_f = v[br.from.value()].norm();
                flows.sf[k].re - br.pf_set - br.kdp * (vm_f - br.vf_set)
            }
        };
        f.push(value);
    }
    f
}

/// Infinity norm of a residual vector.
pub fn norm_inf(f: &[f64]) -> f64 {
    f.iter().fold(0.0_f64, |acc, &x| acc.max(x.abs()))
}

/// Build the complex bus-power derivative matrices over Ybus's structure.
pub fn dsbus_dv(adm: &Admittance, v: &[Complex64]) -> BusDerivatives {
    let n = adm.n_bus();
    let ibus = mat_vec(&adm.ybus, v);
    let vnorm: Vec<Complex64> = v
        .iter()
        .map(|vi| {
            let m = vi.norm();
            if m > 0.0 {
                vi / m
            } else {
                Complex64::new(1.0, 0.0)
            }
        })
        .collect();

    let mut dva = TriMat::new((n, n));
    let mut dvm = TriMat::new((n, n));
    let indptr = adm.ybus.indptr();
    for i in 0..n {
        let start = indptr.index(i);
        let end = indptr.index(i + 1);
        let cols = &adm.ybus.indices()[start..end];
        let vals = &adm.ybus.data()[start..end];
        for (&j, &yij) in cols.iter().zip(vals.iter()) {
            if i == j {
                dva.add_triplet(
                    i,
                    j,
                    Complex64::new(0.0, 1.0) * v[i] * (ibus[i] - yij * v[i]).conj(),
                );
                dvm.add_triplet(
                    i,
                    j,
                    v[i] * (yij * vnorm[i]).conj() + ibus[i].conj() * vnorm[i],
                );
            } else {
                dva.add_triplet(i, j, -Complex64::new(0.0, 1.0) * v[i] * (yij * v[j]).conj());
                dvm.add_triplet(i, j, v[i] * (yij * vnorm[j]).conj());
            }
        }
    }

    BusDerivatives {
        ds_dva: dva.to_csr(),
        ds_dvm: dvm.to_csr(),
    }
}

/// Per-branch derivatives of Sf/St with respect to the from/to bus angle
/// and magnitude, and with respect to the branch's own control variables.
struct BranchDerivs {
    dsf_dva_f: Complex64,
    dsf_dva_t: Complex64,
    dsf_dvm_f: Complex64,
    dsf_dvm_t: Complex64,
    dst_dva_f: Complex64,
    dst_dva_t: Complex64,
    dst_dvm_f: Complex64,
    dst_dvm_t: Complex64,
    /// (dSf/dx, dSt/dx, dS_f/dx, dS_t/dx share values for each control x)
    dsf_dtau: Complex64,
    dst_dtau: Complex64,
    dsf_dm: Complex64,
    dst_dm: Complex64,
    dsf_dbeq: Complex64,
}

fn branch_derivs(adm: &Admittance, net: &Network, k: usize, v: &[Complex64]) -> BranchDerivs {
    let br = &net.branches[k];
    let (f, t) = (br.from.value(), br.to.value());
    let (vf, vt) = (v[f], v[t]);
    let j = Complex64::new(0.0, 1.0);
    let ef = if vf.norm() > 0.0 { vf / vf.norm() } else { Complex64::new(1.0, 0.0) };
    let et = if vt.norm() > 0.0 { vt / vt.norm() } else { Complex64::new(1.0, 0.0) };

    let if_ = adm.yff[k] * vf + adm.yft[k] * vt;
    let it = adm.ytf[k] * vf + adm.ytt[k] * vt;

    // Voltage derivatives of Sf = Vf·conj(If), St = Vt·conj(It).
    let dsf_dva_f = j * vf * if_.conj() - j * vf * (adm.yff[k] * vf).conj();
    let dsf_dva_t = -j * vf * (adm.yft[k] * vt).conj();
    let dsf_dvm_f = ef * if_.conj() + vf * (adm.yff[k] * ef).conj();
    let dsf_dvm_t = vf * (adm.yft[k] * et).conj();
    let dst_dva_t = j * vt * it.conj() - j * vt * (adm.ytt[k] * vt).conj();
    let dst_dva_f = -j * vt * (adm.ytf[k] * vf).conj();
    let dst_dvm_t = et * it.conj() + vt * (adm.ytt[k] * et).conj();
    let dst_dvm_f = vt * (adm.ytf[k] * ef).conj();

    // Control derivatives from the primitive ratio identities:
    //   ∂yft/∂τ =  j·yft      ∂ytf/∂τ = -j·ytf
    //   ∂yff/∂m = -2(yff - g_sw)/m    ∂yft/∂m = -yft/m   ∂ytf/∂m = -ytf/m
    //   ∂yff/∂Beq = j/(m²·k2²·vtap_f²)
    let m = adm.tap_module(k);
    let gsw = Complex64::new(br.g_sw, 0.0);
    let dyft_dtau = j * adm.yft[k];
    let dytf_dtau = -j * adm.ytf[k];
    let dsf_dtau = vf * (dyft_dtau * vt).conj();
    let dst_dtau = vt * (dytf_dtau * vf).conj();

    let dyff_dm = -2.0 * (adm.yff[k] - gsw) / m;
    let dyft_dm = -adm.yft[k] / m;
    let dytf_dm = -adm.ytf[k] / m;
    let dsf_dm = vf * (dyff_dm * vf + dyft_dm * vt).conj();
    let dst_dm = vt * (dytf_dm * vf).conj();

    let denom = m * m * br.k2 * br.k2 * br.vtap_f * br.vtap_f;
    let dyff_dbeq = j / denom;
    let dsf_dbeq = vf * (dyff_dbeq * vf).conj();

    BranchDerivs {
        dsf_dva_f,
        dsf_dva_t,
        dsf_dvm_f,
        dsf_dvm_t,
        dst_dva_f,
        dst_dva_t,
        dst_dvm_f,
        dst_dvm_t,
        dsf_dtau,
        dst_dtau,
        dsf_dm,
        dst_dm,
        dsf_dbeq,
    }
}

/// Assemble the Jacobian for the current state.
///
/// Rows follow `idx.residuals`, columns follow `idx.unknowns`. The result
/// is always square with dimension `idx.len()`; the solver treats any other
/// outcome as a fatal precondition violation, and this function upholds it
/// by construction.
pub fn assemble(
    net: &Network,
    adm: &Admittance,
    idx: &ControlIndices,
    v: &[Complex64],
) -> CsMat<f64> {
    let dim = idx.len();
    let mut tri = TriMat::new((dim, dim));
    let deriv = dsbus_dv(adm, v);

    let mut push = |row: usize, col: usize, value: f64| {
        if value.abs() > JACOBIAN_DROP_TOL {
            tri.add_triplet(row, col, value);
        }
    };

    // Bus-power rows against voltage columns, walking the sparse derivative
    // structure once.
    let indptr = deriv.ds_dva.indptr();
    for i in 0..adm.n_bus() {
        let (p_row, q_row) = (idx.p_row[i], idx.q_row[i]);
        if p_row.is_none() && q_row.is_none() {
            continue;
        }
        let start = indptr.index(i);
        let end = indptr.index(i + 1);
        let cols = &deriv.ds_dva.indices()[start..end];
        let dva = &deriv.ds_dva.data()[start..end];
        let dvm = &deriv.ds_dvm.data()[start..end];
        for ((&bus_j, &da), &dm) in cols.iter().zip(dva.iter()).zip(dvm.iter()) {
            if let Some(col) = idx.va_col[bus_j] {
                if let Some(row) = p_row {
                    push(row, col, da.re);
                }
                if let Some(row) = q_row {
                    push(row, col, da.im);
                }
            }
            if let Some(col) = idx.vm_col[bus_j] {
                if let Some(row) = p_row {
                    push(row, col, dm.re);
                }
                if let Some(row) = q_row {
                    push(row, col, dm.im);
                }
            }
        }
    }

    // Branch control columns against bus-power rows, and branch-flow rows
    // against every column they touch. Each controlled branch only couples
    // to its own two buses and its own control variables.
    let controlled: Vec<usize> = (0..net.n_branch())
        .filter(|&k| {
            idx.m_col[k].is_some()
                || idx.tau_col[k].is_some()
                || idx.beq_col[k].is_some()
                || idx.qf_row[k].is_some()
                || idx.qt_row[k].is_some()
                || idx.pf_row[k].is_some()
                || idx.pt_row[k].is_some()
        })
        .collect();

    for &k in &controlled {
        let br = &net.branches[k];
        if !br.active {
            continue;
        }
        let (f, t) = (br.from.value(), br.to.value());
        let d = branch_derivs(adm, net, k, v);

        // Control columns: bus injections at f and t move with the branch
        // primitives exactly as the branch flows do.
        if let Some(col) = idx.tau_col[k] {
            if let Some(row) = idx.p_row[f] {
                push(row, col, d.dsf_dtau.re);
            }
            if let Some(row) = idx.q_row[f] {
                push(row, col, d.dsf_dtau.im);
            }
            if let Some(row) = idx.p_row[t] {
                push(row, col, d.dst_dtau.re);
            }
            if let Some(row) = idx.q_row[t] {
                push(row, col, d.dst_dtau.im);
            }
        }
        if let Some(col) = idx.m_col[k] {
            if let Some(row) = idx.p_row[f] {
                push(row, col, d.dsf_dm.re);
            }
            if let Some(row) = idx.q_row[f] {
                push(row, col, d.dsf_dm.im);
            }
            if let Some(row) = idx.p_row[t] {
                push(row, col, d.dst_dm.re);
            }
            if let Some(row) = idx.q_row[t] {
                push(row, col, d.dst_dm.im);
            }
        }
        if let Some(col) = idx.beq_col[k] {
            if let Some(row) = idx.p_row[f] {
                push(row, col, d.dsf_dbeq.re);
            }
            if let Some(row) = idx.q_row[f] {
                push(row, col, d.dsf_dbeq.im);
            }
            // St does not depend on Beq.
        }

        // Branch-flow residual rows. `droop` is folded into the Vm_f entry
        // so the row is emitted in one pass.
        let mut flow_row = |row: usize, take_im: bool, side_from: bool, droop: f64| {
            let (dva_f, dva_t, dvm_f, dvm_t, dtau, dm, dbeq) = if side_from {
                (
                    d.dsf_dva_f,
                    d.dsf_dva_t,
                    d.dsf_dvm_f,
                    d.dsf_dvm_t,
                    d.dsf_dtau,
                    d.dsf_dm,
                    d.dsf_dbeq,
                )
            } else {
                (
                    d.dst_dva_f,
                    d.dst_dva_t,
                    d.dst_dvm_f,
                    d.dst_dvm_t,
                    d.dst_dtau,
                    d.dst_dm,
                    Complex64::ZERO,
                )
            };
            let part = |c: Complex64| if take_im { c.im } else { c.re };
            if let Some(col) = idx.va_col[f] {
                push(row, col, part(dva_f));
            }
            if let Some(col) = idx.va_col[t] {
                push(row, col, part(dva_t));
            }
            if let Some(col) = idx.vm_col[f] {
                push(row, col, part(dvm_f) + droop);
            }
            if let Some(col) = idx.vm_col[t] {
                push(row, col, part(dvm_t));
            }
            if let Some(col) = idx.tau_col[k] {
                push(row, col, part(dtau));
            }
            if let Some(col) = idx.m_col[k] {
                push(row, col, part(dm));
            }
            if let Some(col) = idx.beq_col[k] {
                push(row, col, part(dbeq));
            }
        };

        if let Some(row) = idx.qf_row[k] {
            flow_row(row, true, true, 0.0);
        }
        if let Some(row) = idx.qt_row[k] {
            flow_row(row, true, false, 0.0);
        }
        if let Some(row) = idx.pf_row[k] {
            // Droop rows carry the extra -kdp term on Vm_f.
            let droop = if br.phase_control == TapPhaseControl::PfDroop {
                -br.kdp
            } else {
                0.0
            };
            flow_row(row, false, true, droop);
        }
        if let Some(row) = idx.pt_row[k] {
            flow_row(row, false, false, 0.0);
        }
    }

    tri.to_csr()
}
