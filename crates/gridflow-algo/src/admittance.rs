//! Sparse admittance matrices for AC/DC power flow.
//!
//! Builds the three complex admittance matrices used by the solvers:
//! ```text
//! Ybus : bus x bus      I = Ybus × V
//! Yf   : branch x bus   If = Yf × V   (from-side branch currents)
//! Yt   : branch x bus   It = Yt × V   (to-side branch currents)
//! ```
//! from per-branch electrical primitives. The four primitive coefficients
//! (yff, yft, ytf, ytt) are kept alongside the matrices so that a tap change
//! on k branches updates the matrices in place in O(k) via precomputed
//! positional maps, without re-deriving anything from R/X/G/B.

use gridflow_core::Network;
use num_complex::Complex64;
use sprs::{CsMat, TriMat};
use thiserror::Error;

/// Errors from admittance matrix operations
#[derive(Debug, Error)]
pub enum AdmittanceError {
    #[error("No buses found in network")]
    NoBuses,

    #[error("Branch index {0} out of range")]
    BranchOutOfRange(usize),

    #[error("Tap module must be positive, got {0}")]
    NonPositiveTap(f64),

    #[error("Update maps not initialized")]
    MapsNotBuilt,
}

/// Positional maps from each branch's four matrix entries into the raw CSR
/// value arrays, built once per topology so tap updates avoid index search.
#[derive(Debug, Clone)]
struct UpdateMaps {
    /// Positions of (f,f), (f,t), (t,f), (t,t) in `ybus.data()`.
    ybus_pos: Vec<Option<[usize; 4]>>,
    /// Positions of columns f, t in row k of `yf.data()`.
    yf_pos: Vec<Option<[usize; 2]>>,
    /// Positions of columns f, t in row k of `yt.data()`.
    yt_pos: Vec<Option<[usize; 2]>>,
}

/// The admittance set for one network snapshot.
///
/// Owned exclusively by one solve pass; clone it when a pristine snapshot is
/// needed for sensitivity work. `tap_module`/`tap_angle` track the taps the
/// matrices were last composed with, which is what makes the ratio-form
/// incremental update exact.
#[derive(Debug, Clone)]
pub struct Admittance {
    n_bus: usize,
    n_branch: usize,
    pub ybus: CsMat<Complex64>,
    pub yf: CsMat<Complex64>,
    pub yt: CsMat<Complex64>,
    /// Branch-to-bus incidence (from side), branch x bus.
    pub cf: CsMat<f64>,
    /// Branch-to-bus incidence (to side), branch x bus.
    pub ct: CsMat<f64>,
    /// Primitive coefficients per branch.
    pub yff: Vec<Complex64>,
    pub yft: Vec<Complex64>,
    pub ytf: Vec<Complex64>,
    pub ytt: Vec<Complex64>,
    /// Per-bus shunt admittance on the Ybus diagonal.
    pub yshunt_bus: Vec<Complex64>,
    /// Converter switch conductance per branch (invariant under tap change).
    g_sw: Vec<f64>,
    /// Taps and converter susceptance the matrices currently embed.
    tap_module: Vec<f64>,
    tap_angle: Vec<f64>,
    beq: Vec<f64>,
    /// 1/(k2²·vtap_f²) per branch, fixed at build time.
    inv_k2_vf2: Vec<f64>,
    maps: Option<UpdateMaps>,
}

/// Floor applied to near-zero series impedance; the clamp is logged, never
/// raised as fatal.
pub const DEFAULT_IMPEDANCE_EPS: f64 = 1e-8;

impl Admittance {
    /// Assemble the full admittance set from the snapshot.
    ///
    /// Primitive formulas (FUBM form), with `tap = m·k2·e^{jτ}` and virtual
    /// taps absorbing nominal-voltage mismatch:
    /// ```text
    /// ys  = 1/(r + jx)
    /// bc2 = (g + jb)/2
    /// yff = g_sw + (ys + bc2 + j·beq) / (m²·k2²·vtap_f²)
    /// yft = -ys / (m·k2·e^{-jτ}·vtap_f·vtap_t)
    /// ytf = -ys / (m·k2·e^{ jτ}·vtap_t·vtap_f)
    /// ytt = (ys + bc2) / vtap_t²
    /// ```
    /// Inactive branches contribute zero. Ybus = Cfᵀ·Yf + Ctᵀ·Yt + diag(shunt).
    pub fn build(net: &Network, impedance_eps: f64) -> Result<Self, AdmittanceError> {
        let n_bus = net.n_bus();
        let n_branch = net.n_branch();
        if n_bus == 0 {
            return Err(AdmittanceError::NoBuses);
        }

        let mut yff = vec![Complex64::ZERO; n_branch];
        let mut yft = vec![Complex64::ZERO; n_branch];
        let mut ytf = vec![Complex64::ZERO; n_branch];
        let mut ytt = vec![Complex64::ZERO; n_branch];
        let mut g_sw = vec![0.0; n_branch];
        let mut tap_module = vec![1.0; n_branch];
        let mut tap_angle = vec![0.0; n_branch];
        let mut beq = vec![0.0; n_branch];
        let mut inv_k2_vf2 = vec![1.0; n_branch];

        for (k, br) in net.branches.iter().enumerate() {
            g_sw[k] = br.g_sw;
            tap_module[k] = br.tap_module;
            tap_angle[k] = br.tap_angle;
            beq[k] = br.beq;
            inv_k2_vf2[k] = 1.0 / (br.k2 * br.k2 * br.vtap_f * br.vtap_f);
            if !br.active {
                continue;
            }
            if br.tap_module <= 0.0 {
                return Err(AdmittanceError::NonPositiveTap(br.tap_module));
            }

            let (mut r, mut x) = (br.r, br.x);
            if Complex64::new(r, x).norm() < impedance_eps {
                eprintln!(
                    "  Branch {} ({}): near-zero impedance clamped to x={:.1e}",
                    k, br.name, impedance_eps
                );
                r = 0.0;
                x = impedance_eps;
            }
            let ys = Complex64::new(r, x).inv();
            let bc2 = Complex64::new(br.g, br.b) / 2.0;
            let mk = br.tap_module * br.k2;
            let rot = Complex64::from_polar(1.0, br.tap_angle);

            yff[k] = Complex64::new(br.g_sw, 0.0)
                + (ys + bc2 + Complex64::new(0.0, br.beq))
                    / (mk * mk * br.vtap_f * br.vtap_f);
            yft[k] = -ys / (mk * rot.conj() * br.vtap_f * br.vtap_t);
            ytf[k] = -ys / (mk * rot * br.vtap_t * br.vtap_f);
            ytt[k] = (ys + bc2) / (br.vtap_t * br.vtap_t);
        }

        let yshunt_bus: Vec<Complex64> = net
            .buses
            .iter()
            .map(|bus| Complex64::new(bus.g_shunt, bus.b_shunt))
            .collect();

        let (ybus, yf, yt, cf, ct) =
            compose_matrices(net, &yff, &yft, &ytf, &ytt, &yshunt_bus);

        Ok(Self {
            n_bus,
            n_branch,
            ybus,
            yf,
            yt,
            cf,
            ct,
            yff,
            yft,
            ytf,
            ytt,
            yshunt_bus,
            g_sw,
            tap_module,
            tap_angle,
            beq,
            inv_k2_vf2,
            maps: None,
        })
    }

    #[inline]
    pub fn n_bus(&self) -> usize {
        self.n_bus
    }

    #[inline]
    pub fn n_branch(&self) -> usize {
        self.n_branch
    }

    /// Current tap module embedded in the matrices for branch k.
    #[inline]
    pub fn tap_module(&self, k: usize) -> f64 {
        self.tap_module[k]
    }

    /// Current tap angle embedded in the matrices for branch k.
    #[inline]
    pub fn tap_angle(&self, k: usize) -> f64 {
        self.tap_angle[k]
    }

    /// Current converter susceptance embedded in the matrices for branch k.
    #[inline]
    pub fn beq(&self, k: usize) -> f64 {
        self.beq[k]
    }

    /// Locate every branch's non-zero positions in the raw CSR value arrays.
    /// Called once per topology; afterwards `update_taps` is O(k).
    pub fn build_update_maps(&mut self, net: &Network) {
        let mut ybus_pos = vec![None; self.n_branch];
        let mut yf_pos = vec![None; self.n_branch];
        let mut yt_pos = vec![None; self.n_branch];

        for (k, br) in net.branches.iter().enumerate() {
            if !br.active {
                continue;
            }
            let (f, t) = (br.from.value(), br.to.value());
            let pos = [
                nnz_position(&self.ybus, f, f),
                nnz_position(&self.ybus, f, t),
                nnz_position(&self.ybus, t, f),
                nnz_position(&self.ybus, t, t),
            ];
            if let [Some(a), Some(b), Some(c), Some(d)] = pos {
                ybus_pos[k] = Some([a, b, c, d]);
            }
            if let (Some(a), Some(b)) = (nnz_position(&self.yf, k, f), nnz_position(&self.yf, k, t))
            {
                yf_pos[k] = Some([a, b]);
            }
            if let (Some(a), Some(b)) = (nnz_position(&self.yt, k, f), nnz_position(&self.yt, k, t))
            {
                yt_pos[k] = Some([a, b]);
            }
        }

        self.maps = Some(UpdateMaps {
            ybus_pos,
            yf_pos,
            yt_pos,
        });
    }

    /// Recompose the matrices in place for a subset of branches whose tap
    /// changed, using the ratio form so primitives are never re-derived:
    /// ```text
    /// yff' = (yff - g_sw)·(m/m')² + g_sw
    /// yft' = yft · (m·e^{-jτ}) / (m'·e^{-jτ'})
    /// ytf' = ytf · (m·e^{ jτ}) / (m'·e^{ jτ'})
    /// ytt' = ytt
    /// ```
    /// Ybus diagonals accumulate several branches, so the maps apply deltas
    /// rather than overwriting. Requires [`build_update_maps`] first.
    ///
    /// [`build_update_maps`]: Admittance::build_update_maps
    pub fn update_taps(
        &mut self,
        changes: &[(usize, f64, f64)],
    ) -> Result<(), AdmittanceError> {
        let Self {
            n_branch,
            ybus,
            yf,
            yt,
            yff,
            yft,
            ytf,
            g_sw,
            tap_module,
            tap_angle,
            maps,
            ..
        } = self;
        let maps = maps.as_ref().ok_or(AdmittanceError::MapsNotBuilt)?;

        for &(k, m2, tau2) in changes {
            if k >= *n_branch {
                return Err(AdmittanceError::BranchOutOfRange(k));
            }
            if m2 <= 0.0 {
                return Err(AdmittanceError::NonPositiveTap(m2));
            }
            let (m1, tau1) = (tap_module[k], tap_angle[k]);
            if m1 == m2 && tau1 == tau2 {
                continue;
            }

            let gsw = Complex64::new(g_sw[k], 0.0);
            let ratio_m2 = (m1 / m2) * (m1 / m2);
            let fwd1 = m1 * Complex64::from_polar(1.0, tau1);
            let fwd2 = m2 * Complex64::from_polar(1.0, tau2);

            let yff_new = (yff[k] - gsw) * ratio_m2 + gsw;
            let yft_new = yft[k] * fwd1.conj() / fwd2.conj();
            let ytf_new = ytf[k] * fwd1 / fwd2;

            let d_ff = yff_new - yff[k];
            let d_ft = yft_new - yft[k];
            let d_tf = ytf_new - ytf[k];

            if let Some([pff, pft, ptf, _ptt]) = maps.ybus_pos[k] {
                // ytt is invariant under tap change, so the (t,t) slot stays.
                let data = ybus.data_mut();
                data[pff] += d_ff;
                data[pft] += d_ft;
                data[ptf] += d_tf;
            }
            if let Some([pf, pt]) = maps.yf_pos[k] {
                let data = yf.data_mut();
                data[pf] += d_ff;
                data[pt] += d_ft;
            }
            if let Some([pf, _pt]) = maps.yt_pos[k] {
                // yt[k, t] holds ytt, unchanged.
                let data = yt.data_mut();
                data[pf] += d_tf;
            }

            yff[k] = yff_new;
            yft[k] = yft_new;
            ytf[k] = ytf_new;
            tap_module[k] = m2;
            tap_angle[k] = tau2;
        }
        Ok(())
    }

    /// Shift the converter equivalent susceptance of a subset of branches in
    /// place. Only yff moves: `Δyff = j·ΔBeq/(m²·k2²·vtap_f²)` at the
    /// currently embedded tap module. O(k), same maps as [`update_taps`].
    ///
    /// [`update_taps`]: Admittance::update_taps
    pub fn update_beq(&mut self, changes: &[(usize, f64)]) -> Result<(), AdmittanceError> {
        let Self {
            n_branch,
            ybus,
            yf,
            yff,
            tap_module,
            beq,
            inv_k2_vf2,
            maps,
            ..
        } = self;
        let maps = maps.as_ref().ok_or(AdmittanceError::MapsNotBuilt)?;

        for &(k, beq2) in changes {
            if k >= *n_branch {
                return Err(AdmittanceError::BranchOutOfRange(k));
            }
            let m = tap_module[k];
            let d_ff = Complex64::new(0.0, (beq2 - beq[k]) * inv_k2_vf2[k] / (m * m));
            if d_ff == Complex64::ZERO {
                continue;
            }

            if let Some([pff, ..]) = maps.ybus_pos[k] {
                ybus.data_mut()[pff] += d_ff;
            }
            if let Some([pf, _]) = maps.yf_pos[k] {
                yf.data_mut()[pf] += d_ff;
            }
            yff[k] += d_ff;
            beq[k] = beq2;
        }
        Ok(())
    }
}

/// Assemble Yf/Yt row-per-branch, Ybus by triplet accumulation, and the
/// incidence matrices. Every bus gets an explicit diagonal entry (its shunt,
/// possibly zero) so isolated buses keep a structural row and the update
/// maps always find the diagonal.
fn compose_matrices(
    net: &Network,
    yff: &[Complex64],
    yft: &[Complex64],
    ytf: &[Complex64],
    ytt: &[Complex64],
    yshunt_bus: &[Complex64],
) -> (
    CsMat<Complex64>,
    CsMat<Complex64>,
    CsMat<Complex64>,
    CsMat<f64>,
    CsMat<f64>,
) {
    let n_bus = net.n_bus();
    let n_branch = net.n_branch();

    let mut ybus_tri = TriMat::new((n_bus, n_bus));
    let mut yf_tri = TriMat::new((n_branch, n_bus));
    let mut yt_tri = TriMat::new((n_branch, n_bus));
    let mut cf_tri = TriMat::new((n_branch, n_bus));
    let mut ct_tri = TriMat::new((n_branch, n_bus));

    for (i, &ysh) in yshunt_bus.iter().enumerate() {
        ybus_tri.add_triplet(i, i, ysh);
    }

    for (k, br) in net.branches.iter().enumerate() {
        if !br.active {
            continue;
        }
        let (f, t) = (br.from.value(), br.to.value());
        cf_tri.add_triplet(k, f, 1.0);
        ct_tri.add_triplet(k, t, 1.0);

        yf_tri.add_triplet(k, f, yff[k]);
        yf_tri.add_triplet(k, t, yft[k]);
        yt_tri.add_triplet(k, f, ytf[k]);
        yt_tri.add_triplet(k, t, ytt[k]);

        ybus_tri.add_triplet(f, f, yff[k]);
        ybus_tri.add_triplet(f, t, yft[k]);
        ybus_tri.add_triplet(t, f, ytf[k]);
        ybus_tri.add_triplet(t, t, ytt[k]);
    }

    (
        ybus_tri.to_csr(),
        yf_tri.to_csr(),
        yt_tri.to_csr(),
        cf_tri.to_csr(),
        ct_tri.to_csr(),
    )
}

/// Flat position of entry (row, col) in the CSR value array, if structural.
fn nnz_position(mat: &CsMat<Complex64>, row: usize, col: usize) -> Option<usize> {
    let indptr = mat.indptr();
    let start = indptr.index(row);
    let end = indptr.index(row + 1);
    mat.indices()[start..end]
        .iter()
        .position(|&j| j == col)
        .map(|off| start + off)
}

/// Sparse matrix-vector product Y·V for CSR complex matrices.
pub fn mat_vec(mat: &CsMat<Complex64>, v: &[Complex64]) -> Vec<Complex64> {
    let mut out = vec![Complex64::ZERO; mat.rows()];
    let indptr = mat.indptr();
    for (row, out_val) in out.iter_mut().enumerate() {
        let start = indptr.index(row);
        let end = indptr.index(row + 1);
        let indices = &mat.indices()[start..end];
        let data = &mat.data()[start..end];
        let mut acc = Complex64::ZERO;
        for (&j, &y) in indices.iter().zip(data.iter()) {
            acc += y * v[j];
        }
        *out_val = acc;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridflow_core::{Branch, Bus, BusIdx, BusType};

    fn create_3bus_network() -> Network {
        let mut net = Network::new();
        let b1 = net.add_bus(Bus::new("Bus1", BusType::Slack));
        let b2 = net.add_bus(Bus::new("Bus2", BusType::Pq).with_shunt(0.0, 0.05));
        let b3 = net.add_bus(Bus::new("Bus3", BusType::Pq));
        net.add_branch(Branch::new("L12", b1, b2, 0.01, 0.1).with_charging(0.0, 0.02));
        net.add_branch(Branch::new("L23", b2, b3, 0.02, 0.2));
        net.add_branch(
            Branch::new("T13", b1, b3, 0.005, 0.05).with_tap(1.05, 0.02),
        );
        net
    }

    fn max_abs_diff(a: &CsMat<Complex64>, b: &CsMat<Complex64>) -> f64 {
        let mut worst: f64 = 0.0;
        for (rows, cols) in [(a.rows(), a.cols())].into_iter() {
            for i in 0..rows {
                for j in 0..cols {
                    let va = a.get(i, j).copied().unwrap_or(Complex64::ZERO);
                    let vb = b.get(i, j).copied().unwrap_or(Complex64::ZERO);
                    worst = worst.max((va - vb).norm());
                }
            }
        }
        worst
    }

    #[test]
    fn test_build_dimensions() {
        let net = create_3bus_network();
        let adm = Admittance::build(&net, DEFAULT_IMPEDANCE_EPS).unwrap();
        assert_eq!(adm.ybus.rows(), 3);
        assert_eq!(adm.ybus.cols(), 3);
        assert_eq!(adm.yf.rows(), 3);
        assert_eq!(adm.yf.cols(), 3);
        assert_eq!(adm.cf.nnz(), 3);
        assert_eq!(adm.ct.nnz(), 3);
    }

    #[test]
    fn test_row_sums_match_shunt_for_lossless_taps() {
        // With unit taps and no charging, each Ybus row sums to the bus shunt
        // (series terms cancel).
        let mut net = Network::new();
        let b1 = net.add_bus(Bus::new("a", BusType::Slack));
        let b2 = net.add_bus(Bus::new("b", BusType::Pq));
        net.add_branch(Branch::new("l", b1, b2, 0.01, 0.1));
        let adm = Admittance::build(&net, DEFAULT_IMPEDANCE_EPS).unwrap();
        for i in 0..2 {
            let sum: Complex64 = (0..2)
                .map(|j| adm.ybus.get(i, j).copied().unwrap_or(Complex64::ZERO))
                .sum();
            assert!(sum.norm() < 1e-12, "row {} sum {}", i, sum);
        }
    }

    #[test]
    fn test_inactive_branch_contributes_zero() {
        let mut net = create_3bus_network();
        net.branches[1].active = false;
        let adm = Admittance::build(&net, DEFAULT_IMPEDANCE_EPS).unwrap();
        assert_eq!(adm.yff[1], Complex64::ZERO);
        assert!(adm
            .ybus
            .get(1, 2)
            .copied()
            .unwrap_or(Complex64::ZERO)
            .norm()
            .abs()
            < 1e-15);
    }

    #[test]
    fn test_zero_impedance_clamped_not_fatal() {
        let mut net = create_3bus_network();
        net.branches[0].r = 0.0;
        net.branches[0].x = 0.0;
        let adm = Admittance::build(&net, DEFAULT_IMPEDANCE_EPS);
        assert!(adm.is_ok());
        let adm = adm.unwrap();
        assert!(adm.yff[0].norm().is_finite());
    }

    #[test]
    fn test_update_matches_rebuild() {
        let mut net = create_3bus_network();
        let mut adm = Admittance::build(&net, DEFAULT_IMPEDANCE_EPS).unwrap();
        adm.build_update_maps(&net);

        adm.update_taps(&[(2, 0.98, -0.03)]).unwrap();

        net.branches[2].tap_module = 0.98;
        net.branches[2].tap_angle = -0.03;
        let fresh = Admittance::build(&net, DEFAULT_IMPEDANCE_EPS).unwrap();

        assert!(max_abs_diff(&adm.ybus, &fresh.ybus) < 1e-12);
        assert!(max_abs_diff(&adm.yf, &fresh.yf) < 1e-12);
        assert!(max_abs_diff(&adm.yt, &fresh.yt) < 1e-12);
    }

    #[test]
    fn test_update_matches_rebuild_with_converter() {
        let mut net = create_3bus_network();
        net.branches[2] = net.branches[2].clone().with_converter(0.01, 1e-4, 0.8660254037844386);
        let mut adm = Admittance::build(&net, DEFAULT_IMPEDANCE_EPS).unwrap();
        adm.build_update_maps(&net);

        adm.update_taps(&[(2, 1.1, 0.12)]).unwrap();

        net.branches[2].tap_module = 1.1;
        net.branches[2].tap_angle = 0.12;
        let fresh = Admittance::build(&net, DEFAULT_IMPEDANCE_EPS).unwrap();

        assert!(max_abs_diff(&adm.ybus, &fresh.ybus) < 1e-12);
        assert!(max_abs_diff(&adm.yf, &fresh.yf) < 1e-12);
        assert!(max_abs_diff(&adm.yt, &fresh.yt) < 1e-12);
    }

    #[test]
    fn test_beq_update_matches_rebuild() {
        let mut net = create_3bus_network();
        net.branches[2] = net.branches[2].clone().with_converter(0.02, 1e-4, 1.0);
        let mut adm = Admittance::build(&net, DEFAULT_IMPEDANCE_EPS).unwrap();
        adm.build_update_maps(&net);

        // Tap and Beq moved together, as the solver does per iteration.
        adm.update_taps(&[(2, 1.08, 0.05)]).unwrap();
        adm.update_beq(&[(2, -0.015)]).unwrap();

        net.branches[2].tap_module = 1.08;
        net.branches[2].tap_angle = 0.05;
        net.branches[2].beq = -0.015;
        let fresh = Admittance::build(&net, DEFAULT_IMPEDANCE_EPS).unwrap();

        assert!(max_abs_diff(&adm.ybus, &fresh.ybus) < 1e-12);
        assert!(max_abs_diff(&adm.yf, &fresh.yf) < 1e-12);
        assert_eq!(adm.beq(2), -0.015);
    }

    #[test]
    fn test_update_noop_for_identical_taps() {
        let net = create_3bus_network();
        let mut adm = Admittance::build(&net, DEFAULT_IMPEDANCE_EPS).unwrap();
        adm.build_update_maps(&net);
        let before = adm.ybus.clone();
        adm.update_taps(&[(2, 1.05, 0.02)]).unwrap();
        assert!(max_abs_diff(&before, &adm.ybus) < 1e-15);
    }

    #[test]
    fn test_update_without_maps_fails() {
        let net = create_3bus_network();
        let mut adm = Admittance::build(&net, DEFAULT_IMPEDANCE_EPS).unwrap();
        assert!(matches!(
            adm.update_taps(&[(0, 1.02, 0.0)]),
            Err(AdmittanceError::MapsNotBuilt)
        ));
    }

    #[test]
    fn test_update_rejects_bad_input() {
        let net = create_3bus_network();
        let mut adm = Admittance::build(&net, DEFAULT_IMPEDANCE_EPS).unwrap();
        adm.build_update_maps(&net);
        assert!(matches!(
            adm.update_taps(&[(9, 1.0, 0.0)]),
            Err(AdmittanceError::BranchOutOfRange(9))
        ));
        assert!(matches!(
            adm.update_taps(&[(0, -1.0, 0.0)]),
            Err(AdmittanceError::NonPositiveTap(_))
        ));
    }

    #[test]
    fn test_mat_vec_against_dense() {
        let net = create_3bus_network();
        let adm = Admittance::build(&net, DEFAULT_IMPEDANCE_EPS).unwrap();
        let v = vec![
            Complex64::new(1.0, 0.0),
            Complex64::new(0.98, -0.02),
            Complex64::new(1.01, 0.05),
        ];
        let fast = mat_vec(&adm.ybus, &v);
        for i in 0..3 {
            let mut dense = Complex64::ZERO;
            for (j, vj) in v.iter().enumerate() {
                dense += adm.ybus.get(i, j).copied().unwrap_or(Complex64::ZERO) * vj;
            }
            assert!((fast[i] - dense).norm() < 1e-14);
        }
    }
}
