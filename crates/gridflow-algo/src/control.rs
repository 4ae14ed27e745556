//! Control-index resolution for the generalized formulation.
//!
//! Classifies buses and controllable branches into the index sets that
//! define the unknown-vector layout and the matching residual-equation
//! layout. The two layouts are always derived together: any control-mode or
//! bus-type change must go back through [`ControlIndices::resolve`], which
//! re-checks the square-system invariant.
//!
//! Layout ordering (columns of the Jacobian / entries of the state update):
//! ```text
//! unknowns:  Va[pvpq] | Vm[vm_free] | Beq[beq_z, beq_vf] | m[m_qf, m_qt, m_vm] | tau[tau_pf, tau_pt, tau_dp]
//! residuals: P[pvpq]  | Q[pq+pqv+vf] | Qf[m_qf, beq_z]   | Qt[m_qt]           | Pf[tau_pf] | Pt[tau_pt] | Pdp[tau_dp]
//! ```

use gridflow_core::{BusType, Network, TapModuleControl, TapPhaseControl};
use thiserror::Error;

/// Errors from control-index resolution
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Branch {branch} regulates Vm at bus {bus}, which is not a PQ bus")]
    VmTargetNotPq { branch: usize, bus: usize },

    #[error("Bus {bus} is regulated by more than one voltage control")]
    DuplicateRegulation { bus: usize },

    #[error("P bus {bus} has no converter regulating its voltage")]
    PBusUnregulated { bus: usize },

    #[error("Non-square system: {unknowns} unknowns vs {residuals} residuals")]
    Unbalanced { unknowns: usize, residuals: usize },
}

/// One entry of the unknown vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unknown {
    /// Voltage angle at a bus.
    Va(usize),
    /// Voltage magnitude at a bus.
    Vm(usize),
    /// Converter equivalent susceptance of a branch.
    Beq(usize),
    /// Tap module of a branch.
    TapModule(usize),
    /// Tap angle of a branch.
    TapAngle(usize),
}

/// One entry of the residual vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residual {
    /// Bus active-power mismatch.
    P(usize),
    /// Bus reactive-power mismatch.
    Q(usize),
    /// Branch from-side reactive-flow residual (Qf - Qf_set, or Qf for zero-Beq converters).
    Qf(usize),
    /// Branch to-side reactive-flow residual.
    Qt(usize),
    /// Branch from-side active-flow residual.
    Pf(usize),
    /// Branch to-side active-flow residual.
    Pt(usize),
    /// Branch droop residual: Pf - Pf_set - kdp·(Vm_f - Vf_set).
    Pdp(usize),
}

/// Resolved index sets and layouts for one bus-type assignment.
#[derive(Debug, Clone)]
pub struct ControlIndices {
    // Bus sets (sorted ascending).
    pub slack: Vec<usize>,
    pub pv: Vec<usize>,
    pub pq: Vec<usize>,
    /// PQ buses promoted because a branch tap module holds their Vm.
    pub pqv: Vec<usize>,
    pub p: Vec<usize>,
    /// Angle unknowns: every non-slack bus.
    pub pvpq: Vec<usize>,
    /// Magnitude unknowns: pq and P buses not held by a voltage control.
    pub vm_free: Vec<usize>,

    // Branch control sets (in declaration order).
    pub k_m_vm: Vec<usize>,
    pub k_m_qf: Vec<usize>,
    pub k_m_qt: Vec<usize>,
    pub k_tau_pf: Vec<usize>,
    pub k_tau_pt: Vec<usize>,
    pub k_tau_dp: Vec<usize>,
    /// Converters whose Beq holds Qf = 0 (DC-side reactive blocking).
    pub k_beq_z: Vec<usize>,
    /// Converters whose Beq holds the from-bus voltage magnitude.
    pub k_beq_vf: Vec<usize>,
    /// Buses whose Vm is held by a k_m_vm branch (the PQV buses).
    pub i_m_vm: Vec<usize>,
    /// Buses whose Vm is held by a k_beq_vf converter.
    pub i_beq_vf: Vec<usize>,

    /// Ordered unknown layout.
    pub unknowns: Vec<Unknown>,
    /// Ordered residual layout, same length as `unknowns`.
    pub residuals: Vec<Residual>,

    // Lookup tables (the translation arrays used by the assembler).
    /// Jacobian column of a bus's Va unknown.
    pub va_col: Vec<Option<usize>>,
    /// Jacobian column of a bus's Vm unknown.
    pub vm_col: Vec<Option<usize>>,
    /// Jacobian column of a branch's Beq / m / tau unknown.
    pub beq_col: Vec<Option<usize>>,
    pub m_col: Vec<Option<usize>>,
    pub tau_col: Vec<Option<usize>>,
    /// Jacobian row of a bus's P / Q residual.
    pub p_row: Vec<Option<usize>>,
    pub q_row: Vec<Option<usize>>,
    /// Jacobian row of a branch's flow residual (at most one per side).
    pub qf_row: Vec<Option<usize>>,
    pub qt_row: Vec<Option<usize>>,
    pub pf_row: Vec<Option<usize>>,
    pub pt_row: Vec<Option<usize>>,
}

impl ControlIndices {
    /// Classify buses and branches and derive both layouts.
    ///
    /// `bus_types` is passed separately from the network because the
    /// reactive-limit controller owns a mutable copy during a solve; the
    /// snapshot itself is never mutated.
    pub fn resolve(net: &Network, bus_types: &[BusType]) -> Result<Self, ResolveError> {
        let n_bus = net.n_bus();
        let n_branch = net.n_branch();

        // Branch control sets.
        let mut k_m_vm = Vec::new();
        let mut k_m_qf = Vec::new();
        let mut k_m_qt = Vec::new();
        let mut k_tau_pf = Vec::new();
        let mut k_tau_pt = Vec::new();
        let mut k_tau_dp = Vec::new();
        let mut k_beq_z = Vec::new();
        let mut k_beq_vf = Vec::new();

        // held_by[bus] = branch holding this bus's Vm, at most one.
        let mut held_vm: Vec<Option<usize>> = vec![None; n_bus];
        let mut held_vf: Vec<Option<usize>> = vec![None; n_bus];

        for (k, br) in net.branches.iter().enumerate() {
            if !br.active {
                continue;
            }
            match br.module_control {
                TapModuleControl::Fixed => {}
                TapModuleControl::Vm => {
                    let bus = br.to.value();
                    if bus_types[bus] != BusType::Pq {
                        return Err(ResolveError::VmTargetNotPq { branch: k, bus });
                    }
                    if held_vm[bus].is_some() || held_vf[bus].is_some() {
                        return Err(ResolveError::DuplicateRegulation { bus });
                    }
                    held_vm[bus] = Some(k);
                    k_m_vm.push(k);
                }
                TapModuleControl::Qf => k_m_qf.push(k),
                TapModuleControl::Qt => k_m_qt.push(k),
            }
            match br.phase_control {
                TapPhaseControl::Fixed => {}
                TapPhaseControl::Pf => k_tau_pf.push(k),
                TapPhaseControl::Pt => k_tau_pt.push(k),
                TapPhaseControl::PfDroop => k_tau_dp.push(k),
            }
            // Converter Beq regulation: a zero-Beq constraint on DC-blocked
            // converters, or a from-side voltage hold.
            if br.k2 != 1.0 || br.beq != 0.0 || br.g_sw != 0.0 {
                let bus = br.from.value();
                if bus_types[bus] == BusType::P {
                    if held_vm[bus].is_some() || held_vf[bus].is_some() {
                        return Err(ResolveError::DuplicateRegulation { bus });
                    }
                    held_vf[bus] = Some(k);
                    k_beq_vf.push(k);
                } else {
                    k_beq_z.push(k);
                }
            }
        }

        // Bus classification with PQV promotion.
        let mut slack = Vec::new();
        let mut pv = Vec::new();
        let mut pq = Vec::new();
        let mut pqv = Vec::new();
        let mut p = Vec::new();
        for (i, &t) in bus_types.iter().enumerate() {
            match t {
                BusType::Slack => slack.push(i),
                BusType::Pv => pv.push(i),
                BusType::Pq if held_vm[i].is_some() => pqv.push(i),
                BusType::Pq => pq.push(i),
                BusType::Pqv => pqv.push(i),
                BusType::P => {
                    if held_vf[i].is_none() {
                        return Err(ResolveError::PBusUnregulated { bus: i });
                    }
                    p.push(i);
                }
            }
        }

        let mut pvpq: Vec<usize> = pv
            .iter()
            .chain(pq.iter())
            .chain(pqv.iter())
            .chain(p.iter())
            .copied()
            .collect();
        pvpq.sort_unstable();

        // Vm unknowns: pq plus P buses, minus anything voltage-held. P buses
        // are all held (checked above), so this is just pq.
        let vm_free: Vec<usize> = pq.clone();

        let i_m_vm: Vec<usize> = k_m_vm.iter().map(|&k| net.branches[k].to.value()).collect();
        let i_beq_vf: Vec<usize> = k_beq_vf
            .iter()
            .map(|&k| net.branches[k].from.value())
            .collect();

        // Q residuals: pq and pqv buses, plus Vf-regulated buses whose Q
        // balance is what the converter Beq absorbs.
        let mut q_buses: Vec<usize> = pq
            .iter()
            .chain(pqv.iter())
            .chain(i_beq_vf.iter())
            .copied()
            .collect();
        q_buses.sort_unstable();

        // Unknown layout.
        let mut unknowns = Vec::new();
        unknowns.extend(pvpq.iter().map(|&i| Unknown::Va(i)));
        unknowns.extend(vm_free.iter().map(|&i| Unknown::Vm(i)));
        unknowns.extend(k_beq_z.iter().map(|&k| Unknown::Beq(k)));
        unknowns.extend(k_beq_vf.iter().map(|&k| Unknown::Beq(k)));
        unknowns.extend(k_m_qf.iter().map(|&k| Unknown::TapModule(k)));
        unknowns.extend(k_m_qt.iter().map(|&k| Unknown::TapModule(k)));
        unknowns.extend(k_m_vm.iter().map(|&k| Unknown::TapModule(k)));
        unknowns.extend(k_tau_pf.iter().map(|&k| Unknown::TapAngle(k)));
        unknowns.extend(k_tau_pt.iter().map(|&k| Unknown::TapAngle(k)));
        unknowns.extend(k_tau_dp.iter().map(|&k| Unknown::TapAngle(k)));

        // Residual layout.
        let mut residuals = Vec::new();
        residuals.extend(pvpq.iter().map(|&i| Residual::P(i)));
        residuals.extend(q_buses.iter().map(|&i| Residual::Q(i)));
        residuals.extend(k_m_qf.iter().map(|&k| Residual::Qf(k)));
        residuals.extend(k_beq_z.iter().map(|&k| Residual::Qf(k)));
        residuals.extend(k_m_qt.iter().map(|&k| Residual::Qt(k)));
        residuals.extend(k_tau_pf.iter().map(|&k| Residual::Pf(k)));
        residuals.extend(k_tau_pt.iter().map(|&k| Residual::Pt(k)));
        residuals.extend(k_tau_dp.iter().map(|&k| Residual::Pdp(k)));

        if unknowns.len() != residuals.len() {
            return Err(ResolveError::Unbalanced {
                unknowns: unknowns.len(),
                residuals: residuals.len(),
            });
        }

        // Lookup tables.
        let mut va_col = vec![None; n_bus];
        let mut vm_col = vec![None; n_bus];
        let mut beq_col = vec![None; n_branch];
        let mut m_col = vec![None; n_branch];
        let mut tau_col = vec![None; n_branch];
        for (col, u) in unknowns.iter().enumerate() {
            match *u {
                Unknown::Va(i) => va_col[i] = Some(col),
                Unknown::Vm(i) => vm_col[i] = Some(col),
                Unknown::Beq(k) => beq_col[k] = Some(col),
                Unknown::TapModule(k) => m_col[k] = Some(col),
                Unknown::TapAngle(k) => tau_col[k] = Some(col),
            }
        }
        let mut p_row = vec![None; n_bus];
        let mut q_row = vec![None; n_bus];
        let mut qf_row = vec![None; n_branch];
        let mut qt_row = vec![None; n_branch];
        let mut pf_row = vec![None; n_branch];
        let mut pt_row = vec![None; n_branch];
        for (row, r) in residuals.iter().enumerate() {
            match *r {
                Residual::P(i) => p_row[i] = Some(row),
                Residual::Q(i) => q_row[i] = Some(row),
                Residual::Qf(k) => qf_row[k] = Some(row),
                Residual::Qt(k) => qt_row[k] = Some(row),
                Residual::Pf(k) | Residual::Pdp(k) => pf_row[k] = Some(row),
                Residual::Pt(k) => pt_row[k] = Some(row),
            }
        }

        Ok(Self {
            slack,
            pv,
            pq,
            pqv,
            p,
            pvpq,
            vm_free,
            k_m_vm,
            k_m_qf,
            k_m_qt,
            k_tau_pf,
            k_tau_pt,
            k_tau_dp,
            k_beq_z,
            k_beq_vf,
            i_m_vm,
            i_beq_vf,
            unknowns,
            residuals,
            va_col,
            vm_col,
            beq_col,
            m_col,
            tau_col,
            p_row,
            q_row,
            qf_row,
            qt_row,
            pf_row,
            pt_row,
        })
    }

    /// Size of the square system.
    #[inline]
    pub fn len(&self) -> usize {
        self.unknowns.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.unknowns.is_empty()
    }

    /// Whether any branch declares a non-fixed control, which selects the
    /// generalized Jacobian over the reduced classic one.
    pub fn has_branch_controls(&self) -> bool {
        !(self.k_m_vm.is_empty()
            && self.k_m_qf.is_empty()
            && self.k_m_qt.is_empty()
            && self.k_tau_pf.is_empty()
            && self.k_tau_pt.is_empty()
            && self.k_tau_dp.is_empty()
            && self.k_beq_z.is_empty()
            && self.k_beq_vf.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridflow_core::{Branch, Bus, BusIdx, BusType};

    fn plain_3bus() -> Network {
        let mut net = Network::new();
        let b1 = net.add_bus(Bus::new("slack", BusType::Slack));
        let b2 = net.add_bus(Bus::new("gen", BusType::Pv));
        let b3 = net.add_bus(Bus::new("load", BusType::Pq));
        net.add_branch(Branch::new("a", b1, b2, 0.01, 0.1));
        net.add_branch(Branch::new("b", b2, b3, 0.01, 0.1));
        net
    }

    fn types_of(net: &Network) -> Vec<BusType> {
        net.buses.iter().map(|b| b.bus_type).collect()
    }

    #[test]
    fn test_plain_network_reduced_layout() {
        let net = plain_3bus();
        let idx = ControlIndices::resolve(&net, &types_of(&net)).unwrap();
        assert_eq!(idx.pvpq, vec![1, 2]);
        assert_eq!(idx.vm_free, vec![2]);
        assert_eq!(idx.len(), 3); // 2 angles + 1 magnitude
        assert!(!idx.has_branch_controls());
        assert_eq!(idx.va_col[1], Some(0));
        assert_eq!(idx.va_col[2], Some(1));
        assert_eq!(idx.vm_col[2], Some(2));
        assert_eq!(idx.va_col[0], None); // slack
    }

    #[test]
    fn test_vm_control_promotes_pq_to_pqv() {
        let mut net = plain_3bus();
        net.branches[1].module_control = TapModuleControl::Vm;
        let idx = ControlIndices::resolve(&net, &types_of(&net)).unwrap();
        assert_eq!(idx.pqv, vec![2]);
        assert!(idx.pq.is_empty());
        assert_eq!(idx.k_m_vm, vec![1]);
        assert_eq!(idx.i_m_vm, vec![2]);
        // Bus 2 lost its Vm unknown, branch 1 gained a module unknown:
        // system stays square at 3.
        assert_eq!(idx.len(), 3);
        assert_eq!(idx.vm_col[2], None);
        assert!(idx.m_col[1].is_some());
        // Bus 2 keeps its Q equation.
        assert!(idx.q_row[2].is_some());
    }

    #[test]
    fn test_qf_control_adds_flow_residual() {
        let mut net = plain_3bus();
        net.branches[1].module_control = TapModuleControl::Qf;
        net.branches[1].phase_control = TapPhaseControl::Pf;
        let idx = ControlIndices::resolve(&net, &types_of(&net)).unwrap();
        assert_eq!(idx.k_m_qf, vec![1]);
        assert_eq!(idx.k_tau_pf, vec![1]);
        assert_eq!(idx.len(), 5);
        assert!(idx.qf_row[1].is_some());
        assert!(idx.pf_row[1].is_some());
        assert!(idx.has_branch_controls());
    }

    #[test]
    fn test_vm_target_must_be_pq() {
        let mut net = plain_3bus();
        net.branches[0].module_control = TapModuleControl::Vm; // targets PV bus 1
        let err = ControlIndices::resolve(&net, &types_of(&net)).unwrap_err();
        assert!(matches!(err, ResolveError::VmTargetNotPq { branch: 0, bus: 1 }));
    }

    #[test]
    fn test_duplicate_vm_regulation_rejected() {
        let mut net = plain_3bus();
        let b3 = BusIdx::new(2);
        let b1 = BusIdx::new(0);
        net.add_branch(
            Branch::new("c", b1, b3, 0.02, 0.2)
                .with_module_control(TapModuleControl::Vm),
        );
        net.branches[1].module_control = TapModuleControl::Vm;
        let err = ControlIndices::resolve(&net, &types_of(&net)).unwrap_err();
        assert!(matches!(err, ResolveError::DuplicateRegulation { bus: 2 }));
    }

    #[test]
    fn test_unregulated_p_bus_rejected() {
        let mut net = plain_3bus();
        net.buses[2].bus_type = BusType::P;
        let err = ControlIndices::resolve(&net, &types_of(&net)).unwrap_err();
        assert!(matches!(err, ResolveError::PBusUnregulated { bus: 2 }));
    }

    #[test]
    fn test_converter_vf_regulation_balances_p_bus() {
        let mut net = plain_3bus();
        net.buses[2].bus_type = BusType::P;
        // Branch b (1->2 is bus1->bus2? branch index 1 goes gen->load); make
        // it a converter whose from side is the P bus.
        net.branches[1] = Branch::new("vsc", BusIdx::new(2), BusIdx::new(1), 0.01, 0.1)
            .with_converter(0.0, 1e-4, 0.8660254037844386);
        let idx = ControlIndices::resolve(&net, &types_of(&net)).unwrap();
        assert_eq!(idx.p, vec![2]);
        assert_eq!(idx.k_beq_vf, vec![1]);
        assert_eq!(idx.i_beq_vf, vec![2]);
        // P bus: Va unknown, Vm held by the converter; its Q balance is the
        // equation the Beq unknown absorbs.
        assert_eq!(idx.len(), 3);
        assert_eq!(idx.vm_col[2], None);
        assert!(idx.beq_col[1].is_some());
        assert!(idx.q_row[2].is_some());
    }

    #[test]
    fn test_zero_beq_converter_on_pq_bus() {
        let mut net = plain_3bus();
        net.branches[1] = net.branches[1]
            .clone()
            .with_converter(0.0, 1e-4, 0.8660254037844386);
        let idx = ControlIndices::resolve(&net, &types_of(&net)).unwrap();
        assert_eq!(idx.k_beq_z, vec![1]);
        // Beq unknown balanced by the Qf = 0 residual.
        assert_eq!(idx.len(), 4);
        assert!(idx.qf_row[1].is_some());
    }

    #[test]
    fn test_layouts_always_square() {
        let mut net = plain_3bus();
        net.branches[0].phase_control = TapPhaseControl::Pt;
        net.branches[1].module_control = TapModuleControl::Qt;
        net.branches[1].phase_control = TapPhaseControl::PfDroop;
        let idx = ControlIndices::resolve(&net, &types_of(&net)).unwrap();
        assert_eq!(idx.unknowns.len(), idx.residuals.len());
    }

    #[test]
    fn test_reresolve_after_pv_to_pq_switch() {
        let net = plain_3bus();
        let mut types = types_of(&net);
        let before = ControlIndices::resolve(&net, &types).unwrap();
        types[1] = BusType::Pq;
        let after = ControlIndices::resolve(&net, &types).unwrap();
        assert_eq!(before.len() + 1, after.len());
        assert!(after.vm_col[1].is_some());
        assert!(after.q_row[1].is_some());
    }
}
