//! Flat numerical network snapshot used by the power-flow algorithms.
//!
//! The model is a flattened per-unit representation: bus arrays and branch
//! arrays indexed by position, with bus references stored as indices rather
//! than owned sub-objects. Importers construct a [`Network`] from whatever
//! source format they read; the solver crates never perform file I/O.
//!
//! All electrical quantities are per-unit on the system base unless a field
//! name says otherwise (`nominal_kv`).

use serde::{Deserialize, Serialize};

use crate::error::{GridError, GridResult};

// Newtype wrappers for indices for type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusIdx(usize);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchIdx(usize);

impl BusIdx {
    #[inline]
    pub fn new(value: usize) -> Self {
        BusIdx(value)
    }
    #[inline]
    pub fn value(&self) -> usize {
        self.0
    }
}

impl BranchIdx {
    #[inline]
    pub fn new(value: usize) -> Self {
        BranchIdx(value)
    }
    #[inline]
    pub fn value(&self) -> usize {
        self.0
    }
}

/// Bus classification determining which electrical quantities are unknowns.
///
/// `Pqv` and `P` appear only in the generalized formulation: a `Pqv` bus has
/// its voltage magnitude held by a remote branch control, a `P` bus fixes
/// active power only (angle and magnitude both free).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BusType {
    Slack,
    Pv,
    Pq,
    Pqv,
    P,
}

impl BusType {
    /// True for the types whose reactive injection is set by a voltage
    /// target (the candidates for reactive-limit reclassification).
    #[inline]
    pub fn holds_voltage(&self) -> bool {
        matches!(self, BusType::Pv | BusType::P)
    }
}

/// What the tap module (magnitude) of a controllable branch regulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TapModuleControl {
    /// Tap module is a fixed parameter.
    Fixed,
    /// Regulates the voltage magnitude at the `to` bus (moves it PQ -> PQV).
    Vm,
    /// Regulates reactive power flow at the `from` side.
    Qf,
    /// Regulates reactive power flow at the `to` side.
    Qt,
}

/// What the tap phase (angle) of a controllable branch regulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TapPhaseControl {
    /// Tap angle is a fixed parameter.
    Fixed,
    /// Regulates active power flow at the `from` side.
    Pf,
    /// Regulates active power flow at the `to` side.
    Pt,
    /// Droop-regulated from-side active power: Pf - Pf_set - kdp*(Vm_f - Vf_set).
    PfDroop,
}

/// A bus in the flat snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bus {
    pub name: String,
    /// Nominal voltage in kV (bookkeeping only, not used by the solver).
    pub nominal_kv: f64,
    /// Specified active power injection (generation minus load), per-unit.
    pub p_set: f64,
    /// Specified reactive power injection, per-unit.
    pub q_set: f64,
    /// Voltage magnitude setpoint (used when the type fixes Vm).
    pub vm_set: f64,
    pub vm_min: f64,
    pub vm_max: f64,
    /// Reactive capability band, per-unit.
    pub q_min: f64,
    pub q_max: f64,
    /// Shunt admittance connected at the bus, per-unit.
    pub g_shunt: f64,
    pub b_shunt: f64,
    pub bus_type: BusType,
}

impl Default for Bus {
    fn default() -> Self {
        Self {
            name: String::new(),
            nominal_kv: 0.0,
            p_set: 0.0,
            q_set: 0.0,
            vm_set: 1.0,
            vm_min: 0.9,
            vm_max: 1.1,
            q_min: -1e20,
            q_max: 1e20,
            g_shunt: 0.0,
            b_shunt: 0.0,
            bus_type: BusType::Pq,
        }
    }
}

impl Bus {
    pub fn new(name: impl Into<String>, bus_type: BusType) -> Self {
        Self {
            name: name.into(),
            bus_type,
            ..Self::default()
        }
    }

    pub fn with_injection(mut self, p: f64, q: f64) -> Self {
        self.p_set = p;
        self.q_set = q;
        self
    }

    pub fn with_vm_set(mut self, vm: f64) -> Self {
        self.vm_set = vm;
        self
    }

    pub fn with_q_limits(mut self, q_min: f64, q_max: f64) -> Self {
        self.q_min = q_min;
        self.q_max = q_max;
        self
    }

    pub fn with_shunt(mut self, g: f64, b: f64) -> Self {
        self.g_shunt = g;
        self.b_shunt = b;
        self
    }
}

/// A branch (line, transformer, or converter) in the flat snapshot.
///
/// Passive branches leave both control modes `Fixed` and the converter
/// fields at their defaults. A branch owns no buses; `from`/`to` are
/// back-references into the bus array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    pub from: BusIdx,
    pub to: BusIdx,
    /// Series resistance, per-unit.
    pub r: f64,
    /// Series reactance, per-unit.
    pub x: f64,
    /// Total shunt conductance, per-unit (split half/half).
    pub g: f64,
    /// Total shunt susceptance, per-unit (split half/half).
    pub b: f64,
    /// Tap module (magnitude).
    pub tap_module: f64,
    /// Tap phase shift, radians.
    pub tap_angle: f64,
    /// Virtual taps absorbing nominal-voltage mismatch at each side.
    pub vtap_f: f64,
    pub vtap_t: f64,
    /// Converter equivalent shunt susceptance, per-unit.
    pub beq: f64,
    /// Converter switch conductance, per-unit.
    pub g_sw: f64,
    /// Converter modulation constant (1.0 for transformers/lines).
    pub k2: f64,
    /// Droop coefficient for `TapPhaseControl::PfDroop`.
    pub kdp: f64,
    pub module_control: TapModuleControl,
    pub phase_control: TapPhaseControl,
    /// Flow setpoints for the control residuals, per-unit.
    pub pf_set: f64,
    pub pt_set: f64,
    pub qf_set: f64,
    pub qt_set: f64,
    /// Voltage setpoints for remote-Vm and converter regulation.
    pub vf_set: f64,
    pub vt_set: f64,
    pub active: bool,
}

impl Default for Branch {
    fn default() -> Self {
        Self {
            name: String::new(),
            from: BusIdx(0),
            to: BusIdx(0),
            r: 0.0,
            x: 0.0,
            g: 0.0,
            b: 0.0,
            tap_module: 1.0,
            tap_angle: 0.0,
            vtap_f: 1.0,
            vtap_t: 1.0,
            beq: 0.0,
            g_sw: 0.0,
            k2: 1.0,
            kdp: 0.0,
            module_control: TapModuleControl::Fixed,
            phase_control: TapPhaseControl::Fixed,
            pf_set: 0.0,
            pt_set: 0.0,
            qf_set: 0.0,
            qt_set: 0.0,
            vf_set: 1.0,
            vt_set: 1.0,
            active: true,
        }
    }
}

impl Branch {
    pub fn new(name: impl Into<String>, from: BusIdx, to: BusIdx, r: f64, x: f64) -> Self {
        Self {
            name: name.into(),
            from,
            to,
            r,
            x,
            ..Self::default()
        }
    }

    pub fn with_charging(mut self, g: f64, b: f64) -> Self {
        self.g = g;
        self.b = b;
        self
    }

    pub fn with_tap(mut self, module: f64, angle: f64) -> Self {
        self.tap_module = module;
        self.tap_angle = angle;
        self
    }

    pub fn with_virtual_taps(mut self, vtap_f: f64, vtap_t: f64) -> Self {
        self.vtap_f = vtap_f;
        self.vtap_t = vtap_t;
        self
    }

    pub fn with_module_control(mut self, mode: TapModuleControl) -> Self {
        self.module_control = mode;
        self
    }

    pub fn with_phase_control(mut self, mode: TapPhaseControl) -> Self {
        self.phase_control = mode;
        self
    }

    pub fn with_converter(mut self, beq: f64, g_sw: f64, k2: f64) -> Self {
        self.beq = beq;
        self.g_sw = g_sw;
        self.k2 = k2;
        self
    }

    pub fn deactivated(mut self) -> Self {
        self.active = false;
        self
    }

    /// Whether the tap module is a solver unknown.
    #[inline]
    pub fn module_is_free(&self) -> bool {
        self.module_control != TapModuleControl::Fixed
    }

    /// Whether the tap angle is a solver unknown.
    #[inline]
    pub fn phase_is_free(&self) -> bool {
        self.phase_control != TapPhaseControl::Fixed
    }

    /// Whether the tap module regulates a remote bus voltage.
    #[inline]
    pub fn regulates_voltage(&self) -> bool {
        self.module_control == TapModuleControl::Vm
    }

    /// Whether any non-fixed control is declared on this branch.
    #[inline]
    pub fn is_controlled(&self) -> bool {
        self.module_is_free() || self.phase_is_free()
    }
}

/// Flat network snapshot: bus and branch arrays plus the system base.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Network {
    pub buses: Vec<Bus>,
    pub branches: Vec<Branch>,
    /// System base power in MVA (bookkeeping for importers).
    pub base_mva: f64,
}

impl Network {
    pub fn new() -> Self {
        Self {
            buses: Vec::new(),
            branches: Vec::new(),
            base_mva: 100.0,
        }
    }

    pub fn add_bus(&mut self, bus: Bus) -> BusIdx {
        self.buses.push(bus);
        BusIdx(self.buses.len() - 1)
    }

    pub fn add_branch(&mut self, branch: Branch) -> BranchIdx {
        self.branches.push(branch);
        BranchIdx(self.branches.len() - 1)
    }

    #[inline]
    pub fn n_bus(&self) -> usize {
        self.buses.len()
    }

    #[inline]
    pub fn n_branch(&self) -> usize {
        self.branches.len()
    }

    /// Indices of branches currently in service.
    pub fn active_branches(&self) -> Vec<usize> {
        self.branches
            .iter()
            .enumerate()
            .filter(|(_, br)| br.active)
            .map(|(k, _)| k)
            .collect()
    }

    /// Check structural preconditions before handing the snapshot to a
    /// solver. An empty network or a dangling bus reference is a hard
    /// failure at the API boundary; everything numeric is left to the
    /// solver's own diagnostics.
    pub fn validate(&self) -> GridResult<()> {
        if self.buses.is_empty() {
            return Err(GridError::Validation("network has no buses".into()));
        }
        let n = self.buses.len();
        for (k, br) in self.branches.iter().enumerate() {
            if br.from.value() >= n || br.to.value() >= n {
                return Err(GridError::Network(format!(
                    "branch {} ({}) references a bus outside 0..{}",
                    k, br.name, n
                )));
            }
            if br.from == br.to {
                return Err(GridError::Network(format!(
                    "branch {} ({}) connects bus {} to itself",
                    k,
                    br.name,
                    br.from.value()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_bus() -> Network {
        let mut net = Network::new();
        let b1 = net.add_bus(Bus::new("slack", BusType::Slack));
        let b2 = net.add_bus(Bus::new("load", BusType::Pq).with_injection(-0.5, -0.2));
        net.add_branch(Branch::new("line", b1, b2, 0.01, 0.05));
        net
    }

    #[test]
    fn test_validate_ok() {
        assert!(two_bus().validate().is_ok());
    }

    #[test]
    fn test_validate_empty() {
        let net = Network::new();
        assert!(matches!(net.validate(), Err(GridError::Validation(_))));
    }

    #[test]
    fn test_validate_dangling_branch() {
        let mut net = two_bus();
        net.branches[0].to = BusIdx::new(7);
        assert!(matches!(net.validate(), Err(GridError::Network(_))));
    }

    #[test]
    fn test_validate_self_loop() {
        let mut net = two_bus();
        net.branches[0].to = net.branches[0].from;
        assert!(matches!(net.validate(), Err(GridError::Network(_))));
    }

    #[test]
    fn test_active_branches_skips_deactivated() {
        let mut net = two_bus();
        let b1 = BusIdx::new(0);
        let b2 = BusIdx::new(1);
        net.add_branch(Branch::new("out", b1, b2, 0.02, 0.1).deactivated());
        assert_eq!(net.active_branches(), vec![0]);
    }

    #[test]
    fn test_bus_idx_serde_transparent() {
        let idx = BusIdx::new(5);
        let json = serde_json::to_string(&idx).unwrap();
        assert_eq!(json, "5");
        let back: BusIdx = serde_json::from_str(&json).unwrap();
        assert_eq!(back, idx);
    }

    #[test]
    fn test_branch_capability_queries() {
        let mut br = Branch::new("t", BusIdx::new(0), BusIdx::new(1), 0.0, 0.1);
        assert!(!br.is_controlled());
        br.module_control = TapModuleControl::Vm;
        assert!(br.regulates_voltage());
        assert!(br.module_is_free());
        assert!(!br.phase_is_free());
        br.phase_control = TapPhaseControl::Pf;
        assert!(br.phase_is_free());
    }
}
