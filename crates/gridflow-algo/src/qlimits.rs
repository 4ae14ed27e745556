//! Generator reactive-power limit enforcement.
//!
//! When a voltage-holding bus (PV or P) would need more reactive support
//! than its capability band allows, it is reclassified to PQ and its
//! reactive injection is clamped to the violated bound. The switch is a
//! one-directional ratchet within a solve: PQ buses are never promoted back
//! to PV, which oscillates in practice.

use gridflow_core::{BusType, Network};
use num_complex::Complex64;

/// Reactive-power control mode for the outer solve loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum QControlMode {
    /// Leave bus types alone; limits are reported but not enforced.
    NoControl,
    /// Clamp violating buses to the bound and reclassify them to PQ.
    Direct,
}

/// Clamp reactive injections that left their band and reclassify the bus.
///
/// `sbus` is the specified-injection vector the residual is measured
/// against; the clamped Q becomes the bus's new specification. Returns the
/// number of reclassified buses so the caller can decide whether to keep
/// distributing changes across outer iterations.
pub fn enforce_q_limits(
    net: &Network,
    scalc: &[Complex64],
    bus_types: &mut [BusType],
    sbus: &mut [Complex64],
) -> usize {
    let mut changes = 0;
    for (i, bus) in net.buses.iter().enumerate() {
        if !bus_types[i].holds_voltage() {
            continue;
        }
        let q = scalc[i].im;
        let clamped = if q > bus.q_max {
            Some(bus.q_max)
        } else if q < bus.q_min {
            Some(bus.q_min)
        } else {
            None
        };
        if let Some(q_lim) = clamped {
            eprintln!(
                "  Bus {} ({}): Q={:.4} outside [{:.4}, {:.4}], switching to PQ",
                i, bus.name, q, bus.q_min, bus.q_max
            );
            bus_types[i] = BusType::Pq;
            sbus[i] = Complex64::new(sbus[i].re, q_lim);
            changes += 1;
        }
    }
    changes
}
