//! Prometheus counters for compatibility checks and agreement slot transitions.
//!
//! Counters are registered with the default prometheus registry when the `metrics` feature is
//! enabled. Without it the recording functions do nothing.

/// Agreement slot state changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotTransition {
    Attempt,
    Final,
    Cancel,
}

impl SlotTransition {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotTransition::Attempt => "attempt",
            SlotTransition::Final => "final",
            SlotTransition::Cancel => "cancel",
        }
    }
}

#[cfg(feature = "metrics")]
mod counters {
    use lazy_static::lazy_static;
    use prometheus::{register_int_counter_vec, IntCounterVec};

    lazy_static! {
        /// Compatibility checks by result
        pub static ref COMPATIBILITY_CHECKS: Option<IntCounterVec> = register_int_counter_vec!(
            "mesh_policy_compatibility_checks",
            "Producer and consumer policy compatibility checks",
            &["result"]
        )
        .ok();

        /// Agreement slot transitions by kind
        pub static ref SLOT_TRANSITIONS: Option<IntCounterVec> = register_int_counter_vec!(
            "mesh_policy_agreement_slot_transitions",
            "Agreement slot accounting transitions",
            &["transition"]
        )
        .ok();
    }
}

#[cfg(feature = "metrics")]
pub fn record_compatibility(compatible: bool) {
    let result = if compatible { "compatible" } else { "incompatible" };
    if let Some(counter) = counters::COMPATIBILITY_CHECKS.as_ref() {
        counter.with_label_values(&[result]).inc();
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_compatibility(_compatible: bool) {}

#[cfg(feature = "metrics")]
pub fn record_slot_transition(transition: SlotTransition) {
    if let Some(counter) = counters::SLOT_TRANSITIONS.as_ref() {
        counter.with_label_values(&[transition.as_str()]).inc();
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_slot_transition(_transition: SlotTransition) {}
