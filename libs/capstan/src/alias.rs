//! Input aliasing for saved activations.
//!
//! An activation that *is* one of the step's `x` placeholders (same
//! expression identity, not merely an equal value) never needs to be
//! materialized by the forward program: the executor already holds the
//! concrete slice for the current step. Such activations become markers, and
//! [`AliasResolver::resolve`] re-attaches the real buffer. This avoids
//! slicing and stacking large stacked inputs twice per step.
use crate::error::internal;
use crate::{Buffer, Capexpr, Error};

/// Where one activation slot comes from at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationSlot {
    /// The k-th extra output of the forward program.
    Saved(usize),
    /// An alias of the j-th `x` leaf of the current step.
    XLeaf(usize),
}

/// Re-attaches aliased activations against the concrete `x` of a step.
#[derive(Debug, Clone, Default)]
pub struct AliasResolver {
    slots: Vec<ActivationSlot>,
}

impl AliasResolver {
    pub fn slots(&self) -> &[ActivationSlot] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of activations resolved by aliasing rather than storage.
    pub fn aliased_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, ActivationSlot::XLeaf(_)))
            .count()
    }

    /// Builds the full activation list for one step from the forward
    /// program's materialized outputs plus the step's concrete `x` leaves.
    pub fn resolve(&self, partial: &[Buffer], x: &[Buffer]) -> Result<Vec<Buffer>, Error> {
        self.slots
            .iter()
            .map(|slot| match slot {
                ActivationSlot::Saved(k) => partial
                    .get(*k)
                    .cloned()
                    .ok_or_else(|| internal("missing materialized activation")),
                ActivationSlot::XLeaf(j) => x
                    .get(*j)
                    .cloned()
                    .ok_or_else(|| internal("missing x leaf for aliased activation")),
            })
            .collect()
    }
}

/// Splits raw saved activations into materialized ones and input aliases.
/// Returns the expressions the forward program must still emit, plus the
/// resolver describing the full activation layout.
pub fn alias_activations(
    saved: &[Capexpr],
    x_params: &[Capexpr],
) -> (Vec<Capexpr>, AliasResolver) {
    let mut materialized = Vec::new();
    let mut slots = Vec::with_capacity(saved.len());
    for activation in saved {
        let alias = x_params
            .iter()
            .position(|param| param.id() == activation.id());
        match alias {
            Some(j) => slots.push(ActivationSlot::XLeaf(j)),
            None => {
                slots.push(ActivationSlot::Saved(materialized.len()));
                materialized.push(activation.clone());
            }
        }
    }
    (materialized, AliasResolver { slots })
}
