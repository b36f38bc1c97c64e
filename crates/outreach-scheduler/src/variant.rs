//! Weighted A/B variant selection.
//!
//! A cumulative-weight table is built on every call; no RNG state survives
//! between calls. Pinning is the caller's business.

use rand::Rng;

use crate::models::{Step, Variant};

/// Pick one of the step's variants at random, proportional to weight.
/// `None` when the step has no variants (use the step's own templates).
pub fn pick_variant(step: &Step) -> Option<&Variant> {
    pick_variant_with(step, &mut rand::thread_rng())
}

/// Same as [`pick_variant`] with a caller-supplied RNG.
pub fn pick_variant_with<'a, R: Rng>(step: &'a Step, rng: &mut R) -> Option<&'a Variant> {
    if step.variants.is_empty() {
        return None;
    }

    let mut cumulative = Vec::with_capacity(step.variants.len());
    let mut total: u64 = 0;
    for v in &step.variants {
        total = total.saturating_add(v.effective_weight());
        cumulative.push(total);
    }

    let draw = rng.gen_range(0..total);
    // First bucket whose upper bound exceeds the draw
    let idx = cumulative.partition_point(|&upper| upper <= draw);
    step.variants.get(idx)
}

/// The variant with the recipient's pinned label, if the step has one.
pub fn pinned<'a>(step: &'a Step, label: &str) -> Option<&'a Variant> {
    step.variants.iter().find(|v| v.label == label)
}
