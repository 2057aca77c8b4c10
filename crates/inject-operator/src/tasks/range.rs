//! Range filtering applied once between selector resolution and sub-task seeding

use crate::crds::experiment::{RangeMode, RangeType};
use crate::tasks::model::AtomicObject;
use rand::seq::SliceRandom;
use rand::Rng;

/// Number of targets the mode keeps out of `total`.
#[must_use]
pub fn retained_count(mode: Option<&RangeMode>, total: usize) -> usize {
    let Some(mode) = mode else {
        return total;
    };

    let value = usize::try_from(mode.value.max(0)).unwrap_or(usize::MAX);
    match mode.range_type {
        RangeType::All => total,
        RangeType::Count => value.min(total),
        RangeType::Percent => (value.saturating_mul(total) / 100).min(total),
    }
}

/// Keep a uniformly random subset of `targets`, sorted by stable name.
///
/// When the mode keeps everything the input order is preserved untouched.
pub fn apply_range<R: Rng + ?Sized>(
    mut targets: Vec<AtomicObject>,
    mode: Option<&RangeMode>,
    rng: &mut R,
) -> Vec<AtomicObject> {
    let count = retained_count(mode, targets.len());
    if count >= targets.len() {
        return targets;
    }

    targets.shuffle(rng);
    targets.truncate(count);
    targets.sort_by_cached_key(AtomicObject::object_name);
    targets
}
