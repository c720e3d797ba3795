//! Merge strategies reducing all rows found for one feature id to one row.

use super::layer::LayerRow;

/// Reduces the rows found for one feature id into the row returned to the
/// caller. Returning `None` drops the feature from the result.
///
/// `rows` is never empty. Its order is unspecified: a strategy that depends
/// on priority must look at [`LayerRow::layer`] itself.
///
/// Implemented for plain closures, so ad-hoc strategies need no type:
///
/// ```
/// # use featureview::view::{LayerRow, MergeOperation};
/// let last_wins = |rows: Vec<LayerRow<u32>>| rows.into_iter().last().map(|r| r.row);
/// # let _: &dyn MergeOperation<u32> = &last_wins;
/// ```
pub trait MergeOperation<C>: Send + Sync {
    fn apply(&self, rows: Vec<LayerRow<C>>) -> Option<C>;
}

impl<C, F> MergeOperation<C> for F
where
    F: Fn(Vec<LayerRow<C>>) -> Option<C> + Send + Sync,
{
    fn apply(&self, rows: Vec<LayerRow<C>>) -> Option<C> {
        self(rows)
    }
}

/// Picks the row from the highest-priority layer that has the feature.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeByStoragePriority;

impl<C> MergeOperation<C> for MergeByStoragePriority {
    fn apply(&self, rows: Vec<LayerRow<C>>) -> Option<C> {
        rows.into_iter().min_by_key(|r| r.layer).map(|r| r.row)
    }
}
