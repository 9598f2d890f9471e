//! Pending heights resolution.

use std::ops::RangeInclusive;

use crate::store::{self, Store};
use crate::Height;

/// Return the ascending heights of `range` that are not `completed` in `store`.
///
/// Heights without any status row, `failed` ones and `processing` ones left behind by an interrupted run are all
/// pending alike, which is what makes a run resumable.
pub async fn pending_heights<T: Store + ?Sized>(store: &T, range: RangeInclusive<Height>) -> Result<Vec<Height>, store::Error> {
    let completed = store.completed_heights(range.clone()).await?;

    tracing::debug!("{} heights already completed in {range:?}", completed.len());

    Ok(range.filter(|height| !completed.contains(height)).collect())
}
