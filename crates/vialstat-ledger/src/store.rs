//! Vial State Store contract

use vialstat_common::{Record, SelectionParams, StoreError, VialId, NUM_VIALS};

/// Append-only per-vial log storage
///
/// Implementations are single-writer. Reads return records oldest first.
pub trait VialStore: Send + Sync {
    /// The newest `n` records of log `R` (fewer if the log is shorter)
    fn read_last<R: Record>(&self, vial: VialId, n: usize) -> Result<Vec<R>, StoreError>;

    /// Every record of log `R`
    fn read_all<R: Record>(&self, vial: VialId) -> Result<Vec<R>, StoreError>;

    /// Number of records in log `R`
    fn count<R: Record>(&self, vial: VialId) -> Result<usize, StoreError>;

    /// Append a record; its time must not precede the newest record
    fn append<R: Record>(&self, vial: VialId, record: &R) -> Result<(), StoreError>;

    /// Labeled selection-control parameters, if the vial has any
    fn selection_params(&self, vial: VialId) -> Result<Option<SelectionParams>, StoreError>;

    /// Selection step sequence, if the vial has one
    fn selection_steps(&self, vial: VialId) -> Result<Option<Vec<f64>>, StoreError>;

    /// The newest record of log `R`
    fn last<R: Record>(&self, vial: VialId) -> Result<Option<R>, StoreError> {
        Ok(self.read_last::<R>(vial, 1)?.pop())
    }
}

/// Reject vial indices outside the device array
pub(crate) fn check_vial(vial: VialId) -> Result<(), StoreError> {
    if vial >= NUM_VIALS {
        return Err(StoreError::UnknownVial(vial));
    }
    Ok(())
}

/// Enforce time ordering of an append against the newest existing record
pub(crate) fn check_order<R: Record>(
    vial: VialId,
    last: Option<&R>,
    record: &R,
) -> Result<(), StoreError> {
    if let Some(last) = last {
        if record.time() < last.time() {
            return Err(StoreError::OutOfOrder {
                log: R::KIND.suffix(),
                vial,
                last: last.time(),
                time: record.time(),
            });
        }
    }
    Ok(())
}
