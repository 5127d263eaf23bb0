//! In-memory store
//!
//! Holds encoded rows per (vial, log) so records read back exactly as they
//! would from the CSV backend.

use dashmap::DashMap;
use tracing::debug;

use vialstat_common::{LogKind, Record, SelectionParams, StoreError, VialId};

use crate::codec::{decode_row, encode_row};
use crate::store::{check_order, check_vial, VialStore};

/// DashMap-backed vial store
#[derive(Debug, Default)]
pub struct InMemoryVialStore {
    /// Encoded rows by vial and log
    rows: DashMap<(VialId, LogKind), Vec<String>>,

    /// Selection-control parameters by vial
    params: DashMap<VialId, SelectionParams>,

    /// Selection step sequences by vial
    steps: DashMap<VialId, Vec<f64>>,
}

impl InMemoryVialStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Install selection configuration for a vial
    pub fn set_selection(&self, vial: VialId, params: SelectionParams, steps: Vec<f64>) {
        self.params.insert(vial, params);
        self.steps.insert(vial, steps);
    }

    /// Append several records in order
    pub fn extend<R: Record>(
        &self,
        vial: VialId,
        records: impl IntoIterator<Item = R>,
    ) -> Result<(), StoreError> {
        for record in records {
            self.append(vial, &record)?;
        }
        Ok(())
    }

    fn decode_rows<R: Record>(vial: VialId, rows: &[String]) -> Result<Vec<R>, StoreError> {
        rows.iter().map(|row| decode_row::<R>(vial, row)).collect()
    }
}

impl VialStore for InMemoryVialStore {
    fn read_last<R: Record>(&self, vial: VialId, n: usize) -> Result<Vec<R>, StoreError> {
        check_vial(vial)?;
        match self.rows.get(&(vial, R::KIND)) {
            Some(rows) => {
                let start = rows.len().saturating_sub(n);
                Self::decode_rows(vial, &rows[start..])
            }
            None => Ok(Vec::new()),
        }
    }

    fn read_all<R: Record>(&self, vial: VialId) -> Result<Vec<R>, StoreError> {
        check_vial(vial)?;
        match self.rows.get(&(vial, R::KIND)) {
            Some(rows) => Self::decode_rows(vial, &rows),
            None => Ok(Vec::new()),
        }
    }

    fn count<R: Record>(&self, vial: VialId) -> Result<usize, StoreError> {
        check_vial(vial)?;
        Ok(self
            .rows
            .get(&(vial, R::KIND))
            .map(|rows| rows.len())
            .unwrap_or(0))
    }

    fn append<R: Record>(&self, vial: VialId, record: &R) -> Result<(), StoreError> {
        check_vial(vial)?;
        let last = self.last::<R>(vial)?;
        check_order(vial, last.as_ref(), record)?;

        let row = encode_row(record)?;
        debug!(vial, log = %R::KIND, row = %row, "Record appended");
        self.rows.entry((vial, R::KIND)).or_default().push(row);
        Ok(())
    }

    fn selection_params(&self, vial: VialId) -> Result<Option<SelectionParams>, StoreError> {
        check_vial(vial)?;
        Ok(self.params.get(&vial).map(|p| p.clone()))
    }

    fn selection_steps(&self, vial: VialId) -> Result<Option<Vec<f64>>, StoreError> {
        check_vial(vial)?;
        Ok(self.steps.get(&vial).map(|s| s.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vialstat_common::{OdReading, PumpEvent, SlowPumpEvent};

    #[test]
    fn test_append_and_read_last() {
        let store = InMemoryVialStore::new();
        for i in 0..10 {
            store
                .append(2, &OdReading::new(i as f64 * 0.1, 0.5 + i as f64 * 0.01))
                .unwrap();
        }

        let last = store.read_last::<OdReading>(2, 3).unwrap();
        assert_eq!(last.len(), 3);
        assert!((last[2].time - 0.9).abs() < 1e-12);
        assert!(last[0].time < last[1].time);

        assert_eq!(store.count::<OdReading>(2).unwrap(), 10);
        assert_eq!(store.read_last::<OdReading>(2, 50).unwrap().len(), 10);
    }

    #[test]
    fn test_logs_are_independent() {
        let store = InMemoryVialStore::new();
        store.append(0, &PumpEvent::new(1.0, 5.0)).unwrap();

        assert_eq!(store.count::<PumpEvent>(0).unwrap(), 1);
        assert_eq!(store.count::<SlowPumpEvent>(0).unwrap(), 0);
        assert_eq!(store.count::<PumpEvent>(1).unwrap(), 0);
    }

    #[test]
    fn test_out_of_order_rejected() {
        let store = InMemoryVialStore::new();
        store.append(0, &OdReading::new(2.0, 0.5)).unwrap();
        let err = store.append(0, &OdReading::new(1.0, 0.5)).unwrap_err();
        assert!(matches!(err, StoreError::OutOfOrder { .. }));

        // Same-tick records share a timestamp
        store.append(0, &OdReading::new(2.0, 0.6)).unwrap();
    }

    #[test]
    fn test_unknown_vial() {
        let store = InMemoryVialStore::new();
        assert!(matches!(
            store.read_last::<OdReading>(16, 1),
            Err(StoreError::UnknownVial(16))
        ));
    }

    #[test]
    fn test_last_on_empty_log() {
        let store = InMemoryVialStore::new();
        assert_eq!(store.last::<PumpEvent>(5).unwrap(), None);
        assert_eq!(store.selection_steps(5).unwrap(), None);
    }
}
