/// Bar persistence contract and in-memory implementation
use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::data::Resolution;
use crate::error::{Result, SyncError};
use crate::types::Bar;

/// Per-resolution bar table keyed by open-time.
///
/// Implementations partition storage by resolution so pipelines for different
/// resolutions never contend on the same partition.
#[async_trait]
pub trait BarStore: Send + Sync {
    /// Insert bars whose open-time is not yet stored; existing rows are left as
    /// they are. Returns the number of rows actually written.
    async fn insert_batch(&self, resolution: Resolution, bars: &[Bar]) -> Result<usize>;

    /// Earliest stored bar
    async fn first(&self, resolution: Resolution) -> Result<Option<Bar>>;

    /// Latest stored bar
    async fn last(&self, resolution: Resolution) -> Result<Option<Bar>>;

    /// Bars with `from <= open_time <= to`, ascending
    async fn list_range(&self, resolution: Resolution, from: i64, to: i64) -> Result<Vec<Bar>>;

    /// The subset of `open_times` with no stored bar, ascending
    async fn find_missing(&self, resolution: Resolution, open_times: &[i64]) -> Result<Vec<i64>>;

    /// Number of stored bars
    async fn count(&self, resolution: Resolution) -> Result<usize>;
}

/// Reject bars that were routed to the wrong partition
pub(crate) fn check_partition(resolution: Resolution, bars: &[Bar]) -> Result<()> {
    if let Some(bar) = bars.iter().find(|b| b.resolution != resolution) {
        return Err(SyncError::StoreError(format!(
            "{} bar @ {} sent to {} partition",
            bar.resolution, bar.open_time, resolution
        )));
    }
    Ok(())
}

/// Sorted partition shared by the in-memory and JSONL stores
#[derive(Debug, Default)]
pub(crate) struct Partition {
    rows: BTreeMap<i64, Bar>,
}

impl Partition {
    /// Bars from `bars` that are new to this partition, first occurrence wins
    pub(crate) fn absent<'a>(&self, bars: &'a [Bar]) -> Vec<&'a Bar> {
        let mut seen = std::collections::HashSet::new();
        bars.iter()
            .filter(|b| !self.rows.contains_key(&b.open_time) && seen.insert(b.open_time))
            .collect()
    }

    pub(crate) fn insert(&mut self, bar: Bar) {
        self.rows.entry(bar.open_time).or_insert(bar);
    }

    pub(crate) fn first(&self) -> Option<Bar> {
        self.rows.values().next().cloned()
    }

    pub(crate) fn last(&self) -> Option<Bar> {
        self.rows.values().next_back().cloned()
    }

    pub(crate) fn range(&self, from: i64, to: i64) -> Vec<Bar> {
        if from > to {
            return Vec::new();
        }
        self.rows.range(from..=to).map(|(_, bar)| bar.clone()).collect()
    }

    pub(crate) fn missing(&self, open_times: &[i64]) -> Vec<i64> {
        let mut missing: Vec<i64> = open_times
            .iter()
            .copied()
            .filter(|t| !self.rows.contains_key(t))
            .collect();
        missing.sort_unstable();
        missing.dedup();
        missing
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Volatile store, one locked partition per resolution
pub struct MemoryBarStore {
    partitions: [RwLock<Partition>; Resolution::COUNT],
}

impl MemoryBarStore {
    pub fn new() -> Self {
        MemoryBarStore {
            partitions: std::array::from_fn(|_| RwLock::new(Partition::default())),
        }
    }

    fn partition(&self, resolution: Resolution) -> &RwLock<Partition> {
        &self.partitions[resolution.index()]
    }
}

impl Default for MemoryBarStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BarStore for MemoryBarStore {
    async fn insert_batch(&self, resolution: Resolution, bars: &[Bar]) -> Result<usize> {
        check_partition(resolution, bars)?;

        let mut partition = self.partition(resolution).write().await;
        let fresh: Vec<Bar> = partition.absent(bars).into_iter().cloned().collect();
        let written = fresh.len();
        for bar in fresh {
            partition.insert(bar);
        }
        Ok(written)
    }

    async fn first(&self, resolution: Resolution) -> Result<Option<Bar>> {
        Ok(self.partition(resolution).read().await.first())
    }

    async fn last(&self, resolution: Resolution) -> Result<Option<Bar>> {
        Ok(self.partition(resolution).read().await.last())
    }

    async fn list_range(&self, resolution: Resolution, from: i64, to: i64) -> Result<Vec<Bar>> {
        Ok(self.partition(resolution).read().await.range(from, to))
    }

    async fn find_missing(&self, resolution: Resolution, open_times: &[i64]) -> Result<Vec<i64>> {
        Ok(self.partition(resolution).read().await.missing(open_times))
    }

    async fn count(&self, resolution: Resolution) -> Result<usize> {
        Ok(self.partition(resolution).read().await.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::bar;

    const M1: Resolution = Resolution::OneMinute;

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let store = MemoryBarStore::new();
        let first = bar(M1, 60_000, 10.0);
        let mut replay = first.clone();
        replay.close = 99.0;

        assert_eq!(store.insert_batch(M1, &[first.clone()]).await.unwrap(), 1);
        assert_eq!(store.insert_batch(M1, &[replay]).await.unwrap(), 0);

        let rows = store.list_range(M1, 0, 120_000).await.unwrap();
        assert_eq!(rows, vec![first]);
    }

    #[tokio::test]
    async fn test_duplicates_within_batch_keep_first() {
        let store = MemoryBarStore::new();
        let a = bar(M1, 0, 1.0);
        let b = bar(M1, 0, 2.0);

        assert_eq!(store.insert_batch(M1, &[a.clone(), b]).await.unwrap(), 1);
        assert_eq!(store.first(M1).await.unwrap(), Some(a));
    }

    #[tokio::test]
    async fn test_range_is_ordered_and_unique() {
        let store = MemoryBarStore::new();
        let bars: Vec<Bar> = [300_000, 0, 180_000, 60_000]
            .iter()
            .map(|t| bar(M1, *t, 1.0))
            .collect();
        store.insert_batch(M1, &bars).await.unwrap();
        store.insert_batch(M1, &bars).await.unwrap();

        let rows = store.list_range(M1, 0, 300_000).await.unwrap();
        let times: Vec<i64> = rows.iter().map(|b| b.open_time).collect();
        assert_eq!(times, vec![0, 60_000, 180_000, 300_000]);

        assert_eq!(store.first(M1).await.unwrap().unwrap().open_time, 0);
        assert_eq!(store.last(M1).await.unwrap().unwrap().open_time, 300_000);
        assert!(store.list_range(M1, 10, 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_find_missing() {
        let store = MemoryBarStore::new();
        store
            .insert_batch(M1, &[bar(M1, 60_000, 1.0), bar(M1, 180_000, 1.0)])
            .await
            .unwrap();

        let missing = store
            .find_missing(M1, &[240_000, 0, 60_000, 120_000, 180_000])
            .await
            .unwrap();
        assert_eq!(missing, vec![0, 120_000, 240_000]);
    }

    #[tokio::test]
    async fn test_partitions_are_isolated() {
        let store = MemoryBarStore::new();
        store.insert_batch(M1, &[bar(M1, 0, 1.0)]).await.unwrap();

        assert_eq!(store.count(M1).await.unwrap(), 1);
        assert_eq!(store.count(Resolution::OneHour).await.unwrap(), 0);
        assert!(store.first(Resolution::OneHour).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_wrong_partition_rejected() {
        let store = MemoryBarStore::new();
        let result = store
            .insert_batch(Resolution::OneHour, &[bar(M1, 0, 1.0)])
            .await;
        assert!(matches!(result, Err(SyncError::StoreError(_))));
    }
}
