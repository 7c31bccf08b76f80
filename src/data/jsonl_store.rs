/// Durable bar storage - one append-only JSONL file per resolution
/// Indexed in memory on open, so reads never touch the disk
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::data::bar_store::{check_partition, BarStore, Partition};
use crate::data::Resolution;
use crate::error::{Result, SyncError};
use crate::types::Bar;

struct FilePartition {
    index: Partition,
    path: PathBuf,
}

/// JSONL-backed [`BarStore`]. Files live at `<data_dir>/<symbol>_<table>.jsonl`.
pub struct JsonlBarStore {
    symbol: String,
    partitions: [RwLock<FilePartition>; Resolution::COUNT],
}

impl JsonlBarStore {
    /// Open (or create) the store for `symbol` under `data_dir`
    pub async fn open(data_dir: impl AsRef<Path>, symbol: &str) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        tokio::fs::create_dir_all(data_dir).await?;

        let symbol = symbol.to_uppercase();
        let mut loaded = Vec::with_capacity(Resolution::COUNT);
        for res in Resolution::ALL {
            let path = data_dir.join(format!("{}_{}.jsonl", symbol, res.table_name()));
            let index = load_partition(&path, res).await?;
            if !index.is_empty() {
                debug!(resolution = %res, bars = index.len(), "Loaded {}", path.display());
            }
            loaded.push(FilePartition { index, path });
        }

        let partitions: [RwLock<FilePartition>; Resolution::COUNT] = loaded
            .into_iter()
            .map(RwLock::new)
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| SyncError::InternalError("partition count mismatch".to_string()))?;

        info!("📂 Opened bar store for {} at {}", symbol, data_dir.display());
        Ok(JsonlBarStore { symbol, partitions })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    fn partition(&self, resolution: Resolution) -> &RwLock<FilePartition> {
        &self.partitions[resolution.index()]
    }
}

/// Rebuild the index of one partition file, skipping lines that do not parse
async fn load_partition(path: &Path, resolution: Resolution) -> Result<Partition> {
    let mut index = Partition::default();
    if !tokio::fs::try_exists(path).await? {
        return Ok(index);
    }

    let file = tokio::fs::File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Bar>(&line) {
            Ok(bar) if bar.resolution == resolution => index.insert(bar),
            Ok(bar) => warn!(
                "Skipping {} bar on line {} of {}",
                bar.resolution,
                line_no,
                path.display()
            ),
            Err(e) => warn!("Skipping unreadable line {} of {}: {}", line_no, path.display(), e),
        }
    }
    Ok(index)
}

/// True when the file ends in a partial line, e.g. after an interrupted append
async fn ends_mid_line(path: &Path) -> Result<bool> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] != b'\n')
}

#[async_trait]
impl BarStore for JsonlBarStore {
    async fn insert_batch(&self, resolution: Resolution, bars: &[Bar]) -> Result<usize> {
        check_partition(resolution, bars)?;

        let mut partition = self.partition(resolution).write().await;
        let fresh: Vec<Bar> = partition.index.absent(bars).into_iter().cloned().collect();
        if fresh.is_empty() {
            return Ok(0);
        }

        let mut payload = String::new();
        // Never glue the first row onto a torn line
        if ends_mid_line(&partition.path).await? {
            warn!("Terminating partial line at end of {}", partition.path.display());
            payload.push('\n');
        }
        for bar in &fresh {
            payload.push_str(&serde_json::to_string(bar)?);
            payload.push('\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&partition.path)
            .await?;
        file.write_all(payload.as_bytes()).await?;
        file.sync_all().await?;

        // Index only after the rows are durable
        let written = fresh.len();
        for bar in fresh {
            partition.index.insert(bar);
        }
        Ok(written)
    }

    async fn first(&self, resolution: Resolution) -> Result<Option<Bar>> {
        Ok(self.partition(resolution).read().await.index.first())
    }

    async fn last(&self, resolution: Resolution) -> Result<Option<Bar>> {
        Ok(self.partition(resolution).read().await.index.last())
    }

    async fn list_range(&self, resolution: Resolution, from: i64, to: i64) -> Result<Vec<Bar>> {
        Ok(self.partition(resolution).read().await.index.range(from, to))
    }

    async fn find_missing(&self, resolution: Resolution, open_times: &[i64]) -> Result<Vec<i64>> {
        Ok(self.partition(resolution).read().await.index.missing(open_times))
    }

    async fn count(&self, resolution: Resolution) -> Result<usize> {
        Ok(self.partition(resolution).read().await.index.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::bar;

    const H1: Resolution = Resolution::OneHour;
    const HOUR: i64 = 3_600_000;

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = JsonlBarStore::open(dir.path(), "btcusdt").await.unwrap();
            let bars: Vec<Bar> = (0..3).map(|i| bar(H1, i * HOUR, 100.0 + i as f64)).collect();
            assert_eq!(store.insert_batch(H1, &bars).await.unwrap(), 3);
            assert_eq!(store.symbol(), "BTCUSDT");
        }

        assert!(dir.path().join("BTCUSDT_hour_1.jsonl").exists());

        let store = JsonlBarStore::open(dir.path(), "BTCUSDT").await.unwrap();
        assert_eq!(store.count(H1).await.unwrap(), 3);
        assert_eq!(store.last(H1).await.unwrap().unwrap().close, 102.0);
        assert_eq!(store.count(Resolution::OneMinute).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_replay_appends_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlBarStore::open(dir.path(), "ETHUSDT").await.unwrap();
        let bars = vec![bar(H1, 0, 1.0), bar(H1, HOUR, 2.0)];

        store.insert_batch(H1, &bars).await.unwrap();
        assert_eq!(store.insert_batch(H1, &bars).await.unwrap(), 0);

        let content = std::fs::read_to_string(dir.path().join("ETHUSDT_hour_1.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_skips_corrupt_lines() {
        let dir = tempfile::tempdir().unwrap();
        let good = serde_json::to_string(&bar(H1, HOUR, 5.0)).unwrap();
        std::fs::write(
            dir.path().join("BTCUSDT_hour_1.jsonl"),
            format!("{{not json\n{}\n\n", good),
        )
        .unwrap();

        let store = JsonlBarStore::open(dir.path(), "BTCUSDT").await.unwrap();
        assert_eq!(store.count(H1).await.unwrap(), 1);

        let missing = store.find_missing(H1, &[0, HOUR]).await.unwrap();
        assert_eq!(missing, vec![0]);
    }

    #[tokio::test]
    async fn test_append_after_torn_line() {
        let dir = tempfile::tempdir().unwrap();
        let good = serde_json::to_string(&bar(H1, 0, 5.0)).unwrap();
        std::fs::write(
            dir.path().join("BTCUSDT_hour_1.jsonl"),
            format!("{}\n{{\"resolution\":\"1h\",\"open_ti", good),
        )
        .unwrap();

        {
            let store = JsonlBarStore::open(dir.path(), "BTCUSDT").await.unwrap();
            assert_eq!(store.insert_batch(H1, &[bar(H1, HOUR, 6.0)]).await.unwrap(), 1);
        }

        let store = JsonlBarStore::open(dir.path(), "BTCUSDT").await.unwrap();
        assert_eq!(store.count(H1).await.unwrap(), 2);
        assert!(store.find_missing(H1, &[0, HOUR]).await.unwrap().is_empty());
    }
}
