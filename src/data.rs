//! Pretokenized shards and the random-window batch iterator.
//!
//! A shard is a flat file of little-endian `u16` token ids named `data*.bin`. Shard 0 (in
//! name order) is held out for validation; every other shard is training data.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, ensure, Context, Result};
use candle_core::{Device, Tensor};
use memmap2::Mmap;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::mtp::{self, MtpBatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Val,
}

enum ShardData {
    Mapped(Mmap),
    Memory(Vec<u16>),
}

pub struct Shard {
    name: String,
    data: ShardData,
}

impl Shard {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open shard {}", path.display()))?;
        // SAFETY: shards are treated as read-only for the lifetime of the run.
        let mmap = unsafe { Mmap::map(&file)? };
        ensure!(
            mmap.len() % 2 == 0,
            "shard {} has an odd byte length ({}), expected u16 tokens",
            path.display(),
            mmap.len()
        );
        Ok(Self {
            name: path.display().to_string(),
            data: ShardData::Mapped(mmap),
        })
    }

    pub fn from_tokens(name: impl Into<String>, tokens: Vec<u16>) -> Self {
        Self {
            name: name.into(),
            data: ShardData::Memory(tokens),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        match &self.data {
            ShardData::Mapped(m) => m.len() / 2,
            ShardData::Memory(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies tokens `[start, end)`, clamped to the shard length.
    pub fn tokens(&self, start: usize, end: usize) -> Vec<u16> {
        let end = end.min(self.len());
        if start >= end {
            return Vec::new();
        }
        match &self.data {
            ShardData::Mapped(m) => m[start * 2..end * 2]
                .chunks_exact(2)
                .map(|b| u16::from_le_bytes([b[0], b[1]]))
                .collect(),
            ShardData::Memory(v) => v[start..end].to_vec(),
        }
    }
}

/// Sorted `data*.bin` files in `dir`.
pub fn list_shards(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("failed to read shard directory {}", dir.display()))?;
    let mut shards = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_shard = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("data") && n.ends_with(".bin"));
        if is_shard {
            shards.push(path);
        }
    }
    shards.sort();
    Ok(shards)
}

/// Writes `tokens` as a little-endian u16 shard.
pub fn write_shard(path: &Path, tokens: &[u16]) -> Result<()> {
    let bytes: Vec<u8> = tokens.iter().flat_map(|t| t.to_le_bytes()).collect();
    fs::write(path, bytes).with_context(|| format!("failed to write shard {}", path.display()))?;
    Ok(())
}

/// The shards of one split.
pub struct PretokDataset {
    shards: Vec<Shard>,
}

impl PretokDataset {
    pub fn open(dir: &Path, split: Split) -> Result<Self> {
        let paths = list_shards(dir)?;
        ensure!(!paths.is_empty(), "no data*.bin shards in {}", dir.display());
        let selected: Vec<&PathBuf> = match split {
            Split::Val => paths.iter().take(1).collect(),
            Split::Train => paths.iter().skip(1).collect(),
        };
        if selected.is_empty() {
            bail!(
                "{:?} split is empty: {} holds a single shard, which is reserved for validation",
                split,
                dir.display()
            );
        }
        let shards = selected
            .into_iter()
            .map(|p| Shard::open(p))
            .collect::<Result<Vec<_>>>()?;
        let dataset = Self::from_shards(shards);
        info!(
            ?split,
            shards = dataset.shards.len(),
            tokens = dataset.num_tokens(),
            "opened pretokenized dataset"
        );
        Ok(dataset)
    }

    pub fn from_shards(shards: Vec<Shard>) -> Self {
        Self { shards }
    }

    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    pub fn num_tokens(&self) -> usize {
        self.shards.iter().map(Shard::len).sum()
    }
}

/// Endless stream of MTP batches drawn from a dataset.
///
/// Windows start at multiples of `seq_len` inside a shard and need `seq_len + 1` real
/// tokens; later head targets that run past the shard end are ignored in the loss. Each
/// epoch shuffles the shard order and the window order within every shard.
pub struct BatchIter {
    dataset: Arc<PretokDataset>,
    batch_size: usize,
    seq_len: usize,
    n_future: usize,
    device: Device,
    rng: StdRng,
    shard_order: Vec<usize>,
    shard_cursor: usize,
    window_starts: Vec<usize>,
    window_cursor: usize,
    windows_this_epoch: usize,
    epoch: usize,
}

impl BatchIter {
    pub fn new(
        dataset: Arc<PretokDataset>,
        batch_size: usize,
        seq_len: usize,
        n_future: usize,
        device: Device,
        seed: u64,
    ) -> Result<Self> {
        ensure!(batch_size > 0, "batch_size must be > 0");
        ensure!(seq_len > 0, "seq_len must be > 0");
        ensure!(n_future > 0, "n_future must be >= 1");
        ensure!(!dataset.shards().is_empty(), "dataset has no shards");
        let mut iter = Self {
            dataset,
            batch_size,
            seq_len,
            n_future,
            device,
            rng: StdRng::seed_from_u64(seed),
            shard_order: Vec::new(),
            shard_cursor: 0,
            window_starts: Vec::new(),
            window_cursor: 0,
            windows_this_epoch: 0,
            epoch: 0,
        };
        iter.start_epoch();
        Ok(iter)
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    fn start_epoch(&mut self) {
        self.shard_order = (0..self.dataset.shards().len()).collect();
        self.shard_order.shuffle(&mut self.rng);
        self.shard_cursor = 0;
        self.window_starts.clear();
        self.window_cursor = 0;
        self.windows_this_epoch = 0;
    }

    /// Loads the window starts of the next shard in this epoch; false when the epoch is done.
    fn advance_shard(&mut self) -> bool {
        while self.shard_cursor < self.shard_order.len() {
            let idx = self.shard_order[self.shard_cursor];
            self.shard_cursor += 1;
            let shard = &self.dataset.shards()[idx];
            if shard.len() <= self.seq_len {
                warn!(
                    shard = shard.name(),
                    tokens = shard.len(),
                    seq_len = self.seq_len,
                    "shard too short for a single window, skipping"
                );
                continue;
            }
            let num_windows = (shard.len() - 1) / self.seq_len;
            self.window_starts = (0..num_windows).map(|i| i * self.seq_len).collect();
            self.window_starts.shuffle(&mut self.rng);
            self.window_cursor = 0;
            debug!(shard = shard.name(), windows = num_windows, "loaded shard");
            return true;
        }
        false
    }

    fn next_window(&mut self) -> Result<Vec<i64>> {
        loop {
            if self.window_cursor < self.window_starts.len() {
                let start = self.window_starts[self.window_cursor];
                self.window_cursor += 1;
                self.windows_this_epoch += 1;
                let idx = self.shard_order[self.shard_cursor - 1];
                let shard = &self.dataset.shards()[idx];
                let end = start + mtp::window_len(self.seq_len, self.n_future);
                let tokens = shard.tokens(start, end);
                return mtp::window_from_stream(&tokens, 0, self.seq_len, self.n_future);
            }
            if !self.advance_shard() {
                ensure!(
                    self.windows_this_epoch > 0,
                    "no shard holds more than seq_len ({}) tokens",
                    self.seq_len
                );
                self.epoch += 1;
                debug!(epoch = self.epoch, "starting new epoch");
                self.start_epoch();
            }
        }
    }

    /// The next `(batch_size, seq_len + n_future)` window, split into inputs and targets.
    pub fn next_batch(&mut self) -> Result<MtpBatch> {
        let width = mtp::window_len(self.seq_len, self.n_future);
        let mut flat = Vec::with_capacity(self.batch_size * width);
        for _ in 0..self.batch_size {
            flat.extend(self.next_window()?);
        }
        let window = Tensor::from_vec(flat, (self.batch_size, width), &self.device)?;
        mtp::split_window(&window, self.n_future)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mtp::IGNORE_INDEX;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn write_test_shard(dir: &Path, name: &str, tokens: &[u16]) {
        write_shard(&dir.join(name), tokens).unwrap();
    }

    #[test]
    fn mapped_shard_decodes_little_endian() {
        let dir = tempdir().unwrap();
        write_test_shard(dir.path(), "data00.bin", &[1, 258, 65535]);
        let shard = Shard::open(&dir.path().join("data00.bin")).unwrap();
        assert_eq!(shard.len(), 3);
        assert_eq!(shard.tokens(0, 10), vec![1, 258, 65535]);
        assert_eq!(shard.tokens(2, 3), vec![65535]);
        assert!(shard.tokens(3, 5).is_empty());
    }

    #[test]
    fn odd_length_shard_is_rejected() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("data00.bin"), [1u8, 2, 3]).unwrap();
        assert!(Shard::open(&dir.path().join("data00.bin")).is_err());
    }

    #[test]
    fn first_shard_is_validation() {
        let dir = tempdir().unwrap();
        write_test_shard(dir.path(), "data01.bin", &[5; 10]);
        write_test_shard(dir.path(), "data00.bin", &[7; 4]);
        write_test_shard(dir.path(), "data02.bin", &[9; 6]);
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let val = PretokDataset::open(dir.path(), Split::Val).unwrap();
        let train = PretokDataset::open(dir.path(), Split::Train).unwrap();
        assert_eq!(val.num_tokens(), 4);
        assert_eq!(train.num_tokens(), 16);
    }

    #[test]
    fn single_shard_leaves_train_empty() {
        let dir = tempdir().unwrap();
        write_test_shard(dir.path(), "data00.bin", &[1; 8]);
        assert!(PretokDataset::open(dir.path(), Split::Train).is_err());
        assert!(PretokDataset::open(dir.path(), Split::Val).is_ok());
    }

    #[test]
    fn batches_hold_contiguous_windows() {
        let tokens: Vec<u16> = (0..41).collect();
        let dataset = Arc::new(PretokDataset::from_shards(vec![Shard::from_tokens("a", tokens)]));
        let mut iter = BatchIter::new(dataset, 2, 4, 3, Device::Cpu, 7).unwrap();

        // (41 - 1) / 4 = 10 windows per epoch
        for _ in 0..12 {
            let batch = iter.next_batch().unwrap();
            let inputs = batch.inputs.to_vec2::<u32>().unwrap();
            assert_eq!(batch.targets.len(), 3);
            for (row, input) in inputs.iter().enumerate() {
                let start = input[0] as i64;
                assert_eq!(start % 4, 0);
                for (k, head) in batch.targets.iter().enumerate() {
                    let row_targets = &head.to_vec2::<i64>().unwrap()[row];
                    for (t, &target) in row_targets.iter().enumerate() {
                        let expected = start + (t + k + 1) as i64;
                        let expected = if expected > 40 { IGNORE_INDEX } else { expected };
                        assert_eq!(target, expected);
                    }
                }
            }
        }
        assert!(iter.epoch() >= 2);
    }

    #[test]
    fn every_window_is_visited_once_per_epoch() {
        let tokens: Vec<u16> = (0..25).collect();
        let dataset = Arc::new(PretokDataset::from_shards(vec![Shard::from_tokens("a", tokens)]));
        let mut iter = BatchIter::new(dataset, 1, 4, 1, Device::Cpu, 0).unwrap();

        let mut starts: Vec<u32> = (0..6)
            .map(|_| iter.next_batch().unwrap().inputs.to_vec2::<u32>().unwrap()[0][0])
            .collect();
        starts.sort();
        assert_eq!(starts, vec![0, 4, 8, 12, 16, 20]);
    }

    #[test]
    fn too_short_dataset_is_an_error() {
        let dataset = Arc::new(PretokDataset::from_shards(vec![Shard::from_tokens(
            "a",
            vec![1, 2, 3],
        )]));
        let mut iter = BatchIter::new(dataset, 1, 4, 2, Device::Cpu, 0).unwrap();
        assert!(iter.next_batch().is_err());
    }

    #[test]
    fn same_seed_same_batches() {
        let tokens: Vec<u16> = (0..200).collect();
        let dataset = Arc::new(PretokDataset::from_shards(vec![
            Shard::from_tokens("a", tokens.clone()),
            Shard::from_tokens("b", tokens),
        ]));
        let mut a = BatchIter::new(dataset.clone(), 3, 8, 2, Device::Cpu, 42).unwrap();
        let mut b = BatchIter::new(dataset, 3, 8, 2, Device::Cpu, 42).unwrap();
        for _ in 0..5 {
            let xa = a.next_batch().unwrap().inputs.to_vec2::<u32>().unwrap();
            let xb = b.next_batch().unwrap().inputs.to_vec2::<u32>().unwrap();
            assert_eq!(xa, xb);
        }
    }
}
