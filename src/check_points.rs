use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::TrainConfig;
use crate::model::ModelArgs;

const MODEL_PREFIX: &str = "model_";
const MODEL_SUFFIX: &str = ".safetensors";

/// Everything besides the weights needed to resume a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub model_args: ModelArgs,
    pub iter_num: usize,
    pub best_val_loss: f32,
    pub config: TrainConfig,
}

impl CheckpointMeta {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read checkpoint meta {}", path.display()))?;
        let meta: Self = serde_json::from_str(&content)?;
        Ok(meta)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointFiles {
    pub meta: PathBuf,
    pub model: PathBuf,
}

impl CheckpointFiles {
    pub fn for_step(dir: &Path, step: u64) -> Self {
        Self {
            meta: dir.join(format!("meta_{step:06}.json")),
            model: dir.join(format!("{MODEL_PREFIX}{step:06}{MODEL_SUFFIX}")),
        }
    }

    /// Files of the highest step in `dir`, if any.
    pub fn latest(dir: &Path) -> Option<Self> {
        find_last_step(dir).map(|step| Self::for_step(dir, step))
    }
}

fn extract_step_from_filename(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix(MODEL_PREFIX)?
        .strip_suffix(MODEL_SUFFIX)?
        .parse::<u64>()
        .ok()
}

/// Find the highest step number among files named like `model_<step>.safetensors` in
/// `checkpoint_dir` whose `meta_<step>.json` also exists.
pub fn find_last_step<P: AsRef<Path>>(checkpoint_dir: P) -> Option<u64> {
    let dir = checkpoint_dir.as_ref();
    let entries = fs::read_dir(dir).ok()?;

    let mut last_step: Option<u64> = None;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Some(step) = extract_step_from_filename(&name) else {
            continue;
        };
        if !CheckpointFiles::for_step(dir, step).meta.is_file() {
            warn!(file = %name, "ignoring checkpoint weights without a meta file");
            continue;
        }
        last_step = Some(last_step.map_or(step, |curr| curr.max(step)));
    }
    last_step
}

/// Writes the weights and the meta file for `meta.iter_num` into `dir`.
pub fn save_checkpoint(
    dir: &Path,
    varmap: &VarMap,
    meta: &CheckpointMeta,
) -> Result<CheckpointFiles> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create checkpoint directory {}", dir.display()))?;
    let files = CheckpointFiles::for_step(dir, meta.iter_num as u64);
    // weights land last; they mark the step complete
    fs::write(&files.meta, serde_json::to_string_pretty(meta)?)
        .with_context(|| format!("failed to write {}", files.meta.display()))?;
    let partial = files.model.with_extension("safetensors.partial");
    varmap
        .save(&partial)
        .with_context(|| format!("failed to write {}", partial.display()))?;
    fs::rename(&partial, &files.model)
        .with_context(|| format!("failed to move {} into place", files.model.display()))?;
    info!(path = %files.model.display(), iter = meta.iter_num, "saved checkpoint");
    Ok(files)
}

/// Loads the latest checkpoint's weights into `varmap` and returns its meta.
///
/// `varmap` must already hold every variable of the checkpointed model.
pub fn load_latest(dir: &Path, varmap: &mut VarMap) -> Result<CheckpointMeta> {
    let files = CheckpointFiles::latest(dir)
        .with_context(|| format!("no checkpoint found in {}", dir.display()))?;
    let meta = CheckpointMeta::from_file(&files.meta)?;
    varmap
        .load(&files.model)
        .with_context(|| format!("failed to load {}", files.model.display()))?;
    info!(path = %files.model.display(), iter = meta.iter_num, "loaded checkpoint");
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::Init;
    use tempfile::tempdir;

    #[test]
    fn parses_step_from_model_file_names() {
        assert_eq!(extract_step_from_filename("model_000120.safetensors"), Some(120));
        assert_eq!(extract_step_from_filename("model_000120.pt"), None);
        assert_eq!(extract_step_from_filename("meta_000120.json"), None);
        assert_eq!(extract_step_from_filename("model_x.safetensors"), None);
    }

    #[test]
    fn finds_highest_step() {
        let dir = tempdir().unwrap();
        for name in [
            "model_000002.safetensors",
            "meta_000002.json",
            "model_000010.safetensors",
            "meta_000010.json",
            "meta_000099.json",
        ] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        assert_eq!(find_last_step(dir.path()), Some(10));
        assert_eq!(
            CheckpointFiles::latest(dir.path()).unwrap().meta,
            dir.path().join("meta_000010.json")
        );
    }

    fn tiny_meta(iter_num: usize) -> CheckpointMeta {
        CheckpointMeta {
            model_args: ModelArgs::default(),
            iter_num,
            best_val_loss: 3.0,
            config: TrainConfig::default(),
        }
    }

    #[test]
    fn weights_without_meta_are_skipped() {
        let dir = tempdir().unwrap();
        let varmap = VarMap::new();
        varmap
            .get((2, 3), "w", Init::Const(0.5), DType::F32, &Device::Cpu)
            .unwrap();
        let saved = save_checkpoint(dir.path(), &varmap, &tiny_meta(2)).unwrap();
        assert!(saved.meta.is_file() && saved.model.is_file());
        assert!(!dir.path().join("model_000002.safetensors.partial").exists());

        // a later step whose meta never got written
        fs::copy(&saved.model, dir.path().join("model_000003.safetensors")).unwrap();
        assert_eq!(find_last_step(dir.path()), Some(2));

        let mut reloaded = VarMap::new();
        reloaded
            .get((2, 3), "w", Init::Const(0.0), DType::F32, &Device::Cpu)
            .unwrap();
        let meta = load_latest(dir.path(), &mut reloaded).unwrap();
        assert_eq!(meta, tiny_meta(2));
        let w = reloaded.all_vars()[0].flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(w, vec![0.5; 6]);
    }

    #[test]
    fn missing_directory_has_no_step() {
        assert_eq!(find_last_step("/definitely/not/here"), None);
    }
}
