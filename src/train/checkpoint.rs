//! Versioned training snapshots.
//!
//! One safetensors file per snapshot, `ckpt-<step>.safetensors`:
//!
//! - `model.<var>` — every learnable parameter (and batch-norm statistics)
//! - `adam.m.<var>`, `adam.v.<var>` — optimizer moments
//! - `meta.version`, `meta.step`, `meta.optimizer_step`, `meta.batches`: scalar metadata
//!
//! Files are written to a hidden temp name and renamed into place, so a crash
//! mid-write leaves the previous snapshots intact.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;

use super::optim::Adam;
use crate::{Error, Result};

/// Bumped whenever the snapshot layout changes.
pub const FORMAT_VERSION: i64 = 2;

const PREFIX: &str = "ckpt-";
const SUFFIX: &str = ".safetensors";

/// A snapshot read back from disk.
#[derive(Debug)]
pub struct Checkpoint {
    pub path: PathBuf,
    pub step: usize,
    pub optimizer_step: usize,
    /// Batches consumed, skipped ones included.
    pub batches: usize,
    params: HashMap<String, Tensor>,
    optimizer: HashMap<String, Tensor>,
}

impl Checkpoint {
    /// Read a snapshot. Missing, unreadable and version-mismatched files are
    /// all [`Error::Checkpoint`].
    pub fn load(path: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::Checkpoint(format!("{} does not exist", path.display())));
        }
        let tensors = candle_core::safetensors::load(path, device)
            .map_err(|e| Error::Checkpoint(format!("{} is corrupt: {e}", path.display())))?;

        let version = meta_value(&tensors, "meta.version", path)?;
        if version != FORMAT_VERSION {
            return Err(Error::Checkpoint(format!(
                "{}: format version {version}, expected {FORMAT_VERSION}",
                path.display()
            )));
        }
        let step = meta_value(&tensors, "meta.step", path)? as usize;
        let optimizer_step = meta_value(&tensors, "meta.optimizer_step", path)? as usize;
        let batches = meta_value(&tensors, "meta.batches", path)? as usize;

        let mut params = HashMap::new();
        let mut optimizer = HashMap::new();
        for (name, tensor) in tensors {
            if let Some(var) = name.strip_prefix("model.") {
                params.insert(var.to_string(), tensor);
            } else if name.starts_with("adam.") {
                optimizer.insert(name, tensor);
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            step,
            optimizer_step,
            batches,
            params,
            optimizer,
        })
    }

    /// Copy the saved parameters into every variable of `varmap`.
    ///
    /// Fails if a variable is missing from the snapshot or has another shape.
    pub fn restore_params(&self, varmap: &VarMap) -> Result<()> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| Error::Checkpoint("variable map lock poisoned".into()))?;
        for (name, var) in data.iter() {
            let saved = self.params.get(name).ok_or_else(|| {
                Error::Checkpoint(format!("{}: no parameter '{name}'", self.path.display()))
            })?;
            if saved.dims() != var.dims() {
                return Err(Error::Checkpoint(format!(
                    "{}: parameter '{name}' has shape {:?}, model expects {:?}",
                    self.path.display(),
                    saved.dims(),
                    var.dims()
                )));
            }
            var.set(&saved.to_dtype(var.dtype())?.to_device(var.device())?)?;
        }
        Ok(())
    }

    /// Restore optimizer moments and its update counter.
    pub fn restore_optimizer(&self, optimizer: &mut Adam) -> Result<()> {
        optimizer.load_state(&self.optimizer, self.optimizer_step)
    }

    pub fn num_params(&self) -> usize {
        self.params.len()
    }
}

fn meta_value(tensors: &HashMap<String, Tensor>, key: &str, path: &Path) -> Result<i64> {
    let tensor = tensors
        .get(key)
        .ok_or_else(|| Error::Checkpoint(format!("{}: missing '{key}'", path.display())))?;
    let values = tensor.to_dtype(DType::I64)?.flatten_all()?.to_vec1::<i64>()?;
    values
        .first()
        .copied()
        .ok_or_else(|| Error::Checkpoint(format!("{}: empty '{key}'", path.display())))
}

/// Writes snapshots into one directory and keeps the newest `keep`.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    keep: usize,
}

impl CheckpointManager {
    pub fn new(dir: impl AsRef<Path>, keep: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            keep: keep.max(1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, step: usize) -> PathBuf {
        self.dir.join(format!("{PREFIX}{step}{SUFFIX}"))
    }

    /// Existing snapshots as `(step, path)`, oldest first.
    pub fn list(&self) -> Result<Vec<(usize, PathBuf)>> {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(step) = name
                .strip_prefix(PREFIX)
                .and_then(|rest| rest.strip_suffix(SUFFIX))
                .and_then(|step| step.parse::<usize>().ok())
            {
                found.push((step, path));
            }
        }
        found.sort_by_key(|(step, _)| *step);
        Ok(found)
    }

    pub fn latest(&self) -> Result<Option<PathBuf>> {
        Ok(self.list()?.pop().map(|(_, path)| path))
    }

    /// Remove snapshots newer than `step`. A run starting at `step` makes
    /// them stale, and retention would otherwise prune the run's own files.
    pub fn discard_after(&self, step: usize) -> Result<Vec<usize>> {
        let mut removed = Vec::new();
        for (saved, path) in self.list()? {
            if saved > step {
                std::fs::remove_file(&path)?;
                removed.push(saved);
            }
        }
        Ok(removed)
    }

    /// Atomically write a snapshot for `step`, then drop the oldest ones
    /// beyond `keep`. Non-finite parameters are refused.
    pub fn save(
        &self,
        step: usize,
        batches: usize,
        varmap: &VarMap,
        optimizer: &Adam,
    ) -> Result<PathBuf> {
        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        {
            let data = varmap
                .data()
                .lock()
                .map_err(|_| Error::Checkpoint("variable map lock poisoned".into()))?;
            for (name, var) in data.iter() {
                let total = var
                    .as_tensor()
                    .to_dtype(DType::F32)?
                    .abs()?
                    .sum_all()?
                    .to_scalar::<f32>()?;
                if !total.is_finite() {
                    return Err(Error::NonFinite {
                        step,
                        what: "parameters",
                    });
                }
                tensors.insert(format!("model.{name}"), var.as_tensor().clone());
            }
        }
        tensors.extend(optimizer.state_tensors());

        let cpu = Device::Cpu;
        tensors.insert("meta.version".into(), Tensor::new(&[FORMAT_VERSION], &cpu)?);
        tensors.insert("meta.step".into(), Tensor::new(&[step as i64], &cpu)?);
        tensors.insert(
            "meta.optimizer_step".into(),
            Tensor::new(&[optimizer.step_count() as i64], &cpu)?,
        );
        tensors.insert("meta.batches".into(), Tensor::new(&[batches as i64], &cpu)?);

        let path = self.path_for(step);
        let tmp = self.dir.join(format!(".{PREFIX}{step}{SUFFIX}.tmp"));
        candle_core::safetensors::save(&tensors, &tmp)?;
        std::fs::rename(&tmp, &path)?;
        tracing::info!(step, path = %path.display(), "saved checkpoint");

        self.prune(&path)?;
        Ok(path)
    }

    /// Drop the oldest snapshots beyond `keep`, never `just_written`.
    fn prune(&self, just_written: &Path) -> Result<()> {
        let older: Vec<(usize, PathBuf)> = self
            .list()?
            .into_iter()
            .filter(|(_, path)| path != just_written)
            .collect();
        let excess = (older.len() + 1).saturating_sub(self.keep);
        for (step, path) in older.into_iter().take(excess) {
            std::fs::remove_file(&path)?;
            tracing::debug!(step, "removed old checkpoint");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::train::optim::AdamConfig;
    use candle_nn::{Init, Optimizer};

    fn varmap_with(value: f32) -> VarMap {
        let varmap = VarMap::new();
        varmap
            .get((2, 3), "layer.weight", Init::Const(value as f64), DType::F32, &Device::Cpu)
            .unwrap();
        varmap
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), 3).unwrap();

        let varmap = varmap_with(0.5);
        let mut opt = Adam::from_varmap(&varmap, AdamConfig::default()).unwrap();
        let var = varmap.all_vars().remove(0);
        let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
        opt.backward_step(&loss).unwrap();

        let path = manager.save(7, 9, &varmap, &opt).unwrap();
        assert_eq!(path, manager.path_for(7));

        let ckpt = Checkpoint::load(&path, &Device::Cpu).unwrap();
        assert_eq!(ckpt.step, 7);
        assert_eq!(ckpt.optimizer_step, 1);
        assert_eq!(ckpt.batches, 9);

        let fresh = varmap_with(0.0);
        ckpt.restore_params(&fresh).unwrap();
        let a: Vec<Vec<f32>> = varmap.all_vars()[0].as_tensor().to_vec2().unwrap();
        let b: Vec<Vec<f32>> = fresh.all_vars()[0].as_tensor().to_vec2().unwrap();
        assert_eq!(a, b);

        let mut fresh_opt = Adam::from_varmap(&fresh, AdamConfig::default()).unwrap();
        ckpt.restore_optimizer(&mut fresh_opt).unwrap();
        assert_eq!(fresh_opt.step_count(), 1);
    }

    #[test]
    fn test_keeps_newest_n() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), 2).unwrap();
        let varmap = varmap_with(1.0);
        let opt = Adam::from_varmap(&varmap, AdamConfig::default()).unwrap();
        for step in [100, 200, 300, 400] {
            manager.save(step, step, &varmap, &opt).unwrap();
        }
        let steps: Vec<usize> = manager.list().unwrap().into_iter().map(|(s, _)| s).collect();
        assert_eq!(steps, vec![300, 400]);
        assert_eq!(manager.latest().unwrap(), Some(manager.path_for(400)));
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_save_never_prunes_its_own_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), 2).unwrap();
        let varmap = varmap_with(1.0);
        let opt = Adam::from_varmap(&varmap, AdamConfig::default()).unwrap();
        for step in [500, 600] {
            manager.save(step, step, &varmap, &opt).unwrap();
        }
        let path = manager.save(2, 2, &varmap, &opt).unwrap();
        assert!(path.is_file());
        let steps: Vec<usize> = manager.list().unwrap().into_iter().map(|(s, _)| s).collect();
        assert_eq!(steps, vec![2, 600]);
    }

    #[test]
    fn test_discard_after() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), 5).unwrap();
        let varmap = varmap_with(1.0);
        let opt = Adam::from_varmap(&varmap, AdamConfig::default()).unwrap();
        for step in [10, 20, 30] {
            manager.save(step, step, &varmap, &opt).unwrap();
        }
        assert_eq!(manager.discard_after(20).unwrap(), vec![30]);
        assert_eq!(manager.latest().unwrap(), Some(manager.path_for(20)));
        assert_eq!(manager.discard_after(0).unwrap(), vec![10, 20]);
        assert!(manager.list().unwrap().is_empty());
    }

    #[test]
    fn test_missing_and_corrupt_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = Checkpoint::load(dir.path().join("ckpt-1.safetensors"), &Device::Cpu);
        assert!(matches!(missing, Err(Error::Checkpoint(_))));

        let corrupt = dir.path().join("ckpt-2.safetensors");
        std::fs::write(&corrupt, b"definitely not safetensors").unwrap();
        assert!(matches!(
            Checkpoint::load(&corrupt, &Device::Cpu),
            Err(Error::Checkpoint(_))
        ));
    }

    #[test]
    fn test_non_finite_parameters_are_not_saved() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), 2).unwrap();
        let varmap = varmap_with(f32::NAN);
        let opt = Adam::from_varmap(&varmap, AdamConfig::default()).unwrap();
        assert!(matches!(
            manager.save(1, 1, &varmap, &opt),
            Err(Error::NonFinite { .. })
        ));
        assert!(manager.list().unwrap().is_empty());
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), 2).unwrap();
        let varmap = varmap_with(1.0);
        let opt = Adam::from_varmap(&varmap, AdamConfig::default()).unwrap();
        let path = manager.save(1, 1, &varmap, &opt).unwrap();

        let other = VarMap::new();
        other
            .get((4, 4), "layer.weight", Init::Const(0.0), DType::F32, &Device::Cpu)
            .unwrap();
        let ckpt = Checkpoint::load(&path, &Device::Cpu).unwrap();
        assert!(matches!(ckpt.restore_params(&other), Err(Error::Checkpoint(_))));
    }
}
