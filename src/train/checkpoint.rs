//! Checkpoint files.
//!
//! One safetensors file holds everything needed to resume:
//!
//! ```text
//! <param name>            model parameters, VarMap names
//! __optim__.m.<name>      Adam first moment
//! __optim__.v.<name>      Adam second moment
//! __optim__.t             Adam step count        [1] i64
//! __meta__.step           global training step   [1] i64
//! __meta__.r              reduction factor       [1] i64
//! __meta__.epoch          completed epochs       [1] i64
//! ```
//!
//! Files are written to a sibling temporary path and renamed into place, so
//! an interrupted save never leaves a truncated checkpoint behind.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};

use super::optim::{AdamState, named_vars};
use super::unit::TrainableUnit;
use crate::{Error, Result};

const OPTIM_M: &str = "__optim__.m.";
const OPTIM_V: &str = "__optim__.v.";
const OPTIM_T: &str = "__optim__.t";
const META_STEP: &str = "__meta__.step";
const META_R: &str = "__meta__.r";
const META_EPOCH: &str = "__meta__.epoch";

/// Scalars stored alongside the tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointMeta {
    pub step: u64,
    pub r: usize,
    pub epoch: u64,
}

/// How training state was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Restore {
    /// Fresh initialisation (forced restart or no checkpoint yet).
    Fresh,
    Resumed(CheckpointMeta),
}

/// Latest checkpoint path: `<models_dir>/<run_id>/<run_id>.safetensors`.
pub fn latest_path(models_dir: &Path, run_id: &str) -> PathBuf {
    models_dir.join(run_id).join(format!("{run_id}.safetensors"))
}

/// Backup path for `step`: `<models_dir>/<run_id>/<run_id>_<step>.safetensors`.
pub fn backup_path(models_dir: &Path, run_id: &str, step: u64) -> PathBuf {
    models_dir.join(run_id).join(format!("{run_id}_{step}.safetensors"))
}

/// Write a backup checkpoint. Backups are never overwritten: if `path`
/// already exists it is left alone and `false` is returned.
pub fn save_backup(path: &Path, unit: &TrainableUnit, r: usize, epoch: u64) -> Result<bool> {
    if path.exists() {
        tracing::warn!(path = %path.display(), "backup already exists, not overwriting");
        return Ok(false);
    }
    save_checkpoint(path, unit, r, epoch)?;
    Ok(true)
}

/// Write parameters, optimizer state, step, `r` and epoch count to `path`.
pub fn save_checkpoint(path: &Path, unit: &TrainableUnit, r: usize, epoch: u64) -> Result<()> {
    let mut tensors: HashMap<String, Tensor> = HashMap::new();
    for (name, var) in named_vars(unit.varmap())? {
        tensors.insert(name, var.as_tensor().to_device(&Device::Cpu)?);
    }
    let AdamState { t, moments } = unit.optimizer().state();
    for (name, m, v) in moments {
        tensors.insert(format!("{OPTIM_M}{name}"), m.to_device(&Device::Cpu)?);
        tensors.insert(format!("{OPTIM_V}{name}"), v.to_device(&Device::Cpu)?);
    }
    tensors.insert(OPTIM_T.to_string(), scalar(t as i64)?);
    tensors.insert(META_STEP.to_string(), scalar(unit.step() as i64)?);
    tensors.insert(META_R.to_string(), scalar(r as i64)?);
    tensors.insert(META_EPOCH.to_string(), scalar(epoch as i64)?);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("safetensors.tmp");
    candle_core::safetensors::save(&tensors, &tmp)
        .map_err(|e| Error::Checkpoint(format!("writing {}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, path)?;
    tracing::debug!(path = %path.display(), step = unit.step(), r, epoch, "checkpoint saved");
    Ok(())
}

/// Read every tensor plus the metadata scalars. Any decoding failure is a
/// [`Error::Checkpoint`].
pub fn read_checkpoint(
    path: &Path,
    device: &Device,
) -> Result<(HashMap<String, Tensor>, CheckpointMeta)> {
    let tensors = candle_core::safetensors::load(path, device)
        .map_err(|e| Error::Checkpoint(format!("{}: {e}", path.display())))?;
    let meta = CheckpointMeta {
        step: read_scalar(&tensors, META_STEP, path)? as u64,
        r: read_scalar(&tensors, META_R, path)? as usize,
        epoch: read_scalar(&tensors, META_EPOCH, path)? as u64,
    };
    Ok((tensors, meta))
}

/// Parameter tensors only (no optimizer or metadata entries).
pub fn parameter_tensors(tensors: HashMap<String, Tensor>) -> HashMap<String, Tensor> {
    tensors
        .into_iter()
        .filter(|(name, _)| !name.starts_with("__"))
        .collect()
}

/// Load a checkpoint into `unit`: parameters, optimizer state and step.
pub fn load_checkpoint(path: &Path, unit: &mut TrainableUnit) -> Result<CheckpointMeta> {
    let device = named_vars(unit.varmap())?
        .first()
        .map(|(_, v)| v.device().clone())
        .unwrap_or(Device::Cpu);
    let (tensors, meta) = read_checkpoint(path, &device)?;

    let mut moments = Vec::new();
    for (name, var) in named_vars(unit.varmap())? {
        let value = tensors.get(&name).ok_or_else(|| {
            Error::Checkpoint(format!("{}: missing parameter {name}", path.display()))
        })?;
        if value.shape() != var.shape() {
            return Err(Error::Checkpoint(format!(
                "{}: parameter {name} has shape {:?}, model expects {:?}",
                path.display(),
                value.shape(),
                var.shape()
            )));
        }
        var.set(&value.to_dtype(var.dtype())?)?;

        let m = tensors.get(&format!("{OPTIM_M}{name}"));
        let v = tensors.get(&format!("{OPTIM_V}{name}"));
        if let (Some(m), Some(v)) = (m, v) {
            moments.push((name, m.clone(), v.clone()));
        }
    }
    let t = read_scalar(&tensors, OPTIM_T, path)? as u64;
    unit.optimizer_mut().load_state(AdamState { t, moments })?;
    unit.set_step(meta.step);
    Ok(meta)
}

/// Resume from `path` unless `force_restart` is set or the file is missing,
/// in which case the fresh parameters are written out as the first checkpoint.
/// A file that exists but cannot be decoded is an error.
pub fn restore_or_init(
    path: &Path,
    force_restart: bool,
    unit: &mut TrainableUnit,
    r: usize,
) -> Result<Restore> {
    if force_restart {
        tracing::info!(path = %path.display(), "forced restart, training from scratch");
    } else if path.exists() {
        let meta = load_checkpoint(path, unit)?;
        tracing::info!(
            path = %path.display(),
            step = meta.step,
            r = meta.r,
            epoch = meta.epoch,
            "resumed from checkpoint"
        );
        return Ok(Restore::Resumed(meta));
    } else {
        tracing::warn!(path = %path.display(), "no checkpoint found, training from scratch");
    }
    save_checkpoint(path, unit, r, 0)?;
    Ok(Restore::Fresh)
}

fn scalar(value: i64) -> Result<Tensor> {
    Ok(Tensor::new(&[value], &Device::Cpu)?)
}

fn read_scalar(tensors: &HashMap<String, Tensor>, key: &str, path: &Path) -> Result<i64> {
    let tensor = tensors
        .get(key)
        .ok_or_else(|| Error::Checkpoint(format!("{}: missing {key}", path.display())))?;
    let values = tensor
        .to_dtype(DType::I64)?
        .flatten_all()?
        .to_vec1::<i64>()?;
    match values.as_slice() {
        [value] if *value >= 0 => Ok(*value),
        _ => Err(Error::Checkpoint(format!(
            "{}: {key} is not a single non-negative integer",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tacotron::tests::tiny_config;
    use crate::model::{GenerateOptions, Tacotron};
    use crate::text::text_to_sequence;
    use candle_nn::{VarBuilder, VarMap};

    fn build() -> (Tacotron, TrainableUnit) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mut model = Tacotron::new(&tiny_config(), vb).unwrap();
        model.set_reduction_factor(2).unwrap();
        (model, TrainableUnit::new(varmap, 1e-3).unwrap())
    }

    fn generate(model: &Tacotron) -> Vec<f32> {
        let ids = text_to_sequence("round trip", &["english_cleaners".to_string()]).unwrap();
        let tokens = Tensor::new(ids.as_slice(), &Device::Cpu).unwrap().unsqueeze(0).unwrap();
        let speaker = Tensor::full(0.1f32, (1, 256), &Device::Cpu).unwrap();
        let options = GenerateOptions {
            stop_threshold: -3.4,
            max_frames: 24,
            min_frames_before_stop: 10,
            prenet_dropout: false,
        };
        model
            .generate(&tokens, &speaker, &options)
            .unwrap()
            .refined
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
    }

    fn train_one_step(model: &Tacotron, unit: &mut TrainableUnit) {
        let tokens = Tensor::new(&[[5u32, 6, 7, 1]], &Device::Cpu).unwrap();
        let targets = Tensor::randn(0f32, 1.0, (1, 80, 6), &Device::Cpu).unwrap();
        let speaker = Tensor::randn(0f32, 1.0, (1, 256), &Device::Cpu).unwrap();
        let out = model.forward(&tokens, &targets, &speaker, true).unwrap();
        let mask = crate::model::tacotron::frame_mask(&[5], 6, &Device::Cpu).unwrap();
        let loss = crate::model::tacotron::mel_loss(&out, &targets, &mask).unwrap();
        unit.apply_gradients(&loss, Some(1.0)).unwrap();
    }

    #[test]
    fn round_trip_restores_identical_generation_and_step() {
        let dir = tempfile::tempdir().unwrap();
        let path = latest_path(dir.path(), "run");

        let (model, mut unit) = build();
        train_one_step(&model, &mut unit);
        save_checkpoint(&path, &unit, 2, 3).unwrap();
        let expected = generate(&model);

        let (mut other, mut other_unit) = build();
        other.set_reduction_factor(7).unwrap();
        let meta = load_checkpoint(&path, &mut other_unit).unwrap();
        other.set_reduction_factor(meta.r).unwrap();

        assert_eq!(meta, CheckpointMeta { step: 1, r: 2, epoch: 3 });
        assert_eq!(other_unit.step(), unit.step());
        assert_eq!(other_unit.optimizer().state().t, 1);
        assert_eq!(generate(&other), expected);
    }

    #[test]
    fn missing_file_starts_fresh_and_writes_initial_weights() {
        let dir = tempfile::tempdir().unwrap();
        let path = latest_path(dir.path(), "run");
        let (_model, mut unit) = build();
        assert_eq!(restore_or_init(&path, false, &mut unit, 7).unwrap(), Restore::Fresh);
        assert!(path.exists());
        assert_eq!(unit.step(), 0);

        // A second start resumes from what was written.
        let (_model, mut unit) = build();
        assert_eq!(
            restore_or_init(&path, false, &mut unit, 7).unwrap(),
            Restore::Resumed(CheckpointMeta { step: 0, r: 7, epoch: 0 })
        );
    }

    #[test]
    fn forced_restart_ignores_existing_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = latest_path(dir.path(), "run");
        let (model, mut unit) = build();
        train_one_step(&model, &mut unit);
        save_checkpoint(&path, &unit, 2, 1).unwrap();

        let (_model, mut fresh) = build();
        assert_eq!(restore_or_init(&path, true, &mut fresh, 7).unwrap(), Restore::Fresh);
        assert_eq!(fresh.step(), 0);
    }

    #[test]
    fn corrupt_checkpoint_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = latest_path(dir.path(), "run");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"definitely not safetensors").unwrap();

        let (_model, mut unit) = build();
        let err = restore_or_init(&path, false, &mut unit, 7).unwrap_err();
        assert!(matches!(err, Error::Checkpoint(_)), "{err}");
    }

    #[test]
    fn backup_names_carry_the_exact_step() {
        let p = backup_path(Path::new("/m"), "run", 25_000);
        assert_eq!(p, Path::new("/m/run/run_25000.safetensors"));
        assert_ne!(
            backup_path(Path::new("/m"), "run", 4),
            backup_path(Path::new("/m"), "run", 8)
        );
    }

    #[test]
    fn existing_backup_is_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = backup_path(dir.path(), "run", 1);
        let (model, mut unit) = build();
        train_one_step(&model, &mut unit);
        assert!(save_backup(&path, &unit, 2, 0).unwrap());

        train_one_step(&model, &mut unit);
        assert!(!save_backup(&path, &unit, 2, 1).unwrap());
        let (_, meta) = read_checkpoint(&path, &Device::Cpu).unwrap();
        assert_eq!(meta, CheckpointMeta { step: 1, r: 2, epoch: 0 });
    }

    #[test]
    fn checkpoint_without_epoch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.safetensors");
        let mut tensors = HashMap::new();
        tensors.insert(META_STEP.to_string(), scalar(10).unwrap());
        tensors.insert(META_R.to_string(), scalar(2).unwrap());
        candle_core::safetensors::save(&tensors, &path).unwrap();
        let err = read_checkpoint(&path, &Device::Cpu).unwrap_err();
        assert!(matches!(err, Error::Checkpoint(ref msg) if msg.contains(META_EPOCH)), "{err}");
    }
}
