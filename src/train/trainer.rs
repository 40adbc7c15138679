//! Progressive-schedule training loop.
//!
//! ```text
//! for each schedule session still ahead of the step counter:
//!     set r, lr
//!     for each epoch (seeded shuffle):
//!         for each batch:
//!             forward (teacher forcing) → L1(coarse) + L1(refined)
//!             backward → clip → Adam → step += 1
//!             backup / latest checkpoint, eval export
//!         until the session threshold or the step budget is reached
//! ```

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};

use super::checkpoint::{
    Restore, backup_path, latest_path, restore_or_init, save_backup, save_checkpoint,
};
use super::eval::export_eval_sample;
use super::schedule::TrainingSession;
use super::unit::{StepReport, TrainableUnit};
use crate::audio::AudioProcessor;
use crate::config::HParams;
use crate::data::{Batch, SynthesizerDataset, collate};
use crate::model::tacotron::{TacotronOutput, frame_mask, mel_loss};
use crate::model::Tacotron;
use crate::text::write_symbol_table;
use crate::Result;

/// Command-line level options for one training run.
#[derive(Debug, Clone)]
pub struct TrainerOptions {
    pub run_id: String,
    pub syn_dir: PathBuf,
    pub models_dir: PathBuf,
    /// Latest-checkpoint cadence in steps; `0` disables.
    pub save_every: u64,
    /// Backup cadence in steps; `0` disables.
    pub backup_every: u64,
    pub force_restart: bool,
    /// Stop once the global step reaches this value.
    pub train_steps: Option<u64>,
}

/// Output directories of a run, all under `<models_dir>/<run_id>/`.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub root: PathBuf,
    pub checkpoint: PathBuf,
    pub plots: PathBuf,
    pub wavs: PathBuf,
    pub mel_spectrograms: PathBuf,
    pub metas: PathBuf,
}

impl RunPaths {
    /// Create the directory layout and the symbol listing used to label
    /// embedding visualisations.
    pub fn create(models_dir: &Path, run_id: &str) -> Result<Self> {
        let root = models_dir.join(run_id);
        let paths = Self {
            checkpoint: latest_path(models_dir, run_id),
            plots: root.join("plots"),
            wavs: root.join("wavs"),
            mel_spectrograms: root.join("mel-spectrograms"),
            metas: root.join("metas"),
            root,
        };
        for dir in [&paths.plots, &paths.wavs, &paths.mel_spectrograms, &paths.metas] {
            std::fs::create_dir_all(dir)?;
        }
        let symbols = paths.metas.join("CharacterEmbeddings.tsv");
        if !symbols.exists() {
            write_symbol_table(&symbols)?;
        }
        Ok(paths)
    }
}

/// Rolling mean over the last `size` values.
#[derive(Debug, Clone)]
pub struct ValueWindow {
    size: usize,
    values: VecDeque<f64>,
}

impl ValueWindow {
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            values: VecDeque::with_capacity(size.max(1)),
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.values.len() == self.size {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn average(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }
}

/// Why [`Trainer::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainOutcome {
    /// Every schedule entry is exhausted.
    Completed { step: u64 },
    /// The step budget was reached first.
    BudgetReached { step: u64 },
}

pub struct Trainer {
    hparams: HParams,
    options: TrainerOptions,
    device: Device,
    model: Tacotron,
    unit: TrainableUnit,
    dataset: SynthesizerDataset,
    audio: AudioProcessor,
    paths: RunPaths,
    epoch: u64,
    loss_window: ValueWindow,
    time_window: ValueWindow,
}

impl Trainer {
    /// Validate hyper-parameters, prepare the run directory, build the model
    /// and restore (or initialise) its checkpoint.
    pub fn new(hparams: HParams, options: TrainerOptions, device: Device) -> Result<Self> {
        hparams.validate()?;
        let paths = RunPaths::create(&options.models_dir, &options.run_id)?;
        tracing::info!(
            checkpoint = %paths.checkpoint.display(),
            data = %options.syn_dir.display(),
            device = ?device,
            "initialising synthesizer training"
        );

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut model = Tacotron::new(&hparams.tacotron, vb)?;
        let first = &hparams.training.schedule[0];
        model.set_reduction_factor(first.r)?;
        let mut unit = TrainableUnit::new(varmap, first.lr)?;

        let restored =
            restore_or_init(&paths.checkpoint, options.force_restart, &mut unit, first.r)?;
        let epoch = match restored {
            Restore::Resumed(meta) => {
                model.set_reduction_factor(meta.r)?;
                meta.epoch
            }
            Restore::Fresh => 0,
        };

        let dataset = SynthesizerDataset::open(
            &options.syn_dir,
            &hparams.tacotron.cleaner_names,
            hparams.training.max_mel_frames,
            hparams.tacotron.speaker_embedding_size,
        )?;
        let audio = AudioProcessor::new(hparams.audio.clone())?;

        Ok(Self {
            hparams,
            options,
            device,
            model,
            unit,
            dataset,
            audio,
            paths,
            epoch,
            loss_window: ValueWindow::new(100),
            time_window: ValueWindow::new(100),
        })
    }

    pub fn model(&self) -> &Tacotron {
        &self.model
    }

    pub fn unit(&self) -> &TrainableUnit {
        &self.unit
    }

    pub fn paths(&self) -> &RunPaths {
        &self.paths
    }

    pub fn step(&self) -> u64 {
        self.unit.step()
    }

    /// Epochs started so far, carried across resumes.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Train until the schedule is exhausted or the step budget is reached.
    /// The latest checkpoint is written before returning.
    pub fn run(&mut self) -> Result<TrainOutcome> {
        let outcome = loop {
            let step = self.unit.step();
            if self.budget_reached(step) {
                break TrainOutcome::BudgetReached { step };
            }
            let Some(session) = TrainingSession::at(step, &self.hparams.training.schedule) else {
                tracing::info!(step, "training schedule complete");
                break TrainOutcome::Completed { step };
            };
            self.model.set_reduction_factor(session.entry.r)?;
            self.unit.set_learning_rate(session.entry.lr);
            tracing::info!(
                session = session.index,
                steps = session.remaining_steps(),
                batch_size = session.entry.batch_size,
                lr = session.entry.lr,
                r = session.entry.r,
                "starting training session"
            );
            self.run_session(&session)?;
        };

        save_checkpoint(
            &self.paths.checkpoint,
            &self.unit,
            self.model.reduction_factor(),
            self.epoch,
        )?;
        Ok(outcome)
    }

    fn budget_reached(&self, step: u64) -> bool {
        self.options.train_steps.is_some_and(|budget| step >= budget)
    }

    /// Epochs until the session threshold (or budget) is crossed.
    fn run_session(&mut self, session: &TrainingSession) -> Result<()> {
        let batch_size = session.entry.batch_size;
        loop {
            let step = self.unit.step();
            if session.is_finished(step) || self.budget_reached(step) {
                return Ok(());
            }
            self.epoch += 1;
            let indices = self
                .dataset
                .shuffled_indices(self.hparams.training.seed, self.epoch);
            let mut last: Option<(Batch, TacotronOutput, f32)> = None;

            for chunk in indices.chunks(batch_size) {
                let step = self.unit.step();
                if session.is_finished(step) || self.budget_reached(step) {
                    return Ok(());
                }
                let samples = chunk
                    .iter()
                    .map(|&i| self.dataset.get(i))
                    .collect::<Result<Vec<_>>>()?;
                let batch = collate(
                    &samples,
                    self.model.reduction_factor(),
                    self.hparams.audio.mel_pad_value(),
                    &self.device,
                )?;
                let (output, loss, report) = self.train_step(&batch)?;
                self.after_step(&batch, &output, loss, report)?;
                last = Some((batch, output, loss));
            }

            if self.hparams.training.eval_interval == 0
                && let Some((batch, output, loss)) = &last
            {
                self.evaluate(batch, output, self.unit.step(), *loss);
            }
        }
    }

    /// One optimizer step on `batch`.
    fn train_step(&mut self, batch: &Batch) -> Result<(TacotronOutput, f32, StepReport)> {
        let start = Instant::now();
        let output = self
            .model
            .forward(&batch.tokens, &batch.mels, &batch.embeddings, true)?;
        let mask = frame_mask(&batch.mel_lengths, batch.mels.dim(2)?, &self.device)?;
        let loss = mel_loss(&output, &batch.mels, &mask)?;
        let loss_value = loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;
        let report = self
            .unit
            .apply_gradients(&loss, self.hparams.training.clip_grad_norm)?;

        self.loss_window.push(loss_value as f64);
        self.time_window.push(start.elapsed().as_secs_f64());
        Ok((output, loss_value, report))
    }

    fn after_step(
        &mut self,
        batch: &Batch,
        output: &TacotronOutput,
        loss: f32,
        report: StepReport,
    ) -> Result<()> {
        let step = report.step;
        let r = self.model.reduction_factor();
        let seconds = self.time_window.average();
        tracing::debug!(
            epoch = self.epoch,
            step,
            loss,
            avg_loss = self.loss_window.average(),
            grad_norm = report.grad_norm,
            steps_per_sec = if seconds > 0.0 { 1.0 / seconds } else { 0.0 },
            r,
            "train step"
        );
        if step % 100 == 0 {
            tracing::info!(
                epoch = self.epoch,
                step,
                avg_loss = self.loss_window.average(),
                sec_per_step = seconds,
                "training progress"
            );
        }

        let backup_every = self.options.backup_every;
        if backup_every != 0 && step % backup_every == 0 {
            let path = backup_path(&self.options.models_dir, &self.options.run_id, step);
            if save_backup(&path, &self.unit, r, self.epoch)? {
                tracing::info!(step, path = %path.display(), "backup checkpoint written");
            }
        }
        let save_every = self.options.save_every;
        if save_every != 0 && step % save_every == 0 {
            save_checkpoint(&self.paths.checkpoint, &self.unit, r, self.epoch)?;
        }

        let interval = self.hparams.training.eval_interval;
        if interval > 0 && step % interval as u64 == 0 {
            self.evaluate(batch, output, step, loss);
        }
        Ok(())
    }

    /// Best-effort export; failures are logged and training continues.
    fn evaluate(&self, batch: &Batch, output: &TacotronOutput, step: u64, loss: f32) {
        let count = self.hparams.training.eval_num_samples.min(batch.size());
        for index in 0..count {
            if let Err(error) =
                export_eval_sample(&self.paths, &self.audio, batch, output, index, step, loss)
            {
                tracing::warn!(%error, step, sample = index + 1, "evaluation export failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AudioConfig, ScheduleEntry, TrainingConfig};
    use crate::data::make_dataset;
    use crate::model::tacotron::tests::tiny_config;
    use crate::train::checkpoint::read_checkpoint;

    fn hparams(schedule: Vec<ScheduleEntry>, eval_interval: i64) -> HParams {
        HParams {
            audio: AudioConfig {
                griffin_lim_iters: 2,
                ..AudioConfig::default()
            },
            tacotron: tiny_config(),
            training: TrainingConfig {
                schedule,
                eval_interval,
                ..TrainingConfig::default()
            },
            ..HParams::default()
        }
    }

    fn options(root: &Path, train_steps: Option<u64>) -> TrainerOptions {
        TrainerOptions {
            run_id: "run".into(),
            syn_dir: root.join("syn"),
            models_dir: root.join("models"),
            save_every: 2,
            backup_every: 4,
            force_restart: false,
            train_steps,
        }
    }

    fn corpus(root: &Path) {
        let syn = root.join("syn");
        std::fs::create_dir_all(&syn).unwrap();
        make_dataset(
            &syn,
            &[("a", 6, "Hello."), ("b", 9, "Good day."), ("c", 5, "Hi there")],
            80,
        );
    }

    fn schedule() -> Vec<ScheduleEntry> {
        vec![ScheduleEntry::new(2, 1e-3, 3, 2), ScheduleEntry::new(3, 5e-4, 5, 1)]
    }

    #[test]
    fn runs_schedule_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        corpus(dir.path());
        let mut trainer =
            Trainer::new(hparams(schedule(), 2), options(dir.path(), None), Device::Cpu).unwrap();
        assert_eq!(trainer.run().unwrap(), TrainOutcome::Completed { step: 5 });
        assert_eq!(trainer.model().reduction_factor(), 3);

        let paths = trainer.paths();
        let (_, meta) = read_checkpoint(&paths.checkpoint, &Device::Cpu).unwrap();
        assert_eq!((meta.step, meta.r, meta.epoch), (5, 3, 3));
        let backup = paths.root.join("run_4.safetensors");
        let (_, backup) = read_checkpoint(&backup, &Device::Cpu).unwrap();
        assert_eq!((backup.step, backup.r), (4, 3));
        assert!(paths.metas.join("CharacterEmbeddings.tsv").exists());
        assert!(paths.wavs.join("step-2-wave-from-mel_sample_1.wav").exists());
        assert!(
            paths
                .mel_spectrograms
                .join("mel-prediction-step-4_sample_1.npy")
                .exists()
        );
    }

    #[test]
    fn resumes_after_step_budget() {
        let dir = tempfile::tempdir().unwrap();
        corpus(dir.path());

        let mut first =
            Trainer::new(hparams(schedule(), -1), options(dir.path(), Some(2)), Device::Cpu)
                .unwrap();
        assert_eq!(first.run().unwrap(), TrainOutcome::BudgetReached { step: 2 });

        assert_eq!(first.epoch(), 1);

        let mut second =
            Trainer::new(hparams(schedule(), -1), options(dir.path(), None), Device::Cpu).unwrap();
        assert_eq!(second.step(), 2);
        assert_eq!(second.epoch(), 1);
        assert_eq!(second.unit().optimizer().state().t, 2);
        assert_eq!(second.run().unwrap(), TrainOutcome::Completed { step: 5 });
        assert_eq!(second.epoch(), 3);
    }

    #[test]
    fn every_backup_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        corpus(dir.path());
        let mut opts = options(dir.path(), None);
        opts.backup_every = 2;
        let mut trainer = Trainer::new(hparams(schedule(), -1), opts, Device::Cpu).unwrap();
        trainer.run().unwrap();

        let root = &trainer.paths().root;
        for step in [2, 4] {
            let path = root.join(format!("run_{step}.safetensors"));
            let (_, meta) = read_checkpoint(&path, &Device::Cpu).unwrap();
            assert_eq!(meta.step, step);
        }
        assert!(!root.join("run_0k.safetensors").exists());
    }

    #[test]
    fn failed_eval_export_does_not_stop_training() {
        let dir = tempfile::tempdir().unwrap();
        corpus(dir.path());
        let mut trainer =
            Trainer::new(hparams(schedule(), 1), options(dir.path(), None), Device::Cpu).unwrap();
        // A plain file where the wav directory should be makes every export fail.
        let wavs = trainer.paths().wavs.clone();
        std::fs::remove_dir_all(&wavs).unwrap();
        std::fs::write(&wavs, b"not a directory").unwrap();

        assert_eq!(trainer.run().unwrap(), TrainOutcome::Completed { step: 5 });
        assert!(wavs.is_file());
    }

    #[test]
    fn zero_eval_interval_exports_at_epoch_end() {
        let dir = tempfile::tempdir().unwrap();
        corpus(dir.path());
        let mut trainer =
            Trainer::new(hparams(schedule(), 0), options(dir.path(), None), Device::Cpu).unwrap();
        trainer.run().unwrap();

        // Only the first epoch (steps 1 and 2) runs to completion.
        let wavs = &trainer.paths().wavs;
        assert!(wavs.join("step-2-wave-from-mel_sample_1.wav").exists());
        assert!(!wavs.join("step-1-wave-from-mel_sample_1.wav").exists());
        assert!(!wavs.join("step-5-wave-from-mel_sample_1.wav").exists());
    }

    #[test]
    fn force_restart_starts_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        corpus(dir.path());
        let mut first =
            Trainer::new(hparams(schedule(), -1), options(dir.path(), Some(2)), Device::Cpu)
                .unwrap();
        first.run().unwrap();

        let mut opts = options(dir.path(), None);
        opts.force_restart = true;
        let restarted = Trainer::new(hparams(schedule(), -1), opts, Device::Cpu).unwrap();
        assert_eq!(restarted.step(), 0);
    }

    #[test]
    fn batch_not_divisible_by_devices_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        corpus(dir.path());
        let mut hp = hparams(vec![ScheduleEntry::new(2, 1e-3, 3, 3)], -1);
        hp.training.num_devices = 2;
        let err = Trainer::new(hp, options(dir.path(), None), Device::Cpu)
            .err()
            .unwrap();
        assert!(matches!(err, crate::Error::Config(_)), "{err}");
        assert!(!dir.path().join("models").exists());
    }

    #[test]
    fn value_window_keeps_last_values() {
        let mut window = ValueWindow::new(2);
        assert_eq!(window.average(), 0.0);
        window.push(1.0);
        window.push(3.0);
        window.push(5.0);
        assert_eq!(window.average(), 4.0);
    }
}
