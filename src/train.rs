//! Training: progressive schedule, optimizer, checkpoints and the loop that
//! ties them together.
//!
//! - [`schedule`] — schedule entry selection and [`TrainingSession`]
//! - [`optim`] — Adam with persisted moments
//! - [`unit`] — [`TrainableUnit`], the only path that mutates parameters
//! - [`checkpoint`] — safetensors checkpoint files
//! - [`eval`] — evaluation exports
//! - [`trainer`] — the training loop

pub mod checkpoint;
pub mod eval;
pub mod optim;
pub mod schedule;
pub mod trainer;
pub mod unit;

pub use checkpoint::{CheckpointMeta, Restore, load_checkpoint, read_checkpoint, save_checkpoint};
pub use schedule::{TrainingSession, select_schedule_entry};
pub use trainer::{RunPaths, TrainOutcome, Trainer, TrainerOptions, ValueWindow};
pub use unit::{StepReport, TrainableUnit};
