//! Progressive training schedule.

use crate::config::ScheduleEntry;

/// First schedule entry whose `max_step` lies beyond `step`, with its index.
///
/// `None` once every entry is exhausted, which ends training.
pub fn select_schedule_entry(
    step: u64,
    schedule: &[ScheduleEntry],
) -> Option<(usize, &ScheduleEntry)> {
    schedule.iter().enumerate().find(|(_, entry)| entry.max_step > step)
}

/// One contiguous stretch of training under a single schedule entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingSession {
    pub index: usize,
    pub entry: ScheduleEntry,
    /// Global step when the session began.
    pub start_step: u64,
}

impl TrainingSession {
    /// Session active at `step`, if any.
    pub fn at(step: u64, schedule: &[ScheduleEntry]) -> Option<Self> {
        select_schedule_entry(step, schedule).map(|(index, entry)| Self {
            index,
            entry: *entry,
            start_step: step,
        })
    }

    /// Steps left before the session hands over to the next entry.
    pub fn remaining_steps(&self) -> u64 {
        self.entry.max_step.saturating_sub(self.start_step)
    }

    pub fn is_finished(&self, step: u64) -> bool {
        step >= self.entry.max_step
    }
}
