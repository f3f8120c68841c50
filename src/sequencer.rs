//! Runs the enabled acts of the fixed catalog in order.
//!
//! Every enabled act starts `Pending`, moves to `Running` while its handler
//! executes and ends `Completed`, whether it succeeded or not. Disabled acts
//! never enter the state table. After the last enabled act the sequencer runs
//! the finalization path, unless the closing act is itself enabled.

use crate::config::ActMask;
use crate::device::DeviceError;
use crate::models::Act;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum ActError {
    #[error("text line {section}/LINE_{line} is missing")]
    MissingText { section: &'static str, line: usize },
    #[error("topic {0} is not configured")]
    MissingTopic(&'static str),
    #[error("device call failed: {0}")]
    Device(#[from] DeviceError),
}

/// Executes single acts on behalf of the sequencer.
#[allow(async_fn_in_trait)]
pub trait ActRunner {
    async fn run_act(&mut self, act: Act) -> Result<(), ActError>;

    /// Closing remark and reset gesture, used when no closing act is enabled.
    async fn finalize(&mut self) -> Result<(), ActError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActState {
    Pending,
    Running,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActOutcome {
    Completed,
    Failed(String),
}

#[derive(Debug, Default)]
pub struct SequenceReport {
    pub outcomes: Vec<(Act, ActOutcome)>,
    pub finalized: bool,
}

impl SequenceReport {
    pub fn ran(&self) -> Vec<Act> {
        self.outcomes.iter().map(|(act, _)| *act).collect()
    }
}

pub struct ActSequencer {
    mask: ActMask,
    states: Vec<(Act, ActState)>,
}

impl ActSequencer {
    pub fn new(mask: ActMask) -> Self {
        let states = Act::CATALOG
            .into_iter()
            .filter(|act| mask.is_enabled(*act))
            .map(|act| (act, ActState::Pending))
            .collect();
        Self { mask, states }
    }

    /// `None` for acts that are disabled.
    pub fn state(&self, act: Act) -> Option<ActState> {
        self.states
            .iter()
            .find(|(candidate, _)| *candidate == act)
            .map(|(_, state)| *state)
    }

    pub fn last_enabled(&self) -> Option<Act> {
        self.states.last().map(|(act, _)| *act)
    }

    pub async fn run<R: ActRunner>(&mut self, runner: &mut R) -> SequenceReport {
        let mut report = SequenceReport::default();
        let last = self.last_enabled();
        let closing_enabled = self.mask.is_enabled(Act::CLOSING);

        if last.is_none() {
            info!("No act is enabled, nothing to present.");
        }

        for index in 0..self.states.len() {
            let act = self.states[index].0;

            self.states[index].1 = ActState::Running;
            info!("Act {} started.", act);
            let outcome = contain(runner.run_act(act)).await;
            self.states[index].1 = ActState::Completed;

            match &outcome {
                ActOutcome::Completed => info!("Act {} completed.", act),
                ActOutcome::Failed(reason) => error!("Act {} failed: {}", act, reason),
            }
            report.outcomes.push((act, outcome));

            if Some(act) == last && !closing_enabled {
                info!("{} was the last act, finalizing the presentation.", act);
                if let ActOutcome::Failed(reason) = contain(runner.finalize()).await {
                    error!("Finalization failed: {}", reason);
                }
                report.finalized = true;
            }
        }

        report
    }
}

/// Awaits `fut`, turning both errors and panics into a failed outcome.
async fn contain<F>(fut: F) -> ActOutcome
where
    F: Future<Output = Result<(), ActError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => ActOutcome::Completed,
        Ok(Err(e)) => ActOutcome::Failed(e.to_string()),
        Err(panic) => ActOutcome::Failed(panic_message(panic.as_ref())),
    }
}

pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panic: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panic: {}", msg)
    } else {
        "panic with unknown payload".to_string()
    }
}
