//! Bounded, cancellable polling for on-chain confirmation.

use std::future::Future;

use crate::chain::ChainEvent;
use crate::config::ConfirmationConfig;
use crate::error::ChainError;

/// Confirmation poll state. `Polling` is the only non-terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollState {
    Polling { attempt: u32 },
    Found { event: ChainEvent, attempts: u32 },
    Exhausted { attempts: u32 },
    Cancelled { attempts: u32 },
}

impl PollState {
    pub fn start() -> Self {
        Self::Polling { attempt: 1 }
    }

    /// Fold the outcome of one probe into the state.
    pub fn observe(self, observation: Option<ChainEvent>, max_attempts: u32) -> Self {
        match self {
            Self::Polling { attempt } => match observation {
                Some(event) => Self::Found {
                    event,
                    attempts: attempt,
                },
                None if attempt >= max_attempts => Self::Exhausted { attempts: attempt },
                None => Self::Polling {
                    attempt: attempt + 1,
                },
            },
            terminal => terminal,
        }
    }

    /// Abandon polling. Counts only the probes that actually completed.
    pub fn cancel(self) -> Self {
        match self {
            Self::Polling { attempt } => Self::Cancelled {
                attempts: attempt - 1,
            },
            terminal => terminal,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Polling { .. })
    }
}

enum Step {
    Observed(Option<ChainEvent>),
    Cancelled,
}

/// Drives [`PollState`] with a fixed delay between probes.
///
/// The delay is a timer await, never a blocking sleep, and the cancel future
/// is raced against both the probe and the delay.
#[derive(Debug, Clone, Copy)]
pub struct ConfirmationPoller {
    schedule: ConfirmationConfig,
}

impl ConfirmationPoller {
    pub fn new(schedule: ConfirmationConfig) -> Self {
        Self { schedule }
    }

    /// Probe until found, exhausted or cancelled. Probe errors abort the
    /// poll and propagate.
    pub async fn run<F, Fut, C>(&self, mut probe: F, cancel: C) -> Result<PollState, ChainError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Option<ChainEvent>, ChainError>>,
        C: Future<Output = ()>,
    {
        tokio::pin!(cancel);
        let max_attempts = self.schedule.max_attempts.max(1);
        let mut state = PollState::start();

        while let PollState::Polling { attempt } = state {
            let step = tokio::select! {
                biased;
                _ = &mut cancel => Step::Cancelled,
                result = probe(attempt) => Step::Observed(result?),
            };

            state = match step {
                Step::Cancelled => state.cancel(),
                Step::Observed(observation) => state.observe(observation, max_attempts),
            };
            tracing::debug!(attempt, terminal = state.is_terminal(), "confirmation probe");

            if !state.is_terminal() {
                let cancelled = tokio::select! {
                    biased;
                    _ = &mut cancel => true,
                    _ = tokio::time::sleep(self.schedule.delay) => false,
                };
                if cancelled {
                    state = state.cancel();
                }
            }
        }

        Ok(state)
    }
}
