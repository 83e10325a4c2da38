// src/shutdown.rs

//! Ctrl-C handling.
//!
//! The first interrupt asks for confirmation; a second interrupt while the
//! question is open stops without asking. Stopping only sets the
//! [`StopSignal`]: running lifecycles wind down and are joined by the
//! scheduler.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::control::StopSignal;

pub const CONFIRM_PROMPT: &str = "Really quit? (y/n)>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAction {
    /// Ask the user to confirm.
    Prompt,
    /// Confirmed stop.
    Stop,
    /// Interrupted again while confirming.
    ForceStop,
    /// Declined; keep running.
    Resume,
    /// Nothing to do (already stopping, or no question open).
    Ignore,
}

/// Pure interrupt/confirmation state machine.
#[derive(Debug, Clone, Default)]
pub struct InterruptState {
    confirming: bool,
    stopping: bool,
}

impl InterruptState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_confirming(&self) -> bool {
        self.confirming
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    pub fn on_interrupt(&mut self) -> InterruptAction {
        if self.stopping {
            return InterruptAction::Ignore;
        }
        if self.confirming {
            self.confirming = false;
            self.stopping = true;
            return InterruptAction::ForceStop;
        }
        self.confirming = true;
        InterruptAction::Prompt
    }

    pub fn on_answer(&mut self, answer: &str) -> InterruptAction {
        if !self.confirming || self.stopping {
            return InterruptAction::Ignore;
        }
        self.confirming = false;
        if answer.trim().to_lowercase().starts_with('y') {
            self.stopping = true;
            InterruptAction::Stop
        } else {
            InterruptAction::Resume
        }
    }
}

/// Listen for Ctrl-C in the background until stop is requested.
pub fn spawn_interrupt_handler(stop: StopSignal) -> JoinHandle<()> {
    tokio::spawn(handle_interrupts(stop))
}

async fn handle_interrupts(stop: StopSignal) {
    let mut state = InterruptState::new();
    let mut answers = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = stop.stopped() => return,
            res = signal::ctrl_c() => {
                if let Err(e) = res {
                    warn!("failed to listen for Ctrl+C: {e}");
                    return;
                }
            }
        }

        let mut action = state.on_interrupt();
        if action == InterruptAction::Prompt {
            eprintln!("\n{CONFIRM_PROMPT}");
            action = tokio::select! {
                _ = stop.stopped() => return,
                line = answers.next_line() => {
                    let answer = line.ok().flatten().unwrap_or_default();
                    state.on_answer(&answer)
                }
                _ = signal::ctrl_c() => state.on_interrupt(),
            };
        }

        match action {
            InterruptAction::Stop => {
                info!("stopping: waiting for running tests to finish");
                stop.stop();
            }
            InterruptAction::ForceStop => {
                warn!("interrupted again; stopping without confirmation");
                stop.stop();
            }
            InterruptAction::Resume => info!("resuming"),
            InterruptAction::Prompt | InterruptAction::Ignore => {}
        }
    }
}
