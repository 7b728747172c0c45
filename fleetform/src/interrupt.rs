use anyhow::{Context as _, Result};
use std::{error::Error, fmt::Display};
use tokio_util::sync::CancellationToken;

/// Whether the user asked us to stop.
///
/// Backed by the cancellation token that every reconciler of the run
/// watches, so an interrupt also stops in-flight polling.
#[derive(Clone, Debug, Default)]
pub struct InterruptState {
    token: CancellationToken,
}

#[derive(Clone, Debug)]
pub struct InterruptedError {}
impl Display for InterruptedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "interrupted")
    }
}
impl Error for InterruptedError {}

impl InterruptState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn set_interrupted(&self) {
        self.token.cancel();
    }

    pub fn is_interrupted(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn check_interrupted(&self) -> Result<()> {
        if self.is_interrupted() {
            Err(InterruptedError {}.into())
        } else {
            Ok(())
        }
    }
}

pub fn set_up_process_interrupt_handler() -> Result<InterruptState> {
    let interrupt_state = InterruptState::new();
    let handler_state = interrupt_state.clone();
    ctrlc::set_handler(move || {
        if handler_state.is_interrupted() {
            // Second Ctrl-C: stop waiting.
            std::process::exit(130);
        }
        eprintln!("Interrupted; waiting for in-flight calls to stop");
        handler_state.set_interrupted();
    })
    .context("Error setting interrupt handler")?;
    Ok(interrupt_state)
}
