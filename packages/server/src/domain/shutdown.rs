//! Process-wide shutdown state shared by every relay thread.
//!
//! ```text
//! running ──interrupt()──▶ interrupted ──complete_close()──▶ clean-exit
//!    └──────────────────────finish()────────────────────────────▲
//! ```
//!
//! Terminal progress is monotonic: no transition leads back to `running`.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

use super::ShutdownError;

/// Shutdown progress of the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ShutdownState {
    /// Normal operation.
    Running = 0,
    /// An interrupt arrived; the close handshake has not completed.
    Interrupted = 1,
    /// Graceful termination.
    CleanExit = 2,
}

impl ShutdownState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Interrupted,
            _ => Self::CleanExit,
        }
    }

    /// Whether `self → next` is one of the allowed transitions.
    pub fn can_transition_to(self, next: ShutdownState) -> bool {
        matches!(
            (self, next),
            (Self::Running, Self::Interrupted)
                | (Self::Running, Self::CleanExit)
                | (Self::Interrupted, Self::CleanExit)
        )
    }

    /// Process exit status for this state: `0` only for a clean exit.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::CleanExit => 0,
            Self::Running | Self::Interrupted => 1,
        }
    }
}

impl fmt::Display for ShutdownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Running => "running",
            Self::Interrupted => "interrupted",
            Self::CleanExit => "clean-exit",
        };
        f.write_str(name)
    }
}

/// Atomic tri-state shutdown flag.
///
/// Reads use acquire ordering and transitions are acquire-release
/// compare-and-swap, so a thread observing a terminal state also observes
/// everything written before the transition.
#[derive(Debug)]
pub struct ShutdownFlag {
    state: AtomicU8,
}

impl Default for ShutdownFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ShutdownState::Running as u8),
        }
    }

    pub fn state(&self) -> ShutdownState {
        ShutdownState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == ShutdownState::Running
    }

    /// Move from `from` to `to`.
    ///
    /// Fails if the transition is not allowed, or if another thread moved the
    /// flag away from `from` first.
    pub fn transition(&self, from: ShutdownState, to: ShutdownState) -> Result<(), ShutdownError> {
        if !from.can_transition_to(to) {
            return Err(ShutdownError::InvalidTransition { from, to });
        }
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| ShutdownError::Stale {
                expected: from,
                actual: ShutdownState::from_u8(actual),
            })
    }

    /// `running → interrupted`, triggered by an OS interrupt.
    pub fn interrupt(&self) -> Result<(), ShutdownError> {
        self.transition(ShutdownState::Running, ShutdownState::Interrupted)
    }

    /// `interrupted → clean-exit`, once the close handshake has completed.
    pub fn complete_close(&self) -> Result<(), ShutdownError> {
        self.transition(ShutdownState::Interrupted, ShutdownState::CleanExit)
    }

    /// `running → clean-exit`, for a user-initiated shutdown.
    pub fn finish(&self) -> Result<(), ShutdownError> {
        self.transition(ShutdownState::Running, ShutdownState::CleanExit)
    }

    pub fn exit_code(&self) -> i32 {
        self.state().exit_code()
    }
}

/// Read-only view of a shared [`ShutdownFlag`].
///
/// Handed to components that must observe shutdown but never cause it.
#[derive(Debug, Clone)]
pub struct ShutdownView(Arc<ShutdownFlag>);

impl ShutdownView {
    pub fn new(flag: Arc<ShutdownFlag>) -> Self {
        Self(flag)
    }

    pub fn state(&self) -> ShutdownState {
        self.0.state()
    }

    /// Shutdown has started, whatever its cause.
    pub fn is_interrupted(&self) -> bool {
        !self.0.is_running()
    }
}
