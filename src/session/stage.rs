//! Session stage machine
//!
//! The single source of truth for how far a provisioning run has progressed.
//! Transitions are validated: stages cannot be skipped (except the optional
//! ones), the run never moves backwards, and the destructive flash cannot be
//! entered without an explicit confirmation.
//!
//! # Stage Flow
//!
//! ```text
//! Start
//!     ↓
//! DriveSelected
//!     ↓
//! PartitionsUnmounted
//!     ↓
//! ImageDownloaded
//!     ↓
//! Flashed                 (destructive, requires confirmation)
//!     ↓
//! PartitionsLocated
//!     ↓
//! WifiConfigured
//!     ↓
//! HostnameConfigured
//!     ↓
//! [SshEnabled]            (optional)
//!     ↓
//! [RootPasswordChanged]   (optional)
//!     ↓
//! Ejected
//!     ↓
//! Done
//!
//! (Any non-terminal stage can transition to Aborted)
//! ```

use std::fmt;
use thiserror::Error;
use time::OffsetDateTime;

/// Provisioning stages in sequential order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionStage {
    Start = 0,
    DriveSelected = 1,
    PartitionsUnmounted = 2,
    ImageDownloaded = 3,
    /// The card has been overwritten. Requires confirmation.
    Flashed = 4,
    PartitionsLocated = 5,
    WifiConfigured = 6,
    HostnameConfigured = 7,
    SshEnabled = 8,
    RootPasswordChanged = 9,
    Ejected = 10,
    /// Terminal success
    Done = 11,
    /// Terminal failure
    Aborted = 255,
}

impl SessionStage {
    #[inline]
    pub const fn order(self) -> u8 {
        self as u8
    }

    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }

    #[inline]
    pub const fn is_destructive(self) -> bool {
        matches!(self, Self::Flashed)
    }

    /// Stages a run may pass over
    #[inline]
    pub const fn is_optional(self) -> bool {
        matches!(self, Self::SshEnabled | Self::RootPasswordChanged)
    }

    /// The next stage in the sequence, or None at a terminal stage
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Start => Some(Self::DriveSelected),
            Self::DriveSelected => Some(Self::PartitionsUnmounted),
            Self::PartitionsUnmounted => Some(Self::ImageDownloaded),
            Self::ImageDownloaded => Some(Self::Flashed),
            Self::Flashed => Some(Self::PartitionsLocated),
            Self::PartitionsLocated => Some(Self::WifiConfigured),
            Self::WifiConfigured => Some(Self::HostnameConfigured),
            Self::HostnameConfigured => Some(Self::SshEnabled),
            Self::SshEnabled => Some(Self::RootPasswordChanged),
            Self::RootPasswordChanged => Some(Self::Ejected),
            Self::Ejected => Some(Self::Done),
            Self::Done | Self::Aborted => None,
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::Start => "Not started",
            Self::DriveSelected => "Drive selected",
            Self::PartitionsUnmounted => "Partitions unmounted",
            Self::ImageDownloaded => "Image downloaded",
            Self::Flashed => "Image flashed",
            Self::PartitionsLocated => "Partitions located",
            Self::WifiConfigured => "WiFi configured",
            Self::HostnameConfigured => "Hostname configured",
            Self::SshEnabled => "SSH enabled",
            Self::RootPasswordChanged => "Password changed",
            Self::Ejected => "Card ejected",
            Self::Done => "Done",
            Self::Aborted => "Aborted",
        }
    }

    /// All stages in order (excluding Aborted)
    pub const fn all_stages() -> &'static [Self] {
        &[
            Self::Start,
            Self::DriveSelected,
            Self::PartitionsUnmounted,
            Self::ImageDownloaded,
            Self::Flashed,
            Self::PartitionsLocated,
            Self::WifiConfigured,
            Self::HostnameConfigured,
            Self::SshEnabled,
            Self::RootPasswordChanged,
            Self::Ejected,
            Self::Done,
        ]
    }
}

impl fmt::Display for SessionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Errors that can occur during stage transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    /// Attempted to pass over a required stage
    #[error("Cannot skip from {from} to {to} ({skipped} is required)")]
    SkippedStage {
        from: SessionStage,
        to: SessionStage,
        skipped: SessionStage,
    },

    #[error("Cannot go backwards from {from} to {to}")]
    BackwardTransition { from: SessionStage, to: SessionStage },

    #[error("Cannot transition from terminal stage {from}")]
    FromTerminalState { from: SessionStage },

    #[error("Stage {stage} requires explicit confirmation (destructive operation)")]
    MissingConfirmation { stage: SessionStage },

    #[error("Already at stage {stage}")]
    AlreadyAtStage { stage: SessionStage },
}

impl From<TransitionError> for crate::error::ProvisionError {
    fn from(err: TransitionError) -> Self {
        crate::error::ProvisionError::Transition(err.to_string())
    }
}

/// Owns the current stage of a run and validates every transition.
#[derive(Debug, Clone)]
pub struct SessionContext {
    current: SessionStage,
    aborted_at: Option<SessionStage>,
    history: Vec<(SessionStage, OffsetDateTime)>,
    skipped: Vec<SessionStage>,
    destructive_confirmed: bool,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionContext {
    pub fn new() -> Self {
        Self {
            current: SessionStage::Start,
            aborted_at: None,
            history: Vec::with_capacity(SessionStage::all_stages().len()),
            skipped: Vec::new(),
            destructive_confirmed: false,
        }
    }

    #[inline]
    pub fn current_stage(&self) -> SessionStage {
        self.current
    }

    #[inline]
    pub fn aborted_at(&self) -> Option<SessionStage> {
        self.aborted_at
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.current == SessionStage::Done
    }

    #[inline]
    pub fn is_aborted(&self) -> bool {
        self.current == SessionStage::Aborted
    }

    /// Stages entered so far, with the time each was entered
    pub fn history(&self) -> &[(SessionStage, OffsetDateTime)] {
        &self.history
    }

    /// Optional stages passed over
    pub fn skipped(&self) -> &[SessionStage] {
        &self.skipped
    }

    /// Authorize the flash. One-way.
    pub fn confirm_destructive_operations(&mut self) {
        self.destructive_confirmed = true;
    }

    #[inline]
    pub fn is_destructive_confirmed(&self) -> bool {
        self.destructive_confirmed
    }

    /// Advance to the immediately following stage.
    pub fn advance(&mut self) -> Result<SessionStage, TransitionError> {
        let Some(next) = self.current.next() else {
            return Err(TransitionError::FromTerminalState { from: self.current });
        };
        self.transition_to(next)
    }

    /// Move to `target`, passing over optional stages in between.
    ///
    /// # Errors
    ///
    /// - `FromTerminalState` if the run is done or aborted
    /// - `AlreadyAtStage` if target is the current stage
    /// - `BackwardTransition` if target is before current
    /// - `SkippedStage` if a required stage lies between current and target
    /// - `MissingConfirmation` if target is destructive and unconfirmed
    pub fn transition_to(&mut self, target: SessionStage) -> Result<SessionStage, TransitionError> {
        if self.current.is_terminal() {
            return Err(TransitionError::FromTerminalState { from: self.current });
        }
        if target == self.current {
            return Err(TransitionError::AlreadyAtStage { stage: target });
        }
        if target == SessionStage::Aborted || target.order() < self.current.order() {
            return Err(TransitionError::BackwardTransition {
                from: self.current,
                to: target,
            });
        }

        let mut passed = Vec::new();
        let mut cursor = self.current.next();
        while let Some(stage) = cursor {
            if stage == target {
                break;
            }
            if !stage.is_optional() {
                return Err(TransitionError::SkippedStage {
                    from: self.current,
                    to: target,
                    skipped: stage,
                });
            }
            passed.push(stage);
            cursor = stage.next();
        }

        if target.is_destructive() && !self.destructive_confirmed {
            return Err(TransitionError::MissingConfirmation { stage: target });
        }

        self.skipped.extend(passed);
        self.history.push((target, OffsetDateTime::now_utc()));
        self.current = target;
        Ok(target)
    }

    /// Mark the run as aborted, remembering where.
    pub fn abort(&mut self) -> Result<(), TransitionError> {
        if self.current.is_terminal() {
            return Err(TransitionError::FromTerminalState { from: self.current });
        }
        self.aborted_at = Some(self.current);
        self.history.push((SessionStage::Aborted, OffsetDateTime::now_utc()));
        self.current = SessionStage::Aborted;
        Ok(())
    }
}
