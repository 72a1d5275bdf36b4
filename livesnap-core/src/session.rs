// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Checkpoint session phases with typed transitions.
//!
//! Pending → PreDumping* → Dumping → Persisting → [Deduplicating] → Completed.
//! A failure before the tree was stopped ends in Failed; a failure after it
//! ends in RolledBack once the tree is resumed.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::StateTransitionError;
use crate::types::ContainerId;

/// Phase of one checkpoint session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPhase {
    Pending,
    /// Running non-stopping memory passes.
    PreDumping,
    /// Final dump in progress; the tree may be stopped.
    Dumping,
    /// Writing pages and metadata.
    Persisting,
    Deduplicating,
    Completed,
    /// Failed after the tree was stopped; the tree was resumed.
    RolledBack,
    Failed,
}

impl SessionPhase {
    /// Get the phase name for error messages.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::PreDumping => "PreDumping",
            Self::Dumping => "Dumping",
            Self::Persisting => "Persisting",
            Self::Deduplicating => "Deduplicating",
            Self::Completed => "Completed",
            Self::RolledBack => "RolledBack",
            Self::Failed => "Failed",
        }
    }

    /// Check if transition to the target phase is valid.
    pub fn can_transition_to(&self, target: SessionPhase) -> bool {
        matches!(
            (self, target),
            // From Pending
            (Self::Pending, Self::PreDumping) |
            (Self::Pending, Self::Dumping) |
            (Self::Pending, Self::Failed) |
            // From PreDumping (one transition per pass)
            (Self::PreDumping, Self::PreDumping) |
            (Self::PreDumping, Self::Dumping) |
            (Self::PreDumping, Self::Failed) |
            // From Dumping
            (Self::Dumping, Self::Persisting) |
            (Self::Dumping, Self::Failed) |
            (Self::Dumping, Self::RolledBack) |
            // From Persisting
            (Self::Persisting, Self::Deduplicating) |
            (Self::Persisting, Self::Completed) |
            (Self::Persisting, Self::Failed) |
            (Self::Persisting, Self::RolledBack) |
            // From Deduplicating (compaction failure is only a warning)
            (Self::Deduplicating, Self::Completed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::RolledBack | Self::Failed)
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Tracks the phase of one checkpoint session.
#[derive(Debug)]
pub struct SessionTracker {
    container_id: ContainerId,
    phase: SessionPhase,
    started: Instant,
    last_transition: Instant,
    transition_count: u64,
    pre_dump_passes: u32,
}

impl SessionTracker {
    pub fn new(container_id: ContainerId) -> Self {
        let now = Instant::now();
        Self {
            container_id,
            phase: SessionPhase::Pending,
            started: now,
            last_transition: now,
            transition_count: 0,
            pre_dump_passes: 0,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn container_id(&self) -> &ContainerId {
        &self.container_id
    }

    /// Time since the session started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn time_in_current_phase(&self) -> Duration {
        self.last_transition.elapsed()
    }

    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    /// Number of pre-dump passes entered so far.
    pub fn pre_dump_passes(&self) -> u32 {
        self.pre_dump_passes
    }

    /// Attempt to transition to a new phase.
    pub fn transition_to(&mut self, target: SessionPhase) -> Result<(), StateTransitionError> {
        if !self.phase.can_transition_to(target) {
            return Err(StateTransitionError::InvalidTransition {
                container_id: self.container_id.clone(),
                from: self.phase.name(),
                to: target.name(),
            });
        }

        tracing::debug!(
            container_id = %self.container_id,
            from = self.phase.name(),
            to = target.name(),
            "Session phase transition"
        );

        if target == SessionPhase::PreDumping {
            self.pre_dump_passes += 1;
        }
        self.phase = target;
        self.last_transition = Instant::now();
        self.transition_count += 1;

        Ok(())
    }

    /// End the session after an error, honoring whether the tree was stopped.
    ///
    /// Returns the terminal phase reached. Already terminal sessions keep their phase.
    pub fn fail(&mut self, rolled_back: bool) -> SessionPhase {
        if self.phase.is_terminal() {
            return self.phase;
        }
        let target = if rolled_back && self.phase.can_transition_to(SessionPhase::RolledBack) {
            SessionPhase::RolledBack
        } else {
            SessionPhase::Failed
        };
        if self.transition_to(target).is_err() {
            // Deduplicating cannot fail the session; anything else reaching
            // here is forced into Failed.
            self.phase = SessionPhase::Failed;
        }
        self.phase
    }
}
