use std::fmt;

use log::debug;

/// Where an apply or rollback is in its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStage {
    Idle,
    Locked,
    Merging,
    Validating,
    Writing,
    Reloading,
    Verifying,
    Committed,
    Compensating,
}

impl ApplyStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyStage::Idle => "idle",
            ApplyStage::Locked => "locked",
            ApplyStage::Merging => "merging",
            ApplyStage::Validating => "validating",
            ApplyStage::Writing => "writing",
            ApplyStage::Reloading => "reloading",
            ApplyStage::Verifying => "verifying",
            ApplyStage::Committed => "committed",
            ApplyStage::Compensating => "compensating",
        }
    }
}

impl fmt::Display for ApplyStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks and logs stage transitions for one run.
#[derive(Debug)]
pub(crate) struct Progress {
    operation: &'static str,
    stage: ApplyStage,
    failed: Option<ApplyStage>,
}

impl Progress {
    pub(crate) fn new(operation: &'static str) -> Self {
        Self {
            operation,
            stage: ApplyStage::Idle,
            failed: None,
        }
    }

    pub(crate) fn enter(&mut self, next: ApplyStage) {
        debug!("{}: {} -> {}", self.operation, self.stage, next);
        self.stage = next;
    }

    /// Remember the current stage as the one that failed.
    pub(crate) fn fail(&mut self) {
        self.failed.get_or_insert(self.stage);
    }

    pub(crate) fn stage(&self) -> ApplyStage {
        self.stage
    }

    /// The stage a failure happened in, or the current one.
    pub(crate) fn failed_stage(&self) -> ApplyStage {
        self.failed.unwrap_or(self.stage)
    }

    pub(crate) fn operation(&self) -> &'static str {
        self.operation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_tracks_current_stage() {
        let mut p = Progress::new("apply");
        assert_eq!(p.stage(), ApplyStage::Idle);
        p.enter(ApplyStage::Locked);
        p.enter(ApplyStage::Merging);
        assert_eq!(p.stage(), ApplyStage::Merging);
        assert_eq!(p.operation(), "apply");

        p.fail();
        p.enter(ApplyStage::Compensating);
        assert_eq!(p.failed_stage(), ApplyStage::Merging);
    }
}
