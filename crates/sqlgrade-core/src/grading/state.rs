use std::time::Instant;

/// Lifecycle of one grading attempt. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptState {
    Idle,
    Resolving,
    Provisioning,
    Executing,
    Comparing,
    Done,
    Failed(String),
}

impl AttemptState {
    pub fn name(&self) -> &'static str {
        match self {
            AttemptState::Idle => "idle",
            AttemptState::Resolving => "resolving",
            AttemptState::Provisioning => "provisioning",
            AttemptState::Executing => "executing",
            AttemptState::Comparing => "comparing",
            AttemptState::Done => "done",
            AttemptState::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptState::Done | AttemptState::Failed(_))
    }

    /// Forward steps only; any live state may fail. A test run finishes after `Executing`.
    pub fn can_transition_to(&self, next: &AttemptState) -> bool {
        use AttemptState::*;
        match (self, next) {
            (s, Failed(_)) => !s.is_terminal(),
            (Idle, Resolving)
            | (Resolving, Provisioning)
            | (Provisioning, Executing)
            | (Executing, Comparing)
            | (Executing, Done)
            | (Comparing, Done) => true,
            _ => false,
        }
    }
}

/// Tracks one attempt through its states and logs every step.
#[derive(Debug)]
pub struct AttemptTracker {
    problem_id: String,
    state: AttemptState,
    started: Instant,
    query_ms: Option<u64>,
}

impl AttemptTracker {
    pub fn new(problem_id: &str) -> Self {
        Self {
            problem_id: problem_id.to_string(),
            state: AttemptState::Idle,
            started: Instant::now(),
            query_ms: None,
        }
    }

    pub fn state(&self) -> &AttemptState {
        &self.state
    }

    pub fn enter(&mut self, next: AttemptState) {
        if !self.state.can_transition_to(&next) {
            tracing::warn!(
                event = "grading_state_invalid",
                problem = %self.problem_id,
                from = self.state.name(),
                to = next.name(),
            );
            return;
        }
        tracing::debug!(
            event = "grading_state",
            problem = %self.problem_id,
            from = self.state.name(),
            to = next.name(),
            elapsed_ms = self.elapsed_ms(),
        );
        self.state = next;
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.enter(AttemptState::Failed(reason.into()));
    }

    pub fn record_query_ms(&mut self, ms: u64) {
        self.query_ms = Some(ms);
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Candidate query time when the query ran, otherwise time spent on the attempt.
    pub fn execution_time_ms(&self) -> u64 {
        self.query_ms.unwrap_or_else(|| self.elapsed_ms())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut t = AttemptTracker::new("p");
        for s in [
            AttemptState::Resolving,
            AttemptState::Provisioning,
            AttemptState::Executing,
            AttemptState::Comparing,
            AttemptState::Done,
        ] {
            t.enter(s.clone());
            assert_eq!(t.state(), &s);
        }
        assert!(t.state().is_terminal());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut t = AttemptTracker::new("p");
        t.enter(AttemptState::Resolving);
        t.fail("dataset missing");
        assert_eq!(t.state(), &AttemptState::Failed("dataset missing".into()));
        t.enter(AttemptState::Provisioning);
        t.fail("again");
        assert_eq!(t.state().name(), "failed");
        assert_eq!(t.state(), &AttemptState::Failed("dataset missing".into()));
    }

    #[test]
    fn test_no_skipping_steps() {
        assert!(!AttemptState::Idle.can_transition_to(&AttemptState::Executing));
        assert!(!AttemptState::Comparing.can_transition_to(&AttemptState::Resolving));
        assert!(AttemptState::Executing.can_transition_to(&AttemptState::Done));
        assert!(AttemptState::Idle.can_transition_to(&AttemptState::Failed("x".into())));
    }
}
