//! Pipeline state mirrored from the external pipeline

/// External pipeline state
///
/// States are ordered: a pipeline moves one step at a time between `Null`
/// and `Playing`. A request for a distant state walks through every
/// intermediate state, each step producing its own state-change message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PipelineState {
    /// Initial state, no resources allocated
    Null,

    /// Resources allocated, not processing
    Ready,

    /// Prerolled, data flow blocked
    Paused,

    /// Actively processing frames
    Playing,
}

impl PipelineState {
    /// Check if a single-step transition is valid
    pub fn can_transition_to(&self, target: &PipelineState) -> bool {
        use PipelineState::*;

        match (self, target) {
            // Self-transitions
            (a, b) if a == b => true,

            // One step up
            (Null, Ready) | (Ready, Paused) | (Paused, Playing) => true,

            // One step down
            (Playing, Paused) | (Paused, Ready) | (Ready, Null) => true,

            // All other transitions need intermediate steps
            _ => false,
        }
    }

    /// Intermediate states visited going from this state to `target`,
    /// `target` included and this state excluded
    pub fn path_to(&self, target: PipelineState) -> Vec<PipelineState> {
        let mut path = Vec::new();
        let mut current = *self;
        while current != target {
            current = if current < target {
                current.next()
            } else {
                current.previous()
            };
            path.push(current);
        }
        path
    }

    fn next(self) -> PipelineState {
        match self {
            PipelineState::Null => PipelineState::Ready,
            PipelineState::Ready => PipelineState::Paused,
            PipelineState::Paused | PipelineState::Playing => PipelineState::Playing,
        }
    }

    fn previous(self) -> PipelineState {
        match self {
            PipelineState::Playing => PipelineState::Paused,
            PipelineState::Paused => PipelineState::Ready,
            PipelineState::Ready | PipelineState::Null => PipelineState::Null,
        }
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            PipelineState::Null => "Null",
            PipelineState::Ready => "Ready",
            PipelineState::Paused => "Paused",
            PipelineState::Playing => "Playing",
        }
    }

    /// Check if the pipeline is running
    pub fn is_playing(&self) -> bool {
        matches!(self, PipelineState::Playing)
    }

    /// Check if the pipeline holds no resources
    pub fn is_idle(&self) -> bool {
        matches!(self, PipelineState::Null)
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        use PipelineState::*;

        assert!(Null.can_transition_to(&Ready));
        assert!(Ready.can_transition_to(&Paused));
        assert!(Paused.can_transition_to(&Playing));
        assert!(Playing.can_transition_to(&Paused));
        assert!(Ready.can_transition_to(&Null));

        // Self-transitions
        assert!(Null.can_transition_to(&Null));
        assert!(Playing.can_transition_to(&Playing));
    }

    #[test]
    fn test_invalid_transitions() {
        use PipelineState::*;

        assert!(!Null.can_transition_to(&Playing)); // Must go through Ready and Paused
        assert!(!Playing.can_transition_to(&Null));
        assert!(!Ready.can_transition_to(&Playing));
    }

    #[test]
    fn test_path_to() {
        use PipelineState::*;

        assert_eq!(Null.path_to(Playing), vec![Ready, Paused, Playing]);
        assert_eq!(Playing.path_to(Null), vec![Paused, Ready, Null]);
        assert!(Paused.path_to(Paused).is_empty());
    }

    #[test]
    fn test_state_checks() {
        assert!(PipelineState::Playing.is_playing());
        assert!(!PipelineState::Paused.is_playing());
        assert!(PipelineState::Null.is_idle());
        assert_eq!(PipelineState::Ready.to_string(), "Ready");
    }
}
