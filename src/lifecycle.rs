//! Pipeline lifecycle states, stages and hooks.

use std::time::Instant;

/// One of the staged operations applied to every plugin in registry order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Validate and prepare.
    Setup,
    /// Do the work; repeatable.
    Execute,
    /// Clean up.
    Teardown,
}

impl Stage {
    /// Lower-case stage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Execute => "execute",
            Self::Teardown => "teardown",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    /// Plugins are loaded.
    Built,
    /// Defaults are merged into the store.
    Configured,
    /// Setup ran to completion.
    SetUp,
    /// At least one execute pass finished; waiting for the next.
    Idle,
    /// An execute pass is running.
    Executing,
    /// Teardown ran.
    TornDown,
    /// Configuration or setup failed.
    Failed,
}

impl PipelineState {
    /// Check if defaults can be merged.
    pub fn can_configure(&self) -> bool {
        matches!(self, Self::Built)
    }

    /// Check if setup can run.
    pub fn can_setup(&self) -> bool {
        matches!(self, Self::Configured)
    }

    /// Check if an execute pass can run.
    pub fn can_execute(&self) -> bool {
        matches!(self, Self::SetUp | Self::Idle)
    }

    /// Check if teardown can run.
    pub fn can_teardown(&self) -> bool {
        matches!(self, Self::SetUp | Self::Idle | Self::Failed)
    }

    /// Check if the pipeline is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TornDown)
    }

    /// Get a human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Built => "Plugins loaded",
            Self::Configured => "Defaults merged",
            Self::SetUp => "Setup complete, ready to execute",
            Self::Idle => "Waiting for the next execute pass",
            Self::Executing => "Execute pass running",
            Self::TornDown => "Teardown complete",
            Self::Failed => "Configuration or setup failed",
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Built => "built",
            Self::Configured => "configured",
            Self::SetUp => "set-up",
            Self::Idle => "idle",
            Self::Executing => "executing",
            Self::TornDown => "torn-down",
            Self::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Lifecycle event for hooks.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// Defaults were merged.
    Configured {
        /// Number of keys in the store.
        keys: usize,
        /// Event time.
        at: Instant,
    },
    /// A stage started.
    StageStarted {
        /// The stage.
        stage: Stage,
        /// Event time.
        at: Instant,
    },
    /// A stage ran on every plugin.
    StageCompleted {
        /// The stage.
        stage: Stage,
        /// Plugins invoked.
        plugins: usize,
        /// Event time.
        at: Instant,
    },
    /// A plugin failed and the stage was aborted.
    StageFailed {
        /// The stage.
        stage: Stage,
        /// Failing plugin.
        plugin: String,
        /// Error message.
        message: String,
        /// Event time.
        at: Instant,
    },
    /// A web response produced an event.
    EventDispatched {
        /// Responding plugin.
        plugin: String,
        /// Event time.
        at: Instant,
    },
}

impl PipelineEvent {
    /// Get the event timestamp.
    pub fn timestamp(&self) -> Instant {
        match self {
            Self::Configured { at, .. }
            | Self::StageStarted { at, .. }
            | Self::StageCompleted { at, .. }
            | Self::StageFailed { at, .. }
            | Self::EventDispatched { at, .. } => *at,
        }
    }

    /// Get the stage, for stage events.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::StageStarted { stage, .. }
            | Self::StageCompleted { stage, .. }
            | Self::StageFailed { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Get the event name.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Configured { .. } => "configured",
            Self::StageStarted { .. } => "stage-started",
            Self::StageCompleted { .. } => "stage-completed",
            Self::StageFailed { .. } => "stage-failed",
            Self::EventDispatched { .. } => "event-dispatched",
        }
    }
}

/// Hooks for pipeline events.
pub struct PipelineHooks {
    handlers: Vec<Box<dyn Fn(&PipelineEvent) + Send + Sync>>,
}

impl PipelineHooks {
    /// Create new hooks.
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Add an event handler.
    pub fn on_event<F>(&mut self, handler: F)
    where
        F: Fn(&PipelineEvent) + Send + Sync + 'static,
    {
        self.handlers.push(Box::new(handler));
    }

    /// Emit an event to every handler.
    pub fn emit(&self, event: &PipelineEvent) {
        for handler in &self.handlers {
            handler(event);
        }
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Check if no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for PipelineHooks {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PipelineHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineHooks")
            .field("handler_count", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_state_transitions() {
        assert!(PipelineState::Built.can_configure());
        assert!(!PipelineState::Configured.can_configure());

        assert!(PipelineState::Configured.can_setup());
        assert!(!PipelineState::SetUp.can_setup());

        assert!(PipelineState::SetUp.can_execute());
        assert!(PipelineState::Idle.can_execute());
        assert!(!PipelineState::Executing.can_execute());
        assert!(!PipelineState::TornDown.can_execute());

        assert!(PipelineState::Idle.can_teardown());
        assert!(!PipelineState::Built.can_teardown());

        assert!(PipelineState::TornDown.is_terminal());
        assert!(!PipelineState::Idle.is_terminal());
    }

    #[test]
    fn test_hooks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let mut hooks = PipelineHooks::new();
        hooks.on_event(move |_| {
            counter_clone.fetch_add(1, Ordering::Relaxed);
        });

        hooks.emit(&PipelineEvent::StageStarted {
            stage: Stage::Setup,
            at: Instant::now(),
        });
        hooks.emit(&PipelineEvent::Configured {
            keys: 0,
            at: Instant::now(),
        });

        assert_eq!(counter.load(Ordering::Relaxed), 2);
        assert_eq!(hooks.len(), 1);
    }

    #[test]
    fn test_event_info() {
        let event = PipelineEvent::StageFailed {
            stage: Stage::Execute,
            plugin: "b".to_string(),
            message: "boom".to_string(),
            at: Instant::now(),
        };

        assert_eq!(event.stage(), Some(Stage::Execute));
        assert_eq!(event.event_name(), "stage-failed");
        assert_eq!(Stage::Teardown.to_string(), "teardown");
    }
}
