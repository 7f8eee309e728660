//! Agent health monitoring and operator-gated recovery.

mod conflict;
mod decision;
mod interrupt;
mod monitor;
mod notify;
mod timer;

pub use conflict::{Conflict, ConflictKind, ConflictOption, detect_contention, detect_file_conflicts};
pub use decision::{Decision, DecisionBroker, PendingDecision};
pub use interrupt::{ConflictResolution, DebugReport, HandledIssue, InterruptController, InterruptOutcome};
pub use monitor::{
    HealthIssue, HealthMonitor, HealthState, Observation, PollReport, Thresholds, classify, last_activity,
};
#[cfg(any(test, feature = "test-utils"))]
pub use notify::RecordingNotifier;
pub use notify::{LogNotifier, Notification, Notifier, Severity};
pub use timer::PeriodicTimer;
