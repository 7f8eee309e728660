//! Durable session state: the agent registry shared by every component.

mod store;
mod types;

pub use store::{ReconcileReport, SessionStore};
pub use types::{AgentRecord, AgentStatus, Session, SessionStatus};
