//! Rescue automation
//!
//! The [`SessionController`] owns the state machine and drives the
//! [`scheduler::PollingScheduler`], which calls into the
//! [`executor::TransactionExecutor`] when the vault has capacity.

pub mod controller;
pub mod executor;
pub mod scheduler;
pub mod state;

pub use controller::{Command, Connector, Notice, RunOutcome, SessionController, StatusReport};
pub use executor::{Leg, Receipt, TransactionExecutor};
pub use scheduler::{PendingExecution, Plan, PollingScheduler, TickOutcome};
pub use state::{FailureCounter, ProcessingGuard, SessionState};
