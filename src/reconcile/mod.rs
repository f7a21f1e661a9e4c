//! Reconciliation
//!
//! The async core: an [`OutputStore`] shared by every stack of a run, a
//! [`Driver`] that schedules applies along the dependency graph, and the
//! [`RunReport`] it returns.

mod driver;
mod outputs;
mod report;

pub use driver::{
    ApplyError, Approver, AutoApprove, CancelHandle, CancelSignal, Driver, DriverError,
    DriverOptions, PlanError, Selection,
};
pub use outputs::{OutputError, OutputStore};
pub use report::{RunReport, StackOutcome, StackReport};
