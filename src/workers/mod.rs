//! Background workers

pub mod reconciliation;
pub mod scheduler;

pub use reconciliation::{
    ReconcileRequest, ReconciliationConfig, ReconciliationError, Reconciler, SchedulerState,
    SweepReport, SweepReporter, SweepWindow, TracingSweepReporter, TriggerAck, TriggerSource,
    WindowKind,
};
