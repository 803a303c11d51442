pub mod audit;
pub mod lifecycle;
pub mod state;
pub mod store;

pub use audit::{AuditEvent, AuditLog};
pub use lifecycle::{
    InvoiceLifecycle, LifecycleError, Outcome, PollPolicy, RetryPolicy, SigningMaterial,
};
pub use state::{AuthorizationOutcome, FailureReason, ReceptionOutcome, SubmissionState};
pub use store::{PipelineRecord, PipelineStore, Registration, StateChange};
