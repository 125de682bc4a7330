//! External collaborators: the device-metadata service, the audit sink, and
//! the crash reporter. Each is a trait so tests can substitute recorders.

pub mod audit;
pub mod crash;
pub mod liberator;

pub use audit::{AuditRow, AuditSink, HttpAuditSink, LogAuditSink};
pub use crash::{Bugsnag, CrashReport, CrashReporter};
pub use liberator::{DeviceMetadata, Liberator};
