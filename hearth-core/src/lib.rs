//! Core types for the hearth VM control plane.
//!
//! Defines the persisted records (VMs, snapshots, OS images, console
//! session mirror), the error taxonomy shared by every crate, the
//! [`Store`] persistence seam and the [`AuditSink`] event seam.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod audit;
pub mod env;
pub mod error;
pub mod id;
pub mod session;
pub mod snapshot;
pub mod store;
pub mod vm;

pub use audit::{
    AuditAction, AuditEvent, AuditSink, MemoryAuditSink, Outcome, ResourceKind, TracingAuditSink,
};
pub use error::{CoreError, ErrorCategory};
pub use id::{ImageId, SessionId, SnapshotId, UserId, VmId};
pub use session::{ConsoleSessionRecord, EndReason};
pub use snapshot::{NewSnapshot, SnapshotRecord, SnapshotWithVm};
pub use store::{MemoryStore, Store, StoreError};
pub use vm::{validate_resources, validate_vm_name, NewOsImage, NewVm, OsImage, VmRecord, VmStatus};
