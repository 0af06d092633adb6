//! Patch Validator - sandboxed patch-apply-and-compare for Python codebases
//!
//! This library runs a codebase's pytest suite in a disposable sandbox before
//! and after applying a code patch (and optional test patch), then classifies
//! how every test's outcome changed across the patch boundary.

pub mod classify;
pub mod config;
pub mod error;
pub mod outcome;
pub mod patch;
pub mod runner;
pub mod sandbox;
pub mod session;

pub use classify::{compare, Transition, TransitionReport};
pub use config::{
    BackendKind, EnvironmentSetup, SessionConfig, TimeoutConfig, Validate, ValidationResult,
    HARNESS_PACKAGES,
};
pub use error::{Error, Result};
pub use outcome::{Outcome, Snapshot, Status, TestId, TestRecord};
pub use patch::{Patch, PatchKind};
pub use sandbox::{
    CommandOutput, ContainerProvider, ContainerSandbox, LocalSandbox, LocalVenvProvider, Sandbox,
    SandboxCommand, SandboxProvider,
};
pub use session::{
    Session, SessionFailure, SessionReport, SessionRequest, SessionState, TestReport,
};
