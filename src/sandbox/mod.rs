//! Sandbox module for isolated test execution environments.
//!
//! This module provides the [`SandboxProvider`] trait and two backends:
//! [`ContainerProvider`] (one container per sandbox) and
//! [`LocalVenvProvider`] (a private directory with its own virtualenv).

mod container;
pub mod exec;
mod local;
mod provider;
pub mod registry;
pub mod worktree;

pub use container::{ContainerProvider, ContainerSandbox, CONTAINER_SCRATCH, CONTAINER_WORKDIR};
pub use local::{LocalSandbox, LocalVenvProvider};
pub use provider::{CommandOutput, Sandbox, SandboxCommand, SandboxProvider};
pub use registry::SandboxLease;
