//! Process-wide registry of live sandbox identities.
//!
//! A sandbox identity may be held by one session at a time. Backends take a
//! [`SandboxLease`] before building anything and keep it until the sandbox is
//! dropped.

use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};

use crate::error::{Error, Result};

static LIVE_IDENTITIES: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();

fn live() -> &'static Mutex<HashSet<String>> {
    LIVE_IDENTITIES.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Exclusive claim on a sandbox identity, released on drop.
#[derive(Debug)]
pub struct SandboxLease {
    id: String,
}

impl SandboxLease {
    /// Claims `id`, failing with [`Error::SandboxBusy`] if it is already held.
    pub fn acquire(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let mut live = live().lock().unwrap_or_else(|e| e.into_inner());
        if !live.insert(id.clone()) {
            return Err(Error::SandboxBusy(id));
        }
        tracing::debug!(sandbox = %id, "acquired sandbox identity");
        Ok(Self { id })
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        let mut live = live().lock().unwrap_or_else(|e| e.into_inner());
        live.remove(&self.id);
    }
}

/// Generates a fresh identity with the given prefix.
pub fn generate_identity(prefix: &str) -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &uuid[..12])
}
