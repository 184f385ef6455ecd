//! Inbound gate: single-flight processing per contact identity.
//!
//! A duplicate delivery for an identity that is already being processed is
//! dropped, never queued: queuing could reorder stage advancement.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

/// Set of identities with processing in flight.
#[derive(Debug, Default)]
pub struct InboundGate {
    in_flight: Mutex<HashSet<String>>,
}

impl InboundGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        // A panic while holding the lock cannot leave the set inconsistent.
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Try to claim `identity`. Returns `false` if it is already claimed.
    pub fn acquire(&self, identity: &str) -> bool {
        self.lock().insert(identity.to_string())
    }

    /// Release a claim on `identity`.
    pub fn release(&self, identity: &str) {
        self.lock().remove(identity);
    }

    /// Claim `identity` for the lifetime of the returned guard.
    pub fn try_enter(self: &Arc<Self>, identity: &str) -> Option<GateGuard> {
        if self.acquire(identity) {
            Some(GateGuard {
                gate: Arc::clone(self),
                identity: identity.to_string(),
            })
        } else {
            debug!(identity = %identity, "Identity already in flight");
            None
        }
    }

    /// Whether `identity` is currently being processed.
    pub fn is_in_flight(&self, identity: &str) -> bool {
        self.lock().contains(identity)
    }

    /// Number of identities currently in flight.
    pub fn in_flight_count(&self) -> usize {
        self.lock().len()
    }
}

/// Scoped claim on an identity; releases on drop, including during unwinding.
#[derive(Debug)]
pub struct GateGuard {
    gate: Arc<InboundGate>,
    identity: String,
}

impl GateGuard {
    pub fn identity(&self) -> &str {
        &self.identity
    }
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.gate.release(&self.identity);
    }
}
