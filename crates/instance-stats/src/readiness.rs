// Copyright 2024-Present the openstack-instance-stats authors.
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Process-wide warm-up latch consumed by the readiness probe.
///
/// Starts not-ready and flips to ready exactly once after the warm-up delay,
/// unconditionally: the transition does not depend on whether any data was
/// collected. There is no path back to not-ready.
#[derive(Debug, Clone, Default)]
pub struct ReadinessGate {
    ready: Arc<AtomicBool>,
}

impl ReadinessGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Spawn the warm-up timer. Safe to call before any probe arrives.
    pub fn begin_warmup(&self, delay: Duration) {
        let ready = Arc::clone(&self.ready);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            ready.store(true, Ordering::Release);
            debug!("warm-up complete, readiness gate open");
        });
    }
}
