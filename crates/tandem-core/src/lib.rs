// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .compact()
        .try_init();
}

/// Cooperative shutdown signal shared by the owner and its worker threads.
///
/// Workers poll it once per frame and leave their loop between frames; there
/// is no way to interrupt a frame that is already being built.
#[derive(Clone, Debug, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        if !self.0.swap(true, Ordering::AcqRel) {
            tracing::info!("stop requested");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
