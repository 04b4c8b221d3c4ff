//! Graceful shutdown support via a shared atomic flag

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};

static FLAG: LazyLock<Arc<AtomicBool>> = LazyLock::new(|| Arc::new(AtomicBool::new(false)));

/// Global shutdown flag, set by the SIGTERM/SIGINT handler.
///
/// Handed to the orchestrator, which checks it between job states.
pub fn shutdown_flag() -> Arc<AtomicBool> {
    Arc::clone(&FLAG)
}

/// Check if shutdown was requested
pub fn is_shutdown_requested() -> bool {
    FLAG.load(Ordering::Relaxed)
}

/// Request shutdown (for signal handlers)
pub fn request_shutdown() {
    FLAG.store(true, Ordering::Relaxed);
}
