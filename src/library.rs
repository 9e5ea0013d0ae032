//! Process-wide library lifecycle
//!
//! `init` must run before the first TLS connection; it installs the rustls
//! crypto provider. Calling it twice is harmless.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Library version as (major, minor, revision)
pub const VERSION: (u32, u32, u32) = (0, 14, 4);

/// Initialize process-wide state
pub fn init() {
    if INITIALIZED.swap(true, Ordering::AcqRel) {
        return;
    }

    // Another component may already have chosen a provider
    if tokio_rustls::rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        debug!("rustls crypto provider already installed");
    }
    debug!("library initialized");
}

/// Release process-wide state
pub fn cleanup() {
    if INITIALIZED.swap(false, Ordering::AcqRel) {
        debug!("library cleaned up");
    }
}

pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

/// Library version packed as `major * 1_000_000 + minor * 1_000 + revision`
pub fn version() -> u32 {
    let (major, minor, revision) = VERSION;
    major * 1_000_000 + minor * 1_000 + revision
}
