//! Process-wide engine handle.
//!
//! Most applications build and own an [`InterceptionEngine`] directly. This
//! module is for code that needs one shared engine without threading it
//! through every call site. The handle is created on first access (or by
//! [`install`]) and its lifetime is bracketed by explicit
//! [`InterceptionEngine::start`] and [`InterceptionEngine::stop`] calls.

use std::sync::OnceLock;

use crate::{Connectivity, HttpTransport, InterceptionEngine};

static ENGINE: OnceLock<InterceptionEngine<HttpTransport>> = OnceLock::new();

/// Returns the process-wide engine, creating an inactive default one if
/// nothing was installed.
pub fn engine() -> &'static InterceptionEngine<HttpTransport> {
    ENGINE.get_or_init(|| InterceptionEngine::new(HttpTransport::default(), Connectivity::default()))
}

/// Installs `engine` as the process-wide engine.
///
/// Fails, handing the engine back, if one was already installed or created.
pub fn install(
    engine: InterceptionEngine<HttpTransport>,
) -> Result<(), InterceptionEngine<HttpTransport>> {
    ENGINE.set(engine)
}
