//! Testing utilities for the strand runtime.
//!
//! ## Features
//!
//! - **TestRuntime** - runtime that runs closures on a context and returns their value
//! - **MockTransport** - in-memory connections with scripted failures and delays
//! - **Latch** - wait for callbacks fired on worker threads
//! - **ContextProbe** - check which context callbacks ran on
//!
//! ## Quick Start
//!
//! ```
//! use strand_testing::{ContextProbe, Latch, TestRuntime};
//! use std::time::Duration;
//!
//! let runtime = TestRuntime::new(2);
//! let context = runtime.create_context();
//! let probe = ContextProbe::new();
//! let latch = Latch::new(3);
//!
//! for _ in 0..3 {
//!     let probe = probe.clone();
//!     let latch = latch.clone();
//!     runtime
//!         .post(context, move || {
//!             probe.record();
//!             latch.count_down();
//!         })
//!         .unwrap();
//! }
//!
//! assert!(latch.wait(Duration::from_secs(5)));
//! assert!(probe.all_on(context));
//! ```

mod latch;
mod probe;
mod runtime;
mod transport;

pub use latch::Latch;
pub use probe::ContextProbe;
pub use runtime::{DEFAULT_TIMEOUT, TestRuntime, eventually};
pub use transport::MockTransport;

use tracing_subscriber::EnvFilter;

/// Route `tracing` output through the test harness.
///
/// Honors `RUST_LOG`, defaulting to `warn`. Safe to call from every test.
pub fn init_test_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
