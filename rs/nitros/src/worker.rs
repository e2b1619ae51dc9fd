//! Shutdown helpers shared by the publisher and subscriber engines.

use std::thread;
use std::time::{Duration, Instant};

use tokio::runtime::Runtime;

// Every join during close is bounded by this.
pub(crate) const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Join a worker thread with a deadline.
///
/// A worker stuck in user code (a sleeping callback, say) must not wedge
/// close; after the deadline it is detached and shutdown continues.
pub(crate) fn join_timeout(handle: thread::JoinHandle<()>, timeout: Duration, name: &'static str) {
	let deadline = Instant::now() + timeout;

	while !handle.is_finished() {
		if Instant::now() >= deadline {
			tracing::warn!(worker = name, "worker did not stop in time, detaching");
			return;
		}
		thread::sleep(Duration::from_millis(10));
	}

	let _ = handle.join();
}

/// Shut a private runtime down with a bounded wait.
///
/// Blocking shutdown is illegal inside an async context (a user closing from
/// within their own runtime), so fall back to a background shutdown there.
pub(crate) fn shutdown_runtime(runtime: Runtime) {
	match tokio::runtime::Handle::try_current() {
		Ok(_) => runtime.shutdown_background(),
		Err(_) => runtime.shutdown_timeout(CLOSE_TIMEOUT),
	}
}
