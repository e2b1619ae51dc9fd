use std::sync::Once;

use tracing_subscriber::EnvFilter;

static ENABLE: Once = Once::new();

/// Install a default stderr subscriber for the whole process.
///
/// Latched on: once any publisher or subscriber enables logging it stays
/// enabled for the process lifetime. A no-op when the application already
/// installed its own subscriber.
pub(crate) fn enable() {
	ENABLE.call_once(|| {
		let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("nitros=debug"));

		let _ = tracing_subscriber::fmt()
			.with_env_filter(filter)
			.with_writer(std::io::stderr)
			.try_init();
	});
}
