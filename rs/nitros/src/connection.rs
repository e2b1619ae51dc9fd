//! Per-endpoint connection supervision: keep one client alive against a
//! publisher, reconnecting with exponential backoff when it goes away.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::transport::{Client, FrameSink};

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(32);

// How often to check the client's running flag while connected.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Reconnect delay schedule: 1, 2, 4, ... capped at 32 seconds.
struct Backoff {
	delay: Duration,
}

impl Backoff {
	fn new() -> Self {
		Self { delay: MIN_BACKOFF }
	}

	/// The delay to apply before the next attempt; doubles for the one after.
	fn next_delay(&mut self) -> Duration {
		let delay = self.delay;
		self.delay = (delay * 2).min(MAX_BACKOFF);
		delay
	}

	fn reset(&mut self) {
		self.delay = MIN_BACKOFF;
	}
}

/// Supervises the connection to one publisher endpoint.
///
/// Owns at most one live [Client] at a time. Stopping is safe in any state:
/// mid-connect, connected, or waiting out a backoff timer.
pub(crate) struct Connection {
	stop: watch::Sender<bool>,
	task: JoinHandle<()>,
}

impl Connection {
	/// Start supervising on the given runtime, delivering frames to `sink`.
	pub fn spawn(handle: &Handle, host: String, port: u16, sink: FrameSink) -> Self {
		let (stop, stopped) = watch::channel(false);
		let task = handle.spawn(supervise(host, port, sink, stopped));

		Self { stop, task }
	}

	/// Ask the supervisor to stop; it tears the client down and exits within
	/// one poll interval.
	pub fn stop(&self) {
		let _ = self.stop.send(true);
	}

	/// The task handle, for a bounded join during shutdown.
	pub fn into_task(self) -> JoinHandle<()> {
		self.stop();
		self.task
	}
}

async fn supervise(host: String, port: u16, sink: FrameSink, mut stopped: watch::Receiver<bool>) {
	let mut backoff = Backoff::new();

	loop {
		match Client::connect(&host, port, sink.clone()).await {
			Ok(client) => {
				tracing::debug!(%host, port, "connected to publisher");
				backoff.reset();

				// Watch for peer loss at a coarse cadence.
				loop {
					if !client.is_running() {
						tracing::debug!(%host, port, "connection lost");
						break;
					}

					tokio::select! {
						_ = tokio::time::sleep(POLL_INTERVAL) => {}
						_ = stopped.changed() => {
							client.stop();
							return;
						}
					}
				}

				client.stop();
			}
			Err(err) => {
				tracing::debug!(%host, port, %err, "connect failed");
			}
		}

		// The timer applies before the next attempt; stop cancels it.
		tokio::select! {
			_ = tokio::time::sleep(backoff.next_delay()) => {}
			_ = stopped.changed() => return,
		}
	}
}
