//! The publisher engine: a bounded send queue feeding a single-writer
//! broadcast server, announced over discovery.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::runtime::Runtime;

use crate::coding::{self, Flags, Value};
use crate::compress::{self, Compression};
use crate::discovery::Discovery;
use crate::transport::Server;
use crate::worker::{join_timeout, shutdown_runtime, CLOSE_TIMEOUT};
use crate::Error;

// Oldest messages are dropped beyond this depth.
const SEND_QUEUE_CAPACITY: usize = 10;

/// Publisher construction options.
#[derive(Clone, Debug, Default)]
pub struct PublisherConfig {
	/// Lossy compression applied to every message on this topic.
	pub compression: Option<Compression>,
	/// Enable the process-wide default logger.
	pub log: bool,
}

/// Publishes messages to every subscriber of a topic.
///
/// `send` never blocks: messages pass through a bounded queue to a worker
/// thread that encodes and broadcasts them, and a subscriber that cannot
/// keep up is skipped frame by frame rather than slowing anyone down.
pub struct Publisher {
	topic: String,
	compression: Option<Compression>,
	server: Arc<Server>,
	queue: Arc<SendQueue>,
	discovery: Option<Discovery>,
	runtime: Option<Runtime>,
	worker: Option<thread::JoinHandle<()>>,
	running: Arc<AtomicBool>,
}

impl Publisher {
	/// Start publishing on `topic`: bind an ephemeral port, announce it over
	/// discovery, and start the send worker.
	pub fn new(topic: impl Into<String>, config: PublisherConfig) -> Result<Self, Error> {
		Self::start(topic.into(), config, true)
	}

	pub(crate) fn start(topic: String, config: PublisherConfig, announce: bool) -> Result<Self, Error> {
		if config.log {
			crate::log::enable();
		}
		if topic.is_empty() {
			return Err(Error::InvalidTopic);
		}

		let runtime = tokio::runtime::Builder::new_multi_thread()
			.worker_threads(1)
			.thread_name("nitros-publisher")
			.enable_all()
			.build()?;

		let server = Arc::new(Server::start(0, runtime.handle())?);
		let port = server.local_port();

		let discovery = if announce {
			let registered = Discovery::new().and_then(|discovery| {
				discovery.register(&topic, port, config.compression)?;
				Ok(discovery)
			});

			match registered {
				Ok(discovery) => Some(discovery),
				Err(err) => {
					tracing::warn!(%err, "discovery unavailable, publisher will not be advertised");
					None
				}
			}
		} else {
			None
		};

		let queue = Arc::new(SendQueue::default());
		let running = Arc::new(AtomicBool::new(true));

		let worker = thread::Builder::new().name("nitros-send".to_string()).spawn({
			let queue = queue.clone();
			let server = server.clone();
			let running = running.clone();
			let compression = config.compression;
			move || send_worker(queue, server, compression, running)
		})?;

		tracing::info!(%topic, port, "publisher started");

		Ok(Self {
			topic,
			compression: config.compression,
			server,
			queue,
			discovery,
			runtime: Some(runtime),
			worker: Some(worker),
			running,
		})
	}

	pub fn topic(&self) -> &str {
		&self.topic
	}

	pub fn compression(&self) -> Option<Compression> {
		self.compression
	}

	/// The ephemeral port this publisher serves on.
	pub fn local_port(&self) -> u16 {
		self.server.local_port()
	}

	/// Queue a message for every subscriber, without blocking.
	///
	/// If the queue is full the oldest queued message is discarded.
	pub fn send(&self, value: impl Into<Value>) {
		self.push(value.into(), None);
	}

	/// Like [send](Self::send), tagging the message with an application type
	/// name.
	///
	/// On compressed topics the hint is ignored: compression bypasses the
	/// structured encoder.
	pub fn send_typed(&self, value: impl Into<Value>, type_hint: &str) {
		self.push(value.into(), Some(type_hint.to_string()));
	}

	fn push(&self, value: Value, type_hint: Option<String>) {
		if !self.running.load(Ordering::Relaxed) {
			return;
		}
		self.queue.push(Outgoing { value, type_hint });
	}

	/// The number of currently connected subscribers.
	pub fn subscriber_count(&self) -> usize {
		self.server.writer_count()
	}

	/// Block until at least `count` subscribers are connected or the timeout
	/// elapses; true on success.
	pub fn wait_for_subscribers(&self, count: usize, timeout: Duration) -> bool {
		let deadline = Instant::now() + timeout;

		loop {
			if self.subscriber_count() >= count {
				return true;
			}
			if Instant::now() >= deadline {
				return false;
			}
			thread::sleep(Duration::from_millis(50));
		}
	}

	/// Stop the send worker, drop every subscriber and unregister from
	/// discovery. Idempotent; every join is bounded.
	pub fn close(&mut self) {
		if !self.running.swap(false, Ordering::SeqCst) {
			return;
		}

		self.queue.wake();
		if let Some(worker) = self.worker.take() {
			join_timeout(worker, CLOSE_TIMEOUT, "send worker");
		}

		self.server.close();

		if let Some(discovery) = self.discovery.take() {
			discovery.close();
		}

		if let Some(runtime) = self.runtime.take() {
			shutdown_runtime(runtime);
		}

		tracing::info!(topic = %self.topic, "publisher closed");
	}
}

impl Drop for Publisher {
	fn drop(&mut self) {
		self.close();
	}
}

fn send_worker(queue: Arc<SendQueue>, server: Arc<Server>, compression: Option<Compression>, running: Arc<AtomicBool>) {
	while running.load(Ordering::Relaxed) {
		let Some(outgoing) = queue.pop(Duration::from_millis(100)) else {
			continue;
		};

		match encode_payload(&outgoing.value, outgoing.type_hint.as_deref(), compression) {
			Ok(payload) => server.broadcast(&payload),
			Err(err) => tracing::warn!(%err, "failed to encode message, dropping"),
		}
	}
}

// Payload byte 0 announces the codec; the body is whatever that codec emits.
fn encode_payload(value: &Value, type_hint: Option<&str>, compression: Option<Compression>) -> Result<Vec<u8>, Error> {
	let (flags, body) = match compression {
		None => (Flags::Structured, coding::encode(value, type_hint)?.to_vec()),
		Some(mode) => (mode.flags(), compress::compress(value, mode)?),
	};

	let mut payload = Vec::with_capacity(1 + body.len());
	payload.push(flags.into());
	payload.extend_from_slice(&body);
	Ok(payload)
}

struct Outgoing {
	value: Value,
	type_hint: Option<String>,
}

#[derive(Default)]
struct SendQueue {
	state: Mutex<QueueState>,
	signal: Condvar,
}

#[derive(Default)]
struct QueueState {
	items: VecDeque<Outgoing>,
	overflowing: bool,
}

impl SendQueue {
	// Drop-oldest on overflow, logging once per overflow episode.
	fn push(&self, item: Outgoing) {
		let mut state = self.state.lock();

		if state.items.len() >= SEND_QUEUE_CAPACITY {
			state.items.pop_front();
			if !state.overflowing {
				state.overflowing = true;
				tracing::warn!("send queue full, dropping oldest message");
			}
		} else {
			state.overflowing = false;
		}

		state.items.push_back(item);
		drop(state);

		self.signal.notify_one();
	}

	fn pop(&self, timeout: Duration) -> Option<Outgoing> {
		let mut state = self.state.lock();
		if state.items.is_empty() {
			self.signal.wait_for(&mut state, timeout);
		}
		state.items.pop_front()
	}

	fn wake(&self) {
		self.signal.notify_all();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::coding::ArrayValue;

	#[test]
	fn queue_never_exceeds_capacity() {
		let queue = SendQueue::default();
		for i in 0..15 {
			queue.push(Outgoing {
				value: Value::Int(i),
				type_hint: None,
			});
		}

		let mut drained = Vec::new();
		while let Some(item) = queue.pop(Duration::ZERO) {
			drained.push(item.value);
		}

		assert_eq!(drained.len(), SEND_QUEUE_CAPACITY);
		// The five oldest were dropped.
		assert_eq!(drained.first(), Some(&Value::Int(5)));
		assert_eq!(drained.last(), Some(&Value::Int(14)));
	}

	#[test]
	fn overflow_episodes_reset() {
		let queue = SendQueue::default();
		for i in 0..11 {
			queue.push(Outgoing {
				value: Value::Int(i),
				type_hint: None,
			});
		}
		assert!(queue.state.lock().overflowing);

		queue.pop(Duration::ZERO);
		queue.push(Outgoing {
			value: Value::Int(99),
			type_hint: None,
		});
		assert!(!queue.state.lock().overflowing);
	}

	#[test]
	fn payload_flags_byte() {
		let image = ArrayValue::from_u8(vec![8, 8, 3], vec![0u8; 192]).unwrap();
		let cloud = ArrayValue::from_f32(vec![4, 3], &[0.5; 12]).unwrap();

		let structured = encode_payload(&Value::Int(1), None, None).unwrap();
		assert_eq!(structured[0], 0x00);

		let jpeg = encode_payload(&Value::Array(image), None, Some(Compression::Image)).unwrap();
		assert_eq!(jpeg[0], 0x01);

		let lz4 = encode_payload(&Value::Array(cloud), None, Some(Compression::Pointcloud)).unwrap();
		assert_eq!(lz4[0], 0x02);
	}

	#[test]
	fn rejects_empty_topic() {
		assert!(matches!(
			Publisher::start(String::new(), PublisherConfig::default(), false),
			Err(Error::InvalidTopic)
		));
	}

	#[test]
	fn close_is_idempotent() {
		let mut publisher = Publisher::start("t".to_string(), PublisherConfig::default(), false).unwrap();
		publisher.close();
		publisher.close();
	}

	#[test]
	fn wait_for_subscribers_times_out() {
		let publisher = Publisher::start("t".to_string(), PublisherConfig::default(), false).unwrap();
		assert!(!publisher.wait_for_subscribers(1, Duration::from_millis(150)));
		assert_eq!(publisher.subscriber_count(), 0);
	}
}
