//! The subscriber engine: discovery-driven connections fanning into a
//! single latest-wins slot, drained by a dedicated callback thread.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tokio::runtime::{Handle, Runtime};

use crate::coding::{self, Flags, Value};
use crate::compress::{self, Compression};
use crate::connection::Connection;
use crate::discovery::Discovery;
use crate::transport::FrameSink;
use crate::worker::{join_timeout, shutdown_runtime, CLOSE_TIMEOUT};
use crate::Error;

/// Subscriber construction options.
#[derive(Clone, Debug, Default)]
pub struct SubscriberConfig {
	/// Enable the process-wide default logger.
	pub log: bool,
}

/// Receives messages from every publisher of a topic.
///
/// The callback always sees the most recent payload from any publisher: if
/// it is slower than the arrival rate, intermediate frames are dropped. It
/// runs on a dedicated thread, so it may block freely without stalling any
/// connection.
pub struct Subscriber {
	topic: String,
	fanin: Arc<Fanin>,
	discovery: Option<Discovery>,
	runtime: Option<Runtime>,
	dispatch: Option<thread::JoinHandle<()>>,
	running: Arc<AtomicBool>,
}

impl Subscriber {
	/// Subscribe to `topic`, invoking `callback` for every delivered message.
	pub fn new(
		topic: impl Into<String>,
		callback: impl FnMut(Value) + Send + 'static,
		config: SubscriberConfig,
	) -> Result<Self, Error> {
		Self::start(topic.into(), callback, config, true)
	}

	pub(crate) fn start(
		topic: String,
		callback: impl FnMut(Value) + Send + 'static,
		config: SubscriberConfig,
		browse: bool,
	) -> Result<Self, Error> {
		if config.log {
			crate::log::enable();
		}
		if topic.is_empty() {
			return Err(Error::InvalidTopic);
		}

		let runtime = tokio::runtime::Builder::new_multi_thread()
			.worker_threads(1)
			.thread_name("nitros-subscriber")
			.enable_all()
			.build()?;

		let fanin = Arc::new(Fanin {
			topic: topic.clone(),
			handle: runtime.handle().clone(),
			inbox: Arc::new(Inbox::default()),
			connections: Mutex::new(HashMap::new()),
		});

		let running = Arc::new(AtomicBool::new(true));

		let dispatch = thread::Builder::new().name("nitros-dispatch".to_string()).spawn({
			let fanin = fanin.clone();
			let running = running.clone();
			move || dispatch_worker(fanin, running, callback)
		})?;

		let discovery = if browse {
			let browsing = Discovery::new().and_then(|discovery| {
				let found = fanin.clone();
				let removed = fanin.clone();
				discovery.browse(
					&topic,
					move |host, port| found.add_publisher(host, port),
					move |host, port| removed.remove_publisher(host, port),
				)?;
				Ok(discovery)
			});

			match browsing {
				Ok(discovery) => Some(discovery),
				Err(err) => {
					tracing::warn!(%err, "discovery unavailable, no publishers will be found");
					None
				}
			}
		} else {
			None
		};

		tracing::info!(%topic, "subscriber started");

		Ok(Self {
			topic,
			fanin,
			discovery,
			runtime: Some(runtime),
			dispatch: Some(dispatch),
			running,
		})
	}

	pub fn topic(&self) -> &str {
		&self.topic
	}

	/// Stop the dispatch worker and every connection. Idempotent; every join
	/// is bounded.
	pub fn close(&mut self) {
		if !self.running.swap(false, Ordering::SeqCst) {
			return;
		}

		self.fanin.inbox.wake();
		if let Some(dispatch) = self.dispatch.take() {
			join_timeout(dispatch, CLOSE_TIMEOUT, "dispatch worker");
		}

		{
			let mut connections = self.fanin.connections.lock();
			for (endpoint, connection) in connections.drain() {
				tracing::debug!(%endpoint, "stopping connection");
				drop(connection.into_task());
			}
		}

		if let Some(discovery) = self.discovery.take() {
			discovery.close();
		}

		// Bounds the teardown of the supervisor and client tasks.
		if let Some(runtime) = self.runtime.take() {
			shutdown_runtime(runtime);
		}

		tracing::info!(topic = %self.topic, "subscriber closed");
	}
}

impl Drop for Subscriber {
	fn drop(&mut self) {
		self.close();
	}
}

// Shared between the discovery thread (connection table updates), the
// transport runtime (inbound payloads) and the dispatch worker.
struct Fanin {
	topic: String,
	handle: Handle,
	inbox: Arc<Inbox>,
	connections: Mutex<HashMap<String, Connection>>,
}

impl Fanin {
	// Idempotent: a publisher already being tracked is left alone.
	fn add_publisher(&self, host: &str, port: u16) {
		let endpoint = format!("{host}:{port}");

		let mut connections = self.connections.lock();
		if connections.contains_key(&endpoint) {
			return;
		}

		let inbox = self.inbox.clone();
		let sink: FrameSink = Arc::new(move |payload| inbox.put(payload));

		let connection = Connection::spawn(&self.handle, host.to_string(), port, sink);
		tracing::debug!(topic = %self.topic, %endpoint, "tracking publisher");
		connections.insert(endpoint, connection);
	}

	fn remove_publisher(&self, host: &str, port: u16) {
		let endpoint = format!("{host}:{port}");

		if let Some(connection) = self.connections.lock().remove(&endpoint) {
			tracing::debug!(topic = %self.topic, %endpoint, "publisher gone, dropping connection");
			connection.stop();
		}
	}
}

fn dispatch_worker(fanin: Arc<Fanin>, running: Arc<AtomicBool>, mut callback: impl FnMut(Value)) {
	while running.load(Ordering::Relaxed) {
		let Some(payload) = fanin.inbox.take(Duration::from_millis(100)) else {
			continue;
		};

		let value = match parse_payload(&payload) {
			Ok(value) => value,
			Err(err) => {
				tracing::warn!(%err, "dropping undecodable message");
				continue;
			}
		};

		// A panicking callback must not take the worker down with it.
		if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(value))) {
			let reason = panic
				.downcast_ref::<&str>()
				.map(|s| s.to_string())
				.or_else(|| panic.downcast_ref::<String>().cloned())
				.unwrap_or_else(|| "non-string panic".to_string());
			tracing::warn!(%reason, "subscriber callback panicked");
		}
	}
}

fn parse_payload(payload: &[u8]) -> Result<Value, Error> {
	let (flags, body) = payload.split_first().ok_or(Error::Frame("empty payload"))?;

	match Flags::parse(*flags)? {
		Flags::Structured => Ok(coding::decode(body)?),
		Flags::Image => compress::decompress(body, Compression::Image),
		Flags::Pointcloud => compress::decompress(body, Compression::Pointcloud),
	}
}

// The latest-wins slot: a write replaces any unread payload, by design.
#[derive(Default)]
struct Inbox {
	slot: Mutex<Option<Bytes>>,
	signal: Condvar,
}

impl Inbox {
	fn put(&self, payload: Bytes) {
		*self.slot.lock() = Some(payload);
		self.signal.notify_one();
	}

	fn take(&self, timeout: Duration) -> Option<Bytes> {
		let mut slot = self.slot.lock();
		if slot.is_none() {
			self.signal.wait_for(&mut slot, timeout);
		}
		slot.take()
	}

	fn wake(&self) {
		self.signal.notify_all();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::coding::ArrayValue;
	use crate::publisher::{Publisher, PublisherConfig};
	use std::collections::BTreeMap;
	use std::sync::mpsc;

	fn pair(compression: Option<Compression>) -> (Publisher, Subscriber, mpsc::Receiver<Value>) {
		let publisher = Publisher::start(
			"t".to_string(),
			PublisherConfig {
				compression,
				..Default::default()
			},
			false,
		)
		.unwrap();

		let (tx, rx) = mpsc::channel();
		let subscriber = Subscriber::start(
			"t".to_string(),
			move |value| {
				let _ = tx.send(value);
			},
			SubscriberConfig::default(),
			false,
		)
		.unwrap();

		subscriber.fanin.add_publisher("127.0.0.1", publisher.local_port());
		assert!(publisher.wait_for_subscribers(1, Duration::from_secs(5)));

		(publisher, subscriber, rx)
	}

	#[test]
	fn structured_roundtrip() {
		let (publisher, _subscriber, rx) = pair(None);

		let mut map = BTreeMap::new();
		map.insert("a".to_string(), Value::Int(1));
		map.insert("b".to_string(), Value::List(vec![Value::Int(2), Value::Int(3)]));

		publisher.send(Value::Map(map.clone()));
		assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Value::Map(map));
	}

	#[test]
	fn scalar_type_hint_unwraps() {
		let (publisher, _subscriber, rx) = pair(None);

		publisher.send_typed(42i64, "Num");
		assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Value::Int(42));
	}

	#[test]
	fn map_type_hint_is_delivered() {
		let (publisher, _subscriber, rx) = pair(None);

		let mut map = BTreeMap::new();
		map.insert("x".to_string(), Value::Int(1));
		publisher.send_typed(Value::Map(map), "P");

		let mut expected = BTreeMap::new();
		expected.insert("__type".to_string(), Value::String("P".to_string()));
		expected.insert("x".to_string(), Value::Int(1));
		assert_eq!(
			rx.recv_timeout(Duration::from_secs(5)).unwrap(),
			Value::Map(expected)
		);
	}

	#[test]
	fn ndarray_roundtrip() {
		let (publisher, _subscriber, rx) = pair(None);

		let zeros = ArrayValue::from_u8(vec![480, 640], vec![0u8; 480 * 640]).unwrap();
		publisher.send(Value::Array(zeros.clone()));

		assert_eq!(
			rx.recv_timeout(Duration::from_secs(5)).unwrap(),
			Value::Array(zeros)
		);
	}

	#[test]
	fn image_topic_roundtrip() {
		let (publisher, _subscriber, rx) = pair(Some(Compression::Image));

		let frame = ArrayValue::from_u8(vec![64, 64, 3], vec![200u8; 64 * 64 * 3]).unwrap();
		publisher.send(Value::Array(frame));

		let received = match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
			Value::Array(array) => array,
			other => panic!("expected an array, got {other}"),
		};
		assert_eq!(received.shape(), &[64, 64, 3]);
	}

	#[test]
	fn pointcloud_topic_roundtrip() {
		let (publisher, _subscriber, rx) = pair(Some(Compression::Pointcloud));

		let points: Vec<f32> = (0..300).map(|i| (i as f32) * 0.0661 - 10.0).collect();
		let cloud = ArrayValue::from_f32(vec![100, 3], &points).unwrap();
		publisher.send(Value::Array(cloud));

		let received = match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
			Value::Array(array) => array,
			other => panic!("expected an array, got {other}"),
		};
		assert_eq!(received.shape(), &[100, 3]);

		for (original, recovered) in points.iter().zip(
			received
				.data()
				.chunks_exact(4)
				.map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
		) {
			assert!((original - recovered).abs() <= 0.0005 + f32::EPSILON);
		}
	}

	#[test]
	fn slow_callback_sees_the_latest_message() {
		let publisher = Publisher::start("t".to_string(), PublisherConfig::default(), false).unwrap();

		let seen = Arc::new(Mutex::new(Vec::new()));
		let subscriber = Subscriber::start(
			"t".to_string(),
			{
				let seen = seen.clone();
				move |value| {
					thread::sleep(Duration::from_millis(100));
					seen.lock().push(value);
				}
			},
			SubscriberConfig::default(),
			false,
		)
		.unwrap();

		subscriber.fanin.add_publisher("127.0.0.1", publisher.local_port());
		assert!(publisher.wait_for_subscribers(1, Duration::from_secs(5)));

		for i in 0..30 {
			publisher.send(Value::Int(i));
		}

		// After quiescence the last delivery is the newest payload, and the
		// burst outpaced the callback so some frames were dropped.
		let deadline = std::time::Instant::now() + Duration::from_secs(10);
		loop {
			{
				let seen = seen.lock();
				if seen.last() == Some(&Value::Int(29)) {
					assert!(seen.len() < 30);
					break;
				}
			}
			assert!(std::time::Instant::now() < deadline, "never saw the final message");
			thread::sleep(Duration::from_millis(50));
		}
	}

	#[test]
	fn connection_table_is_unique_per_endpoint() {
		let publisher = Publisher::start("t".to_string(), PublisherConfig::default(), false).unwrap();
		let subscriber = Subscriber::start(
			"t".to_string(),
			|_| {},
			SubscriberConfig::default(),
			false,
		)
		.unwrap();

		let port = publisher.local_port();
		subscriber.fanin.add_publisher("127.0.0.1", port);
		subscriber.fanin.add_publisher("127.0.0.1", port);
		assert_eq!(subscriber.fanin.connections.lock().len(), 1);

		subscriber.fanin.remove_publisher("127.0.0.1", port);
		subscriber.fanin.remove_publisher("127.0.0.1", port);
		assert!(subscriber.fanin.connections.lock().is_empty());
	}

	#[test]
	fn merges_multiple_publishers() {
		let publisher_a = Publisher::start("t".to_string(), PublisherConfig::default(), false).unwrap();
		let publisher_b = Publisher::start("t".to_string(), PublisherConfig::default(), false).unwrap();

		let (tx, rx) = mpsc::channel();
		let subscriber = Subscriber::start(
			"t".to_string(),
			move |value| {
				let _ = tx.send(value);
			},
			SubscriberConfig::default(),
			false,
		)
		.unwrap();

		subscriber.fanin.add_publisher("127.0.0.1", publisher_a.local_port());
		subscriber.fanin.add_publisher("127.0.0.1", publisher_b.local_port());
		assert!(publisher_a.wait_for_subscribers(1, Duration::from_secs(5)));
		assert!(publisher_b.wait_for_subscribers(1, Duration::from_secs(5)));

		publisher_a.send(Value::String("from a".to_string()));
		let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
		publisher_b.send(Value::String("from b".to_string()));
		let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();

		assert_eq!(first, Value::String("from a".to_string()));
		assert_eq!(second, Value::String("from b".to_string()));
	}

	#[test]
	fn panicking_callback_does_not_stop_dispatch() {
		let publisher = Publisher::start("t".to_string(), PublisherConfig::default(), false).unwrap();

		let (tx, rx) = mpsc::channel();
		let subscriber = Subscriber::start(
			"t".to_string(),
			move |value| {
				if value == Value::Int(0) {
					panic!("boom");
				}
				let _ = tx.send(value);
			},
			SubscriberConfig::default(),
			false,
		)
		.unwrap();

		subscriber.fanin.add_publisher("127.0.0.1", publisher.local_port());
		assert!(publisher.wait_for_subscribers(1, Duration::from_secs(5)));

		publisher.send(Value::Int(0));
		thread::sleep(Duration::from_millis(300));
		publisher.send(Value::Int(1));

		assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Value::Int(1));
	}

	#[test]
	fn close_is_idempotent() {
		let mut subscriber = Subscriber::start(
			"t".to_string(),
			|_| {},
			SubscriberConfig::default(),
			false,
		)
		.unwrap();
		subscriber.close();
		subscriber.close();
	}

	#[test]
	fn malformed_flags_are_dropped() {
		assert!(parse_payload(&[0x80, 0x01]).is_err());
		assert!(parse_payload(&[0x03]).is_err());
		assert!(parse_payload(&[]).is_err());
		assert!(parse_payload(&[0x00, 0x2a]).is_ok());
	}
}
