//! Length-framed TCP transport: a broadcast server on the publisher side and
//! a receive-only client on the subscriber side.
//!
//! Frames are `[u32 big-endian length][payload]`. The server never awaits
//! delivery: each subscriber has its own outbound queue and a slow one is
//! skipped once its pending bytes pass the high-water mark, so it degrades to
//! a lower frame rate instead of stalling the rest.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::Error;

/// Skip a subscriber's frame once this many bytes are queued for it.
pub const HIGH_WATER_MARK: usize = 4 * 1024 * 1024;

/// Receives raw frame payloads; invoked from the transport's runtime.
pub type FrameSink = Arc<dyn Fn(Bytes) + Send + Sync>;

struct Writer {
	tx: mpsc::UnboundedSender<Bytes>,
	pending: Arc<AtomicUsize>,
	addr: SocketAddr,
}

type WriterTable = Arc<Mutex<HashMap<u64, Writer>>>;

/// A broadcast server owning one writer per connected subscriber.
pub struct Server {
	port: u16,
	writers: WriterTable,
	shutdown: watch::Sender<bool>,
	accept: JoinHandle<()>,
}

impl Server {
	/// Bind on the given port (0 picks an ephemeral one) and start accepting
	/// on the given runtime.
	pub fn start(port: u16, handle: &Handle) -> Result<Self, Error> {
		let listener = std::net::TcpListener::bind(("0.0.0.0", port))?;
		listener.set_nonblocking(true)?;
		let port = listener.local_addr()?.port();

		let writers: WriterTable = Default::default();
		let (shutdown, stopped) = watch::channel(false);

		let accept = handle.spawn(accept_loop(listener, writers.clone(), stopped));
		tracing::debug!(port, "server listening");

		Ok(Self {
			port,
			writers,
			shutdown,
			accept,
		})
	}

	/// The port actually bound.
	pub fn local_port(&self) -> u16 {
		self.port
	}

	/// The number of currently connected subscribers.
	pub fn writer_count(&self) -> usize {
		self.writers.lock().len()
	}

	/// Queue a frame for every connected subscriber, fire-and-forget.
	///
	/// Subscribers above the high-water mark are skipped for this frame;
	/// nothing here blocks, so this is callable from any thread.
	pub fn broadcast(&self, payload: &[u8]) {
		debug_assert!(!payload.is_empty(), "frames must carry at least the flags byte");
		if payload.len() > u32::MAX as usize {
			tracing::warn!(len = payload.len(), "payload too large for a frame, dropping");
			return;
		}

		let mut frame = BytesMut::with_capacity(4 + payload.len());
		frame.put_u32(payload.len() as u32);
		frame.put_slice(payload);
		let frame = frame.freeze();

		let mut writers = self.writers.lock();
		writers.retain(|_, writer| {
			if writer.pending.load(Ordering::Relaxed) > HIGH_WATER_MARK {
				tracing::trace!(addr = %writer.addr, "write buffer over high-water mark, skipping frame");
				return true;
			}

			writer.pending.fetch_add(frame.len(), Ordering::Relaxed);
			writer.tx.send(frame.clone()).is_ok()
		});
	}

	/// Stop accepting and drop every subscriber. Idempotent.
	pub fn close(&self) {
		let _ = self.shutdown.send(true);
		self.accept.abort();
		self.writers.lock().clear();
		tracing::debug!(port = self.port, "server stopped");
	}
}

async fn accept_loop(listener: std::net::TcpListener, writers: WriterTable, mut stopped: watch::Receiver<bool>) {
	let listener = match TcpListener::from_std(listener) {
		Ok(listener) => listener,
		Err(err) => {
			tracing::warn!(%err, "failed to register listener");
			return;
		}
	};

	let ids = AtomicU64::new(0);

	loop {
		let accepted = tokio::select! {
			_ = stopped.changed() => break,
			accepted = listener.accept() => accepted,
		};

		let (stream, addr) = match accepted {
			Ok(accepted) => accepted,
			Err(err) => {
				tracing::debug!(%err, "accept failed");
				continue;
			}
		};

		let _ = stream.set_nodelay(true);
		let (read_half, write_half) = stream.into_split();

		let id = ids.fetch_add(1, Ordering::Relaxed);
		let (tx, rx) = mpsc::unbounded_channel();
		let pending = Arc::new(AtomicUsize::new(0));

		writers.lock().insert(
			id,
			Writer {
				tx,
				pending: pending.clone(),
				addr,
			},
		);
		tracing::debug!(%addr, "subscriber connected");

		tokio::spawn(drain_writer(write_half, rx, pending, writers.clone(), id));
		tokio::spawn(detect_eof(read_half, writers.clone(), id, stopped.clone()));
	}
}

// Pop queued frames and push them into the socket; the queue closes when the
// writer leaves the table.
async fn drain_writer(
	mut stream: OwnedWriteHalf,
	mut rx: mpsc::UnboundedReceiver<Bytes>,
	pending: Arc<AtomicUsize>,
	writers: WriterTable,
	id: u64,
) {
	while let Some(frame) = rx.recv().await {
		let len = frame.len();
		if let Err(err) = stream.write_all(&frame).await {
			if writers.lock().remove(&id).is_some() {
				tracing::debug!(%err, "write failed, dropping subscriber");
			}
			break;
		}
		pending.fetch_sub(len, Ordering::Relaxed);
	}

	let _ = stream.shutdown().await;
}

// The server only reads to notice the peer going away; any bytes it sends are
// discarded.
async fn detect_eof(mut stream: OwnedReadHalf, writers: WriterTable, id: u64, mut stopped: watch::Receiver<bool>) {
	let mut discard = [0u8; 1024];

	loop {
		let read = tokio::select! {
			_ = stopped.changed() => break,
			read = stream.read(&mut discard) => read,
		};

		match read {
			Ok(0) => {
				if writers.lock().remove(&id).is_some() {
					tracing::debug!("subscriber disconnected");
				}
				break;
			}
			Ok(_) => continue,
			Err(err) => {
				if writers.lock().remove(&id).is_some() {
					tracing::debug!(%err, "subscriber read failed");
				}
				break;
			}
		}
	}
}

/// A receive-only client for one publisher endpoint.
pub struct Client {
	running: Arc<AtomicBool>,
	task: JoinHandle<()>,
}

impl Client {
	/// Connect and start the receive loop, handing every payload to `sink`.
	pub async fn connect(host: &str, port: u16, sink: FrameSink) -> io::Result<Self> {
		let stream = TcpStream::connect((host, port)).await?;
		let _ = stream.set_nodelay(true);

		let running = Arc::new(AtomicBool::new(true));
		let task = tokio::spawn(receive_loop(stream, sink, running.clone()));

		Ok(Self { running, task })
	}

	/// False once the receive loop has terminated for any reason.
	pub fn is_running(&self) -> bool {
		self.running.load(Ordering::Relaxed)
	}

	pub fn stop(&self) {
		self.running.store(false, Ordering::Relaxed);
		self.task.abort();
	}
}

impl Drop for Client {
	fn drop(&mut self) {
		self.stop();
	}
}

async fn receive_loop(mut stream: TcpStream, sink: FrameSink, running: Arc<AtomicBool>) {
	match receive_frames(&mut stream, &sink).await {
		Ok(()) => tracing::debug!("publisher closed the stream"),
		Err(err) => tracing::debug!(%err, "receive loop ended"),
	}

	running.store(false, Ordering::Relaxed);
}

async fn receive_frames(stream: &mut TcpStream, sink: &FrameSink) -> io::Result<()> {
	loop {
		let mut header = [0u8; 4];
		match stream.read_exact(&mut header).await {
			Ok(_) => {}
			// EOF at a frame boundary is a clean shutdown.
			Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
			Err(err) => return Err(err),
		}

		let len = u32::from_be_bytes(header) as usize;
		if len == 0 {
			return Err(io::Error::new(io::ErrorKind::InvalidData, "zero-length frame"));
		}

		let mut payload = vec![0u8; len];
		stream.read_exact(&mut payload).await?;

		sink(Bytes::from(payload));
	}
}
