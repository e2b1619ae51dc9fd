//! mDNS-SD discovery: publishers register one service per topic instance and
//! subscribers browse for them.
//!
//! Discovery is best-effort. When the daemon cannot start (no multicast, no
//! permissions), engines log and keep running without it: a publisher still
//! serves direct connections and a subscriber simply never finds peers.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::Mutex;

use crate::compress::Compression;
use crate::Error;

/// The mDNS service type shared by every publisher.
pub const SERVICE_TYPE: &str = "_nitros._tcp.local.";

/// One publisher seen on the network.
#[derive(Clone, Debug)]
pub struct PublisherInfo {
	pub host: String,
	pub port: u16,
	pub compression: Option<Compression>,
}

/// A handle on the mDNS daemon, owning at most one registration.
pub struct Discovery {
	daemon: ServiceDaemon,
	registered: Mutex<Option<String>>,
}

impl Discovery {
	pub fn new() -> Result<Self, Error> {
		Ok(Self {
			daemon: ServiceDaemon::new()?,
			registered: Mutex::new(None),
		})
	}

	/// Announce a publisher for `topic` on the given port.
	///
	/// The instance name carries a random 8-hex id so multiple publishers of
	/// the same topic coexist; the topic and compression mode travel as TXT
	/// properties. The A record carries the machine's routable IPv4 address,
	/// one address only.
	pub fn register(&self, topic: &str, port: u16, compression: Option<Compression>) -> Result<(), Error> {
		let instance = instance_name(topic);
		let host = format!("{}.local.", instance);
		let ip = local_ipv4();
		let properties = [("topic", topic), ("compression", Compression::label(compression))];

		let info = ServiceInfo::new(SERVICE_TYPE, &instance, &host, ip, port, &properties[..])?;

		let fullname = info.get_fullname().to_string();
		self.daemon.register(info)?;
		*self.registered.lock() = Some(fullname);

		tracing::debug!(%topic, port, %ip, "registered publisher");
		Ok(())
	}

	/// Watch for publishers of `topic` appearing and disappearing.
	///
	/// Callbacks run on a discovery thread and may fire concurrently with
	/// anything else; both receive the `(host, port)` endpoint. The browse
	/// ends when the daemon shuts down.
	pub fn browse(
		&self,
		topic: &str,
		on_found: impl Fn(&str, u16) + Send + 'static,
		on_removed: impl Fn(&str, u16) + Send + 'static,
	) -> Result<(), Error> {
		let events = self.daemon.browse(SERVICE_TYPE)?;
		let topic_thread = topic.to_string();

		std::thread::Builder::new()
			.name("nitros-discovery".to_string())
			.spawn(move || {
				let topic = topic_thread;
				// Removals only carry the instance fullname, so remember
				// which endpoint each instance resolved to.
				let mut endpoints: HashMap<String, (String, u16)> = HashMap::new();

				while let Ok(event) = events.recv() {
					match event {
						ServiceEvent::ServiceResolved(info) => {
							if info.get_property_val_str("topic") != Some(topic.as_str()) {
								continue;
							}

							let Some((host, port)) = endpoint(&info) else {
								continue;
							};

							tracing::debug!(%topic, %host, port, "publisher found");
							endpoints.insert(info.get_fullname().to_string(), (host.clone(), port));
							on_found(&host, port);
						}
						ServiceEvent::ServiceRemoved(_, fullname) => {
							if let Some((host, port)) = endpoints.remove(&fullname) {
								tracing::debug!(%topic, %host, port, "publisher removed");
								on_removed(&host, port);
							}
						}
						_ => {}
					}
				}
			})
			.map_err(Error::Io)?;

		tracing::debug!(%topic, "browsing for publishers");
		Ok(())
	}

	/// Unregister and shut the daemon down. Idempotent, best-effort.
	pub fn close(&self) {
		if let Some(fullname) = self.registered.lock().take() {
			if let Ok(done) = self.daemon.unregister(&fullname) {
				let _ = done.recv_timeout(Duration::from_secs(1));
			}
		}

		let _ = self.daemon.shutdown();
	}
}

// A random 8-hex id keeps instances of the same topic distinct.
fn instance_name(topic: &str) -> String {
	format!("{}-{}", topic, hex::encode(rand::random::<[u8; 4]>()))
}

// The one IPv4 address advertised in the A record. Routing a UDP socket at a
// public address reveals the preferred outbound interface without sending a
// packet; a host with no route falls back to loopback.
fn local_ipv4() -> IpAddr {
	let resolved = std::net::UdpSocket::bind(("0.0.0.0", 0)).and_then(|socket| {
		socket.connect(("8.8.8.8", 80))?;
		socket.local_addr()
	});

	match resolved {
		Ok(addr) if !addr.ip().is_unspecified() => addr.ip(),
		_ => IpAddr::V4(Ipv4Addr::LOCALHOST),
	}
}

// The first IPv4 address of a resolved service; IPv6 is not used.
fn endpoint(info: &ServiceInfo) -> Option<(String, u16)> {
	let host = info.get_addresses().iter().find(|addr| addr.is_ipv4())?;
	Some((host.to_string(), info.get_port()))
}

/// Scan the whole network for active topics.
///
/// Browses passively for `timeout`, then reports every publisher seen,
/// grouped by topic. Used by the CLI; a fresh daemon is spun up and torn
/// down for the scan.
pub fn scan(timeout: Duration) -> Result<BTreeMap<String, Vec<PublisherInfo>>, Error> {
	let daemon = ServiceDaemon::new()?;
	let events = daemon.browse(SERVICE_TYPE)?;

	// Keyed by fullname so repeated resolutions don't duplicate entries.
	let mut seen: HashMap<String, (String, PublisherInfo)> = HashMap::new();

	let deadline = Instant::now() + timeout;
	while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
		let event = match events.recv_timeout(remaining) {
			Ok(event) => event,
			Err(_) => break,
		};

		let ServiceEvent::ServiceResolved(info) = event else {
			continue;
		};

		let Some(topic) = info.get_property_val_str("topic") else {
			continue;
		};
		let Some((host, port)) = endpoint(&info) else {
			continue;
		};

		let compression = info
			.get_property_val_str("compression")
			.and_then(|label| Compression::from_label(label).ok())
			.flatten();

		seen.insert(
			info.get_fullname().to_string(),
			(
				topic.to_string(),
				PublisherInfo {
					host,
					port,
					compression,
				},
			),
		);
	}

	let _ = daemon.shutdown();

	let mut topics: BTreeMap<String, Vec<PublisherInfo>> = BTreeMap::new();
	for (_, (topic, publisher)) in seen {
		topics.entry(topic).or_default().push(publisher);
	}

	Ok(topics)
}
