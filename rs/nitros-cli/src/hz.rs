use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nitros::{Subscriber, SubscriberConfig};
use parking_lot::Mutex;

pub async fn hz(topic: String, window: usize) -> anyhow::Result<()> {
	let window = window.max(2);
	let timestamps = Arc::new(Mutex::new(VecDeque::with_capacity(window)));

	let mut subscriber = Subscriber::new(
		topic.as_str(),
		{
			let timestamps = timestamps.clone();
			move |_| {
				let mut timestamps = timestamps.lock();
				if timestamps.len() == window {
					timestamps.pop_front();
				}
				timestamps.push_back(Instant::now());
			}
		},
		SubscriberConfig::default(),
	)?;

	println!("Measuring rate on {topic:?} (Ctrl+C to stop)...");

	let mut interval = tokio::time::interval(Duration::from_secs(1));
	interval.tick().await;

	loop {
		tokio::select! {
			_ = tokio::signal::ctrl_c() => break,
			_ = interval.tick() => {
				let (count, span) = {
					let timestamps = timestamps.lock();
					match (timestamps.front(), timestamps.back()) {
						(Some(first), Some(last)) if timestamps.len() >= 2 => {
							(timestamps.len(), last.duration_since(*first))
						}
						_ => {
							println!("  no messages yet");
							continue;
						}
					}
				};

				if span > Duration::ZERO {
					let rate = (count - 1) as f64 / span.as_secs_f64();
					println!("  average rate: {rate:.1} Hz ({count} msgs in {:.2}s)", span.as_secs_f64());
				}
			}
		}
	}

	subscriber.close();
	Ok(())
}
