use std::time::Duration;

use nitros::discovery;

fn scan_timeout(seconds: f64) -> anyhow::Result<Duration> {
	if !(seconds > 0.0) {
		anyhow::bail!("timeout must be positive");
	}
	Ok(Duration::from_secs_f64(seconds))
}

pub async fn list(timeout: f64) -> anyhow::Result<()> {
	let timeout = scan_timeout(timeout)?;
	println!("Scanning for topics ({}s)...", timeout.as_secs_f64());

	let topics = tokio::task::spawn_blocking(move || discovery::scan(timeout)).await??;

	if topics.is_empty() {
		println!("No active topics found.");
		return Ok(());
	}

	let width = topics.keys().map(|topic| topic.len()).max().unwrap_or(0).max(5);

	println!();
	println!("{:<width$}  Publishers", "Topic");
	println!("{}  ----------", "-".repeat(width));
	for (topic, publishers) in &topics {
		println!("{topic:<width$}  {}", publishers.len());
	}

	Ok(())
}

pub async fn info(topic: String, timeout: f64) -> anyhow::Result<()> {
	let timeout = scan_timeout(timeout)?;
	println!("Scanning for {topic:?} ({}s)...", timeout.as_secs_f64());

	let topics = tokio::task::spawn_blocking(move || discovery::scan(timeout)).await??;

	let Some(publishers) = topics.get(&topic) else {
		anyhow::bail!("topic {topic:?} not found");
	};

	println!();
	println!("Topic: {topic}");
	println!("Publishers: {}", publishers.len());
	for (i, publisher) in publishers.iter().enumerate() {
		let compression = match publisher.compression {
			Some(mode) => mode.as_str(),
			None => "none",
		};
		println!("  [{i}] {}:{}  compression={compression}", publisher.host, publisher.port);
	}

	Ok(())
}
