use nitros::{Subscriber, SubscriberConfig, Value};

pub async fn echo(topic: String) -> anyhow::Result<()> {
	let mut subscriber = Subscriber::new(
		topic.as_str(),
		|value: Value| println!("{value}"),
		SubscriberConfig::default(),
	)?;

	println!("Listening on {topic:?} (Ctrl+C to stop)...");
	tokio::signal::ctrl_c().await?;

	subscriber.close();
	Ok(())
}
