mod echo;
mod hz;
mod list;
mod log;

use clap::{Parser, Subcommand};

#[derive(Parser, Clone)]
#[command(name = "nitros", about = "NitROS topic inspection tools", version)]
struct Cli {
	#[command(flatten)]
	log: log::Log,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Clone)]
enum Command {
	/// Inspect and debug live topics.
	#[command(subcommand)]
	Topic(TopicCommand),
}

#[derive(Subcommand, Clone)]
enum TopicCommand {
	/// List active topics on the network.
	List {
		/// Scan duration in seconds.
		#[arg(long, short, default_value_t = 2.0)]
		timeout: f64,
	},
	/// Print messages published on a topic.
	Echo {
		/// The topic name.
		topic: String,
	},
	/// Measure the publish rate of a topic.
	Hz {
		/// The topic name.
		topic: String,

		/// Window size for the rate estimate.
		#[arg(long, short, default_value_t = 100)]
		window: usize,
	},
	/// Show the publishers of a topic.
	Info {
		/// The topic name.
		topic: String,

		/// Scan duration in seconds.
		#[arg(long, short, default_value_t = 2.0)]
		timeout: f64,
	},
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	cli.log.init();

	match cli.command {
		Command::Topic(TopicCommand::List { timeout }) => list::list(timeout).await,
		Command::Topic(TopicCommand::Echo { topic }) => echo::echo(topic).await,
		Command::Topic(TopicCommand::Hz { topic, window }) => hz::hz(topic, window).await,
		Command::Topic(TopicCommand::Info { topic, timeout }) => list::info(topic, timeout).await,
	}
}
