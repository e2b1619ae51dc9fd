use clap::Args;
use tracing_subscriber::EnvFilter;

/// Logging options shared by every subcommand.
#[derive(Args, Clone, Default)]
pub struct Log {
	/// Increase log verbosity (-v, -vv).
	#[arg(long, short, action = clap::ArgAction::Count, global = true)]
	pub verbose: u8,
}

impl Log {
	pub fn init(&self) {
		let default = match self.verbose {
			0 => "warn",
			1 => "info,nitros=debug",
			_ => "trace",
		};

		let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

		tracing_subscriber::fmt()
			.with_env_filter(filter)
			.with_writer(std::io::stderr)
			.init();
	}
}
