//! ctmirrord: replicates kernel connection-tracking state between
//! firewall peers so in-flight flows survive a failover.

use clap::{Parser, Subcommand};
use ctmirror_core::{
    Config, ControlClient, ControlCommand, CoreError, Daemon, NullSource,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Daemon configuration file.
    #[arg(short, long, default_value = "/etc/ctmirrord.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon in the foreground.
    Start,
    /// Ask a running daemon to shut down cleanly.
    Stop,
    /// Print a cache dump from the running daemon.
    Dump {
        #[arg(long)]
        xml: bool,
        /// Dump the external cache instead of the internal one.
        #[arg(long)]
        external: bool,
    },
    /// Flush the daemon's caches.
    Flush {
        #[arg(long)]
        internal: bool,
        #[arg(long)]
        external: bool,
    },
    /// Print daemon statistics.
    Stats {
        /// Include the expectation caches.
        #[arg(long)]
        cache: bool,
    },
    /// Immediately terminate a running daemon.
    Kill,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(CoreError::Config(err)) => {
            eprintln!("ctmirrord: {}", err);
            ExitCode::from(1)
        }
        Err(err) => {
            eprintln!("ctmirrord: {}", err);
            ExitCode::from(2)
        }
    }
}

fn run(args: Args) -> Result<(), CoreError> {
    let config = Config::load(&args.config)?;

    match args.command {
        Command::Start => start(config),
        Command::Stop | Command::Kill => request(&config, ControlCommand::Kill),
        Command::Dump { xml, external } => {
            let cmd = match (external, xml) {
                (false, false) => ControlCommand::DumpInternal,
                (false, true) => ControlCommand::DumpInternalXml,
                (true, false) => ControlCommand::DumpExternal,
                (true, true) => ControlCommand::DumpExternalXml,
            };
            request(&config, cmd)
        }
        Command::Flush { internal, external } => {
            let cmd = match (internal, external) {
                (true, false) => ControlCommand::FlushInternal,
                (false, true) => ControlCommand::FlushExternal,
                _ => ControlCommand::FlushCaches,
            };
            request(&config, cmd)
        }
        Command::Stats { cache } => {
            let cmd = if cache {
                ControlCommand::StatsCache
            } else {
                ControlCommand::Stats
            };
            request(&config, cmd)
        }
    }
}

fn start(config: Config) -> Result<(), CoreError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .map_err(|_| CoreError::ResourceExhausted("signal handler"))?;

    let mut daemon = Daemon::new(config, Box::new(NullSource), shutdown)?;
    if let Err(err) = daemon.run() {
        error!(%err, "daemon exited with error");
        return Err(err);
    }
    Ok(())
}

fn request(config: &Config, cmd: ControlCommand) -> Result<(), CoreError> {
    let own_path = std::env::temp_dir().join(format!("ctmirror-cli-{}.sock", std::process::id()));
    let client = ControlClient::connect(&config.control_socket, &own_path)?;
    let response = client.request(cmd)?;
    if !response.is_empty() {
        print!("{}", response);
    }
    Ok(())
}
