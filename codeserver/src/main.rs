mod config;
mod dispatcher;
mod executors;
mod location;
mod message;
mod pool;
mod session;
mod transport;

use clap::Parser;
use config::DispatcherConfig;
use dispatcher::Dispatcher;
use executors::ProcessWorkers;
use std::{io, path::PathBuf, process::ExitCode};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use transport::inbox::Inbox;

/// Turns candidate points of a tuning session into generated code on a pool of slaves
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Directory shared with the search server, must match its codegen path
    inbox: PathBuf,

    /// YAML file with dispatcher settings
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(log_json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("codeserver=info"));
    let registry = tracing_subscriber::registry().with(filter);

    if log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .init();
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.log_json);

    if !args.inbox.is_dir() {
        error!(
            "{} is not a valid directory, it has to match the codegen path of the search server",
            args.inbox.to_string_lossy()
        );
        return ExitCode::FAILURE;
    }

    let settings = match args.config {
        Some(ref path) => match DispatcherConfig::load(path) {
            Ok(settings) => settings,
            Err(error) => {
                error!("Failed to load {}: {error}", path.to_string_lossy());
                return ExitCode::FAILURE;
            }
        },
        None => DispatcherConfig::default(),
    };

    if settings.preflight_checks() {
        info!("Continuing despite configuration warnings");
    }

    let mut dispatcher = Dispatcher::new(Inbox::new(args.inbox), settings, ProcessWorkers::new());

    match dispatcher.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("{error}");
            ExitCode::FAILURE
        }
    }
}
