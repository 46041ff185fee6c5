use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::info;

use ytview::config::{self, EngineKind};

#[derive(Parser)]
#[command(
    name = "ytv",
    version = env!("YTVIEW_LONG_VERSION"),
    about = "Browse and watch videos inside a Kitty-graphics terminal"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Log output file path (enables logging when specified)
    #[arg(long, global = true)]
    log: Option<PathBuf>,

    /// Decode engine (overrides the config file)
    #[arg(long, global = true, value_enum)]
    engine: Option<EngineKind>,

    /// Worker threads for feed, stream and thumbnail tasks
    #[arg(long, global = true)]
    workers: Option<usize>,
}

#[derive(Subcommand)]
enum Command {
    /// Play a synthetic test card to check terminal graphics support
    Testcard {
        /// How long to play, in seconds
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
    /// Print terminal cell geometry and the negotiated video resolution
    Probe,
}

fn main() {
    let cli = Cli::parse();

    if let Some(log_path) = &cli.log {
        let file = match std::fs::File::create(log_path) {
            Ok(f) => f,
            Err(e) => {
                eprintln!("Error: failed to open log file {}: {e}", log_path.display());
                std::process::exit(1);
            }
        };
        env_logger::Builder::from_default_env()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();
    } else if matches!(cli.command, Some(Command::Probe)) {
        env_logger::init();
    }
    // interactive modes + no --log: logger not initialized (stderr is the UI)

    let mut cfg = match config::load_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    };
    cfg.merge_cli(cli.engine, cli.workers);
    let config = cfg.resolve();
    info!("ytv {}", env!("YTVIEW_LONG_VERSION"));

    let result = match cli.command {
        Some(Command::Testcard { seconds }) => ytview::app::testcard(&config, seconds),
        Some(Command::Probe) => ytview::app::probe(&config),
        None => ytview::app::run(config),
    };

    if let Err(e) = result {
        let msg = format!("{e:#}");
        if msg.contains("[BUG]") {
            eprintln!("\x1b[1;31m{msg}\x1b[0m");
        } else {
            eprintln!("Error: {msg}");
        }
        std::process::exit(1);
    }
}
