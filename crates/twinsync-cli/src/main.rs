//! CLI for twinsync: how closely is the twin tracking the device?

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "twinsync")]
#[command(about = "twinsync — digital twin synchronization monitor (ODTE lifecycle tracking)")]
#[command(version = twinsync_core::VERSION)]
struct Cli {
    /// Debug-level logging (RUST_LOG still takes precedence)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a digital twin behind the HTTP surface until Ctrl+C
    Run {
        /// Twin configuration file (JSON). Defaults are used when omitted.
        #[arg(long)]
        config: Option<String>,

        /// Override http.host
        #[arg(long)]
        host: Option<String>,

        /// Override http.port
        #[arg(long)]
        port: Option<u16>,

        /// Record delays, ODTE evaluations and transitions to a session directory
        #[arg(long)]
        record: bool,

        /// Session output directory (overrides recording.output_dir)
        #[arg(long)]
        sessions_dir: Option<String>,

        /// Session tags as key:value pairs
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Session note
        #[arg(long)]
        note: Option<String>,
    },

    /// Compute ODTE offline for a list of delay samples
    Odte {
        /// Comma-separated delay samples in seconds (e.g. "0.1,0.3,0.9")
        #[arg(long)]
        samples: String,

        /// Desired timeliness in seconds
        #[arg(long, default_value = "0.5")]
        desired: f64,

        /// Expected message rate (messages per second)
        #[arg(long, default_value = "1.0")]
        rate: f64,

        /// Sliding window length in seconds
        #[arg(long, default_value = "10.0")]
        window: f64,

        /// Constant availability sub-score
        #[arg(long, default_value = "1.0")]
        availability: f64,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Drive an in-process twin with a simulated device
    Simulate {
        /// Twin configuration file (JSON). Defaults are used when omitted.
        #[arg(long)]
        config: Option<String>,

        /// Payload shape published by the device
        #[arg(long, value_parser = ["single_value", "composite"])]
        mode: Option<String>,

        /// Device publish rate (messages per second)
        #[arg(long, default_value = "1.0")]
        rate: f64,

        /// Base link delay in milliseconds
        #[arg(long, default_value = "100")]
        delay_ms: u64,

        /// Extra random link delay in milliseconds, uniform in [0, jitter]
        #[arg(long, default_value = "50")]
        jitter_ms: u64,

        /// Probability in [0, 1] that a message is lost on the link
        #[arg(long, default_value = "0.0")]
        drop: f64,

        /// Stop after this long (e.g. "30s", "5m"); default: until Ctrl+C
        #[arg(long)]
        duration: Option<String>,

        /// Also serve the HTTP surface on http.host:http.port
        #[arg(long)]
        serve: bool,
    },

    /// Print the effective configuration as JSON
    Config {
        /// Configuration file to load and validate. Defaults are printed when omitted.
        #[arg(long)]
        config: Option<String>,

        /// Write to this path instead of stdout
        #[arg(long)]
        output: Option<String>,
    },

    /// List recorded sessions, or inspect one
    Sessions {
        /// Path to a specific session directory to inspect
        session: Option<String>,

        /// Directory containing session recordings
        #[arg(long, default_value = "sessions")]
        dir: String,
    },
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp_millis()
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Run {
            config,
            host,
            port,
            record,
            sessions_dir,
            tags,
            note,
        } => commands::run::run(
            config.as_deref(),
            host.as_deref(),
            port,
            record,
            sessions_dir.as_deref(),
            &tags,
            note.as_deref(),
        ),
        Commands::Odte {
            samples,
            desired,
            rate,
            window,
            availability,
            json,
        } => commands::odte::run(&samples, desired, rate, window, availability, json),
        Commands::Simulate {
            config,
            mode,
            rate,
            delay_ms,
            jitter_ms,
            drop,
            duration,
            serve,
        } => commands::simulate::run(
            config.as_deref(),
            mode.as_deref(),
            rate,
            delay_ms,
            jitter_ms,
            drop,
            duration.as_deref(),
            serve,
        ),
        Commands::Config { config, output } => {
            commands::config::run(config.as_deref(), output.as_deref())
        }
        Commands::Sessions { session, dir } => commands::sessions::run(session.as_deref(), &dir),
    }
}
