mod errors;
mod payload;
mod phase;
mod probe;
mod server;
mod session;
mod stats;
mod transfer;

use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use colored::Colorize;
use url::Url;

use crate::errors::exit_codes;
use crate::session::{
    ProgressObserver, Session, SessionConfig, SessionState, Snapshot,
    DEFAULT_DOWNLOAD_BYTES, DEFAULT_PARALLEL, DEFAULT_PINGS,
    DEFAULT_UPLOAD_BYTES,
};

#[derive(Parser)]
#[command(version, long_version = long_version(), about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    verbosity: Verbosity<WarnLevel>,
}

#[derive(Subcommand)]
enum Command {
    /// Run one measurement session against a linespeed server
    Test {
        /// Base URL of the server to measure against
        #[arg(long, default_value = "http://127.0.0.1:3210")]
        server: Url,

        /// Number of sequential latency probes
        #[arg(long, default_value_t = DEFAULT_PINGS, value_parser = clap::value_parser!(u32).range(1..))]
        pings: u32,

        /// Parallel streams per bandwidth phase
        #[arg(long, default_value_t = DEFAULT_PARALLEL, value_parser = clap::value_parser!(u32).range(1..))]
        parallel: u32,

        /// Bytes each download stream fetches
        #[arg(long, default_value_t = DEFAULT_DOWNLOAD_BYTES)]
        download_bytes: u64,

        /// Bytes each upload stream sends
        #[arg(long, default_value_t = DEFAULT_UPLOAD_BYTES)]
        upload_bytes: u64,

        /// Per-operation timeout in seconds
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,

        /// Print the final snapshot as JSON instead of the console report
        #[arg(long)]
        json: bool,
    },
    /// Run the measurement server
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:3210")]
        bind: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.verbosity.log_level_filter())
        .init();

    match cli.command {
        Command::Test {
            server,
            pings,
            parallel,
            download_bytes,
            upload_bytes,
            timeout_secs,
            json,
        } => {
            let mut config = SessionConfig::new(server);
            config.pings = pings;
            config.parallel = parallel;
            config.download_bytes = download_bytes;
            config.upload_bytes = upload_bytes;
            config.timeout = Duration::from_secs(timeout_secs);

            run_test(config, json).await
        }
        Command::Serve { bind } => {
            server::serve(bind).await?;
            Ok(())
        }
    }
}

async fn run_test(
    config: SessionConfig,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut session = Session::new(config)?;
    if !json {
        session = session.with_observer(Arc::new(ConsoleReporter::default()));
    }
    let session = Arc::new(session);

    // Ctrl-c aborts the in-flight run; the session surfaces it as a
    // cancellation failure instead of tearing the process down.
    let abort_on_ctrl_c = {
        let session = session.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                session.abort();
            }
        })
    };

    let snapshot = session.run().await;
    abort_on_ctrl_c.abort();

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print_report(&snapshot);
    }

    if snapshot.state == SessionState::Failed {
        let code = session
            .error_kind()
            .map(|kind| kind.exit_code())
            .unwrap_or(exit_codes::UNKNOWN_ERROR);
        std::process::exit(code);
    }

    Ok(())
}

fn print_report(snapshot: &Snapshot) {
    match snapshot.state {
        SessionState::Completed => {
            println!(
                "{} {}",
                "Latency:".bold().white(),
                format_ms(snapshot.average_latency_ms).bright_cyan()
            );
            println!(
                "{} {}",
                "Jitter:".bold().white(),
                format_ms(snapshot.jitter_ms).bright_cyan()
            );
            println!(
                "{} {}",
                "Download:".bold().white(),
                format_mbps(snapshot.download_mbps).bright_cyan()
            );
            println!(
                "{} {}",
                "Upload:".bold().white(),
                format_mbps(snapshot.upload_mbps).bright_cyan()
            );
        }
        SessionState::Failed => {
            let message =
                snapshot.error.as_deref().unwrap_or("session failed");
            eprintln!("{} {}", "Error:".bold().red(), message);
        }
        _ => {}
    }
}

fn format_ms(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.1} ms", v))
        .unwrap_or_else(|| "-- ms".to_string())
}

fn format_mbps(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.2} Mbps", v))
        .unwrap_or_else(|| "-- Mbps".to_string())
}

/// Prints phase status lines and a live percentage to stdout.
#[derive(Default)]
struct ConsoleReporter {
    last: Mutex<(Option<SessionState>, u8)>,
}

impl ProgressObserver for ConsoleReporter {
    fn on_update(&self, snapshot: &Snapshot) {
        let mut last = self.last.lock().unwrap();
        let (last_state, last_percent) = &mut *last;

        if *last_state != Some(snapshot.state) {
            if last_state.map(|s| s.is_running()).unwrap_or(false) {
                println!();
            }
            if let Some(label) = phase_label(snapshot.state) {
                println!("{}", label.bold().white());
            }
            *last_state = Some(snapshot.state);
        }

        if snapshot.state.is_running()
            && snapshot.progress_percent != *last_percent
        {
            print!("\r  {:>3}%", snapshot.progress_percent);
            let _ = io::stdout().flush();
            *last_percent = snapshot.progress_percent;
        }
    }
}

fn phase_label(state: SessionState) -> Option<&'static str> {
    match state {
        SessionState::MeasuringLatency => Some("Measuring latency"),
        SessionState::MeasuringDownload => Some("Measuring download"),
        SessionState::MeasuringUpload => Some("Measuring upload"),
        _ => None,
    }
}

/// Version string including the git revision baked in by build.rs.
fn long_version() -> String {
    match option_env!("LINESPEED_BUILD_GIT_HASH") {
        Some(rev) => format!("{} (rev {})", env!("CARGO_PKG_VERSION"), rev),
        None => env!("CARGO_PKG_VERSION").to_string(),
    }
}
