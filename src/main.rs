mod capture;
mod debug_log;
mod dsp;
mod error;
mod metadata;
mod pipeline;
mod protocol;
mod settings;

use clap::Parser;
use error::PipelineError;
use settings::Settings;
use std::process;
use std::thread;
use std::time::Duration;

/// How many times a `DeviceChanged` condition triggers a full pipeline
/// restart before giving up.
const MAX_RESTARTS: u32 = 10;

/// Delay before exiting on a fatal condition, so the message is readable
/// when the process was launched from a double-click.
const SHUTDOWN_DELAY: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "glowcast")]
#[command(version = "0.2.0")]
#[command(about = "Streams an 8-band audio spectrum plus now-playing text over serial to a glowbit LED matrix", long_about = None)]
struct Cli {
    /// Serial device the display is attached to (overrides config)
    #[arg(short, long)]
    port: Option<String>,

    /// Show a clock instead of now-playing metadata
    #[arg(long)]
    clock: bool,

    /// strftime pattern for the clock title line
    #[arg(long)]
    title_format: Option<String>,

    /// strftime pattern for the clock subtitle line
    #[arg(long)]
    subtitle_format: Option<String>,

    /// Write diagnostics to /tmp/glowcast.log
    #[arg(short, long)]
    debug: bool,
}

fn main() {
    let cli = Cli::parse();

    let mut settings = Settings::load();
    if let Some(port) = cli.port {
        settings.port = port;
    }
    if cli.clock {
        settings.use_metadata = false;
    }
    if let Some(format) = cli.title_format {
        settings.title_format = format;
    }
    if let Some(format) = cli.subtitle_format {
        settings.subtitle_format = format;
    }

    let mut restarts = 0;
    loop {
        match pipeline::run(&settings, cli.debug) {
            Ok(()) => break,
            Err(PipelineError::DeviceChanged) if restarts < MAX_RESTARTS => {
                restarts += 1;
                eprintln!(
                    "Audio device changed, restarting ({}/{})",
                    restarts, MAX_RESTARTS
                );
            }
            Err(err) => {
                eprintln!("{}", err);
                eprintln!("Exiting in {}s", SHUTDOWN_DELAY.as_secs());
                thread::sleep(SHUTDOWN_DELAY);
                process::exit(1);
            }
        }
    }
}
