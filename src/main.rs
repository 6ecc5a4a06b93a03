mod analysis;
mod annotation;
mod artists;
mod error;
mod parse;
mod plot;
mod refresh;
mod scpi;
mod settings;
mod snapshot;

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Parser;
use log::{error, info, warn};

use crate::plot::ViewConfig;
use crate::refresh::CancellationToken;
use crate::scpi::Sds;
use crate::settings::Settings;
use crate::snapshot::SnapshotRequest;

/// Display FFT and calculate THD for a channel on a Siglent SDS1202X-E oscilloscope.
#[derive(Parser, Debug)]
#[command(name = "thd_viewer", version)]
struct Cli {
    /// Channel to display
    #[arg(short = 'c', long = "channel", value_parser = clap::value_parser!(u8).range(1..=2))]
    channel: u8,

    /// Fundamental frequency (in Hz)
    #[arg(long = "f0", default_value_t = 1_000, value_name = "FREQ")]
    f0: u32,

    /// Maximum frequency to display / use for calculations (in Hz)
    #[arg(long = "max-f", default_value_t = 25_000, value_name = "FREQ")]
    max_f: u32,

    /// Minimum level of harmonics (in dBVrms)
    #[arg(short = 'f', long = "floor", default_value_t = -85, allow_negative_numbers = true)]
    floor: i32,

    /// IP address of the oscilloscope
    #[arg(long = "ip")]
    ip: String,

    /// Port on which the oscilloscope is listening
    #[arg(long = "port", default_value_t = 5025)]
    port: u16,

    /// Plot title
    #[arg(short = 't', long = "title", value_name = "NAME")]
    title: Option<String>,

    /// Window title
    #[arg(short = 'w', long = "window", value_name = "NAME")]
    window: Option<String>,

    /// Report harmonics at their nominal frequency instead of the nearest peak
    #[arg(long = "no-correct-peaks")]
    no_correct_peaks: bool,

    /// YAML file with instrument and display settings
    #[arg(long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable logging (honours RUST_LOG)
    #[arg(long = "enable-logs")]
    enable_logs: bool,
}

impl Cli {
    fn snapshot_request(&self) -> Result<SnapshotRequest> {
        if self.f0 == 0 || self.max_f == 0 {
            return Err(anyhow!("--f0 and --max-f must be positive"));
        }
        if self.f0 >= self.max_f {
            return Err(anyhow!(
                "--f0 ({} Hz) must be below --max-f ({} Hz)",
                self.f0,
                self.max_f
            ));
        }
        Ok(SnapshotRequest {
            channel: self.channel - 1,
            fundamental_hz: self.f0,
            max_freq_hz: self.max_f,
            correct_peaks: !self.no_correct_peaks,
            min_level_db: self.floor,
        })
    }

    fn describe(&self) -> String {
        format!(
            "channel={} f0={} max_f={} floor={} ip={} port={} title={} window={} correct_peaks={}",
            self.channel,
            self.f0,
            self.max_f,
            self.floor,
            self.ip,
            self.port,
            self.title.as_deref().unwrap_or("None"),
            self.window.as_deref().unwrap_or("None"),
            !self.no_correct_peaks,
        )
    }

    fn view_config(&self, settings: &Settings) -> ViewConfig {
        ViewConfig {
            window_title: self.window.clone().unwrap_or_else(|| "THD Viewer".to_string()),
            plot_title: self
                .title
                .clone()
                .unwrap_or_else(|| format!("FFT Channel {}", self.channel)),
            max_freq_khz: self.max_f as f64 / 1000.0,
            display: settings.display.clone(),
        }
    }
}

fn main() {
    let cli = Cli::parse();

    if cli.enable_logs {
        // Don't override RUST_LOG if it's already set
        if std::env::var("RUST_LOG").is_err() {
            std::env::set_var("RUST_LOG", "thd_viewer=info");
        }
        env_logger::init();
    }

    let logs_enabled = cli.enable_logs;
    if let Err(e) = run(cli) {
        if logs_enabled {
            error!("Application encountered an error: {:?}", e);
        } else {
            eprintln!("Error: {:?}", e);
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let settings = match &cli.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };

    println!("thd_viewer was called with the following arguments:");
    println!("{}", cli.describe());
    println!();

    let request = cli.snapshot_request()?;
    let view = cli.view_config(&settings);

    println!("Connecting to oscilloscope at {}:{} ...", cli.ip, cli.port);
    let sds = Sds::connect(&cli.ip, cli.port, &settings.instrument)?;
    println!("Connected.");
    info!("Instrument link open at {}", sds.addr());

    println!("Creating window ...");
    let token = CancellationToken::new();
    let (outcome_tx, outcome_rx) = crossbeam_channel::bounded(1);
    println!("Starting loop ...");
    let gui_result = plot::run_native(sds, request, view, token.clone(), outcome_tx);

    // Let an in-flight fetch finish before reporting.
    token.cancel();
    let outcome = outcome_rx.recv();

    if let Err(e) = gui_result {
        return Err(anyhow!("GUI error: {}", e));
    }

    match outcome {
        Ok(Ok(summary)) => {
            info!("Refresh loop finished after {} cycles", summary.cycles);
            println!("Quit");
            Ok(())
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => {
            warn!("Refresh loop never reported back");
            Err(anyhow!("refresh loop ended without reporting an outcome"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("thd_viewer").chain(args.iter().copied()))
    }

    #[test]
    fn defaults_match_the_help_text() {
        let cli = parse(&["-c", "2", "--ip", "192.168.1.20"]).unwrap();
        assert_eq!(cli.port, 5025);
        let request = cli.snapshot_request().unwrap();
        assert_eq!(
            request,
            SnapshotRequest {
                channel: 1,
                fundamental_hz: 1000,
                max_freq_hz: 25_000,
                correct_peaks: true,
                min_level_db: -85,
            }
        );
        let view = cli.view_config(&Settings::default());
        assert_eq!(view.plot_title, "FFT Channel 2");
        assert_eq!(view.max_freq_khz, 25.0);
    }

    #[test]
    fn negative_floor_and_titles() {
        let cli = parse(&[
            "-c", "1", "--ip", "10.0.0.5", "-f", "-100", "-t", "DUT", "-w", "Bench", "--no-correct-peaks",
        ])
        .unwrap();
        let request = cli.snapshot_request().unwrap();
        assert_eq!(request.min_level_db, -100);
        assert!(!request.correct_peaks);
        let view = cli.view_config(&Settings::default());
        assert_eq!(view.plot_title, "DUT");
        assert_eq!(view.window_title, "Bench");
    }

    #[test]
    fn channel_must_be_one_or_two() {
        assert!(parse(&["-c", "0", "--ip", "h"]).is_err());
        assert!(parse(&["-c", "3", "--ip", "h"]).is_err());
        assert!(parse(&["--ip", "h"]).is_err());
        assert!(parse(&["-c", "1"]).is_err());
    }

    #[test]
    fn fundamental_must_lie_below_max_frequency() {
        let cli = parse(&["-c", "1", "--ip", "h", "--f0", "30000"]).unwrap();
        assert!(cli.snapshot_request().is_err());
        let cli = parse(&["-c", "1", "--ip", "h", "--f0", "0"]).unwrap();
        assert!(cli.snapshot_request().is_err());
    }
}
