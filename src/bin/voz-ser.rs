//! Serial bridge: exposes the detector and preprocessor to an embedded host
//! over a framed UART protocol and drives the status/interrupt GPIO lines.
//!
//! Exit codes tell the supervising wrapper what to do next: 0 done,
//! 1 restart, 2 restart with retry backoff, 5 fatal, 6 stop requested.

use std::path::PathBuf;

use clap::Parser;
use nix::sys::signal::Signal;

use voz::gpio::LineSpec;
use voz::serial::control::{EXIT_FATAL, EXIT_RESTART_RETRY};
use voz::serial::{Controller, ControllerConfig};
use voz::sigpipe::SignalPipe;
use voz::VozError;

#[derive(Parser)]
#[command(name = "voz-ser", version, about = "Serial control bridge")]
struct Args {
    /// UART device
    #[arg(long, default_value = "/dev/ttyS1")]
    device: String,

    /// Interrupt line, gpiochipN:line (active-low pulse on wake match)
    #[arg(long = "int")]
    int: Option<LineSpec>,

    /// Status LED line, gpiochipN:line
    #[arg(long = "led")]
    led: Option<LineSpec>,

    /// Directory scanned for wake-word models
    #[arg(long, default_value = "models/wakewords")]
    wwmodeldir: PathBuf,

    /// Directory holding the mel and embedding base models
    #[arg(long, default_value = "models")]
    basemodeldir: PathBuf,
}

fn main() {
    env_logger::init();
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = match e.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 0,
                _ => EXIT_FATAL,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let signals =
        match SignalPipe::install(&[Signal::SIGINT, Signal::SIGTERM, Signal::SIGCHLD]) {
            Ok(s) => s,
            Err(e) => {
                log::error!("signal setup: {}", e);
                std::process::exit(EXIT_FATAL);
            }
        };

    let cfg = ControllerConfig {
        device: args.device,
        ww_model_dir: args.wwmodeldir,
        base_model_dir: args.basemodeldir,
        led: args.led,
        int: args.int,
    };
    let mut controller = match Controller::new(cfg) {
        Ok(c) => c,
        Err(e) => {
            log::error!("setup: {}", e);
            // an unopenable port may come back; bad config will not
            let code = match e {
                VozError::Io(_) => EXIT_RESTART_RETRY,
                _ => EXIT_FATAL,
            };
            std::process::exit(code);
        }
    };

    std::process::exit(controller.run(&signals));
}
