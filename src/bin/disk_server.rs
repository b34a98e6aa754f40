// SPDX-License-Identifier: MIT OR Apache-2.0

use clap::Parser;
use csfs::disk::{DiskServer, Geometry};
use signal_hook::consts::SIGINT;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "disk_server",
    version = env!("CARGO_PKG_VERSION"),
    about = "Simulated block-device server: cylinders x sectors of 128-byte blocks over TCP"
)]
struct Cli {
    /// TCP port to listen on
    port: u16,

    /// Number of cylinders
    #[arg(value_parser = clap::value_parser!(u32).range(1..))]
    cylinders: u32,

    /// Sectors per cylinder
    #[arg(value_parser = clap::value_parser!(u32).range(1..))]
    sectors: u32,

    /// Track-to-track seek time in microseconds
    track_us: u64,

    /// Backing file for the disk image (created if absent)
    backing_file: PathBuf,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let stop = Arc::new(AtomicBool::new(false));
    if let Err(err) = signal_hook::flag::register(SIGINT, Arc::clone(&stop)) {
        eprintln!("disk_server: cannot install signal handler: {err}");
        return ExitCode::from(1);
    }

    let geometry = match Geometry::new(cli.cylinders, cli.sectors) {
        Ok(geometry) => geometry,
        Err(err) => {
            eprintln!("disk_server: {err}");
            return ExitCode::from(2);
        }
    };

    let server = match DiskServer::bind(
        ("0.0.0.0", cli.port),
        geometry,
        cli.track_us,
        &cli.backing_file,
    ) {
        Ok(server) => server,
        Err(err) => {
            eprintln!("disk_server: {err}");
            return ExitCode::from(1);
        }
    };

    match server.run(&stop) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("disk_server: {err}");
            ExitCode::from(1)
        }
    }
}
