// SPDX-License-Identifier: MIT OR Apache-2.0

use clap::Parser;
use csfs::fs::FsServer;
use signal_hook::consts::SIGINT;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "fs_server",
    version = env!("CARGO_PKG_VERSION"),
    about = "Flat filesystem server layered on the block-device service"
)]
struct Cli {
    /// TCP port to listen on for filesystem clients
    listen_port: u16,

    /// Host of the disk service
    disk_host: String,

    /// Port of the disk service
    disk_port: u16,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let stop = Arc::new(AtomicBool::new(false));
    if let Err(err) = signal_hook::flag::register(SIGINT, Arc::clone(&stop)) {
        eprintln!("fs_server: cannot install signal handler: {err}");
        return ExitCode::from(1);
    }

    let server = match FsServer::bind(
        ("0.0.0.0", cli.listen_port),
        (cli.disk_host.as_str(), cli.disk_port),
    ) {
        Ok(server) => server,
        Err(err) => {
            eprintln!("fs_server: {err}");
            return ExitCode::from(1);
        }
    };

    match server.run(&stop) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("fs_server: {err}");
            ExitCode::from(1)
        }
    }
}
