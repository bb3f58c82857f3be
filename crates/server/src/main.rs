// Copyright 2025-2026 CEMAXECUTER LLC

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;

use ns_server::logging;
use ns_server::server::Server;

#[derive(Parser, Debug)]
#[command(name = "netsdr-server")]
#[command(about = "Serve a local SDR device to remote clients over TCP")]
#[command(disable_help_flag = true)]
struct Cli {
    /// Listen host or IP
    #[arg(short = 'h', long, default_value = "0.0.0.0")]
    host: String,

    /// Listen port
    #[arg(short = 'p', long, default_value_t = ns_rpc::DEFAULT_PORT)]
    port: u16,

    /// Print help
    #[arg(short = '?', long = "help", action = clap::ArgAction::Help)]
    help: Option<bool>,
}

fn main() {
    let logger = logging::init();
    let cli = Cli::parse();

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        eprintln!("\ninterrupted, stopping...");
        r.store(false, Ordering::SeqCst);
    })
    .expect("failed to set Ctrl-C handler");

    println!("netsdr-server: listening on {}:{}", cli.host, cli.port);

    let server = match Server::bind(&cli.host, cli.port, logger) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(e.exit_code());
        }
    };
    if let Err(e) = server.run(running) {
        eprintln!("error: {}", e);
        std::process::exit(e.exit_code());
    }
}
