//! duskdm daemon binary
//!
//! Runs the display-manager daemon, or — re-exec'd by the daemon itself
//! with `--session-child` — the privileged per-session helper.

use std::env;
use std::path::PathBuf;
use std::process;

use anyhow::Result;
use log::error;

use duskdm::config::Config;
use duskdm::daemon::Daemon;
use duskdm::session_child;

fn main() {
    let args: Vec<String> = env::args().collect();

    // Helper mode is dispatched before anything else: no logger, no
    // config, just the two inherited pipe fds.
    if args.len() >= 2 && args[1] == "--session-child" {
        if args.len() != 4 {
            eprintln!("Usage: duskdm --session-child <READFD> <WRITEFD>");
            process::exit(1);
        }
        match (args[2].parse(), args[3].parse()) {
            (Ok(read_fd), Ok(write_fd)) => process::exit(session_child::run(read_fd, write_fd)),
            _ => {
                eprintln!("duskdm: --session-child fds must be integers");
                process::exit(1);
            }
        }
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config_path: Option<PathBuf> = None;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--config" => {
                i += 1;
                match args.get(i) {
                    Some(path) => config_path = Some(PathBuf::from(path)),
                    None => {
                        eprintln!("Error: {} requires a path", args[i - 1]);
                        process::exit(1);
                    }
                }
            }
            "-h" | "--help" => {
                print_usage();
                return;
            }
            "-V" | "--version" => {
                println!("duskdm {}", env!("CARGO_PKG_VERSION"));
                return;
            }
            other => {
                eprintln!("Error: Unknown argument '{other}'");
                print_usage();
                process::exit(1);
            }
        }
        i += 1;
    }

    let config = match config_path {
        Some(path) => match Config::from_file(&path) {
            Some(config) => config,
            None => {
                eprintln!("Error: Cannot read config file {}", path.display());
                process::exit(1);
            }
        },
        None => Config::load(),
    };

    if let Err(e) = run(config) {
        error!("{e:#}");
        process::exit(1);
    }
}

fn run(config: Config) -> Result<()> {
    let mut daemon = Daemon::new(config)?;
    daemon.run()
}

fn print_usage() {
    println!("duskdm - display manager daemon");
    println!();
    println!("Usage: duskdm [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -c, --config <PATH>  Configuration file (default: /etc/duskdm/duskdm.conf)");
    println!("  -h, --help           Show this help");
    println!("  -V, --version        Show version");
}
