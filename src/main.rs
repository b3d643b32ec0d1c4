//! Headless server binary: hosts the simulation, serves TCP clients, and
//! exposes an administrative console on stdin.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use nanokit::config::SimulationConfig;
use nanokit::server::{AdminCommand, Server};
use nanokit::simulation::Simulation;
use nanokit::streams::ChannelStreamHub;

fn usage() -> ! {
    eprintln!(
        "usage: nanokit-server [--config <file.ron>] [--load <state file>] [--bind <addr:port>]"
    );
    std::process::exit(2);
}

fn main() {
    env_logger::init();

    let mut config_path: Option<PathBuf> = None;
    let mut state_path: Option<PathBuf> = None;
    let mut bind = "0.0.0.0:26000".to_string();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config_path = Some(args.next().unwrap_or_else(|| usage()).into()),
            "--load" => state_path = Some(args.next().unwrap_or_else(|| usage()).into()),
            "--bind" => bind = args.next().unwrap_or_else(|| usage()),
            _ => usage(),
        }
    }

    let config = match &config_path {
        Some(path) => match SimulationConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("cannot load configuration {}: {err}", path.display());
                std::process::exit(1);
            }
        },
        None => SimulationConfig::default(),
    };

    let (simulation, handle) = match &state_path {
        Some(path) => match std::fs::File::open(path) {
            Ok(file) => {
                Simulation::from_snapshot(&config, Box::new(std::io::BufReader::new(file)))
            }
            Err(err) => {
                eprintln!("cannot open state file {}: {err}", path.display());
                std::process::exit(1);
            }
        },
        None => Simulation::new(&config),
    };

    let hub = Arc::new(ChannelStreamHub::new());
    let server = match Server::start(
        simulation,
        handle,
        &bind,
        config.simulation_update_rate,
        hub,
    ) {
        Ok(server) => server,
        Err(err) => {
            eprintln!("cannot start server on {bind}: {err}");
            std::process::exit(1);
        }
    };

    println!("nanokit server listening on {}", server.local_addr());
    println!(
        "commands: NCK::setUpdateRate <Hz> | NCK::loadFile <path> | NCK::saveFile <path> | quit"
    );

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        match parse_command(line.trim()) {
            Some(Ok(AdminCommand::Shutdown)) => {
                server.shutdown();
                break;
            }
            Some(Ok(command)) => server.admin(command),
            Some(Err(message)) => eprintln!("{message}"),
            None => {}
        }
    }
}

/// Parses one console line. Returns `None` for blank lines.
fn parse_command(line: &str) -> Option<Result<AdminCommand, String>> {
    if line.is_empty() {
        return None;
    }
    let (command, argument) = match line.split_once(char::is_whitespace) {
        Some((command, argument)) => (command, argument.trim()),
        None => (line, ""),
    };
    let parsed = match command {
        "quit" => Ok(AdminCommand::Shutdown),
        "NCK::setUpdateRate" => argument
            .parse::<f64>()
            .map(AdminCommand::SetUpdateRate)
            .map_err(|_| format!("invalid update rate {argument:?}")),
        "NCK::loadFile" if !argument.is_empty() => {
            Ok(AdminCommand::LoadFile(PathBuf::from(argument)))
        }
        "NCK::saveFile" if !argument.is_empty() => {
            Ok(AdminCommand::SaveFile(PathBuf::from(argument)))
        }
        _ => Err(format!("unknown command {line:?}")),
    };
    Some(parsed)
}
