use std::path::Path;
use std::process;
use std::sync::Arc;

use wg_world_lib::config::MeshConfig;
use wg_world_lib::exec::{Runner, SystemRunner};
use wg_world_lib::key::Key;
use wg_world_lib::network::Network;
use wg_world_lib::{logging, network};

mod cli;

fn main() {
    let args = cli::parse();

    logging::init();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting {}",
        env!("CARGO_PKG_NAME")
    );

    let exit = run(args);

    if exit != exitcode::OK {
        tracing::warn!("abnormal exit");
    }
    process::exit(exit)
}

fn run(args: cli::Cli) -> exitcode::ExitCode {
    let path = args.config_path;
    match args.command {
        cli::Command::Genkey { out } => generate_key(&out),
        cli::Command::Plan { host } => plan(&path, &host),
        cli::Command::Up { host } => drive(&path, |network, runner| network.up(&host, runner)),
        cli::Command::Down { host } => drive(&path, |network, runner| network.down(&host, runner)),
        cli::Command::MockUp => drive(&path, |network, runner| network.up_mock(runner)),
        cli::Command::MockDown => drive(&path, |network, runner| network.down_mock(runner)),
    }
}

fn generate_key(out: &Path) -> exitcode::ExitCode {
    match Key::generate() {
        Ok(key) => match key.dump(out) {
            Ok(_) => {
                println!("{key}");
                exitcode::OK
            }
            Err(e) => {
                tracing::error!(error = ?e, path = %out.display(), "failed to persist key");
                exitcode::IOERR
            }
        },
        Err(e) => {
            tracing::error!(error = ?e, "failed to generate key");
            exitcode::OSERR
        }
    }
}

fn load_network(config_path: &Path) -> Result<Network, exitcode::ExitCode> {
    let config = match MeshConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = ?e, path = %config_path.display(), "cannot load mesh description");
            return Err(exitcode::CONFIG);
        }
    };
    match config.build() {
        Ok(network) => Ok(network),
        Err(e) => {
            tracing::error!(error = ?e, "invalid mesh description");
            Err(exitcode::CONFIG)
        }
    }
}

fn plan(config_path: &Path, host: &str) -> exitcode::ExitCode {
    let mut network = match load_network(config_path) {
        Ok(network) => network,
        Err(exit) => return exit,
    };
    match network.plan(host) {
        Ok(lines) => {
            for line in lines {
                println!("{line}");
            }
            exitcode::OK
        }
        Err(e) => {
            tracing::error!(error = %e, host, "cannot compile plan");
            exitcode::CONFIG
        }
    }
}

fn drive(
    config_path: &Path,
    command: impl FnOnce(&mut Network, &Arc<dyn Runner>) -> Result<(), network::Error>,
) -> exitcode::ExitCode {
    let mut network = match load_network(config_path) {
        Ok(network) => network,
        Err(exit) => return exit,
    };
    let runner: Arc<dyn Runner> = Arc::new(SystemRunner);
    match command(&mut network, &runner) {
        Ok(_) => exitcode::OK,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            match e {
                network::Error::Primitive(_) | network::Error::Transaction(_) => exitcode::OSERR,
                _ => exitcode::CONFIG,
            }
        }
    }
}
