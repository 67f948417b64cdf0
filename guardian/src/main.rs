//! Guardian CLI

use clap::{Arg, ArgAction, Command};
use commonware_guardian::{
    chain::{rpc, Dialer},
    config::{self, system_env},
    engine, metadata, mocks, shell,
    signal::Signaler,
    telemetry, Engine,
};
use rand::{rngs::StdRng, SeedableRng};
use std::{
    io,
    path::{Path, PathBuf},
    process::ExitCode,
};
use tokio::{
    signal::unix::{signal, SignalKind},
    task::JoinError,
};
use tracing::{error, info};

/// Returns the version of the crate.
pub const fn crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Flag for the repo root
const REPO_FLAG: &str = "repo";

/// Flag for verbose output
const VERBOSE_FLAG: &str = "verbose";

/// Flag for running against the mock chain
const MOCK_FLAG: &str = "mock";

const START_CMD: &str = "start";
const CONFIG_CMD: &str = "config";
const GENERATE_CMD: &str = "generate";
const SHOW_CMD: &str = "show";
const CHECK_CMD: &str = "check";
const REWRITE_CMD: &str = "rewrite-with-env";
const VERSION_CMD: &str = "version";

/// Entrypoint for the Guardian CLI
#[tokio::main]
async fn main() -> ExitCode {
    // Define application
    let matches = Command::new("guardian")
        .version(crate_version())
        .about("Install node upgrades approved by on-chain governance.")
        .subcommand_required(true)
        .arg(
            Arg::new(REPO_FLAG)
                .long(REPO_FLAG)
                .global(true)
                .help("Guardian repo root (defaults to $GUARDIAN_PATH, then ~/.guardian)")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new(VERBOSE_FLAG)
                .short('v')
                .long(VERBOSE_FLAG)
                .global(true)
                .action(ArgAction::SetTrue),
        )
        .subcommand(
            Command::new(START_CMD)
                .about("Follow governance events and install approved node upgrades.")
                .arg(
                    Arg::new(MOCK_FLAG)
                        .long(MOCK_FLAG)
                        .help("Use a mock chain that delivers one approved upgrade")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new(CONFIG_CMD)
                .about("Manage the guardian configuration.")
                .subcommand_required(true)
                .subcommand(
                    Command::new(GENERATE_CMD)
                        .about("Create the repo and write the default configuration."),
                )
                .subcommand(
                    Command::new(SHOW_CMD)
                        .about("Print the configuration (with environment overrides applied)."),
                )
                .subcommand(Command::new(CHECK_CMD).about("Validate the configuration file."))
                .subcommand(
                    Command::new(REWRITE_CMD)
                        .about("Persist environment overrides into the configuration file."),
                ),
        )
        .subcommand(
            Command::new(VERSION_CMD)
                .visible_alias("v")
                .about("Print the guardian version."),
        )
        .get_matches();

    // Locate the repo
    let verbose = matches.get_flag(VERBOSE_FLAG);
    let flag = matches.get_one::<PathBuf>(REPO_FLAG).map(PathBuf::as_path);
    let root = match config::repo_root(flag, system_env) {
        Ok(root) => root,
        Err(err) => {
            eprintln!("failed to locate guardian repo: {err}");
            return ExitCode::FAILURE;
        }
    };

    // Parse subcommands
    match matches.subcommand() {
        Some((START_CMD, matches)) => start(&root, verbose, matches.get_flag(MOCK_FLAG)).await,
        Some((CONFIG_CMD, matches)) => match matches.subcommand() {
            Some((GENERATE_CMD, _)) => generate(&root),
            Some((SHOW_CMD, _)) => show(&root),
            Some((CHECK_CMD, _)) => check(&root),
            Some((REWRITE_CMD, _)) => rewrite(&root),
            _ => ExitCode::FAILURE,
        },
        Some((VERSION_CMD, _)) => {
            println!("guardian {}", crate_version());
            ExitCode::SUCCESS
        }
        _ => ExitCode::FAILURE,
    }
}

fn generate(root: &Path) -> ExitCode {
    if config::exists(root) {
        println!("guardian repo already exists at {}", root.display());
        return ExitCode::SUCCESS;
    }
    if let Err(err) = config::Config::default().write(root) {
        eprintln!("failed to write config: {err}");
        return ExitCode::FAILURE;
    }
    println!("initializing guardian at {}", root.display());
    ExitCode::SUCCESS
}

fn show(root: &Path) -> ExitCode {
    if !config::exists(root) {
        eprintln!("guardian repo does not exist at {}", root.display());
        return ExitCode::FAILURE;
    }
    match config::read(root, system_env).and_then(|cfg| cfg.to_yaml()) {
        Ok(yaml) => {
            print!("{yaml}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("failed to read config: {err}");
            ExitCode::FAILURE
        }
    }
}

fn check(root: &Path) -> ExitCode {
    match config::read(root, system_env) {
        Ok(_) => {
            println!("config file is valid");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("config file format error, please check: {err}");
            ExitCode::FAILURE
        }
    }
}

fn rewrite(root: &Path) -> ExitCode {
    match config::read(root, system_env).and_then(|cfg| cfg.write(root)) {
        Ok(()) => {
            println!("config rewritten at {}", root.join(config::CONFIG_FILE).display());
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("failed to rewrite config: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn start(root: &Path, verbose: bool, mock: bool) -> ExitCode {
    // Load config (writing defaults on first run)
    let cfg = match config::load(root, system_env) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("failed to load config: {err}");
            return ExitCode::FAILURE;
        }
    };

    // Create logger
    let level = if verbose {
        "debug".to_string()
    } else {
        cfg.log.level.clone()
    };
    let _guard = match telemetry::init(telemetry::Config {
        level,
        json: cfg.log.json,
        file: cfg.log_file(root),
    }) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("failed to initialize logging: {err}");
            return ExitCode::FAILURE;
        }
    };
    info!(version = crate_version(), repo = ?root, mock, "starting guardian");

    let home = system_env("HOME").map(PathBuf::from);
    let install_path = match cfg.install_path(home.as_deref()) {
        Ok(path) => path,
        Err(err) => {
            error!(%err, "failed to resolve install path");
            return ExitCode::FAILURE;
        }
    };
    if mock {
        run(mocks::Chain::with_upgrade(), &cfg, root, install_path).await
    } else {
        run(rpc::Dialer::new(cfg.dial_url.clone()), &cfg, root, install_path).await
    }
}

async fn run<D: Dialer>(
    dialer: D,
    cfg: &config::Config,
    root: &Path,
    install_path: PathBuf,
) -> ExitCode {
    let (signaler, shutdown) = Signaler::new();
    let engine = Engine::new(engine::Config {
        dialer,
        shell: shell::System,
        rng: StdRng::from_entropy(),
        shutdown,
        state: metadata::Config {
            directory: root.to_path_buf(),
            partition: config::STATE_PARTITION.to_string(),
        },
        staging: root.join(config::STAGING_DIR),
        install_path,
        binary: cfg.binary.clone(),
        filter: cfg.filter(),
        retry: cfg.retry_policy(),
        mailbox_size: cfg.mailbox_size,
    });
    let mut handle = match engine.start().await {
        Ok(handle) => handle,
        Err(err) => {
            error!(%err, "failed to start engine");
            return ExitCode::FAILURE;
        }
    };
    info!("guardian is ready");

    // Stop on SIGINT/SIGTERM (or when the loop fails on its own)
    tokio::select! {
        result = interrupted() => {
            match result {
                Ok(name) => info!(signal = name, "shutting down"),
                Err(err) => error!(%err, "failed to listen for signals"),
            }
            signaler.signal(0);
        },
        result = &mut handle => return exit(result),
    }
    exit(handle.await)
}

async fn interrupted() -> io::Result<&'static str> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|_| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

fn exit(result: Result<Result<(), engine::Error>, JoinError>) -> ExitCode {
    match result {
        Ok(Ok(())) => {
            info!("guardian stopped");
            ExitCode::SUCCESS
        }
        Ok(Err(err)) => {
            error!(%err, "engine failed");
            ExitCode::FAILURE
        }
        Err(err) => {
            error!(%err, "engine panicked");
            ExitCode::FAILURE
        }
    }
}
