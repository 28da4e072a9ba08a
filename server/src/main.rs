#[macro_use]
extern crate log;

use std::path::PathBuf;

use clap::Parser;
use log::LevelFilter;

use envdeploy_server::{run, shim, Config};

/// Command-line flags, mirroring the reference implementation's `flag.*` set
#[derive(Parser, Debug)]
#[command(name = "envdeploy", about = "multi-tenant deployment server")]
struct Cli {
    /// Run in debug mode: reload templates and deployables on every request
    #[arg(long)]
    debug: bool,

    /// Internal use only: the cgroup to attach to before exec'ing `command`
    #[arg(long = "cgroup-exec")]
    cgroup_exec: Option<PathBuf>,

    /// Directory to store per-job stderr logs in
    #[arg(long, default_value = "/tmp/envdeploy_logs")]
    logdir: PathBuf,

    /// Address for the HTTP server to listen on
    #[arg(long, default_value = "127.0.0.1:80")]
    listen: String,

    /// Path to be the root of envdeploy's web tree
    #[arg(long, default_value = "")]
    basepath: String,

    /// Path to configuration file listing deployables
    #[arg(long, default_value = "deployables.json")]
    conf: PathBuf,

    /// Comma-separated list of admin usernames
    #[arg(long, default_value = "")]
    admins: String,

    /// Bypasses the `X-Forwarded-User` header, for local testing
    #[arg(long, default_value = "")]
    mockuser: String,

    /// Program (and its arguments) to run once attached to the cgroup named
    /// by `--cgroup-exec`; only meaningful together with that flag
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[quit::main]
fn main() {
    let cli = Cli::parse();

    let level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    std::env::set_var("RUST_LOG", level.clone());
    pretty_env_logger::formatted_builder()
        .parse_filters(&level)
        .filter_module("polling", LevelFilter::Off)
        .format_timestamp_secs()
        .init();

    if let Some(cgroup_path) = cli.cgroup_exec.clone() {
        let Some((program, args)) = cli.command.split_first() else {
            error!("envdeploy: --cgroup-exec requires a program to run");
            quit::with_code(1);
        };
        let err = shim::exec_into_cgroup(&cgroup_path, program, args);
        error!("envdeploy: {err}");
        quit::with_code(1);
    }

    let config = Config {
        debug: cli.debug,
        logdir: cli.logdir,
        listen: cli.listen,
        basepath: cli.basepath,
        conf: cli.conf,
        admins: cli.admins,
        mockuser: cli.mockuser,
    };

    if let Err(e) = run(config) {
        error!("{e}");
        quit::with_code(1);
    }
}
