#[macro_use]
extern crate log;

pub mod dialer;
pub mod flash;
pub mod gateway;
pub mod job;
pub mod netns;
pub mod routes;
pub mod shim;
pub mod state;
pub mod supervisor;
pub mod templates;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use envdeploy_core::cgroup::CGroup;
use envdeploy_core::users::{AdminSet, User};

use state::{AppState, DeployablesStore, Inner};
use supervisor::Supervisor;
use templates::Templates;

/// Startup configuration, already resolved from CLI flags
pub struct Config {
    pub debug: bool,
    pub logdir: PathBuf,
    pub listen: String,
    pub basepath: String,
    pub conf: PathBuf,
    pub admins: String,
    pub mockuser: String,
}

/// Builds the server's shared state, binds its listener and serves until
/// the process is killed
pub fn run(config: Config) -> anyhow::Result<()> {
    let data_dir = data_dir()?;
    let templates = Templates::load(data_dir.join("templates"), config.basepath.clone(), config.debug)?;
    let deployables = DeployablesStore::load(config.conf.clone(), config.debug)?;
    let (server_cgroup, jobs_cgroup) = init_cgroup()?;
    server_cgroup
        .mv(nix::unistd::getpid())
        .context("attaching ourselves to our startup cgroup")?;

    let admins = AdminSet::parse(&config.admins);
    let mock_user = (!config.mockuser.is_empty()).then(|| User::new(config.mockuser.clone()));

    let supervisor = Supervisor::new(jobs_cgroup, config.logdir.clone(), config.basepath.clone());

    let state = AppState(Arc::new(Inner {
        supervisor,
        deployables,
        admins,
        mock_user,
        base_path: config.basepath.clone(),
        templates,
        static_dir: data_dir.join("static"),
        log_dir: config.logdir.clone(),
    }));

    let app = routes::router(state);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building the async runtime")?;
    rt.block_on(serve(app, config.listen))
}

async fn serve(app: axum::Router, addr: String) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("listening on {addr}");
    axum::serve(listener, app)
        .await
        .context("serving HTTP")?;
    Ok(())
}

/// Resolves the directory templates and static assets are loaded from:
/// `ENVDEPLOY_DATA_DIR` if set, otherwise the directory our own executable
/// lives in
fn data_dir() -> anyhow::Result<PathBuf> {
    if let Ok(dir) = std::env::var("ENVDEPLOY_DATA_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let exe = std::env::current_exe().context("resolving our own executable path")?;
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow::anyhow!("executable path has no parent directory"))
}

/// Imports the cgroup we were started under and splits off the "server" and
/// "jobs" subgroups: we attach ourselves to the former, jobs are created
/// under the latter, so that killing the server's own cgroup never takes a
/// running job down with it.
fn init_cgroup() -> anyhow::Result<(CGroup, CGroup)> {
    let mount = envdeploy_core::cgroup::mount_point().context("locating the cgroup2 mount")?;
    let current =
        envdeploy_core::cgroup::current_cgroup().context("reading our own cgroup path")?;
    let root = CGroup::import_root(mount.join(current)).context("importing our startup cgroup")?;
    info!("our start-up cgroup is {}", root.get_path().display());

    let server = root.new("server").context("creating the server subgroup")?;
    let jobs = root.new("jobs").context("creating the jobs subgroup")?;
    Ok((server, jobs))
}
