//! Process topology.
//!
//! [`run`] decides at startup how many OS processes serve the [`Service`]:
//!
//! - **Single process** (`clustered = false`): the calling process awaits
//!   `init`, binds the port, calls `on_ready` and serves.
//! - **Clustered**: the first process becomes the parent. It never binds a
//!   socket; it re-executes the current binary once per worker with
//!   `KEEL_WORKER_INDEX` set, then waits for the workers and logs how each
//!   one exited. Every worker runs the same `main`, detects its role from
//!   that variable, and serves on the shared port through `SO_REUSEPORT`,
//!   so the kernel spreads connections across them.
//!
//! Workers that exit are not restarted. Every process logs its own exit
//! code through [`exit_hook`].
//!
//! ```rust,no_run
//! use keel::{RunConfig, Service, ServiceConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), keel::Error> {
//!     let service = Service::configure(ServiceConfig::new(|_routes| Ok(())))?;
//!     keel::run(service, RunConfig::from_env()?).await
//! }
//! ```

use std::ffi::OsString;
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

use crate::error::{BoxError, Error};
use crate::server::Server;
use crate::service::Service;

/// Environment variable carrying a worker's index from parent to child.
pub const WORKER_INDEX_ENV: &str = "KEEL_WORKER_INDEX";

const DEFAULT_PORT: u16 = 3000;
const BACKLOG: i32 = 1024;

type InitFuture = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send>>;
type ReadyHook = Box<dyn FnOnce() + Send>;

/// What this process is in a clustered deployment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Parent,
    Worker { index: usize },
}

impl Role {
    /// Reads the role from [`WORKER_INDEX_ENV`].
    pub fn detect() -> Self {
        Self::from_var(std::env::var(WORKER_INDEX_ENV).ok().as_deref())
    }

    fn from_var(value: Option<&str>) -> Self {
        let Some(value) = value else { return Self::Parent };
        match value.trim().parse() {
            Ok(index) => Self::Worker { index },
            Err(_) => {
                warn!(value, "ignoring unparsable {WORKER_INDEX_ENV}");
                Self::Parent
            }
        }
    }
}

/// How to run a service.
pub struct RunConfig {
    name: String,
    host: IpAddr,
    port: u16,
    clustered: bool,
    workers: usize,
    init: Option<InitFuture>,
    on_ready: Option<ReadyHook>,
}

impl RunConfig {
    /// Single process on `0.0.0.0:port`.
    pub fn new(port: u16) -> Self {
        Self {
            name: "Service".to_owned(),
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port,
            clustered: false,
            workers: cpu_count(),
            init: None,
            on_ready: None,
        }
    }

    /// Reads `PORT` (default 3000), `KEEL_CLUSTERED` and `KEEL_WORKERS`.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let port = match lookup("PORT") {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("PORT must be a port number, got `{raw}`")))?,
            None => DEFAULT_PORT,
        };
        let mut config = Self::new(port);

        if let Some(raw) = lookup("KEEL_CLUSTERED") {
            config.clustered = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                _ => return Err(Error::Config(format!("KEEL_CLUSTERED must be a boolean, got `{raw}`"))),
            };
        }
        if let Some(raw) = lookup("KEEL_WORKERS") {
            config.workers = raw
                .trim()
                .parse()
                .ok()
                .filter(|&n: &usize| n > 0)
                .ok_or_else(|| Error::Config(format!("KEEL_WORKERS must be a positive integer, got `{raw}`")))?;
        }
        Ok(config)
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    pub fn clustered(mut self, clustered: bool) -> Self {
        self.clustered = clustered;
        self
    }

    /// Worker count in clustered mode. Defaults to the number of logical CPUs.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Work to finish before the port is bound, once per serving process.
    /// An error aborts startup with [`Error::Init`].
    pub fn init<F>(mut self, init: F) -> Self
    where
        F: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.init = Some(Box::pin(init));
        self
    }

    /// Called once per serving process after the port is bound, before the
    /// first connection is accepted.
    pub fn on_ready(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_ready = Some(Box::new(hook));
        self
    }

    pub fn port(&self) -> u16 { self.port }
    pub fn is_clustered(&self) -> bool { self.clustered }
    pub fn worker_count(&self) -> usize { self.workers }

    fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunConfig")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("clustered", &self.clustered)
            .field("workers", &self.workers)
            .field("init", &self.init.is_some())
            .field("on_ready", &self.on_ready.is_some())
            .finish()
    }
}

/// A spawned worker in the parent's table.
#[derive(Debug)]
pub struct WorkerProcess {
    index: usize,
    pid: Option<u32>,
    child: Child,
}

impl WorkerProcess {
    pub fn index(&self) -> usize { self.index }

    /// `None` only if the OS reported no pid at spawn.
    pub fn pid(&self) -> Option<u32> { self.pid }
}

/// How a worker ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerExit {
    pub index: usize,
    pub pid: Option<u32>,
    /// `None` when the worker was killed by a signal.
    pub code: Option<i32>,
}

/// Spawns and tracks worker processes.
pub struct Supervisor {
    program: PathBuf,
    args: Vec<OsString>,
    workers: Vec<WorkerProcess>,
}

impl Supervisor {
    /// Re-executes the current binary with the current arguments.
    pub fn new() -> Result<Self, Error> {
        let program = std::env::current_exe()?;
        Ok(Self::with_program(program, std::env::args_os().skip(1)))
    }

    /// Runs `program` instead of the current binary.
    pub fn with_program<I, A>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            workers: Vec::new(),
        }
    }

    /// Starts `count` workers with indexes `0..count`.
    ///
    /// If one fails to start, the ones already started are killed.
    pub fn spawn(&mut self, count: usize) -> Result<(), Error> {
        for index in 0..count {
            let spawned = Command::new(&self.program)
                .args(&self.args)
                .env(WORKER_INDEX_ENV, index.to_string())
                .spawn();

            let child = match spawned {
                Ok(child) => child,
                Err(source) => {
                    self.kill_all();
                    return Err(Error::Spawn { index, source });
                }
            };
            let pid = child.id();
            info!(index, pid, "worker spawned");
            self.workers.push(WorkerProcess { index, pid, child });
        }
        Ok(())
    }

    pub fn workers(&self) -> &[WorkerProcess] {
        &self.workers
    }

    /// Waits until every worker has exited, logging each exit as it happens.
    pub async fn wait(&mut self) -> Vec<WorkerExit> {
        let mut pending: FuturesUnordered<_> = self
            .workers
            .iter_mut()
            .map(|worker| async move {
                let status = worker.child.wait().await;
                (worker.index, worker.pid, status)
            })
            .collect();

        let mut exits = Vec::with_capacity(pending.len());
        while let Some((index, pid, status)) = pending.next().await {
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    error!(index, pid, "failed to wait for worker: {e}");
                    None
                }
            };
            match code {
                Some(0) => info!(index, pid, code = 0, "worker exited"),
                Some(code) => warn!(index, pid, code, "worker exited"),
                None => warn!(index, pid, "worker terminated by signal"),
            }
            exits.push(WorkerExit { index, pid, code });
        }
        exits
    }

    fn kill_all(&mut self) {
        for worker in &mut self.workers {
            if let Err(e) = worker.child.start_kill() {
                warn!(index = worker.index, "failed to kill worker: {e}");
            }
        }
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("workers", &self.workers.len())
            .finish()
    }
}

/// Runs `service` in the topology `config` asks for.
///
/// Returns after graceful shutdown (serving processes) or after every worker
/// has exited (clustered parent).
///
/// # Errors
///
/// [`Error::Init`] if `init` fails, [`Error::Io`] if the port cannot be
/// bound, [`Error::Spawn`] if a worker cannot be started.
pub async fn run(service: Service, config: RunConfig) -> Result<(), Error> {
    let _exit = exit_hook();

    let result = if !config.clustered {
        serve(service, config, None).await
    } else {
        match Role::detect() {
            Role::Parent => match Supervisor::new() {
                Ok(supervisor) => supervise(config, supervisor).await.map(drop),
                Err(e) => Err(e),
            },
            Role::Worker { index } => serve(service, config, Some(index)).await,
        }
    };

    if let Err(e) = &result {
        error!("{e}");
        set_exit_code(1);
    }
    result
}

/// The clustered parent: spawn, then wait. Never binds, never runs `init`.
async fn supervise(config: RunConfig, mut supervisor: Supervisor) -> Result<Vec<WorkerExit>, Error> {
    if config.workers == 0 {
        return Err(Error::Config("workers must be at least 1".to_owned()));
    }
    info!(
        pid = std::process::id(),
        cpus = cpu_count(),
        model = cpu_model().as_deref().unwrap_or("unknown"),
        workers = config.workers,
        name = %config.name,
        "starting cluster"
    );

    supervisor.spawn(config.workers)?;
    let exits = supervisor.wait().await;
    info!(workers = exits.len(), "all workers exited");
    Ok(exits)
}

/// A serving process: init, bind, ready, serve.
async fn serve(service: Service, config: RunConfig, worker: Option<usize>) -> Result<(), Error> {
    let addr = config.addr();
    let RunConfig { name, init, on_ready, .. } = config;

    if let Some(init) = init {
        init.await.map_err(Error::Init)?;
    }

    let listener = bind_listener(addr, worker.is_some())?;
    let listening = Server::from_listener(listener).listen().await?;
    info!(pid = std::process::id(), worker, %addr, name = %name, "ready");

    if let Some(hook) = on_ready {
        hook();
    }
    listening.serve(service).await
}

/// Binds a listening socket. With `shared`, several processes may bind the
/// same address.
fn bind_listener(addr: SocketAddr, shared: bool) -> std::io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if shared {
        reuse_port(&socket)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

#[cfg(unix)]
fn reuse_port(socket: &Socket) -> std::io::Result<()> {
    socket.set_reuse_port(true)
}

#[cfg(not(unix))]
fn reuse_port(_socket: &Socket) -> std::io::Result<()> {
    Ok(())
}

fn cpu_count() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

/// The CPU model name, where the OS exposes one.
fn cpu_model() -> Option<String> {
    let info = std::fs::read_to_string("/proc/cpuinfo").ok()?;
    info.lines()
        .find(|line| line.starts_with("model name"))
        .and_then(|line| line.split_once(':'))
        .map(|(_, model)| model.trim().to_owned())
}

static HOOKED: AtomicBool = AtomicBool::new(false);
static EXIT_CODE: AtomicI32 = AtomicI32::new(0);

/// Registers the process exit log. Call it first in `main` and keep the
/// returned hook alive until `main` returns.
///
/// When the hook drops it logs `process <pid> exiting with code <n>`: `101`
/// while unwinding from a panic, otherwise the code recorded through
/// [`set_exit_code`] or [`ExitHook::report`]. Only the first live hook in a
/// process logs; [`run`] registers one itself when `main` did not.
///
/// ```rust,no_run
/// use keel::{RunConfig, Service, ServiceConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), keel::Error> {
///     let exit = keel::supervisor::exit_hook();
///     exit.report(start().await)
/// }
///
/// async fn start() -> Result<(), keel::Error> {
///     let service = Service::configure(ServiceConfig::new(|_routes| Ok(())))?;
///     keel::run(service, RunConfig::from_env()?).await
/// }
/// ```
pub fn exit_hook() -> ExitHook {
    let armed = !HOOKED.swap(true, Ordering::SeqCst);
    ExitHook { pid: std::process::id(), armed }
}

/// Records the code the exit log reports.
pub fn set_exit_code(code: i32) {
    EXIT_CODE.store(code, Ordering::SeqCst);
}

/// Guard returned by [`exit_hook`].
#[derive(Debug)]
#[must_use = "the exit is logged when the hook drops"]
pub struct ExitHook {
    pid: u32,
    armed: bool,
}

impl ExitHook {
    /// Passes `result` through, recording exit code `1` if it is an error.
    pub fn report<T, E>(&self, result: Result<T, E>) -> Result<T, E> {
        if result.is_err() {
            set_exit_code(1);
        }
        result
    }
}

impl Drop for ExitHook {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let recorded = EXIT_CODE.swap(0, Ordering::SeqCst);
        let code = if std::thread::panicking() { 101 } else { recorded };
        info!(pid = self.pid, code, "process {} exiting with code {code}", self.pid);
        HOOKED.store(false, Ordering::SeqCst);
    }
}
