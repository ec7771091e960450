use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use fanout::message::RunPayload;
use fanout::{platform, server, Client, Instance, DEFAULT_PARALLEL, MAGIC_ENV, SOCKET_ENV};
use tokio::net::UnixListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = FanoutCli::parse();
    let socket = resolve_socket_path(cli.socket)?;

    let exit_code = match cli.command {
        FanoutSubcommand::Start {
            foreground,
            parallel,
            new_server,
        } => start(&socket, foreground, parallel, new_server).await?,
        FanoutSubcommand::Run { command } => run(&socket, command).await?,
        FanoutSubcommand::Wait { no_shutdown } => wait(&socket, no_shutdown).await?,
        FanoutSubcommand::Getpid => getpid(&socket).await?,
        FanoutSubcommand::Kill => kill(&socket).await?,
        FanoutSubcommand::Config { parallel } => config(&socket, parallel).await?,
    };

    std::process::exit(exit_code);
}

#[derive(Debug, Parser)]
#[command(name = "fanout", version, author)]
/// A session-scoped daemon that runs commands in parallel.
struct FanoutCli {
    #[clap(subcommand)]
    command: FanoutSubcommand,
    /// Path of the daemon's unix socket (default $HOME/.fanout/socket.$SESSIONID).
    #[arg(long, short)]
    socket: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
/// Subcommand to execute.
enum FanoutSubcommand {
    /// Start the background server for this session.
    ///
    /// By default this creates a new server for every session, so each
    /// login shell gets its own.
    Start {
        /// Do not fork off a background server: run in the foreground.
        #[arg(short, long)]
        foreground: bool,
        /// Number of tasks to run in parallel.
        #[arg(short, long, default_value_t = DEFAULT_PARALLEL)]
        parallel: u32,
        /// Fail if a server is already running on the socket.
        #[arg(short, long)]
        new_server: bool,
    },
    /// Queue a command to run on the server.
    Run {
        /// Command and arguments to execute.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Wait for all queued tasks to finish.
    ///
    /// Exits 0 if every task succeeded, 1 if any exited non-zero, 2 if
    /// any failed to launch.
    Wait {
        /// Do not shut the server down after the wait completes.
        #[arg(short, long)]
        no_shutdown: bool,
    },
    /// Print the pid of the server to stdout.
    Getpid,
    /// Send a SIGKILL to the server's process group.
    ///
    /// This kills the server and any of its tasks that have not changed
    /// their process group.
    Kill,
    /// Change the server configuration.
    Config {
        /// Number of tasks to run in parallel.
        #[arg(short, long)]
        parallel: Option<i64>,
    },
}

/// Flag beats environment beats the per-session default.
fn resolve_socket_path(flag: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let path = flag
        .or_else(|| std::env::var_os(SOCKET_ENV).map(PathBuf::from))
        .or_else(platform::default_socket_path)
        .context("no socket path: pass --socket or set HOME")?;
    if path.is_absolute() {
        Ok(path)
    } else {
        // The forked server chdirs to /; a relative path would come apart.
        Ok(std::env::current_dir()?.join(path))
    }
}

async fn start(
    socket: &Path,
    foreground: bool,
    parallel: u32,
    new_server: bool,
) -> anyhow::Result<i32> {
    if std::os::unix::net::UnixStream::connect(socket).is_ok() {
        if new_server {
            anyhow::bail!("server is already running on {}", socket.display());
        }
        info!("server is already running");
        return Ok(0);
    }

    // The sentinel marks the re-executed child: it serves instead of
    // forking again.
    let magic = std::env::var_os(MAGIC_ENV);
    if foreground || magic.as_deref() == Some(socket.as_os_str()) {
        serve(socket, parallel).await?;
        return Ok(0);
    }

    info!("forking background server");
    let exe = std::env::current_exe().context("failed to locate own executable")?;
    let args: Vec<OsString> = std::env::args_os().skip(1).collect();
    std::process::Command::new(exe)
        .args(args)
        .env(MAGIC_ENV, socket.as_os_str())
        .current_dir("/")
        .spawn()
        .context("failed to fork background server")?;
    Ok(0)
}

/// Bind the socket and run the accept loop until a shutdown drains it.
/// The daemon owns the socket file: stale ones are removed before binding
/// and the bound one is removed on the way out.
async fn serve(socket: &Path, parallel: u32) -> anyhow::Result<()> {
    if let Some(dir) = socket.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    match std::fs::remove_file(socket) {
        Ok(()) => info!(socket = %socket.display(), "removed stale socket"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("failed to remove {}", socket.display()))
        }
    }

    let listener = UnixListener::bind(socket)
        .with_context(|| format!("failed to bind {}", socket.display()))?;
    info!(socket = %socket.display(), parallel, "server listening");

    server::run(listener, Instance::new(parallel)).await;

    let _ = std::fs::remove_file(socket);
    Ok(())
}

async fn run(socket: &Path, command: Vec<String>) -> anyhow::Result<i32> {
    let name = command.first().context("no command specified")?;
    let exe =
        platform::find_executable(name).with_context(|| format!("failed to find executable {name}"))?;
    let cwd = std::env::current_dir().context("failed to determine working directory")?;
    let env = std::env::vars_os()
        .map(|(key, value)| format!("{}={}", key.to_string_lossy(), value.to_string_lossy()))
        .collect();
    let fds = platform::inheritable_fds().context("failed to enumerate descriptors")?;

    let payload = RunPayload {
        exe: exe.to_string_lossy().into_owned(),
        args: command,
        env,
        cwd: cwd.to_string_lossy().into_owned(),
    };

    let mut client = connect(socket).await?;
    client.run(payload, &fds).await?;
    Ok(0)
}

async fn wait(socket: &Path, no_shutdown: bool) -> anyhow::Result<i32> {
    let mut client = connect(socket).await?;
    let exit_status = client.wait().await?;

    if !no_shutdown {
        client.shutdown().await?;
    }

    Ok(exit_status)
}

async fn getpid(socket: &Path) -> anyhow::Result<i32> {
    let mut client = connect(socket).await?;
    let pid = client.getpid().await?;
    println!("{pid}");
    Ok(0)
}

async fn kill(socket: &Path) -> anyhow::Result<i32> {
    let mut client = connect(socket).await?;
    client.kill().await?;
    Ok(0)
}

async fn config(socket: &Path, parallel: Option<i64>) -> anyhow::Result<i32> {
    let mut client = connect(socket).await?;
    client.config(parallel).await?;
    Ok(0)
}

async fn connect(socket: &Path) -> anyhow::Result<Client> {
    Client::connect(socket).await.with_context(|| {
        format!(
            "failed to connect to {}; start the server with `fanout start`",
            socket.display()
        )
    })
}
