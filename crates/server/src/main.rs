//! ternd - the Tern world server
//!
//! Flag surface mirrors the config file key for key; flags win over the
//! file. A single positional argument is a config-file path. SIGINT and
//! SIGTERM request an orderly checkpoint-and-exit through the engine's
//! run state, which the outer loop honors at the next tick boundary.

use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tern_runtime::{Config, Engine};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ternd", version, about = "Tern multi-user world server")]
struct Cli {
    /// Config file (key=value per line, # comments)
    config: Option<PathBuf>,

    /// Checkpoint read path
    #[arg(long)]
    load: Option<PathBuf>,

    /// Checkpoint write path
    #[arg(long)]
    save: Option<PathBuf>,

    /// Emergency checkpoint path
    #[arg(long = "panic")]
    panic_path: Option<PathBuf>,

    /// Host directory the virtual filesystem mirrors
    #[arg(long)]
    filesystem: Option<PathBuf>,

    /// Server log file (stderr when unset)
    #[arg(long)]
    syslog: Option<PathBuf>,

    /// Transaction log path
    #[arg(long)]
    xlog: Option<PathBuf>,

    /// Transaction log soft cap, bytes
    #[arg(long)]
    xlogsize: Option<u64>,

    /// Temporary checkpoint path
    #[arg(long)]
    tmpdb: Option<PathBuf>,

    /// TCP listening port
    #[arg(long)]
    port: Option<u16>,

    /// Daemonize after startup
    #[arg(long)]
    detach: bool,

    /// Accept a single connection only
    #[arg(long)]
    single: bool,

    /// Accept many connections (the default)
    #[arg(long)]
    multi: bool,

    /// Cosmetic server title
    #[arg(long)]
    title: Option<String>,

    /// Soft cap on resident objects
    #[arg(long)]
    cache: Option<usize>,
}

fn build_config(cli: &Cli) -> Result<Config, String> {
    let mut config = Config::default();
    if let Some(path) = &cli.config {
        config.apply_file(path).map_err(|e| e.to_string())?;
    }
    if let Some(v) = &cli.load {
        config.load_path = v.clone();
    }
    if let Some(v) = &cli.save {
        config.save_path = v.clone();
    }
    if let Some(v) = &cli.panic_path {
        config.panic_path = v.clone();
    }
    if let Some(v) = &cli.filesystem {
        config.fs_root = v.clone();
    }
    if let Some(v) = &cli.syslog {
        config.syslog = Some(v.clone());
    }
    if let Some(v) = &cli.xlog {
        config.xlog_path = v.clone();
    }
    if let Some(v) = cli.xlogsize {
        config.xlog_size = v;
    }
    if let Some(v) = &cli.tmpdb {
        config.tmpdb_path = v.clone();
    }
    if let Some(v) = cli.port {
        config.port = v;
    }
    if cli.detach {
        config.detach = true;
    }
    if cli.single {
        config.single = true;
    }
    if cli.multi {
        config.single = false;
    }
    if let Some(v) = &cli.title {
        config.title = v.clone();
    }
    if let Some(v) = cli.cache {
        config.cache_size = v;
    }
    Ok(config)
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match &config.syslog {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .unwrap_or_else(|e| {
                    eprintln!("cannot open log {}: {}", path.display(), e);
                    std::process::exit(1);
                });
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

#[cfg(unix)]
fn daemonize() {
    // Classic double-fork: the first child leads a new session, the
    // grandchild can never reacquire a controlling terminal. SIGCHLD
    // and SIGHUP are ignored and the standard streams move to
    // /dev/null so nothing still points at the invoking terminal.
    unsafe {
        libc::signal(libc::SIGCHLD, libc::SIG_IGN);
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
        match libc::fork() {
            -1 => {
                eprintln!("fork failed");
                std::process::exit(1);
            }
            0 => {}
            _ => std::process::exit(0),
        }
        if libc::setsid() < 0 {
            eprintln!("setsid failed");
            std::process::exit(1);
        }
        match libc::fork() {
            -1 => std::process::exit(1),
            0 => {}
            _ => std::process::exit(0),
        }
        let devnull = std::ffi::CString::new("/dev/null").expect("static path");
        let fd = libc::open(devnull.as_ptr(), libc::O_RDWR);
        if fd >= 0 {
            libc::dup2(fd, 0);
            libc::dup2(fd, 1);
            libc::dup2(fd, 2);
            if fd > 2 {
                libc::close(fd);
            }
        }
    }
}

#[cfg(unix)]
fn install_signals() -> Arc<AtomicUsize> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    let flag = Arc::new(AtomicUsize::new(0));
    for sig in [SIGINT, SIGTERM] {
        let flag = flag.clone();
        unsafe {
            let _ = signal_hook::low_level::register(sig, move || {
                flag.store(1, Ordering::SeqCst);
            });
        }
    }
    flag
}

fn main() {
    let cli = Cli::parse();
    let config = match build_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("ternd: {}", e);
            std::process::exit(1);
        }
    };
    init_tracing(&config);
    tracing::info!(title = %config.title, port = config.port, "starting");

    if config.detach {
        #[cfg(unix)]
        daemonize();
    }

    #[cfg(unix)]
    let shutdown_flag = install_signals();
    #[cfg(not(unix))]
    let shutdown_flag: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));

    let mut engine = Engine::new(config);
    if let Err(e) = engine.boot() {
        tracing::error!(error = %e, "boot failed");
        std::process::exit(1);
    }
    if let Err(e) = engine.conns.listen(engine.config.port) {
        tracing::error!(port = engine.config.port, error = %e, "cannot listen");
        std::process::exit(1);
    }

    let code = tern_runtime::sched::run(&mut engine, Some(&shutdown_flag));
    std::process::exit(code);
}
