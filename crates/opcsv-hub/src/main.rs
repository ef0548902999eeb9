mod render;
mod routes;

use clap::Parser;
use opcsv_core::{StatusKey, DEFAULT_STATUS_KEY};
use opcsv_storage::{DerivedFileService, Session, DEFAULT_SUFFIX};
use std::{
    fs::OpenOptions,
    io::{self, Write},
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const DEFAULT_ADDR: &str = "127.0.0.1:5000";

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    input_dir: PathBuf,
    output_dir: PathBuf,
    suffix: String,
    status_key: String,
    debug: bool,
    log_dir: String,
}

#[derive(Parser, Debug)]
#[command(name = "opcsv-hub")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    input_dir: String,
    #[arg(long, default_value = "")]
    output_dir: String,
    #[arg(long, default_value = DEFAULT_SUFFIX)]
    suffix: String,
    #[arg(long, default_value = DEFAULT_STATUS_KEY)]
    status_key: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    let _log_sink = init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };
    if !addr.ip().is_loopback() {
        warn!(event = "non_loopback_addr", addr = %config.addr);
    }
    if let Err(err) = std::fs::create_dir_all(&config.output_dir) {
        error!(
            event = "output_dir_error",
            error = %err,
            path = %config.output_dir.display()
        );
        return;
    }

    let service = DerivedFileService::new(
        config.input_dir.clone(),
        config.output_dir.clone(),
        config.suffix.clone(),
        StatusKey::new(config.status_key.clone()),
    );
    let state = Arc::new(routes::AppState::new(Session::new(service)));
    let app = routes::router(state);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };

    info!(
        event = "hub_start",
        addr = %config.addr,
        input_dir = %config.input_dir.display(),
        output_dir = %config.output_dir.display()
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(event = "hub_error", error = %err);
    }
}

fn load_config() -> Config {
    let args = Args::parse();
    Config {
        addr: resolve_setting(&args.addr, "OPCSV_ADDR", DEFAULT_ADDR),
        input_dir: PathBuf::from(resolve_setting(&args.input_dir, "OPCSV_INPUT_DIR", "inputs")),
        output_dir: PathBuf::from(resolve_setting(
            &args.output_dir,
            "OPCSV_OUTPUT_DIR",
            "outputs",
        )),
        suffix: args.suffix,
        status_key: args.status_key,
        debug: args.debug || env_true("OPCSV_DEBUG"),
        log_dir: resolve_setting(&args.log_dir, "OPCSV_LOG_DIR", ".opcsv/logs"),
    }
}

fn init_logging(config: &Config) -> Option<LogSink> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_log_level(config)));
    let sink = LogSink::open(&config.log_dir, &log_file_name(&config.addr)).unwrap_or_else(|err| {
        eprintln!("log_file_error: {err}");
        LogSink::stdout_only()
    });
    let tee = sink.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(BoxMakeWriter::new(move || tee.writer()))
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok()?;
    Some(sink)
}

/// `--debug` forces `debug`; otherwise `OPCSV_LOG_LEVEL`, then `info`.
fn default_log_level(config: &Config) -> String {
    if config.debug {
        return "debug".to_string();
    }
    std::env::var("OPCSV_LOG_LEVEL")
        .ok()
        .filter(|level| !level.trim().is_empty())
        .unwrap_or_else(|| "info".to_string())
}

/// `opcsv-hub-<addr>.log`, with every non-alphanumeric in `addr` as `-`.
fn log_file_name(addr: &str) -> String {
    let tag: String = addr
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '-' })
        .collect();
    let tag = tag.trim_matches('-');
    if tag.is_empty() {
        "opcsv-hub.log".to_string()
    } else {
        format!("opcsv-hub-{tag}.log")
    }
}

#[derive(Clone)]
struct LogSink {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl LogSink {
    fn stdout_only() -> Self {
        Self { file: None }
    }

    /// Appends to `<log_dir>/<file_name>`. A blank or uncreatable directory
    /// means stdout only.
    fn open(log_dir: &str, file_name: &str) -> io::Result<Self> {
        if log_dir.trim().is_empty() {
            return Ok(Self::stdout_only());
        }
        let dir = PathBuf::from(log_dir);
        if std::fs::create_dir_all(&dir).is_err() {
            return Ok(Self::stdout_only());
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(file_name))?;
        Ok(Self {
            file: Some(Arc::new(Mutex::new(file))),
        })
    }

    fn writer(&self) -> LogTee {
        LogTee {
            file: self.file.clone(),
        }
    }
}

/// Per-event writer: stdout first, then the log file when one is open.
struct LogTee {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl LogTee {
    fn with_file(&self, op: impl FnOnce(&mut std::fs::File) -> io::Result<()>) {
        if let Some(Ok(mut file)) = self.file.as_ref().map(|file| file.lock()) {
            let _ = op(&mut *file);
        }
    }
}

impl Write for LogTee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = io::stdout().lock().write_all(buf);
        self.with_file(|file| file.write_all(buf));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stdout().lock().flush();
        self.with_file(|file| file.flush());
        Ok(())
    }
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

/// Flag value if set, else the environment variable, else `fallback`.
fn resolve_setting(flag: &str, env_key: &str, fallback: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    fallback.to_string()
}
