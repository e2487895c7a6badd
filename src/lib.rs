pub mod backend;
pub mod balancing;
pub mod connection;
pub mod http;
pub mod server;
pub mod threadpool;

use crate::backend::{Backend, BackendPool};
use crate::balancing::{get_balancer, BalancingAlgorithm};
use chrono::Local;
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use serde::{Deserialize, Serialize};
use serde_yaml;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

/// Boxed-error result used across the crate's task boundaries.
pub type AsyncResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

// Stock deployment values; any config.yaml key left unset falls back to
// these.
pub const BACKEND_ADDRESS: &str = "10.198.138.212";
pub const BASE_PORT: u16 = 39020;
pub const MAX_BACKENDS: usize = 5;
pub const MAX_FAILURES: u32 = 3;

const LOG_FILE: &str = "proxy_server.log";

/// How accepted connections are scheduled: one async task each on the
/// reactor, or one blocking worker thread each from a fixed pool.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SchedulingMode {
    #[serde(rename = "reactor")]
    Reactor,
    #[serde(rename = "worker-pool")]
    WorkerPool,
}

impl Default for SchedulingMode {
    fn default() -> SchedulingMode {
        SchedulingMode::Reactor
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_port")]
    listen_port: u16,
    #[serde(default = "default_backend_address")]
    backend_address: String,
    #[serde(default = "default_base_port")]
    base_port: u16,
    #[serde(default = "default_max_backends")]
    max_backends: usize,
    #[serde(default = "default_max_failures")]
    max_failures: u32,
    #[serde(default)]
    balancing: BalancingAlgorithm,
    #[serde(default)]
    mode: SchedulingMode,
    #[serde(default = "default_num_threads")]
    num_threads: usize,
    /// Backend connect timeout in milliseconds.
    #[serde(default = "default_timeout")]
    timeout: u64,
}

fn default_listen_port() -> u16 {
    8080
}

fn default_backend_address() -> String {
    BACKEND_ADDRESS.to_string()
}

fn default_base_port() -> u16 {
    BASE_PORT
}

fn default_max_backends() -> usize {
    MAX_BACKENDS
}

fn default_max_failures() -> u32 {
    MAX_FAILURES
}

fn default_num_threads() -> usize {
    4
}

fn default_timeout() -> u64 {
    5000
}

impl Default for Config {
    fn default() -> Config {
        Config {
            listen_port: default_listen_port(),
            backend_address: default_backend_address(),
            base_port: default_base_port(),
            max_backends: default_max_backends(),
            max_failures: default_max_failures(),
            balancing: BalancingAlgorithm::default(),
            mode: SchedulingMode::default(),
            num_threads: default_num_threads(),
            timeout: default_timeout(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> AsyncResult<Config> {
        let f = File::open(path)?;
        let config: Config = serde_yaml::from_reader(f)?;
        return Ok(config);
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn listen_on(&self) -> String {
        format!("0.0.0.0:{}", self.listen_port)
    }

    pub fn balancing_algorithm(&self) -> &BalancingAlgorithm {
        &self.balancing
    }

    pub fn mode(&self) -> SchedulingMode {
        self.mode
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn max_failures(&self) -> u32 {
        self.max_failures
    }

    /// Backend connect timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    /// The fixed backend set: `(backend_address, base_port + i)` for each
    /// slot in the pool.
    pub fn backends(&self) -> Vec<Backend> {
        (0..self.max_backends)
            .map(|i| Backend::new(self.backend_address.clone(), self.base_port + i as u16))
            .collect()
    }
}

/// Shared state of the data plane, threaded explicitly through both
/// scheduling modes instead of living in a global.
pub struct ProxyContext {
    pub pool: BackendPool,
    pub connect_timeout: Duration,
}

impl ProxyContext {
    pub fn from_config(config: &Config) -> ProxyContext {
        ProxyContext {
            pool: BackendPool::from_backends_list(
                config.backends(),
                get_balancer(config.balancing_algorithm()),
                config.max_failures(),
            ),
            connect_timeout: config.timeout(),
        }
    }
}

/// Level-tagged, timestamped logger writing every record to stdout and an
/// append-only log file.
struct ProxyLogger {
    file: Option<Mutex<File>>,
}

impl Log for ProxyLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // Two levels on the wire: everything below error renders as INFO.
        let level = if record.level() == Level::Error {
            "ERROR"
        } else {
            "INFO"
        };
        let line = format!(
            "[{}][{}] {}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            level,
            record.args()
        );
        println!("{}", line);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = writeln!(file, "{}", line);
            }
        }
    }

    fn flush(&self) {}
}

/// Install the proxy logger. A log file that cannot be opened disables the
/// file sink; stdout keeps working.
pub fn init_logging() -> Result<(), SetLoggerError> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(LOG_FILE)
        .ok()
        .map(Mutex::new);
    log::set_boxed_logger(Box::new(ProxyLogger { file }))?;
    log::set_max_level(LevelFilter::Info);
    Ok(())
}
