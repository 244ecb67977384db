//! Provides the CLI option parser
//!
//! Used to parse the argv/config file into a struct that
//! the server can consume and use as configuration data.
//!
//! Durations in the config file are seconds and may be fractional:
//! `window-size = 60`, `export-backoff-base = 0.1`.

use crate::buckets::{BoundsError, HistogramBounds, DEFAULT_BOUNDS};
use crate::flush::{DurabilityPolicy, FlushConfig};
use crate::sink::{ConsoleConfig, NullConfig};
use clap::{App, Arg};
use std::env;
use std::error;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

const VERSION: Option<&'static str> = option_env!("CARGO_PKG_VERSION");

/// Application name used when neither the config file nor `APP_NAME` says
/// otherwise.
pub const DEFAULT_APP_NAME: &str = "TelemetryHub";

fn default_data_directory() -> PathBuf {
    Path::new("/tmp/telemetryhub-data").to_path_buf()
}

fn default_version() -> String {
    VERSION.unwrap_or("unknown").to_string()
}

/// Why a configuration could not be loaded.
#[derive(Debug)]
pub enum ConfigError {
    /// The config file could not be read.
    Io(PathBuf, io::Error),
    /// The config file is not valid TOML.
    Parse(toml::de::Error),
    /// A key holds a value of the wrong type or out of range.
    Invalid {
        /// The offending key, dotted.
        key: String,
        /// What was expected.
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ConfigError::Io(ref path, ref e) => {
                write!(f, "could not read {}: {}", path.display(), e)
            }
            ConfigError::Parse(ref e) => write!(f, "could not parse config file: {}", e),
            ConfigError::Invalid {
                ref key,
                ref reason,
            } => write!(f, "{}: {}", key, reason),
        }
    }
}

impl error::Error for ConfigError {}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> ConfigError {
        ConfigError::Parse(e)
    }
}

fn invalid<T>(key: &str, reason: &str) -> Result<T, ConfigError> {
    Err(ConfigError::Invalid {
        key: key.to_string(),
        reason: reason.to_string(),
    })
}

/// Where the HTTP surface listens.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpConfig {
    /// Interface to bind.
    pub host: String,
    /// Port to bind. Zero picks a free one.
    pub port: u16,
}

impl HttpConfig {
    /// `host:port`, suitable for binding.
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for HttpConfig {
    fn default() -> HttpConfig {
        HttpConfig {
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

/// Big configuration struct for the telemetryhub executable
///
/// This struct is what we construct from parsing the configuration. Please
/// see documentation on `parse_args` in this module for more details.
#[derive(Debug, Clone, PartialEq)]
pub struct Args {
    /// Name reported by the health endpoint. `APP_NAME` in the environment
    /// overrides the config file.
    pub app_name: String,
    /// Where spilled snapshots are written, under `spill/`.
    pub data_directory: PathBuf,
    /// Width of an aggregation window.
    pub window_size: Duration,
    /// Records the ingestion buffer holds before refusing more.
    pub buffer_capacity: usize,
    /// Wall-clock flush tick.
    pub flush_interval: Duration,
    /// How far behind the watermark a record may be and still be merged
    /// into the oldest open window.
    pub late_arrival_tolerance: Duration,
    /// Export retries after the first attempt.
    pub export_retry_count: u32,
    /// Backoff before the first export retry.
    pub export_backoff_base: Duration,
    /// Ceiling on export backoff.
    pub export_backoff_max: Duration,
    /// Largest accepted distance between a record's timestamp and now.
    pub clock_skew_tolerance: Duration,
    /// What to do with a snapshot that exhausted its retries.
    pub durability_policy: DurabilityPolicy,
    /// Records moved from buffer to engine per lock.
    pub batch_size: usize,
    /// Bound on the final flush.
    pub shutdown_timeout: Duration,
    /// HTTP surface, `None` to run without one.
    pub http: Option<HttpConfig>,
    /// Histogram bounds for series no mask matches.
    pub histogram_bounds: Vec<f64>,
    /// `(pattern, bounds)` pairs, first match wins.
    pub histogram_masks: Vec<(String, Vec<f64>)>,
    /// See `sink::Console` for more.
    pub console: Option<ConsoleConfig>,
    /// See `sink::Null` for more.
    pub null: Option<NullConfig>,
    /// The verbosity setting. The higher the value the more chatty
    /// telemetryhub gets.
    pub verbose: u64,
    /// Version string. This is set automatically.
    pub version: String,
}

impl Default for Args {
    fn default() -> Self {
        Args {
            app_name: DEFAULT_APP_NAME.to_string(),
            data_directory: default_data_directory(),
            window_size: Duration::from_secs(60),
            buffer_capacity: 10_000,
            flush_interval: Duration::from_secs(10),
            late_arrival_tolerance: Duration::from_secs(5),
            export_retry_count: 3,
            export_backoff_base: Duration::from_millis(100),
            export_backoff_max: Duration::from_secs(5),
            clock_skew_tolerance: Duration::from_secs(300),
            durability_policy: DurabilityPolicy::Drop,
            batch_size: 512,
            shutdown_timeout: Duration::from_secs(10),
            http: Some(HttpConfig::default()),
            histogram_bounds: DEFAULT_BOUNDS.to_vec(),
            histogram_masks: Vec::new(),
            console: None,
            null: None,
            verbose: 0,
            version: default_version(),
        }
    }
}

impl Args {
    /// The scheduler's share of the configuration.
    pub fn flush_config(&self) -> FlushConfig {
        FlushConfig {
            flush_interval: self.flush_interval,
            retry_count: self.export_retry_count,
            backoff_base: self.export_backoff_base,
            backoff_max: self.export_backoff_max,
            durability: self.durability_policy,
            shutdown_timeout: self.shutdown_timeout,
        }
    }

    /// Compile the histogram layout.
    pub fn histogram(&self) -> Result<HistogramBounds, BoundsError> {
        HistogramBounds::new(&self.histogram_bounds, &self.histogram_masks)
    }
}

/// Parse the telemetryhub configuration arguments
///
/// This function will read the environment arguments and construct an
/// `Args`. Without `--config` every option takes its default.
pub fn parse_args() -> Result<Args, ConfigError> {
    let args = App::new("telemetryhub")
        .version(VERSION.unwrap_or("unknown"))
        .about("telemetry ingestion and windowed aggregation")
        .arg(
            Arg::with_name("config-file")
                .long("config")
                .short("C")
                .value_name("config")
                .help("The config file to feed in.")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .multiple(true)
                .help("Turn on verbose output."),
        )
        .get_matches();

    let verb = args.occurrences_of("verbose");

    let mut parsed = match args.value_of("config-file") {
        Some(filename) => {
            let path = Path::new(filename);
            let mut buffer = String::new();
            File::open(path)
                .and_then(|mut fp| fp.read_to_string(&mut buffer))
                .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
            parse_config_file(&buffer, verb)?
        }
        None => Args {
            verbose: verb,
            ..Default::default()
        },
    };
    override_app_name(&mut parsed, env::var("APP_NAME").ok());
    Ok(parsed)
}

/// Replace the app name with `name` when it is set and not blank.
pub fn override_app_name(args: &mut Args, name: Option<String>) {
    if let Some(name) = name {
        let name = name.trim();
        if !name.is_empty() {
            args.app_name = name.to_string();
        }
    }
}

fn seconds(value: &toml::Value, key: &str) -> Result<Duration, ConfigError> {
    let secs = match *value {
        toml::Value::Integer(i) => i as f64,
        toml::Value::Float(f) => f,
        _ => return invalid(key, "must be a number of seconds"),
    };
    if !secs.is_finite() || secs < 0.0 {
        return invalid(key, "must be a non-negative number of seconds");
    }
    Ok(Duration::from_millis((secs * 1_000.0).round() as u64))
}

fn count(value: &toml::Value, key: &str) -> Result<u64, ConfigError> {
    match value.as_integer() {
        Some(i) if i >= 0 => Ok(i as u64),
        _ => invalid(key, "must be a non-negative integer"),
    }
}

fn string(value: &toml::Value, key: &str) -> Result<String, ConfigError> {
    match value.as_str() {
        Some(s) => Ok(s.to_string()),
        None => invalid(key, "must be a string"),
    }
}

fn bounds(value: &toml::Value, key: &str) -> Result<Vec<f64>, ConfigError> {
    let arr = match value.as_array() {
        Some(arr) => arr,
        None => return invalid(key, "must be an array of numbers"),
    };
    let mut out = Vec::with_capacity(arr.len());
    for v in arr {
        match *v {
            toml::Value::Integer(i) => out.push(i as f64),
            toml::Value::Float(f) => out.push(f),
            _ => return invalid(key, "must be an array of numbers"),
        }
    }
    Ok(out)
}

/// Parse the telemetryhub configuration file.
///
/// Keys are kebab-case at the top level, with `[http]`, `[histogram]` and
/// `[sinks.*]` tables. Unknown keys are ignored.
pub fn parse_config_file(buffer: &str, verbosity: u64) -> Result<Args, ConfigError> {
    let mut args = Args::default();
    let value: toml::Value = toml::from_str(buffer)?;

    args.verbose = verbosity;

    if let Some(v) = value.get("app-name") {
        args.app_name = string(v, "app-name")?;
    }
    if let Some(v) = value.get("data-directory") {
        args.data_directory = Path::new(&string(v, "data-directory")?).to_path_buf();
    }
    if let Some(v) = value.get("window-size") {
        args.window_size = seconds(v, "window-size")?;
        if args.window_size < Duration::from_millis(1) {
            return invalid("window-size", "must be at least one millisecond");
        }
    }
    if let Some(v) = value.get("buffer-capacity") {
        args.buffer_capacity = count(v, "buffer-capacity")? as usize;
        if args.buffer_capacity == 0 {
            return invalid("buffer-capacity", "must be positive");
        }
    }
    if let Some(v) = value.get("flush-interval") {
        args.flush_interval = seconds(v, "flush-interval")?;
    }
    if let Some(v) = value.get("late-arrival-tolerance") {
        args.late_arrival_tolerance = seconds(v, "late-arrival-tolerance")?;
    }
    if let Some(v) = value.get("export-retry-count") {
        let n = count(v, "export-retry-count")?;
        if n > u64::from(u32::max_value()) {
            return invalid("export-retry-count", "is too large");
        }
        args.export_retry_count = n as u32;
    }
    if let Some(v) = value.get("export-backoff-base") {
        args.export_backoff_base = seconds(v, "export-backoff-base")?;
    }
    if let Some(v) = value.get("export-backoff-max") {
        args.export_backoff_max = seconds(v, "export-backoff-max")?;
    }
    if let Some(v) = value.get("clock-skew-tolerance") {
        args.clock_skew_tolerance = seconds(v, "clock-skew-tolerance")?;
    }
    if let Some(v) = value.get("durability-policy") {
        let s = string(v, "durability-policy")?;
        args.durability_policy = match DurabilityPolicy::parse(&s) {
            Some(p) => p,
            None => return invalid("durability-policy", "must be \"drop\" or \"spill\""),
        };
    }
    if let Some(v) = value.get("batch-size") {
        args.batch_size = count(v, "batch-size")? as usize;
        if args.batch_size == 0 {
            return invalid("batch-size", "must be positive");
        }
    }
    if let Some(v) = value.get("shutdown-timeout") {
        args.shutdown_timeout = seconds(v, "shutdown-timeout")?;
    }

    if let Some(http) = value.get("http") {
        let enabled = match http.get("enabled") {
            Some(v) => match v.as_bool() {
                Some(b) => b,
                None => return invalid("http.enabled", "must be a boolean"),
            },
            None => true,
        };
        if enabled {
            let mut cfg = HttpConfig::default();
            if let Some(v) = http.get("host") {
                cfg.host = string(v, "http.host")?;
            }
            if let Some(v) = http.get("port") {
                let port = count(v, "http.port")?;
                if port > u64::from(u16::max_value()) {
                    return invalid("http.port", "must fit in 16 bits");
                }
                cfg.port = port as u16;
            }
            args.http = Some(cfg);
        } else {
            args.http = None;
        }
    }

    if let Some(hist) = value.get("histogram") {
        if let Some(v) = hist.get("bounds") {
            args.histogram_bounds = bounds(v, "histogram.bounds")?;
        }
        if let Some(masks) = hist.get("mask") {
            let masks = match masks.as_array() {
                Some(masks) => masks,
                None => return invalid("histogram.mask", "must be an array of tables"),
            };
            for mask in masks {
                let pattern = match mask.get("match") {
                    Some(v) => string(v, "histogram.mask.match")?,
                    None => return invalid("histogram.mask", "needs a match pattern"),
                };
                let bs = match mask.get("bounds") {
                    Some(v) => bounds(v, "histogram.mask.bounds")?,
                    None => return invalid("histogram.mask", "needs bounds"),
                };
                args.histogram_masks.push((pattern, bs));
            }
        }
    }

    if let Some(sinks) = value.get("sinks") {
        if sinks.get("console").is_some() {
            args.console = Some(ConsoleConfig::new("sinks.console".to_string()));
        }
        if sinks.get("null").is_some() {
            args.null = Some(NullConfig::new("sinks.null".to_string()));
        }
    }

    Ok(args)
}
