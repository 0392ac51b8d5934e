//! Structured logging for the filedrop processes, inspired by OpenBSD's
//! `log.c`.
//!
//! The privileged parent logs human-readable lines to its own stderr.  The
//! unprivileged children instead emit newline-delimited JSON records; the
//! parent reads those from the child's log pipe and re-emits them under its
//! own logger with a `child` field attached.  Both formats carry the record's
//! structured key-value fields.

use derive_more::{Display, From};
use serde_json::{Map, Value};
use slog::{Drain, OwnedKVList, Record, KV};
use slog_scope::GlobalLoggerGuard;
use std::{
    fmt,
    io::{self, Write},
    sync::{Mutex, Once},
    thread,
    time::Duration,
};
use tokio::{runtime::Runtime, sync::mpsc, time};

mod envlogger;

/// Re-export the scoped logging macros.
pub use slog_scope::{debug, error, info, trace, warn};

/// Re-exported so callers can reason about record levels without depending
/// on `slog` themselves.
pub use slog::Level;

static LOG_BRIDGE: Once = Once::new();

/// Configuration for the logging crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct Config {
    /// Emit newline-delimited JSON records instead of human-readable text.
    ///
    /// This is the format the supervisor expects on a child's log pipe.
    pub json: bool,
    /// Lower the default filter from `info` to `debug`.
    pub verbose: bool,
}

/// Logging errors.
#[derive(Debug, Display, From)]
pub enum Error {
    #[display(fmt = "{}", "_0")]
    IoError(io::Error),
    #[display(fmt = "{}", "_0")]
    SendError(mpsc::error::SendError<Entry>),
}

impl std::error::Error for Error {}

/// Output format of a drain.
#[derive(Clone, Copy, Debug)]
enum Format {
    /// `name: message, key: value` lines for human eyes.
    Text,
    /// One JSON object per line for the supervisor to demultiplex.
    Json,
}

impl From<&Config> for Format {
    fn from(config: &Config) -> Self {
        if config.json {
            Format::Json
        } else {
            Format::Text
        }
    }
}

fn init(
    drain: Box<dyn Drain<Err = slog::Never, Ok = ()> + Send>,
    config: &Config,
) -> GlobalLoggerGuard {
    let default_filter = if config.verbose { "debug" } else { "info" };
    let drain = envlogger::Filtered::with_default_filter(drain, default_filter);

    // This is required to make the drain `UnwindSafe`.
    let drain = Mutex::new(drain.fuse());

    let logger = slog::Logger::root(drain.fuse(), slog::o!()).into_erased();

    let guard = slog_scope::set_global_logger(logger);
    LOG_BRIDGE.call_once(|| {
        let _ = slog_stdlog::init();
    });

    guard
}

/// Install a global logger whose records are written by a background task.
pub async fn async_logger(name: &str, config: &Config) -> Result<GlobalLoggerGuard, Error> {
    let drain = Async::new(name, config.into()).await;

    Ok(init(Box::new(drain.fuse()), config))
}

/// Install a global logger that writes records inline.
pub fn sync_logger(name: &str, config: &Config) -> Result<GlobalLoggerGuard, Error> {
    let drain = Stderr::new(name, config.into());

    Ok(init(Box::new(drain.fuse()), config))
}

/// Inline drain writing every record straight to stderr.
pub struct Stderr {
    name: String,
    format: Format,
}

impl Stderr {
    fn new(name: &str, format: Format) -> Self {
        Self {
            name: name.to_string(),
            format,
        }
    }
}

impl Drain for Stderr {
    type Ok = ();
    type Err = Error;

    fn log(&self, record: &Record<'_>, values: &OwnedKVList) -> Result<Self::Ok, Self::Err> {
        write_line(&format_record(&self.name, self.format, record, values))
    }
}

fn write_line(line: &str) -> Result<(), Error> {
    let mut stderr = io::stderr().lock();
    stderr.write_all(line.as_bytes())?;
    stderr.write_all(b"\n").map_err(Into::into)
}

/// Async drain that formats inline but hands the finished line to a
/// background task for the actual write.
pub struct Async {
    name: String,
    format: Format,
    sender: mpsc::UnboundedSender<Entry>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl Async {
    async fn new(name: &str, format: Format) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Entry>();

        let handle = tokio::spawn(async move {
            while let Some(Entry::Line(line)) = receiver.recv().await {
                let _ = write_line(&line);
            }
        });

        Self {
            name: name.to_string(),
            format,
            sender,
            handle: Some(handle),
        }
    }
}

impl Drain for Async {
    type Ok = ();
    type Err = Error;

    fn log(&self, record: &Record<'_>, values: &OwnedKVList) -> Result<Self::Ok, Self::Err> {
        let line = format_record(&self.name, self.format, record, values);
        self.sender.send(Entry::Line(line)).map_err(Into::into)
    }
}

impl Drop for Async {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.sender.send(Entry::Close);

            let waiter = thread::spawn(|| {
                if let Ok(runtime) = Runtime::new() {
                    runtime.block_on(async move {
                        let _ = time::timeout(Duration::from_secs(1), handle).await;
                    });
                }
            });
            let _ = waiter.join();
        }
    }
}

/// Message from the drain to the background writer.
#[derive(Clone, Debug)]
pub enum Entry {
    Line(String),
    Close,
}

#[inline]
fn format_record(name: &str, format: Format, record: &Record<'_>, values: &OwnedKVList) -> String {
    match format {
        Format::Text => {
            let mut formatter = TextFormatter::new(name, record);
            let _ = record.kv().serialize(record, &mut formatter);
            let _ = values.serialize(record, &mut formatter);
            formatter.into_string()
        }
        Format::Json => {
            let mut formatter = JsonFormatter::new(record);
            let _ = record.kv().serialize(record, &mut formatter);
            let _ = values.serialize(record, &mut formatter);
            formatter.into_string()
        }
    }
}

/// Formatter producing `name: message, key: value` lines.
struct TextFormatter {
    buf: String,
}

impl TextFormatter {
    fn new(name: &str, record: &Record<'_>) -> Self {
        let mut buf = format!("{}: {}", name, record.msg());

        if record.level() >= Level::Debug {
            buf.push_str(&format!(", source: {}:{}", record.file(), record.line()));
        }

        Self { buf }
    }

    fn into_string(self) -> String {
        self.buf
    }
}

impl slog::Serializer for TextFormatter {
    fn emit_arguments(&mut self, key: &str, val: &fmt::Arguments<'_>) -> slog::Result {
        self.buf.push_str(&format!(", {}: {}", key, val));
        Ok(())
    }
}

/// Formatter producing one JSON object per record.
///
/// The `level` and `msg` keys are fixed; every key-value field of the record
/// becomes an additional member.  The supervisor relies on exactly this shape
/// when it re-parses a child's log lines.
struct JsonFormatter {
    map: Map<String, Value>,
}

impl JsonFormatter {
    fn new(record: &Record<'_>) -> Self {
        let mut map = Map::new();
        map.insert(
            "level".to_string(),
            Value::String(record.level().as_str().to_lowercase()),
        );
        map.insert("msg".to_string(), Value::String(record.msg().to_string()));

        Self { map }
    }

    fn into_string(self) -> String {
        Value::Object(self.map).to_string()
    }
}

impl slog::Serializer for JsonFormatter {
    fn emit_arguments(&mut self, key: &str, val: &fmt::Arguments<'_>) -> slog::Result {
        self.map
            .insert(key.to_string(), Value::String(format!("{}", val)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn log_to_stderr() {
        let config = Config {
            json: false,
            verbose: true,
        };
        let _guard = async_logger("test", &config).await.unwrap();

        for i in 1..=100 {
            info!("Hello, World!"; "i" => i);
            debug!("Hello, World!"; "i" => i);
        }
    }

    #[test]
    fn json_formatter_shape() {
        let line = format_record(
            "test",
            Format::Json,
            &slog::record!(
                Level::Info,
                "",
                &format_args!("something happened"),
                slog::b!("id" => "abc")
            ),
            &slog::o!().into(),
        );

        let parsed: Map<String, Value> = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["level"], "info");
        assert_eq!(parsed["msg"], "something happened");
        assert_eq!(parsed["id"], "abc");
    }
}
