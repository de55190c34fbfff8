//! Logging setup and machine log piping.
//!
//! The console subscriber is plain `tracing_subscriber::fmt`; `--logfile`
//! swaps in a non-blocking file writer. Bootstrap commands running inside
//! the machine emit JSON log lines on stderr; [`pipe_lines`] re-emits them
//! through `tracing` at their original level so in-machine progress shows
//! up interleaved with host-side logs.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, FixedOffset};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::errors::{KubenestError, KubenestResult};

/// Initialize the global subscriber.
///
/// `verbosity` is a level name (`trace`..`error`) or a full `EnvFilter`
/// directive; `RUST_LOG` takes precedence when set. The returned guard must
/// be held for the lifetime of the process when logging to a file.
pub fn init(
    verbosity: &str,
    logfile: Option<&Path>,
    json: bool,
) -> KubenestResult<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(verbosity))
        .map_err(|e| KubenestError::Settings(format!("bad verbosity {verbosity:?}: {e}")))?;

    if let Some(path) = logfile {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let (writer, guard) = tracing_appender::non_blocking(file);
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false);
        if json {
            builder.json().init();
        } else {
            builder.init();
        }
        Ok(Some(guard))
    } else {
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr);
        if json {
            builder.json().init();
        } else {
            builder.init();
        }
        Ok(None)
    }
}

/// One parsed line of in-machine JSON log output.
#[derive(Debug)]
pub struct ParsedEntry {
    pub time: DateTime<FixedOffset>,
    pub level: Level,
    pub message: String,
    pub fields: BTreeMap<String, Value>,
}

fn parse_level(label: &str) -> KubenestResult<Level> {
    // Levels as emitted by the in-machine bootstrapper.
    match label {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warning" | "warn" => Ok(Level::WARN),
        "error" | "fatal" | "panic" => Ok(Level::ERROR),
        other => Err(KubenestError::Internal(format!(
            "unknown log level: {other}"
        ))),
    }
}

impl ParsedEntry {
    /// Parse a JSON object into a log entry.
    ///
    /// `time`, `level` and `msg` are mandatory; everything else is carried
    /// along as structured fields.
    pub fn from_value(value: &Value) -> KubenestResult<ParsedEntry> {
        let object = value
            .as_object()
            .ok_or_else(|| KubenestError::Internal("log entry is not an object".into()))?;

        let raw_time = object
            .get("time")
            .ok_or_else(|| KubenestError::Internal("there is no time entry".into()))?;
        let time_string = raw_time
            .as_str()
            .ok_or_else(|| KubenestError::Internal(format!("bad type for time: {raw_time}")))?;
        let time = DateTime::parse_from_rfc3339(time_string)
            .map_err(|_| KubenestError::Internal(format!("bad time string: {time_string}")))?;

        let raw_level = object
            .get("level")
            .ok_or_else(|| KubenestError::Internal("no level in entry".into()))?;
        let level_string = raw_level
            .as_str()
            .ok_or_else(|| KubenestError::Internal(format!("bad type for level: {raw_level}")))?;
        let level = parse_level(level_string)?;

        let raw_message = object
            .get("msg")
            .ok_or_else(|| KubenestError::Internal("there is no message entry".into()))?;
        let message = raw_message
            .as_str()
            .ok_or_else(|| KubenestError::Internal(format!("bad message type: {raw_message}")))?
            .to_string();

        let fields: BTreeMap<String, Value> = object
            .iter()
            .filter(|(k, _)| !matches!(k.as_str(), "time" | "level" | "msg"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(ParsedEntry {
            time,
            level,
            message,
            fields,
        })
    }

    fn emit(&self, task: &str) {
        let mut rendered = self.message.clone();
        if !self.fields.is_empty() {
            let extra: Vec<String> = self
                .fields
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            rendered = format!("{rendered} [{}]", extra.join(" "));
        }
        match self.level {
            Level::TRACE => tracing::trace!(task, machine_time = %self.time, "{rendered}"),
            Level::DEBUG => tracing::debug!(task, machine_time = %self.time, "{rendered}"),
            Level::INFO => tracing::info!(task, machine_time = %self.time, "{rendered}"),
            Level::WARN => tracing::warn!(task, machine_time = %self.time, "{rendered}"),
            Level::ERROR => tracing::error!(task, machine_time = %self.time, "{rendered}"),
        }
    }
}

/// Re-emit machine output line by line until EOF.
///
/// JSON lines are parsed and logged at their original level; anything else
/// (including JSON that does not look like a log entry) is logged verbatim
/// at info level.
pub async fn pipe_lines<R>(reader: R, task: &str)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(&line) {
                    Ok(value) => match ParsedEntry::from_value(&value) {
                        Ok(entry) => entry.emit(task),
                        Err(err) => {
                            tracing::warn!(task, error = %err, raw = %line, "couldn't parse log")
                        }
                    },
                    Err(_) => tracing::info!(task, "{line}"),
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(task, error = %err, "error reading machine output");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> KubenestResult<ParsedEntry> {
        let value: Value = serde_json::from_str(line).expect("valid json");
        ParsedEntry::from_value(&value)
    }

    #[test]
    fn parses_basic_entry() {
        let entry =
            parse(r#"{"level":"info","msg":"Starting openrc...","time":"2024-01-11T14:44:25Z"}"#)
                .expect("entry");
        assert_eq!(entry.level, Level::INFO);
        assert_eq!(entry.message, "Starting openrc...");
        assert!(entry.fields.is_empty());
    }

    #[test]
    fn keeps_extra_fields() {
        let entry = parse(
            r#"{"level":"info","msg":"Applying...","time":"2024-01-11T14:44:25Z","step":"base"}"#,
        )
        .expect("entry");
        assert_eq!(entry.fields.len(), 1);
        assert_eq!(entry.fields["step"], Value::String("base".into()));
    }

    #[test]
    fn rejects_missing_time() {
        let err = parse(r#"{"level":"info","msg":"hello"}"#).unwrap_err();
        assert!(err.to_string().contains("there is no time entry"));
    }

    #[test]
    fn rejects_bad_time() {
        let err = parse(r#"{"level":"info","msg":"hello","time":12}"#).unwrap_err();
        assert!(err.to_string().contains("bad type for time"));
        let err = parse(r#"{"level":"info","msg":"hello","time":"tata"}"#).unwrap_err();
        assert!(err.to_string().contains("bad time string"));
    }

    #[test]
    fn rejects_missing_or_bad_level() {
        let err = parse(r#"{"msg":"hello","time":"2024-01-11T14:44:25Z"}"#).unwrap_err();
        assert!(err.to_string().contains("no level in entry"));
        let err = parse(r#"{"level":"toto","msg":"hello","time":"2024-01-11T14:44:25Z"}"#)
            .unwrap_err();
        assert!(err.to_string().contains("unknown log level: toto"));
        let err =
            parse(r#"{"level":12,"msg":"hello","time":"2024-01-11T14:44:25Z"}"#).unwrap_err();
        assert!(err.to_string().contains("bad type for level"));
    }

    #[test]
    fn rejects_missing_or_bad_message() {
        let err = parse(r#"{"level":"info","time":"2024-01-11T14:44:25Z"}"#).unwrap_err();
        assert!(err.to_string().contains("there is no message entry"));
        let err = parse(r#"{"level":"info","msg":12,"time":"2024-01-11T14:44:25Z"}"#).unwrap_err();
        assert!(err.to_string().contains("bad message type"));
    }

    #[tokio::test]
    async fn pipes_mixed_output_without_panicking() {
        let output = concat!(
            r#"{"level":"info","msg":"Starting openrc...","time":"2024-01-11T14:44:25Z"}"#,
            "\n",
            r#"{"msg":"no level here","time":"2024-01-11T14:44:25Z"}"#,
            "\n",
            "plain text line\n",
        );
        pipe_lines(output.as_bytes(), "test").await;
    }
}
