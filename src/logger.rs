//! logger.rs - the logging sink of a booster instance.
//!
//! Several instances usually share one host (that is the point of a
//! mesh), so every line carries an instance tag next to the target.
//! Humans get colored text on stdout; an optional log file gets one
//! JSON object per line for grepping across instances.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use log::{Level, LevelFilter, Log, Metadata, Record};
use serde::Serialize;

/// One rendered record, shared by both sinks.
#[derive(Serialize)]
struct Line<'a> {
    ts: String,
    lvl: &'static str,
    tag: &'a str,
    target: &'a str,
    msg: String,
}

pub struct StructuredLogger {
    /// Distinguishes this instance from the others on the host;
    /// conventionally its control port.
    tag: String,
    stdout: bool,
    file: Option<Mutex<File>>,
}

impl StructuredLogger {
    /// Installs the logger as the global sink.
    pub fn init(level: LevelFilter, tag: &str, log_path: Option<&str>, stdout: bool) -> Result<()> {
        let file = match log_path {
            Some(path) if !path.is_empty() => Some(Mutex::new(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("failed to open log file {}", path))?,
            )),
            _ => None,
        };

        log::set_boxed_logger(Box::new(StructuredLogger {
            tag: tag.to_string(),
            stdout,
            file,
        }))
        .context("failed to set global logger")?;
        log::set_max_level(level);
        Ok(())
    }
}

fn level_name(l: Level) -> &'static str {
    match l {
        Level::Error => "ERROR",
        Level::Warn => "WARN",
        Level::Info => "INFO",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

/// ANSI color code per level; trace stays dim.
fn level_color(l: Level) -> u8 {
    match l {
        Level::Error => 31,
        Level::Warn => 33,
        Level::Info => 32,
        Level::Debug => 36,
        Level::Trace => 90,
    }
}

impl Log for StructuredLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let now = Utc::now();
        let msg = record.args().to_string();

        if self.stdout {
            let mut out = io::stdout().lock();
            let _ = writeln!(
                out,
                "{} \x1b[{}m{:<5}\x1b[0m {} [{}] {}",
                now.format("%H:%M:%S%.3f"),
                level_color(record.level()),
                level_name(record.level()),
                self.tag,
                record.target(),
                msg,
            );
        }

        if let Some(file) = &self.file {
            let line = Line {
                ts: now.to_rfc3339_opts(SecondsFormat::Millis, true),
                lvl: level_name(record.level()),
                tag: &self.tag,
                target: record.target(),
                msg,
            };
            if let Ok(json) = serde_json::to_string(&line) {
                if let Ok(mut f) = file.lock() {
                    let _ = writeln!(f, "{}", json);
                }
            }
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.file {
            if let Ok(mut f) = file.lock() {
                let _ = f.flush();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_serializes_flat_keys() {
        let line = Line {
            ts: "2026-08-02T00:00:00.000Z".to_string(),
            lvl: level_name(Level::Info),
            tag: "4884",
            target: "booster",
            msg: "listening".to_string(),
        };
        let v: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&line).unwrap()).unwrap();
        assert_eq!(v["lvl"], "INFO");
        assert_eq!(v["tag"], "4884");
        assert_eq!(v["target"], "booster");
        assert_eq!(v["msg"], "listening");
    }

    #[test]
    fn every_level_has_a_distinct_color() {
        let mut colors: Vec<u8> = [
            Level::Error,
            Level::Warn,
            Level::Info,
            Level::Debug,
            Level::Trace,
        ]
        .iter()
        .map(|l| level_color(*l))
        .collect();
        colors.sort_unstable();
        colors.dedup();
        assert_eq!(colors.len(), 5);
    }
}
