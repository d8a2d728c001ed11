//! Structured logging: one JSON object per line in
//! `<data_root>/logs/opensrc-mcp.log`, mirrored to stderr.
//!
//! Stdout carries the JSON-RPC transport, so diagnostics must never touch
//! it. The logger is a plain value owned by the [`crate::app::App`] and
//! passed where needed; there is no global.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

pub struct Logger {
    file: Mutex<Option<File>>,
}

impl Logger {
    /// Open (or create) the log file, creating the `logs/` directory.
    /// A logger without a file still mirrors to stderr.
    pub fn open(path: &Path) -> Logger {
        let file = (|| {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).ok()?;
            }
            OpenOptions::new().create(true).append(true).open(path).ok()
        })();

        if file.is_none() {
            eprintln!("opensrc: could not open log file {}", path.display());
        }

        Logger {
            file: Mutex::new(file),
        }
    }

    /// Logger that only writes to stderr. Used by tests and one-shot CLI
    /// commands.
    pub fn stderr_only() -> Logger {
        Logger {
            file: Mutex::new(None),
        }
    }

    pub fn log(&self, level: Level, msg: &str, fields: serde_json::Value) {
        let mut entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "level": level.as_str(),
            "msg": msg,
        });
        if let (Some(obj), serde_json::Value::Object(extra)) = (entry.as_object_mut(), fields) {
            for (k, v) in extra {
                obj.insert(k, v);
            }
        }

        let line = entry.to_string();
        eprintln!("{}", line);

        if let Ok(mut guard) = self.file.lock() {
            if let Some(file) = guard.as_mut() {
                let _ = writeln!(file, "{}", line);
            }
        }
    }

    pub fn debug(&self, msg: &str) {
        self.log(Level::Debug, msg, json!({}));
    }

    pub fn info(&self, msg: &str) {
        self.log(Level::Info, msg, json!({}));
    }

    pub fn warn(&self, msg: &str) {
        self.log(Level::Warn, msg, json!({}));
    }

    pub fn error(&self, msg: &str) {
        self.log(Level::Error, msg, json!({}));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_json_lines() {
        let dir = std::env::temp_dir().join("opensrc-log-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("test.log");
        std::fs::remove_file(&path).ok();

        let logger = Logger::open(&path);
        logger.log(Level::Info, "hello", json!({"source": "zod"}));
        logger.warn("plain");

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["level"], "info");
        assert_eq!(first["msg"], "hello");
        assert_eq!(first["source"], "zod");

        std::fs::remove_dir_all(&dir).ok();
    }
}
