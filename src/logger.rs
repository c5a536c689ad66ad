//! Run logger: styled terminal output plus the shared `log.txt`.
//!
//! Workers append concurrently; every record is a single small write on an
//! append-only handle, so interleaving stays line-atomic. Per-task buffers
//! feed the multi-task progress display.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use console::style;

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl Level {
    fn tag(&self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

pub struct RunLogger {
    log_path: PathBuf,
    verbose: bool,
    quiet: bool,
    task_buffers: Mutex<HashMap<String, Vec<String>>>,
}

impl RunLogger {
    pub fn new(log_path: PathBuf, verbose: bool) -> Self {
        Self {
            log_path,
            verbose,
            quiet: false,
            task_buffers: Mutex::new(HashMap::new()),
        }
    }

    /// A logger that never prints; file and buffers still record. Used by
    /// tests and by nested invocations that own the terminal themselves.
    pub fn quiet(log_path: PathBuf) -> Self {
        Self {
            log_path,
            verbose: false,
            quiet: true,
            task_buffers: Mutex::new(HashMap::new()),
        }
    }

    pub fn info(&self, msg: &str) {
        self.record(Level::Info, None, msg);
    }

    pub fn warn(&self, msg: &str) {
        self.record(Level::Warn, None, msg);
    }

    pub fn error(&self, msg: &str) {
        self.record(Level::Error, None, msg);
    }

    /// A line attributed to one task; also retained in that task's buffer.
    pub fn task(&self, task_id: &str, msg: &str) {
        self.record(Level::Info, Some(task_id), msg);
    }

    /// Verbose-only detail line (executor tool chatter and the like).
    pub fn detail(&self, task_id: &str, msg: &str) {
        self.buffer_line(task_id, msg);
        self.append_file(Level::Info, Some(task_id), msg);
        if self.verbose && !self.quiet {
            println!(
                "    {} {}",
                style("→").dim(),
                style(format!("[{task_id}] {msg}")).dim()
            );
        }
    }

    /// Snapshot of the retained lines for one task.
    pub fn task_lines(&self, task_id: &str) -> Vec<String> {
        self.task_buffers
            .lock()
            .map(|buffers| buffers.get(task_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    fn record(&self, level: Level, task_id: Option<&str>, msg: &str) {
        if let Some(id) = task_id {
            self.buffer_line(id, msg);
        }
        self.append_file(level, task_id, msg);
        if self.quiet {
            return;
        }
        let prefix = match task_id {
            Some(id) => format!("[{}] ", style(id).cyan()),
            None => String::new(),
        };
        match level {
            Level::Info => println!("{prefix}{msg}"),
            Level::Warn => println!("{prefix}{} {msg}", style("warning:").yellow().bold()),
            Level::Error => eprintln!("{prefix}{} {msg}", style("error:").red().bold()),
        }
    }

    fn buffer_line(&self, task_id: &str, msg: &str) {
        if let Ok(mut buffers) = self.task_buffers.lock() {
            let lines = buffers.entry(task_id.to_string()).or_default();
            lines.push(msg.to_string());
            // Keep the buffer bounded; the display only shows a tail anyway.
            if lines.len() > 200 {
                let excess = lines.len() - 200;
                lines.drain(..excess);
            }
        }
    }

    fn append_file(&self, level: Level, task_id: Option<&str>, msg: &str) {
        let scope = task_id.map(|id| format!(" [{id}]")).unwrap_or_default();
        let line = format!(
            "[{}] [{}]{} {}\n",
            chrono::Utc::now().to_rfc3339(),
            level.tag(),
            scope,
            msg
        );
        // Best effort: losing a log line must never fail the run.
        if let Some(parent) = self.log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
        {
            let _ = file.write_all(line.as_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn log_lines_land_in_shared_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.txt");
        let logger = RunLogger::quiet(path.clone());
        logger.info("starting run");
        logger.task("TASK1", "implementation attempt 1");
        logger.warn("commit failed; continuing");

        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("[INFO] starting run"));
        assert!(content.contains("[INFO] [TASK1] implementation attempt 1"));
        assert!(content.contains("[WARN] commit failed"));
    }

    #[test]
    fn task_buffer_keeps_per_task_lines() {
        let dir = tempdir().unwrap();
        let logger = RunLogger::quiet(dir.path().join("log.txt"));
        logger.task("TASK1", "one");
        logger.task("TASK2", "other");
        logger.detail("TASK1", "two");

        assert_eq!(logger.task_lines("TASK1"), vec!["one", "two"]);
        assert_eq!(logger.task_lines("TASK2"), vec!["other"]);
        assert!(logger.task_lines("TASK9").is_empty());
    }

    #[test]
    fn task_buffer_is_bounded() {
        let dir = tempdir().unwrap();
        let logger = RunLogger::quiet(dir.path().join("log.txt"));
        for i in 0..250 {
            logger.task("TASK1", &format!("line {i}"));
        }
        let lines = logger.task_lines("TASK1");
        assert_eq!(lines.len(), 200);
        assert_eq!(lines[0], "line 50");
        assert_eq!(lines[199], "line 249");
    }
}
