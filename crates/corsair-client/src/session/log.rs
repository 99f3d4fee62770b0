//! Append-only observer log attached to each session.
//!
//! Writers append from any task (stream loop, hook handlers, shell); readers
//! either snapshot the retained history or subscribe to live lines.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;

/// Lines retained per log for late readers.
const HISTORY_LIMIT: usize = 1024;
const LIVE_CAPACITY: usize = 256;

/// Severity of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One rendered line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Owner of the log (`session_id`, or `console`).
    pub source: String,
    pub level: LogLevel,
    pub text: String,
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.level {
            LogLevel::Info => "*",
            LogLevel::Warn => "!",
            LogLevel::Error => "x",
        };
        write!(f, "[{tag}] [{}] {}", self.source, self.text)
    }
}

/// Cheaply cloneable handle to one append-only log.
#[derive(Clone)]
pub struct SessionLog {
    inner: Arc<LogInner>,
}

struct LogInner {
    source: String,
    history: Mutex<VecDeque<LogLine>>,
    live: broadcast::Sender<LogLine>,
}

impl SessionLog {
    pub fn new(source: impl Into<String>) -> Self {
        let (live, _) = broadcast::channel(LIVE_CAPACITY);
        Self {
            inner: Arc::new(LogInner {
                source: source.into(),
                history: Mutex::new(VecDeque::new()),
                live,
            }),
        }
    }

    pub fn source(&self) -> &str {
        &self.inner.source
    }

    pub fn info(&self, text: impl Into<String>) {
        self.append(LogLevel::Info, text.into());
    }

    pub fn warn(&self, text: impl Into<String>) {
        self.append(LogLevel::Warn, text.into());
    }

    pub fn error(&self, text: impl Into<String>) {
        self.append(LogLevel::Error, text.into());
    }

    fn append(&self, level: LogLevel, text: String) {
        let line = LogLine {
            source: self.inner.source.clone(),
            level,
            text,
        };
        {
            let mut history = self
                .inner
                .history
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if history.len() == HISTORY_LIMIT {
                history.pop_front();
            }
            history.push_back(line.clone());
        }
        // No subscribers is normal when the session is not the active target.
        let _ = self.inner.live.send(line);
    }

    /// Retained history, oldest first.
    pub fn lines(&self) -> Vec<LogLine> {
        self.inner
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Follow lines appended from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LogLine> {
        self.inner.live.subscribe()
    }
}

impl fmt::Debug for SessionLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLog")
            .field("source", &self.inner.source)
            .finish_non_exhaustive()
    }
}
