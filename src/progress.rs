//! Indexing progress reporting.
//!
//! The pipeline emits [`IndexProgressEvent`]s; the CLI renders them on
//! **stderr** so stdout stays parseable. Workers pass a reporter that
//! folds the events into the task's `progress` percentage.

use std::io::Write;

/// A single progress event for one indexing run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IndexProgressEvent {
    /// Content is being fetched from the source. Total unknown.
    Fetching { repository: String },
    /// Chunks embedded so far out of the chunks needing embedding.
    Embedding {
        repository: String,
        done: u64,
        total: u64,
    },
    /// The new index generation is being written.
    Committing { repository: String },
}

impl IndexProgressEvent {
    /// Coarse completion percentage: fetching is 0-10, embedding 10-90,
    /// committing 90.
    pub fn percent(&self) -> u8 {
        match self {
            Self::Fetching { .. } => 5,
            Self::Embedding { done, total, .. } => {
                if *total == 0 {
                    90
                } else {
                    (10 + (80 * done.min(total)) / total) as u8
                }
            }
            Self::Committing { .. } => 90,
        }
    }
}

/// Receives progress events from the indexing pipeline.
pub trait IndexProgressReporter: Send + Sync {
    fn report(&self, event: IndexProgressEvent);
}

/// Human-friendly progress on stderr: "index acme/widgets  embedding  120 / 1,024 chunks".
pub struct StderrProgress;

impl IndexProgressReporter for StderrProgress {
    fn report(&self, event: IndexProgressEvent) {
        let line = match &event {
            IndexProgressEvent::Fetching { repository } => {
                format!("index {}  fetching...\n", repository)
            }
            IndexProgressEvent::Embedding {
                repository,
                done,
                total,
            } => format!(
                "index {}  embedding  {} / {} chunks\n",
                repository,
                format_number(*done),
                format_number(*total)
            ),
            IndexProgressEvent::Committing { repository } => {
                format!("index {}  committing\n", repository)
            }
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl IndexProgressReporter for JsonProgress {
    fn report(&self, event: IndexProgressEvent) {
        let obj = match &event {
            IndexProgressEvent::Fetching { repository } => serde_json::json!({
                "event": "progress",
                "repository": repository,
                "phase": "fetching"
            }),
            IndexProgressEvent::Embedding {
                repository,
                done,
                total,
            } => serde_json::json!({
                "event": "progress",
                "repository": repository,
                "phase": "embedding",
                "done": done,
                "total": total
            }),
            IndexProgressEvent::Committing { repository } => serde_json::json!({
                "event": "progress",
                "repository": repository,
                "phase": "committing"
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

pub struct NoProgress;

impl IndexProgressReporter for NoProgress {
    fn report(&self, _event: IndexProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn IndexProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234567), "1,234,567");
    }

    #[test]
    fn percent_tracks_phases() {
        let repo = "acme/widgets".to_string();
        assert_eq!(IndexProgressEvent::Fetching { repository: repo.clone() }.percent(), 5);
        let half = IndexProgressEvent::Embedding {
            repository: repo.clone(),
            done: 5,
            total: 10,
        };
        assert_eq!(half.percent(), 50);
        let none = IndexProgressEvent::Embedding {
            repository: repo.clone(),
            done: 0,
            total: 0,
        };
        assert_eq!(none.percent(), 90);
        assert_eq!(IndexProgressEvent::Committing { repository: repo }.percent(), 90);
    }
}
