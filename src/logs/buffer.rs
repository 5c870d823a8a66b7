use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::bus::{DownloadProgress, LogKind, LogPayload};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogLine {
    pub id: u64,
    pub kind: LogKind,
    pub payload: LogPayload,
    pub created_at: DateTime<Utc>,
}

/// Bounded line buffer of one instance.
#[derive(Debug)]
pub(super) struct LogBuffer {
    next_id: u64,
    capacity: usize,
    lines: VecDeque<LogLine>,
}

impl LogBuffer {
    pub(super) fn new(capacity: usize) -> Self {
        Self {
            next_id: 1,
            capacity: capacity.max(1),
            lines: VecDeque::new(),
        }
    }

    /// Append a line and return its id. Download progress is merged into the
    /// trailing downloads line when there is one.
    pub(super) fn push(&mut self, payload: LogPayload) -> u64 {
        match payload {
            LogPayload::DownloadProgress(progress) => self.push_progress(progress),
            payload => self.append(payload),
        }
    }

    fn push_progress(&mut self, progress: DownloadProgress) -> u64 {
        if let Some(last) = self.lines.back_mut() {
            if let LogPayload::Downloads(downloads) = &mut last.payload {
                match downloads.iter_mut().find(|d| d.id == progress.id) {
                    Some(existing) => *existing = progress,
                    None => downloads.push(progress),
                }
                last.created_at = Utc::now();
                return last.id;
            }
        }
        self.append(LogPayload::Downloads(vec![progress]))
    }

    fn append(&mut self, payload: LogPayload) -> u64 {
        let id = self.next_id;
        self.next_id = self.next_id.saturating_add(1);
        self.lines.push_back(LogLine {
            id,
            kind: payload.kind(),
            payload,
            created_at: Utc::now(),
        });
        while self.lines.len() > self.capacity {
            self.lines.pop_front();
        }
        id
    }

    /// Remove and return the most recent line.
    pub(super) fn pop(&mut self) -> Option<LogLine> {
        self.lines.pop_back()
    }

    pub(super) fn snapshot(&self) -> Vec<LogLine> {
        self.lines.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(id: &str, status: &str, current: u64) -> LogPayload {
        LogPayload::DownloadProgress(DownloadProgress {
            id: id.to_string(),
            status: status.to_string(),
            current: Some(current),
            total: Some(100),
        })
    }

    #[test]
    fn eviction_keeps_newest_lines() {
        let mut buffer = LogBuffer::new(3);
        for i in 0..5 {
            buffer.push(LogPayload::Stdout(format!("line {}", i)));
        }
        let lines = buffer.snapshot();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].id, 3);
        assert_eq!(lines[2].payload, LogPayload::Stdout("line 4".to_string()));
    }

    #[test]
    fn progress_for_one_download_is_a_single_line() {
        let mut buffer = LogBuffer::new(10);
        buffer.push(LogPayload::Stdout("pulling".to_string()));
        for current in [10, 50, 100] {
            buffer.push(progress("layer1", "Downloading", current));
        }

        let lines = buffer.snapshot();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].kind, LogKind::Downloads);
        let LogPayload::Downloads(downloads) = &lines[1].payload else {
            unreachable!("merged line is a downloads line");
        };
        assert_eq!(downloads.len(), 1);
        assert_eq!(downloads[0].current, Some(100));
    }

    #[test]
    fn distinct_downloads_are_appended_to_the_same_line() {
        let mut buffer = LogBuffer::new(10);
        let first = buffer.push(progress("a", "Downloading", 1));
        let second = buffer.push(progress("b", "Downloading", 1));
        assert_eq!(first, second);
        assert_eq!(
            buffer.snapshot()[0].payload,
            LogPayload::Downloads(vec![
                DownloadProgress {
                    id: "a".to_string(),
                    status: "Downloading".to_string(),
                    current: Some(1),
                    total: Some(100),
                },
                DownloadProgress {
                    id: "b".to_string(),
                    status: "Downloading".to_string(),
                    current: Some(1),
                    total: Some(100),
                },
            ])
        );
    }

    #[test]
    fn progress_after_plain_line_starts_new_downloads_line() {
        let mut buffer = LogBuffer::new(10);
        buffer.push(progress("a", "Downloading", 1));
        buffer.push(LogPayload::Stderr("warning".to_string()));
        buffer.push(progress("a", "Pull complete", 100));
        assert_eq!(buffer.snapshot().len(), 3);
    }

    #[test]
    fn pop_returns_most_recent() {
        let mut buffer = LogBuffer::new(10);
        buffer.push(LogPayload::Stdout("a".to_string()));
        buffer.push(LogPayload::Stdout("b".to_string()));
        assert_eq!(
            buffer.pop().map(|l| l.payload),
            Some(LogPayload::Stdout("b".to_string()))
        );
        assert_eq!(buffer.snapshot().len(), 1);
    }
}
