//! Parsing of `docker pull` output into progress entries.

use crate::bus::{DownloadProgress, LogPayload};

/// Classify one line of `docker pull` output.
///
/// Layer lines (`<layer>: <status>`, optionally followed by a progress bar and
/// `current/total`) become [`LogPayload::DownloadProgress`]; anything else is
/// passed through as stdout.
pub fn parse_pull_line(line: &str) -> LogPayload {
    let trimmed = line.trim();
    let Some((id, rest)) = trimmed.split_once(": ") else {
        return LogPayload::Stdout(line.to_string());
    };
    if !is_layer_id(id) {
        return LogPayload::Stdout(line.to_string());
    }

    let (status, sizes) = match rest.find('[') {
        Some(bar) => {
            let after_bar = rest[bar..].split_once(']').map(|(_, s)| s).unwrap_or("");
            (rest[..bar].trim(), parse_sizes(after_bar))
        }
        None => (rest.trim(), None),
    };

    let (current, total) = sizes.unzip();
    LogPayload::DownloadProgress(DownloadProgress {
        id: id.to_string(),
        status: status.to_string(),
        current,
        total,
    })
}

fn is_layer_id(id: &str) -> bool {
    id.len() >= 12 && id.chars().all(|c| c.is_ascii_hexdigit())
}

/// `  12.5MB/25.1MB` → bytes.
fn parse_sizes(s: &str) -> Option<(u64, u64)> {
    let (current, total) = s.trim().split_once('/')?;
    Some((parse_size(current)?, parse_size(total)?))
}

fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim();
    let split = s
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let number: f64 = number.trim().parse().ok()?;
    let multiplier = match unit.trim() {
        "" | "B" => 1.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        _ => return None,
    };
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let bytes = (number * multiplier).round() as u64;
    Some(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_status_lines() {
        let payload = parse_pull_line("a2abf6c4d29d: Pull complete");
        assert_eq!(
            payload,
            LogPayload::DownloadProgress(DownloadProgress {
                id: "a2abf6c4d29d".to_string(),
                status: "Pull complete".to_string(),
                current: None,
                total: None,
            })
        );
    }

    #[test]
    fn progress_bar_lines_carry_sizes() {
        let payload =
            parse_pull_line("a2abf6c4d29d: Downloading [====>      ]  12.5MB/25MB");
        assert_eq!(
            payload,
            LogPayload::DownloadProgress(DownloadProgress {
                id: "a2abf6c4d29d".to_string(),
                status: "Downloading".to_string(),
                current: Some(12_500_000),
                total: Some(25_000_000),
            })
        );
    }

    #[test]
    fn other_lines_are_stdout() {
        for line in [
            "latest: Pulling from library/redis",
            "Digest: sha256:abcdef",
            "Status: Downloaded newer image for redis:latest",
        ] {
            assert_eq!(parse_pull_line(line), LogPayload::Stdout(line.to_string()));
        }
    }
}
