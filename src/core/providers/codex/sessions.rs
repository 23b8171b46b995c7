use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Days, Datelike, NaiveDate, Utc};
use serde::Deserialize;
use tracing::debug;

use super::limits::RateLimitSnapshot;
use crate::core::error::QuotaError;

#[derive(Deserialize)]
struct SessionRecord {
    timestamp: Option<String>,
    payload: Option<SessionPayload>,
}

#[derive(Deserialize)]
struct SessionPayload {
    rate_limits: Option<RateLimitSnapshot>,
}

/// Session logs live under `sessions/YYYY/MM/DD/*.jsonl`.
fn day_dir(sessions_dir: &Path, day: NaiveDate) -> PathBuf {
    sessions_dir
        .join(format!("{:04}", day.year()))
        .join(format!("{:02}", day.month()))
        .join(format!("{:02}", day.day()))
}

/// Most recently modified session log from `today`, else the day before.
pub async fn find_latest_session_file(sessions_dir: &Path, today: NaiveDate) -> Option<PathBuf> {
    let days = [Some(today), today.checked_sub_days(Days::new(1))];
    for day in days.into_iter().flatten() {
        let dir = day_dir(sessions_dir, day);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(_) => continue,
        };

        let mut newest: Option<(SystemTime, PathBuf)> = None;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) else {
                continue;
            };
            if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
                newest = Some((modified, path));
            }
        }
        if let Some((_, path)) = newest {
            return Some(path);
        }
    }
    None
}

/// Newest rate-limit snapshot in a session log, scanning from the end.
pub async fn extract_rate_limits(path: &Path) -> Option<RateLimitSnapshot> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Failed to read Codex session file");
            return None;
        }
    };
    content.lines().rev().find_map(parse_record)
}

fn parse_record(line: &str) -> Option<RateLimitSnapshot> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let record: SessionRecord = serde_json::from_str(line).ok()?;
    let mut snapshot = record.payload?.rate_limits?;
    if !snapshot.has_windows() {
        return None;
    }
    if let Some(at) = record
        .timestamp
        .as_deref()
        .and_then(|t| t.parse::<DateTime<Utc>>().ok())
    {
        snapshot.anchor_relative_resets(at);
    }
    Some(snapshot)
}

/// Rate limits from the freshest session log.
pub async fn read_rate_limits(sessions_dir: &Path, today: NaiveDate) -> Result<RateLimitSnapshot, QuotaError> {
    let file = find_latest_session_file(sessions_dir, today)
        .await
        .ok_or_else(|| QuotaError::NoData("No session data found".to_string()))?;
    debug!(path = %file.display(), "Reading Codex session log");
    extract_rate_limits(&file)
        .await
        .ok_or_else(|| QuotaError::NoData("No rate limit data in session".to_string()))
}
