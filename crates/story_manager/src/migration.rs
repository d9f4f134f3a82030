//! One-way migration from the v1 flat message array to the branch/turn/page tree.
//!
//! # Legacy Format
//! ```text
//! [
//!   { "role": "user", "content": "hi", "timestamp": 1 },
//!   { "role": "assistant", "content": ["a", "b"], "timestamp": 2, "activeSwipeIndex": 1 }
//! ]
//! ```
//!
//! Each legacy entry becomes one turn. Assistant entries with several contents
//! become one turn with one page per content. The page at the active swipe
//! keeps the entry's id; the other swipes get ids derived from it. Entries
//! without an id are given `legacy-{position}`.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{Result, StoryError};
use crate::structs::history::{History, HISTORY_VERSION};
use crate::structs::page::{Page, Role};
use crate::structs::turn::Turn;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LegacyContent {
    Single(String),
    Swipes(Vec<String>),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyMessage {
    role: String,
    content: LegacyContent,
    #[serde(default)]
    timestamp: Option<Value>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    active_swipe_index: Option<usize>,
    #[serde(default)]
    is_valid: Option<bool>,
}

/// Whether a stored history document predates the version marker.
pub fn is_legacy(document: &Value) -> bool {
    match document {
        Value::Array(_) => true,
        Value::Object(map) => !map.contains_key("version"),
        _ => false,
    }
}

/// Convert a v1 document (the bare array, or an object wrapping it in
/// `messages`) into a v2 history on the default branch.
pub fn migrate_v1_to_v2(document: &Value) -> Result<History> {
    let entries = match document {
        Value::Array(entries) => entries,
        Value::Object(map) => match map.get("messages") {
            Some(Value::Array(entries)) => entries,
            _ => {
                return Err(StoryError::Parse(
                    "legacy history object has no 'messages' array".to_string(),
                ))
            }
        },
        _ => {
            return Err(StoryError::Parse(
                "legacy history must be an array of messages".to_string(),
            ))
        }
    };

    let mut history = History::new();
    history.version = HISTORY_VERSION;
    let mut skipped = 0usize;

    {
        let branch = history.active_branch_mut()?;
        let mut parent_id: Option<String> = None;

        for (position, raw) in entries.iter().enumerate() {
            let entry: LegacyMessage = match serde_json::from_value(raw.clone()) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(
                        position = position,
                        error = %e,
                        "Migration: Skipping unreadable legacy message"
                    );
                    skipped += 1;
                    continue;
                }
            };

            if entry.is_valid == Some(false) {
                tracing::debug!(position = position, "Migration: Skipping invalid legacy message");
                skipped += 1;
                continue;
            }

            let created_at = parse_timestamp(entry.timestamp.as_ref());
            let original_id = entry
                .id
                .clone()
                .unwrap_or_else(|| format!("legacy-{}", position));
            let contents = match entry.content {
                LegacyContent::Single(text) => vec![text],
                LegacyContent::Swipes(texts) => texts,
            };
            if contents.is_empty() {
                skipped += 1;
                continue;
            }
            let active = entry
                .active_swipe_index
                .unwrap_or(0)
                .min(contents.len() - 1);

            let turn_index = branch.next_turn_index();
            let turn = if entry.role == "user" {
                let text = contents.into_iter().nth(active).unwrap_or_default();
                let mut page = Page::new(Role::User, text, parent_id.clone()).with_id(original_id);
                page.created_at = created_at;
                Turn::user(page)
            } else {
                let role = if entry.role == "summary" {
                    Role::Summary
                } else {
                    Role::Assistant
                };
                let mut turn = Turn::assistant();
                for (index, text) in contents.into_iter().enumerate() {
                    let id = if index == active {
                        original_id.clone()
                    } else {
                        format!("{}-swipe-{}", original_id, index)
                    };
                    let mut page = Page::new(role, text, parent_id.clone()).with_id(id);
                    page.created_at = created_at;
                    turn.push_page(page);
                }
                turn.active_page_index = active;
                turn
            };

            parent_id = turn.active_page().map(|page| page.id.clone());
            branch.turns.insert(turn_index, turn);
        }
    }

    history.rebuild_index();

    tracing::info!(
        legacy_count = entries.len(),
        turn_count = history.active_branch()?.len(),
        skipped = skipped,
        "Migration: Legacy history migrated"
    );

    Ok(history)
}

fn parse_timestamp(raw: Option<&Value>) -> DateTime<Utc> {
    match raw {
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
            .unwrap_or_else(Utc::now),
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        _ => Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn detects_legacy_documents() {
        assert!(is_legacy(&json!([])));
        assert!(is_legacy(&json!({"messages": []})));
        assert!(!is_legacy(&json!({"version": 2, "branches": {}})));
    }

    #[test]
    fn invalid_and_empty_entries_are_skipped() {
        let history = migrate_v1_to_v2(&json!([
            {"role": "user", "content": "hi", "timestamp": 1},
            {"role": "assistant", "content": "broken", "timestamp": 2, "isValid": false},
            {"role": "assistant", "content": [], "timestamp": 3},
            {"role": "assistant", "content": "ok", "timestamp": 4}
        ]))
        .unwrap();

        let branch = history.active_branch().unwrap();
        assert_eq!(branch.len(), 2);
        assert_eq!(branch.turns[&1].active_page().unwrap().content, "ok");
    }

    #[test]
    fn timestamps_are_read_as_milliseconds() {
        let history = migrate_v1_to_v2(&json!([
            {"role": "user", "content": "hi", "timestamp": 1_700_000_000_000i64, "id": "u"}
        ]))
        .unwrap();
        let page = history.get_message("u").unwrap();
        assert_eq!(page.created_at.timestamp(), 1_700_000_000);
    }

    #[test]
    fn non_array_document_is_a_parse_failure() {
        assert!(matches!(migrate_v1_to_v2(&json!("text")), Err(StoryError::Parse(_))));
    }
}
