use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use super::normalize::normalize_event;
use crate::config::EngineConfig;
use crate::error::{Result, StoryError};
use crate::structs::event::GameEvent;
use crate::structs::page::Page;

static FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)```").expect("valid fence regex"));

static TRAILING_COMMA_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r",\s*([\]}])").expect("valid trailing comma regex"));

/// Finds the event block in page text and turns it into events.
#[derive(Debug, Clone)]
pub struct EventExtractor {
    block_re: Regex,
    events_field: String,
}

impl EventExtractor {
    pub fn new(tag: &str, events_field: &str) -> Result<Self> {
        let tag = regex::escape(tag.trim());
        let block_re = Regex::new(&format!(r"(?s)<{tag}>(.*?)</{tag}>"))
            .map_err(|e| StoryError::Config(format!("event block tag: {}", e)))?;
        Ok(Self {
            block_re,
            events_field: events_field.to_string(),
        })
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Self::new(&config.event_block_tag, &config.events_field)
    }

    /// Parse the last event block of `text`. `Ok(None)` when there is no block.
    pub fn parse_block(&self, text: &str) -> Result<Option<Value>> {
        let Some(block) = self
            .block_re
            .captures_iter(text)
            .last()
            .and_then(|caps| caps.get(1))
        else {
            return Ok(None);
        };

        let mut body = block.as_str();
        if let Some(inner) = FENCE_RE.captures(body).and_then(|caps| caps.get(1)) {
            body = inner.as_str();
        }

        let start = body
            .find('{')
            .ok_or_else(|| StoryError::Parse("event block has no JSON object".to_string()))?;
        let end = body
            .rfind('}')
            .filter(|end| *end > start)
            .ok_or_else(|| StoryError::Parse("event block JSON object is not closed".to_string()))?;

        let cleaned = TRAILING_COMMA_RE.replace_all(&body[start..=end], "$1");
        let value = serde_json::from_str(&cleaned)
            .map_err(|e| StoryError::Parse(format!("event block is not valid JSON: {}", e)))?;
        Ok(Some(value))
    }

    /// Events of the last block of `text`, attributed to `message_id`.
    pub fn extract_from_text(&self, text: &str, message_id: &str) -> Result<Vec<GameEvent>> {
        let Some(block) = self.parse_block(text)? else {
            return Ok(Vec::new());
        };

        let items = match block.get(&self.events_field) {
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(StoryError::Parse(format!(
                    "'{}' is not a list",
                    self.events_field
                )))
            }
            None => return Ok(Vec::new()),
        };

        Ok(items
            .iter()
            .enumerate()
            .filter_map(|(position, raw)| {
                normalize_event(raw, Some(message_id), &format!("{}#{}", message_id, position))
            })
            .collect())
    }

    /// Events of one page. A malformed block is logged and yields nothing.
    pub fn extract(&self, page: &Page) -> Vec<GameEvent> {
        match self.extract_from_text(&page.content, &page.id) {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(
                    message_id = %page.id,
                    error = %e,
                    "EventExtractor: Skipping malformed event block"
                );
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn extractor() -> EventExtractor {
        EventExtractor::new("statusbar", "events").unwrap()
    }

    #[test]
    fn raw_json_block() {
        let text = r#"The door opens.
<statusbar>{"events": [{"type": "open", "payload": {"door": 1}}]}</statusbar>"#;
        let events = extractor().extract_from_text(text, "m1").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "open");
        assert_eq!(events[0].event_id, "m1#0");
    }

    #[test]
    fn fenced_block_with_trailing_commas() {
        let text = "Story.\n<statusbar>\n```json\n{\n  \"events\": [\n    {\"type\": \"a\", \"payload\": {\"x\": 1,},},\n  ],\n}\n```\n</statusbar>";
        let events = extractor().extract_from_text(text, "m2").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, json!({"x": 1}));
    }

    #[test]
    fn last_block_wins() {
        let text = r#"<statusbar>{"events":[{"type":"old"}]}</statusbar>
later <statusbar>{"events":[{"type":"new"}]}</statusbar>"#;
        let events = extractor().extract_from_text(text, "m").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "new");
    }

    #[test]
    fn malformed_block_is_parse_failure_and_page_extract_is_empty() {
        let text = "<statusbar>{\"events\": [ {\"type\": </statusbar>";
        assert!(matches!(
            extractor().extract_from_text(text, "m"),
            Err(StoryError::Parse(_))
        ));

        let page = Page::new(crate::structs::page::Role::Assistant, text, None);
        assert!(extractor().extract(&page).is_empty());
    }

    #[test]
    fn text_without_block_has_no_events() {
        assert!(extractor()
            .extract_from_text("just prose", "m")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn untyped_items_are_filtered() {
        let text = r#"<statusbar>{"events":[{"payload":{}},{"type":"keep"}]}</statusbar>"#;
        let events = extractor().extract_from_text(text, "m").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, "m#1");
    }
}
