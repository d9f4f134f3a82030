use serde_json::{Map, Value};

use crate::structs::event::GameEvent;

/// Event type whose payload carries another event under `event`.
pub const WRAPPER_EVENT_TYPE: &str = "wrapped_event";

const TYPE_FIELDS: [&str; 4] = ["type", "event_type", "eventType", "event"];
const PAYLOAD_FIELDS: [&str; 3] = ["payload", "data", "details"];
const ID_FIELDS: [&str; 2] = ["eventId", "event_id"];

/// Legacy event type whose payload used to be nested under `updates`.
const LEGACY_NESTED_TYPE: &str = "world_update";

/// Bring a raw event item into the canonical `{type, payload}` shape.
///
/// Returns `None` for items without a usable type. An explicit `eventId` or
/// `event_id` wins over `fallback_id` and is scoped by the source message, so
/// two pages reusing the same item id still yield distinct events. A plain
/// `id` is payload data.
pub fn normalize_event(
    raw: &Value,
    source_message_id: Option<&str>,
    fallback_id: &str,
) -> Option<GameEvent> {
    let object = raw.as_object()?;

    let event_type = TYPE_FIELDS
        .iter()
        .find_map(|field| object.get(*field).and_then(Value::as_str))
        .map(str::trim)
        .filter(|t| !t.is_empty())?
        .to_string();

    let mut payload = match PAYLOAD_FIELDS.iter().find_map(|field| object.get(*field)) {
        Some(payload) => payload.clone(),
        None => Value::Object(remaining_fields(object)),
    };

    if event_type == LEGACY_NESTED_TYPE {
        let lifted = match payload.as_object() {
            Some(p) if p.len() == 1 => p.get("updates").filter(|u| u.is_object()).cloned(),
            _ => None,
        };
        if let Some(lifted) = lifted {
            payload = lifted;
        }
    }

    let item_id = ID_FIELDS.iter().find_map(|field| match object.get(*field) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    });
    let event_id = match (item_id, source_message_id) {
        (Some(item_id), Some(message_id)) => format!("{}#{}", message_id, item_id),
        (Some(item_id), None) => item_id,
        (None, _) => fallback_id.to_string(),
    };

    Some(GameEvent {
        event_type,
        payload,
        source_message_id: source_message_id.map(str::to_string),
        event_id,
    })
}

fn remaining_fields(object: &Map<String, Value>) -> Map<String, Value> {
    object
        .iter()
        .filter(|(key, _)| {
            !TYPE_FIELDS.contains(&key.as_str()) && !ID_FIELDS.contains(&key.as_str())
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// The event carried by a wrapper event, if the wrapper is well formed.
pub fn unwrap_inner(wrapper: &GameEvent) -> Option<GameEvent> {
    let inner = wrapper.payload.get("event")?;
    normalize_event(
        inner,
        wrapper.source_message_id.as_deref(),
        &format!("{}/inner", wrapper.event_id),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_shape_passes_through() {
        let event = normalize_event(
            &json!({"type": "move", "payload": {"to": "cave"}}),
            Some("m1"),
            "m1#0",
        )
        .unwrap();
        assert_eq!(event.event_type, "move");
        assert_eq!(event.payload, json!({"to": "cave"}));
        assert_eq!(event.event_id, "m1#0");
        assert_eq!(event.source_message_id.as_deref(), Some("m1"));
    }

    #[test]
    fn legacy_field_names_are_adapted() {
        let event = normalize_event(
            &json!({"eventType": "damage", "data": {"amount": 3}, "eventId": "e-9"}),
            None,
            "fallback",
        )
        .unwrap();
        assert_eq!(event.event_type, "damage");
        assert_eq!(event.payload, json!({"amount": 3}));
        assert_eq!(event.event_id, "e-9");
    }

    #[test]
    fn flat_fields_become_payload() {
        let event =
            normalize_event(&json!({"event": "gain_item", "item": "rope", "qty": 1}), None, "x")
                .unwrap();
        assert_eq!(event.payload, json!({"item": "rope", "qty": 1}));
    }

    #[test]
    fn plain_id_stays_in_payload() {
        let event = normalize_event(
            &json!({"type": "character_update", "id": "mira", "updates": {"hp": 5}}),
            Some("m4"),
            "m4#0",
        )
        .unwrap();
        assert_eq!(event.event_id, "m4#0");
        assert_eq!(event.payload, json!({"id": "mira", "updates": {"hp": 5}}));
    }

    #[test]
    fn explicit_event_id_is_scoped_by_message() {
        let event = normalize_event(
            &json!({"type": "open", "eventId": "door", "payload": {}}),
            Some("m5"),
            "m5#0",
        )
        .unwrap();
        assert_eq!(event.event_id, "m5#door");
    }

    #[test]
    fn legacy_world_update_is_lifted() {
        let event = normalize_event(
            &json!({"event_type": "world_update", "data": {"updates": {"weather": "rain"}}}),
            None,
            "x",
        )
        .unwrap();
        assert_eq!(event.payload, json!({"weather": "rain"}));
    }

    #[test]
    fn items_without_type_are_dropped() {
        assert!(normalize_event(&json!({"payload": {}}), None, "x").is_none());
        assert!(normalize_event(&json!({"type": "  "}), None, "x").is_none());
        assert!(normalize_event(&json!("move"), None, "x").is_none());
    }

    #[test]
    fn wrapper_inner_event_inherits_source() {
        let wrapper = GameEvent::new(
            WRAPPER_EVENT_TYPE,
            json!({"event": {"type": "heal", "payload": {"hp": 2}}}),
            Some("m3".to_string()),
            "m3#1",
        );
        let inner = unwrap_inner(&wrapper).unwrap();
        assert_eq!(inner.event_type, "heal");
        assert_eq!(inner.event_id, "m3#1/inner");
        assert_eq!(inner.source_message_id.as_deref(), Some("m3"));
    }
}
