//! Generic handlers so the CLI can replay stories without game-specific code.

use serde_json::Value;
use story_manager::structs::world::deep_merge;
use story_manager::{GameEvent, StoryEngine, WorldState};

/// `world_update`: merge the payload into the `world` namespace.
fn world_update(state: &mut WorldState, event: &GameEvent) -> anyhow::Result<()> {
    if !event.payload.is_object() {
        anyhow::bail!("world_update payload must be an object");
    }
    deep_merge(state.namespace_mut("world"), &event.payload);
    Ok(())
}

/// `character_update`: `{"id": "...", "updates": {...}}` merged into
/// `characters.<id>`.
fn character_update(state: &mut WorldState, event: &GameEvent) -> anyhow::Result<()> {
    let id = event
        .payload
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("character_update needs a string 'id'"))?;
    let updates = event
        .payload
        .get("updates")
        .ok_or_else(|| anyhow::anyhow!("character_update needs 'updates'"))?;

    let characters = state.namespace_mut("characters");
    if !characters.is_object() {
        *characters = Value::Object(Default::default());
    }
    deep_merge(&mut characters[id], updates);
    Ok(())
}

pub fn register_defaults(engine: &StoryEngine) {
    engine.register_event_handler("world_update", world_update);
    engine.register_event_handler("character_update", character_update);
}
