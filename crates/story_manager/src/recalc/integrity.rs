use crate::error::{Result, StoryError};
use crate::storage::{load_typed, Scope, StateStore};
use crate::structs::history::History;
use crate::structs::story_state::{MessageVariables, StoryState};
use crate::structs::world::WorldState;

/// Id of the page that carries the story's initial state: the active page of
/// turn 0, falling back to any other page of that turn.
pub fn first_message_ids(history: &History, branch_id: &str) -> Vec<String> {
    let Some(turn) = history
        .branches
        .get(branch_id)
        .and_then(|branch| branch.turns.get(&0))
    else {
        return Vec::new();
    };

    let active = turn.active_page().map(|p| p.id.clone());
    active
        .iter()
        .cloned()
        .chain(
            turn.pages
                .values()
                .filter(|page| active.as_ref() != Some(&page.id))
                .map(|page| page.id.clone()),
        )
        .collect()
}

async fn initial_state_from_first_message(
    store: &dyn StateStore,
    history: &History,
    branch_id: &str,
) -> Result<Option<WorldState>> {
    for message_id in first_message_ids(history, branch_id) {
        let vars =
            load_typed::<MessageVariables>(store, &Scope::Message(message_id.clone())).await?;
        if let Some(initial) = vars.and_then(|v| v.initial_state) {
            tracing::debug!(
                message_id = %message_id,
                "Integrity: Found initial state on first message"
            );
            return Ok(Some(initial));
        }
    }
    Ok(None)
}

/// Make sure both Genesis and its backup are present, recovering whichever
/// is missing. Returns whether anything had to be recovered.
pub async fn ensure_genesis(
    store: &dyn StateStore,
    history: &History,
    branch_id: &str,
    state: &mut StoryState,
) -> Result<bool> {
    match (&state.genesis, &state.genesis_backup) {
        (Some(_), Some(_)) => Ok(false),
        (None, Some(backup)) => {
            tracing::warn!("Integrity: Genesis missing, restored from backup");
            state.genesis = Some(backup.clone());
            Ok(true)
        }
        (Some(genesis), None) => {
            tracing::warn!("Integrity: Genesis backup missing, rebuilt from Genesis");
            state.genesis_backup = Some(genesis.clone());
            Ok(true)
        }
        (None, None) => {
            let Some(initial) = initial_state_from_first_message(store, history, branch_id).await?
            else {
                return Err(StoryError::DataIntegrity(format!(
                    "Genesis and its backup are missing and branch '{}' has no initial state to recover from",
                    branch_id
                )));
            };
            tracing::warn!(
                branch = %branch_id,
                "Integrity: Genesis and backup missing, recovered from first message"
            );
            let genesis = initial.stripped(&[]);
            state.genesis_backup = Some(genesis.clone());
            state.genesis = Some(genesis);
            Ok(true)
        }
    }
}

/// Bring the live world state up to the running schema version by filling
/// in everything the Genesis template has and the live state lacks.
///
/// Runs when the stamped version differs from `running_version` or a
/// top-level namespace is missing; stamps the running version afterwards.
pub fn reconcile_schema(state: &mut StoryState, genesis: &WorldState, running_version: u32) -> bool {
    let missing = state.world_state.missing_namespaces(genesis);
    let stamped = state.schema_version;
    if stamped == Some(running_version) && missing.is_empty() {
        return false;
    }

    tracing::info!(
        stored_version = ?stamped,
        running_version = running_version,
        missing = ?missing,
        "Integrity: Reconciling world state against Genesis"
    );
    state.world_state = state.world_state.merged_over(genesis);
    state.schema_version = Some(running_version);
    true
}
