use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::structs::event::GameEvent;

/// The derived state tree. Top-level keys are namespaces (`world`,
/// `characters`, ...); handlers may add new ones.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct WorldState {
    /// Every event batch handed to dispatch, in arrival order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub event_history: Vec<GameEvent>,

    #[serde(flatten)]
    pub namespaces: Map<String, Value>,
}

impl WorldState {
    pub fn from_namespaces(namespaces: Map<String, Value>) -> Self {
        Self {
            event_history: Vec::new(),
            namespaces,
        }
    }

    pub fn get(&self, namespace: &str) -> Option<&Value> {
        self.namespaces.get(namespace)
    }

    /// Mutable access to a namespace, created as an empty object when absent.
    pub fn namespace_mut(&mut self, namespace: &str) -> &mut Value {
        self.namespaces
            .entry(namespace.to_string())
            .or_insert_with(|| Value::Object(Map::new()))
    }

    pub fn insert(&mut self, namespace: impl Into<String>, value: Value) {
        self.namespaces.insert(namespace.into(), value);
    }

    /// A fresh state holding copies of the named namespaces only.
    pub fn subset<S: AsRef<str>>(&self, names: &[S]) -> WorldState {
        let namespaces = names
            .iter()
            .filter_map(|name| {
                self.namespaces
                    .get(name.as_ref())
                    .map(|value| (name.as_ref().to_string(), value.clone()))
            })
            .collect();
        WorldState::from_namespaces(namespaces)
    }

    /// A copy without the audit trail and without the given namespaces.
    pub fn stripped(&self, excluded: &[&str]) -> WorldState {
        let namespaces = self
            .namespaces
            .iter()
            .filter(|(key, _)| !excluded.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        WorldState::from_namespaces(namespaces)
    }

    /// Top-level namespaces present in `template` but missing here.
    pub fn missing_namespaces(&self, template: &WorldState) -> Vec<String> {
        template
            .namespaces
            .keys()
            .filter(|key| !self.namespaces.contains_key(*key))
            .cloned()
            .collect()
    }

    /// `template` overlaid with this state: values present here win, keys only
    /// in the template are filled in at every depth.
    pub fn merged_over(&self, template: &WorldState) -> WorldState {
        let mut base = Value::Object(template.namespaces.clone());
        deep_merge(&mut base, &Value::Object(self.namespaces.clone()));
        let namespaces = match base {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        WorldState {
            event_history: self.event_history.clone(),
            namespaces,
        }
    }
}

/// Recursively merge `overlay` into `base`. Objects merge key by key, any
/// other value in `overlay` replaces the one in `base`.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}
