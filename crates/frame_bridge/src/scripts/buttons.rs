//! Button containers of running scripts.
//!
//! Each running script with at least one visible button owns one container,
//! `script_container_{script_id}`, holding its visible buttons in declared
//! order. A button's id, `{script_id}_{name}`, doubles as the name of the host
//! event fired when it is clicked.

use super::model::Script;
use serde::Serialize;
use std::sync::Mutex;
use tracing::debug;

pub fn container_id(script_id: &str) -> String {
    format!("script_container_{}", script_id)
}

/// Host event (and notification channel) fired by a button click.
pub fn button_event_name(script_id: &str, button_name: &str) -> String {
    format!("{}_{}", script_id, button_name)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedButton {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ButtonContainer {
    pub id: String,
    pub script_id: String,
    pub buttons: Vec<RenderedButton>,
}

/// The rendered button bar, in the order scripts were rendered.
#[derive(Debug, Default)]
pub struct ButtonManager {
    containers: Mutex<Vec<ButtonContainer>>,
}

impl ButtonManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re)renders `script`'s container. A script without visible buttons
    /// has its container removed. Returns whether a container is shown.
    pub fn render(&self, script: &Script) -> bool {
        let buttons: Vec<RenderedButton> = script
            .buttons
            .iter()
            .filter(|button| button.visible)
            .map(|button| RenderedButton {
                id: button_event_name(&script.id, &button.name),
                name: button.name.clone(),
            })
            .collect();

        let mut containers = self.lock();
        let existing = containers.iter().position(|container| container.script_id == script.id);
        if buttons.is_empty() {
            if let Some(index) = existing {
                containers.remove(index);
            }
            return false;
        }

        debug!("Rendering {} button(s) for script {}", buttons.len(), script.id);
        let container = ButtonContainer {
            id: container_id(&script.id),
            script_id: script.id.clone(),
            buttons,
        };
        match existing {
            Some(index) => containers[index] = container,
            None => containers.push(container),
        }
        true
    }

    pub fn remove(&self, script_id: &str) -> bool {
        let mut containers = self.lock();
        let before = containers.len();
        containers.retain(|container| container.script_id != script_id);
        containers.len() != before
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn containers(&self) -> Vec<ButtonContainer> {
        self.lock().clone()
    }

    /// Whether `script_id` currently shows a button called `name`.
    pub fn is_rendered(&self, script_id: &str, name: &str) -> bool {
        self.lock()
            .iter()
            .filter(|container| container.script_id == script_id)
            .flat_map(|container| container.buttons.iter())
            .any(|button| button.name == name)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ButtonContainer>> {
        self.containers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripts::model::ScriptButton;

    #[test]
    fn test_only_visible_buttons_rendered() {
        let manager = ButtonManager::new();
        let script = Script::new("s", "")
            .with_id("s1")
            .with_buttons(vec![ScriptButton::new("Roll"), ScriptButton::hidden("Secret")]);

        assert!(manager.render(&script));
        let containers = manager.containers();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].id, "script_container_s1");
        assert_eq!(
            containers[0].buttons,
            vec![RenderedButton {
                id: "s1_Roll".to_string(),
                name: "Roll".to_string()
            }]
        );
        assert!(manager.is_rendered("s1", "Roll"));
        assert!(!manager.is_rendered("s1", "Secret"));
    }

    #[test]
    fn test_rerender_replaces_in_place() {
        let manager = ButtonManager::new();
        let first = Script::new("a", "").with_id("a").with_buttons(vec![ScriptButton::new("x")]);
        let second = Script::new("b", "").with_id("b").with_buttons(vec![ScriptButton::new("y")]);
        manager.render(&first);
        manager.render(&second);

        let updated = first.clone().with_buttons(vec![ScriptButton::new("z")]);
        manager.render(&updated);
        let ids: Vec<String> = manager.containers().into_iter().map(|c| c.script_id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(manager.is_rendered("a", "z"));

        assert!(!manager.render(&updated.with_buttons(vec![ScriptButton::hidden("z")])));
        assert_eq!(manager.containers().len(), 1);
        assert!(manager.remove("b"));
        assert!(!manager.remove("b"));
    }
}
