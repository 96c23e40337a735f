//! Script records and the repository holding them.

use super::ScriptError;
use crate::variables::Variables;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A named button a script declares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptButton {
    pub name: String,
    #[serde(default = "default_visible")]
    pub visible: bool,
}

fn default_visible() -> bool {
    true
}

impl ScriptButton {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            visible: true,
        }
    }

    pub fn hidden(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            visible: false,
        }
    }
}

/// One user script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub id: String,
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub info: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub buttons: Vec<ScriptButton>,
    /// Variables bound to the script itself
    #[serde(default)]
    pub data: Variables,
}

impl Script {
    /// A disabled script with a fresh id.
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: fresh_id(),
            name: name.into(),
            content: content.into(),
            info: String::new(),
            enabled: false,
            buttons: Vec::new(),
            data: Variables::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_buttons(mut self, buttons: Vec<ScriptButton>) -> Self {
        self.buttons = buttons;
        self
    }

    pub fn has_visible_buttons(&self) -> bool {
        self.buttons.iter().any(|button| button.visible)
    }
}

/// Script as it arrives from an import: everything optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptDraft {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub info: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub buttons: Option<Vec<ScriptButton>>,
    #[serde(default)]
    pub data: Option<Variables>,
}

impl ScriptDraft {
    /// Builds the script. A name is required; a blank id is replaced by a
    /// fresh one.
    pub fn into_script(self) -> Result<Script, ScriptError> {
        let name = self
            .name
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| ScriptError::Invalid("missing script name".to_string()))?;
        let id = self.id.filter(|id| !id.trim().is_empty()).unwrap_or_else(fresh_id);

        Ok(Script {
            id,
            name,
            content: self.content.unwrap_or_default(),
            info: self.info.unwrap_or_default(),
            enabled: self.enabled.unwrap_or(false),
            buttons: self.buttons.unwrap_or_default(),
            data: self.data.unwrap_or_default(),
        })
    }
}

pub(crate) fn fresh_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptType {
    Global,
    Character,
}

impl ScriptType {
    pub fn opposite(&self) -> ScriptType {
        match self {
            ScriptType::Global => ScriptType::Character,
            ScriptType::Character => ScriptType::Global,
        }
    }
}

impl fmt::Display for ScriptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptType::Global => f.write_str("global"),
            ScriptType::Character => f.write_str("character"),
        }
    }
}

/// Where a script lives in the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptOwner {
    Global,
    Character(String),
}

impl ScriptOwner {
    pub fn script_type(&self) -> ScriptType {
        match self {
            ScriptOwner::Global => ScriptType::Global,
            ScriptOwner::Character(_) => ScriptType::Character,
        }
    }
}

/// Every script the host knows about, plus the switches gating them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptRepository {
    #[serde(default = "default_visible")]
    pub global_script_enabled: bool,
    #[serde(default)]
    pub global: Vec<Script>,
    /// Character id → that character's scripts
    #[serde(default)]
    pub characters: BTreeMap<String, Vec<Script>>,
    /// Characters whose scripts are allowed to run
    #[serde(default)]
    pub characters_with_scripts: Vec<String>,
}

impl Default for ScriptRepository {
    fn default() -> Self {
        Self {
            global_script_enabled: true,
            global: Vec::new(),
            characters: BTreeMap::new(),
            characters_with_scripts: Vec::new(),
        }
    }
}

impl ScriptRepository {
    pub fn contains(&self, id: &str) -> bool {
        self.find(id).is_some()
    }

    pub fn find(&self, id: &str) -> Option<(ScriptOwner, &Script)> {
        if let Some(script) = self.global.iter().find(|script| script.id == id) {
            return Some((ScriptOwner::Global, script));
        }
        self.characters.iter().find_map(|(character, scripts)| {
            scripts
                .iter()
                .find(|script| script.id == id)
                .map(|script| (ScriptOwner::Character(character.clone()), script))
        })
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut Script> {
        if let Some(script) = self.global.iter_mut().find(|script| script.id == id) {
            return Some(script);
        }
        self.characters
            .values_mut()
            .flat_map(|scripts| scripts.iter_mut())
            .find(|script| script.id == id)
    }

    pub fn scripts_of(&self, owner: &ScriptOwner) -> &[Script] {
        match owner {
            ScriptOwner::Global => &self.global,
            ScriptOwner::Character(id) => self.characters.get(id).map(Vec::as_slice).unwrap_or(&[]),
        }
    }

    pub fn insert(&mut self, owner: &ScriptOwner, script: Script) {
        match owner {
            ScriptOwner::Global => self.global.push(script),
            ScriptOwner::Character(id) => self.characters.entry(id.clone()).or_default().push(script),
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<(ScriptOwner, Script)> {
        if let Some(index) = self.global.iter().position(|script| script.id == id) {
            return Some((ScriptOwner::Global, self.global.remove(index)));
        }
        for (character, scripts) in self.characters.iter_mut() {
            if let Some(index) = scripts.iter().position(|script| script.id == id) {
                return Some((ScriptOwner::Character(character.clone()), scripts.remove(index)));
            }
        }
        None
    }

    pub fn is_character_allowed(&self, character_id: &str) -> bool {
        self.characters_with_scripts.iter().any(|id| id == character_id)
    }

    /// Whether a script owned by `owner` may run while `active_character`
    /// is selected. The script's own `enabled` flag is checked separately.
    pub fn owner_may_run(&self, owner: &ScriptOwner, active_character: Option<&str>) -> bool {
        match owner {
            ScriptOwner::Global => self.global_script_enabled,
            ScriptOwner::Character(id) => {
                active_character == Some(id.as_str()) && self.is_character_allowed(id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_draft_requires_name_and_fills_id() {
        let missing: ScriptDraft = serde_json::from_value(json!({"content": "x"})).unwrap();
        assert!(matches!(missing.into_script(), Err(ScriptError::Invalid(_))));

        let blank_id: ScriptDraft = serde_json::from_value(json!({"id": "  ", "name": "n"})).unwrap();
        let script = blank_id.into_script().unwrap();
        assert!(!script.id.trim().is_empty());
        assert!(!script.enabled);

        let kept: ScriptDraft = serde_json::from_value(json!({"id": "abc", "name": "n"})).unwrap();
        assert_eq!(kept.into_script().unwrap().id, "abc");
    }

    #[test]
    fn test_button_visibility_defaults_to_true() {
        let button: ScriptButton = serde_json::from_value(json!({"name": "Go"})).unwrap();
        assert!(button.visible);
    }

    #[test]
    fn test_find_and_remove_across_owners() {
        let mut repo = ScriptRepository::default();
        repo.insert(&ScriptOwner::Global, Script::new("g", "").with_id("g1"));
        repo.insert(
            &ScriptOwner::Character("alice".to_string()),
            Script::new("c", "").with_id("c1"),
        );

        assert_eq!(repo.find("c1").unwrap().0, ScriptOwner::Character("alice".to_string()));
        assert_eq!(repo.find("g1").unwrap().0, ScriptOwner::Global);
        assert!(repo.find("nope").is_none());

        repo.find_mut("c1").unwrap().enabled = true;
        let (owner, removed) = repo.remove("c1").unwrap();
        assert_eq!(owner.script_type(), ScriptType::Character);
        assert!(removed.enabled);
        assert!(!repo.contains("c1"));
    }

    #[test]
    fn test_character_scripts_need_allow_list_and_active_character() {
        let mut repo = ScriptRepository::default();
        let owner = ScriptOwner::Character("alice".to_string());
        assert!(!repo.owner_may_run(&owner, Some("alice")));

        repo.characters_with_scripts.push("alice".to_string());
        assert!(repo.owner_may_run(&owner, Some("alice")));
        assert!(!repo.owner_may_run(&owner, Some("bob")));
        assert!(!repo.owner_may_run(&owner, None));

        assert!(repo.owner_may_run(&ScriptOwner::Global, None));
        repo.global_script_enabled = false;
        assert!(!repo.owner_may_run(&ScriptOwner::Global, None));
    }
}
