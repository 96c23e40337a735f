//! Request handlers exposing script buttons and script data to frames.
//!
//! Every request may name a `script_id`; without one it addresses the script
//! running in the requesting frame.

use super::manager::ScriptManager;
use super::model::ScriptButton;
use crate::message::Command;
use crate::system::HostBridge;
use crate::variables::Variables;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// `iframe_get_script_buttons`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetScriptButtons {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_id: Option<String>,
}

impl Command for GetScriptButtons {
    const TAG: &'static str = "iframe_get_script_buttons";
    type Output = Vec<ScriptButton>;
}

/// `iframe_replace_script_buttons`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplaceScriptButtons {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_id: Option<String>,
    pub buttons: Vec<ScriptButton>,
}

impl Command for ReplaceScriptButtons {
    const TAG: &'static str = "iframe_replace_script_buttons";
    type Output = ();
}

/// `iframe_append_script_buttons`: adds only buttons whose names are new.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppendScriptButtons {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_id: Option<String>,
    pub buttons: Vec<ScriptButton>,
}

impl Command for AppendScriptButtons {
    const TAG: &'static str = "iframe_append_script_buttons";
    type Output = ();
}

/// `iframe_get_script_variables`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetScriptVariables {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_id: Option<String>,
}

impl Command for GetScriptVariables {
    const TAG: &'static str = "iframe_get_script_variables";
    type Output = Variables;
}

/// `iframe_replace_script_variables`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplaceScriptVariables {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_id: Option<String>,
    pub variables: Variables,
}

impl Command for ReplaceScriptVariables {
    const TAG: &'static str = "iframe_replace_script_variables";
    type Output = ();
}

/// Registers the script request handlers on `bridge`.
pub fn register_script_handlers(bridge: &HostBridge, scripts: Arc<ScriptManager>) {
    let manager = Arc::clone(&scripts);
    bridge.register_command::<GetScriptButtons, _, _>(move |ctx, command| {
        let manager = Arc::clone(&manager);
        async move {
            let id = manager.resolve_script(&ctx.frame, command.script_id)?;
            Ok(manager.buttons(&id)?)
        }
    });

    let manager = Arc::clone(&scripts);
    bridge.register_command::<ReplaceScriptButtons, _, _>(move |ctx, command| {
        let manager = Arc::clone(&manager);
        async move {
            let id = manager.resolve_script(&ctx.frame, command.script_id)?;
            debug!("[frame {}] Replacing buttons of script {}", ctx.frame, id);
            manager.replace_buttons(&id, command.buttons)?;
            Ok(())
        }
    });

    let manager = Arc::clone(&scripts);
    bridge.register_command::<AppendScriptButtons, _, _>(move |ctx, command| {
        let manager = Arc::clone(&manager);
        async move {
            let id = manager.resolve_script(&ctx.frame, command.script_id)?;
            let added = manager.append_buttons(&id, command.buttons)?;
            debug!("[frame {}] Appended {} button(s) to script {}", ctx.frame, added, id);
            Ok(())
        }
    });

    let manager = Arc::clone(&scripts);
    bridge.register_command::<GetScriptVariables, _, _>(move |ctx, command| {
        let manager = Arc::clone(&manager);
        async move {
            let id = manager.resolve_script(&ctx.frame, command.script_id)?;
            Ok(manager.script_data(&id)?)
        }
    });

    bridge.register_command::<ReplaceScriptVariables, _, _>(move |ctx, command| {
        let manager = Arc::clone(&scripts);
        async move {
            let id = manager.resolve_script(&ctx.frame, command.script_id)?;
            manager.replace_script_data(&id, command.variables)?;
            Ok(())
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripts::manager::{FrameLauncher, InProcessLauncher};
    use crate::scripts::model::{Script, ScriptType};
    use crate::transport::FrameId;
    use crate::variables::VariableStore;
    use serde_json::json;

    async fn setup() -> (Arc<ScriptManager>, Arc<InProcessLauncher>) {
        let bridge = Arc::new(HostBridge::with_defaults());
        let store = Arc::new(VariableStore::new(Arc::clone(bridge.events())));
        let launcher = Arc::new(InProcessLauncher::new(Arc::clone(&bridge)));
        let manager = Arc::new(ScriptManager::new(
            Arc::clone(&bridge),
            store,
            launcher.clone() as Arc<dyn FrameLauncher>,
        ));
        register_script_handlers(&bridge, Arc::clone(&manager));

        let script = Script::new("dice", "")
            .with_id("dice")
            .enabled(true)
            .with_buttons(vec![ScriptButton::new("Roll")]);
        manager.add_script(ScriptType::Global, script).await.unwrap();
        (manager, launcher)
    }

    #[tokio::test]
    async fn test_frame_resolves_its_own_script() {
        let (manager, launcher) = setup().await;
        let client = launcher.client(&FrameId::for_script("dice")).unwrap();

        let buttons = client.call(&GetScriptButtons::default()).await.unwrap();
        assert_eq!(buttons, Some(vec![ScriptButton::new("Roll")]));

        client
            .call(&AppendScriptButtons {
                script_id: None,
                buttons: vec![ScriptButton::new("Roll"), ScriptButton::new("Reset")],
            })
            .await
            .unwrap();
        assert_eq!(manager.buttons("dice").unwrap().len(), 2);
        assert_eq!(manager.button_containers()[0].buttons.len(), 2);
    }

    #[tokio::test]
    async fn test_script_variables_round_trip() {
        let (manager, launcher) = setup().await;
        let client = launcher.client(&FrameId::for_script("dice")).unwrap();

        client
            .call(&ReplaceScriptVariables {
                script_id: None,
                variables: json!({"sides": 20}).as_object().cloned().unwrap(),
            })
            .await
            .unwrap();
        let data = client.call(&GetScriptVariables::default()).await.unwrap().unwrap();

        assert_eq!(data["sides"], json!(20));
        assert_eq!(manager.script_data("dice").unwrap(), data);
    }

    #[tokio::test]
    async fn test_unbound_frame_without_script_id_fails() {
        let (manager, _launcher) = setup().await;
        let bridge = Arc::new(HostBridge::with_defaults());
        register_script_handlers(&bridge, manager);
        let stranger = bridge.attach_frame(FrameId::from("stranger")).unwrap();

        let result = stranger.call(&GetScriptButtons::default()).await.unwrap();
        assert_eq!(result, None);

        let named = stranger
            .call(&GetScriptButtons {
                script_id: Some("dice".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(named.map(|buttons| buttons.len()), Some(1));
    }
}
