//! Request handlers exposing the variable store to frames.

use super::scope::VariableOption;
use super::store::VariableStore;
use super::Variables;
use crate::message::Command;
use crate::system::HostBridge;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// `iframe_get_variables`: returns a copy of the addressed mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetVariables {
    #[serde(default)]
    pub option: VariableOption,
}

impl Command for GetVariables {
    const TAG: &'static str = "iframe_get_variables";
    type Output = Variables;
}

/// `iframe_replace_variables`: replaces the addressed mapping wholesale.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplaceVariables {
    #[serde(default)]
    pub option: VariableOption,
    pub variables: Variables,
}

impl Command for ReplaceVariables {
    const TAG: &'static str = "iframe_replace_variables";
    type Output = ();
}

/// `iframe_set_variables`: the older per-floor staging write, accepted only
/// for the newest floor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetVariablesLegacy {
    pub message_id: i64,
    pub variables: Variables,
}

impl Command for SetVariablesLegacy {
    const TAG: &'static str = "iframe_set_variables";
    type Output = bool;
}

/// Registers the variable request handlers on `bridge`.
pub fn register_variable_handlers(bridge: &HostBridge, store: Arc<VariableStore>) {
    let reader = Arc::clone(&store);
    bridge.register_command::<GetVariables, _, _>(move |ctx, command| {
        let store = Arc::clone(&reader);
        async move {
            let variables = store.read(&command.option)?;
            debug!(
                "[frame {}] Read {} variable(s) from {} scope",
                ctx.frame,
                variables.len(),
                command.option.scope
            );
            Ok(variables)
        }
    });

    let writer = Arc::clone(&store);
    bridge.register_command::<ReplaceVariables, _, _>(move |ctx, command| {
        let store = Arc::clone(&writer);
        async move {
            let count = command.variables.len();
            store.replace(&command.option, command.variables)?;
            info!(
                "[frame {}] Replaced {} scope with {} variable(s)",
                ctx.frame, command.option.scope, count
            );
            Ok(())
        }
    });

    bridge.register_command::<SetVariablesLegacy, _, _>(move |ctx, command| {
        let store = Arc::clone(&store);
        async move {
            let staged = store.stage_latest(command.message_id, command.variables);
            debug!("[frame {}] Staged variables for floor {}: {}", ctx.frame, command.message_id, staged);
            Ok(staged)
        }
    });
}
