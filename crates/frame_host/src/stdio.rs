//! A frame speaking JSON lines over stdin/stdout.
//!
//! Every stdin line is either a wire message (a JSON object) handed to the
//! bridge, or a host command starting with `/`. Replies and notifications
//! for the frame are written to stdout, one JSON object per line.

use async_trait::async_trait;
use frame_bridge::{
    BridgeError, FrameDispatch, FrameId, HostRuntime, ScriptType, Transport, VariableScope, VariableSyncService,
    Variables,
};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

/// Writes each posted message as one JSON line.
pub struct LineTransport<W> {
    writer: Mutex<W>,
}

impl<W> LineTransport<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl LineTransport<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W> fmt::Debug for LineTransport<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineTransport").finish_non_exhaustive()
    }
}

#[async_trait]
impl<W> Transport for LineTransport<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn post(&self, message: Value) -> Result<(), BridgeError> {
        let mut line = serde_json::to_string(&message)?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| BridgeError::Transport(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| BridgeError::Transport(e.to_string()))
    }
}

/// Commands an operator types on stdin.
#[derive(Debug, Clone, PartialEq)]
pub enum HostCommand {
    /// `/notify-all <channel> [json]`
    NotifyAll { channel: String, data: Option<Value> },
    /// `/stats`
    Stats,
    /// `/character <id>` or `/character none`
    Character(Option<String>),
    /// `/delete-character <id>`
    DeleteCharacter(String),
    /// `/chat <id>`
    Chat(String),
    /// `/floor [json]`
    Floor(Variables),
    /// `/scripts`
    Scripts,
    /// `/enable <script>` and `/disable <script>`
    Enable { script_id: String, enabled: bool },
    /// `/allow <character>`
    Allow(String),
    /// `/click <script> <button>`
    Click { script_id: String, button: String },
    /// `/sync <scope>`
    Sync(VariableScope),
    /// `/save`
    Save,
}

fn parse_json_argument(raw: &str) -> Result<Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("Invalid JSON argument: {}", e))
}

fn required<'a>(arg: Option<&'a str>, usage: &str) -> Result<&'a str, String> {
    arg.map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| format!("Usage: {}", usage))
}

/// Parses a `/command` line.
pub fn parse_command(line: &str) -> Result<HostCommand, String> {
    let line = line.trim();
    let Some(body) = line.strip_prefix('/') else {
        return Err(format!("Not a command: {}", line));
    };
    let (name, rest) = match body.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, Some(rest.trim())),
        None => (body, None),
    };

    match name {
        "notify-all" => {
            let rest = required(rest, "/notify-all <channel> [json]")?;
            let (channel, data) = match rest.split_once(char::is_whitespace) {
                Some((channel, raw)) => (channel, Some(parse_json_argument(raw.trim())?)),
                None => (rest, None),
            };
            Ok(HostCommand::NotifyAll {
                channel: channel.to_string(),
                data,
            })
        }
        "stats" => Ok(HostCommand::Stats),
        "character" => {
            let id = required(rest, "/character <id|none>")?;
            Ok(HostCommand::Character((id != "none").then(|| id.to_string())))
        }
        "delete-character" => Ok(HostCommand::DeleteCharacter(
            required(rest, "/delete-character <id>")?.to_string(),
        )),
        "chat" => Ok(HostCommand::Chat(required(rest, "/chat <id>")?.to_string())),
        "floor" => match rest.filter(|raw| !raw.is_empty()) {
            None => Ok(HostCommand::Floor(Variables::new())),
            Some(raw) => match parse_json_argument(raw)? {
                Value::Object(variables) => Ok(HostCommand::Floor(variables)),
                _ => Err("Usage: /floor [json object]".to_string()),
            },
        },
        "scripts" => Ok(HostCommand::Scripts),
        "enable" | "disable" => Ok(HostCommand::Enable {
            script_id: required(rest, "/enable <script>")?.to_string(),
            enabled: name == "enable",
        }),
        "allow" => Ok(HostCommand::Allow(required(rest, "/allow <character>")?.to_string())),
        "click" => {
            let rest = required(rest, "/click <script> <button>")?;
            let (script_id, button) = rest
                .split_once(char::is_whitespace)
                .ok_or_else(|| "Usage: /click <script> <button>".to_string())?;
            Ok(HostCommand::Click {
                script_id: script_id.to_string(),
                button: button.trim().to_string(),
            })
        }
        "sync" => Ok(HostCommand::Sync(required(rest, "/sync <scope>")?.parse()?)),
        "save" => Ok(HostCommand::Save),
        other => Err(format!("Unknown command: /{}", other)),
    }
}

/// Runs a host command and describes the outcome.
pub async fn execute(
    runtime: &HostRuntime,
    sync: &VariableSyncService,
    command: HostCommand,
) -> Result<Value, String> {
    match command {
        HostCommand::NotifyAll { channel, data } => {
            let released = runtime.bridge().notify_all(&channel, data).await;
            Ok(json!({ "channel": channel, "released": released }))
        }
        HostCommand::Stats => serde_json::to_value(runtime.bridge().stats()).map_err(|e| e.to_string()),
        HostCommand::Character(id) => {
            runtime.store().set_active_character(id.as_deref());
            Ok(json!({ "character": id }))
        }
        HostCommand::DeleteCharacter(id) => {
            let deleted = runtime.store().delete_character(&id);
            Ok(json!({ "deleted": deleted }))
        }
        HostCommand::Chat(id) => {
            runtime.store().open_chat(&id);
            Ok(json!({ "chat": id }))
        }
        HostCommand::Floor(variables) => {
            let floor = runtime.store().push_floor(variables);
            Ok(json!({ "floor": floor }))
        }
        HostCommand::Scripts => {
            let scripts = runtime.scripts();
            let describe = |script_type: ScriptType| -> Vec<Value> {
                scripts
                    .scripts(script_type)
                    .into_iter()
                    .map(|script| {
                        json!({
                            "id": script.id,
                            "name": script.name,
                            "enabled": script.enabled,
                            "running": scripts.is_running(&script.id),
                        })
                    })
                    .collect()
            };
            Ok(json!({
                "global": describe(ScriptType::Global),
                "character": describe(ScriptType::Character),
            }))
        }
        HostCommand::Enable { script_id, enabled } => {
            runtime
                .scripts()
                .set_enabled(&script_id, enabled)
                .await
                .map_err(|e| e.to_string())?;
            Ok(json!({ "script": script_id, "running": runtime.scripts().is_running(&script_id) }))
        }
        HostCommand::Allow(character_id) => {
            runtime
                .scripts()
                .allow_character(&character_id, true)
                .await
                .map_err(|e| e.to_string())?;
            Ok(json!({ "allowed": character_id }))
        }
        HostCommand::Click { script_id, button } => {
            let reached = runtime
                .scripts()
                .click_button(&script_id, &button)
                .await
                .map_err(|e| e.to_string())?;
            Ok(json!({ "reached": reached }))
        }
        HostCommand::Sync(scope) => {
            sync.set_scope(scope).await;
            Ok(json!({ "sync": scope.as_str() }))
        }
        HostCommand::Save => {
            runtime.save_now().await.map_err(|e| e.to_string())?;
            Ok(json!({ "saved": true }))
        }
    }
}

/// Feeds every line of `reader` to the host until EOF, one line at a time in
/// arrival order. Returns the number of lines read.
pub async fn serve_lines<R>(
    reader: R,
    frame: &FrameId,
    runtime: &HostRuntime,
    sync: &VariableSyncService,
) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut dispatch = FrameDispatch::new();
    let mut count = 0;

    loop {
        let line = tokio::select! {
            Some(outcome) = dispatch.next_finished(), if dispatch.in_flight() > 0 => {
                trace!("Frame {} message handled: {:?}", frame, outcome);
                continue;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };

        count += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with('/') {
            match parse_command(line) {
                Ok(command) => {
                    debug!("Host command: {:?}", command);
                    match execute(runtime, sync, command).await {
                        Ok(outcome) => info!("✅ {} -> {}", line, outcome),
                        Err(e) => warn!("❌ {} failed: {}", line, e),
                    }
                }
                Err(e) => warn!("{}", e),
            }
            continue;
        }

        match serde_json::from_str::<Value>(line) {
            Ok(message) => {
                dispatch
                    .start(Arc::clone(runtime.bridge()), frame.clone(), message)
                    .await;
            }
            Err(e) => warn!("Ignoring line that is not JSON: {}", e),
        }
    }

    let finished = dispatch.finish().await;
    if finished > 0 {
        debug!("{} message(s) of frame {} finished after EOF", finished, frame);
    }
    Ok(count)
}
