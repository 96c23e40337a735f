//! Two in-process frames talking to one host.

use crate::api::{create_host_runtime, HostRuntime, RuntimeOptions};
use crate::client::FrameClient;
use crate::message::Command;
use crate::notify::LogNotifier;
use crate::persistence::NoopPersistence;
use crate::scripts::{GetScriptButtons, InProcessLauncher, Script, ScriptButton, ScriptType};
use crate::transport::FrameId;
use crate::variables::{
    GetVariables, ReplaceVariables, VariableChange, VariableObserver, VariableOption, VariableScope,
    VariableSyncService, Variables,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

async fn started_runtime() -> HostRuntime {
    let runtime = create_host_runtime(
        Arc::new(LogNotifier),
        Arc::new(NoopPersistence),
        |bridge| Arc::new(InProcessLauncher::new(Arc::clone(bridge))),
        RuntimeOptions::default(),
    );
    runtime.start().await.unwrap();
    runtime
}

fn frames(runtime: &HostRuntime) -> (FrameClient, FrameClient) {
    let bridge = runtime.bridge();
    (
        bridge.attach_frame(FrameId::from("a")).unwrap(),
        bridge.attach_frame(FrameId::from("b")).unwrap(),
    )
}

fn vars(value: Value) -> Variables {
    value.as_object().cloned().unwrap()
}

#[tokio::test]
async fn test_frames_share_global_variables() {
    let runtime = started_runtime().await;
    let (a, b) = frames(&runtime);

    a.replace_variables(VariableOption::scope(VariableScope::Global), vars(json!({"lang": "en"})))
        .await
        .unwrap();
    let seen = b
        .get_variables(VariableOption::scope(VariableScope::Global))
        .await
        .unwrap();

    assert_eq!(seen, vars(json!({"lang": "en"})));
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_calls_are_routed_to_their_callers() {
    #[derive(Debug, Serialize, Deserialize)]
    struct Echo {
        value: i64,
    }

    impl Command for Echo {
        const TAG: &'static str = "echo";
        type Output = i64;
    }

    let runtime = started_runtime().await;
    runtime.bridge().register_command::<Echo, _, _>(|_ctx, echo| async move {
        tokio::time::sleep(Duration::from_millis((10 - echo.value.rem_euclid(10)) as u64)).await;
        Ok(echo.value)
    });
    let (a, b) = frames(&runtime);

    let calls = (0..10).map(|value| {
        let client = if value % 2 == 0 { a.clone() } else { b.clone() };
        async move { client.call(&Echo { value }).await }
    });
    let results = futures::future::join_all(calls).await;

    for (value, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), Some(value as i64));
    }
    assert_eq!(a.pending_calls(), 0);
    assert_eq!(b.pending_calls(), 0);
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_notify_all_wakes_the_other_frame() {
    let runtime = started_runtime().await;
    let (a, b) = frames(&runtime);

    let waiting = tokio::spawn({
        let a = a.clone();
        async move { a.wait("ready").await }
    });
    for _ in 0..100 {
        if runtime.bridge().channels().waiter_count("ready") == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    b.notify_all("ready", vec![json!(1), json!("two")]).await.unwrap();
    assert_eq!(waiting.await.unwrap().unwrap(), vec![json!(1), json!("two")]);
    assert_eq!(b.pending_waits(), 0);
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_sync_observes_writes_from_another_frame() {
    #[derive(Default)]
    struct Keys(Mutex<Vec<String>>);

    impl VariableObserver for Keys {
        fn added(&self, change: &VariableChange) {
            debug!("observed {}", change.key);
            self.0.lock().unwrap().push(change.key.clone());
        }
    }

    let runtime = started_runtime().await;
    let keys = Arc::new(Keys::default());
    let sync = VariableSyncService::new(
        Arc::clone(runtime.store()),
        Arc::clone(&keys) as Arc<dyn VariableObserver>,
        Duration::from_secs(2),
    );
    sync.init().await;

    let (_, b) = frames(&runtime);
    b.insert_or_assign_variables(VariableOption::scope(VariableScope::Global), vars(json!({"hp": 10})))
        .await
        .unwrap();
    sync.flush().await;

    assert_eq!(*keys.0.lock().unwrap(), vec!["hp".to_string()]);
    sync.cleanup().await;
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_failed_request_does_not_disturb_the_other_frame() {
    let runtime = started_runtime().await;
    let (a, b) = frames(&runtime);
    runtime.store().push_floor(Variables::new());

    let bad = a
        .call(&GetVariables {
            option: VariableOption::message(crate::variables::MessageId::Index(7)),
        })
        .await
        .unwrap();
    assert_eq!(bad, None);

    b.call(&ReplaceVariables {
        option: VariableOption::message(crate::variables::MessageId::Latest),
        variables: vars(json!({"mood": "calm"})),
    })
    .await
    .unwrap();
    assert_eq!(runtime.store().message_pages()[0]["mood"], json!("calm"));
    assert_eq!(runtime.bridge().stats().handler_failures, 1);
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_script_frame_reads_its_buttons() {
    let runtime = started_runtime().await;
    let script = Script::new("dice", "")
        .with_id("dice")
        .enabled(true)
        .with_buttons(vec![ScriptButton::new("Roll")]);
    runtime.scripts().add_script(ScriptType::Global, script).await.unwrap();

    let (a, _) = frames(&runtime);
    let anonymous = a.call(&GetScriptButtons::default()).await.unwrap();
    assert_eq!(anonymous, None);

    let named = a
        .call(&GetScriptButtons {
            script_id: Some("dice".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(named, Some(vec![ScriptButton::new("Roll")]));
    runtime.shutdown().await;
}
