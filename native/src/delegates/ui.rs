// Dialog callbacks: the installer opens, updates and closes the wizard through these.

use log::warn;
use serde_json::Value;
use std::future;
use std::sync::Arc;

use crate::dialog::{named_args, parse_start_args, DialogSession, ReportedError, UpdateStateArgs};
use crate::ipc::{Arg, Callback, RemoteError, WeakConnection};

// Each handler changes dialog state before returning its future, so transitions happen on the
// dispatch loop in the order the installer sent them.
pub(crate) fn bind(dialog: Arc<DialogSession>, connection: WeakConnection) -> Arg {
    let start = Arc::clone(&dialog);
    let update = Arc::clone(&dialog);
    let end = Arc::clone(&dialog);
    let report = dialog;

    Arg::object([
        (
            "startDialog",
            Arg::from(Callback::persistent(move |args: Value| {
                let started = parse_start_args(args)
                    .and_then(|(info, callbacks)| start.start_dialog(info, callbacks))
                    .map(|()| Value::Null)
                    .map_err(|e| e.to_remote());
                future::ready(started)
            })),
        ),
        (
            "updateState",
            Arg::from(Callback::persistent(move |args: Value| {
                let planned = named_args::<UpdateStateArgs>(args).and_then(|args| {
                    let current_step = args.current_step;
                    update
                        .begin_update(args.install_steps, current_step)
                        .map(|plan| (plan, current_step))
                });
                let dialog = Arc::clone(&update);
                async move {
                    let (plan, current_step) = planned.map_err(|e| e.to_remote())?;

                    // Driven off the callback so the installer gets its reply before we call back.
                    if let Some(plan) = plan {
                        tokio::spawn(async move {
                            if let Err(e) = dialog.drive(plan).await {
                                warn!("[DIALOG] Step {} not answered: {}", current_step, e);
                            }
                        });
                    }
                    Ok(Value::Null)
                }
            })),
        ),
        (
            "endDialog",
            Arg::from(Callback::persistent(move |_args: Value| {
                end.end_dialog();
                if let Some(connection) = connection.upgrade() {
                    connection.release_timed_out_callbacks();
                }
                future::ready(Ok::<_, RemoteError>(Value::Null))
            })),
        ),
        (
            "reportError",
            Arg::from(Callback::persistent(move |args: Value| {
                let recorded = named_args::<ReportedError>(args)
                    .map(|error| report.report_error(error))
                    .map(|()| Value::Null)
                    .map_err(|e| e.to_remote());
                future::ready(recorded)
            })),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialog::{ConnectionInvoker, DialogPhase, Driver};
    use crate::ipc::protocol::outcome;
    use crate::ipc::{CallbackId, Connection, Frame};
    use crate::test_support::{callback_at, register_all, RawPeer};
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;

    fn bound(connection: &Connection, driver: Driver) -> (Arc<DialogSession>, Value) {
        let invoker = ConnectionInvoker::new(connection.downgrade(), Duration::from_secs(5));
        let dialog = Arc::new(DialogSession::new(driver, Arc::new(invoker)));
        let ui = bind(Arc::clone(&dialog), connection.downgrade());
        let ids = register_all(connection, ui);
        (dialog, ids)
    }

    fn id(ui: &Value, name: &str) -> CallbackId {
        callback_at(ui, name)
    }

    fn start_args() -> Value {
        json!({
            "moduleName": "Test Mod",
            "image": { "path": "", "showFade": false, "height": 0 },
            "select": { "__callback": "r-select" },
            "cont": { "__callback": "r-cont" },
            "cancel": { "__callback": "r-cancel" }
        })
    }

    #[tokio::test]
    async fn update_state_is_answered_with_continue() {
        let (connection, mut peer) = RawPeer::connect();
        let (dialog, ui) = bound(&connection, Driver::Unattended);

        assert_eq!(peer.invoke(&id(&ui, "startDialog"), start_args()).await, Ok(Value::Null));
        let update = json!({
            "installSteps": [{ "id": 0, "name": "Main", "groups": [] }],
            "currentStep": 0
        });
        assert_eq!(peer.invoke(&id(&ui, "updateState"), update).await, Ok(Value::Null));

        let (callback, args) = peer.expect_invoke(Value::Null).await;
        assert_eq!(callback, CallbackId::new("r-cont"));
        assert_eq!(args, json!({ "direction": "forward", "currentStepId": 0 }));

        assert_eq!(peer.invoke(&id(&ui, "endDialog"), json!({})).await, Ok(Value::Null));
        assert_eq!(dialog.phase(), DialogPhase::Idle);
    }

    #[tokio::test]
    async fn update_before_start_is_reported_to_the_installer() {
        let (connection, mut peer) = RawPeer::connect();
        let (_dialog, ui) = bound(&connection, Driver::Unattended);

        let update = json!({ "installSteps": [], "currentStep": 0 });
        let err = peer
            .invoke(&id(&ui, "updateState"), update)
            .await
            .unwrap_err();
        assert_eq!(err.name, "DialogError");
        assert!(peer.is_quiet(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn report_error_is_recorded() {
        let (connection, mut peer) = RawPeer::connect();
        let (dialog, ui) = bound(&connection, Driver::Unattended);

        let report = json!({ "title": "Script", "message": "bad condition", "details": "line 4" });
        assert_eq!(peer.invoke(&id(&ui, "reportError"), report).await, Ok(Value::Null));
        assert_eq!(dialog.reported_error().unwrap().details, "line 4");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn back_to_back_start_and_update_are_handled_in_order() {
        for _ in 0..50 {
            let (connection, mut peer) = RawPeer::connect();
            let (_dialog, ui) = bound(&connection, Driver::Unattended);

            peer.send(&Frame::CallbackInvoke {
                id: 1,
                callback: id(&ui, "startDialog"),
                args: start_args(),
            })
            .await;
            peer.send(&Frame::CallbackInvoke {
                id: 2,
                callback: id(&ui, "updateState"),
                args: json!({
                    "installSteps": [{ "id": 0, "name": "Main", "groups": [] }],
                    "currentStep": 0
                }),
            })
            .await;

            let mut replies = HashMap::new();
            let mut continued = false;
            while replies.len() < 2 || !continued {
                match peer.recv().await {
                    Frame::CallbackReply { id, data, error } => {
                        replies.insert(id, outcome(data, error));
                    }
                    Frame::CallbackInvoke { id, callback, .. } => {
                        assert_eq!(callback, CallbackId::new("r-cont"));
                        peer.send(&Frame::reply(id, Ok(Value::Null))).await;
                        continued = true;
                    }
                    other => panic!("unexpected frame {:?}", other),
                }
            }
            assert_eq!(replies[&1], Ok(Value::Null));
            assert_eq!(replies[&2], Ok(Value::Null));
        }
    }
}
