//! Wizard state machine answering the installer's dialog callbacks.
//!
//! `Idle -> Started -> (Updating -> Started)* -> Ended -> Idle`
//!
//! The phase is a single atomic token tagged with the generation of the dialog it belongs to;
//! every `StartDialog` opens a new generation. An `UpdateState` only drives the wizard if it wins
//! the `Started -> Updating` swap; overlapping updates lose the swap and are ignored, so a step is
//! never answered twice. The phase returns to `Started` once the continue reply is in, and only
//! if the dialog that claimed it is still the open one.

pub mod driver;
pub mod types;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

use crate::ipc::{CallbackId, RemoteError, RpcError, WeakConnection};
pub use driver::Driver;
pub use types::{
    validate_steps, ContinueArgs, Direction, DialogInfo, Group, HeaderImage, OptionEntry,
    OptionType, ReportedError, SelectedOption, SelectionMode, Step, UpdateStateArgs,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DialogError {
    #[error("a dialog is already open")]
    AlreadyOpen,
    #[error("UpdateState received before StartDialog")]
    NotStarted,
    #[error("invalid dialog arguments: {0}")]
    InvalidArguments(String),
    #[error("invalid wizard content: {0}")]
    InvalidSteps(String),
    #[error("dialog callback failed: {0}")]
    Invoke(#[from] RpcError),
}

impl DialogError {
    pub fn to_remote(&self) -> RemoteError {
        RemoteError::new("DialogError", self.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DialogPhase {
    Idle = 0,
    Started = 1,
    Updating = 2,
    Ended = 3,
}

impl DialogPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => DialogPhase::Started,
            2 => DialogPhase::Updating,
            3 => DialogPhase::Ended,
            _ => DialogPhase::Idle,
        }
    }
}

// Phase in the low byte, dialog generation above it.
fn token(generation: u64, phase: DialogPhase) -> u64 {
    (generation << 8) | phase as u64
}

fn generation_of(token: u64) -> u64 {
    token >> 8
}

fn phase_of(token: u64) -> DialogPhase {
    DialogPhase::from_u8((token & 0xff) as u8)
}

/// Calls into callbacks the installer handed over.
#[async_trait]
pub trait RemoteInvoker: Send + Sync {
    async fn invoke(&self, callback: &CallbackId, args: Value) -> Result<Value, RpcError>;
}

/// Invoker bound to a live connection. Holds it weakly: the dialog's own handlers live inside
/// that connection's registry.
pub struct ConnectionInvoker {
    connection: WeakConnection,
    timeout: Duration,
}

impl ConnectionInvoker {
    pub fn new(connection: WeakConnection, timeout: Duration) -> Self {
        Self {
            connection,
            timeout,
        }
    }
}

#[async_trait]
impl RemoteInvoker for ConnectionInvoker {
    async fn invoke(&self, callback: &CallbackId, args: Value) -> Result<Value, RpcError> {
        let connection = self
            .connection
            .upgrade()
            .ok_or(RpcError::ConnectionClosed)?;
        connection.invoke_remote(callback, args, self.timeout).await
    }
}

/// The three installer callbacks handed over by `StartDialog`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCallbacks {
    pub select: CallbackId,
    pub cont: CallbackId,
    pub cancel: CallbackId,
}

/// Read-only view of the open dialog for a host UI.
#[derive(Debug, Clone, PartialEq)]
pub struct DialogSnapshot {
    pub info: DialogInfo,
    pub steps: Vec<Step>,
    pub current_step: Option<i32>,
}

#[derive(Debug, Clone, PartialEq)]
enum Action {
    Select(SelectedOption),
    Continue(ContinueArgs),
    Cancel,
}

/// Callback sequence that answers one `UpdateState`.
#[derive(Debug, Clone, PartialEq)]
pub struct DrivePlan {
    generation: u64,
    callbacks: RemoteCallbacks,
    actions: Vec<Action>,
}

impl DrivePlan {
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartDialogArgs {
    #[serde(default)]
    module_name: String,
    #[serde(default)]
    image: HeaderImage,
    select: Value,
    cont: Value,
    cancel: Value,
}

/// Decode a callback payload. Only the named-field object form is accepted.
pub fn named_args<T: DeserializeOwned>(args: Value) -> Result<T, DialogError> {
    if args.is_array() {
        return Err(DialogError::InvalidArguments(
            "positional arguments are not supported, expected an object".to_string(),
        ));
    }
    serde_json::from_value(args).map_err(|e| DialogError::InvalidArguments(e.to_string()))
}

/// Split `startDialog` arguments into dialog metadata and the installer's callbacks.
pub fn parse_start_args(args: Value) -> Result<(DialogInfo, RemoteCallbacks), DialogError> {
    let args: StartDialogArgs = named_args(args)?;
    let callback = |name: &str, value: &Value| {
        CallbackId::from_placeholder(value)
            .ok_or_else(|| DialogError::InvalidArguments(format!("{} is not a callback", name)))
    };
    let callbacks = RemoteCallbacks {
        select: callback("select", &args.select)?,
        cont: callback("cont", &args.cont)?,
        cancel: callback("cancel", &args.cancel)?,
    };
    Ok((
        DialogInfo {
            module_name: args.module_name,
            image: args.image,
        },
        callbacks,
    ))
}

// Returns the phase to `Started` unless the claiming dialog was ended meanwhile.
struct PhaseReset<'a> {
    state: &'a AtomicU64,
    generation: u64,
}

impl Drop for PhaseReset<'_> {
    fn drop(&mut self) {
        let _ = self.state.compare_exchange(
            token(self.generation, DialogPhase::Updating),
            token(self.generation, DialogPhase::Started),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

pub struct DialogSession {
    driver: Driver,
    invoker: Arc<dyn RemoteInvoker>,
    state: AtomicU64,
    callbacks: Mutex<Option<RemoteCallbacks>>,
    snapshot: ArcSwapOption<DialogSnapshot>,
    cancelled: AtomicBool,
    reported: watch::Sender<Option<ReportedError>>,
}

impl DialogSession {
    pub fn new(driver: Driver, invoker: Arc<dyn RemoteInvoker>) -> Self {
        let (reported, _) = watch::channel(None);
        Self {
            driver,
            invoker,
            state: AtomicU64::new(token(0, DialogPhase::Idle)),
            callbacks: Mutex::new(None),
            snapshot: ArcSwapOption::empty(),
            cancelled: AtomicBool::new(false),
            reported,
        }
    }

    fn remote_callbacks(&self) -> MutexGuard<'_, Option<RemoteCallbacks>> {
        self.callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    pub fn phase(&self) -> DialogPhase {
        phase_of(self.state.load(Ordering::Acquire))
    }

    pub fn snapshot(&self) -> Option<Arc<DialogSnapshot>> {
        self.snapshot.load_full()
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn start_dialog(
        &self,
        info: DialogInfo,
        callbacks: RemoteCallbacks,
    ) -> Result<(), DialogError> {
        let opened = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                (phase_of(state) == DialogPhase::Idle)
                    .then(|| token(generation_of(state) + 1, DialogPhase::Started))
            });
        if let Err(state) = opened {
            warn!("[DIALOG] StartDialog while {:?}", phase_of(state));
            return Err(DialogError::AlreadyOpen);
        }

        info!(
            "[DIALOG] Started '{}' ({} driver)",
            info.module_name,
            self.driver.name()
        );
        *self.remote_callbacks() = Some(callbacks);
        self.snapshot.store(Some(Arc::new(DialogSnapshot {
            info,
            steps: Vec::new(),
            current_step: None,
        })));
        Ok(())
    }

    /// Claim the update and plan the answer. `Ok(None)` means the update is ignored.
    pub fn begin_update(
        &self,
        steps: Vec<Step>,
        current_step: i32,
    ) -> Result<Option<DrivePlan>, DialogError> {
        let state = self.state.load(Ordering::Acquire);
        let generation = generation_of(state);
        match phase_of(state) {
            DialogPhase::Idle | DialogPhase::Ended => {
                error!("[DIALOG] UpdateState for step {} without an open dialog", current_step);
                return Err(DialogError::NotStarted);
            }
            DialogPhase::Updating => {
                debug!(
                    "[DIALOG] Update for step {} ignored, previous step still in flight",
                    current_step
                );
                return Ok(None);
            }
            DialogPhase::Started => {}
        }

        if matches!(self.driver, Driver::Cancelling) && self.was_cancelled() {
            debug!("[DIALOG] Already cancelled, ignoring update for step {}", current_step);
            return Ok(None);
        }

        if self
            .state
            .compare_exchange(
                state,
                token(generation, DialogPhase::Updating),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            debug!(
                "[DIALOG] Update for step {} ignored, dialog changed meanwhile",
                current_step
            );
            return Ok(None);
        }
        let claim = PhaseReset {
            state: &self.state,
            generation,
        };

        validate_steps(&steps)?;
        let callbacks = self
            .remote_callbacks()
            .clone()
            .ok_or(DialogError::NotStarted)?;

        let info = self
            .snapshot
            .load()
            .as_ref()
            .map(|snapshot| snapshot.info.clone())
            .unwrap_or_default();
        self.snapshot.store(Some(Arc::new(DialogSnapshot {
            info,
            steps,
            current_step: Some(current_step),
        })));

        let forward = Action::Continue(ContinueArgs {
            direction: Direction::Forward,
            current_step_id: current_step,
        });
        let actions = match &self.driver {
            Driver::Unattended => vec![forward],
            Driver::Deterministic(_) => match self.driver.decision_for(current_step) {
                Some(decision) => vec![Action::Select(decision.clone()), forward],
                None => vec![forward],
            },
            Driver::Cancelling => {
                self.cancelled.store(true, Ordering::Release);
                vec![Action::Cancel]
            }
        };

        // The claim is now owned by the plan and released when it has been driven.
        std::mem::forget(claim);
        Ok(Some(DrivePlan {
            generation,
            callbacks,
            actions,
        }))
    }

    /// Run a plan to completion, then release the update claim.
    pub async fn drive(&self, plan: DrivePlan) -> Result<(), DialogError> {
        let _reset = PhaseReset {
            state: &self.state,
            generation: plan.generation,
        };
        let callbacks = plan.callbacks;

        for action in plan.actions {
            let (callback, args) = match action {
                Action::Select(decision) => {
                    debug!(
                        "[DIALOG] Selecting {:?} in group {} of step {}",
                        decision.plugin_ids, decision.group_id, decision.step_id
                    );
                    (&callbacks.select, json!(decision))
                }
                Action::Continue(args) => {
                    debug!(
                        "[DIALOG] Continuing {:?} from step {}",
                        args.direction, args.current_step_id
                    );
                    (&callbacks.cont, json!(args))
                }
                Action::Cancel => {
                    info!("[DIALOG] Cancelling installation");
                    (&callbacks.cancel, json!({}))
                }
            };

            if let Err(e) = self.invoker.invoke(callback, args).await {
                warn!("[DIALOG] Callback {} failed: {}", callback, e);
                return Err(e.into());
            }
        }
        Ok(())
    }

    pub async fn update_state(
        &self,
        steps: Vec<Step>,
        current_step: i32,
    ) -> Result<(), DialogError> {
        match self.begin_update(steps, current_step)? {
            Some(plan) => self.drive(plan).await,
            None => Ok(()),
        }
    }

    /// Close the dialog and forget its callbacks. Returns false if no dialog was open.
    pub fn end_dialog(&self) -> bool {
        let ended = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                Some(token(generation_of(state), DialogPhase::Ended))
            });
        let previous = match ended {
            Ok(state) | Err(state) => state,
        };
        let callbacks = self.remote_callbacks().take();
        self.snapshot.store(None);
        self.state.store(
            token(generation_of(previous), DialogPhase::Idle),
            Ordering::Release,
        );

        if phase_of(previous) == DialogPhase::Idle {
            debug!("[DIALOG] EndDialog without an open dialog");
            return false;
        }
        info!(
            "[DIALOG] Ended (callbacks disposed: {})",
            callbacks.is_some()
        );
        true
    }

    pub fn report_error(&self, error: ReportedError) {
        error!(
            "[DIALOG] Installer reported '{}': {} {}",
            error.title, error.message, error.details
        );
        self.reported.send_replace(Some(error));
    }

    pub fn reported_error(&self) -> Option<ReportedError> {
        self.reported.borrow().clone()
    }

    /// Resolves once the installer reports an error.
    pub async fn wait_for_report(&self) -> ReportedError {
        let mut reported = self.reported.subscribe();
        let seen = reported
            .wait_for(|error| error.is_some())
            .await
            .map(|error| error.clone());
        match seen {
            Ok(error) => error.unwrap_or_default(),
            Err(_) => std::future::pending().await,
        }
    }
}
