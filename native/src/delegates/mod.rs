//! Host-side answers to the installer's queries.
//!
//! Each category is a trait implemented by the embedding application plus a proxy that owns
//! the per-session behaviour (memoization for plugins, passthrough for the rest). Proxies are
//! built fresh for every install so nothing leaks between sessions.

pub mod context;
pub mod fixture;
pub mod ini;
pub mod plugins;
pub mod ui;

use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

use crate::dialog::DialogSession;
use crate::ipc::{Arg, Callback, RemoteError, WeakConnection};
pub use context::{ContextProxy, GameContext};
pub use fixture::StaticHost;
pub use ini::{IniHost, IniProxy};
pub use plugins::{PluginHost, PluginProxy};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HostError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Failed(String),
}

impl HostError {
    fn to_remote(&self, method: &str) -> RemoteError {
        RemoteError::new("HostError", format!("{}: {}", method, self))
    }
}

/// The embedding application's implementations of every delegate category.
#[derive(Clone)]
pub struct HostServices {
    pub plugins: Arc<dyn PluginHost>,
    pub ini: Arc<dyn IniHost>,
    pub context: Arc<dyn GameContext>,
}

impl HostServices {
    /// One object answering every category.
    pub fn from_host<H>(host: Arc<H>) -> Self
    where
        H: PluginHost + IniHost + GameContext + 'static,
    {
        Self {
            plugins: host.clone(),
            ini: host.clone(),
            context: host,
        }
    }
}

/// Proxies for one install session.
pub struct DelegateSet {
    pub plugins: Arc<PluginProxy>,
    pub ini: Arc<IniProxy>,
    pub context: Arc<ContextProxy>,
    dialog: Arc<DialogSession>,
    connection: WeakConnection,
}

impl DelegateSet {
    pub fn new(
        services: &HostServices,
        dialog: Arc<DialogSession>,
        connection: WeakConnection,
    ) -> Self {
        Self {
            plugins: Arc::new(PluginProxy::new(services.plugins.clone())),
            ini: Arc::new(IniProxy::new(services.ini.clone())),
            context: Arc::new(ContextProxy::new(services.context.clone())),
            dialog,
            connection,
        }
    }

    /// The `context` tree embedded in an install request.
    pub fn to_arg(&self) -> Arg {
        Arg::object([
            ("plugins", plugins::bind(Arc::clone(&self.plugins))),
            ("ini", ini::bind(Arc::clone(&self.ini))),
            ("context", context::bind(Arc::clone(&self.context))),
            (
                "ui",
                ui::bind(Arc::clone(&self.dialog), self.connection.clone()),
            ),
        ])
    }
}

/// Decode named-field arguments. `null` counts as an empty object.
fn decode_args<A: DeserializeOwned>(method: &str, args: Value) -> Result<A, RemoteError> {
    let args = match args {
        Value::Null => Value::Object(Map::new()),
        Value::Array(_) => {
            return Err(RemoteError::new(
                "InvalidArguments",
                format!("{}: positional arguments are not supported", method),
            ))
        }
        other => other,
    };
    serde_json::from_value(args)
        .map_err(|e| RemoteError::new("InvalidArguments", format!("{}: {}", method, e)))
}

/// Wrap an async host method as a persistent callback with typed arguments and result.
fn delegate<A, T, F, Fut>(method: &'static str, handler: F) -> Arg
where
    A: DeserializeOwned + Send + 'static,
    T: Serialize + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, HostError>> + Send + 'static,
{
    Arg::Callback(Callback::persistent(move |args: Value| {
        let call = decode_args::<A>(method, args).map(&handler);
        async move {
            let value = call?.await.map_err(|e| {
                warn!("[DELEGATE] {} failed: {}", method, e);
                e.to_remote(method)
            })?;
            serde_json::to_value(value)
                .map_err(|e| RemoteError::new("EncodeError", format!("{}: {}", method, e)))
        }
    }))
}
