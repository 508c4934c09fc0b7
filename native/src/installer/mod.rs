//! Install session: launch the installer, connect, run `install` / `testSupported`.
//!
//! The preferred transport is tried first. If the installer cannot be reached on it the
//! process is killed and the alternate transport is tried once.

pub mod types;

use log::{debug, error, info, warn};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::HostConfig;
use crate::delegates::{DelegateSet, HostServices};
use crate::dialog::{ConnectionInvoker, DialogSession, Driver, ReportedError};
use crate::ipc::{
    BoxedStream, Connection, ProtocolError, RemoteError, RpcError, TransportError, TransportKind,
    TransportListener,
};
use crate::launcher::{InstallerProcess, LaunchError, ProcessLauncher};
use crate::logging;
pub use types::{InstallRequest, InstallResult, Instruction, SupportedResult};

// How long a dropped connection waits for the process exit that usually caused it.
const EXIT_GRACE: Duration = Duration::from_secs(2);

// Remote error names meaning the user backed out.
const CANCELLED_NAMES: [&str; 3] = ["UserCanceled", "Cancelled", "Canceled"];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InstallError {
    #[error("installation cancelled")]
    Cancelled,
    #[error("installer reported an error: {}: {}", .0.title, .0.message)]
    Reported(ReportedError),
    #[error("installer failed: {0}")]
    Domain(RemoteError),
    #[error("installer process terminated: {0}")]
    ProcessTerminated(String),
    #[error("{method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("{0}")]
    Launch(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("connection to the installer closed")]
    ConnectionClosed,
    #[error("an install is already running on this session")]
    SessionInUse,
}

impl From<LaunchError> for InstallError {
    fn from(e: LaunchError) -> Self {
        InstallError::Launch(e.to_string())
    }
}

impl From<RpcError> for InstallError {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::Remote(remote) if CANCELLED_NAMES.contains(&remote.name.as_str()) => {
                InstallError::Cancelled
            }
            RpcError::Remote(remote) => InstallError::Domain(remote),
            RpcError::ProcessTerminated(reason) => InstallError::ProcessTerminated(reason),
            RpcError::Timeout { method, timeout } => InstallError::Timeout { method, timeout },
            RpcError::Transport(e) => InstallError::Transport(e),
            RpcError::Protocol(e) => InstallError::Protocol(e),
            RpcError::ConnectionClosed => InstallError::ConnectionClosed,
            RpcError::Encode(message) => InstallError::InvalidResponse(message),
        }
    }
}

/// Bounds applied to calls on an established session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    pub request: Duration,
    pub callback: Duration,
}

impl SessionTimeouts {
    pub fn from_config(config: &HostConfig) -> Self {
        Self {
            request: config.request_timeout(),
            callback: config.callback_timeout(),
        }
    }
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self::from_config(&HostConfig::default())
    }
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct InstallSession {
    connection: Connection,
    process: Option<InstallerProcess>,
    transport: Option<TransportKind>,
    services: HostServices,
    timeouts: SessionTimeouts,
    busy: AtomicBool,
}

impl InstallSession {
    /// Launch the configured installer and connect to it, falling back to the alternate
    /// transport once.
    pub async fn start(
        config: &HostConfig,
        launcher: &ProcessLauncher,
        services: HostServices,
    ) -> Result<Self, InstallError> {
        let mut last_error = None;

        for kind in config.preferred_transport.attempt_order() {
            match connect(kind, config, launcher).await {
                Ok((stream, process)) => {
                    let connection = Connection::open(stream);
                    watch_process(&connection, &process);
                    info!(
                        "[INSTALL] Session ready over {} (installer pid {})",
                        kind,
                        process.pid()
                    );
                    return Ok(Self {
                        connection,
                        process: Some(process),
                        transport: Some(kind),
                        services,
                        timeouts: SessionTimeouts::from_config(config),
                        busy: AtomicBool::new(false),
                    });
                }
                Err(InstallError::Transport(e)) => {
                    warn!("[INSTALL] {} transport failed: {}", kind, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        let e = last_error.unwrap_or(TransportError::Unavailable {
            kind: config.preferred_transport,
        });
        logging::capture_critical_error("transport", &e.to_string());
        Err(InstallError::Transport(e))
    }

    /// Session over an already connected stream, with no process to supervise.
    pub fn from_stream<S>(stream: S, services: HostServices, timeouts: SessionTimeouts) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self {
            connection: Connection::open(stream),
            process: None,
            transport: None,
            services,
            timeouts,
            busy: AtomicBool::new(false),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn process(&self) -> Option<&InstallerProcess> {
        self.process.as_ref()
    }

    pub fn transport(&self) -> Option<TransportKind> {
        self.transport
    }

    /// Run one install. The driver answers every wizard step the installer presents.
    pub async fn install(
        &self,
        request: InstallRequest,
        driver: Driver,
    ) -> Result<InstallResult, InstallError> {
        if self.busy.swap(true, Ordering::AcqRel) {
            return Err(InstallError::SessionInUse);
        }
        let _busy = BusyGuard(&self.busy);

        let invoker = ConnectionInvoker::new(self.connection.downgrade(), self.timeouts.callback);
        let dialog = Arc::new(DialogSession::new(driver, Arc::new(invoker)));
        let delegates = DelegateSet::new(
            &self.services,
            Arc::clone(&dialog),
            self.connection.downgrade(),
        );

        info!(
            "[INSTALL] Installing {} files from {} ({} driver)",
            request.files.len(),
            request.script_path,
            dialog.driver().name()
        );
        let params = request.into_arg(delegates.to_arg());

        let response = tokio::select! {
            response = self.connection.request("install", params, self.timeouts.request) => response,
            report = dialog.wait_for_report() => {
                return Err(InstallError::Reported(report));
            }
        };

        if dialog.was_cancelled() {
            info!("[INSTALL] Cancelled by the dialog driver");
            return Err(InstallError::Cancelled);
        }
        if let Some(report) = dialog.reported_error() {
            return Err(InstallError::Reported(report));
        }

        let value = match response {
            Ok(value) => value,
            Err(e) => return Err(self.failure(e).await),
        };
        let result: InstallResult = serde_json::from_value(value)
            .map_err(|e| InstallError::InvalidResponse(e.to_string()))?;
        info!(
            "[INSTALL] Installer returned {} instructions: {}",
            result.instructions.len(),
            result.message
        );
        Ok(result)
    }

    /// Ask whether the installer can handle an archive with these files.
    pub async fn test_supported(
        &self,
        files: &[String],
        allowed_types: &[String],
    ) -> Result<SupportedResult, InstallError> {
        let params = json!({ "files": files, "allowedTypes": allowed_types });
        let value = match self
            .connection
            .request("testSupported", params, self.timeouts.request)
            .await
        {
            Ok(value) => value,
            Err(e) => return Err(self.failure(e).await),
        };
        serde_json::from_value(value).map_err(|e| InstallError::InvalidResponse(e.to_string()))
    }

    // A dropped connection is usually the installer dying; report that instead when it is.
    async fn failure(&self, e: RpcError) -> InstallError {
        if let (RpcError::ConnectionClosed, Some(process)) = (&e, &self.process) {
            if let Ok(exit) = tokio::time::timeout(EXIT_GRACE, process.wait()).await {
                return InstallError::ProcessTerminated(exit.to_string());
            }
        }
        if let RpcError::Transport(transport) = &e {
            logging::capture_critical_error("transport", &transport.to_string());
        }
        error!("[INSTALL] Request failed: {}", e);
        e.into()
    }

    /// Close the connection and make sure the installer is gone.
    pub async fn shutdown(self) {
        self.connection.close();
        if let Some(process) = &self.process {
            if tokio::time::timeout(EXIT_GRACE, process.wait()).await.is_err() {
                process.kill();
                let _ = process.wait().await;
            }
        }
        debug!("[INSTALL] Session closed");
    }
}

async fn connect(
    kind: TransportKind,
    config: &HostConfig,
    launcher: &ProcessLauncher,
) -> Result<(BoxedStream, InstallerProcess), InstallError> {
    let listener = TransportListener::bind(kind).await?;
    let endpoint = listener.endpoint();
    let process = launcher.launch(
        &config.installer_path,
        &endpoint.launch_args(),
        &config.launch_options(),
    )?;

    let accepted = tokio::select! {
        stream = listener.accept(config.connect_timeout()) => stream,
        exit = process.wait() => Err(TransportError::Accept {
            kind,
            message: format!("installer exited before connecting ({})", exit),
        }),
    };

    match accepted {
        Ok(stream) => Ok((stream, process)),
        Err(e) => {
            process.kill();
            Err(e.into())
        }
    }
}

// Process exit fails every pending call with `ProcessTerminated`.
fn watch_process(connection: &Connection, process: &InstallerProcess) {
    let connection = connection.downgrade();
    let process = process.clone();
    tokio::spawn(async move {
        let exit = process.wait().await;
        let Some(connection) = connection.upgrade() else {
            return;
        };
        if connection.is_closed() {
            return;
        }
        if !exit.success {
            logging::capture_critical_error("installer", &format!("installer crashed: {}", exit));
        }
        connection.terminate(RpcError::ProcessTerminated(exit.to_string()));
    });
}


#[cfg(all(test, unix))]
mod launch_tests {
    use super::*;
    use crate::delegates::StaticHost;
    use crate::launcher::LaunchOptions;
    use crate::test_support::RawPeer;
    use serde_json::Value;
    use std::path::{Path, PathBuf};

    #[tokio::test]
    async fn installer_that_never_connects_fails_on_both_transports() {
        let config = HostConfig {
            installer_path: PathBuf::from("/bin/sleep"),
            connect_timeout_ms: 200,
            ..HostConfig::default()
        };
        let launcher = ProcessLauncher::new();
        let services = HostServices::from_host(Arc::new(StaticHost::default()));

        // `sleep <name> --pipe` exits with a usage error, `sleep <port>` just sleeps.
        let result = InstallSession::start(&config, &launcher, services).await;
        assert!(matches!(result, Err(InstallError::Transport(_))));
        launcher.cleanup().await;
        assert_eq!(launcher.running_count(), 0);
    }

    #[tokio::test]
    async fn installer_exit_fails_pending_requests() {
        let launcher = ProcessLauncher::new();
        let process = launcher
            .launch(
                Path::new("/bin/sh"),
                &["-c".to_string(), "sleep 0.3; exit 3".to_string()],
                &LaunchOptions::default(),
            )
            .unwrap();
        let (connection, mut peer) = RawPeer::connect();
        watch_process(&connection, &process);

        let call = {
            let connection = connection.clone();
            tokio::spawn(async move {
                connection
                    .request("install", Value::Null, Duration::from_secs(10))
                    .await
            })
        };
        let _ = peer.recv().await;

        assert_eq!(
            call.await.unwrap(),
            Err(RpcError::ProcessTerminated("exit code 3".to_string()))
        );
        assert!(connection.is_closed());
        launcher.cleanup().await;
    }

    #[tokio::test]
    async fn missing_installer_is_a_launch_error() {
        let config = HostConfig {
            installer_path: PathBuf::from("/nonexistent/ModInstallerIPC"),
            ..HostConfig::default()
        };
        let launcher = ProcessLauncher::new();
        let services = HostServices::from_host(Arc::new(StaticHost::default()));

        let result = InstallSession::start(&config, &launcher, services).await;
        assert!(matches!(result, Err(InstallError::Launch(_))));
    }
}
