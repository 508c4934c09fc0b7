//! Starts the installer process and watches it until it exits.
//!
//! A launch always produces an [`InstallerProcess`] whose exit can be observed, so the
//! session can turn an unexpected death into `ProcessTerminated` for every pending call.
//! Sandboxed launches that the platform refuses fall back to a regular launch.

pub mod sandbox;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Notify};

use crate::logging::{self, OutputStream};
pub use sandbox::SandboxLimits;

const CLEANUP_WAIT: Duration = Duration::from_secs(5);

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    #[default]
    Regular,
    Sandboxed,
}

impl SecurityLevel {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "regular" => Some(SecurityLevel::Regular),
            "sandboxed" | "sandbox" => Some(SecurityLevel::Sandboxed),
            _ => None,
        }
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityLevel::Regular => write!(f, "regular"),
            SecurityLevel::Sandboxed => write!(f, "sandboxed"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub working_dir: Option<PathBuf>,
    pub security_level: SecurityLevel,
    pub env: Vec<(String, String)>,
    pub limits: SandboxLimits,
}

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("installer executable not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("failed to start {}: {source}", .path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How the installer process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub success: bool,
}

impl ProcessExit {
    fn unknown() -> Self {
        Self {
            code: None,
            success: false,
        }
    }
}

impl From<ExitStatus> for ProcessExit {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            success: status.success(),
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {}", code),
            None => write!(f, "terminated by signal"),
        }
    }
}

/// Handle on a launched installer. Dropping it does not stop the process; use
/// [`InstallerProcess::kill`] or [`ProcessLauncher::cleanup`].
#[derive(Clone)]
pub struct InstallerProcess {
    pid: u32,
    security_level: SecurityLevel,
    kill: Arc<Notify>,
    exit: watch::Receiver<Option<ProcessExit>>,
}

impl InstallerProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Level the process actually runs at, after any fallback.
    pub fn security_level(&self) -> SecurityLevel {
        self.security_level
    }

    pub fn exit_status(&self) -> Option<ProcessExit> {
        self.exit.borrow().clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    pub async fn wait(&self) -> ProcessExit {
        let mut exit = self.exit.clone();
        let seen = exit
            .wait_for(|exit| exit.is_some())
            .await
            .map(|status| status.clone());
        match seen {
            Ok(status) => status.unwrap_or_else(ProcessExit::unknown),
            Err(_) => self.exit_status().unwrap_or_else(ProcessExit::unknown),
        }
    }

    pub fn kill(&self) {
        if !self.has_exited() {
            info!("[LAUNCHER] Killing installer {}", self.pid);
            self.kill.notify_one();
        }
    }
}

impl fmt::Debug for InstallerProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallerProcess")
            .field("pid", &self.pid)
            .field("security_level", &self.security_level)
            .field("exit", &self.exit_status())
            .finish()
    }
}

#[derive(Default)]
pub struct ProcessLauncher {
    launched: Mutex<Vec<InstallerProcess>>,
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    fn launched(&self) -> MutexGuard<'_, Vec<InstallerProcess>> {
        self.launched
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start `executable` with `args`. Must be called inside a tokio runtime.
    pub fn launch(
        &self,
        executable: &Path,
        args: &[String],
        options: &LaunchOptions,
    ) -> Result<InstallerProcess, LaunchError> {
        if executable.components().count() > 1 && !executable.exists() {
            return Err(LaunchError::NotFound(executable.to_path_buf()));
        }

        let spawn_error = |source| LaunchError::Spawn {
            path: executable.to_path_buf(),
            source,
        };

        let (child, confinement, level) = match options.security_level {
            SecurityLevel::Regular => (
                command(executable, args, options)
                    .spawn()
                    .map_err(spawn_error)?,
                None,
                SecurityLevel::Regular,
            ),
            SecurityLevel::Sandboxed => match spawn_sandboxed(executable, args, options) {
                Ok((child, confinement)) => (child, confinement, SecurityLevel::Sandboxed),
                Err(e) => {
                    warn!(
                        "[LAUNCHER] Sandbox unavailable ({}), launching {} without it",
                        e,
                        executable.display()
                    );
                    (
                        command(executable, args, options)
                            .spawn()
                            .map_err(spawn_error)?,
                        None,
                        SecurityLevel::Regular,
                    )
                }
            },
        };

        let process = supervise(child, level, confinement);
        info!(
            "[LAUNCHER] Started {} as pid {} ({})",
            executable.display(),
            process.pid,
            level
        );
        let mut launched = self.launched();
        launched.retain(|earlier| !earlier.has_exited());
        launched.push(process.clone());
        Ok(process)
    }

    /// Kill every launched process that is still running and wait briefly for each.
    pub async fn cleanup(&self) {
        let launched: Vec<InstallerProcess> = std::mem::take(&mut *self.launched());
        for process in launched {
            if process.has_exited() {
                continue;
            }
            process.kill();
            if tokio::time::timeout(CLEANUP_WAIT, process.wait())
                .await
                .is_err()
            {
                warn!(
                    "[LAUNCHER] Installer {} did not exit within {:?}",
                    process.pid, CLEANUP_WAIT
                );
            }
        }
    }

    pub fn running_count(&self) -> usize {
        self.launched()
            .iter()
            .filter(|process| !process.has_exited())
            .count()
    }
}

fn command(executable: &Path, args: &[String], options: &LaunchOptions) -> Command {
    let mut command = Command::new(executable);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &options.working_dir {
        command.current_dir(dir);
    }
    command.envs(options.env.iter().map(|(key, value)| (key, value)));
    #[cfg(windows)]
    command.creation_flags(CREATE_NO_WINDOW);
    command
}

#[cfg(unix)]
fn spawn_sandboxed(
    executable: &Path,
    args: &[String],
    options: &LaunchOptions,
) -> std::io::Result<(Child, Option<sandbox::Confinement>)> {
    let mut command = command(executable, args, options);
    sandbox::restrict(&mut command, &options.limits);
    Ok((command.spawn()?, None))
}

#[cfg(windows)]
fn spawn_sandboxed(
    executable: &Path,
    args: &[String],
    options: &LaunchOptions,
) -> std::io::Result<(Child, Option<sandbox::Confinement>)> {
    let mut child = command(executable, args, options).spawn()?;
    match sandbox::confine(&child) {
        Ok(confinement) => Ok((child, Some(confinement))),
        Err(e) => {
            let _ = child.start_kill();
            Err(e)
        }
    }
}

#[cfg(not(any(unix, windows)))]
fn spawn_sandboxed(
    _executable: &Path,
    _args: &[String],
    _options: &LaunchOptions,
) -> std::io::Result<(Child, Option<sandbox::Confinement>)> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "no sandbox on this platform",
    ))
}

fn supervise(
    mut child: Child,
    security_level: SecurityLevel,
    confinement: Option<sandbox::Confinement>,
) -> InstallerProcess {
    let pid = child.id().unwrap_or_default();
    let kill = Arc::new(Notify::new());
    let (exit_tx, exit_rx) = watch::channel(None);

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_output(pid, OutputStream::Stdout, stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_output(pid, OutputStream::Stderr, stderr));
    }

    let kill_signal = Arc::clone(&kill);
    tokio::spawn(async move {
        let _confinement = confinement;

        let finished = tokio::select! {
            status = child.wait() => Some(status),
            _ = kill_signal.notified() => None,
        };
        let status = match finished {
            Some(status) => status,
            None => {
                if let Err(e) = child.start_kill() {
                    debug!("[LAUNCHER] Kill of {} failed: {}", pid, e);
                }
                child.wait().await
            }
        };

        let exit = match status {
            Ok(status) => ProcessExit::from(status),
            Err(e) => {
                error!("[LAUNCHER] Lost track of installer {}: {}", pid, e);
                ProcessExit::unknown()
            }
        };
        if exit.success {
            info!("[LAUNCHER] Installer {} exited", pid);
        } else {
            warn!("[LAUNCHER] Installer {} exited with {}", pid, exit);
        }
        exit_tx.send_replace(Some(exit));
    });

    InstallerProcess {
        pid,
        security_level,
        kill,
        exit: exit_rx,
    }
}

async fn forward_output<R>(pid: u32, stream: OutputStream, output: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(output).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => logging::log_installer_output(pid, stream, &line),
            Ok(None) => break,
            Err(e) => {
                debug!("[LAUNCHER] Output of {} unreadable: {}", pid, e);
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn exit_code_is_observed() {
        let launcher = ProcessLauncher::new();
        let process = launcher
            .launch(
                Path::new("/bin/sh"),
                &sh("echo started; echo failing >&2; exit 3"),
                &LaunchOptions::default(),
            )
            .unwrap();

        let exit = process.wait().await;
        assert_eq!(exit.code, Some(3));
        assert!(!exit.success);
        assert_eq!(process.exit_status(), Some(exit));
        assert_eq!(launcher.running_count(), 0);
    }

    #[tokio::test]
    async fn sandboxed_launch_runs_with_restrictions_or_falls_back() {
        let launcher = ProcessLauncher::new();
        let options = LaunchOptions {
            security_level: SecurityLevel::Sandboxed,
            ..LaunchOptions::default()
        };
        let process = launcher
            .launch(
                Path::new("/bin/sh"),
                &sh("[ \"$(ulimit -c)\" = \"0\" ]"),
                &options,
            )
            .unwrap();

        let exit = process.wait().await;
        if process.security_level() == SecurityLevel::Sandboxed {
            assert!(exit.success, "core dumps still allowed: {}", exit);
        }
    }

    #[tokio::test]
    async fn working_dir_and_env_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new();
        let options = LaunchOptions {
            working_dir: Some(dir.path().to_path_buf()),
            env: vec![("INSTALLER_MARKER".to_string(), "on".to_string())],
            ..LaunchOptions::default()
        };
        let process = launcher
            .launch(
                Path::new("/bin/sh"),
                &sh("[ \"$INSTALLER_MARKER\" = on ] && touch marker"),
                &options,
            )
            .unwrap();

        assert!(process.wait().await.success);
        assert!(dir.path().join("marker").exists());
    }

    #[tokio::test]
    async fn kill_stops_a_running_installer() {
        let launcher = ProcessLauncher::new();
        let process = launcher
            .launch(
                Path::new("/bin/sh"),
                &sh("sleep 30"),
                &LaunchOptions::default(),
            )
            .unwrap();
        assert!(!process.has_exited());

        process.kill();
        let exit = tokio::time::timeout(Duration::from_secs(5), process.wait())
            .await
            .unwrap();
        assert!(!exit.success);
    }

    #[tokio::test]
    async fn cleanup_kills_everything_still_running() {
        let launcher = ProcessLauncher::new();
        let first = launcher
            .launch(Path::new("/bin/sh"), &sh("sleep 30"), &LaunchOptions::default())
            .unwrap();
        let second = launcher
            .launch(Path::new("/bin/sh"), &sh("sleep 30"), &LaunchOptions::default())
            .unwrap();
        assert_eq!(launcher.running_count(), 2);

        launcher.cleanup().await;
        assert!(first.has_exited());
        assert!(second.has_exited());
        assert_eq!(launcher.running_count(), 0);
    }

    #[tokio::test]
    async fn exited_installers_are_forgotten_on_the_next_launch() {
        let launcher = ProcessLauncher::new();
        let done = launcher
            .launch(Path::new("/bin/sh"), &sh("exit 0"), &LaunchOptions::default())
            .unwrap();
        done.wait().await;

        let running = launcher
            .launch(Path::new("/bin/sh"), &sh("sleep 30"), &LaunchOptions::default())
            .unwrap();
        assert_eq!(launcher.launched().len(), 1);
        assert_eq!(launcher.launched()[0].pid(), running.pid());

        launcher.cleanup().await;
        assert!(launcher.launched().is_empty());
    }

    #[tokio::test]
    async fn missing_executable_is_reported() {
        let launcher = ProcessLauncher::new();
        let err = launcher
            .launch(
                Path::new("/nonexistent/ModInstallerIPC"),
                &[],
                &LaunchOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, LaunchError::NotFound(_)));
    }

    #[test]
    fn security_levels_parse() {
        assert_eq!(SecurityLevel::parse("Sandboxed"), Some(SecurityLevel::Sandboxed));
        assert_eq!(SecurityLevel::parse("regular"), Some(SecurityLevel::Regular));
        assert_eq!(SecurityLevel::parse("paranoid"), None);
    }
}
