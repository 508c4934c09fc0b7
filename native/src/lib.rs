pub mod config;
pub mod delegates;
pub mod dialog;
pub mod installer;
pub mod ipc;
pub mod launcher;
pub mod logging;

#[cfg(test)]
mod test_support;

pub use config::{ConfigError, HostConfig};
pub use delegates::{GameContext, HostError, HostServices, IniHost, PluginHost, StaticHost};
pub use dialog::{DialogError, DialogSession, Driver, SelectedOption};
pub use installer::{
    InstallError, InstallRequest, InstallResult, InstallSession, Instruction, SessionTimeouts,
    SupportedResult,
};
pub use ipc::{Connection, RpcError, TransportKind};
pub use launcher::{InstallerProcess, LaunchError, LaunchOptions, ProcessLauncher, SecurityLevel};

pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
