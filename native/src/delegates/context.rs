// Version and data-file queries, answered directly by the host.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

use super::{delegate, HostError};
use crate::ipc::Arg;

#[async_trait]
pub trait GameContext: Send + Sync {
    async fn app_version(&self) -> Result<String, HostError>;

    async fn current_game_version(&self) -> Result<String, HostError>;

    /// Version of the named script extender, if installed.
    async fn extender_version(&self, extender: &str) -> Result<Option<String>, HostError>;

    async fn is_extender_present(&self) -> Result<bool, HostError>;

    /// `path` is relative to the game's data directory.
    async fn data_file_exists(&self, path: &str) -> Result<bool, HostError>;

    async fn existing_data_file(&self, path: &str) -> Result<Option<Vec<u8>>, HostError>;

    /// Files under `folder` matching the wildcard `pattern`.
    async fn existing_data_file_list(
        &self,
        folder: &str,
        pattern: &str,
        recursive: bool,
    ) -> Result<Vec<String>, HostError>;
}

pub struct ContextProxy {
    host: Arc<dyn GameContext>,
}

impl ContextProxy {
    pub fn new(host: Arc<dyn GameContext>) -> Self {
        Self { host }
    }

    pub fn host(&self) -> &Arc<dyn GameContext> {
        &self.host
    }
}

#[derive(Deserialize)]
struct NoArgs {}

#[derive(Deserialize)]
struct ExtenderArgs {
    #[serde(default)]
    extender: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileArgs {
    file_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DataFileArgs {
    data_file: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileListArgs {
    folder_path: String,
    #[serde(default = "any_file")]
    search_filter: String,
    #[serde(default)]
    is_recursive: bool,
}

fn any_file() -> String {
    "*".to_string()
}

pub(crate) fn bind(proxy: Arc<ContextProxy>) -> Arg {
    let host = Arc::clone(proxy.host());

    macro_rules! forward {
        ($method:literal, |$args:ident: $ty:ty, $host:ident| $body:expr) => {{
            let shared = Arc::clone(&host);
            delegate($method, move |$args: $ty| {
                let $host = Arc::clone(&shared);
                async move { $body.await }
            })
        }};
    }

    Arg::object([
        (
            "getAppVersion",
            forward!("getAppVersion", |_args: NoArgs, host| host.app_version()),
        ),
        (
            "getCurrentGameVersion",
            forward!("getCurrentGameVersion", |_args: NoArgs, host| host
                .current_game_version()),
        ),
        (
            "getExtenderVersion",
            forward!("getExtenderVersion", |args: ExtenderArgs, host| host
                .extender_version(&args.extender)),
        ),
        (
            "isExtenderPresent",
            forward!("isExtenderPresent", |_args: NoArgs, host| host
                .is_extender_present()),
        ),
        (
            "checkIfFileExists",
            forward!("checkIfFileExists", |args: FileArgs, host| host
                .data_file_exists(&args.file_name)),
        ),
        (
            "getExistingDataFile",
            forward!("getExistingDataFile", |args: DataFileArgs, host| host
                .existing_data_file(&args.data_file)),
        ),
        (
            "getExistingDataFileList",
            forward!("getExistingDataFileList", |args: FileListArgs, host| host
                .existing_data_file_list(
                    &args.folder_path,
                    &args.search_filter,
                    args.is_recursive
                )),
        ),
    ])
}
