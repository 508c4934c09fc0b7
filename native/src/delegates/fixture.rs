//! Fixed host state loaded from JSON, for the command-line host and for tests.
//!
//! ```json
//! {
//!   "appVersion": "1.9.0",
//!   "gameVersion": "1.6.1170",
//!   "extender": { "name": "skse", "version": "2.2.6" },
//!   "plugins": [{ "name": "Skyrim.esm", "active": true }],
//!   "ini": { "skyrim.ini": { "Display": { "iSize W": "1920" } } },
//!   "dataFiles": { "textures/sky.dds": "..." }
//! }
//! ```

use async_trait::async_trait;
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use super::{GameContext, HostError, IniHost, PluginHost};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginState {
    pub name: String,
    #[serde(default)]
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtenderState {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StaticHost {
    pub app_version: String,
    pub game_version: String,
    pub extender: Option<ExtenderState>,
    pub plugins: Vec<PluginState>,
    /// file -> section -> key -> value
    pub ini: BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>>,
    /// data-relative path -> contents
    pub data_files: BTreeMap<String, String>,
}

impl StaticHost {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn load(path: &Path) -> Result<Self, HostError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| HostError::Failed(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&content)
            .map_err(|e| HostError::Failed(format!("{}: {}", path.display(), e)))
    }

    fn ini_value(&self, file: &str, section: &str, key: &str) -> Option<&String> {
        let (_, sections) = self
            .ini
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(file))?;
        let (_, keys) = sections
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(section))?;
        keys.iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value)
    }

    fn data_file(&self, path: &str) -> Option<&String> {
        let wanted = normalize(path);
        self.data_files
            .iter()
            .find(|(name, _)| normalize(name) == wanted)
            .map(|(_, content)| content)
    }
}

fn normalize(path: &str) -> String {
    path.replace('\\', "/")
        .trim_matches('/')
        .to_lowercase()
}

const NAME_MATCH: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

fn search_filter(pattern: &str) -> Result<Pattern, HostError> {
    Pattern::new(pattern)
        .map_err(|e| HostError::Failed(format!("invalid search filter '{}': {}", pattern, e)))
}

#[async_trait]
impl PluginHost for StaticHost {
    async fn get_all(&self, active_only: bool) -> Result<Vec<String>, HostError> {
        Ok(self
            .plugins
            .iter()
            .filter(|plugin| !active_only || plugin.active)
            .map(|plugin| plugin.name.clone())
            .collect())
    }
}

#[async_trait]
impl IniHost for StaticHost {
    async fn get_ini_string(
        &self,
        file: &str,
        section: &str,
        key: &str,
    ) -> Result<Option<String>, HostError> {
        Ok(self.ini_value(file, section, key).cloned())
    }

    async fn get_ini_int(
        &self,
        file: &str,
        section: &str,
        key: &str,
    ) -> Result<Option<i64>, HostError> {
        match self.ini_value(file, section, key) {
            None => Ok(None),
            Some(value) => value.trim().parse().map(Some).map_err(|_| {
                HostError::Failed(format!("[{}] {} in {} is not an integer", section, key, file))
            }),
        }
    }
}

#[async_trait]
impl GameContext for StaticHost {
    async fn app_version(&self) -> Result<String, HostError> {
        Ok(self.app_version.clone())
    }

    async fn current_game_version(&self) -> Result<String, HostError> {
        Ok(self.game_version.clone())
    }

    async fn extender_version(&self, extender: &str) -> Result<Option<String>, HostError> {
        Ok(self
            .extender
            .as_ref()
            .filter(|installed| installed.name.eq_ignore_ascii_case(extender))
            .map(|installed| installed.version.clone()))
    }

    async fn is_extender_present(&self) -> Result<bool, HostError> {
        Ok(self.extender.is_some())
    }

    async fn data_file_exists(&self, path: &str) -> Result<bool, HostError> {
        Ok(self.data_file(path).is_some())
    }

    async fn existing_data_file(&self, path: &str) -> Result<Option<Vec<u8>>, HostError> {
        Ok(self
            .data_file(path)
            .map(|content| content.as_bytes().to_vec()))
    }

    async fn existing_data_file_list(
        &self,
        folder: &str,
        pattern: &str,
        recursive: bool,
    ) -> Result<Vec<String>, HostError> {
        let filter = search_filter(pattern)?;
        let folder = normalize(folder);
        let files = self
            .data_files
            .keys()
            .filter_map(|path| {
                let normalized = normalize(path);
                let relative = if folder.is_empty() {
                    normalized.as_str()
                } else {
                    normalized.strip_prefix(&folder)?.strip_prefix('/')?
                };
                if !recursive && relative.contains('/') {
                    return None;
                }
                let file_name = relative.rsplit('/').next().unwrap_or(relative);
                filter
                    .matches_with(file_name, NAME_MATCH)
                    .then(|| path.clone())
            })
            .collect();
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegates::PluginProxy;
    use std::sync::Arc;

    fn host() -> StaticHost {
        StaticHost::from_json(
            r#"{
                "appVersion": "1.9.0",
                "gameVersion": "1.6.1170",
                "extender": { "name": "skse", "version": "2.2.6" },
                "plugins": [
                    { "name": "Skyrim.esm", "active": true },
                    { "name": "Old.esp", "active": false }
                ],
                "ini": { "Skyrim.ini": { "Display": { "iSize W": "1920", "sName": "x" } } },
                "dataFiles": {
                    "textures/sky.dds": "dds",
                    "textures/armor/iron.dds": "iron",
                    "meshes/iron.nif": "nif"
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn search_filters_ignore_case() {
        let matches = |pattern: &str, name: &str| {
            search_filter(pattern).unwrap().matches_with(name, NAME_MATCH)
        };
        assert!(matches("*.dds", "Sky.DDS"));
        assert!(matches("ir?n.*", "iron.nif"));
        assert!(matches("*", "anything"));
        assert!(!matches("*.esp", "plugin.esm"));
        assert!(matches!(search_filter("[.dds"), Err(HostError::Failed(_))));
    }

    #[tokio::test]
    async fn plugins_answer_through_the_proxy() {
        let proxy = PluginProxy::new(Arc::new(host()));
        assert!(proxy.is_active("skyrim.esm").await.unwrap());
        assert!(!proxy.is_active("Old.esp").await.unwrap());
        assert!(proxy.is_present("Old.esp").await.unwrap());
    }

    #[tokio::test]
    async fn ini_lookups_ignore_case() {
        let host = host();
        assert_eq!(
            host.get_ini_int("skyrim.INI", "display", "isize w").await,
            Ok(Some(1920))
        );
        assert_eq!(
            host.get_ini_string("Skyrim.ini", "Display", "missing").await,
            Ok(None)
        );
        assert!(host.get_ini_int("Skyrim.ini", "Display", "sName").await.is_err());
    }

    #[tokio::test]
    async fn context_queries() {
        let host = host();
        assert_eq!(host.app_version().await.unwrap(), "1.9.0");
        assert_eq!(
            host.extender_version("SKSE").await.unwrap(),
            Some("2.2.6".to_string())
        );
        assert_eq!(host.extender_version("f4se").await.unwrap(), None);
        assert!(host.data_file_exists("Textures\\Sky.dds").await.unwrap());
        assert_eq!(
            host.existing_data_file("meshes/iron.nif").await.unwrap(),
            Some(b"nif".to_vec())
        );
    }

    #[tokio::test]
    async fn data_file_listing_respects_recursion() {
        let host = host();
        let flat = host
            .existing_data_file_list("textures", "*.dds", false)
            .await
            .unwrap();
        assert_eq!(flat, vec!["textures/sky.dds".to_string()]);

        let deep = host
            .existing_data_file_list("textures", "*.dds", true)
            .await
            .unwrap();
        assert_eq!(deep.len(), 2);
    }
}
