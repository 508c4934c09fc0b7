use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::ipc::Arg;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallRequest {
    /// Archive-relative paths of every file in the mod.
    pub files: Vec<String>,
    #[serde(default)]
    pub stop_patterns: Vec<String>,
    /// Data directory plugins install into, e.g. `Data`.
    pub plugin_path: String,
    /// Directory the mod archive was extracted to.
    pub script_path: String,
    /// Choices of a previous install to preselect.
    #[serde(default)]
    pub preset: Option<Value>,
    #[serde(default = "validate_by_default")]
    pub validate: bool,
}

fn validate_by_default() -> bool {
    true
}

impl InstallRequest {
    pub fn new(
        files: Vec<String>,
        plugin_path: impl Into<String>,
        script_path: impl Into<String>,
    ) -> Self {
        Self {
            files,
            stop_patterns: Vec::new(),
            plugin_path: plugin_path.into(),
            script_path: script_path.into(),
            preset: None,
            validate: true,
        }
    }

    /// Request parameters with the delegate callbacks under `context`.
    pub(crate) fn into_arg(self, context: Arg) -> Arg {
        Arg::object([
            ("files", Arg::from(json!(self.files))),
            ("stopPatterns", Arg::from(json!(self.stop_patterns))),
            ("pluginPath", Arg::from(Value::String(self.plugin_path))),
            ("scriptPath", Arg::from(Value::String(self.script_path))),
            ("preset", Arg::from(self.preset.unwrap_or(Value::Null))),
            ("validate", Arg::from(Value::Bool(self.validate))),
            ("context", context),
        ])
    }
}

/// One file, ini or plugin operation for the host to carry out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instruction {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallResult {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub instructions: Vec<Instruction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedResult {
    pub supported: bool,
    #[serde(default)]
    pub required_files: Vec<String>,
}
