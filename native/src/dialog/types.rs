use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::DialogError;

/// How many options of a group may be chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SelectionMode {
    SelectAny,
    SelectAll,
    SelectExactlyOne,
    SelectAtMostOne,
    SelectAtLeastOne,
    Unknown(String),
}

impl From<String> for SelectionMode {
    fn from(value: String) -> Self {
        match value.as_str() {
            "SelectAny" => SelectionMode::SelectAny,
            "SelectAll" => SelectionMode::SelectAll,
            "SelectExactlyOne" => SelectionMode::SelectExactlyOne,
            "SelectAtMostOne" => SelectionMode::SelectAtMostOne,
            "SelectAtLeastOne" => SelectionMode::SelectAtLeastOne,
            _ => SelectionMode::Unknown(value),
        }
    }
}

impl From<SelectionMode> for String {
    fn from(mode: SelectionMode) -> Self {
        match mode {
            SelectionMode::SelectAny => "SelectAny".to_string(),
            SelectionMode::SelectAll => "SelectAll".to_string(),
            SelectionMode::SelectExactlyOne => "SelectExactlyOne".to_string(),
            SelectionMode::SelectAtMostOne => "SelectAtMostOne".to_string(),
            SelectionMode::SelectAtLeastOne => "SelectAtLeastOne".to_string(),
            SelectionMode::Unknown(other) => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OptionType {
    Required,
    Optional,
    Recommended,
    NotUsable,
    CouldBeUsable,
    Unknown(String),
}

impl From<String> for OptionType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Required" => OptionType::Required,
            "Optional" => OptionType::Optional,
            "Recommended" => OptionType::Recommended,
            "NotUsable" => OptionType::NotUsable,
            "CouldBeUsable" => OptionType::CouldBeUsable,
            _ => OptionType::Unknown(value),
        }
    }
}

impl From<OptionType> for String {
    fn from(option_type: OptionType) -> Self {
        match option_type {
            OptionType::Required => "Required".to_string(),
            OptionType::Optional => "Optional".to_string(),
            OptionType::Recommended => "Recommended".to_string(),
            OptionType::NotUsable => "NotUsable".to_string(),
            OptionType::CouldBeUsable => "CouldBeUsable".to_string(),
            OptionType::Unknown(other) => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionEntry {
    pub id: i32,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub selected: bool,
    #[serde(default)]
    pub preset: bool,
    #[serde(rename = "type")]
    pub option_type: OptionType,
    #[serde(default)]
    pub condition_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: i32,
    pub name: String,
    #[serde(rename = "type")]
    pub selection_mode: SelectionMode,
    #[serde(default)]
    pub options: Vec<OptionEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: i32,
    pub name: String,
    #[serde(default = "visible_by_default")]
    pub visible: bool,
    #[serde(default)]
    pub groups: Vec<Group>,
}

fn visible_by_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderImage {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub show_fade: bool,
    #[serde(default)]
    pub height: i32,
}

/// One decision: which options of a group to pick on a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedOption {
    pub step_id: i32,
    pub group_id: i32,
    pub plugin_ids: Vec<i32>,
}

impl SelectedOption {
    pub fn new(step_id: i32, group_id: i32, plugin_ids: impl Into<Vec<i32>>) -> Self {
        Self {
            step_id,
            group_id,
            plugin_ids: plugin_ids.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Backward,
}

/// Payload of the continue callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueArgs {
    pub direction: Direction,
    pub current_step_id: i32,
}

/// Payload of the `startDialog` callback, minus the three remote callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DialogInfo {
    #[serde(default)]
    pub module_name: String,
    #[serde(default)]
    pub image: HeaderImage,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStateArgs {
    pub install_steps: Vec<Step>,
    pub current_step: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReportedError {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub details: String,
}

/// Reject content with duplicate step ids, group ids within a step, or option ids within a group.
pub fn validate_steps(steps: &[Step]) -> Result<(), DialogError> {
    let mut step_ids = HashSet::new();
    for step in steps {
        if !step_ids.insert(step.id) {
            return Err(DialogError::InvalidSteps(format!(
                "duplicate step id {}",
                step.id
            )));
        }

        let mut group_ids = HashSet::new();
        for group in &step.groups {
            if !group_ids.insert(group.id) {
                return Err(DialogError::InvalidSteps(format!(
                    "duplicate group id {} in step {}",
                    group.id, step.id
                )));
            }

            let mut option_ids = HashSet::new();
            for option in &group.options {
                if !option_ids.insert(option.id) {
                    return Err(DialogError::InvalidSteps(format!(
                        "duplicate option id {} in group {} of step {}",
                        option.id, group.id, step.id
                    )));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn steps(value: serde_json::Value) -> Vec<Step> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn wizard_content_parses_from_the_wire_shape() {
        let parsed = steps(json!([{
            "id": 0,
            "name": "Textures",
            "groups": [{
                "id": 1,
                "name": "Resolution",
                "type": "SelectExactlyOne",
                "options": [
                    { "id": 2, "name": "2K", "type": "Recommended", "selected": true },
                    { "id": 3, "name": "4K", "type": "Optional", "conditionMessage": "needs VRAM" }
                ]
            }]
        }]));

        let group = &parsed[0].groups[0];
        assert!(parsed[0].visible);
        assert_eq!(group.selection_mode, SelectionMode::SelectExactlyOne);
        assert_eq!(group.options[0].option_type, OptionType::Recommended);
        assert_eq!(
            group.options[1].condition_message.as_deref(),
            Some("needs VRAM")
        );
        assert!(validate_steps(&parsed).is_ok());
    }

    #[test]
    fn unknown_enum_values_are_kept() {
        let mode: SelectionMode = serde_json::from_value(json!("SelectSome")).unwrap();
        assert_eq!(mode, SelectionMode::Unknown("SelectSome".to_string()));
        assert_eq!(serde_json::to_value(&mode).unwrap(), json!("SelectSome"));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let duplicate_steps = steps(json!([
            { "id": 0, "name": "a" },
            { "id": 0, "name": "b" }
        ]));
        assert!(validate_steps(&duplicate_steps).is_err());

        let duplicate_options = steps(json!([{
            "id": 0,
            "name": "a",
            "groups": [{
                "id": 1,
                "name": "g",
                "type": "SelectAny",
                "options": [
                    { "id": 2, "name": "x", "type": "Optional" },
                    { "id": 2, "name": "y", "type": "Optional" }
                ]
            }]
        }]));
        assert!(validate_steps(&duplicate_options).is_err());
    }

    #[test]
    fn continue_args_use_lowercase_direction() {
        let args = ContinueArgs {
            direction: Direction::Backward,
            current_step_id: 4,
        };
        assert_eq!(
            serde_json::to_value(args).unwrap(),
            json!({ "direction": "backward", "currentStepId": 4 })
        );
    }
}
