use serde::{Deserialize, Serialize};

use super::types::SelectedOption;

/// Policy answering each `UpdateState`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", content = "choices", rename_all = "snake_case")]
pub enum Driver {
    /// Accept the installer's defaults and continue forward.
    #[default]
    Unattended,
    /// Replay fixed decisions, continuing forward after each step.
    Deterministic(Vec<SelectedOption>),
    /// Cancel on the first update.
    Cancelling,
}

impl Driver {
    /// Decision recorded for `step_id`, if any.
    pub fn decision_for(&self, step_id: i32) -> Option<&SelectedOption> {
        match self {
            Driver::Deterministic(decisions) => decisions
                .iter()
                .find(|decision| decision.step_id == step_id),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Driver::Unattended => "unattended",
            Driver::Deterministic(_) => "deterministic",
            Driver::Cancelling => "cancelling",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decisions_are_found_by_step() {
        let driver = Driver::Deterministic(vec![
            SelectedOption::new(0, 1, [2, 3]),
            SelectedOption::new(2, 0, [5]),
        ]);
        assert_eq!(driver.decision_for(2).map(|d| d.group_id), Some(0));
        assert!(driver.decision_for(1).is_none());
        assert!(Driver::Unattended.decision_for(0).is_none());
    }
}
