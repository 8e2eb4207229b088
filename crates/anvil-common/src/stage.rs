use serde::{Deserialize, Serialize};

use crate::error::CommonError;

/// Fine-grained lifecycle position of a story.
///
/// The variants are declared in their fixed total order; comparisons go
/// through [`ProgressStage::index`] so a resumed worker can skip every
/// sub-step it already finished.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    #[default]
    NotStarted,
    CodeGenerating,
    CodeWritten,
    TestsPassed,
    Committed,
    Pushed,
    MergedToEpic,
    JudgeEvaluating,
    Completed,
}

impl ProgressStage {
    pub const ALL: [ProgressStage; 9] = [
        ProgressStage::NotStarted,
        ProgressStage::CodeGenerating,
        ProgressStage::CodeWritten,
        ProgressStage::TestsPassed,
        ProgressStage::Committed,
        ProgressStage::Pushed,
        ProgressStage::MergedToEpic,
        ProgressStage::JudgeEvaluating,
        ProgressStage::Completed,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// True when `self` is the same stage as `other` or later.
    pub fn is_at_least(self, other: ProgressStage) -> bool {
        self.index() >= other.index()
    }

    pub fn next(self) -> Option<ProgressStage> {
        Self::ALL.get(self.index() + 1).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProgressStage::NotStarted => "not_started",
            ProgressStage::CodeGenerating => "code_generating",
            ProgressStage::CodeWritten => "code_written",
            ProgressStage::TestsPassed => "tests_passed",
            ProgressStage::Committed => "committed",
            ProgressStage::Pushed => "pushed",
            ProgressStage::MergedToEpic => "merged_to_epic",
            ProgressStage::JudgeEvaluating => "judge_evaluating",
            ProgressStage::Completed => "completed",
        }
    }
}

impl std::fmt::Display for ProgressStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProgressStage {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == wanted)
            .ok_or_else(|| CommonError::UnknownVariant {
                kind: "progress stage",
                value: s.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_is_total_and_indexed() {
        for (i, stage) in ProgressStage::ALL.iter().enumerate() {
            assert_eq!(stage.index(), i);
        }
        assert!(ProgressStage::Committed.is_at_least(ProgressStage::TestsPassed));
        assert!(ProgressStage::Committed.is_at_least(ProgressStage::Committed));
        assert!(!ProgressStage::CodeWritten.is_at_least(ProgressStage::Pushed));
    }

    #[test]
    fn next_walks_to_completed() {
        assert_eq!(
            ProgressStage::NotStarted.next(),
            Some(ProgressStage::CodeGenerating)
        );
        assert_eq!(ProgressStage::Completed.next(), None);
    }

    #[test]
    fn parses_snake_and_kebab_case() {
        assert_eq!(
            "merged-to-epic".parse::<ProgressStage>().unwrap(),
            ProgressStage::MergedToEpic
        );
        assert_eq!(
            "tests_passed".parse::<ProgressStage>().unwrap(),
            ProgressStage::TestsPassed
        );
        assert!("shipped".parse::<ProgressStage>().is_err());
    }

    #[test]
    fn serializes_as_snake_case() {
        let json = serde_json::to_string(&ProgressStage::JudgeEvaluating).unwrap();
        assert_eq!(json, "\"judge_evaluating\"");
    }
}
