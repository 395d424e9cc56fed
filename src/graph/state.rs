use serde::{Deserialize, Serialize};

/// Steps of one conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Classify,
    Retrieve,
    Grade,
    Rewrite,
    Generate,
    Clarify,
    Done,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Classify => "classify",
            Step::Retrieve => "retrieve",
            Step::Grade => "grade",
            Step::Rewrite => "rewrite",
            Step::Generate => "generate",
            Step::Clarify => "clarify",
            Step::Done => "done",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a step reported when it finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    RetrievalRequested,
    DirectAnswer,
    ClarificationRequested,
    Retrieved,
    NoDocuments,
    Relevant,
    NotRelevant,
    Rewritten,
    Finished,
}

/// Next step after `step` reported `outcome`.
///
/// Returns `None` when `outcome` cannot be produced by `step`.
pub fn transition(
    step: Step,
    outcome: Outcome,
    rewrites_used: u32,
    max_rewrites: u32,
) -> Option<Step> {
    let next = match (step, outcome) {
        (Step::Classify, Outcome::RetrievalRequested) => Step::Retrieve,
        (Step::Classify, Outcome::DirectAnswer) => Step::Generate,
        (Step::Classify, Outcome::ClarificationRequested) => Step::Clarify,
        (Step::Retrieve, Outcome::Retrieved) => Step::Grade,
        (Step::Grade, Outcome::NoDocuments | Outcome::Relevant) => Step::Generate,
        (Step::Grade, Outcome::NotRelevant) if rewrites_used < max_rewrites => Step::Rewrite,
        (Step::Grade, Outcome::NotRelevant) => Step::Generate,
        (Step::Rewrite, Outcome::Rewritten) => Step::Classify,
        (Step::Generate | Step::Clarify, Outcome::Finished) => Step::Done,
        (Step::Classify, _)
        | (Step::Retrieve, _)
        | (Step::Grade, _)
        | (Step::Rewrite, _)
        | (Step::Generate, _)
        | (Step::Clarify, _)
        | (Step::Done, _) => return None,
    };
    Some(next)
}
