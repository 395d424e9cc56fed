//! Binary relevance grading of a retrieved document against a question.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::llm::{ChatMessage, ChatModel, ChatReply, ChatRequest, ToolSpec};

const GRADE_TOOL: &str = "grade_document";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grade {
    Relevant,
    NotRelevant,
}

/// Grading never fails: an undecidable grade counts as `NotRelevant`.
#[async_trait]
pub trait RelevanceGrader: Send + Sync {
    async fn grade(&self, question: &str, document: &str) -> Grade;
}

/// Binary score for the relevance check.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct GradeOutput {
    /// Relevance score 'yes' or 'no'
    binary_score: BinaryScore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
enum BinaryScore {
    Yes,
    No,
}

fn grading_prompt(question: &str, document: &str) -> String {
    format!(
        "You are a grader assessing relevance of a retrieved document to a user question.\n\
         Here is the retrieved document:\n\n{document}\n\n\
         Here is the user question: {question}\n\
         If the document contains keyword(s) or semantic meaning related to the user question, grade it as relevant.\n\
         Give a binary 'yes' or 'no' score to indicate whether the document is relevant to the question."
    )
}

fn grade_schema() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(GradeOutput)).unwrap_or_default()
}

/// The grade is returned as the arguments of a forced function call, which
/// every chat-completions API version accepts.
fn grade_request(question: &str, document: &str) -> ChatRequest {
    ChatRequest::new(vec![ChatMessage::user(grading_prompt(question, document))])
        .with_forced_tool(ToolSpec {
            name: GRADE_TOOL.to_string(),
            description: "Binary score for relevance check.".to_string(),
            parameters: grade_schema(),
        })
}

fn score_to_grade(score: BinaryScore) -> Grade {
    match score {
        BinaryScore::Yes => Grade::Relevant,
        BinaryScore::No => Grade::NotRelevant,
    }
}

/// Prefers the grading tool's arguments, then falls back to the text content.
fn grade_from_reply(reply: &ChatReply) -> Option<Grade> {
    let from_tool = reply
        .tool_calls
        .iter()
        .find(|call| call.name == GRADE_TOOL)
        .and_then(|call| serde_json::from_value::<GradeOutput>(call.arguments.clone()).ok())
        .map(|output| score_to_grade(output.binary_score));
    from_tool.or_else(|| parse_grade(&reply.text_or_empty()))
}

fn bare_token() -> &'static Regex {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    TOKEN.get_or_init(|| Regex::new(r"^\W*(?i:(yes|no))\W*$").expect("static pattern"))
}

/// Reads the model's reply as a grade; `None` when it is neither the
/// structured object nor a bare yes/no.
fn parse_grade(reply: &str) -> Option<Grade> {
    let reply = reply.trim();
    if let Ok(output) = serde_json::from_str::<GradeOutput>(reply) {
        return Some(score_to_grade(output.binary_score));
    }
    let token = bare_token().captures(reply)?.get(1)?.as_str();
    if token.eq_ignore_ascii_case("yes") {
        Some(Grade::Relevant)
    } else {
        Some(Grade::NotRelevant)
    }
}

/// Grades with a chat model forced to call a tool taking `{"binary_score": "yes"|"no"}`.
pub struct LlmGrader {
    model: Arc<dyn ChatModel>,
}

impl LlmGrader {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl RelevanceGrader for LlmGrader {
    async fn grade(&self, question: &str, document: &str) -> Grade {
        let reply = match self.model.complete(grade_request(question, document)).await {
            Ok(reply) => reply,
            Err(err) => {
                tracing::warn!("Grading indeterminate, treating as not relevant: {}", err);
                return Grade::NotRelevant;
            }
        };

        match grade_from_reply(&reply) {
            Some(grade) => {
                tracing::debug!("Document graded {:?}", grade);
                grade
            }
            None => {
                tracing::warn!(
                    "Grading indeterminate, unparseable reply treated as not relevant: {:?}",
                    reply
                );
                Grade::NotRelevant
            }
        }
    }
}
