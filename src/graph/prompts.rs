use serde_json::json;

use crate::llm::ToolSpec;
use crate::rag::RetrievedDocument;

pub const RETRIEVE_TOOL: &str = "retrieve_documents";
pub const CLARIFY_TOOL: &str = "request_clarification";

/// Returned when retrieval ran but left nothing to ground an answer on.
pub const INSUFFICIENT_CONTEXT_ANSWER: &str = "I could not find information about this in the available documents, so I don't know the answer. Please try rephrasing your question or contact HR directly.";

pub const APOLOGY_ANSWER: &str =
    "Sorry, something went wrong while answering your question. Please try again in a moment.";

pub const DEFAULT_CLARIFICATION: &str =
    "Could you give me a few more details about what you are looking for?";

pub const SYSTEM_PROMPT: &str = "You are an HR assistant answering employee questions about company policies, guidelines and regulations.\n\
Use the retrieve_documents tool to look up the relevant documents before answering any policy question.\n\
If the question is too vague to search for, ask the user for the missing details with request_clarification.\n\
If you don't know the answer, say that you don't know.";

pub fn retrieve_tool(description: &str) -> ToolSpec {
    ToolSpec {
        name: RETRIEVE_TOOL.to_string(),
        description: description.to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search query for the knowledge base"
                }
            },
            "required": ["query"]
        }),
    }
}

pub fn clarification_tool() -> ToolSpec {
    ToolSpec {
        name: CLARIFY_TOOL.to_string(),
        description: "Ask the user a follow-up question when their request lacks the details needed to search.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "question": {
                    "type": "string",
                    "description": "The follow-up question to show the user"
                }
            },
            "required": ["question"]
        }),
    }
}

pub fn rewrite_prompt(question: &str) -> String {
    format!(
        "Look at the input and try to reason about the underlying semantic intent/meaning.\n\
         Here is the initial question:\n\
         -------\n\
         {question}\n\
         -------\n\
         Formulate an improved question:"
    )
}

pub fn generation_prompt(question: &str, context: &str) -> String {
    format!(
        "You are an assistant for question-answering tasks. Use the following pieces of retrieved context to answer the question. \
         If you don't know the answer, just say that you don't know. Use three sentences maximum and keep the answer concise.\n\
         Question: {question} \n\
         Context: {context} \n\
         Answer:"
    )
}

/// Document bodies in retrieval order, blank-line separated.
pub fn format_context(documents: &[RetrievedDocument]) -> String {
    documents
        .iter()
        .map(|doc| doc.content.trim())
        .collect::<Vec<_>>()
        .join("\n\n")
}
