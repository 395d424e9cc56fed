pub mod core;
pub mod grader;
pub mod graph;
pub mod llm;
pub mod rag;
pub mod server;
pub mod session;
pub mod state;
