use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::error::ControllerError;
use super::locks::ThreadLocks;
use super::prompts::{
    clarification_tool, format_context, generation_prompt, retrieve_tool, rewrite_prompt,
    APOLOGY_ANSWER, CLARIFY_TOOL, DEFAULT_CLARIFICATION, INSUFFICIENT_CONTEXT_ANSWER,
    RETRIEVE_TOOL, SYSTEM_PROMPT,
};
use super::state::{transition, Outcome, Step};
use crate::core::config::ControllerConfig;
use crate::grader::{Grade, RelevanceGrader};
use crate::llm::{ChatMessage, ChatModel, ChatRequest};
use crate::rag::{RetrievalError, RetrievedDocument, RetrieverCatalog};
use crate::session::{
    Classification, ConversationState, DocumentRef, Role, SessionStore, StoreError, Turn,
};

/// One user message addressed to a thread.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatTurnRequest {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub new_chat: bool,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub text: String,
    /// Documents the answer was grounded on.
    pub sources: Vec<DocumentRef>,
    /// The answer is a follow-up question for the user.
    pub needs_more_input: bool,
    pub thread_id: String,
    pub run_id: String,
    pub route: Option<Classification>,
    pub rewrites: u32,
}

/// Working state of a single turn; dropped once the turn is persisted.
struct TurnRun {
    /// Question the turn started with; grading and generation use it.
    original_question: String,
    /// Latest formulation; rewrites replace it.
    question: String,
    scope: Option<String>,
    history: Vec<ChatMessage>,
    offer_clarification: bool,
    rewrites: u32,
    retrieval_query: Option<String>,
    documents: Vec<RetrievedDocument>,
    context: Vec<RetrievedDocument>,
    direct_reply: Option<String>,
    clarification: Option<String>,
    answer: Option<String>,
    needs_more_input: bool,
    route: Option<Classification>,
    trace: Vec<Step>,
}

impl TurnRun {
    fn new(
        question: String,
        scope: Option<String>,
        history: Vec<ChatMessage>,
        offer_clarification: bool,
    ) -> Self {
        Self {
            original_question: question.clone(),
            question,
            scope,
            history,
            offer_clarification,
            rewrites: 0,
            retrieval_query: None,
            documents: Vec::new(),
            context: Vec::new(),
            direct_reply: None,
            clarification: None,
            answer: None,
            needs_more_input: false,
            route: None,
            trace: Vec::new(),
        }
    }
}

/// Drives a turn through classify, retrieve, grade, rewrite and generate,
/// then checkpoints the thread.
pub struct ConversationController {
    model: Arc<dyn ChatModel>,
    retrievers: RetrieverCatalog,
    grader: Arc<dyn RelevanceGrader>,
    store: Arc<dyn SessionStore>,
    config: ControllerConfig,
    top_k: usize,
    locks: ThreadLocks,
}

impl ConversationController {
    pub fn new(
        model: Arc<dyn ChatModel>,
        retrievers: RetrieverCatalog,
        grader: Arc<dyn RelevanceGrader>,
        store: Arc<dyn SessionStore>,
        config: ControllerConfig,
        top_k: usize,
    ) -> Self {
        Self {
            model,
            retrievers,
            grader,
            store,
            config,
            top_k,
            locks: ThreadLocks::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn retrievers(&self) -> &RetrieverCatalog {
        &self.retrievers
    }

    /// Runs one turn. Model and retrieval failures degrade to an apology;
    /// only persistence errors are returned.
    pub async fn handle(&self, request: ChatTurnRequest) -> Result<Answer, StoreError> {
        let thread_id = match request
            .thread_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
        {
            Some(id) if !request.new_chat => id.to_string(),
            _ => uuid::Uuid::new_v4().to_string(),
        };
        let run_id = uuid::Uuid::new_v4().to_string();

        let _guard = self.locks.acquire(&thread_id).await;

        let checkpoint = self.store.load(&thread_id).await?;
        let expected_seq = checkpoint.as_ref().map(|c| c.seq);
        let mut state = checkpoint
            .map(|c| c.state)
            .unwrap_or_else(|| ConversationState::new(&thread_id));
        if request.username.is_some() {
            state.username = request.username.clone();
        }

        let history = state
            .recent_dialogue(self.config.history_window)
            .into_iter()
            .map(dialogue_message)
            .collect();

        let message = request.message.trim().to_string();
        let pending = state.pending_clarification.take();
        let (question, offer_clarification) = match &pending {
            Some(pending) => (format!("{} {}", pending, message), false),
            None => (message.clone(), self.config.clarification_enabled),
        };
        state.push_turn(Role::User, message, None);

        tracing::info!("Starting run {} on thread {}", run_id, thread_id);
        let mut run = TurnRun::new(question, request.scope, history, offer_clarification);

        let answer = match self.run(&mut run, &mut state).await {
            Ok(()) => Answer {
                text: run
                    .answer
                    .take()
                    .unwrap_or_else(|| APOLOGY_ANSWER.to_string()),
                sources: run.context.iter().map(DocumentRef::from).collect(),
                needs_more_input: run.needs_more_input,
                thread_id: thread_id.clone(),
                run_id,
                route: run.route,
                rewrites: run.rewrites,
            },
            Err(err) => {
                tracing::error!("Run {} degraded: {}", run_id, err);
                // The user may retry their reply to an unanswered clarification.
                if pending.is_some() {
                    state.pending_clarification = pending;
                }
                state.push_turn(Role::Assistant, APOLOGY_ANSWER, Some(err.step));
                Answer {
                    text: APOLOGY_ANSWER.to_string(),
                    sources: Vec::new(),
                    needs_more_input: false,
                    thread_id: thread_id.clone(),
                    run_id,
                    route: run.route,
                    rewrites: run.rewrites,
                }
            }
        };

        let seq = self
            .store
            .compare_and_swap(&thread_id, expected_seq, &state)
            .await?;
        tracing::debug!("Thread {} checkpointed at seq {}", thread_id, seq);

        Ok(answer)
    }

    async fn run(
        &self,
        run: &mut TurnRun,
        state: &mut ConversationState,
    ) -> Result<(), ControllerError> {
        let mut step = Step::Classify;

        while step != Step::Done {
            if run.trace.len() >= self.config.max_steps {
                return Err(ControllerError::new(
                    step,
                    format!("Maximum steps ({}) exceeded", self.config.max_steps),
                )
                .with_trace(&run.trace));
            }

            tracing::debug!("Executing step: {} (step {})", step, run.trace.len());
            run.trace.push(step);

            let outcome = self
                .execute(step, run, state)
                .await
                .map_err(|err| err.with_trace(&run.trace))?;

            step = transition(step, outcome, run.rewrites, self.config.max_rewrites).ok_or_else(
                || {
                    ControllerError::new(step, format!("Unexpected outcome {:?}", outcome))
                        .with_trace(&run.trace)
                },
            )?;
        }

        Ok(())
    }

    async fn execute(
        &self,
        step: Step,
        run: &mut TurnRun,
        state: &mut ConversationState,
    ) -> Result<Outcome, ControllerError> {
        match step {
            Step::Classify => self.classify(run, state).await,
            Step::Retrieve => self.retrieve(run, state).await,
            Step::Grade => Ok(self.grade(run, state).await),
            Step::Rewrite => self.rewrite(run, state).await,
            Step::Generate => self.generate(run, state).await,
            Step::Clarify => Ok(clarify(run, state)),
            Step::Done => Err(ControllerError::new(step, "Nothing to execute")),
        }
    }

    async fn classify(
        &self,
        run: &mut TurnRun,
        state: &mut ConversationState,
    ) -> Result<Outcome, ControllerError> {
        let mut messages = Vec::with_capacity(run.history.len() + 2);
        messages.push(ChatMessage::system(SYSTEM_PROMPT));
        messages.extend(run.history.iter().cloned());
        messages.push(ChatMessage::user(run.question.clone()));

        let mut tools = vec![retrieve_tool(&self.config.tool_description)];
        // Clarification is only offered before the first rewrite.
        if run.offer_clarification && run.rewrites == 0 {
            tools.push(clarification_tool());
        }

        let reply = self
            .model
            .complete(ChatRequest::new(messages).with_tools(tools))
            .await
            .map_err(|e| ControllerError::new(Step::Classify, e.to_string()))?;

        run.direct_reply = None;

        if let Some(call) = reply.tool_calls.first() {
            return match call.name.as_str() {
                RETRIEVE_TOOL => {
                    let query = call
                        .string_arg("query")
                        .unwrap_or(run.question.as_str())
                        .to_string();
                    state.push_turn(
                        Role::Tool,
                        format!("{}: {}", RETRIEVE_TOOL, query),
                        Some(Step::Classify),
                    );
                    run.retrieval_query = Some(query);
                    self.set_route(run, state, Classification::Retrieve);
                    Ok(Outcome::RetrievalRequested)
                }
                CLARIFY_TOOL => {
                    let question = call
                        .string_arg("question")
                        .unwrap_or(DEFAULT_CLARIFICATION)
                        .to_string();
                    state.push_turn(
                        Role::Tool,
                        format!("{}: {}", CLARIFY_TOOL, question),
                        Some(Step::Classify),
                    );
                    run.clarification = Some(question);
                    self.set_route(run, state, Classification::Clarify);
                    Ok(Outcome::ClarificationRequested)
                }
                other => Err(ControllerError::new(
                    Step::Classify,
                    format!("Model requested unknown tool: {}", other),
                )),
            };
        }

        let text = reply.text_or_empty();
        if text.is_empty() {
            return Err(ControllerError::new(
                Step::Classify,
                "Model returned neither an answer nor a tool call",
            ));
        }
        state.push_turn(Role::Tool, "direct answer", Some(Step::Classify));
        run.direct_reply = Some(text);
        self.set_route(run, state, Classification::Direct);
        Ok(Outcome::DirectAnswer)
    }

    fn set_route(&self, run: &mut TurnRun, state: &mut ConversationState, route: Classification) {
        tracing::info!("Classified as {:?}", route);
        run.route = Some(route);
        state.last_classification = Some(route);
    }

    async fn retrieve(
        &self,
        run: &mut TurnRun,
        state: &mut ConversationState,
    ) -> Result<Outcome, ControllerError> {
        let query = run
            .retrieval_query
            .take()
            .unwrap_or_else(|| run.question.clone());
        let retriever = self.retrievers.resolve(run.scope.as_deref());

        run.documents = match retriever.search(&query, self.top_k).await {
            Ok(documents) => documents,
            Err(RetrievalError::Empty) => Vec::new(),
            Err(err) => return Err(ControllerError::new(Step::Retrieve, err.to_string())),
        };
        tracing::info!(
            "Retrieved {} documents from {}",
            run.documents.len(),
            retriever.name()
        );

        state.record_documents(&run.documents);
        let summary = if run.documents.is_empty() {
            "no documents".to_string()
        } else {
            run.documents
                .iter()
                .map(|doc| doc.id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };
        state.push_turn(Role::Tool, summary, Some(Step::Retrieve));

        Ok(Outcome::Retrieved)
    }

    async fn grade(&self, run: &mut TurnRun, state: &mut ConversationState) -> Outcome {
        run.context.clear();

        let Some(top) = run.documents.first() else {
            state.push_turn(Role::Tool, "no documents to grade", Some(Step::Grade));
            return Outcome::NoDocuments;
        };

        match self.grader.grade(&run.original_question, &top.content).await {
            Grade::Relevant => {
                state.push_turn(Role::Tool, "relevant", Some(Step::Grade));
                run.context = run.documents.clone();
                Outcome::Relevant
            }
            Grade::NotRelevant => {
                state.push_turn(Role::Tool, "not relevant", Some(Step::Grade));
                Outcome::NotRelevant
            }
        }
    }

    async fn rewrite(
        &self,
        run: &mut TurnRun,
        state: &mut ConversationState,
    ) -> Result<Outcome, ControllerError> {
        let request = ChatRequest::new(vec![ChatMessage::user(rewrite_prompt(&run.question))]);
        let reply = self
            .model
            .complete(request)
            .await
            .map_err(|e| ControllerError::new(Step::Rewrite, e.to_string()))?;

        let rewritten = reply.text_or_empty();
        if rewritten.is_empty() {
            return Err(ControllerError::new(
                Step::Rewrite,
                "Rewrite produced an empty question",
            ));
        }

        run.rewrites += 1;
        tracing::info!("Rewrite {}: {}", run.rewrites, rewritten);
        state.push_turn(Role::Tool, rewritten.clone(), Some(Step::Rewrite));
        run.question = rewritten;
        run.documents.clear();

        Ok(Outcome::Rewritten)
    }

    async fn generate(
        &self,
        run: &mut TurnRun,
        state: &mut ConversationState,
    ) -> Result<Outcome, ControllerError> {
        let text = if let Some(reply) = run.direct_reply.take() {
            reply
        } else if run.context.is_empty() {
            tracing::info!("No relevant documents, answering without the model");
            INSUFFICIENT_CONTEXT_ANSWER.to_string()
        } else {
            let prompt = generation_prompt(&run.original_question, &format_context(&run.context));
            let reply = self
                .model
                .complete(ChatRequest::new(vec![ChatMessage::user(prompt)]))
                .await
                .map_err(|e| ControllerError::new(Step::Generate, e.to_string()))?;
            let text = reply.text_or_empty();
            if text.is_empty() {
                return Err(ControllerError::new(
                    Step::Generate,
                    "Model returned an empty answer",
                ));
            }
            text
        };

        state.push_turn(Role::Assistant, text.clone(), Some(Step::Generate));
        run.answer = Some(text);
        Ok(Outcome::Finished)
    }
}

fn clarify(run: &mut TurnRun, state: &mut ConversationState) -> Outcome {
    let question = run
        .clarification
        .take()
        .unwrap_or_else(|| DEFAULT_CLARIFICATION.to_string());

    state.pending_clarification = Some(run.question.clone());
    state.push_turn(Role::Assistant, question.clone(), Some(Step::Clarify));

    run.answer = Some(question);
    run.needs_more_input = true;
    Outcome::Finished
}

fn dialogue_message(turn: &Turn) -> ChatMessage {
    match turn.role {
        Role::Assistant => ChatMessage::assistant(turn.content.clone()),
        Role::User | Role::Tool => ChatMessage::user(turn.content.clone()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::llm::{ChatReply, LlmError};
    use crate::rag::Retriever;
    use crate::session::SqliteSessionStore;

    type Handler = dyn Fn(&ChatRequest) -> Result<ChatReply, LlmError> + Send + Sync;

    struct ScriptedModel {
        handler: Box<Handler>,
        calls: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedModel {
        fn new(
            handler: impl Fn(&ChatRequest) -> Result<ChatReply, LlmError> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                handler: Box::new(handler),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn complete(&self, request: ChatRequest) -> Result<ChatReply, LlmError> {
            let reply = (self.handler)(&request);
            self.calls.lock().unwrap().push(request);
            reply
        }
    }

    fn last_message(request: &ChatRequest) -> String {
        request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }

    /// Always searches with the user's message, rewrites to a fixed
    /// question and answers with the context verbatim.
    fn echo(request: &ChatRequest) -> Result<ChatReply, LlmError> {
        let last = last_message(request);
        if !request.tools.is_empty() {
            return Ok(ChatReply::tool_call(RETRIEVE_TOOL, json!({ "query": last })));
        }
        if last.ends_with("Formulate an improved question:") {
            return Ok(ChatReply::text("What does the annual leave policy say?"));
        }
        let context = last
            .split("Context: ")
            .nth(1)
            .and_then(|rest| rest.split(" \nAnswer:").next())
            .unwrap_or_default();
        Ok(ChatReply::text(context))
    }

    struct StubRetriever {
        documents: Vec<RetrievedDocument>,
        unavailable: bool,
        queries: Mutex<Vec<String>>,
    }

    impl StubRetriever {
        fn returning(documents: Vec<RetrievedDocument>) -> Arc<Self> {
            Arc::new(Self {
                documents,
                unavailable: false,
                queries: Mutex::new(Vec::new()),
            })
        }

        fn unavailable() -> Arc<Self> {
            Arc::new(Self {
                documents: Vec::new(),
                unavailable: true,
                queries: Mutex::new(Vec::new()),
            })
        }

        fn queries(&self) -> Vec<String> {
            self.queries.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Retriever for StubRetriever {
        fn name(&self) -> &str {
            "stub"
        }

        async fn search(
            &self,
            query: &str,
            top_k: usize,
        ) -> Result<Vec<RetrievedDocument>, RetrievalError> {
            self.queries.lock().unwrap().push(query.to_string());
            if self.unavailable {
                return Err(RetrievalError::Unavailable("connection refused".to_string()));
            }
            if self.documents.is_empty() {
                return Err(RetrievalError::Empty);
            }
            Ok(self.documents.iter().take(top_k).cloned().collect())
        }
    }

    struct FixedGrader(Grade);

    #[async_trait]
    impl RelevanceGrader for FixedGrader {
        async fn grade(&self, _question: &str, _document: &str) -> Grade {
            self.0
        }
    }

    fn doc(id: &str, content: &str) -> RetrievedDocument {
        RetrievedDocument {
            id: id.to_string(),
            title: format!("Title of {}", id),
            content: content.to_string(),
            score: 1.0,
            url: Some(format!("https://intranet/{}", id)),
        }
    }

    fn leave_doc() -> RetrievedDocument {
        doc(
            "hr-leave-1",
            "Employees are entitled to 20 days of paid annual leave per calendar year.",
        )
    }

    fn ask(message: &str) -> ChatTurnRequest {
        ChatTurnRequest {
            message: message.to_string(),
            ..ChatTurnRequest::default()
        }
    }

    fn ask_on(thread_id: &str, message: &str) -> ChatTurnRequest {
        ChatTurnRequest {
            thread_id: Some(thread_id.to_string()),
            ..ask(message)
        }
    }

    async fn controller_with(
        model: Arc<ScriptedModel>,
        retriever: Arc<StubRetriever>,
        grade: Grade,
        config: ControllerConfig,
    ) -> ConversationController {
        let path = std::env::temp_dir().join(format!(
            "rag-assistant-controller-test-{}.db",
            uuid::Uuid::new_v4()
        ));
        let store = SqliteSessionStore::with_path(path).await.unwrap();
        ConversationController::new(
            model,
            RetrieverCatalog::single(retriever),
            Arc::new(FixedGrader(grade)),
            Arc::new(store),
            config,
            3,
        )
    }

    async fn controller(
        model: Arc<ScriptedModel>,
        retriever: Arc<StubRetriever>,
        grade: Grade,
    ) -> ConversationController {
        controller_with(model, retriever, grade, ControllerConfig::default()).await
    }

    async fn saved_state(controller: &ConversationController, thread_id: &str) -> ConversationState {
        controller
            .store()
            .load(thread_id)
            .await
            .unwrap()
            .unwrap()
            .state
    }

    #[tokio::test]
    async fn leave_policy_is_answered_from_the_retrieved_document() {
        let leave = leave_doc();
        let model = ScriptedModel::new(echo);
        let retriever = StubRetriever::returning(vec![leave.clone()]);
        let controller = controller(model.clone(), retriever.clone(), Grade::Relevant).await;

        let answer = controller
            .handle(ask("What is the leave policy?"))
            .await
            .unwrap();

        assert_eq!(answer.text, leave.content);
        assert_eq!(answer.sources, vec![DocumentRef::from(&leave)]);
        assert_eq!(answer.route, Some(Classification::Retrieve));
        assert_eq!(answer.rewrites, 0);
        assert!(!answer.needs_more_input);
        assert_eq!(retriever.queries(), vec!["What is the leave policy?"]);
        assert_eq!(model.call_count(), 2);

        let state = saved_state(&controller, &answer.thread_id).await;
        let roles: Vec<Role> = state.turns().iter().map(|t| t.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Tool, Role::Tool, Role::Tool, Role::Assistant]
        );
        let steps: Vec<Option<Step>> = state.turns().iter().map(|t| t.step).collect();
        assert_eq!(
            steps,
            vec![
                None,
                Some(Step::Classify),
                Some(Step::Retrieve),
                Some(Step::Grade),
                Some(Step::Generate)
            ]
        );
        assert_eq!(state.turns()[4].content, leave.content);
        assert_eq!(state.documents, vec![DocumentRef::from(&leave)]);
        assert_eq!(state.last_classification, Some(Classification::Retrieve));
    }

    #[tokio::test]
    async fn empty_retrieval_answers_without_the_model() {
        let model = ScriptedModel::new(echo);
        let retriever = StubRetriever::returning(Vec::new());
        let controller = controller(model.clone(), retriever, Grade::Relevant).await;

        let answer = controller
            .handle(ask("What is the leave policy?"))
            .await
            .unwrap();

        assert_eq!(answer.text, INSUFFICIENT_CONTEXT_ANSWER);
        assert!(answer.sources.is_empty());
        // Only the classifier was consulted.
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn rewrite_loop_is_bounded() {
        let model = ScriptedModel::new(echo);
        let retriever = StubRetriever::returning(vec![leave_doc()]);
        let controller = controller(model.clone(), retriever.clone(), Grade::NotRelevant).await;

        let answer = controller
            .handle(ask("What is the leave policy?"))
            .await
            .unwrap();

        assert_eq!(answer.rewrites, 2);
        assert_eq!(answer.text, INSUFFICIENT_CONTEXT_ANSWER);
        assert!(answer.sources.is_empty());
        assert_eq!(
            retriever.queries(),
            vec![
                "What is the leave policy?",
                "What does the annual leave policy say?",
                "What does the annual leave policy say?"
            ]
        );
        // Three classifications and two rewrites.
        assert_eq!(model.call_count(), 5);
    }

    #[tokio::test]
    async fn zero_rewrite_budget_generates_immediately() {
        let model = ScriptedModel::new(echo);
        let retriever = StubRetriever::returning(vec![leave_doc()]);
        let config = ControllerConfig {
            max_rewrites: 0,
            ..ControllerConfig::default()
        };
        let controller =
            controller_with(model, retriever.clone(), Grade::NotRelevant, config).await;

        let answer = controller.handle(ask("leave?")).await.unwrap();

        assert_eq!(answer.rewrites, 0);
        assert_eq!(answer.text, INSUFFICIENT_CONTEXT_ANSWER);
        assert_eq!(retriever.queries().len(), 1);
    }

    #[tokio::test]
    async fn citations_come_from_the_retrieved_set() {
        let documents = vec![
            doc("a", "Annual leave is 20 days."),
            doc("b", "Sick leave is unlimited with a note."),
            doc("c", "Parental leave is 16 weeks."),
        ];
        let model = ScriptedModel::new(echo);
        let retriever = StubRetriever::returning(documents.clone());
        let controller = controller(model, retriever, Grade::Relevant).await;

        let answer = controller.handle(ask("Tell me about leave")).await.unwrap();

        assert_eq!(answer.sources.len(), 3);
        for source in &answer.sources {
            assert!(documents.iter().any(|d| d.id == source.id));
        }
        assert_eq!(
            answer.text,
            "Annual leave is 20 days.\n\nSick leave is unlimited with a note.\n\nParental leave is 16 weeks."
        );
    }

    #[tokio::test]
    async fn clarification_reply_is_merged_into_the_question() {
        let model = ScriptedModel::new(|request: &ChatRequest| {
            if request.tools.iter().any(|t| t.name == CLARIFY_TOOL) {
                return Ok(ChatReply::tool_call(
                    CLARIFY_TOOL,
                    json!({ "question": "Which office are you based in?" }),
                ));
            }
            echo(request)
        });
        let retriever = StubRetriever::returning(vec![leave_doc()]);
        let controller = controller(model, retriever.clone(), Grade::Relevant).await;

        let first = controller
            .handle(ask("What is the leave policy?"))
            .await
            .unwrap();
        assert!(first.needs_more_input);
        assert_eq!(first.text, "Which office are you based in?");
        assert_eq!(first.route, Some(Classification::Clarify));
        assert!(retriever.queries().is_empty());

        let pending = saved_state(&controller, &first.thread_id).await;
        assert_eq!(
            pending.pending_clarification.as_deref(),
            Some("What is the leave policy?")
        );

        let second = controller
            .handle(ask_on(&first.thread_id, "New York"))
            .await
            .unwrap();
        assert_eq!(second.thread_id, first.thread_id);
        assert!(!second.needs_more_input);
        assert_eq!(second.text, leave_doc().content);
        assert_eq!(retriever.queries(), vec!["What is the leave policy? New York"]);

        let state = saved_state(&controller, &first.thread_id).await;
        assert!(state.pending_clarification.is_none());
    }

    #[tokio::test]
    async fn failed_clarification_reply_keeps_the_question_pending() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = calls.clone();
        let model = ScriptedModel::new(move |_: &ChatRequest| {
            if counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                return Ok(ChatReply::tool_call(
                    CLARIFY_TOOL,
                    json!({ "question": "Which office are you based in?" }),
                ));
            }
            Err(LlmError::Status {
                status: 503,
                body: "overloaded".to_string(),
            })
        });
        let controller =
            controller(model, StubRetriever::returning(vec![leave_doc()]), Grade::Relevant).await;

        let first = controller
            .handle(ask("What is the leave policy?"))
            .await
            .unwrap();
        assert!(first.needs_more_input);

        let second = controller
            .handle(ask_on(&first.thread_id, "New York"))
            .await
            .unwrap();
        assert_eq!(second.text, APOLOGY_ANSWER);

        let state = saved_state(&controller, &first.thread_id).await;
        assert_eq!(
            state.pending_clarification.as_deref(),
            Some("What is the leave policy?")
        );
    }

    #[tokio::test]
    async fn full_rewrite_budget_fits_the_smallest_valid_step_cap() {
        let model = ScriptedModel::new(echo);
        let mut config = ControllerConfig {
            clarification_enabled: false,
            ..ControllerConfig::default()
        };
        config.max_steps = config.steps_for_full_budget();
        let controller = controller_with(
            model,
            StubRetriever::returning(vec![leave_doc()]),
            Grade::NotRelevant,
            config,
        )
        .await;

        let answer = controller.handle(ask("leave?")).await.unwrap();
        assert_eq!(answer.rewrites, 2);
        assert_eq!(answer.text, INSUFFICIENT_CONTEXT_ANSWER);
    }

    #[tokio::test]
    async fn plain_reply_is_answered_directly() {
        let model = ScriptedModel::new(|_: &ChatRequest| Ok(ChatReply::text("Hello! How can I help?")));
        let retriever = StubRetriever::returning(vec![leave_doc()]);
        let controller = controller(model.clone(), retriever.clone(), Grade::Relevant).await;

        let answer = controller.handle(ask("hi")).await.unwrap();

        assert_eq!(answer.text, "Hello! How can I help?");
        assert_eq!(answer.route, Some(Classification::Direct));
        assert!(answer.sources.is_empty());
        assert!(retriever.queries().is_empty());
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn model_failure_degrades_to_apology() {
        let model = ScriptedModel::new(|_: &ChatRequest| {
            Err(LlmError::Status {
                status: 503,
                body: "overloaded".to_string(),
            })
        });
        let retriever = StubRetriever::returning(vec![leave_doc()]);
        let controller = controller(model, retriever, Grade::Relevant).await;

        let answer = controller.handle(ask("What is the leave policy?")).await.unwrap();
        assert_eq!(answer.text, APOLOGY_ANSWER);

        let state = saved_state(&controller, &answer.thread_id).await;
        let last = state.turns().last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.content, APOLOGY_ANSWER);
        assert_eq!(last.step, Some(Step::Classify));
    }

    #[tokio::test]
    async fn unavailable_index_degrades_to_apology() {
        let model = ScriptedModel::new(echo);
        let controller = controller(model, StubRetriever::unavailable(), Grade::Relevant).await;

        let answer = controller.handle(ask("What is the leave policy?")).await.unwrap();

        assert_eq!(answer.text, APOLOGY_ANSWER);
        assert!(answer.sources.is_empty());
    }

    #[tokio::test]
    async fn step_limit_stops_runaway_turns() {
        let model = ScriptedModel::new(echo);
        let config = ControllerConfig {
            max_steps: 4,
            ..ControllerConfig::default()
        };
        let controller = controller_with(
            model,
            StubRetriever::returning(vec![leave_doc()]),
            Grade::NotRelevant,
            config,
        )
        .await;

        let answer = controller.handle(ask("leave?")).await.unwrap();
        assert_eq!(answer.text, APOLOGY_ANSWER);
    }

    #[tokio::test]
    async fn thread_ids_follow_new_chat_and_reuse() {
        let model = ScriptedModel::new(echo);
        let controller = controller(
            model,
            StubRetriever::returning(vec![leave_doc()]),
            Grade::Relevant,
        )
        .await;

        let first = controller.handle(ask("leave?")).await.unwrap();
        assert!(uuid::Uuid::parse_str(&first.thread_id).is_ok());

        let same = controller
            .handle(ask_on(&first.thread_id, "and sick leave?"))
            .await
            .unwrap();
        assert_eq!(same.thread_id, first.thread_id);
        assert_ne!(same.run_id, first.run_id);

        let fresh = controller
            .handle(ChatTurnRequest {
                new_chat: true,
                ..ask_on(&first.thread_id, "start over")
            })
            .await
            .unwrap();
        assert_ne!(fresh.thread_id, first.thread_id);

        let state = saved_state(&controller, &first.thread_id).await;
        let user_turns = state
            .turns()
            .iter()
            .filter(|t| t.role == Role::User)
            .count();
        assert_eq!(user_turns, 2);
    }

    #[tokio::test]
    async fn concurrent_turns_on_one_thread_are_serialized() {
        let model = ScriptedModel::new(echo);
        let controller = Arc::new(
            controller(
                model,
                StubRetriever::returning(vec![leave_doc()]),
                Grade::Relevant,
            )
            .await,
        );

        let (a, b) = tokio::join!(
            controller.handle(ask_on("shared", "first question")),
            controller.handle(ask_on("shared", "second question")),
        );
        assert!(a.is_ok());
        assert!(b.is_ok());

        let checkpoint = controller.store().load("shared").await.unwrap().unwrap();
        assert_eq!(checkpoint.seq, 2);
        let user_turns = checkpoint
            .state
            .turns()
            .iter()
            .filter(|t| t.role == Role::User)
            .count();
        assert_eq!(user_turns, 2);
    }
}
