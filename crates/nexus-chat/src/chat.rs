//! The chat controller
//!
//! `Chat` owns the session store and at most one active stream per
//! session. Every stream runs on its own task and applies events under the
//! store lock, checking its cancellation token first, so a cancelled stream
//! can never touch a message again.

use std::{collections::HashMap, sync::Arc};

use futures::StreamExt;
use nexus_api::{
    AgentRequest, ApprovalRequest, Capabilities, DataSourceRef, Endpoint, HistoryEntry,
    ModelOverrides, SessionService, StreamEvent, SummaryRequest, Transport, TransportEvent,
    event::decode_lenient,
};
use parking_lot::Mutex;
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    events::ChatEvent,
    gate,
    hydrate::hydrate_messages,
    message::{Message, MessageStatus, Session},
    reducer::{TurnReducer, mark_interrupted},
    store::{DRAFT_SESSION_ID, SessionInfo, SessionStore},
    util::prefix_chars,
};

/// Characters of the first question used as a new session's title
const TITLE_CHARS: usize = 30;

/// Chat configuration, fixed for the controller's lifetime
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Model settings forwarded with every request
    pub model: ModelOverrides,
    /// Capability set forwarded with every turn
    pub capabilities: Capabilities,
    /// Upper bound on agent tool rounds per turn
    pub tool_round_budget: u32,
    /// Number of prior messages sent as history
    pub history_window: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model: ModelOverrides::default(),
            capabilities: Capabilities::default(),
            tool_round_budget: 12,
            history_window: 10,
        }
    }
}

/// The stream currently writing to a session
struct StreamSlot {
    cancel: CancellationToken,
    message_id: String,
}

struct ChatState {
    store: SessionStore,
    /// At most one slot per session id
    slots: HashMap<String, StreamSlot>,
}

struct Inner {
    state: Mutex<ChatState>,
    transport: Arc<dyn Transport>,
    sessions: Arc<dyn SessionService>,
    config: ChatConfig,
    event_tx: broadcast::Sender<ChatEvent>,
}

/// Handle to a running stream
pub struct TurnHandle {
    session_id: String,
    message_id: String,
    task: JoinHandle<MessageStatus>,
}

impl TurnHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Wait for the stream to stop writing, returning the message status
    pub async fn wait(self) -> MessageStatus {
        match self.task.await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!("Stream task for {} failed: {}", self.message_id, e);
                MessageStatus::Error
            }
        }
    }
}

/// Point-in-time copy of what a renderer needs
#[derive(Debug, Clone)]
pub struct ChatSnapshot {
    pub current: Session,
    pub sessions: Vec<SessionInfo>,
    pub data_source: Option<DataSourceRef>,
    /// A stream is writing to the current session
    pub streaming: bool,
}

/// The chat controller
#[derive(Clone)]
pub struct Chat {
    inner: Arc<Inner>,
}

impl Chat {
    /// Create a controller starting on the draft session
    pub fn new(
        config: ChatConfig,
        transport: Arc<dyn Transport>,
        sessions: Arc<dyn SessionService>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(ChatState {
                    store: SessionStore::new(),
                    slots: HashMap::new(),
                }),
                transport,
                sessions,
                config,
                event_tx,
            }),
        }
    }

    /// Subscribe to chat events
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.inner.event_tx.subscribe()
    }

    pub fn config(&self) -> &ChatConfig {
        &self.inner.config
    }

    fn emit(&self, event: ChatEvent) {
        let _ = self.inner.event_tx.send(event);
    }

    /// Copy of the current session and the session list
    pub fn snapshot(&self) -> ChatSnapshot {
        let state = self.inner.state.lock();
        ChatSnapshot {
            current: state.store.current().clone(),
            sessions: state.store.sessions(),
            data_source: state.store.data_source(),
            streaming: state.slots.contains_key(state.store.current_id()),
        }
    }

    /// Look up one message
    pub fn message(&self, session_id: &str, message_id: &str) -> Option<Message> {
        let state = self.inner.state.lock();
        state.store.session(session_id)?.message(message_id).cloned()
    }

    /// Whether a stream is writing to the current session
    pub fn is_streaming(&self) -> bool {
        let state = self.inner.state.lock();
        state.slots.contains_key(state.store.current_id())
    }

    /// Send a question as a new turn in the current session
    pub async fn submit(&self, text: &str) -> Result<TurnHandle> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::Other("Message is empty".to_string()));
        }
        if self.inner.state.lock().store.data_source().is_none() {
            return Err(Error::NoDataSource);
        }
        self.promote_draft_if_bound(text).await?;

        let config = &self.inner.config;
        let (session_id, user, model, body, cancel, interrupted) = {
            let mut state = self.inner.state.lock();
            let session_id = state.store.current_id().to_string();

            let prior = &state.store.current().messages;
            let history = prior[prior.len().saturating_sub(config.history_window)..]
                .iter()
                .map(|m| HistoryEntry {
                    role: m.role.history_name().to_string(),
                    content: m.content.clone(),
                })
                .collect();

            let mut request = AgentRequest::new(&session_id, text)
                .with_data_source(state.store.data_source());
            request.history = history;
            request.model = config.model.clone();
            request.tool_round_budget = config.tool_round_budget;
            request.capabilities = config.capabilities;
            let body = serde_json::to_value(&request).map_err(nexus_api::Error::from)?;

            let interrupted = interrupt_slot(&mut state, &session_id);

            let user = Message::user(text);
            let model = Message::model_placeholder();
            let session = state
                .store
                .session_mut(&session_id)
                .ok_or_else(|| Error::SessionNotFound(session_id.clone()))?;
            session.messages.push(user.clone());
            session.messages.push(model.clone());
            state.store.touch(&session_id);

            let cancel = CancellationToken::new();
            state.slots.insert(
                session_id.clone(),
                StreamSlot {
                    cancel: cancel.clone(),
                    message_id: model.id.clone(),
                },
            );
            (session_id, user, model, body, cancel, interrupted)
        };

        self.emit_interrupted(&session_id, interrupted);
        tracing::debug!("Submitting turn {} in session {}", model.id, session_id);
        self.emit(ChatEvent::MessageUpdated {
            session_id: session_id.clone(),
            message: user,
        });
        Ok(self.start_stream(
            session_id,
            model,
            Endpoint::AgentStream,
            body,
            TurnReducer::new(config.capabilities),
            cancel,
        ))
    }

    /// Approve a paused message and resume its turn.
    ///
    /// `edited_query` replaces the proposed query when given.
    pub fn approve(&self, message_id: &str, edited_query: Option<&str>) -> Result<TurnHandle> {
        let config = &self.inner.config;
        let (session_id, approved, body, cancel, interrupted) = {
            let mut state = self.inner.state.lock();
            let session_id = state.store.current_id().to_string();

            let mut approved = state
                .store
                .session(&session_id)
                .and_then(|s| s.message(message_id))
                .cloned()
                .ok_or_else(|| Error::MessageNotFound(message_id.to_string()))?;
            let query = gate::begin_approval(&mut approved, edited_query)?;

            let request = ApprovalRequest {
                session_id: session_id.clone(),
                message_id: message_id.to_string(),
                approved_query_text: query,
                model: config.model.clone(),
            };
            let body = serde_json::to_value(&request).map_err(nexus_api::Error::from)?;

            let interrupted = match state.slots.remove(&session_id) {
                Some(slot) => {
                    slot.cancel.cancel();
                    if slot.message_id == message_id {
                        None
                    } else {
                        state
                            .store
                            .message_mut(&session_id, &slot.message_id)
                            .and_then(|other| mark_interrupted(other).then(|| other.clone()))
                    }
                }
                None => None,
            };

            if let Some(msg) = state.store.message_mut(&session_id, message_id) {
                *msg = approved.clone();
            }
            let cancel = CancellationToken::new();
            state.slots.insert(
                session_id.clone(),
                StreamSlot {
                    cancel: cancel.clone(),
                    message_id: message_id.to_string(),
                },
            );
            (session_id, approved, body, cancel, interrupted)
        };

        self.emit_interrupted(&session_id, interrupted);
        Ok(self.start_stream(
            session_id,
            approved,
            Endpoint::Approve,
            body,
            TurnReducer::resume(config.capabilities),
            cancel,
        ))
    }

    /// Reject a paused message. Local only.
    pub fn reject(&self, message_id: &str) -> Result<()> {
        let (session_id, rejected) = {
            let mut state = self.inner.state.lock();
            let session_id = state.store.current_id().to_string();
            let msg = state
                .store
                .message_mut(&session_id, message_id)
                .ok_or_else(|| Error::MessageNotFound(message_id.to_string()))?;
            gate::reject(msg)?;
            (session_id, msg.clone())
        };
        self.emit(ChatEvent::MessageUpdated {
            session_id: session_id.clone(),
            message: rejected,
        });
        self.emit(ChatEvent::TurnFinished {
            session_id,
            message_id: message_id.to_string(),
            status: MessageStatus::Error,
        });
        Ok(())
    }

    /// Cancel the current session's stream, if any
    pub fn cancel(&self) -> bool {
        let (session_id, had_stream, interrupted) = {
            let mut state = self.inner.state.lock();
            let session_id = state.store.current_id().to_string();
            let had_stream = state.slots.contains_key(&session_id);
            let interrupted = interrupt_slot(&mut state, &session_id);
            (session_id, had_stream, interrupted)
        };
        if had_stream {
            tracing::debug!("Cancelled stream in session {}", session_id);
        }
        self.emit_interrupted(&session_id, interrupted);
        had_stream
    }

    /// Stream a narrative summary of the bound file into a new message
    pub fn summarize(&self) -> Result<TurnHandle> {
        let config = &self.inner.config;
        let (session_id, model, body, cancel, interrupted) = {
            let mut state = self.inner.state.lock();
            let file_id = match state.store.data_source() {
                Some(DataSourceRef::File(id)) => id,
                _ => return Err(Error::NoDataSource),
            };
            let session_id = state.store.current_id().to_string();

            let request = SummaryRequest {
                file_id,
                session_id: (!state.store.is_draft_current()).then(|| session_id.clone()),
                model: config.model.clone(),
            };
            let body = serde_json::to_value(&request).map_err(nexus_api::Error::from)?;

            let interrupted = interrupt_slot(&mut state, &session_id);
            let model = Message::model_placeholder();
            if let Some(session) = state.store.session_mut(&session_id) {
                session.messages.push(model.clone());
            }
            let cancel = CancellationToken::new();
            state.slots.insert(
                session_id.clone(),
                StreamSlot {
                    cancel: cancel.clone(),
                    message_id: model.id.clone(),
                },
            );
            (session_id, model, body, cancel, interrupted)
        };

        self.emit_interrupted(&session_id, interrupted);
        Ok(self.start_stream(
            session_id,
            model,
            Endpoint::Summary,
            body,
            TurnReducer::summary(config.capabilities),
            cancel,
        ))
    }

    /// Reload the session list from the session service
    pub async fn refresh_sessions(&self) -> Result<()> {
        let listing = self.inner.sessions.list_sessions().await?;
        tracing::debug!("Fetched {} sessions", listing.len());
        self.inner.state.lock().store.replace_sessions(listing);
        self.emit(ChatEvent::SessionsChanged);
        Ok(())
    }

    /// Switch to a session, fetching its history the first time
    pub async fn select_session(&self, id: &str) -> Result<()> {
        let needs_load = self.inner.state.lock().store.select(id)?;
        if needs_load {
            let stored = self.inner.sessions.fetch_messages(id).await?;
            let messages = hydrate_messages(&stored);
            tracing::debug!("Hydrated {} messages for session {}", messages.len(), id);

            let mut state = self.inner.state.lock();
            if !state.store.is_loaded(id) {
                state.store.install_messages(id, messages)?;
            }
        }
        self.emit(ChatEvent::SessionsChanged);
        Ok(())
    }

    /// Start over on an empty draft
    pub fn new_draft(&self) {
        let interrupted = {
            let mut state = self.inner.state.lock();
            let interrupted = interrupt_slot(&mut state, DRAFT_SESSION_ID);
            state.store.reset_draft();
            interrupted
        };
        self.emit_interrupted(DRAFT_SESSION_ID, interrupted);
        self.emit(ChatEvent::SessionsChanged);
    }

    /// Delete a persisted session
    pub async fn delete_session(&self, id: &str) -> Result<()> {
        if id == DRAFT_SESSION_ID {
            return Err(Error::Other("The draft session cannot be deleted".to_string()));
        }
        self.inner.sessions.delete_session(id).await?;
        {
            let mut state = self.inner.state.lock();
            if let Some(slot) = state.slots.remove(id) {
                slot.cancel.cancel();
            }
            state.store.remove(id);
        }
        self.emit(ChatEvent::SessionsChanged);
        Ok(())
    }

    /// Bind (or clear) the data source of the current session
    pub fn bind_data_source(&self, source: Option<DataSourceRef>) {
        self.inner.state.lock().store.bind_data_source(source);
        self.emit(ChatEvent::SessionsChanged);
    }

    /// A draft with a bound file becomes a persisted session on first submit.
    async fn promote_draft_if_bound(&self, text: &str) -> Result<()> {
        let source = {
            let state = self.inner.state.lock();
            if !state.store.is_draft_current() {
                return Ok(());
            }
            state.store.data_source()
        };
        let Some(DataSourceRef::File(file_id)) = source else {
            return Ok(());
        };

        let title = prefix_chars(text, TITLE_CHARS);
        let summary = self.inner.sessions.create_session(file_id, &title).await?;

        let interrupted = {
            let mut state = self.inner.state.lock();
            let interrupted = interrupt_slot(&mut state, DRAFT_SESSION_ID);
            state.store.promote_draft(summary, source);
            interrupted
        };
        self.emit_interrupted(DRAFT_SESSION_ID, interrupted);
        self.emit(ChatEvent::SessionsChanged);
        Ok(())
    }

    fn emit_interrupted(&self, session_id: &str, interrupted: Option<Message>) {
        if let Some(msg) = interrupted {
            let message_id = msg.id.clone();
            let status = msg.status;
            self.emit(ChatEvent::MessageUpdated {
                session_id: session_id.to_string(),
                message: msg,
            });
            self.emit(ChatEvent::TurnFinished {
                session_id: session_id.to_string(),
                message_id,
                status,
            });
        }
    }

    fn start_stream(
        &self,
        session_id: String,
        message: Message,
        endpoint: Endpoint,
        body: serde_json::Value,
        reducer: TurnReducer,
        cancel: CancellationToken,
    ) -> TurnHandle {
        let message_id = message.id.clone();
        self.emit(ChatEvent::TurnStarted {
            session_id: session_id.clone(),
            message_id: message_id.clone(),
        });
        self.emit(ChatEvent::MessageUpdated {
            session_id: session_id.clone(),
            message,
        });

        let chat = self.clone();
        let task = {
            let session_id = session_id.clone();
            let message_id = message_id.clone();
            tokio::spawn(async move {
                chat.run_stream(session_id, message_id, endpoint, body, reducer, cancel)
                    .await
            })
        };
        TurnHandle {
            session_id,
            message_id,
            task,
        }
    }

    async fn run_stream(
        self,
        session_id: String,
        message_id: String,
        endpoint: Endpoint,
        body: serde_json::Value,
        mut reducer: TurnReducer,
        cancel: CancellationToken,
    ) -> MessageStatus {
        match self
            .inner
            .transport
            .open(endpoint, body, cancel.clone())
            .await
        {
            Ok(mut stream) => {
                while let Some(item) = stream.next().await {
                    let event = match item {
                        TransportEvent::Frame(payload) => match decode_lenient(&payload) {
                            Some(event) => event,
                            None => continue,
                        },
                        TransportEvent::Complete => break,
                        TransportEvent::Failed(reason) => {
                            tracing::warn!("Stream for {} failed: {}", message_id, reason);
                            StreamEvent::error(reason)
                        }
                    };
                    self.apply(&session_id, &message_id, &cancel, |msg| {
                        reducer.apply(msg, &event)
                    });
                    if cancel.is_cancelled() {
                        break;
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Could not open stream for {}: {}", message_id, e);
                let event = StreamEvent::error(e.to_string());
                self.apply(&session_id, &message_id, &cancel, |msg| {
                    reducer.apply(msg, &event)
                });
            }
        }

        self.finish_stream(&session_id, &message_id, &cancel, &mut reducer)
    }

    /// Mutate a message under the store lock unless the stream was cancelled
    fn apply(
        &self,
        session_id: &str,
        message_id: &str,
        cancel: &CancellationToken,
        f: impl FnOnce(&mut Message) -> bool,
    ) {
        let updated = {
            let mut state = self.inner.state.lock();
            if cancel.is_cancelled() {
                return;
            }
            let Some(msg) = state.store.message_mut(session_id, message_id) else {
                tracing::debug!("Message {} is gone; dropping event", message_id);
                return;
            };
            if !f(msg) {
                return;
            }
            msg.clone()
        };
        self.emit(ChatEvent::MessageUpdated {
            session_id: session_id.to_string(),
            message: updated,
        });
    }

    fn finish_stream(
        &self,
        session_id: &str,
        message_id: &str,
        cancel: &CancellationToken,
        reducer: &mut TurnReducer,
    ) -> MessageStatus {
        let (status, updated) = {
            let mut state = self.inner.state.lock();
            let current_status = |state: &ChatState| {
                state
                    .store
                    .session(session_id)
                    .and_then(|s| s.message(message_id))
                    .map(|m| m.status)
                    .unwrap_or(MessageStatus::Error)
            };
            if cancel.is_cancelled() {
                // whoever cancelled has already settled the message
                return current_status(&*state);
            }

            if state
                .slots
                .get(session_id)
                .is_some_and(|slot| slot.message_id == message_id)
            {
                state.slots.remove(session_id);
            }

            let Some(msg) = state.store.message_mut(session_id, message_id) else {
                return MessageStatus::Error;
            };
            let changed = reducer.finish(msg);
            let status = msg.status;
            let updated = changed.then(|| msg.clone());
            state.store.touch(session_id);
            (status, updated)
        };

        if let Some(message) = updated {
            self.emit(ChatEvent::MessageUpdated {
                session_id: session_id.to_string(),
                message,
            });
        }
        self.emit(ChatEvent::TurnFinished {
            session_id: session_id.to_string(),
            message_id: message_id.to_string(),
            status,
        });
        tracing::debug!("Stream for {} finished as {}", message_id, status);
        status
    }
}

/// Cancel the session's stream and mark its message interrupted.
/// Returns the message if it changed.
fn interrupt_slot(state: &mut ChatState, session_id: &str) -> Option<Message> {
    let slot = state.slots.remove(session_id)?;
    slot.cancel.cancel();
    let msg = state.store.message_mut(session_id, &slot.message_id)?;
    mark_interrupted(msg).then(|| msg.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placeholder::{INTERRUPTED_MARKER, count_sql_placeholders};
    use async_trait::async_trait;
    use nexus_api::{SessionSummary, StoredMessage, StoredStep, TransportStream};
    use std::collections::VecDeque;
    use tokio::sync::Notify;

    enum Script {
        /// Yield these events, then end
        Events(Vec<TransportEvent>),
        /// Yield these events, then stay open until cancelled
        Hold(Vec<TransportEvent>),
        /// Wait for cancellation, then keep yielding anyway
        Unruly(Vec<TransportEvent>),
        /// Fail to open
        OpenError,
    }

    /// Transport replaying scripted streams in order
    struct MockTransport {
        scripts: Mutex<VecDeque<Script>>,
        requests: Mutex<Vec<(Endpoint, serde_json::Value)>>,
    }

    impl MockTransport {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<(Endpoint, serde_json::Value)> {
            self.requests.lock().clone()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn open(
            &self,
            endpoint: Endpoint,
            body: serde_json::Value,
            cancel: CancellationToken,
        ) -> nexus_api::Result<TransportStream> {
            self.requests.lock().push((endpoint, body));
            let script = self
                .scripts
                .lock()
                .pop_front()
                .unwrap_or(Script::Events(vec![frame(&StreamEvent::Done)]));

            let stream: TransportStream = match script {
                Script::Events(events) => Box::pin(async_stream::stream! {
                    for e in events {
                        yield e;
                    }
                    yield TransportEvent::Complete;
                }),
                Script::Hold(events) => Box::pin(async_stream::stream! {
                    for e in events {
                        yield e;
                    }
                    cancel.cancelled().await;
                }),
                Script::Unruly(events) => Box::pin(async_stream::stream! {
                    cancel.cancelled().await;
                    for e in events {
                        yield e;
                    }
                }),
                Script::OpenError => return Err(nexus_api::Error::status(503, "unavailable")),
            };
            Ok(stream)
        }
    }

    /// Session service backed by memory
    #[derive(Default)]
    struct MockSessionService {
        sessions: Mutex<Vec<SessionSummary>>,
        messages: Mutex<HashMap<String, Vec<StoredMessage>>>,
        created: Mutex<Vec<(i64, String)>>,
        deleted: Mutex<Vec<String>>,
        fetches: Mutex<usize>,
        /// When set, fetches wait for a notification before answering
        fetch_gate: Mutex<Option<Arc<Notify>>>,
    }

    #[async_trait]
    impl SessionService for MockSessionService {
        async fn list_sessions(&self) -> nexus_api::Result<Vec<SessionSummary>> {
            Ok(self.sessions.lock().clone())
        }

        async fn create_session(&self, file_id: i64, title: &str) -> nexus_api::Result<SessionSummary> {
            let mut created = self.created.lock();
            created.push((file_id, title.to_string()));
            let summary = SessionSummary {
                id: format!("s{}", created.len()),
                title: title.to_string(),
                updated_at: 0,
                file_id: Some(file_id),
            };
            self.sessions.lock().push(summary.clone());
            Ok(summary)
        }

        async fn delete_session(&self, id: &str) -> nexus_api::Result<()> {
            self.deleted.lock().push(id.to_string());
            self.sessions.lock().retain(|s| s.id != id);
            Ok(())
        }

        async fn fetch_messages(&self, id: &str) -> nexus_api::Result<Vec<StoredMessage>> {
            *self.fetches.lock() += 1;
            let gate = self.fetch_gate.lock().clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            Ok(self.messages.lock().get(id).cloned().unwrap_or_default())
        }
    }

    fn frame(event: &StreamEvent) -> TransportEvent {
        TransportEvent::Frame(serde_json::to_string(event).unwrap())
    }

    fn frames(events: &[StreamEvent]) -> Vec<TransportEvent> {
        events.iter().map(frame).collect()
    }

    fn config() -> ChatConfig {
        ChatConfig {
            capabilities: Capabilities {
                auto_execute: false,
                ..Capabilities::default()
            },
            ..ChatConfig::default()
        }
    }

    fn make_chat(scripts: Vec<Script>) -> (Chat, Arc<MockTransport>, Arc<MockSessionService>) {
        let transport = MockTransport::new(scripts);
        let service = Arc::new(MockSessionService::default());
        let chat = Chat::new(config(), transport.clone(), service.clone());
        (chat, transport, service)
    }

    fn current_message(chat: &Chat, id: &str) -> Message {
        chat.snapshot().current.message(id).cloned().unwrap()
    }

    #[tokio::test]
    async fn test_submit_promotes_draft_and_runs_turn() {
        let (chat, transport, service) = make_chat(vec![Script::Events(frames(&[
            StreamEvent::text("Revenue grew 12%."),
            StreamEvent::Done,
        ]))]);
        chat.bind_data_source(Some(DataSourceRef::File(4)));

        let question = "What was the revenue growth across all regions last year?";
        let handle = chat.submit(question).await.unwrap();
        assert_eq!(handle.session_id(), "s1");
        let message_id = handle.message_id().to_string();
        assert_eq!(handle.wait().await, MessageStatus::Executed);

        let created = service.created.lock().clone();
        assert_eq!(created, vec![(4, prefix_chars(question, 30))]);

        let snapshot = chat.snapshot();
        assert_eq!(snapshot.current.id, "s1");
        assert_eq!(snapshot.current.messages.len(), 2);
        assert!(!snapshot.streaming);
        let msg = current_message(&chat, &message_id);
        assert_eq!(msg.content, "**Analysis**\n\nRevenue grew 12%.");

        let (endpoint, body) = &transport.requests()[0];
        assert_eq!(*endpoint, Endpoint::AgentStream);
        assert_eq!(body["session_id"], "s1");
        assert_eq!(body["file_id"], 4);
        assert_eq!(body["allow_auto_execute"], false);
        assert_eq!(body["max_tool_rounds"], 12);
        assert_eq!(body["history"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_submit_requires_data_source() {
        let (chat, transport, _) = make_chat(vec![]);
        assert!(matches!(chat.submit("hi").await, Err(Error::NoDataSource)));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_connection_source_stays_in_draft() {
        let (chat, transport, service) = make_chat(vec![]);
        chat.bind_data_source(Some(DataSourceRef::Connection(2)));
        chat.submit("count orders").await.unwrap().wait().await;
        assert!(service.created.lock().is_empty());
        assert_eq!(chat.snapshot().current.id, DRAFT_SESSION_ID);
        assert_eq!(transport.requests()[0].1["connection_id"], 2);
    }

    #[tokio::test]
    async fn test_history_window() {
        let transport = MockTransport::new(vec![]);
        let mut config = config();
        config.history_window = 2;
        let chat = Chat::new(
            config,
            transport.clone(),
            Arc::new(MockSessionService::default()),
        );
        chat.bind_data_source(Some(DataSourceRef::Connection(1)));

        chat.submit("first").await.unwrap().wait().await;
        chat.submit("second").await.unwrap().wait().await;
        chat.submit("third").await.unwrap().wait().await;

        let history = &transport.requests()[2].1["history"];
        let history = history.as_array().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["role"], "user");
        assert_eq!(history[0]["content"], "second");
        assert_eq!(history[1]["role"], "assistant");
    }

    #[tokio::test]
    async fn test_approval_resumes_same_message() {
        let (chat, transport, _) = make_chat(vec![
            Script::Events(frames(&[
                StreamEvent::text("I need to run a query."),
                StreamEvent::tool_call(
                    "sql_inter",
                    nexus_api::ToolCallStatus::PendingApproval,
                    Some("SELECT * FROM orders"),
                ),
                StreamEvent::Done,
            ])),
            Script::Events(frames(&[
                StreamEvent::tool_result(
                    "sql_inter",
                    r#"{"columns":["id"],"rows":[[1]],"row_count":1}"#,
                    nexus_api::ToolResultStatus::Success,
                ),
                StreamEvent::text(" One order found."),
                StreamEvent::Done,
            ])),
        ]);
        chat.bind_data_source(Some(DataSourceRef::Connection(1)));

        let handle = chat.submit("list orders").await.unwrap();
        let message_id = handle.message_id().to_string();
        assert_eq!(handle.wait().await, MessageStatus::PendingApproval);
        let paused = current_message(&chat, &message_id);

        let resumed = chat
            .approve(&message_id, Some("SELECT id FROM orders LIMIT 10"))
            .unwrap();
        assert_eq!(resumed.message_id(), message_id);
        assert_eq!(resumed.wait().await, MessageStatus::Executed);

        let msg = current_message(&chat, &message_id);
        assert!(msg.content.starts_with(&paused.content));
        assert!(msg.content.contains("One order found."));
        assert_eq!(msg.sql_query.as_deref(), Some("SELECT id FROM orders LIMIT 10"));
        assert_eq!(count_sql_placeholders(&msg.content), 1);
        assert!(msg.execution_results.is_empty());

        let requests = transport.requests();
        assert_eq!(requests[1].0, Endpoint::Approve);
        assert_eq!(requests[1].1["sql"], "SELECT id FROM orders LIMIT 10");
        assert_eq!(requests[1].1["message_id"], message_id.as_str());
    }

    #[tokio::test]
    async fn test_reject_makes_no_request() {
        let (chat, transport, _) = make_chat(vec![Script::Events(frames(&[
            StreamEvent::tool_call(
                "sql_inter",
                nexus_api::ToolCallStatus::PendingApproval,
                Some("DELETE FROM t"),
            ),
            StreamEvent::Done,
        ]))]);
        chat.bind_data_source(Some(DataSourceRef::Connection(1)));

        let handle = chat.submit("clean up").await.unwrap();
        let message_id = handle.message_id().to_string();
        handle.wait().await;

        chat.reject(&message_id).unwrap();
        assert_eq!(transport.requests().len(), 1);
        assert_eq!(current_message(&chat, &message_id).status, MessageStatus::Error);
        assert!(matches!(
            chat.approve(&message_id, None),
            Err(Error::NotPendingApproval { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_marks_interrupted() {
        let (chat, _, _) = make_chat(vec![Script::Hold(frames(&[StreamEvent::text(
            "Working on it",
        )]))]);
        chat.bind_data_source(Some(DataSourceRef::Connection(1)));
        let mut events = chat.subscribe();

        let handle = chat.submit("long question").await.unwrap();
        let message_id = handle.message_id().to_string();

        // wait until the first frame has landed
        loop {
            match events.recv().await.unwrap() {
                ChatEvent::MessageUpdated { message, .. }
                    if message.id == message_id && message.content.contains("Working on it") =>
                {
                    break;
                }
                _ => {}
            }
        }

        assert!(chat.cancel());
        assert_eq!(handle.wait().await, MessageStatus::Error);
        let msg = current_message(&chat, &message_id);
        assert!(msg.content.ends_with(INTERRUPTED_MARKER));
        assert!(msg.content.contains("Working on it"));
        assert!(!chat.is_streaming());
        assert!(!chat.cancel());
    }

    #[tokio::test]
    async fn test_events_after_cancel_never_applied() {
        let (chat, _, _) = make_chat(vec![Script::Unruly(frames(&[
            StreamEvent::text("too late"),
            StreamEvent::Done,
        ]))]);
        chat.bind_data_source(Some(DataSourceRef::Connection(1)));

        let handle = chat.submit("question").await.unwrap();
        let message_id = handle.message_id().to_string();
        chat.cancel();
        handle.wait().await;

        let msg = current_message(&chat, &message_id);
        assert_eq!(msg.status, MessageStatus::Error);
        assert_eq!(msg.content, INTERRUPTED_MARKER);
    }

    #[tokio::test]
    async fn test_new_turn_interrupts_previous() {
        let (chat, _, _) = make_chat(vec![
            Script::Hold(vec![]),
            Script::Events(frames(&[StreamEvent::text("second"), StreamEvent::Done])),
        ]);
        chat.bind_data_source(Some(DataSourceRef::Connection(1)));

        let first = chat.submit("one").await.unwrap();
        let first_id = first.message_id().to_string();
        let second = chat.submit("two").await.unwrap();

        assert_eq!(first.wait().await, MessageStatus::Error);
        assert_eq!(second.wait().await, MessageStatus::Executed);
        assert!(current_message(&chat, &first_id).content.ends_with(INTERRUPTED_MARKER));
    }

    #[tokio::test]
    async fn test_transport_failure_becomes_error() {
        let (chat, _, _) = make_chat(vec![Script::Events(vec![TransportEvent::Failed(
            "Server returned 500: boom".into(),
        )])]);
        chat.bind_data_source(Some(DataSourceRef::Connection(1)));

        let handle = chat.submit("q").await.unwrap();
        let message_id = handle.message_id().to_string();
        assert_eq!(handle.wait().await, MessageStatus::Error);
        let msg = current_message(&chat, &message_id);
        assert!(msg.content.contains("boom"));
    }

    #[tokio::test]
    async fn test_open_error_becomes_error() {
        let (chat, _, _) = make_chat(vec![Script::OpenError]);
        chat.bind_data_source(Some(DataSourceRef::Connection(1)));
        let handle = chat.submit("q").await.unwrap();
        assert_eq!(handle.wait().await, MessageStatus::Error);
    }

    #[tokio::test]
    async fn test_malformed_frame_skipped_and_missing_done_finalized() {
        let mut script = vec![TransportEvent::Frame("{not json".into())];
        script.extend(frames(&[StreamEvent::text("still fine")]));
        let (chat, _, _) = make_chat(vec![Script::Events(script)]);
        chat.bind_data_source(Some(DataSourceRef::Connection(1)));

        let handle = chat.submit("q").await.unwrap();
        let message_id = handle.message_id().to_string();
        assert_eq!(handle.wait().await, MessageStatus::Executed);
        assert!(current_message(&chat, &message_id).content.contains("still fine"));
    }

    #[tokio::test]
    async fn test_summarize_streams_legacy_chunks() {
        let (chat, transport, _) = make_chat(vec![Script::Events(vec![
            TransportEvent::Frame(r#"{"chunk":"The table has "}"#.into()),
            TransportEvent::Frame(r#"{"chunk":"3 columns."}"#.into()),
        ])]);
        assert!(matches!(chat.summarize(), Err(Error::NoDataSource)));

        chat.bind_data_source(Some(DataSourceRef::File(9)));
        let handle = chat.summarize().unwrap();
        let message_id = handle.message_id().to_string();
        assert_eq!(handle.wait().await, MessageStatus::Executed);

        let msg = current_message(&chat, &message_id);
        assert_eq!(msg.content, "The table has 3 columns.");
        let (endpoint, body) = &transport.requests()[0];
        assert_eq!(*endpoint, Endpoint::Summary);
        assert_eq!(body["file_id"], 9);
        assert!(body.get("session_id").is_none());
    }

    #[tokio::test]
    async fn test_select_session_hydrates_once() {
        let (chat, _, service) = make_chat(vec![]);
        service.sessions.lock().push(SessionSummary {
            id: "a".into(),
            title: "Orders".into(),
            updated_at: 10,
            file_id: Some(7),
        });
        service.messages.lock().insert(
            "a".into(),
            vec![
                StoredMessage {
                    id: "1".into(),
                    role: "user".into(),
                    content: "orders by month".into(),
                    timestamp: 1,
                    steps: vec![],
                    viz_config: None,
                },
                StoredMessage {
                    id: "2".into(),
                    role: "model".into(),
                    content: "Here is the query.".into(),
                    timestamp: 2,
                    steps: vec![StoredStep {
                        tool: "sql_inter".into(),
                        status: "pending_approval".into(),
                        input: Some("SELECT 1".into()),
                        output: None,
                    }],
                    viz_config: None,
                },
            ],
        );

        chat.refresh_sessions().await.unwrap();
        chat.select_session("a").await.unwrap();
        chat.select_session(DRAFT_SESSION_ID).await.unwrap();
        assert!(chat.snapshot().data_source.is_none());
        chat.select_session("a").await.unwrap();

        assert_eq!(*service.fetches.lock(), 1);
        let snapshot = chat.snapshot();
        assert_eq!(snapshot.data_source, Some(DataSourceRef::File(7)));
        assert_eq!(snapshot.current.messages.len(), 2);
        let paused = &snapshot.current.messages[1];
        assert_eq!(paused.status, MessageStatus::PendingApproval);
        assert_eq!(paused.sql_query.as_deref(), Some("SELECT 1"));
    }

    #[tokio::test]
    async fn test_history_fetch_keeps_turn_started_meanwhile() {
        let (chat, _, service) = make_chat(vec![Script::Events(frames(&[
            StreamEvent::text("North leads."),
            StreamEvent::Done,
        ]))]);
        service.sessions.lock().push(SessionSummary {
            id: "a".into(),
            title: "Orders".into(),
            updated_at: 10,
            file_id: Some(7),
        });
        service.messages.lock().insert(
            "a".into(),
            vec![
                StoredMessage {
                    id: "1".into(),
                    role: "user".into(),
                    content: "orders by month".into(),
                    timestamp: 1,
                    steps: vec![],
                    viz_config: None,
                },
                StoredMessage {
                    id: "2".into(),
                    role: "model".into(),
                    content: "March peaked.".into(),
                    timestamp: 2,
                    steps: vec![],
                    viz_config: None,
                },
            ],
        );
        let gate = Arc::new(Notify::new());
        *service.fetch_gate.lock() = Some(gate.clone());
        chat.refresh_sessions().await.unwrap();

        let selecting = tokio::spawn({
            let chat = chat.clone();
            async move { chat.select_session("a").await }
        });
        while chat.snapshot().current.id != "a" {
            tokio::task::yield_now().await;
        }

        let handle = chat.submit("and by region?").await.unwrap();
        let message_id = handle.message_id().to_string();
        gate.notify_one();
        selecting.await.unwrap().unwrap();
        assert_eq!(handle.wait().await, MessageStatus::Executed);

        let messages = chat.snapshot().current.messages;
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].content, "orders by month");
        assert_eq!(messages[2].content, "and by region?");
        assert_eq!(messages[3].id, message_id);
        assert_eq!(messages[3].content, "**Analysis**\n\nNorth leads.");
    }

    #[tokio::test]
    async fn test_select_unknown_session_fails() {
        let (chat, _, _) = make_chat(vec![]);
        assert!(matches!(
            chat.select_session("nope").await,
            Err(Error::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_current_session_returns_to_draft() {
        let (chat, _, service) = make_chat(vec![]);
        chat.bind_data_source(Some(DataSourceRef::File(1)));
        chat.submit("hello").await.unwrap().wait().await;
        assert_eq!(chat.snapshot().current.id, "s1");

        chat.delete_session("s1").await.unwrap();
        assert_eq!(*service.deleted.lock(), vec!["s1".to_string()]);
        let snapshot = chat.snapshot();
        assert_eq!(snapshot.current.id, DRAFT_SESSION_ID);
        assert!(snapshot.sessions.is_empty());
        assert!(chat.delete_session(DRAFT_SESSION_ID).await.is_err());
    }

    #[tokio::test]
    async fn test_events_broadcast_in_order() {
        let (chat, _, _) = make_chat(vec![Script::Events(frames(&[
            StreamEvent::text("a"),
            StreamEvent::Done,
        ]))]);
        chat.bind_data_source(Some(DataSourceRef::Connection(1)));
        let mut events = chat.subscribe();

        chat.submit("q").await.unwrap().wait().await;

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(matches!(
            seen.first(),
            Some(ChatEvent::MessageUpdated { message, .. }) if message.is_user()
        ));
        assert!(seen.iter().any(|e| matches!(e, ChatEvent::TurnStarted { .. })));
        assert!(matches!(
            seen.last(),
            Some(ChatEvent::TurnFinished {
                status: MessageStatus::Executed,
                ..
            })
        ));
    }
}
