//! Session store: the draft plus the persisted sessions

use std::collections::HashSet;

use nexus_api::{DataSourceRef, SessionSummary};

use crate::{
    error::{Error, Result},
    message::{Message, Session},
    util::now_millis,
};

/// Fixed id of the unpersisted draft session
pub const DRAFT_SESSION_ID: &str = "draft";

const DRAFT_TITLE: &str = "New analysis";

/// Listing entry for a session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub id: String,
    pub title: String,
    pub updated_at: i64,
    pub data_source: Option<DataSourceRef>,
    /// Whether the session's messages have been fetched
    pub loaded: bool,
}

/// All sessions known to the client and which one is current
#[derive(Debug)]
pub struct SessionStore {
    draft: Session,
    /// Persisted sessions, most recently updated first
    sessions: Vec<Session>,
    current: String,
    loaded: HashSet<String>,
    data_source: Option<DataSourceRef>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            draft: Session::new(DRAFT_SESSION_ID, DRAFT_TITLE),
            sessions: Vec::new(),
            current: DRAFT_SESSION_ID.to_string(),
            loaded: HashSet::new(),
            data_source: None,
        }
    }

    pub fn current_id(&self) -> &str {
        &self.current
    }

    pub fn is_draft_current(&self) -> bool {
        self.current == DRAFT_SESSION_ID
    }

    pub fn current(&self) -> &Session {
        if self.is_draft_current() {
            return &self.draft;
        }
        self.sessions
            .iter()
            .find(|s| s.id == self.current)
            .unwrap_or(&self.draft)
    }

    pub fn session(&self, id: &str) -> Option<&Session> {
        if id == DRAFT_SESSION_ID {
            return Some(&self.draft);
        }
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn session_mut(&mut self, id: &str) -> Option<&mut Session> {
        if id == DRAFT_SESSION_ID {
            return Some(&mut self.draft);
        }
        self.sessions.iter_mut().find(|s| s.id == id)
    }

    pub fn message_mut(&mut self, session_id: &str, message_id: &str) -> Option<&mut Message> {
        self.session_mut(session_id)?.message_mut(message_id)
    }

    /// Data source the next request runs against
    pub fn data_source(&self) -> Option<DataSourceRef> {
        self.data_source
    }

    /// Bind a data source to the current session
    pub fn bind_data_source(&mut self, source: Option<DataSourceRef>) {
        self.data_source = source;
        let current = self.current.clone();
        if let Some(session) = self.session_mut(&current) {
            session.data_source = source;
        }
    }

    /// Make `id` current. Returns true if its messages still need fetching.
    pub fn select(&mut self, id: &str) -> Result<bool> {
        if id == DRAFT_SESSION_ID {
            self.select_draft();
            return Ok(false);
        }
        let session = self
            .sessions
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        self.data_source = session.data_source;
        self.current = id.to_string();
        Ok(!self.loaded.contains(id))
    }

    /// Switch to the draft, dropping any data-source binding
    pub fn select_draft(&mut self) {
        self.current = DRAFT_SESSION_ID.to_string();
        self.data_source = None;
        self.draft.data_source = None;
    }

    /// Empty the draft and switch to it
    pub fn reset_draft(&mut self) {
        self.draft = Session::new(DRAFT_SESSION_ID, DRAFT_TITLE);
        self.select_draft();
    }

    pub fn is_loaded(&self, id: &str) -> bool {
        id == DRAFT_SESSION_ID || self.loaded.contains(id)
    }

    /// Install fetched messages for a session.
    ///
    /// Messages added while the fetch was in flight stay after the history.
    pub fn install_messages(&mut self, id: &str, messages: Vec<Message>) -> Result<()> {
        let session = self
            .sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        let added = std::mem::replace(&mut session.messages, messages);
        for msg in added {
            if session.message(&msg.id).is_none() {
                session.messages.push(msg);
            }
        }
        self.loaded.insert(id.to_string());
        Ok(())
    }

    /// Merge a fresh listing from the session service.
    ///
    /// Loaded message lists survive; sessions that disappeared are dropped
    /// unless they are current.
    pub fn replace_sessions(&mut self, listing: Vec<SessionSummary>) {
        let mut previous = std::mem::take(&mut self.sessions);
        let mut merged = Vec::with_capacity(listing.len());

        for summary in listing {
            let data_source = summary.file_id.map(DataSourceRef::File);
            match previous.iter().position(|s| s.id == summary.id) {
                Some(i) => {
                    let mut session = previous.swap_remove(i);
                    session.title = summary.title;
                    session.updated_at = summary.updated_at.max(session.updated_at);
                    if data_source.is_some() {
                        session.data_source = data_source;
                    }
                    merged.push(session);
                }
                None => {
                    let mut session = Session::new(summary.id, summary.title);
                    session.updated_at = summary.updated_at;
                    session.data_source = data_source;
                    merged.push(session);
                }
            }
        }

        if let Some(current) = previous.into_iter().find(|s| s.id == self.current) {
            merged.push(current);
        }
        let ids: HashSet<&str> = merged.iter().map(|s| s.id.as_str()).collect();
        self.loaded.retain(|id| ids.contains(id.as_str()));

        merged.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        self.sessions = merged;
        if !self.is_draft_current() && self.session(&self.current).is_none() {
            self.select_draft();
        }
    }

    /// Turn the draft into a persisted session, keeping its messages.
    pub fn promote_draft(&mut self, summary: SessionSummary, source: Option<DataSourceRef>) {
        let mut session = Session::new(summary.id, summary.title);
        session.updated_at = now_millis();
        session.data_source = source;
        session.messages = std::mem::take(&mut self.draft.messages);

        self.loaded.insert(session.id.clone());
        self.current = session.id.clone();
        self.data_source = source;
        self.sessions.insert(0, session);
        self.draft = Session::new(DRAFT_SESSION_ID, DRAFT_TITLE);
        tracing::debug!("Promoted draft to session {}", self.current);
    }

    /// Drop a persisted session
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.sessions.len();
        self.sessions.retain(|s| s.id != id);
        self.loaded.remove(id);
        if self.current == id {
            self.select_draft();
        }
        self.sessions.len() != before
    }

    /// Bump a session to the top of the list
    pub fn touch(&mut self, id: &str) {
        if let Some(session) = self.session_mut(id) {
            session.updated_at = now_millis();
        }
        self.sessions
            .sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|s| SessionInfo {
                id: s.id.clone(),
                title: s.title.clone(),
                updated_at: s.updated_at,
                data_source: s.data_source,
                loaded: self.loaded.contains(&s.id),
            })
            .collect()
    }
}
