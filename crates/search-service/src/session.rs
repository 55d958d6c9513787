use std::sync::Arc;

use challenge_tree::tree::TreeData;
use challenge_tree::Tree;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::info;

use crate::config::Settings;
use crate::models::Session;
use crate::SearchError;

/// In-memory store of search sessions, each owning one tree.
pub struct SessionService {
    settings: Arc<Settings>,
    sessions: DashMap<String, Session>,
}

impl SessionService {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            sessions: DashMap::new(),
        }
    }

    /// Create a session with a freshly initialized tree. Fails when the id
    /// is already taken.
    pub fn create_session(&self, session_id: &str) -> Result<Session, SearchError> {
        match self.sessions.entry(session_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(SearchError::SessionAlreadyExists(session_id.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let mut tree = Tree::new(
                    self.settings.tree_config.concepts.clone(),
                    self.settings.tree_config.difficulties.clone(),
                )
                .map_err(|err| SearchError::TreeInitialization(err.to_string()))?;
                tree.initialize()
                    .map_err(|err| SearchError::TreeInitialization(err.to_string()))?;

                let session =
                    Session::new(session_id.to_string(), Arc::new(RwLock::new(tree)));
                info!(
                    session = session_id,
                    tree_size = session.tree.read().len(),
                    "created session"
                );
                entry.insert(session.clone());
                Ok(session)
            }
        }
    }

    pub fn get_session(&self, session_id: &str) -> Result<Session, SearchError> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| SearchError::SessionNotFound(session_id.to_string()))
    }

    pub fn get_or_create_session(&self, session_id: &str) -> Result<Session, SearchError> {
        match self.get_session(session_id) {
            Ok(session) => Ok(session),
            Err(SearchError::SessionNotFound(_)) => match self.create_session(session_id) {
                Ok(session) => Ok(session),
                // lost a creation race: somebody else made it first
                Err(SearchError::SessionAlreadyExists(_)) => self.get_session(session_id),
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        }
    }

    pub fn delete_session(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    pub fn list_sessions(&self) -> Vec<Session> {
        self.sessions.iter().map(|entry| entry.clone()).collect()
    }

    /// Serialize a session's tree for API responses.
    pub fn session_tree_data(&self, session_id: &str) -> Result<TreeData, SearchError> {
        let session = self.get_session(session_id)?;
        let data = session.tree.read().to_data();
        Ok(data)
    }

    pub fn touch(&self, session_id: &str) {
        if let Some(mut entry) = self.sessions.get_mut(session_id) {
            entry.touch();
        }
    }
}
