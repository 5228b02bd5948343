//! JSON-file state provider rooted at `.tether/state/`.
//!
//! ```text
//! .tether/state/
//! ├── tasks.json          {revision, next_id, tasks}
//! ├── meta.json           {revision, meta}
//! ├── sessions/<id>.json  one document per session
//! ├── active_session      id of the session currently open
//! └── .lock               advisory lock file
//! ```
//!
//! Reads take a shared lock. A write re-reads the document under an exclusive
//! lock and refuses to replace it if its `revision` moved since the caller's
//! view was read. Documents are replaced atomically via temp file + rename.

use async_trait::async_trait;
use chrono::Utc;
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{Session, SessionId, StateProvider};
use crate::errors::{StateError, StateResult};
use crate::meta::{Meta, MetaPatch, SessionComment};
use crate::task::{Task, TaskFilter, TaskId, TaskPatch, TaskPayload, apply_patch};

const TASKS_FILE: &str = "tasks.json";
const META_FILE: &str = "meta.json";
const SESSIONS_DIR: &str = "sessions";
const ACTIVE_FILE: &str = "active_session";
const LOCK_FILE: &str = ".lock";

trait Revisioned: Serialize + DeserializeOwned + Default {
    fn revision(&self) -> u64;
    fn set_revision(&mut self, revision: u64);
}

#[derive(Debug, Serialize, Deserialize)]
struct TasksDoc {
    #[serde(default)]
    revision: u64,
    #[serde(default = "first_id")]
    next_id: u64,
    #[serde(default)]
    tasks: Vec<Task>,
}

fn first_id() -> u64 {
    1
}

impl Default for TasksDoc {
    fn default() -> Self {
        Self {
            revision: 0,
            next_id: first_id(),
            tasks: Vec::new(),
        }
    }
}

impl Revisioned for TasksDoc {
    fn revision(&self) -> u64 {
        self.revision
    }
    fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MetaDoc {
    #[serde(default)]
    revision: u64,
    #[serde(default)]
    meta: Option<Meta>,
}

impl Revisioned for MetaDoc {
    fn revision(&self) -> u64 {
        self.revision
    }
    fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }
}

/// Held advisory lock on `.lock`; released on drop.
struct StateLock {
    file: File,
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

pub struct FileProvider {
    root: PathBuf,
    session: Mutex<Option<Session>>,
}

impl FileProvider {
    pub fn new(root: &Path) -> StateResult<Self> {
        let sessions = root.join(SESSIONS_DIR);
        fs::create_dir_all(&sessions).map_err(|e| StateError::io(&sessions, e))?;
        Ok(Self {
            root: root.to_path_buf(),
            session: Mutex::new(None),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Replace the whole store with a copy taken from another provider.
    pub fn import_snapshot(
        &self,
        tasks: Vec<Task>,
        meta: Option<Meta>,
        sessions: Vec<Session>,
    ) -> StateResult<()> {
        let _lock = self.lock(true)?;

        let current: TasksDoc = self.read_unlocked(TASKS_FILE)?;
        let highest = tasks
            .iter()
            .filter_map(|t| t.id.strip_prefix("T-")?.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        let doc = TasksDoc {
            revision: current.revision + 1,
            next_id: current.next_id.max(highest + 1),
            tasks,
        };
        self.write_unlocked(TASKS_FILE, &doc)?;

        let current: MetaDoc = self.read_unlocked(META_FILE)?;
        let doc = MetaDoc {
            revision: current.revision + 1,
            meta,
        };
        self.write_unlocked(META_FILE, &doc)?;

        for session in &sessions {
            self.write_session(session)?;
        }
        tracing::debug!(root = %self.root.display(), "snapshot imported");
        Ok(())
    }

    /// Id written to `active_session` by the last process that started a session.
    pub fn recorded_active_session(&self) -> StateResult<Option<SessionId>> {
        let path = self.root.join(ACTIVE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let id = fs::read_to_string(&path).map_err(|e| StateError::io(&path, e))?;
        let id = id.trim();
        Ok((!id.is_empty()).then(|| id.to_string()))
    }

    fn lock(&self, exclusive: bool) -> StateResult<StateLock> {
        let path = self.root.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StateError::io(&path, e))?;
        let locked = if exclusive {
            FileExt::lock_exclusive(&file)
        } else {
            FileExt::lock_shared(&file)
        };
        locked.map_err(|e| StateError::io(&path, e))?;
        Ok(StateLock { file })
    }

    fn read_unlocked<T: DeserializeOwned + Default>(&self, name: &str) -> StateResult<T> {
        let path = self.root.join(name);
        if !path.exists() {
            return Ok(T::default());
        }
        let content = fs::read_to_string(&path).map_err(|e| StateError::io(&path, e))?;
        serde_json::from_str(&content).map_err(|e| StateError::serde(name, e))
    }

    fn write_unlocked<T: Serialize>(&self, name: &str, doc: &T) -> StateResult<()> {
        let path = self.root.join(name);
        let tmp = self.root.join(format!("{}.tmp", name));
        let json = serde_json::to_string_pretty(doc).map_err(|e| StateError::serde(name, e))?;
        fs::write(&tmp, json).map_err(|e| StateError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| StateError::io(&path, e))
    }

    fn read_doc<T: Revisioned>(&self, name: &str) -> StateResult<T> {
        let _lock = self.lock(false)?;
        self.read_unlocked(name)
    }

    /// Write `doc` if the stored revision still equals `seen`.
    fn commit<T: Revisioned>(&self, name: &str, mut doc: T, seen: u64) -> StateResult<()> {
        let _lock = self.lock(true)?;
        let current: T = self.read_unlocked(name)?;
        if current.revision() != seen {
            return Err(StateError::ConcurrentModification {
                resource: name.to_string(),
                expected: seen.to_string(),
                found: current.revision().to_string(),
            });
        }
        doc.set_revision(seen + 1);
        self.write_unlocked(name, &doc)
    }

    /// Read-modify-write one document under optimistic concurrency.
    fn mutate<T, R, F>(&self, name: &str, f: F) -> StateResult<R>
    where
        T: Revisioned,
        F: FnOnce(&mut T) -> StateResult<R>,
    {
        let mut doc: T = self.read_doc(name)?;
        let seen = doc.revision();
        let result = f(&mut doc)?;
        self.commit(name, doc, seen)?;
        Ok(result)
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.root.join(SESSIONS_DIR).join(format!("{}.json", id))
    }

    fn write_session(&self, session: &Session) -> StateResult<()> {
        self.write_unlocked(&format!("{}/{}.json", SESSIONS_DIR, session.session_id), session)
    }

    fn read_session(&self, id: &str) -> StateResult<Option<Session>> {
        let path = self.session_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).map_err(|e| StateError::io(&path, e))?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StateError::serde(path.display().to_string(), e))
    }

    fn current_session(&self) -> Option<Session> {
        self.session.lock().ok().and_then(|s| s.clone())
    }

    fn set_session(&self, session: Option<Session>) {
        if let Ok(mut guard) = self.session.lock() {
            *guard = session;
        }
    }

    fn record_completion(&self) -> StateResult<()> {
        if let Some(mut session) = self.current_session() {
            session.tasks_completed += 1;
            self.write_session(&session)?;
            self.set_session(Some(session));
        }
        Ok(())
    }

    fn close_session(&self, mut session: Session, summary: &str) -> StateResult<()> {
        session.ended_at = Some(Utc::now());
        session.summary = summary.to_string();
        self.write_session(&session)?;
        if self.recorded_active_session()?.as_deref() == Some(session.session_id.as_str()) {
            let path = self.root.join(ACTIVE_FILE);
            fs::remove_file(&path).map_err(|e| StateError::io(&path, e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateProvider for FileProvider {
    fn kind(&self) -> &'static str {
        "file"
    }

    async fn create_task(&self, payload: TaskPayload) -> StateResult<TaskId> {
        crate::task::validate_payload(&payload)?;
        let id = self.mutate(TASKS_FILE, |doc: &mut TasksDoc| {
            let unknown: Vec<String> = payload
                .dependencies
                .iter()
                .filter(|d| !doc.tasks.iter().any(|t| &t.id == *d))
                .map(|d| format!("unknown dependency '{}'", d))
                .collect();
            if !unknown.is_empty() {
                return Err(StateError::Validation(unknown));
            }
            let id = format!("T-{}", doc.next_id);
            doc.next_id += 1;
            doc.tasks.push(Task::from_payload(id.clone(), &payload, Utc::now())?);
            Ok(id)
        })?;
        tracing::debug!(task = %id, "task created");
        Ok(id)
    }

    async fn get_task(&self, id: &str) -> StateResult<Option<Task>> {
        let doc: TasksDoc = self.read_doc(TASKS_FILE)?;
        Ok(doc.tasks.into_iter().find(|t| t.id == id))
    }

    async fn update_task(&self, id: &str, patch: TaskPatch) -> StateResult<()> {
        let became_done = self.mutate(TASKS_FILE, |doc: &mut TasksDoc| {
            let statuses: HashMap<String, _> = doc
                .tasks
                .iter()
                .map(|t| (t.id.clone(), t.status))
                .collect();
            let task = doc
                .tasks
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| StateError::NotFound {
                    kind: "task",
                    id: id.to_string(),
                })?;
            apply_patch(task, &patch, |dep| statuses.get(dep).copied(), Utc::now())
        })?;
        if became_done {
            self.record_completion()?;
        }
        Ok(())
    }

    async fn delete_task(&self, id: &str) -> StateResult<()> {
        self.mutate(TASKS_FILE, |doc: &mut TasksDoc| {
            let before = doc.tasks.len();
            doc.tasks.retain(|t| t.id != id);
            if doc.tasks.len() == before {
                return Err(StateError::NotFound {
                    kind: "task",
                    id: id.to_string(),
                });
            }
            Ok(())
        })
    }

    async fn get_tasks(&self, filter: &TaskFilter) -> StateResult<Vec<Task>> {
        let doc: TasksDoc = self.read_doc(TASKS_FILE)?;
        Ok(doc.tasks.into_iter().filter(|t| filter.matches(t)).collect())
    }

    async fn get_meta(&self) -> StateResult<Option<Meta>> {
        let doc: MetaDoc = self.read_doc(META_FILE)?;
        Ok(doc.meta)
    }

    async fn update_meta(&self, patch: MetaPatch) -> StateResult<()> {
        self.mutate(META_FILE, |doc: &mut MetaDoc| {
            doc.meta
                .get_or_insert_with(Meta::default)
                .apply(&patch, Utc::now());
            Ok(())
        })
    }

    async fn start_session(&self) -> StateResult<SessionId> {
        if let Some(previous) = self.current_session() {
            tracing::warn!(session = %previous.session_id, "closing session left open by this process");
            self.close_session(previous, "replaced by a new session")?;
        }
        let session = Session::begin(Utc::now());
        self.write_session(&session)?;
        let active = self.root.join(ACTIVE_FILE);
        fs::write(&active, &session.session_id).map_err(|e| StateError::io(&active, e))?;
        let id = session.session_id.clone();
        self.set_session(Some(session));
        Ok(id)
    }

    async fn end_session(&self, summary: &str) -> StateResult<()> {
        let session = self.current_session().ok_or(StateError::NoActiveSession)?;
        self.close_session(session, summary)?;
        self.set_session(None);
        Ok(())
    }

    async fn add_session_comment(&self, text: &str) -> StateResult<()> {
        self.mutate(META_FILE, |doc: &mut MetaDoc| {
            let meta = doc.meta.as_mut().ok_or_else(|| StateError::NotFound {
                kind: "meta",
                id: META_FILE.to_string(),
            })?;
            meta.session_history.push(SessionComment {
                body: text.to_string(),
                created_at: Utc::now(),
            });
            Ok(())
        })
    }

    async fn active_session(&self) -> StateResult<Option<Session>> {
        Ok(self.current_session())
    }

    async fn list_sessions(&self) -> StateResult<Vec<Session>> {
        let dir = self.root.join(SESSIONS_DIR);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut sessions = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| StateError::io(&dir, e))? {
            let path = entry.map_err(|e| StateError::io(&dir, e))?.path();
            if path.extension().is_some_and(|e| e == "json") {
                let content = fs::read_to_string(&path).map_err(|e| StateError::io(&path, e))?;
                let session: Session = serde_json::from_str(&content)
                    .map_err(|e| StateError::serde(path.display().to_string(), e))?;
                sessions.push(session);
            }
        }
        sessions.sort_by_key(|s| s.started_at);
        Ok(sessions)
    }

    async fn abandon_session(&self, session_id: &str, summary: &str) -> StateResult<()> {
        match self.read_session(session_id)? {
            Some(session) if session.is_active() => self.close_session(session, summary)?,
            Some(_) => {}
            None => {
                return Err(StateError::NotFound {
                    kind: "session",
                    id: session_id.to_string(),
                });
            }
        }
        self.add_session_comment(&format!("Session {} abandoned: {}", session_id, summary))
            .await
    }
}
