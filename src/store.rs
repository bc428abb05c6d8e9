use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::Builder;
use tracing::debug;

use crate::error::UploadError;
use crate::session::UploadSession;

#[derive(Debug, Clone)]
pub struct SessionStore {
    root: Utf8PathBuf,
}

impl SessionStore {
    pub fn new() -> Result<Self, UploadError> {
        let cwd =
            std::env::current_dir().map_err(|err| UploadError::Filesystem(err.to_string()))?;
        let root = Utf8PathBuf::from_path_buf(cwd.join(".sample-upload"))
            .map_err(|_| UploadError::Filesystem("invalid working directory path".to_string()))?;
        Ok(Self { root })
    }

    pub fn new_with_root(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn sessions_dir(&self) -> Utf8PathBuf {
        self.root.join("sessions")
    }

    pub fn session_path(&self, batch_id: &str) -> Utf8PathBuf {
        self.sessions_dir().join(format!("{batch_id}.json"))
    }

    pub fn save(&self, session: &UploadSession) -> Result<(), UploadError> {
        let content = serde_json::to_vec_pretty(session)
            .map_err(|err| UploadError::Filesystem(err.to_string()))?;
        let path = self.session_path(&session.batch_id);
        write_atomic(&path, &content)?;
        debug!(batch = %session.batch_id, path = %path, "session saved");
        Ok(())
    }

    pub fn load(&self, batch_id: &str) -> Result<UploadSession, UploadError> {
        let path = self.session_path(batch_id);
        if !path.as_std_path().exists() {
            return Err(UploadError::SessionNotFound(batch_id.to_string()));
        }
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| UploadError::Filesystem(format!("read {path}: {err}")))?;
        serde_json::from_str(&content)
            .map_err(|err| UploadError::Filesystem(format!("parse {path}: {err}")))
    }

    pub fn list(&self) -> Result<Vec<UploadSession>, UploadError> {
        let dir = self.sessions_dir();
        if !dir.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let entries =
            fs::read_dir(dir.as_std_path()).map_err(|err| UploadError::Filesystem(err.to_string()))?;
        let mut sessions = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|err| UploadError::Filesystem(err.to_string()))?
                .path();
            if path.extension().map(|ext| ext == "json").unwrap_or(false) {
                let parsed = fs::read_to_string(&path)
                    .ok()
                    .and_then(|content| serde_json::from_str::<UploadSession>(&content).ok());
                match parsed {
                    Some(session) => sessions.push(session),
                    None => debug!(path = %path.display(), "skipping unreadable session file"),
                }
            }
        }
        sessions.sort_by_key(|session| session.created_at);
        Ok(sessions)
    }
}

fn write_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), UploadError> {
    let parent = path
        .parent()
        .ok_or_else(|| UploadError::Filesystem(format!("invalid session path {path}")))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| UploadError::Filesystem(err.to_string()))?;
    let mut temp = Builder::new()
        .prefix("session")
        .suffix(".tmp")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| UploadError::Filesystem(err.to_string()))?;
    std::io::Write::write_all(&mut temp, content)
        .map_err(|err| UploadError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| UploadError::Filesystem(err.to_string()))?;
    Ok(())
}
