use crate::common::{DevMode, GateError, Result};
use crate::core::matcher::{is_valid_embedding, EnrolledUser, Embedding, EMBEDDING_DIM};
use crate::storage::UserRecordProvider;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

const STORAGE_VERSION: u32 = 1;
const USERS_FILE: &str = "users.bincode";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UserData {
    pub user_id: String,
    pub embedding: Embedding,
    pub enrolled_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct UserDatabase {
    version: u32,
    /// Enrollment order; matching ties favour earlier entries.
    users: Vec<UserData>,
}

/// Enrolled users, kept in one versioned bincode file.
pub struct UserStore {
    data_dir: PathBuf,
}

impl UserStore {
    pub fn new_with_paths(data_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&data_dir)?;
        Ok(Self { data_dir })
    }

    pub fn new_with_dev_mode(dev_mode: &DevMode) -> Result<Self> {
        let data_dir = dev_mode.data_dir();
        if dev_mode.is_enabled() {
            tracing::debug!("UserStore using dev directories: {:?}", data_dir);
        }
        Self::new_with_paths(data_dir)
    }

    fn users_file(&self) -> PathBuf {
        self.data_dir.join(USERS_FILE)
    }

    fn load(&self) -> Result<UserDatabase> {
        let path = self.users_file();
        if !path.exists() {
            return Ok(UserDatabase { version: STORAGE_VERSION, users: Vec::new() });
        }

        let data = fs::read(&path)?;
        let mut db: UserDatabase = bincode::deserialize(&data)
            .map_err(|e| GateError::Storage(format!("Failed to deserialize: {}", e)))?;

        if db.version < STORAGE_VERSION {
            db.version = STORAGE_VERSION;
        }
        Ok(db)
    }

    fn save(&self, db: &UserDatabase) -> Result<()> {
        let encoded = bincode::serialize(db)
            .map_err(|e| GateError::Storage(format!("Failed to serialize: {}", e)))?;

        // Write then rename so a crash never leaves a truncated user file.
        let tmp = self.data_dir.join(format!("{}.tmp", USERS_FILE));
        fs::write(&tmp, encoded)?;
        fs::rename(&tmp, self.users_file())?;
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<UserData>> {
        Ok(self.load()?.users)
    }

    /// Adds a user, or replaces the embedding of an existing one in place.
    pub fn add_user(&self, user_id: &str, embedding: Embedding) -> Result<()> {
        if user_id.trim().is_empty() {
            return Err(GateError::Storage("User id must not be empty".into()));
        }
        if !is_valid_embedding(&embedding) {
            return Err(GateError::Storage(format!(
                "Embedding must have {} finite values, got {}",
                EMBEDDING_DIM,
                embedding.len()
            )));
        }

        let mut db = self.load()?;
        let record = UserData {
            user_id: user_id.to_string(),
            embedding,
            enrolled_at: Utc::now(),
        };
        match db.users.iter_mut().find(|u| u.user_id == user_id) {
            Some(existing) => *existing = record,
            None => db.users.push(record),
        }
        self.save(&db)?;

        tracing::info!("Stored embedding for user {}", user_id);
        Ok(())
    }

    pub fn remove_user(&self, user_id: &str) -> Result<()> {
        let mut db = self.load()?;
        let before = db.users.len();
        db.users.retain(|u| u.user_id != user_id);
        if db.users.len() == before {
            return Err(GateError::UserNotFound(user_id.to_string()));
        }
        self.save(&db)
    }
}

impl UserRecordProvider for UserStore {
    fn list_users(&self) -> Result<Vec<EnrolledUser>> {
        Ok(self
            .list()?
            .into_iter()
            .map(|u| EnrolledUser::new(u.user_id, u.embedding))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedding(seed: f32) -> Embedding {
        (0..EMBEDDING_DIM).map(|i| seed + i as f32 * 0.001).collect()
    }

    #[test]
    fn test_empty_store_lists_nobody() {
        let dir = tempfile::tempdir().unwrap();
        let store = UserStore::new_with_paths(dir.path().to_path_buf()).unwrap();
        assert!(store.list_users().unwrap().is_empty());
    }

    #[test]
    fn test_users_keep_enrollment_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = UserStore::new_with_paths(dir.path().to_path_buf()).unwrap();
        store.add_user("carol", embedding(0.3)).unwrap();
        store.add_user("alice", embedding(0.1)).unwrap();
        store.add_user("bob", embedding(0.2)).unwrap();

        // Re-enrolling keeps the original position.
        store.add_user("carol", embedding(0.9)).unwrap();

        let users = store.list_users().unwrap();
        let ids: Vec<_> = users.iter().map(|u| u.user_id.as_str()).collect();
        assert_eq!(ids, vec!["carol", "alice", "bob"]);
        assert_eq!(users[0].embedding, embedding(0.9));
    }

    #[test]
    fn test_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        UserStore::new_with_paths(dir.path().to_path_buf())
            .unwrap()
            .add_user("alice", embedding(0.1))
            .unwrap();

        let reopened = UserStore::new_with_paths(dir.path().to_path_buf()).unwrap();
        assert_eq!(reopened.list_users().unwrap().len(), 1);
    }

    #[test]
    fn test_rejects_bad_embeddings() {
        let dir = tempfile::tempdir().unwrap();
        let store = UserStore::new_with_paths(dir.path().to_path_buf()).unwrap();
        assert!(store.add_user("alice", vec![0.0; 64]).is_err());
        assert!(store.add_user("", embedding(0.1)).is_err());
        let mut nan = embedding(0.1);
        nan[0] = f32::NAN;
        assert!(store.add_user("alice", nan).is_err());
    }

    #[test]
    fn test_remove_user() {
        let dir = tempfile::tempdir().unwrap();
        let store = UserStore::new_with_paths(dir.path().to_path_buf()).unwrap();
        store.add_user("alice", embedding(0.1)).unwrap();

        store.remove_user("alice").unwrap();
        assert!(store.list_users().unwrap().is_empty());
        assert!(matches!(store.remove_user("alice"), Err(GateError::UserNotFound(_))));
    }
}
