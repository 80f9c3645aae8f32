use crate::common::{FaceAuthError, Paths, Result};
use crate::storage::{AuditEntry, FaceArtifact, FaceArtifactKind, UserRecord, UserStore};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const STORAGE_VERSION: u32 = 2;
const DATABASE_FILE: &str = "users.bincode";
const AUDIT_LOG_FILE: &str = "auth.log";
const ARTIFACT_LOG_FILE: &str = "face_artifacts.log";

/// Account rows only. Audit and artifact history are append-only JSON lines
/// under `logs/` so the snapshot stays the same size as logins accumulate.
#[derive(Debug, Serialize, Deserialize)]
struct UserDatabase {
    version: u32,
    next_id: i32,
    users: Vec<UserRecord>,
}

impl Default for UserDatabase {
    fn default() -> Self {
        Self {
            version: STORAGE_VERSION,
            next_id: 1,
            users: Vec::new(),
        }
    }
}

/// Version 1 kept audit entries and artifact records inside the snapshot.
#[derive(Debug, Deserialize)]
struct UserDatabaseV1 {
    #[allow(dead_code)]
    version: u32,
    next_id: i32,
    users: Vec<UserRecord>,
    #[allow(dead_code)]
    audit_log: Vec<AuditEntry>,
    face_artifacts: Vec<FaceArtifact>,
}

impl UserDatabase {
    fn user(&self, user_id: i32) -> Result<&UserRecord> {
        self.users
            .iter()
            .find(|u| u.id == user_id)
            .ok_or_else(|| FaceAuthError::UserNotFound(format!("id {}", user_id)))
    }

    fn user_mut(&mut self, user_id: i32) -> Result<&mut UserRecord> {
        self.users
            .iter_mut()
            .find(|u| u.id == user_id)
            .ok_or_else(|| FaceAuthError::UserNotFound(format!("id {}", user_id)))
    }
}

fn deserialize<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    bincode::deserialize(data)
        .map_err(|e| FaceAuthError::Storage(format!("Failed to deserialize user database: {}", e)))
}

fn append_json_line<T: Serialize>(path: &Path, entry: &T) -> Result<()> {
    let line = serde_json::to_string(entry)
        .map_err(|e| FaceAuthError::Storage(format!("Failed to encode log entry: {}", e)))?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)?;
    Ok(())
}

fn read_json_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut entries = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => tracing::warn!("Skipping malformed line {} of {}: {}", n + 1, path.display(), e),
        }
    }
    Ok(entries)
}

/// User store backed by a bincode file under `users/`, append-only JSON
/// lines logs under `logs/` and face images under `faces/`.
pub struct FileUserStore {
    db_path: PathBuf,
    audit_path: PathBuf,
    artifact_log_path: PathBuf,
    faces_dir: PathBuf,
    retain_login_images: bool,
    db: Mutex<UserDatabase>,
}

impl FileUserStore {
    pub fn open(paths: &Paths, retain_login_images: bool) -> Result<Self> {
        fs::create_dir_all(paths.users_dir())?;
        fs::create_dir_all(paths.logs_dir())?;
        fs::create_dir_all(paths.faces_dir())?;

        let mut store = Self {
            db_path: paths.users_dir().join(DATABASE_FILE),
            audit_path: paths.logs_dir().join(AUDIT_LOG_FILE),
            artifact_log_path: paths.logs_dir().join(ARTIFACT_LOG_FILE),
            faces_dir: paths.faces_dir(),
            retain_login_images,
            db: Mutex::new(UserDatabase::default()),
        };

        if store.db_path.exists() {
            let db = store.load()?;
            tracing::info!("Loaded {} user(s) from {}", db.users.len(), store.db_path.display());
            store.db = Mutex::new(db);
        }
        Ok(store)
    }

    fn load(&self) -> Result<UserDatabase> {
        let data = fs::read(&self.db_path)?;
        let version: u32 = deserialize(&data)?;

        match version {
            STORAGE_VERSION => deserialize(&data),
            1 => {
                let old: UserDatabaseV1 = deserialize(&data)?;
                tracing::info!(
                    "Migrating user database from version 1, moving {} artifact record(s) to {}",
                    old.face_artifacts.len(),
                    self.artifact_log_path.display()
                );
                for artifact in &old.face_artifacts {
                    append_json_line(&self.artifact_log_path, artifact)?;
                }
                let db = UserDatabase {
                    version: STORAGE_VERSION,
                    next_id: old.next_id,
                    users: old.users,
                };
                self.save(&db)?;
                Ok(db)
            }
            v => Err(FaceAuthError::Storage(format!(
                "User database version {} is not supported (expected {})",
                v, STORAGE_VERSION
            ))),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, UserDatabase>> {
        self.db
            .lock()
            .map_err(|_| FaceAuthError::Storage("User database lock poisoned".into()))
    }

    fn save(&self, db: &UserDatabase) -> Result<()> {
        let encoded = bincode::serialize(db)
            .map_err(|e| FaceAuthError::Storage(format!("Failed to serialize user database: {}", e)))?;
        let tmp = self.db_path.with_extension("tmp");
        fs::write(&tmp, encoded)?;
        fs::rename(&tmp, &self.db_path)?;
        Ok(())
    }

    fn artifact_path(&self, user: &UserRecord, kind: FaceArtifactKind) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S_%3f");
        let name = match kind {
            FaceArtifactKind::Register if user.registration_face_path.is_none() => {
                format!("{}_register.jpg", user.username)
            }
            FaceArtifactKind::Register => format!("{}_register_{}.jpg", user.username, stamp),
            FaceArtifactKind::Login => format!("{}_login_{}.jpg", user.username, stamp),
        };
        self.faces_dir.join(name)
    }

    /// Every artifact recorded for `user_id`, oldest first.
    pub fn face_artifacts(&self, user_id: i32) -> Result<Vec<FaceArtifact>> {
        let _db = self.lock()?;
        let all: Vec<FaceArtifact> = read_json_lines(&self.artifact_log_path)?;
        Ok(all.into_iter().filter(|a| a.user_id == user_id).collect())
    }
}

impl UserStore for FileUserStore {
    fn create_user(&self, username: &str, password_hash: &str) -> Result<i32> {
        let mut db = self.lock()?;
        if db.users.iter().any(|u| u.username == username) {
            return Err(FaceAuthError::DuplicateUser(username.to_string()));
        }

        let id = db.next_id;
        db.next_id += 1;
        db.users.push(UserRecord {
            id,
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            registration_face_path: None,
            created_at: Utc::now(),
            last_login_at: None,
        });

        if let Err(e) = self.save(&db) {
            db.users.pop();
            db.next_id -= 1;
            return Err(e);
        }

        tracing::info!("Created user {} with id {}", username, id);
        Ok(id)
    }

    fn get_by_username(&self, username: &str) -> Result<Option<UserRecord>> {
        Ok(self.lock()?.users.iter().find(|u| u.username == username).cloned())
    }

    fn get_by_id(&self, user_id: i32) -> Result<Option<UserRecord>> {
        Ok(self.lock()?.users.iter().find(|u| u.id == user_id).cloned())
    }

    fn get_password_hash(&self, user_id: i32) -> Result<Option<String>> {
        Ok(self
            .lock()?
            .users
            .iter()
            .find(|u| u.id == user_id)
            .map(|u| u.password_hash.clone()))
    }

    fn update_last_login(&self, user_id: i32) -> Result<()> {
        let mut db = self.lock()?;
        db.user_mut(user_id)?.last_login_at = Some(Utc::now());
        self.save(&db)
    }

    fn delete_user(&self, user_id: i32) -> Result<()> {
        let mut db = self.lock()?;
        let index = db
            .users
            .iter()
            .position(|u| u.id == user_id)
            .ok_or_else(|| FaceAuthError::UserNotFound(format!("id {}", user_id)))?;

        let removed = db.users.remove(index);
        if let Err(e) = self.save(&db) {
            db.users.insert(index, removed);
            return Err(e);
        }

        tracing::info!("Deleted user {} (id {})", removed.username, user_id);
        Ok(())
    }

    fn append_audit_log(&self, user_id: i32, success: bool, details: &str) -> Result<()> {
        let entry = AuditEntry {
            user_id,
            success,
            details: details.to_string(),
            created_at: Utc::now(),
        };

        // Held so concurrent appends land as whole lines in order
        let _db = self.lock()?;
        append_json_line(&self.audit_path, &entry)
    }

    fn audit_log(&self, user_id: i32) -> Result<Vec<AuditEntry>> {
        let _db = self.lock()?;
        let all: Vec<AuditEntry> = read_json_lines(&self.audit_path)?;
        Ok(all.into_iter().filter(|e| e.user_id == user_id).collect())
    }

    fn save_face_artifact(&self, user_id: i32, image: &[u8], kind: FaceArtifactKind) -> Result<PathBuf> {
        let db = self.lock()?;
        let path = self.artifact_path(db.user(user_id)?, kind);

        if kind == FaceArtifactKind::Register || self.retain_login_images {
            fs::write(&path, image)?;
            tracing::debug!("Saved {:?} face image for user {} to {}", kind, user_id, path.display());
        }

        let record = FaceArtifact {
            user_id,
            path: path.clone(),
            kind,
            created_at: Utc::now(),
        };
        if let Err(e) = append_json_line(&self.artifact_log_path, &record) {
            tracing::warn!("Failed to record face artifact {}: {}", path.display(), e);
        }
        Ok(path)
    }

    fn set_registration_face(&self, user_id: i32, path: &Path) -> Result<()> {
        let mut db = self.lock()?;
        db.user_mut(user_id)?.registration_face_path = Some(path.to_path_buf());
        self.save(&db)
    }
}
