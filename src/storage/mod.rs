pub mod user_store;

pub use user_store::FileUserStore;

use crate::common::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i32,
    pub username: String,
    pub password_hash: String,
    #[serde(default)]
    pub registration_face_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_login_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub user_id: i32,
    pub success: bool,
    pub details: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaceArtifactKind {
    Register,
    Login,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceArtifact {
    pub user_id: i32,
    pub path: PathBuf,
    pub kind: FaceArtifactKind,
    pub created_at: DateTime<Utc>,
}

/// Account persistence used by the authentication engine.
///
/// Ids are assigned by the store and are always positive. Implementations
/// must make `create_user` atomic with respect to the username check.
pub trait UserStore: Send + Sync {
    /// Returns the new user's id, or `DuplicateUser` if the name is taken.
    fn create_user(&self, username: &str, password_hash: &str) -> Result<i32>;

    fn get_by_username(&self, username: &str) -> Result<Option<UserRecord>>;

    fn get_by_id(&self, user_id: i32) -> Result<Option<UserRecord>>;

    fn get_password_hash(&self, user_id: i32) -> Result<Option<String>>;

    fn update_last_login(&self, user_id: i32) -> Result<()>;

    /// Removes the account row. Used to undo a registration that could not
    /// be completed; audit and artifact history are left alone.
    fn delete_user(&self, user_id: i32) -> Result<()>;

    fn append_audit_log(&self, user_id: i32, success: bool, details: &str) -> Result<()>;

    fn audit_log(&self, user_id: i32) -> Result<Vec<AuditEntry>>;

    /// Records a face image for `user_id` and returns where it lives.
    fn save_face_artifact(&self, user_id: i32, image: &[u8], kind: FaceArtifactKind) -> Result<PathBuf>;

    fn set_registration_face(&self, user_id: i32, path: &Path) -> Result<()>;
}
