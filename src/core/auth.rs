//! Register / authenticate / update-face workflows.
//!
//! Each request runs to completion on the caller's thread. The engine holds
//! no per-request state; everything it remembers lives in the user store and
//! the template store.

use crate::common::{Config, FaceAuthError, Paths};
use crate::core::detector::largest_face;
use crate::core::templates::FaceTemplateStore;
use crate::core::vision::Vision;
use crate::storage::{FaceArtifactKind, UserRecord, UserStore};
use image::DynamicImage;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthError {
    #[error("{0}")]
    Validation(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("User {0} already exists")]
    DuplicateUser(String),

    #[error("User not found")]
    UserNotFound,

    #[error("Invalid password")]
    InvalidCredentials,

    #[error("No face detected in image")]
    NoFaceDetected,

    #[error("User has no valid enrollment face")]
    MissingEnrollment,

    #[error("Face verification failed")]
    FaceMismatch { distance: f64 },

    #[error("Invalid face image data: {0}")]
    InvalidImage(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Vision error: {0}")]
    Vision(String),

    #[error("Bind error: {0}")]
    Bind(String),
}

impl From<FaceAuthError> for AuthError {
    fn from(e: FaceAuthError) -> Self {
        match e {
            FaceAuthError::DuplicateUser(name) => AuthError::DuplicateUser(name),
            FaceAuthError::UserNotFound(_) => AuthError::UserNotFound,
            FaceAuthError::NoFaceDetected => AuthError::NoFaceDetected,
            FaceAuthError::Protocol(msg) => AuthError::Protocol(msg),
            FaceAuthError::Image(e) => AuthError::InvalidImage(e.to_string()),
            e @ (FaceAuthError::Model(_) | FaceAuthError::Ort(_)) => AuthError::Vision(e.to_string()),
            e @ FaceAuthError::Bind { .. } => AuthError::Bind(e.to_string()),
            e => AuthError::Storage(e.to_string()),
        }
    }
}

impl AuthError {
    /// Extra response fields carried by a failure.
    pub fn extra(&self) -> BTreeMap<String, String> {
        let mut extra = BTreeMap::new();
        if let AuthError::FaceMismatch { distance } = self {
            extra.insert("face_verified".to_string(), "false".to_string());
            extra.insert("distance".to_string(), format!("{:.2}", distance));
        }
        extra
    }

    fn audit_details(&self) -> String {
        match self {
            AuthError::NoFaceDetected => "no face detected".to_string(),
            AuthError::MissingEnrollment => "no enrollment face".to_string(),
            AuthError::FaceMismatch { distance } => {
                format!("face verification failed, confidence={:.2}", distance)
            }
            other => other.to_string(),
        }
    }
}

pub type AuthResult<T> = std::result::Result<T, AuthError>;

#[derive(Debug, Clone, PartialEq)]
pub struct AuthOutcome {
    pub user_id: i32,
    pub message: String,
    /// Set by a verified login.
    pub distance: Option<f64>,
}

impl AuthOutcome {
    pub fn extra(&self) -> BTreeMap<String, String> {
        let mut extra = BTreeMap::new();
        extra.insert("user_id".to_string(), self.user_id.to_string());
        if let Some(distance) = self.distance {
            extra.insert("face_verified".to_string(), "true".to_string());
            extra.insert("distance".to_string(), format!("{:.2}", distance));
        }
        extra
    }
}

/// SHA-256 of the password, lowercase hex.
pub fn hash_password(password: &str) -> String {
    format!("{:x}", Sha256::digest(password.as_bytes()))
}

fn require(value: &str, message: &str) -> AuthResult<()> {
    if value.is_empty() {
        return Err(AuthError::Validation(message.to_string()));
    }
    Ok(())
}

pub const MAX_USERNAME_LEN: usize = 64;

/// Usernames end up in file names under `faces/`, so anything that could
/// leave that directory is refused.
fn validate_username(username: &str) -> AuthResult<()> {
    require(username, "Username is required")?;
    if username.chars().count() > MAX_USERNAME_LEN {
        return Err(AuthError::Validation(format!(
            "Username must be at most {} characters",
            MAX_USERNAME_LEN
        )));
    }
    if username.contains("..") || username.chars().any(|c| c == '/' || c == '\\' || c.is_control()) {
        return Err(AuthError::Validation("Username contains invalid characters".to_string()));
    }
    Ok(())
}

fn require_image(face_image: &[u8]) -> AuthResult<()> {
    if face_image.is_empty() {
        return Err(AuthError::Validation("Face data is required".to_string()));
    }
    Ok(())
}

fn decode_image(bytes: &[u8]) -> AuthResult<DynamicImage> {
    image::load_from_memory(bytes).map_err(|e| AuthError::InvalidImage(e.to_string()))
}

pub struct AuthEngine {
    vision: Arc<dyn Vision>,
    users: Arc<dyn UserStore>,
    templates: Arc<FaceTemplateStore>,
    paths: Paths,
    threshold: f64,
}

impl AuthEngine {
    pub fn new(
        config: &Config,
        paths: Paths,
        vision: Arc<dyn Vision>,
        users: Arc<dyn UserStore>,
        templates: Arc<FaceTemplateStore>,
    ) -> Self {
        Self {
            vision,
            users,
            templates,
            paths,
            threshold: config.auth.face_distance_threshold,
        }
    }

    pub fn templates(&self) -> &FaceTemplateStore {
        &self.templates
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Crop of the largest detected face, `None` when there is no face.
    fn largest_face_region(&self, image: &DynamicImage) -> AuthResult<Option<DynamicImage>> {
        let faces = self.vision.detect_faces(image)?;
        Ok(largest_face(&faces).and_then(|face| face.crop(image)))
    }

    pub fn register(&self, username: &str, password: &str, face_image: &[u8]) -> AuthResult<AuthOutcome> {
        validate_username(username)?;
        require(password, "Password is required")?;
        require_image(face_image)?;

        let image = decode_image(face_image)?;
        let region = self
            .largest_face_region(&image)?
            .ok_or(AuthError::NoFaceDetected)?;

        let user_id = self.users.create_user(username, &hash_password(password))?;
        if let Err(e) = self.record_enrollment(user_id, face_image) {
            tracing::error!("Enrollment image for user {} not saved, removing the account: {}", user_id, e);
            if let Err(cleanup) = self.users.delete_user(user_id) {
                tracing::error!("Failed to remove half-registered user {}: {}", user_id, cleanup);
            }
            return Err(e);
        }

        // The user exists at this point; a missing template is rebuilt on first login
        if let Err(e) = self.templates.train(user_id, &region) {
            tracing::error!("Training failed for new user {}: {}", user_id, e);
        }

        tracing::info!("Registered user {} (id {})", username, user_id);
        Ok(AuthOutcome {
            user_id,
            message: "User registered successfully".to_string(),
            distance: None,
        })
    }

    fn record_enrollment(&self, user_id: i32, face_image: &[u8]) -> AuthResult<()> {
        let path = self
            .users
            .save_face_artifact(user_id, face_image, FaceArtifactKind::Register)?;
        if let Err(e) = self.users.set_registration_face(user_id, &path) {
            let _ = fs::remove_file(&path);
            return Err(e.into());
        }
        Ok(())
    }

    pub fn authenticate(&self, username: &str, password: &str, face_image: &[u8]) -> AuthResult<AuthOutcome> {
        require(username, "Username is required")?;
        require(password, "Password is required")?;
        require_image(face_image)?;

        let user = self
            .users
            .get_by_username(username)?
            .ok_or(AuthError::UserNotFound)?;

        let stored_hash = self.users.get_password_hash(user.id)?.ok_or(AuthError::UserNotFound)?;
        if hash_password(password) != stored_hash {
            tracing::warn!("Password rejected for user {}", username);
            self.audit(user.id, false, "password verification failed");
            return Err(AuthError::InvalidCredentials);
        }

        let result = self.verify_face(&user, face_image);
        match &result {
            Ok(distance) => {
                tracing::info!("User {} authenticated (distance {:.2})", username, distance);
                if let Err(e) = self.users.update_last_login(user.id) {
                    tracing::error!("Failed to update last login for user {}: {}", user.id, e);
                }
                self.audit(user.id, true, &format!("authentication succeeded, confidence={:.2}", distance));
            }
            Err(e) => {
                tracing::warn!("Face check failed for user {}: {}", username, e);
                self.audit(user.id, false, &e.audit_details());
            }
        }

        let distance = result?;
        Ok(AuthOutcome {
            user_id: user.id,
            message: "Authentication successful".to_string(),
            distance: Some(distance),
        })
    }

    /// Face half of a login. Returns the distance when it is under the
    /// threshold.
    fn verify_face(&self, user: &UserRecord, face_image: &[u8]) -> AuthResult<f64> {
        let image = decode_image(face_image)?;
        let login_region = self
            .largest_face_region(&image)?
            .ok_or(AuthError::NoFaceDetected)?;
        let registered_region = self
            .registration_region(user)?
            .ok_or(AuthError::MissingEnrollment)?;

        let reference = self.vision.preprocess(&registered_region)?;
        let probe = self.vision.preprocess(&login_region)?;

        if self.templates.train_sample_if_absent(user.id, reference.clone())? {
            tracing::info!("Bootstrapped face template for user {}", user.id);
        }

        let distance = self.templates.compare(&reference, &probe)?;
        tracing::debug!(
            "User {} distance {:.2}, threshold {:.2}",
            user.id, distance, self.threshold
        );

        if let Err(e) = self
            .users
            .save_face_artifact(user.id, face_image, FaceArtifactKind::Login)
        {
            tracing::warn!("Failed to record login image for user {}: {}", user.id, e);
        }

        if distance < self.threshold {
            Ok(distance)
        } else {
            Err(AuthError::FaceMismatch { distance })
        }
    }

    /// Largest face in the user's enrollment image. Tries the recorded path
    /// first, then the default location.
    fn registration_region(&self, user: &UserRecord) -> AuthResult<Option<DynamicImage>> {
        let candidates = user
            .registration_face_path
            .iter()
            .cloned()
            .chain(std::iter::once(self.paths.default_registration_face(&user.username)));

        for path in candidates {
            let image = match fs::read(&path).map_err(FaceAuthError::from).and_then(|bytes| {
                Ok(image::load_from_memory(&bytes)?)
            }) {
                Ok(image) => image,
                Err(e) => {
                    tracing::debug!("Enrollment image {} unusable: {}", path.display(), e);
                    continue;
                }
            };

            if let Some(region) = self.largest_face_region(&image)? {
                return Ok(Some(region));
            }
            tracing::warn!("No face found in enrollment image {}", path.display());
        }

        Ok(None)
    }

    pub fn update_face(&self, user_id: i32, face_image: &[u8]) -> AuthResult<AuthOutcome> {
        if user_id <= 0 {
            return Err(AuthError::Validation("Invalid user id".to_string()));
        }
        require_image(face_image)?;

        let user = self.users.get_by_id(user_id)?.ok_or(AuthError::UserNotFound)?;

        let image = decode_image(face_image)?;
        let region = self
            .largest_face_region(&image)?
            .ok_or(AuthError::NoFaceDetected)?;

        let path = self
            .users
            .save_face_artifact(user_id, face_image, FaceArtifactKind::Register)?;
        self.users.set_registration_face(user_id, &path)?;
        let samples = match self.templates.train(user_id, &region) {
            Ok(samples) => samples,
            Err(e) => {
                // Logins keep checking against the image the templates were built from
                if let Some(previous) = &user.registration_face_path {
                    if let Err(restore) = self.users.set_registration_face(user_id, previous) {
                        tracing::error!("Failed to restore enrollment image for user {}: {}", user_id, restore);
                    }
                }
                return Err(e.into());
            }
        };

        tracing::info!("Updated face for user {} ({} sample(s))", user.username, samples);
        Ok(AuthOutcome {
            user_id,
            message: "Face data updated successfully".to_string(),
            distance: None,
        })
    }

    fn audit(&self, user_id: i32, success: bool, details: &str) {
        if let Err(e) = self.users.append_audit_log(user_id, success, details) {
            tracing::error!("Failed to write audit entry for user {}: {}", user_id, e);
        }
    }
}
