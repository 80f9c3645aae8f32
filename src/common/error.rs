use thiserror::Error;

#[derive(Error, Debug)]
pub enum FaceAuthError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("User already exists: {0}")]
    DuplicateUser(String),

    #[error("No face detected")]
    NoFaceDetected,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("ORT error: {0}")]
    Ort(#[from] ort::OrtError),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<bincode::Error> for FaceAuthError {
    fn from(e: bincode::Error) -> Self {
        FaceAuthError::Storage(format!("bincode: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, FaceAuthError>;
