pub mod config;
pub mod error;
pub mod paths;

pub use config::{Config, FACE_DISTANCE_THRESHOLD};
pub use error::{FaceAuthError, Result};
pub use paths::Paths;
