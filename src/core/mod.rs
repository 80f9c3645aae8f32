pub mod auth;
pub mod detector;
pub mod lbph;
pub mod templates;
pub mod vision;

pub use auth::{hash_password, AuthEngine, AuthError, AuthOutcome, AuthResult};
pub use detector::{largest_face, FaceBox, FaceDetector, OnnxFaceDetector};
pub use lbph::{LbphModel, LbphParams};
pub use templates::FaceTemplateStore;
pub use vision::{FaceModel, FaceSample, LocalVision, PixelFormat, Prediction, Vision, COMPARE_SENTINEL_ID, MAX_DISTANCE};
