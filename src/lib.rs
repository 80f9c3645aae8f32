pub mod common;
pub mod core;
pub mod service;
pub mod storage;

pub use crate::common::{Config, FaceAuthError, Paths, Result};
pub use crate::core::{AuthEngine, AuthError, FaceTemplateStore, LocalVision, Vision};
pub use crate::service::{AuthServer, FaceGateClient, ServerHandle};
pub use crate::storage::{FileUserStore, UserStore};
