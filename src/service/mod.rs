pub mod client;
pub mod protocol;
pub mod server;

pub use client::FaceGateClient;
pub use protocol::{ProtocolError, Request, RequestKind, Response, ResponseKind};
pub use server::{AuthServer, ServerHandle};
