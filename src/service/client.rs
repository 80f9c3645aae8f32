use crate::common::{FaceAuthError, Result};
use crate::service::protocol::{self, Request, RequestKind, Response};
use std::io::Write;
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

const CONNECT_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(200);

/// Blocking client for the auth server. One connection per call.
pub struct FaceGateClient {
    addr: String,
    timeout: Duration,
}

impl FaceGateClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register(&self, username: &str, password: &str, face_image: Vec<u8>) -> Result<Response> {
        self.send(&Request {
            kind: RequestKind::Register,
            username: username.to_string(),
            password: password.to_string(),
            face_image,
            user_id: None,
        })
    }

    pub fn login(&self, username: &str, password: &str, face_image: Vec<u8>) -> Result<Response> {
        self.send(&Request {
            kind: RequestKind::Authenticate,
            username: username.to_string(),
            password: password.to_string(),
            face_image,
            user_id: None,
        })
    }

    pub fn update_face(&self, user_id: i32, face_image: Vec<u8>) -> Result<Response> {
        self.send(&Request {
            kind: RequestKind::UpdateFace,
            username: String::new(),
            password: String::new(),
            face_image,
            user_id: Some(user_id),
        })
    }

    pub fn send(&self, request: &Request) -> Result<Response> {
        let frame = protocol::encode_request(request)?;
        let mut stream = self.connect_with_retry(CONNECT_ATTEMPTS)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        stream.write_all(&frame)?;
        stream.flush()?;
        tracing::debug!("Sent {} request ({} bytes)", request.kind.as_str(), frame.len());

        Ok(protocol::read_response(&mut stream)?)
    }

    fn connect_with_retry(&self, max_attempts: u32) -> Result<TcpStream> {
        let mut last_error = None;
        for attempt in 1..=max_attempts {
            match TcpStream::connect(&self.addr) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    tracing::debug!("Connect to {} failed (attempt {}/{}): {}", self.addr, attempt, max_attempts, e);
                    last_error = Some(e);
                    if attempt < max_attempts {
                        thread::sleep(RETRY_DELAY);
                    }
                }
            }
        }

        Err(FaceAuthError::Other(anyhow::anyhow!(
            "Failed to connect to {} after {} attempts: {}",
            self.addr,
            max_attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}
