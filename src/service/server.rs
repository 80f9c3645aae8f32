//! TCP front end: one thread per connection, one request per connection.

use crate::common::config::ServerConfig;
use crate::common::{FaceAuthError, Result};
use crate::core::{AuthEngine, AuthError};
use crate::service::protocol::{self, ProtocolError, Request, RequestKind, Response};
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const MAX_ACCEPT_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct Timeouts {
    read: Duration,
    write: Duration,
}

pub struct AuthServer;

impl AuthServer {
    /// Binds the listener and starts accepting. Returns once connections can
    /// be made.
    pub fn start(config: &ServerConfig, engine: Arc<AuthEngine>) -> Result<ServerHandle> {
        let addr = format!("{}:{}", config.bind_address, config.port);
        let listener = TcpListener::bind(&addr).map_err(|source| FaceAuthError::Bind {
            addr: addr.clone(),
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| FaceAuthError::Bind { addr: addr.clone(), source })?;
        let local_addr = listener.local_addr()?;

        let poll = Duration::from_millis(config.accept_poll_ms.max(1)).min(MAX_ACCEPT_POLL);
        let timeouts = Timeouts {
            read: Duration::from_secs(config.read_timeout_secs.max(1)),
            write: Duration::from_secs(config.write_timeout_secs.max(1)),
        };

        let shutdown = Arc::new(AtomicBool::new(false));
        let accept_shutdown = Arc::clone(&shutdown);
        let accept_thread = thread::Builder::new()
            .name("accept".into())
            .spawn(move || accept_loop(listener, engine, accept_shutdown, poll, timeouts))?;

        tracing::info!("Auth server listening on {}", local_addr);
        Ok(ServerHandle {
            local_addr,
            shutdown,
            accept_thread: Some(accept_thread),
        })
    }
}

pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.accept_thread.is_some() && !self.shutdown.load(Ordering::SeqCst)
    }

    /// Stops accepting and waits for in-flight connections to finish.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.take() {
            if handle.join().is_err() {
                tracing::error!("Accept thread panicked");
            }
            tracing::info!("Auth server on {} stopped", self.local_addr);
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listener: TcpListener,
    engine: Arc<AuthEngine>,
    shutdown: Arc<AtomicBool>,
    poll: Duration,
    timeouts: Timeouts,
) {
    let mut handlers: Vec<JoinHandle<()>> = Vec::new();

    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                tracing::debug!("Accepted connection from {}", peer);
                let engine = Arc::clone(&engine);
                let spawned = thread::Builder::new()
                    .name(format!("conn-{}", peer))
                    .spawn(move || handle_connection(stream, peer, &engine, timeouts));
                match spawned {
                    Ok(handle) => handlers.push(handle),
                    Err(e) => tracing::error!("Failed to spawn handler for {}: {}", peer, e),
                }
                handlers.retain(|h| !h.is_finished());
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(poll),
            Err(e) => {
                tracing::error!("Accept failed: {}", e);
                thread::sleep(poll);
            }
        }
    }

    tracing::debug!("Waiting for {} connection handler(s)", handlers.len());
    for handle in handlers {
        if handle.join().is_err() {
            tracing::error!("Connection handler panicked");
        }
    }
}

fn handle_connection(mut stream: TcpStream, peer: SocketAddr, engine: &AuthEngine, timeouts: Timeouts) {
    let configured = stream
        .set_nonblocking(false)
        .and_then(|_| stream.set_read_timeout(Some(timeouts.read)))
        .and_then(|_| stream.set_write_timeout(Some(timeouts.write)));
    if let Err(e) = configured {
        tracing::error!("Failed to configure socket for {}: {}", peer, e);
        return;
    }

    let request = match protocol::read_request(&mut stream) {
        Ok(request) => request,
        Err(ProtocolError::Io(e)) => {
            tracing::warn!("Connection from {} dropped before a full request: {}", peer, e);
            return;
        }
        Err(e) => {
            tracing::warn!("Rejected frame from {}: {}", peer, e);
            let message = AuthError::from(e).to_string();
            if let Err(e) = protocol::write_response(&mut stream, &Response::error(message)) {
                tracing::debug!("Could not send error frame to {}: {}", peer, e);
            }
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
    };

    tracing::info!("{} request for '{}' from {}", request.kind.as_str(), request.username, peer);

    let response = match panic::catch_unwind(AssertUnwindSafe(|| dispatch(engine, &request))) {
        Ok(response) => response,
        Err(_) => {
            tracing::error!("Handler panicked on {} request from {}", request.kind.as_str(), peer);
            Response::error("Internal server error")
        }
    };

    if let Err(e) = protocol::write_response(&mut stream, &response) {
        tracing::warn!("Failed to send response to {}: {}", peer, e);
    }
    let _ = stream.shutdown(Shutdown::Both);
}

/// Runs one request through the engine and shapes the reply.
pub fn dispatch(engine: &AuthEngine, request: &Request) -> Response {
    let result = match request.kind {
        RequestKind::Register => engine.register(&request.username, &request.password, &request.face_image),
        RequestKind::Authenticate => {
            engine.authenticate(&request.username, &request.password, &request.face_image)
        }
        RequestKind::UpdateFace => match request.user_id {
            Some(user_id) => engine.update_face(user_id, &request.face_image),
            None => Err(AuthError::Validation("Invalid user id".to_string())),
        },
    };

    match result {
        Ok(outcome) => Response::reply(request.kind, true, outcome.message.clone()).with_extra(outcome.extra()),
        Err(e) => {
            tracing::debug!("{} request failed: {}", request.kind.as_str(), e);
            Response::reply(request.kind, false, e.to_string()).with_extra(e.extra())
        }
    }
}
