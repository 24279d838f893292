use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use eyre::WrapErr;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::action::ActionTable;
use super::request::{find_head_end, RequestHead, MAX_HEAD_BYTES};
use super::responder::ChunkedResponder;
use crate::config::ServiceConfig;
use crate::config::ServiceKind;
use crate::error::HarnessError;
use crate::logging::LogSink;

use crate::Result;

const LISTEN_BACKLOG: i32 = 1024;

/// Pause after a failed accept; errors like EMFILE repeat until a
/// descriptor is freed.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

const NOT_FOUND: &[u8] = b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n";
const NOT_FOUND_CLOSE: &[u8] =
    b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
const BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
const HEAD_TOO_LARGE: &[u8] =
    b"HTTP/1.1 431 Request Header Fields Too Large\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";

/// In-process HTTP/1.1 origin whose responses come from an [`ActionTable`].
///
/// The listening sockets stay open until [`MockOriginServer::stop`] (or
/// drop); connections already accepted are left to finish on their own.
pub struct MockOriginServer {
    name: String,
    local_addrs: Vec<SocketAddr>,
    shutdown: CancellationToken,
    accept_tasks: Vec<JoinHandle<()>>,
}

impl MockOriginServer {
    /// Binds the `http` endpoint of a `mock origin` service.
    pub async fn from_service(name: &str, service: &ServiceConfig, log: LogSink) -> Result<Self> {
        let actions = match service.kind {
            ServiceKind::MockOrigin(ref spec) => spec.actions.clone(),
            ref other => {
                return Err(HarnessError::config(format!(
                    "service '{}' is a {}, not a mock origin",
                    name,
                    other.label()
                ))
                .into())
            }
        };

        let endpoint = service.origin_endpoint().ok_or_else(|| {
            HarnessError::config(format!("mock origin '{}' has no http endpoint", name))
        })?;
        let port = endpoint.port.ok_or_else(|| {
            HarnessError::config(format!("mock origin '{}' has no port", name))
        })?;

        Self::bind(name, &endpoint.hostname, port, actions, log).await
    }

    /// Listens on every address `host` resolves to.
    pub async fn bind(
        name: &str,
        host: &str,
        port: u16,
        actions: ActionTable,
        log: LogSink,
    ) -> Result<Self> {
        let mut addrs: Vec<SocketAddr> = lookup_host((host, port))
            .await
            .wrap_err_with(|| format!("Failed to resolve {}:{}", host, port))?
            .collect();
        addrs.dedup();

        let mut listeners = Vec::new();
        let mut last_error = None;
        for addr in addrs {
            match bind_listener(addr) {
                Ok(listener) => listeners.push(listener),
                Err(e) => {
                    log.debug(format!("{}: cannot listen on {}: {}", name, addr, e));
                    last_error = Some(e);
                }
            }
        }

        if listeners.is_empty() {
            let reason = last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no addresses".to_string());
            return Err(eyre::eyre!(
                "Mock origin '{}' failed to listen on {}:{}: {}",
                name,
                host,
                port,
                reason
            ));
        }

        let actions = Arc::new(actions);
        let shutdown = CancellationToken::new();
        let mut local_addrs = Vec::with_capacity(listeners.len());
        let mut accept_tasks = Vec::with_capacity(listeners.len());

        for listener in listeners {
            let addr = listener.local_addr()?;
            log.info(format!("{}: listening on {}", name, addr));
            local_addrs.push(addr);
            accept_tasks.push(tokio::spawn(accept_loop(
                name.to_string(),
                listener,
                actions.clone(),
                shutdown.clone(),
                log.clone(),
            )));
        }

        Ok(Self {
            name: name.to_string(),
            local_addrs,
            shutdown,
            accept_tasks,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Closes the listening sockets; returns once they are gone.
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        for task in self.accept_tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for MockOriginServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Creates a listener the way the OS would for a restarted origin: address
/// reuse on, so a fresh bind is not blocked by TIME_WAIT leftovers.
fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

async fn accept_loop(
    name: String,
    listener: TcpListener,
    actions: Arc<ActionTable>,
    shutdown: CancellationToken,
    log: LogSink,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let actions = actions.clone();
                    let log = log.clone();
                    let name = name.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, actions, &log).await {
                            log.debug(format!("{}: connection from {} ended: {}", name, peer, e));
                        }
                    });
                }
                Err(e) => {
                    log.warn(format!("{}: accept failed: {}", name, e));
                    if !pause_after_accept_error(&shutdown).await {
                        break;
                    }
                }
            }
        }
    }
    log.debug(format!("{}: stopped listening", name));
}

/// Waits out [`ACCEPT_ERROR_BACKOFF`]. False when shutdown came first.
async fn pause_after_accept_error(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => true,
    }
}

/// Serves requests on one connection until the peer closes it or either
/// side asks for `Connection: close`.
async fn serve_connection(
    mut stream: TcpStream,
    actions: Arc<ActionTable>,
    log: &LogSink,
) -> io::Result<()> {
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        let head_end = loop {
            if let Some(end) = find_head_end(&buf) {
                break end;
            }
            if buf.len() > MAX_HEAD_BYTES {
                stream.write_all(HEAD_TOO_LARGE).await?;
                return stream.shutdown().await;
            }
            if stream.read_buf(&mut buf).await? == 0 {
                return Ok(());
            }
        };

        let head = buf.split_to(head_end + 4);
        let request = match RequestHead::parse(&head[..head_end]) {
            Some(request) => request,
            None => {
                stream.write_all(BAD_REQUEST).await?;
                return stream.shutdown().await;
            }
        };

        // Chunked uploads are not decoded, so the connection cannot be reused.
        let keep_alive = request.keep_alive() && !request.is_chunked();

        let mut remaining = request.content_length().unwrap_or(0);
        while remaining > 0 {
            if buf.is_empty() && stream.read_buf(&mut buf).await? == 0 {
                return Ok(());
            }
            let n = remaining.min(buf.len());
            buf.advance(n);
            remaining -= n;
        }

        log.debug(format!("{} {}", request.method, request.path));

        match actions.get(&request.method, &request.path) {
            Some(action) => {
                ChunkedResponder::new(action, &mut stream, keep_alive, log.clone())
                    .run()
                    .await?
            }
            None => {
                let response = if keep_alive { NOT_FOUND } else { NOT_FOUND_CLOSE };
                stream.write_all(response).await?;
            }
        }

        if !keep_alive {
            return stream.shutdown().await;
        }
    }
}
