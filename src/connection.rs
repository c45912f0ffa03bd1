//! Per-socket state: write serialization, reply rendezvous, auth latch and the reader task

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn, Level};

use crate::{
    command::{validate_no_newlines, CommandResponse, EslCommand},
    config::EslClientOptions,
    constants::{LINE_TERMINATOR, MESSAGE_TERMINATOR},
    error::{EslError, EslResult},
    event::EslEvent,
    listener::ProtocolListener,
    protocol::{decode, EslMessage, MessageType},
};

/// Establish a TCP connection with a timeout.
pub(crate) async fn tcp_connect_with_timeout(
    host: &str,
    port: u16,
    dial_timeout: Duration,
) -> EslResult<TcpStream> {
    let tcp_result = timeout(dial_timeout, TcpStream::connect((host, port))).await;

    match tcp_result {
        Ok(Ok(s)) => {
            debug!("[CONNECT] TCP connection established");
            Ok(s)
        }
        Ok(Err(e)) => {
            warn!("[CONNECT] TCP connect failed: {}", e);
            Err(EslError::Io(e))
        }
        Err(_) => {
            let timeout_ms = dial_timeout.as_millis() as u64;
            warn!("[CONNECT] TCP connect timed out after {}ms", timeout_ms);
            Err(EslError::Timeout { timeout_ms })
        }
    }
}

/// Outcome of the auth handshake on one socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AuthState {
    /// No answer to the auth challenge yet
    Pending,
    Authenticated,
    /// Carries the server's Reply-Text, or a description of what went wrong
    Failed(String),
    /// Socket closed before the handshake finished
    Closed,
}

/// One live TCP session with the server.
///
/// Everything here is scoped to a single socket; a reconnect builds a new
/// `SocketConnection`, so the reply slot and the auth latch never carry over.
pub(crate) struct SocketConnection {
    writer: Mutex<BufWriter<OwnedWriteHalf>>,
    pending_reply: Mutex<Option<oneshot::Sender<EslMessage>>>,
    auth_tx: watch::Sender<AuthState>,
    active: AtomicBool,
    close_requested: AtomicBool,
    shutdown: CancellationToken,
    remote_addr: SocketAddr,
    password: String,
    options: EslClientOptions,
}

impl std::fmt::Debug for SocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketConnection")
            .field("remote_addr", &self.remote_addr)
            .field("active", &self.is_active())
            .field("auth", &*self.auth_tx.borrow())
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl SocketConnection {
    /// Split the stream and build the shared handle.
    ///
    /// The reader half is returned separately; nothing is read until
    /// [`spawn_reader`](Self::spawn_reader) is called with it.
    pub(crate) fn new(
        stream: TcpStream,
        password: &str,
        options: &EslClientOptions,
    ) -> EslResult<(Arc<Self>, BufReader<OwnedReadHalf>)> {
        let remote_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        let (auth_tx, _) = watch::channel(AuthState::Pending);

        let socket = Arc::new(SocketConnection {
            writer: Mutex::new(BufWriter::new(write_half)),
            pending_reply: Mutex::new(None),
            auth_tx,
            active: AtomicBool::new(true),
            close_requested: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            remote_addr,
            password: password.to_string(),
            options: options.clone(),
        });
        Ok((socket, BufReader::new(read_half)))
    }

    /// Start the background reader task.
    pub(crate) fn spawn_reader<L: ProtocolListener>(
        self: &Arc<Self>,
        reader: BufReader<OwnedReadHalf>,
        listener: Arc<L>,
    ) {
        tokio::spawn(Arc::clone(self).reader_loop(reader, listener));
    }

    pub(crate) fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// `true` until the reader task has exited.
    pub(crate) fn is_active(&self) -> bool {
        self.active
            .load(Ordering::SeqCst)
    }

    pub(crate) fn is_authenticated(&self) -> bool {
        self.is_active() && *self.auth_tx.borrow() == AuthState::Authenticated
    }

    /// Mark this socket as closed on purpose, so its close does not trigger a reconnect.
    pub(crate) fn request_close(&self) {
        self.close_requested
            .store(true, Ordering::SeqCst);
    }

    pub(crate) fn close_requested(&self) -> bool {
        self.close_requested
            .load(Ordering::SeqCst)
    }

    /// Stop the reader task; the close path then runs as for a remote close.
    pub(crate) fn shutdown(&self) {
        self.shutdown
            .cancel();
    }

    /// Wait until the auth handshake has an outcome.
    pub(crate) async fn wait_for_auth(&self) -> AuthState {
        let mut rx = self
            .auth_tx
            .subscribe();
        let state = match rx
            .wait_for(|state| *state != AuthState::Pending)
            .await
        {
            Ok(state) => state.clone(),
            Err(_) => AuthState::Closed,
        };
        state
    }

    fn verbose(&self, level: Level) -> bool {
        self.options
            .enabled(level)
    }

    /// Write `command` plus the message terminator and wait for its reply.
    ///
    /// `Ok(None)` means the socket closed before a reply arrived.
    pub(crate) async fn send_sync_single_line(&self, command: &str) -> EslResult<Option<EslMessage>> {
        let mut payload = String::with_capacity(command.len() + MESSAGE_TERMINATOR.len());
        payload.push_str(command);
        payload.push_str(MESSAGE_TERMINATOR);
        self.round_trip(payload.as_bytes())
            .await
    }

    /// Write each line followed by a line terminator, then a blank line, and
    /// wait for the reply.
    pub(crate) async fn send_sync_multi_line(
        &self,
        lines: &[String],
    ) -> EslResult<Option<EslMessage>> {
        let mut payload = String::new();
        for line in lines {
            validate_no_newlines(line, "command line")?;
            // A blank line ends the command on the wire.
            if line.is_empty() {
                return Err(EslError::protocol_error("command line must not be empty"));
            }
            payload.push_str(line);
            payload.push_str(LINE_TERMINATOR);
        }
        payload.push_str(LINE_TERMINATOR);
        self.round_trip(payload.as_bytes())
            .await
    }

    /// Send one command and wait for the next reply.
    ///
    /// The writer lock is held through the entire send-and-receive cycle: the
    /// protocol has no request IDs, so a reply belongs to whichever command
    /// holds the lock.
    async fn round_trip(&self, payload: &[u8]) -> EslResult<Option<EslMessage>> {
        if !self.is_active() {
            return Err(EslError::NotConnected);
        }

        let mut writer = self
            .writer
            .lock()
            .await;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self
                .pending_reply
                .lock()
                .await;
            *pending = Some(tx);
        }
        // The reader clears the slot after marking the socket inactive, so a
        // slot installed after that would never be released.
        if !self.is_active() {
            self.pending_reply
                .lock()
                .await
                .take();
            return Ok(None);
        }

        // Armed from the first written byte until the reply is in hand.
        let in_flight = InFlight {
            socket: self,
            armed: true,
        };

        if self.verbose(Level::TRACE) {
            trace!("[SEND] {} bytes to {}", payload.len(), self.remote_addr);
        }
        writer
            .write_all(payload)
            .await?;
        writer
            .flush()
            .await?;

        let reply = match self.options.command_timeout {
            None => rx
                .await
                .ok(),
            Some(limit) => match timeout(limit, rx).await {
                Ok(reply) => reply.ok(),
                Err(_) => {
                    let timeout_ms = limit.as_millis() as u64;
                    warn!(
                        "[SEND] no reply within {}ms, closing socket to {}",
                        timeout_ms, self.remote_addr
                    );
                    return Err(EslError::Timeout { timeout_ms });
                }
            },
        };

        in_flight.disarm();
        drop(writer);
        Ok(reply)
    }

    /// Take this socket out of service at once and stop the reader.
    fn abandon(&self) {
        self.active
            .store(false, Ordering::SeqCst);
        self.shutdown();
    }

    /// Answer the server's auth challenge and latch the outcome.
    async fn authenticate<L: ProtocolListener>(&self, listener: &L) {
        let command = EslCommand::Auth {
            password: self
                .password
                .clone(),
        };
        debug!("[AUTH] Auth requested, sending [{}]", command);

        let outcome = match command.wire_line() {
            Ok(line) => self
                .send_sync_single_line(&line)
                .await
                .transpose(),
            Err(e) => Some(Err(e)),
        };

        let state = match outcome {
            Some(Ok(reply)) if reply.message_type() == MessageType::CommandReply => {
                let response = CommandResponse::new(command.to_string(), reply);
                listener.auth_response_received(&response);
                if response.is_ok() {
                    AuthState::Authenticated
                } else {
                    AuthState::Failed(
                        response
                            .reply_text()
                            .to_string(),
                    )
                }
            }
            Some(Ok(reply)) => {
                error!("[AUTH] Bad auth response message {}", reply);
                AuthState::Failed(format!(
                    "unexpected auth response content type [{}]",
                    reply
                        .content_type()
                        .unwrap_or("")
                ))
            }
            Some(Err(e)) => {
                warn!("[AUTH] auth command failed: {}", e);
                AuthState::Failed(e.to_string())
            }
            None => AuthState::Closed,
        };
        self.settle_auth(state);
    }

    /// Move the auth latch out of `Pending`; later outcomes are ignored.
    fn settle_auth(&self, state: AuthState) {
        self.auth_tx
            .send_if_modified(|current| {
                if *current == AuthState::Pending {
                    *current = state;
                    true
                } else {
                    false
                }
            });
    }

    /// Background reader task. Always ends by running the close path.
    async fn reader_loop<L: ProtocolListener>(
        self: Arc<Self>,
        reader: BufReader<OwnedReadHalf>,
        listener: Arc<L>,
    ) {
        let result = std::panic::AssertUnwindSafe(
            Arc::clone(&self).reader_loop_inner(reader, Arc::clone(&listener)),
        );
        if futures_util::FutureExt::catch_unwind(result)
            .await
            .is_err()
        {
            error!("[RECV] reader task panicked");
        }

        self.mark_closed()
            .await;
        info!("[{}] connection closed", self.remote_addr);
        listener.socket_closed(&self);
    }

    async fn reader_loop_inner<L: ProtocolListener>(
        self: Arc<Self>,
        mut reader: BufReader<OwnedReadHalf>,
        listener: Arc<L>,
    ) {
        loop {
            let decoded = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("[RECV] shutdown requested for {}", self.remote_addr);
                    return;
                }
                decoded = decode(&mut reader) => decoded,
            };

            match decoded {
                Ok(message) => {
                    self.handle_message(message, &listener)
                        .await
                }
                Err(EslError::ConnectionClosed) => {
                    debug!("[RECV] EOF from {}", self.remote_addr);
                    return;
                }
                Err(e) if e.is_framing_error() => {
                    error!("[RECV] framing error, closing socket: {}", e);
                    return;
                }
                Err(e) => {
                    warn!("[RECV] read error: {}", e);
                    return;
                }
            }
        }
    }

    /// Route one decoded message by content type.
    async fn handle_message<L: ProtocolListener>(self: &Arc<Self>, message: EslMessage, listener: &Arc<L>) {
        if self.verbose(Level::DEBUG) {
            debug!("[RECV] Received message: {}", message);
        }

        match message.message_type() {
            MessageType::ApiResponse | MessageType::CommandReply => {
                let mut pending = self
                    .pending_reply
                    .lock()
                    .await;
                match pending.take() {
                    Some(tx) => {
                        if tx
                            .send(message)
                            .is_err()
                        {
                            warn!("[RECV] reply arrived after its caller gave up");
                        }
                    }
                    None => warn!("[RECV] Received {} but no pending command", message),
                }
            }
            MessageType::AuthRequest => {
                let socket = Arc::clone(self);
                let listener = Arc::clone(listener);
                tokio::spawn(async move {
                    socket
                        .authenticate(&*listener)
                        .await
                });
            }
            MessageType::DisconnectNotice => {
                info!("[RECV] Disconnect notice received: {}", message);
                listener.disconnect_notice(self);
            }
            MessageType::RudeRejection => {
                info!("[RECV] Rude rejection received: {}", message);
                listener.rude_rejection(self);
            }
            MessageType::EventPlain | MessageType::EventXml => {
                match EslEvent::from_message(&message) {
                    Ok(event) => {
                        if self.verbose(Level::DEBUG) {
                            debug!("[RECV] Received event: {}", event);
                        }
                        listener.event_received(event);
                    }
                    Err(e) => warn!("[RECV] dropping event: {}", e),
                }
            }
            MessageType::Unknown(content_type) => {
                warn!("[RECV] Unexpected message content type {}", content_type)
            }
        }
    }

    /// Reset per-socket state: inactive, reply slot released, auth latch closed.
    async fn mark_closed(&self) {
        self.active
            .store(false, Ordering::SeqCst);
        self.shutdown
            .cancel();
        self.pending_reply
            .lock()
            .await
            .take();
        self.settle_auth(AuthState::Closed);
    }
}

/// Guards a command that is on the wire but not yet answered.
///
/// Dropped while armed (write error, command timeout, or the caller's future
/// being cancelled), it closes the socket: an unclaimed reply would otherwise
/// be handed to whichever command takes the writer lock next.
struct InFlight<'a> {
    socket: &'a SocketConnection,
    armed: bool,
}

impl InFlight<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(
                "[SEND] command to {} left without its reply, closing socket",
                self.socket.remote_addr
            );
            self.socket.abandon();
        }
    }
}
