//! Inbound ESL client: connect state machine, reconnect policy and public commands

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn, Level};

use crate::{
    command::{CommandResponse, EslCommand},
    commands::{SendEvent, SendMsg},
    config::EslClientOptions,
    connection::{tcp_connect_with_timeout, AuthState, SocketConnection},
    dispatch::Dispatcher,
    error::{EslError, EslResult},
    event::{EslEvent, EventFormat},
    listener::{notify_event_listeners, ConnectionListener, EventListener, ProtocolListener},
    protocol::EslMessage,
};

/// Where the client is in its connect lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionState {
    /// Never connected
    Idle,
    /// TCP dial in progress
    Dialing,
    /// Socket up, waiting for the auth handshake to finish
    AwaitingAuth,
    /// Ready to send commands
    Authenticated,
    /// The server refused the password
    AuthFailed,
    /// A reconnect is queued after the configured interval
    ReconnectScheduled,
    /// Closed, with no reconnect pending
    Closed,
}

struct ClientInner {
    host: String,
    port: u16,
    password: String,
    dial_timeout: Duration,
    options: EslClientOptions,
    socket: RwLock<Option<Arc<SocketConnection>>>,
    event_listeners: RwLock<Vec<Arc<dyn EventListener>>>,
    connection_listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,
    reconnect_attempts: AtomicU32,
    /// Bumped whenever a scheduled reconnect must no longer fire
    reconnect_generation: AtomicU64,
    rejected: AtomicBool,
    dispatcher: Dispatcher,
    state_tx: watch::Sender<ConnectionState>,
    connect_lock: Mutex<()>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let slot = self
            .socket
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(socket) = slot.take() {
            socket.request_close();
            socket.shutdown();
        }
    }
}

/// ESL inbound client handle (Clone + Send + Sync)
///
/// One client owns at most one socket at a time. Commands are strictly
/// serialized on that socket; events and lifecycle changes are delivered to
/// registered listeners. Listener registrations survive reconnects.
///
/// ```no_run
/// use freeswitch_esl_client::{EslClient, EslClientOptions, EventFormat};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = EslClient::new(
///     "127.0.0.1",
///     8021,
///     "ClueCon",
///     Duration::from_secs(2),
///     EslClientOptions::default(),
/// );
/// client.connect().await?;
/// client.set_event_subscriptions(EventFormat::Plain, "ALL").await?;
/// let status = client.send_sync_api_command("status", None).await?;
/// println!("{}", status.body_lines().join("\n"));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct EslClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for EslClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EslClient")
            .field("host", &self.inner.host)
            .field("port", &self.inner.port)
            .field("state", &self.state())
            .finish()
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read()
        .unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write()
        .unwrap_or_else(PoisonError::into_inner)
}

impl EslClient {
    /// Create a client. Nothing is dialed until [`connect`](Self::connect).
    pub fn new(
        host: impl Into<String>,
        port: u16,
        password: impl Into<String>,
        dial_timeout: Duration,
        options: EslClientOptions,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let dispatcher = Dispatcher::new(options.listener_concurrency);
        Self {
            inner: Arc::new(ClientInner {
                host: host.into(),
                port,
                password: password.into(),
                dial_timeout,
                options,
                socket: RwLock::new(None),
                event_listeners: RwLock::new(Vec::new()),
                connection_listeners: RwLock::new(Vec::new()),
                reconnect_attempts: AtomicU32::new(0),
                reconnect_generation: AtomicU64::new(0),
                rejected: AtomicBool::new(false),
                dispatcher,
                state_tx,
                connect_lock: Mutex::new(()),
            }),
        }
    }

    /// Register an event listener. Listeners are called in registration order.
    pub fn add_event_listener(&self, listener: Arc<dyn EventListener>) {
        write_lock(&self.inner.event_listeners).push(listener);
    }

    /// Register a connection lifecycle listener.
    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        write_lock(&self.inner.connection_listeners).push(listener);
    }

    pub fn options(&self) -> &EslClientOptions {
        &self.inner.options
    }

    /// Current connect state.
    pub fn state(&self) -> ConnectionState {
        *self
            .inner
            .state_tx
            .borrow()
    }

    /// Receiver that observes every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner
            .state_tx
            .subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self
            .inner
            .state_tx
            .send_replace(state);
        if previous != state {
            debug!("[CONNECT] state {:?} -> {:?}", previous, state);
        }
    }

    /// Set `to` only if the state is still `from`.
    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.inner
            .state_tx
            .send_if_modified(|current| {
                if *current == from {
                    *current = to;
                    true
                } else {
                    false
                }
            })
    }

    fn current_socket(&self) -> Option<Arc<SocketConnection>> {
        read_lock(&self.inner.socket).clone()
    }

    fn take_socket(&self) -> Option<Arc<SocketConnection>> {
        write_lock(&self.inner.socket).take()
    }

    /// `true` while a socket is open, authenticated or not.
    pub fn is_connected(&self) -> bool {
        self.current_socket()
            .is_some_and(|s| s.is_active())
    }

    /// `true` when commands can be sent.
    pub fn is_authenticated(&self) -> bool {
        self.current_socket()
            .is_some_and(|s| s.is_authenticated())
    }

    /// Peer address of the open socket.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.current_socket()
            .map(|s| s.remote_addr())
    }

    /// Reconnect attempts since the last successful authentication.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner
            .reconnect_attempts
            .load(Ordering::SeqCst)
    }

    /// `true` if the server answered the latest connection with a rude rejection.
    pub fn was_rejected(&self) -> bool {
        self.inner
            .rejected
            .load(Ordering::SeqCst)
    }

    /// Wait until every queued listener notification has run.
    pub async fn wait_for_listeners(&self) {
        self.inner
            .dispatcher
            .wait_idle()
            .await
    }

    fn notify_connection_listeners<F>(&self, label: &'static str, notify: F)
    where
        F: Fn(&dyn ConnectionListener, &EslClient) + Send + 'static,
    {
        let listeners = read_lock(&self.inner.connection_listeners).clone();
        if listeners.is_empty() {
            return;
        }
        let client = self.clone();
        self.inner
            .dispatcher
            .spawn(label, move || {
                for (index, listener) in listeners
                    .iter()
                    .enumerate()
                {
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        notify(listener.as_ref(), &client)
                    }));
                    if outcome.is_err() {
                        tracing::error!("[DISPATCH] {} {} listener panicked", index, label);
                    }
                }
            });
    }

    fn dispatch_event(&self, event: EslEvent) {
        let listeners = read_lock(&self.inner.event_listeners).clone();
        if listeners.is_empty() {
            return;
        }
        self.inner
            .dispatcher
            .spawn("event", move || notify_event_listeners(&listeners, &event));
    }

    /// Dial, wait for the auth handshake, and report the outcome.
    ///
    /// An existing session is closed first. Cancels any reconnect that was
    /// scheduled. A dial failure schedules a reconnect when enabled; the
    /// returned error is the dial error either way.
    pub async fn connect(&self) -> EslResult<()> {
        let generation = self.cancel_pending_reconnect();
        self.connect_inner(generation)
            .await
    }

    /// Boxed form of the connect path, for the reconnect task.
    fn connect_boxed(
        self,
        generation: u64,
    ) -> Pin<Box<dyn Future<Output = EslResult<()>> + Send + 'static>> {
        Box::pin(async move {
            self.connect_inner(generation)
                .await
        })
    }

    /// Connect path run under `connect_lock`.
    ///
    /// `generation` is the reconnect generation the caller was started with;
    /// if a `close()` or a newer `connect()` bumped it while this call waited
    /// for the lock, nothing is dialed.
    async fn connect_inner(&self, generation: u64) -> EslResult<()> {
        let _guard = self
            .inner
            .connect_lock
            .lock()
            .await;

        if self.reconnect_generation() != generation {
            debug!("[CONNECT] connect superseded before dialing");
            return Err(EslError::ConnectionClosed);
        }

        if let Some(old) = self.take_socket() {
            info!("[CONNECT] Client is connected, will close first.");
            self.close_socket(old)
                .await?;
        }

        self.inner
            .rejected
            .store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Dialing);
        info!(
            "[CONNECT] Connecting to FreeSWITCH at {}:{}",
            self.inner.host, self.inner.port
        );

        let stream = match tcp_connect_with_timeout(
            &self.inner.host,
            self.inner.port,
            self.inner.dial_timeout,
        )
        .await
        {
            Ok(stream) => stream,
            Err(e) => {
                self.notify_connection_listeners("connect_failure", |l, c| l.connect_failure(c));
                self.schedule_reconnect();
                return Err(e);
            }
        };

        let listener = Arc::new(ClientProtocolListener {
            client: Arc::downgrade(&self.inner),
        });
        let (socket, reader) =
            SocketConnection::new(stream, &self.inner.password, &self.inner.options)?;
        *write_lock(&self.inner.socket) = Some(Arc::clone(&socket));
        socket.spawn_reader(reader, listener);
        self.set_state(ConnectionState::AwaitingAuth);
        self.notify_connection_listeners("connected", |l, c| l.connected(c));

        let auth = match timeout(self.inner.dial_timeout, socket.wait_for_auth()).await {
            Ok(auth) => auth,
            Err(_) => {
                let timeout_ms = self
                    .inner
                    .dial_timeout
                    .as_millis() as u64;
                warn!("[AUTH] no auth outcome within {}ms", timeout_ms);
                socket.shutdown();
                return Err(EslError::Timeout { timeout_ms });
            }
        };

        match auth {
            AuthState::Authenticated => {
                self.inner
                    .reconnect_attempts
                    .store(0, Ordering::SeqCst);
                self.transition(ConnectionState::AwaitingAuth, ConnectionState::Authenticated);
                info!(
                    "[AUTH] Successfully connected and authenticated to {}",
                    socket.remote_addr()
                );
                self.notify_connection_listeners("authenticated", |l, c| l.authenticated(true, c));
                Ok(())
            }
            AuthState::Failed(reply_text) => {
                self.transition(ConnectionState::AwaitingAuth, ConnectionState::AuthFailed);
                warn!("[AUTH] Authentication failed: {}", reply_text);
                self.notify_connection_listeners("authenticated", |l, c| l.authenticated(false, c));
                Err(EslError::auth_failed(reply_text))
            }
            AuthState::Closed | AuthState::Pending => Err(EslError::ConnectionClosed),
        }
    }

    /// Invalidate any scheduled reconnect; returns the new generation.
    fn cancel_pending_reconnect(&self) -> u64 {
        self.inner
            .reconnect_generation
            .fetch_add(1, Ordering::SeqCst)
            + 1
    }

    fn reconnect_generation(&self) -> u64 {
        self.inner
            .reconnect_generation
            .load(Ordering::SeqCst)
    }

    /// Queue a reconnect after the configured interval, if policy allows.
    fn schedule_reconnect(&self) {
        let options = &self.inner.options;
        if !options.reconnect_enabled() {
            self.set_state(ConnectionState::Closed);
            return;
        }

        let scheduled = self
            .inner
            .reconnect_attempts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                options
                    .may_reconnect(n)
                    .then(|| n.saturating_add(1))
            });
        let attempt = match scheduled {
            Ok(previous) => previous.saturating_add(1),
            Err(attempts) => {
                warn!(
                    "[RECONNECT] giving up after {} attempts",
                    attempts
                );
                self.set_state(ConnectionState::Closed);
                return;
            }
        };

        let generation = self.cancel_pending_reconnect();
        let interval = options.reconnect_interval;
        self.set_state(ConnectionState::ReconnectScheduled);
        info!(
            "[RECONNECT] attempt {} in {}ms",
            attempt,
            interval.as_millis()
        );

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner
                .reconnect_generation
                .load(Ordering::SeqCst)
                != generation
            {
                debug!("[RECONNECT] attempt {} superseded", attempt);
                return;
            }
            let client = EslClient { inner };
            if let Err(e) = client
                .connect_boxed(generation)
                .await
            {
                warn!("[RECONNECT] Reconnection failure, cause {}", e);
            }
        });
    }

    /// Close path for a socket whose reader task has exited.
    fn handle_socket_closed(&self, socket: &Arc<SocketConnection>) {
        let current = {
            let mut slot = write_lock(&self.inner.socket);
            let current = slot
                .as_ref()
                .is_some_and(|s| Arc::ptr_eq(s, socket));
            if current {
                *slot = None;
            }
            current
        };

        self.notify_connection_listeners("disconnected", |l, c| l.disconnected(c));

        if !current {
            debug!("[CONNECT] stale socket {} closed", socket.remote_addr());
            return;
        }
        if socket.close_requested() {
            self.set_state(ConnectionState::Closed);
            return;
        }
        self.schedule_reconnect();
    }

    /// Send `exit` if the session is usable, then stop the socket.
    async fn close_socket(&self, socket: Arc<SocketConnection>) -> EslResult<()> {
        socket.request_close();
        let result = if socket.is_authenticated() {
            self.send_command_on(&socket, EslCommand::Exit)
                .await
                .map(|response| debug!("[CONNECT] exit reply: {}", response.reply_text()))
        } else {
            Ok(())
        };
        socket.shutdown();
        match result {
            Err(EslError::ConnectionClosed) => Ok(()),
            other => other,
        }
    }

    /// End the session: send `exit`, close the socket, and cancel any pending
    /// reconnect. Closing an unconnected client only cancels the reconnect.
    ///
    /// A connect already in progress (including a reconnect) is allowed to
    /// finish first; the session it produces is then closed.
    pub async fn close(&self) -> EslResult<()> {
        self.cancel_pending_reconnect();
        let _guard = self
            .inner
            .connect_lock
            .lock()
            .await;
        self.cancel_pending_reconnect();
        let result = match self.take_socket() {
            Some(socket) => {
                self.close_socket(socket)
                    .await
            }
            None => Ok(()),
        };
        self.set_state(ConnectionState::Closed);
        result
    }

    fn authenticated_socket(&self) -> EslResult<Arc<SocketConnection>> {
        self.current_socket()
            .filter(|s| s.is_authenticated())
            .ok_or(EslError::NotConnected)
    }

    async fn send_command_on(
        &self,
        socket: &SocketConnection,
        command: EslCommand,
    ) -> EslResult<CommandResponse> {
        let line = command.wire_line()?;
        if self
            .inner
            .options
            .enabled(Level::DEBUG)
        {
            debug!("[SEND] {}", command);
        }
        let reply = socket
            .send_sync_single_line(&line)
            .await?
            .ok_or(EslError::ConnectionClosed)?;
        Ok(CommandResponse::new(command.to_string(), reply))
    }

    async fn send_command(&self, command: EslCommand) -> EslResult<CommandResponse> {
        let socket = self.authenticated_socket()?;
        self.send_command_on(&socket, command)
            .await
    }

    /// Subscribe to events: `events` is a space-separated list of event names, or `ALL`.
    ///
    /// Only [`EventFormat::Plain`] is supported; any other format fails
    /// without sending anything.
    pub async fn set_event_subscriptions(
        &self,
        format: EventFormat,
        events: &str,
    ) -> EslResult<CommandResponse> {
        if format != EventFormat::Plain {
            return Err(EslError::UnsupportedEventFormat {
                format: format.to_string(),
            });
        }
        self.send_command(EslCommand::Events {
            format,
            events: events.to_string(),
        })
        .await
    }

    /// Cancel every event subscription (`noevents`).
    pub async fn cancel_event_subscriptions(&self) -> EslResult<CommandResponse> {
        self.send_command(EslCommand::NoEvents)
            .await
    }

    /// Only deliver events whose `header` equals `value`.
    pub async fn add_event_filter(&self, header: &str, value: &str) -> EslResult<CommandResponse> {
        self.send_command(EslCommand::Filter {
            header: header.to_string(),
            value: value.to_string(),
        })
        .await
    }

    /// Remove filters on `header`; all of them when `value` is `None`.
    pub async fn delete_event_filter(
        &self,
        header: &str,
        value: Option<&str>,
    ) -> EslResult<CommandResponse> {
        self.send_command(EslCommand::FilterDelete {
            header: header.to_string(),
            value: value.map(str::to_string),
        })
        .await
    }

    /// Forward server log lines at `level` and above (`log <level>`).
    pub async fn set_logging_level(&self, level: &str) -> EslResult<CommandResponse> {
        self.send_command(EslCommand::Log {
            level: level.to_string(),
        })
        .await
    }

    /// Stop forwarding server log lines (`nolog`).
    pub async fn cancel_logging(&self) -> EslResult<CommandResponse> {
        self.send_command(EslCommand::NoLog)
            .await
    }

    /// Run an API command and wait for its output (`api <command> [arg]`).
    pub async fn send_sync_api_command(
        &self,
        command: &str,
        arg: Option<&str>,
    ) -> EslResult<EslMessage> {
        let response = self
            .send_command(EslCommand::Api {
                command: join_command(command, arg),
            })
            .await?;
        Ok(response
            .response()
            .clone())
    }

    /// Run an API command in the background (`bgapi <command> [arg]`) and
    /// return its Job-UUID. The result arrives later as a `BACKGROUND_JOB`
    /// event carrying the same Job-UUID.
    pub async fn send_async_api_command(
        &self,
        command: &str,
        arg: Option<&str>,
    ) -> EslResult<String> {
        let response = self
            .send_command(EslCommand::BgApi {
                command: join_command(command, arg),
            })
            .await?;
        response
            .response()
            .job_uuid()
            .filter(|uuid| !uuid.is_empty())
            .map(str::to_string)
            .ok_or(EslError::MissingJobUuid)
    }

    /// Send a `sendmsg` command.
    pub async fn send_message(&self, message: &SendMsg) -> EslResult<CommandResponse> {
        self.send_lines(message.lines(), message.to_string())
            .await
    }

    /// Send a `sendevent` command.
    pub async fn send_event(&self, event: &SendEvent) -> EslResult<CommandResponse> {
        self.send_lines(event.lines(), event.to_string())
            .await
    }

    async fn send_lines(&self, lines: &[String], label: String) -> EslResult<CommandResponse> {
        let socket = self.authenticated_socket()?;
        if self
            .inner
            .options
            .enabled(Level::DEBUG)
        {
            debug!("[SEND] {}", label);
        }
        let reply = socket
            .send_sync_multi_line(lines)
            .await?
            .ok_or(EslError::ConnectionClosed)?;
        Ok(CommandResponse::new(label, reply))
    }
}

fn join_command(command: &str, arg: Option<&str>) -> String {
    match arg.filter(|a| !a.is_empty()) {
        Some(arg) => format!("{} {}", command, arg),
        None => command.to_string(),
    }
}

/// Bridges socket callbacks back to the owning client without keeping it alive.
struct ClientProtocolListener {
    client: Weak<ClientInner>,
}

impl ClientProtocolListener {
    fn client(&self) -> Option<EslClient> {
        self.client
            .upgrade()
            .map(|inner| EslClient { inner })
    }
}

impl ProtocolListener for ClientProtocolListener {
    fn auth_response_received(&self, response: &CommandResponse) {
        debug!(
            "[AUTH] Auth response success={}, message=[{}]",
            response.is_ok(),
            response.reply_text()
        );
    }

    fn event_received(&self, event: EslEvent) {
        if let Some(client) = self.client() {
            client.dispatch_event(event);
        }
    }

    fn disconnect_notice(&self, socket: &Arc<SocketConnection>) {
        info!("[CONNECT] {} announced disconnect", socket.remote_addr());
    }

    fn rude_rejection(&self, socket: &Arc<SocketConnection>) {
        let Some(client) = self.client() else {
            return;
        };
        warn!("[CONNECT] {} rejected the connection", socket.remote_addr());
        client
            .inner
            .rejected
            .store(true, Ordering::SeqCst);
        client.notify_connection_listeners("rejected", |l, c| l.rejected(c));
    }

    fn socket_closed(&self, socket: &Arc<SocketConnection>) {
        if let Some(client) = self.client() {
            client.handle_socket_closed(socket);
        }
    }
}
