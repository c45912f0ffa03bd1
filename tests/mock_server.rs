//! Client behavior against an in-process fake ESL server.

use freeswitch_esl_client::{
    ConnectionListener, ConnectionState, EslClient, EslClientOptions, EslError, EslEvent,
    EventFormat, EventListener, ListenerError, SendEvent, SendMsg,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

const PASSWORD: &str = "ClueCon";
const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn command_reply(reply_text: &str) -> String {
    format!("Content-Type: command/reply\nReply-Text: {}\n\n", reply_text)
}

fn api_response(body: &str) -> String {
    format!(
        "Content-Type: api/response\nContent-Length: {}\n\n{}",
        body.len(),
        body
    )
}

fn plain_event(body: &str) -> String {
    format!(
        "Content-Type: text/event-plain\nContent-Length: {}\n\n{}",
        body.len(),
        body
    )
}

/// Server side of one accepted connection.
struct Peer {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Peer {
    async fn accept(listener: &TcpListener) -> Peer {
        let (stream, _) = timeout(WAIT, listener.accept())
            .await
            .expect("client never dialed")
            .unwrap();
        let (read_half, writer) = stream.into_split();
        Peer {
            reader: BufReader::new(read_half),
            writer,
        }
    }

    /// Accept, challenge, and answer the `auth` command.
    async fn accept_and_auth(listener: &TcpListener, reply_text: &str) -> Peer {
        let mut peer = Peer::accept(listener).await;
        peer.send("Content-Type: auth/request\n\n")
            .await;
        assert_eq!(
            peer.read_command()
                .await,
            vec![format!("auth {}", PASSWORD)]
        );
        peer.send(&command_reply(reply_text))
            .await;
        peer
    }

    async fn send(&mut self, frame: &str) {
        self.writer
            .write_all(frame.as_bytes())
            .await
            .unwrap();
    }

    /// Lines of the next command, up to its terminating blank line.
    async fn read_command(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let n = timeout(WAIT, self.reader.read_line(&mut line))
                .await
                .expect("client sent no command")
                .unwrap();
            if n == 0 || line == "\n" {
                return lines;
            }
            lines.push(
                line.trim_end_matches('\n')
                    .to_string(),
            );
        }
    }

    /// `true` if the client wrote nothing within `window`.
    async fn is_silent_for(&mut self, window: Duration) -> bool {
        if !self
            .reader
            .buffer()
            .is_empty()
        {
            return false;
        }
        timeout(window, self.reader.fill_buf())
            .await
            .is_err()
    }
}

async fn bind() -> (TcpListener, u16) {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap();
    let port = listener
        .local_addr()
        .unwrap()
        .port();
    (listener, port)
}

fn client(port: u16, options: EslClientOptions) -> EslClient {
    EslClient::new("127.0.0.1", port, PASSWORD, Duration::from_secs(2), options)
}

fn no_reconnect() -> EslClientOptions {
    EslClientOptions {
        auto_reconnect: false,
        ..Default::default()
    }
}

async fn connected(options: EslClientOptions) -> (EslClient, Peer, TcpListener) {
    let (listener, port) = bind().await;
    let client = client(port, options);
    let (result, peer) = tokio::join!(
        client.connect(),
        Peer::accept_and_auth(&listener, "+OK accepted")
    );
    result.unwrap();
    (client, peer, listener)
}

async fn wait_for_state(client: &EslClient, wanted: ConnectionState) {
    let mut changes = client.state_changes();
    timeout(WAIT, changes.wait_for(|state| *state == wanted))
        .await
        .unwrap_or_else(|_| panic!("never reached {:?}, stuck at {:?}", wanted, client.state()))
        .unwrap();
}

#[derive(Debug, PartialEq)]
enum Seen {
    Event(String),
    Job(String),
}

struct ChannelListener(mpsc::UnboundedSender<Seen>);

impl EventListener for ChannelListener {
    fn event_received(&self, event: &EslEvent) -> Result<(), ListenerError> {
        let _ = self
            .0
            .send(Seen::Event(event.event_name().to_string()));
        Ok(())
    }

    fn background_job_result_received(&self, event: &EslEvent) -> Result<(), ListenerError> {
        let _ = self.0.send(Seen::Job(format!(
            "{}:{}",
            event
                .job_uuid()
                .unwrap_or(""),
            event
                .body_lines()
                .join("|")
        )));
        Ok(())
    }
}

struct BrokenListener;

impl EventListener for BrokenListener {
    fn event_received(&self, _event: &EslEvent) -> Result<(), ListenerError> {
        Err("broken listener".into())
    }

    fn background_job_result_received(&self, _event: &EslEvent) -> Result<(), ListenerError> {
        Err("broken listener".into())
    }
}

#[derive(Default)]
struct Lifecycle {
    connect_failures: AtomicUsize,
    connected: AtomicUsize,
    authenticated: AtomicUsize,
    auth_rejected: AtomicUsize,
    disconnected: AtomicUsize,
    rejected: AtomicUsize,
}

impl ConnectionListener for Lifecycle {
    fn connect_failure(&self, _client: &EslClient) {
        self.connect_failures
            .fetch_add(1, Ordering::SeqCst);
    }

    fn connected(&self, _client: &EslClient) {
        self.connected
            .fetch_add(1, Ordering::SeqCst);
    }

    fn authenticated(&self, authenticated: bool, _client: &EslClient) {
        if authenticated {
            self.authenticated
                .fetch_add(1, Ordering::SeqCst);
        } else {
            self.auth_rejected
                .fetch_add(1, Ordering::SeqCst);
        }
    }

    fn disconnected(&self, _client: &EslClient) {
        self.disconnected
            .fetch_add(1, Ordering::SeqCst);
    }

    fn rejected(&self, _client: &EslClient) {
        self.rejected
            .fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn auth_success_reaches_authenticated() {
    let lifecycle = Arc::new(Lifecycle::default());
    let (listener, port) = bind().await;
    let client = client(port, no_reconnect());
    client.add_connection_listener(lifecycle.clone());

    let (result, _peer) = tokio::join!(
        client.connect(),
        Peer::accept_and_auth(&listener, "+OK accepted")
    );
    result.unwrap();

    assert!(client.is_authenticated());
    assert_eq!(client.state(), ConnectionState::Authenticated);
    assert!(client
        .remote_addr()
        .is_some());

    client
        .wait_for_listeners()
        .await;
    assert_eq!(lifecycle.connected.load(Ordering::SeqCst), 1);
    assert_eq!(lifecycle.authenticated.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn auth_failure_reports_reply_text() {
    let lifecycle = Arc::new(Lifecycle::default());
    let (listener, port) = bind().await;
    let client = client(port, no_reconnect());
    client.add_connection_listener(lifecycle.clone());

    let (result, _peer) = tokio::join!(
        client.connect(),
        Peer::accept_and_auth(&listener, "-ERR invalid")
    );

    let err = result.unwrap_err();
    assert!(matches!(err, EslError::AuthenticationFailed { .. }));
    assert!(err
        .to_string()
        .contains("-ERR invalid"));
    assert!(!client.is_authenticated());
    assert_eq!(client.state(), ConnectionState::AuthFailed);

    client
        .wait_for_listeners()
        .await;
    assert_eq!(lifecycle.auth_rejected.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn sync_api_command_round_trip() {
    let (client, mut peer, _listener) = connected(no_reconnect()).await;

    let server = async {
        assert_eq!(
            peer.read_command()
                .await,
            vec!["api sofia status profile internal"]
        );
        peer.send(&api_response("UP 0 years\nSessions: 0\n"))
            .await;
    };
    let (reply, _) = tokio::join!(
        client.send_sync_api_command("sofia", Some("status profile internal")),
        server
    );

    let reply = reply.unwrap();
    assert_eq!(reply.content_type(), Some("api/response"));
    assert_eq!(reply.body_lines(), &["UP 0 years", "Sessions: 0"]);
}

#[tokio::test]
async fn async_api_command_returns_job_uuid() {
    let (client, mut peer, _listener) = connected(no_reconnect()).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.add_event_listener(Arc::new(ChannelListener(tx)));

    let server = async {
        assert_eq!(
            peer.read_command()
                .await,
            vec!["bgapi status"]
        );
        peer.send("Content-Type: command/reply\nReply-Text: +OK Job-UUID: 7f4d\nJob-UUID: 7f4d\n\n")
            .await;
    };
    let (job_uuid, _) = tokio::join!(client.send_async_api_command("status", None), server);
    assert_eq!(job_uuid.unwrap(), "7f4d");

    peer.send(&plain_event(
        "Event-Name: BACKGROUND_JOB\nJob-UUID: 7f4d\nContent-Length: 9\n\n+OK done\n",
    ))
    .await;
    let seen = timeout(WAIT, rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seen, Seen::Job("7f4d:+OK done".to_string()));
}

#[tokio::test]
async fn async_api_command_without_job_uuid() {
    let (client, mut peer, _listener) = connected(no_reconnect()).await;

    let server = async {
        peer.read_command()
            .await;
        peer.send(&command_reply("-ERR no such command"))
            .await;
    };
    let (result, _) = tokio::join!(client.send_async_api_command("bogus", None), server);
    assert!(matches!(result, Err(EslError::MissingJobUuid)));
}

#[tokio::test]
async fn concurrent_sends_are_serialized() {
    let (client, mut peer, _listener) = connected(no_reconnect()).await;

    let server = async {
        let first = peer
            .read_command()
            .await;
        assert!(
            peer.is_silent_for(Duration::from_millis(200))
                .await,
            "second command written before the first reply"
        );
        peer.send(&api_response(&format!("reply to {}\n", first[0])))
            .await;

        let second = peer
            .read_command()
            .await;
        assert_ne!(first, second);
        peer.send(&api_response(&format!("reply to {}\n", second[0])))
            .await;
    };
    let (a, b, _) = tokio::join!(
        client.send_sync_api_command("status", None),
        client.send_sync_api_command("version", None),
        server
    );

    assert_eq!(a.unwrap().body_lines(), &["reply to api status"]);
    assert_eq!(b.unwrap().body_lines(), &["reply to api version"]);
}

#[tokio::test]
async fn xml_subscription_sends_nothing() {
    let (client, mut peer, _listener) = connected(no_reconnect()).await;

    let result = client
        .set_event_subscriptions(EventFormat::Xml, "ALL")
        .await;
    assert!(matches!(result, Err(EslError::UnsupportedEventFormat { .. })));
    assert!(
        peer.is_silent_for(Duration::from_millis(200))
            .await
    );

    let server = async {
        assert_eq!(
            peer.read_command()
                .await,
            vec!["event plain CHANNEL_CREATE HEARTBEAT"]
        );
        peer.send(&command_reply("+OK event listener enabled plain"))
            .await;
    };
    let (response, _) = tokio::join!(
        client.set_event_subscriptions(EventFormat::Plain, "CHANNEL_CREATE HEARTBEAT"),
        server
    );
    assert!(response
        .unwrap()
        .is_ok());
}

#[tokio::test]
async fn filter_and_log_commands() {
    let (client, mut peer, _listener) = connected(no_reconnect()).await;

    let server = async {
        for expected in [
            "filter Unique-ID abc",
            "filter delete Unique-ID",
            "noevents",
            "log debug",
            "nolog",
        ] {
            assert_eq!(
                peer.read_command()
                    .await,
                vec![expected]
            );
            peer.send(&command_reply("+OK"))
                .await;
        }
    };
    let commands = async {
        assert!(client
            .add_event_filter("Unique-ID", "abc")
            .await
            .unwrap()
            .is_ok());
        assert!(client
            .delete_event_filter("Unique-ID", None)
            .await
            .unwrap()
            .is_ok());
        assert!(client
            .cancel_event_subscriptions()
            .await
            .unwrap()
            .is_ok());
        assert!(client
            .set_logging_level("debug")
            .await
            .unwrap()
            .is_ok());
        assert!(client
            .cancel_logging()
            .await
            .unwrap()
            .is_ok());
    };
    tokio::join!(commands, server);
}

#[tokio::test]
async fn sendmsg_and_sendevent_wire_format() {
    let (client, mut peer, _listener) = connected(no_reconnect()).await;

    let server = async {
        assert_eq!(
            peer.read_command()
                .await,
            vec![
                "sendmsg 6a4f",
                "call-command: execute",
                "execute-app-name: playback",
                "execute-app-arg: /tmp/hello.wav",
            ]
        );
        peer.send(&command_reply("+OK"))
            .await;
        assert_eq!(
            peer.read_command()
                .await,
            vec!["sendevent CUSTOM", "Event-Subclass: demo::ping"]
        );
        peer.send(&command_reply("-ERR denied"))
            .await;
    };
    let commands = async {
        let msg = SendMsg::new(Some("6a4f"))
            .call_command("execute")
            .execute_app_name("playback")
            .execute_app_arg("/tmp/hello.wav");
        let response = client
            .send_message(&msg)
            .await
            .unwrap();
        assert!(response.is_ok());
        assert_eq!(response.command(), "call-command: execute");

        let event = SendEvent::new("CUSTOM").add_line("Event-Subclass", "demo::ping");
        let response = client
            .send_event(&event)
            .await
            .unwrap();
        assert!(!response.is_ok());
        assert_eq!(response.reply_text(), "-ERR denied");
    };
    tokio::join!(commands, server);
}

#[tokio::test]
async fn events_reach_every_listener_despite_errors() {
    let (client, mut peer, _listener) = connected(no_reconnect()).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.add_event_listener(Arc::new(BrokenListener));
    client.add_event_listener(Arc::new(ChannelListener(tx)));

    peer.send(&plain_event(
        "Event-Name: HEARTBEAT\nUp-Time: 0%20years\nEvent-Date-Timestamp: 1700000000000000\n",
    ))
    .await;
    peer.send(&plain_event("Event-Name: CHANNEL_CREATE\n"))
        .await;

    let mut seen = Vec::new();
    for _ in 0..2 {
        seen.push(
            timeout(WAIT, rx.recv())
                .await
                .unwrap()
                .unwrap(),
        );
    }
    seen.sort_by_key(|s| format!("{:?}", s));
    assert_eq!(
        seen,
        vec![
            Seen::Event("CHANNEL_CREATE".into()),
            Seen::Event("HEARTBEAT".into())
        ]
    );
    client
        .wait_for_listeners()
        .await;
}

#[tokio::test]
async fn socket_close_releases_blocked_send() {
    let (client, mut peer, _listener) = connected(no_reconnect()).await;

    let server = async {
        peer.read_command()
            .await;
        drop(peer);
    };
    let (result, _) = tokio::join!(client.send_sync_api_command("status", None), server);

    assert!(matches!(result, Err(EslError::ConnectionClosed)));
    wait_for_state(&client, ConnectionState::Closed).await;
    assert!(!client.is_connected());
}

#[tokio::test]
async fn abandoned_command_reply_is_not_misattributed() {
    let (client, mut peer, _listener) = connected(no_reconnect()).await;

    let first = timeout(
        Duration::from_millis(100),
        client.send_sync_api_command("first", None),
    )
    .await;
    assert!(first.is_err());
    assert_eq!(
        peer.read_command()
            .await,
        vec!["api first"]
    );
    let _ = peer
        .writer
        .write_all(api_response("reply to api first").as_bytes())
        .await;

    let second = client
        .send_sync_api_command("second", None)
        .await;
    assert!(
        matches!(second, Err(EslError::NotConnected) | Err(EslError::ConnectionClosed)),
        "{:?}",
        second
    );
    wait_for_state(&client, ConnectionState::Closed).await;
    assert!(!client.is_connected());
}

#[tokio::test]
async fn close_during_reconnect_keeps_session_closed() {
    let options = EslClientOptions {
        reconnect_interval: Duration::from_millis(50),
        ..Default::default()
    };
    let (client, peer, listener) = connected(options).await;
    drop(peer);

    // Hold the reconnect in its auth step while close() is called.
    let mut second = Peer::accept(&listener).await;
    wait_for_state(&client, ConnectionState::AwaitingAuth).await;
    let closing = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .close()
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    second
        .send("Content-Type: auth/request\n\n")
        .await;
    assert_eq!(
        second
            .read_command()
            .await,
        vec![format!("auth {}", PASSWORD)]
    );
    second
        .send(&command_reply("+OK accepted"))
        .await;

    assert_eq!(
        second
            .read_command()
            .await,
        vec!["exit"]
    );
    second
        .send(&command_reply("+OK bye"))
        .await;

    timeout(WAIT, closing)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(!client.is_connected());
    assert!(timeout(Duration::from_millis(300), listener.accept())
        .await
        .is_err());
}

#[tokio::test]
async fn empty_builder_line_is_rejected() {
    let (client, mut peer, _listener) = connected(no_reconnect()).await;

    let event = SendEvent::new("CUSTOM").add_body("");
    let result = client
        .send_event(&event)
        .await;

    assert!(matches!(result, Err(EslError::ProtocolError { .. })));
    assert!(peer
        .is_silent_for(Duration::from_millis(100))
        .await);
    assert!(client.is_authenticated());
}

#[tokio::test]
async fn reconnects_no_sooner_than_interval() {
    let interval = Duration::from_secs(1);
    let lifecycle = Arc::new(Lifecycle::default());
    let options = EslClientOptions {
        reconnect_interval: interval,
        ..Default::default()
    };
    let (client, peer, listener) = connected(options).await;
    client.add_connection_listener(lifecycle.clone());

    let closed_at = Instant::now();
    drop(peer);

    wait_for_state(&client, ConnectionState::ReconnectScheduled).await;
    let _second = Peer::accept_and_auth(&listener, "+OK accepted").await;
    assert!(closed_at.elapsed() >= interval);

    wait_for_state(&client, ConnectionState::Authenticated).await;
    assert_eq!(client.reconnect_attempts(), 0);

    client
        .wait_for_listeners()
        .await;
    assert_eq!(lifecycle.disconnected.load(Ordering::SeqCst), 1);
    assert_eq!(lifecycle.authenticated.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reconnect_attempts_are_bounded() {
    let (listener, port) = bind().await;
    drop(listener);

    let lifecycle = Arc::new(Lifecycle::default());
    let client = client(
        port,
        EslClientOptions {
            reconnect_interval: Duration::from_millis(50),
            max_reconnect_attempts: 2,
            ..Default::default()
        },
    );
    client.add_connection_listener(lifecycle.clone());

    assert!(client
        .connect()
        .await
        .is_err());
    wait_for_state(&client, ConnectionState::Closed).await;

    client
        .wait_for_listeners()
        .await;
    assert_eq!(client.reconnect_attempts(), 2);
    assert_eq!(lifecycle.connect_failures.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn close_sends_exit_and_suppresses_reconnect() {
    let options = EslClientOptions {
        reconnect_interval: Duration::from_millis(50),
        ..Default::default()
    };
    let (client, mut peer, listener) = connected(options).await;

    let server = async {
        assert_eq!(
            peer.read_command()
                .await,
            vec!["exit"]
        );
        peer.send(&command_reply("+OK bye"))
            .await;
    };
    let (result, _) = tokio::join!(client.close(), server);
    result.unwrap();

    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(!client.is_connected());
    assert!(timeout(Duration::from_millis(300), listener.accept())
        .await
        .is_err());
}

#[tokio::test]
async fn rude_rejection_is_surfaced() {
    let lifecycle = Arc::new(Lifecycle::default());
    let (listener, port) = bind().await;
    let client = client(port, no_reconnect());
    client.add_connection_listener(lifecycle.clone());

    let server = async {
        let mut peer = Peer::accept(&listener).await;
        let notice = "Access Denied, go away.\n";
        peer.send(&format!(
            "Content-Type: text/rude-rejection\nContent-Length: {}\n\n{}",
            notice.len(),
            notice
        ))
        .await;
        drop(peer);
    };
    let (result, _) = tokio::join!(client.connect(), server);

    assert!(matches!(result, Err(EslError::ConnectionClosed)));
    assert!(client.was_rejected());
    wait_for_state(&client, ConnectionState::Closed).await;

    client
        .wait_for_listeners()
        .await;
    assert_eq!(lifecycle.rejected.load(Ordering::SeqCst), 1);
    assert_eq!(lifecycle.disconnected.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn connect_replaces_existing_session() {
    let (client, mut first, listener) = connected(no_reconnect()).await;

    let server = async {
        assert_eq!(
            first
                .read_command()
                .await,
            vec!["exit"]
        );
        first
            .send(&command_reply("+OK bye"))
            .await;
        Peer::accept_and_auth(&listener, "+OK accepted").await
    };
    let (result, _second) = tokio::join!(client.connect(), server);

    result.unwrap();
    assert!(client.is_authenticated());
    assert_eq!(client.state(), ConnectionState::Authenticated);
}
