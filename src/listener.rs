//! Listener contracts for inbound traffic and connection lifecycle

use crate::{
    client::EslClient, command::CommandResponse, connection::SocketConnection, event::EslEvent,
};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

/// Error type listener callbacks may return; it is logged and otherwise ignored.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Receives server-pushed events.
///
/// Callbacks run on a blocking worker, never on the socket reader, so a slow
/// listener cannot stall decoding or command replies. Listeners are called in
/// registration order for each event; ordering *between* events is not
/// guaranteed.
pub trait EventListener: Send + Sync {
    /// Any event other than `BACKGROUND_JOB`.
    fn event_received(&self, event: &EslEvent) -> Result<(), ListenerError>;

    /// A `BACKGROUND_JOB` event carrying the result of
    /// [`EslClient::send_async_api_command`]; correlate it through
    /// [`EslEvent::job_uuid`].
    fn background_job_result_received(&self, event: &EslEvent) -> Result<(), ListenerError>;
}

/// Receives connection lifecycle notifications. All methods default to no-ops.
pub trait ConnectionListener: Send + Sync {
    /// Dialing the server failed.
    fn connect_failure(&self, _client: &EslClient) {}

    /// The TCP connection is up; authentication has not happened yet.
    fn connected(&self, _client: &EslClient) {}

    /// The server answered the `auth` command.
    fn authenticated(&self, _authenticated: bool, _client: &EslClient) {}

    /// The socket closed. Fires once per socket.
    fn disconnected(&self, _client: &EslClient) {}

    /// The server refused the connection with a rude rejection notice.
    fn rejected(&self, _client: &EslClient) {}
}

/// Internal sink for everything the socket reader does not handle itself.
pub(crate) trait ProtocolListener: Send + Sync + 'static {
    fn auth_response_received(&self, response: &CommandResponse);

    fn event_received(&self, event: EslEvent);

    fn disconnect_notice(&self, socket: &Arc<SocketConnection>);

    fn rude_rejection(&self, socket: &Arc<SocketConnection>);

    fn socket_closed(&self, socket: &Arc<SocketConnection>);
}

/// Deliver one event to every listener, in order.
///
/// `BACKGROUND_JOB` goes to the job-result method, everything else to
/// `event_received`. An error or panic from one listener is logged with its
/// position and does not stop delivery to the rest.
pub(crate) fn notify_event_listeners(listeners: &[Arc<dyn EventListener>], event: &EslEvent) {
    let background_job = event.is_background_job();
    for (index, listener) in listeners
        .iter()
        .enumerate()
    {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            if background_job {
                listener.background_job_result_received(event)
            } else {
                listener.event_received(event)
            }
        }));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) if background_job => error!(
                "[DISPATCH] {} Error caught notifying listener of job result {}: {}",
                index, event, e
            ),
            Ok(Err(e)) => error!(
                "[DISPATCH] {} Error caught notifying listener of event {}: {}",
                index, event, e
            ),
            Err(_) => error!(
                "[DISPATCH] {} Listener panicked handling {}",
                index, event
            ),
        }
    }
}
