use std::fmt;

/// A `sendmsg` command, optionally targeting a channel by UUID.
///
/// ```
/// use freeswitch_esl_client::SendMsg;
///
/// let msg = SendMsg::new(Some("6a4f1d0e"))
///     .call_command("execute")
///     .execute_app_name("playback")
///     .execute_app_arg("/tmp/welcome.wav")
///     .event_lock();
/// assert_eq!(msg.lines()[0], "sendmsg 6a4f1d0e");
/// assert_eq!(msg.to_string(), "call-command: execute");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMsg {
    lines: Vec<String>,
    has_uuid: bool,
}

impl SendMsg {
    /// Start a message. `None` (or an empty UUID) addresses the session's own channel.
    pub fn new(uuid: Option<&str>) -> Self {
        match uuid.filter(|u| !u.is_empty()) {
            Some(uuid) => Self {
                lines: vec![format!("sendmsg {}", uuid)],
                has_uuid: true,
            },
            None => Self {
                lines: vec!["sendmsg".to_string()],
                has_uuid: false,
            },
        }
    }

    /// `call-command: <command>` (`execute`, `hangup`, ...)
    pub fn call_command(self, command: &str) -> Self {
        self.line("call-command", command)
    }

    /// `execute-app-name: <app>`
    pub fn execute_app_name(self, app_name: &str) -> Self {
        self.line("execute-app-name", app_name)
    }

    /// `execute-app-arg: <arg>`
    pub fn execute_app_arg(self, arg: &str) -> Self {
        self.line("execute-app-arg", arg)
    }

    /// `loops: <count>`
    pub fn loops(self, count: i32) -> Self {
        self.line("loops", &count.to_string())
    }

    /// `hangup-cause: <cause>`
    pub fn hangup_cause(self, cause: &str) -> Self {
        self.line("hangup-cause", cause)
    }

    /// `nomedia-uuid: <value>`
    pub fn nomedia_uuid(self, value: &str) -> Self {
        self.line("nomedia-uuid", value)
    }

    /// `event-lock: true`
    pub fn event_lock(self) -> Self {
        self.line("event-lock", "true")
    }

    /// Append a generic `name: value` line.
    pub fn line(mut self, name: &str, value: &str) -> Self {
        self.lines
            .push(format!("{}: {}", name, value));
        self
    }

    /// Lines in insertion order, the `sendmsg` line first.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// `true` if built with a target channel UUID.
    pub fn has_uuid(&self) -> bool {
        self.has_uuid
    }
}

/// Shows the first line after `sendmsg`, or `sendmsg` itself when empty.
impl fmt::Display for SendMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = self
            .lines
            .get(1)
            .or_else(|| {
                self.lines
                    .first()
            })
            .map(|s| s.as_str())
            .unwrap_or("");
        f.write_str(shown)
    }
}
