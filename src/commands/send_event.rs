use std::fmt;

/// A `sendevent` command firing a named event into the server's event bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendEvent {
    lines: Vec<String>,
}

impl SendEvent {
    pub fn new(event_name: &str) -> Self {
        Self {
            lines: vec![format!("sendevent {}", event_name)],
        }
    }

    /// Append a `name: value` header line.
    pub fn add_line(mut self, name: &str, value: &str) -> Self {
        self.lines
            .push(format!("{}: {}", name, value));
        self
    }

    /// Append a raw line, as-is.
    pub fn add_body(mut self, line: &str) -> Self {
        self.lines
            .push(line.to_string());
        self
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

impl fmt::Display for SendEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SendEvent: {}",
            self.lines
                .first()
                .map(|s| s.as_str())
                .unwrap_or("")
        )
    }
}
