//! Builders for the multi-line `sendmsg` and `sendevent` commands
//!
//! Each builder collects the lines of one command in order; the client
//! writes every line followed by `\n`, then a blank line to end the command.

mod send_event;
mod send_msg;

pub use send_event::SendEvent;
pub use send_msg::SendMsg;
