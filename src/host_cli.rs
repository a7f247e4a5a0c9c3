//! Pure parser for the GS console grammar, spec.md §6. The actual
//! line-reading I/O (a terminal, a telnet session, the opaque
//! HTTP/WebSocket layer) is out of scope; this function only turns a
//! line of text into a command the caller acts on.

extern crate alloc;
use alloc::string::String;

/// One parsed line of GS console input.
#[derive(Clone, PartialEq, Debug)]
pub enum HostCliCommand {
    /// `help` — list built-ins.
    Help,
    /// `heartbeat on` / `heartbeat off`.
    Heartbeat(bool),
    /// Anything else, forwarded verbatim inside a `CMD:` frame.
    Forward(String),
}

/// Parse one line of console input. Leading/trailing whitespace is
/// trimmed; an empty line forwards as an empty command text (the
/// satellite side decides what, if anything, that means).
pub fn parse(line: &str) -> HostCliCommand {
    let trimmed = line.trim();
    match trimmed {
        "help" => HostCliCommand::Help,
        "heartbeat on" => HostCliCommand::Heartbeat(true),
        "heartbeat off" => HostCliCommand::Heartbeat(false),
        other => HostCliCommand::Forward(String::from(other)),
    }
}
