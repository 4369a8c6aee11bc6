use std::io::Write;

/// A line of output addressed to a channel (`error`, `result`, `output` or any
/// channel a program writes to).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub channel: String,
    pub text: String,
}

/// Where the runtime's messages go.
pub trait Connection {
    fn send(&mut self, message: Message);
}

/// Keeps every message in memory.
#[derive(Debug, Default)]
pub struct Transcript {
    pub messages: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Texts sent to `channel`, oldest first.
    pub fn on(&self, channel: &str) -> Vec<String> {
        self.messages
            .iter()
            .filter(|m| m.channel == channel)
            .map(|m| m.text.clone())
            .collect()
    }
}

impl Connection for Transcript {
    fn send(&mut self, message: Message) {
        self.messages.push(message);
    }
}

/// Prints messages as `[channel] text`.
pub struct Console<W: Write> {
    out: W,
}

impl<W: Write> Console<W> {
    pub fn new(out: W) -> Self {
        Console { out }
    }
}

impl<W: Write> Connection for Console<W> {
    fn send(&mut self, message: Message) {
        if let Err(error) = writeln!(self.out, "[{}] {}", message.channel, message.text) {
            tracing::warn!(%error, channel = %message.channel, "dropped message");
        }
    }
}
