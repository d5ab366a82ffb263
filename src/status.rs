use tokio::sync::mpsc::UnboundedSender;
use tracing::info;

/// Receives human-readable status lines (connections, moves, outcomes).
///
/// Implementations must return without blocking; the game never waits on delivery.
pub trait StatusSink: Send + Sync {
    fn notify(&self, text: &str);
}

/// Writes status lines to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl StatusSink for TracingSink {
    fn notify(&self, text: &str) {
        info!(target: "status", "{text}");
    }
}

/// Forwards status lines to whoever holds the receiver. Lines are dropped once it is gone.
impl StatusSink for UnboundedSender<String> {
    fn notify(&self, text: &str) {
        let _ = self.send(text.to_owned());
    }
}
