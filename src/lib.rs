use crate::logic::{Outcome, Role};

pub mod coordinator;
pub mod gate;
pub mod logic;
pub mod session;
pub mod status;
pub mod wire;

/// The well-known loopback address the server listens on.
pub const DEFAULT_ADDR: &str = "127.0.0.1:50000";

pub const OPPONENT_MOVED: &str = "Opponent moved.";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientRequest {
    Move(i32),
}

/// Everything the server tells a client, in the order the protocol sends it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerMessage {
    /// Single mark byte, sent once at connect.
    Mark(Role),
    Connected(Role),
    WaitingForOpponent,
    OpponentJoined,
    ValidMove,
    InvalidMove,
    /// "Opponent moved." followed by the location as a 4-byte integer.
    OpponentMoved(usize),
    GameOver(Outcome),
    Restarted,
    Notice(String),
}

impl ServerMessage {
    /// The text frame that carries this message. `Mark` is a bare byte and has none.
    pub fn text(&self) -> Option<&str> {
        let text = match self {
            ServerMessage::Mark(_) => return None,
            ServerMessage::Connected(Role::X) => "Player X connected.",
            ServerMessage::Connected(Role::O) => "Player O connected, please wait.",
            ServerMessage::WaitingForOpponent => "Waiting for another player.",
            ServerMessage::OpponentJoined => "Other player connected. Your move.",
            ServerMessage::ValidMove => "Valid move.",
            ServerMessage::InvalidMove => "Invalid move, try again.",
            ServerMessage::OpponentMoved(_) => OPPONENT_MOVED,
            ServerMessage::GameOver(outcome) => outcome.message(),
            ServerMessage::Restarted => "RESTART",
            ServerMessage::Notice(text) => text,
        };
        Some(text)
    }

    /// Recognizes a text frame. "Opponent moved." is handled by the reader because a location
    /// follows it; anything unrecognized becomes a `Notice`.
    pub fn from_text(text: &str) -> Self {
        if let Some(outcome) = Outcome::from_message(text) {
            return ServerMessage::GameOver(outcome);
        }
        [
            ServerMessage::Connected(Role::X),
            ServerMessage::Connected(Role::O),
            ServerMessage::WaitingForOpponent,
            ServerMessage::OpponentJoined,
            ServerMessage::ValidMove,
            ServerMessage::InvalidMove,
            ServerMessage::Restarted,
        ]
        .into_iter()
        .find(|message| message.text() == Some(text))
        .unwrap_or_else(|| ServerMessage::Notice(text.to_owned()))
    }
}
