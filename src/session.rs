//! Per-connection protocol loop.
//!
//! A session owns one client connection. It announces the role, holds role X back until the
//! opponent has joined, then forwards every location the client sends to the [`TurnGate`] and
//! writes the verdict back. Moves made by the other role reach the client through the gate's
//! event stream. Nothing here holds the gate's mutex while writing to the network.

use std::{future::Future, pin::Pin, sync::Arc};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf},
    sync::{broadcast, watch},
};
use tracing::{debug, info, warn};

use crate::{
    ServerMessage,
    gate::{GateEvent, MoveResult, TurnGate},
    logic::{Outcome, Role},
    status::StatusSink,
    wire::{FrameReader, FrameWriter},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    AwaitingRole,
    AwaitingOpponent,
    MyTurnOrWaiting,
    GameOver,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEnd {
    Finished(Outcome),
    /// The game was torn down by the coordinator or by the other session.
    Aborted,
    /// This session's own client went away.
    Disconnected,
}

type PendingMove = Pin<Box<dyn Future<Output = MoveResult> + Send>>;

pub struct PlayerSession<S> {
    role: Role,
    state: SessionState,
    reader: FrameReader<ReadHalf<S>>,
    writer: FrameWriter<WriteHalf<S>>,
    gate: Arc<TurnGate>,
    events: broadcast::Receiver<GateEvent>,
    /// Only role X has one: it flips to `true` once role O has connected.
    ready: Option<watch::Receiver<bool>>,
    sink: Arc<dyn StatusSink>,
}

impl<S> PlayerSession<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(
        connection: S,
        role: Role,
        gate: Arc<TurnGate>,
        sink: Arc<dyn StatusSink>,
        ready: Option<watch::Receiver<bool>>,
    ) -> Self {
        let (read, write) = tokio::io::split(connection);
        // Subscribe now so no move made before the task starts is missed.
        let events = gate.subscribe();
        Self {
            role,
            state: SessionState::AwaitingRole,
            reader: FrameReader::new(read),
            writer: FrameWriter::new(write),
            gate,
            events,
            ready,
            sink,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Plays the session to completion and closes the connection.
    pub async fn run(mut self) -> SessionEnd {
        let end = match self.play().await {
            Ok(end) => end,
            Err(e) => {
                warn!(role = %self.role, "session failed: {e:#}");
                SessionEnd::Disconnected
            }
        };

        match end {
            SessionEnd::Finished(outcome) => {
                info!(role = %self.role, %outcome, "session finished");
            }
            SessionEnd::Aborted => {
                // Best effort; the client may already be gone.
                let _ = self
                    .writer
                    .send(&ServerMessage::GameOver(Outcome::Disconnected))
                    .await;
            }
            SessionEnd::Disconnected => {
                self.sink
                    .notify(&format!("Player {} disconnected", self.role));
                // A game already decided keeps its outcome for the other player.
                if !self.gate.abandon().await {
                    debug!(role = %self.role, "left after the game was decided");
                }
            }
        }

        self.enter(SessionState::GameOver);
        if let Err(e) = self.writer.shutdown().await {
            debug!(role = %self.role, "closing connection: {e}");
        }
        self.enter(SessionState::Closed);
        end
    }

    async fn play(&mut self) -> anyhow::Result<SessionEnd> {
        self.writer
            .send(&ServerMessage::Mark(self.role))
            .await
            .context("sending role")?;
        self.writer
            .send(&ServerMessage::Connected(self.role))
            .await?;
        self.sink.notify(&format!("Player {} connected", self.role));

        if let Some(ready) = self.ready.take() {
            self.enter(SessionState::AwaitingOpponent);
            if let Some(end) = self.await_opponent(ready).await? {
                return Ok(end);
            }
            self.writer.send(&ServerMessage::OpponentJoined).await?;
        }

        self.enter(SessionState::MyTurnOrWaiting);
        self.play_moves().await
    }

    async fn await_opponent(
        &mut self,
        mut ready: watch::Receiver<bool>,
    ) -> anyhow::Result<Option<SessionEnd>> {
        let joined = *ready.borrow();
        if !joined {
            self.writer
                .send(&ServerMessage::WaitingForOpponent)
                .await?;
        }

        loop {
            tokio::select! {
                biased;
                _ = self.gate.terminated() => return Ok(Some(SessionEnd::Aborted)),
                joined = async { ready.wait_for(|ready| *ready).await.is_ok() } => {
                    return Ok((!joined).then_some(SessionEnd::Aborted));
                }
                // Watch the connection so a client leaving early is noticed.
                read = self.reader.fill(), if self.reader.has_room() => {
                    if read.context("reading from client")? == 0 {
                        return Ok(Some(SessionEnd::Disconnected));
                    }
                }
            }
        }
    }

    async fn play_moves(&mut self) -> anyhow::Result<SessionEnd> {
        let mut pending: Option<PendingMove> = None;

        loop {
            if pending.is_none() {
                if let Some(location) = self.reader.try_location() {
                    debug!(role = %self.role, location, "move received");
                    pending = Some(self.submit(location));
                }
            }

            // Events go first: a move by the opponent is always published before this
            // session's own next move can be applied, and before any termination that follows
            // it, so the client must see it first.
            tokio::select! {
                biased;
                event = self.events.recv() => match event {
                    Ok(GateEvent::Moved { role, location, outcome }) if role != self.role => {
                        let relayed = self.writer.send(&ServerMessage::OpponentMoved(location)).await;
                        match outcome {
                            Some(outcome) => {
                                if let Err(e) = relayed {
                                    debug!(role = %self.role, "could not relay final move: {e}");
                                }
                                return Ok(self.report_outcome(outcome).await);
                            }
                            None => relayed?,
                        }
                    }
                    Ok(GateEvent::Moved { location, .. }) => {
                        self.sink.notify(&format!("Player {} took {location}", self.role));
                    }
                    Ok(GateEvent::Restarted) => {
                        self.writer.send(&ServerMessage::Restarted).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // The client's board can no longer be trusted to match the game.
                        warn!(role = %self.role, missed, "session fell behind the game");
                        self.gate.abandon().await;
                        return Ok(SessionEnd::Aborted);
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(SessionEnd::Aborted),
                },
                _ = self.gate.terminated() => return Ok(SessionEnd::Aborted),
                result = next_result(&mut pending) => {
                    pending = None;
                    debug!(role = %self.role, %result, "move settled");
                    match result {
                        MoveResult::Accepted => {
                            self.writer.send(&ServerMessage::ValidMove).await?;
                        }
                        MoveResult::Rejected => {
                            self.writer.send(&ServerMessage::InvalidMove).await?;
                        }
                        MoveResult::GameEnded(outcome) => {
                            return Ok(self.report_outcome(outcome).await);
                        }
                        MoveResult::Aborted => return Ok(SessionEnd::Aborted),
                    }
                }
                read = self.reader.fill(), if self.reader.has_room() => {
                    if read.context("reading from client")? == 0 {
                        return Ok(SessionEnd::Disconnected);
                    }
                }
            }
        }
    }

    /// Sends the final verdict. The game is decided whether or not the client is still there
    /// to read it.
    async fn report_outcome(&mut self, outcome: Outcome) -> SessionEnd {
        if let Err(e) = self.writer.send(&ServerMessage::GameOver(outcome)).await {
            debug!(role = %self.role, "could not send outcome: {e}");
        }
        SessionEnd::Finished(outcome)
    }

    fn submit(&self, location: i32) -> PendingMove {
        let gate = Arc::clone(&self.gate);
        let role = self.role;
        Box::pin(async move { gate.attempt_move(location, role).await })
    }

    fn enter(&mut self, state: SessionState) {
        debug!(role = %self.role, from = ?self.state, to = ?state, "session state");
        self.state = state;
    }
}

async fn next_result(pending: &mut Option<PendingMove>) -> MoveResult {
    match pending {
        Some(attempt) => attempt.await,
        None => std::future::pending().await,
    }
}
