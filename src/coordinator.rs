//! Pairs two connections into one game.
//!
//! Connections arrive on a channel, the way the server's accept loop hands them over. The first
//! one plays X and is started immediately so its client learns it must wait; the second plays
//! O. Role order is decided by arrival alone.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{error, info, warn};

use crate::{
    gate::{GameSnapshot, TurnGate},
    logic::{Outcome, Role},
    session::{PlayerSession, SessionEnd},
    status::StatusSink,
};

/// How a game ended, with the authoritative move sequence.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameReport {
    pub outcome: Outcome,
    pub snapshot: GameSnapshot,
    /// How each session ended; `None` if its task panicked.
    pub sessions: Vec<(Role, Option<SessionEnd>)>,
}

pub struct GameCoordinator {
    gate: Arc<TurnGate>,
    sink: Arc<dyn StatusSink>,
}

impl GameCoordinator {
    pub fn new(sink: Arc<dyn StatusSink>) -> Self {
        Self {
            gate: Arc::new(TurnGate::new()),
            sink,
        }
    }

    pub fn notify(&self, text: &str) {
        self.sink.notify(text);
    }

    /// Starts a new game on the same connections.
    pub async fn restart(&self) {
        self.gate.restart().await;
        self.notify("Game restarted");
    }

    /// Stops the game; both sessions are woken and close their connections.
    pub fn shutdown(&self) {
        self.gate.terminate();
    }

    /// Takes the next two connections from `connections` and plays one game between them.
    ///
    /// Returns an error only if `connections` closes before the first player arrives.
    pub async fn run<S>(
        &self,
        connections: &mut mpsc::UnboundedReceiver<S>,
    ) -> anyhow::Result<GameReport>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.notify("Waiting for players...");

        let first = tokio::select! {
            connection = connections.recv() => connection,
            _ = self.gate.terminated() => None,
        };
        let Some(first) = first else {
            anyhow::bail!("no player connected before the game was stopped");
        };

        let (ready_tx, ready_rx) = watch::channel(false);
        let mut sessions = vec![self.spawn(first, Role::X, Some(ready_rx))];

        let second = tokio::select! {
            connection = connections.recv() => connection,
            _ = self.gate.terminated() => None,
        };
        match second {
            Some(second) => {
                sessions.push(self.spawn(second, Role::O, None));
                ready_tx.send_replace(true);
            }
            None => {
                warn!("second player never arrived");
                self.gate.terminate();
            }
        }

        let mut ends = Vec::new();
        for (role, handle) in sessions {
            match handle.await {
                Ok(end) => ends.push((role, Some(end))),
                Err(e) => {
                    error!(role = %role, "session task failed: {e}");
                    self.gate.terminate();
                    ends.push((role, None));
                }
            }
        }

        let snapshot = self.gate.snapshot().await;
        let report = GameReport {
            outcome: snapshot.outcome,
            snapshot,
            sessions: ends,
        };
        self.notify(&format!("Game over: {}", report.outcome));
        match serde_json::to_string(&report) {
            Ok(json) => info!(report = %json, "game finished"),
            Err(e) => warn!("could not serialize game report: {e}"),
        }
        Ok(report)
    }

    fn spawn<S>(
        &self,
        connection: S,
        role: Role,
        ready: Option<watch::Receiver<bool>>,
    ) -> (Role, JoinHandle<SessionEnd>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        info!(role = %role, "player accepted");
        let session = PlayerSession::new(
            connection,
            role,
            Arc::clone(&self.gate),
            Arc::clone(&self.sink),
            ready,
        );
        (role, tokio::spawn(session.run()))
    }
}
