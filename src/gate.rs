//! The single point through which the board changes.
//!
//! [`TurnGate`] is a monitor: one mutex guards the board and whose turn it is, and callers
//! whose turn it is not park on a [`Notify`] until a move, restart or termination wakes them.
//! Accepted moves are published on a broadcast channel before the mutex is released, so every
//! subscriber observes moves in the order they were applied.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, broadcast, watch};
use tracing::debug;

use crate::logic::{Board, Outcome, Role};

const EVENT_CAPACITY: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveResult {
    Accepted,
    /// Off the board, already occupied, or submitted before a restart.
    Rejected,
    GameEnded(Outcome),
    /// The game was torn down while the caller waited.
    Aborted,
}

impl fmt::Display for MoveResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MoveResult::Accepted => write!(f, "accepted"),
            MoveResult::Rejected => write!(f, "rejected"),
            MoveResult::GameEnded(outcome) => write!(f, "game ended ({outcome})"),
            MoveResult::Aborted => write!(f, "aborted"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateEvent {
    Moved {
        role: Role,
        location: usize,
        /// Set when this move ended the game.
        outcome: Option<Outcome>,
    },
    Restarted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub role: Role,
    pub location: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameSnapshot {
    pub board: Board,
    pub turn: Role,
    pub outcome: Outcome,
    pub moves: Vec<Placement>,
}

struct GateState {
    board: Board,
    turn: Role,
    /// Cached once the game ends; cleared only by a restart.
    outcome: Option<Outcome>,
    /// Bumped by every restart so that callers parked across one are turned away.
    round: u64,
    moves: Vec<Placement>,
}

impl GateState {
    fn fresh(round: u64) -> Self {
        Self {
            board: Board::default(),
            turn: Role::X,
            outcome: None,
            round,
            moves: Vec::new(),
        }
    }
}

pub struct TurnGate {
    state: Mutex<GateState>,
    turn_changed: Notify,
    events: broadcast::Sender<GateEvent>,
    terminated: watch::Sender<bool>,
}

impl Default for TurnGate {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnGate {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (terminated, _) = watch::channel(false);
        Self {
            state: Mutex::new(GateState::fresh(0)),
            turn_changed: Notify::new(),
            events,
            terminated,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GateEvent> {
        self.events.subscribe()
    }

    /// Places `role`'s mark at `location`, waiting first until it is `role`'s turn.
    pub async fn attempt_move(&self, location: i32, role: Role) -> MoveResult {
        let mut round = None;
        loop {
            // Register for wake-ups before looking at the state so none slips past between the
            // check and the wait.
            let notified = self.turn_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if self.is_terminated() {
                    return MoveResult::Aborted;
                }
                if let Some(outcome) = state.outcome {
                    return MoveResult::GameEnded(outcome);
                }
                if *round.get_or_insert(state.round) != state.round {
                    return MoveResult::Rejected;
                }
                if state.turn == role {
                    return self.apply(&mut state, location, role);
                }
            }

            debug!(role = %role, "waiting for turn");
            notified.await;
        }
    }

    fn apply(&self, state: &mut GateState, location: i32, role: Role) -> MoveResult {
        let Some(index) = Board::index(location).filter(|i| !state.board.is_occupied(*i)) else {
            return MoveResult::Rejected;
        };

        state.board.set(index, role);
        state.moves.push(Placement {
            role,
            location: index,
        });
        state.turn = role.opponent();

        let outcome = Some(state.board.evaluate()).filter(Outcome::is_terminal);
        state.outcome = outcome;

        let _ = self.events.send(GateEvent::Moved {
            role,
            location: index,
            outcome,
        });
        self.turn_changed.notify_waiters();

        match outcome {
            Some(outcome) => MoveResult::GameEnded(outcome),
            None => MoveResult::Accepted,
        }
    }

    /// Clears the board and hands the first move back to X. Moves still waiting for their turn
    /// are rejected.
    pub async fn restart(&self) {
        let mut state = self.state.lock().await;
        *state = GateState::fresh(state.round + 1);
        let _ = self.events.send(GateEvent::Restarted);
        self.turn_changed.notify_waiters();
    }

    /// Ends the game for good; every current and future `attempt_move` returns `Aborted`.
    pub fn terminate(&self) {
        if !self.terminated.send_replace(true) {
            debug!("game terminated");
        }
        self.turn_changed.notify_waiters();
    }

    /// Terminates the game unless a move has already decided it. Returns whether it terminated.
    ///
    /// Holds the mutex while deciding, so no move can end the game in between.
    pub async fn abandon(&self) -> bool {
        let state = self.state.lock().await;
        if state.outcome.is_some() {
            return false;
        }
        self.terminate();
        true
    }

    pub fn is_terminated(&self) -> bool {
        *self.terminated.borrow()
    }

    /// Resolves once [`TurnGate::terminate`] has been called.
    pub async fn terminated(&self) {
        let mut rx = self.terminated.subscribe();
        // The sender lives in `self`, so this can only fail if the gate is gone.
        let _ = rx.wait_for(|terminated| *terminated).await;
    }

    pub async fn snapshot(&self) -> GameSnapshot {
        let state = self.state.lock().await;
        let outcome = match state.outcome {
            Some(outcome) => outcome,
            None if self.is_terminated() => Outcome::Disconnected,
            None => Outcome::InProgress,
        };
        GameSnapshot {
            board: state.board,
            turn: state.turn,
            outcome,
            moves: state.moves.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::time::{sleep, timeout};

    use super::*;
    use crate::logic::Cell;

    const SETTLE: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn occupied_cell_is_rejected_without_passing_the_turn() {
        let gate = TurnGate::new();
        assert_eq!(gate.attempt_move(0, Role::X).await, MoveResult::Accepted);
        assert_eq!(gate.attempt_move(0, Role::O).await, MoveResult::Rejected);
        assert_eq!(gate.snapshot().await.turn, Role::O);
        assert_eq!(gate.attempt_move(4, Role::O).await, MoveResult::Accepted);

        let snapshot = gate.snapshot().await;
        assert_eq!(snapshot.turn, Role::X);
        assert_eq!(snapshot.board.cell[0], Cell::Marked(Role::X));
        assert_eq!(snapshot.board.cell[4], Cell::Marked(Role::O));
        assert_eq!(snapshot.board.filled(), 2);
    }

    #[tokio::test]
    async fn turn_alternates_with_each_accepted_move() {
        let gate = TurnGate::new();
        let sequence = [0, 1, 2, 4, 3, 5, 7, 6];
        for (n, location) in sequence.into_iter().enumerate() {
            let role = match n % 2 {
                0 => Role::X,
                _ => Role::O,
            };
            assert_eq!(gate.attempt_move(location, role).await, MoveResult::Accepted);

            let snapshot = gate.snapshot().await;
            assert_eq!(snapshot.board.filled(), n + 1);
            let expected = if (n + 1) % 2 == 0 { Role::X } else { Role::O };
            assert_eq!(snapshot.turn, expected);
        }
        assert_eq!(
            gate.attempt_move(8, Role::X).await,
            MoveResult::GameEnded(Outcome::Draw)
        );
    }

    #[tokio::test]
    async fn out_of_turn_caller_waits_until_its_turn() {
        let gate = Arc::new(TurnGate::new());
        assert!(
            timeout(SETTLE, gate.attempt_move(4, Role::O))
                .await
                .is_err()
        );
        let snapshot = gate.snapshot().await;
        assert_eq!(snapshot.board.filled(), 0);
        assert_eq!(snapshot.turn, Role::X);

        let waiting = tokio::spawn({
            let gate = Arc::clone(&gate);
            async move { gate.attempt_move(4, Role::O).await }
        });
        sleep(SETTLE).await;
        assert!(!waiting.is_finished());

        assert_eq!(gate.attempt_move(0, Role::X).await, MoveResult::Accepted);
        let result = timeout(Duration::from_secs(1), waiting).await.unwrap();
        assert_eq!(result.unwrap(), MoveResult::Accepted);
        assert_eq!(gate.snapshot().await.turn, Role::X);
    }

    #[tokio::test]
    async fn off_board_locations_are_rejected() {
        let gate = TurnGate::new();
        for location in [-1, 9, 1000] {
            assert_eq!(gate.attempt_move(location, Role::X).await, MoveResult::Rejected);
        }
        let snapshot = gate.snapshot().await;
        assert_eq!(snapshot.board.filled(), 0);
        assert_eq!(snapshot.turn, Role::X);
    }

    #[tokio::test]
    async fn finished_game_keeps_reporting_its_outcome() {
        let gate = TurnGate::new();
        for (location, role) in [(0, Role::X), (3, Role::O), (1, Role::X), (4, Role::O)] {
            assert_eq!(gate.attempt_move(location, role).await, MoveResult::Accepted);
        }
        let won = MoveResult::GameEnded(Outcome::Win(Role::X));
        assert_eq!(gate.attempt_move(2, Role::X).await, won);

        assert_eq!(gate.attempt_move(8, Role::O).await, won);
        assert_eq!(gate.attempt_move(5, Role::X).await, won);
        let snapshot = gate.snapshot().await;
        assert_eq!(snapshot.board.filled(), 5);
        assert_eq!(snapshot.outcome, Outcome::Win(Role::X));
        assert_eq!(snapshot.moves.len(), 5);
    }

    #[tokio::test]
    async fn terminate_releases_parked_callers() {
        let gate = Arc::new(TurnGate::new());
        let waiting = tokio::spawn({
            let gate = Arc::clone(&gate);
            async move { gate.attempt_move(4, Role::O).await }
        });
        sleep(SETTLE).await;

        gate.terminate();
        let result = timeout(Duration::from_secs(1), waiting).await.unwrap();
        assert_eq!(result.unwrap(), MoveResult::Aborted);
        assert_eq!(gate.attempt_move(0, Role::X).await, MoveResult::Aborted);
        assert_eq!(gate.snapshot().await.outcome, Outcome::Disconnected);
        timeout(SETTLE, gate.terminated()).await.unwrap();
    }

    #[tokio::test]
    async fn restart_clears_the_board_and_turns_away_stale_moves() {
        let gate = Arc::new(TurnGate::new());
        let mut events = gate.subscribe();
        assert_eq!(gate.attempt_move(0, Role::X).await, MoveResult::Accepted);

        let stale = tokio::spawn({
            let gate = Arc::clone(&gate);
            async move { gate.attempt_move(1, Role::X).await }
        });
        sleep(SETTLE).await;
        gate.restart().await;

        let result = timeout(Duration::from_secs(1), stale).await.unwrap();
        assert_eq!(result.unwrap(), MoveResult::Rejected);

        let snapshot = gate.snapshot().await;
        assert_eq!(snapshot.board, Board::default());
        assert_eq!(snapshot.turn, Role::X);
        assert!(snapshot.moves.is_empty());

        assert_eq!(
            events.recv().await.unwrap(),
            GateEvent::Moved {
                role: Role::X,
                location: 0,
                outcome: None
            }
        );
        assert_eq!(events.recv().await.unwrap(), GateEvent::Restarted);
        assert_eq!(gate.attempt_move(1, Role::X).await, MoveResult::Accepted);
    }

    #[tokio::test]
    async fn x_cannot_take_a_cell_held_by_o() {
        let gate = TurnGate::new();
        assert_eq!(gate.attempt_move(0, Role::X).await, MoveResult::Accepted);
        assert_eq!(gate.attempt_move(4, Role::O).await, MoveResult::Accepted);
        let before = gate.snapshot().await;

        assert_eq!(gate.attempt_move(4, Role::X).await, MoveResult::Rejected);
        let after = gate.snapshot().await;
        assert_eq!(after, before);
        assert_eq!(after.board.cell[4], Cell::Marked(Role::O));
        assert_eq!(after.turn, Role::X);
    }

    #[tokio::test]
    async fn restart_after_a_finished_game_starts_over() {
        let gate = TurnGate::new();
        for (location, role) in [(0, Role::X), (3, Role::O), (1, Role::X), (4, Role::O)] {
            assert_eq!(gate.attempt_move(location, role).await, MoveResult::Accepted);
        }
        assert_eq!(
            gate.attempt_move(2, Role::X).await,
            MoveResult::GameEnded(Outcome::Win(Role::X))
        );

        gate.restart().await;
        let snapshot = gate.snapshot().await;
        assert_eq!(snapshot.board, Board::default());
        assert_eq!(snapshot.turn, Role::X);
        assert_eq!(snapshot.outcome, Outcome::InProgress);

        assert_eq!(gate.attempt_move(0, Role::X).await, MoveResult::Accepted);
        let snapshot = gate.snapshot().await;
        assert_eq!(snapshot.board.filled(), 1);
        assert_eq!(snapshot.turn, Role::O);
    }

    #[tokio::test]
    async fn abandoning_a_decided_game_leaves_it_running() {
        let gate = TurnGate::new();
        for (location, role) in [(0, Role::X), (3, Role::O), (1, Role::X), (4, Role::O)] {
            assert_eq!(gate.attempt_move(location, role).await, MoveResult::Accepted);
        }
        assert!(!gate.is_terminated());
        assert_eq!(
            gate.attempt_move(2, Role::X).await,
            MoveResult::GameEnded(Outcome::Win(Role::X))
        );

        assert!(!gate.abandon().await);
        assert!(!gate.is_terminated());
        assert_eq!(gate.snapshot().await.outcome, Outcome::Win(Role::X));

        let open = TurnGate::new();
        assert!(open.abandon().await);
        assert!(open.is_terminated());
        assert_eq!(open.snapshot().await.outcome, Outcome::Disconnected);
    }
}
