use std::io::BufRead;

use anyhow::Context;
use clap::Parser;
use tokio::{net::TcpStream, sync::mpsc};

use tictactoe_net::{
    ClientRequest, DEFAULT_ADDR, ServerMessage,
    logic::{Board, Cell, Outcome, Role},
    wire::{FrameReader, FrameWriter},
};

#[derive(Parser, Debug)]
#[command(about = "Plays tic-tac-toe against another client through the server")]
struct Args {
    /// Server address.
    #[arg(long, default_value = DEFAULT_ADDR)]
    addr: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    println!("Tic-tac-toe client");
    println!("Connecting to {}...", args.addr);
    let stream = TcpStream::connect(&args.addr)
        .await
        .with_context(|| format!("could not connect to {}", args.addr))?;
    let (read, write) = stream.into_split();
    let mut reader = FrameReader::new(read);
    let mut writer = FrameWriter::new(write);

    let role = reader.read_mark().await.context("reading role")?;
    println!("You are playing {role}.");

    let (input_tx, mut input) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if input_tx.send(line).is_err() {
                break;
            }
        }
    });

    let mut game = LocalGame::new(role);
    loop {
        tokio::select! {
            message = reader.next_message() => {
                let message = message.context("server closed the connection")?;
                if game.apply(message) {
                    break;
                }
            }
            line = input.recv() => {
                let Some(line) = line else { break };
                if let Some(location) = game.parse_move(&line) {
                    writer.send(&ClientRequest::Move(location)).await?;
                }
            }
        }
    }

    println!("Game over. Thanks for playing.");
    Ok(())
}

/// The client's copy of the board, kept in step with what the server reports.
struct LocalGame {
    role: Role,
    board: Board,
    /// Square sent to the server and not yet answered.
    pending: Option<usize>,
    /// The last thing the server reported was the opponent's move, so a game-over that follows
    /// belongs to that move rather than ours.
    opponent_moved_last: bool,
}

impl LocalGame {
    fn new(role: Role) -> Self {
        Self {
            role,
            board: Board::default(),
            pending: None,
            opponent_moved_last: false,
        }
    }

    /// Returns true once the game is over.
    fn apply(&mut self, message: ServerMessage) -> bool {
        let opponent_moved_last = std::mem::replace(
            &mut self.opponent_moved_last,
            matches!(message, ServerMessage::OpponentMoved(_)),
        );
        match message {
            ServerMessage::OpponentMoved(location) => {
                self.board.cell[location] = Cell::Marked(self.role.opponent());
                println!("Opponent took square {location}.");
                self.show();
            }
            ServerMessage::ValidMove => {
                self.place_pending();
                self.show();
            }
            ServerMessage::InvalidMove => {
                self.pending = None;
                println!("That square is taken or off the board, try again.");
            }
            ServerMessage::GameOver(outcome) => {
                if !opponent_moved_last && outcome != Outcome::Disconnected {
                    self.place_pending();
                    self.show();
                }
                println!("{}", outcome.message());
                return true;
            }
            ServerMessage::Restarted => {
                // A move still pending is answered in the new game, so it stays pending.
                self.board = Board::default();
                println!("A new game has started.");
                self.show();
            }
            other => println!("{}", other.text().unwrap_or_default()),
        }
        false
    }

    fn place_pending(&mut self) {
        if let Some(location) = self.pending.take() {
            self.board.cell[location] = Cell::Marked(self.role);
        }
    }

    fn parse_move(&mut self, line: &str) -> Option<i32> {
        if self.pending.is_some() {
            println!("Still waiting for the server to answer your last move.");
            return None;
        }
        let Some(index) = line.trim().parse::<i32>().ok().and_then(Board::index) else {
            println!("Enter a square number from 0 to 8.");
            return None;
        };
        self.pending = Some(index);
        Some(index as i32)
    }

    fn show(&self) {
        println!("\n{}", self.board);
    }
}
