use std::{io::BufRead, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc::{self, UnboundedSender},
};
use tracing::{error, info, warn};

use tictactoe_net::{DEFAULT_ADDR, coordinator::GameCoordinator, status::TracingSink};

#[derive(Parser, Debug)]
#[command(about = "Referees tic-tac-toe between two TCP clients")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = DEFAULT_ADDR)]
    bind: String,

    /// Exit after this many games.
    #[arg(long)]
    games: Option<usize>,
}

#[derive(Clone, Copy, Debug)]
enum Command {
    Restart,
    Quit,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let listener = TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("could not listen on {}", args.bind))?;
    info!("Server listening on {}", args.bind);

    // Accepted connections queue here until a game takes them, two at a time.
    let (connection_tx, mut connection_rx) = mpsc::unbounded_channel::<TcpStream>();
    tokio::spawn(accept_loop(listener, connection_tx));

    let (command_tx, mut commands) = mpsc::unbounded_channel();
    std::thread::spawn(move || console(command_tx));
    let mut console_open = true;

    let sink = Arc::new(TracingSink);
    let mut played = 0;
    let mut quitting = false;

    while !quitting && args.games.is_none_or(|limit| played < limit) {
        let coordinator = GameCoordinator::new(sink.clone());
        let game = coordinator.run(&mut connection_rx);
        tokio::pin!(game);

        let report = loop {
            tokio::select! {
                report = &mut game => break report,
                command = commands.recv(), if console_open => match command {
                    Some(Command::Restart) => coordinator.restart().await,
                    Some(Command::Quit) => {
                        quitting = true;
                        coordinator.shutdown();
                    }
                    None => console_open = false,
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, shutting down");
                    quitting = true;
                    coordinator.shutdown();
                }
            }
        };

        match report {
            Ok(report) => {
                played += 1;
                info!(
                    outcome = %report.outcome,
                    moves = report.snapshot.moves.len(),
                    "Game {played} complete"
                );
            }
            Err(e) => {
                warn!("{e:#}");
                break;
            }
        }
    }

    Ok(())
}

async fn accept_loop(listener: TcpListener, connections: UnboundedSender<TcpStream>) {
    info!("Accept loop started");

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                info!(%peer, "New connection");
                if let Err(e) = stream.set_nodelay(true) {
                    warn!(%peer, "could not disable Nagle: {e}");
                }
                if connections.send(stream).is_err() {
                    warn!("Game loop has stopped");
                    break;
                }
            }
            Err(e) => {
                error!("Failed to accept connection: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }

    info!("Accept loop ended");
}

/// Reads operator commands from stdin. Runs on its own thread because a blocking stdin read
/// cannot be cancelled and would otherwise hold up runtime shutdown.
fn console(commands: UnboundedSender<Command>) {
    for line in std::io::stdin().lock().lines() {
        let Ok(line) = line else {
            break;
        };
        let command = match line.trim() {
            "restart" => Command::Restart,
            "quit" => Command::Quit,
            "" => continue,
            other => {
                warn!("Unknown command {other:?}, expected `restart` or `quit`");
                continue;
            }
        };
        if commands.send(command).is_err() {
            break;
        }
    }
}
