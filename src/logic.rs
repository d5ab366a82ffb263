use std::fmt;

use serde::{Deserialize, Serialize};

/// Every line that wins the game: three rows, three columns, two diagonals.
const LINES: [[usize; 3]; 8] = [
    [0, 1, 2],
    [3, 4, 5],
    [6, 7, 8],
    [0, 3, 6],
    [1, 4, 7],
    [2, 5, 8],
    [0, 4, 8],
    [2, 4, 6],
];

pub const CELLS: usize = 9;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    pub cell: [Cell; CELLS],
}

impl Board {
    /// Converts a wire location into a cell index, or `None` if it is off the board.
    pub fn index(location: i32) -> Option<usize> {
        usize::try_from(location).ok().filter(|index| *index < CELLS)
    }

    pub fn is_occupied(&self, location: usize) -> bool {
        self.cell[location] != Cell::Empty
    }

    /// Places `role`'s mark. The caller has already checked that the cell is on the board and
    /// empty; marks are never overwritten.
    pub fn set(&mut self, location: usize, role: Role) {
        assert!(
            !self.is_occupied(location),
            "cell {location} is already marked"
        );
        self.cell[location] = Cell::Marked(role);
    }

    pub fn filled(&self) -> usize {
        self.cell.iter().filter(|cell| **cell != Cell::Empty).count()
    }

    pub fn evaluate(&self) -> Outcome {
        let winner_of = |role: Role| {
            LINES
                .iter()
                .any(|line| line.iter().all(|&i| self.cell[i] == Cell::Marked(role)))
        };
        let (x, o) = (winner_of(Role::X), winner_of(Role::O));
        assert!(!(x && o), "both roles completed a line");

        if x {
            Outcome::Win(Role::X)
        } else if o {
            Outcome::Win(Role::O)
        } else if self.filled() == CELLS {
            Outcome::Draw
        } else {
            Outcome::InProgress
        }
    }
}

impl fmt::Display for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (row, cells) in self.cell.chunks(3).enumerate() {
            if row > 0 {
                writeln!(f, "---+---+---")?;
            }
            let symbols: Vec<String> = cells
                .iter()
                .enumerate()
                .map(|(col, cell)| match cell {
                    Cell::Empty => (row * 3 + col).to_string(),
                    Cell::Marked(role) => role.to_string(),
                })
                .collect();
            writeln!(f, " {} | {} | {}", symbols[0], symbols[1], symbols[2])?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cell {
    #[default]
    Empty,
    Marked(Role),
}

/// The side a connection plays. The first connection is always X and moves first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    X,
    O,
}

impl Role {
    pub fn opponent(&self) -> Self {
        match self {
            Role::X => Role::O,
            Role::O => Role::X,
        }
    }

    /// The single byte sent to a client to tell it which side it plays.
    pub fn mark(&self) -> u8 {
        match self {
            Role::X => b'X',
            Role::O => b'O',
        }
    }

    pub fn from_mark(mark: u8) -> Option<Self> {
        match mark {
            b'X' => Some(Role::X),
            b'O' => Some(Role::O),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", char::from(self.mark()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    InProgress,
    Win(Role),
    Draw,
    Disconnected,
}

impl Outcome {
    pub fn is_terminal(&self) -> bool {
        *self != Outcome::InProgress
    }

    /// Text sent to clients when the game ends this way.
    pub fn message(&self) -> &'static str {
        match self {
            Outcome::InProgress => "Game in progress.",
            Outcome::Win(Role::X) => "X wins.",
            Outcome::Win(Role::O) => "O wins.",
            Outcome::Draw => "Draw.",
            Outcome::Disconnected => "Opponent disconnected.",
        }
    }

    pub fn from_message(text: &str) -> Option<Self> {
        [
            Outcome::Win(Role::X),
            Outcome::Win(Role::O),
            Outcome::Draw,
            Outcome::Disconnected,
        ]
        .into_iter()
        .find(|outcome| outcome.message() == text)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::InProgress => write!(f, "in progress"),
            Outcome::Win(role) => write!(f, "{role} wins"),
            Outcome::Draw => write!(f, "draw"),
            Outcome::Disconnected => write!(f, "disconnected"),
        }
    }
}
