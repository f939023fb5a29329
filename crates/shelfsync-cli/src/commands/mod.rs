//! Command handlers

pub mod alerts;
pub mod config;
pub mod entity;
pub mod pending;
pub mod status;

use std::io::{self, IsTerminal, Write};

use anyhow::Result;

/// Ask a yes/no question on the terminal
///
/// Answers no when stdin is not a terminal.
pub fn confirm(prompt: &str) -> Result<bool> {
    if !io::stdin().is_terminal() {
        return Ok(false);
    }

    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    let input = input.trim().to_lowercase();
    Ok(input == "y" || input == "yes")
}
