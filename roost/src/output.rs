//! Terminal output helpers for the roost CLI.

use console::style;
use std::fmt::Display;

pub fn success(message: impl Display) {
    println!("{} {}", style("✓").green(), message);
}

pub fn warning(message: impl Display) {
    println!("{} {}", style("!").yellow(), message);
}

pub fn error(message: impl Display) {
    eprintln!("{} {}", style("✗").red(), message);
}

pub fn muted(message: impl Display) {
    println!("{}", style(message).dim());
}

pub fn step(message: impl Display) {
    println!("{} {}", style("→").cyan(), message);
}

/// Key/value line for status displays.
pub fn field(name: &str, value: impl Display) {
    println!("  {} {}", style(format!("{name}:")).dim(), value);
}
