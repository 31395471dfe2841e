//! Command-line interface.
//!
//! - `Cli`, `Commands`: argument definitions via clap
//! - `Display`: colored terminal output
//! - `demo`: canned tool agents wired into the research workflow

mod commands;
pub mod demo;
mod display;

pub use commands::{Cli, Commands, ConfigAction, OutputFormat};
pub use display::Display;
