//! Output module for scan results.
//!
//! This module handles:
//! - Colored console output and the progress bar
//! - Printing file views for the deobfuscate command

pub mod console;

pub use console::ConsoleOutput;
