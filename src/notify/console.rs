//! Colored console output for scan results.

use crate::types::{FileReport, ScanReport, ViewKind};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

/// Longest matched text shown per finding.
const MAX_MATCH_DISPLAY: usize = 120;

/// Console output handler with colors and formatting.
pub struct ConsoleOutput {
    verbose: bool,
    json_mode: bool,
    quiet: bool,
}

impl ConsoleOutput {
    /// Create a new console output handler.
    pub fn new(verbose: bool, json_mode: bool, quiet: bool) -> Self {
        Self { verbose, json_mode, quiet }
    }

    /// Print scan start message.
    pub fn print_scan_start(&self, target: &str) {
        if self.json_mode || self.quiet {
            return;
        }

        println!(
            "{} Scanning: {}",
            "[*]".bright_blue(),
            target.bright_white()
        );
    }

    /// Print scan progress (only in verbose mode).
    pub fn print_progress(&self, message: &str) {
        if self.json_mode || !self.verbose {
            return;
        }

        println!("{} {}", "[.]".dimmed(), message.dimmed());
    }

    /// Print info message.
    pub fn print_info(&self, message: &str) {
        if self.json_mode || self.quiet {
            return;
        }

        println!("{} {}", "[*]".bright_blue(), message);
    }

    /// Print a detected file with its findings.
    pub fn print_file_report(&self, file: &FileReport) {
        if self.json_mode {
            return;
        }

        let label = if file.is_favicon_anomaly {
            "INFECTED ICON".on_red().white().bold()
        } else {
            "PROBABLE MALWARE".red().bold()
        };

        println!();
        println!(
            "{} {} [{}]",
            "===".bright_cyan(),
            file.path.bright_white().bold(),
            label
        );
        println!("    |-- Checksum: {}", file.sha256.dimmed());

        let last = file.matches.len().saturating_sub(1);
        for (i, m) in file.matches.iter().enumerate() {
            let branch = if i == last { "+--" } else { "|--" };
            println!("    {} {}", branch, m.description().yellow());
            if !m.matched_text.is_empty() {
                let indent = if i == last { " " } else { "|" };
                println!(
                    "    {}     {}",
                    indent,
                    truncate(&m.matched_text, MAX_MATCH_DISPLAY).dimmed()
                );
            }
        }
    }

    /// Print scan summary.
    pub fn print_summary(&self, report: &ScanReport) {
        if self.json_mode {
            return;
        }

        // In quiet mode, only print if something was found
        if self.quiet && report.detected() == 0 {
            return;
        }

        println!();
        println!("{}", "=== Scan Summary ===".bright_cyan());
        println!("  Target:      {}", report.target);
        println!("  Duration:    {:.2}s", report.duration_secs);
        println!("  Scanned:     {}", report.scanned);
        println!("  Whitelisted: {}", report.whitelisted.len());

        if report.detected() > 0 {
            println!(
                "  {}",
                format!("PROBABLE MALWARE FOUND: {}", report.detected())
                    .red()
                    .bold()
            );
        } else {
            println!("  {}", "No malware found.".green());
        }

        if !report.errors.is_empty() {
            println!();
            println!("{}", "Errors encountered:".yellow());
            for error in &report.errors {
                println!("  - {}", error.dimmed());
            }
        }

        println!();
    }

    /// Print one view of a deobfuscated file.
    pub fn print_view(&self, kind: ViewKind, text: &str) {
        if !self.quiet {
            println!("{}", format!("=== {:?} ===", kind).bright_cyan());
        }
        println!("{}", text);
        if !self.quiet {
            println!();
        }
    }

    /// Create a progress bar.
    pub fn create_progress_bar(&self, total: u64, message: &str) -> Option<ProgressBar> {
        if self.json_mode || self.quiet {
            return None;
        }

        let style = ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .ok()?
            .progress_chars("#>-");

        let pb = ProgressBar::new(total);
        pb.set_style(style);
        pb.set_message(message.to_string());
        Some(pb)
    }
}

/// Shorten `text` to at most `max` characters, marking the cut with `...`.
fn truncate(text: &str, max: usize) -> String {
    let flat: String = text
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    if flat.chars().count() <= max {
        return flat;
    }
    let mut short: String = flat.chars().take(max).collect();
    short.push_str("...");
    short
}

impl Default for ConsoleOutput {
    fn default() -> Self {
        Self::new(false, false, false)
    }
}
