//! Configuration handling for the scanner.

use crate::detection::catalog::{exploit_ids, function_list};
use crate::types::{AmwscanError, Result, ScanConfig, ScanMode};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// File extensions scanned unless `--extensions` is given.
pub const DEFAULT_EXTENSIONS: &[&str] = &[
    "htaccess", "php", "php3", "php4", "php5", "php6", "php7", "php8", "ph3", "ph4", "ph5", "ph6",
    "ph7", "ph8", "phtm", "phtml", "ico",
];

/// Default whitelist file, relative to the working directory.
pub const DEFAULT_WHITELIST: &str = "scanner-whitelist.json";

/// PHP antimalware scanner.
#[derive(Parser, Debug, Clone)]
#[command(name = "amwscan")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Scan a directory or file for malware
    Scan(ScanArgs),
    /// Print the stripped, deobfuscated and decoded views of one file
    Deobfuscate(DeobfuscateArgs),
}

/// Arguments of the deobfuscate command.
#[derive(Parser, Debug, Clone)]
pub struct DeobfuscateArgs {
    /// File to deobfuscate
    pub file: PathBuf,

    /// Only print the decoded view
    #[arg(long)]
    pub decoded_only: bool,
}

/// Arguments of the scan command.
#[derive(Parser, Debug, Clone)]
pub struct ScanArgs {
    /// Directory or file to scan
    #[arg(default_value = ".")]
    pub path: PathBuf,

    /// Only search exploit patterns
    #[arg(short = 'e', long)]
    pub only_exploits: bool,

    /// Only search dangerous function calls
    #[arg(short = 'f', long)]
    pub only_functions: bool,

    /// Only search malware signatures
    #[arg(short = 's', long)]
    pub only_signatures: bool,

    /// Comma separated exploit ids to search (default: all)
    #[arg(long, value_delimiter = ',')]
    pub exploits: Option<Vec<String>>,

    /// Function list: "default", "dangerous" or comma separated names
    #[arg(long, default_value = "default")]
    pub functions: String,

    /// Skip files larger than this many bytes (0 = no limit)
    #[arg(long, default_value = "0")]
    pub max_filesize: u64,

    /// Match files larger than this many bytes without deobfuscating them
    #[arg(long, default_value = "2097152")]
    pub max_deobfuscate_size: usize,

    /// Comma separated file extensions to scan
    #[arg(long, value_delimiter = ',')]
    pub extensions: Option<Vec<String>>,

    /// Comma separated path wildcards to skip (`*` matches anything)
    #[arg(long, value_delimiter = ',')]
    pub ignore_paths: Vec<String>,

    /// Comma separated path wildcards; only matching paths are scanned
    #[arg(long, value_delimiter = ',')]
    pub filter_paths: Vec<String>,

    /// Whitelist file (JSON or legacy CSV)
    #[arg(long, default_value = DEFAULT_WHITELIST)]
    pub whitelist: PathBuf,

    /// Compare whitelist entries by path only, ignoring line numbers
    #[arg(long)]
    pub whitelist_only_path: bool,

    /// Disable the whitelist
    #[arg(long)]
    pub disable_whitelist: bool,

    /// Add every reported finding to the whitelist file
    #[arg(long)]
    pub add_to_whitelist: bool,

    /// Exit with a non-zero status when malware is found
    #[arg(short, long)]
    pub report: bool,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,

    /// Write the JSON report to this file
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Number of files scanned in parallel
    #[arg(long, short = 'p', default_value = "4")]
    pub parallel: usize,

    /// Quiet mode: only print detected files
    #[arg(short = 'q', long)]
    pub quiet: bool,
}

impl Default for ScanArgs {
    fn default() -> Self {
        Self {
            path: PathBuf::from("."),
            only_exploits: false,
            only_functions: false,
            only_signatures: false,
            exploits: None,
            functions: "default".to_string(),
            max_filesize: 0,
            max_deobfuscate_size: 2 * 1024 * 1024,
            extensions: None,
            ignore_paths: Vec::new(),
            filter_paths: Vec::new(),
            whitelist: PathBuf::from(DEFAULT_WHITELIST),
            whitelist_only_path: false,
            disable_whitelist: false,
            add_to_whitelist: false,
            report: false,
            json: false,
            output: None,
            parallel: 4,
            quiet: false,
        }
    }
}

impl ScanArgs {
    /// Selected pattern classes. Setting more than one `--only-*` flag is an error.
    pub fn mode(&self) -> Result<ScanMode> {
        match (self.only_exploits, self.only_functions, self.only_signatures) {
            (false, false, false) => Ok(ScanMode::All),
            (true, false, false) => Ok(ScanMode::OnlyExploits),
            (false, true, false) => Ok(ScanMode::OnlyFunctions),
            (false, false, true) => Ok(ScanMode::OnlySignatures),
            _ => Err(AmwscanError::ConfigError(
                "--only-exploits, --only-functions and --only-signatures are mutually exclusive"
                    .to_string(),
            )),
        }
    }

    /// Build the engine configuration, validating exploit ids.
    pub fn scan_config(&self) -> Result<ScanConfig> {
        let mode = self.mode()?;

        let exploits = match &self.exploits {
            Some(selected) => {
                let selected: Vec<String> = selected
                    .iter()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                let unknown = selected
                    .iter()
                    .find(|s| !exploit_ids().any(|id| id == s.as_str()));
                if let Some(unknown) = unknown {
                    return Err(AmwscanError::ConfigError(format!(
                        "unknown exploit id: {}",
                        unknown
                    )));
                }
                Some(selected)
            }
            None => None,
        };

        let functions: Vec<String> = match function_list(&self.functions) {
            Some(list) => list.iter().map(|f| f.to_string()).collect(),
            None => self
                .functions
                .split(',')
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect(),
        };
        if functions.is_empty() && mode.runs_functions() && mode != ScanMode::All {
            return Err(AmwscanError::ConfigError(
                "--only-functions needs at least one function name".to_string(),
            ));
        }

        Ok(ScanConfig {
            mode,
            exploits,
            functions,
            max_deobfuscate_bytes: self.max_deobfuscate_size,
            whitelist_only_path: self.whitelist_only_path,
        })
    }

    /// Extensions to scan, lowercased and without leading dots.
    pub fn extensions(&self) -> Vec<String> {
        match &self.extensions {
            Some(list) => list
                .iter()
                .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
            None => DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }
}
