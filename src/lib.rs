//! amwscan - PHP antimalware scanner.
//!
//! This library detects malicious PHP files by:
//! - Deriving stripped, deobfuscated and decoded views of every file
//! - Reversing known obfuscation families and decode chains
//! - Matching exploit patterns, dangerous function calls and malware signatures
//! - Suppressing accepted findings through a whitelist
//!
//! # Example
//!
//! ```no_run
//! use amwscan::config::ScanArgs;
//! use amwscan::scanner::Scanner;
//!
//! #[tokio::main]
//! async fn main() {
//!     let args = ScanArgs {
//!         path: "/var/www".into(),
//!         ..Default::default()
//!     };
//!     let scanner = Scanner::new(args, false).unwrap();
//!     let report = scanner.scan().await.unwrap();
//!     println!("Found {} infected files", report.detected());
//! }
//! ```

pub mod config;
pub mod deobfuscate;
pub mod detection;
pub mod notify;
pub mod scanner;
pub mod types;
pub mod whitelist;

pub use config::{Commands, Config, DeobfuscateArgs, ScanArgs};
pub use deobfuscate::Deobfuscator;
pub use detection::{DetectionEngine, FileViews};
pub use scanner::Scanner;
pub use types::{
    AmwscanError, DecodeError, FileReport, Match, Result, ScanConfig, ScanMode, ScanReport,
    ScanVerdict, ViewKind, WhitelistEntry,
};
pub use whitelist::Whitelist;
