//! Main scanner orchestrating file discovery, detection and the whitelist.

use crate::config::ScanArgs;
use crate::detection::{is_infected_favicon, DetectionEngine};
use crate::notify::ConsoleOutput;
use crate::types::{AmwscanError, FileReport, Result, ScanReport, ScanVerdict};
use crate::whitelist::Whitelist;
use futures::stream::{self, StreamExt};
use regex::{Regex, RegexBuilder};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

/// Outcome of scanning one file on a worker thread.
enum FileOutcome {
    Scanned {
        path: String,
        sha256: String,
        verdict: ScanVerdict,
    },
    Failed {
        path: String,
        error: String,
    },
}

/// Case-insensitive path wildcards where `*` matches any run of characters.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    ignore: Vec<Regex>,
    filter: Vec<Regex>,
}

impl PathFilter {
    pub fn new(ignore: &[String], filter: &[String]) -> Result<Self> {
        Ok(Self {
            ignore: compile_wildcards(ignore)?,
            filter: compile_wildcards(filter)?,
        })
    }

    /// A path is allowed when no ignore wildcard matches it and, if filter
    /// wildcards are set, at least one of them matches.
    pub fn allows(&self, path: &str) -> bool {
        if self.ignore.iter().any(|re| re.is_match(path)) {
            return false;
        }
        self.filter.is_empty() || self.filter.iter().any(|re| re.is_match(path))
    }
}

fn compile_wildcards(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|p| {
            let pattern = regex::escape(p).replace(r"\*", ".*");
            RegexBuilder::new(&pattern)
                .case_insensitive(true)
                .build()
                .map_err(AmwscanError::from)
        })
        .collect()
}

/// Main scanner that walks a tree and reports probable malware.
pub struct Scanner {
    args: ScanArgs,
    engine: Arc<DetectionEngine>,
    whitelist: Whitelist,
    extensions: Vec<String>,
    paths: PathFilter,
    console: ConsoleOutput,
}

impl Scanner {
    /// Create a new scanner. Fails on invalid options, an empty pattern
    /// selection or an unreadable whitelist.
    pub fn new(args: ScanArgs, verbose: bool) -> Result<Self> {
        let config = args.scan_config()?;
        let engine = Arc::new(DetectionEngine::new(config));
        if engine.catalog().is_empty() {
            return Err(AmwscanError::ConfigError(
                "no patterns selected for this scan mode".to_string(),
            ));
        }

        let whitelist = if args.disable_whitelist {
            Whitelist::default()
        } else {
            Whitelist::load(&args.whitelist)?
        };

        let paths = PathFilter::new(&args.ignore_paths, &args.filter_paths)?;
        let console = ConsoleOutput::new(verbose, args.json, args.quiet);

        Ok(Self {
            extensions: args.extensions(),
            args,
            engine,
            whitelist,
            paths,
            console,
        })
    }

    /// Files under the target that pass the extension, size and path filters.
    ///
    /// Favicon-masquerade files bypass the extension filter.
    pub fn collect_files(&self) -> (Vec<PathBuf>, Vec<String>) {
        let mut files = Vec::new();
        let mut errors = Vec::new();

        for entry in WalkDir::new(&self.args.path).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("Walk error: {}", e);
                    errors.push(e.to_string());
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let name = entry.file_name().to_string_lossy();
            if !is_infected_favicon(&name) && !self.has_scanned_extension(path) {
                continue;
            }

            if !self.paths.allows(&path.to_string_lossy()) {
                trace!("Path filter excludes {}", path.display());
                continue;
            }

            if self.args.max_filesize > 0 {
                match entry.metadata() {
                    Ok(meta) if meta.len() > self.args.max_filesize => {
                        trace!("Skipping {} ({} bytes)", path.display(), meta.len());
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        errors.push(format!("{}: {}", path.display(), e));
                        continue;
                    }
                }
            }

            files.push(path.to_path_buf());
        }

        files.sort();
        (files, errors)
    }

    fn has_scanned_extension(&self, path: &Path) -> bool {
        // `.htaccess` has no stem, so its whole name is the extension
        let ext = match path.extension() {
            Some(ext) => ext.to_string_lossy().to_ascii_lowercase(),
            None => path
                .file_name()
                .map(|n| n.to_string_lossy().trim_start_matches('.').to_ascii_lowercase())
                .unwrap_or_default(),
        };
        self.extensions.iter().any(|e| *e == ext)
    }

    /// Scan the configured target.
    pub async fn scan(&self) -> Result<ScanReport> {
        let start_time = Instant::now();
        let target = self.args.path.display().to_string();
        self.console.print_scan_start(&target);

        if !self.args.path.exists() {
            return Err(AmwscanError::ConfigError(format!(
                "path does not exist: {}",
                target
            )));
        }

        let (files, mut errors) = self.collect_files();
        self.console
            .print_progress(&format!("Found {} files to scan", files.len()));

        let pb = self
            .console
            .create_progress_bar(files.len() as u64, "Scanning");
        let concurrency = self.args.parallel.max(1);

        let mut outcomes: Vec<FileOutcome> = stream::iter(files)
            .map(|path| {
                let engine = self.engine.clone();
                async move {
                    let display = path.display().to_string();
                    match tokio::task::spawn_blocking(move || scan_file(&engine, &path)).await {
                        Ok(Ok((sha256, verdict))) => FileOutcome::Scanned {
                            path: display,
                            sha256,
                            verdict,
                        },
                        Ok(Err(e)) => FileOutcome::Failed {
                            path: display,
                            error: e.to_string(),
                        },
                        Err(e) => FileOutcome::Failed {
                            path: display,
                            error: format!("worker failed: {}", e),
                        },
                    }
                }
            })
            .buffer_unordered(concurrency)
            .inspect(|_| {
                if let Some(ref pb) = pb {
                    pb.inc(1);
                }
            })
            .collect()
            .await;

        if let Some(pb) = pb {
            pb.finish_and_clear();
        }

        outcomes.sort_by(|a, b| a.path().cmp(b.path()));

        let mut report = ScanReport {
            target,
            ..Default::default()
        };

        for outcome in outcomes {
            match outcome {
                FileOutcome::Scanned {
                    path,
                    sha256,
                    verdict,
                } => {
                    report.scanned += 1;
                    if verdict.is_clean() {
                        continue;
                    }

                    if self.whitelist.is_suppressed(
                        &path,
                        &verdict.matches,
                        self.engine.config().whitelist_only_path,
                    ) {
                        debug!("All findings of {} are whitelisted", path);
                        report.whitelisted.push(path);
                        continue;
                    }

                    let file_report = FileReport {
                        path,
                        sha256,
                        matches: verdict.matches,
                        is_favicon_anomaly: verdict.is_favicon_anomaly,
                    };
                    self.console.print_file_report(&file_report);
                    report.files.push(file_report);
                }
                FileOutcome::Failed { path, error } => {
                    warn!("Failed to scan {}: {}", path, error);
                    errors.push(format!("{}: {}", path, error));
                }
            }
        }

        report.errors = errors;
        report.duration_secs = start_time.elapsed().as_secs_f64();
        self.console.print_summary(&report);

        Ok(report)
    }

    /// Add every reported finding to the whitelist and save it.
    /// Returns the number of new entries.
    pub fn accept_findings(&mut self, report: &ScanReport) -> Result<usize> {
        let added: usize = report
            .files
            .iter()
            .map(|file| self.whitelist.add_matches(&file.path, &file.matches))
            .sum();

        if added > 0 {
            self.whitelist.save(&self.args.whitelist)?;
            self.console.print_info(&format!(
                "Added {} entries to {}",
                added,
                self.args.whitelist.display()
            ));
        }
        Ok(added)
    }
}

impl FileOutcome {
    fn path(&self) -> &str {
        match self {
            FileOutcome::Scanned { path, .. } | FileOutcome::Failed { path, .. } => path,
        }
    }
}

/// Read and scan one file, returning its SHA-256 and verdict.
pub fn scan_file(engine: &DetectionEngine, path: &Path) -> Result<(String, ScanVerdict)> {
    let content = fs::read(path)?;
    let sha256 = hex::encode(Sha256::digest(&content));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    trace!("Scanning {} ({} bytes)", path.display(), content.len());
    Ok((sha256, engine.scan(&name, &content)))
}
