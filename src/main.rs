//! amwscan - PHP antimalware scanner.
//!
//! CLI entry point.

use amwscan::deobfuscate::codecs::bytes_to_text;
use amwscan::notify::ConsoleOutput;
use amwscan::{
    Commands, Config, DeobfuscateArgs, Deobfuscator, FileViews, ScanArgs, Scanner, ViewKind,
};
use clap::Parser;
use std::fs;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    // Set up logging
    let filter = if config.verbose {
        EnvFilter::new("amwscan=debug,info")
    } else {
        EnvFilter::new("amwscan=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match config.command.clone() {
        Commands::Scan(scan_args) => {
            if let Err(code) = run_scan(scan_args, &config).await {
                return code;
            }
        }
        Commands::Deobfuscate(deob_args) => {
            if let Err(code) = run_deobfuscate(deob_args) {
                return code;
            }
        }
    }

    ExitCode::SUCCESS
}

async fn run_scan(scan_args: ScanArgs, global_config: &Config) -> Result<(), ExitCode> {
    // Print banner unless JSON mode
    if !scan_args.json && !scan_args.quiet {
        print_banner();
    }

    let mut scanner = match Scanner::new(scan_args.clone(), global_config.verbose) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to create scanner: {}", e);
            return Err(ExitCode::FAILURE);
        }
    };

    let report = match scanner.scan().await {
        Ok(r) => r,
        Err(e) => {
            error!("Scan failed: {}", e);
            return Err(ExitCode::FAILURE);
        }
    };

    // Output results
    let json = serde_json::to_string_pretty(&report).unwrap_or_default();
    if let Some(ref output_path) = scan_args.output {
        if let Err(e) = fs::write(output_path, &json) {
            error!("Failed to write output file: {}", e);
            return Err(ExitCode::FAILURE);
        }
        if !scan_args.json {
            info!("Results written to: {:?}", output_path);
        }
    } else if scan_args.json {
        println!("{}", json);
    }

    if scan_args.add_to_whitelist {
        if let Err(e) = scanner.accept_findings(&report) {
            error!("Failed to update whitelist: {}", e);
            return Err(ExitCode::FAILURE);
        }
    }

    if report.detected() > 0 && scan_args.report {
        if !scan_args.json {
            eprintln!("\n{} infected files found!", report.detected());
        }
        return Err(ExitCode::FAILURE);
    }

    Ok(())
}

fn run_deobfuscate(args: DeobfuscateArgs) -> Result<(), ExitCode> {
    let content = match fs::read(&args.file) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to read {}: {}", args.file.display(), e);
            return Err(ExitCode::FAILURE);
        }
    };

    let text = bytes_to_text(content);
    let views = FileViews::build(&text, &Deobfuscator::new(), usize::MAX);
    let console = ConsoleOutput::new(false, false, args.decoded_only);

    for view in views.iter() {
        let shown = match view.kind() {
            ViewKind::Raw => false,
            ViewKind::Decoded => true,
            ViewKind::Stripped | ViewKind::Deobfuscated => !args.decoded_only,
        };
        if shown {
            console.print_view(view.kind(), view.text());
        }
    }

    Ok(())
}

fn print_banner() {
    println!();
    println!("\x1b[36m╔══════════════════════════════════════════════════════════════╗\x1b[0m");
    println!("\x1b[36m║                    AMWSCAN v0.1.0                            ║\x1b[0m");
    println!("\x1b[36m║              PHP Antimalware Scanner                         ║\x1b[0m");
    println!("\x1b[36m╚══════════════════════════════════════════════════════════════╝\x1b[0m");
    println!();
}
