mod terminal;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use crossterm::style::Stylize;
use linux_restore_point::restore_point::config::RestorePointConfig;
use linux_restore_point::restore_point::orchestrator::{
    CreateRequest, DeleteRequest, OperationReport, Orchestrator, Outcome, RestoreRequest,
};
use linux_restore_point::restore_point::registry::{RestorePoint, RestorePointKind};
use linux_restore_point::restore_point::result_error::error::Error;
use std::path::PathBuf;
use std::process::exit;
use terminal::{megabytes, TerminalProgress, TerminalPrompter, TerminalVolumePicker};
use tracing::{error, Level};

/// Create, list, restore and delete restore points of this system
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Location of config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// More diagnostics on stderr, repeat for even more
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new restore point
    Create {
        /// Label, the timestamp is appended
        #[arg(short, long)]
        name: String,
        #[arg(short = 't', long = "type", value_enum, default_value_t = KindArg::System)]
        kind: KindArg,
        /// Offer mounted removable volumes for inclusion
        #[arg(long)]
        include_usb: bool,
    },
    /// List restore points, newest first
    List,
    /// Restore files from a restore point, overwriting current ones
    Restore {
        #[arg(short, long)]
        name: String,
        /// Do not ask for confirmation
        #[arg(long)]
        force: bool,
    },
    /// Delete a restore point
    Delete {
        #[arg(short, long)]
        name: String,
        /// Do not ask for confirmation
        #[arg(long)]
        force: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    /// /etc only
    System,
    /// /etc and /home
    Full,
}

impl From<KindArg> for RestorePointKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::System => RestorePointKind::System,
            KindArg::Full => RestorePointKind::Full,
        }
    }
}

fn main() {
    let args = Args::parse();
    let level = match args.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let orchestrator = match RestorePointConfig::load(args.config.as_deref())
        .and_then(Orchestrator::new)
    {
        Ok(orchestrator) => orchestrator
            .with_picker(Box::new(TerminalVolumePicker))
            .with_prompter(Box::new(TerminalPrompter))
            .with_progress(Box::new(TerminalProgress::default())),
        Err(e) => {
            print_error(&e);
            exit(1);
        }
    };

    let code = match args.command {
        Command::Create {
            name,
            kind,
            include_usb,
        } => print_report(
            orchestrator.create(
                &CreateRequest::builder()
                    .label(name)
                    .kind(kind.into())
                    .include_removable(include_usb)
                    .build(),
            ),
        ),
        Command::List => print_listing(&orchestrator),
        Command::Restore { name, force } => print_report(
            orchestrator.restore(&RestoreRequest::builder().name(name).force(force).build()),
        ),
        Command::Delete { name, force } => print_report(
            orchestrator.delete(&DeleteRequest::builder().name(name).force(force).build()),
        ),
    };

    exit(code);
}

fn print_error(e: &Error) {
    error!("{e}");
    eprintln!("{} [{}] {}", "ERROR".red().bold(), e.category(), e);
}

fn print_report(report: OperationReport<RestorePoint>) -> i32 {
    match &report.outcome {
        Outcome::Success { value, warnings } if warnings.is_empty() => {
            println!("{} {} {}", "SUCCESS".green().bold(), report.action, value.name());
        }
        Outcome::Success { value, warnings } => {
            println!(
                "{} {} {} finished with {} skipped entries",
                "WARNING".yellow().bold(),
                report.action,
                value.name(),
                warnings.len()
            );
        }
        Outcome::Aborted => println!("{} {} cancelled, nothing changed", "ABORTED".yellow().bold(), report.action),
        Outcome::Failure(e) => print_error(e),
    }
    if let Some(log_file) = &report.log_file {
        println!("Details: {}", log_file.display());
    }
    report.exit_code()
}

fn print_listing(orchestrator: &Orchestrator) -> i32 {
    let listing = match orchestrator.list() {
        Ok(listing) => listing,
        Err(e) => {
            print_error(&e);
            return 1;
        }
    };

    for warning in &listing.warnings {
        eprintln!("{} skipped {}", "WARNING".yellow().bold(), warning);
    }
    if listing.points.is_empty() {
        println!("No restore points in {}", orchestrator.config().backup_root().display());
        return 0;
    }

    let width = listing
        .points
        .iter()
        .map(|p| p.name().len())
        .max()
        .unwrap_or(0)
        .max(4);
    let header = format!("{:<width$}  {:<6}  {:<19}  {:>10}", "NAME", "TYPE", "DATE", "SIZE");
    println!("{}", header.bold());
    for point in &listing.points {
        let size = point
            .size_bytes()
            .map(megabytes)
            .unwrap_or_else(|_| "?".to_string());
        println!(
            "{:<width$}  {:<6}  {:<19}  {:>10}",
            point.name(),
            point.record().kind().to_string(),
            point.record().created_at().format("%Y-%m-%d %H:%M:%S").to_string(),
            size
        );
    }
    0
}
