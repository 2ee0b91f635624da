//! Terminal implementations of the orchestrator's interactive collaborators.

use crossterm::style::Stylize;
use linux_restore_point::restore_point::archive::progress::{percentage, ProgressObserver};
use linux_restore_point::restore_point::orchestrator::{
    ConfirmationPrompter, DestructiveAction, VolumePicker,
};
use linux_restore_point::restore_point::volume::VolumeCandidate;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::cell::RefCell;
use std::io::{BufRead, Write};
use std::path::PathBuf;

static CONFIRMATION_TOKEN: &str = "YES";
static BAR_TEMPLATE: &str = "[{bar:40}] {pos:>3}% {msg}";
static SPINNER_TEMPLATE: &str = "{spinner} {msg}";

fn flush_prompt() {
    if let Err(e) = std::io::stderr().flush() {
        tracing::debug!("Cannot flush prompt, {}", e);
    }
}

fn read_line() -> Option<String> {
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim().to_string()),
    }
}

pub fn megabytes(bytes: u64) -> String {
    format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
}

pub struct TerminalPrompter;

impl ConfirmationPrompter for TerminalPrompter {
    fn confirm(&self, action: &DestructiveAction<'_>) -> bool {
        eprintln!("{} {}", "WARNING:".yellow().bold(), action);
        eprint!("Type {} to continue: ", CONFIRMATION_TOKEN.bold());
        flush_prompt();
        read_line().as_deref() == Some(CONFIRMATION_TOKEN)
    }
}

pub struct TerminalVolumePicker;

impl VolumePicker for TerminalVolumePicker {
    fn pick(&self, candidates: &[VolumeCandidate]) -> Vec<PathBuf> {
        eprintln!("{}", "Removable volumes:".bold());
        for (i, candidate) in candidates.iter().enumerate() {
            eprintln!(
                "  {}) {} at {} ({})",
                i + 1,
                candidate.label(),
                candidate.mount_point().display(),
                megabytes(*candidate.size_bytes())
            );
        }
        eprint!("Volumes to include (e.g. 1,3), empty for none: ");
        flush_prompt();

        let answer = read_line().unwrap_or_default();
        parse_selection(&answer, candidates.len())
            .into_iter()
            .map(|i| candidates[i].mount_point().clone())
            .collect()
    }
}

/// Zero-based indexes for a list of 1-based numbers separated by commas or blanks.
/// Out of range or unparsable tokens are dropped.
fn parse_selection(answer: &str, len: usize) -> Vec<usize> {
    let mut picked = Vec::new();
    for token in answer.split(|c: char| c == ',' || c.is_whitespace()) {
        if token.is_empty() {
            continue;
        }
        match token.parse::<usize>() {
            Ok(n) if (1..=len).contains(&n) => {
                if !picked.contains(&(n - 1)) {
                    picked.push(n - 1);
                }
            }
            _ => tracing::warn!("Ignoring volume selection {:?}", token),
        }
    }
    picked
}

/// Progress bar on stderr. Counts in percent when the total is known, otherwise a
/// spinner with the byte count.
pub struct TerminalProgress {
    bar: RefCell<Option<ProgressBar>>,
    draw_target: fn() -> ProgressDrawTarget,
}

impl Default for TerminalProgress {
    fn default() -> Self {
        Self {
            bar: RefCell::new(None),
            draw_target: ProgressDrawTarget::stderr,
        }
    }
}

impl TerminalProgress {
    fn bar(&self, estimated_total: Option<u64>) -> ProgressBar {
        self.bar
            .borrow_mut()
            .get_or_insert_with(|| {
                let (bar, template) = match estimated_total.filter(|t| *t > 0) {
                    Some(_) => (ProgressBar::with_draw_target(Some(100), (self.draw_target)()), BAR_TEMPLATE),
                    None => (ProgressBar::with_draw_target(None, (self.draw_target)()), SPINNER_TEMPLATE),
                };
                match ProgressStyle::with_template(template) {
                    Ok(style) => bar.set_style(style.progress_chars("#>-")),
                    Err(e) => tracing::debug!("Default progress style, {}", e),
                }
                bar
            })
            .clone()
    }
}

impl ProgressObserver for TerminalProgress {
    fn on_progress(&self, processed: u64, estimated_total: Option<u64>) {
        let bar = self.bar(estimated_total);
        match percentage(processed, estimated_total) {
            Some(pct) => {
                bar.set_position(pct as u64);
                bar.set_message(megabytes(processed));
            }
            None => {
                bar.set_message(format!("{} processed", megabytes(processed)));
                bar.tick();
            }
        }
    }

    fn on_finish(&self, processed: u64, _estimated_total: Option<u64>) {
        match self.bar.borrow_mut().take() {
            Some(bar) => bar.finish_with_message(format!("{} done", megabytes(processed))),
            None => eprintln!("{} done", megabytes(processed)),
        }
    }
}
