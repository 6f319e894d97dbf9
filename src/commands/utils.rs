//! Shared helpers for command implementations

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::IsTerminal;
use std::time::Duration;
use stowage::{Outcome, PackageManager, StowageError};

pub(crate) fn is_tty() -> bool {
    std::io::stdout().is_terminal()
}

/// Spinner on a terminal, hidden otherwise.
pub(crate) fn spinner(message: impl Into<String>) -> ProgressBar {
    if !is_tty() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message.into());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Closest known name, if any is close enough to be a likely typo.
pub(crate) fn suggest<'a, I>(name: &str, candidates: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a String>,
{
    let wanted = name.to_lowercase();
    candidates
        .into_iter()
        .map(|c| (strsim::jaro_winkler(&wanted, &c.to_lowercase()), c))
        .filter(|(score, _)| *score > 0.85)
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, c)| c.as_str())
}

/// Print one line per outcome; returns the number of failures.
pub(crate) fn report_outcomes(pm: &PackageManager, results: &[(String, Outcome)]) -> usize {
    let mut failures = 0;
    let mut suggestions = None;

    for (name, outcome) in results {
        match outcome {
            Outcome::Done => println!("  {} {}", "✓".green(), name.bold()),
            Outcome::Deferred => println!(
                "  {} {} {}",
                "⟳".yellow(),
                name.bold(),
                "(finishes after restart)".dimmed()
            ),
            Outcome::Failed(e) => {
                failures += 1;
                println!("  {} {}: {}", "✗".red(), name.bold(), e);
                if matches!(e, StowageError::NotAvailable { .. }) {
                    let available = suggestions.get_or_insert_with(|| pm.available_packages());
                    if let Some(hint) = suggest(name, available.packages.keys()) {
                        println!("    Did you mean {}?", hint.cyan());
                    }
                }
            }
        }
    }
    failures
}

pub(crate) fn print_release_notes(pm: &PackageManager) {
    for notes in pm.take_release_notes() {
        println!("{notes}");
    }
}
