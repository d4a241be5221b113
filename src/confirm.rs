//! Interactive confirmation before a destructive sweep.
//!
//! Active only when the sweep would actually delete (not dry-run) and both
//! stdin and stdout are terminals. Unattended runs (cron, CI, piped output)
//! proceed without a prompt; the dry-run flag is the rehearsal mechanism
//! there.

use crate::storage::traits::OrphanTotals;
use std::io::{BufRead, IsTerminal, Write};

/// Outcome of the confirmation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The operator confirmed, or no confirmation was needed.
    Proceed,
    /// The operator declined; the session aborts with state unchanged.
    Declined,
}

/// Returns whether a prompt is required for this run.
#[must_use]
pub fn prompt_required(dry_run: bool) -> bool {
    !dry_run && std::io::stdin().is_terminal() && std::io::stdout().is_terminal()
}

/// Renders the preview line shown before the prompt.
#[must_use]
pub fn preview_line(totals: OrphanTotals) -> String {
    format!(
        "about to remove {} unreferenced objects ({} bytes)",
        totals.objects, totals.bytes
    )
}

/// Returns whether an answer counts as an explicit yes.
#[must_use]
pub fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Shows the preview and reads the operator's answer from the terminal.
///
/// Anything other than an explicit yes declines, including an unreadable
/// stdin.
pub fn prompt_operator(totals: OrphanTotals) -> Decision {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let _ = writeln!(out, "{}", preview_line(totals));
    let _ = write!(out, "proceed? [y/N] ");
    let _ = out.flush();

    let mut answer = String::new();
    if std::io::stdin().lock().read_line(&mut answer).is_err() {
        return Decision::Declined;
    }
    if is_affirmative(&answer) {
        Decision::Proceed
    } else {
        tracing::info!("operator declined, aborting");
        Decision::Declined
    }
}
