//! Cargo-style progress output for bam
//!
//! Server progress lines are re-rendered in the familiar cargo format:
//! ```text
//!     Checkout shots/shot.scene
//!  Downloading tex/wood.png
//!     Archiving 3 files
//!  Checked out work/shot in 0.41s
//! ```

use std::io::Write as _;
use std::time::Instant;

use bam_transport::Progress;

/// Status verbs for cargo-style output (right-aligned to 12 chars)
struct Status;

impl Status {
    const MISSING: &str = "Missing";
    const RECEIVING: &str = "Receiving";
}

/// Print a cargo-style status line
pub fn print_status(status: &str, message: &str) {
    let mut term = console::Term::stderr();
    let style = console::Style::new().green().bold();
    let _ = writeln!(term, "{:>12} {}", style.apply_to(status), message);
}

/// Print a status line in warning colors
pub fn print_warning(status: &str, message: &str) {
    let mut term = console::Term::stderr();
    let style = console::Style::new().yellow().bold();
    let _ = writeln!(term, "{:>12} {}", style.apply_to(status), message);
}

/// Split `"verb: object"` into a capitalized status and its object
fn status_line(text: &str) -> Option<(String, &str)> {
    let (verb, rest) = text.trim().split_once(": ")?;
    if verb.is_empty() || verb.contains(' ') {
        return None;
    }
    let mut chars = verb.chars();
    let first = chars.next()?;
    Some((first.to_uppercase().chain(chars).collect(), rest))
}

/// Renders progress for one command
pub struct ConsoleProgress {
    start: Instant,
    bar: Option<indicatif::ProgressBar>,
}

impl ConsoleProgress {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            bar: None,
        }
    }

    fn transfer_bar(total: u64) -> indicatif::ProgressBar {
        let pb = indicatif::ProgressBar::new(total);
        pb.set_style(
            indicatif::ProgressStyle::default_bar()
                .template("{spinner:.green} {msg:>12} [{bar:25.cyan/dim}] {percent}% {bytes}/{total_bytes}")
                .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        pb.set_message(Status::RECEIVING);
        pb
    }

    fn elapsed(&self) -> String {
        let elapsed = self.start.elapsed();
        if elapsed.as_secs() >= 1 {
            format!("{:.2}s", elapsed.as_secs_f64())
        } else {
            format!("{}ms", elapsed.as_millis())
        }
    }

    /// Show the final summary line
    pub fn done(&self, verb: &str, what: &str) {
        print_status(verb, &format!("{what} in {}", self.elapsed()));
    }
}

impl Default for ConsoleProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl Progress for ConsoleProgress {
    fn message(&mut self, text: &str) {
        let print = |status: &str, rest: &str| match &self.bar {
            Some(bar) => bar.suspend(|| print_status(status, rest)),
            None => print_status(status, rest),
        };
        let text = text.trim();
        if let Some(rest) = text
            .strip_prefix("source missing: ")
            .or_else(|| text.strip_prefix("missing: "))
        {
            print_warning(Status::MISSING, rest);
            return;
        }
        match status_line(text) {
            Some((status, rest)) => print(&status, rest),
            None => print("", text),
        }
    }

    fn transfer(&mut self, received: u64, total: u64) {
        let bar = self.bar.get_or_insert_with(|| Self::transfer_bar(total));
        bar.set_position(received);
        if received >= total {
            bar.finish_and_clear();
            self.bar = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_line() {
        assert_eq!(
            status_line("downloading: tex/wood.png"),
            Some(("Downloading".to_string(), "tex/wood.png"))
        );
        assert_eq!(
            status_line("  scene: /repo/shots/a.scene"),
            Some(("Scene".to_string(), "/repo/shots/a.scene"))
        );
        assert_eq!(status_line("Committed revision 7."), None);
        assert_eq!(status_line("source missing: a.png"), None);
    }
}
