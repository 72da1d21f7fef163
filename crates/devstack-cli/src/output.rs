//! Formatted output helpers for CLI commands.

use std::fmt::Write;

use devstack_core::requirements::{Outcome, Report};

const BOLD: &str = "\x1b[1m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

/// Marker printed in front of a requirement line.
#[must_use]
pub const fn marker(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Satisfied => "ok",
        Outcome::Fixed => "fixed",
        Outcome::Unsatisfied => "missing",
        Outcome::FixFailed => "fix failed",
    }
}

const fn color(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Satisfied => GREEN,
        Outcome::Fixed => YELLOW,
        Outcome::Unsatisfied | Outcome::FixFailed => RED,
    }
}

/// Renders one line per requirement plus a summary line.
#[must_use]
pub fn render_report(report: &Report) -> String {
    let width = report
        .results
        .iter()
        .map(|r| marker(r.outcome).len())
        .max()
        .unwrap_or(0);
    let mut out = String::new();
    for result in &report.results {
        let tag = marker(result.outcome);
        let _ = writeln!(
            out,
            "  {}{tag:<width$}{RESET}  {}",
            color(result.outcome),
            result.name
        );
    }
    if report.passed() {
        let _ = writeln!(out, "{BOLD}{GREEN}All requirements met{RESET}");
    } else {
        let failed = report.results.iter().filter(|r| !r.outcome.passed()).count();
        let _ = writeln!(out, "{BOLD}{RED}{failed} requirement(s) not met{RESET}");
    }
    out
}

/// Prints the requirement report to stderr.
#[allow(clippy::print_stderr)]
pub fn print_report(report: &Report) {
    eprint!("{}", render_report(report));
}
