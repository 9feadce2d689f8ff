use std::io::{self, IsTerminal};

use core_model::Field;
use owo_colors::OwoColorize;
use reconcile::{CycleSummary, SkipReason};

pub fn color_enabled() -> bool {
    io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none()
}

pub fn summary_line(label: &str, summary: &CycleSummary, use_color: bool) -> String {
    let added = format!("+{} added", summary.added);
    let updated = format!("~{} updated", summary.updated);
    let rest = format!(
        "{} unchanged, {} skipped, {} failed",
        summary.unchanged,
        summary.skipped_total(),
        summary.failed
    );
    let head = format!("{label}: {} processed", summary.processed);
    if !use_color {
        return format!("{head} | {added} | {updated} | {rest}");
    }
    let separator = " | ".dimmed().to_string();
    format!(
        "{}{separator}{}{separator}{}{separator}{}",
        head.bold(),
        added.green(),
        updated.cyan(),
        rest.dimmed()
    )
}

pub fn print_summary(label: &str, summary: &CycleSummary) {
    let use_color = color_enabled();
    println!("{}", summary_line(label, summary, use_color));
    for (reason, count) in &summary.skipped {
        println!("  skipped {}: {count}", reason_label(*reason));
    }
    if summary.accounts_failed > 0 {
        let line = format!("  {} account(s) could not be polled", summary.accounts_failed);
        if use_color {
            println!("{}", line.yellow());
        } else {
            println!("{line}");
        }
    }
}

fn reason_label(reason: SkipReason) -> &'static str {
    match reason {
        SkipReason::NotRelevant => "not relevant",
        SkipReason::NotTargetCategory => "not target category",
        SkipReason::AnalysisFailed => "analysis failed",
    }
}

pub fn print_answer(answer: &str) {
    if color_enabled() {
        println!("{}", answer.bold());
    } else {
        println!("{answer}");
    }
}

/// What `doctor` found. `problems` is empty on a healthy setup.
#[derive(Debug, Default)]
pub struct DoctorReport {
    pub integrity: String,
    pub rows: usize,
    pub bound: Vec<(Field, String)>,
    pub unbound: Vec<Field>,
    pub unmapped: Vec<String>,
    pub accounts: Vec<(String, Option<String>, bool)>,
    pub calendar_present: bool,
    pub classifier: String,
    pub problems: Vec<String>,
}

pub fn print_doctor(report: &DoctorReport) {
    let use_color = color_enabled();
    let ok = |flag: bool| match (flag, use_color) {
        (true, true) => "ok".green().to_string(),
        (false, true) => "missing".red().to_string(),
        (true, false) => "ok".to_string(),
        (false, false) => "missing".to_string(),
    };
    println!("integrity_check={}", report.integrity);
    println!("rows={}", report.rows);
    for (field, label) in &report.bound {
        println!("field {} -> {label:?}", field.as_str());
    }
    for field in &report.unbound {
        println!("field {} -> (unbound)", field.as_str());
    }
    for label in &report.unmapped {
        println!("column {label:?} is not managed");
    }
    for (address, cursor, mailbox) in &report.accounts {
        println!(
            "account {address}: mailbox {} cursor {}",
            ok(*mailbox),
            cursor.as_deref().unwrap_or("(none)")
        );
    }
    println!("calendar {}", ok(report.calendar_present));
    println!("classifier {}", report.classifier);
    for problem in &report.problems {
        if use_color {
            println!("{} {problem}", "problem:".red().bold());
        } else {
            println!("problem: {problem}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_summary_line() {
        let summary = CycleSummary {
            processed: 3,
            added: 1,
            updated: 1,
            unchanged: 1,
            ..CycleSummary::default()
        };
        assert_eq!(
            summary_line("sync", &summary, false),
            "sync: 3 processed | +1 added | ~1 updated | 1 unchanged, 0 skipped, 0 failed"
        );
    }
}
