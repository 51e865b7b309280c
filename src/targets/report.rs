use colored::Colorize;
use supports_color::Stream;

use crate::ext::PathDisplayExt;
use crate::targets::TargetReport;

fn format_target_report(report: &TargetReport, colorize: bool) -> String {
    let status = if report.stats.repaired {
        "repaired"
    } else if report.stats.mutations() == 0 {
        "up to date"
    } else {
        "updated"
    };
    let output = report.output.display_best_effort();

    if !colorize {
        return format!("{} {status} -> {output} ({})", report.name, report.stats);
    }

    let status = match status {
        "repaired" => status.yellow(),
        "up to date" => status.dimmed(),
        _ => status.green(),
    };
    format!(
        "{} {status} -> {} ({})",
        report.name.bold(),
        output.cyan(),
        report.stats.to_string().dimmed()
    )
}

/// Prints one summary line per finished target, coloured when stdout supports it.
pub fn print_target_report(report: &TargetReport) {
    let colorize = supports_color::on(Stream::Stdout).is_some();
    println!("{}", format_target_report(report, colorize));
}
