//! Plain fixed-width table rendering for `list`.

use queuectl_core::core::job::Job;

const HEADERS: [&str; 6] = ["ID", "STATE", "PRIO", "ATTEMPTS", "RUN AT", "COMMAND"];
const COMMAND_WIDTH: usize = 48;

pub fn render(jobs: &[Job]) -> String {
    let rows: Vec<[String; 6]> = jobs
        .iter()
        .map(|job| {
            [
                job.id.to_string(),
                job.state.to_string(),
                job.priority.to_string(),
                format!("{}/{}", job.attempts, job.max_retries + 1),
                job.run_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                truncate(&job.command, COMMAND_WIDTH),
            ]
        })
        .collect();

    let mut widths: Vec<usize> = HEADERS.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row.iter()) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    push_row(&mut out, &widths, &HEADERS.map(String::from));
    for row in &rows {
        push_row(&mut out, &widths, row);
    }
    out
}

fn push_row(out: &mut String, widths: &[usize], cells: &[String; 6]) {
    for (i, (cell, width)) in cells.iter().zip(widths).enumerate() {
        if i > 0 {
            out.push_str("  ");
        }
        out.push_str(cell);
        // No padding after the last column.
        if i + 1 < cells.len() {
            for _ in cell.chars().count()..*width {
                out.push(' ');
            }
        }
    }
    out.push('\n');
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}
