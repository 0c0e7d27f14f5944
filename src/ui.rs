//! Terminal tables for `skf show-properties` and the size report.
//!
//! Columns shrink to the terminal width, widest first, and cells that no
//! longer fit are truncated with `...`.

use crate::build::SectionSize;
use colored::*;
use console::{measure_text_width, truncate_str};

/// Columns are never shrunk below this.
const MIN_COLUMN_WIDTH: usize = 8;

pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: &[&str]) -> Self {
        Self {
            headers: headers.iter().map(|s| s.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    /// Rows with the wrong number of cells are ignored.
    pub fn add_row(&mut self, row: Vec<String>) {
        if row.len() == self.headers.len() {
            self.rows.push(row);
        }
    }

    pub fn print(&self) {
        let (_, width) = console::Term::stdout().size();
        for line in self.render(width as usize) {
            println!("{}", line);
        }
    }

    /// Lines of the table fitted to `max_width` columns.
    pub fn render(&self, max_width: usize) -> Vec<String> {
        if self.headers.is_empty() {
            return Vec::new();
        }
        let widths = self.column_widths(max_width);

        let sep = |left: &str, mid: &str, right: &str| {
            let cols: Vec<String> = widths.iter().map(|w| "─".repeat(w + 2)).collect();
            format!("  {}{}{}", left, cols.join(mid), right)
        };
        let row = |cells: &[String], bold: bool| {
            let mut line = String::from("  │");
            for (cell, &width) in cells.iter().zip(&widths) {
                let cell = cell.replace(['\n', '\r', '\t'], " ");
                let text = truncate_str(&cell, width, "...");
                let padding = width.saturating_sub(measure_text_width(&text));
                let text = if bold { text.bold().to_string() } else { text.to_string() };
                line.push_str(&format!(" {}{} │", text, " ".repeat(padding)));
            }
            line
        };

        let mut lines = vec![
            sep("┌", "┬", "┐"),
            row(&self.headers, true),
            sep("├", "┼", "┤"),
        ];
        lines.extend(self.rows.iter().map(|r| row(r, false)));
        lines.push(sep("└", "┴", "┘"));
        lines
    }

    fn column_widths(&self, max_width: usize) -> Vec<usize> {
        let mut widths: Vec<usize> = self.headers.iter().map(|h| measure_text_width(h)).collect();
        for row in &self.rows {
            for (w, cell) in widths.iter_mut().zip(row) {
                *w = (*w).max(measure_text_width(cell));
            }
        }

        let overhead = 3 + 3 * widths.len();
        let available = max_width.saturating_sub(overhead);
        while widths.iter().sum::<usize>() > available {
            let Some(widest) = widths.iter_mut().filter(|w| **w > MIN_COLUMN_WIDTH).max() else {
                break;
            };
            *widest -= 1;
        }
        widths
    }
}

/// Section, used, maximum and percentage columns.
pub fn size_table(sections: &[SectionSize]) -> Table {
    let mut table = Table::new(&["Section", "Used", "Maximum", "Usage"]);
    for section in sections {
        let percent = (section.size * 100).checked_div(section.max_size).unwrap_or(0);
        let usage = match percent {
            0..=74 => format!("{}%", percent).green(),
            75..=99 => format!("{}%", percent).yellow(),
            _ => format!("{}%", percent).red(),
        };
        table.add_row(vec![
            section.name.clone(),
            section.size.to_string(),
            section.max_size.to_string(),
            usage.to_string(),
        ]);
    }
    table
}
