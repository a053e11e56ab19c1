//! Pool status snapshots and the human-readable status table.

use serde::Serialize;

/// Per-pool counters as reported by `pool_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub id: String,
    /// Configured ceiling (`max_count`).
    pub capacity: u32,
    /// Live workers, free plus checked out.
    pub created: u32,
    pub checked_out: u32,
    pub free: u32,
    /// Headroom: `capacity - checked_out`.
    pub available: u32,
}

const HEADERS: [&str; 6] = ["Id", "Capacity", "Created", "CheckedOut", "Free", "Available"];

/// Render the rows as an aligned text table with a trailing `Total` row.
pub fn render_status_table(rows: &[PoolStatus]) -> String {
    let mut cells: Vec<[String; 6]> = rows
        .iter()
        .map(|row| {
            [
                row.id.clone(),
                row.capacity.to_string(),
                row.created.to_string(),
                row.checked_out.to_string(),
                row.free.to_string(),
                row.available.to_string(),
            ]
        })
        .collect();

    let total = rows.iter().fold([0u64; 5], |mut acc, row| {
        acc[0] += u64::from(row.capacity);
        acc[1] += u64::from(row.created);
        acc[2] += u64::from(row.checked_out);
        acc[3] += u64::from(row.free);
        acc[4] += u64::from(row.available);
        acc
    });
    cells.push([
        "Total".to_string(),
        total[0].to_string(),
        total[1].to_string(),
        total[2].to_string(),
        total[3].to_string(),
        total[4].to_string(),
    ]);

    let mut widths = [0usize; 6];
    for (i, header) in HEADERS.iter().enumerate() {
        widths[i] = header.len();
    }
    for row in &cells {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.len());
        }
    }

    let mut out = String::new();
    push_row(&mut out, &HEADERS.map(String::from), &widths);
    for row in &cells {
        push_row(&mut out, row, &widths);
    }
    out
}

fn push_row(out: &mut String, row: &[String; 6], widths: &[usize; 6]) {
    for (i, cell) in row.iter().enumerate() {
        if i > 0 {
            out.push_str(" | ");
        }
        out.push_str(&format!("{cell:<width$}", width = widths[i]));
    }
    // Trim the padding on the last column.
    while out.ends_with(' ') {
        out.pop();
    }
    out.push('\n');
}
