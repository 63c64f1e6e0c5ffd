//! Plain-text rendering of charts, tables and reports.

use energy_core::{
    session::ChartPoint, BatchReport, GroupedView, OlapParams, OlapReport, PersistStatus,
    PivotTable, PredictionOutcome, SliceView, ZoneView,
};

const BARS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One bar per value, scaled between the minimum and the maximum.
pub fn sparkline(values: &[f64]) -> String {
    let (min, max) = values
        .iter()
        .filter(|value| value.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), value| {
            (lo.min(*value), hi.max(*value))
        });
    let span = max - min;
    values
        .iter()
        .map(|value| {
            if !value.is_finite() {
                ' '
            } else if span <= 0.0 {
                BARS[BARS.len() / 2]
            } else {
                let level = ((value - min) / span * (BARS.len() - 1) as f64).round() as usize;
                BARS[level.min(BARS.len() - 1)]
            }
        })
        .collect()
}

/// Averages consecutive buckets so at most `width` values remain.
pub fn downsample(values: &[f64], width: usize) -> Vec<f64> {
    if width == 0 || values.len() <= width {
        return values.to_vec();
    }
    let bucket = values.len().div_ceil(width);
    values
        .chunks(bucket)
        .map(|chunk| chunk.iter().sum::<f64>() / chunk.len() as f64)
        .collect()
}

/// Time-series chart as a sparkline with its range.
pub fn chart(points: &[ChartPoint], width: usize) -> String {
    let (Some(first), Some(last)) = (points.first(), points.last()) else {
        return "(no points)".into();
    };
    let values: Vec<f64> = points.iter().map(|p| p.predicted_energy).collect();
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    format!(
        "{} .. {}  ({} points, min {min:.2}, max {max:.2} kWh)\n{}",
        first.timestamp.format(TIME_FORMAT),
        last.timestamp.format(TIME_FORMAT),
        points.len(),
        sparkline(&downsample(&values, width)),
    )
}

/// Chart plus the newest `limit` rows of a zone.
pub fn zone_view(view: &ZoneView, limit: usize, width: usize) -> String {
    let mut lines = vec![format!("Zone {}", view.zone)];
    if let Some(notice) = view.notice {
        lines.push(notice.to_string());
        return lines.join("\n");
    }
    lines.push(chart(&view.chart, width));
    lines.push(String::new());
    lines.push(format!("{:<19}  {:>12}", "timestamp", "predicted"));
    for record in view.preview.iter().take(limit) {
        lines.push(format!(
            "{:<19}  {:>12.2}",
            record.timestamp.format(TIME_FORMAT),
            record.predicted_energy
        ));
    }
    if view.preview.len() > limit {
        lines.push(format!("... {} more rows", view.preview.len() - limit));
    }
    lines.join("\n")
}

/// Key/mean/count table of a roll-up or drill-down.
pub fn grouped(title: &str, view: &GroupedView) -> String {
    let mut lines = vec![title.to_string()];
    if let Some(notice) = view.status().notice() {
        lines.push(format!("  {notice}"));
        return lines.join("\n");
    }
    lines.push(format!("  {:>5}  {:>12}  {:>6}", view.unit, "mean", "rows"));
    for (key, stat) in view.groups() {
        lines.push(format!("  {key:>5}  {:>12.2}  {:>6}", stat.mean(), stat.count()));
    }
    lines.join("\n")
}

/// Rows of a slice or dice, truncated to `limit`.
pub fn rows(title: &str, view: &SliceView, limit: usize) -> String {
    let mut lines = vec![format!("{title} ({} rows)", view.len())];
    if let Some(notice) = view.status().notice() {
        lines.push(format!("  {notice}"));
        return lines.join("\n");
    }
    for row in view.rows.iter().take(limit) {
        lines.push(format!(
            "  {}  {:>12.2}",
            row.timestamp.format(TIME_FORMAT),
            row.predicted_energy
        ));
    }
    if view.len() > limit {
        lines.push(format!("  ... {} more rows", view.len() - limit));
    }
    lines.join("\n")
}

/// Cross-tab grid; absent cells print as `-`.
pub fn pivot_table(title: &str, table: &PivotTable) -> String {
    let mut lines = vec![format!("{title} ({} x {})", table.row_unit, table.column_unit)];
    if let Some(notice) = table.status().notice() {
        lines.push(format!("  {notice}"));
        return lines.join("\n");
    }
    let columns = table.column_keys();
    let mut header = format!("  {:>5}", table.row_unit);
    for column in &columns {
        header.push_str(&format!(" {column:>8}"));
    }
    lines.push(header);
    for row in table.row_keys() {
        let mut line = format!("  {row:>5}");
        for column in &columns {
            match table.cell(row, *column) {
                Some(mean) => line.push_str(&format!(" {mean:>8.2}")),
                None => line.push_str(&format!(" {:>8}", "-")),
            }
        }
        lines.push(line);
    }
    lines.join("\n")
}

/// The five standard views.
pub fn olap(report: &OlapReport, params: &OlapParams, limit: usize) -> String {
    let (low, high) = params.dice_hours;
    [
        grouped("Roll-up: mean by month", &report.monthly),
        grouped(
            &format!("Drill-down: month {} by day", params.drill_month),
            &report.daily,
        ),
        rows(&format!("Slice: hour {}", params.slice_hour), &report.slice, limit),
        rows(
            &format!(
                "Dice: month {} and hour {low}..={high}",
                params.dice_month
            ),
            &report.dice,
            limit,
        ),
        pivot_table("Pivot: mean by hour and day", &report.pivot),
    ]
    .join("\n\n")
}

fn persist_line(status: &PersistStatus) -> String {
    match status {
        PersistStatus::Stored => "stored".into(),
        PersistStatus::Failed(reason) => format!("NOT stored ({reason})"),
    }
}

/// Batch run summary.
pub fn batch(report: &BatchReport) -> String {
    let mae = report
        .evaluation
        .holdout_mae
        .map_or_else(|| "n/a".to_string(), |mae| format!("{mae:.3}"));
    [
        format!("run        {}", report.run_id),
        format!("model      {}", report.model_id),
        format!("rows       {}", report.rows),
        format!(
            "training   {} rows, holdout {} rows",
            report.evaluation.training_rows, report.evaluation.holdout_rows
        ),
        format!("holdout    MAE {mae}"),
        format!(
            "artifact   {}",
            if report.artifact_saved { "saved" } else { "not saved" }
        ),
        format!("store      {}", persist_line(&report.persisted)),
    ]
    .join("\n")
}

/// Result of one interactive prediction.
pub fn prediction(outcome: &PredictionOutcome, width: usize) -> String {
    let mut lines = vec![format!(
        "Predicted energy consumption: {:.2} kWh",
        outcome.predicted_energy
    )];
    lines.push(format!("store: {}", persist_line(&outcome.persisted)));
    if let Some(reason) = &outcome.history_error {
        lines.push(format!("history unavailable ({reason})"));
    }
    lines.push(String::new());
    lines.push(chart(&outcome.chart, width));
    lines.push(String::new());
    for (name, value) in &outcome.features {
        lines.push(format!("  {name:<22} {value}"));
    }
    lines.join("\n")
}
