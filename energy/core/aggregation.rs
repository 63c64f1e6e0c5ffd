//! OLAP-style views over predictions: roll-up, drill-down, slice, dice and
//! pivot. All views are read-only projections recomputed on demand; group
//! keys iterate in ascending numeric order.

use std::{collections::BTreeMap, fmt, ops::RangeInclusive};

use chrono::NaiveDateTime;
use serde::{ser::SerializeSeq, Deserialize, Serialize, Serializer};

use crate::record::{PredictionRecord, TimeParts};

/// Notice shown instead of an empty view.
pub const NO_DATA_NOTICE: &str = "no data";

/// Time dimension usable as a grouping key or filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    /// 0..=23
    Hour,
    /// 1..=31
    Day,
    /// 1..=12
    Month,
}

impl TimeUnit {
    /// Extracts this unit from time parts.
    #[must_use]
    pub const fn of(self, parts: &TimeParts) -> u32 {
        match self {
            Self::Hour => parts.hour,
            Self::Day => parts.day,
            Self::Month => parts.month,
        }
    }

    /// Valid values.
    #[must_use]
    pub const fn bounds(self) -> RangeInclusive<u32> {
        match self {
            Self::Hour => 0..=23,
            Self::Day => 1..=31,
            Self::Month => 1..=12,
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Month => "month",
        })
    }
}

/// Prediction with its time fields extracted once.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnnotatedPrediction {
    /// Observation time.
    pub timestamp: NaiveDateTime,
    /// Zone identifier.
    pub zone: String,
    /// Model output.
    pub predicted_energy: f64,
    /// Derived hour/day/month.
    pub time: TimeParts,
}

impl From<&PredictionRecord> for AnnotatedPrediction {
    fn from(record: &PredictionRecord) -> Self {
        Self {
            timestamp: record.timestamp,
            zone: record.zone.clone(),
            predicted_energy: record.predicted_energy,
            time: TimeParts::from_timestamp(&record.timestamp),
        }
    }
}

/// Annotates records in order.
#[must_use]
pub fn annotate(records: &[PredictionRecord]) -> Vec<AnnotatedPrediction> {
    records.iter().map(AnnotatedPrediction::from).collect()
}

/// Whether a view holds anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewStatus {
    /// At least one row or group.
    Populated,
    /// Empty view; show [`NO_DATA_NOTICE`].
    NoData,
}

impl ViewStatus {
    const fn from_empty(empty: bool) -> Self {
        if empty {
            Self::NoData
        } else {
            Self::Populated
        }
    }

    /// Notice for empty views.
    #[must_use]
    pub const fn notice(self) -> Option<&'static str> {
        match self {
            Self::Populated => None,
            Self::NoData => Some(NO_DATA_NOTICE),
        }
    }
}

/// Running mean of one group.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct GroupStat {
    sum: f64,
    count: usize,
}

impl GroupStat {
    fn push(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    /// Mean of the contributing values.
    #[must_use]
    pub fn mean(&self) -> f64 {
        self.sum / self.count.max(1) as f64
    }

    /// Number of contributing values.
    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }
}

/// Mean per group key (roll-up and drill-down).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupedView {
    /// Grouping dimension.
    pub unit: TimeUnit,
    groups: BTreeMap<u32, GroupStat>,
}

impl GroupedView {
    fn collect<'a>(unit: TimeUnit, records: impl Iterator<Item = &'a AnnotatedPrediction>) -> Self {
        let mut groups: BTreeMap<u32, GroupStat> = BTreeMap::new();
        for record in records {
            groups
                .entry(unit.of(&record.time))
                .or_default()
                .push(record.predicted_energy);
        }
        Self { unit, groups }
    }

    /// Mean for one key.
    #[must_use]
    pub fn mean(&self, key: u32) -> Option<f64> {
        self.groups.get(&key).map(GroupStat::mean)
    }

    /// `(key, mean)` pairs in ascending key order.
    pub fn means(&self) -> impl Iterator<Item = (u32, f64)> + '_ {
        self.groups.iter().map(|(key, stat)| (*key, stat.mean()))
    }

    /// Group statistics in ascending key order.
    pub fn groups(&self) -> impl Iterator<Item = (u32, &GroupStat)> + '_ {
        self.groups.iter().map(|(key, stat)| (*key, stat))
    }

    /// Number of groups.
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// `true` when no group exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Populated or no-data.
    #[must_use]
    pub fn status(&self) -> ViewStatus {
        ViewStatus::from_empty(self.is_empty())
    }
}

/// Projected row of a slice or dice.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SliceRow {
    /// Observation time.
    pub timestamp: NaiveDateTime,
    /// Model output.
    pub predicted_energy: f64,
}

/// Filtered rows in their original order.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SliceView {
    /// Matching rows.
    pub rows: Vec<SliceRow>,
}

impl SliceView {
    fn collect<'a>(records: impl Iterator<Item = &'a AnnotatedPrediction>) -> Self {
        Self {
            rows: records
                .map(|record| SliceRow {
                    timestamp: record.timestamp,
                    predicted_energy: record.predicted_energy,
                })
                .collect(),
        }
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// `true` when no row matched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Populated or no-data.
    #[must_use]
    pub fn status(&self) -> ViewStatus {
        ViewStatus::from_empty(self.is_empty())
    }
}

/// Inclusive range filter on one dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DicePredicate {
    /// Filtered dimension.
    pub unit: TimeUnit,
    /// Accepted values.
    pub range: RangeInclusive<u32>,
}

impl DicePredicate {
    /// `unit == value`.
    #[must_use]
    pub const fn equals(unit: TimeUnit, value: u32) -> Self {
        Self {
            unit,
            range: value..=value,
        }
    }

    /// `low <= unit <= high`.
    #[must_use]
    pub const fn between(unit: TimeUnit, low: u32, high: u32) -> Self {
        Self {
            unit,
            range: low..=high,
        }
    }

    /// Whether the parts satisfy this predicate.
    #[must_use]
    pub fn matches(&self, parts: &TimeParts) -> bool {
        self.range.contains(&self.unit.of(parts))
    }
}

/// Two-dimensional mean table. Cells with no contributing rows are absent,
/// never zero.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PivotTable {
    /// Row dimension.
    pub row_unit: TimeUnit,
    /// Column dimension.
    pub column_unit: TimeUnit,
    #[serde(serialize_with = "serialize_cells")]
    cells: BTreeMap<(u32, u32), GroupStat>,
}

#[derive(Serialize)]
struct PivotCell {
    row: u32,
    column: u32,
    mean: f64,
    count: usize,
}

fn serialize_cells<S: Serializer>(
    cells: &BTreeMap<(u32, u32), GroupStat>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    let mut seq = serializer.serialize_seq(Some(cells.len()))?;
    for ((row, column), stat) in cells {
        seq.serialize_element(&PivotCell {
            row: *row,
            column: *column,
            mean: stat.mean(),
            count: stat.count(),
        })?;
    }
    seq.end()
}

impl PivotTable {
    /// Mean for one cell, `None` when no prediction has those keys.
    #[must_use]
    pub fn cell(&self, row: u32, column: u32) -> Option<f64> {
        self.cells.get(&(row, column)).map(GroupStat::mean)
    }

    /// Distinct row keys, ascending.
    #[must_use]
    pub fn row_keys(&self) -> Vec<u32> {
        let mut keys: Vec<u32> = self.cells.keys().map(|(row, _)| *row).collect();
        keys.dedup();
        keys
    }

    /// Distinct column keys, ascending.
    #[must_use]
    pub fn column_keys(&self) -> Vec<u32> {
        let mut keys: Vec<u32> = self.cells.keys().map(|(_, column)| *column).collect();
        keys.sort_unstable();
        keys.dedup();
        keys
    }

    /// Number of populated cells.
    #[must_use]
    pub fn populated_cells(&self) -> usize {
        self.cells.len()
    }

    /// Populated or no-data.
    #[must_use]
    pub fn status(&self) -> ViewStatus {
        ViewStatus::from_empty(self.cells.is_empty())
    }
}

/// Groups by `unit` and averages (e.g. monthly means).
#[must_use]
pub fn roll_up(records: &[AnnotatedPrediction], unit: TimeUnit) -> GroupedView {
    GroupedView::collect(unit, records.iter())
}

/// Fixes `coarse == value`, then groups by `fine` and averages.
#[must_use]
pub fn drill_down(
    records: &[AnnotatedPrediction],
    coarse: TimeUnit,
    value: u32,
    fine: TimeUnit,
) -> GroupedView {
    GroupedView::collect(
        fine,
        records
            .iter()
            .filter(|record| coarse.of(&record.time) == value),
    )
}

/// Rows where `unit == value`.
#[must_use]
pub fn slice(records: &[AnnotatedPrediction], unit: TimeUnit, value: u32) -> SliceView {
    dice(records, &[DicePredicate::equals(unit, value)])
}

/// Rows satisfying every predicate. No predicates keeps every row.
#[must_use]
pub fn dice(records: &[AnnotatedPrediction], predicates: &[DicePredicate]) -> SliceView {
    SliceView::collect(records.iter().filter(|record| {
        predicates
            .iter()
            .all(|predicate| predicate.matches(&record.time))
    }))
}

/// Mean per `(rows, columns)` key pair.
#[must_use]
pub fn pivot(records: &[AnnotatedPrediction], rows: TimeUnit, columns: TimeUnit) -> PivotTable {
    let mut cells: BTreeMap<(u32, u32), GroupStat> = BTreeMap::new();
    for record in records {
        cells
            .entry((rows.of(&record.time), columns.of(&record.time)))
            .or_default()
            .push(record.predicted_energy);
    }
    PivotTable {
        row_unit: rows,
        column_unit: columns,
        cells,
    }
}

/// Filter values for the standard report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OlapParams {
    /// Month expanded by the drill-down.
    pub drill_month: u32,
    /// Hour fixed by the slice.
    pub slice_hour: u32,
    /// Month fixed by the dice.
    pub dice_month: u32,
    /// Inclusive hour range of the dice.
    pub dice_hours: (u32, u32),
}

impl Default for OlapParams {
    fn default() -> Self {
        Self {
            drill_month: 1,
            slice_hour: 9,
            dice_month: 1,
            dice_hours: (8, 10),
        }
    }
}

/// The five standard views over one set of predictions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OlapReport {
    /// Mean per month.
    pub monthly: GroupedView,
    /// Mean per day within `drill_month`.
    pub daily: GroupedView,
    /// Rows at `slice_hour`.
    pub slice: SliceView,
    /// Rows in `dice_month` within `dice_hours`.
    pub dice: SliceView,
    /// Hour by day means.
    pub pivot: PivotTable,
}

impl OlapReport {
    /// Computes every view.
    #[must_use]
    pub fn build(records: &[AnnotatedPrediction], params: &OlapParams) -> Self {
        let (low, high) = params.dice_hours;
        Self {
            monthly: roll_up(records, TimeUnit::Month),
            daily: drill_down(records, TimeUnit::Month, params.drill_month, TimeUnit::Day),
            slice: slice(records, TimeUnit::Hour, params.slice_hour),
            dice: dice(
                records,
                &[
                    DicePredicate::equals(TimeUnit::Month, params.dice_month),
                    DicePredicate::between(TimeUnit::Hour, low, high),
                ],
            ),
            pivot: pivot(records, TimeUnit::Hour, TimeUnit::Day),
        }
    }

    /// `true` when every view is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.monthly.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(month: u32, day: u32, hour: u32, value: f64) -> AnnotatedPrediction {
        let timestamp = NaiveDate::from_ymd_opt(2022, month, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap();
        AnnotatedPrediction::from(&PredictionRecord::new(timestamp, "ZoneA", value))
    }

    #[test]
    fn monthly_roll_up_averages_a_single_day() {
        let records = vec![at(1, 1, 0, 10.0), at(1, 1, 1, 20.0), at(1, 1, 2, 30.0)];
        let monthly = roll_up(&records, TimeUnit::Month);
        assert_eq!(monthly.len(), 1);
        assert_eq!(monthly.mean(1), Some(20.0));
        let daily = drill_down(&records, TimeUnit::Month, 1, TimeUnit::Day);
        assert_eq!(daily.mean(1), monthly.mean(1));
    }

    #[test]
    fn groups_iterate_in_ascending_order() {
        let records = vec![at(3, 2, 0, 1.0), at(1, 9, 0, 2.0), at(12, 1, 0, 3.0), at(1, 4, 0, 4.0)];
        let keys: Vec<u32> = roll_up(&records, TimeUnit::Month).means().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![1, 3, 12]);
        let days: Vec<u32> = drill_down(&records, TimeUnit::Month, 1, TimeUnit::Day)
            .means()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(days, vec![4, 9]);
    }

    #[test]
    fn slice_keeps_matching_rows_in_order() {
        let records = vec![at(1, 1, 9, 5.0), at(1, 1, 10, 6.0), at(2, 3, 9, 7.0)];
        let view = slice(&records, TimeUnit::Hour, 9);
        let values: Vec<f64> = view.rows.iter().map(|r| r.predicted_energy).collect();
        assert_eq!(values, vec![5.0, 7.0]);
    }

    #[test]
    fn dice_applies_every_predicate_in_original_order() {
        let records = vec![
            at(1, 1, 7, 1.0),
            at(1, 1, 8, 2.0),
            at(2, 1, 9, 3.0),
            at(1, 2, 10, 4.0),
            at(1, 2, 9, 5.0),
        ];
        let view = dice(
            &records,
            &[
                DicePredicate::equals(TimeUnit::Month, 1),
                DicePredicate::between(TimeUnit::Hour, 8, 10),
            ],
        );
        let values: Vec<f64> = view.rows.iter().map(|r| r.predicted_energy).collect();
        assert_eq!(values, vec![2.0, 4.0, 5.0]);
        assert_eq!(dice(&records, &[]).len(), 5);
    }

    #[test]
    fn pivot_cells_are_means_or_absent() {
        let records = vec![
            at(1, 15, 9, 10.0),
            at(2, 15, 9, 30.0),
            at(1, 16, 9, 8.0),
            at(1, 15, 10, 1.0),
        ];
        let table = pivot(&records, TimeUnit::Hour, TimeUnit::Day);
        assert_eq!(table.cell(9, 15), Some(20.0));
        assert_eq!(table.cell(9, 16), Some(8.0));
        assert_eq!(table.cell(10, 16), None);
        assert_eq!(table.row_keys(), vec![9, 10]);
        assert_eq!(table.column_keys(), vec![15, 16]);
        assert_eq!(table.populated_cells(), 3);
    }

    #[test]
    fn empty_input_signals_no_data() {
        let report = OlapReport::build(&[], &OlapParams::default());
        assert!(report.is_empty());
        assert_eq!(report.monthly.status(), ViewStatus::NoData);
        assert_eq!(report.slice.status().notice(), Some(NO_DATA_NOTICE));
        assert_eq!(report.pivot.status(), ViewStatus::NoData);
        assert_eq!(report.pivot.cell(9, 15), None);
    }

    #[test]
    fn report_uses_configured_filters() {
        let records = vec![at(1, 5, 9, 4.0), at(1, 6, 11, 6.0), at(2, 5, 9, 8.0)];
        let report = OlapReport::build(&records, &OlapParams::default());
        assert_eq!(report.monthly.mean(1), Some(5.0));
        assert_eq!(report.daily.len(), 2);
        assert_eq!(report.slice.len(), 2);
        assert_eq!(report.dice.len(), 1);
        assert_eq!(report.monthly.status(), ViewStatus::Populated);
    }

    #[test]
    fn report_serializes_pivot_cells_as_list() {
        let records = vec![at(1, 15, 9, 10.0), at(1, 15, 9, 30.0)];
        let report = OlapReport::build(&records, &OlapParams::default());
        let value = serde_json::to_value(&report).unwrap();
        let cells = value["pivot"]["cells"].as_array().unwrap();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0]["row"], 9);
        assert_eq!(cells[0]["column"], 15);
        assert_eq!(cells[0]["mean"], 20.0);
        assert_eq!(value["monthly"]["groups"]["1"]["count"], 2);
    }
}
