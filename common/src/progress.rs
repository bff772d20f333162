use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Metric;

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("progress file is empty")]
    Empty,
    #[error("row {row}: expected 6 or 7 fields, got {fields}")]
    Width { row: usize, fields: usize },
    #[error("row {row}: could not parse '{value}'")]
    Value { row: usize, value: String },
    #[error("row {row}: tick '{value}' is not a whole number in range")]
    Tick { row: usize, value: String },
    #[error("tick span of {span} exceeds the limit of {}", MAX_TICKS)]
    Span { span: i64 },
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

/// Largest tick magnitude accepted from a file, the integer range of an f64
const MAX_TICK_VALUE: f64 = 9_007_199_254_740_992.0;

/// Longest dense range `fill` will materialise, a week of one second ticks
pub const MAX_TICKS: i64 = 7 * 24 * 60 * 60;

/// One row of a progress file
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub tc_total: f64,
    pub pm_tc_total: f64,
    pub total_path: f64,
    pub total_pm_path: f64,
    pub exec_rate: f64,
    pub actual_cases: f64,
}

impl ProgressRecord {
    pub fn metric(&self, metric: Metric) -> f64 {
        match metric {
            Metric::TcTotal => self.tc_total,
            Metric::PmTcTotal => self.pm_tc_total,
            Metric::TotalPath => self.total_path,
            Metric::TotalPmPath => self.total_pm_path,
            Metric::ExecRate => self.exec_rate,
            Metric::ActualCases => self.actual_cases,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressPoint {
    pub tick: i64,
    #[serde(flatten)]
    pub record: ProgressRecord,
}

/// Ordered progress rows of one run. Before [`ProgressSeries::fill`] ticks may
/// repeat and leave gaps.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSeries {
    pub points: Vec<ProgressPoint>,
}

static EMPTY: ProgressSeries = ProgressSeries { points: Vec::new() };

impl ProgressSeries {
    pub fn empty() -> &'static ProgressSeries {
        &EMPTY
    }

    /// Parses a progress file. The first row is a header. Rows carry either
    /// a leading tick and the six counters, or only the counters, in which
    /// case the row number is the tick.
    pub fn parse(data: &str) -> Result<Self, ProgressError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(data.as_bytes());

        let mut points = Vec::new();
        for (row, record) in reader.records().enumerate() {
            let record = record?;
            let values = record
                .iter()
                .map(|field| {
                    field.parse::<f64>().map_err(|_| ProgressError::Value {
                        row,
                        value: field.to_owned(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let (tick, counters) = match values.len() {
                7 => (parse_tick(row, values[0])?, &values[1..]),
                6 => (row as i64, &values[..]),
                fields => return Err(ProgressError::Width { row, fields }),
            };
            points.push(ProgressPoint {
                tick,
                record: ProgressRecord {
                    tc_total: counters[0],
                    pm_tc_total: counters[1],
                    total_path: counters[2],
                    total_pm_path: counters[3],
                    exec_rate: counters[4],
                    actual_cases: counters[5],
                },
            });
        }

        if points.is_empty() {
            return Err(ProgressError::Empty);
        }
        Ok(Self { points })
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn ticks(&self) -> impl Iterator<Item = i64> + '_ {
        self.points.iter().map(|p| p.tick)
    }

    /// Shifts ticks so the series starts at zero
    pub fn normalize(mut self) -> Result<Self, ProgressError> {
        if let Some(min) = self.ticks().min() {
            for point in &mut self.points {
                point.tick = point
                    .tick
                    .checked_sub(min)
                    .ok_or(ProgressError::Span { span: i64::MAX })?;
            }
        }
        Ok(self)
    }

    /// Reindexes onto every tick in `1..=max_tick`, forward filling gaps and
    /// back filling leading ticks. The last row wins when a tick repeats.
    /// Rows below tick 1 only seed the forward fill.
    /// Fails when `max_tick` is above [`MAX_TICKS`].
    pub fn fill(&self) -> Result<Self, ProgressError> {
        let Some(max) = self.ticks().max() else {
            return Ok(Self::default());
        };
        if max > MAX_TICKS {
            return Err(ProgressError::Span { span: max });
        }

        let mut by_tick = BTreeMap::new();
        for point in &self.points {
            by_tick.insert(point.tick, point.record);
        }
        let mut carried = by_tick.range(..1).next_back().map(|(_, r)| *r);
        let first = by_tick.range(1..).next().map(|(_, r)| *r);

        let mut points = Vec::with_capacity(max.max(0) as usize);
        for tick in 1..=max {
            if let Some(record) = by_tick.get(&tick) {
                carried = Some(*record);
            }
            if let Some(record) = carried.or(first) {
                points.push(ProgressPoint { tick, record });
            }
        }
        Ok(Self { points })
    }

    /// Keeps every `step`-th row, starting with the first
    pub fn downsample(&self, step: usize) -> Self {
        Self {
            points: self.points.iter().step_by(step.max(1)).copied().collect(),
        }
    }

    /// Normalize, fill and downsample in one go
    pub fn align(self, step: usize) -> Result<Self, ProgressError> {
        Ok(self.normalize()?.fill()?.downsample(step))
    }

    pub fn metric(&self, metric: Metric) -> Vec<(i64, f64)> {
        self.points
            .iter()
            .map(|p| (p.tick, p.record.metric(metric)))
            .collect()
    }
}

fn parse_tick(row: usize, value: f64) -> Result<i64, ProgressError> {
    if !value.is_finite() || value.fract() != 0.0 || value.abs() > MAX_TICK_VALUE {
        return Err(ProgressError::Tick {
            row,
            value: value.to_string(),
        });
    }
    Ok(value as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "tick,tc_total,pm_tc_total,total_path,total_pm_path,exec_rate,actual_cases\n";

    fn series(rows: &[(i64, f64)]) -> ProgressSeries {
        ProgressSeries {
            points: rows
                .iter()
                .map(|&(tick, tc_total)| ProgressPoint {
                    tick,
                    record: ProgressRecord {
                        tc_total,
                        ..Default::default()
                    },
                })
                .collect(),
        }
    }

    #[test]
    fn parses_rows_with_tick_column() {
        let data = format!("{HEADER}3,10,2,30,4,1.5,11\n4,12,2,31,4,1.25,13\n");
        let parsed = ProgressSeries::parse(&data).unwrap();
        assert_eq!(parsed.ticks().collect::<Vec<_>>(), [3, 4]);
        assert_eq!(
            parsed.points[1].record,
            ProgressRecord {
                tc_total: 12.0,
                pm_tc_total: 2.0,
                total_path: 31.0,
                total_pm_path: 4.0,
                exec_rate: 1.25,
                actual_cases: 13.0,
            }
        );
    }

    #[test]
    fn six_field_rows_use_row_number_as_tick() {
        let data = "tc_total,pm_tc_total,total_path,total_pm_path,exec_rate,actual_cases\n\
                    1,0,1,0,9,1\n2,0,2,0,9,2\n";
        let parsed = ProgressSeries::parse(data).unwrap();
        assert_eq!(parsed.ticks().collect::<Vec<_>>(), [0, 1]);
        assert_eq!(parsed.points[1].record.tc_total, 2.0);
    }

    #[test]
    fn malformed_files_are_errors() {
        assert!(matches!(
            ProgressSeries::parse(HEADER),
            Err(ProgressError::Empty)
        ));
        assert!(matches!(
            ProgressSeries::parse(&format!("{HEADER}1,2,3\n")),
            Err(ProgressError::Width { fields: 3, .. })
        ));
        assert!(matches!(
            ProgressSeries::parse(&format!("{HEADER}1,2,3,x,5,6,7\n")),
            Err(ProgressError::Value { .. })
        ));
    }

    #[test]
    fn fill_covers_every_tick_with_carried_values() {
        let raw = series(&[(1, 1.0), (1, 2.0), (1, 3.0), (5, 5.0), (5, 6.0), (10, 10.0)]);
        let filled = raw.fill().unwrap();
        assert_eq!(filled.ticks().collect::<Vec<_>>(), (1..=10).collect::<Vec<_>>());
        let values = filled.metric(Metric::TcTotal);
        for (tick, value) in values {
            let expected = match tick {
                1..=4 => 3.0,
                5..=9 => 6.0,
                _ => 10.0,
            };
            assert_eq!(value, expected, "tick {tick}");
        }
    }

    #[test]
    fn fill_back_fills_leading_ticks() {
        let filled = series(&[(3, 7.0), (4, 8.0)]).fill().unwrap();
        assert_eq!(
            filled.metric(Metric::TcTotal),
            [(1, 7.0), (2, 7.0), (3, 7.0), (4, 8.0)]
        );
    }

    #[test]
    fn fill_only_copies_existing_values() {
        let raw = series(&[(0, 0.5), (2, 4.0), (7, 9.0), (8, 1.0), (20, 2.0)]);
        let originals = raw.metric(Metric::TcTotal).into_iter().map(|(_, v)| v).collect::<Vec<_>>();
        for (_, value) in raw.fill().unwrap().metric(Metric::TcTotal) {
            assert!(originals.contains(&value));
        }
    }

    #[test]
    fn tick_zero_seeds_the_forward_fill() {
        let filled = series(&[(0, 1.0), (3, 2.0)]).fill().unwrap();
        assert_eq!(
            filled.metric(Metric::TcTotal),
            [(1, 1.0), (2, 1.0), (3, 2.0)]
        );
    }

    #[test]
    fn fill_of_empty_or_single_tick_zero_series_is_empty() {
        assert!(ProgressSeries::default().fill().unwrap().is_empty());
        assert!(series(&[(0, 1.0)]).fill().unwrap().is_empty());
    }

    #[test]
    fn normalize_starts_at_zero() {
        let normalized = series(&[(100, 1.0), (101, 2.0), (105, 3.0)]).normalize().unwrap();
        assert_eq!(normalized.ticks().collect::<Vec<_>>(), [0, 1, 5]);
    }

    #[test]
    fn downsample_keeps_first_row() {
        let filled = series(&[(1, 1.0), (10, 2.0)]).fill().unwrap();
        for step in 1..12 {
            let sampled = filled.downsample(step);
            assert_eq!(sampled.points[0], filled.points[0]);
            assert_eq!(sampled.len(), filled.len().div_ceil(step));
        }
        assert_eq!(
            filled.downsample(4).ticks().collect::<Vec<_>>(),
            [1, 5, 9]
        );
    }

    #[test]
    fn ticks_must_be_finite_whole_numbers() {
        for tick in ["inf", "-inf", "NaN", "1.5", "1e300"] {
            let data = format!("{HEADER}0,1,0,1,0,1,1\n{tick},2,0,2,0,1,2\n");
            assert!(
                matches!(
                    ProgressSeries::parse(&data),
                    Err(ProgressError::Tick { row: 1, .. })
                ),
                "tick {tick}"
            );
        }
        let parsed = ProgressSeries::parse(&format!("{HEADER}2.0,1,0,1,0,1,1\n")).unwrap();
        assert_eq!(parsed.ticks().collect::<Vec<_>>(), [2]);
    }

    #[test]
    fn huge_tick_span_is_refused_instead_of_filled() {
        let data = format!("{HEADER}0,1,0,1,0,1,1\n1e15,2,0,2,0,1,2\n");
        let parsed = ProgressSeries::parse(&data).unwrap();
        assert!(matches!(parsed.align(900), Err(ProgressError::Span { .. })));

        let at_limit = series(&[(0, 1.0), (MAX_TICKS, 2.0)]).fill().unwrap();
        assert_eq!(at_limit.len(), MAX_TICKS as usize);
        assert!(series(&[(MAX_TICKS + 1, 1.0)]).fill().is_err());
    }

    #[test]
    fn normalize_reports_overflow() {
        let extreme = series(&[(i64::MIN, 1.0), (5, 2.0)]);
        assert!(matches!(extreme.normalize(), Err(ProgressError::Span { .. })));
    }
}
