use std::collections::HashMap;

use crate::sheet::melt::{Melted, MeltedRow};

/// Ceiling a raw vintage year to the next multiple of 5, anchored at 2000:
/// 2010 -> 2010, 2011 -> 2015, 2019 -> 2020.
pub fn quinquennium(vintage: i32) -> i32 {
    2000 + 5 * (vintage - 2000 + 4).div_euclid(5)
}

/// How values that land in the same vintage bucket are combined.  There is
/// no universal rule: capacities sum, efficiencies and factors average, and
/// at least one table takes the minimum.  The choice is a required per-table
/// configuration input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reducer {
    Sum,
    Mean,
    Min,
}

impl Reducer {
    pub fn apply(&self, values: &[f64]) -> f64 {
        match self {
            Reducer::Sum => values.iter().sum(),
            Reducer::Mean => values.iter().sum::<f64>() / values.len() as f64,
            Reducer::Min => values.iter().cloned().fold(f64::INFINITY, f64::min),
        }
    }
}

/// Aggregate rows at or before `cutoff` into quinquennial vintage buckets,
/// grouped by the full descriptive key; rows after the cutoff pass through
/// untouched.  Output order is bucketed rows first, then pass-through rows,
/// which downstream treats as a set anyway.
pub fn aggregate_vintages(melted: Melted, cutoff: i32, reducer: Reducer) -> Melted {
    let mut groups: HashMap<(Vec<crate::sheet::table::Cell>, i32), Vec<f64>> = HashMap::new();
    let mut order: Vec<(Vec<crate::sheet::table::Cell>, i32)> = Vec::new();
    let mut passthrough: Vec<MeltedRow> = Vec::new();

    for row in melted.rows {
        if row.year <= cutoff {
            let key = (row.id, quinquennium(row.year));
            if !groups.contains_key(&key) {
                order.push(key.clone());
            }
            groups.entry(key).or_default().push(row.value);
        } else {
            passthrough.push(row);
        }
    }

    let mut rows: Vec<MeltedRow> = order
        .into_iter()
        .map(|key| {
            let values = &groups[&key];
            let value = reducer.apply(values);
            MeltedRow {
                id: key.0,
                year: key.1,
                value,
            }
        })
        .collect();
    rows.extend(passthrough);

    Melted {
        id_columns: melted.id_columns,
        rows,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sheet::table::Cell;

    #[test]
    fn quinquennium_ceils_to_multiple_of_five() {
        assert_eq!(quinquennium(2010), 2010);
        assert_eq!(quinquennium(2011), 2015);
        assert_eq!(quinquennium(2014), 2015);
        assert_eq!(quinquennium(2015), 2015);
        assert_eq!(quinquennium(2019), 2020);
        for v in 1990..2060 {
            let b = quinquennium(v);
            assert!(b >= v);
            assert_eq!(b % 5, 0);
            assert!(b - v <= 4);
        }
    }

    fn rows(entries: &[(i32, f64)]) -> Melted {
        Melted {
            id_columns: vec!["Region".into(), "Technology".into()],
            rows: entries
                .iter()
                .map(|&(year, value)| MeltedRow {
                    id: vec![Cell::Text("ON".into()), Cell::Text("T_LDV_C".into())],
                    year,
                    value,
                })
                .collect(),
        }
    }

    #[test]
    fn sum_reducer_combines_bucket() {
        // 2011, 2013, 2014 all bucket to 2015
        let melted = rows(&[(2011, 10.0), (2013, 20.0), (2014, 5.0)]);
        let agg = aggregate_vintages(melted, 2020, Reducer::Sum);
        assert_eq!(agg.rows.len(), 1);
        assert_eq!(agg.rows[0].year, 2015);
        assert_eq!(agg.rows[0].value, 35.0);
    }

    #[test]
    fn mean_and_min_reducers() {
        let melted = rows(&[(2016, 0.4), (2018, 0.8)]);
        let mean = aggregate_vintages(melted.clone(), 2020, Reducer::Mean);
        assert_eq!(mean.rows[0].value, 0.6000000000000001);
        let min = aggregate_vintages(melted, 2020, Reducer::Min);
        assert_eq!(min.rows[0].value, 0.4);
    }

    #[test]
    fn post_cutoff_rows_pass_through() {
        let melted = rows(&[(2019, 1.0), (2025, 2.0), (2030, 3.0)]);
        let agg = aggregate_vintages(melted, 2020, Reducer::Sum);
        assert_eq!(agg.rows.len(), 3);
        assert!(agg.rows.iter().any(|r| r.year == 2020 && r.value == 1.0));
        assert!(agg.rows.iter().any(|r| r.year == 2025 && r.value == 2.0));
        assert!(agg.rows.iter().any(|r| r.year == 2030 && r.value == 3.0));
    }

    #[test]
    fn distinct_keys_stay_separate() {
        let mut melted = rows(&[(2012, 1.0)]);
        melted.rows.push(MeltedRow {
            id: vec![Cell::Text("QC".into()), Cell::Text("T_LDV_C".into())],
            year: 2012,
            value: 9.0,
        });
        let agg = aggregate_vintages(melted, 2020, Reducer::Sum);
        assert_eq!(agg.rows.len(), 2);
    }
}
