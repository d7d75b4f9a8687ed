use crate::sheet::table::Cell;

/// Temporal data-quality score from the age of the underlying data year:
/// <=3y -> 1, <=6y -> 2, <=10y -> 3, <=15y -> 4, older -> 5.  Non-numeric
/// input yields an empty cell, matching the rest of the DQI columns.
pub fn dq_time(data_year: &Cell, base_year: i32) -> Cell {
    let year = match data_year.as_f64() {
        Some(y) => y as i32,
        None => return Cell::Empty,
    };
    let diff = (base_year - year).abs();
    let score = match diff {
        0..=3 => 1,
        4..=6 => 2,
        7..=10 => 3,
        11..=15 => 4,
        _ => 5,
    };
    Cell::Number(score as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundaries() {
        assert_eq!(dq_time(&Cell::Number(2026.0), 2026), Cell::Number(1.0));
        assert_eq!(dq_time(&Cell::Number(2023.0), 2026), Cell::Number(1.0));
        assert_eq!(dq_time(&Cell::Number(2022.0), 2026), Cell::Number(2.0));
        assert_eq!(dq_time(&Cell::Number(2020.0), 2026), Cell::Number(2.0));
        assert_eq!(dq_time(&Cell::Number(2019.0), 2026), Cell::Number(3.0));
        assert_eq!(dq_time(&Cell::Number(2016.0), 2026), Cell::Number(3.0));
        assert_eq!(dq_time(&Cell::Number(2015.0), 2026), Cell::Number(4.0));
        assert_eq!(dq_time(&Cell::Number(2011.0), 2026), Cell::Number(4.0));
        assert_eq!(dq_time(&Cell::Number(2010.0), 2026), Cell::Number(5.0));
    }

    #[test]
    fn non_numeric_is_empty() {
        assert_eq!(dq_time(&Cell::Text("unknown".into()), 2026), Cell::Empty);
        assert_eq!(dq_time(&Cell::Empty, 2026), Cell::Empty);
    }
}
