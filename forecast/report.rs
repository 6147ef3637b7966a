// forecast/report.rs

//! Result export and ranking helpers.

use crate::pipeline::CustomerProjection;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write CSV output: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Writes one CSV row per customer, with a header row.
pub fn write_projections_csv(
    path: &Path,
    projections: &[CustomerProjection],
) -> Result<(), ReportError> {
    let mut writer = csv::Writer::from_path(path)?;
    for projection in projections {
        writer.serialize(projection)?;
    }
    writer.flush()?;
    log::info!(
        "Wrote {} customer projections to '{}'.",
        projections.len(),
        path.display()
    );
    Ok(())
}

/// The `n` customers with the highest lifetime value, best first. Ties keep
/// input order.
pub fn top_by_lifetime_value(
    projections: &[CustomerProjection],
    n: usize,
) -> Vec<&CustomerProjection> {
    let mut ranked: Vec<&CustomerProjection> = projections.iter().collect();
    ranked.sort_by(|a, b| b.lifetime_value.total_cmp(&a.lifetime_value));
    ranked.truncate(n);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn projection(id: &str, value: f64) -> CustomerProjection {
        CustomerProjection {
            customer_id: id.to_string(),
            recency: 3.0,
            t: 10.0,
            frequency: 2,
            monetary: 20.0,
            expected_transactions_short: 0.4,
            expected_transactions_long: 0.7,
            probability_active: 0.8,
            expected_average_profit: 21.5,
            lifetime_value: value,
            segment: "B".to_string(),
        }
    }

    #[test]
    fn ranks_by_value_and_keeps_tie_order() {
        let projections = vec![
            projection("a", 5.0),
            projection("b", 9.0),
            projection("c", 5.0),
            projection("d", 1.0),
        ];
        let top: Vec<&str> = top_by_lifetime_value(&projections, 3)
            .iter()
            .map(|p| p.customer_id.as_str())
            .collect();
        assert_eq!(top, vec!["b", "a", "c"]);
        assert_eq!(top_by_lifetime_value(&projections, 10).len(), 4);
    }

    #[test]
    fn writes_header_and_rows() {
        let file = NamedTempFile::new().unwrap();
        write_projections_csv(file.path(), &[projection("a", 5.0), projection("b", 9.0)]).unwrap();

        let text = std::fs::read_to_string(file.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("customer_id,recency,t,frequency,monetary"));
        assert!(lines[0].ends_with("lifetime_value,segment"));
        assert!(lines[2].starts_with("b,"));
    }
}
