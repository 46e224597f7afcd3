use crate::error::ModelError;
use crate::simulation::SimulationResult;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

const TIME_HEADER: &str = "Time";

/// Column names after `Time`. A label shared by several compartments (or
/// equal to `Time`) is suffixed with the compartment id so columns stay
/// distinct.
fn column_headers(result: &SimulationResult) -> Vec<String> {
    let mut uses: HashMap<&str, usize> = HashMap::from([(TIME_HEADER, 1)]);
    for series in &result.series {
        *uses.entry(series.label.as_str()).or_default() += 1;
    }
    result
        .series
        .iter()
        .map(|s| {
            if uses[s.label.as_str()] > 1 {
                format!("{} ({})", s.label, s.compartment)
            } else {
                s.label.clone()
            }
        })
        .collect()
}

/// Writes `Time` followed by one column per compartment label, one row per sample.
pub fn write_csv<W: Write>(result: &SimulationResult, writer: W) -> Result<(), ModelError> {
    let mut csv = csv::Writer::from_writer(writer);

    let mut header = Vec::with_capacity(result.series.len() + 1);
    header.push(TIME_HEADER.to_string());
    header.extend(column_headers(result));
    csv.write_record(&header)?;

    for (index, time) in result.times.iter().enumerate() {
        let mut record = Vec::with_capacity(header.len());
        record.push(time.to_string());
        for series in &result.series {
            let value = series.values.get(index).ok_or_else(|| {
                ModelError::Export(format!(
                    "series '{}' has no sample at index {index}",
                    series.compartment
                ))
            })?;
            record.push(value.to_string());
        }
        csv.write_record(&record)?;
    }
    csv.flush()?;
    Ok(())
}

pub fn to_csv_string(result: &SimulationResult) -> Result<String, ModelError> {
    let mut buffer = Vec::new();
    write_csv(result, &mut buffer)?;
    String::from_utf8(buffer).map_err(|err| ModelError::Export(err.to_string()))
}

pub fn export_csv(result: &SimulationResult, path: impl AsRef<Path>) -> Result<(), ModelError> {
    let file = std::fs::File::create(path.as_ref())?;
    write_csv(result, file)?;
    log::info!("Exported {} samples to {}", result.samples(), path.as_ref().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::ParameterSet;
    use crate::simulation::{CompartmentSeries, SolverStats};

    fn result() -> SimulationResult {
        SimulationResult {
            times: vec![0.0, 0.5, 1.0],
            series: vec![
                CompartmentSeries {
                    compartment: "S".into(),
                    label: "Susceptible".into(),
                    values: vec![0.99, 0.9, 0.75],
                },
                CompartmentSeries {
                    compartment: "I".into(),
                    label: "Infected, total".into(),
                    values: vec![0.01, 0.1, 0.25],
                },
            ],
            parameters: ParameterSet::new().with("beta", 0.3),
            initial_values: Default::default(),
            stats: SolverStats::default(),
            warnings: Vec::new(),
        }
    }

    #[test]
    fn csv_has_time_and_label_columns() {
        let text = to_csv_string(&result()).expect("csv");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Time,Susceptible,\"Infected, total\"");
        assert_eq!(lines[1], "0,0.99,0.01");
        assert_eq!(lines[2], "0.5,0.9,0.1");
        assert_eq!(lines[3], "1,0.75,0.25");
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn shared_labels_are_disambiguated_by_id() {
        let mut shared = result();
        shared.series[1].label = "Susceptible".into();
        shared.series.push(CompartmentSeries {
            compartment: "R".into(),
            label: "Time".into(),
            values: vec![0.0, 0.0, 0.0],
        });
        let text = to_csv_string(&shared).expect("csv");
        assert_eq!(
            text.lines().next(),
            Some("Time,Susceptible (S),Susceptible (I),Time (R)")
        );
    }

    #[test]
    fn ragged_series_are_an_export_error() {
        let mut ragged = result();
        ragged.series[1].values.pop();
        let err = to_csv_string(&ragged).unwrap_err();
        assert!(matches!(err, ModelError::Export(message) if message.contains("'I'")));
    }

    #[test]
    fn export_writes_a_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run.csv");
        export_csv(&result(), &path).expect("export");
        let written = std::fs::read_to_string(&path).expect("read back");
        assert_eq!(written, to_csv_string(&result()).expect("csv"));
    }

    #[test]
    fn unwritable_path_is_an_export_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing").join("run.csv");
        assert!(matches!(
            export_csv(&result(), &path),
            Err(ModelError::Export(_))
        ));
    }
}
