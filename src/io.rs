/*!
# Trace log I/O

Chains append tab-separated rows to their trace log: the integer sample index
first, then one numeric column per logged quantity. Lines starting with `#`
are comments; a single header line is tolerated because the coordinator's
parser skips anything that does not parse as numbers.

Every row is flushed immediately so the coordinator's tailer threads see
complete lines while the chain is still running.

With the `csv` feature enabled, collected traces can also be exported as CSV.
*/

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::Result;

/// Appends tab-separated sample rows to a trace log file.
pub struct TraceWriter {
    out: BufWriter<File>,
}

impl TraceWriter {
    pub fn create(path: &Path) -> Result<Self> {
        Ok(Self {
            out: BufWriter::new(File::create(path)?),
        })
    }

    /// Write a `#`-prefixed comment line.
    pub fn write_comment(&mut self, text: &str) -> Result<()> {
        writeln!(self.out, "# {text}")?;
        self.out.flush()?;
        Ok(())
    }

    /// Write the column header line.
    pub fn write_header(&mut self, columns: &[String]) -> Result<()> {
        writeln!(self.out, "{}", columns.join("\t"))?;
        self.out.flush()?;
        Ok(())
    }

    /// Write one sample row and flush it so tailing readers see it promptly.
    pub fn write_row(&mut self, sample: u64, values: &[f64]) -> Result<()> {
        write!(self.out, "{sample}")?;
        for v in values {
            write!(self.out, "\t{v}")?;
        }
        writeln!(self.out)?;
        self.out.flush()?;
        Ok(())
    }
}

/// Parse one trace log line into its numeric fields.
///
/// Returns `None` for comment lines, lines with fewer than two fields (the
/// sample index alone carries no information) and lines with any non-numeric
/// field, such as the header.
pub fn parse_log_line(line: &str) -> Option<Vec<f64>> {
    if line.starts_with('#') {
        return None;
    }
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() <= 1 {
        return None;
    }
    fields.iter().map(|f| f.parse::<f64>().ok()).collect()
}

/// True for lines the tailer drops without a diagnostic: comments, blanks
/// and single-field lines.
pub fn is_silent_skip(line: &str) -> bool {
    line.starts_with('#') || line.split_whitespace().count() <= 1
}

/**
Saves trace data of shape **chain × sample × column** as a CSV file.

The header row is `chain`, `sample`, then `col_0`, `col_1`, … per trace
column; each record holds one sample of one chain. Enable via the `csv`
feature.
*/
#[cfg(feature = "csv")]
pub fn save_csv<T: std::fmt::Display>(
    data: &ndarray::Array3<T>,
    filename: &str,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    use ndarray::Axis;

    let mut wtr = csv::Writer::from_writer(File::create(filename)?);
    let n_cols = data.shape()[2];

    let mut header: Vec<String> = vec!["chain".to_string(), "sample".to_string()];
    header.extend((0..n_cols).map(|i| format!("col_{}", i)));
    wtr.write_record(&header)?;

    for (chain_idx, chain) in data.axis_iter(Axis(0)).enumerate() {
        for (sample_idx, sample) in chain.axis_iter(Axis(0)).enumerate() {
            let mut row = vec![chain_idx.to_string(), sample_idx.to_string()];
            row.extend(sample.iter().map(|v| v.to_string()));
            wtr.write_record(&row)?;
        }
    }

    wtr.flush()?;
    Ok(())
}
