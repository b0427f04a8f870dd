use std::{
    fs::File,
    io::{BufRead, BufWriter, Write},
    path::Path,
};

use serde::{Deserialize, Serialize};

use crate::{FeatureVector, Result};

/// One line of a feature recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub sequence: u64,
    pub time_seconds: f64,
    pub features: FeatureVector,
}

#[derive(Serialize)]
struct RecordRef<'a> {
    sequence: u64,
    time_seconds: f64,
    features: &'a FeatureVector,
}

/// Writes smoothed feature vectors as JSON lines for offline inspection.
#[derive(Debug)]
pub struct FeatureRecorder<W: Write> {
    writer: W,
    records: u64,
}

impl FeatureRecorder<BufWriter<File>> {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> FeatureRecorder<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, records: 0 }
    }

    pub fn record(&mut self, sequence: u64, time_seconds: f64, features: &FeatureVector) -> Result<()> {
        let record = RecordRef {
            sequence,
            time_seconds,
            features,
        };
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        self.records += 1;
        Ok(())
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    /// Flushes and hands back the writer.
    pub fn finish(mut self) -> Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

/// Parses a recording produced by [`FeatureRecorder`]. Blank lines are
/// skipped.
pub fn read_records(reader: impl BufRead) -> Result<Vec<FeatureRecord>> {
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BandTable;

    #[test]
    fn writes_one_line_per_frame() {
        let bands = BandTable::default();
        let mut features = FeatureVector::silent(&bands);
        let mut recorder = FeatureRecorder::new(Vec::new());

        recorder.record(0, 0.0, &features).unwrap();
        features.loudness = 0.25;
        features.centroid_hz = 440.0;
        recorder.record(1, 0.023, &features).unwrap();
        assert_eq!(recorder.records(), 2);

        let bytes = recorder.finish().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.lines().all(|line| line.starts_with("{\"sequence\":")));

        let records = read_records(text.as_bytes()).unwrap();
        assert_eq!(records[1].sequence, 1);
        assert_eq!(records[1].features, features);
    }

    #[test]
    fn malformed_lines_are_reported() {
        let err = read_records("{\"sequence\": 1}\n".as_bytes()).unwrap_err();
        assert!(matches!(err, crate::LightsError::Json(_)));
    }
}
