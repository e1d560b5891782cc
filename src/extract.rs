use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use flate2::read::GzDecoder;
use log::{info, warn};

use crate::dataset::{Column, ColumnType, Dataset, Value};
use crate::error::IngestError;

/// Column layout of the input file.  The header is checked against it, there
/// is no type inference.
#[derive(Debug, Clone)]
pub struct CsvSchema {
    /// Name of the timestamp column in the file, e.g. `Date Time`
    pub timestamp_source: String,
    /// Name the timestamp column gets in the dataset, e.g. `Date_Time`
    pub timestamp_column: String,
    pub timestamp_format: String,
    pub numeric_columns: Vec<String>,
}

impl CsvSchema {
    /// The Max Planck Institute weather station recording in Jena, 2009-2016.
    pub fn jena_climate() -> CsvSchema {
        CsvSchema {
            timestamp_source: "Date Time".to_string(),
            timestamp_column: "Date_Time".to_string(),
            timestamp_format: "%d.%m.%Y %H:%M:%S".to_string(),
            numeric_columns: [
                "p (mbar)",
                "T (degC)",
                "Tpot (K)",
                "Tdew (degC)",
                "rh (%)",
                "VPmax (mbar)",
                "VPact (mbar)",
                "VPdef (mbar)",
                "sh (g/kg)",
                "H2OC (mmol/mol)",
                "rho (g/m**3)",
                "wv (m/s)",
                "max. wv (m/s)",
                "wd (deg)",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkPolicy {
    /// Read one chunk and ignore the rest of the file.
    FirstChunk,
    /// Read chunk after chunk until the file is exhausted or `max_chunks`
    /// have been read.
    AllChunks { max_chunks: Option<usize> },
}

#[derive(Debug, Clone)]
pub struct Extractor {
    pub path: PathBuf,
    pub chunk_size: usize,
    pub policy: ChunkPolicy,
    pub schema: CsvSchema,
}

impl Extractor {
    pub fn new(path: &Path, chunk_size: usize, policy: ChunkPolicy) -> Extractor {
        Extractor {
            path: path.to_path_buf(),
            chunk_size,
            policy,
            schema: CsvSchema::jena_climate(),
        }
    }

    /// Read the file into one dataset, according to the chunk policy.
    pub fn extract(&self) -> Result<Dataset, IngestError> {
        info!("extracting {} ...", self.path.display());
        let file = File::open(&self.path)?;
        // accept both a csv or a csv.gz file
        let rdr: Box<dyn Read> = match self.path.extension().and_then(|e| e.to_str()) {
            Some("gz") => Box::new(GzDecoder::new(file)),
            _ => Box::new(file),
        };
        let ds = self.extract_from_reader(rdr)?;
        info!("extracted {} rows", ds.len());
        Ok(ds)
    }

    pub fn extract_from_reader<R: Read>(&self, rdr: R) -> Result<Dataset, IngestError> {
        let mut chunks = CsvChunks::new(rdr, &self.schema, self.chunk_size)?;
        let mut out = Dataset::new(chunks.columns().to_vec());
        let max_chunks = match self.policy {
            ChunkPolicy::FirstChunk => Some(1),
            ChunkPolicy::AllChunks { max_chunks } => max_chunks,
        };
        let mut count = 0;
        while max_chunks.map_or(true, |m| count < m) {
            match chunks.next() {
                Some(chunk) => {
                    out.extend(chunk?).map_err(|e| IngestError::format(0, e))?;
                    count += 1;
                }
                None => return Ok(out),
            }
        }
        // rows past the limit are never parsed, a bad one there doesn't matter
        if chunks.has_more().unwrap_or(true) {
            warn!(
                "stopped after {} chunk(s) of {} rows, the rest of the file was not read",
                count, self.chunk_size
            );
        }
        Ok(out)
    }
}

/// Iterate over a csv file `chunk_size` rows at a time.
pub struct CsvChunks<R: Read> {
    reader: csv::Reader<R>,
    columns: Vec<Column>,
    /// position in the file header of each dataset column
    source_index: Vec<usize>,
    timestamp_format: String,
    chunk_size: usize,
    record: csv::StringRecord,
    pending: bool,
    done: bool,
}

impl<R: Read> CsvChunks<R> {
    pub fn new(rdr: R, schema: &CsvSchema, chunk_size: usize) -> Result<CsvChunks<R>, IngestError> {
        if chunk_size == 0 {
            return Err(IngestError::Config("chunk size must be positive".to_string()));
        }
        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(rdr);
        let header = reader.headers()?.clone();

        let mut columns = Vec::with_capacity(header.len());
        let mut source_index = Vec::with_capacity(header.len());
        for (i, name) in header.iter().enumerate() {
            let column = if name == schema.timestamp_source {
                Column::new(&schema.timestamp_column, ColumnType::Timestamp)
            } else if schema.numeric_columns.iter().any(|c| c == name) {
                Column::new(name, ColumnType::Double)
            } else {
                return Err(IngestError::format(1, format!("unexpected column {:?}", name)));
            };
            if columns.iter().any(|c: &Column| c.name == column.name) {
                return Err(IngestError::format(1, format!("duplicate column {:?}", name)));
            }
            columns.push(column);
            source_index.push(i);
        }
        let expected = std::iter::once(&schema.timestamp_source).chain(&schema.numeric_columns);
        for name in expected {
            if !header.iter().any(|h| h == name) {
                return Err(IngestError::format(1, format!("missing column {:?}", name)));
            }
        }

        Ok(CsvChunks {
            reader,
            columns,
            source_index,
            timestamp_format: schema.timestamp_format.clone(),
            chunk_size,
            record: csv::StringRecord::new(),
            pending: false,
            done: false,
        })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Peek whether another record follows.
    pub fn has_more(&mut self) -> Result<bool, IngestError> {
        if self.done {
            return Ok(false);
        }
        if !self.pending {
            self.pending = self.reader.read_record(&mut self.record)?;
            self.done = !self.pending;
        }
        Ok(self.pending)
    }

    fn parse_record(&self) -> Result<Vec<Value>, IngestError> {
        let line = self.record.position().map(|p| p.line()).unwrap_or(0);
        let mut row = Vec::with_capacity(self.columns.len());
        for (column, &i) in self.columns.iter().zip(&self.source_index) {
            let cell = self.record.get(i).unwrap_or("").trim();
            let value = match column.ty {
                ColumnType::Timestamp => NaiveDateTime::parse_from_str(cell, &self.timestamp_format)
                    .map(Value::Timestamp)
                    .map_err(|e| {
                        IngestError::format(
                            line,
                            format!("can't parse {:?} as {}: {}", cell, self.timestamp_format, e),
                        )
                    })?,
                _ if cell.is_empty() => Value::Null,
                _ => cell.parse::<f64>().map(Value::Double).map_err(|_| {
                    IngestError::format(
                        line,
                        format!("can't parse {:?} in column {} as a number", cell, column.name),
                    )
                })?,
            };
            row.push(value);
        }
        Ok(row)
    }

    fn read_chunk(&mut self) -> Result<Dataset, IngestError> {
        let mut ds = Dataset::new(self.columns.clone());
        while ds.len() < self.chunk_size && self.has_more()? {
            let row = self.parse_record()?;
            self.pending = false;
            let line = self.record.position().map(|p| p.line()).unwrap_or(0);
            ds.push_row(row).map_err(|e| IngestError::format(line, e))?;
        }
        Ok(ds)
    }
}

impl<R: Read> Iterator for CsvChunks<R> {
    type Item = Result<Dataset, IngestError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.has_more() {
            Ok(false) => None,
            Ok(true) => {
                let chunk = self.read_chunk();
                if chunk.is_err() {
                    self.done = true;
                }
                Some(chunk)
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::error::Error;
    use std::io::Write;

    use chrono::NaiveDate;
    use flate2::{write::GzEncoder, Compression};

    use super::*;

    pub(crate) const HEADER: &str = "\"Date Time\",\"p (mbar)\",\"T (degC)\",\"Tpot (K)\",\"Tdew (degC)\",\"rh (%)\",\"VPmax (mbar)\",\"VPact (mbar)\",\"VPdef (mbar)\",\"sh (g/kg)\",\"H2OC (mmol/mol)\",\"rho (g/m**3)\",\"wv (m/s)\",\"max. wv (m/s)\",\"wd (deg)\"";

    /// The first 10 rows of jena_climate_2009_2016.csv
    pub(crate) fn sample_csv() -> String {
        let rows = [
            "01.01.2009 00:10:00,996.52,-8.02,265.40,-8.90,93.30,3.33,3.11,0.22,1.94,3.12,1307.75,1.03,1.75,152.30",
            "01.01.2009 00:20:00,996.57,-8.41,265.01,-9.28,93.40,3.23,3.02,0.21,1.89,3.03,1309.80,0.72,1.50,136.10",
            "01.01.2009 00:30:00,996.53,-8.51,264.91,-9.31,93.90,3.21,3.01,0.20,1.88,3.02,1310.24,0.19,0.63,171.60",
            "01.01.2009 00:40:00,996.51,-8.31,265.12,-9.07,94.20,3.26,3.07,0.19,1.92,3.08,1309.19,0.34,0.50,198.00",
            "01.01.2009 00:50:00,996.51,-8.27,265.15,-9.04,94.10,3.27,3.08,0.19,1.92,3.09,1309.00,0.32,0.63,214.30",
            "01.01.2009 01:00:00,996.50,-8.05,265.38,-8.78,94.40,3.33,3.14,0.19,1.96,3.15,1307.86,0.21,0.63,192.70",
            "01.01.2009 01:10:00,996.50,-7.62,265.81,-8.30,94.80,3.44,3.26,0.18,2.04,3.27,1305.68,0.18,0.63,166.50",
            "01.01.2009 01:20:00,996.50,-7.62,265.81,-8.36,94.40,3.44,3.25,0.19,2.03,3.26,1305.69,0.19,0.50,118.60",
            "01.01.2009 01:30:00,996.50,-7.91,265.52,-8.73,93.80,3.36,3.15,0.21,1.97,3.16,1307.17,0.28,0.75,188.50",
            "01.01.2009 01:40:00,996.53,-8.43,264.99,-9.34,93.10,3.23,3.00,0.22,1.88,3.02,1309.85,0.59,0.88,185.00",
        ];
        let mut out = HEADER.to_string();
        for row in rows {
            out.push('\n');
            out.push_str(row);
        }
        out.push('\n');
        out
    }

    fn extractor(chunk_size: usize, policy: ChunkPolicy) -> Extractor {
        Extractor::new(Path::new("unused.csv"), chunk_size, policy)
    }

    #[test]
    fn parse_timestamps() -> Result<(), Box<dyn Error>> {
        let ds = extractor(10_000, ChunkPolicy::FirstChunk)
            .extract_from_reader(sample_csv().as_bytes())?;
        assert_eq!(ds.len(), 10);
        assert_eq!(ds.columns().len(), 15);
        assert_eq!(ds.columns()[0], Column::new("Date_Time", ColumnType::Timestamp));
        assert!(ds.column_index("Date Time").is_none());
        let values = ds.column_values("Date_Time").unwrap();
        let expected = NaiveDate::from_ymd_opt(2009, 1, 1)
            .unwrap()
            .and_hms_opt(0, 10, 0)
            .unwrap();
        assert_eq!(values[0], &Value::Timestamp(expected));
        assert_eq!(
            ds.column_values("wd (deg)").unwrap()[9],
            &Value::Double(185.0)
        );
        Ok(())
    }

    #[test]
    fn invalid_month_fails_the_whole_extraction() {
        let csv = sample_csv().replace("01.01.2009 00:50:00", "31.13.2009 00:00:00");
        let res = extractor(10_000, ChunkPolicy::FirstChunk).extract_from_reader(csv.as_bytes());
        match res {
            Err(IngestError::Format { line, .. }) => assert_eq!(line, 6),
            r => panic!("expected a format error, got {:?}", r),
        }
    }

    #[test]
    fn bad_numbers_and_headers_are_format_errors() {
        let csv = sample_csv().replace("996.52", "n/a");
        let res = extractor(100, ChunkPolicy::FirstChunk).extract_from_reader(csv.as_bytes());
        assert!(matches!(res, Err(IngestError::Format { .. })));

        let csv = sample_csv().replace("\"wd (deg)\"", "\"wind\"");
        let res = extractor(100, ChunkPolicy::FirstChunk).extract_from_reader(csv.as_bytes());
        assert!(matches!(res, Err(IngestError::Format { line: 1, .. })));
    }

    #[test]
    fn empty_cells_are_null() -> Result<(), Box<dyn Error>> {
        let csv = sample_csv().replace(",1307.75,", ",,");
        let ds = extractor(100, ChunkPolicy::FirstChunk).extract_from_reader(csv.as_bytes())?;
        assert_eq!(ds.column_values("rho (g/m**3)").unwrap()[0], &Value::Null);
        Ok(())
    }

    #[test]
    fn first_chunk_only() -> Result<(), Box<dyn Error>> {
        let ds = extractor(4, ChunkPolicy::FirstChunk).extract_from_reader(sample_csv().as_bytes())?;
        assert_eq!(ds.len(), 4);
        Ok(())
    }

    #[test]
    fn all_chunks_with_and_without_cap() -> Result<(), Box<dyn Error>> {
        let all = ChunkPolicy::AllChunks { max_chunks: None };
        let ds = extractor(4, all).extract_from_reader(sample_csv().as_bytes())?;
        assert_eq!(ds.len(), 10);

        let capped = ChunkPolicy::AllChunks { max_chunks: Some(2) };
        let ds = extractor(4, capped).extract_from_reader(sample_csv().as_bytes())?;
        assert_eq!(ds.len(), 8);
        Ok(())
    }

    #[test]
    fn chunks_iterator() -> Result<(), Box<dyn Error>> {
        let csv = sample_csv();
        let chunks = CsvChunks::new(csv.as_bytes(), &CsvSchema::jena_climate(), 3)?;
        let sizes: Vec<usize> = chunks.map(|c| c.map(|ds| ds.len())).collect::<Result<_, _>>()?;
        assert_eq!(sizes, vec![3, 3, 3, 1]);

        let res = CsvChunks::new(csv.as_bytes(), &CsvSchema::jena_climate(), 0);
        assert!(matches!(res, Err(IngestError::Config(_))));
        Ok(())
    }

    #[test]
    fn read_gzipped_file() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("jena_climate_2009_2016.csv.gz");
        let mut enc = GzEncoder::new(File::create(&path)?, Compression::default());
        enc.write_all(sample_csv().as_bytes())?;
        enc.finish()?;

        let ds = Extractor::new(&path, 10_000, ChunkPolicy::FirstChunk).extract()?;
        assert_eq!(ds.len(), 10);
        Ok(())
    }
}
