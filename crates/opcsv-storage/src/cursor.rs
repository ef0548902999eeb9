use crate::ReviewResult;
use opcsv_core::Row;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Forward-only reader over the data rows of a headed CSV stream.
///
/// The header is consumed on construction, so the first `next_row` call
/// yields the first data row.
pub struct RowCursor<R = File> {
    reader: csv::Reader<R>,
    headers: Vec<String>,
    record: csv::StringRecord,
}

impl RowCursor<File> {
    pub fn from_path(path: impl AsRef<Path>) -> ReviewResult<Self> {
        Self::new(File::open(path)?)
    }
}

impl<R: Read> RowCursor<R> {
    pub fn new(input: R) -> ReviewResult<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(input);
        let headers = reader.headers()?.iter().map(str::to_string).collect();
        Ok(Self {
            reader,
            headers,
            record: csv::StringRecord::new(),
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn next_row(&mut self) -> ReviewResult<Option<Row>> {
        if !self.reader.read_record(&mut self.record)? {
            return Ok(None);
        }
        Ok(Some(Row::from_pairs(
            self.headers
                .iter()
                .map(String::as_str)
                .zip(self.record.iter()),
        )))
    }

    /// Consumes the rest of the stream and returns how many rows it held.
    pub fn count_remaining(&mut self) -> ReviewResult<usize> {
        let mut count = 0;
        while self.reader.read_record(&mut self.record)? {
            count += 1;
        }
        Ok(count)
    }
}
