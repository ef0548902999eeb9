use crate::derived::{with_suffix, DRAFT_SUFFIX};
use crate::{DatasetPair, ReviewError, ReviewResult, RowCursor};
use opcsv_core::{Annotation, Row, StatusCode, StatusKey};
use serde::Serialize;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// The joined view of the row currently under review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordView {
    pub position: usize,
    pub row: Row,
    pub status: Option<StatusCode>,
    pub annotations: Vec<Annotation>,
}

/// Walks a source stream and its derived status stream in lockstep.
///
/// Every `advance` appends the derived row it moves past to
/// `<derived>.draft`, so after `k` advances the draft holds `k` rows.
/// `position` is the zero-based index of the current row and therefore
/// always equals the number of rows in the draft.
pub struct PairedIterator<R = File> {
    key: StatusKey,
    source: RowCursor<R>,
    derived: RowCursor<R>,
    draft: csv::Writer<File>,
    draft_path: PathBuf,
    derived_path: PathBuf,
    position: usize,
    current_row: Row,
    current_derived: Row,
    annotations: Vec<Annotation>,
}

impl PairedIterator<File> {
    pub fn from_pair(pair: DatasetPair, key: StatusKey) -> ReviewResult<Self> {
        let DatasetPair {
            name,
            source,
            derived,
            derived_path,
        } = pair;
        let iter = Self::open(source, derived, &derived_path, key)?;
        info!(
            event = "iterator_opened",
            name = %name,
            draft = %iter.draft_path.display()
        );
        Ok(iter)
    }
}

impl<R: Read> PairedIterator<R> {
    /// Creates a fresh draft next to `derived_path` and loads the first pair.
    pub fn open(
        mut source: RowCursor<R>,
        mut derived: RowCursor<R>,
        derived_path: &Path,
        key: StatusKey,
    ) -> ReviewResult<Self> {
        let draft_path = with_suffix(derived_path, DRAFT_SUFFIX);
        let mut draft = csv::WriterBuilder::new()
            .flexible(true)
            .from_path(&draft_path)?;
        draft.write_record(derived.headers())?;
        draft.flush()?;

        let first = match (source.next_row(), derived.next_row()) {
            (Ok(Some(row)), Ok(Some(status))) => key
                .classify(&status, &row)
                .map(|annotations| (row, status, annotations))
                .map_err(ReviewError::from),
            (Ok(_), Ok(_)) => Err(ReviewError::EmptyDataset),
            (Err(err), _) | (_, Err(err)) => Err(err),
        };
        let (current_row, current_derived, annotations) = match first {
            Ok(first) => first,
            Err(err) => {
                drop(draft);
                let _ = fs::remove_file(&draft_path);
                return Err(err);
            }
        };

        Ok(Self {
            key,
            source,
            derived,
            draft,
            draft_path,
            derived_path: derived_path.to_path_buf(),
            position: 0,
            current_row,
            current_derived,
            annotations,
        })
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn draft_path(&self) -> &Path {
        &self.draft_path
    }

    pub fn current(&self) -> RecordView {
        RecordView {
            position: self.position,
            row: self.current_row.clone(),
            status: self.key.status_of(&self.current_derived).ok(),
            annotations: self.annotations.clone(),
        }
    }

    /// Moves both streams forward by one row.
    ///
    /// When the new pair cannot be classified the iterator still moves, so
    /// the streams and the draft stay aligned, and the error is returned
    /// with the new row left unannotated.
    pub fn advance(&mut self) -> ReviewResult<()> {
        let (row, status) = self.read_pair()?;
        let classified = self.key.classify(&status, &row);

        self.draft.write_record(self.current_derived.values())?;
        self.draft.flush()?;
        self.position += 1;
        self.current_row = row;
        self.current_derived = status;
        debug!(event = "row_advanced", position = self.position);

        match classified {
            Ok(annotations) => {
                self.annotations = annotations;
                Ok(())
            }
            Err(err) => {
                self.annotations.clear();
                Err(err.into())
            }
        }
    }

    /// Records a triage decision on the current row. It is written to the
    /// draft once the row is moved past or committed.
    pub fn set_status(&mut self, status: StatusCode) -> ReviewResult<()> {
        if self.current_derived.get(self.key.name()).is_none() {
            return Err(ReviewError::MissingField {
                field: self.key.name().to_string(),
            });
        }
        self.current_derived
            .set(self.key.name(), status.code().to_string());
        self.annotations = self.key.classify(&self.current_derived, &self.current_row)?;
        Ok(())
    }

    /// Flushes the current and remaining derived rows into the draft and
    /// replaces the derived file with it. Returns the committed row count.
    pub fn commit(mut self) -> ReviewResult<usize> {
        self.draft.write_record(self.current_derived.values())?;
        let mut committed = self.position + 1;
        loop {
            match self.read_pair() {
                Ok((_, status)) => {
                    self.draft.write_record(status.values())?;
                    committed += 1;
                }
                Err(ReviewError::EndOfData) => break,
                Err(err) => return Err(err),
            }
        }
        self.draft.flush()?;
        let file = self.draft.into_inner().map_err(|err| err.into_error())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&self.draft_path, &self.derived_path)?;
        info!(
            event = "draft_committed",
            path = %self.derived_path.display(),
            rows = committed
        );
        Ok(committed)
    }

    fn read_pair(&mut self) -> ReviewResult<(Row, Row)> {
        let source = self.source.next_row()?;
        let derived = self.derived.next_row()?;
        match (source, derived) {
            (Some(row), Some(status)) => Ok((row, status)),
            (None, None) => Err(ReviewError::EndOfData),
            (Some(_), None) => Err(ReviewError::RowCountMismatch {
                detail: format!(
                    "derived file ended before source at row {}",
                    self.position + 2
                ),
            }),
            (None, Some(_)) => Err(ReviewError::RowCountMismatch {
                detail: format!(
                    "source file ended before derived file at row {}",
                    self.position + 2
                ),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DerivedFileService, DEFAULT_SUFFIX};
    use opcsv_core::DEFAULT_STATUS_KEY;
    use tempfile::TempDir;

    fn hosts_service(source: &str) -> (TempDir, DerivedFileService) {
        let dir = tempfile::tempdir().expect("tempdir");
        let inputs = dir.path().join("inputs");
        let outputs = dir.path().join("outputs");
        fs::create_dir_all(&inputs).expect("inputs");
        fs::write(inputs.join("hosts.csv"), source).expect("source");
        let service =
            DerivedFileService::new(inputs, outputs, DEFAULT_SUFFIX, StatusKey::default());
        (dir, service)
    }

    fn draft_rows(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .expect("read draft")
            .lines()
            .skip(1)
            .map(str::to_string)
            .collect()
    }

    fn memory_cursor(body: &str) -> RowCursor<&[u8]> {
        RowCursor::new(body.as_bytes()).expect("cursor")
    }

    #[test]
    fn hosts_scenario_walks_both_rows_then_ends() {
        let (_dir, service) = hosts_service("IP\n1.2.3.4\n5.6.7.8\n");
        let pair = service.ensure_derived("hosts.csv").expect("ensure");
        let mut iter = PairedIterator::from_pair(pair, StatusKey::default()).expect("open");

        let view = iter.current();
        assert_eq!(view.position, 0);
        assert_eq!(view.row.get("IP"), Some("1.2.3.4"));
        assert_eq!(view.status, Some(StatusCode::New));
        assert_eq!(view.annotations[0], Annotation::text("Status", "NEW"));
        assert!(view.annotations[1]
            .format
            .contains("https://shodan.io/host/1.2.3.4"));
        assert!(draft_rows(iter.draft_path()).is_empty());

        iter.advance().expect("advance");
        assert_eq!(iter.current().row.get("IP"), Some("5.6.7.8"));
        assert_eq!(draft_rows(iter.draft_path()), vec!["0".to_string()]);

        let err = iter.advance().expect_err("exhausted");
        assert!(matches!(err, ReviewError::EndOfData));
        assert_eq!(iter.position(), 1);
    }

    #[test]
    fn draft_holds_one_row_per_advance() {
        let (_dir, service) = hosts_service("IP\n1.1.1.1\n2.2.2.2\n3.3.3.3\n4.4.4.4\n");
        let pair = service.ensure_derived("hosts.csv").expect("ensure");
        let mut iter = PairedIterator::from_pair(pair, StatusKey::default()).expect("open");

        for k in 1..=3 {
            iter.advance().expect("advance");
            assert_eq!(iter.position(), k);
            assert_eq!(draft_rows(iter.draft_path()).len(), k);
        }
    }

    #[test]
    fn short_derived_stream_is_a_mismatch_not_end_of_data() {
        let dir = tempfile::tempdir().expect("tempdir");
        let derived_path = dir.path().join("hosts.csv.opcsv");
        let mut iter = PairedIterator::open(
            memory_cursor("IP\n1.2.3.4\n5.6.7.8\n"),
            memory_cursor("opcsv-enum\n0\n"),
            &derived_path,
            StatusKey::default(),
        )
        .expect("open");

        let err = iter.advance().expect_err("mismatch");
        assert!(matches!(err, ReviewError::RowCountMismatch { .. }));
    }

    #[test]
    fn empty_stream_fails_construction_and_removes_draft() {
        let dir = tempfile::tempdir().expect("tempdir");
        let derived_path = dir.path().join("hosts.csv.opcsv");
        let result = PairedIterator::open(
            memory_cursor("IP\n1.2.3.4\n"),
            memory_cursor("opcsv-enum\n"),
            &derived_path,
            StatusKey::default(),
        );

        assert!(matches!(result, Err(ReviewError::EmptyDataset)));
        assert!(!with_suffix(&derived_path, DRAFT_SUFFIX).exists());
    }

    #[test]
    fn unclassifiable_row_still_moves_both_streams() {
        let dir = tempfile::tempdir().expect("tempdir");
        let derived_path = dir.path().join("hosts.csv.opcsv");
        let mut iter = PairedIterator::open(
            memory_cursor("IP,Name\n1.2.3.4,a\n,b\n9.9.9.9,c\n"),
            memory_cursor("opcsv-enum\n0\nx\n1\n"),
            &derived_path,
            StatusKey::default(),
        )
        .expect("open");

        let err = iter.advance().expect_err("malformed");
        assert!(matches!(err, ReviewError::MalformedRow { .. }));
        assert!(iter.current().annotations.is_empty());

        iter.advance().expect("advance past bad row");
        let view = iter.current();
        assert_eq!(view.row.get("Name"), Some("c"));
        assert_eq!(view.status, Some(StatusCode::Triaged));
        assert_eq!(draft_rows(iter.draft_path()), vec!["0", "x"]);
    }

    #[test]
    fn commit_persists_decisions_and_keeps_row_parity() {
        let (_dir, service) = hosts_service("IP\n1.1.1.1\n2.2.2.2\n3.3.3.3\n");
        let pair = service.ensure_derived("hosts.csv").expect("ensure");
        let mut iter = PairedIterator::from_pair(pair, StatusKey::default()).expect("open");

        iter.set_status(StatusCode::Flagged).expect("flag first");
        assert_eq!(iter.current().annotations[0].format, "FLAGGED");
        iter.advance().expect("advance");
        iter.set_status(StatusCode::Ok).expect("ok second");
        let draft_path = iter.draft_path().to_path_buf();

        assert_eq!(iter.commit().expect("commit"), 3);
        assert!(!draft_path.exists());
        let derived = fs::read_to_string(service.derived_path("hosts.csv")).expect("derived");
        assert_eq!(derived, format!("{DEFAULT_STATUS_KEY}\n2\n3\n0\n"));
        assert_eq!(service.verify_pairing("hosts.csv").expect("paired"), 3);
    }
}
