use crate::{ReviewError, ReviewResult, RowCursor};
use opcsv_core::StatusKey;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

pub const DEFAULT_SUFFIX: &str = ".opcsv";
pub const DRAFT_SUFFIX: &str = ".draft";
const TMP_SUFFIX: &str = ".tmp";

/// Read cursors over a source file and its derived status file.
pub struct DatasetPair {
    pub name: String,
    pub source: RowCursor,
    pub derived: RowCursor,
    pub derived_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DerivedFileService {
    input_dir: PathBuf,
    output_dir: PathBuf,
    suffix: String,
    key: StatusKey,
}

impl DerivedFileService {
    pub fn new(
        input_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        suffix: impl Into<String>,
        key: StatusKey,
    ) -> Self {
        Self {
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
            suffix: suffix.into(),
            key,
        }
    }

    pub fn key(&self) -> &StatusKey {
        &self.key
    }

    /// Regular files directly under the input directory, in directory order.
    pub fn list_inputs(&self) -> ReviewResult<Vec<String>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.input_dir)? {
            let entry = entry?;
            if !entry.path().is_file() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => files.push(name),
                Err(name) => warn!(event = "input_name_not_utf8", name = ?name),
            }
        }
        Ok(files)
    }

    pub fn derived_path(&self, name: &str) -> PathBuf {
        self.output_dir.join(format!("{name}{}", self.suffix))
    }

    pub fn has_derived(&self, name: &str) -> bool {
        is_plain_name(name) && self.derived_path(name).is_file()
    }

    /// Creates the derived file for `name` with one default status row per
    /// source row. Never overwrites an existing derived file.
    pub fn ensure_derived(&self, name: &str) -> ReviewResult<DatasetPair> {
        let source_path = self.source_path(name)?;
        let derived_path = self.derived_path(name);
        if derived_path.exists() {
            return Err(ReviewError::DerivedAlreadyExists { path: derived_path });
        }

        fs::create_dir_all(&self.output_dir)?;
        let tmp_path = with_suffix(&derived_path, TMP_SUFFIX);
        let rows = match self.write_default_rows(&source_path, &tmp_path) {
            Ok(rows) => rows,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path);
                return Err(err);
            }
        };
        fs::rename(&tmp_path, &derived_path)?;
        info!(
            event = "derived_created",
            name = name,
            path = %derived_path.display(),
            rows = rows
        );

        self.open_pair(name, &source_path, derived_path)
    }

    pub fn get_or_create_derived(&self, name: &str) -> ReviewResult<DatasetPair> {
        let source_path = self.source_path(name)?;
        if !self.has_derived(name) {
            return self.ensure_derived(name);
        }
        let rows = self.verify_pairing(name)?;
        debug!(event = "derived_reused", name = name, rows = rows);
        self.open_pair(name, &source_path, self.derived_path(name))
    }

    /// Counts the data rows of both files and fails when they differ.
    pub fn verify_pairing(&self, name: &str) -> ReviewResult<usize> {
        let source_path = self.source_path(name)?;
        let derived_path = self.derived_path(name);
        let source_rows = RowCursor::from_path(&source_path)?.count_remaining()?;
        let derived_rows = match File::open(&derived_path) {
            Ok(file) => RowCursor::new(file)?.count_remaining()?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ReviewError::DerivedNotFound { path: derived_path })
            }
            Err(err) => return Err(err.into()),
        };
        if source_rows != derived_rows {
            warn!(
                event = "pairing_mismatch",
                name = name,
                source_rows = source_rows,
                derived_rows = derived_rows
            );
            return Err(ReviewError::RowCountMismatch {
                detail: format!("`{name}` has {source_rows} rows but its derived file has {derived_rows}"),
            });
        }
        Ok(source_rows)
    }

    fn source_path(&self, name: &str) -> ReviewResult<PathBuf> {
        let not_found = || ReviewError::SourceNotFound {
            name: name.to_string(),
        };
        if !is_plain_name(name) {
            return Err(not_found());
        }
        let path = self.input_dir.join(name);
        if !path.is_file() {
            return Err(not_found());
        }
        Ok(path)
    }

    fn write_default_rows(&self, source_path: &Path, tmp_path: &Path) -> ReviewResult<usize> {
        let mut source = RowCursor::from_path(source_path)?;
        let default = self.key.default_row();
        let mut writer = csv::Writer::from_path(tmp_path)?;
        writer.write_record([self.key.name()])?;
        let mut written = 0;
        while source.next_row()?.is_some() {
            writer.write_record(default.values())?;
            written += 1;
        }
        writer.flush()?;
        drop(writer);

        let verified = RowCursor::from_path(tmp_path)?.count_remaining()?;
        if verified != written {
            return Err(ReviewError::RowCountMismatch {
                detail: format!("wrote {written} derived rows but read back {verified}"),
            });
        }
        Ok(written)
    }

    fn open_pair(
        &self,
        name: &str,
        source_path: &Path,
        derived_path: PathBuf,
    ) -> ReviewResult<DatasetPair> {
        let source = RowCursor::from_path(source_path)?;
        let derived = match File::open(&derived_path) {
            Ok(file) => RowCursor::new(file)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ReviewError::DerivedNotFound { path: derived_path })
            }
            Err(err) => return Err(err.into()),
        };
        Ok(DatasetPair {
            name: name.to_string(),
            source,
            derived,
            derived_path,
        })
    }
}

pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw: OsString = path.as_os_str().to_owned();
    raw.push(suffix);
    PathBuf::from(raw)
}

// Dataset names come from URLs and are joined onto directories.
fn is_plain_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}
