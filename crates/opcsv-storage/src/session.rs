use crate::{DerivedFileService, PairedIterator, RecordView, ReviewError, ReviewResult};
use chrono::{DateTime, Utc};
use opcsv_core::StatusCode;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionView {
    pub name: String,
    pub opened_at: DateTime<Utc>,
    #[serde(flatten)]
    pub record: RecordView,
}

struct ActiveDataset {
    name: String,
    opened_at: DateTime<Utc>,
    iter: PairedIterator,
}

impl ActiveDataset {
    fn view(&self) -> SessionView {
        SessionView {
            name: self.name.clone(),
            opened_at: self.opened_at,
            record: self.iter.current(),
        }
    }
}

/// The dataset currently under review, keyed by dataset name.
///
/// Opening the same name again resumes the existing iterator; opening a
/// different name drops it, closing its files, and starts over.
pub struct Session {
    service: DerivedFileService,
    active: Option<ActiveDataset>,
}

impl Session {
    pub fn new(service: DerivedFileService) -> Self {
        Self {
            service,
            active: None,
        }
    }

    pub fn service(&self) -> &DerivedFileService {
        &self.service
    }

    pub fn active_name(&self) -> Option<&str> {
        self.active.as_ref().map(|active| active.name.as_str())
    }

    pub fn current(&self) -> ReviewResult<SessionView> {
        self.active
            .as_ref()
            .map(ActiveDataset::view)
            .ok_or(ReviewError::NoActiveSession)
    }

    pub fn open(&mut self, name: &str) -> ReviewResult<SessionView> {
        if let Some(active) = self.active.as_ref().filter(|active| active.name == name) {
            info!(event = "session_reused", name = name, position = active.iter.position());
            return Ok(active.view());
        }
        if let Some(previous) = self.active.take() {
            info!(
                event = "session_closed",
                name = %previous.name,
                reason = "switch",
                position = previous.iter.position()
            );
        }

        let pair = self.service.get_or_create_derived(name)?;
        let iter = PairedIterator::from_pair(pair, self.service.key().clone())?;
        let active = ActiveDataset {
            name: name.to_string(),
            opened_at: Utc::now(),
            iter,
        };
        info!(event = "session_opened", name = name);
        let view = active.view();
        self.active = Some(active);
        Ok(view)
    }

    pub fn advance(&mut self) -> ReviewResult<SessionView> {
        let active = self.active.as_mut().ok_or(ReviewError::NoActiveSession)?;
        match active.iter.advance() {
            Ok(()) => Ok(active.view()),
            Err(err @ ReviewError::RowCountMismatch { .. }) => {
                warn!(event = "session_dropped", name = %active.name, error = %err);
                self.active = None;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    pub fn set_status(&mut self, status: StatusCode) -> ReviewResult<SessionView> {
        let active = self.active.as_mut().ok_or(ReviewError::NoActiveSession)?;
        active.iter.set_status(status)?;
        info!(
            event = "status_set",
            name = %active.name,
            position = active.iter.position(),
            status = %status
        );
        Ok(active.view())
    }

    /// Writes pending decisions into the derived file and ends the session.
    pub fn commit(&mut self) -> ReviewResult<usize> {
        let active = self.active.take().ok_or(ReviewError::NoActiveSession)?;
        let name = active.name;
        active.iter.commit().inspect_err(|err| {
            warn!(event = "commit_failed", name = %name, error = %err);
        })
    }

    pub fn close(&mut self) {
        if let Some(active) = self.active.take() {
            info!(event = "session_closed", name = %active.name, reason = "close");
        }
    }
}
