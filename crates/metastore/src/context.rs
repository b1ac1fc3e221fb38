use std::panic::{self, AssertUnwindSafe};

use tracing::warn;

use crate::repository::MetadataRepository;
use crate::schema::Record;
use crate::{MetaError, Result};

/// One mutation episode over a single record.
///
/// The record is mutated in memory by the body passed to [`scope`] and is
/// flushed to the store exactly once when the body exits, on every exit
/// path: normal return, returned error, or panic. After a failed body the
/// record is still persisted with whatever fields were assigned before the
/// failure, then the body's error is returned (or its panic resumed).
///
/// This is not a rollback. Callers rely on it so that an id assigned on a
/// creation path is durable even when a later assignment in the same scope
/// fails. Whether persisting a partially-populated record is desirable is an
/// open product question; do not turn this into a rollback without
/// settling that first.
///
/// [`scope`]: SaveContext::scope
pub struct SaveContext<T: Record> {
    repo: MetadataRepository,
    record: T,
    /// `None` until the record has been inserted.
    version: Option<u64>,
}

impl<T: Record> SaveContext<T> {
    pub(crate) fn new(repo: MetadataRepository, record: T, version: Option<u64>) -> Self {
        Self {
            repo,
            record,
            version,
        }
    }

    pub fn id(&self) -> &str {
        self.record.id()
    }

    pub fn record(&self) -> &T {
        &self.record
    }

    /// True on creation paths, where the flush is an insert.
    pub fn is_new(&self) -> bool {
        self.version.is_none()
    }

    /// Runs `body` against the record and flushes once on exit.
    ///
    /// If the body succeeds, a flush failure is returned. If the body fails,
    /// its error wins and a flush failure is only logged.
    pub async fn scope<R, E, F>(self, body: F) -> std::result::Result<(T, R), E>
    where
        F: FnOnce(&mut T) -> std::result::Result<R, E>,
        E: From<MetaError>,
    {
        let SaveContext {
            repo,
            mut record,
            version,
        } = self;

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(&mut record)));
        let flushed = repo.flush(&record, version).await;

        match outcome {
            Ok(Ok(value)) => {
                flushed?;
                Ok((record, value))
            }
            Ok(Err(err)) => {
                if let Err(flush_err) = flushed {
                    warn!(kind = %T::KIND, id = %record.id(), error = %flush_err, "save context: flush after failed scope failed");
                }
                Err(err)
            }
            Err(payload) => {
                if let Err(flush_err) = flushed {
                    warn!(kind = %T::KIND, id = %record.id(), error = %flush_err, "save context: flush after panic failed");
                }
                panic::resume_unwind(payload)
            }
        }
    }

    /// Infallible mutation, flushed once.
    pub async fn apply(self, body: impl FnOnce(&mut T)) -> Result<T> {
        self.scope(|r| {
            body(r);
            Ok::<_, MetaError>(())
        })
        .await
        .map(|(record, _)| record)
    }
}
