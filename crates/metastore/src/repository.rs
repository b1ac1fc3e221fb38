use std::sync::Arc;

use uuid::Uuid;

use crate::context::SaveContext;
use crate::query::{Page, Predicate};
use crate::schema::Record;
use crate::storage::{DocumentStore, InMemoryStore, StoredDocument};
use crate::{MetaError, Result};

/// Typed access to the four record collections.
#[derive(Clone)]
pub struct MetadataRepository {
    store: Arc<dyn DocumentStore>,
}

impl MetadataRepository {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryStore::new()))
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    fn encode<T: Record>(record: &T, version: u64) -> Result<StoredDocument> {
        Ok(StoredDocument {
            kind: T::KIND,
            id: record.id().to_string(),
            owner: record.owner().to_string(),
            is_public: record.is_public(),
            version,
            body: serde_json::to_value(record)?,
        })
    }

    fn decode<T: Record>(doc: StoredDocument) -> Result<(T, u64)> {
        if doc.kind != T::KIND {
            return Err(MetaError::Storage(format!(
                "expected {} document, found {} for id {}",
                T::KIND,
                doc.kind,
                doc.id
            )));
        }
        let record: T = serde_json::from_value(doc.body)?;
        Ok((record, doc.version))
    }

    /// Starts a creation episode: a fresh id is assigned before the scope
    /// body runs, and the flush inserts.
    pub fn create_with<T: Record>(&self, mut record: T) -> SaveContext<T> {
        record.set_id(Self::new_id());
        SaveContext::new(self.clone(), record, None)
    }

    /// Creation episode under a caller-chosen id. The insert fails with
    /// `Conflict` if the id is taken.
    pub fn create_with_id<T: Record>(&self, mut record: T, id: String) -> SaveContext<T> {
        record.set_id(id);
        SaveContext::new(self.clone(), record, None)
    }

    /// Persists a new record under a fresh id.
    pub async fn create<T: Record>(&self, record: T) -> Result<T> {
        self.create_with(record).apply(|_| {}).await
    }

    /// Unfiltered lookup by id. Internal paths only; caller-facing reads go
    /// through [`find_by_id`](Self::find_by_id) with an access predicate.
    pub async fn get<T: Record>(&self, id: &str) -> Result<T> {
        let doc = self
            .store
            .get(T::KIND, id)
            .await?
            .ok_or_else(|| MetaError::not_found(T::KIND, id))?;
        Ok(Self::decode::<T>(doc)?.0)
    }

    /// Lookup by id restricted by `access`. No match is `NotFound`,
    /// whether the record is absent or hidden.
    pub async fn find_by_id<T: Record>(&self, id: &str, access: Predicate) -> Result<T> {
        let predicate = Predicate::id(id).and(access);
        let doc = self
            .store
            .find(T::KIND, &predicate, Page::single())
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| MetaError::not_found(T::KIND, id))?;
        Ok(Self::decode::<T>(doc)?.0)
    }

    /// Loads a record for a mutation episode.
    pub async fn edit<T: Record>(&self, id: &str) -> Result<SaveContext<T>> {
        let doc = self
            .store
            .get(T::KIND, id)
            .await?
            .ok_or_else(|| MetaError::not_found(T::KIND, id))?;
        let (record, version) = Self::decode::<T>(doc)?;
        Ok(SaveContext::new(self.clone(), record, Some(version)))
    }

    pub async fn update<T: Record>(&self, id: &str, mutate: impl FnOnce(&mut T)) -> Result<T> {
        self.edit::<T>(id).await?.apply(mutate).await
    }

    pub async fn delete<T: Record>(&self, id: &str) -> Result<()> {
        if self.store.delete(T::KIND, id).await? {
            Ok(())
        } else {
            Err(MetaError::not_found(T::KIND, id))
        }
    }

    pub async fn list<T: Record>(&self, predicate: &Predicate, page: Page) -> Result<Vec<T>> {
        self.store
            .find(T::KIND, predicate, page)
            .await?
            .into_iter()
            .map(|doc| Self::decode::<T>(doc).map(|(r, _)| r))
            .collect()
    }

    pub async fn count<T: Record>(&self, predicate: &Predicate) -> Result<u64> {
        self.store.count(T::KIND, predicate).await
    }

    pub(crate) async fn flush<T: Record>(&self, record: &T, version: Option<u64>) -> Result<u64> {
        match version {
            None => {
                let doc = Self::encode(record, 1)?;
                self.store.insert(doc).await?;
                Ok(1)
            }
            Some(v) => {
                let doc = Self::encode(record, v)?;
                self.store.replace(doc, v).await
            }
        }
    }
}
