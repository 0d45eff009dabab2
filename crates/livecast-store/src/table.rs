//! Versioned rows with a change feed.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::StoreError;
use crate::{StoreResult, CHANGE_FEED_CAPACITY};

/// A value that can be stored in a [`Table`].
pub trait Record: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Record for T {}

/// A row together with its version. Versions start at 1 and grow by one
/// on every successful write.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub id: Uuid,
    pub version: u64,
    pub value: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Inserted,
    Updated,
    Deleted,
}

/// One entry of a table's change feed.
#[derive(Debug, Clone)]
pub struct Change<T> {
    pub id: Uuid,
    pub kind: ChangeKind,
    pub version: u64,

    /// New value, `None` for deletions.
    pub value: Option<T>,
}

/// Row-level CRUD with optimistic concurrency and a change feed.
#[async_trait]
pub trait Table<T: Record>: Send + Sync {
    /// Insert a new row. Fails if the id exists.
    async fn insert(&self, id: Uuid, value: T) -> StoreResult<Versioned<T>>;

    async fn get(&self, id: Uuid) -> StoreResult<Option<Versioned<T>>>;

    /// Replace a row if its version still equals `expected_version`.
    async fn update(&self, id: Uuid, expected_version: u64, value: T)
        -> StoreResult<Versioned<T>>;

    /// Delete a row. Deleting a missing row is not an error.
    async fn delete(&self, id: Uuid) -> StoreResult<()>;

    /// All rows in insertion order.
    async fn list(&self) -> StoreResult<Vec<Versioned<T>>>;

    /// Subscribe to every subsequent change.
    fn subscribe(&self) -> broadcast::Receiver<Change<T>>;
}

struct Row<T> {
    seq: u64,
    row: Versioned<T>,
}

struct TableInner<T> {
    rows: HashMap<Uuid, Row<T>>,
    next_seq: u64,
    failing_inserts: u32,
    failing_updates: u32,
}

/// In-process [`Table`] backend.
pub struct MemoryTable<T> {
    name: &'static str,
    inner: Arc<Mutex<TableInner<T>>>,
    changes: broadcast::Sender<Change<T>>,
}

impl<T> Clone for MemoryTable<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            inner: Arc::clone(&self.inner),
            changes: self.changes.clone(),
        }
    }
}

impl<T: Record> MemoryTable<T> {
    pub fn new(name: &'static str) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            name,
            inner: Arc::new(Mutex::new(TableInner {
                rows: HashMap::new(),
                next_seq: 0,
                failing_inserts: 0,
                failing_updates: 0,
            })),
            changes,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.inner.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make the next `count` inserts fail as if the backend were down.
    pub fn fail_next_inserts(&self, count: u32) {
        self.inner.lock().failing_inserts = count;
    }

    /// Make the next `count` updates fail as if the backend were down.
    pub fn fail_next_updates(&self, count: u32) {
        self.inner.lock().failing_updates = count;
    }

    /// Modify a row in place, bypassing version checks. Models a writer
    /// outside this process (a worker, moderation) landing a change.
    pub fn update_now(&self, id: Uuid, f: impl FnOnce(&mut T)) -> StoreResult<Versioned<T>> {
        let updated = {
            let mut inner = self.inner.lock();
            let entry = inner.rows.get_mut(&id).ok_or_else(|| self.not_found(id))?;
            f(&mut entry.row.value);
            entry.row.version += 1;
            entry.row.clone()
        };
        self.publish(ChangeKind::Updated, &updated);
        Ok(updated)
    }

    fn not_found(&self, id: Uuid) -> StoreError {
        StoreError::NotFound {
            table: self.name,
            id: id.to_string(),
        }
    }

    fn publish(&self, kind: ChangeKind, row: &Versioned<T>) {
        trace!(table = self.name, id = %row.id, ?kind, version = row.version, "Row changed");
        let value = match kind {
            ChangeKind::Deleted => None,
            _ => Some(row.value.clone()),
        };
        // No subscribers is fine.
        let _ = self.changes.send(Change {
            id: row.id,
            kind,
            version: row.version,
            value,
        });
    }

    fn take_fault(counter: &mut u32) -> bool {
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl<T: Record> Table<T> for MemoryTable<T> {
    async fn insert(&self, id: Uuid, value: T) -> StoreResult<Versioned<T>> {
        let row = {
            let mut inner = self.inner.lock();
            if Self::take_fault(&mut inner.failing_inserts) {
                return Err(StoreError::Unavailable(format!("{} insert refused", self.name)));
            }
            if inner.rows.contains_key(&id) {
                return Err(StoreError::AlreadyExists {
                    table: self.name,
                    id: id.to_string(),
                });
            }

            let row = Versioned {
                id,
                version: 1,
                value,
            };
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.rows.insert(
                id,
                Row {
                    seq,
                    row: row.clone(),
                },
            );
            row
        };

        debug!(table = self.name, %id, "Row inserted");
        self.publish(ChangeKind::Inserted, &row);
        Ok(row)
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<Versioned<T>>> {
        Ok(self.inner.lock().rows.get(&id).map(|r| r.row.clone()))
    }

    async fn update(
        &self,
        id: Uuid,
        expected_version: u64,
        value: T,
    ) -> StoreResult<Versioned<T>> {
        let row = {
            let mut inner = self.inner.lock();
            if Self::take_fault(&mut inner.failing_updates) {
                return Err(StoreError::Unavailable(format!("{} update refused", self.name)));
            }

            let entry = inner.rows.get_mut(&id).ok_or_else(|| self.not_found(id))?;
            if entry.row.version != expected_version {
                return Err(StoreError::Conflict {
                    id: id.to_string(),
                    expected: expected_version,
                    actual: entry.row.version,
                });
            }
            entry.row.version += 1;
            entry.row.value = value;
            entry.row.clone()
        };

        self.publish(ChangeKind::Updated, &row);
        Ok(row)
    }

    async fn delete(&self, id: Uuid) -> StoreResult<()> {
        let removed = self.inner.lock().rows.remove(&id);
        if let Some(removed) = removed {
            debug!(table = self.name, %id, "Row deleted");
            self.publish(ChangeKind::Deleted, &removed.row);
        }
        Ok(())
    }

    async fn list(&self) -> StoreResult<Vec<Versioned<T>>> {
        let inner = self.inner.lock();
        let mut rows: Vec<&Row<T>> = inner.rows.values().collect();
        rows.sort_by_key(|r| r.seq);
        Ok(rows.into_iter().map(|r| r.row.clone()).collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<Change<T>> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_get_and_list_in_order() {
        let table = MemoryTable::new("notes");
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        table.insert(a, "first".to_string()).await.unwrap();
        table.insert(b, "second".to_string()).await.unwrap();

        let row = table.get(a).await.unwrap().unwrap();
        assert_eq!(row.version, 1);
        assert_eq!(row.value, "first");

        let listed: Vec<_> = table.list().await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(listed, vec![a, b]);
        assert!(table.insert(a, "again".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let table = MemoryTable::new("notes");
        let id = Uuid::new_v4();
        table.insert(id, 1u32).await.unwrap();
        table.update(id, 1, 2).await.unwrap();

        let err = table.update(id, 1, 3).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(table.get(id).await.unwrap().unwrap().value, 2);
    }

    #[tokio::test]
    async fn changes_are_published() {
        let table = MemoryTable::new("notes");
        let mut feed = table.subscribe();
        let id = Uuid::new_v4();

        table.insert(id, 1u32).await.unwrap();
        table.update_now(id, |v| *v += 1).unwrap();
        table.delete(id).await.unwrap();
        table.delete(id).await.unwrap();

        let kinds: Vec<_> = std::iter::from_fn(|| feed.try_recv().ok())
            .map(|c| (c.kind, c.version))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (ChangeKind::Inserted, 1),
                (ChangeKind::Updated, 2),
                (ChangeKind::Deleted, 2),
            ]
        );
    }

    #[tokio::test]
    async fn injected_insert_failure() {
        let table = MemoryTable::new("notes");
        table.fail_next_inserts(1);

        assert!(matches!(
            table.insert(Uuid::new_v4(), 0u8).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(table.is_empty());
        assert!(table.insert(Uuid::new_v4(), 0u8).await.is_ok());
    }
}
