//! Merge-patch documents and optimistic read-modify-write.

use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::table::{Record, Table, Versioned};
use crate::StoreResult;

/// Apply a JSON merge patch (RFC 7396) to `target`.
///
/// Object members of the patch are merged recursively, `null` members
/// remove the key, and any other patch value replaces the target.
pub fn merge_json(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge_json(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Read a row, apply `f` to a copy and write it back if nobody else wrote
/// in between. Conflicts are retried with a fresh read, up to
/// `max_attempts` times; `f` may therefore run more than once and must be
/// a pure function of the row it is given.
pub async fn update_with<S, T, F>(
    table: &S,
    id: Uuid,
    max_attempts: u32,
    mut f: F,
) -> StoreResult<Versioned<T>>
where
    S: Table<T> + ?Sized,
    T: Record,
    F: FnMut(&mut T) -> StoreResult<()> + Send,
{
    let max_attempts = max_attempts.max(1);

    for attempt in 1..=max_attempts {
        let current = table.get(id).await?.ok_or_else(|| StoreError::NotFound {
            table: "row",
            id: id.to_string(),
        })?;

        let mut value = current.value.clone();
        f(&mut value)?;

        match table.update(id, current.version, value).await {
            Ok(row) => return Ok(row),
            Err(e) if e.is_conflict() => {
                debug!(%id, attempt, "Update conflicted, retrying");
            }
            Err(e) => return Err(e),
        }
    }

    warn!(%id, attempts = max_attempts, "Update retries exhausted");
    Err(StoreError::RetriesExhausted {
        id: id.to_string(),
        attempts: max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::MemoryTable;
    use serde_json::json;

    #[test]
    fn merge_keeps_unrelated_fields() {
        let mut doc = json!({"live_title": "Q&A", "thumbnail": "t.jpg", "nested": {"a": 1}});
        merge_json(
            &mut doc,
            &json!({"live_status": "ended", "nested": {"b": 2}}),
        );

        assert_eq!(
            doc,
            json!({
                "live_title": "Q&A",
                "thumbnail": "t.jpg",
                "live_status": "ended",
                "nested": {"a": 1, "b": 2}
            })
        );
    }

    #[test]
    fn merge_null_removes_and_scalars_replace() {
        let mut doc = json!({"a": 1, "b": {"c": 2}});
        merge_json(&mut doc, &json!({"a": null, "b": 3}));
        assert_eq!(doc, json!({"b": 3}));

        let mut scalar = json!("text");
        merge_json(&mut scalar, &json!({"k": true}));
        assert_eq!(scalar, json!({"k": true}));
    }

    #[tokio::test]
    async fn concurrent_writer_is_not_lost() {
        let table = MemoryTable::new("posts");
        let id = Uuid::new_v4();
        table.insert(id, json!({"title": "Q&A"})).await.unwrap();

        let other = table.clone();
        let mut calls = 0;
        let row = update_with(&table, id, 5, |doc| {
            calls += 1;
            if calls == 1 {
                other
                    .update_now(id, |d| merge_json(d, &json!({"moderation": "ok"})))
                    .map(|_| ())?;
            }
            merge_json(doc, &json!({"live_status": "ended"}));
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(calls, 2);
        assert_eq!(
            row.value,
            json!({"title": "Q&A", "moderation": "ok", "live_status": "ended"})
        );
    }

    #[tokio::test]
    async fn persistent_conflicts_give_up() {
        let table = MemoryTable::new("counters");
        let id = Uuid::new_v4();
        table.insert(id, 0u32).await.unwrap();

        let other = table.clone();
        let result = update_with(&table, id, 3, |v| {
            other.update_now(id, |n| *n += 10)?;
            *v += 1;
            Ok(())
        })
        .await;

        assert!(matches!(
            result,
            Err(StoreError::RetriesExhausted { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn missing_row_is_not_found() {
        let table: MemoryTable<u32> = MemoryTable::new("counters");
        let result = update_with(&table, Uuid::new_v4(), 3, |_| Ok(())).await;
        assert!(result.unwrap_err().is_not_found());
    }
}
