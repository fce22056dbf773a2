use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde_json::{Map, Value};

use super::{sha256_hex, ObjectMeta, ObjectRevision, ObjectStore, PutRequest, PutResult, SunError};

/// In-process object store with the same `expected_revision` gate as the
/// Sun service.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<(String, String), Vec<StoredRevision>>>,
    pending_conflicts: AtomicUsize,
    puts: AtomicUsize,
}

#[derive(Debug, Clone)]
struct StoredRevision {
    payload: Vec<u8>,
    content_type: String,
    metadata: Map<String, Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` puts fail with a conflict regardless of revision.
    pub fn inject_conflicts(&self, count: usize) {
        self.pending_conflicts.store(count, Ordering::SeqCst);
    }

    pub fn latest_revision(&self, kind: &str, name: &str) -> i64 {
        self.with_objects(|objects| {
            objects
                .get(&key(kind, name))
                .map_or(0, |revisions| revisions.len() as i64)
        })
    }

    pub fn successful_puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    fn with_objects<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<(String, String), Vec<StoredRevision>>) -> T,
    ) -> T {
        let mut guard = match self.objects.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    fn meta(kind: &str, name: &str, revisions: &[StoredRevision]) -> Option<ObjectMeta> {
        let latest = revisions.last()?;
        Some(ObjectMeta {
            kind: kind.to_string(),
            name: name.to_string(),
            latest_revision: revisions.len() as i64,
            checksum: sha256_hex(&latest.payload),
            content_type: latest.content_type.clone(),
            size_bytes: latest.payload.len() as i64,
            metadata: latest.metadata.clone(),
            created_at: String::new(),
            updated_at: String::new(),
        })
    }
}

fn key(kind: &str, name: &str) -> (String, String) {
    (kind.to_string(), name.to_string())
}

impl ObjectStore for MemoryStore {
    fn lookup_meta(&self, kind: &str, name: &str) -> Result<Option<ObjectMeta>, SunError> {
        Ok(self.with_objects(|objects| {
            objects
                .get(&key(kind, name))
                .and_then(|revisions| Self::meta(kind, name, revisions))
        }))
    }

    fn get_payload(&self, kind: &str, name: &str) -> Result<Vec<u8>, SunError> {
        self.with_objects(|objects| {
            objects
                .get(&key(kind, name))
                .and_then(|revisions| revisions.last())
                .map(|latest| latest.payload.clone())
                .ok_or_else(|| SunError::NotFound {
                    message: "object not found".to_string(),
                })
        })
    }

    fn put_object(&self, request: PutRequest<'_>) -> Result<PutResult, SunError> {
        self.with_objects(|objects| {
            let revisions = objects.entry(key(request.kind, request.name)).or_default();
            let current = revisions.len() as i64;
            let injected = self
                .pending_conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            let mismatch = request
                .expected_revision
                .is_some_and(|expected| expected != current);
            if injected || mismatch {
                if revisions.is_empty() {
                    objects.remove(&key(request.kind, request.name));
                }
                return Err(SunError::RevisionConflict {
                    current: Some(current),
                    message: "revision mismatch".to_string(),
                });
            }
            revisions.push(StoredRevision {
                payload: request.payload.to_vec(),
                content_type: request.content_type.to_string(),
                metadata: request.metadata,
            });
            self.puts.fetch_add(1, Ordering::SeqCst);
            Ok(PutResult {
                latest_revision: current + 1,
                revision: current + 1,
            })
        })
    }

    fn list_objects(&self, kind: &str, limit: usize) -> Result<Vec<ObjectMeta>, SunError> {
        Ok(self.with_objects(|objects| {
            objects
                .iter()
                .filter(|((object_kind, _), _)| object_kind == kind)
                .filter_map(|((object_kind, name), revisions)| {
                    Self::meta(object_kind, name, revisions)
                })
                .take(if limit == 0 { usize::MAX } else { limit })
                .collect()
        }))
    }

    fn list_revisions(
        &self,
        kind: &str,
        name: &str,
        limit: usize,
    ) -> Result<Vec<ObjectRevision>, SunError> {
        self.with_objects(|objects| {
            let revisions = objects.get(&key(kind, name)).ok_or_else(|| SunError::NotFound {
                message: "object not found".to_string(),
            })?;
            Ok(revisions
                .iter()
                .enumerate()
                .rev()
                .take(if limit == 0 { usize::MAX } else { limit })
                .map(|(index, stored)| ObjectRevision {
                    revision: index as i64 + 1,
                    checksum: sha256_hex(&stored.payload),
                    content_type: stored.content_type.clone(),
                    size_bytes: stored.payload.len() as i64,
                    metadata: stored.metadata.clone(),
                    created_at: String::new(),
                })
                .collect())
        })
    }
}
