use serde_json::{Map, Value};

use super::{ObjectMeta, ObjectStore, PutRequest, PutResult, SunError};

pub const MAX_CAS_ATTEMPTS: usize = 8;

/// A payload type that can be read, mutated and written back through
/// [`cas_mutate`].
pub trait CasDocument: Sized {
    type Error: From<SunError>;

    const CONTENT_TYPE: &'static str;

    /// The document a missing object starts from.
    fn empty(name: &str) -> Self;

    fn decode(name: &str, payload: &[u8]) -> Result<Self, Self::Error>;

    fn encode(&self) -> Result<Vec<u8>, Self::Error>;

    fn metadata(&self) -> Map<String, Value> {
        Map::new()
    }
}

#[derive(Debug, Clone)]
pub struct CasOutcome<T> {
    pub value: T,
    pub put: PutResult,
    pub attempts: usize,
    /// False when the mutation left the payload byte-identical and no PUT was sent.
    pub written: bool,
}

/// Reads the object and its metadata. `None` when it does not exist yet.
pub fn read_document<D: CasDocument>(
    store: &dyn ObjectStore,
    kind: &str,
    name: &str,
) -> Result<Option<(D, ObjectMeta)>, D::Error> {
    Ok(read_raw::<D>(store, kind, name)?.map(|(document, meta, _)| (document, meta)))
}

fn read_raw<D: CasDocument>(
    store: &dyn ObjectStore,
    kind: &str,
    name: &str,
) -> Result<Option<(D, ObjectMeta, Vec<u8>)>, D::Error> {
    let Some(meta) = store.lookup_meta(kind, name)? else {
        return Ok(None);
    };
    match store.get_payload(kind, name) {
        Ok(payload) => Ok(Some((D::decode(name, &payload)?, meta, payload))),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Load, mutate and conditionally write `(kind, name)`, re-reading and
/// re-running `mutate` after every revision conflict.
///
/// A missing object is written with `expected_revision = 0`, so two
/// concurrent creators cannot both win. Errors returned by `mutate` abort
/// the loop without writing, and a mutation that reproduces the stored
/// payload exactly is not written either.
pub fn cas_mutate<D, T, F>(
    store: &dyn ObjectStore,
    kind: &str,
    name: &str,
    mut mutate: F,
) -> Result<CasOutcome<T>, D::Error>
where
    D: CasDocument,
    F: FnMut(&mut D) -> Result<T, D::Error>,
{
    let mut last_current = None;
    for attempt in 1..=MAX_CAS_ATTEMPTS {
        let (mut document, expected, original) = match read_raw::<D>(store, kind, name)? {
            Some((document, meta, payload)) => (document, meta.latest_revision, Some(payload)),
            None => (D::empty(name), 0, None),
        };
        let value = mutate(&mut document)?;
        let payload = document.encode()?;
        if original.as_deref() == Some(payload.as_slice()) {
            return Ok(CasOutcome {
                value,
                put: PutResult {
                    latest_revision: expected,
                    revision: expected,
                },
                attempts: attempt,
                written: false,
            });
        }
        let request = PutRequest {
            kind,
            name,
            payload: &payload,
            content_type: D::CONTENT_TYPE,
            metadata: document.metadata(),
            expected_revision: Some(expected),
        };
        match store.put_object(request) {
            Ok(put) => {
                tracing::debug!(kind, name, attempt, revision = put.revision, "cas write");
                return Ok(CasOutcome {
                    value,
                    put,
                    attempts: attempt,
                    written: true,
                });
            }
            Err(SunError::RevisionConflict { current, .. }) => {
                tracing::debug!(kind, name, attempt, expected, "cas conflict");
                last_current = current;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Err(SunError::RevisionConflict {
        current: last_current,
        message: format!("{kind}/{name} still conflicting after {MAX_CAS_ATTEMPTS} attempts"),
    }
    .into())
}
