//! Field accessors shared by the typed document views.

use automerge::{transaction::Transactable, AutoCommit, ObjId, ObjType, ReadDoc, ScalarValue, Value};

use crate::error::AccountResult;
use crate::types::DocumentUrl;

/// Read a string field, `None` when absent or not a string
pub(crate) fn get_str(doc: &AutoCommit, obj: &ObjId, key: &str) -> AccountResult<Option<String>> {
    Ok(doc
        .get(obj, key)?
        .and_then(|(value, _)| value.to_str().map(str::to_string)))
}

/// Read an integer field (ints, uints and timestamps are accepted)
pub(crate) fn get_i64(doc: &AutoCommit, obj: &ObjId, key: &str) -> AccountResult<Option<i64>> {
    Ok(match doc.get(obj, key)? {
        Some((Value::Scalar(s), _)) => match s.as_ref() {
            ScalarValue::Int(i) | ScalarValue::Timestamp(i) => Some(*i),
            ScalarValue::Uint(u) => i64::try_from(*u).ok(),
            _ => None,
        },
        _ => None,
    })
}

/// Read a bytes field
pub(crate) fn get_bytes(doc: &AutoCommit, obj: &ObjId, key: &str) -> AccountResult<Option<Vec<u8>>> {
    Ok(match doc.get(obj, key)? {
        Some((Value::Scalar(s), _)) => match s.as_ref() {
            ScalarValue::Bytes(b) => Some(b.clone()),
            _ => None,
        },
        _ => None,
    })
}

/// Read a document reference field.
///
/// A stored value that does not parse is treated as absent.
pub(crate) fn get_url(doc: &AutoCommit, obj: &ObjId, key: &str) -> AccountResult<Option<DocumentUrl>> {
    Ok(get_str(doc, obj, key)?.and_then(|s| DocumentUrl::parse(&s).ok()))
}

/// Look up a nested map
pub(crate) fn get_map(doc: &AutoCommit, obj: &ObjId, key: &str) -> AccountResult<Option<ObjId>> {
    Ok(match doc.get(obj, key)? {
        Some((Value::Object(ObjType::Map), id)) => Some(id),
        _ => None,
    })
}

/// Write or delete an optional string field
pub(crate) fn put_opt_str(
    doc: &mut AutoCommit,
    obj: &ObjId,
    key: &str,
    value: Option<&str>,
) -> AccountResult<()> {
    match value {
        Some(v) => doc.put(obj, key, v)?,
        None => {
            if doc.get(obj, key)?.is_some() {
                doc.delete(obj, key)?;
            }
        }
    }
    Ok(())
}
