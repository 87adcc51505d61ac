//! Turns native per-item result buffers into typed results.
//!
//! Every reader takes the [`RemoteArray`]s by value: the buffers are released
//! when the reader returns, whether it succeeds or fails partway.

use crate::codec::decode_item;
use crate::errors::{OpcError, OpcResult};
use crate::memory::RemoteArray;
use crate::typedefs::{
    AccessRights, Hresult, ItemDef, ItemHandle, ItemResult, ItemValue, NativeItemResult,
    NativeItemState, VarType,
};

/// The first `count` entries, or a conversion error if the server sent fewer.
fn bounded<'a, T>(buffer: &'a RemoteArray<T>, count: usize, what: &str) -> OpcResult<&'a [T]> {
    let slice = buffer.as_slice();
    slice.get(..count).ok_or_else(|| {
        OpcError::Conversion(format!(
            "{what} buffer holds {} entries, expected {count}",
            slice.len()
        ))
    })
}

/// Reads plain per-item status codes.
pub fn read_results(count: usize, errors: RemoteArray<Hresult>) -> OpcResult<Vec<Hresult>> {
    Ok(bounded(&errors, count, "error")?.to_vec())
}

/// Reads add/validate results, aligned with the input definitions.
pub fn read_item_results(
    items: &[ItemDef],
    results: RemoteArray<NativeItemResult>,
    errors: RemoteArray<Hresult>,
) -> OpcResult<Vec<ItemResult>> {
    let count = items.len();
    let errors = bounded(&errors, count, "error")?;
    let results = bounded(&results, count, "item result")?;

    Ok(items
        .iter()
        .zip(results)
        .zip(errors)
        .map(|((item, result), error)| {
            if error.is_ok() {
                ItemResult {
                    client_handle: item.client_handle,
                    server_handle: Some(result.server_handle),
                    canonical_type: result.canonical_type,
                    access_rights: AccessRights(result.access_rights),
                    blob: result.blob.clone(),
                    error: *error,
                }
            } else {
                ItemResult {
                    client_handle: item.client_handle,
                    server_handle: None,
                    canonical_type: VarType::EMPTY,
                    access_rights: AccessRights::default(),
                    blob: Vec::new(),
                    error: *error,
                }
            }
        })
        .collect())
}

/// Reads a synchronous read response.
pub fn read_item_states(
    count: usize,
    states: RemoteArray<NativeItemState>,
    errors: RemoteArray<Hresult>,
) -> OpcResult<Vec<ItemValue>> {
    let errors = bounded(&errors, count, "error")?;
    let states = bounded(&states, count, "item state")?;

    Ok(states
        .iter()
        .zip(errors)
        .map(|(state, error)| {
            decode_item(
                state.client_handle,
                &state.value,
                state.quality,
                state.timestamp,
                *error,
            )
        })
        .collect())
}

/// Pairs write-complete client handles with their status codes.
///
/// Callback arrays stay owned by the server, so these are borrowed.
pub fn read_write_results(
    count: usize,
    client_handles: &[ItemHandle],
    errors: &[Hresult],
) -> OpcResult<Vec<(ItemHandle, Hresult)>> {
    if client_handles.len() < count || errors.len() < count {
        return Err(OpcError::Conversion(format!(
            "write-complete buffers hold {} handles and {} errors, expected {count}",
            client_handles.len(),
            errors.len()
        )));
    }
    Ok(client_handles
        .iter()
        .copied()
        .zip(errors.iter().copied())
        .take(count)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::{Value, Variant};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tracked<T>(items: Vec<T>, len: u32, released: &Arc<AtomicUsize>) -> RemoteArray<T> {
        let released = Arc::clone(released);
        RemoteArray::with_release(items, len, move || {
            released.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_read_results_preserves_order_and_releases() {
        let released = Arc::new(AtomicUsize::new(0));
        let errors = tracked(
            vec![Hresult::S_OK, Hresult::OPC_E_INVALIDHANDLE, Hresult::S_OK],
            3,
            &released,
        );
        let results = read_results(3, errors).unwrap();
        assert_eq!(
            results,
            vec![Hresult::S_OK, Hresult::OPC_E_INVALIDHANDLE, Hresult::S_OK]
        );
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_read_results_never_reads_past_count() {
        let released = Arc::new(AtomicUsize::new(0));
        let errors = tracked(vec![Hresult::S_OK; 4], 4, &released);
        assert_eq!(read_results(3, errors).unwrap().len(), 3);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_short_buffer_fails_and_still_releases() {
        let released = Arc::new(AtomicUsize::new(0));
        let items = vec![
            ItemDef::new("A", ItemHandle(1)),
            ItemDef::new("B", ItemHandle(2)),
        ];
        let results = tracked(vec![NativeItemResult::default(); 2], 2, &released);
        let errors = tracked(vec![Hresult::S_OK], 2, &released);

        let err = read_item_results(&items, results, errors).unwrap_err();
        assert!(matches!(err, OpcError::Conversion(_)));
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_read_item_results_per_item_failure() {
        let items = vec![
            ItemDef::new("Known", ItemHandle(10)),
            ItemDef::new("Unknown", ItemHandle(11)),
        ];
        let results = RemoteArray::from_vec(vec![
            NativeItemResult {
                server_handle: ItemHandle(500),
                canonical_type: VarType::R8,
                access_rights: 3,
                blob: vec![9],
            },
            NativeItemResult {
                server_handle: ItemHandle(0xFFFF),
                ..NativeItemResult::default()
            },
        ]);
        let errors = RemoteArray::from_vec(vec![Hresult::S_OK, Hresult::OPC_E_UNKNOWNITEMID]);

        let results = read_item_results(&items, results, errors).unwrap();
        assert_eq!(results[0].client_handle, ItemHandle(10));
        assert_eq!(results[0].server_handle, Some(ItemHandle(500)));
        assert_eq!(results[0].canonical_type, VarType::R8);
        assert!(results[0].access_rights.is_writeable());
        assert_eq!(results[0].blob, vec![9]);
        assert_eq!(results[1].client_handle, ItemHandle(11));
        assert_eq!(results[1].server_handle, None);
        assert_eq!(results[1].error, Hresult::OPC_E_UNKNOWNITEMID);
    }

    #[test]
    fn test_read_item_states_decodes_values() {
        let states = RemoteArray::from_vec(vec![
            NativeItemState {
                client_handle: ItemHandle(1),
                quality: 0xC0,
                value: Variant::bits(VarType::I2, 42),
                ..NativeItemState::default()
            },
            NativeItemState::default(),
        ]);
        let errors = RemoteArray::from_vec(vec![Hresult::S_OK, Hresult::OPC_E_INVALIDHANDLE]);

        let values = read_item_states(2, states, errors).unwrap();
        assert_eq!(values[0].value, Value::I2(42));
        assert!(values[0].quality.is_good());
        assert_eq!(values[0].timestamp, None);
        assert_eq!(values[1].error, Hresult::OPC_E_INVALIDHANDLE);
    }

    #[test]
    fn test_read_write_results() {
        let handles = [ItemHandle(1), ItemHandle(2), ItemHandle(3)];
        let errors = [Hresult::S_OK, Hresult::OPC_E_BADRIGHTS, Hresult::S_OK];
        let pairs = read_write_results(2, &handles, &errors).unwrap();
        assert_eq!(
            pairs,
            vec![
                (ItemHandle(1), Hresult::S_OK),
                (ItemHandle(2), Hresult::OPC_E_BADRIGHTS)
            ]
        );
        assert!(read_write_results(4, &handles, &errors).is_err());
    }
}
