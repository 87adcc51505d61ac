//! Server-allocated out arrays.

use crate::memory::RemoteArray;
use crate::typedefs::{FileTime, Hresult, ItemHandle, NativeItemResult, NativeItemState, VarType};
use windows::Win32::Foundation::FILETIME;
use windows::Win32::System::Com::CoTaskMemFree;
use windows::Win32::System::Variant::VariantClear;

use super::variant::variant_from_com;

/// An out array the server fills with `CoTaskMemAlloc`.
///
/// The pointer starts null and is freed exactly once on drop, so a failed
/// call that never wrote it frees nothing.
pub(crate) struct ComArray<T> {
    pointer: *mut T,
    len: u32,
}

impl<T> ComArray<T> {
    /// Prepares an out array the server will fill with `len` entries.
    pub(crate) const fn new(len: u32) -> Self {
        Self {
            pointer: std::ptr::null_mut(),
            len,
        }
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut *mut T {
        &raw mut self.pointer
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [T] {
        if self.pointer.is_null() || self.len == 0 {
            return &mut [];
        }
        // SAFETY: the server filled `pointer` with `len` initialized entries
        // and the allocation lives until `self` is dropped.
        unsafe { std::slice::from_raw_parts_mut(self.pointer, self.len as usize) }
    }
}

impl<T> Drop for ComArray<T> {
    fn drop(&mut self) {
        if !self.pointer.is_null() {
            // SAFETY: the pointer came from the server's `CoTaskMemAlloc`
            // and is nulled so it is never freed twice.
            unsafe { CoTaskMemFree(Some(self.pointer.cast_const().cast())) };
            self.pointer = std::ptr::null_mut();
        }
    }
}

pub(crate) const fn to_hresult(hr: windows::core::HRESULT) -> Hresult {
    Hresult(hr.0)
}

pub(crate) const fn to_filetime(ft: FILETIME) -> FileTime {
    FileTime {
        low: ft.dwLowDateTime,
        high: ft.dwHighDateTime,
    }
}

/// Copies the per-item codes and frees the server buffer.
pub(crate) fn take_errors(mut errors: ComArray<windows::core::HRESULT>) -> RemoteArray<Hresult> {
    RemoteArray::from_vec(
        errors
            .as_mut_slice()
            .iter()
            .map(|hr| to_hresult(*hr))
            .collect(),
    )
}

/// Copies the add/validate results, freeing every nested blob.
pub(crate) fn take_item_results(
    mut results: ComArray<opc_da_bindings::tagOPCITEMRESULT>,
) -> RemoteArray<NativeItemResult> {
    let items = results
        .as_mut_slice()
        .iter_mut()
        .map(|result| {
            let blob = if result.pBlob.is_null() || result.dwBlobSize == 0 {
                Vec::new()
            } else {
                // SAFETY: the server reports `dwBlobSize` bytes at `pBlob`.
                unsafe { std::slice::from_raw_parts(result.pBlob, result.dwBlobSize as usize) }
                    .to_vec()
            };
            if !result.pBlob.is_null() {
                // SAFETY: nested blobs are `CoTaskMemAlloc`ed for the caller
                // to free; nulled so the entry is not freed twice.
                unsafe { CoTaskMemFree(Some(result.pBlob.cast_const().cast())) };
                result.pBlob = std::ptr::null_mut();
            }
            NativeItemResult {
                server_handle: ItemHandle(result.hServer),
                canonical_type: VarType(result.vtCanonicalDataType),
                access_rights: result.dwAccessRights,
                blob,
            }
        })
        .collect();
    RemoteArray::from_vec(items)
}

/// Copies the synchronous read states, clearing every owned variant.
pub(crate) fn take_item_states(
    mut states: ComArray<opc_da_bindings::tagOPCITEMSTATE>,
) -> RemoteArray<NativeItemState> {
    let items = states
        .as_mut_slice()
        .iter_mut()
        .map(|state| {
            // SAFETY: each state holds a variant initialized by the server.
            let value = unsafe { variant_from_com(&state.vDataValue) };
            // SAFETY: the caller owns the variant contents; clearing frees
            // any string or array and leaves it `VT_EMPTY`.
            if let Err(err) = unsafe { VariantClear(&raw mut state.vDataValue) } {
                tracing::warn!(error = ?err, "VariantClear failed on a read result");
            }
            NativeItemState {
                client_handle: ItemHandle(state.hClient),
                timestamp: to_filetime(state.ftTimeStamp),
                quality: state.wQuality,
                value,
            }
        })
        .collect();
    RemoteArray::from_vec(items)
}
