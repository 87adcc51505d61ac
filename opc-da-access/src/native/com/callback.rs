//! The `IOPCDataCallback` sink advised on a group's connection point.

use super::GroupHandles;
use super::memory::{to_filetime, to_hresult};
use super::variant::variant_from_com;
use crate::codec::ValueBuffers;
use crate::errors::OpcResult;
use crate::native::{DataCallback, ValueNotification, WriteNotification};
use crate::typedefs::{GroupHandle, Hresult, ItemHandle};
use std::sync::Arc;
use windows::Win32::Foundation::{E_FAIL, FILETIME};
use windows::Win32::System::Variant::VARIANT;
use windows::core::HRESULT;

/// Forwards server notifications to a [`DataCallback`].
///
/// Servers report the client group handle; it is translated to the server
/// handle the callback filters on. The arrays stay owned by the server.
#[windows::core::implement(opc_da_bindings::IOPCDataCallback)]
pub(crate) struct DataCallbackSink {
    callback: Arc<dyn DataCallback>,
    handles: Arc<GroupHandles>,
}

impl DataCallbackSink {
    pub(crate) fn new(callback: Arc<dyn DataCallback>, handles: Arc<GroupHandles>) -> Self {
        Self { callback, handles }
    }

    fn group(&self, reported: u32) -> GroupHandle {
        self.handles.resolve(reported)
    }
}

/// Borrows a server array; null or zero-length becomes empty.
///
/// # Safety
///
/// A non-null `pointer` must reference `count` initialized entries that
/// outlive the returned slice.
unsafe fn borrow<'a, T>(pointer: *const T, count: u32) -> &'a [T] {
    if pointer.is_null() || count == 0 {
        return &[];
    }
    // SAFETY: upheld by the caller.
    unsafe { std::slice::from_raw_parts(pointer, count as usize) }
}

fn to_windows(result: OpcResult<()>) -> windows::core::Result<()> {
    result.map_err(|err| {
        tracing::warn!(error = %err, "Notification handling failed");
        windows::core::Error::from(E_FAIL)
    })
}

struct CopiedValues {
    client_handles: Vec<ItemHandle>,
    values: Vec<crate::variant::Variant>,
    qualities: Vec<u16>,
    timestamps: Vec<crate::typedefs::FileTime>,
    errors: Vec<Hresult>,
}

impl CopiedValues {
    /// # Safety
    ///
    /// Every non-null pointer must reference `count` initialized entries.
    unsafe fn new(
        count: u32,
        client_items: *const u32,
        values: *const VARIANT,
        qualities: *const u16,
        timestamps: *const FILETIME,
        errors: *const HRESULT,
    ) -> Self {
        // SAFETY: each array is valid for `count` entries during the call.
        unsafe {
            Self {
                client_handles: borrow(client_items, count)
                    .iter()
                    .map(|handle| ItemHandle(*handle))
                    .collect(),
                values: borrow(values, count)
                    .iter()
                    .map(|value| variant_from_com(value))
                    .collect(),
                qualities: borrow(qualities, count).to_vec(),
                timestamps: borrow(timestamps, count)
                    .iter()
                    .map(|ft| to_filetime(*ft))
                    .collect(),
                errors: borrow(errors, count)
                    .iter()
                    .map(|hr| to_hresult(*hr))
                    .collect(),
            }
        }
    }

    fn buffers(&self) -> ValueBuffers<'_> {
        ValueBuffers {
            client_handles: &self.client_handles,
            values: &self.values,
            qualities: &self.qualities,
            timestamps: &self.timestamps,
            errors: &self.errors,
        }
    }
}

impl opc_da_bindings::IOPCDataCallback_Impl for DataCallbackSink_Impl {
    fn OnDataChange(
        &self,
        transaction_id: u32,
        group_handle: u32,
        master_quality: HRESULT,
        master_error: HRESULT,
        count: u32,
        client_items: *const u32,
        values: *const VARIANT,
        qualities: *const u16,
        timestamps: *const FILETIME,
        errors: *const HRESULT,
    ) -> windows::core::Result<()> {
        // SAFETY: the server passes `count` entries per array for this call.
        let copied = unsafe {
            CopiedValues::new(count, client_items, values, qualities, timestamps, errors)
        };
        to_windows(self.callback.on_data_change(&ValueNotification {
            transaction_id,
            group_handle: self.group(group_handle),
            master_quality: to_hresult(master_quality),
            master_error: to_hresult(master_error),
            count,
            buffers: copied.buffers(),
        }))
    }

    fn OnReadComplete(
        &self,
        transaction_id: u32,
        group_handle: u32,
        master_quality: HRESULT,
        master_error: HRESULT,
        count: u32,
        client_items: *const u32,
        values: *const VARIANT,
        qualities: *const u16,
        timestamps: *const FILETIME,
        errors: *const HRESULT,
    ) -> windows::core::Result<()> {
        // SAFETY: as in `OnDataChange`.
        let copied = unsafe {
            CopiedValues::new(count, client_items, values, qualities, timestamps, errors)
        };
        to_windows(self.callback.on_read_complete(&ValueNotification {
            transaction_id,
            group_handle: self.group(group_handle),
            master_quality: to_hresult(master_quality),
            master_error: to_hresult(master_error),
            count,
            buffers: copied.buffers(),
        }))
    }

    fn OnWriteComplete(
        &self,
        transaction_id: u32,
        group_handle: u32,
        master_error: HRESULT,
        count: u32,
        client_handles: *const u32,
        errors: *const HRESULT,
    ) -> windows::core::Result<()> {
        // SAFETY: the server passes `count` entries per array for this call.
        let (client_handles, errors) = unsafe {
            (
                borrow(client_handles, count)
                    .iter()
                    .map(|handle| ItemHandle(*handle))
                    .collect::<Vec<_>>(),
                borrow(errors, count)
                    .iter()
                    .map(|hr| to_hresult(*hr))
                    .collect::<Vec<_>>(),
            )
        };
        to_windows(self.callback.on_write_complete(&WriteNotification {
            transaction_id,
            group_handle: self.group(group_handle),
            master_error: to_hresult(master_error),
            count,
            client_handles: &client_handles,
            errors: &errors,
        }))
    }

    fn OnCancelComplete(
        &self,
        transaction_id: u32,
        group_handle: u32,
    ) -> windows::core::Result<()> {
        to_windows(
            self.callback
                .on_cancel_complete(transaction_id, self.group(group_handle)),
        )
    }
}
