//! Windows COM backend for the native group interfaces.
//!
//! Every interface is used from the multi-threaded apartment; create a
//! [`ComApartment`] on each thread that touches a group. Server-allocated
//! out arrays are copied and freed before a call returns.

mod callback;
mod memory;
mod variant;

use crate::errors::{OpcError, OpcResult};
use crate::memory::RemoteArray;
use crate::native::{
    AsyncIo2, ConnectionPoint, ConnectionPointContainer, DataCallback, GroupStateMgt, ItemMgt,
    ItemResults, NativeGroupObject, SyncIo,
};
use crate::typedefs::{
    DataSource, GroupHandle, GroupProperties, GroupStateChange, Guid, Hresult, ItemDef, ItemHandle,
    NativeItemState, VarType,
};
use crate::variant::Variant;
use callback::DataCallbackSink;
use memory::{ComArray, take_errors, take_item_results, take_item_states, to_hresult};
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use variant::{OwnedVariant, variant_to_com};
use windows::Win32::System::Com::{
    COINIT_MULTITHREADED, CoInitializeEx, CoTaskMemFree, CoUninitialize, IConnectionPoint,
    IConnectionPointContainer,
};
use windows::Win32::System::Variant::VARIANT;
use windows::core::{BOOL, ComObjectInner as _, GUID, IUnknown, Interface, PWSTR};

/// Maps a failed COM call to [`OpcError::Native`].
fn com_error(operation: &'static str) -> impl FnOnce(windows::core::Error) -> OpcError {
    move |err| OpcError::native(operation, to_hresult(err.code()))
}

fn raw_handles(handles: &[ItemHandle]) -> Vec<u32> {
    handles.iter().map(|handle| handle.0).collect()
}

fn wide(value: &str) -> Vec<u16> {
    value.encode_utf16().chain(std::iter::once(0)).collect()
}

const fn to_guid(guid: &Guid) -> GUID {
    GUID {
        data1: guid.data1,
        data2: guid.data2,
        data3: guid.data3,
        data4: guid.data4,
    }
}

const fn to_data_source(source: DataSource) -> opc_da_bindings::tagOPCDATASOURCE {
    match source {
        DataSource::Cache => opc_da_bindings::OPC_DS_CACHE,
        DataSource::Device => opc_da_bindings::OPC_DS_DEVICE,
    }
}

fn encode_all(values: &[Variant]) -> OpcResult<Vec<OwnedVariant>> {
    values.iter().map(variant_to_com).collect()
}

/// Drop guard joining the multi-threaded apartment.
///
/// Must be created and dropped on the same thread, so it is `!Send`.
#[derive(Debug)]
pub struct ComApartment {
    _not_send: PhantomData<*mut ()>,
}

impl ComApartment {
    /// Calls `CoInitializeEx` in MTA mode (`S_FALSE` counts as success).
    pub fn enter() -> OpcResult<Self> {
        // SAFETY: balanced by `CoUninitialize` in `Drop`, on this thread.
        let hr = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) };
        if let Err(err) = hr.ok() {
            tracing::error!(error = ?err, "COM MTA initialization failed");
            return Err(OpcError::native("CoInitializeEx", to_hresult(err.code())));
        }
        tracing::debug!("COM MTA initialized");
        Ok(Self {
            _not_send: PhantomData,
        })
    }
}

impl Drop for ComApartment {
    fn drop(&mut self) {
        tracing::debug!("COM MTA teardown");
        // SAFETY: paired with the successful `CoInitializeEx` in `enter`,
        // on the creating thread.
        unsafe { CoUninitialize() };
    }
}

/// The two handles naming one group.
///
/// Servers put the client handle in callbacks; notifications are filtered
/// on the server handle.
#[derive(Debug)]
pub(crate) struct GroupHandles {
    server: GroupHandle,
    client: AtomicU32,
}

impl GroupHandles {
    fn resolve(&self, reported: u32) -> GroupHandle {
        if reported == self.client.load(Ordering::Acquire) {
            self.server
        } else {
            GroupHandle(reported)
        }
    }
}

/// A group object returned by `IOPCServer::AddGroup`.
#[derive(Debug)]
pub struct ComGroupObject {
    unknown: IUnknown,
    handles: Arc<GroupHandles>,
}

impl ComGroupObject {
    pub fn new(unknown: IUnknown, client_handle: GroupHandle, server_handle: GroupHandle) -> Self {
        Self {
            unknown,
            handles: Arc::new(GroupHandles {
                server: server_handle,
                client: AtomicU32::new(client_handle.0),
            }),
        }
    }

    fn query<T: Interface>(&self, operation: &'static str) -> OpcResult<T> {
        self.unknown.cast::<T>().map_err(com_error(operation))
    }
}

impl NativeGroupObject for ComGroupObject {
    fn item_mgt(&self) -> OpcResult<Box<dyn ItemMgt>> {
        Ok(Box::new(ComItemMgt(
            self.query("QueryInterface(IOPCItemMgt)")?,
        )))
    }

    fn group_state_mgt(&self) -> OpcResult<Box<dyn GroupStateMgt>> {
        Ok(Box::new(ComGroupStateMgt {
            interface: self.query("QueryInterface(IOPCGroupStateMgt)")?,
            handles: Arc::clone(&self.handles),
        }))
    }

    fn sync_io(&self) -> OpcResult<Box<dyn SyncIo>> {
        Ok(Box::new(ComSyncIo(self.query("QueryInterface(IOPCSyncIO)")?)))
    }

    fn async_io2(&self) -> Option<Box<dyn AsyncIo2>> {
        self.unknown
            .cast::<opc_da_bindings::IOPCAsyncIO2>()
            .ok()
            .map(|interface| Box::new(ComAsyncIo2(interface)) as Box<dyn AsyncIo2>)
    }

    fn connection_point_container(&self) -> Option<Box<dyn ConnectionPointContainer>> {
        self.unknown
            .cast::<IConnectionPointContainer>()
            .ok()
            .map(|interface| {
                Box::new(ComConnectionPointContainer {
                    interface,
                    handles: Arc::clone(&self.handles),
                }) as Box<dyn ConnectionPointContainer>
            })
    }
}

struct ComItemMgt(opc_da_bindings::IOPCItemMgt);

// SAFETY: group interfaces are obtained and used in the MTA, where proxies
// may be called from any thread.
unsafe impl Send for ComItemMgt {}
// SAFETY: as above.
unsafe impl Sync for ComItemMgt {}

/// Item definitions with their wide strings kept alive for the call.
struct NativeItemDefs {
    _strings: Vec<(Vec<u16>, Vec<u16>)>,
    defs: Vec<opc_da_bindings::tagOPCITEMDEF>,
}

impl NativeItemDefs {
    fn new(items: &[ItemDef]) -> OpcResult<Self> {
        let mut strings: Vec<_> = items
            .iter()
            .map(|item| (wide(&item.access_path), wide(&item.item_id)))
            .collect();
        let defs = items
            .iter()
            .zip(strings.iter_mut())
            .map(|(item, (access_path, item_id))| -> OpcResult<_> {
                Ok(opc_da_bindings::tagOPCITEMDEF {
                    szAccessPath: PWSTR(access_path.as_mut_ptr()),
                    szItemID: PWSTR(item_id.as_mut_ptr()),
                    bActive: item.active.into(),
                    hClient: item.client_handle.0,
                    dwBlobSize: u32::try_from(item.blob.len())?,
                    pBlob: if item.blob.is_empty() {
                        std::ptr::null_mut()
                    } else {
                        item.blob.as_ptr().cast_mut()
                    },
                    vtRequestedDataType: item.requested_type.0,
                    wReserved: 0,
                })
            })
            .collect::<OpcResult<Vec<_>>>()?;
        Ok(Self {
            _strings: strings,
            defs,
        })
    }
}

impl ComItemMgt {
    fn handles_call(
        &self,
        operation: &'static str,
        server_handles: &[ItemHandle],
        call: impl FnOnce(
            &opc_da_bindings::IOPCItemMgt,
            u32,
            *const u32,
            *mut *mut windows::core::HRESULT,
        ) -> windows::core::Result<()>,
    ) -> OpcResult<RemoteArray<Hresult>> {
        let len = server_handles.len().try_into()?;
        let handles = raw_handles(server_handles);
        let mut errors = ComArray::new(len);
        call(&self.0, len, handles.as_ptr(), errors.as_mut_ptr()).map_err(com_error(operation))?;
        Ok(take_errors(errors))
    }
}

impl ItemMgt for ComItemMgt {
    fn add_items(&self, items: &[ItemDef]) -> OpcResult<ItemResults> {
        let len = items.len().try_into()?;
        let native = NativeItemDefs::new(items)?;
        let mut results = ComArray::new(len);
        let mut errors = ComArray::new(len);
        // SAFETY: `native` outlives the call; out arrays start null.
        unsafe {
            self.0.AddItems(
                len,
                native.defs.as_ptr(),
                results.as_mut_ptr(),
                errors.as_mut_ptr(),
            )
        }
        .map_err(com_error("IOPCItemMgt::AddItems"))?;
        Ok((take_item_results(results), take_errors(errors)))
    }

    fn validate_items(&self, items: &[ItemDef], blob_update: bool) -> OpcResult<ItemResults> {
        let len = items.len().try_into()?;
        let native = NativeItemDefs::new(items)?;
        let mut results = ComArray::new(len);
        let mut errors = ComArray::new(len);
        // SAFETY: as in `add_items`.
        unsafe {
            self.0.ValidateItems(
                len,
                native.defs.as_ptr(),
                blob_update,
                results.as_mut_ptr(),
                errors.as_mut_ptr(),
            )
        }
        .map_err(com_error("IOPCItemMgt::ValidateItems"))?;
        Ok((take_item_results(results), take_errors(errors)))
    }

    fn remove_items(&self, server_handles: &[ItemHandle]) -> OpcResult<RemoteArray<Hresult>> {
        self.handles_call(
            "IOPCItemMgt::RemoveItems",
            server_handles,
            |interface, len, handles, errors| {
                // SAFETY: `handles` holds `len` entries for the call.
                unsafe { interface.RemoveItems(len, handles, errors) }
            },
        )
    }

    fn set_active_state(
        &self,
        server_handles: &[ItemHandle],
        active: bool,
    ) -> OpcResult<RemoteArray<Hresult>> {
        self.handles_call(
            "IOPCItemMgt::SetActiveState",
            server_handles,
            |interface, len, handles, errors| {
                // SAFETY: as in `remove_items`.
                unsafe { interface.SetActiveState(len, handles, active, errors) }
            },
        )
    }

    fn set_client_handles(
        &self,
        server_handles: &[ItemHandle],
        client_handles: &[ItemHandle],
    ) -> OpcResult<RemoteArray<Hresult>> {
        let clients = raw_handles(client_handles);
        self.handles_call(
            "IOPCItemMgt::SetClientHandles",
            server_handles,
            |interface, len, handles, errors| {
                // SAFETY: both handle arrays hold `len` entries.
                unsafe { interface.SetClientHandles(len, handles, clients.as_ptr(), errors) }
            },
        )
    }

    fn set_datatypes(
        &self,
        server_handles: &[ItemHandle],
        requested_types: &[VarType],
    ) -> OpcResult<RemoteArray<Hresult>> {
        let types: Vec<u16> = requested_types.iter().map(|vt| vt.0).collect();
        self.handles_call(
            "IOPCItemMgt::SetDatatypes",
            server_handles,
            |interface, len, handles, errors| {
                // SAFETY: both arrays hold `len` entries.
                unsafe { interface.SetDatatypes(len, handles, types.as_ptr(), errors) }
            },
        )
    }
}

struct ComGroupStateMgt {
    interface: opc_da_bindings::IOPCGroupStateMgt,
    handles: Arc<GroupHandles>,
}

// SAFETY: MTA interface, see `ComItemMgt`.
unsafe impl Send for ComGroupStateMgt {}
// SAFETY: as above.
unsafe impl Sync for ComGroupStateMgt {}

impl GroupStateMgt for ComGroupStateMgt {
    fn get_state(&self) -> OpcResult<GroupProperties> {
        let mut props = GroupProperties::default();
        let mut active = BOOL::default();
        let mut name = PWSTR::null();
        let mut client = 0;
        let mut server = 0;
        // SAFETY: every out pointer references a local; `name` is freed below.
        unsafe {
            self.interface.GetState(
                &mut props.update_rate,
                &mut active,
                &mut name,
                &mut props.time_bias,
                &mut props.percent_deadband,
                &mut props.locale_id,
                &mut client,
                &mut server,
            )
        }
        .map_err(com_error("IOPCGroupStateMgt::GetState"))?;

        // SAFETY: a non-null name is a server-allocated, terminated string.
        let decoded = unsafe { if name.is_null() { Ok(String::new()) } else { name.to_string() } };
        if !name.is_null() {
            // SAFETY: the caller frees the returned name exactly once.
            unsafe { CoTaskMemFree(Some(name.0.cast_const().cast())) };
        }
        props.name = decoded.map_err(|err| {
            OpcError::Conversion(format!("Group name is not valid UTF-16: {err}"))
        })?;
        props.active = active.as_bool();
        props.client_handle = GroupHandle(client);
        props.server_handle = GroupHandle(server);
        Ok(props)
    }

    fn set_state(&self, change: &GroupStateChange) -> OpcResult<u32> {
        fn ptr<T>(value: Option<&T>) -> *const T {
            value.map_or(std::ptr::null(), std::ptr::from_ref)
        }
        let active = change.active.map(BOOL::from);
        let client = change.client_handle.map(|handle| handle.0);
        let mut revised = 0;
        // SAFETY: absent fields are passed as null; present ones reference
        // locals that outlive the call.
        unsafe {
            self.interface.SetState(
                ptr(change.update_rate.as_ref()),
                &mut revised,
                ptr(active.as_ref()),
                ptr(change.time_bias.as_ref()),
                ptr(change.percent_deadband.as_ref()),
                ptr(change.locale_id.as_ref()),
                ptr(client.as_ref()),
            )
        }
        .map_err(com_error("IOPCGroupStateMgt::SetState"))?;
        if let Some(client) = client {
            self.handles.client.store(client, Ordering::Release);
        }
        Ok(revised)
    }

    fn set_name(&self, name: &str) -> OpcResult<()> {
        let mut name = wide(name);
        // SAFETY: `name` is terminated and outlives the call; the server
        // only reads it.
        unsafe { self.interface.SetName(PWSTR(name.as_mut_ptr())) }
            .map_err(com_error("IOPCGroupStateMgt::SetName"))
    }
}

struct ComSyncIo(opc_da_bindings::IOPCSyncIO);

// SAFETY: MTA interface, see `ComItemMgt`.
unsafe impl Send for ComSyncIo {}
// SAFETY: as above.
unsafe impl Sync for ComSyncIo {}

impl SyncIo for ComSyncIo {
    fn read(
        &self,
        source: DataSource,
        server_handles: &[ItemHandle],
    ) -> OpcResult<(RemoteArray<NativeItemState>, RemoteArray<Hresult>)> {
        let len = server_handles.len().try_into()?;
        let handles = raw_handles(server_handles);
        let mut states = ComArray::new(len);
        let mut errors = ComArray::new(len);
        // SAFETY: `handles` holds `len` entries; out arrays start null.
        unsafe {
            self.0.Read(
                to_data_source(source),
                len,
                handles.as_ptr(),
                states.as_mut_ptr(),
                errors.as_mut_ptr(),
            )
        }
        .map_err(com_error("IOPCSyncIO::Read"))?;
        Ok((take_item_states(states), take_errors(errors)))
    }

    fn write(
        &self,
        server_handles: &[ItemHandle],
        values: &[Variant],
    ) -> OpcResult<RemoteArray<Hresult>> {
        let len = server_handles.len().try_into()?;
        let handles = raw_handles(server_handles);
        let values = encode_all(values)?;
        let mut errors = ComArray::new(len);
        // SAFETY: `OwnedVariant` is a transparent `VARIANT`; both arrays hold
        // `len` entries and outlive the call.
        unsafe {
            self.0.Write(
                len,
                handles.as_ptr(),
                values.as_ptr().cast::<VARIANT>(),
                errors.as_mut_ptr(),
            )
        }
        .map_err(com_error("IOPCSyncIO::Write"))?;
        Ok(take_errors(errors))
    }
}

struct ComAsyncIo2(opc_da_bindings::IOPCAsyncIO2);

// SAFETY: MTA interface, see `ComItemMgt`.
unsafe impl Send for ComAsyncIo2 {}
// SAFETY: as above.
unsafe impl Sync for ComAsyncIo2 {}

impl AsyncIo2 for ComAsyncIo2 {
    fn read(
        &self,
        server_handles: &[ItemHandle],
        transaction_id: u32,
    ) -> OpcResult<(u32, RemoteArray<Hresult>)> {
        let len = server_handles.len().try_into()?;
        let handles = raw_handles(server_handles);
        let mut cancel_id = 0;
        let mut errors = ComArray::new(len);
        // SAFETY: `handles` holds `len` entries; out pointers reference locals.
        unsafe {
            self.0.Read(
                len,
                handles.as_ptr(),
                transaction_id,
                &mut cancel_id,
                errors.as_mut_ptr(),
            )
        }
        .map_err(com_error("IOPCAsyncIO2::Read"))?;
        Ok((cancel_id, take_errors(errors)))
    }

    fn write(
        &self,
        server_handles: &[ItemHandle],
        values: &[Variant],
        transaction_id: u32,
    ) -> OpcResult<(u32, RemoteArray<Hresult>)> {
        let len = server_handles.len().try_into()?;
        let handles = raw_handles(server_handles);
        let values = encode_all(values)?;
        let mut cancel_id = 0;
        let mut errors = ComArray::new(len);
        // SAFETY: as in `SyncIo::write`.
        unsafe {
            self.0.Write(
                len,
                handles.as_ptr(),
                values.as_ptr().cast::<VARIANT>(),
                transaction_id,
                &mut cancel_id,
                errors.as_mut_ptr(),
            )
        }
        .map_err(com_error("IOPCAsyncIO2::Write"))?;
        Ok((cancel_id, take_errors(errors)))
    }

    fn refresh2(&self, source: DataSource, transaction_id: u32) -> OpcResult<u32> {
        // SAFETY: plain values only.
        unsafe { self.0.Refresh2(to_data_source(source), transaction_id) }
            .map_err(com_error("IOPCAsyncIO2::Refresh2"))
    }

    fn cancel2(&self, cancel_id: u32) -> OpcResult<()> {
        // SAFETY: plain values only.
        unsafe { self.0.Cancel2(cancel_id) }.map_err(com_error("IOPCAsyncIO2::Cancel2"))
    }

    fn set_enable(&self, enable: bool) -> OpcResult<()> {
        // SAFETY: plain values only.
        unsafe { self.0.SetEnable(enable) }.map_err(com_error("IOPCAsyncIO2::SetEnable"))
    }

    fn get_enable(&self) -> OpcResult<bool> {
        // SAFETY: plain values only.
        unsafe { self.0.GetEnable() }
            .map(|enabled| enabled.as_bool())
            .map_err(com_error("IOPCAsyncIO2::GetEnable"))
    }
}

struct ComConnectionPointContainer {
    interface: IConnectionPointContainer,
    handles: Arc<GroupHandles>,
}

// SAFETY: MTA interface, see `ComItemMgt`.
unsafe impl Send for ComConnectionPointContainer {}
// SAFETY: as above.
unsafe impl Sync for ComConnectionPointContainer {}

impl ConnectionPointContainer for ComConnectionPointContainer {
    fn find_connection_point(&self, iid: &Guid) -> OpcResult<Option<Box<dyn ConnectionPoint>>> {
        // SAFETY: `iid` is a local GUID valid for the call.
        match unsafe { self.interface.FindConnectionPoint(&to_guid(iid)) } {
            Ok(point) => Ok(Some(Box::new(ComConnectionPoint {
                interface: point,
                handles: Arc::clone(&self.handles),
            }))),
            Err(err) if to_hresult(err.code()) == Hresult::CONNECT_E_NOCONNECTION => Ok(None),
            Err(err) => Err(com_error("IConnectionPointContainer::FindConnectionPoint")(
                err,
            )),
        }
    }
}

struct ComConnectionPoint {
    interface: IConnectionPoint,
    handles: Arc<GroupHandles>,
}

// SAFETY: MTA interface, see `ComItemMgt`.
unsafe impl Send for ComConnectionPoint {}
// SAFETY: as above.
unsafe impl Sync for ComConnectionPoint {}

impl ConnectionPoint for ComConnectionPoint {
    fn advise(&self, sink: Arc<dyn DataCallback>) -> OpcResult<u32> {
        let unknown = DataCallbackSink::new(sink, Arc::clone(&self.handles))
            .into_object()
            .into_interface::<opc_da_bindings::IOPCDataCallback>()
            .cast::<IUnknown>()
            .map_err(com_error("QueryInterface(IUnknown)"))?;
        // SAFETY: the server takes its own reference on `unknown`.
        unsafe { self.interface.Advise(&unknown) }.map_err(com_error("IConnectionPoint::Advise"))
    }

    fn unadvise(&self, cookie: u32) -> OpcResult<()> {
        // SAFETY: plain value only.
        unsafe { self.interface.Unadvise(cookie) }
            .map_err(com_error("IConnectionPoint::Unadvise"))
    }
}
