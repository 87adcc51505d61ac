//! Native group interfaces.
//!
//! One trait per interface the server exposes on a group object. A backend
//! implements them over its transport (see the `com` module on Windows);
//! the in-memory fake implements them for tests. [`GroupInterfaces::query`]
//! is the single capability query made when a group is constructed.

use crate::codec::ValueBuffers;
use crate::errors::OpcResult;
use crate::memory::RemoteArray;
use crate::typedefs::{
    DataSource, GroupHandle, GroupProperties, GroupStateChange, Guid, Hresult, ItemDef, ItemHandle,
    NativeItemResult, NativeItemState, VarType,
};
use crate::variant::Variant;
use std::sync::Arc;

#[cfg(all(windows, feature = "com-backend"))]
pub mod com;

/// `IID_IOPCDataCallback`, the connection point notifications arrive on.
pub const IID_IOPC_DATA_CALLBACK: Guid = Guid::from_u128(0x39c1_3a70_011e_11d0_9675_0020_afd8_adb3);

/// Per-item results of an add or validate call.
pub type ItemResults = (RemoteArray<NativeItemResult>, RemoteArray<Hresult>);

/// `IOPCItemMgt`.
pub trait ItemMgt: Send + Sync {
    fn add_items(&self, items: &[ItemDef]) -> OpcResult<ItemResults>;

    fn validate_items(&self, items: &[ItemDef], blob_update: bool) -> OpcResult<ItemResults>;

    fn remove_items(&self, server_handles: &[ItemHandle]) -> OpcResult<RemoteArray<Hresult>>;

    fn set_active_state(
        &self,
        server_handles: &[ItemHandle],
        active: bool,
    ) -> OpcResult<RemoteArray<Hresult>>;

    fn set_client_handles(
        &self,
        server_handles: &[ItemHandle],
        client_handles: &[ItemHandle],
    ) -> OpcResult<RemoteArray<Hresult>>;

    fn set_datatypes(
        &self,
        server_handles: &[ItemHandle],
        requested_types: &[VarType],
    ) -> OpcResult<RemoteArray<Hresult>>;
}

/// `IOPCGroupStateMgt`.
pub trait GroupStateMgt: Send + Sync {
    fn get_state(&self) -> OpcResult<GroupProperties>;

    /// Applies the present fields and returns the revised update rate.
    fn set_state(&self, change: &GroupStateChange) -> OpcResult<u32>;

    fn set_name(&self, name: &str) -> OpcResult<()>;
}

/// `IOPCSyncIO`.
pub trait SyncIo: Send + Sync {
    fn read(
        &self,
        source: DataSource,
        server_handles: &[ItemHandle],
    ) -> OpcResult<(RemoteArray<NativeItemState>, RemoteArray<Hresult>)>;

    fn write(
        &self,
        server_handles: &[ItemHandle],
        values: &[Variant],
    ) -> OpcResult<RemoteArray<Hresult>>;
}

/// `IOPCAsyncIO2`.
///
/// Read and write return the cancel id and the per-item acceptance codes;
/// the data arrives later through [`DataCallback`].
pub trait AsyncIo2: Send + Sync {
    fn read(
        &self,
        server_handles: &[ItemHandle],
        transaction_id: u32,
    ) -> OpcResult<(u32, RemoteArray<Hresult>)>;

    fn write(
        &self,
        server_handles: &[ItemHandle],
        values: &[Variant],
        transaction_id: u32,
    ) -> OpcResult<(u32, RemoteArray<Hresult>)>;

    fn refresh2(&self, source: DataSource, transaction_id: u32) -> OpcResult<u32>;

    fn cancel2(&self, cancel_id: u32) -> OpcResult<()>;

    fn set_enable(&self, enable: bool) -> OpcResult<()>;

    fn get_enable(&self) -> OpcResult<bool>;
}

/// `IConnectionPointContainer`.
pub trait ConnectionPointContainer: Send + Sync {
    /// `Ok(None)` when the object has no connection point for `iid`.
    fn find_connection_point(&self, iid: &Guid) -> OpcResult<Option<Box<dyn ConnectionPoint>>>;
}

/// `IConnectionPoint`.
pub trait ConnectionPoint: Send + Sync {
    /// Registers `sink` and returns the cookie that unregisters it.
    fn advise(&self, sink: Arc<dyn DataCallback>) -> OpcResult<u32>;

    fn unadvise(&self, cookie: u32) -> OpcResult<()>;
}

/// Data-change and read-complete payload, borrowed from the server.
#[derive(Debug, Clone, Copy)]
pub struct ValueNotification<'a> {
    pub transaction_id: u32,
    pub group_handle: GroupHandle,
    pub master_quality: Hresult,
    pub master_error: Hresult,
    pub count: u32,
    pub buffers: ValueBuffers<'a>,
}

/// Write-complete payload, borrowed from the server.
#[derive(Debug, Clone, Copy)]
pub struct WriteNotification<'a> {
    pub transaction_id: u32,
    pub group_handle: GroupHandle,
    pub master_error: Hresult,
    pub count: u32,
    pub client_handles: &'a [ItemHandle],
    pub errors: &'a [Hresult],
}

/// `IOPCDataCallback`: the sink the server calls, on a thread of its choosing.
pub trait DataCallback: Send + Sync {
    fn on_data_change(&self, notification: &ValueNotification<'_>) -> OpcResult<()>;

    fn on_read_complete(&self, notification: &ValueNotification<'_>) -> OpcResult<()>;

    fn on_write_complete(&self, notification: &WriteNotification<'_>) -> OpcResult<()>;

    fn on_cancel_complete(&self, transaction_id: u32, group_handle: GroupHandle)
    -> OpcResult<()>;
}

/// A native group object before its interfaces are queried.
///
/// Required interfaces fail the query; optional ones report absence.
pub trait NativeGroupObject {
    fn item_mgt(&self) -> OpcResult<Box<dyn ItemMgt>>;

    fn group_state_mgt(&self) -> OpcResult<Box<dyn GroupStateMgt>>;

    fn sync_io(&self) -> OpcResult<Box<dyn SyncIo>>;

    fn async_io2(&self) -> Option<Box<dyn AsyncIo2>>;

    fn connection_point_container(&self) -> Option<Box<dyn ConnectionPointContainer>>;
}

/// The interfaces a live group holds.
pub struct GroupInterfaces {
    pub item_mgt: Box<dyn ItemMgt>,
    pub group_state_mgt: Box<dyn GroupStateMgt>,
    pub sync_io: Box<dyn SyncIo>,
    pub async_io2: Option<Box<dyn AsyncIo2>>,
    pub connection_point_container: Option<Box<dyn ConnectionPointContainer>>,
}

impl GroupInterfaces {
    /// Queries every interface once.
    pub fn query(object: &dyn NativeGroupObject) -> OpcResult<Self> {
        Ok(Self {
            item_mgt: object.item_mgt()?,
            group_state_mgt: object.group_state_mgt()?,
            sync_io: object.sync_io()?,
            async_io2: object.async_io2(),
            connection_point_container: object.connection_point_container(),
        })
    }

    /// Asynchronous I/O needs both the async interface and a notification source.
    pub const fn is_async_supported(&self) -> bool {
        self.async_io2.is_some() && self.connection_point_container.is_some()
    }
}

impl std::fmt::Debug for GroupInterfaces {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupInterfaces")
            .field("async_io2", &self.async_io2.is_some())
            .field(
                "connection_point_container",
                &self.connection_point_container.is_some(),
            )
            .finish_non_exhaustive()
    }
}
