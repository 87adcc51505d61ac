//! An in-memory native group object for tests.
//!
//! [`FakeGroupObject`] behaves like a small OPC DA server group: it keeps a
//! tag table, assigns item handles, queues asynchronous transactions until
//! [`FakeServer::complete_transactions`] runs them, and delivers
//! notifications to advised sinks. [`FakeServer`] is the test's view of the
//! same state: call counters, outstanding buffers, live interfaces, failure
//! injection and notification injection. It is `Clone + Send + Sync`, so
//! notifications can be pushed from other threads.

use crate::codec::{ValueBuffers, decode_variant, encode_value};
use crate::errors::{OpcError, OpcResult};
use crate::memory::RemoteArray;
use crate::native::{
    AsyncIo2, ConnectionPoint, ConnectionPointContainer, DataCallback, GroupStateMgt,
    IID_IOPC_DATA_CALLBACK, ItemMgt, ItemResults, NativeGroupObject, SyncIo, ValueNotification,
    WriteNotification,
};
use crate::typedefs::{
    AccessRights, DataSource, FileTime, GroupHandle, GroupProperties, GroupStateChange, Guid,
    Hresult, ItemDef, ItemHandle, NativeItemResult, NativeItemState, Quality, VarType,
};
use crate::variant::{Value, Variant};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// 2024-01-01T00:00:00Z.
pub const FAKE_TIMESTAMP: FileTime = FileTime::from_ticks(133_485_408_000_000_000);

#[derive(Debug, Clone)]
struct Tag {
    value: Value,
    rights: AccessRights,
}

#[derive(Debug, Clone)]
struct Item {
    item_id: String,
    client_handle: ItemHandle,
    active: bool,
    requested_type: VarType,
}

#[derive(Debug)]
enum Pending {
    Read {
        transaction_id: u32,
        cancel_id: u32,
        handles: Vec<ItemHandle>,
    },
    Write {
        transaction_id: u32,
        cancel_id: u32,
        writes: Vec<(ItemHandle, Value)>,
    },
    Refresh {
        transaction_id: u32,
        cancel_id: u32,
        source: DataSource,
    },
}

impl Pending {
    const fn cancel_id(&self) -> u32 {
        match self {
            Self::Read { cancel_id, .. }
            | Self::Write { cancel_id, .. }
            | Self::Refresh { cancel_id, .. } => *cancel_id,
        }
    }

    const fn transaction_id(&self) -> u32 {
        match self {
            Self::Read { transaction_id, .. }
            | Self::Write { transaction_id, .. }
            | Self::Refresh { transaction_id, .. } => *transaction_id,
        }
    }
}

struct Inner {
    tags: BTreeMap<String, Tag>,
    items: BTreeMap<ItemHandle, Item>,
    next_item_handle: u32,
    state: GroupProperties,
    rate_granularity: u32,
    enabled: bool,
    sinks: BTreeMap<u32, Arc<dyn DataCallback>>,
    next_cookie: u32,
    pending: Vec<Pending>,
    cancelled: Vec<u32>,
    next_cancel_id: u32,
    fail_next: Option<(&'static str, Hresult)>,
    truncate_next: bool,
    buffer_padding: usize,
    calls: Vec<&'static str>,
}

struct Shared {
    inner: Mutex<Inner>,
    native_calls: AtomicUsize,
    outstanding_buffers: Arc<AtomicUsize>,
    live_interfaces: AtomicUsize,
    rejected_deliveries: AtomicUsize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Counts the call and applies an injected failure.
    fn enter(&self, operation: &'static str) -> OpcResult<MutexGuard<'_, Inner>> {
        self.native_calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.lock();
        inner.calls.push(operation);
        match inner.fail_next {
            Some((failing, code)) if failing == operation => {
                inner.fail_next = None;
                Err(OpcError::native(operation, code))
            }
            _ => Ok(inner),
        }
    }

    /// Hands out a tracked buffer declaring `items.len()` entries.
    fn buffer<T: Default>(&self, inner: &mut Inner, mut items: Vec<T>) -> RemoteArray<T> {
        let declared = u32::try_from(items.len()).unwrap_or(u32::MAX);
        if inner.truncate_next {
            inner.truncate_next = false;
            items.pop();
        }
        items.extend((0..inner.buffer_padding).map(|_| T::default()));

        self.outstanding_buffers.fetch_add(1, Ordering::SeqCst);
        let outstanding = Arc::clone(&self.outstanding_buffers);
        RemoteArray::with_release(items, declared, move || {
            outstanding.fetch_sub(1, Ordering::SeqCst);
        })
    }

    fn sinks(&self) -> Vec<Arc<dyn DataCallback>> {
        self.lock().sinks.values().map(Arc::clone).collect()
    }

    /// Logs and counts a notification the sink refused.
    fn delivered(&self, kind: &'static str, transaction_id: u32, result: OpcResult<()>) {
        if let Err(err) = result {
            self.rejected_deliveries.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(kind, transaction_id, error = %err, "Fake notification rejected by sink");
        }
    }
}

/// The fake's native group object. Hand it to `Group::new`.
pub struct FakeGroupObject {
    shared: Arc<Shared>,
    sync_io: bool,
    async_io: bool,
    connection_points: bool,
    data_callback_point: bool,
}

impl FakeGroupObject {
    /// A group with every interface, an empty tag table and the given handles.
    pub fn new(client_handle: GroupHandle, server_handle: GroupHandle) -> Self {
        let state = GroupProperties {
            update_rate: 1000,
            active: true,
            name: "FakeGroup".to_owned(),
            client_handle,
            server_handle,
            ..GroupProperties::default()
        };
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    tags: BTreeMap::new(),
                    items: BTreeMap::new(),
                    next_item_handle: 1,
                    state,
                    rate_granularity: 0,
                    enabled: true,
                    sinks: BTreeMap::new(),
                    next_cookie: 1,
                    pending: Vec::new(),
                    cancelled: Vec::new(),
                    next_cancel_id: 1,
                    fail_next: None,
                    truncate_next: false,
                    buffer_padding: 0,
                    calls: Vec::new(),
                }),
                native_calls: AtomicUsize::new(0),
                outstanding_buffers: Arc::new(AtomicUsize::new(0)),
                live_interfaces: AtomicUsize::new(0),
                rejected_deliveries: AtomicUsize::new(0),
            }),
            sync_io: true,
            async_io: true,
            connection_points: true,
            data_callback_point: true,
        }
    }

    /// Adds a readable and writeable tag.
    #[must_use]
    pub fn with_tag(self, item_id: &str, value: impl Into<Value>) -> Self {
        self.with_tag_rights(item_id, value, AccessRights::READ_WRITE)
    }

    #[must_use]
    pub fn with_tag_rights(
        self,
        item_id: &str,
        value: impl Into<Value>,
        rights: AccessRights,
    ) -> Self {
        self.shared.lock().tags.insert(
            item_id.to_owned(),
            Tag {
                value: value.into(),
                rights,
            },
        );
        self
    }

    #[must_use]
    pub fn without_sync_io(mut self) -> Self {
        self.sync_io = false;
        self
    }

    #[must_use]
    pub fn without_async_io(mut self) -> Self {
        self.async_io = false;
        self
    }

    #[must_use]
    pub fn without_connection_points(mut self) -> Self {
        self.connection_points = false;
        self
    }

    /// Keeps the container but drops the `IOPCDataCallback` point.
    #[must_use]
    pub fn without_data_callback_point(mut self) -> Self {
        self.data_callback_point = false;
        self
    }

    /// Revised update rates are rounded up to a multiple of `granularity`.
    #[must_use]
    pub fn with_rate_granularity(self, granularity: u32) -> Self {
        self.shared.lock().rate_granularity = granularity;
        self
    }

    /// Every buffer carries `extra` default entries past its declared count.
    #[must_use]
    pub fn with_buffer_padding(self, extra: usize) -> Self {
        self.shared.lock().buffer_padding = extra;
        self
    }

    pub fn server(&self) -> FakeServer {
        FakeServer {
            shared: Arc::clone(&self.shared),
        }
    }

    fn interface(&self) -> FakeInterface {
        FakeInterface::new(&self.shared, self.data_callback_point)
    }
}

impl NativeGroupObject for FakeGroupObject {
    fn item_mgt(&self) -> OpcResult<Box<dyn ItemMgt>> {
        Ok(Box::new(self.interface()))
    }

    fn group_state_mgt(&self) -> OpcResult<Box<dyn GroupStateMgt>> {
        Ok(Box::new(self.interface()))
    }

    fn sync_io(&self) -> OpcResult<Box<dyn SyncIo>> {
        if self.sync_io {
            Ok(Box::new(self.interface()))
        } else {
            Err(OpcError::native(
                "QueryInterface(IOPCSyncIO)",
                Hresult::E_NOINTERFACE,
            ))
        }
    }

    fn async_io2(&self) -> Option<Box<dyn AsyncIo2>> {
        self.async_io
            .then(|| Box::new(self.interface()) as Box<dyn AsyncIo2>)
    }

    fn connection_point_container(&self) -> Option<Box<dyn ConnectionPointContainer>> {
        self.connection_points
            .then(|| Box::new(self.interface()) as Box<dyn ConnectionPointContainer>)
    }
}

/// Test-side handle onto a [`FakeGroupObject`]'s state.
#[derive(Clone)]
pub struct FakeServer {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for FakeServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeServer")
            .field("native_calls", &self.native_calls())
            .field("outstanding_buffers", &self.outstanding_buffers())
            .field("live_interfaces", &self.live_interfaces())
            .finish_non_exhaustive()
    }
}

impl FakeServer {
    /// Number of native interface calls made so far.
    pub fn native_calls(&self) -> usize {
        self.shared.native_calls.load(Ordering::SeqCst)
    }

    /// Names of the native calls made so far, in order.
    pub fn calls(&self) -> Vec<&'static str> {
        self.shared.lock().calls.clone()
    }

    /// Buffers handed out and not yet released.
    pub fn outstanding_buffers(&self) -> usize {
        self.shared.outstanding_buffers.load(Ordering::SeqCst)
    }

    /// Interface objects handed out and not yet dropped.
    pub fn live_interfaces(&self) -> usize {
        self.shared.live_interfaces.load(Ordering::SeqCst)
    }

    /// Notifications a sink answered with an error.
    pub fn rejected_deliveries(&self) -> usize {
        self.shared.rejected_deliveries.load(Ordering::SeqCst)
    }

    pub fn advised_sinks(&self) -> usize {
        self.shared.lock().sinks.len()
    }

    pub fn group_state(&self) -> GroupProperties {
        self.shared.lock().state.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.lock().enabled
    }

    pub fn pending_transactions(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// The current value of a tag.
    pub fn value(&self, item_id: &str) -> Option<Value> {
        self.shared
            .lock()
            .tags
            .get(item_id)
            .map(|tag| tag.value.clone())
    }

    /// The data type most recently requested for an item.
    pub fn requested_type(&self, server_handle: ItemHandle) -> Option<VarType> {
        self.shared
            .lock()
            .items
            .get(&server_handle)
            .map(|item| item.requested_type)
    }

    /// Whether the item is currently registered with the fake.
    pub fn has_item(&self, server_handle: ItemHandle) -> bool {
        self.shared.lock().items.contains_key(&server_handle)
    }

    pub fn set_value(&self, item_id: &str, value: impl Into<Value>) {
        if let Some(tag) = self.shared.lock().tags.get_mut(item_id) {
            tag.value = value.into();
        }
    }

    /// The next call named `operation` fails with `code`.
    pub fn fail_next_call(&self, operation: &'static str, code: Hresult) {
        self.shared.lock().fail_next = Some((operation, code));
    }

    /// The next buffer handed out is one entry short of its declared count.
    pub fn truncate_next_buffer(&self) {
        self.shared.lock().truncate_next = true;
    }

    /// Pushes a data change for the given items to every advised sink.
    ///
    /// Returns the number of sinks reached.
    pub fn deliver_data_change(&self, server_handles: &[ItemHandle]) -> usize {
        let group_handle = self.shared.lock().state.server_handle;
        self.deliver_data_change_as(group_handle, server_handles)
    }

    /// Like [`deliver_data_change`](Self::deliver_data_change) but stamped
    /// with an arbitrary group handle.
    pub fn deliver_data_change_as(
        &self,
        group_handle: GroupHandle,
        server_handles: &[ItemHandle],
    ) -> usize {
        let payload = self.payload(server_handles, DataSource::Cache);
        let sinks = self.shared.sinks();
        for sink in &sinks {
            self.shared.delivered(
                "data_change",
                0,
                sink.on_data_change(&payload.notification(0, group_handle)),
            );
        }
        sinks.len()
    }

    /// Runs every queued transaction and delivers its completion.
    ///
    /// Cancelled transactions are reported with a cancel-complete instead.
    pub fn complete_transactions(&self) -> usize {
        let (pending, cancelled, group_handle) = {
            let mut inner = self.shared.lock();
            (
                std::mem::take(&mut inner.pending),
                std::mem::take(&mut inner.cancelled),
                inner.state.server_handle,
            )
        };
        let sinks = self.shared.sinks();
        let completed = pending.len() + cancelled.len();

        for transaction in pending {
            let transaction_id = transaction.transaction_id();
            match transaction {
                Pending::Read { handles, .. } => {
                    let payload = self.payload(&handles, DataSource::Device);
                    for sink in &sinks {
                        self.shared.delivered(
                            "read_complete",
                            transaction_id,
                            sink.on_read_complete(&payload.notification(transaction_id, group_handle)),
                        );
                    }
                }
                Pending::Refresh { source, .. } => {
                    let handles: Vec<ItemHandle> = {
                        let inner = self.shared.lock();
                        inner
                            .items
                            .iter()
                            .filter(|(_, item)| item.active)
                            .map(|(handle, _)| *handle)
                            .collect()
                    };
                    let payload = self.payload(&handles, source);
                    for sink in &sinks {
                        self.shared.delivered(
                            "read_complete",
                            transaction_id,
                            sink.on_read_complete(&payload.notification(transaction_id, group_handle)),
                        );
                    }
                }
                Pending::Write { writes, .. } => {
                    let (client_handles, errors): (Vec<_>, Vec<_>) = {
                        let mut inner = self.shared.lock();
                        writes
                            .into_iter()
                            .map(|(handle, value)| apply_write(&mut inner, handle, value))
                            .unzip()
                    };
                    let count = u32::try_from(client_handles.len()).unwrap_or(u32::MAX);
                    let notification = WriteNotification {
                        transaction_id,
                        group_handle,
                        master_error: master_error(&errors),
                        count,
                        client_handles: &client_handles,
                        errors: &errors,
                    };
                    for sink in &sinks {
                        self.shared.delivered(
                            "write_complete",
                            transaction_id,
                            sink.on_write_complete(&notification),
                        );
                    }
                }
            }
        }
        for transaction_id in cancelled {
            for sink in &sinks {
                self.shared.delivered(
                    "cancel_complete",
                    transaction_id,
                    sink.on_cancel_complete(transaction_id, group_handle),
                );
            }
        }
        completed
    }

    fn payload(&self, server_handles: &[ItemHandle], source: DataSource) -> Payload {
        let inner = self.shared.lock();
        let mut payload = Payload::default();
        for handle in server_handles {
            let (client_handle, state, error) = read_item(&inner, *handle, source);
            payload.client_handles.push(client_handle);
            payload.values.push(state.value);
            payload.qualities.push(state.quality);
            payload.timestamps.push(state.timestamp);
            payload.errors.push(error);
        }
        payload
    }
}

#[derive(Default)]
struct Payload {
    client_handles: Vec<ItemHandle>,
    values: Vec<Variant>,
    qualities: Vec<u16>,
    timestamps: Vec<FileTime>,
    errors: Vec<Hresult>,
}

impl Payload {
    fn notification(&self, transaction_id: u32, group_handle: GroupHandle) -> ValueNotification<'_> {
        ValueNotification {
            transaction_id,
            group_handle,
            master_quality: if self.qualities.iter().all(|q| Quality(*q).is_good()) {
                Hresult::S_OK
            } else {
                Hresult::S_FALSE
            },
            master_error: master_error(&self.errors),
            count: u32::try_from(self.client_handles.len()).unwrap_or(u32::MAX),
            buffers: ValueBuffers {
                client_handles: &self.client_handles,
                values: &self.values,
                qualities: &self.qualities,
                timestamps: &self.timestamps,
                errors: &self.errors,
            },
        }
    }
}

fn master_error(errors: &[Hresult]) -> Hresult {
    if errors.iter().all(|code| code.is_ok()) {
        Hresult::S_OK
    } else {
        Hresult::S_FALSE
    }
}

fn read_item(
    inner: &Inner,
    handle: ItemHandle,
    source: DataSource,
) -> (ItemHandle, NativeItemState, Hresult) {
    let Some(item) = inner.items.get(&handle) else {
        return (
            ItemHandle::default(),
            NativeItemState::default(),
            Hresult::OPC_E_INVALIDHANDLE,
        );
    };
    let Some(tag) = inner.tags.get(&item.item_id) else {
        return (
            item.client_handle,
            NativeItemState::default(),
            Hresult::OPC_E_UNKNOWNITEMID,
        );
    };
    let Ok(value) = encode_value(&tag.value) else {
        return (
            item.client_handle,
            NativeItemState::default(),
            Hresult::DISP_E_TYPEMISMATCH,
        );
    };
    let quality = if source == DataSource::Cache && !item.active {
        Quality::BAD_OUT_OF_SERVICE
    } else {
        Quality::GOOD
    };
    (
        item.client_handle,
        NativeItemState {
            client_handle: item.client_handle,
            timestamp: FAKE_TIMESTAMP,
            quality: quality.0,
            value,
        },
        Hresult::S_OK,
    )
}

fn check_write(inner: &Inner, handle: ItemHandle) -> Hresult {
    match inner.items.get(&handle) {
        None => Hresult::OPC_E_INVALIDHANDLE,
        Some(item) => match inner.tags.get(&item.item_id) {
            Some(tag) if tag.rights.is_writeable() => Hresult::S_OK,
            Some(_) => Hresult::OPC_E_BADRIGHTS,
            None => Hresult::OPC_E_UNKNOWNITEMID,
        },
    }
}

fn apply_write(inner: &mut Inner, handle: ItemHandle, value: Value) -> (ItemHandle, Hresult) {
    let code = check_write(inner, handle);
    let Some(item) = inner.items.get(&handle).cloned() else {
        return (ItemHandle::default(), code);
    };
    if code.is_ok() {
        if let Some(tag) = inner.tags.get_mut(&item.item_id) {
            tag.value = value;
        }
    }
    (item.client_handle, code)
}

/// One interface pointer handed out by the fake. Dropping it releases it.
struct FakeInterface {
    shared: Arc<Shared>,
    data_callback_point: bool,
}

impl FakeInterface {
    fn new(shared: &Arc<Shared>, data_callback_point: bool) -> Self {
        shared.live_interfaces.fetch_add(1, Ordering::SeqCst);
        Self {
            shared: Arc::clone(shared),
            data_callback_point,
        }
    }

    fn resolve(&self, inner: &Inner, item: &ItemDef) -> (NativeItemResult, Hresult) {
        if item.item_id.is_empty() {
            return (NativeItemResult::default(), Hresult::OPC_E_INVALIDITEMID);
        }
        let Some(tag) = inner.tags.get(&item.item_id) else {
            return (NativeItemResult::default(), Hresult::OPC_E_UNKNOWNITEMID);
        };
        (
            NativeItemResult {
                server_handle: ItemHandle(inner.next_item_handle),
                canonical_type: tag.value.var_type(),
                access_rights: tag.rights.0,
                blob: item.blob.clone(),
            },
            Hresult::S_OK,
        )
    }

    fn per_handle(
        &self,
        operation: &'static str,
        server_handles: &[ItemHandle],
        mut apply: impl FnMut(&mut Inner, usize, ItemHandle) -> Hresult,
    ) -> OpcResult<RemoteArray<Hresult>> {
        let mut inner = self.shared.enter(operation)?;
        let errors = server_handles
            .iter()
            .enumerate()
            .map(|(index, handle)| {
                if inner.items.contains_key(handle) {
                    apply(&mut *inner, index, *handle)
                } else {
                    Hresult::OPC_E_INVALIDHANDLE
                }
            })
            .collect();
        Ok(self.shared.buffer(&mut inner, errors))
    }

    fn next_cancel_id(inner: &mut Inner) -> u32 {
        let cancel_id = inner.next_cancel_id;
        inner.next_cancel_id += 1;
        cancel_id
    }
}

impl Drop for FakeInterface {
    fn drop(&mut self) {
        self.shared.live_interfaces.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ItemMgt for FakeInterface {
    fn add_items(&self, items: &[ItemDef]) -> OpcResult<ItemResults> {
        let mut inner = self.shared.enter("IOPCItemMgt::AddItems")?;
        let mut results = Vec::with_capacity(items.len());
        let mut errors = Vec::with_capacity(items.len());
        for item in items {
            let (result, error) = self.resolve(&inner, item);
            if error.is_ok() {
                inner.items.insert(
                    result.server_handle,
                    Item {
                        item_id: item.item_id.clone(),
                        client_handle: item.client_handle,
                        active: item.active,
                        requested_type: item.requested_type,
                    },
                );
                inner.next_item_handle += 1;
            }
            results.push(result);
            errors.push(error);
        }
        let results = self.shared.buffer(&mut inner, results);
        let errors = self.shared.buffer(&mut inner, errors);
        Ok((results, errors))
    }

    fn validate_items(&self, items: &[ItemDef], _blob_update: bool) -> OpcResult<ItemResults> {
        let mut inner = self.shared.enter("IOPCItemMgt::ValidateItems")?;
        let (results, errors): (Vec<_>, Vec<_>) = items
            .iter()
            .map(|item| {
                let (mut result, error) = self.resolve(&inner, item);
                result.server_handle = ItemHandle::default();
                (result, error)
            })
            .unzip();
        let results = self.shared.buffer(&mut inner, results);
        let errors = self.shared.buffer(&mut inner, errors);
        Ok((results, errors))
    }

    fn remove_items(&self, server_handles: &[ItemHandle]) -> OpcResult<RemoteArray<Hresult>> {
        self.per_handle("IOPCItemMgt::RemoveItems", server_handles, |inner, _, handle| {
            inner.items.remove(&handle);
            Hresult::S_OK
        })
    }

    fn set_active_state(
        &self,
        server_handles: &[ItemHandle],
        active: bool,
    ) -> OpcResult<RemoteArray<Hresult>> {
        self.per_handle(
            "IOPCItemMgt::SetActiveState",
            server_handles,
            |inner, _, handle| {
                if let Some(item) = inner.items.get_mut(&handle) {
                    item.active = active;
                }
                Hresult::S_OK
            },
        )
    }

    fn set_client_handles(
        &self,
        server_handles: &[ItemHandle],
        client_handles: &[ItemHandle],
    ) -> OpcResult<RemoteArray<Hresult>> {
        self.per_handle(
            "IOPCItemMgt::SetClientHandles",
            server_handles,
            |inner, index, handle| {
                if let Some(item) = inner.items.get_mut(&handle) {
                    item.client_handle = client_handles[index];
                }
                Hresult::S_OK
            },
        )
    }

    fn set_datatypes(
        &self,
        server_handles: &[ItemHandle],
        requested_types: &[VarType],
    ) -> OpcResult<RemoteArray<Hresult>> {
        self.per_handle(
            "IOPCItemMgt::SetDatatypes",
            server_handles,
            |inner, index, handle| {
                let requested = requested_types[index];
                if requested.is_byref() || requested == VarType::DISPATCH {
                    return Hresult::OPC_E_BADTYPE;
                }
                if let Some(item) = inner.items.get_mut(&handle) {
                    item.requested_type = requested;
                }
                Hresult::S_OK
            },
        )
    }
}

impl GroupStateMgt for FakeInterface {
    fn get_state(&self) -> OpcResult<GroupProperties> {
        let inner = self.shared.enter("IOPCGroupStateMgt::GetState")?;
        Ok(inner.state.clone())
    }

    fn set_state(&self, change: &GroupStateChange) -> OpcResult<u32> {
        let mut inner = self.shared.enter("IOPCGroupStateMgt::SetState")?;
        if let Some(requested) = change.update_rate {
            let granularity = inner.rate_granularity;
            inner.state.update_rate = if granularity == 0 {
                requested
            } else {
                requested.div_ceil(granularity).saturating_mul(granularity)
            };
        }
        if let Some(active) = change.active {
            inner.state.active = active;
        }
        if let Some(time_bias) = change.time_bias {
            inner.state.time_bias = time_bias;
        }
        if let Some(percent_deadband) = change.percent_deadband {
            if !(0.0..=100.0).contains(&percent_deadband) {
                return Err(OpcError::native(
                    "IOPCGroupStateMgt::SetState",
                    Hresult::E_INVALIDARG,
                ));
            }
            inner.state.percent_deadband = percent_deadband;
        }
        if let Some(locale_id) = change.locale_id {
            inner.state.locale_id = locale_id;
        }
        if let Some(client_handle) = change.client_handle {
            inner.state.client_handle = client_handle;
        }
        Ok(inner.state.update_rate)
    }

    fn set_name(&self, name: &str) -> OpcResult<()> {
        let mut inner = self.shared.enter("IOPCGroupStateMgt::SetName")?;
        if name.is_empty() {
            return Err(OpcError::native(
                "IOPCGroupStateMgt::SetName",
                Hresult::E_INVALIDARG,
            ));
        }
        name.clone_into(&mut inner.state.name);
        Ok(())
    }
}

impl SyncIo for FakeInterface {
    fn read(
        &self,
        source: DataSource,
        server_handles: &[ItemHandle],
    ) -> OpcResult<(RemoteArray<NativeItemState>, RemoteArray<Hresult>)> {
        let mut inner = self.shared.enter("IOPCSyncIO::Read")?;
        let (states, errors): (Vec<_>, Vec<_>) = server_handles
            .iter()
            .map(|handle| {
                let (_, state, error) = read_item(&inner, *handle, source);
                (state, error)
            })
            .unzip();
        let states = self.shared.buffer(&mut inner, states);
        let errors = self.shared.buffer(&mut inner, errors);
        Ok((states, errors))
    }

    fn write(
        &self,
        server_handles: &[ItemHandle],
        values: &[Variant],
    ) -> OpcResult<RemoteArray<Hresult>> {
        let mut inner = self.shared.enter("IOPCSyncIO::Write")?;
        let errors = server_handles
            .iter()
            .zip(values)
            .map(|(handle, variant)| match decode_variant(variant) {
                Ok(value) => apply_write(&mut inner, *handle, value).1,
                Err(_) => Hresult::OPC_E_BADTYPE,
            })
            .collect();
        Ok(self.shared.buffer(&mut inner, errors))
    }
}

impl AsyncIo2 for FakeInterface {
    fn read(
        &self,
        server_handles: &[ItemHandle],
        transaction_id: u32,
    ) -> OpcResult<(u32, RemoteArray<Hresult>)> {
        let mut inner = self.shared.enter("IOPCAsyncIO2::Read")?;
        let (accepted, errors): (Vec<_>, Vec<_>) = server_handles
            .iter()
            .map(|handle| {
                if inner.items.contains_key(handle) {
                    (Some(*handle), Hresult::S_OK)
                } else {
                    (None, Hresult::OPC_E_INVALIDHANDLE)
                }
            })
            .unzip();
        let handles: Vec<ItemHandle> = accepted.into_iter().flatten().collect();
        let cancel_id = Self::next_cancel_id(&mut inner);
        if !handles.is_empty() {
            inner.pending.push(Pending::Read {
                transaction_id,
                cancel_id,
                handles,
            });
        }
        Ok((cancel_id, self.shared.buffer(&mut inner, errors)))
    }

    fn write(
        &self,
        server_handles: &[ItemHandle],
        values: &[Variant],
        transaction_id: u32,
    ) -> OpcResult<(u32, RemoteArray<Hresult>)> {
        let mut inner = self.shared.enter("IOPCAsyncIO2::Write")?;
        let mut writes = Vec::new();
        let mut errors = Vec::with_capacity(server_handles.len());
        for (handle, variant) in server_handles.iter().zip(values) {
            let code = check_write(&inner, *handle);
            let code = match decode_variant(variant) {
                Ok(value) if code.is_ok() => {
                    writes.push((*handle, value));
                    code
                }
                Ok(_) => code,
                Err(_) => Hresult::OPC_E_BADTYPE,
            };
            errors.push(code);
        }
        let cancel_id = Self::next_cancel_id(&mut inner);
        if !writes.is_empty() {
            inner.pending.push(Pending::Write {
                transaction_id,
                cancel_id,
                writes,
            });
        }
        Ok((cancel_id, self.shared.buffer(&mut inner, errors)))
    }

    fn refresh2(&self, source: DataSource, transaction_id: u32) -> OpcResult<u32> {
        let mut inner = self.shared.enter("IOPCAsyncIO2::Refresh2")?;
        if !inner.items.values().any(|item| item.active) {
            return Err(OpcError::native("IOPCAsyncIO2::Refresh2", Hresult::E_FAIL));
        }
        let cancel_id = Self::next_cancel_id(&mut inner);
        inner.pending.push(Pending::Refresh {
            transaction_id,
            cancel_id,
            source,
        });
        Ok(cancel_id)
    }

    fn cancel2(&self, cancel_id: u32) -> OpcResult<()> {
        let mut inner = self.shared.enter("IOPCAsyncIO2::Cancel2")?;
        let Some(position) = inner
            .pending
            .iter()
            .position(|pending| pending.cancel_id() == cancel_id)
        else {
            return Err(OpcError::native("IOPCAsyncIO2::Cancel2", Hresult::E_FAIL));
        };
        let transaction = inner.pending.remove(position);
        inner.cancelled.push(transaction.transaction_id());
        Ok(())
    }

    fn set_enable(&self, enable: bool) -> OpcResult<()> {
        self.shared.enter("IOPCAsyncIO2::SetEnable")?.enabled = enable;
        Ok(())
    }

    fn get_enable(&self) -> OpcResult<bool> {
        Ok(self.shared.enter("IOPCAsyncIO2::GetEnable")?.enabled)
    }
}

impl ConnectionPointContainer for FakeInterface {
    fn find_connection_point(&self, iid: &Guid) -> OpcResult<Option<Box<dyn ConnectionPoint>>> {
        drop(self.shared.enter("IConnectionPointContainer::FindConnectionPoint")?);
        if self.data_callback_point && *iid == IID_IOPC_DATA_CALLBACK {
            Ok(Some(Box::new(Self::new(
                &self.shared,
                self.data_callback_point,
            ))))
        } else {
            Ok(None)
        }
    }
}

impl ConnectionPoint for FakeInterface {
    fn advise(&self, sink: Arc<dyn DataCallback>) -> OpcResult<u32> {
        let mut inner = self.shared.enter("IConnectionPoint::Advise")?;
        let cookie = inner.next_cookie;
        inner.next_cookie += 1;
        inner.sinks.insert(cookie, sink);
        Ok(cookie)
    }

    fn unadvise(&self, cookie: u32) -> OpcResult<()> {
        let mut inner = self.shared.enter("IConnectionPoint::Unadvise")?;
        if inner.sinks.remove(&cookie).is_some() {
            Ok(())
        } else {
            Err(OpcError::native(
                "IConnectionPoint::Unadvise",
                Hresult::CONNECT_E_NOCONNECTION,
            ))
        }
    }
}
