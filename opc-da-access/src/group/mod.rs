//! The subscription group: identity, item membership, sync and async I/O,
//! and the notification subscription.

use crate::codec::encode_values;
use crate::dispatcher::Dispatcher;
use crate::errors::{OpcError, OpcResult};
use crate::events::{
    CancelCompleteEvent, DataChangeEvent, EventHandlers, GroupEvent, HandlerId, ReadCompleteEvent,
    WriteCompleteEvent,
};
use crate::native::{
    AsyncIo2, ConnectionPoint, DataCallback, GroupInterfaces, IID_IOPC_DATA_CALLBACK,
    NativeGroupObject,
};
use crate::reader::{read_item_results, read_item_states, read_results};
use crate::typedefs::{
    DataSource, GroupHandle, GroupProperties, GroupStateChange, Hresult, ItemDef, ItemHandle,
    ItemResult, ItemValue, VarType,
};
use crate::variant::Value;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tokio::sync::mpsc;

#[cfg(any(test, feature = "test-support"))]
use mockall::automock;

#[cfg(test)]
mod tests;

/// The session that created a group and must forget it on disposal.
#[cfg_attr(any(test, feature = "test-support"), automock)]
pub trait GroupOwner: Send + Sync {
    /// Called once, after the group has released its native handle.
    fn remove_group(&self, server_handle: GroupHandle) -> anyhow::Result<()>;
}

/// Construction parameters handed over by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupParams {
    pub client_handle: GroupHandle,
    pub server_handle: GroupHandle,
    pub name: String,
    /// Update rate as revised by the server when the group was added.
    pub update_rate: u32,
}

/// Outcome of an asynchronous read or write request.
///
/// `results` holds per-item acceptance codes; the data itself arrives later
/// as an event carrying the same transaction id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AsyncRequest {
    pub cancel_id: u32,
    pub results: Vec<Hresult>,
}

#[derive(Debug)]
struct Identity {
    client_handle: GroupHandle,
    name: String,
    update_rate: u32,
}

struct Connection {
    point: Box<dyn ConnectionPoint>,
    cookie: u32,
}

/// One OPC DA group.
///
/// The group owns its native interfaces until [`Group::dispose`] (or drop)
/// releases them. Every operation takes `&self` and may be called from any
/// thread; notifications are delivered on threads chosen by the server.
pub struct Group {
    server_handle: GroupHandle,
    identity: RwLock<Identity>,
    native: RwLock<Option<Arc<GroupInterfaces>>>,
    async_supported: bool,
    connection: Mutex<Option<Connection>>,
    handlers: Arc<EventHandlers>,
    owner: Weak<dyn GroupOwner>,
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("server_handle", &self.server_handle)
            .field("identity", &*self.identity.read().unwrap_or_else(PoisonError::into_inner))
            .field("async_supported", &self.async_supported)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

fn ensure_same_len(left: &str, left_len: usize, right: &str, right_len: usize) -> OpcResult<()> {
    if left_len == right_len {
        Ok(())
    } else {
        Err(OpcError::InvalidArgument(format!(
            "{left} has {left_len} entries but {right} has {right_len}"
        )))
    }
}

fn report_item_failures(operation: &str, errors: impl IntoIterator<Item = Hresult>) {
    let failed = errors.into_iter().filter(|code| code.is_err()).count();
    if failed > 0 {
        tracing::warn!(operation, failed, "Per-item failures reported by server");
    }
}

impl Group {
    /// Queries the native object's interfaces and takes ownership of them.
    ///
    /// Fails if item management, group state management or sync I/O is
    /// missing. Async I/O and the connection point container are optional.
    pub fn new(
        params: GroupParams,
        object: &dyn NativeGroupObject,
        owner: Weak<dyn GroupOwner>,
    ) -> OpcResult<Self> {
        let native = GroupInterfaces::query(object)?;
        let async_supported = native.is_async_supported();
        tracing::debug!(
            server_handle = params.server_handle.0,
            client_handle = params.client_handle.0,
            name = %params.name,
            async_supported,
            "Group created"
        );
        Ok(Self {
            server_handle: params.server_handle,
            identity: RwLock::new(Identity {
                client_handle: params.client_handle,
                name: params.name,
                update_rate: params.update_rate,
            }),
            native: RwLock::new(Some(Arc::new(native))),
            async_supported,
            connection: Mutex::new(None),
            handlers: Arc::new(EventHandlers::new()),
            owner,
        })
    }

    pub fn server_handle(&self) -> GroupHandle {
        self.server_handle
    }

    pub fn client_handle(&self) -> GroupHandle {
        self.identity().client_handle
    }

    pub fn name(&self) -> String {
        self.identity().name.clone()
    }

    /// The last update rate the server confirmed.
    pub fn update_rate(&self) -> u32 {
        self.identity().update_rate
    }

    pub const fn is_async_supported(&self) -> bool {
        self.async_supported
    }

    pub fn is_disposed(&self) -> bool {
        self.native
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    fn identity(&self) -> std::sync::RwLockReadGuard<'_, Identity> {
        self.identity.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// A reference to the live interfaces, kept for the duration of one call.
    fn interfaces(&self) -> OpcResult<Arc<GroupInterfaces>> {
        self.native
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(Arc::clone)
            .ok_or(OpcError::Disposed)
    }

    fn with_async_io<R>(&self, call: impl FnOnce(&dyn AsyncIo2) -> OpcResult<R>) -> OpcResult<R> {
        let native = self.interfaces()?;
        match native.async_io2.as_deref() {
            Some(async_io) if self.async_supported => call(async_io),
            _ => Err(OpcError::NotSupported(
                "Group does not implement IOPCAsyncIO2 and IConnectionPointContainer".into(),
            )),
        }
    }

    /// Reads the group state from the server.
    pub fn properties(&self) -> OpcResult<GroupProperties> {
        let native = self.interfaces()?;
        native.group_state_mgt.get_state()
    }

    /// Writes the group state, then renames the group if the name changed.
    ///
    /// The update rate stored afterwards is the one the server revised to.
    pub fn set_properties(&self, props: &GroupProperties) -> OpcResult<()> {
        let native = self.interfaces()?;
        let span = tracing::debug_span!("opc.set_properties", group = self.server_handle.0);
        let _enter = span.enter();

        let revised = native
            .group_state_mgt
            .set_state(&GroupStateChange::from(props))?;
        if revised != props.update_rate {
            tracing::info!(
                requested = props.update_rate,
                revised,
                "Server revised group update rate"
            );
        }
        {
            let mut identity = self.identity.write().unwrap_or_else(PoisonError::into_inner);
            identity.update_rate = revised;
            identity.client_handle = props.client_handle;
        }

        if props.name != self.name() {
            native.group_state_mgt.set_name(&props.name)?;
            self.identity
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .name
                .clone_from(&props.name);
        }
        Ok(())
    }

    /// Adds items; results are aligned with `items`.
    pub fn add_items(&self, items: &[ItemDef]) -> OpcResult<Vec<ItemResult>> {
        let native = self.interfaces()?;
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let span = tracing::debug_span!(
            "opc.add_items",
            group = self.server_handle.0,
            count = items.len()
        );
        let _enter = span.enter();

        let (results, errors) = native.item_mgt.add_items(items)?;
        let results = read_item_results(items, results, errors)?;
        report_item_failures("add_items", results.iter().map(|r| r.error));
        Ok(results)
    }

    /// Checks items against the server without adding them.
    pub fn validate_items(
        &self,
        items: &[ItemDef],
        blob_update: bool,
    ) -> OpcResult<Vec<ItemResult>> {
        let native = self.interfaces()?;
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let span = tracing::debug_span!(
            "opc.validate_items",
            group = self.server_handle.0,
            count = items.len()
        );
        let _enter = span.enter();

        let (results, errors) = native.item_mgt.validate_items(items, blob_update)?;
        read_item_results(items, results, errors)
    }

    pub fn remove_items(&self, server_handles: &[ItemHandle]) -> OpcResult<Vec<Hresult>> {
        let native = self.interfaces()?;
        if server_handles.is_empty() {
            return Ok(Vec::new());
        }
        let span = tracing::debug_span!(
            "opc.remove_items",
            group = self.server_handle.0,
            count = server_handles.len()
        );
        let _enter = span.enter();

        let errors = native.item_mgt.remove_items(server_handles)?;
        let results = read_results(server_handles.len(), errors)?;
        report_item_failures("remove_items", results.iter().copied());
        Ok(results)
    }

    pub fn set_active_state(
        &self,
        server_handles: &[ItemHandle],
        active: bool,
    ) -> OpcResult<Vec<Hresult>> {
        let native = self.interfaces()?;
        if server_handles.is_empty() {
            return Ok(Vec::new());
        }
        let span = tracing::debug_span!(
            "opc.set_active_state",
            group = self.server_handle.0,
            count = server_handles.len(),
            active
        );
        let _enter = span.enter();

        let errors = native.item_mgt.set_active_state(server_handles, active)?;
        read_results(server_handles.len(), errors)
    }

    pub fn set_client_handles(
        &self,
        server_handles: &[ItemHandle],
        client_handles: &[ItemHandle],
    ) -> OpcResult<Vec<Hresult>> {
        let native = self.interfaces()?;
        ensure_same_len(
            "server_handles",
            server_handles.len(),
            "client_handles",
            client_handles.len(),
        )?;
        if server_handles.is_empty() {
            return Ok(Vec::new());
        }
        let span = tracing::debug_span!(
            "opc.set_client_handles",
            group = self.server_handle.0,
            count = server_handles.len()
        );
        let _enter = span.enter();

        let errors = native
            .item_mgt
            .set_client_handles(server_handles, client_handles)?;
        read_results(server_handles.len(), errors)
    }

    pub fn set_data_types(
        &self,
        server_handles: &[ItemHandle],
        requested_types: &[VarType],
    ) -> OpcResult<Vec<Hresult>> {
        let native = self.interfaces()?;
        ensure_same_len(
            "server_handles",
            server_handles.len(),
            "requested_types",
            requested_types.len(),
        )?;
        if server_handles.is_empty() {
            return Ok(Vec::new());
        }
        let span = tracing::debug_span!(
            "opc.set_data_types",
            group = self.server_handle.0,
            count = server_handles.len()
        );
        let _enter = span.enter();

        let errors = native
            .item_mgt
            .set_datatypes(server_handles, requested_types)?;
        read_results(server_handles.len(), errors)
    }

    /// Blocking read from the cache or the device.
    pub fn sync_read(
        &self,
        source: DataSource,
        server_handles: &[ItemHandle],
    ) -> OpcResult<Vec<ItemValue>> {
        let native = self.interfaces()?;
        if server_handles.is_empty() {
            return Ok(Vec::new());
        }
        let span = tracing::debug_span!(
            "opc.sync_read",
            group = self.server_handle.0,
            count = server_handles.len(),
            ?source
        );
        let _enter = span.enter();

        let (states, errors) = native.sync_io.read(source, server_handles)?;
        let values = read_item_states(server_handles.len(), states, errors)?;
        report_item_failures("sync_read", values.iter().map(|v| v.error));
        Ok(values)
    }

    /// Blocking write; the value buffer is released when the call returns.
    pub fn sync_write(
        &self,
        server_handles: &[ItemHandle],
        values: &[Value],
    ) -> OpcResult<Vec<Hresult>> {
        let native = self.interfaces()?;
        ensure_same_len(
            "server_handles",
            server_handles.len(),
            "values",
            values.len(),
        )?;
        if server_handles.is_empty() {
            return Ok(Vec::new());
        }
        let span = tracing::debug_span!(
            "opc.sync_write",
            group = self.server_handle.0,
            count = server_handles.len()
        );
        let _enter = span.enter();

        let buffer = encode_values(values)?;
        let errors = native.sync_io.write(server_handles, buffer.as_slice())?;
        let results = read_results(server_handles.len(), errors)?;
        report_item_failures("sync_write", results.iter().copied());
        Ok(results)
    }

    /// Starts an asynchronous read; values arrive as a read-complete event.
    pub fn async_read(
        &self,
        server_handles: &[ItemHandle],
        transaction_id: u32,
    ) -> OpcResult<AsyncRequest> {
        self.with_async_io(|async_io| {
            if server_handles.is_empty() {
                return Ok(AsyncRequest::default());
            }
            let span = tracing::debug_span!(
                "opc.async_read",
                group = self.server_handle.0,
                count = server_handles.len(),
                transaction_id
            );
            let _enter = span.enter();

            let (cancel_id, errors) = async_io.read(server_handles, transaction_id)?;
            Ok(AsyncRequest {
                cancel_id,
                results: read_results(server_handles.len(), errors)?,
            })
        })
    }

    /// Starts an asynchronous write; completion arrives as a write-complete event.
    pub fn async_write(
        &self,
        server_handles: &[ItemHandle],
        values: &[Value],
        transaction_id: u32,
    ) -> OpcResult<AsyncRequest> {
        self.with_async_io(|async_io| {
            ensure_same_len(
                "server_handles",
                server_handles.len(),
                "values",
                values.len(),
            )?;
            if server_handles.is_empty() {
                return Ok(AsyncRequest::default());
            }
            let span = tracing::debug_span!(
                "opc.async_write",
                group = self.server_handle.0,
                count = server_handles.len(),
                transaction_id
            );
            let _enter = span.enter();

            let buffer = encode_values(values)?;
            let (cancel_id, errors) =
                async_io.write(server_handles, buffer.as_slice(), transaction_id)?;
            Ok(AsyncRequest {
                cancel_id,
                results: read_results(server_handles.len(), errors)?,
            })
        })
    }

    /// Asks the server to notify every active item; returns the cancel id.
    pub fn async_refresh(&self, source: DataSource, transaction_id: u32) -> OpcResult<u32> {
        self.with_async_io(|async_io| {
            tracing::debug!(
                group = self.server_handle.0,
                ?source,
                transaction_id,
                "Requesting refresh"
            );
            async_io.refresh2(source, transaction_id)
        })
    }

    /// Requests cancellation. The outcome is reported by a cancel-complete
    /// event, or by the regular completion if the server was faster.
    pub fn async_cancel(&self, cancel_id: u32) -> OpcResult<()> {
        self.with_async_io(|async_io| async_io.cancel2(cancel_id))
    }

    /// Enables or disables unsolicited data-change notifications.
    pub fn set_async_enabled(&self, enabled: bool) -> OpcResult<()> {
        self.with_async_io(|async_io| async_io.set_enable(enabled))
    }

    pub fn async_enabled(&self) -> OpcResult<bool> {
        self.with_async_io(|async_io| async_io.get_enable())
    }

    /// Registers the dispatcher on the data callback connection point once.
    fn ensure_advised(&self) -> OpcResult<()> {
        let mut connection = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
        // Checked under the connection lock so a concurrent dispose either
        // sees this registration or makes this call fail.
        let native = self.interfaces()?;
        if connection.is_some() {
            return Ok(());
        }
        let container = match native.connection_point_container.as_deref() {
            Some(container) if self.async_supported => container,
            _ => {
                return Err(OpcError::NotSupported(
                    "Group does not implement IOPCAsyncIO2 and IConnectionPointContainer".into(),
                ));
            }
        };
        let point = container
            .find_connection_point(&IID_IOPC_DATA_CALLBACK)?
            .ok_or_else(|| {
                OpcError::NotSupported("Group has no IOPCDataCallback connection point".into())
            })?;

        let sink: Arc<dyn DataCallback> = Arc::new(Dispatcher::new(
            self.server_handle,
            Arc::clone(&self.handlers),
        ));
        let cookie = point.advise(sink)?;
        tracing::debug!(group = self.server_handle.0, cookie, "Data callback advised");
        *connection = Some(Connection { point, cookie });
        Ok(())
    }

    fn attach(&self, register: impl FnOnce(&EventHandlers, HandlerId)) -> OpcResult<HandlerId> {
        self.ensure_advised()?;
        let id = self.handlers.next_id();
        register(&self.handlers, id);
        Ok(id)
    }

    /// Attaches a data-change handler, subscribing to notifications on first use.
    ///
    /// Fails with [`OpcError::NotSupported`] when the group cannot deliver
    /// notifications.
    pub fn on_data_change<F>(&self, handler: F) -> OpcResult<HandlerId>
    where
        F: Fn(&DataChangeEvent) + Send + Sync + 'static,
    {
        self.attach(|handlers, id| handlers.data_change.add(id, Arc::new(handler)))
    }

    pub fn on_read_complete<F>(&self, handler: F) -> OpcResult<HandlerId>
    where
        F: Fn(&ReadCompleteEvent) + Send + Sync + 'static,
    {
        self.attach(|handlers, id| handlers.read_complete.add(id, Arc::new(handler)))
    }

    pub fn on_write_complete<F>(&self, handler: F) -> OpcResult<HandlerId>
    where
        F: Fn(&WriteCompleteEvent) + Send + Sync + 'static,
    {
        self.attach(|handlers, id| handlers.write_complete.add(id, Arc::new(handler)))
    }

    pub fn on_cancel_complete<F>(&self, handler: F) -> OpcResult<HandlerId>
    where
        F: Fn(&CancelCompleteEvent) + Send + Sync + 'static,
    {
        self.attach(|handlers, id| handlers.cancel_complete.add(id, Arc::new(handler)))
    }

    /// Detaches a handler. The subscription itself stays until disposal.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        self.handlers.remove(id)
    }

    /// All four notification kinds as one channel.
    ///
    /// The handlers feeding the channel detach themselves once the receiver
    /// is dropped.
    pub fn event_stream(&self) -> OpcResult<mpsc::UnboundedReceiver<GroupEvent>> {
        self.ensure_advised()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let sink = Arc::new(StreamSink {
            sender,
            handlers: Arc::downgrade(&self.handlers),
            ids: Mutex::new(Vec::new()),
        });

        let handlers = &self.handlers;
        let ids = vec![
            {
                let sink = Arc::clone(&sink);
                let id = handlers.next_id();
                handlers.data_change.add(
                    id,
                    Arc::new(move |event: &DataChangeEvent| {
                        sink.send(GroupEvent::DataChange(event.clone()));
                    }),
                );
                id
            },
            {
                let sink = Arc::clone(&sink);
                let id = handlers.next_id();
                handlers.read_complete.add(
                    id,
                    Arc::new(move |event: &ReadCompleteEvent| {
                        sink.send(GroupEvent::ReadComplete(event.clone()));
                    }),
                );
                id
            },
            {
                let sink = Arc::clone(&sink);
                let id = handlers.next_id();
                handlers.write_complete.add(
                    id,
                    Arc::new(move |event: &WriteCompleteEvent| {
                        sink.send(GroupEvent::WriteComplete(event.clone()));
                    }),
                );
                id
            },
            {
                let sink = Arc::clone(&sink);
                let id = handlers.next_id();
                handlers.cancel_complete.add(
                    id,
                    Arc::new(move |event: &CancelCompleteEvent| {
                        sink.send(GroupEvent::CancelComplete(*event));
                    }),
                );
                id
            },
        ];

        *sink.ids.lock().unwrap_or_else(PoisonError::into_inner) = ids;
        Ok(receiver)
    }

    /// Unadvises the subscription, releases the native interfaces, detaches
    /// every handler and tells the owner to forget this group.
    ///
    /// Idempotent: later calls return `Ok(())`. Every step runs even when an
    /// earlier one fails; the first failure is returned.
    pub fn dispose(&self) -> OpcResult<()> {
        let Some(native) = self
            .native
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };
        let span = tracing::debug_span!("opc.dispose", group = self.server_handle.0);
        let _enter = span.enter();

        let mut first_error = None;
        let connection = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(connection) = connection {
            if let Err(err) = connection.point.unadvise(connection.cookie) {
                tracing::warn!(
                    cookie = connection.cookie,
                    error = %err,
                    "Failed to unadvise data callback"
                );
                first_error.get_or_insert(err);
            }
        }
        drop(native);
        // Releases the `event_stream` senders so receivers see the end.
        self.handlers.clear();

        if let Some(owner) = self.owner.upgrade() {
            if let Err(err) = owner.remove_group(self.server_handle) {
                tracing::warn!(error = %err, "Owner failed to remove group");
                first_error.get_or_insert(OpcError::from(err));
            }
        }

        tracing::debug!("Group disposed");
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for Group {
    fn drop(&mut self) {
        if let Err(err) = self.dispose() {
            tracing::warn!(
                group = self.server_handle.0,
                error = %err,
                "Group dispose on drop failed"
            );
        }
    }
}

struct StreamSink {
    sender: mpsc::UnboundedSender<GroupEvent>,
    handlers: Weak<EventHandlers>,
    ids: Mutex<Vec<HandlerId>>,
}

impl StreamSink {
    fn send(&self, event: GroupEvent) {
        if self.sender.send(event).is_ok() {
            return;
        }
        let ids = std::mem::take(&mut *self.ids.lock().unwrap_or_else(PoisonError::into_inner));
        if let Some(handlers) = self.handlers.upgrade() {
            for id in ids {
                handlers.remove(id);
            }
        }
    }
}
