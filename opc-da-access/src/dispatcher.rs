use crate::codec::decode_values;
use crate::errors::OpcResult;
use crate::events::{CancelCompleteEvent, DataChangeEvent, EventHandlers, WriteCompleteEvent};
use crate::native::{DataCallback, ValueNotification, WriteNotification};
use crate::reader::read_write_results;
use crate::typedefs::GroupHandle;
use std::sync::Arc;

/// The sink a group advises on its data callback connection point.
///
/// Notifications for any other group handle are dropped. Payloads are only
/// decoded when a handler of that kind is attached.
pub(crate) struct Dispatcher {
    server_handle: GroupHandle,
    handlers: Arc<EventHandlers>,
}

impl Dispatcher {
    pub(crate) const fn new(server_handle: GroupHandle, handlers: Arc<EventHandlers>) -> Self {
        Self {
            server_handle,
            handlers,
        }
    }

    fn accepts(&self, group_handle: GroupHandle, kind: &'static str) -> bool {
        if group_handle == self.server_handle {
            return true;
        }
        tracing::trace!(
            kind,
            group = self.server_handle.0,
            received = group_handle.0,
            "Dropping notification for another group"
        );
        false
    }

    fn value_event(notification: &ValueNotification<'_>) -> OpcResult<DataChangeEvent> {
        let count = usize::try_from(notification.count)?;
        let values = decode_values(count, &notification.buffers).inspect_err(|err| {
            tracing::warn!(
                transaction_id = notification.transaction_id,
                error = %err,
                "Malformed notification buffers"
            );
        })?;
        Ok(DataChangeEvent {
            group_handle: notification.group_handle,
            transaction_id: notification.transaction_id,
            master_quality: notification.master_quality,
            master_error: notification.master_error,
            values,
        })
    }
}

impl DataCallback for Dispatcher {
    fn on_data_change(&self, notification: &ValueNotification<'_>) -> OpcResult<()> {
        if !self.accepts(notification.group_handle, "data_change")
            || self.handlers.data_change.is_empty()
        {
            return Ok(());
        }
        let event = Self::value_event(notification)?;
        self.handlers.data_change.dispatch(&event);
        Ok(())
    }

    fn on_read_complete(&self, notification: &ValueNotification<'_>) -> OpcResult<()> {
        if !self.accepts(notification.group_handle, "read_complete")
            || self.handlers.read_complete.is_empty()
        {
            return Ok(());
        }
        let event = Self::value_event(notification)?;
        self.handlers.read_complete.dispatch(&event);
        Ok(())
    }

    fn on_write_complete(&self, notification: &WriteNotification<'_>) -> OpcResult<()> {
        if !self.accepts(notification.group_handle, "write_complete")
            || self.handlers.write_complete.is_empty()
        {
            return Ok(());
        }
        let count = usize::try_from(notification.count)?;
        let results = read_write_results(count, notification.client_handles, notification.errors)?;
        self.handlers.write_complete.dispatch(&WriteCompleteEvent {
            group_handle: notification.group_handle,
            transaction_id: notification.transaction_id,
            master_error: notification.master_error,
            results,
        });
        Ok(())
    }

    fn on_cancel_complete(
        &self,
        transaction_id: u32,
        group_handle: GroupHandle,
    ) -> OpcResult<()> {
        if self.accepts(group_handle, "cancel_complete") {
            self.handlers.cancel_complete.dispatch(&CancelCompleteEvent {
                group_handle,
                transaction_id,
            });
        }
        Ok(())
    }
}
