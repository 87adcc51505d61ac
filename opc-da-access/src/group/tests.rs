use super::*;
use crate::codec::filetime_to_datetime;
use crate::fake::{FAKE_TIMESTAMP, FakeGroupObject, FakeServer};
use crate::typedefs::{AccessRights, Quality};
use crate::variant::ArrayValue;
use mockall::predicate::eq;
use std::sync::atomic::{AtomicUsize, Ordering};

const CLIENT: GroupHandle = GroupHandle(10);
const SERVER: GroupHandle = GroupHandle(20);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn params() -> GroupParams {
    GroupParams {
        client_handle: CLIENT,
        server_handle: SERVER,
        name: "FakeGroup".to_owned(),
        update_rate: 1000,
    }
}

fn fake() -> FakeGroupObject {
    FakeGroupObject::new(CLIENT, SERVER)
        .with_tag("Random.Int4", 42i32)
        .with_tag("Random.Real8", 1.5f64)
        .with_tag("Random.String", "hello")
        .with_tag_rights("Random.ReadOnly", true, AccessRights::READABLE)
}

fn group_with(object: &FakeGroupObject) -> (Group, FakeServer) {
    let group = Group::new(params(), object, Weak::<MockGroupOwner>::new()).unwrap();
    (group, object.server())
}

fn owned_group(object: &FakeGroupObject, owner: &Arc<MockGroupOwner>) -> Group {
    let owner: Arc<dyn GroupOwner> = Arc::clone(owner) as Arc<dyn GroupOwner>;
    Group::new(params(), object, Arc::downgrade(&owner)).unwrap()
}

/// Adds `Random.Int4` (client 1) and `Random.Real8` (client 2).
fn add_two(group: &Group) -> Vec<ItemHandle> {
    group
        .add_items(&[
            ItemDef::new("Random.Int4", ItemHandle(1)),
            ItemDef::new("Random.Real8", ItemHandle(2)),
        ])
        .unwrap()
        .into_iter()
        .map(|result| result.server_handle.unwrap())
        .collect()
}

fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    (Arc::clone(&count), count)
}

#[test]
fn test_add_items_preserves_order_with_per_item_failures() {
    init_tracing();
    let (group, server) = group_with(&fake());
    let results = group
        .add_items(&[
            ItemDef::new("Random.Int4", ItemHandle(1)),
            ItemDef::new("Missing.Tag", ItemHandle(2)),
            ItemDef::new("", ItemHandle(3)),
            ItemDef::new("Random.Real8", ItemHandle(4)).with_blob(vec![1, 2]),
        ])
        .unwrap();

    let clients: Vec<_> = results.iter().map(|r| r.client_handle).collect();
    assert_eq!(
        clients,
        vec![ItemHandle(1), ItemHandle(2), ItemHandle(3), ItemHandle(4)]
    );
    assert!(results[0].is_ok());
    assert_eq!(results[0].canonical_type, VarType::I4);
    assert_eq!(results[1].error, Hresult::OPC_E_UNKNOWNITEMID);
    assert_eq!(results[1].server_handle, None);
    assert_eq!(results[2].error, Hresult::OPC_E_INVALIDITEMID);
    assert!(results[3].is_ok());
    assert_eq!(results[3].canonical_type, VarType::R8);
    assert_eq!(results[3].blob, vec![1, 2]);
    assert_ne!(results[0].server_handle, results[3].server_handle);
    assert_eq!(server.outstanding_buffers(), 0);
}

#[test]
fn test_validate_items_does_not_register() {
    let (group, server) = group_with(&fake());
    let results = group
        .validate_items(
            &[
                ItemDef::new("Random.String", ItemHandle(1)),
                ItemDef::new("Nope", ItemHandle(2)),
            ],
            false,
        )
        .unwrap();
    assert!(results[0].is_ok());
    assert_eq!(results[0].canonical_type, VarType::BSTR);
    assert_eq!(results[1].error, Hresult::OPC_E_UNKNOWNITEMID);
    assert!(!server.has_item(ItemHandle(1)));
    assert_eq!(server.outstanding_buffers(), 0);
}

#[test]
fn test_remove_items_matches_input_length_and_order() {
    let (group, server) = group_with(&fake());
    let handles = add_two(&group);

    let results = group
        .remove_items(&[handles[1], ItemHandle(999), handles[0]])
        .unwrap();
    assert_eq!(
        results,
        vec![Hresult::S_OK, Hresult::OPC_E_INVALIDHANDLE, Hresult::S_OK]
    );
    assert!(!server.has_item(handles[0]));
    assert!(!server.has_item(handles[1]));
}

#[test]
fn test_empty_inputs_never_reach_the_server() {
    let (group, server) = group_with(&fake());

    assert!(group.add_items(&[]).unwrap().is_empty());
    assert!(group.validate_items(&[], true).unwrap().is_empty());
    assert!(group.remove_items(&[]).unwrap().is_empty());
    assert!(group.set_active_state(&[], false).unwrap().is_empty());
    assert!(group.set_client_handles(&[], &[]).unwrap().is_empty());
    assert!(group.set_data_types(&[], &[]).unwrap().is_empty());
    assert!(group.sync_read(DataSource::Cache, &[]).unwrap().is_empty());
    assert!(group.sync_write(&[], &[]).unwrap().is_empty());
    assert_eq!(group.async_read(&[], 1).unwrap(), AsyncRequest::default());
    assert_eq!(group.async_write(&[], &[], 1).unwrap(), AsyncRequest::default());

    assert_eq!(server.native_calls(), 0);
}

#[test]
fn test_set_properties_stores_revised_rate() {
    let object = fake().with_rate_granularity(200);
    let (group, server) = group_with(&object);

    let props = GroupProperties {
        update_rate: 100,
        name: group.name(),
        client_handle: CLIENT,
        ..group.properties().unwrap()
    };
    group.set_properties(&props).unwrap();

    assert_eq!(group.update_rate(), 200);
    assert_eq!(server.group_state().update_rate, 200);
}

#[test]
fn test_set_properties_renames_only_when_name_changes() {
    let (group, server) = group_with(&fake());
    let mut props = group.properties().unwrap();
    props.client_handle = GroupHandle(11);
    props.percent_deadband = 2.5;

    group.set_properties(&props).unwrap();
    assert!(!server.calls().contains(&"IOPCGroupStateMgt::SetName"));
    assert_eq!(group.client_handle(), GroupHandle(11));
    assert!((server.group_state().percent_deadband - 2.5).abs() < f32::EPSILON);

    props.name = "Renamed".to_owned();
    group.set_properties(&props).unwrap();
    assert!(server.calls().contains(&"IOPCGroupStateMgt::SetName"));
    assert_eq!(group.name(), "Renamed");
    assert_eq!(server.group_state().name, "Renamed");
}

#[test]
fn test_failed_rename_keeps_local_name() {
    let (group, server) = group_with(&fake());
    let mut props = group.properties().unwrap();
    props.name = "Renamed".to_owned();
    server.fail_next_call("IOPCGroupStateMgt::SetName", Hresult::OPC_E_INVALIDHANDLE);

    let err = group.set_properties(&props).unwrap_err();
    assert_eq!(err.code(), Some(Hresult::OPC_E_INVALIDHANDLE));
    assert_eq!(group.name(), "FakeGroup");
}

#[test]
fn test_failed_set_state_keeps_identity() {
    let (group, server) = group_with(&fake());
    let mut props = group.properties().unwrap();
    props.client_handle = GroupHandle(99);
    props.update_rate = 50;
    server.fail_next_call("IOPCGroupStateMgt::SetState", Hresult::E_FAIL);

    assert!(matches!(
        group.set_properties(&props),
        Err(OpcError::Native {
            operation: "IOPCGroupStateMgt::SetState",
            code: Hresult::E_FAIL
        })
    ));
    assert_eq!(group.client_handle(), CLIENT);
    assert_eq!(group.update_rate(), 1000);
}

#[test]
fn test_every_operation_fails_after_dispose() {
    let (group, server) = group_with(&fake());
    let handles = add_two(&group);
    group.dispose().unwrap();
    let calls = server.native_calls();

    let disposed = |result: OpcResult<()>| matches!(result, Err(OpcError::Disposed));
    assert!(disposed(group.properties().map(drop)));
    assert!(disposed(group.set_properties(&GroupProperties::default())));
    assert!(disposed(group.add_items(&[]).map(drop)));
    assert!(disposed(group.validate_items(&[], false).map(drop)));
    assert!(disposed(group.remove_items(&handles).map(drop)));
    assert!(disposed(group.set_active_state(&handles, true).map(drop)));
    assert!(disposed(group.set_client_handles(&handles, &handles).map(drop)));
    assert!(disposed(
        group
            .set_data_types(&handles, &[VarType::I4, VarType::I4])
            .map(drop)
    ));
    assert!(disposed(group.sync_read(DataSource::Device, &handles).map(drop)));
    assert!(disposed(group.sync_write(&handles, &[]).map(drop)));
    assert!(disposed(group.async_read(&handles, 1).map(drop)));
    assert!(disposed(group.async_write(&handles, &[], 1).map(drop)));
    assert!(disposed(group.async_refresh(DataSource::Cache, 1).map(drop)));
    assert!(disposed(group.async_cancel(1)));
    assert!(disposed(group.set_async_enabled(false)));
    assert!(disposed(group.async_enabled().map(drop)));
    assert!(disposed(group.on_data_change(|_| {}).map(drop)));
    assert!(disposed(group.on_cancel_complete(|_| {}).map(drop)));
    assert!(disposed(group.event_stream().map(drop)));

    assert!(group.dispose().is_ok());
    assert!(group.is_disposed());
    assert_eq!(server.native_calls(), calls);
}

#[test]
fn test_dispose_unadvises_then_notifies_owner_once() {
    let mut owner = MockGroupOwner::new();
    owner
        .expect_remove_group()
        .with(eq(SERVER))
        .times(1)
        .returning(|_| Ok(()));
    let owner = Arc::new(owner);
    let object = fake();
    let server = object.server();
    let group = owned_group(&object, &owner);
    drop(object);

    group.on_data_change(|_| {}).unwrap();
    assert_eq!(server.advised_sinks(), 1);

    group.dispose().unwrap();
    assert_eq!(server.advised_sinks(), 0);
    assert_eq!(server.live_interfaces(), 0);
    assert_eq!(server.calls().last(), Some(&"IConnectionPoint::Unadvise"));

    group.dispose().unwrap();
    drop(group);
}

#[test]
fn test_drop_disposes() {
    let mut owner = MockGroupOwner::new();
    owner
        .expect_remove_group()
        .with(eq(SERVER))
        .times(1)
        .returning(|_| Ok(()));
    let owner = Arc::new(owner);
    let object = fake();
    let server = object.server();
    {
        let group = owned_group(&object, &owner);
        group.on_write_complete(|_| {}).unwrap();
    }
    assert_eq!(server.advised_sinks(), 0);
    assert_eq!(server.live_interfaces(), 0);
}

#[test]
fn test_owner_failure_is_reported_after_release() {
    let mut owner = MockGroupOwner::new();
    owner
        .expect_remove_group()
        .times(1)
        .returning(|_| Err(anyhow::anyhow!("session already closed")));
    let owner = Arc::new(owner);
    let object = fake();
    let server = object.server();
    let group = owned_group(&object, &owner);

    let err = group.dispose().unwrap_err();
    assert!(matches!(err, OpcError::Internal(ref msg) if msg.contains("session already closed")));
    assert!(group.is_disposed());
    assert_eq!(server.live_interfaces(), 0);
    assert!(group.dispose().is_ok());
}

#[test]
fn test_unadvise_failure_does_not_stop_disposal() {
    let mut owner = MockGroupOwner::new();
    owner.expect_remove_group().times(1).returning(|_| Ok(()));
    let owner = Arc::new(owner);
    let object = fake();
    let server = object.server();
    let group = owned_group(&object, &owner);
    group.on_data_change(|_| {}).unwrap();
    server.fail_next_call("IConnectionPoint::Unadvise", Hresult::CONNECT_E_NOCONNECTION);

    let err = group.dispose().unwrap_err();
    assert_eq!(err.code(), Some(Hresult::CONNECT_E_NOCONNECTION));
    assert_eq!(server.live_interfaces(), 0);
}

#[test]
fn test_owner_gone_is_not_an_error() {
    let owner = Arc::new(MockGroupOwner::new());
    let group = owned_group(&fake(), &owner);
    drop(owner);
    assert!(group.dispose().is_ok());
}

#[test]
fn test_attach_fails_at_attach_time_without_async_support() {
    for object in [
        fake().without_async_io(),
        fake().without_connection_points(),
    ] {
        let (group, server) = group_with(&object);
        assert!(!group.is_async_supported());
        assert!(matches!(
            group.on_data_change(|_| {}),
            Err(OpcError::NotSupported(_))
        ));
        assert!(matches!(group.event_stream(), Err(OpcError::NotSupported(_))));
        assert_eq!(server.native_calls(), 0);
    }
}

#[test]
fn test_attach_fails_without_data_callback_point() {
    let (group, server) = group_with(&fake().without_data_callback_point());
    assert!(group.is_async_supported());
    assert!(matches!(
        group.on_read_complete(|_| {}),
        Err(OpcError::NotSupported(_))
    ));
    assert_eq!(server.advised_sinks(), 0);
    assert_eq!(group.handlers.len(), 0);
}

#[test]
fn test_async_operations_not_supported_without_interface() {
    let (group, server) = group_with(&fake().without_async_io());
    let handles = add_two(&group);
    let calls = server.native_calls();

    assert!(matches!(group.async_read(&handles, 1), Err(OpcError::NotSupported(_))));
    assert!(matches!(
        group.async_write(&handles, &[Value::I4(1)], 1),
        Err(OpcError::NotSupported(_))
    ));
    assert!(matches!(
        group.async_refresh(DataSource::Cache, 1),
        Err(OpcError::NotSupported(_))
    ));
    assert!(matches!(group.async_cancel(1), Err(OpcError::NotSupported(_))));
    assert!(matches!(group.set_async_enabled(true), Err(OpcError::NotSupported(_))));
    assert!(matches!(group.async_enabled(), Err(OpcError::NotSupported(_))));
    assert_eq!(server.native_calls(), calls);

    assert_eq!(group.sync_read(DataSource::Device, &handles).unwrap().len(), 2);
}

#[test]
fn test_registration_is_lazy_and_single() {
    let (group, server) = group_with(&fake());
    assert_eq!(server.advised_sinks(), 0);

    let ids = [
        group.on_data_change(|_| {}).unwrap(),
        group.on_read_complete(|_| {}).unwrap(),
        group.on_write_complete(|_| {}).unwrap(),
        group.on_cancel_complete(|_| {}).unwrap(),
    ];
    let _events = group.event_stream().unwrap();
    let advises = server
        .calls()
        .iter()
        .filter(|call| **call == "IConnectionPoint::Advise")
        .count();
    assert_eq!(advises, 1);
    assert_eq!(server.advised_sinks(), 1);

    for id in ids {
        assert!(group.remove_handler(id));
    }
    assert!(!group.remove_handler(ids[0]));
    assert_eq!(server.advised_sinks(), 1);
}

#[test]
fn test_notification_for_other_group_is_dropped() {
    let (group, server) = group_with(&fake());
    let handles = add_two(&group);
    let (calls, spy) = counter();
    group
        .on_data_change(move |_| {
            spy.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    assert_eq!(server.deliver_data_change_as(GroupHandle(99), &handles), 1);
    assert_eq!(server.deliver_data_change_as(CLIENT, &handles), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    server.deliver_data_change(&handles);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_data_change_event_carries_decoded_values() {
    let (group, server) = group_with(&fake());
    let handles = add_two(&group);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    group
        .on_data_change(move |event| sink.lock().unwrap().push(event.clone()))
        .unwrap();

    server.set_value("Random.Int4", 7i32);
    server.deliver_data_change(&handles);

    let events = seen.lock().unwrap();
    let event = &events[0];
    assert_eq!(event.group_handle, SERVER);
    assert_eq!(event.transaction_id, 0);
    assert_eq!(event.values.len(), 2);
    assert_eq!(event.values[0].client_handle, ItemHandle(1));
    assert_eq!(event.values[0].value, Value::I4(7));
    assert_eq!(event.values[1].value, Value::R8(1.5));
    assert!(event.values[0].quality.is_good());
    assert_eq!(
        event.values[0].timestamp,
        filetime_to_datetime(FAKE_TIMESTAMP)
    );
}

#[test]
fn test_sync_read_cache_and_device() {
    let (group, _server) = group_with(&fake());
    let handles = add_two(&group);
    assert_eq!(
        group.set_active_state(&[handles[1]], false).unwrap(),
        vec![Hresult::S_OK]
    );

    let cache = group
        .sync_read(DataSource::Cache, &[handles[0], handles[1], ItemHandle(77)])
        .unwrap();
    assert_eq!(cache[0].value, Value::I4(42));
    assert_eq!(cache[0].quality, Quality::GOOD);
    assert_eq!(cache[1].quality, Quality::BAD_OUT_OF_SERVICE);
    assert_eq!(cache[2].error, Hresult::OPC_E_INVALIDHANDLE);
    assert_eq!(cache[2].value, Value::Empty);

    let device = group.sync_read(DataSource::Device, &handles).unwrap();
    assert_eq!(device[1].quality, Quality::GOOD);
    assert_eq!(device[1].value, Value::R8(1.5));
}

#[test]
fn test_sync_write_reports_per_item_results() {
    let (group, server) = group_with(&fake());
    let results = group
        .add_items(&[
            ItemDef::new("Random.Int4", ItemHandle(1)),
            ItemDef::new("Random.ReadOnly", ItemHandle(2)),
        ])
        .unwrap();
    let handles: Vec<_> = results.iter().map(|r| r.server_handle.unwrap()).collect();
    assert!(!results[1].access_rights.is_writeable());

    let written = group
        .sync_write(&handles, &[Value::I4(-5), Value::Bool(false)])
        .unwrap();
    assert_eq!(written, vec![Hresult::S_OK, Hresult::OPC_E_BADRIGHTS]);
    assert_eq!(server.value("Random.Int4"), Some(Value::I4(-5)));
    assert_eq!(server.value("Random.ReadOnly"), Some(Value::Bool(true)));
    assert_eq!(server.outstanding_buffers(), 0);
}

#[test]
fn test_mismatched_lengths_are_invalid_arguments() {
    let (group, server) = group_with(&fake());
    let handles = add_two(&group);
    let calls = server.native_calls();

    assert!(matches!(
        group.sync_write(&handles, &[Value::I4(1)]),
        Err(OpcError::InvalidArgument(_))
    ));
    assert!(matches!(
        group.set_client_handles(&handles, &[ItemHandle(5)]),
        Err(OpcError::InvalidArgument(_))
    ));
    assert!(matches!(
        group.set_data_types(&handles, &[]),
        Err(OpcError::InvalidArgument(_))
    ));
    assert!(matches!(
        group.async_write(&handles, &[], 3),
        Err(OpcError::InvalidArgument(_))
    ));
    assert_eq!(server.native_calls(), calls);
}

#[test]
fn test_unencodable_write_fails_before_native_call() {
    let (group, server) = group_with(&fake());
    let handles = add_two(&group);
    let calls = server.native_calls();

    let mixed = Value::Array(ArrayValue::new(
        VarType::I4,
        vec![Value::I4(1), Value::from("two")],
    ));
    assert!(matches!(
        group.sync_write(&handles[..1], &[mixed]),
        Err(OpcError::InvalidArgument(_))
    ));
    assert_eq!(server.native_calls(), calls);
}

#[test]
fn test_native_failure_propagates_and_releases_nothing() {
    let (group, server) = group_with(&fake());
    server.fail_next_call("IOPCItemMgt::AddItems", Hresult::E_FAIL);

    let err = group
        .add_items(&[ItemDef::new("Random.Int4", ItemHandle(1))])
        .unwrap_err();
    assert_eq!(err.code(), Some(Hresult::E_FAIL));
    assert!(err.to_string().contains("IOPCItemMgt::AddItems"));
    assert_eq!(server.outstanding_buffers(), 0);
}

#[test]
fn test_short_buffer_fails_and_is_still_released() {
    let (group, server) = group_with(&fake());
    let handles = add_two(&group);
    server.truncate_next_buffer();

    let err = group.sync_read(DataSource::Device, &handles).unwrap_err();
    assert!(matches!(err, OpcError::Conversion(_)));
    assert_eq!(server.outstanding_buffers(), 0);
}

#[test]
fn test_padded_buffers_are_read_up_to_count() {
    let (group, server) = group_with(&fake().with_buffer_padding(3));
    let handles = add_two(&group);

    let values = group.sync_read(DataSource::Device, &handles).unwrap();
    assert_eq!(values.len(), 2);
    assert_eq!(group.remove_items(&handles).unwrap().len(), 2);
    assert_eq!(server.outstanding_buffers(), 0);
}

#[test]
fn test_set_client_handles_and_data_types() {
    let (group, server) = group_with(&fake());
    let handles = add_two(&group);

    assert_eq!(
        group
            .set_client_handles(&handles, &[ItemHandle(100), ItemHandle(200)])
            .unwrap(),
        vec![Hresult::S_OK, Hresult::S_OK]
    );
    let values = group.sync_read(DataSource::Cache, &handles).unwrap();
    assert_eq!(values[0].client_handle, ItemHandle(100));
    assert_eq!(values[1].client_handle, ItemHandle(200));

    assert_eq!(
        group
            .set_data_types(&handles, &[VarType::R8, VarType::DISPATCH])
            .unwrap(),
        vec![Hresult::S_OK, Hresult::OPC_E_BADTYPE]
    );
    assert_eq!(server.requested_type(handles[0]), Some(VarType::R8));
    assert_eq!(server.requested_type(handles[1]), Some(VarType::EMPTY));
}

#[test]
fn test_async_read_completes_with_transaction_id() {
    let (group, server) = group_with(&fake());
    let handles = add_two(&group);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    group
        .on_read_complete(move |event| sink.lock().unwrap().push(event.clone()))
        .unwrap();

    let request = group
        .async_read(&[handles[0], ItemHandle(55)], 77)
        .unwrap();
    assert_eq!(
        request.results,
        vec![Hresult::S_OK, Hresult::OPC_E_INVALIDHANDLE]
    );
    assert!(seen.lock().unwrap().is_empty());

    assert_eq!(server.complete_transactions(), 1);
    let events = seen.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].transaction_id, 77);
    assert_eq!(events[0].values.len(), 1);
    assert_eq!(events[0].values[0].value, Value::I4(42));
}

#[test]
fn test_async_write_completion_pairs_client_handles() {
    let (group, server) = group_with(&fake());
    let handles = add_two(&group);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    group
        .on_write_complete(move |event| sink.lock().unwrap().push(event.clone()))
        .unwrap();

    let request = group
        .async_write(&handles, &[Value::I4(3), Value::R8(0.25)], 5)
        .unwrap();
    assert_eq!(request.results, vec![Hresult::S_OK, Hresult::S_OK]);
    assert_eq!(server.value("Random.Int4"), Some(Value::I4(42)));

    server.complete_transactions();
    let events = seen.lock().unwrap();
    assert_eq!(events[0].transaction_id, 5);
    assert_eq!(
        events[0].results,
        vec![
            (ItemHandle(1), Hresult::S_OK),
            (ItemHandle(2), Hresult::S_OK)
        ]
    );
    assert_eq!(server.value("Random.Real8"), Some(Value::R8(0.25)));
}

#[test]
fn test_refresh_and_cancel() {
    let (group, server) = group_with(&fake());
    let (reads, read_spy) = counter();
    let cancelled = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&cancelled);
    group
        .on_read_complete(move |_| {
            read_spy.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    group
        .on_cancel_complete(move |event| sink.lock().unwrap().push(*event))
        .unwrap();

    let err = group.async_refresh(DataSource::Cache, 1).unwrap_err();
    assert_eq!(err.code(), Some(Hresult::E_FAIL));

    add_two(&group);
    let cancel_id = group.async_refresh(DataSource::Device, 9).unwrap();
    group.async_cancel(cancel_id).unwrap();
    assert!(group.async_cancel(cancel_id).is_err());

    server.complete_transactions();
    assert_eq!(reads.load(Ordering::SeqCst), 0);
    assert_eq!(
        *cancelled.lock().unwrap(),
        vec![CancelCompleteEvent {
            group_handle: SERVER,
            transaction_id: 9
        }]
    );

    group.async_refresh(DataSource::Device, 10).unwrap();
    server.complete_transactions();
    assert_eq!(reads.load(Ordering::SeqCst), 1);
}

#[test]
fn test_async_enable_round_trip() {
    let (group, server) = group_with(&fake());
    assert!(group.async_enabled().unwrap());
    group.set_async_enabled(false).unwrap();
    assert!(!server.is_enabled());
    assert!(!group.async_enabled().unwrap());
}

#[test]
fn test_panicking_handler_is_contained() {
    init_tracing();
    let (group, server) = group_with(&fake());
    let handles = add_two(&group);
    let (calls, spy) = counter();
    group.on_data_change(|_| panic!("handler bug")).unwrap();
    group
        .on_data_change(move |_| {
            spy.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    server.deliver_data_change(&handles);
    server.deliver_data_change(&handles);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_concurrent_attach_and_delivery() {
    let (group, server) = group_with(&fake());
    let handles = add_two(&group);
    let (calls, spy) = counter();
    group
        .on_data_change(move |_| {
            spy.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    std::thread::scope(|scope| {
        for _ in 0..4 {
            let server = server.clone();
            let handles = handles.clone();
            scope.spawn(move || {
                for _ in 0..50 {
                    server.deliver_data_change(&handles);
                }
            });
        }
        for _ in 0..50 {
            let id = group.on_data_change(|_| {}).unwrap();
            assert!(group.remove_handler(id));
        }
    });

    assert_eq!(calls.load(Ordering::SeqCst), 200);
    assert_eq!(server.advised_sinks(), 1);
    assert_eq!(group.handlers.len(), 1);
}

#[test]
fn test_construction_requires_sync_io() {
    let object = fake().without_sync_io();
    let server = object.server();
    let err = Group::new(params(), &object, Weak::<MockGroupOwner>::new()).unwrap_err();
    assert_eq!(err.code(), Some(Hresult::E_NOINTERFACE));
    assert_eq!(server.live_interfaces(), 0);
}

#[test]
fn test_dispose_leaves_nothing_alive() {
    let (group, server) = group_with(&fake());
    let handles = add_two(&group);
    group.on_data_change(|_| {}).unwrap();
    group.sync_read(DataSource::Cache, &handles).unwrap();
    group.async_read(&handles, 1).unwrap();

    group.dispose().unwrap();
    assert_eq!(server.live_interfaces(), 0);
    assert_eq!(server.outstanding_buffers(), 0);
    assert_eq!(server.advised_sinks(), 0);
}

#[test]
fn test_accessors() {
    let (group, _server) = group_with(&fake());
    assert_eq!(group.client_handle(), CLIENT);
    assert_eq!(group.server_handle(), SERVER);
    assert_eq!(group.name(), "FakeGroup");
    assert_eq!(group.update_rate(), 1000);
    assert!(group.is_async_supported());
    assert!(!group.is_disposed());
    assert_eq!(group.properties().unwrap().server_handle, SERVER);
}

#[tokio::test]
async fn test_event_stream_yields_every_kind() {
    let (group, server) = group_with(&fake());
    let handles = add_two(&group);
    let mut events = group.event_stream().unwrap();

    server.deliver_data_change(&handles);
    group.async_read(&handles, 1).unwrap();
    group.async_write(&handles[..1], &[Value::I4(8)], 2).unwrap();
    let cancel_id = group.async_refresh(DataSource::Cache, 3).unwrap();
    group.async_cancel(cancel_id).unwrap();
    server.complete_transactions();

    assert!(matches!(
        events.recv().await,
        Some(GroupEvent::DataChange(DataChangeEvent { transaction_id: 0, .. }))
    ));
    assert!(matches!(
        events.recv().await,
        Some(GroupEvent::ReadComplete(DataChangeEvent { transaction_id: 1, .. }))
    ));
    assert!(matches!(
        events.recv().await,
        Some(GroupEvent::WriteComplete(WriteCompleteEvent { transaction_id: 2, .. }))
    ));
    assert!(matches!(
        events.recv().await,
        Some(GroupEvent::CancelComplete(CancelCompleteEvent { transaction_id: 3, .. }))
    ));
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_event_stream_detaches_when_dropped() {
    let (group, server) = group_with(&fake());
    let handles = add_two(&group);
    let events = group.event_stream().unwrap();
    assert_eq!(group.handlers.len(), 4);

    drop(events);
    server.deliver_data_change(&handles);
    assert_eq!(group.handlers.len(), 0);
    assert_eq!(server.advised_sinks(), 1);
}

#[tokio::test]
async fn test_event_stream_ends_at_dispose() {
    let (group, server) = group_with(&fake());
    let handles = add_two(&group);
    let mut events = group.event_stream().unwrap();
    server.deliver_data_change(&handles);

    group.dispose().unwrap();

    assert_eq!(group.handlers.len(), 0);
    assert!(matches!(events.recv().await, Some(GroupEvent::DataChange(_))));
    assert!(events.recv().await.is_none());
}
