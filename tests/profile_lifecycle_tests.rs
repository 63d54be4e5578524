use profilestore::{
    LoadParams, MockOperation, MockRemoteStore, ProfileState, ProfileStore, RemoteError,
    SessionEndReason, StoreConfig, StoreError, StoreManager,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

fn template() -> serde_json::Value {
    json!({
        "coins": 0,
        "inventory": {"sword": 1},
        "settings": {"music": true},
    })
}

async fn open_store(remote: &MockRemoteStore, config: StoreConfig) -> ProfileStore {
    let manager = StoreManager::new(Arc::new(remote.clone()), config).unwrap();
    manager.create("Players", template()).await.unwrap()
}

#[tokio::test]
async fn first_load_creates_record_from_template() {
    let remote = MockRemoteStore::new();
    let store = open_store(&remote, StoreConfig::default()).await;

    let profile = store
        .load_profile_async("A", LoadParams::new())
        .await
        .unwrap();

    assert_eq!(profile.state(), ProfileState::Active);
    assert_eq!(serde_json::Value::Object(profile.data()), template());
    assert!(profile.meta().created_at.is_some());

    let stored = remote.raw(&store.remote_key("A")).unwrap();
    assert_eq!(stored["data"], template());
    assert_eq!(stored["meta"]["load_count"], json!(1));

    profile.with_data_mut(|data| {
        data["inventory"]["sword"] = json!(2);
    })
    .unwrap();
    assert_eq!(store.template()["inventory"]["sword"], json!(1));
    profile.end_session().await.unwrap();
}

#[tokio::test]
async fn concurrent_loads_share_one_pending_task() {
    let remote = MockRemoteStore::new().with_latency(Duration::from_millis(20));
    let store = open_store(&remote, StoreConfig::default()).await;

    let first = store.load_profile_async("A", LoadParams::new());
    let second = store.load_profile_async("A", LoadParams::new());
    assert!(first.ptr_eq(&second));

    let a = first.await.unwrap();
    let b = second.await.unwrap();
    assert!(a.ptr_eq(&b));
    assert_eq!(
        remote.raw(&store.remote_key("A")).unwrap()["meta"]["load_count"],
        json!(1)
    );

    let err = store
        .load_profile_async("A", LoadParams::new())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::SessionLocked { .. }));
    a.end_session().await.unwrap();
}

#[tokio::test]
async fn end_session_twice_saves_and_notifies_once() {
    let remote = MockRemoteStore::new();
    let store = open_store(&remote, StoreConfig::default()).await;
    let profile = store
        .load_profile_async("A", LoadParams::new())
        .await
        .unwrap();
    let remote_key = store.remote_key("A");

    let notifications = Arc::new(AtomicUsize::new(0));
    let counter = notifications.clone();
    profile.listen_to_release(move |reason| {
        assert_eq!(reason, SessionEndReason::Released);
        counter.fetch_add(1, Ordering::SeqCst);
    });

    profile.set("coins", json!(40)).unwrap();
    let version_before = remote.version(&remote_key).unwrap();
    profile.end_session().await.unwrap();
    profile.end_session().await.unwrap();

    assert_eq!(remote.version(&remote_key), Some(version_before + 1));
    assert_eq!(notifications.load(Ordering::SeqCst), 1);
    let stored = remote.raw(&remote_key).unwrap();
    assert_eq!(stored["data"]["coins"], json!(40));
    assert_eq!(stored["meta"]["session"], json!(null));
    assert!(store.active_profile("A").is_none());

    let late = Arc::new(AtomicBool::new(false));
    let late_flag = late.clone();
    assert!(profile.listen_to_release(move |_| late_flag.store(true, Ordering::SeqCst)));
    assert!(late.load(Ordering::SeqCst));
    assert_eq!(profile.session_ended().await, SessionEndReason::Released);
}

#[tokio::test]
async fn save_on_ended_profile_leaves_remote_untouched() {
    let remote = MockRemoteStore::new();
    let store = open_store(&remote, StoreConfig::default()).await;
    let profile = store
        .load_profile_async("A", LoadParams::new())
        .await
        .unwrap();
    profile.end_session().await.unwrap();
    let stored = remote.raw(&store.remote_key("A"));

    let err = profile.save().await.unwrap_err();
    assert_eq!(err, StoreError::ProfileNotActive("A".to_string()));
    assert_eq!(remote.raw(&store.remote_key("A")), stored);
}

#[tokio::test]
async fn reconcile_fills_missing_fields_only() {
    let remote = MockRemoteStore::new();
    remote.set_raw(
        "Players/A",
        json!({"data": {"coins": 9, "inventory": "legacy"}, "meta": {}}),
    );
    let store = open_store(&remote, StoreConfig::default()).await;
    let profile = store
        .load_profile_async("A", LoadParams::new())
        .await
        .unwrap();
    assert!(profile.get("settings").is_none());

    assert!(profile.reconcile().unwrap());
    assert!(!profile.reconcile().unwrap());
    assert_eq!(
        serde_json::Value::Object(profile.data()),
        json!({"coins": 9, "inventory": "legacy", "settings": {"music": true}})
    );
    profile.end_session().await.unwrap();
}

#[tokio::test]
async fn reconcile_on_load_is_opt_in() {
    let remote = MockRemoteStore::new();
    remote.set_raw("Players/A", json!({"data": {"coins": 3}}));
    let store = open_store(&remote, StoreConfig::default()).await;

    let profile = store
        .load_profile_async("A", LoadParams::new().reconcile(true))
        .await
        .unwrap();
    assert_eq!(profile.get("coins"), Some(json!(3)));
    assert_eq!(profile.get("settings"), Some(json!({"music": true})));
    profile.end_session().await.unwrap();
}

#[tokio::test]
async fn vanished_requester_releases_lock() {
    let remote = MockRemoteStore::new();
    let store = open_store(&remote, StoreConfig::default()).await;

    let err = store
        .load_profile_async("A", LoadParams::new().with_requester(|| false))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Cancelled(_)));
    assert!(store.active_profile("A").is_none());
    assert_eq!(
        remote.raw(&store.remote_key("A")).unwrap()["meta"]["session"],
        json!(null)
    );

    let profile = store
        .load_profile_async("A", LoadParams::new())
        .await
        .unwrap();
    profile.end_session().await.unwrap();
}

#[tokio::test]
async fn cancelled_load_still_completes_and_releases() {
    let remote = MockRemoteStore::new().with_latency(Duration::from_millis(20));
    let store = open_store(&remote, StoreConfig::default()).await;

    let load = store.load_profile_async("A", LoadParams::new());
    load.cancel();
    assert!(matches!(load.clone().await, Err(StoreError::Cancelled(_))));

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let released = remote
                .raw(&store.remote_key("A"))
                .is_some_and(|value| value["meta"]["session"].is_null());
            if released && store.active_profile("A").is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn view_mode_reads_without_locking() {
    let remote = MockRemoteStore::new();
    let store = open_store(&remote, StoreConfig::default()).await;
    assert!(store.view_profile("A").await.unwrap().is_none());

    let profile = store
        .load_profile_async("A", LoadParams::new())
        .await
        .unwrap();
    profile.set("coins", json!(5)).unwrap();
    profile.save().await.unwrap();
    let saved_version = profile.last_saved_version();
    profile.set("coins", json!(6)).unwrap();
    profile.end_session().await.unwrap();

    let latest = store.view_profile("A").await.unwrap().unwrap();
    assert_eq!(latest.data()["coins"], json!(6));
    assert!(!latest.has_session());

    let older = store
        .view_profile_version("A", Some(saved_version))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(older.data()["coins"], json!(5));
    assert!(older.has_session());
    assert_eq!(older.version(), saved_version);
}

#[tokio::test]
async fn metadata_round_trips_through_saves() {
    let remote = MockRemoteStore::new();
    let store = open_store(&remote, StoreConfig::default()).await;
    let profile = store
        .load_profile_async("A", LoadParams::new())
        .await
        .unwrap();

    profile.add_user_id(1001).unwrap();
    profile.add_user_id(1001).unwrap();
    profile.add_user_id(1002).unwrap();
    profile.remove_user_id(1002).unwrap();
    profile.set_tag("region", json!("eu")).unwrap();
    profile.end_session().await.unwrap();

    let view = store.view_profile("A").await.unwrap().unwrap();
    assert_eq!(view.meta().user_ids, vec![1001]);
    assert_eq!(view.meta().tags.get("region"), Some(&json!("eu")));
    assert!(view.meta().last_saved_at.is_some());
}

#[tokio::test]
async fn wipe_refuses_active_profiles() {
    let remote = MockRemoteStore::new();
    let store = open_store(&remote, StoreConfig::default()).await;
    let profile = store
        .load_profile_async("A", LoadParams::new())
        .await
        .unwrap();

    assert!(matches!(
        store.wipe_profile("A").await,
        Err(StoreError::SessionLocked { .. })
    ));
    profile.end_session().await.unwrap();

    store.wipe_profile("A").await.unwrap();
    assert!(remote.raw(&store.remote_key("A")).is_none());
    store.wipe_profile("A").await.unwrap();
}

#[tokio::test]
async fn invalid_keys_reject_without_remote_calls() {
    let remote = MockRemoteStore::new();
    let store = open_store(&remote, StoreConfig::default()).await;
    let requests = remote.request_count();

    let err = store
        .load_profile_async("", LoadParams::new())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidKey(_)));
    assert_eq!(remote.request_count(), requests);
}

#[tokio::test]
async fn failed_final_save_still_releases_and_notifies() {
    let remote = MockRemoteStore::new();
    let store = open_store(&remote, StoreConfig::default()).await;
    let remote_key = store.remote_key("A");
    let profile = store
        .load_profile_async("A", LoadParams::new())
        .await
        .unwrap();

    let reasons = Arc::new(Mutex::new(Vec::new()));
    {
        let reasons = reasons.clone();
        profile.listen_to_release(move |reason| reasons.lock().unwrap().push(reason));
    }
    profile.set("coins", json!(99)).unwrap();
    remote.inject_failure(MockOperation::Put, 1, RemoteError::permanent("quota exceeded"));

    let err = profile.end_session().await.unwrap_err();
    let expected = StoreError::NonRetryable("quota exceeded".to_string());
    assert_eq!(err, expected);
    assert_eq!(profile.state(), ProfileState::Ended);
    assert_eq!(
        *reasons.lock().unwrap(),
        vec![SessionEndReason::Failed(expected)]
    );

    let stored = remote.raw(&remote_key).unwrap();
    assert_eq!(stored["meta"]["session"], json!(null));
    assert_eq!(stored["data"]["coins"], json!(0));
    assert!(store.active_profile("A").is_none());
    assert!(profile.end_session().await.is_ok());
}

#[tokio::test]
async fn non_retryable_load_failure_clears_in_flight_entry() {
    let remote = MockRemoteStore::new();
    let store = open_store(&remote, StoreConfig::default()).await;
    remote.inject_failure(MockOperation::Put, 1, RemoteError::permanent("permission denied"));

    let failed = store.load_profile_async("A", LoadParams::new());
    assert_eq!(
        failed.clone().await.unwrap_err(),
        StoreError::NonRetryable("permission denied".to_string())
    );
    assert!(store.active_profile("A").is_none());
    assert!(remote.raw(&store.remote_key("A")).is_none());

    let retried = store.load_profile_async("A", LoadParams::new());
    assert!(!retried.ptr_eq(&failed));
    let profile = retried.await.unwrap();
    assert_eq!(profile.meta().load_count, 1);
    profile.end_session().await.unwrap();
}
