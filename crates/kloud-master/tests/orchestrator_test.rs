// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the server orchestrator against the mock runtime and in-memory store.

mod common;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use common::{TestContext, dynamic_template, static_template, wait_for};
use kloud_core::{
    Channel, CloudEvent, InMemoryStore, PrivateGame, ServerData, ServerInstance, ServerKind,
    ServerState, StateStore, Template,
};
use kloud_master::Error;
use kloud_master::runner::MockRuntime;
use kloud_master::runtime::KloudRuntime;
use kloud_master::template_registry::{TemplateRegistry, default_images};
use uuid::Uuid;

fn fleet() -> Vec<Template> {
    vec![
        static_template("proxy", ServerKind::Proxy),
        dynamic_template("lobby", 1, 1),
        dynamic_template("bedwars", 0, 5),
    ]
}

#[tokio::test]
async fn test_dynamic_names_use_lowest_free_suffix() {
    let ctx = TestContext::new(fleet());
    let bedwars = ctx.template("bedwars");

    let first = ctx
        .orchestrator
        .create_server(&bedwars, ServerData::default())
        .await
        .unwrap();
    let second = ctx
        .orchestrator
        .create_server(&bedwars, ServerData::default())
        .await
        .unwrap();

    let names: Vec<String> = ctx.records().await.into_iter().map(|s| s.server_name).collect();
    assert_eq!(names, ["bedwars-1", "bedwars-2"]);

    ctx.orchestrator.stop_server(&first).await.unwrap();
    assert!(ctx.wait_for_removal(&first).await);

    let third = ctx
        .orchestrator
        .create_server(&bedwars, ServerData::default())
        .await
        .unwrap();
    let record = ctx.store.get(&third).await.unwrap().unwrap();
    assert_eq!(record.server_name, "bedwars-1");
    assert_ne!(third, first);
    assert!(ctx.store.get(&second).await.unwrap().is_some());
}

#[tokio::test]
async fn test_static_template_rejects_second_instance() {
    let ctx = TestContext::new(fleet());
    let proxy = ctx.template("proxy");

    let id = ctx
        .orchestrator
        .create_server(&proxy, ServerData::default())
        .await
        .unwrap();
    let record = ctx.store.get(&id).await.unwrap().unwrap();
    assert_eq!(record.server_name, "proxy");

    let err = ctx
        .orchestrator
        .create_server(&proxy, ServerData::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(ref t) if t == "proxy"));
    assert_eq!(ctx.records().await.len(), 1);
}

#[tokio::test]
async fn test_concurrent_static_creates_produce_one_record() {
    let ctx = TestContext::new(fleet());
    let proxy = ctx.template("proxy");

    let (a, b) = tokio::join!(
        ctx.orchestrator.create_server(&proxy, ServerData::default()),
        ctx.orchestrator.create_server(&proxy, ServerData::default()),
    );

    assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
    let err = a.err().or(b.err()).unwrap();
    assert!(matches!(err, Error::AlreadyExists(_)));
    assert_eq!(ctx.records().await.len(), 1);
    assert_eq!(ctx.orchestrator.pending("proxy").await, 0);
}

#[tokio::test]
async fn test_limit_reached_at_max_instances() {
    let ctx = TestContext::new(fleet());
    let lobby = ctx.template("lobby");

    ctx.orchestrator
        .create_server(&lobby, ServerData::default())
        .await
        .unwrap();
    let err = ctx
        .orchestrator
        .create_server(&lobby, ServerData::default())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::LimitReached { ref template, max: 1 } if template == "lobby"));
    assert_eq!(ctx.records().await.len(), 1);
}

#[tokio::test]
async fn test_concurrent_dynamic_creates_respect_max() {
    let ctx = TestContext::new(vec![dynamic_template("skywars", 0, 2)]);
    let skywars = ctx.template("skywars");

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let orchestrator = ctx.orchestrator.clone();
            let template = skywars.clone();
            tokio::spawn(async move {
                orchestrator
                    .create_server(&template, ServerData::default())
                    .await
            })
        })
        .collect();

    let mut created = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => created += 1,
            Err(e) => assert!(matches!(e, Error::LimitReached { max: 2, .. })),
        }
    }
    assert_eq!(created, 2);

    let names: HashSet<String> = ctx.records().await.into_iter().map(|s| s.server_name).collect();
    assert_eq!(
        names,
        HashSet::from(["skywars-1".to_string(), "skywars-2".to_string()])
    );
}

#[tokio::test]
async fn test_failed_create_leaves_no_record() {
    let ctx = TestContext::with_runtime(fleet(), MockRuntime::failing());
    let lobby = ctx.template("lobby");

    let err = ctx
        .orchestrator
        .create_server(&lobby, ServerData::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Runtime(_)));
    assert!(ctx.records().await.is_empty());
    assert_eq!(ctx.orchestrator.pending("lobby").await, 0);
    assert!(ctx.store.published().await.is_empty());

    // The failed attempt neither consumed the slot nor the suffix.
    ctx.runtime.set_fail_create(false);
    let id = ctx
        .orchestrator
        .create_server(&lobby, ServerData::default())
        .await
        .unwrap();
    assert_eq!(ctx.store.get(&id).await.unwrap().unwrap().server_name, "lobby-1");
}

#[tokio::test]
async fn test_unknown_instance_is_rejected_without_container_operations() {
    let ctx = TestContext::new(fleet());

    assert!(matches!(
        ctx.orchestrator.stop_server("missing").await,
        Err(Error::InstanceNotFound(_))
    ));
    assert!(matches!(
        ctx.orchestrator.restart_server("missing").await,
        Err(Error::InstanceNotFound(_))
    ));
    assert!(matches!(
        ctx.orchestrator
            .update_server("missing", ServerData::default())
            .await,
        Err(Error::InstanceNotFound(_))
    ));
    assert!(ctx.runtime.operations().await.is_empty());
}

#[tokio::test]
async fn test_lifecycle_events_are_published_in_order() {
    let ctx = TestContext::new(fleet());
    let bedwars = ctx.template("bedwars");

    let id = ctx
        .orchestrator
        .create_server(&bedwars, ServerData::default())
        .await
        .unwrap();
    assert!(ctx.wait_for_state(&id, ServerState::Running).await);

    ctx.orchestrator.stop_server(&id).await.unwrap();
    assert!(ctx.wait_for_removal(&id).await);
    assert!(ctx.wait_for_state(&id, ServerState::Gone).await);

    assert_eq!(
        ctx.states_of(&id).await,
        [
            ServerState::Starting,
            ServerState::Running,
            ServerState::Stopping,
            ServerState::Gone,
        ]
    );
    assert!(ctx.runtime.container_ids().await.is_empty());
}

#[tokio::test]
async fn test_stop_before_ready_never_reports_running() {
    let runtime = MockRuntime::new();
    runtime.set_emit_ready(false);
    let ctx = TestContext::with_runtime(fleet(), runtime);
    let bedwars = ctx.template("bedwars");

    let id = ctx
        .orchestrator
        .create_server(&bedwars, ServerData::default())
        .await
        .unwrap();
    ctx.orchestrator.stop_server(&id).await.unwrap();
    assert!(ctx.wait_for_state(&id, ServerState::Gone).await);

    let states = ctx.states_of(&id).await;
    assert!(!states.contains(&ServerState::Running));
    assert_eq!(states.last(), Some(&ServerState::Gone));
}

#[tokio::test]
async fn test_update_server_replaces_data() {
    let ctx = TestContext::new(fleet());
    let bedwars = ctx.template("bedwars");
    let id = ctx
        .orchestrator
        .create_server(&bedwars, ServerData::default())
        .await
        .unwrap();

    let data = ServerData {
        private_game: None,
        extra_data: BTreeMap::from([("map".to_string(), "castle".to_string())]),
    };
    let updated = ctx
        .orchestrator
        .update_server(&id, data.clone())
        .await
        .unwrap();
    assert_eq!(updated.server_data, data);

    let stored = ctx.store.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.server_data, data);
    assert_eq!(stored.container_id, updated.container_id);
    assert_eq!(
        ctx.runtime
            .operations()
            .await
            .iter()
            .filter(|op| op.starts_with("create:"))
            .count(),
        1
    );
}

#[tokio::test]
async fn test_restart_recreates_from_snapshot_with_same_data() {
    let ctx = TestContext::new(fleet());
    let bedwars = ctx.template("bedwars");
    let host = Uuid::new_v4();
    let data = ServerData {
        private_game: Some(PrivateGame { host }),
        extra_data: BTreeMap::new(),
    };

    let old = ctx
        .orchestrator
        .create_server(&bedwars, data.clone())
        .await
        .unwrap();
    assert!(ctx.wait_for_state(&old, ServerState::Running).await);

    ctx.orchestrator.restart_server(&old).await.unwrap();
    assert!(ctx.wait_for_removal(&old).await);

    let (ctx_ref, old_ref) = (&ctx, &old);
    let replaced = wait_for(Duration::from_secs(5), || async move {
        ctx_ref
            .records()
            .await
            .iter()
            .any(|s| &s.internal_id != old_ref)
    })
    .await;
    assert!(replaced);

    let records = ctx.records().await;
    assert_eq!(records.len(), 1);
    assert_ne!(records[0].internal_id, old);
    assert_eq!(records[0].server_name, "bedwars-1");
    assert_eq!(records[0].server_data, data);
    assert_eq!(ctx.states_of(&old).await.last(), Some(&ServerState::Gone));
}

#[tokio::test]
async fn test_failed_start_tears_instance_down() {
    let runtime = MockRuntime::new();
    runtime.set_fail_start(true);
    let ctx = TestContext::with_runtime(fleet(), runtime);
    let bedwars = ctx.template("bedwars");

    let id = ctx
        .orchestrator
        .create_server(&bedwars, ServerData::default())
        .await
        .unwrap();
    assert!(ctx.wait_for_removal(&id).await);
    assert!(ctx.wait_for_state(&id, ServerState::Gone).await);
    assert!(!ctx.running_dir.join(&id).exists());
}

#[tokio::test]
async fn test_sweep_removes_dead_instance_once() {
    let ctx = TestContext::new(fleet());
    let bedwars = ctx.template("bedwars");
    let id = ctx
        .orchestrator
        .create_server(&bedwars, ServerData::default())
        .await
        .unwrap();
    assert!(ctx.wait_for_state(&id, ServerState::Running).await);

    // A healthy fleet is left alone.
    assert_eq!(ctx.orchestrator.sweep_dead_instances().await.unwrap(), 0);

    let container_id = ctx.store.get(&id).await.unwrap().unwrap().container_id;
    assert!(ctx.runtime.kill(&container_id).await);

    assert_eq!(ctx.orchestrator.sweep_dead_instances().await.unwrap(), 1);
    assert_eq!(ctx.orchestrator.sweep_dead_instances().await.unwrap(), 0);
    assert!(ctx.store.get(&id).await.unwrap().is_none());

    let gone = ctx
        .states_of(&id)
        .await
        .into_iter()
        .filter(|s| *s == ServerState::Gone)
        .count();
    assert_eq!(gone, 1);
}

#[tokio::test]
async fn test_stop_racing_sweep_keeps_reused_port_claimed() {
    let ctx = TestContext::new(fleet());
    let bedwars = ctx.template("bedwars");
    let gate = ctx.runtime.hold_stops().await;

    let first = ctx
        .orchestrator
        .create_server(&bedwars, ServerData::default())
        .await
        .unwrap();
    assert!(ctx.wait_for_state(&first, ServerState::Running).await);
    let first = ctx.store.get(&first).await.unwrap().unwrap();

    // The stop hangs while the container dies and the sweep tears it down.
    ctx.orchestrator
        .stop_server(&first.internal_id)
        .await
        .unwrap();
    assert!(ctx.runtime.kill(&first.container_id).await);
    assert_eq!(ctx.orchestrator.sweep_dead_instances().await.unwrap(), 1);

    // The freed port goes to the next instance.
    let second = ctx
        .orchestrator
        .create_server(&bedwars, ServerData::default())
        .await
        .unwrap();
    let second = ctx.store.get(&second).await.unwrap().unwrap();
    assert_eq!(second.connection_port, first.connection_port);

    gate.notify_one();
    let stop_op = format!("stop:{}", first.container_id);
    let ctx_ref = &ctx;
    let stop_op_ref = &stop_op;
    assert!(
        wait_for(Duration::from_secs(5), || async move {
            ctx_ref.runtime.operations().await.contains(stop_op_ref)
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let next = ctx.orchestrator.launcher().ports().allocate().unwrap();
    assert_ne!(next, second.connection_port);
    let gone = ctx
        .states_of(&first.internal_id)
        .await
        .into_iter()
        .filter(|s| *s == ServerState::Gone)
        .count();
    assert_eq!(gone, 1);
    assert!(ctx.store.get(&second.internal_id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_lifecycle_tracking_does_not_grow_with_churn() {
    let ctx = TestContext::new(fleet());
    let bedwars = ctx.template("bedwars");

    for _ in 0..5 {
        let id = ctx
            .orchestrator
            .create_server(&bedwars, ServerData::default())
            .await
            .unwrap();
        assert!(ctx.wait_for_state(&id, ServerState::Running).await);
        assert_eq!(ctx.orchestrator.tracked_instances().await, 1);

        ctx.orchestrator.stop_server(&id).await.unwrap();
        assert!(ctx.wait_for_state(&id, ServerState::Gone).await);
        assert_eq!(ctx.orchestrator.tracked_instances().await, 0);
    }
}

#[tokio::test]
async fn test_sweep_removes_exited_containers() {
    let ctx = TestContext::new(fleet());
    let bedwars = ctx.template("bedwars");
    let id = ctx
        .orchestrator
        .create_server(&bedwars, ServerData::default())
        .await
        .unwrap();
    assert!(ctx.wait_for_state(&id, ServerState::Running).await);

    let container_id = ctx.store.get(&id).await.unwrap().unwrap().container_id;
    ctx.runtime.exit(&container_id).await;

    assert_eq!(ctx.orchestrator.sweep_dead_instances().await.unwrap(), 1);
    assert!(ctx.store.get(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_killed_lobby_is_replaced_under_same_name() {
    let ctx = TestContext::new(fleet());

    for handle in ctx.orchestrator.reconcile_once().await.unwrap() {
        handle.await.unwrap().unwrap();
    }
    let records = ctx.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].server_name, "lobby-1");
    let old = records[0].clone();
    assert!(ctx.wait_for_state(&old.internal_id, ServerState::Running).await);

    // At minimum: nothing to do.
    assert!(ctx.orchestrator.reconcile_once().await.unwrap().is_empty());

    ctx.runtime.kill(&old.container_id).await;
    for handle in ctx.orchestrator.reconcile_once().await.unwrap() {
        handle.await.unwrap().unwrap();
    }

    let records = ctx.records().await;
    assert_eq!(records.len(), 1);
    assert_ne!(records[0].internal_id, old.internal_id);
    assert_eq!(records[0].server_name, "lobby-1");
}

#[tokio::test]
async fn test_scale_up_issues_one_creation_per_missing_instance() {
    let ctx = TestContext::new(vec![dynamic_template("duels", 3, 10)]);

    let handles = ctx.orchestrator.scale_up().await.unwrap();
    assert_eq!(handles.len(), 3);
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let names: Vec<String> = ctx.records().await.into_iter().map(|s| s.server_name).collect();
    assert_eq!(names, ["duels-1", "duels-2", "duels-3"]);
}

#[tokio::test]
async fn test_startup_clears_previous_run_and_creates_statics() {
    let ctx = TestContext::new(fleet());

    // Leftovers from a previous run.
    ctx.runtime.insert_managed("stale_container", "stale-id").await;
    let mut stale = static_template("proxy", ServerKind::Proxy);
    stale.forced_port = None;
    ctx.store
        .save(&ServerInstance {
            internal_id: "stale-id".to_string(),
            container_id: "stale_container".to_string(),
            server_name: "proxy".to_string(),
            template: stale,
            server_data: ServerData::default(),
            connection_port: 30000,
        })
        .await
        .unwrap();
    std::fs::create_dir_all(ctx.running_dir.join("stale-id")).unwrap();

    ctx.orchestrator.startup().await.unwrap();

    let operations = ctx.runtime.operations().await;
    assert!(operations.contains(&"stop:stale_container".to_string()));
    assert!(operations.contains(&"remove:stale_container".to_string()));
    assert!(!ctx.running_dir.join("stale-id").exists());
    assert_eq!(ctx.states_of("stale-id").await, [ServerState::Gone]);

    // Statics are created right away; dynamic templates wait for the reconciler.
    let records = ctx.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].server_name, "proxy");
    assert_ne!(records[0].internal_id, "stale-id");

    let published = ctx.store.published().await;
    assert_eq!(
        published.last(),
        Some(&(Channel::Cloud, CloudEvent::CloudStarted))
    );

    ctx.orchestrator.shutdown().await.unwrap();
    assert!(ctx.records().await.is_empty());
    assert!(ctx.runtime.container_ids().await.is_empty());
    assert!(
        ctx.store
            .published()
            .await
            .contains(&(Channel::Cloud, CloudEvent::CloudStopped))
    );
}

#[tokio::test]
async fn test_startup_is_repeatable() {
    let ctx = TestContext::new(fleet());

    ctx.orchestrator.startup().await.unwrap();
    ctx.orchestrator.startup().await.unwrap();

    let records = ctx.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].server_name, "proxy");
    assert_eq!(ctx.runtime.container_ids().await.len(), 1);

    ctx.orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reconciler_tops_up_after_startup() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryStore::new());
    let runtime = KloudRuntime::builder()
        .registry(TemplateRegistry::from_parts(fleet(), default_images()).unwrap())
        .container_runtime(Arc::new(MockRuntime::new()))
        .store(store.clone())
        .bus(store.clone())
        .templates_dir(dir.path().join("templates"))
        .running_dir(dir.path().join("running"))
        .port_probe(Arc::new(|_| true))
        .reconcile_interval(Duration::from_millis(20))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    let store_ref = &store;
    let lobby_up = wait_for(Duration::from_secs(5), || async move {
        store_ref
            .get_all()
            .await
            .unwrap()
            .iter()
            .any(|s| s.server_name == "lobby-1")
    })
    .await;
    assert!(lobby_up);

    runtime.shutdown().await.unwrap();
    assert!(store.get_all().await.unwrap().is_empty());
}
