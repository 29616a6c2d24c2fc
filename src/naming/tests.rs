//! Naming Module Tests
//!
//! Validates key rendering, the ephemeral store and the server-side write path.
//!
//! ## Test Scopes
//! - **Types**: Service key parsing and instance identity.
//! - **EphemeralStore**: Per-key writes, sync actions, snapshots and idempotent apply.
//! - **Sessions**: Heartbeats, expiry and subscriptions.
//! - **NamingService**: Owner-side writes, session checks, expiry withdrawal and forwarding.
//!
//! *Note: The HTTP surface is exercised by the integration tests.*

#[cfg(test)]
mod tests {
    use crate::config::DistroConfig;
    use crate::distro::service::DistroProtocol;
    use crate::distro::transport::HttpSyncTransport;
    use crate::distro::types::{ResourceKey, SyncAction};
    use crate::membership::service::MembershipService;
    use crate::membership::types::{Node, NodeId};
    use crate::naming::error::NamingError;
    use crate::naming::mapper::ResponsibilityMapper;
    use crate::naming::protocol::WriteOp;
    use crate::naming::service::NamingService;
    use crate::naming::sessions::SessionRegistry;
    use crate::naming::store::{EphemeralStore, Snapshot};
    use crate::naming::types::{Instance, ServiceKey};

    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    fn orders() -> ServiceKey {
        ServiceKey::new("public", "DEFAULT_GROUP", "orders")
    }

    async fn naming_service(config: DistroConfig) -> (Arc<MembershipService>, Arc<NamingService>) {
        let bind_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let http_addr: SocketAddr = "127.0.0.1:18848".parse().unwrap();
        let membership = MembershipService::new(bind_addr, http_addr, vec![])
            .await
            .expect("Failed to create membership");
        let distro = DistroProtocol::new(
            membership.clone(),
            ResponsibilityMapper::new(membership.clone()),
            EphemeralStore::new(),
            Arc::new(HttpSyncTransport::new(config.sync_timeout())),
            &config,
        );
        let naming = NamingService::new(membership.clone(), distro, SessionRegistry::new(), &config);
        (membership, naming)
    }

    // ============================================================
    // TYPES TESTS
    // ============================================================

    #[test]
    fn test_service_key_round_trips_through_string() {
        let key = orders();
        let parsed: ServiceKey = key.to_string().parse().unwrap();

        assert_eq!(key.to_string(), "public@@DEFAULT_GROUP@@orders");
        assert_eq!(parsed, key);
        assert_eq!(key.grouped_name(), "DEFAULT_GROUP@@orders");
    }

    #[test]
    fn test_malformed_service_key_is_rejected() {
        assert!("orders".parse::<ServiceKey>().is_err());
        assert!("public@@@@orders".parse::<ServiceKey>().is_err());
        assert!("a@@b@@c@@d".parse::<ServiceKey>().is_err());
    }

    #[test]
    fn test_instance_id_includes_cluster() {
        let instance = Instance::new("10.0.0.1", 8080).with_cluster("east");
        assert_eq!(instance.instance_id, "10.0.0.1#8080#east");
    }

    #[test]
    fn test_instance_validation() {
        assert!(Instance::new("10.0.0.1", 8080).validate().is_ok());
        assert!(Instance::new("", 8080).validate().is_err());
        assert!(Instance::new("10.0.0.1", 0).validate().is_err());

        let mut negative = Instance::new("10.0.0.1", 8080);
        negative.weight = -1.0;
        assert!(negative.validate().is_err());
    }

    #[test]
    fn test_instance_defaults_when_deserialized() {
        let instance: Instance = serde_json::from_str(r#"{"ip":"10.0.0.1","port":80}"#).unwrap();
        let instance = instance.normalized();

        assert_eq!(instance.instance_id, "10.0.0.1#80#DEFAULT");
        assert!(instance.healthy && instance.enabled && instance.ephemeral);
        assert_eq!(instance.weight, 1.0);
    }

    // ============================================================
    // EPHEMERAL STORE TESTS
    // ============================================================

    #[test]
    fn test_register_reports_add_then_change() {
        let store = EphemeralStore::new();
        let key = orders().resource_key();

        let first = store.register(&key, Instance::new("10.0.0.1", 8080));
        let repeat = store.register(&key, Instance::new("10.0.0.1", 8080));
        let changed = store.register(&key, Instance::new("10.0.0.1", 8080).with_metadata("v", "2"));

        assert_eq!(first, Some(SyncAction::Add));
        assert_eq!(repeat, None, "Re-registering the same record is not a change");
        assert_eq!(changed, Some(SyncAction::Change));
        assert_eq!(store.get(&key).unwrap().len(), 1);
    }

    #[test]
    fn test_deregister_last_instance_deletes_key() {
        let store = EphemeralStore::new();
        let key = orders().resource_key();
        store.register(&key, Instance::new("10.0.0.1", 8080));
        store.register(&key, Instance::new("10.0.0.2", 8080));

        assert_eq!(store.deregister(&key, "10.0.0.1#8080#DEFAULT", None), Some(SyncAction::Change));
        assert_eq!(store.deregister(&key, "10.0.0.2#8080#DEFAULT", None), Some(SyncAction::Delete));
        assert!(!store.contains(&key));
        assert_eq!(store.deregister(&key, "10.0.0.2#8080#DEFAULT", None), None);
    }

    #[test]
    fn test_session_deregister_leaves_instance_of_other_session() {
        let store = EphemeralStore::new();
        let key = orders().resource_key();
        let mut instance = Instance::new("10.0.0.1", 8080);
        instance.session_id = Some("session-2".to_string());
        store.register(&key, instance);

        let stale = store.deregister(&key, "10.0.0.1#8080#DEFAULT", Some("session-1"));
        assert_eq!(stale, None);
        assert_eq!(store.get(&key).unwrap()[0].session_id.as_deref(), Some("session-2"));

        let own = store.deregister(&key, "10.0.0.1#8080#DEFAULT", Some("session-2"));
        assert_eq!(own, Some(SyncAction::Delete));
        assert!(!store.contains(&key));
    }

    #[test]
    fn test_batch_register_replaces_session_contribution() {
        let store = EphemeralStore::new();
        let key = orders().resource_key();
        store.register(&key, Instance::new("10.0.0.9", 9000));

        let added = store.batch_register(
            &key,
            "session-1",
            vec![Instance::new("10.0.0.1", 80), Instance::new("10.0.0.2", 80)],
        );
        let replaced = store.batch_register(&key, "session-1", vec![Instance::new("10.0.0.3", 80)]);

        assert_eq!(added, Some(SyncAction::Change));
        assert_eq!(replaced, Some(SyncAction::Change));
        let ids: Vec<String> = store
            .get(&key)
            .unwrap()
            .into_iter()
            .map(|instance| instance.instance_id)
            .collect();
        assert_eq!(ids, vec!["10.0.0.3#80#DEFAULT", "10.0.0.9#9000#DEFAULT"]);
    }

    #[test]
    fn test_empty_batch_withdraws_and_deletes() {
        let store = EphemeralStore::new();
        let key = orders().resource_key();
        store.batch_register(&key, "session-1", vec![Instance::new("10.0.0.1", 80)]);

        assert_eq!(store.batch_register(&key, "session-1", vec![]), Some(SyncAction::Delete));
        assert!(store.is_empty());
        assert_eq!(store.batch_register(&key, "session-1", vec![]), None);
    }

    #[test]
    fn test_snapshot_reports_missing_keys_as_removed() {
        let store = EphemeralStore::new();
        let present = orders().resource_key();
        let gone = ResourceKey::new("public@@DEFAULT_GROUP@@payments");
        store.register(&present, Instance::new("10.0.0.1", 8080));

        let snapshot = store.snapshot(&[present.clone(), gone.clone()]);

        assert_eq!(snapshot.entries[&present].len(), 1);
        assert_eq!(snapshot.removed, vec![gone]);
        assert_eq!(snapshot.key_count(), 2);
    }

    #[test]
    fn test_apply_snapshot_is_idempotent() {
        let owner = EphemeralStore::new();
        let replica = EphemeralStore::new();
        let key = orders().resource_key();
        owner.register(&key, Instance::new("10.0.0.1", 8080));
        owner.register(&key, Instance::new("10.0.0.2", 8080));
        let snapshot = owner.snapshot(&[key.clone()]);

        let first = replica.apply_snapshot(snapshot.clone());
        let state_after_first = replica.snapshot(&[key.clone()]);
        let second = replica.apply_snapshot(snapshot);

        assert_eq!(first, vec![key.clone()]);
        assert!(second.is_empty());
        assert_eq!(replica.snapshot(&[key.clone()]), state_after_first);
        assert_eq!(state_after_first, owner.snapshot(&[key]));
    }

    #[test]
    fn test_apply_snapshot_removes_deleted_keys() {
        let owner = EphemeralStore::new();
        let replica = EphemeralStore::new();
        let key = orders().resource_key();
        owner.register(&key, Instance::new("10.0.0.1", 8080));
        replica.apply_snapshot(owner.snapshot(&[key.clone()]));

        let changed = replica.apply_snapshot(Snapshot {
            entries: Default::default(),
            removed: vec![key.clone()],
        });

        assert_eq!(changed, vec![key.clone()]);
        assert!(replica.get(&key).is_none());
    }

    #[test]
    fn test_apply_snapshot_keeps_locally_written_instances() {
        // ARRANGE: the previous owner's copy, already replicated here
        let previous = EphemeralStore::new();
        let local = EphemeralStore::new();
        let key = orders().resource_key();
        previous.register(&key, Instance::new("10.0.0.1", 8080));
        previous.register(&key, Instance::new("10.0.0.2", 8080));
        local.apply_snapshot(previous.snapshot(&[key.clone()]));

        // local owner writes: one instance replaced, one removed
        local.register(&key, Instance::new("10.0.0.1", 8080).with_metadata("v", "2"));
        local.deregister(&key, "10.0.0.2#8080#DEFAULT", None);
        previous.register(&key, Instance::new("10.0.0.3", 8080));

        // ACT: the previous owner's late push arrives
        let changed = local.apply_snapshot(previous.snapshot(&[key.clone()]));

        // ASSERT
        assert_eq!(changed, vec![key.clone()]);
        let instances = local.get(&key).unwrap();
        let ids: Vec<&str> = instances.iter().map(|i| i.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["10.0.0.1#8080#DEFAULT", "10.0.0.3#8080#DEFAULT"]);
        assert_eq!(instances[0].metadata.get("v").map(String::as_str), Some("2"));

        let removal = local.apply_snapshot(Snapshot {
            entries: Default::default(),
            removed: vec![key.clone()],
        });
        assert_eq!(removal, vec![key.clone()]);
        let ids: Vec<String> = local
            .get(&key)
            .unwrap()
            .into_iter()
            .map(|instance| instance.instance_id)
            .collect();
        assert_eq!(ids, vec!["10.0.0.1#8080#DEFAULT"]);
    }

    #[test]
    fn test_released_key_is_replaced_wholesale() {
        let owner = EphemeralStore::new();
        let local = EphemeralStore::new();
        let key = orders().resource_key();
        local.register(&key, Instance::new("10.0.0.1", 8080));
        owner.register(&key, Instance::new("10.0.0.9", 8080));
        assert!(local.is_authored(&key));

        local.release_authored(|_| false);
        local.apply_snapshot(owner.snapshot(&[key.clone()]));

        assert!(!local.is_authored(&key));
        assert_eq!(local.get(&key), owner.get(&key));
    }

    #[test]
    fn test_handoff_flag_lifecycle() {
        let store = EphemeralStore::new();
        let key = orders().resource_key();
        store.register(&key, Instance::new("10.0.0.1", 8080));

        store.mark_handoff(&key);
        assert!(store.is_handoff_pending(&key));

        assert!(store.complete_handoff(&key));
        assert!(!store.complete_handoff(&key), "Only the first completion counts");
        assert!(!store.is_handoff_pending(&key));
    }

    // ============================================================
    // SESSION TESTS
    // ============================================================

    #[test]
    fn test_connect_issues_unique_sessions() {
        let sessions = SessionRegistry::new();
        let a = sessions.connect("public");
        let b = sessions.connect("public");

        assert_ne!(a, b);
        assert_eq!(sessions.len(), 2);
        assert!(sessions.touch(&a));
        assert!(!sessions.touch("unknown"));
    }

    #[tokio::test]
    async fn test_silent_sessions_expire() {
        let sessions = SessionRegistry::new();
        let quiet = sessions.connect("public");
        let chatty = sessions.connect("public");
        sessions.track_instance(&quiet, &orders(), "10.0.0.1#8080#DEFAULT");

        tokio::time::sleep(Duration::from_millis(60)).await;
        sessions.touch(&chatty);

        let expired = sessions.expire(Duration::from_millis(40));

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, quiet);
        assert_eq!(expired[0].registration_count(), 1);
        assert!(sessions.is_active(&chatty));
    }

    #[test]
    fn test_subscriptions_are_tracked_per_cluster_filter() {
        let sessions = SessionRegistry::new();
        let session = sessions.connect("public");

        sessions.subscribe(&session, &orders(), "east");
        sessions.subscribe(&session, &orders(), "west");
        sessions.unsubscribe(&session, &orders(), "east");

        let held = sessions.get(&session).unwrap();
        let filters: Vec<&String> = held.subscriptions[&orders()].iter().collect();
        assert_eq!(filters, vec!["west"]);

        sessions.unsubscribe(&session, &orders(), "west");
        assert!(sessions.get(&session).unwrap().subscriptions.is_empty());
        assert!(!sessions.subscribe("unknown", &orders(), ""));
    }

    // ============================================================
    // NAMING SERVICE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_owner_write_lands_in_store_and_schedules_sync() {
        // ARRANGE: the local node owns everything, one peer to sync to
        let (membership, naming) = naming_service(DistroConfig::default()).await;
        let session = naming.connect("public");

        // ACT
        naming
            .register(&session, orders(), Instance::new("10.0.0.1", 8080))
            .await
            .unwrap();

        // ASSERT
        let instances = naming.list_instances(&orders());
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].session_id.as_deref(), Some(session.as_str()));
        assert_eq!(naming.distro().engine().pending_len(), 0, "No peers yet");

        membership.admit(Node::new(
            NodeId("peer".to_string()),
            "127.0.0.1:7001".parse().unwrap(),
            "127.0.0.1:8001".parse().unwrap(),
        ));
        let view = naming.distro().mapper().view();
        let owned: ServiceKey = (0..)
            .map(|i| ServiceKey::new("public", "DEFAULT_GROUP", &format!("svc-{}", i)))
            .find(|key| {
                ResponsibilityMapper::owner_in(&view, &key.resource_key()).as_ref()
                    == Some(membership.local_id())
            })
            .unwrap();

        naming
            .register(&session, owned, Instance::new("10.0.0.1", 8080))
            .await
            .unwrap();
        assert_eq!(naming.distro().engine().pending_len(), 1);
    }

    #[tokio::test]
    async fn test_write_with_unknown_session_is_rejected() {
        let (_, naming) = naming_service(DistroConfig::default()).await;

        let result = naming
            .register("missing", orders(), Instance::new("10.0.0.1", 8080))
            .await;

        assert!(matches!(result, Err(NamingError::UnknownSession(_))));
        assert!(naming.list_instances(&orders()).is_empty());
    }

    #[tokio::test]
    async fn test_invalid_instance_is_rejected() {
        let (_, naming) = naming_service(DistroConfig::default()).await;
        let session = naming.connect("public");

        let result = naming
            .register(&session, orders(), Instance::new("10.0.0.1", 0))
            .await;

        assert!(matches!(result, Err(NamingError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_expired_session_withdraws_registrations() {
        let config = DistroConfig {
            session_timeout_ms: 30,
            ..DistroConfig::default()
        };
        let (_, naming) = naming_service(config).await;
        let session = naming.connect("public");
        let payments = ServiceKey::new("public", "DEFAULT_GROUP", "payments");

        naming
            .register(&session, orders(), Instance::new("10.0.0.1", 8080))
            .await
            .unwrap();
        naming
            .batch_register(
                &session,
                payments.clone(),
                vec![Instance::new("10.0.0.2", 80), Instance::new("10.0.0.3", 80)],
            )
            .await
            .unwrap();
        assert_eq!(naming.distro().store().instance_count(), 3);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let expired = naming.expire_sessions().await;

        assert_eq!(expired, 1);
        assert!(naming.list_instances(&orders()).is_empty());
        assert!(naming.list_instances(&payments).is_empty());
        assert!(naming.beat(&session).is_err());
    }

    #[tokio::test]
    async fn test_expiry_keeps_instance_taken_over_by_new_session() {
        // ARRANGE: a session registers, goes silent, and its client
        // reconnects and registers the same instance again
        let config = DistroConfig {
            session_timeout_ms: 40,
            ..DistroConfig::default()
        };
        let (_, naming) = naming_service(config).await;
        let old_session = naming.connect("public");
        naming
            .register(&old_session, orders(), Instance::new("10.0.0.1", 8080))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        let new_session = naming.connect("public");
        naming
            .register(&new_session, orders(), Instance::new("10.0.0.1", 8080))
            .await
            .unwrap();

        // ACT
        let expired = naming.expire_sessions().await;

        // ASSERT: the withdrawal of the old session leaves the live one alone
        assert_eq!(expired, 1);
        let instances = naming.list_instances(&orders());
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].session_id.as_deref(), Some(new_session.as_str()));
        assert_eq!(naming.sessions().get(&new_session).unwrap().registration_count(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_filters_by_cluster() {
        let (_, naming) = naming_service(DistroConfig::default()).await;
        let session = naming.connect("public");
        let other = naming.connect("public");
        naming
            .register(&session, orders(), Instance::new("10.0.0.1", 80).with_cluster("east"))
            .await
            .unwrap();
        naming
            .register(&other, orders(), Instance::new("10.0.0.2", 80).with_cluster("west"))
            .await
            .unwrap();

        let east = naming.subscribe(&session, &orders(), "east").unwrap();
        let all = naming.subscribe(&session, &orders(), "").unwrap();

        assert_eq!(east.len(), 1);
        assert_eq!(east[0].cluster_name, "east");
        assert_eq!(all.len(), 2);
        let held = naming.sessions().get(&session).unwrap();
        assert_eq!(held.subscriptions[&orders()].len(), 2);
        assert!(naming.sessions().get(&other).unwrap().subscriptions.is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_keeps_other_cluster_filters() {
        let (_, naming) = naming_service(DistroConfig::default()).await;
        let session = naming.connect("public");
        naming.subscribe(&session, &orders(), "east").unwrap();
        naming.subscribe(&session, &orders(), "west").unwrap();

        naming.unsubscribe(&session, &orders(), "east").unwrap();

        let held = naming.sessions().get(&session).unwrap();
        assert!(held.subscriptions[&orders()].contains("west"));
        assert!(!held.subscriptions[&orders()].contains("east"));
        assert!(matches!(
            naming.unsubscribe("missing", &orders(), "west"),
            Err(NamingError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn test_register_replaces_previous_instance_of_session() {
        let (_, naming) = naming_service(DistroConfig::default()).await;
        let session = naming.connect("public");
        naming
            .register(&session, orders(), Instance::new("10.0.0.1", 8080))
            .await
            .unwrap();

        naming
            .register(&session, orders(), Instance::new("10.0.0.1", 8081))
            .await
            .unwrap();

        let instances = naming.list_instances(&orders());
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].port, 8081);
        assert_eq!(naming.sessions().get(&session).unwrap().registration_count(), 1);
    }

    #[tokio::test]
    async fn test_write_for_unreachable_owner_fails() {
        // ARRANGE: a peer that owns the key but does not listen
        let (membership, naming) = naming_service(DistroConfig::default()).await;
        let peer = Node::new(
            NodeId("peer".to_string()),
            "127.0.0.1:7001".parse().unwrap(),
            "127.0.0.1:1".parse().unwrap(),
        );
        membership.admit(peer.clone());
        let view = naming.distro().mapper().view();
        let foreign: ServiceKey = (0..)
            .map(|i| ServiceKey::new("public", "DEFAULT_GROUP", &format!("svc-{}", i)))
            .find(|key| {
                ResponsibilityMapper::owner_in(&view, &key.resource_key()).as_ref() == Some(&peer.id)
            })
            .unwrap();

        // ACT
        let result = naming
            .write(WriteOp::Register {
                service: foreign.clone(),
                instance: Instance::new("10.0.0.1", 8080),
            })
            .await;

        // ASSERT: nothing applied locally
        assert!(matches!(result, Err(NamingError::Forward { owner, .. }) if owner == peer.id));
        assert!(naming.list_instances(&foreign).is_empty());
    }

    #[tokio::test]
    async fn test_forwarded_write_is_applied_without_ownership_check() {
        let (membership, naming) = naming_service(DistroConfig::default()).await;
        membership.admit(Node::new(
            NodeId("peer".to_string()),
            "127.0.0.1:7001".parse().unwrap(),
            "127.0.0.1:8001".parse().unwrap(),
        ));

        let action = naming.apply_write(WriteOp::Register {
            service: orders(),
            instance: Instance::new("10.0.0.1", 8080),
        });

        assert_eq!(action, Some(SyncAction::Add));
        assert_eq!(naming.list_instances(&orders()).len(), 1);
    }
}
