//! Membership Module Tests
//!
//! Validates the membership feed consumed by the Distro engine.
//!
//! ## Test Scopes
//! - **Data Structures**: Node identity, state semantics and gossip wire encoding.
//! - **View**: Sorted member view, peer listing and the `version` counter.
//! - **Events**: `Joined` / `Left` notifications on admit and evict.

#[cfg(test)]
mod tests {
    use crate::membership::service::MembershipService;
    use crate::membership::types::{GossipMessage, MembershipEvent, Node, NodeId, NodeState};
    use std::net::SocketAddr;

    async fn local_service() -> std::sync::Arc<MembershipService> {
        let bind_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let http_addr: SocketAddr = "127.0.0.1:18848".parse().unwrap();
        MembershipService::new(bind_addr, http_addr, vec![])
            .await
            .expect("Failed to create service")
    }

    fn remote_node(id: &str, port: u16) -> Node {
        Node::new(
            NodeId(id.to_string()),
            format!("127.0.0.1:{}", port).parse().unwrap(),
            format!("127.0.0.1:{}", port + 1000).parse().unwrap(),
        )
    }

    // ============================================================
    // NODE TESTS
    // ============================================================

    #[test]
    fn test_node_id_is_unique() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();

        assert_ne!(id1, id2, "Each NodeId should be unique");
    }

    #[test]
    fn test_node_ids_sort_lexicographically() {
        let mut ids = vec![
            NodeId("node-c".to_string()),
            NodeId("node-a".to_string()),
            NodeId("node-b".to_string()),
        ];
        ids.sort();

        assert_eq!(ids[0].0, "node-a");
        assert_eq!(ids[2].0, "node-c");
    }

    #[test]
    fn test_suspect_is_still_a_member() {
        assert!(NodeState::Alive.is_member());
        assert!(NodeState::Suspect.is_member());
        assert!(!NodeState::Dead.is_member());
    }

    #[test]
    fn test_node_bincode_skips_last_seen() {
        let node = remote_node("bincode-test", 5000);

        let encoded = bincode::serialize(&node).expect("Bincode serialization failed");
        let restored: Node = bincode::deserialize(&encoded).expect("Bincode deserialization failed");

        assert_eq!(restored.id, node.id);
        assert_eq!(restored.http_addr, node.http_addr);
        assert!(restored.last_seen.is_none());
    }

    #[test]
    fn test_gossip_ping_carries_http_addr() {
        let msg = GossipMessage::Ping {
            from: NodeId("sender-node".to_string()),
            incarnation: 5,
            http_addr: "10.0.0.1:6000".parse().unwrap(),
        };

        let encoded = bincode::serialize(&msg).expect("Failed to serialize Ping");
        let decoded: GossipMessage =
            bincode::deserialize(&encoded).expect("Failed to deserialize Ping");

        if let GossipMessage::Ping {
            from,
            incarnation,
            http_addr,
        } = decoded
        {
            assert_eq!(from.0, "sender-node");
            assert_eq!(incarnation, 5);
            assert_eq!(http_addr.port(), 6000);
        } else {
            panic!("Wrong message type");
        }
    }

    // ============================================================
    // VIEW TESTS
    // ============================================================

    #[tokio::test]
    async fn test_service_starts_with_itself() {
        let service = local_service().await;

        assert_eq!(service.members.len(), 1);
        assert_eq!(service.sorted_members(), vec![service.local_id().clone()]);
        assert!(service.peers().is_empty());
        assert_ne!(service.local_node.gossip_addr.port(), 0);
    }

    #[tokio::test]
    async fn test_sorted_members_excludes_dead_nodes() {
        let service = local_service().await;
        service.admit(remote_node("node-b", 5001));
        service.admit(remote_node("node-a", 5002));

        let view = service.sorted_members();
        assert_eq!(view.len(), 3);
        let mut expected = view.clone();
        expected.sort();
        assert_eq!(view, expected, "View must be sorted");

        service.evict(&NodeId("node-b".to_string()));

        let view = service.sorted_members();
        assert_eq!(view.len(), 2);
        assert!(!view.contains(&NodeId("node-b".to_string())));
        assert_eq!(service.peers().len(), 1);
    }

    #[tokio::test]
    async fn test_get_member() {
        let service = local_service().await;

        assert!(service.get_member(service.local_id()).is_some());
        assert!(service.get_member(&NodeId("non-existent".to_string())).is_none());
    }

    // ============================================================
    // EVENT TESTS
    // ============================================================

    #[tokio::test]
    async fn test_admit_and_evict_publish_events() {
        let service = local_service().await;
        let mut events = service.subscribe();
        let start_version = service.version();

        service.admit(remote_node("node-x", 5003));
        service.evict(&NodeId("node-x".to_string()));

        assert_eq!(
            events.recv().await.unwrap(),
            MembershipEvent::Joined(NodeId("node-x".to_string()))
        );
        assert_eq!(
            events.recv().await.unwrap(),
            MembershipEvent::Left(NodeId("node-x".to_string()))
        );
        assert_eq!(service.version(), start_version + 2);
    }

    #[tokio::test]
    async fn test_repeated_admit_publishes_once() {
        let service = local_service().await;
        let start_version = service.version();

        service.admit(remote_node("node-y", 5004));
        service.admit(remote_node("node-y", 5004));

        assert_eq!(service.version(), start_version + 1);
    }

    #[tokio::test]
    async fn test_evicting_local_or_unknown_node_is_ignored() {
        let service = local_service().await;
        let start_version = service.version();

        service.evict(&service.local_id().clone());
        service.evict(&NodeId("ghost".to_string()));

        assert_eq!(service.version(), start_version);
        assert_eq!(service.sorted_members().len(), 1);
    }

    #[tokio::test]
    async fn test_dead_node_rejoins() {
        let service = local_service().await;
        let id = NodeId("node-z".to_string());

        service.admit(remote_node("node-z", 5005));
        service.evict(&id);
        assert!(!service.is_member(&id));

        service.admit(remote_node("node-z", 5005));
        assert!(service.is_member(&id));
    }
}
