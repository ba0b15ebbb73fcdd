use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tempfile::{TempDir, tempdir};

use super::{MembershipStore, MemoryStore, SledStore};
use crate::utils::error::StoreError;

fn sled_store() -> (SledStore, TempDir) {
    let dir = tempdir().unwrap();
    let store = SledStore::open(dir.path().to_str().unwrap()).unwrap();
    (store, dir)
}

fn set(items: &[&str]) -> HashSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Both indices must be exact mirror images of each other.
async fn assert_consistent(store: &dyn MembershipStore) {
    let by_topic = store.topics_with_members().await.unwrap();
    let by_member = store.members_with_topics().await.unwrap();

    for (topic, members) in &by_topic {
        for member in members {
            assert!(
                by_member.get(member).is_some_and(|t| t.contains(topic)),
                "{member} in topic {topic} but topic missing from member index"
            );
        }
    }
    for (member, topics) in &by_member {
        for topic in topics {
            assert!(
                by_topic.get(topic).is_some_and(|m| m.contains(member)),
                "{topic} listed for {member} but member missing from topic index"
            );
        }
    }
}

async fn join_adds_both_directions(store: Arc<dyn MembershipStore>) {
    store.join("room:42", "clientA", None).await.unwrap();

    assert_eq!(store.members("room:42").await.unwrap(), set(&["clientA"]));
    assert_eq!(store.topics_of("clientA").await.unwrap(), set(&["room:42"]));
    assert!(store.is_member("room:42", "clientA").await.unwrap());
    assert_consistent(store.as_ref()).await;
}

async fn join_is_idempotent(store: Arc<dyn MembershipStore>) {
    store.join("room:42", "clientA", None).await.unwrap();
    store.join("room:42", "clientA", None).await.unwrap();

    let members = store.members("room:42").await.unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(store.topics_of("clientA").await.unwrap().len(), 1);
}

async fn leave_removes_both_directions(store: Arc<dyn MembershipStore>) {
    store.join("room:1", "clientA", None).await.unwrap();
    store.join("room:2", "clientA", None).await.unwrap();
    store.join("room:1", "clientB", None).await.unwrap();

    store.leave("room:1", "clientA").await.unwrap();

    assert_eq!(store.members("room:1").await.unwrap(), set(&["clientB"]));
    assert_eq!(store.topics_of("clientA").await.unwrap(), set(&["room:2"]));
    assert!(!store.is_member("room:1", "clientA").await.unwrap());
    assert_consistent(store.as_ref()).await;
}

async fn leave_missing_edge_is_noop(store: Arc<dyn MembershipStore>) {
    store.leave("nowhere", "nobody").await.unwrap();
    store.join("room:1", "clientA", None).await.unwrap();
    store.leave("room:1", "clientB").await.unwrap();
    store.leave("room:2", "clientA").await.unwrap();

    assert_eq!(store.members("room:1").await.unwrap(), set(&["clientA"]));
    assert_consistent(store.as_ref()).await;
}

async fn unknown_lookups_are_empty(store: Arc<dyn MembershipStore>) {
    assert!(store.members("ghost-topic").await.unwrap().is_empty());
    assert!(store.topics_of("ghost-client").await.unwrap().is_empty());
    assert!(!store.is_member("ghost-topic", "ghost-client").await.unwrap());
    assert!(store.topics_with_members().await.unwrap().is_empty());
}

async fn join_then_leave_does_not_resurrect(store: Arc<dyn MembershipStore>) {
    for _ in 0..20 {
        store.join("room:flap", "clientA", None).await.unwrap();
        store.leave("room:flap", "clientA").await.unwrap();
    }
    assert!(store.members("room:flap").await.unwrap().is_empty());
    assert!(store.topics_of("clientA").await.unwrap().is_empty());
}

async fn concurrent_churn_keeps_indices_consistent(store: Arc<dyn MembershipStore>) {
    let mut handles = Vec::new();
    for worker in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            for round in 0..50 {
                let topic = format!("room:{}", round % 5);
                let client = format!("client-{}", (worker + round) % 6);
                store.join(&topic, &client, None).await.unwrap();
                if round % 3 == 0 {
                    store.leave(&topic, &client).await.unwrap();
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_consistent(store.as_ref()).await;
    for (topic, members) in store.topics_with_members().await.unwrap() {
        for member in members {
            assert!(store.topics_of(&member).await.unwrap().contains(&topic));
        }
    }
}

async fn ttl_expires_membership(store: Arc<dyn MembershipStore>) {
    store
        .join("room:ttl", "clientA", Some(Duration::from_millis(50)))
        .await
        .unwrap();
    assert!(store.is_member("room:ttl", "clientA").await.unwrap());

    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(store.members("room:ttl").await.unwrap().is_empty());
    assert!(store.topics_of("clientA").await.unwrap().is_empty());
    assert!(!store.is_member("room:ttl", "clientA").await.unwrap());

    // An expired set starts over; the old member is not resurrected.
    store.join("room:ttl", "clientB", None).await.unwrap();
    assert_eq!(store.members("room:ttl").await.unwrap(), set(&["clientB"]));
}

async fn join_refreshes_ttl(store: Arc<dyn MembershipStore>) {
    let ttl = Some(Duration::from_millis(200));
    store.join("room:ttl", "clientA", ttl).await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    store.join("room:ttl", "clientA", ttl).await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    assert!(store.is_member("room:ttl", "clientA").await.unwrap());
    assert_eq!(store.topics_of("clientA").await.unwrap(), set(&["room:ttl"]));
}

async fn rejects_unencodable_names(store: Arc<dyn MembershipStore>) {
    let err = store.join("", "clientA", None).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidName(_)));

    let err = store.join("room", "bad\0id", None).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidName(_)));

    assert!(store.topics_with_members().await.unwrap().is_empty());
}

async fn rejoin_after_leave_forgets_old_expiry(store: Arc<dyn MembershipStore>) {
    store
        .join("room:ttl", "clientA", Some(Duration::from_millis(100)))
        .await
        .unwrap();
    store.leave("room:ttl", "clientA").await.unwrap();
    store.join("room:ttl", "clientA", None).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(store.members("room:ttl").await.unwrap(), set(&["clientA"]));
    assert_eq!(store.topics_of("clientA").await.unwrap(), set(&["room:ttl"]));
    assert_consistent(store.as_ref()).await;
}

async fn concurrent_rejoins_of_expired_sets_stay_consistent(store: Arc<dyn MembershipStore>) {
    let clients: Vec<String> = (0..6).map(|i| format!("client-{i}")).collect();
    let ttl = Some(Duration::from_millis(30));
    for client in &clients {
        store.join("room:exp", client, ttl).await.unwrap();
        store.join("room:other", client, ttl).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut handles = Vec::new();
    for client in clients.iter().chain(clients.iter()) {
        let store = store.clone();
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            store.join("room:exp", &client, None).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let expected: HashSet<String> = clients.iter().cloned().collect();
    assert_eq!(store.members("room:exp").await.unwrap(), expected);
    for client in &clients {
        assert_eq!(store.topics_of(client).await.unwrap(), set(&["room:exp"]));
    }
    assert!(store.members("room:other").await.unwrap().is_empty());
    assert_consistent(store.as_ref()).await;
}

async fn last_operation_per_pair_wins_under_contention(store: Arc<dyn MembershipStore>) {
    let mut handles = Vec::new();
    for worker in 0..12 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let client = format!("client-{worker}");
            for _ in 0..25 {
                store.join("room:race", &client, None).await.unwrap();
                store.leave("room:race", &client).await.unwrap();
            }
            if worker % 2 == 0 {
                store.join("room:race", &client, None).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let expected: HashSet<String> = (0..12)
        .filter(|w| w % 2 == 0)
        .map(|w| format!("client-{w}"))
        .collect();
    assert_eq!(store.members("room:race").await.unwrap(), expected);
    for worker in (0..12).filter(|w| w % 2 == 1) {
        assert!(store.topics_of(&format!("client-{worker}")).await.unwrap().is_empty());
    }
    assert_consistent(store.as_ref()).await;
}

macro_rules! contract_tests {
    ($($name:ident),* $(,)?) => {
        mod memory_backend {
            use super::*;

            $(
                #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
                async fn $name() {
                    super::$name(Arc::new(MemoryStore::new())).await;
                }
            )*
        }

        mod sled_backend {
            use super::*;

            $(
                #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
                async fn $name() {
                    let (store, _dir) = sled_store();
                    super::$name(Arc::new(store)).await;
                }
            )*
        }
    };
}

contract_tests!(
    join_adds_both_directions,
    join_is_idempotent,
    leave_removes_both_directions,
    leave_missing_edge_is_noop,
    unknown_lookups_are_empty,
    join_then_leave_does_not_resurrect,
    concurrent_churn_keeps_indices_consistent,
    ttl_expires_membership,
    join_refreshes_ttl,
    rejects_unencodable_names,
    rejoin_after_leave_forgets_old_expiry,
    concurrent_rejoins_of_expired_sets_stay_consistent,
    last_operation_per_pair_wins_under_contention,
);

#[tokio::test]
async fn sled_membership_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().to_str().unwrap().to_string();

    {
        let store = SledStore::open(&path).unwrap();
        store.join("room:42", "clientA", None).await.unwrap();
        store.flush().await.unwrap();
    }

    let reopened = SledStore::open(&path).unwrap();
    assert_eq!(reopened.members("room:42").await.unwrap(), set(&["clientA"]));
    assert_eq!(
        reopened.topics_of("clientA").await.unwrap(),
        set(&["room:42"])
    );
}

#[test]
fn row_keys_split_back_into_parts() {
    let row = super::keys::row_key(&super::keys::topic_key("room:42"), "clientA");
    assert_eq!(
        super::keys::split_row(&row),
        Some(("topic:room:42", "clientA"))
    );
}
