use bytes::Bytes;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tonic::Code;

use crate::harness::Harness;
use crate::keyvalue::grpc::{DeleteRequest, JoinRequest, LeaveRequest, SetRequest, StatusRequest};
use crate::raft::raft_common_proto::Member;
use crate::raft::{Client, Options};

const TIMEOUT: Duration = Duration::from_secs(10);
const NAMES: [&str; 3] = ["A", "B", "C"];

#[tokio::test]
async fn test_start_and_elect_leader() {
    let harness = make_harness(&NAMES).await;

    harness
        .wait_for_leader(TIMEOUT, term_greater(0))
        .await
        .expect("leader");

    harness.validate().await;
    harness.stop().await;
}

#[tokio::test]
async fn test_keyvalue() {
    let harness = make_harness(&NAMES).await;
    let (_, leader) = harness
        .wait_for_leader(TIMEOUT, term_greater(0))
        .await
        .expect("leader");
    let mut kv = harness.make_kv_client(&leader.id).await.expect("client");

    kv.set(SetRequest {
        key: b"k1".to_vec(),
        value: b"v1".to_vec(),
    })
    .await
    .expect("set");

    // Every member eventually applies the write.
    for name in NAMES {
        harness
            .wait_for_value(name, b"k1", TIMEOUT, |v| v == &Some(Bytes::from("v1")))
            .await;
    }

    kv.delete(DeleteRequest {
        key: b"k1".to_vec(),
    })
    .await
    .expect("delete");
    for name in NAMES {
        harness
            .wait_for_value(name, b"k1", TIMEOUT, |v| v.is_none())
            .await;
    }

    harness.validate().await;
    harness.stop().await;
}

#[tokio::test]
async fn test_write_on_follower_rejected() {
    let harness = make_harness(&NAMES).await;
    let (_, leader) = harness
        .wait_for_leader(TIMEOUT, term_greater(0))
        .await
        .expect("leader");
    let follower = other_than(&leader);

    // Give the follower a chance to hear from the leader.
    let raft = harness.raft(follower).expect("raft");
    let start = Instant::now();
    while raft.status().await.leader.as_ref() != Some(&leader) {
        assert!(start.elapsed() < TIMEOUT, "follower never learned the leader");
        sleep(Duration::from_millis(50)).await;
    }

    let mut kv = harness.make_kv_client(follower).await.expect("client");
    let status = kv
        .set(SetRequest {
            key: b"k".to_vec(),
            value: b"v".to_vec(),
        })
        .await
        .expect_err("follower write");
    assert_eq!(status.code(), Code::FailedPrecondition);
    assert!(status.message().contains(&leader.address));

    // Nothing was written anywhere.
    let status = kv
        .get(crate::keyvalue::grpc::GetRequest { key: b"k".to_vec() })
        .await
        .expect_err("absent");
    assert_eq!(status.code(), Code::NotFound);

    harness.stop().await;
}

#[tokio::test]
async fn test_rest_gateway() {
    let harness = make_harness(&NAMES).await;
    let (_, leader) = harness
        .wait_for_leader(TIMEOUT, term_greater(0))
        .await
        .expect("leader");

    // The rest api is served on the same port as the grpc services.
    let http = reqwest::Client::new();
    let base = format!("http://{}", leader.address);
    let response = http
        .post(format!("{}/v1/kv", base))
        .json(&serde_json::json!({ "key": "greeting", "value": "hello" }))
        .send()
        .await
        .expect("post");
    assert!(response.status().is_success());

    let response = http
        .get(format!("{}/v1/kv/greeting", base))
        .send()
        .await
        .expect("get");
    assert!(response.status().is_success());
    assert_eq!(response.bytes().await.expect("body"), Bytes::from("hello"));

    let response = http
        .get(format!("{}/v1/cluster", base))
        .send()
        .await
        .expect("status");
    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["role"], "leader");
    assert_eq!(body["peers"].as_array().map(|p| p.len()), Some(3));

    harness.stop().await;
}

#[tokio::test]
async fn test_disconnect_leader() {
    let harness = make_harness(&NAMES).await;

    // Wait for the initial leader and capture its term and server.
    let (term1, leader1) = harness
        .wait_for_leader(TIMEOUT, term_greater(0))
        .await
        .expect("leader");
    harness.failures().lock().await.disconnect(&leader1.id);

    // Wait for a new leader (i.e, for a higher term).
    let (term2, leader2) = harness
        .wait_for_leader(TIMEOUT, term_greater(term1))
        .await
        .expect("leader");
    assert_ne!(leader2.id, leader1.id);

    // The remaining majority keeps accepting writes.
    let mut kv = harness.make_kv_client(&leader2.id).await.expect("client");
    kv.set(SetRequest {
        key: b"after-failover".to_vec(),
        value: b"v".to_vec(),
    })
    .await
    .expect("set");

    // Now reconnect the original leader, and disconnect the second one.
    harness.failures().lock().await.reconnect(&leader1.id);
    harness.failures().lock().await.disconnect(&leader2.id);

    let (_, leader3) = harness
        .wait_for_leader(TIMEOUT, term_greater(term2))
        .await
        .expect("leader");
    assert_ne!(leader3.id, leader2.id);

    // The write made it to the new leader as well.
    harness
        .wait_for_value(&leader3.id, b"after-failover", TIMEOUT, |v| v.is_some())
        .await;

    harness.validate().await;
    harness.stop().await;
}

#[tokio::test]
async fn test_join_and_leave() {
    let names = ["A", "B", "C", "D"];
    let harness = make_harness(&names).await;
    let (_, leader) = harness
        .wait_for_leader(TIMEOUT, term_greater(0))
        .await
        .expect("leader");
    let joiner = harness
        .addresses()
        .into_iter()
        .find(|m| m.id == "D")
        .expect("joiner");

    let mut cluster = harness
        .make_cluster_client(&leader.id)
        .await
        .expect("client");
    cluster
        .join(JoinRequest {
            id: joiner.id.clone(),
            address: joiner.address.clone(),
        })
        .await
        .expect("join");

    let status = cluster
        .status(StatusRequest {})
        .await
        .expect("status")
        .into_inner();
    assert_eq!(status.peers.len(), 4);

    // Joining again is rejected and leaves the cluster as it was.
    let error = cluster
        .join(JoinRequest {
            id: joiner.id.clone(),
            address: joiner.address.clone(),
        })
        .await
        .expect_err("duplicate");
    assert_eq!(error.code(), Code::AlreadyExists);

    // The new member catches up with writes.
    let mut kv = harness.make_kv_client(&leader.id).await.expect("client");
    kv.set(SetRequest {
        key: b"joined".to_vec(),
        value: b"yes".to_vec(),
    })
    .await
    .expect("set");
    harness
        .wait_for_value("D", b"joined", TIMEOUT, |v| v.is_some())
        .await;

    cluster
        .leave(LeaveRequest {
            id: joiner.id.clone(),
        })
        .await
        .expect("leave");
    let status = cluster
        .status(StatusRequest {})
        .await
        .expect("status")
        .into_inner();
    assert_eq!(status.peers.len(), 3);
    assert!(status.peers.iter().all(|p| p.id != "D"));

    harness.validate().await;
    harness.stop().await;
}

#[tokio::test]
async fn test_snapshotting() {
    let options = test_options().with_compaction(2000);
    let harness = make_harness_with_options(&NAMES, options).await;
    let (_, leader) = harness
        .wait_for_leader(TIMEOUT, term_greater(0))
        .await
        .expect("leader");

    // Disconnect a node that will later have to catch up.
    let lagging = other_than(&leader);
    harness.failures().lock().await.disconnect(lagging);

    let mut kv = harness.make_kv_client(&leader.id).await.expect("client");
    for i in 0..30 {
        kv.set(SetRequest {
            key: format!("key-{}", i).into_bytes(),
            value: vec![i as u8; 200],
        })
        .await
        .expect("set");
    }

    harness.failures().lock().await.reconnect(lagging);

    // The leader no longer has the early entries, so the node has to catch
    // up through a snapshot.
    let snapshot = harness.wait_for_snapshot(lagging, TIMEOUT).await;
    assert!(snapshot.size_bytes > 0);
    assert!(snapshot.last_index > 0);

    harness
        .wait_for_value(lagging, b"key-29", TIMEOUT, |v| {
            v == &Some(Bytes::from(vec![29u8; 200]))
        })
        .await;

    harness.validate().await;
    harness.stop().await;
}

#[tokio::test]
async fn test_catch_up_with_large_state() {
    let options = test_options().with_compaction(2000);
    let harness = make_harness_with_options(&NAMES, options).await;
    let (_, leader) = harness
        .wait_for_leader(TIMEOUT, term_greater(0))
        .await
        .expect("leader");

    let lagging = other_than(&leader);
    harness.failures().lock().await.disconnect(lagging);

    // Neither the snapshot nor the missed log fit into a default sized grpc
    // message.
    let mut kv = harness.make_kv_client(&leader.id).await.expect("client");
    for i in 0..6 {
        kv.set(SetRequest {
            key: format!("large-{}", i).into_bytes(),
            value: vec![i as u8; 1024 * 1024],
        })
        .await
        .expect("set");
    }

    harness.failures().lock().await.reconnect(lagging);

    let snapshot = harness.wait_for_snapshot(lagging, TIMEOUT).await;
    assert!(snapshot.size_bytes > 4 * 1024 * 1024);
    harness
        .wait_for_value(lagging, b"large-5", TIMEOUT, |v| {
            v.as_ref().map(|b| b.len()) == Some(1024 * 1024)
        })
        .await;

    harness.validate().await;
    harness.stop().await;
}

// Convenience method that returns a matcher for terms greater than a value.
fn term_greater(n: i64) -> Box<dyn Fn(&(i64, Member)) -> bool> {
    Box::new(move |(term, _)| *term > n)
}

// Returns one of the initial voters which is not the supplied member.
fn other_than(member: &Member) -> &'static str {
    NAMES
        .into_iter()
        .find(|n| *n != member.id)
        .expect("other member")
}

// Timeouts are much shorter than in production so that tests run quickly.
fn test_options() -> Options {
    Options::new_without_persistence_for_testing()
        .with_timeouts(300, 400, 50)
        .with_rpc_timeout(500)
}

async fn make_harness(nodes: &[&str]) -> Harness {
    make_harness_with_options(nodes, test_options()).await
}

async fn make_harness_with_options(nodes: &[&str], options: Options) -> Harness {
    let (harness, serving) = Harness::builder("test-cluster", nodes)
        .await
        .expect("builder")
        .with_options(options)
        .build()
        .await
        .expect("harness");
    harness.start().await;
    tokio::spawn(serving);
    harness
}
