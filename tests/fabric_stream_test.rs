mod common;

use std::time::Duration;

use libsdk::{Fabric, ReplayPolicy};

/// History first, then the tail: a consumer attached from the beginning
/// replays everything, reports caught-up, and keeps receiving new messages.
#[tokio::test]
async fn replay_from_beginning_then_live_tail() {
    let (_dir, fabric) = common::temp_fabric();
    let conn = fabric.replayer("store", ReplayPolicy::FromBeginning).unwrap();

    conn.publish(b"one".to_vec()).await.unwrap();
    conn.publish(b"two".to_vec()).await.unwrap();

    let mut replay = conn.replay().await.unwrap();

    let first = replay.deliveries.recv().await.unwrap();
    assert_eq!(first.payload(), b"one");
    first.ack();

    let second = replay.deliveries.recv().await.unwrap();
    assert_eq!(second.payload(), b"two");
    second.ack();

    // Both attach-time messages are acked: the latch fires.
    replay.caught_up.wait().await;

    // The loop continues to deliver new messages as they arrive.
    conn.publish(b"three".to_vec()).await.unwrap();
    let third = replay.deliveries.recv().await.unwrap();
    assert_eq!(third.payload(), b"three");
    third.ack();
}

/// An empty subject is caught up immediately.
#[tokio::test]
async fn empty_subject_fires_caught_up_immediately() {
    let (_dir, fabric) = common::temp_fabric();
    let conn = fabric.replayer("store", ReplayPolicy::FromBeginning).unwrap();

    let mut replay = conn.replay().await.unwrap();
    replay.caught_up.wait().await;
}

/// The caught-up latch does not fire before attach-time history has been
/// delivered and acknowledged.
#[tokio::test]
async fn caught_up_waits_for_history_to_be_acked() {
    let (_dir, fabric) = common::temp_fabric();
    let conn = fabric.replayer("store", ReplayPolicy::FromBeginning).unwrap();

    conn.publish(b"pending".to_vec()).await.unwrap();

    let mut replay = conn.replay().await.unwrap();

    // Nothing acked yet: the latch must still be pending.
    let premature =
        tokio::time::timeout(Duration::from_millis(50), replay.caught_up.wait()).await;
    assert!(premature.is_err(), "latch fired before history was acked");

    let delivery = replay.deliveries.recv().await.unwrap();
    delivery.ack();

    replay.caught_up.wait().await;
}

/// NewOnly consumers skip history and start at the tail.
#[tokio::test]
async fn new_only_policy_skips_history() {
    let (_dir, fabric) = common::temp_fabric();
    let conn = fabric.replayer("store", ReplayPolicy::NewOnly).unwrap();

    conn.publish(b"old".to_vec()).await.unwrap();

    let mut replay = conn.replay().await.unwrap();
    replay.caught_up.wait().await;

    conn.publish(b"new".to_vec()).await.unwrap();

    let delivery = replay.deliveries.recv().await.unwrap();
    assert_eq!(delivery.payload(), b"new");
    delivery.ack();
}

/// Subjects are isolated: a store consumer never sees pub traffic.
#[tokio::test]
async fn subjects_are_isolated() {
    let (_dir, fabric) = common::temp_fabric();

    let pub_conn = fabric.replayer("pub", ReplayPolicy::FromBeginning).unwrap();
    let store_conn = fabric.replayer("store", ReplayPolicy::FromBeginning).unwrap();

    pub_conn.publish(b"broadcast".to_vec()).await.unwrap();
    store_conn.publish(b"record".to_vec()).await.unwrap();

    let mut replay = store_conn.replay().await.unwrap();

    let delivery = replay.deliveries.recv().await.unwrap();
    assert_eq!(delivery.payload(), b"record");
    delivery.ack();
    replay.caught_up.wait().await;

    let extra = tokio::time::timeout(Duration::from_millis(50), replay.deliveries.recv()).await;
    assert!(extra.is_err(), "store consumer received pub traffic");
}

/// A delivery dropped without ack is redelivered; the consumer does not
/// advance past it.
#[tokio::test]
async fn unacked_delivery_is_redelivered() {
    let (_dir, fabric) = common::temp_fabric();
    let conn = fabric.replayer("store", ReplayPolicy::FromBeginning).unwrap();

    conn.publish(b"first".to_vec()).await.unwrap();
    conn.publish(b"second".to_vec()).await.unwrap();

    let mut replay = conn.replay().await.unwrap();

    let dropped = replay.deliveries.recv().await.unwrap();
    assert_eq!(dropped.payload(), b"first");
    drop(dropped);

    // Same message again, not the next one.
    let redelivered = replay.deliveries.recv().await.unwrap();
    assert_eq!(redelivered.payload(), b"first");
    redelivered.ack();

    let next = replay.deliveries.recv().await.unwrap();
    assert_eq!(next.payload(), b"second");
    next.ack();
}

/// Two fabric connections over the same shared directory see one stream:
/// what one publishes, the other replays.
#[tokio::test]
async fn shared_stream_across_fabric_instances() {
    let (dir, fabric_a) = common::temp_fabric();
    let fabric_b = common::fabric_at(dir.path());

    let conn_a = fabric_a.replayer("store", ReplayPolicy::FromBeginning).unwrap();
    let conn_b = fabric_b.replayer("store", ReplayPolicy::FromBeginning).unwrap();

    conn_a.publish(b"from-a".to_vec()).await.unwrap();

    let mut replay = conn_b.replay().await.unwrap();
    let delivery = replay.deliveries.recv().await.unwrap();
    assert_eq!(delivery.payload(), b"from-a");
    delivery.ack();
    replay.caught_up.wait().await;
}

/// Consumers are disposable: replaying twice yields two independent
/// cursors over the full history.
#[tokio::test]
async fn each_attach_gets_its_own_cursor() {
    let (_dir, fabric) = common::temp_fabric();
    let conn = fabric.replayer("store", ReplayPolicy::FromBeginning).unwrap();

    conn.publish(b"only".to_vec()).await.unwrap();

    for _ in 0..2 {
        let mut replay = conn.replay().await.unwrap();
        let delivery = replay.deliveries.recv().await.unwrap();
        assert_eq!(delivery.payload(), b"only");
        delivery.ack();
        replay.caught_up.wait().await;
    }
}
