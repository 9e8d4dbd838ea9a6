//! Mastership hand-off waits for the candidate to catch up.

mod common;

use std::time::Duration;

use common::{call, ping, pull_table, report, spawn_cluster, wait_until};
use strato_meta::cluster::{Node, PartitionStatus};
use strato_meta::wire::{Request, StatusCode};

#[tokio::test(flavor = "multi_thread")]
async fn set_master_sticks_the_partition_until_catch_up() {
    let cluster = spawn_cluster(1).await;
    let addr = cluster.nodes[0].cmd_addr();

    let m = Node::new("1.1.1.1", 10);
    let s = Node::new("1.1.1.1", 20);
    ping(&addr, &m, vec![report("t", 0, 1, 1000)]).await;
    ping(&addr, &s, vec![report("t", 0, 1, 500)]).await;
    wait_until("nodes up", || async {
        common::node_states(&addr).await.len() == 2
    })
    .await;

    call(
        &addr,
        &Request::Init {
            table: "t".into(),
            partitions: 1,
        },
    )
    .await;
    wait_until("table visible", || async {
        pull_table(&addr, "t").await.is_some()
    })
    .await;

    let resp = call(
        &addr,
        &Request::SetMaster {
            node: s.clone(),
            table: "t".into(),
            partition: 0,
        },
    )
    .await;
    assert_eq!(resp.code, StatusCode::Ok, "{}", resp.msg);

    // The partition goes Stuck immediately, with the old master still in place.
    wait_until("partition stuck", || async {
        matches!(pull_table(&addr, "t").await, Some((_, table))
            if table.partitions[0].status == PartitionStatus::Stuck)
    })
    .await;

    // While the candidate lags, the hand-off must not commit.
    for _ in 0..6 {
        ping(&addr, &m, vec![report("t", 0, 1, 1000)]).await;
        ping(&addr, &s, vec![report("t", 0, 1, 500)]).await;
        let (_, table) = pull_table(&addr, "t").await.expect("table");
        assert_eq!(table.partitions[0].master, Some(m.clone()), "hand-off too early");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Catch-up ping releases the deferred SetMaster.
    wait_until("hand-off commits after catch-up", || async {
        ping(&addr, &s, vec![report("t", 0, 1, 1000)]).await;
        matches!(pull_table(&addr, "t").await, Some((_, table))
            if table.partitions[0].master == Some(s.clone())
                && table.partitions[0].status == PartitionStatus::Active)
    })
    .await;

    let (_, table) = pull_table(&addr, "t").await.expect("table");
    assert!(
        table.partitions[0].slaves.contains(&m),
        "old master becomes a slave"
    );

    // Naming a non-replica is rejected outright.
    let resp = call(
        &addr,
        &Request::SetMaster {
            node: Node::new("1.1.1.1", 99),
            table: "t".into(),
            partition: 0,
        },
    )
    .await;
    assert_eq!(resp.code, StatusCode::InvalidArgument);

    // Naming the current master is an idempotent no-op.
    let resp = call(
        &addr,
        &Request::SetMaster {
            node: s,
            table: "t".into(),
            partition: 0,
        },
    )
    .await;
    assert_eq!(resp.code, StatusCode::Ok);
}
