//! Bulk migration: staged replica moves gated on replication catch-up.

mod common;

use common::{call, ping, pull_table, report, spawn_cluster, spawn_cluster_with, wait_until};
use strato_meta::cluster::{MigrationItem, Node, PartitionStatus};
use strato_meta::wire::{Request, StatusCode};

fn item(table: &str, partition: u32, from: &Node, to: &Node) -> MigrationItem {
    MigrationItem {
        table: table.into(),
        partition,
        from: from.clone(),
        to: to.clone(),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn migration_replaces_a_slave_once_the_target_catches_up() {
    let cluster = spawn_cluster(1).await;
    let addr = cluster.nodes[0].cmd_addr();

    let m = Node::new("1.1.1.1", 10);
    let a = Node::new("1.1.1.1", 20);
    let b = Node::new("1.1.1.1", 30);

    // Only m and a are up at Init time, so partition 0 is m -> {a}.
    ping(&addr, &m, vec![report("t", 0, 1, 1000)]).await;
    ping(&addr, &a, vec![report("t", 0, 1, 1000)]).await;
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

    // The migration target starts far behind. Its first heartbeat also
    // announces it, which bumps the epoch shortly after, so the batch is
    // submitted with a freshly pulled epoch until one sticks.
    ping(&addr, &b, vec![report("t", 0, 1, 100)]).await;
    wait_until("batch accepted at the current epoch", || async {
        let (epoch, _) = pull_table(&addr, "t").await.expect("table");
        let resp = call(
            &addr,
            &Request::Migrate {
                epoch,
                items: vec![item("t", 0, &a, &b)],
            },
        )
        .await;
        resp.code == StatusCode::Ok
    })
    .await;

    // Stale epochs are rejected before anything is registered.
    let (epoch, _) = pull_table(&addr, "t").await.expect("table");
    let resp = call(
        &addr,
        &Request::Migrate {
            epoch: epoch + 1000,
            items: vec![item("t", 0, &a, &b)],
        },
    )
    .await;
    assert_eq!(resp.code, StatusCode::InvalidArgument);

    // Target joins as a slave and the partition sticks while it lags.
    wait_until("target added and partition stuck", || async {
        ping(&addr, &m, vec![report("t", 0, 1, 1000)]).await;
        ping(&addr, &a, vec![report("t", 0, 1, 1000)]).await;
        ping(&addr, &b, vec![report("t", 0, 1, 100)]).await;
        matches!(pull_table(&addr, "t").await, Some((_, table))
            if table.partitions[0].slaves.contains(&b)
                && table.partitions[0].status == PartitionStatus::Stuck)
    })
    .await;

    // Catch-up releases RemoveSlave(from) then SetActive.
    wait_until("source removed and partition active", || async {
        ping(&addr, &m, vec![report("t", 0, 1, 1000)]).await;
        ping(&addr, &a, vec![report("t", 0, 1, 1000)]).await;
        ping(&addr, &b, vec![report("t", 0, 1, 1000)]).await;
        matches!(pull_table(&addr, "t").await, Some((_, table))
            if !table.partitions[0].slaves.contains(&a)
                && table.partitions[0].slaves.contains(&b)
                && table.partitions[0].status == PartitionStatus::Active
                && table.partitions[0].master == Some(m.clone()))
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_clears_the_pending_tail_of_a_batch() {
    // One item per drain step so the second item stays registered.
    let cluster = spawn_cluster_with(1, |cfg| {
        cfg.migrate_once_count = 1;
    })
    .await;
    let addr = cluster.nodes[0].cmd_addr();

    let m = Node::new("1.1.1.1", 10);
    let a = Node::new("1.1.1.1", 20);
    let b = Node::new("1.1.1.1", 30);
    let c = Node::new("1.1.1.1", 40);

    ping(&addr, &m, vec![report("t", 0, 1, 1000)]).await;
    ping(&addr, &a, vec![report("t", 0, 1, 1000)]).await;
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

    // Neither target ever reports an offset, so the first item never fires
    // and the second never leaves the register.
    let (epoch, _) = pull_table(&addr, "t").await.expect("table");
    let resp = call(
        &addr,
        &Request::Migrate {
            epoch,
            items: vec![item("t", 0, &a, &b), item("t", 0, &a, &c)],
        },
    )
    .await;
    assert_eq!(resp.code, StatusCode::Ok, "{}", resp.msg);

    // Let the first item's staging commits settle, then verify the tail
    // still blocks a new batch.
    wait_until("first item staged", || async {
        matches!(pull_table(&addr, "t").await, Some((_, table))
            if table.partitions[0].slaves.contains(&b)
                && table.partitions[0].status == PartitionStatus::Stuck)
    })
    .await;
    let (epoch, _) = pull_table(&addr, "t").await.expect("table");
    let resp = call(
        &addr,
        &Request::Migrate {
            epoch,
            items: vec![item("t", 0, &a, &c)],
        },
    )
    .await;
    assert_eq!(resp.code, StatusCode::InvalidArgument, "{}", resp.msg);

    let resp = call(&addr, &Request::CancelMigrate).await;
    assert_eq!(resp.code, StatusCode::Ok, "{}", resp.msg);

    // With the register cleared, a fresh batch is accepted again.
    wait_until("new batch accepted after cancel", || async {
        ping(&addr, &m, vec![report("t", 0, 1, 1000)]).await;
        ping(&addr, &a, vec![report("t", 0, 1, 1000)]).await;
        let (epoch, _) = pull_table(&addr, "t").await.expect("table");
        let resp = call(
            &addr,
            &Request::Migrate {
                epoch,
                items: vec![item("t", 0, &a, &c)],
            },
        )
        .await;
        resp.code == StatusCode::Ok
    })
    .await;
}
