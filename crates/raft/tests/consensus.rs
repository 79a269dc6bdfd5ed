//! Integration tests for the consensus node in single-node mode.

use chrono::DateTime;
use domain::{Command, CommandResponse, FilamentKind, FilamentSpec, PrinterSpec, PrintJobSpec};
use fsm::PrintFsm;
use raft::{ConsensusNode, NodeConfig};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn node_config(dir: &Path) -> NodeConfig {
    NodeConfig::new(1, dir.to_path_buf())
        .with_raft_addr("127.0.0.1:0")
        .with_bootstrap(true)
}

async fn start_node(dir: &Path) -> (ConsensusNode, Arc<PrintFsm>) {
    let fsm = Arc::new(PrintFsm::new());
    let node = ConsensusNode::start(node_config(dir), fsm.clone())
        .await
        .unwrap();
    (node, fsm)
}

fn create_printer_cmd(company: &str) -> Command {
    Command::CreatePrinter {
        printer: PrinterSpec {
            id: String::new(),
            company: company.into(),
            model: "Ender 3".into(),
        },
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bootstrap_elects_self() {
    let tmp = TempDir::new().unwrap();
    let (node, _fsm) = start_node(tmp.path()).await;

    assert!(node.is_leader());
    let status = node.status();
    assert_eq!(status.leader_id, Some(1));
    assert!(status.is_leader);
    assert_eq!(status.state, "Leader");
    assert_eq!(status.nodes.len(), 1);

    node.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn apply_reaches_the_fsm() {
    let tmp = TempDir::new().unwrap();
    let (node, fsm) = start_node(tmp.path()).await;

    let resp = node.apply(create_printer_cmd("Creality")).await.unwrap();
    let printer = match resp {
        CommandResponse::Printer(p) => p,
        other => panic!("unexpected response: {other:?}"),
    };
    assert_eq!(printer.id, "1");

    // Reads observe the write on the same node.
    assert_eq!(fsm.printers().len(), 1);

    node.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn domain_rejection_is_an_applied_result() {
    let tmp = TempDir::new().unwrap();
    let (node, _fsm) = start_node(tmp.path()).await;

    node.apply(create_printer_cmd("Creality")).await.unwrap();
    node.apply(Command::CreateFilament {
        filament: FilamentSpec {
            id: String::new(),
            kind: FilamentKind::PLA,
            color: "black".into(),
            total_weight_in_grams: 100,
            remaining_weight_in_grams: 0,
        },
    })
    .await
    .unwrap();

    let submitted_at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
    let job = |weight: u32| Command::CreatePrintJob {
        job: PrintJobSpec {
            id: String::new(),
            printer_id: "1".into(),
            filament_id: "1".into(),
            filepath: "/prints/benchy.gcode".into(),
            print_weight_in_grams: weight,
        },
        submitted_at,
    };

    let first = node.apply(job(60)).await.unwrap();
    assert!(matches!(first, CommandResponse::PrintJob(_)));

    // Over budget: the command applies, the rejection is its result.
    let second = node.apply(job(50)).await.unwrap();
    match second {
        CommandResponse::Rejected(err) => assert_eq!(
            err.to_string(),
            "not enough filament: needs 50 grams but only 40 grams available"
        ),
        other => panic!("expected rejection, got {other:?}"),
    }

    node.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_replays_log_into_fresh_fsm() {
    let tmp = TempDir::new().unwrap();

    {
        let (node, _fsm) = start_node(tmp.path()).await;
        node.apply(create_printer_cmd("Creality")).await.unwrap();
        node.apply(create_printer_cmd("Prusa")).await.unwrap();
        node.shutdown().await.unwrap();
    }

    let (node, fsm) = start_node(tmp.path()).await;
    // Give startup replay a moment to finish before reading.
    for _ in 0..100 {
        if fsm.printers().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let mut companies: Vec<String> = fsm.printers().into_iter().map(|p| p.company).collect();
    companies.sort();
    assert_eq!(companies, vec!["Creality".to_string(), "Prusa".to_string()]);

    // The allocator resumed past the replayed ids.
    let resp = node.apply(create_printer_cmd("Bambu")).await.unwrap();
    assert!(matches!(resp, CommandResponse::Printer(p) if p.id == "3"));

    node.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_recovers_from_snapshot() {
    let tmp = TempDir::new().unwrap();

    {
        let (node, _fsm) = start_node(tmp.path()).await;
        for i in 0..10 {
            node.apply(create_printer_cmd(&format!("Maker{i}")))
                .await
                .unwrap();
        }
        node.trigger_snapshot().await.unwrap();
        // Let the snapshot worker finish before stopping.
        tokio::time::sleep(Duration::from_millis(200)).await;
        node.shutdown().await.unwrap();
    }

    let (node, fsm) = start_node(tmp.path()).await;
    for _ in 0..100 {
        if fsm.printers().len() == 10 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(fsm.printers().len(), 10);

    node.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn add_voter_is_idempotent_for_existing_member() {
    let tmp = TempDir::new().unwrap();
    let (node, _fsm) = start_node(tmp.path()).await;

    // Re-adding the only member under its own id succeeds as a no-op.
    let addr = node.raft_addr().to_string();
    node.add_voter(1, addr).await.unwrap();
    assert_eq!(node.status().nodes.len(), 1);

    node.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn membership_growth_to_three_nodes() {
    let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();

    let n1 = {
        let fsm = Arc::new(PrintFsm::new());
        ConsensusNode::start(
            NodeConfig::new(1, dirs[0].path().to_path_buf())
                .with_raft_addr("127.0.0.1:0")
                .with_bootstrap(true),
            fsm,
        )
        .await
        .unwrap()
    };

    let start_follower = |id: u64, dir: std::path::PathBuf| async move {
        let fsm = Arc::new(PrintFsm::new());
        let node = ConsensusNode::start(
            NodeConfig::new(id, dir).with_raft_addr("127.0.0.1:0"),
            fsm.clone(),
        )
        .await
        .unwrap();
        (node, fsm)
    };
    let (n2, fsm2) = start_follower(2, dirs[1].path().to_path_buf()).await;
    let (n3, _fsm3) = start_follower(3, dirs[2].path().to_path_buf()).await;

    n1.add_voter(2, n2.raft_addr().to_string()).await.unwrap();
    n1.add_voter(3, n3.raft_addr().to_string()).await.unwrap();

    // Every node converges on the same leader and full membership.
    for node in [&n1, &n2, &n3] {
        for _ in 0..300 {
            let status = node.status();
            if status.nodes.len() == 3 && status.leader_id == Some(1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let status = node.status();
        assert_eq!(status.nodes.len(), 3);
        assert_eq!(status.leader_id, Some(1));
        assert_eq!(status.leader_addr.as_deref(), Some(n1.raft_addr()));
    }

    // A write on the leader replicates to followers.
    n1.apply(create_printer_cmd("Creality")).await.unwrap();
    for _ in 0..300 {
        if fsm2.printers().len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(fsm2.printers().len(), 1);

    // A write on a follower is refused with the leader's address.
    let err = n2.apply(create_printer_cmd("Prusa")).await.unwrap_err();
    match err {
        raft::ConsensusError::NotLeader { leader_id, leader_addr } => {
            assert_eq!(leader_id, Some(1));
            assert_eq!(leader_addr.as_deref(), Some(n1.raft_addr()));
        }
        other => panic!("expected NotLeader, got {other:?}"),
    }

    for node in [n3, n2, n1] {
        node.shutdown().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn apply_after_shutdown_fails() {
    let tmp = TempDir::new().unwrap();
    let (node, _fsm) = start_node(tmp.path()).await;
    node.shutdown().await.unwrap();

    let err = node.apply(create_printer_cmd("Creality")).await.unwrap_err();
    assert!(matches!(
        err,
        raft::ConsensusError::Shutdown | raft::ConsensusError::Internal(_)
    ));
}
