// Port-level integration tests against a scripted fake chassis.
//
// The fake accepts one connection, logs every received command line
// and answers through a handler closure, so each test scripts exactly
// the protocol exchange it needs.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use valkyrie_api::{ChassisConnection, SharedConnection, TransportConfig};
use valkyrie_core::{
    CaptureBufferType, CoreError, ModifierAction, ModifierKind, ModifierSpec, Port, StreamState,
    TpldAllocator, PORT_STATS_GROUPS,
};

type CommandLog = Arc<Mutex<Vec<String>>>;

/// Spawn a single-connection fake chassis. Every received line is
/// logged and answered with the handler's reply lines.
async fn fake_chassis<F>(handler: F) -> (SharedConnection, CommandLog, JoinHandle<()>)
where
    F: Fn(&str) -> Vec<String> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let log: CommandLog = Arc::new(Mutex::new(Vec::new()));

    let task_log = Arc::clone(&log);
    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            task_log.lock().unwrap().push(line.clone());
            for reply in handler(&line) {
                write.write_all(reply.as_bytes()).await.unwrap();
                write.write_all(b"\n").await.unwrap();
            }
        }
    });

    let config = TransportConfig::new("127.0.0.1")
        .with_port(port)
        .with_read_timeout(Duration::from_millis(500));
    let mut conn = ChassisConnection::new(config);
    conn.connect().await.unwrap();
    (conn.into_shared(), log, handle)
}

fn logged(log: &CommandLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

#[tokio::test]
async fn stream_discovery_seeds_names_and_tpld_allocator() {
    let (conn, log, _fake) = fake_chassis(|cmd| {
        let reply = if cmd.contains("ps_indices") {
            "0/1 PS_INDICES 0 2".to_owned()
        } else if cmd.contains("ps_comment [0]") {
            "0/1 PS_COMMENT [0] \"first stream\"".to_owned()
        } else if cmd.contains("ps_comment [2]") {
            "0/1 PS_COMMENT [2]".to_owned()
        } else if cmd.contains("ps_tpldid [0]") {
            "0/1 PS_TPLDID [0] 4".to_owned()
        } else if cmd.contains("ps_tpldid [2]") {
            // Payload tracking off for this stream.
            "0/1 PS_TPLDID [2] -1".to_owned()
        } else {
            "<OK>".to_owned()
        };
        vec![reply]
    })
    .await;

    let alloc = Arc::new(TpldAllocator::new());
    let mut port = Port::new(conn, "0/1", Arc::clone(&alloc)).unwrap();

    let streams = port.ensure_streams().await.unwrap();
    assert_eq!(streams.keys().copied().collect::<Vec<_>>(), vec![0, 2]);
    assert_eq!(streams[&0].name(), "first stream");
    // No comment set, the name defaults to the index.
    assert_eq!(streams[&2].name(), "0/1/2");

    // Discovery retired ids up to 4; the next implicit id follows them.
    assert_eq!(alloc.peek(), 5);

    // A second call answers from the cache without device traffic.
    let before = logged(&log).len();
    port.ensure_streams().await.unwrap();
    assert_eq!(logged(&log).len(), before);
}

#[tokio::test]
async fn add_stream_assigns_monotonic_tpld_ids() {
    let (conn, log, _fake) = fake_chassis(|cmd| {
        let reply = if cmd.contains("ps_indices") {
            // Empty port.
            "0/1 PS_INDICES".to_owned()
        } else {
            "<OK>".to_owned()
        };
        vec![reply]
    })
    .await;

    let alloc = Arc::new(TpldAllocator::new());
    let mut port = Port::new(conn, "0/1", alloc).unwrap();

    port.add_stream(Some("first"), Some(5), StreamState::Enabled)
        .await
        .unwrap();
    port.add_stream(None, Some(3), StreamState::Enabled)
        .await
        .unwrap();
    // No explicit id: one past the highest id ever seen.
    let stream = port
        .add_stream(None, None, StreamState::Suspended)
        .await
        .unwrap();
    assert_eq!(stream.id(), 2);

    let sent = logged(&log);
    assert!(sent.contains(&"0/1 ps_create [0]".to_owned()));
    assert!(sent.contains(&"0/1 ps_comment [0] \"first\"".to_owned()));
    assert!(sent.contains(&"0/1 ps_tpldid [0] 5".to_owned()));
    assert!(sent.contains(&"0/1 ps_tpldid [1] 3".to_owned()));
    assert!(sent.contains(&"0/1 ps_tpldid [2] 6".to_owned()));
    assert!(sent.contains(&"0/1 ps_enable [2] SUPPRESS".to_owned()));
}

#[tokio::test]
async fn remove_stream_requires_existing_id() {
    let (conn, _log, _fake) = fake_chassis(|cmd| {
        let reply = if cmd.contains("ps_indices") {
            "0/1 PS_INDICES".to_owned()
        } else {
            "<OK>".to_owned()
        };
        vec![reply]
    })
    .await;

    let mut port = Port::new(conn, "0/1", Arc::new(TpldAllocator::new())).unwrap();
    let err = port.remove_stream(9).await.unwrap_err();
    assert!(matches!(err, CoreError::NotFound { entity: "stream", .. }));
}

#[tokio::test]
async fn wait_for_up_observes_exactly_timeout_times() {
    let (conn, log, _fake) = fake_chassis(|cmd| {
        assert!(cmd.contains("p_receivesync"));
        vec!["0/1 P_RECEIVESYNC NO_SYNC".to_owned()]
    })
    .await;

    let port = Port::new(conn, "0/1", Arc::new(TpldAllocator::new())).unwrap();
    let err = port.wait_for_up(2).await.unwrap_err();
    match err {
        CoreError::StateTimeout {
            attribute,
            last,
            elapsed_secs,
            ..
        } => {
            assert_eq!(attribute, "p_receivesync");
            assert_eq!(last, "NO_SYNC");
            assert_eq!(elapsed_secs, 2);
        }
        other => panic!("expected StateTimeout, got {other:?}"),
    }
    assert_eq!(logged(&log).len(), 2);
}

#[tokio::test]
async fn load_config_skips_comments_and_rejected_commands() {
    let (conn, log, _fake) = fake_chassis(|cmd| {
        let reply = if cmd.contains("P_OBSOLETE") {
            "<BADCOMMAND>".to_owned()
        } else {
            "<OK>".to_owned()
        };
        vec![reply]
    })
    .await;
    let port = Port::new(conn, "0/1", Arc::new(TpldAllocator::new())).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("port.xpc");
    std::fs::write(
        &config,
        ";Port: 0/1\nP_RESET\nP_COMMENT \"loaded\"\nP_OBSOLETE 1\nP_SPEEDSEL AUTO\n",
    )
    .unwrap();

    // The rejected command is logged and skipped, not fatal.
    port.load_config(&config).await.unwrap();

    let sent = logged(&log);
    assert_eq!(
        sent,
        vec![
            "0/1 P_RESET",
            "0/1 P_COMMENT \"loaded\"",
            "0/1 P_OBSOLETE 1",
            "0/1 P_SPEEDSEL AUTO",
        ]
    );
}

#[tokio::test]
async fn save_config_writes_replayable_commands() {
    let (conn, _log, _fake) = fake_chassis(|cmd| {
        assert!(cmd.contains("p_fullconfig"));
        vec![
            "0/1 P_SPEEDSEL AUTO".to_owned(),
            "0/1 P_COMMENT \"dut\"".to_owned(),
            String::new(),
        ]
    })
    .await;
    let port = Port::new(conn, "0/1", Arc::new(TpldAllocator::new())).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("port.xpc");
    port.save_config(&path).await.unwrap();

    let saved = std::fs::read_to_string(&path).unwrap();
    assert_eq!(
        saved,
        ";Port: 0/1\nP_RESET\nP_SPEEDSEL AUTO\nP_COMMENT \"dut\"\n"
    );
}

#[tokio::test]
async fn capture_renders_text_dump_per_packet() {
    let (conn, _log, _fake) = fake_chassis(|cmd| {
        let reply = if cmd.contains("pc_stats") {
            // status, packets, starttime.
            "0/1 PC_STATS 1 2 1234".to_owned()
        } else if cmd.contains("pc_packet [0]") {
            "0/1 PC_PACKET [0] 0xAABBCCDD".to_owned()
        } else if cmd.contains("pc_packet [1]") {
            "0/1 PC_PACKET [1] 0x00112233".to_owned()
        } else {
            "<OK>".to_owned()
        };
        vec![reply]
    })
    .await;
    let mut port = Port::new(conn, "0/1", Arc::new(TpldAllocator::new())).unwrap();

    let packets = port
        .capture()
        .unwrap()
        .get_packets(0, None, CaptureBufferType::Text, None, None)
        .await
        .unwrap();
    assert_eq!(
        packets,
        vec!["\n000000 AA BB CC DD", "\n000000 00 11 22 33"]
    );
}

#[tokio::test]
async fn capture_raw_strips_hex_marker() {
    let (conn, _log, _fake) = fake_chassis(|cmd| {
        let reply = if cmd.contains("pc_stats") {
            "0/1 PC_STATS 1 1 0".to_owned()
        } else {
            "0/1 PC_PACKET [0] 0xDEADBEEF".to_owned()
        };
        vec![reply]
    })
    .await;
    let mut port = Port::new(conn, "0/1", Arc::new(TpldAllocator::new())).unwrap();

    let packets = port
        .capture()
        .unwrap()
        .get_packets(0, None, CaptureBufferType::Raw, None, None)
        .await
        .unwrap();
    assert_eq!(packets, vec!["DEADBEEF"]);
}

#[tokio::test]
async fn port_stats_report_every_group_in_order() {
    let (conn, _log, _fake) = fake_chassis(|cmd| {
        let reply = if cmd.contains("pr_pfcstats") {
            "0/1 PR_PFCSTATS 9 0 1 2 3 4 5 6 7".to_owned()
        } else if cmd.contains("pr_total") {
            "0/1 PR_TOTAL 100 10 5000 50".to_owned()
        } else if cmd.contains("pr_notpld") {
            "0/1 PR_NOTPLD 0 0 0 0".to_owned()
        } else if cmd.contains("pr_extra") {
            "0/1 PR_EXTRA 0 0 0 0 0 0 0 0".to_owned()
        } else if cmd.contains("pt_total") {
            "0/1 PT_TOTAL 200 20 9000 90".to_owned()
        } else if cmd.contains("pt_extra") {
            "0/1 PT_EXTRA 0 0 0 0 0 0 0 0 0 0".to_owned()
        } else if cmd.contains("pt_notpld") {
            "0/1 PT_NOTPLD 0 0 0 0".to_owned()
        } else {
            "<OK>".to_owned()
        };
        vec![reply]
    })
    .await;
    let port = Port::new(conn, "0/1", Arc::new(TpldAllocator::new())).unwrap();

    let stats = port.read_port_stats().await.unwrap();
    let group_names: Vec<&str> = stats.keys().map(String::as_str).collect();
    let expected: Vec<&str> = PORT_STATS_GROUPS.iter().map(|(name, _)| *name).collect();
    assert_eq!(group_names, expected);
    assert_eq!(stats["pr_total"]["bps"], 100);
    assert_eq!(stats["pt_total"]["packets"], 90);
}

#[tokio::test]
async fn modifier_creation_bumps_count_and_programs_spec() {
    let (conn, log, _fake) = fake_chassis(|cmd| {
        let reply = if cmd.contains("ps_indices") {
            "0/1 PS_INDICES".to_owned()
        } else if cmd.contains("ps_modifiercount") && cmd.ends_with('?') {
            "0/1 PS_MODIFIERCOUNT [0] 0".to_owned()
        } else {
            "<OK>".to_owned()
        };
        vec![reply]
    })
    .await;
    let mut port = Port::new(conn, "0/1", Arc::new(TpldAllocator::new())).unwrap();

    let stream = port
        .add_stream(None, None, StreamState::Enabled)
        .await
        .unwrap();
    let spec = ModifierSpec {
        position: 4,
        mask: "0xFF000000".to_owned(),
        action: ModifierAction::Increment,
        repeat: 1,
        min: 0,
        step: 1,
        max: 255,
    };
    let mid = stream
        .add_modifier(ModifierKind::Standard, spec)
        .await
        .unwrap();
    assert_eq!(mid, 0);

    let sent = logged(&log);
    assert!(sent.contains(&"0/1 ps_modifiercount [0] 1".to_owned()));
    assert!(sent.contains(&"0/1 ps_modifier [0,0] 4 0xFF000000 INC 1".to_owned()));
    assert!(sent.contains(&"0/1 ps_modifierrange [0,0] 0 1 255".to_owned()));
}

#[tokio::test]
async fn random_modifier_skips_range_programming() {
    let (conn, log, _fake) = fake_chassis(|cmd| {
        let reply = if cmd.contains("ps_indices") {
            "0/1 PS_INDICES".to_owned()
        } else if cmd.contains("ps_modifiercount") && cmd.ends_with('?') {
            "0/1 PS_MODIFIERCOUNT [0] 0".to_owned()
        } else {
            "<OK>".to_owned()
        };
        vec![reply]
    })
    .await;
    let mut port = Port::new(conn, "0/1", Arc::new(TpldAllocator::new())).unwrap();

    let stream = port
        .add_stream(None, None, StreamState::Enabled)
        .await
        .unwrap();
    let spec = ModifierSpec {
        action: ModifierAction::Random,
        ..ModifierSpec::default()
    };
    stream
        .add_modifier(ModifierKind::Standard, spec)
        .await
        .unwrap();

    let sent = logged(&log);
    assert!(sent.iter().any(|l| l.contains("ps_modifier [0,0]")));
    assert!(!sent.iter().any(|l| l.contains("ps_modifierrange")));
}

#[tokio::test]
async fn tplds_are_reread_on_every_access() {
    let (conn, log, _fake) = fake_chassis(|cmd| {
        let reply = if cmd.contains("pr_tplds") {
            "0/1 PR_TPLDS 4 7".to_owned()
        } else {
            "<OK>".to_owned()
        };
        vec![reply]
    })
    .await;
    let mut port = Port::new(conn, "0/1", Arc::new(TpldAllocator::new())).unwrap();

    let tplds = port.tplds().await.unwrap();
    assert_eq!(tplds.keys().copied().collect::<Vec<_>>(), vec![4, 7]);

    // Unlike streams, tplds hit the device again on each access.
    port.tplds().await.unwrap();
    let queries = logged(&log)
        .iter()
        .filter(|l| l.contains("pr_tplds"))
        .count();
    assert_eq!(queries, 2);
}

#[tokio::test]
async fn prefix_fallback_is_counted_not_fatal() {
    let (conn, _log, _fake) = fake_chassis(|cmd| {
        assert!(cmd.contains("p_receivesync"));
        // Reply without the echoed address prefix.
        vec!["IN_SYNC".to_owned()]
    })
    .await;
    let port = Port::new(conn.clone(), "0/1", Arc::new(TpldAllocator::new())).unwrap();

    let value = port.node().get_attribute("p_receivesync").await.unwrap();
    assert_eq!(value, "IN_SYNC");
    assert_eq!(
        conn.stats()
            .prefix_fallbacks
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}

#[tokio::test]
async fn rejected_set_surfaces_command_and_reply() {
    let (conn, _log, _fake) = fake_chassis(|_| vec!["<NOTRESERVED>".to_owned()]).await;
    let port = Port::new(conn, "0/1", Arc::new(TpldAllocator::new())).unwrap();

    let err = port.start_traffic().await.unwrap_err();
    match err {
        CoreError::Rejected { command, reply } => {
            assert_eq!(command, "0/1 p_traffic on");
            assert_eq!(reply, "<NOTRESERVED>");
        }
        other => panic!("expected Rejected, got {other:?}"),
    }
}

#[tokio::test]
async fn filters_discovered_and_cleared() {
    let (conn, log, _fake) = fake_chassis(|cmd| {
        let reply = if cmd.contains("pf_indices") && cmd.ends_with('?') {
            "0/1 PF_INDICES 1".to_owned()
        } else if cmd.contains("pf_comment") {
            "0/1 PF_COMMENT [1] \"mgmt only\"".to_owned()
        } else {
            "<OK>".to_owned()
        };
        vec![reply]
    })
    .await;
    let mut port = Port::new(conn, "0/1", Arc::new(TpldAllocator::new())).unwrap();

    let filters = port.ensure_filters().await.unwrap();
    assert_eq!(filters.len(), 1);
    assert_eq!(filters[&1].name(), "mgmt only");

    port.clear_filters().await.unwrap();
    assert!(port.filters().is_empty());
    assert!(logged(&log).contains(&"0/1 pf_indices".to_owned()));
}
