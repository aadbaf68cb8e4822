//! End-to-end scenarios for the deputy loop.
//!
//! Each test runs a real deputy task against an in-memory bus, plays the
//! sheriff by publishing orders, and observes the info/printf traffic the
//! deputy broadcasts back. Children are real processes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::time::timeout;

use posse_bus::{Bus, MemoryBus};
use posse_deputy::{Deputy, DeputyConfig};
use posse_messages::{
    timestamp_now, InfoMessage, OrdersMessage, PrintfMessage, SheriffCommand,
};

const WAIT: Duration = Duration::from_secs(10);

struct TestRig {
    bus: Arc<MemoryBus>,
    info_rx: broadcast::Receiver<InfoMessage>,
    printf_rx: broadcast::Receiver<PrintfMessage>,
    _shutdown_tx: watch::Sender<bool>,
}

async fn start_deputy(host: &str) -> TestRig {
    let bus = Arc::new(MemoryBus::new());
    let info_rx = bus.subscribe_info();
    let printf_rx = bus.subscribe_printf();

    let config = DeputyConfig {
        host: host.to_string(),
        info_interval: Duration::from_millis(100),
        ..DeputyConfig::default()
    };
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(Deputy::new(config, bus.clone()).run(shutdown_rx));

    // Let the deputy reach its subscribe before the first publish.
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestRig {
        bus,
        info_rx,
        printf_rx,
        _shutdown_tx: shutdown_tx,
    }
}

fn order(sheriff_id: i32, name: &str, runid: i32, force_quit: bool) -> SheriffCommand {
    SheriffCommand {
        sheriff_id,
        name: name.to_string(),
        nickname: format!("nick{sheriff_id}"),
        group: "g".to_string(),
        desired_runid: runid,
        force_quit,
    }
}

fn orders(host: &str, cmds: Vec<SheriffCommand>) -> OrdersMessage {
    OrdersMessage {
        host: host.to_string(),
        sheriff_name: "test-sheriff".to_string(),
        utime: timestamp_now(),
        cmds,
    }
}

/// Receive info messages until one satisfies the predicate.
async fn await_info<F>(rx: &mut broadcast::Receiver<InfoMessage>, mut pred: F) -> InfoMessage
where
    F: FnMut(&InfoMessage) -> bool,
{
    timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(info) if pred(&info) => return info,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => panic!("info stream closed: {e}"),
            }
        }
    })
    .await
    .expect("expected info message")
}

async fn await_printf<F>(rx: &mut broadcast::Receiver<PrintfMessage>, mut pred: F) -> PrintfMessage
where
    F: FnMut(&PrintfMessage) -> bool,
{
    timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(msg) if pred(&msg) => return msg,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => panic!("printf stream closed: {e}"),
            }
        }
    })
    .await
    .expect("expected printf message")
}

#[tokio::test]
async fn s1_start_and_observe_exit() {
    let mut rig = start_deputy("h").await;

    rig.bus
        .publish_orders(&orders("h", vec![order(7, "/bin/true", 1, false)]))
        .await
        .unwrap();

    // The start is reported immediately with a live pid.
    let started = await_info(&mut rig.info_rx, |i| {
        i.cmds.iter().any(|c| c.sheriff_id == 7 && c.pid > 0)
    })
    .await;
    let cmd = started.find(7);
    assert_eq!(cmd.actual_runid, 1);

    // After exit and reap, the snapshot shows a clean stop.
    let stopped = await_info(&mut rig.info_rx, |i| {
        i.cmds.iter().any(|c| c.sheriff_id == 7 && c.pid == 0)
    })
    .await;
    let cmd = stopped.find(7);
    assert_eq!(cmd.exit_code, 0);
    assert_eq!(cmd.actual_runid, 1);
}

#[tokio::test]
async fn s2_runid_bump_restarts() {
    let mut rig = start_deputy("h").await;

    rig.bus
        .publish_orders(&orders("h", vec![order(7, "/bin/sleep 600", 1, false)]))
        .await
        .unwrap();
    let running = await_info(&mut rig.info_rx, |i| {
        i.cmds.iter().any(|c| c.sheriff_id == 7 && c.pid > 0)
    })
    .await;
    let first_pid = running.find(7).pid;

    // Bump the runid: the deputy stops the old instance first.
    rig.bus
        .publish_orders(&orders("h", vec![order(7, "/bin/sleep 600", 2, false)]))
        .await
        .unwrap();
    await_info(&mut rig.info_rx, |i| {
        i.cmds.iter().any(|c| c.sheriff_id == 7 && c.pid == 0)
    })
    .await;

    // The next reconciliation spawns the new instance at runid 2.
    rig.bus
        .publish_orders(&orders("h", vec![order(7, "/bin/sleep 600", 2, false)]))
        .await
        .unwrap();
    let restarted = await_info(&mut rig.info_rx, |i| {
        i.cmds.iter().any(|c| c.sheriff_id == 7 && c.pid > 0)
    })
    .await;
    let cmd = restarted.find(7);
    assert_eq!(cmd.actual_runid, 2);
    assert_ne!(cmd.pid, first_pid);
}

#[tokio::test]
async fn s3_force_quit_stops_without_respawn() {
    let mut rig = start_deputy("h").await;

    rig.bus
        .publish_orders(&orders("h", vec![order(7, "/bin/sleep 600", 1, false)]))
        .await
        .unwrap();
    await_info(&mut rig.info_rx, |i| {
        i.cmds.iter().any(|c| c.sheriff_id == 7 && c.pid > 0)
    })
    .await;

    let quit = orders("h", vec![order(7, "/bin/sleep 600", 2, true)]);
    rig.bus.publish_orders(&quit).await.unwrap();

    // Stop escalation begins with SIGTERM; the reap reports the signal's
    // description verbatim.
    await_printf(&mut rig.printf_rx, |m| {
        m.sheriff_id == 7 && m.text == "Terminated\n"
    })
    .await;
    await_info(&mut rig.info_rx, |i| {
        i.cmds.iter().any(|c| c.sheriff_id == 7 && c.pid == 0)
    })
    .await;

    // Re-delivering the same force-quit orders must not respawn.
    rig.bus.publish_orders(&quit).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    let info = await_info(&mut rig.info_rx, |_| true).await;
    let cmd = info.find(7);
    assert_eq!(cmd.pid, 0);
    assert_eq!(cmd.actual_runid, 2);
}

#[tokio::test]
async fn s4_cull_removes_running_command() {
    let mut rig = start_deputy("h").await;

    rig.bus
        .publish_orders(&orders("h", vec![order(7, "/bin/sleep 600", 1, false)]))
        .await
        .unwrap();
    await_info(&mut rig.info_rx, |i| {
        i.cmds.iter().any(|c| c.sheriff_id == 7 && c.pid > 0)
    })
    .await;

    rig.bus.publish_orders(&orders("h", vec![])).await.unwrap();

    // Stopped, reaped, and gone from the snapshot.
    await_info(&mut rig.info_rx, |i| i.cmds.is_empty()).await;
}

#[tokio::test]
async fn s5_stale_orders_rejected_with_printf() {
    let mut rig = start_deputy("h").await;

    let mut stale = orders("h", vec![order(9, "/bin/sleep 600", 1, false)]);
    stale.utime = timestamp_now() - 90_000_000;
    rig.bus.publish_orders(&stale).await.unwrap();

    let notice = await_printf(&mut rig.printf_rx, |m| m.sheriff_id == 9).await;
    assert!(notice.text.contains("stale orders"));
    assert!(notice.text.contains("system clocks"));

    // No command was created.
    let info = await_info(&mut rig.info_rx, |_| true).await;
    assert!(info.cmds.is_empty());
}

#[tokio::test]
async fn s6_wrong_host_orders_ignored() {
    let mut rig = start_deputy("h").await;

    rig.bus
        .publish_orders(&orders("other", vec![order(7, "/bin/sleep 600", 1, false)]))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    let info = await_info(&mut rig.info_rx, |_| true).await;
    assert!(info.cmds.is_empty());
    assert!(rig.printf_rx.try_recv().is_err());
}

#[tokio::test]
async fn output_forwarded_verbatim_with_attribution() {
    let mut rig = start_deputy("h").await;

    rig.bus
        .publish_orders(&orders(
            "h",
            vec![order(7, "sh -c 'echo chunk-one; echo chunk-two'", 1, false)],
        ))
        .await
        .unwrap();

    let mut collected = String::new();
    timeout(WAIT, async {
        loop {
            let msg = rig.printf_rx.recv().await.unwrap();
            if msg.sheriff_id != 7 {
                continue;
            }
            if msg.text.contains("end of output") {
                break;
            }
            collected.push_str(&msg.text);
        }
    })
    .await
    .expect("expected child output");

    assert_eq!(collected, "chunk-one\nchunk-two\n");
}

#[tokio::test]
async fn stubborn_child_is_eventually_killed() {
    let mut rig = start_deputy("h").await;

    // A child that ignores SIGTERM only dies to the SIGKILL escalation.
    let stubborn = "sh -c 'trap \"\" TERM; sleep 600'";
    rig.bus
        .publish_orders(&orders("h", vec![order(7, stubborn, 1, false)]))
        .await
        .unwrap();
    await_info(&mut rig.info_rx, |i| {
        i.cmds.iter().any(|c| c.sheriff_id == 7 && c.pid > 0)
    })
    .await;

    // The sheriff repeats force-quit orders; each receipt advances the
    // escalation at most once per 900 ms.
    let quit = orders("h", vec![order(7, "/bin/sleep 600", 1, true)]);
    let killed = timeout(Duration::from_secs(30), async {
        loop {
            let mut msg = quit.clone();
            msg.utime = timestamp_now();
            rig.bus.publish_orders(&msg).await.unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;

            while let Ok(info) = rig.info_rx.try_recv() {
                if info.cmds.iter().any(|c| c.sheriff_id == 7 && c.pid == 0) {
                    return;
                }
            }
        }
    })
    .await;
    killed.expect("escalation should reach SIGKILL");

    await_printf(&mut rig.printf_rx, |m| m.sheriff_id == 7 && m.text == "Killed\n").await;
}

trait FindCmd {
    fn find(&self, sheriff_id: i32) -> &posse_messages::CommandInfo;
}

impl FindCmd for InfoMessage {
    fn find(&self, sheriff_id: i32) -> &posse_messages::CommandInfo {
        self.cmds
            .iter()
            .find(|c| c.sheriff_id == sheriff_id)
            .expect("command in snapshot")
    }
}
