//! Reconciler: maps an orders snapshot onto the supervisor's command set.
//!
//! Orders are authoritative and complete: every listed command is created or
//! converged (start/stop/metadata), and every local command the list omits
//! is culled. Returns whether any action was taken so the caller can
//! broadcast fresh state immediately.

use tracing::{debug, error};

use posse_messages::{timestamp_now, OrdersMessage, MAX_MESSAGE_AGE_USEC};

use crate::command::CommandStatus;
use crate::error::DeputyError;
use crate::introspection::MarkCounters;
use crate::publisher::Publisher;
use crate::supervisor::Supervisor;

enum Dispatch {
    Start(i32),
    Stop,
    SyncRunid(i32),
}

/// Carry out one orders snapshot.
///
/// `Err(WrongHost)` and `Err(StaleOrders)` are the silent-recoverable
/// screens from the protocol; anything else the caller treats as acted-upon
/// state. `Ok(true)` means state changed and an info broadcast is due.
pub async fn apply_orders(
    host: &str,
    supervisor: &mut Supervisor,
    counters: &mut MarkCounters,
    publisher: &Publisher,
    orders: &OrdersMessage,
) -> Result<bool, DeputyError> {
    counters.record_order();

    if orders.host != host {
        return Err(DeputyError::WrongHost(orders.host.clone()));
    }
    counters.record_order_for_me();

    let age_usec = timestamp_now() - orders.utime;
    if age_usec > MAX_MESSAGE_AGE_USEC {
        let age_sec = age_usec / 1_000_000;
        for cmd in &orders.cmds {
            publisher
                .transmit_str(
                    cmd.sheriff_id,
                    &format!(
                        "ignoring stale orders (utime {age_sec} seconds ago). \
                         You may want to check the system clocks!\n"
                    ),
                )
                .await;
        }
        counters.record_stale();
        return Err(DeputyError::StaleOrders { age_sec });
    }

    counters.record_sheriff(&orders.sheriff_name);

    let mut action_taken = false;
    debug!(ncmds = orders.cmds.len(), sheriff = %orders.sheriff_name, "orders received");

    for order in &orders.cmds {
        if supervisor.get(order.sheriff_id).is_none() {
            supervisor.add(order.sheriff_id, &order.name, &order.nickname, &order.group);
            action_taken = true;
        }

        let Some(cmd) = supervisor.get_mut(order.sheriff_id) else {
            continue;
        };

        // Rename never touches a live child; it applies on the next start.
        if cmd.exec_str != order.name {
            debug!(sheriff_id = order.sheriff_id, from = %cmd.exec_str, to = %order.name, "renaming command");
            cmd.exec_str = order.name.clone();
            action_taken = true;
        }
        if cmd.nickname != order.nickname {
            debug!(sheriff_id = order.sheriff_id, nickname = %order.nickname, "setting nickname");
            cmd.nickname = order.nickname.clone();
            action_taken = true;
        }
        if cmd.group != order.group {
            debug!(sheriff_id = order.sheriff_id, group = %order.group, "setting group");
            cmd.group = order.group.clone();
            action_taken = true;
        }

        let runid_matches = cmd.actual_runid == order.desired_runid;
        let dispatch = match cmd.status() {
            CommandStatus::Stopped if !runid_matches && !order.force_quit => {
                Dispatch::Start(order.desired_runid)
            }
            CommandStatus::Running if order.force_quit || !runid_matches => Dispatch::Stop,
            _ => Dispatch::SyncRunid(order.desired_runid),
        };

        match dispatch {
            Dispatch::Start(runid) => {
                action_taken = true;
                if let Err(e) = supervisor.start(order.sheriff_id, runid) {
                    error!(sheriff_id = order.sheriff_id, error = %e, "spawn failed");
                    publisher
                        .transmit_str(0, &format!("couldn't start [{}]\n", order.name))
                        .await;
                    publisher
                        .transmit_str(
                            order.sheriff_id,
                            &format!("ERROR!  couldn't start [{}]\n", order.name),
                        )
                        .await;
                }
            }
            Dispatch::Stop => {
                action_taken = true;
                if let Err(e) = supervisor.stop(order.sheriff_id) {
                    publisher
                        .transmit_str(order.sheriff_id, &format!("{e}\n"))
                        .await;
                }
            }
            Dispatch::SyncRunid(runid) => {
                if let Some(cmd) = supervisor.get_mut(order.sheriff_id) {
                    cmd.actual_runid = runid;
                }
            }
        }
    }

    // Cull: two passes, so the owner is never mutated mid-iteration.
    let orphans: Vec<i32> = supervisor
        .ids()
        .into_iter()
        .filter(|id| orders.find(*id).is_none())
        .collect();

    for id in orphans {
        let running = supervisor.get(id).map(|c| c.pid != 0).unwrap_or(false);
        if running {
            debug!(sheriff_id = id, "scheduling command for removal");
            if let Some(cmd) = supervisor.get_mut(id) {
                cmd.remove_requested = true;
            }
            if let Err(e) = supervisor.stop(id) {
                publisher.transmit_str(id, &format!("{e}\n")).await;
            }
        } else {
            supervisor.remove(id);
        }
        action_taken = true;
    }

    Ok(action_taken)
}
