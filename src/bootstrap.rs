//! Join-time state transfer.
//!
//! Runs once in the replica task before its main loop: discover the group,
//! adopt a snapshot from an existing member (or start zeroed), and only then
//! register with the directory. Registration is deliberately not atomic with
//! the snapshot transfer; the remaining window is narrow and documented in
//! DESIGN.md.

use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info};

use crate::{
    directory::Member,
    ledger::AccountSnapshot,
    model::{EventSource, Transport},
    replica::{AccountReplica, ReplicaEvent, ToReplica},
    sequencer::ToSequencer,
};

#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Startup barrier: hold the command surface closed until the group has
    /// this many members. Zero disables the barrier.
    pub expect_members: usize,
    /// Member queries are re-sent at this interval until answered.
    pub resend_interval: Duration,
    /// Per-member bound on a snapshot transfer before the next member is
    /// tried.
    pub snapshot_timeout: Duration,
    /// Overall bound on joining; exceeding it is fatal for the process.
    pub deadline: Duration,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            expect_members: 0,
            resend_interval: Duration::from_millis(500),
            snapshot_timeout: Duration::from_secs(2),
            deadline: Duration::from_secs(10),
        }
    }
}

pub async fn run(
    replica: &mut AccountReplica,
    source: &mut EventSource<ReplicaEvent>,
    config: &BootstrapConfig,
    sequencer_transport: &impl Transport<ToSequencer>,
    replica_transport: &impl Transport<ToReplica>,
) -> crate::Result<()> {
    timeout(
        config.deadline,
        join(replica, source, config, sequencer_transport, replica_transport),
    )
    .await
    .map_err(|_| crate::err!("bootstrap deadline exceeded for {}", replica.id))??;
    if config.expect_members > 0 {
        barrier(replica, source, config, replica_transport).await?
    }
    Ok(())
}

async fn join(
    replica: &mut AccountReplica,
    source: &mut EventSource<ReplicaEvent>,
    config: &BootstrapConfig,
    sequencer_transport: &impl Transport<ToSequencer>,
    replica_transport: &impl Transport<ToReplica>,
) -> crate::Result<()> {
    let members = loop {
        sequencer_transport
            .send_to(
                replica.sequencer.clone(),
                ToSequencer::QueryMembers {
                    group: replica.id.group.clone(),
                    reply: replica.addr.clone(),
                },
            )
            .await?;
        match timeout(config.resend_interval, member_list(source)).await {
            Ok(members) => break members?,
            Err(_) => debug!("{} member query unanswered, resending", replica.id),
        }
    };

    if members.is_empty() {
        info!("{} is first in its group, starting from empty state", replica.id)
    } else {
        adopt_snapshot(replica, source, config, &members, replica_transport).await?
    }

    // state is in place; from here on the sequencer may target us
    sequencer_transport
        .send_to(
            replica.sequencer.clone(),
            ToSequencer::Register(Member {
                id: replica.id.clone(),
                addr: replica.addr.clone(),
            }),
        )
        .await?;
    info!("{} registered", replica.id);
    Ok(())
}

async fn adopt_snapshot(
    replica: &mut AccountReplica,
    source: &mut EventSource<ReplicaEvent>,
    config: &BootstrapConfig,
    members: &[Member],
    replica_transport: &impl Transport<ToReplica>,
) -> crate::Result<()> {
    for member in members {
        replica_transport
            .send_to(
                member.addr.clone(),
                ToReplica::PullSnapshot {
                    reply: replica.addr.clone(),
                },
            )
            .await?;
        match timeout(config.snapshot_timeout, snapshot(source)).await {
            Ok(snapshot) => {
                let snapshot = snapshot?;
                info!(
                    "{} adopting snapshot from {} at order {}",
                    replica.id, member.id, snapshot.order_counter
                );
                replica.adopt(snapshot);
                return Ok(());
            }
            Err(_) => debug!("{} snapshot source {} unresponsive", replica.id, member.id),
        }
    }
    crate::bail!("no snapshot source responded for {}", replica.id)
}

/// Post-registration convenience barrier: process deliveries and membership
/// pushes, but nothing else, until the configured group size is reached.
async fn barrier(
    replica: &mut AccountReplica,
    source: &mut EventSource<ReplicaEvent>,
    config: &BootstrapConfig,
    replica_transport: &impl Transport<ToReplica>,
) -> crate::Result<()> {
    info!(
        "{} holding commands until {} member(s) joined",
        replica.id, config.expect_members
    );
    while replica.members().len() < config.expect_members {
        let event = source.next().await?;
        replica.handle_event(event, replica_transport)
    }
    info!("{} startup barrier released", replica.id);
    Ok(())
}

async fn member_list(source: &mut EventSource<ReplicaEvent>) -> crate::Result<Vec<Member>> {
    loop {
        match source.next().await? {
            ReplicaEvent::Message(ToReplica::MemberList(members)) => return Ok(members),
            event => debug!("ignoring {event:?} while joining"),
        }
    }
}

async fn snapshot(source: &mut EventSource<ReplicaEvent>) -> crate::Result<AccountSnapshot> {
    loop {
        match source.next().await? {
            ReplicaEvent::Message(ToReplica::Snapshot(snapshot)) => return Ok(snapshot),
            event => debug!("ignoring {event:?} while transferring state"),
        }
    }
}
