//! Ordered-multicast delivery service.
//!
//! One message per group is in flight at any time. The delivery target set
//! is snapshotted from the directory at dequeue time; the queue advances
//! only once every snapshotted target has acknowledged every transaction of
//! the batch, either for real or synthetically through eviction. Groups
//! share the loop but never wait on each other: nothing here suspends
//! between taking an event and updating state, and every outbound send or
//! timer runs on a spawned task.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    time::Duration,
};

use derive_more::From;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    directory::{GroupDirectory, GroupMembership, Member},
    ledger::{Batch, GroupId, ReplicaId, TxId},
    model::{EventSender, EventSource, Transport},
    replica::ToReplica,
    task::BackgroundSpawner,
    Addr,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ToSequencer {
    Register(Member),
    QueryMembers { group: GroupId, reply: Addr },
    Broadcast(Batch),
    Ack { tx: TxId, member: ReplicaId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Retry,
    Evict,
}

/// Delayed one-shot timer event. `round` pins it to the broadcast round it
/// was scheduled for; a timer outliving its round is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupTimer {
    pub group: GroupId,
    pub round: u64,
    pub kind: TimerKind,
}

#[derive(Debug, From)]
pub enum SequencerEvent {
    Message(ToSequencer),
    Timer(GroupTimer),
}

#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// T1: unacknowledged targets are re-sent the batch at this interval.
    pub retry_interval: Duration,
    /// T2: a target still owing acks this long after dequeue is evicted.
    pub evict_timeout: Duration,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(2),
            evict_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
pub struct Sequencer {
    config: SequencerConfig,
    spawner: BackgroundSpawner,
    directory: GroupDirectory,
    groups: HashMap<GroupId, GroupState>,
}

#[derive(Debug, Default)]
struct GroupState {
    queue: VecDeque<Batch>,
    round: u64,
    in_flight: Option<InFlight>,
}

#[derive(Debug)]
struct InFlight {
    round: u64,
    batch: Batch,
    /// Ack debt per snapshotted target: one ack per transaction.
    pending: BTreeMap<ReplicaId, BTreeSet<TxId>>,
}

pub async fn sequencer_loop(
    mut sequencer: Sequencer,
    event: EventSender<SequencerEvent>,
    mut source: EventSource<SequencerEvent>,
    transport: impl Transport<ToReplica>,
) -> crate::Result<()> {
    loop {
        match source.next().await? {
            SequencerEvent::Message(message) => match message {
                ToSequencer::Register(member) => sequencer.handle_register(member, &transport),
                ToSequencer::QueryMembers { group, reply } => {
                    sequencer.handle_query_members(group, reply, &transport)
                }
                ToSequencer::Broadcast(batch) => {
                    sequencer.handle_broadcast(batch, &event, &transport)
                }
                ToSequencer::Ack { tx, member } => {
                    sequencer.handle_ack(tx, member, &event, &transport)
                }
            },
            SequencerEvent::Timer(timer) => match timer.kind {
                TimerKind::Retry => sequencer.handle_retry(timer, &event, &transport),
                TimerKind::Evict => sequencer.handle_evict(timer, &event, &transport),
            },
        }
    }
}

impl Sequencer {
    pub fn new(config: SequencerConfig, spawner: BackgroundSpawner) -> Self {
        Self {
            config,
            spawner,
            directory: GroupDirectory::default(),
            groups: HashMap::new(),
        }
    }

    fn handle_register(&mut self, member: Member, transport: &impl Transport<ToReplica>) {
        info!("registering {} at {}", member.id, member.addr);
        let membership = self.directory.register(member);
        self.push_membership(&membership, transport)
    }

    fn handle_query_members(
        &self,
        group: GroupId,
        reply: Addr,
        transport: &impl Transport<ToReplica>,
    ) {
        self.send(
            reply,
            ToReplica::MemberList(self.directory.members(&group)),
            transport,
        )
    }

    fn handle_broadcast(
        &mut self,
        batch: Batch,
        event: &EventSender<SequencerEvent>,
        transport: &impl Transport<ToReplica>,
    ) {
        let group = batch.sender.group.clone();
        debug!(
            "queueing batch of {} from {}",
            batch.transactions.len(),
            batch.sender
        );
        let state = self.groups.entry(group.clone()).or_default();
        state.queue.push_back(batch);
        if state.in_flight.is_none() {
            self.advance(&group, event, transport)
        }
    }

    fn handle_ack(
        &mut self,
        tx: TxId,
        member: ReplicaId,
        event: &EventSender<SequencerEvent>,
        transport: &impl Transport<ToReplica>,
    ) {
        let group = member.group.clone();
        let Some(in_flight) = self
            .groups
            .get_mut(&group)
            .and_then(|state| state.in_flight.as_mut())
        else {
            debug!("ack {tx} from {member} with nothing in flight");
            return;
        };
        let Some(owed) = in_flight.pending.get_mut(&member) else {
            debug!("ack {tx} from non-target {member}");
            return;
        };
        if !owed.remove(&tx) {
            debug!("duplicate ack {tx} from {member}");
            return;
        }
        if owed.is_empty() {
            in_flight.pending.remove(&member);
        }
        if in_flight.pending.is_empty() {
            debug!("batch round complete for group {group}");
            self.groups
                .get_mut(&group)
                .expect("group state exists")
                .in_flight = None;
            self.advance(&group, event, transport)
        }
    }

    fn handle_retry(
        &mut self,
        timer: GroupTimer,
        event: &EventSender<SequencerEvent>,
        transport: &impl Transport<ToReplica>,
    ) {
        let Some(in_flight) = self
            .groups
            .get(&timer.group)
            .and_then(|state| state.in_flight.as_ref())
        else {
            return;
        };
        if in_flight.round != timer.round {
            return;
        }
        let batch = in_flight.batch.clone();
        let targets = Vec::from_iter(
            in_flight
                .pending
                .keys()
                .filter_map(|id| self.directory.addr(id)),
        );
        debug!(
            "retrying batch from {} to {} target(s)",
            batch.sender,
            targets.len()
        );
        for addr in targets {
            self.send(addr, ToReplica::Deliver(batch.clone()), transport)
        }
        self.schedule(timer, self.config.retry_interval, event)
    }

    fn handle_evict(
        &mut self,
        timer: GroupTimer,
        event: &EventSender<SequencerEvent>,
        transport: &impl Transport<ToReplica>,
    ) {
        let Some(state) = self.groups.get_mut(&timer.group) else {
            return;
        };
        if !state
            .in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.round == timer.round)
        {
            return;
        }
        let in_flight = state.in_flight.take().expect("in-flight batch matched");
        // synthesize the missing acks: evict the laggards and move on
        for (member, owed) in in_flight.pending {
            warn!(
                "evicting unresponsive member {member} ({} unacked transaction(s))",
                owed.len()
            );
            if let Some(membership) = self.directory.evict(&member) {
                self.push_membership(&membership, transport)
            }
        }
        self.advance(&timer.group, event, transport)
    }

    fn advance(
        &mut self,
        group: &GroupId,
        event: &EventSender<SequencerEvent>,
        transport: &impl Transport<ToReplica>,
    ) {
        loop {
            let state = self.groups.entry(group.clone()).or_default();
            let Some(batch) = state.queue.pop_front() else {
                return;
            };
            state.round += 1;
            let round = state.round;
            // the target set is pinned here; members joining later are not
            // owed this batch
            let targets = self.directory.members(group);
            if targets.is_empty() {
                debug!("group {group} has no members, consuming batch from {}", batch.sender);
                continue;
            }
            let transactions = BTreeSet::from_iter(batch.transactions.iter().map(|tx| tx.id.clone()));
            let pending = targets
                .iter()
                .map(|member| (member.id.clone(), transactions.clone()))
                .collect();
            for member in &targets {
                self.send(member.addr.clone(), ToReplica::Deliver(batch.clone()), transport)
            }
            let timer = |kind| GroupTimer {
                group: group.clone(),
                round,
                kind,
            };
            self.schedule(timer(TimerKind::Retry), self.config.retry_interval, event);
            self.schedule(timer(TimerKind::Evict), self.config.evict_timeout, event);
            self.groups
                .get_mut(group)
                .expect("group state exists")
                .in_flight = Some(InFlight {
                round,
                batch,
                pending,
            });
            return;
        }
    }

    fn push_membership(&self, membership: &GroupMembership, transport: &impl Transport<ToReplica>) {
        for member in self.directory.members(&membership.group) {
            self.send(
                member.addr,
                ToReplica::Membership(membership.clone()),
                transport,
            )
        }
    }

    fn send(&self, destination: Addr, message: ToReplica, transport: &impl Transport<ToReplica>) {
        let transport = transport.clone();
        self.spawner
            .spawn(async move { transport.send_to(destination, message).await })
    }

    fn schedule(&self, timer: GroupTimer, after: Duration, event: &EventSender<SequencerEvent>) {
        let event = event.clone();
        self.spawner.spawn(async move {
            tokio::time::sleep(after).await;
            event.send(timer)
        })
    }
}
