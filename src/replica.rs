//! Account replica: deterministic state machine over the ordered channel.
//!
//! Submissions never touch balances; they only append to the outstanding
//! log and hand a batch to the sequencer. Balances change in exactly one
//! place, [`AccountReplica::deliver`], when the sequencer hands the batch
//! back in the agreed order.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    time::{Duration, SystemTime},
};

use derive_more::From;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    directory::{GroupMembership, Member},
    ledger::{
        zeroed_balances, AccountSnapshot, Balances, Batch, LedgerError, Op, ReplicaId,
        Transaction, TxId,
    },
    model::{EventSender, EventSource, Promise, SubmitSource, Transport},
    rate::{Currency, Rates},
    sequencer::ToSequencer,
    task::BackgroundSpawner,
    Addr,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ToReplica {
    Deliver(Batch),
    Membership(GroupMembership),
    MemberList(Vec<Member>),
    PullSnapshot { reply: Addr },
    Snapshot(AccountSnapshot),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadMode {
    /// Wait for the outstanding log to drain, then read. May never resolve
    /// under continuous submission; kept as an explicit alternate mode.
    Naive,
    /// Route a read marker through the ordered channel and read at the
    /// moment it is applied.
    Correct,
}

#[derive(Debug)]
pub enum Command {
    Deposit { currency: Currency, amount: f64 },
    AddInterest { currency: Option<Currency>, percent: f64 },
    QuickBalance { currency: Currency },
    SyncedBalance { currency: Currency, mode: ReadMode },
    History,
    Status { tx: TxId },
    CleanHistory,
    Members,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TxStatus {
    Executed,
    Outstanding,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryReport {
    pub executed: Vec<Transaction>,
    pub outstanding: Vec<Transaction>,
    pub order_counter: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Reply {
    Submitted(TxId),
    Balance(f64),
    History(HistoryReport),
    Status(TxStatus),
    Cleaned,
    Members(BTreeSet<ReplicaId>),
}

pub type CommandResult = Result<Reply, LedgerError>;

#[derive(Debug, From)]
pub enum ReplicaEvent {
    Message(ToReplica),
    ReadExpired(TxId),
}

#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Bound on a correct-mode synchronized read; past it the pending
    /// result slot is discarded and the caller gets a timeout error.
    pub read_timeout: Duration,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
pub struct AccountReplica {
    pub id: ReplicaId,
    pub addr: Addr,
    pub sequencer: Addr,
    pub rates: Rates,
    pub config: ReplicaConfig,
    pub spawner: BackgroundSpawner,

    balances: Balances,
    executed: Vec<Transaction>,
    /// Ids ever executed; survives `CleanHistory` so idempotence does too.
    executed_ids: HashSet<TxId>,
    outstanding: Vec<Transaction>,
    order_counter: u64,
    next_seq: u32,
    members: BTreeSet<ReplicaId>,
    pending_reads: HashMap<TxId, Promise<CommandResult>>,
    naive_waiters: Vec<(Currency, Promise<CommandResult>)>,
    /// Outbound traffic to the sequencer, drained by one sender task so a
    /// broadcast can never overtake an earlier one from this replica.
    outbox: EventSender<ToSequencer>,
}

pub async fn replica_loop(
    mut replica: AccountReplica,
    event: EventSender<ReplicaEvent>,
    mut source: EventSource<ReplicaEvent>,
    mut commands: SubmitSource<Command, CommandResult>,
    replica_transport: impl Transport<ToReplica>,
) -> crate::Result<()> {
    loop {
        tokio::select! {
            message = source.next() => {
                replica.handle_event(message?, &replica_transport)
            }
            command = commands.option_next() => {
                let Some((command, result)) = command else {
                    info!("{} command surface closed, stopping", replica.id);
                    return Ok(());
                };
                replica.handle_command(command, result, &event)
            }
        }
    }
}

impl AccountReplica {
    pub fn new(
        id: ReplicaId,
        addr: Addr,
        sequencer: Addr,
        rates: Rates,
        config: ReplicaConfig,
        spawner: BackgroundSpawner,
        sequencer_transport: impl Transport<ToSequencer>,
    ) -> Self {
        let (outbox, outbox_source) = crate::model::event_channel();
        spawner.spawn(outbox_loop(
            sequencer.clone(),
            outbox_source,
            sequencer_transport,
        ));
        let balances = zeroed_balances(&rates);
        Self {
            id,
            addr,
            sequencer,
            rates,
            config,
            spawner,
            balances,
            executed: Vec::new(),
            executed_ids: HashSet::new(),
            outstanding: Vec::new(),
            order_counter: 0,
            next_seq: 0,
            members: BTreeSet::new(),
            pending_reads: HashMap::new(),
            naive_waiters: Vec::new(),
            outbox,
        }
    }

    pub fn members(&self) -> &BTreeSet<ReplicaId> {
        &self.members
    }

    pub fn snapshot(&self) -> AccountSnapshot {
        AccountSnapshot {
            balances: self.balances.clone(),
            executed: self.executed.clone(),
            outstanding: self.outstanding.clone(),
            order_counter: self.order_counter,
        }
    }

    /// Adopts a transferred snapshot verbatim. Only called before this
    /// replica registers, so nothing has been delivered locally yet.
    pub fn adopt(&mut self, snapshot: AccountSnapshot) {
        self.balances = snapshot.balances;
        self.executed_ids = snapshot.executed.iter().map(|tx| tx.id.clone()).collect();
        self.executed = snapshot.executed;
        self.outstanding = snapshot.outstanding;
        self.order_counter = snapshot.order_counter;
    }

    pub fn handle_event(
        &mut self,
        event: ReplicaEvent,
        replica_transport: &impl Transport<ToReplica>,
    ) {
        match event {
            ReplicaEvent::Message(ToReplica::Deliver(batch)) => self.deliver(batch),
            ReplicaEvent::Message(ToReplica::Membership(membership)) => {
                self.update_membership(membership)
            }
            ReplicaEvent::Message(ToReplica::PullSnapshot { reply }) => {
                info!("{} transferring snapshot to {reply}", self.id);
                let transport = replica_transport.clone();
                let snapshot = ToReplica::Snapshot(self.snapshot());
                self.spawner
                    .spawn(async move { transport.send_to(reply, snapshot).await })
            }
            ReplicaEvent::Message(message @ (ToReplica::MemberList(_) | ToReplica::Snapshot(_))) => {
                debug!("{} ignoring stale bootstrap reply {message:?}", self.id)
            }
            ReplicaEvent::ReadExpired(tx) => {
                if let Some(result) = self.pending_reads.remove(&tx) {
                    warn!("{} synchronized read {tx} timed out", self.id);
                    resolve(result, Err(LedgerError::ReadTimeout))
                }
            }
        }
    }

    pub fn handle_command(
        &mut self,
        command: Command,
        result: Promise<CommandResult>,
        event: &EventSender<ReplicaEvent>,
    ) {
        match command {
            Command::Deposit { currency, amount } => {
                resolve(result, self.submit_deposit(currency, amount))
            }
            Command::AddInterest { currency, percent } => {
                resolve(result, self.submit_add_interest(currency, percent))
            }
            Command::QuickBalance { currency } => {
                resolve(result, self.quick_balance(&currency).map(Reply::Balance))
            }
            Command::SyncedBalance { currency, mode } => {
                self.synced_balance(currency, mode, result, event)
            }
            Command::History => resolve(
                result,
                Ok(Reply::History(HistoryReport {
                    executed: self.executed.clone(),
                    outstanding: self.outstanding.clone(),
                    order_counter: self.order_counter,
                })),
            ),
            Command::Status { tx } => resolve(result, Ok(Reply::Status(self.status(&tx)))),
            Command::CleanHistory => {
                // order counter and outstanding log deliberately survive
                self.executed.clear();
                resolve(result, Ok(Reply::Cleaned))
            }
            Command::Members => resolve(result, Ok(Reply::Members(self.members.clone()))),
        }
    }

    /// Ordered application of a delivered batch. Every transaction is
    /// acknowledged, applied at most once, and moved from the outstanding
    /// log into the executed log exactly when it is applied.
    pub fn deliver(&mut self, batch: Batch) {
        for tx in batch.transactions {
            let ack = ToSequencer::Ack {
                tx: tx.id.clone(),
                member: self.id.clone(),
            };
            if self.executed_ids.insert(tx.id.clone()) {
                if let Err(err) = tx.op.apply(&mut self.balances, &self.rates) {
                    warn!("{} skipping effect of {}: {err}", self.id, tx.id)
                }
                self.outstanding.retain(|pending| pending.id != tx.id);
                self.order_counter += 1;
                if let Op::SyncedRead { currency } = &tx.op {
                    if let Some(result) = self.pending_reads.remove(&tx.id) {
                        resolve(result, self.quick_balance(currency).map(Reply::Balance))
                    }
                }
                debug!("{} executed {} as order {}", self.id, tx.id, self.order_counter);
                self.executed.push(tx)
            } else {
                debug!("{} already executed {}, re-acking", self.id, tx.id)
            }
            self.send_to_sequencer(ack)
        }
        if self.outstanding.is_empty() {
            for (currency, result) in std::mem::take(&mut self.naive_waiters) {
                resolve(result, self.quick_balance(&currency).map(Reply::Balance))
            }
        }
    }

    pub fn update_membership(&mut self, membership: GroupMembership) {
        if membership.group != self.id.group {
            debug!("{} ignoring membership of group {}", self.id, membership.group);
            return;
        }
        info!(
            "{} membership now {} member(s): {:?}",
            self.id,
            membership.members.len(),
            membership.members
        );
        self.members = membership.members
    }

    pub fn quick_balance(&self, currency: &Currency) -> Result<f64, LedgerError> {
        let total = self
            .balances
            .get(&Currency::canonical())
            .copied()
            .unwrap_or(0.0);
        self.rates.from_canonical(currency, total)
    }

    fn status(&self, tx: &TxId) -> TxStatus {
        if self.executed_ids.contains(tx) {
            TxStatus::Executed
        } else if self.outstanding.iter().any(|pending| &pending.id == tx) {
            TxStatus::Outstanding
        } else {
            TxStatus::Unknown
        }
    }

    fn submit_deposit(&mut self, currency: Currency, amount: f64) -> CommandResult {
        if amount <= 0.0 {
            return Err(LedgerError::NonPositiveAmount(amount));
        }
        if !self.rates.is_supported(&currency) {
            return Err(LedgerError::UnsupportedCurrency(currency));
        }
        Ok(Reply::Submitted(
            self.broadcast(Op::Deposit { currency, amount }),
        ))
    }

    fn submit_add_interest(&mut self, currency: Option<Currency>, percent: f64) -> CommandResult {
        if let Some(currency) = &currency {
            if !self.rates.is_supported(currency) {
                return Err(LedgerError::UnsupportedCurrency(currency.clone()));
            }
        }
        Ok(Reply::Submitted(
            self.broadcast(Op::AddInterest { currency, percent }),
        ))
    }

    fn synced_balance(
        &mut self,
        currency: Currency,
        mode: ReadMode,
        result: Promise<CommandResult>,
        event: &EventSender<ReplicaEvent>,
    ) {
        if !self.rates.is_supported(&currency) {
            resolve(result, Err(LedgerError::UnsupportedCurrency(currency)));
            return;
        }
        match mode {
            ReadMode::Naive => {
                if self.outstanding.is_empty() {
                    resolve(result, self.quick_balance(&currency).map(Reply::Balance))
                } else {
                    self.naive_waiters.push((currency, result))
                }
            }
            ReadMode::Correct => {
                let tx = self.broadcast(Op::SyncedRead { currency });
                self.pending_reads.insert(tx.clone(), result);
                let event = event.clone();
                let after = self.config.read_timeout;
                self.spawner.spawn(async move {
                    tokio::time::sleep(after).await;
                    event.send(ReplicaEvent::ReadExpired(tx))
                })
            }
        }
    }

    /// Appends a fresh transaction to the outstanding log and hands it to
    /// the sequencer. Balances are untouched until it comes back in order.
    fn broadcast(&mut self, op: Op) -> TxId {
        let id = TxId {
            origin: self.id.clone(),
            seq: self.next_seq,
        };
        self.next_seq += 1;
        let tx = Transaction {
            id: id.clone(),
            op,
            created_at_millis: unix_millis(),
        };
        self.outstanding.push(tx.clone());
        self.send_to_sequencer(ToSequencer::Broadcast(Batch {
            sender: self.id.clone(),
            transactions: vec![tx],
        }));
        id
    }

    fn send_to_sequencer(&self, message: ToSequencer) {
        if self.outbox.send(message).is_err() {
            debug!("{} outbound channel closed", self.id)
        }
    }
}

async fn outbox_loop(
    sequencer: Addr,
    mut source: EventSource<ToSequencer>,
    transport: impl Transport<ToSequencer>,
) -> crate::Result<()> {
    while let Some(message) = source.option_next().await {
        transport.send_to(sequencer.clone(), message).await?
    }
    Ok(())
}

/// A caller that stopped waiting is not this replica's problem.
fn resolve(result: Promise<CommandResult>, value: CommandResult) {
    if result.resolve(value).is_err() {
        debug!("command caller went away before its result")
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as _
}
