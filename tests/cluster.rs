//! End-to-end scenarios over an in-memory datagram network: one sequencer
//! process loop, several replica loops, real bootstrap and ack traffic.

use std::time::Duration;

use moneta::{
    bootstrap::{self, BootstrapConfig},
    directory::Member,
    ledger::ReplicaId,
    model::{event_channel, promise_channel, SubmitHandle, Transport},
    net::{MemoryNet, MemoryTransport},
    replica::{
        replica_loop, AccountReplica, Command, CommandResult, HistoryReport, ReadMode, Reply,
        ReplicaConfig, ReplicaEvent, ToReplica,
    },
    sequencer::{sequencer_loop, Sequencer, SequencerConfig, SequencerEvent, ToSequencer},
    task::{BackgroundMonitor, BackgroundSpawner},
    Addr, Currency, Rates,
};
use tokio::time::{sleep, timeout};

const SEQUENCER: &str = "sequencer";

fn rates() -> Rates {
    Rates::new([("EUR".into(), 1.17), ("NOK".into(), 0.1)])
}

struct Cluster {
    net: MemoryNet,
    spawner: BackgroundSpawner,
    // keeps the spawned loops alive for the duration of the test
    _monitor: BackgroundMonitor,
}

impl Cluster {
    fn new(config: SequencerConfig) -> Self {
        let monitor = BackgroundMonitor::default();
        let spawner = monitor.spawner();
        let net = MemoryNet::default();

        let (event, source) = event_channel();
        let mailbox = net.bind(Addr::Untyped(SEQUENCER.into()));
        spawner.spawn({
            let event = event.clone();
            async move { mailbox.listen_loop::<ToSequencer, SequencerEvent>(event).await }
        });
        let sequencer = Sequencer::new(config, spawner.clone());
        spawner.spawn(sequencer_loop(
            sequencer,
            event,
            source,
            net.transport::<ToReplica>(Addr::Untyped(SEQUENCER.into())),
        ));

        Self {
            net,
            spawner,
            _monitor: monitor,
        }
    }

    fn sequencer_addr(&self) -> Addr {
        Addr::Untyped(SEQUENCER.into())
    }

    fn replica_id(group: &str, nonce: u32) -> ReplicaId {
        ReplicaId {
            group: group.into(),
            nonce,
        }
    }

    fn spawn_replica(
        &self,
        group: &str,
        nonce: u32,
        expect_members: usize,
        read_timeout: Duration,
    ) -> SubmitHandle<Command, CommandResult> {
        let addr = Addr::Untyped(format!("{group}-{nonce}"));
        let mailbox = self.net.bind(addr.clone());
        let (event, source) = event_channel();
        self.spawner.spawn({
            let event = event.clone();
            async move { mailbox.listen_loop::<ToReplica, ReplicaEvent>(event).await }
        });
        let (commands, command_source) = event_channel();
        let sequencer_transport = self.net.transport::<ToSequencer>(addr.clone());
        let replica_transport = self.net.transport::<ToReplica>(addr.clone());
        let replica = AccountReplica::new(
            Self::replica_id(group, nonce),
            addr,
            self.sequencer_addr(),
            rates(),
            ReplicaConfig { read_timeout },
            self.spawner.clone(),
            sequencer_transport.clone(),
        );
        let bootstrap_config = BootstrapConfig {
            expect_members,
            resend_interval: Duration::from_millis(50),
            snapshot_timeout: Duration::from_millis(200),
            deadline: Duration::from_secs(5),
        };
        self.spawner.spawn(async move {
            let mut replica = replica;
            let mut source = source;
            bootstrap::run(
                &mut replica,
                &mut source,
                &bootstrap_config,
                &sequencer_transport,
                &replica_transport,
            )
            .await?;
            replica_loop(replica, event, source, command_source, replica_transport).await
        });
        commands
    }

    /// Registers a member that acknowledges every delivered transaction
    /// only after `ack_delay`, keeping batches in flight that long.
    fn spawn_slow_member(&self, group: &str, nonce: u32, ack_delay: Duration) {
        let addr = Addr::Untyped(format!("{group}-slow-{nonce}"));
        let mailbox = self.net.bind(addr.clone());
        let (event, mut source) = event_channel::<ReplicaEvent>();
        self.spawner
            .spawn(async move { mailbox.listen_loop::<ToReplica, ReplicaEvent>(event).await });
        let id = Self::replica_id(group, nonce);
        let member = id.clone();
        let transport: MemoryTransport<ToSequencer> = self.net.transport(addr.clone());
        let sequencer = self.sequencer_addr();
        self.spawner.spawn(async move {
            while let Some(event) = source.option_next().await {
                if let ReplicaEvent::Message(ToReplica::Deliver(batch)) = event {
                    sleep(ack_delay).await;
                    for tx in batch.transactions {
                        transport
                            .send_to(
                                sequencer.clone(),
                                ToSequencer::Ack {
                                    tx: tx.id,
                                    member: member.clone(),
                                },
                            )
                            .await?
                    }
                }
            }
            Ok(())
        });
        self.register_raw(id, addr)
    }

    /// Registers an address nobody listens on: the sequencer sees a member
    /// that never acknowledges anything.
    fn spawn_mute_member(&self, group: &str, nonce: u32) {
        self.register_raw(
            Self::replica_id(group, nonce),
            Addr::Untyped(format!("{group}-mute-{nonce}")),
        )
    }

    fn register_raw(&self, id: ReplicaId, addr: Addr) {
        let transport: MemoryTransport<ToSequencer> =
            self.net.transport(Addr::Untyped("test-driver".into()));
        let sequencer = self.sequencer_addr();
        self.spawner.spawn(async move {
            transport
                .send_to(sequencer, ToSequencer::Register(Member { id, addr }))
                .await
        })
    }
}

fn fast_config() -> SequencerConfig {
    SequencerConfig {
        retry_interval: Duration::from_millis(50),
        evict_timeout: Duration::from_millis(150),
    }
}

async fn deposit(handle: &SubmitHandle<Command, CommandResult>, currency: &str, amount: f64) {
    let reply = handle
        .submit(Command::Deposit {
            currency: currency.into(),
            amount,
        })
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(reply, Reply::Submitted(_)), "{reply:?}")
}

async fn synced_balance(
    handle: &SubmitHandle<Command, CommandResult>,
    currency: &str,
    mode: ReadMode,
) -> CommandResult {
    handle
        .submit(Command::SyncedBalance {
            currency: currency.into(),
            mode,
        })
        .await
        .unwrap()
}

async fn quick_balance(handle: &SubmitHandle<Command, CommandResult>, currency: &str) -> f64 {
    match handle
        .submit(Command::QuickBalance {
            currency: currency.into(),
        })
        .await
        .unwrap()
        .unwrap()
    {
        Reply::Balance(balance) => balance,
        reply => panic!("unexpected reply {reply:?}"),
    }
}

async fn history(handle: &SubmitHandle<Command, CommandResult>) -> HistoryReport {
    match handle.submit(Command::History).await.unwrap().unwrap() {
        Reply::History(report) => report,
        reply => panic!("unexpected reply {reply:?}"),
    }
}

async fn wait_for_order(handle: &SubmitHandle<Command, CommandResult>, order: u64) -> HistoryReport {
    timeout(Duration::from_secs(5), async {
        loop {
            let report = history(handle).await;
            if report.order_counter >= order {
                return report;
            }
            sleep(Duration::from_millis(10)).await
        }
    })
    .await
    .expect("replica reached expected order")
}

#[tokio::test]
async fn delivered_deposit_is_visible_on_every_member() {
    let cluster = Cluster::new(fast_config());
    let first = cluster.spawn_replica("acme", 1, 2, Duration::from_secs(2));
    let second = cluster.spawn_replica("acme", 2, 2, Duration::from_secs(2));

    deposit(&first, "EUR", 100.0).await;
    wait_for_order(&first, 1).await;
    wait_for_order(&second, 1).await;
    assert_eq!(quick_balance(&first, "USD").await, 117.0);
    assert_eq!(quick_balance(&second, "USD").await, 117.0);
    assert_eq!(quick_balance(&second, "EUR").await, 100.0)
}

#[tokio::test]
async fn concurrent_submissions_execute_in_one_shared_order() {
    let cluster = Cluster::new(fast_config());
    let first = cluster.spawn_replica("acme", 1, 2, Duration::from_secs(2));
    let second = cluster.spawn_replica("acme", 2, 2, Duration::from_secs(2));

    tokio::join!(
        async {
            for amount in [10.0, 20.0, 30.0] {
                deposit(&first, "USD", amount).await
            }
        },
        async {
            for amount in [1.0, 2.0, 3.0] {
                deposit(&second, "EUR", amount).await
            }
        },
    );

    let first_report = wait_for_order(&first, 6).await;
    let second_report = wait_for_order(&second, 6).await;
    let ids = |report: &HistoryReport| {
        Vec::from_iter(report.executed.iter().map(|tx| tx.id.clone()))
    };
    assert_eq!(ids(&first_report), ids(&second_report));
    assert_eq!(
        quick_balance(&first, "USD").await,
        quick_balance(&second, "USD").await
    )
}

#[tokio::test]
async fn unresponsive_member_is_evicted_without_blocking_the_batch() {
    let cluster = Cluster::new(fast_config());
    let replica = cluster.spawn_replica("acme", 1, 0, Duration::from_secs(5));
    wait_for_order(&replica, 0).await; // bootstrapped and registered
    cluster.spawn_mute_member("acme", 99);
    sleep(Duration::from_millis(50)).await; // let the registration land

    // completes despite the mute member: retry, then eviction at T2
    deposit(&replica, "USD", 40.0).await;
    let balance = synced_balance(&replica, "USD", ReadMode::Correct)
        .await
        .unwrap();
    assert_eq!(balance, Reply::Balance(40.0));

    // the next membership view no longer carries the evicted member
    let members = timeout(Duration::from_secs(5), async {
        loop {
            match replica.submit(Command::Members).await.unwrap().unwrap() {
                Reply::Members(members) if !members.contains(&Cluster::replica_id("acme", 99)) => {
                    return members
                }
                _ => sleep(Duration::from_millis(10)).await,
            }
        }
    })
    .await
    .expect("eviction propagated");
    assert_eq!(members, [Cluster::replica_id("acme", 1)].into())
}

#[tokio::test]
async fn joining_replica_adopts_the_executed_prefix() {
    let cluster = Cluster::new(fast_config());
    let first = cluster.spawn_replica("acme", 1, 0, Duration::from_secs(2));
    for amount in [10.0, 20.0, 30.0] {
        deposit(&first, "USD", amount).await
    }
    wait_for_order(&first, 3).await;

    let second = cluster.spawn_replica("acme", 2, 0, Duration::from_secs(2));
    let report = wait_for_order(&second, 3).await;
    assert_eq!(report.executed.len(), 3);
    assert_eq!(quick_balance(&second, "USD").await, 60.0);

    // and stays in lockstep afterwards
    deposit(&first, "EUR", 100.0).await;
    wait_for_order(&second, 4).await;
    assert_eq!(quick_balance(&second, "USD").await, 177.0)
}

#[tokio::test]
async fn groups_do_not_block_each_other() {
    let cluster = Cluster::new(SequencerConfig {
        retry_interval: Duration::from_secs(2),
        evict_timeout: Duration::from_secs(10),
    });
    // a mute member keeps every "stuck" batch in flight for 10 seconds
    let stuck = cluster.spawn_replica("stuck", 1, 0, Duration::from_secs(30));
    wait_for_order(&stuck, 0).await;
    cluster.spawn_mute_member("stuck", 99);
    sleep(Duration::from_millis(50)).await;
    deposit(&stuck, "USD", 1.0).await;

    // an unrelated group makes progress immediately
    let brisk = cluster.spawn_replica("brisk", 1, 0, Duration::from_secs(2));
    deposit(&brisk, "USD", 5.0).await;
    let balance = timeout(
        Duration::from_secs(1),
        synced_balance(&brisk, "USD", ReadMode::Correct),
    )
    .await
    .expect("unrelated group not stalled")
    .unwrap();
    assert_eq!(balance, Reply::Balance(5.0))
}

#[tokio::test]
async fn correct_read_sees_exactly_the_transactions_ordered_before_it() {
    let cluster = Cluster::new(fast_config());
    let slow_ack = Duration::from_millis(40);
    let replica = cluster.spawn_replica("acme", 1, 0, Duration::from_secs(10));
    wait_for_order(&replica, 0).await;
    cluster.spawn_slow_member("acme", 2, slow_ack);
    sleep(Duration::from_millis(50)).await;

    // three deposits queued or in flight when the read marker is enqueued
    for amount in [10.0, 20.0, 30.0] {
        deposit(&replica, "USD", amount).await
    }
    let read = promise_channel();
    replica
        .send((
            Command::SyncedBalance {
                currency: Currency::new("USD"),
                mode: ReadMode::Correct,
            },
            read.0,
        ))
        .unwrap();
    // these are submitted after the read and must not show up in it
    for amount in [1000.0, 2000.0] {
        deposit(&replica, "USD", amount).await
    }

    let balance = timeout(Duration::from_secs(10), read.1)
        .await
        .expect("read resolved")
        .unwrap()
        .unwrap();
    assert_eq!(balance, Reply::Balance(60.0));
    wait_for_order(&replica, 6).await;
    assert_eq!(quick_balance(&replica, "USD").await, 3060.0)
}

#[tokio::test]
async fn naive_read_starves_under_continuous_load() {
    let cluster = Cluster::new(SequencerConfig {
        retry_interval: Duration::from_secs(2),
        evict_timeout: Duration::from_secs(30),
    });
    let slow_ack = Duration::from_millis(50);
    let replica = cluster.spawn_replica("acme", 1, 0, Duration::from_secs(30));
    wait_for_order(&replica, 0).await;
    cluster.spawn_slow_member("acme", 2, slow_ack);
    sleep(Duration::from_millis(50)).await;

    // a submitter that never stops
    let feeder = replica.clone();
    let load = tokio::spawn(async move {
        loop {
            deposit(&feeder, "USD", 1.0).await;
            sleep(Duration::from_millis(10)).await
        }
    });

    deposit(&replica, "USD", 1.0).await;
    let read = promise_channel();
    replica
        .send((
            Command::SyncedBalance {
                currency: Currency::new("USD"),
                mode: ReadMode::Naive,
            },
            read.0,
        ))
        .unwrap();
    // the outstanding log never drains, so the naive read never resolves
    assert!(
        timeout(Duration::from_millis(600), read.1).await.is_err(),
        "naive read resolved under continuous load"
    );
    load.abort()
}
