use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ledger_control_messages as control;
use moneta::{
    bootstrap::{self, BootstrapConfig},
    ledger::LedgerError,
    model::{event_channel, SubmitHandle},
    net::UdpSocket,
    replica::{
        replica_loop, AccountReplica, Command, CommandResult, ReadMode, ReplicaConfig,
        ReplicaEvent, ToReplica,
    },
    sequencer::{sequencer_loop, Sequencer, SequencerConfig, SequencerEvent, ToSequencer},
    task::BackgroundMonitor,
    Addr, Currency, Rates, ReplicaId, TxId,
};
use serde::Deserialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::error;

#[tokio::main]
async fn main() -> moneta::Result<()> {
    tracing_subscriber::fmt::init();
    let port = std::env::args()
        .nth(1)
        .as_deref()
        .unwrap_or("10000")
        .parse::<u16>()?;
    let app = AppState::default();
    let shutdown = app.shutdown.clone();
    let app = Router::new()
        .route("/ok", get(ok))
        .route("/run-sequencer", post(run_sequencer))
        .route("/run-replica", post(run_replica))
        .route("/reset", post(reset))
        .route("/submit", post(submit))
        .route("/balance/quick/:currency", get(quick_balance))
        .route("/balance/synced/:currency", get(synced_balance))
        .route("/history", get(history))
        .route("/status/:tx", get(tx_status))
        .route("/clean-history", post(clean_history))
        .route("/members", get(members))
        .with_state(app.into());
    let signal_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let result = tokio::signal::ctrl_c().await;
            shutdown.cancel();
            result
        }
    });
    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    signal_task.await??;
    Ok(())
}

#[derive(Default)]
struct AppState {
    role: Mutex<Option<RoleHandle>>,
    shutdown: CancellationToken,
}

struct RoleHandle {
    /// Present for the replica role only; the sequencer has no client
    /// surface.
    commands: Option<SubmitHandle<Command, CommandResult>>,
    reset: oneshot::Sender<()>,
}

type App = State<Arc<AppState>>;

async fn ok() {}

async fn run_sequencer(State(state): App, Json(payload): Json<control::Sequencer>) {
    let (reset_sender, reset_receiver) = oneshot::channel();
    *state.role.lock().expect("role lock poisoned") = Some(RoleHandle {
        commands: None,
        reset: reset_sender,
    });
    tokio::spawn(run_sequencer_internal(
        payload,
        reset_receiver,
        state.shutdown.clone(),
    ));
}

async fn run_sequencer_internal(
    config: control::Sequencer,
    reset: oneshot::Receiver<()>,
    shutdown: CancellationToken,
) {
    let monitor = BackgroundMonitor::default();
    let spawner = monitor.spawner();
    let (event, source) = event_channel();

    let setup: moneta::Result<()> = async {
        let socket = UdpSocket::bind(config.addr).await?;
        spawner.spawn({
            let socket = socket.clone();
            let event = event.clone();
            async move { socket.listen_loop::<ToSequencer, SequencerEvent>(event).await }
        });
        let mut sequencer_config = SequencerConfig::default();
        if let Some(millis) = config.retry_interval_millis {
            sequencer_config.retry_interval = Duration::from_millis(millis)
        }
        if let Some(millis) = config.evict_timeout_millis {
            sequencer_config.evict_timeout = Duration::from_millis(millis)
        }
        let sequencer = Sequencer::new(sequencer_config, spawner.clone());
        spawner.spawn(sequencer_loop(
            sequencer,
            event.clone(),
            source,
            socket.into_transport::<ToReplica>(),
        ));
        Ok(())
    }
    .await;

    run_until_reset(setup, reset, monitor, shutdown).await
}

async fn run_replica(State(state): App, Json(payload): Json<control::Replica>) {
    let (reset_sender, reset_receiver) = oneshot::channel();
    let (commands, command_source) = event_channel();
    *state.role.lock().expect("role lock poisoned") = Some(RoleHandle {
        commands: Some(commands),
        reset: reset_sender,
    });
    tokio::spawn(run_replica_internal(
        payload,
        command_source,
        reset_receiver,
        state.shutdown.clone(),
    ));
}

async fn run_replica_internal(
    config: control::Replica,
    commands: moneta::model::SubmitSource<Command, CommandResult>,
    reset: oneshot::Receiver<()>,
    shutdown: CancellationToken,
) {
    let monitor = BackgroundMonitor::default();
    let spawner = monitor.spawner();
    let (event, source) = event_channel();

    let setup: moneta::Result<()> = async {
        let rates = match &config.rate_file {
            Some(path) => Rates::load(path).await?,
            None => Rates::new(
                config
                    .rates
                    .iter()
                    .map(|(code, rate)| (Currency::new(code), *rate)),
            ),
        };
        let socket = UdpSocket::bind(config.addr).await?;
        spawner.spawn({
            let socket = socket.clone();
            let event = event.clone();
            async move { socket.listen_loop::<ToReplica, ReplicaEvent>(event).await }
        });
        let mut replica_config = ReplicaConfig::default();
        if let Some(millis) = config.read_timeout_millis {
            replica_config.read_timeout = Duration::from_millis(millis)
        }
        let sequencer_transport = socket.clone().into_transport::<ToSequencer>();
        let replica_transport = socket.into_transport::<ToReplica>();
        let replica = AccountReplica::new(
            ReplicaId::fresh(&config.group),
            Addr::Socket(config.addr),
            Addr::Socket(config.sequencer_addr),
            rates,
            replica_config,
            spawner.clone(),
            sequencer_transport.clone(),
        );
        let bootstrap_config = BootstrapConfig {
            expect_members: config.expect_members,
            ..Default::default()
        };
        spawner.spawn(async move {
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
            replica_loop(replica, event, source, commands, replica_transport).await
        });
        Ok(())
    }
    .await;

    run_until_reset(setup, reset, monitor, shutdown).await
}

async fn run_until_reset(
    setup: moneta::Result<()>,
    reset: oneshot::Receiver<()>,
    mut monitor: BackgroundMonitor,
    shutdown: CancellationToken,
) {
    let result = match setup {
        Err(err) => Err(err),
        Ok(()) => {
            tokio::select! {
                result = reset => result.map_err(Into::into),
                err = monitor.wait() => err,
            }
        }
    };
    if let Err(err) = result {
        error!("{err:#}");
        shutdown.cancel()
    }
    monitor.cancel()
}

async fn reset(State(state): App) -> StatusCode {
    match state.role.lock().expect("role lock poisoned").take() {
        Some(role) => {
            let _ = role.reset.send(());
            StatusCode::OK
        }
        None => StatusCode::CONFLICT,
    }
}

async fn dispatch(state: Arc<AppState>, command: Command) -> Response {
    let handle = state
        .role
        .lock()
        .expect("role lock poisoned")
        .as_ref()
        .and_then(|role| role.commands.clone());
    let Some(handle) = handle else {
        return (StatusCode::SERVICE_UNAVAILABLE, "no replica running").into_response();
    };
    match handle.submit(command).await {
        Ok(Ok(reply)) => Json(reply).into_response(),
        Ok(Err(err)) => {
            let status = match err {
                LedgerError::ReadTimeout => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::BAD_REQUEST,
            };
            (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": format!("{err:#}") })),
        )
            .into_response(),
    }
}

async fn submit(State(state): App, Json(op): Json<control::SubmitOp>) -> Response {
    let command = match op {
        control::SubmitOp::Deposit { currency, amount } => Command::Deposit {
            currency: Currency::new(currency),
            amount,
        },
        control::SubmitOp::AddInterest { currency, percent } => Command::AddInterest {
            currency: currency.map(Currency::new),
            percent,
        },
    };
    dispatch(state, command).await
}

async fn quick_balance(State(state): App, Path(currency): Path<String>) -> Response {
    dispatch(
        state,
        Command::QuickBalance {
            currency: Currency::new(currency),
        },
    )
    .await
}

#[derive(Debug, Deserialize)]
struct ReadQuery {
    mode: Option<String>,
}

async fn synced_balance(
    State(state): App,
    Path(currency): Path<String>,
    Query(query): Query<ReadQuery>,
) -> Response {
    let mode = match query.mode.as_deref() {
        None | Some("correct") => ReadMode::Correct,
        Some("naive") => ReadMode::Naive,
        Some(other) => {
            return (StatusCode::BAD_REQUEST, format!("unknown read mode {other}"))
                .into_response()
        }
    };
    dispatch(
        state,
        Command::SyncedBalance {
            currency: Currency::new(currency),
            mode,
        },
    )
    .await
}

async fn history(State(state): App) -> Response {
    dispatch(state, Command::History).await
}

async fn tx_status(State(state): App, Path(tx): Path<String>) -> Response {
    let tx = match tx.parse::<TxId>() {
        Ok(tx) => tx,
        Err(err) => return (StatusCode::BAD_REQUEST, format!("{err:#}")).into_response(),
    };
    dispatch(state, Command::Status { tx }).await
}

async fn clean_history(State(state): App) -> Response {
    dispatch(state, Command::CleanHistory).await
}

async fn members(State(state): App) -> Response {
    dispatch(state, Command::Members).await
}
