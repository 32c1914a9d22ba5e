//! Drives a local cluster through the control plane of already-running
//! `moneta` processes: one sequencer and two replicas of the same account
//! group, a short deposit/interest scenario, then a synchronized read on
//! every replica.

use std::{sync::OnceLock, time::Duration};

use ledger_control_messages as messages;
use tokio::time::sleep;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    CLIENT
        .set(
            reqwest::Client::builder()
                .timeout(Duration::from_secs(35))
                .build()?,
        )
        .unwrap();
    scenario_session().await
}

static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

const SEQUENCER_URL: &str = "http://127.0.0.1:10000";
const REPLICA_URLS: [&str; 2] = ["http://127.0.0.1:10001", "http://127.0.0.1:10002"];

fn rates() -> Vec<(String, f64)> {
    vec![("EUR".into(), 1.17), ("NOK".into(), 0.1)]
}

async fn start_sequencer(url: &str) -> anyhow::Result<()> {
    let config = messages::Sequencer {
        addr: ([127, 0, 0, 1], 30000).into(),
        retry_interval_millis: None,
        evict_timeout_millis: None,
    };
    CLIENT
        .get()
        .unwrap()
        .post(format!("{url}/run-sequencer"))
        .json(&config)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

async fn start_replica(url: &str, index: usize) -> anyhow::Result<()> {
    let config = messages::Replica {
        group: "acme".into(),
        addr: ([127, 0, 0, 1], 30001 + index as u16).into(),
        sequencer_addr: ([127, 0, 0, 1], 30000).into(),
        expect_members: REPLICA_URLS.len(),
        rates: rates(),
        rate_file: None,
        read_timeout_millis: None,
    };
    CLIENT
        .get()
        .unwrap()
        .post(format!("{url}/run-replica"))
        .json(&config)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

async fn submit(url: &str, op: messages::SubmitOp) -> anyhow::Result<serde_json::Value> {
    Ok(CLIENT
        .get()
        .unwrap()
        .post(format!("{url}/submit"))
        .json(&op)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?)
}

async fn synced_balance(url: &str, currency: &str) -> anyhow::Result<serde_json::Value> {
    Ok(CLIENT
        .get()
        .unwrap()
        .get(format!("{url}/balance/synced/{currency}"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?)
}

async fn reset(url: &str) -> anyhow::Result<()> {
    CLIENT
        .get()
        .unwrap()
        .post(format!("{url}/reset"))
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

async fn scenario_session() -> anyhow::Result<()> {
    start_sequencer(SEQUENCER_URL).await?;
    for (index, url) in REPLICA_URLS.into_iter().enumerate() {
        start_replica(url, index).await?
    }
    // leave the startup barrier a moment to release
    sleep(Duration::from_secs(1)).await;

    let tx = submit(
        REPLICA_URLS[0],
        messages::SubmitOp::Deposit {
            currency: "EUR".into(),
            amount: 100.0,
        },
    )
    .await?;
    println!("deposit submitted: {tx}");
    let tx = submit(
        REPLICA_URLS[1],
        messages::SubmitOp::AddInterest {
            currency: None,
            percent: 10.0,
        },
    )
    .await?;
    println!("interest submitted: {tx}");

    for url in REPLICA_URLS {
        let balance = synced_balance(url, "USD").await?;
        println!("{url} synced USD balance: {balance}")
    }

    for url in [SEQUENCER_URL].into_iter().chain(REPLICA_URLS) {
        reset(url).await?
    }
    Ok(())
}
