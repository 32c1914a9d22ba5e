use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequencer {
    pub addr: SocketAddr,
    pub retry_interval_millis: Option<u64>,
    pub evict_timeout_millis: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Replica {
    pub group: String,
    pub addr: SocketAddr,
    pub sequencer_addr: SocketAddr,
    /// Startup barrier size; zero starts serving commands immediately.
    #[serde(default)]
    pub expect_members: usize,
    /// Inline `(code, rate-to-canonical)` table.
    #[serde(default)]
    pub rates: Vec<(String, f64)>,
    /// Alternatively a `<CODE> <rate>` file to load the table from.
    #[serde(default)]
    pub rate_file: Option<String>,
    #[serde(default)]
    pub read_timeout_millis: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubmitOp {
    Deposit {
        currency: String,
        amount: f64,
    },
    /// `currency: None` is the ALL form.
    AddInterest {
        currency: Option<String>,
        percent: f64,
    },
}
