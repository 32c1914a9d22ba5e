//! The replicated account: identifiers, operations, and the deterministic
//! application of operations to balances.
//!
//! Balances only ever change inside [`Op::apply`]. Every other code path
//! (submission, broadcast, snapshot transfer) moves transactions around
//! without touching money.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::rate::{Currency, Rates};

pub type GroupId = String;

/// Replica identity. The group a replica belongs to is part of the id, so
/// the delivery service can route a broadcast from the sender id alone.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId {
    pub group: GroupId,
    pub nonce: u32,
}

impl ReplicaId {
    /// A fresh instance identity. A restarted process never reuses its old
    /// one; it rejoins as a new member.
    pub fn fresh(group: impl Into<GroupId>) -> Self {
        Self {
            group: group.into(),
            nonce: rand::random(),
        }
    }
}

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.group, self.nonce)
    }
}

impl std::str::FromStr for ReplicaId {
    type Err = crate::Error;

    fn from_str(id: &str) -> crate::Result<Self> {
        let (group, nonce) = id
            .rsplit_once('/')
            .ok_or(crate::err!("malformed replica id {id}"))?;
        Ok(Self {
            group: group.into(),
            nonce: nonce.parse()?,
        })
    }
}

/// Globally unique, never reused: origin replica id plus its local counter.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxId {
    pub origin: ReplicaId,
    pub seq: u32,
}

impl std::fmt::Display for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.origin, self.seq)
    }
}

impl std::str::FromStr for TxId {
    type Err = crate::Error;

    fn from_str(id: &str) -> crate::Result<Self> {
        let (origin, seq) = id
            .rsplit_once('#')
            .ok_or(crate::err!("malformed transaction id {id}"))?;
        Ok(Self {
            origin: origin.parse()?,
            seq: seq.parse()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    Deposit {
        currency: Currency,
        amount: f64,
    },
    /// `currency: None` applies the interest to every tracked currency's
    /// canonical contribution (the `ALL` form).
    AddInterest {
        currency: Option<Currency>,
        percent: f64,
    },
    /// Read marker flowing through the ordered channel; no balance effect.
    SyncedRead {
        currency: Currency,
    },
    /// Operation kinds this build does not understand are applied as a
    /// logged no-op so a replica stays live across protocol evolution.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxId,
    pub op: Op,
    pub created_at_millis: u64,
}

/// The unit of ordered delivery: all transactions a sender handed to the
/// sequencer in one broadcast call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub sender: ReplicaId,
    pub transactions: Vec<Transaction>,
}

pub type Balances = BTreeMap<Currency, f64>;

pub fn zeroed_balances(rates: &Rates) -> Balances {
    rates.supported().cloned().map(|currency| (currency, 0.0)).collect()
}

/// Point-in-time copy handed to a joining replica; consumed once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub balances: Balances,
    pub executed: Vec<Transaction>,
    pub outstanding: Vec<Transaction>,
    pub order_counter: u64,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LedgerError {
    #[error("unsupported currency {0}")]
    UnsupportedCurrency(Currency),
    #[error("deposit amount must be positive, got {0}")]
    NonPositiveAmount(f64),
    #[error("synchronized read timed out")]
    ReadTimeout,
    #[error("unknown operation kind")]
    UnknownOperation,
}

impl Op {
    /// Deterministic balance effect of one operation. `Err` means the
    /// operation has no effect; the caller decides how loudly to say so.
    pub fn apply(&self, balances: &mut Balances, rates: &Rates) -> Result<(), LedgerError> {
        let canonical = Currency::canonical();
        match self {
            Self::Deposit { currency, amount } => {
                let delta = rates.to_canonical(currency, *amount)?;
                *balances.entry(canonical).or_insert(0.0) += delta
            }
            Self::AddInterest {
                currency: Some(currency),
                percent,
            } => {
                let total = balances.get(&canonical).copied().unwrap_or(0.0);
                let in_currency = rates.from_canonical(currency, total)?;
                let total = rates.to_canonical(currency, in_currency * (1.0 + percent / 100.0))?;
                balances.insert(canonical, total);
            }
            Self::AddInterest {
                currency: None,
                percent,
            } => {
                let factor = 1.0 + percent / 100.0;
                for amount in balances.values_mut() {
                    *amount *= factor
                }
            }
            Self::SyncedRead { .. } => {}
            Self::Unknown => return Err(LedgerError::UnknownOperation),
        }
        Ok(())
    }
}
