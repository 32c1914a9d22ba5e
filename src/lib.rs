pub mod addr;
pub mod bootstrap;
pub mod directory;
pub mod ledger;
pub mod model;
pub mod net;
pub mod rate;
pub mod replica;
pub mod sequencer;
pub mod task;

pub use anyhow::{anyhow as err, bail, Error, Result};

pub use crate::addr::Addr;
pub use crate::ledger::{GroupId, LedgerError, ReplicaId, TxId};
pub use crate::rate::{Currency, Rates};
pub use crate::replica::AccountReplica;
