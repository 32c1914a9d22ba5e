//! Currency table: which currencies exist and how they convert through the
//! canonical unit every balance is stored in.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ledger::LedgerError;

pub const CANONICAL: &str = "USD";

/// Upper-cased currency code, e.g. `EUR`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Currency(String);

impl Currency {
    pub fn new(code: impl AsRef<str>) -> Self {
        Self(code.as_ref().to_uppercase())
    }

    pub fn canonical() -> Self {
        Self(CANONICAL.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Currency {
    fn from(code: &str) -> Self {
        Self::new(code)
    }
}

impl std::str::FromStr for Currency {
    type Err = std::convert::Infallible;

    fn from_str(code: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(code))
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-currency rate to the canonical unit. The canonical currency is always
/// present with rate 1.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rates(BTreeMap<Currency, f64>);

impl Default for Rates {
    fn default() -> Self {
        Self::new([])
    }
}

impl Rates {
    pub fn new(rates: impl IntoIterator<Item = (Currency, f64)>) -> Self {
        let mut table = BTreeMap::from_iter(rates);
        table.insert(Currency::canonical(), 1.0);
        Self(table)
    }

    /// Parses a `<CODE> <rate-to-canonical>` line table. Lines that do not
    /// have exactly two fields are skipped.
    pub fn parse(source: &str) -> crate::Result<Self> {
        let mut rates = Vec::new();
        for line in source.lines() {
            let fields = Vec::from_iter(line.split_whitespace());
            let &[code, rate] = fields.as_slice() else {
                continue;
            };
            rates.push((Currency::new(code), rate.parse::<f64>()?))
        }
        Ok(Self::new(rates))
    }

    pub async fn load(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        Self::parse(&tokio::fs::read_to_string(path).await?)
    }

    pub fn is_supported(&self, currency: &Currency) -> bool {
        self.0.contains_key(currency)
    }

    pub fn supported(&self) -> impl Iterator<Item = &Currency> {
        self.0.keys()
    }

    fn rate(&self, currency: &Currency) -> Result<f64, LedgerError> {
        self.0
            .get(currency)
            .copied()
            .ok_or_else(|| LedgerError::UnsupportedCurrency(currency.clone()))
    }

    pub fn to_canonical(&self, currency: &Currency, amount: f64) -> Result<f64, LedgerError> {
        Ok(amount * self.rate(currency)?)
    }

    pub fn from_canonical(&self, currency: &Currency, amount: f64) -> Result<f64, LedgerError> {
        Ok(amount / self.rate(currency)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Rates {
        Rates::new([("EUR".into(), 1.17), ("NOK".into(), 0.1)])
    }

    #[test]
    fn canonical_always_supported() {
        assert!(Rates::default().is_supported(&Currency::canonical()));
        assert_eq!(
            Rates::default().to_canonical(&Currency::canonical(), 42.0),
            Ok(42.0)
        )
    }

    #[test]
    fn converts_both_ways() {
        let rates = table();
        assert_eq!(rates.to_canonical(&"EUR".into(), 100.0), Ok(117.0));
        assert_eq!(rates.from_canonical(&"NOK".into(), 10.0), Ok(100.0))
    }

    #[test]
    fn unsupported_is_an_error() {
        assert_eq!(
            table().to_canonical(&"JPY".into(), 1.0),
            Err(LedgerError::UnsupportedCurrency("JPY".into()))
        )
    }

    #[test]
    fn parses_rate_table() {
        let rates = Rates::parse("EUR 1.17\n\nmalformed line here\nnok 0.10\n").unwrap();
        assert_eq!(rates, table());
        assert_eq!(
            Vec::from_iter(rates.supported().cloned()),
            ["EUR".into(), "NOK".into(), "USD".into()]
        )
    }

    #[test]
    fn rejects_bad_rate() {
        assert!(Rates::parse("EUR x.yz").is_err())
    }
}
