use super::request_cache::RequestPriority;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

/// Category of live data that UI components subscribe to.
///
/// The known variants carry a polling policy; `Other` keeps the set open for
/// categories added by collaborators and falls back to the market-data tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DataType {
    Balances,
    Transactions,
    LiquidityPositions,
    MarketData,
    TokenPrices,
    PortfolioValue,
    Other(String),
}

/// Policy tier a data type draws its intervals and TTL from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyTier {
    Balances,
    MarketData,
}

impl DataType {
    pub const KNOWN: [Self; 6] = [
        Self::Balances,
        Self::Transactions,
        Self::LiquidityPositions,
        Self::MarketData,
        Self::TokenPrices,
        Self::PortfolioValue,
    ];

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Balances => "balances",
            Self::Transactions => "transactions",
            Self::LiquidityPositions => "liquidityPositions",
            Self::MarketData => "marketData",
            Self::TokenPrices => "tokenPrices",
            Self::PortfolioValue => "portfolioValue",
            Self::Other(name) => name,
        }
    }

    /// `None` for data types without an explicit policy entry.
    #[must_use]
    pub const fn tier(&self) -> Option<PolicyTier> {
        match self {
            // Wallet-scoped data and values derived from it
            Self::Balances
            | Self::Transactions
            | Self::LiquidityPositions
            | Self::PortfolioValue => Some(PolicyTier::Balances),
            Self::MarketData | Self::TokenPrices => Some(PolicyTier::MarketData),
            Self::Other(_) => None,
        }
    }

    #[must_use]
    pub const fn priority(&self) -> RequestPriority {
        match self {
            Self::Balances | Self::MarketData => RequestPriority::High,
            Self::TokenPrices | Self::PortfolioValue => RequestPriority::Normal,
            Self::Transactions | Self::LiquidityPositions | Self::Other(_) => RequestPriority::Low,
        }
    }

    #[must_use]
    pub const fn is_known(&self) -> bool {
        self.tier().is_some()
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::KNOWN
            .into_iter()
            .find(|known| known.as_str() == s)
            .unwrap_or_else(|| Self::Other(s.to_string())))
    }
}

impl From<String> for DataType {
    fn from(value: String) -> Self {
        match value.parse() {
            Ok(data_type) => data_type,
            Err(never) => match never {},
        }
    }
}

impl From<&str> for DataType {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<DataType> for String {
    fn from(value: DataType) -> Self {
        value.as_str().to_string()
    }
}
