use serde::{Deserialize, Serialize};

use crate::EngineError;

/// Internal portal currency held in the ledger.
///
/// Loyalty *points* are not a `Currency`: they live in the remote loyalty
/// service and only move through the external sync adapter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Currency {
    #[default]
    Coins,
    Tickets,
}

impl Currency {
    /// Every ledger currency, in a fixed order.
    pub const ALL: [Currency; 2] = [Currency::Coins, Currency::Tickets];

    /// Canonical storage code.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Currency::Coins => "coins",
            Currency::Tickets => "tickets",
        }
    }
}

impl core::fmt::Display for Currency {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.code())
    }
}

impl TryFrom<&str> for Currency {
    type Error = EngineError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.trim().to_ascii_lowercase().as_str() {
            "coins" => Ok(Currency::Coins),
            "tickets" => Ok(Currency::Tickets),
            other => Err(EngineError::Validation(format!(
                "unsupported currency: {other}"
            ))),
        }
    }
}
