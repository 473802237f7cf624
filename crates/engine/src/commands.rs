//! Command structs for engine operations.
//!
//! These types group parameters for write operations, keeping call sites
//! readable and avoiding long argument lists.

use uuid::Uuid;

use crate::{Currency, LedgerEvent, Origin};

/// Credit or debit one ledger account.
///
/// `idempotency_key` is global: the same key always refers to the same event,
/// whichever account or amount a later caller passes.
#[derive(Clone, Debug)]
pub struct ApplyCmd {
    pub user_id: Uuid,
    pub currency: Currency,
    pub delta: i64,
    pub idempotency_key: String,
    pub origin: Origin,
    pub reason: String,
    pub reference_id: Option<String>,
    /// Loyalty handle to mirror a confirmed credit/debit to, as points.
    pub mirror_handle: Option<String>,
}

impl ApplyCmd {
    #[must_use]
    pub fn new(
        user_id: Uuid,
        currency: Currency,
        delta: i64,
        idempotency_key: impl Into<String>,
        origin: Origin,
    ) -> Self {
        Self {
            user_id,
            currency,
            delta,
            idempotency_key: idempotency_key.into(),
            origin,
            reason: String::new(),
            reference_id: None,
            mirror_handle: None,
        }
    }

    #[must_use]
    pub fn credit(
        user_id: Uuid,
        currency: Currency,
        amount: i64,
        idempotency_key: impl Into<String>,
        origin: Origin,
    ) -> Self {
        Self::new(user_id, currency, amount, idempotency_key, origin)
    }

    #[must_use]
    pub fn debit(
        user_id: Uuid,
        currency: Currency,
        amount: i64,
        idempotency_key: impl Into<String>,
        origin: Origin,
    ) -> Self {
        // `i64::MIN` has no negation; a zero delta is rejected on apply.
        let delta = amount.checked_neg().unwrap_or(0);
        Self::new(user_id, currency, delta, idempotency_key, origin)
    }

    #[must_use]
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    #[must_use]
    pub fn reference_id(mut self, reference_id: impl Into<String>) -> Self {
        self.reference_id = Some(reference_id.into());
        self
    }

    #[must_use]
    pub fn mirror_to(mut self, handle: impl Into<String>) -> Self {
        self.mirror_handle = Some(handle.into());
        self
    }
}

impl From<&LedgerEvent> for ApplyCmd {
    /// Rebuilds the command a stored event was created from.
    fn from(event: &LedgerEvent) -> Self {
        Self {
            user_id: event.user_id,
            currency: event.currency,
            delta: event.delta,
            idempotency_key: event.idempotency_key.clone(),
            origin: event.origin,
            reason: event.reason.clone(),
            reference_id: event.reference_id.clone(),
            mirror_handle: None,
        }
    }
}

/// A profile carried over from the previous system, with its balances.
#[derive(Clone, Debug)]
pub struct LegacyProfile {
    /// Stable id in the previous system; re-importing the same id is a no-op.
    pub legacy_id: String,
    pub handle: String,
    pub external_id: Option<String>,
    pub character_name: Option<String>,
    pub coins: i64,
    pub tickets: i64,
}

impl LegacyProfile {
    #[must_use]
    pub fn new(legacy_id: impl Into<String>, handle: impl Into<String>) -> Self {
        Self {
            legacy_id: legacy_id.into(),
            handle: handle.into(),
            external_id: None,
            character_name: None,
            coins: 0,
            tickets: 0,
        }
    }

    #[must_use]
    pub fn external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    #[must_use]
    pub fn character_name(mut self, name: impl Into<String>) -> Self {
        self.character_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn balances(mut self, coins: i64, tickets: i64) -> Self {
        self.coins = coins;
        self.tickets = tickets;
        self
    }

    pub(crate) fn balance(&self, currency: crate::Currency) -> i64 {
        match currency {
            crate::Currency::Coins => self.coins,
            crate::Currency::Tickets => self.tickets,
        }
    }
}
