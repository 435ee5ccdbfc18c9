//! Fund ledger
//!
//! Single source of truth for how much capital can be allocated. Capital is
//! in exactly one of three places: free cash, locked behind a pending order,
//! or invested in an open position. `cash` is the uninvested balance and
//! still contains the locked amounts; locking only earmarks it.
//!
//! Every operation is checked. Committing or releasing more than is locked,
//! or realizing more than is invested, is a defect and fails loudly instead
//! of clamping.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::LedgerError;
use crate::zones::LevelName;

#[derive(Debug, Clone, PartialEq)]
pub struct FundLedger {
    initial_capital: Decimal,
    cash: Decimal,
    invested: BTreeMap<LevelName, Decimal>,
    locked: BTreeMap<LevelName, Decimal>,
    realized_pnl: Decimal,
}

impl FundLedger {
    pub fn new(initial_capital: Decimal) -> Self {
        let zeroed: BTreeMap<LevelName, Decimal> =
            LevelName::ALL.iter().map(|l| (*l, Decimal::ZERO)).collect();
        Self {
            initial_capital,
            cash: initial_capital,
            invested: zeroed.clone(),
            locked: zeroed,
            realized_pnl: Decimal::ZERO,
        }
    }

    pub fn initial_capital(&self) -> Decimal {
        self.initial_capital
    }

    /// Uninvested balance, locked amounts included
    pub fn cash(&self) -> Decimal {
        self.cash
    }

    /// Cash not earmarked by any pending order
    pub fn free_cash(&self) -> Decimal {
        self.cash - self.total_locked()
    }

    pub fn invested(&self, level: LevelName) -> Decimal {
        self.invested.get(&level).copied().unwrap_or_default()
    }

    pub fn locked(&self, level: LevelName) -> Decimal {
        self.locked.get(&level).copied().unwrap_or_default()
    }

    pub fn total_invested(&self) -> Decimal {
        self.invested.values().sum()
    }

    pub fn total_locked(&self) -> Decimal {
        self.locked.values().sum()
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.realized_pnl
    }

    /// `min(cap - invested - locked, free cash)`, never negative
    pub fn available_to_enter(&self, level: LevelName, theoretical_cap: Decimal) -> Decimal {
        let headroom = theoretical_cap - self.invested(level) - self.locked(level);
        headroom.min(self.free_cash()).max(Decimal::ZERO)
    }

    /// Earmark `amount` for a pending order at `level`
    pub fn lock(
        &mut self,
        level: LevelName,
        amount: Decimal,
        theoretical_cap: Decimal,
    ) -> Result<(), LedgerError> {
        ensure_positive(level, amount)?;
        let available = self.available_to_enter(level, theoretical_cap);
        if amount > available {
            return Err(LedgerError::InsufficientFunds {
                level,
                requested: amount,
                available,
            });
        }
        *self.locked.entry(level).or_default() += amount;
        Ok(())
    }

    /// Turn a lock into an investment; cash leaves the ledger
    pub fn commit(&mut self, level: LevelName, amount: Decimal) -> Result<(), LedgerError> {
        ensure_positive(level, amount)?;
        let locked = self.locked(level);
        if amount > locked {
            return Err(LedgerError::DoubleCommit {
                level,
                requested: amount,
                locked,
            });
        }
        *self.locked.entry(level).or_default() -= amount;
        *self.invested.entry(level).or_default() += amount;
        self.cash -= amount;
        Ok(())
    }

    /// Drop a lock without touching cash (expiry or cancel)
    pub fn release(&mut self, level: LevelName, amount: Decimal) -> Result<(), LedgerError> {
        ensure_positive(level, amount)?;
        let locked = self.locked(level);
        if amount > locked {
            return Err(LedgerError::DoubleRelease {
                level,
                requested: amount,
                locked,
            });
        }
        *self.locked.entry(level).or_default() -= amount;
        Ok(())
    }

    /// Close out `cost_basis` of invested capital for `proceeds`; returns the pnl
    pub fn realize(
        &mut self,
        level: LevelName,
        cost_basis: Decimal,
        proceeds: Decimal,
    ) -> Result<Decimal, LedgerError> {
        ensure_positive(level, cost_basis)?;
        let invested = self.invested(level);
        if cost_basis > invested {
            return Err(LedgerError::InvestedUnderflow {
                level,
                requested: cost_basis,
                invested,
            });
        }
        *self.invested.entry(level).or_default() -= cost_basis;
        self.cash += proceeds;
        let pnl = proceeds - cost_basis;
        self.realized_pnl += pnl;
        Ok(pnl)
    }

    /// Lock and commit in one step for entries that fill immediately
    pub fn enter_direct(
        &mut self,
        level: LevelName,
        amount: Decimal,
        theoretical_cap: Decimal,
    ) -> Result<(), LedgerError> {
        self.transact(|ledger| {
            ledger.lock(level, amount, theoretical_cap)?;
            ledger.commit(level, amount)
        })
    }

    /// Run `f` against the ledger; on error the ledger is left exactly as it was
    pub fn transact<T>(
        &mut self,
        f: impl FnOnce(&mut FundLedger) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let saved = self.clone();
        let result = f(self);
        if result.is_err() {
            *self = saved;
        }
        result
    }

    /// Check `free_cash + invested + locked == initial + realized_pnl`
    pub fn check_conservation(&self) -> Result<(), String> {
        let accounted = self.free_cash() + self.total_invested() + self.total_locked();
        let expected = self.initial_capital + self.realized_pnl;
        if accounted != expected {
            return Err(format!(
                "free cash + invested + locked = {accounted}, expected {expected}"
            ));
        }
        if self.free_cash() < Decimal::ZERO {
            return Err(format!("free cash is negative: {}", self.free_cash()));
        }
        if let Some((level, amount)) = self
            .invested
            .iter()
            .chain(self.locked.iter())
            .find(|(_, v)| **v < Decimal::ZERO)
        {
            return Err(format!("negative balance {amount} at {level}"));
        }
        Ok(())
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            initial_capital: self.initial_capital,
            cash: self.cash,
            free_cash: self.free_cash(),
            total_invested: self.total_invested(),
            total_locked: self.total_locked(),
            realized_pnl: self.realized_pnl,
            invested: self.invested.clone(),
            locked: self.locked.clone(),
        }
    }
}

fn ensure_positive(level: LevelName, amount: Decimal) -> Result<(), LedgerError> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::NonPositiveAmount { level, amount });
    }
    Ok(())
}

/// Point-in-time copy of the ledger, attached to fatal errors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub initial_capital: Decimal,
    pub cash: Decimal,
    pub free_cash: Decimal,
    pub total_invested: Decimal,
    pub total_locked: Decimal,
    pub realized_pnl: Decimal,
    pub invested: BTreeMap<LevelName, Decimal>,
    pub locked: BTreeMap<LevelName, Decimal>,
}

impl fmt::Display for LedgerSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cash={} free={} invested={} locked={} realized={}",
            self.cash, self.free_cash, self.total_invested, self.total_locked, self.realized_pnl
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const S1: LevelName = LevelName::Support1;
    const S2: LevelName = LevelName::Support2;

    #[test]
    fn test_available_is_min_of_cap_and_free_cash() {
        let mut ledger = FundLedger::new(dec!(1000));
        assert_eq!(ledger.available_to_enter(S2, dec!(300)), dec!(300));

        ledger.lock(S2, dec!(100), dec!(300)).unwrap();
        assert_eq!(ledger.available_to_enter(S2, dec!(300)), dec!(200));
        assert_eq!(ledger.cash(), dec!(1000));
        assert_eq!(ledger.free_cash(), dec!(900));

        // Free cash caps a generous level allowance
        assert_eq!(ledger.available_to_enter(S1, dec!(5000)), dec!(900));
    }

    #[test]
    fn test_lock_beyond_available_fails() {
        let mut ledger = FundLedger::new(dec!(1000));
        let err = ledger.lock(S2, dec!(301), dec!(300)).unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(
            err,
            LedgerError::InsufficientFunds {
                level: S2,
                requested: dec!(301),
                available: dec!(300)
            }
        );
        assert_eq!(ledger.total_locked(), Decimal::ZERO);
    }

    #[test]
    fn test_lock_commit_realize_cycle() {
        let mut ledger = FundLedger::new(dec!(1000));
        ledger.lock(S1, dec!(200), dec!(200)).unwrap();
        ledger.commit(S1, dec!(200)).unwrap();
        assert_eq!(ledger.cash(), dec!(800));
        assert_eq!(ledger.invested(S1), dec!(200));
        assert_eq!(ledger.locked(S1), Decimal::ZERO);
        ledger.check_conservation().unwrap();

        let pnl = ledger.realize(S1, dec!(200), dec!(230)).unwrap();
        assert_eq!(pnl, dec!(30));
        assert_eq!(ledger.cash(), dec!(1030));
        assert_eq!(ledger.realized_pnl(), dec!(30));
        ledger.check_conservation().unwrap();
    }

    #[test]
    fn test_double_release_and_commit_are_errors() {
        let mut ledger = FundLedger::new(dec!(1000));
        ledger.lock(S2, dec!(100), dec!(300)).unwrap();
        ledger.release(S2, dec!(100)).unwrap();

        let err = ledger.release(S2, dec!(100)).unwrap_err();
        assert!(matches!(err, LedgerError::DoubleRelease { .. }));
        assert!(!err.is_recoverable());

        let err = ledger.commit(S2, dec!(50)).unwrap_err();
        assert!(matches!(err, LedgerError::DoubleCommit { .. }));
        assert_eq!(ledger.cash(), dec!(1000));
    }

    #[test]
    fn test_realize_more_than_invested_fails() {
        let mut ledger = FundLedger::new(dec!(1000));
        ledger.enter_direct(S1, dec!(100), dec!(200)).unwrap();
        let err = ledger.realize(S1, dec!(150), dec!(150)).unwrap_err();
        assert!(matches!(err, LedgerError::InvestedUnderflow { .. }));
        assert_eq!(ledger.invested(S1), dec!(100));
    }

    #[test]
    fn test_transact_rolls_back_on_error() {
        let mut ledger = FundLedger::new(dec!(1000));
        let before = ledger.clone();
        let result = ledger.transact(|l| {
            l.lock(S1, dec!(100), dec!(200))?;
            l.commit(S1, dec!(100))?;
            l.commit(S1, dec!(1))
        });
        assert!(result.is_err());
        assert_eq!(ledger, before);
    }

    #[test]
    fn test_non_positive_amounts_rejected() {
        let mut ledger = FundLedger::new(dec!(1000));
        assert!(matches!(
            ledger.lock(S1, Decimal::ZERO, dec!(200)),
            Err(LedgerError::NonPositiveAmount { .. })
        ));
    }

    #[test]
    fn test_snapshot_display() {
        let ledger = FundLedger::new(dec!(1000));
        let text = ledger.snapshot().to_string();
        assert!(text.contains("cash=1000"));
        assert!(text.contains("locked=0"));
    }
}
