//! Monthly spend-limit guard.
//!
//! Enforcement is all-or-nothing: a charge either fits the remaining budget in
//! full or is rejected. The predicate itself runs inside the store's
//! conditional update; this module reads a shop's position for the dashboard
//! and the limit notice.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::domain::ShopSettings;
use super::rules::whole_trees;

/// Absorbs float noise when a charge lands exactly on the budget.
pub(crate) const SPEND_TOLERANCE: f64 = 1e-9;

/// `YYYY-MM` bucket that monthly spend is tracked in.
pub fn spend_period(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

/// Snapshot of a shop's budget position for one period.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpendGuard {
    budget: Option<f64>,
    spent: f64,
}

impl SpendGuard {
    pub fn new(budget: Option<f64>, spent: f64) -> Self {
        Self {
            budget,
            spent: spent.max(0.0),
        }
    }

    pub fn from_settings(settings: &ShopSettings, period: &str) -> Self {
        Self::new(settings.monthly_budget, settings.spent_in(period))
    }

    pub fn spent(&self) -> f64 {
        self.spent
    }

    /// Budget left this period; `None` when the shop has no limit.
    pub fn remaining(&self) -> Option<f64> {
        self.budget.map(|budget| (budget - self.spent).max(0.0))
    }

    /// Largest number of trees the remaining budget still covers.
    pub fn remaining_trees(&self, cost_per_tree: f64) -> Option<u32> {
        let remaining = self.remaining()?;
        if cost_per_tree <= 0.0 {
            return Some(0);
        }
        // Nudge up so 5.0 / 0.5 does not land on 9.999...
        Some(whole_trees(remaining / cost_per_tree + SPEND_TOLERANCE))
    }

    /// Percentage of the budget used, capped at 100; zero when unlimited.
    pub fn progress_percent(&self) -> f64 {
        match self.budget {
            Some(budget) if budget > 0.0 => (self.spent / budget * 100.0).min(100.0),
            Some(_) => 100.0,
            None => 0.0,
        }
    }

    pub fn progress(&self) -> MonthlyProgress {
        MonthlyProgress {
            monthly_budget: self.budget,
            monthly_spent: self.spent,
            remaining: self.remaining(),
            progress_percent: self.progress_percent(),
        }
    }
}

/// Dashboard view of the monthly budget.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyProgress {
    pub monthly_budget: Option<f64>,
    pub monthly_spent: f64,
    pub remaining: Option<f64>,
    pub progress_percent: f64,
}
