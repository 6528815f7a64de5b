//! On-demand reporting over the sequence book.
//!
//! Pure functions over a loaded snapshot; nothing here writes. The service
//! exposes them behind `list_all`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use dunning_sequence::{DunningSequence, DunningStatus};

/// Outstanding exposure for one currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CurrencyAtRisk {
    pub currency: String,
    /// Minor units, summed over non-terminal sequences.
    pub total: u64,
    pub sequences: u64,
    /// Exposure keyed by whole days since the sequence opened.
    pub by_age_days: BTreeMap<i64, u64>,
}

/// Revenue-at-risk snapshot: everything still collectible (Active, Escalated
/// or Paused), grouped per currency. Amounts in different currencies are
/// never summed together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RevenueAtRisk {
    pub as_of: Option<DateTime<Utc>>,
    pub currencies: Vec<CurrencyAtRisk>,
}

pub fn revenue_at_risk(sequences: &[DunningSequence], now: DateTime<Utc>) -> RevenueAtRisk {
    let mut per_currency: BTreeMap<String, CurrencyAtRisk> = BTreeMap::new();

    for seq in sequences.iter().filter(|s| !s.status().is_terminal()) {
        let amount = seq.amount_at_risk().amount();
        let code = seq.amount_at_risk().currency().as_str().to_string();
        let entry = per_currency
            .entry(code.clone())
            .or_insert_with(|| CurrencyAtRisk {
                currency: code,
                total: 0,
                sequences: 0,
                by_age_days: BTreeMap::new(),
            });
        entry.total += amount;
        entry.sequences += 1;
        *entry.by_age_days.entry(seq.age_days(now)).or_insert(0) += amount;
    }

    RevenueAtRisk {
        as_of: Some(now),
        currencies: per_currency.into_values().collect(),
    }
}

/// Aggregate statistics over a reporting window.
///
/// Status counts are a current snapshot; the windowed figures only count
/// sequences that opened or terminated inside `[from, to)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DunningStatistics {
    pub window_from: Option<DateTime<Utc>>,
    pub window_to: Option<DateTime<Utc>>,
    pub by_status: BTreeMap<String, u64>,
    pub opened: u64,
    pub recovered: u64,
    pub cancelled: u64,
    pub exhausted: u64,
    /// recovered / (recovered + cancelled + exhausted); 0 when nothing closed.
    pub recovery_rate: f64,
    /// Mean charge attempts on sequences that recovered in the window.
    pub avg_attempts_to_recovery: f64,
    /// Recovered amounts per currency (minor units), windowed.
    pub amount_recovered: BTreeMap<String, u64>,
}

pub fn statistics(
    sequences: &[DunningSequence],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> DunningStatistics {
    let mut stats = DunningStatistics {
        window_from: Some(from),
        window_to: Some(to),
        ..DunningStatistics::default()
    };

    let in_window = |at: DateTime<Utc>| at >= from && at < to;
    let mut recovery_attempts = 0u64;

    for seq in sequences {
        *stats
            .by_status
            .entry(seq.status().as_str().to_string())
            .or_insert(0) += 1;

        if in_window(seq.created_at()) {
            stats.opened += 1;
        }

        let Some(terminated_at) = seq.terminated_at() else {
            continue;
        };
        if !in_window(terminated_at) {
            continue;
        }
        match seq.status() {
            DunningStatus::Recovered => {
                stats.recovered += 1;
                recovery_attempts += u64::from(seq.attempts_made());
                let code = seq.amount_at_risk().currency().as_str().to_string();
                *stats.amount_recovered.entry(code).or_insert(0) +=
                    seq.amount_at_risk().amount();
            }
            DunningStatus::Cancelled => stats.cancelled += 1,
            DunningStatus::Exhausted => stats.exhausted += 1,
            _ => {}
        }
    }

    let closed = stats.recovered + stats.cancelled + stats.exhausted;
    if closed > 0 {
        stats.recovery_rate = stats.recovered as f64 / closed as f64;
    }
    if stats.recovered > 0 {
        stats.avg_attempts_to_recovery = recovery_attempts as f64 / stats.recovered as f64;
    }
    stats
}
