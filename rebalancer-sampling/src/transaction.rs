//! Rebalancing of sample rates across the transaction names of a single project.

use std::cmp::Ordering;

use rebalancer_common::{OrganizationId, ProjectId};
use rebalancer_log::debug;
use serde::{Deserialize, Serialize};

use crate::{RateBounds, solver};

/// Observed volume of a single transaction name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionVolume {
    /// The transaction name.
    pub transaction_name: String,
    /// Number of transactions with this name in the window.
    pub count: u64,
}

impl TransactionVolume {
    /// Creates a new volume entry.
    pub fn new(transaction_name: impl Into<String>, count: u64) -> Self {
        Self {
            transaction_name: transaction_name.into(),
            count,
        }
    }
}

/// All transaction volumes of one project.
///
/// This is the payload of a `process_transaction_biases` job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectTransactions {
    /// The organization owning the project.
    pub org_id: OrganizationId,
    /// The project the transactions were observed in.
    pub project_id: ProjectId,
    /// Volumes per transaction name. Names are unique.
    pub transaction_counts: Vec<TransactionVolume>,
}

/// An explicit sample rate for a transaction name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamedRate {
    /// The transaction name.
    pub transaction_name: String,
    /// The sample rate for all transactions with this name.
    pub sample_rate: f64,
}

fn by_volume(a: &&TransactionVolume, b: &&TransactionVolume) -> Ordering {
    b.count
        .cmp(&a.count)
        .then_with(|| a.transaction_name.cmp(&b.transaction_name))
}

/// Computes explicit rates for the most and least frequent transaction names of a project.
///
/// Every transaction name is given the same expected number of sampled events, subject to
/// `bounds`, such that the project as a whole is sampled at `rate`. Up to
/// `max_explicit_transactions` names receive an explicit rate: half of them from the highest
/// volumes and half from the lowest. All other names share the returned default rate, which is
/// chosen so that the total budget of `total count × rate` is kept.
///
/// If there is no transaction left for the default rate, the default is `rate`. A `rate` outside
/// of `[0, 1]` is clamped into that range first.
pub fn adjust_sample_rate(
    transactions: &[TransactionVolume],
    rate: f64,
    max_explicit_transactions: usize,
    bounds: RateBounds,
) -> (Vec<NamedRate>, f64) {
    let rate = rate.clamp(0.0, 1.0);
    let total: u64 = transactions.iter().map(|t| t.count).sum();
    if transactions.is_empty() || total == 0 {
        return (Vec::new(), rate);
    }

    let mut ranked: Vec<&TransactionVolume> = transactions.iter().collect();
    ranked.sort_by(by_volume);

    let volumes: Vec<f64> = ranked.iter().map(|t| t.count as f64).collect();
    let budget = total as f64 * rate;
    let solution = solver::solve(&volumes, budget, bounds);

    // With more names than explicit slots, the head gets the extra slot of an odd cap.
    let explicit = ranked.len().min(max_explicit_transactions);
    let tail = explicit / 2;
    let head = explicit - tail;
    let middle = head..ranked.len() - tail;

    let mut named_rates = Vec::with_capacity(explicit);
    let mut explicit_budget = 0.0;
    for (index, transaction) in ranked.iter().enumerate() {
        if middle.contains(&index) {
            continue;
        }

        let sample_rate = solution.rate(volumes[index]);
        explicit_budget += sample_rate * volumes[index];
        named_rates.push(NamedRate {
            transaction_name: transaction.transaction_name.clone(),
            sample_rate,
        });
    }

    let remaining: f64 = volumes[middle].iter().sum();
    let default_rate = if remaining > 0.0 {
        bounds.clamp((budget - explicit_budget) / remaining)
    } else {
        rate
    };

    debug!(
        transactions = ranked.len(),
        explicit = named_rates.len(),
        iterations = solution.iterations,
        default_rate,
        "adjusted transaction sample rates"
    );

    (named_rates, default_rate)
}
