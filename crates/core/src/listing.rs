//! Helpers for list views fed by periodic refresh.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::Serialize;

use crate::models::{PrimeRow, TrackedExponent};
use crate::types::Exponent;

/// Rows shown in the block drawer's exponent table.
pub const EXPONENT_ROWS_SHOWN: usize = 200;

/// Direction for sorting the prime list by exponent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

impl SortOrder {
    pub fn toggled(self) -> Self {
        match self {
            Self::Ascending => Self::Descending,
            Self::Descending => Self::Ascending,
        }
    }
}

/// Collapse rows that describe the same prime, keeping the latest finish.
///
/// Rows are keyed by `p`. A missing `finished_at` counts as 0; on a tie the
/// row seen first wins. Output keeps first-appearance order of each `p`.
pub fn dedupe_latest(rows: Vec<PrimeRow>) -> Vec<PrimeRow> {
    let mut index: HashMap<Exponent, usize> = HashMap::with_capacity(rows.len());
    let mut out: Vec<PrimeRow> = Vec::with_capacity(rows.len());

    for row in rows {
        match index.get(&row.p) {
            Some(&slot) => {
                let kept = out[slot].finished_at.unwrap_or(0.0);
                if row.finished_at.unwrap_or(0.0) > kept {
                    out[slot] = row;
                }
            }
            None => {
                index.insert(row.p, out.len());
                out.push(row);
            }
        }
    }
    out
}

/// Sort primes by exponent.
pub fn sort_primes(rows: &mut [PrimeRow], order: SortOrder) {
    match order {
        SortOrder::Ascending => rows.sort_by_key(|r| r.p),
        SortOrder::Descending => rows.sort_by(|a, b| b.p.cmp(&a.p)),
    }
}

/// The first [`EXPONENT_ROWS_SHOWN`] exponents, optionally primes first.
///
/// With `prime_first`, confirmed primes lead, then untested rows, then
/// composites; ties are broken by ascending `p`.
pub fn visible_exponents(rows: &[TrackedExponent], prime_first: bool) -> Vec<TrackedExponent> {
    let mut shown: Vec<TrackedExponent> = rows.iter().take(EXPONENT_ROWS_SHOWN).cloned().collect();
    if prime_first {
        shown.sort_by(|a, b| match prime_rank(b.is_prime).cmp(&prime_rank(a.is_prime)) {
            Ordering::Equal => a.p.cmp(&b.p),
            other => other,
        });
    }
    shown
}

fn prime_rank(is_prime: Option<bool>) -> u8 {
    match is_prime {
        Some(true) => 2,
        None => 1,
        Some(false) => 0,
    }
}
