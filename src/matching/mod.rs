//! Pure matching engine: proposes pairings between bank transactions and
//! accounting entries. The engine does no I/O; it is a function over two
//! candidate slices and a tolerance set, and emits proposals in a
//! deterministic order.

use crate::models::{AccountingEntry, BankTransaction, MappingKind};
use rust_decimal::Decimal;
use serde::Serialize;

/// Confidence reported for a pair satisfying every criterion exactly.
pub const PERFECT_CONFIDENCE: f64 = 1.00;
/// Ceiling applied to fan-out confidence.
pub const HIGH_CONFIDENCE: f64 = 0.95;
/// Minimum confidence at which a fan-out proposal is accepted.
pub const MEDIUM_CONFIDENCE: f64 = 0.80;
/// Minimum confidence at which any proposal is accepted.
pub const LOW_CONFIDENCE: f64 = 0.60;

/// Default absolute date tolerance in days.
pub const DEFAULT_DATE_TOLERANCE_DAYS: i64 = 3;

/// Largest number of accounting entries a single bank transaction may fan
/// out to.
const MAX_FANOUT_ENTRIES: usize = 3;

/// Runtime-tunable matching thresholds.
#[derive(Debug, Clone)]
pub struct MatchTolerances {
    /// Relative amount tolerance, as a fraction of the bank amount.
    pub amount_tolerance_pct: Decimal,
    /// Absolute date tolerance in whole days.
    pub date_tolerance_days: i64,
    /// Minimum confidence for any proposal (the `LOW` threshold).
    pub confidence_floor: f64,
}

impl Default for MatchTolerances {
    fn default() -> Self {
        Self {
            amount_tolerance_pct: Decimal::new(1, 2),
            date_tolerance_days: DEFAULT_DATE_TOLERANCE_DAYS,
            confidence_floor: LOW_CONFIDENCE,
        }
    }
}

/// Criterion that contributed to a proposal's confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchCriterion {
    Amount,
    Date,
    Reference,
}

impl MatchCriterion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Amount => "amount",
            Self::Date => "date",
            Self::Reference => "reference",
        }
    }
}

/// A proposed pairing between one bank transaction and one or more
/// accounting entries.
#[derive(Debug, Clone)]
pub struct MatchProposal {
    pub kind: MappingKind,
    pub confidence: f64,
    pub bank: BankTransaction,
    pub entries: Vec<AccountingEntry>,
    pub amount_difference: Decimal,
    pub criteria: Vec<MatchCriterion>,
}

struct ScoredPair {
    confidence: f64,
    amount_difference: Decimal,
    criteria: Vec<MatchCriterion>,
}

/// Propose matches over the two candidate sets.
///
/// Three passes, each appending to the output in order:
/// 1. greedy perfect one-to-one sweep,
/// 2. one-to-many fan-out sweep over still-unclaimed rows,
/// 3. best tolerant one-to-one for whatever remains.
///
/// A candidate claimed by an earlier pass is invisible to later ones, so no
/// row appears in two proposals.
pub fn propose_matches(
    bank: &[BankTransaction],
    entries: &[AccountingEntry],
    tolerances: &MatchTolerances,
) -> Vec<MatchProposal> {
    let mut proposals = Vec::new();
    let mut used_bank = std::collections::HashSet::new();
    let mut used_entries = std::collections::HashSet::new();

    // Pass 1: first perfect counterpart wins, scanning entries in order.
    for bt in bank {
        for ae in entries {
            if used_entries.contains(&ae.id) {
                continue;
            }
            if let Some(scored) = score_one_to_one(bt, ae, tolerances) {
                if scored.confidence == PERFECT_CONFIDENCE {
                    used_bank.insert(bt.id);
                    used_entries.insert(ae.id);
                    proposals.push(one_to_one_proposal(bt, ae, scored));
                    break;
                }
            }
        }
    }

    // Pass 2: fan a remaining bank transaction out to up to three entries.
    for bt in bank {
        if used_bank.contains(&bt.id) {
            continue;
        }
        if let Some(proposal) = find_one_to_many(bt, entries, &used_entries, tolerances) {
            used_bank.insert(bt.id);
            for ae in &proposal.entries {
                used_entries.insert(ae.id);
            }
            proposals.push(proposal);
        }
    }

    // Pass 3: best tolerant one-to-one; ties broken by lower entry id.
    for bt in bank {
        if used_bank.contains(&bt.id) {
            continue;
        }

        let mut best: Option<(&AccountingEntry, ScoredPair)> = None;
        for ae in entries {
            if used_entries.contains(&ae.id) {
                continue;
            }
            if let Some(scored) = score_one_to_one(bt, ae, tolerances) {
                let better = match &best {
                    None => true,
                    Some((best_ae, best_scored)) => {
                        scored.confidence > best_scored.confidence
                            || (scored.confidence == best_scored.confidence && ae.id < best_ae.id)
                    }
                };
                if better {
                    best = Some((ae, scored));
                }
            }
        }

        if let Some((ae, scored)) = best {
            used_bank.insert(bt.id);
            used_entries.insert(ae.id);
            proposals.push(one_to_one_proposal(bt, ae, scored));
        }
    }

    proposals
}

fn one_to_one_proposal(
    bt: &BankTransaction,
    ae: &AccountingEntry,
    scored: ScoredPair,
) -> MatchProposal {
    MatchProposal {
        kind: MappingKind::OneToOne,
        confidence: scored.confidence,
        bank: bt.clone(),
        entries: vec![ae.clone()],
        amount_difference: scored.amount_difference,
        criteria: scored.criteria,
    }
}

/// Additive confidence for a single pair.
///
/// The amount criterion gates the pair: outside tolerance there is no score
/// at all. An explicit mismatch between two non-empty reference fields
/// resets the confidence to zero, vetoing the pair regardless of how well
/// amount and date agree.
fn score_one_to_one(
    bt: &BankTransaction,
    ae: &AccountingEntry,
    tolerances: &MatchTolerances,
) -> Option<ScoredPair> {
    let mut criteria = Vec::new();
    let mut confidence = 0.0_f64;

    let amount_diff = (bt.amount - ae.amount).abs();
    let amount_tolerance = bt.amount * tolerances.amount_tolerance_pct;

    if amount_diff.is_zero() {
        criteria.push(MatchCriterion::Amount);
        confidence += 0.4;
    } else if amount_diff <= amount_tolerance {
        criteria.push(MatchCriterion::Amount);
        confidence += 0.3;
    } else {
        return None;
    }

    let date_diff = (bt.transaction_date - ae.entry_date).num_days().abs();
    if date_diff == 0 {
        criteria.push(MatchCriterion::Date);
        confidence += 0.3;
    } else if date_diff <= tolerances.date_tolerance_days {
        criteria.push(MatchCriterion::Date);
        confidence += 0.2;
    }

    if let (Some(reference), Some(invoice)) = (bt.reference(), ae.invoice()) {
        if reference == invoice {
            criteria.push(MatchCriterion::Reference);
            confidence += 0.3;
        } else {
            confidence = 0.0;
        }
    }

    if confidence < tolerances.confidence_floor {
        return None;
    }

    Some(ScoredPair {
        confidence,
        amount_difference: amount_diff,
        criteria,
    })
}

/// Search for up to [`MAX_FANOUT_ENTRIES`] unclaimed entries whose amounts
/// sum to within tolerance of the bank amount.
///
/// Fan-out only applies to bank transactions carrying a reference, and only
/// entries whose invoice number contains that reference qualify. A plain
/// amount-and-date pair therefore stays in one-to-one territory instead of
/// being absorbed as a single-entry fan-out at a higher confidence. Among
/// feasible combinations the one with the smallest residual wins, ties
/// preferring fewer entries and then the lexicographically smaller id
/// sequence.
fn find_one_to_many(
    bt: &BankTransaction,
    entries: &[AccountingEntry],
    used_entries: &std::collections::HashSet<i64>,
    tolerances: &MatchTolerances,
) -> Option<MatchProposal> {
    let reference = bt.reference()?;
    let tolerance = bt.amount * tolerances.amount_tolerance_pct;

    let candidates: Vec<&AccountingEntry> = entries
        .iter()
        .filter(|ae| {
            !used_entries.contains(&ae.id)
                && ae.amount <= bt.amount
                && invoice_contains(ae, reference)
        })
        .collect();

    let mut best: Option<(Decimal, Vec<&AccountingEntry>)> = None;
    for size in 1..=MAX_FANOUT_ENTRIES {
        for combo in combinations(&candidates, size) {
            let total: Decimal = combo.iter().map(|ae| ae.amount).sum();
            let diff = (bt.amount - total).abs();
            if diff > tolerance {
                continue;
            }
            let better = match &best {
                None => true,
                Some((best_diff, best_combo)) => {
                    diff < *best_diff
                        || (diff == *best_diff
                            && (combo.len() < best_combo.len()
                                || (combo.len() == best_combo.len()
                                    && ids_of(&combo) < ids_of(best_combo))))
                }
            };
            if better {
                best = Some((diff, combo));
            }
        }
    }

    let (diff, combo) = best?;

    let mut confidence = 0.70_f64;
    if diff.is_zero() {
        confidence += 0.2;
    } else if diff <= tolerance {
        confidence += 0.1;
    }

    let max_date_diff = combo
        .iter()
        .map(|ae| (bt.transaction_date - ae.entry_date).num_days().abs())
        .max()
        .unwrap_or(0);
    let within_date_window = max_date_diff <= tolerances.date_tolerance_days;
    if within_date_window {
        confidence += 0.1;
    }

    let reference_matches = combo
        .iter()
        .filter(|ae| invoice_contains(ae, reference))
        .count();
    if reference_matches > 0 {
        confidence += 0.1 * reference_matches as f64 / combo.len() as f64;
    }

    confidence = confidence.min(HIGH_CONFIDENCE);
    if confidence < MEDIUM_CONFIDENCE {
        return None;
    }

    let mut criteria = vec![MatchCriterion::Amount];
    if within_date_window {
        criteria.push(MatchCriterion::Date);
    }
    if reference_matches > 0 {
        criteria.push(MatchCriterion::Reference);
    }

    Some(MatchProposal {
        kind: MappingKind::OneToMany,
        confidence,
        bank: bt.clone(),
        entries: combo.into_iter().cloned().collect(),
        amount_difference: diff,
        criteria,
    })
}

fn invoice_contains(ae: &AccountingEntry, reference: &str) -> bool {
    ae.invoice().is_some_and(|invoice| invoice.contains(reference))
}

fn ids_of(combo: &[&AccountingEntry]) -> Vec<i64> {
    combo.iter().map(|ae| ae.id).collect()
}

/// All index-ordered combinations of `size` elements.
fn combinations<'a>(
    candidates: &[&'a AccountingEntry],
    size: usize,
) -> Vec<Vec<&'a AccountingEntry>> {
    let mut out = Vec::new();
    if size == 0 || candidates.len() < size {
        return out;
    }
    let mut indices: Vec<usize> = (0..size).collect();
    loop {
        out.push(indices.iter().map(|&i| candidates[i]).collect());

        // Advance to the next combination, rightmost index first.
        let mut pos = size;
        loop {
            if pos == 0 {
                return out;
            }
            pos -= 1;
            if indices[pos] != pos + candidates.len() - size {
                break;
            }
        }
        indices[pos] += 1;
        for i in pos + 1..size {
            indices[i] = indices[i - 1] + 1;
        }
    }
}
