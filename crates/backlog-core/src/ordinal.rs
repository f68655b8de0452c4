//! Sparse ordinals for manual ordering of cards within a status column.
//!
//! Cards with an explicit ordinal display before cards without one, so a drop
//! may have to give ordinals to the cards it lands below to keep them there.

use std::cmp::Ordering;
use std::path::PathBuf;

use serde::Serialize;

use crate::task::{compare_ids, Order};

pub const DEFAULT_STEP: f64 = 1000.0;

/// Smallest floor/ceiling gap still considered usable for a midpoint.
pub const MIN_ORDINAL_GAP: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq)]
pub struct Card {
    pub id: String,
    pub file_path: PathBuf,
    pub order: Order,
}

impl Card {
    pub fn new(id: impl Into<String>, file_path: impl Into<PathBuf>, order: Order) -> Self {
        Self {
            id: id.into(),
            file_path: file_path.into(),
            order,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrdinalUpdate {
    pub task_id: String,
    pub file_path: PathBuf,
    pub new_ordinal: f64,
}

impl OrdinalUpdate {
    fn for_card(card: &Card, new_ordinal: f64) -> Self {
        Self {
            task_id: card.id.clone(),
            file_path: card.file_path.clone(),
            new_ordinal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DropPlan {
    /// Newly ordered cards above the drop point, then the dropped card.
    pub updates: Vec<OrdinalUpdate>,
    /// The neighbours leave no usable room; the column should be rebalanced.
    pub needs_rebalance: bool,
}

/// Computes the ordinal changes for dropping `dropped` at `drop_index` of
/// `existing`, which is the column's visual order without the dragged card.
pub fn plan_drop(existing: &[Card], dropped: &Card, drop_index: usize) -> DropPlan {
    let split = drop_index.min(existing.len());
    let (above, below) = existing.split_at(split);

    let mut next = max_ordinal(existing)
        .map(|max| max + DEFAULT_STEP)
        .unwrap_or(DEFAULT_STEP);
    let mut updates = Vec::new();
    let mut floor = None;
    for card in above {
        match card.order {
            Order::Explicit(value) => floor = Some(value),
            Order::Unordered => {
                updates.push(OrdinalUpdate::for_card(card, next));
                floor = Some(next);
                next += DEFAULT_STEP;
            }
        }
    }

    let ceiling = below.iter().find_map(|card| card.order.value());
    let (ordinal, needs_rebalance) = match (floor, ceiling) {
        (None, None) => (DEFAULT_STEP, false),
        (Some(floor), None) => (floor + DEFAULT_STEP, false),
        (None, Some(ceiling)) => {
            let ordinal = below_ceiling(ceiling);
            (ordinal, ordinal >= ceiling || ceiling - ordinal < MIN_ORDINAL_GAP)
        }
        (Some(floor), Some(ceiling)) if ceiling > floor => {
            let ordinal = floor + (ceiling - floor) / 2.0;
            let exhausted = ceiling - floor < MIN_ORDINAL_GAP
                || ordinal <= floor
                || ordinal >= ceiling;
            (ordinal, exhausted)
        }
        // Neighbours out of order: nothing fits between them.
        (Some(floor), Some(_)) => (floor + DEFAULT_STEP, true),
    };
    updates.push(OrdinalUpdate::for_card(dropped, ordinal));

    DropPlan {
        updates,
        needs_rebalance,
    }
}

fn below_ceiling(ceiling: f64) -> f64 {
    let candidate = ceiling - DEFAULT_STEP;
    if candidate > 0.0 || ceiling <= 0.0 {
        candidate
    } else {
        ceiling / 2.0
    }
}

fn max_ordinal(cards: &[Card]) -> Option<f64> {
    cards
        .iter()
        .filter_map(|card| card.order.value())
        .fold(None, |acc: Option<f64>, value| {
            Some(acc.map_or(value, |max| max.max(value)))
        })
}

/// Re-spaces every card up to the last explicitly ordered one at multiples of
/// the step. Trailing unordered cards keep sorting last and are left alone.
pub fn rebalance(cards: &[Card]) -> Vec<OrdinalUpdate> {
    let Some(last) = cards.iter().rposition(|card| card.order.is_explicit()) else {
        return Vec::new();
    };
    cards[..=last]
        .iter()
        .enumerate()
        .filter_map(|(idx, card)| {
            let target = DEFAULT_STEP * (idx as f64 + 1.0);
            (card.order.value() != Some(target)).then(|| OrdinalUpdate::for_card(card, target))
        })
        .collect()
}

pub fn compare_cards(a: &Card, b: &Card) -> Ordering {
    a.order
        .cmp_position(b.order)
        .then_with(|| compare_ids(&a.id, &b.id))
}

pub fn sort_cards(cards: &mut [Card]) {
    cards.sort_by(compare_cards);
}
