use regex::Regex;
use std::sync::OnceLock;

use crate::models::{Listing, PricePolicy, PriceTarget, Search, TraceCode};

/// Marker for negotiable prices ("Verhandlungsbasis").
pub const NEGOTIABLE_MARKER: &str = "VB";

const TARGET_LOW_FACTOR: f64 = 0.7;
const RANGE_HIGH_FACTOR: f64 = 1.2;
const RANGE_MAX_OVERSHOOT: i64 = 20;
const RANGE_LOW_FACTOR: f64 = 0.7;
const NEAR_TARGET_OVERSHOOT: i64 = 10;
const BAR_SLOTS: usize = 11;

#[derive(Debug, Clone, Copy)]
pub struct PriceSettings {
    /// Fraction of the target kept as profit, e.g. 0.2.
    pub target_benefit: f64,
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceCategory {
    // TARGET mode
    Offer,
    Deal,
    Bargain,
    NearTarget,
    // RANGE mode
    Negligible,
    InRange,
    AboveRange,
    BelowRange,
    Miss,
}

impl PriceCategory {
    pub fn trace_code(&self) -> Option<TraceCode> {
        match self {
            PriceCategory::Offer => Some(TraceCode::Offer),
            PriceCategory::Deal | PriceCategory::InRange => Some(TraceCode::InTarget),
            PriceCategory::Bargain => Some(TraceCode::Bargain),
            PriceCategory::NearTarget => Some(TraceCode::NearTarget),
            PriceCategory::Negligible => Some(TraceCode::Negligible),
            PriceCategory::AboveRange => Some(TraceCode::AboveRange),
            PriceCategory::BelowRange => Some(TraceCode::BelowRange),
            PriceCategory::Miss => None,
        }
    }

    fn worth_messaging(&self, verbose: bool) -> bool {
        match self {
            PriceCategory::Deal | PriceCategory::Negligible | PriceCategory::InRange => true,
            PriceCategory::Offer
            | PriceCategory::Bargain
            | PriceCategory::AboveRange
            | PriceCategory::BelowRange => verbose,
            PriceCategory::NearTarget | PriceCategory::Miss => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceVerdict {
    pub numeric_price: i64,
    pub category: PriceCategory,
    pub worth_messaging: bool,
    pub price_hint: Option<String>,
    pub price_range_display: String,
}

impl PriceVerdict {
    /// Copies the display annotations onto the listing.
    pub fn annotate(&self, listing: &mut Listing) {
        listing.price_hint = self.price_hint.clone();
        listing.price_range_display = Some(self.price_range_display.clone())
            .filter(|display| !display.is_empty());
    }
}

/// First run of digits after dropping thousand-separator periods, 0 if none.
/// A run too long for `i64` saturates.
pub fn extract_price(raw_price: &str) -> i64 {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\d+").expect("Invalid regex"));

    let cleaned = raw_price.replace('.', "");
    match re.find(&cleaned) {
        Some(m) => m.as_str().parse::<i64>().unwrap_or(i64::MAX),
        None => 0,
    }
}

fn round_half_even(value: f64) -> i64 {
    value.round_ties_even() as i64
}

pub fn calc_benefit(target: i64, target_benefit: f64) -> i64 {
    let target = target as f64;
    round_half_even(target - target * target_benefit)
}

/// Upper bound for negotiable prices above a range: +20%, but at most +20.
pub fn range_price_max(high: i64) -> i64 {
    let price_max = round_half_even(high as f64 * RANGE_HIGH_FACTOR);
    if price_max - high > RANGE_MAX_OVERSHOOT {
        high + RANGE_MAX_OVERSHOOT
    } else {
        price_max
    }
}

/// 11-slot position bar, all dots when the price is outside `low..=high`.
pub fn range_bar(price: i64, low: i64, high: i64) -> String {
    if price < low || price > high {
        return ".".repeat(BAR_SLOTS);
    }
    let span = high - low;
    let position = if span == 0 {
        0
    } else {
        round_half_even((price - low) as f64 * 10.0 / span as f64).clamp(0, 10) as usize
    };
    (0..BAR_SLOTS)
        .map(|slot| if slot == position { 'X' } else { '.' })
        .collect()
}

pub fn evaluate(listing: &Listing, search: &Search, settings: &PriceSettings) -> PriceVerdict {
    let numeric_price = extract_price(&listing.raw_price);
    let negotiable = listing.raw_price.contains(NEGOTIABLE_MARKER);

    match &search.policy {
        PricePolicy::Target { target, price_info } => evaluate_target(
            numeric_price,
            negotiable,
            *target,
            price_info,
            &search.search_string,
            settings,
        ),
        PricePolicy::Range { low, high } => {
            evaluate_range(numeric_price, negotiable, *low, *high, settings)
        }
    }
}

fn evaluate_target(
    price: i64,
    negotiable: bool,
    target: i64,
    price_info: &[PriceTarget],
    search_string: &str,
    settings: &PriceSettings,
) -> PriceVerdict {
    let low_bound = target as f64 * TARGET_LOW_FACTOR;
    let benefit = calc_benefit(target, settings.target_benefit);

    let category = if price <= 1 {
        PriceCategory::Offer
    } else if low_bound <= price as f64 && price <= benefit {
        PriceCategory::Deal
    } else if benefit < price && price <= target && negotiable {
        PriceCategory::Bargain
    } else if target < price && price <= target + NEAR_TARGET_OVERSHOOT && negotiable {
        PriceCategory::NearTarget
    } else {
        PriceCategory::Miss
    };

    let label = match category {
        PriceCategory::Offer => "[Offer]\n",
        PriceCategory::Deal => "[DEAL]\n",
        PriceCategory::Bargain => "[Maybe]\n",
        PriceCategory::NearTarget => "[Nah]\n",
        _ => "",
    };
    let price_hint = format!("{}[{}]", label, search_string);

    let breakdown = if price_info.is_empty() {
        format!(
            "T0: {}€ ({}€)\nWIN: {}€ ({}€)",
            target,
            target - price,
            benefit,
            benefit - price
        )
    } else {
        price_info
            .iter()
            .map(|info| {
                let win = calc_benefit(info.target, settings.target_benefit);
                format!(
                    "T0 {}: {}€ ({}€) WIN: {}€ ({}€)",
                    info.label,
                    info.target,
                    info.target - price,
                    win,
                    win - price
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    PriceVerdict {
        numeric_price: price,
        category,
        worth_messaging: category.worth_messaging(settings.verbose),
        price_hint: Some(price_hint),
        price_range_display: breakdown,
    }
}

fn evaluate_range(
    price: i64,
    negotiable: bool,
    low: i64,
    high: i64,
    settings: &PriceSettings,
) -> PriceVerdict {
    let price_max = range_price_max(high);

    let category = if price <= 1 {
        PriceCategory::Negligible
    } else if low <= price && price <= high {
        PriceCategory::InRange
    } else if high < price && price <= price_max && negotiable {
        PriceCategory::AboveRange
    } else if low as f64 * RANGE_LOW_FACTOR <= price as f64 && price < low {
        PriceCategory::BelowRange
    } else {
        PriceCategory::Miss
    };

    let price_hint = match category {
        PriceCategory::AboveRange => Some("(+20%)".to_string()),
        PriceCategory::BelowRange => Some("(-30%)".to_string()),
        _ => None,
    };

    PriceVerdict {
        numeric_price: price,
        category,
        worth_messaging: category.worth_messaging(settings.verbose),
        price_hint,
        price_range_display: format!("{}€ [{}] {}€", low, range_bar(price, low, high), high),
    }
}
