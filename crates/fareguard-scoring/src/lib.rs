//! Pure, synchronous scoring stages: enrichment, batch statistics, the
//! two-pass scoring engine, the insight generator and fare-variant
//! grouping. Every function here takes values in and returns new values
//! out; nothing mutates state between stages.

use std::collections::HashMap;

use chrono::{DateTime, Timelike, Utc};
use fareguard_core::{
    AirlineTable, AirlineTier, Badge, CanonicalOffer, ComponentScores, ConsultantTier, Decision,
    FlightIdentity, OfferVerdict, StressLevel, StressMap,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Product policy constants. These values encode deliberate commercial
/// heuristics; tune them here and nowhere else.
pub mod policy {
    /// Hidden cost added when no checked baggage is included.
    pub const NO_BAG_COST: f64 = 80.0;
    /// Hidden cost added when no meal service is included.
    pub const NO_MEAL_COST: f64 = 20.0;
    /// Hidden cost added for self-transfer itineraries (separate tickets,
    /// re-check risk, no missed-connection protection).
    pub const SELF_TRANSFER_COST: f64 = 150.0;
    /// Baggage allowance assumed when a full-service fare omits the figure.
    pub const ASSUMED_BAG_KG: f64 = 23.0;

    /// Share of the sorted price list skipped before picking the
    /// reference price, so one mis-priced outlier cannot skew every
    /// relative-price signal.
    pub const OUTLIER_SHARE: f64 = 0.10;

    /// Tier price divisors: premium carriers earn price tolerance.
    pub const TIER1_PRICE_DIVISOR: f64 = 1.50;
    pub const TIER2_PRICE_DIVISOR: f64 = 1.25;

    /// Raw-score component weights.
    pub const PRICE_WEIGHT: f64 = 0.50;
    pub const COMFORT_WEIGHT: f64 = 0.35;
    pub const TIME_WEIGHT: f64 = 0.15;
    pub const RISK_WEIGHT: f64 = 0.50;

    pub const COMFORT_BASE: f64 = 50.0;
    pub const COMFORT_TIER1: f64 = 30.0;
    pub const COMFORT_TIER2: f64 = 10.0;
    pub const COMFORT_LCC: f64 = -20.0;
    pub const COMFORT_FULL_BAG: f64 = 10.0;
    pub const COMFORT_NO_BAG: f64 = -20.0;

    /// Excess over the fastest duration beyond which a flat penalty lands.
    pub const LONG_EXCESS_MIN: i64 = 480;
    pub const LONG_EXCESS_FLAT: f64 = 20.0;

    pub const RISK_SELF_TRANSFER: f64 = 25.0;
    pub const RISK_MULTI_STOP: f64 = 15.0;
    pub const RISK_LCC_LONG_HAUL: f64 = 15.0;
    pub const RISK_INVALID_DATA: f64 = 10.0;
    /// Minutes past which an LCC itinerary counts as long-haul.
    pub const LCC_LONG_HAUL_MIN: i64 = 600;

    /// Curve targets: the batch leader maps near the ceiling when the raw
    /// spread is healthy, to a softer cap otherwise.
    pub const CURVE_TARGET: f64 = 9.8;
    pub const CURVE_RAW_THRESHOLD: f64 = 50.0;
    pub const SOFT_CURVE_TARGET: f64 = 7.5;

    /// Multiplicative hard penalties, first match only.
    pub const PENALTY_SELF_TRANSFER: f64 = 0.70;
    pub const PENALTY_MIXED_LCC: f64 = 0.85;
    pub const PENALTY_MULTI_STOP_SLOW: f64 = 0.75;
    pub const PENALTY_LCC_LONG: f64 = 0.75;
    /// Duration ratio (vs the fastest) above which a multi-stop itinerary
    /// counts as slow.
    pub const SLOW_RATIO: f64 = 1.5;
    /// Minutes past which a single LCC-operated segment inside a
    /// mixed-service itinerary draws the mixed-LCC penalty.
    pub const MIXED_LCC_SEGMENT_MIN: i64 = 360;

    pub const SCORE_FLOOR: f64 = 1.0;
    pub const SCORE_CEILING: f64 = 10.0;

    pub const BEST_PICK_MIN: f64 = 9.0;
    pub const HIDDEN_GEM_MIN: f64 = 7.8;
    pub const ACCEPTABLE_MIN: f64 = 6.0;
    pub const STANDARD_MIN: f64 = 5.0;
    /// A self-transfer fare within this multiple of the reference price is
    /// a deliberate bargain, not junk.
    pub const HACKER_FARE_BAND: f64 = 1.10;
    /// Price ratio past which a self-transfer fare with no bargain upside
    /// is a hard avoid.
    pub const SELF_TRANSFER_PRICE_AVOID: f64 = 1.50;

    pub const REGRET_SELF_TRANSFER: f64 = 50.0;
    pub const REGRET_MULTI_STOP: f64 = 20.0;
    pub const REGRET_SLOW: f64 = 15.0;
    pub const REGRET_NO_BAG: f64 = 15.0;
    pub const REGRET_CAP: f64 = 100.0;

    /// Score floor for the "Best Deal" insight badge.
    pub const BEST_DEAL_MIN: f64 = 8.5;
}

/// Per-search aggregates the scoring passes rank against. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchStats {
    pub min_price: f64,
    pub max_price: f64,
    /// Minutes.
    pub min_duration: i64,
    /// Minutes.
    pub max_duration: i64,
    /// 10th-percentile price: the single basis for every relative-price
    /// signal (price component, hacker-fare band, insight bands).
    pub reference_price: f64,
    pub median_price: f64,
    /// Highest Pass 1 raw score in the batch; written by `score_batch`.
    pub max_raw_score: f64,
}

/// Result of running the scoring stages over one merged batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredBatch {
    pub offers: Vec<CanonicalOffer>,
    pub stats: Option<BatchStats>,
}

// ---------------------------------------------------------------------------
// Enricher

/// Fills in what the fare quietly omits: an assumed baggage allowance for
/// full-service carriers and an effective price carrying the hidden costs
/// of bare fares. Pure; returns a new offer.
pub fn enrich(mut offer: CanonicalOffer, airlines: &AirlineTable) -> CanonicalOffer {
    let profile = airlines.lookup(&offer.carrier);

    if offer.baggage_weight == 0.0
        && (profile.has_free_bag || profile.tier == AirlineTier::Tier1)
        && !offer.is_self_transfer
    {
        offer.baggage_weight = policy::ASSUMED_BAG_KG;
        offer.baggage_quantity = offer.baggage_quantity.max(1);
    }

    if !offer.has_meal && profile.has_meals {
        offer.has_meal = true;
    }
    if !offer.has_entertainment && profile.has_entertainment {
        offer.has_entertainment = true;
    }

    let mut hidden = 0.0;
    if offer.baggage_weight == 0.0 {
        hidden += policy::NO_BAG_COST;
    }
    if !offer.has_meal {
        hidden += policy::NO_MEAL_COST;
    }
    if offer.is_self_transfer {
        hidden += policy::SELF_TRANSFER_COST;
    }
    offer.effective_price = Some(offer.price + hidden);
    offer
}

pub fn enrich_all(offers: Vec<CanonicalOffer>, airlines: &AirlineTable) -> Vec<CanonicalOffer> {
    offers.into_iter().map(|o| enrich(o, airlines)).collect()
}

// ---------------------------------------------------------------------------
// Batch statistics

/// Aggregates one batch. `None` when the batch is empty or no strictly
/// positive prices and durations remain to rank against.
pub fn compute_stats(offers: &[CanonicalOffer]) -> Option<BatchStats> {
    let mut prices: Vec<f64> = offers
        .iter()
        .map(CanonicalOffer::scoring_price)
        .filter(|p| *p > 0.0)
        .collect();
    let durations: Vec<i64> = offers
        .iter()
        .map(|o| o.duration)
        .filter(|d| *d > 0)
        .collect();
    if prices.is_empty() || durations.is_empty() {
        return None;
    }

    prices.sort_by(f64::total_cmp);
    let reference_idx = ((prices.len() as f64) * policy::OUTLIER_SHARE).floor() as usize;
    let reference_price = prices[reference_idx.min(prices.len() - 1)];
    let median_price = prices[prices.len() / 2];

    Some(BatchStats {
        min_price: prices[0],
        max_price: prices[prices.len() - 1],
        min_duration: durations.iter().copied().min().unwrap_or(0),
        max_duration: durations.iter().copied().max().unwrap_or(0),
        reference_price,
        median_price,
        max_raw_score: 0.0,
    })
}

// ---------------------------------------------------------------------------
// Scoring engine

struct RawScore {
    raw: f64,
    components: ComponentScores,
}

fn tier_divisor(tier: AirlineTier) -> f64 {
    match tier {
        AirlineTier::Tier1 => policy::TIER1_PRICE_DIVISOR,
        AirlineTier::Tier2 => policy::TIER2_PRICE_DIVISOR,
        AirlineTier::Lcc => 1.0,
    }
}

fn price_component(offer: &CanonicalOffer, stats: &BatchStats, tier: AirlineTier) -> f64 {
    let adjusted = offer.scoring_price() / tier_divisor(tier);
    let ratio = adjusted / stats.reference_price;
    if ratio <= 1.0 {
        100.0
    } else {
        (100.0 - (ratio - 1.0) * 100.0).max(0.0)
    }
}

fn comfort_component(offer: &CanonicalOffer, tier: AirlineTier) -> f64 {
    let mut comfort = policy::COMFORT_BASE;
    comfort += match tier {
        AirlineTier::Tier1 => policy::COMFORT_TIER1,
        AirlineTier::Tier2 => policy::COMFORT_TIER2,
        AirlineTier::Lcc => policy::COMFORT_LCC,
    };
    if offer.baggage_weight >= policy::ASSUMED_BAG_KG {
        comfort += policy::COMFORT_FULL_BAG;
    } else if offer.baggage_weight == 0.0 {
        comfort += policy::COMFORT_NO_BAG;
    }
    comfort
}

fn time_penalty(offer: &CanonicalOffer, stats: &BatchStats) -> f64 {
    if stats.min_duration <= 0 {
        return 0.0;
    }
    let excess = (offer.duration - stats.min_duration).max(0);
    let mut penalty = 100.0 * excess as f64 / stats.min_duration as f64;
    if excess > policy::LONG_EXCESS_MIN {
        penalty += policy::LONG_EXCESS_FLAT;
    }
    penalty
}

fn risk_penalty(offer: &CanonicalOffer, tier: AirlineTier) -> f64 {
    let mut risk = 0.0;
    if offer.is_self_transfer {
        risk += policy::RISK_SELF_TRANSFER;
    }
    if offer.stops > 1 {
        risk += policy::RISK_MULTI_STOP;
    }
    if tier == AirlineTier::Lcc && offer.duration > policy::LCC_LONG_HAUL_MIN {
        risk += policy::RISK_LCC_LONG_HAUL;
    }
    if offer.has_invalid_data() {
        risk += policy::RISK_INVALID_DATA;
    }
    risk
}

fn regret_component(offer: &CanonicalOffer, stats: &BatchStats) -> f64 {
    let mut regret = 0.0;
    if offer.is_self_transfer {
        regret += policy::REGRET_SELF_TRANSFER;
    }
    if offer.stops > 1 {
        regret += policy::REGRET_MULTI_STOP;
    }
    if duration_ratio(offer, stats) > policy::SLOW_RATIO {
        regret += policy::REGRET_SLOW;
    }
    if offer.baggage_weight == 0.0 {
        regret += policy::REGRET_NO_BAG;
    }
    regret.min(policy::REGRET_CAP)
}

fn duration_ratio(offer: &CanonicalOffer, stats: &BatchStats) -> f64 {
    if stats.min_duration <= 0 {
        return 1.0;
    }
    offer.duration as f64 / stats.min_duration as f64
}

fn raw_score(offer: &CanonicalOffer, stats: &BatchStats, airlines: &AirlineTable) -> RawScore {
    let tier = airlines.lookup(&offer.carrier).tier;
    let price = price_component(offer, stats, tier);
    let comfort = comfort_component(offer, tier);
    let time = time_penalty(offer, stats);
    let risk = risk_penalty(offer, tier);

    let raw = policy::PRICE_WEIGHT * price + policy::COMFORT_WEIGHT * comfort
        - policy::TIME_WEIGHT * time
        - policy::RISK_WEIGHT * risk;

    RawScore {
        raw,
        components: ComponentScores {
            price: price.clamp(0.0, 100.0),
            time: (100.0 - time).clamp(0.0, 100.0),
            comfort: comfort.clamp(0.0, 100.0),
            regret: regret_component(offer, stats),
        },
    }
}

/// Curves a raw score against the batch leader so the top of each batch
/// lands near the ceiling regardless of absolute raw values.
fn curve(raw: f64, max_raw: f64) -> f64 {
    if max_raw > policy::CURVE_RAW_THRESHOLD {
        raw * policy::CURVE_TARGET / max_raw
    } else if max_raw > 0.0 {
        raw / max_raw * policy::SOFT_CURVE_TARGET
    } else {
        policy::SCORE_FLOOR
    }
}

fn is_pure_lcc(offer: &CanonicalOffer, airlines: &AirlineTable) -> bool {
    if offer.segments.is_empty() {
        return airlines.lookup(&offer.carrier).tier == AirlineTier::Lcc;
    }
    offer
        .segments
        .iter()
        .all(|s| airlines.lookup(&s.carrier).tier == AirlineTier::Lcc)
}

fn has_long_lcc_segment(offer: &CanonicalOffer, airlines: &AirlineTable) -> bool {
    offer.segments.iter().any(|s| {
        airlines.lookup(&s.carrier).tier == AirlineTier::Lcc
            && s.duration > policy::MIXED_LCC_SEGMENT_MIN
    })
}

/// Multiplicative hard penalty for structurally risky itineraries. First
/// match wins; the priority order is part of the product contract.
fn hard_penalty(offer: &CanonicalOffer, stats: &BatchStats, airlines: &AirlineTable) -> f64 {
    let pure_lcc = is_pure_lcc(offer, airlines);
    if offer.is_self_transfer {
        policy::PENALTY_SELF_TRANSFER
    } else if !pure_lcc && has_long_lcc_segment(offer, airlines) {
        policy::PENALTY_MIXED_LCC
    } else if offer.stops > 1 && duration_ratio(offer, stats) > policy::SLOW_RATIO {
        policy::PENALTY_MULTI_STOP_SLOW
    } else if pure_lcc && offer.duration > policy::LCC_LONG_HAUL_MIN {
        policy::PENALTY_LCC_LONG
    } else {
        1.0
    }
}

fn badge_for(score: f64, offer: &CanonicalOffer, stats: &BatchStats) -> (Badge, Decision) {
    let hacker_fare =
        offer.is_self_transfer && offer.price <= stats.reference_price * policy::HACKER_FARE_BAND;
    if score >= policy::BEST_PICK_MIN {
        (Badge::BestPick, Decision::Recommended)
    } else if score >= policy::HIDDEN_GEM_MIN {
        (Badge::HiddenGem, Decision::Recommended)
    } else if score >= policy::ACCEPTABLE_MIN {
        (Badge::Acceptable, Decision::Consider)
    } else if hacker_fare {
        (Badge::HackerFare, Decision::Consider)
    } else if score >= policy::STANDARD_MIN {
        (Badge::Standard, Decision::Consider)
    } else {
        (Badge::Avoid, Decision::Avoid)
    }
}

fn identity_for(offer: &CanonicalOffer, stats: &BatchStats, airlines: &AirlineTable) -> FlightIdentity {
    let tier = airlines.lookup(&offer.carrier).tier;
    let price_ratio = offer.scoring_price() / stats.reference_price;
    let total_layover: i64 = offer.layovers.iter().map(|l| l.duration).sum();
    let score = offer.score.unwrap_or(0.0);
    let regret = offer.scores.map(|s| s.regret).unwrap_or(0.0);

    if offer.is_self_transfer && offer.price <= stats.reference_price * policy::HACKER_FARE_BAND {
        FlightIdentity {
            label: "Risk Taker".to_string(),
            emoji: "\u{1F3B2}".to_string(),
            color: "amber".to_string(),
            description: "A genuine bargain for travelers who pack light and read the fine print."
                .to_string(),
        }
    } else if offer.stops > 1 || total_layover > 600 {
        FlightIdentity {
            label: "Layover Martyr".to_string(),
            emoji: "\u{1F9F3}".to_string(),
            color: "rose".to_string(),
            description: "Long hours on the ground; bring patience and a power bank.".to_string(),
        }
    } else if score >= 8.0 && regret < 20.0 {
        FlightIdentity {
            label: "Smooth Traveler".to_string(),
            emoji: "\u{1F9D8}".to_string(),
            color: "emerald".to_string(),
            description: "Strong all-round pick with little to second-guess.".to_string(),
        }
    } else if tier == AirlineTier::Tier1 && price_ratio > 1.2 {
        FlightIdentity {
            label: "Comfort Seeker".to_string(),
            emoji: "\u{1F6CB}".to_string(),
            color: "sky".to_string(),
            description: "Pays a premium for a premium cabin experience.".to_string(),
        }
    } else {
        FlightIdentity {
            label: "Pragmatic Planner".to_string(),
            emoji: "\u{1F9ED}".to_string(),
            color: "slate".to_string(),
            description: "A sensible middle-of-the-batch choice.".to_string(),
        }
    }
}

fn stress_for(offer: &CanonicalOffer, stats: &BatchStats) -> StressMap {
    let check_in = if offer.is_self_transfer {
        StressLevel::High
    } else if offer.stops > 1 {
        StressLevel::Medium
    } else {
        StressLevel::Low
    };

    let min_layover = offer.layovers.iter().map(|l| l.duration).min();
    let total_layover: i64 = offer.layovers.iter().map(|l| l.duration).sum();
    let transfer = match min_layover {
        Some(m) if m < 45 => StressLevel::Critical,
        Some(m) if m < 60 => StressLevel::High,
        Some(_) if total_layover > 360 => StressLevel::Medium,
        _ => StressLevel::Low,
    };

    let baggage = if offer.baggage_weight == 0.0 {
        StressLevel::High
    } else if offer.baggage_weight < policy::ASSUMED_BAG_KG {
        StressLevel::Medium
    } else {
        StressLevel::Low
    };

    let ratio = duration_ratio(offer, stats);
    let timeline = if offer.duration > 2100 {
        StressLevel::Critical
    } else if ratio > 2.0 {
        StressLevel::High
    } else if ratio > policy::SLOW_RATIO {
        StressLevel::Medium
    } else {
        StressLevel::Low
    };

    StressMap {
        check_in,
        transfer,
        baggage,
        timeline,
    }
}

/// Runs both scoring passes over an enriched batch and returns offers
/// sorted by score descending. A batch with no usable statistics comes
/// back unscored rather than erroring; the caller reports it as partial.
pub fn score_batch(mut offers: Vec<CanonicalOffer>, airlines: &AirlineTable) -> ScoredBatch {
    if offers.is_empty() {
        return ScoredBatch {
            offers,
            stats: None,
        };
    }
    let Some(mut stats) = compute_stats(&offers) else {
        warn!(count = offers.len(), "batch has no usable prices or durations, returning unscored");
        return ScoredBatch {
            offers,
            stats: None,
        };
    };

    let raws: Vec<RawScore> = offers
        .iter()
        .map(|o| raw_score(o, &stats, airlines))
        .collect();
    stats.max_raw_score = raws.iter().map(|r| r.raw).fold(f64::MIN, f64::max);

    for (offer, raw) in offers.iter_mut().zip(raws) {
        let curved = curve(raw.raw, stats.max_raw_score);
        let penalized = curved * hard_penalty(offer, &stats, airlines);
        let score = (penalized.clamp(policy::SCORE_FLOOR, policy::SCORE_CEILING) * 10.0).round()
            / 10.0;
        let (badge, _) = badge_for(score, offer, &stats);

        offer.score = Some(score);
        offer.scores = Some(raw.components);
        offer.badge = Some(badge);
        offer.identity = Some(identity_for(offer, &stats, airlines));
        offer.stress = Some(stress_for(offer, &stats));
    }

    offers.sort_by(|a, b| {
        b.score
            .unwrap_or(0.0)
            .total_cmp(&a.score.unwrap_or(0.0))
            .then_with(|| a.scoring_price().total_cmp(&b.scoring_price()))
    });

    ScoredBatch {
        offers,
        stats: Some(stats),
    }
}

// ---------------------------------------------------------------------------
// Insight / consultant generator

fn fmt_duration(minutes: i64) -> String {
    let h = minutes / 60;
    let m = minutes % 60;
    if h == 0 {
        format!("{m}m")
    } else if m == 0 {
        format!("{h}h")
    } else {
        format!("{h}h {m}m")
    }
}

fn daypart(time: DateTime<Utc>) -> &'static str {
    match time.hour() {
        0..=5 => "small hours",
        6..=11 => "morning",
        12..=17 => "afternoon",
        _ => "evening",
    }
}

fn pros_for(
    offer: &CanonicalOffer,
    stats: &BatchStats,
    fastest_duration: i64,
) -> Vec<String> {
    let mut pros = Vec::new();
    let ratio = offer.scoring_price() / stats.reference_price;
    if ratio <= 1.0 {
        pros.push("Priced at or below the market reference".to_string());
    } else if ratio <= 1.10 {
        pros.push("Within 10% of the market reference".to_string());
    } else if ratio <= 1.20 {
        pros.push("Reasonably priced for this route".to_string());
    }

    let slower_by = offer.duration - fastest_duration;
    if slower_by <= 0 {
        pros.push("Fastest option found".to_string());
    } else if slower_by <= 60 {
        pros.push("Within an hour of the fastest option".to_string());
    } else if slower_by <= 180 {
        pros.push("Competitive total travel time".to_string());
    }

    if offer.stops == 0 {
        pros.push("Non-stop".to_string());
    } else if offer.stops == 1 {
        let comfortable = offer
            .layovers
            .first()
            .map(|l| (90..=240).contains(&l.duration))
            .unwrap_or(false);
        if comfortable {
            pros.push("Single stop with a comfortable connection".to_string());
        } else {
            pros.push("Only one stop".to_string());
        }
    }

    if offer.baggage_weight >= policy::ASSUMED_BAG_KG {
        pros.push(format!(
            "{} kg checked baggage included",
            offer.baggage_weight as i64
        ));
    }
    if offer.has_meal {
        pros.push("Meal service included".to_string());
    }
    if offer.refundable {
        pros.push("Refundable fare".to_string());
    }
    pros
}

fn cons_for(
    offer: &CanonicalOffer,
    stats: &BatchStats,
    fastest_duration: i64,
) -> Vec<String> {
    let mut cons = Vec::new();
    let ratio = offer.scoring_price() / stats.reference_price;
    if ratio > 1.8 {
        cons.push("Priced far above the market reference".to_string());
    } else if ratio > 1.5 {
        cons.push("Significantly more expensive than comparable fares".to_string());
    } else if ratio > 1.3 {
        cons.push("Noticeably more expensive than comparable fares".to_string());
    }

    let slower_by = offer.duration - fastest_duration;
    if slower_by > 600 {
        cons.push(format!(
            "{} slower than the fastest option",
            fmt_duration(slower_by)
        ));
    } else if slower_by > 360 {
        cons.push("Over 6 hours slower than the fastest option".to_string());
    }

    if offer.stops > 1 {
        cons.push(format!("{} stops", offer.stops));
    }
    if offer.layovers.iter().any(|l| l.duration < 75) {
        cons.push("Tight connection under 75 minutes".to_string());
    }
    let total_layover: i64 = offer.layovers.iter().map(|l| l.duration).sum();
    if total_layover > 480 {
        cons.push(format!("{} total layover time", fmt_duration(total_layover)));
    }
    if offer.baggage_weight == 0.0 {
        cons.push("No checked baggage included".to_string());
    }
    if offer.duration > 2100 {
        cons.push("Journey exceeds 35 hours".to_string());
    }
    cons
}

fn tradeoff_for(
    offer: &CanonicalOffer,
    cheapest: &CanonicalOffer,
    fastest: &CanonicalOffer,
) -> String {
    let is_cheapest = offer.id == cheapest.id;
    let is_fastest = offer.id == fastest.id;
    if is_cheapest && is_fastest {
        return "Cheapest and fastest in this batch; nothing to weigh.".to_string();
    }
    if is_cheapest {
        let saved = fastest.scoring_price() - offer.scoring_price();
        let slower = offer.duration - fastest.duration;
        return format!(
            "Cheapest option: saves {:.0} {} over the fastest at the cost of {} extra travel time.",
            saved.max(0.0),
            offer.currency,
            fmt_duration(slower.max(0))
        );
    }
    if is_fastest {
        let extra = offer.scoring_price() - cheapest.scoring_price();
        let saved = cheapest.duration - offer.duration;
        return format!(
            "Fastest option: pay {:.0} {} more than the cheapest to save {} of travel time.",
            extra.max(0.0),
            offer.currency,
            fmt_duration(saved.max(0))
        );
    }
    let extra = offer.scoring_price() - cheapest.scoring_price();
    let slower = offer.duration - fastest.duration;
    format!(
        "Middle ground: {:.0} {} above the cheapest and {} slower than the fastest.",
        extra.max(0.0),
        offer.currency,
        fmt_duration(slower.max(0))
    )
}

fn consultant_tier(
    offer: &CanonicalOffer,
    stats: &BatchStats,
    fastest_duration: i64,
) -> ConsultantTier {
    let price_ratio = offer.scoring_price() / stats.reference_price;
    let slower_by = offer.duration - fastest_duration;
    let score = offer.score.unwrap_or(0.0);

    if offer.is_self_transfer {
        // A bargain hacker fare is a conditional buy, never a hard avoid.
        if offer.price <= stats.reference_price * policy::HACKER_FARE_BAND {
            return ConsultantTier::Conditional;
        }
        if price_ratio > policy::SELF_TRANSFER_PRICE_AVOID {
            return ConsultantTier::Avoid;
        }
        return ConsultantTier::Conditional;
    }

    if score >= policy::BEST_DEAL_MIN && price_ratio <= 1.15 && slower_by <= 180 && offer.stops <= 1
    {
        return ConsultantTier::StrongYes;
    }
    if slower_by <= 60 && price_ratio <= 1.15 && offer.stops <= 1 {
        return ConsultantTier::StrongYes;
    }
    if price_ratio <= 1.05 && offer.stops <= 1 && slower_by <= 360 {
        return ConsultantTier::StrongYes;
    }
    if price_ratio > 1.5 && slower_by > 60 {
        return ConsultantTier::Avoid;
    }
    if offer.stops > 1 && slower_by > 600 {
        return ConsultantTier::Avoid;
    }
    ConsultantTier::Conditional
}

fn insight_badges(offer: &CanonicalOffer, cheapest: &CanonicalOffer, fastest: &CanonicalOffer) -> Vec<String> {
    let mut badges = Vec::new();
    if offer.score.unwrap_or(0.0) >= policy::BEST_DEAL_MIN {
        badges.push("Best Deal".to_string());
    }
    if offer.id == cheapest.id {
        badges.push("Cheapest".to_string());
    }
    if offer.id == fastest.id {
        badges.push("Fastest".to_string());
    }
    if offer.baggage_weight >= policy::ASSUMED_BAG_KG {
        badges.push("Baggage Included".to_string());
    }
    badges
}

/// Attaches a narrative verdict to every offer. Read-only over the batch:
/// the cheapest and fastest references are fixed before any verdict is
/// written.
pub fn apply_insights(mut offers: Vec<CanonicalOffer>, stats: &BatchStats) -> Vec<CanonicalOffer> {
    let Some(cheapest) = offers
        .iter()
        .min_by(|a, b| a.scoring_price().total_cmp(&b.scoring_price()))
        .cloned()
    else {
        return offers;
    };
    let Some(fastest) = offers.iter().min_by_key(|o| o.duration).cloned() else {
        return offers;
    };

    for offer in &mut offers {
        let decision = match offer.badge {
            Some(Badge::BestPick) | Some(Badge::HiddenGem) => Decision::Recommended,
            Some(Badge::Avoid) => Decision::Avoid,
            _ => Decision::Consider,
        };
        let warning = if offer.is_self_transfer {
            Some(
                "Self-transfer itinerary: separate tickets, baggage must be re-checked and missed connections are not protected."
                    .to_string(),
            )
        } else if offer.has_invalid_data() {
            Some("Provider data for this offer is internally inconsistent; verify times before booking.".to_string())
        } else {
            None
        };
        let scenario = format!(
            "Departs in the {}, lands in the {} after {}.",
            daypart(offer.departure_time),
            daypart(offer.arrival_time),
            fmt_duration(offer.duration)
        );

        offer.verdict = Some(OfferVerdict {
            decision,
            tier: consultant_tier(offer, stats, fastest.duration),
            badges: insight_badges(offer, &cheapest, &fastest),
            pros: pros_for(offer, stats, fastest.duration),
            cons: cons_for(offer, stats, fastest.duration),
            warning,
            tradeoff: tradeoff_for(offer, &cheapest, &fastest),
            scenario,
        });
    }
    offers
}

// ---------------------------------------------------------------------------
// Grouping

/// Offers that describe the same physical flight sold at different fare
/// levels, clustered after scoring.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlightGroup {
    pub carrier: String,
    pub departure_time: DateTime<Utc>,
    pub arrival_time: DateTime<Utc>,
    /// Highest-scoring variant.
    pub best: CanonicalOffer,
    /// Remaining variants, cheapest effective price first.
    pub options: Vec<CanonicalOffer>,
}

impl FlightGroup {
    pub fn cheapest_price(&self) -> f64 {
        self.options
            .iter()
            .chain(std::iter::once(&self.best))
            .map(CanonicalOffer::scoring_price)
            .fold(f64::INFINITY, f64::min)
    }

    pub fn variant_count(&self) -> usize {
        self.options.len() + 1
    }
}

/// Clusters scored offers by physical flight. Groups come back sorted by
/// the winning variant's score descending.
pub fn group_offers(offers: Vec<CanonicalOffer>) -> Vec<FlightGroup> {
    let mut buckets: HashMap<(String, DateTime<Utc>, DateTime<Utc>), Vec<CanonicalOffer>> =
        HashMap::new();
    for offer in offers {
        buckets
            .entry((
                offer.carrier.clone(),
                offer.departure_time,
                offer.arrival_time,
            ))
            .or_default()
            .push(offer);
    }

    let mut groups: Vec<FlightGroup> = buckets
        .into_iter()
        .map(|((carrier, departure_time, arrival_time), mut variants)| {
            variants.sort_by(|a, b| {
                b.score
                    .unwrap_or(0.0)
                    .total_cmp(&a.score.unwrap_or(0.0))
                    .then_with(|| a.scoring_price().total_cmp(&b.scoring_price()))
                    .then_with(|| a.id.cmp(&b.id))
            });
            let best = variants.remove(0);
            variants.sort_by(|a, b| {
                a.scoring_price()
                    .total_cmp(&b.scoring_price())
                    .then_with(|| a.id.cmp(&b.id))
            });
            FlightGroup {
                carrier,
                departure_time,
                arrival_time,
                best,
                options: variants,
            }
        })
        .collect();

    // Score alone ties often after rounding and clamping; the remaining
    // keys pin a total order so output never depends on map iteration.
    groups.sort_by(|a, b| {
        b.best
            .score
            .unwrap_or(0.0)
            .total_cmp(&a.best.score.unwrap_or(0.0))
            .then_with(|| a.best.scoring_price().total_cmp(&b.best.scoring_price()))
            .then_with(|| a.carrier.cmp(&b.carrier))
            .then_with(|| a.departure_time.cmp(&b.departure_time))
    });
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fareguard_core::{Layover, QualityLevel, Segment};

    fn offer(id: &str, carrier: &str, price: f64, duration: i64, stops: usize) -> CanonicalOffer {
        let dep = Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).single().unwrap();
        CanonicalOffer {
            id: id.to_string(),
            provider: "test".to_string(),
            carrier: carrier.to_string(),
            flight_number: format!("{carrier}100"),
            departure_time: dep,
            arrival_time: dep + chrono::Duration::minutes(duration),
            duration,
            stops,
            segments: vec![],
            layovers: vec![],
            price,
            currency: "USD".to_string(),
            effective_price: None,
            baggage_weight: 0.0,
            baggage_quantity: 0,
            has_meal: false,
            has_wifi: false,
            has_entertainment: false,
            refundable: false,
            change_allowed: false,
            is_self_transfer: false,
            quality_flags: vec![],
            score: None,
            scores: None,
            badge: None,
            identity: None,
            stress: None,
            verdict: None,
        }
    }

    #[test]
    fn enricher_charges_hidden_costs_for_bare_lcc_fares() {
        let airlines = AirlineTable::builtin();
        // Ryanair: no free bag, no meals. Both hidden costs land.
        let enriched = enrich(offer("a", "FR", 100.0, 180, 0), &airlines);
        assert_eq!(enriched.effective_price, Some(200.0));
        assert_eq!(enriched.baggage_weight, 0.0);
    }

    #[test]
    fn enricher_assumes_full_service_baggage_allowance() {
        let airlines = AirlineTable::builtin();
        let enriched = enrich(offer("a", "QR", 500.0, 400, 0), &airlines);
        assert_eq!(enriched.baggage_weight, policy::ASSUMED_BAG_KG);
        assert!(enriched.has_meal);
        assert_eq!(enriched.effective_price, Some(500.0));
    }

    #[test]
    fn enricher_never_assumes_baggage_for_self_transfer() {
        let airlines = AirlineTable::builtin();
        let mut bare = offer("a", "QR", 500.0, 400, 1);
        bare.is_self_transfer = true;
        let enriched = enrich(bare, &airlines);
        assert_eq!(enriched.baggage_weight, 0.0);
        // 80 bag + 150 self-transfer; meals still assumed from the profile.
        assert_eq!(enriched.effective_price, Some(730.0));
    }

    #[test]
    fn effective_price_is_monotone_in_missing_amenities() {
        let airlines = AirlineTable::builtin();
        let with_bag = {
            let mut o = offer("a", "FR", 100.0, 180, 0);
            o.baggage_weight = 23.0;
            o.has_meal = true;
            enrich(o, &airlines)
        };
        let without = enrich(offer("b", "FR", 100.0, 180, 0), &airlines);
        assert!(without.scoring_price() > with_bag.scoring_price());
    }

    #[test]
    fn stats_are_none_for_empty_or_worthless_batches() {
        assert!(compute_stats(&[]).is_none());
        let free = offer("a", "LH", 0.0, 600, 0);
        assert!(compute_stats(&[free]).is_none());
    }

    #[test]
    fn reference_price_skips_the_cheapest_outlier_decile() {
        let offers: Vec<CanonicalOffer> = (0..10)
            .map(|i| offer(&format!("o{i}"), "LH", 100.0 + i as f64 * 50.0, 600, 0))
            .collect();
        let stats = compute_stats(&offers).unwrap();
        // floor(10 * 0.10) = 1: second-cheapest price is the reference.
        assert_eq!(stats.reference_price, 150.0);
        assert_eq!(stats.min_price, 100.0);
        assert_eq!(stats.median_price, 350.0);
    }

    #[test]
    fn scoring_is_deterministic() {
        let airlines = AirlineTable::builtin();
        let batch = || {
            enrich_all(
                vec![
                    offer("a", "LH", 1000.0, 600, 0),
                    offer("b", "FR", 700.0, 750, 1),
                    offer("c", "QR", 1400.0, 590, 0),
                ],
                &airlines,
            )
        };
        let first = score_batch(batch(), &airlines);
        let second = score_batch(batch(), &airlines);
        assert_eq!(first.offers, second.offers);
        assert_eq!(first.stats, second.stats);
    }

    #[test]
    fn scores_stay_inside_bounds_and_track_raw_order() {
        let airlines = AirlineTable::builtin();
        // No penalty triggers anywhere, so final order must follow raw order.
        let batch = enrich_all(
            vec![
                offer("cheap", "LH", 900.0, 600, 0),
                offer("mid", "LH", 1200.0, 620, 0),
                offer("dear", "LH", 2400.0, 640, 0),
            ],
            &airlines,
        );
        let scored = score_batch(batch, &airlines);
        let scores: Vec<f64> = scored.offers.iter().map(|o| o.score.unwrap()).collect();
        assert!(scores.windows(2).all(|w| w[0] >= w[1]));
        assert!(scores.iter().all(|s| (1.0..=10.0).contains(s)));
        assert_eq!(scored.offers[0].id, "cheap");
    }

    #[test]
    fn self_transfer_penalty_outranks_the_others() {
        let airlines = AirlineTable::builtin();
        let stats = BatchStats {
            min_price: 500.0,
            max_price: 900.0,
            min_duration: 400,
            max_duration: 900,
            reference_price: 500.0,
            median_price: 600.0,
            max_raw_score: 60.0,
        };
        // Self-transfer plus a slow multi-stop pure-LCC itinerary: only the
        // highest-priority multiplier applies.
        let mut worst = offer("w", "FR", 550.0, 900, 2);
        worst.is_self_transfer = true;
        assert_eq!(
            hard_penalty(&worst, &stats, &airlines),
            policy::PENALTY_SELF_TRANSFER
        );
        worst.is_self_transfer = false;
        assert_eq!(
            hard_penalty(&worst, &stats, &airlines),
            policy::PENALTY_MULTI_STOP_SLOW
        );
    }

    #[test]
    fn mixed_service_lcc_long_haul_draws_its_own_penalty() {
        let airlines = AirlineTable::builtin();
        let stats = BatchStats {
            min_price: 500.0,
            max_price: 900.0,
            min_duration: 700,
            max_duration: 900,
            reference_price: 500.0,
            median_price: 600.0,
            max_raw_score: 60.0,
        };
        let dep = Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).single().unwrap();
        let segment = |carrier: &str, minutes: i64| Segment {
            from: "IST".to_string(),
            to: "SIN".to_string(),
            carrier: carrier.to_string(),
            carrier_name: carrier.to_string(),
            flight_number: format!("{carrier}1"),
            departure: dep,
            arrival: dep + chrono::Duration::minutes(minutes),
            duration: minutes,
            aircraft: None,
        };

        // Tier1 feeder plus a seven-hour Scoot leg: mixed service, not
        // pure LCC, so the dedicated multiplier applies.
        let mut mixed = offer("m", "TK", 650.0, 800, 1);
        mixed.segments = vec![segment("TK", 380), segment("TR", 420)];
        assert_eq!(
            hard_penalty(&mixed, &stats, &airlines),
            policy::PENALTY_MIXED_LCC
        );

        // A short LCC hop inside the same itinerary stays unpenalized.
        mixed.segments = vec![segment("TK", 500), segment("TR", 300)];
        assert_eq!(hard_penalty(&mixed, &stats, &airlines), 1.0);
    }

    #[test]
    fn invalid_data_flag_lowers_the_raw_score() {
        let airlines = AirlineTable::builtin();
        let stats = BatchStats {
            min_price: 900.0,
            max_price: 1100.0,
            min_duration: 600,
            max_duration: 620,
            reference_price: 1000.0,
            median_price: 1000.0,
            max_raw_score: 0.0,
        };
        let clean = offer("a", "LH", 1000.0, 600, 0);
        let mut flagged = clean.clone();
        flagged.flag_quality(QualityLevel::Invalid, "duration mismatch");
        let clean_raw = raw_score(&clean, &stats, &airlines).raw;
        let flagged_raw = raw_score(&flagged, &stats, &airlines).raw;
        assert_eq!(
            clean_raw - flagged_raw,
            policy::RISK_WEIGHT * policy::RISK_INVALID_DATA
        );
    }

    #[test]
    fn comparable_cheap_offers_score_together_and_outliers_sink() {
        let airlines = AirlineTable::builtin();
        let batch = enrich_all(
            vec![
                offer("a", "LH", 1000.0, 600, 0),
                offer("b", "LH", 1050.0, 610, 0),
                offer("c", "LH", 4000.0, 590, 0),
            ],
            &airlines,
        );
        let scored = score_batch(batch, &airlines);
        let by_id = |id: &str| {
            scored
                .offers
                .iter()
                .find(|o| o.id == id)
                .and_then(|o| o.score)
                .unwrap()
        };
        assert!((by_id("a") - by_id("b")).abs() <= 0.5);
        assert!(by_id("a") - by_id("c") >= 3.0);
    }

    #[test]
    fn bargain_self_transfer_earns_hacker_fare_and_conditional_tier() {
        let airlines = AirlineTable::builtin();
        let mut risky = offer("hack", "FR", 1050.0, 900, 2);
        risky.is_self_transfer = true;
        let batch = enrich_all(vec![offer("base", "LH", 1000.0, 600, 0), risky], &airlines);
        let scored = score_batch(batch, &airlines);
        let stats = scored.stats.unwrap();
        let annotated = apply_insights(scored.offers, &stats);
        let hack = annotated.iter().find(|o| o.id == "hack").unwrap();
        assert_eq!(hack.badge, Some(Badge::HackerFare));
        let verdict = hack.verdict.as_ref().unwrap();
        assert_eq!(verdict.tier, ConsultantTier::Conditional);
        assert!(verdict.warning.is_some());
    }

    #[test]
    fn insights_tag_cheapest_and_fastest_extremes() {
        let airlines = AirlineTable::builtin();
        let batch = enrich_all(
            vec![
                offer("cheap", "LH", 800.0, 700, 0),
                offer("fast", "LH", 1100.0, 580, 0),
            ],
            &airlines,
        );
        let scored = score_batch(batch, &airlines);
        let stats = scored.stats.unwrap();
        let annotated = apply_insights(scored.offers, &stats);
        let cheap = annotated.iter().find(|o| o.id == "cheap").unwrap();
        let fast = annotated.iter().find(|o| o.id == "fast").unwrap();
        let badges = |o: &CanonicalOffer| o.verdict.as_ref().unwrap().badges.clone();
        assert!(badges(cheap).contains(&"Cheapest".to_string()));
        assert!(badges(fast).contains(&"Fastest".to_string()));
        assert!(cheap.verdict.as_ref().unwrap().tradeoff.starts_with("Cheapest option"));
        assert!(fast.verdict.as_ref().unwrap().tradeoff.starts_with("Fastest option"));
    }

    #[test]
    fn tight_connections_surface_in_cons_and_stress() {
        let airlines = AirlineTable::builtin();
        let mut rushed = offer("r", "LH", 1000.0, 700, 1);
        rushed.layovers = vec![Layover {
            airport: "FRA".to_string(),
            duration: 40,
            city: None,
        }];
        let batch = enrich_all(vec![rushed, offer("base", "LH", 1000.0, 650, 0)], &airlines);
        let scored = score_batch(batch, &airlines);
        let stats = scored.stats.unwrap();
        let annotated = apply_insights(scored.offers, &stats);
        let rushed = annotated.iter().find(|o| o.id == "r").unwrap();
        assert_eq!(rushed.stress.unwrap().transfer, StressLevel::Critical);
        assert!(rushed
            .verdict
            .as_ref()
            .unwrap()
            .cons
            .iter()
            .any(|c| c.contains("Tight connection")));
    }

    #[test]
    fn grouping_collapses_fare_variants_onto_the_best_one() {
        let airlines = AirlineTable::builtin();
        let dep = Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).single().unwrap();
        let mut flex = offer("flex", "LH", 1300.0, 600, 0);
        let mut basic = offer("basic", "LH", 1000.0, 600, 0);
        let other = offer("other", "QR", 1100.0, 590, 0);
        flex.refundable = true;
        flex.departure_time = dep;
        basic.departure_time = dep;
        flex.arrival_time = basic.arrival_time;

        let scored = score_batch(
            enrich_all(vec![flex, basic, other], &airlines),
            &airlines,
        );
        let groups = group_offers(scored.offers);
        assert_eq!(groups.len(), 2);
        let lh = groups.iter().find(|g| g.carrier == "LH").unwrap();
        assert_eq!(lh.variant_count(), 2);
        assert_eq!(lh.best.id, "basic");
        assert_eq!(lh.options[0].id, "flex");
        assert_eq!(lh.cheapest_price(), 1000.0);
    }

    #[test]
    fn group_order_is_stable_when_winner_scores_tie() {
        let carriers = ["VJ", "QR", "LH", "TK", "AF", "KL", "SQ", "EK"];
        let tied: Vec<CanonicalOffer> = carriers
            .iter()
            .enumerate()
            .map(|(i, carrier)| {
                let mut o = offer(&format!("o{i}"), carrier, 1000.0, 600, 0);
                o.score = Some(8.0);
                o
            })
            .collect();

        let order = |offers: Vec<CanonicalOffer>| -> Vec<String> {
            group_offers(offers)
                .into_iter()
                .map(|g| g.carrier)
                .collect()
        };

        let first = order(tied.clone());
        for _ in 0..20 {
            assert_eq!(first, order(tied.clone()));
        }

        // Equal score and price: the carrier key breaks the tie.
        let mut expected: Vec<String> = carriers.iter().map(|c| c.to_string()).collect();
        expected.sort();
        assert_eq!(first, expected);
    }

    #[test]
    fn unscorable_batch_comes_back_unscored_not_panicking() {
        let airlines = AirlineTable::builtin();
        let free = offer("a", "LH", 0.0, 600, 0);
        let result = score_batch(vec![free], &airlines);
        assert!(result.stats.is_none());
        assert_eq!(result.offers.len(), 1);
        assert!(result.offers[0].score.is_none());
    }
}
