//! Provider adapter contracts + fixture-backed adapter implementations.
//!
//! Adapters are responsible for mapping their supplier's raw records into
//! the canonical offer shape before handing off to the pipeline. Supplier
//! fields are loosely typed and inconsistently populated, so every mapped
//! field goes through a named fallback-resolution function instead of ad
//! hoc probing at each call site.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use fareguard_core::{CanonicalOffer, Layover, QualityLevel, Segment};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "fareguard-adapters";

/// Declared duration may disagree with the timestamps by up to this many
/// minutes before the offer is flagged as internally inconsistent.
pub const DURATION_MISMATCH_TOLERANCE_MIN: i64 = 45;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CabinClass {
    Economy,
    PremiumEconomy,
    Business,
    First,
}

impl std::str::FromStr for CabinClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "economy" => Ok(Self::Economy),
            "premium_economy" | "premium-economy" => Ok(Self::PremiumEconomy),
            "business" => Ok(Self::Business),
            "first" => Ok(Self::First),
            other => Err(format!("unknown cabin class: {other}")),
        }
    }
}

/// Search parameters, validated upstream: 3-letter IATA codes and a real
/// date are assumed here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub origin: String,
    pub destination: String,
    pub date: NaiveDate,
    pub passengers: u32,
    pub cabin: CabinClass,
}

impl SearchQuery {
    pub fn new(
        origin: &str,
        destination: &str,
        date: NaiveDate,
        passengers: u32,
        cabin: CabinClass,
    ) -> Self {
        Self {
            origin: origin.to_ascii_uppercase(),
            destination: destination.to_ascii_uppercase(),
            date,
            passengers,
            cabin,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// One supplier integration. Implementations must not panic on transient
/// supplier failure; they return an error and the aggregator treats it as
/// zero offers for this search.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider_id(&self) -> &'static str;

    async fn search(&self, query: &SearchQuery) -> Result<Vec<CanonicalOffer>, AdapterError>;
}

// ---------------------------------------------------------------------
// Raw fixture shapes: exhaustively optional, mirroring how inconsistently
// suppliers populate these fields.
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct FixtureFile {
    pub provider: String,
    pub offers: Vec<RawOfferRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawOfferRecord {
    pub id: String,
    pub carrier: Option<String>,
    pub flight_number: Option<String>,
    pub price: Option<RawPrice>,
    pub currency: Option<String>,
    pub duration: Option<RawDuration>,
    pub departure: Option<DateTime<Utc>>,
    pub arrival: Option<DateTime<Utc>>,
    #[serde(default)]
    pub segments: Vec<RawSegment>,
    pub attributes: Option<RawAttributes>,
    pub policies: Option<RawPolicies>,
    pub amenities: Option<RawAmenities>,
    pub fare: Option<RawFare>,
}

/// Price arrives either as a bare number (currency at the top level) or as
/// a nested amount/currency block, depending on the supplier.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawPrice {
    Amount(f64),
    Block { amount: f64, currency: Option<String> },
}

/// Duration arrives as integer minutes or as a textual form
/// ("PT11H30M", "11h 30m", "690m").
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawDuration {
    Minutes(i64),
    Text(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawSegment {
    pub from: String,
    pub to: String,
    pub carrier: Option<String>,
    pub carrier_name: Option<String>,
    pub flight_number: Option<String>,
    pub departure: DateTime<Utc>,
    pub arrival: DateTime<Utc>,
    pub duration: Option<RawDuration>,
    pub aircraft: Option<String>,
    #[serde(default)]
    pub self_transfer: bool,
    #[serde(default)]
    pub virtual_interlining: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawAttributes {
    #[serde(default)]
    pub self_transfer: bool,
    #[serde(default)]
    pub virtual_interlining: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPolicies {
    pub baggage_kg: Option<f64>,
    pub baggage_pieces: Option<u32>,
    #[serde(default)]
    pub cabin_bag_only: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawAmenities {
    #[serde(default)]
    pub meal: bool,
    #[serde(default)]
    pub wifi: bool,
    #[serde(default)]
    pub entertainment: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawFare {
    #[serde(default)]
    pub refundable: bool,
    #[serde(default)]
    pub changeable: bool,
}

// ---------------------------------------------------------------------
// Named fallback-resolution functions.
// ---------------------------------------------------------------------

pub fn resolve_price(record: &RawOfferRecord) -> Option<(f64, String)> {
    match &record.price {
        Some(RawPrice::Amount(amount)) if *amount > 0.0 => {
            let currency = record.currency.clone()?;
            Some((*amount, currency))
        }
        Some(RawPrice::Block { amount, currency }) if *amount > 0.0 => {
            let currency = currency.clone().or_else(|| record.currency.clone())?;
            Some((*amount, currency))
        }
        _ => None,
    }
}

/// Parse a textual duration into minutes. Accepts ISO-8601 ("PT11H30M"),
/// "11h 30m" and "690m" forms; anything else resolves to zero.
pub fn parse_duration_text(text: &str) -> i64 {
    let trimmed = text.trim();

    if let Some(rest) = trimmed
        .strip_prefix("PT")
        .or_else(|| trimmed.strip_prefix("pt"))
    {
        let mut minutes = 0i64;
        let mut number = String::new();
        for ch in rest.chars() {
            if ch.is_ascii_digit() {
                number.push(ch);
            } else {
                let value: i64 = number.parse().unwrap_or(0);
                match ch.to_ascii_uppercase() {
                    'H' => minutes += value * 60,
                    'M' => minutes += value,
                    _ => {}
                }
                number.clear();
            }
        }
        return minutes.max(0);
    }

    let lower = trimmed.to_ascii_lowercase();
    if let Some(h_pos) = lower.find('h') {
        let hours: i64 = lower[..h_pos].trim().parse().unwrap_or(0);
        let rest = lower[h_pos + 1..].trim().trim_end_matches('m').trim();
        let mins: i64 = if rest.is_empty() {
            0
        } else {
            rest.parse().unwrap_or(0)
        };
        return (hours * 60 + mins).max(0);
    }

    lower
        .trim_end_matches("min")
        .trim_end_matches('m')
        .trim()
        .parse::<i64>()
        .unwrap_or(0)
        .max(0)
}

/// Resolve the total duration in minutes: declared value first, falling
/// back to arrival minus departure when the declaration is missing or
/// unparseable.
pub fn resolve_duration(record: &RawOfferRecord) -> i64 {
    let declared = match &record.duration {
        Some(RawDuration::Minutes(m)) => (*m).max(0),
        Some(RawDuration::Text(t)) => parse_duration_text(t),
        None => 0,
    };
    if declared > 0 {
        return declared;
    }
    timestamp_duration(record).unwrap_or(0)
}

fn timestamp_duration(record: &RawOfferRecord) -> Option<i64> {
    let dep = record
        .departure
        .or_else(|| record.segments.first().map(|s| s.departure))?;
    let arr = record
        .arrival
        .or_else(|| record.segments.last().map(|s| s.arrival))?;
    let minutes = (arr - dep).num_minutes();
    (minutes > 0).then_some(minutes)
}

/// Self-transfer is declared explicitly on some suppliers, carried as a
/// virtual-interlining attribute on others, and only visible per segment
/// on the rest.
pub fn resolve_self_transfer(record: &RawOfferRecord) -> bool {
    if let Some(attrs) = &record.attributes {
        if attrs.self_transfer || attrs.virtual_interlining {
            return true;
        }
    }
    record
        .segments
        .iter()
        .any(|s| s.self_transfer || s.virtual_interlining)
}

pub fn resolve_baggage(record: &RawOfferRecord) -> (f64, u32) {
    let policies = record.policies.clone().unwrap_or_default();
    if policies.cabin_bag_only {
        return (0.0, 0);
    }
    (
        policies.baggage_kg.unwrap_or(0.0).max(0.0),
        policies.baggage_pieces.unwrap_or(0),
    )
}

fn resolve_segment_duration(segment: &RawSegment) -> i64 {
    let declared = match &segment.duration {
        Some(RawDuration::Minutes(m)) => (*m).max(0),
        Some(RawDuration::Text(t)) => parse_duration_text(t),
        None => 0,
    };
    if declared > 0 {
        declared
    } else {
        (segment.arrival - segment.departure).num_minutes().max(0)
    }
}

/// Ground time between consecutive segments.
fn derive_layovers(segments: &[Segment]) -> Vec<Layover> {
    segments
        .windows(2)
        .map(|pair| Layover {
            airport: pair[0].to.clone(),
            duration: (pair[1].departure - pair[0].arrival).num_minutes().max(0),
            city: None,
        })
        .collect()
}

/// Map one raw supplier record into the canonical shape. Returns `None`
/// when the record is unusable (no positive price or no schedule at all);
/// recoverable inconsistencies become quality flags instead.
pub fn canonicalize(provider_id: &str, record: &RawOfferRecord) -> Option<CanonicalOffer> {
    let (price, currency) = resolve_price(record)?;

    let segments: Vec<Segment> = record
        .segments
        .iter()
        .map(|raw| {
            let carrier = raw
                .carrier
                .clone()
                .or_else(|| record.carrier.clone())
                .unwrap_or_else(|| "XX".to_string());
            Segment {
                from: raw.from.to_ascii_uppercase(),
                to: raw.to.to_ascii_uppercase(),
                carrier_name: raw.carrier_name.clone().unwrap_or_else(|| carrier.clone()),
                flight_number: raw
                    .flight_number
                    .clone()
                    .or_else(|| record.flight_number.clone())
                    .unwrap_or_default(),
                departure: raw.departure,
                arrival: raw.arrival,
                duration: resolve_segment_duration(raw),
                aircraft: raw.aircraft.clone(),
                carrier,
            }
        })
        .collect();

    let departure_time = record
        .departure
        .or_else(|| segments.first().map(|s| s.departure))?;
    let arrival_time = record
        .arrival
        .or_else(|| segments.last().map(|s| s.arrival))?;

    let duration = resolve_duration(record);
    if duration <= 0 {
        return None;
    }

    let carrier = record
        .carrier
        .clone()
        .or_else(|| segments.first().map(|s| s.carrier.clone()))
        .unwrap_or_else(|| "XX".to_string());

    let layovers = derive_layovers(&segments);
    let stops = segments.len().saturating_sub(1);
    let amenities = record.amenities.clone().unwrap_or_default();
    let fare = record.fare.clone().unwrap_or_default();
    let (baggage_weight, baggage_quantity) = resolve_baggage(record);

    let mut offer = CanonicalOffer {
        id: format!("{provider_id}:{}", record.id),
        provider: provider_id.to_string(),
        flight_number: record
            .flight_number
            .clone()
            .or_else(|| segments.first().map(|s| s.flight_number.clone()))
            .unwrap_or_default(),
        departure_time,
        arrival_time,
        duration,
        stops,
        segments,
        layovers,
        price,
        currency,
        effective_price: None,
        baggage_weight,
        baggage_quantity,
        has_meal: amenities.meal,
        has_wifi: amenities.wifi,
        has_entertainment: amenities.entertainment,
        refundable: fare.refundable,
        change_allowed: fare.changeable,
        is_self_transfer: resolve_self_transfer(record),
        quality_flags: vec![],
        score: None,
        scores: None,
        badge: None,
        identity: None,
        stress: None,
        verdict: None,
        carrier,
    };

    // Suppliers occasionally report a correct price with corrupted duration
    // metadata. Keep the offer but mark it so ranking can discount it.
    if let Some(from_timestamps) = timestamp_duration(record) {
        if (offer.duration - from_timestamps).abs() > DURATION_MISMATCH_TOLERANCE_MIN {
            offer.flag_quality(
                QualityLevel::Invalid,
                format!(
                    "declared duration {}m disagrees with timestamps ({}m)",
                    offer.duration, from_timestamps
                ),
            );
        }
    }

    Some(offer)
}

// ---------------------------------------------------------------------
// Fixture-backed adapter: reads fixtures/<provider>/offers.json under a
// configured root. The pipeline performs no network I/O; live supplier
// integrations implement the same trait out of tree.
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FixtureAdapter {
    provider_id: &'static str,
    fixtures_root: PathBuf,
}

impl FixtureAdapter {
    pub fn new(provider_id: &'static str, fixtures_root: impl Into<PathBuf>) -> Self {
        Self {
            provider_id,
            fixtures_root: fixtures_root.into(),
        }
    }

    fn fixture_path(&self) -> PathBuf {
        self.fixtures_root.join(self.provider_id).join("offers.json")
    }

    fn load_fixture(&self) -> Result<FixtureFile, AdapterError> {
        let path = self.fixture_path();
        let text = fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))
            .map_err(AdapterError::Anyhow)?;
        let fixture: FixtureFile = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))
            .map_err(AdapterError::Anyhow)?;
        if fixture.provider != self.provider_id {
            return Err(AdapterError::Message(format!(
                "fixture provider={} does not match adapter provider={}",
                fixture.provider, self.provider_id
            )));
        }
        Ok(fixture)
    }

    fn matches_query(offer: &CanonicalOffer, query: &SearchQuery) -> bool {
        let route_ok = match (offer.segments.first(), offer.segments.last()) {
            (Some(first), Some(last)) => {
                first.from == query.origin && last.to == query.destination
            }
            _ => true,
        };
        route_ok && offer.departure_time.date_naive() == query.date
    }
}

#[async_trait]
impl ProviderAdapter for FixtureAdapter {
    fn provider_id(&self) -> &'static str {
        self.provider_id
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<CanonicalOffer>, AdapterError> {
        let fixture = self.load_fixture()?;
        let offers: Vec<CanonicalOffer> = fixture
            .offers
            .iter()
            .filter_map(|record| canonicalize(self.provider_id, record))
            .filter(|offer| Self::matches_query(offer, query))
            .collect();
        debug!(
            provider = self.provider_id,
            offers = offers.len(),
            "fixture search complete"
        );
        Ok(offers)
    }
}

/// An adapter that always fails, for exercising the aggregator's
/// failure-isolation path in tests.
#[derive(Debug, Clone, Copy)]
pub struct FailingAdapter {
    pub provider_id: &'static str,
}

#[async_trait]
impl ProviderAdapter for FailingAdapter {
    fn provider_id(&self) -> &'static str {
        self.provider_id
    }

    async fn search(&self, _query: &SearchQuery) -> Result<Vec<CanonicalOffer>, AdapterError> {
        Err(AdapterError::Message(format!(
            "{}: upstream unavailable",
            self.provider_id
        )))
    }
}

pub fn fixture_adapter_for(
    provider_id: &str,
    fixtures_root: &Path,
) -> Option<Box<dyn ProviderAdapter>> {
    match provider_id {
        "farejet" => Some(Box::new(FixtureAdapter::new("farejet", fixtures_root))),
        "skyhop" => Some(Box::new(FixtureAdapter::new("skyhop", fixtures_root))),
        _ => None,
    }
}
