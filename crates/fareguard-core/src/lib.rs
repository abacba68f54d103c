//! Core domain model for Fareguard: the canonical offer record, airline
//! reference data, and the currency rate table.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "fareguard-core";

/// Service-quality classification used to bias comfort scoring and price
/// tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AirlineTier {
    Tier1,
    Tier2,
    Lcc,
}

/// Reference data for one carrier. Immutable for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AirlineProfile {
    pub display_name: String,
    pub tier: AirlineTier,
    pub has_free_bag: bool,
    pub has_meals: bool,
    pub has_entertainment: bool,
}

impl AirlineProfile {
    fn new(
        display_name: &str,
        tier: AirlineTier,
        has_free_bag: bool,
        has_meals: bool,
        has_entertainment: bool,
    ) -> Self {
        Self {
            display_name: display_name.to_string(),
            tier,
            has_free_bag,
            has_meals,
            has_entertainment,
        }
    }

    /// Conservative profile for carriers missing from the table: assume an
    /// average full-service airline (baggage and meals included) but never
    /// promise seat-back entertainment, so unknowns are not over-rewarded.
    pub fn conservative_default(code: &str) -> Self {
        Self::new(code, AirlineTier::Tier2, true, true, false)
    }
}

/// Immutable carrier-code lookup, loaded once and injected into the
/// pipeline. `lookup` is total: unknown codes resolve to the conservative
/// default rather than an error.
#[derive(Debug, Clone)]
pub struct AirlineTable {
    profiles: HashMap<String, AirlineProfile>,
}

impl AirlineTable {
    pub fn new(profiles: HashMap<String, AirlineProfile>) -> Self {
        Self { profiles }
    }

    pub fn lookup(&self, code: &str) -> AirlineProfile {
        self.profiles
            .get(code)
            .cloned()
            .unwrap_or_else(|| AirlineProfile::conservative_default(code))
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Built-in table covering the carriers the scoring engine most often
    /// sees. Callers with richer reference data can construct their own.
    pub fn builtin() -> Self {
        use AirlineTier::{Lcc, Tier1, Tier2};
        let mut profiles = HashMap::new();
        let mut add = |code: &str, profile: AirlineProfile| {
            profiles.insert(code.to_string(), profile);
        };

        // Full-service flagship carriers.
        add("QR", AirlineProfile::new("Qatar Airways", Tier1, true, true, true));
        add("SQ", AirlineProfile::new("Singapore Airlines", Tier1, true, true, true));
        add("EK", AirlineProfile::new("Emirates", Tier1, true, true, true));
        add("TK", AirlineProfile::new("Turkish Airlines", Tier1, true, true, true));
        add("QF", AirlineProfile::new("Qantas", Tier1, true, true, true));
        add("NH", AirlineProfile::new("ANA (All Nippon)", Tier1, true, true, true));
        add("JL", AirlineProfile::new("Japan Airlines", Tier1, true, true, true));
        add("BR", AirlineProfile::new("EVA Air", Tier1, true, true, true));
        add("CX", AirlineProfile::new("Cathay Pacific", Tier1, true, true, true));
        add("KE", AirlineProfile::new("Korean Air", Tier1, true, true, true));
        add("OZ", AirlineProfile::new("Asiana Airlines", Tier1, true, true, true));
        add("NZ", AirlineProfile::new("Air New Zealand", Tier1, true, true, true));
        add("EY", AirlineProfile::new("Etihad Airways", Tier1, true, true, true));
        add("CI", AirlineProfile::new("China Airlines", Tier1, true, true, true));

        // Standard legacy carriers.
        add("LH", AirlineProfile::new("Lufthansa", Tier2, true, true, true));
        add("BA", AirlineProfile::new("British Airways", Tier2, true, true, true));
        add("AF", AirlineProfile::new("Air France", Tier2, true, true, true));
        add("KL", AirlineProfile::new("KLM", Tier2, true, true, true));
        add("AY", AirlineProfile::new("Finnair", Tier2, true, true, true));
        add("SK", AirlineProfile::new("SAS", Tier2, true, false, false));
        add("IB", AirlineProfile::new("Iberia", Tier2, true, true, true));
        add("CZ", AirlineProfile::new("China Southern", Tier2, true, true, true));
        add("MU", AirlineProfile::new("China Eastern", Tier2, true, true, true));
        add("MH", AirlineProfile::new("Malaysia Airlines", Tier2, true, true, true));
        add("TG", AirlineProfile::new("Thai Airways", Tier2, true, true, true));
        add("VN", AirlineProfile::new("Vietnam Airlines", Tier2, true, true, true));
        add("GA", AirlineProfile::new("Garuda Indonesia", Tier2, true, true, true));
        add("SV", AirlineProfile::new("Saudia", Tier2, true, true, true));
        add("WY", AirlineProfile::new("Oman Air", Tier2, true, true, true));
        add("GF", AirlineProfile::new("Gulf Air", Tier2, true, true, true));
        add("KU", AirlineProfile::new("Kuwait Airways", Tier2, true, true, true));
        add("MS", AirlineProfile::new("EgyptAir", Tier2, true, true, false));
        add("UA", AirlineProfile::new("United Airlines", Tier2, true, true, true));
        add("DL", AirlineProfile::new("Delta Air Lines", Tier2, true, true, true));
        add("AA", AirlineProfile::new("American Airlines", Tier2, true, true, true));
        add("AC", AirlineProfile::new("Air Canada", Tier2, true, true, true));

        // Low-cost carriers.
        add("D7", AirlineProfile::new("AirAsia X", Lcc, false, false, false));
        add("AK", AirlineProfile::new("AirAsia", Lcc, false, false, false));
        add("XJ", AirlineProfile::new("Thai AirAsia X", Lcc, false, false, false));
        add("JQ", AirlineProfile::new("Jetstar", Lcc, false, false, false));
        add("TR", AirlineProfile::new("Scoot", Lcc, false, false, false));
        add("5J", AirlineProfile::new("Cebu Pacific", Lcc, false, false, false));
        add("SL", AirlineProfile::new("Thai Lion Air", Lcc, false, false, false));
        add("VJ", AirlineProfile::new("VietJet Air", Lcc, false, false, false));
        add("PC", AirlineProfile::new("Pegasus", Lcc, false, false, false));
        add("VF", AirlineProfile::new("AJet", Lcc, false, false, false));
        add("W6", AirlineProfile::new("Wizz Air", Lcc, false, false, false));
        add("FR", AirlineProfile::new("Ryanair", Lcc, false, false, false));
        add("U2", AirlineProfile::new("EasyJet", Lcc, false, false, false));
        add("HV", AirlineProfile::new("Transavia", Lcc, false, false, false));
        add("G9", AirlineProfile::new("Air Arabia", Lcc, false, false, false));
        add("J9", AirlineProfile::new("Jazeera Airways", Lcc, false, false, false));

        // Hybrids: low-cost pricing with selective full-service perks.
        add("OD", AirlineProfile::new("Batik Air Malaysia", Lcc, true, true, true));
        add("ID", AirlineProfile::new("Batik Air Indonesia", Lcc, true, false, false));
        add("FZ", AirlineProfile::new("FlyDubai", Lcc, false, false, true));
        add("N0", AirlineProfile::new("Norse Atlantic", Lcc, false, false, true));
        add("ZG", AirlineProfile::new("Zipair", Lcc, false, false, false));

        Self { profiles }
    }
}

impl Default for AirlineTable {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Currency rate table: ISO code -> units of that currency per one unit of
/// the reference currency. Collaborator-supplied, refreshed out of band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateTable {
    pub reference_currency: String,
    pub rates: HashMap<String, f64>,
}

impl RateTable {
    pub fn units_per_reference(&self, code: &str) -> Option<f64> {
        if code == self.reference_currency {
            return Some(1.0);
        }
        self.rates.get(code).copied().filter(|r| *r > 0.0)
    }
}

/// One flown leg of an itinerary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub from: String,
    pub to: String,
    pub carrier: String,
    pub carrier_name: String,
    pub flight_number: String,
    pub departure: DateTime<Utc>,
    pub arrival: DateTime<Utc>,
    /// Minutes.
    pub duration: i64,
    #[serde(default)]
    pub aircraft: Option<String>,
}

/// Ground time between two segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layover {
    pub airport: String,
    /// Minutes.
    pub duration: i64,
    #[serde(default)]
    pub city: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityLevel {
    /// Data passed through a documented approximation (e.g. unknown
    /// currency converted 1:1).
    LowConfidence,
    /// Data is internally inconsistent (e.g. declared duration disagrees
    /// with the timestamps). The offer is kept but discounted.
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityFlag {
    pub level: QualityLevel,
    pub reason: String,
}

/// Component sub-scores on a 0-100 scale, for callers that render
/// per-dimension breakdowns.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ComponentScores {
    pub price: f64,
    pub time: f64,
    pub comfort: f64,
    pub regret: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Badge {
    BestPick,
    HiddenGem,
    Acceptable,
    HackerFare,
    Standard,
    Avoid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Recommended,
    Consider,
    Avoid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsultantTier {
    StrongYes,
    Conditional,
    Avoid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StressLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Per-dimension stress outlook for a traveler on this offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StressMap {
    pub check_in: StressLevel,
    pub transfer: StressLevel,
    pub baggage: StressLevel,
    pub timeline: StressLevel,
}

/// Human-layer persona shown on the offer card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlightIdentity {
    pub label: String,
    pub emoji: String,
    pub color: String,
    pub description: String,
}

/// Narrative verdict produced by the insight generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferVerdict {
    pub decision: Decision,
    pub tier: ConsultantTier,
    pub badges: Vec<String>,
    pub pros: Vec<String>,
    pub cons: Vec<String>,
    #[serde(default)]
    pub warning: Option<String>,
    pub tradeoff: String,
    pub scenario: String,
}

/// The unit flowing through the whole pipeline. Providers populate the
/// identity/schedule/itinerary/commercial fields; the currency normalizer,
/// enricher and scoring stages fill in the rest. Derived fields are never
/// written by providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalOffer {
    // Identity.
    pub id: String,
    pub provider: String,
    pub carrier: String,
    pub flight_number: String,

    // Schedule.
    pub departure_time: DateTime<Utc>,
    pub arrival_time: DateTime<Utc>,
    /// Minutes.
    pub duration: i64,
    pub stops: usize,

    // Itinerary.
    pub segments: Vec<Segment>,
    pub layovers: Vec<Layover>,

    // Commercial.
    pub price: f64,
    pub currency: String,
    #[serde(default)]
    pub effective_price: Option<f64>,
    #[serde(default)]
    pub baggage_weight: f64,
    #[serde(default)]
    pub baggage_quantity: u32,
    #[serde(default)]
    pub has_meal: bool,
    #[serde(default)]
    pub has_wifi: bool,
    #[serde(default)]
    pub has_entertainment: bool,
    #[serde(default)]
    pub refundable: bool,
    #[serde(default)]
    pub change_allowed: bool,
    #[serde(default)]
    pub is_self_transfer: bool,

    // Data quality.
    #[serde(default)]
    pub quality_flags: Vec<QualityFlag>,

    // Derived: written only by the scoring stages.
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub scores: Option<ComponentScores>,
    #[serde(default)]
    pub badge: Option<Badge>,
    #[serde(default)]
    pub identity: Option<FlightIdentity>,
    #[serde(default)]
    pub stress: Option<StressMap>,
    #[serde(default)]
    pub verdict: Option<OfferVerdict>,
}

impl CanonicalOffer {
    /// Price the scoring engine sees: effective price when the enricher has
    /// run, nominal price otherwise.
    pub fn scoring_price(&self) -> f64 {
        self.effective_price.unwrap_or(self.price)
    }

    pub fn flag_quality(&mut self, level: QualityLevel, reason: impl Into<String>) {
        self.quality_flags.push(QualityFlag {
            level,
            reason: reason.into(),
        });
    }

    pub fn has_invalid_data(&self) -> bool {
        self.quality_flags
            .iter()
            .any(|f| f.level == QualityLevel::Invalid)
    }
}
