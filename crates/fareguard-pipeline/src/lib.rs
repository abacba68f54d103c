//! Search orchestration: fans one query out to every registered provider
//! adapter concurrently, then runs the merged batch through currency
//! normalization, deduplication, enrichment, scoring and insights. A
//! failing or slow provider costs its own offers, never the search.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fareguard_adapters::{fixture_adapter_for, ProviderAdapter, SearchQuery};
use fareguard_core::{AirlineTable, CanonicalOffer, QualityLevel, RateTable};
use fareguard_scoring::{apply_insights, enrich_all, score_batch, BatchStats};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

pub const DEFAULT_ADAPTER_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------
// Configuration files: provider registry + currency rate table, both
// plain YAML at the workspace root.
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRegistry {
    pub providers: Vec<ProviderConfig>,
}

impl ProviderRegistry {
    pub fn enabled(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.providers.iter().filter(|p| p.enabled)
    }
}

pub fn load_registry(path: &Path) -> Result<ProviderRegistry> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading provider registry {}", path.display()))?;
    serde_yaml::from_str(&text)
        .with_context(|| format!("parsing provider registry {}", path.display()))
}

pub fn load_rates(path: &Path) -> Result<RateTable> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading rate table {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing rate table {}", path.display()))
}

// ---------------------------------------------------------------------
// Search outcome
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderCount {
    pub provider: String,
    pub offers: usize,
}

/// Everything one search run produces. `partial` is set when offers came
/// back but none carried usable prices or durations, so they are returned
/// unscored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchOutcome {
    pub run_id: Uuid,
    pub offers: Vec<CanonicalOffer>,
    pub stats: Option<BatchStats>,
    pub partial: bool,
    pub provider_counts: Vec<ProviderCount>,
}

// ---------------------------------------------------------------------
// Currency normalization
// ---------------------------------------------------------------------

fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

/// Converts every offer into the target currency through the reference
/// currency. Unknown codes fall back to a 1:1 rate and the offer is tagged
/// LowConfidence rather than dropped.
pub fn normalize_currency(
    offers: Vec<CanonicalOffer>,
    target: &str,
    rates: &RateTable,
) -> Vec<CanonicalOffer> {
    offers
        .into_iter()
        .map(|mut offer| {
            if offer.currency == target {
                return offer;
            }
            let source = offer.currency.clone();
            let mut unknown: Option<String> = None;
            let from = rates.units_per_reference(&source).unwrap_or_else(|| {
                unknown = Some(source.clone());
                1.0
            });
            let to = rates.units_per_reference(target).unwrap_or_else(|| {
                unknown = Some(target.to_string());
                1.0
            });
            let factor = to / from;
            offer.price = round_cents(offer.price * factor);
            offer.effective_price = offer.effective_price.map(|p| round_cents(p * factor));
            offer.currency = target.to_string();
            if let Some(code) = unknown {
                warn!(offer = %offer.id, currency = %code, "no rate for currency, converted 1:1");
                offer.flag_quality(
                    QualityLevel::LowConfidence,
                    format!("no rate for {code}, converted 1:1"),
                );
            }
            offer
        })
        .collect()
}

// ---------------------------------------------------------------------
// Deduplication
// ---------------------------------------------------------------------

fn dedup_signature(offer: &CanonicalOffer) -> (String, String, i64) {
    (
        offer.carrier.clone(),
        offer.departure_time.to_rfc3339(),
        offer.price.round() as i64,
    )
}

/// True when the challenger should replace the incumbent under the same
/// signature: a ticketed through-fare beats a self-transfer listing, then
/// strictly lower price wins.
fn prefers(challenger: &CanonicalOffer, incumbent: &CanonicalOffer) -> bool {
    if challenger.is_self_transfer != incumbent.is_self_transfer {
        return !challenger.is_self_transfer;
    }
    challenger.price < incumbent.price
}

/// Collapses offers describing the same physical flight at the same fare.
/// Runs downstream of currency normalization so the rounded-price part of
/// the signature compares like with like. Idempotent.
pub fn dedup_offers(offers: Vec<CanonicalOffer>) -> Vec<CanonicalOffer> {
    let mut kept: Vec<CanonicalOffer> = Vec::with_capacity(offers.len());
    let mut index: HashMap<(String, String, i64), usize> = HashMap::new();
    for offer in offers {
        let signature = dedup_signature(&offer);
        match index.get(&signature) {
            Some(&slot) => {
                if prefers(&offer, &kept[slot]) {
                    kept[slot] = offer;
                }
            }
            None => {
                index.insert(signature, kept.len());
                kept.push(offer);
            }
        }
    }
    kept
}

// ---------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------

pub struct Pipeline {
    adapters: Vec<Arc<dyn ProviderAdapter>>,
    airlines: AirlineTable,
    rates: RateTable,
    target_currency: String,
    adapter_timeout: Duration,
}

impl Pipeline {
    pub fn new(airlines: AirlineTable, rates: RateTable, target_currency: &str) -> Self {
        Self {
            adapters: Vec::new(),
            airlines,
            rates,
            target_currency: target_currency.to_string(),
            adapter_timeout: DEFAULT_ADAPTER_TIMEOUT,
        }
    }

    /// Builds a pipeline with one fixture adapter per enabled registry
    /// entry. Entries without a known adapter are skipped with a warning,
    /// so a stale registry never takes the whole search down.
    pub fn from_registry(
        registry: &ProviderRegistry,
        fixtures_root: &Path,
        airlines: AirlineTable,
        rates: RateTable,
        target_currency: &str,
    ) -> Self {
        let mut pipeline = Self::new(airlines, rates, target_currency);
        for provider in registry.enabled() {
            match fixture_adapter_for(&provider.id, fixtures_root) {
                Some(adapter) => pipeline = pipeline.register(adapter),
                None => warn!(provider = %provider.id, "no adapter for registry entry, skipping"),
            }
        }
        pipeline
    }

    pub fn register(mut self, adapter: Box<dyn ProviderAdapter>) -> Self {
        self.adapters.push(Arc::from(adapter));
        self
    }

    pub fn with_adapter_timeout(mut self, timeout: Duration) -> Self {
        self.adapter_timeout = timeout;
        self
    }

    pub fn provider_ids(&self) -> Vec<&'static str> {
        self.adapters.iter().map(|a| a.provider_id()).collect()
    }

    /// Runs one search end to end. Infallible by contract: provider
    /// failures and empty batches degrade the outcome, never abort it.
    pub async fn search(&self, query: &SearchQuery) -> SearchOutcome {
        let run_id = Uuid::new_v4();
        info!(
            run_id = %run_id,
            origin = %query.origin,
            destination = %query.destination,
            providers = self.adapters.len(),
            "starting search"
        );

        let mut tasks = JoinSet::new();
        for adapter in &self.adapters {
            let adapter = Arc::clone(adapter);
            let query = query.clone();
            let timeout = self.adapter_timeout;
            tasks.spawn(async move {
                let provider = adapter.provider_id();
                match tokio::time::timeout(timeout, adapter.search(&query)).await {
                    Ok(Ok(offers)) => (provider, offers),
                    Ok(Err(err)) => {
                        warn!(provider, error = %err, "adapter failed, contributing zero offers");
                        (provider, Vec::new())
                    }
                    Err(_) => {
                        warn!(
                            provider,
                            timeout_ms = timeout.as_millis() as u64,
                            "adapter timed out, contributing zero offers"
                        );
                        (provider, Vec::new())
                    }
                }
            });
        }

        let mut merged = Vec::new();
        let mut provider_counts = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((provider, offers)) => {
                    provider_counts.push(ProviderCount {
                        provider: provider.to_string(),
                        offers: offers.len(),
                    });
                    merged.extend(offers);
                }
                Err(err) => warn!(error = %err, "adapter task failed to join"),
            }
        }
        provider_counts.sort_by(|a, b| a.provider.cmp(&b.provider));

        let normalized = normalize_currency(merged, &self.target_currency, &self.rates);
        let deduped = dedup_offers(normalized);
        let enriched = enrich_all(deduped, &self.airlines);
        let scored = score_batch(enriched, &self.airlines);

        let stats = scored.stats;
        let (offers, partial) = match stats {
            Some(ref s) => (apply_insights(scored.offers, s), false),
            None => {
                let partial = !scored.offers.is_empty();
                (scored.offers, partial)
            }
        };

        info!(
            run_id = %run_id,
            offers = offers.len(),
            partial,
            "search complete"
        );

        SearchOutcome {
            run_id,
            offers,
            stats,
            partial,
            provider_counts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn offer(id: &str, carrier: &str, price: f64, currency: &str) -> CanonicalOffer {
        let dep = Utc.with_ymd_and_hms(2026, 4, 2, 9, 0, 0).single().unwrap();
        CanonicalOffer {
            id: id.to_string(),
            provider: "test".to_string(),
            carrier: carrier.to_string(),
            flight_number: format!("{carrier}100"),
            departure_time: dep,
            arrival_time: dep + chrono::Duration::minutes(645),
            duration: 645,
            stops: 0,
            segments: vec![],
            layovers: vec![],
            price,
            currency: currency.to_string(),
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

    fn usd_rates() -> RateTable {
        RateTable {
            reference_currency: "USD".to_string(),
            rates: std::collections::HashMap::from([
                ("EUR".to_string(), 0.92),
                ("GBP".to_string(), 0.79),
            ]),
        }
    }

    #[test]
    fn currency_conversion_goes_through_the_reference() {
        let rates = usd_rates();
        let converted = normalize_currency(vec![offer("a", "TK", 92.0, "EUR")], "USD", &rates);
        assert_eq!(converted[0].price, 100.0);
        assert_eq!(converted[0].currency, "USD");
        assert!(converted[0].quality_flags.is_empty());

        // EUR -> GBP without touching USD amounts directly.
        let cross = normalize_currency(vec![offer("b", "TK", 92.0, "EUR")], "GBP", &rates);
        assert_eq!(cross[0].price, 79.0);
        assert_eq!(cross[0].currency, "GBP");
    }

    #[test]
    fn unknown_currency_falls_back_one_to_one_with_flag() {
        let rates = usd_rates();
        let converted = normalize_currency(vec![offer("a", "TK", 500.0, "XXX")], "USD", &rates);
        assert_eq!(converted[0].price, 500.0);
        assert_eq!(converted[0].currency, "USD");
        assert_eq!(
            converted[0].quality_flags[0].level,
            QualityLevel::LowConfidence
        );
    }

    #[test]
    fn same_currency_offers_pass_through_untouched() {
        let rates = usd_rates();
        let converted = normalize_currency(vec![offer("a", "TK", 500.55, "USD")], "USD", &rates);
        assert_eq!(converted[0].price, 500.55);
        assert!(converted[0].quality_flags.is_empty());
    }

    #[test]
    fn dedup_prefers_ticketed_fares_then_lower_price() {
        let mut self_transfer = offer("st", "TK", 820.3, "USD");
        self_transfer.is_self_transfer = true;
        let ticketed = offer("ok", "TK", 819.7, "USD");

        // Same signature: both round to 820 with identical carrier and
        // departure. The ticketed fare wins regardless of input order.
        let kept = dedup_offers(vec![self_transfer.clone(), ticketed.clone()]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "ok");
        let kept = dedup_offers(vec![ticketed.clone(), self_transfer]);
        assert_eq!(kept[0].id, "ok");

        let pricier = offer("pricier", "TK", 820.4, "USD");
        let kept = dedup_offers(vec![pricier, ticketed]);
        assert_eq!(kept[0].id, "ok");
    }

    #[test]
    fn dedup_keeps_distinct_signatures_and_is_idempotent() {
        let a = offer("a", "TK", 820.0, "USD");
        let mut b = offer("b", "TK", 820.0, "USD");
        b.departure_time += chrono::Duration::hours(6);
        let c = offer("c", "QR", 820.0, "USD");

        let once = dedup_offers(vec![a, b, c]);
        assert_eq!(once.len(), 3);
        let twice = dedup_offers(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn registry_parses_and_filters_disabled_providers() {
        let yaml = "
providers:
  - id: farejet
    name: FareJet
  - id: skyhop
    name: SkyHop
    enabled: false
";
        let registry: ProviderRegistry = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(registry.providers.len(), 2);
        let enabled: Vec<&str> = registry.enabled().map(|p| p.id.as_str()).collect();
        assert_eq!(enabled, vec!["farejet"]);
    }

    #[test]
    fn registry_entries_without_adapters_are_skipped() {
        let registry = ProviderRegistry {
            providers: vec![ProviderConfig {
                id: "nope".to_string(),
                name: "No Such Provider".to_string(),
                enabled: true,
            }],
        };
        let pipeline = Pipeline::from_registry(
            &registry,
            Path::new("fixtures"),
            AirlineTable::builtin(),
            usd_rates(),
            "USD",
        );
        assert!(pipeline.provider_ids().is_empty());
    }
}
