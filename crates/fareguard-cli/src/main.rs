//! Command-line front end: wires the YAML config files and fixture root
//! into the pipeline and prints the ranked result.

use std::path::PathBuf;

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use fareguard_adapters::{CabinClass, SearchQuery};
use fareguard_core::{AirlineTable, CanonicalOffer};
use fareguard_pipeline::{load_rates, load_registry, Pipeline, SearchOutcome};
use fareguard_scoring::group_offers;

#[derive(Parser)]
#[command(name = "fareguard", version, about = "Flight offer aggregation and scoring")]
struct Cli {
    /// Provider registry file.
    #[arg(long, default_value = "providers.yaml")]
    providers: PathBuf,

    /// Currency rate table file.
    #[arg(long, default_value = "rates.yaml")]
    rates: PathBuf,

    /// Root directory holding per-provider offer fixtures.
    #[arg(long, default_value = "fixtures")]
    fixtures: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Search all enabled providers and print the ranked offer list.
    Search {
        /// Origin airport (IATA).
        origin: String,
        /// Destination airport (IATA).
        destination: String,
        /// Departure date (YYYY-MM-DD).
        #[arg(long)]
        date: NaiveDate,
        #[arg(long, default_value_t = 1)]
        passengers: u32,
        #[arg(long, default_value = "economy")]
        cabin: CabinClass,
        /// Display currency.
        #[arg(long, default_value = "USD")]
        currency: String,
        /// Cluster fare variants of the same physical flight.
        #[arg(long)]
        group: bool,
        /// Emit the full outcome as JSON instead of the table.
        #[arg(long)]
        json: bool,
    },
    /// List the configured providers.
    Providers,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Search {
            origin,
            destination,
            date,
            passengers,
            cabin,
            currency,
            group,
            json,
        } => {
            let registry = load_registry(&cli.providers)?;
            let rates = load_rates(&cli.rates)?;
            let pipeline = Pipeline::from_registry(
                &registry,
                &cli.fixtures,
                AirlineTable::builtin(),
                rates,
                &currency,
            );
            let query = SearchQuery::new(&origin, &destination, date, passengers, cabin);
            let outcome = pipeline.search(&query).await;

            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else if group {
                print_grouped(outcome);
            } else {
                print_ranked(&outcome);
            }
        }
        Command::Providers => {
            let registry = load_registry(&cli.providers)?;
            for provider in &registry.providers {
                let state = if provider.enabled { "enabled" } else { "disabled" };
                println!("{:<12} {:<20} {state}", provider.id, provider.name);
            }
        }
    }
    Ok(())
}

fn print_ranked(outcome: &SearchOutcome) {
    if outcome.offers.is_empty() {
        println!("no offers found");
        return;
    }
    if outcome.partial {
        println!("warning: offers could not be scored (no usable prices or durations)");
    }

    for (rank, offer) in outcome.offers.iter().enumerate() {
        print_offer(rank + 1, offer);
    }

    if let Some(stats) = &outcome.stats {
        println!(
            "\n{} offers | cheapest {:.0} | reference {:.0} | median {:.0} | fastest {}",
            outcome.offers.len(),
            stats.min_price,
            stats.reference_price,
            stats.median_price,
            fmt_minutes(stats.min_duration),
        );
    }
    for count in &outcome.provider_counts {
        println!("  {}: {} offers", count.provider, count.offers);
    }
    println!("run {}", outcome.run_id);
}

fn print_grouped(outcome: SearchOutcome) {
    let run_id = outcome.run_id;
    let groups = group_offers(outcome.offers);
    if groups.is_empty() {
        println!("no offers found");
        return;
    }
    for group in &groups {
        println!(
            "{} {} -> {} ({} fare variants, from {:.0})",
            group.carrier,
            group.departure_time.format("%Y-%m-%d %H:%M"),
            group.arrival_time.format("%H:%M"),
            group.variant_count(),
            group.cheapest_price(),
        );
        print_offer(1, &group.best);
        for (idx, option) in group.options.iter().enumerate() {
            print_offer(idx + 2, option);
        }
        println!();
    }
    println!("run {run_id}");
}

fn print_offer(rank: usize, offer: &CanonicalOffer) {
    let score = offer
        .score
        .map(|s| format!("{s:.1}"))
        .unwrap_or_else(|| "-".to_string());
    let badge = offer
        .badge
        .map(|b| format!("{b:?}"))
        .unwrap_or_else(|| "-".to_string());
    let stops = match offer.stops {
        0 => "non-stop".to_string(),
        1 => "1 stop".to_string(),
        n => format!("{n} stops"),
    };
    println!(
        "#{rank:<3} {:<6} {score:>4}  {badge:<10} {:>8.0} {}  {}  {stops}",
        offer.flight_number,
        offer.price,
        offer.currency,
        fmt_minutes(offer.duration),
    );
    if let Some(identity) = &offer.identity {
        println!("      {} {}", identity.emoji, identity.label);
    }
    if let Some(verdict) = &offer.verdict {
        if !verdict.badges.is_empty() {
            println!("      [{}]", verdict.badges.join(", "));
        }
        println!("      {}", verdict.tradeoff);
        if let Some(warning) = &verdict.warning {
            println!("      ! {warning}");
        }
    }
}

fn fmt_minutes(minutes: i64) -> String {
    format!("{}h {:02}m", minutes / 60, minutes % 60)
}
