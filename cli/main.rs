#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;

use cltv::diagnostics::{frequency_monetary_correlation, period_transactions};
use cltv::optimize::FitReport;
use cltv::pipeline::{self, CustomerProjection};
use cltv::report::{top_by_lifetime_value, write_projections_csv};
use cltv::{CustomerSummary, ForecastConfig};

#[derive(Args)]
pub struct ForecastArgs {
    /// Path to the customer table (master_id, first_order_date, last_order_date, order and spend totals per channel)
    pub input: PathBuf,

    /// TOML configuration file; defaults are used when omitted
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Where to write the per-customer forecast
    #[arg(long, default_value = "cltv_forecast.csv")]
    pub output: PathBuf,

    /// Number of highest-value customers to print
    #[arg(long, default_value = "20")]
    pub top: usize,
}

#[derive(Args)]
pub struct FitArgs {
    /// Path to the customer table
    pub input: PathBuf,

    /// TOML configuration file; defaults are used when omitted
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Largest purchase count shown separately in the calibration table
    #[arg(long, default_value = "7")]
    pub max_frequency: u32,
}

#[derive(Parser)]
#[command(
    name = "cltv",
    about = "Probabilistic customer lifetime value forecasting",
    long_about = "Fits the BG/NBD purchase model and the Gamma-Gamma spend model to a customer \
                 table, then projects discounted lifetime value and segments customers by it."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fit both models and forecast every customer (outputs: cltv_forecast.csv)")]
    Forecast(ForecastArgs),
    #[command(about = "Fit both models and print parameters and diagnostics")]
    Fit(FitArgs),
    #[command(about = "Print the default configuration as TOML")]
    DefaultConfig,
}

fn load_config(path: Option<&Path>) -> Result<ForecastConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            println!("Loading configuration from: {}", path.display());
            Ok(ForecastConfig::load(path)?)
        }
        None => Ok(ForecastConfig::default()),
    }
}

fn describe_fit(model: &str, parameters: &str, report: &FitReport) {
    let status = if report.converged {
        "converged"
    } else {
        "NOT converged"
    };
    println!(
        "{model}: {parameters} ({status}, objective {:.6}, {} evaluations)",
        report.objective, report.evaluations
    );
    if let Some(message) = &report.message {
        println!("  optimizer stopped: {message}");
    }
}

fn print_top(projections: &[CustomerProjection], n: usize) {
    if n == 0 {
        return;
    }
    println!();
    println!(
        "{:<38} {:>6} {:>9} {:>9} {:>8} {:>10} {:>12} {:>4}",
        "customer_id", "freq", "exp_12w", "exp_24w", "p_alive", "exp_value", "cltv", "seg"
    );
    for p in top_by_lifetime_value(projections, n) {
        println!(
            "{:<38} {:>6} {:>9.3} {:>9.3} {:>8.3} {:>10.2} {:>12.2} {:>4}",
            p.customer_id,
            p.frequency,
            p.expected_transactions_short,
            p.expected_transactions_long,
            p.probability_active,
            p.expected_average_profit,
            p.lifetime_value,
            p.segment
        );
    }
}

fn run_forecast(args: ForecastArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args.config.as_deref())?;
    let customers = pipeline::load_customers(&args.input, &config)?;
    println!("Loaded {} customers from {}", customers.len(), args.input.display());

    let forecast = pipeline::run(&customers, &config)?;
    let t = forecast.timing.params;
    let m = forecast.monetary.params;
    describe_fit(
        "BG/NBD",
        &format!("r={:.4} alpha={:.4} a={:.4} b={:.4}", t.r, t.alpha, t.a, t.b),
        &forecast.timing.report,
    );
    describe_fit(
        "Gamma-Gamma",
        &format!("p={:.4} q={:.4} v={:.4}", m.p, m.q, m.v),
        &forecast.monetary.report,
    );

    println!();
    println!("{:<8} {:>8} {:>14} {:>16}", "segment", "count", "mean_cltv", "total_cltv");
    for tier in forecast.segments.iter().rev() {
        let mean = tier
            .mean
            .map(|v| format!("{v:.2}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<8} {:>8} {:>14} {:>16.2}",
            tier.label, tier.count, mean, tier.sum
        );
    }

    print_top(&forecast.projections, args.top);

    write_projections_csv(&args.output, &forecast.projections)?;
    println!();
    println!("Forecast saved to: {}", args.output.display());
    Ok(())
}

fn run_fit(args: FitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args.config.as_deref())?;
    let customers = pipeline::load_customers(&args.input, &config)?;
    println!("Loaded {} customers from {}", customers.len(), args.input.display());

    let (timing, monetary) = pipeline::fit_models(&customers, &config)?;
    let t = timing.params;
    let m = monetary.params;
    describe_fit(
        "BG/NBD",
        &format!("r={:.4} alpha={:.4} a={:.4} b={:.4}", t.r, t.alpha, t.a, t.b),
        &timing.report,
    );
    describe_fit(
        "Gamma-Gamma",
        &format!("p={:.4} q={:.4} v={:.4}", m.p, m.q, m.v),
        &monetary.report,
    );
    match m.population_mean() {
        Ok(mean) => println!("Population mean spend per transaction: {mean:.2}"),
        Err(e) => println!("Population mean spend per transaction: undefined ({e})"),
    }

    let timing_samples: Vec<_> = customers
        .iter()
        .map(CustomerSummary::timing_observation)
        .collect();
    let monetary_samples: Vec<_> = customers
        .iter()
        .filter(|c| c.frequency > 0)
        .map(CustomerSummary::monetary_observation)
        .collect();
    if let Some(rho) = frequency_monetary_correlation(&monetary_samples) {
        println!("Frequency/spend correlation among repeat buyers: {rho:.3}");
    }

    println!();
    println!("{:>10} {:>10} {:>12}", "frequency", "observed", "model");
    for row in period_transactions(&t, &timing_samples, args.max_frequency)? {
        let label = if row.is_tail {
            format!("{}+", row.frequency)
        } else {
            row.frequency.to_string()
        };
        println!("{:>10} {:>10} {:>12.1}", label, row.observed, row.expected);
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Forecast(args)) => run_forecast(args),
        Some(Commands::Fit(args)) => run_fit(args),
        Some(Commands::DefaultConfig) => ForecastConfig::default()
            .to_toml()
            .map(|text| print!("{text}"))
            .map_err(|e| e.into()),
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(|e| e.into()),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
