use chrono::Duration;
use clap::{Parser, Subcommand};
use dosewise_core::*;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "dosewise")]
#[command(about = "Active substance levels and synergy tracker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Use this config file instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Show current active levels and insights (default)
    Status,

    /// Log a dose
    Log {
        /// Substance id (see `dosewise substances`)
        substance: String,

        /// Amount in the substance's unit
        #[arg(allow_hyphen_values = true)]
        amount: f64,

        /// Record the dose as taken this many minutes ago
        #[arg(long)]
        minutes_ago: Option<u32>,
    },

    /// List today's doses
    Today,

    /// List the registered substances
    Substances,

    /// Print levels every time they are recomputed
    Watch {
        /// Stop after this many reports
        #[arg(long)]
        ticks: Option<usize>,

        /// Override the recomputation interval
        #[arg(long)]
        interval_secs: Option<u64>,
    },

    /// How long until a substance drops below a level
    ClearTime {
        substance: String,
        threshold: f64,
    },

    /// Export the dose log to CSV
    Export { path: PathBuf },

    /// Import doses from a CSV export
    Import { path: PathBuf },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    dosewise_core::logging::init_for_verbosity(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(dir) = cli.data_dir {
        config.data.data_dir = dir;
    }
    tracing::debug!("Using data directory {:?}", config.data.data_dir);

    match cli.command {
        Some(Commands::Status) | None => cmd_status(&config),
        Some(Commands::Log {
            substance,
            amount,
            minutes_ago,
        }) => cmd_log(&config, substance, amount, minutes_ago),
        Some(Commands::Today) => cmd_today(&config),
        Some(Commands::Substances) => cmd_substances(&config),
        Some(Commands::Watch {
            ticks,
            interval_secs,
        }) => cmd_watch(config, ticks, interval_secs),
        Some(Commands::ClearTime {
            substance,
            threshold,
        }) => cmd_clear_time(&config, substance, threshold),
        Some(Commands::Export { path }) => cmd_export(&config, path),
        Some(Commands::Import { path }) => cmd_import(&config, path),
    }
}

fn cmd_status(config: &Config) -> Result<()> {
    let tracker = Tracker::open(config)?;
    display_report(&tracker, &tracker.current_snapshots());
    Ok(())
}

fn cmd_log(
    config: &Config,
    substance: String,
    amount: f64,
    minutes_ago: Option<u32>,
) -> Result<()> {
    let tracker = Tracker::open(config)?;
    let at = match minutes_ago {
        Some(minutes) => Some(
            tracker
                .clock()
                .now()
                .checked_sub_signed(Duration::minutes(i64::from(minutes)))
                .ok_or_else(|| {
                    Error::Validation(format!("{} minutes ago is out of range", minutes))
                })?,
        ),
        None => None,
    };

    let event = tracker.log_dose(&SubstanceId::new(substance), amount, at)?;
    let unit = tracker
        .registry()
        .get(&event.substance)
        .map(|s| s.unit)
        .unwrap_or(DoseUnit::Milligrams);

    println!(
        "✓ Logged {} of {}",
        format_amount(event.amount, unit),
        event.substance
    );
    display_report(&tracker, &tracker.current_snapshots());
    Ok(())
}

fn cmd_today(config: &Config) -> Result<()> {
    let tracker = Tracker::open(config)?;
    let doses = tracker.todays_log()?;

    if doses.is_empty() {
        println!("No doses logged today.");
        return Ok(());
    }

    println!("Today's log:");
    for dose in doses {
        println!("  {}  {:<12} {}", dose.time, dose.substance_name, dose.amount);
    }
    Ok(())
}

fn cmd_substances(config: &Config) -> Result<()> {
    let registry = config.build_registry()?;
    for substance in registry.iter() {
        println!(
            "  {:<12} {:<12} half-life {:<8} reference {}",
            substance.id.as_str(),
            substance.name,
            format_duration(substance.half_life),
            format_amount(substance.reference_dose, substance.unit)
        );
    }
    Ok(())
}

fn cmd_watch(mut config: Config, ticks: Option<usize>, interval_secs: Option<u64>) -> Result<()> {
    if let Some(secs) = interval_secs {
        config.engine.tick_interval_secs = secs;
    }

    let tracker = Tracker::open(&config)?;
    tracker.start();
    let subscription = tracker.subscribe();

    let mut seen = 0;
    while let Some(report) = subscription.recv() {
        println!("── {} ──", report.computed_at.format("%Y-%m-%d %H:%M:%S"));
        display_report(&tracker, &report);
        seen += 1;
        if ticks.is_some_and(|limit| seen >= limit) {
            break;
        }
    }

    drop(subscription);
    tracker.stop();
    Ok(())
}

fn cmd_clear_time(config: &Config, substance: String, threshold: f64) -> Result<()> {
    let tracker = Tracker::open(config)?;
    let id = SubstanceId::new(substance);

    match tracker.time_until_below(&id, threshold)? {
        Some(wait) if wait.is_zero() => println!("{} is already below {}.", id, threshold),
        Some(wait) => println!("{} drops below {} in {}.", id, threshold, format_duration(wait)),
        None => println!("{} never fully clears.", id),
    }
    Ok(())
}

fn cmd_export(config: &Config, path: PathBuf) -> Result<()> {
    let tracker = Tracker::open(config)?;
    let count = dosewise_core::export::export_csv(&tracker.all_events(), &path)?;
    println!("✓ Exported {} doses to {}", count, path.display());
    Ok(())
}

fn cmd_import(config: &Config, path: PathBuf) -> Result<()> {
    let tracker = Tracker::open(config)?;
    let events = dosewise_core::export::read_csv(&path)?;
    let total = events.len();
    let imported = tracker.import(events)?;
    println!("✓ Imported {} of {} doses", imported, total);
    Ok(())
}

fn display_report(tracker: &Tracker, report: &LevelReport) {
    let registry = tracker.registry();
    let offset = tracker.clock().local_offset(report.computed_at);

    println!();
    println!("  Active levels");
    for snapshot in &report.snapshots {
        let Some(substance) = registry.get(&snapshot.substance) else {
            continue;
        };
        let mut line = format!(
            "  {:<12} {:>8}  {:>4.0}% of reference",
            substance.name,
            format_amount(snapshot.current_amount, substance.unit),
            snapshot.fraction_of_reference * 100.0
        );
        if let Some(peak) = snapshot.expected_peak_at {
            line.push_str(&format!(
                "  (peaks ~{})",
                peak.with_timezone(&offset).format("%H:%M")
            ));
        }
        println!("{}", line);
    }

    if !report.insights.is_empty() {
        println!();
        println!("  Insights");
        for insight in &report.insights {
            let marker = match insight.tone {
                InsightTone::Beneficial => "✓",
                InsightTone::Caution => "!",
            };
            println!("  {} {}", marker, insight.message);
        }
    }
    println!();
}
