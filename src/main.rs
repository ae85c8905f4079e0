use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wakelight_controller::*;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate a complete wake-up ramp with accelerated steps
    Demo {
        /// Milliseconds between brightness steps
        #[arg(short, long, default_value_t = 250)]
        step_ms: u64,
        /// Lead-in minutes (one step is simulated per minute)
        #[arg(short, long, default_value_t = 10)]
        lead_in: u32,
        /// Ramp each fixture independently instead of equalizing first
        #[arg(long)]
        independent: bool,
    },
    /// Print the daily trigger time for a wake time and lead-in
    TriggerTime {
        /// Wake time (HH:MM:SS)
        #[arg(short, long)]
        wake: String,
        /// Lead-in minutes
        #[arg(short, long, default_value_t = 30)]
        lead_in: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with a sensible default filter
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| EnvFilter::new("wakelight_controller=info,wakec=info")),
        )
        .compact()
        .init();

    // Initialize color-eyre for pretty error reporting
    color_eyre::install()?;

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Demo {
        step_ms: 250,
        lead_in: 10,
        independent: false,
    }) {
        Commands::Demo {
            step_ms,
            lead_in,
            independent,
        } => {
            run_demo(step_ms, lead_in, independent).await?;
        }
        Commands::TriggerTime { wake, lead_in } => {
            let wake = chrono::NaiveTime::parse_from_str(&wake, "%H:%M:%S")?;
            let lead_in = lead_in.max(MIN_LEAD_IN_MIN);
            println!("{}", trigger_time(wake, lead_in));
        }
    }

    Ok(())
}

/// Drive a complete ramp against the in-process services and print every
/// brightness command once it finishes.
async fn run_demo(step_ms: u64, lead_in: u32, independent: bool) -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.set("input_datetime.wake_time", "06:30:00");
    store.set("input_number.lead_in", &lead_in.to_string());
    store.register("light.bed_left");
    store.register("light.bed_right");

    let lights = Arc::new(MemoryLights::new());
    lights.seed("light.bed_left", 60);
    lights.seed("light.bed_right", 40);

    let mut config = AlarmConfig::new(
        "input_datetime.wake_time",
        ["light.bed_left", "light.bed_right"],
    );
    config.lead_in_entity = Some("input_number.lead_in".into());
    config.dim_mode = if independent {
        DimMode::Level
    } else {
        DimMode::Scale
    };
    config.step_interval = Duration::from_millis(step_ms);

    let alarm = SunriseAlarm::start(config, store, lights.clone(), Arc::new(SystemClock))?;
    info!(
        "demo alarm armed for {}, simulating a trigger fire",
        alarm.status().trigger_time
    );

    alarm.trigger_now().await;
    while alarm.status().running {
        tokio::time::sleep(Duration::from_millis(step_ms)).await;
    }

    for (fixture, level) in lights.commands() {
        println!("{fixture} -> {level:.1}");
    }
    info!("demo completed!");

    Ok(())
}
