use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about, propagate_version = true)]
pub struct Args {
    /// Path to the TOML configuration.
    #[clap(long, env = "NOCTULE_CONFIG", default_value = "noctule.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the forward model over the horizon and print the trace.
    Simulate(SimulateArgs),

    /// Run one executor tick against the configured simulated inverters.
    Tick(TickArgs),

    /// Run one balancing pass across the configured inverters.
    Balance,

    /// Print the plan's windows.
    Plan(PlanArgs),
}

#[derive(Parser)]
pub struct SimulateArgs {
    /// Rates-and-forecast fixture (JSON).
    #[clap(long, env = "NOCTULE_FIXTURE")]
    pub fixture: PathBuf,

    /// Plan artifact (JSON).
    #[clap(long, env = "NOCTULE_PLAN")]
    pub plan: PathBuf,

    /// Use the pessimistic (p10) forecast pair.
    #[clap(long)]
    pub p10: bool,

    /// Current minute on the horizon clock.
    #[clap(long, default_value = "0")]
    pub minutes_now: i32,

    /// Horizon length in minutes.
    #[clap(long, default_value = "2880")]
    pub horizon: i32,

    /// Starting state of charge in kWh; defaults to the configured
    /// inverters' total.
    #[clap(long)]
    pub soc: Option<f64>,
}

#[derive(Parser)]
pub struct TickArgs {
    /// Plan artifact (JSON).
    #[clap(long, env = "NOCTULE_PLAN")]
    pub plan: PathBuf,

    /// Rates-and-forecast fixture; when given, the tick first scores the
    /// plan to learn whether the diverter would be running.
    #[clap(long, env = "NOCTULE_FIXTURE")]
    pub fixture: Option<PathBuf>,

    /// Current minute on the horizon clock.
    #[clap(long, default_value = "0")]
    pub minutes_now: i32,

    /// Force the safe-mode reset prelude before the tick.
    #[clap(long)]
    pub reset: bool,
}

#[derive(Parser)]
pub struct PlanArgs {
    /// Plan artifact (JSON).
    #[clap(long, env = "NOCTULE_PLAN")]
    pub plan: PathBuf,
}
