#![allow(clippy::doc_markdown)]
#![doc = include_str!("../README.md")]

mod cli;
mod config;
mod core;
mod inverter;
mod prelude;
mod quantity;
mod render;

use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::{
    cli::{Args, Command, PlanArgs, SimulateArgs, TickArgs},
    config::Config,
    core::{
        balance::balance_inverters,
        executor::Executor,
        plan::{CarPlan, Plan},
        provider::Fixture,
        sim::{InitialState, Outcome, RunMode, Simulation},
        window::Window,
    },
    inverter::{Inverter, simulated::SimulatedInverter},
    prelude::*,
    quantity::{Quantity, energy::KilowattHours},
    render::{render_plan, render_snapshots, render_trace},
};

#[tokio::main]
async fn main() -> Result {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder().with_default_directive(LevelFilter::INFO.into()).from_env_lossy(),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;

    match args.command {
        Command::Simulate(simulate_args) => simulate(&config, &simulate_args),
        Command::Tick(tick_args) => tick(&config, &tick_args).await,
        Command::Balance => balance(&config).await,
        Command::Plan(plan_args) => show_plan(&plan_args),
    }
}

fn load_plan(path: &std::path::Path) -> Result<Plan> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read plan {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("malformed plan {}", path.display()))
}

/// Join the configured car states with the plan's charging slots.
fn merge_cars(config: &Config, plan: &Plan) -> Vec<CarPlan> {
    plan.car_windows
        .iter()
        .enumerate()
        .map(|(car_n, slots)| {
            let mut car = config.cars.get(car_n).cloned().unwrap_or_default();
            car.slots = slots.clone();
            car
        })
        .collect()
}

fn run_simulation(
    config: &Config,
    fixture: &Fixture,
    plan: &Plan,
    minutes_now: i32,
    horizon: i32,
    soc: KilowattHours,
    p10: bool,
    mode: RunMode,
) -> Result<Outcome> {
    plan.verify(&config.battery)?;

    let (pv, load) = fixture.forecast.series(p10);
    let cars = merge_cars(config, plan);
    let iboost = config.iboost.clone().map(|mut iboost| {
        iboost.plan = plan.iboost_windows.clone();
        iboost
    });

    let initial = InitialState {
        minutes_now,
        soc,
        charge_rate_now: config.battery.rate_max_charge,
        discharge_rate_now: config.battery.rate_max_discharge,
        temperature: 20.0,
        ..InitialState::default()
    };

    let charge_windows: Vec<Window> =
        plan.charge_windows.iter().map(|slot| slot.window).collect();
    let charge_limits = plan.charge_limits_kwh(&config.battery);
    let export_windows: Vec<Window> =
        plan.export_windows.iter().map(|slot| slot.window).collect();
    let export_limits = plan.export_limits();

    let simulation = Simulation::builder()
        .battery(&config.battery)
        .flags(&config.flags)
        .keep(&config.keep)
        .rates(&fixture.rates)
        .pv(pv)
        .load(load)
        .cars(&cars)
        .maybe_iboost(iboost.as_ref())
        .maybe_temperature(fixture.forecast.temperature.as_ref())
        .maybe_alert_keep(fixture.forecast.alert_keep.as_ref())
        .initial(initial)
        .forecast_minutes(horizon)
        .build();

    Ok(simulation.run(&charge_windows, &charge_limits, &export_windows, &export_limits, mode))
}

fn simulate(config: &Config, args: &SimulateArgs) -> Result {
    let fixture = Fixture::load(&args.fixture)?;
    let plan = load_plan(&args.plan)?;
    let soc = args.soc.map_or_else(
        || config.inverters.iter().map(|inverter| inverter.soc).sum(),
        Quantity,
    );

    let outcome = run_simulation(
        config,
        &fixture,
        &plan,
        args.minutes_now,
        args.horizon,
        soc,
        args.p10,
        RunMode::Best,
    )?;

    println!("{}", render_plan(&plan));
    println!("{}", render_trace(&outcome, 30));
    info!(
        metric = %format!("{:.1}p", outcome.metric.0),
        keep_penalty = %format!("{:.1}p", outcome.keep_penalty.0),
        import = %format!("{:.2}kWh", outcome.import_kwh.0),
        export = %format!("{:.2}kWh", outcome.export_kwh.0),
        final_soc = %format!("{:.2}kWh", outcome.soc.0),
        soc_min = %format!("{:.2}kWh", outcome.soc_min.0),
        battery_cycle = %format!("{:.2}kWh", outcome.battery_cycle.0),
        clipped = %format!("{:.2}kWh", outcome.clipped_kwh.0),
        "Simulated",
    );
    Ok(())
}

async fn tick(config: &Config, args: &TickArgs) -> Result {
    ensure!(!config.inverters.is_empty(), "no inverters configured");
    let plan = load_plan(&args.plan)?;
    let cars = merge_cars(config, &plan);
    let iboost = config.iboost.clone().map(|mut iboost| {
        iboost.plan = plan.iboost_windows.clone();
        iboost
    });

    // When we have forecast data, score the plan first to learn whether the
    // immersion diverter would be drawing right now.
    let iboost_running_full = match &args.fixture {
        Some(fixture) => {
            let fixture = Fixture::load(fixture)?;
            let soc = config.inverters.iter().map(|inverter| inverter.soc).sum();
            run_simulation(
                config,
                &fixture,
                &plan,
                args.minutes_now,
                24 * 60,
                soc,
                false,
                RunMode::Score,
            )?
            .iboost_running_full
        }
        None => false,
    };

    let mut inverters: Vec<SimulatedInverter> = config
        .inverters
        .iter()
        .enumerate()
        .map(|(id, inverter)| SimulatedInverter::new(id, inverter))
        .collect();
    let mut handles: Vec<&mut dyn Inverter> =
        inverters.iter_mut().map(|inverter| inverter as &mut dyn Inverter).collect();

    let executor = Executor::builder()
        .battery(&config.battery)
        .flags(&config.flags)
        .exec(&config.executor)
        .keep(&config.keep)
        .plan(&plan)
        .cars(&cars)
        .maybe_iboost(iboost.as_ref())
        .iboost_running_full(iboost_running_full)
        .minutes_now(args.minutes_now)
        .build();

    let outcome = executor.tick(&mut handles, args.reset).await;
    drop(handles);

    let snapshots: Vec<_> = inverters.iter().map(Inverter::snapshot).collect();
    println!("{}", render_snapshots(&snapshots));
    info!(
        status = %outcome.status,
        extra = %outcome.status.extra,
        register_writes = outcome.register_writes,
        failures = outcome.failures,
        plan_rejected = outcome.plan_rejected,
        "Tick complete",
    );
    Ok(())
}

async fn balance(config: &Config) -> Result {
    ensure!(config.inverters.len() >= 2, "balancing needs at least two inverters");
    let settings = config.balance.unwrap_or_default();
    let mut inverters: Vec<SimulatedInverter> = config
        .inverters
        .iter()
        .enumerate()
        .map(|(id, inverter)| SimulatedInverter::new(id, inverter))
        .collect();
    let mut handles: Vec<&mut dyn Inverter> =
        inverters.iter_mut().map(|inverter| inverter as &mut dyn Inverter).collect();
    let writes = balance_inverters(&mut handles, &settings).await;
    info!(writes, "Balance pass complete");
    Ok(())
}

fn show_plan(args: &PlanArgs) -> Result {
    let plan = load_plan(&args.plan)?;
    println!("{}", render_plan(&plan));
    if !plan.status.is_empty() {
        info!(status = %plan.status, extra = %plan.status_extra, "Plan status");
    }
    Ok(())
}
