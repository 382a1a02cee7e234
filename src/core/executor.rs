use bon::Builder;
use enumset::{EnumSet, EnumSetType};
use serde::{Deserialize, Serialize};

use crate::{
    core::{
        MINUTES_PER_DAY,
        aggregate::{Aggregate, split_target},
        battery::{BatteryParameters, Coupling},
        error::InverterError,
        iboost::IBoostParameters,
        plan::{CarPlan, ExportLimit, Plan},
        sim::{KeepSettings, SimFlags},
        window::{Window, merge_contiguous},
    },
    inverter::{Capability, Inverter, InverterSnapshot, PauseMode},
    prelude::*,
    quantity::{Quantity, energy::KilowattHours},
};

const SOC_EPSILON: f64 = 1e-9;

/// Base status of one executor tick.
#[derive(Copy, Clone, Debug, Eq, PartialEq, derive_more::Display)]
pub enum Status {
    #[display("Demand")]
    Demand,

    #[display("Demand (Holiday)")]
    DemandHoliday,

    #[display("Read-Only")]
    ReadOnly,

    #[display("Calibration")]
    Calibration,

    #[display("Charging")]
    Charging,

    #[display("Freeze charging")]
    FreezeCharging,

    #[display("Hold charging")]
    HoldCharging,

    #[display("Exporting")]
    Exporting,

    #[display("Freeze exporting")]
    FreezeExporting,

    #[display("Hold exporting")]
    HoldExporting,
}

/// Discharge holds stacked on top of the base status.
#[derive(Debug, EnumSetType, derive_more::Display)]
pub enum Hold {
    #[display("Hold for car")]
    Car,

    #[display("Hold for iBoost")]
    IBoost,
}

/// Composed status line: one base state plus any holds.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TickStatus {
    pub base: Status,
    pub holds: EnumSet<Hold>,
    pub extra: String,
}

impl std::fmt::Display for TickStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.base == Status::Demand && !self.holds.is_empty() {
            let mut first = true;
            for hold in self.holds {
                if !first {
                    write!(f, ", ")?;
                }
                write!(f, "{hold}")?;
                first = false;
            }
            return Ok(());
        }
        write!(f, "{}", self.base)?;
        for hold in self.holds {
            write!(f, ", {hold}")?;
        }
        Ok(())
    }
}

/// Executor-only settings; the behaviour flags shared with the simulator
/// live in [`SimFlags`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorFlags {
    pub set_soc_enable: bool,
    pub set_reserve_hold: bool,
    pub read_only: bool,

    /// How long before a window start the registers get programmed.
    pub set_window_minutes: i32,

    /// How long before a window start the target state of charge is set.
    pub set_soc_minutes: i32,

    /// AC-coupled systems park the target at 100% when idle so PV is kept.
    pub inverter_soc_reset: bool,

    pub holiday: bool,
}

impl Default for ExecutorFlags {
    fn default() -> Self {
        Self {
            set_soc_enable: true,
            set_reserve_hold: true,
            read_only: false,
            set_window_minutes: 30,
            set_soc_minutes: 30,
            inverter_soc_reset: false,
            holiday: false,
        }
    }
}

/// What one tick did.
#[derive(Clone, Debug)]
pub struct TickOutcome {
    pub status: TickStatus,
    pub register_writes: u32,
    pub failures: u32,

    /// The plan was rejected and nothing was written.
    pub plan_rejected: bool,
}

/// One planning tick: plan + clock + inverter state in, a minimal set of
/// idempotent inverter mutations out. Every write is re-derivable, so a
/// cancelled or failed tick simply converges on the next one.
#[derive(Builder)]
pub struct Executor<'a> {
    battery: &'a BatteryParameters,
    flags: &'a SimFlags,
    exec: &'a ExecutorFlags,
    keep: &'a KeepSettings,
    plan: &'a Plan,

    #[builder(default = &[])]
    cars: &'a [CarPlan],

    iboost: Option<&'a IBoostParameters>,

    /// Diverter at full power right now, as predicted by the simulator.
    #[builder(default = false)]
    iboost_running_full: bool,

    minutes_now: i32,

    #[builder(default = 20.0)]
    temperature: f64,
}

fn note(failures: &mut u32, result: Result<(), InverterError>) {
    if let Err(error) = result {
        warn!(%error, "inverter call failed, continuing");
        *failures += 1;
    }
}

impl Executor<'_> {
    #[allow(clippy::too_many_lines, clippy::cognitive_complexity)]
    pub async fn tick(
        &self,
        inverters: &mut [&mut dyn Inverter],
        needs_reset: bool,
    ) -> TickOutcome {
        let exec = self.exec;
        let minutes_now = self.minutes_now;

        let mut status =
            if exec.holiday { Status::DemandHoliday } else { Status::Demand };
        let mut holds = EnumSet::new();
        let mut extra = String::new();
        let mut failures = 0;
        let mut register_writes = 0;

        if exec.read_only {
            return TickOutcome {
                status: TickStatus { base: Status::ReadOnly, holds, extra },
                register_writes: 0,
                failures: 0,
                plan_rejected: false,
            };
        }

        if let Err(error) = self.plan.verify(self.battery) {
            error!(%error, "plan rejected, not writing anything this tick");
            return TickOutcome {
                status: TickStatus { base: status, holds, extra },
                register_writes: 0,
                failures: 0,
                plan_rejected: true,
            };
        }

        if needs_reset {
            self.reset_inverters(inverters, &mut failures).await;
            for inverter in inverters.iter_mut() {
                register_writes += inverter.take_register_writes();
            }
        }

        // Calibration is a trap state: full rates, full target, no reserve,
        // and no plan logic until every inverter leaves it.
        if inverters.iter().any(|inverter| inverter.in_calibration()) {
            info!("inverter calibrating, opening everything up");
            for inverter in inverters.iter_mut() {
                let snapshot = inverter.snapshot();
                note(
                    &mut failures,
                    inverter.adjust_charge_rate(snapshot.rate_max_charge.into_watts()).await,
                );
                note(
                    &mut failures,
                    inverter.adjust_discharge_rate(snapshot.rate_max_discharge.into_watts()).await,
                );
                note(&mut failures, inverter.adjust_battery_target(100.0, false, false).await);
                note(&mut failures, inverter.adjust_reserve(0.0).await);
                register_writes += inverter.take_register_writes();
            }
            return TickOutcome {
                status: TickStatus { base: Status::Calibration, holds, extra },
                register_writes,
                failures,
                plan_rejected: false,
            };
        }

        let snapshots: Vec<InverterSnapshot> =
            inverters.iter().map(|inverter| inverter.snapshot()).collect();
        let capabilities: Vec<EnumSet<Capability>> =
            inverters.iter().map(|inverter| inverter.capabilities()).collect();
        let aggregate = Aggregate::collect(&snapshots);

        // A missing capability turns the matching feature off for every
        // inverter; the tick itself never fails over it.
        let mut flags = self.flags.clone();
        for caps in &capabilities {
            if !caps.contains(Capability::ExportFreeze) {
                flags.set_export_freeze = false;
                flags.set_export_freeze_only = false;
            }
            if !caps.contains(Capability::ChargeFreeze) {
                flags.set_charge_freeze = false;
            }
            if !caps.contains(Capability::ReserveSoc) {
                flags.set_reserve_enable = false;
                flags.discharge_during_charge = true;
            }
        }
        let flags = &flags;

        let charge_limit_kwh: Vec<KilowattHours> = self
            .plan
            .charge_windows
            .iter()
            .map(|slot| aggregate.soc_max * (slot.target_soc_percent / 100.0))
            .collect();
        let export_limits: Vec<ExportLimit> = self.plan.export_limits();
        let best_soc_min_percent = self.keep.best_soc_min.percent_of(aggregate.soc_max);

        let mut is_charging = false;
        let mut is_exporting = false;
        let mut disabled_charge_window = false;
        let mut disabled_export = false;

        for (index, inverter) in inverters.iter_mut().enumerate() {
            let snapshot = snapshots[index];
            let caps = capabilities[index];

            let mut reset_charge = true;
            let mut reset_discharge = true;
            let mut reset_pause = true;
            let mut reset_reserve = true;

            // The window the register block ends up describing, for the
            // later target-SoC decision.
            let mut computed_charge_window = snapshot.charge_window;

            if flags.set_charge_window && !self.plan.charge_windows.is_empty() {
                let merged = merge_contiguous(
                    &self
                        .plan
                        .charge_windows
                        .iter()
                        .map(|slot| slot.window)
                        .collect::<Vec<_>>(),
                );
                let mut window = merged[0];

                // Keep the original start when the programmed window has
                // already begun; moving it forward would interrupt a charge
                // in progress.
                if let Some(programmed) = snapshot.charge_window {
                    if programmed.start <= minutes_now
                        && minutes_now >= window.start
                        && programmed.start < window.start
                    {
                        window.start = programmed.start;
                    }
                }
                window = window.advance_for_register_wrap(minutes_now);
                if !caps.contains(Capability::SpanMidnight) {
                    window = window.crop_to_midnight();
                }

                let in_export_window = flags.set_export_window
                    && self
                        .plan
                        .export_windows
                        .first()
                        .is_some_and(|slot| slot.window.contains(minutes_now));

                if !in_export_window
                    && (window.start - minutes_now) < MINUTES_PER_DAY
                    && window.end > minutes_now
                {
                    computed_charge_window = Some(window);
                    let freeze_planned =
                        charge_freeze_planned(flags, &charge_limit_kwh, &aggregate);

                    if window.contains(minutes_now) {
                        // In the window and charging: pick the rate, then
                        // decide freeze vs hold vs active.
                        let limit_percent =
                            self.plan.charge_windows[0].target_soc_percent;
                        let per_inverter = BatteryParameters {
                            soc_max: snapshot.soc_max,
                            rate_max_charge: snapshot.rate_max_charge,
                            ..self.battery.clone()
                        };
                        let new_rate = per_inverter
                            .plan_charge_rate(
                                minutes_now,
                                window,
                                snapshot.soc_max * (limit_percent / 100.0),
                                snapshot.soc,
                                self.temperature,
                                flags.set_charge_low_power,
                                flags.charge_low_power_margin,
                            )
                            .into_watts();
                        let current_rate = snapshot.charge_rate_now.into_watts();
                        let max_rate = snapshot.rate_max_charge.into_watts();
                        // Rate hysteresis: only rewrite when meaningfully
                        // different or when restoring the full rate.
                        if new_rate.abs_diff(current_rate) > max_rate / 10 || new_rate == max_rate
                        {
                            note(&mut failures, inverter.adjust_charge_rate(new_rate).await);
                        }
                        reset_charge = false;
                        if caps.contains(Capability::SharedRate) {
                            note(&mut failures, inverter.adjust_discharge_rate(0).await);
                            reset_discharge = false;
                        }

                        let reserve_percent = aggregate.reserve_percent();
                        let target_soc = limit_percent_or_hold(
                            limit_percent,
                            reserve_percent,
                            snapshot.soc_percent,
                        )
                        .max(reserve_percent)
                        .max(best_soc_min_percent);

                        let can_hold = snapshots.iter().zip(&capabilities).all(|(check, caps)| {
                            check.soc >= check.reserve
                                && (caps.contains(Capability::TimedPause)
                                    || check.reserve_max_percent >= check.soc_percent)
                        });

                        if freeze_planned && aggregate.soc >= aggregate.reserve && can_hold {
                            // Freeze charge: hold the state, draw nothing.
                            if exec.set_soc_enable
                                && ((flags.set_reserve_enable
                                    && exec.set_reserve_hold
                                    && snapshot.reserve_max_percent >= snapshot.soc_percent)
                                    || caps.contains(Capability::TimedPause))
                            {
                                note(&mut failures, inverter.disable_charge_window().await);
                                disabled_charge_window = true;
                                if flags.set_reserve_enable
                                    && !caps.contains(Capability::TimedPause)
                                {
                                    note(
                                        &mut failures,
                                        inverter
                                            .adjust_reserve(
                                                (snapshot.soc_percent + 1.0).min(100.0),
                                            )
                                            .await,
                                    );
                                    reset_reserve = false;
                                }
                            } else {
                                note(
                                    &mut failures,
                                    inverter.adjust_charge_window(window, minutes_now).await,
                                );
                            }
                            if caps.contains(Capability::TimedPause) {
                                note(
                                    &mut failures,
                                    inverter.adjust_pause_mode(PauseMode::Discharge).await,
                                );
                                reset_pause = false;
                            } else {
                                note(&mut failures, inverter.adjust_discharge_rate(0).await);
                                reset_discharge = false;
                            }
                            status = Status::FreezeCharging;
                            extra = format!(" target {:.0}%", snapshot.soc_percent);
                            note(
                                &mut failures,
                                inverter
                                    .adjust_charge_immediate(snapshot.soc_percent, true)
                                    .await,
                            );
                        } else {
                            let hold_wanted = !percent_equal(limit_percent, reserve_percent)
                                && can_hold
                                && snapshots
                                    .iter()
                                    .all(|check| check.soc_percent >= target_soc);
                            if exec.set_soc_enable
                                && hold_wanted
                                && aggregate.soc_percent() >= target_soc
                            {
                                // Hold charge: the plan wants a sub-100%
                                // level we are already at.
                                status = Status::HoldCharging;
                                if limit_percent < 100.0
                                    && (aggregate.soc_percent() - limit_percent).abs() <= 1.0
                                {
                                    if exec.set_soc_enable
                                        && ((flags.set_reserve_enable
                                            && exec.set_reserve_hold
                                            && snapshot.reserve_max_percent
                                                >= snapshot.soc_percent)
                                            || caps.contains(Capability::TimedPause))
                                    {
                                        note(
                                            &mut failures,
                                            inverter.disable_charge_window().await,
                                        );
                                        disabled_charge_window = true;
                                        if flags.set_reserve_enable
                                            && !caps.contains(Capability::TimedPause)
                                        {
                                            note(
                                                &mut failures,
                                                inverter
                                                    .adjust_reserve(
                                                        (snapshot.soc_percent + 1.0).min(100.0),
                                                    )
                                                    .await,
                                            );
                                            reset_reserve = false;
                                        }
                                    } else {
                                        note(
                                            &mut failures,
                                            inverter
                                                .adjust_charge_window(window, minutes_now)
                                                .await,
                                        );
                                    }
                                    if caps.contains(Capability::TimedPause) {
                                        note(
                                            &mut failures,
                                            inverter.adjust_pause_mode(PauseMode::Discharge).await,
                                        );
                                        reset_pause = false;
                                    } else {
                                        note(
                                            &mut failures,
                                            inverter.adjust_discharge_rate(0).await,
                                        );
                                        reset_discharge = false;
                                    }
                                } else {
                                    note(
                                        &mut failures,
                                        inverter.adjust_charge_window(window, minutes_now).await,
                                    );
                                }
                                note(
                                    &mut failures,
                                    inverter.adjust_charge_immediate(target_soc, true).await,
                                );
                            } else {
                                status = Status::Charging;
                                note(
                                    &mut failures,
                                    inverter.adjust_charge_window(window, minutes_now).await,
                                );
                                note(
                                    &mut failures,
                                    inverter.adjust_charge_immediate(target_soc, false).await,
                                );
                            }
                            extra = format!(
                                " target {:.0}%-{:.0}%",
                                snapshot.soc_percent, target_soc,
                            );
                        }

                        if !flags.discharge_during_charge && reset_pause {
                            if caps.contains(Capability::TimedPause) {
                                note(
                                    &mut failures,
                                    inverter.adjust_pause_mode(PauseMode::Discharge).await,
                                );
                                reset_pause = false;
                            } else {
                                note(&mut failures, inverter.adjust_discharge_rate(0).await);
                                reset_discharge = false;
                            }
                        }
                        is_charging = true;
                    } else if minutes_now < window.end
                        && (window.start - minutes_now) <= exec.set_window_minutes
                    {
                        // About to start: program the registers, unless the
                        // window begins with a freeze (programming it would
                        // cause a spike of real charging first).
                        if freeze_planned {
                            debug!("upcoming window freezes, leaving registers disabled");
                            note(&mut failures, inverter.disable_charge_window().await);
                        } else {
                            note(
                                &mut failures,
                                inverter.adjust_charge_window(window, minutes_now).await,
                            );
                        }
                    } else {
                        note(&mut failures, inverter.disable_charge_window().await);
                    }
                } else {
                    note(&mut failures, inverter.disable_charge_window().await);
                }
            } else if flags.set_charge_window {
                note(&mut failures, inverter.disable_charge_window().await);
            }

            if flags.set_export_window && !self.plan.export_windows.is_empty() {
                let (window, limit) = {
                    let slot = self.plan.export_windows[0];
                    (slot.window, slot.limit)
                };
                let mut window = window;

                if let Some(programmed) = snapshot.export_window {
                    if programmed.start <= minutes_now
                        && minutes_now >= window.start
                        && programmed.start < window.start
                    {
                        // Keep the started window, unless stretching back
                        // would overlap the programmed charge window.
                        let collides = computed_charge_window.is_some_and(|charge| {
                            Window { start: programmed.start, end: window.end }.overlaps(charge)
                        });
                        if collides {
                            window.start = window.start.max(minutes_now);
                        } else {
                            window.start = programmed.start;
                        }
                    }
                }
                window = window.advance_for_register_wrap(minutes_now);

                // One extra minute lets the inverter fall back to demand
                // mode after the window, unless midnight or the programmed
                // charge start is in the way.
                let mut export_adjust = 1;
                if !caps.contains(Capability::SpanMidnight) {
                    window = window.crop_to_midnight();
                    export_adjust = 0;
                }
                if computed_charge_window.is_some_and(|charge| charge.start == window.end) {
                    export_adjust = 0;
                }
                let programmed_window =
                    Window { start: window.start, end: window.end + export_adjust };

                let export_floor =
                    limit.floor(aggregate.soc_max).max(aggregate.reserve).max(self.keep.best_soc_min);

                if window.contains(minutes_now) && limit.is_active() {
                    if !flags.set_export_freeze_only
                        && limit.forces_export()
                        && aggregate.soc > export_floor
                    {
                        note(
                            &mut failures,
                            inverter
                                .adjust_discharge_rate(snapshot.rate_max_discharge.into_watts())
                                .await,
                        );
                        reset_discharge = false;
                        note(
                            &mut failures,
                            inverter.adjust_force_export(true, Some(programmed_window)).await,
                        );
                        if caps.contains(Capability::SharedRate) {
                            note(&mut failures, inverter.adjust_charge_rate(0).await);
                            reset_charge = false;
                        }
                        is_exporting = true;
                        status = Status::Exporting;
                        extra = format!(
                            " target {:.0}%-{:.0}%",
                            snapshot.soc_percent,
                            limit.percent(),
                        );
                        note(
                            &mut failures,
                            inverter.adjust_export_immediate(limit.percent(), false).await,
                        );
                    } else {
                        note(&mut failures, inverter.adjust_force_export(false, None).await);
                        disabled_export = true;
                        if flags.set_export_freeze && limit.is_freeze() {
                            // Export freeze: no charging during the window.
                            if caps.contains(Capability::TimedPause) {
                                note(
                                    &mut failures,
                                    inverter.adjust_pause_mode(PauseMode::Charge).await,
                                );
                                reset_pause = false;
                            } else {
                                note(&mut failures, inverter.adjust_charge_rate(0).await);
                                reset_charge = false;
                            }
                            status = Status::FreezeExporting;
                            extra = format!(" current SoC {:.0}%", snapshot.soc_percent);
                            is_exporting = true;
                            note(
                                &mut failures,
                                inverter
                                    .adjust_export_immediate(snapshot.soc_percent, true)
                                    .await,
                            );
                        } else {
                            status = Status::HoldExporting;
                            extra = format!(
                                " target {:.0}%-{:.0}%",
                                snapshot.soc_percent,
                                limit.percent(),
                            );
                            note(
                                &mut failures,
                                inverter.adjust_export_immediate(0.0, false).await,
                            );
                        }
                    }
                } else if minutes_now < window.end
                    && (window.start - minutes_now) <= exec.set_window_minutes
                    && limit.is_active()
                {
                    note(
                        &mut failures,
                        inverter.adjust_force_export(false, Some(programmed_window)).await,
                    );
                } else {
                    note(&mut failures, inverter.adjust_force_export(false, None).await);
                }
            } else if flags.set_export_window {
                note(&mut failures, inverter.adjust_force_export(false, None).await);
            }

            // Car hold: keep the house battery out of the car while a slot
            // is active, unless a forced charge/export owns the tick.
            if !flags.car_charging_from_battery {
                for car in self.cars {
                    let Some(slot) = car.slots.first() else { continue };
                    if car.soc >= car.limit {
                        debug!("car already full, ignoring its slot");
                        continue;
                    }
                    if slot.window.contains(minutes_now) {
                        if !is_charging && !is_exporting {
                            if caps.contains(Capability::TimedPause) {
                                note(
                                    &mut failures,
                                    inverter.adjust_pause_mode(PauseMode::Discharge).await,
                                );
                                reset_pause = false;
                            } else {
                                note(&mut failures, inverter.adjust_discharge_rate(0).await);
                                reset_discharge = false;
                            }
                            holds |= Hold::Car;
                        }
                        break;
                    }
                }
            }

            if self.iboost.is_some_and(|iboost| iboost.enable && iboost.prevent_discharge)
                && self.iboost_running_full
                && !matches!(status, Status::Exporting | Status::Charging)
            {
                if caps.contains(Capability::TimedPause) {
                    note(&mut failures, inverter.adjust_pause_mode(PauseMode::Discharge).await);
                    reset_pause = false;
                } else {
                    note(&mut failures, inverter.adjust_discharge_rate(0).await);
                    reset_discharge = false;
                }
                holds |= Hold::IBoost;
            }

            // Clear stale immediate commands.
            if !is_charging && flags.set_charge_window {
                note(&mut failures, inverter.adjust_charge_immediate(0.0, false).await);
            }
            if !is_exporting && flags.set_export_window {
                note(&mut failures, inverter.adjust_export_immediate(0.0, false).await);
            }

            // Apply whatever resets were not claimed above.
            if reset_pause {
                note(&mut failures, inverter.adjust_pause_mode(PauseMode::None).await);
            }
            if reset_discharge {
                note(
                    &mut failures,
                    inverter
                        .adjust_discharge_rate(snapshot.rate_max_discharge.into_watts())
                        .await,
                );
            }
            if reset_charge {
                note(
                    &mut failures,
                    inverter.adjust_charge_rate(snapshot.rate_max_charge.into_watts()).await,
                );
            }

            if exec.set_soc_enable {
                self.apply_target_soc(
                    &mut **inverter,
                    flags,
                    &snapshot,
                    caps,
                    &aggregate,
                    &charge_limit_kwh,
                    &export_limits,
                    computed_charge_window,
                    is_charging,
                    is_exporting,
                    disabled_charge_window,
                    disabled_export,
                    &mut failures,
                )
                .await;
            }

            if flags.set_reserve_enable && reset_reserve {
                note(&mut failures, inverter.adjust_reserve(0.0).await);
            }

            let writes = inverter.take_register_writes();
            debug!(id = inverter.id(), writes, "tick applied");
            register_writes += writes;
        }

        TickOutcome {
            status: TickStatus { base: status, holds, extra },
            register_writes,
            failures,
            plan_rejected: false,
        }
    }

    #[allow(clippy::too_many_arguments, clippy::fn_params_excessive_bools)]
    async fn apply_target_soc(
        &self,
        inverter: &mut dyn Inverter,
        flags: &SimFlags,
        snapshot: &InverterSnapshot,
        caps: EnumSet<Capability>,
        aggregate: &Aggregate,
        charge_limit_kwh: &[KilowattHours],
        export_limits: &[ExportLimit],
        computed_charge_window: Option<Window>,
        is_charging: bool,
        is_exporting: bool,
        disabled_charge_window: bool,
        disabled_export: bool,
        failures: &mut u32,
    ) {
        let hybrid = self.battery.coupling == Coupling::Hybrid;
        let has_target_soc = caps.contains(Capability::TargetSoc);
        let has_enable_time = caps.contains(Capability::ChargeEnableTime);

        let set = |percent: f64, freeze: bool| {
            let split = split_target(aggregate, snapshot, percent, freeze);
            (split, freeze)
        };

        let target = if is_exporting && !disabled_export && !flags.set_reserve_enable {
            // Some hardware uses the target register as the export floor.
            export_limits.first().map(|limit| set(limit.percent().trunc(), false))
        } else if !self.plan.charge_windows.is_empty()
            && computed_charge_window.is_some_and(|window| {
                self.minutes_now < window.end
                    && (window.start - self.minutes_now) <= self.exec.set_soc_minutes
            })
            && !disabled_charge_window
        {
            let freeze_planned = charge_freeze_planned(flags, charge_limit_kwh, aggregate)
                && snapshot.soc >= snapshot.reserve;
            let limit_percent = self.plan.charge_windows[0].target_soc_percent;
            if has_enable_time || is_charging {
                if freeze_planned {
                    if is_charging {
                        Some(set(snapshot.soc_percent, true))
                    } else if has_target_soc {
                        // Not in the freeze yet: park at 100% until it starts.
                        Some(set(100.0, false))
                    } else {
                        Some(set(0.0, false))
                    }
                } else if !hybrid
                    && self.exec.inverter_soc_reset
                    && !is_charging
                    && has_target_soc
                {
                    Some(set(100.0, false))
                } else if is_charging {
                    Some(set(limit_percent, false))
                } else if has_target_soc {
                    Some(set(limit_percent, false))
                } else {
                    Some(set(0.0, false))
                }
            } else if !has_target_soc {
                if is_charging || is_exporting { None } else { Some(set(0.0, false)) }
            } else if !hybrid && self.exec.inverter_soc_reset {
                Some(set(100.0, false))
            } else {
                Some(set(0.0, false))
            }
        } else if !has_target_soc {
            Some(set(0.0, false))
        } else if !hybrid && self.exec.inverter_soc_reset {
            Some(set(100.0, false))
        } else if !has_enable_time {
            Some(set(0.0, false))
        } else {
            None
        };

        if let Some((percent, _freeze)) = target {
            note(
                failures,
                inverter.adjust_battery_target(percent, is_charging, is_exporting).await,
            );
        }
    }

    /// Safe-mode prelude: park every register at its neutral value. Runs
    /// when the operator or a mode change flagged the inverter for reset.
    pub async fn reset_inverters(
        &self,
        inverters: &mut [&mut dyn Inverter],
        failures: &mut u32,
    ) {
        for inverter in inverters.iter_mut() {
            let snapshot = inverter.snapshot();
            info!(id = inverter.id(), "resetting inverter to safe defaults");
            if self.flags.set_charge_window {
                note(
                    failures,
                    inverter.adjust_charge_rate(snapshot.rate_max_charge.into_watts()).await,
                );
                note(failures, inverter.disable_charge_window().await);
                note(failures, inverter.adjust_charge_immediate(0.0, false).await);
                note(failures, inverter.adjust_battery_target(100.0, false, false).await);
                note(failures, inverter.adjust_pause_mode(PauseMode::None).await);
            }
            if self.flags.set_charge_window || self.flags.set_export_window {
                note(failures, inverter.adjust_reserve(0.0).await);
            }
            if self.flags.set_export_window {
                note(
                    failures,
                    inverter
                        .adjust_discharge_rate(snapshot.rate_max_discharge.into_watts())
                        .await,
                );
                note(failures, inverter.adjust_force_export(false, None).await);
                note(failures, inverter.adjust_export_immediate(0.0, false).await);
            }
        }
    }
}

fn charge_freeze_planned(
    flags: &SimFlags,
    charge_limit_kwh: &[KilowattHours],
    aggregate: &Aggregate,
) -> bool {
    flags.set_charge_freeze
        && charge_limit_kwh
            .first()
            .is_some_and(|limit| (*limit - aggregate.reserve).abs().0 < SOC_EPSILON)
}

/// In-window charge target: the plan's percent, unless the plan points at
/// the reserve (a freeze), in which case the current state holds.
fn limit_percent_or_hold(limit_percent: f64, reserve_percent: f64, soc_percent: f64) -> f64 {
    if percent_equal(limit_percent, reserve_percent) { soc_percent } else { limit_percent }
}

fn percent_equal(a: f64, b: f64) -> bool {
    (a - b).abs() < 0.5
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::{
            plan::{ChargeWindow, EnergyWindow, ExportWindow},
            provider::RateSet,
            series::Series,
            sim::{InitialState, RunMode, Simulation},
        },
        inverter::simulated::{SimulatedInverter, SimulatedInverterConfig},
        quantity::rate::KilowattHourRate,
    };

    fn battery() -> BatteryParameters {
        BatteryParameters {
            soc_max: Quantity(10.0),
            reserve: Quantity(0.4),
            ..BatteryParameters::default()
        }
    }

    fn inverter(soc: f64) -> SimulatedInverter {
        let config = SimulatedInverterConfig {
            soc: Quantity(soc),
            soc_max: Quantity(10.0),
            reserve: Quantity(0.4),
            ..SimulatedInverterConfig::default()
        };
        SimulatedInverter::new(0, &config)
    }

    fn charge_plan(window: Window, target_soc_percent: f64) -> Plan {
        Plan {
            charge_windows: vec![ChargeWindow { window, target_soc_percent }],
            ..Plan::default()
        }
    }

    fn export_plan(window: Window, limit: f64) -> Plan {
        Plan {
            export_windows: vec![ExportWindow { window, limit: ExportLimit(limit) }],
            ..Plan::default()
        }
    }

    struct Setup {
        battery: BatteryParameters,
        flags: SimFlags,
        exec: ExecutorFlags,
        keep: KeepSettings,
    }

    impl Setup {
        fn new() -> Self {
            Self {
                battery: battery(),
                flags: SimFlags::default(),
                exec: ExecutorFlags::default(),
                keep: KeepSettings::default(),
            }
        }

        fn executor<'a>(
            &'a self,
            plan: &'a Plan,
            cars: &'a [CarPlan],
            minutes_now: i32,
        ) -> Executor<'a> {
            Executor::builder()
                .battery(&self.battery)
                .flags(&self.flags)
                .exec(&self.exec)
                .keep(&self.keep)
                .plan(plan)
                .cars(cars)
                .minutes_now(minutes_now)
                .build()
        }
    }

    #[tokio::test]
    async fn test_freeze_charge_pauses_instead_of_charging() {
        let setup = Setup::new();
        // Target at the reserve flags a freeze; the battery sits above it.
        let plan = charge_plan(Window::new(100, 200), 4.0);
        let mut unit = inverter(5.0);
        {
            let mut handles: Vec<&mut dyn Inverter> = vec![&mut unit];
            let outcome = setup.executor(&plan, &[], 130).tick(&mut handles, false).await;
            assert_eq!(outcome.status.base, Status::FreezeCharging);
            assert_eq!(outcome.failures, 0);
        }
        assert_eq!(unit.registers.pause, PauseMode::Discharge);
        assert_eq!(unit.registers.charge_window, None, "window registers disabled in freeze");
        assert_eq!(unit.registers.charge_immediate_percent, 50.0);
        assert!(unit.registers.charge_immediate_freeze);
        // Discharge rate was never touched: the pause does the holding.
        assert_eq!(unit.registers.discharge_rate_watts, 2600);
    }

    #[tokio::test]
    async fn test_missing_charge_freeze_capability_falls_back() {
        let setup = Setup::new();
        let plan = charge_plan(Window::new(100, 200), 4.0);
        let config = SimulatedInverterConfig {
            reserve: Quantity(0.4),
            capabilities: vec![
                Capability::TimedPause,
                Capability::SpanMidnight,
                Capability::TargetSoc,
                Capability::ChargeEnableTime,
                Capability::ReserveSoc,
            ],
            ..SimulatedInverterConfig::default()
        };
        let mut unit = SimulatedInverter::new(0, &config);
        let mut handles: Vec<&mut dyn Inverter> = vec![&mut unit];
        let outcome = setup.executor(&plan, &[], 130).tick(&mut handles, false).await;
        // Without charge-freeze support the reserve-level target is not a
        // freeze; the tick degrades to a plain charge state.
        assert_eq!(outcome.status.base, Status::Charging);
    }

    #[tokio::test]
    async fn test_tick_is_idempotent() {
        let setup = Setup::new();
        let plan = charge_plan(Window::new(100, 200), 4.0);
        let mut unit = inverter(5.0);
        let mut handles: Vec<&mut dyn Inverter> = vec![&mut unit];
        let executor = setup.executor(&plan, &[], 130);
        let first = executor.tick(&mut handles, false).await;
        assert!(first.register_writes > 0);
        let second = executor.tick(&mut handles, false).await;
        assert_eq!(second.register_writes, 0, "unchanged inputs must write nothing");
        assert_eq!(second.status, first.status);
    }

    #[tokio::test]
    async fn test_active_charge_programs_window_and_target() {
        let setup = Setup::new();
        let plan = charge_plan(Window::new(100, 200), 90.0);
        let mut unit = inverter(5.0);
        {
            let mut handles: Vec<&mut dyn Inverter> = vec![&mut unit];
            let outcome = setup.executor(&plan, &[], 130).tick(&mut handles, false).await;
            assert_eq!(outcome.status.base, Status::Charging);
        }
        assert_eq!(unit.registers.charge_window, Some(Window::new(100, 200)));
        assert_eq!(unit.registers.charge_immediate_percent, 90.0);
        assert!(!unit.registers.charge_immediate_freeze);
        assert_eq!(unit.registers.target_soc_percent, 90.0);
        assert_eq!(unit.registers.pause, PauseMode::None);
    }

    #[tokio::test]
    async fn test_upcoming_window_programs_registers_early() {
        let setup = Setup::new();
        let plan = charge_plan(Window::new(120, 240), 100.0);
        let mut unit = inverter(5.0);
        {
            // 20 minutes ahead of the start, within set_window_minutes.
            let mut handles: Vec<&mut dyn Inverter> = vec![&mut unit];
            let outcome = setup.executor(&plan, &[], 100).tick(&mut handles, false).await;
            assert_eq!(outcome.status.base, Status::Demand);
        }
        assert_eq!(unit.registers.charge_window, Some(Window::new(120, 240)));

        // Far ahead of the start the registers stay disabled.
        let mut early = inverter(5.0);
        {
            let mut handles: Vec<&mut dyn Inverter> = vec![&mut early];
            setup.executor(&plan, &[], 0).tick(&mut handles, false).await;
        }
        assert_eq!(early.registers.charge_window, None);
    }

    #[tokio::test]
    async fn test_car_slot_holds_discharge() {
        let setup = {
            let mut setup = Setup::new();
            setup.flags.car_charging_from_battery = false;
            setup
        };
        let plan = Plan::default();
        let cars = [CarPlan {
            slots: vec![EnergyWindow { window: Window::new(0, 60), kwh: Quantity(7.0) }],
            ..CarPlan::default()
        }];
        let mut unit = inverter(5.0);
        {
            let mut handles: Vec<&mut dyn Inverter> = vec![&mut unit];
            let outcome = setup.executor(&plan, &cars, 30).tick(&mut handles, false).await;
            assert_eq!(outcome.status.to_string(), "Hold for car");
        }
        assert_eq!(unit.registers.pause, PauseMode::Discharge);
    }

    #[tokio::test]
    async fn test_car_hold_without_pause_capability_zeroes_rate() {
        let setup = {
            let mut setup = Setup::new();
            setup.flags.car_charging_from_battery = false;
            setup
        };
        let plan = Plan::default();
        let cars = [CarPlan {
            slots: vec![EnergyWindow { window: Window::new(0, 60), kwh: Quantity(7.0) }],
            ..CarPlan::default()
        }];
        let config = SimulatedInverterConfig {
            capabilities: vec![
                Capability::SpanMidnight,
                Capability::TargetSoc,
                Capability::ChargeEnableTime,
                Capability::ReserveSoc,
            ],
            ..SimulatedInverterConfig::default()
        };
        let mut unit = SimulatedInverter::new(0, &config);
        {
            let mut handles: Vec<&mut dyn Inverter> = vec![&mut unit];
            let outcome = setup.executor(&plan, &cars, 30).tick(&mut handles, false).await;
            assert!(outcome.status.holds.contains(Hold::Car));
        }
        assert_eq!(unit.registers.discharge_rate_watts, 0);
        assert_eq!(unit.registers.pause, PauseMode::None);
    }

    #[tokio::test]
    async fn test_exporting_programs_force_export() {
        let setup = Setup::new();
        let plan = export_plan(Window::new(300, 360), 4.0);
        let mut unit = inverter(8.0);
        {
            let mut handles: Vec<&mut dyn Inverter> = vec![&mut unit];
            let outcome = setup.executor(&plan, &[], 310).tick(&mut handles, false).await;
            assert_eq!(outcome.status.base, Status::Exporting);
        }
        assert!(unit.registers.force_export);
        // The programmed end gains the one-minute demand-restore margin.
        assert_eq!(unit.registers.export_window, Some(Window::new(300, 361)));
        assert_eq!(unit.registers.export_immediate_percent, 4.0);
        assert_eq!(unit.registers.discharge_rate_watts, 2600);
    }

    #[tokio::test]
    async fn test_export_margin_yields_to_charge_window_start() {
        let setup = Setup::new();
        let plan = export_plan(Window::new(300, 360), 4.0);
        let mut unit = inverter(8.0);
        unit.registers.charge_window = Some(Window::new(360, 420));
        {
            let mut handles: Vec<&mut dyn Inverter> = vec![&mut unit];
            setup.executor(&plan, &[], 310).tick(&mut handles, false).await;
        }
        // No +1: it would run into the programmed charge start.
        assert_eq!(unit.registers.export_window, Some(Window::new(300, 360)));
    }

    #[tokio::test]
    async fn test_hold_export_below_floor() {
        let setup = Setup::new();
        // 40% floor with the battery already at 30%: nothing to export.
        let plan = export_plan(Window::new(300, 360), 40.0);
        let mut unit = inverter(3.0);
        {
            let mut handles: Vec<&mut dyn Inverter> = vec![&mut unit];
            let outcome = setup.executor(&plan, &[], 310).tick(&mut handles, false).await;
            assert_eq!(outcome.status.base, Status::HoldExporting);
        }
        assert!(!unit.registers.force_export);
    }

    #[tokio::test]
    async fn test_freeze_export_pauses_charge() {
        let setup = Setup::new();
        let plan = export_plan(Window::new(300, 360), 99.0);
        let mut unit = inverter(8.0);
        {
            let mut handles: Vec<&mut dyn Inverter> = vec![&mut unit];
            let outcome = setup.executor(&plan, &[], 310).tick(&mut handles, false).await;
            assert_eq!(outcome.status.base, Status::FreezeExporting);
        }
        assert_eq!(unit.registers.pause, PauseMode::Charge);
        assert!(unit.registers.export_immediate_freeze);
        assert_eq!(unit.registers.export_immediate_percent, 80.0);
    }

    #[tokio::test]
    async fn test_read_only_writes_nothing() {
        let setup = {
            let mut setup = Setup::new();
            setup.exec.read_only = true;
            setup
        };
        let plan = charge_plan(Window::new(100, 200), 100.0);
        let mut unit = inverter(5.0);
        let before = unit.registers;
        {
            let mut handles: Vec<&mut dyn Inverter> = vec![&mut unit];
            let outcome = setup.executor(&plan, &[], 130).tick(&mut handles, false).await;
            assert_eq!(outcome.status.base, Status::ReadOnly);
            assert_eq!(outcome.register_writes, 0);
        }
        assert_eq!(unit.registers, before);
    }

    #[tokio::test]
    async fn test_calibration_opens_everything_up() {
        let setup = Setup::new();
        let plan = charge_plan(Window::new(100, 200), 100.0);
        let config =
            SimulatedInverterConfig { in_calibration: true, ..SimulatedInverterConfig::default() };
        let mut unit = SimulatedInverter::new(0, &config);
        unit.registers.target_soc_percent = 50.0;
        unit.registers.charge_rate_watts = 0;
        {
            let mut handles: Vec<&mut dyn Inverter> = vec![&mut unit];
            let outcome = setup.executor(&plan, &[], 130).tick(&mut handles, false).await;
            assert_eq!(outcome.status.base, Status::Calibration);
        }
        assert_eq!(unit.registers.target_soc_percent, 100.0);
        assert_eq!(unit.registers.charge_rate_watts, 2600);
        assert_eq!(unit.registers.reserve_percent, 0.0);
    }

    #[tokio::test]
    async fn test_reset_prelude_restores_safe_defaults() {
        let setup = Setup::new();
        let plan = Plan::default();
        let mut unit = inverter(5.0);
        unit.registers.charge_window = Some(Window::new(0, 600));
        unit.registers.reserve_percent = 50.0;
        unit.registers.charge_rate_watts = 0;
        unit.registers.force_export = true;
        {
            let mut handles: Vec<&mut dyn Inverter> = vec![&mut unit];
            let outcome = setup.executor(&plan, &[], 700).tick(&mut handles, true).await;
            assert!(outcome.register_writes > 0);
        }
        assert_eq!(unit.registers.charge_window, None);
        assert_eq!(unit.registers.reserve_percent, 0.0);
        assert_eq!(unit.registers.charge_rate_watts, 2600);
        assert!(!unit.registers.force_export);
    }

    #[tokio::test]
    async fn test_plan_rejected_writes_nothing() {
        let setup = Setup::new();
        let plan = Plan {
            charge_windows: vec![
                ChargeWindow { window: Window::new(0, 120), target_soc_percent: 100.0 },
                ChargeWindow { window: Window::new(60, 180), target_soc_percent: 100.0 },
            ],
            ..Plan::default()
        };
        let mut unit = inverter(5.0);
        let before = unit.registers;
        {
            let mut handles: Vec<&mut dyn Inverter> = vec![&mut unit];
            let outcome = setup.executor(&plan, &[], 30).tick(&mut handles, false).await;
            assert!(outcome.plan_rejected);
            assert_eq!(outcome.register_writes, 0);
        }
        assert_eq!(unit.registers, before);
    }

    #[tokio::test]
    async fn test_transient_failure_is_counted_not_retried() {
        let setup = Setup::new();
        let plan = charge_plan(Window::new(100, 200), 90.0);
        let mut unit = inverter(5.0);
        unit.inject_failures(1);
        let mut handles: Vec<&mut dyn Inverter> = vec![&mut unit];
        let outcome = setup.executor(&plan, &[], 130).tick(&mut handles, false).await;
        assert_eq!(outcome.failures, 1);
        assert_eq!(outcome.status.base, Status::Charging);
    }

    /// The live executor and the forward model must agree on the regime at
    /// any minute of the same plan.
    #[tokio::test]
    async fn test_executor_matches_simulator_regimes() {
        use crate::core::sim::Regime;

        let setup = Setup::new();
        let plan = Plan {
            charge_windows: vec![ChargeWindow {
                window: Window::new(120, 240),
                target_soc_percent: 100.0,
            }],
            export_windows: vec![ExportWindow {
                window: Window::new(300, 360),
                limit: ExportLimit(4.0),
            }],
            ..Plan::default()
        };

        let rates = RateSet {
            import: Series::flat(Quantity(10.0)),
            export: Series::flat(Quantity(15.0)),
            gas: None,
            carbon: None,
            standing_charge: crate::quantity::cost::Cost::ZERO,
        };
        let pv = Series::flat(KilowattHours::ZERO);
        let load = Series::flat(Quantity(0.5 * 5.0 / 60.0));
        let simulation = Simulation::builder()
            .battery(&setup.battery)
            .flags(&setup.flags)
            .keep(&setup.keep)
            .rates(&rates)
            .pv(&pv)
            .load(&load)
            .initial(InitialState {
                soc: Quantity(5.0),
                charge_rate_now: setup.battery.rate_max_charge,
                discharge_rate_now: setup.battery.rate_max_discharge,
                temperature: 20.0,
                ..InitialState::default()
            })
            .forecast_minutes(720)
            .build();
        let charge_windows: Vec<Window> =
            plan.charge_windows.iter().map(|slot| slot.window).collect();
        let charge_limits = plan.charge_limits_kwh(&setup.battery);
        let export_windows: Vec<Window> =
            plan.export_windows.iter().map(|slot| slot.window).collect();
        let outcome = simulation.run(
            &charge_windows,
            &charge_limits,
            &export_windows,
            &plan.export_limits(),
            RunMode::Best,
        );

        for minute in [0, 130, 310] {
            let trace = outcome
                .traces
                .iter()
                .find(|trace| trace.minute == minute)
                .expect("probe minute inside horizon");
            let mut unit = inverter(trace.soc.0.max(0.5));
            let executor_regime = {
                let mut handles: Vec<&mut dyn Inverter> = vec![&mut unit];
                let tick = setup.executor(&plan, &[], minute).tick(&mut handles, false).await;
                match tick.status.base {
                    Status::Charging => Regime::ForceCharge,
                    Status::FreezeCharging => Regime::FreezeCharge,
                    Status::Exporting => Regime::ForceExport,
                    Status::FreezeExporting => Regime::FreezeExport,
                    _ => Regime::Demand,
                }
            };
            assert_eq!(executor_regime, trace.regime, "at minute {minute}");
        }
    }
}
