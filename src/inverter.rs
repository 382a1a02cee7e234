pub mod simulated;

use async_trait::async_trait;
use enumset::{EnumSet, EnumSetType};

use crate::{
    core::{error::InverterError, window::Window},
    quantity::{energy::KilowattHours, power::Kilowatts},
};

/// Feature flags a concrete inverter driver reports. Absent capabilities
/// switch the executor onto explicit fallback paths; they are never errors.
#[derive(Debug, EnumSetType, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Pause registers exist, so holds need not zero the rate registers.
    TimedPause,

    /// Window registers may wrap past midnight.
    SpanMidnight,

    /// A target state-of-charge register exists.
    TargetSoc,

    /// Charging obeys an enable-time register rather than the target alone.
    ChargeEnableTime,

    /// Export can be frozen without actively discharging.
    ExportFreeze,

    /// Charging can be frozen at the current state.
    ChargeFreeze,

    /// A reserve state-of-charge register exists.
    ReserveSoc,

    /// Charge and discharge share one rate register pair: enabling one side
    /// requires zeroing the other.
    SharedRate,

    /// The battery may charge from PV during a forced export.
    ChargeDuringExport,
}

/// Point-in-time reading of an inverter, refreshed before every tick.
#[derive(Clone, Copy, Debug, Default)]
pub struct InverterSnapshot {
    pub soc: KilowattHours,
    pub soc_max: KilowattHours,
    pub soc_percent: f64,

    /// Configured minimum state of charge.
    pub reserve: KilowattHours,
    pub reserve_percent: f64,
    pub reserve_current_percent: f64,
    pub reserve_max_percent: f64,

    pub rate_max_charge: Kilowatts,
    pub rate_max_discharge: Kilowatts,
    pub rate_min: Kilowatts,
    pub charge_rate_now: Kilowatts,
    pub discharge_rate_now: Kilowatts,

    /// Programmed charge window, if the registers hold one.
    pub charge_window: Option<Window>,
    pub export_window: Option<Window>,

    /// Instantaneous powers; positive battery power discharges.
    pub battery_power: Kilowatts,
    pub pv_power: Kilowatts,
    pub load_power: Kilowatts,

    pub inverter_limit: Kilowatts,
    pub export_limit: Kilowatts,
}

/// Pause-register state; `None` clears both directions.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum PauseMode {
    #[default]
    None,
    Charge,
    Discharge,
    Both,
}

/// Abstract inverter. Every mutation is idempotent against the current
/// register state: re-writing the value already held is a no-op and does
/// not count as a register write. Calls are the executor's only suspension
/// points and may take seconds; a failure is counted and never retried
/// within the tick.
#[async_trait]
pub trait Inverter: Send {
    fn id(&self) -> usize;

    fn capabilities(&self) -> EnumSet<Capability>;

    fn in_calibration(&self) -> bool;

    fn snapshot(&self) -> InverterSnapshot;

    async fn adjust_charge_rate(&mut self, watts: u32) -> Result<(), InverterError>;

    async fn adjust_discharge_rate(&mut self, watts: u32) -> Result<(), InverterError>;

    async fn adjust_battery_target(
        &mut self,
        percent: f64,
        is_charging: bool,
        is_exporting: bool,
    ) -> Result<(), InverterError>;

    async fn adjust_reserve(&mut self, percent: f64) -> Result<(), InverterError>;

    async fn adjust_charge_window(
        &mut self,
        window: Window,
        minutes_now: i32,
    ) -> Result<(), InverterError>;

    async fn disable_charge_window(&mut self) -> Result<(), InverterError>;

    async fn adjust_force_export(
        &mut self,
        enable: bool,
        window: Option<Window>,
    ) -> Result<(), InverterError>;

    async fn adjust_charge_immediate(
        &mut self,
        target_percent: f64,
        freeze: bool,
    ) -> Result<(), InverterError>;

    async fn adjust_export_immediate(
        &mut self,
        target_percent: f64,
        freeze: bool,
    ) -> Result<(), InverterError>;

    async fn adjust_pause_mode(&mut self, mode: PauseMode) -> Result<(), InverterError>;

    /// Register writes since the last call; reading resets the counter.
    fn take_register_writes(&mut self) -> u32;
}
