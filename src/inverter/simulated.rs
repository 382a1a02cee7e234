use async_trait::async_trait;
use enumset::EnumSet;
use serde::{Deserialize, Serialize};

use crate::{
    core::{error::InverterError, window::Window},
    inverter::{Capability, Inverter, InverterSnapshot, PauseMode},
    prelude::*,
    quantity::{Quantity, energy::KilowattHours, power::Kilowatts},
};

/// Register image of the simulated inverter.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Registers {
    pub charge_rate_watts: u32,
    pub discharge_rate_watts: u32,
    pub target_soc_percent: f64,
    pub reserve_percent: f64,
    pub charge_window: Option<Window>,
    pub export_window: Option<Window>,
    pub force_export: bool,
    pub charge_immediate_percent: f64,
    pub charge_immediate_freeze: bool,
    pub export_immediate_percent: f64,
    pub export_immediate_freeze: bool,
    pub pause: PauseMode,
}

/// Starting state for a simulated inverter, from configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedInverterConfig {
    pub soc: KilowattHours,
    pub soc_max: KilowattHours,
    pub reserve: KilowattHours,
    pub reserve_max_percent: f64,
    pub rate_max_charge: Kilowatts,
    pub rate_max_discharge: Kilowatts,
    pub rate_min: Kilowatts,
    pub inverter_limit: Kilowatts,
    pub export_limit: Kilowatts,
    pub capabilities: Vec<Capability>,
    pub in_calibration: bool,
}

impl Default for SimulatedInverterConfig {
    fn default() -> Self {
        Self {
            soc: Quantity(5.0),
            soc_max: Quantity(10.0),
            reserve: Quantity(0.4),
            reserve_max_percent: 100.0,
            rate_max_charge: Quantity(2.6),
            rate_max_discharge: Quantity(2.6),
            rate_min: Kilowatts::ZERO,
            inverter_limit: Quantity(7.5),
            export_limit: Quantity(10.0),
            capabilities: vec![
                Capability::TimedPause,
                Capability::SpanMidnight,
                Capability::TargetSoc,
                Capability::ChargeEnableTime,
                Capability::ExportFreeze,
                Capability::ChargeFreeze,
                Capability::ReserveSoc,
            ],
            in_calibration: false,
        }
    }
}

/// In-memory inverter with real register semantics: writes that restate the
/// current value are no-ops, every effective write is counted, and an
/// injectable fault makes the next call fail. Drives the executor in tests
/// and in dry runs.
#[derive(Debug)]
pub struct SimulatedInverter {
    id: usize,
    capabilities: EnumSet<Capability>,
    in_calibration: bool,

    soc: KilowattHours,
    soc_max: KilowattHours,
    reserve: KilowattHours,
    reserve_max_percent: f64,
    rate_max_charge: Kilowatts,
    rate_max_discharge: Kilowatts,
    rate_min: Kilowatts,
    inverter_limit: Kilowatts,
    export_limit: Kilowatts,

    battery_power: Kilowatts,
    pv_power: Kilowatts,
    load_power: Kilowatts,

    pub registers: Registers,
    register_writes: u32,
    fail_next_calls: u32,
}

impl SimulatedInverter {
    pub fn new(id: usize, config: &SimulatedInverterConfig) -> Self {
        let capabilities = config.capabilities.iter().copied().collect();
        Self {
            id,
            capabilities,
            in_calibration: config.in_calibration,
            soc: config.soc,
            soc_max: config.soc_max,
            reserve: config.reserve,
            reserve_max_percent: config.reserve_max_percent,
            rate_max_charge: config.rate_max_charge,
            rate_max_discharge: config.rate_max_discharge,
            rate_min: config.rate_min,
            inverter_limit: config.inverter_limit,
            export_limit: config.export_limit,
            battery_power: Kilowatts::ZERO,
            pv_power: Kilowatts::ZERO,
            load_power: Kilowatts::ZERO,
            registers: Registers {
                charge_rate_watts: config.rate_max_charge.into_watts(),
                discharge_rate_watts: config.rate_max_discharge.into_watts(),
                target_soc_percent: 100.0,
                ..Registers::default()
            },
            register_writes: 0,
            fail_next_calls: 0,
        }
    }

    /// Drive the modelled battery state from outside (tests, dry runs).
    pub fn set_state(&mut self, soc: KilowattHours, battery_power: Kilowatts) {
        self.soc = soc;
        self.battery_power = battery_power;
    }

    pub fn set_powers(&mut self, pv: Kilowatts, load: Kilowatts) {
        self.pv_power = pv;
        self.load_power = load;
    }

    /// Make the next `count` calls fail with a transient error.
    pub fn inject_failures(&mut self, count: u32) {
        self.fail_next_calls = count;
    }

    fn soc_percent(&self) -> f64 {
        self.soc.percent_of(self.soc_max)
    }

    fn check_fault(&mut self) -> Result<(), InverterError> {
        if self.fail_next_calls > 0 {
            self.fail_next_calls -= 1;
            return Err(InverterError::new("injected transient fault"));
        }
        Ok(())
    }

    /// Count a write only when the register actually changes.
    fn write<T: PartialEq>(register: &mut T, value: T, writes: &mut u32) {
        if *register != value {
            *register = value;
            *writes += 1;
        }
    }
}

#[async_trait]
impl Inverter for SimulatedInverter {
    fn id(&self) -> usize {
        self.id
    }

    fn capabilities(&self) -> EnumSet<Capability> {
        self.capabilities
    }

    fn in_calibration(&self) -> bool {
        self.in_calibration
    }

    fn snapshot(&self) -> InverterSnapshot {
        InverterSnapshot {
            soc: self.soc,
            soc_max: self.soc_max,
            soc_percent: self.soc_percent(),
            reserve: self.reserve,
            reserve_percent: self.reserve.percent_of(self.soc_max),
            reserve_current_percent: self.registers.reserve_percent,
            reserve_max_percent: self.reserve_max_percent,
            rate_max_charge: self.rate_max_charge,
            rate_max_discharge: self.rate_max_discharge,
            rate_min: self.rate_min,
            charge_rate_now: Kilowatts::from_watts(self.registers.charge_rate_watts),
            discharge_rate_now: Kilowatts::from_watts(self.registers.discharge_rate_watts),
            charge_window: self.registers.charge_window,
            export_window: self.registers.export_window,
            battery_power: self.battery_power,
            pv_power: self.pv_power,
            load_power: self.load_power,
            inverter_limit: self.inverter_limit,
            export_limit: self.export_limit,
        }
    }

    async fn adjust_charge_rate(&mut self, watts: u32) -> Result<(), InverterError> {
        self.check_fault()?;
        Self::write(&mut self.registers.charge_rate_watts, watts, &mut self.register_writes);
        Ok(())
    }

    async fn adjust_discharge_rate(&mut self, watts: u32) -> Result<(), InverterError> {
        self.check_fault()?;
        Self::write(&mut self.registers.discharge_rate_watts, watts, &mut self.register_writes);
        Ok(())
    }

    async fn adjust_battery_target(
        &mut self,
        percent: f64,
        _is_charging: bool,
        _is_exporting: bool,
    ) -> Result<(), InverterError> {
        self.check_fault()?;
        Self::write(&mut self.registers.target_soc_percent, percent, &mut self.register_writes);
        Ok(())
    }

    async fn adjust_reserve(&mut self, percent: f64) -> Result<(), InverterError> {
        self.check_fault()?;
        let percent = percent.clamp(0.0, self.reserve_max_percent);
        Self::write(&mut self.registers.reserve_percent, percent, &mut self.register_writes);
        Ok(())
    }

    async fn adjust_charge_window(
        &mut self,
        window: Window,
        _minutes_now: i32,
    ) -> Result<(), InverterError> {
        self.check_fault()?;
        Self::write(&mut self.registers.charge_window, Some(window), &mut self.register_writes);
        Ok(())
    }

    async fn disable_charge_window(&mut self) -> Result<(), InverterError> {
        self.check_fault()?;
        Self::write(&mut self.registers.charge_window, None, &mut self.register_writes);
        Ok(())
    }

    async fn adjust_force_export(
        &mut self,
        enable: bool,
        window: Option<Window>,
    ) -> Result<(), InverterError> {
        self.check_fault()?;
        Self::write(&mut self.registers.force_export, enable, &mut self.register_writes);
        Self::write(&mut self.registers.export_window, window, &mut self.register_writes);
        Ok(())
    }

    async fn adjust_charge_immediate(
        &mut self,
        target_percent: f64,
        freeze: bool,
    ) -> Result<(), InverterError> {
        self.check_fault()?;
        Self::write(
            &mut self.registers.charge_immediate_percent,
            target_percent,
            &mut self.register_writes,
        );
        Self::write(&mut self.registers.charge_immediate_freeze, freeze, &mut self.register_writes);
        Ok(())
    }

    async fn adjust_export_immediate(
        &mut self,
        target_percent: f64,
        freeze: bool,
    ) -> Result<(), InverterError> {
        self.check_fault()?;
        Self::write(
            &mut self.registers.export_immediate_percent,
            target_percent,
            &mut self.register_writes,
        );
        Self::write(&mut self.registers.export_immediate_freeze, freeze, &mut self.register_writes);
        Ok(())
    }

    async fn adjust_pause_mode(&mut self, mode: PauseMode) -> Result<(), InverterError> {
        self.check_fault()?;
        if !self.capabilities.contains(Capability::TimedPause) && mode != PauseMode::None {
            warn!(id = self.id, "pause requested without timed-pause capability");
            return Err(InverterError::new("pause mode unsupported"));
        }
        Self::write(&mut self.registers.pause, mode, &mut self.register_writes);
        Ok(())
    }

    fn take_register_writes(&mut self) -> u32 {
        std::mem::take(&mut self.register_writes)
    }
}
