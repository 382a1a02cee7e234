use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    core::series::Series,
    prelude::*,
    quantity::{Quantity, cost::Cost, energy::KilowattHours, rate::KilowattHourRate},
};

/// Tariff data over the horizon, indexed by absolute minute on the horizon
/// clock. Dense at 5-minute resolution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateSet {
    pub import: Series<KilowattHourRate>,
    pub export: Series<KilowattHourRate>,

    #[serde(default)]
    pub gas: Option<Series<KilowattHourRate>>,

    /// Grams of CO₂ per kWh.
    #[serde(default)]
    pub carbon: Option<Series<f64>>,

    /// Added once per simulated day.
    #[serde(default = "zero_cost")]
    pub standing_charge: Cost,
}

fn zero_cost() -> Cost {
    Cost::ZERO
}

/// PV and house-load forecasts, central and pessimistic (p10) series,
/// indexed by minute offset from the forecast origin.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForecastSet {
    pub pv: Series<KilowattHours>,
    pub pv_p10: Series<KilowattHours>,
    pub load: Series<KilowattHours>,
    pub load_p10: Series<KilowattHours>,

    /// Battery temperature forecast in °C.
    #[serde(default)]
    pub temperature: Option<Series<f64>>,

    /// Keep-percent overrides pushed by external alerts, by absolute minute.
    #[serde(default)]
    pub alert_keep: Option<Series<f64>>,
}

impl ForecastSet {
    /// Pick the central or pessimistic pair.
    pub fn series(&self, p10: bool) -> (&Series<KilowattHours>, &Series<KilowattHours>) {
        if p10 { (&self.pv_p10, &self.load_p10) } else { (&self.pv, &self.load) }
    }
}

/// Read-only tariff producer; calls are idempotent.
#[async_trait]
pub trait RateProvider {
    async fn fetch_rates(&self, now: DateTime<Utc>) -> Result<RateSet>;
}

/// Read-only forecast producer; calls are idempotent.
#[async_trait]
pub trait ForecastProvider {
    async fn fetch_forecast(&self, now: DateTime<Utc>) -> Result<ForecastSet>;
}

/// Provider data with holes, as fetched from the wire. PV gaps fill with
/// zero; load gaps fill with the average of the known samples so a missing
/// stretch never reads as a free lunch. Never produces NaN.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SparseForecast {
    pub origin_minute: i32,
    pub step_minutes: i32,
    pub pv: Vec<Option<f64>>,
    pub pv_p10: Vec<Option<f64>>,
    pub load: Vec<Option<f64>>,
    pub load_p10: Vec<Option<f64>>,
}

impl SparseForecast {
    pub fn into_dense(self) -> ForecastSet {
        let (pv, pv_gaps) = Series::from_sparse(self.origin_minute, self.step_minutes, &self.pv, 0.0);
        let (pv_p10, _) =
            Series::from_sparse(self.origin_minute, self.step_minutes, &self.pv_p10, 0.0);
        let load_fill = Series::average_of(&self.load);
        let (load, load_gaps) =
            Series::from_sparse(self.origin_minute, self.step_minutes, &self.load, load_fill);
        let load_p10_fill = Series::average_of(&self.load_p10);
        let (load_p10, _) =
            Series::from_sparse(self.origin_minute, self.step_minutes, &self.load_p10, load_p10_fill);
        if pv_gaps > 0 || load_gaps > 0 {
            warn!(pv_gaps, load_gaps, "forecast has gaps, filled");
        }
        ForecastSet {
            pv: pv.map(Quantity),
            pv_p10: pv_p10.map(Quantity),
            load: load.map(Quantity),
            load_p10: load_p10.map(Quantity),
            temperature: None,
            alert_keep: None,
        }
    }
}

/// On-disk fixture bundling rates and forecasts, the file-backed provider
/// used by the command-line surface and the tests.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Fixture {
    pub rates: RateSet,
    pub forecast: ForecastSet,
}

impl Fixture {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read fixture {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("malformed fixture {}", path.display()))
    }
}

#[async_trait]
impl RateProvider for Fixture {
    async fn fetch_rates(&self, _now: DateTime<Utc>) -> Result<RateSet> {
        Ok(self.rates.clone())
    }
}

#[async_trait]
impl ForecastProvider for Fixture {
    async fn fetch_forecast(&self, _now: DateTime<Utc>) -> Result<ForecastSet> {
        Ok(self.forecast.clone())
    }
}
