use serde::{Deserialize, Serialize};

/// Dense time series sampled every `step_minutes`, starting at `origin_minute`
/// on the horizon clock. Lookups outside the sampled range return the fill
/// value, so a short forecast degrades gracefully instead of panicking.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Series<T> {
    origin_minute: i32,
    step_minutes: i32,
    fill: T,
    values: Vec<T>,
}

impl<T: Copy> Series<T> {
    pub fn new(origin_minute: i32, step_minutes: i32, fill: T, values: Vec<T>) -> Self {
        assert!(step_minutes > 0);
        Self { origin_minute, step_minutes, fill, values }
    }

    /// Constant series covering any minute.
    pub fn flat(value: T) -> Self {
        Self { origin_minute: 0, step_minutes: 1, fill: value, values: Vec::new() }
    }

    pub fn at(&self, minute: i32) -> T {
        let index = (minute - self.origin_minute).div_euclid(self.step_minutes);
        if index < 0 {
            return self.fill;
        }
        self.values.get(index as usize).copied().unwrap_or(self.fill)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn map<U: Copy>(&self, f: impl Fn(T) -> U) -> Series<U> {
        Series {
            origin_minute: self.origin_minute,
            step_minutes: self.step_minutes,
            fill: f(self.fill),
            values: self.values.iter().copied().map(f).collect(),
        }
    }
}

impl Series<f64> {
    /// Build a dense series from provider data with holes. Missing samples are
    /// replaced by the given fill value; the number of filled holes is
    /// returned alongside so the caller can log the gap.
    pub fn from_sparse(
        origin_minute: i32,
        step_minutes: i32,
        samples: &[Option<f64>],
        fill: f64,
    ) -> (Self, usize) {
        let gaps = samples.iter().filter(|sample| sample.is_none()).count();
        let values = samples.iter().map(|sample| sample.unwrap_or(fill)).collect();
        (Self::new(origin_minute, step_minutes, 0.0, values), gaps)
    }

    /// Average of the present samples, or zero when there are none. Used as
    /// the conservative stand-in for missing load data.
    pub fn average_of(samples: &[Option<f64>]) -> f64 {
        let present: Vec<f64> = samples.iter().copied().flatten().collect();
        if present.is_empty() {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let count = present.len() as f64;
            present.iter().sum::<f64>() / count
        }
    }
}
