use crate::quantity::Quantity;

pub type Hours = Quantity<f64, 0, 1, 0>;

impl Hours {
    pub fn from_minutes(minutes: i32) -> Self {
        Self(f64::from(minutes) / 60.0)
    }
}
