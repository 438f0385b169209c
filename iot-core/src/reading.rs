//! Simulated utility readings.

use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingKind {
    Water,
    Power,
}

/// Source of the values a sensor reports.
pub trait ReadingSource: Send + Sync {
    fn current_reading(&self, kind: ReadingKind) -> f64;
}

/// Each kind oscillates as `max * |sin(unix millis)|`, so values land in `[0, max]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SineReading {
    pub water: f64,
    pub power: f64,
}

impl SineReading {
    pub fn new(water: f64, power: f64) -> Self {
        Self { water, power }
    }

    fn at(&self, kind: ReadingKind, millis: u128) -> f64 {
        let max = match kind {
            ReadingKind::Water => self.water,
            ReadingKind::Power => self.power,
        };
        max * (millis as f64).sin().abs()
    }
}

impl Default for SineReading {
    fn default() -> Self {
        Self::new(10.0, 10.0)
    }
}

impl ReadingSource for SineReading {
    fn current_reading(&self, kind: ReadingKind) -> f64 {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        self.at(kind, millis)
    }
}

/// Always returns the same values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedReading {
    pub water: f64,
    pub power: f64,
}

impl ReadingSource for FixedReading {
    fn current_reading(&self, kind: ReadingKind) -> f64 {
        match kind {
            ReadingKind::Water => self.water,
            ReadingKind::Power => self.power,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sine_stays_within_amplitude() {
        let src = SineReading::new(10.0, 4.0);
        for millis in [0u128, 1, 2, 1_686_800_000_123, 1_686_800_000_777] {
            let w = src.at(ReadingKind::Water, millis);
            let p = src.at(ReadingKind::Power, millis);
            assert!((0.0..=10.0).contains(&w));
            assert!((0.0..=4.0).contains(&p));
        }
        assert_eq!(src.at(ReadingKind::Water, 0), 0.0);
    }

    #[test]
    fn fixed_source() {
        let src = FixedReading { water: 3.0, power: 7.0 };
        assert_eq!(src.current_reading(ReadingKind::Water), 3.0);
        assert_eq!(src.current_reading(ReadingKind::Power), 7.0);
    }
}
