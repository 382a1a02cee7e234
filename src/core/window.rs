use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{core::MINUTES_PER_DAY, quantity::time::Hours};

/// Half-open interval `[start, end)` in whole minutes since the midnight
/// anchor. Minutes beyond `24 * 60` fall on the following day.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub start: i32,
    pub end: i32,
}

impl Window {
    pub fn new(start: i32, end: i32) -> Self {
        assert!(start < end, "window must not be empty: [{start}, {end})");
        Self { start, end }
    }

    pub const fn contains(self, minute: i32) -> bool {
        minute >= self.start && minute < self.end
    }

    pub const fn minutes(self) -> i32 {
        self.end - self.start
    }

    pub fn hours(self) -> Hours {
        Hours::from_minutes(self.minutes())
    }

    pub const fn overlaps(self, other: Self) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Does the window straddle the midnight anchor?
    pub const fn spans_midnight(self) -> bool {
        self.start < MINUTES_PER_DAY && self.end > MINUTES_PER_DAY
    }

    /// Crop for hardware whose start/end registers cannot wrap past midnight.
    pub fn crop_to_midnight(self) -> Self {
        if self.spans_midnight() { Self { end: MINUTES_PER_DAY - 1, ..self } } else { self }
    }

    /// A stale window a full day long (or longer) would wrap on registers
    /// that only hold 24 hours, so move the start to the nearest half-hour
    /// at or after the current minute.
    pub fn advance_for_register_wrap(self, minutes_now: i32) -> Self {
        if self.start < minutes_now && self.minutes() >= MINUTES_PER_DAY {
            let start = (minutes_now + 29) / 30 * 30;
            Self { start: start.min(self.end - 1), end: self.end }
        } else {
            self
        }
    }
}

/// Crop or drop `windows` wherever they intersect one of the `blockers`
/// (the export set — export wins). Limits travel with their windows.
/// Order and gaps are preserved; a fully covered window is removed.
pub fn remove_intersections<L: Copy>(
    windows: &[Window],
    limits: &[L],
    blockers: &[Window],
) -> (Vec<Window>, Vec<L>) {
    let mut kept_windows = Vec::with_capacity(windows.len());
    let mut kept_limits = Vec::with_capacity(limits.len());
    for (&window, &limit) in windows.iter().zip(limits) {
        let mut window = window;
        let mut dropped = false;
        for &blocker in blockers {
            if !window.overlaps(blocker) {
                continue;
            }
            if blocker.start <= window.start && blocker.end >= window.end {
                dropped = true;
                break;
            }
            if blocker.start <= window.start {
                window.start = blocker.end;
            } else {
                window.end = blocker.start;
            }
        }
        if !dropped && window.start < window.end {
            kept_windows.push(window);
            kept_limits.push(limit);
        }
    }
    (kept_windows, kept_limits)
}

/// Fuse windows whose end touches the next window's start. Used when the
/// executor decides the effective extent of the upcoming charge window.
pub fn merge_contiguous(windows: &[Window]) -> Vec<Window> {
    windows
        .iter()
        .copied()
        .coalesce(|left, right| {
            if left.end == right.start {
                Ok(Window { start: left.start, end: right.end })
            } else {
                Err((left, right))
            }
        })
        .collect()
}

/// Minute-to-window lookup table for the simulator's inner loop. Dense per
/// minute, so a lookup is a single bounds check and array read.
pub struct WindowIndex {
    first_minute: i32,
    table: Vec<Option<u16>>,
}

impl WindowIndex {
    pub fn build(windows: &[Window]) -> Self {
        assert!(windows.len() < usize::from(u16::MAX));
        let first_minute = windows.iter().map(|window| window.start).min().unwrap_or(0);
        let last_minute = windows.iter().map(|window| window.end).max().unwrap_or(0);
        let mut table = vec![None; (last_minute - first_minute).max(0) as usize];
        for (index, window) in windows.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let id = index as u16;
            for minute in window.start..window.end {
                table[(minute - first_minute) as usize] = Some(id);
            }
        }
        Self { first_minute, table }
    }

    pub fn window_at(&self, minute: i32) -> Option<usize> {
        let offset = minute - self.first_minute;
        if offset < 0 {
            return None;
        }
        self.table.get(offset as usize).copied().flatten().map(usize::from)
    }
}
