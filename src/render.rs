use comfy_table::{Cell, Color, Table, modifiers, presets};

use crate::{
    core::{
        plan::Plan,
        sim::{Outcome, Regime},
    },
    inverter::InverterSnapshot,
};

fn new_table() -> Table {
    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED).apply_modifier(modifiers::UTF8_ROUND_CORNERS);
    table
}

fn format_minutes(minute: i32) -> String {
    let day = minute.div_euclid(24 * 60);
    let minute_of_day = minute.rem_euclid(24 * 60);
    let base = format!("{:02}:{:02}", minute_of_day / 60, minute_of_day % 60);
    if day > 0 { format!("{base}+{day}d") } else { base }
}

/// The simulated plan trace, one row per step, rounded for reading only.
#[must_use]
pub fn render_trace(outcome: &Outcome, every_minutes: i32) -> Table {
    let mut table = new_table();
    table.set_header(vec![
        "Time",
        "Rate\np/kWh",
        "PV\nkWh",
        "Load\nkWh",
        "Battery\nkWh",
        "Grid\nkWh",
        "SoC\nkWh",
        "Mode",
        "Metric\np",
    ]);
    for trace in &outcome.traces {
        if trace.minute % every_minutes != 0 {
            continue;
        }
        let mode_color = match trace.regime {
            Regime::ForceCharge => Color::Green,
            Regime::ForceExport => Color::Red,
            Regime::FreezeCharge | Regime::FreezeExport => Color::Cyan,
            Regime::Demand => Color::Reset,
        };
        table.add_row(vec![
            Cell::new(format_minutes(trace.minute_absolute)),
            Cell::new(format!("{:.2}", trace.import_rate.0)),
            Cell::new(format!("{:.2}", trace.pv.0)),
            Cell::new(format!("{:.2}", trace.load.0)),
            Cell::new(format!("{:+.3}", -trace.battery_draw.0)),
            Cell::new(format!("{:+.3}", trace.grid.0)).fg(if trace.grid.0 > 0.0 {
                Color::Red
            } else {
                Color::Green
            }),
            Cell::new(format!("{:.2}", trace.soc.0)),
            Cell::new(trace.regime.to_string()).fg(mode_color),
            Cell::new(format!("{:.1}", trace.metric.0)),
        ]);
    }
    table
}

/// The plan's windows as a single table.
#[must_use]
pub fn render_plan(plan: &Plan) -> Table {
    let mut table = new_table();
    table.set_header(vec!["Kind", "Start", "End", "Target"]);
    for slot in &plan.charge_windows {
        table.add_row(vec![
            Cell::new("charge").fg(Color::Green),
            Cell::new(format_minutes(slot.window.start)),
            Cell::new(format_minutes(slot.window.end)),
            Cell::new(format!("{:.0}%", slot.target_soc_percent)),
        ]);
    }
    for slot in &plan.export_windows {
        table.add_row(vec![
            Cell::new("export").fg(Color::Red),
            Cell::new(format_minutes(slot.window.start)),
            Cell::new(format_minutes(slot.window.end)),
            Cell::new(format!("{:.1}%", slot.limit.percent())),
        ]);
    }
    for (car, slots) in plan.car_windows.iter().enumerate() {
        for slot in slots {
            table.add_row(vec![
                Cell::new(format!("car {car}")),
                Cell::new(format_minutes(slot.window.start)),
                Cell::new(format_minutes(slot.window.end)),
                Cell::new(format!("{:.1} kWh", slot.kwh.0)),
            ]);
        }
    }
    for slot in &plan.iboost_windows {
        table.add_row(vec![
            Cell::new("iboost").fg(Color::Yellow),
            Cell::new(format_minutes(slot.window.start)),
            Cell::new(format_minutes(slot.window.end)),
            Cell::new(format!("{:.1} kWh", slot.kwh.0)),
        ]);
    }
    table
}

/// Per-inverter state after a tick.
#[must_use]
pub fn render_snapshots<'a>(snapshots: impl IntoIterator<Item = &'a InverterSnapshot>) -> Table {
    let mut table = new_table();
    table.set_header(vec![
        "SoC\nkWh",
        "SoC\n%",
        "Charge rate\nkW",
        "Discharge rate\nkW",
        "Reserve\n%",
        "Charge window",
    ]);
    for snapshot in snapshots {
        table.add_row(vec![
            Cell::new(format!("{:.2}", snapshot.soc.0)),
            Cell::new(format!("{:.0}", snapshot.soc_percent)),
            Cell::new(format!("{:.2}", snapshot.charge_rate_now.0)),
            Cell::new(format!("{:.2}", snapshot.discharge_rate_now.0)),
            Cell::new(format!("{:.0}", snapshot.reserve_current_percent)),
            Cell::new(snapshot.charge_window.map_or_else(
                || "-".to_string(),
                |window| {
                    format!("{} - {}", format_minutes(window.start), format_minutes(window.end))
                },
            )),
        ]);
    }
    table
}
