//! System metrics module
//!
//! Exposes CPU, memory, uptime and load average readings. The CRON
//! variable `sys_refresh` refreshes the shared sysinfo cache once per tick
//! so the other variables stay cheap to evaluate.

use crate::shared_system::with_snapshot;
use sensd_core::{Callable, StaticModule, Value, VarType};
use sysinfo::System;

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;
const BYTES_PER_GIB: f64 = BYTES_PER_MIB * 1024.0;

/// Build the `sys` module
pub fn sys_module() -> StaticModule {
    StaticModule::new("sys")
        .variable(
            "sys_refresh",
            0,
            VarType::VARIABLE_STR | VarType::VARIABLE_CRON,
            Callable::no_arg(|| {
                with_snapshot(|s| s.refresh_if_needed());
                Value::text("")
            }),
        )
        .variable(
            "cpu",
            1,
            VarType::VARIABLE_BAR,
            Callable::no_arg(|| Value::level(with_snapshot(|s| s.global_cpu.round() as i64))),
        )
        .variable(
            "cpugraph",
            1,
            VarType::VARIABLE_GRAPH,
            Callable::no_arg(|| Value::level(with_snapshot(|s| s.global_cpu.round() as i64))),
        )
        .variable(
            "cpucore",
            1,
            VarType::VARIABLE_BAR | VarType::ARG_INT,
            Callable::with_int(core_usage),
        )
        .variable(
            "mem",
            2,
            VarType::VARIABLE_BAR,
            Callable::no_arg(|| Value::level(with_snapshot(|s| s.memory_percent()))),
        )
        .variable(
            "memused",
            2,
            VarType::VARIABLE_STR,
            Callable::no_arg(|| Value::text(format_bytes(with_snapshot(|s| s.used_memory)))),
        )
        .variable(
            "uptime",
            60,
            VarType::VARIABLE_STR,
            Callable::no_arg(|| Value::text(format_uptime(System::uptime()))),
        )
        .variable(
            "loadavg",
            5,
            VarType::VARIABLE_STR | VarType::ARG_INT,
            Callable::with_int(load_average),
        )
        .on_teardown(|| log::debug!("sys module torn down"))
}

/// Usage of one core; a negative index means the global figure
fn core_usage(index: i64) -> Value {
    with_snapshot(|s| {
        let usage = usize::try_from(index)
            .ok()
            .and_then(|i| s.per_core.get(i).copied())
            .unwrap_or(s.global_cpu);
        Value::level(usage.round() as i64)
    })
}

/// One of the 1/5/15 minute averages, or all three when `which` is not 1..=3
fn load_average(which: i64) -> Value {
    let load = System::load_average();
    let text = match which {
        1 => format!("{:.2}", load.one),
        2 => format!("{:.2}", load.five),
        3 => format!("{:.2}", load.fifteen),
        _ => format!("{:.2} {:.2} {:.2}", load.one, load.five, load.fifteen),
    };
    Value::Text(text)
}

fn format_bytes(bytes: u64) -> String {
    let bytes = bytes as f64;
    if bytes >= BYTES_PER_GIB {
        format!("{:.1}GiB", bytes / BYTES_PER_GIB)
    } else {
        format!("{:.0}MiB", bytes / BYTES_PER_MIB)
    }
}

fn format_uptime(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    if days > 0 {
        format!("{}d {}h {}m", days, hours, minutes)
    } else {
        format!("{}h {}m", hours, minutes)
    }
}
