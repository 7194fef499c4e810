//! Clock module
//!
//! Local and UTC time formatted with strftime patterns supplied as the
//! subscription argument.

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local, TimeZone, Utc};
use sensd_core::{Callable, StaticModule, Value, VarType};
use std::fmt::{Display, Write};

const DEFAULT_TIME_FORMAT: &str = "%H:%M:%S";
const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d";

/// Build the `clock` module
pub fn clock_module() -> StaticModule {
    StaticModule::new("clock")
        .variable(
            "time",
            1,
            VarType::VARIABLE_STR | VarType::ARG_STR,
            Callable::with_str(|pattern| {
                Value::Text(format_time(&Local::now(), pattern, DEFAULT_TIME_FORMAT))
            }),
        )
        .variable(
            "utime",
            1,
            VarType::VARIABLE_STR | VarType::ARG_STR,
            Callable::with_str(|pattern| {
                Value::Text(format_time(&Utc::now(), pattern, DEFAULT_TIME_FORMAT))
            }),
        )
        .variable(
            "date",
            60,
            VarType::VARIABLE_STR,
            Callable::no_arg(|| Value::Text(format_time(&Local::now(), "", DEFAULT_DATE_FORMAT))),
        )
}

/// Format `time` with `pattern`, falling back to `default` when the pattern
/// is empty; an invalid pattern yields an empty string
fn format_time<Tz>(time: &DateTime<Tz>, pattern: &str, default: &str) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let pattern = if pattern.trim().is_empty() { default } else { pattern };
    let items: Vec<Item<'_>> = StrftimeItems::new(pattern).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        log::debug!("Invalid time format {:?}", pattern);
        return String::new();
    }
    let mut out = String::new();
    if write!(out, "{}", time.format_with_items(items.into_iter())).is_err() {
        return String::new();
    }
    out
}
