//! Shared helpers: durations, timeouts, argument lookup and sub-task identity

use crate::crds::experiment::{ArgsUnit, ARGS_LIST_SPLIT};
use crate::tasks::types::{Error, Result};
use chrono::{Local, NaiveDateTime, TimeZone};
use std::collections::HashSet;
use std::time::Duration;

/// Layout of every timestamp stored in experiment status
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[must_use]
pub fn now_string() -> String {
    Local::now().format(TIME_FORMAT).to_string()
}

/// Parse `<int>[h|m|s]`; a bare integer is seconds.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let (digits, unit_seconds) = match raw.chars().last() {
        Some('h') => (&raw[..raw.len() - 1], 3600),
        Some('m') => (&raw[..raw.len() - 1], 60),
        Some('s') => (&raw[..raw.len() - 1], 1),
        Some(_) => (raw, 1),
        None => {
            return Err(Error::InvalidArgument("duration is empty".to_string()));
        }
    };

    let value: u64 = digits.parse().map_err(|e| {
        Error::InvalidArgument(format!("duration[{raw}] is not a valid number: {e}"))
    })?;

    let seconds = value
        .checked_mul(unit_seconds)
        .ok_or_else(|| Error::InvalidArgument(format!("duration[{raw}] is too large")))?;
    Ok(Duration::from_secs(seconds))
}

/// Whether `create_time + duration` is already in the past.
///
/// An empty duration never times out, nor does one too large to add to a date.
pub fn is_timeout(create_time: &str, duration: &str) -> Result<bool> {
    if duration.is_empty() {
        return Ok(false);
    }

    let duration = parse_duration(duration)?;
    let created = NaiveDateTime::parse_from_str(create_time, TIME_FORMAT).map_err(|e| {
        Error::InvalidArgument(format!("createTime[{create_time}] is invalid: {e}"))
    })?;
    let created = Local
        .from_local_datetime(&created)
        .earliest()
        .ok_or_else(|| Error::InvalidArgument(format!("createTime[{create_time}] is ambiguous")))?;

    // A deadline past the representable range is never reached.
    let deadline = chrono::Duration::from_std(duration)
        .ok()
        .and_then(|duration| created.checked_add_signed(duration));
    Ok(deadline.is_some_and(|deadline| deadline < Local::now()))
}

/// First value for `key`, if present.
#[must_use]
pub fn get_arg<'a>(args: &'a [ArgsUnit], key: &str) -> Option<&'a str> {
    args.iter()
        .find(|unit| unit.key == key)
        .map(|unit| unit.value.as_str())
}

/// Split a comma-joined argument, skipping empty entries.
#[must_use]
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(ARGS_LIST_SPLIT)
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect()
}

/// Fresh sub-task uid: local timestamp followed by eight random hex digits.
#[must_use]
pub fn new_uid() -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}{}",
        Local::now().format("%Y%m%d%H%M%S"),
        &random[..8]
    )
}

/// Generate `count` uids that are distinct from each other.
#[must_use]
pub fn new_uids(count: usize) -> Vec<String> {
    let mut seen = HashSet::with_capacity(count);
    let mut uids = Vec::with_capacity(count);
    while uids.len() < count {
        let uid = new_uid();
        if seen.insert(uid.clone()) {
            uids.push(uid);
        }
    }
    uids
}
