//! Task-machine ledger rules.
//!
//! Everything in here is storage free: parsing of loosely typed form values,
//! alignment of positional arrays into line items, and the usage/cost formula.
//! The lifecycle engine in [`super::tasks`] applies the results inside a
//! transaction.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use utoipa::ToSchema;

/// A scalar form value. Browsers post strings, API clients post numbers; both
/// are accepted and interpreted the same way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

impl FieldValue {
    /// Form truthiness: an empty string, zero and NaN are "not supplied".
    pub fn is_truthy(&self) -> bool {
        match self {
            FieldValue::Number(n) => *n != 0.0 && !n.is_nan(),
            FieldValue::Text(s) => !s.is_empty(),
        }
    }

    /// True for an absent-looking value: empty or whitespace-only text.
    pub fn is_blank(&self) -> bool {
        matches!(self, FieldValue::Text(s) if s.trim().is_empty())
    }

    /// Lenient numeric reading: the longest leading decimal literal, if any.
    pub fn to_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) if n.is_finite() => Some(*n),
            FieldValue::Number(_) => None,
            FieldValue::Text(s) => parse_float(s),
        }
    }

    /// Reads the value as a row id. Text must be an integer literal.
    pub fn to_id(&self) -> Option<i32> {
        match self {
            FieldValue::Number(n) if n.fract() == 0.0 && n.is_finite() => {
                i32::try_from(*n as i64).ok()
            }
            FieldValue::Number(_) => None,
            FieldValue::Text(s) => s.trim().parse::<i32>().ok(),
        }
    }

    /// Key used to detect repeated selections: `"7"` and `7` are the same id.
    fn selection_key(&self) -> String {
        match self.to_id() {
            Some(id) => id.to_string(),
            None => match self {
                FieldValue::Number(n) => n.to_string(),
                FieldValue::Text(s) => s.trim().to_string(),
            },
        }
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Number(f64::from(value))
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

/// Parses the longest numeric prefix of `raw`, ignoring leading whitespace.
/// `"105"`, `"105.5h"` and `" 1e2"` all parse; `"abc"` and `""` do not.
pub fn parse_float(raw: &str) -> Option<f64> {
    let s = raw.trim_start();
    let bytes = s.as_bytes();
    let mut end = 0;

    if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
        end += 1;
    }

    let int_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    let mut digits = end - int_start;

    if end < bytes.len() && bytes[end] == b'.' {
        let frac_start = end + 1;
        let mut frac_end = frac_start;
        while frac_end < bytes.len() && bytes[frac_end].is_ascii_digit() {
            frac_end += 1;
        }
        digits += frac_end - frac_start;
        if digits > 0 {
            end = frac_end;
        }
    }

    if digits == 0 {
        return None;
    }

    if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        let mut exp_end = end + 1;
        if exp_end < bytes.len() && (bytes[exp_end] == b'+' || bytes[exp_end] == b'-') {
            exp_end += 1;
        }
        let exp_digits_start = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > exp_digits_start {
            end = exp_end;
        }
    }

    s[..end].parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Numeric reading with the "unparseable means zero" fallback.
pub fn number_or_zero(value: Option<&FieldValue>) -> f64 {
    value.and_then(FieldValue::to_number).unwrap_or(0.0)
}

/// Computed figures for a finished ledger line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Usage {
    pub hours_worked: f64,
    pub total_amount: f64,
}

/// `hours = max(0, end - start)`, `amount = max(0, hours * rate)`.
/// Negative results clamp to zero; they are never errors.
pub fn compute_usage(start_time: f64, end_time: f64, hourly_rate: f64) -> Usage {
    let hours = end_time - start_time;
    let hours_worked = if hours > 0.0 { hours } else { 0.0 };
    let amount = hours_worked * hourly_rate;
    let total_amount = if amount > 0.0 { amount } else { 0.0 };
    Usage {
        hours_worked,
        total_amount,
    }
}

/// One machine selection on the create form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct LineItem {
    #[serde(default, alias = "machineId")]
    pub machine_id: Option<FieldValue>,
    #[serde(default, alias = "startTime")]
    pub start_time: Option<FieldValue>,
    #[serde(default, alias = "hourlyRate")]
    pub hourly_rate: Option<FieldValue>,
}

/// One end-reading on the edit form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct FinishLine {
    #[serde(default, alias = "taskMachineId")]
    pub task_machine_id: Option<FieldValue>,
    #[serde(default, alias = "endTime")]
    pub end_time: Option<FieldValue>,
}

fn at(values: &[Option<FieldValue>], index: usize) -> Option<FieldValue> {
    values.get(index).cloned().flatten()
}

/// Zips positional arrays into line items. Explicit items win when present;
/// otherwise the arrays are aligned by index and missing cells become `None`.
pub fn align_line_items(
    items: Vec<LineItem>,
    machine_ids: &[Option<FieldValue>],
    start_times: &[Option<FieldValue>],
    hourly_rates: &[Option<FieldValue>],
) -> Vec<LineItem> {
    if !items.is_empty() {
        return items;
    }
    let len = machine_ids
        .len()
        .max(start_times.len())
        .max(hourly_rates.len());
    (0..len)
        .map(|i| LineItem {
            machine_id: at(machine_ids, i),
            start_time: at(start_times, i),
            hourly_rate: at(hourly_rates, i),
        })
        .collect()
}

/// Same as [`align_line_items`] for the finish arrays.
pub fn align_finish_lines(
    items: Vec<FinishLine>,
    task_machine_ids: &[Option<FieldValue>],
    end_times: &[Option<FieldValue>],
) -> Vec<FinishLine> {
    if !items.is_empty() {
        return items;
    }
    let len = task_machine_ids.len().max(end_times.len());
    (0..len)
        .map(|i| FinishLine {
            task_machine_id: at(task_machine_ids, i),
            end_time: at(end_times, i),
        })
        .collect()
}

#[derive(Debug, Error, PartialEq)]
pub enum SelectionError {
    #[error("the same machine cannot be added more than once to a task")]
    Duplicate,
    #[error("selected machine {0:?} does not exist")]
    Invalid(String),
}

/// Ids of every machine selected on the form, in order. Empty selections are
/// ignored; a repeated id or one that is not an id at all is rejected.
pub fn selected_machine_ids(items: &[LineItem]) -> Result<Vec<i32>, SelectionError> {
    let selected: Vec<&FieldValue> = items
        .iter()
        .filter_map(|item| item.machine_id.as_ref())
        .filter(|value| value.is_truthy())
        .collect();

    let mut seen = HashSet::new();
    for value in &selected {
        if !seen.insert(value.selection_key()) {
            return Err(SelectionError::Duplicate);
        }
    }

    selected
        .into_iter()
        .map(|value| {
            value
                .to_id()
                .ok_or_else(|| SelectionError::Invalid(value.selection_key()))
        })
        .collect()
}

/// A ledger line to be opened on a new task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attachment {
    pub machine_id: i32,
    pub start_time: f64,
    pub hourly_rate: f64,
}

/// Lines to open: only rows with both a machine and a start reading.
/// Rows with a machine but no start reading are skipped silently.
pub fn plan_attachments(items: &[LineItem]) -> Vec<Attachment> {
    items
        .iter()
        .filter_map(|item| {
            let machine = item.machine_id.as_ref().filter(|v| v.is_truthy())?;
            let start = item.start_time.as_ref().filter(|v| v.is_truthy())?;
            Some(Attachment {
                machine_id: machine.to_id()?,
                start_time: start.to_number().unwrap_or(0.0),
                hourly_rate: number_or_zero(item.hourly_rate.as_ref()),
            })
        })
        .collect()
}

#[derive(Debug, Error, PartialEq)]
pub enum FinishError {
    #[error("end time must be a positive number (got {0:?})")]
    InvalidEndTime(String),
    #[error("ledger line {0:?} not found")]
    UnknownLine(String),
}

/// An end reading to record on an existing ledger line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Finish {
    pub task_machine_id: i32,
    pub end_time: f64,
}

fn describe(value: &FieldValue) -> String {
    match value {
        FieldValue::Number(n) => n.to_string(),
        FieldValue::Text(s) => s.clone(),
    }
}

/// Validates every end reading before anything is written.
///
/// A blank reading leaves the line open. Zero (numeric or `"0"`), negative and
/// non-numeric readings reject the whole edit.
pub fn plan_finishes(lines: &[FinishLine]) -> Result<Vec<Finish>, FinishError> {
    let mut finishes = Vec::new();
    for line in lines {
        let Some(id_value) = line.task_machine_id.as_ref().filter(|v| v.is_truthy()) else {
            continue;
        };
        let Some(end_value) = line.end_time.as_ref() else {
            continue;
        };
        if end_value.is_blank() {
            continue;
        }

        let end_time = end_value
            .to_number()
            .filter(|end| *end > 0.0)
            .ok_or_else(|| FinishError::InvalidEndTime(describe(end_value)))?;
        let task_machine_id = id_value
            .to_id()
            .ok_or_else(|| FinishError::UnknownLine(describe(id_value)))?;

        finishes.push(Finish {
            task_machine_id,
            end_time,
        });
    }
    Ok(finishes)
}

/// A task is finished when it has lines and every one has a positive end.
pub fn all_lines_finished<I>(end_times: I) -> bool
where
    I: IntoIterator<Item = Option<f64>>,
{
    let mut any = false;
    for end in end_times {
        any = true;
        if !matches!(end, Some(value) if value > 0.0) {
            return false;
        }
    }
    any
}
