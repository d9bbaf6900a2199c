//! Row projection: turning a raw source row into the semantic fields the
//! importer understands, plus the small parsing helpers those fields need.

use rocket_okapi::okapi::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Attachment reference separators, checked in this priority order. The first
/// one present in a value is the only one used to split it.
pub const ATTACHMENT_SEPARATORS: [char; 3] = ['|', ';', ','];

/// Number of data rows returned by [`preview`].
pub const PREVIEW_ROWS: usize = 5;

/// Caller-chosen mapping from semantic fields to source column names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct ColumnMapping {
    pub name: Option<String>,
    pub price: Option<String>,
    pub description: Option<String>,
    pub external_id: Option<String>,
    pub attachment_refs: Option<String>,
    pub category_label: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("column mapping must name a column for `{0}`")]
    MissingField(&'static str),
    #[error("mapped column '{0}' is not present in the header row")]
    UnknownColumn(String),
    #[error("record source has no header row")]
    NoHeader,
}

/// Column positions resolved against a concrete header row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedMapping {
    name: usize,
    external_id: usize,
    price: Option<usize>,
    description: Option<usize>,
    attachment_refs: Option<usize>,
    category_label: Option<usize>,
}

impl ColumnMapping {
    /// Resolve column names to indices. `name` and `external_id` are mandatory.
    pub fn resolve(&self, header: &[String]) -> Result<ResolvedMapping, MappingError> {
        let required = |field: &'static str, column: &Option<String>| match column {
            Some(column) if !column.trim().is_empty() => column_index(header, column),
            _ => Err(MappingError::MissingField(field)),
        };
        let optional = |column: &Option<String>| match column {
            Some(column) if !column.trim().is_empty() => column_index(header, column).map(Some),
            _ => Ok(None),
        };

        Ok(ResolvedMapping {
            name: required("name", &self.name)?,
            external_id: required("externalId", &self.external_id)?,
            price: optional(&self.price)?,
            description: optional(&self.description)?,
            attachment_refs: optional(&self.attachment_refs)?,
            category_label: optional(&self.category_label)?,
        })
    }
}

// Duplicate header names resolve to the last occurrence.
fn column_index(header: &[String], column: &str) -> Result<usize, MappingError> {
    header
        .iter()
        .rposition(|candidate| candidate == column)
        .ok_or_else(|| MappingError::UnknownColumn(column.to_string()))
}

/// One source row viewed through a [`ResolvedMapping`]. Blank cells read as absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportRow<'r> {
    pub name: Option<&'r str>,
    pub price: Option<&'r str>,
    pub description: Option<&'r str>,
    pub external_id: Option<&'r str>,
    pub attachment_refs: Option<&'r str>,
    pub category_label: Option<&'r str>,
}

impl ResolvedMapping {
    pub fn project<'r>(&self, row: &'r [String]) -> ImportRow<'r> {
        let cell = |idx: Option<usize>| {
            idx.and_then(|i| row.get(i))
                .map(|value| value.trim())
                .filter(|value| !value.is_empty())
        };

        ImportRow {
            name: cell(Some(self.name)),
            price: cell(self.price),
            description: cell(self.description),
            external_id: cell(Some(self.external_id)),
            attachment_refs: cell(self.attachment_refs),
            category_label: cell(self.category_label),
        }
    }
}

/// Split a multi-value attachment cell on the first separator (by priority)
/// that occurs in it, dropping empty pieces.
pub fn split_attachment_refs(raw: &str) -> Vec<&str> {
    match ATTACHMENT_SEPARATORS.iter().find(|sep| raw.contains(**sep)) {
        Some(sep) => raw
            .split(*sep)
            .map(str::trim)
            .filter(|piece| !piece.is_empty())
            .collect(),
        None => {
            let single = raw.trim();
            if single.is_empty() {
                Vec::new()
            } else {
                vec![single]
            }
        }
    }
}

fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_dash = false;
    for ch in input.chars() {
        if ch.is_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.extend(ch.to_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}

/// Deterministic product slug from name and external id.
pub fn product_slug(name: &str, external_id: &str) -> String {
    let name = slugify(name);
    let id = slugify(external_id);
    match (name.is_empty(), id.is_empty()) {
        (false, false) => format!("{name}-{id}"),
        (true, _) => id,
        (false, true) => name,
    }
}

/// Parse a free-form price cell into minor units. Anything unparseable is zero.
pub fn parse_price_cents(raw: Option<&str>) -> i64 {
    let Some(raw) = raw else {
        return 0;
    };

    let compact: String = raw
        .chars()
        .filter(|ch| !ch.is_whitespace())
        .map(|ch| if ch == ',' { '.' } else { ch })
        .take_while(|ch| ch.is_ascii_digit() || *ch == '.')
        .collect();

    let mut parts = compact.split('.');
    let whole = parts.next().unwrap_or_default();
    let fraction = parts.next().unwrap_or_default();
    if parts.next().is_some() || (whole.is_empty() && fraction.is_empty()) {
        return 0;
    }

    let whole: i64 = if whole.is_empty() {
        0
    } else {
        match whole.parse() {
            Ok(value) => value,
            Err(_) => return 0,
        }
    };

    let cents: i64 = match fraction.len() {
        0 => 0,
        1 => fraction.parse::<i64>().map(|v| v * 10).unwrap_or(0),
        _ => fraction[..2].parse().unwrap_or(0),
    };

    whole.saturating_mul(100).saturating_add(cents)
}

/// Header and first data rows of a source, for choosing a mapping.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Preview {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

pub fn preview(rows: &[Vec<String>]) -> Preview {
    match rows.split_first() {
        Some((header, data)) => Preview {
            columns: header.clone(),
            rows: data.iter().take(PREVIEW_ROWS).cloned().collect(),
        },
        None => Preview {
            columns: Vec::new(),
            rows: Vec::new(),
        },
    }
}
