// Raw marketplace object -> ExtensionRecord

use crate::error::SchemaError;
use crate::models::{format_timestamp, ExtensionRecord, RawExtension};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Value};

/// Exclusive bound for counts; `i64::MAX as f64` rounds up to 2^63, one past
/// what the relational sink's signed INTEGER column holds
const MAX_COUNT: f64 = i64::MAX as f64;

/// Normalize one raw extension object
///
/// Required: `publisher.publisherId`, `publisher.publisherName`, `extensionId`,
/// `extensionName`, `lastUpdated`, `publishedDate`. Display names fall back to
/// the plain names, absent categories to an empty list, absent statistics to 0.
pub fn normalize(raw: &RawExtension) -> Result<ExtensionRecord, SchemaError> {
    let root = raw.as_value().as_object().ok_or(SchemaError::WrongShape {
        field: "extension",
        expected: "object",
    })?;

    let publisher = match root.get("publisher") {
        None | Some(Value::Null) => return Err(SchemaError::Missing("publisherId")),
        Some(Value::Object(publisher)) => publisher,
        Some(_) => {
            return Err(SchemaError::WrongShape {
                field: "publisher",
                expected: "object",
            })
        },
    };

    let publisher_id = required_str(publisher, "publisherId", "publisherId")?;
    let publisher_name = required_str(publisher, "publisherName", "publisherName")?;
    let publisher_display_name = optional_str(publisher, "displayName", "publisherDisplayName")?
        .unwrap_or_else(|| publisher_name.clone());

    let extension_id = required_str(root, "extensionId", "extensionId")?;
    let extension_name = required_str(root, "extensionName", "extensionName")?;
    let extension_display_name = optional_str(root, "displayName", "extensionDisplayName")?
        .unwrap_or_else(|| extension_name.clone());

    let last_updated = required_timestamp(root, "lastUpdated")?;
    let published_date = required_timestamp(root, "publishedDate")?;
    if last_updated < published_date {
        return Err(SchemaError::DateOrder {
            last_updated: format_timestamp(&last_updated),
            published_date: format_timestamp(&published_date),
        });
    }

    let categories = match root.get("categories") {
        None | Some(Value::Null) => Vec::new(),
        Some(value) => {
            let mut names = Vec::new();
            flatten_categories(value, &mut names)?;
            names
        },
    };

    let stats = Statistics::from_root(root)?;
    let average_rating = stats.float("averagerating")?;
    if !(0.0..=5.0).contains(&average_rating) {
        return Err(SchemaError::OutOfRange {
            field: "averagerating",
            detail: format!("{} is outside 0.0..=5.0", average_rating),
        });
    }

    Ok(ExtensionRecord {
        publisher_id,
        publisher_name,
        publisher_display_name,
        extension_id,
        extension_name,
        extension_display_name,
        last_updated,
        published_date,
        categories,
        install: stats.count("install")?,
        average_rating,
        rating_count: stats.count("ratingcount")?,
        trending_daily: stats.float("trendingdaily")?,
        trending_monthly: stats.float("trendingmonthly")?,
        download_count: stats.count("downloadCount")?,
    })
}

fn required_str(
    object: &Map<String, Value>,
    key: &str,
    field: &'static str,
) -> Result<String, SchemaError> {
    optional_str(object, key, field)?.ok_or(SchemaError::Missing(field))
}

/// Absent, null and blank strings all count as missing
fn optional_str(
    object: &Map<String, Value>,
    key: &str,
    field: &'static str,
) -> Result<Option<String>, SchemaError> {
    match object.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(_) => Err(SchemaError::WrongShape {
            field,
            expected: "string",
        }),
    }
}

fn required_timestamp(
    object: &Map<String, Value>,
    field: &'static str,
) -> Result<DateTime<Utc>, SchemaError> {
    let text = required_str(object, field, field)?;
    parse_timestamp(&text).ok_or(SchemaError::WrongShape {
        field,
        expected: "RFC 3339 timestamp or YYYY-MM-DD date",
    })
}

/// Accepts RFC 3339, a zone-less `YYYY-MM-DDTHH:MM:SS[.f]` (read as UTC), or a bare date
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Depth-first walk collecting category names in order
fn flatten_categories(value: &Value, out: &mut Vec<String>) -> Result<(), SchemaError> {
    const SHAPE: SchemaError = SchemaError::WrongShape {
        field: "categories",
        expected: "list of names or {name} objects",
    };

    match value {
        Value::String(name) => {
            push_name(name, out);
            Ok(())
        },
        Value::Array(items) => items.iter().try_for_each(|item| flatten_categories(item, out)),
        Value::Object(object) => {
            let name = ["name", "categoryName", "displayName"]
                .iter()
                .find_map(|key| object.get(*key));
            match name {
                Some(Value::String(name)) => {
                    push_name(name, out);
                    Ok(())
                },
                _ => Err(SHAPE),
            }
        },
        Value::Null => Ok(()),
        _ => Err(SHAPE),
    }
}

fn push_name(name: &str, out: &mut Vec<String>) {
    let name = name.trim();
    if !name.is_empty() {
        out.push(name.to_string());
    }
}

/// The `statistics` array of `{statisticName, value}` pairs
struct Statistics<'a> {
    entries: Vec<(&'a str, &'a Value)>,
}

impl<'a> Statistics<'a> {
    fn from_root(root: &'a Map<String, Value>) -> Result<Self, SchemaError> {
        let items = match root.get("statistics") {
            None | Some(Value::Null) => return Ok(Self { entries: Vec::new() }),
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(SchemaError::WrongShape {
                    field: "statistics",
                    expected: "array of {statisticName, value}",
                })
            },
        };

        let entries = items
            .iter()
            .filter_map(|item| {
                let name = item.get("statisticName")?.as_str()?;
                Some((name, item.get("value").unwrap_or(&Value::Null)))
            })
            .collect();

        Ok(Self { entries })
    }

    /// Last value reported under `name`; the marketplace occasionally repeats one
    fn get(&self, name: &str) -> Option<&'a Value> {
        self.entries
            .iter()
            .rev()
            .find(|(stat, _)| *stat == name)
            .map(|(_, value)| *value)
    }

    fn float(&self, field: &'static str) -> Result<f64, SchemaError> {
        match self.get(field) {
            None | Some(Value::Null) => Ok(0.0),
            Some(value) => coerce_number(value).ok_or(SchemaError::WrongShape {
                field,
                expected: "finite number",
            }),
        }
    }

    fn count(&self, field: &'static str) -> Result<u64, SchemaError> {
        let value = self.float(field)?;
        if !(0.0..MAX_COUNT).contains(&value) {
            return Err(SchemaError::OutOfRange {
                field,
                detail: format!("{} is not a non-negative count", value),
            });
        }
        // install counts arrive as floats (e.g. 1523.0); the fraction carries nothing
        Ok(value.trunc() as u64)
    }
}

fn coerce_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    number.is_finite().then_some(number)
}
