// Extension data models

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Column order shared by the CSV header and the relational table
pub const COLUMNS: [&str; 15] = [
    "publisherId",
    "publisherName",
    "publisherDisplayName",
    "extensionId",
    "extensionName",
    "extensionDisplayName",
    "lastUpdated",
    "publishedDate",
    "categories",
    "install",
    "averagerating",
    "ratingcount",
    "trendingdaily",
    "trendingmonthly",
    "downloadCount",
];

/// (publisherId, extensionId): identifies one extension in the sinks
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompositeKey {
    pub publisher_id: String,
    pub extension_id: String,
}

impl CompositeKey {
    pub fn new(publisher_id: impl Into<String>, extension_id: impl Into<String>) -> Self {
        Self {
            publisher_id: publisher_id.into(),
            extension_id: extension_id.into(),
        }
    }
}

impl std::fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.publisher_id, self.extension_id)
    }
}

/// One extension object exactly as the marketplace delivered it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawExtension(Value);

impl RawExtension {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Composite key, if both identifiers are present as strings
    pub fn composite_key(&self) -> Option<CompositeKey> {
        let publisher_id = self.0.get("publisher")?.get("publisherId")?.as_str()?;
        let extension_id = self.0.get("extensionId")?.as_str()?;
        Some(CompositeKey::new(publisher_id, extension_id))
    }

    /// Copy without the per-version payload, which dominates the object size
    pub fn without_versions(&self) -> Value {
        let mut value = self.0.clone();
        if let Some(object) = value.as_object_mut() {
            object.remove("versions");
        }
        value
    }
}

/// Normalized extension row
#[derive(Debug, Clone, PartialEq)]
pub struct ExtensionRecord {
    pub publisher_id: String,
    pub publisher_name: String,
    pub publisher_display_name: String,
    pub extension_id: String,
    pub extension_name: String,
    pub extension_display_name: String,
    pub last_updated: DateTime<Utc>,
    pub published_date: DateTime<Utc>,
    pub categories: Vec<String>,
    pub install: u64,
    pub average_rating: f64,
    pub rating_count: u64,
    pub trending_daily: f64,
    pub trending_monthly: f64,
    pub download_count: u64,
}

impl ExtensionRecord {
    pub fn key(&self) -> CompositeKey {
        CompositeKey::new(&self.publisher_id, &self.extension_id)
    }

    /// Row values in [`COLUMNS`] order, encoded as the CSV sink writes them
    pub fn to_row(&self) -> Result<[String; 15], serde_json::Error> {
        Ok([
            self.publisher_id.clone(),
            self.publisher_name.clone(),
            self.publisher_display_name.clone(),
            self.extension_id.clone(),
            self.extension_name.clone(),
            self.extension_display_name.clone(),
            format_timestamp(&self.last_updated),
            format_timestamp(&self.published_date),
            self.categories_json()?,
            self.install.to_string(),
            self.average_rating.to_string(),
            self.rating_count.to_string(),
            self.trending_daily.to_string(),
            self.trending_monthly.to_string(),
            self.download_count.to_string(),
        ])
    }

    pub fn categories_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.categories)
    }
}

/// Canonical timestamp text used in both sinks
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}


#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_composite_key_from_raw() {
        let raw = RawExtension::new(json!({
            "publisher": { "publisherId": "pub-1" },
            "extensionId": "ext-1"
        }));
        assert_eq!(raw.composite_key(), Some(CompositeKey::new("pub-1", "ext-1")));

        let missing = RawExtension::new(json!({ "publisher": { "publisherId": "pub-1" } }));
        assert_eq!(missing.composite_key(), None);
    }

    #[test]
    fn test_without_versions() {
        let raw = RawExtension::new(json!({
            "extensionId": "ext-1",
            "versions": [{ "version": "1.0.0" }]
        }));
        let stripped = raw.without_versions();
        assert!(stripped.get("versions").is_none());
        assert_eq!(stripped["extensionId"], "ext-1");
    }

    #[test]
    fn test_row_matches_column_order() {
        let record = fixtures::record("pub", "ext", 10);
        let row = record.to_row().unwrap();

        assert_eq!(row.len(), COLUMNS.len());
        assert_eq!(row[0], "pub");
        assert_eq!(row[3], "ext");
        assert_eq!(row[6], "2024-03-01T12:00:00Z");
        assert_eq!(row[8], r#"["Linters","Formatters"]"#);
        assert_eq!(row[9], "10");
        assert_eq!(row[14], "20");
    }
}
