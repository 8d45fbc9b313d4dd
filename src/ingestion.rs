use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info};

use crate::errors::{AppError, AppResult};
use crate::record::{
    DayOfWeek, RawRecord, FIELD_ADDRESS, FIELD_CATEGORY, FIELD_CITY, FIELD_DESCRIPTION,
    FIELD_IMAGE_URL, FIELD_INSTAGRAM_URL, FIELD_LATITUDE, FIELD_LONGITUDE, FIELD_NAME,
    FIELD_OPENING_HOURS, FIELD_RESERVATION_LINK,
};

const DEFAULT_ALIASES: &[(&str, &[&str])] = &[
    (FIELD_NAME, &["name", "place", "place name", "venue", "title", "שם", "שם המקום"]),
    (FIELD_ADDRESS, &["address", "location", "street", "כתובת"]),
    (FIELD_CITY, &["city", "town", "עיר"]),
    (FIELD_CATEGORY, &["category", "categories", "type", "tag", "קטגוריה"]),
    (
        FIELD_DESCRIPTION,
        &["description", "deal", "deals", "happy hour", "details", "תיאור"],
    ),
    (FIELD_LATITUDE, &["latitude", "lat"]),
    (FIELD_LONGITUDE, &["longitude", "lng", "lon", "long"]),
    (FIELD_IMAGE_URL, &["image url", "image", "photo", "picture"]),
    (FIELD_INSTAGRAM_URL, &["instagram url", "instagram", "insta"]),
    (FIELD_OPENING_HOURS, &["opening hours", "hours", "open hours"]),
    (
        FIELD_RESERVATION_LINK,
        &["reservation link", "reservation", "reservations", "booking"],
    ),
];

/// Maps the column labels a source happens to use onto canonical field
/// names. Matching ignores case, whitespace, `_` and `-`.
#[derive(Debug, Clone)]
pub struct FieldAliases {
    lookup: HashMap<String, String>,
}

impl Default for FieldAliases {
    fn default() -> Self {
        let mut aliases = Self {
            lookup: HashMap::new(),
        };
        for (canonical, labels) in DEFAULT_ALIASES {
            aliases.insert(canonical, canonical);
            for label in labels.iter() {
                aliases.insert(label, canonical);
            }
        }
        for day in DayOfWeek::ALL {
            aliases.insert(day.as_str(), day.as_str());
            aliases.insert(&day.as_str()[..3], day.as_str());
        }
        aliases
    }
}

impl FieldAliases {
    pub fn with_alias(mut self, label: &str, canonical: &str) -> Self {
        self.insert(label, canonical);
        self
    }

    pub fn canonical(&self, label: &str) -> Option<&str> {
        self.lookup.get(&fold_label(label)).map(String::as_str)
    }

    /// Re-keys `(label, value)` pairs by canonical names. Unknown labels are
    /// dropped and, when two labels map to the same field, the first
    /// non-empty value in iteration order wins. For a CSV row that is column
    /// order; for a [`RawRecord`] it is label order.
    pub fn canonicalize<I, L, V>(&self, fields: I) -> RawRecord
    where
        I: IntoIterator<Item = (L, V)>,
        L: AsRef<str>,
        V: AsRef<str>,
    {
        let mut record = RawRecord::new();
        for (label, value) in fields {
            let label = label.as_ref();
            let Some(canonical) = self.canonical(label) else {
                debug!(target: "ingestion", label = %label, "ignoring unknown column");
                continue;
            };
            let slot = record.entry(canonical.to_string()).or_default();
            if slot.trim().is_empty() {
                *slot = value.as_ref().to_string();
            }
        }
        record
    }

    fn insert(&mut self, label: &str, canonical: &str) {
        self.lookup.insert(fold_label(label), canonical.to_string());
    }
}

fn fold_label(label: &str) -> String {
    label
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Parses a CSV export (header row first) into canonical raw records.
pub fn parse_csv(bytes: &[u8], aliases: &FieldAliases) -> AppResult<Vec<RawRecord>> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);
    let headers = reader.headers()?.clone();

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result?;
        rows.push(aliases.canonicalize(headers.iter().zip(record.iter())));
    }
    Ok(rows)
}

/// Anything that can hand the reconciler a batch of candidate records.
#[async_trait]
pub trait RecordSource: Send + Sync {
    fn label(&self) -> &str;

    async fn fetch(&self) -> AppResult<Vec<RawRecord>>;
}

pub struct CsvFileSource {
    label: String,
    path: PathBuf,
    aliases: FieldAliases,
}

impl CsvFileSource {
    pub fn new(path: impl AsRef<Path>, aliases: FieldAliases) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            label: format!("csv:{}", path.display()),
            path,
            aliases,
        }
    }
}

#[async_trait]
impl RecordSource for CsvFileSource {
    fn label(&self) -> &str {
        &self.label
    }

    async fn fetch(&self) -> AppResult<Vec<RawRecord>> {
        let bytes = tokio::fs::read(&self.path).await?;
        let rows = parse_csv(&bytes, &self.aliases)?;
        info!(target: "ingestion", source = %self.label, rows = rows.len(), "loaded csv export");
        Ok(rows)
    }
}

/// A spreadsheet published as CSV, e.g. a sheet's "export as CSV" link.
pub struct RemoteCsvSource {
    label: String,
    http: Client,
    url: String,
    aliases: FieldAliases,
}

impl RemoteCsvSource {
    pub fn new(url: impl Into<String>, timeout: Duration, aliases: FieldAliases) -> AppResult<Self> {
        let url = url.into();
        let http = Client::builder()
            .user_agent(concat!("happyhour-places/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            label: format!("remote:{url}"),
            http,
            url,
            aliases,
        })
    }
}

#[async_trait]
impl RecordSource for RemoteCsvSource {
    fn label(&self) -> &str {
        &self.label
    }

    async fn fetch(&self) -> AppResult<Vec<RawRecord>> {
        let response = self.http.get(&self.url).send().await?.error_for_status()?;
        let bytes = response.bytes().await?;
        if bytes.trim_ascii_start().starts_with(b"<") {
            return Err(AppError::Config(format!(
                "{} returned HTML instead of CSV; is the sheet published?",
                self.url
            )));
        }
        let rows = parse_csv(&bytes, &self.aliases)?;
        info!(target: "ingestion", source = %self.label, rows = rows.len(), "fetched remote csv");
        Ok(rows)
    }
}

/// Records already split out of a hand-authored block of text.
pub struct StaticSource {
    label: String,
    records: Vec<RawRecord>,
}

impl StaticSource {
    pub fn new(label: impl Into<String>, records: Vec<RawRecord>, aliases: &FieldAliases) -> Self {
        Self {
            label: label.into(),
            records: records.iter().map(|r| aliases.canonicalize(r)).collect(),
        }
    }
}

#[async_trait]
impl RecordSource for StaticSource {
    fn label(&self) -> &str {
        &self.label
    }

    async fn fetch(&self) -> AppResult<Vec<RawRecord>> {
        Ok(self.records.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_CSV: &str = "\u{feff}Place Name,category,Lat,LNG,Image_URL,Fri,Notes\n\
        Romano,Bar,32.0618,34.7712,https://img/romano.jpg,yes,ignored\n\
        Bellboy,,,,,,\n";

    #[test]
    fn maps_alternate_labels() {
        let aliases = FieldAliases::default();
        assert_eq!(aliases.canonical("Place Name"), Some(FIELD_NAME));
        assert_eq!(aliases.canonical("instagram_url"), Some(FIELD_INSTAGRAM_URL));
        assert_eq!(aliases.canonical("  LONG "), Some(FIELD_LONGITUDE));
        assert_eq!(aliases.canonical("saturday"), Some("Saturday"));
        assert_eq!(aliases.canonical("קטגוריה"), Some(FIELD_CATEGORY));
        assert_eq!(aliases.canonical("Notes"), None);

        let custom = aliases.with_alias("Happy Hour Deal", FIELD_DESCRIPTION);
        assert_eq!(custom.canonical("happy-hour-deal"), Some(FIELD_DESCRIPTION));
    }

    #[test]
    fn parses_csv_rows_into_canonical_records() {
        let rows = parse_csv(SAMPLE_CSV.as_bytes(), &FieldAliases::default()).unwrap();
        assert_eq!(rows.len(), 2);

        let first = &rows[0];
        assert_eq!(first.get(FIELD_NAME).unwrap(), "Romano");
        assert_eq!(first.get(FIELD_CATEGORY).unwrap(), "Bar");
        assert_eq!(first.get(FIELD_LATITUDE).unwrap(), "32.0618");
        assert_eq!(first.get(FIELD_IMAGE_URL).unwrap(), "https://img/romano.jpg");
        assert_eq!(first.get("Friday").unwrap(), "yes");
        assert!(!first.contains_key("Notes"));

        assert_eq!(rows[1].get(FIELD_NAME).unwrap(), "Bellboy");
        assert_eq!(rows[1].get(FIELD_LATITUDE).unwrap(), "");
    }

    #[test]
    fn first_non_empty_alias_wins() {
        let raw: RawRecord = [("lat", ""), ("Latitude", "32.1"), ("Name", "X")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let record = FieldAliases::default().canonicalize(&raw);
        assert_eq!(record.get(FIELD_LATITUDE).unwrap(), "32.1");
    }

    #[test]
    fn duplicate_aliases_resolve_in_column_order() {
        // "Lat" sorts before "Latitude", but the Latitude column comes first
        let csv = "Name,Latitude,Lat,Lng\nRomano,32.0618,31.5,34.7712\n";
        let rows = parse_csv(csv.as_bytes(), &FieldAliases::default()).unwrap();
        assert_eq!(rows[0].get(FIELD_LATITUDE).unwrap(), "32.0618");

        let blank_first = "Name,Latitude,Lat,Lng\nRomano,,31.5,34.7712\n";
        let rows = parse_csv(blank_first.as_bytes(), &FieldAliases::default()).unwrap();
        assert_eq!(rows[0].get(FIELD_LATITUDE).unwrap(), "31.5");
    }

    #[tokio::test]
    async fn reads_csv_file_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("places.csv");
        std::fs::write(&path, SAMPLE_CSV).unwrap();

        let source = CsvFileSource::new(&path, FieldAliases::default());
        assert!(source.label().starts_with("csv:"));
        let rows = source.fetch().await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn fetches_published_sheet_and_rejects_html() {
        use httptest::matchers::request;
        use httptest::responders::status_code;
        use httptest::{Expectation, Server};

        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/sheet.csv"))
                .respond_with(status_code(200).body(SAMPLE_CSV)),
        );
        server.expect(
            Expectation::matching(request::method_path("GET", "/private"))
                .respond_with(status_code(200).body("<!DOCTYPE html><html>sign in</html>")),
        );

        let timeout = Duration::from_secs(2);
        let sheet =
            RemoteCsvSource::new(server.url_str("/sheet.csv"), timeout, FieldAliases::default())
                .unwrap();
        assert_eq!(sheet.fetch().await.unwrap().len(), 2);

        let private =
            RemoteCsvSource::new(server.url_str("/private"), timeout, FieldAliases::default())
                .unwrap();
        assert!(matches!(private.fetch().await, Err(AppError::Config(_))));
    }

    #[tokio::test]
    async fn missing_csv_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = CsvFileSource::new(dir.path().join("absent.csv"), FieldAliases::default());
        assert!(matches!(source.fetch().await, Err(AppError::Io(_))));
    }
}
