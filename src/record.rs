use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Field map produced by an ingestion adapter, keyed by canonical field name.
pub type RawRecord = BTreeMap<String, String>;

pub const FIELD_NAME: &str = "Name";
pub const FIELD_ADDRESS: &str = "Address";
pub const FIELD_CITY: &str = "City";
pub const FIELD_CATEGORY: &str = "Category";
pub const FIELD_DESCRIPTION: &str = "Description";
pub const FIELD_LATITUDE: &str = "Latitude";
pub const FIELD_LONGITUDE: &str = "Longitude";
pub const FIELD_IMAGE_URL: &str = "ImageURL";
pub const FIELD_INSTAGRAM_URL: &str = "InstagramURL";
pub const FIELD_OPENING_HOURS: &str = "OpeningHours";
pub const FIELD_RESERVATION_LINK: &str = "ReservationLink";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    #[serde(rename = "Latitude")]
    pub latitude: f64,
    #[serde(rename = "Longitude")]
    pub longitude: f64,
}

impl Coordinates {
    /// Rejects non-finite, out-of-range and `(0, 0)`-style placeholder values.
    pub fn new(latitude: f64, longitude: f64) -> Option<Self> {
        let valid = latitude.is_finite()
            && longitude.is_finite()
            && (-90.0..=90.0).contains(&latitude)
            && (-180.0..=180.0).contains(&longitude)
            && latitude != 0.0
            && longitude != 0.0;
        valid.then_some(Self {
            latitude,
            longitude,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DayOfWeek {
    Sunday,
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
}

impl DayOfWeek {
    pub const ALL: [DayOfWeek; 7] = [
        DayOfWeek::Sunday,
        DayOfWeek::Monday,
        DayOfWeek::Tuesday,
        DayOfWeek::Wednesday,
        DayOfWeek::Thursday,
        DayOfWeek::Friday,
        DayOfWeek::Saturday,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DayOfWeek::Sunday => "Sunday",
            DayOfWeek::Monday => "Monday",
            DayOfWeek::Tuesday => "Tuesday",
            DayOfWeek::Wednesday => "Wednesday",
            DayOfWeek::Thursday => "Thursday",
            DayOfWeek::Friday => "Friday",
            DayOfWeek::Saturday => "Saturday",
        }
    }
}

impl fmt::Display for DayOfWeek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical venue entry. `name` is the merge key once normalized.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlaceRecord {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Address", skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(rename = "City", skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(rename = "Category", skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(rename = "Description", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub coordinates: Option<Coordinates>,
    #[serde(rename = "ImageURL", skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(rename = "InstagramURL", skip_serializing_if = "Option::is_none")]
    pub instagram_url: Option<String>,
    #[serde(rename = "OpeningHours", skip_serializing_if = "Option::is_none")]
    pub opening_hours: Option<String>,
    #[serde(rename = "ReservationLink", skip_serializing_if = "Option::is_none")]
    pub reservation_link: Option<String>,
    #[serde(flatten)]
    pub days: BTreeMap<DayOfWeek, bool>,
}

impl PlaceRecord {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Builds a record from canonical fields. Malformed optional values are
    /// treated as absent.
    pub fn from_fields(fields: &RawRecord) -> Self {
        let text = |key: &str| fields.get(key).and_then(|v| clean(v));
        let coordinates = match (
            text(FIELD_LATITUDE).and_then(|v| v.parse::<f64>().ok()),
            text(FIELD_LONGITUDE).and_then(|v| v.parse::<f64>().ok()),
        ) {
            (Some(lat), Some(lng)) => Coordinates::new(lat, lng),
            _ => None,
        };
        let days = DayOfWeek::ALL
            .iter()
            .filter_map(|day| {
                fields
                    .get(day.as_str())
                    .and_then(|v| parse_flag(v))
                    .map(|flag| (*day, flag))
            })
            .collect();

        Self {
            name: fields
                .get(FIELD_NAME)
                .map(|v| v.trim().to_string())
                .unwrap_or_default(),
            address: text(FIELD_ADDRESS),
            city: text(FIELD_CITY),
            category: text(FIELD_CATEGORY),
            description: text(FIELD_DESCRIPTION),
            coordinates,
            image_url: text(FIELD_IMAGE_URL),
            instagram_url: text(FIELD_INSTAGRAM_URL),
            opening_hours: text(FIELD_OPENING_HOURS),
            reservation_link: text(FIELD_RESERVATION_LINK),
            days,
        }
    }

    pub fn normalized_name(&self) -> String {
        normalize_name(&self.name)
    }

    pub fn has_coordinates(&self) -> bool {
        self.coordinates.is_some()
    }

    /// Copies every field `incoming` carries onto `self`, keeping the rest.
    pub fn merge_from(&mut self, incoming: PlaceRecord) {
        overwrite(&mut self.address, incoming.address);
        overwrite(&mut self.city, incoming.city);
        overwrite(&mut self.category, incoming.category);
        overwrite(&mut self.description, incoming.description);
        overwrite(&mut self.image_url, incoming.image_url);
        overwrite(&mut self.instagram_url, incoming.instagram_url);
        overwrite(&mut self.opening_hours, incoming.opening_hours);
        overwrite(&mut self.reservation_link, incoming.reservation_link);
        if incoming.coordinates.is_some() {
            self.coordinates = incoming.coordinates;
        }
        self.days.extend(incoming.days);
    }
}

pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

fn overwrite(target: &mut Option<String>, incoming: Option<String>) {
    if let Some(value) = incoming.and_then(|v| clean(&v)) {
        *target = Some(value);
    }
}

fn clean(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "yes" | "y" | "1" | "x" | "✓" | "v" => Some(true),
        "false" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}
