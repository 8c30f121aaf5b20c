//! Core domain model for judicial auction consolidation: raw per-source records,
//! the tracked-field schema, conflicts, and the consolidated record.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jac-core";

/// Source label recorded when a human types a value instead of picking a source.
pub const MANUAL_SOURCE: &str = "manual";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoercionError {
    #[error("unknown property type tag `{0}`")]
    UnknownPropertyType(String),
    #[error("field `{field}` expects a {expected} value, got `{found}`")]
    KindMismatch {
        field: TrackedField,
        expected: ValueKind,
        found: String,
    },
    #[error("unknown tracked field `{0}`")]
    UnknownField(String),
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    Apartment,
    House,
    Commercial,
    Land,
    Parking,
    #[default]
    Other,
}

impl PropertyType {
    pub fn tag(self) -> &'static str {
        match self {
            Self::Apartment => "apartment",
            Self::House => "house",
            Self::Commercial => "commercial",
            Self::Land => "land",
            Self::Parking => "parking",
            Self::Other => "other",
        }
    }

    /// Strict mapping of a scraped tag (canonical, French listing vocabulary,
    /// plural and variant spellings) onto the closed enumeration.
    pub fn from_tag(tag: &str) -> Result<Self, CoercionError> {
        let normalized = tag.trim().to_lowercase();
        let mapped = match normalized.as_str() {
            "apartment" | "appartement" | "appartements" => Self::Apartment,
            "house" | "maison" | "maisons" => Self::House,
            "commercial" | "local_commercial" | "local commercial" | "locaux-commerciaux"
            | "locaux commerciaux" | "immeuble" | "immeubles" => Self::Commercial,
            "land" | "terrain" | "terrains" => Self::Land,
            "parking" | "parkings" | "box" | "garage" => Self::Parking,
            "other" | "autre" | "autres" | "cave" => Self::Other,
            _ => return Err(CoercionError::UnknownPropertyType(tag.to_string())),
        };
        Ok(mapped)
    }

    /// Lossy mapping: unrecognized tags become [`PropertyType::Other`].
    pub fn coerce(tag: &str) -> Self {
        Self::from_tag(tag).unwrap_or_else(|err| {
            tracing::debug!(%err, "falling back to `other` property type");
            Self::Other
        })
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Document {
    pub url: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
}

/// A merged document tagged with the source it was first seen on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcedDocument {
    #[serde(flatten)]
    pub document: Document,
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// One listing as seen by one source. Produced by a scraper, never mutated.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawRecord {
    pub source: String,
    pub source_record_id: String,
    pub url: String,
    pub scraped_at: Option<DateTime<Utc>>,

    pub address: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    pub department: Option<String>,
    pub surface: Option<f64>,
    pub rooms: Option<i64>,
    pub bedrooms: Option<i64>,
    pub floor: Option<i64>,
    pub property_type: PropertyType,
    pub starting_price: Option<f64>,
    pub occupancy: Option<String>,
    pub land_registry: Option<String>,
    pub attorney_name: Option<String>,
    pub attorney_phone: Option<String>,
    pub attorney_email: Option<String>,

    pub description: Option<String>,
    pub detailed_description: Option<String>,
    pub photos: Vec<String>,
    pub documents: Vec<Document>,

    pub sale_date: Option<NaiveDate>,
    pub sale_time: Option<String>,
    pub court: Option<String>,
    pub location: Option<GeoPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackedField {
    Address,
    PostalCode,
    City,
    Surface,
    Rooms,
    Bedrooms,
    Floor,
    PropertyType,
    StartingPrice,
    Occupancy,
    LandRegistry,
    AttorneyName,
    AttorneyPhone,
    AttorneyEmail,
}

impl TrackedField {
    pub const ALL: [TrackedField; 14] = [
        Self::Address,
        Self::PostalCode,
        Self::City,
        Self::Surface,
        Self::Rooms,
        Self::Bedrooms,
        Self::Floor,
        Self::PropertyType,
        Self::StartingPrice,
        Self::Occupancy,
        Self::LandRegistry,
        Self::AttorneyName,
        Self::AttorneyPhone,
        Self::AttorneyEmail,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Address => "address",
            Self::PostalCode => "postal_code",
            Self::City => "city",
            Self::Surface => "surface",
            Self::Rooms => "rooms",
            Self::Bedrooms => "bedrooms",
            Self::Floor => "floor",
            Self::PropertyType => "property_type",
            Self::StartingPrice => "starting_price",
            Self::Occupancy => "occupancy",
            Self::LandRegistry => "land_registry",
            Self::AttorneyName => "attorney_name",
            Self::AttorneyPhone => "attorney_phone",
            Self::AttorneyEmail => "attorney_email",
        }
    }

    pub fn kind(self) -> ValueKind {
        match self {
            Self::Surface | Self::StartingPrice => ValueKind::Number,
            Self::Rooms | Self::Bedrooms | Self::Floor => ValueKind::Integer,
            Self::PropertyType => ValueKind::PropertyType,
            _ => ValueKind::Text,
        }
    }
}

impl fmt::Display for TrackedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TrackedField {
    type Err = CoercionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|field| field.name() == wanted)
            .ok_or_else(|| CoercionError::UnknownField(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Text,
    Integer,
    Number,
    PropertyType,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::PropertyType => "property type",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    /// Lower-cased and trimmed before comparison.
    CaseInsensitive,
    Exact,
}

/// A tracked field value, tagged so persisted conflicts round-trip losslessly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Number(f64),
    PropertyType(PropertyType),
}

impl FieldValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Text(_) => ValueKind::Text,
            Self::Integer(_) => ValueKind::Integer,
            Self::Number(_) => ValueKind::Number,
            Self::PropertyType(_) => ValueKind::PropertyType,
        }
    }

    /// Comparison key under the given normalization rule.
    pub fn normalized(&self, rule: Normalization) -> String {
        match (self, rule) {
            (Self::Text(text), Normalization::CaseInsensitive) => text.trim().to_lowercase(),
            (Self::Text(text), Normalization::Exact) => text.clone(),
            (Self::Integer(n), _) => n.to_string(),
            (Self::Number(n), _) => n.to_string(),
            (Self::PropertyType(p), _) => p.tag().to_string(),
        }
    }

    /// Converts the value to the kind `field` stores. Property types never fail.
    pub fn coerce_for(self, field: TrackedField) -> Result<FieldValue, CoercionError> {
        let expected = field.kind();
        let mismatch = |found: String| CoercionError::KindMismatch {
            field,
            expected,
            found,
        };
        match (expected, self) {
            (ValueKind::Text, Self::Text(s)) => Ok(Self::Text(s)),
            (ValueKind::Text, other) => Ok(Self::Text(other.to_string())),
            (ValueKind::Integer, Self::Integer(n)) => Ok(Self::Integer(n)),
            (ValueKind::Integer, Self::Number(n)) if n.fract() == 0.0 => {
                Ok(Self::Integer(n as i64))
            }
            (ValueKind::Integer, Self::Text(s)) => s
                .trim()
                .parse::<i64>()
                .map(Self::Integer)
                .map_err(|_| mismatch(s)),
            (ValueKind::Number, Self::Number(n)) => Ok(Self::Number(n)),
            (ValueKind::Number, Self::Integer(n)) => Ok(Self::Number(n as f64)),
            (ValueKind::Number, Self::Text(s)) => s
                .trim()
                .replace(',', ".")
                .parse::<f64>()
                .map(Self::Number)
                .map_err(|_| mismatch(s)),
            (ValueKind::PropertyType, Self::PropertyType(p)) => Ok(Self::PropertyType(p)),
            (ValueKind::PropertyType, Self::Text(s)) => {
                Ok(Self::PropertyType(PropertyType::coerce(&s)))
            }
            (_, other) => Err(mismatch(other.to_string())),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Integer(n) => write!(f, "{n}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::PropertyType(p) => f.write_str(p.tag()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub field: TrackedField,
    pub normalization: Normalization,
}

/// Versioned list of the fields the reconciler arbitrates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub version: u32,
    pub fields: Vec<FieldSpec>,
}

impl FieldSchema {
    pub fn v1() -> Self {
        let fields = TrackedField::ALL
            .into_iter()
            .map(|field| FieldSpec {
                field,
                normalization: match field.kind() {
                    ValueKind::Text => Normalization::CaseInsensitive,
                    _ => Normalization::Exact,
                },
            })
            .collect();
        Self { version: 1, fields }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn contains(&self, field: TrackedField) -> bool {
        self.fields.iter().any(|spec| spec.field == field)
    }
}

impl Default for FieldSchema {
    fn default() -> Self {
        Self::v1()
    }
}

fn text_value(value: &Option<String>) -> Option<FieldValue> {
    value
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(|s| FieldValue::Text(s.to_string()))
}

impl RawRecord {
    /// Reported value for `field`; empty strings and the `other` property type
    /// count as no data.
    pub fn tracked_value(&self, field: TrackedField) -> Option<FieldValue> {
        match field {
            TrackedField::Address => text_value(&self.address),
            TrackedField::PostalCode => text_value(&self.postal_code),
            TrackedField::City => text_value(&self.city),
            TrackedField::Surface => self.surface.map(FieldValue::Number),
            TrackedField::Rooms => self.rooms.map(FieldValue::Integer),
            TrackedField::Bedrooms => self.bedrooms.map(FieldValue::Integer),
            TrackedField::Floor => self.floor.map(FieldValue::Integer),
            TrackedField::PropertyType => match self.property_type {
                PropertyType::Other => None,
                other => Some(FieldValue::PropertyType(other)),
            },
            TrackedField::StartingPrice => self.starting_price.map(FieldValue::Number),
            TrackedField::Occupancy => text_value(&self.occupancy),
            TrackedField::LandRegistry => text_value(&self.land_registry),
            TrackedField::AttorneyName => text_value(&self.attorney_name),
            TrackedField::AttorneyPhone => text_value(&self.attorney_phone),
            TrackedField::AttorneyEmail => text_value(&self.attorney_email),
        }
    }
}

/// Detected disagreement on one field across sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConflict {
    pub field: TrackedField,
    pub values_by_source: BTreeMap<String, FieldValue>,
    pub detected_at: DateTime<Utc>,
    pub resolved: bool,
    pub chosen_value: Option<FieldValue>,
    pub chosen_source: Option<String>,
}

impl FieldConflict {
    pub fn open(
        field: TrackedField,
        values_by_source: BTreeMap<String, FieldValue>,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            field,
            values_by_source,
            detected_at,
            resolved: false,
            chosen_value: None,
            chosen_source: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserChoice {
    pub field: TrackedField,
    pub chosen_value: FieldValue,
    pub chosen_source: String,
    pub chosen_at: DateTime<Utc>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSnapshot {
    pub source: String,
    pub url: String,
    pub scraped_at: Option<DateTime<Utc>>,
    pub record: RawRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldConfidence {
    /// At least two sources agree.
    High,
    /// Exactly one source reports the field.
    Medium,
    Conflict,
    None,
}

/// Fixed-width grouping fingerprint shared by records describing one sale.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchingKey(String);

impl MatchingKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stable record id derived from the key, so re-runs upsert the same row.
    pub fn record_id(&self) -> Uuid {
        Uuid::new_v5(
            &Uuid::NAMESPACE_URL,
            format!("jac:consolidated:{}", self.0).as_bytes(),
        )
    }
}

impl fmt::Display for MatchingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical merged entity for one matching key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedRecord {
    pub id: Uuid,
    pub matching_key: MatchingKey,
    pub schema_version: u32,

    pub sources: Vec<String>,
    pub source_urls: BTreeMap<String, String>,
    pub source_record_ids: BTreeMap<String, String>,
    pub snapshots: Vec<SourceSnapshot>,

    pub conflicts: BTreeMap<TrackedField, FieldConflict>,
    pub user_choices: BTreeMap<TrackedField, Vec<UserChoice>>,
    pub pending_validation: Vec<TrackedField>,

    pub address: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    pub surface: Option<f64>,
    pub rooms: Option<i64>,
    pub bedrooms: Option<i64>,
    pub floor: Option<i64>,
    pub property_type: PropertyType,
    pub starting_price: Option<f64>,
    pub occupancy: Option<String>,
    pub land_registry: Option<String>,
    pub attorney_name: Option<String>,
    pub attorney_phone: Option<String>,
    pub attorney_email: Option<String>,

    pub department: Option<String>,
    pub sale_date: Option<NaiveDate>,
    pub sale_time: Option<String>,
    pub court: Option<String>,
    pub description: Option<String>,
    pub detailed_description: Option<String>,
    pub location: Option<GeoPoint>,

    pub photos: Vec<String>,
    pub documents: Vec<SourcedDocument>,

    pub confidence_score: f64,
    pub last_consolidated: DateTime<Utc>,
    /// Bumped by the store on every write; conditional writes compare against it.
    #[serde(default)]
    pub revision: u64,
}

impl ConsolidatedRecord {
    pub fn new(matching_key: MatchingKey, schema_version: u32, at: DateTime<Utc>) -> Self {
        Self {
            id: matching_key.record_id(),
            matching_key,
            schema_version,
            sources: Vec::new(),
            source_urls: BTreeMap::new(),
            source_record_ids: BTreeMap::new(),
            snapshots: Vec::new(),
            conflicts: BTreeMap::new(),
            user_choices: BTreeMap::new(),
            pending_validation: Vec::new(),
            address: None,
            postal_code: None,
            city: None,
            surface: None,
            rooms: None,
            bedrooms: None,
            floor: None,
            property_type: PropertyType::Other,
            starting_price: None,
            occupancy: None,
            land_registry: None,
            attorney_name: None,
            attorney_phone: None,
            attorney_email: None,
            department: None,
            sale_date: None,
            sale_time: None,
            court: None,
            description: None,
            detailed_description: None,
            location: None,
            photos: Vec::new(),
            documents: Vec::new(),
            confidence_score: 0.0,
            last_consolidated: at,
            revision: 0,
        }
    }

    pub fn tracked_value(&self, field: TrackedField) -> Option<FieldValue> {
        match field {
            TrackedField::Address => self.address.clone().map(FieldValue::Text),
            TrackedField::PostalCode => self.postal_code.clone().map(FieldValue::Text),
            TrackedField::City => self.city.clone().map(FieldValue::Text),
            TrackedField::Surface => self.surface.map(FieldValue::Number),
            TrackedField::Rooms => self.rooms.map(FieldValue::Integer),
            TrackedField::Bedrooms => self.bedrooms.map(FieldValue::Integer),
            TrackedField::Floor => self.floor.map(FieldValue::Integer),
            TrackedField::PropertyType => match self.property_type {
                PropertyType::Other => None,
                known => Some(FieldValue::PropertyType(known)),
            },
            TrackedField::StartingPrice => self.starting_price.map(FieldValue::Number),
            TrackedField::Occupancy => self.occupancy.clone().map(FieldValue::Text),
            TrackedField::LandRegistry => self.land_registry.clone().map(FieldValue::Text),
            TrackedField::AttorneyName => self.attorney_name.clone().map(FieldValue::Text),
            TrackedField::AttorneyPhone => self.attorney_phone.clone().map(FieldValue::Text),
            TrackedField::AttorneyEmail => self.attorney_email.clone().map(FieldValue::Text),
        }
    }

    /// Setter dispatch for tracked fields. The value is coerced to the field's kind first.
    pub fn set_tracked_value(
        &mut self,
        field: TrackedField,
        value: FieldValue,
    ) -> Result<(), CoercionError> {
        match (field, value.coerce_for(field)?) {
            (TrackedField::Address, FieldValue::Text(v)) => self.address = Some(v),
            (TrackedField::PostalCode, FieldValue::Text(v)) => self.postal_code = Some(v),
            (TrackedField::City, FieldValue::Text(v)) => self.city = Some(v),
            (TrackedField::Surface, FieldValue::Number(v)) => self.surface = Some(v),
            (TrackedField::Rooms, FieldValue::Integer(v)) => self.rooms = Some(v),
            (TrackedField::Bedrooms, FieldValue::Integer(v)) => self.bedrooms = Some(v),
            (TrackedField::Floor, FieldValue::Integer(v)) => self.floor = Some(v),
            (TrackedField::PropertyType, FieldValue::PropertyType(v)) => self.property_type = v,
            (TrackedField::StartingPrice, FieldValue::Number(v)) => self.starting_price = Some(v),
            (TrackedField::Occupancy, FieldValue::Text(v)) => self.occupancy = Some(v),
            (TrackedField::LandRegistry, FieldValue::Text(v)) => self.land_registry = Some(v),
            (TrackedField::AttorneyName, FieldValue::Text(v)) => self.attorney_name = Some(v),
            (TrackedField::AttorneyPhone, FieldValue::Text(v)) => self.attorney_phone = Some(v),
            (TrackedField::AttorneyEmail, FieldValue::Text(v)) => self.attorney_email = Some(v),
            (field, other) => {
                return Err(CoercionError::KindMismatch {
                    field,
                    expected: field.kind(),
                    found: other.to_string(),
                })
            }
        }
        Ok(())
    }

    pub fn has_unresolved_conflicts(&self) -> bool {
        self.conflicts.values().any(|c| !c.resolved)
    }

    pub fn unresolved_conflicts(&self) -> Vec<&FieldConflict> {
        self.conflicts.values().filter(|c| !c.resolved).collect()
    }

    /// Raw value each contributing source reported for `field`, taken from the
    /// first snapshot of that source.
    pub fn field_comparison(&self, field: TrackedField) -> BTreeMap<String, Option<FieldValue>> {
        let mut out = BTreeMap::new();
        for snapshot in &self.snapshots {
            out.entry(snapshot.source.clone())
                .or_insert_with(|| snapshot.record.tracked_value(field));
        }
        out
    }

    pub fn field_confidence(&self, field: TrackedField) -> FieldConfidence {
        if self.conflicts.get(&field).is_some_and(|c| !c.resolved) {
            return FieldConfidence::Conflict;
        }
        let reporting = self
            .field_comparison(field)
            .values()
            .filter(|value| value.is_some())
            .count();
        match reporting {
            0 => FieldConfidence::None,
            1 => FieldConfidence::Medium,
            _ => FieldConfidence::High,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).single().unwrap()
    }

    #[test]
    fn property_type_variants_collapse_onto_closed_enum() {
        assert_eq!(PropertyType::from_tag("Appartements").unwrap(), PropertyType::Apartment);
        assert_eq!(
            PropertyType::from_tag(" locaux-commerciaux ").unwrap(),
            PropertyType::Commercial
        );
        assert_eq!(PropertyType::from_tag("box").unwrap(), PropertyType::Parking);
        assert!(PropertyType::from_tag("chateau").is_err());
        assert_eq!(PropertyType::coerce("chateau"), PropertyType::Other);
    }

    #[test]
    fn raw_record_treats_blank_and_other_as_missing() {
        let raw = RawRecord {
            city: Some("   ".into()),
            address: Some("12 rue Paradis".into()),
            ..Default::default()
        };
        assert_eq!(raw.tracked_value(TrackedField::City), None);
        assert_eq!(raw.tracked_value(TrackedField::PropertyType), None);
        assert_eq!(
            raw.tracked_value(TrackedField::Address),
            Some(FieldValue::Text("12 rue Paradis".into()))
        );
    }

    #[test]
    fn unknown_property_type_reads_as_missing() {
        let mut record = ConsolidatedRecord::new(MatchingKey::new("abcd"), 1, at());
        assert_eq!(record.tracked_value(TrackedField::PropertyType), None);
        record.property_type = PropertyType::House;
        assert_eq!(
            record.tracked_value(TrackedField::PropertyType),
            Some(FieldValue::PropertyType(PropertyType::House))
        );
    }

    #[test]
    fn setter_coerces_text_into_typed_fields() {
        let mut record = ConsolidatedRecord::new(MatchingKey::new("abcd"), 1, at());
        record
            .set_tracked_value(TrackedField::Surface, FieldValue::Text("47,5".into()))
            .unwrap();
        record
            .set_tracked_value(TrackedField::PropertyType, FieldValue::Text("maison".into()))
            .unwrap();
        record
            .set_tracked_value(TrackedField::Rooms, FieldValue::Number(3.0))
            .unwrap();
        assert_eq!(record.surface, Some(47.5));
        assert_eq!(record.property_type, PropertyType::House);
        assert_eq!(record.rooms, Some(3));

        let err = record
            .set_tracked_value(TrackedField::Floor, FieldValue::Text("rdc".into()))
            .unwrap_err();
        assert!(matches!(err, CoercionError::KindMismatch { field: TrackedField::Floor, .. }));
    }

    #[test]
    fn record_id_is_stable_per_key() {
        let a = MatchingKey::new("0123456789abcdef");
        let b = MatchingKey::new("0123456789abcdef");
        assert_eq!(a.record_id(), b.record_id());
        assert_ne!(a.record_id(), MatchingKey::new("fedcba9876543210").record_id());
    }

    #[test]
    fn tracked_field_names_parse_back() {
        for field in TrackedField::ALL {
            assert_eq!(field.name().parse::<TrackedField>().unwrap(), field);
        }
        assert!("ville".parse::<TrackedField>().is_err());
    }

    #[test]
    fn consolidated_record_json_round_trips() {
        let mut record = ConsolidatedRecord::new(MatchingKey::new("abcd"), 1, at());
        let mut values = BTreeMap::new();
        values.insert("licitor".to_string(), FieldValue::Number(45.0));
        values.insert("vench".to_string(), FieldValue::Number(50.0));
        record.conflicts.insert(
            TrackedField::Surface,
            FieldConflict::open(TrackedField::Surface, values, at()),
        );
        record.pending_validation.push(TrackedField::Surface);
        record.property_type = PropertyType::Land;

        let json = serde_json::to_string(&record).unwrap();
        let back: ConsolidatedRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
