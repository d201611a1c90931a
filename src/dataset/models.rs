//! Travel entity types produced by the upstream crawlers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Classification of travel entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Hotel,
    Place,
    Restaurant,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Hotel, EntityKind::Place, EntityKind::Restaurant];

    /// String representation used in index metadata and the snapshot table.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Hotel => "hotel",
            EntityKind::Place => "place",
            EntityKind::Restaurant => "restaurant",
        }
    }
}

impl std::str::FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hotel" | "hotels" => Ok(EntityKind::Hotel),
            "place" | "places" => Ok(EntityKind::Place),
            "restaurant" | "restaurants" => Ok(EntityKind::Restaurant),
            other => Err(format!("unknown entity kind `{other}`")),
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A hotel listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hotel {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub price_per_night: Option<f64>,
    #[serde(default)]
    pub review_count: Option<u64>,
    #[serde(default)]
    pub amenities: Vec<String>,
}

/// A sight, landmark or activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Place {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub opening_hours: Option<String>,
    #[serde(default)]
    pub entry_fee: Option<f64>,
}

/// A restaurant listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Restaurant {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub cuisine: String,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub price_level: Option<f64>,
    #[serde(default)]
    pub review_count: Option<u64>,
}

/// Kind-specific attributes with a fixed schema per kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Attributes {
    Hotel(Hotel),
    Place(Place),
    Restaurant(Restaurant),
}

/// A travel entity keyed by a stable id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Stable identifier, unique across the dataset and across runs.
    pub id: String,
    #[serde(flatten)]
    pub attributes: Attributes,
}

/// Untyped metadata value, produced only at the index write boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    Number(Option<f64>),
    Text(Option<String>),
    List(Vec<String>),
}

impl Entity {
    pub fn new(id: impl Into<String>, attributes: Attributes) -> Self {
        Self {
            id: id.into(),
            attributes,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match &self.attributes {
            Attributes::Hotel(_) => EntityKind::Hotel,
            Attributes::Place(_) => EntityKind::Place,
            Attributes::Restaurant(_) => EntityKind::Restaurant,
        }
    }

    pub fn name(&self) -> &str {
        match &self.attributes {
            Attributes::Hotel(h) => &h.name,
            Attributes::Place(p) => &p.name,
            Attributes::Restaurant(r) => &r.name,
        }
    }

    /// Rating if present and finite.
    pub fn rating(&self) -> Option<f64> {
        let rating = match &self.attributes {
            Attributes::Hotel(h) => h.rating,
            Attributes::Place(p) => p.rating,
            Attributes::Restaurant(r) => r.rating,
        };
        rating.filter(|value| value.is_finite())
    }

    /// Flatten the typed attributes into a key/value map for the remote index.
    ///
    /// Missing values are kept as `None` here; the upsert pipeline decides
    /// how to default them.
    pub fn metadata(&self) -> BTreeMap<String, MetadataValue> {
        let mut map = BTreeMap::new();

        match &self.attributes {
            Attributes::Hotel(h) => {
                map.insert("name".into(), text(&h.name));
                map.insert("city".into(), text(&h.city));
                map.insert("address".into(), text(&h.address));
                map.insert("description".into(), text(&h.description));
                map.insert("rating".into(), MetadataValue::Number(h.rating));
                map.insert(
                    "price_per_night".into(),
                    MetadataValue::Number(h.price_per_night),
                );
                map.insert(
                    "review_count".into(),
                    MetadataValue::Number(h.review_count.map(|count| count as f64)),
                );
                map.insert("amenities".into(), MetadataValue::List(h.amenities.clone()));
            }
            Attributes::Place(p) => {
                map.insert("name".into(), text(&p.name));
                map.insert("city".into(), text(&p.city));
                map.insert("address".into(), text(&p.address));
                map.insert("description".into(), text(&p.description));
                map.insert("category".into(), text(&p.category));
                map.insert("rating".into(), MetadataValue::Number(p.rating));
                map.insert(
                    "opening_hours".into(),
                    MetadataValue::Text(p.opening_hours.clone()),
                );
                map.insert("entry_fee".into(), MetadataValue::Number(p.entry_fee));
            }
            Attributes::Restaurant(r) => {
                map.insert("name".into(), text(&r.name));
                map.insert("city".into(), text(&r.city));
                map.insert("address".into(), text(&r.address));
                map.insert("description".into(), text(&r.description));
                map.insert("cuisine".into(), text(&r.cuisine));
                map.insert("rating".into(), MetadataValue::Number(r.rating));
                map.insert("price_level".into(), MetadataValue::Number(r.price_level));
                map.insert(
                    "review_count".into(),
                    MetadataValue::Number(r.review_count.map(|count| count as f64)),
                );
            }
        }

        map.insert(
            "kind".into(),
            MetadataValue::Text(Some(self.kind().as_str().to_string())),
        );
        map
    }
}

fn text(value: &str) -> MetadataValue {
    MetadataValue::Text(Some(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tagged_entity() {
        let line = r#"{"id":"h-1","kind":"hotel","name":"Harbor Inn","city":"Lisbon","rating":4.5,"amenities":["wifi","pool"]}"#;
        let entity: Entity = serde_json::from_str(line).unwrap();
        assert_eq!(entity.id, "h-1");
        assert_eq!(entity.kind(), EntityKind::Hotel);
        assert_eq!(entity.name(), "Harbor Inn");
        assert_eq!(entity.rating(), Some(4.5));

        let Attributes::Hotel(hotel) = &entity.attributes else {
            panic!("expected hotel");
        };
        assert_eq!(hotel.amenities, vec!["wifi", "pool"]);
        assert_eq!(hotel.price_per_night, None);
        assert_eq!(hotel.address, "");
    }

    #[test]
    fn test_nan_rating_is_treated_as_missing() {
        let entity = Entity::new(
            "r-1",
            Attributes::Restaurant(Restaurant {
                rating: Some(f64::NAN),
                ..Default::default()
            }),
        );
        assert_eq!(entity.rating(), None);
    }

    #[test]
    fn test_metadata_keeps_missing_values_unresolved() {
        let entity = Entity::new(
            "p-1",
            Attributes::Place(Place {
                name: "Old Town".into(),
                ..Default::default()
            }),
        );
        let metadata = entity.metadata();
        assert_eq!(metadata["rating"], MetadataValue::Number(None));
        assert_eq!(metadata["opening_hours"], MetadataValue::Text(None));
        assert_eq!(
            metadata["kind"],
            MetadataValue::Text(Some("place".to_string()))
        );
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("Hotels".parse::<EntityKind>().unwrap(), EntityKind::Hotel);
        assert_eq!(
            "restaurant".parse::<EntityKind>().unwrap(),
            EntityKind::Restaurant
        );
        assert!("museum".parse::<EntityKind>().is_err());
    }
}
