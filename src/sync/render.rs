//! Canonical text rendering of entities for embedding.
//!
//! Rendering must stay byte-stable: the diff keys on id only, so any change
//! to the output format leaves already-embedded vectors describing the old
//! text until those entities are re-embedded by hand.

use crate::dataset::{Attributes, Dataset, EntityKind, Entity};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Dataset-level fallbacks for missing values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderDefaults {
    mean_rating: BTreeMap<EntityKind, f64>,
}

impl RenderDefaults {
    /// Mean rating per kind over entities that have a finite rating.
    pub fn from_dataset(dataset: &Dataset) -> Self {
        let mut sums: BTreeMap<EntityKind, (f64, usize)> = BTreeMap::new();
        for entity in dataset.iter() {
            if let Some(rating) = entity.rating() {
                let entry = sums.entry(entity.kind()).or_insert((0.0, 0));
                entry.0 += rating;
                entry.1 += 1;
            }
        }

        let mean_rating = sums
            .into_iter()
            .map(|(kind, (sum, count))| (kind, sum / count as f64))
            .collect();
        Self { mean_rating }
    }

    pub fn mean_rating(&self, kind: EntityKind) -> f64 {
        self.mean_rating.get(&kind).copied().unwrap_or(0.0)
    }
}

/// Render an entity into the text that gets embedded.
pub fn render(entity: &Entity, defaults: &RenderDefaults) -> String {
    let rating = entity
        .rating()
        .unwrap_or_else(|| defaults.mean_rating(entity.kind()));
    let mut out = String::new();

    match &entity.attributes {
        Attributes::Hotel(hotel) => {
            line(&mut out, "Hotel", &hotel.name);
            line(&mut out, "City", &hotel.city);
            line(&mut out, "Address", &hotel.address);
            let _ = writeln!(out, "Rating: {rating:.1}");
            let _ = writeln!(out, "Price per night: {:.2}", number(hotel.price_per_night));
            let _ = writeln!(out, "Reviews: {}", hotel.review_count.unwrap_or(0));
            line(&mut out, "Amenities", &hotel.amenities.join(", "));
            line(&mut out, "Description", &hotel.description);
        }
        Attributes::Place(place) => {
            line(&mut out, "Place", &place.name);
            line(&mut out, "Category", &place.category);
            line(&mut out, "City", &place.city);
            line(&mut out, "Address", &place.address);
            let _ = writeln!(out, "Rating: {rating:.1}");
            line(
                &mut out,
                "Opening hours",
                place.opening_hours.as_deref().unwrap_or_default(),
            );
            let _ = writeln!(out, "Entry fee: {:.2}", number(place.entry_fee));
            line(&mut out, "Description", &place.description);
        }
        Attributes::Restaurant(restaurant) => {
            line(&mut out, "Restaurant", &restaurant.name);
            line(&mut out, "Cuisine", &restaurant.cuisine);
            line(&mut out, "City", &restaurant.city);
            line(&mut out, "Address", &restaurant.address);
            let _ = writeln!(out, "Rating: {rating:.1}");
            let _ = writeln!(out, "Price level: {:.1}", number(restaurant.price_level));
            let _ = writeln!(out, "Reviews: {}", restaurant.review_count.unwrap_or(0));
            line(&mut out, "Description", &restaurant.description);
        }
    }

    out.truncate(out.trim_end().len());
    out
}

fn line(out: &mut String, label: &str, value: &str) {
    let _ = writeln!(out, "{label}: {}", value.trim());
}

fn number(value: Option<f64>) -> f64 {
    value.filter(|value| value.is_finite()).unwrap_or(0.0)
}
