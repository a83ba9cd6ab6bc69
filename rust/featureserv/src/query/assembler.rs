use crate::error::Result;
use crate::geometry::wkt_to_esri;
use crate::models::{Attributes, Feature, Layer, GEOMETRY_OUTPUT_COLUMN};
use serde_json::Value;
use std::collections::HashMap;

/// Builds one feature per distinct object id, in first-seen order.
pub fn assemble(rows: Vec<Attributes>, layer: &Layer) -> Result<Vec<Feature>> {
    let mut features: Vec<Feature> = Vec::with_capacity(rows.len());
    let mut by_id: HashMap<String, usize> = HashMap::with_capacity(rows.len());

    for mut row in rows {
        let geometry = match row.remove(GEOMETRY_OUTPUT_COLUMN) {
            Some(Value::String(text)) => Some(wkt_to_esri(&text)?),
            _ => None,
        };
        let buckets = split_related(&mut row, layer);

        let identity = match row.get(&layer.object_id_field) {
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
            None => features.len().to_string(),
        };

        let position = match by_id.get(&identity) {
            Some(position) => *position,
            None => {
                features.push(Feature {
                    attributes: row,
                    geometry,
                    related: Default::default(),
                });
                by_id.insert(identity, features.len() - 1);
                features.len() - 1
            }
        };

        let feature = &mut features[position];
        for (title, bucket) in buckets {
            let entries = feature.related.entry(title).or_default();
            if let Some(bucket) = bucket {
                entries.push(bucket);
            }
        }
    }

    Ok(features)
}

fn split_related(row: &mut Attributes, layer: &Layer) -> Vec<(String, Option<Attributes>)> {
    let mut buckets = Vec::new();
    for relation in &layer.relations {
        let prefix = format!("{}.", relation.related_title);
        let keys: Vec<String> = row
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .cloned()
            .collect();
        if keys.is_empty() {
            continue;
        }

        let mut bucket = Attributes::new();
        for key in keys {
            if let Some(value) = row.remove(&key) {
                bucket.insert(key[prefix.len()..].to_string(), value);
            }
        }

        if bucket.values().all(Value::is_null) {
            buckets.push((relation.related_title.clone(), None));
            continue;
        }
        let parent_key = row
            .get(&relation.source_column)
            .cloned()
            .unwrap_or(Value::Null);
        bucket.insert(relation.target_column.clone(), parent_key);
        buckets.push((relation.related_title.clone(), Some(bucket)));
    }
    buckets
}
