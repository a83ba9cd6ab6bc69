use crate::error::{Result as ServiceResult, ServiceError};
use crate::models::{Layer, Service};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Registry {
    #[serde(default)]
    services: Vec<Service>,
}

impl Registry {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read service registry '{}'", path.display()))?;
        let registry = Self::from_json(&raw)
            .with_context(|| format!("invalid service registry '{}'", path.display()))?;
        info!(
            path = %path.display(),
            services = registry.services.len(),
            "loaded service registry"
        );
        Ok(registry)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let registry: Registry = serde_json::from_str(raw).context("malformed registry JSON")?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn service(&self, id: &str) -> ServiceResult<&Service> {
        self.services
            .iter()
            .find(|service| service.id == id)
            .ok_or_else(|| ServiceError::NotFound(format!("service '{id}'")))
    }

    pub fn layer(&self, service_id: &str, layer_id: i32) -> ServiceResult<(&Service, &Layer)> {
        let service = self.service(service_id)?;
        let layer = service.layer(layer_id).ok_or_else(|| {
            ServiceError::NotFound(format!("layer {layer_id} of service '{service_id}'"))
        })?;
        Ok((service, layer))
    }

    fn validate(&self) -> Result<()> {
        let mut service_ids = HashSet::new();
        for service in &self.services {
            if !service_ids.insert(service.id.as_str()) {
                bail!("duplicate service id '{}'", service.id);
            }
            let mut layer_ids = HashSet::new();
            for layer in &service.layers {
                if !layer_ids.insert(layer.id) {
                    bail!("service '{}' declares layer {} twice", service.id, layer.id);
                }
                validate_layer(layer)
                    .with_context(|| format!("service '{}' layer {}", service.id, layer.id))?;
            }
        }
        Ok(())
    }
}

fn validate_layer(layer: &Layer) -> Result<()> {
    ensure_identifier("table", &layer.table)?;
    ensure_identifier("objectIdField", &layer.object_id_field)?;
    ensure_identifier("geometryField", &layer.geometry_field)?;
    if let Some(display) = &layer.display_field {
        ensure_identifier("displayField", display)?;
    }
    if let Some(time_field) = layer.time_field() {
        ensure_identifier("startTimeField", time_field)?;
    }

    let mut titles = HashSet::new();
    for relation in &layer.relations {
        ensure_identifier("relatedTitle", &relation.related_title)?;
        ensure_identifier("relation table", &relation.table)?;
        ensure_identifier("sourceColumn", &relation.source_column)?;
        ensure_identifier("targetColumn", &relation.target_column)?;
        if relation.related_title == crate::models::SOURCE_ALIAS {
            bail!("relatedTitle '{}' is reserved", relation.related_title);
        }
        if !titles.insert(relation.related_title.as_str()) {
            bail!("duplicate relatedTitle '{}'", relation.related_title);
        }
    }
    Ok(())
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_safe_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        }
        _ => false,
    }
}

fn ensure_identifier(label: &str, name: &str) -> Result<()> {
    if !is_safe_identifier(name) {
        bail!("{label} '{name}' is not a safe identifier");
    }
    Ok(())
}
