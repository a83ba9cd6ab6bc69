use crate::error::{Result, ServiceError};
use crate::models::{Layer, Relation};
use diesel::deserialize::QueryableByName;
use diesel::pg::Pg;
use diesel::sql_query;
use diesel::sql_types::Text;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EsriFieldType {
    #[serde(rename = "esriFieldTypeOID")]
    Oid,
    #[serde(rename = "esriFieldTypeInteger")]
    Integer,
    #[serde(rename = "esriFieldTypeSmallInteger")]
    SmallInteger,
    #[serde(rename = "esriFieldTypeDouble")]
    Double,
    #[serde(rename = "esriFieldTypeString")]
    String,
    #[serde(rename = "esriFieldTypeDate")]
    Date,
    #[serde(rename = "esriFieldTypeGeometry")]
    Geometry,
}

impl EsriFieldType {
    pub fn from_native(data_type: &str) -> Self {
        match data_type {
            "integer" | "bigint" => EsriFieldType::Integer,
            "boolean" | "smallint" => EsriFieldType::SmallInteger,
            "double precision" | "real" | "numeric" => EsriFieldType::Double,
            "date" | "timestamp without time zone" | "timestamp with time zone" => {
                EsriFieldType::Date
            }
            "USER-DEFINED" => EsriFieldType::Geometry,
            _ => EsriFieldType::String,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub name: String,
    pub alias: String,
    #[serde(rename = "type")]
    pub field_type: EsriFieldType,
    pub nullable: bool,
    pub editable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relates_to: Option<String>,
    #[serde(skip)]
    pub native_type: String,
}

impl Field {
    pub fn new(name: &str, native_type: &str, nullable: bool) -> Self {
        Self {
            name: name.to_string(),
            alias: name.to_string(),
            field_type: EsriFieldType::from_native(native_type),
            nullable,
            editable: true,
            relates_to: None,
            native_type: native_type.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelatedCatalog {
    pub relation: Relation,
    pub fields: Vec<Field>,
}

impl RelatedCatalog {
    pub fn build(relation: &Relation, columns: Vec<Field>) -> Self {
        let fields = columns
            .into_iter()
            .map(|mut field| {
                if field.name == relation.source_column {
                    field.relates_to = Some(relation.target_column.clone());
                }
                field.name = format!("{}.{}", relation.related_title, field.name);
                field.alias = field.name.clone();
                field
            })
            .collect();
        Self {
            relation: relation.clone(),
            fields,
        }
    }

    pub fn qualified_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|field| field.name.as_str())
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        let prefix_len = self.relation.related_title.len() + 1;
        self.fields.iter().map(move |field| &field.name[prefix_len..])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayerCatalog {
    pub fields: Vec<Field>,
    pub related: Vec<RelatedCatalog>,
}

impl LayerCatalog {
    pub fn new(layer: &Layer, columns: Vec<Field>, related: Vec<RelatedCatalog>) -> Self {
        let fields = columns
            .into_iter()
            .map(|mut field| {
                if field.name == layer.object_id_field {
                    field.field_type = EsriFieldType::Oid;
                } else if field.name == layer.geometry_field {
                    field.field_type = EsriFieldType::Geometry;
                }
                field
            })
            .collect();
        Self { fields, related }
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn related_for(&self, title: &str) -> Option<&RelatedCatalog> {
        self.related
            .iter()
            .find(|related| related.relation.related_title == title)
    }

    pub fn is_related_field(&self, name: &str) -> bool {
        match name.split_once('.') {
            Some((title, column)) => self.related_for(title).is_some_and(|related| {
                column == "*" || related.qualified_names().any(|qualified| qualified == name)
            }),
            None => false,
        }
    }

    /// Checks client supplied names against the catalog.
    ///
    /// `*` and `title.*` are always acceptable wildcards. Related names are
    /// rejected with [`ServiceError::RelatedFields`] unless `include_related`.
    pub fn validate_fields<'a, I>(&self, names: I, include_related: bool) -> Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let unknown: BTreeSet<String> = names
            .into_iter()
            .map(|name| name.trim().replace('"', ""))
            .filter(|name| !name.is_empty() && name != "*" && !self.has_field(name))
            .collect();

        if unknown.is_empty() {
            return Ok(());
        }

        let (related, invalid): (Vec<String>, Vec<String>) = unknown
            .into_iter()
            .partition(|name| self.is_related_field(name));

        if !include_related && !related.is_empty() {
            return Err(ServiceError::related_fields(related));
        }
        if !invalid.is_empty() {
            return Err(ServiceError::invalid_fields(invalid));
        }
        Ok(())
    }
}

#[derive(Debug, QueryableByName)]
struct ColumnRow {
    #[diesel(sql_type = Text)]
    column_name: String,
    #[diesel(sql_type = Text)]
    is_nullable: String,
    #[diesel(sql_type = Text)]
    data_type: String,
}

const COLUMNS_SQL: &str = "SELECT column_name::text AS column_name, is_nullable::text AS is_nullable, data_type::text AS data_type \
     FROM information_schema.columns \
     WHERE table_name = $1 \
     ORDER BY ordinal_position";

#[derive(Debug, Default)]
pub struct CatalogSession {
    tables: HashMap<String, Vec<Field>>,
}

impl CatalogSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fields_for(
        &mut self,
        conn: &mut AsyncPgConnection,
        table: &str,
    ) -> Result<Vec<Field>> {
        if let Some(fields) = self.tables.get(table) {
            return Ok(fields.clone());
        }

        let rows: Vec<ColumnRow> = sql_query(COLUMNS_SQL)
            .into_boxed::<Pg>()
            .bind::<Text, _>(table.to_string())
            .load(conn)
            .await
            .map_err(ServiceError::from_database)?;
        debug!(table, columns = rows.len(), "introspected table");

        let fields: Vec<Field> = rows
            .iter()
            .map(|row| Field::new(&row.column_name, &row.data_type, row.is_nullable == "YES"))
            .collect();
        self.tables.insert(table.to_string(), fields.clone());
        Ok(fields)
    }

    pub async fn layer_catalog(
        &mut self,
        conn: &mut AsyncPgConnection,
        layer: &Layer,
    ) -> Result<LayerCatalog> {
        let columns = self.fields_for(conn, &layer.table).await?;
        if columns.is_empty() {
            return Err(ServiceError::NotFound(format!(
                "table '{}' for layer '{}'",
                layer.table, layer.name
            )));
        }

        let mut related = Vec::with_capacity(layer.relations.len());
        for relation in &layer.relations {
            let columns = self.fields_for(conn, &relation.table).await?;
            related.push(RelatedCatalog::build(relation, columns));
        }

        Ok(LayerCatalog::new(layer, columns, related))
    }
}
