use super::sql::{qualified, quote_ident, CompiledQuery, SqlBindValue, SqlWriter};
use crate::catalog::LayerCatalog;
use crate::error::{Result, ServiceError};
use crate::models::{Layer, Relation, GEOMETRY_OUTPUT_COLUMN, SOURCE_ALIAS, WEB_MERCATOR_SRID};
use crate::time::TimeRange;
use crate::where_clause::{self, ParsedWhere};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderByField {
    pub name: String,
    pub direction: Option<SortDirection>,
}

impl OrderByField {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: None,
        }
    }

    /// Parses `"field [asc|desc]"`, case-insensitive on the modifier.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split_whitespace();
        let name = normalize_field(parts.next()?);
        if name.is_empty() {
            return None;
        }
        let direction = match parts.next().map(str::to_ascii_lowercase).as_deref() {
            Some("asc") => Some(SortDirection::Asc),
            Some("desc") => Some(SortDirection::Desc),
            _ => None,
        };
        Some(Self { name, direction })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    /// Empty means `*`.
    pub return_fields: Vec<String>,
    pub where_clause: Option<String>,
    pub order_by: Vec<OrderByField>,
    pub object_ids: Vec<i64>,
    pub extent_wkt: Option<String>,
    pub time: Option<TimeRange>,
    pub out_srid: i32,
    /// Zero means unbounded.
    pub limit: i64,
    pub offset: i64,
    pub ids_only: bool,
    pub count_only: bool,
    pub return_geometry: bool,
}

impl Default for QueryRequest {
    fn default() -> Self {
        Self {
            return_fields: Vec::new(),
            where_clause: None,
            order_by: Vec::new(),
            object_ids: Vec::new(),
            extent_wkt: None,
            time: None,
            out_srid: WEB_MERCATOR_SRID,
            limit: 0,
            offset: 0,
            ids_only: false,
            count_only: false,
            return_geometry: true,
        }
    }
}

impl QueryRequest {
    pub fn is_paged(&self) -> bool {
        !self.ids_only && self.object_ids.is_empty()
    }

    pub fn page_limit(&self) -> Option<i64> {
        (self.is_paged() && self.limit > 0).then_some(self.limit)
    }

    pub fn include_related(&self) -> bool {
        !self.object_ids.is_empty()
    }
}

pub fn normalize_field(raw: &str) -> String {
    raw.trim().replace('"', "")
}

enum Projection {
    Count,
    Ids,
    Fields { names: Vec<String>, geometry: bool },
}

pub fn compile(layer: &Layer, catalog: &LayerCatalog, request: &QueryRequest) -> Result<CompiledQuery> {
    let offset = request.offset.max(0);
    let ids_only = request.ids_only;
    let count_only = !ids_only && request.count_only;
    let include_related = request.include_related();

    let mut return_fields: Vec<String> = request
        .return_fields
        .iter()
        .map(|field| normalize_field(field))
        .filter(|field| !field.is_empty())
        .collect();
    if return_fields.is_empty() {
        return_fields.push("*".to_string());
    }
    let mut order_by = request.order_by.clone();

    if ids_only {
        return_fields = vec![layer.object_id_field.clone()];
        order_by = Vec::new();
    } else {
        catalog.validate_fields(return_fields.iter().map(String::as_str), include_related)?;
        if let Some(wildcard) = order_by
            .iter()
            .find(|field| field.name == "*" || field.name.ends_with(".*"))
        {
            return Err(ServiceError::invalid_fields([wildcard.name.clone()]));
        }
        catalog.validate_fields(order_by.iter().map(|field| field.name.as_str()), include_related)?;
    }

    let parsed_where = match request.where_clause.as_deref() {
        Some(raw) => where_clause::validate(raw, catalog, include_related)?,
        None => None,
    };

    let projection = if count_only {
        return_fields.clear();
        order_by.clear();
        Projection::Count
    } else if ids_only {
        Projection::Ids
    } else {
        if !return_fields.contains(&layer.object_id_field) {
            return_fields.insert(0, layer.object_id_field.clone());
        }
        Projection::Fields {
            names: expand_fields(layer, catalog, &return_fields),
            geometry: request.return_geometry,
        }
    };

    let joined = joined_relations(layer, &return_fields, &order_by, parsed_where.as_ref());

    let mut sql = SqlWriter::new();
    sql.push("SELECT ");
    match &projection {
        Projection::Count => {
            sql.push("COUNT(0) AS \"count\"");
        }
        Projection::Ids => {
            sql.push("DISTINCT ")
                .push(&qualified(SOURCE_ALIAS, &layer.object_id_field));
        }
        Projection::Fields { names, geometry } => {
            let mut items: Vec<String> = names.iter().map(|name| select_item(name)).collect();
            if *geometry {
                let srid = sql.bind(SqlBindValue::Int(request.out_srid));
                items.push(format!(
                    "ST_AsText(ST_Transform({}, {srid})) AS {}",
                    qualified(SOURCE_ALIAS, &layer.geometry_field),
                    quote_ident(GEOMETRY_OUTPUT_COLUMN)
                ));
            }
            sql.push(&items.join(", "));
        }
    }

    sql.push(&format!(
        " FROM {} AS {} ",
        quote_ident(&layer.table),
        quote_ident(SOURCE_ALIAS)
    ));
    let joins: Vec<String> = joined.iter().map(|relation| join_clause(relation)).collect();
    sql.push(&joins.join(" ")).push(" ");

    push_where(&mut sql, layer, request, parsed_where.as_ref(), count_only);
    sql.push(" ");

    let order_items = order_clause(layer, &projection, order_by, &joined);
    if !order_items.is_empty() {
        sql.push("ORDER BY ").push(&order_items.join(", "));
    }
    sql.push(" ");

    let paged = request.is_paged();
    if let Some(limit) = request.page_limit() {
        sql.push("LIMIT ").push_bind(SqlBindValue::BigInt(limit + 1));
    }
    sql.push(" ");
    if paged && offset > 0 {
        sql.push("OFFSET ").push_bind(SqlBindValue::BigInt(offset));
    }

    Ok(sql.finish())
}

/// Expands `*` and `title.*` into concrete field names.
pub fn expand_fields(layer: &Layer, catalog: &LayerCatalog, fields: &[String]) -> Vec<String> {
    let wants_expansion = fields
        .iter()
        .any(|field| field == "*" || field.contains('.'));

    let mut expanded: Vec<String> = Vec::new();
    if wants_expansion {
        expanded.push(layer.object_id_field.clone());
        expanded.extend(
            layer
                .relations
                .iter()
                .map(|relation| relation.source_column.clone()),
        );
    }

    for field in fields {
        if field == "*" {
            expanded.extend(catalog.fields.iter().map(|field| field.name.clone()));
        } else if let Some(title) = field.strip_suffix(".*") {
            if let Some(related) = catalog.related_for(title) {
                expanded.extend(related.qualified_names().map(str::to_string));
            }
        } else {
            expanded.push(field.clone());
        }
    }

    let mut seen = BTreeSet::new();
    expanded
        .into_iter()
        .filter(|field| field != &layer.geometry_field)
        .filter(|field| seen.insert(field.clone()))
        .collect()
}

fn select_item(name: &str) -> String {
    format!("{} AS {}", field_ref(name), quote_ident(name))
}

/// `"source"."f"` for layer fields, `"title"."f"` for related ones.
fn field_ref(name: &str) -> String {
    match name.split_once('.') {
        Some((title, column)) => qualified(title, column),
        None => qualified(SOURCE_ALIAS, name),
    }
}

fn joined_relations<'a>(
    layer: &'a Layer,
    return_fields: &[String],
    order_by: &[OrderByField],
    parsed_where: Option<&ParsedWhere>,
) -> Vec<&'a Relation> {
    let mut titles: BTreeSet<&str> = BTreeSet::new();
    let referenced = return_fields
        .iter()
        .map(String::as_str)
        .chain(order_by.iter().map(|field| field.name.as_str()));
    for field in referenced {
        if let Some((title, _)) = field.split_once('.') {
            titles.insert(title);
        }
    }
    if let Some(parsed) = parsed_where {
        titles.extend(parsed.related_titles());
    }

    layer
        .relations
        .iter()
        .filter(|relation| titles.contains(relation.related_title.as_str()))
        .collect()
}

fn join_clause(relation: &Relation) -> String {
    format!(
        "LEFT OUTER JOIN {} AS {} ON {} = {}",
        quote_ident(&relation.table),
        quote_ident(&relation.related_title),
        qualified(SOURCE_ALIAS, &relation.source_column),
        qualified(&relation.related_title, &relation.target_column)
    )
}

fn push_where(
    sql: &mut SqlWriter,
    layer: &Layer,
    request: &QueryRequest,
    parsed_where: Option<&ParsedWhere>,
    count_only: bool,
) {
    sql.push("WHERE 1=1");
    if let Some(parsed) = parsed_where {
        sql.push(" AND (").push(&parsed.rewritten).push(")");
    }

    if let Some(time_field) = layer.time_field() {
        let column = qualified(SOURCE_ALIAS, time_field);
        match &request.time {
            Some(range) if range.is_instant() => {
                sql.push(&format!(" AND {column} = "))
                    .push_bind(SqlBindValue::Timestamp(range.start))
                    .push("::date");
            }
            Some(range) => {
                sql.push(&format!(" AND {column} BETWEEN "))
                    .push_bind(SqlBindValue::Timestamp(range.start))
                    .push("::date AND ")
                    .push_bind(SqlBindValue::Timestamp(range.end))
                    .push("::date");
            }
            None if parsed_where.is_none() && !count_only => {
                // Without any filter a time-enabled layer shows its first step.
                sql.push(&format!(
                    " AND {column} = (SELECT MIN({}) FROM {})",
                    quote_ident(time_field),
                    quote_ident(&layer.table)
                ));
            }
            None => {}
        }
    }

    if !request.object_ids.is_empty() {
        let placeholders: Vec<String> = request
            .object_ids
            .iter()
            .map(|id| sql.bind(SqlBindValue::BigInt(*id)))
            .collect();
        sql.push(&format!(
            " AND {} IN ({})",
            qualified(SOURCE_ALIAS, &layer.object_id_field),
            placeholders.join(", ")
        ));
    }

    if let Some(extent) = &request.extent_wkt {
        sql.push(&format!(
            " AND ST_Intersects({}, ST_GeomFromText(",
            qualified(SOURCE_ALIAS, &layer.geometry_field)
        ))
        .push_bind(SqlBindValue::Text(extent.clone()))
        .push(&format!(", {WEB_MERCATOR_SRID}))"));
    }
}

fn order_clause(
    layer: &Layer,
    projection: &Projection,
    order_by: Vec<OrderByField>,
    joined: &[&Relation],
) -> Vec<String> {
    let fields = match projection {
        Projection::Count => return Vec::new(),
        Projection::Ids => vec![OrderByField::new(layer.object_id_field.clone())],
        Projection::Fields { .. } => {
            let mut fields = order_by;
            if fields.is_empty() {
                let mut by_index: Vec<&&Relation> = joined.iter().collect();
                by_index.sort_by(|a, b| b.related_index.cmp(&a.related_index));
                for relation in by_index {
                    if !fields.iter().any(|field| field.name == relation.source_column) {
                        fields.push(OrderByField::new(relation.source_column.clone()));
                    }
                }
            }
            if !fields.iter().any(|field| field.name == layer.object_id_field) {
                fields.push(OrderByField::new(layer.object_id_field.clone()));
            }
            fields
        }
    };

    fields
        .iter()
        .map(|field| match field.direction {
            Some(direction) => format!("{} {}", field_ref(&field.name), direction.as_sql()),
            None => field_ref(&field.name),
        })
        .collect()
}
