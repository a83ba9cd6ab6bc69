use chrono::NaiveDateTime;
use diesel::pg::Pg;
use diesel::query_builder::{BoxedSqlQuery, SqlQuery};
use diesel::sql_query;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BindKind {
    Text,
    BigInt,
    Int,
    Float,
    Bool,
    Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum SqlBindValue {
    Text(String),
    BigInt(i64),
    Int(i32),
    Float(f64),
    Bool(bool),
    Timestamp(NaiveDateTime),
    Null(BindKind),
}

impl SqlBindValue {
    pub fn apply<'a>(
        &self,
        query: BoxedSqlQuery<'a, Pg, SqlQuery>,
    ) -> BoxedSqlQuery<'a, Pg, SqlQuery> {
        use diesel::sql_types::{Bool, Float8, Int4, Int8, Nullable, Text, Timestamp};
        match self {
            SqlBindValue::Text(value) => query.bind::<Text, _>(value.clone()),
            SqlBindValue::BigInt(value) => query.bind::<Int8, _>(*value),
            SqlBindValue::Int(value) => query.bind::<Int4, _>(*value),
            SqlBindValue::Float(value) => query.bind::<Float8, _>(*value),
            SqlBindValue::Bool(value) => query.bind::<Bool, _>(*value),
            SqlBindValue::Timestamp(value) => query.bind::<Timestamp, _>(*value),
            SqlBindValue::Null(kind) => match kind {
                BindKind::Text => query.bind::<Nullable<Text>, _>(None::<String>),
                BindKind::BigInt => query.bind::<Nullable<Int8>, _>(None::<i64>),
                BindKind::Int => query.bind::<Nullable<Int4>, _>(None::<i32>),
                BindKind::Float => query.bind::<Nullable<Float8>, _>(None::<f64>),
                BindKind::Bool => query.bind::<Nullable<Bool>, _>(None::<bool>),
                BindKind::Timestamp => {
                    query.bind::<Nullable<Timestamp>, _>(None::<NaiveDateTime>)
                }
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<SqlBindValue>,
}

impl CompiledQuery {
    pub fn into_boxed<'a>(self) -> BoxedSqlQuery<'a, Pg, SqlQuery> {
        let mut query = sql_query(self.sql).into_boxed::<Pg>();
        for bind in &self.params {
            query = bind.apply(query);
        }
        query
    }

    /// Wraps the statement so every row arrives as one JSON object.
    pub fn as_json_rows(self) -> Self {
        Self {
            sql: format!("SELECT to_jsonb(q) AS row FROM ({}) AS q", self.sql),
            params: self.params,
        }
    }
}

#[derive(Debug, Default)]
pub struct SqlWriter {
    sql: String,
    params: Vec<SqlBindValue>,
}

impl SqlWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, text: &str) -> &mut Self {
        self.sql.push_str(text);
        self
    }

    /// Pushes a bind and returns its `$n` placeholder.
    pub fn bind(&mut self, value: SqlBindValue) -> String {
        self.params.push(value);
        format!("${}", self.params.len())
    }

    pub fn push_bind(&mut self, value: SqlBindValue) -> &mut Self {
        let placeholder = self.bind(value);
        self.sql.push_str(&placeholder);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }

    pub fn finish(self) -> CompiledQuery {
        CompiledQuery {
            sql: self.sql,
            params: self.params,
        }
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn qualified(alias: &str, column: &str) -> String {
    format!("{}.{}", quote_ident(alias), quote_ident(column))
}
