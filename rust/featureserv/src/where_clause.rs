//! Gatekeeper for client supplied `where` expressions.

use crate::catalog::LayerCatalog;
use crate::error::{Result, ServiceError};
use crate::models::SOURCE_ALIAS;
use sqlparser::ast::{visit_expressions, visit_expressions_mut, Expr, Ident, SetExpr, Statement};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::keywords::Keyword;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::collections::BTreeSet;
use std::ops::ControlFlow;

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedWhere {
    pub fields: BTreeSet<String>,
    pub rewritten: String,
}

impl ParsedWhere {
    pub fn related_titles(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter_map(|field| field.split_once('.').map(|(title, _)| title))
    }
}

/// Parses and validates `raw`, returning `None` for a blank clause.
pub fn validate(
    raw: &str,
    catalog: &LayerCatalog,
    include_related: bool,
) -> Result<Option<ParsedWhere>> {
    if raw.trim().is_empty() {
        return Ok(None);
    }

    let mut expr = parse_expression(raw)?;
    let fields = referenced_fields(&expr);
    catalog.validate_fields(fields.iter().map(String::as_str), include_related)?;

    let _ = visit_expressions_mut(&mut expr, |node| {
        let aliased = match node {
            Expr::Identifier(ident) => Some(Expr::CompoundIdentifier(vec![
                Ident::with_quote('"', SOURCE_ALIAS),
                Ident::with_quote('"', ident.value.as_str()),
            ])),
            Expr::CompoundIdentifier(parts) => {
                for part in parts.iter_mut() {
                    part.quote_style = Some('"');
                }
                None
            }
            _ => None,
        };
        if let Some(aliased) = aliased {
            *node = aliased;
        }
        ControlFlow::<()>::Continue(())
    });

    Ok(Some(ParsedWhere {
        fields,
        rewritten: expr.to_string(),
    }))
}

/// Keywords that would extend the wrapping SELECT beyond its WHERE clause.
const CLAUSE_KEYWORDS: &[Keyword] = &[
    Keyword::ORDER,
    Keyword::GROUP,
    Keyword::HAVING,
    Keyword::LIMIT,
    Keyword::OFFSET,
    Keyword::FETCH,
    Keyword::UNION,
    Keyword::INTERSECT,
    Keyword::EXCEPT,
    Keyword::WINDOW,
];

fn invalid(reason: impl Into<String>) -> ServiceError {
    ServiceError::InvalidSql(reason.into())
}

fn parse_expression(raw: &str) -> Result<Expr> {
    let sql = format!("SELECT 1 WHERE {raw}");
    let dialect = PostgreSqlDialect {};

    let tokens = Tokenizer::new(&dialect, &sql)
        .tokenize()
        .map_err(|err| invalid(err.to_string()))?;
    for token in &tokens {
        match token {
            Token::SemiColon => return Err(invalid("multiple statements are not allowed")),
            Token::Placeholder(_) | Token::Question => {
                return Err(invalid("bind placeholders are not allowed"))
            }
            Token::Word(word)
                if word.quote_style.is_none() && CLAUSE_KEYWORDS.contains(&word.keyword) =>
            {
                return Err(invalid(format!("unexpected keyword {}", word.value)))
            }
            _ => {}
        }
    }

    let mut statements =
        Parser::parse_sql(&dialect, &sql).map_err(|err| invalid(err.to_string()))?;
    if statements.len() != 1 {
        return Err(invalid("multiple statements are not allowed"));
    }

    let select = match statements.remove(0) {
        Statement::Query(query) => match *query.body {
            SetExpr::Select(select) => select,
            _ => return Err(invalid("expected a boolean expression")),
        },
        _ => return Err(invalid("expected a boolean expression")),
    };
    let expr = select
        .selection
        .ok_or_else(|| invalid("expected a boolean expression"))?;

    let nested = visit_expressions(&expr, |node| match node {
        Expr::Subquery(_) | Expr::InSubquery { .. } | Expr::Exists { .. } => {
            ControlFlow::Break(())
        }
        _ => ControlFlow::Continue(()),
    });
    if nested.is_break() {
        return Err(invalid("subqueries are not allowed"));
    }

    Ok(expr)
}

fn referenced_fields(expr: &Expr) -> BTreeSet<String> {
    let mut fields = BTreeSet::new();
    let _ = visit_expressions(expr, |node| {
        match node {
            Expr::Identifier(ident) => {
                fields.insert(ident.value.clone());
            }
            Expr::CompoundIdentifier(parts) => {
                let name = parts
                    .iter()
                    .map(|part| part.value.as_str())
                    .collect::<Vec<_>>()
                    .join(".");
                fields.insert(name);
            }
            _ => {}
        }
        ControlFlow::<()>::Continue(())
    });
    fields
}
