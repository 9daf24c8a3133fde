//! Structural equivalence pre-check for query rewrites.
//!
//! A rewrite is accepted only when it provably keeps the shape of the result:
//! the same output columns (names and, when the backend reports schemas,
//! types), every top-level filter of the original still AND-ed into one of the
//! rewrite's WHERE clauses (its own, a CTE's or a subquery's), and the same
//! DISTINCT / GROUP BY / LIMIT clauses. A filter under NOT or inside an OR
//! group counts as removed. This is a conservative lexical check,
//! not a proof of row-level identical output: anything it cannot verify is
//! rejected.

use costwatch_abstraction::ColumnSchema;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static BLOCK_COMMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)/\*.*?\*/").expect("block comment pattern is valid"));
static LINE_COMMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"--[^\n]*").expect("line comment pattern is valid"));

const CLAUSE_KEYWORDS: &[&str] = &[
    "where", "group", "having", "qualify", "window", "order", "limit", "union", "intersect",
    "except",
];

/// Why a rewrite was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EquivalenceViolation {
    /// The text has no recognizable top-level SELECT.
    #[error("{which} query has no recognizable top-level SELECT")]
    UnrecognizedStructure {
        /// `original` or `rewritten`.
        which: &'static str,
    },

    /// Output column names or count differ.
    #[error("output columns changed: [{expected}] -> [{actual}]")]
    ProjectionChanged {
        /// Original columns.
        expected: String,
        /// Rewritten columns.
        actual: String,
    },

    /// Same column name, different type.
    #[error("column '{column}' changed type: {from} -> {to}")]
    ColumnTypeChanged {
        /// Column name.
        column: String,
        /// Original type.
        from: String,
        /// Rewritten type.
        to: String,
    },

    /// A wildcard projection changed and no schema is available to compare.
    #[error("wildcard projection cannot be verified without output schemas")]
    UnverifiableProjection,

    /// A top-level filter of the original is not a conjunct of any WHERE
    /// clause of the rewrite.
    #[error("filter '{0}' was removed")]
    FilterRemoved(String),

    /// A result-shaping clause was added, removed or changed.
    #[error("{0} clause changed")]
    ClauseChanged(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Word,
    Literal,
    Symbol,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Token {
    text: String,
    kind: Kind,
    depth: usize,
}

impl Token {
    fn is_word(&self, word: &str) -> bool {
        self.kind == Kind::Word && self.text == word
    }

    fn is_symbol(&self, symbol: &str) -> bool {
        self.kind == Kind::Symbol && self.text == symbol
    }
}

fn tokenize(sql: &str) -> Vec<Token> {
    let without_block = BLOCK_COMMENT.replace_all(sql, " ");
    let cleaned = LINE_COMMENT.replace_all(&without_block, " ");
    let chars: Vec<char> = cleaned.chars().collect();

    let mut tokens = Vec::new();
    let mut depth = 0usize;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '\'' || c == '"' {
            let start = i;
            i += 1;
            while i < chars.len() && chars[i] != c {
                if chars[i] == '\\' {
                    i += 1;
                }
                i += 1;
            }
            i = (i + 1).min(chars.len());
            tokens.push(Token { text: chars[start..i].iter().collect(), kind: Kind::Literal, depth });
        } else if c == '`' {
            let start = i + 1;
            i += 1;
            while i < chars.len() && chars[i] != '`' {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            i = (i + 1).min(chars.len());
            tokens.push(Token { text: text.to_lowercase(), kind: Kind::Word, depth });
        } else if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '.') {
                i += 1;
            }
            tokens.push(Token { text: chars[start..i].iter().collect(), kind: Kind::Literal, depth });
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            tokens.push(Token { text: text.to_lowercase(), kind: Kind::Word, depth });
        } else if c == '(' {
            tokens.push(Token { text: "(".to_string(), kind: Kind::Symbol, depth });
            depth += 1;
            i += 1;
        } else if c == ')' {
            depth = depth.saturating_sub(1);
            tokens.push(Token { text: ")".to_string(), kind: Kind::Symbol, depth });
            i += 1;
        } else {
            let pair: String = chars[i..(i + 2).min(chars.len())].iter().collect();
            let text = if matches!(pair.as_str(), ">=" | "<=" | "<>" | "!=" | "||") {
                pair
            } else {
                c.to_string()
            };
            i += text.chars().count();
            tokens.push(Token { text, kind: Kind::Symbol, depth });
        }
    }
    tokens
}

fn render(tokens: &[Token]) -> String {
    tokens.iter().map(|t| t.text.as_str()).collect::<Vec<_>>().join(" ")
}

/// Output column as far as the text reveals it.
#[derive(Debug, Clone, PartialEq, Eq)]
enum OutputColumn {
    Named(String),
    Wildcard(String),
}

impl OutputColumn {
    fn label(&self) -> &str {
        match self {
            Self::Named(name) | Self::Wildcard(name) => name,
        }
    }
}

/// Result-shaping features of a query's top-level SELECT.
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueryShape {
    distinct: bool,
    columns: Vec<OutputColumn>,
    filters: Vec<String>,
    group_by: bool,
    limit: Option<String>,
    /// Conjuncts of every WHERE clause, nested ones included.
    retained_filters: Vec<String>,
}

impl QueryShape {
    fn parse(sql: &str) -> Option<Self> {
        let tokens = tokenize(sql);
        let select = tokens.iter().position(|t| t.depth == 0 && t.is_word("select"))?;
        let find_top_level = |start: usize, word: &str| {
            tokens[start..].iter().position(|t| t.depth == 0 && t.is_word(word)).map(|p| p + start)
        };

        let mut projection_start = select + 1;
        let distinct = tokens.get(projection_start).is_some_and(|t| t.is_word("distinct"));
        if distinct || tokens.get(projection_start).is_some_and(|t| t.is_word("all")) {
            projection_start += 1;
        }
        let from = find_top_level(projection_start, "from");
        let projection_end = from
            .or_else(|| {
                tokens[projection_start..]
                    .iter()
                    .position(|t| t.depth == 0 && CLAUSE_KEYWORDS.contains(&t.text.as_str()))
                    .map(|p| p + projection_start)
            })
            .unwrap_or(tokens.len());

        let columns = split_top_level(&tokens[projection_start..projection_end], |t| t.is_symbol(","))
            .into_iter()
            .filter(|item| !item.is_empty())
            .map(output_column)
            .collect();

        let body_start = from.unwrap_or(projection_end);
        let filters = match find_top_level(body_start, "where") {
            Some(where_at) => {
                let end = clause_end(&tokens, where_at + 1);
                conjuncts(&tokens[where_at + 1..end])
            }
            None => Vec::new(),
        };

        let group_by = tokens[body_start..]
            .windows(2)
            .any(|w| w[0].depth == 0 && w[0].is_word("group") && w[1].is_word("by"));
        let limit = find_top_level(body_start, "limit").map(|at| {
            let end = clause_end(&tokens, at + 1);
            render(&tokens[at + 1..end])
        });

        let retained_filters = tokens
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_word("where"))
            .flat_map(|(at, t)| conjuncts(&tokens[at + 1..where_end(&tokens, at + 1, t.depth)]))
            .collect();

        Some(Self { distinct, columns, filters, group_by, limit, retained_filters })
    }
}

fn clause_end(tokens: &[Token], start: usize) -> usize {
    tokens[start..]
        .iter()
        .position(|t| t.depth == 0 && CLAUSE_KEYWORDS.contains(&t.text.as_str()))
        .map_or(tokens.len(), |p| p + start)
}

/// End of a WHERE clause opened at `depth`: the next clause keyword at that
/// depth, or the parenthesis closing the enclosing subquery.
fn where_end(tokens: &[Token], start: usize, depth: usize) -> usize {
    tokens[start..]
        .iter()
        .position(|t| {
            t.depth < depth
                || (t.depth == depth && t.kind == Kind::Word && CLAUSE_KEYWORDS.contains(&t.text.as_str()))
        })
        .map_or(tokens.len(), |p| p + start)
}

fn split_top_level<'a>(tokens: &'a [Token], is_separator: impl Fn(&Token) -> bool) -> Vec<&'a [Token]> {
    let Some(base) = tokens.first().map(|t| t.depth) else {
        return Vec::new();
    };
    let mut parts = Vec::new();
    let mut start = 0;
    for (i, token) in tokens.iter().enumerate() {
        if token.depth == base && is_separator(token) {
            parts.push(&tokens[start..i]);
            start = i + 1;
        }
    }
    parts.push(&tokens[start..]);
    parts
}

fn output_column(item: &[Token]) -> OutputColumn {
    let n = item.len();
    let last = &item[n - 1];

    if last.is_symbol("*") {
        return OutputColumn::Wildcard(render(item));
    }
    if n >= 2 && item[n - 2].is_word("as") {
        return OutputColumn::Named(last.text.clone());
    }
    let is_chain = item
        .iter()
        .enumerate()
        .all(|(i, t)| if i % 2 == 0 { t.kind == Kind::Word } else { t.is_symbol(".") });
    if is_chain && last.kind == Kind::Word {
        return OutputColumn::Named(last.text.clone());
    }
    // Implicit alias: `SUM(x) total`.
    if n >= 2
        && last.kind == Kind::Word
        && !matches!(last.text.as_str(), "end" | "null" | "true" | "false")
        && (item[n - 2].is_symbol(")") || item[n - 2].kind != Kind::Symbol)
        && last.depth == item[0].depth
    {
        return OutputColumn::Named(last.text.clone());
    }
    OutputColumn::Named(render(item))
}

fn conjuncts(tokens: &[Token]) -> Vec<String> {
    let Some(base) = tokens.first().map(|t| t.depth) else {
        return Vec::new();
    };
    let mut parts = Vec::new();
    let mut start = 0;
    let mut open_between = 0usize;
    for (i, token) in tokens.iter().enumerate() {
        if token.depth != base {
            continue;
        }
        if token.is_word("between") {
            open_between += 1;
        } else if token.is_word("and") {
            if open_between > 0 {
                open_between -= 1;
            } else {
                parts.push(&tokens[start..i]);
                start = i + 1;
            }
        }
    }
    parts.push(&tokens[start..]);

    let mut found = Vec::new();
    for part in parts.into_iter().filter(|p| !p.is_empty()) {
        let inner = strip_parens(part);
        if inner.is_empty() {
            continue;
        }
        if inner.len() < part.len() {
            // `(a AND b) AND c` flattens to three conjuncts.
            found.extend(conjuncts(inner));
        } else {
            found.push(render(part));
        }
    }
    found
}

fn strip_parens(mut tokens: &[Token]) -> &[Token] {
    while tokens.len() >= 2
        && tokens[0].is_symbol("(")
        && tokens[tokens.len() - 1].is_symbol(")")
        && tokens[1..tokens.len() - 1].iter().all(|t| t.depth > tokens[0].depth)
    {
        tokens = &tokens[1..tokens.len() - 1];
    }
    tokens
}

fn labels(columns: &[OutputColumn]) -> String {
    columns.iter().map(OutputColumn::label).collect::<Vec<_>>().join(", ")
}

fn schema_labels(schema: &[ColumnSchema]) -> String {
    schema.iter().map(|c| c.name.to_lowercase()).collect::<Vec<_>>().join(", ")
}

fn check_schemas(original: &[ColumnSchema], rewritten: &[ColumnSchema]) -> Result<(), EquivalenceViolation> {
    let names_match = original.len() == rewritten.len()
        && original.iter().zip(rewritten).all(|(a, b)| a.name.eq_ignore_ascii_case(&b.name));
    if !names_match {
        return Err(EquivalenceViolation::ProjectionChanged {
            expected: schema_labels(original),
            actual: schema_labels(rewritten),
        });
    }
    for (a, b) in original.iter().zip(rewritten) {
        if !a.data_type.eq_ignore_ascii_case(&b.data_type) {
            return Err(EquivalenceViolation::ColumnTypeChanged {
                column: a.name.clone(),
                from: a.data_type.clone(),
                to: b.data_type.clone(),
            });
        }
    }
    Ok(())
}

fn check_projection(original: &QueryShape, rewritten: &QueryShape) -> Result<(), EquivalenceViolation> {
    let has_wildcard = |shape: &QueryShape| {
        shape.columns.iter().any(|c| matches!(c, OutputColumn::Wildcard(_)))
    };
    if has_wildcard(original) || has_wildcard(rewritten) {
        return if original.columns == rewritten.columns {
            Ok(())
        } else {
            Err(EquivalenceViolation::UnverifiableProjection)
        };
    }
    if original.columns != rewritten.columns {
        return Err(EquivalenceViolation::ProjectionChanged {
            expected: labels(&original.columns),
            actual: labels(&rewritten.columns),
        });
    }
    Ok(())
}

/// Checks that `rewritten` keeps the result shape of `original`.
///
/// Schemas are the output columns reported by the backend's dry run; when both
/// are non-empty they take precedence over the lexical projection comparison.
///
/// # Errors
/// Returns the first [`EquivalenceViolation`] found.
pub fn check_equivalence(
    original: &str,
    original_schema: &[ColumnSchema],
    rewritten: &str,
    rewritten_schema: &[ColumnSchema],
) -> Result<(), EquivalenceViolation> {
    let before = QueryShape::parse(original)
        .ok_or(EquivalenceViolation::UnrecognizedStructure { which: "original" })?;
    let after = QueryShape::parse(rewritten)
        .ok_or(EquivalenceViolation::UnrecognizedStructure { which: "rewritten" })?;

    if original_schema.is_empty() || rewritten_schema.is_empty() {
        check_projection(&before, &after)?;
    } else {
        check_schemas(original_schema, rewritten_schema)?;
    }

    if let Some(missing) = before.filters.iter().find(|f| !after.retained_filters.contains(f)) {
        return Err(EquivalenceViolation::FilterRemoved(missing.clone()));
    }

    if before.distinct != after.distinct {
        return Err(EquivalenceViolation::ClauseChanged("DISTINCT"));
    }
    if before.group_by != after.group_by {
        return Err(EquivalenceViolation::ClauseChanged("GROUP BY"));
    }
    if before.limit != after.limit {
        return Err(EquivalenceViolation::ClauseChanged("LIMIT"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORIGINAL: &str = "SELECT o.order_id, o.customer_id, SUM(o.amount) AS total
        FROM `analytics.sales.orders` o
        WHERE o.status = 'SHIPPED' AND o.region IN ('EU', 'US')
        GROUP BY o.order_id, o.customer_id";

    fn check(rewritten: &str) -> Result<(), EquivalenceViolation> {
        check_equivalence(ORIGINAL, &[], rewritten, &[])
    }

    #[test]
    fn test_partition_filter_rewrite_is_accepted() {
        let rewritten = "-- prune partitions
            SELECT o.order_id, o.customer_id, SUM(o.amount) AS total
            FROM `analytics.sales.orders` o
            WHERE o._PARTITIONDATE >= '2024-01-01'
              AND o.status = 'SHIPPED' AND o.region IN ('EU','US')
            GROUP BY o.order_id, o.customer_id";
        assert_eq!(check(rewritten), Ok(()));
    }

    #[test]
    fn test_filter_moved_into_cte_is_accepted() {
        let rewritten = "WITH shipped AS (
                SELECT order_id, customer_id, amount FROM analytics.sales.orders o
                WHERE o.status = 'SHIPPED' AND o.region IN ('EU', 'US')
            )
            SELECT order_id, customer_id, SUM(amount) AS total FROM shipped
            GROUP BY order_id, customer_id";
        assert_eq!(check(rewritten), Ok(()));
    }

    #[test]
    fn test_dropped_filter_is_rejected() {
        let rewritten = "SELECT o.order_id, o.customer_id, SUM(o.amount) AS total
            FROM analytics.sales.orders o WHERE o.status = 'SHIPPED'
            GROUP BY o.order_id, o.customer_id";
        assert_eq!(
            check(rewritten),
            Err(EquivalenceViolation::FilterRemoved("o . region in ( 'EU' , 'US' )".to_string()))
        );
    }

    #[test]
    fn test_negated_filter_is_rejected() {
        let original = "SELECT user_id, amount FROM sales.orders WHERE status = 'paid'";
        let rewritten = "SELECT user_id, amount FROM sales.orders WHERE NOT (status = 'paid')";
        assert_eq!(
            check_equivalence(original, &[], rewritten, &[]),
            Err(EquivalenceViolation::FilterRemoved("status = 'paid'".to_string()))
        );
    }

    #[test]
    fn test_filter_or_ed_away_is_rejected() {
        let original = "SELECT user_id, amount FROM sales.orders WHERE status = 'paid'";
        for rewritten in [
            "SELECT user_id, amount FROM sales.orders WHERE status = 'paid' OR 1 = 1",
            "SELECT user_id, amount FROM sales.orders WHERE (status = 'paid' OR region = 'EU')",
        ] {
            assert_eq!(
                check_equivalence(original, &[], rewritten, &[]),
                Err(EquivalenceViolation::FilterRemoved("status = 'paid'".to_string())),
                "{rewritten}"
            );
        }
    }

    #[test]
    fn test_filter_only_mentioned_outside_where_is_rejected() {
        let original = "SELECT user_id, amount FROM sales.orders WHERE status = 'paid'";
        let rewritten = "SELECT user_id, amount FROM sales.orders
            WHERE CASE WHEN status = 'paid' THEN TRUE ELSE TRUE END";
        assert!(matches!(
            check_equivalence(original, &[], rewritten, &[]),
            Err(EquivalenceViolation::FilterRemoved(_))
        ));
    }

    #[test]
    fn test_parenthesized_and_group_keeps_filters() {
        let rewritten = "SELECT o.order_id, o.customer_id, SUM(o.amount) AS total
            FROM analytics.sales.orders o
            WHERE (o.status = 'SHIPPED' AND o.region IN ('EU', 'US')) AND o.day > 3
            GROUP BY o.order_id, o.customer_id";
        assert_eq!(check(rewritten), Ok(()));
    }

    #[test]
    fn test_filter_in_subquery_where_is_kept() {
        let original = "SELECT user_id, amount FROM sales.orders WHERE status = 'paid'";
        let rewritten = "SELECT user_id, amount FROM (
                SELECT user_id, amount FROM sales.orders WHERE status = 'paid' AND day > 3
            ) paid";
        assert_eq!(check_equivalence(original, &[], rewritten, &[]), Ok(()));
    }

    #[test]
    fn test_dropped_column_is_rejected() {
        let rewritten = "SELECT o.order_id, SUM(o.amount) AS total
            FROM analytics.sales.orders o
            WHERE o.status = 'SHIPPED' AND o.region IN ('EU', 'US')
            GROUP BY o.order_id";
        assert!(matches!(check(rewritten), Err(EquivalenceViolation::ProjectionChanged { .. })));
    }

    #[test]
    fn test_renamed_alias_is_rejected() {
        let rewritten = "SELECT o.order_id, o.customer_id, SUM(o.amount) AS amount_total
            FROM analytics.sales.orders o
            WHERE o.status = 'SHIPPED' AND o.region IN ('EU', 'US')
            GROUP BY o.order_id, o.customer_id";
        assert!(matches!(check(rewritten), Err(EquivalenceViolation::ProjectionChanged { .. })));
    }

    #[test]
    fn test_added_limit_is_rejected() {
        let rewritten = format!("{} LIMIT 1000", ORIGINAL);
        assert_eq!(check(&rewritten), Err(EquivalenceViolation::ClauseChanged("LIMIT")));
    }

    #[test]
    fn test_removed_group_by_is_rejected() {
        let rewritten = "SELECT o.order_id, o.customer_id, o.amount AS total
            FROM analytics.sales.orders o
            WHERE o.status = 'SHIPPED' AND o.region IN ('EU', 'US')";
        assert_eq!(check(rewritten), Err(EquivalenceViolation::ClauseChanged("GROUP BY")));
    }

    #[test]
    fn test_between_is_one_conjunct() {
        let original = "SELECT id FROM t WHERE day BETWEEN 1 AND 7 AND kind = 'x'";
        let shape = QueryShape::parse(original).unwrap();
        assert_eq!(shape.filters, vec!["day between 1 and 7", "kind = 'x'"]);
    }

    #[test]
    fn test_star_to_explicit_columns_needs_schemas() {
        let original = "SELECT * FROM sales.orders WHERE status = 'SHIPPED'";
        let rewritten = "SELECT order_id, amount FROM sales.orders WHERE status = 'SHIPPED'";
        assert_eq!(
            check_equivalence(original, &[], rewritten, &[]),
            Err(EquivalenceViolation::UnverifiableProjection)
        );

        let schema = vec![ColumnSchema::new("order_id", "INT64"), ColumnSchema::new("amount", "NUMERIC")];
        assert_eq!(check_equivalence(original, &schema, rewritten, &schema), Ok(()));
    }

    #[test]
    fn test_schema_type_change_is_rejected() {
        let sql = "SELECT amount FROM sales.orders";
        let before = vec![ColumnSchema::new("amount", "NUMERIC")];
        let after = vec![ColumnSchema::new("amount", "FLOAT64")];
        assert_eq!(
            check_equivalence(sql, &before, "SELECT CAST(amount AS FLOAT64) AS amount FROM sales.orders", &after),
            Err(EquivalenceViolation::ColumnTypeChanged {
                column: "amount".to_string(),
                from: "NUMERIC".to_string(),
                to: "FLOAT64".to_string(),
            })
        );
    }

    #[test]
    fn test_garbage_rewrite_is_unrecognized() {
        assert_eq!(
            check("I could not optimize this query."),
            Err(EquivalenceViolation::UnrecognizedStructure { which: "rewritten" })
        );
    }

    #[test]
    fn test_implicit_alias() {
        let shape = QueryShape::parse("SELECT COUNT(*) n, user_email FROM t").unwrap();
        assert_eq!(
            shape.columns,
            vec![OutputColumn::Named("n".to_string()), OutputColumn::Named("user_email".to_string())]
        );
    }
}
