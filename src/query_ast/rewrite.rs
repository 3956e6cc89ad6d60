//! Rewrites applied to already translated selects at run time: the keyset
//! restriction used to resume a scan, and the single-column fetch behind a
//! deferred stream.

use super::ast::{
    BinaryOperator, ColumnExpression, Expression, NullsPlacement, SelectExpression, SelectStatement, TableSource,
};
use super::errors::RewriteError;

/// A sort key of the statement being restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyColumn {
    /// Position in the select list.
    pub index: usize,
    pub ascending: bool,
    /// Where NULL falls in the scan, when known.
    pub nulls: Option<NullsPlacement>,
}

const NESTED_ALIAS: &str = "K";

/// Selects `*` from `statement` as a derived table so a predicate can be added
/// above its table operators. Ordering moves to the outer select.
pub fn nest_select(statement: &SelectStatement) -> SelectStatement {
    let mut inner = statement.clone();
    let order_by = std::mem::take(&mut inner.order_by);
    let columns = inner
        .select
        .columns
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let name = c
                .alias
                .clone()
                .or_else(|| c.expression.as_column().map(|q| q.name.clone()))
                .unwrap_or_else(|| format!("C{}", i + 1));
            ColumnExpression::new(Expression::column(Some(NESTED_ALIAS), name.clone()), name)
        })
        .collect();
    let select = SelectExpression {
        columns,
        from: Some(TableSource::Derived { query: Box::new(inner), alias: NESTED_ALIAS.to_string() }),
        ..Default::default()
    };
    SelectStatement { select, table_operators: Vec::new(), order_by }
}

fn key_expression(select: &SelectExpression, index: usize) -> Result<Expression, RewriteError> {
    select.columns.get(index).map(|c| c.expression.clone()).ok_or(RewriteError::KeyOutOfRange(index))
}

/// `k = v`, treating two NULLs as equal.
pub fn null_safe_equal(key: Expression, value: Expression) -> Expression {
    Expression::or(
        Expression::binary(key.clone(), BinaryOperator::Equal, value.clone()),
        Expression::and(Expression::is_null(key), Expression::is_null(value)),
    )
}

/// Rows whose key moved from NULL to a value (or back) in scan order.
fn null_transition(key: &Expression, value: &Expression, nulls: Option<NullsPlacement>) -> Option<Expression> {
    match nulls? {
        NullsPlacement::First => Some(Expression::and(Expression::is_null(value.clone()), Expression::is_not_null(key.clone()))),
        NullsPlacement::Last => Some(Expression::and(Expression::is_not_null(value.clone()), Expression::is_null(key.clone()))),
    }
}

fn past(key: &Expression, value: &Expression, column: &KeyColumn, inclusive: bool) -> Expression {
    let op = match (column.ascending, inclusive) {
        (true, false) => BinaryOperator::Greater,
        (true, true) => BinaryOperator::GreaterOrEqual,
        (false, false) => BinaryOperator::Less,
        (false, true) => BinaryOperator::LessOrEqual,
    };
    let compare = Expression::binary(key.clone(), op, value.clone());
    let mut terms = Vec::with_capacity(3);
    if inclusive {
        terms.push(Expression::and(Expression::is_null(key.clone()), Expression::is_null(value.clone())));
    }
    terms.push(compare);
    terms.extend(null_transition(key, value, column.nulls));
    Expression::or_all(terms).unwrap_or_else(Expression::null)
}

/// Predicate selecting the rows at or after the key `values` in scan order.
///
/// Keys are in priority order. Term `i` requires every higher-priority key to
/// equal its value and key `i` to be past its value; only the last key is
/// compared inclusively, so the boundary row itself is delivered again.
pub fn keyset_predicate(keys: &[Expression], columns: &[KeyColumn], values: &[Expression]) -> Option<Expression> {
    let last = keys.len().checked_sub(1)?;
    let terms = (0..keys.len()).map(|i| {
        let equal_prefix = (0..i).map(|j| null_safe_equal(keys[j].clone(), values[j].clone()));
        let head = past(&keys[i], &values[i], &columns[i], i == last);
        Expression::and_all(equal_prefix.chain(std::iter::once(head))).unwrap_or_else(Expression::null)
    });
    Expression::or_all(terms)
}

/// Returns `statement` restricted to the rows at or after `values`.
///
/// The predicate lands in HAVING when `is_aggregate`, in WHERE otherwise, and
/// in the WHERE of a wrapping select when the statement has table operators.
pub fn restrict_past_key(
    statement: &SelectStatement,
    is_aggregate: bool,
    columns: &[KeyColumn],
    values: &[Expression],
) -> Result<SelectStatement, RewriteError> {
    if columns.is_empty() {
        return Err(RewriteError::NoKey);
    }
    if columns.len() != values.len() {
        return Err(RewriteError::KeyOutOfRange(values.len()));
    }
    let (mut restricted, is_aggregate) = if statement.has_table_operators() {
        (nest_select(statement), false)
    } else {
        (statement.clone(), is_aggregate)
    };
    let keys = columns
        .iter()
        .map(|c| key_expression(&restricted.select, c.index))
        .collect::<Result<Vec<_>, _>>()?;
    let Some(predicate) = keyset_predicate(&keys, columns, values) else {
        return Err(RewriteError::NoKey);
    };
    let target = if is_aggregate { &mut restricted.select.having } else { &mut restricted.select.where_clause };
    *target = Some(match target.take() {
        Some(existing) => Expression::and(existing, predicate),
        None => predicate,
    });
    Ok(restricted)
}

/// Single-row select of `column` for the row identified by `values`.
pub fn deferred_fetch(
    statement: &SelectStatement,
    is_aggregate: bool,
    column: usize,
    keys: &[KeyColumn],
    values: &[Expression],
) -> Result<SelectStatement, RewriteError> {
    if keys.is_empty() {
        return Err(RewriteError::NoKey);
    }
    let (mut fetch, is_aggregate) = if statement.has_table_operators() {
        (nest_select(statement), false)
    } else {
        (statement.clone(), is_aggregate)
    };
    let selected = fetch.select.columns.get(column).cloned().ok_or(RewriteError::KeyOutOfRange(column))?;
    let mut terms = Vec::with_capacity(keys.len());
    for (key, value) in keys.iter().zip(values) {
        terms.push(null_safe_equal(key_expression(&fetch.select, key.index)?, value.clone()));
    }
    let predicate = Expression::and_all(terms).ok_or(RewriteError::NoKey)?;
    let target = if is_aggregate { &mut fetch.select.having } else { &mut fetch.select.where_clause };
    *target = Some(match target.take() {
        Some(existing) => Expression::and(existing, predicate),
        None => predicate,
    });
    fetch.select.columns = vec![selected];
    fetch.order_by.clear();
    Ok(fetch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_ast::ast::{Statement, TableName, TableOperator, TableOperatorClause};
    use crate::query_ast::emitter::dialect::GenericDialect;
    use crate::query_ast::emitter::emit_statement;

    fn select_ids() -> SelectStatement {
        SelectStatement::new(SelectExpression {
            columns: vec![ColumnExpression::new(Expression::column(Some("T1"), "ID"), "ID")],
            from: Some(TableSource::Table { name: TableName::new("Items"), alias: Some("T1".into()) }),
            ..Default::default()
        })
    }

    fn render(statement: SelectStatement) -> String {
        emit_statement(&Statement::Select(statement), &GenericDialect).unwrap().text
    }

    #[test]
    fn single_key_is_inclusive_and_null_safe() {
        let key = KeyColumn { index: 0, ascending: true, nulls: None };
        let restricted = restrict_past_key(&select_ids(), false, &[key], &[Expression::parameter("p")]).unwrap();
        assert_eq!(
            render(restricted),
            "SELECT T1.ID FROM Items T1 WHERE (T1.ID IS NULL AND :p IS NULL) OR T1.ID >= :p"
        );
    }

    #[test]
    fn two_keys_compare_the_lower_one_only_on_ties() {
        let mut statement = select_ids();
        statement.select.columns.push(ColumnExpression::new(Expression::column(Some("T1"), "Seq"), "Seq"));
        let keys = [
            KeyColumn { index: 0, ascending: true, nulls: None },
            KeyColumn { index: 1, ascending: false, nulls: None },
        ];
        let values = [Expression::parameter("a"), Expression::parameter("b")];
        let sql = render(restrict_past_key(&statement, false, &keys, &values).unwrap());
        assert!(sql.contains("T1.ID > :a OR"), "{}", sql);
        assert!(sql.contains("T1.Seq <= :b"), "{}", sql);
    }

    #[test]
    fn null_transition_is_added_when_placement_is_known() {
        let key = KeyColumn { index: 0, ascending: true, nulls: Some(NullsPlacement::First) };
        let sql = render(restrict_past_key(&select_ids(), false, &[key], &[Expression::parameter("p")]).unwrap());
        assert!(sql.ends_with("OR (:p IS NULL AND T1.ID IS NOT NULL)"), "{}", sql);
    }

    #[test]
    fn aggregates_are_restricted_in_having() {
        let mut statement = select_ids();
        statement.select.group_by.push(Expression::column(Some("T1"), "ID"));
        let key = KeyColumn { index: 0, ascending: true, nulls: None };
        let restricted = restrict_past_key(&statement, true, &[key], &[Expression::integer(3)]).unwrap();
        assert!(restricted.select.where_clause.is_none());
        assert!(restricted.select.having.is_some());
    }

    #[test]
    fn table_operators_are_wrapped_before_restricting() {
        let mut statement = select_ids();
        let branch = select_ids().select;
        statement.table_operators.push(TableOperatorClause { operator: TableOperator::Union, distinct: true, select: branch });
        statement.order_by.push(crate::query_ast::ast::OrderColumn {
            expression: Expression::column(None, "ID"),
            ascending: true,
            nulls: None,
        });
        let key = KeyColumn { index: 0, ascending: true, nulls: None };
        let sql = render(restrict_past_key(&statement, false, &[key], &[Expression::integer(7)]).unwrap());
        assert!(sql.starts_with("SELECT K.ID FROM (SELECT T1.ID FROM Items T1 UNION SELECT"), "{}", sql);
        assert!(sql.ends_with("WHERE (K.ID IS NULL AND 7 IS NULL) OR K.ID >= 7 ORDER BY ID ASC"), "{}", sql);
    }

    #[test]
    fn restart_without_keys_is_rejected() {
        assert!(matches!(restrict_past_key(&select_ids(), false, &[], &[]), Err(RewriteError::NoKey)));
    }

    #[test]
    fn deferred_fetch_selects_one_column_by_key() {
        let mut statement = select_ids();
        statement.select.columns.push(ColumnExpression::new(Expression::column(Some("T1"), "Body"), "Body"));
        let key = KeyColumn { index: 0, ascending: true, nulls: None };
        let fetch = deferred_fetch(&statement, false, 1, &[key], &[Expression::integer(5)]).unwrap();
        assert_eq!(
            render(fetch),
            "SELECT T1.Body FROM Items T1 WHERE T1.ID = 5 OR (T1.ID IS NULL AND 5 IS NULL)"
        );
    }
}
