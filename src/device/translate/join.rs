//! Join translation.
//!
//! The join context stack only tracks two flat contexts per join, so trees are
//! kept left- or right-deep: when both arguments already join, the right one
//! is nested.

use crate::device::capabilities::Clause;
use crate::device::context::{ContextId, RangeVariableColumn};
use crate::device::plan::DevicePlan;
use crate::query_ast::ast::{BinaryOperator, ColumnExpression, Expression, JoinClause, JoinType, SelectExpression, SelectStatement, TableSource};
use crate::query_ast::logical::{Expr, JoinKind, LogicalQueryPlan};
use crate::scalar_types::ScalarType;

use super::scalar::translate_condition;
use super::{TableExpr, nest, translate_table, within};

/// Which arguments contribute columns to the join result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Keep {
    Both,
    Left,
}

pub(crate) fn join(
    plan: &mut DevicePlan<'_>,
    left: &LogicalQueryPlan,
    right: &LogicalQueryPlan,
    kind: JoinKind,
    condition: Option<&Expr>,
) -> TableExpr {
    let left = translate_table(plan, left);
    let right = translate_table(plan, right);
    match kind {
        JoinKind::Semi | JoinKind::Anti => semi_join(plan, left, right, kind == JoinKind::Anti, condition),
        _ => {
            let (left, right) = prepare_sides(plan, left, right, kind);
            let join_type = match kind {
                JoinKind::LeftOuter => JoinType::LeftOuter,
                JoinKind::RightOuter => JoinType::RightOuter,
                JoinKind::Cross => JoinType::Cross,
                _ => JoinType::Inner,
            };
            combine(plan, left, right, join_type, condition, Keep::Both)
        }
    }
}

/// Nests an argument whose select cannot be flattened into a join.
fn flatten_argument(plan: &mut DevicePlan<'_>, table: TableExpr, non_preserved: bool) -> TableExpr {
    let reason = {
        let ctx = plan.contexts.get(table.context);
        if table.has_table_operators() {
            Some("join argument contains a set operator")
        } else if table.is_distinct() {
            Some("join argument is distinct")
        } else if ctx.is_aggregate {
            Some("join argument is an aggregate")
        } else if table.statement.select.from.is_none() {
            Some("join argument is a selector")
        } else if non_preserved
            && (table.statement.select.where_clause.is_some() || ctx.added_columns().next().is_some() || table.has_joins())
        {
            Some("non-preserved side of an outer join has filters, computed columns or joins")
        } else {
            None
        }
    };
    match reason {
        Some(reason) => nest(plan, table, reason),
        None => table,
    }
}

fn prepare_sides(plan: &mut DevicePlan<'_>, left: TableExpr, right: TableExpr, kind: JoinKind) -> (TableExpr, TableExpr) {
    let left = flatten_argument(plan, left, kind == JoinKind::RightOuter);
    let mut right = flatten_argument(plan, right, matches!(kind, JoinKind::LeftOuter | JoinKind::Anti));
    if left.has_joins() && right.has_joins() {
        right = nest(plan, right, "both join arguments already join");
    }
    (left, right)
}

/// Columns present on both sides, in left order.
fn common_columns(plan: &DevicePlan<'_>, left: ContextId, right: ContextId) -> Vec<String> {
    let right_ctx = plan.contexts.get(right);
    plan.contexts
        .get(left)
        .columns
        .iter()
        .filter(|c| right_ctx.column(&c.name).is_some())
        .map(|c| c.name.clone())
        .collect()
}

/// Equality of the common columns, or `None` when the sides share none.
fn natural_condition(plan: &DevicePlan<'_>, left: ContextId, right: ContextId, common: &[String]) -> Option<Expression> {
    let (l, r) = (plan.contexts.get(left), plan.contexts.get(right));
    Expression::and_all(common.iter().filter_map(|name| {
        let (lc, rc) = (l.column(name)?, r.column(name)?);
        Some(Expression::binary(lc.expression(), BinaryOperator::Equal, rc.expression()))
    }))
}

fn append_disjoint(plan: &mut DevicePlan<'_>, columns: &mut Vec<RangeVariableColumn>, right: &[RangeVariableColumn]) {
    for column in right {
        if columns.iter().any(|c| c.name == column.name) {
            plan.unsupported(format!("column {} appears on both sides of the join", column.name));
        } else {
            columns.push(column.clone());
        }
    }
}

fn always_true() -> Expression {
    Expression::binary(Expression::integer(1), BinaryOperator::Equal, Expression::integer(1))
}

/// Builds the merged select of a two-way join.
fn combine(
    plan: &mut DevicePlan<'_>,
    mut left: TableExpr,
    mut right: TableExpr,
    mut join_type: JoinType,
    condition: Option<&Expr>,
    keep: Keep,
) -> TableExpr {
    let merged = plan.contexts.create(plan.contexts.current(), false, false);
    let (left_ctx, right_ctx) = (plan.contexts.get(left.context).clone(), plan.contexts.get(right.context).clone());

    // Lookup scope for the condition: every column of both sides, left first.
    {
        let ctx = plan.contexts.get_mut(merged);
        ctx.range_variables.extend(left_ctx.range_variables.iter().cloned());
        ctx.range_variables.extend(right_ctx.range_variables.iter().cloned());
        ctx.columns.extend(left_ctx.columns.iter().cloned());
        ctx.columns.extend(right_ctx.columns.iter().cloned());
        ctx.references.has_correlation = left_ctx.references.has_correlation || right_ctx.references.has_correlation;
        ctx.references.has_parameters = left_ctx.references.has_parameters || right_ctx.references.has_parameters;
        ctx.references.has_sub_select = left_ctx.references.has_sub_select || right_ctx.references.has_sub_select;
    }

    let mut columns: Vec<RangeVariableColumn> = left_ctx.columns.clone();
    let on = match (condition, join_type) {
        (_, JoinType::Cross) => {
            if keep == Keep::Both {
                append_disjoint(plan, &mut columns, &right_ctx.columns);
            }
            None
        }
        (Some(condition), _) => {
            plan.push_join_context(left.context, right.context);
            let on = within(plan, merged, Clause::Where, |plan| translate_condition(plan, condition));
            plan.pop_join_context();
            if keep == Keep::Both {
                append_disjoint(plan, &mut columns, &right_ctx.columns);
            }
            Some(on)
        }
        (None, _) => {
            let common = common_columns(plan, left.context, right.context);
            if keep == Keep::Both {
                if join_type == JoinType::RightOuter {
                    // The preserved side supplies the key columns.
                    for column in columns.iter_mut() {
                        if let Some(preserved) = right_ctx.column(&column.name) {
                            *column = preserved.clone();
                        }
                    }
                }
                columns.extend(right_ctx.columns.iter().filter(|c| !common.contains(&c.name)).cloned());
            }
            match natural_condition(plan, left.context, right.context, &common) {
                Some(on) => Some(on),
                None if join_type == JoinType::Inner => {
                    join_type = JoinType::Cross;
                    None
                }
                None => Some(always_true()),
            }
        }
    };

    let profile = plan.profile;
    let ctx = plan.contexts.get_mut(merged);
    ctx.columns.clear();
    for mut column in columns {
        column.alias = profile.shorten_identifier(&column.name, &ctx.aliases());
        ctx.add_column(column);
    }

    let (Some(left_from), Some(right_from)) = (left.statement.select.from.take(), right.statement.select.from.take()) else {
        plan.unsupported("join argument has no from clause");
        return TableExpr { statement: SelectStatement::default(), context: merged, order: Vec::new() };
    };
    let where_clause = Expression::and_all(
        [left.statement.select.where_clause.take(), right.statement.select.where_clause.take()].into_iter().flatten(),
    );
    let select = SelectExpression {
        distinct: keep == Keep::Left,
        from: Some(TableSource::Join(Box::new(JoinClause { left: left_from, right: right_from, join_type, on }))),
        where_clause,
        ..Default::default()
    };
    TableExpr { statement: SelectStatement::new(select), context: merged, order: Vec::new() }
}

fn semi_join(
    plan: &mut DevicePlan<'_>,
    left: TableExpr,
    right: TableExpr,
    anti: bool,
    condition: Option<&Expr>,
) -> TableExpr {
    if !plan.profile.supports_sub_select_in_where_clause {
        return semi_join_as_join(plan, left, right, anti, condition);
    }
    let mut left = if left.has_table_operators() || plan.contexts.get(left.context).is_aggregate {
        nest(plan, left, "restriction of a set operator or aggregate by a semi join")
    } else {
        left
    };
    let right = flatten_argument(plan, right, false);

    // The subquery runs in a scope that sees the right argument first, then the left.
    let lookup = plan.contexts.create(Some(left.context), false, true);
    {
        let right_ctx = plan.contexts.get(right.context).clone();
        let ctx = plan.contexts.get_mut(lookup);
        ctx.range_variables = right_ctx.range_variables;
        ctx.columns = right_ctx.columns;
    }
    let on = match condition {
        Some(condition) => {
            plan.push_join_context(left.context, right.context);
            plan.contexts.enter(left.context);
            let on = within(plan, lookup, Clause::Where, |plan| translate_condition(plan, condition));
            plan.contexts.pop();
            plan.pop_join_context();
            Some(on)
        }
        None => {
            let common = common_columns(plan, left.context, right.context);
            natural_condition(plan, left.context, right.context, &common)
        }
    };
    let mut matching = right.statement;
    matching.order_by.clear();
    matching.select.columns = vec![ColumnExpression::new(Expression::integer(1), "matched")];
    matching.select.where_clause = Expression::and_all([matching.select.where_clause.take(), on].into_iter().flatten());
    let exists = Expression::Exists(Box::new(matching));
    let predicate = if anti { Expression::not(exists) } else { exists };
    let select = &mut left.statement.select;
    select.where_clause = Some(match select.where_clause.take() {
        Some(existing) => Expression::and(existing, predicate),
        None => predicate,
    });
    plan.contexts.get_mut(left.context).references.has_sub_select = true;
    left.order.clear();
    left.statement.order_by.clear();
    left
}

/// Semi join as a distinct inner join, anti join as an outer join filtered to unmatched rows.
fn semi_join_as_join(
    plan: &mut DevicePlan<'_>,
    left: TableExpr,
    right: TableExpr,
    anti: bool,
    condition: Option<&Expr>,
) -> TableExpr {
    if !anti {
        plan.info("semi join translated as a distinct inner join");
        let (left, right) = prepare_sides(plan, left, right, JoinKind::Inner);
        return combine(plan, left, right, JoinType::Inner, condition, Keep::Left);
    }
    plan.info("anti join translated as an outer join with a null marker");
    let (left, mut right) = prepare_sides(plan, left, right, JoinKind::Anti);
    let marker_name = {
        let mut taken = plan.contexts.get(right.context).column_names();
        taken.extend(plan.contexts.get(left.context).column_names());
        plan.profile.shorten_identifier("matched", &taken)
    };
    plan.contexts
        .get_mut(right.context)
        .add_column(RangeVariableColumn::computed(marker_name.clone(), Expression::integer(1), ScalarType::Integer));
    right = nest(plan, right, "anti join marker column");
    let marker = plan.contexts.get(right.context).column(&marker_name).map(RangeVariableColumn::expression);
    let mut joined = combine(plan, left, right, JoinType::LeftOuter, condition, Keep::Left);
    joined.statement.select.distinct = false;
    if let Some(marker) = marker {
        let select = &mut joined.statement.select;
        let test = Expression::is_null(marker);
        select.where_clause = Some(match select.where_clause.take() {
            Some(existing) => Expression::and(existing, test),
            None => test,
        });
    }
    joined
}
