//! Union and difference.

use crate::device::plan::DevicePlan;
use crate::query_ast::ast::{ColumnExpression, TableOperator, TableOperatorClause};
use crate::query_ast::logical::LogicalQueryPlan;

use super::{TableExpr, finish_select, nest, translate_table};

pub(crate) fn union(plan: &mut DevicePlan<'_>, left: &LogicalQueryPlan, right: &LogicalQueryPlan, distinct: bool) -> TableExpr {
    table_operator(plan, left, right, TableOperator::Union, distinct)
}

pub(crate) fn difference(plan: &mut DevicePlan<'_>, left: &LogicalQueryPlan, right: &LogicalQueryPlan) -> TableExpr {
    table_operator(plan, left, right, TableOperator::Except, true)
}

fn table_operator(
    plan: &mut DevicePlan<'_>,
    left: &LogicalQueryPlan,
    right: &LogicalQueryPlan,
    operator: TableOperator,
    distinct: bool,
) -> TableExpr {
    let mut left = translate_table(plan, left);
    let mut right = translate_table(plan, right);
    for side in [&mut left, &mut right] {
        side.statement.order_by.clear();
        side.order.clear();
    }
    if right.has_table_operators() {
        right = nest(plan, right, "right argument of a set operator contains a set operator");
    }
    finish_select(plan, &mut left);

    // The right select list follows the left's column order and aliases.
    let (left_ctx, right_ctx) = (plan.contexts.get(left.context), plan.contexts.get(right.context));
    if left_ctx.columns.len() != right_ctx.columns.len() {
        let message = format!(
            "set operator arguments have {} and {} columns",
            left_ctx.columns.len(),
            right_ctx.columns.len()
        );
        plan.unsupported(message);
        return left;
    }
    let mut columns = Vec::with_capacity(left_ctx.columns.len());
    let mut missing = Vec::new();
    for column in &left_ctx.columns {
        match right_ctx.column(&column.name) {
            Some(other) => columns.push(ColumnExpression::new(other.expression(), column.alias.clone())),
            None => missing.push(column.name.clone()),
        }
    }
    for name in missing {
        plan.unsupported(format!("column {} is missing from the right argument of the set operator", name));
    }

    let mut select = right.statement.select;
    select.columns = columns;
    left.statement.table_operators.push(TableOperatorClause { operator, distinct, select });
    left
}
