//! Single-source relational operators: retrieve, restrict, project, extend,
//! rename, aggregate, order and the row/table selectors.

use crate::device::capabilities::Clause;
use crate::device::context::{ContextId, RangeVariable, RangeVariableColumn};
use crate::device::plan::DevicePlan;
use crate::query_ast::ast::{
    BinaryOperator, ColumnExpression, Expression, NullsPlacement, OrderColumn, SelectExpression, SelectStatement,
    TableName, TableOperator, TableOperatorClause, TableSource,
};
use crate::query_ast::logical::{AggregateColumn, ColumnDef, Expr, LogicalQueryPlan, NamedExpr, RenameColumn, SortColumn, TableVar};
use crate::scalar_types::ScalarType;

use super::scalar::{translate_condition, translate_value};
use super::{SortSpec, TableExpr, nest, translate_table, within};

fn shortened_alias(plan: &DevicePlan<'_>, context: ContextId, name: &str) -> String {
    plan.profile.shorten_identifier(name, &plan.contexts.get(context).aliases())
}

pub(crate) fn retrieve(plan: &mut DevicePlan<'_>, table: &TableVar) -> TableExpr {
    let alias = plan.next_table_alias();
    let profile = plan.profile;
    let context = plan.contexts.create(plan.contexts.current(), false, false);
    let ctx = plan.contexts.get_mut(context);
    ctx.range_variables.push(RangeVariable {
        alias: alias.clone(),
        columns: table.columns.iter().map(|c| c.name.clone()).collect(),
    });
    for column in &table.columns {
        let mut binding = RangeVariableColumn::reference(column.name.clone(), &alias, &column.name, column.ty);
        binding.alias = profile.shorten_identifier(&column.name, &ctx.aliases());
        ctx.add_column(binding);
    }
    let select = SelectExpression {
        from: Some(TableSource::Table {
            name: TableName { schema: table.schema.clone(), name: table.name.clone() },
            alias: Some(alias),
        }),
        ..Default::default()
    };
    TableExpr { statement: SelectStatement::new(select), context, order: Vec::new() }
}

fn references_sub_select_column(plan: &DevicePlan<'_>, context: ContextId, condition: &Expr) -> bool {
    let ctx = plan.contexts.get(context);
    condition.column_references().iter().any(|name| ctx.column(name).is_some_and(|c| c.has_sub_select()))
}

pub(crate) fn restrict(plan: &mut DevicePlan<'_>, source: &LogicalQueryPlan, condition: &Expr) -> TableExpr {
    let mut table = translate_table(plan, source);
    if table.has_table_operators() {
        table = nest(plan, table, "restriction of a set operator");
    }
    let clause = if plan.contexts.get(table.context).is_aggregate { Clause::Having } else { Clause::Where };
    if !plan.profile.allows_sub_select_in(clause) && references_sub_select_column(plan, table.context, condition) {
        table = nest(plan, table, &format!("computed sub-select referenced in {} clause", clause.name()));
    }
    let clause = if plan.contexts.get(table.context).is_aggregate { Clause::Having } else { Clause::Where };
    let predicate = within(plan, table.context, clause, |plan| translate_condition(plan, condition));
    let select = &mut table.statement.select;
    let target = if clause == Clause::Having { &mut select.having } else { &mut select.where_clause };
    *target = Some(match target.take() {
        Some(existing) => Expression::and(existing, predicate),
        None => predicate,
    });
    table
}

pub(crate) fn project(plan: &mut DevicePlan<'_>, source: &LogicalQueryPlan, columns: &[String], distinct: bool) -> TableExpr {
    let mut table = translate_table(plan, source);
    if table.has_table_operators() {
        table = nest(plan, table, "projection of a set operator");
    } else if table.is_distinct() && columns.len() < plan.contexts.get(table.context).columns.len() {
        table = nest(plan, table, "projection of a distinct select");
    }
    let known = plan.contexts.get(table.context).column_names();
    for name in columns.iter().filter(|c| !known.contains(c)) {
        plan.unsupported(format!("unknown column {}", name));
    }
    plan.contexts.get_mut(table.context).project_columns(columns);
    if distinct {
        table.statement.select.distinct = true;
    }
    if !table.order.is_empty() {
        let remaining: Vec<SortColumn> = table
            .order
            .iter()
            .map(|s| s.column.clone())
            .take_while(|c| columns.contains(&c.name))
            .collect();
        if remaining.len() != table.order.len() {
            table = apply_order(plan, table, &remaining);
        }
    }
    table
}

pub(crate) fn extend(plan: &mut DevicePlan<'_>, source: &LogicalQueryPlan, columns: &[NamedExpr]) -> TableExpr {
    let mut table = translate_table(plan, source);
    if table.has_table_operators() {
        table = nest(plan, table, "extension of a set operator");
    } else if table.is_distinct() {
        table = nest(plan, table, "distinct select with added columns");
    }
    let context = table.context;
    within(plan, context, Clause::Select, |plan| {
        for column in columns {
            let (expression, ty) = translate_value(plan, &column.expr);
            let mut binding = RangeVariableColumn::computed(column.name.clone(), expression, ty);
            binding.alias = shortened_alias(plan, context, &column.name);
            plan.contexts.get_mut(context).add_column(binding);
        }
    });
    table
}

pub(crate) fn rename(plan: &mut DevicePlan<'_>, source: &LogicalQueryPlan, renames: &[RenameColumn]) -> TableExpr {
    let mut table = translate_table(plan, source);
    if table.has_table_operators() {
        table = nest(plan, table, "rename of a set operator");
    }
    let names = plan.contexts.get(table.context).column_names();
    let mut positions = Vec::with_capacity(renames.len());
    for r in renames {
        match names.iter().position(|n| *n == r.from) {
            Some(index) => positions.push((index, r)),
            None => {
                plan.unsupported(format!("unknown column {}", r.from));
                return table;
            }
        }
    }
    // Detach everything first so cyclic renames (A -> B, B -> A) never collide.
    positions.sort_by_key(|(index, _)| std::cmp::Reverse(*index));
    let mut detached = Vec::with_capacity(positions.len());
    for (index, r) in positions {
        if let Some((_, column)) = plan.contexts.get_mut(table.context).rename(&r.from) {
            detached.push((index, r, column));
        }
    }
    detached.sort_by_key(|(index, _, _)| *index);
    for (index, r, mut column) in detached {
        column.name = r.to.clone();
        column.alias = shortened_alias(plan, table.context, &r.to);
        let ctx = plan.contexts.get_mut(table.context);
        ctx.columns.insert(index.min(ctx.columns.len()), column);
    }
    for spec in &mut table.order {
        if let Some(r) = renames.iter().find(|r| r.from == spec.column.name) {
            spec.column.name = r.to.clone();
        }
    }
    table
}

fn aggregate_function(name: &str) -> Option<&'static str> {
    match name.to_ascii_lowercase().as_str() {
        "count" => Some("COUNT"),
        "sum" => Some("SUM"),
        "avg" => Some("AVG"),
        "min" => Some("MIN"),
        "max" => Some("MAX"),
        _ => None,
    }
}

pub(crate) fn aggregate(
    plan: &mut DevicePlan<'_>,
    source: &LogicalQueryPlan,
    group_by: &[String],
    columns: &[AggregateColumn],
) -> TableExpr {
    let mut table = translate_table(plan, source);
    let reason = {
        let ctx = plan.contexts.get(table.context);
        if table.has_table_operators() {
            Some("aggregate of a set operator")
        } else if ctx.is_aggregate {
            Some("aggregate of an aggregate")
        } else if table.is_distinct() {
            Some("aggregate of a distinct select")
        } else if group_by.iter().any(|g| ctx.column(g).is_some_and(|c| c.is_computed())) {
            Some("group by on a computed column")
        } else if columns
            .iter()
            .filter_map(|a| a.argument.as_deref())
            .any(|arg| ctx.column(arg).is_some_and(|c| c.has_sub_select()))
        {
            Some("aggregate argument contains a sub-select")
        } else {
            None
        }
    };
    if let Some(reason) = reason {
        table = nest(plan, table, reason);
    }

    let source_ctx = plan.contexts.get(table.context).clone();
    let mut bindings = Vec::with_capacity(group_by.len() + columns.len());
    let mut group_expressions = Vec::with_capacity(group_by.len());
    for name in group_by {
        match source_ctx.column(name) {
            Some(column) => {
                group_expressions.push(column.expression());
                bindings.push(column.clone());
            }
            None => plan.unsupported(format!("unknown grouping column {}", name)),
        }
    }
    for aggregate in columns {
        let Some(function) = aggregate_function(&aggregate.function) else {
            plan.unsupported(format!("aggregate operator '{}' is not supported by this device", aggregate.function));
            continue;
        };
        let argument = match &aggregate.argument {
            None if function == "COUNT" => Expression::Wildcard,
            None => {
                plan.unsupported(format!("aggregate {} requires an argument", aggregate.name));
                continue;
            }
            Some(arg) => match source_ctx.column(arg) {
                Some(column) => column.expression(),
                None => {
                    plan.unsupported(format!("unknown column {}", arg));
                    continue;
                }
            },
        };
        let call = Expression::Call { name: function.to_string(), args: vec![argument], distinct: aggregate.distinct };
        bindings.push(RangeVariableColumn::computed(aggregate.name.clone(), call, aggregate.ty));
    }

    let profile = plan.profile;
    let ctx = plan.contexts.get_mut(table.context);
    ctx.columns.clear();
    for mut binding in bindings {
        binding.alias = profile.shorten_identifier(&binding.name, &ctx.aliases());
        ctx.add_column(binding);
    }
    ctx.is_aggregate = true;
    ctx.references.has_aggregate = true;
    table.statement.select.group_by = group_expressions;
    table.statement.order_by.clear();
    table.order.clear();
    table
}

pub(crate) fn order(plan: &mut DevicePlan<'_>, source: &LogicalQueryPlan, columns: &[SortColumn]) -> TableExpr {
    let table = translate_table(plan, source);
    apply_order(plan, table, columns)
}

/// Replaces the ORDER BY of `table` and records the sort keys for restarts.
pub(crate) fn apply_order(plan: &mut DevicePlan<'_>, mut table: TableExpr, columns: &[SortColumn]) -> TableExpr {
    let profile = plan.profile;
    let use_alias = table.has_table_operators() || !profile.is_order_by_in_context;
    if !use_alias && !profile.supports_order_by_expressions {
        let ctx = plan.contexts.get(table.context);
        if columns.iter().any(|c| ctx.column(&c.name).is_some_and(|b| b.is_computed())) {
            table = nest(plan, table, "computed sort key");
        }
    }
    let ctx = plan.contexts.get(table.context).clone();
    let mut order_by = Vec::with_capacity(columns.len());
    let mut specs = Vec::with_capacity(columns.len());
    for sort in columns {
        let Some(binding) = ctx.column(&sort.name) else {
            plan.unsupported(format!("unknown sort column {}", sort.name));
            continue;
        };
        let key = if use_alias { Expression::column(None, binding.alias.clone()) } else { binding.expression() };
        let default_placement = profile.null_ordering.placement(sort.ascending);
        // An unknown backend placement is pinned to NULLS FIRST so restarts can
        // step past a NULL group.
        let requested = match (sort.nulls_first, default_placement) {
            (Some(first), _) => Some(if first { NullsPlacement::First } else { NullsPlacement::Last }),
            (None, Some(placement)) if profile.supports_order_by_nulls_first_last => Some(placement),
            (None, Some(_)) => None,
            (None, None) => Some(NullsPlacement::First),
        };
        let (explicit, effective) = match requested {
            Some(placement) if profile.supports_order_by_nulls_first_last => (Some(placement), Some(placement)),
            Some(placement) if profile.supports_order_by_expressions && !table.has_table_operators() => {
                let first = placement == NullsPlacement::First;
                let null_rank = Expression::Case {
                    operand: None,
                    when_then: vec![(Expression::is_null(binding.expression()), Expression::integer(0))],
                    else_result: Some(Box::new(Expression::integer(1))),
                };
                order_by.push(OrderColumn { expression: null_rank, ascending: first, nulls: None });
                (None, Some(placement))
            }
            Some(_) => {
                plan.info(format!("NULL placement of sort column {} left to the backend", sort.name));
                (None, default_placement)
            }
            None => (None, default_placement),
        };
        order_by.push(OrderColumn { expression: key, ascending: sort.ascending, nulls: explicit });
        specs.push(SortSpec { column: sort.clone(), nulls: effective });
    }
    table.statement.order_by = order_by;
    table.order = specs;
    table
}

fn selector_context(plan: &mut DevicePlan<'_>) -> ContextId {
    plan.contexts.create(plan.contexts.current(), false, false)
}

fn add_computed(plan: &mut DevicePlan<'_>, context: ContextId, name: &str, expression: Expression, ty: ScalarType) -> String {
    let alias = shortened_alias(plan, context, name);
    let mut binding = RangeVariableColumn::computed(name.to_string(), expression, ty);
    binding.alias = alias.clone();
    plan.contexts.get_mut(context).add_column(binding);
    alias
}

pub(crate) fn table_selector(plan: &mut DevicePlan<'_>, columns: &[ColumnDef], rows: &[Vec<Expr>]) -> TableExpr {
    let context = selector_context(plan);
    let mut statement = SelectStatement::default();
    if rows.is_empty() {
        for column in columns {
            let domain = match plan.type_maps.get(column.ty) {
                Ok(map) => map.domain_name().to_string(),
                Err(err) => {
                    plan.unsupported(err.to_string());
                    continue;
                }
            };
            let typed_null = Expression::Cast { operand: Box::new(Expression::null()), domain };
            add_computed(plan, context, &column.name, typed_null, column.ty);
        }
        statement.select.where_clause =
            Some(Expression::binary(Expression::integer(1), BinaryOperator::Equal, Expression::integer(0)));
        return TableExpr { statement, context, order: Vec::new() };
    }

    let mut aliases = Vec::with_capacity(columns.len());
    for (index, row) in rows.iter().enumerate() {
        if row.len() != columns.len() {
            plan.unsupported(format!("row {} of the table selector has {} values, expected {}", index, row.len(), columns.len()));
            continue;
        }
        let values: Vec<Expression> =
            within(plan, context, Clause::Select, |plan| row.iter().map(|e| translate_value(plan, e).0).collect());
        if aliases.is_empty() {
            for (column, value) in columns.iter().zip(values) {
                aliases.push(add_computed(plan, context, &column.name, value, column.ty));
            }
        } else {
            let select = SelectExpression {
                columns: values.into_iter().zip(&aliases).map(|(v, a)| ColumnExpression::new(v, a.clone())).collect(),
                ..Default::default()
            };
            statement.table_operators.push(TableOperatorClause { operator: TableOperator::Union, distinct: false, select });
        }
    }
    TableExpr { statement, context, order: Vec::new() }
}

pub(crate) fn row_selector(plan: &mut DevicePlan<'_>, columns: &[NamedExpr]) -> TableExpr {
    let context = selector_context(plan);
    for column in columns {
        let (expression, ty) = within(plan, context, Clause::Select, |plan| translate_value(plan, &column.expr));
        add_computed(plan, context, &column.name, expression, ty);
    }
    TableExpr { statement: SelectStatement::default(), context, order: Vec::new() }
}
