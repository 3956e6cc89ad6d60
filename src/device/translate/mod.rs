//! Plan-to-SQL translation.
//!
//! One `match` over the plan node kind dispatches to the per-operator rules in
//! the submodules. Every rule threads the `DevicePlan` explicitly; failures are
//! recorded on it and translation keeps going so all diagnostics surface at once.

mod join;
mod relational;
mod scalar;
mod set_ops;
mod statements;

use crate::query_ast::ast::{ColumnExpression, NullsPlacement, SelectExpression, SelectStatement, Statement, TableSource};
use crate::query_ast::errors::QueryAstError;
use crate::query_ast::logical::{LogicalQueryPlan, ResultKind, SortColumn};

use super::capabilities::Clause;
use super::context::{ContextId, RangeVariable, RangeVariableColumn};
use super::plan::{DevicePlan, NodeStatus, OrderKey, ResultColumn, TranslatedStatement};

/// Sort request carried alongside a table expression until the final select list is known.
#[derive(Debug, Clone)]
pub(crate) struct SortSpec {
    pub column: SortColumn,
    /// Effective NULL placement in the scan.
    pub nulls: Option<NullsPlacement>,
}

/// A translated table-valued node: its select and the context describing its columns.
#[derive(Debug, Clone)]
pub(crate) struct TableExpr {
    pub statement: SelectStatement,
    pub context: ContextId,
    pub order: Vec<SortSpec>,
}

impl TableExpr {
    pub fn has_table_operators(&self) -> bool {
        self.statement.has_table_operators()
    }

    pub fn is_distinct(&self) -> bool {
        self.statement.select.distinct
    }

    pub fn has_joins(&self) -> bool {
        self.statement.select.has_joins()
    }
}

/// Translates a whole plan into a statement ready for emission.
pub fn translate_plan(mut plan: DevicePlan<'_>, node: &LogicalQueryPlan) -> Result<TranslatedStatement, QueryAstError> {
    let kind = node.result_kind();
    plan.begin_node();
    let translated = match kind {
        ResultKind::Table | ResultKind::Row => {
            let mut table = translate_table(&mut plan, node);
            finish_select(&plan, &mut table);
            let ctx = plan.contexts.get(table.context);
            let columns = ctx
                .columns
                .iter()
                .map(|c| ResultColumn {
                    name: c.name.clone(),
                    alias: c.alias.clone(),
                    ty: c.ty,
                    deferred: plan.type_maps.is_large_object(c.ty),
                })
                .collect::<Vec<_>>();
            let mut order = Vec::with_capacity(table.order.len());
            for spec in &table.order {
                // Keys past a projected-away column cannot drive a restart.
                let Some(index) = columns.iter().position(|c| c.name == spec.column.name) else { break };
                order.push(OrderKey {
                    name: spec.column.name.clone(),
                    index,
                    ascending: spec.column.ascending,
                    nulls: spec.nulls,
                    ty: columns[index].ty,
                });
            }
            let is_aggregate = ctx.is_aggregate;
            (Statement::Select(table.statement), columns, order, is_aggregate)
        }
        ResultKind::Statement => (statements::translate_statement(&mut plan, node), Vec::new(), Vec::new(), false),
        ResultKind::Scalar => {
            plan.unsupported(format!("{} cannot be translated as a statement", node.kind_name()));
            (Statement::Select(SelectStatement::default()), Vec::new(), Vec::new(), false)
        }
    };
    let status = plan.end_node();
    let (statement, columns, order, is_aggregate) = translated;
    plan.finish(statement, kind, columns, order, is_aggregate, status)
}

/// Dispatches a table-valued node.
pub(crate) fn translate_table(plan: &mut DevicePlan<'_>, node: &LogicalQueryPlan) -> TableExpr {
    plan.begin_node();
    let table = match node {
        LogicalQueryPlan::Retrieve { table } => relational::retrieve(plan, table),
        LogicalQueryPlan::Restrict { source, condition } => relational::restrict(plan, source, condition),
        LogicalQueryPlan::Project { source, columns, distinct } => relational::project(plan, source, columns, *distinct),
        LogicalQueryPlan::Extend { source, columns } => relational::extend(plan, source, columns),
        LogicalQueryPlan::Rename { source, columns } => relational::rename(plan, source, columns),
        LogicalQueryPlan::Aggregate { source, group_by, columns } => relational::aggregate(plan, source, group_by, columns),
        LogicalQueryPlan::Order { source, columns } => relational::order(plan, source, columns),
        LogicalQueryPlan::TableSelector { columns, rows } => relational::table_selector(plan, columns, rows),
        LogicalQueryPlan::RowSelector { columns } => relational::row_selector(plan, columns),
        LogicalQueryPlan::Join { left, right, kind, condition } => join::join(plan, left, right, *kind, condition.as_ref()),
        LogicalQueryPlan::Union { left, right, distinct } => set_ops::union(plan, left, right, *distinct),
        LogicalQueryPlan::Difference { left, right } => set_ops::difference(plan, left, right),
        other => {
            plan.unsupported(format!("{} is not table-valued", other.kind_name()));
            empty_table(plan)
        }
    };
    if plan.end_node() == NodeStatus::Unsupported {
        log::debug!("translate: {} left unsupported", node.kind_name());
    }
    table
}

/// Placeholder result used after an unsupported node so translation can continue.
pub(crate) fn empty_table(plan: &mut DevicePlan<'_>) -> TableExpr {
    let context = plan.contexts.create(plan.contexts.current(), false, false);
    TableExpr { statement: SelectStatement::default(), context, order: Vec::new() }
}

/// Rebuilds the select list from the context bindings.
pub(crate) fn finish_select(plan: &DevicePlan<'_>, table: &mut TableExpr) {
    let ctx = plan.contexts.get(table.context);
    table.statement.select.columns =
        ctx.columns.iter().map(|c| ColumnExpression::new(c.expression(), c.alias.clone())).collect();
}

/// Wraps `table` as a derived table in a fresh select, keeping its ordering.
/// Records `reason`.
pub(crate) fn nest(plan: &mut DevicePlan<'_>, mut table: TableExpr, reason: &str) -> TableExpr {
    if !plan.profile.supports_nested_from {
        plan.unsupported(format!("nested from clause required ({}) but not supported", reason));
        return table;
    }
    plan.info(format!("nested from: {}", reason));
    let inner = plan.contexts.get(table.context).clone();
    if inner.references.has_correlation && !plan.profile.supports_nested_correlation {
        plan.unsupported("correlated reference inside a nested from clause");
    }
    finish_select(plan, &mut table);
    table.statement.order_by.clear();
    let order: Vec<SortColumn> = table.order.iter().map(|s| s.column.clone()).collect();

    let alias = plan.next_table_alias();
    let outer = plan.contexts.create(inner.parent, false, false);
    plan.contexts.reparent_nested(table.context, outer);
    let ctx = plan.contexts.get_mut(outer);
    ctx.range_variables.push(RangeVariable { alias: alias.clone(), columns: inner.aliases() });
    for column in &inner.columns {
        let mut binding = RangeVariableColumn::reference(column.name.clone(), &alias, &column.alias, column.ty);
        binding.alias = column.alias.clone();
        ctx.add_column(binding);
    }
    ctx.references.has_correlation = inner.references.has_correlation;
    ctx.references.has_parameters = inner.references.has_parameters;

    let select = SelectExpression {
        from: Some(TableSource::Derived { query: Box::new(table.statement), alias }),
        ..Default::default()
    };
    let mut nested = TableExpr { statement: SelectStatement::new(select), context: outer, order: Vec::new() };
    if !order.is_empty() {
        nested = relational::apply_order(plan, nested, &order);
    }
    nested
}

/// Runs `f` with `context` entered and its current clause set to `clause`.
pub(crate) fn within<'a, R>(
    plan: &mut DevicePlan<'a>,
    context: ContextId,
    clause: Clause,
    f: impl FnOnce(&mut DevicePlan<'a>) -> R,
) -> R {
    plan.contexts.enter(context);
    let previous = std::mem::replace(&mut plan.contexts.get_mut(context).clause, clause);
    let result = f(plan);
    plan.contexts.get_mut(context).clause = previous;
    plan.contexts.pop();
    result
}
