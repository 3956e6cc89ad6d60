//! Data modification and definition statements.

use crate::device::capabilities::Clause;
use crate::device::context::{ColumnSource, ContextId, RangeVariableColumn};
use crate::device::plan::DevicePlan;
use crate::query_ast::ast::{
    AlterAction, AlterTableStatement, ColumnDefinition, CreateTableStatement, DeleteStatement, DropTableStatement,
    Expression, InsertSource, InsertStatement, QualifiedColumn, SelectStatement, Statement, TableName, UpdateStatement,
};
use crate::query_ast::logical::{ColumnDef, Expr, LogicalQueryPlan, TableVar};

use super::scalar::{translate_condition, translate_value};
use super::{finish_select, translate_table, within};

pub(crate) fn translate_statement(plan: &mut DevicePlan<'_>, node: &LogicalQueryPlan) -> Statement {
    match node {
        LogicalQueryPlan::Insert { target, source } => insert(plan, target, source),
        LogicalQueryPlan::Update { target, assignments, condition } => {
            let context = target_context(plan, target);
            let mut translated = Vec::with_capacity(assignments.len());
            for assignment in assignments {
                if target.column(&assignment.name).is_none() {
                    plan.unsupported(format!("unknown column {} in update of {}", assignment.name, target.name));
                    continue;
                }
                let (value, _) = within(plan, context, Clause::Select, |plan| translate_value(plan, &assignment.expr));
                translated.push((assignment.name.clone(), value));
            }
            let where_clause = condition.as_ref().map(|c| restriction(plan, context, c));
            Statement::Update(UpdateStatement { table: table_name(target), assignments: translated, where_clause })
        }
        LogicalQueryPlan::Delete { target, condition } => {
            let context = target_context(plan, target);
            let where_clause = condition.as_ref().map(|c| restriction(plan, context, c));
            Statement::Delete(DeleteStatement { table: table_name(target), where_clause })
        }
        LogicalQueryPlan::CreateTable { table } => {
            let columns = table.columns.iter().filter_map(|c| column_definition(plan, c)).collect();
            let primary_key = table.primary_key().map(|k| k.columns.clone()).unwrap_or_default();
            Statement::CreateTable(CreateTableStatement { table: table_name(table), columns, primary_key })
        }
        LogicalQueryPlan::AlterTable { table, add, drop } => {
            let mut actions: Vec<AlterAction> =
                add.iter().filter_map(|c| column_definition(plan, c)).map(AlterAction::AddColumn).collect();
            actions.extend(drop.iter().cloned().map(AlterAction::DropColumn));
            if actions.is_empty() {
                plan.unsupported(format!("alter table {} has nothing to change", table.name));
            }
            Statement::AlterTable(AlterTableStatement { table: table_name(table), actions })
        }
        LogicalQueryPlan::DropTable { table } => Statement::DropTable(DropTableStatement { table: table_name(table) }),
        other => {
            plan.unsupported(format!("{} is not a statement", other.kind_name()));
            Statement::Select(SelectStatement::default())
        }
    }
}

fn table_name(table: &TableVar) -> TableName {
    TableName { schema: table.schema.clone(), name: table.name.clone() }
}

fn column_definition(plan: &mut DevicePlan<'_>, column: &ColumnDef) -> Option<ColumnDefinition> {
    match plan.type_maps.get(column.ty) {
        Ok(map) => Some(ColumnDefinition { name: column.name.clone(), domain: map.domain_name().to_string(), nullable: column.nullable }),
        Err(err) => {
            plan.unsupported(err.to_string());
            None
        }
    }
}

/// Scope of an UPDATE or DELETE: the target's columns, unqualified.
fn target_context(plan: &mut DevicePlan<'_>, target: &TableVar) -> ContextId {
    let context = plan.contexts.create(plan.contexts.current(), false, false);
    let ctx = plan.contexts.get_mut(context);
    for column in &target.columns {
        ctx.add_column(RangeVariableColumn {
            name: column.name.clone(),
            source: ColumnSource::Reference(QualifiedColumn { table: None, name: column.name.clone() }),
            alias: column.name.clone(),
            ty: column.ty,
        });
    }
    context
}

fn restriction(plan: &mut DevicePlan<'_>, context: ContextId, condition: &Expr) -> Expression {
    within(plan, context, Clause::Where, |plan| translate_condition(plan, condition))
}

fn insert(plan: &mut DevicePlan<'_>, target: &TableVar, source: &LogicalQueryPlan) -> Statement {
    let values = match source {
        LogicalQueryPlan::TableSelector { columns, rows } if plan.profile.uses_values_clause_in_insert && !rows.is_empty() => {
            Some((columns.iter().map(|c| c.name.clone()).collect::<Vec<_>>(), rows.clone()))
        }
        LogicalQueryPlan::RowSelector { columns } if plan.profile.uses_values_clause_in_insert => Some((
            columns.iter().map(|c| c.name.clone()).collect(),
            vec![columns.iter().map(|c| c.expr.clone()).collect()],
        )),
        _ => None,
    };

    let (columns, source) = match values {
        Some((columns, rows)) => {
            let context = plan.contexts.create(plan.contexts.current(), false, false);
            let mut translated = Vec::with_capacity(rows.len());
            for (index, row) in rows.iter().enumerate() {
                if row.len() != columns.len() {
                    plan.unsupported(format!("row {} of the insert has {} values, expected {}", index, row.len(), columns.len()));
                    continue;
                }
                translated.push(within(plan, context, Clause::Select, |plan| {
                    row.iter().map(|e| translate_value(plan, e).0).collect::<Vec<_>>()
                }));
            }
            (columns, InsertSource::Values(translated))
        }
        None => {
            let mut table = translate_table(plan, source);
            finish_select(plan, &mut table);
            table.statement.order_by.clear();
            let columns = plan.contexts.get(table.context).column_names();
            (columns, InsertSource::Query(Box::new(table.statement)))
        }
    };
    for name in columns.iter().filter(|c| target.column(c).is_none()) {
        plan.unsupported(format!("unknown column {} in insert into {}", name, target.name));
    }
    Statement::Insert(InsertStatement { table: table_name(target), columns, source })
}
