//! Scalar expression translation and boolean-context normalization.

use crate::device::capabilities::Clause;
use crate::device::operators::{ConstantEvaluator, OperatorMapping};
use crate::device::plan::DevicePlan;
use crate::query_ast::ast::{BinaryOperator, Expression, UnaryOperator};
use crate::query_ast::logical::{Expr, JoinSide, LogicalQueryPlan};
use crate::scalar_types::ScalarType;
use crate::value::Value;

use super::{TableExpr, finish_select, translate_table};

/// Translates `expr` where a truth value is required (WHERE, HAVING, ON, WHEN).
pub(crate) fn translate_condition(plan: &mut DevicePlan<'_>, expr: &Expr) -> Expression {
    plan.push_boolean_context(true);
    let (e, _) = translate_expr(plan, expr);
    plan.pop_boolean_context();
    e
}

/// Translates `expr` where a value is required (select list, arguments).
pub(crate) fn translate_value(plan: &mut DevicePlan<'_>, expr: &Expr) -> (Expression, ScalarType) {
    plan.push_boolean_context(false);
    let result = translate_expr(plan, expr);
    plan.pop_boolean_context();
    result
}

pub(crate) fn current_clause(plan: &DevicePlan<'_>) -> Clause {
    plan.contexts.current().map(|id| plan.contexts.get(id).clause).unwrap_or(Clause::Select)
}

fn translate_expr(plan: &mut DevicePlan<'_>, expr: &Expr) -> (Expression, ScalarType) {
    let (e, ty) = match expr {
        Expr::Literal { value, ty } => (literal(plan, value, *ty), *ty),
        Expr::Column { name, side } => column(plan, name, *side),
        Expr::Parameter { name, ty } => {
            plan.add_parameter(name, *ty);
            if let Some(id) = plan.contexts.current() {
                plan.contexts.get_mut(id).references.has_parameters = true;
            }
            (Expression::parameter(name.clone()), *ty)
        }
        Expr::Call { operator, args, ty } => (call(plan, operator, args, *ty), *ty),
        Expr::Case { when_then, else_result, ty } => {
            let mut arms = Vec::with_capacity(when_then.len());
            for (when, then) in when_then {
                let condition = translate_condition(plan, when);
                let (result, _) = translate_value(plan, then);
                arms.push((condition, result));
            }
            let else_result = else_result.as_ref().map(|e| Box::new(translate_value(plan, e).0));
            (Expression::Case { operand: None, when_then: arms, else_result }, *ty)
        }
        Expr::IsNull { operand, negated } => {
            let (inner, _) = translate_value(plan, operand);
            (Expression::IsNull { operand: Box::new(inner), negated: *negated }, ScalarType::Boolean)
        }
        Expr::Exists(sub) => match sub_select(plan, sub) {
            Some(mut table) => {
                table.statement.order_by.clear();
                (Expression::Exists(Box::new(table.statement)), ScalarType::Boolean)
            }
            None => (Expression::null(), ScalarType::Boolean),
        },
        Expr::Subquery(sub) => match sub_select(plan, sub) {
            Some(mut table) => {
                let ctx = plan.contexts.get(table.context);
                if ctx.columns.len() != 1 {
                    plan.unsupported("scalar sub-select must yield exactly one column");
                    (Expression::null(), ScalarType::String)
                } else {
                    let ty = ctx.columns[0].ty;
                    table.statement.order_by.clear();
                    (Expression::Query(Box::new(table.statement)), ty)
                }
            }
            None => (Expression::null(), ScalarType::String),
        },
        Expr::In { operand, plan: sub, negated } => {
            let (inner, _) = translate_value(plan, operand);
            match sub_select(plan, sub) {
                Some(mut table) if plan.contexts.get(table.context).columns.len() == 1 => {
                    table.statement.order_by.clear();
                    let e = Expression::InQuery {
                        operand: Box::new(inner),
                        query: Box::new(table.statement),
                        negated: *negated,
                    };
                    (e, ScalarType::Boolean)
                }
                Some(_) => {
                    plan.unsupported("membership sub-select must yield exactly one column");
                    (Expression::null(), ScalarType::Boolean)
                }
                None => (Expression::null(), ScalarType::Boolean),
            }
        }
    };
    (normalize_boolean(plan, e, ty), ty)
}

/// Reconciles truth-valued SQL with the boolean context it lands in.
fn normalize_boolean(plan: &DevicePlan<'_>, e: Expression, ty: ScalarType) -> Expression {
    if ty != ScalarType::Boolean || plan.profile.supports_native_boolean {
        return e;
    }
    match (plan.is_boolean_context(), e.is_truth_valued()) {
        (true, false) if e == Expression::null() => e,
        (true, false) => Expression::binary(e, BinaryOperator::Equal, Expression::integer(1)),
        (false, true) => Expression::truth_to_value(e),
        _ => e,
    }
}

fn literal(plan: &mut DevicePlan<'_>, value: &Value, ty: ScalarType) -> Expression {
    if value.is_null() {
        return Expression::null();
    }
    match plan.type_maps.get(ty).and_then(|map| map.literal(value)) {
        Ok(e) => e,
        Err(err) => {
            plan.unsupported(err.to_string());
            Expression::null()
        }
    }
}

fn column(plan: &mut DevicePlan<'_>, name: &str, side: Option<JoinSide>) -> (Expression, ScalarType) {
    let found = match side {
        Some(side) => plan.current_join_context().and_then(|(left, right)| {
            let id = if side == JoinSide::Left { left } else { right };
            plan.contexts.get(id).column(name).cloned()
        }),
        None => {
            let nested_correlation = plan.profile.supports_nested_correlation;
            plan.contexts.find_column(name, false, nested_correlation).map(|r| r.column)
        }
    };
    match found {
        Some(column) => {
            if column.has_sub_select() {
                let clause = current_clause(plan);
                if !plan.profile.allows_sub_select_in(clause) {
                    plan.unsupported(format!("sub-select not allowed in {} clause", clause.name()));
                }
            }
            (column.expression(), column.ty)
        }
        None => {
            plan.unsupported(format!("unknown column {}", name));
            (Expression::null(), ScalarType::String)
        }
    }
}

fn call(plan: &mut DevicePlan<'_>, operator: &str, args: &[Expr], ty: ScalarType) -> Expression {
    match plan.operators.get(operator).cloned() {
        Some(OperatorMapping::Binary(BinaryOperator::Subtract)) if args.len() == 1 => {
            let (operand, _) = translate_value(plan, &args[0]);
            Expression::Unary { op: UnaryOperator::Negate, operand: Box::new(operand) }
        }
        Some(OperatorMapping::Binary(op)) => {
            let [left, right] = args else {
                plan.unsupported(format!("operator '{}' expects two arguments", operator));
                return Expression::null();
            };
            let (l, r) = if matches!(op, BinaryOperator::And | BinaryOperator::Or) {
                (translate_condition(plan, left), translate_condition(plan, right))
            } else {
                (translate_value(plan, left).0, translate_value(plan, right).0)
            };
            Expression::binary(l, op, r)
        }
        Some(OperatorMapping::Unary(op)) => {
            let [operand] = args else {
                plan.unsupported(format!("operator '{}' expects one argument", operator));
                return Expression::null();
            };
            let operand = match op {
                UnaryOperator::Not => translate_condition(plan, operand),
                UnaryOperator::Negate => translate_value(plan, operand).0,
            };
            Expression::Unary { op, operand: Box::new(operand) }
        }
        Some(OperatorMapping::Function(name)) => {
            let args = args.iter().map(|a| translate_value(plan, a).0).collect();
            Expression::Call { name, args, distinct: false }
        }
        None => fold_or_fail(plan, operator, args, ty),
    }
}

/// Evaluates an unmapped operator over constant arguments, or records it as unsupported.
fn fold_or_fail(plan: &mut DevicePlan<'_>, operator: &str, args: &[Expr], ty: ScalarType) -> Expression {
    let folded = plan.evaluator.and_then(|evaluator| {
        if !evaluator.is_deterministic(operator) {
            return None;
        }
        let values = args.iter().map(|a| fold(evaluator, a)).collect::<Option<Vec<_>>>()?;
        evaluator.evaluate(operator, &values).map(|v| coerce(v, ty))
    });
    let Some(value) = folded else {
        plan.unsupported(format!("operator '{}' is not supported by this device", operator));
        return Expression::null();
    };
    let rendered = if value.is_null() {
        Ok(Expression::null())
    } else {
        plan.type_maps.get(ty).and_then(|map| map.literal(&value))
    };
    match rendered {
        Ok(e) => {
            plan.fallback(format!("operator '{}' has no mapping; folded to constant {}", operator, value));
            e
        }
        Err(err) => {
            plan.unsupported(err.to_string());
            Expression::null()
        }
    }
}

fn fold(evaluator: &dyn ConstantEvaluator, expr: &Expr) -> Option<Value> {
    match expr {
        Expr::Literal { value, .. } => Some(value.clone()),
        Expr::Call { operator, args, ty } if evaluator.is_deterministic(operator) => {
            let values = args.iter().map(|a| fold(evaluator, a)).collect::<Option<Vec<_>>>()?;
            evaluator.evaluate(operator, &values).map(|v| coerce(v, *ty))
        }
        _ => None,
    }
}

fn coerce(value: Value, ty: ScalarType) -> Value {
    match (value, ty) {
        (Value::Float(f), ScalarType::Integer) if f.fract() == 0.0 => Value::Integer(f as i64),
        (Value::Integer(i), ScalarType::Float) => Value::Float(i as f64),
        (Value::Integer(i), ScalarType::Decimal) => Value::Decimal(i.into()),
        (value, _) => value,
    }
}

/// Translates a sub-plan as a scalar sub-select of the current context.
fn sub_select(plan: &mut DevicePlan<'_>, node: &LogicalQueryPlan) -> Option<TableExpr> {
    let clause = current_clause(plan);
    if !plan.profile.allows_sub_select_in(clause) {
        plan.unsupported(format!("sub-select not allowed in {} clause", clause.name()));
        return None;
    }
    let outer = plan.contexts.current();
    plan.contexts.push(false, true);
    let mut table = translate_table(plan, node);
    finish_select(plan, &mut table);
    plan.contexts.pop();
    if let Some(id) = outer {
        plan.contexts.get_mut(id).references.has_sub_select = true;
    }
    Some(table)
}
