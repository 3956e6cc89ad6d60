//! Reference check over emitted trees: every qualified column must name a
//! range variable declared by its own select or an enclosing one.

use super::ast::{Expression, InsertSource, SelectExpression, SelectStatement, Statement, TableSource};
use super::errors::QueryAstError;

struct Scopes {
    frames: Vec<Vec<String>>,
}

impl Scopes {
    fn resolves(&self, table: &str) -> bool {
        self.frames.iter().rev().any(|f| f.iter().any(|a| a == table))
    }
}

pub fn check_references(statement: &Statement) -> Result<(), QueryAstError> {
    let mut scopes = Scopes { frames: Vec::new() };
    match statement {
        Statement::Select(s) => select_statement(s, &mut scopes),
        Statement::Insert(i) => match &i.source {
            InsertSource::Query(q) => select_statement(q, &mut scopes),
            InsertSource::Values(rows) => rows.iter().flatten().try_for_each(|e| expression(e, &mut scopes)),
        },
        Statement::Update(u) => {
            scopes.frames.push(vec![u.table.name.clone()]);
            for (_, value) in &u.assignments {
                expression(value, &mut scopes)?;
            }
            u.where_clause.as_ref().map_or(Ok(()), |w| expression(w, &mut scopes))
        }
        Statement::Delete(d) => {
            scopes.frames.push(vec![d.table.name.clone()]);
            d.where_clause.as_ref().map_or(Ok(()), |w| expression(w, &mut scopes))
        }
        Statement::CreateTable(_) | Statement::AlterTable(_) | Statement::DropTable(_) => Ok(()),
    }
}

fn select_statement(s: &SelectStatement, scopes: &mut Scopes) -> Result<(), QueryAstError> {
    select_expression(&s.select, scopes)?;
    for clause in &s.table_operators {
        select_expression(&clause.select, scopes)?;
    }
    // ORDER BY sees the first select's range variables.
    let aliases = s.select.from.as_ref().map(TableSource::aliases).unwrap_or_default();
    scopes.frames.push(aliases);
    let result = s.order_by.iter().try_for_each(|o| expression(&o.expression, scopes));
    scopes.frames.pop();
    result
}

fn table_source(source: &TableSource, scopes: &mut Scopes) -> Result<(), QueryAstError> {
    match source {
        TableSource::Table { .. } => Ok(()),
        TableSource::Derived { query, .. } => select_statement(query, scopes),
        TableSource::Join(join) => {
            table_source(&join.left, scopes)?;
            table_source(&join.right, scopes)?;
            let Some(on) = &join.on else { return Ok(()) };
            scopes.frames.push(source.aliases());
            let result = expression(on, scopes);
            scopes.frames.pop();
            result
        }
    }
}

fn select_expression(s: &SelectExpression, scopes: &mut Scopes) -> Result<(), QueryAstError> {
    if let Some(from) = &s.from {
        table_source(from, scopes)?;
    }
    scopes.frames.push(s.from.as_ref().map(TableSource::aliases).unwrap_or_default());
    let result = (|| {
        for column in &s.columns {
            expression(&column.expression, scopes)?;
        }
        for e in s.where_clause.iter().chain(&s.group_by).chain(&s.having) {
            expression(e, scopes)?;
        }
        Ok(())
    })();
    scopes.frames.pop();
    result
}

fn expression(e: &Expression, scopes: &mut Scopes) -> Result<(), QueryAstError> {
    match e {
        Expression::Column(c) => match &c.table {
            Some(table) if !scopes.resolves(table) => {
                Err(QueryAstError::UnresolvedReference(format!("{}.{}", table, c.name)))
            }
            _ => Ok(()),
        },
        Expression::Literal(_) | Expression::Parameter(_) | Expression::Wildcard => Ok(()),
        Expression::Binary { left, right, .. } => {
            expression(left, scopes)?;
            expression(right, scopes)
        }
        Expression::Unary { operand, .. } | Expression::IsNull { operand, .. } | Expression::Cast { operand, .. } => {
            expression(operand, scopes)
        }
        Expression::Case { operand, when_then, else_result } => {
            if let Some(operand) = operand {
                expression(operand, scopes)?;
            }
            for (when, then) in when_then {
                expression(when, scopes)?;
                expression(then, scopes)?;
            }
            else_result.as_ref().map_or(Ok(()), |e| expression(e, scopes))
        }
        Expression::Call { args, .. } => args.iter().try_for_each(|a| expression(a, scopes)),
        Expression::Query(q) | Expression::Exists(q) => select_statement(q, scopes),
        Expression::InList { operand, list, .. } => {
            expression(operand, scopes)?;
            list.iter().try_for_each(|a| expression(a, scopes))
        }
        Expression::InQuery { operand, query, .. } => {
            expression(operand, scopes)?;
            select_statement(query, scopes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_ast::ast::{ColumnExpression, TableName};

    fn from_t1() -> SelectExpression {
        SelectExpression {
            from: Some(TableSource::Table { name: TableName::new("S"), alias: Some("T1".into()) }),
            ..Default::default()
        }
    }

    #[test]
    fn correlated_reference_resolves_outward() {
        let mut inner = SelectStatement::new(SelectExpression {
            from: Some(TableSource::Table { name: TableName::new("T"), alias: Some("T2".into()) }),
            ..Default::default()
        });
        inner.select.where_clause = Some(Expression::binary(
            Expression::column(Some("T2"), "DeptID"),
            crate::query_ast::ast::BinaryOperator::Equal,
            Expression::column(Some("T1"), "DeptID"),
        ));
        let mut outer = from_t1();
        outer.where_clause = Some(Expression::Exists(Box::new(inner)));
        assert!(check_references(&Statement::Select(SelectStatement::new(outer))).is_ok());
    }

    #[test]
    fn reference_to_a_sibling_alias_is_rejected() {
        let mut outer = from_t1();
        outer.columns.push(ColumnExpression::new(Expression::column(Some("T9"), "ID"), "ID"));
        let err = check_references(&Statement::Select(SelectStatement::new(outer))).unwrap_err();
        assert!(matches!(err, QueryAstError::UnresolvedReference(r) if r == "T9.ID"));
    }
}
