//! Renders the statement tree to dialect SQL text.
//!
//! Emission is a pure function of the tree and the dialect. Parameters are
//! reported in marker order so drivers can bind positionally.

use sqlformat::{FormatOptions, Indent, QueryParams};

use super::ast::{
    AlterAction, BinaryOperator, ColumnDefinition, Expression, InsertSource, JoinType, Literal, NullsPlacement,
    OrderColumn, SelectExpression, SelectStatement, Statement, TableName, TableOperator, TableSource, UnaryOperator,
};
use super::errors::QueryAstError;

pub mod dialect;
use dialect::SqlDialect;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedSql {
    pub text: String,
    /// Parameter names in the order their markers appear.
    pub parameters: Vec<String>,
}

pub fn emit_statement(statement: &Statement, dialect: &dyn SqlDialect) -> Result<EmittedSql, QueryAstError> {
    let mut emitter = Emitter { dialect, parameters: Vec::new() };
    let text = emitter.statement(statement)?;
    Ok(EmittedSql { text, parameters: emitter.parameters })
}

pub fn emit_expression(expression: &Expression, dialect: &dyn SqlDialect) -> Result<EmittedSql, QueryAstError> {
    let mut emitter = Emitter { dialect, parameters: Vec::new() };
    let text = emitter.expr(expression)?;
    Ok(EmittedSql { text, parameters: emitter.parameters })
}

/// Pretty-printed copy of `sql` for logs.
pub fn format_sql(sql: &str) -> String {
    let options = FormatOptions { indent: Indent::Spaces(4), uppercase: Some(true), ..Default::default() };
    sqlformat::format(sql, &QueryParams::None, &options)
}

struct Emitter<'a> {
    dialect: &'a dyn SqlDialect,
    parameters: Vec<String>,
}

const PRIMARY: u8 = 8;

fn precedence(expr: &Expression) -> u8 {
    match expr {
        Expression::Binary { op, .. } => match op {
            BinaryOperator::Or => 1,
            BinaryOperator::And => 2,
            BinaryOperator::Equal
            | BinaryOperator::NotEqual
            | BinaryOperator::Less
            | BinaryOperator::LessOrEqual
            | BinaryOperator::Greater
            | BinaryOperator::GreaterOrEqual
            | BinaryOperator::Like => 4,
            BinaryOperator::Add | BinaryOperator::Subtract | BinaryOperator::Concat => 5,
            BinaryOperator::Multiply | BinaryOperator::Divide | BinaryOperator::Modulo => 6,
        },
        Expression::Unary { op: UnaryOperator::Not, .. } => 3,
        Expression::Unary { op: UnaryOperator::Negate, .. } => 7,
        Expression::IsNull { .. } | Expression::InList { .. } | Expression::InQuery { .. } => 4,
        _ => PRIMARY,
    }
}

fn operator_text(op: BinaryOperator) -> &'static str {
    match op {
        BinaryOperator::Equal => "=",
        BinaryOperator::NotEqual => "<>",
        BinaryOperator::Less => "<",
        BinaryOperator::LessOrEqual => "<=",
        BinaryOperator::Greater => ">",
        BinaryOperator::GreaterOrEqual => ">=",
        BinaryOperator::And => "AND",
        BinaryOperator::Or => "OR",
        BinaryOperator::Like => "LIKE",
        BinaryOperator::Add => "+",
        BinaryOperator::Subtract => "-",
        BinaryOperator::Multiply => "*",
        BinaryOperator::Divide => "/",
        BinaryOperator::Modulo => "%",
        BinaryOperator::Concat => "||",
    }
}

impl Emitter<'_> {
    fn statement(&mut self, statement: &Statement) -> Result<String, QueryAstError> {
        match statement {
            Statement::Select(s) => self.select_statement(s),
            Statement::Insert(i) => {
                let mut sql = format!("INSERT INTO {}", self.table_name(&i.table));
                if !i.columns.is_empty() {
                    let cols = i.columns.iter().map(|c| self.dialect.quote_ident(c)).collect::<Vec<_>>();
                    sql.push_str(&format!(" ({})", cols.join(", ")));
                }
                match &i.source {
                    InsertSource::Values(rows) => {
                        let mut rendered = Vec::with_capacity(rows.len());
                        for row in rows {
                            rendered.push(format!("({})", self.expr_list(row)?));
                        }
                        sql.push_str(&format!(" VALUES {}", rendered.join(", ")));
                    }
                    InsertSource::Query(q) => {
                        sql.push(' ');
                        sql.push_str(&self.select_statement(q)?);
                    }
                }
                Ok(sql)
            }
            Statement::Update(u) => {
                let mut sets = Vec::with_capacity(u.assignments.len());
                for (column, value) in &u.assignments {
                    sets.push(format!("{} = {}", self.dialect.quote_ident(column), self.expr(value)?));
                }
                let mut sql = format!("UPDATE {} SET {}", self.table_name(&u.table), sets.join(", "));
                if let Some(w) = &u.where_clause {
                    sql.push_str(&format!(" WHERE {}", self.expr(w)?));
                }
                Ok(sql)
            }
            Statement::Delete(d) => {
                let mut sql = format!("DELETE FROM {}", self.table_name(&d.table));
                if let Some(w) = &d.where_clause {
                    sql.push_str(&format!(" WHERE {}", self.expr(w)?));
                }
                Ok(sql)
            }
            Statement::CreateTable(c) => {
                let mut parts: Vec<String> = c.columns.iter().map(|col| self.column_definition(col)).collect();
                if !c.primary_key.is_empty() {
                    let key = c.primary_key.iter().map(|k| self.dialect.quote_ident(k)).collect::<Vec<_>>();
                    parts.push(format!("PRIMARY KEY ({})", key.join(", ")));
                }
                Ok(format!("CREATE TABLE {} ({})", self.table_name(&c.table), parts.join(", ")))
            }
            Statement::AlterTable(a) => {
                if a.actions.is_empty() {
                    return Err(QueryAstError::Emit("alter table without actions".into()));
                }
                let actions = a
                    .actions
                    .iter()
                    .map(|action| match action {
                        AlterAction::AddColumn(col) => match self.dialect.db_type() {
                            crate::models::enums::DatabaseType::MsSQL => format!("ADD {}", self.column_definition(col)),
                            _ => format!("ADD COLUMN {}", self.column_definition(col)),
                        },
                        AlterAction::DropColumn(name) => format!("DROP COLUMN {}", self.dialect.quote_ident(name)),
                    })
                    .collect::<Vec<_>>();
                Ok(format!("ALTER TABLE {} {}", self.table_name(&a.table), actions.join(", ")))
            }
            Statement::DropTable(d) => Ok(format!("DROP TABLE {}", self.table_name(&d.table))),
        }
    }

    fn column_definition(&self, col: &ColumnDefinition) -> String {
        let mut s = format!("{} {}", self.dialect.quote_ident(&col.name), col.domain);
        if !col.nullable {
            s.push_str(" NOT NULL");
        }
        s
    }

    fn table_name(&self, name: &TableName) -> String {
        match &name.schema {
            Some(schema) => format!("{}.{}", self.dialect.quote_ident(schema), self.dialect.quote_ident(&name.name)),
            None => self.dialect.quote_ident(&name.name),
        }
    }

    fn select_statement(&mut self, s: &SelectStatement) -> Result<String, QueryAstError> {
        let mut sql = self.select_expression(&s.select)?;
        for clause in &s.table_operators {
            let keyword = match (clause.operator, clause.distinct) {
                (TableOperator::Union, true) => "UNION",
                (TableOperator::Union, false) => "UNION ALL",
                (TableOperator::Except, _) => self.dialect.except_keyword(),
            };
            sql.push_str(&format!(" {} {}", keyword, self.select_expression(&clause.select)?));
        }
        if !s.order_by.is_empty() {
            let mut items = Vec::with_capacity(s.order_by.len());
            for column in &s.order_by {
                items.push(self.order_column(column)?);
            }
            sql.push_str(&format!(" ORDER BY {}", items.join(", ")));
        }
        Ok(sql)
    }

    fn order_column(&mut self, column: &OrderColumn) -> Result<String, QueryAstError> {
        let mut s = format!("{} {}", self.expr(&column.expression)?, if column.ascending { "ASC" } else { "DESC" });
        match column.nulls {
            Some(NullsPlacement::First) => s.push_str(" NULLS FIRST"),
            Some(NullsPlacement::Last) => s.push_str(" NULLS LAST"),
            None => {}
        }
        Ok(s)
    }

    fn select_expression(&mut self, s: &SelectExpression) -> Result<String, QueryAstError> {
        let mut sql = String::from("SELECT ");
        if s.distinct {
            sql.push_str("DISTINCT ");
        }
        if s.columns.is_empty() {
            sql.push('*');
        } else {
            let mut cols = Vec::with_capacity(s.columns.len());
            for c in &s.columns {
                let rendered = self.expr(&c.expression)?;
                let same_name = c.expression.as_column().is_some_and(|q| Some(&q.name) == c.alias.as_ref());
                match &c.alias {
                    Some(alias) if !same_name => cols.push(format!("{} AS {}", rendered, self.dialect.quote_ident(alias))),
                    _ => cols.push(rendered),
                }
            }
            sql.push_str(&cols.join(", "));
        }
        if let Some(from) = &s.from {
            sql.push_str(&format!(" FROM {}", self.table_source(from)?));
        }
        if let Some(w) = &s.where_clause {
            sql.push_str(&format!(" WHERE {}", self.expr(w)?));
        }
        if !s.group_by.is_empty() {
            sql.push_str(&format!(" GROUP BY {}", self.expr_list(&s.group_by)?));
        }
        if let Some(h) = &s.having {
            sql.push_str(&format!(" HAVING {}", self.expr(h)?));
        }
        Ok(sql)
    }

    fn table_source(&mut self, source: &TableSource) -> Result<String, QueryAstError> {
        match source {
            TableSource::Table { name, alias } => Ok(match alias {
                Some(a) => format!("{} {}", self.table_name(name), self.dialect.quote_ident(a)),
                None => self.table_name(name),
            }),
            TableSource::Derived { query, alias } => {
                Ok(format!("({}) {}", self.select_statement(query)?, self.dialect.quote_ident(alias)))
            }
            TableSource::Join(join) => {
                let left = self.table_source(&join.left)?;
                let right = match &join.right {
                    TableSource::Join(_) => format!("({})", self.table_source(&join.right)?),
                    other => self.table_source(other)?,
                };
                let keyword = match join.join_type {
                    JoinType::Inner => "INNER JOIN",
                    JoinType::LeftOuter => "LEFT OUTER JOIN",
                    JoinType::RightOuter => "RIGHT OUTER JOIN",
                    JoinType::Cross => "CROSS JOIN",
                };
                let mut sql = format!("{} {} {}", left, keyword, right);
                match (&join.on, join.join_type) {
                    (Some(on), _) => sql.push_str(&format!(" ON {}", self.expr(on)?)),
                    (None, JoinType::Cross) => {}
                    (None, _) => sql.push_str(&format!(" ON {}", self.dialect.emit_boolean(true))),
                }
                Ok(sql)
            }
        }
    }

    fn expr_list(&mut self, exprs: &[Expression]) -> Result<String, QueryAstError> {
        let mut out = Vec::with_capacity(exprs.len());
        for e in exprs {
            out.push(self.expr(e)?);
        }
        Ok(out.join(", "))
    }

    fn operand(&mut self, child: &Expression, parent: u8, right: bool, parent_op: Option<BinaryOperator>) -> Result<String, QueryAstError> {
        let child_prec = precedence(child);
        let and_inside_or = parent_op == Some(BinaryOperator::Or)
            && matches!(child, Expression::Binary { op: BinaryOperator::And, .. });
        let wrap = child_prec < parent
            || (child_prec == parent && parent > 2 && (right || parent == 4))
            || and_inside_or;
        let rendered = self.expr(child)?;
        Ok(if wrap { format!("({})", rendered) } else { rendered })
    }

    fn expr(&mut self, expr: &Expression) -> Result<String, QueryAstError> {
        Ok(match expr {
            Expression::Column(c) => match &c.table {
                Some(t) => format!("{}.{}", self.dialect.quote_ident(t), self.dialect.quote_ident(&c.name)),
                None => self.dialect.quote_ident(&c.name),
            },
            Expression::Literal(l) => self.literal(l),
            Expression::Parameter(name) => {
                self.parameters.push(name.clone());
                self.dialect.parameter_marker(name, self.parameters.len())
            }
            Expression::Binary { left, op, right } => {
                let prec = precedence(expr);
                let l = self.operand(left, prec, false, Some(*op))?;
                let r = self.operand(right, prec, true, Some(*op))?;
                if *op == BinaryOperator::Concat {
                    self.dialect.emit_concat(&l, &r)
                } else {
                    format!("{} {} {}", l, operator_text(*op), r)
                }
            }
            Expression::Unary { op, operand } => {
                let inner = self.expr(operand)?;
                let inner = if precedence(operand) < PRIMARY { format!("({})", inner) } else { inner };
                match op {
                    UnaryOperator::Not => format!("NOT {}", inner),
                    UnaryOperator::Negate => format!("-{}", inner),
                }
            }
            Expression::IsNull { operand, negated } => {
                let inner = self.operand(operand, 4, false, None)?;
                format!("{} IS {}NULL", inner, if *negated { "NOT " } else { "" })
            }
            Expression::Case { operand, when_then, else_result } => {
                let mut s = String::from("CASE");
                if let Some(op) = operand {
                    s.push(' ');
                    s.push_str(&self.expr(op)?);
                }
                for (w, t) in when_then {
                    s.push_str(&format!(" WHEN {} THEN {}", self.expr(w)?, self.expr(t)?));
                }
                if let Some(e) = else_result {
                    s.push_str(&format!(" ELSE {}", self.expr(e)?));
                }
                s.push_str(" END");
                s
            }
            Expression::Call { name, args, distinct } => {
                format!("{}({}{})", name, if *distinct { "DISTINCT " } else { "" }, self.expr_list(args)?)
            }
            Expression::Wildcard => "*".into(),
            Expression::Query(q) => format!("({})", self.select_statement(q)?),
            Expression::Exists(q) => format!("EXISTS ({})", self.select_statement(q)?),
            Expression::InList { operand, list, negated } => {
                let inner = self.operand(operand, 4, false, None)?;
                format!("{} {}IN ({})", inner, if *negated { "NOT " } else { "" }, self.expr_list(list)?)
            }
            Expression::InQuery { operand, query, negated } => {
                let inner = self.operand(operand, 4, false, None)?;
                format!("{} {}IN ({})", inner, if *negated { "NOT " } else { "" }, self.select_statement(query)?)
            }
            Expression::Cast { operand, domain } => format!("CAST({} AS {})", self.expr(operand)?, domain),
        })
    }

    fn literal(&self, literal: &Literal) -> String {
        match literal {
            Literal::Null => "NULL".into(),
            Literal::Boolean(b) => self.dialect.emit_boolean(*b),
            Literal::Integer(i) => i.to_string(),
            Literal::Float(f) => format!("{:?}", f),
            Literal::Decimal(d) => d.clone(),
            Literal::String(s) => self.dialect.quote_string(s),
            Literal::Binary(b) => self.dialect.emit_binary(b),
            Literal::Typed { domain, text } => format!("{} {}", domain, self.dialect.quote_string(text)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::dialect::{GenericDialect, PostgresDialect, SqliteDialect};
    use super::*;
    use crate::query_ast::ast::{ColumnExpression, SelectExpression};

    fn id() -> Expression {
        Expression::column(None, "ID")
    }

    #[test]
    fn and_inside_or_is_parenthesized() {
        let p = Expression::parameter("p");
        let e = Expression::or(
            Expression::and(Expression::is_null(id()), Expression::is_null(p.clone())),
            Expression::binary(id(), BinaryOperator::GreaterOrEqual, p),
        );
        let out = emit_expression(&e, &GenericDialect).unwrap();
        assert_eq!(out.text, "(ID IS NULL AND :p IS NULL) OR ID >= :p");
        assert_eq!(out.parameters, vec!["p", "p"]);
    }

    #[test]
    fn postgres_numbers_markers_in_order() {
        let e = Expression::and(
            Expression::binary(id(), BinaryOperator::Equal, Expression::parameter("a")),
            Expression::binary(Expression::column(Some("T1"), "X"), BinaryOperator::Less, Expression::parameter("b")),
        );
        let out = emit_expression(&e, &PostgresDialect).unwrap();
        assert_eq!(out.text, "\"ID\" = $1 AND \"T1\".\"X\" < $2");
    }

    #[test]
    fn right_operand_of_same_precedence_is_wrapped() {
        let e = Expression::binary(
            Expression::integer(10),
            BinaryOperator::Subtract,
            Expression::binary(Expression::integer(3), BinaryOperator::Subtract, Expression::integer(2)),
        );
        assert_eq!(emit_expression(&e, &GenericDialect).unwrap().text, "10 - (3 - 2)");
    }

    #[test]
    fn select_with_union_and_order() {
        let branch = |table: &str| SelectExpression {
            columns: vec![ColumnExpression::new(Expression::column(Some("T1"), "ID"), "ID")],
            from: Some(TableSource::Table { name: TableName::new(table), alias: Some("T1".into()) }),
            ..Default::default()
        };
        let mut statement = SelectStatement::new(branch("A"));
        statement.table_operators.push(super::super::ast::TableOperatorClause {
            operator: TableOperator::Union,
            distinct: false,
            select: branch("B"),
        });
        statement.order_by.push(OrderColumn { expression: id(), ascending: false, nulls: Some(NullsPlacement::Last) });
        let out = emit_statement(&Statement::Select(statement), &SqliteDialect).unwrap();
        assert_eq!(
            out.text,
            "SELECT `T1`.`ID` FROM `A` `T1` UNION ALL SELECT `T1`.`ID` FROM `B` `T1` ORDER BY `ID` DESC NULLS LAST"
        );
    }

    #[test]
    fn formatted_sql_keeps_keywords() {
        let pretty = format_sql("select a from t where b = 1");
        assert!(pretty.contains("SELECT"));
        assert!(pretty.contains("WHERE"));
    }
}
