//! SQL statement and expression tree produced by the translator.
//!
//! The tree is dialect-neutral; `emitter` renders it to text for a concrete
//! `SqlDialect`. Translation builds it fresh for every compilation.

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(SelectStatement),
    Insert(InsertStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
    CreateTable(CreateTableStatement),
    AlterTable(AlterTableStatement),
    DropTable(DropTableStatement),
}

impl Statement {
    pub fn as_select(&self) -> Option<&SelectStatement> {
        match self {
            Statement::Select(s) => Some(s),
            _ => None,
        }
    }
}

/// A query expression: a select, optional table operators, optional ordering.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectStatement {
    pub select: SelectExpression,
    pub table_operators: Vec<TableOperatorClause>,
    pub order_by: Vec<OrderColumn>,
}

impl SelectStatement {
    pub fn new(select: SelectExpression) -> Self {
        Self { select, table_operators: Vec::new(), order_by: Vec::new() }
    }

    pub fn has_table_operators(&self) -> bool {
        !self.table_operators.is_empty()
    }

    /// True when the statement groups, so restrictions belong in HAVING.
    pub fn is_aggregate(&self) -> bool {
        !self.select.group_by.is_empty() || self.select.having.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectExpression {
    pub distinct: bool,
    pub columns: Vec<ColumnExpression>,
    pub from: Option<TableSource>,
    pub where_clause: Option<Expression>,
    pub group_by: Vec<Expression>,
    pub having: Option<Expression>,
}

impl SelectExpression {
    pub fn has_joins(&self) -> bool {
        matches!(self.from, Some(TableSource::Join(_)))
    }

    /// Position of the select-list entry carrying `alias`.
    pub fn column_index(&self, alias: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.alias.as_deref() == Some(alias))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnExpression {
    pub expression: Expression,
    pub alias: Option<String>,
}

impl ColumnExpression {
    pub fn new(expression: Expression, alias: impl Into<String>) -> Self {
        Self { expression, alias: Some(alias.into()) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableOperator {
    Union,
    Except,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableOperatorClause {
    pub operator: TableOperator,
    /// `UNION` vs `UNION ALL`.
    pub distinct: bool,
    pub select: SelectExpression,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    pub schema: Option<String>,
    pub name: String,
}

impl TableName {
    pub fn new(name: impl Into<String>) -> Self {
        Self { schema: None, name: name.into() }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableSource {
    Table { name: TableName, alias: Option<String> },
    Derived { query: Box<SelectStatement>, alias: String },
    Join(Box<JoinClause>),
}

impl TableSource {
    /// Aliases this source introduces into the enclosing scope.
    pub fn aliases(&self) -> Vec<String> {
        match self {
            TableSource::Table { name, alias } => vec![alias.clone().unwrap_or_else(|| name.name.clone())],
            TableSource::Derived { alias, .. } => vec![alias.clone()],
            TableSource::Join(join) => {
                let mut out = join.left.aliases();
                out.extend(join.right.aliases());
                out
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    LeftOuter,
    RightOuter,
    Cross,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinClause {
    pub left: TableSource,
    pub right: TableSource,
    pub join_type: JoinType,
    pub on: Option<Expression>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullsPlacement {
    First,
    Last,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderColumn {
    pub expression: Expression,
    pub ascending: bool,
    pub nulls: Option<NullsPlacement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedColumn {
    pub table: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    /// Exact numeric, kept as its canonical text.
    Decimal(String),
    String(String),
    Binary(Vec<u8>),
    /// A literal introduced by a type keyword, e.g. `DATE '2024-01-31'`.
    Typed { domain: String, text: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    And,
    Or,
    Like,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Concat,
}

impl BinaryOperator {
    /// Operators whose SQL result is a truth value rather than a value.
    pub fn is_truth_valued(self) -> bool {
        matches!(
            self,
            BinaryOperator::Equal
                | BinaryOperator::NotEqual
                | BinaryOperator::Less
                | BinaryOperator::LessOrEqual
                | BinaryOperator::Greater
                | BinaryOperator::GreaterOrEqual
                | BinaryOperator::And
                | BinaryOperator::Or
                | BinaryOperator::Like
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Not,
    Negate,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Column(QualifiedColumn),
    Literal(Literal),
    /// Named parameter; the emitter chooses the marker.
    Parameter(String),
    Binary { left: Box<Expression>, op: BinaryOperator, right: Box<Expression> },
    Unary { op: UnaryOperator, operand: Box<Expression> },
    IsNull { operand: Box<Expression>, negated: bool },
    Case { operand: Option<Box<Expression>>, when_then: Vec<(Expression, Expression)>, else_result: Option<Box<Expression>> },
    Call { name: String, args: Vec<Expression>, distinct: bool },
    /// `*`, only valid as the argument of `COUNT`.
    Wildcard,
    Query(Box<SelectStatement>),
    Exists(Box<SelectStatement>),
    InList { operand: Box<Expression>, list: Vec<Expression>, negated: bool },
    InQuery { operand: Box<Expression>, query: Box<SelectStatement>, negated: bool },
    Cast { operand: Box<Expression>, domain: String },
}

impl Expression {
    pub fn column(table: Option<&str>, name: impl Into<String>) -> Self {
        Expression::Column(QualifiedColumn { table: table.map(str::to_string), name: name.into() })
    }

    pub fn null() -> Self {
        Expression::Literal(Literal::Null)
    }

    pub fn integer(i: i64) -> Self {
        Expression::Literal(Literal::Integer(i))
    }

    pub fn parameter(name: impl Into<String>) -> Self {
        Expression::Parameter(name.into())
    }

    pub fn binary(left: Expression, op: BinaryOperator, right: Expression) -> Self {
        Expression::Binary { left: Box::new(left), op, right: Box::new(right) }
    }

    pub fn not(operand: Expression) -> Self {
        Expression::Unary { op: UnaryOperator::Not, operand: Box::new(operand) }
    }

    pub fn is_null(operand: Expression) -> Self {
        Expression::IsNull { operand: Box::new(operand), negated: false }
    }

    pub fn is_not_null(operand: Expression) -> Self {
        Expression::IsNull { operand: Box::new(operand), negated: true }
    }

    pub fn and(left: Expression, right: Expression) -> Self {
        Expression::binary(left, BinaryOperator::And, right)
    }

    pub fn or(left: Expression, right: Expression) -> Self {
        Expression::binary(left, BinaryOperator::Or, right)
    }

    /// Folds the terms with AND; `None` for an empty list.
    pub fn and_all(terms: impl IntoIterator<Item = Expression>) -> Option<Expression> {
        terms.into_iter().reduce(Expression::and)
    }

    /// Folds the terms with OR; `None` for an empty list.
    pub fn or_all(terms: impl IntoIterator<Item = Expression>) -> Option<Expression> {
        terms.into_iter().reduce(Expression::or)
    }

    /// `CASE WHEN condition THEN 1 ELSE 0 END`
    pub fn truth_to_value(condition: Expression) -> Self {
        Expression::Case {
            operand: None,
            when_then: vec![(condition, Expression::integer(1))],
            else_result: Some(Box::new(Expression::integer(0))),
        }
    }

    /// True when the SQL expression yields a truth value (usable directly in WHERE).
    pub fn is_truth_valued(&self) -> bool {
        match self {
            Expression::Binary { op, .. } => op.is_truth_valued(),
            Expression::Unary { op: UnaryOperator::Not, .. } => true,
            Expression::IsNull { .. }
            | Expression::Exists(_)
            | Expression::InList { .. }
            | Expression::InQuery { .. } => true,
            _ => false,
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Expression::Literal(_))
    }

    pub fn as_column(&self) -> Option<&QualifiedColumn> {
        match self {
            Expression::Column(c) => Some(c),
            _ => None,
        }
    }

    /// True when a sub-select occurs anywhere in the expression.
    pub fn contains_sub_select(&self) -> bool {
        match self {
            Expression::Query(_) | Expression::Exists(_) | Expression::InQuery { .. } => true,
            Expression::Binary { left, right, .. } => left.contains_sub_select() || right.contains_sub_select(),
            Expression::Unary { operand, .. }
            | Expression::IsNull { operand, .. }
            | Expression::Cast { operand, .. } => operand.contains_sub_select(),
            Expression::Case { operand, when_then, else_result } => {
                operand.as_ref().is_some_and(|o| o.contains_sub_select())
                    || when_then.iter().any(|(w, t)| w.contains_sub_select() || t.contains_sub_select())
                    || else_result.as_ref().is_some_and(|e| e.contains_sub_select())
            }
            Expression::Call { args, .. } => args.iter().any(Expression::contains_sub_select),
            Expression::InList { operand, list, .. } => {
                operand.contains_sub_select() || list.iter().any(Expression::contains_sub_select)
            }
            Expression::Column(_) | Expression::Literal(_) | Expression::Parameter(_) | Expression::Wildcard => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InsertSource {
    Values(Vec<Vec<Expression>>),
    Query(Box<SelectStatement>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    pub table: TableName,
    pub columns: Vec<String>,
    pub source: InsertSource,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStatement {
    pub table: TableName,
    pub assignments: Vec<(String, Expression)>,
    pub where_clause: Option<Expression>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStatement {
    pub table: TableName,
    pub where_clause: Option<Expression>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDefinition {
    pub name: String,
    pub domain: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateTableStatement {
    pub table: TableName,
    pub columns: Vec<ColumnDefinition>,
    pub primary_key: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlterAction {
    AddColumn(ColumnDefinition),
    DropColumn(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlterTableStatement {
    pub table: TableName,
    pub actions: Vec<AlterAction>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DropTableStatement {
    pub table: TableName,
}
