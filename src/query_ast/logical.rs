//! Logical plan consumed by the device translator.
//!
//! Plans arrive compiled, optimized and catalog-resolved; this crate only reads
//! them. Every node is serde-deserializable so plans can be handed over as JSON.

use serde::{Deserialize, Serialize};

use crate::scalar_types::ScalarType;
use crate::value::Value;

/// What a plan node evaluates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultKind {
    Scalar,
    Row,
    Table,
    Statement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ScalarType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, ty: ScalarType) -> Self {
        Self { name: name.into(), ty, nullable: true }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Key {
    pub columns: Vec<String>,
}

/// A resolved base table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableVar {
    #[serde(default)]
    pub schema: Option<String>,
    pub name: String,
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub keys: Vec<Key>,
}

impl TableVar {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        Self { schema: None, name: name.into(), columns, keys: Vec::new() }
    }

    pub fn with_key(mut self, columns: &[&str]) -> Self {
        self.keys.push(Key { columns: columns.iter().map(|c| c.to_string()).collect() });
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_key(&self) -> Option<&Key> {
        self.keys.first()
    }
}

/// Which argument of the innermost join a qualified column belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinSide {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedExpr {
    pub name: String,
    pub expr: Expr,
}

impl NamedExpr {
    pub fn new(name: impl Into<String>, expr: Expr) -> Self {
        Self { name: name.into(), expr }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenameColumn {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateColumn {
    pub name: String,
    /// `count`, `sum`, `avg`, `min` or `max`.
    pub function: String,
    /// `None` counts rows.
    #[serde(default)]
    pub argument: Option<String>,
    #[serde(default)]
    pub distinct: bool,
    pub ty: ScalarType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortColumn {
    pub name: String,
    #[serde(default = "default_ascending")]
    pub ascending: bool,
    /// Explicit NULL placement; `None` follows the profile, pinning NULLS FIRST
    /// when the backend order is unknown.
    #[serde(default)]
    pub nulls_first: Option<bool>,
}

fn default_ascending() -> bool {
    true
}

impl SortColumn {
    pub fn asc(name: impl Into<String>) -> Self {
        Self { name: name.into(), ascending: true, nulls_first: None }
    }

    pub fn desc(name: impl Into<String>) -> Self {
        Self { name: name.into(), ascending: false, nulls_first: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinKind {
    Inner,
    LeftOuter,
    RightOuter,
    Cross,
    /// Rows of the left argument with at least one match.
    Semi,
    /// Rows of the left argument without a match.
    Anti,
}

impl JoinKind {
    pub fn is_outer(self) -> bool {
        matches!(self, JoinKind::LeftOuter | JoinKind::RightOuter)
    }
}

/// Scalar expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Literal { value: Value, ty: ScalarType },
    Column {
        name: String,
        #[serde(default)]
        side: Option<JoinSide>,
    },
    Parameter { name: String, ty: ScalarType },
    /// Operator invocation; the device operator map decides how it is rendered.
    Call { operator: String, args: Vec<Expr>, ty: ScalarType },
    Case {
        when_then: Vec<(Expr, Expr)>,
        #[serde(default)]
        else_result: Option<Box<Expr>>,
        ty: ScalarType,
    },
    IsNull {
        operand: Box<Expr>,
        #[serde(default)]
        negated: bool,
    },
    Exists(Box<LogicalQueryPlan>),
    /// Scalar sub-select; the plan must yield one column.
    Subquery(Box<LogicalQueryPlan>),
    In {
        operand: Box<Expr>,
        plan: Box<LogicalQueryPlan>,
        #[serde(default)]
        negated: bool,
    },
}

impl Expr {
    pub fn column(name: impl Into<String>) -> Self {
        Expr::Column { name: name.into(), side: None }
    }

    pub fn left(name: impl Into<String>) -> Self {
        Expr::Column { name: name.into(), side: Some(JoinSide::Left) }
    }

    pub fn right(name: impl Into<String>) -> Self {
        Expr::Column { name: name.into(), side: Some(JoinSide::Right) }
    }

    pub fn literal(value: impl Into<Value>, ty: ScalarType) -> Self {
        Expr::Literal { value: value.into(), ty }
    }

    pub fn integer(i: i64) -> Self {
        Expr::literal(i, ScalarType::Integer)
    }

    pub fn string(s: &str) -> Self {
        Expr::literal(s, ScalarType::String)
    }

    pub fn boolean(b: bool) -> Self {
        Expr::literal(b, ScalarType::Boolean)
    }

    pub fn parameter(name: impl Into<String>, ty: ScalarType) -> Self {
        Expr::Parameter { name: name.into(), ty }
    }

    pub fn call(operator: impl Into<String>, args: Vec<Expr>, ty: ScalarType) -> Self {
        Expr::Call { operator: operator.into(), args, ty }
    }

    /// Boolean-valued binary operator call, e.g. `Expr::compare(">", a, b)`.
    pub fn compare(operator: &str, left: Expr, right: Expr) -> Self {
        Expr::call(operator, vec![left, right], ScalarType::Boolean)
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Expr::Literal { .. })
    }

    /// Names of unqualified and qualified column references, sub-plans excluded.
    pub fn column_references(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Column { name, .. } => out.push(name),
            Expr::Call { args, .. } => args.iter().for_each(|a| a.collect_columns(out)),
            Expr::Case { when_then, else_result, .. } => {
                for (w, t) in when_then {
                    w.collect_columns(out);
                    t.collect_columns(out);
                }
                if let Some(e) = else_result {
                    e.collect_columns(out);
                }
            }
            Expr::IsNull { operand, .. } | Expr::In { operand, .. } => operand.collect_columns(out),
            Expr::Literal { .. } | Expr::Parameter { .. } | Expr::Exists(_) | Expr::Subquery(_) => {}
        }
    }

    /// True when the expression embeds a sub-plan.
    pub fn has_sub_plan(&self) -> bool {
        match self {
            Expr::Exists(_) | Expr::Subquery(_) | Expr::In { .. } => true,
            Expr::Call { args, .. } => args.iter().any(Expr::has_sub_plan),
            Expr::Case { when_then, else_result, .. } => {
                when_then.iter().any(|(w, t)| w.has_sub_plan() || t.has_sub_plan())
                    || else_result.as_ref().is_some_and(|e| e.has_sub_plan())
            }
            Expr::IsNull { operand, .. } => operand.has_sub_plan(),
            Expr::Literal { .. } | Expr::Column { .. } | Expr::Parameter { .. } => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogicalQueryPlan {
    Retrieve { table: TableVar },
    Restrict { source: Box<LogicalQueryPlan>, condition: Expr },
    Project {
        source: Box<LogicalQueryPlan>,
        columns: Vec<String>,
        #[serde(default)]
        distinct: bool,
    },
    Extend { source: Box<LogicalQueryPlan>, columns: Vec<NamedExpr> },
    Rename { source: Box<LogicalQueryPlan>, columns: Vec<RenameColumn> },
    Aggregate {
        source: Box<LogicalQueryPlan>,
        group_by: Vec<String>,
        columns: Vec<AggregateColumn>,
    },
    Join {
        left: Box<LogicalQueryPlan>,
        right: Box<LogicalQueryPlan>,
        kind: JoinKind,
        /// `None` joins naturally on the common column names.
        #[serde(default)]
        condition: Option<Expr>,
    },
    Union {
        left: Box<LogicalQueryPlan>,
        right: Box<LogicalQueryPlan>,
        #[serde(default = "default_distinct")]
        distinct: bool,
    },
    Difference { left: Box<LogicalQueryPlan>, right: Box<LogicalQueryPlan> },
    Order { source: Box<LogicalQueryPlan>, columns: Vec<SortColumn> },
    TableSelector { columns: Vec<ColumnDef>, rows: Vec<Vec<Expr>> },
    RowSelector { columns: Vec<NamedExpr> },
    Insert { target: TableVar, source: Box<LogicalQueryPlan> },
    Update {
        target: TableVar,
        assignments: Vec<NamedExpr>,
        #[serde(default)]
        condition: Option<Expr>,
    },
    Delete {
        target: TableVar,
        #[serde(default)]
        condition: Option<Expr>,
    },
    CreateTable { table: TableVar },
    AlterTable {
        table: TableVar,
        #[serde(default)]
        add: Vec<ColumnDef>,
        #[serde(default)]
        drop: Vec<String>,
    },
    DropTable { table: TableVar },
}

fn default_distinct() -> bool {
    true
}

impl LogicalQueryPlan {
    pub fn retrieve(table: TableVar) -> Self {
        LogicalQueryPlan::Retrieve { table }
    }

    pub fn restrict(self, condition: Expr) -> Self {
        LogicalQueryPlan::Restrict { source: Box::new(self), condition }
    }

    pub fn project(self, columns: &[&str]) -> Self {
        LogicalQueryPlan::Project {
            source: Box::new(self),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            distinct: false,
        }
    }

    pub fn project_distinct(self, columns: &[&str]) -> Self {
        LogicalQueryPlan::Project {
            source: Box::new(self),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            distinct: true,
        }
    }

    pub fn extend(self, columns: Vec<NamedExpr>) -> Self {
        LogicalQueryPlan::Extend { source: Box::new(self), columns }
    }

    pub fn rename(self, pairs: &[(&str, &str)]) -> Self {
        LogicalQueryPlan::Rename {
            source: Box::new(self),
            columns: pairs
                .iter()
                .map(|(from, to)| RenameColumn { from: from.to_string(), to: to.to_string() })
                .collect(),
        }
    }

    pub fn aggregate(self, group_by: &[&str], columns: Vec<AggregateColumn>) -> Self {
        LogicalQueryPlan::Aggregate {
            source: Box::new(self),
            group_by: group_by.iter().map(|c| c.to_string()).collect(),
            columns,
        }
    }

    pub fn join(self, right: LogicalQueryPlan, kind: JoinKind, condition: Option<Expr>) -> Self {
        LogicalQueryPlan::Join { left: Box::new(self), right: Box::new(right), kind, condition }
    }

    pub fn union(self, right: LogicalQueryPlan) -> Self {
        LogicalQueryPlan::Union { left: Box::new(self), right: Box::new(right), distinct: true }
    }

    pub fn difference(self, right: LogicalQueryPlan) -> Self {
        LogicalQueryPlan::Difference { left: Box::new(self), right: Box::new(right) }
    }

    pub fn order(self, columns: Vec<SortColumn>) -> Self {
        LogicalQueryPlan::Order { source: Box::new(self), columns }
    }

    pub fn result_kind(&self) -> ResultKind {
        match self {
            LogicalQueryPlan::RowSelector { .. } => ResultKind::Row,
            LogicalQueryPlan::Insert { .. }
            | LogicalQueryPlan::Update { .. }
            | LogicalQueryPlan::Delete { .. }
            | LogicalQueryPlan::CreateTable { .. }
            | LogicalQueryPlan::AlterTable { .. }
            | LogicalQueryPlan::DropTable { .. } => ResultKind::Statement,
            _ => ResultKind::Table,
        }
    }

    /// Short operator name used in diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            LogicalQueryPlan::Retrieve { .. } => "retrieve",
            LogicalQueryPlan::Restrict { .. } => "restrict",
            LogicalQueryPlan::Project { .. } => "project",
            LogicalQueryPlan::Extend { .. } => "extend",
            LogicalQueryPlan::Rename { .. } => "rename",
            LogicalQueryPlan::Aggregate { .. } => "aggregate",
            LogicalQueryPlan::Join { .. } => "join",
            LogicalQueryPlan::Union { .. } => "union",
            LogicalQueryPlan::Difference { .. } => "difference",
            LogicalQueryPlan::Order { .. } => "order",
            LogicalQueryPlan::TableSelector { .. } => "table selector",
            LogicalQueryPlan::RowSelector { .. } => "row selector",
            LogicalQueryPlan::Insert { .. } => "insert",
            LogicalQueryPlan::Update { .. } => "update",
            LogicalQueryPlan::Delete { .. } => "delete",
            LogicalQueryPlan::CreateTable { .. } => "create table",
            LogicalQueryPlan::AlterTable { .. } => "alter table",
            LogicalQueryPlan::DropTable { .. } => "drop table",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_deserializes_from_json() {
        let json = r#"{
            "Restrict": {
                "source": { "Retrieve": { "table": {
                    "name": "Employee",
                    "columns": [
                        { "name": "ID", "ty": "Integer", "nullable": false },
                        { "name": "Age", "ty": "Integer" }
                    ],
                    "keys": [ { "columns": ["ID"] } ]
                } } },
                "condition": { "Call": {
                    "operator": ">",
                    "args": [
                        { "Column": { "name": "Age" } },
                        { "Literal": { "value": { "Integer": 30 }, "ty": "Integer" } }
                    ],
                    "ty": "Boolean"
                } }
            }
        }"#;
        let plan: LogicalQueryPlan = serde_json::from_str(json).unwrap();
        let LogicalQueryPlan::Restrict { source, condition } = &plan else { panic!("expected restrict") };
        let LogicalQueryPlan::Retrieve { table } = source.as_ref() else { panic!("expected retrieve") };
        assert_eq!(table.primary_key().unwrap().columns, vec!["ID".to_string()]);
        assert!(table.column("Age").unwrap().nullable);
        assert!(!table.column("ID").unwrap().nullable);
        assert_eq!(condition.column_references(), vec!["Age"]);
        assert_eq!(plan.result_kind(), ResultKind::Table);
    }

    #[test]
    fn sub_plans_are_detected_through_calls() {
        let inner = LogicalQueryPlan::retrieve(TableVar::new("T", vec![ColumnDef::new("A", ScalarType::Integer)]));
        let e = Expr::call("not", vec![Expr::Exists(Box::new(inner))], ScalarType::Boolean);
        assert!(e.has_sub_plan());
        assert!(!Expr::compare("=", Expr::column("A"), Expr::integer(1)).has_sub_plan());
    }
}
