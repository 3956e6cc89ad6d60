//! Query context tracker.
//!
//! Contexts live in an arena and point at their parent by index only. The
//! stack records which contexts are currently being translated into.

use crate::query_ast::ast::{Expression, QualifiedColumn};
use crate::scalar_types::ScalarType;

use super::capabilities::Clause;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub usize);

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnSource {
    /// `alias.column` of a range variable in FROM.
    Reference(QualifiedColumn),
    /// Computed ("added") column.
    Computed(Expression),
}

/// Binding of one logical column inside a query context.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeVariableColumn {
    pub name: String,
    pub source: ColumnSource,
    /// Select-list alias.
    pub alias: String,
    pub ty: ScalarType,
}

impl RangeVariableColumn {
    pub fn reference(name: impl Into<String>, table: &str, column: &str, ty: ScalarType) -> Self {
        let name = name.into();
        Self {
            alias: name.clone(),
            name,
            source: ColumnSource::Reference(QualifiedColumn { table: Some(table.to_string()), name: column.to_string() }),
            ty,
        }
    }

    pub fn computed(name: impl Into<String>, expression: Expression, ty: ScalarType) -> Self {
        let name = name.into();
        Self { alias: name.clone(), name, source: ColumnSource::Computed(expression), ty }
    }

    /// Expression to use when this column is referenced inside its context.
    pub fn expression(&self) -> Expression {
        match &self.source {
            ColumnSource::Reference(q) => Expression::Column(q.clone()),
            ColumnSource::Computed(e) => e.clone(),
        }
    }

    pub fn is_computed(&self) -> bool {
        matches!(self.source, ColumnSource::Computed(_))
    }

    pub fn has_sub_select(&self) -> bool {
        matches!(&self.source, ColumnSource::Computed(e) if e.contains_sub_select())
    }
}

/// A named source in a FROM clause and the physical columns it exposes.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeVariable {
    pub alias: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReferenceFlags {
    pub has_aggregate: bool,
    pub has_sub_select: bool,
    pub has_correlation: bool,
    pub has_parameters: bool,
}

#[derive(Debug, Clone)]
pub struct QueryContext {
    pub parent: Option<ContextId>,
    pub range_variables: Vec<RangeVariable>,
    /// Visible columns in select-list order.
    pub columns: Vec<RangeVariableColumn>,
    pub is_scalar_context: bool,
    pub is_nested_from: bool,
    pub is_aggregate: bool,
    pub is_list_context: bool,
    pub clause: Clause,
    pub references: ReferenceFlags,
}

impl QueryContext {
    fn new(parent: Option<ContextId>, nested_from: bool, scalar: bool) -> Self {
        Self {
            parent,
            range_variables: Vec::new(),
            columns: Vec::new(),
            is_scalar_context: scalar,
            is_nested_from: nested_from,
            is_aggregate: false,
            is_list_context: false,
            clause: Clause::Select,
            references: ReferenceFlags::default(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&RangeVariableColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn aliases(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.alias.clone()).collect()
    }

    pub fn added_columns(&self) -> impl Iterator<Item = &RangeVariableColumn> {
        self.columns.iter().filter(|c| c.is_computed())
    }

    pub fn add_column(&mut self, column: RangeVariableColumn) {
        self.columns.push(column);
    }

    /// Detaches the binding for `old`; the caller re-adds it under its new name
    /// once every rename of the same operation has been detached.
    pub fn rename(&mut self, old: &str) -> Option<(usize, RangeVariableColumn)> {
        let index = self.columns.iter().position(|c| c.name == old)?;
        Some((index, self.columns.remove(index)))
    }

    /// Drops bindings whose names are not in `keep`, reordering to match it.
    pub fn project_columns(&mut self, keep: &[String]) {
        let mut kept = Vec::with_capacity(keep.len());
        for name in keep {
            if let Some(pos) = self.columns.iter().position(|c| &c.name == name) {
                kept.push(self.columns.swap_remove(pos));
            }
        }
        self.columns = kept;
    }
}

/// Outcome of a column lookup.
#[derive(Debug, Clone)]
pub struct ResolvedColumn {
    pub context: ContextId,
    pub column: RangeVariableColumn,
    /// Found outside the originating context.
    pub correlated: bool,
}

#[derive(Debug, Default)]
pub struct ContextTracker {
    arena: Vec<QueryContext>,
    stack: Vec<ContextId>,
}

impl ContextTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<ContextId> {
        self.stack.last().copied()
    }

    /// Creates a context under `parent` without entering it.
    pub fn create(&mut self, parent: Option<ContextId>, nested_from: bool, scalar: bool) -> ContextId {
        let id = ContextId(self.arena.len());
        self.arena.push(QueryContext::new(parent, nested_from, scalar));
        id
    }

    /// Creates a child of the current context and enters it.
    pub fn push(&mut self, nested_from: bool, scalar: bool) -> ContextId {
        let id = self.create(self.current(), nested_from, scalar);
        self.stack.push(id);
        id
    }

    /// Re-enters an existing context.
    pub fn enter(&mut self, id: ContextId) {
        self.stack.push(id);
    }

    pub fn pop(&mut self) -> Option<ContextId> {
        self.stack.pop()
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn get(&self, id: ContextId) -> &QueryContext {
        &self.arena[id.0]
    }

    pub fn get_mut(&mut self, id: ContextId) -> &mut QueryContext {
        &mut self.arena[id.0]
    }

    /// Moves `child` under `parent` as a nested FROM source.
    pub fn reparent_nested(&mut self, child: ContextId, parent: ContextId) {
        let ctx = self.get_mut(child);
        ctx.parent = Some(parent);
        ctx.is_nested_from = true;
    }

    /// Resolves `name` starting at the current context, walking outward unless
    /// `current_context_only`. Stepping out of a nested FROM is only allowed
    /// when `nested_correlation` is permitted. A hit outside the originating
    /// context marks it as correlated.
    pub fn find_column(&mut self, name: &str, current_context_only: bool, nested_correlation: bool) -> Option<ResolvedColumn> {
        let origin = self.current()?;
        let mut id = origin;
        loop {
            let ctx = self.get(id);
            if let Some(column) = ctx.column(name) {
                let column = column.clone();
                let correlated = id != origin;
                if correlated {
                    self.get_mut(origin).references.has_correlation = true;
                }
                return Some(ResolvedColumn { context: id, column, correlated });
            }
            if current_context_only || (ctx.is_nested_from && !nested_correlation) {
                return None;
            }
            id = ctx.parent?;
        }
    }

    /// Contexts from the current one outward, for diagnostics and clause checks.
    pub fn ancestry(&self) -> Vec<ContextId> {
        let mut out = Vec::new();
        let mut next = self.current();
        while let Some(id) = next {
            out.push(id);
            next = self.get(id).parent;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker_with_outer() -> (ContextTracker, ContextId) {
        let mut tracker = ContextTracker::new();
        let outer = tracker.push(false, false);
        tracker
            .get_mut(outer)
            .add_column(RangeVariableColumn::reference("DeptID", "T1", "DeptID", ScalarType::Integer));
        (tracker, outer)
    }

    #[test]
    fn correlation_is_flagged_on_the_originating_context() {
        let (mut tracker, outer) = tracker_with_outer();
        let scalar = tracker.push(false, true);
        let inner = tracker.push(false, false);
        tracker.get_mut(inner).add_column(RangeVariableColumn::reference("ID", "T2", "ID", ScalarType::Integer));

        let local = tracker.find_column("ID", false, true).unwrap();
        assert!(!local.correlated);
        assert!(!tracker.get(inner).references.has_correlation);

        let outer_hit = tracker.find_column("DeptID", false, true).unwrap();
        assert!(outer_hit.correlated);
        assert_eq!(outer_hit.context, outer);
        assert!(tracker.get(inner).references.has_correlation);
        assert!(!tracker.get(scalar).references.has_correlation);

        assert!(tracker.find_column("DeptID", true, true).is_none());
    }

    #[test]
    fn nested_from_blocks_correlation_unless_permitted() {
        let (mut tracker, _outer) = tracker_with_outer();
        let nested = tracker.push(true, false);
        assert!(tracker.find_column("DeptID", false, false).is_none());
        assert!(tracker.find_column("DeptID", false, true).is_some());
        assert_eq!(tracker.pop(), Some(nested));
    }

    #[test]
    fn cyclic_rename_detaches_before_reinserting() {
        let mut tracker = ContextTracker::new();
        let id = tracker.push(false, false);
        let ctx = tracker.get_mut(id);
        ctx.add_column(RangeVariableColumn::reference("A", "T1", "A", ScalarType::Integer));
        ctx.add_column(RangeVariableColumn::reference("B", "T1", "B", ScalarType::String));

        let mut detached = vec![("A", "B", ctx.rename("A").unwrap()), ("B", "A", ctx.rename("B").unwrap())];
        detached.sort_by_key(|(_, _, (index, _))| *index);
        for (_, new, (index, mut column)) in detached {
            column.name = new.to_string();
            column.alias = new.to_string();
            ctx.columns.insert(index.min(ctx.columns.len()), column);
        }

        let a = ctx.column("A").unwrap();
        assert_eq!(a.ty, ScalarType::String);
        assert_eq!(a.expression(), Expression::column(Some("T1"), "B"));
        assert_eq!(ctx.column("B").unwrap().ty, ScalarType::Integer);
    }

    #[test]
    fn project_columns_prunes_and_reorders() {
        let mut tracker = ContextTracker::new();
        let id = tracker.push(false, false);
        let ctx = tracker.get_mut(id);
        for name in ["A", "B", "C"] {
            ctx.add_column(RangeVariableColumn::reference(name, "T1", name, ScalarType::Integer));
        }
        ctx.project_columns(&["C".to_string(), "A".to_string()]);
        assert_eq!(ctx.column_names(), vec!["C", "A"]);
    }
}
