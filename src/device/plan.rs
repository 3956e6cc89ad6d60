//! Per-compilation translation state.

use log::debug;

use crate::query_ast::ast::{NullsPlacement, Statement};
use crate::query_ast::errors::{Diagnostic, QueryAstError, Severity};
use crate::query_ast::logical::ResultKind;
use crate::scalar_types::{ScalarType, TypeMapRegistry};

use super::capabilities::CapabilityProfile;
use super::context::{ContextId, ContextTracker};
use super::operators::{ConstantEvaluator, OperatorMap};

/// Translation outcome of one plan node. Ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeStatus {
    Translating,
    Supported,
    /// Supported by folding constants the backend cannot evaluate.
    Fallback,
    Unsupported,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanParameter {
    pub name: String,
    pub ty: ScalarType,
}

/// A column of the translated result.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultColumn {
    pub name: String,
    pub alias: String,
    pub ty: ScalarType,
    /// Large object read through a deferred stream.
    pub deferred: bool,
}

/// A sort key of the result, used to restart the scan.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderKey {
    pub name: String,
    /// Position in the select list.
    pub index: usize,
    pub ascending: bool,
    /// Where NULL falls in the scan, when known.
    pub nulls: Option<NullsPlacement>,
    pub ty: ScalarType,
}

#[derive(Debug, Clone)]
pub struct TranslatedStatement {
    pub statement: Statement,
    pub kind: ResultKind,
    pub columns: Vec<ResultColumn>,
    pub order: Vec<OrderKey>,
    pub parameters: Vec<PlanParameter>,
    /// The outermost select groups, so restrictions belong in HAVING.
    pub is_aggregate: bool,
    pub status: NodeStatus,
    pub diagnostics: Vec<Diagnostic>,
}

impl TranslatedStatement {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn has_deferred_columns(&self) -> bool {
        self.columns.iter().any(|c| c.deferred)
    }
}

pub struct DevicePlan<'a> {
    pub profile: &'a CapabilityProfile,
    pub type_maps: &'a TypeMapRegistry,
    pub operators: &'a OperatorMap,
    pub evaluator: Option<&'a dyn ConstantEvaluator>,
    pub contexts: ContextTracker,
    join_contexts: Vec<(ContextId, ContextId)>,
    boolean_contexts: Vec<bool>,
    frames: Vec<NodeStatus>,
    is_supported: bool,
    diagnostics: Vec<Diagnostic>,
    alias_counter: usize,
    parameters: Vec<PlanParameter>,
}

impl<'a> DevicePlan<'a> {
    pub fn new(
        profile: &'a CapabilityProfile,
        type_maps: &'a TypeMapRegistry,
        operators: &'a OperatorMap,
        evaluator: Option<&'a dyn ConstantEvaluator>,
    ) -> Self {
        Self {
            profile,
            type_maps,
            operators,
            evaluator,
            contexts: ContextTracker::new(),
            join_contexts: Vec::new(),
            boolean_contexts: Vec::new(),
            frames: Vec::new(),
            is_supported: true,
            diagnostics: Vec::new(),
            alias_counter: 0,
            parameters: Vec::new(),
        }
    }

    pub fn next_table_alias(&mut self) -> String {
        self.alias_counter += 1;
        format!("T{}", self.alias_counter)
    }

    pub fn push_join_context(&mut self, left: ContextId, right: ContextId) {
        self.join_contexts.push((left, right));
    }

    pub fn pop_join_context(&mut self) {
        self.join_contexts.pop();
    }

    pub fn current_join_context(&self) -> Option<(ContextId, ContextId)> {
        self.join_contexts.last().copied()
    }

    pub fn push_boolean_context(&mut self, is_boolean: bool) {
        self.boolean_contexts.push(is_boolean);
    }

    pub fn pop_boolean_context(&mut self) {
        self.boolean_contexts.pop();
    }

    /// True when the expression being translated must be a truth value.
    pub fn is_boolean_context(&self) -> bool {
        self.boolean_contexts.last().copied().unwrap_or(false)
    }

    pub fn begin_node(&mut self) {
        self.frames.push(NodeStatus::Translating);
    }

    /// Closes the current node; its status folds into the enclosing node.
    pub fn end_node(&mut self) -> NodeStatus {
        let status = match self.frames.pop() {
            Some(NodeStatus::Translating) | None => NodeStatus::Supported,
            Some(status) => status,
        };
        if let Some(parent) = self.frames.last_mut()
            && status > NodeStatus::Supported
            && status > *parent
        {
            *parent = status;
        }
        status
    }

    fn mark(&mut self, status: NodeStatus) {
        if self.frames.is_empty() {
            self.frames.push(NodeStatus::Translating);
        }
        if let Some(frame) = self.frames.last_mut()
            && status > *frame
        {
            *frame = status;
        }
    }

    pub fn info(&mut self, message: impl Into<String>) {
        let message = message.into();
        debug!("translate: {}", message);
        self.diagnostics.push(Diagnostic::info(message));
    }

    pub fn fallback(&mut self, message: impl Into<String>) {
        self.mark(NodeStatus::Fallback);
        self.info(message);
    }

    /// Records an unsupported construct; translation carries on to find more.
    pub fn unsupported(&mut self, message: impl Into<String>) {
        let message = message.into();
        debug!("translate: unsupported: {}", message);
        self.mark(NodeStatus::Unsupported);
        self.is_supported = false;
        self.diagnostics.push(Diagnostic::unsupported(message));
    }

    pub fn is_supported(&self) -> bool {
        self.is_supported
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn add_parameter(&mut self, name: &str, ty: ScalarType) {
        if !self.parameters.iter().any(|p| p.name == name) {
            self.parameters.push(PlanParameter { name: name.to_string(), ty });
        }
    }

    pub fn parameters(&self) -> &[PlanParameter] {
        &self.parameters
    }

    /// Discards the statement if anything was unsupported.
    pub fn finish(
        self,
        statement: Statement,
        kind: ResultKind,
        columns: Vec<ResultColumn>,
        order: Vec<OrderKey>,
        is_aggregate: bool,
        status: NodeStatus,
    ) -> Result<TranslatedStatement, QueryAstError> {
        if !self.is_supported {
            return Err(QueryAstError::Unsupported { diagnostics: self.diagnostics });
        }
        debug_assert!(self.diagnostics.iter().all(|d| d.severity == Severity::Info));
        Ok(TranslatedStatement {
            statement,
            kind,
            columns,
            order,
            parameters: self.parameters,
            is_aggregate,
            status,
            diagnostics: self.diagnostics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::enums::DatabaseType;

    #[test]
    fn worst_status_propagates_to_the_parent() {
        let profile = CapabilityProfile::default();
        let maps = TypeMapRegistry::for_dialect(DatabaseType::Generic);
        let ops = OperatorMap::for_dialect(DatabaseType::Generic);
        let mut plan = DevicePlan::new(&profile, &maps, &ops, None);

        plan.begin_node();
        plan.begin_node();
        plan.fallback("folded");
        assert_eq!(plan.end_node(), NodeStatus::Fallback);
        plan.begin_node();
        assert_eq!(plan.end_node(), NodeStatus::Supported);
        assert_eq!(plan.end_node(), NodeStatus::Fallback);
        assert!(plan.is_supported());

        plan.begin_node();
        plan.unsupported("first");
        plan.unsupported("second");
        assert_eq!(plan.end_node(), NodeStatus::Unsupported);
        assert!(!plan.is_supported());
        assert_eq!(plan.diagnostics().len(), 3);
    }

    #[test]
    fn aliases_are_monotonic_per_plan() {
        let profile = CapabilityProfile::default();
        let maps = TypeMapRegistry::for_dialect(DatabaseType::Generic);
        let ops = OperatorMap::for_dialect(DatabaseType::Generic);
        let mut plan = DevicePlan::new(&profile, &maps, &ops, None);
        assert_eq!(plan.next_table_alias(), "T1");
        assert_eq!(plan.next_table_alias(), "T2");
        let mut again = DevicePlan::new(&profile, &maps, &ops, None);
        assert_eq!(again.next_table_alias(), "T1");
    }
}
