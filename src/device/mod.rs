//! Device: the translator front door for one backend.
//!
//! A device pairs a dialect with its capability profile, scalar type maps and
//! operator map. Translation is stateless apart from the compiled-plan cache;
//! every compilation gets a fresh `DevicePlan`.

pub mod capabilities;
pub mod context;
pub mod operators;
pub mod plan;
pub mod translate;

use std::sync::Arc;

use log::debug;

use crate::config::DeviceConfig;
use crate::models::enums::DatabaseType;
use crate::query_ast::ast::Statement;
use crate::query_ast::emitter::dialect::{SqlDialect, get_dialect};
use crate::query_ast::emitter::{EmittedSql, emit_statement, format_sql};
use crate::query_ast::errors::QueryAstError;
use crate::query_ast::logical::LogicalQueryPlan;
use crate::query_ast::plan_cache::PlanCache;
use crate::scalar_types::TypeMapRegistry;

pub use capabilities::{CapabilityProfile, Clause, NullOrdering};
pub use operators::{BasicEvaluator, ConstantEvaluator, OperatorMap, OperatorMapping};
pub use plan::{DevicePlan, NodeStatus, OrderKey, PlanParameter, ResultColumn, TranslatedStatement};

/// A translated plan with its SQL for this device.
#[derive(Debug, Clone)]
pub struct PreparedPlan {
    pub translated: TranslatedStatement,
    pub sql: EmittedSql,
}

pub struct Device {
    dialect: Box<dyn SqlDialect>,
    profile: CapabilityProfile,
    type_maps: TypeMapRegistry,
    operators: OperatorMap,
    evaluator: Option<Arc<dyn ConstantEvaluator>>,
    cache: PlanCache<Arc<PreparedPlan>>,
    format_sql: bool,
}

impl Device {
    pub fn new(db_type: DatabaseType) -> Self {
        let dialect = get_dialect(&db_type);
        Self {
            profile: dialect.capabilities(),
            dialect,
            type_maps: TypeMapRegistry::for_dialect(db_type),
            operators: OperatorMap::for_dialect(db_type),
            evaluator: Some(Arc::new(BasicEvaluator)),
            cache: PlanCache::default(),
            format_sql: false,
        }
    }

    pub fn from_config(config: &DeviceConfig) -> Self {
        let mut device = Self::new(config.db_type()).with_profile(config.capability_profile());
        device.format_sql = config.format_sql;
        device
    }

    pub fn with_profile(mut self, profile: CapabilityProfile) -> Self {
        self.profile = profile;
        self.cache.clear();
        self
    }

    pub fn with_type_maps(mut self, type_maps: TypeMapRegistry) -> Self {
        self.type_maps = type_maps;
        self.cache.clear();
        self
    }

    pub fn with_operators(mut self, operators: OperatorMap) -> Self {
        self.operators = operators;
        self.cache.clear();
        self
    }

    /// `None` disables constant folding of unmapped operators.
    pub fn with_evaluator(mut self, evaluator: Option<Arc<dyn ConstantEvaluator>>) -> Self {
        self.evaluator = evaluator;
        self.cache.clear();
        self
    }

    pub fn db_type(&self) -> DatabaseType {
        self.dialect.db_type()
    }

    pub fn dialect(&self) -> &dyn SqlDialect {
        self.dialect.as_ref()
    }

    pub fn profile(&self) -> &CapabilityProfile {
        &self.profile
    }

    pub fn type_maps(&self) -> &TypeMapRegistry {
        &self.type_maps
    }

    pub fn operators(&self) -> &OperatorMap {
        &self.operators
    }

    /// Translates `plan`, collecting every unsupported construct on failure.
    pub fn translate(&self, plan: &LogicalQueryPlan) -> Result<TranslatedStatement, QueryAstError> {
        let device_plan = DevicePlan::new(&self.profile, &self.type_maps, &self.operators, self.evaluator.as_deref());
        let translated = translate::translate_plan(device_plan, plan)?;
        debug!("translated {} ({:?})", plan.kind_name(), translated.status);
        Ok(translated)
    }

    /// Translates and emits `plan`, reusing an earlier compilation when cached.
    pub fn prepare(&self, plan: &LogicalQueryPlan) -> Result<Arc<PreparedPlan>, QueryAstError> {
        let key = PlanCache::<Arc<PreparedPlan>>::key(plan, self.db_type());
        if let Some(entry) = key.as_deref().and_then(|k| self.cache.get(k)) {
            debug!("plan cache hit for {}", plan.kind_name());
            return Ok(entry);
        }
        let translated = self.translate(plan)?;
        let sql = self.emit(&translated.statement)?;
        let prepared = Arc::new(PreparedPlan { translated, sql });
        if let Some(key) = key {
            self.cache.insert(key, prepared.clone());
        }
        Ok(prepared)
    }

    pub fn emit(&self, statement: &Statement) -> Result<EmittedSql, QueryAstError> {
        let sql = emit_statement(statement, self.dialect.as_ref())?;
        if self.format_sql {
            debug!("SQL:\n{}", format_sql(&sql.text));
        } else {
            debug!("SQL: {}", sql.text);
        }
        Ok(sql)
    }

    pub fn cached_plans(&self) -> usize {
        self.cache.len()
    }
}
