//! Capability profile: the flags describing what a target SQL dialect supports.
//! Every nesting and translation rule consults the profile; a new backend is a
//! new profile plus a `SqlDialect`, never a fork of the translator.

use serde::{Deserialize, Serialize};

use crate::models::enums::DatabaseType;
use crate::query_ast::ast::NullsPlacement;

/// Where the backend sorts NULL in an ascending scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NullOrdering {
    #[default]
    Unspecified,
    NullsFirst,
    NullsLast,
}

impl NullOrdering {
    /// Placement of NULL in the scan order for a column sorted in `ascending` direction.
    pub fn placement(self, ascending: bool) -> Option<NullsPlacement> {
        match (self, ascending) {
            (NullOrdering::Unspecified, _) => None,
            (NullOrdering::NullsFirst, true) | (NullOrdering::NullsLast, false) => Some(NullsPlacement::First),
            (NullOrdering::NullsFirst, false) | (NullOrdering::NullsLast, true) => Some(NullsPlacement::Last),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clause {
    Select,
    Where,
    GroupBy,
    Having,
}

impl Clause {
    pub fn name(self) -> &'static str {
        match self {
            Clause::Select => "select",
            Clause::Where => "where",
            Clause::GroupBy => "group by",
            Clause::Having => "having",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityProfile {
    pub supports_nested_from: bool,
    pub supports_nested_correlation: bool,
    pub supports_sub_select_in_select_clause: bool,
    pub supports_sub_select_in_where_clause: bool,
    pub supports_sub_select_in_group_by_clause: bool,
    pub supports_sub_select_in_having_clause: bool,
    pub supports_order_by_expressions: bool,
    pub supports_order_by_nulls_first_last: bool,
    /// ORDER BY refers to range-variable expressions rather than select-list aliases.
    pub is_order_by_in_context: bool,
    pub uses_values_clause_in_insert: bool,
    pub max_identifier_length: usize,
    pub supports_native_boolean: bool,
    pub null_ordering: NullOrdering,
}

impl Default for CapabilityProfile {
    fn default() -> Self {
        Self {
            supports_nested_from: true,
            supports_nested_correlation: true,
            supports_sub_select_in_select_clause: true,
            supports_sub_select_in_where_clause: true,
            supports_sub_select_in_group_by_clause: false,
            supports_sub_select_in_having_clause: true,
            supports_order_by_expressions: true,
            supports_order_by_nulls_first_last: true,
            is_order_by_in_context: true,
            uses_values_clause_in_insert: true,
            max_identifier_length: 128,
            supports_native_boolean: false,
            null_ordering: NullOrdering::Unspecified,
        }
    }
}

impl CapabilityProfile {
    pub fn for_dialect(db_type: DatabaseType) -> Self {
        let base = Self::default();
        match db_type {
            DatabaseType::Generic => base,
            DatabaseType::SQLite => Self { null_ordering: NullOrdering::NullsFirst, ..base },
            DatabaseType::PostgreSQL => Self {
                max_identifier_length: 63,
                supports_native_boolean: true,
                null_ordering: NullOrdering::NullsLast,
                ..base
            },
            DatabaseType::MySQL => Self {
                supports_nested_correlation: false,
                supports_order_by_nulls_first_last: false,
                max_identifier_length: 64,
                null_ordering: NullOrdering::NullsFirst,
                ..base
            },
            DatabaseType::MsSQL => Self {
                supports_order_by_nulls_first_last: false,
                is_order_by_in_context: false,
                null_ordering: NullOrdering::NullsFirst,
                ..base
            },
        }
    }

    pub fn allows_sub_select_in(&self, clause: Clause) -> bool {
        match clause {
            Clause::Select => self.supports_sub_select_in_select_clause,
            Clause::Where => self.supports_sub_select_in_where_clause,
            Clause::GroupBy => self.supports_sub_select_in_group_by_clause,
            Clause::Having => self.supports_sub_select_in_having_clause,
        }
    }

    /// Truncates `name` to the identifier limit, keeping it unique against `taken`.
    pub fn shorten_identifier(&self, name: &str, taken: &[String]) -> String {
        let limit = self.max_identifier_length.max(8);
        if name.chars().count() <= limit && !taken.iter().any(|t| t == name) {
            return name.to_string();
        }
        let mut counter = 1usize;
        loop {
            let suffix = counter.to_string();
            let stem: String = name.chars().take(limit.saturating_sub(suffix.len())).collect();
            let candidate = format!("{}{}", stem, suffix);
            if !taken.iter().any(|t| *t == candidate) {
                return candidate;
            }
            counter += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_deserialize_partially() {
        let profile: CapabilityProfile =
            serde_json::from_str(r#"{ "supports_sub_select_in_where_clause": false, "null_ordering": "NullsLast" }"#)
                .unwrap();
        assert!(!profile.supports_sub_select_in_where_clause);
        assert!(profile.supports_nested_from);
        assert_eq!(profile.null_ordering, NullOrdering::NullsLast);
    }

    #[test]
    fn null_placement_follows_direction() {
        assert_eq!(NullOrdering::NullsFirst.placement(true), Some(NullsPlacement::First));
        assert_eq!(NullOrdering::NullsFirst.placement(false), Some(NullsPlacement::Last));
        assert_eq!(NullOrdering::NullsLast.placement(false), Some(NullsPlacement::First));
        assert_eq!(NullOrdering::Unspecified.placement(true), None);
    }

    #[test]
    fn long_identifiers_are_shortened_uniquely() {
        let profile = CapabilityProfile { max_identifier_length: 10, ..Default::default() };
        let first = profile.shorten_identifier("VeryLongColumnName", &[]);
        assert_eq!(first, "VeryLongC1");
        let second = profile.shorten_identifier("VeryLongColumnName", &[first.clone()]);
        assert_eq!(second, "VeryLongC2");
        assert_eq!(profile.shorten_identifier("Short", &[]), "Short");
    }
}
