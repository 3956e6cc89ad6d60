use std::sync::Arc;

use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;

use sqldevice::device::{CapabilityProfile, Device};
use sqldevice::models::enums::DatabaseType;
use sqldevice::query_ast::validate::check_references;
use sqldevice::query_ast::{AggregateColumn, ColumnDef, Expr, JoinKind, LogicalQueryPlan, SortColumn, TableVar};
use sqldevice::scalar_types::ScalarType;

fn items() -> LogicalQueryPlan {
    LogicalQueryPlan::retrieve(
        TableVar::new(
            "Items",
            vec![ColumnDef::new("ID", ScalarType::Integer).not_null(), ColumnDef::new("Name", ScalarType::String)],
        )
        .with_key(&["ID"]),
    )
}

fn orders() -> LogicalQueryPlan {
    LogicalQueryPlan::retrieve(TableVar::new(
        "Orders",
        vec![
            ColumnDef::new("OrderID", ScalarType::Integer).not_null(),
            ColumnDef::new("ItemID", ScalarType::Integer),
            ColumnDef::new("Qty", ScalarType::Integer),
        ],
    ))
}

fn ordered_item() -> Expr {
    Expr::compare("=", Expr::left("ID"), Expr::right("ItemID"))
}

/// Emits `plan` for SQLite and checks the SQL is well formed and self-contained.
fn sqlite_sql(device: &Device, plan: &LogicalQueryPlan) -> String {
    let prepared = device.prepare(plan).unwrap();
    check_references(&prepared.translated.statement).unwrap();
    let text = prepared.sql.text.clone();
    Parser::parse_sql(&SQLiteDialect {}, &text).unwrap_or_else(|e| panic!("{}: {}", e, text));
    text
}

fn without_where_sub_selects() -> Device {
    let profile = CapabilityProfile { supports_sub_select_in_where_clause: false, ..CapabilityProfile::default() };
    Device::new(DatabaseType::SQLite).with_profile(profile)
}

#[test]
fn sub_select_in_where_is_unsupported() {
    let device = without_where_sub_selects();
    let plan = items().restrict(Expr::Exists(Box::new(orders())));
    let err = device.translate(&plan).unwrap_err();
    let messages = err.unsupported_messages();
    assert!(!messages.is_empty());
    assert!(messages.iter().any(|m| m.contains("sub-select not allowed")), "{:?}", messages);
}

#[test]
fn every_unsupported_construct_is_reported() {
    let device = Device::new(DatabaseType::SQLite);
    let plan = items()
        .restrict(Expr::compare("=", Expr::column("Missing"), Expr::integer(1)))
        .aggregate(
            &["Name"],
            vec![AggregateColumn {
                name: "Median".into(),
                function: "median".into(),
                argument: Some("ID".into()),
                distinct: false,
                ty: ScalarType::Integer,
            }],
        );
    let err = device.translate(&plan).unwrap_err();
    assert!(err.unsupported_messages().len() >= 2, "{}", err);
}

#[test]
fn translating_twice_yields_identical_trees() {
    let device = Device::new(DatabaseType::SQLite);
    let plan = items()
        .join(orders(), JoinKind::Inner, Some(ordered_item()))
        .restrict(Expr::compare(">", Expr::column("Qty"), Expr::integer(2)))
        .order(vec![SortColumn::asc("ID"), SortColumn::desc("OrderID")]);
    let first = device.translate(&plan).unwrap();
    let second = device.translate(&plan).unwrap();
    assert_eq!(first.statement, second.statement);
    assert_eq!(first.order, second.order);
    assert_eq!(device.emit(&first.statement).unwrap(), device.emit(&second.statement).unwrap());
}

#[test]
fn prepared_plans_are_cached_per_device() {
    let device = Device::new(DatabaseType::SQLite);
    let plan = items().order(vec![SortColumn::asc("ID")]);
    let first = device.prepare(&plan).unwrap();
    let second = device.prepare(&plan).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(device.cached_plans(), 1);
}

#[test]
fn inner_join_on_condition() {
    let device = Device::new(DatabaseType::SQLite);
    let sql = sqlite_sql(&device, &items().join(orders(), JoinKind::Inner, Some(ordered_item())));
    assert!(sql.contains("INNER JOIN"), "{}", sql);
    assert!(sql.contains(" ON "), "{}", sql);
}

#[test]
fn left_outer_join_keeps_both_column_sets() {
    let device = Device::new(DatabaseType::SQLite);
    let plan = items().join(orders(), JoinKind::LeftOuter, Some(ordered_item()));
    let sql = sqlite_sql(&device, &plan);
    assert!(sql.contains("LEFT OUTER JOIN"), "{}", sql);
    let translated = device.translate(&plan).unwrap();
    let names: Vec<_> = translated.columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["ID", "Name", "OrderID", "ItemID", "Qty"]);
}

#[test]
fn semi_join_uses_exists_when_allowed() {
    let device = Device::new(DatabaseType::SQLite);
    let sql = sqlite_sql(&device, &items().join(orders(), JoinKind::Semi, Some(ordered_item())));
    assert!(sql.contains("EXISTS ("), "{}", sql);
    assert!(!sql.contains("JOIN"), "{}", sql);
}

#[test]
fn semi_join_falls_back_to_a_distinct_join() {
    let device = without_where_sub_selects();
    let plan = items().join(orders(), JoinKind::Semi, Some(ordered_item()));
    let sql = sqlite_sql(&device, &plan);
    assert!(sql.starts_with("SELECT DISTINCT"), "{}", sql);
    assert!(sql.contains("INNER JOIN"), "{}", sql);
    assert!(!sql.contains("EXISTS"), "{}", sql);
    assert_eq!(device.translate(&plan).unwrap().columns.len(), 2);
}

#[test]
fn anti_join_falls_back_to_an_outer_join_marker() {
    let device = without_where_sub_selects();
    let sql = sqlite_sql(&device, &items().join(orders(), JoinKind::Anti, Some(ordered_item())));
    assert!(sql.contains("LEFT OUTER JOIN"), "{}", sql);
    assert!(sql.contains("IS NULL"), "{}", sql);
    assert!(!sql.contains("NOT EXISTS"), "{}", sql);
}

#[test]
fn union_of_projections() {
    let device = Device::new(DatabaseType::SQLite);
    let plan = items().project(&["ID"]).union(orders().rename(&[("ItemID", "ID")]).project(&["ID"]));
    let sql = sqlite_sql(&device, &plan);
    assert!(sql.contains(" UNION SELECT "), "{}", sql);
}

#[test]
fn difference_uses_the_dialect_keyword() {
    let device = Device::new(DatabaseType::SQLite);
    let plan = items().project(&["ID"]).difference(orders().rename(&[("ItemID", "ID")]).project(&["ID"]));
    let sql = sqlite_sql(&device, &plan);
    assert!(sql.contains(" EXCEPT "), "{}", sql);
}

#[test]
fn union_with_mismatched_columns_is_unsupported() {
    let device = Device::new(DatabaseType::SQLite);
    let plan = items().union(orders());
    assert!(device.translate(&plan).is_err());
}

#[test]
fn aggregate_groups_and_counts() {
    let device = Device::new(DatabaseType::SQLite);
    let plan = orders().aggregate(
        &["ItemID"],
        vec![
            AggregateColumn {
                name: "Orders".into(),
                function: "count".into(),
                argument: None,
                distinct: false,
                ty: ScalarType::Integer,
            },
            AggregateColumn {
                name: "Total".into(),
                function: "sum".into(),
                argument: Some("Qty".into()),
                distinct: false,
                ty: ScalarType::Integer,
            },
        ],
    );
    let sql = sqlite_sql(&device, &plan);
    assert!(sql.contains("COUNT(*)"), "{}", sql);
    assert!(sql.contains("GROUP BY"), "{}", sql);
    assert!(device.translate(&plan).unwrap().is_aggregate);
}

#[test]
fn restriction_over_an_aggregate_lands_in_having() {
    let device = Device::new(DatabaseType::SQLite);
    let plan = orders()
        .aggregate(
            &["ItemID"],
            vec![AggregateColumn {
                name: "Total".into(),
                function: "sum".into(),
                argument: Some("Qty".into()),
                distinct: false,
                ty: ScalarType::Integer,
            }],
        )
        .restrict(Expr::compare(">", Expr::column("Total"), Expr::integer(10)));
    let sql = sqlite_sql(&device, &plan);
    assert!(sql.contains("HAVING"), "{}", sql);
}

#[test]
fn insert_from_a_table_selector_uses_values() {
    let device = Device::new(DatabaseType::SQLite);
    let target = TableVar::new(
        "Items",
        vec![ColumnDef::new("ID", ScalarType::Integer), ColumnDef::new("Name", ScalarType::String)],
    );
    let plan = LogicalQueryPlan::Insert {
        target: target.clone(),
        source: Box::new(LogicalQueryPlan::TableSelector {
            columns: target.columns.clone(),
            rows: vec![vec![Expr::integer(1), Expr::string("one")], vec![Expr::integer(2), Expr::string("two")]],
        }),
    };
    let sql = sqlite_sql(&device, &plan);
    assert!(sql.starts_with("INSERT INTO"), "{}", sql);
    assert!(sql.contains("VALUES"), "{}", sql);
}

#[test]
fn plans_arrive_as_json() {
    let json = r#"{ "Order": {
        "source": { "Retrieve": { "table": { "name": "Items", "columns": [
            { "name": "ID", "ty": "Integer", "nullable": false },
            { "name": "Body", "ty": "Text" }
        ] } } },
        "columns": [ { "name": "ID" } ]
    } }"#;
    let plan: LogicalQueryPlan = serde_json::from_str(json).unwrap();
    let device = Device::new(DatabaseType::PostgreSQL);
    let translated = device.translate(&plan).unwrap();
    assert_eq!(translated.order.len(), 1);
    assert!(translated.has_deferred_columns());
    assert_eq!(translated.column_index("Body"), Some(1));
}

#[test]
fn unknown_null_order_is_pinned_explicitly() {
    let device = Device::new(DatabaseType::SQLite).with_profile(CapabilityProfile::default());
    let sql = sqlite_sql(&device, &items().order(vec![SortColumn::desc("Name")]));
    assert!(sql.contains("DESC NULLS FIRST"), "{}", sql);
}

#[test]
fn null_placement_without_the_keyword_sorts_on_a_null_rank() {
    let profile = CapabilityProfile { supports_order_by_nulls_first_last: false, ..CapabilityProfile::for_dialect(DatabaseType::SQLite) };
    let device = Device::new(DatabaseType::SQLite).with_profile(profile);
    let last = SortColumn { nulls_first: Some(false), ..SortColumn::asc("Name") };
    let sql = sqlite_sql(&device, &items().order(vec![last]));
    assert!(sql.contains("ORDER BY CASE WHEN"), "{}", sql);
    assert!(!sql.contains("NULLS"), "{}", sql);
}
