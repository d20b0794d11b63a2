//! Property tests for engine rollback and migration idempotence

use innkeep_store::engine::{ColumnDef, Filter, IndexDef, Statement, TableSchema, Values};
use innkeep_store::migration::{applied_migrations, MIGRATIONS_TABLE};
use innkeep_store::tables::default_migrations;
use innkeep_store::{Cell, ColumnType, Engine, MigrationRunner, StoreError};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Insert { name: String, nights: i64 },
    SetNights { id: i64, nights: i64 },
    Delete { id: i64 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        ("[A-Za-z ]{1,12}", 1..30i64).prop_map(|(name, nights)| Op::Insert { name, nights }),
        (1..20i64, 1..30i64).prop_map(|(id, nights)| Op::SetNights { id, nights }),
        (1..20i64).prop_map(|id| Op::Delete { id }),
    ]
}

fn statement(op: &Op) -> Statement {
    match op {
        Op::Insert { name, nights } => {
            let mut values = Values::new();
            values.insert("name".into(), Cell::from(name.as_str()));
            values.insert("nights".into(), Cell::Integer(*nights));
            Statement::insert("stays", values)
        }
        Op::SetNights { id, nights } => {
            let mut set = Values::new();
            set.insert("nights".into(), Cell::Integer(*nights));
            Statement::update("stays", set, Filter::all().eq("id", *id))
        }
        Op::Delete { id } => Statement::delete("stays", Filter::all().eq("id", *id)),
    }
}

fn failing_statement() -> Statement {
    let mut values = Values::new();
    values.insert("name".into(), Cell::from("Ghost"));
    values.insert("room_service_tab".into(), Cell::Integer(1));
    Statement::insert("stays", values)
}

fn engine_with(seed: &[Op]) -> Engine {
    let mut engine = Engine::new().unwrap();
    engine
        .execute(Statement::create_table(
            TableSchema::new("stays")
                .column(ColumnDef::new("name", ColumnType::Text).not_null())
                .column(ColumnDef::new("nights", ColumnType::Integer)),
        ))
        .unwrap();
    engine
        .execute(Statement::create_index(IndexDef::new(
            "idx_stays_name",
            "stays",
            &["name"],
        )))
        .unwrap();
    for op in seed {
        engine.execute(statement(op)).unwrap();
    }
    engine
}

proptest! {
    #[test]
    fn failed_transaction_restores_exact_state(
        seed in prop::collection::vec(op_strategy(), 0..12),
        ops in prop::collection::vec(op_strategy(), 2..16),
    ) {
        let mut engine = engine_with(&seed);
        let before = engine.export().unwrap();

        let fail_at = ops.len() / 2;
        engine.begin().unwrap();
        for (index, op) in ops.iter().enumerate() {
            if index == fail_at {
                let result = engine.execute(failing_statement());
                prop_assert!(
                    matches!(result, Err(StoreError::UnknownColumn { .. })),
                    "expected unknown column, got {:?}",
                    result
                );
                break;
            }
            engine.execute(statement(op)).unwrap();
        }
        engine.rollback().unwrap();

        prop_assert_eq!(engine.export().unwrap(), before);
        prop_assert!(!engine.in_transaction());
    }

    #[test]
    fn committed_transaction_survives_reimport(
        ops in prop::collection::vec(op_strategy(), 1..16),
    ) {
        let mut engine = engine_with(&[]);
        engine.begin().unwrap();
        for op in &ops {
            engine.execute(statement(op)).unwrap();
        }
        engine.commit().unwrap();

        let exported = engine.export().unwrap();
        let reloaded = Engine::from_snapshot(&exported).unwrap();
        prop_assert_eq!(reloaded.export().unwrap(), exported);
        prop_assert_eq!(reloaded.row_count("stays").unwrap(), engine.row_count("stays").unwrap());
    }

    #[test]
    fn repeated_migration_runs_change_nothing(runs in 2usize..5) {
        let mut engine = Engine::new().unwrap();
        let first = MigrationRunner::new(default_migrations()).run(&mut engine).unwrap();
        prop_assert_eq!(first.applied.len(), 2);
        let after_first = engine.export().unwrap();

        for _ in 1..runs {
            let report = MigrationRunner::new(default_migrations()).run(&mut engine).unwrap();
            prop_assert!(report.applied.is_empty());
            prop_assert_eq!(report.skipped.len(), 2);
        }

        prop_assert_eq!(engine.export().unwrap(), after_first);
        prop_assert_eq!(engine.row_count(MIGRATIONS_TABLE).unwrap(), 2);
        prop_assert_eq!(
            applied_migrations(&engine).unwrap(),
            vec!["001_create_core_tables".to_string(), "002_create_indexes".to_string()]
        );
    }
}
