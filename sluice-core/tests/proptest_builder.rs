use proptest::prelude::*;
use serde_json::{json, Value};
use sluice_core::{Params, QueryBuilder, TableSchema, UpdateValue};

// Identifiers that never collide with SQL keywords used by the builder
fn arb_field() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,10}".prop_map(|s| format!("c_{}", s))
}

fn arb_scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(|b| json!(b)),
        any::<i64>().prop_map(|n| json!(n)),
        "[ -~]{0,20}".prop_map(|s| json!(s)),
    ]
}

proptest! {
    /// Property: a single where() yields one fragment and one parameter equal to the value
    #[test]
    fn prop_where_binds_exactly_once(field in arb_field(), value in arb_scalar()) {
        let mut q = QueryBuilder::new("t");
        q.where_(&field, value.clone());
        let stmt = q.select().unwrap();

        prop_assert_eq!(stmt.sql(), format!("SELECT * FROM t WHERE {} = :{}", field, field));
        prop_assert_eq!(stmt.params(), &Params::Named(vec![(field.clone(), value)]));
    }

    /// Property: repeating where() on a field keeps one entry with the last value
    #[test]
    fn prop_where_last_value_wins(field in arb_field(), values in prop::collection::vec(arb_scalar(), 1..6)) {
        let mut q = QueryBuilder::new("t");
        for value in &values {
            q.where_(&field, value.clone());
        }
        let stmt = q.select().unwrap();
        prop_assert_eq!(stmt.params().len(), 1);
        prop_assert_eq!(stmt.params().get(&field), values.last());
    }

    /// Property: distinct fields, whatever their spelling, bind under distinct names in order
    #[test]
    fn prop_distinct_fields_bind_distinct_names(
        fields in prop::collection::btree_set("[a-z_\\-.名字年龄]{1,4}", 1..8),
    ) {
        let mut q = QueryBuilder::new("t");
        let mut expected = Vec::new();
        for (i, field) in fields.iter().enumerate() {
            q.where_(field, i as i64);
            expected.push(json!(i as i64));
        }
        let stmt = q.select().unwrap();

        let names: std::collections::HashSet<&str> = match stmt.params() {
            Params::Named(pairs) => pairs.iter().map(|(n, _)| n.as_str()).collect(),
            Params::Positional(_) => std::collections::HashSet::new(),
        };
        prop_assert_eq!(names.len(), fields.len());
        let (_, values) = stmt.to_positional().unwrap();
        prop_assert_eq!(values, expected);
    }

    /// Property: after reset() a chain compiles exactly like on a fresh builder
    #[test]
    fn prop_reset_matches_fresh_builder(
        noise in prop::collection::vec((arb_field(), arb_scalar()), 0..5),
        field in arb_field(),
        value in arb_scalar(),
        limit in 1u64..100,
        join in any::<bool>(),
    ) {
        let mut reused = QueryBuilder::new("t");
        for (f, v) in &noise {
            reused.where_(f, v.clone()).fields(f).order_by(f, Default::default());
        }
        if join {
            reused.left_join("u", "u", "t.id = u.t_id");
        }
        reused.distinct().limit(3).allow_unconditional_writes();
        reused.reset();
        reused.where_(&field, value.clone()).limit(limit);

        let mut fresh = QueryBuilder::new("t");
        fresh.where_(&field, value).limit(limit);

        prop_assert_eq!(reused.select().unwrap(), fresh.select().unwrap());
        prop_assert_eq!(reused.delete().unwrap(), fresh.delete().unwrap());
    }

    /// Property: unknown insert fields never reach SQL or params, and filtering is idempotent
    #[test]
    fn prop_insert_filters_unknown_columns(
        known in prop::collection::btree_map(arb_field(), arb_scalar(), 1..5),
        unknown in prop::collection::btree_map("[a-z]{1,8}".prop_map(|s| format!("x_{}", s)), arb_scalar(), 0..5),
    ) {
        let schema = TableSchema::from_names("t", known.keys().cloned());
        let q = QueryBuilder::new("t").with_schema(schema);

        let mixed: Vec<(String, Value)> = known
            .iter()
            .chain(unknown.iter())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let filtered = q.insert_one(mixed).unwrap();
        let clean = q.insert_one(known.clone()).unwrap();

        prop_assert_eq!(&filtered, &clean);
        let columns = filtered
            .sql()
            .split_once('(')
            .and_then(|(_, rest)| rest.split_once(')'))
            .map(|(cols, _)| cols.split(',').map(str::to_string).collect::<Vec<_>>())
            .unwrap_or_default();
        for name in unknown.keys() {
            prop_assert!(!columns.contains(name));
            prop_assert!(filtered.params().get(name).is_none());
        }
        prop_assert_eq!(filtered.params().len(), known.len());
    }

    /// Property: WHERE-less writes are refused unless explicitly allowed
    #[test]
    fn prop_unguarded_writes_are_refused(field in arb_field(), step in -1000i64..1000) {
        let mut q = QueryBuilder::new("t");
        prop_assert!(q.delete().unwrap_err().is_precondition());
        prop_assert!(q.update([(field.clone(), UpdateValue::increment(step))]).unwrap_err().is_precondition());

        q.allow_unconditional_writes();
        prop_assert!(q.delete().is_ok());
        prop_assert!(q.update([(field, UpdateValue::increment(step))]).is_ok());
    }
}
