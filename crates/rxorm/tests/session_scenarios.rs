mod common;

use asupersync::runtime::RuntimeBuilder;
use common::{
    account_registry, basket_registry, connection, customer_registry, document_registry,
    document_row, expect_err, order_registry, unwrap_outcome, RecordingFactory, VetoListener,
};
use rxorm::prelude::*;
use rxorm::{EntityStatus, ListenerGroups, PersistenceErrorKind};
use std::sync::{Arc, Mutex};

#[test]
fn order_with_new_items_inserts_parent_first() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let (conn, state) = connection();
        let factory = SessionFactory::new(order_registry());
        let mut session = factory.open(conn);

        let order = session.instantiate("Order").expect("order");
        order.set("status", "new").expect("status");
        let items = order.collection("items").expect("items");
        for sku in ["A-1", "B-2"] {
            let item = session.instantiate("LineItem").expect("item");
            item.set("sku", sku).expect("sku");
            item.set("order", &order).expect("order");
            items.add(&item);
        }

        unwrap_outcome(session.persist(&cx, &order).await);
        unwrap_outcome(session.commit(&cx).await);

        let state = state.lock().expect("lock");
        let mutations = state.mutations();
        assert_eq!(mutations.len(), 3);
        assert_eq!(mutations[0].0, "INSERT INTO \"orders\" (\"status\") VALUES ($1)");
        for (sql, params) in &mutations[1..] {
            assert_eq!(
                sql,
                "INSERT INTO \"line_items\" (\"sku\", \"order_id\") VALUES ($1, $2)"
            );
            assert_eq!(params[1], Value::BigInt(1));
        }
        assert_eq!(state.sql().first().map(String::as_str), Some("BEGIN"));
        assert_eq!(state.sql().last().map(String::as_str), Some("COMMIT"));
        drop(state);

        assert_eq!(order.id(), Some(Value::BigInt(1)));
        assert_eq!(session.status_of(&order), Some(EntityStatus::Managed));
        let stats = session.statistics();
        assert_eq!(stats.entity_inserts, 3);
        assert_eq!(stats.flushes, 1);
        assert_eq!(stats.to_json()["entity_inserts"], serde_json::json!(3));
        assert!(session.action_queue().is_empty());
    });
}

#[test]
fn removing_an_order_deletes_items_first() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let (conn, state) = connection();
        let factory = SessionFactory::new(order_registry());
        let mut session = factory.open(conn);

        let order = session.instantiate("Order").expect("order");
        let item = session.instantiate("LineItem").expect("item");
        item.set("order", &order).expect("order");
        order.collection("items").expect("items").add(&item);
        unwrap_outcome(session.persist(&cx, &order).await);
        unwrap_outcome(session.commit(&cx).await);
        state.lock().expect("lock").statements.clear();

        unwrap_outcome(session.remove(&cx, &order).await);
        assert_eq!(session.status_of(&order), Some(EntityStatus::Deleted));
        assert_eq!(session.status_of(&item), Some(EntityStatus::Deleted));
        unwrap_outcome(session.flush(&cx).await);

        let deletes: Vec<_> = state
            .lock()
            .expect("lock")
            .mutations()
            .into_iter()
            .filter(|(sql, _)| sql.starts_with("DELETE"))
            .collect();
        assert_eq!(
            deletes,
            vec![
                (
                    "DELETE FROM \"line_items\" WHERE \"id\" = $1".to_string(),
                    vec![Value::BigInt(2)]
                ),
                (
                    "DELETE FROM \"orders\" WHERE \"id\" = $1".to_string(),
                    vec![Value::BigInt(1)]
                ),
            ]
        );
        assert!(!session.contains(&order));
        assert!(!session.contains(&item));
        assert_eq!(session.persistence_context().cascade_level(), 0);
    });
}

#[test]
fn collection_orphan_is_unlinked_then_deleted() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let (conn, state) = connection();
        let factory = SessionFactory::new(basket_registry());
        let mut session = factory.open(conn);

        let basket = session.instantiate("Basket").expect("basket");
        basket.set_id(10_i64);
        let lines = basket.collection("lines").expect("lines");
        let kept = session.instantiate("BasketLine").expect("line");
        kept.set_id(1_i64);
        let dropped = session.instantiate("BasketLine").expect("line");
        dropped.set_id(2_i64);
        lines.add(&kept);
        lines.add(&dropped);

        unwrap_outcome(session.persist(&cx, &basket).await);
        unwrap_outcome(session.flush(&cx).await);
        {
            let state = state.lock().expect("lock");
            let links: Vec<_> = state
                .mutations()
                .into_iter()
                .filter(|(sql, _)| sql.starts_with("UPDATE"))
                .collect();
            assert_eq!(links.len(), 2);
            assert_eq!(
                links[0].0,
                "UPDATE \"basket_lines\" SET \"basket_id\" = $1 WHERE \"id\" = $2"
            );
        }
        state.lock().expect("lock").statements.clear();

        assert!(lines.remove(&dropped));
        unwrap_outcome(session.flush(&cx).await);

        let mutations = state.lock().expect("lock").mutations();
        assert_eq!(
            mutations,
            vec![
                (
                    "UPDATE \"basket_lines\" SET \"basket_id\" = NULL WHERE \"basket_id\" = $1 AND \"id\" = $2"
                        .to_string(),
                    vec![Value::BigInt(10), Value::BigInt(2)]
                ),
                (
                    "DELETE FROM \"basket_lines\" WHERE \"id\" = $1".to_string(),
                    vec![Value::BigInt(2)]
                ),
            ]
        );
        assert!(session.contains(&kept));
        assert!(!session.contains(&dropped));
    });
}

#[test]
fn replaced_one_to_one_is_deleted() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let (conn, state) = connection();
        let factory = SessionFactory::new(account_registry());
        let mut session = factory.open(conn);

        let account = session.instantiate("Account").expect("account");
        account.set_id("acc-1");
        let first = session.instantiate("Profile").expect("profile");
        first.set_id(1_i64);
        account.set("profile", &first).expect("profile");

        unwrap_outcome(session.persist(&cx, &account).await);
        unwrap_outcome(session.flush(&cx).await);
        let inserts: Vec<_> = state
            .lock()
            .expect("lock")
            .mutations()
            .into_iter()
            .map(|(sql, _)| sql)
            .collect();
        assert_eq!(
            inserts,
            vec![
                "INSERT INTO \"profiles\" (\"id\", \"bio\") VALUES ($1, $2)".to_string(),
                "INSERT INTO \"accounts\" (\"id\", \"login\", \"profile_id\") VALUES ($1, $2, $3)"
                    .to_string(),
            ]
        );
        state.lock().expect("lock").statements.clear();

        let second = session.instantiate("Profile").expect("profile");
        second.set_id(2_i64);
        account.set("profile", &second).expect("profile");
        unwrap_outcome(session.flush(&cx).await);

        let mutations = state.lock().expect("lock").mutations();
        let deletes: Vec<_> = mutations
            .iter()
            .filter(|(sql, _)| sql.starts_with("DELETE"))
            .collect();
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].1, vec![Value::BigInt(1)]);
        assert!(
            mutations
                .iter()
                .any(|(sql, params)| sql.starts_with("INSERT INTO \"profiles\"")
                    && params[0] == Value::BigInt(2))
        );
        let delete_at = mutations
            .iter()
            .position(|(sql, _)| sql.starts_with("DELETE"))
            .expect("delete issued");
        let update_at = mutations
            .iter()
            .position(|(sql, _)| sql.starts_with("UPDATE \"accounts\""))
            .expect("account updated");
        assert!(update_at < delete_at);
        assert!(session.contains(&second));
        assert!(!session.contains(&first));
    });
}

#[test]
fn failed_cascade_leaves_depth_balanced() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let (conn, _state) = connection();
        let factory = SessionFactory::new(basket_registry());
        let mut session = factory.open(conn);

        let basket = session.instantiate("Basket").expect("basket");
        basket.set_id(10_i64);
        let line = session.instantiate("BasketLine").expect("line");
        basket.collection("lines").expect("lines").add(&line);

        let err = expect_err(session.persist(&cx, &basket).await);
        assert!(matches!(
            err,
            Error::Persistence(ref e) if e.kind == PersistenceErrorKind::NullIdentifier
        ));
        assert_eq!(session.persistence_context().cascade_level(), 0);
    });
}

#[test]
fn reference_to_unsaved_instance_fails_the_flush() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let (conn, state) = connection();
        let factory = SessionFactory::new(order_registry());
        let mut session = factory.open(conn);

        let order = session.instantiate("Order").expect("order");
        unwrap_outcome(session.persist(&cx, &order).await);

        let stray = session.instantiate("LineItem").expect("item");
        let stray_order = session.instantiate("Order").expect("order");
        stray.set("order", &stray_order).expect("order");
        unwrap_outcome(session.persist(&cx, &stray).await);
        state.lock().expect("lock").statements.clear();

        // The item is now managed; its unsaved order is only found at flush.
        let err = expect_err(session.flush(&cx).await);
        assert!(matches!(
            err,
            Error::Persistence(ref e) if e.kind == PersistenceErrorKind::TransientReference
        ));
        assert!(!session.contains(&stray_order));
    });
}

#[test]
fn find_uses_identity_map_and_flushes_dirty_state() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let (conn, state) = connection();
        state.lock().expect("lock").rows.push_back(vec![Row::new(
            vec!["id".to_string(), "status".to_string()],
            vec![Value::BigInt(7), Value::Text("open".to_string())],
        )]);
        let factory = SessionFactory::new(order_registry());
        let mut session = factory.open(conn);

        let order = unwrap_outcome(session.find(&cx, "Order", 7_i64).await).expect("row");
        assert_eq!(
            order.get("status").expect("status").as_value(),
            Some(&Value::Text("open".to_string()))
        );
        let again = unwrap_outcome(session.find(&cx, "Order", 7_i64).await).expect("row");
        assert!(again.ptr_eq(&order));
        let selects = state
            .lock()
            .expect("lock")
            .sql()
            .iter()
            .filter(|sql| sql.starts_with("SELECT"))
            .count();
        assert_eq!(selects, 1);
        assert!(!order.collection("items").expect("items").is_initialized());

        order.set("status", "paid").expect("status");
        unwrap_outcome(session.flush(&cx).await);
        let mutations = state.lock().expect("lock").mutations();
        assert_eq!(
            mutations,
            vec![(
                "UPDATE \"orders\" SET \"status\" = $1 WHERE \"id\" = $2".to_string(),
                vec![Value::Text("paid".to_string()), Value::BigInt(7)]
            )]
        );
        assert_eq!(session.statistics().entity_updates, 1);

        let missing = unwrap_outcome(session.find(&cx, "Order", 8_i64).await);
        assert!(missing.is_none());
    });
}

#[test]
fn rollback_discards_pending_work() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let (conn, state) = connection();
        let factory = SessionFactory::new(basket_registry());
        let mut session = factory.open(conn);
        let rolled_back = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&rolled_back);
        session.on_after_rollback(move || {
            *flag.lock().expect("lock") = true;
            Ok(())
        });

        let basket = session.instantiate("Basket").expect("basket");
        basket.set_id(3_i64);
        unwrap_outcome(session.persist(&cx, &basket).await);
        assert!(!session.action_queue().is_empty());
        assert!(session.in_transaction());

        unwrap_outcome(session.rollback(&cx).await);
        assert!(session.action_queue().is_empty());
        assert!(!session.contains(&basket));
        assert!(!session.in_transaction());
        assert!(*rolled_back.lock().expect("lock"));
        let state = state.lock().expect("lock");
        assert!(state.mutations().is_empty());
        assert_eq!(state.sql().last().map(String::as_str), Some("ROLLBACK"));
    });
}

#[test]
fn pooled_session_returns_its_connection() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let state = Arc::new(Mutex::new(common::MockState::default()));
        let pool = Pool::new(
            PoolConfig::new(2).test_on_checkout(false),
            ConnectionConfig::new("mock://orders"),
            RecordingFactory {
                state: Arc::clone(&state),
            },
        )
        .expect("valid pool config");
        let factory = SessionFactory::new(order_registry());

        let mut session = factory.open_pooled(&pool, None);
        assert_eq!(pool.stats().connections_created, 0);

        let order = session.instantiate("Order").expect("order");
        unwrap_outcome(session.persist(&cx, &order).await);
        unwrap_outcome(session.commit(&cx).await);
        assert_eq!(pool.stats().active_connections, 1);

        unwrap_outcome(session.close(&cx).await);
        let stats = pool.stats();
        assert_eq!(stats.connections_created, 1);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.idle_connections, 1);
        assert_eq!(state.lock().expect("lock").connects, 1);
    });
}

#[test]
fn cascade_styles_compose() {
    let style = CascadeStyle::PERSIST.and(CascadeStyle::REMOVE);
    assert!(style.is_cascading());
    assert!(!style.has_orphan_delete());
    assert!(CascadeStyle::ALL.with_orphan_removal().has_orphan_delete());

    let items = CollectionMetadata::inverse_one_to_many(
        "Order.items",
        "Order",
        "LineItem",
        "line_items",
        "order_id",
    );
    assert!(items.storage.is_inverse());
}

#[test]
fn merge_copies_detached_state_onto_the_loaded_instance() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let (conn, state) = connection();
        state.lock().expect("lock").rows.push_back(vec![Row::new(
            vec!["id".to_string(), "owner".to_string()],
            vec![Value::BigInt(5), Value::Text("ann".to_string())],
        )]);
        let factory = SessionFactory::new(basket_registry());
        let mut session = factory.open(conn);

        let detached = session.instantiate("Basket").expect("basket");
        detached.set_id(5_i64);
        detached.set("owner", "bob").expect("owner");

        let managed = unwrap_outcome(session.merge(&cx, &detached).await);
        assert!(!managed.ptr_eq(&detached));
        assert!(session.contains(&managed));
        assert!(!session.contains(&detached));
        assert_eq!(
            managed.get("owner").expect("owner").as_value(),
            Some(&Value::Text("bob".to_string()))
        );

        unwrap_outcome(session.flush(&cx).await);
        let updates: Vec<_> = state
            .lock()
            .expect("lock")
            .mutations()
            .into_iter()
            .filter(|(sql, _)| sql.starts_with("UPDATE \"baskets\""))
            .collect();
        assert_eq!(
            updates,
            vec![(
                "UPDATE \"baskets\" SET \"owner\" = $1 WHERE \"id\" = $2".to_string(),
                vec![Value::Text("bob".to_string()), Value::BigInt(5)]
            )]
        );
    });
}

#[test]
fn refresh_discards_unflushed_changes() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let (conn, state) = connection();
        {
            let mut state = state.lock().expect("lock");
            for status in ["open", "shipped"] {
                state.rows.push_back(vec![Row::new(
                    vec!["id".to_string(), "status".to_string()],
                    vec![Value::BigInt(7), Value::Text(status.to_string())],
                )]);
            }
        }
        let factory = SessionFactory::new(order_registry());
        let mut session = factory.open(conn);

        let order = unwrap_outcome(session.find(&cx, "Order", 7_i64).await).expect("row");
        order.set("status", "paid").expect("status");
        unwrap_outcome(session.refresh(&cx, &order).await);

        assert_eq!(
            order.get("status").expect("status").as_value(),
            Some(&Value::Text("shipped".to_string()))
        );
        unwrap_outcome(session.flush(&cx).await);
        assert!(state.lock().expect("lock").mutations().is_empty());
        assert_eq!(session.statistics().entity_loads, 2);
    });
}

#[test]
fn natural_id_lookup_resolves_through_the_context() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let (conn, state) = connection();
        {
            let mut state = state.lock().expect("lock");
            state.rows.push_back(vec![Row::new(
                vec!["id".to_string()],
                vec![Value::BigInt(3)],
            )]);
            state.rows.push_back(vec![Row::new(
                vec!["id".to_string(), "email".to_string(), "name".to_string()],
                vec![
                    Value::BigInt(3),
                    Value::Text("ann@example.com".to_string()),
                    Value::Text("Ann".to_string()),
                ],
            )]);
        }
        let factory = SessionFactory::new(customer_registry());
        let mut session = factory.open(conn);

        let ann = [Value::Text("ann@example.com".to_string())];
        let found = unwrap_outcome(session.find_by_natural_id(&cx, "Customer", &ann).await)
            .expect("customer");
        assert_eq!(found.id(), Some(Value::BigInt(3)));
        let selects = state.lock().expect("lock").statements.clone();
        assert_eq!(selects.len(), 2);
        assert_eq!(
            selects[0],
            (
                "SELECT \"id\" FROM \"customers\" WHERE \"email\" = $1".to_string(),
                ann.to_vec()
            )
        );

        let again = unwrap_outcome(session.find_by_natural_id(&cx, "Customer", &ann).await)
            .expect("customer");
        assert!(again.ptr_eq(&found));

        // A new instance is registered under its natural id once inserted.
        let bo = session.instantiate("Customer").expect("customer");
        bo.set_id(9_i64);
        bo.set("email", "bo@example.com").expect("email");
        unwrap_outcome(session.persist(&cx, &bo).await);
        unwrap_outcome(session.flush(&cx).await);
        let by_email = unwrap_outcome(
            session
                .find_by_natural_id(&cx, "Customer", &[Value::from("bo@example.com")])
                .await,
        )
        .expect("customer");
        assert!(by_email.ptr_eq(&bo));

        let selects = state
            .lock()
            .expect("lock")
            .sql()
            .iter()
            .filter(|sql| sql.starts_with("SELECT"))
            .count();
        assert_eq!(selects, 2);

        // An unknown natural id misses in memory and in the database.
        let missing = unwrap_outcome(
            session
                .find_by_natural_id(&cx, "Customer", &[Value::from("nobody@example.com")])
                .await,
        );
        assert!(missing.is_none());
    });
}

#[test]
fn vetoed_insert_bookkeeping_follows_configuration() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        for bookkeeping in [true, false] {
            let (conn, state) = connection();
            let listener = Arc::new(VetoListener {
                insert: true,
                ..VetoListener::default()
            });
            let factory = SessionFactory::new(customer_registry())
                .with_listeners(ListenerGroups::new().with(Arc::<VetoListener>::clone(&listener)))
                .with_config(SessionConfig::new().veto_bookkeeping(bookkeeping));
            let mut session = factory.open(conn);

            let ann = session.instantiate("Customer").expect("customer");
            ann.set_id(1_i64);
            ann.set("email", "ann@example.com").expect("email");
            unwrap_outcome(session.persist(&cx, &ann).await);
            unwrap_outcome(session.flush(&cx).await);

            assert!(state.lock().expect("lock").mutations().is_empty());
            assert_eq!(session.status_of(&ann), Some(EntityStatus::Managed));
            let pc = session.persistence_context();
            assert!(pc.entry(&ann).expect("entry").exists_in_database);
            let registered = pc
                .find_by_natural_id("Customer", &[Value::from("ann@example.com")])
                .cloned();
            if bookkeeping {
                assert_eq!(registered, Some(Value::BigInt(1)));
                assert_eq!(
                    listener.events(),
                    vec!["pre_insert Customer", "post_insert Customer"]
                );
            } else {
                assert_eq!(registered, None);
                assert_eq!(listener.events(), vec!["pre_insert Customer"]);
            }
            assert_eq!(session.statistics().entity_inserts, 0);

            // The vetoed row counts as written; a second flush has nothing to do.
            unwrap_outcome(session.flush(&cx).await);
            assert!(state.lock().expect("lock").mutations().is_empty());
        }
    });
}

#[test]
fn vetoed_update_and_delete_skip_sql_but_update_the_context() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let (conn, state) = connection();
        state
            .lock()
            .expect("lock")
            .rows
            .push_back(vec![document_row(4, "draft")]);
        let listener = Arc::new(VetoListener {
            update: true,
            delete: true,
            ..VetoListener::default()
        });
        let factory = SessionFactory::new(document_registry())
            .with_listeners(ListenerGroups::new().with(Arc::<VetoListener>::clone(&listener)));
        let mut session = factory.open(conn);

        let doc = unwrap_outcome(session.find(&cx, "Document", 4_i64).await).expect("document");
        assert_eq!(doc.version(), Some(1));
        doc.set("title", "final").expect("title");
        unwrap_outcome(session.flush(&cx).await);

        assert!(state.lock().expect("lock").mutations().is_empty());
        assert_eq!(doc.version(), Some(2));
        {
            let entry = session.persistence_context().entry(&doc).expect("entry");
            assert_eq!(entry.version, Some(2));
            let loaded = entry.loaded_state.as_ref().expect("loaded state");
            assert_eq!(loaded[0].as_value(), Some(&Value::from("final")));
        }

        // The context already holds the vetoed state, so the instance is clean.
        unwrap_outcome(session.flush(&cx).await);
        assert_eq!(listener.events(), vec!["pre_update Document"]);

        unwrap_outcome(session.remove(&cx, &doc).await);
        unwrap_outcome(session.flush(&cx).await);
        assert!(state.lock().expect("lock").mutations().is_empty());
        assert!(!session.contains(&doc));
        assert_eq!(
            listener.events(),
            vec!["pre_update Document", "pre_delete Document"]
        );
        let stats = session.statistics();
        assert_eq!(stats.entity_updates, 0);
        assert_eq!(stats.entity_deletes, 0);
    });
}

#[test]
fn version_mismatch_on_update_is_stale_state() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let (conn, state) = connection();
        {
            let mut state = state.lock().expect("lock");
            state.rows.push_back(vec![document_row(4, "draft")]);
            state.counts.push_back(0);
        }
        let factory = SessionFactory::new(document_registry())
            .with_config(SessionConfig::new().batch_size(1));
        let mut session = factory.open(conn);

        let doc = unwrap_outcome(session.find(&cx, "Document", 4_i64).await).expect("document");
        doc.set("title", "final").expect("title");
        let err = expect_err(session.flush(&cx).await);
        assert!(err.is_stale_state(), "unexpected error: {err}");

        let mutations = state.lock().expect("lock").mutations();
        assert_eq!(
            mutations,
            vec![(
                "UPDATE \"documents\" SET \"title\" = $1, \"version\" = $2 WHERE \"id\" = $3 AND \"version\" = $4"
                    .to_string(),
                vec![
                    Value::from("final"),
                    Value::BigInt(2),
                    Value::BigInt(4),
                    Value::BigInt(1)
                ]
            )]
        );
        assert_eq!(session.statistics().optimistic_failures, 1);
        assert_eq!(
            session.persistence_context().entry(&doc).expect("entry").version,
            Some(1)
        );
    });
}
