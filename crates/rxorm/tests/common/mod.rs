//! Shared fixtures for the session scenario tests: a recording client and mappings.

#![allow(dead_code)]

use rxorm::{
    CascadeStyle, ClientFuture, CollectionMetadata, ConnectionConfig, ConnectionFactory, Cx,
    Dialect, EntityAssociation, EntityEvent, EntityListener, EntityMetadata, Error,
    IdGeneration, Outcome, PersisterRegistry, PropertyMeta, ReactiveConnection, Row, SqlClient,
    Value, Verdict,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub struct MockState {
    pub statements: Vec<(String, Vec<Value>)>,
    /// Rows handed to queries, front first; an empty queue answers with no rows.
    pub rows: VecDeque<Vec<Row>>,
    /// Affected-row counts handed to updates, front first; one row once exhausted.
    pub counts: VecDeque<u64>,
    pub last_key: i64,
    pub connects: usize,
}

impl MockState {
    /// Recorded INSERT, UPDATE and DELETE statements in execution order.
    pub fn mutations(&self) -> Vec<(String, Vec<Value>)> {
        self.statements
            .iter()
            .filter(|(sql, _)| {
                sql.starts_with("INSERT") || sql.starts_with("UPDATE") || sql.starts_with("DELETE")
            })
            .cloned()
            .collect()
    }

    pub fn sql(&self) -> Vec<String> {
        self.statements.iter().map(|(sql, _)| sql.clone()).collect()
    }
}

/// A client that records every statement and answers from scripted rows.
pub struct RecordingClient {
    pub state: Arc<Mutex<MockState>>,
}

impl RecordingClient {
    fn record(&self, sql: &str, params: &[Value]) {
        self.state
            .lock()
            .expect("lock poisoned")
            .statements
            .push((sql.to_string(), params.to_vec()));
    }
}

impl SqlClient for RecordingClient {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn execute_script<'a>(&'a self, _cx: &'a Cx, sql: &'a str) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            self.record(sql, &[]);
            Outcome::Ok(())
        })
    }

    fn execute<'a>(
        &'a self,
        _cx: &'a Cx,
        sql: &'a str,
        params: &'a [Value],
    ) -> ClientFuture<'a, u64> {
        Box::pin(async move {
            self.record(sql, params);
            let count = self
                .state
                .lock()
                .expect("lock poisoned")
                .counts
                .pop_front()
                .unwrap_or(1);
            Outcome::Ok(count)
        })
    }

    fn insert_returning<'a>(
        &'a self,
        _cx: &'a Cx,
        sql: &'a str,
        params: &'a [Value],
        _key_column: &'a str,
    ) -> ClientFuture<'a, Option<Value>> {
        Box::pin(async move {
            self.record(sql, params);
            let mut state = self.state.lock().expect("lock poisoned");
            state.last_key += 1;
            Outcome::Ok(Some(Value::BigInt(state.last_key)))
        })
    }

    fn query<'a>(
        &'a self,
        _cx: &'a Cx,
        sql: &'a str,
        params: &'a [Value],
    ) -> ClientFuture<'a, Vec<Row>> {
        Box::pin(async move {
            self.record(sql, params);
            let rows = self
                .state
                .lock()
                .expect("lock poisoned")
                .rows
                .pop_front()
                .unwrap_or_default();
            Outcome::Ok(rows)
        })
    }

    fn close<'a>(&'a self, _cx: &'a Cx) -> ClientFuture<'a, ()> {
        Box::pin(async { Outcome::Ok(()) })
    }
}

pub fn connection() -> (ReactiveConnection, Arc<Mutex<MockState>>) {
    let state = Arc::new(Mutex::new(MockState::default()));
    let client = RecordingClient {
        state: Arc::clone(&state),
    };
    (ReactiveConnection::new(Box::new(client)), state)
}

/// Opens recording clients that all write into one shared state.
pub struct RecordingFactory {
    pub state: Arc<Mutex<MockState>>,
}

impl ConnectionFactory for RecordingFactory {
    fn connect<'a>(
        &'a self,
        _cx: &'a Cx,
        _config: &'a ConnectionConfig,
        _tenant: Option<&'a str>,
    ) -> ClientFuture<'a, Box<dyn SqlClient>> {
        Box::pin(async move {
            self.state.lock().expect("lock poisoned").connects += 1;
            let client: Box<dyn SqlClient> = Box::new(RecordingClient {
                state: Arc::clone(&self.state),
            });
            Outcome::Ok(client)
        })
    }
}

/// Vetoes the chosen phases and records every hook it sees as `"<hook> <entity>"`.
#[derive(Default)]
pub struct VetoListener {
    pub insert: bool,
    pub update: bool,
    pub delete: bool,
    pub events: Mutex<Vec<String>>,
}

impl VetoListener {
    fn note(&self, hook: &str, event: &EntityEvent<'_>) {
        self.events
            .lock()
            .expect("lock poisoned")
            .push(format!("{hook} {}", event.entity_name()));
    }

    fn verdict(veto: bool) -> Verdict {
        if veto {
            Verdict::Veto
        } else {
            Verdict::Proceed
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().expect("lock poisoned").clone()
    }
}

impl EntityListener for VetoListener {
    fn pre_insert(&self, event: &EntityEvent<'_>) -> Verdict {
        self.note("pre_insert", event);
        Self::verdict(self.insert)
    }

    fn post_insert(&self, event: &EntityEvent<'_>) {
        self.note("post_insert", event);
    }

    fn pre_update(&self, event: &EntityEvent<'_>) -> Verdict {
        self.note("pre_update", event);
        Self::verdict(self.update)
    }

    fn post_update(&self, event: &EntityEvent<'_>) {
        self.note("post_update", event);
    }

    fn pre_delete(&self, event: &EntityEvent<'_>) -> Verdict {
        self.note("pre_delete", event);
        Self::verdict(self.delete)
    }

    fn post_delete(&self, event: &EntityEvent<'_>) {
        self.note("post_delete", event);
    }
}

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => panic!("expected an error, got {other:?}"),
    }
}

// ============================================================================
// Mappings
// ============================================================================

/// `Order` owns an inverse `items` collection; `LineItem.order` holds the key.
pub fn order_registry() -> PersisterRegistry {
    PersisterRegistry::builder()
        .entity(
            EntityMetadata::new("Order", "orders")
                .id("id", IdGeneration::Identity)
                .property(PropertyMeta::basic("status"))
                .property(
                    PropertyMeta::collection("items", "Order.items").cascade(CascadeStyle::ALL),
                ),
        )
        .entity(
            EntityMetadata::new("LineItem", "line_items")
                .id("id", IdGeneration::Identity)
                .property(PropertyMeta::basic("sku"))
                .property(
                    PropertyMeta::to_one("order", EntityAssociation::many_to_one("Order"))
                        .column("order_id"),
                ),
        )
        .collection(CollectionMetadata::inverse_one_to_many(
            "Order.items",
            "Order",
            "LineItem",
            "line_items",
            "order_id",
        ))
        .build()
        .expect("valid order mapping")
}

/// `Basket` writes the foreign key of its `lines` itself and removes orphans.
pub fn basket_registry() -> PersisterRegistry {
    PersisterRegistry::builder()
        .entity(
            EntityMetadata::new("Basket", "baskets")
                .id("id", IdGeneration::Assigned)
                .property(PropertyMeta::basic("owner"))
                .property(
                    PropertyMeta::collection("lines", "Basket.lines")
                        .cascade(CascadeStyle::ALL.with_orphan_removal()),
                ),
        )
        .entity(
            EntityMetadata::new("BasketLine", "basket_lines")
                .id("id", IdGeneration::Assigned)
                .property(PropertyMeta::basic("sku")),
        )
        .collection(CollectionMetadata::one_to_many(
            "Basket.lines",
            "Basket",
            "BasketLine",
            "basket_lines",
            "basket_id",
        ))
        .build()
        .expect("valid basket mapping")
}

/// `Account` holds a unique foreign key to its `Profile`, removing replaced profiles.
pub fn account_registry() -> PersisterRegistry {
    PersisterRegistry::builder()
        .entity(
            EntityMetadata::new("Account", "accounts")
                .id("id", IdGeneration::Assigned)
                .property(PropertyMeta::basic("login"))
                .property(
                    PropertyMeta::to_one("profile", EntityAssociation::one_to_one("Profile"))
                        .column("profile_id")
                        .cascade(CascadeStyle::ALL.with_orphan_removal()),
                ),
        )
        .entity(
            EntityMetadata::new("Profile", "profiles")
                .id("id", IdGeneration::Assigned)
                .property(PropertyMeta::basic("bio")),
        )
        .build()
        .expect("valid account mapping")
}

/// `Customer` is addressable by its `email` natural id.
pub fn customer_registry() -> PersisterRegistry {
    PersisterRegistry::builder()
        .entity(
            EntityMetadata::new("Customer", "customers")
                .id("id", IdGeneration::Assigned)
                .property(PropertyMeta::basic("email"))
                .property(PropertyMeta::basic("name"))
                .natural_id(&["email"]),
        )
        .build()
        .expect("valid customer mapping")
}

/// `Document` carries an optimistic `version` column.
pub fn document_registry() -> PersisterRegistry {
    PersisterRegistry::builder()
        .entity(
            EntityMetadata::new("Document", "documents")
                .id("id", IdGeneration::Assigned)
                .version("version")
                .property(PropertyMeta::basic("title")),
        )
        .build()
        .expect("valid document mapping")
}

/// A loaded `documents` row at version 1.
pub fn document_row(id: i64, title: &str) -> Row {
    Row::new(
        vec!["id".to_string(), "version".to_string(), "title".to_string()],
        vec![Value::BigInt(id), Value::BigInt(1), Value::Text(title.to_string())],
    )
}
