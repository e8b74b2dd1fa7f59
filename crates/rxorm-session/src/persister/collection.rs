//! Mapping-driven collection persister.

use super::{CollectionPersister, Mutator, element_columns, placeholders, quote};
use crate::BoxFuture;
use crate::entity::{PropertyValue, QueuedOperation};
use crate::executor::{Expectation, MutationKind, TableMutation};
use crate::metadata::{CollectionMetadata, CollectionStorage};
use asupersync::{Cx, Outcome};
use rxorm_core::{Error, ReactiveConnection, Row, Value};
use std::sync::Arc;

/// Writes collection membership according to its [`CollectionStorage`].
///
/// Inverse collections never write; the element side's foreign key carries the membership.
#[derive(Debug, Clone)]
pub struct MappedCollectionPersister {
    meta: Arc<CollectionMetadata>,
}

impl MappedCollectionPersister {
    pub fn new(meta: Arc<CollectionMetadata>) -> Self {
        Self { meta }
    }

    fn mutation(&self, sql: String, params: Vec<Value>, expectation: Expectation) -> TableMutation {
        TableMutation::new(
            MutationKind::Collection,
            self.meta.storage.table(),
            sql,
            params,
        )
        .expect(expectation)
        .for_entity(&self.meta.role, None)
    }

    /// Link each element to `owner_id`.
    async fn write_rows(
        &self,
        m: &mut Mutator<'_>,
        owner_id: &Value,
        elements: &[PropertyValue],
    ) -> Outcome<(), Error> {
        match &self.meta.storage {
            CollectionStorage::Inverse { .. } => {}
            CollectionStorage::ForeignKey {
                table,
                key_column,
                element_id_column,
            } => {
                let sql = format!(
                    "UPDATE {} SET {} = ? WHERE {} = ?",
                    quote(m.conn, table),
                    quote(m.conn, key_column),
                    quote(m.conn, element_id_column)
                );
                for element in elements {
                    let mut params = vec![owner_id.clone()];
                    params.extend(element_columns(element));
                    let mutation = self.mutation(sql.clone(), params, Expectation::RowCount(1));
                    try_outcome!(m.executor.add(m.cx, m.conn, mutation).await);
                }
            }
            CollectionStorage::JoinTable {
                table,
                key_column,
                element_columns: columns,
            } => {
                let mut names = vec![quote(m.conn, key_column)];
                names.extend(columns.iter().map(|c| quote(m.conn, c)));
                let sql = format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    quote(m.conn, table),
                    names.join(", "),
                    placeholders(names.len())
                );
                for element in elements {
                    let mut params = vec![owner_id.clone()];
                    params.extend(element_columns(element));
                    let mutation = self.mutation(sql.clone(), params, Expectation::RowCount(1));
                    try_outcome!(m.executor.add(m.cx, m.conn, mutation).await);
                }
            }
        }
        Outcome::Ok(())
    }

    /// Unlink each element from `owner_id`.
    async fn unlink_rows(
        &self,
        m: &mut Mutator<'_>,
        owner_id: &Value,
        elements: &[PropertyValue],
    ) -> Outcome<(), Error> {
        match &self.meta.storage {
            CollectionStorage::Inverse { .. } => {}
            CollectionStorage::ForeignKey {
                table,
                key_column,
                element_id_column,
            } => {
                let sql = format!(
                    "UPDATE {} SET {key} = NULL WHERE {key} = ? AND {} = ?",
                    quote(m.conn, table),
                    quote(m.conn, element_id_column),
                    key = quote(m.conn, key_column),
                );
                for element in elements {
                    let mut params = vec![owner_id.clone()];
                    params.extend(element_columns(element));
                    let mutation = self.mutation(sql.clone(), params, Expectation::RowCount(1));
                    try_outcome!(m.executor.add(m.cx, m.conn, mutation).await);
                }
            }
            CollectionStorage::JoinTable {
                table,
                key_column,
                element_columns: columns,
            } => {
                let mut predicates = vec![format!("{} = ?", quote(m.conn, key_column))];
                predicates.extend(columns.iter().map(|c| format!("{} = ?", quote(m.conn, c))));
                let sql = format!(
                    "DELETE FROM {} WHERE {}",
                    quote(m.conn, table),
                    predicates.join(" AND ")
                );
                for element in elements {
                    let mut params = vec![owner_id.clone()];
                    params.extend(element_columns(element));
                    let mutation = self.mutation(sql.clone(), params, Expectation::RowCount(1));
                    try_outcome!(m.executor.add(m.cx, m.conn, mutation).await);
                }
            }
        }
        Outcome::Ok(())
    }

    async fn remove_all(&self, m: &mut Mutator<'_>, owner_id: &Value) -> Outcome<(), Error> {
        let sql = match &self.meta.storage {
            CollectionStorage::Inverse { .. } => return Outcome::Ok(()),
            CollectionStorage::ForeignKey {
                table, key_column, ..
            } => format!(
                "UPDATE {} SET {key} = NULL WHERE {key} = ?",
                quote(m.conn, table),
                key = quote(m.conn, key_column),
            ),
            CollectionStorage::JoinTable {
                table, key_column, ..
            } => format!(
                "DELETE FROM {} WHERE {} = ?",
                quote(m.conn, table),
                quote(m.conn, key_column)
            ),
        };
        let mutation = self.mutation(sql, vec![owner_id.clone()], Expectation::None);
        try_outcome!(m.executor.add(m.cx, m.conn, mutation).await);
        Outcome::Ok(())
    }

    async fn apply_queued(
        &self,
        m: &mut Mutator<'_>,
        owner_id: &Value,
        operations: &[QueuedOperation],
    ) -> Outcome<(), Error> {
        for op in operations {
            match op {
                QueuedOperation::Add(v) => {
                    try_outcome!(self.write_rows(m, owner_id, std::slice::from_ref(v)).await);
                }
                QueuedOperation::Remove(v) => {
                    try_outcome!(self.unlink_rows(m, owner_id, std::slice::from_ref(v)).await);
                }
            }
        }
        Outcome::Ok(())
    }
}

impl CollectionPersister for MappedCollectionPersister {
    fn metadata(&self) -> &Arc<CollectionMetadata> {
        &self.meta
    }

    fn recreate<'a>(
        &'a self,
        m: &'a mut Mutator<'_>,
        owner_id: &'a Value,
        elements: &'a [PropertyValue],
    ) -> BoxFuture<'a, ()> {
        Box::pin(self.write_rows(m, owner_id, elements))
    }

    fn remove<'a>(&'a self, m: &'a mut Mutator<'_>, owner_id: &'a Value) -> BoxFuture<'a, ()> {
        Box::pin(self.remove_all(m, owner_id))
    }

    fn delete_rows<'a>(
        &'a self,
        m: &'a mut Mutator<'_>,
        owner_id: &'a Value,
        removed: &'a [PropertyValue],
    ) -> BoxFuture<'a, ()> {
        Box::pin(self.unlink_rows(m, owner_id, removed))
    }

    fn insert_rows<'a>(
        &'a self,
        m: &'a mut Mutator<'_>,
        owner_id: &'a Value,
        added: &'a [PropertyValue],
    ) -> BoxFuture<'a, ()> {
        Box::pin(self.write_rows(m, owner_id, added))
    }

    fn process_queued_ops<'a>(
        &'a self,
        m: &'a mut Mutator<'_>,
        owner_id: &'a Value,
        operations: &'a [QueuedOperation],
    ) -> BoxFuture<'a, ()> {
        Box::pin(self.apply_queued(m, owner_id, operations))
    }

    fn load_elements<'a>(
        &'a self,
        cx: &'a Cx,
        conn: &'a ReactiveConnection,
        owner_id: &'a Value,
    ) -> BoxFuture<'a, Vec<Row>> {
        Box::pin(async move {
            let (table, key_column, columns) = match &self.meta.storage {
                CollectionStorage::Inverse {
                    table,
                    key_column,
                    element_id_column,
                }
                | CollectionStorage::ForeignKey {
                    table,
                    key_column,
                    element_id_column,
                } => (table, key_column, vec![quote(conn, element_id_column)]),
                CollectionStorage::JoinTable {
                    table,
                    key_column,
                    element_columns,
                } => (
                    table,
                    key_column,
                    element_columns.iter().map(|c| quote(conn, c)).collect(),
                ),
            };
            let sql = format!(
                "SELECT {} FROM {} WHERE {} = ?",
                columns.join(", "),
                quote(conn, table),
                quote(conn, key_column)
            );
            conn.select(cx, &sql, &[owner_id.clone()]).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityKey, EntityRef};
    use crate::executor::MutationExecutor;
    use crate::metadata::ElementKind;
    use asupersync::runtime::RuntimeBuilder;
    use rxorm_core::{ClientFuture, Dialect, SqlClient};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorded {
        statements: Vec<(String, Vec<Value>)>,
    }

    struct MockClient {
        state: Arc<Mutex<Recorded>>,
    }

    impl SqlClient for MockClient {
        fn dialect(&self) -> Dialect {
            Dialect::Mysql
        }

        fn execute_script<'a>(&'a self, _cx: &'a Cx, _sql: &'a str) -> ClientFuture<'a, ()> {
            Box::pin(async { Outcome::Ok(()) })
        }

        fn execute<'a>(
            &'a self,
            _cx: &'a Cx,
            sql: &'a str,
            params: &'a [Value],
        ) -> ClientFuture<'a, u64> {
            Box::pin(async move {
                let mut state = self.state.lock().expect("lock");
                state.statements.push((sql.to_string(), params.to_vec()));
                Outcome::Ok(1)
            })
        }

        fn insert_returning<'a>(
            &'a self,
            _cx: &'a Cx,
            _sql: &'a str,
            _params: &'a [Value],
            _key_column: &'a str,
        ) -> ClientFuture<'a, Option<Value>> {
            Box::pin(async { Outcome::Ok(None) })
        }

        fn query<'a>(
            &'a self,
            _cx: &'a Cx,
            sql: &'a str,
            params: &'a [Value],
        ) -> ClientFuture<'a, Vec<Row>> {
            Box::pin(async move {
                let mut state = self.state.lock().expect("lock");
                state.statements.push((sql.to_string(), params.to_vec()));
                Outcome::Ok(vec![Row::new(vec!["tag".into()], vec![Value::from("red")])])
            })
        }

        fn close<'a>(&'a self, _cx: &'a Cx) -> ClientFuture<'a, ()> {
            Box::pin(async { Outcome::Ok(()) })
        }
    }

    fn connection() -> (ReactiveConnection, Arc<Mutex<Recorded>>) {
        let state = Arc::new(Mutex::new(Recorded::default()));
        let client = MockClient {
            state: Arc::clone(&state),
        };
        (ReactiveConnection::new(Box::new(client)), state)
    }

    fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => panic!("unexpected error: {e}"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    fn statements(state: &Arc<Mutex<Recorded>>) -> Vec<String> {
        state
            .lock()
            .expect("lock")
            .statements
            .iter()
            .map(|(s, _)| s.clone())
            .collect()
    }

    fn tags() -> Arc<CollectionMetadata> {
        Arc::new(CollectionMetadata::new(
            "Item.tags",
            "Item",
            ElementKind::Basic,
            CollectionStorage::JoinTable {
                table: "item_tags".into(),
                key_column: "item_id".into(),
                element_columns: vec!["tag".into()],
            },
        ))
    }

    #[test]
    fn join_table_rows_are_batched_per_statement_shape() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (conn, state) = connection();
        let mut executor = MutationExecutor::new(10);
        let persister = MappedCollectionPersister::new(tags());
        let elements = vec![PropertyValue::from("red"), PropertyValue::from("blue")];

        rt.block_on(async {
            let mut m = Mutator {
                cx: &cx,
                conn: &conn,
                executor: &mut executor,
            };
            unwrap_outcome(persister.recreate(&mut m, &Value::BigInt(1), &elements).await);
            unwrap_outcome(m.executor.flush_batch(&cx, &conn).await);
        });

        assert_eq!(executor.batches(), 1);
        let recorded = state.lock().expect("lock");
        assert_eq!(
            recorded.statements[0].0,
            "INSERT INTO `item_tags` (`item_id`, `tag`) VALUES (?, ?)"
        );
    }

    #[test]
    fn foreign_key_collection_nulls_keys_on_remove() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (conn, state) = connection();
        let mut executor = MutationExecutor::new(1);
        let persister = MappedCollectionPersister::new(Arc::new(CollectionMetadata::one_to_many(
            "Order.items",
            "Order",
            "LineItem",
            "line_items",
            "order_id",
        )));
        let removed = vec![PropertyValue::Entity(EntityRef::Unloaded(EntityKey::new(
            "LineItem",
            Value::BigInt(9),
        )))];

        rt.block_on(async {
            let mut m = Mutator {
                cx: &cx,
                conn: &conn,
                executor: &mut executor,
            };
            unwrap_outcome(persister.delete_rows(&mut m, &Value::BigInt(1), &removed).await);
            unwrap_outcome(persister.remove(&mut m, &Value::BigInt(1)).await);
        });

        assert_eq!(
            statements(&state),
            vec![
                "UPDATE `line_items` SET `order_id` = NULL WHERE `order_id` = ? AND `id` = ?"
                    .to_string(),
                "UPDATE `line_items` SET `order_id` = NULL WHERE `order_id` = ?".to_string(),
            ]
        );
    }

    #[test]
    fn inverse_collections_never_write() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (conn, state) = connection();
        let mut executor = MutationExecutor::new(1);
        let persister = MappedCollectionPersister::new(Arc::new(
            CollectionMetadata::inverse_one_to_many(
                "Order.items",
                "Order",
                "LineItem",
                "line_items",
                "order_id",
            ),
        ));

        rt.block_on(async {
            let mut m = Mutator {
                cx: &cx,
                conn: &conn,
                executor: &mut executor,
            };
            let ops = vec![QueuedOperation::Add(PropertyValue::from(3i64))];
            unwrap_outcome(persister.process_queued_ops(&mut m, &Value::BigInt(1), &ops).await);
            unwrap_outcome(persister.remove(&mut m, &Value::BigInt(1)).await);
        });
        assert!(statements(&state).is_empty());
    }

    #[test]
    fn loaded_rows_assemble_into_elements() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (conn, state) = connection();
        let persister = MappedCollectionPersister::new(tags());

        let rows = rt.block_on(async {
            unwrap_outcome(persister.load_elements(&cx, &conn, &Value::BigInt(1)).await)
        });
        assert_eq!(
            statements(&state),
            vec!["SELECT `tag` FROM `item_tags` WHERE `item_id` = ?".to_string()]
        );
        let element = persister.assemble_element(&rows[0]);
        assert!(element.same(&PropertyValue::from("red")));
    }
}
