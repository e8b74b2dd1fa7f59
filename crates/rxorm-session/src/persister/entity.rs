//! Mapping-driven entity persister.

use super::{EntityPersister, Mutator, placeholders, quote};
use crate::BoxFuture;
use crate::context::LockMode;
use crate::entity::{CollectionHandle, EntityData, EntityKey, EntityRef, PropertyValue};
use crate::executor::{Expectation, MutationKind, TableMutation};
use crate::metadata::{
    EntityMetadata, ForeignKeyDirection, GenerationTiming, IdGeneration, PropertyMeta,
    PropertyType,
};
use asupersync::{Cx, Outcome};
use rxorm_core::error::{MappingErrorKind, PersistenceErrorKind, RowCountError, RowCountErrorKind};
use rxorm_core::{Error, ReactiveConnection, Result, Row, Value};
use std::sync::Arc;

/// One table an entity's state is spread over.
struct TableLayout<'m> {
    table: &'m str,
    key_column: &'m str,
    properties: Vec<usize>,
    root: bool,
}

/// Generates SQL from [`EntityMetadata`] and runs writes through the mutation executor.
#[derive(Debug, Clone)]
pub struct MappedEntityPersister {
    meta: Arc<EntityMetadata>,
}

impl MappedEntityPersister {
    pub fn new(meta: Arc<EntityMetadata>) -> Self {
        Self { meta }
    }

    /// Root table first, then joined tables in declaration order.
    fn layouts(&self) -> Vec<TableLayout<'_>> {
        let meta = &*self.meta;
        let joined: Vec<usize> = meta
            .joined_tables
            .iter()
            .flat_map(|t| t.properties.iter().copied())
            .collect();
        let mut layouts = vec![TableLayout {
            table: &meta.table,
            key_column: &meta.id_column,
            properties: (0..meta.properties.len())
                .filter(|i| !joined.contains(i))
                .collect(),
            root: true,
        }];
        layouts.extend(meta.joined_tables.iter().map(|t| TableLayout {
            table: &t.table,
            key_column: &t.key_column,
            properties: t.properties.clone(),
            root: false,
        }));
        layouts
    }

    fn version_value(version: Option<i64>) -> Value {
        version.map_or(Value::Null, Value::BigInt)
    }

    /// `SELECT` list and `FROM` clause covering every table, with `t0` as the root alias.
    fn select_from(
        &self,
        conn: &ReactiveConnection,
        include: impl Fn(&PropertyMeta) -> bool,
    ) -> (Vec<String>, String) {
        let meta = &*self.meta;
        let mut columns = Vec::new();
        let mut from = format!("{} t0", quote(conn, &meta.table));
        for (n, layout) in self.layouts().iter().enumerate() {
            let alias = format!("t{n}");
            if !layout.root {
                from.push_str(&format!(
                    " LEFT JOIN {} {alias} ON {alias}.{} = t0.{}",
                    quote(conn, layout.table),
                    quote(conn, layout.key_column),
                    quote(conn, &meta.id_column),
                ));
            }
            for &i in &layout.properties {
                let prop = &meta.properties[i];
                if include(prop) {
                    for column in column_names(prop) {
                        columns.push(format!("{alias}.{}", quote(conn, &column)));
                    }
                }
            }
        }
        (columns, from)
    }

    async fn insert_rows(
        &self,
        m: &mut Mutator<'_>,
        id: Option<&Value>,
        state: &[PropertyValue],
        version: Option<i64>,
    ) -> Outcome<Value, Error> {
        let meta = &*self.meta;
        let identity = meta.id_generation == IdGeneration::Identity;
        let mut written_id: Option<Value> = if identity { None } else { id.cloned() };

        for layout in self.layouts() {
            let mut columns: Vec<(String, Value)> = Vec::new();
            if !(layout.root && identity) {
                let Some(id) = written_id.clone() else {
                    return Outcome::Err(Error::persistence(
                        PersistenceErrorKind::NullIdentifier,
                        &meta.name,
                        None,
                        "identifier must be assigned before insert",
                    ));
                };
                columns.push((layout.key_column.to_string(), id));
            }
            if layout.root {
                if let Some(column) = &meta.version_column {
                    columns.push((column.clone(), Self::version_value(version)));
                }
            }
            for &i in &layout.properties {
                let prop = &meta.properties[i];
                if prop.insertable && prop.generated == GenerationTiming::Never {
                    let value = state.get(i).cloned().unwrap_or_default();
                    property_columns(prop, &value, &mut columns);
                }
            }

            let table = quote(m.conn, layout.table);
            let sql = if columns.is_empty() {
                format!("INSERT INTO {table} DEFAULT VALUES")
            } else {
                let names: Vec<String> = columns.iter().map(|(c, _)| quote(m.conn, c)).collect();
                format!(
                    "INSERT INTO {table} ({}) VALUES ({})",
                    names.join(", "),
                    placeholders(columns.len())
                )
            };
            let params = columns.into_iter().map(|(_, v)| v).collect();
            let mutation = TableMutation::new(MutationKind::Insert, layout.table, sql, params)
                .for_entity(&meta.name, written_id.clone());

            if layout.root && identity {
                let key = try_outcome!(
                    m.executor
                        .execute_returning_key(m.cx, m.conn, mutation, &meta.id_column)
                        .await
                );
                written_id = Some(key);
            } else {
                try_outcome!(m.executor.add(m.cx, m.conn, mutation).await);
            }
        }

        match written_id {
            Some(id) => Outcome::Ok(id),
            None => Outcome::Err(Error::persistence(
                PersistenceErrorKind::NullIdentifier,
                &meta.name,
                None,
                "insert produced no identifier",
            )),
        }
    }

    async fn update_rows(
        &self,
        m: &mut Mutator<'_>,
        id: &Value,
        state: &[PropertyValue],
        dirty: &[usize],
        previous_version: Option<i64>,
        next_version: Option<i64>,
    ) -> Outcome<(), Error> {
        let meta = &*self.meta;
        for layout in self.layouts() {
            let mut columns: Vec<(String, Value)> = Vec::new();
            for &i in &layout.properties {
                let prop = &meta.properties[i];
                if dirty.contains(&i) && prop.updatable && prop.generated != GenerationTiming::Always
                {
                    let value = state.get(i).cloned().unwrap_or_default();
                    property_columns(prop, &value, &mut columns);
                }
            }
            let versioned = layout.root && meta.is_versioned();
            if versioned {
                if let Some(column) = &meta.version_column {
                    columns.push((column.clone(), Self::version_value(next_version)));
                }
            }
            if columns.is_empty() {
                continue;
            }

            let assignments: Vec<String> = columns
                .iter()
                .map(|(c, _)| format!("{} = ?", quote(m.conn, c)))
                .collect();
            let mut params: Vec<Value> = columns.into_iter().map(|(_, v)| v).collect();
            let mut sql = format!(
                "UPDATE {} SET {} WHERE {} = ?",
                quote(m.conn, layout.table),
                assignments.join(", "),
                quote(m.conn, layout.key_column)
            );
            params.push(id.clone());
            let mut expectation = Expectation::RowCount(1);
            if versioned {
                if let (Some(column), Some(previous)) = (&meta.version_column, previous_version) {
                    sql.push_str(&format!(" AND {} = ?", quote(m.conn, column)));
                    params.push(Value::BigInt(previous));
                }
                expectation = Expectation::Optimistic;
            }
            let mutation = TableMutation::new(MutationKind::Update, layout.table, sql, params)
                .expect(expectation)
                .for_entity(&meta.name, Some(id.clone()));
            try_outcome!(m.executor.add(m.cx, m.conn, mutation).await);
        }
        Outcome::Ok(())
    }

    async fn delete_rows(
        &self,
        m: &mut Mutator<'_>,
        id: &Value,
        version: Option<i64>,
    ) -> Outcome<(), Error> {
        let meta = &*self.meta;
        // Joined rows reference the root row.
        for layout in self.layouts().iter().rev() {
            let mut sql = format!(
                "DELETE FROM {} WHERE {} = ?",
                quote(m.conn, layout.table),
                quote(m.conn, layout.key_column)
            );
            let mut params = vec![id.clone()];
            let mut expectation = Expectation::RowCount(1);
            if layout.root && meta.is_versioned() {
                if let (Some(column), Some(version)) = (&meta.version_column, version) {
                    sql.push_str(&format!(" AND {} = ?", quote(m.conn, column)));
                    params.push(Value::BigInt(version));
                }
                expectation = Expectation::Optimistic;
            }
            let mutation = TableMutation::new(MutationKind::Delete, layout.table, sql, params)
                .expect(expectation)
                .for_entity(&meta.name, Some(id.clone()));
            try_outcome!(m.executor.add(m.cx, m.conn, mutation).await);
        }
        Outcome::Ok(())
    }

    fn stale(&self, id: &Value, expected: u64, actual: u64, sql: String) -> Error {
        Error::RowCount(RowCountError {
            kind: RowCountErrorKind::StaleState,
            entity: Some(self.meta.name.clone()),
            identifier: Some(id.to_string()),
            expected,
            actual,
            sql: Some(sql),
            batch_position: None,
        })
    }

    async fn lock_row(
        &self,
        m: &mut Mutator<'_>,
        id: &Value,
        version: Option<i64>,
        mode: LockMode,
    ) -> Outcome<(), Error> {
        let meta = &*self.meta;
        try_outcome!(m.executor.flush_batch(m.cx, m.conn).await);
        match mode {
            LockMode::None => Outcome::Ok(()),
            LockMode::Read | LockMode::PessimisticWrite => {
                let check_column = meta.version_column.as_deref().unwrap_or(&meta.id_column);
                let mut sql = format!(
                    "SELECT {} FROM {} WHERE {} = ?",
                    quote(m.conn, check_column),
                    quote(m.conn, &meta.table),
                    quote(m.conn, &meta.id_column)
                );
                if mode == LockMode::PessimisticWrite {
                    sql.push_str(m.conn.dialect().for_update_clause());
                }
                let row = try_outcome!(m.conn.select_one(m.cx, &sql, &[id.clone()]).await);
                let Some(row) = row else {
                    return Outcome::Err(self.stale(id, 1, 0, sql));
                };
                if let (Some(column), Some(expected)) = (&meta.version_column, version) {
                    let current = row.get_by_name(column).and_then(Value::as_i64);
                    if current != Some(expected) {
                        tracing::debug!(
                            entity = %meta.name,
                            id = %id,
                            expected,
                            current = ?current,
                            "version changed under lock"
                        );
                        return Outcome::Err(self.stale(id, 1, 0, sql));
                    }
                }
                Outcome::Ok(())
            }
            LockMode::ForceIncrement => {
                let Some(column) = &meta.version_column else {
                    return Outcome::Err(Error::mapping(
                        MappingErrorKind::Invalid,
                        format!("{} is not versioned; cannot force a version increment", meta.name),
                    ));
                };
                let current = version.unwrap_or(0);
                let sql = format!(
                    "UPDATE {} SET {col} = ? WHERE {} = ? AND {col} = ?",
                    quote(m.conn, &meta.table),
                    quote(m.conn, &meta.id_column),
                    col = quote(m.conn, column),
                );
                let params = vec![Value::BigInt(current + 1), id.clone(), Value::BigInt(current)];
                let mutation = TableMutation::new(MutationKind::Update, &meta.table, sql, params)
                    .expect(Expectation::Optimistic)
                    .for_entity(&meta.name, Some(id.clone()));
                try_outcome!(m.executor.execute(m.cx, m.conn, mutation).await);
                Outcome::Ok(())
            }
        }
    }
}

impl EntityPersister for MappedEntityPersister {
    fn metadata(&self) -> &Arc<EntityMetadata> {
        &self.meta
    }

    fn insert<'a>(
        &'a self,
        m: &'a mut Mutator<'_>,
        id: Option<&'a Value>,
        state: &'a [PropertyValue],
        version: Option<i64>,
    ) -> BoxFuture<'a, Value> {
        Box::pin(self.insert_rows(m, id, state, version))
    }

    fn update<'a>(
        &'a self,
        m: &'a mut Mutator<'_>,
        id: &'a Value,
        state: &'a [PropertyValue],
        dirty: &'a [usize],
        previous_version: Option<i64>,
        next_version: Option<i64>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(self.update_rows(m, id, state, dirty, previous_version, next_version))
    }

    fn delete<'a>(
        &'a self,
        m: &'a mut Mutator<'_>,
        id: &'a Value,
        version: Option<i64>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(self.delete_rows(m, id, version))
    }

    fn lock<'a>(
        &'a self,
        m: &'a mut Mutator<'_>,
        id: &'a Value,
        version: Option<i64>,
        mode: LockMode,
    ) -> BoxFuture<'a, ()> {
        Box::pin(self.lock_row(m, id, version, mode))
    }

    fn load<'a>(
        &'a self,
        cx: &'a Cx,
        conn: &'a ReactiveConnection,
        id: &'a Value,
    ) -> BoxFuture<'a, Option<Row>> {
        Box::pin(async move {
            let meta = &*self.meta;
            let (mut columns, from) = self.select_from(conn, |p| !p.lazy);
            if let Some(version) = &meta.version_column {
                columns.insert(0, format!("t0.{}", quote(conn, version)));
            }
            columns.insert(0, format!("t0.{}", quote(conn, &meta.id_column)));
            let sql = format!(
                "SELECT {} FROM {from} WHERE t0.{} = ?",
                columns.join(", "),
                quote(conn, &meta.id_column)
            );
            conn.select_one(cx, &sql, &[id.clone()]).await
        })
    }

    fn select_generated<'a>(
        &'a self,
        cx: &'a Cx,
        conn: &'a ReactiveConnection,
        id: &'a Value,
        timing: GenerationTiming,
    ) -> BoxFuture<'a, Option<Row>> {
        Box::pin(async move {
            let (columns, from) = self.select_from(conn, |p| generated_at(p, timing));
            if columns.is_empty() {
                return Outcome::Ok(None);
            }
            let sql = format!(
                "SELECT {} FROM {from} WHERE t0.{} = ?",
                columns.join(", "),
                quote(conn, &self.meta.id_column)
            );
            conn.select_one(cx, &sql, &[id.clone()]).await
        })
    }

    fn select_ids_by_column<'a>(
        &'a self,
        cx: &'a Cx,
        conn: &'a ReactiveConnection,
        column: &'a str,
        value: &'a Value,
    ) -> BoxFuture<'a, Vec<Value>> {
        Box::pin(async move {
            let meta = &*self.meta;
            let sql = format!(
                "SELECT {} FROM {} WHERE {} = ?",
                quote(conn, &meta.id_column),
                quote(conn, &meta.table),
                quote(conn, column)
            );
            let rows = try_outcome!(conn.select(cx, &sql, &[value.clone()]).await);
            Outcome::Ok(
                rows.into_iter()
                    .filter_map(|row| row.get(0).cloned())
                    .collect(),
            )
        })
    }

    fn select_id_by_natural_id<'a>(
        &'a self,
        cx: &'a Cx,
        conn: &'a ReactiveConnection,
        values: &'a [Value],
    ) -> BoxFuture<'a, Option<Value>> {
        Box::pin(async move {
            let meta = &*self.meta;
            if meta.natural_id.is_empty() || meta.natural_id.len() != values.len() {
                return Outcome::Err(Error::mapping(
                    MappingErrorKind::Invalid,
                    format!(
                        "{} declares {} natural-id properties, {} values given",
                        meta.name,
                        meta.natural_id.len(),
                        values.len()
                    ),
                ));
            }
            let mut predicates = Vec::with_capacity(values.len());
            for &index in &meta.natural_id {
                let joined = meta.joined_tables.iter().any(|t| t.properties.contains(&index));
                let column = meta
                    .properties
                    .get(index)
                    .and_then(|p| p.column.as_deref())
                    .filter(|_| !joined);
                let Some(column) = column else {
                    return Outcome::Err(Error::mapping(
                        MappingErrorKind::Invalid,
                        format!("natural id of {} must use root-table columns", meta.name),
                    ));
                };
                predicates.push(format!("{} = ?", quote(conn, column)));
            }
            let sql = format!(
                "SELECT {} FROM {} WHERE {}",
                quote(conn, &meta.id_column),
                quote(conn, &meta.table),
                predicates.join(" AND ")
            );
            let rows = try_outcome!(conn.select(cx, &sql, values).await);
            Outcome::Ok(rows.first().and_then(|row| row.get(0).cloned()))
        })
    }

    fn load_property<'a>(
        &'a self,
        cx: &'a Cx,
        conn: &'a ReactiveConnection,
        id: &'a Value,
        index: usize,
    ) -> BoxFuture<'a, PropertyValue> {
        Box::pin(async move {
            let meta = &*self.meta;
            let Some(prop) = meta.properties.get(index) else {
                return Outcome::Err(Error::mapping(
                    MappingErrorKind::UnknownProperty,
                    format!("{} has no property #{index}", meta.name),
                ));
            };
            let (columns, from) = self.select_from(conn, |p| std::ptr::eq(p, prop));
            if columns.is_empty() {
                return Outcome::Ok(PropertyValue::Null);
            }
            let sql = format!(
                "SELECT {} FROM {from} WHERE t0.{} = ?",
                columns.join(", "),
                quote(conn, &meta.id_column)
            );
            match try_outcome!(conn.select_one(cx, &sql, &[id.clone()]).await) {
                Some(row) => Outcome::Ok(hydrate_property(prop, &row)),
                None => Outcome::Err(Error::persistence(
                    PersistenceErrorKind::ObjectNotFound,
                    &meta.name,
                    Some(&prop.name),
                    format!("no row with id {id}"),
                )),
            }
        })
    }

    fn next_sequence_value<'a>(
        &'a self,
        cx: &'a Cx,
        conn: &'a ReactiveConnection,
    ) -> BoxFuture<'a, Value> {
        Box::pin(async move {
            let meta = &*self.meta;
            let IdGeneration::Sequence(sequence) = &meta.id_generation else {
                return Outcome::Err(Error::mapping(
                    MappingErrorKind::Invalid,
                    format!("{} does not draw identifiers from a sequence", meta.name),
                ));
            };
            let sql = conn.dialect().sequence_next_value_sql(sequence);
            let row = try_outcome!(conn.select_one(cx, &sql, &[]).await);
            match row.and_then(|r| r.get(0).cloned()) {
                Some(value) if value != Value::Null => Outcome::Ok(value),
                _ => Outcome::Err(Error::persistence(
                    PersistenceErrorKind::NullIdentifier,
                    &meta.name,
                    None,
                    format!("sequence {sequence} returned no value"),
                )),
            }
        })
    }
}

fn generated_at(prop: &PropertyMeta, timing: GenerationTiming) -> bool {
    match prop.generated {
        GenerationTiming::Never => false,
        GenerationTiming::Always => true,
        GenerationTiming::Insert => timing == GenerationTiming::Insert,
    }
}

/// Column names a property occupies in its table.
fn column_names(prop: &PropertyMeta) -> Vec<String> {
    match &prop.ty {
        PropertyType::Basic => prop.column.iter().cloned().collect(),
        PropertyType::Entity(assoc) if assoc.fk_direction == ForeignKeyDirection::FromParent => {
            prop.column.iter().cloned().collect()
        }
        PropertyType::Entity(_) | PropertyType::Collection(_) => Vec::new(),
        PropertyType::Any(any) => vec![any.type_column.clone(), any.id_column.clone()],
        PropertyType::Component(component) => {
            component.properties.iter().flat_map(column_names).collect()
        }
    }
}

/// Append the `(column, value)` pairs a property writes.
pub(crate) fn property_columns(
    prop: &PropertyMeta,
    value: &PropertyValue,
    out: &mut Vec<(String, Value)>,
) {
    if value.is_uninitialized() {
        return;
    }
    match &prop.ty {
        PropertyType::Basic => {
            if let Some(column) = &prop.column {
                out.push((column.clone(), value.as_value().cloned().unwrap_or(Value::Null)));
            }
        }
        PropertyType::Entity(assoc) => {
            if assoc.fk_direction == ForeignKeyDirection::FromParent {
                if let Some(column) = &prop.column {
                    let id = value.as_entity().and_then(EntityRef::id);
                    out.push((column.clone(), id.unwrap_or(Value::Null)));
                }
            }
        }
        PropertyType::Any(any) => {
            let target = value.as_entity();
            let (name, id) = match target.and_then(|r| r.id().map(|id| (r.entity_name().to_string(), id))) {
                Some((name, id)) => (Value::Text(name), id),
                None => (Value::Null, Value::Null),
            };
            out.push((any.type_column.clone(), name));
            out.push((any.id_column.clone(), id));
        }
        PropertyType::Collection(_) => {}
        PropertyType::Component(component) => {
            let values = match value {
                PropertyValue::Component(values) => values.as_slice(),
                _ => &[],
            };
            for (i, sub) in component.properties.iter().enumerate() {
                let v = values.get(i).cloned().unwrap_or_default();
                property_columns(sub, &v, out);
            }
        }
    }
}

fn hydrate_property(prop: &PropertyMeta, row: &Row) -> PropertyValue {
    match &prop.ty {
        PropertyType::Basic => match prop.column.as_deref().and_then(|c| row.get_by_name(c)) {
            Some(v) => PropertyValue::Basic(v.clone()),
            None if prop.lazy => PropertyValue::Uninitialized,
            None => PropertyValue::Null,
        },
        PropertyType::Entity(assoc) => {
            if assoc.fk_direction == ForeignKeyDirection::ToParent {
                return PropertyValue::Uninitialized;
            }
            match prop.column.as_deref().and_then(|c| row.get_by_name(c)) {
                Some(Value::Null) => PropertyValue::Null,
                Some(id) => PropertyValue::Entity(EntityRef::Unloaded(EntityKey::new(
                    assoc.entity.as_str(),
                    id.clone(),
                ))),
                None if prop.lazy => PropertyValue::Uninitialized,
                None => PropertyValue::Null,
            }
        }
        PropertyType::Any(any) => {
            let name = row.get_by_name(&any.type_column).and_then(Value::as_str);
            let id = row.get_by_name(&any.id_column);
            match (name, id) {
                (Some(name), Some(id)) if *id != Value::Null => PropertyValue::Entity(
                    EntityRef::Unloaded(EntityKey::new(name, id.clone())),
                ),
                _ => PropertyValue::Null,
            }
        }
        PropertyType::Collection(c) => {
            PropertyValue::Collection(CollectionHandle::uninitialized(c.role.clone()))
        }
        PropertyType::Component(component) => {
            if prop.lazy && !column_names(prop).iter().any(|c| row.get_by_name(c).is_some()) {
                return PropertyValue::Uninitialized;
            }
            PropertyValue::Component(
                component
                    .properties
                    .iter()
                    .map(|sub| hydrate_property(sub, row))
                    .collect(),
            )
        }
    }
}

/// Build instance state from a loaded row.
///
/// Foreign keys become unloaded references, collections uninitialized placeholders and
/// inverse one-to-ones are left uninitialized.
pub(crate) fn hydrate(meta: &EntityMetadata, row: &Row) -> Result<EntityData> {
    let id = row.require(&meta.id_column)?.clone();
    let version = match &meta.version_column {
        Some(column) => row.get_by_name(column).and_then(Value::as_i64),
        None => None,
    };
    let properties = meta
        .properties
        .iter()
        .map(|prop| hydrate_property(prop, row))
        .collect();
    Ok(EntityData {
        id: Some(id),
        version,
        properties,
    })
}

/// Copy generated column values from `row` into `state`.
pub(crate) fn apply_generated(
    meta: &EntityMetadata,
    row: &Row,
    timing: GenerationTiming,
    state: &mut [PropertyValue],
) {
    for (i, prop) in meta.properties.iter().enumerate() {
        if generated_at(prop, timing) && i < state.len() {
            state[i] = hydrate_property(prop, row);
        }
    }
}
