//! Mutation executor.
//!
//! Runs the statements of row mutations over a [`ReactiveConnection`], grouping
//! consecutive statements with identical SQL into batches and checking every affected-row
//! count against the mutation's [`Expectation`].

use asupersync::{Cx, Outcome};
use rxorm_core::error::{PersistenceErrorKind, RowCountError, RowCountErrorKind};
use rxorm_core::{Error, ReactiveConnection, Value};

/// What kind of row change a statement performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
    /// Collection row maintenance (link rows, foreign-key updates).
    Collection,
}

/// The affected-row count a statement must produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expectation {
    /// Any count is accepted.
    None,
    /// Exactly this many rows.
    RowCount(u64),
    /// Exactly one row; zero means a concurrent change (optimistic lock failure).
    #[default]
    Optimistic,
}

/// One statement of a row mutation.
#[derive(Debug, Clone)]
pub struct TableMutation {
    pub kind: MutationKind,
    pub table: String,
    pub sql: String,
    pub params: Vec<Value>,
    pub expectation: Expectation,
    pub entity: Option<String>,
    pub identifier: Option<Value>,
}

impl TableMutation {
    pub fn new(
        kind: MutationKind,
        table: impl Into<String>,
        sql: impl Into<String>,
        params: Vec<Value>,
    ) -> Self {
        Self {
            kind,
            table: table.into(),
            sql: sql.into(),
            params,
            expectation: Expectation::RowCount(1),
            entity: None,
            identifier: None,
        }
    }

    #[must_use]
    pub fn expect(mut self, expectation: Expectation) -> Self {
        self.expectation = expectation;
        self
    }

    #[must_use]
    pub fn for_entity(mut self, entity: impl Into<String>, identifier: Option<Value>) -> Self {
        self.entity = Some(entity.into());
        self.identifier = identifier;
        self
    }
}

#[derive(Debug)]
struct BatchCheck {
    expectation: Expectation,
    entity: Option<String>,
    identifier: Option<Value>,
}

#[derive(Debug)]
struct PendingBatch {
    sql: String,
    rows: Vec<Vec<Value>>,
    checks: Vec<BatchCheck>,
}

/// Executes row mutations with optional batching.
#[derive(Debug)]
pub struct MutationExecutor {
    batch_size: usize,
    pending: Option<PendingBatch>,
    statements: u64,
    batches: u64,
}

impl MutationExecutor {
    /// `batch_size <= 1` disables batching.
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            pending: None,
            statements: 0,
            batches: 0,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn has_pending_batch(&self) -> bool {
        self.pending.is_some()
    }

    /// Statements sent to the database so far.
    pub fn statements(&self) -> u64 {
        self.statements
    }

    /// Multi-row batches sent so far.
    pub fn batches(&self) -> u64 {
        self.batches
    }

    /// Execute a mutation immediately and check its row count.
    ///
    /// Any pending batch is flushed first so statements reach the database in order.
    pub async fn execute(
        &mut self,
        cx: &Cx,
        conn: &ReactiveConnection,
        mutation: TableMutation,
    ) -> Outcome<u64, Error> {
        try_outcome!(self.flush_batch(cx, conn).await);
        let count = try_outcome!(conn.update(cx, &mutation.sql, &mutation.params).await);
        self.statements += 1;
        try_result!(check(
            mutation.expectation,
            count,
            &mutation.sql,
            mutation.entity.as_deref(),
            mutation.identifier.as_ref(),
            None,
        ));
        Outcome::Ok(count)
    }

    /// Queue a mutation into the current batch, or run it now when batching is off.
    ///
    /// A mutation whose SQL differs from the pending batch flushes that batch first.
    pub async fn add(
        &mut self,
        cx: &Cx,
        conn: &ReactiveConnection,
        mutation: TableMutation,
    ) -> Outcome<(), Error> {
        if self.batch_size <= 1 {
            return match self.execute(cx, conn, mutation).await {
                Outcome::Ok(_) => Outcome::Ok(()),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            };
        }

        let same_shape = self
            .pending
            .as_ref()
            .is_some_and(|batch| batch.sql == mutation.sql);
        if !same_shape {
            try_outcome!(self.flush_batch(cx, conn).await);
        }

        let batch = self.pending.get_or_insert_with(|| PendingBatch {
            sql: mutation.sql.clone(),
            rows: Vec::new(),
            checks: Vec::new(),
        });
        batch.rows.push(mutation.params);
        batch.checks.push(BatchCheck {
            expectation: mutation.expectation,
            entity: mutation.entity,
            identifier: mutation.identifier,
        });

        if batch.rows.len() >= self.batch_size {
            try_outcome!(self.flush_batch(cx, conn).await);
        }
        Outcome::Ok(())
    }

    /// Execute an INSERT whose key the database generates and return that key.
    ///
    /// Never batched: dependent statements in the same flush need the key.
    pub async fn execute_returning_key(
        &mut self,
        cx: &Cx,
        conn: &ReactiveConnection,
        mutation: TableMutation,
        key_column: &str,
    ) -> Outcome<Value, Error> {
        try_outcome!(self.flush_batch(cx, conn).await);
        let key = try_outcome!(
            conn.update_returning(cx, &mutation.sql, &mutation.params, key_column)
                .await
        );
        self.statements += 1;
        match key {
            Some(value) if !matches!(value, Value::Null) => Outcome::Ok(value),
            _ => Outcome::Err(Error::persistence(
                PersistenceErrorKind::NullIdentifier,
                mutation.entity.as_deref().unwrap_or(&mutation.table),
                None,
                format!("insert into {} did not return a generated {key_column}", mutation.table),
            )),
        }
    }

    /// Send the pending batch, if any, and check every row count.
    pub async fn flush_batch(&mut self, cx: &Cx, conn: &ReactiveConnection) -> Outcome<(), Error> {
        let Some(batch) = self.pending.take() else {
            return Outcome::Ok(());
        };
        tracing::trace!(sql = %batch.sql, rows = batch.rows.len(), "flush batch");

        let counts = if batch.rows.len() == 1 {
            vec![try_outcome!(conn.update(cx, &batch.sql, &batch.rows[0]).await)]
        } else {
            let counts = try_outcome!(conn.update_batch(cx, &batch.sql, &batch.rows).await);
            self.batches += 1;
            counts
        };
        self.statements += batch.rows.len() as u64;

        if counts.len() != batch.checks.len() {
            return Outcome::Err(Error::RowCount(RowCountError {
                kind: RowCountErrorKind::BatchedRowCount,
                entity: None,
                identifier: None,
                expected: batch.checks.len() as u64,
                actual: counts.len() as u64,
                sql: Some(batch.sql),
                batch_position: None,
            }));
        }

        let batched = batch.rows.len() > 1;
        for (position, (count, c)) in counts.iter().zip(&batch.checks).enumerate() {
            try_result!(check(
                c.expectation,
                *count,
                &batch.sql,
                c.entity.as_deref(),
                c.identifier.as_ref(),
                batched.then_some(position),
            ));
        }
        Outcome::Ok(())
    }

    /// Drop the pending batch without executing it.
    pub fn discard_batch(&mut self) {
        if let Some(batch) = self.pending.take() {
            tracing::debug!(sql = %batch.sql, rows = batch.rows.len(), "discarding pending batch");
        }
    }
}

impl Default for MutationExecutor {
    fn default() -> Self {
        Self::new(1)
    }
}

fn check(
    expectation: Expectation,
    actual: u64,
    sql: &str,
    entity: Option<&str>,
    identifier: Option<&Value>,
    batch_position: Option<usize>,
) -> Result<(), Error> {
    let (expected, kind) = match expectation {
        Expectation::None => return Ok(()),
        Expectation::RowCount(n) if batch_position.is_some() => (n, RowCountErrorKind::BatchedRowCount),
        Expectation::RowCount(n) => (n, RowCountErrorKind::UnexpectedRowCount),
        Expectation::Optimistic => (1, RowCountErrorKind::StaleState),
    };
    if actual == expected {
        return Ok(());
    }
    // More rows than expected is never an optimistic failure.
    let kind = if kind == RowCountErrorKind::StaleState && actual > expected {
        RowCountErrorKind::UnexpectedRowCount
    } else {
        kind
    };
    Err(Error::RowCount(RowCountError {
        kind,
        entity: entity.map(str::to_string),
        identifier: identifier.map(ToString::to_string),
        expected,
        actual,
        sql: Some(sql.to_string()),
        batch_position,
    }))
}
