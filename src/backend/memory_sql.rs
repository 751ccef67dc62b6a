//! A process-local relational store.
//!
//! Tables are lists of column maps. Good enough to drive the caches in tests: it evaluates filters, enforces the
//! primary key and unique column groups, hands out auto-increment ids and counts the SELECTs issued against each table.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use crate::sql::Assign;
use crate::sql::Delete;
use crate::sql::Insert;
use crate::sql::Select;
use crate::sql::SelectMax;
use crate::sql::Update;
use crate::traits::SqlError;
use crate::traits::SqlStore;
use crate::types::Fields;
use crate::value::FieldKind;
use crate::value::FieldValue;

type Columns = BTreeMap<String, FieldValue>;

#[derive(Debug, Default)]
struct Table {
    primary_key: String,
    unique:      Vec<Vec<String>>,
    rows:        Vec<Columns>,
    last_id:     i64,
}

impl Table {
    fn duplicate_of(&self, row: &Columns) -> Option<String> {
        let pk = std::slice::from_ref(&self.primary_key);
        std::iter::once(pk)
            .chain(self.unique.iter().map(Vec::as_slice))
            .find(|columns| {
                let wanted: Vec<Option<&FieldValue>> = columns.iter().map(|c| row.get(c)).collect();
                wanted.iter().all(Option::is_some)
                    && self
                        .rows
                        .iter()
                        .any(|existing| columns.iter().map(|c| existing.get(c)).collect::<Vec<_>>() == wanted)
            })
            .map(|columns| columns.join(","))
    }
}

#[derive(Debug, Default)]
pub struct MemorySqlStore {
    tables:       Mutex<HashMap<String, Table>>,
    selects:      Mutex<HashMap<String, u64>>,
    fail_updates: AtomicBool,
}

impl MemorySqlStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty table. Integer primary keys missing from an INSERT are assigned by auto-increment.
    pub fn create_table(&self, name: &str, primary_key: &str) {
        self.tables.lock().insert(
            name.to_string(),
            Table {
                primary_key: primary_key.to_string(),
                ..Table::default()
            },
        );
    }

    pub fn add_unique(&self, table: &str, columns: &[&str]) {
        if let Some(table) = self.tables.lock().get_mut(table) {
            table.unique.push(columns.iter().map(|c| c.to_string()).collect());
        }
    }

    /// Seed a row, bypassing the statement layer.
    pub fn insert_row(&self, table: &str, row: Fields) -> Result<i64, SqlError> {
        let mut tables = self.tables.lock();
        let table = tables
            .get_mut(table)
            .ok_or_else(|| SqlError::Backend(format!("table '{table}' doesn't exist")))?;
        Self::store(table, row)
    }

    pub fn rows(&self, table: &str) -> Vec<Fields> {
        self.tables
            .lock()
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// SELECTs issued against a table, `SELECT MAX` included.
    pub fn select_count(&self, table: &str) -> u64 {
        self.selects.lock().get(table).copied().unwrap_or(0)
    }

    pub fn reset_counts(&self) {
        self.selects.lock().clear();
    }

    /// Make every following UPDATE fail.
    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::Release);
    }

    fn store(table: &mut Table, mut row: Columns) -> Result<i64, SqlError> {
        row.retain(|_, v| !v.is_null());
        let id = match row.get(&table.primary_key).and_then(FieldValue::as_i64) {
            Some(id) => id,
            None if !row.contains_key(&table.primary_key) => {
                let id = table.last_id + 1;
                row.insert(table.primary_key.clone(), FieldValue::Int(id));
                id
            }
            None => 0,
        };
        if let Some(columns) = table.duplicate_of(&row) {
            return Err(SqlError::DuplicateKey(columns));
        }
        table.last_id = table.last_id.max(id);
        table.rows.push(row);
        Ok(id)
    }

    fn count_select(&self, table: &str) {
        *self.selects.lock().entry(table.to_string()).or_default() += 1;
    }
}

// `COALESCE(current, 0) + delta`, the way `Assign::Add` renders.
fn add(current: Option<&FieldValue>, delta: &FieldValue) -> Result<FieldValue, SqlError> {
    let invalid = || SqlError::Backend(format!("cannot add {delta:?} to {current:?}"));
    let zero = match delta {
        FieldValue::Float(_) => FieldValue::Float(0.0),
        _ => FieldValue::Int(0),
    };
    let current = current.filter(|v| !v.is_null()).unwrap_or(&zero);
    Ok(match (current, delta) {
        (FieldValue::Int(a), d) => FieldValue::Int(a.checked_add(d.as_i64().ok_or_else(invalid)?).ok_or_else(invalid)?),
        (FieldValue::UInt(a), d) => {
            let sum = i128::from(*a) + i128::from(d.as_i64().ok_or_else(invalid)?);
            FieldValue::UInt(u64::try_from(sum).map_err(|_| invalid())?)
        }
        (FieldValue::Float(a), d) => FieldValue::Float(a + d.as_f64().ok_or_else(invalid)?),
        _ => return Err(invalid()),
    })
}

#[async_trait]
impl SqlStore for MemorySqlStore {
    async fn select(&self, query: &Select, kinds: &[FieldKind]) -> Result<Vec<Vec<FieldValue>>, SqlError> {
        self.count_select(&query.table);
        trace!("{query}");
        let tables = self.tables.lock();
        let table = tables
            .get(&query.table)
            .ok_or_else(|| SqlError::Backend(format!("table '{}' doesn't exist", query.table)))?;

        let limit = query.limit.map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));
        Ok(table
            .rows
            .iter()
            .filter(|row| query.filter.matches(|c| row.get(c)))
            .take(limit)
            .map(|row| {
                query
                    .columns
                    .iter()
                    .zip(kinds)
                    .map(|(column, kind)| {
                        let value = row.get(column).cloned().unwrap_or_default();
                        value.clone().conform(*kind).unwrap_or(value)
                    })
                    .collect()
            })
            .collect())
    }

    async fn select_max(&self, query: &SelectMax) -> Result<Option<i64>, SqlError> {
        self.count_select(&query.table);
        let tables = self.tables.lock();
        let table = tables
            .get(&query.table)
            .ok_or_else(|| SqlError::Backend(format!("table '{}' doesn't exist", query.table)))?;
        Ok(table
            .rows
            .iter()
            .filter_map(|row| row.get(&query.column).and_then(FieldValue::as_i64))
            .max())
    }

    async fn insert(&self, query: &Insert) -> Result<u64, SqlError> {
        trace!("{query}");
        let mut tables = self.tables.lock();
        let table = tables
            .get_mut(&query.table)
            .ok_or_else(|| SqlError::Backend(format!("table '{}' doesn't exist", query.table)))?;
        let id = Self::store(table, query.values.iter().cloned().collect())?;
        Ok(u64::try_from(id).unwrap_or(0))
    }

    async fn update(&self, query: &Update) -> Result<u64, SqlError> {
        trace!("{query}");
        if self.fail_updates.load(Ordering::Acquire) {
            return Err(SqlError::Backend("update rejected".to_string()));
        }
        let mut tables = self.tables.lock();
        let table = tables
            .get_mut(&query.table)
            .ok_or_else(|| SqlError::Backend(format!("table '{}' doesn't exist", query.table)))?;

        let mut affected = 0;
        for row in table.rows.iter_mut().filter(|row| query.filter.matches(|c| row.get(c))) {
            for (column, assign) in &query.assignments {
                let value = match assign {
                    Assign::Set(v) => v.clone(),
                    Assign::Add(delta) => add(row.get(column), delta)?,
                };
                if value.is_null() {
                    row.remove(column);
                }
                else {
                    row.insert(column.clone(), value);
                }
            }
            affected += 1;
        }
        Ok(affected)
    }

    async fn delete(&self, query: &Delete) -> Result<u64, SqlError> {
        trace!("{query}");
        let mut tables = self.tables.lock();
        let table = tables
            .get_mut(&query.table)
            .ok_or_else(|| SqlError::Backend(format!("table '{}' doesn't exist", query.table)))?;
        let before = table.rows.len();
        table.rows.retain(|row| !query.filter.matches(|c| row.get(c)));
        Ok((before - table.rows.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::Filter;
    use crate::sql::Predicate;

    fn store() -> MemorySqlStore {
        let store = MemorySqlStore::new();
        store.create_table("t", "id");
        store.add_unique("t", &["uid", "type"]);
        store
    }

    fn insert(values: &[(&str, FieldValue)]) -> Insert {
        Insert {
            table:  "t".into(),
            values: values.iter().map(|(c, v)| (c.to_string(), v.clone())).collect(),
        }
    }

    #[tokio::test]
    async fn assigns_ids_and_rejects_duplicates() {
        let store = store();
        let first = store
            .insert(&insert(&[("uid", 1.into()), ("type", 2.into())]))
            .await
            .unwrap();
        assert_eq!(first, 1);

        let err = store
            .insert(&insert(&[("uid", 1.into()), ("type", 2.into())]))
            .await
            .unwrap_err();
        assert!(err.is_duplicate_key());

        let err = store
            .insert(&insert(&[("id", 1.into()), ("uid", 5.into()), ("type", 2.into())]))
            .await
            .unwrap_err();
        assert!(err.is_duplicate_key());

        store
            .insert(&insert(&[("id", 40.into()), ("uid", 5.into()), ("type", 2.into())]))
            .await
            .unwrap();
        let max = store
            .select_max(&SelectMax {
                table:  "t".into(),
                column: "id".into(),
            })
            .await
            .unwrap();
        assert_eq!(max, Some(40));
    }

    #[tokio::test]
    async fn filters_updates_and_deletes() {
        let store = store();
        for (uid, age) in [(1, 10), (1, 20), (2, 30)] {
            store
                .insert(&insert(&[("uid", uid.into()), ("type", age.into()), ("age", age.into())]))
                .await
                .unwrap();
        }

        let select = Select {
            table:   "t".into(),
            columns: vec!["type".into(), "age".into()],
            filter:  Filter::all(vec![Predicate::eq("uid", 1), Predicate::ge("age", 15)]),
            limit:   None,
        };
        let rows = store.select(&select, &[FieldKind::Int, FieldKind::Int]).await.unwrap();
        assert_eq!(rows, vec![vec![FieldValue::Int(20), FieldValue::Int(20)]]);
        assert_eq!(store.select_count("t"), 1);

        let updated = store
            .update(&Update {
                table:       "t".into(),
                assignments: vec![("age".into(), Assign::Add(5.into())), ("name".into(), Assign::Set("x".into()))],
                filter:      Filter::all(vec![Predicate::eq("uid", 1)]),
            })
            .await
            .unwrap();
        assert_eq!(updated, 2);
        let ages: Vec<_> = store.rows("t").iter().map(|r| r["age"].clone()).collect();
        assert_eq!(ages, vec![FieldValue::Int(15), FieldValue::Int(25), FieldValue::Int(30)]);

        let deleted = store
            .delete(&Delete {
                table:  "t".into(),
                filter: Filter::all(vec![]).or_groups(vec![
                    vec![Predicate::eq("uid", 1), Predicate::eq("type", 10)],
                    vec![Predicate::eq("uid", 2), Predicate::eq("type", 30)],
                ]),
            })
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.rows("t").len(), 1);
    }

    #[tokio::test]
    async fn increments_treat_missing_values_as_zero() {
        let store = store();
        store
            .insert(&insert(&[("uid", 3.into()), ("type", 1.into())]))
            .await
            .unwrap();
        store
            .update(&Update {
                table:       "t".into(),
                assignments: vec![
                    ("age".into(), Assign::Add(4.into())),
                    ("score".into(), Assign::Add(FieldValue::Float(0.5))),
                ],
                filter:      Filter::all(vec![Predicate::eq("uid", 3)]),
            })
            .await
            .unwrap();
        let row = &store.rows("t")[0];
        assert_eq!(row["age"], FieldValue::Int(4));
        assert_eq!(row["score"], FieldValue::Float(0.5));
    }

    #[tokio::test]
    async fn failing_updates() {
        let store = store();
        store.fail_updates(true);
        let res = store
            .update(&Update {
                table:       "t".into(),
                assignments: vec![("age".into(), Assign::Set(1.into()))],
                filter:      Filter::default(),
            })
            .await;
        assert!(res.is_err());
    }
}
