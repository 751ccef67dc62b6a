//! Typed SQL statements emitted by the caches.
//!
//! Statements are plain data so that any [`SqlStore`](crate::traits::SqlStore) can execute them: the sea-orm backend
//! renders them through sea-query, the in-memory backend evaluates them directly. `Display` renders MySQL text and is
//! what ends up in the logs.

use std::cmp::Ordering;
use std::fmt::Display;

use sea_orm::sea_query::Alias;
use sea_orm::sea_query::Cond;
use sea_orm::sea_query::DeleteStatement;
use sea_orm::sea_query::Expr;
use sea_orm::sea_query::Func;
use sea_orm::sea_query::InsertStatement;
use sea_orm::sea_query::MysqlQueryBuilder;
use sea_orm::sea_query::Query;
use sea_orm::sea_query::SelectStatement;
use sea_orm::sea_query::SimpleExpr;
use sea_orm::sea_query::UpdateStatement;
use sea_orm::sea_query::Value;

use crate::traits::SqlError;
use crate::value::FieldValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    /// Evaluate the operator against an ordering; `None` (incomparable or NULL) never matches.
    pub fn holds(self, ord: Option<Ordering>) -> bool {
        let Some(ord) = ord
        else {
            return false;
        };
        match self {
            Self::Eq => ord == Ordering::Equal,
            Self::Ne => ord != Ordering::Equal,
            Self::Lt => ord == Ordering::Less,
            Self::Le => ord != Ordering::Greater,
            Self::Gt => ord == Ordering::Greater,
            Self::Ge => ord != Ordering::Less,
        }
    }
}

/// `column <op> value`
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub column: String,
    pub op:     CmpOp,
    pub value:  FieldValue,
}

macro_rules! predicate_ctor {
    ($($name:ident => $op:ident),* $(,)?) => {
        $(
            pub fn $name<C: Into<String>, V: Into<FieldValue>>(column: C, value: V) -> Self {
                Self::new(column, CmpOp::$op, value)
            }
        )*
    };
}

impl Predicate {
    pub fn new<C: Into<String>, V: Into<FieldValue>>(column: C, op: CmpOp, value: V) -> Self {
        Self {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    predicate_ctor! {
        eq => Eq,
        ne => Ne,
        lt => Lt,
        le => Le,
        gt => Gt,
        ge => Ge,
    }

    pub fn matches(&self, actual: Option<&FieldValue>) -> bool {
        match actual {
            Some(v) if !v.is_null() && !self.value.is_null() => self.op.holds(v.partial_cmp(&self.value)),
            _ => false,
        }
    }

    fn to_expr(&self) -> SimpleExpr {
        let col = Expr::col(Alias::new(&self.column));
        let value = sql_value(&self.value);
        match self.op {
            CmpOp::Eq => col.eq(value),
            CmpOp::Ne => col.ne(value),
            CmpOp::Lt => col.lt(value),
            CmpOp::Le => col.lte(value),
            CmpOp::Gt => col.gt(value),
            CmpOp::Ge => col.gte(value),
        }
    }
}

/// WHERE clause: every predicate of `all` AND, if non-empty, at least one of the `any` groups (each group AND-ed).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub all: Vec<Predicate>,
    pub any: Vec<Vec<Predicate>>,
}

impl Filter {
    pub fn all(predicates: Vec<Predicate>) -> Self {
        Self {
            all: predicates,
            any: Vec::new(),
        }
    }

    pub fn and(mut self, predicates: impl IntoIterator<Item = Predicate>) -> Self {
        self.all.extend(predicates);
        self
    }

    pub fn or_groups(mut self, groups: Vec<Vec<Predicate>>) -> Self {
        self.any = groups;
        self
    }

    pub fn matches<'a, F>(&self, lookup: F) -> bool
    where
        F: Fn(&str) -> Option<&'a FieldValue>,
    {
        self.all.iter().all(|p| p.matches(lookup(&p.column)))
            && (self.any.is_empty()
                || self
                    .any
                    .iter()
                    .any(|group| group.iter().all(|p| p.matches(lookup(&p.column)))))
    }

    fn to_condition(&self) -> Cond {
        let mut cond = Cond::all();
        for p in &self.all {
            cond = cond.add(p.to_expr());
        }
        if !self.any.is_empty() {
            let mut alternatives = Cond::any();
            for group in &self.any {
                let mut and = Cond::all();
                for p in group {
                    and = and.add(p.to_expr());
                }
                alternatives = alternatives.add(and);
            }
            cond = cond.add(alternatives);
        }
        cond
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub table:   String,
    pub columns: Vec<String>,
    pub filter:  Filter,
    pub limit:   Option<u64>,
}

impl Select {
    pub fn to_statement(&self) -> SelectStatement {
        let mut query = Query::select();
        query
            .columns(self.columns.iter().map(Alias::new))
            .from(Alias::new(&self.table))
            .cond_where(self.filter.to_condition());
        if let Some(limit) = self.limit {
            query.limit(limit);
        }
        query
    }
}

/// `SELECT MAX(column) FROM table`
#[derive(Debug, Clone, PartialEq)]
pub struct SelectMax {
    pub table:  String,
    pub column: String,
}

impl SelectMax {
    pub fn to_statement(&self) -> SelectStatement {
        let mut query = Query::select();
        query
            .expr(Func::max(Expr::col(Alias::new(&self.column))))
            .from(Alias::new(&self.table));
        query
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub table:  String,
    pub values: Vec<(String, FieldValue)>,
}

impl Insert {
    pub fn to_statement(&self) -> Result<InsertStatement, SqlError> {
        let mut query = Query::insert();
        query
            .into_table(Alias::new(&self.table))
            .columns(self.values.iter().map(|(c, _)| Alias::new(c)))
            .values(self.values.iter().map(|(_, v)| SimpleExpr::from(sql_value(v))))
            .map_err(|e| SqlError::Backend(e.to_string()))?;
        Ok(query)
    }

    pub fn value_of(&self, column: &str) -> Option<&FieldValue> {
        self.values.iter().find(|(c, _)| c == column).map(|(_, v)| v)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Assign {
    /// `column = value`
    Set(FieldValue),
    /// `column = COALESCE(column, 0) + value`
    Add(FieldValue),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub table:       String,
    pub assignments: Vec<(String, Assign)>,
    pub filter:      Filter,
}

impl Update {
    pub fn to_statement(&self) -> UpdateStatement {
        let mut query = Query::update();
        query.table(Alias::new(&self.table));
        for (column, assign) in &self.assignments {
            let expr: SimpleExpr = match assign {
                Assign::Set(v) => sql_value(v).into(),
                Assign::Add(v) => {
                    let current: [SimpleExpr; 2] = [Expr::col(Alias::new(column)).into(), Expr::val(0).into()];
                    Expr::expr(Func::coalesce(current)).add(sql_value(v))
                }
            };
            query.value(Alias::new(column), expr);
        }
        query.cond_where(self.filter.to_condition());
        query
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    pub table:  String,
    pub filter: Filter,
}

impl Delete {
    pub fn to_statement(&self) -> DeleteStatement {
        let mut query = Query::delete();
        query
            .from_table(Alias::new(&self.table))
            .cond_where(self.filter.to_condition());
        query
    }
}

pub(crate) fn sql_value(v: &FieldValue) -> Value {
    match v {
        FieldValue::Null => Value::from(None::<String>),
        FieldValue::Bool(b) => Value::from(*b),
        FieldValue::Int(i) => Value::from(*i),
        FieldValue::UInt(u) => Value::from(*u),
        FieldValue::Float(f) => Value::from(*f),
        FieldValue::Str(s) => Value::from(s.clone()),
        FieldValue::Bytes(b) => Value::from(b.clone()),
        FieldValue::Time(t) => Value::from(*t),
        FieldValue::Json(j) => Value::from(j.to_string()),
    }
}

impl Display for Select {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_statement().to_string(MysqlQueryBuilder))
    }
}

impl Display for SelectMax {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_statement().to_string(MysqlQueryBuilder))
    }
}

impl Display for Insert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_statement() {
            Ok(stmt) => f.write_str(&stmt.to_string(MysqlQueryBuilder)),
            Err(e) => write!(f, "<invalid insert into {}: {e}>", self.table),
        }
    }
}

impl Display for Update {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_statement().to_string(MysqlQueryBuilder))
    }
}

impl Display for Delete {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_statement().to_string(MysqlQueryBuilder))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_renders_conditions_and_filter() {
        let select = Select {
            table:   "test".into(),
            columns: vec!["id".into(), "uid".into(), "name".into()],
            filter:  Filter::all(vec![Predicate::eq("uid", 123), Predicate::eq("type", 9)])
                .and([Predicate::ge("age", 20)]),
            limit:   None,
        };
        assert_eq!(
            select.to_string(),
            "SELECT `id`, `uid`, `name` FROM `test` WHERE `uid` = 123 AND `type` = 9 AND `age` >= 20"
        );
    }

    #[test]
    fn update_with_increment() {
        let update = Update {
            table:       "test3".into(),
            assignments: vec![
                ("name".into(), Assign::Set("x".into())),
                ("age".into(), Assign::Add(5.into())),
            ],
            filter:      Filter::all(vec![Predicate::eq("uid", 1)]),
        };
        assert_eq!(
            update.to_string(),
            "UPDATE `test3` SET `name` = 'x', `age` = COALESCE(`age`, 0) + 5 WHERE `uid` = 1"
        );
    }

    #[test]
    fn delete_with_key_groups() {
        let delete = Delete {
            table:  "items".into(),
            filter: Filter::all(vec![Predicate::eq("uid", 1)]).or_groups(vec![
                vec![Predicate::eq("type", 7)],
                vec![Predicate::eq("type", 8)],
            ]),
        };
        let sql = delete.to_string();
        assert!(sql.starts_with("DELETE FROM `items` WHERE `uid` = 1 AND "), "{sql}");
        assert!(sql.contains("`type` = 7 OR `type` = 8"), "{sql}");
    }

    #[test]
    fn filter_matching_skips_nulls() {
        let filter = Filter::all(vec![Predicate::ge("age", 20)]);
        let age = FieldValue::Int(30);
        let null = FieldValue::Null;
        assert!(filter.matches(|_| Some(&age)));
        assert!(!filter.matches(|_| Some(&null)));
        assert!(!filter.matches(|_| None));
    }
}
