//! Purpose: Row predicates, assignments, projections, and access-path planning.
//! Exports: `Predicate`, `Assignment`, `Projection`, `Filter`, `Access`, `plan_access`.
//! Role: Pure layer used by the engine; binds names to positions and picks an index.
//! Invariants: Comparisons use SQL three-valued logic; a row matches only on TRUE.
//! Invariants: Planning never changes results, only which rows are examined.

use std::cmp::Ordering;
use std::ops::Bound;

use crate::core::error::{Error, ErrorKind};
use crate::core::schema::{ColumnType, Schema};
use crate::core::value::Value;

#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    All,
    Eq(String, Value),
    Ne(String, Value),
    Lt(String, Value),
    Le(String, Value),
    Gt(String, Value),
    Ge(String, Value),
    /// Inclusive on both ends.
    Between(String, Value, Value),
    IsNull(String),
    IsNotNull(String),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Eq(column.into(), value.into())
    }

    pub fn ne(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Ne(column.into(), value.into())
    }

    pub fn lt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Lt(column.into(), value.into())
    }

    pub fn le(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Le(column.into(), value.into())
    }

    pub fn gt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Gt(column.into(), value.into())
    }

    pub fn ge(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Ge(column.into(), value.into())
    }

    pub fn between(
        column: impl Into<String>,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> Self {
        Predicate::Between(column.into(), low.into(), high.into())
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Predicate::And(mut parts) => {
                parts.push(other);
                Predicate::And(parts)
            }
            first => Predicate::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Predicate) -> Self {
        match self {
            Predicate::Or(mut parts) => {
                parts.push(other);
                Predicate::Or(parts)
            }
            first => Predicate::Or(vec![first, other]),
        }
    }

    pub fn negate(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    /// Resolves column names and checks literal types against `schema`.
    pub fn bind(&self, schema: &Schema) -> Result<Filter, Error> {
        let compare = |column: &str, op: CmpOp, value: &Value| -> Result<Filter, Error> {
            let (position, value) = bind_literal(schema, column, value)?;
            Ok(Filter::Compare(position, op, value))
        };
        Ok(match self {
            Predicate::All => Filter::All,
            Predicate::Eq(column, value) => compare(column, CmpOp::Eq, value)?,
            Predicate::Ne(column, value) => compare(column, CmpOp::Ne, value)?,
            Predicate::Lt(column, value) => compare(column, CmpOp::Lt, value)?,
            Predicate::Le(column, value) => compare(column, CmpOp::Le, value)?,
            Predicate::Gt(column, value) => compare(column, CmpOp::Gt, value)?,
            Predicate::Ge(column, value) => compare(column, CmpOp::Ge, value)?,
            Predicate::Between(column, low, high) => {
                let (position, low) = bind_literal(schema, column, low)?;
                let (_, high) = bind_literal(schema, column, high)?;
                Filter::Between(position, low, high)
            }
            Predicate::IsNull(column) => Filter::IsNull(schema.column_index(column)?),
            Predicate::IsNotNull(column) => Filter::IsNotNull(schema.column_index(column)?),
            Predicate::And(parts) => Filter::And(
                parts
                    .iter()
                    .map(|part| part.bind(schema))
                    .collect::<Result<_, _>>()?,
            ),
            Predicate::Or(parts) => Filter::Or(
                parts
                    .iter()
                    .map(|part| part.bind(schema))
                    .collect::<Result<_, _>>()?,
            ),
            Predicate::Not(inner) => Filter::Not(Box::new(inner.bind(schema)?)),
        })
    }
}

fn bind_literal(schema: &Schema, column: &str, value: &Value) -> Result<(usize, Value), Error> {
    let position = schema.column_index(column)?;
    // Literals are only compared, so VARCHAR length limits do not apply to them.
    let column_type = match schema.columns[position].column_type {
        ColumnType::Varchar(_) => ColumnType::Text,
        other => other,
    };
    let value = column_type.coerce(value.clone()).map_err(|err| {
        Error::new(ErrorKind::Schema)
            .with_message(format!(
                "predicate on '{column}': {}",
                err.message().unwrap_or("type mismatch")
            ))
            .with_table(&schema.table)
    })?;
    Ok((position, value))
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn holds(&self, ordering: Ordering) -> bool {
        match self {
            CmpOp::Eq => ordering == Ordering::Equal,
            CmpOp::Ne => ordering != Ordering::Equal,
            CmpOp::Lt => ordering == Ordering::Less,
            CmpOp::Le => ordering != Ordering::Greater,
            CmpOp::Gt => ordering == Ordering::Greater,
            CmpOp::Ge => ordering != Ordering::Less,
        }
    }
}

/// A predicate bound to column positions.
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    All,
    Compare(usize, CmpOp, Value),
    Between(usize, Value, Value),
    IsNull(usize),
    IsNotNull(usize),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    /// Column positions the filter reads, ascending and deduplicated.
    pub fn positions(&self) -> Vec<usize> {
        let mut out = Vec::new();
        self.collect_positions(&mut out);
        out.sort_unstable();
        out.dedup();
        out
    }

    fn collect_positions(&self, out: &mut Vec<usize>) {
        match self {
            Filter::All => {}
            Filter::Compare(position, _, _)
            | Filter::Between(position, _, _)
            | Filter::IsNull(position)
            | Filter::IsNotNull(position) => out.push(*position),
            Filter::And(parts) | Filter::Or(parts) => {
                for part in parts {
                    part.collect_positions(out);
                }
            }
            Filter::Not(inner) => inner.collect_positions(out),
        }
    }

    /// `value_at(position)` supplies column values; `None` result means UNKNOWN.
    pub fn eval<'v>(&self, value_at: &dyn Fn(usize) -> Option<&'v Value>) -> Option<bool> {
        match self {
            Filter::All => Some(true),
            Filter::Compare(position, op, literal) => {
                let value = value_at(*position)?;
                value.compare(literal).map(|ordering| op.holds(ordering))
            }
            Filter::Between(position, low, high) => {
                let value = value_at(*position)?;
                let above = value.compare(low)? != Ordering::Less;
                let below = value.compare(high)? != Ordering::Greater;
                Some(above && below)
            }
            Filter::IsNull(position) => Some(value_at(*position)?.is_null()),
            Filter::IsNotNull(position) => Some(!value_at(*position)?.is_null()),
            Filter::And(parts) => {
                let mut result = Some(true);
                for part in parts {
                    match part.eval(value_at) {
                        Some(false) => return Some(false),
                        None => result = None,
                        Some(true) => {}
                    }
                }
                result
            }
            Filter::Or(parts) => {
                let mut result = Some(false);
                for part in parts {
                    match part.eval(value_at) {
                        Some(true) => return Some(true),
                        None => result = None,
                        Some(false) => {}
                    }
                }
                result
            }
            Filter::Not(inner) => inner.eval(value_at).map(|value| !value),
        }
    }

    /// Evaluates against values decoded for `positions` (same order).
    pub fn matches(&self, positions: &[usize], values: &[Value]) -> bool {
        let lookup = |position: usize| {
            positions
                .iter()
                .position(|p| *p == position)
                .and_then(|idx| values.get(idx))
        };
        self.eval(&lookup) == Some(true)
    }
}

/// `SET column = value`.
#[derive(Clone, Debug, PartialEq)]
pub struct Assignment {
    pub column: String,
    pub value: Value,
}

impl Assignment {
    pub fn new(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

/// Which columns a scan returns.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Projection {
    #[default]
    All,
    Columns(Vec<String>),
}

impl Projection {
    pub fn columns<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Projection::Columns(names.into_iter().map(Into::into).collect())
    }

    pub fn resolve(&self, schema: &Schema) -> Result<Vec<usize>, Error> {
        match self {
            Projection::All => Ok((0..schema.len()).collect()),
            Projection::Columns(names) => names
                .iter()
                .map(|name| schema.column_index(name))
                .collect(),
        }
    }
}

/// How the engine finds candidate rows.
#[derive(Clone, Debug, PartialEq)]
pub enum Access {
    FullScan,
    Index {
        position: usize,
        lower: Bound<Value>,
        upper: Bound<Value>,
    },
}

/// Picks an index range implied by `filter`, given the indexed column positions.
/// Only conjunctive comparisons narrow the candidates; the full filter is still
/// applied to every candidate row.
pub fn plan_access(filter: &Filter, indexed: &[usize]) -> Access {
    let usable = |position: &usize| indexed.contains(position);
    match filter {
        Filter::Compare(position, op, value) if usable(position) && !value.is_null() => {
            let key = value.clone();
            let (lower, upper) = match op {
                CmpOp::Eq => (Bound::Included(key.clone()), Bound::Included(key)),
                CmpOp::Lt => (Bound::Unbounded, Bound::Excluded(key)),
                CmpOp::Le => (Bound::Unbounded, Bound::Included(key)),
                CmpOp::Gt => (Bound::Excluded(key), Bound::Unbounded),
                CmpOp::Ge => (Bound::Included(key), Bound::Unbounded),
                CmpOp::Ne => return Access::FullScan,
            };
            Access::Index {
                position: *position,
                lower,
                upper,
            }
        }
        Filter::Between(position, low, high)
            if usable(position) && !low.is_null() && !high.is_null() =>
        {
            Access::Index {
                position: *position,
                lower: Bound::Included(low.clone()),
                upper: Bound::Included(high.clone()),
            }
        }
        Filter::And(parts) => {
            let mut choice = Access::FullScan;
            for part in parts {
                let candidate = plan_access(part, indexed);
                if matches!(candidate, Access::Index { lower: Bound::Included(ref low), upper: Bound::Included(ref high), .. } if low == high)
                {
                    return candidate;
                }
                if choice == Access::FullScan {
                    choice = candidate;
                }
            }
            choice
        }
        _ => Access::FullScan,
    }
}

#[cfg(test)]
mod tests {
    use super::{Access, Filter, Predicate, Projection, plan_access};
    use crate::core::error::ErrorKind;
    use crate::core::schema::{Column, ColumnType, Schema};
    use crate::core::value::{Decimal, Value};
    use std::ops::Bound;

    fn schema() -> Schema {
        Schema::new(
            "items",
            vec![
                Column::new("id", ColumnType::Int).primary_key(),
                Column::new("name", ColumnType::Varchar(4)),
                Column::new("price", ColumnType::Decimal).indexed(),
                Column::new("note", ColumnType::Text),
            ],
        )
        .expect("schema")
    }

    fn row(id: i64, name: &str, price: &str, note: Option<&str>) -> Vec<Value> {
        vec![
            Value::Int(id),
            Value::from(name),
            Value::Decimal(price.parse::<Decimal>().expect("decimal")),
            note.map_or(Value::Null, Value::from),
        ]
    }

    fn matches(predicate: &Predicate, values: &[Value]) -> bool {
        let filter = predicate.bind(&schema()).expect("bind");
        let positions: Vec<usize> = (0..values.len()).collect();
        filter.matches(&positions, values)
    }

    #[test]
    fn comparisons_follow_three_valued_logic() {
        let with_note = row(1, "ab", "2.5", Some("x"));
        let without_note = row(2, "cd", "3", None);
        assert!(matches(&Predicate::eq("note", "x"), &with_note));
        assert!(!matches(&Predicate::ne("note", "x"), &without_note));
        assert!(!matches(&Predicate::eq("note", "x").negate(), &without_note));
        assert!(matches(&Predicate::IsNull("note".into()), &without_note));
        assert!(matches(
            &Predicate::eq("note", "x").or(Predicate::eq("id", 2)),
            &without_note
        ));
        assert!(!matches(
            &Predicate::eq("note", "x").and(Predicate::eq("id", 2)),
            &without_note
        ));
        assert!(matches(&Predicate::between("price", 2, 3), &without_note));
        assert!(matches(&Predicate::gt("price", 2), &with_note));
    }

    #[test]
    fn binding_checks_columns_and_literal_types() {
        let schema = schema();
        let err = Predicate::eq("missing", 1).bind(&schema).expect_err("column");
        assert_eq!(err.kind(), ErrorKind::Schema);
        let err = Predicate::eq("id", "one").bind(&schema).expect_err("type");
        assert_eq!(err.kind(), ErrorKind::Schema);
        // Long literals against VARCHAR columns simply never match.
        Predicate::eq("name", "much too long").bind(&schema).expect("varchar literal");
        let bound = Predicate::eq("price", 3).bind(&schema).expect("widen");
        assert_eq!(
            bound,
            Filter::Compare(2, super::CmpOp::Eq, Value::Decimal(Decimal::from_i64(3)))
        );
    }

    #[test]
    fn planner_uses_indexed_columns_only() {
        let schema = schema();
        let indexed = schema.indexed_positions();
        let plan = |p: Predicate| plan_access(&p.bind(&schema).expect("bind"), &indexed);

        assert_eq!(plan(Predicate::eq("note", "x")), Access::FullScan);
        assert_eq!(plan(Predicate::ne("id", 1)), Access::FullScan);
        assert_eq!(
            plan(Predicate::eq("id", 7)),
            Access::Index {
                position: 0,
                lower: Bound::Included(Value::Int(7)),
                upper: Bound::Included(Value::Int(7)),
            }
        );
        let price = |n: i64| Value::Decimal(Decimal::from_i64(n));
        assert_eq!(
            plan(Predicate::gt("price", 5)),
            Access::Index {
                position: 2,
                lower: Bound::Excluded(price(5)),
                upper: Bound::Unbounded,
            }
        );
        // Equality wins over a range inside a conjunction.
        assert_eq!(
            plan(Predicate::gt("price", 5).and(Predicate::eq("id", 3))),
            Access::Index {
                position: 0,
                lower: Bound::Included(Value::Int(3)),
                upper: Bound::Included(Value::Int(3)),
            }
        );
        assert_eq!(
            plan(Predicate::eq("id", 3).or(Predicate::eq("id", 4))),
            Access::FullScan
        );
    }

    #[test]
    fn projection_resolves_names() {
        let schema = schema();
        assert_eq!(Projection::All.resolve(&schema).expect("all"), vec![0, 1, 2, 3]);
        assert_eq!(
            Projection::columns(["note", "id"]).resolve(&schema).expect("cols"),
            vec![3, 0]
        );
        let err = Projection::columns(["nope"]).resolve(&schema).expect_err("unknown");
        assert_eq!(err.kind(), ErrorKind::Schema);
    }
}
