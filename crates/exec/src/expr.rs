//! Scalar expressions evaluated chunk-at-a-time.
//!
//! The planner ships expressions inside the fragment descriptor; the runtime
//! evaluates them for projections, conjuncts, join keys, aggregate arguments
//! and exchange partitioning. Comparison supports both SQL equality and
//! null-safe equality (`<=>`).

use serde::{Deserialize, Serialize};

use basalt_chunk::{Chunk, Column, Datum, PrimitiveType};
use basalt_common::{EngineError, Result, SlotId};

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    /// SQL `=` (NULL yields NULL, collapsed to false in predicates).
    Eq,
    /// Null-safe `<=>`: NULL equals NULL.
    NullSafeEq,
    /// SQL `<>`.
    Ne,
    /// `<`.
    Lt,
    /// `<=`.
    Le,
    /// `>`.
    Gt,
    /// `>=`.
    Ge,
}

/// Arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithOp {
    /// Addition.
    Add,
    /// Subtraction.
    Sub,
    /// Multiplication.
    Mul,
    /// Division (always evaluates as double; NULL on zero divisor).
    Div,
    /// Modulo over integers.
    Mod,
}

/// One scalar expression node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "expr", rename_all = "snake_case")]
pub enum Expr {
    /// Reference to a chunk slot.
    SlotRef {
        /// Referenced slot.
        slot: SlotId,
        /// Declared type of the slot.
        ptype: PrimitiveType,
        /// Whether the slot may hold NULL.
        nullable: bool,
    },
    /// Constant value.
    Literal {
        /// The value; `Datum::Null` for typed NULL.
        value: Datum,
        /// Declared type.
        ptype: PrimitiveType,
    },
    /// Binary comparison.
    Cmp {
        /// Operator.
        op: CmpOp,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Binary arithmetic.
    Arith {
        /// Operator.
        op: ArithOp,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Conjunction over one or more predicates.
    And {
        /// Operands.
        args: Vec<Expr>,
    },
    /// Disjunction over one or more predicates.
    Or {
        /// Operands.
        args: Vec<Expr>,
    },
    /// Logical negation.
    Not {
        /// Operand.
        arg: Box<Expr>,
    },
    /// `IS NULL` / `IS NOT NULL`.
    IsNull {
        /// Operand.
        arg: Box<Expr>,
        /// True for `IS NOT NULL`.
        negated: bool,
    },
    /// `IN (v1, .., vn)` over literal values.
    InList {
        /// Tested operand.
        arg: Box<Expr>,
        /// Literal list.
        values: Vec<Datum>,
        /// True for `NOT IN`.
        negated: bool,
    },
}

impl Expr {
    /// Shorthand slot reference.
    pub fn slot(slot: SlotId, ptype: PrimitiveType, nullable: bool) -> Expr {
        Expr::SlotRef {
            slot,
            ptype,
            nullable,
        }
    }

    /// Shorthand int64 literal.
    pub fn int_lit(v: i64) -> Expr {
        Expr::Literal {
            value: Datum::Int64(v),
            ptype: PrimitiveType::Int64,
        }
    }

    /// Result type and nullability of this expression.
    pub fn output_type(&self) -> (PrimitiveType, bool) {
        match self {
            Expr::SlotRef {
                ptype, nullable, ..
            } => (*ptype, *nullable),
            Expr::Literal { value, ptype } => (*ptype, value.is_null()),
            Expr::Cmp { op, left, right } => {
                let nullable = *op != CmpOp::NullSafeEq
                    && (left.output_type().1 || right.output_type().1);
                (PrimitiveType::Boolean, nullable)
            }
            Expr::Arith { op, left, right } => {
                let (lt, ln) = left.output_type();
                let (rt, rn) = right.output_type();
                let ptype = match op {
                    ArithOp::Div => PrimitiveType::Float64,
                    ArithOp::Mod => PrimitiveType::Int64,
                    _ if lt.is_float() || rt.is_float() => PrimitiveType::Float64,
                    _ => PrimitiveType::Int64,
                };
                // Div/Mod can produce NULL on a zero divisor.
                (ptype, ln || rn || matches!(op, ArithOp::Div | ArithOp::Mod))
            }
            Expr::And { args } | Expr::Or { args } => (
                PrimitiveType::Boolean,
                args.iter().any(|a| a.output_type().1),
            ),
            Expr::Not { arg } => (PrimitiveType::Boolean, arg.output_type().1),
            Expr::IsNull { .. } => (PrimitiveType::Boolean, false),
            Expr::InList { arg, .. } => (PrimitiveType::Boolean, arg.output_type().1),
        }
    }

    /// Evaluate over every row of `chunk` into a column.
    pub fn evaluate(&self, chunk: &Chunk) -> Result<Column> {
        let rows = chunk.num_rows();
        match self {
            Expr::SlotRef { slot, .. } => chunk.column_by_slot(*slot).cloned(),
            Expr::Literal { value, ptype } => Ok(Column::Const(basalt_chunk::ConstColumn::new(
                *ptype,
                value.clone(),
                rows,
            ))),
            _ => {
                let (ptype, nullable) = self.output_type();
                let mut out = Column::new_for_type(ptype, nullable)?;
                for row in 0..rows {
                    let v = self.evaluate_row(chunk, row)?;
                    out.append_datum(&v)?;
                }
                Ok(out)
            }
        }
    }

    /// Evaluate as a predicate: one keep-flag per row, NULL collapsed to false.
    pub fn evaluate_predicate(&self, chunk: &Chunk) -> Result<Vec<bool>> {
        let mut keep = Vec::with_capacity(chunk.num_rows());
        for row in 0..chunk.num_rows() {
            keep.push(matches!(
                self.evaluate_row(chunk, row)?,
                Datum::Boolean(true)
            ));
        }
        Ok(keep)
    }

    /// Evaluate one row.
    pub fn evaluate_row(&self, chunk: &Chunk, row: usize) -> Result<Datum> {
        Ok(match self {
            Expr::SlotRef { slot, .. } => chunk.column_by_slot(*slot)?.get(row),
            Expr::Literal { value, .. } => value.clone(),
            Expr::Cmp { op, left, right } => {
                let l = left.evaluate_row(chunk, row)?;
                let r = right.evaluate_row(chunk, row)?;
                eval_cmp(*op, &l, &r)
            }
            Expr::Arith { op, left, right } => {
                let l = left.evaluate_row(chunk, row)?;
                let r = right.evaluate_row(chunk, row)?;
                eval_arith(*op, &l, &r)?
            }
            Expr::And { args } => {
                let mut saw_null = false;
                let mut result = true;
                for a in args {
                    match a.evaluate_row(chunk, row)? {
                        Datum::Boolean(false) => {
                            result = false;
                            break;
                        }
                        Datum::Null => saw_null = true,
                        _ => {}
                    }
                }
                if !result {
                    Datum::Boolean(false)
                } else if saw_null {
                    Datum::Null
                } else {
                    Datum::Boolean(true)
                }
            }
            Expr::Or { args } => {
                let mut saw_null = false;
                let mut result = false;
                for a in args {
                    match a.evaluate_row(chunk, row)? {
                        Datum::Boolean(true) => {
                            result = true;
                            break;
                        }
                        Datum::Null => saw_null = true,
                        _ => {}
                    }
                }
                if result {
                    Datum::Boolean(true)
                } else if saw_null {
                    Datum::Null
                } else {
                    Datum::Boolean(false)
                }
            }
            Expr::Not { arg } => match arg.evaluate_row(chunk, row)? {
                Datum::Boolean(b) => Datum::Boolean(!b),
                Datum::Null => Datum::Null,
                other => {
                    return Err(EngineError::InvalidArgument(format!(
                        "NOT applied to non-boolean {other:?}"
                    )))
                }
            },
            Expr::IsNull { arg, negated } => {
                let is_null = arg.evaluate_row(chunk, row)?.is_null();
                Datum::Boolean(is_null != *negated)
            }
            Expr::InList {
                arg,
                values,
                negated,
            } => {
                let v = arg.evaluate_row(chunk, row)?;
                if v.is_null() {
                    Datum::Null
                } else {
                    Datum::Boolean(values.contains(&v) != *negated)
                }
            }
        })
    }
}

fn eval_cmp(op: CmpOp, l: &Datum, r: &Datum) -> Datum {
    if op == CmpOp::NullSafeEq {
        return Datum::Boolean(match (l.is_null(), r.is_null()) {
            (true, true) => true,
            (false, false) => datum_eq(l, r),
            _ => false,
        });
    }
    if l.is_null() || r.is_null() {
        return Datum::Null;
    }
    let ord = l.order_cmp(r);
    Datum::Boolean(match op {
        CmpOp::Eq => datum_eq(l, r),
        CmpOp::Ne => !datum_eq(l, r),
        CmpOp::Lt => ord == std::cmp::Ordering::Less,
        CmpOp::Le => ord != std::cmp::Ordering::Greater,
        CmpOp::Gt => ord == std::cmp::Ordering::Greater,
        CmpOp::Ge => ord != std::cmp::Ordering::Less,
        CmpOp::NullSafeEq => unreachable!(),
    })
}

/// Value equality across the numeric family (Int32(2) equals Int64(2)).
fn datum_eq(l: &Datum, r: &Datum) -> bool {
    match (l.as_int(), r.as_int()) {
        (Some(a), Some(b)) => return a == b,
        (None, None) => {}
        _ => {
            if let (Some(a), Some(b)) = (l.as_float(), r.as_float()) {
                return a == b;
            }
            return false;
        }
    }
    match (l.as_float(), r.as_float()) {
        (Some(a), Some(b)) => a == b,
        _ => l == r,
    }
}

fn eval_arith(op: ArithOp, l: &Datum, r: &Datum) -> Result<Datum> {
    if l.is_null() || r.is_null() {
        return Ok(Datum::Null);
    }
    if op == ArithOp::Div {
        let (a, b) = numeric_pair(l, r)?;
        return Ok(if b == 0.0 {
            Datum::Null
        } else {
            Datum::Float64(a / b)
        });
    }
    if op == ArithOp::Mod {
        let (a, b) = int_pair(l, r)?;
        return Ok(if b == 0 {
            Datum::Null
        } else {
            Datum::Int64((a % b) as i64)
        });
    }
    let float = matches!(l, Datum::Float32(_) | Datum::Float64(_))
        || matches!(r, Datum::Float32(_) | Datum::Float64(_));
    if float {
        let (a, b) = numeric_pair(l, r)?;
        Ok(Datum::Float64(match op {
            ArithOp::Add => a + b,
            ArithOp::Sub => a - b,
            ArithOp::Mul => a * b,
            _ => unreachable!(),
        }))
    } else {
        let (a, b) = int_pair(l, r)?;
        Ok(Datum::Int64(match op {
            ArithOp::Add => a.wrapping_add(b) as i64,
            ArithOp::Sub => a.wrapping_sub(b) as i64,
            ArithOp::Mul => a.wrapping_mul(b) as i64,
            _ => unreachable!(),
        }))
    }
}

fn numeric_pair(l: &Datum, r: &Datum) -> Result<(f64, f64)> {
    match (l.as_float(), r.as_float()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(EngineError::InvalidArgument(format!(
            "arithmetic over non-numeric operands: {l:?}, {r:?}"
        ))),
    }
}

fn int_pair(l: &Datum, r: &Datum) -> Result<(i128, i128)> {
    match (l.as_int(), r.as_int()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(EngineError::InvalidArgument(format!(
            "integer arithmetic over non-integer operands: {l:?}, {r:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk() -> Chunk {
        Chunk::from_columns(vec![
            (SlotId(0), Column::int64(&[1, 2, 3, 4])),
            (SlotId(1), Column::nullable_int64(&[Some(10), None, Some(30), None])),
        ])
        .unwrap()
    }

    #[test]
    fn comparison_collapses_null_in_predicates() {
        let pred = Expr::Cmp {
            op: CmpOp::Gt,
            left: Box::new(Expr::slot(SlotId(1), PrimitiveType::Int64, true)),
            right: Box::new(Expr::int_lit(5)),
        };
        assert_eq!(
            pred.evaluate_predicate(&chunk()).unwrap(),
            vec![true, false, true, false]
        );
    }

    #[test]
    fn null_safe_equality_matches_nulls() {
        let pred = Expr::Cmp {
            op: CmpOp::NullSafeEq,
            left: Box::new(Expr::slot(SlotId(1), PrimitiveType::Int64, true)),
            right: Box::new(Expr::Literal {
                value: Datum::Null,
                ptype: PrimitiveType::Int64,
            }),
        };
        assert_eq!(
            pred.evaluate_predicate(&chunk()).unwrap(),
            vec![false, true, false, true]
        );
    }

    #[test]
    fn arithmetic_promotes_and_guards_division() {
        let div = Expr::Arith {
            op: ArithOp::Div,
            left: Box::new(Expr::slot(SlotId(0), PrimitiveType::Int64, false)),
            right: Box::new(Expr::int_lit(0)),
        };
        let col = div.evaluate(&chunk()).unwrap();
        assert_eq!(col.get(0), Datum::Null);

        let add = Expr::Arith {
            op: ArithOp::Add,
            left: Box::new(Expr::slot(SlotId(0), PrimitiveType::Int64, false)),
            right: Box::new(Expr::int_lit(5)),
        };
        assert_eq!(add.evaluate(&chunk()).unwrap().get(2), Datum::Int64(8));
    }

    #[test]
    fn in_list_round_trips_through_serde() {
        let expr = Expr::InList {
            arg: Box::new(Expr::slot(SlotId(0), PrimitiveType::Int64, false)),
            values: vec![Datum::Int64(2), Datum::Int64(4)],
            negated: false,
        };
        let json = serde_json::to_string(&expr).unwrap();
        let back: Expr = serde_json::from_str(&json).unwrap();
        assert_eq!(
            back.evaluate_predicate(&chunk()).unwrap(),
            vec![false, true, false, true]
        );
    }
}
