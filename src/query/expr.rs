//! Expressions for `where` and `extend`: constants, fields, comparisons,
//! boolean connectives, and decimal-safe arithmetic. Evaluation reads
//! packed column bytes out of the row and works on [`Value`]s.

use std::cmp::Ordering;

use eyre::Result;

use crate::encoding::pack;
use crate::errors::runtime;
use crate::value::{Dec, NumParts, Value};

use super::{Header, Row, Thread};

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Constant(Value),
    Field(String),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    Add,
    Sub,
    Mul,
    Div,
    Cat,
}

impl Expr {
    pub fn eval(&self, hdr: &Header, row: &Row, th: &Thread) -> Result<Value> {
        th.check_interrupt()?;
        match self {
            Expr::Constant(v) => Ok(v.clone()),
            Expr::Field(name) => pack::unpack(&row.get_raw(hdr, name)),
            Expr::Unary(op, e) => {
                let v = e.eval(hdr, row, th)?;
                match op {
                    UnOp::Not => match v {
                        Value::Bool(b) => Ok(Value::Bool(!b)),
                        v => Err(runtime(format!("not: expected boolean, got {}", v))),
                    },
                    UnOp::Neg => match v {
                        Value::Int(n) => Ok(Value::Int(-n)),
                        Value::Dec(d) => Ok(Value::Dec(Dec {
                            coef: -d.coef,
                            exp: d.exp,
                        })),
                        v => Err(runtime(format!("unary -: expected number, got {}", v))),
                    },
                }
            }
            Expr::Binary(op, l, r) => {
                let a = l.eval(hdr, row, th)?;
                let b = r.eval(hdr, row, th)?;
                binary(*op, a, b)
            }
            Expr::And(es) => {
                for e in es {
                    if !truthy(&e.eval(hdr, row, th)?) {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            Expr::Or(es) => {
                for e in es {
                    if truthy(&e.eval(hdr, row, th)?) {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
        }
    }

    /// Column names this expression reads.
    pub fn columns(&self) -> Vec<String> {
        let mut cols = Vec::new();
        self.collect_columns(&mut cols);
        cols
    }

    fn collect_columns(&self, cols: &mut Vec<String>) {
        match self {
            Expr::Constant(_) => {}
            Expr::Field(name) => {
                if !cols.contains(name) {
                    cols.push(name.clone());
                }
            }
            Expr::Unary(_, e) => e.collect_columns(cols),
            Expr::Binary(_, l, r) => {
                l.collect_columns(cols);
                r.collect_columns(cols);
            }
            Expr::And(es) | Expr::Or(es) => {
                for e in es {
                    e.collect_columns(cols);
                }
            }
        }
    }

    /// The top-level conjuncts of this expression.
    pub fn conjuncts(&self) -> Vec<&Expr> {
        match self {
            Expr::And(es) => es.iter().collect(),
            e => vec![e],
        }
    }

    /// `col = constant` shape, returning (column, packed constant).
    pub fn col_eq_const(&self) -> Option<(String, Vec<u8>)> {
        if let Expr::Binary(BinOp::Eq, l, r) = self {
            match (l.as_ref(), r.as_ref()) {
                (Expr::Field(col), Expr::Constant(v)) | (Expr::Constant(v), Expr::Field(col)) => {
                    return Some((col.clone(), pack::packed(v)));
                }
                _ => {}
            }
        }
        None
    }
}

pub fn truthy(v: &Value) -> bool {
    matches!(v, Value::Bool(true))
}

fn binary(op: BinOp, a: Value, b: Value) -> Result<Value> {
    match op {
        BinOp::Eq => Ok(Value::Bool(a == b)),
        BinOp::Ne => Ok(Value::Bool(a != b)),
        BinOp::Lt => Ok(Value::Bool(a.compare(&b) == Ordering::Less)),
        BinOp::Lte => Ok(Value::Bool(a.compare(&b) != Ordering::Greater)),
        BinOp::Gt => Ok(Value::Bool(a.compare(&b) == Ordering::Greater)),
        BinOp::Gte => Ok(Value::Bool(a.compare(&b) != Ordering::Less)),
        BinOp::Cat => match (a.as_str(), b.as_str()) {
            (Some(x), Some(y)) => Ok(Value::str(format!("{}{}", x, y))),
            _ => Err(runtime("$: expected strings")),
        },
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => arith(op, a, b),
    }
}

/// Decimal arithmetic over the shared `(coef, exp)` representation.
pub fn arith(op: BinOp, a: Value, b: Value) -> Result<Value> {
    let (pa, pb) = match (a.num_parts(), b.num_parts()) {
        (Some(pa), Some(pb)) => (pa, pb),
        _ => return Err(runtime(format!("arithmetic on non-numbers: {} and {}", a, b))),
    };
    let (ca, ea) = coef_exp(&pa);
    let (cb, eb) = coef_exp(&pb);
    match op {
        BinOp::Add | BinOp::Sub => {
            let (ca, cb, e) = align(ca, ea, cb, eb)?;
            let c = if op == BinOp::Add { ca + cb } else { ca - cb };
            from_coef_exp(c, e)
        }
        BinOp::Mul => from_coef_exp(ca.checked_mul(cb).ok_or_else(|| runtime("* overflow"))?, ea + eb),
        BinOp::Div => {
            if cb == 0 {
                return Err(runtime("divide by zero"));
            }
            // scale the dividend for ~15 digits of quotient precision
            let scale = 15i32;
            let scaled = ca
                .checked_mul(10i128.pow(scale as u32))
                .ok_or_else(|| runtime("/ overflow"))?;
            from_coef_exp(scaled / cb, ea - eb - scale)
        }
        _ => unreachable!("arith called with non-arithmetic BinOp"),
    }
}

fn coef_exp(p: &NumParts) -> (i128, i32) {
    if p.sign == 0 {
        return (0, 0);
    }
    let mut c: i128 = 0;
    for &d in &p.digits {
        c = c * 10 + d as i128;
    }
    (c * p.sign as i128, p.exp - p.digits.len() as i32)
}

fn align(ca: i128, ea: i32, cb: i128, eb: i32) -> Result<(i128, i128, i32)> {
    let e = ea.min(eb);
    let scale = |c: i128, from: i32| -> Result<i128> {
        let shift = (from - e) as u32;
        if shift > 38 {
            return Err(runtime("number too large to align"));
        }
        c.checked_mul(10i128.pow(shift))
            .ok_or_else(|| runtime("arithmetic overflow"))
    };
    Ok((scale(ca, ea)?, scale(cb, eb)?, e))
}

fn from_coef_exp(mut c: i128, mut e: i32) -> Result<Value> {
    while c != 0 && c % 10 == 0 {
        c /= 10;
        e += 1;
    }
    if c == 0 {
        return Ok(Value::Int(0));
    }
    while !(i64::MIN as i128..=i64::MAX as i128).contains(&c) {
        c /= 10;
        e += 1;
    }
    if e == 0 {
        return Ok(Value::Int(c as i64));
    }
    if (1..=18).contains(&e) {
        if let Some(n) = 10i64.checked_pow(e as u32).and_then(|p| (c as i64).checked_mul(p)) {
            return Ok(Value::Int(n));
        }
    }
    if !(i8::MIN as i32..=i8::MAX as i32).contains(&e) {
        return Err(runtime("number out of range"));
    }
    Ok(Value::Dec(Dec {
        coef: c as i64,
        exp: e as i8,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordBuilder;
    use crate::tran::QueryTran;

    struct NoTran;
    impl QueryTran for NoTran {
        fn state(&self) -> &std::sync::Arc<crate::state::DbState> {
            unreachable!()
        }
        fn store(&self) -> &std::sync::Arc<crate::storage::Store> {
            unreachable!()
        }
        fn extra_layer(&self, _: &str, _: usize) -> Option<std::sync::Arc<crate::index::Mbtree>> {
            None
        }
        fn track_read(&self, _: &str, _: usize, _: &[u8], _: &[u8]) {}
    }

    fn eval(e: &Expr) -> Value {
        let hdr = Header::single(vec!["a".into(), "b".into()]);
        let mut rb = RecordBuilder::new();
        rb.add(&Value::Int(7)).add(&Value::str("x"));
        let row = Row::single(rb.build(), 1);
        let tran = NoTran;
        let th = Thread::new(&tran);
        e.eval(&hdr, &row, &th).unwrap()
    }

    fn bin(op: BinOp, l: Expr, r: Expr) -> Expr {
        Expr::Binary(op, Box::new(l), Box::new(r))
    }

    #[test]
    fn fields_and_comparisons() {
        let e = bin(
            BinOp::Gt,
            Expr::Field("a".into()),
            Expr::Constant(Value::Int(5)),
        );
        assert_eq!(eval(&e), Value::Bool(true));
        let e = bin(
            BinOp::Eq,
            Expr::Field("b".into()),
            Expr::Constant(Value::str("x")),
        );
        assert_eq!(eval(&e), Value::Bool(true));
    }

    #[test]
    fn arithmetic() {
        let i = |n| Expr::Constant(Value::Int(n));
        assert_eq!(eval(&bin(BinOp::Add, i(2), i(3))), Value::Int(5));
        assert_eq!(eval(&bin(BinOp::Mul, i(4), i(5))), Value::Int(20));
        assert_eq!(
            eval(&bin(BinOp::Div, i(1), i(4))),
            Value::Dec(Dec { coef: 25, exp: -2 })
        );
        assert_eq!(eval(&bin(BinOp::Div, i(10), i(2))), Value::Int(5));
    }

    #[test]
    fn divide_by_zero_is_runtime_error() {
        let hdr = Header::single(vec![]);
        let row = Row(vec![]);
        let tran = NoTran;
        let th = Thread::new(&tran);
        let e = bin(
            BinOp::Div,
            Expr::Constant(Value::Int(1)),
            Expr::Constant(Value::Int(0)),
        );
        assert!(e.eval(&hdr, &row, &th).is_err());
    }

    #[test]
    fn eq_extraction() {
        let e = bin(
            BinOp::Eq,
            Expr::Field("k".into()),
            Expr::Constant(Value::Int(1)),
        );
        let (col, val) = e.col_eq_const().unwrap();
        assert_eq!(col, "k");
        assert_eq!(val, pack::packed(&Value::Int(1)));
    }
}
