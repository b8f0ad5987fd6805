//! # Query and Admin Parsing
//!
//! Hand-written lexer and recursive-descent parser for the query
//! grammar:
//!
//! ```text
//! query  ::= source (op)* [SORT [REVERSE] cols]
//! source ::= table | view | "(" query ")"
//! op     ::= PROJECT cols | REMOVE cols
//!          | RENAME col TO col {"," col TO col}
//!          | EXTEND col "=" expr {"," col "=" expr}
//!          | WHERE expr
//!          | SUMMARIZE [cols ","] [col "="] agg [col] {"," …}
//!          | UNION src | INTERSECT src | MINUS src | TIMES src
//!          | JOIN [BY "(" cols ")"] src | LEFTJOIN [BY "(" cols ")"] src
//! ```
//!
//! and for the admin (DDL) requests: `create`, `ensure`, `alter …
//! create/drop`, `drop`, `rename … to …`, `view`, `sview`. View names
//! used as sources expand recursively into their definitions.

use eyre::Result;

use crate::database::Database;
use crate::encoding::ixkey::IndexMode;
use crate::errors::query_error;
use crate::meta::{IndexSchema, Schema};
use crate::tran::QueryTran;
use crate::value::{Dec, Value};

use super::compatible::Compatible;
use super::expr::{BinOp, Expr, UnOp};
use super::extend::Extend;
use super::filter::Where;
use super::join::{Join, JoinKind};
use super::project::Project;
use super::rename::Rename;
use super::summarize::{Agg, Summarize};
use super::table::Table;
use super::union::Union;
use super::Query;

// ---------------------------------------------------------------- lexer

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Number(String),
    Str(String),
    Punct(char),
    Eof,
}

struct Lexer {
    toks: Vec<Tok>,
    pos: usize,
}

fn lex(src: &str) -> Result<Vec<Tok>> {
    let mut toks = Vec::new();
    let bytes = src.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_whitespace() {
            i += 1;
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < bytes.len() && ((bytes[i] as char).is_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            toks.push(Tok::Ident(src[start..i].to_string()));
        } else if c.is_ascii_digit() {
            // negative literals come out of the parser as unary minus
            let start = i;
            i += 1;
            while i < bytes.len()
                && ((bytes[i] as char).is_ascii_digit() || bytes[i] == b'.')
            {
                i += 1;
            }
            toks.push(Tok::Number(src[start..i].to_string()));
        } else if c == '\'' || c == '"' {
            let quote = c;
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i] as char != quote {
                i += 1;
            }
            if i >= bytes.len() {
                return Err(query_error("unterminated string"));
            }
            toks.push(Tok::Str(src[start..i].to_string()));
            i += 1;
        } else if "()=<>!,.*+-/$".contains(c) {
            toks.push(Tok::Punct(c));
            i += 1;
        } else {
            return Err(query_error(format!("unexpected character '{}'", c)));
        }
    }
    toks.push(Tok::Eof);
    Ok(toks)
}

impl Lexer {
    fn new(src: &str) -> Result<Lexer> {
        Ok(Lexer {
            toks: lex(src)?,
            pos: 0,
        })
    }

    fn peek(&self) -> &Tok {
        &self.toks[self.pos]
    }

    fn next(&mut self) -> Tok {
        let t = self.toks[self.pos].clone();
        if self.pos < self.toks.len() - 1 {
            self.pos += 1;
        }
        t
    }

    /// Case-insensitive keyword match, consumed if present.
    fn matches(&mut self, kw: &str) -> bool {
        let hit = matches!(self.peek(), Tok::Ident(s) if s.eq_ignore_ascii_case(kw));
        if hit {
            self.next();
        }
        hit
    }

    fn punct(&mut self, c: char) -> Result<()> {
        match self.next() {
            Tok::Punct(p) if p == c => Ok(()),
            t => Err(query_error(format!("expected '{}', got {:?}", c, t))),
        }
    }

    fn matches_punct(&mut self, c: char) -> bool {
        if self.peek() == &Tok::Punct(c) {
            self.next();
            return true;
        }
        false
    }

    fn ident(&mut self) -> Result<String> {
        match self.next() {
            Tok::Ident(s) => Ok(s),
            t => Err(query_error(format!("expected identifier, got {:?}", t))),
        }
    }
}

const KEYWORDS: &[&str] = &[
    "project", "remove", "rename", "extend", "where", "summarize", "union", "intersect", "minus",
    "times", "join", "leftjoin", "sort", "reverse", "by", "to", "and", "or", "not", "true",
    "false", "in",
];

fn is_keyword(s: &str) -> bool {
    KEYWORDS.iter().any(|k| s.eq_ignore_ascii_case(k))
}

// ------------------------------------------------------------- queries

pub fn parse_query(src: &str, tran: &dyn QueryTran) -> Result<Box<dyn Query>> {
    let mut lx = Lexer::new(src)?;
    let q = query(&mut lx, tran, 0)?;
    if lx.peek() != &Tok::Eof {
        return Err(query_error(format!("unexpected token {:?}", lx.peek())));
    }
    Ok(q)
}

fn query(lx: &mut Lexer, tran: &dyn QueryTran, depth: usize) -> Result<Box<dyn Query>> {
    if depth > 16 {
        return Err(query_error("query nesting too deep"));
    }
    let mut q = source(lx, tran, depth)?;
    loop {
        if lx.matches("project") {
            let cols = col_list(lx)?;
            check_columns(q.as_ref(), &cols)?;
            q = Box::new(Project::new(q, cols));
        } else if lx.matches("remove") {
            let cols = col_list(lx)?;
            check_columns(q.as_ref(), &cols)?;
            q = Box::new(Project::remove(q, &cols));
        } else if lx.matches("rename") {
            let (from, to) = rename_list(lx)?;
            q = Box::new(Rename::new(q, from, to));
        } else if lx.matches("extend") {
            let (cols, exprs) = extend_list(lx)?;
            q = Box::new(Extend::new(q, cols, exprs));
        } else if lx.matches("where") {
            let e = expr(lx)?;
            q = Box::new(Where::new(q, e));
        } else if lx.matches("summarize") {
            q = summarize(lx, q)?;
        } else if lx.matches("union") {
            let rhs = source(lx, tran, depth)?;
            q = Box::new(Union::new(q, rhs));
        } else if lx.matches("intersect") {
            let rhs = source(lx, tran, depth)?;
            q = Box::new(Compatible::intersect(q, rhs));
        } else if lx.matches("minus") {
            let rhs = source(lx, tran, depth)?;
            q = Box::new(Compatible::minus(q, rhs));
        } else if lx.matches("times") {
            let rhs = source(lx, tran, depth)?;
            q = Box::new(Join::new(q, rhs, JoinKind::Times, None)?);
        } else if lx.matches("join") {
            let by = by_clause(lx)?;
            let rhs = source(lx, tran, depth)?;
            q = Box::new(Join::new(q, rhs, JoinKind::Inner, by)?);
        } else if lx.matches("leftjoin") {
            let by = by_clause(lx)?;
            let rhs = source(lx, tran, depth)?;
            q = Box::new(Join::new(q, rhs, JoinKind::Left, by)?);
        } else if lx.matches("sort") {
            let reverse = lx.matches("reverse");
            let cols = col_list(lx)?;
            q = super::optimize::with_sort(q, cols, reverse);
            break;
        } else {
            break;
        }
    }
    Ok(q)
}

fn source(lx: &mut Lexer, tran: &dyn QueryTran, depth: usize) -> Result<Box<dyn Query>> {
    if lx.matches_punct('(') {
        let q = query(lx, tran, depth + 1)?;
        lx.punct(')')?;
        return Ok(q);
    }
    let name = lx.ident()?;
    if let Some(def) = tran.state().meta.get_view(&name) {
        let mut sub = Lexer::new(def)?;
        let q = query(&mut sub, tran, depth + 1)?;
        if sub.peek() != &Tok::Eof {
            return Err(query_error(format!("bad view definition: {}", name)));
        }
        return Ok(q);
    }
    Ok(Box::new(Table::new(&name, tran)?))
}

fn check_columns(q: &dyn Query, cols: &[String]) -> Result<()> {
    let have = q.columns();
    for c in cols {
        if !have.contains(c) {
            return Err(query_error(format!("nonexistent column: {}", c)));
        }
    }
    Ok(())
}

fn col_list(lx: &mut Lexer) -> Result<Vec<String>> {
    let mut cols = vec![lx.ident()?];
    while lx.matches_punct(',') {
        cols.push(lx.ident()?);
    }
    Ok(cols)
}

fn rename_list(lx: &mut Lexer) -> Result<(Vec<String>, Vec<String>)> {
    let mut from = Vec::new();
    let mut to = Vec::new();
    loop {
        from.push(lx.ident()?);
        if !lx.matches("to") {
            return Err(query_error("rename requires 'to'"));
        }
        to.push(lx.ident()?);
        if !lx.matches_punct(',') {
            break;
        }
    }
    Ok((from, to))
}

fn extend_list(lx: &mut Lexer) -> Result<(Vec<String>, Vec<Expr>)> {
    let mut cols = Vec::new();
    let mut exprs = Vec::new();
    loop {
        cols.push(lx.ident()?);
        lx.punct('=')?;
        exprs.push(expr(lx)?);
        if !lx.matches_punct(',') {
            break;
        }
    }
    Ok((cols, exprs))
}

fn by_clause(lx: &mut Lexer) -> Result<Option<Vec<String>>> {
    if lx.matches("by") {
        lx.punct('(')?;
        let cols = col_list(lx)?;
        lx.punct(')')?;
        Ok(Some(cols))
    } else {
        Ok(None)
    }
}

fn summarize(lx: &mut Lexer, src: Box<dyn Query>) -> Result<Box<dyn Query>> {
    let mut by = Vec::new();
    let mut cols = Vec::new();
    let mut aggs = Vec::new();
    let mut ons = Vec::new();
    loop {
        let first = lx.ident()?;
        if let Some(agg) = Agg::parse(&first.to_ascii_lowercase()) {
            // [agg [on]] — count takes no operand
            cols.push(String::new());
            aggs.push(agg);
            if agg != Agg::Count {
                ons.push(lx.ident()?);
            } else {
                ons.push(String::new());
            }
        } else if lx.matches_punct('=') {
            // name = agg [on]
            let op = lx.ident()?;
            let agg = Agg::parse(&op.to_ascii_lowercase())
                .ok_or_else(|| query_error(format!("unknown aggregate: {}", op)))?;
            cols.push(first);
            aggs.push(agg);
            if agg != Agg::Count {
                ons.push(lx.ident()?);
            } else {
                ons.push(String::new());
            }
        } else {
            // a by column
            by.push(first);
        }
        if !lx.matches_punct(',') {
            break;
        }
    }
    if aggs.is_empty() {
        return Err(query_error("summarize requires at least one aggregate"));
    }
    Ok(Box::new(Summarize::new(src, by, cols, aggs, ons)?))
}

// ---------------------------------------------------------- expressions

fn expr(lx: &mut Lexer) -> Result<Expr> {
    or_expr(lx)
}

fn or_expr(lx: &mut Lexer) -> Result<Expr> {
    let mut terms = vec![and_expr(lx)?];
    while lx.matches("or") {
        terms.push(and_expr(lx)?);
    }
    Ok(if terms.len() == 1 {
        terms.pop().unwrap()
    } else {
        Expr::Or(terms)
    })
}

fn and_expr(lx: &mut Lexer) -> Result<Expr> {
    let mut terms = vec![cmp_expr(lx)?];
    while lx.matches("and") {
        terms.push(cmp_expr(lx)?);
    }
    Ok(if terms.len() == 1 {
        terms.pop().unwrap()
    } else {
        Expr::And(terms)
    })
}

fn cmp_expr(lx: &mut Lexer) -> Result<Expr> {
    let lhs = add_expr(lx)?;
    let op = if lx.matches_punct('=') {
        BinOp::Eq
    } else if lx.matches_punct('<') {
        if lx.matches_punct('=') {
            BinOp::Lte
        } else if lx.matches_punct('>') {
            BinOp::Ne
        } else {
            BinOp::Lt
        }
    } else if lx.matches_punct('>') {
        if lx.matches_punct('=') {
            BinOp::Gte
        } else {
            BinOp::Gt
        }
    } else if lx.matches_punct('!') {
        lx.punct('=')?;
        BinOp::Ne
    } else {
        return Ok(lhs);
    };
    let rhs = add_expr(lx)?;
    Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
}

fn add_expr(lx: &mut Lexer) -> Result<Expr> {
    let mut lhs = mul_expr(lx)?;
    loop {
        let op = if lx.matches_punct('+') {
            BinOp::Add
        } else if lx.matches_punct('-') {
            BinOp::Sub
        } else if lx.matches_punct('$') {
            BinOp::Cat
        } else {
            return Ok(lhs);
        };
        let rhs = mul_expr(lx)?;
        lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
    }
}

fn mul_expr(lx: &mut Lexer) -> Result<Expr> {
    let mut lhs = unary_expr(lx)?;
    loop {
        let op = if lx.matches_punct('*') {
            BinOp::Mul
        } else if lx.matches_punct('/') {
            BinOp::Div
        } else {
            return Ok(lhs);
        };
        let rhs = unary_expr(lx)?;
        lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
    }
}

fn unary_expr(lx: &mut Lexer) -> Result<Expr> {
    if lx.matches("not") {
        return Ok(Expr::Unary(UnOp::Not, Box::new(unary_expr(lx)?)));
    }
    if lx.matches_punct('-') {
        return Ok(Expr::Unary(UnOp::Neg, Box::new(unary_expr(lx)?)));
    }
    term(lx)
}

fn term(lx: &mut Lexer) -> Result<Expr> {
    if lx.matches_punct('(') {
        let e = expr(lx)?;
        lx.punct(')')?;
        return Ok(e);
    }
    match lx.next() {
        Tok::Number(s) => parse_number(&s),
        Tok::Str(s) => Ok(Expr::Constant(Value::str(s))),
        Tok::Ident(s) if s.eq_ignore_ascii_case("true") => Ok(Expr::Constant(Value::Bool(true))),
        Tok::Ident(s) if s.eq_ignore_ascii_case("false") => {
            Ok(Expr::Constant(Value::Bool(false)))
        }
        Tok::Ident(s) if !is_keyword(&s) => Ok(Expr::Field(s)),
        t => Err(query_error(format!("unexpected token in expression: {:?}", t))),
    }
}

fn parse_number(s: &str) -> Result<Expr> {
    if let Ok(n) = s.parse::<i64>() {
        return Ok(Expr::Constant(Value::Int(n)));
    }
    // decimal: strip the point, count fraction digits
    let (int_part, frac_part) = s
        .split_once('.')
        .ok_or_else(|| query_error(format!("bad number: {}", s)))?;
    let digits = format!("{}{}", int_part, frac_part);
    let coef = digits
        .parse::<i64>()
        .map_err(|_| query_error(format!("bad number: {}", s)))?;
    let exp = -(frac_part.len() as i32);
    if !(i8::MIN as i32..=i8::MAX as i32).contains(&exp) {
        return Err(query_error(format!("number out of range: {}", s)));
    }
    Ok(Expr::Constant(Value::Dec(Dec {
        coef,
        exp: exp as i8,
    })))
}

// --------------------------------------------------------------- admin

/// Parses and applies one admin (DDL) request.
pub fn apply_admin(db: &Database, request: &str) -> Result<()> {
    let mut lx = Lexer::new(request)?;
    if lx.matches("create") {
        let schema = schema_def(&mut lx)?;
        return db.add_table(schema);
    }
    if lx.matches("ensure") {
        let schema = schema_def(&mut lx)?;
        return db.ensure_table(schema);
    }
    if lx.matches("drop") {
        let name = lx.ident()?;
        return db.drop_table(&name);
    }
    if lx.matches("rename") {
        let from = lx.ident()?;
        if !lx.matches("to") {
            return Err(query_error("rename requires 'to'"));
        }
        let to = lx.ident()?;
        return db.rename_table(&from, &to);
    }
    if lx.matches("alter") {
        let table = lx.ident()?;
        if lx.matches("create") {
            let ix = index_def(&mut lx)?
                .ok_or_else(|| query_error("alter create requires an index definition"))?;
            return db.alter_create_index(&table, ix);
        }
        if lx.matches("drop") {
            let ix = index_def(&mut lx)?
                .ok_or_else(|| query_error("alter drop requires an index definition"))?;
            return db.alter_drop_index(&table, &ix.columns);
        }
        return Err(query_error("alter requires create or drop"));
    }
    if lx.matches("view") || lx.matches("sview") {
        let name = lx.ident()?;
        lx.punct('=')?;
        // the remainder of the request is the definition
        let def = request
            .split_once('=')
            .map(|(_, d)| d.trim().to_string())
            .ok_or_else(|| query_error("view requires a definition"))?;
        return db.add_view(&name, &def);
    }
    Err(query_error(format!("bad admin request: {}", request)))
}

fn schema_def(lx: &mut Lexer) -> Result<Schema> {
    let name = lx.ident()?;
    lx.punct('(')?;
    let columns = col_list(lx)?;
    lx.punct(')')?;
    let mut indexes = Vec::new();
    while let Some(ix) = index_def(lx)? {
        indexes.push(ix);
    }
    Schema::new(name, columns, indexes)
}

fn index_def(lx: &mut Lexer) -> Result<Option<IndexSchema>> {
    let mode = if lx.matches("key") {
        IndexMode::Key
    } else if lx.matches("index") {
        if lx.matches("unique") {
            IndexMode::Unique
        } else {
            IndexMode::Index
        }
    } else if lx.matches("unique") {
        IndexMode::Unique
    } else {
        return Ok(None);
    };
    lx.punct('(')?;
    let cols = col_list(lx)?;
    lx.punct(')')?;
    Ok(Some(IndexSchema::new(cols, mode)))
}
