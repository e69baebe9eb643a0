//! pvRequest construction and the request expression parser.
//!
//! A pvRequest rides along with GET/PUT/MONITOR INIT to tell the server
//! which fields the client wants and to pass per-operation options. On the
//! wire it is an ordinary value of the shape
//! `struct { field {...}, record { _options {...} } }`.
//!
//! The text grammar accepted by [`Request::parse`]:
//!
//! ```text
//! PVR    :=  ENT*
//! ENT    :=  "field" '(' name,* ')'  |  "record" '[' name=name,* ']'  |  name
//! name   :=  [a-zA-Z0-9_.]+
//! ```
//!
//! where a bare name is shorthand for `field(name)`.

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::multispace0,
    combinator::{all_consuming, map},
    error::Error as NomError,
    multi::{many0, separated_list0},
    sequence::{delimited, preceded, separated_pair},
};

use crate::error::Error;
use crate::typedesc::{Member, TypeCode, TypeDef};
use crate::value::IValue;

/// Accumulates field selections and record options for one operation.
#[derive(Debug, Clone, Default)]
pub struct Request {
    fields: Vec<String>,
    options: Vec<(String, String)>,
    raw: Option<IValue>,
}

impl Request {
    pub fn new() -> Request {
        Request::default()
    }

    /// Select a (possibly dotted) field.
    pub fn field(&mut self, name: &str) {
        self.fields.push(name.to_string());
    }

    /// Set a `record._options` entry.
    pub fn record(&mut self, key: &str, value: &str) {
        if let Some(existing) = self.options.iter_mut().find(|(k, _)| k == key) {
            existing.1 = value.to_string();
        } else {
            self.options.push((key.to_string(), value.to_string()));
        }
    }

    /// Use a caller-supplied pvRequest value verbatim.
    pub fn raw(&mut self, value: IValue) {
        self.raw = Some(value);
    }

    /// Fold a request expression into this request.
    pub fn parse(&mut self, text: &str) -> Result<(), Error> {
        let (_, ents) = all_consuming(many0(ws(entity)))
            .parse(text)
            .map_err(|_| Error::Protocol("invalid pvRequest expression"))?;
        for ent in ents.into_iter().flatten() {
            match ent {
                Ent::Field(name) => self.field(&name),
                Ent::Record(key, value) => self.record(&key, &value),
            }
        }
        Ok(())
    }

    /// Build the pvRequest value sent with an INIT subcommand.
    pub fn build(&self) -> Result<IValue, Error> {
        if let Some(raw) = &self.raw {
            return Ok(raw.clone());
        }

        let mut field = Member::compound(TypeCode::Struct, "field", Vec::new());
        for path in &self.fields {
            insert_path(&mut field, path);
        }
        let mut members = vec![field];
        if !self.options.is_empty() {
            let opts = self
                .options
                .iter()
                .map(|(k, _)| Member::new(TypeCode::String, k))
                .collect();
            members.push(Member::compound(
                TypeCode::Struct,
                "record",
                vec![Member::compound(TypeCode::Struct, "_options", opts)],
            ));
        }

        let mut val = TypeDef::structure("", members).create()?;
        for (key, value) in &self.options {
            val.update(&format!("record._options.{key}"), value.as_str())?;
        }
        val.freeze()
    }
}

fn insert_path(root: &mut Member, path: &str) {
    let mut cur = root;
    for part in path.split('.').filter(|p| !p.is_empty()) {
        let idx = match cur.children.iter().position(|c| c.name == part) {
            Some(i) => i,
            None => {
                cur.add_child(Member::compound(TypeCode::Struct, part, Vec::new()));
                cur.children.len() - 1
            }
        };
        cur = &mut cur.children[idx];
    }
}

#[derive(Debug)]
enum Ent {
    Field(String),
    Record(String, String),
}

fn ws<'a, F, O>(inner: F) -> impl Parser<&'a str, Output = O, Error = NomError<&'a str>>
where
    F: Parser<&'a str, Output = O, Error = NomError<&'a str>>,
{
    delimited(multispace0, inner, multispace0)
}

fn name(i: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '.').parse(i)
}

fn entity(i: &str) -> IResult<&str, Vec<Ent>> {
    alt((field_entity, record_entity, bare_name)).parse(i)
}

fn field_entity(i: &str) -> IResult<&str, Vec<Ent>> {
    map(
        preceded(
            ws(tag("field")),
            delimited(
                ws(tag("(")),
                separated_list0(ws(tag(",")), name),
                ws(tag(")")),
            ),
        ),
        |names| {
            names
                .into_iter()
                .map(|n| Ent::Field(n.to_string()))
                .collect()
        },
    )
    .parse(i)
}

fn record_entity(i: &str) -> IResult<&str, Vec<Ent>> {
    map(
        preceded(
            ws(tag("record")),
            delimited(
                ws(tag("[")),
                separated_list0(ws(tag(",")), separated_pair(name, ws(tag("=")), name)),
                ws(tag("]")),
            ),
        ),
        |pairs| {
            pairs
                .into_iter()
                .map(|(k, v)| Ent::Record(k.to_string(), v.to_string()))
                .collect()
        },
    )
    .parse(i)
}

fn bare_name(i: &str) -> IResult<&str, Vec<Ent>> {
    map(name, |n| vec![Ent::Field(n.to_string())]).parse(i)
}
