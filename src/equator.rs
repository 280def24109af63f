/*!
Content hashing and structural equality over primitive trees and
registered types, provided by the [Equator].

The equator deterministically reduces a state to a sequence of byte
chunks; a pluggable [Hasher] digests them into the `snapshot_hash` stored
on every record.  Equal states under the equator always produce equal
hashes.
*/

use std::any::Any;
use std::rc::Rc;

use crate::error::{ChroniclerError, Result};
use crate::object::Node;
use crate::registry::TypeRegistry;
use crate::value::Value;

/// A digest in the making.  The historian consumes this capability rather
/// than a concrete hash function.
pub trait Hasher {
    /// Feed a chunk of canonical bytes.
    fn update(&mut self, chunk: &[u8]);
    /// Produce the final digest as text.
    fn finalize(&mut self) -> String;
}

/// The default hasher.
#[derive(Default)]
pub struct Blake3Hasher(blake3::Hasher);

impl Hasher for Blake3Hasher {
    fn update(&mut self, chunk: &[u8]) {
        self.0.update(chunk);
    }

    fn finalize(&mut self) -> String {
        self.0.finalize().to_hex().to_string()
    }
}

/// Canonical text for a float, keeping 14 significant digits the way
/// `%.14g` would, so that re-reading a stored state hashes identically.
pub(crate) fn float_text(value: f64) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let formatted = format!("{:.13e}", value.abs());
    let (mantissa, exp_text) = match formatted.split_once('e') {
        Some(parts) => parts,
        None => return formatted,
    };
    let exp: i32 = exp_text.parse().unwrap_or(0);
    let digits: String = mantissa.chars().filter(|c| c.is_ascii_digit()).collect();
    let digits = digits.trim_end_matches('0');
    let digits = if digits.is_empty() { "0" } else { digits };
    let sign = if value < 0.0 { "-" } else { "" };

    if (-4..14).contains(&exp) {
        if exp >= 0 {
            let int_len = (exp + 1) as usize;
            if digits.len() <= int_len {
                let zeros = "0".repeat(int_len - digits.len());
                format!("{}{}{}", sign, digits, zeros)
            } else {
                format!("{}{}.{}", sign, &digits[..int_len], &digits[int_len..])
            }
        } else {
            let zeros = "0".repeat((-exp - 1) as usize);
            format!("{}0.{}{}", sign, zeros, digits)
        }
    } else {
        let (first, rest) = digits.split_at(1);
        let mantissa_text = if rest.is_empty() {
            first.to_string()
        } else {
            format!("{}.{}", first, rest)
        };
        let exp_sign = if exp < 0 { '-' } else { '+' };
        format!("{}{}e{}{:02}", sign, mantissa_text, exp_sign, exp.abs())
    }
}

/// Produces content hashes and decides equality, deferring to type
/// helpers for registered types.
pub struct Equator {
    make_hasher: Box<dyn Fn() -> Box<dyn Hasher>>,
}

impl Default for Equator {
    fn default() -> Self {
        Equator {
            make_hasher: Box::new(|| Box::new(Blake3Hasher::default()) as Box<dyn Hasher>),
        }
    }
}

impl Equator {
    /// Create an equator digesting through the given hasher factory.
    pub fn new(make_hasher: impl Fn() -> Box<dyn Hasher> + 'static) -> Self {
        Equator {
            make_hasher: Box::new(make_hasher),
        }
    }

    /// Hash a live instance through its helper.
    pub fn hash_obj(&self, obj: &dyn Any, registry: &TypeRegistry) -> Result<String> {
        let mut hasher = (self.make_hasher)();
        let mut walk = HashWalk {
            registry,
            hasher: hasher.as_mut(),
        };
        walk.obj(obj)?;
        Ok(hasher.finalize())
    }

    /// Hash a state tree.
    pub fn hash_node(&self, node: &Node, registry: &TypeRegistry) -> Result<String> {
        let mut hasher = (self.make_hasher)();
        let mut walk = HashWalk {
            registry,
            hasher: hasher.as_mut(),
        };
        walk.node(node)?;
        Ok(hasher.finalize())
    }

    /// Are two instances equal?  Delegates to the helper when both sides
    /// are the same concrete type, otherwise they are unequal.
    pub fn eq_objs(&self, one: &dyn Any, other: &dyn Any, registry: &TypeRegistry) -> bool {
        if one.type_id() != other.type_id() {
            return false;
        }
        match registry.helper_for_type(one.type_id()) {
            Ok(helper) => helper.eq(one, other),
            Err(_) => false,
        }
    }

    /// Structural equality over state trees.
    pub fn eq_nodes(&self, one: &Node, other: &Node, registry: &TypeRegistry) -> bool {
        match (one, other) {
            (Node::Value(a), Node::Value(b)) => a == b,
            (Node::List(a), Node::List(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|(x, y)| self.eq_nodes(x, y, registry))
            }
            (Node::Map(a), Node::Map(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b.iter()).all(|((ka, va), (kb, vb))| {
                        ka == kb && self.eq_nodes(va, vb, registry)
                    })
            }
            (Node::Obj(a), Node::Obj(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                self.eq_objs(&*a.borrow(), &*b.borrow(), registry)
            }
            _ => false,
        }
    }
}

/// An in-progress hash walk handed to helpers' `yield_hashables`.
pub struct HashWalk<'a> {
    registry: &'a TypeRegistry,
    hasher: &'a mut dyn Hasher,
}

impl HashWalk<'_> {
    /// Feed raw canonical bytes.
    pub fn write(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    /// Feed the canonical chunks for a primitive value.
    pub fn value(&mut self, value: &Value) {
        match value {
            Value::Null => self.write(b"None"),
            Value::Bool(b) => self.write(if *b { &[0x01] } else { &[0x00] }),
            Value::Int(i) => self.write(i.to_string().as_bytes()),
            Value::Float(f) => self.write(float_text(*f).as_bytes()),
            Value::Str(s) => self.write(s.as_bytes()),
            Value::Bytes(b) => self.write(b),
            Value::Timestamp(ts) => self.write(ts.to_rfc3339().as_bytes()),
            Value::Uuid(id) => self.write(id.as_bytes()),
            Value::Id(id) => self.write(id.as_bytes()),
            Value::List(items) => {
                for item in items {
                    self.value(item);
                }
            }
            Value::Map(map) => {
                // Entries ordered by their hashed key bytes, then key
                // chunks followed by value chunks.
                let mut entries: Vec<(&[u8], &Value)> = map
                    .iter()
                    .map(|(key, val)| (key.as_bytes(), val))
                    .collect();
                entries.sort_by_key(|(key, _)| *key);
                for (key, val) in entries {
                    self.write(key);
                    self.value(val);
                }
            }
        }
    }

    /// Feed the canonical chunks for a state tree, dispatching object
    /// leaves to their helpers.
    pub fn node(&mut self, node: &Node) -> Result<()> {
        match node {
            Node::Value(value) => {
                self.value(value);
                Ok(())
            }
            Node::List(items) => {
                for item in items {
                    self.node(item)?;
                }
                Ok(())
            }
            Node::Map(map) => {
                let mut entries: Vec<(&[u8], &Node)> = map
                    .iter()
                    .map(|(key, val)| (key.as_bytes(), val))
                    .collect();
                entries.sort_by_key(|(key, _)| *key);
                for (key, val) in entries {
                    self.write(key);
                    self.node(val)?;
                }
                Ok(())
            }
            Node::Obj(obj) => self.obj(&*obj.borrow()),
        }
    }

    /// Feed the canonical chunks for a live instance through its helper.
    pub fn obj(&mut self, obj: &dyn Any) -> Result<()> {
        let helper = self.registry.helper_for_type(obj.type_id())?;
        helper
            .yield_hashables(obj, self)
            .map_err(|err| ChroniclerError::Encoding(err.to_string()))
    }
}
