/*!
Live object handles and the intermediate state tree exchanged with type
helpers.

Objects tracked by the historian are held behind [Obj] handles; identity
is the allocation address of the handle ([ObjKey]), which is what makes
"the same object" well defined across saves and loads.

[Node] is the halfway house between a live object and its archived
[Value](crate::value::Value): a tree whose leaves may still be live
objects.  Helpers produce a [Node] when saving and receive one, with all
children materialised, when loading.
*/

use std::any::Any;
use std::cell::{Ref, RefCell};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use anyhow::{anyhow, Context};

use crate::value::Value;

/// A shared handle to a live object tracked by the historian.
pub type Obj = Rc<RefCell<dyn Any>>;

/// A non-owning handle to a live object.
pub type WeakObj = Weak<RefCell<dyn Any>>;

/// Wrap a value into an [Obj] handle.
pub fn new_obj<T: 'static>(value: T) -> Obj {
    Rc::new(RefCell::new(value))
}

/// The in-process identity of an [Obj]: its allocation address.  Stable
/// for as long as the object is alive; a key whose weak handle has died
/// must be treated as vacant because the address can be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjKey(usize);

impl ObjKey {
    /// The identity key of the given handle.
    pub fn of(obj: &Obj) -> ObjKey {
        ObjKey(Rc::as_ptr(obj).cast::<()>() as usize)
    }
}

/// Typed access to the value behind an [Obj] handle.
pub trait ObjExt {
    /// Borrow the object as a concrete type.
    fn borrow_as<T: 'static>(&self) -> anyhow::Result<Ref<'_, T>>;
    /// Borrow the object mutably as a concrete type.
    fn borrow_mut_as<T: 'static>(&self) -> anyhow::Result<std::cell::RefMut<'_, T>>;
    /// Is the object of the given concrete type?
    fn is_type<T: 'static>(&self) -> bool;
}

impl ObjExt for Obj {
    fn borrow_as<T: 'static>(&self) -> anyhow::Result<Ref<'_, T>> {
        Ref::filter_map(self.borrow(), |any| any.downcast_ref::<T>())
            .map_err(|_| anyhow!("object is not a {}", std::any::type_name::<T>()))
    }

    fn borrow_mut_as<T: 'static>(&self) -> anyhow::Result<std::cell::RefMut<'_, T>> {
        std::cell::RefMut::filter_map(self.borrow_mut(), |any| any.downcast_mut::<T>())
            .map_err(|_| anyhow!("object is not a {}", std::any::type_name::<T>()))
    }

    fn is_type<T: 'static>(&self) -> bool {
        self.borrow().is::<T>()
    }
}

/// A state tree whose leaves may still be live objects.
///
/// Returned by `save_instance_state` (the saver encodes any [Node::Obj]
/// leaves transitively) and passed to `load_instance_state` with every
/// leaf already materialised.
#[derive(Debug, Clone)]
pub enum Node {
    /// A primitive subtree containing no objects.
    Value(Value),
    /// An ordered list with possibly non-primitive children.
    List(Vec<Node>),
    /// A string-keyed mapping with possibly non-primitive children.
    Map(BTreeMap<String, Node>),
    /// A live object, encoded by value through its own helper.
    Obj(Obj),
}

impl Node {
    /// The null node.
    pub fn null() -> Node {
        Node::Value(Value::Null)
    }

    /// Look up an entry of a mapping node.
    pub fn get(&self, key: &str) -> Option<&Node> {
        match self {
            Node::Map(map) => map.get(key),
            _ => None,
        }
    }

    /// Look up an entry of a mapping node, failing if it is missing.
    pub fn entry(&self, key: &str) -> anyhow::Result<&Node> {
        self.get(key)
            .ok_or_else(|| anyhow!("saved state is missing '{}'", key))
    }

    /// Look up an element of a list node, failing if out of bounds.
    pub fn element(&self, idx: usize) -> anyhow::Result<&Node> {
        match self {
            Node::List(items) => items
                .get(idx)
                .ok_or_else(|| anyhow!("saved state is missing element {}", idx)),
            _ => Err(anyhow!("saved state is not a list")),
        }
    }

    /// The primitive value if this subtree holds no objects.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Node::Value(value) => Some(value),
            _ => None,
        }
    }

    /// The node as a string.
    pub fn as_str(&self) -> anyhow::Result<&str> {
        match self {
            Node::Value(Value::Str(s)) => Ok(s),
            other => Err(anyhow!("expected a string, got {:?}", other)),
        }
    }

    /// The node as an integer.
    pub fn as_int(&self) -> anyhow::Result<i64> {
        match self {
            Node::Value(Value::Int(i)) => Ok(*i),
            other => Err(anyhow!("expected an integer, got {:?}", other)),
        }
    }

    /// The node as a float.
    pub fn as_float(&self) -> anyhow::Result<f64> {
        match self {
            Node::Value(Value::Float(f)) => Ok(*f),
            other => Err(anyhow!("expected a float, got {:?}", other)),
        }
    }

    /// The node as a boolean.
    pub fn as_bool(&self) -> anyhow::Result<bool> {
        match self {
            Node::Value(Value::Bool(b)) => Ok(*b),
            other => Err(anyhow!("expected a boolean, got {:?}", other)),
        }
    }

    /// True if this node is the primitive null.
    pub fn is_null(&self) -> bool {
        matches!(self, Node::Value(Value::Null))
    }

    /// Collapse the tree back into a primitive value.  `None` if any
    /// object leaf remains.
    pub fn to_value(&self) -> Option<Value> {
        match self {
            Node::Value(value) => Some(value.clone()),
            Node::List(items) => items
                .iter()
                .map(Node::to_value)
                .collect::<Option<Vec<Value>>>()
                .map(Value::List),
            Node::Map(map) => map
                .iter()
                .map(|(key, val)| val.to_value().map(|val| (key.clone(), val)))
                .collect::<Option<BTreeMap<String, Value>>>()
                .map(Value::Map),
            Node::Obj(_) => None,
        }
    }

    /// The object handle if this is an object leaf.
    pub fn as_obj(&self) -> anyhow::Result<&Obj> {
        match self {
            Node::Obj(obj) => Ok(obj),
            other => Err(anyhow!("expected an object, got {:?}", other)),
        }
    }

    /// Clone the concrete value out of an object leaf.
    pub fn to_instance<T: Clone + 'static>(&self) -> anyhow::Result<T> {
        let obj = self.as_obj()?;
        let borrowed = obj
            .borrow_as::<T>()
            .with_context(|| format!("while reading a {}", std::any::type_name::<T>()))?;
        Ok(borrowed.clone())
    }

}

impl From<Value> for Node {
    fn from(value: Value) -> Self {
        Node::Value(value)
    }
}

impl From<&str> for Node {
    fn from(value: &str) -> Self {
        Node::Value(Value::Str(value.to_string()))
    }
}

impl From<String> for Node {
    fn from(value: String) -> Self {
        Node::Value(Value::Str(value))
    }
}

impl From<i64> for Node {
    fn from(value: i64) -> Self {
        Node::Value(Value::Int(value))
    }
}

impl From<f64> for Node {
    fn from(value: f64) -> Self {
        Node::Value(Value::Float(value))
    }
}

impl From<bool> for Node {
    fn from(value: bool) -> Self {
        Node::Value(Value::Bool(value))
    }
}

impl From<Obj> for Node {
    fn from(obj: Obj) -> Self {
        Node::Obj(obj)
    }
}

impl FromIterator<(String, Node)> for Node {
    fn from_iter<I: IntoIterator<Item = (String, Node)>>(iter: I) -> Self {
        Node::Map(iter.into_iter().collect())
    }
}

impl FromIterator<Node> for Node {
    fn from_iter<I: IntoIterator<Item = Node>>(iter: I) -> Self {
        Node::List(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_obj_key_identity() {
        let one = new_obj(42u32);
        let two = new_obj(42u32);
        assert_eq!(ObjKey::of(&one), ObjKey::of(&one.clone()));
        assert_ne!(ObjKey::of(&one), ObjKey::of(&two));
    }

    #[test]
    fn test_borrow_as() {
        let obj = new_obj("hello".to_string());
        assert_eq!(&*obj.borrow_as::<String>().unwrap(), "hello");
        assert!(obj.borrow_as::<u32>().is_err());
        obj.borrow_mut_as::<String>().unwrap().push('!');
        assert_eq!(&*obj.borrow_as::<String>().unwrap(), "hello!");
    }

    #[test]
    fn test_node_accessors() {
        let node: Node = [
            ("make".to_string(), Node::from("fiat")),
            ("doors".to_string(), Node::from(5i64)),
        ]
        .into_iter()
        .collect();
        assert_eq!(node.entry("make").unwrap().as_str().unwrap(), "fiat");
        assert_eq!(node.entry("doors").unwrap().as_int().unwrap(), 5);
        assert!(node.entry("missing").is_err());
    }

    #[test]
    fn test_to_instance() {
        let node = Node::Obj(new_obj("zonda".to_string()));
        let out: String = node.to_instance().unwrap();
        assert_eq!(out, "zonda");
        assert!(node.to_instance::<u32>().is_err());
    }
}
