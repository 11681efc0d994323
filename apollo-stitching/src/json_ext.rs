//! JSON helpers for building and addressing the response tree.

use std::cmp::min;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Entry;
use serde_json_bytes::Map;
pub use serde_json_bytes::Value;

/// A JSON object.
pub type Object = Map<ByteString, Value>;

/// Extension trait for [`serde_json_bytes::Value`].
pub(crate) trait ValueExt {
    /// Deep merge the JSON objects, array and override the values in `&mut self` if they already
    /// exists.
    fn deep_merge(&mut self, other: Self);

    /// Returns the value at `path`, if every element of the path leads to an existing node.
    fn get_path<'a>(&'a self, path: &Path) -> Option<&'a Value>;

    /// Mutable version of [`ValueExt::get_path`].
    fn get_path_mut<'a>(&'a mut self, path: &Path) -> Option<&'a mut Value>;

    /// Removes `key` from every object reachable from this value.
    fn strip_key_recursively(&mut self, key: &str);
}

impl ValueExt for Value {
    fn deep_merge(&mut self, other: Self) {
        match (self, other) {
            (Value::Object(a), Value::Object(b)) => {
                for (key, value) in b.into_iter() {
                    match a.entry(key) {
                        Entry::Vacant(e) => {
                            e.insert(value);
                        }
                        Entry::Occupied(e) => {
                            e.into_mut().deep_merge(value);
                        }
                    }
                }
            }
            (Value::Array(a), Value::Array(mut b)) => {
                let common = min(a.len(), b.len());
                for (b_value, a_value) in b.drain(..common).zip(a.iter_mut()) {
                    a_value.deep_merge(b_value);
                }
                a.extend(b);
            }
            (a, b) => {
                *a = b;
            }
        }
    }

    fn get_path<'a>(&'a self, path: &Path) -> Option<&'a Value> {
        path.iter().try_fold(self, |current, element| match element {
            PathElement::Key(key) => current.as_object()?.get(key.as_str()),
            PathElement::Index(index) => current.as_array()?.get(*index),
        })
    }

    fn get_path_mut<'a>(&'a mut self, path: &Path) -> Option<&'a mut Value> {
        path.iter().try_fold(self, |current, element| match element {
            PathElement::Key(key) => current.as_object_mut()?.get_mut(key.as_str()),
            PathElement::Index(index) => current.as_array_mut()?.get_mut(*index),
        })
    }

    fn strip_key_recursively(&mut self, key: &str) {
        match self {
            Value::Object(object) => {
                object.remove(key);
                for (_, value) in object.iter_mut() {
                    value.strip_key_recursively(key);
                }
            }
            Value::Array(array) => {
                for value in array.iter_mut() {
                    value.strip_key_recursively(key);
                }
            }
            _ => {}
        }
    }
}

/// A GraphQL path element that is composes of strings or numbers.
/// e.g `/book/3/name`
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathElement {
    /// An index path element.
    Index(usize),

    /// A key path element.
    Key(String),
}

/// A path into the result document.
///
/// This can be composed of strings and numbers
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(pub Vec<PathElement>);

impl Path {
    pub fn empty() -> Path {
        Path(Default::default())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &PathElement> {
        self.0.iter()
    }

    /// Returns a new path made of `self` followed by `other`.
    pub fn join(&self, other: impl AsRef<Path>) -> Self {
        let other = other.as_ref();
        let mut elements = Vec::with_capacity(self.len() + other.len());
        elements.extend(self.0.iter().cloned());
        elements.extend(other.0.iter().cloned());
        Path(elements)
    }

    pub fn with_key(&self, key: impl Into<String>) -> Self {
        let mut path = self.clone();
        path.0.push(PathElement::Key(key.into()));
        path
    }

    pub fn with_index(&self, index: usize) -> Self {
        let mut path = self.clone();
        path.0.push(PathElement::Index(index));
        path
    }
}

impl AsRef<Path> for Path {
    fn as_ref(&self) -> &Path {
        self
    }
}

impl<T> From<T> for Path
where
    T: AsRef<str>,
{
    fn from(s: T) -> Self {
        Self(
            s.as_ref()
                .split('/')
                .filter(|s| !s.is_empty())
                .map(|s| match s.parse::<usize>() {
                    Ok(index) => PathElement::Index(index),
                    Err(_) => PathElement::Key(s.to_string()),
                })
                .collect(),
        )
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for element in self.iter() {
            write!(f, "/")?;
            match element {
                PathElement::Index(index) => write!(f, "{index}")?,
                PathElement::Key(key) => write!(f, "{key}")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;

    #[test]
    fn test_deep_merge_objects() {
        let mut value = json!({"obj": {"a": 1, "nested": {"x": true}}, "list": [{"id": 1}]});
        value.deep_merge(json!({"obj": {"b": 2, "nested": {"y": false}}, "list": [{"name": "one"}, {"id": 2}]}));
        assert_eq!(
            value,
            json!({
                "obj": {"a": 1, "nested": {"x": true, "y": false}, "b": 2},
                "list": [{"id": 1, "name": "one"}, {"id": 2}]
            })
        );
    }

    #[test]
    fn test_get_path() {
        let mut value = json!({"obj": {"arr": [{"prop1": 1}, {"prop1": 2}]}});
        assert_eq!(
            value.get_path(&Path::from("obj/arr/1/prop1")),
            Some(&Value::from(2))
        );
        assert_eq!(value.get_path(&Path::from("obj/missing")), None);
        assert_eq!(value.get_path(&Path::from("obj/arr/3")), None);

        *value.get_path_mut(&Path::from("obj/arr/0")).unwrap() = Value::Null;
        assert_eq!(value, json!({"obj": {"arr": [null, {"prop1": 2}]}}));
    }

    #[test]
    fn test_strip_key_recursively() {
        let mut value = json!({"k": 1, "a": [{"k": 2, "b": {"k": 3, "c": 4}}]});
        value.strip_key_recursively("k");
        assert_eq!(value, json!({"a": [{"b": {"c": 4}}]}));
    }

    #[test]
    fn test_path_display_and_serialization() {
        let path = Path::from("hero/heroFriends/1/name");
        assert_eq!(path.to_string(), "/hero/heroFriends/1/name");
        assert_eq!(
            serde_json::to_value(&path).unwrap(),
            serde_json::json!(["hero", "heroFriends", 1, "name"])
        );
        assert_eq!(
            Path::empty().with_key("a").with_index(0).join(Path::from("b")),
            path_of(&["a", "0", "b"])
        );
    }

    fn path_of(elements: &[&str]) -> Path {
        Path::from(elements.join("/"))
    }
}
