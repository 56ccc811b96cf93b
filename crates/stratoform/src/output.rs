//! Deferred output values.
//!
//! Output values are values that are determined only after a resource has
//! been realized by a provider, such as an ARN, a generated id or a
//! hostname. They are referenced lazily from other declarations and resolved
//! at the single point they become available.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use snafu::OptionExt;

use crate::HasDependencies;

use super::{Dependencies, Error, OutputUnresolvedSnafu, Result};

/// A realized property bag, as returned by a provider.
pub type Outputs = serde_json::Map<String, serde_json::Value>;

/// Shared holder for a resource's realized outputs.
///
/// Every output reference onto a resource points at the same slot, so a
/// single `set` after creation resolves them all.
#[derive(Clone, Debug, Default)]
pub(crate) struct OutputSlot {
    inner: Arc<Mutex<Option<Outputs>>>,
}

impl OutputSlot {
    pub fn get(&self) -> Option<Outputs> {
        self.inner.lock().unwrap().clone()
    }

    pub fn set(&self, value: Option<Outputs>) {
        *self.inner.lock().unwrap() = value;
    }
}

#[derive(Clone)]
enum RefInner {
    /// Read back from serialized form; carries only the last known value.
    Init {
        last_known_value: Option<serde_json::Value>,
    },
    /// Live handle onto the source resource's output slot.
    Var { slot: OutputSlot },
}

/// A single field of another resource's outputs, known only after that
/// resource is realized.
///
/// Obtained from [`ResourceHandle::output`](crate::ResourceHandle::output).
/// Resolving before the source resource is realized is an error, never a
/// default value.
#[derive(Clone)]
pub struct OutputRef {
    depends_on: String,
    field: String,
    inner: RefInner,
}

impl core::fmt::Debug for OutputRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputRef")
            .field("depends_on", &self.depends_on)
            .field("field", &self.field)
            .field("value", &self.get().ok())
            .finish()
    }
}

impl PartialEq for OutputRef {
    fn eq(&self, other: &Self) -> bool {
        if let Ok(here) = self.get() {
            if let Ok(there) = other.get() {
                here == there
            } else {
                false
            }
        } else {
            false
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct OutputRefProxy {
    depends_on: String,
    field: String,
    last_known_value: Option<serde_json::Value>,
}

impl serde::Serialize for OutputRef {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let proxy = OutputRefProxy {
            depends_on: self.depends_on.clone(),
            field: self.field.clone(),
            last_known_value: self.get().ok(),
        };
        proxy.serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for OutputRef {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let OutputRefProxy {
            depends_on,
            field,
            last_known_value,
        } = OutputRefProxy::deserialize(deserializer)?;

        Ok(OutputRef {
            depends_on,
            field,
            inner: RefInner::Init { last_known_value },
        })
    }
}

impl OutputRef {
    pub(crate) fn new(depends_on: String, field: String, slot: OutputSlot) -> Self {
        log::trace!("creating reference to output '{field}' of '{depends_on}'");
        OutputRef {
            depends_on,
            field,
            inner: RefInner::Var { slot },
        }
    }

    /// Name of the resource this reference depends on.
    pub fn depends_on(&self) -> &str {
        &self.depends_on
    }

    /// The referenced output field.
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Resolves the referenced field.
    ///
    /// ## Errors
    /// Errs if the source resource has not been realized, or realized
    /// without producing the referenced field.
    pub fn get(&self) -> Result<serde_json::Value, Error> {
        let value = match &self.inner {
            RefInner::Init { last_known_value } => {
                log::trace!("output reference returning last known value: {last_known_value:?}");
                last_known_value.clone()
            }
            RefInner::Var { slot } => slot
                .get()
                .and_then(|outputs| outputs.get(&self.field).cloned()),
        };
        value.context(OutputUnresolvedSnafu {
            name: self.depends_on.clone(),
            field: self.field.clone(),
        })
    }
}

impl HasDependencies for OutputRef {
    fn dependencies(&self) -> Dependencies {
        Dependencies {
            inner: vec![self.depends_on.clone()],
        }
    }
}

/// A property bag value.
///
/// Either a JSON literal, a deferred [`OutputRef`], or a concatenation of
/// properties rendered to a string once every part is resolvable.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum Property {
    Output(OutputRef),
    Concat { concat: Vec<Property> },
    Literal(serde_json::Value),
}

impl Property {
    /// A property that concatenates the string renderings of `parts`.
    pub fn concat(parts: impl IntoIterator<Item = Property>) -> Self {
        Property::Concat {
            concat: parts.into_iter().collect(),
        }
    }

    /// Resolves to a concrete JSON value.
    ///
    /// ## Errors
    /// Errs if any output reference within is not yet resolvable.
    pub fn resolve(&self) -> Result<serde_json::Value, Error> {
        match self {
            Property::Literal(value) => Ok(value.clone()),
            Property::Output(output) => output.get(),
            Property::Concat { concat } => {
                let mut rendered = String::new();
                for part in concat {
                    match part.resolve()? {
                        serde_json::Value::String(s) => rendered.push_str(&s),
                        other => rendered.push_str(&other.to_string()),
                    }
                }
                Ok(serde_json::Value::String(rendered))
            }
        }
    }
}

impl HasDependencies for Property {
    fn dependencies(&self) -> Dependencies {
        match self {
            Property::Literal(_) => Dependencies::default(),
            Property::Output(output) => output.dependencies(),
            Property::Concat { concat } => concat
                .iter()
                .fold(Dependencies::default(), |deps, part| {
                    deps.merge(part.dependencies())
                }),
        }
    }
}

impl From<OutputRef> for Property {
    fn from(output: OutputRef) -> Self {
        Property::Output(output)
    }
}

impl From<serde_json::Value> for Property {
    fn from(value: serde_json::Value) -> Self {
        Property::Literal(value)
    }
}

impl From<&str> for Property {
    fn from(value: &str) -> Self {
        Property::Literal(value.into())
    }
}

impl From<String> for Property {
    fn from(value: String) -> Self {
        Property::Literal(value.into())
    }
}

impl From<bool> for Property {
    fn from(value: bool) -> Self {
        Property::Literal(value.into())
    }
}

impl From<i64> for Property {
    fn from(value: i64) -> Self {
        Property::Literal(value.into())
    }
}

impl From<f64> for Property {
    fn from(value: f64) -> Self {
        Property::Literal(value.into())
    }
}

/// The desired-state properties of a declared resource.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PropertyBag {
    #[serde(flatten)]
    inner: BTreeMap<String, Property>,
}

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a property, builder style.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Property>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Property>) {
        self.inner.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Property> {
        self.inner.get(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Property)> {
        self.inner.iter()
    }

    /// Resolves every property to its concrete value.
    ///
    /// ## Errors
    /// Errs if any property contains an output reference that is not yet
    /// resolvable.
    pub fn resolve(&self) -> Result<Outputs, Error> {
        let mut resolved = Outputs::new();
        for (key, property) in self.inner.iter() {
            resolved.insert(key.clone(), property.resolve()?);
        }
        Ok(resolved)
    }
}

impl HasDependencies for PropertyBag {
    fn dependencies(&self) -> Dependencies {
        self.inner
            .values()
            .fold(Dependencies::default(), |deps, property| {
                deps.merge(property.dependencies())
            })
    }
}

impl FromIterator<(String, Property)> for PropertyBag {
    fn from_iter<T: IntoIterator<Item = (String, Property)>>(iter: T) -> Self {
        PropertyBag {
            inner: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn output_ref_ser() {
        let slot = OutputSlot::default();
        slot.set(Some(
            [("arn".to_owned(), serde_json::json!("arn:aws:s3:::site"))]
                .into_iter()
                .collect(),
        ));
        let output = OutputRef::new("site-bucket".to_owned(), "arn".to_owned(), slot);
        let s = serde_json::to_value(&output).unwrap();
        assert_eq!(
            serde_json::json!({
                "depends_on": "site-bucket",
                "field": "arn",
                "last_known_value": "arn:aws:s3:::site",
            }),
            s
        );
    }

    #[test]
    fn output_ref_de() {
        let s = serde_json::json!({
            "depends_on": "site-bucket",
            "field": "arn",
            "last_known_value": "arn:aws:s3:::site",
        });
        let output: OutputRef = serde_json::from_value(s).unwrap();
        assert_eq!("site-bucket", output.depends_on());
        assert_eq!(serde_json::json!("arn:aws:s3:::site"), output.get().unwrap());
    }

    #[test]
    fn property_untagged_shapes() {
        // A literal array stays a literal and never turns into a concat.
        let property: Property = serde_json::from_value(serde_json::json!([1, 2, 3])).unwrap();
        assert_eq!(serde_json::json!([1, 2, 3]), property.resolve().unwrap());

        let property: Property =
            serde_json::from_value(serde_json::json!({ "concat": ["a", "b"] })).unwrap();
        assert_eq!(serde_json::json!("ab"), property.resolve().unwrap());
    }
}
