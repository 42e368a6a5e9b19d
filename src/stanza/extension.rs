//! Open extension payloads carried by messages and presences.

use crate::error::Result;
use crate::xml::Element;

/// A typed view over an extension payload element.
///
/// New extension kinds implement this trait; the stanza types never need to
/// know about them.
pub trait ExtensionElement: Sized {
    const NAME: &'static str;
    const NAMESPACE: &'static str;

    fn from_element(element: &Element) -> Result<Self>;

    fn to_element(&self) -> Element;
}

/// Ordered map of extension payloads keyed by `(name, namespace)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extensions {
    entries: Vec<Element>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a payload, replacing (and returning) any payload with the same key.
    pub fn insert(&mut self, element: Element) -> Option<Element> {
        let position = self
            .entries
            .iter()
            .position(|e| e.is(element.name(), element.namespace()));
        match position {
            Some(i) => Some(std::mem::replace(&mut self.entries[i], element)),
            None => {
                self.entries.push(element);
                None
            }
        }
    }

    pub fn get(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.entries.iter().find(|e| e.is(name, namespace))
    }

    pub fn contains(&self, name: &str, namespace: &str) -> bool {
        self.get(name, namespace).is_some()
    }

    pub fn remove(&mut self, name: &str, namespace: &str) -> Option<Element> {
        let i = self.entries.iter().position(|e| e.is(name, namespace))?;
        Some(self.entries.remove(i))
    }

    /// Decode the payload registered under `E`'s key, if present.
    pub fn get_as<E: ExtensionElement>(&self) -> Option<Result<E>> {
        self.get(E::NAME, E::NAMESPACE).map(E::from_element)
    }

    pub fn insert_as<E: ExtensionElement>(&mut self, extension: &E) -> Option<Element> {
        self.insert(extension.to_element())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Element> {
        self.entries.iter()
    }

    /// True if any payload lives in `namespace`.
    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.entries.iter().any(|e| e.namespace() == namespace)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
