//! Desired and final resource state exchanged between the program and the
//! engine.

use crate::property::PropertyMap;
use crate::tokens::{ResourceType, Urn};

/// The declared desired state of a single resource, as produced by a
/// begin-registration call. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct Goal {
    ty: ResourceType,
    name: String,
    custom: bool,
    properties: PropertyMap,
    parent: Option<Urn>,
}

impl Goal {
    pub fn new(
        ty: ResourceType,
        name: impl Into<String>,
        custom: bool,
        properties: PropertyMap,
        parent: Option<Urn>,
    ) -> Self {
        Self {
            ty,
            name: name.into(),
            custom,
            properties,
            parent,
        }
    }

    pub fn ty(&self) -> &ResourceType {
        &self.ty
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when the resource is managed by an external provider; false for
    /// purely logical component resources.
    pub fn custom(&self) -> bool {
        self.custom
    }

    pub fn properties(&self) -> &PropertyMap {
        &self.properties
    }

    pub fn parent(&self) -> Option<&Urn> {
        self.parent.as_ref()
    }
}

/// The authoritative post-step attribute snapshot of a resource.
#[derive(Debug, Clone)]
pub struct ResourceState {
    pub ty: ResourceType,
    pub urn: Urn,
    /// Provider-assigned identifier. Empty for non-custom resources.
    pub id: String,
    pub inputs: PropertyMap,
    pub outputs: PropertyMap,
}

impl ResourceState {
    /// The property subset handed back to the program: the inputs overlaid
    /// with every computed output.
    pub fn synthesized(&self) -> PropertyMap {
        let mut props = self.inputs.clone();
        for (key, value) in &self.outputs {
            props.insert(key.clone(), value.clone());
        }
        props
    }
}

/// The engine's reply to an end-registration: final state plus stability
/// hints for dry-run planning.
#[derive(Debug, Clone)]
pub struct FinalState {
    pub state: ResourceState,
    /// True when every returned value is stable across dry-runs.
    pub stable: bool,
    /// Property names known to be stable when the whole object is not.
    pub stables: Vec<String>,
}
