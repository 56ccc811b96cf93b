//! # Stratoform
//!
//! Stratoform is the dependency-ordered resource graph at the heart of a
//! declarative Infrastructure as Code (IaC) tool. Each resource is declared
//! with a logical name, an opaque type tag, a property bag and zero or more
//! explicit dependencies; the declarations are assembled into a Directed
//! Acyclic Graph (DAG) capturing the order in which the resources must be
//! created on a platform.
//!
//! Stratoform does not talk to any platform itself. Creation and destruction
//! happen through the [`Provision`] trait, injected at the point the graph is
//! walked. This removes a layer of indirection and keeps your infrastructure
//! domain specific.
//!
//! ## Key Features
//!
//! - **Declarative graph construction**: resources are registered with
//!   [`GraphBuilder::declare`]; dependency edges come from explicit
//!   `depends_on` sets and are also inferred automatically wherever one
//!   resource's property bag references another resource's outputs.
//! - **Deferred outputs**: values known only after a dependency exists on the
//!   platform (an ARN, a generated id) are expressed as
//!   [output references](output::OutputRef) and resolved at the single point
//!   they become available. "Not yet known" is a checked condition, never a
//!   default.
//! - **Deterministic ordering**: [`GraphBuilder::build`] performs a
//!   topological sort with ties broken by declaration order, so the same
//!   program always produces the same schedule.
//! - **Partial-failure reporting**: a failed apply or teardown reports the
//!   whole blast radius in one result instead of throwing on the first
//!   casualty.
//!
//! ## Lifecycle
//!
//! A graph moves through construct → declare → build → realize/teardown:
//!
//! 1. Declare resources (and stack exports) on a [`GraphBuilder`].
//! 2. [`GraphBuilder::build`] validates the declarations (duplicate names,
//!    references to undeclared resources and dependency cycles are all
//!    caught here, eagerly) and returns a [`Graph`] in dependency order.
//! 3. [`Graph::realize`] creates each resource through the provider once all
//!    of its dependencies are realized; [`Graph::teardown`] destroys
//!    realized resources in reverse order.
//!
//! An example usage can be found in `crates/stratoform/src/test.rs`,
//! demonstrating how to declare and realize resources using the library's
//! primitives.
//!
//! ## Error Handling
//!
//! Stratoform exposes a comprehensive error enum [`Error`], which encompasses
//! all possible errors that may occur during operations. Functions that can
//! result in errors return a `Result` type with this [`Error`], ensuring
//! robust error handling throughout the library.

use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
};

use snafu::prelude::*;

pub mod graph;
pub mod output;

pub use graph::{ApplyOptions, ApplyReport, Graph, RealizedSet, Status, TeardownReport};
pub use output::{OutputRef, Outputs, Property, PropertyBag};

use output::OutputSlot;

/// Marker trait for userland errors.
pub trait UserError: core::fmt::Display + core::fmt::Debug + 'static {}
impl<T: core::fmt::Display + core::fmt::Debug + 'static> UserError for T {}

/// Top-level error enum that encompasses all errors.
#[derive(snafu::Snafu, Debug)]
pub enum Error {
    #[snafu(display("{message}"))]
    Other { message: String },

    #[snafu(display("A resource named '{name}' has already been declared"))]
    DuplicateName { name: String },

    #[snafu(display("'{referenced_by}' references '{name}', which was never declared"))]
    UnknownReference { name: String, referenced_by: String },

    #[snafu(display("Dependency cycle among resources: {}", names.join(", ")))]
    Cycle { names: Vec<String> },

    #[snafu(display("Output '{field}' of '{name}' is unresolved"))]
    OutputUnresolved { name: String, field: String },

    #[snafu(display("Error during '{name}' creation: {error}"))]
    Create {
        name: String,
        error: Box<dyn UserError>,
    },

    #[snafu(display("Error during '{name}' destruction: {error}"))]
    Destroy {
        name: String,
        error: Box<dyn UserError>,
    },

    #[snafu(display("Apply halted with partial progress:\n{report}"))]
    PartialApply { report: ApplyReport },

    #[snafu(display("Teardown finished with failures:\n{report}"))]
    Teardown { report: TeardownReport },
}

impl From<anyhow::Error> for Error {
    fn from(source: anyhow::Error) -> Self {
        Error::Other {
            message: source
                .chain()
                .map(|e| format!("{e}"))
                .collect::<Vec<_>>()
                .join("\n -> "),
        }
    }
}

type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Clone, Default, Debug)]
pub struct Dependencies {
    /// Names of resources that must be realized first.
    inner: Vec<String>,
}

impl IntoIterator for Dependencies {
    type Item = String;

    type IntoIter = <Vec<String> as IntoIterator>::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

impl core::fmt::Display for Dependencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(
            &self
                .inner
                .iter()
                .map(|u| u.to_string())
                .collect::<Vec<_>>()
                .join(", "),
        )
    }
}

impl Dependencies {
    pub fn merge(self, other: Self) -> Self {
        Dependencies {
            inner: [self.inner, other.inner].concat(),
        }
    }
}

/// Tracks dependencies between resources.
///
/// The default implementation reports zero dependencies.
pub trait HasDependencies {
    fn dependencies(&self) -> Dependencies {
        Dependencies::default()
    }
}

/// Provisioning backend.
///
/// Represents the platform (ie AWS, Digital Ocean, etc) that realizes
/// declared resources. The graph core only ever reaches the platform through
/// this trait, keeping the ordering logic free of platform specifics.
pub trait Provision {
    /// Errors that may occur interacting with the platform.
    type Error: UserError;

    /// Creates the resource on the platform, returning its realized outputs.
    ///
    /// `properties` is the fully resolved property bag: every output
    /// reference within has already been replaced by its concrete value, so
    /// implementations never see an unresolved reference.
    fn create(
        &self,
        resource: &Resource,
        properties: &Outputs,
    ) -> impl Future<Output = Result<Outputs, Self::Error>>;

    /// Destroys a previously realized resource.
    ///
    /// `outputs` is the realized property bag the resource was created with,
    /// which carries whatever platform identifiers are needed to delete it.
    fn destroy(
        &self,
        resource: &Resource,
        outputs: &Outputs,
    ) -> impl Future<Output = Result<(), Self::Error>>;
}

/// A declared unit of desired state.
///
/// Carries the logical name, the opaque type tag (eg `aws:s3:Bucket`), the
/// desired properties and the explicit dependency set.
#[derive(Clone, Debug)]
pub struct Resource {
    name: String,
    ty: String,
    properties: PropertyBag,
    depends_on: BTreeSet<String>,
}

impl Resource {
    /// The logical name, unique within a graph.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The opaque type tag.
    pub fn ty(&self) -> &str {
        &self.ty
    }

    /// The declared (unresolved) properties.
    pub fn properties(&self) -> &PropertyBag {
        &self.properties
    }

    /// The explicitly declared dependencies.
    ///
    /// Dependencies implied by output references in the property bag are not
    /// listed here; [`HasDependencies::dependencies`] reports both.
    pub fn depends_on(&self) -> impl Iterator<Item = &str> {
        self.depends_on.iter().map(String::as_str)
    }
}

impl HasDependencies for Resource {
    fn dependencies(&self) -> Dependencies {
        let explicit = Dependencies {
            inner: self.depends_on.iter().cloned().collect(),
        };
        explicit.merge(self.properties.dependencies())
    }
}

/// Handle onto a declared resource.
///
/// Used to reference the resource's not-yet-known outputs from other
/// declarations.
#[derive(Clone, Debug)]
pub struct ResourceHandle {
    name: String,
    slot: OutputSlot,
}

impl ResourceHandle {
    /// Name of the declared resource.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A deferred reference to one field of this resource's realized outputs.
    ///
    /// Embedding the returned property in another declaration records an
    /// implicit dependency edge; the value itself resolves once this
    /// resource is realized.
    pub fn output(&self, field: impl Into<String>) -> Property {
        Property::Output(OutputRef::new(
            self.name.clone(),
            field.into(),
            self.slot.clone(),
        ))
    }
}

pub(crate) struct Declared {
    pub(crate) resource: Resource,
    pub(crate) slot: OutputSlot,
}

/// Collects resource declarations and stack exports.
///
/// The builder is the declaration phase of the lifecycle:
/// construct → [`declare`](Self::declare) → [`build`](Self::build) →
/// realize/teardown.
#[derive(Default)]
pub struct GraphBuilder {
    declarations: Vec<Declared>,
    index: BTreeMap<String, usize>,
    exports: Vec<(String, Property)>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a resource.
    ///
    /// `depends_on` names resources that must be realized first. Edges
    /// implied by output references inside `properties` are discovered on
    /// their own and do not need to be repeated here.
    ///
    /// ## Errors
    /// Errs if a resource by the given name has already been declared.
    pub fn declare(
        &mut self,
        name: impl Into<String>,
        ty: impl Into<String>,
        properties: PropertyBag,
        depends_on: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<ResourceHandle, Error> {
        let name = name.into();
        let ty = ty.into();
        ensure!(
            !self.index.contains_key(&name),
            DuplicateNameSnafu { name: name.clone() }
        );
        log::debug!("declared '{name}' ({ty})");

        let slot = OutputSlot::default();
        let resource = Resource {
            name: name.clone(),
            ty,
            properties,
            depends_on: depends_on.into_iter().map(Into::into).collect(),
        };
        self.index.insert(name.clone(), self.declarations.len());
        self.declarations.push(Declared {
            resource,
            slot: slot.clone(),
        });
        Ok(ResourceHandle { name, slot })
    }

    /// Registers a stack-level export, resolved after a successful realize
    /// pass and returned in the [`RealizedSet`].
    pub fn export(&mut self, name: impl Into<String>, value: impl Into<Property>) {
        let name = name.into();
        log::debug!("declared export '{name}'");
        self.exports.push((name, value.into()));
    }

    /// Performs the topological sort over explicit and implicit dependency
    /// edges and returns the graph with resources in dependency order:
    /// dependencies strictly precede dependents, ties broken by declaration
    /// order.
    ///
    /// ## Errors
    /// - [`Error::UnknownReference`] if any declaration or export references
    ///   a name that was never declared. This is caught here, never at
    ///   realize time.
    /// - [`Error::Cycle`] if the declarations do not form a DAG, naming the
    ///   resources on the cycle.
    pub fn build(self) -> Result<Graph, Error> {
        graph::build(self.declarations, self.exports, self.index)
    }
}
