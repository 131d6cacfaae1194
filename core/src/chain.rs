//! Chain definitions: the ordered stages bound to one candidate handler.
//!
//! A definition is immutable once built and is shared (`Arc`) by every request
//! that tries it. Per-request state lives in the runtime's chain instances.
//!
//! Stages are listed either as ready instances or as type references that the
//! [`Instantiate`] collaborator turns into instances when the runner reaches
//! them.

use crate::instantiate::{Instantiate, InstantiateError};
use crate::stage::Stage;
use http::HeaderMap;
use smallvec::SmallVec;
use std::any::{TypeId, type_name};
use std::fmt;
use std::sync::Arc;

/// Reference to a type that can be instantiated on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeRef {
    id: TypeId,
    name: &'static str,
}

impl TypeRef {
    /// Reference the type `T`
    #[must_use]
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    /// Type identity used for factory lookup
    #[must_use]
    pub const fn id(&self) -> TypeId {
        self.id
    }

    /// Type name for logs and errors
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

/// Either a ready instance or a type reference to construct on demand.
pub enum Item<T: ?Sized> {
    /// Ready to use
    Instance(Arc<T>),
    /// Constructed through the instantiation collaborator before use
    TypeRef(TypeRef),
}

impl<T: ?Sized> Clone for Item<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Instance(instance) => Self::Instance(Arc::clone(instance)),
            Self::TypeRef(type_ref) => Self::TypeRef(*type_ref),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Item<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instance(_) => write!(f, "Item::Instance(<instance>)"),
            Self::TypeRef(type_ref) => f.debug_tuple("Item::TypeRef").field(&type_ref.name).finish(),
        }
    }
}

/// A stage entry in a chain definition.
pub type StageItem = Item<dyn Stage>;

impl Item<dyn Stage> {
    /// Resolve to a live stage.
    ///
    /// # Errors
    ///
    /// Returns [`InstantiateError`] if a type reference cannot be constructed.
    pub fn resolve(&self, instantiator: &dyn Instantiate) -> Result<Arc<dyn Stage>, InstantiateError> {
        match self {
            Self::Instance(stage) => Ok(Arc::clone(stage)),
            Self::TypeRef(type_ref) => instantiator.instantiate(type_ref),
        }
    }

    /// Name for logs before the item is resolved
    #[must_use]
    pub fn display_name(&self) -> &str {
        match self {
            Self::Instance(stage) => stage.name(),
            Self::TypeRef(type_ref) => type_ref.name(),
        }
    }
}

/// Adds or rewrites headers on a response assembled from this chain.
pub type HeaderDecorator = Arc<dyn Fn(&mut HeaderMap) + Send + Sync>;

/// Ordered stages bound to one candidate handler.
///
/// # Example
///
/// ```
/// use relay_core::{ChainDefinition, StageOutcome, stage::from_fn};
///
/// let chain = ChainDefinition::new("health")
///     .stage(from_fn("respond", |_ctx| Ok(StageOutcome::status(http::StatusCode::OK))))
///     .decorate(|headers| {
///         headers.insert("cache-control", http::HeaderValue::from_static("no-store"));
///     });
///
/// assert_eq!(chain.name(), "health");
/// assert_eq!(chain.len(), 1);
/// ```
#[derive(Clone)]
pub struct ChainDefinition {
    name: Arc<str>,
    stages: SmallVec<[StageItem; 8]>,
    decorators: Vec<HeaderDecorator>,
}

impl ChainDefinition {
    /// Start an empty chain definition
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            stages: SmallVec::new(),
            decorators: Vec::new(),
        }
    }

    /// Append a ready stage instance
    #[must_use]
    pub fn stage<S: Stage + 'static>(mut self, stage: S) -> Self {
        self.stages.push(Item::Instance(Arc::new(stage)));
        self
    }

    /// Append a shared stage instance
    #[must_use]
    pub fn stage_arc(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(Item::Instance(stage));
        self
    }

    /// Append a stage constructed on demand from its type
    #[must_use]
    pub fn stage_type<S: Stage + 'static>(mut self) -> Self {
        self.stages.push(Item::TypeRef(TypeRef::of::<S>()));
        self
    }

    /// Append a header decorator applied to responses this chain produces
    #[must_use]
    pub fn decorate<F>(mut self, decorator: F) -> Self
    where
        F: Fn(&mut HeaderMap) + Send + Sync + 'static,
    {
        self.decorators.push(Arc::new(decorator));
        self
    }

    /// Chain name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared chain name, cheap to clone into logs and contexts
    #[must_use]
    pub fn name_arc(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    /// Stage entries in execution order
    #[must_use]
    pub fn stages(&self) -> &[StageItem] {
        &self.stages
    }

    /// Number of stages
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the chain has no stages
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run every decorator over the given headers, in registration order
    pub fn apply_decorators(&self, headers: &mut HeaderMap) {
        for decorator in &self.decorators {
            decorator(headers);
        }
    }
}

impl fmt::Debug for ChainDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainDefinition")
            .field("name", &self.name)
            .field("stages", &self.stages)
            .field("decorators", &self.decorators.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StageContext;
    use crate::instantiate::StageRegistry;
    use crate::stage::{StageFuture, StageOutcome, from_fn};
    use http::HeaderValue;

    #[derive(Default)]
    struct Lazy;

    impl Stage for Lazy {
        fn name(&self) -> &str {
            "lazy"
        }

        fn execute<'a>(&'a self, _ctx: &'a mut StageContext) -> StageFuture<'a> {
            Box::pin(async { Ok(StageOutcome::Reject) })
        }
    }

    #[test]
    fn test_builder_preserves_stage_order() {
        let chain = ChainDefinition::new("ordered")
            .stage(from_fn("one", |_| Ok(StageOutcome::next())))
            .stage_type::<Lazy>()
            .stage(from_fn("three", |_| Ok(StageOutcome::next())));

        let names: Vec<_> = chain.stages().iter().map(StageItem::display_name).collect();
        assert_eq!(names.len(), 3);
        assert_eq!(names[0], "one");
        assert!(names[1].ends_with("Lazy"));
        assert_eq!(names[2], "three");
    }

    #[test]
    fn test_resolve_instance_and_type_ref() -> Result<(), InstantiateError> {
        let registry = StageRegistry::new().with::<Lazy>();
        let chain = ChainDefinition::new("mixed")
            .stage(from_fn("ready", |_| Ok(StageOutcome::next())))
            .stage_type::<Lazy>();

        let ready = chain.stages()[0].resolve(&registry)?;
        let lazy = chain.stages()[1].resolve(&registry)?;

        assert_eq!(ready.name(), "ready");
        assert_eq!(lazy.name(), "lazy");
        Ok(())
    }

    #[test]
    fn test_unregistered_type_ref_fails() {
        let registry = StageRegistry::new();
        let chain = ChainDefinition::new("missing").stage_type::<Lazy>();

        let result = chain.stages()[0].resolve(&registry);
        assert!(matches!(result, Err(InstantiateError::UnknownType { .. })));
    }

    #[test]
    fn test_decorators_run_in_order() {
        let chain = ChainDefinition::new("decorated")
            .decorate(|h| {
                h.insert("x-layer", HeaderValue::from_static("first"));
            })
            .decorate(|h| {
                h.insert("x-layer", HeaderValue::from_static("second"));
            });

        let mut headers = HeaderMap::new();
        chain.apply_decorators(&mut headers);
        assert_eq!(headers.get("x-layer"), Some(&HeaderValue::from_static("second")));
    }
}
