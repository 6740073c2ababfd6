//! Formatter registry.
//!
//! [`ResolverBuilder`] records one constructor per type together with the types
//! whose formatters it needs. The registrations form a directed graph that is
//! checked for cycles as each edge is added. [`ResolverBuilder::build`] then
//! constructs every formatter in dependency order into an arena indexed by
//! [`TypeId`].

use std::any::{type_name, Any, TypeId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{constants, ProtocolError, Result};
use crate::formatter::builtin::{
    BoolFormatter, BytesFormatter, MapFormatter, NumberFormatter, OptionFormatter, SerdeFormatter,
    StringFormatter, VecFormatter,
};
use crate::formatter::version::{VersionData, VersionedFormatter};
use crate::formatter::Formatter;
use crate::utils::buffer_pool::PooledBuffer;

type Erased = Box<dyn Any + Send + Sync>;
type Constructor = Box<dyn FnOnce(&BuildContext<'_>) -> Result<Erased> + Send>;
type VersionTable<T> = Arc<Mutex<BTreeMap<u32, Arc<dyn Formatter<T>>>>>;

struct Pending {
    name: &'static str,
    deps: Vec<TypeId>,
    construct: Constructor,
}

/// Collects formatter registrations and builds a [`FormatterResolver`].
#[derive(Default)]
pub struct ResolverBuilder {
    pending: HashMap<TypeId, Pending>,
    order: Vec<TypeId>,
    names: HashMap<TypeId, &'static str>,
    versions: HashMap<TypeId, Box<dyn Any + Send>>,
}

impl ResolverBuilder {
    /// An empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// A builder with formatters for primitives, strings and byte blobs
    pub fn with_builtins() -> Result<Self> {
        let mut builder = Self::new();
        builder
            .register_formatter::<bool, _>(BoolFormatter)?
            .register_formatter::<u8, _>(NumberFormatter)?
            .register_formatter::<i8, _>(NumberFormatter)?
            .register_formatter::<u16, _>(NumberFormatter)?
            .register_formatter::<i16, _>(NumberFormatter)?
            .register_formatter::<u32, _>(NumberFormatter)?
            .register_formatter::<i32, _>(NumberFormatter)?
            .register_formatter::<u64, _>(NumberFormatter)?
            .register_formatter::<i64, _>(NumberFormatter)?
            .register_formatter::<u128, _>(NumberFormatter)?
            .register_formatter::<i128, _>(NumberFormatter)?
            .register_formatter::<f32, _>(NumberFormatter)?
            .register_formatter::<f64, _>(NumberFormatter)?
            .register_formatter::<String, _>(StringFormatter)?
            .register_formatter::<Vec<u8>, _>(BytesFormatter)?
            .register_formatter::<Bytes, _>(BytesFormatter)?;
        Ok(builder)
    }

    /// Start a registration for `T`; finish it with [`Registration::build_with`]
    pub fn register<T: 'static>(&mut self) -> Registration<'_, T> {
        Registration {
            builder: self,
            deps: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Register a ready-made formatter with no dependencies
    pub fn register_formatter<T, F>(&mut self, formatter: F) -> Result<&mut Self>
    where
        T: 'static,
        F: Formatter<T>,
    {
        self.register::<T>()
            .build_with(move |_| Ok(Arc::new(formatter) as Arc<dyn Formatter<T>>))
    }

    /// Register `Vec<T>` in terms of `T`
    pub fn register_vec<T: Send + Sync + 'static>(&mut self) -> Result<&mut Self> {
        self.register::<Vec<T>>()
            .depends_on::<T>()
            .build_with(|ctx| Ok(Arc::new(VecFormatter::new(ctx.get::<T>()?))))
    }

    /// Register `Option<T>` in terms of `T`
    pub fn register_option<T: Send + Sync + 'static>(&mut self) -> Result<&mut Self> {
        self.register::<Option<T>>()
            .depends_on::<T>()
            .build_with(|ctx| Ok(Arc::new(OptionFormatter::new(ctx.get::<T>()?))))
    }

    /// Register `HashMap<K, V>` in terms of `K` and `V`
    pub fn register_map<K, V>(&mut self) -> Result<&mut Self>
    where
        K: Eq + Hash + Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        self.register::<HashMap<K, V>>()
            .depends_on::<K>()
            .depends_on::<V>()
            .build_with(|ctx| {
                Ok(Arc::new(MapFormatter::new(
                    ctx.get::<K>()?,
                    ctx.get::<V>()?,
                )))
            })
    }

    /// Register any serde type through a length-prefixed bincode encoding
    pub fn register_serde<T>(&mut self) -> Result<&mut Self>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.register_formatter::<T, _>(SerdeFormatter::<T>::new())
    }

    /// Register `formatter` as version `version` of `T`.
    ///
    /// All versions of `T` are served by one formatter for [`VersionData<T>`].
    pub fn register_version<T, F>(&mut self, version: u32, formatter: F) -> Result<&mut Self>
    where
        T: Send + Sync + 'static,
        F: Formatter<T>,
    {
        let key = TypeId::of::<VersionData<T>>();
        if !self.versions.contains_key(&key) {
            let table: VersionTable<T> = Arc::new(Mutex::new(BTreeMap::new()));
            let shared = Arc::clone(&table);
            self.register::<VersionData<T>>().build_with(move |_| {
                let versions = shared
                    .lock()
                    .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.to_string()))?
                    .clone();
                Ok(Arc::new(VersionedFormatter::new(versions)))
            })?;
            self.versions.insert(key, Box::new(table));
        }

        {
            let table = self
                .versions
                .get(&key)
                .and_then(|entry| entry.downcast_ref::<VersionTable<T>>())
                .ok_or(ProtocolError::MissingFormatter(type_name::<VersionData<T>>()))?;
            let mut versions = table
                .lock()
                .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.to_string()))?;
            if versions.contains_key(&version) {
                return Err(ProtocolError::DuplicateFormatter(format!(
                    "{} v{version}",
                    type_name::<T>()
                )));
            }
            versions.insert(version, Arc::new(formatter));
        }
        Ok(self)
    }

    /// Whether a formatter for `T` has been registered
    pub fn contains<T: 'static>(&self) -> bool {
        self.pending.contains_key(&TypeId::of::<T>())
    }

    fn insert(
        &mut self,
        id: TypeId,
        name: &'static str,
        deps: Vec<(TypeId, &'static str)>,
        construct: Constructor,
    ) -> Result<()> {
        if self.pending.contains_key(&id) {
            return Err(ProtocolError::DuplicateFormatter(name.to_string()));
        }
        self.names.insert(id, name);
        for &(dep, dep_name) in &deps {
            self.names.entry(dep).or_insert(dep_name);
        }

        // Adding `id -> dep` closes a cycle iff `id` is already reachable from `dep`
        for &(dep, _) in &deps {
            if let Some(path) = self.find_path(dep, id) {
                let rendered: Vec<&str> = std::iter::once(id)
                    .chain(path)
                    .map(|node| self.name_of(node))
                    .collect();
                return Err(ProtocolError::FormatterCycle(rendered.join(" -> ")));
            }
        }

        self.pending.insert(
            id,
            Pending {
                name,
                deps: deps.into_iter().map(|(dep, _)| dep).collect(),
                construct,
            },
        );
        self.order.push(id);
        Ok(())
    }

    fn find_path(&self, from: TypeId, target: TypeId) -> Option<Vec<TypeId>> {
        let mut stack = vec![vec![from]];
        let mut seen = HashSet::new();
        while let Some(path) = stack.pop() {
            let node = *path.last()?;
            if node == target {
                return Some(path);
            }
            if !seen.insert(node) {
                continue;
            }
            if let Some(entry) = self.pending.get(&node) {
                for &dep in &entry.deps {
                    let mut next = path.clone();
                    next.push(dep);
                    stack.push(next);
                }
            }
        }
        None
    }

    fn name_of(&self, id: TypeId) -> &'static str {
        self.names.get(&id).copied().unwrap_or("<unknown>")
    }

    /// Construct every registered formatter.
    ///
    /// Fails with [`ProtocolError::MissingFormatter`] if a declared dependency was
    /// never registered.
    pub fn build(mut self) -> Result<FormatterResolver> {
        for id in &self.order {
            if let Some(entry) = self.pending.get(id) {
                if let Some(missing) = entry.deps.iter().find(|d| !self.pending.contains_key(d)) {
                    return Err(ProtocolError::MissingFormatter(self.name_of(*missing)));
                }
            }
        }

        let mut sorted = Vec::with_capacity(self.order.len());
        let mut visited = HashSet::new();
        for &id in &self.order {
            topo_visit(id, &self.pending, &mut visited, &mut sorted);
        }

        let mut built: HashMap<TypeId, Erased> = HashMap::with_capacity(sorted.len());
        for id in sorted {
            let Some(entry) = self.pending.remove(&id) else {
                continue;
            };
            let ctx = BuildContext {
                built: &built,
                current: entry.name,
                declared: &entry.deps,
            };
            let formatter = (entry.construct)(&ctx)?;
            built.insert(id, formatter);
        }

        let mut arena = Vec::with_capacity(built.len());
        let mut index = HashMap::with_capacity(built.len());
        let mut names = HashMap::with_capacity(built.len());
        for id in self.order {
            if let Some(formatter) = built.remove(&id) {
                index.insert(id, arena.len());
                names.insert(id, self.names.get(&id).copied().unwrap_or("<unknown>"));
                arena.push(formatter);
            }
        }

        debug!(formatters = arena.len(), "Formatter resolver built");
        Ok(FormatterResolver {
            arena,
            index,
            names,
        })
    }
}

fn topo_visit(
    id: TypeId,
    pending: &HashMap<TypeId, Pending>,
    visited: &mut HashSet<TypeId>,
    sorted: &mut Vec<TypeId>,
) {
    if !visited.insert(id) {
        return;
    }
    if let Some(entry) = pending.get(&id) {
        for &dep in &entry.deps {
            topo_visit(dep, pending, visited, sorted);
        }
    }
    sorted.push(id);
}

impl fmt::Debug for ResolverBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolverBuilder")
            .field("registered", &self.order.len())
            .finish()
    }
}

/// An in-progress registration for `T`
pub struct Registration<'a, T> {
    builder: &'a mut ResolverBuilder,
    deps: Vec<(TypeId, &'static str)>,
    _marker: PhantomData<fn() -> T>,
}

impl<'a, T: 'static> Registration<'a, T> {
    /// Declare that the formatter for `T` needs the formatter for `U`
    pub fn depends_on<U: 'static>(mut self) -> Self {
        let dep = (TypeId::of::<U>(), type_name::<U>());
        if !self.deps.contains(&dep) {
            self.deps.push(dep);
        }
        self
    }

    /// Finish the registration with the constructor for `T`'s formatter
    pub fn build_with<F>(self, construct: F) -> Result<&'a mut ResolverBuilder>
    where
        F: FnOnce(&BuildContext<'_>) -> Result<Arc<dyn Formatter<T>>> + Send + 'static,
    {
        let construct: Constructor =
            Box::new(move |ctx| construct(ctx).map(|formatter| Box::new(formatter) as Erased));
        self.builder
            .insert(TypeId::of::<T>(), type_name::<T>(), self.deps, construct)?;
        Ok(self.builder)
    }
}

/// Access to already-built formatters while constructing another one
pub struct BuildContext<'a> {
    built: &'a HashMap<TypeId, Erased>,
    current: &'static str,
    declared: &'a [TypeId],
}

impl BuildContext<'_> {
    /// Formatter for a declared dependency `U`
    pub fn get<U: 'static>(&self) -> Result<Arc<dyn Formatter<U>>> {
        let id = TypeId::of::<U>();
        if !self.declared.contains(&id) {
            return Err(ProtocolError::UndeclaredDependency {
                formatter: self.current,
                dependency: type_name::<U>(),
            });
        }
        self.built
            .get(&id)
            .and_then(|entry| entry.downcast_ref::<Arc<dyn Formatter<U>>>())
            .cloned()
            .ok_or(ProtocolError::MissingFormatter(type_name::<U>()))
    }
}

/// Immutable registry of built formatters, indexed by type
pub struct FormatterResolver {
    arena: Vec<Erased>,
    index: HashMap<TypeId, usize>,
    names: HashMap<TypeId, &'static str>,
}

impl FormatterResolver {
    /// Formatter for `T`, if one was registered
    pub fn get<T: 'static>(&self) -> Option<&dyn Formatter<T>> {
        let slot = *self.index.get(&TypeId::of::<T>())?;
        self.arena
            .get(slot)?
            .downcast_ref::<Arc<dyn Formatter<T>>>()
            .map(|formatter| formatter.as_ref())
    }

    /// Formatter for `T`, or [`ProtocolError::MissingFormatter`]
    pub fn get_with_verify<T: 'static>(&self) -> Result<&dyn Formatter<T>> {
        self.get::<T>()
            .ok_or(ProtocolError::MissingFormatter(type_name::<T>()))
    }

    /// Serialize `value` with its registered formatter
    pub fn serialize<T: 'static>(&self, value: &T, buf: &mut PooledBuffer) -> Result<()> {
        self.get_with_verify::<T>()?.serialize(value, buf)
    }

    /// Deserialize a `T` with its registered formatter
    pub fn deserialize<T: 'static>(&self, buf: &mut PooledBuffer) -> Result<T> {
        self.get_with_verify::<T>()?.deserialize(buf)
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.index.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }
}

impl fmt::Debug for FormatterResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.names.values().collect();
        names.sort();
        f.debug_struct("FormatterResolver")
            .field("formatters", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Node;
    struct Edge;

    struct Unit;
    impl<T: Default + Send + Sync + 'static> Formatter<T> for Unit {
        fn serialize(&self, _value: &T, _buf: &mut PooledBuffer) -> Result<()> {
            Ok(())
        }
        fn deserialize(&self, _buf: &mut PooledBuffer) -> Result<T> {
            Ok(T::default())
        }
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_missing_formatter_is_lookup_error() {
        let resolver = ResolverBuilder::with_builtins().unwrap().build().unwrap();
        assert!(resolver.get::<Vec<u32>>().is_none());
        assert!(matches!(
            resolver.get_with_verify::<Vec<u32>>(),
            Err(ProtocolError::MissingFormatter(_))
        ));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_cycle_rejected_at_registration() {
        let mut builder = ResolverBuilder::new();
        builder
            .register::<Node>()
            .depends_on::<Edge>()
            .build_with(|_| Err(ProtocolError::Custom("unused".into())))
            .unwrap();

        let err = builder
            .register::<Edge>()
            .depends_on::<Node>()
            .build_with(|_| Err(ProtocolError::Custom("unused".into())))
            .err()
            .unwrap();
        match err {
            ProtocolError::FormatterCycle(path) => {
                assert!(path.ends_with("Edge"));
                assert_eq!(path.matches(" -> ").count(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let mut builder = ResolverBuilder::new();
        let result = builder
            .register::<Node>()
            .depends_on::<Node>()
            .build_with(|_| Err(ProtocolError::Custom("unused".into())));
        assert!(matches!(result, Err(ProtocolError::FormatterCycle(_))));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_missing_dependency_fails_build() {
        let mut builder = ResolverBuilder::new();
        builder.register_vec::<u32>().unwrap();
        assert!(matches!(
            builder.build(),
            Err(ProtocolError::MissingFormatter(name)) if name == "u32"
        ));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_duplicate_registration_rejected() {
        let mut builder = ResolverBuilder::with_builtins().unwrap();
        assert!(matches!(
            builder.register_formatter::<u32, _>(NumberFormatter),
            Err(ProtocolError::DuplicateFormatter(_))
        ));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_undeclared_dependency_rejected() {
        let mut builder = ResolverBuilder::with_builtins().unwrap();
        builder
            .register::<Vec<i64>>()
            .build_with(|ctx| Ok(Arc::new(VecFormatter::new(ctx.get::<i64>()?))))
            .unwrap();
        assert!(matches!(
            builder.build(),
            Err(ProtocolError::UndeclaredDependency { .. })
        ));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_dependencies_built_first_regardless_of_order() {
        let mut builder = ResolverBuilder::new();
        // Registered before its element type
        builder.register_option::<Vec<u16>>().unwrap();
        builder.register_vec::<u16>().unwrap();
        builder.register_formatter::<u16, _>(NumberFormatter).unwrap();
        let resolver = builder.build().unwrap();

        let mut buf = PooledBuffer::detached(32);
        let value = Some(vec![1u16, 2, 3]);
        resolver.serialize(&value, &mut buf).unwrap();
        assert_eq!(resolver.deserialize::<Option<Vec<u16>>>(&mut buf).unwrap(), value);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_unit_formatter_registered_generically() {
        let mut builder = ResolverBuilder::new();
        builder.register_formatter::<(), _>(Unit).unwrap();
        let resolver = builder.build().unwrap();
        assert_eq!(resolver.len(), 1);
        assert!(resolver.contains::<()>());
    }
}
