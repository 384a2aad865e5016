//! Registered objects: small extensible value sets with stable identifiers.
//!
//! A [`RegisteredObject`] is an `(identifier, name)` pair whose equality and
//! hashing depend on the identifier alone, so values such as [`Platform`] or
//! [`Version`] compare equal across processes that only exchange the number.
//!
//! Each value set has one process-wide [`ObjectRegistry`]. Built-in values are
//! declared as constants and inserted by [`init`], which the owning
//! application calls once at startup. Further values may be registered later;
//! the first registration of an identifier wins and is returned as the
//! canonical instance from then on.

use crate::data::DataKind;
use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::{Once, RwLock};

/// Marker trait for a value set backed by a process-wide registry.
pub trait ObjectKind: Sized + Send + Sync + 'static {
    /// Name of the value set, used in debug output.
    const KIND: &'static str;

    /// The registry holding the canonical instances of this value set.
    fn registry() -> &'static ObjectRegistry<Self>;
}

/// An identifier-keyed member of the value set `K`.
pub struct RegisteredObject<K: ObjectKind> {
    identifier: i32,
    name: Cow<'static, str>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: ObjectKind> RegisteredObject<K> {
    /// Declare a value with a static name. Usable in `const` position.
    pub const fn define(identifier: i32, name: &'static str) -> Self {
        Self {
            identifier,
            name: Cow::Borrowed(name),
            _kind: PhantomData,
        }
    }

    /// Create a value with an owned name. The value is not registered.
    pub fn new(identifier: i32, name: impl Into<String>) -> Self {
        Self {
            identifier,
            name: Cow::Owned(name.into()),
            _kind: PhantomData,
        }
    }

    /// The stable identifier.
    pub fn identifier(&self) -> i32 {
        self.identifier
    }

    /// The human-readable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert this value into its registry and return the canonical instance.
    ///
    /// If the identifier is already registered the existing instance is
    /// returned unchanged.
    pub fn register(self) -> Self {
        K::registry().register(self)
    }

    /// Look up the canonical instance for an identifier.
    pub fn lookup(identifier: i32) -> Option<Self> {
        K::registry().get(identifier)
    }

    /// Canonical instance for `identifier`, or an unregistered value named
    /// after the number when the identifier is unknown to this process.
    pub fn from_identifier(identifier: i32) -> Self {
        Self::lookup(identifier).unwrap_or_else(|| Self::new(identifier, identifier.to_string()))
    }

    /// True if this value equals any of `candidates`.
    pub fn is_one_of(&self, candidates: &[Self]) -> bool {
        candidates.iter().any(|c| c == self)
    }

    /// True if this identifier has been registered in this process.
    pub fn is_registered(&self) -> bool {
        K::registry().contains(self.identifier)
    }
}

impl<K: ObjectKind> Clone for RegisteredObject<K> {
    fn clone(&self) -> Self {
        Self {
            identifier: self.identifier,
            name: self.name.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K: ObjectKind> PartialEq for RegisteredObject<K> {
    fn eq(&self, other: &Self) -> bool {
        self.identifier == other.identifier
    }
}

impl<K: ObjectKind> Eq for RegisteredObject<K> {}

impl<K: ObjectKind> Hash for RegisteredObject<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identifier.hash(state);
    }
}

impl<K: ObjectKind> fmt::Debug for RegisteredObject<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}, {:?})", K::KIND, self.identifier, self.name)
    }
}

impl<K: ObjectKind> fmt::Display for RegisteredObject<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

// Only the identifier crosses process boundaries; the receiver restores the
// name from its own registry.
impl<K: ObjectKind> Serialize for RegisteredObject<K> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.identifier)
    }
}

impl<'de, K: ObjectKind> Deserialize<'de> for RegisteredObject<K> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let identifier = i32::deserialize(deserializer)?;
        Ok(Self::from_identifier(identifier))
    }
}

/// Thread-safe identifier → canonical instance table for one value set.
pub struct ObjectRegistry<K: ObjectKind> {
    entries: RwLock<BTreeMap<i32, RegisteredObject<K>>>,
}

impl<K: ObjectKind> ObjectRegistry<K> {
    /// Create an empty registry.
    pub const fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Insert `object` unless its identifier is taken; return the canonical instance.
    pub fn register(&self, object: RegisteredObject<K>) -> RegisteredObject<K> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries
            .entry(object.identifier)
            .or_insert(object)
            .clone()
    }

    /// Canonical instance for an identifier.
    pub fn get(&self, identifier: i32) -> Option<RegisteredObject<K>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(&identifier).cloned()
    }

    /// Whether an identifier is registered.
    pub fn contains(&self, identifier: i32) -> bool {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.contains_key(&identifier)
    }

    /// All registered instances, ordered by identifier.
    pub fn all(&self) -> Vec<RegisteredObject<K>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.values().cloned().collect()
    }

    /// Number of registered instances.
    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: ObjectKind> Default for ObjectRegistry<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Value-set marker for protocol versions.
pub enum VersionKind {}

impl ObjectKind for VersionKind {
    const KIND: &'static str = "Version";

    fn registry() -> &'static ObjectRegistry<Self> {
        static REGISTRY: ObjectRegistry<VersionKind> = ObjectRegistry::new();
        &REGISTRY
    }
}

/// Protocol version exchanged during connection information handshakes.
pub type Version = RegisteredObject<VersionKind>;

impl RegisteredObject<VersionKind> {
    /// The version spoken by this build.
    pub const CURRENT: Version = Version::define(1, "Current Version");
}

/// Value-set marker for platform tags.
pub enum PlatformKind {}

impl ObjectKind for PlatformKind {
    const KIND: &'static str = "Platform";

    fn registry() -> &'static ObjectRegistry<Self> {
        static REGISTRY: ObjectRegistry<PlatformKind> = ObjectRegistry::new();
        &REGISTRY
    }
}

/// Platform a peer runs on.
pub type Platform = RegisteredObject<PlatformKind>;

impl RegisteredObject<PlatformKind> {
    pub const WINDOWS: Platform = Platform::define(0, "Windows");
    pub const MAC: Platform = Platform::define(100, "Mac");
    pub const IOS: Platform = Platform::define(200, "iOS");
    pub const LINUX: Platform = Platform::define(300, "Linux");

    /// The platform of the running process.
    pub fn current() -> Platform {
        if cfg!(target_os = "windows") {
            Self::WINDOWS
        } else if cfg!(target_os = "macos") {
            Self::MAC
        } else if cfg!(target_os = "ios") {
            Self::IOS
        } else {
            Self::LINUX
        }
    }
}

/// Register every built-in value. Safe to call more than once.
pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        Version::CURRENT.register();
        for platform in [Platform::WINDOWS, Platform::MAC, Platform::IOS, Platform::LINUX] {
            platform.register();
        }
        for kind in DataKind::BUILTIN {
            kind.register();
        }
    });
}
