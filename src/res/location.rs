use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::operation::ResultType;
use crate::errors::*;
use crate::utils::hash::{hash, FxHasher};

/// The primary key a `Location` is registered with. Several locations could
/// share a key (aliases).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LocationKey {
    Name(String),
    Uuid(Uuid),
}

impl fmt::Display for LocationKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            LocationKey::Name(ref name) => write!(f, "{}", name),
            LocationKey::Uuid(ref uuid) => write!(f, "{}", uuid),
        }
    }
}

impl<'a> From<&'a str> for LocationKey {
    fn from(name: &'a str) -> Self {
        LocationKey::Name(name.to_owned())
    }
}

impl From<String> for LocationKey {
    fn from(name: String) -> Self {
        LocationKey::Name(name)
    }
}

impl From<Uuid> for LocationKey {
    fn from(uuid: Uuid) -> Self {
        LocationKey::Uuid(uuid)
    }
}

/// An immutable description of what to load and how to load it.
///
/// ```
/// use addressable::res::location::Location;
///
/// let tex = Location::new("crate", "res:textures/crate.png", "BytesProvider");
/// let mat = Location::new("material", "res:crate.mat", "JsonProvider")
///     .with_dependencies(vec![tex]);
///
/// assert_eq!(mat.dependencies.len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub key: LocationKey,
    /// The identifier a provider uses to find the data, usually a path or URL.
    pub internal_id: String,
    /// The id of the provider which should load this location.
    pub provider_id: String,
    #[serde(default)]
    pub dependencies: Vec<Location>,
}

impl Location {
    pub fn new<T1, T2, T3>(key: T1, internal_id: T2, provider_id: T3) -> Self
    where
        T1: Into<LocationKey>,
        T2: Into<String>,
        T3: Into<String>,
    {
        Location {
            key: key.into(),
            internal_id: internal_id.into(),
            provider_id: provider_id.into(),
            dependencies: Vec::new(),
        }
    }

    #[inline]
    pub fn with_dependencies(mut self, dependencies: Vec<Location>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Parses a location (with its dependencies) from JSON.
    pub fn from_json(json: &str) -> Result<Location> {
        Ok(serde_json::from_str(json)?)
    }

    /// Parses a list of locations from JSON.
    pub fn list_from_json(json: &str) -> Result<Vec<Location>> {
        Ok(serde_json::from_str(json)?)
    }

    /// Hashes the location and the requested result type into a cache key.
    /// The primary key is left out, so aliases of the same data share one
    /// operation.
    pub fn hash(&self, ty: ResultType) -> u64 {
        let mut s = FxHasher::default();
        self.internal_id.hash(&mut s);
        self.provider_id.hash(&mut s);
        ty.id().hash(&mut s);
        s.finish()
    }

    /// Hashes the dependency list of this location.
    pub fn dependency_hash(&self, ty: ResultType) -> u64 {
        dependencies_hash(&self.dependencies, ty)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.internal_id)
    }
}

/// Hashes a list of locations in order.
pub fn dependencies_hash(locations: &[Location], ty: ResultType) -> u64 {
    let hashes: Vec<u64> = locations.iter().map(|v| v.hash(ty)).collect();
    hash(&hashes)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn aliases_share_hash() {
        let l1 = Location::new("a", "res:a.bin", "BytesProvider");
        let l2 = Location::new("alias", "res:a.bin", "BytesProvider");
        let l3 = Location::new("a", "res:b.bin", "BytesProvider");

        let ty = ResultType::of::<Vec<u8>>();
        assert_eq!(l1.hash(ty), l2.hash(ty));
        assert_ne!(l1.hash(ty), l3.hash(ty));
        assert_ne!(l1.hash(ty), l1.hash(ResultType::of::<String>()));
    }

    #[test]
    fn json() {
        let json = r#"{
            "key": { "Name": "material" },
            "internal_id": "res:crate.mat",
            "provider_id": "JsonProvider",
            "dependencies": [
                {
                    "key": { "Name": "texture" },
                    "internal_id": "res:crate.png",
                    "provider_id": "BytesProvider"
                }
            ]
        }"#;

        let location = Location::from_json(json).unwrap();
        assert_eq!(location.key, LocationKey::from("material"));
        assert_eq!(location.dependencies.len(), 1);
        assert!(location.dependencies[0].dependencies.is_empty());
        assert_eq!(format!("{}", location.dependencies[0]), "res:crate.png");

        assert!(Location::from_json("{").is_err());
    }
}
