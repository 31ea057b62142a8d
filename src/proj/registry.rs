use super::Projection;
use crate::core::geo::{LatLng, Point};
use crate::prelude::HashMap;
use crate::{MapError, Result};
use std::sync::{Arc, RwLock};

/// Opaque coordinate mapping between two projections
pub type TransformFn = Arc<dyn Fn(Point) -> Point + Send + Sync>;

pub fn identity_transform() -> TransformFn {
    Arc::new(|point| point)
}

/// Lookup table of transforms between projection codes.
///
/// Codes registered as equivalent resolve to one canonical code, and a
/// transform between two codes with the same canonical code is the identity.
pub struct ProjectionRegistry {
    aliases: RwLock<HashMap<String, String>>,
    transforms: RwLock<HashMap<(String, String), TransformFn>>,
}

impl ProjectionRegistry {
    /// Registry with nothing registered
    pub fn empty() -> Self {
        Self {
            aliases: RwLock::new(HashMap::default()),
            transforms: RwLock::new(HashMap::default()),
        }
    }

    /// Registry pre-loaded with EPSG:4326 and EPSG:3857 and their common aliases
    pub fn with_builtins() -> Self {
        let registry = Self::empty();
        registry.add_equivalent("EPSG:900913", "EPSG:3857");
        registry.add_equivalent("EPSG:102100", "EPSG:3857");
        registry.add_equivalent("EPSG:102113", "EPSG:3857");
        registry.add_equivalent("CRS:84", "EPSG:4326");
        registry.add_transform(
            "EPSG:4326",
            "EPSG:3857",
            Arc::new(|p: Point| LatLng::new(p.y, p.x).to_mercator_unclamped()),
        );
        registry.add_transform(
            "EPSG:3857",
            "EPSG:4326",
            Arc::new(|p: Point| LatLng::from_mercator(p).to_point()),
        );
        registry
    }

    /// Shared registry used when a source is not given its own
    pub fn global() -> Arc<ProjectionRegistry> {
        static GLOBAL: once_cell::sync::Lazy<Arc<ProjectionRegistry>> =
            once_cell::sync::Lazy::new(|| Arc::new(ProjectionRegistry::with_builtins()));
        GLOBAL.clone()
    }

    pub fn add_equivalent(&self, alias: &str, canonical: &str) {
        if let Ok(mut aliases) = self.aliases.write() {
            aliases.insert(alias.to_string(), canonical.to_string());
        }
    }

    pub fn add_transform(&self, source: &str, destination: &str, transform: TransformFn) {
        let key = (self.canonical(source), self.canonical(destination));
        if let Ok(mut transforms) = self.transforms.write() {
            transforms.insert(key, transform);
        }
    }

    pub fn canonical(&self, code: &str) -> String {
        self.aliases
            .read()
            .ok()
            .and_then(|aliases| aliases.get(code).cloned())
            .unwrap_or_else(|| code.to_string())
    }

    pub fn equivalent(&self, a: &Projection, b: &Projection) -> bool {
        self.canonical(a.code()) == self.canonical(b.code())
    }

    /// Transform mapping coordinates of `source` into `destination`
    pub fn get_transform(&self, source: &Projection, destination: &Projection) -> Result<TransformFn> {
        let key = (self.canonical(source.code()), self.canonical(destination.code()));
        if key.0 == key.1 {
            return Ok(identity_transform());
        }
        self.transforms
            .read()
            .ok()
            .and_then(|transforms| transforms.get(&key).cloned())
            .ok_or_else(|| MapError::MissingTransform {
                from: key.0.clone(),
                to: key.1.clone(),
            })
    }
}

impl Default for ProjectionRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for ProjectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.transforms.read().map(|t| t.len()).unwrap_or(0);
        f.debug_struct("ProjectionRegistry")
            .field("transforms", &count)
            .finish()
    }
}
