//! Template sources for `extends`, `include` and `import`.

use rustc_hash::FxHashMap;

use crate::error::LoadError;

/// Resolves a template path to its source text.
///
/// The engine calls this inline while rendering, and caches what it
/// compiles, so implementations should be cheap and side-effect free.
pub trait Loader: Send + Sync {
    fn load(&self, path: &str) -> Result<String, LoadError>;
}

/// In-memory loader backed by a path → source map.
#[derive(Debug, Clone, Default)]
pub struct MapLoader {
    templates: FxHashMap<String, String>,
}

impl MapLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, source: impl Into<String>) {
        self.templates.insert(path.into(), source.into());
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, path: impl Into<String>, source: impl Into<String>) -> Self {
        self.insert(path, source);
        self
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl<P: Into<String>, S: Into<String>> FromIterator<(P, S)> for MapLoader {
    fn from_iter<I: IntoIterator<Item = (P, S)>>(iter: I) -> Self {
        Self {
            templates: iter.into_iter().map(|(p, s)| (p.into(), s.into())).collect(),
        }
    }
}

impl Loader for MapLoader {
    fn load(&self, path: &str) -> Result<String, LoadError> {
        self.templates
            .get(path)
            .cloned()
            .ok_or_else(|| LoadError::NotFound(path.to_string()))
    }
}

/// Any `Fn(&str) -> Option<String>` works as a loader; `None` means the
/// path does not exist.
impl<F> Loader for F
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    fn load(&self, path: &str) -> Result<String, LoadError> {
        self(path).ok_or_else(|| LoadError::NotFound(path.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn map_loader_finds_and_misses() {
        let loader: MapLoader = [("a.html", "A")].into_iter().collect();
        assert_eq!(loader.load("a.html").unwrap(), "A");
        assert_eq!(loader.load("b.html"), Err(LoadError::NotFound("b.html".into())));
    }

    #[test]
    fn closures_are_loaders() {
        let loader = |path: &str| (path == "x").then(|| "X".to_string());
        assert_eq!(Loader::load(&loader, "x").unwrap(), "X");
        assert!(Loader::load(&loader, "y").is_err());
    }
}
