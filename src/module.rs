// File: src/module.rs
//
// Module source resolution for the Panda VM.
// Import paths use dots ("util.math"), translated to path separators before
// resolution. A pluggable hook replaces the default file loader; the default
// refuses absolute and parent-traversing paths and probes the compiled
// bytecode extension before the source extension.

use crate::errors::PandaError;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Host-provided module resolver: translated path in, bytes and the full
/// path label out. `None` means "not found".
pub type LoaderHook = Box<dyn Fn(&str) -> Option<(Vec<u8>, String)>>;

/// Extensions probed by the default loader, in order.
const EXTENSIONS: [&str; 2] = ["mpbc", "panda"];

pub struct ModuleLoader {
    hook: Option<LoaderHook>,
    search_root: PathBuf,
}

impl ModuleLoader {
    pub fn new() -> Self {
        Self {
            hook: None,
            search_root: PathBuf::from("."),
        }
    }

    /// Replace the default file loader.
    pub fn set_hook(&mut self, hook: LoaderHook) {
        self.hook = Some(hook);
    }

    /// Base directory for the default file loader.
    pub fn set_search_root(&mut self, root: impl Into<PathBuf>) {
        self.search_root = root.into();
    }

    /// Resolve a module path to (bytes, full path label).
    pub fn load(&self, path: &str) -> Result<(Vec<u8>, String), PandaError> {
        let translated = path.replace('.', "/");
        if let Some(hook) = &self.hook {
            return hook(&translated)
                .ok_or_else(|| PandaError::runtime(format!("Module not found: {}", path)));
        }
        self.load_file(path, &translated)
    }

    fn load_file(&self, original: &str, translated: &str) -> Result<(Vec<u8>, String), PandaError> {
        // Check the original spelling: dot translation would otherwise turn
        // ".." into slashes before the component walk sees it.
        if original.contains("..") {
            return Err(PandaError::runtime(format!(
                "Invalid module path '{}': parent traversal is not allowed",
                original
            )));
        }
        let relative = Path::new(translated);
        if relative.is_absolute() {
            return Err(PandaError::runtime(format!(
                "Invalid module path '{}': absolute paths are not allowed",
                original
            )));
        }
        if relative
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(PandaError::runtime(format!(
                "Invalid module path '{}': parent traversal is not allowed",
                original
            )));
        }

        for ext in EXTENSIONS {
            let candidate = self.search_root.join(format!("{}.{}", translated, ext));
            if candidate.is_file() {
                let bytes = fs::read(&candidate).map_err(|e| {
                    PandaError::runtime(format!(
                        "Failed to read module '{}': {}",
                        candidate.display(),
                        e
                    ))
                })?;
                return Ok((bytes, candidate.display().to_string()));
            }
        }
        Err(PandaError::runtime(format!("Module not found: {}", original)))
    }
}

impl Default for ModuleLoader {
    fn default() -> Self {
        Self::new()
    }
}
