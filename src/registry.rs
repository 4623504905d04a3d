//! Capability registry: the allow-lists currently in force.
//!
//! Readers take the current [Capabilities] snapshot and keep using it for as
//! long as they like. Reloads build a complete new snapshot first and swap it in
//! only when everything resolved, so nobody ever sees half of a reload.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::allowlist::{AllowListSource, Entry};
use crate::host::{self, Callable, Module};

#[derive(Debug, thiserror::Error)]
pub enum ConfigParseError {
    #[error("{origin}: {error}")]
    Io {
        origin: String,
        #[source]
        error: std::io::Error,
    },

    #[error("{origin}: invalid YAML: {error}")]
    Yaml {
        origin: String,
        #[source]
        error: yaml_rust2::ScanError,
    },

    #[error("{origin}:{line}: expected a sequence of names")]
    NotASequence { origin: String, line: usize },

    #[error("{origin}:{line}: `{entry}` is not a valid name")]
    InvalidEntry {
        origin: String,
        line: usize,
        entry: String,
    },

    #[error("{origin}:{line}: `{name}` is already listed on line {first_line}")]
    Duplicate {
        origin: String,
        line: usize,
        first_line: usize,
        name: String,
    },

    #[error("{origin}:{line}: `{name}` is not a builtin function or type of this host")]
    UnknownBuiltin {
        origin: String,
        line: usize,
        name: String,
    },

    #[error("{origin}:{line}: `{name}` is not a module of this host")]
    UnknownModule {
        origin: String,
        line: usize,
        name: String,
    },

    #[error("{origin}: {message}")]
    Config { origin: String, message: String },
}

/// A module was requested that the import allow-list does not contain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("import of module `{module}` is not allowed")]
pub struct ImportNotAllowed {
    pub module: String,
}

/// Immutable snapshot of the allow-lists.
#[derive(Debug, Default)]
pub struct Capabilities {
    symbols: BTreeMap<String, &'static Callable>,
    modules: BTreeMap<String, &'static Module>,
}

impl Capabilities {
    /// Resolve both lists against the host. Fails on the first name the host does not provide.
    pub fn resolve(
        builtins: (&str, &[Entry]),
        imports: (&str, &[Entry]),
    ) -> Result<Self, ConfigParseError> {
        Ok(Self {
            symbols: resolve_symbols(builtins.0, builtins.1)?,
            modules: resolve_modules(imports.0, imports.1)?,
        })
    }

    pub fn symbol(&self, name: &str) -> Option<&'static Callable> {
        self.symbols.get(name).copied()
    }

    /// The only way formulas get hold of a module.
    pub fn resolve_import(&self, module: &str) -> Result<&'static Module, ImportNotAllowed> {
        self.modules.get(module).copied().ok_or_else(|| ImportNotAllowed {
            module: module.to_string(),
        })
    }

    pub fn builtin_names(&self) -> Vec<String> {
        self.symbols.keys().cloned().collect()
    }

    pub fn import_names(&self) -> Vec<String> {
        self.modules.keys().cloned().collect()
    }
}

fn resolve_symbols(
    origin: &str,
    entries: &[Entry],
) -> Result<BTreeMap<String, &'static Callable>, ConfigParseError> {
    entries
        .iter()
        .map(|entry| match host::builtin(&entry.name) {
            Some(callable) => Ok((entry.name.clone(), callable)),
            None => Err(ConfigParseError::UnknownBuiltin {
                origin: origin.to_string(),
                line: entry.line,
                name: entry.name.clone(),
            }),
        })
        .collect()
}

fn resolve_modules(
    origin: &str,
    entries: &[Entry],
) -> Result<BTreeMap<String, &'static Module>, ConfigParseError> {
    entries
        .iter()
        .map(|entry| match host::module(&entry.name) {
            Some(module) => Ok((entry.name.clone(), module)),
            None => Err(ConfigParseError::UnknownModule {
                origin: origin.to_string(),
                line: entry.line,
                name: entry.name.clone(),
            }),
        })
        .collect()
}

/// Process-wide holder of the current [Capabilities].
pub struct Registry {
    builtins: AllowListSource,
    imports: AllowListSource,
    current: RwLock<Arc<Capabilities>>,
    /// Serializes reloads, so two of them never interleave their reads and swaps.
    reload: Mutex<()>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("builtins", &self.builtins)
            .field("imports", &self.imports)
            .field("current", &*self.current.read())
            .finish()
    }
}

impl Registry {
    /// Build a snapshot from both sources without installing it anywhere.
    pub fn load(
        builtins: &AllowListSource,
        imports: &AllowListSource,
    ) -> Result<Capabilities, ConfigParseError> {
        let builtin_entries = builtins.read()?;
        let import_entries = imports.read()?;
        Capabilities::resolve(
            (builtins.origin().as_str(), builtin_entries.as_slice()),
            (imports.origin().as_str(), import_entries.as_slice()),
        )
    }

    /// Load both sources and keep them for later reloads.
    pub fn open(builtins: AllowListSource, imports: AllowListSource) -> Result<Self, ConfigParseError> {
        let capabilities = Self::load(&builtins, &imports)?;
        log::debug!(
            "allow-lists loaded: {} builtins, {} imports",
            capabilities.symbols.len(),
            capabilities.modules.len()
        );
        Ok(Self {
            builtins,
            imports,
            current: RwLock::new(Arc::new(capabilities)),
            reload: Mutex::new(()),
        })
    }

    /// Active snapshot. The lock is held only for the `Arc` clone.
    pub fn current(&self) -> Arc<Capabilities> {
        Arc::clone(&self.current.read())
    }

    /// Reload both lists. On failure the previous snapshot stays active.
    pub fn reload(&self) -> Result<Arc<Capabilities>, ConfigParseError> {
        let _guard = self.reload.lock();
        let capabilities = Self::load(&self.builtins, &self.imports)?;
        Ok(self.install(capabilities))
    }

    /// Reload the builtin list, keeping the imports of the active snapshot.
    pub fn reload_builtins(&self) -> Result<Arc<Capabilities>, ConfigParseError> {
        let _guard = self.reload.lock();
        let entries = self.builtins.read()?;
        let symbols = resolve_symbols(&self.builtins.origin(), &entries)?;
        let modules = self.current().modules.clone();
        Ok(self.install(Capabilities { symbols, modules }))
    }

    /// Reload the import list, keeping the builtins of the active snapshot.
    pub fn reload_imports(&self) -> Result<Arc<Capabilities>, ConfigParseError> {
        let _guard = self.reload.lock();
        let entries = self.imports.read()?;
        let modules = resolve_modules(&self.imports.origin(), &entries)?;
        let symbols = self.current().symbols.clone();
        Ok(self.install(Capabilities { symbols, modules }))
    }

    fn install(&self, capabilities: Capabilities) -> Arc<Capabilities> {
        let capabilities = Arc::new(capabilities);
        *self.current.write() = Arc::clone(&capabilities);
        log::info!(
            "allow-lists reloaded: builtins {:?}, imports {:?}",
            capabilities.builtin_names(),
            capabilities.import_names()
        );
        capabilities
    }
}
