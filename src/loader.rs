//! Discovery and loading of marshaling (proxy/stub) modules.
//!
//! A marshaling module is a shared library exporting
//! `comrpc_register_marshalers`; loading one registers its proxy
//! factories into the owning [`ProxyRegistry`]. The cache is scoped to the
//! loader instance rather than a process-wide singleton so independent
//! instances can be tested in isolation; in a process there is normally
//! one loader per registry.
//!
//! Load failures are logged and skipped: the interface a broken module
//! would have supported simply stays unavailable. Nothing is ever
//! unloaded; handles live as long as the loader.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use libloading::Library;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::registry::ProxyRegistry;

/// Symbol a marshaling module must export to register its factories.
pub const REGISTER_SYMBOL: &[u8] = b"comrpc_register_marshalers";

type RegisterFn = unsafe extern "C" fn(*const ProxyRegistry);

enum ModuleSlot {
    Loaded(#[allow(dead_code)] Library),
    Failed,
}

/// Deduplicated loader of marshaling modules for one registry.
pub struct ProxyStubLoader {
    registry: Arc<ProxyRegistry>,
    // Keyed by file name; an entry, loaded or failed, is never retried.
    modules: Mutex<HashMap<String, ModuleSlot>>,
    attempts: AtomicUsize,
    loaded: AtomicUsize,
}

impl ProxyStubLoader {
    pub fn new(registry: Arc<ProxyRegistry>) -> Self {
        Self {
            registry,
            modules: Mutex::new(HashMap::new()),
            attempts: AtomicUsize::new(0),
            loaded: AtomicUsize::new(0),
        }
    }

    /// Scan `directory` for shared modules and load every one not already
    /// in the cache. Returns the number of modules newly loaded.
    ///
    /// Matching is by the platform shared-module extension. Repeat calls
    /// are no-ops for names already attempted, successful or not.
    pub fn load_all(&self, directory: &Path) -> usize {
        let entries = match std::fs::read_dir(directory) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %directory.display(), error = %e, "proxy-stub directory unreadable");
                return 0;
            }
        };

        let mut newly_loaded = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(std::env::consts::DLL_EXTENSION) {
                continue;
            }
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };

            let mut modules = self.modules.lock();
            if modules.contains_key(&name) {
                continue;
            }

            // Membership check and insertion stay under one lock so
            // concurrent loaders cannot double-load a module.
            self.attempts.fetch_add(1, Ordering::SeqCst);
            match self.try_load(&path) {
                Ok(library) => {
                    info!(module = %name, "marshaling module loaded");
                    modules.insert(name, ModuleSlot::Loaded(library));
                    self.loaded.fetch_add(1, Ordering::SeqCst);
                    newly_loaded += 1;
                }
                Err(e) => {
                    debug!(module = %name, error = %e, "marshaling module skipped");
                    modules.insert(name, ModuleSlot::Failed);
                }
            }
        }
        newly_loaded
    }

    fn try_load(&self, path: &Path) -> Result<Library, libloading::Error> {
        // SAFETY: loading an arbitrary shared module runs its initializers.
        // Modules come from the configured proxy-stub directory, which the
        // embedder controls.
        let library = unsafe { Library::new(path)? };

        // SAFETY: the symbol contract is fixed by REGISTER_SYMBOL; a module
        // exporting it under a different signature is malformed and outside
        // what this loader can defend against.
        match unsafe { library.get::<RegisterFn>(REGISTER_SYMBOL) } {
            Ok(register) => unsafe { register(Arc::as_ptr(&self.registry)) },
            // A module without the symbol is kept loaded; it may register
            // through its own initializers.
            Err(e) => debug!(path = %path.display(), error = %e, "no register symbol"),
        }
        Ok(library)
    }

    /// Total load attempts across all `load_all` calls.
    pub fn attempt_count(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Modules successfully loaded and still cached.
    pub fn loaded_count(&self) -> usize {
        self.loaded.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> &Arc<ProxyRegistry> {
        &self.registry
    }
}
