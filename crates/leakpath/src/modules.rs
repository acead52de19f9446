//! Loaded modules and the exclusion policy applied to allocations made from them.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::callstack::SymbolResolver;
use crate::error::Error;

/// Lookups treat a code address as the window `[address, address + MODULE_WINDOW]` and
/// match the first module range overlapping it.
pub const MODULE_WINDOW: usize = 1024;

/// A module as reported by a [`ModuleEnumerator`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadedModule {
    pub base: usize,
    pub size: usize,
    pub path: PathBuf,
    /// Whether the module links against the detector and therefore wants its allocations
    /// tracked by default.
    pub imports_detector: bool,
}

impl LoadedModule {
    /// Lowercased file name, the form used for matching against the forced module list.
    pub fn name(&self) -> String {
        module_name(&self.path)
    }
}

fn module_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Produces the current list of loaded modules.
pub trait ModuleEnumerator: Send + Sync {
    fn loaded_modules(&self) -> Vec<LoadedModule>;
}

/// Installs and removes interception of allocation functions in a module.
pub trait Interceptor: Send + Sync {
    fn attach(&self, module: &LoadedModule) -> Result<(), Error>;
    fn detach(&self, module: &LoadedModule);
}

/// Interceptor for hosts whose hooks are wired up statically, such as the global allocator.
pub struct NoopInterceptor;

impl Interceptor for NoopInterceptor {
    fn attach(&self, _module: &LoadedModule) -> Result<(), Error> {
        Ok(())
    }

    fn detach(&self, _module: &LoadedModule) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleListMode {
    /// Listed modules are tracked even though they do not import the detector.
    Include,
    /// Listed modules are never tracked.
    #[default]
    Exclude,
}

/// Forced include or exclude list, stored lowercased.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleList {
    pub modules: Vec<String>,
    pub mode: ModuleListMode,
}

impl ModuleList {
    pub fn new<I, S>(modules: I, mode: ModuleListMode) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            modules: modules
                .into_iter()
                .map(|m| m.as_ref().trim().to_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
            mode,
        }
    }

    /// Parses a comma or space separated list. `*` stands for no modules.
    pub fn parse(list: &str, mode: ModuleListMode) -> Self {
        let modules = list
            .split([',', ' ', ';'])
            .filter(|m| *m != "*")
            .collect::<Vec<_>>();
        Self::new(modules, mode)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.iter().any(|m| m == name)
    }

    pub fn is_include(&self) -> bool {
        self.mode == ModuleListMode::Include
    }

    /// Whether a module that does not import the detector gets excluded.
    fn excludes(&self, name: &str) -> bool {
        match self.mode {
            ModuleListMode::Include => !self.contains(name),
            ModuleListMode::Exclude => self.contains(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleInfo {
    pub low: usize,
    pub high: usize,
    pub name: String,
    pub path: PathBuf,
    pub excluded: bool,
    pub symbols_loaded: bool,
    pub attached: bool,
}

impl ModuleInfo {
    fn overlaps(&self, low: usize, high: usize) -> bool {
        self.low <= high && low <= self.high
    }

    fn contains(&self, address: usize) -> bool {
        self.low <= address && address <= self.high
    }
}

/// Result of merging a fresh module enumeration into the table.
#[derive(Debug, Default)]
pub struct RefreshOutcome {
    /// Modules seen for the first time and not excluded.
    pub attached: Vec<LoadedModule>,
    /// Modules that disappeared since the last refresh.
    pub detached: Vec<ModuleInfo>,
}

#[derive(Debug, Default)]
pub struct ModuleTable {
    modules: Vec<ModuleInfo>,
}

impl ModuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleInfo> {
        self.modules.iter()
    }

    /// Replaces the table with `loaded`, keeping the flags of modules already known.
    ///
    /// New modules that do not import the detector are excluded according to `forced`.
    /// Symbols are loaded for every new module; an included module without symbols
    /// gets a warning because its leaks will show raw addresses only.
    pub fn refresh(
        &mut self,
        loaded: Vec<LoadedModule>,
        forced: &ModuleList,
        resolver: &dyn SymbolResolver,
    ) -> RefreshOutcome {
        let mut outcome = RefreshOutcome::default();
        let mut next = Vec::with_capacity(loaded.len());

        for module in loaded {
            let low = module.base;
            let high = module.base + module.size.saturating_sub(1);
            if let Some(known) = self
                .modules
                .iter()
                .find(|m| m.low == low && m.high == high)
            {
                next.push(known.clone());
                continue;
            }

            let name = module.name();
            let excluded = !module.imports_detector && forced.excludes(&name);
            let symbols_loaded = resolver.load_module_symbols(&module);
            if !excluded && !symbols_loaded {
                warn!(
                    module = %name,
                    "module included in leak detection has no debug symbols, leaks will show raw addresses"
                );
            }
            next.push(ModuleInfo {
                low,
                high,
                name,
                path: module.path.clone(),
                excluded,
                symbols_loaded,
                attached: !excluded,
            });
            if !excluded {
                outcome.attached.push(module);
            }
        }

        let old = std::mem::replace(&mut self.modules, next);
        outcome.detached = old
            .into_iter()
            .filter(|m| !self.modules.iter().any(|n| n.low == m.low && n.high == m.high))
            .collect();
        self.modules.sort_by_key(|m| m.low);
        outcome
    }

    /// Module whose range contains `address`.
    pub fn containing(&self, address: usize) -> Option<&ModuleInfo> {
        self.modules.iter().find(|m| m.contains(address))
    }

    /// Window lookup used for exclusion: the first module overlapping
    /// `[address, address + MODULE_WINDOW]`.
    pub fn lookup_window(&self, address: usize) -> Option<&ModuleInfo> {
        let high = address.saturating_add(MODULE_WINDOW);
        self.modules.iter().find(|m| m.overlaps(address, high))
    }

    pub fn is_module_excluded(&self, address: usize) -> bool {
        self.lookup_window(address).is_some_and(|m| m.excluded)
    }

    /// Whether an allocation whose caller returns to `return_address` must not be
    /// registered. Unknown callers are tracked.
    pub fn is_caller_excluded(&self, return_address: usize) -> bool {
        if return_address == 0 {
            return false;
        }
        match self.containing(return_address) {
            Some(module) => self.is_module_excluded(module.low),
            None => false,
        }
    }

    /// Flips the excluded flag of the module whose base equals `base`. Returns `false` if
    /// no such module is known.
    pub fn set_excluded(&mut self, base: usize, excluded: bool) -> bool {
        match self.modules.iter_mut().find(|m| m.low == base) {
            Some(module) => {
                module.excluded = excluded;
                true
            }
            None => false,
        }
    }

    /// Records whether interception is installed in the module based at `base`.
    pub fn set_attached(&mut self, base: usize, attached: bool) {
        if let Some(module) = self.modules.iter_mut().find(|m| m.low == base) {
            module.attached = attached;
        }
    }

    pub fn attached(&self) -> impl Iterator<Item = &ModuleInfo> {
        self.modules.iter().filter(|m| m.attached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callstack::NullResolver;

    fn module(base: usize, size: usize, name: &str, imports: bool) -> LoadedModule {
        LoadedModule {
            base,
            size,
            path: PathBuf::from(format!("/opt/app/{name}")),
            imports_detector: imports,
        }
    }

    fn table(forced: &ModuleList) -> ModuleTable {
        let mut table = ModuleTable::new();
        table.refresh(
            vec![
                module(0x10000, 0x1000, "app", true),
                module(0x20000, 0x1000, "libplugin.so", false),
                module(0x30000, 0x1000, "libc.so.6", false),
            ],
            forced,
            &NullResolver,
        );
        table
    }

    #[test]
    fn exclude_mode_excludes_only_listed_modules() {
        let forced = ModuleList::parse("libc.so.6", ModuleListMode::Exclude);
        let table = table(&forced);
        assert!(!table.is_caller_excluded(0x10010));
        assert!(!table.is_caller_excluded(0x20010));
        assert!(table.is_caller_excluded(0x30010));
    }

    #[test]
    fn include_mode_excludes_unlisted_non_importers() {
        let forced = ModuleList::parse("LIBPLUGIN.so", ModuleListMode::Include);
        let table = table(&forced);
        assert!(!table.is_caller_excluded(0x10010));
        assert!(!table.is_caller_excluded(0x20010));
        assert!(table.is_caller_excluded(0x30010));
    }

    #[test]
    fn star_means_no_modules() {
        let list = ModuleList::parse("*", ModuleListMode::Include);
        assert!(list.modules.is_empty());
    }

    #[test]
    fn unknown_callers_are_tracked() {
        let table = table(&ModuleList::default());
        assert!(!table.is_caller_excluded(0));
        assert!(!table.is_caller_excluded(0x90000));
    }

    #[test]
    fn window_lookup_matches_a_module_just_above_the_address() {
        let table = table(&ModuleList::parse("libc.so.6", ModuleListMode::Exclude));
        // 0x2FD00 lies below libc but its window reaches into it
        assert!(table.is_module_excluded(0x2FD00));
        assert_eq!(table.lookup_window(0x2FD00).unwrap().name, "libc.so.6");
        assert!(table.containing(0x2FD00).is_none());
    }

    #[test]
    fn toggling_a_module() {
        let mut table = table(&ModuleList::default());
        assert!(table.set_excluded(0x10000, true));
        assert!(table.is_caller_excluded(0x10010));
        assert!(table.set_excluded(0x10000, false));
        assert!(!table.is_caller_excluded(0x10010));
        assert!(!table.set_excluded(0x12345, true));
    }

    #[test]
    fn refresh_keeps_known_flags_and_reports_changes() {
        let mut table = table(&ModuleList::default());
        table.set_excluded(0x10000, true);

        let outcome = table.refresh(
            vec![
                module(0x10000, 0x1000, "app", true),
                module(0x40000, 0x1000, "libnew.so", false),
            ],
            &ModuleList::default(),
            &NullResolver,
        );
        assert!(table.is_caller_excluded(0x10010));
        assert_eq!(outcome.attached.len(), 1);
        assert_eq!(outcome.attached[0].base, 0x40000);
        assert_eq!(outcome.detached.len(), 2);
        assert_eq!(table.len(), 2);
    }
}
