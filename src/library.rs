//! Macro library.
//!
//! Named macros, loaded from a directory (`<name>.macro` for native macros,
//! `<name>.script` for embedded scripts) or inserted in memory. Names are
//! case-insensitive and unique. Each entry is parsed on first use and the
//! result is shared from then on.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

use crate::config::{ConfigError, CraftLoopConfig};
use crate::engine;
use crate::error::ParseError;
use crate::parser::MacroScript;
use crate::script::{ScriptError, Stmt};

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("cannot read macro library {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no macro named {0:?}")]
    NotFound(String),

    #[error("macro {0:?} is defined more than once")]
    Duplicate(String),

    #[error("{0:?} is a script, not a native macro")]
    NotNative(String),

    #[error("macro {name:?}: {source}")]
    Parse {
        name: String,
        #[source]
        source: ParseError,
    },

    #[error("script {name:?}: {source}")]
    Script {
        name: String,
        #[source]
        source: ScriptError,
    },

    #[error("craft loop for {name:?}: {source}")]
    CraftLoop {
        name: String,
        #[source]
        source: ConfigError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroKind {
    Native,
    Script,
}

impl MacroKind {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "macro" => Some(MacroKind::Native),
            "script" => Some(MacroKind::Script),
            _ => None,
        }
    }

    /// Kind of a file by its extension; anything that is not `.script` is native.
    pub fn of_path(path: &Path) -> Self {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
            .unwrap_or(MacroKind::Native)
    }
}

/// A parsed library entry, ready to run.
#[derive(Debug, Clone)]
pub enum MacroSource {
    Native(Arc<MacroScript>),
    Script(Arc<Vec<Stmt>>),
}

#[derive(Debug)]
struct Entry {
    name: String,
    kind: MacroKind,
    text: String,
    parsed: Option<MacroSource>,
}

#[derive(Debug, Default)]
pub struct MacroLibrary {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MacroLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_dir(dir: &Path) -> Result<Self, LibraryError> {
        let io = |source| LibraryError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let lib = Self::new();
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(io)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        paths.sort();

        for path in paths {
            let Some(kind) = path
                .extension()
                .and_then(|e| e.to_str())
                .and_then(MacroKind::from_extension)
            else {
                continue;
            };
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let text = fs::read_to_string(&path).map_err(|source| LibraryError::Io {
                path: path.clone(),
                source,
            })?;
            lib.insert(name, kind, text)?;
        }

        tracing::info!(dir = %dir.display(), macros = lib.len(), "macro library loaded");
        Ok(lib)
    }

    pub fn insert(
        &self,
        name: &str,
        kind: MacroKind,
        text: impl Into<String>,
    ) -> Result<(), LibraryError> {
        let key = key(name);
        let mut entries = self.entries();
        if entries.contains_key(&key) {
            return Err(LibraryError::Duplicate(name.to_string()));
        }
        entries.insert(
            key,
            Entry {
                name: name.trim().to_string(),
                kind,
                text: text.into(),
                parsed: None,
            },
        );
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries().contains_key(&key(name))
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Display names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries().values().map(|e| e.name.clone()).collect();
        names.sort_by_key(|n| n.to_lowercase());
        names
    }

    /// The parsed entry, parsing and caching it on first use.
    pub fn get(&self, name: &str) -> Result<MacroSource, LibraryError> {
        let mut entries = self.entries();
        let entry = entries
            .get_mut(&key(name))
            .ok_or_else(|| LibraryError::NotFound(name.to_string()))?;

        if let Some(parsed) = &entry.parsed {
            return Ok(parsed.clone());
        }

        let parsed = match entry.kind {
            MacroKind::Native => engine::parse_macro(&entry.text)
                .map(|s| MacroSource::Native(Arc::new(s)))
                .map_err(|source| LibraryError::Parse {
                    name: entry.name.clone(),
                    source,
                })?,
            MacroKind::Script => engine::compile_script(&entry.text)
                .map(|p| MacroSource::Script(Arc::new(p)))
                .map_err(|source| LibraryError::Script {
                    name: entry.name.clone(),
                    source,
                })?,
        };
        tracing::debug!(name = %entry.name, "parsed and cached");
        entry.parsed = Some(parsed.clone());
        Ok(parsed)
    }

    /// A native macro, for `/runmacro`.
    pub fn native(&self, name: &str) -> Result<Arc<MacroScript>, LibraryError> {
        match self.get(name)? {
            MacroSource::Native(script) => Ok(script),
            MacroSource::Script(_) => Err(LibraryError::NotNative(name.to_string())),
        }
    }

    /// A native macro wrapped into a crafting loop. Not cached.
    pub fn craft_loop(
        &self,
        name: &str,
        count: Option<u32>,
        cfg: &CraftLoopConfig,
    ) -> Result<Arc<MacroScript>, LibraryError> {
        let (display, text) = {
            let entries = self.entries();
            let entry = entries
                .get(&key(name))
                .ok_or_else(|| LibraryError::NotFound(name.to_string()))?;
            if entry.kind != MacroKind::Native {
                return Err(LibraryError::NotNative(entry.name.clone()));
            }
            (entry.name.clone(), entry.text.clone())
        };
        let source = engine::craft_loop(&text, count, cfg).map_err(|source| {
            LibraryError::CraftLoop {
                name: display.clone(),
                source,
            }
        })?;
        let script = engine::parse_macro(&source).map_err(|source| LibraryError::Parse {
            name: display,
            source,
        })?;
        Ok(Arc::new(script))
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn key(name: &str) -> String {
    name.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_case_insensitive_and_unique() {
        let lib = MacroLibrary::new();
        lib.insert("Quick Synth", MacroKind::Native, "/ac Observe").unwrap();
        assert!(lib.contains("quick synth"));
        assert!(matches!(
            lib.insert("QUICK SYNTH", MacroKind::Native, "/wait 1"),
            Err(LibraryError::Duplicate(_))
        ));
        assert!(matches!(lib.get("nope"), Err(LibraryError::NotFound(_))));
    }

    #[test]
    fn parses_are_cached() {
        let lib = MacroLibrary::new();
        lib.insert("a", MacroKind::Native, "/ac Observe\n/loop 2").unwrap();
        let first = lib.native("A").unwrap();
        let second = lib.native("a").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn runmacro_lookup_rejects_scripts() {
        let lib = MacroLibrary::new();
        lib.insert("s", MacroKind::Script, "yield \"/wait 1\"").unwrap();
        assert!(matches!(lib.get("s"), Ok(MacroSource::Script(_))));
        assert!(matches!(lib.native("s"), Err(LibraryError::NotNative(_))));
    }

    #[test]
    fn craft_loops_wrap_native_macros() {
        let lib = MacroLibrary::new();
        lib.insert("Synth", MacroKind::Native, "/ac Observe").unwrap();
        lib.insert("s", MacroKind::Script, "log \"hi\"").unwrap();
        let cfg = CraftLoopConfig::default();

        let script = lib.craft_loop("synth", Some(2), &cfg).unwrap();
        assert_eq!(script.len(), 6);
        assert_eq!(script.steps()[0].to_string(), "/craft 2");
        // The plain entry is untouched.
        assert_eq!(lib.native("synth").unwrap().len(), 1);

        assert!(matches!(
            lib.craft_loop("s", Some(2), &cfg),
            Err(LibraryError::NotNative(_))
        ));
        let broken = CraftLoopConfig {
            use_template: true,
            template: "/loop".into(),
            ..cfg
        };
        assert!(matches!(
            lib.craft_loop("synth", Some(2), &broken),
            Err(LibraryError::CraftLoop { .. })
        ));
    }

    #[test]
    fn parse_errors_name_the_macro() {
        let lib = MacroLibrary::new();
        lib.insert("broken", MacroKind::Native, "/ac \"Observe").unwrap();
        let err = lib.get("broken").unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn loads_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Synth.macro"), "/ac Observe\r\n").unwrap();
        fs::write(dir.path().join("helper.script"), "log \"hi\"").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let lib = MacroLibrary::from_dir(dir.path()).unwrap();
        assert_eq!(lib.names(), vec!["helper", "Synth"]);
        assert_eq!(lib.native("synth").unwrap().len(), 1);
    }

    #[test]
    fn missing_directory_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = MacroLibrary::from_dir(&dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, LibraryError::Io { .. }));
    }
}
