//! Class resolution: turns fully qualified class names into loaded
//! [`Class`] instances by probing an ordered list of directory roots.
use crate::jvm::{read_class_file, JVMParser, ParseError};
use crate::program::Class;
use crate::runtime::{Result, RuntimeError};

use log::{debug, warn};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Suffix of compiled class files.
pub const CLASS_FILE_SUFFIX: &str = "class";

/// Ordered list of directory roots. The first root holding a class wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classpath {
    roots: Vec<PathBuf>,
}

impl Classpath {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    /// Split a platform path list (`a:b` on Unix, `a;b` on Windows).
    pub fn parse<S: AsRef<OsStr> + ?Sized>(paths: &S) -> Self {
        std::env::split_paths(paths)
            .filter(|root| !root.as_os_str().is_empty())
            .collect()
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

impl FromIterator<PathBuf> for Classpath {
    fn from_iter<I: IntoIterator<Item = PathBuf>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Converts `com.example.Main` to the internal form `com/example/Main`.
pub fn internal_name(name: &str) -> String {
    name.replace('.', "/")
}

/// Path of the class file for `name` (internal form) under `root`.
pub fn class_file_path(root: &Path, name: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    let mut segments = name.split('/').peekable();
    while let Some(segment) = segments.next() {
        if segments.peek().is_some() {
            path.push(segment);
        } else {
            path.push(format!("{segment}.{CLASS_FILE_SUFFIX}"));
        }
    }
    path
}

/// Why a single classpath root did not yield the requested class.
#[derive(Debug, thiserror::Error)]
enum LoadFailure {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Parse(#[from] ParseError),
    #[error("{0}")]
    Class(#[from] RuntimeError),
    #[error("file declares class {0}")]
    NameMismatch(String),
}

/// `ClassLoader` resolves classes against a [`Classpath`] and caches every
/// loaded class by name for its own lifetime.
///
/// The cache guarantees a single [`Class`] instance per name, so frames
/// created from different call sites share the same constant pool.
#[derive(Debug, Default)]
pub struct ClassLoader {
    classpath: Classpath,
    cache: HashMap<String, Rc<Class>>,
}

impl ClassLoader {
    pub fn new(classpath: Classpath) -> Self {
        Self {
            classpath,
            cache: HashMap::new(),
        }
    }

    pub fn classpath(&self) -> &Classpath {
        &self.classpath
    }

    /// Returns the class named `name`, loading it on first use. Names may
    /// use dots or slashes as package separators.
    pub fn resolve(&mut self, name: &str) -> Result<Rc<Class>> {
        let name = internal_name(name);
        self.search(&name)
            .map_err(|misses| RuntimeError::ClassNotFound {
                reason: misses.reason(),
                name,
            })
    }

    /// Like [`resolve`](Self::resolve), but a class with no file under any
    /// root is `Ok(None)`. A file that exists and fails to load is still
    /// `ClassNotFound`, carrying the cause.
    pub fn try_resolve(&mut self, name: &str) -> Result<Option<Rc<Class>>> {
        let name = internal_name(name);
        match self.search(&name) {
            Ok(class) => Ok(Some(class)),
            Err(misses) if misses.all_absent => Ok(None),
            Err(misses) => Err(RuntimeError::ClassNotFound {
                reason: misses.reason(),
                name,
            }),
        }
    }

    fn search(&mut self, name: &str) -> std::result::Result<Rc<Class>, Misses> {
        if let Some(class) = self.cache.get(name) {
            return Ok(Rc::clone(class));
        }

        let mut misses = Misses {
            causes: Vec::new(),
            all_absent: true,
        };
        for root in self.classpath.roots() {
            let path = class_file_path(root, name);
            match load(&path, name) {
                Ok(class) => {
                    debug!("loaded {} from {}", name, path.display());
                    let class = Rc::new(class);
                    self.cache.insert(name.to_string(), Rc::clone(&class));
                    return Ok(class);
                }
                Err(LoadFailure::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
                    debug!("{} not found under {}", name, root.display());
                    misses.causes.push(format!("{}: {err}", path.display()));
                }
                Err(err) => {
                    warn!("skipping {}: {err}", path.display());
                    misses.causes.push(format!("{}: {err}", path.display()));
                    misses.all_absent = false;
                }
            }
        }
        Err(misses)
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.cache.contains_key(&internal_name(name))
    }

    pub fn loaded_count(&self) -> usize {
        self.cache.len()
    }
}

/// Per-root causes of a failed search.
struct Misses {
    causes: Vec<String>,
    all_absent: bool,
}

impl Misses {
    fn reason(&self) -> String {
        if self.causes.is_empty() {
            "classpath is empty".to_string()
        } else {
            self.causes.join("; ")
        }
    }
}

fn load(path: &Path, name: &str) -> std::result::Result<Class, LoadFailure> {
    let bytes = read_class_file(path)?;
    let class_file = JVMParser::parse(&bytes)?;
    let class = Class::new(&class_file)?;
    if class.name() != name {
        return Err(LoadFailure::NameMismatch(class.name().to_string()));
    }
    Ok(class)
}
