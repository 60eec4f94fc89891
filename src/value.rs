//! Content-hashable value handles
//!
//! A [`Value`] is the unit of data flowing between actions: a string, a file,
//! a directory, an ordered list of values, an opaque fingerprint, or a lazy
//! output whose path is bound only once the producing action's cache entry is
//! known. Values are compared by identity: two handles are the same value only
//! if one was cloned from the other.

use crate::error::{KilnError, KilnResult};
use crate::hash::ContentSource;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, RwLock};
use walkdir::WalkDir;

/// Shared, identity-compared handle to a piece of data
#[derive(Clone)]
pub struct Value {
    inner: Arc<ValueKind>,
}

/// The closed set of value kinds
#[derive(Debug)]
pub enum ValueKind {
    /// A literal string
    Str(String),
    /// A file on disk, hashed by content
    File(PathBuf),
    /// A directory on disk, hashed by its sorted file tree
    Directory(PathBuf),
    /// An ordered list, hashed as the concatenation of its members
    List(Vec<Value>),
    /// Caller-supplied bytes standing in for something that is not a file
    Fingerprint { label: String, bytes: Vec<u8> },
    /// Output of an action, bound to a path inside its cache entry
    Output(OutputSlot),
}

/// Whether a lazy output is a single file or a directory tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    File,
    Directory,
}

/// Lazily bound output location.
///
/// The executor binds the path right before the owning action runs, once per
/// execution; reading it before that fails with [`KilnError::ValueUnbound`].
#[derive(Debug)]
pub struct OutputSlot {
    name: String,
    kind: OutputKind,
    owner: OnceLock<String>,
    path: RwLock<Option<PathBuf>>,
}

impl OutputSlot {
    /// File or directory name inside the owning cache entry
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> OutputKind {
        self.kind
    }

    /// Name of the action producing this output, once registered
    pub fn owner(&self) -> Option<&str> {
        self.owner.get().map(String::as_str)
    }

    fn bound_path(&self) -> Option<PathBuf> {
        self.path
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Value {
    fn new(kind: ValueKind) -> Self {
        Self {
            inner: Arc::new(kind),
        }
    }

    /// A literal string value
    pub fn string(value: impl Into<String>) -> Self {
        Self::new(ValueKind::Str(value.into()))
    }

    /// A file whose content participates in hashing
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::new(ValueKind::File(path.into()))
    }

    /// A directory whose whole file tree participates in hashing
    pub fn directory(path: impl Into<PathBuf>) -> Self {
        Self::new(ValueKind::Directory(path.into()))
    }

    /// An ordered list of values; order changes the hash
    pub fn list(values: Vec<Value>) -> Self {
        Self::new(ValueKind::List(values))
    }

    pub fn string_list<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::list(values.into_iter().map(Self::string).collect())
    }

    pub fn file_list<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self::list(paths.into_iter().map(Self::file).collect())
    }

    /// Opaque bytes identifying something that is not on disk, such as a tool version
    pub fn fingerprint(label: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(ValueKind::Fingerprint {
            label: label.into(),
            bytes: bytes.into(),
        })
    }

    pub(crate) fn output(name: impl Into<String>, kind: OutputKind) -> Self {
        Self::new(ValueKind::Output(OutputSlot {
            name: name.into(),
            kind,
            owner: OnceLock::new(),
            path: RwLock::new(None),
        }))
    }

    pub fn kind(&self) -> &ValueKind {
        &self.inner
    }

    /// The lazy output slot, if this value is an action output
    pub fn as_output(&self) -> Option<&OutputSlot> {
        match self.kind() {
            ValueKind::Output(slot) => Some(slot),
            _ => None,
        }
    }

    /// Resolved path of a file, directory or bound output
    pub fn path(&self) -> KilnResult<PathBuf> {
        match self.kind() {
            ValueKind::File(path) | ValueKind::Directory(path) => Ok(path.clone()),
            ValueKind::Output(slot) => slot
                .bound_path()
                .ok_or_else(|| KilnError::ValueUnbound(self.to_string())),
            _ => Err(KilnError::ValueKind {
                value: self.to_string(),
                expected: "path",
            }),
        }
    }

    pub fn as_str(&self) -> KilnResult<&str> {
        match self.kind() {
            ValueKind::Str(s) => Ok(s),
            _ => Err(KilnError::ValueKind {
                value: self.to_string(),
                expected: "string",
            }),
        }
    }

    pub fn items(&self) -> KilnResult<&[Value]> {
        match self.kind() {
            ValueKind::List(values) => Ok(values),
            _ => Err(KilnError::ValueKind {
                value: self.to_string(),
                expected: "list",
            }),
        }
    }

    pub(crate) fn set_owner(&self, owner: &str) {
        if let Some(slot) = self.as_output() {
            let _ = slot.owner.set(owner.to_string());
        }
    }

    /// Bind an output to its location inside the owner's cache entry
    pub(crate) fn bind(&self, path: PathBuf) -> KilnResult<()> {
        let slot = self.as_output().ok_or_else(|| KilnError::ValueKind {
            value: self.to_string(),
            expected: "lazy output",
        })?;
        *slot
            .path
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(path);
        Ok(())
    }

    /// Ordered byte sources that make up this value's content hash.
    ///
    /// Missing files and directories contribute nothing, so a deleted output
    /// never matches a recorded hash of real content.
    pub fn content_sources(&self) -> KilnResult<Vec<ContentSource>> {
        match self.kind() {
            ValueKind::Str(s) => Ok(vec![ContentSource::Bytes(s.as_bytes().to_vec())]),
            ValueKind::Fingerprint { bytes, .. } => Ok(vec![ContentSource::Bytes(bytes.clone())]),
            ValueKind::File(path) => Ok(file_sources(path)),
            ValueKind::Directory(path) => directory_sources(path),
            ValueKind::List(values) => {
                let mut sources = Vec::new();
                for value in values {
                    sources.extend(value.content_sources()?);
                }
                Ok(sources)
            }
            ValueKind::Output(slot) => {
                let path = self.path()?;
                match slot.kind {
                    OutputKind::File => Ok(file_sources(&path)),
                    OutputKind::Directory => directory_sources(&path),
                }
            }
        }
    }
}

fn file_sources(path: &Path) -> Vec<ContentSource> {
    if path.is_file() {
        vec![ContentSource::File(path.to_path_buf())]
    } else {
        Vec::new()
    }
}

/// Every file under `root`, sorted by relative path. Each file contributes a
/// `<relative path>\0<byte length>\0` header followed by its content.
fn directory_sources(root: &Path) -> KilnResult<Vec<ContentSource>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    if root.is_file() {
        return Ok(file_sources(root));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| {
            let context = format!("walking directory {}", root.display());
            match e.into_io_error() {
                Some(io) => KilnError::io(context, io),
                None => KilnError::Internal(format!("{}: filesystem loop", context)),
            }
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let len = std::fs::metadata(entry.path())
            .map_err(|e| KilnError::io(format!("reading metadata of {}", entry.path().display()), e))?
            .len();
        files.push((relative, len, entry.into_path()));
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));

    let mut sources = Vec::with_capacity(files.len() * 2);
    for (relative, len, path) in files {
        sources.push(ContentSource::Bytes(format!("{}\0{}\0", relative, len).into_bytes()));
        sources.push(ContentSource::File(path));
    }
    Ok(sources)
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.inner) as usize).hash(state);
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            ValueKind::Str(s) => write!(f, "StringValue('{}')", s),
            ValueKind::File(p) => write!(f, "FileValue('{}')", p.display()),
            ValueKind::Directory(p) => write!(f, "DirectoryValue('{}')", p.display()),
            ValueKind::List(values) => {
                write!(f, "ListValue([")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "])")
            }
            ValueKind::Fingerprint { label, .. } => write!(f, "Fingerprint('{}')", label),
            ValueKind::Output(slot) => {
                let kind = match slot.kind {
                    OutputKind::File => "OutputFile",
                    OutputKind::Directory => "OutputDir",
                };
                write!(
                    f,
                    "{}(name='{}', owner='{}')",
                    kind,
                    slot.name,
                    slot.owner().unwrap_or("<unregistered>")
                )
            }
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
