//! Class repositories
//!
//! A repository answers "what does class X look like" with a
//! [`ClassDescriptor`]. The [`ClassRepoFederation`] consults its own runtime
//! repository first (stubs, the generated bridge, rewritten inputs), then
//! every registered repository in order, then the platform repository.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use remora_classfile::{access, ClassFile, ClassFileError, OBJECT};
use std::ffi::OsStr;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use zip::result::ZipError;
use zip::ZipArchive;

/// Field or method as seen by the structural model
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberDescriptor {
    pub name: String,
    pub descriptor: String,
    pub access: u16,
}

impl MemberDescriptor {
    pub fn new(name: &str, descriptor: &str, access: u16) -> Self {
        Self {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            access,
        }
    }

    pub fn is_public(&self) -> bool {
        self.access & access::PUBLIC != 0
    }

    pub fn is_static(&self) -> bool {
        self.access & access::STATIC != 0
    }
}

/// Structural metadata of a class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDescriptor {
    pub name: String,
    pub access: u16,
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
    pub fields: Vec<MemberDescriptor>,
    pub methods: Vec<MemberDescriptor>,
}

impl ClassDescriptor {
    /// Extract the structure of a decoded class file
    pub fn from_class_file(class: &ClassFile) -> Result<Self, ClassFileError> {
        let pool = &class.constant_pool;
        let members = |list: &[remora_classfile::MemberInfo]| -> Result<Vec<MemberDescriptor>, ClassFileError> {
            list.iter()
                .map(|m| Ok(MemberDescriptor::new(m.name(pool)?, m.descriptor(pool)?, m.access_flags)))
                .collect()
        };
        Ok(Self {
            name: class.name()?.to_string(),
            access: class.access_flags,
            super_name: class.super_name()?.map(str::to_string),
            interfaces: class.interface_names()?.into_iter().map(str::to_string).collect(),
            fields: members(&class.fields)?,
            methods: members(&class.methods)?,
        })
    }

    /// Decode a class file and extract its structure
    pub fn parse(bytes: &[u8]) -> Result<Self, ClassFileError> {
        Self::from_class_file(&ClassFile::decode(bytes)?)
    }

    /// Built-in descriptor of `java/lang/Object`
    pub fn object() -> Self {
        let public = access::PUBLIC;
        Self {
            name: OBJECT.to_string(),
            access: public | access::SUPER,
            super_name: None,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: vec![
                MemberDescriptor::new("<init>", "()V", public),
                MemberDescriptor::new("equals", "(Ljava/lang/Object;)Z", public),
                MemberDescriptor::new("hashCode", "()I", public | access::NATIVE),
                MemberDescriptor::new("toString", "()Ljava/lang/String;", public),
                MemberDescriptor::new("getClass", "()Ljava/lang/Class;", public | access::FINAL | access::NATIVE),
                MemberDescriptor::new("notify", "()V", public | access::FINAL | access::NATIVE),
                MemberDescriptor::new("notifyAll", "()V", public | access::FINAL | access::NATIVE),
                MemberDescriptor::new("wait", "()V", public | access::FINAL),
                MemberDescriptor::new("wait", "(J)V", public | access::FINAL | access::NATIVE),
                MemberDescriptor::new("wait", "(JI)V", public | access::FINAL),
            ],
        }
    }

    /// Direct parents: superclass first, then interfaces in declaration order
    pub fn parents(&self) -> Vec<String> {
        self.super_name
            .iter()
            .chain(self.interfaces.iter())
            .cloned()
            .collect()
    }

    pub fn is_interface(&self) -> bool {
        self.access & access::INTERFACE != 0
    }

    /// Declared field by name
    pub fn field(&self, name: &str) -> Option<&MemberDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Declared method by name and descriptor
    pub fn method(&self, name: &str, descriptor: &str) -> Option<&MemberDescriptor> {
        self.methods
            .iter()
            .find(|m| m.name == name && m.descriptor == descriptor)
    }
}

/// Source of class structure
pub trait ClassRepo: Send + Sync {
    /// Look up a class by internal name
    fn find_class(&self, name: &str) -> Option<Arc<ClassDescriptor>>;
}

/// In-memory repository
#[derive(Default)]
pub struct MemoryRepo {
    classes: DashMap<String, Arc<ClassDescriptor>>,
    bytes: DashMap<String, Arc<[u8]>>,
}

impl MemoryRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a descriptor, replacing any existing one
    pub fn insert(&self, descriptor: ClassDescriptor) -> Arc<ClassDescriptor> {
        let descriptor = Arc::new(descriptor);
        self.classes.insert(descriptor.name.clone(), descriptor.clone());
        descriptor
    }

    /// Insert a descriptor unless the name is already present
    ///
    /// Returns the stored descriptor and whether this call inserted it.
    pub fn insert_if_absent(&self, descriptor: ClassDescriptor) -> (Arc<ClassDescriptor>, bool) {
        let mut inserted = false;
        let stored = self
            .classes
            .entry(descriptor.name.clone())
            .or_insert_with(|| {
                inserted = true;
                Arc::new(descriptor)
            })
            .value()
            .clone();
        (stored, inserted)
    }

    /// Parse a class file and store it with its bytes, replacing any existing entry
    pub fn put_bytes(&self, bytes: &[u8]) -> Result<Arc<ClassDescriptor>, ClassFileError> {
        let descriptor = self.insert(ClassDescriptor::parse(bytes)?);
        self.bytes.insert(descriptor.name.clone(), Arc::from(bytes));
        Ok(descriptor)
    }

    /// Store the bytes of a class whose descriptor was inserted separately
    pub fn attach_bytes(&self, name: &str, bytes: &[u8]) {
        self.bytes.insert(name.to_string(), Arc::from(bytes));
    }

    /// Class file bytes, if the class was registered with them
    pub fn bytes_of(&self, name: &str) -> Option<Arc<[u8]>> {
        self.bytes.get(name).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Names of all stored classes
    pub fn names(&self) -> Vec<String> {
        self.classes.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl ClassRepo for MemoryRepo {
    fn find_class(&self, name: &str) -> Option<Arc<ClassDescriptor>> {
        self.classes.get(name).map(|entry| entry.value().clone())
    }
}

/// Repository reading `<root>/<name>.class` on demand
///
/// Successful reads are memoized; misses are not, so classes written later
/// are still found.
pub struct DirectoryRepo {
    root: PathBuf,
    cache: DashMap<String, Arc<ClassDescriptor>>,
}

impl DirectoryRepo {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path a class would be read from
    pub fn class_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.class", name))
    }
}

impl ClassRepo for DirectoryRepo {
    fn find_class(&self, name: &str) -> Option<Arc<ClassDescriptor>> {
        if let Some(entry) = self.cache.get(name) {
            return Some(entry.value().clone());
        }
        let path = self.class_path(name);
        let bytes = std::fs::read(&path).ok()?;
        let descriptor = Arc::new(parse_named(&bytes, name, path.display())?);
        self.cache.insert(name.to_string(), descriptor.clone());
        Some(descriptor)
    }
}

/// Parse a class read for `name`, rejecting files that declare another name
fn parse_named(bytes: &[u8], name: &str, origin: impl fmt::Display) -> Option<ClassDescriptor> {
    match ClassDescriptor::parse(bytes) {
        Ok(descriptor) if descriptor.name == name => Some(descriptor),
        Ok(descriptor) => {
            debug!(origin = %origin, found = %descriptor.name, "class file name mismatch");
            None
        }
        Err(err) => {
            debug!(origin = %origin, error = %err, "unreadable class file");
            None
        }
    }
}

/// Repository reading class entries of a jar, zip or jmod archive
///
/// Entries of a `.jmod` live under `classes/`. Successful reads are memoized.
pub struct JarRepo {
    path: PathBuf,
    entry_prefix: &'static str,
    archive: Mutex<ZipArchive<BufReader<File>>>,
    cache: DashMap<String, Arc<ClassDescriptor>>,
}

impl JarRepo {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ZipError> {
        let path = path.into();
        let archive = ZipArchive::new(BufReader::new(File::open(&path)?))?;
        let entry_prefix = if has_extension(&path, &["jmod"]) { "classes/" } else { "" };
        debug!(path = %path.display(), entries = archive.len(), "opened class archive");
        Ok(Self {
            path,
            entry_prefix,
            archive: Mutex::new(archive),
            cache: DashMap::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Archive entry a class would be read from
    pub fn entry_name(&self, name: &str) -> String {
        format!("{}{}.class", self.entry_prefix, name)
    }

    fn read_entry(&self, name: &str) -> Option<Vec<u8>> {
        let mut archive = self.archive.lock();
        let mut entry = archive.by_name(&self.entry_name(name)).ok()?;
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        match entry.read_to_end(&mut bytes) {
            Ok(_) => Some(bytes),
            Err(err) => {
                debug!(archive = %self.path.display(), class = name, error = %err, "unreadable archive entry");
                None
            }
        }
    }
}

impl ClassRepo for JarRepo {
    fn find_class(&self, name: &str) -> Option<Arc<ClassDescriptor>> {
        if let Some(entry) = self.cache.get(name) {
            return Some(entry.value().clone());
        }
        let bytes = self.read_entry(name)?;
        let origin = format!("{}!{}", self.path.display(), self.entry_name(name));
        let descriptor = Arc::new(parse_named(&bytes, name, origin)?);
        self.cache.insert(name.to_string(), descriptor.clone());
        Some(descriptor)
    }
}

/// Whether a path names a class archive rather than a class directory
pub fn is_archive(path: &Path) -> bool {
    has_extension(path, &["jar", "zip", "jmod"])
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .map_or(false, |ext| extensions.iter().any(|e| ext.eq_ignore_ascii_case(e)))
}

/// Repository for one classpath entry: an archive or a class directory
pub fn classpath_repo(path: &Path) -> Result<Arc<dyn ClassRepo>, ZipError> {
    if is_archive(path) {
        Ok(Arc::new(JarRepo::open(path)?))
    } else {
        Ok(Arc::new(DirectoryRepo::new(path)))
    }
}

/// Ordered set of repositories behind one lookup
pub struct ClassRepoFederation {
    runtime: Arc<MemoryRepo>,
    repos: RwLock<Vec<Arc<dyn ClassRepo>>>,
    platform: RwLock<Option<Arc<dyn ClassRepo>>>,
    object: Arc<ClassDescriptor>,
}

impl ClassRepoFederation {
    pub fn new() -> Self {
        Self {
            runtime: Arc::new(MemoryRepo::new()),
            repos: RwLock::new(Vec::new()),
            platform: RwLock::new(None),
            object: Arc::new(ClassDescriptor::object()),
        }
    }

    /// Append a repository; later repositories are consulted last
    pub fn add_repo(&self, repo: Arc<dyn ClassRepo>) {
        self.repos.write().push(repo);
    }

    /// Install the repository answering for host platform classes,
    /// consulted after every registered one
    pub fn set_platform(&self, repo: Arc<dyn ClassRepo>) {
        *self.platform.write() = Some(repo);
    }

    pub fn has_platform(&self) -> bool {
        self.platform.read().is_some()
    }

    /// Repository holding stubs, generated classes and rewritten inputs
    pub fn runtime(&self) -> &Arc<MemoryRepo> {
        &self.runtime
    }

    /// Number of registered repositories, not counting the runtime one
    pub fn repo_count(&self) -> usize {
        self.repos.read().len()
    }

    /// Look up a class in the runtime repository, then each registered one,
    /// then the platform repository
    pub fn find_class(&self, name: &str) -> Option<Arc<ClassDescriptor>> {
        if let Some(found) = self.runtime.find_class(name) {
            return Some(found);
        }
        // Snapshot so slow repositories don't hold the lock
        let repos: Vec<Arc<dyn ClassRepo>> = self.repos.read().clone();
        if let Some(found) = repos.iter().find_map(|repo| repo.find_class(name)) {
            return Some(found);
        }
        let platform = self.platform.read().clone();
        if let Some(found) = platform.and_then(|repo| repo.find_class(name)) {
            return Some(found);
        }
        (name == OBJECT).then(|| self.object.clone())
    }
}

impl Default for ClassRepoFederation {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassRepo for ClassRepoFederation {
    fn find_class(&self, name: &str) -> Option<Arc<ClassDescriptor>> {
        ClassRepoFederation::find_class(self, name)
    }
}
