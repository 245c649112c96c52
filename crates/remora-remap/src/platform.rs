//! Host platform classes
//!
//! Merging two JDK types during frame computation (an `EOFException` and a
//! `FileNotFoundException` on two branches, say) needs their real superclass
//! chains. [`PlatformRepo`] reads platform classes from the configured
//! archives, or from the JDK found through `JAVA_HOME`, and falls back to a
//! built-in table of the core `java.lang`, `java.io` and `java.util` types.

use crate::config::{Namespace, RemapConfig};
use crate::repo::{classpath_repo, ClassDescriptor, ClassRepo};
use once_cell::sync::Lazy;
use remora_classfile::{access, OBJECT};
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Environment variable locating the JDK
pub const JAVA_HOME_ENV: &str = "JAVA_HOME";

const CLASS: u16 = access::PUBLIC | access::SUPER;
const FINAL: u16 = CLASS | access::FINAL;
const ABSTRACT: u16 = CLASS | access::ABSTRACT;
const INTERFACE: u16 = access::PUBLIC | access::INTERFACE | access::ABSTRACT;

/// (name, superclass, interfaces, access)
type Builtin = (&'static str, &'static str, &'static [&'static str], u16);

#[rustfmt::skip]
const BUILTINS: &[Builtin] = &[
    // interfaces
    ("java/io/Serializable", OBJECT, &[], INTERFACE),
    ("java/lang/Cloneable", OBJECT, &[], INTERFACE),
    ("java/lang/Comparable", OBJECT, &[], INTERFACE),
    ("java/lang/CharSequence", OBJECT, &[], INTERFACE),
    ("java/lang/Runnable", OBJECT, &[], INTERFACE),
    ("java/lang/AutoCloseable", OBJECT, &[], INTERFACE),
    ("java/io/Closeable", OBJECT, &["java/lang/AutoCloseable"], INTERFACE),
    ("java/lang/Iterable", OBJECT, &[], INTERFACE),
    ("java/util/Collection", OBJECT, &["java/lang/Iterable"], INTERFACE),
    ("java/util/List", OBJECT, &["java/util/Collection"], INTERFACE),
    ("java/util/Set", OBJECT, &["java/util/Collection"], INTERFACE),
    ("java/util/Queue", OBJECT, &["java/util/Collection"], INTERFACE),
    ("java/util/Deque", OBJECT, &["java/util/Queue"], INTERFACE),
    ("java/util/RandomAccess", OBJECT, &[], INTERFACE),
    ("java/util/Map", OBJECT, &[], INTERFACE),
    // throwables
    ("java/lang/Throwable", OBJECT, &["java/io/Serializable"], CLASS),
    ("java/lang/Exception", "java/lang/Throwable", &[], CLASS),
    ("java/lang/Error", "java/lang/Throwable", &[], CLASS),
    ("java/lang/RuntimeException", "java/lang/Exception", &[], CLASS),
    ("java/lang/IllegalArgumentException", "java/lang/RuntimeException", &[], CLASS),
    ("java/lang/NumberFormatException", "java/lang/IllegalArgumentException", &[], CLASS),
    ("java/lang/IllegalStateException", "java/lang/RuntimeException", &[], CLASS),
    ("java/lang/NullPointerException", "java/lang/RuntimeException", &[], CLASS),
    ("java/lang/ClassCastException", "java/lang/RuntimeException", &[], CLASS),
    ("java/lang/ArithmeticException", "java/lang/RuntimeException", &[], CLASS),
    ("java/lang/UnsupportedOperationException", "java/lang/RuntimeException", &[], CLASS),
    ("java/lang/IndexOutOfBoundsException", "java/lang/RuntimeException", &[], CLASS),
    ("java/lang/ArrayIndexOutOfBoundsException", "java/lang/IndexOutOfBoundsException", &[], CLASS),
    ("java/lang/StringIndexOutOfBoundsException", "java/lang/IndexOutOfBoundsException", &[], CLASS),
    ("java/lang/ReflectiveOperationException", "java/lang/Exception", &[], CLASS),
    ("java/lang/ClassNotFoundException", "java/lang/ReflectiveOperationException", &[], CLASS),
    ("java/lang/NoSuchFieldException", "java/lang/ReflectiveOperationException", &[], CLASS),
    ("java/lang/NoSuchMethodException", "java/lang/ReflectiveOperationException", &[], CLASS),
    ("java/lang/IllegalAccessException", "java/lang/ReflectiveOperationException", &[], CLASS),
    ("java/lang/InstantiationException", "java/lang/ReflectiveOperationException", &[], CLASS),
    ("java/lang/reflect/InvocationTargetException", "java/lang/ReflectiveOperationException", &[], CLASS),
    ("java/lang/InterruptedException", "java/lang/Exception", &[], CLASS),
    ("java/lang/CloneNotSupportedException", "java/lang/Exception", &[], CLASS),
    ("java/lang/LinkageError", "java/lang/Error", &[], CLASS),
    ("java/lang/NoClassDefFoundError", "java/lang/LinkageError", &[], CLASS),
    ("java/lang/VirtualMachineError", "java/lang/Error", &[], ABSTRACT),
    ("java/lang/OutOfMemoryError", "java/lang/VirtualMachineError", &[], CLASS),
    ("java/lang/StackOverflowError", "java/lang/VirtualMachineError", &[], CLASS),
    ("java/lang/AssertionError", "java/lang/Error", &[], CLASS),
    ("java/io/IOException", "java/lang/Exception", &[], CLASS),
    ("java/io/FileNotFoundException", "java/io/IOException", &[], CLASS),
    ("java/io/EOFException", "java/io/IOException", &[], CLASS),
    ("java/io/UncheckedIOException", "java/lang/RuntimeException", &[], CLASS),
    ("java/util/NoSuchElementException", "java/lang/RuntimeException", &[], CLASS),
    ("java/util/ConcurrentModificationException", "java/lang/RuntimeException", &[], CLASS),
    ("java/util/concurrent/ExecutionException", "java/lang/Exception", &[], CLASS),
    ("java/util/concurrent/TimeoutException", "java/lang/Exception", &[], CLASS),
    // java.lang values
    ("java/lang/String", OBJECT, &["java/io/Serializable", "java/lang/Comparable", "java/lang/CharSequence"], FINAL),
    ("java/lang/Number", OBJECT, &["java/io/Serializable"], ABSTRACT),
    ("java/lang/Byte", "java/lang/Number", &["java/lang/Comparable"], FINAL),
    ("java/lang/Short", "java/lang/Number", &["java/lang/Comparable"], FINAL),
    ("java/lang/Integer", "java/lang/Number", &["java/lang/Comparable"], FINAL),
    ("java/lang/Long", "java/lang/Number", &["java/lang/Comparable"], FINAL),
    ("java/lang/Float", "java/lang/Number", &["java/lang/Comparable"], FINAL),
    ("java/lang/Double", "java/lang/Number", &["java/lang/Comparable"], FINAL),
    ("java/lang/Boolean", OBJECT, &["java/io/Serializable", "java/lang/Comparable"], FINAL),
    ("java/lang/Character", OBJECT, &["java/io/Serializable", "java/lang/Comparable"], FINAL),
    ("java/lang/Enum", OBJECT, &["java/lang/Comparable", "java/io/Serializable"], ABSTRACT),
    ("java/lang/Thread", OBJECT, &["java/lang/Runnable"], CLASS),
    // collections
    ("java/util/AbstractCollection", OBJECT, &["java/util/Collection"], ABSTRACT),
    ("java/util/AbstractList", "java/util/AbstractCollection", &["java/util/List"], ABSTRACT),
    ("java/util/AbstractSet", "java/util/AbstractCollection", &["java/util/Set"], ABSTRACT),
    ("java/util/ArrayList", "java/util/AbstractList",
        &["java/util/List", "java/util/RandomAccess", "java/lang/Cloneable", "java/io/Serializable"], CLASS),
    ("java/util/HashSet", "java/util/AbstractSet",
        &["java/util/Set", "java/lang/Cloneable", "java/io/Serializable"], CLASS),
    ("java/util/ArrayDeque", "java/util/AbstractCollection",
        &["java/util/Deque", "java/lang/Cloneable", "java/io/Serializable"], CLASS),
    ("java/util/AbstractMap", OBJECT, &["java/util/Map"], ABSTRACT),
    ("java/util/HashMap", "java/util/AbstractMap",
        &["java/util/Map", "java/lang/Cloneable", "java/io/Serializable"], CLASS),
    ("java/util/LinkedHashMap", "java/util/HashMap", &["java/util/Map"], CLASS),
];

static BUILTIN_TABLE: Lazy<FxHashMap<&'static str, Arc<ClassDescriptor>>> = Lazy::new(|| {
    BUILTINS
        .iter()
        .map(|&(name, super_name, interfaces, flags)| {
            let descriptor = ClassDescriptor {
                name: name.to_string(),
                access: flags,
                super_name: Some(super_name.to_string()),
                interfaces: interfaces.iter().map(|i| i.to_string()).collect(),
                fields: Vec::new(),
                methods: Vec::new(),
            };
            (name, Arc::new(descriptor))
        })
        .collect()
});

/// Repository answering for platform classes only
pub struct PlatformRepo {
    namespace: Namespace,
    archives: Vec<Arc<dyn ClassRepo>>,
}

impl PlatformRepo {
    /// Platform repository backed by the built-in table alone
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            archives: Vec::new(),
        }
    }

    /// Consult an archive before the built-in table
    pub fn with_archive(mut self, archive: Arc<dyn ClassRepo>) -> Self {
        self.archives.push(archive);
        self
    }

    /// Platform repository for an engine configuration
    pub fn from_config(config: &RemapConfig) -> Self {
        Self::open(config.namespace(), &config.platform_classpath)
    }

    /// Platform repository reading `entries`, or the JDK below `JAVA_HOME`
    /// when there are none. Entries that cannot be opened are skipped.
    pub fn open(namespace: Namespace, entries: &[PathBuf]) -> Self {
        let entries = if entries.is_empty() {
            std::env::var_os(JAVA_HOME_ENV)
                .map(|home| java_home_archives(Path::new(&home)))
                .unwrap_or_default()
        } else {
            entries.to_vec()
        };

        let mut repo = Self::new(namespace);
        for path in entries {
            match classpath_repo(&path) {
                Ok(archive) => {
                    debug!(path = %path.display(), "platform classpath entry");
                    repo.archives.push(archive);
                }
                Err(err) => warn!(path = %path.display(), error = %err, "skipping platform classpath entry"),
            }
        }
        repo
    }

    /// Number of archives consulted before the built-in table
    pub fn archive_count(&self) -> usize {
        self.archives.len()
    }
}

impl ClassRepo for PlatformRepo {
    fn find_class(&self, name: &str) -> Option<Arc<ClassDescriptor>> {
        if name.starts_with('[') || !self.namespace.is_platform(name) {
            return None;
        }
        self.archives
            .iter()
            .find_map(|archive| archive.find_class(name))
            .or_else(|| BUILTIN_TABLE.get(name).cloned())
    }
}

/// Class archive of the JDK installed at `java_home`, if any
///
/// Modular JDKs ship `jmods/java.base.jmod`; older ones `rt.jar`.
pub fn java_home_archives(java_home: &Path) -> Vec<PathBuf> {
    ["jmods/java.base.jmod", "lib/rt.jar", "jre/lib/rt.jar"]
        .iter()
        .map(|relative| java_home.join(relative))
        .find(|path| path.is_file())
        .into_iter()
        .collect()
}
