//! The remapping engine
//!
//! A [`Remapper`] owns everything one naming bridge needs: the mapping
//! table, the repository federation with its inheritance graph, the member
//! cache, the stub synthesizer, the transformer chain and the generated
//! reflection bridge. It is built once and shared behind an `Arc`.

use crate::bridge::{self, BuiltinTemplate, TemplateSource};
use crate::cache::{MemberCache, MemberIntrospector, StructuralIntrospector};
use crate::config::{Namespace, RemapConfig};
use crate::dump;
use crate::error::RemapError;
use crate::inheritance::InheritanceGraph;
use crate::mapping::{MappingTable, NameMapping};
use crate::platform::PlatformRepo;
use crate::repo::{ClassDescriptor, ClassRepo, ClassRepoFederation};
use crate::rewriter::{substitute, SymbolResolver};
use crate::stub::{ClassDefiner, Recovery, StubSynthesizer};
use crate::transform::{ReflectionRedirect, Transformer, TransformerChain};
use remora_classfile::{
    access, compute_frames, compute_maxs, peek_class_name, ClassFile, FrameError, Hierarchy, FRAMES_MAJOR_VERSION,
};
use std::io;
use std::sync::Arc;
use tracing::{debug, trace};

/// How the bytes of a class were reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connection {
    /// An entry of a jar file
    Jar {
        jar_file_url: String,
        entry: String,
        signers: Option<Vec<String>>,
    },
    /// Any other location
    Url(String),
}

impl Connection {
    /// Code source a class read through this connection is defined with
    pub fn code_source(&self) -> CodeSource {
        match self {
            Connection::Jar {
                jar_file_url, signers, ..
            } => CodeSource {
                location: jar_file_url.clone(),
                signers: signers.clone(),
            },
            Connection::Url(url) => CodeSource {
                location: url.clone(),
                signers: None,
            },
        }
    }
}

/// Location and signers of a defined class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeSource {
    pub location: String,
    pub signers: Option<Vec<String>>,
}

/// Symbol remapping and binary rewriting engine
pub struct Remapper {
    config: RemapConfig,
    namespace: Namespace,
    mapping: Arc<MappingTable>,
    federation: Arc<ClassRepoFederation>,
    graph: Arc<InheritanceGraph>,
    cache: MemberCache,
    stubs: Arc<StubSynthesizer>,
    transformers: TransformerChain,
    bridge_name: String,
    template_name: String,
}

impl Remapper {
    pub fn builder(config: RemapConfig, mapping: MappingTable) -> RemapperBuilder {
        RemapperBuilder::new(config, Arc::new(mapping))
    }

    pub fn config(&self) -> &RemapConfig {
        &self.config
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn mapping(&self) -> &Arc<MappingTable> {
        &self.mapping
    }

    pub fn federation(&self) -> &Arc<ClassRepoFederation> {
        &self.federation
    }

    pub fn graph(&self) -> &Arc<InheritanceGraph> {
        &self.graph
    }

    pub fn cache(&self) -> &MemberCache {
        &self.cache
    }

    pub fn stubs(&self) -> &Arc<StubSynthesizer> {
        &self.stubs
    }

    pub fn transformers(&self) -> &TransformerChain {
        &self.transformers
    }

    /// Name of this engine's generated reflection bridge
    pub fn bridge_name(&self) -> &str {
        &self.bridge_name
    }

    /// Name of the template the bridge was generated from
    pub fn template_name(&self) -> &str {
        &self.template_name
    }

    /// Public name of an internal class
    pub fn map_class_name(&self, internal: &str) -> String {
        self.mapping.map_class_name(internal)
    }

    /// Translated member name; the original name when unmapped
    pub fn map_member_name(&self, owner: &str, name: &str, descriptor: &str) -> String {
        self.mapping
            .map_member_name(owner, name, descriptor, self.config.direction)
    }

    fn forward(&self) -> &NameMapping {
        self.mapping.mapping(self.config.direction)
    }

    fn backward(&self) -> &NameMapping {
        self.mapping.mapping(self.config.direction.reverse())
    }

    /// Fail with [`RemapError::MissingClass`] unless the structure of a
    /// class is available
    fn require_class(&self, name: &str) -> Result<(), RemapError> {
        if self.namespace.is_platform(name) || self.graph.is_known(name) {
            Ok(())
        } else {
            Err(RemapError::MissingClass(name.to_string()))
        }
    }

    fn resolve_member(
        &self,
        owner: &str,
        access_flags: Option<u16>,
        mut lookup: impl FnMut(&str) -> Option<String>,
    ) -> Result<Option<(String, String)>, RemapError> {
        if let Some(mapped) = lookup(owner) {
            return Ok(Some((owner.to_string(), mapped)));
        }
        if access_flags.map_or(false, |flags| flags & (access::PRIVATE | access::STATIC) != 0) {
            return Ok(None);
        }
        self.require_class(owner)?;
        Ok(self.graph.climb(owner, access_flags, lookup))
    }

    /// Rewrite one class file from the source scheme to the target scheme
    pub fn rewrite(&self, bytes: &[u8]) -> Result<Vec<u8>, RemapError> {
        let original = ClassFile::decode(bytes).map_err(|e| {
            let name = peek_class_name(bytes).unwrap_or_else(|| "<unknown>".to_string());
            RemapError::malformed(name, e)
        })?;
        let name = original
            .name()
            .map_err(|e| RemapError::malformed("<unknown>", e))?
            .to_string();
        trace!(class = %name, "rewriting");

        let descriptor = ClassDescriptor::from_class_file(&original).map_err(|e| RemapError::malformed(&name, e))?;
        let parents = descriptor.parents();
        self.graph.record(&name, parents.clone());
        if self.config.register_runtime_classes {
            let runtime = self.federation.runtime();
            runtime.insert(descriptor);
            runtime.attach_bytes(&name, bytes);
        }

        let mut class = Recovery::new().run(&self.stubs, || {
            for parent in &parents {
                self.require_class(parent)?;
            }
            let mut class = original.clone();
            substitute(&mut class, self).map_err(|failure| failure.into_remap(&name))?;
            Ok(class)
        })?;

        self.transformers.apply(&mut class, self)?;
        self.recompute_frames(&mut class, &name)?;

        let out = class.encode().map_err(|source| RemapError::Encode {
            name: name.clone(),
            source,
        })?;
        if let Some(dir) = &self.config.dump_dir {
            let target = class.name().unwrap_or(&name);
            dump::dump(dir, target, &out);
        }
        trace!(class = %name, size = out.len(), "rewritten");
        Ok(out)
    }

    fn recompute_frames(&self, class: &mut ClassFile, name: &str) -> Result<(), RemapError> {
        if !self.config.compute_frames {
            return Ok(());
        }
        let hierarchy = TargetHierarchy { remapper: self };
        for index in 0..class.methods.len() {
            let has_code = class.methods[index]
                .code(&class.constant_pool)
                .map_err(|e| RemapError::malformed(name, e))?
                .is_some();
            if !has_code {
                continue;
            }

            let result = if class.major_version >= FRAMES_MAJOR_VERSION {
                compute_frames(class, index, &hierarchy).and_then(|computed| computed.apply(class, index))
            } else {
                compute_maxs(class, index).and_then(|maxs| set_maxs(class, index, maxs))
            };
            match result {
                Ok(()) => {}
                Err(FrameError::Subroutine(offset)) => {
                    debug!(class = %name, method = index, offset, "subroutine, code kept as is");
                }
                Err(source) => {
                    let method = &class.methods[index];
                    let pool = &class.constant_pool;
                    return Err(RemapError::Frames {
                        class: name.to_string(),
                        method: format!(
                            "{}{}",
                            method.name(pool).unwrap_or("<invalid>"),
                            method.descriptor(pool).unwrap_or("")
                        ),
                        source,
                    });
                }
            }
        }
        Ok(())
    }

    /// Rewrite the class supplied by `supplier`
    ///
    /// Every failure, including the supplier's, is reported as
    /// [`RemapError::ClassNotFound`] for `class_name`.
    pub fn remap_class(
        &self,
        class_name: &str,
        supplier: impl FnOnce() -> io::Result<Vec<u8>>,
        connection: &Connection,
    ) -> Result<(Vec<u8>, CodeSource), RemapError> {
        supplier()
            .map_err(RemapError::from)
            .and_then(|bytes| self.rewrite(&bytes))
            .map(|bytes| (bytes, connection.code_source()))
            .map_err(|source| RemapError::ClassNotFound {
                name: class_name.to_string(),
                source: Box::new(source),
            })
    }
}

fn set_maxs(class: &mut ClassFile, index: usize, (max_stack, max_locals): (u16, u16)) -> Result<(), FrameError> {
    let mut code = class.methods[index]
        .code(&class.constant_pool)?
        .ok_or(FrameError::NoCode)?;
    code.max_stack = max_stack;
    code.max_locals = max_locals;
    class.methods[index].set_code(&class.constant_pool, &code);
    Ok(())
}

impl SymbolResolver for Remapper {
    fn map_type(&self, name: &str) -> String {
        if name == self.template_name {
            return self.bridge_name.clone();
        }
        self.forward().map_type(name)
    }

    fn map_field(
        &self,
        owner: &str,
        name: &str,
        descriptor: &str,
        access_flags: Option<u16>,
    ) -> Result<Option<(String, String)>, RemapError> {
        let forward = self.forward();
        self.resolve_member(owner, access_flags, |class| {
            forward.map_field(class, name, descriptor).map(str::to_string)
        })
    }

    fn map_method(
        &self,
        owner: &str,
        name: &str,
        descriptor: &str,
        access_flags: Option<u16>,
    ) -> Result<Option<(String, String)>, RemapError> {
        let forward = self.forward();
        self.resolve_member(owner, access_flags, |class| {
            forward.map_method(class, name, descriptor).map(str::to_string)
        })
    }

    fn is_interface(&self, name: &str) -> Option<bool> {
        self.graph.is_interface(name)
    }
}

/// Answers hierarchy questions about already rewritten names
struct TargetHierarchy<'a> {
    remapper: &'a Remapper,
}

impl Hierarchy for TargetHierarchy<'_> {
    fn common_super_class(&self, a: &str, b: &str) -> String {
        let backward = self.remapper.backward();
        let common = self
            .remapper
            .graph
            .common_super_class(&backward.map_type(a), &backward.map_type(b));
        self.remapper.forward().map_type(&common)
    }
}

impl Drop for Remapper {
    fn drop(&mut self) {
        bridge::unregister(&self.bridge_name);
    }
}

/// Assembles a [`Remapper`]
pub struct RemapperBuilder {
    config: RemapConfig,
    mapping: Arc<MappingTable>,
    federation: Option<Arc<ClassRepoFederation>>,
    repos: Vec<Arc<dyn ClassRepo>>,
    platform: Option<Arc<dyn ClassRepo>>,
    introspector: Option<Arc<dyn MemberIntrospector>>,
    definer: Option<Arc<dyn ClassDefiner>>,
    template: Arc<dyn TemplateSource>,
    transformers: Vec<Arc<dyn Transformer>>,
    reflection_redirect: bool,
}

impl RemapperBuilder {
    pub fn new(config: RemapConfig, mapping: Arc<MappingTable>) -> Self {
        Self {
            config,
            mapping,
            federation: None,
            repos: Vec::new(),
            platform: None,
            introspector: None,
            definer: None,
            template: Arc::new(BuiltinTemplate),
            transformers: Vec::new(),
            reflection_redirect: true,
        }
    }

    /// Share an existing federation instead of creating one
    pub fn federation(mut self, federation: Arc<ClassRepoFederation>) -> Self {
        self.federation = Some(federation);
        self
    }

    /// Add a class repository, consulted in the order added
    pub fn repo(mut self, repo: Arc<dyn ClassRepo>) -> Self {
        self.repos.push(repo);
        self
    }

    /// Answer for platform classes with `repo` instead of a
    /// [`PlatformRepo`] built from the configuration
    pub fn platform(mut self, repo: Arc<dyn ClassRepo>) -> Self {
        self.platform = Some(repo);
        self
    }

    /// Replace the structural member introspector
    pub fn introspector(mut self, introspector: Arc<dyn MemberIntrospector>) -> Self {
        self.introspector = Some(introspector);
        self
    }

    /// Install the host hook defining stubs and the bridge
    pub fn definer(mut self, definer: Arc<dyn ClassDefiner>) -> Self {
        self.definer = Some(definer);
        self
    }

    pub fn template(mut self, template: Arc<dyn TemplateSource>) -> Self {
        self.template = template;
        self
    }

    /// Append a transformer after the built-in ones
    pub fn transformer(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.transformers.push(transformer);
        self
    }

    /// Leave reflective call sites untouched
    pub fn without_reflection_redirect(mut self) -> Self {
        self.reflection_redirect = false;
        self
    }

    pub fn build(self) -> Result<Arc<Remapper>, RemapError> {
        self.config.validate()?;
        let namespace = self.config.namespace();
        let federation = self.federation.unwrap_or_default();
        for repo in self.repos {
            federation.add_repo(repo);
        }
        match self.platform {
            Some(platform) => federation.set_platform(platform),
            None if !federation.has_platform() => {
                federation.set_platform(Arc::new(PlatformRepo::from_config(&self.config)))
            }
            None => {}
        }
        let graph = Arc::new(InheritanceGraph::new(federation.clone()));
        let stubs = Arc::new(StubSynthesizer::new(
            namespace.clone(),
            graph.clone(),
            self.definer.clone(),
        ));
        let introspector = self
            .introspector
            .unwrap_or_else(|| Arc::new(StructuralIntrospector::new(federation.clone(), namespace.clone())));
        let cache = MemberCache::new(
            self.mapping.clone(),
            graph.clone(),
            namespace.clone(),
            introspector,
            stubs.clone(),
        );

        let mut transformers = TransformerChain::new();
        if self.reflection_redirect {
            transformers.register(Arc::new(ReflectionRedirect))?;
        }
        for transformer in self.transformers {
            transformers.register(transformer)?;
        }

        let template_name = self.config.bridge_template.clone();
        let generated = bridge::generate(
            self.template.as_ref(),
            &template_name,
            self.definer.as_deref(),
            &graph,
        )?;

        let remapper = Arc::new(Remapper {
            config: self.config,
            namespace,
            mapping: self.mapping,
            federation,
            graph,
            cache,
            stubs,
            transformers,
            bridge_name: generated.name,
            template_name,
        });
        bridge::register(&remapper.bridge_name, &remapper);
        debug!(
            bridge = %remapper.bridge_name,
            direction = %remapper.config.direction,
            "remapper ready"
        );
        Ok(remapper)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remora_classfile::{ClassBuilder, MemberKind, OBJECT};

    fn mapping() -> MappingTable {
        let mut to_public = NameMapping::new();
        to_public.add_class("a/b/Foo", "org/pub/Foo");
        to_public.add_class("a/b/Bar", "org/pub/Bar");
        to_public.add_method("a/b/Foo", "doX", "()V", "run");
        MappingTable::new(to_public)
    }

    fn remapper() -> Arc<Remapper> {
        let federation = Arc::new(ClassRepoFederation::new());
        federation
            .runtime()
            .put_bytes(&ClassBuilder::new("a/b/Foo", Some(OBJECT), access::PUBLIC).build().unwrap())
            .unwrap();
        federation
            .runtime()
            .put_bytes(&ClassBuilder::new("a/b/Bar", Some("a/b/Foo"), access::PUBLIC).build().unwrap())
            .unwrap();
        Remapper::builder(RemapConfig::new("a/b/"), mapping())
            .federation(federation)
            .build()
            .unwrap()
    }

    #[test]
    fn test_connection_code_source() {
        let jar = Connection::Jar {
            jar_file_url: "file:/mods/x.jar".to_string(),
            entry: "a/b/Foo.class".to_string(),
            signers: Some(vec!["CN=dev".to_string()]),
        };
        assert_eq!(
            jar.code_source(),
            CodeSource {
                location: "file:/mods/x.jar".to_string(),
                signers: Some(vec!["CN=dev".to_string()]),
            }
        );
        let url = Connection::Url("file:/classes/".to_string());
        assert_eq!(url.code_source().signers, None);
    }

    #[test]
    fn test_bridge_template_maps_to_generated_name() {
        let remapper = remapper();
        assert!(remapper.bridge_name().starts_with("remora/bridge/ReflectionBridge_"));
        assert_eq!(remapper.map_type(remapper.template_name()), remapper.bridge_name());
        assert_eq!(remapper.map_type("a/b/Foo"), "org/pub/Foo");
        assert_eq!(remapper.transformers().ids(), vec![ReflectionRedirect::ID]);
    }

    #[test]
    fn test_target_hierarchy_maps_both_ways() {
        let remapper = remapper();
        let hierarchy = TargetHierarchy { remapper: &remapper };
        assert_eq!(hierarchy.common_super_class("org/pub/Bar", "org/pub/Foo"), "org/pub/Foo");
        assert_eq!(hierarchy.common_super_class("org/pub/Bar", "java/lang/String"), OBJECT);
    }

    #[test]
    fn test_exception_branches_merge_to_closest_platform_super() {
        let remapper = remapper();
        let mut builder = ClassBuilder::new("a/b/Opener", Some(OBJECT), access::PUBLIC | access::SUPER);
        builder.version(52);
        let pool = builder.pool();
        let fnfe = pool.add_class("java/io/FileNotFoundException").unwrap();
        let fnfe_init = pool
            .add_member_ref(MemberKind::Method, "java/io/FileNotFoundException", "<init>", "()V")
            .unwrap();
        let eofe = pool.add_class("java/io/EOFException").unwrap();
        let eofe_init = pool
            .add_member_ref(MemberKind::Method, "java/io/EOFException", "<init>", "()V")
            .unwrap();
        let [fh, fl] = fnfe.to_be_bytes();
        let [fih, fil] = fnfe_init.to_be_bytes();
        let [eh, el] = eofe.to_be_bytes();
        let [eih, eil] = eofe_init.to_be_bytes();
        // flag ? new FileNotFoundException() : new EOFException()
        let code = vec![
            0x1A, // 0: iload_0
            0x99, 0x00, 0x0D, // 1: ifeq 14
            0xBB, fh, fl, // 4: new
            0x59, // 7: dup
            0xB7, fih, fil, // 8: invokespecial
            0xA7, 0x00, 0x0A, // 11: goto 21
            0xBB, eh, el, // 14: new
            0x59, // 17: dup
            0xB7, eih, eil, // 18: invokespecial
            0xB0, // 21: areturn
        ];
        builder
            .add_method(access::PUBLIC | access::STATIC, "pick", "(Z)Ljava/io/IOException;")
            .code(0, 0, code);
        let out = remapper.rewrite(&builder.build().unwrap()).unwrap();

        let class = ClassFile::decode(&out).unwrap();
        let pool = &class.constant_pool;
        let code = class.methods[0].code(pool).unwrap().unwrap();
        assert_eq!((code.max_stack, code.max_locals), (2, 1));
        let table = remora_classfile::find_attribute(&code.attributes, pool, "StackMapTable").unwrap();
        // same_frame at 14, then same_locals_1_stack_item at 21 holding an Object
        assert_eq!(&table.info[..5], &[0x00, 0x02, 14, 64 + 6, 7]);
        let merged = u16::from_be_bytes([table.info[5], table.info[6]]);
        assert_eq!(pool.class_name(merged).unwrap(), "java/io/IOException");
    }

    #[test]
    fn test_private_members_never_climb() {
        let remapper = remapper();
        let private = remapper
            .map_method("a/b/Bar", "doX", "()V", Some(access::PRIVATE))
            .unwrap();
        assert!(private.is_none());
        let inherited = remapper.map_method("a/b/Bar", "doX", "()V", None).unwrap();
        assert_eq!(inherited, Some(("a/b/Foo".to_string(), "run".to_string())));
    }

    #[test]
    fn test_malformed_input_names_the_class() {
        let remapper = remapper();
        let mut bytes = ClassBuilder::new("a/b/Broken", Some(OBJECT), access::PUBLIC).build().unwrap();
        bytes.truncate(bytes.len() - 3);
        let err = remapper.rewrite(&bytes).unwrap_err();
        assert!(matches!(err, RemapError::Malformed { name, .. } if name == "a/b/Broken"));
    }

    #[test]
    fn test_remap_class_wraps_errors() {
        let remapper = remapper();
        let connection = Connection::Url("file:/x/".to_string());
        let err = remapper
            .remap_class(
                "a/b/Gone",
                || Err(io::Error::new(io::ErrorKind::NotFound, "gone")),
                &connection,
            )
            .unwrap_err();
        match err {
            RemapError::ClassNotFound { name, source } => {
                assert_eq!(name, "a/b/Gone");
                assert!(matches!(*source, RemapError::Io(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_renamed_descriptor_too_long_to_encode() {
        let remapper = remapper();
        let descriptor = format!("({})V", "La/b/Foo;".repeat(7000));
        let mut builder = ClassBuilder::new(
            "a/b/Wide",
            Some(OBJECT),
            access::PUBLIC | access::ABSTRACT,
        );
        builder.add_method(access::PUBLIC | access::ABSTRACT, "go", &descriptor);
        let bytes = builder.build().unwrap();

        // the renamed descriptor outgrows a u2 length prefix
        let err = remapper.rewrite(&bytes).unwrap_err();
        assert!(matches!(err, RemapError::Encode { name, .. } if name == "a/b/Wide"));
    }

    #[test]
    fn test_pre_frames_version_keeps_no_stack_map() {
        let remapper = remapper();
        let mut builder = ClassBuilder::new("a/b/Old", Some(OBJECT), access::PUBLIC | access::SUPER);
        builder.version(49);
        let pool = builder.pool();
        let call = pool.add_member_ref(MemberKind::Method, "a/b/Bar", "doX", "()V").unwrap();
        let [hi, lo] = call.to_be_bytes();
        builder
            .add_method(access::PUBLIC, "go", "(La/b/Bar;)V")
            .code(0, 0, vec![0x2B, 0xB6, hi, lo, 0xB1]);
        let out = remapper.rewrite(&builder.build().unwrap()).unwrap();

        let class = ClassFile::decode(&out).unwrap();
        let code = class.methods[0].code(&class.constant_pool).unwrap().unwrap();
        assert_eq!((code.max_stack, code.max_locals), (1, 2));
        assert!(remora_classfile::find_attribute(&code.attributes, &class.constant_pool, "StackMapTable").is_none());
    }
}
