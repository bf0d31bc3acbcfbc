//! Source loading, include resolution, and compilation-unit assembly
//! (C5, §4.5).
//!
//! A [`SourceRepo`] is the host-pluggable file loader: its [`SourceLoader`]
//! trait is implemented by the host the way `PrintWriter` is in the teacher
//! crate's `io` module, with [`FsSourceLoader`] as the ordinary disk-backed
//! default. A [`CompilationUnit`] is the result of flattening one entry
//! file's `include` tree into a single ordered list of top-level forms,
//! with same-named `sub` declarations grouped into [`SubList`]s.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use ahash::AHashMap;

use crate::ast::{AclDecl, ExtensionDecl, File, GlobalDecl, Span, Stmt, TopLevel};
use crate::error::CompileError;
use crate::parser::{NameSeed, Parser};
use crate::zone::Zone;

/// Host-supplied file loader. Implementations may read from disk, an
/// embedded bundle, a network fetch cached beforehand, or anything else —
/// the repo only ever asks for a resolved path's text.
pub trait SourceLoader {
    fn load(&self, resolved_path: &Path) -> std::io::Result<String>;
}

/// The ordinary loader: reads files straight off disk.
#[derive(Debug, Default)]
pub struct FsSourceLoader;

impl SourceLoader for FsSourceLoader {
    fn load(&self, resolved_path: &Path) -> std::io::Result<String> {
        std::fs::read_to_string(resolved_path)
    }
}

/// Loads files on demand through a [`SourceLoader`], resolves `include`
/// paths against a folder hint, and assigns each resolved path a stable
/// `source_index` for use in [`Span`]s.
///
/// Loaded source text is cached by resolved path for the lifetime of the
/// repo — cheap to keep around since it holds no zone-allocated data.
/// Parsed ASTs are *not* cached here: a `File<'z>`'s lifetime is tied to
/// the `Zone` of the compilation job that parsed it (§3 "Lifecycle"), and a
/// `SourceRepo` is expected to outlive any one job. Per-job AST reuse (so a
/// diamond-included file is parsed once) is handled by
/// [`CompilationUnit::build`] with a cache scoped to that call.
pub struct SourceRepo {
    loader: Box<dyn SourceLoader>,
    allow_absolute_includes: bool,
    include_depth_limit: u32,
    text_cache: RefCell<AHashMap<PathBuf, Rc<str>>>,
    path_index: RefCell<AHashMap<PathBuf, u32>>,
    index_path: RefCell<Vec<PathBuf>>,
}

impl SourceRepo {
    pub fn new(loader: Box<dyn SourceLoader>, allow_absolute_includes: bool, include_depth_limit: u32) -> Self {
        Self {
            loader,
            allow_absolute_includes,
            include_depth_limit,
            text_cache: RefCell::new(AHashMap::default()),
            path_index: RefCell::new(AHashMap::default()),
            index_path: RefCell::new(Vec::new()),
        }
    }

    pub fn with_fs_loader(allow_absolute_includes: bool, include_depth_limit: u32) -> Self {
        Self::new(Box::new(FsSourceLoader), allow_absolute_includes, include_depth_limit)
    }

    /// Resolves a raw `include`/entry path against an optional folder hint,
    /// rejecting absolute paths unless the repo was configured to allow
    /// them.
    fn resolve(&self, raw: &str, from_folder: Option<&Path>) -> Result<PathBuf, CompileError> {
        let raw_path = Path::new(raw);
        if raw_path.is_absolute() {
            if !self.allow_absolute_includes {
                return Err(CompileError::AbsoluteIncludeDisallowed { path: raw.to_string() });
            }
            return Ok(raw_path.to_path_buf());
        }
        Ok(from_folder.unwrap_or_else(|| Path::new(".")).join(raw_path))
    }

    fn source_index_for(&self, path: &Path) -> u32 {
        if let Some(&idx) = self.path_index.borrow().get(path) {
            return idx;
        }
        let mut index_path = self.index_path.borrow_mut();
        let idx = index_path.len() as u32;
        index_path.push(path.to_path_buf());
        self.path_index.borrow_mut().insert(path.to_path_buf(), idx);
        idx
    }

    /// The resolved path a given `Span::source_index` was assigned to, for
    /// rendering diagnostics.
    pub fn path_for_index(&self, index: u32) -> Option<PathBuf> {
        self.index_path.borrow().get(index as usize).cloned()
    }

    fn load_text(&self, path: &Path) -> Result<Rc<str>, CompileError> {
        if let Some(text) = self.text_cache.borrow().get(path) {
            return Ok(Rc::clone(text));
        }
        let text = self
            .loader
            .load(path)
            .map_err(|_| CompileError::IncludeNotFound { path: path.display().to_string() })?;
        let rc: Rc<str> = Rc::from(text.into_boxed_str());
        self.text_cache.borrow_mut().insert(path.to_path_buf(), Rc::clone(&rc));
        Ok(rc)
    }
}

/// Same-named `sub` declarations grouped into one list, per §4.5: "the
/// group's argument list is taken from the first occurrence and every
/// later occurrence must have an identical arity and parameter spelling."
#[derive(Debug)]
pub struct SubList<'z> {
    pub name: &'z str,
    pub params: &'z [&'z str],
    pub bodies: Vec<&'z [Stmt<'z>]>,
    pub first_span: Span,
}

/// The flattened, grouped result of resolving one entry file's `include`
/// tree (§4.5).
#[derive(Debug)]
pub struct CompilationUnit<'z> {
    pub vcl_version: f64,
    pub subs: Vec<SubList<'z>>,
    pub acls: Vec<AclDecl<'z>>,
    pub globals: Vec<GlobalDecl<'z>>,
    pub extensions: Vec<ExtensionDecl<'z>>,
    pub imports: Vec<&'z str>,
}

impl<'z> CompilationUnit<'z> {
    /// Loads `entry_path`, recursively flattens its `include` tree in
    /// visitation order, and groups `sub` declarations. Returns the
    /// compilation unit plus the seed advanced past every file it parsed,
    /// so callers can feed it to the compiler for further fresh names.
    pub fn build(
        zone: &'z Zone,
        repo: &SourceRepo,
        entry_path: &str,
        entry_folder: Option<&Path>,
        seed: NameSeed,
    ) -> Result<(Self, NameSeed), CompileError> {
        let resolved = repo.resolve(entry_path, entry_folder)?;
        let mut seed = seed;
        let mut cache: AHashMap<PathBuf, File<'z>> = AHashMap::default();
        let entry_file = Self::load_and_parse(zone, repo, &resolved, &mut seed, &mut cache)?;

        let mut items = Vec::new();
        let mut stack = vec![resolved.clone()];
        Self::flatten_file(zone, repo, &entry_file, resolved.parent(), 1, &mut stack, &mut cache, &mut seed, &mut items)?;

        let mut subs: Vec<SubList<'z>> = Vec::new();
        let mut sub_index: AHashMap<&'z str, usize> = AHashMap::default();
        let mut acls = Vec::new();
        let mut globals = Vec::new();
        let mut extensions = Vec::new();
        let mut imports = Vec::new();

        for item in items {
            match item {
                TopLevel::Sub(decl) => {
                    if let Some(&i) = sub_index.get(decl.name) {
                        let existing = &mut subs[i];
                        if existing.params.len() != decl.params.len()
                            || existing.params.iter().zip(decl.params.iter()).any(|(a, b)| a != b)
                        {
                            return Err(CompileError::ConflictingSubSignature {
                                name: decl.name.to_string(),
                                first: existing.first_span,
                                second: decl.span,
                            });
                        }
                        existing.bodies.push(decl.body);
                    } else {
                        sub_index.insert(decl.name, subs.len());
                        subs.push(SubList {
                            name: decl.name,
                            params: decl.params,
                            bodies: vec![decl.body],
                            first_span: decl.span,
                        });
                    }
                }
                TopLevel::Acl(decl) => acls.push(decl),
                TopLevel::Global(decl) => globals.push(decl),
                TopLevel::Extension(decl) => extensions.push(decl),
                TopLevel::Import { name, .. } => imports.push(name),
                TopLevel::Include { .. } => unreachable!("flatten_file consumes every Include"),
            }
        }

        Ok((Self { vcl_version: entry_file.vcl_version, subs, acls, globals, extensions, imports }, seed))
    }

    fn load_and_parse(
        zone: &'z Zone,
        repo: &SourceRepo,
        path: &Path,
        seed: &mut NameSeed,
        cache: &mut AHashMap<PathBuf, File<'z>>,
    ) -> Result<File<'z>, CompileError> {
        if let Some(file) = cache.get(path) {
            return Ok(*file);
        }
        let text = repo.load_text(path)?;
        let index = repo.source_index_for(path);
        let mut parser = Parser::new(zone, &text, index, *seed).map_err(CompileError::Parse)?;
        let file = parser.parse_file().map_err(CompileError::Parse)?;
        *seed = parser.next_seed();
        cache.insert(path.to_path_buf(), file);
        Ok(file)
    }

    #[allow(clippy::too_many_arguments)]
    fn flatten_file(
        zone: &'z Zone,
        repo: &SourceRepo,
        file: &File<'z>,
        folder: Option<&Path>,
        depth: u32,
        stack: &mut Vec<PathBuf>,
        cache: &mut AHashMap<PathBuf, File<'z>>,
        seed: &mut NameSeed,
        out: &mut Vec<TopLevel<'z>>,
    ) -> Result<(), CompileError> {
        for item in file.items {
            let TopLevel::Include { path: raw, .. } = *item else {
                out.push(*item);
                continue;
            };
            if depth > repo.include_depth_limit {
                return Err(CompileError::IncludeDepthExceeded { path: raw.to_string(), limit: repo.include_depth_limit });
            }
            let resolved = repo.resolve(raw, folder)?;
            if stack.contains(&resolved) {
                let mut chain: Vec<String> = stack.iter().map(|p| p.display().to_string()).collect();
                chain.push(resolved.display().to_string());
                return Err(CompileError::IncludeCycle { path: resolved.display().to_string(), chain });
            }
            let included = Self::load_and_parse(zone, repo, &resolved, seed, cache)?;
            stack.push(resolved.clone());
            Self::flatten_file(zone, repo, &included, resolved.parent(), depth + 1, stack, cache, seed, out)?;
            stack.pop();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FixtureLoader(HashMap<String, String>);

    impl SourceLoader for FixtureLoader {
        fn load(&self, resolved_path: &Path) -> std::io::Result<String> {
            self.0
                .get(&resolved_path.display().to_string())
                .cloned()
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "fixture not found"))
        }
    }

    fn repo(files: &[(&str, &str)]) -> SourceRepo {
        let map = files.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        SourceRepo::new(Box::new(FixtureLoader(map)), false, 16)
    }

    #[test]
    fn flattens_a_single_include_in_place() {
        let zone = Zone::new();
        let repo = repo(&[
            ("./main.vcl", "vcl 4.0; include \"lib.vcl\"; sub vcl_recv { return(ok); }"),
            ("./lib.vcl", "vcl 4.0; sub vcl_hash { return(ok); }"),
        ]);
        let (unit, _) = CompilationUnit::build(&zone, &repo, "main.vcl", None, NameSeed(0)).unwrap();
        assert_eq!(unit.subs.len(), 2);
        assert!(unit.subs.iter().any(|s| s.name == "vcl_hash"));
        assert!(unit.subs.iter().any(|s| s.name == "vcl_recv"));
    }

    #[test]
    fn groups_same_named_subs_in_visitation_order() {
        let zone = Zone::new();
        let repo = repo(&[
            ("./main.vcl", "vcl 4.0; sub vcl_recv { set req.url = \"/a\"; } include \"more.vcl\";"),
            ("./more.vcl", "vcl 4.0; sub vcl_recv { set req.url = \"/b\"; }"),
        ]);
        let (unit, _) = CompilationUnit::build(&zone, &repo, "main.vcl", None, NameSeed(0)).unwrap();
        assert_eq!(unit.subs.len(), 1);
        assert_eq!(unit.subs[0].bodies.len(), 2);
    }

    #[test]
    fn conflicting_sub_arity_is_a_compile_error() {
        let zone = Zone::new();
        let repo = repo(&[
            ("./main.vcl", "vcl 4.0; sub vcl_recv { return(ok); } include \"more.vcl\";"),
            ("./more.vcl", "vcl 4.0; sub vcl_recv(x) { return(ok); }"),
        ]);
        let err = CompilationUnit::build(&zone, &repo, "main.vcl", None, NameSeed(0)).unwrap_err();
        assert!(matches!(err, CompileError::ConflictingSubSignature { .. }));
    }

    #[test]
    fn cyclic_include_is_a_compile_error() {
        let zone = Zone::new();
        let repo = repo(&[
            ("./a.vcl", "vcl 4.0; include \"b.vcl\";"),
            ("./b.vcl", "vcl 4.0; include \"a.vcl\";"),
        ]);
        let err = CompilationUnit::build(&zone, &repo, "a.vcl", None, NameSeed(0)).unwrap_err();
        assert!(matches!(err, CompileError::IncludeCycle { .. }));
    }

    #[test]
    fn include_depth_ceiling_is_enforced() {
        let zone = Zone::new();
        let map = [
            ("./a.vcl".to_string(), "vcl 4.0; include \"b.vcl\";".to_string()),
            ("./b.vcl".to_string(), "vcl 4.0; include \"c.vcl\";".to_string()),
            ("./c.vcl".to_string(), "vcl 4.0;".to_string()),
        ]
        .into_iter()
        .collect();
        let repo = SourceRepo::new(Box::new(FixtureLoader(map)), false, 1);
        let err = CompilationUnit::build(&zone, &repo, "a.vcl", None, NameSeed(0)).unwrap_err();
        assert!(matches!(err, CompileError::IncludeDepthExceeded { .. }));
    }

    #[test]
    fn absolute_include_is_rejected_by_default() {
        let zone = Zone::new();
        let repo = repo(&[("./main.vcl", "vcl 4.0; include \"/etc/evil.vcl\";")]);
        let err = CompilationUnit::build(&zone, &repo, "main.vcl", None, NameSeed(0)).unwrap_err();
        assert!(matches!(err, CompileError::AbsoluteIncludeDisallowed { .. }));
    }

    #[test]
    fn diamond_include_parses_the_shared_file_once() {
        let zone = Zone::new();
        let repo = repo(&[
            ("./main.vcl", "vcl 4.0; include \"left.vcl\"; include \"right.vcl\";"),
            ("./left.vcl", "vcl 4.0; global G1 = 1;"),
            ("./right.vcl", "vcl 4.0; include \"shared.vcl\";"),
            ("./shared.vcl", "vcl 4.0; global G2 = 2;"),
        ]);
        let (unit, _) = CompilationUnit::build(&zone, &repo, "main.vcl", None, NameSeed(0)).unwrap();
        assert_eq!(unit.globals.len(), 2);
    }
}
