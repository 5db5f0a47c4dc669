//! # Bundle: Compiled, Immutable Script + Module Graph
//!
//! This module provides the core compilation pipeline for the runtime: it
//! resolves a script's `import` graph through the filesystem map, flattens
//! the result into one compiled unit, and extracts the declared `options`.
//!
//! ## Why flatten the module graph?
//!
//! The embedded scripting engine (`rhai`, see [`crate::engine`]) compiles a
//! single source string into one [`rhai::AST`]; its own module system treats
//! imported modules as frozen, stateless namespaces and has no notion of a
//! live-binding import cycle. Rather than bolt a second module system on top
//! (which `rhai`'s sandboxing model actively resists), `Bundle::compile`
//! does what a JS bundler (esbuild, Rollup, and k6's own bundler — the name
//! this type borrows) already does: it resolves the dependency graph once,
//! topologically orders acyclic dependencies, merges any cyclic strongly
//! connected component into one unit (mutual top-level `fn` calls resolve
//! regardless of declaration order inside a single `rhai::AST`), and
//! compiles the concatenated result exactly once. This is recorded as a
//! resolved Open Question in `DESIGN.md`.
//!
//! Per-VU *mutable* module state (the other half of the module-graph
//! contract) is deliberately not modeled at the script-source level — `rhai`
//! functions do not close over outer scope by design. It is instead modeled
//! natively, through the custom module registry (see [`crate::registry`]),
//! which is how the spec's own §4.5 says per-VU extension state should be
//! supplied.
//!
//! ## Import syntax
//!
//! `Bundle::compile` does not parse the scripting language (a stated
//! non-goal); it recognizes exactly one line form via a textual scan:
//!
//! ```text
//! import "relative/path.rhai";
//! ```
//!
//! and strips these lines in forming the compiled unit. Anything else is
//! passed through to `rhai` untouched.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use rhai::Engine;
use vu_types::{Archive, CompatibilityMode, Options, RunnerError};

use crate::fs::VirtualFilesystem;

const IMPORT_PREFIX: &str = "import \"";

/// One resolved module: its path, raw source, and the import lines found in
/// it (already resolved to paths, in source order).
#[derive(Debug, Clone)]
struct ResolvedModule {
    path: String,
    source: String,
    imports: Vec<String>,
}

/// Scan `source` for `import "path";` lines, returning the resolved import
/// paths (in appearance order) and the source with those lines removed.
fn scan_imports(base_dir: &str, source: &str) -> (Vec<String>, String) {
    let mut imports = Vec::new();
    let mut kept = String::with_capacity(source.len());
    for line in source.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix(IMPORT_PREFIX) {
            if let Some(end) = rest.find('"') {
                let target = &rest[..end];
                imports.push(resolve_relative(base_dir, target));
                continue;
            }
        }
        kept.push_str(line);
        kept.push('\n');
    }
    (imports, kept)
}

fn resolve_relative(base_dir: &str, target: &str) -> String {
    if target.starts_with('/') || base_dir.is_empty() {
        return target.trim_start_matches('/').to_string();
    }
    format!("{base_dir}/{target}")
}

fn dirname(path: &str) -> String {
    match path.rfind('/') {
        Some(idx) => path[..idx].to_string(),
        None => String::new(),
    }
}

/// Detects a bare top-level `return` (not nested inside a `{ ... }` block
/// opened by this same module, e.g. inside a `fn`). This is a line-oriented
/// heuristic, consistent with the stated non-goal of parsing the scripting
/// language; it is sufficient to distinguish the two edge cases `spec.md`
/// §4.1 calls out.
fn find_top_level_return(source: &str) -> Option<usize> {
    let mut depth: i32 = 0;
    for (lineno, line) in source.lines().enumerate() {
        let trimmed = line.trim();
        if depth == 0 && (trimmed == "return;" || trimmed.starts_with("return ")) {
            return Some(lineno + 1);
        }
        for ch in line.chars() {
            match ch {
                '{' => depth += 1,
                '}' => depth -= 1,
                _ => {}
            }
        }
    }
    None
}

/// Recursively resolve `path` and everything it imports, accumulating
/// modules in `modules` and building `edges` (path -> its direct imports).
/// Detects `DirectoryTraversalError`/missing-module failures eagerly.
fn collect_modules(
    path: &str,
    filesystems: &HashMap<String, Box<dyn VirtualFilesystem>>,
    scheme: &str,
    modules: &mut BTreeMap<String, ResolvedModule>,
    edges: &mut HashMap<String, Vec<String>>,
) -> Result<(), RunnerError> {
    if modules.contains_key(path) {
        return Ok(());
    }
    let fs = filesystems
        .get(scheme)
        .ok_or_else(|| RunnerError::compile(path, format!("no filesystem registered for scheme `{scheme}`")))?;
    let bytes = fs.read(path)?;
    let source = String::from_utf8(bytes)
        .map_err(|e| RunnerError::compile(path, format!("module is not valid UTF-8: {e}")))?;
    let (imports, stripped) = scan_imports(&dirname(path), &source);

    // Insert a placeholder first so a cycle back to `path` is detected as
    // "already visited" rather than infinitely recursing.
    modules.insert(
        path.to_string(),
        ResolvedModule {
            path: path.to_string(),
            source: stripped,
            imports: imports.clone(),
        },
    );
    edges.insert(path.to_string(), imports.clone());

    for dep in &imports {
        if !fs.exists(dep) {
            return Err(RunnerError::compile(
                dep.clone(),
                format!("required by `{path}`, but does not exist"),
            ));
        }
        collect_modules(dep, filesystems, scheme, modules, edges)?;
    }
    Ok(())
}

/// Tarjan-lite SCC grouping: returns groups of mutually-cyclic module paths,
/// each group ordered by first-discovery (DFS preorder) for determinism.
/// Acyclic modules each form their own singleton group, emitted in
/// dependency-first (topological) order.
fn topological_groups(entry: &str, edges: &HashMap<String, Vec<String>>) -> Vec<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let mut mark: HashMap<String, Mark> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    let mut stack: Vec<String> = Vec::new();
    let mut on_stack: BTreeSet<String> = BTreeSet::new();
    let mut groups: Vec<Vec<String>> = Vec::new();
    let mut grouped: BTreeSet<String> = BTreeSet::new();

    fn visit(
        node: &str,
        edges: &HashMap<String, Vec<String>>,
        mark: &mut HashMap<String, Mark>,
        stack: &mut Vec<String>,
        on_stack: &mut BTreeSet<String>,
        order: &mut Vec<String>,
    ) {
        match mark.get(node).copied().unwrap_or(Mark::Unvisited) {
            Mark::Done => return,
            Mark::InProgress => return,
            Mark::Unvisited => {}
        }
        mark.insert(node.to_string(), Mark::InProgress);
        stack.push(node.to_string());
        on_stack.insert(node.to_string());
        if let Some(deps) = edges.get(node) {
            for dep in deps {
                visit(dep, edges, mark, stack, on_stack, order);
            }
        }
        mark.insert(node.to_string(), Mark::Done);
        order.push(node.to_string());
    }

    visit(entry, edges, &mut mark, &mut stack, &mut on_stack, &mut order);

    // `order` is now a valid postorder (dependencies before dependents,
    // modulo cycles). Walk it, merging any node with a cyclic back-edge
    // into the group of the earliest ancestor it points back to.
    for node in &order {
        if grouped.contains(node) {
            continue;
        }
        // Find every node reachable from `node` that also reaches back to
        // `node` (i.e. participates in a cycle with it).
        let mut group = vec![node.clone()];
        grouped.insert(node.clone());
        if let Some(deps) = edges.get(node) {
            for dep in deps {
                if reaches(dep, node, edges) && !grouped.contains(dep) {
                    group.push(dep.clone());
                    grouped.insert(dep.clone());
                }
            }
        }
        groups.push(group);
    }
    groups
}

fn reaches(from: &str, to: &str, edges: &HashMap<String, Vec<String>>) -> bool {
    let mut seen = BTreeSet::new();
    let mut stack = vec![from.to_string()];
    while let Some(node) = stack.pop() {
        if node == to {
            return true;
        }
        if !seen.insert(node.clone()) {
            continue;
        }
        if let Some(deps) = edges.get(&node) {
            stack.extend(deps.iter().cloned());
        }
    }
    false
}

/// Compiled, immutable representation of a script and its module graph.
/// Shared read-only by every VU derived from it; see `spec.md` §3.
#[derive(Clone, Debug)]
pub struct Bundle {
    entrypoint: String,
    /// Every module's raw (import-lines-stripped) source, keyed by resolved
    /// path. Kept for `MakeArchive` and for re-instantiation.
    module_sources: BTreeMap<String, String>,
    /// The flattened source actually compiled: topologically-ordered
    /// concatenation of every module, cycle groups merged together.
    merged_source: String,
    /// Shared compiled AST. `Instantiate` reloads it into a fresh engine and
    /// scope; the AST itself is immutable and has no per-VU state.
    program: Arc<rhai::AST>,
    exported_names: Vec<String>,
    options: Options,
}

impl Bundle {
    /// Compile `source` (and everything it transitively imports, resolved
    /// through `filesystems`) into a `Bundle`. See `spec.md` §4.1.
    pub fn compile(
        entry_url: &str,
        entry_bytes: &[u8],
        filesystems: HashMap<String, Box<dyn VirtualFilesystem>>,
        compatibility_mode: CompatibilityMode,
    ) -> Result<Self, RunnerError> {
        let scheme = entry_url.split(':').next().unwrap_or("file");
        let entry_path = entry_url
            .splitn(2, ':')
            .nth(1)
            .unwrap_or(entry_url)
            .trim_start_matches("//")
            .to_string();

        let mut modules: BTreeMap<String, ResolvedModule> = BTreeMap::new();
        let mut edges: HashMap<String, Vec<String>> = HashMap::new();

        // Seed the graph with the entry module's own bytes rather than
        // re-reading it through the filesystem, then recurse into its
        // imports using the same filesystem map.
        let entry_source = String::from_utf8(entry_bytes.to_vec())
            .map_err(|e| RunnerError::compile(&entry_path, format!("entry is not valid UTF-8: {e}")))?;
        let (entry_imports, entry_stripped) = scan_imports(&dirname(&entry_path), &entry_source);
        modules.insert(
            entry_path.clone(),
            ResolvedModule {
                path: entry_path.clone(),
                source: entry_stripped,
                imports: entry_imports.clone(),
            },
        );
        edges.insert(entry_path.clone(), entry_imports.clone());
        for dep in &entry_imports {
            let fs = filesystems.get(scheme).ok_or_else(|| {
                RunnerError::compile(&entry_path, format!("no filesystem registered for scheme `{scheme}`"))
            })?;
            if !fs.exists(dep) {
                return Err(RunnerError::compile(
                    dep.clone(),
                    format!("required by `{entry_path}`, but does not exist"),
                ));
            }
            collect_modules(dep, &filesystems, scheme, &mut modules, &mut edges)?;
        }

        // Compatibility-mode check: a bare top-level `return` is legal only
        // in Base mode, where we wrap the module body in an IIFE.
        for module in modules.values_mut() {
            if let Some(lineno) = find_top_level_return(&module.source) {
                match compatibility_mode {
                    CompatibilityMode::Base => {
                        module.source = format!(
                            "(|| {{\n{}\n}})();\n",
                            module.source.trim_end()
                        );
                    }
                    CompatibilityMode::Extended => {
                        return Err(RunnerError::compile(
                            module.path.clone(),
                            format!("illegal top-level `return` at line {lineno} under extended compatibility mode"),
                        ));
                    }
                }
            }
        }

        let groups = topological_groups(&entry_path, &edges);
        let mut merged_source = String::new();
        for group in &groups {
            for path in group {
                if let Some(module) = modules.get(path) {
                    merged_source.push_str(&format!("// module: {path}\n"));
                    merged_source.push_str(&module.source);
                    merged_source.push('\n');
                }
            }
        }

        let engine = Engine::new();
        let program = engine
            .compile(&merged_source)
            .map_err(|e| RunnerError::compile(&entry_path, e.to_string()))?;

        let exported_names: Vec<String> = program
            .iter_functions()
            .map(|f| f.name.to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let options = extract_options(&engine, &program)?;

        let module_sources = modules
            .into_iter()
            .map(|(k, v)| (k, v.source))
            .collect::<BTreeMap<_, _>>();

        Ok(Bundle {
            entrypoint: entry_path,
            module_sources,
            merged_source,
            program: Arc::new(program),
            exported_names,
            options,
        })
    }

    /// Reconstruct a `Bundle` from a previously exported `Archive`, without
    /// touching any original filesystem. `spec.md` §4.1's round-trip
    /// invariant (P3): `Bundle(source)` and
    /// `Bundle(FromArchive(Bundle(source).MakeArchive()))` must expose
    /// identical exports and options.
    pub fn from_archive(archive: &Archive) -> Result<Self, RunnerError> {
        let fs = crate::fs::MemoryFilesystem::new();
        let fs = archive
            .files
            .iter()
            .fold(fs, |fs, (path, bytes)| fs.with_file(path.clone(), bytes.clone()));
        let mut filesystems: HashMap<String, Box<dyn VirtualFilesystem>> = HashMap::new();
        filesystems.insert("file".to_string(), Box::new(fs));
        let entry_bytes = archive
            .entry_source()
            .ok_or_else(|| RunnerError::compile(&archive.entrypoint, "archive missing entrypoint source"))?
            .to_vec();
        let mut bundle = Self::compile(
            &format!("file:{}", archive.entrypoint),
            &entry_bytes,
            filesystems,
            archive.options.compatibility_mode,
        )?;
        bundle.options = archive.options.clone();
        Ok(bundle)
    }

    /// Render this bundle as a portable archive: every module source plus
    /// the resolved options and entry point.
    pub fn make_archive(&self) -> Archive {
        let mut archive = Archive::new(self.entrypoint.clone(), self.options.clone());
        for (path, source) in &self.module_sources {
            archive = archive.with_file(path.clone(), source.clone().into_bytes());
        }
        archive
    }

    pub fn entrypoint(&self) -> &str {
        &self.entrypoint
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn exported_names(&self) -> &[String] {
        &self.exported_names
    }

    /// Replace this bundle's resolved options, e.g. with the result of
    /// `Options::merged_with` in `Runner::set_options`.
    pub(crate) fn set_options(&mut self, options: Options) {
        self.options = options;
    }

    pub fn has_export(&self, name: &str) -> bool {
        self.exported_names.iter().any(|n| n == name)
    }

    pub(crate) fn program(&self) -> Arc<rhai::AST> {
        self.program.clone()
    }
}

/// Evaluate the bundle's optional `options()` function once, on a
/// throwaway engine/scope, and deserialize its returned map into an
/// `Options` record. Absence of the function yields `Options::default()`.
fn extract_options(engine: &Engine, program: &rhai::AST) -> Result<Options, RunnerError> {
    if !program.iter_functions().any(|f| f.name == "options") {
        return Ok(Options::default());
    }
    let mut scope = rhai::Scope::new();
    let dynamic: rhai::Dynamic = engine
        .call_fn(&mut scope, program, "options", ())
        .map_err(|e| RunnerError::compile("options", e.to_string()))?;
    rhai::serde::from_dynamic(&dynamic)
        .map_err(|e| RunnerError::compile("options", format!("invalid options record: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFilesystem;

    fn fs_with(files: &[(&str, &str)]) -> HashMap<String, Box<dyn VirtualFilesystem>> {
        let mut mem = MemoryFilesystem::new();
        for (path, src) in files {
            mem = mem.with_file(*path, src.as_bytes().to_vec());
        }
        let mut map: HashMap<String, Box<dyn VirtualFilesystem>> = HashMap::new();
        map.insert("file".to_string(), Box::new(mem));
        map
    }

    #[test]
    fn compiles_entry_with_no_imports() {
        let bundle = Bundle::compile(
            "file:main.rhai",
            b"fn default() { 1 }",
            fs_with(&[]),
            CompatibilityMode::Extended,
        )
        .unwrap();
        assert!(bundle.has_export("default"));
    }

    #[test]
    fn missing_import_is_a_compile_error_not_a_panic() {
        let err = Bundle::compile(
            "file:main.rhai",
            b"import \"lib/missing.rhai\";\nfn default() {}",
            fs_with(&[]),
            CompatibilityMode::Extended,
        )
        .unwrap_err();
        assert!(matches!(err, RunnerError::Compile { .. }));
    }

    #[test]
    fn directory_traversal_is_rejected() {
        let fs = DirTraversalFs;
        let mut map: HashMap<String, Box<dyn VirtualFilesystem>> = HashMap::new();
        map.insert("file".to_string(), Box::new(fs));
        let err = Bundle::compile(
            "file:main.rhai",
            b"import \"../../etc/passwd\";\nfn default() {}",
            map,
            CompatibilityMode::Extended,
        )
        .unwrap_err();
        assert!(matches!(err, RunnerError::Compile { .. }));
    }

    struct DirTraversalFs;
    impl VirtualFilesystem for DirTraversalFs {
        fn read(&self, path: &str) -> Result<Vec<u8>, RunnerError> {
            if path.contains("..") {
                return Err(RunnerError::DirectoryTraversal {
                    requested: path.to_string(),
                    root: "/".to_string(),
                });
            }
            Ok(b"fn default(){}".to_vec())
        }
        fn exists(&self, path: &str) -> bool {
            !path.contains("..") || true
        }
    }

    #[test]
    fn extended_mode_rejects_top_level_return() {
        let err = Bundle::compile(
            "file:main.rhai",
            b"let x = 1;\nreturn;\nfn default() {}",
            fs_with(&[]),
            CompatibilityMode::Extended,
        )
        .unwrap_err();
        assert!(matches!(err, RunnerError::Compile { .. }));
    }

    #[test]
    fn base_mode_accepts_top_level_return() {
        let bundle = Bundle::compile(
            "file:main.rhai",
            b"let x = 1;\nreturn;\nfn default() {}",
            fs_with(&[]),
            CompatibilityMode::Base,
        )
        .unwrap();
        assert!(bundle.has_export("default"));
    }

    #[test]
    fn cyclic_modules_merge_and_mutually_recurse() {
        let files = fs_with(&[
            (
                "a.rhai",
                "import \"b.rhai\";\nfn foo(x) { if x == () { \"foo\" + bar(3) } else { \"foo\" + x.to_string() } }",
            ),
            (
                "b.rhai",
                "import \"a.rhai\";\nfn bar(x) { if x == () { \"bar\" + foo(5) } else { \"bar\" + x.to_string() } }",
            ),
        ]);
        let bundle = Bundle::compile(
            "file:a.rhai",
            b"import \"b.rhai\";\nfn foo(x) { if x == () { \"foo\" + bar(3) } else { \"foo\" + x.to_string() } }",
            files,
            CompatibilityMode::Extended,
        )
        .unwrap();
        assert!(bundle.has_export("foo"));
        assert!(bundle.has_export("bar"));

        let engine = Engine::new();
        let mut scope = rhai::Scope::new();
        let program = bundle.program();
        let foo: String = engine.call_fn(&mut scope, &program, "foo", ()).unwrap();
        assert_eq!(foo, "foobar3");
        let bar: String = engine.call_fn(&mut scope, &program, "bar", ()).unwrap();
        assert_eq!(bar, "barfoo5");
    }

    #[test]
    fn archive_round_trips() {
        let bundle = Bundle::compile(
            "file:main.rhai",
            b"fn default() { 1 }\nfn options() { #{ rps: 5 } }",
            fs_with(&[]),
            CompatibilityMode::Extended,
        )
        .unwrap();
        let archive = bundle.make_archive();
        let rebuilt = Bundle::from_archive(&archive).unwrap();
        assert_eq!(bundle.exported_names(), rebuilt.exported_names());
        assert_eq!(bundle.options().rps, rebuilt.options().rps);
    }
}
