//! Module dependency resolution and blob assembly.
//!
//! The compiler itself is a black box behind the [`Compiler`] trait; this
//! module walks the import graph from `__main__`, compiles every module it
//! can resolve on disk, and concatenates the records into the multi-module
//! blob the hub expects.

use std::collections::HashSet;
use std::path::PathBuf;

use hublink_proto::append_module;

use crate::error::Error;

pub const MAIN_MODULE: &str = "__main__";
pub const MAIN_MODULE_PATH: &str = "__main__.py";

/// One unit of compilation
#[derive(Debug, Clone)]
pub struct Module {
    /// Dotted import path, e.g. `pkg.helper`
    pub name: String,
    /// Path relative to the program folder, e.g. `pkg/helper.py`
    pub path: String,
    pub source: String,
}

/// Compiles one module to .mpy bytes. A non-zero compiler status is fatal
/// for the whole build.
pub trait Compiler {
    fn compile(&self, path: &str, source: &str) -> Result<Vec<u8>, Error>;
}

/// Where module source files come from. The disk implementation is
/// [`DirModuleSource`]; tests use an in-memory map.
pub trait ModuleSource {
    fn read(&self, relative_path: &str) -> Option<String>;
}

/// Reads modules relative to the main program's folder
pub struct DirModuleSource {
    root: PathBuf,
}

impl DirModuleSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirModuleSource { root: root.into() }
    }
}

impl ModuleSource for DirModuleSource {
    fn read(&self, relative_path: &str) -> Option<String> {
        std::fs::read_to_string(self.root.join(relative_path)).ok()
    }
}

/// Dotted module paths referenced by `import a.b as c, d` and
/// `from a.b import x` statements, in order of first appearance.
pub fn find_imports(source: &str) -> Vec<String> {
    let mut modules = Vec::new();
    for line in source.lines() {
        let line = line.trim_start();
        if let Some(rest) = line.strip_prefix("import ") {
            for part in rest.split(',') {
                // `a.b as c` keeps only the module path
                if let Some(name) = part.split_whitespace().next() {
                    push_unique(&mut modules, name);
                }
            }
        } else if let Some(rest) = line.strip_prefix("from ") {
            if let Some(name) = rest.split_whitespace().next() {
                push_unique(&mut modules, name);
            }
        }
    }
    modules
}

fn push_unique(modules: &mut Vec<String>, name: &str) {
    if !modules.iter().any(|m| m == name) {
        modules.push(name.to_string());
    }
}

/// Compile `__main__` and every resolvable imported module into one blob.
/// Worklist with a visited set keyed by module name, so import cycles and
/// duplicates are handled without recursion. An import that cannot be read
/// from `sources` is taken to be a built-in and skipped silently.
pub fn build_blob(
    main_source: &str,
    sources: &dyn ModuleSource,
    compiler: &dyn Compiler,
) -> Result<Vec<u8>, Error> {
    let mut blob = Vec::new();
    let mut visited: HashSet<String> = HashSet::new();
    let mut worklist = vec![Module {
        name: MAIN_MODULE.to_string(),
        path: MAIN_MODULE_PATH.to_string(),
        source: main_source.to_string(),
    }];

    while let Some(module) = worklist.pop() {
        if !visited.insert(module.name.clone()) {
            continue;
        }
        for import in find_imports(&module.source) {
            if visited.contains(&import) {
                continue;
            }
            match resolve(sources, &import) {
                Some(dependency) => worklist.push(dependency),
                None => {
                    visited.insert(import);
                }
            }
        }

        let mpy = compiler.compile(&module.path, &module.source)?;
        append_module(&mut blob, &module.name, &mpy);
    }
    Ok(blob)
}

fn resolve(sources: &dyn ModuleSource, name: &str) -> Option<Module> {
    // a leading dot would map to an absolute path and the lookup would
    // leave the program folder; relative imports are not supported
    if name.starts_with('.') {
        return None;
    }
    let relative_path = format!("{}.py", name.replace('.', "/"));
    let source = sources.read(&relative_path)?;
    Some(Module { name: name.to_string(), path: relative_path, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapSource(HashMap<&'static str, &'static str>);

    impl ModuleSource for MapSource {
        fn read(&self, relative_path: &str) -> Option<String> {
            self.0.get(relative_path).map(|s| s.to_string())
        }
    }

    /// Compiles to the module path bytes, so records are recognizable
    struct FakeCompiler;

    impl Compiler for FakeCompiler {
        fn compile(&self, path: &str, _source: &str) -> Result<Vec<u8>, Error> {
            Ok(path.as_bytes().to_vec())
        }
    }

    fn record_names(blob: &[u8]) -> Vec<String> {
        let mut names = Vec::new();
        let mut pos = 0;
        while pos < blob.len() {
            let len =
                u32::from_le_bytes([blob[pos], blob[pos + 1], blob[pos + 2], blob[pos + 3]])
                    as usize;
            pos += 4;
            let nul = blob[pos..].iter().position(|&b| b == 0).unwrap();
            names.push(String::from_utf8(blob[pos..pos + nul].to_vec()).unwrap());
            pos += nul + 1 + len;
        }
        names
    }

    #[test]
    fn finds_import_forms() {
        let source = "import hub\nimport pkg.helper as h, other\nfrom tools import x, y\nx = 1\n";
        assert_eq!(find_imports(source), vec!["hub", "pkg.helper", "other", "tools"]);
    }

    #[test]
    fn main_record_comes_first() {
        let sources = MapSource(HashMap::from([("helper.py", "x = 1\n")]));
        let blob = build_blob("import helper\n", &sources, &FakeCompiler).unwrap();
        assert_eq!(record_names(&blob), vec!["__main__", "helper"]);
    }

    #[test]
    fn cycles_and_duplicates_compile_once() {
        let sources = MapSource(HashMap::from([
            ("a.py", "import b\nimport a\n"),
            ("b.py", "import a\n"),
        ]));
        let blob = build_blob("import a\nimport b\n", &sources, &FakeCompiler).unwrap();
        let mut names = record_names(&blob);
        assert_eq!(names.remove(0), "__main__");
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn unresolvable_imports_are_skipped_silently() {
        let sources = MapSource(HashMap::new());
        let blob = build_blob("from pybricks.hubs import PrimeHub\nimport umath\n", &sources, &FakeCompiler)
            .unwrap();
        assert_eq!(record_names(&blob), vec!["__main__"]);
    }

    #[test]
    fn relative_imports_never_leave_the_program_folder() {
        // "/mod.py" is the path ".mod" would map to if the leading dot were
        // translated; it must not be looked up at all
        let sources = MapSource(HashMap::from([("/mod.py", "z = 3\n")]));
        let blob = build_blob("from .mod import x\n", &sources, &FakeCompiler).unwrap();
        assert_eq!(record_names(&blob), vec!["__main__"]);
    }

    #[test]
    fn dotted_imports_resolve_to_nested_paths() {
        let sources = MapSource(HashMap::from([("pkg/helper.py", "y = 2\n")]));
        let blob = build_blob("import pkg.helper\n", &sources, &FakeCompiler).unwrap();
        assert_eq!(record_names(&blob), vec!["__main__", "pkg.helper"]);
    }

    #[test]
    fn compile_failure_aborts_the_build() {
        struct FailingCompiler;
        impl Compiler for FailingCompiler {
            fn compile(&self, path: &str, _source: &str) -> Result<Vec<u8>, Error> {
                Err(Error::Compile { module: path.to_string(), reason: "status 1".to_string() })
            }
        }
        assert!(build_blob("x = 1\n", &MapSource(HashMap::new()), &FailingCompiler).is_err());
    }
}
