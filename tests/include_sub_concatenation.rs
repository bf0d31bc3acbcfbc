//! `include`-flattened same-named `sub`s concatenate their bodies in
//! visitation order; a conflicting arity across the two files is a compile
//! error instead (§4.5, §8 scenario 6).

use std::collections::HashMap;
use std::path::Path;

use vclrs::error::CompileError;
use vclrs::source_repo::{SourceLoader, SourceRepo};
use vclrs::{Context, Engine, RunStatus, Value};

struct FixtureLoader(HashMap<String, String>);
impl SourceLoader for FixtureLoader {
    fn load(&self, resolved_path: &Path) -> std::io::Result<String> {
        self.0
            .get(&resolved_path.display().to_string())
            .cloned()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "fixture not found"))
    }
}

fn fixture(files: &[(&str, &str)]) -> SourceRepo {
    let map = files.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    SourceRepo::new(Box::new(FixtureLoader(map)), false, 16)
}

#[test]
fn same_named_subs_across_an_include_concatenate_their_bodies() {
    let repo = fixture(&[
        ("./main.vcl", "vcl 4.0; include \"more.vcl\"; global counter = 0; sub vcl_recv { set counter += 1; }"),
        ("./more.vcl", "vcl 4.0; sub vcl_recv { set counter += 10; }"),
    ]);
    let engine = Engine::new();
    let module = engine.load(&repo, "main.vcl", None).unwrap();
    let mut ctx = Context::new(&engine, module, Default::default());
    ctx.initialize();

    let status = ctx.invoke("vcl_recv", &[]);
    assert!(matches!(status, RunStatus::Ok(_)), "invoke failed: {status:?}");
    assert_eq!(ctx.get_global("counter"), Some(Value::Int(11)));
}

#[test]
fn conflicting_sub_arity_across_an_include_is_a_compile_error() {
    let repo = fixture(&[
        ("./main.vcl", "vcl 4.0; include \"more.vcl\"; sub vcl_recv { return(ok); }"),
        ("./more.vcl", "vcl 4.0; sub vcl_recv(x) { return(ok); }"),
    ]);
    let engine = Engine::new();
    let err = engine.load(&repo, "main.vcl", None).unwrap_err();
    assert!(matches!(err, CompileError::ConflictingSubSignature { .. }));
}
