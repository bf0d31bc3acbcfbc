//! Globals run as real init-procedure bytecode, not constant-folded away
//! end to end (§8 scenario 1): `b` and `c` both read an earlier global.

use std::path::Path;

use vclrs::source_repo::{SourceLoader, SourceRepo};
use vclrs::{Context, Engine, RunStatus, Value};

struct OneFile(&'static str);
impl SourceLoader for OneFile {
    fn load(&self, _path: &Path) -> std::io::Result<String> {
        Ok(self.0.to_string())
    }
}

#[test]
fn globals_run_as_real_init_bytecode() {
    let src = "vcl 4.0; global a = 10; global b = a * 100; global c = a + b * 2;";
    let repo = SourceRepo::new(Box::new(OneFile(src)), false, 16);
    let engine = Engine::new();
    let module = engine.load(&repo, "main.vcl", None).unwrap();
    let mut ctx = Context::new(&engine, module, Default::default());

    let status = ctx.initialize();
    assert!(matches!(status, RunStatus::Ok(_)), "init failed: {status:?}");

    assert_eq!(ctx.get_global("a"), Some(Value::Int(10)));
    assert_eq!(ctx.get_global("b"), Some(Value::Int(1000)));
    assert_eq!(ctx.get_global("c"), Some(Value::Int(2010)));
}
