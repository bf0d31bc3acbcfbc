//! Overwriting a local repeatedly across hundreds of loop iterations drops
//! the previous string on every pass, forcing at least one GC cycle
//! mid-execution (`GcParams::default().min_allocation_gap` is 256) well
//! before the call completes. The interpreter must come out the other side
//! with the right answer and no heap corruption.

use std::path::Path;

use vclrs::source_repo::{SourceLoader, SourceRepo};
use vclrs::{Context, Engine, RunStatus, Value};

struct OneFile(String);
impl SourceLoader for OneFile {
    fn load(&self, _path: &Path) -> std::io::Result<String> {
        Ok(self.0.clone())
    }
}

#[test]
fn repeated_string_churn_survives_a_mid_execution_gc_cycle() {
    let items: Vec<String> = (1..=300).map(|i| i.to_string()).collect();
    let src = format!(
        "vcl 4.0; sub make_garbage {{ declare s = \"\"; for (k, v : [{}]) {{ set s = str(v); }} return(s); }}",
        items.join(", ")
    );
    let repo = SourceRepo::new(Box::new(OneFile(src)), false, 16);
    let engine = Engine::new();
    let module = engine.load(&repo, "main.vcl", None).unwrap();
    let mut ctx = Context::new(&engine, module, Default::default());
    ctx.initialize();

    match ctx.invoke("make_garbage", &[]) {
        RunStatus::Ok(Value::String(_)) => {}
        other => panic!("expected a string result surviving GC, got {other:?}"),
    }
}
