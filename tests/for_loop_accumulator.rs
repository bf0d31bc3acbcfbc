//! A `for` loop accumulating over a list literal (§8 scenario 3).

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
fn for_loop_over_a_list_literal_sums_to_fifteen() {
    let src = r#"
        vcl 4.0;
        sub vcl_recv {
            declare total = 0;
            for (k, v : [1, 2, 3, 4, 5]) {
                set total += v;
            }
            return(total);
        }
    "#;
    let repo = SourceRepo::new(Box::new(OneFile(src)), false, 16);
    let engine = Engine::new();
    let module = engine.load(&repo, "main.vcl", None).unwrap();
    let mut ctx = Context::new(&engine, module, Default::default());
    ctx.initialize();

    match ctx.invoke("vcl_recv", &[]) {
        RunStatus::Ok(Value::Int(15)) => {}
        other => panic!("expected Ok(15), got {other:?}"),
    }
}
