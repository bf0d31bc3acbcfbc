//! Nested list/dict indexing and dot-property access, read back through
//! script-level comparisons rather than a heap peek (§8 scenarios 2 and 4):
//! the host boundary only ever sees primitive `Value`s, so the crate's own
//! `==`/`&&` bytecode is what proves the contents are right.

use std::path::Path;

use vclrs::source_repo::{SourceLoader, SourceRepo};
use vclrs::{Context, Engine, RunStatus, Value};

struct OneFile(&'static str);
impl SourceLoader for OneFile {
    fn load(&self, _path: &Path) -> std::io::Result<String> {
        Ok(self.0.to_string())
    }
}

fn run(src: &'static str) -> RunStatus {
    let repo = SourceRepo::new(Box::new(OneFile(src)), false, 16);
    let engine = Engine::new();
    let module = engine.load(&repo, "main.vcl", None).unwrap();
    let mut ctx = Context::new(&engine, module, Default::default());
    ctx.initialize();
    ctx.invoke("vcl_recv", &[])
}

#[test]
fn nested_list_and_dict_indexing_reads_the_expected_values() {
    let src = r#"
        vcl 4.0;
        global data = {"items": [1, 2, 3], "nested": {"f": 5}};
        sub vcl_recv {
            declare a = "string";
            declare c = data.items[0];
            declare f = data.nested.f;
            declare ok = (a == "string") && (c == 1) && (f == 5);
            return(ok);
        }
    "#;
    match run(src) {
        RunStatus::Ok(Value::Bool(true)) => {}
        other => panic!("expected Ok(true), got {other:?}"),
    }
}

#[test]
fn dict_literal_properties_are_reachable_by_dot_access() {
    let src = r#"
        vcl 4.0;
        global point = {"x": 7, "y": true};
        sub vcl_recv {
            declare ok = (point.x == 7) && (point.y == true);
            return(ok);
        }
    "#;
    match run(src) {
        RunStatus::Ok(Value::Bool(true)) => {}
        other => panic!("expected Ok(true), got {other:?}"),
    }
}
