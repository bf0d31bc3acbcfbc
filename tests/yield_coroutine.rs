//! Host-registered `yield()`-style suspension (§5 "Suspension", §8 scenario
//! 5): a script calling a host function that returns `HostCall::Yield`
//! parks the whole `Context`, to be continued with `Context::resume`.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use vclrs::runtime::HostCall;
use vclrs::source_repo::{SourceLoader, SourceRepo};
use vclrs::{Context, Engine, RunStatus};

struct OneFile(&'static str);
impl SourceLoader for OneFile {
    fn load(&self, _path: &Path) -> std::io::Result<String> {
        Ok(self.0.to_string())
    }
}

#[test]
fn two_yields_resume_into_xxyy() {
    let src = "vcl 4.0; sub vcl_recv { pause(); pause(); return(ok); }";
    let repo = SourceRepo::new(Box::new(OneFile(src)), false, 16);
    let engine = Engine::new();
    let module = engine.load(&repo, "main.vcl", None).unwrap();
    let mut ctx = Context::new(&engine, module, Default::default());

    let log = Rc::new(RefCell::new(String::new()));
    let log_inner = Rc::clone(&log);
    let mut calls = 0;
    ctx.register_function("pause", move |_args| {
        calls += 1;
        log_inner.borrow_mut().push_str(if calls == 1 { "xx" } else { "yy" });
        HostCall::Yield
    })
    .unwrap();

    ctx.initialize();

    let status = ctx.invoke("vcl_recv", &[]);
    assert!(matches!(status, RunStatus::Yield), "expected Yield, got {status:?}");
    assert!(ctx.is_yielded());

    let status = ctx.resume(None);
    assert!(matches!(status, RunStatus::Yield), "expected Yield, got {status:?}");

    let status = ctx.resume(None);
    assert!(
        matches!(status, RunStatus::Terminate(_)),
        "expected Terminate(ok), got {status:?}"
    );

    assert_eq!(log.borrow().as_str(), "xxyy");
}
