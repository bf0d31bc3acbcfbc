//! AST → bytecode compiler (§4.7, C7). Walks a [`CompilationUnit`] and
//! every statement/expression it reaches, emitting bytecode into one
//! procedure per named `sub` group plus a synthetic "init" procedure that
//! runs imports, extension instantiation, ACL compilation, and global
//! initializers in source order, then registers every named subroutine.

use crate::acl::{self, Acl};
use crate::ast::{
    AclDecl, AclEntry, Action, AssignOp, BinOp, Expr, ExtensionDecl, GlobalDecl, LValue, Literal, ReturnValue, Span,
    Stmt, StrPart, UnOp,
};
use crate::bytecode::{BytecodeBuffer, Label, Opcode, Procedure};
use crate::error::{CompileError, SourceError};
use crate::source_repo::{CompilationUnit, SubList};

/// The result of compiling one [`CompilationUnit`]: every procedure the
/// unit produced, plus the index of the synthetic "init" procedure a
/// [`crate::host`] `Context` runs once at construction time.
#[derive(Debug)]
pub struct CompiledModule {
    pub procedures: Vec<Procedure>,
    pub init_index: u32,
    /// Module names named by `import` statements, resolved by the host
    /// rather than by a bytecode opcode — see DESIGN.md.
    pub imports: Vec<String>,
}

/// Tracks the nearest enclosing `for` loop's continue/break targets so
/// `break`/`continue` statements anywhere inside the loop body (including
/// inside nested `if` scopes) can find them.
struct LoopCtx {
    continue_label: Label,
    break_label: Label,
}

/// One lexical scope. `locals_at_entry` is a snapshot of the function's
/// flat local count taken when the scope was entered; exiting the scope
/// pops every local defined since then.
struct ScopeFrame {
    locals_at_entry: usize,
    loop_ctx: Option<LoopCtx>,
}

/// Per-procedure compilation state: the growing bytecode buffer, literal
/// and ACL pools, and the scope/local stack. A fresh `FuncCtx` is built
/// for the init procedure, for every named `sub` group, and for every
/// anonymous sub encountered mid-expression.
struct FuncCtx<'z> {
    buf: BytecodeBuffer,
    literals: crate::bytecode::LiteralPool,
    acls: Vec<Acl>,
    locals: Vec<&'z str>,
    scopes: Vec<ScopeFrame>,
    last_debug_source: u32,
}

impl<'z> FuncCtx<'z> {
    fn new() -> Self {
        Self {
            buf: BytecodeBuffer::new(),
            literals: crate::bytecode::LiteralPool::new(),
            acls: Vec::new(),
            locals: Vec::new(),
            scopes: Vec::new(),
            last_debug_source: u32::MAX,
        }
    }

    fn enter_scope(&mut self, loop_ctx: Option<LoopCtx>) {
        self.scopes.push(ScopeFrame { locals_at_entry: self.locals.len(), loop_ctx });
    }

    /// Exits the innermost scope, emitting an `spop` for every local it
    /// defined if any were.
    fn exit_scope(&mut self, span: Span) {
        let frame = self.scopes.pop().expect("exit_scope with no open scope");
        let count = self.locals.len() - frame.locals_at_entry;
        if count > 0 {
            self.buf.emit_operand(Opcode::SPop, count as u32, span);
        }
        self.locals.truncate(frame.locals_at_entry);
    }

    fn define_local(&mut self, name: &'z str) -> u32 {
        let slot = self.locals.len() as u32;
        self.locals.push(name);
        slot
    }

    /// Lexical lookup only; a miss means the caller should fall back to a
    /// global (§4.7: "a name not found in any lexical scope is compiled
    /// as a global").
    fn lookup_local(&self, name: &str) -> Option<u32> {
        self.locals.iter().rposition(|&n| n == name).map(|i| i as u32)
    }

    fn nearest_loop(&self) -> Option<(&LoopCtx, usize)> {
        self.scopes
            .iter()
            .rev()
            .find(|s| s.loop_ctx.is_some())
            .map(|s| (s.loop_ctx.as_ref().unwrap(), s.locals_at_entry))
    }

    fn intern_str(&mut self, s: &str) -> u32 {
        self.literals.str(s)
    }

    fn emit_debug_marker(&mut self, span: Span) {
        if span.source_index != self.last_debug_source {
            self.last_debug_source = span.source_index;
            self.buf.emit_operand(Opcode::Debug, span.source_index, span);
        }
    }
}

/// Walks one [`CompilationUnit`] and produces a [`CompiledModule`]. Stateless
/// across units; create a fresh one per compile.
pub struct Compiler {
    procedures: Vec<Procedure>,
}

impl Compiler {
    pub fn new() -> Self {
        Self { procedures: Vec::new() }
    }

    pub fn compile_unit<'z>(&mut self, unit: &CompilationUnit<'z>) -> Result<CompiledModule, CompileError> {
        let mut ctx = FuncCtx::new();
        ctx.enter_scope(None);

        for &ext in &unit.extensions {
            ctx.emit_debug_marker(ext.span);
            compile_extension_decl(&mut ctx, &mut self.procedures, ext)?;
        }
        for &decl in &unit.acls {
            let span = decl.entries.first().map(|e| e.span).unwrap_or(Span::UNKNOWN);
            ctx.emit_debug_marker(span);
            compile_acl_decl(&mut ctx, decl)?;
        }
        for &global in &unit.globals {
            ctx.emit_debug_marker(global.span);
            compile_global_decl(&mut ctx, &mut self.procedures, global)?;
        }
        for sub_list in &unit.subs {
            ctx.emit_debug_marker(sub_list.first_span);
            let index = self.compile_sub_list(sub_list)?;
            ctx.buf.emit_operand(Opcode::GSub, index, sub_list.first_span);
            let name_id = ctx.intern_str(sub_list.name);
            ctx.buf.emit_operand(Opcode::GSet, name_id, sub_list.first_span);
        }

        ctx.buf.emit(Opcode::LNull, Span::UNKNOWN);
        ctx.buf.emit(Opcode::Ret, Span::UNKNOWN);
        ctx.exit_scope(Span::UNKNOWN);
        ctx.buf.patch_all();

        let (code, source_map) = ctx.buf.into_parts();
        let init = Procedure {
            name: "init".to_string(),
            params: Vec::new(),
            code,
            literals: ctx.literals,
            acls: ctx.acls,
            source_map,
            protocol: "script".to_string(),
        };
        let init_index = self.procedures.len() as u32;
        self.procedures.push(init);

        let imports = unit.imports.iter().map(|s| s.to_string()).collect();
        Ok(CompiledModule { procedures: std::mem::take(&mut self.procedures), init_index, imports })
    }

    /// Compiles one name-grouped `sub` list into its own procedure, returning
    /// its index in `self.procedures`.
    fn compile_sub_list<'z>(&mut self, sub_list: &SubList<'z>) -> Result<u32, CompileError> {
        let mut ctx = FuncCtx::new();
        ctx.enter_scope(None);
        for &param in sub_list.params {
            ctx.define_local(param);
        }
        for body in &sub_list.bodies {
            compile_stmts(&mut ctx, &mut self.procedures, body)?;
        }
        ctx.buf.emit(Opcode::LNull, sub_list.first_span);
        ctx.buf.emit(Opcode::Ret, sub_list.first_span);
        ctx.scopes.pop();
        ctx.buf.patch_all();

        let (code, source_map) = ctx.buf.into_parts();
        let proc = Procedure {
            name: sub_list.name.to_string(),
            params: sub_list.params.iter().map(|s| s.to_string()).collect(),
            code,
            literals: ctx.literals,
            acls: ctx.acls,
            source_map,
            protocol: "script".to_string(),
        };
        let index = self.procedures.len() as u32;
        self.procedures.push(proc);
        Ok(index)
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

/// Compiles a `sub (<params>?) { <stmt>* }` appearing in expression
/// position into its own procedure, appended to `procedures`, mirroring
/// `Compiler::compile_sub_list` — the only difference being the caller
/// gets the new procedure's index back instead of it being wired to a
/// `gsub`/`gset` pair. Returns the index to be used as `lsub`'s operand.
fn compile_anonymous_sub<'z>(
    procedures: &mut Vec<Procedure>,
    name: &'z str,
    params: &'z [&'z str],
    body: &'z [Stmt<'z>],
    span: Span,
) -> Result<u32, CompileError> {
    let mut ctx = FuncCtx::new();
    ctx.enter_scope(None);
    for &param in params {
        ctx.define_local(param);
    }
    compile_stmts(&mut ctx, procedures, body)?;
    ctx.buf.emit(Opcode::LNull, span);
    ctx.buf.emit(Opcode::Ret, span);
    ctx.scopes.pop();
    ctx.buf.patch_all();

    let (code, source_map) = ctx.buf.into_parts();
    let proc = Procedure {
        name: name.to_string(),
        params: params.iter().map(|s| s.to_string()).collect(),
        code,
        literals: ctx.literals,
        acls: ctx.acls,
        source_map,
        protocol: "script".to_string(),
    };
    let index = procedures.len() as u32;
    procedures.push(proc);
    Ok(index)
}

fn compile_extension_decl<'z>(ctx: &mut FuncCtx<'z>, procedures: &mut Vec<Procedure>, ext: ExtensionDecl<'z>) -> Result<(), CompileError> {
    compile_expr(ctx, procedures, ext.init)?;
    let name_id = ctx.intern_str(ext.name);
    ctx.buf.emit_operand(Opcode::GSet, name_id, ext.span);
    Ok(())
}

fn compile_acl_decl<'z>(ctx: &mut FuncCtx<'z>, decl: AclDecl<'z>) -> Result<(), CompileError> {
    let mut programs = Vec::with_capacity(decl.entries.len());
    for &entry in decl.entries {
        let AclEntry { pattern, negate, span } = entry;
        let program =
            acl::compile_entry(pattern, negate).map_err(|e| CompileError::Acl(SourceError { span, message: e.0 }))?;
        programs.push(program);
    }
    let span = decl.entries.first().map(|e| e.span).unwrap_or(Span::UNKNOWN);
    let acl_index = ctx.acls.len() as u32;
    ctx.acls.push(Acl { programs });
    ctx.buf.emit_operand(Opcode::LAcl, acl_index, span);
    let name_id = ctx.intern_str(decl.name);
    ctx.buf.emit_operand(Opcode::GSet, name_id, span);
    Ok(())
}

fn compile_global_decl<'z>(ctx: &mut FuncCtx<'z>, procedures: &mut Vec<Procedure>, decl: GlobalDecl<'z>) -> Result<(), CompileError> {
    compile_expr(ctx, procedures, decl.init)?;
    let name_id = ctx.intern_str(decl.name);
    ctx.buf.emit_operand(Opcode::GSet, name_id, decl.span);
    Ok(())
}

fn compile_stmts<'z>(ctx: &mut FuncCtx<'z>, procedures: &mut Vec<Procedure>, stmts: &[Stmt<'z>]) -> Result<(), CompileError> {
    for &stmt in stmts {
        compile_stmt(ctx, procedures, stmt)?;
    }
    Ok(())
}

fn compile_stmt<'z>(ctx: &mut FuncCtx<'z>, procedures: &mut Vec<Procedure>, stmt: Stmt<'z>) -> Result<(), CompileError> {
    match stmt {
        Stmt::Set { target, op, value, span } => compile_set(ctx, procedures, target, op, value, span)?,
        Stmt::Unset { target, span } => compile_unset(ctx, procedures, target, span)?,
        Stmt::Declare { name, init, span } => {
            match init {
                Some(e) => compile_expr(ctx, procedures, e)?,
                None => ctx.buf.emit(Opcode::LNull, span),
            }
            ctx.define_local(name);
        }
        Stmt::New { name, init, span } => {
            compile_expr(ctx, procedures, init)?;
            ctx.define_local(name);
            let _ = span;
        }
        Stmt::Return { value, span } => match value {
            ReturnValue::None => {
                ctx.buf.emit(Opcode::LNull, span);
                ctx.buf.emit(Opcode::Ret, span);
            }
            ReturnValue::Expr(e) => {
                compile_expr(ctx, procedures, e)?;
                ctx.buf.emit(Opcode::Ret, span);
            }
            // A terminal action unwinds every frame back to the host entry
            // point, not just this procedure, so it cannot share `Ret`'s
            // plain-return-to-caller semantics — it gets its own opcode.
            ReturnValue::Action(action) => {
                ctx.buf.emit_operand(Opcode::Term, action.to_code(), span);
            }
        },
        Stmt::If { arms, else_branch } => compile_if(ctx, procedures, arms, else_branch)?,
        Stmt::For { key, value, iterable, body, span } => compile_for(ctx, procedures, key, value, iterable, body, span)?,
        Stmt::Break(span) => compile_break_continue(ctx, span, true)?,
        Stmt::Continue(span) => compile_break_continue(ctx, span, false)?,
        Stmt::Call { name, args, span } => {
            compile_call(ctx, procedures, name, args, span)?;
            ctx.buf.emit_operand(Opcode::SPop, 1, span);
        }
        Stmt::ExprStmt(expr, span) => {
            compile_expr(ctx, procedures, expr)?;
            ctx.buf.emit_operand(Opcode::SPop, 1, span);
        }
    }
    Ok(())
}

fn compile_break_continue<'z>(ctx: &mut FuncCtx<'z>, span: Span, is_break: bool) -> Result<(), CompileError> {
    let target = match ctx.nearest_loop() {
        Some((loop_ctx, locals_at_entry)) => {
            let label = if is_break { loop_ctx.break_label } else { loop_ctx.continue_label };
            let pop_count = (ctx.locals.len() - locals_at_entry) as u32;
            Some((label, pop_count))
        }
        None => None,
    };
    let Some((label, pop_count)) = target else {
        return Err(if is_break {
            CompileError::BreakOutsideLoop(span)
        } else {
            CompileError::ContinueOutsideLoop(span)
        });
    };
    if pop_count > 0 {
        ctx.buf.emit_operand(Opcode::SPop, pop_count, span);
    }
    ctx.buf.emit_branch(if is_break { Opcode::Brk } else { Opcode::Cont }, label, span);
    Ok(())
}

fn compile_if<'z>(
    ctx: &mut FuncCtx<'z>,
    procedures: &mut Vec<Procedure>,
    arms: &'z [(Expr<'z>, &'z [Stmt<'z>])],
    else_branch: Option<&'z [Stmt<'z>]>,
) -> Result<(), CompileError> {
    let mut exit_labels = Vec::new();
    let arm_count = arms.len();
    let mut next_label: Option<Label> = None;

    for (i, &(cond, body)) in arms.iter().enumerate() {
        if let Some(label) = next_label.take() {
            ctx.buf.bind_label(label);
        }
        let span = expr_span(&cond);
        compile_expr(ctx, procedures, cond)?;
        let after = ctx.buf.new_label();
        ctx.buf.emit_branch(Opcode::Jf, after, span);
        ctx.enter_scope(None);
        compile_stmts(ctx, procedures, body)?;
        ctx.exit_scope(span);
        if i + 1 < arm_count || else_branch.is_some() {
            let exit = ctx.buf.new_label();
            ctx.buf.emit_branch(Opcode::Jmp, exit, span);
            exit_labels.push(exit);
        }
        next_label = Some(after);
    }
    if let Some(label) = next_label {
        ctx.buf.bind_label(label);
    }
    if let Some(body) = else_branch {
        ctx.enter_scope(None);
        compile_stmts(ctx, procedures, body)?;
        ctx.exit_scope(Span::UNKNOWN);
    }
    for exit in exit_labels {
        ctx.buf.bind_label(exit);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn compile_for<'z>(
    ctx: &mut FuncCtx<'z>,
    procedures: &mut Vec<Procedure>,
    key: &'z str,
    value: Option<&'z str>,
    iterable: Expr<'z>,
    body: &'z [Stmt<'z>],
    span: Span,
) -> Result<(), CompileError> {
    compile_expr(ctx, procedures, iterable)?;
    // Anonymous iterator temp: lives in the *current* (enclosing) scope so
    // it is popped generically when that scope exits, never by the loop
    // body itself (§4.7 "for loop").
    ctx.define_local("");

    let break_label = ctx.buf.new_label();
    ctx.buf.emit_branch(Opcode::ForPrep, break_label, span);

    let loop_hdr = ctx.buf.new_label();
    ctx.buf.bind_label(loop_hdr);

    let continue_label = ctx.buf.new_label();
    ctx.enter_scope(Some(LoopCtx { continue_label, break_label }));

    ctx.buf.emit(Opcode::IterK, span);
    ctx.define_local(key);
    if let Some(v) = value {
        ctx.buf.emit(Opcode::IterV, span);
        ctx.define_local(v);
    }

    compile_stmts(ctx, procedures, body)?;

    let frame = ctx.scopes.last().expect("loop scope missing");
    let local_count = (ctx.locals.len() - frame.locals_at_entry) as u32;
    if local_count > 0 {
        ctx.buf.emit_operand(Opcode::SPop, local_count, span);
    }
    ctx.locals.truncate(frame.locals_at_entry);
    ctx.buf.bind_label(continue_label);

    ctx.buf.emit_branch(Opcode::ForEnd, loop_hdr, span);
    ctx.buf.bind_label(break_label);
    ctx.scopes.pop();

    Ok(())
}

fn compile_set<'z>(
    ctx: &mut FuncCtx<'z>,
    procedures: &mut Vec<Procedure>,
    target: LValue<'z>,
    op: AssignOp,
    value: Expr<'z>,
    span: Span,
) -> Result<(), CompileError> {
    match target {
        LValue::Var(name) | LValue::ExtVar(name) => compile_set_var(ctx, procedures, name, op, value, span)?,
        LValue::Property { base, name } => {
            compile_expr(ctx, procedures, *base)?;
            let id = ctx.intern_str(name);
            compile_expr(ctx, procedures, value)?;
            ctx.buf.emit_operand(assign_op_property(op), id, span);
        }
        LValue::Attribute { base, name } => {
            compile_expr(ctx, procedures, *base)?;
            let id = ctx.intern_str(name);
            compile_expr(ctx, procedures, value)?;
            ctx.buf.emit_operand(assign_op_attribute(op), id, span);
        }
        LValue::Index { base, index } => {
            compile_expr(ctx, procedures, *base)?;
            compile_expr(ctx, procedures, *index)?;
            compile_expr(ctx, procedures, value)?;
            ctx.buf.emit(assign_op_index(op), span);
        }
    }
    Ok(())
}

/// Bare variables have no compound local/global opcode (only property,
/// attribute, and index targets do — §4.6), so `+=`/`-=`/etc. on a plain
/// name is lowered here into `{read, compile(rhs), arithmetic op, write}`,
/// exactly as [`AssignOp`]'s own doc comment specifies.
fn compile_set_var<'z>(
    ctx: &mut FuncCtx<'z>,
    procedures: &mut Vec<Procedure>,
    name: &'z str,
    op: AssignOp,
    value: Expr<'z>,
    span: Span,
) -> Result<(), CompileError> {
    let slot = ctx.lookup_local(name);
    match op {
        AssignOp::Assign => {
            compile_expr(ctx, procedures, value)?;
            match slot {
                Some(slot) => ctx.buf.emit_operand(Opcode::SStore, slot, span),
                None => {
                    let id = ctx.intern_str(name);
                    ctx.buf.emit_operand(Opcode::GSet, id, span);
                }
            }
        }
        _ => {
            let arith = compound_arith_opcode(op);
            match slot {
                Some(slot) => {
                    ctx.buf.emit_operand(Opcode::SLoad, slot, span);
                    compile_expr(ctx, procedures, value)?;
                    ctx.buf.emit(arith, span);
                    ctx.buf.emit_operand(Opcode::SStore, slot, span);
                }
                None => {
                    let id = ctx.intern_str(name);
                    ctx.buf.emit_operand(Opcode::GGet, id, span);
                    compile_expr(ctx, procedures, value)?;
                    ctx.buf.emit(arith, span);
                    ctx.buf.emit_operand(Opcode::GSet, id, span);
                }
            }
        }
    }
    Ok(())
}

fn compound_arith_opcode(op: AssignOp) -> Opcode {
    match op {
        AssignOp::Assign => unreachable!("plain assign has no arithmetic opcode"),
        AssignOp::AddAssign => Opcode::Add,
        AssignOp::SubAssign => Opcode::Sub,
        AssignOp::MulAssign => Opcode::Mul,
        AssignOp::DivAssign => Opcode::Div,
        AssignOp::ModAssign => Opcode::Mod,
    }
}

fn compile_unset<'z>(ctx: &mut FuncCtx<'z>, procedures: &mut Vec<Procedure>, target: LValue<'z>, span: Span) -> Result<(), CompileError> {
    match target {
        LValue::Var(name) | LValue::ExtVar(name) => {
            if let Some(slot) = ctx.lookup_local(name) {
                ctx.buf.emit_operand(Opcode::SUnset, slot, span);
            } else {
                let id = ctx.intern_str(name);
                ctx.buf.emit_operand(Opcode::GUnset, id, span);
            }
        }
        LValue::Property { base, name } => {
            compile_expr(ctx, procedures, *base)?;
            let id = ctx.intern_str(name);
            ctx.buf.emit_operand(Opcode::PUnset, id, span);
        }
        LValue::Attribute { base, name } => {
            compile_expr(ctx, procedures, *base)?;
            let id = ctx.intern_str(name);
            ctx.buf.emit_operand(Opcode::AUnset, id, span);
        }
        LValue::Index { base, index } => {
            compile_expr(ctx, procedures, *base)?;
            compile_expr(ctx, procedures, *index)?;
            ctx.buf.emit(Opcode::IUnset, span);
        }
    }
    Ok(())
}

fn assign_op_property(op: AssignOp) -> Opcode {
    match op {
        AssignOp::Assign => Opcode::PSet,
        AssignOp::AddAssign => Opcode::PSetAdd,
        AssignOp::SubAssign => Opcode::PSetSub,
        AssignOp::MulAssign => Opcode::PSetMul,
        AssignOp::DivAssign => Opcode::PSetDiv,
        AssignOp::ModAssign => Opcode::PSetMod,
    }
}

fn assign_op_attribute(op: AssignOp) -> Opcode {
    match op {
        AssignOp::Assign => Opcode::ASet,
        AssignOp::AddAssign => Opcode::ASetAdd,
        AssignOp::SubAssign => Opcode::ASetSub,
        AssignOp::MulAssign => Opcode::ASetMul,
        AssignOp::DivAssign => Opcode::ASetDiv,
        AssignOp::ModAssign => Opcode::ASetMod,
    }
}

fn assign_op_index(op: AssignOp) -> Opcode {
    match op {
        AssignOp::Assign => Opcode::ISet,
        AssignOp::AddAssign => Opcode::ISetAdd,
        AssignOp::SubAssign => Opcode::ISetSub,
        AssignOp::MulAssign => Opcode::ISetMul,
        AssignOp::DivAssign => Opcode::ISetDiv,
        AssignOp::ModAssign => Opcode::ISetMod,
    }
}

fn expr_span(expr: &Expr<'_>) -> Span {
    match *expr {
        Expr::Binary { span, .. } | Expr::Unary { span, .. } | Expr::Call { span, .. } => span,
        _ => Span::UNKNOWN,
    }
}

fn compile_expr<'z>(ctx: &mut FuncCtx<'z>, procedures: &mut Vec<Procedure>, expr: Expr<'z>) -> Result<(), CompileError> {
    match expr {
        Expr::Literal(lit) => compile_literal(ctx, lit, Span::UNKNOWN),
        Expr::Interp(parts) => compile_interp(ctx, procedures, parts)?,
        Expr::Var(name) => compile_var_read(ctx, name, Span::UNKNOWN),
        Expr::ExtVar(name) => compile_var_read(ctx, name, Span::UNKNOWN),
        Expr::List(items) => {
            for &item in items {
                compile_expr(ctx, procedures, item)?;
            }
            ctx.buf.emit_operand(Opcode::LList, items.len() as u32, Span::UNKNOWN);
        }
        Expr::Dict(entries) => {
            for &(k, v) in entries {
                let id = ctx.intern_str(k);
                ctx.buf.emit_operand(Opcode::LStr, id, Span::UNKNOWN);
                compile_expr(ctx, procedures, v)?;
            }
            ctx.buf.emit_operand(Opcode::LDict, entries.len() as u32, Span::UNKNOWN);
        }
        Expr::Extension { type_name, fields } => {
            let id = ctx.intern_str(type_name);
            ctx.buf.emit_operand(Opcode::LStr, id, Span::UNKNOWN);
            for &(name, value) in fields {
                let field_id = ctx.intern_str(name);
                ctx.buf.emit_operand(Opcode::LStr, field_id, Span::UNKNOWN);
                compile_expr(ctx, procedures, value)?;
            }
            ctx.buf.emit_operand(Opcode::LExt, fields.len() as u32, Span::UNKNOWN);
        }
        Expr::Binary { op, lhs, rhs, span } => compile_binary(ctx, procedures, op, *lhs, *rhs, span)?,
        Expr::Unary { op, operand, span } => {
            compile_expr(ctx, procedures, *operand)?;
            match op {
                UnOp::Pos => {}
                UnOp::Neg => ctx.buf.emit(Opcode::Neg, span),
                UnOp::Not => ctx.buf.emit(Opcode::Not, span),
            }
        }
        Expr::Ternary { cond, then_branch, else_branch } => compile_ternary(ctx, procedures, *cond, *then_branch, *else_branch)?,
        Expr::Property { base, name } => {
            compile_expr(ctx, procedures, *base)?;
            let id = ctx.intern_str(name);
            ctx.buf.emit_operand(Opcode::PGet, id, Span::UNKNOWN);
        }
        Expr::Attribute { base, name } => {
            compile_expr(ctx, procedures, *base)?;
            let id = ctx.intern_str(name);
            ctx.buf.emit_operand(Opcode::AGet, id, Span::UNKNOWN);
        }
        Expr::Index { base, index } => {
            compile_expr(ctx, procedures, *base)?;
            compile_expr(ctx, procedures, *index)?;
            ctx.buf.emit(Opcode::IGet, Span::UNKNOWN);
        }
        Expr::Call { callee, args, span } => compile_call(ctx, procedures, callee, args, span)?,
        Expr::AnonymousSub { name, params, body, span } => {
            let index = compile_anonymous_sub(procedures, name, params, body, span)?;
            ctx.buf.emit_operand(Opcode::LSub, index, span);
        }
    }
    Ok(())
}

fn compile_var_read<'z>(ctx: &mut FuncCtx<'z>, name: &'z str, span: Span) {
    if let Some(slot) = ctx.lookup_local(name) {
        ctx.buf.emit_operand(Opcode::SLoad, slot, span);
    } else {
        let id = ctx.intern_str(name);
        ctx.buf.emit_operand(Opcode::GGet, id, span);
    }
}

fn compile_literal<'z>(ctx: &mut FuncCtx<'z>, lit: Literal<'z>, span: Span) {
    match lit {
        Literal::Int(v) => {
            let id = ctx.literals.int(v);
            ctx.buf.emit_operand(Opcode::LInt, id, span);
        }
        Literal::Real(v) => {
            let id = ctx.literals.real(v);
            ctx.buf.emit_operand(Opcode::LReal, id, span);
        }
        Literal::Bool(true) => ctx.buf.emit(Opcode::LTrue, span),
        Literal::Bool(false) => ctx.buf.emit(Opcode::LFalse, span),
        Literal::Null => ctx.buf.emit(Opcode::LNull, span),
        Literal::Size(v) => {
            let id = ctx.literals.size(v);
            ctx.buf.emit_operand(Opcode::LSize, id, span);
        }
        Literal::Duration(v) => {
            let id = ctx.literals.duration(v);
            ctx.buf.emit_operand(Opcode::LDuration, id, span);
        }
        Literal::Str(s) => {
            let id = ctx.intern_str(s);
            ctx.buf.emit_operand(Opcode::LStr, id, span);
        }
    }
}

fn compile_interp<'z>(ctx: &mut FuncCtx<'z>, procedures: &mut Vec<Procedure>, parts: &'z [StrPart<'z>]) -> Result<(), CompileError> {
    for &part in parts {
        match part {
            StrPart::Text(text) => {
                let id = ctx.intern_str(text);
                ctx.buf.emit_operand(Opcode::LStr, id, Span::UNKNOWN);
            }
            StrPart::Expr(e) => {
                compile_expr(ctx, procedures, *e)?;
                ctx.buf.emit(Opcode::CStr, Span::UNKNOWN);
            }
        }
    }
    ctx.buf.emit_operand(Opcode::SCat, parts.len() as u32, Span::UNKNOWN);
    Ok(())
}

/// One intrinsic call per conversion opcode, dispatched by callee name
/// ahead of the generic `call` path — mirrors the teacher's name-keyed
/// intrinsic-function table.
fn intrinsic_opcode(name: &str) -> Option<Opcode> {
    match name {
        "str" => Some(Opcode::CStr),
        "int" => Some(Opcode::CInt),
        "real" => Some(Opcode::CReal),
        "bool" => Some(Opcode::CBool),
        "type" => Some(Opcode::Type),
        _ => None,
    }
}

fn compile_call<'z>(
    ctx: &mut FuncCtx<'z>,
    procedures: &mut Vec<Procedure>,
    callee: &'z str,
    args: &'z [Expr<'z>],
    span: Span,
) -> Result<(), CompileError> {
    if let Some(op) = intrinsic_opcode(callee) {
        for &arg in args {
            compile_expr(ctx, procedures, arg)?;
        }
        ctx.buf.emit(op, span);
        return Ok(());
    }
    compile_var_read(ctx, callee, span);
    for &arg in args {
        compile_expr(ctx, procedures, arg)?;
    }
    ctx.buf.emit_operand(Opcode::Call, args.len() as u32, span);
    Ok(())
}

fn compile_binary<'z>(
    ctx: &mut FuncCtx<'z>,
    procedures: &mut Vec<Procedure>,
    op: BinOp,
    lhs: Expr<'z>,
    rhs: Expr<'z>,
    span: Span,
) -> Result<(), CompileError> {
    if matches!(op, BinOp::And | BinOp::Or) {
        return compile_logic(ctx, procedures, op, lhs, rhs, span);
    }
    if let Expr::Literal(Literal::Int(v)) = lhs {
        if let Some(iv_op) = immediate_iv_op(op) {
            compile_expr(ctx, procedures, rhs)?;
            let id = ctx.literals.int(v);
            ctx.buf.emit_operand(iv_op, id, span);
            return Ok(());
        }
    }
    if let Expr::Literal(Literal::Int(v)) = rhs {
        if let Some(vi_op) = immediate_vi_op(op) {
            compile_expr(ctx, procedures, lhs)?;
            let id = ctx.literals.int(v);
            ctx.buf.emit_operand(vi_op, id, span);
            return Ok(());
        }
    }
    compile_expr(ctx, procedures, lhs)?;
    compile_expr(ctx, procedures, rhs)?;
    ctx.buf.emit(stack_binop(op), span);
    Ok(())
}

/// Only `+`/`-`/`*` have specialized immediate forms (§4.6); the rest fall
/// through to the stack-only opcode even with a literal operand.
fn immediate_iv_op(op: BinOp) -> Option<Opcode> {
    match op {
        BinOp::Add => Some(Opcode::AddIv),
        BinOp::Sub => Some(Opcode::SubIv),
        BinOp::Mul => Some(Opcode::MulIv),
        _ => None,
    }
}

fn immediate_vi_op(op: BinOp) -> Option<Opcode> {
    match op {
        BinOp::Add => Some(Opcode::AddVi),
        BinOp::Sub => Some(Opcode::SubVi),
        BinOp::Mul => Some(Opcode::MulVi),
        _ => None,
    }
}

fn stack_binop(op: BinOp) -> Opcode {
    match op {
        BinOp::Add => Opcode::Add,
        BinOp::Sub => Opcode::Sub,
        BinOp::Mul => Opcode::Mul,
        BinOp::Div => Opcode::Div,
        BinOp::Mod => Opcode::Mod,
        BinOp::Eq => Opcode::Eq,
        BinOp::Ne => Opcode::Ne,
        BinOp::Lt => Opcode::Lt,
        BinOp::Le => Opcode::Le,
        BinOp::Gt => Opcode::Gt,
        BinOp::Ge => Opcode::Ge,
        BinOp::Match => Opcode::Match,
        BinOp::NotMatch => Opcode::NotMatch,
        BinOp::And | BinOp::Or => unreachable!("handled by compile_logic"),
    }
}

/// `&&`/`||` always produce a `Bool` (matching the constant folder's
/// `literal_truthy` semantics), short-circuiting the right operand.
/// `brf`/`brt` exist precisely for this: on the short-circuiting branch
/// they replace the left operand with a canonical `true`/`false` and
/// jump past the right operand entirely; on the other branch they pop
/// the left operand and fall into evaluating the right one, which is
/// then coerced to a canonical `Bool` with `cbool`.
fn compile_logic<'z>(
    ctx: &mut FuncCtx<'z>,
    procedures: &mut Vec<Procedure>,
    op: BinOp,
    lhs: Expr<'z>,
    rhs: Expr<'z>,
    span: Span,
) -> Result<(), CompileError> {
    compile_expr(ctx, procedures, lhs)?;
    let end = ctx.buf.new_label();
    let branch_op = if op == BinOp::And { Opcode::Brf } else { Opcode::Brt };
    ctx.buf.emit_branch(branch_op, end, span);
    compile_expr(ctx, procedures, rhs)?;
    ctx.buf.emit(Opcode::CBool, span);
    ctx.buf.bind_label(end);
    Ok(())
}

fn compile_ternary<'z>(
    ctx: &mut FuncCtx<'z>,
    procedures: &mut Vec<Procedure>,
    cond: Expr<'z>,
    then_branch: Expr<'z>,
    else_branch: Expr<'z>,
) -> Result<(), CompileError> {
    let span = expr_span(&cond);
    compile_expr(ctx, procedures, cond)?;
    let else_label = ctx.buf.new_label();
    ctx.buf.emit_branch(Opcode::Jf, else_label, span);
    compile_expr(ctx, procedures, then_branch)?;
    let end_label = ctx.buf.new_label();
    ctx.buf.emit_branch(Opcode::Jmp, end_label, span);
    ctx.buf.bind_label(else_label);
    compile_expr(ctx, procedures, else_branch)?;
    ctx.buf.bind_label(end_label);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::decode_at;
    use crate::parser::NameSeed;
    use crate::source_repo::{SourceLoader, SourceRepo};
    use crate::zone::Zone;

    fn span() -> Span {
        Span { source_index: 0, line: 1, column: 1 }
    }

    struct OneFile(&'static str);
    impl SourceLoader for OneFile {
        fn load(&self, _path: &std::path::Path) -> std::io::Result<String> {
            Ok(self.0.to_string())
        }
    }

    fn unit_from_source(zone: &Zone, src: &'static str) -> CompilationUnit<'_> {
        let repo = SourceRepo::new(Box::new(OneFile(src)), false, 16);
        let (unit, _) = CompilationUnit::build(zone, &repo, "main.vcl", None, NameSeed(0)).unwrap();
        unit
    }

    #[test]
    fn compiles_a_trivial_sub_into_its_own_procedure() {
        let zone = Zone::new();
        let unit = unit_from_source(&zone, "vcl 4.0; sub vcl_recv { return(ok); }");
        let mut compiler = Compiler::new();
        let module = compiler.compile_unit(&unit).unwrap();
        assert_eq!(module.procedures.len(), 2);
        let sub = &module.procedures[0];
        assert_eq!(sub.name, "vcl_recv");
        let (op, _, _) = decode_at(&sub.code, 0);
        assert_eq!(op, Opcode::LStr);
    }

    #[test]
    fn global_initializer_runs_as_init_bytecode() {
        let zone = Zone::new();
        let unit = unit_from_source(&zone, "vcl 4.0; global a = 10; global b = a * 100;");
        let mut compiler = Compiler::new();
        let module = compiler.compile_unit(&unit).unwrap();
        let init = &module.procedures[module.init_index as usize];
        let mut pc = 0;
        let mut saw_gget = false;
        while pc < init.code.len() {
            let (op, _, len) = decode_at(&init.code, pc);
            if op == Opcode::GGet {
                saw_gget = true;
            }
            pc += len;
        }
        // b's initializer reads `a` as a real global read, not folded away
        // at compile time (§8 scenario 1: globals run as real bytecode).
        assert!(saw_gget);
    }

    #[test]
    fn named_sub_self_registers_via_gsub() {
        let zone = Zone::new();
        let unit = unit_from_source(&zone, "vcl 4.0; sub vcl_recv { return(ok); }");
        let mut compiler = Compiler::new();
        let module = compiler.compile_unit(&unit).unwrap();
        let init = &module.procedures[module.init_index as usize];
        let mut found_gsub = false;
        let mut pc = 0;
        while pc < init.code.len() {
            let (op, operand, len) = decode_at(&init.code, pc);
            if op == Opcode::GSub {
                assert_eq!(operand, 0);
                found_gsub = true;
            }
            pc += len;
        }
        assert!(found_gsub);
    }

    #[test]
    fn break_outside_loop_is_an_error() {
        let zone = Zone::new();
        let unit = unit_from_source(&zone, "vcl 4.0; sub vcl_recv { break; }");
        let mut compiler = Compiler::new();
        let err = compiler.compile_unit(&unit).unwrap_err();
        assert!(matches!(err, CompileError::BreakOutsideLoop(_)));
    }

    #[test]
    fn for_loop_over_a_list_compiles_forprep_and_forend() {
        let zone = Zone::new();
        let unit = unit_from_source(&zone, "vcl 4.0; sub vcl_recv { for (k, v : req.list) { set req.url = v; } }");
        let mut compiler = Compiler::new();
        let module = compiler.compile_unit(&unit).unwrap();
        let sub = &module.procedures[0];
        let mut ops = Vec::new();
        let mut pc = 0;
        while pc < sub.code.len() {
            let (op, _, len) = decode_at(&sub.code, pc);
            ops.push(op);
            pc += len;
        }
        assert!(ops.contains(&Opcode::ForPrep));
        assert!(ops.contains(&Opcode::ForEnd));
        assert!(ops.contains(&Opcode::IterK));
        assert!(ops.contains(&Opcode::IterV));
    }

    #[test]
    fn conflicting_sub_bodies_concatenate_in_visitation_order() {
        let zone = Zone::new();
        let unit = unit_from_source(
            &zone,
            "vcl 4.0; sub vcl_recv { set req.url = \"/a\"; } sub vcl_recv { set req.url = \"/b\"; }",
        );
        let mut compiler = Compiler::new();
        let module = compiler.compile_unit(&unit).unwrap();
        let sub = &module.procedures[0];
        assert!(sub.literals.len() >= 2);
    }

    #[test]
    fn acl_decl_compiles_into_the_procedure_acl_pool() {
        let zone = Zone::new();
        let unit = unit_from_source(&zone, "vcl 4.0; acl my_acl { \"10.0.0.0\"/8; }");
        let mut compiler = Compiler::new();
        let module = compiler.compile_unit(&unit).unwrap();
        let init = &module.procedures[module.init_index as usize];
        assert_eq!(init.acls.len(), 1);
    }

    #[test]
    fn intrinsic_call_compiles_to_a_dedicated_opcode_not_a_generic_call() {
        let zone = Zone::new();
        let unit = unit_from_source(&zone, "vcl 4.0; sub vcl_recv { set req.url = str(1); }");
        let mut compiler = Compiler::new();
        let module = compiler.compile_unit(&unit).unwrap();
        let sub = &module.procedures[0];
        let mut pc = 0;
        let mut saw_cstr = false;
        while pc < sub.code.len() {
            let (op, _, len) = decode_at(&sub.code, pc);
            if op == Opcode::CStr {
                saw_cstr = true;
            }
            pc += len;
        }
        assert!(saw_cstr);
    }

    #[test]
    fn anonymous_sub_compiles_into_its_own_procedure_and_emits_lsub() {
        let zone = Zone::new();
        let unit = unit_from_source(
            &zone,
            "vcl 4.0; sub vcl_recv { declare x = sub { return(ok); }; }",
        );
        let mut compiler = Compiler::new();
        let module = compiler.compile_unit(&unit).unwrap();
        // The outer `vcl_recv` procedure, the anonymous sub it declares, and
        // the synthetic init procedure.
        assert_eq!(module.procedures.len(), 3);
        let outer = &module.procedures[0];
        let mut pc = 0;
        let mut lsub_operand = None;
        while pc < outer.code.len() {
            let (op, operand, len) = decode_at(&outer.code, pc);
            if op == Opcode::LSub {
                lsub_operand = Some(operand);
            }
            pc += len;
        }
        let index = lsub_operand.expect("lsub not emitted for an anonymous sub");
        let anon = &module.procedures[index as usize];
        assert!(anon.name.starts_with("@__anonymous_sub__::"));
    }

    // Manual-AST tests below exercise expression shapes the fixture-based
    // parser path above can't easily reach, by constructing a `FuncCtx`
    // directly.

    #[test]
    fn ternary_emits_balanced_branches() {
        let mut ctx: FuncCtx<'static> = FuncCtx::new();
        let mut procedures = Vec::new();
        ctx.enter_scope(None);
        let cond = Expr::Literal(Literal::Bool(true));
        let then_b = Expr::Literal(Literal::Int(1));
        let else_b = Expr::Literal(Literal::Int(2));
        compile_ternary(&mut ctx, &mut procedures, cond, then_b, else_b).unwrap();
        ctx.buf.patch_all();
        let (code, _) = ctx.buf.into_parts();
        let (first, ..) = decode_at(&code, 0);
        assert_eq!(first, Opcode::LTrue);
    }

    #[test]
    fn bare_variable_unset_on_a_local_emits_sunset() {
        let mut ctx: FuncCtx<'static> = FuncCtx::new();
        let mut procedures = Vec::new();
        ctx.enter_scope(None);
        ctx.define_local("x");
        compile_unset(&mut ctx, &mut procedures, LValue::Var("x"), span()).unwrap();
        ctx.buf.patch_all();
        let (code, _) = ctx.buf.into_parts();
        let (op, operand, _) = decode_at(&code, 0);
        assert_eq!(op, Opcode::SUnset);
        assert_eq!(operand, 0);
    }

    #[test]
    fn bare_variable_unset_on_a_global_emits_gunset() {
        let mut ctx: FuncCtx<'static> = FuncCtx::new();
        let mut procedures = Vec::new();
        ctx.enter_scope(None);
        compile_unset(&mut ctx, &mut procedures, LValue::Var("req"), span()).unwrap();
        ctx.buf.patch_all();
        let (code, _) = ctx.buf.into_parts();
        let (op, ..) = decode_at(&code, 0);
        assert_eq!(op, Opcode::GUnset);
    }

    #[test]
    fn compound_assign_on_a_local_lowers_to_load_op_store() {
        let mut ctx: FuncCtx<'static> = FuncCtx::new();
        let mut procedures = Vec::new();
        ctx.enter_scope(None);
        ctx.define_local("x");
        compile_set_var(&mut ctx, &mut procedures, "x", AssignOp::AddAssign, Expr::Literal(Literal::Int(1)), span()).unwrap();
        ctx.buf.patch_all();
        let (code, _) = ctx.buf.into_parts();
        let mut ops = Vec::new();
        let mut pc = 0;
        while pc < code.len() {
            let (op, _, len) = decode_at(&code, pc);
            ops.push(op);
            pc += len;
        }
        assert_eq!(ops, vec![Opcode::SLoad, Opcode::LInt, Opcode::Add, Opcode::SStore]);
    }

    #[test]
    fn compound_assign_on_a_global_lowers_to_gget_op_gset() {
        let mut ctx: FuncCtx<'static> = FuncCtx::new();
        let mut procedures = Vec::new();
        ctx.enter_scope(None);
        compile_set_var(&mut ctx, &mut procedures, "counter", AssignOp::SubAssign, Expr::Literal(Literal::Int(1)), span()).unwrap();
        ctx.buf.patch_all();
        let (code, _) = ctx.buf.into_parts();
        let mut ops = Vec::new();
        let mut pc = 0;
        while pc < code.len() {
            let (op, _, len) = decode_at(&code, pc);
            ops.push(op);
            pc += len;
        }
        assert_eq!(ops, vec![Opcode::GGet, Opcode::LInt, Opcode::Sub, Opcode::GSet]);
    }

    #[test]
    fn logical_and_short_circuits_with_brf_and_cbool() {
        let mut ctx: FuncCtx<'static> = FuncCtx::new();
        let mut procedures = Vec::new();
        ctx.enter_scope(None);
        let lhs = Expr::Literal(Literal::Bool(false));
        let rhs = Expr::Literal(Literal::Bool(true));
        compile_logic(&mut ctx, &mut procedures, BinOp::And, lhs, rhs, span()).unwrap();
        ctx.buf.patch_all();
        let (code, _) = ctx.buf.into_parts();
        let mut ops = Vec::new();
        let mut pc = 0;
        while pc < code.len() {
            let (op, _, len) = decode_at(&code, pc);
            ops.push(op);
            pc += len;
        }
        assert!(ops.contains(&Opcode::Brf));
        assert!(ops.contains(&Opcode::CBool));
    }

    #[test]
    fn immediate_add_iv_is_used_when_lhs_is_an_int_literal() {
        let mut ctx: FuncCtx<'static> = FuncCtx::new();
        let mut procedures = Vec::new();
        ctx.enter_scope(None);
        ctx.define_local("x");
        let lhs = Expr::Literal(Literal::Int(10));
        let rhs = Expr::Var("x");
        compile_binary(&mut ctx, &mut procedures, BinOp::Add, lhs, rhs, span()).unwrap();
        ctx.buf.patch_all();
        let (code, _) = ctx.buf.into_parts();
        let mut ops = Vec::new();
        let mut pc = 0;
        while pc < code.len() {
            let (op, _, len) = decode_at(&code, pc);
            ops.push(op);
            pc += len;
        }
        assert!(ops.contains(&Opcode::AddIv));
    }

    #[test]
    fn action_return_compiles_to_a_dedicated_term_opcode() {
        let mut ctx: FuncCtx<'static> = FuncCtx::new();
        let mut procedures = Vec::new();
        ctx.enter_scope(None);
        compile_stmt(&mut ctx, &mut procedures, Stmt::Return { value: ReturnValue::Action(Action::Deliver), span: span() }).unwrap();
        ctx.buf.patch_all();
        let (code, _) = ctx.buf.into_parts();
        let (op, code_val, _) = decode_at(&code, 0);
        assert_eq!(op, Opcode::Term);
        assert_eq!(code_val, 9);
    }
}
