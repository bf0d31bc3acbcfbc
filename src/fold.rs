//! Constant folder (C4, §4.4): a recursive bottom-up AST rewrite that
//! reduces pure literal-over-literal expressions to `Literal` nodes.
//!
//! Folding only ever combines two already-`Literal` children; it never
//! applies an algebraic identity (`x * 0`, `x || true`) to a non-literal
//! operand, since that operand might be a variable read or a property
//! getter with a host-visible side effect. The one place a non-literal
//! subtree is dropped entirely is `&&`/`||` short-circuiting and a
//! statically-known `if(...)` condition, both of which drop exactly the
//! branch the runtime itself would never evaluate.

use crate::ast::{
    AclDecl, BinOp, Expr, ExtensionDecl, File, GlobalDecl, LValue, Literal, ReturnValue, Span,
    Stmt, StrPart, SubDecl, TopLevel, UnOp,
};
use crate::error::{CompileError, SourceError};
use crate::value::{self, ArithError, Value};
use crate::zone::Zone;

pub struct Folder<'z> {
    zone: &'z Zone,
}

impl<'z> Folder<'z> {
    pub fn new(zone: &'z Zone) -> Self {
        Self { zone }
    }

    pub fn fold_file(&self, file: &File<'z>) -> Result<File<'z>, CompileError> {
        let items = file
            .items
            .iter()
            .map(|item| self.fold_top_level(item))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(File { vcl_version: file.vcl_version, items: self.zone.alloc_slice(&items) })
    }

    fn fold_top_level(&self, item: &TopLevel<'z>) -> Result<TopLevel<'z>, CompileError> {
        Ok(match *item {
            TopLevel::Include { .. } | TopLevel::Import { .. } => *item,
            TopLevel::Sub(decl) => TopLevel::Sub(self.fold_sub(&decl)?),
            TopLevel::Acl(decl) => TopLevel::Acl(self.fold_acl(&decl)),
            TopLevel::Global(decl) => TopLevel::Global(self.fold_global(&decl)?),
            TopLevel::Extension(decl) => TopLevel::Extension(self.fold_extension_decl(&decl)?),
        })
    }

    fn fold_sub(&self, decl: &SubDecl<'z>) -> Result<SubDecl<'z>, CompileError> {
        Ok(SubDecl { name: decl.name, params: decl.params, body: self.fold_stmts(decl.body)?, span: decl.span })
    }

    /// ACL entries are CIDR/hostname patterns, not expressions; nothing here
    /// to fold.
    fn fold_acl(&self, decl: &AclDecl<'z>) -> AclDecl<'z> {
        *decl
    }

    fn fold_global(&self, decl: &GlobalDecl<'z>) -> Result<GlobalDecl<'z>, CompileError> {
        Ok(GlobalDecl { name: decl.name, init: self.fold_expr(&decl.init)?, span: decl.span })
    }

    fn fold_extension_decl(&self, decl: &ExtensionDecl<'z>) -> Result<ExtensionDecl<'z>, CompileError> {
        Ok(ExtensionDecl {
            type_name: decl.type_name,
            name: decl.name,
            init: self.fold_expr(&decl.init)?,
            span: decl.span,
        })
    }

    fn fold_stmts(&self, stmts: &[Stmt<'z>]) -> Result<&'z [Stmt<'z>], CompileError> {
        let folded = stmts.iter().map(|s| self.fold_stmt(s)).collect::<Result<Vec<_>, _>>()?;
        Ok(self.zone.alloc_slice(&folded))
    }

    fn fold_stmt(&self, stmt: &Stmt<'z>) -> Result<Stmt<'z>, CompileError> {
        Ok(match *stmt {
            Stmt::Set { target, op, value, span } => {
                Stmt::Set { target: self.fold_lvalue(&target)?, op, value: self.fold_expr(&value)?, span }
            }
            Stmt::Unset { target, span } => Stmt::Unset { target: self.fold_lvalue(&target)?, span },
            Stmt::Declare { name, init, span } => {
                let init = init.map(|e| self.fold_expr(&e)).transpose()?;
                Stmt::Declare { name, init, span }
            }
            Stmt::New { name, init, span } => Stmt::New { name, init: self.fold_expr(&init)?, span },
            Stmt::Return { value, span } => {
                let value = match value {
                    ReturnValue::None => ReturnValue::None,
                    ReturnValue::Action(a) => ReturnValue::Action(a),
                    ReturnValue::Expr(e) => ReturnValue::Expr(self.fold_expr(&e)?),
                };
                Stmt::Return { value, span }
            }
            Stmt::If { arms, else_branch } => {
                let arms = arms
                    .iter()
                    .map(|(cond, body)| Ok((self.fold_expr(cond)?, self.fold_stmts(body)?)))
                    .collect::<Result<Vec<_>, CompileError>>()?;
                let else_branch = else_branch.map(|b| self.fold_stmts(b)).transpose()?;
                Stmt::If { arms: self.zone.alloc_slice(&arms), else_branch }
            }
            Stmt::For { key, value, iterable, body, span } => Stmt::For {
                key,
                value,
                iterable: self.fold_expr(&iterable)?,
                body: self.fold_stmts(body)?,
                span,
            },
            Stmt::Break(span) => Stmt::Break(span),
            Stmt::Continue(span) => Stmt::Continue(span),
            Stmt::Call { name, args, span } => Stmt::Call { name, args: self.fold_exprs(args)?, span },
            Stmt::ExprStmt(expr, span) => Stmt::ExprStmt(self.fold_expr(&expr)?, span),
        })
    }

    fn fold_lvalue(&self, lvalue: &LValue<'z>) -> Result<LValue<'z>, CompileError> {
        Ok(match *lvalue {
            LValue::Var(name) => LValue::Var(name),
            LValue::ExtVar(name) => LValue::ExtVar(name),
            LValue::Property { base, name } => {
                LValue::Property { base: self.zone.alloc(self.fold_expr(base)?), name }
            }
            LValue::Attribute { base, name } => {
                LValue::Attribute { base: self.zone.alloc(self.fold_expr(base)?), name }
            }
            LValue::Index { base, index } => LValue::Index {
                base: self.zone.alloc(self.fold_expr(base)?),
                index: self.zone.alloc(self.fold_expr(index)?),
            },
        })
    }

    fn fold_exprs(&self, exprs: &[Expr<'z>]) -> Result<&'z [Expr<'z>], CompileError> {
        let folded = exprs.iter().map(|e| self.fold_expr(e)).collect::<Result<Vec<_>, _>>()?;
        Ok(self.zone.alloc_slice(&folded))
    }

    fn fold_expr(&self, expr: &Expr<'z>) -> Result<Expr<'z>, CompileError> {
        Ok(match *expr {
            Expr::Literal(_) | Expr::Var(_) | Expr::ExtVar(_) => *expr,
            Expr::Interp(parts) => {
                let folded = parts
                    .iter()
                    .map(|p| match *p {
                        StrPart::Text(t) => Ok(StrPart::Text(t)),
                        StrPart::Expr(e) => Ok(StrPart::Expr(self.zone.alloc(self.fold_expr(e)?))),
                    })
                    .collect::<Result<Vec<_>, CompileError>>()?;
                Expr::Interp(self.zone.alloc_slice(&folded))
            }
            Expr::List(items) => Expr::List(self.fold_exprs(items)?),
            Expr::Dict(pairs) => {
                let folded = pairs
                    .iter()
                    .map(|(k, v)| Ok((*k, self.fold_expr(v)?)))
                    .collect::<Result<Vec<_>, CompileError>>()?;
                Expr::Dict(self.zone.alloc_slice(&folded))
            }
            Expr::Extension { type_name, fields } => {
                let folded = fields
                    .iter()
                    .map(|(k, v)| Ok((*k, self.fold_expr(v)?)))
                    .collect::<Result<Vec<_>, CompileError>>()?;
                Expr::Extension { type_name, fields: self.zone.alloc_slice(&folded) }
            }
            Expr::Binary { op, lhs, rhs, span } => self.fold_binary(op, lhs, rhs, span)?,
            Expr::Unary { op, operand, span } => self.fold_unary(op, operand, span)?,
            Expr::Ternary { cond, then_branch, else_branch } => {
                let cond = self.fold_expr(cond)?;
                let then_branch = self.fold_expr(then_branch)?;
                let else_branch = self.fold_expr(else_branch)?;
                match cond {
                    Expr::Literal(lit) => {
                        if literal_truthy(&lit) {
                            then_branch
                        } else {
                            else_branch
                        }
                    }
                    _ => Expr::Ternary {
                        cond: self.zone.alloc(cond),
                        then_branch: self.zone.alloc(then_branch),
                        else_branch: self.zone.alloc(else_branch),
                    },
                }
            }
            Expr::Property { base, name } => {
                Expr::Property { base: self.zone.alloc(self.fold_expr(base)?), name }
            }
            Expr::Attribute { base, name } => {
                Expr::Attribute { base: self.zone.alloc(self.fold_expr(base)?), name }
            }
            Expr::Index { base, index } => Expr::Index {
                base: self.zone.alloc(self.fold_expr(base)?),
                index: self.zone.alloc(self.fold_expr(index)?),
            },
            Expr::Call { callee, args, span } => Expr::Call { callee, args: self.fold_exprs(args)?, span },
        })
    }

    fn fold_binary(
        &self,
        op: BinOp,
        lhs: &Expr<'z>,
        rhs: &Expr<'z>,
        span: Span,
    ) -> Result<Expr<'z>, CompileError> {
        let lhs = self.fold_expr(lhs)?;

        // Short-circuit: the untaken side is never evaluated at runtime
        // either, so dropping it here does not discard a side effect.
        if let (BinOp::And, Expr::Literal(l)) = (op, lhs) {
            if !literal_truthy(&l) {
                return Ok(Expr::Literal(Literal::Bool(false)));
            }
            return self.fold_expr(rhs);
        }
        if let (BinOp::Or, Expr::Literal(l)) = (op, lhs) {
            if literal_truthy(&l) {
                return Ok(Expr::Literal(Literal::Bool(true)));
            }
            return self.fold_expr(rhs);
        }

        let rhs = self.fold_expr(rhs)?;
        let (Expr::Literal(l), Expr::Literal(r)) = (lhs, rhs) else {
            return Ok(Expr::Binary {
                op,
                lhs: self.zone.alloc(lhs),
                rhs: self.zone.alloc(rhs),
                span,
            });
        };

        if let Some(folded) = self.combine_literals(op, &l, &r, span)? {
            return Ok(Expr::Literal(folded));
        }
        Ok(Expr::Binary { op, lhs: self.zone.alloc(lhs), rhs: self.zone.alloc(rhs), span })
    }

    /// Attempts to combine two already-literal operands. `Ok(None)` means
    /// "leave unfolded" (not every literal combination is modeled here, e.g.
    /// pattern-match operators belong to the runtime's ACL/regex engines);
    /// `Err` means the runtime would also reject this combination.
    fn combine_literals(
        &self,
        op: BinOp,
        l: &Literal<'z>,
        r: &Literal<'z>,
        span: Span,
    ) -> Result<Option<Literal<'z>>, CompileError> {
        if let (Literal::Str(a), Literal::Str(b)) = (l, r) {
            return Ok(match op {
                BinOp::Add => Some(Literal::Str(self.zone.alloc_str(&format!("{a}{b}")))),
                BinOp::Eq => Some(Literal::Bool(a == b)),
                BinOp::Ne => Some(Literal::Bool(a != b)),
                BinOp::Lt => Some(Literal::Bool(a < b)),
                BinOp::Le => Some(Literal::Bool(a <= b)),
                BinOp::Gt => Some(Literal::Bool(a > b)),
                BinOp::Ge => Some(Literal::Bool(a >= b)),
                _ => None,
            });
        }
        // Pattern-match operators are left for the runtime's ACL/regex
        // engines even when both sides happen to be literal.
        if matches!(op, BinOp::Match | BinOp::NotMatch) {
            return Ok(None);
        }
        let (Some(lv), Some(rv)) = (literal_as_value(l), literal_as_value(r)) else {
            return Ok(None);
        };
        let fold_arith = |res: Result<Value, ArithError>| -> Result<Option<Literal<'z>>, CompileError> {
            match res {
                Ok(v) => Ok(Some(value_to_literal(v))),
                Err(ArithError::DivideByZero) => {
                    Err(CompileError::ConstFoldDivideByZero(SourceError { span, message: "division by zero in constant expression".into() }))
                }
                Err(ArithError::Unsupported) => Err(CompileError::ConstFoldTypeError(SourceError {
                    span,
                    message: format!(
                        "unsupported operand types for '{}': {} and {}",
                        op_text(op),
                        type_name_of_literal(l),
                        type_name_of_literal(r)
                    ),
                })),
            }
        };
        match op {
            BinOp::Add => fold_arith(value::add(&lv, &rv)),
            BinOp::Sub => fold_arith(value::sub(&lv, &rv)),
            BinOp::Mul => fold_arith(value::mul(&lv, &rv)),
            BinOp::Div => fold_arith(value::div(&lv, &rv)),
            BinOp::Mod => fold_arith(value::rem(&lv, &rv)),
            BinOp::Eq => Ok(value::eq_primitive(&lv, &rv).map(Literal::Bool)),
            BinOp::Ne => Ok(value::eq_primitive(&lv, &rv).map(|b| Literal::Bool(!b))),
            BinOp::Lt => Ok(value::cmp_primitive(&lv, &rv).map(|o| Literal::Bool(o.is_lt()))),
            BinOp::Le => Ok(value::cmp_primitive(&lv, &rv).map(|o| Literal::Bool(o.is_le()))),
            BinOp::Gt => Ok(value::cmp_primitive(&lv, &rv).map(|o| Literal::Bool(o.is_gt()))),
            BinOp::Ge => Ok(value::cmp_primitive(&lv, &rv).map(|o| Literal::Bool(o.is_ge()))),
            BinOp::And | BinOp::Or => Ok(Some(Literal::Bool(match op {
                BinOp::And => literal_truthy(l) && literal_truthy(r),
                _ => literal_truthy(l) || literal_truthy(r),
            }))),
            BinOp::Match | BinOp::NotMatch => unreachable!("handled above"),
        }
    }

    fn fold_unary(&self, op: UnOp, operand: &Expr<'z>, span: Span) -> Result<Expr<'z>, CompileError> {
        let operand = self.fold_expr(operand)?;
        let Expr::Literal(lit) = operand else {
            return Ok(Expr::Unary { op, operand: self.zone.alloc(operand), span });
        };
        let folded = match op {
            UnOp::Not => Some(Literal::Bool(!literal_truthy(&lit))),
            UnOp::Neg => match lit {
                Literal::Int(i) => Some(Literal::Int(i.wrapping_neg())),
                Literal::Real(r) => Some(Literal::Real(-r)),
                _ => None,
            },
            UnOp::Pos => match lit {
                Literal::Int(_) | Literal::Real(_) => Some(lit),
                _ => None,
            },
        };
        match folded {
            Some(lit) => Ok(Expr::Literal(lit)),
            None => Err(CompileError::ConstFoldTypeError(SourceError {
                span,
                message: format!("unsupported operand type for unary operator: {}", type_name_of_literal(&lit)),
            })),
        }
    }
}

/// Truthiness for a literal, matching the runtime's primitive coercion
/// (`Value::to_bool_primitive`) extended to the literal-only types (sizes,
/// durations, and strings are always truthy as literals).
fn literal_truthy(lit: &Literal) -> bool {
    match lit {
        Literal::Null => false,
        Literal::Bool(b) => *b,
        Literal::Int(i) => *i != 0,
        Literal::Real(r) => *r != 0.0,
        Literal::Size(_) | Literal::Duration(_) | Literal::Str(_) => true,
    }
}

fn literal_as_value(lit: &Literal) -> Option<Value> {
    Some(match *lit {
        Literal::Int(i) => Value::Int(i),
        Literal::Real(r) => Value::Real(r),
        Literal::Bool(b) => Value::Bool(b),
        Literal::Null => Value::Null,
        Literal::Size(s) => Value::Size(s),
        Literal::Duration(d) => Value::Duration(d),
        Literal::Str(_) => return None,
    })
}

fn value_to_literal<'z>(v: Value) -> Literal<'z> {
    match v {
        Value::Int(i) => Literal::Int(i),
        Value::Real(r) => Literal::Real(r),
        Value::Bool(b) => Literal::Bool(b),
        Value::Null => Literal::Null,
        Value::Size(s) => Literal::Size(s),
        Value::Duration(d) => Literal::Duration(d),
        // Arithmetic helpers only ever return the primitive variants above.
        _ => unreachable!("arithmetic never produces a heap value"),
    }
}

fn type_name_of_literal(lit: &Literal) -> &'static str {
    match lit {
        Literal::Int(_) => "integer",
        Literal::Real(_) => "real",
        Literal::Bool(_) => "boolean",
        Literal::Null => "null",
        Literal::Size(_) => "size",
        Literal::Duration(_) => "duration",
        Literal::Str(_) => "string",
    }
}

fn op_text(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::Mod => "%",
        BinOp::Eq => "==",
        BinOp::Ne => "!=",
        BinOp::Lt => "<",
        BinOp::Le => "<=",
        BinOp::Gt => ">",
        BinOp::Ge => ">=",
        BinOp::Match => "~",
        BinOp::NotMatch => "!~",
        BinOp::And => "&&",
        BinOp::Or => "||",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zone::Zone;

    fn span() -> Span {
        Span { source_index: 0, line: 1, column: 1 }
    }

    fn lit<'z>(l: Literal<'z>) -> Expr<'z> {
        Expr::Literal(l)
    }

    #[test]
    fn folds_integer_arithmetic() {
        let zone = Zone::new();
        let folder = Folder::new(&zone);
        let expr = Expr::Binary {
            op: BinOp::Add,
            lhs: zone.alloc(lit(Literal::Int(2))),
            rhs: zone.alloc(lit(Literal::Int(3))),
            span: span(),
        };
        let folded = folder.fold_expr(&expr).unwrap();
        assert!(matches!(folded, Expr::Literal(Literal::Int(5))));
    }

    #[test]
    fn folds_nested_expression_bottom_up() {
        let zone = Zone::new();
        let folder = Folder::new(&zone);
        // (2 + 3) * 4
        let inner = Expr::Binary {
            op: BinOp::Add,
            lhs: zone.alloc(lit(Literal::Int(2))),
            rhs: zone.alloc(lit(Literal::Int(3))),
            span: span(),
        };
        let outer = Expr::Binary { op: BinOp::Mul, lhs: zone.alloc(inner), rhs: zone.alloc(lit(Literal::Int(4))), span: span() };
        let folded = folder.fold_expr(&outer).unwrap();
        assert!(matches!(folded, Expr::Literal(Literal::Int(20))));
    }

    #[test]
    fn divide_by_zero_is_a_compile_error() {
        let zone = Zone::new();
        let folder = Folder::new(&zone);
        let expr = Expr::Binary {
            op: BinOp::Div,
            lhs: zone.alloc(lit(Literal::Int(1))),
            rhs: zone.alloc(lit(Literal::Int(0))),
            span: span(),
        };
        assert!(matches!(folder.fold_expr(&expr), Err(CompileError::ConstFoldDivideByZero(_))));
    }

    #[test]
    fn mixed_type_mismatch_is_a_compile_error() {
        let zone = Zone::new();
        let folder = Folder::new(&zone);
        let expr = Expr::Binary {
            op: BinOp::Add,
            lhs: zone.alloc(lit(Literal::Null)),
            rhs: zone.alloc(lit(Literal::Int(1))),
            span: span(),
        };
        assert!(matches!(folder.fold_expr(&expr), Err(CompileError::ConstFoldTypeError(_))));
    }

    #[test]
    fn does_not_fold_when_an_operand_is_not_literal() {
        let zone = Zone::new();
        let folder = Folder::new(&zone);
        let expr = Expr::Binary {
            op: BinOp::Mul,
            lhs: zone.alloc(Expr::Var(zone.alloc_str("x"))),
            rhs: zone.alloc(lit(Literal::Int(0))),
            span: span(),
        };
        let folded = folder.fold_expr(&expr).unwrap();
        assert!(matches!(folded, Expr::Binary { .. }));
    }

    #[test]
    fn and_short_circuits_on_false_without_erroring_on_the_rhs() {
        let zone = Zone::new();
        let folder = Folder::new(&zone);
        // false && (1 / 0) must not raise: the rhs is never evaluated.
        let rhs = Expr::Binary {
            op: BinOp::Div,
            lhs: zone.alloc(lit(Literal::Int(1))),
            rhs: zone.alloc(lit(Literal::Int(0))),
            span: span(),
        };
        let expr = Expr::Binary { op: BinOp::And, lhs: zone.alloc(lit(Literal::Bool(false))), rhs: zone.alloc(rhs), span: span() };
        let folded = folder.fold_expr(&expr).unwrap();
        assert!(matches!(folded, Expr::Literal(Literal::Bool(false))));
    }

    #[test]
    fn or_short_circuits_on_true() {
        let zone = Zone::new();
        let folder = Folder::new(&zone);
        let expr = Expr::Binary {
            op: BinOp::Or,
            lhs: zone.alloc(lit(Literal::Bool(true))),
            rhs: zone.alloc(Expr::Var(zone.alloc_str("unreachable"))),
            span: span(),
        };
        let folded = folder.fold_expr(&expr).unwrap();
        assert!(matches!(folded, Expr::Literal(Literal::Bool(true))));
    }

    #[test]
    fn ternary_with_literal_condition_collapses_to_taken_branch() {
        let zone = Zone::new();
        let folder = Folder::new(&zone);
        let expr = Expr::Ternary {
            cond: zone.alloc(lit(Literal::Bool(false))),
            then_branch: zone.alloc(Expr::Var(zone.alloc_str("untaken"))),
            else_branch: zone.alloc(lit(Literal::Int(7))),
        };
        let folded = folder.fold_expr(&expr).unwrap();
        assert!(matches!(folded, Expr::Literal(Literal::Int(7))));
    }

    #[test]
    fn string_literals_concatenate() {
        let zone = Zone::new();
        let folder = Folder::new(&zone);
        let expr = Expr::Binary {
            op: BinOp::Add,
            lhs: zone.alloc(lit(Literal::Str(zone.alloc_str("foo")))),
            rhs: zone.alloc(lit(Literal::Str(zone.alloc_str("bar")))),
            span: span(),
        };
        let folded = folder.fold_expr(&expr).unwrap();
        match folded {
            Expr::Literal(Literal::Str(s)) => assert_eq!(s, "foobar"),
            other => panic!("expected a folded string literal, got {other:?}"),
        }
    }

    #[test]
    fn match_operator_is_never_folded() {
        let zone = Zone::new();
        let folder = Folder::new(&zone);
        let expr = Expr::Binary {
            op: BinOp::Match,
            lhs: zone.alloc(lit(Literal::Str(zone.alloc_str("hello")))),
            rhs: zone.alloc(lit(Literal::Str(zone.alloc_str("^h")))),
            span: span(),
        };
        let folded = folder.fold_expr(&expr).unwrap();
        assert!(matches!(folded, Expr::Binary { op: BinOp::Match, .. }));
    }

    #[test]
    fn negation_of_literal_int_folds() {
        let zone = Zone::new();
        let folder = Folder::new(&zone);
        let expr = Expr::Unary { op: UnOp::Neg, operand: zone.alloc(lit(Literal::Int(5))), span: span() };
        let folded = folder.fold_expr(&expr).unwrap();
        assert!(matches!(folded, Expr::Literal(Literal::Int(-5))));
    }

    #[test]
    fn fold_file_recurses_into_sub_bodies() {
        let zone = Zone::new();
        let folder = Folder::new(&zone);
        let sum = Expr::Binary {
            op: BinOp::Add,
            lhs: zone.alloc(lit(Literal::Int(1))),
            rhs: zone.alloc(lit(Literal::Int(1))),
            span: span(),
        };
        let stmt = Stmt::ExprStmt(sum, span());
        let sub = SubDecl { name: "vcl_recv", params: &[], body: zone.alloc_slice(&[stmt]), span: span() };
        let file = File { vcl_version: 4.0, items: zone.alloc_slice(&[TopLevel::Sub(sub)]) };
        let folded = folder.fold_file(&file).unwrap();
        let TopLevel::Sub(folded_sub) = folded.items[0] else { panic!("expected a sub") };
        assert!(matches!(folded_sub.body[0], Stmt::ExprStmt(Expr::Literal(Literal::Int(2)), _)));
    }
}
