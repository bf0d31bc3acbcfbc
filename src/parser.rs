//! Recursive-descent parser with Pratt-style precedence climbing (§4.3).
//!
//! Produces [`ast`] nodes allocated in a caller-supplied [`Zone`]; the
//! returned [`ast::File`] borrows from both the zone and nothing else, so it
//! outlives the parser itself. `break`/`continue` are only legal while a
//! loop scope is open; `include` is only legal at file scope; `else`
//! branches (under any of the three accepted spellings) must trail an `if`.

use crate::ast::{
    AclDecl, AclEntry, Action, AssignOp, BinOp, Expr, ExtensionDecl, File, GlobalDecl, LValue, Literal,
    ReturnValue, Span, Stmt, StrPart, SubDecl, TopLevel, UnOp,
};
use crate::error::ParseError;
use crate::lexer::{Lexer, Lexeme, Token, VarMode};
use crate::zone::Zone;

/// Deterministic per-compile counter backing fresh anonymous names.
/// Two parses given the same starting seed produce identical names, which
/// is what makes repeated compiles of the same sources reproducible.
#[derive(Debug, Clone, Copy, Default)]
pub struct NameSeed(pub u64);

pub struct Parser<'z, 's> {
    zone: &'z Zone,
    lexer: Lexer<'s>,
    current: Lexeme,
    seed: u64,
    loop_depth: u32,
}

type PResult<T> = Result<T, ParseError>;

impl<'z, 's> Parser<'z, 's> {
    pub fn new(zone: &'z Zone, source: &'s str, source_index: u32, seed: NameSeed) -> PResult<Self> {
        let mut lexer = Lexer::new(source, source_index);
        let current = lexer.next().map_err(ParseError::Lex)?;
        Ok(Parser { zone, lexer, current, seed: seed.0, loop_depth: 0 })
    }

    /// The seed value to hand to the next parse for continued determinism.
    pub fn next_seed(&self) -> NameSeed {
        NameSeed(self.seed)
    }

    fn span(&self) -> Span {
        self.current.span
    }

    fn err(&self, message: impl Into<String>) -> ParseError {
        ParseError::Syntax(crate::error::SourceError { span: self.span(), message: message.into() })
    }

    fn bump(&mut self) -> PResult<Lexeme> {
        self.advance(VarMode::Normal)
    }

    /// Consumes the current lookahead and fetches the next one, scanning it
    /// under `mode`. `mode` only ever needs to be `Extended` for the single
    /// token immediately following a `:` attribute-access operator — by the
    /// time any later token is current, the dash-allowed name has already
    /// been folded into one `Var` lexeme.
    fn advance(&mut self, mode: VarMode) -> PResult<Lexeme> {
        let next = match mode {
            VarMode::Normal => self.lexer.next().map_err(ParseError::Lex)?,
            VarMode::Extended => self.lexer.next_extended_var(VarMode::Extended).map_err(ParseError::Lex)?,
        };
        Ok(std::mem::replace(&mut self.current, next))
    }

    fn eat(&mut self, tok: &Token) -> PResult<bool> {
        if &self.current.token == tok {
            self.bump()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect(&mut self, tok: &Token) -> PResult<Lexeme> {
        if &self.current.token == tok {
            self.bump()
        } else {
            Err(self.err(format!("expected {tok:?}, found {:?}", self.current.token)))
        }
    }

    fn expect_var(&mut self) -> PResult<&'z str> {
        match self.bump()?.token {
            Token::Var(name) => Ok(self.zone.alloc_str(&name)),
            other => Err(self.err(format!("expected an identifier, found {other:?}"))),
        }
    }

    fn fresh_sub_name(&mut self) -> &'z str {
        let name = format!("@__anonymous_sub__::{}", self.seed);
        self.seed += 1;
        self.zone.alloc_str(&name)
    }

    // ---------------------------------------------------------------- top level

    pub fn parse_file(&mut self) -> PResult<File<'z>> {
        self.expect(&Token::Vcl)?;
        let vcl_version = match self.bump()?.token {
            Token::Real(v) => v,
            Token::Int(v) => v as f64,
            other => return Err(self.err(format!("expected the `vcl` version number, found {other:?}"))),
        };
        self.expect(&Token::Semicolon)?;

        let mut items = Vec::new();
        while self.current.token != Token::Eof {
            items.push(self.parse_top_level_item()?);
        }
        Ok(File { vcl_version, items: self.zone.alloc_slice(&items) })
    }

    fn parse_top_level_item(&mut self) -> PResult<TopLevel<'z>> {
        match &self.current.token {
            Token::Include => self.parse_include(),
            Token::Import => self.parse_import(),
            Token::Sub => self.parse_sub(),
            Token::Acl => self.parse_acl(),
            Token::Global => self.parse_global(),
            Token::Var(_) => self.parse_extension_decl(),
            other => Err(self.err(format!("expected a top-level form, found {other:?}"))),
        }
    }

    fn parse_include(&mut self) -> PResult<TopLevel<'z>> {
        let span = self.span();
        self.bump()?;
        let path = match self.bump()?.token {
            Token::Str(s) => self.zone.alloc_str(&s),
            other => return Err(self.err(format!("expected a string path after `include`, found {other:?}"))),
        };
        self.expect(&Token::Semicolon)?;
        Ok(TopLevel::Include { path, span })
    }

    fn parse_import(&mut self) -> PResult<TopLevel<'z>> {
        let span = self.span();
        self.bump()?;
        let name = self.expect_var()?;
        self.expect(&Token::Semicolon)?;
        Ok(TopLevel::Import { name, span })
    }

    fn parse_sub(&mut self) -> PResult<TopLevel<'z>> {
        let span = self.span();
        self.bump()?;
        let name = self.expect_var()?;
        let mut params = Vec::new();
        if self.eat(&Token::LParen)? {
            if self.current.token != Token::RParen {
                loop {
                    params.push(self.expect_var()?);
                    if !self.eat(&Token::Comma)? {
                        break;
                    }
                }
            }
            self.expect(&Token::RParen)?;
        }
        let body = self.parse_chunk()?;
        Ok(TopLevel::Sub(SubDecl { name, params: self.zone.alloc_slice(&params), body, span }))
    }

    /// `sub (<params>?) { <stmt>* }` in expression position — the same
    /// shape as a top-level `sub` declaration, minus the name.
    fn parse_anonymous_sub(&mut self) -> PResult<Expr<'z>> {
        let span = self.span();
        self.bump()?;
        let mut params = Vec::new();
        if self.eat(&Token::LParen)? {
            if self.current.token != Token::RParen {
                loop {
                    params.push(self.expect_var()?);
                    if !self.eat(&Token::Comma)? {
                        break;
                    }
                }
            }
            self.expect(&Token::RParen)?;
        }
        let body = self.parse_chunk()?;
        let name = self.fresh_sub_name();
        Ok(Expr::AnonymousSub { name, params: self.zone.alloc_slice(&params), body, span })
    }

    fn parse_acl(&mut self) -> PResult<TopLevel<'z>> {
        self.bump()?;
        let name = self.expect_var()?;
        self.expect(&Token::LBrace)?;
        let mut entries = Vec::new();
        while self.current.token != Token::RBrace {
            let span = self.span();
            let negate = self.eat(&Token::Bang)?;
            let pattern = match self.bump()?.token {
                Token::Str(s) => self.zone.alloc_str(&s),
                other => return Err(self.err(format!("expected an IP pattern string, found {other:?}"))),
            };
            self.expect(&Token::Semicolon)?;
            entries.push(AclEntry { pattern, negate, span });
        }
        self.expect(&Token::RBrace)?;
        Ok(TopLevel::Acl(AclDecl { name, entries: self.zone.alloc_slice(&entries) }))
    }

    fn parse_global(&mut self) -> PResult<TopLevel<'z>> {
        let span = self.span();
        self.bump()?;
        let name = self.expect_var()?;
        self.expect(&Token::Assign)?;
        let init = self.parse_expr()?;
        self.expect(&Token::Semicolon)?;
        Ok(TopLevel::Global(GlobalDecl { name, init, span }))
    }

    /// `<Type> <name> { .field = expr; ... };` — an extension instance
    /// declared at file scope.
    fn parse_extension_decl(&mut self) -> PResult<TopLevel<'z>> {
        let span = self.span();
        let type_name = self.expect_var()?;
        let name = self.expect_var()?;
        let init = self.parse_extension_initializer(type_name)?;
        self.expect(&Token::Semicolon)?;
        Ok(TopLevel::Extension(ExtensionDecl { type_name, name, init, span }))
    }

    // ---------------------------------------------------------------- statements

    fn parse_chunk(&mut self) -> PResult<&'z [Stmt<'z>]> {
        self.expect(&Token::LBrace)?;
        let mut stmts = Vec::new();
        while self.current.token != Token::RBrace {
            stmts.push(self.parse_statement()?);
        }
        self.expect(&Token::RBrace)?;
        Ok(self.zone.alloc_slice(&stmts))
    }

    /// A `chunk` or a single statement followed by `;`, as accepted after
    /// `if`/`elif`/`elsif`/`elseif`/`else`/`for`.
    fn parse_single_stmt_or_chunk(&mut self) -> PResult<&'z [Stmt<'z>]> {
        if self.current.token == Token::LBrace {
            self.parse_chunk()
        } else {
            let stmt = self.parse_statement()?;
            Ok(self.zone.alloc_slice(&[stmt]))
        }
    }

    fn parse_statement(&mut self) -> PResult<Stmt<'z>> {
        match &self.current.token {
            Token::Return => self.parse_return(),
            Token::Call => self.parse_call_stmt(),
            Token::Set => self.parse_set(),
            Token::Unset => self.parse_unset(),
            Token::New => self.parse_new(),
            Token::Declare => self.parse_declare(),
            Token::If => self.parse_if(),
            Token::For => self.parse_for(),
            Token::Break => {
                let span = self.span();
                self.bump()?;
                self.expect(&Token::Semicolon)?;
                if self.loop_depth == 0 {
                    return Err(ParseError::Syntax(crate::error::SourceError {
                        span,
                        message: "`break` statement can only appear inside a loop body".into(),
                    }));
                }
                Ok(Stmt::Break(span))
            }
            Token::Continue => {
                let span = self.span();
                self.bump()?;
                self.expect(&Token::Semicolon)?;
                if self.loop_depth == 0 {
                    return Err(ParseError::Syntax(crate::error::SourceError {
                        span,
                        message: "`continue` statement can only appear inside a loop body".into(),
                    }));
                }
                Ok(Stmt::Continue(span))
            }
            _ => self.parse_prefix_statement(),
        }
    }

    fn parse_return(&mut self) -> PResult<Stmt<'z>> {
        let span = self.span();
        self.bump()?;
        if self.eat(&Token::Semicolon)? {
            return Ok(Stmt::Return { value: ReturnValue::None, span });
        }
        if self.eat(&Token::LBrace)? {
            let value = if self.current.token == Token::RBrace {
                ReturnValue::None
            } else {
                ReturnValue::Expr(self.parse_expr()?)
            };
            self.expect(&Token::RBrace)?;
            self.expect(&Token::Semicolon)?;
            return Ok(Stmt::Return { value, span });
        }
        self.expect(&Token::LParen)?;
        let value = if let Token::Var(name) = &self.current.token {
            if let Some(action) = Action::from_name(name) {
                self.bump()?;
                ReturnValue::Action(action)
            } else {
                ReturnValue::Expr(self.parse_expr()?)
            }
        } else {
            ReturnValue::Expr(self.parse_expr()?)
        };
        self.expect(&Token::RParen)?;
        self.expect(&Token::Semicolon)?;
        Ok(Stmt::Return { value, span })
    }

    fn parse_call_stmt(&mut self) -> PResult<Stmt<'z>> {
        let span = self.span();
        self.bump()?;
        let name = self.expect_var()?;
        let args = self.parse_optional_arglist()?;
        self.expect(&Token::Semicolon)?;
        Ok(Stmt::Call { name, args, span })
    }

    fn parse_optional_arglist(&mut self) -> PResult<&'z [Expr<'z>]> {
        if !self.eat(&Token::LParen)? {
            return Ok(&[]);
        }
        let mut args = Vec::new();
        if self.current.token != Token::RParen {
            loop {
                args.push(self.parse_expr()?);
                if !self.eat(&Token::Comma)? {
                    break;
                }
            }
        }
        self.expect(&Token::RParen)?;
        Ok(self.zone.alloc_slice(&args))
    }

    fn assign_op(tok: &Token) -> Option<AssignOp> {
        Some(match tok {
            Token::Assign => AssignOp::Assign,
            Token::AddAssign => AssignOp::AddAssign,
            Token::SubAssign => AssignOp::SubAssign,
            Token::MulAssign => AssignOp::MulAssign,
            Token::DivAssign => AssignOp::DivAssign,
            Token::ModAssign => AssignOp::ModAssign,
            _ => return None,
        })
    }

    fn parse_set(&mut self) -> PResult<Stmt<'z>> {
        let span = self.span();
        self.bump()?;
        let target = self.parse_lvalue()?;
        let op = Self::assign_op(&self.current.token)
            .ok_or_else(|| self.err(format!("expected an assignment operator, found {:?}", self.current.token)))?;
        self.bump()?;
        let value = self.parse_expr()?;
        self.expect(&Token::Semicolon)?;
        Ok(Stmt::Set { target, op, value, span })
    }

    fn parse_unset(&mut self) -> PResult<Stmt<'z>> {
        let span = self.span();
        self.bump()?;
        let target = self.parse_lvalue()?;
        self.expect(&Token::Semicolon)?;
        Ok(Stmt::Unset { target, span })
    }

    fn parse_declare(&mut self) -> PResult<Stmt<'z>> {
        let span = self.span();
        self.bump()?;
        let name = self.expect_var()?;
        let init = if self.eat(&Token::Assign)? { Some(self.parse_expr()?) } else { None };
        self.expect(&Token::Semicolon)?;
        Ok(Stmt::Declare { name, init, span })
    }

    fn parse_new(&mut self) -> PResult<Stmt<'z>> {
        let span = self.span();
        self.bump()?;
        let name = self.expect_var()?;
        self.expect(&Token::Assign)?;
        let init = self.parse_expr()?;
        self.expect(&Token::Semicolon)?;
        Ok(Stmt::New { name, init, span })
    }

    fn parse_if(&mut self) -> PResult<Stmt<'z>> {
        self.bump()?;
        let mut arms = Vec::new();
        self.expect(&Token::LParen)?;
        let cond = self.parse_expr()?;
        self.expect(&Token::RParen)?;
        let body = self.parse_single_stmt_or_chunk()?;
        arms.push((cond, body));
        loop {
            match &self.current.token {
                Token::Elif | Token::Elsif | Token::Elseif => {
                    self.bump()?;
                    self.expect(&Token::LParen)?;
                    let cond = self.parse_expr()?;
                    self.expect(&Token::RParen)?;
                    let body = self.parse_single_stmt_or_chunk()?;
                    arms.push((cond, body));
                }
                _ => break,
            }
        }
        let else_branch =
            if self.eat(&Token::Else)? { Some(self.parse_single_stmt_or_chunk()?) } else { None };
        Ok(Stmt::If { arms: self.zone.alloc_slice(&arms), else_branch })
    }

    fn parse_for(&mut self) -> PResult<Stmt<'z>> {
        let span = self.span();
        self.bump()?;
        self.expect(&Token::LParen)?;
        let key = self.expect_var()?;
        let value = if self.eat(&Token::Comma)? { Some(self.expect_var()?) } else { None };
        self.expect(&Token::Colon)?;
        let iterable = self.parse_expr()?;
        self.expect(&Token::RParen)?;
        self.loop_depth += 1;
        let body = self.parse_single_stmt_or_chunk();
        self.loop_depth -= 1;
        Ok(Stmt::For { key, value, iterable, body: body?, span })
    }

    /// A bare prefix expression used as a statement: either `call`-less
    /// subroutine invocation syntax (`name(args);`) or any other
    /// expression evaluated for side effects, per the grammar's
    /// `prefix-expr ;` production.
    fn parse_prefix_statement(&mut self) -> PResult<Stmt<'z>> {
        let span = self.span();
        let expr = self.parse_expr()?;
        self.expect(&Token::Semicolon)?;
        if let Expr::Call { callee, args, span } = expr {
            Ok(Stmt::Call { name: callee, args, span })
        } else {
            Ok(Stmt::ExprStmt(expr, span))
        }
    }

    fn parse_lvalue(&mut self) -> PResult<LValue<'z>> {
        let name = self.expect_var()?;
        let mut lvalue = LValue::Var(name);
        let mut base_expr = Expr::Var(name);
        loop {
            match &self.current.token {
                Token::Dot => {
                    self.bump()?;
                    let field = self.expect_var()?;
                    lvalue = LValue::Property { base: self.zone.alloc(base_expr), name: field };
                    base_expr = Expr::Property { base: self.zone.alloc(base_expr), name: field };
                }
                Token::Colon => {
                    let field = self.expect_attribute_name()?;
                    lvalue = LValue::Attribute { base: self.zone.alloc(base_expr), name: field };
                    base_expr = Expr::Attribute { base: self.zone.alloc(base_expr), name: field };
                }
                Token::LBracket => {
                    self.bump()?;
                    let index = self.parse_expr()?;
                    self.expect(&Token::RBracket)?;
                    lvalue = LValue::Index { base: self.zone.alloc(base_expr), index: self.zone.alloc(index) };
                    base_expr =
                        Expr::Index { base: self.zone.alloc(base_expr), index: self.zone.alloc(index) };
                }
                _ => break,
            }
        }
        Ok(lvalue)
    }

    /// Consumes a `:` already matched as `current` and reads the
    /// dash-allowed attribute name that follows it.
    fn expect_attribute_name(&mut self) -> PResult<&'z str> {
        self.advance(VarMode::Extended)?;
        self.expect_var()
    }

    // ---------------------------------------------------------------- expressions

    pub fn parse_expr(&mut self) -> PResult<Expr<'z>> {
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> PResult<Expr<'z>> {
        if self.current.token == Token::If {
            self.bump()?;
            self.expect(&Token::LParen)?;
            let cond = self.parse_expr()?;
            self.expect(&Token::Comma)?;
            let then_branch = self.parse_expr()?;
            self.expect(&Token::Comma)?;
            let else_branch = self.parse_expr()?;
            self.expect(&Token::RParen)?;
            return Ok(Expr::Ternary {
                cond: self.zone.alloc(cond),
                then_branch: self.zone.alloc(then_branch),
                else_branch: self.zone.alloc(else_branch),
            });
        }
        self.parse_or()
    }

    fn parse_or(&mut self) -> PResult<Expr<'z>> {
        let mut lhs = self.parse_and()?;
        while self.current.token == Token::OrOr {
            let span = self.span();
            self.bump()?;
            let rhs = self.parse_and()?;
            lhs = Expr::Binary { op: BinOp::Or, lhs: self.zone.alloc(lhs), rhs: self.zone.alloc(rhs), span };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> PResult<Expr<'z>> {
        let mut lhs = self.parse_equality()?;
        while self.current.token == Token::AndAnd {
            let span = self.span();
            self.bump()?;
            let rhs = self.parse_equality()?;
            lhs = Expr::Binary { op: BinOp::And, lhs: self.zone.alloc(lhs), rhs: self.zone.alloc(rhs), span };
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> PResult<Expr<'z>> {
        let mut lhs = self.parse_relational()?;
        loop {
            let op = match &self.current.token {
                Token::EqEq => BinOp::Eq,
                Token::Ne => BinOp::Ne,
                Token::Match => BinOp::Match,
                Token::NotMatch => BinOp::NotMatch,
                _ => break,
            };
            let span = self.span();
            self.bump()?;
            let rhs = self.parse_relational()?;
            lhs = Expr::Binary { op, lhs: self.zone.alloc(lhs), rhs: self.zone.alloc(rhs), span };
        }
        Ok(lhs)
    }

    fn parse_relational(&mut self) -> PResult<Expr<'z>> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match &self.current.token {
                Token::Lt => BinOp::Lt,
                Token::Le => BinOp::Le,
                Token::Gt => BinOp::Gt,
                Token::Ge => BinOp::Ge,
                _ => break,
            };
            let span = self.span();
            self.bump()?;
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary { op, lhs: self.zone.alloc(lhs), rhs: self.zone.alloc(rhs), span };
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> PResult<Expr<'z>> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match &self.current.token {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => break,
            };
            let span = self.span();
            self.bump()?;
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary { op, lhs: self.zone.alloc(lhs), rhs: self.zone.alloc(rhs), span };
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> PResult<Expr<'z>> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match &self.current.token {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::Percent => BinOp::Mod,
                _ => break,
            };
            let span = self.span();
            self.bump()?;
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary { op, lhs: self.zone.alloc(lhs), rhs: self.zone.alloc(rhs), span };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> PResult<Expr<'z>> {
        let op = match &self.current.token {
            Token::Minus => Some(UnOp::Neg),
            Token::Plus => Some(UnOp::Pos),
            Token::Bang => Some(UnOp::Not),
            _ => None,
        };
        if let Some(op) = op {
            let span = self.span();
            self.bump()?;
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary { op, operand: self.zone.alloc(operand), span });
        }
        self.parse_postfix()
    }

    /// A primary expression followed by zero or more `.field`, `:attr`,
    /// `[index]`, or `(args)` suffixes.
    fn parse_postfix(&mut self) -> PResult<Expr<'z>> {
        let mut expr = self.parse_primary()?;
        loop {
            match &self.current.token {
                Token::Dot => {
                    self.bump()?;
                    let name = self.expect_var()?;
                    expr = Expr::Property { base: self.zone.alloc(expr), name };
                }
                Token::Colon => {
                    let name = self.expect_attribute_name()?;
                    expr = Expr::Attribute { base: self.zone.alloc(expr), name };
                }
                Token::LBracket => {
                    self.bump()?;
                    let index = self.parse_expr()?;
                    self.expect(&Token::RBracket)?;
                    expr = Expr::Index { base: self.zone.alloc(expr), index: self.zone.alloc(index) };
                }
                Token::LParen => {
                    let span = self.span();
                    let callee = match expr {
                        Expr::Var(name) => name,
                        _ => break,
                    };
                    let args = self.parse_optional_arglist()?;
                    expr = Expr::Call { callee, args, span };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> PResult<Expr<'z>> {
        match self.current.token.clone() {
            Token::Int(v) => {
                self.bump()?;
                Ok(Expr::Literal(Literal::Int(v)))
            }
            Token::Real(v) => {
                self.bump()?;
                Ok(Expr::Literal(Literal::Real(v)))
            }
            Token::True => {
                self.bump()?;
                Ok(Expr::Literal(Literal::Bool(true)))
            }
            Token::False => {
                self.bump()?;
                Ok(Expr::Literal(Literal::Bool(false)))
            }
            Token::Null => {
                self.bump()?;
                Ok(Expr::Literal(Literal::Null))
            }
            Token::Size(s) => {
                self.bump()?;
                Ok(Expr::Literal(Literal::Size(s)))
            }
            Token::Duration(d) => {
                self.bump()?;
                Ok(Expr::Literal(Literal::Duration(d)))
            }
            Token::Str(s) => {
                self.bump()?;
                Ok(Expr::Literal(Literal::Str(self.zone.alloc_str(&s))))
            }
            Token::InterpStart => self.parse_string_interpolation(),
            Token::LBracket => self.parse_list_literal(),
            Token::LBrace => self.parse_dict_literal(),
            Token::LParen => {
                self.bump()?;
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Token::Var(name) => {
                self.bump()?;
                // `TypeName { .field = expr; ... }` used as an expression
                // (an extension literal) vs. a bare variable reference.
                if self.current.token == Token::LBrace {
                    let type_name = self.zone.alloc_str(&name);
                    self.parse_extension_initializer(type_name)
                } else {
                    Ok(Expr::Var(self.zone.alloc_str(&name)))
                }
            }
            Token::Sub => self.parse_anonymous_sub(),
            other => Err(self.err(format!("expected an expression, found {other:?}"))),
        }
    }

    fn parse_list_literal(&mut self) -> PResult<Expr<'z>> {
        self.bump()?; // [
        let mut items = Vec::new();
        if self.current.token != Token::RBracket {
            loop {
                items.push(self.parse_expr()?);
                if !self.eat(&Token::Comma)? {
                    break;
                }
            }
        }
        self.expect(&Token::RBracket)?;
        Ok(Expr::List(self.zone.alloc_slice(&items)))
    }

    fn parse_dict_literal(&mut self) -> PResult<Expr<'z>> {
        self.bump()?; // {
        let mut entries = Vec::new();
        if self.current.token != Token::RBrace {
            loop {
                let key = match self.bump()?.token {
                    Token::Str(s) => self.zone.alloc_str(&s),
                    Token::Var(s) => self.zone.alloc_str(&s),
                    other => return Err(self.err(format!("expected a dict key, found {other:?}"))),
                };
                self.expect(&Token::Colon)?;
                let value = self.parse_expr()?;
                entries.push((key, value));
                if !self.eat(&Token::Comma)? {
                    break;
                }
            }
        }
        self.expect(&Token::RBrace)?;
        Ok(Expr::Dict(self.zone.alloc_slice(&entries)))
    }

    /// `{ .field = expr; ... }`, shared by the extension-literal
    /// expression form and the top-level extension-declaration statement.
    fn parse_extension_initializer(&mut self, type_name: &'z str) -> PResult<Expr<'z>> {
        self.expect(&Token::LBrace)?;
        let mut fields = Vec::new();
        while self.current.token != Token::RBrace {
            self.expect(&Token::Dot)?;
            let field = self.expect_var()?;
            self.expect(&Token::Assign)?;
            let value = self.parse_expr()?;
            self.expect(&Token::Semicolon)?;
            fields.push((field, value));
        }
        self.expect(&Token::RBrace)?;
        Ok(Expr::Extension { type_name, fields: self.zone.alloc_slice(&fields) })
    }

    /// `'text ${expr} more text'`.
    fn parse_string_interpolation(&mut self) -> PResult<Expr<'z>> {
        self.bump()?; // consumes InterpStart, lexer switches to interpolation state
        let mut parts = Vec::new();
        loop {
            match self.current.token.clone() {
                Token::Segment(text) => {
                    self.bump()?;
                    if !text.is_empty() {
                        parts.push(StrPart::Text(self.zone.alloc_str(&text)));
                    }
                }
                Token::CodeStart => {
                    self.bump()?;
                    let expr = self.parse_expr()?;
                    self.expect(&Token::RBrace)?;
                    self.lexer.end_code_segment();
                    self.current = self.lexer.next().map_err(ParseError::Lex)?;
                    parts.push(StrPart::Expr(self.zone.alloc(expr)));
                }
                Token::InterpEnd => {
                    self.bump()?;
                    break;
                }
                other => return Err(self.err(format!("unexpected token in string interpolation: {other:?}"))),
            }
        }
        Ok(Expr::Interp(self.zone.alloc_slice(&parts)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Duration, Size};

    fn parse(src: &str) -> File<'static> {
        let zone: &'static Zone = Box::leak(Box::new(Zone::new()));
        let mut parser = Parser::new(zone, src, 0, NameSeed(0)).unwrap();
        parser.parse_file().unwrap()
    }

    #[test]
    fn parses_minimal_file_header() {
        let file = parse("vcl 4.0; sub vcl_recv { return(lookup); }");
        assert_eq!(file.vcl_version, 4.0);
        assert_eq!(file.items.len(), 1);
    }

    #[test]
    fn parses_binary_precedence() {
        let file = parse("vcl 4.0; sub s { set req.x = 1 + 2 * 3; }");
        let TopLevel::Sub(sub) = file.items[0] else { panic!() };
        let Stmt::Set { value, .. } = sub.body[0] else { panic!() };
        let Expr::Binary { op: BinOp::Add, rhs, .. } = value else { panic!() };
        assert!(matches!(rhs, Expr::Binary { op: BinOp::Mul, .. }));
    }

    #[test]
    fn parses_ternary_and_or_and() {
        let file = parse("vcl 4.0; sub s { set req.x = if(a && b || c, 1, 2); }");
        let TopLevel::Sub(sub) = file.items[0] else { panic!() };
        let Stmt::Set { value, .. } = sub.body[0] else { panic!() };
        assert!(matches!(value, Expr::Ternary { .. }));
    }

    #[test]
    fn parses_for_with_key_value() {
        let file = parse("vcl 4.0; sub s { for (k, v : req.x) { break; } }");
        let TopLevel::Sub(sub) = file.items[0] else { panic!() };
        let Stmt::For { key, value, body, .. } = sub.body[0] else { panic!() };
        assert_eq!(key, "k");
        assert_eq!(value, Some("v"));
        assert_eq!(body.len(), 1);
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        let zone = Zone::new();
        let mut parser = Parser::new(&zone, "vcl 4.0; sub s { break; }", 0, NameSeed(0)).unwrap();
        assert!(parser.parse_file().is_err());
    }

    #[test]
    fn parses_list_and_dict_literals() {
        let file = parse(r#"vcl 4.0; sub s { set req.x = [1, 2]; set req.y = {"a": 1}; }"#);
        let TopLevel::Sub(sub) = file.items[0] else { panic!() };
        assert!(matches!(sub.body[0], Stmt::Set { value: Expr::List(_), .. }));
        assert!(matches!(sub.body[1], Stmt::Set { value: Expr::Dict(_), .. }));
    }

    #[test]
    fn parses_attribute_with_dash() {
        let file = parse(r#"vcl 4.0; sub s { set req.x = req:X-Forwarded-For; }"#);
        let TopLevel::Sub(sub) = file.items[0] else { panic!() };
        let Stmt::Set { value, .. } = sub.body[0] else { panic!() };
        let Expr::Attribute { name, .. } = value else { panic!() };
        assert_eq!(name, "X-Forwarded-For");
    }

    #[test]
    fn parses_string_interpolation_expr() {
        let file = parse(r#"vcl 4.0; sub s { set req.x = 'a ${1 + 2} b'; }"#);
        let TopLevel::Sub(sub) = file.items[0] else { panic!() };
        let Stmt::Set { value: Expr::Interp(parts), .. } = sub.body[0] else { panic!() };
        assert_eq!(parts.len(), 3);
        assert!(matches!(parts[0], StrPart::Text("a ")));
        assert!(matches!(parts[1], StrPart::Expr(_)));
        assert!(matches!(parts[2], StrPart::Text(" b")));
    }

    #[test]
    fn parses_size_and_duration_literals() {
        let file = parse("vcl 4.0; sub s { set req.x = 2kb3b; set req.y = 1h30min; }");
        let TopLevel::Sub(sub) = file.items[0] else { panic!() };
        assert!(matches!(
            sub.body[0],
            Stmt::Set { value: Expr::Literal(Literal::Size(Size { kb: 2, b: 3, .. })), .. }
        ));
        assert!(matches!(
            sub.body[1],
            Stmt::Set { value: Expr::Literal(Literal::Duration(Duration { h: 1, min: 30, .. })), .. }
        ));
    }

    #[test]
    fn parses_acl_with_negation() {
        let file = parse(r#"vcl 4.0; acl internal { "10.0.0.0/8"; !"192.168.0.1"; }"#);
        let TopLevel::Acl(acl) = file.items[0] else { panic!() };
        assert_eq!(acl.entries.len(), 2);
        assert!(!acl.entries[0].negate);
        assert!(acl.entries[1].negate);
    }

    #[test]
    fn parses_extension_declaration() {
        let file = parse(r#"vcl 4.0; Director mydir { .quorum = 1; }"#);
        assert!(matches!(file.items[0], TopLevel::Extension(_)));
    }

    #[test]
    fn anonymous_names_advance_deterministically_across_parses() {
        let zone = Zone::new();
        let mut first = Parser::new(&zone, "vcl 4.0;", 0, NameSeed(0)).unwrap();
        first.parse_file().unwrap();
        let a = first.fresh_sub_name();
        let b = first.fresh_sub_name();
        assert_ne!(a, b);
        assert!(a.ends_with("::0"));
        assert!(b.ends_with("::1"));
    }
}
