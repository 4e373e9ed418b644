use std::rc::Rc;

use super::ast::*;
use super::error::CompileError;
use super::lexer::{self, FStringPiece, SpannedToken, Token};

pub fn parse(tokens: Vec<SpannedToken>) -> Result<Program, Vec<CompileError>> {
    let mut parser = Parser::new(tokens);
    parser.parse_program()
}

/// Words that start a direction expression.
fn direction_word(name: &str) -> Option<DirectionWord> {
    match name {
        "Leftward" | "Decreasing" => Some(DirectionWord::Leftward),
        "Rightward" | "Increasing" => Some(DirectionWord::Rightward),
        "current" | "repeat" => Some(DirectionWord::Current),
        "opposite" | "reverse" => Some(DirectionWord::Opposite),
        _ => None,
    }
}

fn expr(kind: ExprKind, span: Span) -> Expr {
    Expr { kind, span }
}

struct Parser {
    tokens: Vec<SpannedToken>,
    pos: usize,
    errors: Vec<CompileError>,
}

impl Parser {
    fn new(tokens: Vec<SpannedToken>) -> Self {
        Self {
            tokens,
            pos: 0,
            errors: Vec::new(),
        }
    }

    fn parse_program(&mut self) -> Result<Program, Vec<CompileError>> {
        let mut statements = Vec::new();
        self.skip_terminators();
        while !self.at_eof() {
            match self.parse_stmt() {
                Ok(s) => statements.push(s),
                Err(e) => {
                    self.errors.push(e);
                    self.recover_to_semicolon();
                }
            }
            self.skip_terminators();
        }
        if self.errors.is_empty() {
            Ok(Program { statements })
        } else {
            Err(std::mem::take(&mut self.errors))
        }
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).map_or(&Token::Eof, |t| &t.token)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        self.tokens.get(self.pos + offset).map_or(&Token::Eof, |t| &t.token)
    }

    fn span(&self) -> Span {
        self.tokens.get(self.pos).map_or(Span::new(0, 0), |t| t.span)
    }

    /// Span of the last consumed token.
    fn prev_span(&self) -> Span {
        self.pos
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map_or(Span::new(0, 0), |t| t.span)
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek(), Token::Eof)
    }

    fn at_word(&self, word: &str) -> bool {
        matches!(self.peek(), Token::Ident(name) if name == word)
    }

    fn advance(&mut self) {
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
    }

    fn unexpected(&self, expected: &[&str]) -> CompileError {
        CompileError::parser(format!("Unexpected {}", self.peek().describe()), self.span())
            .expecting(expected)
    }

    fn expect(&mut self, expected: &Token, name: &str) -> Result<Span, CompileError> {
        if self.peek() == expected {
            let sp = self.span();
            self.advance();
            Ok(sp)
        } else {
            Err(self.unexpected(&[name]))
        }
    }

    fn expect_word(&mut self, word: &str) -> Result<Span, CompileError> {
        if self.at_word(word) {
            let sp = self.span();
            self.advance();
            Ok(sp)
        } else {
            Err(self.unexpected(&[word]))
        }
    }

    fn expect_ident(&mut self) -> Result<(String, Span), CompileError> {
        if let Token::Ident(name) = self.peek().clone() {
            let sp = self.span();
            self.advance();
            Ok((name, sp))
        } else {
            Err(self.unexpected(&["identifier"]))
        }
    }

    fn skip_terminators(&mut self) {
        while matches!(self.peek(), Token::Semicolon) {
            self.advance();
        }
    }

    fn expect_terminator(&mut self) -> Result<(), CompileError> {
        self.expect(&Token::Semicolon, "';'").map(|_| ())
    }

    fn recover_to_semicolon(&mut self) {
        while !matches!(self.peek(), Token::Semicolon | Token::Eof) {
            self.advance();
        }
        self.skip_terminators();
    }

    // ── Statements ────────────────────────────────────────────────

    /// `{ stmts }` or a single statement after a `:`.
    fn parse_block(&mut self) -> Result<Vec<Stmt>, CompileError> {
        if matches!(self.peek(), Token::LBrace) {
            self.advance();
            let stmts = self.parse_block_body()?;
            self.expect(&Token::RBrace, "'}'")?;
            Ok(stmts)
        } else {
            Ok(vec![self.parse_stmt()?])
        }
    }

    fn parse_block_body(&mut self) -> Result<Vec<Stmt>, CompileError> {
        let mut stmts = Vec::new();
        self.skip_terminators();
        while !matches!(self.peek(), Token::RBrace | Token::Eof) {
            stmts.push(self.parse_stmt()?);
            self.skip_terminators();
        }
        Ok(stmts)
    }

    fn parse_colon_block(&mut self) -> Result<Vec<Stmt>, CompileError> {
        self.expect(&Token::Colon, "':'")?;
        self.parse_block()
    }

    fn finish(&mut self, kind: StmtKind, start: Span) -> Result<Stmt, CompileError> {
        self.expect_terminator()?;
        Ok(Stmt {
            kind,
            span: start.merge(self.prev_span()),
        })
    }

    fn parse_stmt(&mut self) -> Result<Stmt, CompileError> {
        let start = self.span();
        let kind = match self.peek() {
            Token::LBrace => {
                self.advance();
                let body = self.parse_block_body()?;
                self.expect(&Token::RBrace, "'}'")?;
                StmtKind::Block(body)
            }
            Token::Def => self.parse_function_def()?,
            Token::If => self.parse_if()?,
            Token::While => {
                self.advance();
                let condition = self.parse_expr()?;
                let body = self.parse_colon_block()?;
                StmtKind::While { condition, body }
            }
            Token::For => self.parse_for()?,
            Token::With => self.parse_with()?,
            Token::Try => self.parse_try()?,
            Token::In => self.parse_carriage_pass()?,
            Token::Assert => {
                self.advance();
                let condition = self.parse_expr()?;
                let message = if matches!(self.peek(), Token::Comma) {
                    self.advance();
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                return self.finish(StmtKind::Assert { condition, message }, start);
            }
            Token::Print => {
                self.advance();
                let value = self.parse_expr()?;
                return self.finish(StmtKind::Print(value), start);
            }
            Token::Pause => {
                self.advance();
                return self.finish(StmtKind::Pause, start);
            }
            Token::Releasehook => {
                self.advance();
                return self.finish(StmtKind::Releasehook, start);
            }
            Token::Return => {
                self.advance();
                let value = if matches!(self.peek(), Token::Semicolon) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                return self.finish(StmtKind::Return(value), start);
            }
            Token::Global => {
                self.advance();
                let (name, _) = self.expect_ident()?;
                self.expect(&Token::Eq, "'='")?;
                let value = self.parse_expr()?;
                return self.finish(StmtKind::Global { name, value }, start);
            }
            Token::Import => {
                self.advance();
                let (first, _) = self.expect_ident()?;
                let mut path = vec![first];
                while matches!(self.peek(), Token::Dot) {
                    self.advance();
                    path.push(self.expect_ident()?.0);
                }
                let alias = if matches!(self.peek(), Token::As) {
                    self.advance();
                    Some(self.expect_ident()?.0)
                } else {
                    None
                };
                return self.finish(StmtKind::Import { path, alias }, start);
            }
            Token::Xfer => {
                let kind = self.parse_xfer()?;
                return self.finish(kind, start);
            }
            Token::Drop => {
                self.advance();
                let needles = self.parse_expr_list()?;
                return self.finish(StmtKind::Drop(needles), start);
            }
            Token::Cut | Token::Remove => {
                let is_cut = matches!(self.peek(), Token::Cut);
                self.advance();
                let carriers = if matches!(self.peek(), Token::Semicolon) {
                    Vec::new()
                } else {
                    self.parse_expr_list()?
                };
                let kind = if is_cut {
                    StmtKind::Cut(carriers)
                } else {
                    StmtKind::Remove(carriers)
                };
                return self.finish(kind, start);
            }
            Token::Push => {
                let kind = self.parse_push()?;
                return self.finish(kind, start);
            }
            Token::Swap => {
                let kind = self.parse_swap()?;
                return self.finish(kind, start);
            }
            _ => {
                let value = self.parse_expr()?;
                let kind = if matches!(self.peek(), Token::Eq) {
                    self.advance();
                    let target = match value.kind {
                        ExprKind::Ident(name) => AssignTarget::Name(name),
                        ExprKind::Index { object, index } => AssignTarget::Index {
                            object: *object,
                            index: *index,
                        },
                        _ => {
                            return Err(CompileError::parser(
                                "Cannot assign to this expression",
                                value.span,
                            ))
                        }
                    };
                    StmtKind::Assign {
                        target,
                        value: self.parse_expr()?,
                    }
                } else {
                    StmtKind::Expr(value)
                };
                return self.finish(kind, start);
            }
        };
        Ok(Stmt {
            kind,
            span: start.merge(self.prev_span()),
        })
    }

    fn parse_function_def(&mut self) -> Result<StmtKind, CompileError> {
        self.advance();
        let (name, _) = self.expect_ident()?;
        self.expect(&Token::LParen, "'('")?;
        let mut params = Vec::new();
        while !matches!(self.peek(), Token::RParen) {
            let (pname, pspan) = self.expect_ident()?;
            let default = if matches!(self.peek(), Token::Eq) {
                self.advance();
                Some(self.parse_expr()?)
            } else {
                None
            };
            if default.is_none() && params.iter().any(|p: &Param| p.default.is_some()) {
                return Err(CompileError::parser(
                    format!("Parameter {pname} without a default follows a keyword parameter"),
                    pspan,
                ));
            }
            params.push(Param { name: pname, default });
            if matches!(self.peek(), Token::Comma) {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(&Token::RParen, "')'")?;
        let body = self.parse_colon_block()?;
        Ok(StmtKind::FunctionDef {
            name,
            params,
            body: Rc::from(body),
        })
    }

    fn parse_if(&mut self) -> Result<StmtKind, CompileError> {
        self.advance();
        let mut arms = Vec::new();
        let condition = self.parse_expr()?;
        arms.push((condition, self.parse_colon_block()?));
        while matches!(self.peek(), Token::Elif) {
            self.advance();
            let condition = self.parse_expr()?;
            arms.push((condition, self.parse_colon_block()?));
        }
        let else_body = if matches!(self.peek(), Token::Else) {
            self.advance();
            Some(self.parse_colon_block()?)
        } else {
            None
        };
        Ok(StmtKind::If { arms, else_body })
    }

    fn parse_for(&mut self) -> Result<StmtKind, CompileError> {
        self.advance();
        let mut variables = vec![self.expect_ident()?.0];
        while matches!(self.peek(), Token::Comma) {
            self.advance();
            variables.push(self.expect_ident()?.0);
        }
        self.expect(&Token::In, "in")?;
        let iterables = self.parse_expr_list()?;
        let body = self.parse_colon_block()?;
        Ok(StmtKind::For {
            variables,
            iterables,
            body,
        })
    }

    fn parse_with(&mut self) -> Result<StmtKind, CompileError> {
        self.advance();
        let mut bindings = Vec::new();
        loop {
            let (name, _) = self.expect_ident()?;
            self.expect(&Token::As, "as")?;
            bindings.push((name, self.parse_expr()?));
            if matches!(self.peek(), Token::Comma) {
                self.advance();
            } else {
                break;
            }
        }
        let body = self.parse_colon_block()?;
        Ok(StmtKind::With { bindings, body })
    }

    fn parse_try(&mut self) -> Result<StmtKind, CompileError> {
        self.advance();
        let body = self.parse_colon_block()?;
        self.expect(&Token::Catch, "catch")?;
        let mut catches = Vec::new();
        while let Token::Ident(family) = self.peek().clone() {
            self.advance();
            let binding = if matches!(self.peek(), Token::As) {
                self.advance();
                Some(self.expect_ident()?.0)
            } else {
                None
            };
            catches.push(CatchType { family, binding });
            if matches!(self.peek(), Token::Comma) {
                self.advance();
            } else {
                break;
            }
        }
        let handler = self.parse_colon_block()?;
        Ok(StmtKind::Try {
            body,
            catches,
            handler,
        })
    }

    /// `in <direction> direction: { knit f1, f2; ... }`
    fn parse_carriage_pass(&mut self) -> Result<StmtKind, CompileError> {
        self.advance();
        let direction = self.parse_expr()?;
        self.expect_word("direction")?;
        self.expect(&Token::Colon, "':'")?;
        self.expect(&Token::LBrace, "'{'")?;
        let mut instructions = Vec::new();
        self.skip_terminators();
        while !matches!(self.peek(), Token::RBrace | Token::Eof) {
            let start = self.span();
            let instruction = self.parse_instruction_name()?;
            let needles = self.parse_expr_list()?;
            self.expect_terminator()?;
            instructions.push(InstructionAssignment {
                instruction,
                needles,
                span: start.merge(self.prev_span()),
            });
            self.skip_terminators();
        }
        self.expect(&Token::RBrace, "'}'")?;
        if instructions.is_empty() {
            return Err(CompileError::parser(
                "Carriage pass needs at least one instruction",
                self.prev_span(),
            ));
        }
        Ok(StmtKind::CarriagePass {
            direction,
            instructions,
        })
    }

    /// A bare name (`knit`, `xfer`) or, when followed by `.`/`(`, a full
    /// expression that evaluates to an instruction.
    fn parse_instruction_name(&mut self) -> Result<Expr, CompileError> {
        let span = self.span();
        let name = match self.peek() {
            Token::Xfer => Some("xfer".to_string()),
            Token::Drop => Some("drop".to_string()),
            Token::Ident(name) if !matches!(self.peek_at(1), Token::Dot | Token::LParen) => {
                Some(name.clone())
            }
            _ => None,
        };
        match name {
            Some(name) => {
                self.advance();
                Ok(expr(ExprKind::Ident(name), span))
            }
            None => self.parse_postfix(),
        }
    }

    /// `xfer <needles> (across | <n> to <side>) [to <bed> bed] [sliders]`
    fn parse_xfer(&mut self) -> Result<StmtKind, CompileError> {
        self.advance();
        let needles = self.parse_expr_list()?;
        let rack = if self.at_word("across") {
            self.advance();
            XferRack::Across
        } else {
            let distance = self.parse_expr()?;
            self.expect_word("to")?;
            let side = self.parse_expr()?;
            XferRack::Offset { distance, side }
        };
        let bed = if self.at_word("to") {
            self.advance();
            let bed = self.parse_expr()?;
            self.expect_word("bed")?;
            Some(bed)
        } else {
            None
        };
        let sliders = if self.at_word("sliders") {
            self.advance();
            true
        } else {
            false
        };
        Ok(StmtKind::Xfer {
            needles,
            rack,
            bed,
            sliders,
        })
    }

    /// `push <needles> to Front|Back|layer <e>` or `push <needles> [<n>] forward|backward`
    fn parse_push(&mut self) -> Result<StmtKind, CompileError> {
        self.advance();
        let needles = self.parse_expr_list()?;
        let target = if self.at_word("to") {
            self.advance();
            match self.peek().clone() {
                Token::Ident(w) if w == "layer" => {
                    self.advance();
                    PushTarget::Layer(self.parse_expr()?)
                }
                Token::Ident(w) if w == "Front" || w == "Front_Bed" => {
                    self.advance();
                    PushTarget::Front
                }
                Token::Ident(w) if w == "Back" || w == "Back_Bed" => {
                    self.advance();
                    PushTarget::Back
                }
                _ => return Err(self.unexpected(&["Front", "Back", "layer"])),
            }
        } else {
            let amount = if self.at_push_direction() {
                None
            } else {
                Some(self.parse_expr()?)
            };
            match self.peek().clone() {
                Token::Ident(w) if w.eq_ignore_ascii_case("forward") => {
                    self.advance();
                    PushTarget::Forward(amount)
                }
                Token::Ident(w) if w.eq_ignore_ascii_case("backward") => {
                    self.advance();
                    PushTarget::Backward(amount)
                }
                _ => return Err(self.unexpected(&["forward", "backward"])),
            }
        };
        Ok(StmtKind::Push { needles, target })
    }

    fn at_push_direction(&self) -> bool {
        matches!(self.peek(), Token::Ident(w)
            if w.eq_ignore_ascii_case("forward") || w.eq_ignore_ascii_case("backward"))
    }

    /// `swap <needles> with layer|sheet <e>`
    fn parse_swap(&mut self) -> Result<StmtKind, CompileError> {
        self.advance();
        let needles = self.parse_expr_list()?;
        self.expect(&Token::With, "with")?;
        let kind = if self.at_word("layer") {
            SwapKind::Layer
        } else if self.at_word("sheet") {
            SwapKind::Sheet
        } else {
            return Err(self.unexpected(&["layer", "sheet"]));
        };
        self.advance();
        let value = self.parse_expr()?;
        Ok(StmtKind::Swap {
            needles,
            kind,
            value,
        })
    }

    fn parse_expr_list(&mut self) -> Result<Vec<Expr>, CompileError> {
        let mut exprs = vec![self.parse_expr()?];
        while matches!(self.peek(), Token::Comma) {
            self.advance();
            exprs.push(self.parse_expr()?);
        }
        Ok(exprs)
    }

    // ── Expression parsing (precedence climbing) ──────────────────

    fn parse_expr(&mut self) -> Result<Expr, CompileError> {
        self.parse_or()
    }

    fn binary(op: BinOp, left: Expr, right: Expr) -> Expr {
        let span = left.span.merge(right.span);
        expr(
            ExprKind::BinOp {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            span,
        )
    }

    fn parse_or(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Self::binary(BinOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_not()?;
        while matches!(self.peek(), Token::And) {
            self.advance();
            let right = self.parse_not()?;
            left = Self::binary(BinOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, CompileError> {
        if matches!(self.peek(), Token::Not) {
            let start = self.span();
            self.advance();
            let operand = self.parse_not()?;
            let span = start.merge(operand.span);
            return Ok(expr(
                ExprKind::UnaryOp {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                span,
            ));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_add()?;
        loop {
            let op = match self.peek() {
                Token::EqEq => BinOp::Eq,
                Token::Ne => BinOp::Ne,
                Token::Lt => BinOp::Lt,
                Token::Le => BinOp::Le,
                Token::Gt => BinOp::Gt,
                Token::Ge => BinOp::Ge,
                Token::In => BinOp::In,
                Token::Is if matches!(self.peek_at(1), Token::Not) => {
                    self.advance();
                    BinOp::IsNot
                }
                Token::Is => BinOp::Is,
                Token::Not if matches!(self.peek_at(1), Token::In) => {
                    self.advance();
                    BinOp::NotIn
                }
                Token::Ident(w) if w == "of" => {
                    self.advance();
                    let gauge = self.parse_add()?;
                    if self.at_word("sheets") {
                        self.advance();
                    }
                    let span = left.span.merge(self.prev_span());
                    left = expr(
                        ExprKind::Gauge {
                            sheet: Box::new(left),
                            gauge: Box::new(gauge),
                        },
                        span,
                    );
                    continue;
                }
                _ => break,
            };
            self.advance();
            let right = self.parse_add()?;
            left = Self::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_add(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_mul()?;
            left = Self::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_mul(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::Percent => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Self::binary(op, left, right);
        }
        Ok(left)
    }

    /// Unary minus binds looser than `^`: `-2^2` is `-(2^2)`.
    fn parse_unary(&mut self) -> Result<Expr, CompileError> {
        if matches!(self.peek(), Token::Minus) {
            let start = self.span();
            self.advance();
            let operand = self.parse_unary()?;
            let span = start.merge(operand.span);
            return Ok(match operand.kind {
                ExprKind::Int(v) => expr(ExprKind::Int(-v), span),
                ExprKind::Float(v) => expr(ExprKind::Float(-v), span),
                kind => expr(
                    ExprKind::UnaryOp {
                        op: UnaryOp::Neg,
                        operand: Box::new(expr(kind, operand.span)),
                    },
                    span,
                ),
            });
        }
        self.parse_power()
    }

    /// `^` is right-associative.
    fn parse_power(&mut self) -> Result<Expr, CompileError> {
        let left = self.parse_postfix()?;
        if matches!(self.peek(), Token::Caret) {
            self.advance();
            let right = self.parse_unary()?;
            return Ok(Self::binary(BinOp::Pow, left, right));
        }
        Ok(left)
    }

    fn parse_postfix(&mut self) -> Result<Expr, CompileError> {
        let mut current = self.parse_primary()?;
        loop {
            match self.peek() {
                Token::Dot => {
                    self.advance();
                    let (name, name_span) = self.expect_ident()?;
                    let span = current.span.merge(name_span);
                    current = expr(
                        ExprKind::Attribute {
                            object: Box::new(current),
                            name,
                        },
                        span,
                    );
                }
                Token::LParen => {
                    self.advance();
                    let args = self.parse_args()?;
                    let span = current.span.merge(self.prev_span());
                    current = expr(
                        ExprKind::Call {
                            callee: Box::new(current),
                            args,
                        },
                        span,
                    );
                }
                Token::LBracket => {
                    self.advance();
                    current = self.parse_subscript(current)?;
                }
                _ => break,
            }
        }
        Ok(current)
    }

    fn parse_args(&mut self) -> Result<Vec<Arg>, CompileError> {
        let mut args = Vec::new();
        while !matches!(self.peek(), Token::RParen) {
            let arg = match (self.peek().clone(), self.peek_at(1)) {
                (Token::Ident(name), Token::Eq) => {
                    self.advance();
                    self.advance();
                    Arg::Keyword(name, self.parse_expr()?)
                }
                _ => {
                    if args.iter().any(|a| matches!(a, Arg::Keyword(..))) {
                        return Err(CompileError::parser(
                            "Positional argument follows keyword argument",
                            self.span(),
                        ));
                    }
                    Arg::Positional(self.parse_expr()?)
                }
            };
            args.push(arg);
            if matches!(self.peek(), Token::Comma) {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(&Token::RParen, "')'")?;
        Ok(args)
    }

    /// After `[`: an index or a `start:stop:step` slice.
    fn parse_subscript(&mut self, object: Expr) -> Result<Expr, CompileError> {
        let start = if matches!(self.peek(), Token::Colon) {
            None
        } else {
            Some(Box::new(self.parse_expr()?))
        };
        if !matches!(self.peek(), Token::Colon) {
            self.expect(&Token::RBracket, "']'")?;
            let span = object.span.merge(self.prev_span());
            let index = start.ok_or_else(|| self.unexpected(&["expression"]))?;
            return Ok(expr(
                ExprKind::Index {
                    object: Box::new(object),
                    index,
                },
                span,
            ));
        }
        self.advance();
        let stop = if matches!(self.peek(), Token::Colon | Token::RBracket) {
            None
        } else {
            Some(Box::new(self.parse_expr()?))
        };
        let step = if matches!(self.peek(), Token::Colon) {
            self.advance();
            if matches!(self.peek(), Token::RBracket) {
                None
            } else {
                Some(Box::new(self.parse_expr()?))
            }
        } else {
            None
        };
        self.expect(&Token::RBracket, "']'")?;
        let span = object.span.merge(self.prev_span());
        Ok(expr(
            ExprKind::Slice {
                object: Box::new(object),
                start,
                stop,
                step,
            },
            span,
        ))
    }

    fn parse_comprehension(&mut self) -> Result<Comprehension, CompileError> {
        self.expect(&Token::For, "for")?;
        let mut variables = vec![self.expect_ident()?.0];
        while matches!(self.peek(), Token::Comma) {
            self.advance();
            variables.push(self.expect_ident()?.0);
        }
        self.expect(&Token::In, "in")?;
        let iterable = Box::new(self.parse_or()?);
        let condition = if matches!(self.peek(), Token::If) {
            self.advance();
            Some(Box::new(self.parse_or()?))
        } else {
            None
        };
        Ok(Comprehension {
            variables,
            iterable,
            condition,
        })
    }

    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        let span = self.span();
        let token = self.peek().clone();
        let simple = match &token {
            Token::Int(v) => Some(ExprKind::Int(*v)),
            Token::Float(v) => Some(ExprKind::Float(*v)),
            Token::String(s) => Some(ExprKind::Str(s.clone())),
            Token::True => Some(ExprKind::Bool(true)),
            Token::False => Some(ExprKind::Bool(false)),
            Token::None => Some(ExprKind::None),
            Token::Needle(n) => Some(ExprKind::Needle(n.clone())),
            Token::Carrier(c) => Some(ExprKind::Carrier(*c)),
            Token::Sheet { sheet, gauge } => Some(ExprKind::Sheet {
                sheet: *sheet,
                gauge: *gauge,
            }),
            Token::LeftArrow => Some(ExprKind::Direction(DirectionWord::Leftward)),
            Token::RightArrow => Some(ExprKind::Direction(DirectionWord::Rightward)),
            Token::Ident(name) => Some(
                direction_word(name).map_or_else(|| ExprKind::Ident(name.clone()), ExprKind::Direction),
            ),
            _ => None,
        };
        if let Some(kind) = simple {
            self.advance();
            return Ok(expr(kind, span));
        }
        match token {
            Token::FString(pieces) => {
                self.advance();
                let parts = pieces
                    .into_iter()
                    .map(|piece| match piece {
                        FStringPiece::Text(t) => Ok(FStringPart::Text(t)),
                        FStringPiece::Hole { source, offset } => {
                            parse_hole(&source, offset).map(FStringPart::Hole)
                        }
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(expr(ExprKind::FString(parts), span))
            }
            Token::Star => {
                self.advance();
                let inner = self.parse_postfix()?;
                let span = span.merge(inner.span);
                Ok(expr(ExprKind::Unpack(Box::new(inner)), span))
            }
            Token::LParen => {
                self.advance();
                if matches!(self.peek(), Token::RParen) {
                    self.advance();
                    return Ok(expr(ExprKind::List(Vec::new()), span.merge(self.prev_span())));
                }
                let first = self.parse_expr()?;
                if matches!(self.peek(), Token::Comma) {
                    let mut items = vec![first];
                    while matches!(self.peek(), Token::Comma) {
                        self.advance();
                        if matches!(self.peek(), Token::RParen) {
                            break;
                        }
                        items.push(self.parse_expr()?);
                    }
                    self.expect(&Token::RParen, "')'")?;
                    return Ok(expr(ExprKind::List(items), span.merge(self.prev_span())));
                }
                self.expect(&Token::RParen, "')'")?;
                Ok(Expr {
                    kind: first.kind,
                    span: span.merge(self.prev_span()),
                })
            }
            Token::LBracket => {
                self.advance();
                if matches!(self.peek(), Token::RBracket) {
                    self.advance();
                    return Ok(expr(ExprKind::List(Vec::new()), span.merge(self.prev_span())));
                }
                let first = self.parse_expr()?;
                if matches!(self.peek(), Token::For) {
                    let comp = self.parse_comprehension()?;
                    self.expect(&Token::RBracket, "']'")?;
                    return Ok(expr(
                        ExprKind::ListComp {
                            element: Box::new(first),
                            comp,
                        },
                        span.merge(self.prev_span()),
                    ));
                }
                let mut items = vec![first];
                while matches!(self.peek(), Token::Comma) {
                    self.advance();
                    if matches!(self.peek(), Token::RBracket) {
                        break;
                    }
                    items.push(self.parse_expr()?);
                }
                self.expect(&Token::RBracket, "']'")?;
                Ok(expr(ExprKind::List(items), span.merge(self.prev_span())))
            }
            Token::LBrace => {
                self.advance();
                if matches!(self.peek(), Token::RBrace) {
                    self.advance();
                    return Ok(expr(ExprKind::Dict(Vec::new()), span.merge(self.prev_span())));
                }
                let key = self.parse_expr()?;
                self.expect(&Token::Colon, "':'")?;
                let value = self.parse_expr()?;
                if matches!(self.peek(), Token::For) {
                    let comp = self.parse_comprehension()?;
                    self.expect(&Token::RBrace, "'}'")?;
                    return Ok(expr(
                        ExprKind::DictComp {
                            key: Box::new(key),
                            value: Box::new(value),
                            comp,
                        },
                        span.merge(self.prev_span()),
                    ));
                }
                let mut entries = vec![(key, value)];
                while matches!(self.peek(), Token::Comma) {
                    self.advance();
                    if matches!(self.peek(), Token::RBrace) {
                        break;
                    }
                    let key = self.parse_expr()?;
                    self.expect(&Token::Colon, "':'")?;
                    entries.push((key, self.parse_expr()?));
                }
                self.expect(&Token::RBrace, "'}'")?;
                Ok(expr(ExprKind::Dict(entries), span.merge(self.prev_span())))
            }
            _ => Err(self.unexpected(&["expression"])),
        }
    }
}

/// Parse the expression inside an f-string hole.
fn parse_hole(source: &str, offset: usize) -> Result<Expr, CompileError> {
    let tokens = lexer::lex_at(source, offset).map_err(first_error)?;
    let mut parser = Parser::new(tokens);
    let hole = parser.parse_expr()?;
    if !parser.at_eof() {
        return Err(parser.unexpected(&["'}'"]));
    }
    Ok(hole)
}

fn first_error(mut errors: Vec<CompileError>) -> CompileError {
    if errors.is_empty() {
        CompileError::parser("invalid f-string hole", Span::default())
    } else {
        errors.swap_remove(0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::dsl::lexer::lex;

    fn parse_str(src: &str) -> Program {
        parse(lex(src).unwrap()).unwrap()
    }

    fn first(src: &str) -> StmtKind {
        parse_str(src).statements.into_iter().next().unwrap().kind
    }

    fn parse_err(src: &str) -> Vec<CompileError> {
        parse(lex(src).unwrap()).unwrap_err()
    }

    #[test]
    fn assignment_and_precedence() {
        let StmtKind::Assign { target: AssignTarget::Name(name), value } = first("x = 1 + 2 * 3 ^ 2;") else {
            panic!("expected assignment");
        };
        assert_eq!(name, "x");
        let ExprKind::BinOp { op: BinOp::Add, right, .. } = value.kind else {
            panic!("expected addition at the root");
        };
        let ExprKind::BinOp { op: BinOp::Mul, right: pow, .. } = right.kind else {
            panic!("expected multiplication");
        };
        assert!(matches!(pow.kind, ExprKind::BinOp { op: BinOp::Pow, .. }));
    }

    #[test]
    fn not_binds_looser_than_comparison() {
        let StmtKind::Expr(e) = first("not a == b;") else { panic!() };
        let ExprKind::UnaryOp { op: UnaryOp::Not, operand } = e.kind else { panic!() };
        assert!(matches!(operand.kind, ExprKind::BinOp { op: BinOp::Eq, .. }));
    }

    #[test]
    fn is_not_and_not_in() {
        let StmtKind::Expr(e) = first("a is not None and b not in c;") else { panic!() };
        let ExprKind::BinOp { op: BinOp::And, left, right } = e.kind else { panic!() };
        assert!(matches!(left.kind, ExprKind::BinOp { op: BinOp::IsNot, .. }));
        assert!(matches!(right.kind, ExprKind::BinOp { op: BinOp::NotIn, .. }));
    }

    #[test]
    fn carriage_pass_block() {
        let StmtKind::CarriagePass { direction, instructions } =
            first("in reverse direction: { knit f1, f2; tuck Front_Needles[0:4]; xfer f3; }")
        else {
            panic!("expected carriage pass");
        };
        assert!(matches!(direction.kind, ExprKind::Direction(DirectionWord::Opposite)));
        assert_eq!(instructions.len(), 3);
        let names: Vec<_> = instructions
            .iter()
            .map(|i| match &i.instruction.kind {
                ExprKind::Ident(n) => n.clone(),
                _ => String::new(),
            })
            .collect();
        assert_eq!(names, ["knit", "tuck", "xfer"]);
        assert_eq!(instructions[0].needles.len(), 2);
        assert!(matches!(instructions[1].needles[0].kind, ExprKind::Slice { .. }));
    }

    #[test]
    fn xfer_forms() {
        let StmtKind::Xfer { needles, rack, bed, sliders } =
            first("xfer f1, f2 2 to Left to Back bed sliders;")
        else {
            panic!()
        };
        assert_eq!(needles.len(), 2);
        assert!(matches!(rack, XferRack::Offset { .. }));
        assert!(bed.is_some());
        assert!(sliders);
        let StmtKind::Xfer { rack, bed, sliders, .. } = first("xfer Loops across;") else { panic!() };
        assert!(matches!(rack, XferRack::Across));
        assert!(bed.is_none());
        assert!(!sliders);
    }

    #[test]
    fn push_and_swap() {
        assert!(matches!(
            first("push f1 to layer 2;"),
            StmtKind::Push { target: PushTarget::Layer(_), .. }
        ));
        assert!(matches!(first("push f1 to Back;"), StmtKind::Push { target: PushTarget::Back, .. }));
        assert!(matches!(
            first("push f1, f3 forward;"),
            StmtKind::Push { target: PushTarget::Forward(None), .. }
        ));
        assert!(matches!(
            first("push f1 2 backward;"),
            StmtKind::Push { target: PushTarget::Backward(Some(_)), .. }
        ));
        assert!(matches!(
            first("swap f1 with sheet 1;"),
            StmtKind::Swap { kind: SwapKind::Sheet, .. }
        ));
    }

    #[test]
    fn control_flow() {
        let StmtKind::If { arms, else_body } =
            first("if x < 1: { y = 1; } elif x < 2: y = 2; else: { y = 3; }")
        else {
            panic!()
        };
        assert_eq!(arms.len(), 2);
        assert!(else_body.is_some());
        let StmtKind::For { variables, iterables, body } = first("for i, n in enumerate(xs): { print n; }")
        else {
            panic!()
        };
        assert_eq!(variables, ["i", "n"]);
        assert_eq!(iterables.len(), 1);
        assert_eq!(body.len(), 1);
    }

    #[test]
    fn with_and_try() {
        let StmtKind::With { bindings, .. } = first("with Carrier as c1, Racking as 1: { pause; }") else {
            panic!()
        };
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].0, "Carrier");
        let StmtKind::Try { catches, handler, .. } =
            first("try: { x = d[1]; } catch KeyError as e, IndexError: { print e; }")
        else {
            panic!()
        };
        assert_eq!(catches.len(), 2);
        assert_eq!(catches[0].binding.as_deref(), Some("e"));
        assert!(catches[1].binding.is_none());
        assert_eq!(handler.len(), 1);
    }

    #[test]
    fn function_definition() {
        let StmtKind::FunctionDef { name, params, body } = first("def f(a, b = 2): { return a + b; }") else {
            panic!()
        };
        assert_eq!(name, "f");
        assert_eq!(params.len(), 2);
        assert!(params[1].default.is_some());
        assert_eq!(body.len(), 1);
        assert!(!parse_err("def f(a = 1, b): { return b; }").is_empty());
    }

    #[test]
    fn comprehensions_and_literals() {
        let StmtKind::Expr(e) = first("[n + 1 for n in Front_Needles if n.position > 2];") else { panic!() };
        assert!(matches!(e.kind, ExprKind::ListComp { .. }));
        let StmtKind::Assign { value, .. } = first("d = {n: 1 for n in xs};") else { panic!() };
        assert!(matches!(value.kind, ExprKind::DictComp { .. }));
        let StmtKind::Assign { value, .. } = first("d = {\"a\": 1, 2: f3};") else { panic!() };
        assert!(matches!(value.kind, ExprKind::Dict(ref d) if d.len() == 2));
        assert!(matches!(first("{ x = 1; }"), StmtKind::Block(ref b) if b.len() == 1));
        let StmtKind::Expr(e) = first("s1 of 2 sheets;") else { panic!() };
        assert!(matches!(e.kind, ExprKind::Gauge { .. }));
    }

    #[test]
    fn fstring_holes_are_parsed() {
        let StmtKind::Print(e) = first("print f\"needle {n.position + 1} done\";") else { panic!() };
        let ExprKind::FString(parts) = e.kind else { panic!() };
        assert_eq!(parts.len(), 3);
        assert!(matches!(&parts[1], FStringPart::Hole(h) if matches!(h.kind, ExprKind::BinOp { .. })));
    }

    #[test]
    fn index_assignment_and_import() {
        assert!(matches!(
            first("d[f1] = 2;"),
            StmtKind::Assign { target: AssignTarget::Index { .. }, .. }
        ));
        let StmtKind::Import { path, alias } = first("import stitches.rib as rib;") else { panic!() };
        assert_eq!(path, ["stitches", "rib"]);
        assert_eq!(alias.as_deref(), Some("rib"));
    }

    #[test]
    fn errors_report_expected_tokens() {
        let errors = parse_err("x = ;\ny = 2;");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].expected, ["expression"]);
        assert!(!parse_err("print 1").is_empty());
        assert!(!parse_err("1 + 2 = 3;").is_empty());
    }

    #[test]
    fn negative_literals_fold() {
        let StmtKind::Expr(e) = first("-3;") else { panic!() };
        assert!(matches!(e.kind, ExprKind::Int(-3)));
    }
}
