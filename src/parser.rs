// File: src/parser.rs
//
// Recursive-descent parser for the Panda scripting language.
// Consumes the lexer's token stream and produces the AST. Statements are
// newline-terminated; expressions may span lines inside brackets, and a
// lookahead scan disambiguates lambdas from grouped expressions.

use crate::ast::{
    BinaryOp, CatchClause, ClassDecl, DeclModifier, EnumValue, Expr, FuncDecl, LambdaBody,
    LogicalOp, Param, Stmt, StrPart, UnaryOp,
};
use crate::errors::PandaError;
use crate::lexer::{Lexer, Literal, StringSegment, Token, TokenKind};

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Parser { tokens, pos: 0 }
    }

    /// Parse a whole program: declarations separated by newlines/semicolons.
    pub fn parse(mut self) -> Result<Vec<Stmt>, PandaError> {
        let mut stmts = Vec::new();
        loop {
            self.skip_newlines();
            if self.check(TokenKind::Eof) {
                break;
            }
            stmts.push(self.declaration()?);
        }
        Ok(stmts)
    }

    /// Parse a single expression (used for string interpolation sub-sources
    /// and the embedding `eval` surface).
    pub fn parse_expression(mut self) -> Result<Expr, PandaError> {
        self.skip_newlines();
        let expr = self.expression()?;
        self.skip_newlines();
        if !self.check(TokenKind::Eof) {
            return Err(self.error_here("Unexpected token after expression"));
        }
        Ok(expr)
    }

    // --- token plumbing ---

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> TokenKind {
        self.peek().kind
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if !self.check(TokenKind::Eof) {
            self.pos += 1;
        }
        token
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) -> Result<Token, PandaError> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.error_here(message))
        }
    }

    fn error_here(&self, message: &str) -> PandaError {
        let token = self.peek();
        let what = if token.kind == TokenKind::Eof {
            "end of input".to_string()
        } else if token.kind == TokenKind::Newline {
            "newline".to_string()
        } else {
            format!("'{}'", token.lexeme)
        };
        PandaError::parse(
            format!("{} (found {})", message, what),
            token.line,
            token.column,
        )
    }

    fn skip_newlines(&mut self) {
        while self.check(TokenKind::Newline) {
            self.advance();
        }
    }

    /// A statement ends at a semicolon, a newline, a closing brace, or the
    /// end of input.
    fn consume_terminator(&mut self) -> Result<(), PandaError> {
        if self.matches(TokenKind::Semicolon) || self.matches(TokenKind::Newline) {
            return Ok(());
        }
        if self.check(TokenKind::RightBrace) || self.check(TokenKind::Eof) {
            return Ok(());
        }
        Err(self.error_here("Expected newline or ';' after statement"))
    }

    fn at_terminator(&self) -> bool {
        matches!(
            self.peek_kind(),
            TokenKind::Semicolon | TokenKind::Newline | TokenKind::RightBrace | TokenKind::Eof
        )
    }

    // --- declarations ---

    fn declaration(&mut self) -> Result<Stmt, PandaError> {
        let modifier = if self.matches(TokenKind::Global) {
            DeclModifier::Global
        } else if self.matches(TokenKind::Export) {
            DeclModifier::Export
        } else {
            DeclModifier::None
        };

        match self.peek_kind() {
            TokenKind::Var => self.var_declaration(modifier),
            TokenKind::Func => self.func_declaration(modifier),
            TokenKind::Class => self.class_declaration(modifier),
            TokenKind::Enum => self.enum_declaration(modifier),
            TokenKind::Import => {
                if modifier == DeclModifier::Export {
                    return Err(self.error_here("'export' cannot be applied to an import"));
                }
                self.import_declaration(modifier == DeclModifier::Global)
            }
            _ if modifier != DeclModifier::None => {
                Err(self.error_here("Expected a declaration after 'global'/'export'"))
            }
            _ => self.statement(),
        }
    }

    fn var_declaration(&mut self, modifier: DeclModifier) -> Result<Stmt, PandaError> {
        let line = self.advance().line;
        let name = self
            .consume(TokenKind::Identifier, "Expected variable name")?
            .lexeme;
        let initializer = if self.matches(TokenKind::Equal) {
            self.skip_newlines();
            Some(self.expression()?)
        } else {
            None
        };
        self.consume_terminator()?;
        Ok(Stmt::Var {
            name,
            initializer,
            modifier,
            line,
        })
    }

    fn func_declaration(&mut self, modifier: DeclModifier) -> Result<Stmt, PandaError> {
        let line = self.advance().line;
        let name = self
            .consume(TokenKind::Identifier, "Expected function name")?
            .lexeme;
        let decl = self.finish_func(name, line)?;
        Ok(Stmt::Func { decl, modifier })
    }

    /// Parameter list plus block or single-statement body.
    fn finish_func(&mut self, name: String, line: u32) -> Result<FuncDecl, PandaError> {
        self.consume(TokenKind::LeftParen, "Expected '(' after function name")?;
        let (params, rest_param) = self.parameter_list()?;
        self.skip_newlines();
        let body = if self.check(TokenKind::LeftBrace) {
            self.block()?
        } else {
            vec![self.statement()?]
        };
        Ok(FuncDecl {
            name,
            params,
            rest_param,
            body,
            line,
        })
    }

    /// Parses parameters up to and including the closing paren. Enforces the
    /// default/rest ordering rules.
    fn parameter_list(&mut self) -> Result<(Vec<Param>, Option<String>), PandaError> {
        let mut params = Vec::new();
        let mut rest_param = None;
        let mut seen_default = false;

        if !self.check(TokenKind::RightParen) {
            loop {
                if self.matches(TokenKind::Ellipsis) {
                    let name = self
                        .consume(TokenKind::Identifier, "Expected rest parameter name")?
                        .lexeme;
                    rest_param = Some(name);
                    if !self.check(TokenKind::RightParen) {
                        return Err(self.error_here("Rest parameter must be last"));
                    }
                    break;
                }
                let name = self
                    .consume(TokenKind::Identifier, "Expected parameter name")?
                    .lexeme;
                let default = if self.matches(TokenKind::Equal) {
                    seen_default = true;
                    Some(self.assignment()?)
                } else {
                    if seen_default {
                        return Err(self
                            .error_here("Non-default parameter cannot follow a default parameter"));
                    }
                    None
                };
                params.push(Param { name, default });
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expected ')' after parameters")?;
        Ok((params, rest_param))
    }

    fn class_declaration(&mut self, modifier: DeclModifier) -> Result<Stmt, PandaError> {
        let line = self.advance().line;
        let name = self
            .consume(TokenKind::Identifier, "Expected class name")?
            .lexeme;
        let superclass = if self.matches(TokenKind::Colon) {
            Some(
                self.consume(TokenKind::Identifier, "Expected superclass name")?
                    .lexeme,
            )
        } else {
            None
        };
        self.skip_newlines();
        self.consume(TokenKind::LeftBrace, "Expected '{' before class body")?;

        let mut fields = Vec::new();
        let mut methods = Vec::new();
        let mut static_fields = Vec::new();
        let mut static_methods = Vec::new();

        loop {
            self.skip_newlines();
            if self.check(TokenKind::RightBrace) || self.check(TokenKind::Eof) {
                break;
            }
            if self.matches(TokenKind::Static) {
                if self.matches(TokenKind::Var) {
                    let field = self
                        .consume(TokenKind::Identifier, "Expected static field name")?
                        .lexeme;
                    let value = if self.matches(TokenKind::Equal) {
                        self.expression()?
                    } else {
                        Expr::Null
                    };
                    self.consume_terminator()?;
                    static_fields.push((field, value));
                } else if self.check(TokenKind::Func) {
                    let method_line = self.advance().line;
                    let method_name = self
                        .consume(TokenKind::Identifier, "Expected method name")?
                        .lexeme;
                    static_methods.push(self.finish_func(method_name, method_line)?);
                } else {
                    return Err(self.error_here("Expected 'var' or 'func' after 'static'"));
                }
            } else if self.matches(TokenKind::Var) {
                let field = self
                    .consume(TokenKind::Identifier, "Expected field name")?
                    .lexeme;
                let value = if self.matches(TokenKind::Equal) {
                    self.expression()?
                } else {
                    Expr::Null
                };
                self.consume_terminator()?;
                fields.push((field, value));
            } else if self.check(TokenKind::Func) {
                let method_line = self.advance().line;
                let method_name = self
                    .consume(TokenKind::Identifier, "Expected method name")?
                    .lexeme;
                methods.push(self.finish_func(method_name, method_line)?);
            } else if self.check(TokenKind::Identifier) && self.peek().lexeme == name {
                // Constructor: a method sharing the class's name.
                let ctor_line = self.advance().line;
                methods.push(self.finish_func(name.clone(), ctor_line)?);
            } else {
                return Err(self.error_here("Expected member declaration in class body"));
            }
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after class body")?;

        Ok(Stmt::Class {
            decl: ClassDecl {
                name,
                superclass,
                fields,
                methods,
                static_fields,
                static_methods,
                line,
            },
            modifier,
        })
    }

    fn enum_declaration(&mut self, modifier: DeclModifier) -> Result<Stmt, PandaError> {
        let line = self.advance().line;
        let name = self
            .consume(TokenKind::Identifier, "Expected enum name")?
            .lexeme;
        self.skip_newlines();
        self.consume(TokenKind::LeftBrace, "Expected '{' before enum body")?;

        let mut members = Vec::new();
        loop {
            self.skip_newlines();
            if self.check(TokenKind::RightBrace) || self.check(TokenKind::Eof) {
                break;
            }
            let member = self
                .consume(TokenKind::Identifier, "Expected enum member name")?
                .lexeme;
            let value = if self.matches(TokenKind::Equal) {
                self.enum_member_value()?
            } else {
                EnumValue::Auto
            };
            members.push((member, value));
            self.skip_newlines();
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        self.skip_newlines();
        self.consume(TokenKind::RightBrace, "Expected '}' after enum body")?;

        Ok(Stmt::Enum {
            name,
            members,
            modifier,
            line,
        })
    }

    fn enum_member_value(&mut self) -> Result<EnumValue, PandaError> {
        if self.matches(TokenKind::Minus) {
            let token = self.consume(TokenKind::Number, "Expected number after '-'")?;
            if let Some(Literal::Number(n)) = token.literal {
                return Ok(EnumValue::Number(-n));
            }
        } else if self.check(TokenKind::Number) {
            let token = self.advance();
            if let Some(Literal::Number(n)) = token.literal {
                return Ok(EnumValue::Number(n));
            }
        } else if self.check(TokenKind::Str) {
            let token = self.advance();
            if let Some(Literal::Str(segments)) = token.literal {
                if let [StringSegment::Text(text)] = segments.as_slice() {
                    return Ok(EnumValue::Str(text.clone()));
                }
                return Err(PandaError::parse(
                    "Enum member value must be a plain string",
                    token.line,
                    token.column,
                ));
            }
        }
        Err(self.error_here("Expected number or string as enum member value"))
    }

    fn import_declaration(&mut self, is_global: bool) -> Result<Stmt, PandaError> {
        let line = self.advance().line;
        let token = self.consume(TokenKind::Str, "Expected module path string after 'import'")?;
        let path = match token.literal {
            Some(Literal::Str(segments)) => match segments.as_slice() {
                [StringSegment::Text(text)] => text.clone(),
                _ => {
                    return Err(PandaError::parse(
                        "Import path must be a plain string",
                        token.line,
                        token.column,
                    ));
                }
            },
            _ => {
                return Err(PandaError::parse(
                    "Import path must be a plain string",
                    token.line,
                    token.column,
                ));
            }
        };
        let alias = if self.matches(TokenKind::As) {
            Some(
                self.consume(TokenKind::Identifier, "Expected alias name after 'as'")?
                    .lexeme,
            )
        } else {
            None
        };
        self.consume_terminator()?;
        Ok(Stmt::Import {
            path,
            alias,
            is_global,
            line,
        })
    }

    // --- statements ---

    fn statement(&mut self) -> Result<Stmt, PandaError> {
        match self.peek_kind() {
            TokenKind::If => self.if_statement(),
            TokenKind::While => self.while_statement(),
            TokenKind::For => self.for_statement(),
            TokenKind::Return => self.return_statement(),
            TokenKind::Break => {
                let line = self.advance().line;
                self.consume_terminator()?;
                Ok(Stmt::Break { line })
            }
            TokenKind::Continue => {
                let line = self.advance().line;
                self.consume_terminator()?;
                Ok(Stmt::Continue { line })
            }
            TokenKind::Try => self.try_statement(),
            TokenKind::Throw => {
                let line = self.advance().line;
                let value = self.expression()?;
                self.consume_terminator()?;
                Ok(Stmt::Throw { value, line })
            }
            TokenKind::LeftBrace => Ok(Stmt::Block(self.block()?)),
            _ => {
                let expr = self.expression()?;
                self.consume_terminator()?;
                Ok(Stmt::Expr(expr))
            }
        }
    }

    fn block(&mut self) -> Result<Vec<Stmt>, PandaError> {
        self.consume(TokenKind::LeftBrace, "Expected '{'")?;
        let mut stmts = Vec::new();
        loop {
            self.skip_newlines();
            if self.check(TokenKind::RightBrace) || self.check(TokenKind::Eof) {
                break;
            }
            stmts.push(self.declaration()?);
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after block")?;
        Ok(stmts)
    }

    fn if_statement(&mut self) -> Result<Stmt, PandaError> {
        let line = self.advance().line;
        let condition = self.expression()?;
        self.skip_newlines();
        let then_branch = Box::new(self.statement()?);

        // `else` may sit on its own line after the then-block.
        let saved = self.pos;
        self.skip_newlines();
        let else_branch = if self.matches(TokenKind::Else) {
            self.skip_newlines();
            Some(Box::new(self.statement()?))
        } else {
            self.pos = saved;
            None
        };

        Ok(Stmt::If {
            condition,
            then_branch,
            else_branch,
            line,
        })
    }

    fn while_statement(&mut self) -> Result<Stmt, PandaError> {
        let line = self.advance().line;
        let condition = self.expression()?;
        self.skip_newlines();
        let body = Box::new(self.statement()?);
        Ok(Stmt::While {
            condition,
            body,
            line,
        })
    }

    fn for_statement(&mut self) -> Result<Stmt, PandaError> {
        let line = self.advance().line;
        let first = self
            .consume(TokenKind::Identifier, "Expected loop variable after 'for'")?
            .lexeme;
        let (key_var, value_var) = if self.matches(TokenKind::Comma) {
            let second = self
                .consume(TokenKind::Identifier, "Expected value variable after ','")?
                .lexeme;
            (Some(first), second)
        } else {
            (None, first)
        };
        self.consume(TokenKind::In, "Expected 'in' in for loop")?;
        let iterable = self.expression()?;
        self.skip_newlines();
        let body = Box::new(self.statement()?);
        Ok(Stmt::ForIn {
            key_var,
            value_var,
            iterable,
            body,
            line,
        })
    }

    fn return_statement(&mut self) -> Result<Stmt, PandaError> {
        let line = self.advance().line;
        let value = if self.at_terminator() {
            None
        } else {
            Some(self.expression()?)
        };
        self.consume_terminator()?;
        Ok(Stmt::Return { value, line })
    }

    fn try_statement(&mut self) -> Result<Stmt, PandaError> {
        let line = self.advance().line;
        self.skip_newlines();
        let body = self.block()?;

        let saved = self.pos;
        self.skip_newlines();
        let catch = if self.matches(TokenKind::Catch) {
            let variable = if self.matches(TokenKind::LeftParen) {
                let name = self
                    .consume(TokenKind::Identifier, "Expected catch variable name")?
                    .lexeme;
                self.consume(TokenKind::RightParen, "Expected ')' after catch variable")?;
                Some(name)
            } else {
                None
            };
            self.skip_newlines();
            Some(CatchClause {
                variable,
                body: self.block()?,
            })
        } else {
            self.pos = saved;
            None
        };

        let saved = self.pos;
        self.skip_newlines();
        let finally = if self.matches(TokenKind::Finally) {
            self.skip_newlines();
            Some(self.block()?)
        } else {
            self.pos = saved;
            None
        };

        if catch.is_none() && finally.is_none() {
            return Err(self.error_here("Expected 'catch' or 'finally' after try block"));
        }

        Ok(Stmt::Try {
            body,
            catch,
            finally,
            line,
        })
    }

    // --- expressions ---

    fn expression(&mut self) -> Result<Expr, PandaError> {
        self.assignment()
    }

    fn assignment(&mut self) -> Result<Expr, PandaError> {
        let expr = self.ternary()?;

        let op = match self.peek_kind() {
            TokenKind::Equal => None,
            TokenKind::PlusEqual => Some(BinaryOp::Add),
            TokenKind::MinusEqual => Some(BinaryOp::Subtract),
            TokenKind::StarEqual => Some(BinaryOp::Multiply),
            TokenKind::SlashEqual => Some(BinaryOp::Divide),
            TokenKind::PercentEqual => Some(BinaryOp::Modulo),
            _ => return Ok(expr),
        };
        let token = self.advance();
        self.skip_newlines();
        self.check_assignment_target(&expr, &token)?;
        let value = self.assignment()?;
        Ok(Expr::Assign {
            target: Box::new(expr),
            value: Box::new(value),
            op,
            line: token.line,
        })
    }

    fn check_assignment_target(&self, target: &Expr, token: &Token) -> Result<(), PandaError> {
        match target {
            Expr::Variable { .. } => Ok(()),
            Expr::Property { optional: false, .. } => Ok(()),
            Expr::Index { optional: false, .. } => Ok(()),
            _ => Err(PandaError::parse(
                "Invalid assignment target",
                token.line,
                token.column,
            )),
        }
    }

    fn ternary(&mut self) -> Result<Expr, PandaError> {
        let condition = self.logic_or()?;
        if self.check(TokenKind::Question) {
            let line = self.advance().line;
            self.skip_newlines();
            let then_branch = self.ternary()?;
            self.skip_newlines();
            self.consume(TokenKind::Colon, "Expected ':' in ternary expression")?;
            self.skip_newlines();
            let else_branch = self.ternary()?;
            return Ok(Expr::Ternary {
                condition: Box::new(condition),
                then_branch: Box::new(then_branch),
                else_branch: Box::new(else_branch),
                line,
            });
        }
        Ok(condition)
    }

    fn logic_or(&mut self) -> Result<Expr, PandaError> {
        let mut expr = self.coalesce()?;
        while self.check(TokenKind::PipePipe) {
            let line = self.advance().line;
            self.skip_newlines();
            let right = self.coalesce()?;
            expr = Expr::Logical {
                left: Box::new(expr),
                op: LogicalOp::Or,
                right: Box::new(right),
                line,
            };
        }
        Ok(expr)
    }

    fn coalesce(&mut self) -> Result<Expr, PandaError> {
        let mut expr = self.logic_and()?;
        while self.check(TokenKind::QuestionQuestion) {
            let line = self.advance().line;
            self.skip_newlines();
            let right = self.logic_and()?;
            expr = Expr::Logical {
                left: Box::new(expr),
                op: LogicalOp::Coalesce,
                right: Box::new(right),
                line,
            };
        }
        Ok(expr)
    }

    fn logic_and(&mut self) -> Result<Expr, PandaError> {
        let mut expr = self.bitwise()?;
        while self.check(TokenKind::AmpAmp) {
            let line = self.advance().line;
            self.skip_newlines();
            let right = self.bitwise()?;
            expr = Expr::Logical {
                left: Box::new(expr),
                op: LogicalOp::And,
                right: Box::new(right),
                line,
            };
        }
        Ok(expr)
    }

    fn bitwise(&mut self) -> Result<Expr, PandaError> {
        let mut expr = self.equality()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Amp => BinaryOp::BitAnd,
                TokenKind::Pipe => BinaryOp::BitOr,
                TokenKind::Caret => BinaryOp::BitXor,
                _ => break,
            };
            let line = self.advance().line;
            self.skip_newlines();
            let right = self.equality()?;
            expr = Expr::Binary {
                left: Box::new(expr),
                op,
                right: Box::new(right),
                line,
            };
        }
        Ok(expr)
    }

    fn equality(&mut self) -> Result<Expr, PandaError> {
        let mut expr = self.comparison()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::EqualEqual => BinaryOp::Equal,
                TokenKind::BangEqual => BinaryOp::NotEqual,
                _ => break,
            };
            let line = self.advance().line;
            self.skip_newlines();
            let right = self.comparison()?;
            expr = Expr::Binary {
                left: Box::new(expr),
                op,
                right: Box::new(right),
                line,
            };
        }
        Ok(expr)
    }

    fn comparison(&mut self) -> Result<Expr, PandaError> {
        let mut expr = self.shift()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Less => BinaryOp::Less,
                TokenKind::LessEqual => BinaryOp::LessEqual,
                TokenKind::Greater => BinaryOp::Greater,
                TokenKind::GreaterEqual => BinaryOp::GreaterEqual,
                _ => break,
            };
            let line = self.advance().line;
            self.skip_newlines();
            let right = self.shift()?;
            expr = Expr::Binary {
                left: Box::new(expr),
                op,
                right: Box::new(right),
                line,
            };
        }
        Ok(expr)
    }

    fn shift(&mut self) -> Result<Expr, PandaError> {
        let mut expr = self.term()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::ShiftLeft => BinaryOp::ShiftLeft,
                TokenKind::ShiftRight => BinaryOp::ShiftRight,
                _ => break,
            };
            let line = self.advance().line;
            self.skip_newlines();
            let right = self.term()?;
            expr = Expr::Binary {
                left: Box::new(expr),
                op,
                right: Box::new(right),
                line,
            };
        }
        Ok(expr)
    }

    fn term(&mut self) -> Result<Expr, PandaError> {
        let mut expr = self.factor()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Subtract,
                _ => break,
            };
            let line = self.advance().line;
            self.skip_newlines();
            let right = self.factor()?;
            expr = Expr::Binary {
                left: Box::new(expr),
                op,
                right: Box::new(right),
                line,
            };
        }
        Ok(expr)
    }

    fn factor(&mut self) -> Result<Expr, PandaError> {
        let mut expr = self.unary()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => BinaryOp::Multiply,
                TokenKind::Slash => BinaryOp::Divide,
                TokenKind::Percent => BinaryOp::Modulo,
                _ => break,
            };
            let line = self.advance().line;
            self.skip_newlines();
            let right = self.unary()?;
            expr = Expr::Binary {
                left: Box::new(expr),
                op,
                right: Box::new(right),
                line,
            };
        }
        Ok(expr)
    }

    fn unary(&mut self) -> Result<Expr, PandaError> {
        let op = match self.peek_kind() {
            TokenKind::Bang => Some(UnaryOp::Not),
            TokenKind::Minus => Some(UnaryOp::Negate),
            TokenKind::Tilde => Some(UnaryOp::BitNot),
            _ => None,
        };
        if let Some(op) = op {
            let line = self.advance().line;
            self.skip_newlines();
            let operand = self.unary()?;
            return Ok(Expr::Unary {
                op,
                operand: Box::new(operand),
                line,
            });
        }

        if self.check(TokenKind::PlusPlus) || self.check(TokenKind::MinusMinus) {
            let token = self.advance();
            let increment = token.kind == TokenKind::PlusPlus;
            let target = self.unary()?;
            self.check_assignment_target(&target, &token)?;
            return Ok(Expr::IncDec {
                target: Box::new(target),
                increment,
                prefix: true,
                line: token.line,
            });
        }

        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, PandaError> {
        let mut expr = self.call()?;
        while self.check(TokenKind::PlusPlus) || self.check(TokenKind::MinusMinus) {
            let token = self.advance();
            self.check_assignment_target(&expr, &token)?;
            expr = Expr::IncDec {
                target: Box::new(expr),
                increment: token.kind == TokenKind::PlusPlus,
                prefix: false,
                line: token.line,
            };
        }
        Ok(expr)
    }

    fn call(&mut self) -> Result<Expr, PandaError> {
        let mut expr = self.primary()?;
        loop {
            match self.peek_kind() {
                TokenKind::LeftParen => {
                    let line = self.advance().line;
                    let args = self.argument_list()?;
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                        line,
                    };
                }
                TokenKind::Dot | TokenKind::QuestionDot => {
                    let token = self.advance();
                    self.skip_newlines();
                    let name = self
                        .consume(TokenKind::Identifier, "Expected property name after '.'")?
                        .lexeme;
                    expr = Expr::Property {
                        object: Box::new(expr),
                        name,
                        optional: token.kind == TokenKind::QuestionDot,
                        line: token.line,
                    };
                }
                TokenKind::LeftBracket | TokenKind::QuestionBracket => {
                    let token = self.advance();
                    self.skip_newlines();
                    let index = self.expression()?;
                    self.consume(TokenKind::RightBracket, "Expected ']' after index")?;
                    expr = Expr::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                        optional: token.kind == TokenKind::QuestionBracket,
                        line: token.line,
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn argument_list(&mut self) -> Result<Vec<Expr>, PandaError> {
        let mut args = Vec::new();
        if !self.check(TokenKind::RightParen) {
            loop {
                args.push(self.assignment()?);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expected ')' after arguments")?;
        Ok(args)
    }

    fn primary(&mut self) -> Result<Expr, PandaError> {
        match self.peek_kind() {
            TokenKind::Number => {
                let token = self.advance();
                match token.literal {
                    Some(Literal::Number(n)) => Ok(Expr::Number(n)),
                    _ => Err(PandaError::parse(
                        "Malformed number literal",
                        token.line,
                        token.column,
                    )),
                }
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::Bool(true))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::Bool(false))
            }
            TokenKind::Null => {
                self.advance();
                Ok(Expr::Null)
            }
            TokenKind::Str => {
                let token = self.advance();
                self.string_literal(token)
            }
            TokenKind::Identifier => {
                let token = self.advance();
                Ok(Expr::Variable {
                    name: token.lexeme,
                    line: token.line,
                })
            }
            TokenKind::This => {
                let line = self.advance().line;
                Ok(Expr::This { line })
            }
            TokenKind::Super => {
                let line = self.advance().line;
                self.consume(TokenKind::Dot, "Expected '.' after 'super'")?;
                let method = self
                    .consume(TokenKind::Identifier, "Expected method name after 'super.'")?
                    .lexeme;
                Ok(Expr::Super { method, line })
            }
            TokenKind::LeftParen => {
                if self.is_lambda_ahead() {
                    self.lambda()
                } else {
                    self.advance();
                    self.skip_newlines();
                    let expr = self.expression()?;
                    self.skip_newlines();
                    self.consume(TokenKind::RightParen, "Expected ')' after expression")?;
                    Ok(expr)
                }
            }
            TokenKind::LeftBracket => {
                let line = self.advance().line;
                let mut elements = Vec::new();
                self.skip_newlines();
                if !self.check(TokenKind::RightBracket) {
                    loop {
                        elements.push(self.assignment()?);
                        if !self.matches(TokenKind::Comma) {
                            break;
                        }
                        self.skip_newlines();
                        if self.check(TokenKind::RightBracket) {
                            break;
                        }
                    }
                }
                self.consume(TokenKind::RightBracket, "Expected ']' after array elements")?;
                Ok(Expr::Array { elements, line })
            }
            TokenKind::LeftBrace => self.object_literal(),
            _ => Err(self.error_here("Expected an expression")),
        }
    }

    fn object_literal(&mut self) -> Result<Expr, PandaError> {
        let line = self.advance().line;
        let mut entries = Vec::new();
        loop {
            self.skip_newlines();
            if self.check(TokenKind::RightBrace) {
                break;
            }
            let key = match self.peek_kind() {
                TokenKind::Identifier => self.advance().lexeme,
                TokenKind::Str => {
                    let token = self.advance();
                    match token.literal {
                        Some(Literal::Str(segments)) => match segments.as_slice() {
                            [StringSegment::Text(text)] => text.clone(),
                            _ => {
                                return Err(PandaError::parse(
                                    "Object key must be a plain string",
                                    token.line,
                                    token.column,
                                ));
                            }
                        },
                        _ => {
                            return Err(PandaError::parse(
                                "Object key must be a plain string",
                                token.line,
                                token.column,
                            ));
                        }
                    }
                }
                _ => return Err(self.error_here("Expected object key")),
            };
            self.skip_newlines();
            self.consume(TokenKind::Colon, "Expected ':' after object key")?;
            self.skip_newlines();
            let value = self.assignment()?;
            entries.push((key, value));
            self.skip_newlines();
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        self.skip_newlines();
        self.consume(TokenKind::RightBrace, "Expected '}' after object literal")?;
        Ok(Expr::Object { entries, line })
    }

    /// Re-parse an interpolated string's captured sub-sources into embedded
    /// expression ASTs.
    fn string_literal(&mut self, token: Token) -> Result<Expr, PandaError> {
        let segments = match token.literal {
            Some(Literal::Str(segments)) => segments,
            _ => {
                return Err(PandaError::parse(
                    "Malformed string literal",
                    token.line,
                    token.column,
                ));
            }
        };
        let mut parts = Vec::new();
        for segment in segments {
            match segment {
                StringSegment::Text(text) => parts.push(StrPart::Text(text)),
                StringSegment::Expr {
                    source,
                    line,
                    column,
                } => {
                    let tokens = Lexer::new(&source).tokenize().map_err(|mut e| {
                        e.line = line;
                        e.column = column;
                        e
                    })?;
                    let expr = Parser::new(tokens).parse_expression().map_err(|mut e| {
                        e.line = line;
                        e.column = column;
                        e
                    })?;
                    parts.push(StrPart::Interp(Box::new(expr)));
                }
            }
        }
        Ok(Expr::Str(parts))
    }

    /// Decide whether the `(` at the current position opens a lambda
    /// parameter list. Scans ahead (without consuming) to the matching close
    /// paren and checks for `=>`, tolerating newlines in between. Handles
    /// empty lists, rest parameters, and defaults with nested parens, since
    /// the scan only balances bracket tokens.
    fn is_lambda_ahead(&self) -> bool {
        let mut depth = 0usize;
        let mut index = self.pos;
        loop {
            let Some(token) = self.tokens.get(index) else {
                return false;
            };
            match token.kind {
                TokenKind::LeftParen | TokenKind::LeftBracket | TokenKind::QuestionBracket => {
                    depth += 1;
                }
                TokenKind::RightParen | TokenKind::RightBracket => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 && token.kind == TokenKind::RightParen {
                        index += 1;
                        break;
                    }
                }
                TokenKind::Eof => return false,
                _ => {}
            }
            index += 1;
        }
        while let Some(token) = self.tokens.get(index) {
            match token.kind {
                TokenKind::Newline => index += 1,
                TokenKind::Arrow => return true,
                _ => return false,
            }
        }
        false
    }

    fn lambda(&mut self) -> Result<Expr, PandaError> {
        let line = self.advance().line; // consume '('
        let (params, rest_param) = self.parameter_list()?;
        self.skip_newlines();
        self.consume(TokenKind::Arrow, "Expected '=>' after lambda parameters")?;
        self.skip_newlines();
        let body = if self.check(TokenKind::LeftBrace) {
            LambdaBody::Block(self.block()?)
        } else {
            LambdaBody::Expr(Box::new(self.assignment()?))
        };
        Ok(Expr::Lambda {
            params,
            rest_param,
            body,
            line,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_source(source: &str) -> Result<Vec<Stmt>, PandaError> {
        let tokens = Lexer::new(source).tokenize()?;
        Parser::new(tokens).parse()
    }

    fn parse_one(source: &str) -> Stmt {
        let mut stmts = parse_source(source).unwrap();
        assert_eq!(stmts.len(), 1, "expected one statement");
        stmts.remove(0)
    }

    #[test]
    fn precedence_multiplication_binds_tighter() {
        match parse_one("return 2 + 3 * 4") {
            Stmt::Return {
                value: Some(Expr::Binary { op, right, .. }),
                ..
            } => {
                assert_eq!(op, BinaryOp::Add);
                assert!(matches!(
                    *right,
                    Expr::Binary {
                        op: BinaryOp::Multiply,
                        ..
                    }
                ));
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn newline_terminates_statements() {
        let stmts = parse_source("var a = 1\nvar b = 2").unwrap();
        assert_eq!(stmts.len(), 2);
    }

    #[test]
    fn missing_terminator_is_an_error() {
        let err = parse_source("var a = 1 var b = 2").unwrap_err();
        assert!(err.message.contains("Expected newline or ';'"));
    }

    #[test]
    fn lambda_is_distinguished_from_grouping() {
        match parse_one("var f = (x, y) => x + y") {
            Stmt::Var {
                initializer: Some(Expr::Lambda { params, .. }),
                ..
            } => assert_eq!(params.len(), 2),
            other => panic!("expected lambda, got {:?}", other),
        }
        match parse_one("var g = (1 + 2) * 3") {
            Stmt::Var {
                initializer: Some(Expr::Binary { .. }),
                ..
            } => {}
            other => panic!("expected grouped binary, got {:?}", other),
        }
    }

    #[test]
    fn lambda_scan_handles_defaults_with_nested_parens() {
        match parse_one("var f = (a = g(1, (2)), ...rest) => a") {
            Stmt::Var {
                initializer:
                    Some(Expr::Lambda {
                        params, rest_param, ..
                    }),
                ..
            } => {
                assert_eq!(params.len(), 1);
                assert!(params[0].default.is_some());
                assert_eq!(rest_param.as_deref(), Some("rest"));
            }
            other => panic!("expected lambda, got {:?}", other),
        }
    }

    #[test]
    fn empty_lambda_with_newline_before_arrow() {
        match parse_one("var f = ()\n=> 1") {
            Stmt::Var {
                initializer: Some(Expr::Lambda { params, .. }),
                ..
            } => assert!(params.is_empty()),
            other => panic!("expected lambda, got {:?}", other),
        }
    }

    #[test]
    fn non_default_after_default_is_rejected() {
        let err = parse_source("func f(a = 1, b) {}").unwrap_err();
        assert!(err.message.contains("Non-default parameter"));
    }

    #[test]
    fn rest_parameter_must_be_last() {
        let err = parse_source("func f(...rest, a) {}").unwrap_err();
        assert!(err.message.contains("Rest parameter must be last"));
    }

    #[test]
    fn invalid_assignment_target_is_rejected() {
        let err = parse_source("1 = 2").unwrap_err();
        assert!(err.message.contains("Invalid assignment target"));
    }

    #[test]
    fn class_body_members_are_sorted_into_buckets() {
        let stmt = parse_one(
            "class Point : Base {\n  var x = 0\n  static var count = 0\n  Point(x) { this.x = x }\n  func len() { return this.x }\n  static func origin() { return Point(0) }\n}",
        );
        match stmt {
            Stmt::Class { decl, .. } => {
                assert_eq!(decl.superclass.as_deref(), Some("Base"));
                assert_eq!(decl.fields.len(), 1);
                assert_eq!(decl.static_fields.len(), 1);
                assert_eq!(decl.methods.len(), 2);
                assert_eq!(decl.static_methods.len(), 1);
                assert!(decl.methods.iter().any(|m| m.name == "Point"));
            }
            other => panic!("expected class, got {:?}", other),
        }
    }

    #[test]
    fn enum_members_parse_with_values() {
        match parse_one("enum E { A, B = 5, C = \"x\" }") {
            Stmt::Enum { members, .. } => {
                assert_eq!(members.len(), 3);
                assert!(matches!(members[0].1, EnumValue::Auto));
                assert!(matches!(members[1].1, EnumValue::Number(n) if n == 5.0));
                assert!(matches!(members[2].1, EnumValue::Str(ref s) if s == "x"));
            }
            other => panic!("expected enum, got {:?}", other),
        }
    }

    #[test]
    fn import_with_alias() {
        match parse_one("import \"util.math\" as m") {
            Stmt::Import { path, alias, is_global, .. } => {
                assert_eq!(path, "util.math");
                assert_eq!(alias.as_deref(), Some("m"));
                assert!(!is_global);
            }
            other => panic!("expected import, got {:?}", other),
        }
    }

    #[test]
    fn global_and_export_prefixes() {
        let stmts = parse_source("global var g = 1\nexport func f() {}").unwrap();
        assert!(matches!(
            stmts[0],
            Stmt::Var {
                modifier: DeclModifier::Global,
                ..
            }
        ));
        assert!(matches!(
            stmts[1],
            Stmt::Func {
                modifier: DeclModifier::Export,
                ..
            }
        ));
    }

    #[test]
    fn try_requires_catch_or_finally() {
        let err = parse_source("try { }\nvar x = 1").unwrap_err();
        assert!(err.message.contains("Expected 'catch' or 'finally'"));
    }

    #[test]
    fn for_kv_form_parses() {
        match parse_one("for k, v in obj { }") {
            Stmt::ForIn {
                key_var, value_var, ..
            } => {
                assert_eq!(key_var.as_deref(), Some("k"));
                assert_eq!(value_var, "v");
            }
            other => panic!("expected for-in, got {:?}", other),
        }
    }

    #[test]
    fn single_statement_bodies() {
        match parse_one("if x == 5 break") {
            Stmt::If { then_branch, .. } => {
                assert!(matches!(*then_branch, Stmt::Break { .. }));
            }
            other => panic!("expected if, got {:?}", other),
        }
    }

    #[test]
    fn optional_chaining_parses() {
        match parse_one("var v = a?.b?[0]") {
            Stmt::Var {
                initializer: Some(Expr::Index { optional, object, .. }),
                ..
            } => {
                assert!(optional);
                assert!(matches!(
                    *object,
                    Expr::Property { optional: true, .. }
                ));
            }
            other => panic!("expected optional chain, got {:?}", other),
        }
    }

    #[test]
    fn interpolated_strings_embed_expressions() {
        match parse_one("var s = \"v={x + 1}\"") {
            Stmt::Var {
                initializer: Some(Expr::Str(parts)),
                ..
            } => {
                assert_eq!(parts.len(), 2);
                assert!(matches!(parts[0], StrPart::Text(ref t) if t == "v="));
                assert!(matches!(parts[1], StrPart::Interp(_)));
            }
            other => panic!("expected string literal, got {:?}", other),
        }
    }
}
