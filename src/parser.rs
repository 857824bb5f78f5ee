//! Recursive-descent parser over the token stream produced by
//! [`crate::lexer::Lexer`], producing the [`crate::ast`] this crate's
//! core subsystems consume.

use thiserror::Error;

use crate::ast::*;
use crate::lexer::{LexError, Lexer, Spanned, Token};
use crate::span::Span;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error("unexpected token {found} at line {line}, expected {expected}")]
    Unexpected { found: String, expected: &'static str, line: u32, span: Span },
    #[error("construct not supported by this front end: {0}")]
    Unsupported(&'static str),
}

pub struct Parser {
    tokens: Vec<Spanned<Token>>,
    pos: usize,
}

impl Parser {
    pub fn new(src: &str) -> Result<Self, ParseError> {
        let tokens = Lexer::new(src).tokenize()?;
        Ok(Self { tokens, pos: 0 })
    }

    pub fn parse_module(mut self) -> Result<Module, ParseError> {
        let start = self.cur().span;
        let mut body = Vec::new();
        while !self.at(&Token::Eof) {
            body.push(self.parse_statement()?);
        }
        let end = self.cur().span;
        Ok(Module { body, span: start.merge(end) })
    }

    fn cur(&self) -> &Spanned<Token> {
        &self.tokens[self.pos]
    }

    fn at(&self, tok: &Token) -> bool {
        &self.cur().value == tok
    }

    fn bump(&mut self) -> Spanned<Token> {
        let t = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, tok: Token, expected: &'static str) -> Result<Spanned<Token>, ParseError> {
        if self.cur().value == tok {
            Ok(self.bump())
        } else {
            Err(ParseError::Unexpected {
                found: self.cur().value.to_string(),
                expected,
                line: self.cur().span.line,
                span: self.cur().span,
            })
        }
    }

    fn expect_ident(&mut self) -> Result<Ident, ParseError> {
        let tok = self.cur().clone();
        match tok.value {
            Token::Ident(name) => {
                self.bump();
                Ok(Ident { name, span: tok.span })
            }
            _ => Err(ParseError::Unexpected { found: tok.value.to_string(), expected: "identifier", line: tok.span.line, span: tok.span }),
        }
    }

    fn eat_semi(&mut self) {
        if self.at(&Token::Semi) {
            self.bump();
        }
    }

    // ---- statements ----

    fn parse_statement(&mut self) -> Result<Statement, ParseError> {
        match self.cur().value.clone() {
            Token::Var | Token::Let | Token::Const => self.parse_var_decl(),
            Token::Function => self.parse_function_decl().map(Statement::FunctionDecl),
            Token::Return => {
                let start = self.bump().span;
                let value = if self.at(&Token::Semi) || self.at(&Token::RBrace) || self.at(&Token::Eof) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.eat_semi();
                Ok(Statement::Return { value, span: start })
            }
            Token::If => self.parse_if(),
            Token::While => self.parse_while(),
            Token::For => self.parse_for(),
            Token::Try => self.parse_try(),
            Token::Throw => {
                let start = self.bump().span;
                let value = self.parse_expr()?;
                self.eat_semi();
                Ok(Statement::Throw { value, span: start })
            }
            Token::With => self.parse_with(),
            Token::LBrace => self.parse_block(),
            Token::Break => {
                let span = self.bump().span;
                self.eat_semi();
                Ok(Statement::Break { span })
            }
            Token::Continue => {
                let span = self.bump().span;
                self.eat_semi();
                Ok(Statement::Continue { span })
            }
            _ => {
                let value = self.parse_expr()?;
                let span = value.span();
                self.eat_semi();
                Ok(Statement::Expr { value, span })
            }
        }
    }

    fn parse_var_decl(&mut self) -> Result<Statement, ParseError> {
        let start = self.cur().span;
        let kind = match self.bump().value {
            Token::Var => VarKind::Var,
            Token::Let => VarKind::Let,
            Token::Const => VarKind::Const,
            _ => unreachable!(),
        };
        let name = self.expect_ident()?;
        let init = if self.at(&Token::Assign) {
            self.bump();
            Some(self.parse_expr()?)
        } else {
            None
        };
        self.eat_semi();
        Ok(Statement::VarDecl { kind, name, init, span: start })
    }

    fn parse_function_decl(&mut self) -> Result<FunctionDecl, ParseError> {
        let start = self.bump().span; // `function`
        let is_generator = if self.at(&Token::Star) {
            self.bump();
            true
        } else {
            false
        };
        let name = if matches!(self.cur().value, Token::Ident(_)) {
            Some(self.expect_ident()?)
        } else {
            None
        };
        self.expect(Token::LParen, "(")?;
        let mut params = Vec::new();
        while !self.at(&Token::RParen) {
            params.push(self.expect_ident()?);
            if self.at(&Token::Comma) {
                self.bump();
            }
        }
        self.expect(Token::RParen, ")")?;
        self.expect(Token::LBrace, "{")?;
        let mut body = Vec::new();
        while !self.at(&Token::RBrace) {
            body.push(self.parse_statement()?);
        }
        let end = self.expect(Token::RBrace, "}")?.span;
        Ok(FunctionDecl { name, params, body, is_generator, span: start.merge(end) })
    }

    fn parse_block(&mut self) -> Result<Statement, ParseError> {
        let start = self.expect(Token::LBrace, "{")?.span;
        let mut body = Vec::new();
        while !self.at(&Token::RBrace) {
            body.push(self.parse_statement()?);
        }
        let end = self.expect(Token::RBrace, "}")?.span;
        Ok(Statement::Block { body, span: start.merge(end) })
    }

    fn parse_block_body(&mut self) -> Result<Vec<Statement>, ParseError> {
        self.expect(Token::LBrace, "{")?;
        let mut body = Vec::new();
        while !self.at(&Token::RBrace) {
            body.push(self.parse_statement()?);
        }
        self.expect(Token::RBrace, "}")?;
        Ok(body)
    }

    fn parse_if(&mut self) -> Result<Statement, ParseError> {
        let start = self.bump().span;
        self.expect(Token::LParen, "(")?;
        let test = self.parse_expr()?;
        self.expect(Token::RParen, ")")?;
        let consequent = Box::new(self.parse_statement()?);
        let alternate = if self.at(&Token::Else) {
            self.bump();
            Some(Box::new(self.parse_statement()?))
        } else {
            None
        };
        Ok(Statement::If { test, consequent, alternate, span: start })
    }

    fn parse_while(&mut self) -> Result<Statement, ParseError> {
        let start = self.bump().span;
        self.expect(Token::LParen, "(")?;
        let test = self.parse_expr()?;
        self.expect(Token::RParen, ")")?;
        let body = Box::new(self.parse_statement()?);
        Ok(Statement::While { test, body, span: start })
    }

    fn parse_for(&mut self) -> Result<Statement, ParseError> {
        let start = self.bump().span;
        self.expect(Token::LParen, "(")?;

        // Disambiguate `for (VAR x in/of EXPR)` vs classic `for (init; test; update)`.
        if matches!(self.cur().value, Token::Var | Token::Let | Token::Const) {
            let kind_tok = self.cur().value.clone();
            let save = self.pos;
            self.bump();
            let name = self.expect_ident()?;
            if self.at(&Token::In) || self.at(&Token::Of) {
                let is_in = self.at(&Token::In);
                self.bump();
                let decl_kind = match kind_tok {
                    Token::Var => VarKind::Var,
                    Token::Let => VarKind::Let,
                    Token::Const => VarKind::Const,
                    _ => unreachable!(),
                };
                let source = self.parse_expr()?;
                self.expect(Token::RParen, ")")?;
                let body = Box::new(self.parse_statement()?);
                return Ok(if is_in {
                    Statement::ForIn { decl_kind, name, object: source, body, span: start }
                } else {
                    Statement::ForOf { decl_kind, name, iterable: source, body, span: start }
                });
            }
            self.pos = save;
        }

        // `parse_statement` consumes the trailing `;` itself for both var
        // decls and expression statements, so only an empty init needs one.
        let init = if self.at(&Token::Semi) {
            self.expect(Token::Semi, ";")?;
            None
        } else {
            Some(Box::new(self.parse_statement()?))
        };
        let test = if self.at(&Token::Semi) { None } else { Some(self.parse_expr()?) };
        self.expect(Token::Semi, ";")?;
        let update = if self.at(&Token::RParen) { None } else { Some(self.parse_expr()?) };
        self.expect(Token::RParen, ")")?;
        let body = Box::new(self.parse_statement()?);
        Ok(Statement::ForClassic { init, test, update, body, span: start })
    }

    fn parse_try(&mut self) -> Result<Statement, ParseError> {
        let start = self.bump().span;
        let block = self.parse_block_body()?;
        let (catch_param, catch_block) = if self.at(&Token::Catch) {
            self.bump();
            let param = if self.at(&Token::LParen) {
                self.bump();
                let p = self.expect_ident()?;
                self.expect(Token::RParen, ")")?;
                Some(p)
            } else {
                None
            };
            (param, Some(self.parse_block_body()?))
        } else {
            (None, None)
        };
        let finally_block = if self.at(&Token::Finally) {
            self.bump();
            Some(self.parse_block_body()?)
        } else {
            None
        };
        Ok(Statement::Try { block, catch_param, catch_block, finally_block, span: start })
    }

    fn parse_with(&mut self) -> Result<Statement, ParseError> {
        let start = self.bump().span;
        self.expect(Token::LParen, "(")?;
        let object = self.parse_expr()?;
        self.expect(Token::RParen, ")")?;
        let body = Box::new(self.parse_statement()?);
        Ok(Statement::With { object, body, span: start })
    }

    // ---- expressions (precedence climbing) ----

    pub fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> Result<Expr, ParseError> {
        let left = self.parse_ternary()?;
        let op = match self.cur().value {
            Token::Assign => Some(AssignOp::Assign),
            Token::PlusAssign => Some(AssignOp::AddAssign),
            Token::MinusAssign => Some(AssignOp::SubAssign),
            Token::StarAssign => Some(AssignOp::MulAssign),
            Token::SlashAssign => Some(AssignOp::DivAssign),
            _ => None,
        };
        if let Some(op) = op {
            let span = self.bump().span;
            let value = self.parse_assignment()?;
            return Ok(Expr::Assign { op, target: Box::new(left), value: Box::new(value), span });
        }
        Ok(left)
    }

    fn parse_ternary(&mut self) -> Result<Expr, ParseError> {
        let test = self.parse_logical_or()?;
        if self.at(&Token::Question) {
            let span = self.bump().span;
            let consequent = self.parse_assignment()?;
            self.expect(Token::Colon, ":")?;
            let alternate = self.parse_assignment()?;
            return Ok(Expr::Ternary {
                test: Box::new(test),
                consequent: Box::new(consequent),
                alternate: Box::new(alternate),
                span,
            });
        }
        Ok(test)
    }

    fn parse_logical_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_logical_and()?;
        while self.at(&Token::OrOr) {
            let span = self.bump().span;
            let right = self.parse_logical_and()?;
            left = Expr::Binary { op: BinOp::Or, left: Box::new(left), right: Box::new(right), span };
        }
        Ok(left)
    }

    fn parse_logical_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_equality()?;
        while self.at(&Token::AndAnd) {
            let span = self.bump().span;
            let right = self.parse_equality()?;
            left = Expr::Binary { op: BinOp::And, left: Box::new(left), right: Box::new(right), span };
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_relational()?;
        loop {
            let op = match self.cur().value {
                Token::EqEq => BinOp::Eq,
                Token::NotEq => BinOp::NotEq,
                Token::EqEqEq => BinOp::StrictEq,
                Token::NotEqEq => BinOp::StrictNotEq,
                _ => break,
            };
            let span = self.bump().span;
            let right = self.parse_relational()?;
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right), span };
        }
        Ok(left)
    }

    fn parse_relational(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.cur().value {
                Token::Lt => BinOp::Lt,
                Token::Gt => BinOp::Gt,
                Token::LtEq => BinOp::LtEq,
                Token::GtEq => BinOp::GtEq,
                _ => break,
            };
            let span = self.bump().span;
            let right = self.parse_additive()?;
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right), span };
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.cur().value {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => break,
            };
            let span = self.bump().span;
            let right = self.parse_multiplicative()?;
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right), span };
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.cur().value {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::Percent => BinOp::Mod,
                _ => break,
            };
            let span = self.bump().span;
            let right = self.parse_unary()?;
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right), span };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        match self.cur().value {
            Token::Minus => {
                let span = self.bump().span;
                let operand = self.parse_unary()?;
                Ok(Expr::Unary { op: UnOp::Neg, operand: Box::new(operand), span })
            }
            Token::Bang => {
                let span = self.bump().span;
                let operand = self.parse_unary()?;
                Ok(Expr::Unary { op: UnOp::Not, operand: Box::new(operand), span })
            }
            Token::Yield => {
                let span = self.bump().span;
                let value = if self.at(&Token::Semi) || self.at(&Token::RParen) || self.at(&Token::RBrace) {
                    None
                } else {
                    Some(Box::new(self.parse_assignment()?))
                };
                Ok(Expr::Yield { value, span })
            }
            _ => self.parse_call_member(),
        }
    }

    fn parse_call_member(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.cur().value {
                Token::Dot => {
                    let span = self.bump().span;
                    let prop = self.expect_ident()?;
                    expr = Expr::Member { object: Box::new(expr), property: MemberKey::Ident(prop.name), span };
                }
                Token::LBracket => {
                    let span = self.bump().span;
                    let key = self.parse_expr()?;
                    self.expect(Token::RBracket, "]")?;
                    expr = Expr::Member { object: Box::new(expr), property: MemberKey::Computed(Box::new(key)), span };
                }
                Token::LParen => {
                    let span = self.bump().span;
                    let mut args = Vec::new();
                    while !self.at(&Token::RParen) {
                        args.push(self.parse_assignment()?);
                        if self.at(&Token::Comma) {
                            self.bump();
                        }
                    }
                    self.expect(Token::RParen, ")")?;
                    expr = Expr::Call { callee: Box::new(expr), args, span };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let tok = self.cur().clone();
        match tok.value {
            Token::Number(n) => { self.bump(); Ok(Expr::Number(n, tok.span)) }
            Token::Str(s) => { self.bump(); Ok(Expr::Str(s, tok.span)) }
            Token::True => { self.bump(); Ok(Expr::Bool(true, tok.span)) }
            Token::False => { self.bump(); Ok(Expr::Bool(false, tok.span)) }
            Token::Null => { self.bump(); Ok(Expr::Null(tok.span)) }
            Token::Undefined => { self.bump(); Ok(Expr::Undefined(tok.span)) }
            Token::Ident(name) => { self.bump(); Ok(Expr::Ident(Ident { name, span: tok.span })) }
            Token::Function => Ok(Expr::Function(Box::new(self.parse_function_decl()?))),
            Token::LParen => {
                self.bump();
                let inner = self.parse_expr()?;
                self.expect(Token::RParen, ")")?;
                Ok(inner)
            }
            Token::LBracket => self.parse_array_literal(),
            Token::LBrace => self.parse_object_literal(),
            _ => Err(ParseError::Unexpected { found: tok.value.to_string(), expected: "expression", line: tok.span.line, span: tok.span }),
        }
    }

    fn parse_array_literal(&mut self) -> Result<Expr, ParseError> {
        let start = self.bump().span;
        let mut items = Vec::new();
        while !self.at(&Token::RBracket) {
            items.push(self.parse_assignment()?);
            if self.at(&Token::Comma) {
                self.bump();
            }
        }
        let end = self.expect(Token::RBracket, "]")?.span;
        Ok(Expr::Array(items, start.merge(end)))
    }

    fn parse_object_literal(&mut self) -> Result<Expr, ParseError> {
        let start = self.bump().span;
        let mut props = Vec::new();
        while !self.at(&Token::RBrace) {
            let key = match self.cur().value.clone() {
                Token::Ident(name) => { self.bump(); PropertyKey::Ident(name) }
                Token::Str(s) => { self.bump(); PropertyKey::Str(s) }
                _ => {
                    return Err(ParseError::Unexpected {
                        found: self.cur().value.to_string(),
                        expected: "property key",
                        line: self.cur().span.line,
                        span: self.cur().span,
                    })
                }
            };
            self.expect(Token::Colon, ":")?;
            let value = self.parse_assignment()?;
            props.push((key, value));
            if self.at(&Token::Comma) {
                self.bump();
            }
        }
        let end = self.expect(Token::RBrace, "}")?.span;
        Ok(Expr::Object(props, start.merge(end)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Module {
        Parser::new(src).unwrap().parse_module().unwrap()
    }

    #[test]
    fn parses_function_decl_and_call() {
        let m = parse("function f(x){return x+1} f(41)");
        assert_eq!(m.body.len(), 2);
        assert!(matches!(m.body[0], Statement::FunctionDecl(_)));
        assert!(matches!(m.body[1], Statement::Expr { .. }));
    }

    #[test]
    fn parses_try_catch_finally() {
        let m = parse("try{throw 7}catch(e){a=e}finally{a+=1}");
        assert!(matches!(m.body[0], Statement::Try { .. }));
    }

    #[test]
    fn parses_for_in_and_for_of() {
        let m = parse("for (var k in obj) s += k; for (const x of arr) s += x;");
        assert!(matches!(m.body[0], Statement::ForIn { .. }));
        assert!(matches!(m.body[1], Statement::ForOf { .. }));
    }

    #[test]
    fn parses_generator_and_yield() {
        let m = parse("function* g(){yield 1; yield 2}");
        match &m.body[0] {
            Statement::FunctionDecl(f) => assert!(f.is_generator),
            _ => panic!("expected function decl"),
        }
    }

    #[test]
    fn parses_with_statement() {
        let m = parse("with({x:5}){y}");
        assert!(matches!(m.body[0], Statement::With { .. }));
    }

    #[test]
    fn parses_ternary_and_member() {
        let m = parse("it.next().done?10:0;");
        assert!(matches!(m.body[0], Statement::Expr { .. }));
    }
}
