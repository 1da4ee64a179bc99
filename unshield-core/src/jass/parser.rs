use std::collections::HashSet;

use super::lexer::{tokenize, Token, TokenKind};
use super::syntax::*;
use super::ParseError;

const BLOCK_ENDS: &[&str] = &["endfunction", "endif", "else", "elseif", "endloop"];

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &TokenKind {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].kind
    }

    fn peek_at(&self, offset: usize) -> &TokenKind {
        let index = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[index].kind
    }

    fn line(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].line
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        kind
    }

    fn error(&self, expected: &str) -> ParseError {
        let found = match self.peek() {
            TokenKind::Ident(s)
            | TokenKind::Integer(s)
            | TokenKind::Real(s) => s.clone(),
            TokenKind::FourCC(s) => format!("'{s}'"),
            TokenKind::Str(s) => format!("\"{s}\""),
            TokenKind::Comment(_) => "comment".to_string(),
            TokenKind::Symbol(s) => s.to_string(),
            TokenKind::Newline => "end of line".to_string(),
            TokenKind::Eof => "end of input".to_string(),
        };
        ParseError::Expected {
            line: self.line(),
            expected: expected.to_string(),
            found,
        }
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), TokenKind::Ident(s) if s == keyword)
    }

    fn at_symbol(&self, symbol: &str) -> bool {
        matches!(self.peek(), TokenKind::Symbol(s) if *s == symbol)
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.at_keyword(keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_symbol(&mut self, symbol: &str) -> bool {
        if self.at_symbol(symbol) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), ParseError> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.error(&format!("'{keyword}'")))
        }
    }

    fn expect_symbol(&mut self, symbol: &str) -> Result<(), ParseError> {
        if self.eat_symbol(symbol) {
            Ok(())
        } else {
            Err(self.error(&format!("'{symbol}'")))
        }
    }

    fn ident(&mut self) -> Result<String, ParseError> {
        match self.peek() {
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(self.error("identifier")),
        }
    }

    /// Ends a line. A trailing comment on the same line is discarded.
    fn end_of_line(&mut self) -> Result<(), ParseError> {
        if matches!(self.peek(), TokenKind::Comment(_)) {
            self.advance();
        }
        match self.peek() {
            TokenKind::Newline => {
                self.advance();
                Ok(())
            }
            TokenKind::Eof => Ok(()),
            _ => Err(self.error("end of line")),
        }
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek(), TokenKind::Newline) {
            self.advance();
        }
    }

    fn unit(&mut self) -> Result<Unit, ParseError> {
        let mut unit = Unit::default();
        let mut seen = HashSet::new();

        loop {
            self.skip_newlines();
            match self.peek().clone() {
                TokenKind::Eof => break,
                TokenKind::Comment(text) => {
                    self.advance();
                    unit.declarations.push(Declaration::Comment(text));
                }
                TokenKind::Ident(word) => match word.as_str() {
                    "type" => {
                        self.advance();
                        let name = self.ident()?;
                        self.expect_keyword("extends")?;
                        let base = self.ident()?;
                        self.end_of_line()?;
                        unit.declarations.push(Declaration::Type { name, base });
                    }
                    "globals" => {
                        self.advance();
                        self.end_of_line()?;
                        let globals = self.globals()?;
                        unit.declarations.push(Declaration::Globals(globals));
                    }
                    "constant" | "native" | "function" => {
                        let constant = self.eat_keyword("constant");
                        if self.eat_keyword("native") {
                            let (name, params, returns) = self.signature()?;
                            self.end_of_line()?;
                            unit.declarations.push(Declaration::Native(Native {
                                constant,
                                name,
                                params,
                                returns,
                            }));
                        } else {
                            self.expect_keyword("function")?;
                            let (name, params, returns) = self.signature()?;
                            self.end_of_line()?;
                            let body = self.block()?;
                            self.expect_keyword("endfunction")?;
                            self.end_of_line()?;
                            if seen.insert(name.clone()) {
                                unit.declarations.push(Declaration::Function(Function {
                                    constant,
                                    name,
                                    params,
                                    returns,
                                    body,
                                }));
                            } else {
                                log::debug!("dropping duplicate function {name}");
                            }
                        }
                    }
                    _ => return Err(self.error("declaration")),
                },
                _ => return Err(self.error("declaration")),
            }
        }
        Ok(unit)
    }

    fn globals(&mut self) -> Result<Vec<Global>, ParseError> {
        let mut globals = Vec::new();
        loop {
            self.skip_newlines();
            if matches!(self.peek(), TokenKind::Comment(_)) {
                self.advance();
                continue;
            }
            if self.eat_keyword("endglobals") {
                self.end_of_line()?;
                return Ok(globals);
            }
            if matches!(self.peek(), TokenKind::Eof) {
                return Err(self.error("'endglobals'"));
            }
            let constant = self.eat_keyword("constant");
            let type_name = self.ident()?;
            let is_array = self.eat_keyword("array");
            let name = self.ident()?;
            let init = if self.eat_symbol("=") {
                Some(self.expr()?)
            } else {
                None
            };
            self.end_of_line()?;
            globals.push(Global {
                constant,
                type_name,
                is_array,
                name,
                init,
            });
        }
    }

    fn signature(&mut self) -> Result<(String, Vec<Param>, String), ParseError> {
        let name = self.ident()?;
        self.expect_keyword("takes")?;
        let mut params = Vec::new();
        if !self.eat_keyword("nothing") {
            loop {
                let type_name = self.ident()?;
                let name = self.ident()?;
                params.push(Param { type_name, name });
                if !self.eat_symbol(",") {
                    break;
                }
            }
        }
        self.expect_keyword("returns")?;
        let returns = self.ident()?;
        Ok((name, params, returns))
    }

    fn block(&mut self) -> Result<Vec<Statement>, ParseError> {
        let mut body = Vec::new();
        loop {
            self.skip_newlines();
            match self.peek() {
                TokenKind::Ident(word) if BLOCK_ENDS.contains(&word.as_str()) => {
                    return Ok(body)
                }
                TokenKind::Eof => return Ok(body),
                TokenKind::Comment(text) => {
                    body.push(Statement::Comment(text.clone()));
                    self.advance();
                }
                _ => {
                    let stmt = self.statement()?;
                    self.end_of_line()?;
                    body.push(stmt);
                }
            }
        }
    }

    fn statement(&mut self) -> Result<Statement, ParseError> {
        let keyword = match self.peek() {
            TokenKind::Ident(word) => word.clone(),
            _ => return Err(self.error("statement")),
        };
        self.advance();
        match keyword.as_str() {
            "local" => {
                let type_name = self.ident()?;
                let is_array = self.eat_keyword("array");
                let name = self.ident()?;
                let init = if self.eat_symbol("=") {
                    Some(self.expr()?)
                } else {
                    None
                };
                Ok(Statement::Local {
                    type_name,
                    is_array,
                    name,
                    init,
                })
            }
            "set" => {
                let name = self.ident()?;
                let index = if self.eat_symbol("[") {
                    let index = self.expr()?;
                    self.expect_symbol("]")?;
                    Some(index)
                } else {
                    None
                };
                self.expect_symbol("=")?;
                let value = self.expr()?;
                Ok(Statement::Set { name, index, value })
            }
            "call" => {
                let name = self.ident()?;
                let args = self.arguments()?;
                Ok(Statement::Call { name, args })
            }
            "if" => {
                let mut branches = Vec::new();
                let condition = self.expr()?;
                self.expect_keyword("then")?;
                self.end_of_line()?;
                branches.push((condition, self.block()?));
                let mut else_body = None;
                loop {
                    if self.eat_keyword("elseif") {
                        let condition = self.expr()?;
                        self.expect_keyword("then")?;
                        self.end_of_line()?;
                        branches.push((condition, self.block()?));
                    } else if self.eat_keyword("else") {
                        self.end_of_line()?;
                        else_body = Some(self.block()?);
                    } else {
                        self.expect_keyword("endif")?;
                        break;
                    }
                }
                Ok(Statement::If {
                    branches,
                    else_body,
                })
            }
            "loop" => {
                self.end_of_line()?;
                let body = self.block()?;
                self.expect_keyword("endloop")?;
                Ok(Statement::Loop(body))
            }
            "exitwhen" => Ok(Statement::ExitWhen(self.expr()?)),
            "return" => {
                let value = match self.peek() {
                    TokenKind::Newline | TokenKind::Comment(_) | TokenKind::Eof => None,
                    _ => Some(self.expr()?),
                };
                Ok(Statement::Return(value))
            }
            "debug" => Ok(Statement::Debug(Box::new(self.statement()?))),
            _ => {
                self.pos -= 1;
                Err(self.error("statement"))
            }
        }
    }

    fn arguments(&mut self) -> Result<Vec<Expr>, ParseError> {
        self.expect_symbol("(")?;
        let mut args = Vec::new();
        if self.eat_symbol(")") {
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            if self.eat_symbol(")") {
                return Ok(args);
            }
            self.expect_symbol(",")?;
        }
    }

    fn expr(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.comparison()?;
        loop {
            let op = if self.eat_keyword("and") {
                BinaryOp::And
            } else if self.eat_keyword("or") {
                BinaryOp::Or
            } else {
                return Ok(left);
            };
            let right = self.comparison()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn comparison(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.negation()?;
        loop {
            let op = match self.peek() {
                TokenKind::Symbol("==") => BinaryOp::Eq,
                TokenKind::Symbol("!=") => BinaryOp::Ne,
                TokenKind::Symbol("<") => BinaryOp::Lt,
                TokenKind::Symbol("<=") => BinaryOp::Le,
                TokenKind::Symbol(">") => BinaryOp::Gt,
                TokenKind::Symbol(">=") => BinaryOp::Ge,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.negation()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn negation(&mut self) -> Result<Expr, ParseError> {
        if self.eat_keyword("not") {
            let operand = self.negation()?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(operand)));
        }
        self.additive()
    }

    fn additive(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                TokenKind::Symbol("+") => BinaryOp::Add,
                TokenKind::Symbol("-") => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                TokenKind::Symbol("*") => BinaryOp::Mul,
                TokenKind::Symbol("/") => BinaryOp::Div,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        if self.eat_symbol("-") {
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.unary()?)));
        }
        if self.eat_symbol("+") {
            return Ok(Expr::Unary(UnaryOp::Plus, Box::new(self.unary()?)));
        }
        if self.at_keyword("not") {
            return self.negation();
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        match self.peek().clone() {
            TokenKind::Integer(raw) => {
                self.advance();
                Ok(Expr::Integer(raw))
            }
            TokenKind::Real(raw) => {
                self.advance();
                Ok(Expr::Real(raw))
            }
            TokenKind::FourCC(raw) => {
                self.advance();
                Ok(Expr::FourCC(raw))
            }
            TokenKind::Str(raw) => {
                self.advance();
                Ok(Expr::Str(raw))
            }
            TokenKind::Symbol("(") => {
                self.advance();
                let inner = self.expr()?;
                self.expect_symbol(")")?;
                Ok(Expr::Paren(Box::new(inner)))
            }
            TokenKind::Ident(word) => {
                self.advance();
                match word.as_str() {
                    "true" => Ok(Expr::Bool(true)),
                    "false" => Ok(Expr::Bool(false)),
                    "null" => Ok(Expr::Null),
                    "function" => Ok(Expr::FunctionRef(self.ident()?)),
                    _ => {
                        if self.at_symbol("(") {
                            Ok(Expr::Call(word, self.arguments()?))
                        } else if self.eat_symbol("[") {
                            let index = self.expr()?;
                            self.expect_symbol("]")?;
                            Ok(Expr::ArrayRef(word, Box::new(index)))
                        } else {
                            Ok(Expr::Var(word))
                        }
                    }
                }
            }
            _ => Err(self.error("expression")),
        }
    }
}

/// Parses a whole script. Later definitions of an already defined function are
/// dropped.
pub fn parse(src: &str) -> Result<Unit, ParseError> {
    let tokens = tokenize(src)?;
    let mut parser = Parser { tokens, pos: 0 };
    parser.unit()
}

/// Parses a single expression, e.g. a global initialiser pulled out of text.
pub fn parse_expr(src: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(src)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expr()?;
    if !matches!(parser.peek_at(0), TokenKind::Eof) {
        return Err(parser.error("end of expression"));
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_declarations_and_statements() {
        let src = "\
// header
type unit extends widget
globals
    constant integer MAX = 12 // trailing
    unit array udg_heroes
    trigger gg_trg_Init = null
endglobals
native GetHero takes integer id returns unit
function Helper takes integer a, real b returns nothing
    local integer i = 0
    loop
        exitwhen i > a
        set udg_heroes[i] = null
        set i = i + 1
    endloop
    if a == 1 then
        return
    elseif not (b < 2.0) then
        call Helper(a - 1, b)
    else
        debug call BJDebugMsg(\"x\")
    endif
endfunction
";
        let unit = parse(src).unwrap();
        assert_eq!(unit.declarations.len(), 5);
        assert_eq!(unit.globals().count(), 3);
        let global = unit.globals().nth(1).unwrap();
        assert!(global.is_array);
        assert_eq!(global.name, "udg_heroes");

        let helper = unit.function("Helper").unwrap();
        assert_eq!(helper.params.len(), 2);
        assert!(helper.has_locals());
        assert!(matches!(helper.body[1], Statement::Loop(ref body) if body.len() == 3));
        let Statement::If { branches, else_body } = &helper.body[2] else {
            panic!("expected if");
        };
        assert_eq!(branches.len(), 2);
        assert!(matches!(
            else_body.as_deref(),
            Some([Statement::Debug(_)])
        ));
    }

    #[test]
    fn respects_operator_precedence() {
        let expr = parse_expr("1 + 2 * -3 == 4 or x").unwrap();
        let Expr::Binary(BinaryOp::Or, left, _) = expr else {
            panic!("or should bind loosest");
        };
        let Expr::Binary(BinaryOp::Eq, sum, _) = *left else {
            panic!("comparison below or");
        };
        let Expr::Binary(BinaryOp::Add, _, product) = *sum else {
            panic!("addition above comparison");
        };
        assert!(matches!(
            *product,
            Expr::Binary(BinaryOp::Mul, _, ref rhs) if matches!(**rhs, Expr::Unary(UnaryOp::Neg, _))
        ));
    }

    #[test]
    fn duplicate_functions_collapse_to_first() {
        let src = "function f takes nothing returns integer\nreturn 1\nendfunction\n\
                   function f takes nothing returns integer\nreturn 2\nendfunction\n";
        let unit = parse(src).unwrap();
        assert_eq!(unit.functions().count(), 1);
        assert_eq!(
            unit.function("f").unwrap().body,
            vec![Statement::Return(Some(Expr::Integer("1".into())))]
        );
    }

    #[test]
    fn errors_carry_line_numbers() {
        let err = parse("function f takes nothing returns nothing\n    set = 3\nendfunction\n")
            .unwrap_err();
        assert!(matches!(err, ParseError::Expected { line: 2, .. }), "{err}");
    }
}
