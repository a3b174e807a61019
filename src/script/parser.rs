//! Script parser.
//!
//! Converts the lexer token stream into statements:
//! `yield`, `log`, `set` (plain or `from game:`), `if`/`elif`/`else` and
//! `repeat` blocks, with expressions for values and conditions.

use std::iter::Peekable;
use std::vec::IntoIter;

use super::lexer::{Lexeme, Token};
use super::ScriptError;

/* ------------------------------- AST ------------------------------- */

#[derive(Debug, PartialEq, Clone)]
pub enum Expr {
    Str(String),
    Number(String),
    Var(String),
    Binary(Box<Expr>, BinaryOperator, Box<Expr>),
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum BinaryOperator {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Ne,
    And,
    Or,
}

/// A read-only question for the game, as written after `set x from game:`.
#[derive(Debug, PartialEq, Clone)]
pub enum GameQuery {
    Status(String),
    Addon(String),
    Condition,
    Quality,
    HqChance,
    Item(String),
    Target,
}

impl GameQuery {
    pub fn parse(text: &str) -> Option<GameQuery> {
        let text = text.trim();
        let (head, rest) = match text.split_once(char::is_whitespace) {
            Some((h, r)) => (h, r.trim()),
            None => (text, ""),
        };
        let named = |f: fn(String) -> GameQuery| (!rest.is_empty()).then(|| f(rest.to_string()));
        match head.to_ascii_lowercase().as_str() {
            "status" => named(GameQuery::Status),
            "addon" => named(GameQuery::Addon),
            "item" => named(GameQuery::Item),
            "condition" if rest.is_empty() => Some(GameQuery::Condition),
            "quality" if rest.is_empty() => Some(GameQuery::Quality),
            "hq" if rest.is_empty() => Some(GameQuery::HqChance),
            "target" if rest.is_empty() => Some(GameQuery::Target),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub enum Stmt {
    Yield {
        line: usize,
        command: Expr,
    },
    Log(Expr),
    SetVar(String, Expr),
    SetVarFromGame(String, GameQuery),
    If {
        condition: Expr,
        body: Vec<Stmt>,
        elif_blocks: Vec<(Expr, Vec<Stmt>)>,
        else_body: Option<Vec<Stmt>>,
    },
    Repeat {
        line: usize,
        count: Expr,
        body: Vec<Stmt>,
    },
}

/* ------------------------------ PARSER ------------------------------ */

type Tokens = Peekable<IntoIter<Lexeme>>;

pub fn parse(tokens: Vec<Lexeme>) -> Result<Vec<Stmt>, ScriptError> {
    let mut it = tokens.into_iter().peekable();
    let mut program = Vec::new();

    loop {
        match peek(&mut it) {
            Token::Eof => break,
            Token::Newline => {
                it.next();
            }
            Token::Dedent | Token::Indent => {
                return Err(error(&mut it, "unexpected indentation"));
            }
            _ => program.push(parse_statement(&mut it)?),
        }
    }
    Ok(program)
}

/* ---------- statement ---------- */
fn parse_statement(it: &mut Tokens) -> Result<Stmt, ScriptError> {
    let line = line(it);
    let stmt = match peek(it) {
        Token::Yield => {
            it.next();
            Stmt::Yield {
                line,
                command: parse_expr(it)?,
            }
        }

        Token::Log => {
            it.next();
            Stmt::Log(parse_expr(it)?)
        }

        Token::Set => {
            it.next();
            let var = match it.next().map(|l| l.token) {
                Some(Token::Ident(v)) => v,
                _ => return Err(ScriptError::parse(line, "expected a variable name after 'set'")),
            };
            match peek(it) {
                Token::EqualsAssign => {
                    it.next();
                    Stmt::SetVar(var, parse_expr(it)?)
                }
                Token::From => {
                    it.next();
                    expect(it, Token::Game, "expected 'game' after 'from'")?;
                    expect(it, Token::Colon, "expected ':' after 'from game'")?;
                    let text = match it.next().map(|l| l.token) {
                        Some(Token::Str(s)) => s,
                        _ => return Err(ScriptError::parse(line, "expected a quoted game query")),
                    };
                    let query = GameQuery::parse(&text).ok_or_else(|| ScriptError::UnknownQuery {
                        line,
                        query: text.clone(),
                    })?;
                    Stmt::SetVarFromGame(var, query)
                }
                _ => return Err(ScriptError::parse(line, "expected '=' or 'from game:'")),
            }
        }

        Token::If => {
            it.next();
            let condition = parse_expr(it)?;
            let body = parse_block(it)?;

            let mut elif_blocks = Vec::new();
            while matches!(peek(it), Token::Elif) {
                it.next();
                let c = parse_expr(it)?;
                let b = parse_block(it)?;
                elif_blocks.push((c, b));
            }

            let else_body = if matches!(peek(it), Token::Else) {
                it.next();
                Some(parse_block(it)?)
            } else {
                None
            };

            // Blocks consume their own line endings.
            return Ok(Stmt::If {
                condition,
                body,
                elif_blocks,
                else_body,
            });
        }

        Token::Repeat => {
            it.next();
            let count = parse_expr(it)?;
            let body = parse_block(it)?;
            return Ok(Stmt::Repeat { line, count, body });
        }

        other => return Err(ScriptError::parse(line, format!("unexpected token {other:?}"))),
    };

    match peek(it) {
        Token::Newline => {
            it.next();
            Ok(stmt)
        }
        Token::Eof | Token::Dedent => Ok(stmt),
        _ => Err(error(it, "expected end of line")),
    }
}

/* ---------- block ---------- */
/// `: NEWLINE INDENT stmt* DEDENT`
fn parse_block(it: &mut Tokens) -> Result<Vec<Stmt>, ScriptError> {
    expect(it, Token::Colon, "expected ':'")?;
    expect(it, Token::Newline, "expected a new line after ':'")?;
    expect(it, Token::Indent, "expected an indented block")?;

    let mut block = Vec::new();
    loop {
        match peek(it) {
            Token::Dedent => {
                it.next();
                break;
            }
            Token::Eof => break,
            Token::Newline => {
                it.next();
            }
            _ => block.push(parse_statement(it)?),
        }
    }
    Ok(block)
}

/* ---------- expressions ---------- */
/*  EBNF
    Expr       = And { "or" And } ;
    And        = Comparison { "and" Comparison } ;
    Comparison = Sum [ ("=="|"!="|">"|"<"|">="|"<=") Sum ] ;
    Sum        = Term { ("+"|"-") Term } ;
    Term       = Factor { ("*"|"/"|"%") Factor } ;
    Factor     = Number | Ident | String | "-" Factor | "(" Expr ")" ;
*/
fn parse_expr(it: &mut Tokens) -> Result<Expr, ScriptError> {
    let mut lhs = parse_and(it)?;
    while matches!(peek(it), Token::Or) {
        it.next();
        let rhs = parse_and(it)?;
        lhs = Expr::Binary(Box::new(lhs), BinaryOperator::Or, Box::new(rhs));
    }
    Ok(lhs)
}

fn parse_and(it: &mut Tokens) -> Result<Expr, ScriptError> {
    let mut lhs = parse_comparison(it)?;
    while matches!(peek(it), Token::And) {
        it.next();
        let rhs = parse_comparison(it)?;
        lhs = Expr::Binary(Box::new(lhs), BinaryOperator::And, Box::new(rhs));
    }
    Ok(lhs)
}

fn parse_comparison(it: &mut Tokens) -> Result<Expr, ScriptError> {
    let lhs = parse_sum(it)?;
    let op = match peek(it) {
        Token::Equals => BinaryOperator::Eq,
        Token::NotEquals => BinaryOperator::Ne,
        Token::GreaterThan => BinaryOperator::Gt,
        Token::LessThan => BinaryOperator::Lt,
        Token::GreaterEqual => BinaryOperator::Ge,
        Token::LessEqual => BinaryOperator::Le,
        _ => return Ok(lhs),
    };
    it.next();
    let rhs = parse_sum(it)?;
    Ok(Expr::Binary(Box::new(lhs), op, Box::new(rhs)))
}

fn parse_sum(it: &mut Tokens) -> Result<Expr, ScriptError> {
    let mut lhs = parse_term(it)?;
    loop {
        let op = match peek(it) {
            Token::Plus => BinaryOperator::Add,
            Token::Minus => BinaryOperator::Sub,
            _ => break,
        };
        it.next();
        let rhs = parse_term(it)?;
        lhs = Expr::Binary(Box::new(lhs), op, Box::new(rhs));
    }
    Ok(lhs)
}

fn parse_term(it: &mut Tokens) -> Result<Expr, ScriptError> {
    let mut lhs = parse_factor(it)?;
    loop {
        let op = match peek(it) {
            Token::Star => BinaryOperator::Mul,
            Token::Slash => BinaryOperator::Div,
            Token::Percent => BinaryOperator::Mod,
            _ => break,
        };
        it.next();
        let rhs = parse_factor(it)?;
        lhs = Expr::Binary(Box::new(lhs), op, Box::new(rhs));
    }
    Ok(lhs)
}

fn parse_factor(it: &mut Tokens) -> Result<Expr, ScriptError> {
    let line = line(it);
    match it.next().map(|l| l.token) {
        Some(Token::Minus) => {
            let inner = parse_factor(it)?;
            Ok(Expr::Binary(
                Box::new(Expr::Number("0".into())),
                BinaryOperator::Sub,
                Box::new(inner),
            ))
        }
        Some(Token::Number(n)) => Ok(Expr::Number(n)),
        Some(Token::Str(s)) => Ok(Expr::Str(s)),
        Some(Token::Ident(v)) => Ok(Expr::Var(v)),
        Some(Token::LParen) => {
            let inner = parse_expr(it)?;
            expect(it, Token::RParen, "expected ')'")?;
            Ok(inner)
        }
        Some(other) => Err(ScriptError::parse(
            line,
            format!("expected a value, found {other:?}"),
        )),
        None => Err(ScriptError::parse(line, "unexpected end of script")),
    }
}

/* ---------- util ---------- */
fn peek(it: &mut Tokens) -> Token {
    it.peek().map(|l| l.token.clone()).unwrap_or(Token::Eof)
}

fn line(it: &mut Tokens) -> usize {
    it.peek().map(|l| l.line).unwrap_or(0)
}

fn error(it: &mut Tokens, message: &str) -> ScriptError {
    ScriptError::parse(line(it), message)
}

fn expect(it: &mut Tokens, tok: Token, message: &str) -> Result<(), ScriptError> {
    let line = line(it);
    match it.next() {
        Some(l) if l.token == tok => Ok(()),
        _ => Err(ScriptError::parse(line, message)),
    }
}
