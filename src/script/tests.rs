//! Unit tests for the embedded script language.

use super::lexer::{tokenize, Token};
use super::parser::{BinaryOperator, Expr};
use super::*;

#[derive(Debug, Default)]
struct Recorder {
    yielded: Vec<String>,
    logged: Vec<String>,
    fail_on: Option<String>,
}

impl ScriptHost for Recorder {
    type Error = ScriptError;

    fn yield_command(&mut self, command: &str) -> Result<(), ScriptError> {
        if self.fail_on.as_deref() == Some(command) {
            return Err(ScriptError::Runtime(format!("{command} failed")));
        }
        self.yielded.push(command.to_string());
        Ok(())
    }

    fn log(&mut self, message: &str) {
        self.logged.push(message.to_string());
    }

    fn query(&mut self, query: &GameQuery) -> String {
        match query {
            GameQuery::Status(name) if name.eq_ignore_ascii_case("well fed") => "true".into(),
            GameQuery::Status(_) => "false".into(),
            GameQuery::Quality => "1500".into(),
            GameQuery::Condition => "Good".into(),
            _ => "none".into(),
        }
    }
}

fn run(src: &str) -> Result<Recorder, ScriptError> {
    let program = compile(src)?;
    let mut host = Recorder::default();
    Interpreter::new().run(&program, &mut host)?;
    Ok(host)
}

#[test]
fn tokenizes_yield_with_comment_markers_inside_quotes() {
    let toks: Vec<Token> = tokenize(r#"yield "/ac Observe # not a comment" // real one"#)
        .unwrap()
        .into_iter()
        .map(|l| l.token)
        .collect();
    assert_eq!(
        toks,
        vec![
            Token::Yield,
            Token::Str("/ac Observe # not a comment".into()),
            Token::Newline,
            Token::Eof,
        ]
    );
}

#[test]
fn single_quotes_may_hold_double_quotes() {
    let host = run(r#"yield '/ac "Basic Synthesis"'"#).unwrap();
    assert_eq!(host.yielded, vec![r#"/ac "Basic Synthesis""#]);
}

#[test]
fn lexer_reports_line_of_missing_quote() {
    let err = tokenize("log \"ok\"\nlog \"broken").unwrap_err();
    assert!(matches!(err, ScriptError::Lex { line: 2, .. }));
}

#[test]
fn parses_arithmetic_with_precedence() {
    let program = compile("set r = 1 + 2 * 3").unwrap();
    match &program[0] {
        Stmt::SetVar(name, Expr::Binary(_, BinaryOperator::Add, rhs)) => {
            assert_eq!(name, "r");
            assert!(matches!(**rhs, Expr::Binary(_, BinaryOperator::Mul, _)));
        }
        other => panic!("unexpected statement {other:?}"),
    }
}

#[test]
fn yields_in_order_across_control_flow() {
    let src = r#"
set n = 2
repeat n:
    yield "/ac Observe"
if n >= 2 and n < 3:
    yield "/ac Groundwork"
elif n == 5:
    yield "/ac Nope"
else:
    yield "/ac Nope"
log "done " + n
"#;
    let host = run(src).unwrap();
    assert_eq!(
        host.yielded,
        vec!["/ac Observe", "/ac Observe", "/ac Groundwork"]
    );
    assert_eq!(host.logged, vec!["done 2"]);
}

#[test]
fn game_queries_feed_variables() {
    let src = r#"
set fed from game: "status Well Fed"
set q from game: "quality"
if fed == "true" and q > 1000:
    yield "/ac " + "Byregot's Blessing"
"#;
    let host = run(src).unwrap();
    assert_eq!(host.yielded, vec!["/ac Byregot's Blessing"]);
}

#[test]
fn game_queries_parse_by_name() {
    assert_eq!(GameQuery::parse("HQ"), Some(GameQuery::HqChance));
    assert_eq!(
        GameQuery::parse("status Well Fed"),
        Some(GameQuery::Status("Well Fed".into()))
    );
    assert_eq!(GameQuery::parse("hq 100"), None);
}

#[test]
fn unknown_game_query_is_a_parse_time_error() {
    let err = compile(r#"set x from game: "weather""#).unwrap_err();
    assert!(matches!(err, ScriptError::UnknownQuery { line: 1, .. }));
}

#[test]
fn undefined_variable_is_an_error() {
    let err = run("log missing").unwrap_err();
    assert_eq!(err, ScriptError::UndefinedVariable("missing".into()));
}

#[test]
fn bad_repeat_count_is_an_error() {
    let err = run("repeat 2.5:\n    log \"x\"").unwrap_err();
    assert!(matches!(err, ScriptError::BadRepeatCount { line: 1, .. }));
    let err = run("repeat \"many\":\n    log \"x\"").unwrap_err();
    assert!(matches!(err, ScriptError::BadRepeatCount { .. }));
}

#[test]
fn failed_yield_aborts_the_script() {
    let program = compile("yield \"a\"\nyield \"b\"\nyield \"c\"").unwrap();
    let mut host = Recorder {
        fail_on: Some("b".into()),
        ..Recorder::default()
    };
    let res = Interpreter::new().run(&program, &mut host);
    assert!(res.is_err());
    assert_eq!(host.yielded, vec!["a"]);
}

#[test]
fn parse_errors_carry_line_numbers() {
    let err = compile("log \"a\"\nif x\n    log \"b\"").unwrap_err();
    assert!(matches!(err, ScriptError::Parse { line: 2, .. }));

    let err = compile("log \"a\"\n        log \"b\"\n    log \"c\"").unwrap_err();
    assert!(matches!(err, ScriptError::Lex { line: 3, .. }));
}

#[test]
fn division_by_zero_is_reported() {
    let err = run("set x = 1 / 0").unwrap_err();
    assert!(matches!(err, ScriptError::Runtime(_)));
}
