use crate::config::{ConfigError, CraftLoopConfig};
use crate::error::ParseError;
use crate::library::MacroKind;
use crate::parser::{self, MacroScript};
use crate::script::{self, ScriptError, Stmt};

/* ───────────────────── Preprocessing ───────────────────── */

pub fn preprocess(input: &str) -> String {
    // 1) Remove BOM if present
    let s = input.strip_prefix('\u{feff}').unwrap_or(input);
    // 2) Normalize line endings CRLF/CR -> LF
    let s = s.replace("\r\n", "\n").replace('\r', "\n");
    // 3) Tabs -> 4 spaces
    s.replace('\t', "    ")
}

/* ───────────────────── Inline blocks ───────────────────── */

/// Expand one-line control statements in script source into blocks.
/// `if x > 1: yield "/ac Observe"` becomes a header line plus an indented body;
/// same for `elif`, `else` and `repeat`.
pub(crate) fn expand_inline_blocks(input: &str) -> String {
    let mut out = String::with_capacity(input.len());

    for line in input.lines() {
        let trimmed = line.trim_start();
        let indent = &line[..line.len() - trimmed.len()];

        let lower = trimmed.to_ascii_lowercase();
        let is_ctrl = ["if ", "elif ", "else", "repeat "]
            .iter()
            .any(|kw| lower.starts_with(kw));

        match header_colon(trimmed) {
            Some(colon) if is_ctrl => {
                let (head, tail) = trimmed.split_at(colon + 1);
                let tail = tail.trim();
                if tail.is_empty() || tail.starts_with('#') || tail.starts_with("//") {
                    out.push_str(line);
                } else {
                    out.push_str(&format!("{indent}{head}\n{indent}    {tail}"));
                }
            }
            _ => out.push_str(line),
        }
        out.push('\n');
    }

    out
}

/// Position of the first `:` outside quotes.
fn header_colon(line: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, ch) in line.char_indices() {
        match (ch, quote) {
            ('"' | '\'', None) => quote = Some(ch),
            (c, Some(q)) if c == q => quote = None,
            (':', None) => return Some(i),
            _ => {}
        }
    }
    None
}

/* ───────────────────── Craft loop ───────────────────── */

/// Wrap macro text into a crafting loop of `count` crafts (`None` runs until stopped).
///
/// With a template, `{{macro}}` and `{{count}}` are substituted; for an
/// unbounded loop the lines mentioning `{{count}}` are dropped.
pub fn craft_loop(
    source: &str,
    count: Option<u32>,
    cfg: &CraftLoopConfig,
) -> Result<String, ConfigError> {
    let body = preprocess(source);
    let body = body.trim_end_matches('\n');

    if cfg.use_template {
        if !cfg.template.contains("{{macro}}") {
            return Err(ConfigError::Template);
        }
        let template = preprocess(&cfg.template);
        let lines: Vec<String> = template
            .lines()
            .filter_map(|line| match count {
                Some(n) => Some(line.replace("{{count}}", &n.to_string())),
                None if line.contains("{{count}}") => None,
                None => Some(line.to_string()),
            })
            .map(|line| line.replace("{{macro}}", body))
            .collect();
        return Ok(lines.join("\n"));
    }

    let echo = if cfg.echo { " <echo>" } else { "" };
    let wait = cfg.max_wait_secs;
    let start_synthesis = format!(
        "/waitaddon \"RecipeNote\" <maxwait.{wait}>\n/click synthesize\n/waitaddon \"Synthesis\" <maxwait.{wait}>"
    );

    let mut lines: Vec<String> = Vec::new();
    if cfg.from_recipe_note {
        if let Some(n) = count {
            lines.push(format!("/craft {n}{echo}"));
        }
        lines.push(start_synthesis);
        lines.push(body.to_string());
    } else {
        // The first craft is already under way when the loop starts.
        lines.push(body.to_string());
        if let Some(n) = count {
            lines.push(format!("/craft {}{echo}", n.saturating_sub(1)));
        }
        lines.push(start_synthesis);
    }
    lines.push("/loop".to_string());
    Ok(lines.join("\n"))
}

/* ───────────────────── Entry points ───────────────────── */

/// Normalize and parse macro text.
pub fn parse_macro(source: &str) -> Result<MacroScript, ParseError> {
    parser::parse(&preprocess(source))
}

/// Normalize and compile embedded-script source.
pub fn compile_script(source: &str) -> Result<Vec<Stmt>, ScriptError> {
    script::compile(&expand_inline_blocks(&preprocess(source)))
}

/// Static validation. Returns a listing of what would run.
pub fn analyze(source: &str, kind: MacroKind) -> Result<String, String> {
    match kind {
        MacroKind::Native => {
            let script = parse_macro(source).map_err(|e| e.to_string())?;
            let mut out = format!("OK: {} step(s)", script.len());
            for step in script.steps() {
                out.push_str(&format!("\n{:>4}: {step}", step.line));
            }
            Ok(out)
        }
        MacroKind::Script => {
            let program = compile_script(source).map_err(|e| e.to_string())?;
            Ok(format!("OK: script with {} statement(s)", program.len()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preprocess_normalizes_bom_line_endings_and_tabs() {
        let src = "\u{feff}/ac Observe\r\n/wait 1\r\tlog";
        assert_eq!(preprocess(src), "/ac Observe\n/wait 1\n    log");
    }

    #[test]
    fn inline_if_is_expanded_into_a_block() {
        let src = "if q > 1: yield \"/ac Observe\"\nelse: log \"no: really\"\n";
        assert_eq!(
            expand_inline_blocks(src),
            "if q > 1:\n    yield \"/ac Observe\"\nelse:\n    log \"no: really\"\n"
        );
    }

    #[test]
    fn block_headers_and_plain_lines_are_untouched() {
        let src = "repeat 3:\n    yield \"/ac Observe: now\"\nlog \"a:b\"\n";
        assert_eq!(expand_inline_blocks(src), src);
    }

    #[test]
    fn analyze_lists_steps() {
        let out = analyze("/ac Observe <wait.2>\n\n/loop 3", MacroKind::Native).unwrap();
        assert!(out.starts_with("OK: 2 step(s)"));
        assert!(out.contains("   1: /action Observe <wait.2>"));
        assert!(out.contains("   3: /loop 3"));
    }

    #[test]
    fn craft_loop_from_the_recipe_note_gates_first() {
        let cfg = CraftLoopConfig {
            echo: true,
            max_wait_secs: 7,
            ..CraftLoopConfig::default()
        };
        let out = craft_loop("/ac Observe\r\n/ac Groundwork\n", Some(3), &cfg).unwrap();
        assert_eq!(
            out,
            "/craft 3 <echo>\n\
             /waitaddon \"RecipeNote\" <maxwait.7>\n\
             /click synthesize\n\
             /waitaddon \"Synthesis\" <maxwait.7>\n\
             /ac Observe\n/ac Groundwork\n\
             /loop"
        );
        assert_eq!(parse_macro(&out).unwrap().len(), 7);
    }

    #[test]
    fn craft_loop_mid_synthesis_runs_the_macro_first() {
        let cfg = CraftLoopConfig {
            from_recipe_note: false,
            ..CraftLoopConfig::default()
        };
        let out = craft_loop("/ac Observe", Some(1), &cfg).unwrap();
        let first: Vec<&str> = out.lines().take(2).collect();
        assert_eq!(first, vec!["/ac Observe", "/craft 0"]);
        assert!(out.ends_with("/loop"));

        let unbounded = craft_loop("/ac Observe", None, &cfg).unwrap();
        assert!(!unbounded.contains("/craft"));
    }

    #[test]
    fn craft_loop_templates_substitute_placeholders() {
        let cfg = CraftLoopConfig {
            use_template: true,
            template: "/echo start {{count}}\n{{macro}}\n/craft {{count}}\n/loop".into(),
            ..CraftLoopConfig::default()
        };
        let out = craft_loop("/ac Observe", Some(2), &cfg).unwrap();
        assert_eq!(out, "/echo start 2\n/ac Observe\n/craft 2\n/loop");

        // Unbounded loops drop every line that needs a count.
        let out = craft_loop("/ac Observe", None, &cfg).unwrap();
        assert_eq!(out, "/ac Observe\n/loop");
    }

    #[test]
    fn craft_loop_template_needs_the_macro_placeholder() {
        let cfg = CraftLoopConfig {
            use_template: true,
            template: "/craft {{count}}\n/loop".into(),
            ..CraftLoopConfig::default()
        };
        let err = craft_loop("/ac Observe", Some(2), &cfg).unwrap_err();
        assert!(matches!(err, ConfigError::Template));
        assert!(err.to_string().contains("{{macro}}"));
    }

    #[test]
    fn analyze_reports_errors() {
        let err = analyze("/ac Observe <bogus>", MacroKind::Native).unwrap_err();
        assert!(err.contains("unknown modifier"));
        let err = analyze("repeat:\n", MacroKind::Script).unwrap_err();
        assert!(err.contains("line 1"));
    }
}
