// Logic-less template processor: {{var}} interpolation, {{#section}} blocks,
// inverted sections, comments, and section lambdas that receive the raw inner
// text. Missing-variable strictness is carried per render context, and tags
// standing alone on a line are trimmed with that line, mustache-style.

use std::collections::HashMap;

// A context value: scalar text, a boolean gate, or a query result row list.
#[derive(Clone, Debug)]
pub enum Value {
    Text(String),
    Bool(bool),
    Rows(Vec<HashMap<String, String>>),
}

impl Value {
    // Section truthiness: empty text, false, and empty row lists are falsy.
    fn truthy(&self) -> bool {
        match self {
            Value::Text(s) => !s.is_empty(),
            Value::Bool(b) => *b,
            Value::Rows(r) => !r.is_empty(),
        }
    }
}

// Render context: named values plus a stack of row frames pushed while a
// section iterates. Lookup checks frames top-down before the named values.
pub struct Context {
    vars: HashMap<String, Value>,
    stack: Vec<HashMap<String, String>>,
    pub strict: bool,
}

impl Context {
    pub fn new(strict: bool) -> Self {
        Self {
            vars: HashMap::new(),
            stack: Vec::new(),
            strict,
        }
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.vars.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        for frame in self.stack.iter().rev() {
            if let Some(v) = frame.get(name) {
                return Some(Value::Text(v.clone()));
            }
        }
        self.vars.get(name).cloned()
    }

    fn push_frame(&mut self, frame: HashMap<String, String>) {
        self.stack.push(frame);
    }

    fn pop_frame(&mut self) {
        self.stack.pop();
    }
}

// Section lambdas. `expand` returns Some(replacement) when `name` is handled
// as a callable; the implementation may re-render the raw text via render_str
// and may mutate the context it is given.
pub trait Lambdas {
    fn expand(
        &mut self,
        name: &str,
        raw: &str,
        ctx: &mut Context,
    ) -> Result<Option<String>, Box<dyn std::error::Error + Send + Sync>>;
}

// No-op lambda set for plain data-driven renders.
pub struct NoLambdas;

impl Lambdas for NoLambdas {
    fn expand(
        &mut self,
        _name: &str,
        _raw: &str,
        _ctx: &mut Context,
    ) -> Result<Option<String>, Box<dyn std::error::Error + Send + Sync>> {
        Ok(None)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TokKind {
    Text,
    Var { raw: bool },
    Open { inverted: bool },
    Close,
    Comment,
}

// One lexed token. `src` is the literal source slice, kept so that section
// bodies can be handed to lambdas verbatim.
#[derive(Debug, Clone)]
struct Tok {
    kind: TokKind,
    name: String,
    src: String,
}

#[derive(Debug)]
enum Node {
    Text(String),
    Var {
        name: String,
        raw: bool,
    },
    Section {
        name: String,
        inverted: bool,
        children: Vec<Node>,
        raw_text: String,
    },
}

pub struct Template {
    nodes: Vec<Node>,
}

// Parse a template into its node tree.
pub fn parse(src: &str) -> Result<Template, Box<dyn std::error::Error + Send + Sync>> {
    let mut toks = lex(src)?;
    trim_standalone(&mut toks);
    let mut i = 0usize;
    let nodes = parse_nodes(&toks, &mut i, None)?;
    Ok(Template { nodes })
}

// Parse and render in one step; used by lambdas for their render callback.
pub fn render_str(
    src: &str,
    ctx: &mut Context,
    lambdas: &mut dyn Lambdas,
) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    parse(src)?.render(ctx, lambdas)
}

impl Template {
    pub fn render(
        &self,
        ctx: &mut Context,
        lambdas: &mut dyn Lambdas,
    ) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
        let mut out = String::new();
        render_nodes(&self.nodes, ctx, lambdas, &mut out)?;
        Ok(out)
    }
}

// Split the source into text and tag tokens.
fn lex(src: &str) -> Result<Vec<Tok>, Box<dyn std::error::Error + Send + Sync>> {
    let mut toks = Vec::new();
    let mut rest = src;
    while let Some(pos) = rest.find("{{") {
        if pos > 0 {
            toks.push(text_tok(&rest[..pos]));
        }
        let after = &rest[pos + 2..];
        if let Some(inner) = after.strip_prefix('{') {
            // {{{name}}} raw interpolation
            let end = inner
                .find("}}}")
                .ok_or_else(|| format!("unclosed tag near {}", snippet(&rest[pos..])))?;
            let name = inner[..end].trim().to_string();
            if name.is_empty() {
                return Err("empty tag".into());
            }
            toks.push(Tok {
                kind: TokKind::Var { raw: true },
                name,
                src: rest[pos..pos + 2 + 1 + end + 3].to_string(),
            });
            rest = &inner[end + 3..];
            continue;
        }
        let end = after
            .find("}}")
            .ok_or_else(|| format!("unclosed tag near {}", snippet(&rest[pos..])))?;
        let inner = after[..end].trim();
        let src_tag = rest[pos..pos + 2 + end + 2].to_string();
        rest = &after[end + 2..];
        let (kind, name) = match inner.chars().next() {
            Some('#') => (TokKind::Open { inverted: false }, inner[1..].trim()),
            Some('^') => (TokKind::Open { inverted: true }, inner[1..].trim()),
            Some('/') => (TokKind::Close, inner[1..].trim()),
            Some('!') => (TokKind::Comment, ""),
            Some('&') => (TokKind::Var { raw: true }, inner[1..].trim()),
            Some('>') => return Err("partial tags are not supported".into()),
            Some('=') => return Err("set-delimiter tags are not supported".into()),
            Some(_) => (TokKind::Var { raw: false }, inner),
            None => return Err("empty tag".into()),
        };
        if name.is_empty() && kind != TokKind::Comment {
            return Err("empty tag".into());
        }
        toks.push(Tok {
            kind,
            name: name.to_string(),
            src: src_tag,
        });
    }
    if !rest.is_empty() {
        toks.push(text_tok(rest));
    }
    Ok(toks)
}

fn text_tok(s: &str) -> Tok {
    Tok {
        kind: TokKind::Text,
        name: String::new(),
        src: s.to_string(),
    }
}

fn snippet(s: &str) -> String {
    s.chars().take(20).collect()
}

// Remove lines that contain nothing but a single section or comment tag:
// the tag's line indentation and trailing newline disappear with it.
// Interpolations are left alone. Flags are computed against the original
// text so that back-to-back standalone lines trim independently.
fn trim_standalone(toks: &mut [Tok]) {
    let n = toks.len();
    let mut standalone = vec![false; n];
    for i in 0..n {
        let eligible = matches!(
            toks[i].kind,
            TokKind::Open { .. } | TokKind::Close | TokKind::Comment
        );
        if !eligible {
            continue;
        }
        let prev_ok = if i == 0 {
            true
        } else {
            match &toks[i - 1].kind {
                TokKind::Text => {
                    let t = &toks[i - 1].src;
                    match t.rfind('\n') {
                        Some(p) => t[p + 1..].chars().all(|c| c == ' ' || c == '\t'),
                        None => i == 1 && t.chars().all(|c| c == ' ' || c == '\t'),
                    }
                }
                _ => false,
            }
        };
        let next_ok = if i + 1 == n {
            true
        } else {
            match &toks[i + 1].kind {
                TokKind::Text => {
                    let t = &toks[i + 1].src;
                    let trimmed = t.trim_start_matches([' ', '\t']);
                    trimmed.starts_with('\n')
                        || trimmed.starts_with("\r\n")
                        || (trimmed.is_empty() && i + 2 == n)
                }
                _ => false,
            }
        };
        standalone[i] = prev_ok && next_ok;
    }
    for i in 0..n {
        if !standalone[i] {
            continue;
        }
        if i > 0 {
            let t = &mut toks[i - 1].src;
            let keep = t.trim_end_matches([' ', '\t']).len();
            t.truncate(keep);
        }
        if i + 1 < n {
            let t = &mut toks[i + 1].src;
            let mut cut = t.len() - t.trim_start_matches([' ', '\t']).len();
            if t[cut..].starts_with("\r\n") {
                cut += 2;
            } else if t[cut..].starts_with('\n') {
                cut += 1;
            }
            *t = t[cut..].to_string();
        }
    }
}

// Build the node tree; `section` is the name the recursion expects to close.
fn parse_nodes(
    toks: &[Tok],
    i: &mut usize,
    section: Option<&str>,
) -> Result<Vec<Node>, Box<dyn std::error::Error + Send + Sync>> {
    let mut nodes = Vec::new();
    while *i < toks.len() {
        let tok = &toks[*i];
        match &tok.kind {
            TokKind::Text => {
                if !tok.src.is_empty() {
                    nodes.push(Node::Text(tok.src.clone()));
                }
                *i += 1;
            }
            TokKind::Var { raw } => {
                nodes.push(Node::Var {
                    name: tok.name.clone(),
                    raw: *raw,
                });
                *i += 1;
            }
            TokKind::Comment => {
                *i += 1;
            }
            TokKind::Open { inverted } => {
                let name = tok.name.clone();
                let inverted = *inverted;
                *i += 1;
                let start = *i;
                let children = parse_nodes(toks, i, Some(&name))?;
                // *i is now one past the close tag
                let raw_text: String = toks[start..*i - 1]
                    .iter()
                    .map(|t| t.src.as_str())
                    .collect();
                nodes.push(Node::Section {
                    name,
                    inverted,
                    children,
                    raw_text,
                });
            }
            TokKind::Close => {
                if section == Some(tok.name.as_str()) {
                    *i += 1;
                    return Ok(nodes);
                }
                return Err(format!("unexpected close of section {}", tok.name).into());
            }
        }
    }
    if let Some(name) = section {
        return Err(format!("section {} is not closed", name).into());
    }
    Ok(nodes)
}

fn render_nodes(
    nodes: &[Node],
    ctx: &mut Context,
    lambdas: &mut dyn Lambdas,
    out: &mut String,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    for node in nodes {
        match node {
            Node::Text(t) => out.push_str(t),
            Node::Var { name, raw } => {
                let value = match ctx.get(name) {
                    Some(v) => v,
                    None => {
                        if ctx.strict {
                            return Err(format!("missing variable {}", name).into());
                        }
                        continue;
                    }
                };
                let s = match value {
                    Value::Text(s) => s,
                    Value::Bool(b) => b.to_string(),
                    Value::Rows(_) => {
                        return Err(
                            format!("cannot interpolate row set {}", name).into()
                        )
                    }
                };
                if *raw {
                    out.push_str(&s);
                } else {
                    out.push_str(&escape_html(&s));
                }
            }
            Node::Section {
                name,
                inverted,
                children,
                raw_text,
            } => {
                if !inverted {
                    if let Some(replacement) = lambdas.expand(name, raw_text, ctx)? {
                        out.push_str(&replacement);
                        continue;
                    }
                }
                let value = match ctx.get(name) {
                    Some(v) => v,
                    None => {
                        if ctx.strict {
                            return Err(format!("missing variable {}", name).into());
                        }
                        if *inverted {
                            render_nodes(children, ctx, lambdas, out)?;
                        }
                        continue;
                    }
                };
                if *inverted {
                    if !value.truthy() {
                        render_nodes(children, ctx, lambdas, out)?;
                    }
                    continue;
                }
                match value {
                    Value::Rows(rows) => {
                        for row in rows {
                            ctx.push_frame(row);
                            let res = render_nodes(children, ctx, lambdas, out);
                            ctx.pop_frame();
                            res?;
                        }
                    }
                    v if v.truthy() => {
                        render_nodes(children, ctx, lambdas, out)?;
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(())
}

// Escape for {{var}} interpolation; {{{var}}} and {{&var}} bypass this.
fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_ctx(pairs: &[(&str, &str)]) -> Context {
        let mut ctx = Context::new(true);
        for (k, v) in pairs {
            ctx.set(k, Value::Text(v.to_string()));
        }
        ctx
    }

    fn rows(fields: &[&[(&str, &str)]]) -> Value {
        Value::Rows(
            fields
                .iter()
                .map(|row| {
                    row.iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect()
                })
                .collect(),
        )
    }

    #[test]
    fn interpolation_and_escaping() {
        let mut ctx = text_ctx(&[("name", "a<b")]);
        let out = render_str("x {{name}} {{{name}}} {{&name}}", &mut ctx, &mut NoLambdas)
            .unwrap();
        assert_eq!(out, "x a&lt;b a<b a<b");
    }

    #[test]
    fn strict_mode_fails_on_unbound_variable() {
        let mut ctx = Context::new(true);
        let err = render_str("{{nope}}", &mut ctx, &mut NoLambdas)
            .unwrap_err()
            .to_string();
        assert!(err.contains("missing variable nope"));

        let mut lax = Context::new(false);
        assert_eq!(render_str("a{{nope}}b", &mut lax, &mut NoLambdas).unwrap(), "ab");
    }

    #[test]
    fn section_iterates_rows() {
        let mut ctx = Context::new(true);
        ctx.set("r", rows(&[&[("v", "1")], &[("v", "2")], &[("v", "3")]]));
        let out = render_str("{{#r}}[{{v}}]{{/r}}", &mut ctx, &mut NoLambdas).unwrap();
        assert_eq!(out, "[1][2][3]");
    }

    #[test]
    fn bool_and_inverted_sections() {
        let mut ctx = Context::new(true);
        ctx.set("yes", Value::Bool(true));
        ctx.set("no", Value::Bool(false));
        ctx.set("empty", rows(&[]));
        let out = render_str(
            "{{#yes}}a{{/yes}}{{#no}}b{{/no}}{{^no}}c{{/no}}{{^empty}}d{{/empty}}",
            &mut ctx,
            &mut NoLambdas,
        )
        .unwrap();
        assert_eq!(out, "acd");
    }

    #[test]
    fn standalone_section_lines_are_trimmed() {
        let mut ctx = Context::new(true);
        ctx.set("s", Value::Bool(true));
        let out = render_str("x\n  {{#s}}\n  a\n  {{/s}}\ny\n", &mut ctx, &mut NoLambdas)
            .unwrap();
        assert_eq!(out, "x\n  a\ny\n");
    }

    #[test]
    fn inline_section_tags_keep_their_whitespace() {
        let mut ctx = Context::new(true);
        ctx.set("r", rows(&[&[("v", "1")], &[("v", "2")]]));
        let out =
            render_str("x{{#r}}\n\t{{v}}{{/r}}", &mut ctx, &mut NoLambdas).unwrap();
        assert_eq!(out, "x\n\t1\n\t2");
    }

    #[test]
    fn comments_disappear() {
        let mut ctx = Context::new(true);
        let out = render_str("a{{! ignored }}b\n  {{! gone }}\nc", &mut ctx, &mut NoLambdas)
            .unwrap();
        assert_eq!(out, "ab\nc");
    }

    struct Recorder {
        raw_seen: Option<String>,
    }

    impl Lambdas for Recorder {
        fn expand(
            &mut self,
            name: &str,
            raw: &str,
            ctx: &mut Context,
        ) -> Result<Option<String>, Box<dyn std::error::Error + Send + Sync>> {
            match name {
                "wrap" => {
                    self.raw_seen = Some(raw.to_string());
                    let inner = render_str(raw, ctx, self)?;
                    Ok(Some(format!("[{}]", inner)))
                }
                "bind" => {
                    ctx.set("late", Value::Text("bound".to_string()));
                    Ok(Some(String::new()))
                }
                _ => Ok(None),
            }
        }
    }

    #[test]
    fn lambda_receives_raw_text_and_render_callback() {
        let mut ctx = text_ctx(&[("v", "7")]);
        let mut rec = Recorder { raw_seen: None };
        let out = render_str("{{#wrap}}v={{v}}{{/wrap}}", &mut ctx, &mut rec).unwrap();
        assert_eq!(out, "[v=7]");
        assert_eq!(rec.raw_seen.as_deref(), Some("v={{v}}"));
    }

    #[test]
    fn lambda_side_effects_visible_to_later_tags() {
        let mut ctx = Context::new(true);
        let mut rec = Recorder { raw_seen: None };
        let out = render_str("{{#bind}}{{/bind}}{{late}}", &mut ctx, &mut rec).unwrap();
        assert_eq!(out, "bound");
    }

    #[test]
    fn standalone_trimming_shapes_lambda_raw_text() {
        // A close tag on its own line leaves the body ending in a newline.
        let mut ctx = Context::new(true);
        let mut rec = Recorder { raw_seen: None };
        render_str("  {{#wrap}}\n  body\n  {{/wrap}}\n", &mut ctx, &mut rec).unwrap();
        assert_eq!(rec.raw_seen.as_deref(), Some("  body\n"));
    }

    #[test]
    fn parse_errors() {
        assert!(parse("{{#a}}x").is_err());
        assert!(parse("x{{/a}}").is_err());
        assert!(parse("{{open").is_err());
        assert!(parse("{{>p}}").is_err());
    }

    #[test]
    fn row_set_interpolation_is_an_error() {
        let mut ctx = Context::new(true);
        ctx.set("r", rows(&[&[("v", "1")]]));
        assert!(render_str("{{r}}", &mut ctx, &mut NoLambdas).is_err());
    }
}
