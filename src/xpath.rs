// XPath-subset compiler and evaluator over the tree module's node model.
// Supported: absolute and relative location paths, child steps, '//'
// descendant steps, '.' self, '*' wildcards, terminal '@attr' steps, and
// simple predicates: [n], [@attr='v'], [child='v'].

use crate::tree::Node;

#[derive(Debug, Clone, PartialEq)]
enum Test {
    SelfNode,
    Name(String),
    Any,
    Attr(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Pred {
    Index(usize),
    AttrEq(String, String),
    ChildEq(String, String),
}

#[derive(Debug, Clone)]
struct Step {
    descendant: bool,
    test: Test,
    pred: Option<Pred>,
}

#[derive(Debug, Clone)]
pub struct Expr {
    steps: Vec<Step>,
}

// An evaluation result: an element node or one of its attributes.
#[derive(Debug, Clone, Copy)]
pub enum Matched<'a> {
    Node(&'a Node),
    Attr {
        owner: &'a Node,
        name: &'a str,
        value: &'a str,
    },
}

// Compile a path expression into steps.
pub fn compile(expr: &str) -> Result<Expr, Box<dyn std::error::Error + Send + Sync>> {
    if expr.is_empty() {
        return Err("empty xpath expression".into());
    }
    let mut steps = Vec::new();
    let mut descendant = false;
    for (idx, seg) in expr.split('/').enumerate() {
        if seg.is_empty() {
            if idx == 0 {
                // leading '/': absolute paths start from the node the
                // expression is applied to, see DESIGN.md
                continue;
            }
            if descendant {
                return Err(format!("invalid xpath {}", expr).into());
            }
            descendant = true;
            continue;
        }
        steps.push(parse_step(seg, descendant, expr)?);
        descendant = false;
    }
    if descendant {
        return Err(format!("invalid xpath {}: trailing '/'", expr).into());
    }
    for (i, step) in steps.iter().enumerate() {
        if matches!(step.test, Test::Attr(_)) && i + 1 != steps.len() {
            return Err(format!("invalid xpath {}: '@' mid-path", expr).into());
        }
    }
    Ok(Expr { steps })
}

fn parse_step(
    seg: &str,
    descendant: bool,
    expr: &str,
) -> Result<Step, Box<dyn std::error::Error + Send + Sync>> {
    let (name_part, pred) = match seg.find('[') {
        Some(open) => {
            if !seg.ends_with(']') {
                return Err(format!("invalid predicate in {}", expr).into());
            }
            (&seg[..open], Some(parse_pred(&seg[open + 1..seg.len() - 1], expr)?))
        }
        None => (seg, None),
    };
    let test = match name_part {
        "." => Test::SelfNode,
        "*" => Test::Any,
        _ if name_part.starts_with('@') => Test::Attr(name_part[1..].to_string()),
        _ => Test::Name(name_part.to_string()),
    };
    Ok(Step {
        descendant,
        test,
        pred,
    })
}

fn parse_pred(
    body: &str,
    expr: &str,
) -> Result<Pred, Box<dyn std::error::Error + Send + Sync>> {
    let body = body.trim();
    if let Ok(n) = body.parse::<usize>() {
        if n == 0 {
            return Err(format!("invalid predicate [0] in {}", expr).into());
        }
        return Ok(Pred::Index(n));
    }
    let eq = body
        .find('=')
        .ok_or_else(|| format!("unsupported predicate [{}] in {}", body, expr))?;
    let left = body[..eq].trim();
    let right = body[eq + 1..].trim();
    let value = right
        .strip_prefix('\'')
        .and_then(|r| r.strip_suffix('\''))
        .or_else(|| right.strip_prefix('"').and_then(|r| r.strip_suffix('"')))
        .ok_or_else(|| format!("unsupported predicate [{}] in {}", body, expr))?;
    if let Some(attr) = left.strip_prefix('@') {
        return Ok(Pred::AttrEq(attr.to_string(), value.to_string()));
    }
    Ok(Pred::ChildEq(left.to_string(), value.to_string()))
}

impl Expr {
    // Evaluate against a context node; document order is preserved.
    pub fn select<'a>(&self, node: &'a Node) -> Vec<Matched<'a>> {
        let mut current: Vec<&'a Node> = vec![node];
        let mut attrs: Vec<Matched<'a>> = Vec::new();
        for step in &self.steps {
            let mut next: Vec<&'a Node> = Vec::new();
            for &ctx in &current {
                let pool: Vec<&'a Node> = if step.descendant {
                    descendant_or_self(ctx)
                } else {
                    vec![ctx]
                };
                match &step.test {
                    Test::SelfNode => next.extend(pool),
                    Test::Attr(name) => {
                        for n in pool {
                            for (aname, avalue) in &n.attrs {
                                if aname == name {
                                    attrs.push(Matched::Attr {
                                        owner: n,
                                        name: aname,
                                        value: avalue,
                                    });
                                }
                            }
                        }
                    }
                    Test::Name(_) | Test::Any => {
                        for n in pool {
                            let mut picked: Vec<&'a Node> = n
                                .elements()
                                .filter(|c| match &step.test {
                                    Test::Name(want) => &c.name == want,
                                    _ => true,
                                })
                                .collect();
                            apply_pred(&step.pred, &mut picked);
                            next.extend(picked);
                        }
                    }
                }
            }
            if matches!(step.test, Test::Attr(_)) {
                return attrs;
            }
            current = next;
        }
        current.into_iter().map(Matched::Node).collect()
    }
}

// Positional predicates apply per parent context, value predicates filter.
fn apply_pred<'a>(pred: &Option<Pred>, picked: &mut Vec<&'a Node>) {
    match pred {
        None => {}
        Some(Pred::Index(n)) => {
            if *n <= picked.len() {
                let keep = picked[*n - 1];
                picked.clear();
                picked.push(keep);
            } else {
                picked.clear();
            }
        }
        Some(Pred::AttrEq(name, value)) => {
            picked.retain(|c| {
                c.attrs
                    .iter()
                    .any(|(an, av)| an == name && av == value)
            });
        }
        Some(Pred::ChildEq(name, value)) => {
            picked.retain(|c| {
                c.elements()
                    .any(|child| &child.name == name && child.text() == *value)
            });
        }
    }
}

fn descendant_or_self<'a>(node: &'a Node) -> Vec<&'a Node> {
    let mut out = vec![node];
    let mut i = 0usize;
    while i < out.len() {
        let n = out[i];
        out.extend(n.elements());
        i += 1;
    }
    out
}
