// Tree ingest: XML and JSON documents are unified behind one node model,
// rows are selected with an XPath expression, and each selected subtree is
// flattened into a name→value map. Text fields are keyed by the element's
// own local name; attribute fields are keyed by the ancestor path.

use crate::source::{self, FileInfo, Select};
use crate::xpath::{self, Matched};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TreeKind {
    Xml,
    Json,
}

// One node of a parsed document. The document itself is a nameless node.
#[derive(Debug, Clone, Default)]
pub struct Node {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub kids: Vec<Kid>,
}

#[derive(Debug, Clone)]
pub enum Kid {
    Text(String),
    Element(Node),
}

impl Node {
    // Direct element children.
    pub fn elements(&self) -> impl Iterator<Item = &Node> {
        self.kids.iter().filter_map(|k| match k {
            Kid::Element(n) => Some(n),
            Kid::Text(_) => None,
        })
    }

    // Concatenated direct text children.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for k in &self.kids {
            if let Kid::Text(t) = k {
                out.push_str(t);
            }
        }
        out
    }

    // Parse an XML document. Whitespace-only text between elements is
    // dropped; text inside a leaf is kept verbatim.
    pub fn from_xml(src: &str) -> Result<Node, Box<dyn std::error::Error + Send + Sync>> {
        let doc = roxmltree::Document::parse(src)
            .map_err(|e| format!("{}: parsing xml", e))?;
        let mut root = Node::default();
        for child in doc.root().children() {
            if child.is_element() {
                root.kids.push(Kid::Element(convert_xml(child)));
            }
        }
        Ok(root)
    }

    // Parse a JSON document. Object keys become element names, array items
    // become nameless elements, scalars become text children.
    pub fn from_json(src: &str) -> Result<Node, Box<dyn std::error::Error + Send + Sync>> {
        let value: serde_json::Value =
            serde_json::from_str(src).map_err(|e| format!("{}: parsing json", e))?;
        Ok(convert_json("", &value))
    }
}

fn convert_xml(n: roxmltree::Node) -> Node {
    let mut node = Node {
        name: n.tag_name().name().to_string(),
        attrs: n
            .attributes()
            .map(|a| (a.name().to_string(), a.value().to_string()))
            .collect(),
        kids: Vec::new(),
    };
    for child in n.children() {
        if child.is_element() {
            node.kids.push(Kid::Element(convert_xml(child)));
        } else if child.is_text() {
            let text = child.text().unwrap_or("");
            if !text.trim().is_empty() {
                node.kids.push(Kid::Text(text.to_string()));
            }
        }
    }
    node
}

fn convert_json(name: &str, value: &serde_json::Value) -> Node {
    let mut node = Node {
        name: name.to_string(),
        attrs: Vec::new(),
        kids: Vec::new(),
    };
    match value {
        serde_json::Value::Object(map) => {
            for (k, v) in map {
                node.kids.push(Kid::Element(convert_json(k, v)));
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                node.kids.push(Kid::Element(convert_json("", item)));
            }
        }
        serde_json::Value::String(s) => node.kids.push(Kid::Text(s.clone())),
        serde_json::Value::Number(n) => node.kids.push(Kid::Text(n.to_string())),
        serde_json::Value::Bool(b) => node.kids.push(Kid::Text(b.to_string())),
        serde_json::Value::Null => {}
    }
    node
}

// Flatten a subtree into `fields`. Attributes are keyed by the ancestor
// path joined with '/'; a text child is keyed by the current element's own
// local name. `use_name` overrides that name for the top-level node only;
// recursion always carries the child's own name.
pub fn flatten(
    prefix: &str,
    node: &Node,
    fields: &mut HashMap<String, String>,
    use_name: Option<&str>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let prefix = if prefix.is_empty() {
        String::new()
    } else {
        format!("{}/", prefix)
    };
    for (aname, avalue) in &node.attrs {
        fields.insert(format!("{}{}", prefix, aname), avalue.clone());
    }
    let field_name = use_name.unwrap_or(&node.name);
    for kid in &node.kids {
        match kid {
            Kid::Text(t) => {
                if fields.contains_key(field_name) {
                    return Err(
                        format!("duplicate entry {} ({})", field_name, prefix).into()
                    );
                }
                fields.insert(field_name.to_string(), t.clone());
            }
            Kid::Element(child) => {
                flatten(&format!("{}{}", prefix, child.name), child, fields, None)?;
            }
        }
    }
    Ok(())
}

// Read one tree-shaped source: select rows with the row expression, apply
// each Select per row, and return the lexicographically sorted union of
// field names together with the row maps.
pub fn read_tree_file(
    info: &FileInfo,
    xpath_str: &str,
    selects: &[Select],
    kind: TreeKind,
) -> Result<(Vec<String>, Vec<HashMap<String, String>>), Box<dyn std::error::Error + Send + Sync>>
{
    let text = source::read_source_string(info)?;
    let doc = match kind {
        TreeKind::Xml => Node::from_xml(&text)?,
        TreeKind::Json => Node::from_json(&text)?,
    };

    let default_select = [Select {
        path: ".".to_string(),
        name: None,
    }];
    let selects = if selects.is_empty() {
        &default_select[..]
    } else {
        selects
    };
    // Strip the optional marker up front and compile each select once.
    let mut compiled = Vec::new();
    for sel in selects {
        let (path, required) = match sel.path.strip_suffix('?') {
            Some(p) => (p, false),
            None => (sel.path.as_str(), true),
        };
        compiled.push((path.to_string(), required, xpath::compile(path)?, sel));
    }

    let row_expr = xpath::compile(xpath_str)?;
    let mut header: BTreeSet<String> = BTreeSet::new();
    let mut data = Vec::new();

    for row in row_expr.select(&doc) {
        let node = match row {
            Matched::Node(n) => n,
            Matched::Attr { .. } => {
                return Err(format!(
                    "row selector {} matched an attribute in {}",
                    xpath_str, info.path
                )
                .into())
            }
        };
        let mut fields: HashMap<String, String> = HashMap::new();
        for (path, required, expr, sel) in &compiled {
            let matches = expr.select(node);
            if matches.is_empty() {
                if *required {
                    let nodename = if node.name.is_empty() {
                        "nameless node"
                    } else {
                        node.name.as_str()
                    };
                    return Err(
                        format!("no element found for {} in {}", path, nodename).into()
                    );
                }
                continue;
            }
            if matches.len() > 1 {
                return Err(format!(
                    "more than one element found for {} in {}",
                    path, node.name
                )
                .into());
            }
            match matches[0] {
                Matched::Attr { name, value, .. } => {
                    let h = sel.name.as_deref().unwrap_or(name);
                    fields.insert(h.to_string(), value.to_string());
                }
                Matched::Node(n) => {
                    flatten("", n, &mut fields, sel.name.as_deref())?;
                }
            }
        }
        header.extend(fields.keys().cloned());
        data.push(fields);
    }

    Ok((header.into_iter().collect(), data))
}
