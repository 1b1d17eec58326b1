//! Minimal HCL rendering: quoted strings, literal values and blocks.

use serde_json::Value;

/// Quote `s` as an HCL string literal. Template sequences are escaped so
/// user values are never interpolated.
pub fn quote(s: &str) -> String {
    let json = Value::String(s.to_string()).to_string();
    json.replace("${", "$${").replace("%{", "%%{")
}

/// Render a JSON value as an HCL literal expression.
pub fn literal(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote(s),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(literal).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Object(entries) => {
            if entries.is_empty() {
                return "{}".to_string();
            }
            let entries: Vec<String> = entries
                .iter()
                .map(|(k, v)| format!("{} = {}", quote(k), literal(v)))
                .collect();
            format!("{{ {} }}", entries.join(", "))
        }
    }
}

enum Item {
    Attr(String, String),
    Block(Block),
}

/// An HCL block with attributes and nested blocks, rendered in insertion
/// order.
pub struct Block {
    header: String,
    items: Vec<Item>,
}

impl Block {
    /// `header` is everything before the brace, e.g. `variable "x"`.
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            items: Vec::new(),
        }
    }

    /// Add `key = expr`. `expr` is emitted verbatim.
    pub fn attr(mut self, key: impl Into<String>, expr: impl Into<String>) -> Self {
        self.items.push(Item::Attr(key.into(), expr.into()));
        self
    }

    pub fn block(mut self, block: Block) -> Self {
        self.items.push(Item::Block(block));
        self
    }

    pub fn push_attr(&mut self, key: impl Into<String>, expr: impl Into<String>) {
        self.items.push(Item::Attr(key.into(), expr.into()));
    }

    pub fn push_block(&mut self, block: Block) {
        self.items.push(Item::Block(block));
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, depth: usize) {
        let indent = "  ".repeat(depth);
        out.push_str(&format!("{indent}{} {{\n", self.header));
        for item in &self.items {
            match item {
                Item::Attr(key, expr) => {
                    out.push_str(&format!("{indent}  {key} = {expr}\n"));
                }
                Item::Block(block) => block.render_into(out, depth + 1),
            }
        }
        out.push_str(&format!("{indent}}}\n"));
    }
}

/// Render blocks separated by blank lines.
pub fn render_all(blocks: &[Block]) -> String {
    blocks
        .iter()
        .map(Block::render)
        .collect::<Vec<_>>()
        .join("\n")
}
