//! Block-structured appliance configuration files
//!
//! The appliance persists its iSCSI objects in files made of `[header]`
//! sections followed by `key=value` lines. This is not INI: there is no
//! quoting, no comments, and one physical line may carry several
//! whitespace-separated assignments (`iqn=iqn.foo enabled=no`).
//!
//! Raw lines are kept verbatim, including their line terminators, so a file
//! can be re-emitted byte-for-byte minus the blocks a plan removes.

use std::collections::{BTreeSet, HashMap};

/// One `[header]` section and the lines that follow it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Text between `[` and the first `]` of the header line
    pub header: String,
    /// Original lines, header first, terminators included
    pub raw_lines: Vec<String>,
    /// Fields extracted from every `key=value` token in the block
    pub fields: HashMap<String, String>,
}

impl Block {
    fn new(header_line: &str) -> Self {
        let trimmed = header_line.trim();
        let (header, rest) = match trimmed.find(']') {
            Some(end) => (&trimmed[1..end], &trimmed[end + 1..]),
            None => (&trimmed[1..], ""),
        };

        let mut block = Block {
            header: header.to_string(),
            raw_lines: vec![header_line.to_string()],
            fields: HashMap::new(),
        };
        // Some files carry assignments on the header line itself
        block.absorb_fields(rest);
        block
    }

    fn push_line(&mut self, line: &str) {
        self.absorb_fields(line);
        self.raw_lines.push(line.to_string());
    }

    fn absorb_fields(&mut self, line: &str) {
        for (key, value) in parse_assignments(line) {
            self.fields.insert(key, value);
        }
    }

    /// Field lookup
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// First present field among `keys`
    pub fn get_any(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|k| self.get(k))
    }

    /// Whether any of the selectors matches this block
    pub fn matches(&self, selectors: &[Selector]) -> bool {
        selectors.iter().any(|s| s.matches(self))
    }

    fn write_to(&self, out: &mut String) {
        for line in &self.raw_lines {
            out.push_str(line);
        }
    }
}

/// Selects blocks whose `key` field holds one of `values`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    pub key: String,
    pub values: BTreeSet<String>,
}

impl Selector {
    pub fn new(key: impl Into<String>, values: impl IntoIterator<Item = String>) -> Self {
        Self {
            key: key.into(),
            values: values.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn matches(&self, block: &Block) -> bool {
        block
            .get(&self.key)
            .map(|v| self.values.contains(v))
            .unwrap_or(false)
    }
}

/// A parsed configuration file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFile {
    /// Header prefix that starts a block, without the leading `[`
    pub block_prefix: String,
    /// Lines before the first matching header
    pub preamble: Vec<String>,
    pub blocks: Vec<Block>,
}

/// Result of filtering a file against a set of selectors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filtered {
    pub content: String,
    pub removed: Vec<String>,
    pub kept: usize,
}

impl ConfigFile {
    /// Re-emit the file exactly as parsed
    pub fn render(&self) -> String {
        self.render_filtered(&[]).content
    }

    /// Re-emit the file without the blocks matched by `selectors`.
    ///
    /// Blocks that are not removed pass through byte-for-byte.
    pub fn render_filtered(&self, selectors: &[Selector]) -> Filtered {
        let mut content = String::new();
        for line in &self.preamble {
            content.push_str(line);
        }

        let mut removed = Vec::new();
        let mut kept = 0;
        for block in &self.blocks {
            if block.matches(selectors) {
                removed.push(block.header.clone());
                continue;
            }
            block.write_to(&mut content);
            kept += 1;
        }

        Filtered {
            content,
            removed,
            kept,
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Parse raw file content into blocks starting at `[<block_prefix>`.
///
/// Never fails: lines that carry no assignment are kept as raw content.
pub fn parse(raw: &str, block_prefix: &str) -> ConfigFile {
    let opener = format!("[{}", block_prefix);
    let mut preamble = Vec::new();
    let mut blocks = Vec::new();
    let mut current: Option<Block> = None;

    for line in raw.split_inclusive('\n') {
        if line.trim_start().starts_with(&opener) {
            if let Some(done) = current.take() {
                blocks.push(done);
            }
            current = Some(Block::new(line));
            continue;
        }

        match current.as_mut() {
            Some(block) => block.push_line(line),
            None => preamble.push(line.to_string()),
        }
    }

    // Flush the final block
    if let Some(done) = current {
        blocks.push(done);
    }

    log::debug!(
        "Parsed {} [{}] blocks ({} preamble lines)",
        blocks.len(),
        block_prefix,
        preamble.len()
    );

    ConfigFile {
        block_prefix: block_prefix.to_string(),
        preamble,
        blocks,
    }
}

/// Split one physical line into `key=value` assignments.
///
/// The line is tokenized on whitespace first, then each token is split once
/// on its first `=`. Tokens without `=` are ignored.
pub fn parse_assignments(line: &str) -> Vec<(String, String)> {
    if !line.contains('=') {
        return Vec::new();
    }

    line.split_whitespace()
        .filter_map(|token| token.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}
