//! Per-server override rules and the directory rewrite engine.
//!
//! A rule keyed by server id either replaces the matching `server` entry in
//! place (`overwrite: true`) or adds a copy of it next to the original with
//! the rule applied and its crowdness sort forced to `0`, so clients prefer
//! the copy over the genuine entry (`overwrite: false`).

use crate::error::{ProxyError, Result};
use crate::xml::{duplicate_as_sibling, Document, Element, Node};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Address written into an overridden entry when the rule has no `ip`.
pub const LOOPBACK: &str = "127.0.0.1";

const SERVER: &str = "server";
const ID: &str = "id";
const IP: &str = "ip";
const PORT: &str = "port";
const NAME: &str = "name";
const RAW_NAME: &str = "raw_name";
const CROWDNESS: &str = "crowdness";
const SORT: &str = "sort";
const POPUP: &str = "popup";

/// Redirect or relabel instruction for one server id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct OverrideRule {
    /// Address clients should connect to. Falls back to [`LOOPBACK`].
    #[serde(default)]
    pub ip: Option<String>,

    /// Port clients should connect to. Accepts a number or a numeric string.
    #[serde(default, deserialize_with = "deserialize_port")]
    pub port: Option<String>,

    /// Display name, written to the CDATA section and the `raw_name` attribute.
    #[serde(default)]
    pub name: Option<String>,

    /// Replace the original entry instead of adding a preferred copy.
    #[serde(default)]
    pub overwrite: bool,
}

impl OverrideRule {
    /// Rejects rules that could only fail at rewrite time.
    pub fn validate(&self, id: &str) -> Result<()> {
        if id.trim().is_empty() {
            return Err(ProxyError::invalid_override(id, "server id cannot be empty"));
        }

        if let Some(ip) = self.ip.as_deref().filter(|ip| !ip.is_empty()) {
            ip.parse::<IpAddr>().map_err(|_| {
                ProxyError::invalid_override(id, format!("Invalid IP address: {}", ip))
            })?;
        }

        if let Some(port) = &self.port {
            match port.parse::<u16>() {
                Ok(p) if p > 0 => {}
                _ => {
                    return Err(ProxyError::invalid_override(
                        id,
                        format!("Invalid port: {}", port),
                    ))
                }
            }
        }

        if let Some(name) = &self.name {
            if let Some(c) = name.chars().find(|c| !is_xml_char(*c)) {
                return Err(ProxyError::invalid_override(
                    id,
                    format!("Name contains a character not allowed in XML: {:?}", c),
                ));
            }
        }

        Ok(())
    }

    /// The address written into the `ip` field.
    pub fn effective_ip(&self) -> &str {
        self.ip
            .as_deref()
            .filter(|ip| !ip.is_empty())
            .unwrap_or(LOOPBACK)
    }
}

/// Characters an XML 1.0 document may carry, escaped or not.
fn is_xml_char(c: char) -> bool {
    matches!(c, '\t' | '\n' | '\r') || (c >= ' ' && c != '\u{FFFE}' && c != '\u{FFFF}')
}

fn deserialize_port<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortValue {
        Number(u64),
        Text(String),
    }

    Ok(Option::<PortValue>::deserialize(deserializer)?.map(|value| match value {
        PortValue::Number(n) => n.to_string(),
        PortValue::Text(s) => s,
    }))
}

/// Override rules keyed by server id.
pub type OverrideTable = HashMap<String, OverrideRule>;

/// Validates every rule in a table.
pub fn validate_table(table: &OverrideTable) -> Result<()> {
    for (id, rule) in table {
        rule.validate(id)?;
    }
    Ok(())
}

/// One immutable generation of the override table.
#[derive(Debug, Default)]
pub struct OverrideSnapshot {
    pub version: u64,
    pub rules: OverrideTable,
}

/// Hot-swappable holder for the active override table.
///
/// Readers take an `Arc` to the current snapshot and keep it for a whole
/// rewrite pass; an update never changes a snapshot already handed out.
#[derive(Debug)]
pub struct OverrideStore {
    current: RwLock<Arc<OverrideSnapshot>>,
}

impl OverrideStore {
    /// Creates a store holding a validated table as version 0.
    pub fn new(rules: OverrideTable) -> Result<Self> {
        validate_table(&rules)?;
        Ok(Self {
            current: RwLock::new(Arc::new(OverrideSnapshot { version: 0, rules })),
        })
    }

    /// The table in effect right now.
    pub fn snapshot(&self) -> Arc<OverrideSnapshot> {
        self.current.read().unwrap().clone()
    }

    pub fn version(&self) -> u64 {
        self.current.read().unwrap().version
    }

    /// Validates and installs a new table, returning its version.
    ///
    /// An invalid table is rejected and the previous one stays active.
    pub fn update(&self, rules: OverrideTable) -> Result<u64> {
        validate_table(&rules)?;

        let mut current = self.current.write().unwrap();
        let version = current.version + 1;
        let count = rules.len();
        *current = Arc::new(OverrideSnapshot { version, rules });

        info!(version, rules = count, "Override table updated");
        Ok(version)
    }
}

impl Default for OverrideStore {
    fn default() -> Self {
        Self {
            current: RwLock::new(Arc::new(OverrideSnapshot::default())),
        }
    }
}

/// What a rewrite pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteSummary {
    /// Entries added next to their original.
    pub duplicated: usize,
    /// Entries modified in place.
    pub replaced: usize,
    /// Empty `popup` elements given a CDATA child.
    pub popups_filled: usize,
}

/// Applies the override table to every `server` element in the document.
pub fn apply_overrides(doc: &mut Document, table: &OverrideTable) -> RewriteSummary {
    let mut summary = RewriteSummary::default();
    rewrite_servers(&mut doc.nodes, table, &mut summary);
    summary.popups_filled = fill_empty_popups(&mut doc.nodes);

    debug!(
        duplicated = summary.duplicated,
        replaced = summary.replaced,
        popups_filled = summary.popups_filled,
        "Directory rewritten"
    );
    summary
}

fn rewrite_servers(nodes: &mut Vec<Node>, table: &OverrideTable, summary: &mut RewriteSummary) {
    // Copies are appended to `nodes`; only the original entries are visited.
    let original_len = nodes.len();

    for index in 0..original_len {
        let id = match &mut nodes[index] {
            Node::Element(e) if e.name == SERVER => e.child(ID).map(Element::text),
            Node::Element(e) => {
                rewrite_servers(&mut e.children, table, summary);
                continue;
            }
            _ => continue,
        };

        let Some(id) = id else { continue };
        let Some(rule) = table.get(&id) else { continue };

        let target = if rule.overwrite {
            summary.replaced += 1;
            nodes[index].as_element_mut()
        } else {
            summary.duplicated += 1;
            duplicate_as_sibling(nodes, index)
        };

        if let Some(target) = target {
            debug!(id = %id, overwrite = rule.overwrite, "Applying server override");
            apply_rule(target, rule);
        }
    }
}

fn apply_rule(server: &mut Element, rule: &OverrideRule) {
    for field in server.elements_mut() {
        match field.name.as_str() {
            IP => field.set_text(rule.effective_ip()),
            PORT => {
                if let Some(port) = &rule.port {
                    field.set_text(port);
                }
            }
            NAME => {
                if let Some(name) = &rule.name {
                    if let Some(data) = field.cdata_mut() {
                        *data = name.clone();
                    }
                    field.set_existing_attribute(RAW_NAME, name);
                }
            }
            CROWDNESS => {
                // Lowest sort wins among entries sharing an id.
                if !rule.overwrite {
                    field.set_existing_attribute(SORT, "0");
                }
            }
            _ => {}
        }
    }
}

/// Gives every childless `popup` an empty CDATA section so clients do not
/// see it collapsed to `<popup/>`.
fn fill_empty_popups(nodes: &mut [Node]) -> usize {
    let mut filled = 0;
    for node in nodes {
        if let Node::Element(e) = node {
            if e.name == POPUP && !e.has_children() {
                e.append_child(Node::CData(String::new()));
                filled += 1;
            } else {
                filled += fill_empty_popups(&mut e.children);
            }
        }
    }
    filled
}
