//! Device enumeration report parser.
//!
//! The report is a sequence of agents, each introduced by an `Agent <n>`
//! header and followed by indented lines:
//!
//! ```text
//! Agent 2
//!   Name:                    gfx90a
//!   Compute Unit:            120
//!   ISA Info:
//!     ISA 1
//!       Name:                    amdgcn-amd-amdhsa--gfx90a:sramecc+:xnack-
//!   Workgroup Max Size per Dimension:
//!     x                        1024(0x400)
//! ```
//!
//! `key: value` is a leaf, `key:` with nothing after it opens a section,
//! a bare label (`ISA 1`) opens a section, and `x`/`y`/`z` rows are leaves.
//! Nesting comes only from indentation, two columns per level.

use std::collections::BTreeMap;

const INDENT_UNIT: usize = 2;

/// One node of an agent's property tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Property {
    Value(String),
    Section(PropertyTree),
}

/// Ordered `key -> property` map. A repeated key replaces the earlier entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyTree {
    entries: Vec<(String, Property)>,
}

impl PropertyTree {
    pub fn get(&self, key: &str) -> Option<&Property> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, p)| p)
    }

    /// The leaf at `key`, if it is one.
    pub fn value(&self, key: &str) -> Option<&str> {
        match self.get(key)? {
            Property::Value(v) => Some(v),
            Property::Section(_) => None,
        }
    }

    /// The section at `key`, if it is one.
    pub fn section(&self, key: &str) -> Option<&PropertyTree> {
        match self.get(key)? {
            Property::Section(s) => Some(s),
            Property::Value(_) => None,
        }
    }

    /// Walk nested sections; the last key may name a leaf or a section.
    pub fn lookup(&self, path: &[&str]) -> Option<&Property> {
        let (last, parents) = path.split_last()?;
        let mut tree = self;
        for key in parents {
            tree = tree.section(key)?;
        }
        tree.get(last)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Property)> {
        self.entries.iter().map(|(k, p)| (k.as_str(), p))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

enum Slot {
    Leaf(String),
    Node(usize),
}

type Arena = Vec<Vec<(String, Slot)>>;

/// Parse a device report into `agent number -> property tree`.
///
/// Lines at column 0 other than agent headers are ignored, as is anything
/// before the first header. When indentation shrinks, one container is
/// popped per two columns (never past the agent root).
pub fn parse_agents(text: &str) -> BTreeMap<u32, PropertyTree> {
    let mut arena: Arena = Vec::new();
    let mut roots: BTreeMap<u32, usize> = BTreeMap::new();

    let mut stack: Vec<usize> = Vec::new();
    let mut current: Option<usize> = None;
    // Section opened by the previous line, entered if the next line is deeper.
    let mut opened: Option<usize> = None;
    let mut last_indent: Option<usize> = None;

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(agent) = agent_header(trimmed) {
            let root = new_node(&mut arena);
            roots.insert(agent, root);
            current = Some(root);
            stack.clear();
            opened = None;
            last_indent = None;
            continue;
        }

        let indent = line.len() - line.trim_start().len();
        if indent == 0 {
            continue;
        }
        let Some(mut here) = current else {
            continue;
        };

        match last_indent {
            Some(last) if indent > last => {
                stack.push(here);
                here = opened.unwrap_or(here);
            }
            Some(last) if indent < last => {
                for _ in 0..(last - indent) / INDENT_UNIT {
                    match stack.pop() {
                        Some(up) => here = up,
                        None => break,
                    }
                }
            }
            _ => {}
        }

        opened = None;
        if let Some((key, value)) = trimmed.split_once(':') {
            let (key, value) = (key.trim(), value.trim());
            if value.is_empty() {
                opened = Some(open_section(&mut arena, here, key));
            } else {
                insert(&mut arena[here], key, Slot::Leaf(value.to_string()));
            }
        } else {
            match trimmed.split_once(char::is_whitespace) {
                Some((axis @ ("x" | "y" | "z"), rest)) => {
                    insert(&mut arena[here], axis, Slot::Leaf(rest.trim().to_string()));
                }
                _ => opened = Some(open_section(&mut arena, here, trimmed)),
            }
        }

        current = Some(here);
        last_indent = Some(indent);
    }

    roots
        .into_iter()
        .map(|(agent, root)| (agent, build(&arena, root)))
        .collect()
}

fn agent_header(trimmed: &str) -> Option<u32> {
    trimmed
        .strip_prefix("Agent ")?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

fn new_node(arena: &mut Arena) -> usize {
    arena.push(Vec::new());
    arena.len() - 1
}

fn open_section(arena: &mut Arena, parent: usize, key: &str) -> usize {
    let child = new_node(arena);
    insert(&mut arena[parent], key, Slot::Node(child));
    child
}

fn insert(node: &mut Vec<(String, Slot)>, key: &str, slot: Slot) {
    match node.iter_mut().find(|(k, _)| k == key) {
        Some(entry) => entry.1 = slot,
        None => node.push((key.to_string(), slot)),
    }
}

fn build(arena: &Arena, idx: usize) -> PropertyTree {
    let entries = arena[idx]
        .iter()
        .map(|(key, slot)| {
            let prop = match slot {
                Slot::Leaf(v) => Property::Value(v.clone()),
                Slot::Node(child) => Property::Section(build(arena, *child)),
            };
            (key.clone(), prop)
        })
        .collect();
    PropertyTree { entries }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE: &str = "\
ROCk module is loaded
=====================
HSA System Attributes
=====================
Runtime Version:         1.1
  Machine Model:           LARGE

==========
HSA Agents
==========
*******
Agent 1
*******
  Name:                    AMD EPYC 7763 64-Core Processor
  Vendor Name:             CPU
  Device Type:             CPU
  Cache Info:
    L1:                      32768(0x8000) KB
  Chip ID:                 0(0x0)
  Compute Unit:            128
  Workgroup Max Size per Dimension:
    x                        1024(0x400)
    y                        1024(0x400)
    z                        1024(0x400)
  Pool Info:
    Pool 1
      Segment:                 GLOBAL; FLAGS: FINE GRAINED
      Size:                    263921452(0xfbb3a2c) KB
    Pool 2
      Segment:                 GLOBAL; FLAGS: KERNARG, FINE GRAINED
  ISA Info:
*******
Agent 2
*******
  Name:                    gfx90a
  Marketing Name:          AMD Instinct MI210
  Device Type:             GPU
  Compute Unit:            120
  ISA Info:
    ISA 1
      Name:                    amdgcn-amd-amdhsa--gfx90a:sramecc+:xnack-
      Machine Models:          HSA_MACHINE_MODEL_LARGE
  Max Waves Per CU:        32(0x20)
*** Done ***
";

    #[test]
    fn two_agents_found() {
        let agents = parse_agents(SAMPLE);
        assert_eq!(agents.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn leaves_and_sections() {
        let agents = parse_agents(SAMPLE);
        let cpu = &agents[&1];
        assert_eq!(cpu.value("Device Type"), Some("CPU"));
        assert_eq!(cpu.value("Compute Unit"), Some("128"));
        assert_eq!(cpu.value("Chip ID"), Some("0(0x0)"));
        assert_eq!(
            cpu.lookup(&["Cache Info", "L1"]),
            Some(&Property::Value("32768(0x8000) KB".to_string()))
        );
        // Pre-agent lines never leak into an agent.
        assert!(cpu.get("Machine Model").is_none());
    }

    #[test]
    fn axis_rows_are_leaves() {
        let agents = parse_agents(SAMPLE);
        let dims = agents[&1].section("Workgroup Max Size per Dimension").unwrap();
        assert_eq!(dims.value("x"), Some("1024(0x400)"));
        assert_eq!(dims.value("z"), Some("1024(0x400)"));
        assert_eq!(dims.len(), 3);
    }

    #[test]
    fn bare_labels_nest_and_pop() {
        let agents = parse_agents(SAMPLE);
        let pools = agents[&1].section("Pool Info").unwrap();
        assert_eq!(
            pools.section("Pool 1").unwrap().value("Segment"),
            Some("GLOBAL; FLAGS: FINE GRAINED")
        );
        assert_eq!(
            pools.section("Pool 2").unwrap().value("Segment"),
            Some("GLOBAL; FLAGS: KERNARG, FINE GRAINED")
        );
        // Two-level pop lands back on the agent root.
        assert!(agents[&1].section("ISA Info").unwrap().is_empty());
    }

    #[test]
    fn value_keeps_colons_after_the_first() {
        let agents = parse_agents(SAMPLE);
        let gpu = &agents[&2];
        assert_eq!(
            gpu.lookup(&["ISA Info", "ISA 1", "Name"]),
            Some(&Property::Value("amdgcn-amd-amdhsa--gfx90a:sramecc+:xnack-".to_string()))
        );
        assert_eq!(gpu.value("Max Waves Per CU"), Some("32(0x20)"));
    }

    #[test]
    fn empty_or_headerless_input() {
        assert!(parse_agents("").is_empty());
        assert!(parse_agents("  Name: gfx90a\n  Device Type: GPU\n").is_empty());
    }

    #[test]
    fn over_dedent_stops_at_root() {
        let text = "Agent 1\n      Deep:\n        Leaf: 1\n  Top: 2\n";
        let agents = parse_agents(text);
        assert_eq!(agents[&1].value("Top"), Some("2"));
        assert_eq!(agents[&1].lookup(&["Deep", "Leaf"]), Some(&Property::Value("1".into())));
    }
}
