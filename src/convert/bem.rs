//! BEM class-name checks on generated HTML.
//!
//! Three mistakes are reported:
//!
//! - `block__elem__sub`: an element of an element.
//! - `btn--large` on a tag without `btn`: a modifier missing its base class.
//! - `card__title` before any tag carrying `card`: an element outside its block.
//!
//! This is a lint, not a parser. Tags are found with a regex, and "inside
//! its block" is approximated by "after a tag carrying the block" in
//! document order.

use regex::Regex;
use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

static TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<[A-Za-z][^>]*>").expect("tag regex is valid")
});

static CLASS_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\sclass\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("class regex is valid")
});

const ELEMENT_SEP: &str = "__";
const MODIFIER_SEP: &str = "--";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BemIssueKind {
    NestedElement,
    ModifierWithoutBase { base: String },
    ElementOutsideBlock { block: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BemIssue {
    /// 1-based line of the offending tag.
    pub line: usize,
    pub class: String,
    pub kind: BemIssueKind,
}

impl fmt::Display for BemIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            BemIssueKind::NestedElement => write!(
                f,
                "line {}: '{}' is an element of an element",
                self.line, self.class
            ),
            BemIssueKind::ModifierWithoutBase { base } => write!(
                f,
                "line {}: modifier '{}' used without '{}'",
                self.line, self.class, base
            ),
            BemIssueKind::ElementOutsideBlock { block } => write!(
                f,
                "line {}: element '{}' is not inside block '{}'",
                self.line, self.class, block
            ),
        }
    }
}

/// `block--mod` → `block`, `block__elem--mod` → `block__elem`.
fn strip_modifier(class: &str) -> &str {
    class.split(MODIFIER_SEP).next().unwrap_or(class)
}

/// Check every `class` attribute of `html`, in document order.
pub fn validate(html: &str) -> Vec<BemIssue> {
    let mut issues = Vec::new();
    let mut blocks: HashSet<String> = HashSet::new();
    // Line of `html[scanned]`; tags come in document order.
    let (mut line, mut scanned) = (1, 0);

    for tag in TAG.find_iter(html) {
        let Some(caps) = CLASS_ATTR.captures(tag.as_str()) else {
            continue;
        };
        let Some(value) = caps.get(1).or_else(|| caps.get(2)) else {
            continue;
        };
        let classes: Vec<&str> = value.as_str().split_whitespace().collect();
        line += html[scanned..tag.start()].matches('\n').count();
        scanned = tag.start();
        let mut issue = |class: &str, kind| {
            issues.push(BemIssue {
                line,
                class: class.to_string(),
                kind,
            })
        };

        for &class in &classes {
            let base = strip_modifier(class);
            if base.len() != class.len() && !classes.contains(&base) {
                issue(
                    class,
                    BemIssueKind::ModifierWithoutBase {
                        base: base.to_string(),
                    },
                );
            }

            let mut parts = base.split(ELEMENT_SEP);
            let block = parts.next().unwrap_or(base);
            match parts.count() {
                0 => {}
                1 if !blocks.contains(block) => issue(
                    class,
                    BemIssueKind::ElementOutsideBlock {
                        block: block.to_string(),
                    },
                ),
                1 => {}
                _ => issue(class, BemIssueKind::NestedElement),
            }
        }

        for &class in &classes {
            let base = strip_modifier(class);
            if !base.contains(ELEMENT_SEP) {
                blocks.insert(base.to_string());
            }
        }
    }
    issues
}
