//! Identifiers shared by every part of the pipeline.
//!
//! An [`AssetClass`] names one category of source asset; a [`TaskId`] names
//! one of the two operations (clean or build) that exist for it. Neither
//! carries data: patterns and destinations live in
//! [`config::ClassConfig`](crate::config::ClassConfig).

use serde::{Deserialize, Serialize};
use std::fmt;

/// A category of source asset with its own source glob, destination and
/// converter.
///
/// Declaration order is the startup build order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetClass {
    Fonts,
    Files,
    Libs,
    Markup,
    Images,
    Scripts,
    Styles,
}

impl AssetClass {
    /// Every class, in startup build order.
    pub const ALL: [AssetClass; 7] = [
        AssetClass::Fonts,
        AssetClass::Files,
        AssetClass::Libs,
        AssetClass::Markup,
        AssetClass::Images,
        AssetClass::Scripts,
        AssetClass::Styles,
    ];

    pub fn name(self) -> &'static str {
        match self {
            AssetClass::Fonts => "fonts",
            AssetClass::Files => "files",
            AssetClass::Libs => "libs",
            AssetClass::Markup => "markup",
            AssetClass::Images => "images",
            AssetClass::Scripts => "scripts",
            AssetClass::Styles => "styles",
        }
    }
}

impl fmt::Display for AssetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The two operations every asset class has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Clean,
    Build,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Clean => f.write_str("clean"),
            Phase::Build => f.write_str("build"),
        }
    }
}

/// Identity of a task: exactly one clean and one build exist per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId {
    pub class: AssetClass,
    pub phase: Phase,
}

impl TaskId {
    pub fn clean(class: AssetClass) -> Self {
        Self {
            class,
            phase: Phase::Clean,
        }
    }

    pub fn build(class: AssetClass) -> Self {
        Self {
            class,
            phase: Phase::Build,
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.class, self.phase)
    }
}
