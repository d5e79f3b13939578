//! Drill definitions and the drill library.
//!
//! A drill is an ordered list of steps per difficulty level. Each step holds
//! one or more shot variants; the runner picks one variant per step on every
//! iteration. Definitions are read-only to the runner.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

use crate::shot::{ShotParameters, deserialize_flag};

pub const BASIC: &[&str] = &[
    "push(b)", "push(f)", "drive(b)", "drive(f)", "loop(b)", "loop(f)",
];

pub const COMBINED: &[&str] = &[
    "loop(b)-drive(b)",
    "loop(f)-drive(f)",
    "drive(f)-drive(b)",
    "push(f)-drive(f)",
    "push(b)-loop(b)",
    "loop(f)-drive(b)",
    "push(f)-loop(b)",
    "drive(f)-drive(f)",
    "push(b)-loop(f)",
    "push(f)-loop(f)",
    "loop(f)-loop(f)",
    "loop(b)-drive(f)",
];

pub const COMPLEX: &[&str] = &[
    "push(b)-loop(f)-drive(b)",
    "push(f)-loop(b)-drive(f)",
    "loop(f)-drive(f)-drive(b)",
    "loop(b)-drive(f)-drive(b)",
    "drive(f)-drive(f)-drive(f)",
    "push(f)-loop(f)-drive(f)",
    "push(b)-loop(b)-drive(b)",
    "push(f)-loop(b)-drive(b)",
    "loop(f)-drive(b)-drive(f)",
    "loop(b)-drive(b)-drive(f)",
    "push(b)-loop(f)-drive(f)",
    "push(b)-loop(b)-drive(f)",
    "drive(b)-drive(f)-drive(f)",
    "random-drive",
    "23-random-drive",
    "all-random",
];

pub const CUSTOM_CATEGORIES: &[&str] = &["custom-a", "custom-b", "custom-c"];

pub const MAX_CUSTOM_PER_CATEGORY: usize = 20;
pub const MAX_NAME_LEN: usize = 25;

// ---------------------------------------------------------------------------
// Level
// ---------------------------------------------------------------------------

/// Difficulty level. Serialized in drill files as "1", "2", "3".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum Level {
    #[default]
    Beginner,
    Intermediate,
    Advanced,
}

impl Level {
    pub const ALL: [Level; 3] = [Level::Beginner, Level::Intermediate, Level::Advanced];

    pub fn number(self) -> u8 {
        match self {
            Self::Beginner => 1,
            Self::Intermediate => 2,
            Self::Advanced => 3,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Beginner => write!(f, "beginner"),
            Self::Intermediate => write!(f, "intermediate"),
            Self::Advanced => write!(f, "advanced"),
        }
    }
}

// ---------------------------------------------------------------------------
// DrillStep
// ---------------------------------------------------------------------------

/// One position in a drill sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DrillStep {
    pub variants: Vec<ShotParameters>,
    pub active: bool,
    /// Drop tolerance applied at execution time. 0 disables scatter.
    #[serde(skip_serializing_if = "is_zero")]
    pub scatter: f64,
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

impl DrillStep {
    pub fn single(shot: ShotParameters) -> Self {
        Self::with_variants(vec![shot])
    }

    pub fn with_variants(variants: Vec<ShotParameters>) -> Self {
        Self {
            variants,
            active: true,
            scatter: 0.0,
        }
    }

    pub fn scatter(mut self, scatter: f64) -> Self {
        self.scatter = scatter.max(0.0);
        self
    }

    /// A step fires if its own flag is set and at least one variant is active.
    pub fn is_active(&self) -> bool {
        self.active && self.variants.iter().any(|v| v.active)
    }

    pub fn active_variants(&self) -> impl Iterator<Item = &ShotParameters> {
        self.variants.iter().filter(|v| v.active)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StepRepr {
    Variants(Vec<ShotParameters>),
    Full(StepFields),
    Bare(ShotParameters),
}

#[derive(Deserialize)]
struct StepFields {
    variants: Vec<ShotParameters>,
    #[serde(default = "active_default", deserialize_with = "deserialize_flag")]
    active: bool,
    #[serde(default)]
    scatter: f64,
}

fn active_default() -> bool {
    true
}

impl<'de> Deserialize<'de> for DrillStep {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let step = match StepRepr::deserialize(deserializer)? {
            StepRepr::Variants(variants) => DrillStep::with_variants(variants),
            StepRepr::Full(f) => DrillStep {
                variants: f.variants,
                active: f.active,
                scatter: f.scatter.max(0.0),
            },
            StepRepr::Bare(shot) => DrillStep::single(shot),
        };
        if step.variants.is_empty() {
            return Err(de::Error::custom("drill step has no variants"));
        }
        Ok(step)
    }
}

// ---------------------------------------------------------------------------
// Drill
// ---------------------------------------------------------------------------

/// A drill: one step sequence per level plus the randomize-order flag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Drill {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "1", default)]
    pub beginner: Vec<DrillStep>,
    #[serde(rename = "2", default)]
    pub intermediate: Vec<DrillStep>,
    #[serde(rename = "3", default)]
    pub advanced: Vec<DrillStep>,
    #[serde(rename = "random", default)]
    pub randomize: bool,
}

impl Drill {
    /// Same steps on every level.
    pub fn uniform(steps: Vec<DrillStep>) -> Self {
        Self {
            name: None,
            beginner: steps.clone(),
            intermediate: steps.clone(),
            advanced: steps,
            randomize: false,
        }
    }

    pub fn randomized(mut self) -> Self {
        self.randomize = true;
        self
    }

    pub fn steps(&self, level: Level) -> &[DrillStep] {
        match level {
            Level::Beginner => &self.beginner,
            Level::Intermediate => &self.intermediate,
            Level::Advanced => &self.advanced,
        }
    }

    pub fn steps_mut(&mut self, level: Level) -> &mut Vec<DrillStep> {
        match level {
            Level::Beginner => &mut self.beginner,
            Level::Intermediate => &mut self.intermediate,
            Level::Advanced => &mut self.advanced,
        }
    }

    /// Steps for `level` with inactive ones removed.
    pub fn active_steps(&self, level: Level) -> Vec<DrillStep> {
        self.steps(level)
            .iter()
            .filter(|s| s.is_active())
            .cloned()
            .collect()
    }
}

/// Keyed drill lookup consumed by the runner.
pub trait DrillLookup {
    fn drill(&self, key: &str) -> Option<&Drill>;
}

// ---------------------------------------------------------------------------
// Built-in presets
// ---------------------------------------------------------------------------

/// Per-level preset for a basic stroke, e.g. `"push(b)"`.
fn preset(stroke: &str, level: Level) -> Option<ShotParameters> {
    let (name, side) = stroke.strip_suffix(')')?.split_once('(')?;
    let drop = match side {
        "b" => -5.0,
        "f" => 5.0,
        _ => return None,
    };
    let (top, bottom, freq) = match (name, level) {
        ("push", Level::Beginner) => (1547, 2915, 10),
        ("push", Level::Intermediate) => (1205, 3257, 20),
        ("push", Level::Advanced) => (863, 3599, 30),
        ("drive", Level::Beginner) => (3545, 2177, 40),
        ("drive", Level::Intermediate) => (3545, 2177, 50),
        ("drive", Level::Advanced) => (3545, 2177, 70),
        ("loop", Level::Beginner) => (1520, 3572, 10),
        ("loop", Level::Intermediate) => (1178, 3914, 20),
        ("loop", Level::Advanced) => (836, 4256, 30),
        _ => return None,
    };
    Some(ShotParameters::new(top, bottom, 50, drop, freq, 1))
}

/// Combination of beginner presets, same on every level.
fn sequence(strokes: &[&str]) -> Drill {
    Drill::uniform(
        strokes
            .iter()
            .filter_map(|s| preset(s, Level::Beginner))
            .map(DrillStep::single)
            .collect(),
    )
}

fn builtin_drill(key: &str) -> Option<Drill> {
    match key {
        "random-drive" => Some(sequence(&["drive(f)", "drive(b)"]).randomized()),
        "23-random-drive" => Some(sequence(&["drive(f)", "drive(b)", "drive(f)"]).randomized()),
        "all-random" => {
            Some(sequence(&["push(f)", "push(b)", "drive(f)", "drive(b)"]).randomized())
        }
        _ if BASIC.contains(&key) => {
            let mut drill = Drill::default();
            for level in Level::ALL {
                drill.steps_mut(level).push(DrillStep::single(preset(key, level)?));
            }
            Some(drill)
        }
        _ => Some(sequence(&key.split('-').collect::<Vec<_>>())),
    }
}

// ---------------------------------------------------------------------------
// DrillLibrary
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DrillError {
    #[error("unknown category '{0}'")]
    UnknownCategory(String),
    #[error("Category is full (Max 20)")]
    CategoryFull,
    #[error("Name too long (Max 25)")]
    NameTooLong,
    #[error("Invalid characters")]
    InvalidName,
}

/// A user drill listed in a custom category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomEntry {
    pub name: String,
    pub key: String,
}

/// All drills by key plus the user's custom category listings. This is the
/// `drills.json` document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DrillLibrary {
    #[serde(default)]
    pub drills: BTreeMap<String, Drill>,
    #[serde(default)]
    pub custom: BTreeMap<String, Vec<CustomEntry>>,
}

impl DrillLookup for DrillLibrary {
    fn drill(&self, key: &str) -> Option<&Drill> {
        self.drills.get(key)
    }
}

impl DrillLibrary {
    /// Built-in drills with empty custom categories.
    pub fn builtin() -> Self {
        let drills = BASIC
            .iter()
            .chain(COMBINED)
            .chain(COMPLEX)
            .filter_map(|key| builtin_drill(key).map(|d| (key.to_string(), d)))
            .collect();
        let custom = CUSTOM_CATEGORIES
            .iter()
            .map(|c| (c.to_string(), Vec::new()))
            .collect();
        Self { drills, custom }
    }

    /// Overlay a stored library: its drills replace built-ins of the same key.
    pub fn merge(&mut self, stored: DrillLibrary) {
        self.drills.extend(stored.drills);
        for (category, entries) in stored.custom {
            self.custom.insert(category, entries);
        }
    }

    /// Ordered (category, keys) listing for display.
    pub fn categories(&self) -> Vec<(String, Vec<String>)> {
        let own = |keys: &[&str]| keys.iter().map(|k| k.to_string()).collect::<Vec<_>>();
        let mut out = vec![
            ("basic".to_string(), own(BASIC)),
            ("combined".to_string(), own(COMBINED)),
            ("complex".to_string(), own(COMPLEX)),
        ];
        for category in CUSTOM_CATEGORIES {
            let keys = self
                .custom
                .get(*category)
                .map(|entries| entries.iter().map(|e| e.key.clone()).collect())
                .unwrap_or_default();
            out.push((category.to_string(), keys));
        }
        out
    }

    /// The subset that belongs in `drills.json`: user drills and their listings.
    pub fn user_only(&self) -> DrillLibrary {
        let keys: Vec<&String> = self.custom.values().flatten().map(|e| &e.key).collect();
        DrillLibrary {
            drills: self
                .drills
                .iter()
                .filter(|(k, _)| keys.contains(k))
                .map(|(k, d)| (k.clone(), d.clone()))
                .collect(),
            custom: self.custom.clone(),
        }
    }

    /// Create an empty user drill in a custom category. Returns its key.
    pub fn create_user_drill(
        &mut self,
        category: &str,
        name: &str,
        now_millis: i64,
    ) -> Result<String, DrillError> {
        let suffix = category
            .strip_prefix("custom-")
            .filter(|_| CUSTOM_CATEGORIES.contains(&category))
            .ok_or_else(|| DrillError::UnknownCategory(category.to_string()))?;
        let entries = self.custom.entry(category.to_string()).or_default();
        if entries.len() >= MAX_CUSTOM_PER_CATEGORY {
            return Err(DrillError::CategoryFull);
        }
        validate_name(name)?;

        let key = format!(
            "cust_{}_{}_{now_millis}",
            suffix.to_uppercase(),
            collapse_whitespace(name)
        );
        entries.push(CustomEntry {
            name: name.to_string(),
            key: key.clone(),
        });

        let mut drill = Drill {
            name: Some(name.to_string()),
            ..Drill::default()
        };
        drill
            .beginner
            .push(DrillStep::single(ShotParameters::new(4123, 2233, 50, 0.0, 50, 1)));
        self.drills.insert(key.clone(), drill);
        Ok(key)
    }
}

fn validate_name(name: &str) -> Result<(), DrillError> {
    if name.chars().count() > MAX_NAME_LEN {
        return Err(DrillError::NameTooLong);
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || ".-#[]><+)( ".contains(c);
    if name.is_empty() || !name.chars().all(allowed) {
        return Err(DrillError::InvalidName);
    }
    Ok(())
}

fn collapse_whitespace(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_space = false;
    for c in name.chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push('_');
            }
            in_space = true;
        } else {
            out.push(c);
            in_space = false;
        }
    }
    out
}
