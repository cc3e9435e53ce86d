//! Canonical branch table.
//!
//! The registry is built once (from the built-in table or a JSON file) and shared
//! read-only behind an `Arc`. Lookups are case-insensitive on names and aliases,
//! exact on short codes.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::limits::MAX_BRANCH_NAME_LEN;

/// One branch: canonical display name, short code, and accepted aliases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl Location {
    pub fn new(name: &str, code: &str, aliases: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            code: code.to_string(),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    InvalidCode(String),
    InvalidName(String),
    DuplicateCode(String),
    /// A name or alias resolves to two different branches.
    AmbiguousAlias(String),
    Io(String),
    Parse(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::InvalidCode(c) => write!(f, "invalid short code {c:?}: expected 3-5 uppercase letters"),
            RegistryError::InvalidName(n) => write!(f, "invalid branch name {n:?}"),
            RegistryError::DuplicateCode(c) => write!(f, "short code {c} used by more than one branch"),
            RegistryError::AmbiguousAlias(a) => write!(f, "alias {a:?} maps to more than one branch"),
            RegistryError::Io(e) => write!(f, "cannot read branch table: {e}"),
            RegistryError::Parse(e) => write!(f, "cannot parse branch table: {e}"),
        }
    }
}

impl std::error::Error for RegistryError {}

#[derive(Debug, Clone)]
pub struct LocationRegistry {
    locations: Vec<Location>,
    /// Lowercased name/alias → index into `locations`.
    by_name: HashMap<String, usize>,
    by_code: HashMap<String, usize>,
}

pub fn is_valid_code(code: &str) -> bool {
    (3..=5).contains(&code.len()) && code.bytes().all(|b| b.is_ascii_uppercase())
}

fn fold(name: &str) -> String {
    name.trim().to_lowercase()
}

impl LocationRegistry {
    pub fn new(locations: Vec<Location>) -> Result<Self, RegistryError> {
        let mut by_name = HashMap::new();
        let mut by_code = HashMap::new();
        for (idx, loc) in locations.iter().enumerate() {
            if !is_valid_code(&loc.code) {
                return Err(RegistryError::InvalidCode(loc.code.clone()));
            }
            if loc.name.trim().is_empty() || loc.name.len() > MAX_BRANCH_NAME_LEN {
                return Err(RegistryError::InvalidName(loc.name.clone()));
            }
            if by_code.insert(loc.code.clone(), idx).is_some() {
                return Err(RegistryError::DuplicateCode(loc.code.clone()));
            }
            for alias in std::iter::once(&loc.name).chain(loc.aliases.iter()) {
                let key = fold(alias);
                if key.is_empty() {
                    return Err(RegistryError::InvalidName(alias.clone()));
                }
                if let Some(prev) = by_name.insert(key, idx)
                    && prev != idx
                {
                    return Err(RegistryError::AmbiguousAlias(alias.clone()));
                }
            }
        }
        Ok(Self {
            locations,
            by_name,
            by_code,
        })
    }

    /// Load a JSON array of `{ "name", "code", "aliases" }` objects.
    pub fn from_json_file(path: &Path) -> Result<Self, RegistryError> {
        let raw = std::fs::read_to_string(path).map_err(|e| RegistryError::Io(e.to_string()))?;
        let locations: Vec<Location> =
            serde_json::from_str(&raw).map_err(|e| RegistryError::Parse(e.to_string()))?;
        Self::new(locations)
    }

    /// The branch table shipped with the binary.
    pub fn builtin() -> Self {
        let locations = vec![
            Location::new("Pune", "PUNE", &["PCMC", "Pimpri Chinchwad", "Poona"]),
            Location::new("Sangli", "SNGL", &["Sangali", "Sangli Miraj"]),
            Location::new("Kolhapur", "KOP", &["Kolapur", "Kolhapure"]),
            Location::new("Satara", "STR", &["Sattara"]),
            Location::new("Mumbai", "MUM", &["Bombay", "Mumabi"]),
            Location::new("Nashik", "NSK", &["Nasik"]),
            Location::new("Solapur", "SLP", &["Sholapur"]),
            Location::new("Aurangabad", "AURBD", &["Aurangbad", "Chhatrapati Sambhajinagar"]),
        ];
        // The built-in table is validated by the tests below.
        match Self::new(locations) {
            Ok(registry) => registry,
            Err(e) => unreachable!("built-in branch table is invalid: {e}"),
        }
    }

    /// Resolve a free-form branch name (or alias) to its canonical name.
    pub fn canonicalize(&self, name: &str) -> Option<&str> {
        self.by_name
            .get(&fold(name))
            .map(|&idx| self.locations[idx].name.as_str())
    }

    pub fn short_code_of(&self, canonical: &str) -> Option<&str> {
        self.by_name
            .get(&fold(canonical))
            .map(|&idx| self.locations[idx].code.as_str())
    }

    pub fn name_from_code(&self, code: &str) -> Option<&str> {
        self.by_code
            .get(code)
            .map(|&idx| self.locations[idx].name.as_str())
    }

    pub fn contains_code(&self, code: &str) -> bool {
        self.by_code.contains_key(code)
    }

    /// Canonical names in table order.
    pub fn branches(&self) -> impl Iterator<Item = &str> {
        self.locations.iter().map(|l| l.name.as_str())
    }

    pub fn locations(&self) -> &[Location] {
        &self.locations
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}
