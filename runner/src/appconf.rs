use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    fmt::{self, Write as _},
    fs,
    io::Write,
    path::Path,
    str::FromStr,
};
use thiserror::Error;
use tracing::debug;

pub const GENERAL: &str = "general";

static PAT_MODEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:namelist:)?models?\(([^\)]+)\)$").unwrap());
static PAT_DIAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:namelist:)?diags?\(([^\)]+)\)$").unwrap());

#[derive(Error, Debug)]
pub enum AppConfError {
    #[error("Failed to access configuration file")]
    Io(#[from] std::io::Error),
    #[error("Line {line}: {reason}")]
    Parse { line: usize, reason: &'static str },
}

/// Ordered key/value pairs of a single section
pub type Section = IndexMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionKind<'a> {
    General,
    Model(&'a str),
    Diag(&'a str),
    Other,
}

impl<'a> SectionKind<'a> {
    pub fn of(name: &'a str) -> Self {
        if name == GENERAL {
            Self::General
        } else if let Some(found) = PAT_MODEL.captures(name).and_then(|c| c.get(1)) {
            Self::Model(found.as_str())
        } else if let Some(found) = PAT_DIAG.captures(name).and_then(|c| c.get(1)) {
            Self::Diag(found.as_str())
        } else {
            Self::Other
        }
    }
}

/// Application configuration in (a subset of) the Rose extended INI format.
///
/// Sections and keys keep their insertion order, so writing a configuration
/// that was read unchanged reproduces the same sections in the same order.
/// Comments are not preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppConf {
    sections: IndexMap<String, Section>,
}

impl AppConf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(path: &Path) -> Result<Self, AppConfError> {
        let content = fs::read_to_string(path)?;
        debug!(path = ?path, "Read configuration ({} bytes)", content.len());

        content.parse()
    }

    pub fn write(&self, path: &Path) -> Result<(), AppConfError> {
        let mut file = fs::File::create(path)?;
        file.write_all(self.to_string().as_bytes())?;
        file.sync_all()?;

        Ok(())
    }

    pub fn sections(&self) -> impl Iterator<Item = (&String, &Section)> {
        self.sections.iter()
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.get(name)
    }

    /// Returns the named section, appending an empty one if absent
    pub fn section_mut(&mut self, name: &str) -> &mut Section {
        self.sections.entry(name.to_owned()).or_default()
    }

    pub fn insert_section(&mut self, name: &str, section: Section) {
        self.sections.insert(name.to_owned(), section);
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|values| values.get(key))
            .map(String::as_str)
    }

    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        self.section_mut(section).insert(key.to_owned(), value.into());
    }

    /// Names of all model sections paired with the full section name, in file order
    pub fn models(&self) -> Vec<(&str, &str)> {
        self.sections
            .keys()
            .filter_map(|name| match SectionKind::of(name) {
                SectionKind::Model(model) => Some((model, name.as_str())),
                _ => None,
            })
            .collect()
    }

    /// Names of all diagnostic sections paired with the full section name, in file order
    pub fn diags(&self) -> Vec<(&str, &str)> {
        self.sections
            .keys()
            .filter_map(|name| match SectionKind::of(name) {
                SectionKind::Diag(diag) => Some((diag, name.as_str())),
                _ => None,
            })
            .collect()
    }

    pub fn model_names(&self) -> Vec<String> {
        self.models()
            .into_iter()
            .map(|(name, _)| name.to_owned())
            .collect()
    }

    pub fn diag_names(&self) -> Vec<String> {
        self.diags()
            .into_iter()
            .map(|(name, _)| name.to_owned())
            .collect()
    }
}

/// `enabled=false` (or the namelist spelling `.false.`) disables a section
pub fn is_enabled(section: &Section) -> bool {
    !matches!(
        section
            .get("enabled")
            .map(|value| value.trim().to_lowercase())
            .as_deref(),
        Some("false" | ".false.")
    )
}

impl FromStr for AppConf {
    type Err = AppConfError;

    fn from_str(content: &str) -> Result<Self, Self::Err> {
        let mut conf = AppConf::new();
        let mut current = String::new();
        let mut last_key: Option<String> = None;

        for (number, raw) in content.lines().enumerate() {
            let line = raw.trim();

            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            // continuation of the previous value
            if raw.starts_with(char::is_whitespace) {
                match last_key {
                    Some(ref key) => {
                        let value = conf
                            .section_mut(&current)
                            .get_mut(key)
                            .ok_or(AppConfError::Parse {
                                line: number + 1,
                                reason: "continuation without a key",
                            })?;
                        value.push('\n');
                        value.push_str(line);

                        continue;
                    }
                    None => {
                        return Err(AppConfError::Parse {
                            line: number + 1,
                            reason: "continuation without a key",
                        })
                    }
                }
            }

            if let Some(header) = line.strip_prefix('[') {
                let name = header.strip_suffix(']').ok_or(AppConfError::Parse {
                    line: number + 1,
                    reason: "unterminated section header",
                })?;

                current = name.trim().to_owned();
                conf.section_mut(&current);
                last_key = None;
            } else if let Some((key, value)) = line.split_once('=') {
                let key = key.trim().to_owned();

                if key.is_empty() {
                    return Err(AppConfError::Parse {
                        line: number + 1,
                        reason: "empty key",
                    });
                }

                conf.set(&current, &key, value.trim());
                last_key = Some(key);
            } else {
                return Err(AppConfError::Parse {
                    line: number + 1,
                    reason: "expected a section header or key=value",
                });
            }
        }

        Ok(conf)
    }
}

impl fmt::Display for AppConf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();

        // the unnamed root section has no header and has to come first
        let root = self.sections.get("").into_iter().map(|s| ("", s));
        let named = self
            .sections
            .iter()
            .filter(|(name, _)| !name.is_empty())
            .map(|(name, s)| (name.as_str(), s));

        for (name, section) in root.chain(named) {
            if !name.is_empty() {
                if !out.is_empty() {
                    out.push('\n');
                }
                writeln!(out, "[{name}]")?;
            }

            for (key, value) in section {
                let mut lines = value.split('\n');
                writeln!(out, "{key}={}", lines.next().unwrap_or_default())?;

                for continuation in lines {
                    writeln!(out, "    {continuation}")?;
                }
            }
        }

        f.write_str(&out)
    }
}
