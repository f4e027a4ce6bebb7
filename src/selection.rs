//! Selection engine: which CDM descriptor serves a piece of content.
//!
//! The `cdm` config section is compiled once into [`SelectionRules`]. Quality
//! keys (`"1080"`, `">=1080"`, `">1080"`, `"<=1080"`, `"<1080"`) become typed
//! [`QualityRule`]s kept in declaration order; the first matching rule wins.
//!
//! Resolution consults, highest priority first:
//!
//! 1. the profile map,
//! 2. the DRM sub-table (its quality rules, then its `default`),
//! 3. the service's top-level quality rules,
//! 4. the service `default`,
//! 5. the global `default`.
//!
//! Only the first level that matches is returned. Falling back across
//! unreachable candidates is the job of [`crate::sequencer`].
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde_yaml::{Mapping, Value};

use crate::drm::DrmType;
use crate::error::{Error, Result};

const DEFAULT_KEY: &str = "default";

/// Comparison applied by a [`QualityRule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityOp {
    Eq,
    Ge,
    Gt,
    Le,
    Lt,
}

/// A quality threshold on the content's maximum video height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityRule {
    pub op: QualityOp,
    pub height: u32,
}

impl QualityRule {
    pub fn matches(&self, height: u32) -> bool {
        match self.op {
            QualityOp::Eq => height == self.height,
            QualityOp::Ge => height >= self.height,
            QualityOp::Gt => height > self.height,
            QualityOp::Le => height <= self.height,
            QualityOp::Lt => height < self.height,
        }
    }

    /// Whether a config key looks like a quality rule at all.
    fn looks_like_rule(key: &str) -> bool {
        let digits = key.trim_start_matches(['>', '<', '=']).trim();
        !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
    }
}

impl FromStr for QualityRule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (op, rest) = if let Some(rest) = s.strip_prefix(">=") {
            (QualityOp::Ge, rest)
        } else if let Some(rest) = s.strip_prefix("<=") {
            (QualityOp::Le, rest)
        } else if let Some(rest) = s.strip_prefix('>') {
            (QualityOp::Gt, rest)
        } else if let Some(rest) = s.strip_prefix('<') {
            (QualityOp::Lt, rest)
        } else {
            (QualityOp::Eq, s)
        };
        let height = rest
            .trim()
            .parse::<u32>()
            .map_err(|_| Error::Config(format!("Invalid quality rule '{}'", s)))?;
        Ok(Self { op, height })
    }
}

impl fmt::Display for QualityRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.op {
            QualityOp::Eq => "",
            QualityOp::Ge => ">=",
            QualityOp::Gt => ">",
            QualityOp::Le => "<=",
            QualityOp::Lt => "<",
        };
        write!(f, "{}{}", op, self.height)
    }
}

/// Ordered quality rules with an optional fallback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QualityTable {
    pub rules: Vec<(QualityRule, String)>,
    pub default: Option<String>,
}

impl QualityTable {
    fn first_match(rules: &[(QualityRule, String)], height: Option<u32>) -> Option<(&QualityRule, &str)> {
        let height = height?;
        rules
            .iter()
            .find(|(rule, _)| rule.matches(height))
            .map(|(rule, name)| (rule, name.as_str()))
    }
}

/// Compiled selection table for one service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionTable {
    /// Profile → descriptor, in declaration order.
    pub profiles: Vec<(String, String)>,
    pub drm: HashMap<DrmType, QualityTable>,
    pub quality_rules: Vec<(QualityRule, String)>,
    pub default: Option<String>,
}

impl SelectionTable {
    /// Every descriptor name referenced by this table, in declaration order.
    pub fn referenced(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        names.extend(self.profiles.iter().map(|(_, n)| n.as_str()));
        for drm in [DrmType::Widevine, DrmType::PlayReady] {
            if let Some(table) = self.drm.get(&drm) {
                names.extend(table.rules.iter().map(|(_, n)| n.as_str()));
                names.extend(table.default.as_deref());
            }
        }
        names.extend(self.quality_rules.iter().map(|(_, n)| n.as_str()));
        names.extend(self.default.as_deref());
        names
    }

    fn from_value(service: &str, value: &Value) -> Result<Self> {
        match value {
            Value::String(name) => Ok(Self {
                default: Some(name.clone()),
                ..Self::default()
            }),
            Value::Mapping(map) => Self::from_mapping(service, map),
            Value::Null => Ok(Self::default()),
            _ => Err(Error::Config(format!(
                "cdm.{}: expected a CDM name or a mapping",
                service
            ))),
        }
    }

    fn from_mapping(service: &str, map: &Mapping) -> Result<Self> {
        let mut table = Self::default();
        for (key, value) in map {
            let key = key_string(key)
                .ok_or_else(|| Error::Config(format!("cdm.{}: invalid key {:?}", service, key)))?;
            let at = format!("{}.{}", service, key);

            if key == DEFAULT_KEY {
                table.default = Some(descriptor_name(&at, value)?);
            } else if let Some(drm) = drm_key(&key) {
                if table.drm.insert(drm, parse_quality_table(&at, value)?).is_some() {
                    return Err(Error::Config(format!("cdm.{}: duplicate DRM table", at)));
                }
            } else if QualityRule::looks_like_rule(&key) {
                let rule = key.parse::<QualityRule>()?;
                table.quality_rules.push((rule, descriptor_name(&at, value)?));
            } else {
                table.profiles.push((key, descriptor_name(&at, value)?));
            }
        }
        Ok(table)
    }
}

/// Only the full scheme names introduce a DRM sub-table; anything shorter is
/// a profile name.
fn drm_key(key: &str) -> Option<DrmType> {
    match key.to_ascii_lowercase().as_str() {
        "widevine" => Some(DrmType::Widevine),
        "playready" => Some(DrmType::PlayReady),
        _ => None,
    }
}

fn parse_quality_table(at: &str, value: &Value) -> Result<QualityTable> {
    let map = match value {
        Value::String(name) => {
            return Ok(QualityTable {
                rules: Vec::new(),
                default: Some(name.clone()),
            })
        }
        Value::Mapping(map) => map,
        _ => {
            return Err(Error::Config(format!(
                "cdm.{}: expected a CDM name or quality mapping",
                at
            )))
        }
    };

    let mut table = QualityTable::default();
    for (key, value) in map {
        let key = key_string(key)
            .ok_or_else(|| Error::Config(format!("cdm.{}: invalid key {:?}", at, key)))?;
        let nested = format!("{}.{}", at, key);
        if key == DEFAULT_KEY {
            table.default = Some(descriptor_name(&nested, value)?);
        } else {
            let rule = key.parse::<QualityRule>()?;
            table.rules.push((rule, descriptor_name(&nested, value)?));
        }
    }
    Ok(table)
}

/// Mapping keys may be YAML strings or bare integers (`1080:`).
fn key_string(key: &Value) -> Option<String> {
    match key {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => n.as_u64().map(|n| n.to_string()),
        _ => None,
    }
}

fn descriptor_name(at: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        _ => Err(Error::Config(format!(
            "cdm.{}: expected a CDM name",
            at
        ))),
    }
}

/// Which level of the table produced a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionLevel {
    Profile,
    DrmQuality,
    DrmDefault,
    Quality,
    ServiceDefault,
    GlobalDefault,
}

/// What the selector needs to know about the content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionContext {
    pub service: String,
    /// `None` means the default profile.
    pub profile: Option<String>,
    /// Detected maximum video height.
    pub quality: Option<u32>,
    pub drm_type: Option<DrmType>,
}

impl SelectionContext {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            profile: None,
            quality: None,
            drm_type: None,
        }
    }

    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    pub fn quality(mut self, height: u32) -> Self {
        self.quality = Some(height);
        self
    }

    pub fn drm(mut self, drm_type: DrmType) -> Self {
        self.drm_type = Some(drm_type);
        self
    }
}

/// The single primary candidate chosen for a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Descriptor name.
    pub descriptor: String,
    pub level: SelectionLevel,
    /// Every level consulted, ending with the one that matched.
    pub trail: Vec<String>,
}

/// Compiled `cdm` section: per-service tables plus the global default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionRules {
    services: HashMap<String, SelectionTable>,
    default: Option<String>,
}

impl SelectionRules {
    /// Compile the raw `cdm` mapping.
    pub fn from_mapping(map: &Mapping) -> Result<Self> {
        let mut rules = Self::default();
        for (key, value) in map {
            let key = key_string(key)
                .ok_or_else(|| Error::Config(format!("cdm: invalid service key {:?}", key)))?;
            if key == DEFAULT_KEY {
                rules.default = Some(descriptor_name(DEFAULT_KEY, value)?);
                continue;
            }
            let table = SelectionTable::from_value(&key, value)?;
            rules.services.insert(key, table);
        }
        Ok(rules)
    }

    pub fn table(&self, service: &str) -> Option<&SelectionTable> {
        self.services.get(service)
    }

    pub fn global_default(&self) -> Option<&str> {
        self.default.as_deref()
    }

    pub fn services(&self) -> impl Iterator<Item = (&String, &SelectionTable)> {
        self.services.iter()
    }

    /// Every descriptor name referenced anywhere in the rules.
    pub fn referenced(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .services
            .values()
            .flat_map(SelectionTable::referenced)
            .collect();
        names.extend(self.default.as_deref());
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Resolve the primary descriptor for a context.
    ///
    /// Pure and deterministic: identical inputs against the same rules always
    /// yield the same [`Resolution`].
    pub fn resolve(&self, ctx: &SelectionContext) -> Result<Resolution> {
        let mut trail = Vec::new();
        let hit = |descriptor: &str, level, trail: Vec<String>| Resolution {
            descriptor: descriptor.to_string(),
            level,
            trail,
        };

        if let Some(table) = self.services.get(&ctx.service) {
            if let Some(profile) = ctx.profile.as_deref() {
                trail.push(format!("profile[{}]", profile));
                if let Some((_, name)) = table.profiles.iter().find(|(p, _)| p == profile) {
                    return Ok(hit(name, SelectionLevel::Profile, trail));
                }
            }

            if let Some(drm) = ctx.drm_type {
                if let Some(drm_table) = table.drm.get(&drm) {
                    trail.push(format!("{}.quality[{}]", drm, display_height(ctx.quality)));
                    if let Some((rule, name)) = QualityTable::first_match(&drm_table.rules, ctx.quality) {
                        trail.push(format!("{}.\"{}\"", drm, rule));
                        return Ok(hit(name, SelectionLevel::DrmQuality, trail));
                    }
                    trail.push(format!("{}.default", drm));
                    if let Some(name) = drm_table.default.as_deref() {
                        return Ok(hit(name, SelectionLevel::DrmDefault, trail));
                    }
                }
            }

            trail.push(format!("quality[{}]", display_height(ctx.quality)));
            if let Some((rule, name)) = QualityTable::first_match(&table.quality_rules, ctx.quality) {
                trail.push(format!("\"{}\"", rule));
                return Ok(hit(name, SelectionLevel::Quality, trail));
            }

            trail.push(format!("{}.default", ctx.service));
            if let Some(name) = table.default.as_deref() {
                return Ok(hit(name, SelectionLevel::ServiceDefault, trail));
            }
        } else {
            trail.push(format!("{} (no table)", ctx.service));
        }

        trail.push("default".to_string());
        if let Some(name) = self.default.as_deref() {
            return Ok(hit(name, SelectionLevel::GlobalDefault, trail));
        }

        Err(Error::SelectionExhausted {
            service: ctx.service.clone(),
            trail,
        })
    }
}

fn display_height(height: Option<u32>) -> String {
    height.map_or_else(|| "unknown".to_string(), |h| h.to_string())
}
