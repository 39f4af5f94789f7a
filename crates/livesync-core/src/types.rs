//! Core domain types shared by the pipeline, the orchestrator and the device layer

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

// ─────────────────────────────────────────────────────────────────
// Platform
// ─────────────────────────────────────────────────────────────────

/// Target mobile platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Ios,
}

impl Platform {
    pub const ALL: [Platform; 2] = [Platform::Android, Platform::Ios];

    /// Lowercase identifier used in paths and config keys
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Android => "android",
            Platform::Ios => "ios",
        }
    }

    /// Name used for display and for the `App_Resources/<Platform>` directory
    pub fn display_name(&self) -> &'static str {
        match self {
            Platform::Android => "Android",
            Platform::Ios => "iOS",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "android" => Ok(Platform::Android),
            "ios" => Ok(Platform::Ios),
            _ => Err(Error::InvalidPlatform {
                value: s.to_string(),
            }),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Change descriptors
// ─────────────────────────────────────────────────────────────────

/// Hot update token produced by the compiler for an in-place code update
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HotUpdate {
    /// Hash the device reports back once the update was applied (or rejected)
    pub hash: String,
    /// Files to sync instead when the hot update cannot be applied
    #[serde(default)]
    pub fallback_files: Vec<PathBuf>,
}

/// What changed in a project and whether it needs a native rebuild
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChangeDescriptor {
    pub platform: Platform,
    #[serde(default)]
    pub files: Vec<PathBuf>,
    #[serde(default)]
    pub removed_files: Vec<PathBuf>,
    #[serde(default)]
    pub has_native_changes: bool,
    #[serde(default)]
    pub hot_update: Option<HotUpdate>,
}

impl ChangeDescriptor {
    /// Descriptor for compiled/emitted files
    pub fn files(platform: Platform, files: Vec<PathBuf>, removed_files: Vec<PathBuf>) -> Self {
        Self {
            platform,
            files,
            removed_files,
            has_native_changes: false,
            hot_update: None,
        }
    }

    /// Descriptor for a change in native sources (manifest, resources, plugins)
    pub fn native(platform: Platform, files: Vec<PathBuf>) -> Self {
        Self {
            platform,
            files,
            removed_files: Vec::new(),
            has_native_changes: true,
            hot_update: None,
        }
    }

    pub fn with_hot_update(mut self, hot_update: HotUpdate) -> Self {
        self.hot_update = Some(hot_update);
        self
    }

    pub fn is_hot_update(&self) -> bool {
        self.hot_update.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.removed_files.is_empty() && !self.has_native_changes
    }

    /// Fold a later descriptor for the same platform into this one.
    ///
    /// Files are unioned (order of first appearance kept) and the native flag
    /// is OR-ed. The hot update survives only when both sides carry one; the
    /// newer hash wins and fallback files are unioned. A file removed by the
    /// newer descriptor is no longer reported as changed, and vice versa.
    pub fn merge(&mut self, newer: ChangeDescriptor) {
        debug_assert_eq!(self.platform, newer.platform);

        self.files.retain(|f| !newer.removed_files.contains(f));
        self.removed_files.retain(|f| !newer.files.contains(f));
        push_unique(&mut self.files, newer.files);
        push_unique(&mut self.removed_files, newer.removed_files);
        self.has_native_changes |= newer.has_native_changes;

        self.hot_update = match (self.hot_update.take(), newer.hot_update) {
            (Some(mut older), Some(newer)) => {
                push_unique(&mut older.fallback_files, newer.fallback_files);
                older.hash = newer.hash;
                Some(older)
            }
            _ => None,
        };
    }
}

fn push_unique(target: &mut Vec<PathBuf>, items: Vec<PathBuf>) {
    let mut seen: BTreeSet<PathBuf> = target.iter().cloned().collect();
    for item in items {
        if seen.insert(item.clone()) {
            target.push(item);
        }
    }
}

/// Outcome of a prepare pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PrepareResult {
    pub platform: Platform,
    pub has_native_changes: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_from_str() {
        assert_eq!("android".parse::<Platform>().unwrap(), Platform::Android);
        assert_eq!("iOS".parse::<Platform>().unwrap(), Platform::Ios);
        assert!(matches!(
            "windows".parse::<Platform>(),
            Err(Error::InvalidPlatform { .. })
        ));
    }

    #[test]
    fn test_platform_display() {
        assert_eq!(Platform::Android.to_string(), "Android");
        assert_eq!(Platform::Ios.to_string(), "iOS");
        assert_eq!(Platform::Ios.as_str(), "ios");
    }

    #[test]
    fn test_merge_unions_files_and_native_flag() {
        let mut first = ChangeDescriptor::files(
            Platform::Android,
            vec![PathBuf::from("app/a.js")],
            vec![],
        );
        first.merge(ChangeDescriptor::native(
            Platform::Android,
            vec![PathBuf::from("app/a.js"), PathBuf::from("package.json")],
        ));

        assert_eq!(
            first.files,
            vec![PathBuf::from("app/a.js"), PathBuf::from("package.json")]
        );
        assert!(first.has_native_changes);
    }

    #[test]
    fn test_merge_keeps_hot_update_only_when_both_have_one() {
        let hot = |hash: &str, fallback: &str| {
            ChangeDescriptor::files(Platform::Ios, vec![PathBuf::from("bundle.js")], vec![])
                .with_hot_update(HotUpdate {
                    hash: hash.to_string(),
                    fallback_files: vec![PathBuf::from(fallback)],
                })
        };

        let mut merged = hot("h1", "vendor.js");
        merged.merge(hot("h2", "runtime.js"));
        let update = merged.hot_update.clone().unwrap();
        assert_eq!(update.hash, "h2");
        assert_eq!(
            update.fallback_files,
            vec![PathBuf::from("vendor.js"), PathBuf::from("runtime.js")]
        );

        merged.merge(ChangeDescriptor::files(
            Platform::Ios,
            vec![PathBuf::from("style.css")],
            vec![],
        ));
        assert!(!merged.is_hot_update());
    }

    #[test]
    fn test_merge_removal_overrides_earlier_change() {
        let mut first = ChangeDescriptor::files(
            Platform::Android,
            vec![PathBuf::from("app/old.js")],
            vec![],
        );
        first.merge(ChangeDescriptor::files(
            Platform::Android,
            vec![],
            vec![PathBuf::from("app/old.js")],
        ));

        assert!(first.files.is_empty());
        assert_eq!(first.removed_files, vec![PathBuf::from("app/old.js")]);
    }

    #[test]
    fn test_descriptor_serializes_snake_case_fields() {
        let descriptor = ChangeDescriptor::native(Platform::Android, vec![]);
        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["platform"], "android");
        assert_eq!(json["has_native_changes"], true);
    }
}
