//! Target platform identity and its canonical encoding.

use serde::{Deserialize, Serialize};

/// A build/runtime platform triple, with optional variant/OS-version
/// refinement and a feature set (e.g. CPU microarchitecture flags).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub arch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(default)]
    pub os_features: Vec<String>,
}

impl Platform {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
            variant: None,
            os_version: None,
            os_features: Vec::new(),
        }
    }

    /// Canonical JSON encoding: sorted keys, `osFeatures` sorted, and
    /// absent optional fields omitted rather than encoded as `null`
    /// (see §4.6.1 / §9).
    pub fn canonical_json(&self) -> String {
        let mut features = self.os_features.clone();
        features.sort();

        // serde_json::Map with insertion order gives us explicit
        // control over key ordering without depending on a
        // preserve_order feature flag.
        let mut obj = serde_json::Map::new();
        obj.insert("arch".to_string(), serde_json::Value::String(self.arch.clone()));
        obj.insert("os".to_string(), serde_json::Value::String(self.os.clone()));
        if let Some(v) = &self.os_version {
            obj.insert("osVersion".to_string(), serde_json::Value::String(v.clone()));
        }
        obj.insert(
            "osFeatures".to_string(),
            serde_json::Value::Array(features.into_iter().map(serde_json::Value::String).collect()),
        );
        if let Some(v) = &self.variant {
            obj.insert("variant".to_string(), serde_json::Value::String(v.clone()));
        }

        let mut keys: Vec<&String> = obj.keys().collect();
        keys.sort();
        let mut out = String::from("{");
        for (i, key) in keys.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&serde_json::to_string(key).unwrap());
            out.push(':');
            out.push_str(&serde_json::to_string(&obj[*key]).unwrap());
        }
        out.push('}');
        out
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.variant, &self.os_version) {
            (Some(v), _) => write!(f, "{}/{}/{v}", self.os, self.arch),
            _ => write!(f, "{}/{}", self.os, self.arch),
        }
    }
}
