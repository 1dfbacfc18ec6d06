//! Projection of id_token claims onto the application identity.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

use super::config::OidcConfig;

/// Canonical claim holding the display name.
pub const NAME_CLAIM: &str = "name";
/// Canonical claim holding roles.
pub const ROLE_CLAIM: &str = "role";

/// Application-facing identity: canonical claim name -> values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimSet {
    claims: BTreeMap<String, Vec<String>>,
}

impl ClaimSet {
    /// First value of a claim.
    pub fn get(&self, claim: &str) -> Option<&str> {
        self.claims
            .get(claim)
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    /// All values of a claim.
    pub fn get_all(&self, claim: &str) -> &[String] {
        self.claims.get(claim).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn name(&self) -> Option<&str> {
        self.get(NAME_CLAIM)
    }

    pub fn roles(&self) -> &[String] {
        self.get_all(ROLE_CLAIM)
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles().iter().any(|r| r == role)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.claims.iter()
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    fn push(&mut self, claim: &str, values: Vec<String>) {
        if values.is_empty() {
            return;
        }
        let entry = self.claims.entry(claim.to_string()).or_default();
        for value in values {
            if !entry.contains(&value) {
                entry.push(value);
            }
        }
    }
}

/// Maps provider claim names to canonical ones. Claim names are never
/// rewritten to legacy URI forms.
#[derive(Debug, Clone)]
pub struct ClaimsProjector {
    name_claim: String,
    role_claim: String,
    mapping: HashMap<String, String>,
    filtered: HashSet<String>,
}

impl ClaimsProjector {
    pub fn new(
        name_claim: &str,
        role_claim: &str,
        mapping: HashMap<String, String>,
        filtered: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            name_claim: name_claim.to_string(),
            role_claim: role_claim.to_string(),
            mapping,
            filtered: filtered.into_iter().collect(),
        }
    }

    pub fn from_config(config: &OidcConfig) -> Self {
        Self::new(
            &config.name_claim_type,
            &config.role_claim_type,
            config.claim_mapping.clone(),
            config.filtered_claims.iter().cloned(),
        )
    }

    /// Project raw claims. Pure: identical input gives identical output.
    pub fn project(&self, claims: &HashMap<String, Value>) -> ClaimSet {
        let mut set = ClaimSet::default();

        for (key, value) in claims {
            if self.filtered.contains(key) {
                continue;
            }

            let canonical = if *key == self.name_claim {
                NAME_CLAIM
            } else if *key == self.role_claim {
                ROLE_CLAIM
            } else if let Some(mapped) = self.mapping.get(key) {
                mapped.as_str()
            } else {
                key.as_str()
            };

            set.push(canonical, claim_values(value));
        }

        set
    }
}

/// Project with the configured name and role claim types only.
pub fn project(claims: &HashMap<String, Value>, name_claim: &str, role_claim: &str) -> ClaimSet {
    ClaimsProjector::new(name_claim, role_claim, HashMap::new(), Vec::new()).project(claims)
}

fn claim_values(value: &Value) -> Vec<String> {
    match value {
        Value::Null => Vec::new(),
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items.iter().flat_map(claim_values).collect(),
        Value::Bool(b) => vec![b.to_string()],
        Value::Number(n) => vec![n.to_string()],
        Value::Object(_) => vec![value.to_string()],
    }
}
