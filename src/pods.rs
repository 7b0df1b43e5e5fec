//! Pod cache access and label selector matching
//!
//! Scalers read pods through a [`PodLister`]: a non-blocking view backed
//! by a shared reflector store. The selector type parses the string form
//! published on the scale sub-resource (`scale.status.selector`).

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::Store;
use kube::ResourceExt;

#[cfg(test)]
use mockall::automock;

use crate::error::Error;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Op {
    Eq,
    NotEq,
    In,
    NotIn,
    Exists,
    NotExists,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Requirement {
    key: String,
    op: Op,
    values: Vec<String>,
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.op {
            Op::Eq | Op::In => value.map(|v| self.values.contains(v)).unwrap_or(false),
            Op::NotEq | Op::NotIn => value.map(|v| !self.values.contains(v)).unwrap_or(true),
            Op::Exists => value.is_some(),
            Op::NotExists => value.is_none(),
        }
    }
}

/// Parsed label selector in the string form the scale sub-resource
/// publishes (`app=web,tier in (api,worker),!canary`)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selector {
    raw: String,
    requirements: Vec<Requirement>,
}

/// Split on commas that sit outside `(...)` groups
fn split_requirements(raw: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for ch in raw.chars() {
        match ch {
            '(' => {
                depth += 1;
                current.push(ch);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            ',' if depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

fn parse_set_values(raw: &str, token: &str) -> Result<Vec<String>, Error> {
    let inner = raw
        .strip_prefix('(')
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(|| Error::validation(format!("invalid selector requirement `{token}`")))?;
    Ok(inner
        .split(',')
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect())
}

fn parse_requirement(token: &str) -> Result<Requirement, Error> {
    if let Some((key, rest)) = token.split_once(" notin ") {
        return Ok(Requirement {
            key: key.trim().to_string(),
            op: Op::NotIn,
            values: parse_set_values(rest.trim(), token)?,
        });
    }
    if let Some((key, rest)) = token.split_once(" in ") {
        return Ok(Requirement {
            key: key.trim().to_string(),
            op: Op::In,
            values: parse_set_values(rest.trim(), token)?,
        });
    }
    if let Some((key, value)) = token.split_once("!=") {
        return Ok(Requirement {
            key: key.trim().to_string(),
            op: Op::NotEq,
            values: vec![value.trim().to_string()],
        });
    }
    if let Some((key, value)) = token.split_once("==") {
        return Ok(Requirement {
            key: key.trim().to_string(),
            op: Op::Eq,
            values: vec![value.trim().to_string()],
        });
    }
    if let Some((key, value)) = token.split_once('=') {
        return Ok(Requirement {
            key: key.trim().to_string(),
            op: Op::Eq,
            values: vec![value.trim().to_string()],
        });
    }
    if let Some(key) = token.strip_prefix('!') {
        return Ok(Requirement {
            key: key.trim().to_string(),
            op: Op::NotExists,
            values: Vec::new(),
        });
    }
    if token.contains(|c: char| c.is_whitespace() || c == '(' || c == ')') {
        return Err(Error::validation(format!(
            "invalid selector requirement `{token}`"
        )));
    }
    Ok(Requirement {
        key: token.to_string(),
        op: Op::Exists,
        values: Vec::new(),
    })
}

impl Selector {
    /// Parse the selector string; an empty string matches everything
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let mut requirements = Vec::new();
        for token in split_requirements(raw) {
            let requirement = parse_requirement(&token)?;
            if requirement.key.is_empty() {
                return Err(Error::validation(format!(
                    "invalid selector requirement `{token}`"
                )));
            }
            requirements.push(requirement);
        }
        Ok(Self {
            raw: raw.to_string(),
            requirements,
        })
    }

    /// True when every requirement is satisfied by `labels`
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }

    /// The original string form, usable server-side
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Non-blocking read access to the shared pod cache
#[cfg_attr(test, automock)]
pub trait PodLister: Send + Sync {
    /// Pods in `namespace` matching `selector`
    fn list(&self, namespace: &str, selector: &Selector) -> Result<Vec<Pod>, Error>;
}

/// Pod lister backed by a kube reflector store
pub struct StorePodLister {
    store: Store<Pod>,
}

impl StorePodLister {
    pub fn new(store: Store<Pod>) -> Self {
        Self { store }
    }
}

impl PodLister for StorePodLister {
    fn list(&self, namespace: &str, selector: &Selector) -> Result<Vec<Pod>, Error> {
        let empty = BTreeMap::new();
        Ok(self
            .store
            .state()
            .into_iter()
            .filter(|pod| pod.namespace().as_deref() == Some(namespace))
            .filter(|pod| {
                selector.matches(pod.metadata.labels.as_ref().unwrap_or(&empty))
            })
            .map(|pod: Arc<Pod>| (*pod).clone())
            .collect())
    }
}
