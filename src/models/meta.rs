use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identity and bookkeeping shared by every persisted record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    /// Empty for records that are not namespaced.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default = "Utc::now")]
    pub creation_timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            creation_timestamp: Utc::now(),
            ..Default::default()
        }
    }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Self::named(name)
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Workqueue key: `namespace/name`, or just `name` for cluster-scoped records.
    pub fn key(&self) -> String {
        object_key(&self.namespace, &self.name)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

pub fn object_key(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", namespace, name)
    }
}

/// Splits a workqueue key back into `(namespace, name)`.
pub fn split_key(key: &str) -> (&str, &str) {
    match key.split_once('/') {
        Some((ns, name)) => (ns, name),
        None => ("", key),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionStatus::True => write!(f, "True"),
            ConditionStatus::False => write!(f, "False"),
            ConditionStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
}

/// Ordered condition list with by-type accessors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conditions(pub Vec<Condition>);

impl Conditions {
    pub fn get(&self, kind: &str) -> Option<&Condition> {
        self.0.iter().find(|c| c.kind == kind)
    }

    pub fn status(&self, kind: &str) -> Option<ConditionStatus> {
        self.get(kind).map(|c| c.status)
    }

    pub fn is_true(&self, kind: &str) -> bool {
        self.status(kind) == Some(ConditionStatus::True)
    }

    pub fn is_false(&self, kind: &str) -> bool {
        self.status(kind) == Some(ConditionStatus::False)
    }

    pub fn is_unknown(&self, kind: &str) -> bool {
        self.status(kind) == Some(ConditionStatus::Unknown)
    }

    pub fn message(&self, kind: &str) -> &str {
        self.get(kind).map(|c| c.message.as_str()).unwrap_or("")
    }

    fn entry(&mut self, kind: &str) -> &mut Condition {
        let idx = match self.0.iter().position(|c| c.kind == kind) {
            Some(idx) => idx,
            None => {
                self.0.push(Condition {
                    kind: kind.to_string(),
                    status: ConditionStatus::Unknown,
                    reason: String::new(),
                    message: String::new(),
                    last_update_time: None,
                });
                self.0.len() - 1
            }
        };
        &mut self.0[idx]
    }

    pub fn set_status(&mut self, kind: &str, status: ConditionStatus) {
        let cond = self.entry(kind);
        if cond.status != status || cond.last_update_time.is_none() {
            cond.last_update_time = Some(Utc::now());
        }
        cond.status = status;
    }

    pub fn set_true(&mut self, kind: &str) {
        self.set_status(kind, ConditionStatus::True);
    }

    pub fn set_false(&mut self, kind: &str) {
        self.set_status(kind, ConditionStatus::False);
    }

    pub fn set_unknown(&mut self, kind: &str) {
        self.set_status(kind, ConditionStatus::Unknown);
    }

    pub fn set_message(&mut self, kind: &str, message: impl Into<String>) {
        self.entry(kind).message = message.into();
    }

    pub fn set_reason(&mut self, kind: &str, reason: impl Into<String>) {
        self.entry(kind).reason = reason.into();
    }

    /// Adds the condition as `Unknown` only when it is absent.
    pub fn create_unknown_if_not_exists(&mut self, kind: &str) {
        if self.get(kind).is_none() {
            self.set_unknown(kind);
        }
    }

    /// Records a failure on the condition: status False with reason and message.
    pub fn fail(&mut self, kind: &str, reason: &str, message: impl Into<String>) {
        self.set_false(kind);
        self.set_reason(kind, reason);
        self.set_message(kind, message);
    }

    pub fn clear(&mut self, kind: &str) {
        let cond = self.entry(kind);
        cond.reason.clear();
        cond.message.clear();
    }
}
