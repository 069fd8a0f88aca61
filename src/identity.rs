//! Entity identity: GUIDs, descriptors, and the name-triple fingerprint
//! used to detect renames across reconcile ticks.

use serde::{Deserialize, Serialize};

/// Platform state of an app. Only `Started` apps are tracked by the
/// App Discovery Loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AppState {
    Started,
    Stopped,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppDescriptor {
    pub guid: String,
    pub name: String,
    pub space_name: String,
    pub org_name: String,
    pub instances: u32,
    pub state: AppState,
}

impl AppDescriptor {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            name: self.name.clone(),
            space_name: self.space_name.clone(),
            org_name: self.org_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub guid: String,
    pub name: String,
    pub space_name: String,
    pub org_name: String,
}

impl ServiceDescriptor {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            name: self.name.clone(),
            space_name: self.space_name.clone(),
            org_name: self.org_name.clone(),
        }
    }
}

/// Identity fingerprint: (name, spaceName, orgName). Equality across
/// reconcile ticks means "same logical entity"; inequality forces a
/// destroy-and-recreate because these three strings are constant labels
/// on every emitted metric.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub name: String,
    pub space_name: String,
    pub org_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_changes_on_rename() {
        let a = AppDescriptor {
            guid: "g1".into(),
            name: "foo".into(),
            space_name: "s".into(),
            org_name: "o".into(),
            instances: 1,
            state: AppState::Started,
        };
        let mut b = a.clone();
        b.space_name = "s2".into();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_equal_when_unchanged() {
        let a = AppDescriptor {
            guid: "g1".into(),
            name: "foo".into(),
            space_name: "s".into(),
            org_name: "o".into(),
            instances: 1,
            state: AppState::Started,
        };
        let b = a.clone();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }
}
