//! Stable identifiers for scenarios and attachments

use sha2::{Digest, Sha256};

/// Compute the hex SHA-256 digest of data
pub fn hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Identity of a scenario across runs.
///
/// Derived from the project name and the scenario's unique id, so history
/// stays attached to the same scenario between report generations. Always 64
/// hex characters regardless of input length.
pub fn scenario_id(project_name: &str, unique_id: &str) -> String {
    hash(format!("{}_{}", project_name, unique_id).as_bytes())
}

/// Fresh random identifier for a result or step
pub fn new_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_id_is_stable() {
        let a = scenario_id("shop", "scenarios/login.py::Scenario");
        let b = scenario_id("shop", "scenarios/login.py::Scenario");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_scenario_id_depends_on_project() {
        let a = scenario_id("shop", "scenarios/login.py::Scenario");
        let b = scenario_id("admin", "scenarios/login.py::Scenario");
        assert_ne!(a, b);
    }

    #[test]
    fn test_hash_known_value() {
        assert_eq!(
            hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_new_uuid_unique() {
        assert_ne!(new_uuid(), new_uuid());
    }
}
