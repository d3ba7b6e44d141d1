//! Typed ID definitions.

use crate::{define_external_id, define_id};

// =============================================================================
// Controller-minted
// =============================================================================

define_id!(SweepId, "swp");
define_id!(ControllerId, "ctl");

// =============================================================================
// Orchestrator / node pool / queue
// =============================================================================

define_external_id!(NodeId);
define_external_id!(InstanceId);
define_external_id!(TaskId);
define_external_id!(TaskDefinitionRef);
define_external_id!(MessageId);
define_external_id!(ReceiptHandle);

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_sweep_id_roundtrip() {
        let id = SweepId::new();
        let parsed: SweepId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(id.to_string().starts_with("swp_"));
    }

    #[test]
    fn test_sweep_id_invalid_prefix() {
        let result: Result<SweepId, _> = "ctl_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidPrefix { .. }
        ));
    }

    #[test]
    fn test_sweep_id_missing_separator() {
        let result: Result<SweepId, _> = "swp01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(result.unwrap_err(), crate::IdError::MissingSeparator));
    }

    #[test]
    fn test_sweep_id_invalid_ulid() {
        let result: Result<SweepId, _> = "swp_invalid".parse();
        assert!(matches!(result.unwrap_err(), crate::IdError::InvalidUlid(_)));
    }

    #[test]
    fn test_sweep_ids_sortable() {
        let first = SweepId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = SweepId::new();
        assert!(first < second);
    }

    #[test]
    fn test_minted_id_json_is_string() {
        let id = ControllerId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        let parsed: ControllerId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_external_id_keeps_value_verbatim() {
        let arn = "arn:aws:ecs:eu-west-1:123456789012:container-instance/batch/0f3c";
        let id = NodeId::parse(arn).unwrap();
        assert_eq!(id.as_str(), arn);
        assert_eq!(id.to_string(), arn);
    }

    #[test]
    fn test_external_id_rejects_empty_and_padded() {
        assert!(InstanceId::parse("").unwrap_err().is_empty());
        assert!(matches!(
            InstanceId::parse(" i-0abc ").unwrap_err(),
            crate::IdError::InvalidFormat { .. }
        ));
    }

    #[test]
    fn test_external_id_json_rejects_empty() {
        let result: Result<TaskDefinitionRef, _> = serde_json::from_str("\"\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_generated_external_ids_are_distinct() {
        let a = TaskId::generate("task");
        let b = TaskId::generate("task");
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("task-"));
        assert_eq!(TaskId::parse(a.as_str()).unwrap(), a);
    }

    #[test]
    fn test_all_prefixes_unique() {
        let prefixes = [SweepId::PREFIX, ControllerId::PREFIX];
        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len(), "Duplicate ID prefixes found!");
    }

    proptest! {
        #[test]
        fn external_ids_parse_any_trimmed_value(
            raw in "[A-Za-z0-9:/_.-][A-Za-z0-9:/_. -]{0,62}[A-Za-z0-9:/_.-]"
        ) {
            let id = InstanceId::parse(&raw).unwrap();
            prop_assert_eq!(id.as_str(), raw.as_str());
        }
    }
}
