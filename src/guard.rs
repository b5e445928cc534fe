//! Read-only operation guard (spec.md §6): the lexical allow/forbid rule the
//! Discovery Engine consults before issuing any provider call. This is the
//! rule's *definition* only — using it as a standalone audit/validation
//! product is out of scope (SPEC_FULL.md §1).

const ALLOWED_PREFIXES: &[&str] = &[
    "describe_", "list_", "get_", "head_", "lookup_", "download_", "simulate_", "detect_",
    "test_", "validate_", "check_",
];

const FORBIDDEN_PREFIXES: &[&str] = &[
    "create_", "delete_", "modify_", "update_", "put_", "attach_", "detach_", "associate_",
    "disassociate_", "start_", "stop_", "reboot_", "terminate_", "run_", "launch_", "allocate_",
    "release_", "authorize_", "revoke_", "enable_", "disable_", "register_", "deregister_",
    "import_", "export_", "copy_", "restore_", "reset_", "replace_", "cancel_", "accept_",
    "reject_",
];

/// Returns `true` only if `operation` begins with a known read-only prefix.
/// Anything not explicitly allowed — including an unrecognized prefix — is
/// treated as forbidden; this function never guesses.
pub fn is_read_only(operation: &str) -> bool {
    if FORBIDDEN_PREFIXES.iter().any(|p| operation.starts_with(p)) {
        return false;
    }
    ALLOWED_PREFIXES.iter().any(|p| operation.starts_with(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_known_read_only_operations() {
        for op in [
            "describe_instances",
            "list_buckets",
            "get_bucket_tagging",
            "head_object",
            "lookup_events",
            "simulate_principal_policy",
        ] {
            assert!(is_read_only(op), "{op} should be read-only");
        }
    }

    #[test]
    fn forbids_known_mutating_operations() {
        for op in [
            "create_bucket",
            "delete_instance",
            "put_bucket_policy",
            "terminate_instances",
            "authorize_security_group_ingress",
        ] {
            assert!(!is_read_only(op), "{op} should be forbidden");
        }
    }

    #[test]
    fn unrecognized_operation_defaults_to_forbidden() {
        assert!(!is_read_only("frobnicate_widget"));
        assert!(!is_read_only(""));
    }
}
