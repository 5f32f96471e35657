//! Integration tests for policy evaluation, mutation and persistence.

use access_control::{AccessControl, Decision, FilePolicyStore, Permission};
use audit_pipeline::{AuditCategory, AuditFilter, AuditOutcome, AuditPipeline};
use custodian_core::utils::{MasterKey, Sealer};
use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

fn editor_setup() -> (AccessControl, AuditPipeline) {
    let audit = AuditPipeline::in_memory();
    let access = AccessControl::in_memory(audit.clone());
    access.create_role("editor").unwrap();
    access
        .add_role_permission("editor", Permission::new("doc", "edit"))
        .unwrap();
    (access, audit)
}

// ============================================================================
// Roles
// ============================================================================

#[test]
fn test_assign_and_revoke_editor_role() {
    let (access, audit) = editor_setup();

    access.assign_role_to_user("u1", "editor").unwrap();
    assert!(access.check_permission("u1", "doc", "edit", None));
    assert!(!access.check_permission("u1", "doc", "delete", None));

    access.revoke_role_from_user("u1", "editor").unwrap();
    assert!(!access.check_permission("u1", "doc", "edit", None));

    let checks: Vec<_> = audit
        .query_events(AuditFilter::new().category(AuditCategory::Authorization).user("u1"))
        .collect();
    let outcomes: Vec<AuditOutcome> = checks.iter().map(|e| e.outcome).collect();
    assert_eq!(
        outcomes,
        vec![AuditOutcome::Success, AuditOutcome::Denied, AuditOutcome::Denied]
    );
    assert_eq!(
        checks[0].details.get("role").and_then(|v| v.as_text()),
        Some("editor")
    );
}

#[test]
fn test_mutations_are_audited_including_failures() {
    let (access, audit) = editor_setup();
    assert!(access.create_role("editor").is_err());

    let failures = audit
        .query_events(
            AuditFilter::new()
                .category(AuditCategory::Authorization)
                .outcome(AuditOutcome::Failure),
        )
        .filter(|e| e.action == "create_role")
        .count();
    assert_eq!(failures, 1);
}

#[test]
fn test_explicit_allow_on_instance_without_role() {
    let (access, _audit) = editor_setup();
    access
        .grant_resource_access("u2", "doc", "d7", Permission::new("doc", "view"), true)
        .unwrap();

    assert_eq!(
        access.explain("u2", "doc", "view", Some("d7")),
        Decision::ExplicitAllow
    );
    assert!(!access.check_permission("u2", "doc", "view", Some("d8")));

    access
        .revoke_resource_access("u2", "doc", "d7", &Permission::new("doc", "view"))
        .unwrap();
    assert!(!access.check_permission("u2", "doc", "view", Some("d7")));
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_checks_see_a_consistent_snapshot_during_mutation() {
    let (access, _audit) = editor_setup();
    access.create_role("viewer").unwrap();
    access
        .add_role_permission("viewer", Permission::new("doc", "view"))
        .unwrap();
    access.assign_role_to_user("u1", "editor").unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let access = access.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut checks = 0;
                while !stop.load(Ordering::SeqCst) {
                    // u1 keeps editor throughout; viewer flaps.
                    assert!(access.check_permission("u1", "doc", "edit", None));
                    checks += 1;
                }
                checks
            })
        })
        .collect();

    for _ in 0..25 {
        access.assign_role_to_user("u1", "viewer").unwrap();
        access.revoke_role_from_user("u1", "viewer").unwrap();
    }
    stop.store(true, Ordering::SeqCst);

    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(access.roles_of("u1"), vec!["editor".to_string()]);
}

// ============================================================================
// Persistence
// ============================================================================

#[test]
fn test_file_store_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("policy.json.sealed");
    let sealer = || Sealer::new(&MasterKey::from_bytes([3u8; 32]));

    let version = {
        let store = Arc::new(FilePolicyStore::new(&path, sealer()));
        let access = AccessControl::new(store, AuditPipeline::in_memory()).unwrap();
        access.create_role("editor").unwrap();
        access
            .add_role_permission("editor", Permission::new("doc", "edit"))
            .unwrap();
        access.assign_role_to_user("u1", "editor").unwrap();
        access
            .grant_resource_access("u1", "doc", "secret", Permission::new("doc", "edit"), false)
            .unwrap();
        access.snapshot_version()
    };

    let raw = std::fs::read(&path).unwrap();
    assert!(!String::from_utf8_lossy(&raw).contains("editor"));

    let store = Arc::new(FilePolicyStore::new(&path, sealer()));
    let access = AccessControl::new(store, AuditPipeline::in_memory()).unwrap();
    assert_eq!(access.snapshot_version(), version);
    assert!(access.check_permission("u1", "doc", "edit", Some("public")));
    assert_eq!(
        access.explain("u1", "doc", "edit", Some("secret")),
        Decision::ExplicitDeny
    );
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_deny_grant_overrides_any_roles(
        role_count in 1usize..5,
        action in "[a-z]{1,8}",
        resource_id in "[a-z0-9]{1,12}",
    ) {
        let access = AccessControl::in_memory(AuditPipeline::in_memory());
        for i in 0..role_count {
            let role = format!("role-{}", i);
            access.create_role(&role).unwrap();
            access.add_role_permission(&role, Permission::new("doc", &action)).unwrap();
            access.assign_role_to_user("u1", &role).unwrap();
        }
        access
            .grant_resource_access("u1", "doc", &resource_id, Permission::new("doc", &action), false)
            .unwrap();

        prop_assert!(!access.check_permission("u1", "doc", &action, Some(&resource_id)));
        prop_assert!(access.check_permission("u1", "doc", &action, None));
    }
}
