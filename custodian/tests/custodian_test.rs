//! End-to-end tests through the facade.

use custodian::access_control::Permission;
use custodian::audit_pipeline::{AuditCategory, AuditFilter};
use custodian::custodian_core::config::{CustodianConfig, KdfConfig};
use custodian::custodian_core::secrecy::SecretString;
use custodian::key_vault::{KeyKind, VaultError};
use custodian::{Custodian, CustodianError, PublicError};

fn cheap_kdf() -> KdfConfig {
    KdfConfig {
        memory_kib: 64,
        iterations: 1,
        parallelism: 1,
    }
}

fn persistent_config(root: &std::path::Path) -> CustodianConfig {
    let mut config = CustodianConfig {
        master_password: Some(SecretString::new("correct horse battery staple".to_string())),
        kdf: cheap_kdf(),
        ..CustodianConfig::default()
    };
    config.keys.storage_dir = Some(root.join("keys"));
    config.keys.rsa_bits = 1024;
    config.access.storage_path = Some(root.join("access").join("policy.sealed"));
    config.audit.log_dir = Some(root.join("audit"));
    config.audit.encrypt = true;
    config.audit.segment_max_events = 8;
    config.compliance.storage_dir = Some(root.join("compliance"));
    config
}

#[test]
fn test_request_flow_through_all_services() {
    let custodian = Custodian::in_memory().unwrap();

    custodian.access().create_role("analyst").unwrap();
    custodian
        .access()
        .add_role_permission("analyst", Permission::new("campaign", "read"))
        .unwrap();
    custodian.access().assign_role_to_user("u1", "analyst").unwrap();

    assert!(custodian.authorize("u1", "campaign", "read", Some("c1")).is_ok());
    assert_eq!(
        custodian.authorize("u2", "campaign", "read", Some("c1")),
        Err(PublicError::NotPermitted)
    );

    custodian.vault().generate_key("campaign-data", KeyKind::Symmetric).unwrap();
    let sealed = custodian
        .vault()
        .encrypt_symmetric("campaign-data", b"budget=1000")
        .unwrap();
    assert_eq!(
        custodian.vault().decrypt_symmetric("campaign-data", &sealed).unwrap(),
        b"budget=1000"
    );

    custodian
        .compliance()
        .record_consent("u1", "analytics", true, None)
        .unwrap();
    assert!(custodian.compliance().check_consent("u1", "analytics"));

    let denied = custodian
        .audit()
        .query_events(AuditFilter::new().category(AuditCategory::Authorization).user("u2"))
        .count();
    assert_eq!(denied, 1);
    custodian.shutdown();
}

#[test]
fn test_present_hides_detail_but_audits_it() {
    let custodian = Custodian::in_memory().unwrap();
    let err = custodian
        .vault()
        .encrypt_symmetric("missing-key", b"x")
        .map_err(CustodianError::from)
        .unwrap_err();
    assert!(matches!(err, CustodianError::Vault(VaultError::KeyNotFound(_))));

    let public = custodian.present("u1", &err);
    assert_eq!(public.to_string(), "unable to process data");

    let recorded: Vec<_> = custodian
        .audit()
        .query_events(AuditFilter::new().user("u1"))
        .filter(|e| e.action == "error_presented")
        .collect();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].category, AuditCategory::KeyManagement);
    let detail = recorded[0].details.get("error").and_then(|v| v.as_text()).unwrap();
    assert!(detail.contains("missing-key"));
}

#[test]
fn test_persistent_services_survive_restart() {
    let root = tempfile::tempdir().unwrap();
    let config = persistent_config(root.path());

    let (sealed, pseudonym, last_sequence) = {
        let custodian = Custodian::init(&config).unwrap();
        custodian.vault().generate_key("k1", KeyKind::Symmetric).unwrap();
        let sealed = custodian.vault().encrypt_symmetric("k1", b"persisted").unwrap();

        custodian.access().create_role("editor").unwrap();
        custodian
            .access()
            .add_role_permission("editor", Permission::new("doc", "edit"))
            .unwrap();
        custodian.access().assign_role_to_user("u1", "editor").unwrap();

        custodian
            .compliance()
            .record_consent("u1", "marketing", true, None)
            .unwrap();
        let pseudonym = custodian.compliance().pseudonym("u1").unwrap();

        let last = custodian.audit().status().last_sequence;
        custodian.shutdown();
        (sealed, pseudonym, last)
    };

    let custodian = Custodian::init(&config).unwrap();
    assert_eq!(custodian.vault().decrypt_symmetric("k1", &sealed).unwrap(), b"persisted");
    assert!(custodian.access().check_permission("u1", "doc", "edit", None));
    assert!(custodian.compliance().check_consent("u1", "marketing"));
    // Derived from the master password, so stable across restarts.
    assert_eq!(custodian.compliance().pseudonym("u1").unwrap(), pseudonym);
    assert!(custodian.audit().status().last_sequence > last_sequence);

    let raw_audit: Vec<u8> = std::fs::read_dir(root.path().join("audit"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("segment-"))
        .flat_map(|e| std::fs::read(e.path()).unwrap())
        .collect();
    assert!(!String::from_utf8_lossy(&raw_audit).contains("marketing"));
}

#[test]
fn test_persistent_stores_require_master_password() {
    let root = tempfile::tempdir().unwrap();
    let config = CustodianConfig {
        master_password: None,
        ..persistent_config(root.path())
    };
    assert!(matches!(
        Custodian::init(&config),
        Err(CustodianError::Core(_))
    ));
}
