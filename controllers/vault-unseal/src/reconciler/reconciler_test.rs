//! Unit tests for the unseal cycle orchestration

#[cfg(test)]
mod tests {
    use crate::config::ControllerConfig;
    use crate::error::ControllerError;
    use crate::metrics::Metrics;
    use crate::reconciler::Reconciler;
    use crate::reconciler::capabilities::{StatusSnapshot, VaultClientFactory};
    use crate::reconciler::policy::UnsealPolicy;
    use crate::test_utils::{
        FakePodLister, FakeSecretSource, FakeStatusStore, MockClientFactory, TestHarness,
        create_test_pod, create_test_vault_unseal,
    };
    use crds::{
        CONDITION_KEY_MATERIAL_ERROR, CONDITION_PARTIAL_UNSEAL, CONDITION_READY,
        CONDITION_VAULT_UNREACHABLE, Condition, ConditionStatus, SecretKeyReference, UnsealPhase,
        VaultScheme, VaultTlsSpec, VaultUnseal, VaultUnsealStatus, find_condition,
    };
    use kube_runtime::controller::Action;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;
    use vault_client::{SealStatus, VaultClientTrait, VaultError};

    const NS: &str = "vault";

    fn three_pods() -> Vec<k8s_openapi::api::core::v1::Pod> {
        vec![
            create_test_pod("vault-0", NS, Some("10.0.0.1"), false),
            create_test_pod("vault-1", NS, Some("10.0.0.2"), false),
            create_test_pod("vault-2", NS, Some("10.0.0.3"), false),
        ]
    }

    /// Harness with three pods, a resource and a Secret holding three shares
    fn setup() -> (TestHarness, VaultUnseal) {
        let harness = TestHarness::new(three_pods());
        harness
            .secrets
            .insert(NS, "vault-keys", &[("key1", "share-a"), ("key2", "share-b"), ("key3", "share-c")]);
        let resource = create_test_vault_unseal("vault", NS, &["vault-keys"]);
        (harness, resource)
    }

    fn condition_status(status: &VaultUnsealStatus, condition_type: &str) -> Option<ConditionStatus> {
        find_condition(&status.conditions, condition_type).map(|c| c.status)
    }

    fn condition_reason(status: &VaultUnsealStatus, condition_type: &str) -> Option<String> {
        find_condition(&status.conditions, condition_type).map(|c| c.reason.clone())
    }

    #[tokio::test]
    async fn test_unseals_every_sealed_pod() {
        let (h, resource) = setup();
        for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            h.vault.add_sealed(ip, 3);
        }

        let action = h.reconciler.reconcile(&resource).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
        assert_eq!(h.vault.total_submissions(), 9);

        let status = h.status.last_status().unwrap();
        assert_eq!(status.phase, Some(UnsealPhase::Ready));
        assert_eq!(status.pods_checked, vec!["vault-0", "vault-1", "vault-2"]);
        assert_eq!(status.unsealed_pods, vec!["vault-0", "vault-1", "vault-2"]);
        assert_eq!(status.observed_generation, Some(1));
        assert!(status.next_reconcile_time > status.last_reconcile_time);
        assert_eq!(condition_status(&status, CONDITION_READY), Some(ConditionStatus::True));
        assert_eq!(
            condition_status(&status, CONDITION_KEY_MATERIAL_ERROR),
            Some(ConditionStatus::False)
        );
        assert!(status.pod_statuses.iter().all(|p| p.outcome == "unsealed" && p.shares_applied == 3));
    }

    #[tokio::test]
    async fn test_already_unsealed_pods_get_no_submissions() {
        let (h, resource) = setup();
        for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            h.vault.add_unsealed(ip, 3);
        }

        h.reconciler.reconcile(&resource).await.unwrap();

        assert_eq!(h.vault.total_submissions(), 0);
        let status = h.status.last_status().unwrap();
        assert_eq!(status.unsealed_pods.len(), 3);
        assert!(status.pod_statuses.iter().all(|p| p.outcome == "already_unsealed"));
    }

    #[tokio::test]
    async fn test_second_cycle_makes_no_submissions() {
        let (h, resource) = setup();
        for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            h.vault.add_sealed(ip, 2);
        }

        h.reconciler.reconcile(&resource).await.unwrap();
        let after_first = h.vault.total_submissions();
        assert_eq!(after_first, 6);

        h.reconciler.reconcile(&resource).await.unwrap();
        assert_eq!(h.vault.total_submissions(), after_first);
        assert_eq!(h.status.last_status().unwrap().unsealed_pods.len(), 3);
    }

    #[tokio::test]
    async fn test_unsealed_pods_subset_of_checked() {
        let (h, resource) = setup();
        h.vault.add_unsealed("10.0.0.1", 3);
        h.vault.add_unreachable("10.0.0.2");
        h.vault.add_sealed("10.0.0.3", 5);

        h.reconciler.reconcile(&resource).await.unwrap();

        let status = h.status.last_status().unwrap();
        assert!(status.unsealed_pods.iter().all(|p| status.pods_checked.contains(p)));
        assert_eq!(status.unsealed_pods, vec!["vault-0"]);
    }

    #[tokio::test]
    async fn test_below_threshold_makes_no_vault_calls() {
        let h = TestHarness::new(three_pods());
        h.secrets.insert(NS, "vault-keys", &[("key1", "share-a"), ("key2", "share-b")]);
        let mut resource = create_test_vault_unseal("vault", NS, &["vault-keys"]);
        resource.spec.key_threshold = Some(3);
        for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            h.vault.add_sealed(ip, 3);
        }

        let action = h.reconciler.reconcile(&resource).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(5)));
        assert!(h.vault.calls().is_empty());

        let status = h.status.last_status().unwrap();
        assert_eq!(status.phase, Some(UnsealPhase::Failed));
        assert!(status.pods_checked.is_empty());
        assert_eq!(
            condition_status(&status, CONDITION_KEY_MATERIAL_ERROR),
            Some(ConditionStatus::True)
        );
        assert_eq!(
            condition_reason(&status, CONDITION_READY).as_deref(),
            Some("KeyMaterialError")
        );
    }

    #[tokio::test]
    async fn test_missing_secret_is_key_material_error() {
        let h = TestHarness::new(three_pods());
        let resource = create_test_vault_unseal("vault", NS, &["does-not-exist"]);

        h.reconciler.reconcile(&resource).await.unwrap();

        let status = h.status.last_status().unwrap();
        assert_eq!(
            condition_status(&status, CONDITION_KEY_MATERIAL_ERROR),
            Some(ConditionStatus::True)
        );
        assert!(h.vault.calls().is_empty());
    }

    #[tokio::test]
    async fn test_ha_disabled_drives_only_first_pod() {
        let (h, mut resource) = setup();
        resource.spec.ha_enabled = false;
        for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            h.vault.add_sealed(ip, 3);
        }

        h.reconciler.reconcile(&resource).await.unwrap();

        assert_eq!(h.vault.submissions("10.0.0.1").len(), 3);
        assert!(h.vault.submissions("10.0.0.2").is_empty());
        assert!(h.vault.submissions("10.0.0.3").is_empty());

        let status = h.status.last_status().unwrap();
        assert_eq!(status.pods_checked.len(), 3);
        assert_eq!(status.unsealed_pods, vec!["vault-0"]);
        assert_eq!(status.phase, Some(UnsealPhase::Ready));
        let skipped: Vec<&str> = status
            .pod_statuses
            .iter()
            .filter(|p| p.outcome == "skipped")
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(skipped, vec!["vault-1", "vault-2"]);
    }

    #[tokio::test]
    async fn test_not_enough_shares_for_vault_is_partial_unseal() {
        let h = TestHarness::new(vec![create_test_pod("vault-0", NS, Some("10.0.0.1"), false)]);
        h.secrets.insert(NS, "vault-keys", &[("key1", "share-a"), ("key2", "share-b")]);
        let resource = create_test_vault_unseal("vault", NS, &["vault-keys"]);
        h.vault.add_sealed("10.0.0.1", 3);

        let action = h.reconciler.reconcile(&resource).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(10)));
        assert_eq!(h.vault.total_submissions(), 2);

        let status = h.status.last_status().unwrap();
        assert_eq!(status.phase, Some(UnsealPhase::Degraded));
        assert!(status.unsealed_pods.is_empty());
        assert_eq!(condition_status(&status, CONDITION_PARTIAL_UNSEAL), Some(ConditionStatus::True));
        assert_eq!(condition_status(&status, CONDITION_READY), Some(ConditionStatus::False));
        assert_eq!(status.pod_statuses[0].outcome, "partially_unsealed");
        assert_eq!(status.pod_statuses[0].shares_applied, 2);
    }

    #[tokio::test]
    async fn test_unreachable_pod_does_not_block_others() {
        let (h, resource) = setup();
        h.vault.add_unreachable("10.0.0.1");
        h.vault.add_sealed("10.0.0.2", 3);
        h.vault.add_sealed("10.0.0.3", 3);

        h.reconciler.reconcile(&resource).await.unwrap();

        let status = h.status.last_status().unwrap();
        assert_eq!(status.unsealed_pods, vec!["vault-1", "vault-2"]);
        assert_eq!(
            condition_status(&status, CONDITION_VAULT_UNREACHABLE),
            Some(ConditionStatus::True)
        );
        let unreachable = find_condition(&status.conditions, CONDITION_VAULT_UNREACHABLE).unwrap();
        assert!(unreachable.message.contains("vault-0"));
        assert_eq!(status.phase, Some(UnsealPhase::Degraded));
    }

    #[tokio::test]
    async fn test_pod_without_ip_is_unreachable() {
        let h = TestHarness::new(vec![create_test_pod("vault-0", NS, None, false)]);
        h.secrets.insert(NS, "vault-keys", &[("key1", "share-a")]);
        let resource = create_test_vault_unseal("vault", NS, &["vault-keys"]);

        h.reconciler.reconcile(&resource).await.unwrap();

        let status = h.status.last_status().unwrap();
        assert_eq!(status.pods_checked, vec!["vault-0"]);
        assert_eq!(status.pod_statuses[0].outcome, "unreachable");
        assert!(h.vault.calls().is_empty());
    }

    #[tokio::test]
    async fn test_no_matching_pods() {
        let h = TestHarness::new(vec![create_test_pod("other", "elsewhere", Some("10.0.0.9"), true)]);
        h.secrets.insert(NS, "vault-keys", &[("key1", "share-a")]);
        let resource = create_test_vault_unseal("vault", NS, &["vault-keys"]);

        let action = h.reconciler.reconcile(&resource).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
        let status = h.status.last_status().unwrap();
        assert_eq!(status.phase, Some(UnsealPhase::Pending));
        assert!(status.pods_checked.is_empty());
        assert_eq!(condition_reason(&status, CONDITION_READY).as_deref(), Some("NoTargets"));
    }

    #[tokio::test]
    async fn test_invalid_spec_reads_no_secrets() {
        let (h, mut resource) = setup();
        resource.spec.selector = "   ".to_string();

        let action = h.reconciler.reconcile(&resource).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(5)));
        assert_eq!(h.secrets.reads(), 0);
        assert!(h.vault.calls().is_empty());
        let status = h.status.last_status().unwrap();
        assert_eq!(status.phase, Some(UnsealPhase::Failed));
        assert_eq!(condition_reason(&status, CONDITION_READY).as_deref(), Some("InvalidSpec"));
    }

    #[tokio::test]
    async fn test_invalid_interval_is_invalid_spec() {
        let (h, mut resource) = setup();
        resource.spec.reconcile_interval = "soon".to_string();

        h.reconciler.reconcile(&resource).await.unwrap();

        let status = h.status.last_status().unwrap();
        assert_eq!(condition_reason(&status, CONDITION_READY).as_deref(), Some("InvalidSpec"));
    }

    #[tokio::test]
    async fn test_tls_setup_failure_aborts_cycle() {
        let factory = MockClientFactory {
            tls_error: Some("invalid CA bundle".to_string()),
            ..MockClientFactory::default()
        };
        let h = TestHarness::with_factory(three_pods(), factory);
        h.secrets.insert(NS, "vault-keys", &[("key1", "share-a")]);
        let resource = create_test_vault_unseal("vault", NS, &["vault-keys"]);

        h.reconciler.reconcile(&resource).await.unwrap();

        assert!(h.vault.calls().is_empty());
        let status = h.status.last_status().unwrap();
        assert_eq!(status.phase, Some(UnsealPhase::Failed));
        assert_eq!(condition_reason(&status, CONDITION_READY).as_deref(), Some("TLSConfigError"));
    }

    #[tokio::test]
    async fn test_ca_bundle_passed_to_client_factory() {
        let (h, mut resource) = setup();
        resource.spec.vault.scheme = VaultScheme::Https;
        resource.spec.tls = Some(VaultTlsSpec {
            ca_bundle: Some(SecretKeyReference::new("vault-ca")),
            skip_verify: false,
        });
        h.secrets.insert(NS, "vault-ca", &[("ca.crt", "-----BEGIN CERTIFICATE-----")]);
        h.vault.add_unsealed("10.0.0.1", 3);
        h.vault.add_unsealed("10.0.0.2", 3);
        h.vault.add_unsealed("10.0.0.3", 3);

        h.reconciler.reconcile(&resource).await.unwrap();

        assert_eq!(
            h.factory.last_ca.lock().unwrap().as_deref(),
            Some(b"-----BEGIN CERTIFICATE-----".as_slice())
        );
        assert_eq!(h.status.last_status().unwrap().phase, Some(UnsealPhase::Ready));
    }

    #[tokio::test]
    async fn test_missing_ca_secret_is_tls_error() {
        let (h, mut resource) = setup();
        resource.spec.tls = Some(VaultTlsSpec {
            ca_bundle: Some(SecretKeyReference::new("missing-ca")),
            skip_verify: false,
        });

        h.reconciler.reconcile(&resource).await.unwrap();

        let status = h.status.last_status().unwrap();
        assert_eq!(condition_reason(&status, CONDITION_READY).as_deref(), Some("TLSConfigError"));
        assert!(h.vault.calls().is_empty());
    }

    #[tokio::test]
    async fn test_pod_listing_failure_aborts_cycle() {
        let (h, resource) = setup();
        h.pods.set_failing(true);

        h.reconciler.reconcile(&resource).await.unwrap();

        let status = h.status.last_status().unwrap();
        assert_eq!(
            condition_reason(&status, CONDITION_READY).as_deref(),
            Some("TargetResolutionFailed")
        );
        assert!(h.vault.calls().is_empty());
    }

    #[tokio::test]
    async fn test_abort_keeps_unrelated_conditions() {
        let (h, mut resource) = setup();
        for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            h.vault.add_unsealed(ip, 3);
        }
        h.reconciler.reconcile(&resource).await.unwrap();
        resource.status = h.status.last_status();

        h.pods.set_failing(true);
        h.reconciler.reconcile(&resource).await.unwrap();

        let status = h.status.last_status().unwrap();
        assert_eq!(
            condition_status(&status, CONDITION_VAULT_UNREACHABLE),
            Some(ConditionStatus::False)
        );
        assert_eq!(condition_status(&status, CONDITION_READY), Some(ConditionStatus::False));
    }

    #[tokio::test]
    async fn test_status_conflict_is_retried() {
        let (h, resource) = setup();
        h.status.fail_with_conflicts(2);

        let result = h.reconciler.reconcile(&resource).await;

        assert!(result.is_ok());
        assert_eq!(h.status.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_conflict_retry_merges_latest_stored_status() {
        let (h, resource) = setup();
        h.status.seed(NS, "vault", StatusSnapshot {
            status: Some(VaultUnsealStatus {
                conditions: vec![Condition::new("Progressing", ConditionStatus::True, "Rollout", "")],
                ..VaultUnsealStatus::default()
            }),
            resource_version: Some("7".to_string()),
        });
        h.status.fail_with_conflicts(1);

        h.reconciler.reconcile(&resource).await.unwrap();

        let status = h.status.last_status().unwrap();
        assert!(find_condition(&status.conditions, "Progressing").is_some());
        assert!(find_condition(&status.conditions, CONDITION_READY).is_some());
    }

    #[tokio::test]
    async fn test_pod_set_changes_between_cycles() {
        let (h, resource) = setup();
        for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"] {
            h.vault.add_unsealed(ip, 3);
        }
        h.reconciler.reconcile(&resource).await.unwrap();

        h.pods.set_pods(vec![
            create_test_pod("vault-0", NS, Some("10.0.0.1"), true),
            create_test_pod("vault-3", NS, Some("10.0.0.4"), true),
        ]);
        h.reconciler.reconcile(&resource).await.unwrap();

        let status = h.status.last_status().unwrap();
        assert_eq!(status.pods_checked, vec!["vault-0", "vault-3"]);
        assert_eq!(status.unsealed_pods, vec!["vault-0", "vault-3"]);
    }

    #[tokio::test]
    async fn test_status_conflicts_exhaust_retries() {
        let (h, resource) = setup();
        h.status.fail_with_conflicts(100);

        let result = h.reconciler.reconcile(&resource).await;

        assert!(matches!(result, Err(ControllerError::Status(_))));
        assert!(h.status.writes().is_empty());
    }

    #[tokio::test]
    async fn test_deleted_resource_drops_its_metrics() {
        let (h, resource) = setup();
        for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            h.vault.add_unsealed(ip, 3);
        }
        h.reconciler.reconcile(&resource).await.unwrap();
        assert!(h.metrics.encode().unwrap().contains("name=\"vault\""));

        h.status.mark_deleted();
        h.reconciler.reconcile(&resource).await.unwrap();

        let text = h.metrics.encode().unwrap();
        assert!(!text.contains("vault_unseal_pod_status{"));
        assert!(!text.contains("vault_unseal_pods_checked{"));
    }

    #[tokio::test]
    async fn test_deleted_resource_is_not_an_error() {
        let (h, resource) = setup();
        h.status.mark_deleted();

        let result = h.reconciler.reconcile(&resource).await;

        assert!(result.is_ok());
        assert!(h.status.writes().is_empty());
    }

    #[tokio::test]
    async fn test_status_api_error_fails_reconcile() {
        let (h, resource) = setup();
        h.status.fail_with_api_error("etcdserver: request timed out");

        let result = h.reconciler.reconcile(&resource).await;

        assert!(matches!(result, Err(ControllerError::Status(_))));
    }

    #[tokio::test]
    async fn test_own_status_write_does_not_trigger_new_cycle() {
        let config = ControllerConfig {
            min_cycle_spacing: Duration::from_secs(5),
            ..ControllerConfig::default()
        };
        let h = TestHarness::build(three_pods(), MockClientFactory::default(), config);
        let mut resource = create_test_vault_unseal("vault", NS, &["vault-keys"]);
        let now = chrono::Utc::now();
        resource.status = Some(VaultUnsealStatus {
            observed_generation: Some(1),
            last_reconcile_time: Some(now),
            next_reconcile_time: Some(now + chrono::Duration::seconds(30)),
            ..VaultUnsealStatus::default()
        });

        let action = h.reconciler.reconcile(&resource).await.unwrap();

        // Deferred to the end of the spacing window, not to nextReconcileTime
        let wait = h.reconciler.recently_reconciled(&resource).unwrap();
        assert!(wait <= Duration::from_secs(5));
        assert_ne!(action, Action::requeue(Duration::from_secs(30)));
        assert_ne!(action, Action::await_change());
        assert_eq!(h.secrets.reads(), 0);
        assert!(h.status.writes().is_empty());
    }

    #[tokio::test]
    async fn test_pod_sealed_right_after_healthy_cycle_is_unsealed_within_spacing() {
        let spacing = Duration::from_millis(200);
        let config = ControllerConfig {
            min_cycle_spacing: spacing,
            ..ControllerConfig::default()
        };
        let pods = vec![
            create_test_pod("vault-0", NS, Some("10.0.0.1"), true),
            create_test_pod("vault-1", NS, Some("10.0.0.2"), true),
        ];
        let h = TestHarness::build(pods, MockClientFactory::default(), config);
        h.secrets
            .insert(NS, "vault-keys", &[("key1", "share-a"), ("key2", "share-b"), ("key3", "share-c")]);
        h.vault.add_unsealed("10.0.0.1", 3);
        h.vault.add_unsealed("10.0.0.2", 3);
        let mut resource = create_test_vault_unseal("vault", NS, &["vault-keys"]);
        resource.spec.reconcile_interval = "1h".to_string();

        let action = h.reconciler.reconcile(&resource).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(3600)));
        resource.status = h.status.last_status();

        // vault-1 restarts sealed; its pod event lands inside the spacing window
        h.vault.add_sealed("10.0.0.2", 3);
        let action = h.reconciler.reconcile(&resource).await.unwrap();
        assert_ne!(action, Action::requeue(Duration::from_secs(3600)));
        assert!(h.reconciler.recently_reconciled(&resource).unwrap() <= spacing);
        assert_eq!(h.vault.total_submissions(), 0);

        // The deferred cycle fires once the window has passed
        tokio::time::sleep(spacing + Duration::from_millis(50)).await;
        h.reconciler.reconcile(&resource).await.unwrap();

        assert_eq!(h.vault.submissions("10.0.0.2").len(), 3);
        assert!(!h.vault.node("10.0.0.2").unwrap().sealed);
        let status = h.status.last_status().unwrap();
        assert_eq!(status.unsealed_pods, vec!["vault-0", "vault-1"]);
        assert_eq!(h.status.writes().len(), 2);
    }

    #[tokio::test]
    async fn test_unchanged_outcome_is_not_rewritten_before_next_cycle() {
        let (h, mut resource) = setup();
        for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            h.vault.add_unsealed(ip, 3);
        }

        h.reconciler.reconcile(&resource).await.unwrap();
        resource.status = h.status.last_status();

        // The watch event of our own write: same outcome, nothing to write
        let action = h.reconciler.reconcile(&resource).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
        assert_eq!(h.status.writes().len(), 1);

        // Once nextReconcileTime has passed the timestamps are refreshed
        if let Some(status) = resource.status.as_mut() {
            status.next_reconcile_time = Some(chrono::Utc::now() - chrono::Duration::seconds(1));
        }
        h.reconciler.reconcile(&resource).await.unwrap();
        assert_eq!(h.status.writes().len(), 2);
    }

    #[tokio::test]
    async fn test_generation_change_runs_cycle_immediately() {
        let config = ControllerConfig {
            min_cycle_spacing: Duration::from_secs(5),
            ..ControllerConfig::default()
        };
        let h = TestHarness::build(three_pods(), MockClientFactory::default(), config);
        h.secrets.insert(NS, "vault-keys", &[("key1", "share-a")]);
        let mut resource = create_test_vault_unseal("vault", NS, &["vault-keys"]);
        resource.metadata.generation = Some(2);
        resource.status = Some(VaultUnsealStatus {
            observed_generation: Some(1),
            last_reconcile_time: Some(chrono::Utc::now()),
            ..VaultUnsealStatus::default()
        });

        h.reconciler.reconcile(&resource).await.unwrap();

        assert_eq!(h.status.writes().len(), 1);
        assert_eq!(h.status.last_status().unwrap().observed_generation, Some(2));
    }

    #[tokio::test]
    async fn test_degraded_requeue_never_exceeds_interval() {
        let (h, mut resource) = setup();
        resource.spec.reconcile_interval = "3s".to_string();
        h.vault.add_unreachable("10.0.0.1");

        let action = h.reconciler.reconcile(&resource).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn test_repeated_aborts_back_off() {
        let (h, mut resource) = setup();
        resource.spec.selector = String::new();

        let mut requeues = Vec::new();
        for _ in 0..4 {
            requeues.push(h.reconciler.reconcile(&resource).await.unwrap());
        }

        assert_eq!(requeues, vec![
            Action::requeue(Duration::from_secs(5)),
            Action::requeue(Duration::from_secs(5)),
            Action::requeue(Duration::from_secs(10)),
            Action::requeue(Duration::from_secs(15)),
        ]);
    }

    #[tokio::test]
    async fn test_successful_cycle_resets_backoff() {
        let (h, mut resource) = setup();
        resource.spec.selector = String::new();
        h.reconciler.reconcile(&resource).await.unwrap();
        h.reconciler.reconcile(&resource).await.unwrap();

        resource.spec.selector = "app=vault".to_string();
        h.reconciler.reconcile(&resource).await.unwrap();

        resource.spec.selector = String::new();
        let action = h.reconciler.reconcile(&resource).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_error_policy_backs_off() {
        let (h, resource) = setup();
        let error = ControllerError::Status("conflict".to_string());

        assert_eq!(
            h.reconciler.error_policy(&resource, &error),
            Action::requeue(Duration::from_secs(5))
        );
        assert_eq!(
            h.reconciler.error_policy(&resource, &error),
            Action::requeue(Duration::from_secs(5))
        );
        assert_eq!(
            h.reconciler.error_policy(&resource, &error),
            Action::requeue(Duration::from_secs(10))
        );
    }

    #[tokio::test]
    async fn test_metrics_recorded_for_cycle() {
        let (h, resource) = setup();
        for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            h.vault.add_sealed(ip, 3);
        }

        h.reconciler.reconcile(&resource).await.unwrap();

        let text = h.metrics.encode().unwrap();
        assert!(text.contains("vault_unseal_reconciliations_total"));
        assert!(text.contains("result=\"success\""));
        assert!(text.contains("vault_unseal_share_submissions_total"));
        assert!(text.contains("vault_unseal_pods_unsealed"));
        assert!(text.contains("status=\"unsealed\""));
        assert!(!text.contains("share-a"));
    }

    /// Answers every call after an hour
    #[derive(Clone)]
    struct HangingVault;

    #[async_trait::async_trait]
    impl VaultClientTrait for HangingVault {
        async fn seal_status(&self, _address: &str) -> Result<SealStatus, VaultError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(SealStatus::sealed(1, 0))
        }

        async fn submit_key_share(&self, _address: &str, _share: &str) -> Result<SealStatus, VaultError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(SealStatus::unsealed(1))
        }
    }

    struct HangingFactory;

    impl VaultClientFactory for HangingFactory {
        fn client_for(
            &self,
            _policy: &UnsealPolicy,
            _ca_pem: Option<Vec<u8>>,
        ) -> Result<Arc<dyn VaultClientTrait>, VaultError> {
            Ok(Arc::new(HangingVault))
        }
    }

    #[tokio::test]
    async fn test_cycle_deadline_fails_stuck_pods() {
        let secrets = Arc::new(FakeSecretSource::new());
        secrets.insert(NS, "vault-keys", &[("key1", "share-a")]);
        let status = Arc::new(FakeStatusStore::new());
        let config = ControllerConfig {
            cycle_timeout: Duration::from_millis(50),
            min_cycle_spacing: Duration::ZERO,
            ..ControllerConfig::default()
        };
        let reconciler = Reconciler::new(
            secrets,
            Arc::new(FakePodLister::new(three_pods())),
            status.clone(),
            Arc::new(HangingFactory),
            Arc::new(Metrics::new().unwrap()),
            config,
        );
        let resource = create_test_vault_unseal("vault", NS, &["vault-keys"]);

        let action = tokio::time::timeout(Duration::from_secs(10), reconciler.reconcile(&resource))
            .await
            .expect("reconcile must finish within the cycle deadline")
            .unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(10)));
        let written = status.last_status().unwrap();
        assert_eq!(written.phase, Some(UnsealPhase::Degraded));
        assert_eq!(written.pods_checked.len(), 3);
        assert!(written.pod_statuses.iter().all(|p| p.outcome == "failed"));
    }

    /// Tracks how many seal-status calls are in flight at once
    #[derive(Default)]
    struct PeakTrackingVault {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl VaultClientTrait for PeakTrackingVault {
        async fn seal_status(&self, _address: &str) -> Result<SealStatus, VaultError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(SealStatus::unsealed(1))
        }

        async fn submit_key_share(&self, _address: &str, _share: &str) -> Result<SealStatus, VaultError> {
            Ok(SealStatus::unsealed(1))
        }
    }

    /// Sealed node that accepts the first share, then stops answering
    #[derive(Default)]
    struct StallingVault {
        submitted: AtomicU32,
    }

    #[async_trait::async_trait]
    impl VaultClientTrait for StallingVault {
        async fn seal_status(&self, _address: &str) -> Result<SealStatus, VaultError> {
            Ok(SealStatus::sealed(3, 0))
        }

        async fn submit_key_share(&self, _address: &str, _share: &str) -> Result<SealStatus, VaultError> {
            if self.submitted.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(SealStatus::sealed(3, 1));
            }
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(SealStatus::unsealed(3))
        }
    }

    /// Hands out one shared client
    struct SharedFactory(Arc<dyn VaultClientTrait>);

    impl VaultClientFactory for SharedFactory {
        fn client_for(
            &self,
            _policy: &UnsealPolicy,
            _ca_pem: Option<Vec<u8>>,
        ) -> Result<Arc<dyn VaultClientTrait>, VaultError> {
            Ok(self.0.clone())
        }
    }

    fn reconciler_with(
        pods: Vec<k8s_openapi::api::core::v1::Pod>,
        vault: Arc<dyn VaultClientTrait>,
        config: ControllerConfig,
    ) -> (Reconciler, Arc<FakeStatusStore>, Arc<Metrics>) {
        let secrets = Arc::new(FakeSecretSource::new());
        secrets.insert(NS, "vault-keys", &[("key1", "share-a"), ("key2", "share-b"), ("key3", "share-c")]);
        let status = Arc::new(FakeStatusStore::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let reconciler = Reconciler::new(
            secrets,
            Arc::new(FakePodLister::new(pods)),
            status.clone(),
            Arc::new(SharedFactory(vault)),
            metrics.clone(),
            config,
        );
        (reconciler, status, metrics)
    }

    #[tokio::test]
    async fn test_pods_driven_at_most_max_concurrent_at_once() {
        let vault = Arc::new(PeakTrackingVault::default());
        let pods = (0..5)
            .map(|i| {
                let ip = format!("10.0.0.{}", i + 1);
                create_test_pod(&format!("vault-{}", i), NS, Some(ip.as_str()), true)
            })
            .collect();
        let config = ControllerConfig {
            min_cycle_spacing: Duration::ZERO,
            ..ControllerConfig::default()
        };
        let (reconciler, status, _) = reconciler_with(pods, vault.clone(), config);
        let mut resource = create_test_vault_unseal("vault", NS, &["vault-keys"]);
        resource.spec.max_concurrent_pods = Some(2);

        reconciler.reconcile(&resource).await.unwrap();

        let peak = vault.peak.load(Ordering::SeqCst);
        assert!(peak >= 1);
        assert!(peak <= 2, "{} pods driven at once", peak);
        assert_eq!(status.last_status().unwrap().unsealed_pods.len(), 5);
    }

    #[tokio::test]
    async fn test_deadline_keeps_submissions_made_before_it() {
        let config = ControllerConfig {
            cycle_timeout: Duration::from_millis(50),
            min_cycle_spacing: Duration::ZERO,
            ..ControllerConfig::default()
        };
        let (reconciler, status, metrics) = reconciler_with(
            vec![create_test_pod("vault-0", NS, Some("10.0.0.1"), false)],
            Arc::new(StallingVault::default()),
            config,
        );
        let resource = create_test_vault_unseal("vault", NS, &["vault-keys"]);

        reconciler.reconcile(&resource).await.unwrap();

        let written = status.last_status().unwrap();
        assert_eq!(written.pod_statuses[0].outcome, "failed");
        // The accepted share and the one that never got an answer
        assert!(metrics.encode().unwrap().contains(
            "vault_unseal_share_submissions_total{name=\"vault\",namespace=\"vault\"} 2"
        ));
    }
}
