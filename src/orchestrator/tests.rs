//! Unit tests for the lifecycle orchestrator.

use super::*;
use crate::cache::Snapshot;
use crate::gateway::{ProvisionReceipt, RebuildReceipt};
use crate::model::{Credentials, OsImage, SshKey};
use crate::script_log::ScriptStatus;
use crate::test_support::{
    CountingLauncher, MemoryLogStore, RecordingUi, ScriptedControlPlane, ScriptedHandshake,
    sample_instance, telemetry_in_state,
};
use rstest::rstest;
use std::time::Duration;

type TestOrchestrator<'a> = LifecycleOrchestrator<
    &'a ScriptedControlPlane,
    &'a RecordingUi,
    &'a CountingLauncher,
    &'a ScriptedHandshake,
>;

struct Harness {
    gateway: ScriptedControlPlane,
    ui: RecordingUi,
    launcher: CountingLauncher,
    handshake: ScriptedHandshake,
    cache: ResourceCache,
}

impl Harness {
    fn new() -> Self {
        Self::with_snapshot(Snapshot {
            credentials: Some(Credentials::Token(String::from("tok"))),
            ..Snapshot::default()
        })
    }

    fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            gateway: ScriptedControlPlane::new(),
            ui: RecordingUi::new(),
            launcher: CountingLauncher::new(),
            handshake: ScriptedHandshake::always_reachable(),
            cache: ResourceCache::seeded(snapshot),
        }
    }

    fn orchestrator(&self) -> TestOrchestrator<'_> {
        LifecycleOrchestrator::new(
            &self.gateway,
            self.cache.clone(),
            &self.ui,
            &self.launcher,
            ReachabilityProbe::with_handshake(&self.handshake)
                .with_total_budget(Duration::from_millis(20))
                .with_retry_interval(Duration::from_millis(1)),
            ReadinessPoller::new()
                .with_interval(Duration::from_millis(1))
                .with_settle_delay(Duration::from_millis(1))
                .with_max_attempts(5),
        )
    }
}

fn plan(id: &str, image_ids: &[&str]) -> Plan {
    Plan {
        id: id.to_owned(),
        name: format!("plan-{id}"),
        cpu: None,
        memory_mb: None,
        disk_gb: None,
        os: image_ids
            .iter()
            .map(|image_id| OsImage {
                id: (*image_id).to_owned(),
                name: String::new(),
            })
            .collect(),
    }
}

fn submission() -> PlanSubmission {
    PlanSubmission {
        plan_id: String::from("1"),
        os_id: String::from("10"),
        duration_hours: 4,
        ssh_key_id: None,
    }
}

mod create {
    use super::*;

    #[tokio::test]
    async fn full_flow_polls_probes_refreshes_and_connects_once() {
        let harness = Harness::with_snapshot(Snapshot {
            credentials: Some(Credentials::Token(String::from("tok"))),
            auto_connect: AutoConnectPolicy::Reuse,
            auto_connect_host: Some(String::from("evo")),
            ..Snapshot::default()
        });
        let created = sample_instance("99", "h");
        harness.gateway.push_create(Ok(ProvisionReceipt {
            instance: created.clone(),
            command_uid: None,
        }));
        harness
            .gateway
            .push_telemetry(Ok(telemetry_in_state("provisioning")));
        harness
            .gateway
            .push_telemetry(Ok(telemetry_in_state("running")));
        harness
            .gateway
            .push_instances(Ok(vec![sample_instance("99", "h")]));

        let report = harness
            .orchestrator()
            .create(&submission(), None, None)
            .await
            .expect("create should succeed");

        assert_eq!(report.instance_id, "99");
        assert_eq!(report.readiness, PollOutcome::Satisfied);
        assert!(report.reachable);
        assert!(report.connected);

        // Readiness confirmed on the second poll, probe on the first
        // attempt, exactly one auto-connect.
        assert_eq!(harness.gateway.telemetry_fetches(), 2);
        assert_eq!(harness.handshake.attempts(), 1);
        assert_eq!(
            harness.launcher.connects(),
            vec![(String::from("evo"), false)]
        );

        let snapshot = harness.cache.snapshot();
        assert_eq!(snapshot.instances.len(), 1);
        assert_eq!(snapshot.instances[0].id, "99");
        assert!(harness.ui.errors().is_empty());
    }

    #[tokio::test]
    async fn readiness_timeout_downgrades_confidence_without_rollback() {
        let harness = Harness::new();
        harness.gateway.push_create(Ok(ProvisionReceipt {
            instance: sample_instance("99", "h"),
            command_uid: None,
        }));
        harness
            .gateway
            .set_telemetry_fallback(telemetry_in_state("provisioning"));
        harness
            .gateway
            .push_instances(Ok(vec![sample_instance("99", "h")]));

        let report = harness
            .orchestrator()
            .create(&submission(), None, None)
            .await
            .expect("timeout is not a failure");

        assert_eq!(report.readiness, PollOutcome::Exhausted);
        assert!(!report.connected, "timeouts suppress auto-connect");
        assert_eq!(harness.cache.snapshot().instances.len(), 1);
        let infos = harness.ui.infos();
        assert_eq!(infos.len(), 1, "one informational notice: {infos:?}");
        assert!(infos[0].contains("not confirmed running"));
    }

    #[tokio::test]
    async fn reachability_timeout_suppresses_auto_connect() {
        let mut harness = Harness::with_snapshot(Snapshot {
            credentials: Some(Credentials::Token(String::from("tok"))),
            auto_connect: AutoConnectPolicy::Reuse,
            auto_connect_host: Some(String::from("evo")),
            ..Snapshot::default()
        });
        harness.handshake = ScriptedHandshake::never_reachable();
        harness.gateway.push_create(Ok(ProvisionReceipt {
            instance: sample_instance("99", "h"),
            command_uid: None,
        }));
        harness
            .gateway
            .set_telemetry_fallback(telemetry_in_state("running"));
        harness
            .gateway
            .push_instances(Ok(vec![sample_instance("99", "h")]));

        let report = harness
            .orchestrator()
            .create(&submission(), None, None)
            .await
            .expect("probe exhaustion is not a failure");

        assert!(!report.reachable);
        assert!(!report.connected);
        assert!(harness.launcher.connects().is_empty());
        let infos = harness.ui.infos();
        assert!(infos[0].contains("not reachable"), "notice: {infos:?}");
    }

    #[tokio::test]
    async fn declined_retry_surfaces_one_notification_and_stops() {
        let harness = Harness::new();
        harness.gateway.push_create(Err(GatewayError::Network {
            message: String::from("connection reset"),
        }));

        let err = harness
            .orchestrator()
            .create(&submission(), None, None)
            .await
            .expect_err("declined retry must fail");

        assert!(matches!(err, LifecycleError::Gateway(_)));
        let errors = harness.ui.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].actions, vec![ACTION_RETRY.to_owned()]);
        assert!(harness.launcher.connects().is_empty());
        assert_eq!(
            harness.gateway.telemetry_fetches(),
            0,
            "no polling after a failed submission"
        );
    }

    #[tokio::test]
    async fn rejected_credentials_offer_the_settings_surface() {
        let harness = Harness::new();
        harness
            .gateway
            .push_create(Err(GatewayError::Unauthenticated));
        harness.ui.push_error_selection(Some(0));

        let err = harness
            .orchestrator()
            .create(&submission(), None, None)
            .await
            .expect_err("401 must fail");

        assert!(matches!(err, LifecycleError::Unauthenticated));
        assert_eq!(harness.ui.settings_opened(), 1);
        let errors = harness.ui.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].actions, vec![ACTION_OPEN_SETTINGS.to_owned()]);
    }

    #[tokio::test]
    async fn retries_are_bounded_even_when_always_accepted() {
        let harness = Harness::new();
        for _ in 0..8 {
            harness.gateway.push_create(Err(GatewayError::Network {
                message: String::from("flaky"),
            }));
            harness.ui.push_error_selection(Some(0));
        }

        let err = harness
            .orchestrator()
            .create(&submission(), None, None)
            .await
            .expect_err("exhausted retries must fail");

        assert!(matches!(err, LifecycleError::Gateway(_)));
        let creates = harness
            .gateway
            .calls()
            .iter()
            .filter(|call| call.starts_with("create"))
            .count();
        assert_eq!(creates, 4, "initial attempt plus three bounded retries");
    }

    #[tokio::test]
    async fn boot_script_submission_records_a_pending_log_entry() {
        let harness = Harness::new();
        harness.gateway.push_create(Ok(ProvisionReceipt {
            instance: sample_instance("99", "h"),
            command_uid: Some(String::from("cmd-7")),
        }));
        harness
            .gateway
            .set_telemetry_fallback(telemetry_in_state("running"));
        harness
            .gateway
            .push_instances(Ok(vec![sample_instance("99", "h")]));

        let store = MemoryLogStore::new();
        let log = ScriptLog::new(store);
        let script = BootScript {
            name: String::from("install.sh"),
            content: String::from("#!/bin/sh\n"),
        };

        harness
            .orchestrator()
            .create(&submission(), Some(&script), Some(&log))
            .await
            .expect("create should succeed");

        let entries = log
            .entries_for_instance("99")
            .expect("log should be readable");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "cmd-7");
        assert_eq!(entries[0].status, ScriptStatus::Pending);
        assert_eq!(entries[0].script_name, "install.sh");

        let calls = harness.gateway.calls();
        assert_eq!(calls[0], "create+script");
    }
}

mod refresh {
    use super::*;
    use crate::model::Permissions;

    #[tokio::test]
    async fn filters_plans_by_freshly_fetched_permissions() {
        let harness = Harness::new();
        harness.gateway.push_instances(Ok(Vec::new()));
        harness.gateway.push_permissions(Ok(Permissions {
            allow_packages: Some(vec![String::from("1")]),
            max_time: 72,
        }));
        harness
            .gateway
            .push_plans(Ok(vec![plan("1", &["10"]), plan("2", &["20"])]));
        harness.gateway.push_ssh_keys(Ok(Vec::new()));

        harness
            .orchestrator()
            .refresh(RefreshScope::All)
            .await
            .expect("refresh should succeed");

        let snapshot = harness.cache.snapshot();
        assert_eq!(snapshot.plans.len(), 1);
        assert_eq!(snapshot.plans[0].id, "1");
        assert_eq!(snapshot.plans[0].os, vec![OsImage {
            id: String::from("10"),
            name: String::new(),
        }]);
    }

    #[tokio::test]
    async fn one_resource_failure_does_not_block_the_others() {
        let harness = Harness::new();
        harness
            .gateway
            .push_instances(Ok(vec![sample_instance("99", "h")]));
        harness.gateway.push_permissions(Err(GatewayError::Network {
            message: String::from("boom"),
        }));
        harness.gateway.push_plans(Ok(vec![plan("1", &["10"])]));
        harness.gateway.push_ssh_keys(Ok(vec![SshKey {
            id: String::from("5"),
            name: String::from("laptop"),
            created_at: None,
        }]));

        harness
            .orchestrator()
            .refresh(RefreshScope::All)
            .await
            .expect("isolated failures do not fail the refresh");

        let snapshot = harness.cache.snapshot();
        assert_eq!(snapshot.instances.len(), 1);
        assert_eq!(snapshot.plans.len(), 1, "plans updated despite permissions");
        assert_eq!(snapshot.ssh_keys.len(), 1);
        assert!(
            harness.ui.errors().is_empty(),
            "isolated failures are not notified"
        );
    }

    #[tokio::test]
    async fn unauthenticated_instance_fetch_aborts_the_refresh() {
        let harness = Harness::new();
        harness
            .gateway
            .push_instances(Err(GatewayError::Unauthenticated));

        let err = harness
            .orchestrator()
            .refresh(RefreshScope::All)
            .await
            .expect_err("401 aborts");
        assert!(matches!(err, LifecycleError::Unauthenticated));
        assert!(
            !harness
                .gateway
                .calls()
                .iter()
                .any(|call| call == "permissions"),
            "remaining fetches would fail identically"
        );
    }

    #[tokio::test]
    async fn refresh_without_credentials_is_a_no_op() {
        let harness = Harness::with_snapshot(Snapshot::default());
        harness
            .orchestrator()
            .refresh(RefreshScope::All)
            .await
            .expect("no-op refresh");
        assert!(harness.gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn instance_timestamps_normalise_once_at_ingestion() {
        let harness = Harness::new();
        let mut raw = sample_instance("99", "h");
        raw.creation_at = String::from("2026-03-01 10:00:00");
        harness.gateway.push_instances(Ok(vec![raw]));

        harness
            .orchestrator()
            .refresh(RefreshScope::Instances)
            .await
            .expect("refresh should succeed");

        let cached = harness.cache.snapshot().instances.remove(0);
        assert_eq!(
            cached.creation_at,
            crate::model::normalise_timestamp("2026-03-01 10:00:00")
        );
    }
}

mod power {
    use super::*;

    #[rstest]
    #[case(PowerAction::Boot, "running")]
    #[case(PowerAction::Shutdown, "stopped")]
    #[tokio::test]
    async fn waits_for_the_action_target_state(
        #[case] action: PowerAction,
        #[case] target: &str,
    ) {
        let harness = Harness::new();
        harness.gateway.push_ack(Ok(()));
        harness
            .gateway
            .set_telemetry_fallback(telemetry_in_state(target));
        harness.gateway.push_instances(Ok(Vec::new()));

        let outcome = harness
            .orchestrator()
            .power("99", action)
            .await
            .expect("power should succeed");

        assert_eq!(outcome, PollOutcome::Satisfied);
        assert!(
            harness
                .gateway
                .calls()
                .contains(&format!("power:99:{}", action.as_str()))
        );
        let infos = harness.ui.infos();
        assert!(infos[0].contains(target), "notice: {infos:?}");
    }

    #[tokio::test]
    async fn unconfirmed_target_state_is_informational_not_an_error() {
        let harness = Harness::new();
        harness.gateway.push_ack(Ok(()));
        harness
            .gateway
            .set_telemetry_fallback(telemetry_in_state("running"));
        harness.gateway.push_instances(Ok(Vec::new()));

        let outcome = harness
            .orchestrator()
            .power("99", PowerAction::Shutdown)
            .await
            .expect("budget exhaustion is not an error");
        assert_eq!(outcome, PollOutcome::Exhausted);
        assert!(harness.ui.infos()[0].contains("not confirmed"));
    }
}

mod renew_and_delete {
    use super::*;
    use crate::model::Permissions;

    #[tokio::test]
    async fn renew_validates_against_the_permitted_ceiling() {
        let harness = Harness::with_snapshot(Snapshot {
            credentials: Some(Credentials::Token(String::from("tok"))),
            permissions: Some(Permissions {
                allow_packages: None,
                max_time: 72,
            }),
            ..Snapshot::default()
        });

        let err = harness
            .orchestrator()
            .renew("99", 100)
            .await
            .expect_err("over-ceiling renewal must fail");

        assert!(matches!(err, LifecycleError::Precondition { .. }));
        assert!(harness.gateway.calls().is_empty(), "no network call");
        assert_eq!(harness.ui.errors().len(), 1);
    }

    #[tokio::test]
    async fn renew_submits_and_refreshes_without_polling() {
        let harness = Harness::new();
        harness.gateway.push_ack(Ok(()));
        harness
            .gateway
            .push_instances(Ok(vec![sample_instance("99", "h")]));

        harness
            .orchestrator()
            .renew("99", 4)
            .await
            .expect("renew should succeed");

        let calls = harness.gateway.calls();
        assert_eq!(calls[0], "renew:99:4");
        assert_eq!(calls[1], "list_instances");
        assert_eq!(harness.gateway.telemetry_fetches(), 0);
    }

    #[tokio::test]
    async fn delete_submits_and_refreshes_without_polling() {
        let harness = Harness::new();
        harness.gateway.push_ack(Ok(()));
        harness.gateway.push_instances(Ok(Vec::new()));

        harness
            .orchestrator()
            .delete("99")
            .await
            .expect("delete should succeed");

        assert!(harness.cache.snapshot().instances.is_empty());
        assert!(harness.ui.infos()[0].contains("deleted"));
        assert_eq!(harness.gateway.telemetry_fetches(), 0);
    }
}

mod expiration {
    use super::*;
    use crate::model::TIMESTAMP_FORMAT;

    fn expiring_snapshot(minutes_left: i64) -> Snapshot {
        let mut instance = sample_instance("99", "h");
        instance.expiration_at = (Local::now() + ChronoDuration::minutes(minutes_left))
            .format(TIMESTAMP_FORMAT)
            .to_string();
        Snapshot {
            credentials: Some(Credentials::Token(String::from("tok"))),
            instances: vec![instance],
            ..Snapshot::default()
        }
    }

    #[tokio::test]
    async fn near_expiry_warns_once_and_can_be_disarmed() {
        let harness = Harness::with_snapshot(expiring_snapshot(3));
        harness.ui.push_warning_selection(Some(1));

        harness
            .orchestrator()
            .check_expiration(Local::now())
            .await
            .expect("check should succeed");

        assert_eq!(harness.ui.warnings().len(), 1);
        assert!(!harness.cache.snapshot().remind_expiration);

        // Disarmed: a second check stays quiet.
        harness
            .orchestrator()
            .check_expiration(Local::now())
            .await
            .expect("check should succeed");
        assert_eq!(harness.ui.warnings().len(), 1);
    }

    #[tokio::test]
    async fn expired_instance_refreshes_and_notifies() {
        let harness = Harness::with_snapshot(expiring_snapshot(-1));
        harness.gateway.push_instances(Ok(Vec::new()));

        harness
            .orchestrator()
            .check_expiration(Local::now())
            .await
            .expect("check should succeed");

        assert!(harness.cache.snapshot().instances.is_empty());
        let errors = harness.ui.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("expired"));
    }

    #[tokio::test]
    async fn accepted_offer_prompts_for_hours_and_renews() {
        let harness = Harness::with_snapshot(expiring_snapshot(2));
        harness.ui.push_warning_selection(Some(0));
        harness.ui.push_input(Answer::Value(String::from("6")));
        harness.gateway.push_ack(Ok(()));
        harness.gateway.push_instances(Ok(Vec::new()));

        harness
            .orchestrator()
            .check_expiration(Local::now())
            .await
            .expect("check should succeed");

        assert!(harness.gateway.calls().contains(&String::from("renew:99:6")));
    }
}

mod rebuild {
    use super::*;

    #[tokio::test]
    async fn rebuild_polls_probes_and_refreshes() {
        let harness = Harness::new();
        harness.gateway.push_rebuild(Ok(RebuildReceipt {
            hostname: String::from("h"),
            command_uid: None,
        }));
        harness
            .gateway
            .set_telemetry_fallback(telemetry_in_state("running"));
        harness
            .gateway
            .push_instances(Ok(vec![sample_instance("99", "h")]));

        let rebuild = RebuildSubmission {
            os_id: String::from("10"),
            ssh_key_id: Some(String::from("5")),
        };
        let report = harness
            .orchestrator()
            .rebuild("99", &rebuild, None, None)
            .await
            .expect("rebuild should succeed");

        assert_eq!(report.instance_id, "99");
        assert_eq!(report.readiness, PollOutcome::Satisfied);
        assert!(report.reachable);
        assert!(harness.gateway.calls().contains(&String::from("rebuild:99")));
    }
}
