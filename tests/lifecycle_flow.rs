//! End-to-end lifecycle flows driven through the public API against
//! scripted collaborators.

use std::time::Duration;

use ephemera::test_support::{
    CountingLauncher, RecordingUi, ScriptedControlPlane, ScriptedHandshake, sample_instance,
    telemetry_in_state,
};
use ephemera::{
    AutoConnectPolicy, Credentials, GatewayError, LifecycleOrchestrator, PlanSubmission,
    PollOutcome, ReachabilityProbe, ReadinessPoller, RefreshScope, ResourceCache, Snapshot,
};

struct Flow {
    gateway: ScriptedControlPlane,
    ui: RecordingUi,
    launcher: CountingLauncher,
    handshake: ScriptedHandshake,
    cache: ResourceCache,
}

impl Flow {
    fn new(snapshot: Snapshot) -> Self {
        Self {
            gateway: ScriptedControlPlane::new(),
            ui: RecordingUi::new(),
            launcher: CountingLauncher::new(),
            handshake: ScriptedHandshake::always_reachable(),
            cache: ResourceCache::seeded(snapshot),
        }
    }

    fn orchestrator(
        &self,
    ) -> LifecycleOrchestrator<
        &ScriptedControlPlane,
        &RecordingUi,
        &CountingLauncher,
        &ScriptedHandshake,
    > {
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
                .with_max_attempts(10),
        )
    }
}

fn authenticated_snapshot() -> Snapshot {
    Snapshot {
        credentials: Some(Credentials::Token(String::from("tok"))),
        auto_connect: AutoConnectPolicy::Reuse,
        auto_connect_host: Some(String::from("evo")),
        ..Snapshot::default()
    }
}

#[tokio::test]
async fn create_flow_reaches_a_connected_instance() {
    let flow = Flow::new(authenticated_snapshot());

    // Gateway: deploy succeeds, readiness on the second poll, probe on the
    // first attempt, refresh confirms the instance.
    flow.gateway.push_create(Ok(ephemera::ProvisionReceipt {
        instance: sample_instance("99", "h"),
        command_uid: None,
    }));
    flow.gateway
        .push_telemetry(Ok(telemetry_in_state("provisioning")));
    flow.gateway.push_telemetry(Ok(telemetry_in_state("running")));
    flow.gateway
        .push_instances(Ok(vec![sample_instance("99", "h")]));

    let submission = PlanSubmission {
        plan_id: String::from("1"),
        os_id: String::from("10"),
        duration_hours: 4,
        ssh_key_id: None,
    };
    let report = flow
        .orchestrator()
        .create(&submission, None, None)
        .await
        .expect("create should succeed");

    assert_eq!(report.instance_id, "99");
    assert_eq!(report.readiness, PollOutcome::Satisfied);
    assert!(report.reachable);

    // The cache, not a fresh gateway call, is what collaborators render.
    let snapshot = flow.cache.snapshot();
    assert_eq!(snapshot.instances.len(), 1);
    assert_eq!(snapshot.instances[0].id, "99");

    // Auto-connect ran exactly once, against the configured alias.
    assert_eq!(flow.launcher.connects(), vec![(String::from("evo"), false)]);
    assert!(flow.ui.errors().is_empty());
}

#[tokio::test]
async fn refresh_classifies_authentication_failures_with_remediation() {
    let flow = Flow::new(authenticated_snapshot());
    flow.gateway
        .push_instances(Err(GatewayError::Unauthenticated));
    flow.ui.push_error_selection(Some(0));

    let err = flow
        .orchestrator()
        .refresh(RefreshScope::All)
        .await
        .expect_err("rejected credentials abort the refresh");

    assert!(matches!(err, ephemera::LifecycleError::Unauthenticated));
    let errors = flow.ui.errors();
    assert_eq!(errors.len(), 1, "exactly one notification");
    assert_eq!(errors[0].actions, vec![String::from("Open settings")]);
    assert_eq!(flow.ui.settings_opened(), 1);
}

#[tokio::test]
async fn full_session_create_then_renew_then_destroy() {
    let flow = Flow::new(authenticated_snapshot());

    // create
    flow.gateway.push_create(Ok(ephemera::ProvisionReceipt {
        instance: sample_instance("99", "h"),
        command_uid: None,
    }));
    flow.gateway.set_telemetry_fallback(telemetry_in_state("running"));
    flow.gateway
        .push_instances(Ok(vec![sample_instance("99", "h")]));
    // renew + its refresh
    flow.gateway.push_ack(Ok(()));
    flow.gateway
        .push_instances(Ok(vec![sample_instance("99", "h")]));
    // destroy + its refresh
    flow.gateway.push_ack(Ok(()));
    flow.gateway.push_instances(Ok(Vec::new()));

    let orchestrator = flow.orchestrator();
    let submission = PlanSubmission {
        plan_id: String::from("1"),
        os_id: String::from("10"),
        duration_hours: 4,
        ssh_key_id: None,
    };
    orchestrator
        .create(&submission, None, None)
        .await
        .expect("create");
    orchestrator.renew("99", 6).await.expect("renew");
    orchestrator.delete("99").await.expect("destroy");

    assert!(flow.cache.snapshot().instances.is_empty());
    let calls = flow.gateway.calls();
    assert!(calls.contains(&String::from("renew:99:6")));
    assert!(calls.contains(&String::from("destroy:99")));
    assert!(flow.ui.errors().is_empty());
}
