//! Shared fixtures for deploy-crate tests.

use std::sync::Arc;

use tokio::sync::{watch, Semaphore};

use flotilla_cloud::{FakeAgent, FakeCloud};
use flotilla_eventlog::{EventLog, EventStream, TestClock};
use flotilla_plan::{DeployOptions, Plan, PropertyDef, ReleaseCatalog, ReleaseVersion, Template};
use flotilla_state::StateStore;

use crate::context::DeployContext;

pub struct Harness {
    pub ctx: DeployContext,
    pub stream: EventStream,
    pub cloud: Arc<FakeCloud>,
    pub agent: Arc<FakeAgent>,
    pub clock: Arc<TestClock>,
    pub cancel_tx: watch::Sender<bool>,
}

pub fn harness() -> Harness {
    let clock = TestClock::new(1_000_000);
    let (events, stream) = EventLog::channel(4096, clock.clone());
    let cloud = Arc::new(FakeCloud::new());
    let agent = Arc::new(FakeAgent::new());
    let (cancel_tx, cancel) = watch::channel(false);
    let ctx = DeployContext {
        store: StateStore::open_in_memory().unwrap(),
        cloud: cloud.clone(),
        agent: agent.clone(),
        clock: clock.clone(),
        events,
        limits: Arc::new(Semaphore::new(32)),
        cancel,
    };
    Harness {
        ctx,
        stream,
        cloud,
        agent,
        clock,
        cancel_tx,
    }
}

pub fn catalog() -> ReleaseCatalog {
    ReleaseCatalog::new(vec![ReleaseVersion {
        name: "main".into(),
        version: "7".into(),
        templates: vec![
            Template {
                name: "router".into(),
                properties: None,
            },
            Template {
                name: "worker".into(),
                properties: Some(
                    [(
                        "queue_depth".to_string(),
                        PropertyDef {
                            default: Some(serde_json::json!(64)),
                            required: false,
                        },
                    )]
                    .into_iter()
                    .collect(),
                ),
            },
        ],
    }])
}

/// A two-job manifest: `web` (3 instances, canaries=1, max_in_flight=2)
/// and `worker` (2 instances, parallel).
pub const MANIFEST: &str = r#"
name: prod
releases:
- name: main
  version: 7
networks:
- name: default
resource_pools:
- name: small
  size: 8
  stemcell:
    name: ubuntu
    version: "3586"
  network: default
update:
  canaries: 1
  max_in_flight: 2
  canary_watch_time: 1-40
  update_watch_time: 1-40
jobs:
- name: web
  template: router
  instances: 3
  resource_pool: small
  networks:
  - name: default
- name: worker
  template: worker
  instances: 2
  resource_pool: small
  networks:
  - name: default
  update:
    serial: false
"#;

pub fn sample_plan() -> Plan {
    Plan::parse(MANIFEST, &catalog(), &DeployOptions::default()).unwrap()
}

pub fn plan_with_options(options: &DeployOptions) -> Plan {
    Plan::parse(MANIFEST, &catalog(), options).unwrap()
}
