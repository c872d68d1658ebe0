//! End-to-end stack lifecycle: service → queue → worker → simulated cloud.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use thecloud_core::config::ProvisionerConfig;
use thecloud_core::{Principal, SystemClock};
use thecloud_sim::{SimCall, SimCloud, SimOp};
use thecloud_stack::{Provisioner, StackError, StackService, job_queue};
use thecloud_state::{ResourceType, Stack, StackStatus, StateStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

const TEMPLATE: &str = r#"
Resources:
  net:
    Type: VPC
    Properties:
      Name: app-net
  data:
    Type: Volume
    Properties:
      Size: 5
  web:
    Type: Instance
    Properties:
      Image: nginx:latest
      Ports: "8080:80"
      VpcID: { Ref: net }
  backup:
    Type: Snapshot
    Properties:
      VolumeID: { Ref: data }
"#;

struct Harness {
    service: StackService,
    cloud: Arc<SimCloud>,
    shutdown: watch::Sender<bool>,
    worker: JoinHandle<()>,
}

impl Harness {
    fn start() -> Self {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let cloud = SimCloud::new();
        let clock = Arc::new(SystemClock);
        let provisioner = Arc::new(Provisioner::new(store.clone(), &cloud.backends(), clock.clone()));
        let (queue, worker) = job_queue(provisioner, &ProvisionerConfig::default());
        let (shutdown, rx) = watch::channel(false);
        let worker = tokio::spawn(worker.run(rx));
        Self {
            service: StackService::new(store, queue, clock),
            cloud,
            shutdown,
            worker,
        }
    }

    async fn wait_terminal(&self, principal: &Principal, id: Uuid) -> Stack {
        for _ in 0..200 {
            let stack = self.service.get_stack(principal, id).unwrap();
            if stack.status.is_terminal() {
                return stack;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("stack {id} never reached a terminal status");
    }

    async fn wait_gone(&self, principal: &Principal, id: Uuid) {
        for _ in 0..200 {
            match self.service.get_stack(principal, id) {
                Err(StackError::NotFound(_)) => return,
                Ok(_) => tokio::time::sleep(Duration::from_millis(10)).await,
                Err(e) => panic!("unexpected error {e}"),
            }
        }
        panic!("stack {id} was never deleted");
    }

    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        self.worker.await.unwrap();
    }
}

#[tokio::test]
async fn create_then_delete() {
    let h = Harness::start();
    let alice = Principal::new(Uuid::new_v4());

    let created = h
        .service
        .create_stack(&alice, "app", TEMPLATE, BTreeMap::new())
        .unwrap();
    let stack = h.wait_terminal(&alice, created.id).await;
    assert_eq!(stack.status, StackStatus::CreateComplete);

    let rows = h.service.list_stack_resources(&alice, stack.id).unwrap();
    let kinds: Vec<_> = rows.iter().map(|r| r.resource_type).collect();
    assert_eq!(kinds, ResourceType::PASS_ORDER);
    assert_eq!(h.cloud.vpcs()[0].name, "app-net");
    assert_eq!(h.cloud.instances()[0].ports, "8080:80");

    h.service.delete_stack(&alice, stack.id).unwrap();
    h.wait_gone(&alice, stack.id).await;
    assert_eq!(h.cloud.live_resources(), 0);
    assert!(h.service.list_stacks(&alice).unwrap().is_empty());

    h.stop().await;
}

#[tokio::test]
async fn failed_stack_rolls_back_and_can_be_deleted() {
    let h = Harness::start();
    let alice = Principal::new(Uuid::new_v4());
    h.cloud.fail(SimOp::CreateSnapshot);

    let created = h
        .service
        .create_stack(&alice, "app", TEMPLATE, BTreeMap::new())
        .unwrap();
    let stack = h.wait_terminal(&alice, created.id).await;
    assert_eq!(stack.status, StackStatus::RollbackComplete);
    assert!(stack.status_reason.contains("Snapshot backup"));
    assert!(h.service.list_stack_resources(&alice, stack.id).unwrap().is_empty());
    assert_eq!(h.cloud.live_resources(), 0);

    // A rolled-back stack still has a row until the tenant deletes it.
    h.service.delete_stack(&alice, stack.id).unwrap();
    h.wait_gone(&alice, stack.id).await;

    h.stop().await;
}

#[tokio::test]
async fn invalid_template_fails_without_backend_calls() {
    let h = Harness::start();
    let alice = Principal::new(Uuid::new_v4());

    let created = h
        .service
        .create_stack(&alice, "app", "Resources: {}", BTreeMap::new())
        .unwrap();
    assert_eq!(created.status, StackStatus::CreateInProgress);

    let stack = h.wait_terminal(&alice, created.id).await;
    assert_eq!(stack.status, StackStatus::CreateFailed);
    assert!(stack.status_reason.contains("at least one resource"));
    assert!(h.cloud.journal().is_empty());

    h.stop().await;
}

#[tokio::test]
async fn tenants_are_isolated() {
    let h = Harness::start();
    let alice = Principal::new(Uuid::new_v4());
    let bob = Principal::new(Uuid::new_v4());

    let a = h
        .service
        .create_stack(&alice, "a", TEMPLATE, BTreeMap::new())
        .unwrap();
    let b = h
        .service
        .create_stack(&bob, "b", TEMPLATE, BTreeMap::new())
        .unwrap();
    h.wait_terminal(&alice, a.id).await;
    h.wait_terminal(&bob, b.id).await;

    // Physical id -> owner, for every resource either stack recorded.
    let mut owners: HashMap<Uuid, Principal> = HashMap::new();
    for (principal, stack) in [(alice, a.id), (bob, b.id)] {
        for row in h.service.list_stack_resources(&principal, stack).unwrap() {
            owners.insert(row.physical_id.parse().unwrap(), principal);
        }
    }
    assert_eq!(owners.len(), 8);
    let short_ids = HashMap::from([(alice, a.short_id()), (bob, b.short_id())]);

    assert_eq!(h.service.list_stacks(&alice).unwrap().len(), 1);
    assert!(matches!(
        h.service.delete_stack(&bob, a.id),
        Err(StackError::NotFound(_))
    ));
    h.service.delete_stack(&bob, b.id).unwrap();
    h.wait_gone(&bob, b.id).await;
    assert_eq!(h.cloud.live_resources(), 4);

    // Every backend call ran as the owner of the resource it touched.
    let journal = h.cloud.journal();
    for (principal, call) in &journal {
        let short = &short_ids[principal];
        match call {
            SimCall::CreateVpc { .. } => {}
            SimCall::CreateVolume { name, .. } => assert_eq!(name, &format!("data-{short}")),
            SimCall::LaunchInstance { name, vpc_id, .. } => {
                assert_eq!(name, &format!("web-{short}"));
                let vpc_id = vpc_id.unwrap();
                assert_eq!(owners[&vpc_id], *principal, "instance placed in a foreign vpc");
            }
            SimCall::CreateSnapshot { volume_id, name } => {
                assert_eq!(name, &format!("backup-{short}"));
                assert_eq!(owners[volume_id], *principal, "snapshot of a foreign volume");
            }
            SimCall::TerminateInstance(id)
            | SimCall::DeleteVpc(id)
            | SimCall::DeleteVolume(id)
            | SimCall::DeleteSnapshot(id) => {
                assert_eq!(*principal, bob);
                assert_eq!(owners[id], bob, "deleted another tenant's resource");
            }
            other => panic!("unexpected call {other:?}"),
        }
    }
    for principal in [alice, bob] {
        let vpcs = journal
            .iter()
            .filter(|(p, call)| *p == principal && matches!(call, SimCall::CreateVpc { .. }))
            .count();
        assert_eq!(vpcs, 1);
    }
    let deletes = journal
        .iter()
        .filter(|(_, call)| {
            matches!(
                call,
                SimCall::TerminateInstance(_)
                    | SimCall::DeleteVpc(_)
                    | SimCall::DeleteVolume(_)
                    | SimCall::DeleteSnapshot(_)
            )
        })
        .count();
    assert_eq!(deletes, 4);

    h.stop().await;
}
