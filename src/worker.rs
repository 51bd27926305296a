//! Scheduling worker
//!
//! All side-effecting activity runs on two single-flight loops fed by
//! capacity-1 channels: external events publish a sentinel and are
//! coalesced when one is already pending. The scheduling loop owns every
//! scheduler decision, so the invariants of one pass hold without extra
//! locking.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cluster::{Cluster, NodeInspector};
use crate::config::Configuration;
use crate::database::{self, Database};
use crate::scheduling::Scheduler;
use crate::state_machine::{Collection, StateMachine};
use crate::states::{end_states, State};
use crate::types::{ApplicationContainer, DataContainer, RegistryAuth, Task};

/// Events the worker accepts from other processes and the web API.
pub trait MasterSignals: Send + Sync {
    fn schedule(&self);
    fn container_callback(&self);
    fn data_container_callback(&self);
    fn update_node_status(&self, node_name: &str);
}

struct WorkerCore {
    config: Arc<Configuration>,
    db: Arc<Database>,
    state_machine: Arc<StateMachine>,
    cluster: Arc<Cluster>,
    scheduler: Scheduler,
    inspector: Arc<NodeInspector>,
}

pub struct Worker {
    core: Arc<WorkerCore>,
    scheduling_tx: mpsc::Sender<()>,
    data_container_callback_tx: mpsc::Sender<()>,
}

impl Worker {
    /// Spawn the permanent loops and return the worker handle.
    pub fn start(
        config: Arc<Configuration>,
        db: Arc<Database>,
        state_machine: Arc<StateMachine>,
        cluster: Arc<Cluster>,
        scheduler: Scheduler,
        inspector: Arc<NodeInspector>,
    ) -> Arc<Worker> {
        let (scheduling_tx, scheduling_rx) = mpsc::channel(1);
        let (data_container_callback_tx, data_container_callback_rx) = mpsc::channel(1);

        let core = Arc::new(WorkerCore {
            config,
            db,
            state_machine,
            cluster,
            scheduler,
            inspector,
        });

        let worker = Arc::new(Worker {
            core: core.clone(),
            scheduling_tx,
            data_container_callback_tx,
        });

        tokio::spawn(scheduling_loop(core.clone(), scheduling_rx));
        tokio::spawn(data_container_callback_loop(
            core.clone(),
            data_container_callback_rx,
        ));

        if let Some(interval) = core.config.server_master.scheduling_interval_seconds {
            tokio::spawn(cron(core, worker.clone(), interval));
        }

        worker
    }

    /// Prewarm the data container image, log the node inventory and kick
    /// off the first scheduling pass.
    pub async fn startup(&self) {
        let core = &self.core;
        let description = &core.config.defaults.data_container_description;
        let auth = description.registry_auth.as_ref().map(|auth| RegistryAuth {
            username: auth.username.clone(),
            password: auth.password.clone(),
        });

        let nodes = core.cluster.registry().active_names();
        let auth_ref = auth.as_ref();
        join_all(nodes.iter().map(|node_name| async move {
            if let Err(e) = core
                .cluster
                .update_image(node_name, &description.image, auth_ref)
                .await
            {
                warn!("Image prewarm on node {} failed: {}", node_name, e);
            }
        }))
        .await;

        {
            let conn = core.db.lock().await;
            if let Ok(records) = database::all_nodes(&conn) {
                for node in records {
                    info!(
                        "Node {}: online={} total_ram={}MiB total_cpus={}",
                        node.cluster_node, node.is_online, node.total_ram, node.total_cpus
                    );
                }
            }
        }

        self.schedule();
    }

    /// Run one scheduling tick inline instead of through the queue.
    pub async fn run_scheduling_tick(&self) {
        scheduling_tick(&self.core).await;
    }

    /// Run one data-container callback tick inline.
    pub async fn run_data_container_tick(&self) {
        data_container_tick(&self.core).await;
    }
}

impl MasterSignals for Worker {
    fn schedule(&self) {
        let _ = self.scheduling_tx.try_send(());
    }

    fn container_callback(&self) {
        let core = self.core.clone();
        let scheduling_tx = self.scheduling_tx.clone();
        tokio::spawn(async move {
            core.cluster.clean_up_unused_data_containers().await;
            let _ = scheduling_tx.try_send(());
        });
    }

    fn data_container_callback(&self) {
        let _ = self.data_container_callback_tx.try_send(());
    }

    fn update_node_status(&self, node_name: &str) {
        let core = self.core.clone();
        let node_name = node_name.to_string();
        tokio::spawn(async move {
            core.inspector.update_node(&node_name).await;
        });
    }
}

async fn scheduling_loop(core: Arc<WorkerCore>, mut rx: mpsc::Receiver<()>) {
    while rx.recv().await.is_some() {
        scheduling_tick(&core).await;
    }
}

async fn scheduling_tick(core: &Arc<WorkerCore>) {
    core.cluster.reconcile_containers().await;
    if let Err(e) = core.state_machine.update_task_groups().await {
        warn!("Task group sweep failed: {}", e);
    }
    core.scheduler.schedule().await;
    update_images(core).await;
    create_containers(core).await;
}

async fn data_container_callback_loop(core: Arc<WorkerCore>, mut rx: mpsc::Receiver<()>) {
    while rx.recv().await.is_some() {
        data_container_tick(&core).await;
    }
}

async fn data_container_tick(core: &Arc<WorkerCore>) {
    let (processing, waiting_acs) = {
        let conn = core.db.lock().await;
        let processing: Vec<DataContainer> =
            database::find_in_states(&conn, &[State::Processing.index()]).unwrap_or_default();
        let waiting_acs: Vec<ApplicationContainer> =
            database::find_in_states(&conn, &[State::Waiting.index()]).unwrap_or_default();
        (processing, waiting_acs)
    };

    let mut clean_up = false;
    let mut starts = Vec::new();
    for data_container in &processing {
        let dependents: Vec<&ApplicationContainer> = waiting_acs
            .iter()
            .filter(|ac| {
                ac.data_container_ids
                    .iter()
                    .flatten()
                    .any(|id| id == &data_container.id)
            })
            .collect();

        if dependents.is_empty() {
            clean_up = true;
        }
        for ac in dependents {
            let core = core.clone();
            let ac_id = ac.id.clone();
            starts.push(tokio::spawn(async move {
                start_application_container(&core, &ac_id).await;
            }));
        }
    }

    join_all(starts).await;

    if clean_up {
        core.cluster.clean_up_unused_data_containers().await;
    }
}

/// Republishes work while any non-terminal document exists, healing
/// stuck states after crashes or lost events.
async fn cron(core: Arc<WorkerCore>, worker: Arc<Worker>, interval_seconds: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_seconds.max(1)));
    interval.tick().await;

    loop {
        interval.tick().await;

        let work_to_do = {
            let conn = core.db.lock().await;
            let open_tasks = database::find_not_in_states::<Task>(&conn, &end_states())
                .map(|tasks| !tasks.is_empty())
                .unwrap_or(false);
            let open_acs = database::find_not_in_states::<ApplicationContainer>(&conn, &end_states())
                .map(|acs| !acs.is_empty())
                .unwrap_or(false);
            let open_dcs = database::find_not_in_states::<DataContainer>(&conn, &end_states())
                .map(|dcs| !dcs.is_empty())
                .unwrap_or(false);
            open_tasks || open_acs || open_dcs
        };

        if work_to_do {
            worker.schedule();
            worker.data_container_callback();
        }
    }
}

/// Pull the image of every created container on its target node.
async fn update_images(core: &Arc<WorkerCore>) {
    let mut pulls: HashSet<(String, String, Option<RegistryAuth>)> = HashSet::new();
    let mut ac_count = 0usize;
    let mut dc_count = 0usize;

    {
        let conn = core.db.lock().await;
        let created_acs: Vec<ApplicationContainer> =
            database::find_in_states(&conn, &[State::Created.index()]).unwrap_or_default();
        let created_dcs: Vec<DataContainer> =
            database::find_in_states(&conn, &[State::Created.index()]).unwrap_or_default();

        for ac in &created_acs {
            let Some(node) = &ac.cluster_node else { continue };
            let Ok(task) = database::require::<Task>(&conn, &ac.task_id) else {
                continue;
            };
            let description = &task.application_container_description;
            pulls.insert((
                node.clone(),
                description.image.clone(),
                description.registry_auth.clone(),
            ));
            ac_count += 1;
        }

        let dc_description = &core.config.defaults.data_container_description;
        for dc in &created_dcs {
            let Some(node) = &dc.cluster_node else { continue };
            pulls.insert((
                node.clone(),
                dc_description.image.clone(),
                dc_description.registry_auth.as_ref().map(|auth| RegistryAuth {
                    username: auth.username.clone(),
                    password: auth.password.clone(),
                }),
            ));
            dc_count += 1;
        }
    }

    info!(
        "Scheduled: {} application containers, {} data containers",
        ac_count, dc_count
    );

    let failures = join_all(pulls.into_iter().map(|(node, image, auth)| {
        let core = core.clone();
        async move {
            match core.cluster.update_image(&node, &image, auth.as_ref()).await {
                Ok(()) => false,
                Err(e) => {
                    warn!("Image pull {} on node {} failed: {}", image, node, e);
                    true
                }
            }
        }
    }))
    .await;

    if failures.into_iter().any(|failed| failed) {
        let core = core.clone();
        tokio::spawn(async move {
            core.inspector.update_all_nodes().await;
        });
    }
}

/// Create every scheduled container and chain its start.
async fn create_containers(core: &Arc<WorkerCore>) {
    let (created_acs, created_dcs) = {
        let conn = core.db.lock().await;
        let acs: Vec<ApplicationContainer> =
            database::find_in_states(&conn, &[State::Created.index()]).unwrap_or_default();
        let dcs: Vec<DataContainer> =
            database::find_in_states(&conn, &[State::Created.index()]).unwrap_or_default();
        (acs, dcs)
    };

    let mut creations = Vec::new();

    for ac in created_acs {
        let core = core.clone();
        creations.push(tokio::spawn(async move {
            core.cluster
                .create_container(&ac.id, Collection::ApplicationContainers)
                .await;
            // Usually a no-op here: the container waits for its caches
            start_application_container(&core, &ac.id).await;
        }));
    }

    for dc in created_dcs {
        let core = core.clone();
        creations.push(tokio::spawn(async move {
            core.cluster
                .create_container(&dc.id, Collection::DataContainers)
                .await;
            core.cluster
                .start_container(&dc.id, Collection::DataContainers)
                .await;
        }));
    }

    join_all(creations).await;
}

/// Start an application container once every data container it references
/// is serving files. Reads current truth from the database and no-ops when
/// preconditions have changed.
async fn start_application_container(core: &Arc<WorkerCore>, application_container_id: &str) {
    let ready = {
        let conn = core.db.lock().await;
        let Ok(Some(ac)) = database::get::<ApplicationContainer>(&conn, application_container_id)
        else {
            return;
        };
        if ac.state != State::Waiting.index() {
            false
        } else {
            ac.referenced_data_containers().iter().all(|dc_id| {
                database::get::<DataContainer>(&conn, dc_id)
                    .ok()
                    .flatten()
                    .map(|dc| dc.state == State::Processing.index())
                    .unwrap_or(false)
            })
        }
    };

    if ready {
        let _ = core
            .state_machine
            .transition(
                Collection::ApplicationContainers,
                application_container_id,
                State::Processing,
                "All data containers for application container ready.",
                None,
            )
            .await;
    }

    let is_processing = {
        let conn = core.db.lock().await;
        database::get::<ApplicationContainer>(&conn, application_container_id)
            .ok()
            .flatten()
            .map(|ac| ac.state == State::Processing.index())
            .unwrap_or(false)
    };

    if is_processing {
        core.cluster
            .start_container(application_container_id, Collection::ApplicationContainers)
            .await;
    }
}
