//! Task scheduling
//!
//! One pass consumes waiting tasks in selector order, builds the
//! (data container?, application container) placement bundle for each and
//! reserves node RAM atomically within the tick's snapshot. Placement
//! failures roll the bundle back so no half-placed task survives.

mod allocation;
mod caching;
mod selection;

pub use allocation::{binpack, by_name, spread, Allocator, NodeSnapshot};
pub use caching::OneCachePerTaskNoDuplicates;
pub use selection::{Fifo, TaskSelector};

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::cluster::Cluster;
use crate::config::Configuration;
use crate::database::{self, Database};
use crate::state_machine::{Collection, StateMachine};
use crate::states::{end_states, State};
use crate::types::{ApplicationContainer, DataContainer, Task};

pub struct Scheduler {
    config: Arc<Configuration>,
    db: Arc<Database>,
    state_machine: Arc<StateMachine>,
    cluster: Arc<Cluster>,
    allocator: Allocator,
    selector: Box<dyn TaskSelector>,
    caching: OneCachePerTaskNoDuplicates,
}

impl Scheduler {
    pub fn new(
        config: Arc<Configuration>,
        db: Arc<Database>,
        state_machine: Arc<StateMachine>,
        cluster: Arc<Cluster>,
    ) -> anyhow::Result<Self> {
        let strategy = &config.defaults.scheduling_strategies.container_allocation;
        let allocator = by_name(strategy)
            .ok_or_else(|| anyhow::anyhow!("unknown allocation strategy: {}", strategy))?;

        Ok(Self {
            caching: OneCachePerTaskNoDuplicates::new(config.clone(), db.clone()),
            config,
            db,
            state_machine,
            cluster,
            allocator,
            selector: Box::new(Fifo),
        })
    }

    /// Run one scheduling pass over all waiting tasks.
    pub async fn schedule(&self) {
        let default_dc_ram = self
            .config
            .defaults
            .data_container_description
            .container_ram;

        let (mut nodes, tasks) = {
            let conn = self.db.lock().await;
            let nodes = match self.node_snapshot(&conn) {
                Ok(nodes) => nodes,
                Err(e) => {
                    warn!("Could not snapshot nodes: {}", e);
                    return;
                }
            };
            let tasks = match self.selector.select(&conn) {
                Ok(tasks) => tasks,
                Err(e) => {
                    warn!("Could not select tasks: {}", e);
                    return;
                }
            };
            (nodes, tasks)
        };

        for task in tasks {
            // The document may have left the waiting state mid-pass
            let task: Task = {
                let conn = self.db.lock().await;
                match database::get(&conn, &task.id) {
                    Ok(Some(task)) => task,
                    _ => continue,
                }
            };
            if task.state != State::Waiting.index() {
                continue;
            }

            let ac_ram = task.ram();
            let dc_ram = if task.no_cache { 0 } else { default_dc_ram };

            if !is_task_fitting(&nodes, ac_ram, dc_ram) {
                let _ = self
                    .state_machine
                    .fail_task_final(&task.id, "Task is too large for cluster.")
                    .await;
                continue;
            }

            let ac = ApplicationContainer::prototype(&task);
            let ac_id = ac.id.clone();
            {
                let conn = self.db.lock().await;
                if let Err(e) = database::insert(&conn, &ac) {
                    warn!("Could not persist application container: {}", e);
                    continue;
                }
            }

            let new_dc = if task.no_cache {
                None
            } else {
                match self.caching.apply(&self.cluster, &ac_id).await {
                    Ok(new_dc) => new_dc,
                    Err(e) => {
                        warn!("Caching strategy failed for task {}: {}", task.id, e);
                        self.rollback(&ac_id, None).await;
                        continue;
                    }
                }
            };

            // Largest first reduces fragmentation
            let mut bundle: Vec<(u64, String, Collection)> = Vec::new();
            if let Some(dc_id) = &new_dc {
                bundle.push((default_dc_ram, dc_id.clone(), Collection::DataContainers));
            }
            bundle.push((ac_ram, ac_id.clone(), Collection::ApplicationContainers));
            bundle.sort_by(|a, b| b.0.cmp(&a.0));

            let mut failed = false;
            for (ram, container_id, collection) in &bundle {
                let Some(node_name) = (self.allocator)(&nodes, *ram) else {
                    failed = true;
                    break;
                };
                {
                    let conn = self.db.lock().await;
                    let placed = match collection {
                        Collection::ApplicationContainers => database::get::<ApplicationContainer>(
                            &conn,
                            container_id,
                        )
                        .ok()
                        .flatten()
                        .map(|mut ac| {
                            ac.cluster_node = Some(node_name.clone());
                            database::update(&conn, &ac).is_ok()
                        })
                        .unwrap_or(false),
                        Collection::DataContainers => {
                            database::get::<DataContainer>(&conn, container_id)
                                .ok()
                                .flatten()
                                .map(|mut dc| {
                                    dc.cluster_node = Some(node_name.clone());
                                    database::update(&conn, &dc).is_ok()
                                })
                                .unwrap_or(false)
                        }
                        _ => false,
                    };
                    if !placed {
                        failed = true;
                        break;
                    }
                }
                if let Some(node) = nodes.get_mut(&node_name) {
                    node.free_ram -= *ram as i64;
                }
            }

            if failed {
                // No half-placed tasks: drop the bundle and end this pass
                self.rollback(&ac_id, new_dc.as_deref()).await;
                break;
            }

            for (_, container_id, collection) in &bundle {
                let _ = self
                    .state_machine
                    .transition(*collection, container_id, State::Created, "Container created.", None)
                    .await;
            }

            info!("Scheduled task {}.", task.id);
        }
    }

    fn node_snapshot(
        &self,
        conn: &rusqlite::Connection,
    ) -> crate::database::DatabaseResult<HashMap<String, NodeSnapshot>> {
        let open_acs: Vec<ApplicationContainer> =
            database::find_not_in_states(conn, &end_states())?;
        let open_dcs: Vec<DataContainer> = database::find_not_in_states(conn, &end_states())?;

        let mut nodes = HashMap::new();
        for node in database::all_nodes(conn)? {
            if !node.is_online {
                continue;
            }

            let reserved_ac: u64 = open_acs
                .iter()
                .filter(|ac| ac.cluster_node.as_deref() == Some(node.cluster_node.as_str()))
                .map(|ac| ac.container_ram)
                .sum();
            let reserved_dc: u64 = open_dcs
                .iter()
                .filter(|dc| dc.cluster_node.as_deref() == Some(node.cluster_node.as_str()))
                .map(|dc| dc.container_ram)
                .sum();

            nodes.insert(
                node.cluster_node.clone(),
                NodeSnapshot {
                    total_ram: node.total_ram,
                    free_ram: node.total_ram as i64 - (reserved_ac + reserved_dc) as i64,
                },
            );
        }
        Ok(nodes)
    }

    async fn rollback(&self, ac_id: &str, new_dc_id: Option<&str>) {
        let conn = self.db.lock().await;
        let _ = database::delete::<ApplicationContainer>(&conn, ac_id);
        if let Some(dc_id) = new_dc_id {
            let _ = database::delete::<DataContainer>(&conn, dc_id);
        }
    }
}

/// Admission check: the task fits iff its container pair can be assigned
/// to one or two nodes judged by total capacity alone.
fn is_task_fitting(nodes: &HashMap<String, NodeSnapshot>, ac_ram: u64, dc_ram: u64) -> bool {
    let first_ram = ac_ram.max(dc_ram);
    let second_ram = ac_ram.min(dc_ram);

    let mut first_fits = false;
    let mut second_fits = false;

    for node in nodes.values() {
        let mut node_ram = node.total_ram;
        if !first_fits && first_ram <= node_ram {
            first_fits = true;
            node_ram -= first_ram;
        }
        if !second_fits && second_ram <= node_ram {
            second_fits = true;
        }
        if first_fits && second_fits {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(entries: &[(&str, u64)]) -> HashMap<String, NodeSnapshot> {
        entries
            .iter()
            .map(|(name, total_ram)| {
                (
                    name.to_string(),
                    NodeSnapshot {
                        total_ram: *total_ram,
                        free_ram: *total_ram as i64,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_pair_on_single_node() {
        let nodes = nodes(&[("node-a", 1024)]);
        assert!(is_task_fitting(&nodes, 512, 256));
        assert!(!is_task_fitting(&nodes, 2048, 0));
    }

    #[test]
    fn test_pair_split_across_nodes() {
        let nodes = nodes(&[("node-a", 600), ("node-b", 300)]);
        // 512 + 256 does not fit one node but fits the pair
        assert!(is_task_fitting(&nodes, 512, 256));
        // Both halves too large for node-b
        assert!(!is_task_fitting(&nodes, 512, 512));
    }

    #[test]
    fn test_no_cache_pair() {
        let nodes = nodes(&[("node-a", 512)]);
        assert!(is_task_fitting(&nodes, 512, 0));
    }
}
