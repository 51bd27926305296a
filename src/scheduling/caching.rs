//! Input-file caching strategy
//!
//! "One cache per task, no duplicates": live data containers already
//! holding an input file are shared, and whatever files remain uncovered
//! go into a single new data container.

use std::sync::Arc;

use crate::cluster::Cluster;
use crate::config::Configuration;
use crate::database::{self, Database, DatabaseResult};
use crate::types::{ApplicationContainer, DataContainer, Task};

pub struct OneCachePerTaskNoDuplicates {
    config: Arc<Configuration>,
    db: Arc<Database>,
}

impl OneCachePerTaskNoDuplicates {
    pub fn new(config: Arc<Configuration>, db: Arc<Database>) -> Self {
        Self { config, db }
    }

    /// Assign data containers to a freshly created application container.
    ///
    /// Returns the id of the newly spawned data container, when any input
    /// file was left unassigned.
    pub async fn apply(
        &self,
        cluster: &Cluster,
        application_container_id: &str,
    ) -> DatabaseResult<Option<String>> {
        cluster
            .assign_existing_data_containers(application_container_id)
            .await?;

        let conn = self.db.lock().await;

        let mut ac: ApplicationContainer = database::require(&conn, application_container_id)?;
        let task: Task = database::require(&conn, &ac.task_id)?;

        let unassigned: Vec<_> = task
            .input_files
            .iter()
            .zip(ac.data_container_ids.iter())
            .filter(|(_, dc_id)| dc_id.is_none())
            .map(|(file, _)| file.clone())
            .collect();

        let mut new_id = None;
        if !unassigned.is_empty() {
            let container_ram = self
                .config
                .defaults
                .data_container_description
                .container_ram;
            let dc = DataContainer::prototype(task.username.clone(), unassigned, container_ram);
            database::insert(&conn, &dc)?;
            for slot in ac.data_container_ids.iter_mut() {
                if slot.is_none() {
                    *slot = Some(dc.id.clone());
                }
            }
            new_id = Some(dc.id);
        }

        database::update(&conn, &ac)?;
        Ok(new_id)
    }
}
