//! Typed state transitions for tasks, task groups and containers
//!
//! All writes go through [`StateMachine::transition`]; every transition is
//! applied in one read-modify-write section under the database connection
//! lock, so per-document ordering needs no further synchronization.
//! Terminal writes scrub secrets and queue task notifications, which are
//! fired only after the lock is released.

use std::sync::Arc;

use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::ErrorHandling;
use crate::database::{self, Database, DatabaseResult, Document};
use crate::notification::notify;
use crate::secrets::scrub_secrets;
use crate::states::{end_states, is_end_state, State, Transition};
use crate::types::{ApplicationContainer, DataContainer, NotificationConnector, Task, TaskGroup};

/// Collection a transition applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    Tasks,
    TaskGroups,
    ApplicationContainers,
    DataContainers,
}

impl Collection {
    pub fn as_str(self) -> &'static str {
        match self {
            Collection::Tasks => "tasks",
            Collection::TaskGroups => "task_groups",
            Collection::ApplicationContainers => "application_containers",
            Collection::DataContainers => "data_containers",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notifications collected during a transition, fired after the database
/// lock is dropped.
type PendingNotifications = Vec<(Vec<NotificationConnector>, Value)>;

pub struct StateMachine {
    db: Arc<Database>,
    error_handling: ErrorHandling,
}

impl StateMachine {
    pub fn new(db: Arc<Database>, error_handling: ErrorHandling) -> Self {
        Self { db, error_handling }
    }

    /// Single entry point for all state changes.
    pub async fn transition(
        &self,
        collection: Collection,
        id: &str,
        state: State,
        description: &str,
        exception: Option<String>,
    ) -> DatabaseResult<()> {
        let mut pending = PendingNotifications::new();
        {
            let conn = self.db.lock().await;
            match collection {
                Collection::Tasks => {
                    self.task_transition(&conn, &mut pending, id, state, description, exception, None)?
                }
                Collection::TaskGroups => {
                    self.task_group_transition(&conn, id, state, description, exception, None)?
                }
                Collection::ApplicationContainers => self.application_container_transition(
                    &conn,
                    &mut pending,
                    id,
                    state,
                    description,
                    exception,
                    None,
                )?,
                Collection::DataContainers => self.data_container_transition(
                    &conn,
                    &mut pending,
                    id,
                    state,
                    description,
                    exception,
                    None,
                )?,
            }
        }
        fire_notifications(pending).await;
        Ok(())
    }

    /// Fail a task without the retry rewrite, e.g. when no node can ever
    /// host it.
    pub async fn fail_task_final(&self, task_id: &str, description: &str) -> DatabaseResult<()> {
        let mut pending = PendingNotifications::new();
        {
            let conn = self.db.lock().await;
            let Some(mut task) = database::get::<Task>(&conn, task_id)? else {
                return Ok(());
            };
            if is_end_state(task.state) {
                return Ok(());
            }
            apply_task(&conn, &mut task, State::Failed, description, None, None)?;
            if !task.notifications.is_empty() {
                pending.push((task.notifications.clone(), json!({ "task_id": task_id })));
            }
        }
        fire_notifications(pending).await;
        Ok(())
    }

    /// Sweep task groups whose members are all terminal and derive the
    /// group state: success iff any member succeeded, failed otherwise.
    pub async fn update_task_groups(&self) -> DatabaseResult<()> {
        let conn = self.db.lock().await;
        let groups: Vec<TaskGroup> = database::find_not_in_states(&conn, &end_states())?;

        for group in groups {
            let mut finished = 0usize;
            let mut any_success = false;
            for task_id in &group.task_ids {
                let Some(task) = database::get::<Task>(&conn, task_id)? else {
                    continue;
                };
                if is_end_state(task.state) {
                    finished += 1;
                    if task.state == State::Success.index() {
                        any_success = true;
                    }
                }
            }
            if finished != group.tasks_count {
                continue;
            }
            if any_success {
                self.task_group_transition(
                    &conn,
                    &group.id,
                    State::Success,
                    "All tasks in group finished.",
                    None,
                    None,
                )?;
            } else {
                self.task_group_transition(
                    &conn,
                    &group.id,
                    State::Failed,
                    "All tasks in group failed or have been cancelled.",
                    None,
                    None,
                )?;
            }
        }
        Ok(())
    }

    fn task_transition(
        &self,
        conn: &Connection,
        pending: &mut PendingNotifications,
        task_id: &str,
        state: State,
        description: &str,
        exception: Option<String>,
        caused_by: Option<Value>,
    ) -> DatabaseResult<()> {
        let Some(mut task) = database::get::<Task>(conn, task_id)? else {
            return Ok(());
        };
        if is_end_state(task.state) {
            return Ok(());
        }

        let mut state = state;
        let mut description = description.to_string();

        if state == State::Failed {
            task.trials += 1;
            let max_task_trials = self.error_handling.max_task_trials;
            if task.trials < max_task_trials {
                state = State::Waiting;
                description = format!(
                    "Task waiting again (trial {} of {}): {}",
                    task.trials, max_task_trials, description
                );
            }
        }

        apply_task(conn, &mut task, state, &description, exception, caused_by)?;

        if state == State::Cancelled {
            let open: Vec<ApplicationContainer> =
                database::find_not_in_states(conn, &end_states())?;
            for ac in open.into_iter().filter(|ac| ac.task_id == task_id) {
                let ac_description = format!("Application container cancelled: {}", description);
                self.application_container_transition(
                    conn,
                    pending,
                    &ac.id,
                    State::Cancelled,
                    &ac_description,
                    None,
                    Some(json!({ "task_id": task_id })),
                )?;
            }
        }

        if state == State::Processing {
            if let Some(group) = database::get::<TaskGroup>(conn, &task.task_group_id)? {
                if group.state == State::Waiting.index() {
                    self.task_group_transition(
                        conn,
                        &group.id,
                        State::Processing,
                        "Task group processing.",
                        None,
                        Some(json!({ "task_id": task_id })),
                    )?;
                }
            }
        }

        if state.is_terminal() && !task.notifications.is_empty() {
            pending.push((task.notifications.clone(), json!({ "task_id": task_id })));
        }

        Ok(())
    }

    fn application_container_transition(
        &self,
        conn: &Connection,
        pending: &mut PendingNotifications,
        ac_id: &str,
        state: State,
        description: &str,
        exception: Option<String>,
        caused_by: Option<Value>,
    ) -> DatabaseResult<()> {
        let Some(mut ac) = database::get::<ApplicationContainer>(conn, ac_id)? else {
            return Ok(());
        };
        if is_end_state(ac.state) {
            return Ok(());
        }

        apply_container(conn, &mut ac, state, description, exception, caused_by)?;

        let task_id = ac.task_id.clone();
        let caused_by = json!({ "application_container_id": ac_id });

        match state {
            State::Created => self.task_transition(
                conn,
                pending,
                &task_id,
                State::Processing,
                description,
                None,
                Some(caused_by),
            )?,
            State::Success | State::Failed | State::Cancelled => self.task_transition(
                conn,
                pending,
                &task_id,
                state,
                description,
                None,
                Some(caused_by),
            )?,
            _ => {}
        }

        Ok(())
    }

    fn data_container_transition(
        &self,
        conn: &Connection,
        pending: &mut PendingNotifications,
        dc_id: &str,
        state: State,
        description: &str,
        exception: Option<String>,
        caused_by: Option<Value>,
    ) -> DatabaseResult<()> {
        let Some(mut dc) = database::get::<DataContainer>(conn, dc_id)? else {
            return Ok(());
        };
        if is_end_state(dc.state) {
            return Ok(());
        }

        apply_container(conn, &mut dc, state, description, exception, caused_by)?;

        if state == State::Failed {
            let open: Vec<ApplicationContainer> =
                database::find_not_in_states(conn, &end_states())?;
            for ac in open
                .into_iter()
                .filter(|ac| ac.data_container_ids.iter().flatten().any(|id| id == dc_id))
            {
                let ac_description = format!("Application container failed: {}", description);
                self.application_container_transition(
                    conn,
                    pending,
                    &ac.id,
                    State::Failed,
                    &ac_description,
                    None,
                    Some(json!({ "data_container_id": dc_id })),
                )?;
            }
        }

        Ok(())
    }

    fn task_group_transition(
        &self,
        conn: &Connection,
        group_id: &str,
        state: State,
        description: &str,
        exception: Option<String>,
        caused_by: Option<Value>,
    ) -> DatabaseResult<()> {
        let Some(mut group) = database::get::<TaskGroup>(conn, group_id)? else {
            return Ok(());
        };
        if is_end_state(group.state) || group.state == state.index() {
            return Ok(());
        }

        log_transition(Collection::TaskGroups.as_str(), group_id, state, description, &None);

        let mut transition = Transition::new(state, description).with_exception(exception);
        if let Some(caused_by) = caused_by {
            transition = transition.with_caused_by(caused_by);
        }
        if state == State::Created {
            group.created_at = Some(transition.timestamp);
        }
        group.state = state.index();
        group.transitions.push(transition);
        record(conn, &group, state.is_terminal())
    }
}

fn apply_task(
    conn: &Connection,
    task: &mut Task,
    state: State,
    description: &str,
    exception: Option<String>,
    caused_by: Option<Value>,
) -> DatabaseResult<()> {
    log_transition(Collection::Tasks.as_str(), &task.id, state, description, &exception);

    let mut transition = Transition::new(state, description).with_exception(exception);
    if let Some(caused_by) = caused_by {
        transition = transition.with_caused_by(caused_by);
    }
    if state == State::Created {
        task.created_at = Some(transition.timestamp);
    }
    task.state = state.index();
    task.transitions.push(transition);
    record(conn, task, state.is_terminal())
}

fn apply_container<T>(
    conn: &Connection,
    container: &mut T,
    state: State,
    description: &str,
    exception: Option<String>,
    caused_by: Option<Value>,
) -> DatabaseResult<()>
where
    T: Document + ContainerFields,
{
    log_transition(T::COLLECTION, container.id_ref(), state, description, &exception);

    let mut transition = Transition::new(state, description).with_exception(exception);
    if let Some(caused_by) = caused_by {
        transition = transition.with_caused_by(caused_by);
    }
    if state == State::Created {
        *container.created_at_mut() = Some(transition.timestamp);
    }
    *container.state_mut() = state.index();
    container.transitions_mut().push(transition);
    record(conn, container, state.is_terminal())
}

/// Field access shared by both container document kinds.
trait ContainerFields {
    fn id_ref(&self) -> &str;
    fn state_mut(&mut self) -> &mut i64;
    fn created_at_mut(&mut self) -> &mut Option<f64>;
    fn transitions_mut(&mut self) -> &mut Vec<Transition>;
}

impl ContainerFields for ApplicationContainer {
    fn id_ref(&self) -> &str {
        &self.id
    }
    fn state_mut(&mut self) -> &mut i64 {
        &mut self.state
    }
    fn created_at_mut(&mut self) -> &mut Option<f64> {
        &mut self.created_at
    }
    fn transitions_mut(&mut self) -> &mut Vec<Transition> {
        &mut self.transitions
    }
}

impl ContainerFields for DataContainer {
    fn id_ref(&self) -> &str {
        &self.id
    }
    fn state_mut(&mut self) -> &mut i64 {
        &mut self.state
    }
    fn created_at_mut(&mut self) -> &mut Option<f64> {
        &mut self.created_at
    }
    fn transitions_mut(&mut self) -> &mut Vec<Transition> {
        &mut self.transitions
    }
}

/// Persist a mutated document; terminal writes are scrubbed of secrets.
fn record<T: Document>(conn: &Connection, doc: &T, terminal: bool) -> DatabaseResult<()> {
    if terminal {
        let mut value = serde_json::to_value(doc)?;
        scrub_secrets(&mut value);
        database::update_raw(conn, T::COLLECTION, doc.id(), &value)
    } else {
        database::update(conn, doc)
    }
}

fn log_transition(
    collection: &str,
    id: &str,
    state: State,
    description: &str,
    exception: &Option<String>,
) {
    if state == State::Failed {
        warn!(
            "{} {} {}: {} {}",
            collection,
            id,
            state,
            description,
            exception.as_deref().unwrap_or("")
        );
    } else {
        info!("{} {} {}", collection, id, state);
    }
}

async fn fire_notifications(pending: PendingNotifications) {
    for (connectors, meta) in pending {
        notify(&connectors, meta).await;
    }
}
