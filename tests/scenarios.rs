//! End-to-end scheduling scenarios against scripted engines

mod common;

use common::{callback, harness, input_file, submit_task, Harness};

use flotilla::database;
use flotilla::states::State;
use flotilla::types::{ApplicationContainer, DataContainer, Task, TaskGroup};

async fn get_task(harness: &Harness, task_id: &str) -> Task {
    let conn = harness.db.lock().await;
    database::require(&conn, task_id).unwrap()
}

async fn containers_for_task(harness: &Harness, task_id: &str) -> Vec<ApplicationContainer> {
    let conn = harness.db.lock().await;
    database::find_all::<ApplicationContainer>(&conn)
        .unwrap()
        .into_iter()
        .filter(|ac| ac.task_id == task_id)
        .collect()
}

async fn all_data_containers(harness: &Harness) -> Vec<DataContainer> {
    let conn = harness.db.lock().await;
    database::find_all(&conn).unwrap()
}

async fn dead_node_names(harness: &Harness) -> Vec<String> {
    let conn = harness.db.lock().await;
    database::all_dead_nodes(&conn)
        .unwrap()
        .into_iter()
        .map(|dead| dead.name)
        .collect()
}

#[tokio::test]
async fn s1_single_task_happy_path() {
    let h = harness(&[("node-1", 4096)], 3).await;
    let task_id = submit_task(&h, 512, vec![input_file("http://files/data.csv")], false).await;

    h.worker.run_scheduling_tick().await;

    let acs = containers_for_task(&h, &task_id).await;
    assert_eq!(acs.len(), 1);
    let ac = &acs[0];
    assert_eq!(ac.state, State::Waiting.index());
    assert_eq!(ac.cluster_node.as_deref(), Some("node-1"));

    let dcs = all_data_containers(&h).await;
    assert_eq!(dcs.len(), 1);
    let dc = &dcs[0];
    assert_eq!(dc.state, State::Waiting.index());
    assert_eq!(dc.cluster_node.as_deref(), Some("node-1"));
    assert_eq!(ac.data_container_ids, vec![Some(dc.id.clone())]);

    let engine = &h.engines["node-1"];
    assert!(engine.container(&dc.id).unwrap().running);
    assert!(!engine.container(&ac.id).unwrap().running);

    // Data container handshake answers with the files it must serve
    let response = h
        .dispatcher
        .data_container_callback(callback(&dc.callback_key, 0, &dc.id, 3))
        .await
        .unwrap();
    assert_eq!(response["num_workers"], 4);
    assert_eq!(
        response["input_file_keys"][0],
        serde_json::json!(dc.input_file_keys[0])
    );

    // Ready: files are served now
    h.dispatcher
        .data_container_callback(callback(&dc.callback_key, 1, &dc.id, 3))
        .await
        .unwrap();

    h.worker.run_data_container_tick().await;

    let ac = containers_for_task(&h, &task_id).await.remove(0);
    assert_eq!(ac.state, State::Processing.index());
    assert!(h.engines["node-1"].container(&ac.id).unwrap().running);

    // Application handshake points at the cache by container name
    let response = h
        .dispatcher
        .application_container_callback(callback(&ac.callback_key, 0, &ac.id, 3))
        .await
        .unwrap();
    let url = response["input_files"][0]["connector_access"]["url"]
        .as_str()
        .unwrap();
    assert_eq!(url, format!("http://{}/{}", dc.id, dc.input_file_keys[0]));

    for callback_type in [1, 2, 3] {
        h.dispatcher
            .application_container_callback(callback(&ac.callback_key, callback_type, &ac.id, 3))
            .await
            .unwrap();
    }

    let task = get_task(&h, &task_id).await;
    assert_eq!(task.state, State::Success.index());
    let ac = containers_for_task(&h, &task_id).await.remove(0);
    assert_eq!(ac.state, State::Success.index());

    // With no dependents left the cache is retired
    h.worker.run_data_container_tick().await;
    let dc = all_data_containers(&h).await.remove(0);
    assert_eq!(dc.state, State::Success.index());
    assert!(h.engines["node-1"].container(&dc.id).is_none());

    h.state_machine.update_task_groups().await.unwrap();
    let group: TaskGroup = {
        let conn = h.db.lock().await;
        database::require(&conn, &task.task_group_id).unwrap()
    };
    assert_eq!(group.state, State::Success.index());
}

#[tokio::test]
async fn s2_cache_reuse_across_tasks() {
    let h = harness(&[("node-1", 4096)], 3).await;
    let file = input_file("http://files/shared.csv");
    let task_a = submit_task(&h, 512, vec![file.clone()], false).await;
    let task_b = submit_task(&h, 512, vec![file], false).await;

    h.worker.run_scheduling_tick().await;

    let dcs = all_data_containers(&h).await;
    assert_eq!(dcs.len(), 1, "identical input files must share one cache");
    let dc_id = dcs[0].id.clone();

    let ac_a = containers_for_task(&h, &task_a).await.remove(0);
    let ac_b = containers_for_task(&h, &task_b).await.remove(0);
    assert_eq!(ac_a.data_container_ids, vec![Some(dc_id.clone())]);
    assert_eq!(ac_b.data_container_ids, vec![Some(dc_id)]);

    // Reserved RAM on the node never exceeds its capacity
    let conn = h.db.lock().await;
    let reserved: u64 = database::find_not_in_states::<ApplicationContainer>(&conn, &flotilla::states::end_states())
        .unwrap()
        .iter()
        .map(|ac| ac.container_ram)
        .chain(
            database::find_not_in_states::<DataContainer>(&conn, &flotilla::states::end_states())
                .unwrap()
                .iter()
                .map(|dc| dc.container_ram),
        )
        .sum();
    assert!(reserved <= 4096);
}

#[tokio::test]
async fn s3_task_too_large_for_cluster() {
    let h = harness(&[("node-1", 1024)], 3).await;
    let task_id = submit_task(&h, 2048, vec![], false).await;

    h.worker.run_scheduling_tick().await;

    let task = get_task(&h, &task_id).await;
    assert_eq!(task.state, State::Failed.index());
    let last = task.transitions.last().unwrap();
    assert_eq!(last.description, "Task is too large for cluster.");

    let states: Vec<i64> = task.transitions.iter().map(|t| t.state).collect();
    assert_eq!(states, vec![0, 1, 4]);

    assert!(containers_for_task(&h, &task_id).await.is_empty());
}

#[tokio::test]
async fn s4_failed_container_triggers_task_retry() {
    let h = harness(&[("node-1", 4096)], 2).await;
    let task_id = submit_task(&h, 512, vec![], true).await;

    h.worker.run_scheduling_tick().await;

    let first = containers_for_task(&h, &task_id).await.remove(0);
    assert_eq!(first.state, State::Processing.index());

    // Worker reports failure in its first callback
    let err = h
        .dispatcher
        .application_container_callback(callback(&first.callback_key, 0, &first.id, 4))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Container failed"));

    let task = get_task(&h, &task_id).await;
    assert_eq!(task.state, State::Waiting.index(), "first failure retries");
    assert_eq!(task.trials, 1);

    h.worker.run_scheduling_tick().await;

    let acs = containers_for_task(&h, &task_id).await;
    assert_eq!(acs.len(), 2, "retry yields a fresh application container");
    let second = acs.into_iter().find(|ac| ac.id != first.id).unwrap();
    assert_eq!(second.state, State::Processing.index());

    // Exactly one non-terminal container per task at any time
    let conn = h.db.lock().await;
    let open = database::find_not_in_states::<ApplicationContainer>(&conn, &flotilla::states::end_states())
        .unwrap()
        .into_iter()
        .filter(|ac| ac.task_id == task_id)
        .count();
    assert_eq!(open, 1);
    drop(conn);

    // Second failure exhausts the trials
    let err = h
        .dispatcher
        .application_container_callback(callback(&second.callback_key, 0, &second.id, 4))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Container failed"));

    let task = get_task(&h, &task_id).await;
    assert_eq!(task.state, State::Failed.index());
}

#[tokio::test]
async fn s5_dead_node_is_avoided_until_revival() {
    let h = harness(&[("node-a", 4096), ("node-b", 4096)], 3).await;

    *h.engines["node-a"].inspect_exit_code.lock() = 1;
    h.inspector.update_node("node-a").await;

    assert_eq!(dead_node_names(&h).await, vec!["node-a"]);

    let task_id = submit_task(&h, 512, vec![], true).await;
    h.worker.run_scheduling_tick().await;

    let ac = containers_for_task(&h, &task_id).await.remove(0);
    assert_eq!(
        ac.cluster_node.as_deref(),
        Some("node-b"),
        "a dead node must not receive containers"
    );

    // Recovery: the next inspection brings the node back
    *h.engines["node-a"].inspect_exit_code.lock() = 0;
    h.inspector.update_node("node-a").await;

    assert!(dead_node_names(&h).await.is_empty());
    let conn = h.db.lock().await;
    let record = database::get_node(&conn, "node-a").unwrap().unwrap();
    assert!(record.is_online);
    drop(conn);

    // node-a is eligible again; spread now prefers the emptier node
    let second_task = submit_task(&h, 512, vec![], true).await;
    h.worker.run_scheduling_tick().await;
    let second_ac = containers_for_task(&h, &second_task).await.remove(0);
    assert_eq!(second_ac.cluster_node.as_deref(), Some("node-a"));
}

#[tokio::test]
async fn s6_out_of_order_callback_fails_container() {
    let h = harness(&[("node-1", 4096)], 1).await;
    let task_id = submit_task(&h, 512, vec![], true).await;

    h.worker.run_scheduling_tick().await;
    let ac = containers_for_task(&h, &task_id).await.remove(0);

    // Type 1 before type 0
    h.dispatcher
        .application_container_callback(callback(&ac.callback_key, 1, &ac.id, 3))
        .await
        .unwrap_err();

    let ac = containers_for_task(&h, &task_id).await.remove(0);
    assert_eq!(ac.state, State::Failed.index());
    let last_failure = ac
        .transitions
        .iter()
        .find(|t| t.state == State::Failed.index())
        .unwrap();
    assert_eq!(
        last_failure.description,
        "Callback with invalid callback_type has been sent."
    );

    let task = get_task(&h, &task_id).await;
    assert_eq!(task.state, State::Failed.index());
}

#[tokio::test]
async fn replayed_callback_fails_container() {
    let h = harness(&[("node-1", 4096)], 1).await;
    submit_task(&h, 512, vec![input_file("http://files/data.csv")], false).await;

    h.worker.run_scheduling_tick().await;
    let dc = all_data_containers(&h).await.remove(0);

    h.dispatcher
        .data_container_callback(callback(&dc.callback_key, 0, &dc.id, 3))
        .await
        .unwrap();
    h.dispatcher
        .data_container_callback(callback(&dc.callback_key, 1, &dc.id, 3))
        .await
        .unwrap();

    // Same callback again: the strict sequence rejects the replay
    h.dispatcher
        .data_container_callback(callback(&dc.callback_key, 1, &dc.id, 3))
        .await
        .unwrap_err();

    let dc = all_data_containers(&h).await.remove(0);
    assert_eq!(dc.state, State::Failed.index());

    // Ordered prefix of the log still satisfies the position invariant
    for (position, raw) in dc.callbacks.iter().take(2).enumerate() {
        assert_eq!(raw["callback_type"], position as i64);
    }
}

#[tokio::test]
async fn wrong_callback_key_is_unauthorized() {
    let h = harness(&[("node-1", 4096)], 1).await;
    let task_id = submit_task(&h, 512, vec![], true).await;

    h.worker.run_scheduling_tick().await;
    let ac = containers_for_task(&h, &task_id).await.remove(0);

    let err = h
        .dispatcher
        .application_container_callback(callback("not-the-key", 0, &ac.id, 3))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        flotilla::callback::CallbackError::Unauthorized
    ));

    // No state change and no callback recorded
    let ac = containers_for_task(&h, &task_id).await.remove(0);
    assert!(ac.callbacks.is_empty());
    assert_eq!(ac.state, State::Processing.index());
}

#[tokio::test]
async fn janitor_fails_vanished_containers() {
    let h = harness(&[("node-1", 4096)], 1).await;
    let task_id = submit_task(&h, 512, vec![], true).await;

    h.worker.run_scheduling_tick().await;
    let ac = containers_for_task(&h, &task_id).await.remove(0);
    assert_eq!(ac.state, State::Processing.index());

    h.engines["node-1"].drop_container(&ac.id);
    h.worker.run_scheduling_tick().await;

    let ac = containers_for_task(&h, &task_id).await.remove(0);
    assert_eq!(ac.state, State::Failed.index());
    let vanished = ac
        .transitions
        .iter()
        .any(|t| t.description == "Container vanished.");
    assert!(vanished);

    let task = get_task(&h, &task_id).await;
    assert_eq!(task.state, State::Failed.index());
}

#[tokio::test]
async fn janitor_fails_unexpected_exits_with_logs() {
    let h = harness(&[("node-1", 4096)], 1).await;
    let task_id = submit_task(&h, 512, vec![], true).await;

    h.worker.run_scheduling_tick().await;
    let ac = containers_for_task(&h, &task_id).await.remove(0);

    h.engines["node-1"].set_exited(&ac.id, 137);
    h.worker.run_scheduling_tick().await;

    let ac = containers_for_task(&h, &task_id).await.remove(0);
    assert_eq!(ac.state, State::Failed.index());
    let failure = ac
        .transitions
        .iter()
        .find(|t| t.state == State::Failed.index())
        .unwrap();
    assert!(failure.description.contains("exited unexpectedly"));
    assert!(failure.description.contains("fake container logs"));

    // The engine side is cleaned up
    assert!(h.engines["node-1"].container(&ac.id).is_none());
    let task = get_task(&h, &task_id).await;
    assert_eq!(task.state, State::Failed.index());
}

#[tokio::test]
async fn cancelled_task_is_removed_on_reconcile() {
    let h = harness(&[("node-1", 4096)], 3).await;
    let task_id = submit_task(&h, 512, vec![], true).await;

    h.worker.run_scheduling_tick().await;
    let ac = containers_for_task(&h, &task_id).await.remove(0);
    assert!(h.engines["node-1"].container(&ac.id).is_some());

    h.state_machine
        .transition(
            flotilla::state_machine::Collection::Tasks,
            &task_id,
            State::Cancelled,
            "Task cancelled.",
            None,
        )
        .await
        .unwrap();

    let ac = containers_for_task(&h, &task_id).await.remove(0);
    assert_eq!(ac.state, State::Cancelled.index());

    // Cancellation is terminal: the janitor removes the engine container
    h.worker.run_scheduling_tick().await;
    assert!(h.engines["node-1"].container(&ac.id).is_none());

    // A second cancel call changes nothing
    h.state_machine
        .transition(
            flotilla::state_machine::Collection::Tasks,
            &task_id,
            State::Cancelled,
            "Task cancelled.",
            None,
        )
        .await
        .unwrap();
    let task = get_task(&h, &task_id).await;
    let cancellations = task
        .transitions
        .iter()
        .filter(|t| t.state == State::Cancelled.index())
        .count();
    assert_eq!(cancellations, 1);
}

#[tokio::test]
async fn terminal_documents_hold_no_secrets() {
    let h = harness(&[("node-1", 4096)], 1).await;
    let task_id = submit_task(&h, 512, vec![input_file("http://files/data.csv")], false).await;

    h.worker.run_scheduling_tick().await;
    let dc = all_data_containers(&h).await.remove(0);

    // Cache failure cascades to the application container and the task
    h.state_machine
        .transition(
            flotilla::state_machine::Collection::DataContainers,
            &dc.id,
            State::Failed,
            "Image pull failed.",
            None,
        )
        .await
        .unwrap();

    let dc = all_data_containers(&h).await.remove(0);
    assert_eq!(dc.callback_key, "**********");
    assert!(dc.input_file_keys.iter().all(|key| key == "**********"));

    let ac = containers_for_task(&h, &task_id).await.remove(0);
    assert_eq!(ac.state, State::Failed.index());
    assert_eq!(ac.callback_key, "**********");
}
