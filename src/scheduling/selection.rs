//! Task selection strategies

use rusqlite::Connection;

use crate::database::{self, DatabaseResult};
use crate::types::Task;

/// Orders the waiting tasks a scheduling pass will consider.
///
/// Documents may leave the waiting state while a pass is running; the
/// scheduler re-checks each task's state on use.
pub trait TaskSelector: Send + Sync {
    fn select(&self, conn: &Connection) -> DatabaseResult<Vec<Task>>;
}

/// First in, first out by task creation time.
pub struct Fifo;

impl TaskSelector for Fifo {
    fn select(&self, conn: &Connection) -> DatabaseResult<Vec<Task>> {
        database::waiting_tasks(conn)
    }
}
