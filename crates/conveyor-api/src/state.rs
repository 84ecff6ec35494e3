use std::sync::Arc;

use conveyor_beat::Beat;
use conveyor_core::Conveyor;
use conveyor_db::Database;

#[derive(Clone)]
pub struct ApiState {
    pub conveyor: Conveyor,
    pub db: Option<Arc<Database>>,
    /// Configured schedules, for display only; the beat service fires them.
    pub beat: Arc<Beat>,
}
