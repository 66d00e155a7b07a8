use std::time::Duration;

use server_api::ApiContext;
use shared::preferences::GroupingPreferences;
use tokio::sync::watch;

use crate::hub::HubHandle;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) hub: HubHandle,
    /// Current grouping preferences; the hub reads the latest value per event.
    pub(crate) grouping: watch::Sender<GroupingPreferences>,
    pub(crate) subscriber_buffer: usize,
    pub(crate) send_timeout: Duration,
}
