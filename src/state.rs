//! Process-wide shared state: the store client, the HTTP client, the
//! write-intent sender, and parsed configuration, constructed once at
//! startup and handed explicitly to every handler and background
//! worker rather than kept in module-level mutables.

use std::sync::Arc;

use crate::config::Config;
use crate::store::CacheStore;
use crate::upstream::Fetcher;
use crate::writer::WriteSender;

pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn CacheStore>,
    pub fetcher: Fetcher,
    pub write_tx: WriteSender,
}

pub type SharedState = Arc<AppState>;
