use std::time::Duration;

/// Default snapshot endpoint.
pub const DEFAULT_CHECKOUT_PATH: &str = "https://bsky.social/xrpc/com.atproto.sync.getRepo";

/// Configurable options for the backfill engine.
#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// Instance name, used to build the user-agent
    /// (`atproto-backfill-<name>/0.0.1`).
    pub instance_name: String,

    /// Maximum concurrent snapshot imports.
    pub parallel_backfills: usize,

    /// Per-import record-worker fanout.
    pub parallel_record_creates: usize,

    /// Collection prefix filter; empty matches every record.
    pub nsid_filter: String,

    /// Global snapshot-fetch rate cap, shared by all imports.
    pub sync_requests_per_second: u32,

    /// Snapshot endpoint. `?did=<repo>[&since=<rev>]` is appended per fetch.
    pub checkout_path: String,

    /// Overall timeout for one snapshot request.
    pub request_timeout: Duration,

    /// Optional opaque auth header sent with every snapshot fetch.
    pub magic_header: Option<(String, String)>,

    /// When true (the default), record bytes for live events are resolved
    /// straight from the commit's block section by CID. When false, they are
    /// re-derived by decoding the block section as a checkout and walking to
    /// the record path.
    pub trust_event_cids: bool,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            instance_name: "backfill".to_owned(),
            parallel_backfills: 10,
            parallel_record_creates: 100,
            nsid_filter: String::new(),
            sync_requests_per_second: 2,
            checkout_path: DEFAULT_CHECKOUT_PATH.to_owned(),
            request_timeout: Duration::from_secs(600),
            magic_header: None,
            trust_event_cids: true,
        }
    }
}

impl BackfillConfig {
    pub fn user_agent(&self) -> String {
        format!("atproto-backfill-{}/0.0.1", self.instance_name)
    }
}
