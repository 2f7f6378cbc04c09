// ── Ports, tplds and filters ──
//
// A port owns the stream/filter/tpld collections and the capture
// buffer. Stream and filter collections are discovered lazily from
// the device and then cached; tplds are dynamic on the receive side
// and are re-read on every access.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::warn;

use valkyrie_api::SharedConnection;

use crate::alloc::TpldAllocator;
use crate::capture::Capture;
use crate::error::CoreError;
use crate::object::{unquote, ResourceNode};
use crate::stream::{Stream, StreamState};

/// Info/config dump commands used by [`Port::inventory`].
pub const INFO_CONFIG_COMMANDS: &[&str] =
    &["p_info", "p_config", "p_receivesync", "ps_indices", "pr_tplds"];

/// Port-level counter groups and their caption labels, in reporting
/// order.
pub const PORT_STATS_GROUPS: &[(&str, &[&str])] = &[
    (
        "pr_pfcstats",
        &[
            "total", "CoS 0", "CoS 1", "CoS 2", "CoS 3", "CoS 4", "CoS 5", "CoS 6", "CoS 7",
        ],
    ),
    ("pr_total", &["bps", "pps", "bytes", "packets"]),
    ("pr_notpld", &["bps", "pps", "bytes", "packets"]),
    (
        "pr_extra",
        &[
            "fcserrors",
            "pauseframes",
            "arprequests",
            "arpreplies",
            "pingrequests",
            "pingreplies",
            "gapcount",
            "gapduration",
        ],
    ),
    ("pt_total", &["bps", "pps", "bytes", "packets"]),
    (
        "pt_extra",
        &[
            "arprequests",
            "arpreplies",
            "pingrequests",
            "pingreplies",
            "injectedfcs",
            "injectedseq",
            "injectedmis",
            "injectedint",
            "injectedtid",
            "training",
        ],
    ),
    ("pt_notpld", &["bps", "pps", "bytes", "packets"]),
];

/// Tpld counter groups (`pr_tpld*`).
pub const TPLD_STATS_GROUPS: &[(&str, &[&str])] = &[
    ("pr_tpldtraffic", &["bps", "pps", "byt", "pac"]),
    ("pr_tplderrors", &["dummy", "seq", "mis", "pld"]),
    (
        "pr_tpldlatency",
        &["min", "avg", "max", "avg1sec", "min1sec", "max1sec"],
    ),
    (
        "pr_tpldjitter",
        &["min", "avg", "max", "avg1sec", "min1sec", "max1sec"],
    ),
];

/// Filter RX counter captions (`pr_filter`).
pub const FILTER_STATS_CAPTIONS: &[&str] = &["bps", "pps", "bytes", "packets"];

/// One chassis port, indexed `module/port`.
#[derive(Debug)]
pub struct Port {
    node: ResourceNode,
    tpld_alloc: Arc<TpldAllocator>,
    streams: BTreeMap<u32, Stream>,
    filters: BTreeMap<u32, Filter>,
    tplds: BTreeMap<u32, Tpld>,
    capture: Option<Capture>,
    info: Option<IndexMap<String, String>>,
}

impl Port {
    /// Build a port handle for `index` (`"module/port"`, both
    /// zero-based). The tpld allocator is shared across every port of
    /// the session.
    pub fn new(
        conn: SharedConnection,
        index: &str,
        tpld_alloc: Arc<TpldAllocator>,
    ) -> Result<Self, CoreError> {
        let obj_ref = match index.split_once('/') {
            Some((module, port)) => format!("module/{module}/port/{port}"),
            None => {
                return Err(CoreError::BadIndex {
                    index: index.to_owned(),
                })
            }
        };
        let node = ResourceNode::new(conn, index, obj_ref)?;
        Ok(Self {
            node,
            tpld_alloc,
            streams: BTreeMap::new(),
            filters: BTreeMap::new(),
            tplds: BTreeMap::new(),
            capture: None,
            info: None,
        })
    }

    pub fn index(&self) -> &str {
        self.node.index()
    }

    pub fn name(&self) -> &str {
        self.node.name()
    }

    pub fn node(&self) -> &ResourceNode {
        &self.node
    }

    /// Dump and cache the port info/config attributes.
    pub async fn inventory(&mut self) -> Result<&IndexMap<String, String>, CoreError> {
        let attributes = self.node.get_attributes(INFO_CONFIG_COMMANDS).await?;
        Ok(self.info.insert(attributes))
    }

    /// Attributes collected by the last [`Port::inventory`] call.
    pub fn info(&self) -> Option<&IndexMap<String, String>> {
        self.info.as_ref()
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Reset port parameters to standard values and delete all
    /// streams, filters and capture definitions. Local caches are
    /// dropped with the device-side objects.
    pub async fn reset(&mut self) -> Result<(), CoreError> {
        self.streams.clear();
        self.filters.clear();
        self.tplds.clear();
        self.capture = None;
        self.node.send_command("p_reset", &[]).await
    }

    /// Wait until the port receiver reports `IN_SYNC`.
    pub async fn wait_for_up(&self, timeout_secs: u64) -> Result<(), CoreError> {
        self.node
            .wait_for_states("p_receivesync", timeout_secs, &["IN_SYNC"])
            .await
    }

    // ── Traffic and capture ──────────────────────────────────────────

    pub async fn start_traffic(&self) -> Result<(), CoreError> {
        self.node.set_attribute("p_traffic", "on").await
    }

    pub async fn stop_traffic(&self) -> Result<(), CoreError> {
        self.node.set_attribute("p_traffic", "off").await
    }

    /// Start capture. Any previously fetched capture buffer is stale
    /// from this point on and is dropped.
    pub async fn start_capture(&mut self) -> Result<(), CoreError> {
        self.capture = None;
        self.node.set_attribute("p_capture", "on").await
    }

    pub async fn stop_capture(&self) -> Result<(), CoreError> {
        self.node.set_attribute("p_capture", "off").await
    }

    /// The port's capture buffer handle.
    pub fn capture(&mut self) -> Result<&mut Capture, CoreError> {
        match &mut self.capture {
            Some(capture) => Ok(capture),
            slot @ None => {
                let capture = Capture::new(
                    self.node.connection().clone(),
                    self.node.index(),
                    self.node.obj_ref(),
                )?;
                Ok(slot.insert(capture))
            }
        }
    }

    // ── Statistics ───────────────────────────────────────────────────

    /// Clear all TX and RX counters.
    pub async fn clear_stats(&self) -> Result<(), CoreError> {
        self.node.send_command("pt_clear", &[]).await?;
        self.node.send_command("pr_clear", &[]).await
    }

    /// All port-level counter groups, `group -> caption -> value`.
    pub async fn read_port_stats(
        &self,
    ) -> Result<IndexMap<String, IndexMap<String, i64>>, CoreError> {
        let mut groups = IndexMap::new();
        for (stat_name, captions) in PORT_STATS_GROUPS {
            let stats = self.node.read_stat(captions, stat_name).await?;
            groups.insert((*stat_name).to_owned(), stats);
        }
        Ok(groups)
    }

    /// TX counters of every stream, `stream id -> caption -> value`.
    pub async fn read_stream_stats(
        &mut self,
    ) -> Result<IndexMap<u32, IndexMap<String, i64>>, CoreError> {
        self.ensure_streams().await?;
        let mut stats = IndexMap::new();
        for (sid, stream) in &self.streams {
            stats.insert(*sid, stream.read_stats().await?);
        }
        Ok(stats)
    }

    /// RX counters of every tpld currently seen by the port,
    /// `tpld id -> group -> caption -> value`.
    pub async fn read_tpld_stats(
        &mut self,
    ) -> Result<IndexMap<u32, IndexMap<String, IndexMap<String, i64>>>, CoreError> {
        self.tplds().await?;
        let mut stats = IndexMap::new();
        for (tid, tpld) in &self.tplds {
            stats.insert(*tid, tpld.read_stats().await?);
        }
        Ok(stats)
    }

    /// RX counters of every filter, `filter id -> caption -> value`.
    pub async fn read_filter_stats(
        &mut self,
    ) -> Result<IndexMap<u32, IndexMap<String, i64>>, CoreError> {
        self.ensure_filters().await?;
        let mut stats = IndexMap::new();
        for (fid, filter) in &self.filters {
            stats.insert(*fid, filter.read_stats().await?);
        }
        Ok(stats)
    }

    // ── Streams ──────────────────────────────────────────────────────

    /// Cached stream collection. Populated by `ensure_streams`.
    pub fn streams(&self) -> &BTreeMap<u32, Stream> {
        &self.streams
    }

    pub fn stream_mut(&mut self, sid: u32) -> Option<&mut Stream> {
        self.streams.get_mut(&sid)
    }

    /// Discover the port's streams if the cache is empty. Stream names
    /// are seeded from `ps_comment` and every tpld id in use is
    /// recorded with the allocator so it is never handed out again.
    pub async fn ensure_streams(&mut self) -> Result<&BTreeMap<u32, Stream>, CoreError> {
        if self.streams.is_empty() {
            let indices = self.node.get_attribute("ps_indices").await?;
            for token in indices.split_whitespace() {
                let sid: u32 = token.parse().map_err(|_| CoreError::BadReply {
                    command: "ps_indices".to_owned(),
                    reply: indices.clone(),
                })?;
                let index = format!("{}/{sid}", self.node.index());
                let mut stream =
                    Stream::new(self.node.connection().clone(), &index, self.node.obj_ref())?;

                let comment = stream.node.get_attribute("ps_comment").await?;
                let name = unquote(&comment);
                if !name.is_empty() {
                    stream.node.set_name(name);
                }

                let tpld = stream.node.get_attribute("ps_tpldid").await?;
                // -1 means payload tracking is off for this stream.
                if let Ok(id) = tpld.trim().parse::<i64>() {
                    if id >= 0 {
                        self.tpld_alloc.observe(id as u32);
                    }
                }

                self.streams.insert(sid, stream);
            }
        }
        Ok(&self.streams)
    }

    /// Create a stream on the device and cache it. The new stream id
    /// is one past the highest existing id. The tpld id comes from the
    /// session allocator unless an explicit one is given.
    pub async fn add_stream(
        &mut self,
        name: Option<&str>,
        tpld_id: Option<u32>,
        state: StreamState,
    ) -> Result<&mut Stream, CoreError> {
        self.ensure_streams().await?;
        let sid = self
            .streams
            .keys()
            .next_back()
            .map_or(0, |highest| highest + 1);

        let index = format!("{}/{sid}", self.node.index());
        let mut stream =
            Stream::new(self.node.connection().clone(), &index, self.node.obj_ref())?;
        stream.create().await?;

        if let Some(name) = name {
            stream
                .node
                .set_attribute("ps_comment", &format!("\"{name}\""))
                .await?;
            stream.node.set_name(name);
        }

        let tpld = self.tpld_alloc.allocate(tpld_id);
        stream
            .node
            .set_attribute("ps_tpldid", &tpld.to_string())
            .await?;
        stream.set_state(state).await?;

        Ok(self.streams.entry(sid).or_insert(stream))
    }

    /// Delete a stream on the device and evict it from the cache. Its
    /// tpld id stays retired.
    pub async fn remove_stream(&mut self, sid: u32) -> Result<(), CoreError> {
        self.ensure_streams().await?;
        let stream = self.streams.get(&sid).ok_or_else(|| CoreError::NotFound {
            entity: "stream",
            id: sid.to_string(),
        })?;
        stream.delete().await?;
        self.streams.remove(&sid);
        Ok(())
    }

    // ── Filters ──────────────────────────────────────────────────────

    pub fn filters(&self) -> &BTreeMap<u32, Filter> {
        &self.filters
    }

    /// Discover the port's filters if the cache is empty.
    pub async fn ensure_filters(&mut self) -> Result<&BTreeMap<u32, Filter>, CoreError> {
        if self.filters.is_empty() {
            let indices = self.node.get_attribute("pf_indices").await?;
            for token in indices.split_whitespace() {
                let fid: u32 = token.parse().map_err(|_| CoreError::BadReply {
                    command: "pf_indices".to_owned(),
                    reply: indices.clone(),
                })?;
                let index = format!("{}/{fid}", self.node.index());
                let mut filter =
                    Filter::new(self.node.connection().clone(), &index, self.node.obj_ref())?;

                let comment = filter.node.get_attribute("pf_comment").await?;
                let name = unquote(&comment);
                if !name.is_empty() {
                    filter.node.set_name(name);
                }

                self.filters.insert(fid, filter);
            }
        }
        Ok(&self.filters)
    }

    /// Create a filter with the given condition expression.
    pub async fn add_filter(
        &mut self,
        condition: &str,
        enabled: bool,
    ) -> Result<&mut Filter, CoreError> {
        self.ensure_filters().await?;
        let fid = self
            .filters
            .keys()
            .next_back()
            .map_or(0, |highest| highest + 1);

        let index = format!("{}/{fid}", self.node.index());
        let filter =
            Filter::new(self.node.connection().clone(), &index, self.node.obj_ref())?;
        filter.node.send_command("pf_create", &[]).await?;
        filter.node.set_attribute("pf_condition", condition).await?;
        filter.set_state(enabled).await?;

        Ok(self.filters.entry(fid).or_insert(filter))
    }

    pub async fn remove_filter(&mut self, fid: u32) -> Result<(), CoreError> {
        self.ensure_filters().await?;
        let filter = self.filters.get(&fid).ok_or_else(|| CoreError::NotFound {
            entity: "filter",
            id: fid.to_string(),
        })?;
        filter.node.send_command("pf_delete", &[]).await?;
        self.filters.remove(&fid);
        Ok(())
    }

    /// Drop all filters at once by writing an empty index set.
    pub async fn clear_filters(&mut self) -> Result<(), CoreError> {
        self.node.send_command("pf_indices", &[]).await?;
        self.filters.clear();
        Ok(())
    }

    // ── Tplds ────────────────────────────────────────────────────────

    /// The tplds currently seen on the receive side. Tplds come and go
    /// with remote traffic, so the set is re-read from the device on
    /// every call.
    pub async fn tplds(&mut self) -> Result<&BTreeMap<u32, Tpld>, CoreError> {
        self.tplds.clear();
        let reply = self.node.get_attribute("pr_tplds").await?;
        for token in reply.split_whitespace() {
            let tid: u32 = token.parse().map_err(|_| CoreError::BadReply {
                command: "pr_tplds".to_owned(),
                reply: reply.clone(),
            })?;
            let index = format!("{}/{tid}", self.node.index());
            let tpld = Tpld::new(self.node.connection().clone(), &index, self.node.obj_ref())?;
            self.tplds.insert(tid, tpld);
        }
        Ok(&self.tplds)
    }

    // ── Config files ─────────────────────────────────────────────────

    /// Replay a port configuration file. Comment lines (`;` prefix)
    /// and blank lines are skipped. A command the chassis rejects is
    /// logged and skipped; transport failures abort the load.
    pub async fn load_config(&self, path: &Path) -> Result<(), CoreError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| CoreError::File {
                path: path.display().to_string(),
                source,
            })?;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') {
                continue;
            }
            let (command, args) = match line.split_once(char::is_whitespace) {
                Some((command, rest)) => (command, rest.trim_start()),
                None => (line, ""),
            };
            let result = if args.is_empty() {
                self.node.send_command(command, &[]).await
            } else {
                self.node.send_command(command, &[args]).await
            };
            match result {
                Ok(()) => {}
                Err(CoreError::Rejected { command, reply }) => {
                    warn!(%command, %reply, "config line rejected, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Save the full port configuration to a file the chassis can
    /// replay. The dump lines arrive with the echoed port address;
    /// the saved file carries bare commands.
    pub async fn save_config(&self, path: &Path) -> Result<(), CoreError> {
        let lines = self
            .node
            .send_command_return_multiline("p_fullconfig", &["?"])
            .await?;

        let mut content = format!(";Port: {}\n", self.node.index());
        content.push_str("P_RESET\n");
        for line in lines {
            if let Some((_, command)) = line.split_once(char::is_whitespace) {
                content.push_str(command.trim_start());
                content.push('\n');
            }
        }

        tokio::fs::write(path, content)
            .await
            .map_err(|source| CoreError::File {
                path: path.display().to_string(),
                source,
            })
    }
}

/// One payload-tracking entity observed on the receive side.
#[derive(Debug)]
pub struct Tpld {
    node: ResourceNode,
}

impl Tpld {
    fn new(conn: SharedConnection, index: &str, parent_ref: &str) -> Result<Self, CoreError> {
        let id_segment = index.rsplit('/').next().unwrap_or(index);
        let node = ResourceNode::new(conn, index, format!("{parent_ref}/tpld/{id_segment}"))?;
        Ok(Self { node })
    }

    pub fn id(&self) -> u32 {
        self.node.id().unwrap_or_default()
    }

    /// All tpld counter groups, `group -> caption -> value`.
    pub async fn read_stats(
        &self,
    ) -> Result<IndexMap<String, IndexMap<String, i64>>, CoreError> {
        let mut groups = IndexMap::new();
        for (stat_name, captions) in TPLD_STATS_GROUPS {
            let stats = self.node.read_stat(captions, stat_name).await?;
            groups.insert((*stat_name).to_owned(), stats);
        }
        Ok(groups)
    }
}

/// One RX filter (`pf_*` command group).
#[derive(Debug)]
pub struct Filter {
    node: ResourceNode,
}

impl Filter {
    fn new(conn: SharedConnection, index: &str, parent_ref: &str) -> Result<Self, CoreError> {
        let id_segment = index.rsplit('/').next().unwrap_or(index);
        let node = ResourceNode::new(conn, index, format!("{parent_ref}/filter/{id_segment}"))?;
        Ok(Self { node })
    }

    pub fn id(&self) -> u32 {
        self.node.id().unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        self.node.name()
    }

    pub fn node(&self) -> &ResourceNode {
        &self.node
    }

    pub async fn set_state(&self, enabled: bool) -> Result<(), CoreError> {
        let state = if enabled { "ON" } else { "OFF" };
        self.node.set_attribute("pf_enable", state).await
    }

    pub async fn set_condition(&self, condition: &str) -> Result<(), CoreError> {
        self.node.set_attribute("pf_condition", condition).await
    }

    /// Filter RX counters (`pr_filter`).
    pub async fn read_stats(&self) -> Result<IndexMap<String, i64>, CoreError> {
        self.node.read_stat(FILTER_STATS_CAPTIONS, "pr_filter").await
    }
}
