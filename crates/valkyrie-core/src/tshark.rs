// ── Wireshark tooling ──
//
// Thin async wrappers around the wireshark command-line tools:
// text2pcap turns the capture hex dump into a pcap file, tshark
// extracts fields from it. Both are external processes; nothing here
// parses pcap itself.

use std::path::{Path, PathBuf};
use std::process::Output;

use indexmap::IndexMap;
use tracing::debug;

use crate::error::CoreError;

/// Separator tshark uses to join multiple values of one field within
/// a single packet (`-E aggregator=`).
pub const FIELD_AGGREGATOR: char = '~';

/// Locator for the wireshark command-line tools.
#[derive(Debug, Default)]
pub struct Tshark {
    ws_path: Option<PathBuf>,
}

impl Tshark {
    /// `ws_path` is the wireshark installation folder; `None` resolves
    /// the tools through `PATH`.
    pub fn new(ws_path: Option<&Path>) -> Self {
        Self {
            ws_path: ws_path.map(Path::to_path_buf),
        }
    }

    fn tool_path(&self, tool: &str) -> PathBuf {
        let file = if cfg!(windows) {
            format!("{tool}.exe")
        } else {
            tool.to_owned()
        };
        match &self.ws_path {
            Some(dir) => dir.join(file),
            None => PathBuf::from(file),
        }
    }

    /// Convert a hex-dump text file to a pcap file with text2pcap.
    pub async fn text_to_pcap(&self, text_file: &Path, pcap_file: &Path) -> Result<(), CoreError> {
        let tool = self.tool_path("text2pcap");
        debug!(tool = %tool.display(), text = %text_file.display(), pcap = %pcap_file.display(),
               "converting capture text to pcap");
        let output = tokio::process::Command::new(&tool)
            .arg(text_file)
            .arg(pcap_file)
            .output()
            .await
            .map_err(|e| tool_error("text2pcap", &e.to_string()))?;
        check_status("text2pcap", &output)
    }

    /// Run tshark over a pcap file and collect the requested fields,
    /// one map per packet.
    pub async fn analyze(
        &self,
        pcap_file: &Path,
        analyzer: &TsharkAnalyzer,
    ) -> Result<Vec<IndexMap<String, Vec<String>>>, CoreError> {
        let tool = self.tool_path("tshark");
        let output = tokio::process::Command::new(&tool)
            .args(analyzer.args(pcap_file))
            .output()
            .await
            .map_err(|e| tool_error("tshark", &e.to_string()))?;
        check_status("tshark", &output)?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(analyzer.parse_output(&stdout))
    }
}

/// Field-extraction request for [`Tshark::analyze`]: an optional
/// display filter plus the fields to pull out of each packet.
#[derive(Debug, Default)]
pub struct TsharkAnalyzer {
    read_filter: Option<String>,
    fields: Vec<String>,
}

impl TsharkAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_read_filter(&mut self, read_filter: impl Into<String>) {
        self.read_filter = Some(read_filter.into());
    }

    pub fn add_field(&mut self, field: impl Into<String>) {
        self.fields.push(field.into());
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    fn args(&self, pcap_file: &Path) -> Vec<String> {
        let mut args = vec!["-r".to_owned(), pcap_file.display().to_string()];
        if let Some(filter) = &self.read_filter {
            args.push("-Y".to_owned());
            args.push(filter.clone());
        }
        if !self.fields.is_empty() {
            args.push("-T".to_owned());
            args.push("fields".to_owned());
            for field in &self.fields {
                args.push("-e".to_owned());
                args.push(field.clone());
                args.push("-E".to_owned());
                args.push(format!("aggregator={FIELD_AGGREGATOR}"));
            }
        }
        args
    }

    /// Parse tshark `-T fields` output: one tab-separated line per
    /// packet, aggregated values split on [`FIELD_AGGREGATOR`].
    fn parse_output(&self, stdout: &str) -> Vec<IndexMap<String, Vec<String>>> {
        let mut packets = Vec::new();
        for line in stdout.lines() {
            let mut values = line.split('\t');
            let mut packet = IndexMap::new();
            for field in &self.fields {
                let value = values.next().unwrap_or("");
                packet.insert(
                    field.clone(),
                    value
                        .split(FIELD_AGGREGATOR)
                        .map(str::to_owned)
                        .collect::<Vec<_>>(),
                );
            }
            packets.push(packet);
        }
        packets
    }
}

fn tool_error(tool: &str, message: &str) -> CoreError {
    CoreError::ExternalTool {
        tool: tool.to_owned(),
        message: message.to_owned(),
    }
}

fn check_status(tool: &str, output: &Output) -> Result<(), CoreError> {
    if output.status.success() {
        Ok(())
    } else {
        Err(tool_error(
            tool,
            String::from_utf8_lossy(&output.stderr).trim(),
        ))
    }
}
